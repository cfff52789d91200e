//! Server network layer: WebSocket transport and the single-writer event loop.
//!
//! Each connection gets a reader task that parses frames into
//! [`ClientEvent`]s and a writer task that drains the connection's outbound
//! queue. Neither touches the session. All of that goes through one channel
//! into [`Server::run`], which owns the [`Gateway`] and interleaves client
//! commands, sequencer deadlines and the regeneration interval in arrival
//! order.

use crate::client_manager::Outbound;
use crate::config::ServerConfig;
use crate::gateway::Gateway;
use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::State;
use axum::response::Response;
use axum::routing::get;
use axum::Router;
use futures_util::{SinkExt, StreamExt};
use log::{debug, error, info, warn};
use shared::{ClientEvent, ConnectionId};
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio::sync::{mpsc, oneshot};
use tokio::time::{interval_at, sleep_until, Instant, MissedTickBehavior};
use tower_http::services::ServeDir;

pub type BoxError = Box<dyn std::error::Error + Send + Sync>;

/// Messages sent from connection tasks to the main server loop
#[derive(Debug)]
pub enum ServerMessage {
    Connected {
        sender: Outbound,
        reply: oneshot::Sender<Option<ConnectionId>>,
    },
    Command {
        id: ConnectionId,
        event: ClientEvent,
    },
    Malformed {
        id: ConnectionId,
        reason: String,
    },
    Disconnected {
        id: ConnectionId,
    },
    Shutdown,
}

/// Cloneable handle for stopping a running server.
#[derive(Debug, Clone)]
pub struct ServerHandle {
    server_tx: mpsc::UnboundedSender<ServerMessage>,
}

impl ServerHandle {
    pub fn shutdown(&self) {
        if self.server_tx.send(ServerMessage::Shutdown).is_err() {
            debug!("Server loop already stopped");
        }
    }
}

/// Shared with every WebSocket upgrade.
#[derive(Clone)]
struct ConnectionState {
    server_tx: mpsc::UnboundedSender<ServerMessage>,
    max_frame_bytes: usize,
}

/// Owns the listener, the gateway and the command channel.
pub struct Server {
    listener: Option<TcpListener>,
    local_addr: SocketAddr,
    gateway: Gateway,
    config: ServerConfig,

    server_tx: mpsc::UnboundedSender<ServerMessage>,
    server_rx: mpsc::UnboundedReceiver<ServerMessage>,
}

impl Server {
    pub async fn new(config: ServerConfig) -> Result<Self, BoxError> {
        let listener = TcpListener::bind(config.address()).await?;
        let local_addr = listener.local_addr()?;
        info!("Server listening on {}", local_addr);

        let (server_tx, server_rx) = mpsc::unbounded_channel();

        Ok(Server {
            listener: Some(listener),
            local_addr,
            gateway: Gateway::new(config.gateway.clone()),
            config,
            server_tx,
            server_rx,
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn handle(&self) -> ServerHandle {
        ServerHandle {
            server_tx: self.server_tx.clone(),
        }
    }

    fn router(&self) -> Router {
        let state = ConnectionState {
            server_tx: self.server_tx.clone(),
            max_frame_bytes: self.config.max_frame_bytes(),
        };

        Router::new()
            .route("/ws", get(ws_handler))
            .fallback_service(ServeDir::new(&self.config.assets_dir))
            .with_state(state)
    }

    /// Serves HTTP and runs the event loop until shut down.
    pub async fn run(&mut self) -> Result<(), BoxError> {
        let listener = self.listener.take().ok_or("server is already running")?;
        let app = self.router();
        let http = tokio::spawn(async move {
            if let Err(e) = axum::serve(listener, app).await {
                error!("HTTP server stopped: {}", e);
            }
        });

        let period = self.config.regen_interval;
        let mut regen = interval_at(Instant::now() + period, period);
        regen.set_missed_tick_behavior(MissedTickBehavior::Delay);

        info!("Server started successfully");

        loop {
            let deadline = self.gateway.next_deadline();

            tokio::select! {
                message = self.server_rx.recv() => {
                    match message {
                        Some(ServerMessage::Connected { sender, reply }) => {
                            let id = self.gateway.connect(sender);
                            if reply.send(id).is_err() {
                                debug!("Connection closed before it was registered");
                            }
                        }
                        Some(ServerMessage::Command { id, event }) => {
                            // Rejections are logged by the gateway.
                            let _ = self.gateway.handle(&id, event, Instant::now());
                        }
                        Some(ServerMessage::Malformed { id, reason }) => {
                            self.gateway.handle_malformed(&id, &reason);
                        }
                        Some(ServerMessage::Disconnected { id }) => {
                            self.gateway.disconnect(&id);
                        }
                        Some(ServerMessage::Shutdown) | None => {
                            info!("Server shutting down");
                            break;
                        }
                    }
                },

                _ = regen.tick() => {
                    self.gateway.regenerate();
                },

                _ = wait_until(deadline) => {
                    let fired = self.gateway.fire_due(Instant::now());
                    debug!("Sequencer fired {} step(s), {} in flight",
                           fired, self.gateway.sequencer().in_flight());
                },
            }
        }

        http.abort();
        Ok(())
    }
}

/// Sleeps until the next sequencer deadline, or forever when nothing is
/// scheduled.
async fn wait_until(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}

async fn ws_handler(ws: WebSocketUpgrade, State(state): State<ConnectionState>) -> Response {
    ws.max_message_size(state.max_frame_bytes)
        .on_upgrade(move |socket| handle_socket(socket, state))
}

/// Runs one connection until either side closes it.
async fn handle_socket(socket: WebSocket, state: ConnectionState) {
    let (mut ws_sender, mut ws_receiver) = socket.split();
    let (out_tx, mut out_rx) = mpsc::unbounded_channel::<Arc<str>>();
    let (reply_tx, reply_rx) = oneshot::channel();

    let registered = state.server_tx.send(ServerMessage::Connected {
        sender: out_tx,
        reply: reply_tx,
    });
    if registered.is_err() {
        error!("Server loop is gone, dropping connection");
        return;
    }

    let id = match reply_rx.await {
        Ok(Some(id)) => id,
        _ => {
            let _ = ws_sender.send(Message::Close(None)).await;
            return;
        }
    };

    let send_task = tokio::spawn(async move {
        while let Some(frame) = out_rx.recv().await {
            if ws_sender.send(Message::Text(frame.to_string())).await.is_err() {
                break;
            }
        }
    });

    while let Some(result) = ws_receiver.next().await {
        let message = match result {
            Ok(Message::Text(text)) => match serde_json::from_str::<ClientEvent>(&text) {
                Ok(event) => ServerMessage::Command {
                    id: id.clone(),
                    event,
                },
                Err(e) => ServerMessage::Malformed {
                    id: id.clone(),
                    reason: e.to_string(),
                },
            },
            Ok(Message::Close(_)) => break,
            Ok(_) => continue,
            Err(e) => {
                warn!("WebSocket error on {}: {}", id, e);
                break;
            }
        };

        if state.server_tx.send(message).is_err() {
            break;
        }
    }

    if state
        .server_tx
        .send(ServerMessage::Disconnected { id: id.clone() })
        .is_err()
    {
        debug!("Server loop stopped before {} disconnected", id);
    }
    send_task.abort();
}
