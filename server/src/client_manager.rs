//! Connection registry and snapshot fan-out.
//!
//! Every live WebSocket connection is registered here with an ephemeral
//! identity and the sending half of its outbound queue. The registry doubles
//! as the subscriber list for state broadcasts: an event is serialized once
//! and the same buffer is handed to every subscriber.

use log::{error, info, warn};
use rand::distributions::Alphanumeric;
use rand::Rng;
use shared::{ConnectionId, ServerEvent};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::mpsc;

/// Length of generated connection identities.
const ID_LENGTH: usize = 20;

/// Serialized frames queued for one connection's writer task.
pub type Outbound = mpsc::UnboundedSender<Arc<str>>;

/// A connected client and the queue its writer task drains.
#[derive(Debug)]
pub struct Client {
    pub id: ConnectionId,
    pub connected_at: Instant,
    sender: Outbound,
}

impl Client {
    pub fn new(id: ConnectionId, sender: Outbound) -> Self {
        Self {
            id,
            connected_at: Instant::now(),
            sender,
        }
    }

    /// Queues a frame. Fails only when the connection's writer has gone away.
    fn deliver(&self, frame: &Arc<str>) -> bool {
        self.sender.send(Arc::clone(frame)).is_ok()
    }
}

/// Owns all live connections and enforces the connection cap.
pub struct ClientManager {
    clients: HashMap<ConnectionId, Client>,
    max_clients: usize,
}

impl ClientManager {
    pub fn new(max_clients: usize) -> Self {
        Self {
            clients: HashMap::new(),
            max_clients,
        }
    }

    /// Registers a connection and returns its freshly generated identity, or
    /// `None` when the server is full.
    pub fn add_client(&mut self, sender: Outbound) -> Option<ConnectionId> {
        if self.clients.len() >= self.max_clients {
            warn!(
                "Refusing connection, {} of {} slots in use",
                self.clients.len(),
                self.max_clients
            );
            return None;
        }

        let id = self.generate_id();
        info!("Client {} connected", id);
        self.clients.insert(id.clone(), Client::new(id.clone(), sender));
        Some(id)
    }

    /// Returns true if the client was registered.
    pub fn remove_client(&mut self, id: &ConnectionId) -> bool {
        match self.clients.remove(id) {
            Some(client) => {
                info!(
                    "Client {} disconnected after {:.1}s",
                    client.id,
                    client.connected_at.elapsed().as_secs_f32()
                );
                true
            }
            None => false,
        }
    }

    pub fn contains(&self, id: &ConnectionId) -> bool {
        self.clients.contains_key(id)
    }

    /// Sends an event to a single connection.
    pub fn send_to(&self, id: &ConnectionId, event: &ServerEvent) -> bool {
        let Some(client) = self.clients.get(id) else {
            return false;
        };
        let Some(frame) = encode(event) else {
            return false;
        };
        if !client.deliver(&frame) {
            warn!("Outbound queue for {} is closed", id);
            return false;
        }
        true
    }

    /// Sends an event to every connection. Returns how many accepted it.
    pub fn publish(&self, event: &ServerEvent) -> usize {
        let Some(frame) = encode(event) else {
            return 0;
        };

        let mut delivered = 0;
        for client in self.clients.values() {
            if client.deliver(&frame) {
                delivered += 1;
            } else {
                warn!("Outbound queue for {} is closed", client.id);
            }
        }
        delivered
    }

    pub fn len(&self) -> usize {
        self.clients.len()
    }

    pub fn is_empty(&self) -> bool {
        self.clients.is_empty()
    }

    fn generate_id(&self) -> ConnectionId {
        let mut rng = rand::thread_rng();
        loop {
            let id: String = (&mut rng)
                .sample_iter(&Alphanumeric)
                .take(ID_LENGTH)
                .map(char::from)
                .collect();
            let id = ConnectionId::new(id);
            if !self.clients.contains_key(&id) {
                return id;
            }
        }
    }
}

fn encode(event: &ServerEvent) -> Option<Arc<str>> {
    match serde_json::to_string(event) {
        Ok(text) => Some(Arc::from(text)),
        Err(e) => {
            error!("Failed to serialize server event: {}", e);
            None
        }
    }
}
