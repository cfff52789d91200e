//! # Grid Combat Server Library
//!
//! Authoritative server for a browser-based tabletop combat grid. One shared
//! session holds the board, the tokens and the Dungeon Master's saved attack
//! patterns. Every connected browser receives the complete session snapshot
//! after each accepted change.
//!
//! ## Core Responsibilities
//!
//! ### Authoritative Session
//! The server owns the only copy of the session. Clients send intents
//! (join, move, launch a pattern) and render whatever snapshot comes back.
//! Nothing a client sends is applied without validation.
//!
//! ### Pattern Sequencing
//! Launched patterns play out on the server clock. Each square is announced
//! as a warning, becomes damaging one second later, counts hits on the
//! tokens standing in it once per second, and is finally cleared.
//!
//! ### State Broadcasting
//! Every accepted mutation, every sequencer step and every speed
//! regeneration tick is followed by a full `gameState` broadcast. Rejected
//! commands leave the session untouched and broadcast nothing.
//!
//! ## Architecture Design
//!
//! ### Single-Writer Event Loop
//! Connection tasks only parse and forward. A single loop in
//! [`network::Server::run`] owns the [`gateway::Gateway`] and processes
//! client commands, sequencer deadlines and regeneration ticks one at a
//! time, so no lock guards the session and every broadcast reflects a
//! consistent state.
//!
//! ### WebSocket Transport
//! Browsers connect to `/ws` and exchange JSON frames of the form
//! `{"event": "<name>", "data": <payload>}`. Every other path is served from
//! the static asset directory.
//!
//! ## Module Organization
//!
//! ### Session Module (`session`)
//! Grid dimensions, players, the DM identity, saved patterns, active
//! squares and the background image, together with the rules that guard
//! each mutation.
//!
//! ### Sequencer Module (`sequencer`)
//! Deadline queue driving every launched square through its
//! warning, damage and cleared phases.
//!
//! ### Gateway Module (`gateway`)
//! Authorization, validation and the broadcast-after-mutation rule.
//!
//! ### Client Manager Module (`client_manager`)
//! Connection identities, the connection cap and snapshot fan-out.
//!
//! ### Network Module (`network`)
//! HTTP and WebSocket plumbing plus the event loop itself.
//!
//! ## Usage Example
//!
//! ```rust,no_run
//! use server::config::ServerConfig;
//! use server::network::Server;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
//!     let mut server = Server::new(ServerConfig::default()).await?;
//!     server.run().await?;
//!     Ok(())
//! }
//! ```

pub mod client_manager;
pub mod config;
pub mod error;
pub mod gateway;
pub mod network;
pub mod sequencer;
pub mod session;
