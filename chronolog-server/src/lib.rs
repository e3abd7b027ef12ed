//! WebSocket front end for `chronolog-store`.
//!
//! ```text
//!   CLI (config) ──► CollectionRouter ──► Server ──► Connection ──► Dispatcher
//!                          ▲                 │
//!                          └── lifecycle ◄───┘
//! ```
//!
//! - `protocol`: JSON envelopes and payloads
//! - `auth`: shared-secret check
//! - `dispatch`: request to store operation
//! - `server`: listener, per-connection auth gate, shutdown
//! - `lifecycle`: TTL sweep and flush ticker
//! - `config`: command line

pub mod auth;
pub mod config;
pub mod dispatch;
pub mod lifecycle;
pub mod protocol;
pub mod server;

pub use config::Cli;
pub use dispatch::Dispatcher;
pub use protocol::{Envelope, MessageType, ProtocolError};
pub use server::{Server, ServerConfig, ServerStats};
