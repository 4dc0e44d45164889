//! CryptSync server library: database controller, message broker, and the
//! per-connection protocol session. The binary in `main.rs` wires these to
//! a WebSocket accept loop.

pub mod broker;
pub mod config;
pub mod database;
pub mod error;
pub mod session;
pub mod ws;

pub use broker::Broker;
pub use config::ServerConfig;
pub use database::DatabaseController;
pub use error::ServerError;
pub use session::Session;
