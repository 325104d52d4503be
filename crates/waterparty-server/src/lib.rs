//! HTTP and WebSocket surface for the waterparty hub.

pub mod backend;
pub mod config;
pub mod error;
pub mod health;
pub mod server;
pub mod shutdown;
pub mod ws;

pub use backend::InMemoryBackend;
pub use config::ServerConfig;
pub use error::{ConfigError, ServerError};
pub use server::{build_router, start, AppState, ServerHandle};
pub use shutdown::ShutdownCoordinator;
pub use ws::AuthenticatedUser;
