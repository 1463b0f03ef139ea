pub mod config;
pub mod conn;
pub mod context;
pub mod server;

pub use config::{ServerConfig, Timeouts};
pub use context::SessionContext;
pub use server::{CommandHandler, HandlerFuture, SessionServer};
