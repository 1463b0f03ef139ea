pub mod client;
pub mod config;

pub use client::ClientSession;
pub use config::{ClientConfig, Timeouts};
