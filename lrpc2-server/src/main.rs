use std::sync::Arc;

use lrpc2_proto::{SecureMessenger, Value, MSG_ID_CLIENT_INFO, MSG_ID_GET_PUBLIC_KEY};
use lrpc2_server::config::{ServerConfig, Timeouts};
use lrpc2_server::context::SessionContext;
use lrpc2_server::server::{CommandHandler, HandlerFuture, SessionServer};
use rsa::pkcs8::{EncodePublicKey, LineEnding};
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load configuration
    let config = load_config()?;

    // Initialize logging
    init_logging(&config);

    info!("LRPC2 Agent v{} starting...", env!("CARGO_PKG_VERSION"));

    let messenger = Arc::new(SecureMessenger::new());

    let mut server = SessionServer::new(
        &config.server.endpoint,
        Timeouts::from(&config.limits),
    );
    server.register(MSG_ID_CLIENT_INFO, client_info)?;
    server.register(
        MSG_ID_GET_PUBLIC_KEY,
        PublicKeyHandler {
            messenger: Arc::clone(&messenger),
        },
    )?;

    server.start()?;

    tokio::signal::ctrl_c().await?;
    info!("Shutdown signal received");

    server.stop();
    server.wait().await;

    Ok(())
}

/// Reports the caller's identity back to it, as the agent sees it
/// through the socket credentials.
fn client_info(ctx: &mut SessionContext, _args: Vec<Value>) -> HandlerFuture<'_> {
    Box::pin(async move {
        let user = ctx.caller_user_id();
        let privileged = ctx.is_privileged();
        let pid = ctx.process_id();
        let program = ctx.program().to_string();
        Some(vec![
            Value::Str(user),
            Value::Bool(privileged),
            Value::Int32(pid),
            Value::Str(program),
        ])
    })
}

/// Hands out the agent's public key so callers can encrypt sensitive
/// arguments for later requests.
struct PublicKeyHandler {
    messenger: Arc<SecureMessenger>,
}

impl CommandHandler for PublicKeyHandler {
    fn handle<'a>(&'a self, _ctx: &'a mut SessionContext, _args: Vec<Value>) -> HandlerFuture<'a> {
        Box::pin(async move {
            let (key, key_id) = match self.messenger.public_key() {
                Ok(pair) => pair,
                Err(e) => {
                    error!("Public key unavailable: {}", e);
                    return Some(vec![Value::Null]);
                }
            };

            match key.to_public_key_pem(LineEnding::LF) {
                Ok(pem) => Some(vec![Value::Str(pem), Value::Uint32(key_id)]),
                Err(e) => {
                    error!("Failed to encode public key: {}", e);
                    Some(vec![Value::Null])
                }
            }
        })
    }
}

fn load_config() -> anyhow::Result<ServerConfig> {
    // Try to load from /etc/lrpc2/config.toml first (production)
    if let Ok(config) = ServerConfig::from_file("/etc/lrpc2/config.toml") {
        return Ok(config);
    }

    // Try configs/server.toml (development)
    if let Ok(config) = ServerConfig::from_file("configs/server.toml") {
        return Ok(config);
    }

    // Try ./server.toml (current directory)
    if let Ok(config) = ServerConfig::from_file("server.toml") {
        return Ok(config);
    }

    // Use default config as last resort
    warn!("No config file found, using default configuration");
    Ok(ServerConfig::default_config())
}

fn init_logging(config: &ServerConfig) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(&config.logging.log_level));

    if config.logging.json_logs {
        tracing_subscriber::fmt()
            .json()
            .with_env_filter(filter)
            .init();
    } else {
        tracing_subscriber::fmt()
            .with_env_filter(filter)
            .init();
    }
}
