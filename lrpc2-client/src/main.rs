use lrpc2_client::client::ClientSession;
use lrpc2_client::config::{ClientConfig, Timeouts};
use lrpc2_proto::{Value, MSG_ID_CLIENT_INFO, MSG_ID_GET_PUBLIC_KEY};
use tracing::{error, info, warn};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize logging
    init_logging();

    info!("LRPC2 Client v{}", env!("CARGO_PKG_VERSION"));

    // Load configuration
    let config = load_config()?;

    let command = std::env::args().nth(1).unwrap_or_else(|| "info".to_string());

    let mut session = ClientSession::new(
        &config.client.endpoint,
        Timeouts::from(&config.timeouts),
    );

    info!("Connecting to agent at {}...", config.client.endpoint);
    if let Err(e) = session.connect().await {
        error!("Failed to connect: {}", e);
        return Err(e.into());
    }
    info!("Connected and handshake completed");

    let results = match command.as_str() {
        "info" => {
            session
                .do_request(u32::from(MSG_ID_CLIENT_INFO), &[])
                .await?
        }
        "public-key" => {
            session
                .do_request(u32::from(MSG_ID_GET_PUBLIC_KEY), &[])
                .await?
        }
        other => {
            anyhow::bail!("Unknown command: {} (expected 'info' or 'public-key')", other);
        }
    };

    for (i, value) in results.iter().enumerate() {
        match value {
            Value::Str(s) => println!("[{}] {}", i, s),
            Value::Bool(b) => println!("[{}] {}", i, b),
            Value::Int32(n) => println!("[{}] {}", i, n),
            Value::Uint32(n) => println!("[{}] {}", i, n),
            Value::Blob(b) => println!("[{}] <blob, {} bytes>", i, b.len()),
            Value::StringSet(set) => println!("[{}] {:?}", i, set),
            Value::StringMap(map) => println!("[{}] {:?}", i, map),
            Value::Null => println!("[{}] <null>", i),
        }
    }

    session.close().await?;
    Ok(())
}

fn load_config() -> anyhow::Result<ClientConfig> {
    // Try configs/client.toml (development)
    if let Ok(config) = ClientConfig::from_file("configs/client.toml") {
        info!("Loaded config from configs/client.toml");
        return Ok(config);
    }

    // Try ./client.toml (current directory)
    if let Ok(config) = ClientConfig::from_file("client.toml") {
        info!("Loaded config from client.toml");
        return Ok(config);
    }

    // Use default config as last resort
    warn!("No config file found, using default configuration");
    Ok(ClientConfig::default_config())
}

fn init_logging() {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();
}
