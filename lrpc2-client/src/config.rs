use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ClientConfig {
    pub client: ClientSettings,
    pub timeouts: TimeoutSettings,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ClientSettings {
    /// Path of the agent's unix socket endpoint
    pub endpoint: String,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct TimeoutSettings {
    /// Connect + handshake timeout in seconds
    #[serde(default = "default_connect_timeout")]
    pub connect_timeout_secs: u64,
    /// Request send timeout in seconds
    #[serde(default = "default_send_timeout")]
    pub send_timeout_secs: u64,
    /// Reply receive timeout in seconds
    #[serde(default = "default_receive_timeout")]
    pub receive_timeout_secs: u64,
}

fn default_connect_timeout() -> u64 {
    lrpc2_proto::LRPC2_CONNECT_TIMEOUT.as_secs()
}

fn default_send_timeout() -> u64 {
    lrpc2_proto::LRPC2_SEND_TIMEOUT.as_secs()
}

fn default_receive_timeout() -> u64 {
    lrpc2_proto::LRPC2_RECEIVE_TIMEOUT.as_secs()
}

/// Per-phase deadlines applied to the client's blocking operations.
#[derive(Debug, Clone, Copy)]
pub struct Timeouts {
    pub connect: Duration,
    pub send: Duration,
    pub receive: Duration,
}

impl Default for Timeouts {
    fn default() -> Self {
        Self {
            connect: lrpc2_proto::LRPC2_CONNECT_TIMEOUT,
            send: lrpc2_proto::LRPC2_SEND_TIMEOUT,
            receive: lrpc2_proto::LRPC2_RECEIVE_TIMEOUT,
        }
    }
}

impl From<&TimeoutSettings> for Timeouts {
    fn from(settings: &TimeoutSettings) -> Self {
        Self {
            connect: Duration::from_secs(settings.connect_timeout_secs),
            send: Duration::from_secs(settings.send_timeout_secs),
            receive: Duration::from_secs(settings.receive_timeout_secs),
        }
    }
}

impl ClientConfig {
    pub fn from_file<P: AsRef<Path>>(path: P) -> anyhow::Result<Self> {
        let contents = std::fs::read_to_string(path)?;
        let config: ClientConfig = toml::from_str(&contents)?;
        Ok(config)
    }

    pub fn default_config() -> Self {
        Self {
            client: ClientSettings {
                endpoint: "/var/run/lrpc2-agent.sock".to_string(),
            },
            timeouts: TimeoutSettings {
                connect_timeout_secs: default_connect_timeout(),
                send_timeout_secs: default_send_timeout(),
                receive_timeout_secs: default_receive_timeout(),
            },
        }
    }
}
