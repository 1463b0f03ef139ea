use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ServerConfig {
    pub server: ServerSettings,
    pub limits: LimitsSettings,
    pub logging: LoggingSettings,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ServerSettings {
    /// Path of the unix socket endpoint to listen on
    pub endpoint: String,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct LimitsSettings {
    /// Handshake timeout in seconds
    #[serde(default = "default_handshake_timeout")]
    pub handshake_timeout_secs: u64,
    /// Request receive timeout in seconds
    #[serde(default = "default_receive_timeout")]
    pub receive_timeout_secs: u64,
    /// Reply send timeout in seconds
    #[serde(default = "default_send_timeout")]
    pub send_timeout_secs: u64,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct LoggingSettings {
    /// Log level: trace, debug, info, warn, error
    #[serde(default = "default_log_level")]
    pub log_level: String,
    /// Output logs as JSON
    #[serde(default)]
    pub json_logs: bool,
}

fn default_handshake_timeout() -> u64 {
    lrpc2_proto::LRPC2_CONNECT_TIMEOUT.as_secs()
}

fn default_receive_timeout() -> u64 {
    lrpc2_proto::LRPC2_RECEIVE_TIMEOUT.as_secs()
}

fn default_send_timeout() -> u64 {
    lrpc2_proto::LRPC2_SEND_TIMEOUT.as_secs()
}

fn default_log_level() -> String {
    "info".to_string()
}

/// Per-phase deadlines applied to a connection's blocking operations.
#[derive(Debug, Clone, Copy)]
pub struct Timeouts {
    pub handshake: Duration,
    pub receive: Duration,
    pub send: Duration,
}

impl Default for Timeouts {
    fn default() -> Self {
        Self {
            handshake: lrpc2_proto::LRPC2_CONNECT_TIMEOUT,
            receive: lrpc2_proto::LRPC2_RECEIVE_TIMEOUT,
            send: lrpc2_proto::LRPC2_SEND_TIMEOUT,
        }
    }
}

impl From<&LimitsSettings> for Timeouts {
    fn from(limits: &LimitsSettings) -> Self {
        Self {
            handshake: Duration::from_secs(limits.handshake_timeout_secs),
            receive: Duration::from_secs(limits.receive_timeout_secs),
            send: Duration::from_secs(limits.send_timeout_secs),
        }
    }
}

impl ServerConfig {
    pub fn from_file<P: AsRef<Path>>(path: P) -> anyhow::Result<Self> {
        let contents = std::fs::read_to_string(path)?;
        let config: ServerConfig = toml::from_str(&contents)?;
        Ok(config)
    }

    pub fn default_config() -> Self {
        Self {
            server: ServerSettings {
                endpoint: "/var/run/lrpc2-agent.sock".to_string(),
            },
            limits: LimitsSettings {
                handshake_timeout_secs: default_handshake_timeout(),
                receive_timeout_secs: default_receive_timeout(),
                send_timeout_secs: default_send_timeout(),
            },
            logging: LoggingSettings {
                log_level: default_log_level(),
                json_logs: false,
            },
        }
    }
}
