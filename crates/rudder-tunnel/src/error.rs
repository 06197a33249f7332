//! Error types for the dispatcher and outbound adapters.

use rudder_config::ConfigError;
use rudder_proto::ProtoError;
use rudder_rules::RulesError;

/// Errors from outbound adapter construction and dialing.
#[derive(Debug, thiserror::Error)]
pub enum AdapterError {
    #[error("{server} connect error: {source}")]
    Dial {
        server: String,
        #[source]
        source: std::io::Error,
    },
    #[error("cipher: {0}")]
    Cipher(String),
    #[error("proxy group: {0}")]
    Group(String),
    #[error(transparent)]
    Proto(#[from] ProtoError),
    #[error("io: {0}")]
    Io(#[from] std::io::Error),
}

/// Errors surfaced by the [`Tunnel`](crate::Tunnel) itself.
///
/// Per-connection failures never appear here; they are logged and the
/// connection is closed. These errors concern the queue and configuration.
#[derive(Debug, thiserror::Error)]
pub enum TunnelError {
    #[error("inbound queue is full")]
    QueueFull,
    #[error("tunnel is shut down")]
    Closed,
    #[error("no configuration path set")]
    NoConfigPath,
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error(transparent)]
    Rules(#[from] RulesError),
    #[error(transparent)]
    Adapter(#[from] AdapterError),
}
