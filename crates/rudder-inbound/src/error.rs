//! Inbound handshake errors.

use rudder_tunnel::TunnelError;

#[derive(Debug, thiserror::Error)]
pub enum InboundError {
    #[error("io: {0}")]
    Io(#[from] std::io::Error),
    #[error("unsupported socks version {0}")]
    Version(u8),
    #[error("no acceptable auth method")]
    NoAcceptableAuth,
    #[error("unsupported command {0}")]
    UnsupportedCommand(u8),
    #[error("unsupported address type {0:#04x}")]
    UnsupportedAddressType(u8),
    #[error("malformed request: {0}")]
    Malformed(String),
    #[error(transparent)]
    Tunnel(#[from] TunnelError),
}
