//! Inbound listeners for the rudder proxy router.
//!
//! Each listener accepts client connections, performs its protocol's
//! handshake to learn the destination, and hands the dispatcher a
//! per-connection [`ServerConn`]. The HTTP listener speaks both CONNECT
//! (raw splice) and plain forward-mode proxying; the SOCKS5 listener
//! supports CONNECT with no authentication.

mod error;
pub mod http;
pub mod socks5;

use std::time::Duration;

use async_trait::async_trait;
use rudder_core::defaults;
use rudder_core::io::splice;
use rudder_proto::Address;
use rudder_tunnel::{AsyncStream, ProxyStream, ServerConn};
use tracing::debug;

pub use error::InboundError;

/// A raw-splice inbound connection: SOCKS5 CONNECT or HTTP CONNECT after
/// the hijack. `connect` shuttles bytes until either end closes.
pub struct StreamConn<S> {
    addr: Address,
    stream: S,
}

impl<S: AsyncStream> StreamConn<S> {
    pub fn new(addr: Address, stream: S) -> Self {
        Self { addr, stream }
    }
}

#[async_trait]
impl<S: AsyncStream> ServerConn for StreamConn<S> {
    fn addr(&self) -> &Address {
        &self.addr
    }

    async fn connect(self: Box<Self>, outbound: ProxyStream) {
        let addr = self.addr;
        let result = splice(
            self.stream,
            outbound,
            Duration::from_secs(defaults::DEFAULT_RELAY_IDLE_TIMEOUT_SECS),
            defaults::DEFAULT_RELAY_BUFFER_SIZE,
        )
        .await;
        match result {
            Ok(stats) => debug!(
                addr = %addr,
                up = stats.client_to_remote,
                down = stats.remote_to_client,
                "connection finished"
            ),
            // Mid-stream copy errors close both ends silently.
            Err(_) => {}
        }
    }
}
