//! Outbound proxy adapters.
//!
//! A [`Proxy`] is a named factory: `generate` dials (or synthesizes) one
//! live outbound stream for a destination. The dispatcher resolves rule
//! matches to proxies by name; `DIRECT` and `REJECT` are always present.

mod metered;
mod shadowsocks;
mod urltest;

use std::time::Duration;

use async_trait::async_trait;
use rudder_core::defaults;
use rudder_proto::Address;
use tokio::net::TcpStream;

use crate::conn::ProxyStream;
use crate::error::AdapterError;
use crate::traffic::TrafficMeter;

pub use metered::MeteredStream;
pub use shadowsocks::{Cipher, Shadowsocks};
pub use urltest::UrlTest;

/// A named outbound: produces one [`ProxyStream`] per connection.
#[async_trait]
pub trait Proxy: Send + Sync {
    fn name(&self) -> &str;

    /// Dial an outbound stream to `addr`.
    ///
    /// Errors are per-connection: the dispatcher logs them and closes the
    /// inbound side; they never tear anything else down.
    async fn generate(&self, addr: &Address) -> Result<ProxyStream, AdapterError>;

    /// Release background resources. Called when a configuration swap
    /// replaces this proxy; streams already generated are unaffected.
    fn close(&self) {}
}

/// Dial `host:port` with keepalive applied.
async fn dial(host: &str, port: u16) -> Result<TcpStream, AdapterError> {
    let stream = TcpStream::connect((host, port))
        .await
        .map_err(|e| AdapterError::Dial {
            server: format!("{host}:{port}"),
            source: e,
        })?;
    stream.set_nodelay(defaults::DEFAULT_TCP_NO_DELAY)?;
    set_keepalive(&stream)?;
    Ok(stream)
}

fn set_keepalive(stream: &TcpStream) -> std::io::Result<()> {
    let keepalive = socket2::TcpKeepalive::new()
        .with_time(Duration::from_secs(defaults::DEFAULT_TCP_KEEPALIVE_SECS));
    socket2::SockRef::from(stream).set_tcp_keepalive(&keepalive)
}

/// Direct connection to the destination, no intermediary.
pub struct Direct {
    up: tokio::sync::mpsc::UnboundedSender<i64>,
    down: tokio::sync::mpsc::UnboundedSender<i64>,
}

impl Direct {
    pub fn new(traffic: &TrafficMeter) -> Self {
        Self {
            up: traffic.up(),
            down: traffic.down(),
        }
    }
}

#[async_trait]
impl Proxy for Direct {
    fn name(&self) -> &str {
        "DIRECT"
    }

    async fn generate(&self, addr: &Address) -> Result<ProxyStream, AdapterError> {
        let stream = dial(addr.host(), addr.port()).await?;
        Ok(Box::new(MeteredStream::new(
            stream,
            self.up.clone(),
            self.down.clone(),
        )))
    }
}

/// Refuses the connection without opening a socket: reads yield EOF,
/// writes fail.
pub struct Reject;

#[async_trait]
impl Proxy for Reject {
    fn name(&self) -> &str {
        "REJECT"
    }

    async fn generate(&self, _addr: &Address) -> Result<ProxyStream, AdapterError> {
        Ok(Box::new(RejectStream))
    }
}

struct RejectStream;

impl tokio::io::AsyncRead for RejectStream {
    fn poll_read(
        self: std::pin::Pin<&mut Self>,
        _cx: &mut std::task::Context<'_>,
        _buf: &mut tokio::io::ReadBuf<'_>,
    ) -> std::task::Poll<std::io::Result<()>> {
        // Leaving the buffer untouched signals EOF.
        std::task::Poll::Ready(Ok(()))
    }
}

impl tokio::io::AsyncWrite for RejectStream {
    fn poll_write(
        self: std::pin::Pin<&mut Self>,
        _cx: &mut std::task::Context<'_>,
        _buf: &[u8],
    ) -> std::task::Poll<std::io::Result<usize>> {
        std::task::Poll::Ready(Err(std::io::ErrorKind::BrokenPipe.into()))
    }

    fn poll_flush(
        self: std::pin::Pin<&mut Self>,
        _cx: &mut std::task::Context<'_>,
    ) -> std::task::Poll<std::io::Result<()>> {
        std::task::Poll::Ready(Ok(()))
    }

    fn poll_shutdown(
        self: std::pin::Pin<&mut Self>,
        _cx: &mut std::task::Context<'_>,
    ) -> std::task::Poll<std::io::Result<()>> {
        std::task::Poll::Ready(Ok(()))
    }
}
