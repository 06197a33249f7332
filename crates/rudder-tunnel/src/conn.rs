//! Per-connection adapter contracts.
//!
//! Inbound listeners hand the dispatcher one [`ServerConn`] per accepted
//! connection; outbound adapters produce one [`ProxyStream`] per dial. Both
//! sides are consumed by a single connection and closed by drop.

use async_trait::async_trait;
use rudder_proto::Address;
use tokio::io::{AsyncRead, AsyncWrite};

/// A readable/writable byte stream usable as either side of a connection.
pub trait AsyncStream: AsyncRead + AsyncWrite + Send + Unpin {}

impl<T: AsyncRead + AsyncWrite + Send + Unpin> AsyncStream for T {}

/// The outbound side of one connection, live and consumed once.
///
/// Dropping the stream closes the outbound side.
pub type ProxyStream = Box<dyn AsyncStream>;

/// The inbound side of one connection.
///
/// Produced by an inbound listener, consumed by the dispatcher. `connect`
/// moves bytes between the client and the outbound until either end closes;
/// dropping an unconnected `ServerConn` closes the client side.
#[async_trait]
pub trait ServerConn: Send {
    /// Destination the client asked for.
    fn addr(&self) -> &Address;

    /// Splice the client stream to the outbound until completion.
    async fn connect(self: Box<Self>, outbound: ProxyStream);
}
