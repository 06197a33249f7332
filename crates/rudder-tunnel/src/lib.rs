//! The rudder dispatcher: queue, rule match, outbound dial, splice.
//!
//! A [`Tunnel`] accepts per-connection [`ServerConn`]s from the inbound
//! listeners, classifies each destination against the live ruleset, obtains
//! an outbound stream from the selected [`Proxy`], and splices the two
//! together. Configuration is hot-swappable; observability flows through the
//! [`TrafficMeter`] and the [`LogBus`].

mod conn;
mod error;
mod logbus;
pub mod outbound;
mod traffic;
mod tunnel;

pub use conn::{AsyncStream, ProxyStream, ServerConn};
pub use error::{AdapterError, TunnelError};
pub use logbus::{LogBus, LogBusClosed, LogLevel, LogRecord, SubscriberHandle, Subscription};
pub use outbound::{Direct, Proxy, Reject, Shadowsocks, UrlTest};
pub use traffic::{TrafficMeter, TrafficSnapshot};
pub use tunnel::{Tunnel, TunnelOptions};
