//! Multi-subscriber log fan-out.
//!
//! Every record written to the bus's source channel is delivered to every
//! current subscriber in publication order. Subscribers are independent:
//! each owns a bounded buffer and a subscriber that falls behind loses its
//! *oldest* records; publishers never block on the data path. When the
//! source channel closes the bus transitions to done, all subscriptions end
//! and further subscribes fail.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::SystemTime;

use parking_lot::RwLock;
use rudder_core::defaults::DEFAULT_LOG_SUBSCRIBER_BUFFER;
use tokio::sync::{broadcast, mpsc};

/// Severity of a log record.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogLevel {
    Debug,
    Info,
    Warning,
    Error,
}

impl std::fmt::Display for LogLevel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            LogLevel::Debug => "debug",
            LogLevel::Info => "info",
            LogLevel::Warning => "warning",
            LogLevel::Error => "error",
        };
        f.write_str(s)
    }
}

/// One record on the bus.
#[derive(Debug, Clone)]
pub struct LogRecord {
    pub level: LogLevel,
    pub message: String,
    pub timestamp: SystemTime,
}

impl LogRecord {
    pub fn new(level: LogLevel, message: String) -> Self {
        Self {
            level,
            message,
            timestamp: SystemTime::now(),
        }
    }
}

/// Subscribing to a closed bus.
#[derive(Debug, thiserror::Error)]
#[error("log bus is closed")]
pub struct LogBusClosed;

/// Opaque handle identifying one subscriber, for [`LogBus::unsubscribe`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SubscriberHandle(u64);

struct BusInner {
    subscribers: RwLock<HashMap<u64, broadcast::Sender<LogRecord>>>,
    next_handle: AtomicU64,
    done: AtomicBool,
}

/// The log fan-out. Cheap to share; the tunnel owns the producing side.
pub struct LogBus {
    inner: Arc<BusInner>,
}

impl LogBus {
    /// Build a bus draining `source`; must be called within a runtime.
    ///
    /// The fan-out task runs until `source` is exhausted, then closes every
    /// subscription and marks the bus done.
    pub fn new(mut source: mpsc::UnboundedReceiver<LogRecord>) -> Self {
        let inner = Arc::new(BusInner {
            subscribers: RwLock::new(HashMap::new()),
            next_handle: AtomicU64::new(0),
            done: AtomicBool::new(false),
        });

        let fanout = inner.clone();
        tokio::spawn(async move {
            while let Some(record) = source.recv().await {
                let subscribers = fanout.subscribers.read();
                for tx in subscribers.values() {
                    // A full buffer drops that subscriber's oldest record; a
                    // send to a dropped receiver is a no-op. Neither blocks.
                    let _ = tx.send(record.clone());
                }
            }
            fanout.done.store(true, Ordering::SeqCst);
            fanout.subscribers.write().clear();
        });

        Self { inner }
    }

    /// Register a new subscriber.
    ///
    /// Fails once the bus is done. The subscription only sees records
    /// published after this call.
    pub fn subscribe(&self) -> Result<(Subscription, SubscriberHandle), LogBusClosed> {
        let mut subscribers = self.inner.subscribers.write();
        // Checked under the lock so a concurrent close cannot hand out a
        // subscription that was never registered.
        if self.inner.done.load(Ordering::SeqCst) {
            return Err(LogBusClosed);
        }
        let id = self.inner.next_handle.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = broadcast::channel(DEFAULT_LOG_SUBSCRIBER_BUFFER);
        subscribers.insert(id, tx);
        Ok((Subscription { rx }, SubscriberHandle(id)))
    }

    /// Remove a subscriber; its subscription ends after draining.
    pub fn unsubscribe(&self, handle: SubscriberHandle) {
        self.inner.subscribers.write().remove(&handle.0);
    }

    /// Whether the source has been exhausted.
    pub fn is_closed(&self) -> bool {
        self.inner.done.load(Ordering::SeqCst)
    }
}

/// A live subscription; yields records until the bus closes or the
/// subscriber is removed.
pub struct Subscription {
    rx: broadcast::Receiver<LogRecord>,
}

impl Subscription {
    /// Receive the next record, or `None` once the subscription has ended.
    ///
    /// Records dropped by the bounded buffer are skipped silently; delivery
    /// continues from the oldest retained record.
    pub async fn recv(&mut self) -> Option<LogRecord> {
        loop {
            match self.rx.recv().await {
                Ok(record) => return Some(record),
                Err(broadcast::error::RecvError::Lagged(_)) => continue,
                Err(broadcast::error::RecvError::Closed) => return None,
            }
        }
    }
}
