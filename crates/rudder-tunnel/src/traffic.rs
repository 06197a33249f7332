//! Byte-counted traffic meter.
//!
//! Data-path tasks report transferred byte counts over channels; a single
//! aggregator task owns the cumulative counters and publishes per-period
//! rates on a ticker. Sends never block the data path.

use std::sync::Arc;
use std::sync::atomic::{AtomicI64, Ordering};
use std::time::Duration;

use tokio::sync::mpsc;
use tokio::time::{Instant, interval_at};

#[derive(Debug, Default)]
struct Counters {
    up_total: AtomicI64,
    down_total: AtomicI64,
    up_rate: AtomicI64,
    down_rate: AtomicI64,
}

/// A point-in-time view of the meter.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TrafficSnapshot {
    /// Upload bytes during the last completed period.
    pub up_rate: i64,
    /// Download bytes during the last completed period.
    pub down_rate: i64,
    /// Cumulative upload bytes.
    pub up_total: i64,
    /// Cumulative download bytes.
    pub down_total: i64,
}

/// Process-wide traffic accounting.
///
/// `up()`/`down()` hand out sink channels for the data path; `snapshot()`
/// is for read-only observers. One aggregator task per meter.
pub struct TrafficMeter {
    up_tx: mpsc::UnboundedSender<i64>,
    down_tx: mpsc::UnboundedSender<i64>,
    counters: Arc<Counters>,
}

impl TrafficMeter {
    /// Build a meter publishing rates every `period`; must be called within
    /// a runtime. The aggregator exits once every sink clone is dropped.
    pub fn new(period: Duration) -> Self {
        let (up_tx, up_rx) = mpsc::unbounded_channel();
        let (down_tx, down_rx) = mpsc::unbounded_channel();
        let counters = Arc::new(Counters::default());

        tokio::spawn(aggregate(period, up_rx, down_rx, counters.clone()));

        Self {
            up_tx,
            down_tx,
            counters,
        }
    }

    /// Sink for upload (client → remote) byte counts.
    pub fn up(&self) -> mpsc::UnboundedSender<i64> {
        self.up_tx.clone()
    }

    /// Sink for download (remote → client) byte counts.
    pub fn down(&self) -> mpsc::UnboundedSender<i64> {
        self.down_tx.clone()
    }

    pub fn snapshot(&self) -> TrafficSnapshot {
        TrafficSnapshot {
            up_rate: self.counters.up_rate.load(Ordering::Relaxed),
            down_rate: self.counters.down_rate.load(Ordering::Relaxed),
            up_total: self.counters.up_total.load(Ordering::Relaxed),
            down_total: self.counters.down_total.load(Ordering::Relaxed),
        }
    }
}

async fn aggregate(
    period: Duration,
    mut up_rx: mpsc::UnboundedReceiver<i64>,
    mut down_rx: mpsc::UnboundedReceiver<i64>,
    counters: Arc<Counters>,
) {
    let mut ticker = interval_at(Instant::now() + period, period);
    let mut up_acc: i64 = 0;
    let mut down_acc: i64 = 0;
    let mut up_open = true;
    let mut down_open = true;

    while up_open || down_open {
        tokio::select! {
            n = up_rx.recv(), if up_open => match n {
                Some(n) => {
                    counters.up_total.fetch_add(n, Ordering::Relaxed);
                    up_acc += n;
                }
                None => up_open = false,
            },
            n = down_rx.recv(), if down_open => match n {
                Some(n) => {
                    counters.down_total.fetch_add(n, Ordering::Relaxed);
                    down_acc += n;
                }
                None => down_open = false,
            },
            _ = ticker.tick() => {
                counters.up_rate.store(up_acc, Ordering::Relaxed);
                counters.down_rate.store(down_acc, Ordering::Relaxed);
                up_acc = 0;
                down_acc = 0;
            }
        }
    }
}
