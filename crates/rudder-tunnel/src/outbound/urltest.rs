//! Health-tested proxy group.
//!
//! A `UrlTest` group owns an ordered set of member proxies and a background
//! prober. Every interval the prober opens a connection through each member
//! concurrently, issues an HTTP GET against the probe URL and measures time
//! to the first response byte; the fastest healthy member is elected and
//! `generate` delegates to it. The election travels over a watch channel so
//! the prober never touches state the data path reads.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use rudder_proto::Address;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::sync::watch;
use tokio::task::JoinSet;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::conn::ProxyStream;
use crate::error::AdapterError;
use crate::outbound::Proxy;

/// Destination and request line of the probe.
#[derive(Debug, Clone)]
struct ProbeTarget {
    addr: Address,
    host: String,
    path: String,
}

impl ProbeTarget {
    /// Parse a plain `http://host[:port]/path` probe URL.
    fn parse(url: &str) -> Result<Self, AdapterError> {
        let rest = url
            .strip_prefix("http://")
            .ok_or_else(|| AdapterError::Group(format!("probe URL must be http: '{url}'")))?;
        let (host_port, path) = match rest.find('/') {
            Some(i) => (&rest[..i], &rest[i..]),
            None => (rest, "/"),
        };
        let (host, port) = match host_port.rsplit_once(':') {
            Some((host, port)) => {
                let port = port.parse().map_err(|_| {
                    AdapterError::Group(format!("invalid probe port in '{url}'"))
                })?;
                (host, port)
            }
            None => (host_port, 80),
        };
        if host.is_empty() {
            return Err(AdapterError::Group(format!("empty probe host in '{url}'")));
        }
        Ok(Self {
            addr: Address::new(host, port),
            host: host.to_string(),
            path: path.to_string(),
        })
    }

    fn request(&self) -> String {
        format!(
            "GET {} HTTP/1.1\r\nHost: {}\r\nConnection: close\r\n\r\n",
            self.path, self.host
        )
    }
}

/// A `url-test` proxy group: delegates to its fastest healthy member.
pub struct UrlTest {
    name: String,
    members: Vec<Arc<dyn Proxy>>,
    fastest: watch::Receiver<usize>,
    cancel: CancellationToken,
}

impl UrlTest {
    /// Build the group and start its prober; must be called within a
    /// runtime. Until the first probe completes, the first member is the
    /// electee.
    pub fn new(
        name: impl Into<String>,
        members: Vec<Arc<dyn Proxy>>,
        probe_url: &str,
        interval: Duration,
    ) -> Result<Self, AdapterError> {
        let name = name.into();
        if members.is_empty() {
            return Err(AdapterError::Group(format!("'{name}' has no members")));
        }
        let target = ProbeTarget::parse(probe_url)?;
        let (tx, rx) = watch::channel(0usize);
        let cancel = CancellationToken::new();

        tokio::spawn(prober(
            name.clone(),
            members.clone(),
            target,
            interval,
            tx,
            cancel.clone(),
        ));

        Ok(Self {
            name,
            members,
            fastest: rx,
            cancel,
        })
    }

    /// Name of the currently elected member.
    pub fn fastest_name(&self) -> String {
        self.members[*self.fastest.borrow()].name().to_string()
    }
}

#[async_trait]
impl Proxy for UrlTest {
    fn name(&self) -> &str {
        &self.name
    }

    async fn generate(&self, addr: &Address) -> Result<ProxyStream, AdapterError> {
        let idx = *self.fastest.borrow();
        self.members[idx].generate(addr).await
    }

    /// Stop the prober. In-flight probes are cancelled; streams already
    /// generated through members are unaffected.
    fn close(&self) {
        self.cancel.cancel();
    }
}

async fn prober(
    name: String,
    members: Vec<Arc<dyn Proxy>>,
    target: ProbeTarget,
    interval: Duration,
    tx: watch::Sender<usize>,
    cancel: CancellationToken,
) {
    // First tick fires immediately so the group elects as soon as it can.
    let mut ticker = tokio::time::interval(interval);
    loop {
        tokio::select! {
            _ = cancel.cancelled() => return,
            // The group was dropped without close(); stop probing.
            _ = tx.closed() => return,
            _ = ticker.tick() => {}
        }

        let round = probe_round(&members, &target, interval);
        tokio::select! {
            _ = cancel.cancelled() => return,
            _ = tx.closed() => return,
            winner = round => {
                if let Some((idx, latency)) = winner {
                    debug!(
                        group = %name,
                        member = %members[idx].name(),
                        latency_ms = latency.as_millis() as u64,
                        "probe winner"
                    );
                    let _ = tx.send(idx);
                }
                // A round with no healthy member leaves the election alone.
            }
        }
    }
}

/// Probe every member concurrently; the minimum successful latency wins,
/// ties broken by member order.
async fn probe_round(
    members: &[Arc<dyn Proxy>],
    target: &ProbeTarget,
    budget: Duration,
) -> Option<(usize, Duration)> {
    let mut probes = JoinSet::new();
    for (idx, member) in members.iter().enumerate() {
        let member = member.clone();
        let target = target.clone();
        probes.spawn(async move { (idx, probe_member(&member, &target, budget).await) });
    }

    let mut best: Option<(usize, Duration)> = None;
    while let Some(joined) = probes.join_next().await {
        let Ok((idx, Some(latency))) = joined else {
            continue;
        };
        best = match best {
            Some((best_idx, best_latency))
                if (best_latency, best_idx) <= (latency, idx) =>
            {
                Some((best_idx, best_latency))
            }
            _ => Some((idx, latency)),
        };
    }
    best
}

/// One member probe: connect through the member, GET the probe URL, time
/// the first response byte. The interval is the per-probe budget; an
/// expired probe counts as failure.
async fn probe_member(
    member: &Arc<dyn Proxy>,
    target: &ProbeTarget,
    budget: Duration,
) -> Option<Duration> {
    let started = Instant::now();
    let attempt = async {
        let mut stream = member.generate(&target.addr).await.ok()?;
        stream.write_all(target.request().as_bytes()).await.ok()?;
        stream.flush().await.ok()?;
        let mut first = [0u8; 1];
        match stream.read(&mut first).await {
            Ok(n) if n > 0 => Some(started.elapsed()),
            _ => None,
        }
    };
    tokio::time::timeout(budget, attempt).await.ok().flatten()
}
