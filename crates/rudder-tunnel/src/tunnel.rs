//! The connection dispatcher.
//!
//! One `Tunnel` per process, constructed explicitly and shared as an
//! `Arc` by the inbound listeners and the entry point. Inbounds enqueue
//! [`ServerConn`]s; a consumer task dequeues and spawns one isolated worker
//! per connection which matches the ruleset, dials the selected outbound
//! and splices the streams.

use std::collections::HashMap;
use std::mem;
use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use parking_lot::RwLock;
use rudder_config::{Config, ProxyKind};
use rudder_core::defaults;
use rudder_proto::Address;
use rudder_rules::{GeoIpDb, Rule};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::conn::ServerConn;
use crate::error::TunnelError;
use crate::logbus::{LogBus, LogLevel, LogRecord};
use crate::outbound::{Direct, Proxy, Reject, Shadowsocks, UrlTest};
use crate::traffic::TrafficMeter;

/// Construction options for [`Tunnel::new`].
pub struct TunnelOptions {
    /// Configuration file read by [`Tunnel::update_config`].
    pub config_path: Option<PathBuf>,
    /// GeoIP database for `GEOIP` rules.
    pub geoip: Option<Arc<GeoIpDb>>,
    /// Inbound queue bound; `None` keeps the queue unbounded.
    pub queue_limit: Option<usize>,
    /// Traffic meter aggregation period.
    pub traffic_period: Duration,
}

impl Default for TunnelOptions {
    fn default() -> Self {
        Self {
            config_path: None,
            geoip: None,
            queue_limit: None,
            traffic_period: Duration::from_secs(defaults::DEFAULT_TRAFFIC_PERIOD_SECS),
        }
    }
}

/// One configuration snapshot: the ordered rules and the proxy map.
///
/// Swapped wholesale under the writer lock; matches hold the reader lock
/// for the duration of one traversal and never perform I/O under it.
struct Router {
    rules: Vec<Rule>,
    proxies: HashMap<String, Arc<dyn Proxy>>,
    /// The `DIRECT` instance, used when no rule matches.
    fallback: Arc<dyn Proxy>,
}

/// The dispatcher.
pub struct Tunnel {
    queue_tx: mpsc::UnboundedSender<Box<dyn ServerConn>>,
    queued: AtomicUsize,
    queue_limit: Option<usize>,
    router: RwLock<Router>,
    traffic: TrafficMeter,
    log_tx: mpsc::UnboundedSender<LogRecord>,
    log_bus: LogBus,
    geoip: Option<Arc<GeoIpDb>>,
    config_path: Option<PathBuf>,
}

impl Tunnel {
    /// Build a tunnel and start its consumer task; must be called within a
    /// runtime.
    ///
    /// The initial snapshot has no rules and only the built-in `DIRECT` and
    /// `REJECT` proxies, so every connection goes direct until a
    /// configuration is applied.
    pub fn new(options: TunnelOptions) -> Arc<Self> {
        let traffic = TrafficMeter::new(options.traffic_period);
        let (log_tx, log_rx) = mpsc::unbounded_channel();
        let log_bus = LogBus::new(log_rx);
        let (queue_tx, queue_rx) = mpsc::unbounded_channel();

        let direct: Arc<dyn Proxy> = Arc::new(Direct::new(&traffic));
        let mut proxies: HashMap<String, Arc<dyn Proxy>> = HashMap::new();
        proxies.insert("DIRECT".to_string(), direct.clone());
        proxies.insert("REJECT".to_string(), Arc::new(Reject));

        let tunnel = Arc::new(Self {
            queue_tx,
            queued: AtomicUsize::new(0),
            queue_limit: options.queue_limit,
            router: RwLock::new(Router {
                rules: Vec::new(),
                proxies,
                fallback: direct,
            }),
            traffic,
            log_tx,
            log_bus,
            geoip: options.geoip,
            config_path: options.config_path,
        });

        tokio::spawn(dispatch(Arc::downgrade(&tunnel), queue_rx));
        tunnel
    }

    /// Hand one accepted connection to the dispatcher. Never blocks.
    ///
    /// With a queue bound configured, overflow rejects the new connection
    /// with [`TunnelError::QueueFull`]; the caller should just drop it.
    pub fn enqueue(&self, conn: Box<dyn ServerConn>) -> Result<(), TunnelError> {
        if let Some(limit) = self.queue_limit
            && self.queued.load(Ordering::Acquire) >= limit
        {
            return Err(TunnelError::QueueFull);
        }
        self.queued.fetch_add(1, Ordering::AcqRel);
        self.queue_tx.send(conn).map_err(|_| {
            self.queued.fetch_sub(1, Ordering::AcqRel);
            TunnelError::Closed
        })
    }

    /// Reload the configuration file and swap it in atomically.
    ///
    /// Transactional: on any error the previous snapshot stays installed.
    pub fn update_config(&self) -> Result<(), TunnelError> {
        let path = self.config_path.as_ref().ok_or(TunnelError::NoConfigPath)?;
        let config = rudder_config::load(path)?;
        self.apply_config(&config)
    }

    /// Swap in an already-parsed configuration.
    ///
    /// The new rules and proxy map are built completely before the writer
    /// lock is taken; the lock is held only for the swap. Replaced proxies
    /// are closed afterwards, which stops the probers of replaced
    /// health-tested groups. In-flight connections keep their streams.
    pub fn apply_config(&self, config: &Config) -> Result<(), TunnelError> {
        let router = self.build_router(config)?;
        info!(
            rules = router.rules.len(),
            proxies = router.proxies.len(),
            "configuration applied"
        );

        let old = {
            let mut guard = self.router.write();
            mem::replace(&mut *guard, router)
        };
        for proxy in old.proxies.values() {
            proxy.close();
        }
        Ok(())
    }

    /// Snapshot of the current rules and proxy map.
    pub fn config(&self) -> (Vec<Rule>, HashMap<String, Arc<dyn Proxy>>) {
        let router = self.router.read();
        (router.rules.clone(), router.proxies.clone())
    }

    pub fn traffic(&self) -> &TrafficMeter {
        &self.traffic
    }

    pub fn log(&self) -> &LogBus {
        &self.log_bus
    }

    fn build_router(&self, config: &Config) -> Result<Router, TunnelError> {
        let mut proxies: HashMap<String, Arc<dyn Proxy>> = HashMap::new();
        let direct: Arc<dyn Proxy> = Arc::new(Direct::new(&self.traffic));
        proxies.insert("DIRECT".to_string(), direct.clone());
        proxies.insert("REJECT".to_string(), Arc::new(Reject));

        for def in &config.proxies {
            match &def.kind {
                ProxyKind::Shadowsocks {
                    server,
                    port,
                    cipher,
                    password,
                } => {
                    let ss = Shadowsocks::new(
                        def.name.clone(),
                        server.clone(),
                        *port,
                        cipher,
                        password,
                        &self.traffic,
                    )?;
                    proxies.insert(def.name.clone(), Arc::new(ss));
                }
            }
        }

        for group in &config.groups {
            let mut members = Vec::with_capacity(group.members.len());
            for member in &group.members {
                match proxies.get(member) {
                    Some(proxy) => members.push(proxy.clone()),
                    None => warn!(
                        group = %group.name,
                        member = %member,
                        "proxy group member not found, skipping"
                    ),
                }
            }
            let urltest = UrlTest::new(
                group.name.clone(),
                members,
                &group.probe_url,
                Duration::from_secs(group.interval_secs),
            )?;
            proxies.insert(group.name.clone(), Arc::new(urltest));
        }

        let mut rules = Vec::with_capacity(config.rules.len());
        for def in &config.rules {
            rules.push(Rule::bind(def.clone(), self.geoip.as_ref())?);
        }

        Ok(Router {
            rules,
            proxies,
            fallback: direct,
        })
    }

    /// Match a destination against the current snapshot.
    ///
    /// First matching rule with a resolvable adapter wins; a matching rule
    /// whose adapter is missing is logged and skipped. A full miss falls
    /// back to `DIRECT`. Pure with respect to the snapshot: no dialing, no
    /// blocking I/O under the reader lock.
    fn match_proxy(&self, addr: &Address) -> Arc<dyn Proxy> {
        let router = self.router.read();
        for rule in &router.rules {
            if rule.matches(addr) {
                match router.proxies.get(rule.adapter_name()) {
                    Some(proxy) => {
                        self.publish(
                            LogLevel::Info,
                            format!(
                                "{addr} match {} using {}",
                                rule.rule_type(),
                                rule.adapter_name()
                            ),
                        );
                        return proxy.clone();
                    }
                    None => {
                        self.publish(
                            LogLevel::Info,
                            format!(
                                "{addr} matched {}({}) but adapter {} is missing",
                                rule.rule_type(),
                                rule.payload(),
                                rule.adapter_name()
                            ),
                        );
                    }
                }
            }
        }
        self.publish(
            LogLevel::Info,
            format!("{addr} doesn't match any rule using DIRECT"),
        );
        router.fallback.clone()
    }

    fn publish(&self, level: LogLevel, message: String) {
        // The bus is the canonical stream; the tracing mirror is for
        // library users with no subscriber attached.
        debug!(level = %level, "{message}");
        let _ = self.log_tx.send(LogRecord::new(level, message));
    }
}

/// Consumer loop: dequeue and spawn one worker per connection.
async fn dispatch(
    tunnel: std::sync::Weak<Tunnel>,
    mut queue_rx: mpsc::UnboundedReceiver<Box<dyn ServerConn>>,
) {
    while let Some(conn) = queue_rx.recv().await {
        let Some(tunnel) = tunnel.upgrade() else {
            return;
        };
        tunnel.queued.fetch_sub(1, Ordering::AcqRel);
        // Worker panics are contained by the task boundary.
        tokio::spawn(handle_conn(tunnel, conn));
    }
}

/// One connection: match, dial, splice, close.
async fn handle_conn(tunnel: Arc<Tunnel>, conn: Box<dyn ServerConn>) {
    let addr = conn.addr().clone();
    let proxy = tunnel.match_proxy(&addr);
    match proxy.generate(&addr).await {
        Ok(outbound) => conn.connect(outbound).await,
        Err(e) => {
            // Per-connection failure: log, drop the inbound, move on.
            tunnel.publish(LogLevel::Warning, format!("Proxy connect error: {e}"));
        }
    }
}
