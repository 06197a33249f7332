//! rudder: a rule-based network proxy router.

use std::path::PathBuf;
use std::sync::Arc;

use clap::Parser;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use rudder_core::defaults;
use rudder_rules::GeoIpDb;
use rudder_tunnel::{LogLevel, Tunnel, TunnelOptions};

#[derive(Parser, Debug)]
#[command(name = "rudder", version, about = "Rule-based network proxy router")]
struct Args {
    /// Directory holding config.ini and Country.mmdb
    #[arg(short = 'd', long, default_value = ".")]
    dir: PathBuf,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .init();

    // The GeoIP database is required: a ruleset with GEOIP rules that can
    // never match would route traffic wrong silently.
    let mmdb_path = args.dir.join(defaults::MMDB_FILE_NAME);
    let geoip = match GeoIpDb::open(&mmdb_path) {
        Ok(db) => Arc::new(db),
        Err(e) => {
            error!("can't load mmdb: {e}");
            std::process::exit(1);
        }
    };

    let config_path = args.dir.join(defaults::CONFIG_FILE_NAME);
    let config = rudder_config::load(&config_path)?;

    let tunnel = Tunnel::new(TunnelOptions {
        config_path: Some(config_path),
        geoip: Some(geoip),
        ..TunnelOptions::default()
    });
    tunnel.apply_config(&config)?;

    let shutdown = CancellationToken::new();

    let http_listener = TcpListener::bind(("0.0.0.0", config.general.port)).await?;
    tokio::spawn(rudder_inbound::http::serve(
        http_listener,
        tunnel.clone(),
        shutdown.clone(),
    ));

    let socks_listener = TcpListener::bind(("0.0.0.0", config.general.socks_port)).await?;
    tokio::spawn(rudder_inbound::socks5::serve(
        socks_listener,
        tunnel.clone(),
        shutdown.clone(),
    ));

    // Surface the router's own log bus through tracing.
    let (mut subscription, _handle) = tunnel.log().subscribe()?;
    tokio::spawn(async move {
        while let Some(record) = subscription.recv().await {
            match record.level {
                LogLevel::Error => error!("{}", record.message),
                LogLevel::Warning => warn!("{}", record.message),
                LogLevel::Info => info!("{}", record.message),
                LogLevel::Debug => tracing::debug!("{}", record.message),
            }
        }
    });

    #[cfg(unix)]
    {
        let tunnel = tunnel.clone();
        tokio::spawn(async move {
            reload_signal_handler(tunnel).await;
        });
    }

    shutdown_signal().await;
    info!("shutdown signal received");
    shutdown.cancel();
    Ok(())
}

/// Wait for shutdown signals (SIGTERM, SIGINT).
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            warn!("failed to listen for Ctrl+C: {e}");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut sig) => {
                sig.recv().await;
            }
            Err(e) => {
                warn!("failed to listen for SIGTERM: {e}");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {}
        _ = terminate => {}
    }
}

/// Reload the configuration on SIGHUP (Unix only).
#[cfg(unix)]
async fn reload_signal_handler(tunnel: Arc<Tunnel>) {
    use tokio::signal::unix::{SignalKind, signal};

    let mut sighup = match signal(SignalKind::hangup()) {
        Ok(sig) => sig,
        Err(e) => {
            warn!("failed to install SIGHUP handler: {e}, config reload disabled");
            return;
        }
    };

    loop {
        sighup.recv().await;
        info!("SIGHUP received, reloading configuration");
        match tunnel.update_config() {
            Ok(()) => info!("configuration reloaded"),
            Err(e) => warn!("failed to reload configuration: {e}"),
        }
    }
}
