//! Dialer server
//!
//! Loads configuration, connects storage (fatal when unreachable), starts
//! the dialer engine with the configured telephony adapter and serves
//! `/health` and `/status` until Ctrl+C.

use clap::Parser;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::watch;
use tracing::{error, info};

use rvoip_dialer_engine::adapter::{ReconnectPolicy, SimulatedAdapter, SimulationProfile, TelephonyAdapter};
use rvoip_dialer_engine::config::AdapterKind;
use rvoip_dialer_engine::logging::{log_welcome, setup_logging};
use rvoip_dialer_engine::storage::{connect_store, facade};
use rvoip_dialer_engine::{api, DialerConfig, DialerEngine};

#[derive(Parser, Debug)]
#[command(author, version, about = "Outbound dialer control plane", long_about = None)]
struct Args {
    /// TOML configuration file; DIALER__* environment variables override it
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(short, long)]
    log_level: Option<String>,

    /// Emit logs as JSON
    #[arg(long)]
    json_logs: bool,

    /// Also expose the storage API on this address for remote dialer instances
    #[arg(long)]
    store_api: Option<SocketAddr>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    let mut config = DialerConfig::load(args.config.as_deref())?;
    if let Some(level) = args.log_level {
        config.logging.level = level;
    }
    if args.json_logs {
        config.logging.json = true;
    }
    config.validate()?;

    setup_logging(&config.logging)?;
    log_welcome(&config.logging.app_name, env!("CARGO_PKG_VERSION"));

    let store = match connect_store(&config.storage).await {
        Ok(store) => store,
        Err(e) => {
            error!(error = %e, "Cannot reach storage, refusing to start");
            return Err(e.into());
        }
    };

    let adapter: Arc<dyn TelephonyAdapter> = match config.adapter.kind {
        AdapterKind::Simulated => Arc::new(SimulatedAdapter::with_reconnect_policy(
            SimulationProfile::default(),
            ReconnectPolicy::from_config(&config.adapter),
        )),
    };

    let bind_addr = config.api.bind_addr;
    let engine = Arc::new(DialerEngine::new(config, store.clone(), adapter));
    engine.start().await?;

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let shutdown = |mut rx: watch::Receiver<bool>| async move {
        let _ = rx.wait_for(|stop| *stop).await;
    };

    let mut servers = vec![tokio::spawn(api::serve(
        api::router(engine.clone()),
        bind_addr,
        shutdown(shutdown_rx.clone()),
    ))];
    if let Some(addr) = args.store_api {
        servers.push(tokio::spawn(api::serve(facade::router(store), addr, shutdown(shutdown_rx))));
    }

    info!("Dialer running, press Ctrl+C to stop");
    tokio::signal::ctrl_c().await?;
    info!("Shutdown requested");

    let _ = shutdown_tx.send(true);
    engine.stop().await?;
    for server in servers {
        match server.await {
            Ok(Err(e)) => error!(error = %e, "HTTP surface failed"),
            Err(e) => error!(error = %e, "HTTP task panicked"),
            Ok(Ok(())) => {}
        }
    }

    info!("Dialer stopped");
    Ok(())
}
