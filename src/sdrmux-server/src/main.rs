// SPDX-FileCopyrightText: 2025 Stanislaw Grams <stanislawgrams@gmail.com>
//
// SPDX-License-Identifier: BSD-2-Clause

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use tokio::signal;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{info, warn};

use sdrmux_app::{init_logging, ConfigFile};
use sdrmux_core::multicast;

use sdrmux_server::config::GatewayConfig;
use sdrmux_server::controller::RadioController;
use sdrmux_server::limiter::Limiters;
use sdrmux_server::manager::SessionManager;
use sdrmux_server::metrics::GatewayMetrics;
use sdrmux_server::net::{BypassSet, CidrSet};
use sdrmux_server::receiver::run_data_receiver;

const PKG_DESCRIPTION: &str = concat!(env!("CARGO_PKG_NAME"), " - SDR gateway multiplex daemon");
const LIMITER_SWEEP_INTERVAL: Duration = Duration::from_secs(60);

#[derive(Debug, Parser)]
#[command(
    version = env!("CARGO_PKG_VERSION"),
    about = PKG_DESCRIPTION,
)]
struct Cli {
    /// Path to configuration file
    #[arg(long = "config", short = 'C', value_name = "FILE")]
    config: Option<PathBuf>,
    /// Print example configuration and exit
    #[arg(long = "print-config")]
    print_config: bool,
    /// Override the control/status multicast group (<host>:<port>)
    #[arg(long = "status-group")]
    status_group: Option<String>,
    /// Override the RTP data multicast group (<host>:<port>)
    #[arg(long = "data-group")]
    data_group: Option<String>,
    /// Override the multicast interface
    #[arg(short = 'i', long = "interface")]
    interface: Option<String>,
}

async fn run_limiter_sweeper(limiters: Arc<Limiters>, mut shutdown: watch::Receiver<bool>) {
    let mut ticker = tokio::time::interval(LIMITER_SWEEP_INTERVAL);
    loop {
        tokio::select! {
            changed = shutdown.changed() => {
                if changed.is_err() || *shutdown.borrow() {
                    break;
                }
            }
            _ = ticker.tick() => limiters.cleanup(),
        }
    }
}

#[tokio::main]
async fn main() -> sdrmux_core::DynResult<()> {
    let cli = Cli::parse();

    if cli.print_config {
        println!("{}", GatewayConfig::example_toml());
        return Ok(());
    }

    let (mut cfg, config_path) = if let Some(ref path) = cli.config {
        (GatewayConfig::load_from_file(path)?, Some(path.clone()))
    } else {
        GatewayConfig::load_from_default_paths()?
    };
    if let Some(group) = cli.status_group {
        cfg.radio.status_group = group;
    }
    if let Some(group) = cli.data_group {
        cfg.radio.data_group = group;
    }
    if let Some(interface) = cli.interface {
        cfg.radio.interface = interface;
    }
    cfg.validate()
        .map_err(|e| format!("Invalid configuration: {}", e))?;

    init_logging(cfg.general.log_level.as_deref());
    if let Some(ref path) = config_path {
        info!("Loaded configuration from {}", path.display());
    }

    let status_group = multicast::resolve_group(&cfg.radio.status_group)?;
    let data_group = multicast::resolve_group(&cfg.radio.data_group)?;
    let interface = multicast::resolve_interface(&cfg.radio.interface)?;
    info!(
        "Starting sdrmux-server (status {}, data {}, interface {})",
        status_group, data_group, cfg.radio.interface
    );

    let control_socket = multicast::open_send(status_group, &interface)?;
    let status_socket = multicast::open_recv(status_group, &interface)?;
    let data_socket = multicast::open_recv(data_group, &interface)?;

    let metrics = Arc::new(GatewayMetrics::default());
    let limiters = Arc::new(Limiters::new(&cfg.limits));
    let bypass = BypassSet::new(CidrSet::parse(&cfg.bypass.cidrs)?, cfg.bypass.password.clone());
    // Trusted-proxy list is handed to the protocol front ends; parsing it
    // here keeps bad config fatal at startup.
    let _trusted_proxies = CidrSet::parse(&cfg.proxy.trusted_cidrs)?;

    let controller = Arc::new(RadioController::new(
        control_socket,
        status_group,
        Arc::clone(&metrics),
    ));
    let manager = SessionManager::new(
        cfg.sessions.clone(),
        bypass,
        Arc::clone(&controller),
        Arc::clone(&limiters),
        Arc::clone(&metrics),
    );

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let mut task_handles: Vec<JoinHandle<()>> = Vec::new();

    task_handles.push(tokio::spawn(
        Arc::clone(&controller).run_status_listener(status_socket, shutdown_rx.clone()),
    ));
    task_handles.push(tokio::spawn(run_data_receiver(
        data_socket,
        Arc::clone(&manager),
        Arc::clone(&metrics),
        shutdown_rx.clone(),
    )));
    task_handles.push(tokio::spawn(
        Arc::clone(&manager).run_janitor(shutdown_rx.clone()),
    ));
    task_handles.push(tokio::spawn(run_limiter_sweeper(
        Arc::clone(&limiters),
        shutdown_rx.clone(),
    )));

    info!(
        "Ready: max {} sessions ({} per IP)",
        cfg.sessions.max_sessions, cfg.sessions.max_sessions_per_ip
    );

    signal::ctrl_c().await?;
    info!("Ctrl+C received, shutting down");
    let _ = shutdown_tx.send(true);

    // Disable whatever channels are still live so the back end can
    // garbage-collect them promptly.
    for session in manager.sessions() {
        if !manager.destroy(&session.id).await {
            warn!("session {} vanished during shutdown", session.id);
        }
    }

    tokio::time::sleep(Duration::from_millis(200)).await;
    for handle in &task_handles {
        if !handle.is_finished() {
            handle.abort();
        }
    }
    for handle in task_handles {
        let _ = handle.await;
    }
    Ok(())
}
