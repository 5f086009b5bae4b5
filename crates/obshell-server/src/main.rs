// Copyright (C) 2025 OceanBase
// SPDX-License-Identifier: AGPL-3.0-or-later
//! obshell agent
//!
//! One process per database node. It serves:
//! - the HTTP API and peer RPC on `OBSHELL_IP:OBSHELL_PORT`
//! - the same API on the administrative socket under `OBSHELL_HOME/run`
//!
//! and runs the executor pool, scheduler, coordinator, synchroniser and
//! session sweeper in the background.

use std::path::Path;

use anyhow::Result;
use tokio::sync::watch;
use tracing::{error, info, warn};

use obshell_core::{AgentContext, BackgroundWorkers, Config};
use obshell_security::PeerPolicy;
use obshell_server::sessions::{SessionSweeper, SessionSweeperConfig};
use obshell_server::{AgentLifecycle, ServerState, server};

#[tokio::main]
async fn main() -> Result<()> {
    // Load .env file (from crate directory or parent directories)
    dotenvy::dotenv().ok();

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("obshell=info".parse()?),
        )
        .init();

    info!("Starting obshell agent");

    let config = Config::from_env().map_err(|e| {
        error!("Configuration error: {}", e);
        e
    })?;
    info!(
        home = %config.home.display(),
        addr = %format!("{}:{}", config.ip, config.port),
        cluster_store = config.cluster_database_url.is_some(),
        workers = config.worker_count,
        "Configuration loaded"
    );

    let ctx = AgentContext::bootstrap(config.clone()).await?;
    let state = ServerState::new(ctx.clone());

    let tcp = server::bind_tcp(&format!("{}:{}", config.ip, config.port)).await?;
    let socket_path = config.socket_path();
    let socket = server::bind_socket(&socket_path)?;
    let policy = PeerPolicy::for_agent(&config.home, observer_pid(&config.home));

    let workers = BackgroundWorkers::start(&ctx).await?;
    let sweeper = SessionSweeper::new(ctx.keyring.sessions().clone(), SessionSweeperConfig::default());
    let sweeper_shutdown = sweeper.shutdown_handle();
    let sweeper_handle = tokio::spawn(sweeper.run());

    let (stop_tx, stop_rx) = watch::channel(false);
    let tcp_handle = tokio::spawn(server::serve_tcp(tcp, state.clone(), stopped(stop_rx.clone())));
    let socket_handle = tokio::spawn(server::serve_socket(socket, state.clone(), policy, stopped(stop_rx)));

    state.set_lifecycle(AgentLifecycle::Running);
    info!(agent = %ctx.agent.addr(), "obshell agent running");

    tokio::signal::ctrl_c().await?;
    info!("Shutting down...");
    state.set_lifecycle(AgentLifecycle::Stopping);

    let _ = stop_tx.send(true);
    for (name, handle) in [("http", tcp_handle), ("socket", socket_handle)] {
        match handle.await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => error!(listener = name, error = %e, "Listener failed"),
            Err(e) => warn!(listener = name, error = %e, "Listener task ended abnormally"),
        }
    }

    sweeper_shutdown.notify_one();
    if let Err(e) = sweeper_handle.await {
        warn!(error = %e, "Session sweeper ended abnormally");
    }
    workers.shutdown().await;

    if let Err(e) = std::fs::remove_file(&socket_path) {
        warn!(path = %socket_path.display(), error = %e, "Could not remove socket");
    }
    info!("Shutdown complete");
    Ok(())
}

async fn stopped(mut rx: watch::Receiver<bool>) {
    let _ = rx.wait_for(|stop| *stop).await;
}

fn observer_pid(home: &Path) -> Option<u32> {
    std::fs::read_to_string(home.join("run").join("observer.pid"))
        .ok()?
        .trim()
        .parse()
        .ok()
}
