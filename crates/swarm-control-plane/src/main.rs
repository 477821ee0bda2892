// Copyright (C) 2026 Build Swarm Contributors
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Swarm Control Plane server binary.
//!
//! Starts the store, both HTTP listeners and the background monitors,
//! then waits for ctrl-c. Exit codes: 0 ok, 1 general/bind failure,
//! 2 invalid configuration, 3 store open failure, 4 admin-key
//! misconfiguration.

use std::sync::Arc;

use tracing::{info, warn};
use tracing_subscriber::fmt::writer::MakeWriterExt;

use swarm_core::{Config, Store};

use swarm_control_plane::error::StartupError;
use swarm_control_plane::runtime::{resolve_admin_key, SwarmRuntime};

#[tokio::main]
async fn main() {
    // Load .env before reading any configuration.
    if let Err(e) = dotenvy::dotenv() {
        if !e.not_found() {
            eprintln!("Failed to load .env: {e}");
        }
    }

    if let Err(e) = run().await {
        eprintln!("Startup failed: {e}");
        std::process::exit(e.exit_code());
    }
}

async fn run() -> Result<(), StartupError> {
    let config = Arc::new(Config::from_env()?);

    for dir in [&config.state_dir, &config.log_dir, &config.payload_cache] {
        if let Err(e) = std::fs::create_dir_all(dir) {
            eprintln!("Cannot create {}: {e}", dir.display());
        }
    }

    init_logging(&config);

    info!(
        version = env!("CARGO_PKG_VERSION"),
        db = %config.db_path().display(),
        public_port = config.public_port,
        admin_port = config.admin_port,
        "Starting swarm control plane"
    );

    let admin_key = resolve_admin_key(&config)?;

    let store = Store::open(config.db_path())
        .await
        .map_err(StartupError::Store)?;
    info!("Store opened");

    let runtime = SwarmRuntime::builder()
        .store(store)
        .config(config)
        .admin_key(admin_key)
        .start()
        .await?;

    info!("Control plane ready");

    if let Err(e) = tokio::signal::ctrl_c().await {
        warn!(error = %e, "Failed to listen for shutdown signal");
    }
    info!("Shutdown signal received");

    runtime.shutdown().await;
    Ok(())
}

fn init_logging(config: &Config) {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| "swarm_control_plane=info,swarm_core=info".into());

    let log_file = std::fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(config.log_file())
        .ok();

    match log_file {
        Some(file) => {
            tracing_subscriber::fmt()
                .with_env_filter(filter)
                .with_writer(std::io::stdout.and(Arc::new(file)))
                .with_ansi(false)
                .init();
        }
        None => {
            tracing_subscriber::fmt().with_env_filter(filter).init();
        }
    }
}
