// Copyright (C) 2026 Build Swarm Contributors
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Control-plane runtime: wires the components together, spawns the
//! listeners and background loops, and owns graceful shutdown.
//!
//! Restartable background loops (scheduler maintenance, self-healing
//! probe) run under a supervisor: a panic is logged and the loop is
//! restarted with exponential backoff capped at one minute. The two
//! write-behind workers own their queue receivers, so they are spawned
//! once and drained at shutdown.

use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use tokio::net::TcpListener;
use tokio::sync::{watch, Notify};
use tokio::task::JoinHandle;
use tracing::{error, info, warn};

use swarm_core::events::EventBus;
use swarm_core::types::now_ts;
use swarm_core::{Config, Store};

use crate::error::StartupError;
use crate::health::HealthMonitor;
use crate::http::{admin_router, public_router, AppState};
use crate::link::{LinkRunner, SshRunner};
use crate::payloads::PayloadManager;
use crate::protocol_log::ProtocolLogger;
use crate::releases::ReleaseManager;
use crate::scheduler::Scheduler;
use crate::self_healing::SelfHealingMonitor;

/// Builder for [`SwarmRuntime`].
#[derive(Default)]
pub struct SwarmRuntimeBuilder {
    store: Option<Store>,
    config: Option<Arc<Config>>,
    link: Option<Arc<dyn LinkRunner>>,
    admin_key: Option<String>,
}

impl SwarmRuntimeBuilder {
    /// Create a new builder.
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the store (required).
    pub fn store(mut self, store: Store) -> Self {
        self.store = Some(store);
        self
    }

    /// Set the configuration (required).
    pub fn config(mut self, config: Arc<Config>) -> Self {
        self.config = Some(config);
        self
    }

    /// Override the SSH transport (tests use the mock).
    pub fn link(mut self, link: Arc<dyn LinkRunner>) -> Self {
        self.link = Some(link);
        self
    }

    /// Set the resolved admin key (required).
    pub fn admin_key(mut self, key: String) -> Self {
        self.admin_key = Some(key);
        self
    }

    /// Start everything.
    pub async fn start(self) -> Result<SwarmRuntime, StartupError> {
        let store = self.store.ok_or(StartupError::Builder("store"))?;
        let config = self.config.ok_or(StartupError::Builder("config"))?;
        let admin_key = Arc::new(self.admin_key.ok_or(StartupError::Builder("admin key"))?);
        let link: Arc<dyn LinkRunner> = self.link.unwrap_or_else(|| Arc::new(SshRunner::new()));

        let (events, event_writer) = EventBus::new(store.clone());
        let (protocol, protocol_writer) = ProtocolLogger::new(store.clone());

        let health = Arc::new(HealthMonitor::new(
            store.clone(),
            events.clone(),
            config.clone(),
            link.clone(),
        ));
        let scheduler = Arc::new(Scheduler::new(
            store.clone(),
            events.clone(),
            config.clone(),
            health.clone(),
        ));
        let healer = Arc::new(SelfHealingMonitor::new(
            store.clone(),
            events.clone(),
            config.clone(),
            link.clone(),
        ));
        let payloads = Arc::new(PayloadManager::new(
            store.clone(),
            events.clone(),
            config.clone(),
            link.clone(),
        ));
        let releases = Arc::new(ReleaseManager::new(
            store.clone(),
            events.clone(),
            config.clone(),
        ));

        let state = AppState {
            store,
            config: config.clone(),
            events,
            scheduler: scheduler.clone(),
            health,
            healer: healer.clone(),
            payloads,
            releases,
            link,
            protocol,
            admin_key,
            started_at: now_ts(),
        };

        // Writers: spawned once, drained on shutdown.
        let event_writer_shutdown = event_writer.shutdown_handle();
        let event_writer_handle = tokio::spawn(event_writer.run());
        let protocol_writer_shutdown = protocol_writer.shutdown_handle();
        let protocol_writer_handle = tokio::spawn(protocol_writer.run());

        // Supervised loops.
        let scheduler_shutdown = scheduler.shutdown_handle();
        let maintenance_handle = spawn_supervised("scheduler-maintenance", {
            let scheduler = scheduler.clone();
            move || {
                let scheduler = scheduler.clone();
                async move { scheduler.run_maintenance().await }
            }
        });

        let healer_shutdown = healer.shutdown_handle();
        let healer_handle = if config.probe_interval.is_zero() {
            info!("Self-healing monitor disabled (probe interval 0)");
            None
        } else {
            Some(spawn_supervised("self-healing", {
                let healer = healer.clone();
                move || {
                    let healer = healer.clone();
                    async move { healer.run().await }
                }
            }))
        };

        // Listeners.
        let public_addr = SocketAddr::from(([0, 0, 0, 0], config.public_port));
        let admin_addr = SocketAddr::from(([0, 0, 0, 0], config.admin_port));
        let (server_shutdown_tx, server_shutdown_rx) = watch::channel(false);

        let public_handle = serve(
            public_addr,
            public_router(state.clone()),
            server_shutdown_rx.clone(),
        )
        .await?;
        let admin_handle = serve(admin_addr, admin_router(state.clone()), server_shutdown_rx).await?;

        info!(
            public = %public_addr,
            admin = %admin_addr,
            "Control plane listening"
        );

        Ok(SwarmRuntime {
            state,
            public_handle,
            admin_handle,
            maintenance_handle,
            healer_handle,
            event_writer_handle,
            protocol_writer_handle,
            server_shutdown_tx,
            scheduler_shutdown,
            healer_shutdown,
            event_writer_shutdown,
            protocol_writer_shutdown,
        })
    }
}

/// A running control plane.
pub struct SwarmRuntime {
    state: AppState,
    public_handle: JoinHandle<()>,
    admin_handle: JoinHandle<()>,
    maintenance_handle: JoinHandle<()>,
    healer_handle: Option<JoinHandle<()>>,
    event_writer_handle: JoinHandle<()>,
    protocol_writer_handle: JoinHandle<()>,
    server_shutdown_tx: watch::Sender<bool>,
    scheduler_shutdown: Arc<Notify>,
    healer_shutdown: Arc<Notify>,
    event_writer_shutdown: Arc<Notify>,
    protocol_writer_shutdown: Arc<Notify>,
}

impl SwarmRuntime {
    /// Create a new builder.
    pub fn builder() -> SwarmRuntimeBuilder {
        SwarmRuntimeBuilder::new()
    }

    /// Shared handler state (tests).
    pub fn state(&self) -> &AppState {
        &self.state
    }

    /// Gracefully stop everything: listeners first, then the loops, then
    /// drain the writers.
    pub async fn shutdown(self) {
        info!("Control plane shutting down");

        let _ = self.server_shutdown_tx.send(true);
        self.scheduler_shutdown.notify_one();
        self.healer_shutdown.notify_one();

        let _ = self.public_handle.await;
        let _ = self.admin_handle.await;
        let _ = self.maintenance_handle.await;
        if let Some(handle) = self.healer_handle {
            let _ = handle.await;
        }

        // Writers last so events emitted during shutdown still land.
        self.event_writer_shutdown.notify_one();
        self.protocol_writer_shutdown.notify_one();
        let _ = self.event_writer_handle.await;
        let _ = self.protocol_writer_handle.await;

        info!("Control plane shut down");
    }
}

async fn serve(
    addr: SocketAddr,
    router: axum::Router,
    mut shutdown_rx: watch::Receiver<bool>,
) -> Result<JoinHandle<()>, StartupError> {
    let listener = TcpListener::bind(addr)
        .await
        .map_err(|e| StartupError::Bind(addr, e))?;

    let handle = tokio::spawn(async move {
        let server = axum::serve(
            listener,
            router.into_make_service_with_connect_info::<SocketAddr>(),
        )
        .with_graceful_shutdown(async move {
            let _ = shutdown_rx.wait_for(|stop| *stop).await;
        });
        if let Err(e) = server.await {
            error!(addr = %addr, error = %e, "Listener failed");
        }
    });
    Ok(handle)
}

/// Spawn a restartable loop under supervision. A clean exit (shutdown)
/// ends supervision; a panic restarts the loop with exponential backoff
/// capped at one minute.
fn spawn_supervised<F, Fut>(name: &'static str, factory: F) -> JoinHandle<()>
where
    F: Fn() -> Fut + Send + Sync + 'static,
    Fut: Future<Output = ()> + Send + 'static,
{
    tokio::spawn(async move {
        let mut backoff = Duration::from_secs(1);
        loop {
            let handle = tokio::spawn(factory());
            match handle.await {
                Ok(()) => break,
                Err(e) => {
                    warn!(task = name, error = %e, backoff_s = backoff.as_secs(), "Background loop crashed, restarting");
                    tokio::time::sleep(backoff).await;
                    backoff = (backoff * 2).min(Duration::from_secs(60));
                }
            }
        }
    })
}

/// Resolve the admin key: environment first, then the persisted key
/// file, else generate one and persist it.
pub fn resolve_admin_key(config: &Config) -> Result<String, StartupError> {
    if let Some(key) = &config.admin_key {
        info!("Admin key loaded from environment");
        return Ok(key.clone());
    }

    let key_file = config.admin_key_file();
    match std::fs::read_to_string(&key_file) {
        Ok(contents) => {
            let key = contents.trim().to_string();
            if key.is_empty() {
                return Err(StartupError::AdminKey(format!(
                    "key file {} is empty",
                    key_file.display()
                )));
            }
            info!(path = %key_file.display(), "Admin key loaded from file");
            Ok(key)
        }
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            let key = uuid::Uuid::new_v4().simple().to_string();
            if let Some(parent) = key_file.parent() {
                std::fs::create_dir_all(parent).map_err(|e| {
                    StartupError::AdminKey(format!("cannot create {}: {e}", parent.display()))
                })?;
            }
            std::fs::write(&key_file, format!("{key}\n")).map_err(|e| {
                StartupError::AdminKey(format!("cannot persist {}: {e}", key_file.display()))
            })?;
            #[cfg(unix)]
            {
                use std::os::unix::fs::PermissionsExt;
                let _ = std::fs::set_permissions(&key_file, std::fs::Permissions::from_mode(0o600));
            }
            info!(path = %key_file.display(), "Admin key generated and saved");
            Ok(key)
        }
        Err(e) => Err(StartupError::AdminKey(format!(
            "cannot read {}: {e}",
            key_file.display()
        ))),
    }
}
