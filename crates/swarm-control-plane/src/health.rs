// Copyright (C) 2026 Build Swarm Contributors
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Drone circuit breaker: failure counting and grounding.
//!
//! Build failures raise a per-drone counter; at the ceiling the drone is
//! grounded for a cooldown and its delegated work is reclaimed.
//! Successes decay the counter. Upload failures are tracked on a
//! separate counter with their own threshold so a broken upload path
//! stops new assignments without poisoning build statistics.
//!
//! Grounding is independent of the self-healing escalation ladder: this
//! monitor reacts to build outcomes, the ladder reacts to probe results.

use std::sync::Arc;
use std::time::Duration;

use serde_json::json;
use tracing::{info, warn};

use swarm_core::store::nodes::Node;
use swarm_core::types::now_ts;
use swarm_core::{Config, EventBus, Store};

use crate::error::Result;
use crate::link::{LinkRunner, LinkTarget};

/// Circuit breaker and health bookkeeping for drones.
pub struct HealthMonitor {
    store: Store,
    events: EventBus,
    config: Arc<Config>,
    link: Arc<dyn LinkRunner>,
}

impl HealthMonitor {
    /// Create a new monitor.
    pub fn new(
        store: Store,
        events: EventBus,
        config: Arc<Config>,
        link: Arc<dyn LinkRunner>,
    ) -> Self {
        Self {
            store,
            events,
            config,
            link,
        }
    }

    /// Whether the drone is grounded and must not receive work. Handles
    /// cooldown expiry and first-time grounding side effects.
    pub async fn check_grounded(&self, node: &Node) -> Result<bool> {
        let health = self.store.drone_health(&node.id).await?;
        let ceiling = self
            .store
            .max_failures_override(&node.name)
            .await?
            .unwrap_or(self.config.max_failures);

        if health.failures < ceiling {
            return Ok(false);
        }

        let now = now_ts();
        if let Some(until) = health.grounded_until {
            if now >= until {
                self.store.reset_drone_health(Some(&node.id)).await?;
                info!(drone = %node.name, "Grounding cooldown expired, health reset");
                return Ok(false);
            }
            return Ok(true);
        }

        // First time at the ceiling: start the grounding period.
        let until = now + self.config.grounding_timeout.as_secs_f64();
        self.store.ground_drone(&node.id, until).await?;
        warn!(
            drone = %node.name,
            failures = health.failures,
            cooldown_secs = self.config.grounding_timeout.as_secs(),
            "Drone grounded"
        );
        self.events.publish(
            "grounded",
            format!(
                "{} grounded ({} failures, {}s cooldown)",
                node.name,
                health.failures,
                self.config.grounding_timeout.as_secs()
            ),
            Some(json!({
                "failures": health.failures,
                "cooldown_secs": self.config.grounding_timeout.as_secs(),
            })),
            Some(&node.name),
            None,
        );

        self.reclaim_drone_work(node).await?;

        if health.rebooted == 0 {
            self.maybe_reboot(node).await?;
        }

        Ok(true)
    }

    /// Record a successful build: decay the failure counter and clear the
    /// upload streak.
    pub async fn record_success(&self, node_id: &str) -> Result<()> {
        self.store.decay_drone_failures(node_id).await?;
        self.store.reset_upload_failures(node_id).await?;
        Ok(())
    }

    /// Record a build failure.
    pub async fn record_failure(&self, node_id: &str) -> Result<i64> {
        let record = self.store.record_drone_failure(node_id).await?;
        Ok(record.failures)
    }

    /// Record an artifact upload failure.
    pub async fn record_upload_failure(&self, node_id: &str) -> Result<()> {
        self.store.record_upload_failure(node_id).await?;
        Ok(())
    }

    /// Whether the drone's upload path is considered broken right now.
    pub async fn is_upload_impaired(&self, node_id: &str) -> Result<bool> {
        let impaired = self
            .store
            .is_upload_impaired(
                node_id,
                self.config.max_upload_failures,
                self.config.upload_retry.as_secs_f64(),
            )
            .await?;
        Ok(impaired)
    }

    /// Manually reset the circuit breaker for one drone, or all drones.
    pub async fn unground(&self, node_id: Option<&str>) -> Result<()> {
        self.store.reset_drone_health(node_id).await?;
        match node_id {
            Some(id) => {
                let name = self.store.drone_name(id).await;
                info!(drone = %name, "Manually ungrounded");
            }
            None => info!("All drones manually ungrounded"),
        }
        Ok(())
    }

    async fn reclaim_drone_work(&self, node: &Node) -> Result<()> {
        let items = self.store.delegated_items(Some(&node.id)).await?;
        for item in &items {
            self.store.reclaim_package(&item.package).await?;
            warn!(package = %item.package, drone = %node.name, "Reclaimed from grounded drone");
            self.events.publish(
                "reclaim",
                format!("{} reclaimed from grounded {}", item.package, node.name),
                None,
                Some(&node.name),
                Some(&item.package),
            );
        }
        if !items.is_empty() {
            info!(drone = %node.name, count = items.len(), "Reclaimed work from grounded drone");
        }
        Ok(())
    }

    /// One-shot reboot when the circuit breaker trips, gated by kind,
    /// config consent and the protected flag.
    async fn maybe_reboot(&self, node: &Node) -> Result<()> {
        if !node.drone_kind().reboot_allowed() {
            return Ok(());
        }
        if !self.store.auto_reboot_allowed(&node.name).await? {
            return Ok(());
        }
        if let Some(config) = self.store.get_drone_config(&node.name).await? {
            if config.protected != 0 {
                warn!(drone = %node.name, "Refusing reboot: drone is protected");
                return Ok(());
            }
        }
        let Some(ip) = node.ip.clone() else {
            return Ok(());
        };

        let ssh = self.store.ssh_settings(&node.name).await?;
        let target = LinkTarget {
            name: node.name.clone(),
            host: ip,
            user: ssh.user,
            port: ssh.port,
            key_path: ssh.key_path,
            connect_timeout: self.config.ssh_connect_timeout,
        };

        self.store.mark_drone_rebooted(&node.id).await?;
        warn!(drone = %node.name, "Reboot triggered by circuit breaker");
        self.events.publish(
            "reboot",
            format!("{} rebooted (circuit breaker)", node.name),
            None,
            Some(&node.name),
            None,
        );

        // Fire and forget: the reboot drops the connection.
        let link = self.link.clone();
        let op_timeout = Duration::from_secs(10);
        tokio::spawn(async move {
            let _ = link.run(&target, "reboot", op_timeout).await;
        });
        Ok(())
    }
}
