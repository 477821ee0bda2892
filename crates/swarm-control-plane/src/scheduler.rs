// Copyright (C) 2026 Build Swarm Contributors
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Work scheduler: assignment, completion, reclaim and rebalance.
//!
//! The scheduler answers drone work-requests directly and runs a short
//! maintenance tick in the background. All decisions are expressed as
//! explicit results ([`AssignResult`], [`CompletionResult`]) so the HTTP
//! layer never has to infer what happened.
//!
//! Reclaim and leases are two distinct policies on purpose:
//! - *offline reclaim* returns items whose assignee has not heartbeated
//!   for a long time (default 15 min);
//! - *lease reclaim* fires earlier (default 10 min after assignment) but
//!   only when the assignee is unresponsive to BOTH the heartbeat and
//!   the SSH probe. An item held by a drone with a fresh heartbeat is
//!   never reclaimed just for being slow.

use std::sync::Arc;
use std::time::Duration;

use serde_json::json;
use tokio::sync::Notify;
use tracing::{debug, error, info, warn};

use swarm_core::store::nodes::Node;
use swarm_core::store::queue::{CompletionPolicy, QueueItem};
use swarm_core::types::{
    now_ts, AssignResult, CompletionResult, CompletionStatus, RejectReason,
};
use swarm_core::{Config, EventBus, Store};

use crate::error::Result;
use crate::health::HealthMonitor;

/// How many candidates to pull per assignment attempt; extras cover
/// races with concurrent work-requests.
const CANDIDATE_BATCH: i64 = 20;

/// Maintenance tick cadence.
const TICK: Duration = Duration::from_secs(1);

/// Prune old events/protocol rows every this many ticks.
const PRUNE_EVERY: u64 = 300;

/// Work scheduler.
pub struct Scheduler {
    store: Store,
    events: EventBus,
    config: Arc<Config>,
    health: Arc<HealthMonitor>,
    shutdown: Arc<Notify>,
}

impl Scheduler {
    /// Create a new scheduler.
    pub fn new(
        store: Store,
        events: EventBus,
        config: Arc<Config>,
        health: Arc<HealthMonitor>,
    ) -> Self {
        Self {
            store,
            events,
            config,
            health,
            shutdown: Arc::new(Notify::new()),
        }
    }

    /// Handle used to signal shutdown of the maintenance loop.
    pub fn shutdown_handle(&self) -> Arc<Notify> {
        self.shutdown.clone()
    }

    // ── Assignment ────────────────────────────────────────────────────

    /// Answer a work-request from a drone.
    pub async fn get_work(&self, drone_id: &str) -> Result<AssignResult> {
        if self.store.is_paused().await? {
            return Ok(AssignResult::Rejected(RejectReason::QueuePaused));
        }

        let Some(node) = self.store.get_node(drone_id).await? else {
            return Ok(AssignResult::Rejected(RejectReason::UnknownDrone));
        };
        if node.is_paused() {
            return Ok(AssignResult::Rejected(RejectReason::DronePaused));
        }
        if !node.is_online() {
            return Ok(AssignResult::Rejected(RejectReason::Offline));
        }
        if self.health.check_grounded(&node).await? {
            return Ok(AssignResult::Rejected(RejectReason::Grounded));
        }
        if self.health.is_upload_impaired(drone_id).await? {
            debug!(drone = %node.name, "Upload-impaired, no work");
            return Ok(AssignResult::Rejected(RejectReason::UploadImpaired));
        }

        let held = self.store.delegated_count(drone_id).await?;
        if held >= self.config.max_prefetch_per_drone {
            return Ok(AssignResult::Empty);
        }

        if self.is_sweeper(&node) {
            return self.assign_sweeper_work(&node).await;
        }

        let candidates = self
            .store
            .assignment_candidates(
                drone_id,
                2,
                self.config.failure_age.as_secs_f64(),
                CANDIDATE_BATCH,
            )
            .await?;

        for candidate in &candidates {
            if self.store.try_assign(candidate.id, drone_id).await? {
                info!(package = %candidate.package, drone = %node.name, "Assigned");
                self.events.publish(
                    "assign",
                    format!("{} assigned to {}", candidate.package, node.name),
                    None,
                    Some(&node.name),
                    Some(&candidate.package),
                );
                return Ok(AssignResult::Assigned(candidate.package.clone()));
            }
        }

        // Nothing needed. An idle drone may steal one queued item from
        // an overloaded donor.
        if held == 0 {
            if let Some(package) = self.steal_one(&node).await? {
                return Ok(AssignResult::Assigned(package));
            }
        }

        Ok(AssignResult::Empty)
    }

    /// Sweepers take blocked packages as a last resort.
    async fn assign_sweeper_work(&self, node: &Node) -> Result<AssignResult> {
        let blocked = self.store.queue_items("blocked", CANDIDATE_BATCH).await?;
        for item in &blocked {
            if self.store.try_assign_blocked(item.id, &node.id).await? {
                info!(package = %item.package, drone = %node.name, "Blocked package assigned to sweeper");
                self.events.publish(
                    "assign",
                    format!("{} assigned to sweeper {}", item.package, node.name),
                    Some(json!({ "sweeper": true })),
                    Some(&node.name),
                    Some(&item.package),
                );
                return Ok(AssignResult::Assigned(item.package.clone()));
            }
        }
        Ok(AssignResult::Empty)
    }

    /// Steal one queued (not actively-building) item from the deepest
    /// eligible donor queue. The donor always retains at least one item.
    async fn steal_one(&self, thief: &Node) -> Result<Option<String>> {
        let delegated = self.store.delegated_items(None).await?;

        let mut by_donor: std::collections::HashMap<&str, Vec<&QueueItem>> =
            std::collections::HashMap::new();
        for item in &delegated {
            if let Some(owner) = item.assigned_to.as_deref() {
                if owner != thief.id {
                    by_donor.entry(owner).or_default().push(item);
                }
            }
        }

        let mut donors: Vec<(&str, Vec<&QueueItem>)> = by_donor.into_iter().collect();
        donors.sort_by_key(|(_, items)| std::cmp::Reverse(items.len()));

        for (donor_id, mut items) in donors {
            if items.len() <= 1 {
                continue;
            }
            let Some(donor) = self.store.get_node(donor_id).await? else {
                continue;
            };
            if !donor.is_online() || self.is_sweeper(&donor) {
                continue;
            }

            // Steal newest first; never an item the donor is building.
            items.sort_by(|a, b| {
                b.assigned_at
                    .unwrap_or(0.0)
                    .total_cmp(&a.assigned_at.unwrap_or(0.0))
            });
            for item in items {
                if item.building_since.is_some() {
                    continue;
                }
                if donor.current_task.as_deref() == Some(item.package.as_str()) {
                    continue;
                }
                if self
                    .store
                    .reassign_item(item.id, donor_id, &thief.id)
                    .await?
                {
                    info!(
                        package = %item.package,
                        from = %donor.name,
                        to = %thief.name,
                        "Rebalanced"
                    );
                    self.events.publish(
                        "rebalance",
                        format!("{}: {} -> {}", item.package, donor.name, thief.name),
                        Some(json!({ "from": donor.name, "to": thief.name })),
                        Some(&thief.name),
                        Some(&item.package),
                    );
                    return Ok(Some(item.package.clone()));
                }
            }
        }
        Ok(None)
    }

    // ── Completion ────────────────────────────────────────────────────

    /// Apply a completion report from a drone.
    pub async fn complete(
        &self,
        drone_id: &str,
        package: &str,
        status: CompletionStatus,
        duration_seconds: f64,
        error_detail: Option<&str>,
    ) -> Result<CompletionResult> {
        let drone_name = self.store.drone_name(drone_id).await;
        let policy = CompletionPolicy {
            distinct_drone_limit: 2,
            max_package_failures: self.config.max_package_failures,
            failure_window_secs: self.config.failure_age.as_secs_f64(),
        };

        let outcome = self
            .store
            .complete_package(
                package,
                drone_id,
                &drone_name,
                status,
                duration_seconds,
                error_detail,
                policy,
            )
            .await?;

        match outcome.result {
            CompletionResult::Stale | CompletionResult::AlreadyTerminal => {
                info!(
                    package,
                    drone = %drone_name,
                    status = status.as_str(),
                    reason = ?outcome.result,
                    "Discarding stale completion"
                );
                self.events.publish(
                    "stale-completion",
                    format!("{package} stale {} from {drone_name} (discarded)", status.as_str()),
                    Some(json!({ "status": status.as_str() })),
                    Some(&drone_name),
                    Some(package),
                );
                return Ok(outcome.result);
            }
            CompletionResult::Accepted => {}
        }

        match status {
            CompletionStatus::Success => {
                self.health.record_success(drone_id).await?;
                info!(package, drone = %drone_name, duration_s = duration_seconds, "Received");
                self.events.publish(
                    "complete",
                    format!("{package} completed on {drone_name} in {duration_seconds:.1}s"),
                    Some(json!({ "duration_s": duration_seconds })),
                    Some(&drone_name),
                    Some(package),
                );
            }
            CompletionStatus::Returned => {
                info!(package, drone = %drone_name, "Returned");
                self.events.publish(
                    "return",
                    format!("{package} returned by {drone_name}"),
                    Some(json!({ "reason": error_detail.unwrap_or("unspecified") })),
                    Some(&drone_name),
                    Some(package),
                );
            }
            CompletionStatus::UploadFailed => {
                self.health.record_upload_failure(drone_id).await?;
                warn!(package, drone = %drone_name, "Upload failed");
                self.events.publish(
                    "upload-failed",
                    format!("{package} upload failed from {drone_name}"),
                    None,
                    Some(&drone_name),
                    Some(package),
                );
            }
            CompletionStatus::Failed => {
                self.health.record_failure(drone_id).await?;
                warn!(package, drone = %drone_name, error = ?error_detail, "Build failed");
                self.events.publish(
                    "fail",
                    format!("{package} failed on {drone_name}"),
                    Some(json!({
                        "error": error_detail.map(|e| e.chars().take(200).collect::<String>()),
                    })),
                    Some(&drone_name),
                    Some(package),
                );
                if let Some(distinct) = outcome.blocked_distinct_drones {
                    warn!(package, distinct_drones = distinct, "Blocked across drones");
                    self.events.publish(
                        "blocked",
                        format!("{package} blocked (failed on {distinct} drones)"),
                        Some(json!({ "distinct_drones": distinct })),
                        None,
                        Some(package),
                    );
                }
            }
        }

        self.store.clear_current_task(drone_id, package).await?;

        if let Some(session_id) = outcome.session_id.as_deref() {
            let closed = self.store.rollup_session(session_id).await?;
            if closed {
                info!(session = session_id, "Session completed");
                self.events.publish(
                    "session",
                    format!("Session {session_id} completed"),
                    None,
                    None,
                    None,
                );
            }
        }

        Ok(CompletionResult::Accepted)
    }

    // ── Maintenance ───────────────────────────────────────────────────

    /// Run the maintenance loop until shutdown.
    pub async fn run_maintenance(self: Arc<Self>) {
        info!(tick_secs = TICK.as_secs(), "Scheduler maintenance loop started");
        let mut tick: u64 = 0;
        loop {
            tokio::select! {
                biased;

                _ = self.shutdown.notified() => {
                    info!("Scheduler maintenance loop received shutdown signal");
                    break;
                }

                _ = tokio::time::sleep(TICK) => {
                    tick += 1;
                    if let Err(e) = self.maintenance_tick().await {
                        error!(error = %e, "Maintenance tick failed");
                    }
                    if tick % PRUNE_EVERY == 0 {
                        self.prune().await;
                    }
                }
            }
        }
        info!("Scheduler maintenance loop stopped");
    }

    /// One maintenance pass: node staleness, reclaims, aged unblocks.
    pub async fn maintenance_tick(&self) -> Result<()> {
        self.store
            .mark_stale_nodes_offline(self.config.node_timeout.as_secs_f64())
            .await?;
        self.reclaim_stale_work().await?;

        let aged = self
            .store
            .unblock_aged(now_ts() - self.config.failure_age.as_secs_f64())
            .await?;
        if aged > 0 {
            info!(count = aged, "Auto-unblocked aged packages");
            self.events.publish(
                "unblock",
                format!("{aged} packages auto-unblocked after cooldown"),
                Some(json!({ "count": aged })),
                None,
                None,
            );
        }
        Ok(())
    }

    /// Reclaim delegated items per the two policies described in the
    /// module docs.
    pub async fn reclaim_stale_work(&self) -> Result<u64> {
        let now = now_ts();
        let offline_cutoff = now - self.config.reclaim_offline.as_secs_f64();
        let lease_cutoff = now - self.config.reclaim_lease.as_secs_f64();
        let heartbeat_stale = now - self.config.node_timeout.as_secs_f64();

        let mut reclaimed = 0;
        for item in self.store.delegated_items(None).await? {
            let Some(drone_id) = item.assigned_to.as_deref() else {
                continue;
            };
            let node = self.store.get_node(drone_id).await?;

            let (last_seen, drone_name) = match &node {
                Some(n) => (n.last_seen.unwrap_or(0.0), n.name.clone()),
                None => (0.0, drone_id.chars().take(12).collect()),
            };

            let reason = if node.is_none() || last_seen < offline_cutoff {
                Some("drone offline")
            } else if item.assigned_at.unwrap_or(now) < lease_cutoff
                && last_seen < heartbeat_stale
                && self.probe_unresponsive(drone_id).await?
            {
                Some("lease expired, drone unresponsive")
            } else {
                None
            };

            if let Some(reason) = reason {
                if self.store.reclaim_package(&item.package).await? {
                    warn!(package = %item.package, drone = %drone_name, reason, "Reclaimed");
                    self.events.publish(
                        "reclaim",
                        format!("{} reclaimed from {} ({})", item.package, drone_name, reason),
                        Some(json!({ "reason": reason })),
                        Some(&drone_name),
                        Some(&item.package),
                    );
                    reclaimed += 1;
                }
            }
        }
        Ok(reclaimed)
    }

    /// Whether the last stored probe for this drone failed. No probe data
    /// means the probe cannot vouch for unresponsiveness.
    async fn probe_unresponsive(&self, drone_id: &str) -> Result<bool> {
        let health = self.store.drone_health(drone_id).await?;
        let Some(raw) = health.last_probe_result else {
            return Ok(false);
        };
        let status = serde_json::from_str::<serde_json::Value>(&raw)
            .ok()
            .and_then(|v| v.get("status").and_then(|s| s.as_str().map(String::from)));
        Ok(!matches!(status.as_deref(), Some("ok") | None))
    }

    async fn prune(&self) {
        if let Err(e) = self.store.prune_events(7.0 * 86_400.0).await {
            error!(error = %e, "Event prune failed");
        }
        if let Err(e) = self.store.prune_protocol_log(86_400.0).await {
            error!(error = %e, "Protocol log prune failed");
        }
    }

    fn is_sweeper(&self, node: &Node) -> bool {
        node.node_type == "sweeper"
            || node
                .name
                .to_lowercase()
                .starts_with(&self.config.sweeper_prefix.to_lowercase())
    }
}
