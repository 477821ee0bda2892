// Copyright (C) 2026 Build Swarm Contributors
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Self-healing drone monitor.
//!
//! A background loop probes every drone over SSH and walks an
//! escalation ladder when a drone stays unhealthy:
//!
//! | Level | Action | Cooldown |
//! |-------|--------------------------------|----------|
//! | 0     | healthy                        | none     |
//! | 1     | restart the worker service     | 30 s     |
//! | 2     | kill the worker and restart    | 30 s     |
//! | 3     | reboot the host (container/vm) | 120 s    |
//! | 4     | alert the admin                | none     |
//!
//! Escalation fires only when BOTH guards hold: enough consecutive probe
//! failures and enough time since the first failure of the streak. A
//! fresh control-plane heartbeat inside one probe interval suppresses
//! escalation even while SSH is failing, so an asymmetric network fault
//! cannot trigger a restart storm. Disk-space warnings never escalate.
//! Bare-metal and unknown hosts stop at level 2.
//!
//! Per-drone cooldowns and streaks live in one map owned by this
//! monitor; the level is mirrored to the store for dashboards.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use serde::Serialize;
use serde_json::json;
use tokio::sync::{Mutex, Notify};
use tracing::{debug, error, info, warn};

use swarm_core::store::nodes::Node;
use swarm_core::types::now_ts;
use swarm_core::{Config, EventBus, Store};

use crate::error::Result;
use crate::link::{LinkRunner, LinkTarget};

/// Probe command timeout, deliberately shorter than the general SSH
/// operation budget so one dead drone cannot stall the probe cycle.
const PROBE_TIMEOUT: Duration = Duration::from_secs(15);

/// Escalation action timeout.
const ACTION_TIMEOUT: Duration = Duration::from_secs(30);

/// Highest ladder position.
const LEVEL_ALERT: i64 = 4;

/// Classified outcome of one SSH probe.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ProbeStatus {
    /// All checks within bounds.
    Ok,
    /// No worker process found.
    ServiceDown,
    /// Load average above threshold.
    Overloaded,
    /// Disk above 90%.
    DiskWarning,
    /// Disk above 95%.
    DiskCritical,
    /// Memory above 95%.
    MemoryCritical,
    /// SSH reached the host but the command failed.
    Unreachable,
    /// SSH timed out.
    Timeout,
    /// Probe machinery failed.
    Error,
}

impl ProbeStatus {
    /// Healthy result: resets the ladder.
    pub fn is_ok(&self) -> bool {
        matches!(self, Self::Ok)
    }

    /// Whether this status may drive escalation.
    pub fn escalates(&self) -> bool {
        !matches!(self, Self::Ok | Self::DiskWarning)
    }
}

/// Parsed probe measurements.
#[derive(Debug, Clone, Default, Serialize)]
pub struct ProbeChecks {
    /// Worker process count.
    pub procs: i64,
    /// One-minute load average.
    pub load: f64,
    /// Disk usage percent of the build cache filesystem.
    pub disk_percent: i64,
    /// Memory usage percent.
    pub mem_percent: i64,
    /// Host uptime in seconds.
    pub uptime_seconds: f64,
}

/// Result of one probe.
#[derive(Debug, Clone, Serialize)]
pub struct ProbeResult {
    /// Drone name.
    pub drone: String,
    /// Classified status.
    pub status: ProbeStatus,
    /// Parsed measurements (zeroed when unreachable).
    pub checks: ProbeChecks,
    /// Error detail for failed probes.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    /// Round trip in milliseconds.
    pub latency_ms: f64,
    /// When the probe ran.
    pub timestamp: f64,
}

/// Per-drone ladder state.
#[derive(Debug, Clone, Default, Serialize)]
pub struct EscalationState {
    /// Current ladder position.
    pub level: i64,
    /// Consecutive failed probes.
    pub consecutive_failures: u32,
    /// When the current failure streak started.
    pub first_failure_at: Option<f64>,
    /// When the last action fired.
    pub last_action_at: Option<f64>,
    /// Actions taken since the last reset.
    pub attempts: i64,
    /// A reboot was blocked by the safety gate; reported once.
    pub reboot_blocked: bool,
}

/// Autonomous drone recovery with a safe escalation ladder.
pub struct SelfHealingMonitor {
    store: Store,
    events: EventBus,
    config: Arc<Config>,
    link: Arc<dyn LinkRunner>,
    states: Mutex<HashMap<String, EscalationState>>,
    ping_seq: AtomicU64,
    shutdown: Arc<Notify>,
}

impl SelfHealingMonitor {
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
            states: Mutex::new(HashMap::new()),
            ping_seq: AtomicU64::new(0),
            shutdown: Arc::new(Notify::new()),
        }
    }

    /// Handle used to signal shutdown.
    pub fn shutdown_handle(&self) -> Arc<Notify> {
        self.shutdown.clone()
    }

    /// Run the probe loop. A zero probe interval disables the monitor
    /// entirely: no probes, no escalation.
    pub async fn run(self: Arc<Self>) {
        let interval = self.config.probe_interval;
        if interval.is_zero() {
            info!("Self-healing monitor disabled (probe interval 0)");
            return;
        }
        info!(
            probe_interval_secs = interval.as_secs(),
            min_consecutive = self.config.min_consecutive_failures,
            min_window_secs = self.config.min_failure_window.as_secs(),
            "Self-healing monitor started"
        );

        loop {
            tokio::select! {
                biased;

                _ = self.shutdown.notified() => {
                    info!("Self-healing monitor received shutdown signal");
                    break;
                }

                _ = tokio::time::sleep(interval) => {
                    if let Err(e) = self.probe_cycle().await {
                        error!(error = %e, "Probe cycle failed");
                    }
                }
            }
        }

        info!("Self-healing monitor stopped");
    }

    async fn probe_cycle(&self) -> Result<()> {
        let nodes = self.store.list_nodes(true).await?;
        for node in nodes {
            if node.is_paused() {
                continue;
            }
            let result = self.probe(&node).await;
            self.handle_probe_result(&node, &result).await?;
        }
        Ok(())
    }

    /// Send one SSH probe and classify the result.
    pub async fn probe(&self, node: &Node) -> ProbeResult {
        let started = Instant::now();
        let mut result = ProbeResult {
            drone: node.name.clone(),
            status: ProbeStatus::Error,
            checks: ProbeChecks::default(),
            error: None,
            latency_ms: 0.0,
            timestamp: now_ts(),
        };

        let Some(target) = self.link_target(node).await else {
            result.error = Some("no IP address".to_string());
            return result;
        };

        let command = concat!(
            "echo PROC=$(pgrep -c -f 'swarm-drone' 2>/dev/null || echo 0);",
            "echo LOAD=$(cat /proc/loadavg 2>/dev/null | cut -d' ' -f1 || echo 0);",
            "echo DISK=$(df /var/cache 2>/dev/null | tail -1 | awk '{print $5}' | tr -d '%' || echo 0);",
            "echo MEM=$(free -m 2>/dev/null | awk '/^Mem:/{printf \"%.0f\", $3/$2*100}' || echo 0);",
            "echo UPTIME=$(cat /proc/uptime 2>/dev/null | cut -d' ' -f1 || echo 0)",
        );

        match self.link.run(&target, command, PROBE_TIMEOUT).await {
            Ok(output) if output.success() => {
                result.checks = parse_checks(&output.stdout);
                result.status = classify(&result.checks);
            }
            Ok(output) => {
                result.status = ProbeStatus::Unreachable;
                let stderr: String = output.stderr.chars().take(200).collect();
                result.error = Some(if stderr.is_empty() {
                    "SSH failed".to_string()
                } else {
                    stderr
                });
            }
            Err(crate::link::LinkError::Timeout(_)) => {
                result.status = ProbeStatus::Timeout;
            }
            Err(e) => {
                result.status = ProbeStatus::Error;
                result.error = Some(e.to_string());
            }
        }

        result.latency_ms = started.elapsed().as_secs_f64() * 1000.0;
        result
    }

    /// Apply one probe result to the ladder.
    pub async fn handle_probe_result(&self, node: &Node, result: &ProbeResult) -> Result<()> {
        self.evaluate_at(node, result, now_ts()).await
    }

    async fn evaluate_at(&self, node: &Node, result: &ProbeResult, now: f64) -> Result<()> {
        if let Ok(json) = serde_json::to_string(result) {
            self.store.store_probe_result(&node.id, &json).await?;
        }

        if result.status.is_ok() {
            let old_level = {
                let mut states = self.states.lock().await;
                states.remove(&node.id).map(|s| s.level).unwrap_or(0)
            };
            if old_level > 0 {
                info!(drone = %node.name, old_level, "Drone recovered");
                self.events.publish(
                    "heal",
                    format!("{} recovered from escalation level {old_level}", node.name),
                    Some(json!({ "old_level": old_level })),
                    Some(&node.name),
                    None,
                );
                self.store.reset_escalation_state(&node.id).await?;
            }
            return Ok(());
        }

        if !result.status.escalates() {
            debug!(drone = %node.name, status = ?result.status, "Probe warning, not escalating");
            return Ok(());
        }

        // A fresh heartbeat means the drone is alive and talking to us;
        // the SSH path is what is broken. Never escalate on that.
        if let Some(last_seen) = node.last_seen {
            if now - last_seen < self.config.probe_interval.as_secs_f64() {
                debug!(drone = %node.name, "Escalation suppressed by fresh heartbeat");
                return Ok(());
            }
        }

        let mut states = self.states.lock().await;
        let state = states.entry(node.id.clone()).or_default();
        state.consecutive_failures += 1;
        let first_failure = *state.first_failure_at.get_or_insert(now);

        if state.consecutive_failures < self.config.min_consecutive_failures
            || now - first_failure < self.config.min_failure_window.as_secs_f64()
        {
            return Ok(());
        }

        if state.level >= LEVEL_ALERT {
            return Ok(());
        }

        // Cooldown gates leaving the current level.
        if let Some(last_action) = state.last_action_at {
            if now - last_action < cooldown_secs(state.level) {
                return Ok(());
            }
        }

        let next_level = state.level + 1;
        if next_level == 3 {
            let reboot_ok = node.drone_kind().reboot_allowed()
                && self.store.auto_reboot_allowed(&node.name).await?;
            if !reboot_ok {
                if !state.reboot_blocked {
                    state.reboot_blocked = true;
                    warn!(drone = %node.name, kind = %node.kind, "Reboot blocked, holding at level 2");
                    self.events.publish(
                        "bare-metal-protected",
                        format!(
                            "Reboot blocked for {} ({}) - holding at level 2",
                            node.name, node.kind
                        ),
                        Some(json!({ "kind": node.kind })),
                        Some(&node.name),
                        None,
                    );
                }
                return Ok(());
            }
        }

        state.level = next_level;
        state.last_action_at = Some(now);
        state.attempts += 1;
        let attempts = state.attempts;
        drop(states);

        self.store
            .update_escalation_state(&node.id, next_level, attempts)
            .await?;

        warn!(
            drone = %node.name,
            level = next_level,
            status = ?result.status,
            "Escalating"
        );
        self.events.publish(
            "escalate",
            format!(
                "{} escalated to level {next_level} ({})",
                node.name,
                action_name(next_level)
            ),
            Some(json!({
                "level": next_level,
                "action": action_name(next_level),
                "probe_status": result.status,
            })),
            Some(&node.name),
            None,
        );

        self.execute_action(node, next_level, result).await;
        Ok(())
    }

    async fn execute_action(&self, node: &Node, level: i64, result: &ProbeResult) {
        match level {
            1 => {
                self.run_remote(
                    node,
                    "rc-service swarm-drone restart 2>&1 || systemctl restart swarm-drone 2>&1",
                    "service restart",
                )
                .await;
            }
            2 => {
                self.run_remote(
                    node,
                    "pkill -9 -f 'swarm-drone' 2>/dev/null; sleep 2; \
                     rc-service swarm-drone start 2>&1 || systemctl start swarm-drone 2>&1",
                    "hard restart",
                )
                .await;
            }
            3 => {
                // Fire and forget: the reboot drops the SSH connection.
                if let Some(target) = self.link_target(node).await {
                    let link = self.link.clone();
                    warn!(drone = %node.name, "Rebooting host");
                    self.events.publish(
                        "reboot",
                        format!("{} rebooted (self-healing)", node.name),
                        None,
                        Some(&node.name),
                        None,
                    );
                    tokio::spawn(async move {
                        let _ = link.run(&target, "reboot", ACTION_TIMEOUT).await;
                    });
                }
            }
            _ => {
                error!(drone = %node.name, "Manual intervention required");
                self.events.publish(
                    "alert",
                    format!(
                        "MANUAL INTERVENTION REQUIRED: {} - {:?}",
                        node.name, result.status
                    ),
                    Some(json!({ "probe_status": result.status, "severity": "critical" })),
                    Some(&node.name),
                    None,
                );
            }
        }
    }

    async fn run_remote(&self, node: &Node, command: &str, what: &str) {
        let Some(target) = self.link_target(node).await else {
            error!(drone = %node.name, "Cannot {what}: no IP");
            return;
        };
        match self.link.run(&target, command, ACTION_TIMEOUT).await {
            Ok(output) => {
                info!(
                    drone = %node.name,
                    success = output.success(),
                    "{what} completed"
                );
            }
            Err(e) => {
                error!(drone = %node.name, error = %e, "{what} failed");
            }
        }
    }

    async fn link_target(&self, node: &Node) -> Option<LinkTarget> {
        let host = node.ip.clone()?;
        let ssh = self.store.ssh_settings(&node.name).await.ok()?;
        Some(LinkTarget {
            name: node.name.clone(),
            host,
            user: ssh.user,
            port: ssh.port,
            key_path: ssh.key_path,
            connect_timeout: self.config.ssh_connect_timeout,
        })
    }

    /// Snapshot of all non-zero escalation states, keyed by drone id.
    pub async fn escalation_states(&self) -> HashMap<String, EscalationState> {
        self.states.lock().await.clone()
    }

    /// Manually reset a drone's ladder position.
    pub async fn reset_escalation(&self, node_id: &str) -> Result<()> {
        self.states.lock().await.remove(node_id);
        self.store.reset_escalation_state(node_id).await?;
        let name = self.store.drone_name(node_id).await;
        info!(drone = %name, "Escalation reset");
        Ok(())
    }

    /// Explicit proof-of-life ping: probe the drone, refresh its ping
    /// bookkeeping and return the result.
    pub async fn ping(&self, node: &Node) -> PingReport {
        let seq = self.ping_seq.fetch_add(1, Ordering::Relaxed) + 1;
        let result = self.probe(node).await;
        if result.status.is_ok() {
            let _ = self.store.record_ping(&node.id, result.latency_ms).await;
        }
        PingReport { seq, result }
    }

    /// Ping every online drone.
    pub async fn ping_all(&self) -> Result<Vec<PingReport>> {
        let nodes = self.store.list_nodes(false).await?;
        let mut reports = Vec::with_capacity(nodes.len());
        for node in &nodes {
            reports.push(self.ping(node).await);
        }
        Ok(reports)
    }

    #[cfg(test)]
    pub(crate) async fn evaluate_for_test(
        &self,
        node: &Node,
        result: &ProbeResult,
        now: f64,
    ) -> Result<()> {
        self.evaluate_at(node, result, now).await
    }
}

/// A proof-of-life exchange.
#[derive(Debug, Clone, Serialize)]
pub struct PingReport {
    /// Monotonic ping sequence number.
    pub seq: u64,
    /// The underlying probe result.
    #[serde(flatten)]
    pub result: ProbeResult,
}

fn cooldown_secs(level: i64) -> f64 {
    match level {
        1 | 2 => 30.0,
        3 => 120.0,
        _ => 0.0,
    }
}

fn action_name(level: i64) -> &'static str {
    match level {
        1 => "restart_service",
        2 => "hard_restart",
        3 => "reboot",
        4 => "alert_admin",
        _ => "none",
    }
}

fn parse_checks(stdout: &str) -> ProbeChecks {
    let mut checks = ProbeChecks::default();
    for line in stdout.lines() {
        let Some((key, value)) = line.split_once('=') else {
            continue;
        };
        let value = value.trim();
        match key.trim() {
            "PROC" => checks.procs = value.parse().unwrap_or(0),
            "LOAD" => checks.load = value.parse().unwrap_or(0.0),
            "DISK" => checks.disk_percent = value.parse().unwrap_or(0),
            "MEM" => checks.mem_percent = value.parse().unwrap_or(0),
            "UPTIME" => checks.uptime_seconds = value.parse().unwrap_or(0.0),
            _ => {}
        }
    }
    checks
}

fn classify(checks: &ProbeChecks) -> ProbeStatus {
    if checks.procs == 0 {
        ProbeStatus::ServiceDown
    } else if checks.load > 50.0 {
        ProbeStatus::Overloaded
    } else if checks.disk_percent > 95 {
        ProbeStatus::DiskCritical
    } else if checks.disk_percent > 90 {
        ProbeStatus::DiskWarning
    } else if checks.mem_percent > 95 {
        ProbeStatus::MemoryCritical
    } else {
        ProbeStatus::Ok
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::link::mock::{MockResponse, MockRunner};
    use swarm_core::store::nodes::NodeRegistration;
    use swarm_core::types::DroneKind;

    async fn setup(kind: DroneKind) -> (Store, EventBus, Arc<MockRunner>, Arc<SelfHealingMonitor>) {
        let store = Store::open_in_memory().await.unwrap();
        let (events, _writer) = EventBus::new(store.clone());
        let mock = Arc::new(MockRunner::new());
        let config = Arc::new(Config::default());

        store
            .upsert_node(&NodeRegistration {
                id: "d1".to_string(),
                name: "drone-one".to_string(),
                ip: Some("10.0.0.11".to_string()),
                node_type: "drone".to_string(),
                ..Default::default()
            })
            .await
            .unwrap();
        store.set_node_kind("d1", kind).await.unwrap();

        let monitor = Arc::new(SelfHealingMonitor::new(
            store.clone(),
            events.clone(),
            config,
            mock.clone(),
        ));
        (store, events, mock, monitor)
    }

    fn failing(status: ProbeStatus) -> ProbeResult {
        ProbeResult {
            drone: "drone-one".to_string(),
            status,
            checks: ProbeChecks::default(),
            error: None,
            latency_ms: 100.0,
            timestamp: now_ts(),
        }
    }

    fn ok_result() -> ProbeResult {
        ProbeResult {
            drone: "drone-one".to_string(),
            status: ProbeStatus::Ok,
            checks: ProbeChecks {
                procs: 1,
                load: 0.5,
                disk_percent: 40,
                mem_percent: 30,
                uptime_seconds: 1000.0,
            },
            error: None,
            latency_ms: 50.0,
            timestamp: now_ts(),
        }
    }

    /// Node with a last_seen far enough in the past that the heartbeat
    /// suppression rule does not fire.
    async fn stale_node(store: &Store) -> Node {
        let mut node = store.get_node("d1").await.unwrap().unwrap();
        node.last_seen = Some(now_ts() - 3600.0);
        node
    }

    #[tokio::test]
    async fn both_guards_required_before_escalation() {
        let (store, _events, mock, monitor) = setup(DroneKind::Container).await;
        let node = stale_node(&store).await;
        let t0 = now_ts();

        // Three consecutive failures, but inside the minimum window:
        // still level 0.
        for i in 0..3 {
            monitor
                .evaluate_for_test(&node, &failing(ProbeStatus::Timeout), t0 + (i as f64) * 30.0)
                .await
                .unwrap();
        }
        assert!(monitor.escalation_states().await["d1"].level == 0);
        assert!(mock.calls_matching(None, "restart").is_empty());

        // After the window, the next failing probe escalates to level 1.
        monitor
            .evaluate_for_test(&node, &failing(ProbeStatus::Timeout), t0 + 180.0)
            .await
            .unwrap();
        let states = monitor.escalation_states().await;
        assert_eq!(states["d1"].level, 1);
        assert_eq!(mock.calls_matching(None, "restart").len(), 1);

        // Level is mirrored to the store.
        assert_eq!(store.drone_health("d1").await.unwrap().escalation_level, 1);
    }

    #[tokio::test]
    async fn fresh_heartbeat_suppresses_escalation() {
        let (store, _events, mock, monitor) = setup(DroneKind::Container).await;
        let mut node = store.get_node("d1").await.unwrap().unwrap();
        let t0 = now_ts();

        // SSH keeps failing but the drone heartbeats throughout: the
        // streak never starts and no action ever fires.
        for i in 0..10 {
            let now = t0 + (i as f64) * 30.0;
            node.last_seen = Some(now - 5.0);
            monitor
                .evaluate_for_test(&node, &failing(ProbeStatus::Timeout), now)
                .await
                .unwrap();
        }

        let level = monitor
            .escalation_states()
            .await
            .get("d1")
            .map(|s| s.level)
            .unwrap_or(0);
        assert_eq!(level, 0);
        assert!(mock.calls_matching(None, "restart").is_empty());
    }

    #[tokio::test]
    async fn ladder_walks_up_with_cooldowns() {
        let (store, _events, mock, monitor) = setup(DroneKind::Container).await;
        let node = stale_node(&store).await;
        let t0 = now_ts();

        // Satisfy both guards, reach level 1.
        for i in 0..3 {
            monitor
                .evaluate_for_test(&node, &failing(ProbeStatus::ServiceDown), t0 + (i as f64) * 30.0)
                .await
                .unwrap();
        }
        monitor
            .evaluate_for_test(&node, &failing(ProbeStatus::ServiceDown), t0 + 180.0)
            .await
            .unwrap();
        assert_eq!(monitor.escalation_states().await["d1"].level, 1);

        // Inside the 30s cooldown nothing moves.
        monitor
            .evaluate_for_test(&node, &failing(ProbeStatus::ServiceDown), t0 + 190.0)
            .await
            .unwrap();
        assert_eq!(monitor.escalation_states().await["d1"].level, 1);

        // Past the cooldown: level 2 (hard restart).
        monitor
            .evaluate_for_test(&node, &failing(ProbeStatus::ServiceDown), t0 + 211.0)
            .await
            .unwrap();
        assert_eq!(monitor.escalation_states().await["d1"].level, 2);
        assert_eq!(mock.calls_matching(None, "pkill").len(), 1);

        // Past the next cooldown: level 3 reboot for a container.
        monitor
            .evaluate_for_test(&node, &failing(ProbeStatus::ServiceDown), t0 + 242.0)
            .await
            .unwrap();
        assert_eq!(monitor.escalation_states().await["d1"].level, 3);
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(mock.calls_matching(None, "reboot").len(), 1);
    }

    #[tokio::test]
    async fn bare_metal_caps_at_level_two() {
        let (store, events, mock, monitor) = setup(DroneKind::BareMetal).await;
        let node = stale_node(&store).await;
        let t0 = now_ts();

        let mut t = t0;
        for _ in 0..3 {
            monitor
                .evaluate_for_test(&node, &failing(ProbeStatus::ServiceDown), t)
                .await
                .unwrap();
            t += 30.0;
        }
        // Walk well past every cooldown.
        for _ in 0..10 {
            t += 130.0;
            monitor
                .evaluate_for_test(&node, &failing(ProbeStatus::ServiceDown), t)
                .await
                .unwrap();
        }

        let states = monitor.escalation_states().await;
        assert_eq!(states["d1"].level, 2);
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(mock.calls_matching(None, "reboot").is_empty());

        // Exactly one bare-metal-protected event despite repeated ticks.
        let (tail, _) = events.tail(0, Some("bare-metal-protected"), 100);
        assert_eq!(tail.len(), 1);
    }

    #[tokio::test]
    async fn ok_probe_resets_ladder_and_emits_heal() {
        let (store, events, _mock, monitor) = setup(DroneKind::Container).await;
        let node = stale_node(&store).await;
        let t0 = now_ts();

        let mut t = t0;
        for _ in 0..3 {
            monitor
                .evaluate_for_test(&node, &failing(ProbeStatus::ServiceDown), t)
                .await
                .unwrap();
            t += 30.0;
        }
        monitor
            .evaluate_for_test(&node, &failing(ProbeStatus::ServiceDown), t0 + 180.0)
            .await
            .unwrap();
        assert_eq!(monitor.escalation_states().await["d1"].level, 1);

        monitor
            .evaluate_for_test(&node, &ok_result(), t0 + 210.0)
            .await
            .unwrap();
        assert!(monitor.escalation_states().await.is_empty());
        assert_eq!(store.drone_health("d1").await.unwrap().escalation_level, 0);

        let (tail, _) = events.tail(0, Some("heal"), 10);
        assert_eq!(tail.len(), 1);
    }

    #[tokio::test]
    async fn disk_warning_never_escalates() {
        let (store, _events, mock, monitor) = setup(DroneKind::Container).await;
        let node = stale_node(&store).await;
        let t0 = now_ts();

        for i in 0..20 {
            monitor
                .evaluate_for_test(&node, &failing(ProbeStatus::DiskWarning), t0 + (i as f64) * 30.0)
                .await
                .unwrap();
        }
        assert!(monitor.escalation_states().await.is_empty());
        assert!(mock.calls_matching(None, "restart").is_empty());
    }

    #[tokio::test]
    async fn classify_thresholds() {
        let mut checks = ProbeChecks {
            procs: 1,
            load: 1.0,
            disk_percent: 50,
            mem_percent: 50,
            uptime_seconds: 10.0,
        };
        assert_eq!(classify(&checks), ProbeStatus::Ok);

        checks.procs = 0;
        assert_eq!(classify(&checks), ProbeStatus::ServiceDown);
        checks.procs = 2;

        checks.load = 64.0;
        assert_eq!(classify(&checks), ProbeStatus::Overloaded);
        checks.load = 1.0;

        checks.disk_percent = 93;
        assert_eq!(classify(&checks), ProbeStatus::DiskWarning);
        checks.disk_percent = 97;
        assert_eq!(classify(&checks), ProbeStatus::DiskCritical);
        checks.disk_percent = 50;

        checks.mem_percent = 99;
        assert_eq!(classify(&checks), ProbeStatus::MemoryCritical);
    }

    #[tokio::test]
    async fn parse_checks_handles_probe_output() {
        let out = "PROC=2\nLOAD=1.25\nDISK=42\nMEM=77\nUPTIME=12345.67\nGARBAGE\n";
        let checks = parse_checks(out);
        assert_eq!(checks.procs, 2);
        assert_eq!(checks.load, 1.25);
        assert_eq!(checks.disk_percent, 42);
        assert_eq!(checks.mem_percent, 77);
        assert_eq!(checks.uptime_seconds, 12345.67);
    }

    #[tokio::test]
    async fn probe_classifies_mock_output() {
        let (store, _events, mock, monitor) = setup(DroneKind::Container).await;
        mock.script(
            None,
            "PROC=",
            MockResponse::Ok("PROC=1\nLOAD=0.3\nDISK=10\nMEM=20\nUPTIME=99\n".to_string()),
        );
        let node = store.get_node("d1").await.unwrap().unwrap();

        let result = monitor.probe(&node).await;
        assert_eq!(result.status, ProbeStatus::Ok);
        assert_eq!(result.checks.procs, 1);

        mock.script(None, "PROC=", MockResponse::Timeout);
        let result = monitor.probe(&node).await;
        assert_eq!(result.status, ProbeStatus::Timeout);
    }
}
