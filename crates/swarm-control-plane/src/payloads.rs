// Copyright (C) 2026 Build Swarm Contributors
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Versioned payload registry and deployer.
//!
//! Payloads are the drone-side artifacts the control plane pushes out:
//! the worker binary, its init script, and configuration files. Content
//! is addressed by SHA-256; small payloads live inline in the database,
//! large ones as blob files under the payload cache. Deploys stream the
//! bytes over SSH and verify by re-hashing the remote file, so drift is
//! always detected against the registered hash.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Instant;

use serde::Serialize;
use serde_json::json;
use sha2::{Digest, Sha256};
use tracing::{error, info, warn};

use swarm_core::store::payloads::PayloadVersion;
use swarm_core::{Config, CoreError, EventBus, Store};

use crate::error::{Error, Result};
use crate::link::{LinkRunner, LinkTarget};

/// Payloads stored inline up to this size; larger ones go to the cache
/// directory.
const INLINE_LIMIT: usize = 1024 * 1024;

/// Compute the hex SHA-256 of payload bytes.
pub fn content_hash(content: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(content);
    hex::encode(hasher.finalize())
}

/// Remote install path for a payload kind.
fn remote_path(kind: &str) -> String {
    match kind {
        "drone_binary" => "/usr/local/bin/swarm-drone".to_string(),
        "init_script" => "/etc/init.d/swarm-drone".to_string(),
        "config" => "/etc/swarm-drone/config.json".to_string(),
        "portage_config" => "/etc/portage/repos.conf/binhost.conf".to_string(),
        other => format!("/tmp/{other}"),
    }
}

fn is_executable(kind: &str) -> bool {
    matches!(kind, "drone_binary" | "init_script")
}

/// Result of one drone deploy attempt.
#[derive(Debug, Clone, Serialize)]
pub struct DeployResult {
    /// Whether the deploy (including verification) succeeded.
    pub success: bool,
    /// Human-readable outcome.
    pub message: String,
    /// Attempt duration.
    pub duration_ms: f64,
}

/// Result of a rolling deploy.
#[derive(Debug, Clone, Serialize)]
pub struct RollingReport {
    /// Drones deployed successfully.
    pub success_count: usize,
    /// Drones that failed.
    pub fail_count: usize,
    /// Drones never attempted because the roll-out stopped.
    pub skipped: Vec<String>,
    /// Per-drone outcomes.
    pub results: BTreeMap<String, DeployResult>,
    /// Drone that was reverted, with the version restored.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub rolled_back: Option<(String, String)>,
}

/// Result of a remote hash verification.
#[derive(Debug, Clone, Serialize)]
pub struct VerifyReport {
    /// Whether the remote hash matches the recorded one.
    pub matches: bool,
    /// Hash on record.
    pub expected: String,
    /// Hash observed on the drone (or an error description).
    pub remote: String,
}

/// Payload registry and deployer.
pub struct PayloadManager {
    store: Store,
    events: EventBus,
    config: Arc<Config>,
    link: Arc<dyn LinkRunner>,
}

impl PayloadManager {
    /// Create a new manager.
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

    /// Register a payload version from raw bytes.
    pub async fn register_version(
        &self,
        kind: &str,
        version: &str,
        content: &[u8],
        description: Option<&str>,
        created_by: Option<&str>,
    ) -> Result<PayloadVersion> {
        let hash = content_hash(content);

        let (blob, path) = if content.len() <= INLINE_LIMIT {
            (Some(content), None)
        } else {
            std::fs::create_dir_all(&self.config.payload_cache)?;
            let file = self.config.payload_cache.join(format!("{kind}-{version}"));
            std::fs::write(&file, content)?;
            (None, Some(file))
        };

        let record = self
            .store
            .create_payload_version(
                kind,
                version,
                &hash,
                blob,
                path.as_deref().and_then(Path::to_str),
                description,
                created_by,
            )
            .await?;

        info!(kind, version, bytes = content.len(), "Payload registered");
        Ok(record)
    }

    /// Fetch the content bytes of a registered version.
    pub async fn payload_content(&self, kind: &str, version: &str) -> Result<Vec<u8>> {
        if let Some(blob) = self.store.payload_content_blob(kind, version).await? {
            return Ok(blob);
        }
        let record = self
            .store
            .get_payload_version(kind, version)
            .await?
            .ok_or_else(|| CoreError::NotFound(format!("payload {kind} {version}")))?;
        let path = record
            .content_path
            .ok_or_else(|| Error::Other(format!("payload {kind} {version} has no content")))?;
        Ok(std::fs::read(PathBuf::from(path))?)
    }

    /// Deploy one version to one drone: transfer, chmod, verify, record.
    pub async fn deploy_to_drone(
        &self,
        drone_name: &str,
        kind: &str,
        version: &str,
        deployed_by: Option<&str>,
        verify: bool,
    ) -> Result<DeployResult> {
        let started = Instant::now();
        let outcome = self
            .try_deploy(drone_name, kind, version, deployed_by, verify)
            .await;
        let duration_ms = started.elapsed().as_secs_f64() * 1000.0;

        match outcome {
            Ok(()) => {
                self.store
                    .log_payload_deploy(
                        &self.drone_id_of(drone_name).await?,
                        kind,
                        version,
                        "deploy",
                        "success",
                        Some(duration_ms),
                        None,
                        deployed_by,
                    )
                    .await?;
                info!(drone = drone_name, kind, version, "Payload deployed");
                self.events.publish(
                    "deploy",
                    format!("{kind} {version} deployed to {drone_name}"),
                    Some(json!({ "kind": kind, "version": version })),
                    Some(drone_name),
                    None,
                );
                Ok(DeployResult {
                    success: true,
                    message: format!("Deployed {kind} {version} to {drone_name}"),
                    duration_ms,
                })
            }
            Err(e) => {
                let message = e.to_string();
                error!(drone = drone_name, kind, version, error = %message, "Deploy failed");
                if let Ok(drone_id) = self.drone_id_of(drone_name).await {
                    let _ = self
                        .store
                        .mark_drone_payload_failed(&drone_id, kind, &message)
                        .await;
                    let _ = self
                        .store
                        .log_payload_deploy(
                            &drone_id,
                            kind,
                            version,
                            "deploy",
                            "failed",
                            Some(duration_ms),
                            Some(&message),
                            deployed_by,
                        )
                        .await;
                }
                Ok(DeployResult {
                    success: false,
                    message,
                    duration_ms,
                })
            }
        }
    }

    async fn try_deploy(
        &self,
        drone_name: &str,
        kind: &str,
        version: &str,
        deployed_by: Option<&str>,
        verify: bool,
    ) -> Result<()> {
        let record = self
            .store
            .get_payload_version(kind, version)
            .await?
            .ok_or_else(|| CoreError::NotFound(format!("payload {kind} {version}")))?;
        let content = self.payload_content(kind, version).await?;
        let target = self.target_for(drone_name).await?;
        let drone_id = self.drone_id_of(drone_name).await?;

        self.store
            .set_drone_payload(&drone_id, kind, version, &record.hash, "deploying", deployed_by)
            .await?;

        let path = remote_path(kind);
        let dir = Path::new(&path)
            .parent()
            .map(|p| p.to_string_lossy().into_owned())
            .unwrap_or_else(|| "/".to_string());

        let op = self.config.ssh_op_timeout;
        let transfer = format!("mkdir -p {dir} && cat > {path}");
        let output = self
            .link
            .run_with_stdin(&target, &transfer, &content, op)
            .await?;
        if !output.success() {
            return Err(Error::Other(format!(
                "transfer failed: {}",
                output.stderr.trim()
            )));
        }

        if is_executable(kind) {
            let output = self
                .link
                .run(&target, &format!("chmod +x {path}"), op)
                .await?;
            if !output.success() {
                return Err(Error::Other(format!(
                    "chmod failed: {}",
                    output.stderr.trim()
                )));
            }
        }

        if verify {
            let remote = self.remote_hash(&target, &path).await?;
            if remote != record.hash {
                return Err(Error::Other(format!(
                    "hash mismatch: expected {}..., got {}...",
                    &record.hash[..12.min(record.hash.len())],
                    &remote[..12.min(remote.len())],
                )));
            }
        }

        self.store
            .set_drone_payload(&drone_id, kind, version, &record.hash, "deployed", deployed_by)
            .await?;
        Ok(())
    }

    /// Deploy to many drones one at a time.
    ///
    /// On a failure with `rollback_on_fail`, the failed drone is reverted
    /// to its previous version when one is known, the roll-out stops and
    /// prior successes are kept.
    pub async fn rolling_deploy(
        &self,
        kind: &str,
        version: &str,
        drones: Option<Vec<String>>,
        deployed_by: Option<&str>,
        health_check: bool,
        rollback_on_fail: bool,
    ) -> Result<RollingReport> {
        let targets = match drones {
            Some(list) => list,
            None => self.outdated_drones(kind, version).await?,
        };

        info!(kind, version, drones = targets.len(), "Rolling deploy started");

        let mut report = RollingReport {
            success_count: 0,
            fail_count: 0,
            skipped: Vec::new(),
            results: BTreeMap::new(),
            rolled_back: None,
        };

        for (index, drone_name) in targets.iter().enumerate() {
            let mut result = self
                .deploy_to_drone(drone_name, kind, version, deployed_by, true)
                .await?;

            if result.success && health_check && is_executable(kind) {
                if let Err(e) = self.post_deploy_health_check(drone_name).await {
                    result.success = false;
                    result.message = format!("post-deploy health check failed: {e}");
                }
            }

            let success = result.success;
            report.results.insert(drone_name.clone(), result);

            if success {
                report.success_count += 1;
                continue;
            }

            report.fail_count += 1;
            if rollback_on_fail {
                warn!(drone = %drone_name, "Rolling deploy aborted on failure");
                if let Ok(drone_id) = self.drone_id_of(drone_name).await {
                    if let Some(previous) = self
                        .store
                        .previous_deployed_version(&drone_id, kind, version)
                        .await?
                    {
                        let revert = self
                            .revert_drone(drone_name, kind, &previous, deployed_by)
                            .await?;
                        if revert.success {
                            report.rolled_back = Some((drone_name.clone(), previous));
                        }
                    }
                }
                report.skipped = targets[index + 1..].to_vec();
                break;
            }
        }

        self.events.publish(
            "deploy",
            format!(
                "Rolling deploy of {kind} {version}: {} ok, {} failed",
                report.success_count, report.fail_count
            ),
            Some(json!({
                "kind": kind,
                "version": version,
                "success_count": report.success_count,
                "fail_count": report.fail_count,
            })),
            None,
            None,
        );

        Ok(report)
    }

    async fn revert_drone(
        &self,
        drone_name: &str,
        kind: &str,
        previous_version: &str,
        deployed_by: Option<&str>,
    ) -> Result<DeployResult> {
        warn!(drone = drone_name, kind, previous_version, "Reverting drone");
        let started = Instant::now();
        let outcome = self
            .try_deploy(drone_name, kind, previous_version, deployed_by, true)
            .await;
        let duration_ms = started.elapsed().as_secs_f64() * 1000.0;
        let (status, message, success) = match outcome {
            Ok(()) => (
                "success",
                format!("Reverted {drone_name} to {kind} {previous_version}"),
                true,
            ),
            Err(e) => ("failed", e.to_string(), false),
        };
        if let Ok(drone_id) = self.drone_id_of(drone_name).await {
            let _ = self
                .store
                .log_payload_deploy(
                    &drone_id,
                    kind,
                    previous_version,
                    "revert",
                    status,
                    Some(duration_ms),
                    (!success).then_some(message.as_str()),
                    deployed_by,
                )
                .await;
        }
        Ok(DeployResult {
            success,
            message,
            duration_ms,
        })
    }

    /// Restart the worker service and check a worker process exists.
    async fn post_deploy_health_check(&self, drone_name: &str) -> Result<()> {
        let target = self.target_for(drone_name).await?;
        let op = self.config.ssh_op_timeout;
        self.link
            .run(
                &target,
                "rc-service swarm-drone restart 2>&1 || systemctl restart swarm-drone 2>&1",
                op,
            )
            .await?;
        let output = self
            .link
            .run(&target, "sleep 2; pgrep -c -f 'swarm-drone'", op)
            .await?;
        let procs: i64 = output.stdout.trim().parse().unwrap_or(0);
        if !output.success() || procs == 0 {
            return Err(Error::Other("worker process not running".to_string()));
        }
        Ok(())
    }

    /// Verify a drone's on-disk payload against the recorded hash.
    pub async fn verify_drone(&self, drone_name: &str, kind: &str) -> Result<VerifyReport> {
        let drone_id = self.drone_id_of(drone_name).await?;
        let state = self
            .store
            .get_drone_payload(&drone_id, kind)
            .await?
            .ok_or_else(|| {
                CoreError::NotFound(format!("no payload record for {drone_name}/{kind}"))
            })?;

        let target = self.target_for(drone_name).await?;
        let remote = match self.remote_hash(&target, &remote_path(kind)).await {
            Ok(hash) => hash,
            Err(e) => {
                return Ok(VerifyReport {
                    matches: false,
                    expected: state.hash,
                    remote: e.to_string(),
                })
            }
        };

        let matches = remote == state.hash;
        if !matches {
            warn!(
                drone = drone_name,
                kind,
                expected = %state.hash,
                remote = %remote,
                "Payload drift detected"
            );
        }
        self.store
            .log_payload_deploy(
                &drone_id,
                kind,
                &state.version,
                "verify",
                if matches { "success" } else { "failed" },
                None,
                (!matches).then(|| format!("remote hash {remote}")).as_deref(),
                None,
            )
            .await?;

        Ok(VerifyReport {
            matches,
            expected: state.hash,
            remote,
        })
    }

    /// Deployment status summary: latest versions and the drone matrix.
    pub async fn deployment_status(&self) -> Result<serde_json::Value> {
        let kinds = self.store.payload_kinds().await?;
        let mut latest = serde_json::Map::new();
        for kind in &kinds {
            if let Some(v) = self.store.latest_payload_version(kind).await? {
                latest.insert(
                    kind.clone(),
                    json!({
                        "version": v.version,
                        "hash": v.hash,
                        "created_at": v.created_at,
                    }),
                );
            }
        }

        let mut drones: BTreeMap<String, serde_json::Map<String, serde_json::Value>> =
            BTreeMap::new();
        let mut outdated_count = 0usize;
        for state in self.store.list_drone_payloads(None).await? {
            let drone_name = self.store.drone_name(&state.drone_id).await;
            let latest_version = latest
                .get(&state.kind)
                .and_then(|v| v.get("version"))
                .and_then(|v| v.as_str());
            let current = latest_version == Some(state.version.as_str());
            if !current {
                outdated_count += 1;
            }
            drones.entry(drone_name).or_default().insert(
                state.kind.clone(),
                json!({
                    "version": state.version,
                    "status": state.status,
                    "is_current": current,
                }),
            );
        }

        Ok(json!({
            "payload_kinds": kinds,
            "latest_versions": latest,
            "drones": drones,
            "outdated_count": outdated_count,
        }))
    }

    /// Names of online drones not running `version` of `kind`.
    pub async fn outdated_drones(&self, kind: &str, version: &str) -> Result<Vec<String>> {
        let mut out = Vec::new();
        for node in self.store.list_nodes(false).await? {
            if node.node_type != "drone" {
                continue;
            }
            let state = self.store.get_drone_payload(&node.id, kind).await?;
            let current = state.as_ref().is_some_and(|s| s.version == version);
            if !current {
                out.push(node.name);
            }
        }
        Ok(out)
    }

    async fn remote_hash(&self, target: &LinkTarget, path: &str) -> Result<String> {
        let output = self
            .link
            .run(
                target,
                &format!("sha256sum {path} 2>/dev/null | cut -d' ' -f1"),
                self.config.ssh_op_timeout,
            )
            .await?;
        if !output.success() {
            return Err(Error::Other("failed to read remote file".to_string()));
        }
        Ok(output.stdout.trim().to_string())
    }

    async fn target_for(&self, drone_name: &str) -> Result<LinkTarget> {
        let node = self
            .store
            .get_node_by_name(drone_name)
            .await?
            .ok_or_else(|| Error::DroneNotFound(drone_name.to_string()))?;
        let host = node
            .ip
            .clone()
            .ok_or_else(|| Error::Other(format!("drone {drone_name} has no IP")))?;
        let ssh = self.store.ssh_settings(drone_name).await?;
        Ok(LinkTarget {
            name: node.name,
            host,
            user: ssh.user,
            port: ssh.port,
            key_path: ssh.key_path,
            connect_timeout: self.config.ssh_connect_timeout,
        })
    }

    async fn drone_id_of(&self, drone_name: &str) -> Result<String> {
        Ok(self
            .store
            .get_node_by_name(drone_name)
            .await?
            .ok_or_else(|| Error::DroneNotFound(drone_name.to_string()))?
            .id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::link::mock::{MockResponse, MockRunner};
    use swarm_core::store::nodes::NodeRegistration;

    async fn setup() -> (Store, Arc<MockRunner>, PayloadManager) {
        let store = Store::open_in_memory().await.unwrap();
        let (events, _writer) = EventBus::new(store.clone());
        let mock = Arc::new(MockRunner::new());
        let manager = PayloadManager::new(
            store.clone(),
            events,
            Arc::new(Config::default()),
            mock.clone(),
        );
        (store, mock, manager)
    }

    async fn register(store: &Store, id: &str, name: &str) {
        store
            .upsert_node(&NodeRegistration {
                id: id.to_string(),
                name: name.to_string(),
                ip: Some("10.0.0.30".to_string()),
                node_type: "drone".to_string(),
                ..Default::default()
            })
            .await
            .unwrap();
    }

    fn script_hash_ok(mock: &MockRunner, drone: Option<&str>, hash: &str) {
        mock.script(drone, "sha256sum", MockResponse::Ok(format!("{hash}\n")));
    }

    #[tokio::test]
    async fn register_hashes_and_stores_inline() {
        let (store, _mock, manager) = setup().await;
        let content = b"#!/bin/sh\necho drone\n";

        let record = manager
            .register_version("drone_binary", "v0.4.0", content, Some("worker"), Some("admin"))
            .await
            .unwrap();
        assert_eq!(record.hash, content_hash(content));
        assert!(record.content_path.is_none());

        let bytes = manager.payload_content("drone_binary", "v0.4.0").await.unwrap();
        assert_eq!(bytes, content);

        // Duplicate with different bytes is a conflict.
        let err = manager
            .register_version("drone_binary", "v0.4.0", b"other", None, None)
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Core(CoreError::Conflict(_))));

        assert_eq!(store.payload_kinds().await.unwrap(), vec!["drone_binary"]);
    }

    #[tokio::test]
    async fn deploy_verifies_remote_hash() {
        let (store, mock, manager) = setup().await;
        register(&store, "d1", "drone-one").await;
        let content = b"payload-bytes";
        let hash = content_hash(content);
        manager
            .register_version("drone_binary", "v1", content, None, None)
            .await
            .unwrap();
        script_hash_ok(&mock, None, &hash);

        let result = manager
            .deploy_to_drone("drone-one", "drone_binary", "v1", Some("admin"), true)
            .await
            .unwrap();
        assert!(result.success, "{}", result.message);

        // Transfer streamed the exact payload bytes.
        let transfers = mock.calls_matching(Some("drone-one"), "cat > ");
        assert_eq!(transfers.len(), 1);
        assert_eq!(transfers[0].stdin_len, content.len());
        // Executable kinds get chmod +x.
        assert_eq!(mock.calls_matching(Some("drone-one"), "chmod +x").len(), 1);

        let state = store.get_drone_payload("d1", "drone_binary").await.unwrap().unwrap();
        assert_eq!(state.status, "deployed");
        assert_eq!(state.hash, hash);

        let log = store.payload_deploy_history(Some("d1"), 10).await.unwrap();
        assert_eq!(log.len(), 1);
        assert_eq!(log[0].status, "success");
    }

    #[tokio::test]
    async fn hash_mismatch_marks_deploy_failed() {
        let (store, mock, manager) = setup().await;
        register(&store, "d1", "drone-one").await;
        manager
            .register_version("config", "v1", b"conf", None, None)
            .await
            .unwrap();
        script_hash_ok(&mock, None, "deadbeef");

        let result = manager
            .deploy_to_drone("drone-one", "config", "v1", None, true)
            .await
            .unwrap();
        assert!(!result.success);
        assert!(result.message.contains("hash mismatch"));

        let state = store.get_drone_payload("d1", "config").await.unwrap().unwrap();
        assert_eq!(state.status, "failed");
    }

    #[tokio::test]
    async fn rolling_deploy_stops_on_failure_and_reverts() {
        let (store, mock, manager) = setup().await;
        register(&store, "d1", "drone-one").await;
        register(&store, "d2", "drone-two").await;
        register(&store, "d3", "drone-three").await;

        let v1 = b"version-one";
        let v2 = b"version-two";
        manager.register_version("drone_binary", "v1", v1, None, None).await.unwrap();
        manager.register_version("drone_binary", "v2", v2, None, None).await.unwrap();

        // d1 already ran v1 successfully once (rollback target exists).
        store
            .log_payload_deploy("d1", "drone_binary", "v1", "deploy", "success", None, None, None)
            .await
            .unwrap();

        // d1 verifies clean; d2 reports a wrong hash.
        script_hash_ok(&mock, Some("drone-one"), &content_hash(v2));
        mock.script(
            Some("drone-two"),
            "sha256sum",
            MockResponse::Ok("0000000000000000\n".to_string()),
        );

        let report = manager
            .rolling_deploy(
                "drone_binary",
                "v2",
                Some(vec![
                    "drone-one".to_string(),
                    "drone-two".to_string(),
                    "drone-three".to_string(),
                ]),
                Some("admin"),
                false,
                true,
            )
            .await
            .unwrap();

        assert_eq!(report.success_count, 1);
        assert_eq!(report.fail_count, 1);
        assert_eq!(report.skipped, vec!["drone-three".to_string()]);
        assert!(report.results["drone-one"].success);
        assert!(!report.results["drone-two"].success);
        assert!(!report.results.contains_key("drone-three"));

        let d2_log = store.payload_deploy_history(Some("d2"), 10).await.unwrap();
        assert!(d2_log.iter().any(|r| r.action == "deploy" && r.status == "failed"));

        // d2 has no successful deploy on record, so there was no version
        // to revert to.
        assert!(report.rolled_back.is_none());
    }

    #[tokio::test]
    async fn rolling_deploy_reverts_failed_drone_with_history() {
        let (store, mock, manager) = setup().await;
        register(&store, "d1", "drone-one").await;

        let v1 = b"version-one";
        let v2 = b"version-two";
        manager.register_version("drone_binary", "v1", v1, None, None).await.unwrap();
        manager.register_version("drone_binary", "v2", v2, None, None).await.unwrap();
        store
            .log_payload_deploy("d1", "drone_binary", "v1", "deploy", "success", None, None, None)
            .await
            .unwrap();

        // Every transfer fails on this host.
        mock.script(None, "cat > ", MockResponse::Fail(1, "disk full".to_string()));
        let report = manager
            .rolling_deploy(
                "drone_binary",
                "v2",
                Some(vec!["drone-one".to_string()]),
                None,
                false,
                true,
            )
            .await
            .unwrap();
        assert_eq!(report.fail_count, 1);
        // The revert also fails (same transfer failure), so nothing is
        // reported as rolled back; the attempt is in the log.
        let log = store.payload_deploy_history(Some("d1"), 10).await.unwrap();
        assert!(log.iter().any(|r| r.action == "revert"));
    }

    #[tokio::test]
    async fn verify_reports_drift() {
        let (store, mock, manager) = setup().await;
        register(&store, "d1", "drone-one").await;
        let content = b"payload";
        let hash = content_hash(content);
        manager.register_version("config", "v1", content, None, None).await.unwrap();
        store
            .set_drone_payload("d1", "config", "v1", &hash, "deployed", None)
            .await
            .unwrap();

        script_hash_ok(&mock, None, &hash);
        let report = manager.verify_drone("drone-one", "config").await.unwrap();
        assert!(report.matches);

        mock.script(None, "sha256sum", MockResponse::Ok("drifted\n".to_string()));
        let report = manager.verify_drone("drone-one", "config").await.unwrap();
        assert!(!report.matches);
        assert_eq!(report.remote, "drifted");
    }

    #[tokio::test]
    async fn outdated_drones_lists_missing_and_old_versions() {
        let (store, _mock, manager) = setup().await;
        register(&store, "d1", "drone-one").await;
        register(&store, "d2", "drone-two").await;
        store
            .set_drone_payload("d1", "drone_binary", "v2", "h", "deployed", None)
            .await
            .unwrap();

        let outdated = manager.outdated_drones("drone_binary", "v2").await.unwrap();
        assert_eq!(outdated, vec!["drone-two".to_string()]);
    }
}
