// Copyright (C) 2026 Build Swarm Contributors
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Configuration for the swarm control plane.
//!
//! Every tunable is an environment variable with a default; `main` loads a
//! `.env` file first so a config file and the environment resolve through
//! the same path.

use std::path::PathBuf;
use std::time::Duration;

/// Control-plane configuration loaded from environment variables.
#[derive(Debug, Clone)]
pub struct Config {
    /// State directory (database, admin key, payload blobs).
    pub state_dir: PathBuf,
    /// Log directory.
    pub log_dir: PathBuf,
    /// Public listener port (drone protocol + read-only API).
    pub public_port: u16,
    /// Admin listener port.
    pub admin_port: u16,
    /// Shared admin secret for the `X-Admin-Key` header, if set in the
    /// environment. When absent it is loaded from or generated into the
    /// state directory at startup.
    pub admin_key: Option<String>,
    /// Heartbeat-stale reclaim threshold.
    pub reclaim_offline: Duration,
    /// Lease reclaim threshold for unresponsive assignees.
    pub reclaim_lease: Duration,
    /// Self-healing probe cadence. Zero disables the monitor.
    pub probe_interval: Duration,
    /// Escalation guard: consecutive probe failures required.
    pub min_consecutive_failures: u32,
    /// Escalation guard: minimum time since the first failure in a streak.
    pub min_failure_window: Duration,
    /// Maximum `delegated` items a drone may hold.
    pub max_prefetch_per_drone: i64,
    /// Circuit-breaker ceiling (build failures before grounding).
    pub max_failures: i64,
    /// Circuit-breaker cooldown.
    pub grounding_timeout: Duration,
    /// Window within which package failures count toward blocking, and
    /// after which blocked packages are retried.
    pub failure_age: Duration,
    /// Per-package failure cap before the item is blocked.
    pub max_package_failures: i64,
    /// Consecutive upload failures before a drone stops receiving work.
    pub max_upload_failures: i64,
    /// How long an upload-impaired drone waits before a retry.
    pub upload_retry: Duration,
    /// Heartbeat age after which a node is marked offline.
    pub node_timeout: Duration,
    /// Name prefix identifying sweeper drones.
    pub sweeper_prefix: String,
    /// Staging directory drones upload into.
    pub staging_path: PathBuf,
    /// Base directory holding release snapshots.
    pub releases_path: PathBuf,
    /// Symlink pointing at the active release.
    pub binhost_symlink: PathBuf,
    /// Directory for payload blobs too large to inline in the database.
    pub payload_cache: PathBuf,
    /// SSH connect timeout.
    pub ssh_connect_timeout: Duration,
    /// SSH operation timeout (probes, restarts, transfers).
    pub ssh_op_timeout: Duration,
    /// Per-request HTTP deadline.
    pub request_timeout: Duration,
    /// IP address reported to drones in register responses. Detected from
    /// the default route when unset.
    pub report_ip: Option<String>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            state_dir: PathBuf::from("/var/lib/swarm"),
            log_dir: PathBuf::from("/var/log/swarm"),
            public_port: 8100,
            admin_port: 8093,
            admin_key: None,
            reclaim_offline: Duration::from_secs(15 * 60),
            reclaim_lease: Duration::from_secs(600),
            probe_interval: Duration::from_secs(30),
            min_consecutive_failures: 3,
            min_failure_window: Duration::from_secs(180),
            max_prefetch_per_drone: 2,
            max_failures: 8,
            grounding_timeout: Duration::from_secs(300),
            failure_age: Duration::from_secs(1800),
            max_package_failures: 5,
            max_upload_failures: 3,
            upload_retry: Duration::from_secs(30 * 60),
            node_timeout: Duration::from_secs(30),
            sweeper_prefix: "sweeper-".to_string(),
            staging_path: PathBuf::from("/var/cache/binpkgs-staging"),
            releases_path: PathBuf::from("/var/cache/binpkgs-releases"),
            binhost_symlink: PathBuf::from("/var/cache/binpkgs"),
            payload_cache: PathBuf::from("/var/lib/swarm/payloads"),
            ssh_connect_timeout: Duration::from_secs(10),
            ssh_op_timeout: Duration::from_secs(120),
            request_timeout: Duration::from_secs(30),
            report_ip: None,
        }
    }
}

impl Config {
    /// Load configuration from environment variables.
    pub fn from_env() -> Result<Self, ConfigError> {
        let state_dir = PathBuf::from(env_or("SWARM_STATE_DIR", "/var/lib/swarm"));
        let log_dir = PathBuf::from(env_or("SWARM_LOG_DIR", "/var/log/swarm"));

        let payload_cache = match std::env::var("SWARM_PAYLOAD_CACHE") {
            Ok(v) => PathBuf::from(v),
            Err(_) => state_dir.join("payloads"),
        };

        Ok(Self {
            public_port: env_port("SWARM_PUBLIC_PORT", 8100)?,
            admin_port: env_port("SWARM_ADMIN_PORT", 8093)?,
            admin_key: std::env::var("SWARM_ADMIN_KEY")
                .ok()
                .filter(|v| !v.is_empty()),
            reclaim_offline: Duration::from_secs(
                env_u64("SWARM_RECLAIM_OFFLINE_MINUTES", 15)? * 60,
            ),
            reclaim_lease: Duration::from_secs(env_u64("SWARM_RECLAIM_LEASE_SECONDS", 600)?),
            probe_interval: Duration::from_secs(env_u64("SWARM_PROBE_INTERVAL_SECONDS", 30)?),
            min_consecutive_failures: env_u64("SWARM_MIN_CONSECUTIVE_FAILURES", 3)? as u32,
            min_failure_window: Duration::from_secs(env_u64(
                "SWARM_MIN_FAILURE_WINDOW_SECONDS",
                180,
            )?),
            max_prefetch_per_drone: env_u64("SWARM_MAX_PREFETCH_PER_DRONE", 2)? as i64,
            max_failures: env_u64("SWARM_MAX_FAILURES", 8)? as i64,
            grounding_timeout: Duration::from_secs(env_u64(
                "SWARM_GROUNDING_TIMEOUT_SECONDS",
                300,
            )?),
            failure_age: Duration::from_secs(env_u64("SWARM_FAILURE_AGE_SECONDS", 1800)?),
            max_package_failures: env_u64("SWARM_MAX_PACKAGE_FAILURES", 5)? as i64,
            max_upload_failures: env_u64("SWARM_MAX_UPLOAD_FAILURES", 3)? as i64,
            upload_retry: Duration::from_secs(env_u64("SWARM_UPLOAD_RETRY_MINUTES", 30)? * 60),
            node_timeout: Duration::from_secs(env_u64("SWARM_NODE_TIMEOUT_SECONDS", 30)?),
            sweeper_prefix: env_or("SWARM_SWEEPER_PREFIX", "sweeper-"),
            staging_path: PathBuf::from(env_or(
                "SWARM_STAGING_PATH",
                "/var/cache/binpkgs-staging",
            )),
            releases_path: PathBuf::from(env_or(
                "SWARM_RELEASES_PATH",
                "/var/cache/binpkgs-releases",
            )),
            binhost_symlink: PathBuf::from(env_or("SWARM_BINHOST_SYMLINK", "/var/cache/binpkgs")),
            payload_cache,
            ssh_connect_timeout: Duration::from_secs(env_u64(
                "SWARM_SSH_CONNECT_TIMEOUT_SECONDS",
                10,
            )?),
            ssh_op_timeout: Duration::from_secs(env_u64("SWARM_SSH_OP_TIMEOUT_SECONDS", 120)?),
            request_timeout: Duration::from_secs(env_u64("SWARM_REQUEST_TIMEOUT_SECONDS", 30)?),
            report_ip: std::env::var("SWARM_REPORT_IP").ok().filter(|v| !v.is_empty()),
            state_dir,
            log_dir,
        })
    }

    /// Path of the SQLite database file.
    pub fn db_path(&self) -> PathBuf {
        self.state_dir.join("swarm.db")
    }

    /// Path of the control-plane log file.
    pub fn log_file(&self) -> PathBuf {
        self.log_dir.join("control-plane.log")
    }

    /// Path of the persisted admin key file.
    pub fn admin_key_file(&self) -> PathBuf {
        self.state_dir.join("admin.key")
    }
}

fn env_or(key: &str, default: &str) -> String {
    std::env::var(key).unwrap_or_else(|_| default.to_string())
}

fn env_u64(key: &'static str, default: u64) -> Result<u64, ConfigError> {
    match std::env::var(key) {
        Ok(v) => v.parse().map_err(|_| ConfigError::InvalidValue(key)),
        Err(_) => Ok(default),
    }
}

fn env_port(key: &'static str, default: u16) -> Result<u16, ConfigError> {
    match std::env::var(key) {
        Ok(v) => v.parse().map_err(|_| ConfigError::InvalidValue(key)),
        Err(_) => Ok(default),
    }
}

/// Configuration errors.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// An environment variable holds an unparseable value.
    #[error("Invalid value for environment variable {0}")]
    InvalidValue(&'static str),
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::env;
    use std::sync::Mutex;

    // Mutex to serialize tests that modify environment variables
    static ENV_MUTEX: Mutex<()> = Mutex::new(());

    /// Helper to set env vars for a test and restore them after
    struct EnvGuard {
        vars: Vec<(String, Option<String>)>,
    }

    impl EnvGuard {
        fn new() -> Self {
            Self { vars: Vec::new() }
        }

        fn set(&mut self, key: &str, value: &str) {
            let old = env::var(key).ok();
            self.vars.push((key.to_string(), old));
            // SAFETY: Tests are serialized via ENV_MUTEX, so no concurrent access
            unsafe { env::set_var(key, value) };
        }

        fn remove(&mut self, key: &str) {
            let old = env::var(key).ok();
            self.vars.push((key.to_string(), old));
            // SAFETY: Tests are serialized via ENV_MUTEX, so no concurrent access
            unsafe { env::remove_var(key) };
        }
    }

    impl Drop for EnvGuard {
        fn drop(&mut self) {
            for (key, value) in self.vars.drain(..).rev() {
                // SAFETY: Tests are serialized via ENV_MUTEX, so no concurrent access
                unsafe {
                    match value {
                        Some(v) => env::set_var(&key, v),
                        None => env::remove_var(&key),
                    }
                }
            }
        }
    }

    #[test]
    fn defaults_apply_when_env_is_empty() {
        let _lock = ENV_MUTEX.lock().unwrap();
        let mut guard = EnvGuard::new();
        for key in [
            "SWARM_STATE_DIR",
            "SWARM_PUBLIC_PORT",
            "SWARM_ADMIN_PORT",
            "SWARM_PROBE_INTERVAL_SECONDS",
            "SWARM_MAX_FAILURES",
            "SWARM_ADMIN_KEY",
        ] {
            guard.remove(key);
        }

        let config = Config::from_env().unwrap();

        assert_eq!(config.public_port, 8100);
        assert_eq!(config.admin_port, 8093);
        assert_eq!(config.probe_interval, Duration::from_secs(30));
        assert_eq!(config.min_consecutive_failures, 3);
        assert_eq!(config.min_failure_window, Duration::from_secs(180));
        assert_eq!(config.max_prefetch_per_drone, 2);
        assert_eq!(config.max_failures, 8);
        assert_eq!(config.grounding_timeout, Duration::from_secs(300));
        assert_eq!(config.failure_age, Duration::from_secs(1800));
        assert_eq!(config.reclaim_offline, Duration::from_secs(15 * 60));
        assert_eq!(config.reclaim_lease, Duration::from_secs(600));
        assert!(config.admin_key.is_none());
        assert_eq!(config.db_path(), PathBuf::from("/var/lib/swarm/swarm.db"));
    }

    #[test]
    fn custom_ports_and_intervals() {
        let _lock = ENV_MUTEX.lock().unwrap();
        let mut guard = EnvGuard::new();
        guard.set("SWARM_PUBLIC_PORT", "9100");
        guard.set("SWARM_ADMIN_PORT", "9093");
        guard.set("SWARM_PROBE_INTERVAL_SECONDS", "0");
        guard.set("SWARM_RECLAIM_OFFLINE_MINUTES", "5");

        let config = Config::from_env().unwrap();

        assert_eq!(config.public_port, 9100);
        assert_eq!(config.admin_port, 9093);
        assert_eq!(config.probe_interval, Duration::ZERO);
        assert_eq!(config.reclaim_offline, Duration::from_secs(300));
    }

    #[test]
    fn payload_cache_defaults_under_state_dir() {
        let _lock = ENV_MUTEX.lock().unwrap();
        let mut guard = EnvGuard::new();
        guard.set("SWARM_STATE_DIR", "/tmp/swarm-test");
        guard.remove("SWARM_PAYLOAD_CACHE");

        let config = Config::from_env().unwrap();
        assert_eq!(config.payload_cache, PathBuf::from("/tmp/swarm-test/payloads"));
    }

    #[test]
    fn invalid_port_is_an_error() {
        let _lock = ENV_MUTEX.lock().unwrap();
        let mut guard = EnvGuard::new();
        guard.set("SWARM_PUBLIC_PORT", "not_a_number");

        let result = Config::from_env();
        assert!(matches!(
            result,
            Err(ConfigError::InvalidValue("SWARM_PUBLIC_PORT"))
        ));
    }

    #[test]
    fn port_out_of_range_is_an_error() {
        let _lock = ENV_MUTEX.lock().unwrap();
        let mut guard = EnvGuard::new();
        guard.set("SWARM_ADMIN_PORT", "99999");

        assert!(Config::from_env().is_err());
    }
}
