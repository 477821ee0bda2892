// Copyright (C) 2026 Build Swarm Contributors
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Shared domain types for the swarm control plane.
//!
//! The wire protocol carries timestamps as seconds-since-epoch floats, so
//! every record type stores `f64` epoch seconds rather than a calendar
//! type. [`now_ts`] is the single clock used across the workspace.

use std::collections::BTreeMap;
use std::time::{SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};

/// Current time as seconds since the Unix epoch.
pub fn now_ts() -> f64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs_f64())
        .unwrap_or(0.0)
}

/// What kind of machine a drone runs on. Gates reboot actions: bare-metal
/// and unknown hosts are never rebooted by the control plane.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum DroneKind {
    /// System container (LXC or similar).
    Container,
    /// Full virtual machine.
    Vm,
    /// Physical host.
    BareMetal,
    /// Not yet classified.
    Unknown,
}

impl DroneKind {
    /// Parse from the stored string form; anything unrecognized is unknown.
    pub fn parse(s: &str) -> Self {
        match s {
            "container" => Self::Container,
            "vm" => Self::Vm,
            "bare-metal" => Self::BareMetal,
            _ => Self::Unknown,
        }
    }

    /// Stored/wire string form.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Container => "container",
            Self::Vm => "vm",
            Self::BareMetal => "bare-metal",
            Self::Unknown => "unknown",
        }
    }

    /// Whether a reboot action may ever be issued for this kind.
    pub fn reboot_allowed(&self) -> bool {
        matches!(self, Self::Container | Self::Vm)
    }
}

/// Queue item lifecycle states.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum QueueStatus {
    /// Waiting for assignment.
    Needed,
    /// Assigned to a drone.
    Delegated,
    /// Built and received.
    Received,
    /// Gave up after repeated failures.
    Blocked,
    /// Failed terminally.
    Failed,
}

impl QueueStatus {
    /// Stored string form.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Needed => "needed",
            Self::Delegated => "delegated",
            Self::Received => "received",
            Self::Blocked => "blocked",
            Self::Failed => "failed",
        }
    }

    /// Terminal states never transition again (except by admin action).
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Received | Self::Blocked | Self::Failed)
    }
}

/// Completion status reported by a drone.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CompletionStatus {
    /// Build succeeded and the artifact was delivered.
    Success,
    /// Build failed.
    Failed,
    /// Drone gave the package back without attempting it.
    Returned,
    /// Build succeeded but the artifact upload failed.
    UploadFailed,
}

impl CompletionStatus {
    /// Parse the wire form. Returns `None` for unknown values.
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "success" => Some(Self::Success),
            "failed" => Some(Self::Failed),
            "returned" => Some(Self::Returned),
            "upload_failed" => Some(Self::UploadFailed),
            _ => None,
        }
    }

    /// String form recorded in build history.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Success => "success",
            Self::Failed => "failed",
            Self::Returned => "returned",
            Self::UploadFailed => "upload_failed",
        }
    }
}

/// Outcome of a work-request evaluation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AssignResult {
    /// A package was delegated to the drone.
    Assigned(String),
    /// No work available right now.
    Empty,
    /// The drone is not eligible for work.
    Rejected(RejectReason),
}

/// Why a drone was refused work.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RejectReason {
    /// Global queue pause flag is set.
    QueuePaused,
    /// The drone has never registered.
    UnknownDrone,
    /// The drone is administratively paused.
    DronePaused,
    /// The drone is marked offline.
    Offline,
    /// The circuit breaker grounded the drone.
    Grounded,
    /// Too many consecutive upload failures.
    UploadImpaired,
}

impl RejectReason {
    /// Human-readable label for logs and events.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::QueuePaused => "queue_paused",
            Self::UnknownDrone => "unknown_drone",
            Self::DronePaused => "drone_paused",
            Self::Offline => "offline",
            Self::Grounded => "grounded",
            Self::UploadImpaired => "upload_impaired",
        }
    }
}

/// Outcome of a completion report.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CompletionResult {
    /// The report matched the current assignment and was recorded.
    Accepted,
    /// The reporter is no longer the assignee; the report was discarded.
    Stale,
    /// The queue item was already in a terminal state.
    AlreadyTerminal,
}

/// Self-reported drone capabilities. Unknown keys from newer agents are
/// carried through `extra` so re-serialization does not lose them.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Capabilities {
    /// CPU core count.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cores: Option<i64>,
    /// Total RAM in gigabytes.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ram_gb: Option<f64>,
    /// Whether the drone consents to automated reboots.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub auto_reboot: Option<bool>,
    /// Timestamp of the drone's package tree snapshot.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub portage_timestamp: Option<String>,
    /// Forward-compatible keys the control plane does not interpret.
    #[serde(flatten)]
    pub extra: BTreeMap<String, serde_json::Value>,
}

/// Self-reported drone metrics from the latest heartbeat.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Metrics {
    /// CPU utilization percentage.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cpu_percent: Option<f64>,
    /// RAM utilization percentage.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ram_percent: Option<f64>,
    /// One-minute load average.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub load_1m: Option<f64>,
    /// Forward-compatible keys.
    #[serde(flatten)]
    pub extra: BTreeMap<String, serde_json::Value>,
}

/// Normalize a package atom for build-command compatibility.
///
/// Versioned atoms (`cat/pkg-1.2.3`) get an `=` prefix; unversioned atoms
/// are left bare; an `=` on an unversioned atom is stripped. Comparison
/// operators (`>=`, `<`, `~`, `!`) pass through untouched.
pub fn normalize_atom(atom: &str) -> String {
    if atom.is_empty()
        || atom.starts_with(">=")
        || atom.starts_with("<=")
        || atom.starts_with('<')
        || atom.starts_with('>')
        || atom.starts_with('~')
        || atom.starts_with('!')
    {
        return atom.to_string();
    }

    let bare = atom.trim_start_matches('=');
    let (body, slot) = match bare.split_once(':') {
        Some((b, s)) => (b, format!(":{s}")),
        None => (bare, String::new()),
    };

    if atom_is_versioned(body) {
        format!("={body}{slot}")
    } else {
        format!("{body}{slot}")
    }
}

/// True when `cat/pkg-1.2.3`-shaped: the hyphen-separated tail after the
/// package name starts with a digit.
fn atom_is_versioned(body: &str) -> bool {
    let Some((_, pn_ver)) = body.split_once('/') else {
        return false;
    };
    // Walk hyphens right-to-left: the version component is the first
    // hyphen-delimited segment starting with a digit.
    let bytes = pn_ver.as_bytes();
    for i in (1..bytes.len()).rev() {
        if bytes[i - 1] == b'-' && bytes[i].is_ascii_digit() {
            return true;
        }
    }
    false
}
