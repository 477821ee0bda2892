// Copyright (C) 2026 Build Swarm Contributors
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Swarm Control Plane
//!
//! The central coordination point for a multi-machine compile farm. It
//! assigns package builds to remote drones, tracks their health,
//! recovers failed drones autonomously, and records everything in the
//! durable store provided by `swarm-core`.
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────┐
//! │                          Drones (HTTP)                          │
//! │              register / work / complete   (port 8100)           │
//! └─────────────────────────────────────────────────────────────────┘
//!                │                                 ▲
//!                ▼                                 │
//! ┌─────────────────────────────┐   ┌─────────────────────────────┐
//! │  Public listener            │   │  Admin listener (8093)      │
//! │  drone protocol + reads     │   │  control, payloads,         │
//! │  (writes gated by key)      │   │  releases, logs, SQL        │
//! └─────────────────────────────┘   └─────────────────────────────┘
//!        │             │                    │
//!        ▼             ▼                    ▼
//! ┌──────────┐  ┌────────────┐  ┌────────────────────────┐
//! │Scheduler │  │  Health    │  │ Payload / Release mgmt │
//! │ + leases │  │  breaker   │  │ (SSH + filesystem)     │
//! └──────────┘  └────────────┘  └────────────────────────┘
//!        │             │                    │
//!        └──────┬──────┴─────────┬──────────┘
//!               ▼                ▼
//!        swarm-core Store   Self-healing monitor (SSH probes)
//! ```
//!
//! # Background loops
//!
//! - scheduler maintenance: node staleness, offline/lease reclaims,
//!   aged unblocks, pruning (1 s tick)
//! - self-healing probe loop (30 s default, 0 disables)
//! - event bus writer and protocol log writer (write-behind batches)
//!
//! All loops honor a shutdown signal; the restartable ones are
//! supervised with exponential backoff.
//!
//! # Modules
//!
//! - [`error`]: error and startup-error types (exit codes)
//! - [`health`]: build-failure circuit breaker (grounding)
//! - [`http`]: axum routers and handlers for both listeners
//! - [`link`]: SSH command transport (mockable)
//! - [`payloads`]: content-addressed payload registry and deployer
//! - [`protocol_log`]: per-exchange HTTP capture
//! - [`releases`]: release snapshot/promote/rollback management
//! - [`runtime`]: component wiring and graceful shutdown
//! - [`scheduler`]: assignment, completion, reclaim, rebalance
//! - [`self_healing`]: SSH probe loop and escalation ladder

#![deny(missing_docs)]

/// Error types for the control plane.
pub mod error;

/// Drone circuit breaker.
pub mod health;

/// HTTP surface.
pub mod http;

/// Remote command execution over SSH.
pub mod link;

/// Payload registry and deployer.
pub mod payloads;

/// Protocol capture.
pub mod protocol_log;

/// Release management.
pub mod releases;

/// Runtime wiring.
pub mod runtime;

/// Work scheduler.
pub mod scheduler;

/// Self-healing monitor.
pub mod self_healing;

pub use error::Error;
pub use runtime::SwarmRuntime;
