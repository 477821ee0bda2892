// Copyright (C) 2026 Build Swarm Contributors
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Wireshark-style capture of every HTTP exchange.
//!
//! The HTTP layer hands each completed request/response pair to
//! [`ProtocolLogger::log_exchange`]; classification, field extraction
//! and truncation happen there, then the entry goes over a bounded
//! queue to one background writer that batch-inserts into the store.
//! A full queue drops the newest entry rather than stalling a handler.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use serde_json::Value;
use tokio::sync::{mpsc, Notify};
use tracing::{debug, error, info, warn};

use swarm_core::store::protocol::ProtocolEntry;
use swarm_core::types::now_ts;
use swarm_core::Store;

/// Captured body cap, each direction.
pub const BODY_CAP: usize = 8192;

/// Marker appended to truncated bodies.
const TRUNCATED: &str = "…[truncated]";

/// Queue capacity between handlers and the writer.
const QUEUE_CAPACITY: usize = 5000;

/// Writer flush cadence.
const FLUSH_INTERVAL: Duration = Duration::from_millis(500);

/// Classify a request into a symbolic tag from its method and path.
pub fn classify(method: &str, path: &str) -> &'static str {
    let clean = path.split('?').next().unwrap_or(path).trim_end_matches('/');
    match (method, clean) {
        ("GET", "/api/v1/work") => "work_request",
        ("POST", "/api/v1/register") => "register",
        ("POST", "/api/v1/complete") => "complete",
        ("POST", "/api/v1/queue") => "queue",
        ("GET", "/api/v1/queue") => "queue_query",
        ("POST", "/api/v1/control") => "control",
        ("GET", "/api/v1/status") => "status_query",
        ("GET", "/api/v1/nodes") => "node_list",
        ("GET", "/api/v1/events") => "events_query",
        ("GET", "/api/v1/events/history") => "events_query",
        ("GET", "/api/v1/history") => "history_query",
        ("GET", "/api/v1/sessions") => "session_query",
        ("GET", "/api/v1/health") => "health_check",
        ("GET", "/api/v1/drone-health") => "health_query",
        ("GET", "/api/v1/ping") | ("GET", "/api/v1/ping/all") => "ping",
        ("GET", "/api/v1/escalation") => "escalation_query",
        _ => classify_dynamic(method, clean),
    }
}

fn classify_dynamic(method: &str, path: &str) -> &'static str {
    if path.starts_with("/api/v1/sql/") {
        return "sql_query";
    }
    if path.starts_with("/api/v1/nodes/") {
        return match method {
            "DELETE" => "node_delete",
            _ => "node_action",
        };
    }
    if path.starts_with("/admin/api/protocol") {
        return "protocol_query";
    }
    if path.starts_with("/admin/api/payloads") {
        return "admin_deploy";
    }
    if path.starts_with("/admin/api/releases") {
        return "admin_release";
    }
    if path.starts_with("/admin/api/") {
        return "admin_query";
    }
    "unknown"
}

/// One side of a captured exchange, before extraction.
#[derive(Debug, Clone)]
pub struct Exchange {
    /// Peer address.
    pub source_ip: Option<String>,
    /// HTTP method.
    pub method: String,
    /// Path including query string.
    pub path: String,
    /// Raw request body (uncapped; capped during extraction).
    pub request_body: Option<String>,
    /// Raw response body.
    pub response_body: Option<String>,
    /// Response status.
    pub status_code: u16,
    /// Handler latency.
    pub latency_ms: f64,
}

/// Clone-able handle the HTTP layer logs through.
#[derive(Clone)]
pub struct ProtocolLogger {
    tx: mpsc::Sender<ProtocolEntry>,
    dropped: Arc<AtomicU64>,
}

impl ProtocolLogger {
    /// Create the logger and its background writer.
    pub fn new(store: Store) -> (Self, ProtocolWriter) {
        let (tx, rx) = mpsc::channel(QUEUE_CAPACITY);
        (
            Self {
                tx,
                dropped: Arc::new(AtomicU64::new(0)),
            },
            ProtocolWriter {
                store,
                rx,
                shutdown: Arc::new(Notify::new()),
            },
        )
    }

    /// Record one completed exchange. Non-blocking.
    pub fn log_exchange(&self, exchange: Exchange) {
        let msg_type = classify(&exchange.method, &exchange.path);
        let entry = build_entry(msg_type, exchange);
        if self.tx.try_send(entry).is_err() {
            let dropped = self.dropped.fetch_add(1, Ordering::Relaxed) + 1;
            if dropped % 1000 == 1 {
                warn!(dropped, "Protocol log queue full, dropping entries");
            }
        }
    }
}

/// Background task persisting protocol entries.
pub struct ProtocolWriter {
    store: Store,
    rx: mpsc::Receiver<ProtocolEntry>,
    shutdown: Arc<Notify>,
}

impl ProtocolWriter {
    /// Handle used to signal shutdown.
    pub fn shutdown_handle(&self) -> Arc<Notify> {
        self.shutdown.clone()
    }

    /// Run the writer until shutdown, draining what is left.
    pub async fn run(mut self) {
        info!("Protocol log writer started");
        loop {
            tokio::select! {
                biased;

                _ = self.shutdown.notified() => {
                    debug!("Protocol log writer received shutdown signal");
                    break;
                }

                _ = tokio::time::sleep(FLUSH_INTERVAL) => {
                    self.flush().await;
                }
            }
        }
        self.flush().await;
        info!("Protocol log writer stopped");
    }

    async fn flush(&mut self) {
        let mut batch = Vec::new();
        while let Ok(entry) = self.rx.try_recv() {
            batch.push(entry);
            if batch.len() >= 500 {
                break;
            }
        }
        if batch.is_empty() {
            return;
        }
        if let Err(e) = self.store.insert_protocol_entries(&batch).await {
            error!(error = %e, count = batch.len(), "Failed to persist protocol batch");
        }
    }
}

fn build_entry(msg_type: &'static str, exchange: Exchange) -> ProtocolEntry {
    let req = parse_json(exchange.request_body.as_deref());
    let resp = parse_json(exchange.response_body.as_deref());
    let clean_path = exchange
        .path
        .split('?')
        .next()
        .unwrap_or(&exchange.path)
        .to_string();

    let mut entry = ProtocolEntry {
        timestamp: now_ts(),
        source_ip: exchange.source_ip.clone(),
        source_node: None,
        method: exchange.method.clone(),
        path: clean_path.clone(),
        msg_type: msg_type.to_string(),
        drone_id: None,
        package: None,
        session_id: None,
        status_code: exchange.status_code as i64,
        request_summary: Some(format!("{} {}", exchange.method, clean_path)),
        response_summary: Some(exchange.status_code.to_string()),
        request_body: truncate(exchange.request_body.as_deref()),
        response_body: truncate(exchange.response_body.as_deref()),
        latency_ms: (exchange.latency_ms * 1000.0).round() / 1000.0,
        content_length: exchange
            .response_body
            .as_deref()
            .map(|b| b.len() as i64)
            .unwrap_or(0),
    };

    let status = exchange.status_code;
    match msg_type {
        "work_request" => {
            entry.drone_id = query_param(&exchange.path, "id");
            match resp.get("package").and_then(Value::as_str) {
                Some(pkg) => {
                    entry.package = Some(pkg.to_string());
                    entry.response_summary = Some(format!("{status} package={pkg}"));
                }
                None => entry.response_summary = Some(format!("{status} no_work")),
            }
        }
        "register" => {
            entry.drone_id = str_field(&req, "id");
            let name = str_field(&req, "name").unwrap_or_default();
            entry.source_node = Some(name.clone());
            let cores = req
                .get("capabilities")
                .and_then(|c| c.get("cores"))
                .cloned()
                .unwrap_or(Value::Null);
            entry.request_summary = Some(format!("REGISTER {name} cores={cores}"));
        }
        "complete" => {
            entry.drone_id = str_field(&req, "id");
            entry.package = str_field(&req, "package");
            let report = str_field(&req, "status").unwrap_or_else(|| "?".to_string());
            entry.request_summary = Some(format!(
                "COMPLETE {} status={report}",
                entry.package.as_deref().unwrap_or("?")
            ));
        }
        "queue" => {
            let count = req
                .get("packages")
                .and_then(Value::as_array)
                .map(|a| a.len())
                .unwrap_or(0);
            entry.session_id = str_field(&resp, "session_id");
            entry.request_summary = Some(format!("QUEUE {count} packages"));
        }
        "control" => {
            let action = str_field(&req, "action").unwrap_or_else(|| "?".to_string());
            entry.request_summary = Some(format!("CONTROL action={action}"));
        }
        "node_action" | "node_delete" => {
            // /api/v1/nodes/{name}[/action]
            entry.source_node = clean_path.split('/').nth(4).map(str::to_string);
        }
        _ => {}
    }

    entry
}

fn parse_json(body: Option<&str>) -> Value {
    body.and_then(|b| serde_json::from_str(b).ok())
        .unwrap_or(Value::Null)
}

fn str_field(value: &Value, key: &str) -> Option<String> {
    value.get(key).and_then(Value::as_str).map(str::to_string)
}

fn query_param(path: &str, key: &str) -> Option<String> {
    let query = path.split_once('?')?.1;
    query.split('&').find_map(|pair| {
        let (k, v) = pair.split_once('=')?;
        (k == key).then(|| v.to_string())
    })
}

fn truncate(body: Option<&str>) -> Option<String> {
    let body = body?;
    if body.len() <= BODY_CAP {
        return Some(body.to_string());
    }
    let mut cut = BODY_CAP;
    while !body.is_char_boundary(cut) {
        cut -= 1;
    }
    Some(format!("{}{TRUNCATED}", &body[..cut]))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn classification_covers_the_protocol_surface() {
        assert_eq!(classify("GET", "/api/v1/work?id=d1"), "work_request");
        assert_eq!(classify("POST", "/api/v1/register"), "register");
        assert_eq!(classify("POST", "/api/v1/complete"), "complete");
        assert_eq!(classify("POST", "/api/v1/queue"), "queue");
        assert_eq!(classify("POST", "/api/v1/control"), "control");
        assert_eq!(classify("GET", "/api/v1/status"), "status_query");
        assert_eq!(classify("GET", "/api/v1/nodes?all=true"), "node_list");
        assert_eq!(classify("GET", "/api/v1/events"), "events_query");
        assert_eq!(classify("GET", "/api/v1/events/history"), "events_query");
        assert_eq!(classify("GET", "/api/v1/history"), "history_query");
        assert_eq!(classify("GET", "/api/v1/sessions"), "session_query");
        assert_eq!(classify("GET", "/api/v1/health"), "health_check");
        assert_eq!(classify("POST", "/api/v1/nodes/drone-one/pause"), "node_action");
        assert_eq!(classify("DELETE", "/api/v1/nodes/drone-one"), "node_delete");
        assert_eq!(classify("GET", "/api/v1/sql/query?q=SELECT+1"), "sql_query");
        assert_eq!(classify("GET", "/admin/api/protocol?since=0"), "protocol_query");
        assert_eq!(classify("GET", "/admin/api/protocol/density"), "protocol_query");
        assert_eq!(classify("POST", "/admin/api/payloads"), "admin_deploy");
        assert_eq!(
            classify("POST", "/admin/api/releases/r1/promote"),
            "admin_release"
        );
        assert_eq!(classify("GET", "/admin/api/system/info"), "admin_query");
        assert_eq!(classify("GET", "/definitely/not/a/route"), "unknown");
    }

    #[test]
    fn work_request_extracts_drone_and_package() {
        let entry = build_entry(
            "work_request",
            Exchange {
                source_ip: Some("10.0.0.5".to_string()),
                method: "GET".to_string(),
                path: "/api/v1/work?id=d1&cores=16".to_string(),
                request_body: None,
                response_body: Some(r#"{"package":"=dev-libs/openssl-3.2.0"}"#.to_string()),
                status_code: 200,
                latency_ms: 1.234,
            },
        );
        assert_eq!(entry.drone_id.as_deref(), Some("d1"));
        assert_eq!(entry.package.as_deref(), Some("=dev-libs/openssl-3.2.0"));
        assert_eq!(entry.path, "/api/v1/work");
        assert!(entry
            .response_summary
            .as_deref()
            .unwrap()
            .contains("package="));
    }

    #[test]
    fn complete_extracts_fields_from_request() {
        let entry = build_entry(
            "complete",
            Exchange {
                source_ip: None,
                method: "POST".to_string(),
                path: "/api/v1/complete".to_string(),
                request_body: Some(
                    r#"{"id":"d1","package":"=x/y-1.0","status":"failed"}"#.to_string(),
                ),
                response_body: Some(r#"{"status":"ok"}"#.to_string()),
                status_code: 200,
                latency_ms: 0.5,
            },
        );
        assert_eq!(entry.drone_id.as_deref(), Some("d1"));
        assert_eq!(entry.package.as_deref(), Some("=x/y-1.0"));
        assert!(entry
            .request_summary
            .as_deref()
            .unwrap()
            .contains("status=failed"));
    }

    #[test]
    fn oversized_bodies_are_truncated_with_marker() {
        let big = "x".repeat(BODY_CAP + 100);
        let out = truncate(Some(&big)).unwrap();
        assert!(out.len() < big.len());
        assert!(out.ends_with(TRUNCATED));

        let small = "y".repeat(10);
        assert_eq!(truncate(Some(&small)).as_deref(), Some("yyyyyyyyyy"));
    }

    #[tokio::test]
    async fn writer_persists_logged_exchanges() {
        let store = Store::open_in_memory().await.unwrap();
        let (logger, writer) = ProtocolLogger::new(store.clone());
        let shutdown = writer.shutdown_handle();
        let handle = tokio::spawn(writer.run());

        logger.log_exchange(Exchange {
            source_ip: Some("10.0.0.5".to_string()),
            method: "GET".to_string(),
            path: "/api/v1/status".to_string(),
            request_body: None,
            response_body: Some("{}".to_string()),
            status_code: 200,
            latency_ms: 2.0,
        });

        shutdown.notify_one();
        handle.await.unwrap();

        let rows = store.protocol_entries(0, None, None, 10).await.unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].msg_type, "status_query");
        assert_eq!(rows[0].status_code, 200);
    }
}
