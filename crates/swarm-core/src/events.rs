// Copyright (C) 2026 Build Swarm Contributors
// SPDX-License-Identifier: AGPL-3.0-or-later
//! In-process event bus with a durable write-behind tail.
//!
//! Publishing never blocks the caller: the event goes into a bounded
//! in-memory ring (overwrite-oldest) for cheap dashboard tailing, and is
//! offered to a bounded channel feeding the background writer. When the
//! channel is full the event is dropped from persistence (drop-newest);
//! the ring still sees it, and a drop counter surfaces the loss in logs.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use serde::Serialize;
use tokio::sync::{mpsc, Notify};
use tracing::{debug, error, info, warn};

use crate::store::Store;
use crate::types::now_ts;

/// Ring capacity for the recent-events tail.
pub const RING_CAPACITY: usize = 2000;

/// Write-behind channel capacity.
const CHANNEL_CAPACITY: usize = 5000;

/// Flush cadence for the background writer.
const FLUSH_INTERVAL: Duration = Duration::from_millis(500);

/// One event on the bus.
#[derive(Debug, Clone, Serialize)]
pub struct Event {
    /// Monotonic id assigned by the bus (ring ids, not database ids).
    pub id: u64,
    /// Emission time.
    pub timestamp: f64,
    /// Kind tag (`assign`, `complete`, `fail`, `reclaim`, `grounded`,
    /// `escalate`, `heal`, `alert`, `release`, ...).
    pub event_type: String,
    /// Human-readable message.
    pub message: String,
    /// Structured details.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub details: Option<serde_json::Value>,
    /// Related drone name.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub drone: Option<String>,
    /// Related package atom.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub package: Option<String>,
}

struct BusInner {
    ring: Mutex<VecDeque<Event>>,
    next_id: AtomicU64,
    tx: mpsc::Sender<Event>,
    dropped: AtomicU64,
}

/// Cheap-to-clone publish handle.
#[derive(Clone)]
pub struct EventBus {
    inner: Arc<BusInner>,
}

impl EventBus {
    /// Create the bus and its background writer. The writer must be given
    /// to a task runner (`tokio::spawn(writer.run())`).
    pub fn new(store: Store) -> (Self, EventWriter) {
        let (tx, rx) = mpsc::channel(CHANNEL_CAPACITY);
        let bus = Self {
            inner: Arc::new(BusInner {
                ring: Mutex::new(VecDeque::with_capacity(RING_CAPACITY)),
                next_id: AtomicU64::new(1),
                tx,
                dropped: AtomicU64::new(0),
            }),
        };
        let writer = EventWriter {
            store,
            rx,
            shutdown: Arc::new(Notify::new()),
        };
        (bus, writer)
    }

    /// Publish an event. Non-blocking; see module docs for drop policy.
    pub fn publish(
        &self,
        event_type: &str,
        message: impl Into<String>,
        details: Option<serde_json::Value>,
        drone: Option<&str>,
        package: Option<&str>,
    ) {
        let event = Event {
            id: self.inner.next_id.fetch_add(1, Ordering::Relaxed),
            timestamp: now_ts(),
            event_type: event_type.to_string(),
            message: message.into(),
            details,
            drone: drone.map(|d| d.to_string()),
            package: package.map(|p| p.to_string()),
        };

        {
            let mut ring = self.inner.ring.lock().expect("event ring poisoned");
            if ring.len() >= RING_CAPACITY {
                ring.pop_front();
            }
            ring.push_back(event.clone());
        }

        if self.inner.tx.try_send(event).is_err() {
            let dropped = self.inner.dropped.fetch_add(1, Ordering::Relaxed) + 1;
            if dropped % 1000 == 1 {
                warn!(dropped, "Event persistence queue full, dropping events");
            }
        }
    }

    /// Tail the ring: events with id greater than `since_id`, optionally
    /// filtered by kind. Returns the events and the latest assigned id.
    pub fn tail(&self, since_id: u64, event_type: Option<&str>, limit: usize) -> (Vec<Event>, u64) {
        let ring = self.inner.ring.lock().expect("event ring poisoned");
        let latest = self.inner.next_id.load(Ordering::Relaxed).saturating_sub(1);
        let events = ring
            .iter()
            .filter(|e| e.id > since_id)
            .filter(|e| event_type.is_none_or(|t| e.event_type == t))
            .take(limit)
            .cloned()
            .collect();
        (events, latest)
    }

    /// Events dropped from persistence so far.
    pub fn dropped_count(&self) -> u64 {
        self.inner.dropped.load(Ordering::Relaxed)
    }
}

/// Background task draining the bus into the store in small batches.
pub struct EventWriter {
    store: Store,
    rx: mpsc::Receiver<Event>,
    shutdown: Arc<Notify>,
}

impl EventWriter {
    /// Handle used to signal shutdown.
    pub fn shutdown_handle(&self) -> Arc<Notify> {
        self.shutdown.clone()
    }

    /// Run the writer loop until shutdown, then drain what is left.
    pub async fn run(mut self) {
        info!("Event writer started");
        loop {
            tokio::select! {
                biased;

                _ = self.shutdown.notified() => {
                    debug!("Event writer received shutdown signal");
                    break;
                }

                _ = tokio::time::sleep(FLUSH_INTERVAL) => {
                    self.flush().await;
                }
            }
        }
        self.flush().await;
        info!("Event writer stopped");
    }

    async fn flush(&mut self) {
        let mut batch = Vec::new();
        while let Ok(event) = self.rx.try_recv() {
            batch.push(event);
            if batch.len() >= 500 {
                break;
            }
        }
        if batch.is_empty() {
            return;
        }
        if let Err(e) = self.store.insert_events(&batch).await {
            error!(error = %e, count = batch.len(), "Failed to persist event batch");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn bus() -> (EventBus, EventWriter) {
        let store = Store::open_in_memory().await.unwrap();
        EventBus::new(store)
    }

    #[tokio::test]
    async fn tail_returns_events_after_since_id() {
        let (bus, _writer) = bus().await;
        bus.publish("assign", "one", None, None, None);
        bus.publish("fail", "two", None, Some("drone-one"), None);
        bus.publish("assign", "three", None, None, None);

        let (events, latest) = bus.tail(0, None, 100);
        assert_eq!(events.len(), 3);
        assert_eq!(latest, 3);

        let (events, _) = bus.tail(1, None, 100);
        assert_eq!(events.len(), 2);
        assert_eq!(events[0].message, "two");

        let (events, _) = bus.tail(0, Some("assign"), 100);
        assert_eq!(events.len(), 2);
    }

    #[tokio::test]
    async fn ring_overwrites_oldest() {
        let (bus, _writer) = bus().await;
        for i in 0..(RING_CAPACITY + 10) {
            bus.publish("assign", format!("e{i}"), None, None, None);
        }
        let (events, latest) = bus.tail(0, None, RING_CAPACITY + 10);
        assert_eq!(events.len(), RING_CAPACITY);
        assert_eq!(latest, (RING_CAPACITY + 10) as u64);
        // Oldest ten were evicted.
        assert_eq!(events[0].id, 11);
    }

    #[tokio::test]
    async fn writer_persists_published_events() {
        let store = Store::open_in_memory().await.unwrap();
        let (bus, writer) = EventBus::new(store.clone());
        let shutdown = writer.shutdown_handle();
        let handle = tokio::spawn(writer.run());

        bus.publish("assign", "persisted", None, Some("drone-one"), Some("=x/y-1.0"));

        // Trigger shutdown; the writer drains before exiting.
        shutdown.notify_one();
        handle.await.unwrap();

        let rows = store.event_history(None, None, None, 10).await.unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].event_type, "assign");
        assert_eq!(rows[0].drone.as_deref(), Some("drone-one"));
    }
}
