//! Fan-out bus for voice-originated frames.
//!
//! Subscription queues are strictly per-subscriber: delivery to one slow
//! subscriber drops for that subscriber only and never blocks the publisher
//! or the other subscribers.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::Serialize;
use tokio::sync::mpsc;

use dx_domain::frame::Frame;

/// One control channel's subscription.
struct Subscription {
    connection_id: String,
    tx: mpsc::Sender<Frame>,
    /// When set, only frames for this thread are delivered.
    thread_id: Mutex<Option<String>>,
    created_at: DateTime<Utc>,
    last_activity: Mutex<DateTime<Utc>>,
    delivered: AtomicU64,
}

impl Subscription {
    /// The matching predicate: voice kind, addressed to us (or unaddressed),
    /// and on our thread (when both sides carry one).
    fn matches(&self, frame: &Frame) -> bool {
        if !frame.is_voice_kind() {
            return false;
        }
        if let Some(recipient) = frame.recipient_connection_id() {
            if recipient != self.connection_id {
                return false;
            }
        }
        if let Some(frame_thread) = frame.thread_id() {
            if let Some(sub_thread) = self.thread_id.lock().as_deref() {
                if frame_thread != sub_thread {
                    return false;
                }
            }
        }
        true
    }
}

/// Per-subscriber snapshot for the metrics endpoint.
#[derive(Debug, Clone, Serialize)]
pub struct SubscriptionInfo {
    pub connection_id: String,
    pub thread_id: Option<String>,
    pub created_at: DateTime<Utc>,
    pub last_activity: DateTime<Utc>,
    pub delivered: u64,
}

#[derive(Debug, Clone, Serialize)]
pub struct BusStats {
    pub total_broadcasts: u64,
    pub total_deliveries: u64,
    pub dropped_deliveries: u64,
    pub active_subscribers: usize,
    pub subscribers: Vec<SubscriptionInfo>,
}

/// Subscription-based broadcaster for voice-originated frames.
#[derive(Default)]
pub struct VoiceBus {
    subscribers: Mutex<HashMap<String, Arc<Subscription>>>,
    total_broadcasts: AtomicU64,
    total_deliveries: AtomicU64,
    dropped_deliveries: AtomicU64,
}

impl VoiceBus {
    pub fn new() -> Self {
        Self::default()
    }

    /// Subscribe a connection; replaces any existing subscription for the
    /// same connection id. Returns the receiving end of the per-subscriber
    /// queue.
    pub fn subscribe(
        &self,
        connection_id: &str,
        thread_id: Option<String>,
        capacity: usize,
    ) -> mpsc::Receiver<Frame> {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        let now = Utc::now();
        let subscription = Arc::new(Subscription {
            connection_id: connection_id.to_string(),
            tx,
            thread_id: Mutex::new(thread_id.clone()),
            created_at: now,
            last_activity: Mutex::new(now),
            delivered: AtomicU64::new(0),
        });
        self.subscribers
            .lock()
            .insert(connection_id.to_string(), subscription);
        tracing::info!(
            connection_id = %connection_id,
            thread_id = ?thread_id,
            "voice bus subscription created"
        );
        rx
    }

    /// Remove a subscription. The queue drains when the receiver drops.
    pub fn unsubscribe(&self, connection_id: &str) -> bool {
        match self.subscribers.lock().remove(connection_id) {
            Some(sub) => {
                tracing::info!(
                    connection_id = %connection_id,
                    delivered = sub.delivered.load(Ordering::Relaxed),
                    "voice bus subscription removed"
                );
                true
            }
            None => false,
        }
    }

    /// Update the thread filter for an existing subscription.
    pub fn update_thread_id(&self, connection_id: &str, thread_id: &str) -> bool {
        let subscribers = self.subscribers.lock();
        match subscribers.get(connection_id) {
            Some(sub) => {
                let old = sub
                    .thread_id
                    .lock()
                    .replace(thread_id.to_string());
                *sub.last_activity.lock() = Utc::now();
                tracing::info!(
                    connection_id = %connection_id,
                    old_thread = ?old,
                    new_thread = %thread_id,
                    "voice subscription thread updated"
                );
                true
            }
            None => {
                tracing::warn!(
                    connection_id = %connection_id,
                    "attempted thread update for unknown subscription"
                );
                false
            }
        }
    }

    /// Deliver a frame to every matching subscription. Returns the number of
    /// successful deliveries; a full queue drops for that subscriber only.
    pub fn broadcast(&self, frame: &Frame) -> usize {
        self.total_broadcasts.fetch_add(1, Ordering::Relaxed);

        let matching: Vec<Arc<Subscription>> = {
            let subscribers = self.subscribers.lock();
            subscribers
                .values()
                .filter(|sub| sub.matches(frame))
                .cloned()
                .collect()
        };

        let mut delivered = 0usize;
        for sub in &matching {
            match sub.tx.try_send(frame.clone()) {
                Ok(()) => {
                    delivered += 1;
                    sub.delivered.fetch_add(1, Ordering::Relaxed);
                    *sub.last_activity.lock() = Utc::now();
                    self.total_deliveries.fetch_add(1, Ordering::Relaxed);
                }
                Err(mpsc::error::TrySendError::Full(_)) => {
                    self.dropped_deliveries.fetch_add(1, Ordering::Relaxed);
                    tracing::warn!(
                        connection_id = %sub.connection_id,
                        kind = frame.kind(),
                        "subscriber queue full, dropping frame"
                    );
                }
                Err(mpsc::error::TrySendError::Closed(_)) => {
                    self.dropped_deliveries.fetch_add(1, Ordering::Relaxed);
                    tracing::debug!(
                        connection_id = %sub.connection_id,
                        "subscriber queue closed, dropping frame"
                    );
                }
            }
        }

        tracing::debug!(
            kind = frame.kind(),
            delivered,
            matched = matching.len(),
            "voice frame broadcast"
        );
        delivered
    }

    /// Evict subscriptions idle beyond `max_idle`. Returns the evicted count.
    pub fn sweep_stale(&self, max_idle: std::time::Duration) -> usize {
        let cutoff = Utc::now() - chrono::Duration::from_std(max_idle).unwrap_or_default();
        let stale: Vec<String> = {
            let subscribers = self.subscribers.lock();
            subscribers
                .values()
                .filter(|s| *s.last_activity.lock() < cutoff)
                .map(|s| s.connection_id.clone())
                .collect()
        };
        for connection_id in &stale {
            self.unsubscribe(connection_id);
        }
        if !stale.is_empty() {
            tracing::info!(count = stale.len(), "stale voice subscriptions evicted");
        }
        stale.len()
    }

    pub fn subscriber_count(&self) -> usize {
        self.subscribers.lock().len()
    }

    pub fn stats(&self) -> BusStats {
        let subscribers = self.subscribers.lock();
        BusStats {
            total_broadcasts: self.total_broadcasts.load(Ordering::Relaxed),
            total_deliveries: self.total_deliveries.load(Ordering::Relaxed),
            dropped_deliveries: self.dropped_deliveries.load(Ordering::Relaxed),
            active_subscribers: subscribers.len(),
            subscribers: subscribers
                .values()
                .map(|s| SubscriptionInfo {
                    connection_id: s.connection_id.clone(),
                    thread_id: s.thread_id.lock().clone(),
                    created_at: s.created_at,
                    last_activity: *s.last_activity.lock(),
                    delivered: s.delivered.load(Ordering::Relaxed),
                })
                .collect(),
        }
    }
}
