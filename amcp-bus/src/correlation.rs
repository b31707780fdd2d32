//! Correlation tracking for request/response exchanges over the bus.
//!
//! Each outbound request registers a correlation id and receives a pending
//! future; the matching inbound response, a timeout, or an explicit
//! cancellation resolves it. Exactly one of the three wins.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::time::Duration;

use serde_json::Value;
use thiserror::Error;
use tokio::sync::{Mutex, oneshot};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::debug;

use amcp_primitives::AgentId;

/// Result alias for correlation operations.
pub type CorrelationResult<T> = Result<T, CorrelationError>;

/// Errors surfaced by the correlation tracker.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum CorrelationError {
    /// The correlation id is already registered and still pending.
    #[error("correlation id `{id}` is already registered")]
    Duplicate {
        /// Offending correlation id.
        id: String,
    },

    /// The deadline elapsed before a response arrived.
    #[error("correlation `{id}` timed out")]
    Timeout {
        /// Expired correlation id.
        id: String,
    },

    /// The entry was cancelled before a response arrived.
    #[error("correlation `{id}` was cancelled")]
    Cancelled {
        /// Cancelled correlation id.
        id: String,
    },

    /// The tracker shut down while the entry was pending.
    #[error("correlation tracker shut down")]
    TrackerClosed,
}

struct PendingEntry {
    tx: oneshot::Sender<CorrelationResult<Value>>,
    deadline: Instant,
    target: Option<AgentId>,
    context: BTreeMap<String, String>,
}

/// Future handed to the requester; resolves on response, timeout, or cancel.
#[derive(Debug)]
pub struct PendingResponse {
    id: String,
    rx: oneshot::Receiver<CorrelationResult<Value>>,
}

impl PendingResponse {
    /// Returns the correlation id this future waits on.
    #[must_use]
    pub fn correlation_id(&self) -> &str {
        &self.id
    }

    /// Awaits the outcome.
    ///
    /// # Errors
    ///
    /// Returns [`CorrelationError::Timeout`] on deadline expiry,
    /// [`CorrelationError::Cancelled`] on explicit cancellation, or
    /// [`CorrelationError::TrackerClosed`] when the tracker shut down.
    pub async fn outcome(self) -> CorrelationResult<Value> {
        match self.rx.await {
            Ok(result) => result,
            Err(_) => Err(CorrelationError::TrackerClosed),
        }
    }
}

struct TrackerInner {
    entries: Mutex<HashMap<String, PendingEntry>>,
}

/// Maps outbound correlation ids to pending response futures.
#[derive(Clone)]
pub struct CorrelationTracker {
    inner: Arc<TrackerInner>,
}

impl Default for CorrelationTracker {
    fn default() -> Self {
        Self::new()
    }
}

impl CorrelationTracker {
    /// Creates an empty tracker.
    #[must_use]
    pub fn new() -> Self {
        Self {
            inner: Arc::new(TrackerInner {
                entries: Mutex::new(HashMap::new()),
            }),
        }
    }

    /// Registers a pending exchange.
    ///
    /// # Errors
    ///
    /// Returns [`CorrelationError::Duplicate`] when the id is already
    /// pending.
    pub async fn register(
        &self,
        correlation_id: impl Into<String>,
        target: Option<AgentId>,
        context: BTreeMap<String, String>,
        timeout: Duration,
    ) -> CorrelationResult<PendingResponse> {
        let correlation_id = correlation_id.into();
        let mut entries = self.inner.entries.lock().await;
        if entries.contains_key(&correlation_id) {
            return Err(CorrelationError::Duplicate { id: correlation_id });
        }

        let (tx, rx) = oneshot::channel();
        entries.insert(
            correlation_id.clone(),
            PendingEntry {
                tx,
                deadline: Instant::now() + timeout,
                target,
                context,
            },
        );
        debug!(correlation_id, "correlation registered");
        Ok(PendingResponse {
            id: correlation_id,
            rx,
        })
    }

    /// Resolves a pending entry with a response payload.
    ///
    /// Returns `false` when no entry was pending (already resolved, expired,
    /// or unknown); late completions are no-ops by design.
    pub async fn record_response(&self, correlation_id: &str, payload: Value) -> bool {
        let entry = self.inner.entries.lock().await.remove(correlation_id);
        match entry {
            Some(entry) => {
                let _ = entry.tx.send(Ok(payload));
                true
            }
            None => false,
        }
    }

    /// Cancels a pending entry, resolving its future exceptionally.
    ///
    /// Returns `false` when no entry was pending.
    pub async fn cancel(&self, correlation_id: &str) -> bool {
        let entry = self.inner.entries.lock().await.remove(correlation_id);
        match entry {
            Some(entry) => {
                let _ = entry.tx.send(Err(CorrelationError::Cancelled {
                    id: correlation_id.to_owned(),
                }));
                true
            }
            None => false,
        }
    }

    /// Cancels every pending entry (used on context shutdown).
    pub async fn cancel_all(&self) {
        let mut entries = self.inner.entries.lock().await;
        for (id, entry) in entries.drain() {
            let _ = entry.tx.send(Err(CorrelationError::Cancelled { id }));
        }
    }

    /// Completes expired entries with a timeout error; returns how many were
    /// evicted.
    pub async fn cleanup_expired(&self) -> usize {
        let now = Instant::now();
        let mut entries = self.inner.entries.lock().await;
        let expired: Vec<String> = entries
            .iter()
            .filter(|(_, entry)| entry.deadline <= now)
            .map(|(id, _)| id.clone())
            .collect();
        for id in &expired {
            if let Some(entry) = entries.remove(id) {
                let _ = entry.tx.send(Err(CorrelationError::Timeout { id: id.clone() }));
            }
        }
        expired.len()
    }

    /// Returns the number of pending entries.
    pub async fn pending_count(&self) -> usize {
        self.inner.entries.lock().await.len()
    }

    /// Returns the registered target agent for a pending entry, if any.
    pub async fn target_of(&self, correlation_id: &str) -> Option<AgentId> {
        self.inner
            .entries
            .lock()
            .await
            .get(correlation_id)
            .and_then(|entry| entry.target.clone())
    }

    /// Returns a copy of the context map for a pending entry.
    pub async fn context_of(&self, correlation_id: &str) -> Option<BTreeMap<String, String>> {
        self.inner
            .entries
            .lock()
            .await
            .get(correlation_id)
            .map(|entry| entry.context.clone())
    }

    /// Spawns the background expiry scheduler.
    ///
    /// The task runs until aborted; contexts own the handle and abort it on
    /// shutdown.
    #[must_use]
    pub fn spawn_expiry_task(&self, interval: Duration) -> JoinHandle<()> {
        let tracker = self.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                let evicted = tracker.cleanup_expired().await;
                if evicted > 0 {
                    debug!(evicted, "expired correlation entries evicted");
                }
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn response_resolves_future() {
        let tracker = CorrelationTracker::new();
        let pending = tracker
            .register("c1", None, BTreeMap::new(), Duration::from_secs(5))
            .await
            .unwrap();

        assert!(tracker.record_response("c1", json!({"ok": true})).await);
        let value = pending.outcome().await.unwrap();
        assert_eq!(value["ok"], json!(true));
        assert_eq!(tracker.pending_count().await, 0);
    }

    #[tokio::test]
    async fn duplicate_registration_fails() {
        let tracker = CorrelationTracker::new();
        let _pending = tracker
            .register("c1", None, BTreeMap::new(), Duration::from_secs(5))
            .await
            .unwrap();
        let err = tracker
            .register("c1", None, BTreeMap::new(), Duration::from_secs(5))
            .await
            .expect_err("duplicate");
        assert_eq!(
            err,
            CorrelationError::Duplicate {
                id: "c1".to_owned()
            }
        );
    }

    #[tokio::test]
    async fn expiry_resolves_with_timeout() {
        let tracker = CorrelationTracker::new();
        let pending = tracker
            .register("c1", None, BTreeMap::new(), Duration::from_millis(5))
            .await
            .unwrap();

        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(tracker.cleanup_expired().await, 1);
        let err = pending.outcome().await.expect_err("timed out");
        assert!(matches!(err, CorrelationError::Timeout { .. }));
    }

    #[tokio::test]
    async fn cancel_resolves_exceptionally() {
        let tracker = CorrelationTracker::new();
        let pending = tracker
            .register("c1", None, BTreeMap::new(), Duration::from_secs(5))
            .await
            .unwrap();

        assert!(tracker.cancel("c1").await);
        let err = pending.outcome().await.expect_err("cancelled");
        assert!(matches!(err, CorrelationError::Cancelled { .. }));
    }

    #[tokio::test]
    async fn completion_and_expiry_race_first_writer_wins() {
        let tracker = CorrelationTracker::new();
        let pending = tracker
            .register("c1", None, BTreeMap::new(), Duration::from_millis(1))
            .await
            .unwrap();

        tokio::time::sleep(Duration::from_millis(10)).await;
        // Response lands first even though the entry is past its deadline.
        assert!(tracker.record_response("c1", json!(1)).await);
        assert_eq!(tracker.cleanup_expired().await, 0);
        // The late expiry is a no-op; the waiter sees the response.
        assert_eq!(pending.outcome().await.unwrap(), json!(1));
        assert!(!tracker.record_response("c1", json!(2)).await);
    }

    #[tokio::test]
    async fn background_scheduler_evicts() {
        let tracker = CorrelationTracker::new();
        let handle = tracker.spawn_expiry_task(Duration::from_millis(5));
        let pending = tracker
            .register("c1", None, BTreeMap::new(), Duration::from_millis(10))
            .await
            .unwrap();

        let err = pending.outcome().await.expect_err("expired");
        assert!(matches!(err, CorrelationError::Timeout { .. }));
        handle.abort();
    }
}
