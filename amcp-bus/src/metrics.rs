//! Delivery counters for broker implementations.

use std::sync::atomic::{AtomicU64, Ordering};

#[derive(Debug, Default)]
pub(crate) struct BrokerMetrics {
    pub published: AtomicU64,
    pub delivered: AtomicU64,
    pub dropped: AtomicU64,
    pub retried: AtomicU64,
    pub dead_lettered: AtomicU64,
    pub handler_failures: AtomicU64,
    pub active_subscriptions: AtomicU64,
}

impl BrokerMetrics {
    pub(crate) fn bump(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn snapshot(&self) -> BrokerMetricsSnapshot {
        BrokerMetricsSnapshot {
            published: self.published.load(Ordering::Relaxed),
            delivered: self.delivered.load(Ordering::Relaxed),
            dropped: self.dropped.load(Ordering::Relaxed),
            retried: self.retried.load(Ordering::Relaxed),
            dead_lettered: self.dead_lettered.load(Ordering::Relaxed),
            handler_failures: self.handler_failures.load(Ordering::Relaxed),
            active_subscriptions: self.active_subscriptions.load(Ordering::Relaxed),
        }
    }
}

/// Point-in-time view of broker delivery counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BrokerMetricsSnapshot {
    /// Events accepted by `publish`.
    pub published: u64,
    /// Successful handler invocations.
    pub delivered: u64,
    /// Events dropped by back-pressure or non-retryable failures.
    pub dropped: u64,
    /// Redelivery attempts performed for RELIABLE events.
    pub retried: u64,
    /// Events forwarded to `system.deadletter`.
    pub dead_lettered: u64,
    /// Handler invocations that returned an error or timed out.
    pub handler_failures: u64,
    /// Currently registered `(subscriber, pattern)` pairs.
    pub active_subscriptions: u64,
}
