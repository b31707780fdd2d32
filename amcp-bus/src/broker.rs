//! Broker contract and subscriber plumbing.

use std::future::Future;
use std::sync::Arc;

use async_trait::async_trait;
use futures::future::BoxFuture;
use thiserror::Error;

use amcp_events::{Event, EventError};
use amcp_primitives::{Topic, TopicPattern};

use crate::metrics::BrokerMetricsSnapshot;

/// Result alias for bus operations.
pub type BusResult<T> = Result<T, BusError>;

/// Errors surfaced by broker operations.
#[derive(Debug, Error)]
pub enum BusError {
    /// The broker has not been started or was already stopped.
    #[error("broker is not running")]
    NotRunning,

    /// A subscription for the `(subscriber, pattern)` pair already exists.
    #[error("subscriber `{subscriber}` already holds pattern `{pattern}`")]
    AlreadySubscribed {
        /// Subscriber identifier.
        subscriber: String,
        /// Offending pattern.
        pattern: TopicPattern,
    },

    /// No subscription exists for the `(subscriber, pattern)` pair.
    #[error("subscriber `{subscriber}` does not hold pattern `{pattern}`")]
    NotSubscribed {
        /// Subscriber identifier.
        subscriber: String,
        /// Offending pattern.
        pattern: TopicPattern,
    },

    /// The envelope was rejected before fan-out.
    #[error(transparent)]
    Envelope(#[from] EventError),

    /// The topic or pattern was rejected.
    #[error(transparent)]
    Topic(#[from] amcp_primitives::Error),

    /// Broker configuration failed validation.
    #[error("invalid broker configuration: {0}")]
    InvalidConfig(&'static str),
}

/// Errors a subscriber handler may return.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum HandlerError {
    /// The subscriber exists but cannot accept events right now (e.g. the
    /// backing agent is not ACTIVE). RELIABLE delivery retries these.
    #[error("subscriber unavailable: {reason}")]
    Unavailable {
        /// Human-readable reason.
        reason: String,
    },

    /// The handler ran and failed.
    #[error("handler failed: {reason}")]
    Failed {
        /// Human-readable reason.
        reason: String,
    },

    /// The handler exceeded its execution deadline.
    #[error("handler exceeded execution deadline")]
    DeadlineExceeded,
}

impl HandlerError {
    /// Convenience constructor for unavailable subscribers.
    #[must_use]
    pub fn unavailable(reason: impl Into<String>) -> Self {
        Self::Unavailable {
            reason: reason.into(),
        }
    }

    /// Convenience constructor for handler failures.
    #[must_use]
    pub fn failed(reason: impl Into<String>) -> Self {
        Self::Failed {
            reason: reason.into(),
        }
    }
}

/// Result alias for handler invocations.
pub type HandlerResult = Result<(), HandlerError>;

/// Callback invoked for every event delivered to a subscription.
#[async_trait]
pub trait EventHandler: Send + Sync {
    /// Handles one delivered event.
    async fn handle_event(&self, event: Event) -> HandlerResult;
}

struct FnEventHandler<F> {
    f: F,
}

#[async_trait]
impl<F> EventHandler for FnEventHandler<F>
where
    F: Fn(Event) -> BoxFuture<'static, HandlerResult> + Send + Sync,
{
    async fn handle_event(&self, event: Event) -> HandlerResult {
        (self.f)(event).await
    }
}

/// Wraps an async closure into an [`EventHandler`].
pub fn handler_fn<F, Fut>(f: F) -> Arc<dyn EventHandler>
where
    F: Fn(Event) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = HandlerResult> + Send + 'static,
{
    Arc::new(FnEventHandler {
        f: move |event| Box::pin(f(event)) as BoxFuture<'static, HandlerResult>,
    })
}

/// Pluggable broker abstraction.
///
/// `publish` is non-blocking from the caller's perspective: the future
/// completes once the broker has accepted the event (in-memory: after
/// fan-out enqueue).
#[async_trait]
pub trait EventBroker: Send + Sync {
    /// Starts delivery workers.
    async fn start(&self) -> BusResult<()>;

    /// Stops delivery, draining queues within the configured timeout.
    async fn stop(&self) -> BusResult<()>;

    /// Returns `true` while the broker accepts traffic.
    fn is_running(&self) -> bool;

    /// Publishes one event to all matching subscriptions.
    async fn publish(&self, event: Event) -> BusResult<()>;

    /// Registers a handler for the `(subscriber, pattern)` pair.
    async fn subscribe(
        &self,
        subscriber_id: &str,
        pattern: TopicPattern,
        handler: Arc<dyn EventHandler>,
    ) -> BusResult<()>;

    /// Removes the subscription for the `(subscriber, pattern)` pair.
    async fn unsubscribe(&self, subscriber_id: &str, pattern: &TopicPattern) -> BusResult<()>;

    /// Returns a snapshot of delivery counters.
    fn metrics(&self) -> BrokerMetricsSnapshot;
}

/// Scoped publishing handle that stamps a fixed source onto envelopes.
#[derive(Clone)]
pub struct EventPublisher {
    broker: Arc<dyn EventBroker>,
    source: String,
}

impl EventPublisher {
    /// Creates a publisher bound to the given source identifier.
    #[must_use]
    pub fn new(broker: Arc<dyn EventBroker>, source: impl Into<String>) -> Self {
        Self {
            broker,
            source: source.into(),
        }
    }

    /// Returns the source stamped onto built events.
    #[must_use]
    pub fn source(&self) -> &str {
        &self.source
    }

    /// Starts an envelope builder pre-stamped with this publisher's source.
    #[must_use]
    pub fn event(&self, topic: Topic) -> amcp_events::EventBuilder {
        Event::builder(topic).source(self.source.clone())
    }

    /// Publishes a fully built event.
    ///
    /// # Errors
    ///
    /// Propagates broker errors.
    pub async fn publish(&self, event: Event) -> BusResult<()> {
        self.broker.publish(event).await
    }
}

/// Scoped subscription handle for one subscriber identity.
#[derive(Clone)]
pub struct EventSubscriber {
    broker: Arc<dyn EventBroker>,
    id: String,
}

impl EventSubscriber {
    /// Creates a subscriber handle with the given identity.
    #[must_use]
    pub fn new(broker: Arc<dyn EventBroker>, id: impl Into<String>) -> Self {
        Self {
            broker,
            id: id.into(),
        }
    }

    /// Returns the subscriber identity.
    #[must_use]
    pub fn id(&self) -> &str {
        &self.id
    }

    /// Subscribes the handle's identity to a pattern.
    ///
    /// # Errors
    ///
    /// Propagates broker errors, including duplicate subscriptions.
    pub async fn subscribe(
        &self,
        pattern: TopicPattern,
        handler: Arc<dyn EventHandler>,
    ) -> BusResult<()> {
        self.broker.subscribe(&self.id, pattern, handler).await
    }

    /// Removes a subscription held by the handle's identity.
    ///
    /// # Errors
    ///
    /// Propagates broker errors.
    pub async fn unsubscribe(&self, pattern: &TopicPattern) -> BusResult<()> {
        self.broker.unsubscribe(&self.id, pattern).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex as StdMutex;
    use std::time::Duration;

    use serde_json::json;

    use crate::memory::InMemoryBroker;

    #[tokio::test]
    async fn scoped_handles_stamp_source_and_route() {
        let broker: Arc<dyn EventBroker> = Arc::new(InMemoryBroker::with_defaults());
        broker.start().await.unwrap();

        let seen: Arc<StdMutex<Vec<Event>>> = Arc::new(StdMutex::new(Vec::new()));
        let sink = Arc::clone(&seen);
        let subscriber = EventSubscriber::new(Arc::clone(&broker), "listener");
        subscriber
            .subscribe(
                TopicPattern::parse("metrics.*").unwrap(),
                handler_fn(move |event: Event| {
                    let sink = Arc::clone(&sink);
                    async move {
                        sink.lock().unwrap().push(event);
                        Ok(())
                    }
                }),
            )
            .await
            .unwrap();

        let publisher = EventPublisher::new(Arc::clone(&broker), "amcp://edge1/meter");
        let event = publisher
            .event(Topic::parse("metrics.cpu").unwrap())
            .event_type("io.amcp.metrics.sample")
            .data(json!({"load": 0.4}))
            .build()
            .unwrap();
        publisher.publish(event).await.unwrap();

        tokio::time::sleep(Duration::from_millis(50)).await;
        {
            let seen = seen.lock().unwrap();
            assert_eq!(seen.len(), 1);
            assert_eq!(seen[0].source(), "amcp://edge1/meter");
        }

        subscriber
            .unsubscribe(&TopicPattern::parse("metrics.*").unwrap())
            .await
            .unwrap();
        let event = publisher
            .event(Topic::parse("metrics.cpu").unwrap())
            .event_type("io.amcp.metrics.sample")
            .build()
            .unwrap();
        publisher.publish(event).await.unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(seen.lock().unwrap().len(), 1);
    }
}
