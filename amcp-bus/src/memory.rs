//! In-memory reference broker.
//!
//! Fan-out is push-based: every subscriber owns a fixed set of serial lanes,
//! each backed by a bounded queue and a dispatch worker. Events sharing a
//! correlation id hash onto the same lane, which yields the
//! ORDERED_BY_CORRELATION guarantee without serializing unrelated traffic.

use std::collections::HashMap;
use std::hash::{DefaultHasher, Hash, Hasher};
use std::num::NonZeroUsize;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use serde_json::json;
use tokio::sync::{Mutex, RwLock, mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::{sleep, timeout};
use tracing::{debug, warn};

use amcp_events::{DeliveryOptions, Event, to_cloudevents};
use amcp_primitives::{Topic, TopicPattern};

use crate::DEADLETTER_TOPIC;
use crate::broker::{BusError, BusResult, EventBroker, EventHandler, HandlerError};
use crate::metrics::{BrokerMetrics, BrokerMetricsSnapshot};

/// Tuning knobs for [`InMemoryBroker`].
#[derive(Debug, Clone, Copy)]
pub struct BrokerConfig {
    queue_capacity: NonZeroUsize,
    lanes_per_subscriber: NonZeroUsize,
    max_retries: u32,
    retry_base_delay: Duration,
    retry_max_delay: Duration,
    enqueue_timeout: Duration,
    handler_deadline: Duration,
    drain_timeout: Duration,
}

impl BrokerConfig {
    /// Sets the per-lane queue capacity.
    #[must_use]
    pub const fn with_queue_capacity(mut self, capacity: NonZeroUsize) -> Self {
        self.queue_capacity = capacity;
        self
    }

    /// Sets the number of serial dispatch lanes per subscriber.
    #[must_use]
    pub const fn with_lanes_per_subscriber(mut self, lanes: NonZeroUsize) -> Self {
        self.lanes_per_subscriber = lanes;
        self
    }

    /// Sets the RELIABLE redelivery budget.
    #[must_use]
    pub const fn with_max_retries(mut self, retries: u32) -> Self {
        self.max_retries = retries;
        self
    }

    /// Sets the initial retry backoff delay.
    #[must_use]
    pub const fn with_retry_base_delay(mut self, delay: Duration) -> Self {
        self.retry_base_delay = delay;
        self
    }

    /// Sets the retry backoff ceiling.
    #[must_use]
    pub const fn with_retry_max_delay(mut self, delay: Duration) -> Self {
        self.retry_max_delay = delay;
        self
    }

    /// Sets how long a RELIABLE publish blocks on a saturated lane before the
    /// event is dead-lettered.
    #[must_use]
    pub const fn with_enqueue_timeout(mut self, timeout: Duration) -> Self {
        self.enqueue_timeout = timeout;
        self
    }

    /// Sets the per-invocation handler execution deadline.
    #[must_use]
    pub const fn with_handler_deadline(mut self, deadline: Duration) -> Self {
        self.handler_deadline = deadline;
        self
    }

    /// Sets the shutdown drain budget.
    #[must_use]
    pub const fn with_drain_timeout(mut self, timeout: Duration) -> Self {
        self.drain_timeout = timeout;
        self
    }

    /// Validates the configuration.
    ///
    /// # Errors
    ///
    /// Returns [`BusError::InvalidConfig`] when any duration is zero or the
    /// backoff bounds are inconsistent.
    pub fn validate(self) -> BusResult<()> {
        if self.retry_base_delay.is_zero() {
            return Err(BusError::InvalidConfig(
                "retry base delay must be greater than zero",
            ));
        }
        if self.retry_base_delay > self.retry_max_delay {
            return Err(BusError::InvalidConfig(
                "retry base delay cannot exceed retry max delay",
            ));
        }
        if self.enqueue_timeout.is_zero() {
            return Err(BusError::InvalidConfig(
                "enqueue timeout must be greater than zero",
            ));
        }
        if self.handler_deadline.is_zero() {
            return Err(BusError::InvalidConfig(
                "handler deadline must be greater than zero",
            ));
        }
        Ok(())
    }
}

impl Default for BrokerConfig {
    fn default() -> Self {
        Self {
            queue_capacity: NonZeroUsize::new(256).expect("non-zero"),
            lanes_per_subscriber: NonZeroUsize::new(4).expect("non-zero"),
            max_retries: 3,
            retry_base_delay: Duration::from_millis(50),
            retry_max_delay: Duration::from_secs(2),
            enqueue_timeout: Duration::from_secs(1),
            handler_deadline: Duration::from_secs(30),
            drain_timeout: Duration::from_secs(5),
        }
    }
}

struct LaneJob {
    event: Event,
    handler: Arc<dyn EventHandler>,
    subscriber: Arc<str>,
}

struct DeadLetterJob {
    event: Event,
    reason: String,
    subscriber: Arc<str>,
    attempts: u32,
}

struct WorkerShared {
    config: BrokerConfig,
    metrics: Arc<BrokerMetrics>,
    deadletter_tx: mpsc::UnboundedSender<DeadLetterJob>,
}

struct SubscriberState {
    lanes: Vec<mpsc::Sender<LaneJob>>,
    workers: Vec<JoinHandle<()>>,
    subscriptions: HashMap<TopicPattern, Arc<dyn EventHandler>>,
    next_lane: AtomicUsize,
}

impl SubscriberState {
    fn spawn(subscriber: &str, shared: &Arc<WorkerShared>) -> Self {
        let lane_count = shared.config.lanes_per_subscriber.get();
        let mut lanes = Vec::with_capacity(lane_count);
        let mut workers = Vec::with_capacity(lane_count);
        for lane in 0..lane_count {
            let (tx, rx) = mpsc::channel(shared.config.queue_capacity.get());
            lanes.push(tx);
            let shared = Arc::clone(shared);
            let subscriber = subscriber.to_owned();
            workers.push(tokio::spawn(async move {
                run_lane(rx, shared).await;
                debug!(subscriber, lane, "dispatch lane drained");
            }));
        }
        Self {
            lanes,
            workers,
            subscriptions: HashMap::new(),
            next_lane: AtomicUsize::new(0),
        }
    }

    fn pick_lane(&self, event: &Event) -> &mpsc::Sender<LaneJob> {
        let lane_count = self.lanes.len();
        let index = match (event.delivery(), event.correlation_id()) {
            (DeliveryOptions::OrderedByCorrelation, Some(correlation_id)) => {
                let mut hasher = DefaultHasher::new();
                correlation_id.hash(&mut hasher);
                usize::try_from(hasher.finish() % lane_count as u64).unwrap_or(0)
            }
            _ => self.next_lane.fetch_add(1, Ordering::Relaxed) % lane_count,
        };
        &self.lanes[index]
    }
}

struct Inner {
    config: BrokerConfig,
    running: AtomicBool,
    subscribers: RwLock<HashMap<String, SubscriberState>>,
    metrics: Arc<BrokerMetrics>,
    worker_shared: Arc<WorkerShared>,
    deadletter_rx: Mutex<Option<mpsc::UnboundedReceiver<DeadLetterJob>>>,
    pump: Mutex<Option<JoinHandle<()>>>,
    shutdown: watch::Sender<bool>,
}

/// Reference broker delivering events inside a single process.
#[derive(Clone)]
pub struct InMemoryBroker {
    inner: Arc<Inner>,
}

impl InMemoryBroker {
    /// Creates a broker with the supplied configuration.
    ///
    /// # Errors
    ///
    /// Returns [`BusError::InvalidConfig`] when the configuration fails
    /// validation.
    pub fn new(config: BrokerConfig) -> BusResult<Self> {
        config.validate()?;
        let metrics = Arc::new(BrokerMetrics::default());
        let (deadletter_tx, deadletter_rx) = mpsc::unbounded_channel();
        let (shutdown, _) = watch::channel(false);
        let worker_shared = Arc::new(WorkerShared {
            config,
            metrics: Arc::clone(&metrics),
            deadletter_tx,
        });
        Ok(Self {
            inner: Arc::new(Inner {
                config,
                running: AtomicBool::new(false),
                subscribers: RwLock::new(HashMap::new()),
                metrics,
                worker_shared,
                deadletter_rx: Mutex::new(Some(deadletter_rx)),
                pump: Mutex::new(None),
                shutdown,
            }),
        })
    }

    /// Creates a broker with default configuration.
    ///
    /// # Panics
    ///
    /// Never panics; the default configuration is valid by construction.
    #[must_use]
    pub fn with_defaults() -> Self {
        Self::new(BrokerConfig::default()).expect("default configuration is valid")
    }
}

impl Inner {
    async fn fanout(&self, event: Event) {
        // Collect matching lanes under the lock, then enqueue without it so a
        // saturated subscriber cannot stall subscription management.
        let mut deliveries: Vec<(mpsc::Sender<LaneJob>, LaneJob)> = Vec::new();
        {
            let subscribers = self.subscribers.read().await;
            for (subscriber_id, state) in subscribers.iter() {
                let subscriber: Arc<str> = Arc::from(subscriber_id.as_str());
                for (pattern, handler) in &state.subscriptions {
                    if pattern.matches(event.topic()) {
                        let lane = state.pick_lane(&event).clone();
                        deliveries.push((
                            lane,
                            LaneJob {
                                event: event.clone(),
                                handler: Arc::clone(handler),
                                subscriber: Arc::clone(&subscriber),
                            },
                        ));
                    }
                }
            }
        }

        for (lane, job) in deliveries {
            match job.event.delivery() {
                DeliveryOptions::BestEffort => {
                    if lane.try_send(job).is_err() {
                        BrokerMetrics::bump(&self.metrics.dropped);
                        debug!(topic = %event.topic(), "best-effort event dropped on full lane");
                    }
                }
                DeliveryOptions::Reliable => {
                    let subscriber = Arc::clone(&job.subscriber);
                    let enqueue = timeout(self.config.enqueue_timeout, lane.send(job));
                    if enqueue.await.map_or(true, |sent| sent.is_err()) {
                        self.send_to_deadletter(
                            event.clone(),
                            "subscriber queue saturated".to_owned(),
                            subscriber,
                            0,
                        );
                    }
                }
                DeliveryOptions::OrderedByCorrelation => {
                    let enqueue = timeout(self.config.enqueue_timeout, lane.send(job));
                    if enqueue.await.map_or(true, |sent| sent.is_err()) {
                        BrokerMetrics::bump(&self.metrics.dropped);
                        warn!(topic = %event.topic(), "ordered event dropped on saturated lane");
                    }
                }
            }
        }
    }

    fn send_to_deadletter(&self, event: Event, reason: String, subscriber: Arc<str>, attempts: u32) {
        if event.topic().as_str() == DEADLETTER_TOPIC {
            // Never recurse on the dead-letter topic itself.
            BrokerMetrics::bump(&self.metrics.dropped);
            return;
        }
        let _ = self.worker_shared.deadletter_tx.send(DeadLetterJob {
            event,
            reason,
            subscriber,
            attempts,
        });
    }
}

fn backoff_delay(config: &BrokerConfig, attempt: u32) -> Duration {
    let factor = 2u32.saturating_pow(attempt);
    config
        .retry_base_delay
        .saturating_mul(factor)
        .min(config.retry_max_delay)
}

async fn run_lane(mut rx: mpsc::Receiver<LaneJob>, shared: Arc<WorkerShared>) {
    while let Some(job) = rx.recv().await {
        deliver(&shared, job).await;
    }
}

async fn deliver(shared: &Arc<WorkerShared>, job: LaneJob) {
    let reliable = job.event.delivery() == DeliveryOptions::Reliable;
    let mut attempt: u32 = 0;

    loop {
        let outcome = match timeout(
            shared.config.handler_deadline,
            job.handler.handle_event(job.event.clone()),
        )
        .await
        {
            Ok(Ok(())) => {
                BrokerMetrics::bump(&shared.metrics.delivered);
                return;
            }
            Ok(Err(err)) => err,
            Err(_) => HandlerError::DeadlineExceeded,
        };

        BrokerMetrics::bump(&shared.metrics.handler_failures);

        if !reliable {
            BrokerMetrics::bump(&shared.metrics.dropped);
            debug!(
                subscriber = %job.subscriber,
                topic = %job.event.topic(),
                error = %outcome,
                "handler failed; event not retryable"
            );
            return;
        }

        if attempt >= shared.config.max_retries {
            warn!(
                subscriber = %job.subscriber,
                topic = %job.event.topic(),
                attempts = attempt + 1,
                error = %outcome,
                "retry budget exhausted; dead-lettering"
            );
            if job.event.topic().as_str() != DEADLETTER_TOPIC {
                let _ = shared.deadletter_tx.send(DeadLetterJob {
                    event: job.event,
                    reason: outcome.to_string(),
                    subscriber: job.subscriber,
                    attempts: attempt + 1,
                });
            } else {
                BrokerMetrics::bump(&shared.metrics.dropped);
            }
            return;
        }

        BrokerMetrics::bump(&shared.metrics.retried);
        sleep(backoff_delay(&shared.config, attempt)).await;
        attempt += 1;
    }
}

fn deadletter_event(job: &DeadLetterJob) -> Event {
    let topic = Topic::parse(DEADLETTER_TOPIC).expect("reserved topic is valid");
    let mut builder = Event::builder(topic)
        .event_type("io.amcp.bus.deadletter")
        .source("amcp://bus/deadletter")
        .data(json!({
            "original": to_cloudevents(&job.event),
            "failureReason": job.reason,
            "failedSubscriber": job.subscriber.as_ref(),
            "attempts": job.attempts,
        }));
    if let Some(correlation_id) = job.event.correlation_id() {
        builder = builder.correlation_id(correlation_id);
    }
    if let Some(trace_id) = job.event.trace_id() {
        builder = builder.trace_id(trace_id);
    }
    if let Some(span_id) = job.event.span_id() {
        builder = builder.span_id(span_id);
    }
    builder.build().expect("dead-letter envelope is valid")
}

async fn run_pump(
    mut rx: mpsc::UnboundedReceiver<DeadLetterJob>,
    inner: std::sync::Weak<Inner>,
    mut shutdown: watch::Receiver<bool>,
) {
    loop {
        let job = tokio::select! {
            job = rx.recv() => job,
            _ = shutdown.changed() => {
                if *shutdown.borrow() {
                    // Drain whatever is already queued, then exit.
                    while let Ok(job) = rx.try_recv() {
                        pump_one(&inner, job).await;
                    }
                    return;
                }
                continue;
            }
        };
        let Some(job) = job else { return };
        pump_one(&inner, job).await;
    }
}

async fn pump_one(inner: &std::sync::Weak<Inner>, job: DeadLetterJob) {
    let Some(inner) = inner.upgrade() else { return };
    BrokerMetrics::bump(&inner.metrics.dead_lettered);
    let event = deadletter_event(&job);
    inner.fanout(event).await;
}

#[async_trait]
impl EventBroker for InMemoryBroker {
    async fn start(&self) -> BusResult<()> {
        if self.inner.running.swap(true, Ordering::AcqRel) {
            return Ok(());
        }
        let _ = self.inner.shutdown.send(false);
        let rx = self.inner.deadletter_rx.lock().await.take();
        if let Some(rx) = rx {
            let weak = Arc::downgrade(&self.inner);
            let shutdown = self.inner.shutdown.subscribe();
            let handle = tokio::spawn(run_pump(rx, weak, shutdown));
            *self.inner.pump.lock().await = Some(handle);
        }
        Ok(())
    }

    async fn stop(&self) -> BusResult<()> {
        if !self.inner.running.swap(false, Ordering::AcqRel) {
            return Ok(());
        }
        let _ = self.inner.shutdown.send(true);

        let states: Vec<SubscriberState> = {
            let mut subscribers = self.inner.subscribers.write().await;
            let drained = subscribers.drain().map(|(_, state)| state).collect();
            drained
        };

        let mut workers = Vec::new();
        for mut state in states {
            let removed = state.subscriptions.len() as u64;
            self.inner
                .metrics
                .active_subscriptions
                .fetch_sub(removed, Ordering::Relaxed);
            state.lanes.clear(); // closing the senders lets each lane drain
            workers.append(&mut state.workers);
        }

        let drain = async {
            for worker in workers {
                let _ = worker.await;
            }
            if let Some(pump) = self.inner.pump.lock().await.take() {
                let _ = pump.await;
            }
        };
        if timeout(self.inner.config.drain_timeout, drain).await.is_err() {
            warn!("broker drain timeout exceeded; remaining workers aborted");
        }
        Ok(())
    }

    fn is_running(&self) -> bool {
        self.inner.running.load(Ordering::Acquire)
    }

    async fn publish(&self, event: Event) -> BusResult<()> {
        if !self.is_running() {
            return Err(BusError::NotRunning);
        }
        BrokerMetrics::bump(&self.inner.metrics.published);
        self.inner.fanout(event).await;
        Ok(())
    }

    async fn subscribe(
        &self,
        subscriber_id: &str,
        pattern: TopicPattern,
        handler: Arc<dyn EventHandler>,
    ) -> BusResult<()> {
        let mut subscribers = self.inner.subscribers.write().await;
        let state = subscribers
            .entry(subscriber_id.to_owned())
            .or_insert_with(|| SubscriberState::spawn(subscriber_id, &self.inner.worker_shared));
        if state.subscriptions.contains_key(&pattern) {
            return Err(BusError::AlreadySubscribed {
                subscriber: subscriber_id.to_owned(),
                pattern,
            });
        }
        debug!(subscriber = subscriber_id, pattern = %pattern, "subscription added");
        state.subscriptions.insert(pattern, handler);
        BrokerMetrics::bump(&self.inner.metrics.active_subscriptions);
        Ok(())
    }

    async fn unsubscribe(&self, subscriber_id: &str, pattern: &TopicPattern) -> BusResult<()> {
        let mut subscribers = self.inner.subscribers.write().await;
        let Some(state) = subscribers.get_mut(subscriber_id) else {
            return Err(BusError::NotSubscribed {
                subscriber: subscriber_id.to_owned(),
                pattern: pattern.clone(),
            });
        };
        if state.subscriptions.remove(pattern).is_none() {
            return Err(BusError::NotSubscribed {
                subscriber: subscriber_id.to_owned(),
                pattern: pattern.clone(),
            });
        }
        self.inner
            .metrics
            .active_subscriptions
            .fetch_sub(1, Ordering::Relaxed);
        if state.subscriptions.is_empty() {
            // Dropping the state closes the lanes; workers exit once drained.
            subscribers.remove(subscriber_id);
        }
        Ok(())
    }

    fn metrics(&self) -> BrokerMetricsSnapshot {
        self.inner.metrics.snapshot()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::broker::handler_fn;
    use std::sync::Mutex as StdMutex;
    use std::sync::atomic::AtomicU32;

    fn topic(s: &str) -> Topic {
        Topic::parse(s).expect("topic")
    }

    fn pattern(s: &str) -> TopicPattern {
        TopicPattern::parse(s).expect("pattern")
    }

    fn event(topic_str: &str, delivery: DeliveryOptions) -> Event {
        Event::builder(topic(topic_str))
            .event_type("io.amcp.test")
            .source("amcp://test")
            .delivery(delivery)
            .build()
            .expect("event")
    }

    async fn started_broker() -> InMemoryBroker {
        let broker = InMemoryBroker::with_defaults();
        broker.start().await.expect("start");
        broker
    }

    #[tokio::test]
    async fn fans_out_to_matching_subscribers_only() {
        let broker = started_broker().await;
        let wide = Arc::new(AtomicU32::new(0));
        let narrow = Arc::new(AtomicU32::new(0));

        let wide_count = Arc::clone(&wide);
        broker
            .subscribe(
                "a1",
                pattern("weather.**"),
                handler_fn(move |_| {
                    let wide_count = Arc::clone(&wide_count);
                    async move {
                        wide_count.fetch_add(1, Ordering::SeqCst);
                        Ok(())
                    }
                }),
            )
            .await
            .unwrap();

        let narrow_count = Arc::clone(&narrow);
        broker
            .subscribe(
                "a2",
                pattern("weather.alert.*"),
                handler_fn(move |_| {
                    let narrow_count = Arc::clone(&narrow_count);
                    async move {
                        narrow_count.fetch_add(1, Ordering::SeqCst);
                        Ok(())
                    }
                }),
            )
            .await
            .unwrap();

        broker
            .publish(event("weather.alert.storm", DeliveryOptions::BestEffort))
            .await
            .unwrap();
        broker
            .publish(event("weather.temperature", DeliveryOptions::BestEffort))
            .await
            .unwrap();

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(wide.load(Ordering::SeqCst), 2);
        assert_eq!(narrow.load(Ordering::SeqCst), 1);
        assert_eq!(broker.metrics().delivered, 3);
    }

    #[tokio::test]
    async fn duplicate_subscription_is_rejected() {
        let broker = started_broker().await;
        let handler = handler_fn(|_| async { Ok(()) });
        broker
            .subscribe("a1", pattern("t.*"), Arc::clone(&handler))
            .await
            .unwrap();
        let err = broker
            .subscribe("a1", pattern("t.*"), handler)
            .await
            .expect_err("duplicate");
        assert!(matches!(err, BusError::AlreadySubscribed { .. }));
    }

    #[tokio::test]
    async fn publish_requires_running_broker() {
        let broker = InMemoryBroker::with_defaults();
        let err = broker
            .publish(event("t.a", DeliveryOptions::BestEffort))
            .await
            .expect_err("not running");
        assert!(matches!(err, BusError::NotRunning));
    }

    #[tokio::test]
    async fn ordered_events_preserve_publish_order_per_correlation() {
        let broker = started_broker().await;
        let seen: Arc<StdMutex<Vec<String>>> = Arc::new(StdMutex::new(Vec::new()));

        let sink = Arc::clone(&seen);
        broker
            .subscribe(
                "slow",
                pattern("t.a"),
                handler_fn(move |event: Event| {
                    let sink = Arc::clone(&sink);
                    async move {
                        // Slow handler makes interleaving visible if ordering
                        // were ever violated.
                        sleep(Duration::from_millis(10)).await;
                        let marker = event
                            .metadata()
                            .get("seq")
                            .cloned()
                            .unwrap_or_default();
                        sink.lock().unwrap().push(marker);
                        Ok(())
                    }
                }),
            )
            .await
            .unwrap();

        for seq in ["1", "2", "3"] {
            let event = Event::builder(topic("t.a"))
                .event_type("io.amcp.test")
                .source("amcp://test")
                .correlation_id("c1")
                .delivery(DeliveryOptions::OrderedByCorrelation)
                .metadata_entry("seq", seq)
                .build()
                .unwrap();
            broker.publish(event).await.unwrap();
        }

        tokio::time::sleep(Duration::from_millis(200)).await;
        assert_eq!(*seen.lock().unwrap(), vec!["1", "2", "3"]);
    }

    #[tokio::test]
    async fn reliable_failure_dead_letters_exactly_once() {
        let config = BrokerConfig::default()
            .with_max_retries(2)
            .with_retry_base_delay(Duration::from_millis(5))
            .with_retry_max_delay(Duration::from_millis(10));
        let broker = InMemoryBroker::new(config).unwrap();
        broker.start().await.unwrap();

        broker
            .subscribe(
                "failing",
                pattern("t.a"),
                handler_fn(|_| async { Err(HandlerError::failed("boom")) }),
            )
            .await
            .unwrap();

        let dead: Arc<StdMutex<Vec<Event>>> = Arc::new(StdMutex::new(Vec::new()));
        let sink = Arc::clone(&dead);
        broker
            .subscribe(
                "observer",
                pattern("system.deadletter"),
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

        broker
            .publish(event("t.a", DeliveryOptions::Reliable))
            .await
            .unwrap();

        tokio::time::sleep(Duration::from_millis(300)).await;
        let dead = dead.lock().unwrap();
        assert_eq!(dead.len(), 1, "exactly one dead-letter per subscriber");
        let payload = dead[0].data().expect("payload");
        assert_eq!(payload["failedSubscriber"], "failing");
        assert!(
            payload["failureReason"]
                .as_str()
                .unwrap()
                .contains("boom")
        );
        assert_eq!(broker.metrics().dead_lettered, 1);
        assert!(broker.metrics().retried >= 2);

        // The failing subscriber stays subscribed and healthy afterwards.
        assert_eq!(broker.metrics().active_subscriptions, 2);
    }

    #[tokio::test]
    async fn best_effort_drops_when_lane_is_full() {
        let config = BrokerConfig::default()
            .with_queue_capacity(NonZeroUsize::new(1).unwrap())
            .with_lanes_per_subscriber(NonZeroUsize::new(1).unwrap());
        let broker = InMemoryBroker::new(config).unwrap();
        broker.start().await.unwrap();

        broker
            .subscribe(
                "slow",
                pattern("t.a"),
                handler_fn(|_| async {
                    sleep(Duration::from_millis(200)).await;
                    Ok(())
                }),
            )
            .await
            .unwrap();

        for _ in 0..8 {
            broker
                .publish(event("t.a", DeliveryOptions::BestEffort))
                .await
                .unwrap();
        }

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(broker.metrics().dropped > 0);
    }

    #[tokio::test]
    async fn unsubscribe_removes_delivery() {
        let broker = started_broker().await;
        let count = Arc::new(AtomicU32::new(0));
        let counter = Arc::clone(&count);
        broker
            .subscribe(
                "a1",
                pattern("t.a"),
                handler_fn(move |_| {
                    let counter = Arc::clone(&counter);
                    async move {
                        counter.fetch_add(1, Ordering::SeqCst);
                        Ok(())
                    }
                }),
            )
            .await
            .unwrap();

        broker.unsubscribe("a1", &pattern("t.a")).await.unwrap();
        broker
            .publish(event("t.a", DeliveryOptions::BestEffort))
            .await
            .unwrap();
        tokio::time::sleep(Duration::from_millis(30)).await;
        assert_eq!(count.load(Ordering::SeqCst), 0);

        let err = broker
            .unsubscribe("a1", &pattern("t.a"))
            .await
            .expect_err("already removed");
        assert!(matches!(err, BusError::NotSubscribed { .. }));
    }
}
