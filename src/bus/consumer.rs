use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use anyhow::{anyhow, bail, Context, Result};
use futures_util::FutureExt;
use rand::Rng;
use rdkafka::config::ClientConfig;
use rdkafka::consumer::{CommitMode, Consumer, StreamConsumer};
use rdkafka::message::{Header, Message, OwnedHeaders};
use rdkafka::producer::{FutureProducer, FutureRecord};
use rdkafka::{Offset, TopicPartitionList};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{error, info, warn};

use super::hooks::{HandleError, HookChain, MessageMeta};
use super::MessageHandler;
use crate::config::ConsumerTuning;
use crate::metrics::Metrics;

const READ_DEADLINE: Duration = Duration::from_secs(3);
const COMMIT_ATTEMPTS: u32 = 3;
const COMMIT_BACKOFF_MIN: Duration = Duration::from_millis(50);
const COMMIT_BACKOFF_MAX: Duration = Duration::from_millis(500);

#[derive(Debug, Clone)]
pub struct ConsumerConfig {
    pub brokers: Vec<String>,
    pub group_id: String,
    pub auto_offset_reset: String,
    pub workers: usize,
    pub buffer_size: usize,
    pub retry_max: u32,
    pub backoff_min: Duration,
    pub backoff_max: Duration,
    pub dlq_topic: Option<String>,
    pub min_bytes: usize,
    pub max_bytes: usize,
}

impl ConsumerConfig {
    pub fn from_settings(brokers: Vec<String>, tuning: &ConsumerTuning) -> Self {
        Self {
            brokers,
            group_id: tuning.group_id.clone(),
            auto_offset_reset: tuning.auto_offset_reset.clone(),
            workers: tuning.workers.max(1),
            buffer_size: tuning.buffer_size.max(1),
            retry_max: tuning.retry_max,
            backoff_min: Duration::from_millis(tuning.backoff_min_ms),
            backoff_max: Duration::from_millis(tuning.backoff_max_ms),
            dlq_topic: (!tuning.dlq_topic.is_empty()).then(|| tuning.dlq_topic.clone()),
            min_bytes: tuning.min_bytes,
            max_bytes: tuning.max_bytes,
        }
    }
}

struct QueueItem {
    meta: MessageMeta,
    payload: Vec<u8>,
}

/// Kafka consumer delivering messages to registered handlers with
/// at-least-once semantics:
/// - one reader task per topic, one shared worker pool;
/// - at most one in-flight message per (topic, partition);
/// - bounded retries with jittered exponential backoff;
/// - dead-letter routing after exhaustion, then commit (so a poison
///   message cannot wedge the partition); without a DLQ the offset is
///   left uncommitted for redelivery;
/// - handler panics are recovered and treated as failures.
pub struct BusConsumer {
    cfg: ConsumerConfig,
    handlers: HashMap<String, Arc<dyn MessageHandler>>,
    consumers: Mutex<HashMap<String, Arc<StreamConsumer>>>,
    dlq: Option<FutureProducer>,
    hook: HookChain,
    metrics: Arc<Metrics>,
    part_locks: Mutex<HashMap<(String, i32), Arc<tokio::sync::Mutex<()>>>>,
    stop_tx: watch::Sender<bool>,
    queue_tx: Mutex<Option<mpsc::Sender<QueueItem>>>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
    stopped: Mutex<bool>,
}

impl BusConsumer {
    pub fn new(cfg: ConsumerConfig, metrics: Arc<Metrics>) -> Result<Self> {
        if cfg.brokers.is_empty() {
            bail!("brokers are required");
        }

        let dlq = match &cfg.dlq_topic {
            Some(_) => {
                let producer: FutureProducer = ClientConfig::new()
                    .set("bootstrap.servers", cfg.brokers.join(","))
                    .create()
                    .context("create dlq producer")?;
                Some(producer)
            }
            None => None,
        };

        let (stop_tx, _) = watch::channel(false);
        Ok(Self {
            cfg,
            handlers: HashMap::new(),
            consumers: Mutex::new(HashMap::new()),
            dlq,
            hook: HookChain::noop(),
            metrics,
            part_locks: Mutex::new(HashMap::new()),
            stop_tx,
            queue_tx: Mutex::new(None),
            tasks: Mutex::new(Vec::new()),
            stopped: Mutex::new(false),
        })
    }

    /// Registers a handler for its topic. Must happen before `start`;
    /// the handler map is read-only afterwards.
    pub fn register_handler(&mut self, handler: Arc<dyn MessageHandler>) {
        let topic = handler.topic().to_string();
        if self.handlers.contains_key(&topic) {
            warn!("handler already registered for topic {topic}");
            return;
        }
        self.handlers.insert(topic, handler);
    }

    /// Replaces the hook chain. Must happen before `start`.
    pub fn set_hooks(&mut self, hook: HookChain) {
        self.hook = hook;
    }

    pub fn start(self: &Arc<Self>) -> Result<()> {
        let (queue_tx, queue_rx) = mpsc::channel::<QueueItem>(self.cfg.buffer_size);
        *self.queue_tx.lock().expect("consumer lock poisoned") = Some(queue_tx.clone());

        let mut tasks = Vec::new();

        // Worker pool: bounded parallelism across partitions.
        let queue_rx = Arc::new(tokio::sync::Mutex::new(queue_rx));
        for _ in 0..self.cfg.workers {
            let this = Arc::clone(self);
            let rx = Arc::clone(&queue_rx);
            tasks.push(tokio::spawn(async move {
                loop {
                    let item = { rx.lock().await.recv().await };
                    match item {
                        Some(item) => this.handle_item(item).await,
                        None => return,
                    }
                }
            }));
        }

        // One reader per registered topic.
        for topic in self.handlers.keys() {
            let consumer = self.create_topic_consumer(topic)?;
            self.consumers
                .lock()
                .expect("consumer lock poisoned")
                .insert(topic.clone(), Arc::clone(&consumer));

            info!("kafka consumer: registered topic={topic}");
            let this = Arc::clone(self);
            let topic = topic.clone();
            let tx = queue_tx.clone();
            tasks.push(tokio::spawn(async move {
                this.read_loop(topic, consumer, tx).await;
            }));
        }

        *self.tasks.lock().expect("consumer lock poisoned") = tasks;
        info!("kafka consumer: started workers={}", self.cfg.workers);
        Ok(())
    }

    fn create_topic_consumer(&self, topic: &str) -> Result<Arc<StreamConsumer>> {
        let consumer: StreamConsumer = ClientConfig::new()
            .set("bootstrap.servers", self.cfg.brokers.join(","))
            .set("group.id", &self.cfg.group_id)
            .set("auto.offset.reset", &self.cfg.auto_offset_reset)
            .set("enable.auto.commit", "false")
            .set("fetch.min.bytes", self.cfg.min_bytes.to_string())
            .set("fetch.message.max.bytes", self.cfg.max_bytes.to_string())
            .create()
            .with_context(|| format!("create consumer for {topic}"))?;
        consumer
            .subscribe(&[topic])
            .with_context(|| format!("subscribe {topic}"))?;
        Ok(Arc::new(consumer))
    }

    /// Reads with a 3s deadline per iteration and enqueues with
    /// backpressure: above 80% fullness sleep 10ms between attempts,
    /// otherwise yield. Never drops.
    async fn read_loop(
        &self,
        topic: String,
        consumer: Arc<StreamConsumer>,
        tx: mpsc::Sender<QueueItem>,
    ) {
        let stop_rx = self.stop_tx.subscribe();
        loop {
            if *stop_rx.borrow() {
                return;
            }
            let m = match tokio::time::timeout(READ_DEADLINE, consumer.recv()).await {
                Err(_) => continue,
                Ok(Err(e)) => {
                    warn!("error reading message from topic {topic}: {e}");
                    continue;
                }
                Ok(Ok(m)) => m,
            };

            let mut item = QueueItem {
                meta: MessageMeta {
                    topic: topic.clone(),
                    partition: m.partition(),
                    offset: m.offset(),
                },
                payload: m.payload().map(<[u8]>::to_vec).unwrap_or_default(),
            };
            drop(m);

            loop {
                if *stop_rx.borrow() {
                    return;
                }
                match tx.try_send(item) {
                    Ok(()) => {
                        self.observe_queue(&topic, &tx);
                        break;
                    }
                    Err(mpsc::error::TrySendError::Full(it)) => {
                        item = it;
                        let fullness = self.observe_queue(&topic, &tx);
                        if fullness > 0.8 {
                            tokio::time::sleep(Duration::from_millis(10)).await;
                        } else {
                            tokio::task::yield_now().await;
                        }
                    }
                    Err(mpsc::error::TrySendError::Closed(_)) => return,
                }
            }
        }
    }

    fn observe_queue(&self, topic: &str, tx: &mpsc::Sender<QueueItem>) -> f64 {
        let cap = tx.max_capacity().max(1);
        let depth = cap.saturating_sub(tx.capacity());
        let fullness = depth as f64 / cap as f64;
        self.metrics
            .consumer_queue_depth
            .with_label_values(&[topic])
            .set(depth as i64);
        self.metrics
            .consumer_queue_fullness
            .with_label_values(&[topic])
            .set(fullness);
        fullness
    }

    async fn handle_item(&self, item: QueueItem) {
        let Some(handler) = self.handlers.get(&item.meta.topic) else {
            return;
        };
        let start = Instant::now();
        let mut stop_rx = self.stop_tx.subscribe();

        // At most one in-flight message per (topic, partition).
        let lock = self.partition_lock(&item.meta.topic, item.meta.partition);
        let _guard = lock.lock().await;

        let mut attempts: u32 = 0;
        let mut last_err: Option<HandleError> = None;
        loop {
            attempts += 1;

            let payload = match self.hook.before_handle(&item.meta, item.payload.clone()) {
                Ok(p) => p,
                Err(e) => {
                    // Hook rejection skips the handler and goes
                    // straight to the error path.
                    last_err = Some(e);
                    break;
                }
            };

            let outcome = std::panic::AssertUnwindSafe(handler.handle(&payload))
                .catch_unwind()
                .await;
            let err = match outcome {
                Ok(Ok(())) => None,
                Ok(Err(e)) => Some(HandleError::Handler(format!("{e:#}"))),
                Err(_) => Some(HandleError::Panic("handler panicked".to_string())),
            };
            self.hook.after_handle(&item.meta, &payload, err.as_ref());

            match err {
                None => {
                    last_err = None;
                    break;
                }
                Some(e) => {
                    if attempts > self.cfg.retry_max {
                        last_err = Some(e);
                        break;
                    }
                    self.hook.on_error(&item.meta, &payload, &e);
                    last_err = Some(e);
                    let sleep =
                        backoff_with_jitter(self.cfg.backoff_min, self.cfg.backoff_max, attempts);
                    tokio::select! {
                        _ = tokio::time::sleep(sleep) => {}
                        _ = stop_rx.changed() => return,
                    }
                }
            }
        }

        match last_err {
            None => {
                self.commit_with_retry(&item.meta).await;
            }
            Some(err) => {
                self.hook.on_error(&item.meta, &item.payload, &err);
                error!(
                    "error handling message from topic {} after {} attempts: {err}",
                    item.meta.topic, attempts
                );
                if let (Some(dlq), Some(dlq_topic)) = (&self.dlq, &self.cfg.dlq_topic) {
                    if let Err(e) = self
                        .write_dlq(dlq, dlq_topic, &item.meta.topic, &item.payload)
                        .await
                    {
                        error!("error writing to DLQ topic {dlq_topic}: {e}");
                    }
                    // Commit regardless of the DLQ write outcome to
                    // avoid a poison loop on this partition.
                    self.commit_with_retry(&item.meta).await;
                }
                // No DLQ: leave the offset uncommitted so the message
                // is redelivered after rebalance.
            }
        }

        self.metrics
            .consumer_handle_seconds
            .with_label_values(&[&item.meta.topic])
            .observe(start.elapsed().as_secs_f64());
    }

    async fn write_dlq(
        &self,
        dlq: &FutureProducer,
        dlq_topic: &str,
        source_topic: &str,
        payload: &[u8],
    ) -> Result<()> {
        let headers = OwnedHeaders::new().insert(Header {
            key: "source_topic",
            value: Some(source_topic.as_bytes()),
        });
        let record: FutureRecord<'_, (), [u8]> = FutureRecord::to(dlq_topic)
            .payload(payload)
            .headers(headers);
        dlq.send(record, rdkafka::util::Timeout::After(Duration::from_secs(5)))
            .await
            .map_err(|(e, _)| anyhow!("dlq write: {e}"))?;
        Ok(())
    }

    /// Commits offset+1 with bounded retries and jittered backoff.
    async fn commit_with_retry(&self, meta: &MessageMeta) {
        let consumer = {
            let consumers = self.consumers.lock().expect("consumer lock poisoned");
            consumers.get(&meta.topic).cloned()
        };
        let Some(consumer) = consumer else { return };

        let mut tpl = TopicPartitionList::new();
        if tpl
            .add_partition_offset(&meta.topic, meta.partition, Offset::Offset(meta.offset + 1))
            .is_err()
        {
            return;
        }

        for attempt in 1..=COMMIT_ATTEMPTS {
            match consumer.commit(&tpl, CommitMode::Sync) {
                Ok(()) => return,
                Err(e) => {
                    if attempt == COMMIT_ATTEMPTS {
                        error!("error committing message after {COMMIT_ATTEMPTS} attempts: {e}");
                        self.metrics.record_error("consumer_commit");
                        return;
                    }
                    let sleep =
                        backoff_with_jitter(COMMIT_BACKOFF_MIN, COMMIT_BACKOFF_MAX, attempt);
                    tokio::time::sleep(sleep).await;
                }
            }
        }
    }

    fn partition_lock(&self, topic: &str, partition: i32) -> Arc<tokio::sync::Mutex<()>> {
        let mut locks = self.part_locks.lock().expect("consumer lock poisoned");
        Arc::clone(
            locks
                .entry((topic.to_string(), partition))
                .or_insert_with(|| Arc::new(tokio::sync::Mutex::new(()))),
        )
    }

    /// Stops the consumer gracefully. Idempotent. Waits for readers
    /// and workers to drain, bounded by `deadline`; on timeout a
    /// timeout error is returned but readers and the DLQ writer are
    /// still closed.
    pub async fn stop(&self, deadline: Duration) -> Result<()> {
        {
            let mut stopped = self.stopped.lock().expect("consumer lock poisoned");
            if *stopped {
                return Ok(());
            }
            *stopped = true;
        }
        info!("kafka consumer: stopping...");

        let _ = self.stop_tx.send(true);
        // Dropping the sender closes the channel and drains workers.
        self.queue_tx.lock().expect("consumer lock poisoned").take();

        let tasks = std::mem::take(&mut *self.tasks.lock().expect("consumer lock poisoned"));
        let joined = futures_util::future::join_all(tasks);
        let timed_out = tokio::time::timeout(deadline, joined).await.is_err();

        // Close readers and the DLQ writer even on timeout.
        self.consumers
            .lock()
            .expect("consumer lock poisoned")
            .clear();

        if timed_out {
            bail!("timeout waiting for consumer to stop");
        }
        info!("kafka consumer: stopped");
        Ok(())
    }
}

/// Jittered exponential backoff: `min(min * 2^(attempt-1), max)` minus
/// a uniform jitter of up to half the exponential term.
pub(crate) fn backoff_with_jitter(min: Duration, max: Duration, attempt: u32) -> Duration {
    let min = if min.is_zero() {
        Duration::from_millis(50)
    } else {
        min
    };
    let max = max.max(min);
    let exp = min
        .saturating_mul(2u32.saturating_pow(attempt.saturating_sub(1)))
        .min(max);
    let half = exp / 2;
    if half.is_zero() {
        return exp;
    }
    let jitter = Duration::from_nanos(rand::thread_rng().gen_range(0..half.as_nanos() as u64));
    exp - jitter
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn backoff_never_exceeds_max_and_keeps_half_floor() {
        let min = Duration::from_millis(50);
        let max = Duration::from_secs(2);
        for attempt in 1..=10 {
            for _ in 0..50 {
                let d = backoff_with_jitter(min, max, attempt);
                let exp = min
                    .saturating_mul(2u32.saturating_pow(attempt - 1))
                    .min(max);
                assert!(d <= max, "attempt {attempt}: {d:?} > max");
                assert!(d > exp / 2, "attempt {attempt}: {d:?} <= half of {exp:?}");
            }
        }
    }

    #[test]
    fn backoff_zero_min_defaults_to_50ms_base() {
        let d = backoff_with_jitter(Duration::ZERO, Duration::from_secs(1), 1);
        assert!(d <= Duration::from_millis(50));
        assert!(d > Duration::from_millis(25));
    }

    #[test]
    fn backoff_caps_at_max_for_large_attempts() {
        let min = Duration::from_millis(50);
        let max = Duration::from_millis(200);
        let d = backoff_with_jitter(min, max, 30);
        assert!(d <= max);
        assert!(d > max / 2);
    }

    fn consumer() -> BusConsumer {
        let tuning = ConsumerTuning::default();
        BusConsumer::new(
            ConsumerConfig::from_settings(vec!["localhost:9092".to_string()], &tuning),
            Metrics::new().unwrap(),
        )
        .unwrap()
    }

    #[test]
    fn partition_locks_are_created_lazily_and_reused() {
        let c = consumer();
        let a1 = c.partition_lock("ticks", 0);
        let a2 = c.partition_lock("ticks", 0);
        let b = c.partition_lock("ticks", 1);
        let other = c.partition_lock("dlq", 0);
        assert!(Arc::ptr_eq(&a1, &a2));
        assert!(!Arc::ptr_eq(&a1, &b));
        assert!(!Arc::ptr_eq(&a1, &other));
    }

    #[test]
    fn dlq_topic_empty_means_disabled() {
        let c = consumer();
        assert!(c.cfg.dlq_topic.is_none());
        assert!(c.dlq.is_none());
    }

    use std::sync::atomic::{AtomicUsize, Ordering};

    struct FailingHandler {
        calls: AtomicUsize,
        panics: bool,
    }

    #[async_trait::async_trait]
    impl MessageHandler for FailingHandler {
        fn topic(&self) -> &str {
            "ticks"
        }

        async fn handle(&self, _payload: &[u8]) -> anyhow::Result<()> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if self.panics {
                panic!("handler exploded");
            }
            anyhow::bail!("handler failed")
        }
    }

    fn item() -> QueueItem {
        QueueItem {
            meta: MessageMeta {
                topic: "ticks".to_string(),
                partition: 0,
                offset: 0,
            },
            payload: b"x".to_vec(),
        }
    }

    #[tokio::test]
    async fn failing_handler_runs_retry_max_plus_one_times() {
        let tuning = ConsumerTuning {
            retry_max: 2,
            backoff_min_ms: 1,
            backoff_max_ms: 2,
            ..Default::default()
        };
        let mut c = BusConsumer::new(
            ConsumerConfig::from_settings(vec!["localhost:9092".to_string()], &tuning),
            Metrics::new().unwrap(),
        )
        .unwrap();
        let handler = Arc::new(FailingHandler {
            calls: AtomicUsize::new(0),
            panics: false,
        });
        c.register_handler(handler.clone());

        c.handle_item(item()).await;
        assert_eq!(handler.calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn handler_panic_is_recovered_and_treated_as_failure() {
        let tuning = ConsumerTuning {
            retry_max: 1,
            backoff_min_ms: 1,
            backoff_max_ms: 2,
            ..Default::default()
        };
        let mut c = BusConsumer::new(
            ConsumerConfig::from_settings(vec!["localhost:9092".to_string()], &tuning),
            Metrics::new().unwrap(),
        )
        .unwrap();
        let handler = Arc::new(FailingHandler {
            calls: AtomicUsize::new(0),
            panics: true,
        });
        c.register_handler(handler.clone());

        // The panic is recovered and retried like any failure; the
        // worker (this task) survives.
        c.handle_item(item()).await;
        assert_eq!(handler.calls.load(Ordering::SeqCst), 2);
    }
}
