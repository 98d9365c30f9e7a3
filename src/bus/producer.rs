use std::str::FromStr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::{anyhow, bail, Context, Result};
use async_trait::async_trait;
use rdkafka::config::ClientConfig;
use rdkafka::producer::{FutureProducer, FutureRecord, Producer};
use rdkafka::util::Timeout;
use serde_json::json;

use crate::config::KafkaConfig;
use crate::metrics::Metrics;
use crate::models::Trade;
use crate::processor::Publisher;

/// Payload compression codec.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Compression {
    Gzip,
    Snappy,
    Lz4,
    Zstd,
}

impl Compression {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Gzip => "gzip",
            Self::Snappy => "snappy",
            Self::Lz4 => "lz4",
            Self::Zstd => "zstd",
        }
    }
}

impl FromStr for Compression {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "gzip" | "" => Ok(Self::Gzip),
            "snappy" => Ok(Self::Snappy),
            "lz4" => Ok(Self::Lz4),
            "zstd" => Ok(Self::Zstd),
            other => bail!("unknown compression codec: {other}"),
        }
    }
}

/// Partition balancing mode. `HashByKey` is required whenever
/// per-symbol ordering matters: it keys messages by symbol and uses a
/// key-hash partitioner, so equal keys land on one partition.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Balancer {
    /// Spread across partitions without key affinity.
    Spread,
    HashByKey,
}

/// A value to publish. Non-byte values serialize to JSON.
pub enum BusValue {
    Bytes(Vec<u8>),
    Text(String),
    Json(serde_json::Value),
}

impl BusValue {
    fn into_bytes(self) -> Result<Vec<u8>> {
        match self {
            Self::Bytes(b) => Ok(b),
            Self::Text(s) => Ok(s.into_bytes()),
            Self::Json(v) => serde_json::to_vec(&v).context("marshal value"),
        }
    }
}

/// A single message for batched publishing.
pub struct BusMessage {
    pub key: Option<Vec<u8>>,
    pub value: BusValue,
}

/// Kafka producer with batched, compressed, acknowledged writes.
///
/// In async mode writes are fire-and-forget: delivery errors are
/// counted and only surfaced on `close`.
pub struct BusProducer {
    producer: FutureProducer,
    compression: Compression,
    balancer: Balancer,
    async_send: bool,
    send_timeout: Duration,
    metrics: Arc<Metrics>,
    async_errors: Arc<AtomicU64>,
}

impl BusProducer {
    pub fn new(cfg: &KafkaConfig, metrics: Arc<Metrics>) -> Result<Self> {
        if cfg.brokers.is_empty() {
            bail!("brokers are required");
        }
        let compression: Compression = cfg.producer.compression.parse()?;
        let balancer = if cfg.producer.hash_by_key {
            Balancer::HashByKey
        } else {
            Balancer::Spread
        };

        let acks = if cfg.producer.required_acks == -1 {
            "all".to_string()
        } else {
            cfg.producer.required_acks.to_string()
        };

        let mut client = ClientConfig::new();
        client
            .set("bootstrap.servers", cfg.brokers.join(","))
            .set("acks", acks)
            .set("compression.codec", compression.as_str())
            .set(
                "message.send.max.retries",
                cfg.producer.max_attempts.saturating_sub(1).to_string(),
            )
            .set("batch.num.messages", cfg.producer.batch_size.to_string())
            .set("batch.size", cfg.producer.batch_bytes.to_string())
            .set("linger.ms", cfg.producer.batch_timeout_ms.to_string())
            .set(
                "socket.timeout.ms",
                (cfg.producer.write_timeout_secs * 1000).to_string(),
            )
            .set(
                "message.timeout.ms",
                (cfg.producer.write_timeout_secs * 1000 * cfg.producer.max_attempts.max(1) as u64)
                    .to_string(),
            );
        if balancer == Balancer::HashByKey {
            client.set("partitioner", "murmur2_random");
        } else {
            client.set("partitioner", "random");
        }

        let producer: FutureProducer = client.create().context("create kafka producer")?;

        Ok(Self {
            producer,
            compression,
            balancer,
            async_send: cfg.producer.r#async,
            send_timeout: Duration::from_secs(cfg.producer.write_timeout_secs),
            metrics,
            async_errors: Arc::new(AtomicU64::new(0)),
        })
    }

    /// Publishes one message. The key is dropped in spread mode so the
    /// partitioner balances freely.
    pub async fn publish(&self, topic: &str, key: Option<&[u8]>, value: BusValue) -> Result<()> {
        let start = Instant::now();
        let bytes = value.into_bytes()?;
        let len = bytes.len() as u64;

        let res = self.send_one(topic, key, bytes).await;
        self.observe(topic, len, 1, start, res.is_err());
        res
    }

    /// Publishes a batch of messages in one call; all payloads are
    /// enqueued before any delivery is awaited so librdkafka can batch
    /// them.
    pub async fn publish_batch(&self, topic: &str, messages: Vec<BusMessage>) -> Result<()> {
        if messages.is_empty() {
            return Ok(());
        }
        let start = Instant::now();
        let count = messages.len();

        let mut payloads = Vec::with_capacity(count);
        let mut total_bytes = 0u64;
        for m in messages {
            let bytes = m.value.into_bytes()?;
            total_bytes += bytes.len() as u64;
            payloads.push((m.key, bytes));
        }

        let mut first_err: Option<anyhow::Error> = None;
        let mut deliveries = Vec::with_capacity(count);
        for (key, bytes) in payloads {
            deliveries.push(self.enqueue(topic, key.as_deref(), bytes));
        }
        for delivery in deliveries {
            match delivery {
                Ok(fut) => {
                    if self.async_send {
                        self.spawn_async_watch(fut);
                    } else if let Err(e) = Self::await_delivery(fut).await {
                        first_err.get_or_insert(e);
                    }
                }
                Err(e) => {
                    first_err.get_or_insert(e);
                }
            }
        }

        let failed = first_err.is_some();
        self.observe(topic, total_bytes, count as u64, start, failed);
        match first_err {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    async fn send_one(&self, topic: &str, key: Option<&[u8]>, bytes: Vec<u8>) -> Result<()> {
        let fut = self.enqueue(topic, key, bytes)?;
        if self.async_send {
            self.spawn_async_watch(fut);
            return Ok(());
        }
        Self::await_delivery(fut).await
    }

    fn enqueue(
        &self,
        topic: &str,
        key: Option<&[u8]>,
        bytes: Vec<u8>,
    ) -> Result<rdkafka::producer::DeliveryFuture> {
        let mut record: FutureRecord<'_, [u8], Vec<u8>> =
            FutureRecord::to(topic).payload(&bytes);
        if self.balancer == Balancer::HashByKey {
            if let Some(k) = key {
                record = record.key(k);
            }
        }
        self.producer
            .send_result(record)
            .map_err(|(e, _record)| anyhow!("enqueue: {e}"))
    }

    async fn await_delivery(fut: rdkafka::producer::DeliveryFuture) -> Result<()> {
        match fut.await {
            Ok(Ok(_)) => Ok(()),
            Ok(Err((e, _msg))) => Err(anyhow!("delivery failed: {e}")),
            Err(_) => Err(anyhow!("delivery canceled")),
        }
    }

    fn spawn_async_watch(&self, fut: rdkafka::producer::DeliveryFuture) {
        let metrics = Arc::clone(&self.metrics);
        let errors = Arc::clone(&self.async_errors);
        tokio::spawn(async move {
            if Self::await_delivery(fut).await.is_err() {
                errors.fetch_add(1, Ordering::Relaxed);
                metrics.record_error("producer_async_delivery");
            }
        });
    }

    fn observe(&self, topic: &str, bytes: u64, count: u64, start: Instant, failed: bool) {
        let comp = self.compression.as_str();
        let result = if failed { "error" } else { "ok" };
        if failed {
            self.metrics
                .producer_errors
                .with_label_values(&[topic])
                .inc();
        }
        self.metrics
            .producer_messages
            .with_label_values(&[topic, comp, result])
            .inc_by(count);
        self.metrics
            .producer_bytes
            .with_label_values(&[topic, comp])
            .inc_by(bytes);
        self.metrics
            .producer_publish_seconds
            .with_label_values(&[topic])
            .observe(start.elapsed().as_secs_f64());
    }

    /// Flushes outstanding messages. Surfaces async-mode delivery
    /// errors accumulated since the last close.
    pub async fn close(&self) -> Result<()> {
        let producer = self.producer.clone();
        let timeout = self.send_timeout;
        tokio::task::spawn_blocking(move || producer.flush(Timeout::After(timeout)))
            .await
            .context("flush join")?
            .context("flush")?;
        let failed = self.async_errors.swap(0, Ordering::Relaxed);
        if failed > 0 {
            bail!("{failed} async deliveries failed");
        }
        Ok(())
    }
}

/// Publishes trades on the bus in the tick wire format, keyed by
/// symbol.
pub struct TradePublisher {
    producer: Arc<BusProducer>,
    topic: String,
}

impl TradePublisher {
    pub fn new(producer: Arc<BusProducer>, topic: String) -> Self {
        Self { producer, topic }
    }

    fn value(trade: &Trade) -> BusValue {
        BusValue::Json(json!({
            "symbol": trade.symbol,
            "t": trade.timestamp,
            "c": trade.price,
            "v": trade.volume,
        }))
    }
}

#[async_trait]
impl Publisher for TradePublisher {
    async fn publish(&self, trade: &Trade) -> Result<()> {
        self.producer
            .publish(
                &self.topic,
                Some(trade.symbol.as_bytes()),
                Self::value(trade),
            )
            .await
    }

    async fn publish_batch(&self, trades: &[Trade]) -> Result<()> {
        let messages = trades
            .iter()
            .map(|t| BusMessage {
                key: Some(t.symbol.as_bytes().to_vec()),
                value: Self::value(t),
            })
            .collect();
        self.producer.publish_batch(&self.topic, messages).await
    }

    async fn close(&self) -> Result<()> {
        self.producer.close().await
    }
}
