use std::str::FromStr;
use std::sync::Arc;
use std::time::Instant;

use anyhow::{anyhow, bail, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::metrics::Metrics;
use crate::models::Trade;
use crate::pipeline::Processing;

/// Backend selector for the trade processor.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Backend {
    Kafka,
    ClickHouse,
}

impl Backend {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Kafka => "kafka",
            Self::ClickHouse => "clickhouse",
        }
    }
}

impl FromStr for Backend {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "kafka" => Ok(Self::Kafka),
            "clickhouse" => Ok(Self::ClickHouse),
            other => bail!("unknown backend: {other}"),
        }
    }
}

/// Publishes trades onto the message bus.
#[async_trait]
pub trait Publisher: Send + Sync {
    async fn publish(&self, trade: &Trade) -> Result<()>;
    async fn publish_batch(&self, trades: &[Trade]) -> Result<()>;
    async fn close(&self) -> Result<()>;
}

/// Persists trades into the columnar store.
#[async_trait]
pub trait TickStorage: Send + Sync {
    async fn store(&self, trade: &Trade) -> Result<()>;
    async fn store_batch(&self, trades: &[Trade]) -> Result<()>;
    async fn query(
        &self,
        symbol: &str,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
        limit: u32,
    ) -> Result<Vec<Trade>>;
    async fn health(&self) -> Result<()>;
}

/// Routes trades to the configured backend and records accounting
/// metrics. A pass-through with no batching of its own.
pub struct TradeProcessor {
    publisher: Option<Arc<dyn Publisher>>,
    storage: Option<Arc<dyn TickStorage>>,
    metrics: Arc<Metrics>,
    backend: Backend,
}

impl TradeProcessor {
    pub fn new(
        publisher: Option<Arc<dyn Publisher>>,
        storage: Option<Arc<dyn TickStorage>>,
        metrics: Arc<Metrics>,
        backend: Backend,
    ) -> Self {
        Self {
            publisher,
            storage,
            metrics,
            backend,
        }
    }

    pub async fn process(&self, trade: &Trade) -> Result<()> {
        let start = Instant::now();

        let res = match self.backend {
            Backend::Kafka => self.publisher()?.publish(trade).await,
            Backend::ClickHouse => self.storage()?.store(trade).await,
        };

        if let Err(e) = res {
            self.metrics.record_error("process");
            return Err(anyhow!("process trade: {e}"));
        }

        self.metrics.record_sent(self.backend.as_str(), &trade.symbol);
        self.metrics
            .record_latency("process", start.elapsed().as_secs_f64());
        Ok(())
    }

    pub async fn process_batch(&self, trades: &[Trade]) -> Result<()> {
        if trades.is_empty() {
            return Ok(());
        }
        let start = Instant::now();

        let res = match self.backend {
            Backend::Kafka => self.publisher()?.publish_batch(trades).await,
            Backend::ClickHouse => self.storage()?.store_batch(trades).await,
        };

        if let Err(e) = res {
            self.metrics.record_error("process_batch");
            return Err(anyhow!("process batch: {e}"));
        }

        for t in trades {
            self.metrics.record_sent(self.backend.as_str(), &t.symbol);
        }
        self.metrics
            .record_latency("process_batch", start.elapsed().as_secs_f64());
        Ok(())
    }

    /// Closes the underlying publisher. The store connection is owned
    /// by the client wrapper and closed by the app.
    pub async fn close(&self) {
        if let Some(p) = &self.publisher {
            if let Err(e) = p.close().await {
                tracing::warn!("publisher close error: {e}");
            }
        }
    }

    fn publisher(&self) -> Result<&Arc<dyn Publisher>> {
        self.publisher
            .as_ref()
            .ok_or_else(|| anyhow!("kafka backend selected but no publisher wired"))
    }

    fn storage(&self) -> Result<&Arc<dyn TickStorage>> {
        self.storage
            .as_ref()
            .ok_or_else(|| anyhow!("clickhouse backend selected but no storage wired"))
    }
}

#[async_trait]
impl Processing for TradeProcessor {
    async fn process(&self, trade: &Trade) -> Result<()> {
        TradeProcessor::process(self, trade).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct CountingPublisher {
        published: AtomicUsize,
        fail: bool,
    }

    #[async_trait]
    impl Publisher for CountingPublisher {
        async fn publish(&self, _trade: &Trade) -> Result<()> {
            if self.fail {
                bail!("broker down");
            }
            self.published.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }

        async fn publish_batch(&self, trades: &[Trade]) -> Result<()> {
            if self.fail {
                bail!("broker down");
            }
            self.published.fetch_add(trades.len(), Ordering::SeqCst);
            Ok(())
        }

        async fn close(&self) -> Result<()> {
            Ok(())
        }
    }

    fn trade(symbol: &str) -> Trade {
        Trade {
            symbol: symbol.to_string(),
            timestamp: 1_700_000_000,
            price: 100.0,
            volume: 1.0,
        }
    }

    #[test]
    fn backend_parses_closed_set() {
        assert_eq!("kafka".parse::<Backend>().unwrap(), Backend::Kafka);
        assert_eq!(
            "clickhouse".parse::<Backend>().unwrap(),
            Backend::ClickHouse
        );
        assert!("rabbitmq".parse::<Backend>().is_err());
    }

    #[tokio::test]
    async fn routes_to_publisher_on_kafka_backend() {
        let publisher = Arc::new(CountingPublisher {
            published: AtomicUsize::new(0),
            fail: false,
        });
        let proc = TradeProcessor::new(
            Some(publisher.clone()),
            None,
            Metrics::new().unwrap(),
            Backend::Kafka,
        );
        proc.process(&trade("BTCUSDT")).await.unwrap();
        proc.process_batch(&[trade("BTCUSDT"), trade("ETHUSDT")])
            .await
            .unwrap();
        assert_eq!(publisher.published.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn backend_error_is_surfaced_and_counted() {
        let publisher = Arc::new(CountingPublisher {
            published: AtomicUsize::new(0),
            fail: true,
        });
        let metrics = Metrics::new().unwrap();
        let proc = TradeProcessor::new(Some(publisher), None, metrics.clone(), Backend::Kafka);
        assert!(proc.process(&trade("BTCUSDT")).await.is_err());
        assert!(metrics.render().contains("kind=\"process\""));
    }

    #[tokio::test]
    async fn empty_batch_is_a_no_op() {
        let proc = TradeProcessor::new(None, None, Metrics::new().unwrap(), Backend::Kafka);
        proc.process_batch(&[]).await.unwrap();
    }
}
