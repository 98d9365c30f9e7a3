pub mod consumer;
pub mod hooks;
pub mod producer;

use std::sync::Arc;
use std::time::Instant;

use anyhow::Result;
use async_trait::async_trait;
use chrono::{TimeZone, Utc};
use serde::Deserialize;

use crate::metrics::Metrics;
use crate::models::Trade;
use crate::processor::TickStorage;

/// Handles messages from a specific topic.
#[async_trait]
pub trait MessageHandler: Send + Sync {
    fn topic(&self) -> &str;
    async fn handle(&self, payload: &[u8]) -> Result<()>;
}

/// Consumes tick messages off the bus and writes them to the columnar
/// store, closing the ingest loop when the bus backend is in use.
pub struct TicksHandler {
    topic: String,
    storage: Arc<dyn TickStorage>,
    metrics: Arc<Metrics>,
}

/// Bus wire format for ticks: `{"symbol":S,"t":unix_sec,"c":price,"v":volume}`.
#[derive(Debug, Deserialize)]
struct TickMessage {
    symbol: String,
    t: i64,
    c: f64,
    v: f64,
}

impl TicksHandler {
    pub fn new(topic: String, storage: Arc<dyn TickStorage>, metrics: Arc<Metrics>) -> Self {
        Self {
            topic,
            storage,
            metrics,
        }
    }
}

#[async_trait]
impl MessageHandler for TicksHandler {
    fn topic(&self) -> &str {
        &self.topic
    }

    async fn handle(&self, payload: &[u8]) -> Result<()> {
        let mut msg: TickMessage = match serde_json::from_slice(payload) {
            Ok(m) => m,
            Err(e) => {
                self.metrics.record_error("consumer_unmarshal");
                return Err(e.into());
            }
        };
        // Defensive: producers normally emit seconds, but normalize
        // millisecond timestamps the same way the stream client does.
        if msg.t > 100_000_000_000 {
            msg.t /= 1000;
        }

        if let Some(event_time) = Utc.timestamp_opt(msg.t, 0).single() {
            let lag = (Utc::now() - event_time).num_milliseconds() as f64 / 1000.0;
            self.metrics.record_latency("ingest_e2e_seconds", lag);
        }

        let start = Instant::now();
        let trade = Trade {
            symbol: msg.symbol,
            timestamp: msg.t,
            price: msg.c,
            volume: msg.v,
        };
        let res = self.storage.store(&trade).await;
        self.metrics
            .record_latency("ch_insert_seconds", start.elapsed().as_secs_f64());
        if let Err(e) = res {
            self.metrics.record_error("consumer_store");
            return Err(e);
        }
        self.metrics.record_sent("clickhouse", &trade.symbol);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{DateTime, Utc};
    use std::sync::Mutex;

    struct RecordingStorage {
        stored: Mutex<Vec<Trade>>,
    }

    #[async_trait]
    impl TickStorage for RecordingStorage {
        async fn store(&self, trade: &Trade) -> Result<()> {
            self.stored.lock().unwrap().push(trade.clone());
            Ok(())
        }

        async fn store_batch(&self, trades: &[Trade]) -> Result<()> {
            self.stored.lock().unwrap().extend_from_slice(trades);
            Ok(())
        }

        async fn query(
            &self,
            _symbol: &str,
            _from: DateTime<Utc>,
            _to: DateTime<Utc>,
            _limit: u32,
        ) -> Result<Vec<Trade>> {
            Ok(Vec::new())
        }

        async fn health(&self) -> Result<()> {
            Ok(())
        }
    }

    #[tokio::test]
    async fn decodes_tick_message_and_stores() {
        let storage = Arc::new(RecordingStorage {
            stored: Mutex::new(Vec::new()),
        });
        let h = TicksHandler::new(
            "rt.ticks".to_string(),
            storage.clone(),
            Metrics::new().unwrap(),
        );
        h.handle(br#"{"symbol":"BTCUSDT","t":1700000000,"c":42000.5,"v":0.25}"#)
            .await
            .unwrap();

        let stored = storage.stored.lock().unwrap();
        assert_eq!(stored.len(), 1);
        assert_eq!(stored[0].symbol, "BTCUSDT");
        assert_eq!(stored[0].timestamp, 1_700_000_000);
    }

    #[tokio::test]
    async fn millisecond_timestamps_fold_to_seconds() {
        let storage = Arc::new(RecordingStorage {
            stored: Mutex::new(Vec::new()),
        });
        let h = TicksHandler::new("t".to_string(), storage.clone(), Metrics::new().unwrap());
        h.handle(br#"{"symbol":"X","t":1700000000123,"c":1.0,"v":1.0}"#)
            .await
            .unwrap();
        assert_eq!(storage.stored.lock().unwrap()[0].timestamp, 1_700_000_000);
    }

    #[tokio::test]
    async fn garbage_payload_is_an_error() {
        let storage = Arc::new(RecordingStorage {
            stored: Mutex::new(Vec::new()),
        });
        let h = TicksHandler::new("t".to_string(), storage, Metrics::new().unwrap());
        assert!(h.handle(b"not json").await.is_err());
    }
}
