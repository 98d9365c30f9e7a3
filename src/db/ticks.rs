use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, TimeZone, Utc};
use clickhouse::Row;
use serde::{Deserialize, Serialize};

use super::ChClient;
use crate::models::Trade;
use crate::processor::TickStorage;

/// Rows per multi-row insert.
const INSERT_CHUNK: usize = 2000;

/// Tick row in `rt_ticks_raw`. The (symbol, ts, seq) tuple is the
/// idempotency fingerprint: `event_id = "{symbol}-{ts}"`, `seq = ts`.
#[derive(Debug, Row, Serialize)]
struct TickRow {
    #[serde(with = "clickhouse::serde::chrono::datetime64::millis")]
    ts: DateTime<Utc>,
    symbol: String,
    price: f64,
    volume: f64,
    source: String,
    event_id: String,
    seq: u64,
    org_id: String,
}

#[derive(Debug, Row, Deserialize)]
struct TickQueryRow {
    symbol: String,
    #[serde(with = "clickhouse::serde::chrono::datetime64::millis")]
    ts: DateTime<Utc>,
    price: f64,
    volume: f64,
}

/// ClickHouse-backed tick storage.
pub struct TickStore {
    client: clickhouse::Client,
    table: String,
    source: String,
}

impl TickStore {
    pub fn new(ch: &ChClient, source: &str) -> Self {
        Self {
            client: ch.client(),
            table: ch.tick_table().to_string(),
            source: source.to_string(),
        }
    }

    fn row(&self, t: &Trade) -> Option<TickRow> {
        if t.symbol.is_empty() || t.timestamp == 0 {
            return None;
        }
        let ts = Utc.timestamp_opt(t.timestamp, 0).single()?;
        Some(TickRow {
            ts,
            symbol: t.symbol.clone(),
            price: t.price,
            volume: t.volume,
            source: self.source.clone(),
            event_id: format!("{}-{}", t.symbol, t.timestamp),
            seq: t.timestamp as u64,
            org_id: String::new(),
        })
    }

    /// Builds insert rows, skipping malformed trades.
    fn prepare_rows(&self, trades: &[Trade]) -> Vec<TickRow> {
        trades.iter().filter_map(|t| self.row(t)).collect()
    }

    async fn insert_rows(&self, rows: &[TickRow]) -> Result<()> {
        let mut insert = self.client.insert(&self.table).context("open insert")?;
        for row in rows {
            insert.write(row).await.context("write row")?;
        }
        insert.end().await.context("end insert")?;
        Ok(())
    }
}

#[async_trait]
impl TickStorage for TickStore {
    async fn store(&self, trade: &Trade) -> Result<()> {
        let rows = self.prepare_rows(std::slice::from_ref(trade));
        if rows.is_empty() {
            return Ok(());
        }
        self.insert_rows(&rows).await
    }

    /// Chunked multi-row insert. A batch with no valid rows writes
    /// nothing and succeeds.
    async fn store_batch(&self, trades: &[Trade]) -> Result<()> {
        if trades.is_empty() {
            return Ok(());
        }
        let rows = self.prepare_rows(trades);
        for chunk in rows.chunks(INSERT_CHUNK) {
            self.insert_rows(chunk).await?;
        }
        Ok(())
    }

    async fn query(
        &self,
        symbol: &str,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
        limit: u32,
    ) -> Result<Vec<Trade>> {
        let sql = format!(
            "SELECT symbol, ts, price, volume FROM {} \
             WHERE symbol = ? AND ts >= toDateTime64(?, 3) AND ts <= toDateTime64(?, 3) \
             ORDER BY ts DESC LIMIT ?",
            self.table
        );
        let rows: Vec<TickQueryRow> = self
            .client
            .query(&sql)
            .bind(symbol)
            .bind(from.timestamp())
            .bind(to.timestamp())
            .bind(limit)
            .fetch_all()
            .await
            .context("query ticks")?;

        Ok(rows
            .into_iter()
            .map(|r| Trade {
                symbol: r.symbol,
                timestamp: r.ts.timestamp(),
                price: r.price,
                volume: r.volume,
            })
            .collect())
    }

    async fn health(&self) -> Result<()> {
        self.client
            .query("SELECT 1")
            .fetch_one::<u8>()
            .await
            .context("clickhouse ping")?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ClickHouseConfig;

    fn store() -> TickStore {
        let mut cfg = ClickHouseConfig::default();
        cfg.host = "localhost".to_string();
        TickStore::new(&ChClient::connect(&cfg), "finnhub")
    }

    fn trade(symbol: &str, ts: i64) -> Trade {
        Trade {
            symbol: symbol.to_string(),
            timestamp: ts,
            price: 10.0,
            volume: 1.0,
        }
    }

    #[test]
    fn row_derives_the_idempotency_fingerprint() {
        let s = store();
        let row = s.row(&trade("BTCUSDT", 1_700_000_000)).unwrap();
        assert_eq!(row.event_id, "BTCUSDT-1700000000");
        assert_eq!(row.seq, 1_700_000_000);
        assert_eq!(row.source, "finnhub");
        assert_eq!(row.ts.timestamp(), 1_700_000_000);
    }

    #[test]
    fn malformed_rows_are_skipped() {
        let s = store();
        let rows = s.prepare_rows(&[
            trade("", 1_700_000_000),
            trade("BTCUSDT", 0),
            trade("BTCUSDT", 1_700_000_000),
        ]);
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].symbol, "BTCUSDT");
    }

    #[test]
    fn all_malformed_batch_prepares_nothing() {
        let s = store();
        assert!(s.prepare_rows(&[trade("", 1), trade("X", 0)]).is_empty());
    }
}
