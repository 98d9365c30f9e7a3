use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use clickhouse::Row;
use serde::Deserialize;

use super::ChClient;
use crate::models::{Candle, Timeframe};

/// Read access to the precomputed OHLCV candle tables. Candles are
/// append-only and written by the store's materialized views; this
/// service only reads them.
#[async_trait]
pub trait FeatureStore: Send + Sync {
    /// Candles in `[from, to]`, ascending by bucket.
    async fn get_candles(
        &self,
        symbol: &str,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
        tf: Timeframe,
    ) -> Result<Vec<Candle>>;

    /// The latest `n` candles, returned ascending.
    async fn get_latest_n(&self, symbol: &str, n: usize, tf: Timeframe) -> Result<Vec<Candle>>;
}

#[derive(Debug, Row, Deserialize)]
struct CandleRow {
    #[serde(with = "clickhouse::serde::chrono::datetime64::millis")]
    bucket: DateTime<Utc>,
    symbol: String,
    open: f64,
    high: f64,
    low: f64,
    close: f64,
    vol: f64,
    org_id: String,
}

impl From<CandleRow> for Candle {
    fn from(r: CandleRow) -> Self {
        Candle {
            bucket: r.bucket,
            symbol: r.symbol,
            open: r.open,
            high: r.high,
            low: r.low,
            close: r.close,
            volume: r.vol,
            org_id: r.org_id,
        }
    }
}

pub struct CandleStore {
    client: clickhouse::Client,
}

impl CandleStore {
    pub fn new(ch: &ChClient) -> Self {
        Self {
            client: ch.client(),
        }
    }
}

#[async_trait]
impl FeatureStore for CandleStore {
    async fn get_candles(
        &self,
        symbol: &str,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
        tf: Timeframe,
    ) -> Result<Vec<Candle>> {
        let sql = format!(
            "SELECT bucket, symbol, open, high, low, close, vol, org_id FROM {} \
             WHERE symbol = ? AND bucket >= toDateTime64(?, 3) AND bucket <= toDateTime64(?, 3) \
             ORDER BY bucket ASC",
            tf.candle_table()
        );
        let rows: Vec<CandleRow> = self
            .client
            .query(&sql)
            .bind(symbol)
            .bind(from.timestamp())
            .bind(to.timestamp())
            .fetch_all()
            .await
            .context("get candles")?;
        Ok(rows.into_iter().map(Candle::from).collect())
    }

    async fn get_latest_n(&self, symbol: &str, n: usize, tf: Timeframe) -> Result<Vec<Candle>> {
        let sql = format!(
            "SELECT bucket, symbol, open, high, low, close, vol, org_id FROM {} \
             WHERE symbol = ? \
             ORDER BY bucket DESC LIMIT ?",
            tf.candle_table()
        );
        let rows: Vec<CandleRow> = self
            .client
            .query(&sql)
            .bind(symbol)
            .bind(n as u64)
            .fetch_all()
            .await
            .context("get latest candles")?;

        // Query is newest-first; reverse to chronological.
        let mut candles: Vec<Candle> = rows.into_iter().map(Candle::from).collect();
        candles.reverse();
        Ok(candles)
    }
}
