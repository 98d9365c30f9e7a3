pub mod candles;
pub mod ticks;

use anyhow::{bail, Context, Result};
use clickhouse::Client;

use crate::config::ClickHouseConfig;

/// ClickHouse connection wrapper. Owns client construction and the
/// close semantics (dropping the wrapper releases the pool); adapters
/// borrow clients from it.
pub struct ChClient {
    client: Client,
    tick_table: String,
}

impl ChClient {
    pub fn connect(cfg: &ClickHouseConfig) -> Self {
        let mut client = Client::default()
            .with_url(format!("http://{}:{}", cfg.host, cfg.port))
            .with_database(&cfg.database)
            .with_user(&cfg.user)
            .with_password(&cfg.password);
        if cfg.async_insert {
            // Server-side batching; wait_for_async_insert controls
            // whether inserts ack only after the buffer flush.
            client = client
                .with_option("async_insert", "1")
                .with_option(
                    "wait_for_async_insert",
                    if cfg.wait_for_async_insert { "1" } else { "0" },
                );
        }
        Self {
            client,
            tick_table: cfg.table.clone(),
        }
    }

    pub fn client(&self) -> Client {
        self.client.clone()
    }

    pub fn tick_table(&self) -> &str {
        &self.tick_table
    }

    pub async fn health(&self) -> Result<()> {
        self.client
            .query("SELECT 1")
            .fetch_one::<u8>()
            .await
            .context("clickhouse ping")?;
        Ok(())
    }

    /// Verifies the consumed schema exists. The tick table is written
    /// by this service; the candle tables are materialized by the
    /// store and only read here.
    pub async fn ensure_schema(&self) -> Result<()> {
        for table in [self.tick_table.as_str(), "rt_candles_1s", "rt_candles_1m"] {
            let exists: u8 = self
                .client
                .query(&format!("EXISTS TABLE {table}"))
                .fetch_one()
                .await
                .with_context(|| format!("check table {table}"))?;
            if exists == 0 {
                bail!("required table {table} does not exist");
            }
        }
        Ok(())
    }
}
