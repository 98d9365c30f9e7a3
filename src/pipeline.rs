use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use anyhow::Result;
use async_trait::async_trait;
use thiserror::Error;
use tokio::sync::{mpsc, watch};

use crate::metrics::Metrics;
use crate::models::Trade;

/// The minimal downstream surface the pipeline needs.
#[async_trait]
pub trait Processing: Send + Sync {
    async fn process(&self, trade: &Trade) -> Result<()>;
}

#[derive(Debug, Error)]
pub enum PipelineError {
    #[error("invalid trade: {0}")]
    InvalidTrade(&'static str),
    #[error("pipeline downstream: {0}")]
    Downstream(#[source] anyhow::Error),
}

pub type TransformFn = Box<dyn Fn(Trade) -> Trade + Send + Sync>;

const FLUSH_BACKOFF_MIN: Duration = Duration::from_millis(50);
const FLUSH_BACKOFF_MAX: Duration = Duration::from_secs(2);

/// Middleware between the market stream and the processor: validates,
/// throttles per symbol, optionally transforms, and buffers trades
/// when the downstream is unavailable. A background flusher retries
/// buffered trades with capped exponential backoff.
pub struct RealtimePipeline {
    proc: Arc<dyn Processing>,
    metrics: Arc<Metrics>,
    max_rps: u32,
    transform: Option<TransformFn>,
    buf_tx: mpsc::Sender<Trade>,
    buf_rx: Mutex<Option<mpsc::Receiver<Trade>>>,
    stop_tx: watch::Sender<bool>,
    started: Mutex<bool>,
    last_seen: Mutex<HashMap<String, Instant>>,
}

impl RealtimePipeline {
    pub fn new(proc: Arc<dyn Processing>, metrics: Arc<Metrics>) -> Self {
        Self::with_options(proc, metrics, 20, 1000, None)
    }

    pub fn with_options(
        proc: Arc<dyn Processing>,
        metrics: Arc<Metrics>,
        max_rps: u32,
        buffer_size: usize,
        transform: Option<TransformFn>,
    ) -> Self {
        let buffer_size = buffer_size.max(1);
        let (buf_tx, buf_rx) = mpsc::channel(buffer_size);
        let (stop_tx, _) = watch::channel(false);
        Self {
            proc,
            metrics,
            max_rps,
            transform,
            buf_tx,
            buf_rx: Mutex::new(Some(buf_rx)),
            stop_tx,
            started: Mutex::new(false),
            last_seen: Mutex::new(HashMap::new()),
        }
    }

    /// Launches the background flusher. Idempotent.
    pub fn start(&self) {
        let mut started = self.started.lock().expect("pipeline lock poisoned");
        if *started {
            return;
        }
        let Some(mut rx) = self.buf_rx.lock().expect("pipeline lock poisoned").take() else {
            return;
        };
        *started = true;

        let proc = Arc::clone(&self.proc);
        let metrics = Arc::clone(&self.metrics);
        let buf_tx = self.buf_tx.clone();
        let mut stop_rx = self.stop_tx.subscribe();

        tokio::spawn(async move {
            let mut backoff = FLUSH_BACKOFF_MIN;
            loop {
                tokio::select! {
                    _ = stop_rx.changed() => return,
                    t = rx.recv() => {
                        let Some(t) = t else { return };
                        metrics
                            .pipeline_buffer_depth
                            .set(queued(&buf_tx) as i64);
                        if let Err(e) = proc.process(&t).await {
                            tracing::debug!("pipeline flush retry failed: {e}");
                            metrics.record_error("pipeline_flush");
                            tokio::time::sleep(backoff).await;
                            backoff = (backoff * 2).min(FLUSH_BACKOFF_MAX);
                            // Requeue if space; drop otherwise.
                            if buf_tx.try_send(t).is_err() {
                                metrics.record_error("pipeline_buffer_drop");
                            }
                        } else {
                            backoff = FLUSH_BACKOFF_MIN;
                        }
                    }
                }
            }
        });
    }

    /// Stops the background flusher. Idempotent.
    pub fn stop(&self) {
        let mut started = self.started.lock().expect("pipeline lock poisoned");
        if !*started {
            return;
        }
        *started = false;
        let _ = self.stop_tx.send(true);
    }

    /// Validates, throttles, and forwards a trade downstream,
    /// buffering it on downstream errors. Throttled trades are
    /// dropped silently.
    pub async fn process(&self, trade: Trade) -> Result<(), PipelineError> {
        let start = Instant::now();

        if let Err(reason) = validate_trade(&trade) {
            self.metrics.record_error("pipeline_validate");
            return Err(PipelineError::InvalidTrade(reason));
        }

        let trade = match &self.transform {
            Some(f) => {
                let transformed = f(trade);
                if let Err(reason) = validate_trade(&transformed) {
                    self.metrics.record_error("pipeline_transform_invalid");
                    return Err(PipelineError::InvalidTrade(reason));
                }
                transformed
            }
            None => trade,
        };

        if !self.allow_at(&trade.symbol, start) {
            self.metrics.record_error("pipeline_throttle");
            self.metrics
                .record_error(&format!("pipeline_throttle_{}", trade.symbol));
            return Ok(());
        }

        match self.proc.process(&trade).await {
            Ok(()) => {
                self.metrics
                    .record_latency("pipeline_process", start.elapsed().as_secs_f64());
                Ok(())
            }
            Err(e) => {
                self.metrics.record_error("pipeline_process");
                match self.buf_tx.try_send(trade) {
                    Ok(()) => {
                        self.metrics
                            .pipeline_buffer_depth
                            .set(queued(&self.buf_tx) as i64);
                    }
                    Err(_) => self.metrics.record_error("pipeline_buffer_full"),
                }
                Err(PipelineError::Downstream(e))
            }
        }
    }

    /// Per-symbol gap check: admit iff at least 1s/max_rps has passed
    /// since the last admitted trade for this symbol.
    fn allow_at(&self, symbol: &str, now: Instant) -> bool {
        if self.max_rps == 0 {
            return true;
        }
        let min_gap = Duration::from_secs(1) / self.max_rps;
        let mut last_seen = self.last_seen.lock().expect("pipeline lock poisoned");
        match last_seen.get(symbol) {
            Some(last) if now.saturating_duration_since(*last) < min_gap => false,
            _ => {
                last_seen.insert(symbol.to_string(), now);
                true
            }
        }
    }

    #[cfg(test)]
    fn buffered(&self) -> usize {
        queued(&self.buf_tx)
    }
}

fn queued(tx: &mpsc::Sender<Trade>) -> usize {
    tx.max_capacity().saturating_sub(tx.capacity())
}

fn validate_trade(t: &Trade) -> Result<(), &'static str> {
    if t.symbol.is_empty() {
        return Err("symbol empty");
    }
    if t.timestamp <= 0 {
        return Err("timestamp invalid");
    }
    if t.price < 0.0 || t.volume < 0.0 {
        return Err("negative price/volume");
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct FlakyProc {
        calls: AtomicUsize,
        fail_first: usize,
    }

    #[async_trait]
    impl Processing for FlakyProc {
        async fn process(&self, _trade: &Trade) -> Result<()> {
            let n = self.calls.fetch_add(1, Ordering::SeqCst);
            if n < self.fail_first {
                anyhow::bail!("downstream unavailable");
            }
            Ok(())
        }
    }

    fn trade(symbol: &str, ts: i64, price: f64, volume: f64) -> Trade {
        Trade {
            symbol: symbol.to_string(),
            timestamp: ts,
            price,
            volume,
        }
    }

    fn pipeline(proc: Arc<FlakyProc>) -> RealtimePipeline {
        RealtimePipeline::with_options(proc, Metrics::new().unwrap(), 0, 8, None)
    }

    #[test]
    fn validation_rejects_bad_trades() {
        assert!(validate_trade(&trade("", 1, 1.0, 1.0)).is_err());
        assert!(validate_trade(&trade("BTC", 0, 1.0, 1.0)).is_err());
        assert!(validate_trade(&trade("BTC", 1, -1.0, 1.0)).is_err());
        assert!(validate_trade(&trade("BTC", 1, 1.0, -1.0)).is_err());
        assert!(validate_trade(&trade("BTC", 1, 0.0, 0.0)).is_ok());
    }

    #[tokio::test]
    async fn invalid_trade_never_reaches_downstream() {
        let proc = Arc::new(FlakyProc {
            calls: AtomicUsize::new(0),
            fail_first: 0,
        });
        let p = pipeline(proc.clone());
        let err = p.process(trade("", 1, 1.0, 1.0)).await.unwrap_err();
        assert!(matches!(err, PipelineError::InvalidTrade(_)));
        assert_eq!(proc.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn throttle_drops_silently_within_the_gap() {
        let proc = Arc::new(FlakyProc {
            calls: AtomicUsize::new(0),
            fail_first: 0,
        });
        let p =
            RealtimePipeline::with_options(proc.clone(), Metrics::new().unwrap(), 20, 8, None);

        let t0 = Instant::now();
        assert!(p.allow_at("BTC", t0));
        // 20 rps => 50ms gap; 10ms later is throttled.
        assert!(!p.allow_at("BTC", t0 + Duration::from_millis(10)));
        assert!(p.allow_at("BTC", t0 + Duration::from_millis(60)));
        // Other symbols are unaffected.
        assert!(p.allow_at("ETH", t0 + Duration::from_millis(10)));
    }

    #[tokio::test]
    async fn transform_output_is_revalidated() {
        let proc = Arc::new(FlakyProc {
            calls: AtomicUsize::new(0),
            fail_first: 0,
        });
        let transform: TransformFn = Box::new(|mut t| {
            t.price = -1.0;
            t
        });
        let p = RealtimePipeline::with_options(
            proc.clone(),
            Metrics::new().unwrap(),
            0,
            8,
            Some(transform),
        );
        let err = p.process(trade("BTC", 1, 1.0, 1.0)).await.unwrap_err();
        assert!(matches!(err, PipelineError::InvalidTrade(_)));
        assert_eq!(proc.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn downstream_error_buffers_and_flusher_retries_until_success() {
        // Downstream rejects twice then succeeds: the initial attempt
        // buffers the trade, the flusher retries with backoff, and no
        // trade is lost.
        let proc = Arc::new(FlakyProc {
            calls: AtomicUsize::new(0),
            fail_first: 2,
        });
        let p = pipeline(proc.clone());

        let err = p.process(trade("BTC", 1, 1.0, 1.0)).await.unwrap_err();
        assert!(matches!(err, PipelineError::Downstream(_)));
        assert_eq!(p.buffered(), 1);

        p.start();
        let deadline = Instant::now() + Duration::from_secs(2);
        while proc.calls.load(Ordering::SeqCst) < 3 && Instant::now() < deadline {
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        p.stop();

        // Attempt 1 (inline) + 2 flusher retries, the last succeeding.
        assert_eq!(proc.calls.load(Ordering::SeqCst), 3);
        assert_eq!(p.buffered(), 0);
    }

    #[tokio::test]
    async fn start_and_stop_are_idempotent() {
        let proc = Arc::new(FlakyProc {
            calls: AtomicUsize::new(0),
            fail_first: 0,
        });
        let p = pipeline(proc);
        p.start();
        p.start();
        p.stop();
        p.stop();
    }
}
