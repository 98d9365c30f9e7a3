use std::sync::{Arc, Mutex};

use anyhow::{Context, Result};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{info, warn};

use crate::metrics::Metrics;
use crate::pipeline::RealtimePipeline;
use crate::stream::finnhub::FinnhubStream;

/// Consumes trades from the market stream and feeds them through the
/// realtime pipeline. Owns the reconnect loop: a mid-run stream error
/// triggers reconnect-and-resubscribe; only the initial connect is
/// fatal.
pub struct TradeCollector {
    stream: Arc<FinnhubStream>,
    pipeline: Arc<RealtimePipeline>,
    metrics: Arc<Metrics>,
    stop_tx: watch::Sender<bool>,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl TradeCollector {
    pub fn new(
        stream: Arc<FinnhubStream>,
        pipeline: Arc<RealtimePipeline>,
        metrics: Arc<Metrics>,
    ) -> Self {
        let (stop_tx, _) = watch::channel(false);
        Self {
            stream,
            pipeline,
            metrics,
            stop_tx,
            task: Mutex::new(None),
        }
    }

    pub fn is_connected(&self) -> bool {
        self.stream.is_connected()
    }

    pub async fn start(&self) -> Result<()> {
        self.stream.connect().await.context("collector start")?;
        self.stream.subscribe().await.context("collector subscribe")?;
        self.pipeline.start();

        let stream = Arc::clone(&self.stream);
        let pipeline = Arc::clone(&self.pipeline);
        let metrics = Arc::clone(&self.metrics);
        let mut stop_rx = self.stop_tx.subscribe();

        let handle = tokio::spawn(async move {
            let (mut trades, mut errs) = stream.read();
            loop {
                tokio::select! {
                    _ = stop_rx.changed() => return,
                    t = trades.recv() => match t {
                        Some(t) => {
                            metrics.record_last_price(&t.symbol, t.price);
                            // Pipeline failures are counted inside; the
                            // collector keeps draining the feed.
                            if let Err(e) = pipeline.process(t).await {
                                tracing::debug!("pipeline rejected trade: {e}");
                            }
                        }
                        None => {
                            metrics.record_error("stream");
                            if let Ok(e) = errs.try_recv() {
                                warn!("stream error: {e}");
                            }
                            if !reconnect(&stream, &mut stop_rx).await {
                                return;
                            }
                            (trades, errs) = stream.read();
                        }
                    },
                    e = errs.recv() => if let Some(e) = e {
                        metrics.record_error("stream");
                        warn!("stream error: {e}");
                        if !reconnect(&stream, &mut stop_rx).await {
                            return;
                        }
                        (trades, errs) = stream.read();
                    },
                }
            }
        });
        *self.task.lock().expect("collector lock poisoned") = Some(handle);

        info!("collector started");
        Ok(())
    }

    /// Stops the pipeline flusher and closes the stream.
    pub async fn shutdown(&self) {
        let _ = self.stop_tx.send(true);
        self.pipeline.stop();
        self.stream.close().await;
        if let Some(handle) = self.task.lock().expect("collector lock poisoned").take() {
            let _ = handle.await;
        }
        info!("collector stopped");
    }
}

/// Retries reconnect until it succeeds or a stop is signalled.
/// Returns false when stopping.
async fn reconnect(stream: &Arc<FinnhubStream>, stop_rx: &mut watch::Receiver<bool>) -> bool {
    loop {
        tokio::select! {
            _ = stop_rx.changed() => return false,
            res = stream.reconnect() => match res {
                Ok(()) => {
                    info!("stream reconnected");
                    return true;
                }
                Err(e) => {
                    warn!("reconnect failed, retrying: {e}");
                }
            },
        }
    }
}
