use std::future::IntoFuture;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use tokio::sync::watch;
use tracing::{info, warn};

use crate::bus::consumer::{BusConsumer, ConsumerConfig};
use crate::bus::producer::{BusProducer, TradePublisher};
use crate::bus::TicksHandler;
use crate::cache::{BytesCache, LayeredCache, RedisCache, TtlCache};
use crate::config::Config;
use crate::db::candles::CandleStore;
use crate::db::ticks::TickStore;
use crate::db::ChClient;
use crate::metrics::Metrics;
use crate::pipeline::{Processing, RealtimePipeline};
use crate::processor::{Backend, Publisher, TickStorage, TradeProcessor};
use crate::ratelimit::RateLimiter;
use crate::routes;
use crate::signals::aggregator::SignalAggregator;
use crate::signals::analytics::{
    AnalyticsClient, HttpAnomalyDetector, HttpEdgeScorer, HttpRegimeDetector, HttpVolForecaster,
};
use crate::state::AppState;
use crate::stream::collector::TradeCollector;
use crate::stream::finnhub::{FinnhubStream, StreamConfig};

const TRADE_SOURCE: &str = "finnhub";

/// The composed application: construction is leaves-first, shutdown
/// runs in reverse dependency order.
pub struct App {
    state: Arc<AppState>,
    collector: Arc<TradeCollector>,
    consumer: Option<Arc<BusConsumer>>,
    processor: Arc<TradeProcessor>,
    ch: ChClient,
    shutdown_timeout: Duration,
}

impl App {
    pub async fn build(cfg: Config) -> Result<Self> {
        let metrics = Metrics::new()?;
        let backend = cfg.backend()?;

        // Columnar store first: everything downstream depends on it.
        let ch = ChClient::connect(&cfg.clickhouse);
        ch.health().await.context("clickhouse ping")?;
        ch.ensure_schema().await.context("clickhouse schema")?;
        let tick_store = Arc::new(TickStore::new(&ch, TRADE_SOURCE));

        // Bus producer, when the backend or the consumer needs it.
        let needs_kafka = backend == Backend::Kafka || cfg.kafka.consumer.enabled;
        let publisher: Option<Arc<dyn Publisher>> = if needs_kafka {
            let producer = Arc::new(BusProducer::new(&cfg.kafka, Arc::clone(&metrics))?);
            Some(Arc::new(TradePublisher::new(
                producer,
                cfg.kafka.topic.clone(),
            )))
        } else {
            None
        };

        let processor = Arc::new(TradeProcessor::new(
            publisher,
            Some(Arc::clone(&tick_store) as Arc<dyn TickStorage>),
            Arc::clone(&metrics),
            backend,
        ));

        let stream = Arc::new(FinnhubStream::new(
            StreamConfig {
                api_key: cfg.finnhub.api_key.clone(),
                websocket_url: cfg.finnhub.websocket_url.clone(),
                symbols: cfg.finnhub.symbols.clone(),
                reconnect_delay: Duration::from_secs(cfg.finnhub.reconnect_delay_secs),
                ping_interval: Duration::from_secs(cfg.finnhub.ping_interval_secs),
            },
            Arc::clone(&metrics),
        ));

        let pipeline = Arc::new(RealtimePipeline::with_options(
            Arc::clone(&processor) as Arc<dyn Processing>,
            Arc::clone(&metrics),
            cfg.pipeline.max_rps,
            cfg.pipeline.buffer_size,
            None,
        ));

        let collector = Arc::new(TradeCollector::new(
            stream,
            pipeline,
            Arc::clone(&metrics),
        ));

        let consumer = if cfg.kafka.consumer.enabled {
            let mut consumer = BusConsumer::new(
                ConsumerConfig::from_settings(cfg.kafka.brokers.clone(), &cfg.kafka.consumer),
                Arc::clone(&metrics),
            )?;
            consumer.register_handler(Arc::new(TicksHandler::new(
                cfg.kafka.topic.clone(),
                Arc::clone(&tick_store) as Arc<dyn TickStorage>,
                Arc::clone(&metrics),
            )));
            Some(Arc::new(consumer))
        } else {
            None
        };

        // Analytics gateway collaborators.
        let candle_store = Arc::new(CandleStore::new(&ch));
        let timeout = Duration::from_secs(cfg.analytics.timeout_secs);
        let aggregator = Arc::new(SignalAggregator::new(
            candle_store,
            Arc::new(HttpRegimeDetector::new(AnalyticsClient::new(
                &cfg.analytics.base_url,
                timeout,
            )?)),
            Arc::new(HttpVolForecaster::new(AnalyticsClient::new(
                &cfg.analytics.base_url,
                timeout,
            )?)),
            Arc::new(HttpAnomalyDetector::new(AnalyticsClient::new(
                &cfg.analytics.base_url,
                timeout,
            )?)),
            Arc::new(HttpEdgeScorer::new(AnalyticsClient::new(
                &cfg.analytics.base_url,
                timeout,
            )?)),
        ));

        let cache: Arc<dyn BytesCache> = if cfg.analytics.redis.enabled {
            let redis = RedisCache::connect(&cfg.analytics.redis.addr)
                .await
                .context("redis connect")?;
            Arc::new(LayeredCache::new(redis, Duration::from_secs(30)))
        } else {
            Arc::new(TtlCache::new())
        };

        let shutdown_timeout = Duration::from_secs(cfg.server.shutdown_timeout_secs);
        let state = Arc::new(AppState {
            config: cfg,
            metrics,
            aggregator,
            cache,
            limiter: RateLimiter::new(),
            collector: Arc::clone(&collector),
        });

        Ok(Self {
            state,
            collector,
            consumer,
            processor,
            ch,
            shutdown_timeout,
        })
    }

    /// Starts the HTTP gateway, the collector, and (optionally) the
    /// consumer, then blocks until interrupted.
    pub async fn run(self) -> Result<()> {
        let addr: SocketAddr = format!(
            "{}:{}",
            self.state.config.server.host, self.state.config.server.port
        )
        .parse()
        .context("parse bind address")?;

        let router = routes::router(Arc::clone(&self.state));
        let listener = tokio::net::TcpListener::bind(addr)
            .await
            .with_context(|| format!("bind {addr}"))?;
        info!("finpull listening on http://{addr}");

        let (http_stop_tx, mut http_stop_rx) = watch::channel(false);
        let server = axum::serve(
            listener,
            router.into_make_service_with_connect_info::<SocketAddr>(),
        )
        .with_graceful_shutdown(async move {
            let _ = http_stop_rx.changed().await;
        });
        let server_task = tokio::spawn(server.into_future());

        self.collector.start().await.context("start collector")?;
        info!(
            "collector started symbols={:?}",
            self.state.config.finnhub.symbols
        );

        if let Some(consumer) = &self.consumer {
            consumer.start().context("start consumer")?;
        }

        tokio::signal::ctrl_c()
            .await
            .context("install ctrl-c handler")?;
        info!("shutdown signal received");

        // Reverse order: collector (pipeline + stream), HTTP server,
        // consumer, producer, store.
        self.collector.shutdown().await;

        let _ = http_stop_tx.send(true);
        match tokio::time::timeout(self.shutdown_timeout, server_task).await {
            Ok(Ok(Ok(()))) => {}
            Ok(Ok(Err(e))) => warn!("http server error: {e}"),
            Ok(Err(e)) => warn!("http server join error: {e}"),
            Err(_) => warn!("http server drain timed out"),
        }

        if let Some(consumer) = &self.consumer {
            if let Err(e) = consumer.stop(self.shutdown_timeout).await {
                warn!("consumer stop error: {e}");
            }
        }

        self.processor.close().await;
        drop(self.ch);

        info!("shutdown complete");
        Ok(())
    }
}
