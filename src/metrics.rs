use std::sync::Arc;

use anyhow::{Context, Result};
use prometheus::{
    GaugeVec, HistogramOpts, HistogramVec, IntCounterVec, IntGauge, IntGaugeVec, Opts, Registry,
    TextEncoder,
};

/// Process-wide metric collectors.
///
/// Constructed exactly once at startup against a private registry and
/// shared read-only via `Arc`; counters use lock-free primitives under
/// the hood so recording from any task is cheap.
pub struct Metrics {
    registry: Registry,

    /// Messages routed to a backend, per symbol.
    pub messages_sent: IntCounterVec,
    /// Typed error counter; `kind` names the failure site.
    pub errors: IntCounterVec,
    /// Per-operation latency.
    pub latency: HistogramVec,
    /// Last observed trade price per symbol.
    pub last_price: GaugeVec,
    /// Current depth of the pipeline retry buffer.
    pub pipeline_buffer_depth: IntGauge,

    pub producer_messages: IntCounterVec,
    pub producer_errors: IntCounterVec,
    pub producer_bytes: IntCounterVec,
    pub producer_publish_seconds: HistogramVec,

    pub consumer_queue_depth: IntGaugeVec,
    pub consumer_queue_fullness: GaugeVec,
    pub consumer_handle_seconds: HistogramVec,

    pub analytics_request_seconds: HistogramVec,
    pub analytics_errors: IntCounterVec,
}

impl Metrics {
    pub fn new() -> Result<Arc<Self>> {
        let registry = Registry::new();

        let messages_sent = IntCounterVec::new(
            Opts::new(
                "finpull_messages_sent_total",
                "Messages routed to a backend",
            ),
            &["backend", "symbol"],
        )?;
        let errors = IntCounterVec::new(
            Opts::new("finpull_errors_total", "Errors by kind"),
            &["kind"],
        )?;
        let latency = HistogramVec::new(
            HistogramOpts::new("finpull_latency_seconds", "Operation latency"),
            &["operation"],
        )?;
        let last_price = GaugeVec::new(
            Opts::new("finpull_last_price", "Last observed trade price"),
            &["symbol"],
        )?;
        let pipeline_buffer_depth = IntGauge::new(
            "finpull_pipeline_buffer_depth",
            "Trades waiting in the pipeline retry buffer",
        )?;

        let producer_messages = IntCounterVec::new(
            Opts::new(
                "finpull_kafka_producer_messages_total",
                "Total messages published to Kafka",
            ),
            &["topic", "compression", "result"],
        )?;
        let producer_errors = IntCounterVec::new(
            Opts::new(
                "finpull_kafka_producer_errors_total",
                "Total producer errors",
            ),
            &["topic"],
        )?;
        let producer_bytes = IntCounterVec::new(
            Opts::new(
                "finpull_kafka_producer_bytes_total",
                "Total payload bytes published",
            ),
            &["topic", "compression"],
        )?;
        let producer_publish_seconds = HistogramVec::new(
            HistogramOpts::new("finpull_kafka_producer_publish_seconds", "Publish latency"),
            &["topic"],
        )?;

        let consumer_queue_depth = IntGaugeVec::new(
            Opts::new(
                "finpull_kafka_consumer_queue_depth",
                "Messages waiting in the consumer queue",
            ),
            &["topic"],
        )?;
        let consumer_queue_fullness = GaugeVec::new(
            Opts::new(
                "finpull_kafka_consumer_queue_fullness",
                "Queue utilization ratio (len/cap)",
            ),
            &["topic"],
        )?;
        let consumer_handle_seconds = HistogramVec::new(
            HistogramOpts::new(
                "finpull_kafka_consumer_handle_seconds",
                "Handling time per message",
            ),
            &["topic"],
        )?;

        let analytics_request_seconds = HistogramVec::new(
            HistogramOpts::new(
                "finpull_analytics_request_seconds",
                "Gateway endpoint latency",
            ),
            &["endpoint"],
        )?;
        let analytics_errors = IntCounterVec::new(
            Opts::new(
                "finpull_analytics_errors_total",
                "Gateway endpoint errors",
            ),
            &["endpoint"],
        )?;

        for c in [
            Box::new(messages_sent.clone()) as Box<dyn prometheus::core::Collector>,
            Box::new(errors.clone()),
            Box::new(latency.clone()),
            Box::new(last_price.clone()),
            Box::new(pipeline_buffer_depth.clone()),
            Box::new(producer_messages.clone()),
            Box::new(producer_errors.clone()),
            Box::new(producer_bytes.clone()),
            Box::new(producer_publish_seconds.clone()),
            Box::new(consumer_queue_depth.clone()),
            Box::new(consumer_queue_fullness.clone()),
            Box::new(consumer_handle_seconds.clone()),
            Box::new(analytics_request_seconds.clone()),
            Box::new(analytics_errors.clone()),
        ] {
            registry.register(c).context("register collector")?;
        }

        Ok(Arc::new(Self {
            registry,
            messages_sent,
            errors,
            latency,
            last_price,
            pipeline_buffer_depth,
            producer_messages,
            producer_errors,
            producer_bytes,
            producer_publish_seconds,
            consumer_queue_depth,
            consumer_queue_fullness,
            consumer_handle_seconds,
            analytics_request_seconds,
            analytics_errors,
        }))
    }

    pub fn record_error(&self, kind: &str) {
        self.errors.with_label_values(&[kind]).inc();
    }

    pub fn record_latency(&self, operation: &str, seconds: f64) {
        self.latency.with_label_values(&[operation]).observe(seconds);
    }

    pub fn record_sent(&self, backend: &str, symbol: &str) {
        self.messages_sent.with_label_values(&[backend, symbol]).inc();
    }

    pub fn record_last_price(&self, symbol: &str, price: f64) {
        self.last_price.with_label_values(&[symbol]).set(price);
    }

    /// Renders the registry in Prometheus text exposition format.
    pub fn render(&self) -> String {
        let encoder = TextEncoder::new();
        encoder
            .encode_to_string(&self.registry.gather())
            .unwrap_or_default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn collectors_register_and_render() {
        let m = Metrics::new().unwrap();
        m.record_error("test");
        m.record_sent("kafka", "BTCUSDT");
        m.record_latency("process", 0.01);
        m.record_last_price("BTCUSDT", 42_000.0);
        m.pipeline_buffer_depth.set(3);

        let out = m.render();
        assert!(out.contains("finpull_errors_total"));
        assert!(out.contains("finpull_messages_sent_total"));
        assert!(out.contains("finpull_pipeline_buffer_depth 3"));
    }

    #[test]
    fn new_builds_an_isolated_registry_each_time() {
        // Two instances must not collide on collector names.
        let a = Metrics::new().unwrap();
        let b = Metrics::new().unwrap();
        a.record_error("x");
        assert!(!b.render().contains("kind=\"x\""));
    }
}
