use std::sync::Arc;

use crate::cache::BytesCache;
use crate::config::Config;
use crate::metrics::Metrics;
use crate::ratelimit::RateLimiter;
use crate::signals::aggregator::SignalAggregator;
use crate::stream::collector::TradeCollector;

/// Shared application state, passed to all route handlers via
/// `axum::extract::State`.
pub struct AppState {
    pub config: Config,
    pub metrics: Arc<Metrics>,
    pub aggregator: Arc<SignalAggregator>,
    pub cache: Arc<dyn BytesCache>,
    pub limiter: RateLimiter,
    pub collector: Arc<TradeCollector>,
}
