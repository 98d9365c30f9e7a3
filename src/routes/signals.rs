use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};

use axum::extract::{ConnectInfo, Query, State};
use axum::http::{header, StatusCode};
use axum::response::Response;
use axum::routing::get;
use axum::Router;
use serde::Deserialize;
use serde::Serialize;
use serde_json::json;
use tracing::warn;

use crate::error::{ApiError, ApiResponse, ValidationDetail};
use crate::models::Timeframe;
use crate::signals::aggregator::GetSignalsParams;
use crate::state::AppState;

const VOL_HORIZONS: &[&str] = &["1m", "5m", "15m", "30m", "1h"];
const EDGE_HORIZONS: &[&str] = &["5m", "15m", "30m", "1h"];

#[derive(Debug, Deserialize)]
pub struct SignalsQuery {
    symbol: Option<String>,
    n: Option<i64>,
    tf: Option<String>,
    horizon: Option<String>,
}

pub fn routes() -> Router<Arc<AppState>> {
    Router::new()
        .route("/api/regime", get(regime))
        .route("/api/vol", get(vol))
        .route("/api/anomaly", get(anomaly))
        .route("/api/edge", get(edge))
        .route("/api/signals", get(signals))
}

async fn regime(
    State(state): State<Arc<AppState>>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    Query(q): Query<SignalsQuery>,
) -> Result<Response, ApiError> {
    let symbol = require_symbol(&q)?;
    let n = parse_n(&q, 600, 5000)?;
    let tf = parse_tf(&q)?;

    let ttl = Duration::from_secs(state.config.analytics.cache_ttl.regime_secs);
    let key = format!("regime:{symbol}:{tf}");
    let agg = Arc::clone(&state.aggregator);
    serve(&state, "regime", addr, 5.0, 2.0, key, ttl, async move {
        agg.latest_regime(&symbol, n, tf).await
    })
    .await
}

async fn vol(
    State(state): State<Arc<AppState>>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    Query(q): Query<SignalsQuery>,
) -> Result<Response, ApiError> {
    let symbol = require_symbol(&q)?;
    let n = parse_n(&q, 600, 5000)?;
    let tf = parse_tf(&q)?;
    let horizon = parse_horizon(&q, VOL_HORIZONS, "5m")?;

    let ttl = Duration::from_secs(state.config.analytics.cache_ttl.vol_secs);
    let key = format!("vol:{symbol}:{horizon}:{tf}");
    let agg = Arc::clone(&state.aggregator);
    serve(&state, "vol", addr, 5.0, 2.0, key, ttl, async move {
        agg.vol_forecast(&symbol, &horizon, n, tf).await
    })
    .await
}

async fn anomaly(
    State(state): State<Arc<AppState>>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    Query(q): Query<SignalsQuery>,
) -> Result<Response, ApiError> {
    let symbol = require_symbol(&q)?;
    let n = parse_n(&q, 1200, 10_000)?;
    let tf = parse_tf(&q)?;

    let ttl = Duration::from_secs(state.config.analytics.cache_ttl.anomaly_secs);
    let key = format!("anom:{symbol}:{tf}");
    let agg = Arc::clone(&state.aggregator);
    serve(&state, "anomaly", addr, 3.0, 1.0, key, ttl, async move {
        agg.anomalies(&symbol, n, tf).await
    })
    .await
}

async fn edge(
    State(state): State<Arc<AppState>>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    Query(q): Query<SignalsQuery>,
) -> Result<Response, ApiError> {
    let symbol = require_symbol(&q)?;
    let n = parse_n(&q, 600, 5000)?;
    let tf = parse_tf(&q)?;
    let horizon = parse_horizon(&q, EDGE_HORIZONS, "15m")?;

    let ttl = Duration::from_secs(state.config.analytics.cache_ttl.edge_secs);
    let key = format!("edge:{symbol}:{horizon}:{tf}");
    let agg = Arc::clone(&state.aggregator);
    serve(&state, "edge", addr, 5.0, 2.0, key, ttl, async move {
        agg.edge(&symbol, &horizon, n, tf).await
    })
    .await
}

/// Aggregate fan-out over all four services; partial success is valid
/// and per-branch errors are reported in the body.
async fn signals(
    State(state): State<Arc<AppState>>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    Query(q): Query<SignalsQuery>,
) -> Result<Response, ApiError> {
    let symbol = require_symbol(&q)?;
    let n = parse_n(&q, 600, 5000)?;
    let tf = parse_tf(&q)?;
    let horizon = parse_horizon(&q, VOL_HORIZONS, "5m")?;

    let ttl = Duration::from_secs(state.config.analytics.cache_ttl.regime_secs);
    let key = format!("signals:{symbol}:{horizon}:{tf}");
    let agg = Arc::clone(&state.aggregator);
    serve(&state, "signals", addr, 5.0, 2.0, key, ttl, async move {
        Ok(agg
            .get_signals(GetSignalsParams {
                symbol,
                horizon,
                n,
                timeframe: tf,
            })
            .await)
    })
    .await
}

/// Shared endpoint plumbing: rate limit by remote address, cache
/// lookup on the request fingerprint, compute on miss, cache the
/// serialized envelope, and emit latency/error metrics.
#[allow(clippy::too_many_arguments)]
async fn serve<T, F>(
    state: &Arc<AppState>,
    endpoint: &'static str,
    addr: SocketAddr,
    capacity: f64,
    refill_per_sec: f64,
    cache_key: String,
    ttl: Duration,
    compute: F,
) -> Result<Response, ApiError>
where
    T: Serialize,
    F: Future<Output = anyhow::Result<T>>,
{
    let start = Instant::now();
    let res = serve_inner(state, endpoint, addr, capacity, refill_per_sec, cache_key, ttl, compute)
        .await;
    state
        .metrics
        .analytics_request_seconds
        .with_label_values(&[endpoint])
        .observe(start.elapsed().as_secs_f64());
    if res.is_err() {
        state
            .metrics
            .analytics_errors
            .with_label_values(&[endpoint])
            .inc();
    }
    res
}

#[allow(clippy::too_many_arguments)]
async fn serve_inner<T, F>(
    state: &Arc<AppState>,
    endpoint: &'static str,
    addr: SocketAddr,
    capacity: f64,
    refill_per_sec: f64,
    cache_key: String,
    ttl: Duration,
    compute: F,
) -> Result<Response, ApiError>
where
    T: Serialize,
    F: Future<Output = anyhow::Result<T>>,
{
    let limiter_key = format!("{}:{endpoint}", addr.ip());
    if !state.limiter.allow(&limiter_key, capacity, refill_per_sec) {
        warn!("{endpoint}: rate limited remote={addr}");
        return Err(ApiError::RateLimited);
    }

    match state.cache.get_bytes(&cache_key).await {
        Ok(Some(bytes)) => return Ok(json_bytes(bytes)),
        Ok(None) => {}
        Err(e) => warn!("{endpoint}: cache get error: {e}"),
    }

    let value = compute
        .await
        .map_err(|e| ApiError::Internal(format!("{e:#}")))?;
    let body = serde_json::to_vec(&ApiResponse {
        status: StatusCode::OK.as_u16(),
        message: "OK".to_string(),
        data: Some(value),
    })?;

    if let Err(e) = state.cache.set_bytes(&cache_key, body.clone(), ttl).await {
        warn!("{endpoint}: cache set error: {e}");
    }
    Ok(json_bytes(body))
}

fn json_bytes(body: Vec<u8>) -> Response {
    Response::builder()
        .status(StatusCode::OK)
        .header(header::CONTENT_TYPE, "application/json")
        .body(body.into())
        .expect("static response parts")
}

// ---------------------------------------------------------------------------
// Query validation
// ---------------------------------------------------------------------------

fn require_symbol(q: &SignalsQuery) -> Result<String, ApiError> {
    match q.symbol.as_deref().map(str::trim) {
        Some(s) if !s.is_empty() => Ok(s.to_string()),
        _ => Err(ApiError::invalid(
            "ERR_REQUIRED",
            "symbol",
            "symbol is required",
        )),
    }
}

fn parse_n(q: &SignalsQuery, default: usize, max: i64) -> Result<usize, ApiError> {
    match q.n {
        None => Ok(default),
        Some(n) if n >= 1 && n <= max => Ok(n as usize),
        Some(n) => Err(ApiError::BadRequest(vec![ValidationDetail::new(
            "ERR_RANGE",
            "n",
            format!("n must be in [1, {max}], got {n}"),
        )
        .with_params(json!({"min": 1, "max": max}))])),
    }
}

fn parse_tf(q: &SignalsQuery) -> Result<Timeframe, ApiError> {
    match q.tf.as_deref() {
        None | Some("") => Ok(Timeframe::DEFAULT),
        Some(raw) => Timeframe::parse(raw).ok_or_else(|| {
            ApiError::BadRequest(vec![ValidationDetail::new(
                "ERR_ONEOF",
                "tf",
                format!("unsupported timeframe: {raw}"),
            )
            .with_params(json!({"allowed": ["1s", "1m", "5m"]}))])
        }),
    }
}

fn parse_horizon(
    q: &SignalsQuery,
    allowed: &[&str],
    default: &str,
) -> Result<String, ApiError> {
    match q.horizon.as_deref() {
        None | Some("") => Ok(default.to_string()),
        Some(h) if allowed.contains(&h) => Ok(h.to_string()),
        Some(h) => Err(ApiError::BadRequest(vec![ValidationDetail::new(
            "ERR_ONEOF",
            "horizon",
            format!("unsupported horizon: {h}"),
        )
        .with_params(json!({"allowed": allowed}))])),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn q(symbol: Option<&str>, n: Option<i64>, tf: Option<&str>, horizon: Option<&str>) -> SignalsQuery {
        SignalsQuery {
            symbol: symbol.map(String::from),
            n,
            tf: tf.map(String::from),
            horizon: horizon.map(String::from),
        }
    }

    #[test]
    fn symbol_is_required_and_trimmed() {
        assert!(require_symbol(&q(None, None, None, None)).is_err());
        assert!(require_symbol(&q(Some("  "), None, None, None)).is_err());
        assert_eq!(
            require_symbol(&q(Some(" BTCUSDT "), None, None, None)).unwrap(),
            "BTCUSDT"
        );
    }

    #[test]
    fn n_defaults_and_bounds_per_endpoint() {
        assert_eq!(parse_n(&q(None, None, None, None), 600, 5000).unwrap(), 600);
        assert_eq!(
            parse_n(&q(None, Some(1200), None, None), 1200, 10_000).unwrap(),
            1200
        );
        assert!(parse_n(&q(None, Some(0), None, None), 600, 5000).is_err());
        assert!(parse_n(&q(None, Some(5001), None, None), 600, 5000).is_err());
        assert!(parse_n(&q(None, Some(-3), None, None), 600, 5000).is_err());
    }

    #[test]
    fn tf_defaults_to_1m_and_rejects_unknown() {
        assert_eq!(parse_tf(&q(None, None, None, None)).unwrap(), Timeframe::M1);
        assert_eq!(
            parse_tf(&q(None, None, Some("5m"), None)).unwrap(),
            Timeframe::M5
        );
        assert!(parse_tf(&q(None, None, Some("3m"), None)).is_err());
    }

    #[test]
    fn horizon_enum_is_per_endpoint() {
        assert_eq!(
            parse_horizon(&q(None, None, None, None), VOL_HORIZONS, "5m").unwrap(),
            "5m"
        );
        assert_eq!(
            parse_horizon(&q(None, None, None, Some("1h")), EDGE_HORIZONS, "15m").unwrap(),
            "1h"
        );
        // 1m is a vol horizon but not an edge horizon.
        assert!(parse_horizon(&q(None, None, None, Some("1m")), VOL_HORIZONS, "5m").is_ok());
        assert!(parse_horizon(&q(None, None, None, Some("1m")), EDGE_HORIZONS, "15m").is_err());
    }
}
