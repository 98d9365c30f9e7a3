use std::collections::HashMap;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use chrono::Utc;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use crate::models::{EdgeScore, MarketAnomaly, Regime, VolatilityForecast};

const BODY_SNIPPET_LEN: usize = 256;

/// Categorizes market state from a window of returns.
#[async_trait]
pub trait RegimeDetector: Send + Sync {
    async fn detect(&self, symbol: &str, returns: &[f64]) -> Result<Regime>;
}

#[async_trait]
pub trait VolForecaster: Send + Sync {
    async fn forecast(
        &self,
        symbol: &str,
        features: &HashMap<String, f64>,
        horizon: &str,
    ) -> Result<VolatilityForecast>;
}

#[async_trait]
pub trait AnomalyDetector: Send + Sync {
    async fn detect(
        &self,
        symbol: &str,
        returns: &[f64],
        vols: &[f64],
    ) -> Result<Vec<MarketAnomaly>>;
}

#[async_trait]
pub trait EdgeScorer: Send + Sync {
    async fn predict(
        &self,
        symbol: &str,
        features: &HashMap<String, f64>,
        horizon: &str,
    ) -> Result<EdgeScore>;
}

/// Shared JSON-POST client for the external inference endpoints.
pub struct AnalyticsClient {
    base_url: String,
    http: reqwest::Client,
}

impl AnalyticsClient {
    pub fn new(base_url: &str, timeout: Duration) -> Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .context("build analytics http client")?;
        Ok(Self {
            base_url: base_url.trim_end_matches('/').to_string(),
            http,
        })
    }

    /// POSTs `payload` as JSON to `path` and decodes the 2xx response
    /// body; non-2xx surfaces the status and a body snippet.
    pub async fn post_json<B: Serialize, T: DeserializeOwned>(
        &self,
        path: &str,
        payload: &B,
    ) -> Result<T> {
        let url = format!("{}{}", self.base_url, path);
        let resp = self
            .http
            .post(&url)
            .header("Content-Type", "application/json")
            .json(payload)
            .send()
            .await
            .with_context(|| format!("post {path}"))?;

        let status = resp.status();
        if !status.is_success() {
            let body = resp.text().await.unwrap_or_default();
            let snippet: String = body.chars().take(BODY_SNIPPET_LEN).collect();
            bail!("post {path}: status {status}: {snippet}");
        }
        resp.json::<T>()
            .await
            .with_context(|| format!("decode {path} response"))
    }

    /// Retries transient failures with a linear `attempt * 50ms`
    /// backoff. Cancellation propagates at the await points.
    pub async fn post_json_with_retry<B: Serialize, T: DeserializeOwned>(
        &self,
        path: &str,
        payload: &B,
        attempts: u32,
    ) -> Result<T> {
        let attempts = attempts.max(1);
        let mut last_err = None;
        for attempt in 1..=attempts {
            match self.post_json(path, payload).await {
                Ok(v) => return Ok(v),
                Err(e) => {
                    last_err = Some(e);
                    if attempt < attempts {
                        tokio::time::sleep(Duration::from_millis(50 * attempt as u64)).await;
                    }
                }
            }
        }
        Err(last_err.expect("at least one attempt"))
    }
}

// ---------------------------------------------------------------------------
// /regime/detect
// ---------------------------------------------------------------------------

#[derive(Serialize)]
struct RegimeRequest<'a> {
    symbol: &'a str,
    returns: &'a [f64],
}

#[derive(Deserialize)]
struct RegimeResponse {
    state: String,
    #[serde(default)]
    prob: Vec<f64>,
    #[serde(default)]
    confidence: f64,
}

pub struct HttpRegimeDetector {
    client: AnalyticsClient,
}

impl HttpRegimeDetector {
    pub fn new(client: AnalyticsClient) -> Self {
        Self { client }
    }
}

#[async_trait]
impl RegimeDetector for HttpRegimeDetector {
    async fn detect(&self, symbol: &str, returns: &[f64]) -> Result<Regime> {
        let resp: RegimeResponse = self
            .client
            .post_json_with_retry("/regime/detect", &RegimeRequest { symbol, returns }, 3)
            .await
            .context("post regime")?;
        Ok(Regime {
            symbol: symbol.to_string(),
            timestamp: Utc::now(),
            state: resp.state,
            prob: resp.prob,
            confidence: resp.confidence,
        })
    }
}

// ---------------------------------------------------------------------------
// /vol/forecast
// ---------------------------------------------------------------------------

#[derive(Serialize)]
struct VolRequest<'a> {
    symbol: &'a str,
    features: &'a HashMap<String, f64>,
    horizon: &'a str,
}

#[derive(Deserialize)]
struct VolResponse {
    forecast: f64,
    #[serde(default)]
    nowcast: f64,
    #[serde(default)]
    model: String,
}

pub struct HttpVolForecaster {
    client: AnalyticsClient,
}

impl HttpVolForecaster {
    pub fn new(client: AnalyticsClient) -> Self {
        Self { client }
    }
}

#[async_trait]
impl VolForecaster for HttpVolForecaster {
    async fn forecast(
        &self,
        symbol: &str,
        features: &HashMap<String, f64>,
        horizon: &str,
    ) -> Result<VolatilityForecast> {
        let resp: VolResponse = self
            .client
            .post_json(
                "/vol/forecast",
                &VolRequest {
                    symbol,
                    features,
                    horizon,
                },
            )
            .await
            .context("post vol forecast")?;
        Ok(VolatilityForecast {
            symbol: symbol.to_string(),
            timestamp: Utc::now(),
            horizon: horizon.to_string(),
            forecast: resp.forecast,
            nowcast: resp.nowcast,
            model: resp.model,
        })
    }
}

// ---------------------------------------------------------------------------
// /anomaly/detect
// ---------------------------------------------------------------------------

#[derive(Serialize)]
struct AnomalyRequest<'a> {
    symbol: &'a str,
    returns: &'a [f64],
    vols: &'a [f64],
}

#[derive(Deserialize)]
struct AnomalyItem {
    #[serde(default)]
    ts_index: i64,
    #[serde(rename = "type")]
    kind: String,
    severity: f64,
}

#[derive(Deserialize)]
struct AnomalyResponse {
    #[serde(default)]
    anomalies: Vec<AnomalyItem>,
}

pub struct HttpAnomalyDetector {
    client: AnalyticsClient,
}

impl HttpAnomalyDetector {
    pub fn new(client: AnalyticsClient) -> Self {
        Self { client }
    }
}

#[async_trait]
impl AnomalyDetector for HttpAnomalyDetector {
    async fn detect(
        &self,
        symbol: &str,
        returns: &[f64],
        vols: &[f64],
    ) -> Result<Vec<MarketAnomaly>> {
        let resp: AnomalyResponse = self
            .client
            .post_json(
                "/anomaly/detect",
                &AnomalyRequest {
                    symbol,
                    returns,
                    vols,
                },
            )
            .await
            .context("post anomaly detect")?;

        let now = Utc::now();
        Ok(resp
            .anomalies
            .into_iter()
            .map(|a| {
                let at = a.ts_index.clamp(0, returns.len().saturating_sub(1) as i64) as usize;
                MarketAnomaly {
                    symbol: symbol.to_string(),
                    timestamp: now,
                    kind: a.kind,
                    severity: a.severity,
                    r#return: returns.get(at).copied().unwrap_or(0.0),
                    volatility: vols.get(at).copied().unwrap_or(0.0),
                }
            })
            .collect())
    }
}

// ---------------------------------------------------------------------------
// /edge/predict
// ---------------------------------------------------------------------------

#[derive(Serialize)]
struct EdgeRequest<'a> {
    symbol: &'a str,
    features: &'a HashMap<String, f64>,
    horizon: &'a str,
}

#[derive(Deserialize)]
struct EdgeResponse {
    proba_up: f64,
    #[serde(default)]
    regime: String,
    #[serde(default)]
    sigma: f64,
    #[serde(default)]
    confidence: f64,
}

pub struct HttpEdgeScorer {
    client: AnalyticsClient,
}

impl HttpEdgeScorer {
    pub fn new(client: AnalyticsClient) -> Self {
        Self { client }
    }
}

#[async_trait]
impl EdgeScorer for HttpEdgeScorer {
    async fn predict(
        &self,
        symbol: &str,
        features: &HashMap<String, f64>,
        horizon: &str,
    ) -> Result<EdgeScore> {
        let resp: EdgeResponse = self
            .client
            .post_json(
                "/edge/predict",
                &EdgeRequest {
                    symbol,
                    features,
                    horizon,
                },
            )
            .await
            .context("post edge predict")?;
        Ok(EdgeScore {
            symbol: symbol.to_string(),
            timestamp: Utc::now(),
            horizon: horizon.to_string(),
            proba_up: resp.proba_up,
            regime: resp.regime,
            sigma: resp.sigma,
            confidence: resp.confidence,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn request_bodies_match_the_service_contract() {
        let req = RegimeRequest {
            symbol: "BTCUSDT",
            returns: &[0.01, -0.02],
        };
        let v = serde_json::to_value(&req).unwrap();
        assert_eq!(v["symbol"], "BTCUSDT");
        assert_eq!(v["returns"].as_array().unwrap().len(), 2);

        let mut features = HashMap::new();
        features.insert("nowcast_sigma".to_string(), 0.5);
        let req = VolRequest {
            symbol: "BTCUSDT",
            features: &features,
            horizon: "5m",
        };
        let v = serde_json::to_value(&req).unwrap();
        assert_eq!(v["features"]["nowcast_sigma"], 0.5);
        assert_eq!(v["horizon"], "5m");
    }

    #[test]
    fn anomaly_response_maps_type_and_defaults() {
        let resp: AnomalyResponse = serde_json::from_str(
            r#"{"anomalies":[{"ts_index":1,"type":"vol_spike","severity":3.2}]}"#,
        )
        .unwrap();
        assert_eq!(resp.anomalies.len(), 1);
        assert_eq!(resp.anomalies[0].kind, "vol_spike");

        let empty: AnomalyResponse = serde_json::from_str("{}").unwrap();
        assert!(empty.anomalies.is_empty());
    }

    #[test]
    fn base_url_trailing_slash_is_normalized() {
        let c = AnalyticsClient::new("http://svc:8001/", Duration::from_secs(3)).unwrap();
        assert_eq!(c.base_url, "http://svc:8001");
    }
}
