use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use chrono::Utc;
use tokio::time::timeout;

use super::analytics::{AnomalyDetector, EdgeScorer, RegimeDetector, VolForecaster};
use super::features;
use crate::db::candles::FeatureStore;
use crate::models::{AggregateSignals, EdgeScore, MarketAnomaly, Regime, Timeframe, VolatilityForecast};

/// Overall budget for the aggregate fan-out.
const SIGNALS_BUDGET: Duration = Duration::from_secs(10);

/// Composition layer: fetches latest candles, derives features, and
/// invokes the external analytics services. Holds no state beyond its
/// injected collaborators.
pub struct SignalAggregator {
    store: Arc<dyn FeatureStore>,
    regime: Arc<dyn RegimeDetector>,
    vol: Arc<dyn VolForecaster>,
    anomaly: Arc<dyn AnomalyDetector>,
    edge: Arc<dyn EdgeScorer>,
}

#[derive(Debug, Clone)]
pub struct GetSignalsParams {
    pub symbol: String,
    pub horizon: String,
    pub n: usize,
    pub timeframe: Timeframe,
}

impl SignalAggregator {
    pub fn new(
        store: Arc<dyn FeatureStore>,
        regime: Arc<dyn RegimeDetector>,
        vol: Arc<dyn VolForecaster>,
        anomaly: Arc<dyn AnomalyDetector>,
        edge: Arc<dyn EdgeScorer>,
    ) -> Self {
        Self {
            store,
            regime,
            vol,
            anomaly,
            edge,
        }
    }

    pub async fn latest_regime(&self, symbol: &str, n: usize, tf: Timeframe) -> Result<Regime> {
        let candles = self.store.get_latest_n(symbol, n, tf).await?;
        let rets = features::log_returns(&candles);
        self.regime.detect(symbol, &rets).await
    }

    pub async fn vol_forecast(
        &self,
        symbol: &str,
        horizon: &str,
        n: usize,
        tf: Timeframe,
    ) -> Result<VolatilityForecast> {
        let candles = self.store.get_latest_n(symbol, n, tf).await?;
        let rets = features::log_returns(&candles);
        let mut feats = HashMap::new();
        feats.insert(
            "nowcast_sigma".to_string(),
            features::nowcast_sigma(&rets, tf.bars_per_year()),
        );
        self.vol.forecast(symbol, &feats, horizon).await
    }

    pub async fn anomalies(
        &self,
        symbol: &str,
        n: usize,
        tf: Timeframe,
    ) -> Result<Vec<MarketAnomaly>> {
        let candles = self.store.get_latest_n(symbol, n, tf).await?;
        let rets = features::log_returns(&candles);
        let vols = features::rolling_vols(&rets, tf.bars_per_year());
        self.anomaly.detect(symbol, &rets, &vols).await
    }

    pub async fn edge(
        &self,
        symbol: &str,
        horizon: &str,
        n: usize,
        tf: Timeframe,
    ) -> Result<EdgeScore> {
        let candles = self.store.get_latest_n(symbol, n, tf).await?;
        let rets = features::log_returns(&candles);
        let mut feats = HashMap::new();
        feats.insert("ret_1".to_string(), features::last_or_zero(&rets));
        feats.insert(
            "sigma_now".to_string(),
            features::nowcast_sigma(&rets, tf.bars_per_year()),
        );
        self.edge.predict(symbol, &feats, horizon).await
    }

    /// Invokes all four services concurrently under a single budget.
    /// Per-branch failures land in the error map; partial success is
    /// a valid result.
    pub async fn get_signals(&self, mut params: GetSignalsParams) -> AggregateSignals {
        if params.n == 0 {
            params.n = 600;
        }
        if params.horizon.is_empty() {
            params.horizon = "5m".to_string();
        }
        let GetSignalsParams {
            symbol,
            horizon,
            n,
            timeframe: tf,
        } = params;

        let mut out = AggregateSignals {
            symbol: symbol.clone(),
            horizon: horizon.clone(),
            timestamp: Utc::now(),
            regime: None,
            volatility: None,
            anomalies: Vec::new(),
            edge: None,
            errors: HashMap::new(),
        };

        let (regime, vol, anomalies, edge) = tokio::join!(
            timeout(SIGNALS_BUDGET, self.latest_regime(&symbol, n, tf)),
            timeout(SIGNALS_BUDGET, self.vol_forecast(&symbol, &horizon, n, tf)),
            timeout(SIGNALS_BUDGET, self.anomalies(&symbol, n, tf)),
            timeout(SIGNALS_BUDGET, self.edge(&symbol, &horizon, n, tf)),
        );

        match flatten(regime) {
            Ok(v) => out.regime = Some(v),
            Err(e) => {
                out.errors.insert("regime".to_string(), e);
            }
        }
        match flatten(vol) {
            Ok(v) => out.volatility = Some(v),
            Err(e) => {
                out.errors.insert("volatility".to_string(), e);
            }
        }
        match flatten(anomalies) {
            Ok(v) => out.anomalies = v,
            Err(e) => {
                out.errors.insert("anomalies".to_string(), e);
            }
        }
        match flatten(edge) {
            Ok(v) => out.edge = Some(v),
            Err(e) => {
                out.errors.insert("edge".to_string(), e);
            }
        }

        out
    }
}

fn flatten<T>(res: Result<Result<T>, tokio::time::error::Elapsed>) -> Result<T, String> {
    match res {
        Ok(Ok(v)) => Ok(v),
        Ok(Err(e)) => Err(format!("{e:#}")),
        Err(_) => Err("deadline exceeded".to_string()),
    }
}
