use std::collections::HashMap;
use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// A single executed transaction observation from the market feed.
///
/// Timestamps are unix seconds; millisecond feed timestamps are
/// normalized on ingress. Immutable once produced.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Trade {
    pub symbol: String,
    pub timestamp: i64,
    pub price: f64,
    pub volume: f64,
}

/// An OHLCV candle read from the precomputed candle tables.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Candle {
    pub bucket: DateTime<Utc>,
    pub symbol: String,
    pub open: f64,
    pub high: f64,
    pub low: f64,
    pub close: f64,
    pub volume: f64,
    pub org_id: String,
}

/// Supported candle timeframes. 5m folds to the 1m table.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Timeframe {
    S1,
    M1,
    M5,
}

impl Timeframe {
    pub const DEFAULT: Timeframe = Timeframe::M1;

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "1s" => Some(Self::S1),
            "1m" => Some(Self::M1),
            "5m" => Some(Self::M5),
            _ => None,
        }
    }

    /// Maps any raw string to a valid timeframe, falling back to the default.
    pub fn normalize(s: &str) -> Self {
        Self::parse(s).unwrap_or(Self::DEFAULT)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::S1 => "1s",
            Self::M1 => "1m",
            Self::M5 => "5m",
        }
    }

    /// Approximate bars per year, used to annualize realized volatility.
    pub fn bars_per_year(&self) -> f64 {
        match self {
            Self::S1 => 365.0 * 24.0 * 60.0 * 60.0,
            Self::M1 => 365.0 * 24.0 * 60.0,
            Self::M5 => 365.0 * 24.0 * 12.0,
        }
    }

    /// Candle table backing this timeframe. There is no 5m table; 5m
    /// reads fold to 1m.
    pub fn candle_table(&self) -> &'static str {
        match self {
            Self::S1 => "rt_candles_1s",
            Self::M1 | Self::M5 => "rt_candles_1m",
        }
    }
}

impl fmt::Display for Timeframe {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Categorical market state over a recent window.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Regime {
    pub symbol: String,
    pub timestamp: DateTime<Utc>,
    /// "bull", "bear", "volatile" or "quiet".
    pub state: String,
    /// Probability per state.
    pub prob: Vec<f64>,
    pub confidence: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VolatilityForecast {
    pub symbol: String,
    pub timestamp: DateTime<Utc>,
    pub horizon: String,
    /// Forecast sigma.
    pub forecast: f64,
    /// Realized volatility now.
    pub nowcast: f64,
    /// Model identifier, e.g. "GARCH" or "LightGBM".
    pub model: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MarketAnomaly {
    pub symbol: String,
    pub timestamp: DateTime<Utc>,
    /// "shock_up", "shock_down" or "vol_spike".
    #[serde(rename = "type")]
    pub kind: String,
    /// Z-score magnitude.
    pub severity: f64,
    pub r#return: f64,
    pub volatility: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EdgeScore {
    pub symbol: String,
    pub timestamp: DateTime<Utc>,
    pub horizon: String,
    /// Probability of the price going up over the horizon.
    pub proba_up: f64,
    pub regime: String,
    pub sigma: f64,
    pub confidence: f64,
}

/// Consolidated view of all analytics signals for one symbol.
///
/// Partial success is valid: failed branches are absent and their
/// errors recorded per name.
#[derive(Debug, Clone, Serialize)]
pub struct AggregateSignals {
    pub symbol: String,
    pub horizon: String,
    pub timestamp: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub regime: Option<Regime>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub volatility: Option<VolatilityForecast>,
    #[serde(skip_serializing_if = "Vec::is_empty", default)]
    pub anomalies: Vec<MarketAnomaly>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub edge: Option<EdgeScore>,
    #[serde(skip_serializing_if = "HashMap::is_empty", default)]
    pub errors: HashMap<String, String>,
}
