use crate::models::Candle;

/// Log returns r_t = ln(C_t / C_{t-1}). Output length is
/// `len(candles) - 1` (empty for fewer than two candles); a
/// non-positive close on either side of a step emits 0 at that index.
pub fn log_returns(candles: &[Candle]) -> Vec<f64> {
    if candles.len() < 2 {
        return Vec::new();
    }
    candles
        .windows(2)
        .map(|w| {
            let (prev, cur) = (w[0].close, w[1].close);
            if prev <= 0.0 || cur <= 0.0 {
                0.0
            } else {
                (cur / prev).ln()
            }
        })
        .collect()
}

/// Annualized realized volatility over the trailing `window` returns:
/// `sqrt(max(0, (Σr² − W·μ²)/(W−1)) · bars_per_year)`. Returns 0 when
/// the window is degenerate or there is not enough data; negative
/// variance from rounding clamps to 0.
pub fn realized_vol(returns: &[f64], window: usize, bars_per_year: f64) -> f64 {
    if window <= 1 || returns.len() < window {
        return 0.0;
    }
    let tail = &returns[returns.len() - window..];
    let sum: f64 = tail.iter().sum();
    let sum_sq: f64 = tail.iter().map(|r| r * r).sum();
    let n = window as f64;
    let mean = sum / n;
    let variance = ((sum_sq - n * mean * mean) / (n - 1.0)).max(0.0);
    (variance * bars_per_year).sqrt()
}

/// Realized volatility over the most recent `min(60, len)` returns.
pub fn nowcast_sigma(returns: &[f64], bars_per_year: f64) -> f64 {
    realized_vol(returns, returns.len().min(60), bars_per_year)
}

/// Rolling realized-volatility series: element i is the volatility of
/// returns[..=i] over a window of `min(60, i+1)`.
pub fn rolling_vols(returns: &[f64], bars_per_year: f64) -> Vec<f64> {
    (0..returns.len())
        .map(|i| realized_vol(&returns[..=i], (i + 1).min(60), bars_per_year))
        .collect()
}

pub fn last_or_zero(xs: &[f64]) -> f64 {
    xs.last().copied().unwrap_or(0.0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{TimeZone, Utc};

    fn candles(closes: &[f64]) -> Vec<Candle> {
        closes
            .iter()
            .enumerate()
            .map(|(i, &c)| Candle {
                bucket: Utc.timestamp_opt(1_700_000_000 + i as i64 * 60, 0).unwrap(),
                symbol: "BTCUSDT".to_string(),
                open: c,
                high: c,
                low: c,
                close: c,
                volume: 1.0,
                org_id: String::new(),
            })
            .collect()
    }

    #[test]
    fn log_returns_of_ten_percent_steps() {
        let rets = log_returns(&candles(&[100.0, 110.0, 121.0]));
        assert_eq!(rets.len(), 2);
        for r in rets {
            assert!((r - 1.1f64.ln()).abs() < 1e-12);
            assert!((r - 0.09531).abs() < 1e-5);
        }
    }

    #[test]
    fn log_returns_boundaries() {
        assert!(log_returns(&[]).is_empty());
        assert!(log_returns(&candles(&[100.0])).is_empty());
        // Non-positive closes emit 0 at that index.
        let rets = log_returns(&candles(&[100.0, 0.0, 110.0]));
        assert_eq!(rets, vec![0.0, 0.0]);
    }

    #[test]
    fn realized_vol_matches_hand_computation() {
        // Returns ±0.01, window 4, 1m bars: variance ≈ 1.333e-4,
        // annualized sigma ≈ 8.37.
        let rets = [0.01, -0.01, 0.01, -0.01];
        let sigma = realized_vol(&rets, 4, 525_600.0);
        assert!((sigma - 8.37).abs() < 0.01, "sigma = {sigma}");
    }

    #[test]
    fn realized_vol_degenerate_windows_are_zero() {
        assert_eq!(realized_vol(&[0.01, 0.02], 1, 525_600.0), 0.0);
        assert_eq!(realized_vol(&[0.01], 2, 525_600.0), 0.0);
        assert_eq!(realized_vol(&[], 0, 525_600.0), 0.0);
    }

    #[test]
    fn realized_vol_is_never_negative() {
        // Identical returns give zero variance, possibly slightly
        // negative from rounding before the clamp.
        let rets = [0.013; 16];
        assert!(realized_vol(&rets, 16, 525_600.0) >= 0.0);
    }

    #[test]
    fn nowcast_caps_the_window_at_sixty() {
        let rets: Vec<f64> = (0..200).map(|i| if i % 2 == 0 { 0.01 } else { -0.01 }).collect();
        let capped = nowcast_sigma(&rets, 525_600.0);
        let explicit = realized_vol(&rets, 60, 525_600.0);
        assert_eq!(capped, explicit);
    }

    #[test]
    fn rolling_vols_tracks_the_returns_length() {
        let rets = [0.01, -0.01, 0.01];
        let vols = rolling_vols(&rets, 525_600.0);
        assert_eq!(vols.len(), 3);
        // First element has a window of 1, which is degenerate.
        assert_eq!(vols[0], 0.0);
        assert!(vols[2] > 0.0);
    }
}
