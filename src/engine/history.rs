//! Statistics over daily market-history buckets.
//!
//! The upstream feed does not guarantee chronological order, so every
//! computation sorts its own working copy first. Windows are calendar days
//! counted back from now (UTC); bucket dates are `YYYY-MM-DD` strings and
//! compare lexicographically.

use chrono::Utc;

use crate::esi::market::HistoryBucket;

fn cutoff(days: u32) -> String {
    (Utc::now() - chrono::Duration::days(days as i64))
        .format("%Y-%m-%d")
        .to_string()
}

fn sorted_window(entries: &[HistoryBucket], days: u32) -> Vec<HistoryBucket> {
    let since = cutoff(days);
    let mut window: Vec<HistoryBucket> = entries
        .iter()
        .filter(|e| e.date >= since)
        .cloned()
        .collect();
    window.sort_by(|a, b| a.date.cmp(&b.date));
    window
}

/// Volume-weighted average price over the trailing window.
pub fn vwap(entries: &[HistoryBucket], days: u32) -> f64 {
    let window = sorted_window(entries, days);
    let mut price_volume = 0.0;
    let mut volume = 0.0;
    for e in &window {
        if e.average > 0.0 && e.volume > 0 {
            price_volume += e.average * e.volume as f64;
            volume += e.volume as f64;
        }
    }
    if volume > 0.0 {
        price_volume / volume
    } else {
        0.0
    }
}

/// Mean daily traded volume over the trailing window, float division so
/// thin markets do not round to zero.
pub fn avg_daily_volume(entries: &[HistoryBucket], days: u32) -> f64 {
    let window = sorted_window(entries, days);
    if window.is_empty() {
        return 0.0;
    }
    let total: i64 = window.iter().map(|e| e.volume).sum();
    total as f64 / window.len() as f64
}

/// Price-volatility index: sample std dev of daily averages over the
/// window, as a percentage of their mean.
pub fn volatility_pct(entries: &[HistoryBucket], days: u32) -> f64 {
    let prices: Vec<f64> = sorted_window(entries, days)
        .iter()
        .filter(|e| e.average > 0.0)
        .map(|e| e.average)
        .collect();
    if prices.len() < 2 {
        return 0.0;
    }
    let mu = mean(&prices);
    if mu <= 0.0 {
        return 0.0;
    }
    (variance(&prices).sqrt() / mu) * 100.0
}

/// Whether any trade volume exists in the last `days` calendar days.
pub fn traded_within(entries: &[HistoryBucket], days: u32) -> bool {
    let since = cutoff(days);
    entries.iter().any(|e| e.date >= since && e.volume > 0)
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct MarketStats {
    /// Average daily volume over the last 7 days, rounded.
    pub daily_volume: i64,
    /// Daily volume divided by total listed quantity.
    pub velocity: f64,
    /// Percent price change over the 7-day window, Theil-Sen slope.
    pub price_trend_pct: f64,
}

/// Trading statistics for the 7-day window. The trend uses the Theil-Sen
/// median slope, which a single spike or crash day cannot drag around the
/// way it would an OLS fit.
pub fn market_stats(entries: &[HistoryBucket], total_listed: i64) -> MarketStats {
    let window = sorted_window(entries, 7);
    if window.is_empty() {
        return MarketStats::default();
    }

    let mut vol = 0i64;
    let mut prices = Vec::new();
    for e in &window {
        vol += e.volume;
        if e.average > 0.0 {
            prices.push(e.average);
        }
    }
    let daily_volume = (vol as f64 / window.len() as f64).round() as i64;
    let velocity = if total_listed > 0 {
        daily_volume as f64 / total_listed as f64
    } else {
        0.0
    };

    let mut trend = 0.0;
    if prices.len() >= 2 {
        let n = prices.len();
        let mut slopes = Vec::with_capacity(n * (n - 1) / 2);
        for i in 0..n {
            for j in (i + 1)..n {
                let dx = (j - i) as f64;
                slopes.push((prices[j] - prices[i]) / dx);
            }
        }
        slopes.sort_by(|a, b| a.partial_cmp(b).unwrap_or(std::cmp::Ordering::Equal));
        let slope = median_sorted(&slopes);
        let mid = mean(&prices);
        if mid > 0.0 {
            trend = slope * (n - 1) as f64 / mid * 100.0;
        }
    }

    MarketStats {
        daily_volume,
        velocity,
        price_trend_pct: trend,
    }
}

// ---- market impact ----

/// Calibrated impact parameters from history.
#[derive(Debug, Clone, Default, serde::Serialize)]
pub struct ImpactParams {
    /// Amihud illiquidity: median(|log-return| / volume). Higher means
    /// less liquid.
    pub amihud: f64,
    /// Daily volatility, sample std dev of log-returns.
    pub sigma: f64,
    pub avg_daily_volume: f64,
    pub days_used: usize,
    pub valid: bool,
}

const IMPACT_MIN_DAYS: usize = 5;
const TWAP_TARGET_PARTICIPATION: f64 = 0.05;

pub fn calibrate_impact(entries: &[HistoryBucket], days: u32) -> ImpactParams {
    let window = sorted_window(entries, days);
    if window.len() < IMPACT_MIN_DAYS {
        return ImpactParams::default();
    }

    let mut amihud_values = Vec::new();
    let mut log_returns = Vec::new();
    let mut prev_avg = 0.0;
    let mut total_volume = 0.0;
    let mut volume_days = 0usize;

    for (i, e) in window.iter().enumerate() {
        if e.average <= 0.0 {
            continue;
        }
        if e.volume > 0 {
            total_volume += e.volume as f64;
            volume_days += 1;
        }
        if i > 0 && prev_avg > 0.0 && e.volume > 0 {
            let log_ret = (e.average / prev_avg).ln();
            log_returns.push(log_ret);
            amihud_values.push(log_ret.abs() / e.volume as f64);
        }
        prev_avg = e.average;
    }

    let mut out = ImpactParams {
        days_used: window.len(),
        ..ImpactParams::default()
    };
    if amihud_values.len() < 3 || log_returns.len() < 2 {
        return out;
    }

    out.amihud = median(&amihud_values);
    out.sigma = variance(&log_returns).sqrt();
    if volume_days > 0 {
        out.avg_daily_volume = total_volume / volume_days as f64;
    }
    out.valid = true;
    out
}

/// Linear impact estimate in percent, best for small orders.
pub fn impact_linear_pct(amihud: f64, quantity: f64) -> f64 {
    if quantity <= 0.0 || amihud <= 0.0 {
        return 0.0;
    }
    amihud * quantity * 100.0
}

/// Square-root-law impact in percent: sigma * sqrt(Q / V_daily) * 100.
pub fn impact_sqrt_pct(sigma: f64, quantity: f64, avg_daily_volume: f64) -> f64 {
    if quantity <= 0.0 || sigma <= 0.0 || avg_daily_volume <= 0.0 {
        return 0.0;
    }
    sigma * (quantity / avg_daily_volume).sqrt() * 100.0
}

/// Recommended impact percent: the sqrt law once the order exceeds 1% of
/// daily volume, the linear model below that.
pub fn recommended_impact_pct(params: &ImpactParams, quantity: f64) -> f64 {
    if params.avg_daily_volume > 0.0 && quantity > 0.01 * params.avg_daily_volume {
        impact_sqrt_pct(params.sigma, quantity, params.avg_daily_volume)
    } else {
        impact_linear_pct(params.amihud, quantity)
    }
}

/// Number of slices so that no slice exceeds the target participation of
/// daily volume. Capped at 100.
pub fn optimal_slices(quantity: f64, avg_daily_volume: f64) -> u32 {
    if quantity <= 0.0 || avg_daily_volume <= 0.0 {
        return 1;
    }
    let slice = TWAP_TARGET_PARTICIPATION * avg_daily_volume;
    if slice <= 0.0 {
        return 1;
    }
    ((quantity / slice).ceil() as u32).clamp(1, 100)
}

// ---- shared helpers ----

pub fn mean(values: &[f64]) -> f64 {
    if values.is_empty() {
        return 0.0;
    }
    values.iter().sum::<f64>() / values.len() as f64
}

/// Unbiased sample variance.
pub fn variance(values: &[f64]) -> f64 {
    if values.len() < 2 {
        return 0.0;
    }
    let mu = mean(values);
    values.iter().map(|v| (v - mu) * (v - mu)).sum::<f64>() / (values.len() - 1) as f64
}

pub fn median(values: &[f64]) -> f64 {
    let mut sorted = values.to_vec();
    sorted.sort_by(|a, b| a.partial_cmp(b).unwrap_or(std::cmp::Ordering::Equal));
    median_sorted(&sorted)
}

fn median_sorted(sorted: &[f64]) -> f64 {
    let n = sorted.len();
    if n == 0 {
        return 0.0;
    }
    if n % 2 == 1 {
        sorted[n / 2]
    } else {
        0.5 * (sorted[n / 2 - 1] + sorted[n / 2])
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn bucket(days_ago: i64, average: f64, volume: i64) -> HistoryBucket {
        HistoryBucket {
            date: (Utc::now() - chrono::Duration::days(days_ago))
                .format("%Y-%m-%d")
                .to_string(),
            average,
            highest: average * 1.1,
            lowest: average * 0.9,
            volume,
            order_count: 10,
        }
    }

    #[test]
    fn vwap_matches_definition() {
        let entries = vec![bucket(1, 10.0, 100), bucket(2, 20.0, 300)];
        // (10*100 + 20*300) / 400 = 17.5
        assert!((vwap(&entries, 30) - 17.5).abs() < 1e-12);
    }

    #[test]
    fn vwap_ignores_zero_volume_days_and_old_entries() {
        let entries = vec![
            bucket(1, 10.0, 100),
            bucket(2, 99.0, 0),
            bucket(90, 1000.0, 10_000),
        ];
        assert!((vwap(&entries, 30) - 10.0).abs() < 1e-12);
        assert_eq!(vwap(&[], 30), 0.0);
    }

    #[test]
    fn monotone_prices_produce_monotone_trend() {
        let up: Vec<_> = (0..7).map(|i| bucket(6 - i, 10.0 + i as f64, 100)).collect();
        let down: Vec<_> = (0..7).map(|i| bucket(6 - i, 20.0 - i as f64, 100)).collect();
        assert!(market_stats(&up, 0).price_trend_pct > 0.0);
        assert!(market_stats(&down, 0).price_trend_pct < 0.0);
    }

    #[test]
    fn theil_sen_shrugs_off_a_single_outlier() {
        let flat: Vec<_> = (0..7).map(|i| bucket(6 - i, 100.0, 100)).collect();
        let mut spiked = flat.clone();
        spiked[3].average = 10_000.0;

        let clean = market_stats(&flat, 0).price_trend_pct;
        let dirty = market_stats(&spiked, 0).price_trend_pct;
        assert!((clean - 0.0).abs() < 1e-9);
        // The median slope stays near zero despite a 100x spike day.
        assert!(dirty.abs() < 5.0, "trend {dirty} overreacted to outlier");
    }

    #[test]
    fn daily_volume_uses_float_division() {
        // 5 units over 3 days must not round down to 1 per day.
        let entries = vec![bucket(1, 10.0, 2), bucket(2, 10.0, 2), bucket(3, 10.0, 1)];
        let stats = market_stats(&entries, 0);
        assert_eq!(stats.daily_volume, 2);
        assert!((avg_daily_volume(&entries, 7) - 5.0 / 3.0).abs() < 1e-12);
    }

    #[test]
    fn velocity_is_volume_over_listed() {
        let entries = vec![bucket(1, 10.0, 100)];
        let stats = market_stats(&entries, 400);
        assert!((stats.velocity - 0.25).abs() < 1e-12);
    }

    #[test]
    fn volatility_of_constant_series_is_zero() {
        let entries: Vec<_> = (0..10).map(|i| bucket(i, 50.0, 100)).collect();
        assert_eq!(volatility_pct(&entries, 30), 0.0);

        let varied = vec![bucket(1, 90.0, 100), bucket(2, 100.0, 100), bucket(3, 110.0, 100)];
        assert!(volatility_pct(&varied, 30) > 0.0);
    }

    #[test]
    fn traded_within_window() {
        let entries = vec![bucket(5, 10.0, 100)];
        assert!(!traded_within(&entries, 3));
        assert!(traded_within(&entries, 7));
    }

    #[test]
    fn impact_needs_enough_days() {
        let thin: Vec<_> = (0..3).map(|i| bucket(i, 10.0, 100)).collect();
        assert!(!calibrate_impact(&thin, 30).valid);

        let rich: Vec<_> = (0..10)
            .map(|i| bucket(i, 10.0 + (i % 3) as f64, 100 + i as i64))
            .collect();
        let params = calibrate_impact(&rich, 30);
        assert!(params.valid);
        assert!(params.sigma > 0.0);
        assert!(params.avg_daily_volume > 0.0);
    }

    #[test]
    fn impact_model_selection() {
        let params = ImpactParams {
            amihud: 1e-6,
            sigma: 0.05,
            avg_daily_volume: 10_000.0,
            days_used: 30,
            valid: true,
        };
        // Small order: linear.
        let small = recommended_impact_pct(&params, 50.0);
        assert!((small - impact_linear_pct(params.amihud, 50.0)).abs() < 1e-12);
        // Large order: sqrt law.
        let large = recommended_impact_pct(&params, 5_000.0);
        assert!((large - impact_sqrt_pct(params.sigma, 5_000.0, 10_000.0)).abs() < 1e-12);
    }

    #[test]
    fn slice_count_respects_participation_cap() {
        assert_eq!(optimal_slices(0.0, 1000.0), 1);
        assert_eq!(optimal_slices(100.0, 0.0), 1);
        // 100 units at 5% of 1000/day => 2 slices.
        assert_eq!(optimal_slices(100.0, 1000.0), 2);
        // Huge order clamps at 100.
        assert_eq!(optimal_slices(1e9, 1000.0), 100);
    }

    #[test]
    fn median_and_variance() {
        assert_eq!(median(&[3.0, 1.0, 2.0]), 2.0);
        assert_eq!(median(&[4.0, 1.0, 2.0, 3.0]), 2.5);
        assert_eq!(median(&[]), 0.0);
        assert!((variance(&[1.0, 2.0, 3.0]) - 1.0).abs() < 1e-12);
        assert_eq!(variance(&[5.0]), 0.0);
    }
}
