//! Character-level risk metrics over the daily P&L series.
//!
//! Historical simulation: value-at-risk is the empirical loss quantile and
//! expected shortfall the mean loss beyond it. Losses are reported as
//! positive numbers; a series with no losing tail yields zeros.

use serde::Serialize;

use super::portfolio::DailyPnl;

#[derive(Debug, Clone, Default, Serialize)]
pub struct RiskReport {
    pub var_95: f64,
    pub var_99: f64,
    pub expected_shortfall_95: f64,
    pub expected_shortfall_99: f64,
    pub observations: usize,
}

/// Loss quantile by historical simulation. `confidence` in (0, 1).
pub fn value_at_risk(daily_pnl: &[f64], confidence: f64) -> f64 {
    if daily_pnl.is_empty() || !(0.0..1.0).contains(&confidence) {
        return 0.0;
    }
    let mut sorted = daily_pnl.to_vec();
    sorted.sort_by(|a, b| a.partial_cmp(b).unwrap_or(std::cmp::Ordering::Equal));

    let index = ((1.0 - confidence) * sorted.len() as f64).floor() as usize;
    let index = index.min(sorted.len() - 1);
    (-sorted[index]).max(0.0)
}

/// Mean loss in the tail beyond the VaR cutoff.
pub fn expected_shortfall(daily_pnl: &[f64], confidence: f64) -> f64 {
    if daily_pnl.is_empty() || !(0.0..1.0).contains(&confidence) {
        return 0.0;
    }
    let mut sorted = daily_pnl.to_vec();
    sorted.sort_by(|a, b| a.partial_cmp(b).unwrap_or(std::cmp::Ordering::Equal));

    let tail_len = (((1.0 - confidence) * sorted.len() as f64).floor() as usize + 1)
        .min(sorted.len());
    let tail = &sorted[..tail_len];
    let mean_tail = tail.iter().sum::<f64>() / tail.len() as f64;
    (-mean_tail).max(0.0)
}

pub fn assess(daily: &[DailyPnl]) -> RiskReport {
    let pnl: Vec<f64> = daily.iter().map(|d| d.net_pnl).collect();
    RiskReport {
        var_95: value_at_risk(&pnl, 0.95),
        var_99: value_at_risk(&pnl, 0.99),
        expected_shortfall_95: expected_shortfall(&pnl, 0.95),
        expected_shortfall_99: expected_shortfall(&pnl, 0.99),
        observations: pnl.len(),
    }
}
