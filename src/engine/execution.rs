//! Execution-plan simulation.
//!
//! Walks a book level by level to answer: if we tried to move `quantity`
//! units right now, what would it actually cost? `can_fill` is false when
//! the resting volume runs out first, and the expected price is the
//! volume-weighted mean of the consumed levels.

use crate::esi::market::MarketOrder;

#[derive(Debug, Clone, Default, PartialEq)]
pub struct ExecutionPlan {
    pub can_fill: bool,
    pub filled_qty: i64,
    /// Volume-weighted average price over consumed levels.
    pub expected_price: f64,
    /// Price of the deepest level touched.
    pub worst_price: f64,
    /// (worst - best) / best as a percent; sign-normalized so deeper is
    /// always positive.
    pub slippage_pct: f64,
}

/// Plans a fill of `quantity` units against `book`. `buying` walks sell
/// orders from the cheapest up; selling walks buy orders from the highest
/// bid down.
pub fn plan_fill(book: &[MarketOrder], quantity: i64, buying: bool) -> ExecutionPlan {
    if quantity <= 0 || book.is_empty() {
        return ExecutionPlan::default();
    }

    let mut levels: Vec<(f64, i64)> = book
        .iter()
        .filter(|o| o.volume_remaining > 0 && o.price > 0.0)
        .map(|o| (o.price, o.volume_remaining))
        .collect();
    if levels.is_empty() {
        return ExecutionPlan::default();
    }
    if buying {
        levels.sort_by(|a, b| a.0.partial_cmp(&b.0).unwrap_or(std::cmp::Ordering::Equal));
    } else {
        levels.sort_by(|a, b| b.0.partial_cmp(&a.0).unwrap_or(std::cmp::Ordering::Equal));
    }

    let best = levels[0].0;
    let mut remaining = quantity;
    let mut cost = 0.0;
    let mut filled = 0i64;
    let mut worst = best;

    for (price, available) in levels {
        if remaining == 0 {
            break;
        }
        let take = remaining.min(available);
        cost += price * take as f64;
        filled += take;
        remaining -= take;
        worst = price;
    }

    let expected_price = if filled > 0 { cost / filled as f64 } else { 0.0 };
    let slippage_pct = if best > 0.0 {
        ((worst - best) / best).abs() * 100.0
    } else {
        0.0
    };

    ExecutionPlan {
        can_fill: remaining == 0,
        filled_qty: filled,
        expected_price,
        worst_price: worst,
        slippage_pct,
    }
}
