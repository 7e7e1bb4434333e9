// =============================================================================
// Ladder math — pure functions for grid materialization, trailing, and
// per-level placement decisions (spec §4.3 Steps 3-6)
// =============================================================================
//
// Kept free of I/O and `AppState` so every invariant in spec §8 can be
// property-tested directly. The engine's reconciliation loop calls these in
// sequence and only then talks to the store/adapter.
// =============================================================================

use crate::types::{round_to_precision, Side};

/// Step 3 — materialize `N` levels around `current_price` with spread
/// fraction `spread_pct/100`, rounded to `price_precision` and sorted
/// ascending. `grids_quantity` must be even (enforced by `GridStrategy::validate`).
pub fn materialize_levels(current_price: f64, spread_pct: f64, grids_quantity: u32, price_precision: u32) -> Vec<f64> {
    let spread = spread_pct / 100.0;
    let half = grids_quantity / 2;
    let mut levels = Vec::with_capacity(grids_quantity as usize);
    for i in 1..=half {
        let i = i as f64;
        levels.push(round_to_precision(current_price * (1.0 - spread * i), price_precision));
        levels.push(round_to_precision(current_price * (1.0 + spread * i), price_precision));
    }
    levels.sort_by(|a, b| a.partial_cmp(b).unwrap());
    levels
}

/// Step 4 — trailing up. If the top of the ladder has been broken by more
/// than `0.2 * spread`, drop the lowest level, append a new top at
/// `max_level * (1 + spread)`, and return the re-sorted ladder plus the
/// dropped level (so the caller can cancel any resting order sitting on
/// it). Returns `None` if trailing does not trigger this cycle.
pub fn trail_up(levels: &[f64], current_price: f64, spread_pct: f64, price_precision: u32) -> Option<(Vec<f64>, f64)> {
    let max_level = *levels.last()?;
    let spread = spread_pct / 100.0;
    let trigger = max_level * (1.0 + spread * 0.2);
    if current_price <= trigger {
        return None;
    }

    let dropped = *levels.first()?;
    let new_top = round_to_precision(max_level * (1.0 + spread), price_precision);

    let mut new_levels: Vec<f64> = levels.iter().copied().skip(1).collect();
    new_levels.push(new_top);
    new_levels.sort_by(|a, b| a.partial_cmp(b).unwrap());

    Some((new_levels, dropped))
}

/// Relative-tolerance price match used throughout reconciliation (spec's
/// `math.isclose(rel_tol=1e-5)` equivalent).
pub fn prices_match(a: f64, b: f64) -> bool {
    const REL_TOL: f64 = 1e-5;
    if a == b {
        return true;
    }
    let diff = (a - b).abs();
    diff <= REL_TOL * a.abs().max(b.abs())
}

/// Step 5 — desired side for a level given the current price and the
/// margin band `P * s * 0.1`. Returns `None` if the level falls inside the
/// band (skip this cycle).
pub fn target_side_for_level(level_price: f64, current_price: f64, spread_pct: f64) -> Option<Side> {
    let spread = spread_pct / 100.0;
    let margin = current_price * spread * 0.1;
    if level_price > current_price + margin {
        Some(Side::Sell)
    } else if level_price < current_price - margin {
        Some(Side::Buy)
    } else {
        None
    }
}

/// Anti-wash floor: a sell at `level_price` is only allowed if it is at or
/// above `last_buy_price * (1 + 0.5 * spread)`.
pub fn anti_wash_floor(last_buy_price: f64, spread_pct: f64) -> f64 {
    last_buy_price * (1.0 + 0.5 * spread_pct / 100.0)
}

/// Whether `level_price` sits on an existing resting order (within
/// relative tolerance), and if so its side.
pub fn find_order_at_level<'a, O>(orders: &'a [O], level_price: f64, price_of: impl Fn(&O) -> f64) -> Option<&'a O> {
    orders.iter().find(|o| prices_match(price_of(o), level_price))
}

/// Step 6 — orphan cleanup: orders whose price matches no level in `levels`.
pub fn is_orphan(order_price: f64, levels: &[f64]) -> bool {
    !levels.iter().any(|&lvl| prices_match(order_price, lvl))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn materialize_levels_matches_spec_boundary_scenario_1() {
        let levels = materialize_levels(100.0, 1.0, 4, 2);
        assert_eq!(levels, vec![98.00, 99.00, 101.00, 102.00]);
    }

    #[test]
    fn materialize_levels_always_sorted_and_bounded() {
        let levels = materialize_levels(50.0, 2.5, 8, 4);
        assert_eq!(levels.len(), 8);
        let mut sorted = levels.clone();
        sorted.sort_by(|a, b| a.partial_cmp(b).unwrap());
        assert_eq!(levels, sorted);
    }

    #[test]
    fn target_side_margin_band_boundary_scenario_2() {
        // price=100, s=1% -> margin = 0.10
        assert_eq!(target_side_for_level(100.05, 100.0, 1.0), None);
        assert_eq!(target_side_for_level(101.00, 100.0, 1.0), Some(Side::Sell));
        assert_eq!(target_side_for_level(99.00, 100.0, 1.0), Some(Side::Buy));
    }

    #[test]
    fn anti_wash_floor_boundary_scenario_3() {
        let floor = anti_wash_floor(99.50, 1.0);
        assert!((floor - 99.9975).abs() < 1e-9);
        assert!(99.99 < floor);
        assert!(100.50 > floor);
    }

    #[test]
    fn trail_up_boundary_scenario_4() {
        let levels = vec![98.0, 99.0, 101.0, 102.0];
        let (new_levels, dropped) = trail_up(&levels, 102.21, 1.0, 2).unwrap();
        assert_eq!(dropped, 98.0);
        assert_eq!(new_levels, vec![99.0, 101.0, 102.0, 103.00]);
    }

    #[test]
    fn trail_up_does_not_trigger_below_threshold() {
        let levels = vec![98.0, 99.0, 101.0, 102.0];
        assert!(trail_up(&levels, 102.20, 1.0, 2).is_none());
    }

    #[test]
    fn prices_match_within_relative_tolerance() {
        assert!(prices_match(100.0, 100.0009999));
        assert!(!prices_match(100.0, 100.01));
    }

    #[test]
    fn is_orphan_detects_unmatched_price() {
        let levels = vec![98.0, 99.0, 101.0, 102.0];
        assert!(!is_orphan(99.0, &levels));
        assert!(is_orphan(98.0 * 1.1, &levels));
    }
}
