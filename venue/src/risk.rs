//! Pure risk math. Every function here is side-effect free: no I/O, no
//! logging, no clock reads. The safety gate and the rebalancer are built on
//! top of these.

use rust_decimal::Decimal;

use crate::constants::BASE_TX_FEE_LAMPORTS;
use crate::types::{AccountState, RebalanceAction, Side};

/// Funding revenue is haircut to half the observed rate before any
/// profitability comparison.
pub const FUNDING_HAIRCUT: Decimal = Decimal::from_parts(5, 0, 0, false, 1);

/// Venue taker fee on notional.
const TAKER_FEE_RATE: Decimal = Decimal::from_parts(1, 0, 0, false, 3);
/// Padding on notional for fill variance.
const COST_PADDING_RATE: Decimal = Decimal::from_parts(2, 0, 0, false, 4);

fn clamp_pct(value: Decimal) -> Decimal {
  value.max(Decimal::ZERO).min(Decimal::ONE_HUNDRED)
}

/// Distance from liquidation in percent: 100 = maximally safe, 0 = at
/// liquidation. Zero collateral is zero health.
pub fn health_ratio(total_collateral: Decimal, maintenance_margin: Decimal) -> Decimal {
  if total_collateral <= Decimal::ZERO {
    return Decimal::ZERO;
  }
  clamp_pct((total_collateral - maintenance_margin) / total_collateral * Decimal::ONE_HUNDRED)
}

/// Directional exposure in base units: `(spot - reserved) + perp`.
pub fn net_delta(spot_base: Decimal, perp_base: Decimal, reserved_base: Decimal) -> Decimal {
  (spot_base - reserved_base) + perp_base
}

/// Delta as a fraction of hedgeable spot, in percent. Zero when there is no
/// hedgeable spot.
pub fn drift_pct(spot_base: Decimal, perp_base: Decimal, reserved_base: Decimal) -> Decimal {
  let hedgeable = spot_base - reserved_base;
  if hedgeable <= Decimal::ZERO {
    return Decimal::ZERO;
  }
  net_delta(spot_base, perp_base, reserved_base) / hedgeable * Decimal::ONE_HUNDRED
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Correction {
  pub size: Decimal,
  pub action: RebalanceAction,
}

/// Size and direction of the order that zeroes the delta. Positive delta
/// means the book is net long and the short leg must grow.
pub fn correction(net_delta: Decimal) -> Correction {
  let action = if net_delta > Decimal::ZERO {
    RebalanceAction::ExpandShort
  } else if net_delta < Decimal::ZERO {
    RebalanceAction::ReduceShort
  } else {
    RebalanceAction::None
  };
  Correction {
    size: net_delta.abs(),
    action,
  }
}

/// Health after pulling `withdraw_quote` of collateral, under the same
/// maintenance requirement. A withdrawal that consumes all collateral
/// projects to zero.
pub fn projected_health_after_withdrawal(state: &AccountState, withdraw_quote: Decimal) -> Decimal {
  let remaining = state.total_collateral - withdraw_quote;
  if remaining <= Decimal::ZERO {
    return Decimal::ZERO;
  }
  clamp_pct((remaining - state.maintenance_margin) / remaining * Decimal::ONE_HUNDRED)
}

/// Hourly funding revenue at the raw rate.
pub fn expected_funding_revenue(
  size_base: Decimal,
  funding_rate_hourly: Decimal,
  mark_price: Decimal,
) -> Decimal {
  size_base * funding_rate_hourly * mark_price
}

/// Revenue at the haircut rate. This is the figure the fee guard compares
/// against cost.
pub fn haircut_funding_revenue(
  size_base: Decimal,
  funding_rate_hourly: Decimal,
  mark_price: Decimal,
) -> Decimal {
  expected_funding_revenue(size_base, funding_rate_hourly * FUNDING_HAIRCUT, mark_price)
}

/// All-in cost of emitting one taker order: priority tip, taker fee, fill
/// padding, and the flat transaction fee.
pub fn estimated_cost(
  tip_native: Decimal,
  notional_quote: Decimal,
  native_price_quote: Decimal,
) -> Decimal {
  let base_tx_fee_native = Decimal::new(BASE_TX_FEE_LAMPORTS as i64, 9);
  tip_native * native_price_quote
    + notional_quote * TAKER_FEE_RATE
    + notional_quote * COST_PADDING_RATE
    + base_tx_fee_native * native_price_quote
}

/// Slippage allowance by trade size, monotonically non-decreasing in
/// notional, bounded to [0.1%, 0.3%].
pub fn slippage_bound(trade_notional_quote: Decimal) -> Decimal {
  if trade_notional_quote < Decimal::new(1_000, 0) {
    Decimal::new(1, 3)
  } else if trade_notional_quote < Decimal::new(10_000, 0) {
    Decimal::new(2, 3)
  } else {
    Decimal::new(3, 3)
  }
}

/// Worst acceptable fill: pay up for buys, give way for sells.
pub fn price_limit(mark_price: Decimal, side: Side, slippage: Decimal) -> Decimal {
  match side {
    Side::Long => mark_price * (Decimal::ONE + slippage),
    Side::Short => mark_price * (Decimal::ONE - slippage),
  }
}

/// Account leverage if `added_notional` of position were opened now.
pub fn leverage_if_opened(state: &AccountState, added_notional: Decimal) -> Decimal {
  if state.total_collateral <= Decimal::ZERO {
    return Decimal::MAX;
  }
  (state.total_notional() + added_notional) / state.total_collateral
}

#[cfg(test)]
mod tests {
  use chrono::Utc;
  use proptest::prelude::*;

  use super::*;

  fn state(total_collateral: Decimal, maintenance_margin: Decimal) -> AccountState {
    AccountState {
      timestamp: Utc::now(),
      total_collateral,
      free_collateral: Decimal::ZERO,
      maintenance_margin,
      initial_margin: Decimal::ZERO,
      leverage: Decimal::ZERO,
      health_ratio: health_ratio(total_collateral, maintenance_margin),
      positions: vec![],
      unrealized_pnl: Decimal::ZERO,
    }
  }

  #[test]
  fn drift_of_clean_hedge_is_zero() {
    // spot 10, perp -10, reserved 0
    let d = drift_pct(Decimal::new(10, 0), Decimal::new(-10, 0), Decimal::ZERO);
    assert_eq!(d, Decimal::ZERO);
  }

  #[test]
  fn positive_drift_expands_short() {
    let spot = Decimal::new(10, 0);
    let perp = Decimal::new(-95, 1);
    assert_eq!(drift_pct(spot, perp, Decimal::ZERO), Decimal::new(5, 0));
    let c = correction(net_delta(spot, perp, Decimal::ZERO));
    assert_eq!(c.size, Decimal::new(5, 1));
    assert_eq!(c.action, RebalanceAction::ExpandShort);
  }

  #[test]
  fn negative_drift_reduces_short() {
    let c = correction(net_delta(
      Decimal::new(10, 0),
      Decimal::new(-105, 1),
      Decimal::ZERO,
    ));
    assert_eq!(c.size, Decimal::new(5, 1));
    assert_eq!(c.action, RebalanceAction::ReduceShort);
  }

  #[test]
  fn zero_hedgeable_spot_reports_zero_drift() {
    assert_eq!(
      drift_pct(Decimal::new(17, 3), Decimal::new(-1, 0), Decimal::new(17, 3)),
      Decimal::ZERO
    );
  }

  #[test]
  fn projected_health_matches_withdrawal_scenario() {
    // collateral 1000, maintenance 300, withdraw 400 => 50.0
    let s = state(Decimal::new(1_000, 0), Decimal::new(300, 0));
    assert_eq!(
      projected_health_after_withdrawal(&s, Decimal::new(400, 0)),
      Decimal::new(50, 0)
    );
  }

  #[test]
  fn projected_health_of_full_withdrawal_is_zero() {
    let s = state(Decimal::new(1_000, 0), Decimal::new(300, 0));
    assert_eq!(
      projected_health_after_withdrawal(&s, Decimal::new(1_000, 0)),
      Decimal::ZERO
    );
  }

  #[test]
  fn cost_includes_every_term() {
    let cost = estimated_cost(Decimal::new(1, 4), Decimal::new(1_000, 0), Decimal::new(150, 0));
    // 0.0001 * 150 + 1000 * 0.001 + 1000 * 0.0002 + 0.000005 * 150
    let expected = Decimal::new(15, 3)
      + Decimal::new(1, 0)
      + Decimal::new(2, 1)
      + Decimal::new(75, 5);
    assert_eq!(cost, expected);
  }

  #[test]
  fn price_limit_pads_the_right_way() {
    let mark = Decimal::new(150, 0);
    let slip = Decimal::new(1, 3);
    assert_eq!(price_limit(mark, Side::Long, slip), Decimal::new(150_150, 3));
    assert_eq!(price_limit(mark, Side::Short, slip), Decimal::new(149_850, 3));
  }

  #[test]
  fn leverage_if_opened_handles_zero_collateral() {
    let s = state(Decimal::ZERO, Decimal::ZERO);
    assert_eq!(leverage_if_opened(&s, Decimal::new(100, 0)), Decimal::MAX);
  }

  proptest! {
    #![proptest_config(ProptestConfig::with_cases(256))]

    #[test]
    fn health_is_bounded(collateral in 0i64..i64::MAX / 2, maintenance in 0i64..i64::MAX / 2) {
      let h = health_ratio(Decimal::new(collateral, 6), Decimal::new(maintenance, 6));
      prop_assert!(h >= Decimal::ZERO);
      prop_assert!(h <= Decimal::ONE_HUNDRED);
      if collateral == 0 {
        prop_assert_eq!(h, Decimal::ZERO);
      }
    }

    #[test]
    fn drift_matches_definition(
      spot in 1i64..1_000_000_000_000,
      perp in -1_000_000_000_000i64..1_000_000_000_000,
      reserved in 0i64..1_000_000_000,
    ) {
      let spot = Decimal::new(spot, 9);
      let perp = Decimal::new(perp, 9);
      let reserved = Decimal::new(reserved, 9);
      prop_assume!(spot - reserved > Decimal::ZERO);
      let got = drift_pct(spot, perp, reserved);
      let want = ((spot - reserved) + perp) / (spot - reserved) * Decimal::ONE_HUNDRED;
      prop_assert_eq!(got, want);
    }

    #[test]
    fn profitability_uses_half_the_funding_rate(
      size in 1i64..1_000_000_000,
      rate in -1_000_000i64..1_000_000,
      mark in 1i64..1_000_000_000,
    ) {
      let size = Decimal::new(size, 6);
      let rate = Decimal::new(rate, 9);
      let mark = Decimal::new(mark, 4);
      let haircut = haircut_funding_revenue(size, rate, mark);
      let raw = expected_funding_revenue(size, rate, mark);
      prop_assert_eq!(haircut * Decimal::new(2, 0), raw);
    }

    #[test]
    fn slippage_is_monotone_and_bounded(a in 0i64..100_000_000, b in 0i64..100_000_000) {
      let (lo, hi) = if a <= b { (a, b) } else { (b, a) };
      let s_lo = slippage_bound(Decimal::new(lo, 2));
      let s_hi = slippage_bound(Decimal::new(hi, 2));
      prop_assert!(s_lo <= s_hi);
      prop_assert!(s_lo >= Decimal::new(1, 3));
      prop_assert!(s_hi <= Decimal::new(3, 3));
    }

    #[test]
    fn correction_size_is_absolute(delta in -1_000_000_000i64..1_000_000_000) {
      let d = Decimal::new(delta, 6);
      let c = correction(d);
      prop_assert_eq!(c.size, d.abs());
      match c.action {
        RebalanceAction::ExpandShort => prop_assert!(d > Decimal::ZERO),
        RebalanceAction::ReduceShort => prop_assert!(d < Decimal::ZERO),
        RebalanceAction::None => prop_assert_eq!(d, Decimal::ZERO),
      }
    }
  }
}
