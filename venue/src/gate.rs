use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use crate::risk;
use crate::types::AccountState;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum BlockReason {
  Unprofitable,
  StaleOracle,
  LowGas,
  LeverageLimit,
  HealthFloor,
  Dust,
}

impl std::fmt::Display for BlockReason {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    let s = serde_json::to_string(self).map_err(|_| std::fmt::Error)?;
    write!(f, "{}", s.trim_matches('"'))
  }
}

/// Outcome of the composite pre-trade check. A block is a warning, not an
/// error: the keeper keeps ticking.
#[derive(Debug, Clone, PartialEq)]
pub enum GateVerdict {
  Pass,
  Block { reason: BlockReason, detail: String },
}

impl GateVerdict {
  pub fn passed(&self) -> bool {
    matches!(self, GateVerdict::Pass)
  }

  fn block(reason: BlockReason, detail: String) -> Self {
    GateVerdict::Block { reason, detail }
  }
}

#[derive(Debug, Clone)]
pub struct GateConfig {
  pub max_leverage: Decimal,
  pub min_health_after_withdrawal: Decimal,
  pub min_trade_size_base: Decimal,
  pub reserved_gas_native: Decimal,
  pub oracle_stale_ms: i64,
  pub tip_native: Decimal,
}

/// Inputs for gating an order that changes the perp position.
#[derive(Debug, Clone)]
pub struct OpenCheck<'a> {
  pub state: &'a AccountState,
  pub size_base: Decimal,
  pub mark_price: Decimal,
  pub funding_rate_hourly: Decimal,
  pub oracle_age_ms: i64,
  pub native_balance: Decimal,
  pub native_price_quote: Decimal,
}

/// Inputs for gating a collateral withdrawal.
#[derive(Debug, Clone)]
pub struct WithdrawCheck<'a> {
  pub state: &'a AccountState,
  pub withdraw_quote: Decimal,
  pub oracle_age_ms: i64,
  pub native_balance: Decimal,
}

pub struct SafetyGate {
  cfg: GateConfig,
}

impl SafetyGate {
  pub fn new(cfg: GateConfig) -> Self {
    Self { cfg }
  }

  pub fn config(&self) -> &GateConfig {
    &self.cfg
  }

  /// Sub-checks run in order; the first failure wins.
  pub fn check_open(&self, c: &OpenCheck) -> GateVerdict {
    let notional = (c.size_base * c.mark_price).abs();

    let revenue = risk::haircut_funding_revenue(c.size_base.abs(), c.funding_rate_hourly.abs(), c.mark_price);
    let cost = risk::estimated_cost(self.cfg.tip_native, notional, c.native_price_quote);
    if revenue < cost * Decimal::new(2, 0) {
      return GateVerdict::block(
        BlockReason::Unprofitable,
        format!("expected_revenue={} estimated_cost={}", revenue, cost),
      );
    }

    if let Some(v) = self.oracle_latency(c.oracle_age_ms) {
      return v;
    }
    if let Some(v) = self.gas_reserve(c.native_balance) {
      return v;
    }

    let projected = risk::leverage_if_opened(c.state, notional);
    if projected > self.cfg.max_leverage {
      return GateVerdict::block(
        BlockReason::LeverageLimit,
        format!("projected_leverage={} max={}", projected, self.cfg.max_leverage),
      );
    }

    if c.size_base.abs() < self.cfg.min_trade_size_base {
      return GateVerdict::block(
        BlockReason::Dust,
        format!("size={} min={}", c.size_base.abs(), self.cfg.min_trade_size_base),
      );
    }

    GateVerdict::Pass
  }

  pub fn check_withdraw(&self, c: &WithdrawCheck) -> GateVerdict {
    if let Some(v) = self.oracle_latency(c.oracle_age_ms) {
      return v;
    }
    if let Some(v) = self.gas_reserve(c.native_balance) {
      return v;
    }

    let projected = risk::projected_health_after_withdrawal(c.state, c.withdraw_quote);
    if projected < self.cfg.min_health_after_withdrawal {
      return GateVerdict::block(
        BlockReason::HealthFloor,
        format!(
          "projected_health={} floor={}",
          projected, self.cfg.min_health_after_withdrawal
        ),
      );
    }

    GateVerdict::Pass
  }

  fn oracle_latency(&self, age_ms: i64) -> Option<GateVerdict> {
    if !crate::oracle::is_fresh(age_ms, self.cfg.oracle_stale_ms) {
      return Some(GateVerdict::block(
        BlockReason::StaleOracle,
        format!("oracle_age_ms={} threshold_ms={}", age_ms, self.cfg.oracle_stale_ms),
      ));
    }
    None
  }

  fn gas_reserve(&self, native_balance: Decimal) -> Option<GateVerdict> {
    if native_balance < self.cfg.reserved_gas_native {
      return Some(GateVerdict::block(
        BlockReason::LowGas,
        format!(
          "native_balance={} reserved={}",
          native_balance, self.cfg.reserved_gas_native
        ),
      ));
    }
    None
  }
}

#[cfg(test)]
mod tests {
  use chrono::Utc;

  use super::*;
  use crate::risk::{estimated_cost, haircut_funding_revenue};

  fn cfg() -> GateConfig {
    GateConfig {
      max_leverage: Decimal::new(5, 0),
      min_health_after_withdrawal: Decimal::new(80, 0),
      min_trade_size_base: Decimal::new(5, 3),
      reserved_gas_native: Decimal::new(17, 3),
      oracle_stale_ms: 300,
      tip_native: Decimal::new(1, 4),
    }
  }

  fn state(total_collateral: Decimal, maintenance_margin: Decimal) -> AccountState {
    AccountState {
      timestamp: Utc::now(),
      total_collateral,
      free_collateral: total_collateral,
      maintenance_margin,
      initial_margin: Decimal::ZERO,
      leverage: Decimal::ZERO,
      health_ratio: Decimal::ONE_HUNDRED,
      positions: vec![],
      unrealized_pnl: Decimal::ZERO,
    }
  }

  fn healthy_open<'a>(s: &'a AccountState) -> OpenCheck<'a> {
    OpenCheck {
      state: s,
      size_base: Decimal::new(5, 1),
      mark_price: Decimal::new(150, 0),
      // strongly positive funding so FeeGuard clears by a wide margin
      funding_rate_hourly: Decimal::new(1, 2),
      oracle_age_ms: 50,
      native_balance: Decimal::new(1, 0),
      native_price_quote: Decimal::new(150, 0),
    }
  }

  #[test]
  fn clean_open_passes() {
    let s = state(Decimal::new(5_000, 0), Decimal::new(100, 0));
    assert_eq!(cfg_gate().check_open(&healthy_open(&s)), GateVerdict::Pass);
  }

  fn cfg_gate() -> SafetyGate {
    SafetyGate::new(cfg())
  }

  #[test]
  fn thin_funding_is_unprofitable() {
    let s = state(Decimal::new(5_000, 0), Decimal::new(100, 0));
    let mut c = healthy_open(&s);
    c.funding_rate_hourly = Decimal::new(1, 9);
    match cfg_gate().check_open(&c) {
      GateVerdict::Block { reason, .. } => assert_eq!(reason, BlockReason::Unprofitable),
      v => panic!("expected block, got {:?}", v),
    }
  }

  #[test]
  fn revenue_exactly_twice_cost_passes() {
    let s = state(Decimal::new(5_000, 0), Decimal::new(100, 0));
    let mut c = healthy_open(&s);
    // size * mark = 10 keeps every division below terminating
    c.size_base = Decimal::new(1, 1);
    c.mark_price = Decimal::new(100, 0);
    let notional = c.size_base * c.mark_price;
    let cost = estimated_cost(cfg().tip_native, notional, c.native_price_quote);
    let target = cost * Decimal::new(2, 0);
    // haircut_revenue = size * rate/2 * mark => rate = 2 * target / (size * mark)
    c.funding_rate_hourly = Decimal::new(2, 0) * target / notional;
    let revenue = haircut_funding_revenue(c.size_base, c.funding_rate_hourly, c.mark_price);
    assert_eq!(revenue, target);
    assert_eq!(cfg_gate().check_open(&c), GateVerdict::Pass);
  }

  #[test]
  fn stale_oracle_blocks() {
    let s = state(Decimal::new(5_000, 0), Decimal::new(100, 0));
    let mut c = healthy_open(&s);
    c.oracle_age_ms = 301;
    match cfg_gate().check_open(&c) {
      GateVerdict::Block { reason, .. } => assert_eq!(reason, BlockReason::StaleOracle),
      v => panic!("expected block, got {:?}", v),
    }
    // equal to threshold still passes
    c.oracle_age_ms = 300;
    assert_eq!(cfg_gate().check_open(&c), GateVerdict::Pass);
  }

  #[test]
  fn low_gas_blocks() {
    let s = state(Decimal::new(5_000, 0), Decimal::new(100, 0));
    let mut c = healthy_open(&s);
    c.native_balance = Decimal::new(16, 3);
    match cfg_gate().check_open(&c) {
      GateVerdict::Block { reason, .. } => assert_eq!(reason, BlockReason::LowGas),
      v => panic!("expected block, got {:?}", v),
    }
    c.native_balance = Decimal::new(17, 3);
    assert_eq!(cfg_gate().check_open(&c), GateVerdict::Pass);
  }

  #[test]
  fn leverage_ceiling_blocks() {
    let s = state(Decimal::new(10, 0), Decimal::ZERO);
    let mut c = healthy_open(&s);
    // 0.5 * 150 = 75 notional on 10 collateral => 7.5x
    c.funding_rate_hourly = Decimal::new(1, 1);
    match cfg_gate().check_open(&c) {
      GateVerdict::Block { reason, .. } => assert_eq!(reason, BlockReason::LeverageLimit),
      v => panic!("expected block, got {:?}", v),
    }
  }

  #[test]
  fn dust_blocks_below_min_size() {
    let s = state(Decimal::new(5_000, 0), Decimal::new(100, 0));
    let mut c = healthy_open(&s);
    c.size_base = Decimal::new(3, 3);
    match cfg_gate().check_open(&c) {
      GateVerdict::Block { reason, .. } => assert_eq!(reason, BlockReason::Dust),
      v => panic!("expected block, got {:?}", v),
    }
    // exactly at the minimum passes
    c.size_base = Decimal::new(5, 3);
    assert_eq!(cfg_gate().check_open(&c), GateVerdict::Pass);
  }

  #[test]
  fn withdrawal_below_health_floor_blocks() {
    let s = state(Decimal::new(1_000, 0), Decimal::new(300, 0));
    let c = WithdrawCheck {
      state: &s,
      withdraw_quote: Decimal::new(400, 0),
      oracle_age_ms: 10,
      native_balance: Decimal::new(1, 0),
    };
    match cfg_gate().check_withdraw(&c) {
      GateVerdict::Block { reason, detail } => {
        assert_eq!(reason, BlockReason::HealthFloor);
        assert!(detail.contains("projected_health=50"));
      }
      v => panic!("expected block, got {:?}", v),
    }
  }

  #[test]
  fn withdrawal_at_floor_passes() {
    // maintenance 100 on 5000: withdrawing 4500 projects exactly 80
    let s = state(Decimal::new(5_000, 0), Decimal::new(100, 0));
    let c = WithdrawCheck {
      state: &s,
      withdraw_quote: Decimal::new(4_500, 0),
      oracle_age_ms: 10,
      native_balance: Decimal::new(1, 0),
    };
    assert_eq!(cfg_gate().check_withdraw(&c), GateVerdict::Pass);
  }
}
