use chrono::{DateTime, Utc};
use lazy_static::lazy_static;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use crate::constants::*;
use crate::gate::BlockReason;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Side {
  Long,
  Short,
}

impl Side {
  pub fn opposite(&self) -> Self {
    match self {
      Side::Long => Side::Short,
      Side::Short => Side::Long,
    }
  }
}

impl std::fmt::Display for Side {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    match self {
      Side::Long => write!(f, "long"),
      Side::Short => write!(f, "short"),
    }
  }
}

/// Perp market metadata. Loaded once at init and immutable for the lifetime
/// of a keeper instance.
#[derive(Debug, Clone, PartialEq)]
pub struct Market {
  pub index: u16,
  pub symbol: &'static str,
  /// Spot market holding this perp's base asset.
  pub base_spot_index: u16,
  pub base_decimals: u32,
  pub quote_decimals: u32,
  pub margin_ratio_maintenance: Decimal,
  pub margin_ratio_initial: Decimal,
}

#[derive(Debug, Clone, PartialEq)]
pub struct SpotMarketMeta {
  pub index: u16,
  pub symbol: &'static str,
  pub decimals: u32,
}

fn perp(
  index: u16,
  symbol: &'static str,
  base_spot_index: u16,
  maintenance_bps: i64,
  initial_bps: i64,
) -> Market {
  Market {
    index,
    symbol,
    base_spot_index,
    base_decimals: BASE_DECIMALS,
    quote_decimals: QUOTE_DECIMALS,
    margin_ratio_maintenance: Decimal::new(maintenance_bps, 4),
    margin_ratio_initial: Decimal::new(initial_bps, 4),
  }
}

lazy_static! {
  /// The venue's fixed perp market set.
  pub static ref PERP_MARKETS: Vec<Market> = vec![
    perp(0, "SOL-PERP", 1, 500, 1000),
    perp(1, "BTC-PERP", 2, 250, 500),
    perp(2, "ETH-PERP", 3, 250, 500),
    perp(3, "APT-PERP", 4, 1000, 2000),
    perp(4, "BNB-PERP", 5, 1000, 2000),
    perp(5, "MATIC-PERP", 6, 1000, 2000),
    perp(6, "ARB-PERP", 7, 1000, 2000),
    perp(7, "DOGE-PERP", 8, 1000, 2000),
    perp(8, "SUI-PERP", 9, 1000, 2000),
  ];

  pub static ref SPOT_MARKETS: Vec<SpotMarketMeta> = vec![
    SpotMarketMeta { index: 0, symbol: "USDC", decimals: QUOTE_DECIMALS },
    SpotMarketMeta { index: 1, symbol: "SOL", decimals: 9 },
    SpotMarketMeta { index: 2, symbol: "BTC", decimals: 8 },
    SpotMarketMeta { index: 3, symbol: "ETH", decimals: 8 },
    SpotMarketMeta { index: 4, symbol: "APT", decimals: 8 },
    SpotMarketMeta { index: 5, symbol: "BNB", decimals: 8 },
    SpotMarketMeta { index: 6, symbol: "MATIC", decimals: 8 },
    SpotMarketMeta { index: 7, symbol: "ARB", decimals: 8 },
    SpotMarketMeta { index: 8, symbol: "DOGE", decimals: 8 },
    SpotMarketMeta { index: 9, symbol: "SUI", decimals: 8 },
  ];
}

pub fn perp_market_by_index(index: u16) -> Option<&'static Market> {
  PERP_MARKETS.iter().find(|m| m.index == index)
}

pub fn perp_market_by_symbol(symbol: &str) -> Option<&'static Market> {
  PERP_MARKETS.iter().find(|m| m.symbol.eq_ignore_ascii_case(symbol))
}

pub fn spot_market_by_index(index: u16) -> Option<&'static SpotMarketMeta> {
  SPOT_MARKETS.iter().find(|m| m.index == index)
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Position {
  pub market_index: u16,
  pub side: Side,
  /// Signed size in base units. Sign encodes side: short < 0.
  pub size: Decimal,
  pub entry_price: Decimal,
  pub mark_price: Decimal,
  pub settled_pnl: Decimal,
  /// Funding accrued since the position's last settlement index.
  pub unsettled_pnl: Decimal,
  /// None when collateral keeps liquidation unreachable.
  pub liquidation_price: Option<Decimal>,
}

impl Position {
  pub fn notional(&self) -> Decimal {
    (self.size * self.mark_price).abs()
  }
}

/// Immutable per-tick view of the venue account. Never mutated, only
/// superseded by the next snapshot.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AccountState {
  pub timestamp: DateTime<Utc>,
  pub total_collateral: Decimal,
  pub free_collateral: Decimal,
  pub maintenance_margin: Decimal,
  pub initial_margin: Decimal,
  pub leverage: Decimal,
  /// 100 = maximally safe, 0 = at liquidation.
  pub health_ratio: Decimal,
  pub positions: Vec<Position>,
  pub unrealized_pnl: Decimal,
}

impl AccountState {
  pub fn position(&self, market_index: u16) -> Option<&Position> {
    self.positions.iter().find(|p| p.market_index == market_index)
  }

  pub fn total_notional(&self) -> Decimal {
    self.positions.iter().map(|p| p.notional()).sum()
  }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EngineMode {
  Paper,
  Live,
}

impl std::fmt::Display for EngineMode {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    match self {
      EngineMode::Paper => write!(f, "paper"),
      EngineMode::Live => write!(f, "live"),
    }
  }
}

/// External command surface, JSON-tagged by `action`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "action", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Command {
  StartEngine { mode: EngineMode },
  StopEngine,
  Deposit { amount: Decimal },
  Withdraw { amount: Decimal },
  OpenPosition { market: String, direction: Side, size: Decimal },
  ClosePosition { market: String },
  SettlePnl { market: String },
}

impl Command {
  pub fn action(&self) -> &'static str {
    match self {
      Command::StartEngine { .. } => "START_ENGINE",
      Command::StopEngine => "STOP_ENGINE",
      Command::Deposit { .. } => "DEPOSIT",
      Command::Withdraw { .. } => "WITHDRAW",
      Command::OpenPosition { .. } => "OPEN_POSITION",
      Command::ClosePosition { .. } => "CLOSE_POSITION",
      Command::SettlePnl { .. } => "SETTLE_PNL",
    }
  }

  /// Commands that modify positions or collateral.
  pub fn is_trade(&self) -> bool {
    !matches!(self, Command::StartEngine { .. } | Command::StopEngine)
  }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorCode {
  InvalidRequest,
  InvalidMode,
  AlreadyRunning,
  NotRunning,
  InsufficientBalance,
  SimFailed,
  Timeout,
  Unknown,
  HealthFloor,
  UnknownMarket,
  LeverageLimit,
  SafetyBlock,
  NoPosition,
  NothingToSettle,
  TradingDisabled,
  Reconnecting,
  NotInitialized,
}

impl std::fmt::Display for ErrorCode {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    let s = serde_json::to_string(self).map_err(|_| std::fmt::Error)?;
    write!(f, "{}", s.trim_matches('"'))
  }
}

/// A validation or dispatch failure carrying its wire code.
#[derive(Debug, Clone, thiserror::Error)]
#[error("{code}: {message}")]
pub struct Coded {
  pub code: ErrorCode,
  pub message: String,
}

impl Coded {
  pub fn new(code: ErrorCode, message: impl Into<String>) -> Self {
    Self {
      code,
      message: message.into(),
    }
  }
}

/// Unrecoverable engine failure. Trading stops until operator reset.
#[derive(Debug, Clone, thiserror::Error)]
#[error("critical: {0}")]
pub struct CriticalFailure(pub String);

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CommandResponse {
  pub action: String,
  pub success: bool,
  #[serde(skip_serializing_if = "Option::is_none")]
  pub code: Option<ErrorCode>,
  pub message: String,
  #[serde(skip_serializing_if = "Option::is_none")]
  pub tx_signature: Option<String>,
}

impl CommandResponse {
  pub fn ok(action: &str, message: impl Into<String>, tx_signature: Option<String>) -> Self {
    Self {
      action: action.to_string(),
      success: true,
      code: None,
      message: message.into(),
      tx_signature,
    }
  }

  pub fn err(action: &str, code: ErrorCode, message: impl Into<String>) -> Self {
    Self {
      action: action.to_string(),
      success: false,
      code: Some(code),
      message: message.into(),
      tx_signature: None,
    }
  }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RebalanceAction {
  ExpandShort,
  ReduceShort,
  None,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RebalanceStatus {
  None,
  SkippedCooldown,
  SkippedMinSize,
  BlockedGate { reason: BlockReason },
  Executed,
  Failed,
  Unknown,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RebalanceEvent {
  pub timestamp: DateTime<Utc>,
  pub action: RebalanceAction,
  pub correction_size: Decimal,
  pub status: RebalanceStatus,
  #[serde(skip_serializing_if = "Option::is_none")]
  pub tx_signature: Option<String>,
  #[serde(skip_serializing_if = "Option::is_none")]
  pub error: Option<String>,
}

/// Push events for any subscriber (the dashboard is one such subscriber,
/// out of scope here).
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "event", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum EngineEvent {
  StateUpdate {
    state: AccountState,
    net_delta: Decimal,
    drift_pct: Decimal,
    timestamp: DateTime<Utc>,
  },
  Rebalance(RebalanceEvent),
  HealthWarn {
    health: Decimal,
    threshold: Decimal,
  },
  HealthCritical {
    health: Decimal,
    threshold: Decimal,
  },
  CommandResult {
    action: String,
    success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    code: Option<ErrorCode>,
    message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    tx_signature: Option<String>,
  },
  VaultSyncFailed {
    engine_id: String,
  },
  Critical {
    reason: String,
  },
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn market_registry_covers_nine_perps() {
    assert!(PERP_MARKETS.len() >= 9);
    for m in PERP_MARKETS.iter() {
      assert!(m.margin_ratio_maintenance > Decimal::ZERO);
      assert!(m.margin_ratio_maintenance < Decimal::ONE);
      assert!(m.margin_ratio_initial > m.margin_ratio_maintenance);
      assert!(spot_market_by_index(m.base_spot_index).is_some());
    }
    assert_eq!(perp_market_by_symbol("sol-perp").map(|m| m.index), Some(0));
  }

  #[test]
  fn command_json_shape() {
    let cmd: Command =
      serde_json::from_str(r#"{"action":"OPEN_POSITION","market":"SOL-PERP","direction":"short","size":"0.5"}"#)
        .unwrap();
    assert_eq!(
      cmd,
      Command::OpenPosition {
        market: "SOL-PERP".to_string(),
        direction: Side::Short,
        size: Decimal::new(5, 1),
      }
    );
    let start: Command = serde_json::from_str(r#"{"action":"START_ENGINE","mode":"paper"}"#).unwrap();
    assert_eq!(start, Command::StartEngine { mode: EngineMode::Paper });
  }

  #[test]
  fn error_code_wire_format() {
    assert_eq!(ErrorCode::HealthFloor.to_string(), "HEALTH_FLOOR");
    assert_eq!(ErrorCode::SimFailed.to_string(), "SIM_FAILED");
  }
}
