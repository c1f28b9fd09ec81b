use std::path::{Path, PathBuf};
use std::str::FromStr;

use rust_decimal::Decimal;
use serde::Deserialize;
use solana_sdk::signature::Keypair;

use venue::constants::DEFAULT_ORACLE_STALE_MS;
use venue::gate::GateConfig;
use venue::read_keypair_from_env;
use venue::types::{perp_market_by_symbol, EngineMode, Market};
use venue::DriverConfig;

#[derive(Debug, thiserror::Error)]
#[error("config: {0}")]
pub struct ConfigError(pub String);

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct RebalanceConfig {
  /// Rebalance signal fires when |drift| exceeds this, in percent.
  #[serde(default = "defaults::drift_tolerance_pct")]
  pub drift_tolerance_pct: Decimal,
  #[serde(default = "defaults::cooldown_seconds")]
  pub cooldown_seconds: i64,
  #[serde(default = "defaults::min_trade_size_base")]
  pub min_trade_size_base: Decimal,
  #[serde(default = "defaults::max_leverage")]
  pub max_leverage: Decimal,
  #[serde(default = "defaults::min_health_after_withdrawal")]
  pub min_health_after_withdrawal: Decimal,
  #[serde(default = "defaults::loop_interval_seconds")]
  pub loop_interval_seconds: u64,
  /// Native tokens held back from every spendable-balance computation.
  #[serde(default = "defaults::reserved_gas_native")]
  pub reserved_gas_native: Decimal,
  #[serde(default = "defaults::health_warn_threshold")]
  pub health_warn_threshold: Decimal,
  #[serde(default = "defaults::health_critical_threshold")]
  pub health_critical_threshold: Decimal,
  #[serde(default = "defaults::health_warn_cooldown_seconds")]
  pub health_warn_cooldown_seconds: i64,
  #[serde(default = "defaults::oracle_stale_ms")]
  pub oracle_stale_ms: i64,
  #[serde(default = "defaults::tip_native")]
  pub tip_native: Decimal,
}

mod defaults {
  use rust_decimal::Decimal;

  pub fn drift_tolerance_pct() -> Decimal {
    Decimal::ONE
  }
  pub fn cooldown_seconds() -> i64 {
    1_800
  }
  pub fn min_trade_size_base() -> Decimal {
    Decimal::new(5, 3)
  }
  pub fn max_leverage() -> Decimal {
    Decimal::new(5, 0)
  }
  pub fn min_health_after_withdrawal() -> Decimal {
    Decimal::new(80, 0)
  }
  pub fn loop_interval_seconds() -> u64 {
    60
  }
  pub fn reserved_gas_native() -> Decimal {
    Decimal::new(17, 3)
  }
  pub fn health_warn_threshold() -> Decimal {
    Decimal::new(50, 0)
  }
  pub fn health_critical_threshold() -> Decimal {
    Decimal::new(20, 0)
  }
  pub fn health_warn_cooldown_seconds() -> i64 {
    60
  }
  pub fn oracle_stale_ms() -> i64 {
    super::DEFAULT_ORACLE_STALE_MS
  }
  pub fn tip_native() -> Decimal {
    Decimal::new(1, 4)
  }
}

impl Default for RebalanceConfig {
  fn default() -> Self {
    Self {
      drift_tolerance_pct: defaults::drift_tolerance_pct(),
      cooldown_seconds: defaults::cooldown_seconds(),
      min_trade_size_base: defaults::min_trade_size_base(),
      max_leverage: defaults::max_leverage(),
      min_health_after_withdrawal: defaults::min_health_after_withdrawal(),
      loop_interval_seconds: defaults::loop_interval_seconds(),
      reserved_gas_native: defaults::reserved_gas_native(),
      health_warn_threshold: defaults::health_warn_threshold(),
      health_critical_threshold: defaults::health_critical_threshold(),
      health_warn_cooldown_seconds: defaults::health_warn_cooldown_seconds(),
      oracle_stale_ms: defaults::oracle_stale_ms(),
      tip_native: defaults::tip_native(),
    }
  }
}

impl RebalanceConfig {
  pub fn gate_config(&self) -> GateConfig {
    GateConfig {
      max_leverage: self.max_leverage,
      min_health_after_withdrawal: self.min_health_after_withdrawal,
      min_trade_size_base: self.min_trade_size_base,
      reserved_gas_native: self.reserved_gas_native,
      oracle_stale_ms: self.oracle_stale_ms,
      tip_native: self.tip_native,
    }
  }

  pub fn driver_config(&self) -> DriverConfig {
    DriverConfig {
      reserved_gas_native: self.reserved_gas_native,
      min_health_after_withdrawal: self.min_health_after_withdrawal,
      oracle_stale_ms: self.oracle_stale_ms,
    }
  }
}

/// Seed balances for the in-memory venue when running in paper mode.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct PaperConfig {
  #[serde(default = "paper_defaults::mark_price")]
  pub mark_price: Decimal,
  #[serde(default = "paper_defaults::funding_rate_hourly")]
  pub funding_rate_hourly: Decimal,
  #[serde(default = "paper_defaults::native_balance")]
  pub native_balance: Decimal,
  #[serde(default)]
  pub spot_base: Decimal,
  #[serde(default)]
  pub quote_collateral: Decimal,
}

mod paper_defaults {
  use rust_decimal::Decimal;

  pub fn mark_price() -> Decimal {
    Decimal::new(150, 0)
  }
  pub fn funding_rate_hourly() -> Decimal {
    Decimal::new(1, 2)
  }
  pub fn native_balance() -> Decimal {
    Decimal::ONE
  }
}

impl Default for PaperConfig {
  fn default() -> Self {
    Self {
      mark_price: paper_defaults::mark_price(),
      funding_rate_hourly: paper_defaults::funding_rate_hourly(),
      native_balance: paper_defaults::native_balance(),
      spot_base: Decimal::ZERO,
      quote_collateral: Decimal::ZERO,
    }
  }
}

#[derive(Debug, Deserialize)]
struct YamlConfig {
  engine_id: String,
  mode: EngineMode,
  #[serde(default = "default_hedge_market")]
  hedge_market: String,
  #[serde(default)]
  sub_account_id: u16,
  #[serde(default = "default_vault_dir")]
  vault_dir: PathBuf,
  #[serde(default)]
  rebalance: RebalanceConfig,
  #[serde(default)]
  paper: PaperConfig,
}

fn default_hedge_market() -> String {
  "SOL-PERP".to_string()
}

fn default_vault_dir() -> PathBuf {
  PathBuf::from("vaults")
}

#[derive(Debug)]
pub struct WardenConfig {
  pub engine_id: String,
  pub mode: EngineMode,
  pub hedge_market: Market,
  pub sub_account_id: u16,
  pub vault_dir: PathBuf,
  pub rpc_url: String,
  pub wss_url: String,
  /// Present in live mode only; paper mode never touches key material.
  pub signer: Option<Keypair>,
  pub rebalance: RebalanceConfig,
  pub paper: PaperConfig,
}

impl WardenConfig {
  pub fn read(path: Option<&Path>) -> anyhow::Result<Self> {
    let path = match path {
      Some(p) => p.to_path_buf(),
      None => {
        let dir = env!("CARGO_MANIFEST_DIR").to_string();
        PathBuf::from_str(&format!("{}/config.yaml", dir))?
      }
    };
    let contents = std::fs::read_to_string(&path)
      .map_err(|e| ConfigError(format!("read {}: {}", path.display(), e)))?;
    Self::parse(&contents)
  }

  pub fn parse(contents: &str) -> anyhow::Result<Self> {
    let yaml: YamlConfig =
      serde_yaml::from_str(contents).map_err(|e| ConfigError(e.to_string()))?;

    let hedge_market = perp_market_by_symbol(&yaml.hedge_market)
      .ok_or_else(|| ConfigError(format!("unknown hedge market {}", yaml.hedge_market)))?
      .clone();

    let (rpc_url, wss_url, signer) = match yaml.mode {
      EngineMode::Live => {
        let rpc_url =
          std::env::var("RPC_URL").map_err(|_| ConfigError("RPC_URL not set".to_string()))?;
        let wss_url =
          std::env::var("WSS_URL").map_err(|_| ConfigError("WSS_URL not set".to_string()))?;
        let signer = read_keypair_from_env("SIGNER")
          .map_err(|e| ConfigError(format!("SIGNER keypair: {}", e)))?;
        (rpc_url, wss_url, Some(signer))
      }
      EngineMode::Paper => (
        std::env::var("RPC_URL").unwrap_or_else(|_| "http://localhost:8899".to_string()),
        std::env::var("WSS_URL").unwrap_or_else(|_| "ws://localhost:8900".to_string()),
        None,
      ),
    };

    Ok(Self {
      engine_id: yaml.engine_id,
      mode: yaml.mode,
      hedge_market,
      sub_account_id: yaml.sub_account_id,
      vault_dir: yaml.vault_dir,
      rpc_url,
      wss_url,
      signer,
      rebalance: yaml.rebalance,
      paper: yaml.paper,
    })
  }
}
