use std::collections::BTreeMap;
use std::future::Future;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use crate::retry::{retry, RetryPolicy};
use crate::snapshot::VenueSnapshot;
use crate::types::{EngineMode, Side};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum VaultKind {
  Virtual,
  OnChain,
}

/// Per-engine accounting of allocated capital, independent of the raw
/// on-chain balance so several engines can share one wallet without
/// double-counting.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VaultState {
  pub engine_id: String,
  pub kind: VaultKind,
  pub balances: BTreeMap<String, Decimal>,
  pub allocated_usd: Decimal,
  pub available_usd: Decimal,
  pub last_synced_at: Option<DateTime<Utc>>,
  pub sync_ok: bool,
}

impl VaultState {
  fn empty(engine_id: &str, kind: VaultKind) -> Self {
    Self {
      engine_id: engine_id.to_string(),
      kind,
      balances: BTreeMap::new(),
      allocated_usd: Decimal::ZERO,
      available_usd: Decimal::ZERO,
      last_synced_at: None,
      sync_ok: true,
    }
  }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TradeRecord {
  pub timestamp: DateTime<Utc>,
  pub market: String,
  pub side: Side,
  pub size: Decimal,
  pub price: Decimal,
  pub tx_signature: String,
}

/// One file per engine, replaced atomically on every mutation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VaultRecord {
  pub vault: VaultState,
  pub last_rebalance: Option<DateTime<Utc>>,
  pub engine_mode: EngineMode,
  pub safety_flag: bool,
  pub trades: Vec<TradeRecord>,
}

pub struct EngineVault {
  path: PathBuf,
  base_symbol: String,
  record: VaultRecord,
}

impl EngineVault {
  /// Loads the engine's vault, creating a default if absent. Vaults for
  /// distinct engine ids live in distinct files and never touch each other.
  pub fn load(
    dir: &Path,
    engine_id: &str,
    kind: VaultKind,
    mode: EngineMode,
    base_symbol: &str,
  ) -> anyhow::Result<Self> {
    std::fs::create_dir_all(dir)?;
    let path = dir.join(format!("{}.json", engine_id));
    let record = match std::fs::read_to_string(&path) {
      Ok(contents) => {
        let mut record: VaultRecord = serde_json::from_str(&contents)?;
        record.engine_mode = mode;
        record.vault.kind = kind;
        record
      }
      Err(e) if e.kind() == std::io::ErrorKind::NotFound => VaultRecord {
        vault: VaultState::empty(engine_id, kind),
        last_rebalance: None,
        engine_mode: mode,
        safety_flag: false,
        trades: vec![],
      },
      Err(e) => return Err(e.into()),
    };
    let vault = Self {
      path,
      base_symbol: base_symbol.to_string(),
      record,
    };
    vault.persist()?;
    Ok(vault)
  }

  pub fn state(&self) -> &VaultState {
    &self.record.vault
  }

  pub fn trades(&self) -> &[TradeRecord] {
    &self.record.trades
  }

  pub fn last_rebalance(&self) -> Option<DateTime<Utc>> {
    self.record.last_rebalance
  }

  pub fn safety_flag(&self) -> bool {
    self.record.safety_flag
  }

  /// Trading stops whenever the operator latched the safety flag or the
  /// vault lost reconciliation with the chain.
  pub fn trading_disabled(&self) -> bool {
    self.record.safety_flag || !self.record.vault.sync_ok
  }

  pub fn set_last_rebalance(&mut self, at: DateTime<Utc>) -> anyhow::Result<()> {
    self.record.last_rebalance = Some(at);
    self.persist()
  }

  pub fn set_safety_flag(&mut self, flag: bool) -> anyhow::Result<()> {
    self.record.safety_flag = flag;
    self.persist()
  }

  /// Idempotent by `(engine_id, tx_signature)`: replaying a confirmed trade
  /// does not double-book it. Returns false on the replay.
  pub fn record_trade(&mut self, trade: TradeRecord) -> anyhow::Result<bool> {
    if self
      .record
      .trades
      .iter()
      .any(|t| t.tx_signature == trade.tx_signature)
    {
      return Ok(false);
    }
    self.record.trades.push(trade);
    self.persist()?;
    Ok(true)
  }

  fn apply_snapshot(&mut self, snap: &VenueSnapshot) -> anyhow::Result<()> {
    let vault = &mut self.record.vault;
    vault.balances.insert("USDC".to_string(), snap.state.total_collateral);
    vault.balances.insert(self.base_symbol.clone(), snap.spot_base);
    vault.allocated_usd = snap.state.total_collateral + snap.spot_base * snap.mark.price;
    vault.available_usd = snap.state.free_collateral;
    vault.last_synced_at = Some(snap.state.timestamp);
    vault.sync_ok = true;
    self.persist()
  }

  fn mark_sync_failed(&mut self) -> anyhow::Result<()> {
    self.record.vault.sync_ok = false;
    self.persist()
  }

  /// Reconciles the vault against a fresh snapshot, retrying transient
  /// fetch failures (3 attempts, 1s/2s/4s). Exhaustion latches
  /// `sync_ok = false`; the caller must stop trading and emit
  /// `VAULT_SYNC_FAILED`.
  pub async fn sync_from_snapshot<F, Fut>(&mut self, fetch: F) -> anyhow::Result<()>
  where
    F: FnMut() -> Fut,
    Fut: Future<Output = anyhow::Result<VenueSnapshot>>,
  {
    match retry(&RetryPolicy::vault_sync(), "vault.sync_from_snapshot", fetch).await {
      Ok(snap) => self.apply_snapshot(&snap),
      Err(e) => {
        self.mark_sync_failed()?;
        Err(e)
      }
    }
  }

  /// Final write-out at shutdown.
  pub fn flush(&self) -> anyhow::Result<()> {
    self.persist()
  }

  /// Every mutation writes through before returning; readers always see the
  /// last committed state. Replacement is atomic via tmp-and-rename.
  fn persist(&self) -> anyhow::Result<()> {
    let tmp = self.path.with_extension("json.tmp");
    std::fs::write(&tmp, serde_json::to_string_pretty(&self.record)?)?;
    std::fs::rename(&tmp, &self.path)?;
    Ok(())
  }
}

#[cfg(test)]
mod tests {
  use chrono::Utc;

  use super::*;
  use crate::oracle::PriceUpdate;
  use crate::risk;
  use crate::types::AccountState;

  fn snapshot(total: Decimal, free: Decimal, spot_base: Decimal, mark: Decimal) -> VenueSnapshot {
    let now = Utc::now();
    VenueSnapshot {
      state: AccountState {
        timestamp: now,
        total_collateral: total,
        free_collateral: free,
        maintenance_margin: Decimal::ZERO,
        initial_margin: Decimal::ZERO,
        leverage: Decimal::ZERO,
        health_ratio: risk::health_ratio(total, Decimal::ZERO),
        positions: vec![],
        unrealized_pnl: Decimal::ZERO,
      },
      spot_base,
      native_balance: spot_base,
      mark: PriceUpdate::new(mark, now),
      oracle: PriceUpdate::new(mark, now),
      funding_rate_hourly: Decimal::ZERO,
    }
  }

  fn trade(sig: &str) -> TradeRecord {
    TradeRecord {
      timestamp: Utc::now(),
      market: "SOL-PERP".to_string(),
      side: Side::Short,
      size: Decimal::new(5, 1),
      price: Decimal::new(150, 0),
      tx_signature: sig.to_string(),
    }
  }

  fn load(dir: &Path, id: &str) -> EngineVault {
    EngineVault::load(dir, id, VaultKind::Virtual, EngineMode::Paper, "SOL").unwrap()
  }

  #[test]
  fn creates_default_and_survives_reload() {
    let dir = tempfile::tempdir().unwrap();
    {
      let mut vault = load(dir.path(), "alpha");
      assert!(vault.state().sync_ok);
      assert!(vault.record_trade(trade("sig-1")).unwrap());
      vault.set_last_rebalance(Utc::now()).unwrap();
    }
    let vault = load(dir.path(), "alpha");
    assert_eq!(vault.trades().len(), 1);
    assert!(vault.last_rebalance().is_some());
  }

  #[test]
  fn engines_never_share_a_vault() {
    let dir = tempfile::tempdir().unwrap();
    let mut alpha = load(dir.path(), "alpha");
    let beta_before = load(dir.path(), "beta").record.clone();

    alpha.record_trade(trade("sig-1")).unwrap();
    alpha.set_safety_flag(true).unwrap();
    alpha.set_last_rebalance(Utc::now()).unwrap();

    let beta_after = load(dir.path(), "beta");
    assert_eq!(beta_after.record, beta_before);
    assert!(beta_after.trades().is_empty());
    assert!(!beta_after.safety_flag());
  }

  #[test]
  fn trade_records_are_idempotent_by_signature() {
    let dir = tempfile::tempdir().unwrap();
    let mut vault = load(dir.path(), "alpha");
    assert!(vault.record_trade(trade("sig-1")).unwrap());
    assert!(!vault.record_trade(trade("sig-1")).unwrap());
    assert!(vault.record_trade(trade("sig-2")).unwrap());
    assert_eq!(vault.trades().len(), 2);
  }

  #[tokio::test]
  async fn successful_sync_updates_allocation() {
    let dir = tempfile::tempdir().unwrap();
    let mut vault = load(dir.path(), "alpha");
    let snap = snapshot(
      Decimal::new(5_000, 0),
      Decimal::new(4_850, 0),
      Decimal::new(10, 0),
      Decimal::new(150, 0),
    );
    vault
      .sync_from_snapshot(|| {
        let snap = snap.clone();
        async move { Ok(snap) }
      })
      .await
      .unwrap();
    assert!(vault.state().sync_ok);
    assert_eq!(vault.state().allocated_usd, Decimal::new(6_500, 0));
    assert_eq!(vault.state().available_usd, Decimal::new(4_850, 0));
    assert_eq!(vault.state().balances.get("SOL"), Some(&Decimal::new(10, 0)));
  }

  #[tokio::test(start_paused = true)]
  async fn exhausted_sync_latches_trading_off() {
    let dir = tempfile::tempdir().unwrap();
    let mut vault = load(dir.path(), "alpha");
    let mut attempts = 0u32;
    let res = vault
      .sync_from_snapshot(|| {
        attempts += 1;
        async { Err(anyhow::anyhow!("rpc timed out")) }
      })
      .await;
    assert!(res.is_err());
    assert_eq!(attempts, 3);
    assert!(!vault.state().sync_ok);
    assert!(vault.trading_disabled());

    // still latched after a reload
    drop(vault);
    let vault = load(dir.path(), "alpha");
    assert!(vault.trading_disabled());
  }
}
