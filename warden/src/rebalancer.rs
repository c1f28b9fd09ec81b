use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use tokio::sync::broadcast;

use venue::gate::{GateVerdict, OpenCheck, SafetyGate};
use venue::risk;
use venue::types::{EngineEvent, Market, RebalanceAction, RebalanceEvent, RebalanceStatus, Side};
use venue::vault::EngineVault;
use venue::{fill_record, Driver, ExecOutcome};

use crate::config::RebalanceConfig;

/// The periodic delta controller. One tick reads one snapshot, decides, and
/// emits at most one order.
pub struct Rebalancer {
  cfg: RebalanceConfig,
  market: Market,
  last_rebalance: Option<DateTime<Utc>>,
}

impl Rebalancer {
  pub fn new(cfg: RebalanceConfig, market: Market, last_rebalance: Option<DateTime<Utc>>) -> Self {
    Self {
      cfg,
      market,
      last_rebalance,
    }
  }

  pub fn last_rebalance(&self) -> Option<DateTime<Utc>> {
    self.last_rebalance
  }

  fn event(
    &self,
    now: DateTime<Utc>,
    action: RebalanceAction,
    correction_size: Decimal,
    status: RebalanceStatus,
  ) -> RebalanceEvent {
    RebalanceEvent {
      timestamp: now,
      action,
      correction_size,
      status,
      tx_signature: None,
      error: None,
    }
  }

  fn emit(events: &broadcast::Sender<EngineEvent>, event: &RebalanceEvent) {
    let _ = events.send(EngineEvent::Rebalance(event.clone()));
  }

  pub async fn tick(
    &mut self,
    now: DateTime<Utc>,
    driver: &Driver,
    gate: &SafetyGate,
    vault: &mut EngineVault,
    events: &broadcast::Sender<EngineEvent>,
  ) -> RebalanceEvent {
    let snap = match driver.snapshot().await {
      Ok(snap) => snap,
      Err(e) => {
        log::warn!("tick skipped, snapshot unavailable: {:#}", e);
        let mut event = self.event(now, RebalanceAction::None, Decimal::ZERO, RebalanceStatus::Failed);
        event.error = Some(format!("snapshot unavailable: {:#}", e));
        Self::emit(events, &event);
        return event;
      }
    };

    let perp_base = snap
      .state
      .position(self.market.index)
      .map(|p| p.size)
      .unwrap_or(Decimal::ZERO);
    let reserved = self.cfg.reserved_gas_native;
    let net_delta = risk::net_delta(snap.spot_base, perp_base, reserved);
    let drift = risk::drift_pct(snap.spot_base, perp_base, reserved);

    // exactly at the tolerance boundary is not a signal
    if drift.abs() <= self.cfg.drift_tolerance_pct {
      return self.event(now, RebalanceAction::None, Decimal::ZERO, RebalanceStatus::None);
    }

    let correction = risk::correction(net_delta);

    // exactly at cooldown expiry is allowed
    if let Some(last) = self.last_rebalance {
      let elapsed = (now - last).num_seconds();
      if elapsed < self.cfg.cooldown_seconds {
        log::debug!(
          "drift {}% but cooling down ({}s of {}s)",
          drift,
          elapsed,
          self.cfg.cooldown_seconds
        );
        let event = self.event(now, correction.action, correction.size, RebalanceStatus::SkippedCooldown);
        Self::emit(events, &event);
        return event;
      }
    }

    // a correction tying the minimum size is allowed
    if correction.size < self.cfg.min_trade_size_base {
      let event = self.event(now, correction.action, correction.size, RebalanceStatus::SkippedMinSize);
      Self::emit(events, &event);
      return event;
    }

    let revenue =
      risk::haircut_funding_revenue(correction.size, snap.funding_rate_hourly.abs(), snap.mark.price);
    let cost = risk::estimated_cost(
      gate.config().tip_native,
      correction.size * snap.mark.price,
      snap.oracle.price,
    );
    log::info!(
      "profitability expected_revenue={} estimated_cost={} net_profit={}",
      revenue,
      cost,
      revenue - cost
    );

    let check = OpenCheck {
      state: &snap.state,
      size_base: correction.size,
      mark_price: snap.mark.price,
      funding_rate_hourly: snap.funding_rate_hourly,
      oracle_age_ms: snap.oracle.age_ms(now),
      native_balance: snap.native_balance,
      native_price_quote: snap.oracle.price,
    };
    if let GateVerdict::Block { reason, detail } = gate.check_open(&check) {
      log::warn!("rebalance blocked by safety gate: {} ({})", reason, detail);
      let event = self.event(
        now,
        correction.action,
        correction.size,
        RebalanceStatus::BlockedGate { reason },
      );
      Self::emit(events, &event);
      return event;
    }

    let side = match correction.action {
      RebalanceAction::ExpandShort => Side::Short,
      RebalanceAction::ReduceShort => Side::Long,
      RebalanceAction::None => {
        // unreachable: correction.size >= min_trade_size_base > 0
        return self.event(now, RebalanceAction::None, Decimal::ZERO, RebalanceStatus::None);
      }
    };

    let mut event = self.event(now, correction.action, correction.size, RebalanceStatus::Failed);
    match driver.open(self.market.index, side, correction.size).await {
      Ok(ExecOutcome::Confirmed { signature }) => {
        self.last_rebalance = Some(now);
        if let Err(e) = vault.set_last_rebalance(now) {
          log::error!("failed to persist last_rebalance: {:#}", e);
        }
        log::info!(
          "trade timestamp={} market={} side={} size={} price={} tx_signature={}",
          now,
          self.market.symbol,
          side,
          correction.size,
          snap.mark.price,
          signature
        );
        if let Err(e) =
          vault.record_trade(fill_record(&self.market, side, correction.size, snap.mark.price, signature))
        {
          log::error!("failed to record trade: {:#}", e);
        }
        if let Err(e) = vault.sync_from_snapshot(|| driver.snapshot()).await {
          log::error!("vault desync after retries, trading disabled: {:#}", e);
          let _ = events.send(EngineEvent::VaultSyncFailed {
            engine_id: vault.state().engine_id.clone(),
          });
        }
        event.status = RebalanceStatus::Executed;
        event.tx_signature = Some(signature.to_string());
      }
      Ok(ExecOutcome::Unknown { signature }) => {
        // do not touch last_rebalance; the operator must verify externally
        log::error!(
          "rebalance outcome unknown, verify signature externally: {}",
          signature
        );
        event.status = RebalanceStatus::Unknown;
        event.tx_signature = Some(signature.to_string());
      }
      Ok(outcome) => {
        log::warn!("rebalance did not execute: {}", outcome);
        event.status = RebalanceStatus::Failed;
        event.error = Some(outcome.to_string());
      }
      Err(e) => {
        log::warn!("rebalance errored: {:#}", e);
        event.status = RebalanceStatus::Failed;
        event.error = Some(format!("{:#}", e));
      }
    }
    Self::emit(events, &event);
    event
  }
}

#[cfg(test)]
mod tests {
  use chrono::Duration as ChronoDuration;

  use venue::codec::{PerpPositionRaw, SpotPositionRaw};
  use venue::constants::QUOTE_SPOT_MARKET_INDEX;
  use venue::types::{EngineMode, PERP_MARKETS};
  use venue::vault::VaultKind;
  use venue::VirtualVenue;

  use super::*;

  struct Rig {
    driver: Driver,
    gate: SafetyGate,
    vault: EngineVault,
    events: broadcast::Sender<EngineEvent>,
    _dir: tempfile::TempDir,
  }

  /// 5000 USDC of venue collateral, wallet spot seeded per test, healthy
  /// funding so the fee guard clears.
  async fn rig(spot_base: Decimal, perp_base: Decimal) -> Rig {
    let cfg = RebalanceConfig::default();
    let market = PERP_MARKETS[0].clone();
    let venue = VirtualVenue::new(market.clone(), cfg.driver_config()).unwrap();
    venue.set_mark(0, Decimal::new(150, 0)).await;
    venue.set_funding_rate_hourly(Decimal::new(1, 2)).await;
    venue.set_native_balance(Decimal::new(1, 0)).await;
    venue.set_wallet_spot_base(spot_base).await;
    venue
      .with_user(|user| {
        user.spot_positions[0] = SpotPositionRaw {
          scaled_balance: 5_000_000_000,
          cumulative_deposits: 5_000_000_000,
          market_index: QUOTE_SPOT_MARKET_INDEX,
          ..Default::default()
        };
        if !perp_base.is_zero() {
          let raw = venue::codec::decimal_to_raw(perp_base, 9).unwrap() as i64;
          let entry = venue::codec::decimal_to_raw(perp_base.abs() * Decimal::new(150, 0), 6).unwrap() as i64;
          user.perp_positions[0] = PerpPositionRaw {
            base_asset_amount: raw,
            quote_asset_amount: entry,
            quote_entry_amount: entry,
            market_index: 0,
            ..Default::default()
          };
        }
      })
      .await
      .unwrap();

    let dir = tempfile::tempdir().unwrap();
    let vault = EngineVault::load(dir.path(), "alpha", VaultKind::Virtual, EngineMode::Paper, "SOL").unwrap();
    let (events, _) = broadcast::channel(64);
    Rig {
      driver: Driver::Virtual(venue),
      gate: SafetyGate::new(cfg.gate_config()),
      vault,
      events,
      _dir: dir,
    }
  }

  fn rebalancer(last: Option<DateTime<Utc>>) -> Rebalancer {
    // reserved gas must not distort the clean scenarios
    let cfg = RebalanceConfig {
      reserved_gas_native: Decimal::ZERO,
      ..RebalanceConfig::default()
    };
    Rebalancer::new(cfg, PERP_MARKETS[0].clone(), last)
  }

  fn tx_count(rig: &Rig) -> usize {
    rig.driver.as_virtual().unwrap().tx_count()
  }

  #[tokio::test]
  async fn clean_hedge_does_nothing() {
    // S1: spot 10, perp -10
    let mut rig = rig(Decimal::new(10, 0), Decimal::new(-10, 0)).await;
    let mut r = rebalancer(None);
    let event = r
      .tick(Utc::now(), &rig.driver, &rig.gate, &mut rig.vault, &rig.events)
      .await;
    assert_eq!(event.action, RebalanceAction::None);
    assert_eq!(event.status, RebalanceStatus::None);
    assert_eq!(tx_count(&rig), 0);
    assert!(r.last_rebalance().is_none());

    let snap = rig.driver.snapshot().await.unwrap();
    assert_eq!(snap.state.leverage, Decimal::new(3, 1));
  }

  #[tokio::test]
  async fn positive_drift_expands_the_short() {
    // S2: spot 10, perp -9.5 => drift 5%, correction 0.5
    let mut rig = rig(Decimal::new(10, 0), Decimal::new(-95, 1)).await;
    let mut r = rebalancer(None);
    let now = Utc::now();
    let event = r.tick(now, &rig.driver, &rig.gate, &mut rig.vault, &rig.events).await;

    assert_eq!(event.action, RebalanceAction::ExpandShort);
    assert_eq!(event.correction_size, Decimal::new(5, 1));
    assert_eq!(event.status, RebalanceStatus::Executed);
    assert!(event.tx_signature.is_some());
    assert_eq!(r.last_rebalance(), Some(now));
    assert_eq!(rig.vault.last_rebalance(), Some(now));
    assert_eq!(rig.vault.trades().len(), 1);
    assert_eq!(tx_count(&rig), 1);

    // the short leg now covers the spot
    let snap = rig.driver.snapshot().await.unwrap();
    assert_eq!(snap.state.position(0).unwrap().size, Decimal::new(-10, 0));
  }

  #[tokio::test]
  async fn cooldown_swallows_the_signal() {
    // S3: drift -5% ten minutes after the previous rebalance
    let mut rig = rig(Decimal::new(10, 0), Decimal::new(-105, 1)).await;
    let now = Utc::now();
    let mut r = rebalancer(Some(now - ChronoDuration::seconds(600)));
    let event = r.tick(now, &rig.driver, &rig.gate, &mut rig.vault, &rig.events).await;

    assert_eq!(event.status, RebalanceStatus::SkippedCooldown);
    assert_eq!(event.action, RebalanceAction::ReduceShort);
    assert_eq!(tx_count(&rig), 0);
    assert_eq!(r.last_rebalance(), Some(now - ChronoDuration::seconds(600)));
  }

  #[tokio::test]
  async fn dust_correction_is_filtered() {
    // S5: spot 10, perp -9.997 => correction 0.003 < 0.005
    let mut rig = rig(Decimal::new(10, 0), Decimal::new(-9_997, 3)).await;
    let mut r = rebalancer(None);
    let event = r
      .tick(Utc::now(), &rig.driver, &rig.gate, &mut rig.vault, &rig.events)
      .await;
    assert_eq!(event.status, RebalanceStatus::SkippedMinSize);
    assert_eq!(event.correction_size, Decimal::new(3, 3));
    assert_eq!(tx_count(&rig), 0);
  }

  #[tokio::test]
  async fn drift_exactly_at_tolerance_does_not_trigger() {
    // drift == 1.0% on the nose
    let mut rig = rig(Decimal::new(10, 0), Decimal::new(-99, 1)).await;
    let mut r = rebalancer(None);
    let event = r
      .tick(Utc::now(), &rig.driver, &rig.gate, &mut rig.vault, &rig.events)
      .await;
    assert_eq!(event.status, RebalanceStatus::None);
    assert_eq!(tx_count(&rig), 0);
  }

  #[tokio::test]
  async fn cooldown_expiry_boundary_allows_the_trade() {
    let mut rig = rig(Decimal::new(10, 0), Decimal::new(-95, 1)).await;
    let now = Utc::now();
    let mut r = rebalancer(Some(now - ChronoDuration::seconds(1_800)));
    let event = r.tick(now, &rig.driver, &rig.gate, &mut rig.vault, &rig.events).await;
    assert_eq!(event.status, RebalanceStatus::Executed);
    assert_eq!(tx_count(&rig), 1);
  }

  #[tokio::test]
  async fn correction_tying_min_size_trades() {
    // correction exactly 0.005; funding rich enough that the fee guard
    // clears even at dust-adjacent notional
    let mut rig = rig(Decimal::new(10, 0), Decimal::new(-9_995, 3)).await;
    rig
      .driver
      .as_virtual()
      .unwrap()
      .set_funding_rate_hourly(Decimal::new(2, 1))
      .await;
    let mut r = rebalancer(None);
    let event = r
      .tick(Utc::now(), &rig.driver, &rig.gate, &mut rig.vault, &rig.events)
      .await;
    assert_eq!(event.status, RebalanceStatus::Executed);
    assert_eq!(event.correction_size, Decimal::new(5, 3));
  }

  #[tokio::test]
  async fn gate_block_leaves_cooldown_untouched() {
    let mut rig = rig(Decimal::new(10, 0), Decimal::new(-95, 1)).await;
    rig.driver.as_virtual().unwrap().set_oracle_age_ms(500).await;
    let mut r = rebalancer(None);
    let event = r
      .tick(Utc::now(), &rig.driver, &rig.gate, &mut rig.vault, &rig.events)
      .await;
    match event.status {
      RebalanceStatus::BlockedGate { reason } => {
        assert_eq!(reason, venue::gate::BlockReason::StaleOracle)
      }
      other => panic!("expected gate block, got {:?}", other),
    }
    assert_eq!(tx_count(&rig), 0);
    assert!(r.last_rebalance().is_none());
  }

  #[tokio::test]
  async fn failed_execution_keeps_last_rebalance() {
    let mut rig = rig(Decimal::new(10, 0), Decimal::new(-95, 1)).await;
    rig.driver.as_virtual().unwrap().set_fail_sends(true);
    let mut r = rebalancer(None);
    let event = r
      .tick(Utc::now(), &rig.driver, &rig.gate, &mut rig.vault, &rig.events)
      .await;
    assert_eq!(event.status, RebalanceStatus::Failed);
    assert!(event.error.is_some());
    assert!(r.last_rebalance().is_none());
    assert!(rig.vault.last_rebalance().is_none());
  }

  #[tokio::test]
  async fn unknown_execution_keeps_last_rebalance_and_surfaces_the_signature() {
    let mut rig = rig(Decimal::new(10, 0), Decimal::new(-95, 1)).await;
    rig.driver.as_virtual().unwrap().set_hang_confirms(true);
    let mut r = rebalancer(None);
    let event = r
      .tick(Utc::now(), &rig.driver, &rig.gate, &mut rig.vault, &rig.events)
      .await;
    assert_eq!(event.status, RebalanceStatus::Unknown);
    assert!(event.tx_signature.is_some());
    assert!(r.last_rebalance().is_none());
  }

  #[tokio::test(start_paused = true)]
  async fn vault_desync_after_confirm_disables_trading() {
    // S6: the open confirms, then every snapshot fetch fails; the sync
    // exhausts its three attempts and latches trading off
    let mut rig = rig(Decimal::new(10, 0), Decimal::new(-95, 1)).await;
    let mut events_rx = rig.events.subscribe();
    // call 1 is the tick's own read; calls 2..4 are the sync retries
    rig.driver.as_virtual().unwrap().set_fail_snapshots_from(2);

    let mut r = rebalancer(None);
    let event = r
      .tick(Utc::now(), &rig.driver, &rig.gate, &mut rig.vault, &rig.events)
      .await;

    assert_eq!(event.status, RebalanceStatus::Executed);
    assert!(!rig.vault.state().sync_ok);
    assert!(rig.vault.trading_disabled());

    let mut saw_sync_failed = false;
    while let Ok(e) = events_rx.try_recv() {
      if matches!(e, EngineEvent::VaultSyncFailed { .. }) {
        saw_sync_failed = true;
      }
    }
    assert!(saw_sync_failed);
  }
}
