use std::sync::atomic::{AtomicBool, AtomicUsize};
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use futures::StreamExt;
use rust_decimal::Decimal;
use solana_account_decoder::UiAccountEncoding;
use solana_client::nonblocking::pubsub_client::PubsubClient;
use solana_client::nonblocking::rpc_client::RpcClient;
use solana_client::rpc_config::RpcAccountInfoConfig;
use solana_sdk::account::Account;
use solana_sdk::commitment_config::CommitmentConfig;
use solana_sdk::pubkey::Pubkey;
use tokio::sync::{broadcast, mpsc, oneshot, watch, Mutex as TokioMutex, RwLock};
use tokio::time::MissedTickBehavior;

use venue::codec::decimal_to_raw;
use venue::constants::{QUOTE_DECIMALS, QUOTE_SPOT_MARKET_INDEX, RECONNECT_INTERVAL, SHUTDOWN_GRACE};
use venue::gate::SafetyGate;
use venue::retry::{retry, RetryPolicy};
use venue::risk;
use venue::snapshot::VenueSnapshot;
use venue::types::{Command, CommandResponse, EngineEvent, EngineMode, ErrorCode};
use venue::vault::{EngineVault, VaultKind};
use venue::{Driver, OnChainVenue, VenueClient, VirtualVenue};

use crate::config::{ConfigError, RebalanceConfig, WardenConfig};
use crate::rebalancer::Rebalancer;
use crate::router::{handle_command, CommandRequest, EngineStatus, RouterCtx};

#[derive(Debug, thiserror::Error)]
#[error("connection: {0}")]
pub struct ConnectError(pub String);

enum WatcherMsg {
  Connected,
  Account(Vec<u8>),
  Disconnected,
}

/// Health threshold watcher with one cooldown per severity.
struct HealthMonitor {
  warn_threshold: Decimal,
  critical_threshold: Decimal,
  cooldown_seconds: i64,
  last_warn: Option<DateTime<Utc>>,
  last_critical: Option<DateTime<Utc>>,
}

impl HealthMonitor {
  fn new(cfg: &RebalanceConfig) -> Self {
    Self {
      warn_threshold: cfg.health_warn_threshold,
      critical_threshold: cfg.health_critical_threshold,
      cooldown_seconds: cfg.health_warn_cooldown_seconds,
      last_warn: None,
      last_critical: None,
    }
  }

  fn due(last: Option<DateTime<Utc>>, now: DateTime<Utc>, cooldown_seconds: i64) -> bool {
    last.map_or(true, |t| (now - t).num_seconds() >= cooldown_seconds)
  }

  fn observe(&mut self, now: DateTime<Utc>, health: Decimal) -> Option<EngineEvent> {
    if health < self.critical_threshold {
      if Self::due(self.last_critical, now, self.cooldown_seconds) {
        self.last_critical = Some(now);
        return Some(EngineEvent::HealthCritical {
          health,
          threshold: self.critical_threshold,
        });
      }
      return None;
    }
    if health < self.warn_threshold {
      if Self::due(self.last_warn, now, self.cooldown_seconds) {
        self.last_warn = Some(now);
        return Some(EngineEvent::HealthWarn {
          health,
          threshold: self.warn_threshold,
        });
      }
    }
    None
  }
}

pub struct WardenHandle {
  commands: mpsc::Sender<CommandRequest>,
  events: broadcast::Sender<EngineEvent>,
  shutdown: watch::Sender<bool>,
  ctx: Arc<RouterCtx>,
}

impl WardenHandle {
  pub fn commands(&self) -> mpsc::Sender<CommandRequest> {
    self.commands.clone()
  }

  pub fn subscribe(&self) -> broadcast::Receiver<EngineEvent> {
    self.events.subscribe()
  }

  pub fn shutdown(&self) {
    let _ = self.shutdown.send(true);
  }

  pub fn is_critical(&self) -> bool {
    self.ctx.is_critical()
  }

  pub async fn send(&self, cmd: Command) -> CommandResponse {
    let action = cmd.action().to_string();
    let (tx, rx) = oneshot::channel();
    if self
      .commands
      .send(CommandRequest { cmd, respond: tx })
      .await
      .is_err()
    {
      return CommandResponse::err(&action, ErrorCode::NotRunning, "engine has shut down");
    }
    rx.await
      .unwrap_or_else(|_| CommandResponse::err(&action, ErrorCode::NotRunning, "engine has shut down"))
  }
}

/// Owns the tick loop, the command consumer, and the connection watcher.
pub struct Warden {
  ctx: Arc<RouterCtx>,
  rebalancer: Rebalancer,
  health: HealthMonitor,
  engine_id: String,
  reserved_gas_native: Decimal,
  hedge_index: u16,
  loop_interval: Duration,
  cmd_rx: mpsc::Receiver<CommandRequest>,
  watcher_rx: Option<mpsc::Receiver<WatcherMsg>>,
  shutdown_rx: watch::Receiver<bool>,
}

impl Warden {
  pub async fn init(mut cfg: WardenConfig) -> anyhow::Result<(Warden, WardenHandle)> {
    let market = cfg.hedge_market.clone();

    let (driver, status, watcher_rx, vault_kind) = match cfg.mode {
      EngineMode::Paper => {
        let venue = VirtualVenue::new(market.clone(), cfg.rebalance.driver_config())?;
        venue.set_mark(market.index, cfg.paper.mark_price).await;
        venue
          .set_funding_rate_hourly(cfg.paper.funding_rate_hourly)
          .await;
        venue.set_native_balance(cfg.paper.native_balance).await;
        venue.set_wallet_spot_base(cfg.paper.spot_base).await;
        if cfg.paper.quote_collateral > Decimal::ZERO {
          let raw = decimal_to_raw(cfg.paper.quote_collateral, QUOTE_DECIMALS)? as u64;
          venue
            .with_user(|user| {
              user.spot_positions[0].market_index = QUOTE_SPOT_MARKET_INDEX;
              user.spot_positions[0].scaled_balance = raw;
              user.spot_positions[0].cumulative_deposits = raw as i64;
            })
            .await?;
        }
        (Driver::Virtual(venue), EngineStatus::Running, None, VaultKind::Virtual)
      }
      EngineMode::Live => {
        let signer = cfg
          .signer
          .take()
          .ok_or_else(|| ConfigError("live mode requires a signer".to_string()))?;
        let rpc = Arc::new(RpcClient::new_with_timeout(
          cfg.rpc_url.clone(),
          Duration::from_secs(30),
        ));
        let client = VenueClient::new(Arc::new(signer), rpc, cfg.sub_account_id);
        let sub_account = client.sub_account;

        // bounded-retry probe; a venue that never answers is exit code 2
        let probe = retry(&RetryPolicy::subscription(), "venue.connect", || {
          client.user_account_raw()
        })
        .await
        .map_err(|e| ConnectError(format!("{:#}", e)))?;
        let status = if probe.is_none() {
          log::warn!("venue account {} does not exist; trade commands rejected", sub_account);
          EngineStatus::NotInitialized
        } else {
          EngineStatus::Running
        };

        let (tx, rx) = mpsc::channel(64);
        tokio::spawn(account_watcher(cfg.wss_url.clone(), sub_account, tx));

        let venue = OnChainVenue::new(client, market.clone(), cfg.rebalance.driver_config());
        (Driver::OnChain(venue), status, Some(rx), VaultKind::OnChain)
      }
    };

    let vault = EngineVault::load(
      &cfg.vault_dir,
      &cfg.engine_id,
      vault_kind,
      cfg.mode,
      market.symbol.split('-').next().unwrap_or(market.symbol),
    )?;
    let rebalancer = Rebalancer::new(cfg.rebalance.clone(), market.clone(), vault.last_rebalance());

    let (events, _) = broadcast::channel(256);
    let (cmd_tx, cmd_rx) = mpsc::channel(64);
    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let ctx = Arc::new(RouterCtx {
      driver: Arc::new(driver),
      gate: Arc::new(SafetyGate::new(cfg.rebalance.gate_config())),
      vault: Arc::new(TokioMutex::new(vault)),
      events: events.clone(),
      status: Arc::new(RwLock::new(status)),
      mode: cfg.mode,
      min_trade_size_base: cfg.rebalance.min_trade_size_base,
      in_flight: AtomicUsize::new(0),
      critical: AtomicBool::new(false),
    });

    log::info!(
      "warden engine={} mode={} market={} status={:?}",
      cfg.engine_id,
      cfg.mode,
      market.symbol,
      status
    );

    let warden = Warden {
      ctx: ctx.clone(),
      rebalancer,
      health: HealthMonitor::new(&cfg.rebalance),
      engine_id: cfg.engine_id.clone(),
      reserved_gas_native: cfg.rebalance.reserved_gas_native,
      hedge_index: market.index,
      loop_interval: Duration::from_secs(cfg.rebalance.loop_interval_seconds),
      cmd_rx,
      watcher_rx,
      shutdown_rx,
    };
    let handle = WardenHandle {
      commands: cmd_tx,
      events,
      shutdown: shutdown_tx,
      ctx,
    };
    Ok((warden, handle))
  }

  fn emit_state(&mut self, snap: &VenueSnapshot) {
    let now = snap.state.timestamp;
    let perp_base = snap
      .state
      .position(self.hedge_index)
      .map(|p| p.size)
      .unwrap_or(Decimal::ZERO);
    let net_delta = risk::net_delta(snap.spot_base, perp_base, self.reserved_gas_native);
    let drift_pct = risk::drift_pct(snap.spot_base, perp_base, self.reserved_gas_native);

    log::info!(
      "state health_ratio={} leverage={} total_collateral={} free_collateral={}",
      snap.state.health_ratio,
      snap.state.leverage,
      snap.state.total_collateral,
      snap.state.free_collateral
    );
    let _ = self.ctx.events.send(EngineEvent::StateUpdate {
      state: snap.state.clone(),
      net_delta,
      drift_pct,
      timestamp: now,
    });

    match self.health.observe(Utc::now(), snap.state.health_ratio) {
      Some(event @ EngineEvent::HealthCritical { .. }) => {
        log::error!("health critical: {}", snap.state.health_ratio);
        let _ = self.ctx.events.send(event);
      }
      Some(event) => {
        log::warn!("health low: {}", snap.state.health_ratio);
        let _ = self.ctx.events.send(event);
      }
      None => {}
    }
  }

  async fn on_tick(&mut self) {
    if *self.ctx.status.read().await != EngineStatus::Running {
      return;
    }
    if self.ctx.vault.lock().await.trading_disabled() {
      log::debug!("tick skipped: trading disabled for engine {}", self.engine_id);
      return;
    }

    let driver = self.ctx.driver.clone();
    let gate = self.ctx.gate.clone();
    let events = self.ctx.events.clone();
    {
      let mut vault = self.ctx.vault.lock().await;
      self
        .rebalancer
        .tick(Utc::now(), &driver, &gate, &mut vault, &events)
        .await;
    }

    // snapshot emission after the tick keeps paper mode observable without
    // an account subscription
    match self.ctx.driver.snapshot().await {
      Ok(snap) => self.emit_state(&snap),
      Err(e) => log::warn!("post-tick snapshot unavailable: {:#}", e),
    }
  }

  async fn on_watcher(&mut self, msg: WatcherMsg) {
    match msg {
      WatcherMsg::Connected => {
        let mut status = self.ctx.status.write().await;
        if *status == EngineStatus::Reconnecting {
          *status = EngineStatus::Running;
          drop(status);
          log::info!("subscription re-established, resyncing snapshot");
          if let Ok(snap) = self.ctx.driver.snapshot().await {
            self.emit_state(&snap);
          }
        }
      }
      WatcherMsg::Disconnected => {
        let mut status = self.ctx.status.write().await;
        if *status == EngineStatus::Running {
          *status = EngineStatus::Reconnecting;
          log::warn!("account subscription dropped; trade commands blocked while reconnecting");
        }
      }
      WatcherMsg::Account(bytes) => {
        {
          let mut status = self.ctx.status.write().await;
          if *status == EngineStatus::NotInitialized {
            *status = EngineStatus::Running;
          }
        }
        if let Driver::OnChain(venue) = self.ctx.driver.as_ref() {
          match venue.snapshot_from_bytes(&bytes).await {
            Ok(snap) => self.emit_state(&snap),
            Err(e) => log::warn!("pushed account update did not decode: {:#}", e),
          }
        }
      }
    }
  }

  pub async fn run(mut self) -> anyhow::Result<()> {
    let mut interval = tokio::time::interval(self.loop_interval);
    interval.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
      tokio::select! {
        biased;
        changed = self.shutdown_rx.changed() => {
          if changed.is_err() || *self.shutdown_rx.borrow() {
            break;
          }
        }
        // commands drain FIFO ahead of the tick
        Some(req) = self.cmd_rx.recv() => {
          let resp = handle_command(self.ctx.clone(), req.cmd).await;
          let _ = req.respond.send(resp);
        }
        Some(msg) = recv_watcher(&mut self.watcher_rx) => {
          self.on_watcher(msg).await;
        }
        _ = interval.tick() => {
          self.on_tick().await;
        }
      }
    }

    self.shutdown().await
  }

  /// Waits for in-flight transactions to reach a terminal or UNKNOWN state
  /// (bounded), flushes the vault, and drops connections and the signer
  /// handle with the driver.
  async fn shutdown(self) -> anyhow::Result<()> {
    log::info!("shutting down engine {}", self.engine_id);
    let deadline = Instant::now() + SHUTDOWN_GRACE;
    while self.ctx.commands_in_flight() > 0 && Instant::now() < deadline {
      tokio::time::sleep(Duration::from_millis(100)).await;
    }
    if self.ctx.commands_in_flight() > 0 {
      log::error!(
        "{} command(s) still unresolved at shutdown; outcomes recorded as unknown",
        self.ctx.commands_in_flight()
      );
    }
    self.ctx.vault.lock().await.flush()?;
    Ok(())
  }
}

async fn recv_watcher(rx: &mut Option<mpsc::Receiver<WatcherMsg>>) -> Option<WatcherMsg> {
  match rx {
    Some(rx) => rx.recv().await,
    None => std::future::pending().await,
  }
}

/// Owns the websocket subscription for the user account. Reconnects every
/// ten seconds until the supervisor goes away.
async fn account_watcher(wss_url: String, key: Pubkey, tx: mpsc::Sender<WatcherMsg>) {
  loop {
    match PubsubClient::new(&wss_url).await {
      Ok(client) => {
        let config = RpcAccountInfoConfig {
          encoding: Some(UiAccountEncoding::Base64),
          commitment: Some(CommitmentConfig::confirmed()),
          ..Default::default()
        };
        match client.account_subscribe(&key, Some(config)).await {
          Ok((mut stream, _unsubscribe)) => {
            if tx.send(WatcherMsg::Connected).await.is_err() {
              return;
            }
            while let Some(update) = stream.next().await {
              match update.value.decode::<Account>() {
                Some(account) => {
                  if tx.send(WatcherMsg::Account(account.data)).await.is_err() {
                    return;
                  }
                }
                None => log::warn!("account update with undecodable payload"),
              }
            }
          }
          Err(e) => log::warn!("account subscribe failed: {:#}", e),
        }
      }
      Err(e) => log::warn!("websocket connect failed: {:#}", e),
    }
    if tx.send(WatcherMsg::Disconnected).await.is_err() {
      return;
    }
    tokio::time::sleep(RECONNECT_INTERVAL).await;
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  fn monitor() -> HealthMonitor {
    HealthMonitor::new(&RebalanceConfig::default())
  }

  #[test]
  fn health_monitor_emits_per_severity_with_cooldown() {
    let mut m = monitor();
    let t0 = Utc::now();

    // healthy: nothing
    assert!(m.observe(t0, Decimal::new(90, 0)).is_none());

    // below warn
    assert!(matches!(
      m.observe(t0, Decimal::new(40, 0)),
      Some(EngineEvent::HealthWarn { .. })
    ));
    // suppressed within the cooldown
    assert!(m
      .observe(t0 + chrono::Duration::seconds(30), Decimal::new(40, 0))
      .is_none());
    // re-emitted at the cooldown boundary
    assert!(matches!(
      m.observe(t0 + chrono::Duration::seconds(60), Decimal::new(40, 0)),
      Some(EngineEvent::HealthWarn { .. })
    ));

    // critical severity has its own cooldown clock
    assert!(matches!(
      m.observe(t0 + chrono::Duration::seconds(61), Decimal::new(10, 0)),
      Some(EngineEvent::HealthCritical { .. })
    ));
    assert!(m
      .observe(t0 + chrono::Duration::seconds(90), Decimal::new(10, 0))
      .is_none());
  }

  #[tokio::test(start_paused = true)]
  async fn paper_engine_ticks_commands_and_events_end_to_end() {
    let mut cfg = WardenConfig::parse(concat!(
      "engine_id: itest\n",
      "mode: paper\n",
      "paper:\n",
      "  quote_collateral: 5000\n",
      "  spot_base: 10\n",
    ))
    .unwrap();
    // point the vault at a scratch dir
    let dir = tempfile::tempdir().unwrap();
    cfg.vault_dir = dir.path().to_path_buf();

    let (warden, handle) = Warden::init(cfg).await.unwrap();
    let mut events = handle.subscribe();
    let runner = tokio::spawn(warden.run());

    let resp = handle
      .send(Command::Deposit {
        amount: Decimal::new(1, 1),
      })
      .await;
    assert!(resp.success, "{:?}", resp);

    // the tick loop publishes state updates
    let mut saw_state_update = false;
    for _ in 0..64 {
      match events.recv().await {
        Ok(EngineEvent::StateUpdate { .. }) => {
          saw_state_update = true;
          break;
        }
        Ok(_) => {}
        Err(_) => break,
      }
    }
    assert!(saw_state_update);

    handle.shutdown();
    runner.await.unwrap().unwrap();
  }
}
