use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::{Duration as ChronoDuration, Utc};
use rust_decimal::Decimal;
use solana_sdk::signature::Signature;
use tokio::sync::Mutex;

use crate::client::{OrderParams, VenueClient};
use crate::codec::{decimal_to_raw, decode_user, encode_user, raw_to_decimal, UserRaw};
use crate::constants::*;
use crate::executor::{ExecOutcome, TxPipeline};
use crate::oracle::{Oracle, PriceUpdate};
use crate::risk;
use crate::snapshot::{build_account_state, MarketQuote, VenueSnapshot};
use crate::types::{
  perp_market_by_index, spot_market_by_index, Coded, CriticalFailure, ErrorCode, Market, Side,
};
use crate::vault::TradeRecord;

#[derive(Debug, Clone)]
pub struct DriverConfig {
  pub reserved_gas_native: Decimal,
  pub min_health_after_withdrawal: Decimal,
  pub oracle_stale_ms: i64,
}

/// Paper/live split as a tagged variant with one capability set. The
/// rebalancer and router consume this and never branch on the variant
/// beyond event labels.
pub enum Driver {
  Virtual(VirtualVenue),
  OnChain(OnChainVenue),
}

impl Driver {
  pub fn label(&self) -> &'static str {
    match self {
      Driver::Virtual(_) => "paper",
      Driver::OnChain(_) => "live",
    }
  }

  pub fn hedge_market(&self) -> &Market {
    match self {
      Driver::Virtual(v) => &v.market,
      Driver::OnChain(v) => &v.market,
    }
  }

  pub fn as_virtual(&self) -> Option<&VirtualVenue> {
    match self {
      Driver::Virtual(v) => Some(v),
      Driver::OnChain(_) => None,
    }
  }

  pub async fn snapshot(&self) -> anyhow::Result<VenueSnapshot> {
    match self {
      Driver::Virtual(v) => v.snapshot().await,
      Driver::OnChain(v) => v.snapshot().await,
    }
  }

  pub async fn deposit(&self, amount_native: Decimal) -> anyhow::Result<ExecOutcome> {
    match self {
      Driver::Virtual(v) => v.deposit(amount_native).await,
      Driver::OnChain(v) => v.deposit(amount_native).await,
    }
  }

  pub async fn withdraw(&self, amount_quote: Decimal) -> anyhow::Result<ExecOutcome> {
    match self {
      Driver::Virtual(v) => v.withdraw(amount_quote).await,
      Driver::OnChain(v) => v.withdraw(amount_quote).await,
    }
  }

  pub async fn open(
    &self,
    market_index: u16,
    side: Side,
    size_base: Decimal,
  ) -> anyhow::Result<ExecOutcome> {
    match self {
      Driver::Virtual(v) => v.open(market_index, side, size_base).await,
      Driver::OnChain(v) => v.open(market_index, side, size_base).await,
    }
  }

  pub async fn close(&self, market_index: u16) -> anyhow::Result<ExecOutcome> {
    match self {
      Driver::Virtual(v) => v.close(market_index).await,
      Driver::OnChain(v) => v.close(market_index).await,
    }
  }

  /// Closes every open position, one transaction per market. A failure
  /// after at least one confirmed close triggers a best-effort rollback of
  /// the closed legs; a rollback failure is critical.
  pub async fn close_all(&self) -> anyhow::Result<Vec<(u16, ExecOutcome)>> {
    let positions: Vec<(u16, Side, Decimal)> = self
      .snapshot()
      .await?
      .state
      .positions
      .iter()
      .map(|p| (p.market_index, p.side, p.size.abs()))
      .collect();
    if positions.is_empty() {
      return Err(Coded::new(ErrorCode::NoPosition, "no open positions").into());
    }

    let mut outcomes: Vec<(u16, ExecOutcome)> = vec![];
    let mut closed: Vec<(u16, Side, Decimal)> = vec![];
    for (market_index, side, size) in positions {
      match self.close(market_index).await {
        Ok(outcome) if outcome.is_confirmed() => {
          closed.push((market_index, side, size));
          outcomes.push((market_index, outcome));
        }
        Ok(outcome) => {
          outcomes.push((market_index, outcome.clone()));
          if !closed.is_empty() {
            self.rollback_closed(&closed).await?;
          }
          return Ok(outcomes);
        }
        Err(e) => {
          if !closed.is_empty() {
            self.rollback_closed(&closed).await?;
          }
          return Err(e);
        }
      }
    }
    Ok(outcomes)
  }

  /// Re-emits the closed legs after a partial close-all. Failure here means
  /// the book is unhedged with no automated way back.
  async fn rollback_closed(&self, closed: &[(u16, Side, Decimal)]) -> anyhow::Result<()> {
    for (market_index, side, size) in closed {
      log::warn!(
        "partial close-all: re-opening {} {} on market {}",
        side,
        size,
        market_index
      );
      match self.open(*market_index, *side, *size).await {
        Ok(outcome) if outcome.is_confirmed() => {}
        Ok(outcome) => {
          return Err(
            CriticalFailure(format!(
              "rollback of market {} leg did not confirm: {}",
              market_index, outcome
            ))
            .into(),
          )
        }
        Err(e) => {
          return Err(CriticalFailure(format!("rollback of market {} leg failed: {:#}", market_index, e)).into())
        }
      }
    }
    Ok(())
  }

  pub async fn settle(&self, market_index: u16) -> anyhow::Result<ExecOutcome> {
    match self {
      Driver::Virtual(v) => v.settle(market_index).await,
      Driver::OnChain(v) => v.settle(market_index).await,
    }
  }
}

/// A confirmed fill in the shape the trade log wants.
pub fn fill_record(market: &Market, side: Side, size: Decimal, price: Decimal, sig: Signature) -> TradeRecord {
  TradeRecord {
    timestamp: Utc::now(),
    market: market.symbol.to_string(),
    side,
    size,
    price,
    tx_signature: sig.to_string(),
  }
}

struct VirtualInner {
  /// Encoded user record; every mutation round-trips through the codec.
  user_bytes: Vec<u8>,
  /// market index -> (mark price, cumulative funding index)
  prices: HashMap<u16, (Decimal, Decimal)>,
  funding_rate_hourly: Decimal,
  native_balance: Decimal,
  wallet_spot_base: Decimal,
  oracle_age_ms: i64,
}

/// In-memory venue for paper mode and tests. Mutations go through
/// [`encode_user`]/[`decode_user`] so the codec sees real traffic, and the
/// executor semantics (lease, outcomes, pre-checks) match the live path.
pub struct VirtualVenue {
  market: Market,
  cfg: DriverConfig,
  inner: Mutex<VirtualInner>,
  lease: Mutex<()>,
  tx_count: AtomicUsize,
  settle_count: AtomicUsize,
  in_flight: AtomicUsize,
  max_in_flight: AtomicUsize,
  submit_attempts: AtomicUsize,
  snapshot_calls: AtomicUsize,
  fail_snapshots: AtomicBool,
  /// fail every snapshot call numbered >= this, 0 disables.
  fail_snapshots_from: AtomicUsize,
  fail_sends: AtomicBool,
  hang_confirms: AtomicBool,
  /// 1-based submit attempt to fail, 0 disables.
  fail_exact_submit: AtomicUsize,
  /// fail every submit attempt numbered >= this, 0 disables.
  fail_from_submit: AtomicUsize,
}

impl VirtualVenue {
  pub fn new(market: Market, cfg: DriverConfig) -> anyhow::Result<Self> {
    let user = UserRaw::default();
    let user_bytes = encode_user(&user)?;
    Ok(Self {
      inner: Mutex::new(VirtualInner {
        user_bytes,
        prices: HashMap::new(),
        funding_rate_hourly: Decimal::ZERO,
        native_balance: Decimal::ZERO,
        wallet_spot_base: Decimal::ZERO,
        oracle_age_ms: 0,
      }),
      market,
      cfg,
      lease: Mutex::new(()),
      tx_count: AtomicUsize::new(0),
      settle_count: AtomicUsize::new(0),
      in_flight: AtomicUsize::new(0),
      max_in_flight: AtomicUsize::new(0),
      submit_attempts: AtomicUsize::new(0),
      snapshot_calls: AtomicUsize::new(0),
      fail_snapshots: AtomicBool::new(false),
      fail_snapshots_from: AtomicUsize::new(0),
      fail_sends: AtomicBool::new(false),
      hang_confirms: AtomicBool::new(false),
      fail_exact_submit: AtomicUsize::new(0),
      fail_from_submit: AtomicUsize::new(0),
    })
  }

  pub async fn set_mark(&self, market_index: u16, mark: Decimal) {
    let mut inner = self.inner.lock().await;
    let entry = inner.prices.entry(market_index).or_insert((mark, Decimal::ZERO));
    entry.0 = mark;
  }

  pub async fn set_cumulative_funding(&self, market_index: u16, index: Decimal) {
    let mut inner = self.inner.lock().await;
    let entry = inner.prices.entry(market_index).or_insert((Decimal::ZERO, index));
    entry.1 = index;
  }

  pub async fn set_funding_rate_hourly(&self, rate: Decimal) {
    self.inner.lock().await.funding_rate_hourly = rate;
  }

  pub async fn set_native_balance(&self, amount: Decimal) {
    self.inner.lock().await.native_balance = amount;
  }

  pub async fn set_wallet_spot_base(&self, amount: Decimal) {
    self.inner.lock().await.wallet_spot_base = amount;
  }

  pub async fn set_oracle_age_ms(&self, age_ms: i64) {
    self.inner.lock().await.oracle_age_ms = age_ms;
  }

  pub fn set_fail_snapshots(&self, fail: bool) {
    self.fail_snapshots.store(fail, Ordering::SeqCst);
  }

  /// Fails every snapshot call numbered >= n (1-based).
  pub fn set_fail_snapshots_from(&self, call: usize) {
    self.snapshot_calls.store(0, Ordering::SeqCst);
    self.fail_snapshots_from.store(call, Ordering::SeqCst);
  }

  pub fn set_fail_sends(&self, fail: bool) {
    self.fail_sends.store(fail, Ordering::SeqCst);
  }

  pub fn set_hang_confirms(&self, hang: bool) {
    self.hang_confirms.store(hang, Ordering::SeqCst);
  }

  /// Fails exactly the n-th upcoming submit attempt (1-based).
  pub fn set_fail_exact_submit(&self, attempt: usize) {
    self.submit_attempts.store(0, Ordering::SeqCst);
    self.fail_exact_submit.store(attempt, Ordering::SeqCst);
  }

  /// Fails every upcoming submit attempt numbered >= n (1-based).
  pub fn set_fail_from_submit(&self, attempt: usize) {
    self.submit_attempts.store(0, Ordering::SeqCst);
    self.fail_from_submit.store(attempt, Ordering::SeqCst);
  }

  pub fn tx_count(&self) -> usize {
    self.tx_count.load(Ordering::SeqCst)
  }

  pub fn settle_count(&self) -> usize {
    self.settle_count.load(Ordering::SeqCst)
  }

  pub fn max_in_flight(&self) -> usize {
    self.max_in_flight.load(Ordering::SeqCst)
  }

  /// Seeds the venue-side user record directly.
  pub async fn with_user<F: FnOnce(&mut UserRaw)>(&self, f: F) -> anyhow::Result<()> {
    let mut inner = self.inner.lock().await;
    let mut user = decode_user(&inner.user_bytes)?;
    f(&mut user);
    inner.user_bytes = encode_user(&user)?;
    Ok(())
  }

  fn quotes(&self, inner: &VirtualInner) -> HashMap<u16, MarketQuote> {
    let now = Utc::now();
    inner
      .prices
      .iter()
      .map(|(index, (mark, cum))| {
        (
          *index,
          MarketQuote {
            mark: PriceUpdate::new(*mark, now - ChronoDuration::milliseconds(inner.oracle_age_ms)),
            cumulative_funding_rate: *cum,
          },
        )
      })
      .collect()
  }

  pub async fn snapshot(&self) -> anyhow::Result<VenueSnapshot> {
    let call = self.snapshot_calls.fetch_add(1, Ordering::SeqCst) + 1;
    let fail_from = self.fail_snapshots_from.load(Ordering::SeqCst);
    if self.fail_snapshots.load(Ordering::SeqCst) || (fail_from != 0 && call >= fail_from) {
      anyhow::bail!("venue rpc unreachable");
    }
    let inner = self.inner.lock().await;
    let user = decode_user(&inner.user_bytes)?;
    let quotes = self.quotes(&inner);
    let state = build_account_state(&user, &quotes, Utc::now())?;

    let venue_spot_base = match user.spot_position(self.market.base_spot_index) {
      Some(slot) => {
        let meta = spot_market_by_index(self.market.base_spot_index)
          .ok_or_else(|| anyhow::anyhow!("unknown spot market {}", self.market.base_spot_index))?;
        raw_to_decimal(slot.scaled_balance as i128, meta.decimals)?
      }
      None => Decimal::ZERO,
    };
    let hedge = quotes
      .get(&self.market.index)
      .ok_or_else(|| anyhow::anyhow!("no pinned price for hedge market {}", self.market.index))?;

    Ok(VenueSnapshot {
      state,
      spot_base: inner.wallet_spot_base + venue_spot_base,
      native_balance: inner.native_balance,
      mark: hedge.mark,
      oracle: hedge.mark,
      funding_rate_hourly: inner.funding_rate_hourly,
    })
  }

  fn fabricate_signature() -> Signature {
    let mut bytes = [0u8; 64];
    rand::RngCore::fill_bytes(&mut rand::thread_rng(), &mut bytes);
    Signature::from(bytes)
  }

  async fn submit<F: FnOnce(&mut UserRaw, &mut VirtualInner) -> anyhow::Result<()>>(
    &self,
    mutate: F,
  ) -> anyhow::Result<ExecOutcome> {
    // the fill itself; the venue applies it atomically
    tokio::task::yield_now().await;
    let attempt = self.submit_attempts.fetch_add(1, Ordering::SeqCst) + 1;
    let fail_exact = self.fail_exact_submit.load(Ordering::SeqCst);
    let fail_from = self.fail_from_submit.load(Ordering::SeqCst);
    if self.fail_sends.load(Ordering::SeqCst)
      || (fail_exact != 0 && attempt == fail_exact)
      || (fail_from != 0 && attempt >= fail_from)
    {
      return Ok(ExecOutcome::Failed {
        reason: "send failed: venue rpc refused".to_string(),
      });
    }
    let sig = Self::fabricate_signature();
    if self.hang_confirms.load(Ordering::SeqCst) {
      self.tx_count.fetch_add(1, Ordering::SeqCst);
      return Ok(ExecOutcome::Unknown { signature: sig });
    }
    {
      let mut inner = self.inner.lock().await;
      let mut user = decode_user(&inner.user_bytes)?;
      mutate(&mut user, &mut inner)?;
      inner.user_bytes = encode_user(&user)?;
    }
    self.tx_count.fetch_add(1, Ordering::SeqCst);
    Ok(ExecOutcome::Confirmed { signature: sig })
  }

  async fn track<T, Fut: std::future::Future<Output = anyhow::Result<T>>>(
    &self,
    fut: Fut,
  ) -> anyhow::Result<T> {
    let _lease = self.lease.lock().await;
    let in_flight = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
    self.max_in_flight.fetch_max(in_flight, Ordering::SeqCst);
    tokio::time::sleep(Duration::from_millis(2)).await;
    let res = fut.await;
    self.in_flight.fetch_sub(1, Ordering::SeqCst);
    res
  }

  pub async fn deposit(&self, amount_native: Decimal) -> anyhow::Result<ExecOutcome> {
    let reserved = self.cfg.reserved_gas_native;
    self
      .track(async {
        let available = self.inner.lock().await.native_balance - reserved;
        if amount_native <= Decimal::ZERO || amount_native > available {
          return Ok(ExecOutcome::Rejected {
            reason: format!(
              "{}: deposit {} exceeds spendable {}",
              ErrorCode::InsufficientBalance,
              amount_native,
              available.max(Decimal::ZERO)
            ),
          });
        }
        let spot_index = self.market.base_spot_index;
        self
          .submit(move |user, inner| {
            inner.native_balance -= amount_native;
            let meta = spot_market_by_index(spot_index)
              .ok_or_else(|| anyhow::anyhow!("unknown spot market {}", spot_index))?;
            let raw = decimal_to_raw(amount_native, meta.decimals)? as u64;
            let slot = match user
              .spot_positions
              .iter_mut()
              .find(|s| s.market_index == spot_index && !s.is_empty())
            {
              Some(slot) => slot,
              None => {
                let slot = user
                  .spot_positions
                  .iter_mut()
                  .find(|s| s.is_empty())
                  .ok_or_else(|| anyhow::anyhow!("no free spot slot"))?;
                slot.market_index = spot_index;
                slot.balance_type = 0;
                slot
              }
            };
            slot.scaled_balance += raw;
            slot.cumulative_deposits += raw as i64;
            Ok(())
          })
          .await
      })
      .await
  }

  pub async fn withdraw(&self, amount_quote: Decimal) -> anyhow::Result<ExecOutcome> {
    self
      .track(async {
        if amount_quote <= Decimal::ZERO {
          return Err(Coded::new(ErrorCode::InvalidRequest, "amount must be positive").into());
        }
        let snap = self.snapshot().await?;
        let projected = risk::projected_health_after_withdrawal(&snap.state, amount_quote);
        if projected < self.cfg.min_health_after_withdrawal {
          // never reaches submission; tx count stays put
          return Ok(ExecOutcome::Rejected {
            reason: format!(
              "{}: projected_health={} floor={}",
              ErrorCode::HealthFloor,
              projected,
              self.cfg.min_health_after_withdrawal
            ),
          });
        }
        self
          .submit(move |user, _| {
            let raw = decimal_to_raw(amount_quote, QUOTE_DECIMALS)? as u64;
            let slot = user
              .spot_positions
              .iter_mut()
              .find(|s| s.market_index == QUOTE_SPOT_MARKET_INDEX && !s.is_empty())
              .ok_or_else(|| anyhow::anyhow!("no quote balance"))?;
            if slot.scaled_balance < raw {
              anyhow::bail!("withdraw exceeds quote balance");
            }
            slot.scaled_balance -= raw;
            Ok(())
          })
          .await
      })
      .await
  }

  pub async fn open(
    &self,
    market_index: u16,
    side: Side,
    size_base: Decimal,
  ) -> anyhow::Result<ExecOutcome> {
    self
      .track(async {
        if size_base <= Decimal::ZERO {
          return Err(Coded::new(ErrorCode::InvalidRequest, "size must be positive").into());
        }
        perp_market_by_index(market_index)
          .ok_or_else(|| Coded::new(ErrorCode::UnknownMarket, format!("market {}", market_index)))?;
        let (mark, cum_funding) = {
          let inner = self.inner.lock().await;
          inner
            .prices
            .get(&market_index)
            .copied()
            .ok_or_else(|| anyhow::anyhow!("no pinned price for market {}", market_index))?
        };
        self
          .submit(move |user, _| {
            let delta_raw = decimal_to_raw(size_base, BASE_DECIMALS)? as i64;
            let delta = match side {
              Side::Long => delta_raw,
              Side::Short => -delta_raw,
            };
            let entry_delta_raw = decimal_to_raw(size_base * mark, QUOTE_DECIMALS)? as i64;
            let slot = match user
              .perp_positions
              .iter_mut()
              .find(|p| p.market_index == market_index && !p.is_empty())
            {
              Some(slot) => slot,
              None => {
                let slot = user
                  .perp_positions
                  .iter_mut()
                  .find(|p| p.is_empty())
                  .ok_or_else(|| anyhow::anyhow!("no free perp slot"))?;
                slot.market_index = market_index;
                // a fresh position starts at the current funding index
                slot.last_cumulative_funding_rate =
                  decimal_to_raw(cum_funding, FUNDING_DECIMALS)? as i64;
                slot
              }
            };
            let old = slot.base_asset_amount;
            let new = old + delta;
            if old == 0 || old.signum() == delta.signum() {
              slot.quote_entry_amount += entry_delta_raw;
              slot.quote_asset_amount += entry_delta_raw;
            } else if new == 0 {
              slot.quote_entry_amount = 0;
              slot.quote_asset_amount = 0;
            } else {
              // reduce keeps average entry: scale the entry notional down
              let scaled = (slot.quote_entry_amount as i128 * new.abs() as i128
                / old.abs().max(1) as i128) as i64;
              slot.quote_entry_amount = scaled;
              slot.quote_asset_amount = scaled;
            }
            slot.base_asset_amount = new;
            Ok(())
          })
          .await
      })
      .await
  }

  pub async fn close(&self, market_index: u16) -> anyhow::Result<ExecOutcome> {
    let outcome = self
      .track(async {
        let snap = self.snapshot().await?;
        let pos = snap
          .state
          .position(market_index)
          .cloned()
          .ok_or_else(|| Coded::new(ErrorCode::NoPosition, format!("market {}", market_index)))?;
        // opposing market order of exactly |size|, reduce_only; the venue
        // realizes price pnl and accrued funding into the quote balance
        let realized = pos.size * (pos.mark_price - pos.entry_price) + pos.unsettled_pnl;
        let outcome = self
          .submit(move |user, _| {
            let slot = user
              .perp_positions
              .iter_mut()
              .find(|p| p.market_index == market_index && !p.is_empty())
              .ok_or_else(|| anyhow::anyhow!("position vanished"))?;
            let credit = decimal_to_raw(realized, QUOTE_DECIMALS)?;
            *slot = Default::default();
            let quote = user
              .spot_positions
              .iter_mut()
              .find(|s| s.market_index == QUOTE_SPOT_MARKET_INDEX && !s.is_empty())
              .ok_or_else(|| anyhow::anyhow!("no quote balance"))?;
            let balance = quote.scaled_balance as i128 + credit;
            quote.scaled_balance = balance.max(0) as u64;
            Ok(())
          })
          .await?;
        Ok((outcome, pos))
      })
      .await;

    let (outcome, pos) = outcome?;
    if outcome.is_confirmed() && pos.unsettled_pnl.abs() > SETTLE_THRESHOLD_QUOTE {
      // settle is best-effort: a failure logs and does not fail the close
      self.settle_count.fetch_add(1, Ordering::SeqCst);
      if self.fail_sends.load(Ordering::SeqCst) {
        log::warn!(
          "settle after close failed for market {}: venue rpc refused",
          market_index
        );
      } else {
        self.tx_count.fetch_add(1, Ordering::SeqCst);
      }
    }
    Ok(outcome)
  }

  pub async fn settle(&self, market_index: u16) -> anyhow::Result<ExecOutcome> {
    self
      .track(async {
        let snap = self.snapshot().await?;
        let pos = snap
          .state
          .position(market_index)
          .cloned()
          .ok_or_else(|| Coded::new(ErrorCode::NoPosition, format!("market {}", market_index)))?;
        if pos.unsettled_pnl.abs() <= SETTLE_THRESHOLD_QUOTE {
          return Err(
            Coded::new(
              ErrorCode::NothingToSettle,
              format!("unsettled {} within threshold", pos.unsettled_pnl),
            )
            .into(),
          );
        }
        let cum = {
          let inner = self.inner.lock().await;
          inner.prices.get(&market_index).map(|(_, cum)| *cum).unwrap_or_default()
        };
        self
          .submit(move |user, _| {
            let slot = user
              .perp_positions
              .iter_mut()
              .find(|p| p.market_index == market_index && !p.is_empty())
              .ok_or_else(|| anyhow::anyhow!("position vanished"))?;
            let credit = decimal_to_raw(pos.unsettled_pnl, QUOTE_DECIMALS)?;
            slot.last_cumulative_funding_rate = decimal_to_raw(cum, FUNDING_DECIMALS)? as i64;
            slot.settled_pnl += credit as i64;
            let quote = user
              .spot_positions
              .iter_mut()
              .find(|s| s.market_index == QUOTE_SPOT_MARKET_INDEX && !s.is_empty())
              .ok_or_else(|| anyhow::anyhow!("no quote balance"))?;
            let balance = quote.scaled_balance as i128 + credit;
            quote.scaled_balance = balance.max(0) as u64;
            Ok(())
          })
          .await
      })
      .await
  }
}

/// The live venue: reads accounts over RPC and pushes signed transactions
/// through the pipeline. One exclusive lease per engine keeps at most one
/// state-mutating transaction in flight.
pub struct OnChainVenue {
  client: VenueClient,
  oracle: Oracle,
  market: Market,
  cfg: DriverConfig,
  lease: Mutex<()>,
}

impl OnChainVenue {
  pub fn new(client: VenueClient, market: Market, cfg: DriverConfig) -> Self {
    let oracle = Oracle::rpc(client.rpc(), client.market_keys(), cfg.oracle_stale_ms);
    Self {
      client,
      oracle,
      market,
      cfg,
      lease: Mutex::new(()),
    }
  }

  pub fn client(&self) -> &VenueClient {
    &self.client
  }

  pub async fn snapshot(&self) -> anyhow::Result<VenueSnapshot> {
    let bytes = self
      .client
      .user_account_raw()
      .await?
      .ok_or_else(|| Coded::new(ErrorCode::NotInitialized, "user account does not exist"))?;
    self.snapshot_from_bytes(&bytes).await
  }

  /// Builds the snapshot from already-fetched user bytes (the account
  /// subscription path) plus fresh market reads.
  pub async fn snapshot_from_bytes(&self, bytes: &[u8]) -> anyhow::Result<VenueSnapshot> {
    let user = decode_user(bytes)?;

    let mut indexes: Vec<u16> = user
      .perp_positions
      .iter()
      .filter(|p| p.base_asset_amount != 0)
      .map(|p| p.market_index)
      .collect();
    if !indexes.contains(&self.market.index) {
      indexes.push(self.market.index);
    }

    let mut quotes = HashMap::new();
    let mut hedge_raw = None;
    for index in indexes {
      let raw = self.client.perp_market(index).await?;
      let mark = raw_to_decimal(raw.mark_price as i128, PRICE_DECIMALS)?;
      let cum = raw_to_decimal(raw.cumulative_funding_rate as i128, FUNDING_DECIMALS)?;
      let published = chrono::DateTime::from_timestamp_millis(raw.oracle_unix_ms)
        .unwrap_or_else(Utc::now);
      quotes.insert(
        index,
        MarketQuote {
          mark: PriceUpdate::new(mark, published),
          cumulative_funding_rate: cum,
        },
      );
      if index == self.market.index {
        hedge_raw = Some(raw);
      }
    }
    let hedge_raw = hedge_raw.ok_or_else(|| anyhow::anyhow!("hedge market quote missing"))?;
    let hedge = quotes[&self.market.index];

    let state = build_account_state(&user, &quotes, Utc::now())?;
    let native_balance = self.client.native_balance().await?;
    let venue_spot_base = match user.spot_position(self.market.base_spot_index) {
      Some(slot) => {
        let meta = spot_market_by_index(self.market.base_spot_index)
          .ok_or_else(|| anyhow::anyhow!("unknown spot market {}", self.market.base_spot_index))?;
        raw_to_decimal(slot.scaled_balance as i128, meta.decimals)?
      }
      None => Decimal::ZERO,
    };

    Ok(VenueSnapshot {
      state,
      spot_base: native_balance + venue_spot_base,
      native_balance,
      mark: hedge.mark,
      oracle: PriceUpdate::new(
        raw_to_decimal(hedge_raw.oracle_price as i128, PRICE_DECIMALS)?,
        hedge.mark.fetched_at,
      ),
      funding_rate_hourly: raw_to_decimal(hedge_raw.funding_rate_hourly as i128, FUNDING_DECIMALS)?,
    })
  }

  async fn run_pipeline(&self, ixs: Vec<solana_sdk::instruction::Instruction>) -> ExecOutcome {
    let mut pipeline = TxPipeline::new(self.client.rpc(), false).with_ixs(ixs);
    pipeline.execute(&self.client.signer()).await
  }

  pub async fn deposit(&self, amount_native: Decimal) -> anyhow::Result<ExecOutcome> {
    let _lease = self.lease.lock().await;
    let spendable = self.client.native_balance().await? - self.cfg.reserved_gas_native;
    if amount_native <= Decimal::ZERO || amount_native > spendable {
      return Ok(ExecOutcome::Rejected {
        reason: format!(
          "{}: deposit {} exceeds spendable {}",
          ErrorCode::InsufficientBalance,
          amount_native,
          spendable.max(Decimal::ZERO)
        ),
      });
    }
    let meta = spot_market_by_index(self.market.base_spot_index)
      .ok_or_else(|| anyhow::anyhow!("unknown spot market {}", self.market.base_spot_index))?;
    let raw = decimal_to_raw(amount_native, meta.decimals)? as u64;
    let ix = self.client.deposit_ix(self.market.base_spot_index, raw);
    Ok(self.run_pipeline(vec![ix]).await)
  }

  pub async fn withdraw(&self, amount_quote: Decimal) -> anyhow::Result<ExecOutcome> {
    let _lease = self.lease.lock().await;
    if amount_quote <= Decimal::ZERO {
      return Err(Coded::new(ErrorCode::InvalidRequest, "amount must be positive").into());
    }
    let snap = self.snapshot().await?;
    let projected = risk::projected_health_after_withdrawal(&snap.state, amount_quote);
    if projected < self.cfg.min_health_after_withdrawal {
      return Ok(ExecOutcome::Rejected {
        reason: format!(
          "{}: projected_health={} floor={}",
          ErrorCode::HealthFloor,
          projected,
          self.cfg.min_health_after_withdrawal
        ),
      });
    }
    let raw = decimal_to_raw(amount_quote, QUOTE_DECIMALS)? as u64;
    let ix = self.client.withdraw_ix(QUOTE_SPOT_MARKET_INDEX, raw);
    Ok(self.run_pipeline(vec![ix]).await)
  }

  pub async fn open(
    &self,
    market_index: u16,
    side: Side,
    size_base: Decimal,
  ) -> anyhow::Result<ExecOutcome> {
    let _lease = self.lease.lock().await;
    if size_base <= Decimal::ZERO {
      return Err(Coded::new(ErrorCode::InvalidRequest, "size must be positive").into());
    }
    perp_market_by_index(market_index)
      .ok_or_else(|| Coded::new(ErrorCode::UnknownMarket, format!("market {}", market_index)))?;
    let mark = self.oracle.mark_price(market_index).await?.price;
    let slippage = risk::slippage_bound((size_base * mark).abs());
    let limit = risk::price_limit(mark, side, slippage);
    let params = OrderParams {
      market_index,
      direction: side.into(),
      base_asset_amount: decimal_to_raw(size_base, BASE_DECIMALS)? as u64,
      price_limit: decimal_to_raw(limit, PRICE_DECIMALS)? as u64,
      reduce_only: false,
    };
    let ix = self.client.place_perp_order_ix(params);
    Ok(self.run_pipeline(vec![ix]).await)
  }

  pub async fn close(&self, market_index: u16) -> anyhow::Result<ExecOutcome> {
    let _lease = self.lease.lock().await;
    let snap = self.snapshot().await?;
    let pos = snap
      .state
      .position(market_index)
      .cloned()
      .ok_or_else(|| Coded::new(ErrorCode::NoPosition, format!("market {}", market_index)))?;

    let side = pos.side.opposite();
    let slippage = risk::slippage_bound(pos.notional());
    let limit = risk::price_limit(pos.mark_price, side, slippage);
    let params = OrderParams {
      market_index,
      direction: side.into(),
      base_asset_amount: decimal_to_raw(pos.size.abs(), BASE_DECIMALS)? as u64,
      price_limit: decimal_to_raw(limit, PRICE_DECIMALS)? as u64,
      reduce_only: true,
    };
    let ix = self.client.place_perp_order_ix(params);
    let outcome = self.run_pipeline(vec![ix]).await;

    if outcome.is_confirmed() && pos.unsettled_pnl.abs() > SETTLE_THRESHOLD_QUOTE {
      // settle is best-effort after a confirmed close
      let ix = self.client.settle_pnl_ix(market_index);
      match self.run_pipeline(vec![ix]).await {
        ExecOutcome::Confirmed { .. } => {}
        other => log::warn!("settle after close did not confirm: {}", other),
      }
    }
    Ok(outcome)
  }

  pub async fn settle(&self, market_index: u16) -> anyhow::Result<ExecOutcome> {
    let _lease = self.lease.lock().await;
    let snap = self.snapshot().await?;
    let pos = snap
      .state
      .position(market_index)
      .cloned()
      .ok_or_else(|| Coded::new(ErrorCode::NoPosition, format!("market {}", market_index)))?;
    if pos.unsettled_pnl.abs() <= SETTLE_THRESHOLD_QUOTE {
      return Err(
        Coded::new(
          ErrorCode::NothingToSettle,
          format!("unsettled {} within threshold", pos.unsettled_pnl),
        )
        .into(),
      );
    }
    let ix = self.client.settle_pnl_ix(market_index);
    Ok(self.run_pipeline(vec![ix]).await)
  }
}
