use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use rust_decimal::Decimal;
use tokio::sync::{broadcast, oneshot, Mutex as TokioMutex, RwLock};

use venue::gate::{BlockReason, GateVerdict, OpenCheck, SafetyGate, WithdrawCheck};
use venue::types::{
  perp_market_by_symbol, Coded, Command, CommandResponse, CriticalFailure, EngineEvent, EngineMode,
  ErrorCode, Market, Side,
};
use venue::vault::EngineVault;
use venue::{fill_record, Driver, ExecOutcome};

/// How long a command may hold its caller before the result degrades to an
/// asynchronous COMMAND_RESULT event.
const RESPONSE_BOUND: Duration = Duration::from_secs(5);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EngineStatus {
  NotInitialized,
  Running,
  Reconnecting,
  Stopped,
}

/// Everything a command needs, shared across the supervisor and the
/// command tasks it spawns.
pub struct RouterCtx {
  pub driver: Arc<Driver>,
  pub gate: Arc<SafetyGate>,
  pub vault: Arc<TokioMutex<EngineVault>>,
  pub events: broadcast::Sender<EngineEvent>,
  pub status: Arc<RwLock<EngineStatus>>,
  pub mode: EngineMode,
  pub min_trade_size_base: Decimal,
  pub in_flight: AtomicUsize,
  pub critical: AtomicBool,
}

impl RouterCtx {
  pub fn commands_in_flight(&self) -> usize {
    self.in_flight.load(Ordering::SeqCst)
  }

  pub fn is_critical(&self) -> bool {
    self.critical.load(Ordering::SeqCst)
  }
}

pub struct CommandRequest {
  pub cmd: Command,
  pub respond: oneshot::Sender<CommandResponse>,
}

fn emit_result(ctx: &RouterCtx, resp: &CommandResponse) {
  let _ = ctx.events.send(EngineEvent::CommandResult {
    action: resp.action.clone(),
    success: resp.success,
    code: resp.code,
    message: resp.message.clone(),
    tx_signature: resp.tx_signature.clone(),
  });
}

/// Validates shape and engine state before any work is spawned. Responses
/// here are immediate.
async fn preflight(ctx: &RouterCtx, cmd: &Command) -> Option<CommandResponse> {
  let action = cmd.action();
  if !cmd.is_trade() {
    return None;
  }

  match *ctx.status.read().await {
    EngineStatus::NotInitialized => {
      return Some(CommandResponse::err(
        action,
        ErrorCode::NotInitialized,
        "venue account does not exist",
      ))
    }
    EngineStatus::Reconnecting => {
      return Some(CommandResponse::err(
        action,
        ErrorCode::Reconnecting,
        "subscription dropped, reconnecting",
      ))
    }
    EngineStatus::Stopped => {
      return Some(CommandResponse::err(action, ErrorCode::NotRunning, "engine is stopped"))
    }
    EngineStatus::Running => {}
  }

  if ctx.vault.lock().await.trading_disabled() {
    return Some(CommandResponse::err(
      action,
      ErrorCode::TradingDisabled,
      "trading disabled; operator reset required",
    ));
  }

  match cmd {
    Command::Deposit { amount } | Command::Withdraw { amount } => {
      if *amount <= Decimal::ZERO {
        return Some(CommandResponse::err(
          action,
          ErrorCode::InvalidRequest,
          "amount must be positive",
        ));
      }
    }
    Command::OpenPosition { market, size, .. } => {
      if perp_market_by_symbol(market).is_none() {
        return Some(CommandResponse::err(
          action,
          ErrorCode::UnknownMarket,
          format!("unknown market {}", market),
        ));
      }
      if *size < ctx.min_trade_size_base {
        return Some(CommandResponse::err(
          action,
          ErrorCode::InvalidRequest,
          format!("size {} below minimum {}", size, ctx.min_trade_size_base),
        ));
      }
    }
    Command::ClosePosition { market } => {
      if !market.eq_ignore_ascii_case("ALL") && perp_market_by_symbol(market).is_none() {
        return Some(CommandResponse::err(
          action,
          ErrorCode::UnknownMarket,
          format!("unknown market {}", market),
        ));
      }
    }
    Command::SettlePnl { market } => {
      if perp_market_by_symbol(market).is_none() {
        return Some(CommandResponse::err(
          action,
          ErrorCode::UnknownMarket,
          format!("unknown market {}", market),
        ));
      }
    }
    Command::StartEngine { .. } | Command::StopEngine => {}
  }
  None
}

async fn lifecycle(ctx: &RouterCtx, cmd: &Command) -> CommandResponse {
  let action = cmd.action();
  match cmd {
    Command::StartEngine { mode } => {
      if *mode != ctx.mode {
        return CommandResponse::err(
          action,
          ErrorCode::InvalidMode,
          format!("engine is configured for {} mode", ctx.mode),
        );
      }
      let mut status = ctx.status.write().await;
      match *status {
        EngineStatus::Running | EngineStatus::Reconnecting => {
          CommandResponse::err(action, ErrorCode::AlreadyRunning, "engine already running")
        }
        EngineStatus::NotInitialized => CommandResponse::err(
          action,
          ErrorCode::NotInitialized,
          "venue account does not exist",
        ),
        EngineStatus::Stopped => {
          *status = EngineStatus::Running;
          CommandResponse::ok(action, "starting", None)
        }
      }
    }
    Command::StopEngine => {
      let mut status = ctx.status.write().await;
      match *status {
        EngineStatus::Running | EngineStatus::Reconnecting => {
          *status = EngineStatus::Stopped;
          CommandResponse::ok(action, "stopping", None)
        }
        _ => CommandResponse::err(action, ErrorCode::NotRunning, "engine is not running"),
      }
    }
    _ => CommandResponse::err(action, ErrorCode::InvalidRequest, "not a lifecycle command"),
  }
}

fn rejected_code(reason: &str) -> ErrorCode {
  if reason.starts_with("INSUFFICIENT_BALANCE") {
    ErrorCode::InsufficientBalance
  } else if reason.starts_with("HEALTH_FLOOR") {
    ErrorCode::HealthFloor
  } else {
    ErrorCode::SimFailed
  }
}

fn outcome_response(action: &str, outcome: ExecOutcome) -> CommandResponse {
  match outcome {
    ExecOutcome::Confirmed { signature } => {
      CommandResponse::ok(action, "confirmed", Some(signature.to_string()))
    }
    ExecOutcome::Rejected { reason } => {
      let code = rejected_code(&reason);
      CommandResponse::err(action, code, reason)
    }
    ExecOutcome::Failed { reason } => {
      let code = if reason.contains("timed out") {
        ErrorCode::Timeout
      } else {
        ErrorCode::Unknown
      };
      CommandResponse::err(action, code, reason)
    }
    ExecOutcome::Unknown { signature } => CommandResponse {
      action: action.to_string(),
      success: false,
      code: Some(ErrorCode::Unknown),
      message: "confirmation unknown; verify the signature externally".to_string(),
      tx_signature: Some(signature.to_string()),
    },
  }
}

fn block_response(action: &str, reason: BlockReason, detail: String) -> CommandResponse {
  let code = match reason {
    BlockReason::LeverageLimit => ErrorCode::LeverageLimit,
    BlockReason::HealthFloor => ErrorCode::HealthFloor,
    _ => ErrorCode::SafetyBlock,
  };
  CommandResponse::err(action, code, format!("{}: {}", reason, detail))
}

/// Books a confirmed fill: trade log, idempotent vault record, vault
/// reconciliation with retry.
async fn book_fill(
  ctx: &RouterCtx,
  market: &Market,
  side: Side,
  size: Decimal,
  price: Decimal,
  signature: solana_sdk::signature::Signature,
) {
  log::info!(
    "trade timestamp={} market={} side={} size={} price={} tx_signature={}",
    Utc::now(),
    market.symbol,
    side,
    size,
    price,
    signature
  );
  let mut vault = ctx.vault.lock().await;
  if let Err(e) = vault.record_trade(fill_record(market, side, size, price, signature)) {
    log::error!("failed to record trade: {:#}", e);
  }
  let driver = ctx.driver.clone();
  if let Err(e) = vault.sync_from_snapshot(|| driver.snapshot()).await {
    log::error!("vault desync after retries, trading disabled: {:#}", e);
    let _ = ctx.events.send(EngineEvent::VaultSyncFailed {
      engine_id: vault.state().engine_id.clone(),
    });
  }
}

async fn dispatch(ctx: &RouterCtx, cmd: &Command) -> anyhow::Result<CommandResponse> {
  let action = cmd.action();
  match cmd {
    Command::Deposit { amount } => Ok(outcome_response(action, ctx.driver.deposit(*amount).await?)),
    Command::Withdraw { amount } => {
      let now = Utc::now();
      let snap = ctx.driver.snapshot().await?;
      let check = WithdrawCheck {
        state: &snap.state,
        withdraw_quote: *amount,
        oracle_age_ms: snap.oracle.age_ms(now),
        native_balance: snap.native_balance,
      };
      if let GateVerdict::Block { reason, detail } = ctx.gate.check_withdraw(&check) {
        log::warn!("withdraw blocked by safety gate: {} ({})", reason, detail);
        return Ok(block_response(action, reason, detail));
      }
      Ok(outcome_response(action, ctx.driver.withdraw(*amount).await?))
    }
    Command::OpenPosition {
      market,
      direction,
      size,
    } => {
      let market = perp_market_by_symbol(market)
        .ok_or_else(|| Coded::new(ErrorCode::UnknownMarket, format!("unknown market {}", market)))?;
      let now = Utc::now();
      let snap = ctx.driver.snapshot().await?;
      let check = OpenCheck {
        state: &snap.state,
        size_base: *size,
        mark_price: snap.mark.price,
        funding_rate_hourly: snap.funding_rate_hourly,
        oracle_age_ms: snap.oracle.age_ms(now),
        native_balance: snap.native_balance,
        native_price_quote: snap.oracle.price,
      };
      if let GateVerdict::Block { reason, detail } = ctx.gate.check_open(&check) {
        log::warn!("open blocked by safety gate: {} ({})", reason, detail);
        return Ok(block_response(action, reason, detail));
      }
      let outcome = ctx.driver.open(market.index, *direction, *size).await?;
      if let ExecOutcome::Confirmed { signature } = &outcome {
        book_fill(ctx, market, *direction, *size, snap.mark.price, *signature).await;
      }
      Ok(outcome_response(action, outcome))
    }
    Command::ClosePosition { market } => {
      if market.eq_ignore_ascii_case("ALL") {
        let outcomes = ctx.driver.close_all().await?;
        let confirmed = outcomes.iter().filter(|(_, o)| o.is_confirmed()).count();
        if confirmed == outcomes.len() {
          let last_sig = outcomes
            .last()
            .and_then(|(_, o)| o.signature())
            .map(|s| s.to_string());
          return Ok(CommandResponse::ok(
            action,
            format!("closed {} positions", confirmed),
            last_sig,
          ));
        }
        let (_, first_bad) = outcomes
          .iter()
          .find(|(_, o)| !o.is_confirmed())
          .cloned()
          .unwrap_or((0, ExecOutcome::Failed { reason: "unknown".to_string() }));
        return Ok(outcome_response(action, first_bad));
      }
      let market = perp_market_by_symbol(market)
        .ok_or_else(|| Coded::new(ErrorCode::UnknownMarket, format!("unknown market {}", market)))?;
      let snap = ctx.driver.snapshot().await?;
      let pos = snap.state.position(market.index).cloned();
      let outcome = ctx.driver.close(market.index).await?;
      if let (ExecOutcome::Confirmed { signature }, Some(pos)) = (&outcome, pos) {
        book_fill(
          ctx,
          market,
          pos.side.opposite(),
          pos.size.abs(),
          pos.mark_price,
          *signature,
        )
        .await;
      }
      Ok(outcome_response(action, outcome))
    }
    Command::SettlePnl { market } => {
      let market = perp_market_by_symbol(market)
        .ok_or_else(|| Coded::new(ErrorCode::UnknownMarket, format!("unknown market {}", market)))?;
      Ok(outcome_response(action, ctx.driver.settle(market.index).await?))
    }
    Command::StartEngine { .. } | Command::StopEngine => Err(
      Coded::new(ErrorCode::InvalidRequest, "lifecycle command in trade path").into(),
    ),
  }
}

async fn execute_trade(ctx: Arc<RouterCtx>, cmd: Command) -> CommandResponse {
  let action = cmd.action();
  match dispatch(&ctx, &cmd).await {
    Ok(resp) => resp,
    Err(e) => {
      if let Some(crit) = e.downcast_ref::<CriticalFailure>() {
        ctx.critical.store(true, Ordering::SeqCst);
        if let Err(persist_err) = ctx.vault.lock().await.set_safety_flag(true) {
          log::error!("failed to latch safety flag: {:#}", persist_err);
        }
        let _ = ctx.events.send(EngineEvent::Critical {
          reason: crit.0.clone(),
        });
        log::error!("CRITICAL: {} — trading disabled until operator reset", crit.0);
        return CommandResponse::err(
          action,
          ErrorCode::TradingDisabled,
          format!("critical: {}", crit.0),
        );
      }
      if let Some(coded) = e.downcast_ref::<Coded>() {
        return CommandResponse::err(action, coded.code, coded.message.clone());
      }
      let text = format!("{:#}", e);
      let code = if text.contains("timed out") {
        ErrorCode::Timeout
      } else {
        ErrorCode::Unknown
      };
      CommandResponse::err(action, code, text)
    }
  }
}

/// Routes one command. Validation errors return immediately with a
/// normalized `{code, message}`; executions are bounded to five seconds,
/// after which the caller gets an accepted-response and the final outcome
/// arrives as a COMMAND_RESULT event.
pub async fn handle_command(ctx: Arc<RouterCtx>, cmd: Command) -> CommandResponse {
  let action = cmd.action().to_string();

  if let Some(resp) = preflight(&ctx, &cmd).await {
    emit_result(&ctx, &resp);
    return resp;
  }

  if !cmd.is_trade() {
    let resp = lifecycle(&ctx, &cmd).await;
    emit_result(&ctx, &resp);
    return resp;
  }

  let task_ctx = ctx.clone();
  let mut handle = tokio::spawn(async move {
    task_ctx.in_flight.fetch_add(1, Ordering::SeqCst);
    let resp = execute_trade(task_ctx.clone(), cmd).await;
    emit_result(&task_ctx, &resp);
    task_ctx.in_flight.fetch_sub(1, Ordering::SeqCst);
    resp
  });

  match tokio::time::timeout(RESPONSE_BOUND, &mut handle).await {
    Ok(Ok(resp)) => resp,
    Ok(Err(e)) => CommandResponse::err(&action, ErrorCode::Unknown, format!("command task failed: {}", e)),
    Err(_) => CommandResponse::ok(
      &action,
      "accepted; confirmation will follow as COMMAND_RESULT",
      None,
    ),
  }
}
