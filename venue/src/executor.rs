use std::sync::Arc;
use std::time::Instant;

use solana_account_decoder::UiAccountEncoding;
use solana_client::nonblocking::rpc_client::RpcClient;
use solana_client::rpc_config::{RpcSimulateTransactionAccountsConfig, RpcSimulateTransactionConfig};
use solana_rpc_client_api::config::RpcSendTransactionConfig;
use solana_sdk::commitment_config::CommitmentConfig;
use solana_sdk::compute_budget::ComputeBudgetInstruction;
use solana_sdk::instruction::Instruction;
use solana_sdk::message::{v0, Message, VersionedMessage};
use solana_sdk::pubkey::Pubkey;
use solana_sdk::signature::{Keypair, Signature};
use solana_sdk::signer::Signer;
use solana_sdk::transaction::VersionedTransaction;
use solana_transaction_status::UiTransactionEncoding;

use crate::constants::*;

#[derive(Debug, Clone, thiserror::Error)]
pub enum ExecError {
  #[error("simulation rejected: {0}")]
  SimFailed(String),
  #[error("send failed: {0}")]
  SendFailed(String),
  #[error("{op} timed out after {millis}ms")]
  Timeout { op: &'static str, millis: u64 },
  #[error("transaction failed on-chain: {0}")]
  TxFailed(String),
  #[error("confirmation unknown for {signature}")]
  Unknown { signature: String },
}

/// Lifecycle of one transaction through the pipeline.
///
/// ```text
/// Built -> Simulated -> Pending -> Confirmed
///            |            |-> Querying -> Confirmed | Failed | Unknown
///            |-> Rejected |-> Failed
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TxPhase {
  Built,
  Simulated,
  Pending,
  Querying,
  Confirmed,
  Rejected,
  Failed,
  Unknown,
}

/// Terminal result the caller acts on. UNKNOWN carries the signature so the
/// operator can verify externally; it is neither retried nor failed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ExecOutcome {
  Confirmed { signature: Signature },
  Rejected { reason: String },
  Failed { reason: String },
  Unknown { signature: Signature },
}

impl ExecOutcome {
  pub fn signature(&self) -> Option<Signature> {
    match self {
      ExecOutcome::Confirmed { signature } | ExecOutcome::Unknown { signature } => Some(*signature),
      _ => None,
    }
  }

  pub fn is_confirmed(&self) -> bool {
    matches!(self, ExecOutcome::Confirmed { .. })
  }
}

impl std::fmt::Display for ExecOutcome {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    match self {
      ExecOutcome::Confirmed { signature } => write!(f, "confirmed {}", signature),
      ExecOutcome::Rejected { reason } => write!(f, "rejected: {}", reason),
      ExecOutcome::Failed { reason } => write!(f, "failed: {}", reason),
      ExecOutcome::Unknown { signature } => write!(f, "unknown {}", signature),
    }
  }
}

/// Builds, simulates, signs, submits, and confirms one transaction.
/// Simulation failure is terminal; confirmation polls are bounded and roll
/// into a status-query phase before giving up as UNKNOWN.
pub struct TxPipeline {
  rpc: Arc<RpcClient>,
  ixs: Vec<Instruction>,
  legacy: bool,
  prior_fee_added: bool,
  phase: TxPhase,
}

impl TxPipeline {
  pub fn new(rpc: Arc<RpcClient>, legacy: bool) -> Self {
    Self {
      rpc,
      ixs: vec![],
      legacy,
      prior_fee_added: false,
      phase: TxPhase::Built,
    }
  }

  pub fn with_ixs(mut self, ixs: Vec<Instruction>) -> Self {
    self.ixs = ixs;
    self
  }

  pub fn add_ixs(&mut self, ixs: Vec<Instruction>) {
    self.ixs.extend(ixs);
  }

  pub fn phase(&self) -> TxPhase {
    self.phase
  }

  pub fn is_empty(&self) -> bool {
    self
      .ixs
      .iter()
      .all(|ix| ix.program_id == solana_sdk::compute_budget::id())
  }

  pub fn log_tx(sig: &Signature) {
    log::info!("Signature: https://solana.fm/tx/{}", sig)
  }

  async fn recent_priority_fee(&self, key: Pubkey) -> u64 {
    match self.rpc.get_recent_prioritization_fees(&[key]).await {
      Ok(response) => {
        let fees: Vec<u64> = response.iter().take(100).map(|x| x.prioritization_fee).collect();
        if fees.is_empty() {
          10_000
        } else {
          (fees.iter().sum::<u64>() / fees.len() as u64).max(10_000)
        }
      }
      Err(e) => {
        log::debug!("priority fee lookup failed, using floor: {:#}", e);
        10_000
      }
    }
  }

  /// Prepends the compute-budget price instruction once per pipeline.
  pub async fn with_priority_fee(&mut self, key: Pubkey) {
    if self.prior_fee_added {
      return;
    }
    let ul_per_cu = self.recent_priority_fee(key).await;
    self
      .ixs
      .insert(0, ComputeBudgetInstruction::set_compute_unit_price(ul_per_cu));
    self.prior_fee_added = true;
  }

  async fn build(&self, payer: &Keypair) -> anyhow::Result<VersionedTransaction> {
    let bh = tokio::time::timeout(RPC_SEND_TIMEOUT, self.rpc.get_latest_blockhash())
      .await
      .map_err(|_| ExecError::Timeout {
        op: "rpc.latest_blockhash",
        millis: RPC_SEND_TIMEOUT.as_millis() as u64,
      })??;
    let msg = if self.legacy {
      VersionedMessage::Legacy(Message::new_with_blockhash(
        self.ixs.as_ref(),
        Some(&payer.pubkey()),
        &bh,
      ))
    } else {
      VersionedMessage::V0(v0::Message::try_compile(
        &payer.pubkey(),
        self.ixs.as_slice(),
        &[],
        bh,
      )?)
    };
    Ok(VersionedTransaction::try_new(msg, &[payer])?)
  }

  /// Runs the whole state machine. Every terminal state maps onto an
  /// [`ExecOutcome`]; infrastructure failures before submission map to
  /// `Failed`.
  pub async fn execute(&mut self, payer: &Keypair) -> ExecOutcome {
    self.with_priority_fee(VENUE_PROGRAM_ID).await;

    let tx = match self.build(payer).await {
      Ok(tx) => tx,
      Err(e) => {
        self.phase = TxPhase::Failed;
        return ExecOutcome::Failed {
          reason: format!("build: {:#}", e),
        };
      }
    };

    // simulate; a simulation failure is a terminal reject, never retried
    let sim_config = RpcSimulateTransactionConfig {
      commitment: Some(CommitmentConfig::processed()),
      encoding: Some(UiTransactionEncoding::Base64),
      accounts: Some(RpcSimulateTransactionAccountsConfig {
        encoding: Some(UiAccountEncoding::Base64),
        addresses: vec![],
      }),
      ..Default::default()
    };
    let sim = tokio::time::timeout(
      RPC_SEND_TIMEOUT,
      self.rpc.simulate_transaction_with_config(&tx, sim_config),
    )
    .await;
    match sim {
      Err(_) => {
        self.phase = TxPhase::Failed;
        return ExecOutcome::Failed {
          reason: ExecError::Timeout {
            op: "rpc.simulate",
            millis: RPC_SEND_TIMEOUT.as_millis() as u64,
          }
          .to_string(),
        };
      }
      Ok(Err(e)) => {
        self.phase = TxPhase::Failed;
        return ExecOutcome::Failed {
          reason: format!("simulate: {:#}", e),
        };
      }
      Ok(Ok(res)) => {
        if let Some(err) = res.value.err {
          self.phase = TxPhase::Rejected;
          log::error!("simulation rejected: {:?} logs: {:#?}", err, res.value.logs);
          return ExecOutcome::Rejected {
            reason: ExecError::SimFailed(format!("{:?}", err)).to_string(),
          };
        }
      }
    }
    self.phase = TxPhase::Simulated;

    let send_config = RpcSendTransactionConfig {
      skip_preflight: true,
      ..Default::default()
    };
    let sig = match tokio::time::timeout(
      RPC_SEND_TIMEOUT,
      self.rpc.send_transaction_with_config(&tx, send_config),
    )
    .await
    {
      Err(_) => {
        self.phase = TxPhase::Failed;
        return ExecOutcome::Failed {
          reason: ExecError::Timeout {
            op: "rpc.send",
            millis: RPC_SEND_TIMEOUT.as_millis() as u64,
          }
          .to_string(),
        };
      }
      Ok(Err(e)) => {
        self.phase = TxPhase::Failed;
        return ExecOutcome::Failed {
          reason: ExecError::SendFailed(e.to_string()).to_string(),
        };
      }
      Ok(Ok(sig)) => sig,
    };
    self.phase = TxPhase::Pending;
    Self::log_tx(&sig);

    // bounded confirmation wait
    let deadline = Instant::now() + CONFIRM_TIMEOUT;
    while Instant::now() < deadline {
      match self.poll_status(&sig, false).await {
        Some(outcome) => return self.finish(outcome),
        None => tokio::time::sleep(CONFIRM_POLL_INTERVAL).await,
      }
    }

    // timed out; switch to the slower status-query phase
    self.phase = TxPhase::Querying;
    log::warn!("confirmation timed out, querying status of {}", sig);
    let deadline = Instant::now() + QUERY_WINDOW;
    while Instant::now() < deadline {
      match self.poll_status(&sig, true).await {
        Some(outcome) => return self.finish(outcome),
        None => tokio::time::sleep(QUERY_POLL_INTERVAL).await,
      }
    }

    self.phase = TxPhase::Unknown;
    log::error!(
      "transaction outcome unknown, verify externally: https://solana.fm/tx/{}",
      sig
    );
    ExecOutcome::Unknown { signature: sig }
  }

  async fn poll_status(&self, sig: &Signature, search_history: bool) -> Option<ExecOutcome> {
    let res = if search_history {
      self.rpc.get_signature_statuses_with_history(&[*sig]).await
    } else {
      self.rpc.get_signature_statuses(&[*sig]).await
    };
    let statuses = match res {
      Ok(res) => res.value,
      Err(e) => {
        log::warn!("status poll failed: {:#}", e);
        return None;
      }
    };
    let status = statuses.into_iter().next().flatten()?;
    if !status.satisfies_commitment(CommitmentConfig::confirmed()) {
      return None;
    }
    Some(match status.err {
      None => ExecOutcome::Confirmed { signature: *sig },
      Some(err) => ExecOutcome::Failed {
        reason: ExecError::TxFailed(format!("{:?}", err)).to_string(),
      },
    })
  }

  fn finish(&mut self, outcome: ExecOutcome) -> ExecOutcome {
    self.phase = match outcome {
      ExecOutcome::Confirmed { .. } => TxPhase::Confirmed,
      ExecOutcome::Rejected { .. } => TxPhase::Rejected,
      ExecOutcome::Failed { .. } => TxPhase::Failed,
      ExecOutcome::Unknown { .. } => TxPhase::Unknown,
    };
    outcome
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn pipeline_starts_built_and_empty() {
    let rpc = Arc::new(RpcClient::new("http://localhost:8899".to_string()));
    let p = TxPipeline::new(rpc, false);
    assert_eq!(p.phase(), TxPhase::Built);
    assert!(p.is_empty());
  }

  #[test]
  fn compute_budget_alone_is_still_empty() {
    let rpc = Arc::new(RpcClient::new("http://localhost:8899".to_string()));
    let mut p = TxPipeline::new(rpc, false);
    p.add_ixs(vec![ComputeBudgetInstruction::set_compute_unit_price(10_000)]);
    assert!(p.is_empty());
  }

  #[test]
  fn outcome_signatures_surface_for_confirmed_and_unknown() {
    let sig = Signature::default();
    assert!(ExecOutcome::Confirmed { signature: sig }.signature().is_some());
    assert!(ExecOutcome::Unknown { signature: sig }.signature().is_some());
    assert!(ExecOutcome::Failed {
      reason: "x".to_string()
    }
    .signature()
    .is_none());
    assert!(ExecOutcome::Confirmed { signature: sig }.is_confirmed());
  }

  #[test]
  fn timeout_errors_name_the_operation() {
    let e = ExecError::Timeout {
      op: "rpc.send",
      millis: 5_000,
    };
    assert_eq!(e.to_string(), "rpc.send timed out after 5000ms");
  }
}
