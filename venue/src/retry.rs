use std::future::Future;
use std::time::Duration;

use crate::codec::CodecError;
use crate::executor::ExecError;
use crate::oracle::OracleError;
use crate::snapshot::SnapshotError;
use crate::types::{Coded, CriticalFailure};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorClass {
  Validation,
  Transient,
  Protocol,
  Critical,
}

/// Failure classification drives whether a retry is allowed. Anything not
/// recognised is assumed to be network weather.
pub fn classify(err: &anyhow::Error) -> ErrorClass {
  if err.downcast_ref::<CriticalFailure>().is_some() {
    return ErrorClass::Critical;
  }
  if err.downcast_ref::<Coded>().is_some() {
    return ErrorClass::Validation;
  }
  if let Some(e) = err.downcast_ref::<ExecError>() {
    return match e {
      ExecError::SimFailed(_) | ExecError::TxFailed(_) => ErrorClass::Protocol,
      ExecError::Timeout { .. } | ExecError::SendFailed(_) => ErrorClass::Transient,
      ExecError::Unknown { .. } => ErrorClass::Protocol,
    };
  }
  if let Some(e) = err.downcast_ref::<OracleError>() {
    return match e {
      OracleError::Unreachable { .. } | OracleError::Stale { .. } => ErrorClass::Transient,
    };
  }
  if err.downcast_ref::<CodecError>().is_some() {
    return ErrorClass::Protocol;
  }
  if err.downcast_ref::<SnapshotError>().is_some() {
    return ErrorClass::Protocol;
  }
  ErrorClass::Transient
}

#[derive(Debug, Clone)]
pub struct RetryPolicy {
  pub max_attempts: usize,
  pub backoff: Vec<Duration>,
}

impl RetryPolicy {
  pub fn new(max_attempts: usize, backoff: Vec<Duration>) -> Self {
    Self {
      max_attempts,
      backoff,
    }
  }

  /// Vault reconciliation: 3 attempts, 1s / 2s / 4s.
  pub fn vault_sync() -> Self {
    Self::new(
      3,
      vec![
        Duration::from_secs(1),
        Duration::from_secs(2),
        Duration::from_secs(4),
      ],
    )
  }

  /// Initial account subscription: exponential, capped at 8s.
  pub fn subscription() -> Self {
    Self::new(
      4,
      vec![
        Duration::from_secs(1),
        Duration::from_secs(2),
        Duration::from_secs(4),
        Duration::from_secs(8),
      ],
    )
  }

  fn delay(&self, attempt: usize) -> Duration {
    self
      .backoff
      .get(attempt)
      .or(self.backoff.last())
      .copied()
      .unwrap_or(Duration::from_secs(1))
  }
}

/// Runs `f` until it succeeds, the classifier stops it, or attempts are
/// exhausted. One WARNING per failed attempt, one error bubbled at the end
/// for the caller to report.
pub async fn retry<T, F, Fut>(policy: &RetryPolicy, op: &str, mut f: F) -> anyhow::Result<T>
where
  F: FnMut() -> Fut,
  Fut: Future<Output = anyhow::Result<T>>,
{
  let mut last_err = None;
  for attempt in 0..policy.max_attempts {
    match f().await {
      Ok(v) => return Ok(v),
      Err(e) => {
        let class = classify(&e);
        if class != ErrorClass::Transient {
          log::warn!("{} failed without retry ({:?}): {:#}", op, class, e);
          return Err(e);
        }
        log::warn!(
          "{} attempt {}/{} failed: {:#}",
          op,
          attempt + 1,
          policy.max_attempts,
          e
        );
        last_err = Some(e);
        if attempt + 1 < policy.max_attempts {
          tokio::time::sleep(policy.delay(attempt)).await;
        }
      }
    }
  }
  Err(last_err.unwrap_or_else(|| anyhow::anyhow!("{} failed with no attempts", op)))
}
