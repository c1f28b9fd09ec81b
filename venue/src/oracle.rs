use std::collections::HashMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use solana_client::nonblocking::rpc_client::RpcClient;
use solana_sdk::pubkey::Pubkey;
use tokio::sync::RwLock;

use crate::codec::{decode_perp_market, raw_to_decimal};
use crate::constants::{ORACLE_FETCH_TIMEOUT, PRICE_DECIMALS};

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct PriceUpdate {
  pub price: Decimal,
  pub fetched_at: DateTime<Utc>,
}

impl PriceUpdate {
  pub fn new(price: Decimal, fetched_at: DateTime<Utc>) -> Self {
    Self { price, fetched_at }
  }

  pub fn age_ms(&self, now: DateTime<Utc>) -> i64 {
    (now - self.fetched_at).num_milliseconds()
  }
}

#[derive(Debug, Clone, thiserror::Error)]
pub enum OracleError {
  #[error("oracle unreachable for market {market_index}: {reason}")]
  Unreachable { market_index: u16, reason: String },
  #[error("oracle stale for market {market_index}: age {age_ms}ms > {threshold_ms}ms")]
  Stale {
    market_index: u16,
    age_ms: i64,
    threshold_ms: i64,
  },
}

/// Staleness predicate used by the safety gate. Equality is fresh.
pub fn is_fresh(oracle_age_ms: i64, threshold_ms: i64) -> bool {
  oracle_age_ms <= threshold_ms
}

/// Mark and oracle price per perp market index. The RPC variant reads the
/// perp-market account; the fixed variant serves pinned prices for paper
/// mode and tests. No retries at this layer; retrying is the caller's call.
pub enum Oracle {
  Rpc {
    rpc: Arc<RpcClient>,
    /// perp market index -> perp market account key
    market_keys: HashMap<u16, Pubkey>,
    stale_ms: i64,
  },
  Fixed {
    prices: RwLock<HashMap<u16, FixedQuote>>,
  },
}

#[derive(Debug, Clone, Copy)]
pub struct FixedQuote {
  pub mark: PriceUpdate,
  pub oracle: PriceUpdate,
}

impl Oracle {
  pub fn rpc(rpc: Arc<RpcClient>, market_keys: HashMap<u16, Pubkey>, stale_ms: i64) -> Self {
    Oracle::Rpc {
      rpc,
      market_keys,
      stale_ms,
    }
  }

  pub fn fixed() -> Self {
    Oracle::Fixed {
      prices: RwLock::new(HashMap::new()),
    }
  }

  pub async fn pin(&self, market_index: u16, quote: FixedQuote) {
    if let Oracle::Fixed { prices } = self {
      prices.write().await.insert(market_index, quote);
    }
  }

  pub async fn mark_price(&self, market_index: u16) -> Result<PriceUpdate, OracleError> {
    match self {
      Oracle::Fixed { prices } => Ok(
        prices
          .read()
          .await
          .get(&market_index)
          .ok_or(OracleError::Unreachable {
            market_index,
            reason: "no pinned price".to_string(),
          })?
          .mark,
      ),
      Oracle::Rpc { .. } => {
        let (raw, fetched_at) = self.fetch(market_index).await?;
        Ok(PriceUpdate::new(
          raw_to_decimal(raw.mark_price as i128, PRICE_DECIMALS).map_err(|e| {
            OracleError::Unreachable {
              market_index,
              reason: e.to_string(),
            }
          })?,
          fetched_at,
        ))
      }
    }
  }

  pub async fn oracle_price(&self, market_index: u16) -> Result<PriceUpdate, OracleError> {
    match self {
      Oracle::Fixed { prices } => Ok(
        prices
          .read()
          .await
          .get(&market_index)
          .ok_or(OracleError::Unreachable {
            market_index,
            reason: "no pinned price".to_string(),
          })?
          .oracle,
      ),
      Oracle::Rpc { stale_ms, .. } => {
        let (raw, _) = self.fetch(market_index).await?;
        let published = DateTime::<Utc>::from_timestamp_millis(raw.oracle_unix_ms).ok_or(
          OracleError::Unreachable {
            market_index,
            reason: format!("bad oracle timestamp {}", raw.oracle_unix_ms),
          },
        )?;
        let age_ms = (Utc::now() - published).num_milliseconds();
        if !is_fresh(age_ms, *stale_ms) {
          return Err(OracleError::Stale {
            market_index,
            age_ms,
            threshold_ms: *stale_ms,
          });
        }
        Ok(PriceUpdate::new(
          raw_to_decimal(raw.oracle_price as i128, PRICE_DECIMALS).map_err(|e| {
            OracleError::Unreachable {
              market_index,
              reason: e.to_string(),
            }
          })?,
          published,
        ))
      }
    }
  }

  async fn fetch(
    &self,
    market_index: u16,
  ) -> Result<(crate::codec::PerpMarketRaw, DateTime<Utc>), OracleError> {
    let Oracle::Rpc { rpc, market_keys, .. } = self else {
      return Err(OracleError::Unreachable {
        market_index,
        reason: "fixed oracle has no rpc".to_string(),
      });
    };
    let key = market_keys.get(&market_index).ok_or(OracleError::Unreachable {
      market_index,
      reason: "unknown market".to_string(),
    })?;
    let account = tokio::time::timeout(ORACLE_FETCH_TIMEOUT, rpc.get_account(key))
      .await
      .map_err(|_| OracleError::Unreachable {
        market_index,
        reason: format!("fetch timed out after {:?}", ORACLE_FETCH_TIMEOUT),
      })?
      .map_err(|e| OracleError::Unreachable {
        market_index,
        reason: e.to_string(),
      })?;
    let raw = decode_perp_market(&account.data).map_err(|e| OracleError::Unreachable {
      market_index,
      reason: e.to_string(),
    })?;
    Ok((raw, Utc::now()))
  }
}
