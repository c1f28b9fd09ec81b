use borsh::{BorshDeserialize, BorshSerialize};
use rust_decimal::Decimal;
use solana_sdk::pubkey::Pubkey;

use crate::constants::*;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum CodecError {
  #[error("account data truncated: {have} bytes, expected {need}")]
  Truncated { have: usize, need: usize },
  #[error("unknown account discriminator: {0:?}")]
  BadDiscriminator([u8; 8]),
  #[error("malformed account payload: {0}")]
  Malformed(String),
  #[error("value {value} does not fit precision {precision}")]
  OutOfRange { value: i128, precision: u32 },
}

/// One spot-balance slot of the user record. 32 bytes.
#[derive(BorshSerialize, BorshDeserialize, Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SpotPositionRaw {
  /// Token amount scaled by the spot market's decimals.
  pub scaled_balance: u64,
  pub cumulative_deposits: i64,
  pub market_index: u16,
  /// 0 = deposit, 1 = borrow.
  pub balance_type: u8,
  pub open_orders: u8,
  pub padding: [u8; 12],
}

impl SpotPositionRaw {
  pub fn is_empty(&self) -> bool {
    self.scaled_balance == 0 && self.open_orders == 0
  }

  pub fn is_borrow(&self) -> bool {
    self.balance_type == 1
  }
}

/// One perp-position slot of the user record. 48 bytes.
#[derive(BorshSerialize, BorshDeserialize, Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PerpPositionRaw {
  /// Signed base amount; short positions are negative.
  pub base_asset_amount: i64,
  pub quote_asset_amount: i64,
  pub quote_entry_amount: i64,
  pub settled_pnl: i64,
  pub last_cumulative_funding_rate: i64,
  pub market_index: u16,
  pub open_orders: u8,
  pub padding: [u8; 5],
}

impl PerpPositionRaw {
  pub fn is_empty(&self) -> bool {
    self.base_asset_amount == 0 && self.quote_asset_amount == 0 && self.open_orders == 0
  }
}

/// The venue's user record, minus the 8-byte discriminator prefix.
///
/// Every table is fixed-size so each field sits at a static byte offset;
/// the offsets in [`crate::constants`] are locked by tests below.
#[derive(BorshSerialize, BorshDeserialize, Debug, Clone, Copy, PartialEq, Eq)]
pub struct UserRaw {
  pub authority: Pubkey,
  pub delegate: Pubkey,
  pub sub_account_id: u16,
  pub status: u8,
  pub padding: [u8; 5],
  pub spot_positions: [SpotPositionRaw; SPOT_POSITION_SLOTS],
  pub perp_positions: [PerpPositionRaw; PERP_POSITION_SLOTS],
}

impl Default for UserRaw {
  fn default() -> Self {
    Self {
      authority: Pubkey::default(),
      delegate: Pubkey::default(),
      sub_account_id: 0,
      status: 0,
      padding: [0; 5],
      spot_positions: [SpotPositionRaw::default(); SPOT_POSITION_SLOTS],
      perp_positions: [PerpPositionRaw::default(); PERP_POSITION_SLOTS],
    }
  }
}

impl UserRaw {
  pub fn spot_position(&self, market_index: u16) -> Option<&SpotPositionRaw> {
    self
      .spot_positions
      .iter()
      .find(|p| p.market_index == market_index && !p.is_empty())
  }

  pub fn perp_position(&self, market_index: u16) -> Option<&PerpPositionRaw> {
    self
      .perp_positions
      .iter()
      .find(|p| p.market_index == market_index && !p.is_empty())
  }
}

/// The venue's perp-market record, minus the discriminator prefix.
#[derive(BorshSerialize, BorshDeserialize, Debug, Clone, Copy, PartialEq, Eq)]
pub struct PerpMarketRaw {
  pub market_index: u16,
  pub name: [u8; 32],
  pub oracle: Pubkey,
  /// `PRICE_DECIMALS` fixed point.
  pub mark_price: i64,
  pub oracle_price: i64,
  /// Unix milliseconds of the last oracle publish.
  pub oracle_unix_ms: i64,
  /// `FUNDING_DECIMALS` fixed point.
  pub cumulative_funding_rate: i64,
  pub funding_rate_hourly: i64,
  /// `MARGIN_DECIMALS` fixed point.
  pub margin_ratio_initial: u32,
  pub margin_ratio_maintenance: u32,
}

fn read_discriminator(bytes: &[u8], need: usize) -> Result<[u8; 8], CodecError> {
  if bytes.len() < need {
    return Err(CodecError::Truncated {
      have: bytes.len(),
      need,
    });
  }
  let mut discrim = [0u8; 8];
  discrim.copy_from_slice(&bytes[..8]);
  Ok(discrim)
}

pub fn decode_user(bytes: &[u8]) -> Result<UserRaw, CodecError> {
  let discrim = read_discriminator(bytes, USER_ACCOUNT_SIZE)?;
  if discrim != USER_DISCRIMINATOR {
    return Err(CodecError::BadDiscriminator(discrim));
  }
  let mut payload = &bytes[8..USER_ACCOUNT_SIZE];
  UserRaw::deserialize(&mut payload).map_err(|e| CodecError::Malformed(e.to_string()))
}

pub fn encode_user(user: &UserRaw) -> Result<Vec<u8>, CodecError> {
  let mut bytes = USER_DISCRIMINATOR.to_vec();
  let payload = user
    .try_to_vec()
    .map_err(|e| CodecError::Malformed(e.to_string()))?;
  bytes.extend_from_slice(&payload);
  debug_assert_eq!(bytes.len(), USER_ACCOUNT_SIZE);
  Ok(bytes)
}

pub fn decode_perp_market(bytes: &[u8]) -> Result<PerpMarketRaw, CodecError> {
  let discrim = read_discriminator(bytes, PERP_MARKET_ACCOUNT_SIZE)?;
  if discrim != PERP_MARKET_DISCRIMINATOR {
    return Err(CodecError::BadDiscriminator(discrim));
  }
  let mut payload = &bytes[8..PERP_MARKET_ACCOUNT_SIZE];
  PerpMarketRaw::deserialize(&mut payload).map_err(|e| CodecError::Malformed(e.to_string()))
}

pub fn encode_perp_market(market: &PerpMarketRaw) -> Result<Vec<u8>, CodecError> {
  let mut bytes = PERP_MARKET_DISCRIMINATOR.to_vec();
  let payload = market
    .try_to_vec()
    .map_err(|e| CodecError::Malformed(e.to_string()))?;
  bytes.extend_from_slice(&payload);
  debug_assert_eq!(bytes.len(), PERP_MARKET_ACCOUNT_SIZE);
  Ok(bytes)
}

/// Exact `value / 10^precision`. Integer mantissa in, integer mantissa out;
/// no binary floating point touches money.
pub fn raw_to_decimal(value: i128, precision: u32) -> Result<Decimal, CodecError> {
  Decimal::try_from_i128_with_scale(value, precision)
    .map_err(|_| CodecError::OutOfRange { value, precision })
}

/// Exact `value * 10^precision`, truncated toward zero. The caller is
/// responsible for any slippage padding before the truncation.
pub fn decimal_to_raw(value: Decimal, precision: u32) -> Result<i128, CodecError> {
  if precision > 28 {
    return Err(CodecError::OutOfRange {
      value: value.mantissa(),
      precision,
    });
  }
  let truncated = value.trunc_with_scale(precision);
  let shift = precision.saturating_sub(truncated.scale());
  let factor = 10i128
    .checked_pow(shift)
    .ok_or(CodecError::OutOfRange {
      value: truncated.mantissa(),
      precision,
    })?;
  truncated
    .mantissa()
    .checked_mul(factor)
    .ok_or(CodecError::OutOfRange {
      value: truncated.mantissa(),
      precision,
    })
}
