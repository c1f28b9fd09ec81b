use std::collections::HashMap;
use std::sync::Arc;

use borsh::{BorshDeserialize, BorshSerialize};
use rust_decimal::Decimal;
use solana_client::nonblocking::rpc_client::RpcClient;
use solana_sdk::commitment_config::CommitmentConfig;
use solana_sdk::instruction::{AccountMeta, Instruction};
use solana_sdk::pubkey::Pubkey;
use solana_sdk::signature::Keypair;
use solana_sdk::signer::Signer;

use crate::codec::{decode_perp_market, raw_to_decimal, PerpMarketRaw};
use crate::constants::*;
use crate::types::{Side, PERP_MARKETS};

#[derive(BorshSerialize, BorshDeserialize, Debug, Clone, Copy, PartialEq, Eq)]
pub enum OrderDirection {
  Long,
  Short,
}

impl From<Side> for OrderDirection {
  fn from(side: Side) -> Self {
    match side {
      Side::Long => OrderDirection::Long,
      Side::Short => OrderDirection::Short,
    }
  }
}

/// Market-order parameters as the venue program takes them.
#[derive(BorshSerialize, BorshDeserialize, Debug, Clone, Copy, PartialEq, Eq)]
pub struct OrderParams {
  pub market_index: u16,
  pub direction: OrderDirection,
  /// `BASE_DECIMALS` fixed point.
  pub base_asset_amount: u64,
  /// Worst acceptable fill at `PRICE_DECIMALS`; the keeper always sets one.
  pub price_limit: u64,
  pub reduce_only: bool,
}

#[derive(BorshSerialize, BorshDeserialize, Debug, Clone, Copy, PartialEq, Eq)]
struct DepositArgs {
  market_index: u16,
  amount: u64,
  reduce_only: bool,
}

#[derive(BorshSerialize, BorshDeserialize, Debug, Clone, Copy, PartialEq, Eq)]
struct WithdrawArgs {
  market_index: u16,
  amount: u64,
}

#[derive(BorshSerialize, BorshDeserialize, Debug, Clone, Copy, PartialEq, Eq)]
struct SettlePnlArgs {
  market_index: u16,
}

fn ix_data<T: BorshSerialize>(discriminator: [u8; 8], args: &T) -> Vec<u8> {
  let mut data = discriminator.to_vec();
  // fixed-size arg structs cannot fail to serialize
  data.extend_from_slice(&args.try_to_vec().unwrap_or_default());
  data
}

pub struct VenueUtils;

impl VenueUtils {
  pub fn user_pda(authority: &Pubkey, sub_account_id: u16) -> Pubkey {
    let seeds: &[&[u8]] = &[
      b"user",
      &authority.to_bytes()[..],
      &sub_account_id.to_le_bytes(),
    ];
    Pubkey::find_program_address(seeds, &VENUE_PROGRAM_ID).0
  }

  pub fn state_pda() -> Pubkey {
    Pubkey::find_program_address(&[b"venue_state"], &VENUE_PROGRAM_ID).0
  }

  pub fn perp_market_pda(market_index: u16) -> Pubkey {
    Pubkey::find_program_address(
      &[b"perp_market", &market_index.to_le_bytes()],
      &VENUE_PROGRAM_ID,
    )
    .0
  }

  pub fn spot_market_pda(market_index: u16) -> Pubkey {
    Pubkey::find_program_address(
      &[b"spot_market", &market_index.to_le_bytes()],
      &VENUE_PROGRAM_ID,
    )
    .0
  }

  pub fn spot_market_vault(market_index: u16) -> Pubkey {
    Pubkey::find_program_address(
      &[b"spot_market_vault", &market_index.to_le_bytes()],
      &VENUE_PROGRAM_ID,
    )
    .0
  }

  pub fn decode_name(name: &[u8; 32]) -> String {
    String::from_utf8_lossy(name).trim_end_matches('\0').trim().to_string()
  }

  pub fn encode_name(name: &str) -> [u8; 32] {
    let mut bytes = [0_u8; 32];
    let len = name.len().min(32);
    bytes[..len].copy_from_slice(&name.as_bytes()[..len]);
    bytes
  }
}

/// Thin handle over the venue program for one sub-account. Holds the signer
/// behind an [`Arc`] and never inspects or logs key material.
pub struct VenueClient {
  signer: Arc<Keypair>,
  rpc: Arc<RpcClient>,
  pub sub_account: Pubkey,
}

impl VenueClient {
  pub fn new(signer: Arc<Keypair>, rpc: Arc<RpcClient>, sub_account_id: u16) -> Self {
    let sub_account = VenueUtils::user_pda(&signer.pubkey(), sub_account_id);
    Self {
      signer,
      rpc,
      sub_account,
    }
  }

  pub fn rpc(&self) -> Arc<RpcClient> {
    self.rpc.clone()
  }

  pub fn signer(&self) -> Arc<Keypair> {
    self.signer.clone()
  }

  pub fn authority(&self) -> Pubkey {
    self.signer.pubkey()
  }

  /// Perp market account keys for every registry market.
  pub fn market_keys(&self) -> HashMap<u16, Pubkey> {
    PERP_MARKETS
      .iter()
      .map(|m| (m.index, VenueUtils::perp_market_pda(m.index)))
      .collect()
  }

  /// Raw user record bytes, `None` when the account does not exist yet.
  pub async fn user_account_raw(&self) -> anyhow::Result<Option<Vec<u8>>> {
    let res = tokio::time::timeout(
      RPC_SEND_TIMEOUT,
      self
        .rpc
        .get_account_with_commitment(&self.sub_account, CommitmentConfig::confirmed()),
    )
    .await
    .map_err(|_| crate::executor::ExecError::Timeout {
      op: "rpc.get_account",
      millis: RPC_SEND_TIMEOUT.as_millis() as u64,
    })??;
    Ok(res.value.map(|a| a.data))
  }

  pub async fn native_balance(&self) -> anyhow::Result<Decimal> {
    let lamports = self.rpc.get_balance(&self.signer.pubkey()).await?;
    Ok(raw_to_decimal(lamports as i128, NATIVE_DECIMALS)?)
  }

  pub async fn perp_market(&self, market_index: u16) -> anyhow::Result<PerpMarketRaw> {
    let key = VenueUtils::perp_market_pda(market_index);
    let account = self.rpc.get_account(&key).await?;
    Ok(decode_perp_market(&account.data)?)
  }

  pub fn deposit_ix(&self, spot_market_index: u16, amount_raw: u64) -> Instruction {
    Instruction {
      program_id: VENUE_PROGRAM_ID,
      accounts: vec![
        AccountMeta::new_readonly(VenueUtils::state_pda(), false),
        AccountMeta::new(self.sub_account, false),
        AccountMeta::new(self.signer.pubkey(), true),
        AccountMeta::new(VenueUtils::spot_market_vault(spot_market_index), false),
      ],
      data: ix_data(
        DEPOSIT_IX_DISCRIMINATOR,
        &DepositArgs {
          market_index: spot_market_index,
          amount: amount_raw,
          reduce_only: false,
        },
      ),
    }
  }

  pub fn withdraw_ix(&self, spot_market_index: u16, amount_raw: u64) -> Instruction {
    Instruction {
      program_id: VENUE_PROGRAM_ID,
      accounts: vec![
        AccountMeta::new_readonly(VenueUtils::state_pda(), false),
        AccountMeta::new(self.sub_account, false),
        AccountMeta::new(self.signer.pubkey(), true),
        AccountMeta::new(VenueUtils::spot_market_vault(spot_market_index), false),
      ],
      data: ix_data(
        WITHDRAW_IX_DISCRIMINATOR,
        &WithdrawArgs {
          market_index: spot_market_index,
          amount: amount_raw,
        },
      ),
    }
  }

  pub fn place_perp_order_ix(&self, params: OrderParams) -> Instruction {
    Instruction {
      program_id: VENUE_PROGRAM_ID,
      accounts: vec![
        AccountMeta::new_readonly(VenueUtils::state_pda(), false),
        AccountMeta::new(self.sub_account, false),
        AccountMeta::new(self.signer.pubkey(), true),
        AccountMeta::new(VenueUtils::perp_market_pda(params.market_index), false),
      ],
      data: ix_data(PLACE_PERP_ORDER_IX_DISCRIMINATOR, &params),
    }
  }

  pub fn settle_pnl_ix(&self, market_index: u16) -> Instruction {
    Instruction {
      program_id: VENUE_PROGRAM_ID,
      accounts: vec![
        AccountMeta::new_readonly(VenueUtils::state_pda(), false),
        AccountMeta::new(self.sub_account, false),
        AccountMeta::new(self.signer.pubkey(), true),
        AccountMeta::new(VenueUtils::perp_market_pda(market_index), false),
      ],
      data: ix_data(SETTLE_PNL_IX_DISCRIMINATOR, &SettlePnlArgs { market_index }),
    }
  }
}

pub fn read_keypair_from_env(env_var: &str) -> anyhow::Result<Keypair> {
  let raw = std::env::var(env_var)
    .map_err(|e| anyhow::anyhow!("Failed to get {} from env: {}", env_var, e))?;
  let bytes: Vec<u8> = raw
    .trim_matches(|c| c == '[' || c == ']')
    .split(',')
    .filter_map(|s| s.trim().parse().ok())
    .collect();
  Ok(Keypair::from_bytes(&bytes)?)
}

#[cfg(test)]
mod tests {
  use super::*;

  fn client() -> VenueClient {
    let signer = Arc::new(Keypair::new());
    let rpc = Arc::new(RpcClient::new("http://localhost:8899".to_string()));
    VenueClient::new(signer, rpc, 0)
  }

  #[test]
  fn pdas_are_deterministic_and_distinct() {
    let auth = Pubkey::new_unique();
    assert_eq!(VenueUtils::user_pda(&auth, 0), VenueUtils::user_pda(&auth, 0));
    assert_ne!(VenueUtils::user_pda(&auth, 0), VenueUtils::user_pda(&auth, 1));
    assert_ne!(VenueUtils::perp_market_pda(0), VenueUtils::spot_market_pda(0));
    assert_ne!(VenueUtils::spot_market_pda(0), VenueUtils::spot_market_vault(0));
  }

  #[test]
  fn order_ix_carries_discriminator_and_args() {
    let c = client();
    let params = OrderParams {
      market_index: 0,
      direction: OrderDirection::Short,
      base_asset_amount: 500_000_000,
      price_limit: 149_850_000,
      reduce_only: false,
    };
    let ix = c.place_perp_order_ix(params);
    assert_eq!(ix.program_id, VENUE_PROGRAM_ID);
    assert_eq!(ix.data[..8], PLACE_PERP_ORDER_IX_DISCRIMINATOR);
    let decoded = OrderParams::try_from_slice(&ix.data[8..]).unwrap();
    assert_eq!(decoded, params);
    // the authority signs, the user account is written
    assert!(ix.accounts.iter().any(|a| a.is_signer && a.pubkey == c.authority()));
    assert!(ix.accounts.iter().any(|a| a.is_writable && a.pubkey == c.sub_account));
  }

  #[test]
  fn deposit_and_withdraw_target_the_spot_vault() {
    let c = client();
    let vault = VenueUtils::spot_market_vault(QUOTE_SPOT_MARKET_INDEX);
    for ix in [
      c.deposit_ix(QUOTE_SPOT_MARKET_INDEX, 1_000_000),
      c.withdraw_ix(QUOTE_SPOT_MARKET_INDEX, 1_000_000),
    ] {
      assert!(ix.accounts.iter().any(|a| a.pubkey == vault));
    }
    assert_eq!(
      c.deposit_ix(0, 1).data[..8],
      DEPOSIT_IX_DISCRIMINATOR
    );
    assert_eq!(
      c.withdraw_ix(0, 1).data[..8],
      WITHDRAW_IX_DISCRIMINATOR
    );
  }

  #[test]
  fn market_names_roundtrip() {
    let encoded = VenueUtils::encode_name("SOL-PERP");
    assert_eq!(VenueUtils::decode_name(&encoded), "SOL-PERP");
  }
}
