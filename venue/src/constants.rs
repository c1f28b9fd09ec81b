use std::time::Duration;

use rust_decimal::Decimal;
use solana_sdk::pubkey;
use solana_sdk::pubkey::Pubkey;

pub const VENUE_PROGRAM_ID: Pubkey = pubkey!("AWcXc7anR1ZnsJDx9uj7FAfARtd1y8GDLvXqW2NPmuVi");
pub const USDC_MINT: Pubkey = pubkey!("E3mgmhykVLZnbs4An4wqycYhtKQGSJphkjePqWFc5xMm");

/// `sha256("account:User")[..8]`
pub const USER_DISCRIMINATOR: [u8; 8] = [159, 117, 95, 227, 239, 151, 58, 236];
/// `sha256("account:PerpMarket")[..8]`
pub const PERP_MARKET_DISCRIMINATOR: [u8; 8] = [10, 223, 12, 44, 107, 245, 55, 247];

pub const DEPOSIT_IX_DISCRIMINATOR: [u8; 8] = [242, 35, 198, 137, 82, 225, 242, 182];
pub const WITHDRAW_IX_DISCRIMINATOR: [u8; 8] = [183, 18, 70, 156, 148, 109, 161, 34];
pub const PLACE_PERP_ORDER_IX_DISCRIMINATOR: [u8; 8] = [69, 161, 93, 202, 120, 126, 76, 185];
pub const SETTLE_PNL_IX_DISCRIMINATOR: [u8; 8] = [43, 61, 234, 45, 15, 95, 152, 153];

/// Decimal exponents of the venue's raw integer units.
pub const BASE_DECIMALS: u32 = 9;
pub const QUOTE_DECIMALS: u32 = 6;
pub const PRICE_DECIMALS: u32 = 6;
pub const FUNDING_DECIMALS: u32 = 9;
pub const MARGIN_DECIMALS: u32 = 4;
pub const NATIVE_DECIMALS: u32 = 9;

/// User account layout. Fixed-size tables keep every field offset static;
/// the collateral read depends on these numbers, so they are defined once
/// here and locked by the codec tests.
pub const USER_HEADER_SIZE: usize = 80;
pub const SPOT_POSITION_SIZE: usize = 32;
pub const PERP_POSITION_SIZE: usize = 48;
pub const SPOT_POSITION_SLOTS: usize = 8;
pub const PERP_POSITION_SLOTS: usize = 8;
pub const SPOT_TABLE_OFFSET: usize = USER_HEADER_SIZE;
pub const PERP_TABLE_OFFSET: usize = SPOT_TABLE_OFFSET + SPOT_POSITION_SLOTS * SPOT_POSITION_SIZE;
pub const USER_ACCOUNT_SIZE: usize = PERP_TABLE_OFFSET + PERP_POSITION_SLOTS * PERP_POSITION_SIZE;
/// Byte offset of `spot_positions[0].scaled_balance`, the USDC collateral
/// entry. A prior keeper read this from the wrong offset and reported
/// collateral off by three orders of magnitude.
pub const FIRST_SPOT_BALANCE_OFFSET: usize = SPOT_TABLE_OFFSET;

pub const PERP_MARKET_ACCOUNT_SIZE: usize = 122;

pub const QUOTE_SPOT_MARKET_INDEX: u16 = 0;
pub const NATIVE_SPOT_MARKET_INDEX: u16 = 1;

/// Flat fee charged per transaction, in lamports.
pub const BASE_TX_FEE_LAMPORTS: u64 = 5_000;

/// Unsettled PnL at or below one quote unit is not worth a settlement
/// transaction.
pub const SETTLE_THRESHOLD_QUOTE: Decimal = Decimal::ONE;

pub const ORACLE_FETCH_TIMEOUT: Duration = Duration::from_secs(1);
pub const RPC_SEND_TIMEOUT: Duration = Duration::from_secs(5);
pub const CONFIRM_TIMEOUT: Duration = Duration::from_secs(30);
pub const CONFIRM_POLL_INTERVAL: Duration = Duration::from_millis(500);
pub const QUERY_WINDOW: Duration = Duration::from_secs(30);
pub const QUERY_POLL_INTERVAL: Duration = Duration::from_secs(5);
pub const RECONNECT_INTERVAL: Duration = Duration::from_secs(10);
pub const SHUTDOWN_GRACE: Duration = Duration::from_secs(30);

pub const DEFAULT_ORACLE_STALE_MS: i64 = 300;
