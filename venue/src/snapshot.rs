use std::collections::HashMap;

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;

use crate::codec::{raw_to_decimal, CodecError, UserRaw};
use crate::constants::{BASE_DECIMALS, FUNDING_DECIMALS, QUOTE_DECIMALS, QUOTE_SPOT_MARKET_INDEX};
use crate::oracle::PriceUpdate;
use crate::risk;
use crate::types::{
  perp_market_by_index, spot_market_by_index, AccountState, Position, Side, PERP_MARKETS,
};

#[derive(Debug, Clone, thiserror::Error)]
pub enum SnapshotError {
  #[error("unknown perp market index {0}")]
  UnknownPerpMarket(u16),
  #[error("unknown spot market index {0}")]
  UnknownSpotMarket(u16),
  #[error("no quote for perp market index {0}")]
  MissingQuote(u16),
  #[error(transparent)]
  Codec(#[from] CodecError),
}

/// Per-market pricing inputs for one snapshot build.
#[derive(Debug, Clone, Copy)]
pub struct MarketQuote {
  pub mark: PriceUpdate,
  /// Quote units accrued per base unit since venue genesis.
  pub cumulative_funding_rate: Decimal,
}

/// Everything one tick needs, read coherently: the rebalancer never mixes
/// two snapshots within a cycle.
#[derive(Debug, Clone)]
pub struct VenueSnapshot {
  pub state: AccountState,
  /// Wallet native plus venue spot deposits of the hedge market's base.
  pub spot_base: Decimal,
  pub native_balance: Decimal,
  pub mark: PriceUpdate,
  pub oracle: PriceUpdate,
  pub funding_rate_hourly: Decimal,
}

/// Builds the immutable [`AccountState`] for one tick. Errors propagate
/// unchanged; there are no partial snapshots.
pub fn build_account_state(
  user: &UserRaw,
  quotes: &HashMap<u16, MarketQuote>,
  now: DateTime<Utc>,
) -> Result<AccountState, SnapshotError> {
  // spot collateral, valued in quote units
  let mut spot_value = Decimal::ZERO;
  for slot in user.spot_positions.iter().filter(|s| !s.is_empty()) {
    let meta =
      spot_market_by_index(slot.market_index).ok_or(SnapshotError::UnknownSpotMarket(slot.market_index))?;
    let mut amount = raw_to_decimal(slot.scaled_balance as i128, meta.decimals)?;
    if slot.is_borrow() {
      amount = -amount;
    }
    if slot.market_index == QUOTE_SPOT_MARKET_INDEX {
      spot_value += amount;
    } else {
      let perp = PERP_MARKETS
        .iter()
        .find(|m| m.base_spot_index == slot.market_index)
        .ok_or(SnapshotError::UnknownSpotMarket(slot.market_index))?;
      let quote = quotes.get(&perp.index).ok_or(SnapshotError::MissingQuote(perp.index))?;
      spot_value += amount * quote.mark.price;
    }
  }

  struct Open {
    market_index: u16,
    size: Decimal,
    entry_price: Decimal,
    mark_price: Decimal,
    settled_pnl: Decimal,
    unsettled_pnl: Decimal,
    mmr: Decimal,
    imr: Decimal,
  }

  let mut opens: Vec<Open> = vec![];
  for slot in user.perp_positions.iter().filter(|p| p.base_asset_amount != 0) {
    let market = perp_market_by_index(slot.market_index)
      .ok_or(SnapshotError::UnknownPerpMarket(slot.market_index))?;
    let quote = quotes
      .get(&slot.market_index)
      .ok_or(SnapshotError::MissingQuote(slot.market_index))?;

    let size = raw_to_decimal(slot.base_asset_amount as i128, BASE_DECIMALS)?;
    let entry_notional = raw_to_decimal(slot.quote_entry_amount as i128, QUOTE_DECIMALS)?.abs();
    let entry_price = if size.is_zero() {
      Decimal::ZERO
    } else {
      entry_notional / size.abs()
    };
    let last_funding = raw_to_decimal(slot.last_cumulative_funding_rate as i128, FUNDING_DECIMALS)?;
    // funding accrues against the position: shorts earn a rising index
    let unsettled_pnl = (quote.cumulative_funding_rate - last_funding) * -size;

    opens.push(Open {
      market_index: slot.market_index,
      size,
      entry_price,
      mark_price: quote.mark.price,
      settled_pnl: raw_to_decimal(slot.settled_pnl as i128, QUOTE_DECIMALS)?,
      unsettled_pnl,
      mmr: market.margin_ratio_maintenance,
      imr: market.margin_ratio_initial,
    });
  }

  let unrealized_pnl: Decimal = opens.iter().map(|o| o.size * (o.mark_price - o.entry_price)).sum();
  let unsettled_total: Decimal = opens.iter().map(|o| o.unsettled_pnl).sum();
  let total_collateral = spot_value + unrealized_pnl + unsettled_total;

  let maintenance_margin: Decimal = opens
    .iter()
    .map(|o| (o.size * o.mark_price).abs() * o.mmr)
    .sum();
  let initial_margin: Decimal = opens.iter().map(|o| (o.size * o.mark_price).abs() * o.imr).sum();
  let total_notional: Decimal = opens.iter().map(|o| (o.size * o.mark_price).abs()).sum();

  let positions = opens
    .into_iter()
    .map(|o| {
      let side = if o.size > Decimal::ZERO { Side::Long } else { Side::Short };
      Position {
        market_index: o.market_index,
        side,
        liquidation_price: liquidation_price(side, o.entry_price, o.size, o.mmr, total_collateral),
        size: o.size,
        entry_price: o.entry_price,
        mark_price: o.mark_price,
        settled_pnl: o.settled_pnl,
        unsettled_pnl: o.unsettled_pnl,
      }
    })
    .collect();

  let free_collateral = (total_collateral - initial_margin).max(Decimal::ZERO);
  let leverage = if total_collateral > Decimal::ZERO {
    total_notional / total_collateral
  } else {
    Decimal::ZERO
  };

  Ok(AccountState {
    timestamp: now,
    health_ratio: risk::health_ratio(total_collateral, maintenance_margin),
    total_collateral,
    free_collateral,
    maintenance_margin,
    initial_margin,
    leverage,
    positions,
    unrealized_pnl,
  })
}

/// `entry * (1 +/- mmr * leverage_at_open)`, sign matching side. None when
/// the expression is nonpositive or collateral makes liquidation
/// unreachable.
fn liquidation_price(
  side: Side,
  entry_price: Decimal,
  size: Decimal,
  mmr: Decimal,
  total_collateral: Decimal,
) -> Option<Decimal> {
  if size.is_zero() || total_collateral <= Decimal::ZERO {
    return None;
  }
  let leverage_at_open = (size * entry_price).abs() / total_collateral;
  let liq = match side {
    Side::Short => entry_price * (Decimal::ONE + mmr * leverage_at_open),
    Side::Long => entry_price * (Decimal::ONE - mmr * leverage_at_open),
  };
  if liq <= Decimal::ZERO {
    None
  } else {
    Some(liq)
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::codec::{PerpPositionRaw, SpotPositionRaw};
  use crate::constants::NATIVE_SPOT_MARKET_INDEX;

  fn quote(mark: Decimal, cum_funding: Decimal) -> MarketQuote {
    MarketQuote {
      mark: PriceUpdate::new(mark, Utc::now()),
      cumulative_funding_rate: cum_funding,
    }
  }

  /// 5000 USDC collateral against a clean 10 SOL short at 150.
  fn hedged_user() -> UserRaw {
    let mut user = UserRaw::default();
    user.spot_positions[0] = SpotPositionRaw {
      scaled_balance: 5_000_000_000,
      cumulative_deposits: 5_000_000_000,
      market_index: QUOTE_SPOT_MARKET_INDEX,
      ..SpotPositionRaw::default()
    };
    user.perp_positions[0] = PerpPositionRaw {
      base_asset_amount: -10_000_000_000,
      quote_asset_amount: 1_500_000_000,
      quote_entry_amount: 1_500_000_000,
      market_index: 0,
      ..PerpPositionRaw::default()
    };
    user
  }

  #[test]
  fn clean_hedge_snapshot() {
    let user = hedged_user();
    let quotes = HashMap::from([(0u16, quote(Decimal::new(150, 0), Decimal::ZERO))]);
    let state = build_account_state(&user, &quotes, Utc::now()).unwrap();

    assert_eq!(state.total_collateral, Decimal::new(5_000, 0));
    assert_eq!(state.unrealized_pnl, Decimal::ZERO);
    // notional 1500 on 5000 collateral
    assert_eq!(state.leverage, Decimal::new(3, 1));
    // SOL-PERP maintenance ratio 5% => margin 75
    assert_eq!(state.maintenance_margin, Decimal::new(75, 0));
    assert_eq!(state.initial_margin, Decimal::new(150, 0));
    assert_eq!(state.free_collateral, Decimal::new(4_850, 0));
    assert_eq!(
      state.health_ratio,
      risk::health_ratio(state.total_collateral, state.maintenance_margin)
    );

    let pos = state.position(0).unwrap();
    assert_eq!(pos.side, Side::Short);
    assert_eq!(pos.size, Decimal::new(-10, 0));
    assert_eq!(pos.entry_price, Decimal::new(150, 0));
    // short liq sits above entry: 150 * (1 + 0.05 * 0.3)
    assert_eq!(pos.liquidation_price, Some(Decimal::new(152_25, 2)));
  }

  #[test]
  fn funding_index_delta_accrues_to_the_short() {
    let user = hedged_user();
    // index moved up 0.02 quote per base since last settle
    let quotes = HashMap::from([(0u16, quote(Decimal::new(150, 0), Decimal::new(2, 2)))]);
    let state = build_account_state(&user, &quotes, Utc::now()).unwrap();
    let pos = state.position(0).unwrap();
    // -(-10) * 0.02
    assert_eq!(pos.unsettled_pnl, Decimal::new(2, 1));
    assert_eq!(state.total_collateral, Decimal::new(5_000, 0) + Decimal::new(2, 1));
  }

  #[test]
  fn mark_move_against_the_short_shows_up_everywhere() {
    let user = hedged_user();
    let quotes = HashMap::from([(0u16, quote(Decimal::new(160, 0), Decimal::ZERO))]);
    let state = build_account_state(&user, &quotes, Utc::now()).unwrap();
    // short 10 from 150 to 160
    assert_eq!(state.unrealized_pnl, Decimal::new(-100, 0));
    assert_eq!(state.total_collateral, Decimal::new(4_900, 0));
  }

  #[test]
  fn base_spot_deposits_are_valued_at_mark() {
    let mut user = hedged_user();
    user.spot_positions[1] = SpotPositionRaw {
      scaled_balance: 2_000_000_000, // 2 SOL at 9 decimals
      cumulative_deposits: 2_000_000_000,
      market_index: NATIVE_SPOT_MARKET_INDEX,
      ..SpotPositionRaw::default()
    };
    let quotes = HashMap::from([(0u16, quote(Decimal::new(150, 0), Decimal::ZERO))]);
    let state = build_account_state(&user, &quotes, Utc::now()).unwrap();
    assert_eq!(state.total_collateral, Decimal::new(5_300, 0));
  }

  #[test]
  fn borrowed_spot_subtracts() {
    let mut user = hedged_user();
    user.spot_positions[1] = SpotPositionRaw {
      scaled_balance: 1_000_000_000,
      cumulative_deposits: 0,
      market_index: NATIVE_SPOT_MARKET_INDEX,
      balance_type: 1,
      ..SpotPositionRaw::default()
    };
    let quotes = HashMap::from([(0u16, quote(Decimal::new(150, 0), Decimal::ZERO))]);
    let state = build_account_state(&user, &quotes, Utc::now()).unwrap();
    assert_eq!(state.total_collateral, Decimal::new(4_850, 0));
  }

  #[test]
  fn deep_underwater_long_has_no_liquidation_price() {
    // mmr * leverage_at_open >= 1 pushes the long liq expression nonpositive
    assert_eq!(
      liquidation_price(
        Side::Long,
        Decimal::new(150, 0),
        Decimal::new(100, 0),
        Decimal::new(5, 1),
        Decimal::new(100, 0),
      ),
      None
    );
    // shorts always carry one
    assert!(liquidation_price(
      Side::Short,
      Decimal::new(150, 0),
      Decimal::new(-100, 0),
      Decimal::new(5, 1),
      Decimal::new(100, 0),
    )
    .is_some());
  }

  #[test]
  fn missing_quote_fails_whole_snapshot() {
    let user = hedged_user();
    let quotes = HashMap::new();
    assert!(matches!(
      build_account_state(&user, &quotes, Utc::now()),
      Err(SnapshotError::MissingQuote(0))
    ));
  }
}
