//! Simulated accounts.
//!
//! Two shapes: [`SimulatedAccount`] is cash-only (event contracts), while
//! [`FuturesAccount`] adds per-direction locked margin for hedge-mode
//! perpetuals. Invariants after every operation: cash and both margin locks
//! are non-negative, and `wallet_balance = cash + long_locked + short_locked`.

use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::error::{EngineError, EngineResult};

/// Direction of a hedge-mode position slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PositionSide {
    Long,
    Short,
}

impl PositionSide {
    pub fn as_str(self) -> &'static str {
        match self {
            PositionSide::Long => "long",
            PositionSide::Short => "short",
        }
    }
}

impl std::fmt::Display for PositionSide {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Cash delta of one trade, stamped with the balance after application.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TradeOutcome {
    pub pnl: Decimal,
    pub fees: Decimal,
    pub balance_after: Decimal,
}

impl TradeOutcome {
    pub fn new(pnl: Decimal, fees: Decimal) -> Self {
        Self {
            pnl,
            fees,
            balance_after: Decimal::ZERO,
        }
    }
}

/// Cash-only account for event-contract runs.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SimulatedAccount {
    cash: Decimal,
}

impl SimulatedAccount {
    pub fn new(initial_capital: Decimal) -> Self {
        Self {
            cash: initial_capital,
        }
    }

    pub fn cash(&self) -> Decimal {
        self.cash
    }

    /// Take a stake out of cash at contract open.
    pub fn debit_stake(&mut self, stake: Decimal) -> EngineResult<()> {
        if stake > self.cash {
            return Err(EngineError::insufficient_funds(stake, self.cash));
        }
        self.cash -= stake;
        Ok(())
    }

    /// Return a payout to cash at contract resolution.
    pub fn credit(&mut self, amount: Decimal) {
        self.cash += amount;
    }

    /// Apply a settled trade and stamp its post-trade balance.
    pub fn apply_trade_result(&mut self, outcome: &mut TradeOutcome) {
        self.cash += outcome.pnl;
        outcome.balance_after = self.cash;
    }
}

/// Hedge-mode futures account: cash plus independently locked margin per
/// direction.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FuturesAccount {
    cash: Decimal,
    long_margin_locked: Decimal,
    short_margin_locked: Decimal,
}

impl FuturesAccount {
    pub fn new(initial_capital: Decimal) -> Self {
        Self {
            cash: initial_capital,
            long_margin_locked: Decimal::ZERO,
            short_margin_locked: Decimal::ZERO,
        }
    }

    pub fn cash(&self) -> Decimal {
        self.cash
    }

    pub fn margin_locked_for(&self, side: PositionSide) -> Decimal {
        match side {
            PositionSide::Long => self.long_margin_locked,
            PositionSide::Short => self.short_margin_locked,
        }
    }

    pub fn margin_locked(&self) -> Decimal {
        self.long_margin_locked + self.short_margin_locked
    }

    pub fn wallet_balance(&self) -> Decimal {
        self.cash + self.margin_locked()
    }

    /// Move cash into a direction's margin lock.
    pub fn lock_margin(&mut self, amount: Decimal, side: PositionSide) -> EngineResult<()> {
        if amount > self.cash {
            return Err(EngineError::insufficient_funds(amount, self.cash));
        }
        self.cash -= amount;
        match side {
            PositionSide::Long => self.long_margin_locked += amount,
            PositionSide::Short => self.short_margin_locked += amount,
        }
        Ok(())
    }

    /// Return locked margin to cash.
    pub fn release_margin(&mut self, amount: Decimal, side: PositionSide) -> EngineResult<()> {
        let locked = self.margin_locked_for(side);
        if amount > locked {
            return Err(EngineError::insufficient_funds(amount, locked));
        }
        match side {
            PositionSide::Long => self.long_margin_locked -= amount,
            PositionSide::Short => self.short_margin_locked -= amount,
        }
        self.cash += amount;
        Ok(())
    }

    /// Deduct a fee from cash.
    pub fn apply_fee(&mut self, fee: Decimal) -> EngineResult<()> {
        if fee > self.cash {
            return Err(EngineError::insufficient_funds(fee, self.cash));
        }
        self.cash -= fee;
        Ok(())
    }

    /// Apply realized PnL to cash. Losses beyond the remaining cash are
    /// floored at zero; margin-bounded close flows never reach that floor.
    pub fn apply_pnl(&mut self, pnl: Decimal) {
        let next = self.cash + pnl;
        if next < Decimal::ZERO {
            warn!(%pnl, cash = %self.cash, "realized loss exceeds cash, flooring at zero");
            self.cash = Decimal::ZERO;
        } else {
            self.cash = next;
        }
    }

    pub fn apply_trade_result(&mut self, outcome: &mut TradeOutcome) {
        self.apply_pnl(outcome.pnl);
        outcome.balance_after = self.cash;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    #[test]
    fn simple_account_applies_trade_results() {
        let mut account = SimulatedAccount::new(dec!(1000));
        let mut outcome = TradeOutcome::new(dec!(80), Decimal::ZERO);
        account.apply_trade_result(&mut outcome);

        assert_eq!(account.cash(), dec!(1080));
        assert_eq!(outcome.balance_after, dec!(1080));
    }

    #[test]
    fn stake_debit_requires_cash() {
        let mut account = SimulatedAccount::new(dec!(50));
        assert!(matches!(
            account.debit_stake(dec!(100)),
            Err(EngineError::InsufficientFunds { .. })
        ));
        assert_eq!(account.cash(), dec!(50));

        account.debit_stake(dec!(50)).unwrap();
        assert_eq!(account.cash(), Decimal::ZERO);
    }

    #[test]
    fn lock_and_release_preserve_wallet_balance() {
        let mut account = FuturesAccount::new(dec!(10000));

        account.lock_margin(dec!(1000), PositionSide::Long).unwrap();
        assert_eq!(account.cash(), dec!(9000));
        assert_eq!(account.margin_locked_for(PositionSide::Long), dec!(1000));
        assert_eq!(account.wallet_balance(), dec!(10000));

        account.lock_margin(dec!(500), PositionSide::Short).unwrap();
        assert_eq!(account.margin_locked(), dec!(1500));
        assert_eq!(account.wallet_balance(), dec!(10000));

        account.release_margin(dec!(1000), PositionSide::Long).unwrap();
        assert_eq!(account.cash(), dec!(9500));
        assert_eq!(account.margin_locked_for(PositionSide::Long), Decimal::ZERO);
        assert_eq!(account.wallet_balance(), dec!(10000));
    }

    #[test]
    fn lock_rejects_more_than_cash() {
        let mut account = FuturesAccount::new(dec!(100));
        assert!(account.lock_margin(dec!(101), PositionSide::Long).is_err());
        assert_eq!(account.cash(), dec!(100));
        assert_eq!(account.margin_locked(), Decimal::ZERO);
    }

    #[test]
    fn release_rejects_more_than_locked_per_side() {
        let mut account = FuturesAccount::new(dec!(1000));
        account.lock_margin(dec!(300), PositionSide::Long).unwrap();

        assert!(account.release_margin(dec!(300), PositionSide::Short).is_err());
        assert!(account.release_margin(dec!(301), PositionSide::Long).is_err());
        assert!(account.release_margin(dec!(300), PositionSide::Long).is_ok());
    }

    #[test]
    fn fees_and_pnl_move_cash_only() {
        let mut account = FuturesAccount::new(dec!(10000));
        account.lock_margin(dec!(1000), PositionSide::Long).unwrap();

        account.apply_fee(dec!(4)).unwrap();
        assert_eq!(account.cash(), dec!(8996));
        assert_eq!(account.wallet_balance(), dec!(9996));

        account.apply_pnl(dec!(984.58));
        assert_eq!(account.cash(), dec!(9980.58));
        assert_eq!(account.margin_locked(), dec!(1000));
    }

    #[test]
    fn pnl_floor_keeps_cash_non_negative() {
        let mut account = FuturesAccount::new(dec!(100));
        account.apply_pnl(dec!(-150));
        assert_eq!(account.cash(), Decimal::ZERO);
    }

    #[test]
    fn fee_exceeding_cash_is_rejected() {
        let mut account = FuturesAccount::new(dec!(10));
        assert!(account.apply_fee(dec!(11)).is_err());
        assert_eq!(account.cash(), dec!(10));
    }
}
