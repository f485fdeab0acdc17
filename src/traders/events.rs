//! Event-contract trader: fixed-stake binary bets resolved against a single
//! bar.
//!
//! `UP`/`DOWN` are the canonical actions; the long/short/buy/sell aliases are
//! rewritten here and nowhere else. The stake is debited at open, the bet
//! resolves when the bar closes, and ties (`close == open`) lose the stake:
//! the issuer keeps the spread.

use chrono::TimeZone;
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use serde::{Deserialize, Serialize};
use tracing::debug;
use uuid::Uuid;

use crate::accounts::{SimulatedAccount, TradeOutcome};
use crate::data::types::Kline;
use crate::error::EngineResult;
use crate::report::TradeRecord;
use crate::strategy::{SignalAction, StrategySignal};

/// Parameters of an event-contract run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EventsTradeConfig {
    pub symbol: String,
    /// Stake used when the signal carries no quantity.
    pub investment_amount: Decimal,
    /// Winning payout factor. `>= 1` means the stake comes back multiplied;
    /// `(0, 1)` means the stake comes back plus `stake * multiplier`.
    pub payout_multiplier: Decimal,
}

impl EventsTradeConfig {
    pub fn new(symbol: impl Into<String>) -> Self {
        Self {
            symbol: symbol.into(),
            investment_amount: dec!(100),
            payout_multiplier: dec!(1.8),
        }
    }

    pub fn with_stake(mut self, stake: Decimal) -> Self {
        self.investment_amount = stake;
        self
    }

    pub fn with_payout(mut self, multiplier: Decimal) -> Self {
        self.payout_multiplier = multiplier;
        self
    }
}

/// Canonical event-contract direction after alias rewriting.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum EventDirection {
    Up,
    Down,
}

#[derive(Debug, Default)]
pub struct EventsTrader;

impl EventsTrader {
    pub fn new() -> Self {
        Self
    }

    fn direction(action: SignalAction) -> Option<EventDirection> {
        match action {
            SignalAction::Up | SignalAction::Long | SignalAction::Buy => Some(EventDirection::Up),
            SignalAction::Down | SignalAction::Short | SignalAction::Sell => {
                Some(EventDirection::Down)
            }
            _ => None,
        }
    }

    /// Stake, resolve, and settle one signal against the current bar.
    /// Non-directional actions (HOLD, close family) are no-ops.
    pub fn execute(
        &self,
        signal: &StrategySignal,
        bar: &Kline,
        account: &mut SimulatedAccount,
        cfg: &EventsTradeConfig,
    ) -> EngineResult<(TradeOutcome, Option<TradeRecord>)> {
        signal.validate()?;
        let Some(direction) = Self::direction(signal.action) else {
            return Ok((TradeOutcome::default(), None));
        };

        let stake = if signal.quantity > Decimal::ZERO {
            signal.quantity
        } else {
            cfg.investment_amount
        };
        account.debit_stake(stake)?;

        let win = match direction {
            EventDirection::Up => bar.close > bar.open,
            EventDirection::Down => bar.close < bar.open,
        };

        let pnl = if win {
            let multiplier = cfg.payout_multiplier;
            let payout = if multiplier >= Decimal::ONE {
                stake * multiplier
            } else {
                stake + stake * multiplier
            };
            account.credit(payout);
            payout - stake
        } else {
            -stake
        };

        let mut outcome = TradeOutcome::new(pnl, Decimal::ZERO);
        outcome.balance_after = account.cash();

        debug!(
            symbol = %cfg.symbol,
            direction = ?direction,
            %stake,
            win,
            %pnl,
            "event contract resolved"
        );

        let record = TradeRecord {
            trade_id: Uuid::new_v4().to_string(),
            symbol: cfg.symbol.clone(),
            action: match direction {
                EventDirection::Up => "up".to_string(),
                EventDirection::Down => "down".to_string(),
            },
            entry_time: bar.open_datetime(),
            entry_price: bar.open,
            exit_time: Some(
                chrono::Utc
                    .timestamp_millis_opt(bar.close_time)
                    .single()
                    .unwrap_or_else(|| bar.open_datetime()),
            ),
            exit_price: Some(bar.close),
            quantity: stake,
            pnl,
            pnl_pct: if stake.is_zero() { Decimal::ZERO } else { pnl / stake },
            fees: Decimal::ZERO,
            holding_period_secs: Some((bar.close_time - bar.open_time) / 1000),
            reason: if win { "win".to_string() } else { "loss".to_string() },
        };

        Ok((outcome, Some(record)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::EngineError;

    fn bar(open: Decimal, close: Decimal) -> Kline {
        Kline {
            open_time: 0,
            open,
            high: open.max(close),
            low: open.min(close),
            close,
            volume: dec!(1),
            close_time: 59_999,
            quote_volume: None,
            trade_count: None,
        }
    }

    fn cfg() -> EventsTradeConfig {
        EventsTradeConfig::new("BTC/USDT")
    }

    fn up_signal(stake: Decimal) -> StrategySignal {
        StrategySignal::new(SignalAction::Up, "BTC/USDT").with_quantity(stake)
    }

    #[test]
    fn up_win_pays_out() {
        // Scenario E1: open 100, close 110, stake 100, payout 1.8.
        let trader = EventsTrader::new();
        let mut account = SimulatedAccount::new(dec!(1000));

        let (outcome, record) = trader
            .execute(&up_signal(dec!(100)), &bar(dec!(100), dec!(110)), &mut account, &cfg())
            .unwrap();

        assert_eq!(outcome.pnl, dec!(80));
        assert_eq!(account.cash(), dec!(1080));
        let record = record.unwrap();
        assert_eq!(record.pnl, dec!(80));
        assert_eq!(record.reason, "win");
        assert_eq!(record.action, "up");
    }

    #[test]
    fn up_loss_forfeits_stake() {
        // Scenario E2: open 100, close 95.
        let trader = EventsTrader::new();
        let mut account = SimulatedAccount::new(dec!(1000));

        let (outcome, record) = trader
            .execute(&up_signal(dec!(100)), &bar(dec!(100), dec!(95)), &mut account, &cfg())
            .unwrap();

        assert_eq!(outcome.pnl, dec!(-100));
        assert_eq!(account.cash(), dec!(900));
        assert_eq!(record.unwrap().reason, "loss");
    }

    #[test]
    fn tie_loses_the_stake() {
        let trader = EventsTrader::new();
        let mut account = SimulatedAccount::new(dec!(1000));

        let (outcome, _) = trader
            .execute(&up_signal(dec!(100)), &bar(dec!(100), dec!(100)), &mut account, &cfg())
            .unwrap();
        assert_eq!(outcome.pnl, dec!(-100));
    }

    #[test]
    fn down_wins_on_falling_bar() {
        let trader = EventsTrader::new();
        let mut account = SimulatedAccount::new(dec!(1000));
        let signal =
            StrategySignal::new(SignalAction::Down, "BTC/USDT").with_quantity(dec!(50));

        let (outcome, record) = trader
            .execute(&signal, &bar(dec!(100), dec!(95)), &mut account, &cfg())
            .unwrap();
        assert_eq!(outcome.pnl, dec!(40));
        assert_eq!(record.unwrap().action, "down");
    }

    #[test]
    fn aliases_map_at_the_trader_boundary() {
        let trader = EventsTrader::new();
        for action in [SignalAction::Long, SignalAction::Buy] {
            let mut account = SimulatedAccount::new(dec!(1000));
            let signal = StrategySignal::new(action, "BTC/USDT").with_quantity(dec!(100));
            let (outcome, record) = trader
                .execute(&signal, &bar(dec!(100), dec!(110)), &mut account, &cfg())
                .unwrap();
            assert_eq!(outcome.pnl, dec!(80));
            assert_eq!(record.unwrap().action, "up");
        }

        for action in [SignalAction::Short, SignalAction::Sell] {
            let mut account = SimulatedAccount::new(dec!(1000));
            let signal = StrategySignal::new(action, "BTC/USDT").with_quantity(dec!(100));
            let (_, record) = trader
                .execute(&signal, &bar(dec!(100), dec!(110)), &mut account, &cfg())
                .unwrap();
            assert_eq!(record.unwrap().action, "down");
        }
    }

    #[test]
    fn fractional_multiplier_returns_stake_plus_gain() {
        let trader = EventsTrader::new();
        let mut account = SimulatedAccount::new(dec!(1000));
        let config = cfg().with_payout(dec!(0.8));

        let (outcome, _) = trader
            .execute(&up_signal(dec!(100)), &bar(dec!(100), dec!(110)), &mut account, &config)
            .unwrap();
        // stake back + 100 * 0.8
        assert_eq!(outcome.pnl, dec!(80));
        assert_eq!(account.cash(), dec!(1080));
    }

    #[test]
    fn default_stake_from_config() {
        let trader = EventsTrader::new();
        let mut account = SimulatedAccount::new(dec!(1000));
        let signal = StrategySignal::new(SignalAction::Up, "BTC/USDT");

        let (outcome, record) = trader
            .execute(&signal, &bar(dec!(100), dec!(110)), &mut account, &cfg())
            .unwrap();
        assert_eq!(record.unwrap().quantity, dec!(100));
        assert_eq!(outcome.pnl, dec!(80));
    }

    #[test]
    fn hold_and_close_are_no_ops() {
        let trader = EventsTrader::new();
        let mut account = SimulatedAccount::new(dec!(1000));

        for action in [SignalAction::Hold, SignalAction::Close, SignalAction::CloseLong] {
            let signal = StrategySignal::new(action, "BTC/USDT");
            let (outcome, record) = trader
                .execute(&signal, &bar(dec!(100), dec!(110)), &mut account, &cfg())
                .unwrap();
            assert_eq!(outcome.pnl, Decimal::ZERO);
            assert!(record.is_none());
        }
        assert_eq!(account.cash(), dec!(1000));
    }

    #[test]
    fn insufficient_cash_aborts_the_bet() {
        let trader = EventsTrader::new();
        let mut account = SimulatedAccount::new(dec!(40));

        let err = trader
            .execute(&up_signal(dec!(100)), &bar(dec!(100), dec!(110)), &mut account, &cfg())
            .unwrap_err();
        assert!(matches!(err, EngineError::InsufficientFunds { .. }));
        assert_eq!(account.cash(), dec!(40));
    }
}
