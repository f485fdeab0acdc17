//! Hedge-mode futures position manager.
//!
//! Per symbol, at most one LONG and one SHORT position live simultaneously,
//! each with its own margin and stop orders. Fills use the last price plus
//! slippage; PnL, liquidation and stop triggers use mark prices. In replay
//! over pure OHLCV the bar substitutes for the mark stream: unrealized PnL
//! marks at the close, stop triggers evaluate against the bar extremes.

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};
use uuid::Uuid;

use crate::accounts::{FuturesAccount, PositionSide};
use crate::config::TradingConfig;
use crate::data::types::Kline;
use crate::error::{EngineError, EngineResult};
use crate::report::TradeRecord;
use crate::strategy::StrategySignal;

/// Sizing and fill parameters for futures trades.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FuturesTradeConfig {
    pub symbol: String,
    pub leverage: u32,
    /// Fraction of available cash committed as margin under default sizing.
    pub position_size_pct: Decimal,
    pub taker_fee: Decimal,
    pub maker_fee: Decimal,
    pub slippage: Decimal,
    pub maintenance_margin_ratio: Decimal,
    /// Trailing-stop offset from the favorable extreme; `None` disables it.
    pub trailing_stop_pct: Option<Decimal>,
}

impl FuturesTradeConfig {
    pub fn from_trading(symbol: impl Into<String>, trading: &TradingConfig) -> Self {
        Self {
            symbol: symbol.into(),
            leverage: trading.default_leverage,
            position_size_pct: trading.default_position_size_pct,
            taker_fee: trading.taker_fee,
            maker_fee: trading.maker_fee,
            slippage: trading.slippage,
            maintenance_margin_ratio: trading.maintenance_margin_ratio,
            trailing_stop_pct: None,
        }
    }
}

/// Why a position was closed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CloseReason {
    Signal,
    Liquidation,
    StopLoss,
    TakeProfit,
    TrailingStop,
    SessionEnd,
    RiskCritical,
    Cancelled,
}

impl CloseReason {
    pub fn as_str(self) -> &'static str {
        match self {
            CloseReason::Signal => "signal",
            CloseReason::Liquidation => "liquidation",
            CloseReason::StopLoss => "stop_loss",
            CloseReason::TakeProfit => "take_profit",
            CloseReason::TrailingStop => "trailing_stop",
            CloseReason::SessionEnd => "session_end",
            CloseReason::RiskCritical => "risk_critical",
            CloseReason::Cancelled => "cancelled",
        }
    }
}

/// One open hedge-mode position.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FuturesPosition {
    pub symbol: String,
    pub side: PositionSide,
    /// Fill price including slippage.
    pub entry_price: Decimal,
    pub size: Decimal,
    pub leverage: u32,
    pub margin: Decimal,
    pub entry_time: DateTime<Utc>,
    pub entry_fee: Decimal,
    pub unrealized_pnl: Decimal,
    pub liquidation_price: Decimal,
    pub stop_loss: Option<Decimal>,
    pub take_profit: Option<Decimal>,
    /// Current trailing-stop trigger price, if trailing is configured.
    pub trailing_stop: Option<Decimal>,
    pub highest_price: Decimal,
    pub lowest_price: Decimal,
}

impl FuturesPosition {
    pub fn notional(&self) -> Decimal {
        self.entry_price * self.size
    }
}

/// A stop-order hit awaiting the standard close path.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct StopTrigger {
    pub side: PositionSide,
    pub reason: CloseReason,
    /// Mark price at which the trigger fired (bar extreme in replay).
    pub trigger_price: Decimal,
}

/// Hedge slots for one symbol.
#[derive(Debug, Clone, Default)]
pub struct HedgePositionManager {
    symbol: String,
    long: Option<FuturesPosition>,
    short: Option<FuturesPosition>,
}

impl HedgePositionManager {
    pub fn new(symbol: impl Into<String>) -> Self {
        Self {
            symbol: symbol.into(),
            long: None,
            short: None,
        }
    }

    pub fn symbol(&self) -> &str {
        &self.symbol
    }

    pub fn position(&self, side: PositionSide) -> Option<&FuturesPosition> {
        match side {
            PositionSide::Long => self.long.as_ref(),
            PositionSide::Short => self.short.as_ref(),
        }
    }

    pub fn has_position(&self, side: PositionSide) -> bool {
        self.position(side).is_some()
    }

    pub fn has_any_position(&self) -> bool {
        self.long.is_some() || self.short.is_some()
    }

    pub fn open_positions(&self) -> Vec<&FuturesPosition> {
        self.long.iter().chain(self.short.iter()).collect()
    }

    /// Net-visible size: positive long, negative short.
    pub fn net_size(&self) -> Decimal {
        let long = self.long.as_ref().map_or(Decimal::ZERO, |p| p.size);
        let short = self.short.as_ref().map_or(Decimal::ZERO, |p| p.size);
        long - short
    }

    pub fn total_margin(&self) -> Decimal {
        self.open_positions().iter().map(|p| p.margin).sum()
    }

    pub fn total_unrealized_pnl(&self) -> Decimal {
        self.open_positions().iter().map(|p| p.unrealized_pnl).sum()
    }

    fn slot_mut(&mut self, side: PositionSide) -> &mut Option<FuturesPosition> {
        match side {
            PositionSide::Long => &mut self.long,
            PositionSide::Short => &mut self.short,
        }
    }

    /// Open a position into the `side` slot.
    ///
    /// Margin defaults to `cash * position_size_pct`; a non-zero
    /// `signal.quantity` is a USDT notional and overrides it. The fill is the
    /// last price adjusted by slippage, the entry fee is taker on notional,
    /// and the liquidation price embeds the leverage and maintenance ratio.
    pub fn open(
        &mut self,
        signal: &StrategySignal,
        price: Decimal,
        time: DateTime<Utc>,
        side: PositionSide,
        account: &mut FuturesAccount,
        cfg: &FuturesTradeConfig,
    ) -> EngineResult<&FuturesPosition> {
        if self.has_position(side) {
            return Err(EngineError::duplicate_position(&self.symbol, side.as_str()));
        }
        signal.validate()?;
        if price <= Decimal::ZERO {
            return Err(EngineError::InvalidSignal(format!(
                "non-positive price {price}"
            )));
        }

        let leverage = Decimal::from(cfg.leverage);
        let margin = if signal.quantity > Decimal::ZERO {
            signal.quantity / leverage
        } else {
            account.cash() * cfg.position_size_pct
        };
        if margin <= Decimal::ZERO {
            return Err(EngineError::insufficient_funds(margin, account.cash()));
        }

        let notional = margin * leverage;
        let fill_price = match side {
            PositionSide::Long => price * (Decimal::ONE + cfg.slippage),
            PositionSide::Short => price * (Decimal::ONE - cfg.slippage),
        };
        let size = notional / fill_price;
        let entry_fee = notional * cfg.taker_fee;

        account.lock_margin(margin, side)?;
        if let Err(err) = account.apply_fee(entry_fee) {
            // Roll the margin lock back so the failed open leaves no trace.
            account.release_margin(margin, side)?;
            return Err(err);
        }

        let inverse_leverage = Decimal::ONE / leverage;
        let liquidation_price = match side {
            PositionSide::Long => {
                fill_price * (Decimal::ONE - inverse_leverage + cfg.maintenance_margin_ratio)
            }
            PositionSide::Short => {
                fill_price * (Decimal::ONE + inverse_leverage - cfg.maintenance_margin_ratio)
            }
        };

        let trailing_stop = cfg.trailing_stop_pct.map(|pct| match side {
            PositionSide::Long => fill_price * (Decimal::ONE - pct),
            PositionSide::Short => fill_price * (Decimal::ONE + pct),
        });

        let position = FuturesPosition {
            symbol: self.symbol.clone(),
            side,
            entry_price: fill_price,
            size,
            leverage: cfg.leverage,
            margin,
            entry_time: time,
            entry_fee,
            unrealized_pnl: Decimal::ZERO,
            liquidation_price,
            stop_loss: signal.stop_loss,
            take_profit: signal.take_profit,
            trailing_stop,
            highest_price: fill_price,
            lowest_price: fill_price,
        };
        debug!(
            symbol = %self.symbol,
            side = %side,
            entry = %fill_price,
            size = %size,
            %margin,
            liq = %liquidation_price,
            "opened position"
        );

        Ok(self.slot_mut(side).insert(position))
    }

    /// Close the `side` slot at the given reference price.
    pub fn close(
        &mut self,
        side: PositionSide,
        price: Decimal,
        time: DateTime<Utc>,
        account: &mut FuturesAccount,
        cfg: &FuturesTradeConfig,
        reason: CloseReason,
    ) -> EngineResult<TradeRecord> {
        let position = self
            .slot_mut(side)
            .take()
            .ok_or_else(|| EngineError::position_not_found(&self.symbol, side.as_str()))?;

        let fill_price = match side {
            PositionSide::Long => price * (Decimal::ONE - cfg.slippage),
            PositionSide::Short => price * (Decimal::ONE + cfg.slippage),
        };

        let mut realized = match side {
            PositionSide::Long => (fill_price - position.entry_price) * position.size,
            PositionSide::Short => (position.entry_price - fill_price) * position.size,
        };
        // Losses are bounded by the position's margin (bankruptcy floor);
        // marks beyond the liquidation price cannot claw back more.
        if realized < -position.margin {
            warn!(
                symbol = %self.symbol,
                side = %side,
                %realized,
                margin = %position.margin,
                "loss past bankruptcy price, clamping to margin"
            );
            realized = -position.margin;
        }

        let exit_fee = fill_price * position.size * cfg.taker_fee;
        account.release_margin(position.margin, side)?;
        account.apply_pnl(realized - exit_fee);

        let pnl = realized - exit_fee - position.entry_fee;
        let pnl_pct = if position.margin.is_zero() {
            Decimal::ZERO
        } else {
            pnl / position.margin
        };

        debug!(
            symbol = %self.symbol,
            side = %side,
            exit = %fill_price,
            %pnl,
            reason = reason.as_str(),
            "closed position"
        );

        Ok(TradeRecord {
            trade_id: Uuid::new_v4().to_string(),
            symbol: position.symbol,
            action: format!("close_{}", side.as_str()),
            entry_time: position.entry_time,
            entry_price: position.entry_price,
            exit_time: Some(time),
            exit_price: Some(fill_price),
            quantity: position.size,
            pnl,
            pnl_pct,
            fees: position.entry_fee + exit_fee,
            holding_period_secs: Some((time - position.entry_time).num_seconds()),
            reason: reason.as_str().to_string(),
        })
    }

    /// Flush both slots, LONG first.
    pub fn close_all(
        &mut self,
        price: Decimal,
        time: DateTime<Utc>,
        account: &mut FuturesAccount,
        cfg: &FuturesTradeConfig,
        reason: CloseReason,
    ) -> EngineResult<Vec<TradeRecord>> {
        let mut records = Vec::new();
        for side in [PositionSide::Long, PositionSide::Short] {
            if self.has_position(side) {
                records.push(self.close(side, price, time, account, cfg, reason)?);
            }
        }
        Ok(records)
    }

    /// Refresh unrealized PnL at the mark, extend the observed extremes and
    /// re-derive trailing-stop prices.
    pub fn mark_to_market(&mut self, mark: Decimal, high: Decimal, low: Decimal, cfg: &FuturesTradeConfig) {
        for slot in [&mut self.long, &mut self.short] {
            let Some(position) = slot.as_mut() else {
                continue;
            };
            position.unrealized_pnl = match position.side {
                PositionSide::Long => (mark - position.entry_price) * position.size,
                PositionSide::Short => (position.entry_price - mark) * position.size,
            };
            if high > position.highest_price {
                position.highest_price = high;
            }
            if low < position.lowest_price {
                position.lowest_price = low;
            }
            if let Some(pct) = cfg.trailing_stop_pct {
                position.trailing_stop = Some(match position.side {
                    PositionSide::Long => position.highest_price * (Decimal::ONE - pct),
                    PositionSide::Short => position.lowest_price * (Decimal::ONE + pct),
                });
            }
        }
    }

    /// Evaluate stop orders against a bar, at most one trigger per slot.
    ///
    /// Adverse-side triggers (liquidation, stop-loss, trailing) test the
    /// bar's adverse extreme, take-profit the favorable one; the returned
    /// trigger price is that extreme. Priority within a slot: liquidation,
    /// stop-loss, take-profit, trailing stop.
    pub fn check_stop_orders(&self, bar: &Kline) -> Vec<StopTrigger> {
        let mut triggers = Vec::new();
        for position in self.open_positions() {
            let (adverse, favorable) = match position.side {
                PositionSide::Long => (bar.low, bar.high),
                PositionSide::Short => (bar.high, bar.low),
            };
            let adverse_hit = |level: Decimal| match position.side {
                PositionSide::Long => adverse <= level,
                PositionSide::Short => adverse >= level,
            };
            let favorable_hit = |level: Decimal| match position.side {
                PositionSide::Long => favorable >= level,
                PositionSide::Short => favorable <= level,
            };

            let reason = if adverse_hit(position.liquidation_price) {
                Some((CloseReason::Liquidation, adverse))
            } else if position.stop_loss.is_some_and(&adverse_hit) {
                Some((CloseReason::StopLoss, adverse))
            } else if position.take_profit.is_some_and(&favorable_hit) {
                Some((CloseReason::TakeProfit, favorable))
            } else if position.trailing_stop.is_some_and(&adverse_hit) {
                Some((CloseReason::TrailingStop, adverse))
            } else {
                None
            };

            if let Some((reason, trigger_price)) = reason {
                triggers.push(StopTrigger {
                    side: position.side,
                    reason,
                    trigger_price,
                });
            }
        }
        triggers
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::strategy::SignalAction;
    use chrono::TimeZone;
    use rust_decimal_macros::dec;

    fn cfg() -> FuturesTradeConfig {
        FuturesTradeConfig {
            symbol: "BTC/USDT".to_string(),
            leverage: 10,
            position_size_pct: dec!(0.1),
            taker_fee: dec!(0.0004),
            maker_fee: dec!(0.0002),
            slippage: dec!(0.0005),
            maintenance_margin_ratio: dec!(0.004),
            trailing_stop_pct: None,
        }
    }

    fn time() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap()
    }

    fn long_signal() -> StrategySignal {
        StrategySignal::new(SignalAction::Long, "BTC/USDT")
    }

    fn bar(open: Decimal, high: Decimal, low: Decimal, close: Decimal) -> Kline {
        Kline {
            open_time: 0,
            open,
            high,
            low,
            close,
            volume: dec!(1),
            close_time: 59_999,
            quote_volume: None,
            trade_count: None,
        }
    }

    fn approx(a: Decimal, b: Decimal) {
        assert!((a - b).abs() < dec!(0.0001), "{a} != {b}");
    }

    #[test]
    fn open_long_margin_math() {
        let mut manager = HedgePositionManager::new("BTC/USDT");
        let mut account = FuturesAccount::new(dec!(10000));

        let position = manager
            .open(
                &long_signal(),
                dec!(100),
                time(),
                PositionSide::Long,
                &mut account,
                &cfg(),
            )
            .unwrap()
            .clone();

        assert_eq!(position.margin, dec!(1000));
        assert_eq!(position.entry_price, dec!(100.05));
        approx(position.size, dec!(99.9500));
        assert_eq!(position.entry_fee, dec!(4));
        // liq = 100.05 * (1 - 0.1 + 0.004)
        approx(position.liquidation_price, dec!(90.4452));
        assert_eq!(position.highest_price, position.entry_price);
        assert_eq!(position.lowest_price, position.entry_price);

        assert_eq!(account.cash(), dec!(8996));
        assert_eq!(account.margin_locked_for(PositionSide::Long), dec!(1000));
        assert_eq!(account.wallet_balance(), dec!(9996));
    }

    #[test]
    fn duplicate_same_side_open_is_rejected() {
        let mut manager = HedgePositionManager::new("BTC/USDT");
        let mut account = FuturesAccount::new(dec!(10000));
        let config = cfg();

        manager
            .open(&long_signal(), dec!(100), time(), PositionSide::Long, &mut account, &config)
            .unwrap();

        let err = manager
            .open(&long_signal(), dec!(101), time(), PositionSide::Long, &mut account, &config)
            .unwrap_err();
        assert!(matches!(err, EngineError::DuplicatePosition { .. }));

        // The opposite slot stays available: hedge mode.
        assert!(manager
            .open(&long_signal(), dec!(100), time(), PositionSide::Short, &mut account, &config)
            .is_ok());
        assert!(manager.has_position(PositionSide::Long));
        assert!(manager.has_position(PositionSide::Short));
    }

    #[test]
    fn close_long_in_profit_scenario() {
        // Scenario F1: 10000 initial, 10% sizing, 10x, entry 100, exit 110.
        let mut manager = HedgePositionManager::new("BTC/USDT");
        let mut account = FuturesAccount::new(dec!(10000));
        let config = cfg();

        manager
            .open(&long_signal(), dec!(100), time(), PositionSide::Long, &mut account, &config)
            .unwrap();
        let record = manager
            .close(
                PositionSide::Long,
                dec!(110),
                time(),
                &mut account,
                &config,
                CloseReason::Signal,
            )
            .unwrap();

        assert_eq!(record.exit_price, Some(dec!(109.945)));
        // realized = (109.945 - 100.05) * 99.95002... = 989.0055,
        // exit fee = 4.3956, entry fee = 4
        approx(record.pnl, dec!(980.6099));
        approx(account.wallet_balance(), dec!(10980.6099));
        approx(record.pnl_pct, dec!(0.98061));
        assert_eq!(account.margin_locked(), Decimal::ZERO);
        assert!(!manager.has_any_position());
    }

    #[test]
    fn wallet_matches_initial_plus_trade_pnl() {
        let mut manager = HedgePositionManager::new("BTC/USDT");
        let mut account = FuturesAccount::new(dec!(10000));
        let config = cfg();

        manager
            .open(&long_signal(), dec!(100), time(), PositionSide::Long, &mut account, &config)
            .unwrap();
        let record = manager
            .close(
                PositionSide::Long,
                dec!(97),
                time(),
                &mut account,
                &config,
                CloseReason::Signal,
            )
            .unwrap();

        assert!(record.pnl < Decimal::ZERO);
        assert_eq!(account.wallet_balance(), dec!(10000) + record.pnl);
    }

    #[test]
    fn close_without_position_is_not_found() {
        let mut manager = HedgePositionManager::new("BTC/USDT");
        let mut account = FuturesAccount::new(dec!(10000));

        let err = manager
            .close(
                PositionSide::Short,
                dec!(100),
                time(),
                &mut account,
                &cfg(),
                CloseReason::Signal,
            )
            .unwrap_err();
        assert!(matches!(err, EngineError::PositionNotFound { .. }));
    }

    #[test]
    fn liquidation_outranks_stop_loss() {
        // Scenario F2: no slippage so the liquidation price is exactly 90.4.
        let mut manager = HedgePositionManager::new("BTC/USDT");
        let mut account = FuturesAccount::new(dec!(10000));
        let mut config = cfg();
        config.slippage = Decimal::ZERO;

        let signal = long_signal().with_stops(Some(dec!(95)), None);
        let position = manager
            .open(&signal, dec!(100), time(), PositionSide::Long, &mut account, &config)
            .unwrap();
        assert_eq!(position.liquidation_price, dec!(90.4));

        // Bar low pierces both the stop-loss (95) and the liquidation price.
        let triggers = manager.check_stop_orders(&bar(dec!(95), dec!(96), dec!(90), dec!(91)));
        assert_eq!(triggers.len(), 1);
        assert_eq!(triggers[0].reason, CloseReason::Liquidation);
        assert_eq!(triggers[0].trigger_price, dec!(90));

        let record = manager
            .close(
                triggers[0].side,
                triggers[0].trigger_price,
                time(),
                &mut account,
                &config,
                triggers[0].reason,
            )
            .unwrap();
        assert_eq!(record.reason, "liquidation");
        // Loss is bounded by the margin.
        assert!(record.pnl >= -dec!(1000) - record.fees);
    }

    #[test]
    fn stop_loss_fires_on_adverse_extreme_only() {
        let mut manager = HedgePositionManager::new("BTC/USDT");
        let mut account = FuturesAccount::new(dec!(10000));
        let config = cfg();

        let signal = long_signal().with_stops(Some(dec!(95)), Some(dec!(120)));
        manager
            .open(&signal, dec!(100), time(), PositionSide::Long, &mut account, &config)
            .unwrap();

        // Low stays above the stop: nothing fires.
        assert!(manager
            .check_stop_orders(&bar(dec!(100), dec!(101), dec!(96), dec!(100)))
            .is_empty());

        // Low touches 95: stop-loss fires at the extreme.
        let triggers = manager.check_stop_orders(&bar(dec!(100), dec!(101), dec!(94.5), dec!(100)));
        assert_eq!(triggers[0].reason, CloseReason::StopLoss);
        assert_eq!(triggers[0].trigger_price, dec!(94.5));
    }

    #[test]
    fn take_profit_fires_on_favorable_extreme() {
        let mut manager = HedgePositionManager::new("BTC/USDT");
        let mut account = FuturesAccount::new(dec!(10000));
        let config = cfg();

        let signal = long_signal().with_stops(None, Some(dec!(110)));
        manager
            .open(&signal, dec!(100), time(), PositionSide::Long, &mut account, &config)
            .unwrap();

        let triggers = manager.check_stop_orders(&bar(dec!(100), dec!(111), dec!(99), dec!(105)));
        assert_eq!(triggers[0].reason, CloseReason::TakeProfit);
        assert_eq!(triggers[0].trigger_price, dec!(111));
    }

    #[test]
    fn short_stops_mirror_long() {
        let mut manager = HedgePositionManager::new("BTC/USDT");
        let mut account = FuturesAccount::new(dec!(10000));
        let mut config = cfg();
        config.slippage = Decimal::ZERO;

        let signal = StrategySignal::new(SignalAction::Short, "BTC/USDT")
            .with_stops(Some(dec!(105)), None);
        let position = manager
            .open(&signal, dec!(100), time(), PositionSide::Short, &mut account, &config)
            .unwrap();
        // liq = 100 * (1 + 0.1 - 0.004)
        assert_eq!(position.liquidation_price, dec!(109.6));

        // High touches the stop but not the liquidation price.
        let triggers = manager.check_stop_orders(&bar(dec!(100), dec!(106), dec!(99), dec!(100)));
        assert_eq!(triggers[0].reason, CloseReason::StopLoss);

        // High pierces the liquidation price: liquidation wins.
        let triggers = manager.check_stop_orders(&bar(dec!(100), dec!(110), dec!(99), dec!(100)));
        assert_eq!(triggers[0].reason, CloseReason::Liquidation);
    }

    #[test]
    fn trailing_stop_follows_highs() {
        let mut manager = HedgePositionManager::new("BTC/USDT");
        let mut account = FuturesAccount::new(dec!(10000));
        let mut config = cfg();
        config.slippage = Decimal::ZERO;
        config.trailing_stop_pct = Some(dec!(0.05));

        manager
            .open(&long_signal(), dec!(100), time(), PositionSide::Long, &mut account, &config)
            .unwrap();
        assert_eq!(
            manager.position(PositionSide::Long).unwrap().trailing_stop,
            Some(dec!(95))
        );

        // New high at 120 ratchets the trailing stop up to 114.
        manager.mark_to_market(dec!(118), dec!(120), dec!(110), &config);
        let position = manager.position(PositionSide::Long).unwrap();
        assert_eq!(position.highest_price, dec!(120));
        assert_eq!(position.trailing_stop, Some(dec!(114)));

        // Pullback through 114 fires the trailing stop.
        let triggers = manager.check_stop_orders(&bar(dec!(118), dec!(118), dec!(113), dec!(115)));
        assert_eq!(triggers[0].reason, CloseReason::TrailingStop);
    }

    #[test]
    fn mark_to_market_updates_unrealized() {
        let mut manager = HedgePositionManager::new("BTC/USDT");
        let mut account = FuturesAccount::new(dec!(10000));
        let mut config = cfg();
        config.slippage = Decimal::ZERO;

        manager
            .open(&long_signal(), dec!(100), time(), PositionSide::Long, &mut account, &config)
            .unwrap();
        manager.mark_to_market(dec!(105), dec!(106), dec!(99), &config);

        let position = manager.position(PositionSide::Long).unwrap();
        assert_eq!(position.unrealized_pnl, dec!(5) * position.size);
        assert_eq!(position.highest_price, dec!(106));
        assert_eq!(position.lowest_price, dec!(99));
    }

    #[test]
    fn close_all_flushes_long_then_short() {
        let mut manager = HedgePositionManager::new("BTC/USDT");
        let mut account = FuturesAccount::new(dec!(10000));
        let config = cfg();

        manager
            .open(&long_signal(), dec!(100), time(), PositionSide::Long, &mut account, &config)
            .unwrap();
        manager
            .open(
                &StrategySignal::new(SignalAction::Short, "BTC/USDT"),
                dec!(100),
                time(),
                PositionSide::Short,
                &mut account,
                &config,
            )
            .unwrap();

        let records = manager
            .close_all(dec!(100), time(), &mut account, &config, CloseReason::SessionEnd)
            .unwrap();
        assert_eq!(records.len(), 2);
        assert_eq!(records[0].action, "close_long");
        assert_eq!(records[1].action, "close_short");
        assert!(records.iter().all(|r| r.reason == "session_end"));
        assert!(!manager.has_any_position());
        assert_eq!(account.margin_locked(), Decimal::ZERO);
    }

    #[test]
    fn quantity_as_notional_overrides_default_sizing() {
        let mut manager = HedgePositionManager::new("BTC/USDT");
        let mut account = FuturesAccount::new(dec!(10000));
        let mut config = cfg();
        config.slippage = Decimal::ZERO;

        let signal = long_signal().with_quantity(dec!(5000));
        let position = manager
            .open(&signal, dec!(100), time(), PositionSide::Long, &mut account, &config)
            .unwrap();

        // margin = 5000 / 10, notional = 5000, size = 50
        assert_eq!(position.margin, dec!(500));
        assert_eq!(position.size, dec!(50));
    }
}
