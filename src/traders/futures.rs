//! Futures trader: parses signal actions and delegates to the hedge-mode
//! position manager.

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use tracing::debug;

use crate::accounts::{FuturesAccount, PositionSide};
use crate::error::EngineResult;
use crate::positions::{CloseReason, FuturesTradeConfig, HedgePositionManager};
use crate::report::TradeRecord;
use crate::strategy::{SignalAction, StrategySignal};

/// A signal action decoded into a position-manager operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FuturesOrder {
    Open(PositionSide),
    Close(PositionSide),
    CloseAll,
    Hold,
}

impl FuturesOrder {
    /// Decode table: long-family opens long, short-family opens short,
    /// close-family closes, everything else holds.
    pub fn parse(action: SignalAction) -> Self {
        match action {
            SignalAction::Long | SignalAction::Buy | SignalAction::Up => {
                FuturesOrder::Open(PositionSide::Long)
            }
            SignalAction::Short | SignalAction::Sell | SignalAction::Down => {
                FuturesOrder::Open(PositionSide::Short)
            }
            SignalAction::CloseLong => FuturesOrder::Close(PositionSide::Long),
            SignalAction::CloseShort => FuturesOrder::Close(PositionSide::Short),
            SignalAction::Close => FuturesOrder::CloseAll,
            SignalAction::Hold => FuturesOrder::Hold,
        }
    }
}

#[derive(Debug, Default)]
pub struct FuturesTrader;

impl FuturesTrader {
    pub fn new() -> Self {
        Self
    }

    /// Apply one resolved signal at the reference price. Opens produce no
    /// record (records are emitted at close); closes return theirs.
    pub fn execute(
        &self,
        signal: &StrategySignal,
        price: Decimal,
        time: DateTime<Utc>,
        account: &mut FuturesAccount,
        manager: &mut HedgePositionManager,
        cfg: &FuturesTradeConfig,
    ) -> EngineResult<Vec<TradeRecord>> {
        signal.validate()?;
        let order = FuturesOrder::parse(signal.action);
        debug!(action = ?signal.action, ?order, %price, "futures trade");

        match order {
            FuturesOrder::Open(side) => {
                manager.open(signal, price, time, side, account, cfg)?;
                Ok(Vec::new())
            }
            FuturesOrder::Close(side) => {
                let record =
                    manager.close(side, price, time, account, cfg, CloseReason::Signal)?;
                Ok(vec![record])
            }
            FuturesOrder::CloseAll => {
                manager.close_all(price, time, account, cfg, CloseReason::Signal)
            }
            FuturesOrder::Hold => Ok(Vec::new()),
        }
    }
}
