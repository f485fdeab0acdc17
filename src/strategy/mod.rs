//! Strategy contract and supporting types.
//!
//! User strategies implement [`Strategy`]: identity metadata plus a pure
//! `execute(context) -> result`. The engine builds a fresh instance per run
//! from the [`StrategyRegistry`], a registration table of named factories.

pub mod composite;
pub mod macd;
pub mod resolver;

use std::collections::HashMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::data::types::{Interval, OhlcvSeries};
use crate::error::{EngineError, EngineResult};
use crate::indicators::IndicatorArrays;

/// Everything a strategy may act on for one tick. Immutable to the strategy.
#[derive(Debug, Clone)]
pub struct StrategyContext {
    pub symbol: String,
    pub interval: Interval,
    /// Logical (bar) time of the tick.
    pub current_time: DateTime<Utc>,
    /// Visible OHLCV window up to and including the current bar.
    pub market_data: OhlcvSeries,
    /// Aligned indicator arrays from the precompute stage.
    pub indicators: IndicatorArrays,
    /// Available cash.
    pub account_balance: Decimal,
    /// Net-visible size per symbol: positive = net long, negative = net short.
    pub positions: HashMap<String, Decimal>,
    /// Scratch space; sequential composites thread predecessor output here.
    pub metadata: Map<String, Value>,
}

impl StrategyContext {
    /// Net position for the context symbol, zero when flat.
    pub fn net_position(&self) -> Decimal {
        self.positions
            .get(&self.symbol)
            .copied()
            .unwrap_or(Decimal::ZERO)
    }

    pub fn latest_close(&self) -> Option<Decimal> {
        self.market_data.close.last().copied()
    }

    /// Latest value of an indicator column, if warm.
    pub fn indicator(&self, name: &str) -> Option<Decimal> {
        self.indicators.get(name)?.last().copied().flatten()
    }

    /// Indicator value `offset` bars back from the latest.
    pub fn indicator_ago(&self, name: &str, offset: usize) -> Option<Decimal> {
        let column = self.indicators.get(name)?;
        if column.len() <= offset {
            return None;
        }
        column[column.len() - 1 - offset]
    }
}

/// Signal actions. Event-contract traders treat `UP`/`DOWN` as canonical and
/// map the long/short/buy/sell aliases at their boundary.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SignalAction {
    Buy,
    Sell,
    Hold,
    Long,
    Short,
    CloseLong,
    CloseShort,
    Close,
    Up,
    Down,
}

/// Conflict-resolution bucket for open-family actions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub(crate) enum DirectionBucket {
    LongOpen,
    ShortOpen,
    Buy,
    Sell,
}

impl SignalAction {
    pub fn is_close_family(self) -> bool {
        matches!(
            self,
            SignalAction::Close | SignalAction::CloseLong | SignalAction::CloseShort
        )
    }

    pub fn is_hold(self) -> bool {
        self == SignalAction::Hold
    }

    /// Stable-ordering priority: closes first, opens next, HOLD last.
    pub fn priority(self) -> u8 {
        match self {
            SignalAction::Close => 100,
            SignalAction::CloseLong | SignalAction::CloseShort => 90,
            SignalAction::Hold => 0,
            _ => 50,
        }
    }

    pub(crate) fn bucket(self) -> Option<DirectionBucket> {
        match self {
            SignalAction::Long => Some(DirectionBucket::LongOpen),
            SignalAction::Short => Some(DirectionBucket::ShortOpen),
            SignalAction::Buy | SignalAction::Up => Some(DirectionBucket::Buy),
            SignalAction::Sell | SignalAction::Down => Some(DirectionBucket::Sell),
            _ => None,
        }
    }
}

impl DirectionBucket {
    pub(crate) fn opposite(self) -> DirectionBucket {
        match self {
            DirectionBucket::LongOpen => DirectionBucket::ShortOpen,
            DirectionBucket::ShortOpen => DirectionBucket::LongOpen,
            DirectionBucket::Buy => DirectionBucket::Sell,
            DirectionBucket::Sell => DirectionBucket::Buy,
        }
    }
}

/// One trading intention emitted by a strategy.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StrategySignal {
    pub action: SignalAction,
    pub symbol: String,
    /// Non-negative. For futures opens, a USDT notional; zero means "use the
    /// configured default sizing".
    pub quantity: Decimal,
    pub price: Option<Decimal>,
    pub stop_loss: Option<Decimal>,
    pub take_profit: Option<Decimal>,
    /// Confidence in the closed unit interval.
    pub confidence: Decimal,
    pub reason: String,
}

impl StrategySignal {
    pub fn new(action: SignalAction, symbol: impl Into<String>) -> Self {
        Self {
            action,
            symbol: symbol.into(),
            quantity: Decimal::ZERO,
            price: None,
            stop_loss: None,
            take_profit: None,
            confidence: Decimal::ONE,
            reason: String::new(),
        }
    }

    pub fn with_quantity(mut self, quantity: Decimal) -> Self {
        self.quantity = quantity;
        self
    }

    pub fn with_confidence(mut self, confidence: Decimal) -> Self {
        self.confidence = confidence;
        self
    }

    pub fn with_stops(mut self, stop_loss: Option<Decimal>, take_profit: Option<Decimal>) -> Self {
        self.stop_loss = stop_loss;
        self.take_profit = take_profit;
        self
    }

    pub fn with_reason(mut self, reason: impl Into<String>) -> Self {
        self.reason = reason.into();
        self
    }

    pub fn validate(&self) -> EngineResult<()> {
        if self.confidence < Decimal::ZERO || self.confidence > Decimal::ONE {
            return Err(EngineError::InvalidSignal(format!(
                "confidence {} outside [0, 1]",
                self.confidence
            )));
        }
        if self.quantity < Decimal::ZERO {
            return Err(EngineError::InvalidSignal(format!(
                "quantity {} is negative",
                self.quantity
            )));
        }
        Ok(())
    }
}

/// Outcome of one strategy invocation.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct StrategyResult {
    pub signals: Vec<StrategySignal>,
    /// Free-form output; sequential composites pass this downstream.
    pub metadata: Map<String, Value>,
    /// Filled by the engine.
    pub execution_time_us: u64,
    pub success: bool,
    pub error_message: Option<String>,
}

impl StrategyResult {
    pub fn with_signals(signals: Vec<StrategySignal>) -> Self {
        Self {
            signals,
            success: true,
            ..Default::default()
        }
    }

    pub fn hold() -> Self {
        Self {
            success: true,
            ..Default::default()
        }
    }

    pub fn failed(message: impl Into<String>) -> Self {
        Self {
            success: false,
            error_message: Some(message.into()),
            ..Default::default()
        }
    }
}

/// Window sizing hints a strategy may declare.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DataRequirements {
    pub min_bars: usize,
    pub warmup_periods: usize,
    pub prefer_closed_bar: bool,
    pub extra_seconds: u64,
    pub max_timeframe_required: Option<Interval>,
}

impl Default for DataRequirements {
    fn default() -> Self {
        Self {
            min_bars: 0,
            warmup_periods: 50,
            prefer_closed_bar: false,
            extra_seconds: 0,
            max_timeframe_required: None,
        }
    }
}

/// The contract imposed on user code.
///
/// Strategies must not retain cross-tick mutable state that cannot be rebuilt
/// from the context: the engine guarantees a fresh instance per run but makes
/// no guarantee about instance reuse across ticks.
pub trait Strategy: Send {
    fn name(&self) -> &str;

    fn version(&self) -> &str {
        "1.0.0"
    }

    fn tags(&self) -> Vec<String> {
        Vec::new()
    }

    fn data_requirements(&self, _interval: Interval) -> DataRequirements {
        DataRequirements::default()
    }

    fn config(&self) -> Map<String, Value> {
        Map::new()
    }

    fn execute(&self, context: &StrategyContext) -> EngineResult<StrategyResult>;
}

type StrategyFactory = Arc<dyn Fn() -> Box<dyn Strategy> + Send + Sync>;

/// Registration table of strategy factories.
///
/// The table is the build-time equivalent of runtime artifact loading; hot
/// reload maps to swapping a factory under the lock.
#[derive(Default)]
pub struct StrategyRegistry {
    factories: RwLock<HashMap<String, StrategyFactory>>,
}

impl StrategyRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry with the built-in strategies pre-registered.
    pub fn with_builtins() -> Self {
        let registry = Self::new();
        registry.register("macd_cross", || {
            Box::new(macd::MacdCrossStrategy::default())
        });
        registry
    }

    pub fn register<F>(&self, id: impl Into<String>, factory: F)
    where
        F: Fn() -> Box<dyn Strategy> + Send + Sync + 'static,
    {
        self.factories.write().insert(id.into(), Arc::new(factory));
    }

    /// Fresh instance for a run.
    pub fn create(&self, id: &str) -> EngineResult<Box<dyn Strategy>> {
        let factory = self
            .factories
            .read()
            .get(id)
            .cloned()
            .ok_or_else(|| EngineError::StrategyLoad(format!("unknown strategy '{id}'")))?;
        Ok(factory())
    }

    pub fn contains(&self, id: &str) -> bool {
        self.factories.read().contains_key(id)
    }

    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.factories.read().keys().cloned().collect();
        names.sort();
        names
    }
}
