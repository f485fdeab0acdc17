//! Execution engine: drives a strategy over a bar stream in backtest, paper
//! or live mode.

mod executor;

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

pub use executor::ExecutionEngine;

use crate::data::types::{Interval, MarketType};

/// Execution mode of a run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ExecutionMode {
    /// Historical replay over a fixed range.
    Backtest,
    /// Simulated realtime: live bars, simulated fills.
    Paper,
    /// Live bars; order routing is delegated to exchange adapters.
    Live,
}

/// Instrument family driven by the run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ContractType {
    /// Binary event contracts resolved per bar.
    Events,
    /// USD-margined perpetuals in hedge mode.
    Futures,
}

impl ContractType {
    pub fn market_type(self) -> MarketType {
        match self {
            ContractType::Events => MarketType::Spot,
            ContractType::Futures => MarketType::Futures,
        }
    }
}

/// Event kinds on the output stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EventKind {
    Tick,
    Trade,
    Warning,
    Progress,
    Error,
    Complete,
}

/// One event on the run's output stream. `timestamp` is always the logical
/// (bar) time, never wall-clock.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutionEvent {
    pub kind: EventKind,
    pub data: Map<String, Value>,
    pub timestamp: DateTime<Utc>,
}

impl ExecutionEvent {
    pub fn new(kind: EventKind, data: Map<String, Value>, timestamp: DateTime<Utc>) -> Self {
        Self {
            kind,
            data,
            timestamp,
        }
    }
}

/// Per-run parameters.
#[derive(Debug, Clone)]
pub struct ExecutionConfig {
    pub symbol: String,
    pub interval: Interval,
    pub mode: ExecutionMode,
    pub contract_type: ContractType,
    pub exchange: String,
    /// Inclusive start of the requested range, UTC ms.
    pub start_ms: Option<i64>,
    /// Exclusive end of the requested range, UTC ms.
    pub end_ms: Option<i64>,
    pub initial_capital: Decimal,
    /// Replay speed factor in `[0, 999]`; 0 replays unthrottled.
    pub speed: u32,
    /// Express mode bundles up to 200 ticks per progress flush.
    pub express: bool,
    /// Indicator shorthand specs; `None` uses the engine defaults.
    pub indicators: Option<Vec<String>>,
    /// Events: stake when signals carry no quantity.
    pub investment_amount: Option<Decimal>,
    /// Events: winning payout factor.
    pub payout_multiplier: Option<Decimal>,
    /// Futures: trailing-stop offset.
    pub trailing_stop_pct: Option<Decimal>,
    /// Resolver confidence floor override.
    pub min_confidence: Option<Decimal>,
}

impl ExecutionConfig {
    pub fn backtest(symbol: impl Into<String>, interval: Interval) -> Self {
        Self {
            symbol: symbol.into(),
            interval,
            mode: ExecutionMode::Backtest,
            contract_type: ContractType::Futures,
            exchange: "binance".to_string(),
            start_ms: None,
            end_ms: None,
            initial_capital: Decimal::from(10_000),
            speed: 0,
            express: false,
            indicators: None,
            investment_amount: None,
            payout_multiplier: None,
            trailing_stop_pct: None,
            min_confidence: None,
        }
    }

    pub fn events(mut self) -> Self {
        self.contract_type = ContractType::Events;
        self
    }

    pub fn with_range(mut self, start_ms: i64, end_ms: i64) -> Self {
        self.start_ms = Some(start_ms);
        self.end_ms = Some(end_ms);
        self
    }

    pub fn with_capital(mut self, initial_capital: Decimal) -> Self {
        self.initial_capital = initial_capital;
        self
    }

    pub fn with_mode(mut self, mode: ExecutionMode) -> Self {
        self.mode = mode;
        self
    }

    pub fn with_speed(mut self, speed: u32) -> Self {
        self.speed = speed.min(999);
        self
    }

    pub fn with_indicators(mut self, indicators: Vec<String>) -> Self {
        self.indicators = Some(indicators);
        self
    }

    /// Ticks per progress flush for a speed factor.
    pub fn flush_cadence(&self) -> u32 {
        if self.express {
            return 200;
        }
        match self.speed {
            0..=9 => 1,
            10..=49 => 5,
            50..=99 => 10,
            _ => 20,
        }
    }
}
