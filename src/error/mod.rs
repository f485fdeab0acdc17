//! Error types shared across the engine.
//!
//! Two layers: [`DataFetchError`] classifies failures at the market-data edge
//! (and decides retryability), while [`EngineError`] is the engine-wide
//! taxonomy that everything above the data layer propagates.

use thiserror::Error;

use crate::risk::RiskLevel;

/// Failure kinds at the exchange-adapter boundary.
///
/// Retry policy lives at this layer only: transient network failures and rate
/// limits are retried with backoff by the data center, permanent adapter
/// failures are not. Business logic never retries implicitly.
#[derive(Error, Debug)]
#[non_exhaustive]
pub enum DataFetchError {
    /// Transient transport failure (connect, timeout, reset). Retryable.
    #[error("network error: {0}")]
    Network(String),

    /// The upstream asked us to slow down. Retryable with backoff.
    #[error("rate limited: {0}")]
    RateLimited(String),

    /// Permanent adapter failure (bad symbol, malformed payload, 4xx).
    #[error("adapter error: {0}")]
    Adapter(String),
}

impl DataFetchError {
    /// Whether the retry wrapper may attempt this call again.
    pub fn is_retryable(&self) -> bool {
        matches!(self, DataFetchError::Network(_) | DataFetchError::RateLimited(_))
    }
}

impl From<reqwest::Error> for DataFetchError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_timeout() || err.is_connect() || err.is_request() {
            DataFetchError::Network(err.to_string())
        } else {
            DataFetchError::Adapter(err.to_string())
        }
    }
}

/// Engine-wide error taxonomy.
#[derive(Error, Debug)]
#[non_exhaustive]
pub enum EngineError {
    /// Margin lock or stake debit exceeds available cash.
    #[error("insufficient funds: need {needed}, available {available}")]
    InsufficientFunds { needed: String, available: String },

    /// A signal failed validation (confidence range, negative quantity, ...).
    #[error("invalid signal: {0}")]
    InvalidSignal(String),

    /// A close was requested for a side with no open position.
    #[error("no {side} position open for {symbol}")]
    PositionNotFound { symbol: String, side: String },

    /// An open was requested for a side that already holds a position.
    #[error("{side} position already open for {symbol}")]
    DuplicatePosition { symbol: String, side: String },

    /// A strategy could not be resolved from the registry.
    #[error("strategy load failed: {0}")]
    StrategyLoad(String),

    /// A strategy's execute call failed. Captured inside the tick loop.
    #[error("strategy execution failed: {0}")]
    StrategyExecution(String),

    /// Market data could not be fetched (carries the edge classification).
    #[error("data fetch failed: {0}")]
    DataFetch(#[from] DataFetchError),

    /// The circuit breaker rejected the call without touching the adapter.
    #[error("circuit breaker open for service '{service}', retry after {cooldown_secs}s")]
    CircuitOpen { service: String, cooldown_secs: u64 },

    /// A risk rule fired at a level the engine must act on.
    #[error("risk control triggered at {level:?}: {rules:?}")]
    RiskControlTriggered { level: RiskLevel, rules: Vec<String> },

    /// Configuration could not be loaded or validated.
    #[error("configuration error: {0}")]
    Config(String),

    /// The run was cancelled from outside.
    #[error("run cancelled")]
    Cancelled,
}

impl EngineError {
    pub fn insufficient_funds(needed: impl ToString, available: impl ToString) -> Self {
        EngineError::InsufficientFunds {
            needed: needed.to_string(),
            available: available.to_string(),
        }
    }

    pub fn position_not_found(symbol: impl Into<String>, side: impl Into<String>) -> Self {
        EngineError::PositionNotFound {
            symbol: symbol.into(),
            side: side.into(),
        }
    }

    pub fn duplicate_position(symbol: impl Into<String>, side: impl Into<String>) -> Self {
        EngineError::DuplicatePosition {
            symbol: symbol.into(),
            side: side.into(),
        }
    }

    /// Errors that abort a single trade attempt but keep the run alive
    /// (surfaced as `warning` events by the engine).
    pub fn is_trade_level(&self) -> bool {
        matches!(
            self,
            EngineError::InsufficientFunds { .. }
                | EngineError::DuplicatePosition { .. }
                | EngineError::PositionNotFound { .. }
                | EngineError::InvalidSignal(_)
        )
    }
}

/// Convenience alias used throughout the crate.
pub type EngineResult<T> = Result<T, EngineError>;
