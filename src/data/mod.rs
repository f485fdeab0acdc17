//! Market-data layer: adapters, cache, circuit breaker, data center and
//! streaming bar sources.

pub mod adapter;
pub mod binance;
pub mod cache;
pub mod center;
pub mod circuit_breaker;
pub mod stream;
pub mod types;

pub use adapter::{AdapterRegistry, ExchangeAdapter, FuturesAdapter, KlineQuery};
pub use center::{DataCenter, MarketData, MarketDataRequest, MarketMetadata};
pub use circuit_breaker::{CircuitBreaker, CircuitState};
pub use stream::{BarSource, KlineStream, RealtimeKlineSource, VecBarSource};
pub use types::{
    denormalize_symbol, normalize_symbol, Interval, Kline, MarketType, OhlcvSeries, Ticker,
};
