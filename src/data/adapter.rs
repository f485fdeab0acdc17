//! Exchange adapter interface.
//!
//! The only contract imposed on data-source implementers. Adapters accept
//! symbols in exchange-native (`BTCUSDT`) or normalized (`BTC/USDT`) form and
//! always return them normalized. Bars come back sorted ascending by open
//! time and never exceed the requested limit.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use super::types::{Interval, Kline, MarketType, Ticker};
use crate::error::DataFetchError;

/// Parameters for a kline request.
#[derive(Debug, Clone)]
pub struct KlineQuery {
    pub symbol: String,
    pub interval: Interval,
    pub limit: u32,
    /// Inclusive lower bound, UTC ms
    pub start_ms: Option<i64>,
    /// Exclusive upper bound, UTC ms
    pub end_ms: Option<i64>,
}

impl KlineQuery {
    pub fn new(symbol: impl Into<String>, interval: Interval, limit: u32) -> Self {
        Self {
            symbol: symbol.into(),
            interval,
            limit,
            start_ms: None,
            end_ms: None,
        }
    }

    pub fn with_range(mut self, start_ms: i64, end_ms: i64) -> Self {
        self.start_ms = Some(start_ms);
        self.end_ms = Some(end_ms);
        self
    }
}

/// Free balance per currency.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AssetBalance {
    pub currency: String,
    pub free: Decimal,
    pub locked: Decimal,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum OrderSide {
    Buy,
    Sell,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum OrderKind {
    Market,
    Limit,
}

/// Order submission payload for live adapters.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OrderRequest {
    pub symbol: String,
    pub side: OrderSide,
    pub kind: OrderKind,
    pub quantity: Decimal,
    pub price: Option<Decimal>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum OrderStatus {
    New,
    PartiallyFilled,
    Filled,
    Canceled,
    Rejected,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OrderInfo {
    pub order_id: String,
    pub symbol: String,
    pub side: OrderSide,
    pub status: OrderStatus,
    pub executed_qty: Decimal,
    pub avg_price: Option<Decimal>,
}

/// Exchange position snapshot (futures adapters).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExchangePosition {
    pub symbol: String,
    pub side: String,
    pub size: Decimal,
    pub entry_price: Decimal,
    pub mark_price: Decimal,
    pub unrealized_pnl: Decimal,
    pub leverage: u32,
}

/// Capability set every data source implements.
#[async_trait]
pub trait ExchangeAdapter: Send + Sync {
    /// Stable identifier, e.g. `"binance"`.
    fn exchange_id(&self) -> &str;

    /// Market family this adapter instance serves.
    fn market_type(&self) -> MarketType;

    /// Fetch at most `query.limit` bars, ascending by open time.
    async fn get_klines(&self, query: &KlineQuery) -> Result<Vec<Kline>, DataFetchError>;

    async fn get_ticker(&self, symbol: &str) -> Result<Ticker, DataFetchError>;

    async fn get_balance(&self) -> Result<Vec<AssetBalance>, DataFetchError>;

    async fn place_order(&self, order: &OrderRequest) -> Result<OrderInfo, DataFetchError>;

    async fn cancel_order(&self, symbol: &str, order_id: &str) -> Result<(), DataFetchError>;

    async fn get_order(&self, symbol: &str, order_id: &str) -> Result<OrderInfo, DataFetchError>;
}

/// Additional capabilities of USD-margined futures adapters.
#[async_trait]
pub trait FuturesAdapter: ExchangeAdapter {
    async fn set_leverage(&self, symbol: &str, leverage: u32) -> Result<(), DataFetchError>;

    async fn get_position(&self, symbol: &str) -> Result<Vec<ExchangePosition>, DataFetchError>;

    /// Smoothed reference price used for PnL and liquidation checks.
    async fn get_mark_price(&self, symbol: &str) -> Result<Decimal, DataFetchError>;

    async fn get_funding_rate(&self, symbol: &str) -> Result<Decimal, DataFetchError>;
}

/// Registry of adapter instances keyed by `(exchange, market_type)`.
#[derive(Default)]
pub struct AdapterRegistry {
    adapters: HashMap<(String, MarketType), Arc<dyn ExchangeAdapter>>,
    futures: HashMap<(String, MarketType), Arc<dyn FuturesAdapter>>,
}

impl AdapterRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, adapter: Arc<dyn ExchangeAdapter>) {
        let key = (adapter.exchange_id().to_string(), adapter.market_type());
        self.adapters.insert(key, adapter);
    }

    /// Register a futures-capable adapter under both tables.
    pub fn register_futures(&mut self, adapter: Arc<dyn FuturesAdapter>) {
        let key = (adapter.exchange_id().to_string(), adapter.market_type());
        self.futures.insert(key.clone(), adapter.clone());
        self.adapters.insert(key, adapter);
    }

    pub fn get(&self, exchange: &str, market_type: MarketType) -> Option<Arc<dyn ExchangeAdapter>> {
        self.adapters
            .get(&(exchange.to_lowercase(), market_type))
            .cloned()
    }

    pub fn get_futures(
        &self,
        exchange: &str,
        market_type: MarketType,
    ) -> Option<Arc<dyn FuturesAdapter>> {
        self.futures
            .get(&(exchange.to_lowercase(), market_type))
            .cloned()
    }
}
