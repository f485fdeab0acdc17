//! Data center: the single market-data entry point.
//!
//! Bundles the adapter registry, the TTL/LRU cache and per-service circuit
//! breakers, and wraps adapter calls in a bounded retry with exponential
//! backoff. Owns the one long-lived HTTP client for the run.

use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use super::adapter::{AdapterRegistry, ExchangeAdapter, FuturesAdapter, KlineQuery};
use super::binance::{BinanceAdapter, BinanceCredentials};
use super::cache::{CacheKey, CacheStats, DataCache};
use super::circuit_breaker::{CircuitBreaker, CircuitStats};
use super::types::{normalize_symbol, Interval, Kline, MarketType, OhlcvSeries, Ticker};
use crate::config::DataCenterConfig;
use crate::error::{DataFetchError, EngineError, EngineResult};

/// One market-data request.
#[derive(Debug, Clone)]
pub struct MarketDataRequest {
    pub symbol: String,
    pub interval: Interval,
    pub exchange: String,
    pub market_type: MarketType,
    pub limit: u32,
    pub start_ms: Option<i64>,
    pub end_ms: Option<i64>,
}

impl MarketDataRequest {
    pub fn new(symbol: impl Into<String>, interval: Interval) -> Self {
        Self {
            symbol: symbol.into(),
            interval,
            exchange: "binance".to_string(),
            market_type: MarketType::Spot,
            limit: 100,
            start_ms: None,
            end_ms: None,
        }
    }

    pub fn futures(mut self) -> Self {
        self.market_type = MarketType::Futures;
        self
    }

    pub fn with_limit(mut self, limit: u32) -> Self {
        self.limit = limit;
        self
    }

    pub fn with_range(mut self, start_ms: i64, end_ms: i64) -> Self {
        self.start_ms = Some(start_ms);
        self.end_ms = Some(end_ms);
        self
    }

    fn service(&self) -> String {
        format!("{}_{}", self.exchange.to_lowercase(), self.market_type)
    }

    fn kline_query(&self) -> KlineQuery {
        KlineQuery {
            symbol: normalize_symbol(&self.symbol),
            interval: self.interval,
            limit: self.limit,
            start_ms: self.start_ms,
            end_ms: self.end_ms,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MarketMetadata {
    pub symbol: String,
    pub interval: Interval,
    pub count: usize,
    pub exchange: String,
    pub market_type: MarketType,
}

/// Response of [`DataCenter::get_market_data`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MarketData {
    pub ohlcv: OhlcvSeries,
    pub metadata: MarketMetadata,
}

/// Facade over adapters + cache + breakers.
pub struct DataCenter {
    config: DataCenterConfig,
    registry: AdapterRegistry,
    kline_cache: DataCache<MarketData>,
    ticker_cache: DataCache<Ticker>,
    breakers: Mutex<HashMap<String, Arc<CircuitBreaker>>>,
}

impl DataCenter {
    /// Build with the default Binance adapters (spot + futures) sharing one
    /// HTTP client.
    pub fn new(config: DataCenterConfig) -> EngineResult<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.request_timeout_seconds))
            .build()
            .map_err(|e| EngineError::Config(format!("http client: {e}")))?;

        let mut registry = AdapterRegistry::new();
        for market_type in [MarketType::Spot, MarketType::Futures] {
            let mut adapter = BinanceAdapter::new(client.clone(), market_type);
            if let Some(base_url) = &config.base_url {
                adapter = adapter.with_base_url(base_url.clone());
            }
            if let (Some(key), Some(secret)) = (&config.api_key, &config.api_secret) {
                adapter = adapter.with_credentials(BinanceCredentials {
                    api_key: key.clone(),
                    api_secret: secret.clone(),
                });
            }
            registry.register_futures(Arc::new(adapter));
        }

        Ok(Self::with_registry(config, registry))
    }

    /// Build over a caller-supplied registry (tests, alternative venues).
    pub fn with_registry(config: DataCenterConfig, registry: AdapterRegistry) -> Self {
        let kline_ttl = Duration::from_secs(config.cache_ttl_seconds);
        // Tickers go stale much faster than closed bars.
        let ticker_ttl = Duration::from_secs(5).min(kline_ttl);
        Self {
            kline_cache: DataCache::new(config.cache_max_entries, kline_ttl),
            ticker_cache: DataCache::new(config.cache_max_entries / 2 + 1, ticker_ttl),
            breakers: Mutex::new(HashMap::new()),
            registry,
            config,
        }
    }

    fn adapter(&self, request: &MarketDataRequest) -> EngineResult<Arc<dyn ExchangeAdapter>> {
        self.registry
            .get(&request.exchange, request.market_type)
            .ok_or_else(|| {
                EngineError::Config(format!(
                    "no adapter registered for {} {}",
                    request.exchange, request.market_type
                ))
            })
    }

    fn futures_adapter(&self, exchange: &str) -> EngineResult<Arc<dyn FuturesAdapter>> {
        self.registry
            .get_futures(exchange, MarketType::Futures)
            .ok_or_else(|| {
                EngineError::Config(format!("no futures adapter registered for {exchange}"))
            })
    }

    fn breaker(&self, service: &str) -> Arc<CircuitBreaker> {
        let mut breakers = self.breakers.lock();
        breakers
            .entry(service.to_string())
            .or_insert_with(|| {
                Arc::new(CircuitBreaker::new(
                    service,
                    self.config.breaker_failure_threshold,
                    Duration::from_secs(self.config.breaker_cooldown_seconds),
                ))
            })
            .clone()
    }

    /// Gate + retry + breaker bookkeeping around one adapter call.
    async fn guarded<T, F, Fut>(&self, service: &str, call: F) -> EngineResult<T>
    where
        F: Fn() -> Fut,
        Fut: Future<Output = Result<T, DataFetchError>>,
    {
        let breaker = self.breaker(service);
        if !breaker.allow_request() {
            return Err(EngineError::CircuitOpen {
                service: service.to_string(),
                cooldown_secs: breaker.cooldown().as_secs(),
            });
        }

        let mut delay = Duration::from_secs_f64(self.config.retry_delay_seconds);
        let attempts = self.config.max_retries.max(1);
        let mut last_err: Option<DataFetchError> = None;

        for attempt in 1..=attempts {
            match call().await {
                Ok(value) => {
                    breaker.record_success();
                    return Ok(value);
                }
                Err(err) => {
                    let retryable = err.is_retryable();
                    warn!(service, attempt, %err, "market data call failed");
                    last_err = Some(err);
                    if !retryable || attempt == attempts {
                        break;
                    }
                    tokio::time::sleep(delay).await;
                    delay *= 2;
                }
            }
        }

        breaker.record_failure();
        // last_err is always set when the loop exits without returning.
        Err(EngineError::DataFetch(last_err.unwrap_or_else(|| {
            DataFetchError::Adapter("call failed with no error recorded".into())
        })))
    }

    /// Fetch a kline window, memoized by the full request shape.
    pub async fn get_market_data(&self, request: &MarketDataRequest) -> EngineResult<MarketData> {
        let symbol = normalize_symbol(&request.symbol);
        let service = request.service();
        let cache_key = CacheKey {
            service: format!("klines:{service}"),
            symbol: symbol.clone(),
            interval: request.interval.to_string(),
            limit: request.limit,
            start_ms: request.start_ms,
            end_ms: request.end_ms,
        };

        if self.config.enable_cache {
            if let Some(cached) = self.kline_cache.get(&cache_key) {
                debug!(%symbol, "kline cache hit");
                return Ok(cached);
            }
        }

        let adapter = self.adapter(request)?;
        let query = request.kline_query();
        let bars = self
            .guarded(&service, || {
                let adapter = adapter.clone();
                let query = query.clone();
                async move { adapter.get_klines(&query).await }
            })
            .await?;

        let data = MarketData {
            ohlcv: OhlcvSeries::from_klines(&bars),
            metadata: MarketMetadata {
                symbol,
                interval: request.interval,
                count: bars.len(),
                exchange: request.exchange.to_lowercase(),
                market_type: request.market_type,
            },
        };

        if self.config.enable_cache {
            self.kline_cache.insert(cache_key, data.clone());
        }
        Ok(data)
    }

    /// Raw bars for the streaming loader (no cache: each page is unique).
    pub async fn get_klines(&self, request: &MarketDataRequest) -> EngineResult<Vec<Kline>> {
        let adapter = self.adapter(request)?;
        let service = request.service();
        let query = request.kline_query();
        self.guarded(&service, || {
            let adapter = adapter.clone();
            let query = query.clone();
            async move { adapter.get_klines(&query).await }
        })
        .await
    }

    /// Page through a time range with at most `max_requests` upstream calls,
    /// stitching pages in time order and suppressing duplicate open times.
    pub async fn get_historical_klines_batch(
        &self,
        request: &MarketDataRequest,
        max_requests: u32,
    ) -> EngineResult<MarketData> {
        let (start_ms, end_ms) = match (request.start_ms, request.end_ms) {
            (Some(s), Some(e)) => (s, e),
            _ => {
                return Err(EngineError::Config(
                    "batch fetch requires start_ms and end_ms".into(),
                ))
            }
        };

        let mut all: Vec<Kline> = Vec::new();
        let mut cursor = start_ms;

        for _ in 0..max_requests {
            if cursor >= end_ms {
                break;
            }
            let page_request = MarketDataRequest {
                start_ms: Some(cursor),
                end_ms: Some(end_ms),
                ..request.clone()
            };
            let page = self.get_klines(&page_request).await?;
            let Some(last) = page.last() else { break };
            let next_cursor = request.interval.advance(last.open_time);

            for bar in page {
                if all.last().map_or(true, |prev| bar.open_time > prev.open_time) {
                    all.push(bar);
                }
            }

            if next_cursor <= cursor {
                break;
            }
            cursor = next_cursor;
        }

        all.retain(|bar| bar.open_time >= start_ms && bar.open_time < end_ms);

        Ok(MarketData {
            metadata: MarketMetadata {
                symbol: normalize_symbol(&request.symbol),
                interval: request.interval,
                count: all.len(),
                exchange: request.exchange.to_lowercase(),
                market_type: request.market_type,
            },
            ohlcv: OhlcvSeries::from_klines(&all),
        })
    }

    /// Latest snapshot, memoized with a short TTL.
    pub async fn get_ticker(
        &self,
        symbol: &str,
        exchange: &str,
        market_type: MarketType,
    ) -> EngineResult<Ticker> {
        let normalized = normalize_symbol(symbol);
        let service = format!("{}_{}", exchange.to_lowercase(), market_type);
        let cache_key = CacheKey {
            service: format!("ticker:{service}"),
            symbol: normalized.clone(),
            interval: String::new(),
            limit: 0,
            start_ms: None,
            end_ms: None,
        };

        if self.config.enable_cache {
            if let Some(cached) = self.ticker_cache.get(&cache_key) {
                return Ok(cached);
            }
        }

        let adapter = self
            .registry
            .get(exchange, market_type)
            .ok_or_else(|| EngineError::Config(format!("no adapter for {exchange}")))?;
        let ticker = self
            .guarded(&service, || {
                let adapter = adapter.clone();
                let symbol = normalized.clone();
                async move { adapter.get_ticker(&symbol).await }
            })
            .await?;

        if self.config.enable_cache {
            self.ticker_cache.insert(cache_key, ticker.clone());
        }
        Ok(ticker)
    }

    /// Futures mark price (uncached: it moves every tick).
    pub async fn get_mark_price(&self, symbol: &str, exchange: &str) -> EngineResult<Decimal> {
        let adapter = self.futures_adapter(exchange)?;
        let service = format!("{}_futures", exchange.to_lowercase());
        let normalized = normalize_symbol(symbol);
        self.guarded(&service, || {
            let adapter = adapter.clone();
            let symbol = normalized.clone();
            async move { adapter.get_mark_price(&symbol).await }
        })
        .await
    }

    /// Current funding rate for a perpetual.
    pub async fn get_funding_rate(&self, symbol: &str, exchange: &str) -> EngineResult<Decimal> {
        let adapter = self.futures_adapter(exchange)?;
        let service = format!("{}_futures", exchange.to_lowercase());
        let normalized = normalize_symbol(symbol);
        self.guarded(&service, || {
            let adapter = adapter.clone();
            let symbol = normalized.clone();
            async move { adapter.get_funding_rate(&symbol).await }
        })
        .await
    }

    pub fn cache_stats(&self) -> CacheStats {
        self.kline_cache.stats()
    }

    pub fn breaker_stats(&self) -> HashMap<String, CircuitStats> {
        self.breakers
            .lock()
            .iter()
            .map(|(name, breaker)| (name.clone(), breaker.stats()))
            .collect()
    }
}
