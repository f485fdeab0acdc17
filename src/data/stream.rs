//! Streaming bar sources.
//!
//! [`KlineStream`] drives historical replay: bounded batches over a half-open
//! time range, with optional prefetch of the next batch while the consumer
//! drains the current one. [`RealtimeKlineSource`] drives the simulated
//! realtime (paper) mode by sleeping to the next bar boundary and polling for
//! the latest closed bar. Both enforce the bar-sequence invariants: strictly
//! increasing open times, no duplicates, boundary alignment.

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use super::center::{DataCenter, MarketDataRequest};
use super::types::{Interval, Kline, MarketType};
use crate::error::{DataFetchError, EngineError, EngineResult};

/// A lazy, finite, non-restartable sequence of bars.
#[async_trait]
pub trait BarSource: Send {
    /// The next bar in order, or `None` when the sequence is exhausted.
    async fn next_bar(&mut self) -> EngineResult<Option<Kline>>;
}

/// Historical loader over `[start_ms, end_ms)`.
pub struct KlineStream {
    center: Arc<DataCenter>,
    symbol: String,
    interval: Interval,
    exchange: String,
    market_type: MarketType,
    end_ms: i64,
    batch_size: u32,
    preload_enabled: bool,

    cursor: i64,
    current: VecDeque<Kline>,
    prefetch: Option<JoinHandle<EngineResult<Vec<Kline>>>>,
    last_open_time: Option<i64>,
    finished: bool,
}

impl KlineStream {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        center: Arc<DataCenter>,
        symbol: impl Into<String>,
        interval: Interval,
        exchange: impl Into<String>,
        market_type: MarketType,
        start_ms: i64,
        end_ms: i64,
        batch_size: u32,
        preload_enabled: bool,
    ) -> Self {
        Self {
            center,
            symbol: symbol.into(),
            interval,
            exchange: exchange.into(),
            market_type,
            end_ms,
            batch_size: batch_size.max(1),
            preload_enabled,
            cursor: start_ms,
            current: VecDeque::new(),
            prefetch: None,
            last_open_time: None,
            finished: false,
        }
    }

    fn request(&self, cursor: i64) -> MarketDataRequest {
        MarketDataRequest {
            symbol: self.symbol.clone(),
            interval: self.interval,
            exchange: self.exchange.clone(),
            market_type: self.market_type,
            limit: self.batch_size,
            start_ms: Some(cursor),
            end_ms: Some(self.end_ms),
        }
    }

    fn spawn_prefetch(&mut self, cursor: i64) {
        if !self.preload_enabled || cursor >= self.end_ms {
            return;
        }
        let center = self.center.clone();
        let request = self.request(cursor);
        debug!(cursor, "prefetching next batch");
        self.prefetch = Some(tokio::spawn(
            async move { center.get_klines(&request).await },
        ));
    }

    /// Drop already-seen bars, verify ordering and boundary alignment.
    fn validate_batch(&mut self, bars: Vec<Kline>) -> EngineResult<Vec<Kline>> {
        let mut fresh = Vec::with_capacity(bars.len());
        for bar in bars {
            if bar.open_time >= self.end_ms {
                continue;
            }
            if let Some(seen) = self.last_open_time {
                if bar.open_time <= seen {
                    continue; // duplicate or regression across batch seams
                }
            }
            if !self.interval.is_aligned(bar.open_time) {
                return Err(EngineError::DataFetch(DataFetchError::Adapter(format!(
                    "bar open_time {} is not aligned to {}",
                    bar.open_time, self.interval
                ))));
            }
            self.last_open_time = Some(bar.open_time);
            fresh.push(bar);
        }
        Ok(fresh)
    }

    async fn pull_batch(&mut self) -> EngineResult<Vec<Kline>> {
        match self.prefetch.take() {
            Some(handle) => handle.await.map_err(|e| {
                EngineError::DataFetch(DataFetchError::Network(format!("prefetch task: {e}")))
            })?,
            None => {
                let request = self.request(self.cursor);
                self.center.get_klines(&request).await
            }
        }
    }

    async fn refill(&mut self) -> EngineResult<()> {
        while self.current.is_empty() && !self.finished {
            if self.cursor >= self.end_ms {
                self.finished = true;
                break;
            }

            let batch = self.pull_batch().await?;
            let fresh = self.validate_batch(batch)?;

            match fresh.last() {
                None => {
                    // Nothing new past the cursor: clean termination.
                    self.finished = true;
                }
                Some(last) => {
                    self.cursor = self.interval.advance(last.open_time);
                    self.current.extend(fresh);
                    self.spawn_prefetch(self.cursor);
                }
            }
        }
        Ok(())
    }
}

#[async_trait]
impl BarSource for KlineStream {
    async fn next_bar(&mut self) -> EngineResult<Option<Kline>> {
        if self.current.is_empty() {
            self.refill().await?;
        }
        Ok(self.current.pop_front())
    }
}

/// Paper-mode source: waits out each bar interval and emits the latest
/// closed bar. Not deterministic by construction; replay tests use
/// [`KlineStream`].
pub struct RealtimeKlineSource {
    center: Arc<DataCenter>,
    symbol: String,
    interval: Interval,
    exchange: String,
    market_type: MarketType,
    /// Stop emitting at this time; `None` runs until cancelled.
    end_ms: Option<i64>,
    last_open_time: Option<i64>,
}

impl RealtimeKlineSource {
    pub fn new(
        center: Arc<DataCenter>,
        symbol: impl Into<String>,
        interval: Interval,
        exchange: impl Into<String>,
        market_type: MarketType,
        end_ms: Option<i64>,
    ) -> Self {
        Self {
            center,
            symbol: symbol.into(),
            interval,
            exchange: exchange.into(),
            market_type,
            end_ms,
            last_open_time: None,
        }
    }

    fn millis_until_next_close(&self, now_ms: i64) -> i64 {
        match self.interval.fixed_millis() {
            Some(width) => width - now_ms.rem_euclid(width),
            // Calendar months: poll hourly.
            None => 3_600_000,
        }
    }
}

#[async_trait]
impl BarSource for RealtimeKlineSource {
    async fn next_bar(&mut self) -> EngineResult<Option<Kline>> {
        loop {
            let now_ms = chrono::Utc::now().timestamp_millis();
            if let Some(end) = self.end_ms {
                if now_ms >= end {
                    return Ok(None);
                }
            }

            // Request the last two bars: the newest row is the still-forming
            // bar, the one before it the latest closed bar.
            let request = MarketDataRequest {
                symbol: self.symbol.clone(),
                interval: self.interval,
                exchange: self.exchange.clone(),
                market_type: self.market_type,
                limit: 2,
                start_ms: None,
                end_ms: None,
            };
            let bars = self.center.get_klines(&request).await?;
            let closed = bars
                .iter()
                .filter(|b| b.close_time <= now_ms)
                .last()
                .cloned();

            if let Some(bar) = closed {
                if self.last_open_time.map_or(true, |seen| bar.open_time > seen) {
                    self.last_open_time = Some(bar.open_time);
                    return Ok(Some(bar));
                }
            }

            let wait = self.millis_until_next_close(now_ms).clamp(250, 3_600_000);
            debug!(wait_ms = wait, "waiting for next closed bar");
            tokio::time::sleep(Duration::from_millis(wait as u64)).await;
        }
    }
}

/// Replays a pre-built bar vector; used by tests and by callers that already
/// hold data in memory.
pub struct VecBarSource {
    bars: std::vec::IntoIter<Kline>,
}

impl VecBarSource {
    pub fn new(mut bars: Vec<Kline>) -> Self {
        bars.sort_by_key(|b| b.open_time);
        bars.dedup_by_key(|b| b.open_time);
        Self {
            bars: bars.into_iter(),
        }
    }
}

#[async_trait]
impl BarSource for VecBarSource {
    async fn next_bar(&mut self) -> EngineResult<Option<Kline>> {
        Ok(self.bars.next())
    }
}

impl Drop for KlineStream {
    fn drop(&mut self) {
        if let Some(handle) = self.prefetch.take() {
            warn!("dropping kline stream with prefetch in flight");
            handle.abort();
        }
    }
}
