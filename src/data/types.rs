//! Core market-data types: bars, series, tickers, intervals and symbols.
//!
//! All timestamps at this layer are UTC epoch milliseconds, matching the
//! exchange wire format; conversion to `DateTime<Utc>` happens where domain
//! code needs calendar arithmetic.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Datelike, Months, TimeZone, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::DataFetchError;

/// Market family an adapter serves.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MarketType {
    Spot,
    /// USD-margined perpetuals
    Futures,
}

impl fmt::Display for MarketType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MarketType::Spot => write!(f, "spot"),
            MarketType::Futures => write!(f, "futures"),
        }
    }
}

/// A single OHLCV bar.
///
/// Invariants enforced at the loader: `open_time` strictly increasing across a
/// request, no duplicates, aligned to the interval boundary.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Kline {
    /// Bar open time, UTC epoch milliseconds
    pub open_time: i64,
    pub open: Decimal,
    pub high: Decimal,
    pub low: Decimal,
    pub close: Decimal,
    pub volume: Decimal,
    /// Bar close time, UTC epoch milliseconds
    pub close_time: i64,
    pub quote_volume: Option<Decimal>,
    pub trade_count: Option<u64>,
}

impl Kline {
    /// Parse one bar from the exchange 11-tuple
    /// `[open_time, o, h, l, c, v, close_time, quote_v, trades, taker_v, taker_qv]`.
    /// Prices and volumes arrive as strings or numbers; both are accepted.
    pub fn from_payload(row: &Value) -> Result<Self, DataFetchError> {
        let fields = row
            .as_array()
            .ok_or_else(|| DataFetchError::Adapter("kline row is not an array".into()))?;
        if fields.len() < 7 {
            return Err(DataFetchError::Adapter(format!(
                "kline row has {} fields, expected at least 7",
                fields.len()
            )));
        }

        Ok(Kline {
            open_time: parse_ms(&fields[0])?,
            open: parse_price(&fields[1])?,
            high: parse_price(&fields[2])?,
            low: parse_price(&fields[3])?,
            close: parse_price(&fields[4])?,
            volume: parse_price(&fields[5])?,
            close_time: parse_ms(&fields[6])?,
            quote_volume: fields.get(7).map(parse_price).transpose()?,
            trade_count: fields.get(8).and_then(Value::as_u64),
        })
    }

    /// Bar open time as a chrono timestamp.
    pub fn open_datetime(&self) -> DateTime<Utc> {
        Utc.timestamp_millis_opt(self.open_time)
            .single()
            .unwrap_or_else(Utc::now)
    }
}

fn parse_ms(value: &Value) -> Result<i64, DataFetchError> {
    value
        .as_i64()
        .ok_or_else(|| DataFetchError::Adapter(format!("bad timestamp field: {value}")))
}

fn parse_price(value: &Value) -> Result<Decimal, DataFetchError> {
    match value {
        Value::String(s) => Decimal::from_str(s)
            .map_err(|e| DataFetchError::Adapter(format!("bad decimal '{s}': {e}"))),
        Value::Number(n) => Decimal::from_str(&n.to_string())
            .map_err(|e| DataFetchError::Adapter(format!("bad decimal '{n}': {e}"))),
        other => Err(DataFetchError::Adapter(format!("bad price field: {other}"))),
    }
}

/// Column-oriented OHLCV window handed to strategies.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct OhlcvSeries {
    pub timestamps: Vec<i64>,
    pub open: Vec<Decimal>,
    pub high: Vec<Decimal>,
    pub low: Vec<Decimal>,
    pub close: Vec<Decimal>,
    pub volume: Vec<Decimal>,
}

impl OhlcvSeries {
    pub fn from_klines(klines: &[Kline]) -> Self {
        let mut series = Self::with_capacity(klines.len());
        for k in klines {
            series.push(k);
        }
        series
    }

    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            timestamps: Vec::with_capacity(capacity),
            open: Vec::with_capacity(capacity),
            high: Vec::with_capacity(capacity),
            low: Vec::with_capacity(capacity),
            close: Vec::with_capacity(capacity),
            volume: Vec::with_capacity(capacity),
        }
    }

    pub fn push(&mut self, bar: &Kline) {
        self.timestamps.push(bar.open_time);
        self.open.push(bar.open);
        self.high.push(bar.high);
        self.low.push(bar.low);
        self.close.push(bar.close);
        self.volume.push(bar.volume);
    }

    pub fn len(&self) -> usize {
        self.timestamps.len()
    }

    pub fn is_empty(&self) -> bool {
        self.timestamps.is_empty()
    }
}

/// Latest market snapshot for a symbol.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Ticker {
    pub symbol: String,
    pub last_price: Decimal,
    pub bid_price: Option<Decimal>,
    pub ask_price: Option<Decimal>,
    pub volume_24h: Option<Decimal>,
    /// UTC epoch milliseconds
    pub timestamp: i64,
    /// Futures only
    pub mark_price: Option<Decimal>,
    pub index_price: Option<Decimal>,
    pub funding_rate: Option<Decimal>,
}

/// Bar interval.
///
/// The grammar is fixed: `{1,3,5,15,30}m`, `{1,2,4,6,8,12}h`, `{1,3}d`, `1w`,
/// `1M`. Months are calendar-advanced rather than fixed-width.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub enum Interval {
    Minutes(u32),
    Hours(u32),
    Days(u32),
    Weeks(u32),
    Months(u32),
}

impl Interval {
    const MINUTE_STEPS: [u32; 5] = [1, 3, 5, 15, 30];
    const HOUR_STEPS: [u32; 6] = [1, 2, 4, 6, 8, 12];
    const DAY_STEPS: [u32; 2] = [1, 3];

    /// Milliseconds spanned by one bar. `None` for calendar months.
    pub fn fixed_millis(&self) -> Option<i64> {
        match *self {
            Interval::Minutes(n) => Some(i64::from(n) * 60_000),
            Interval::Hours(n) => Some(i64::from(n) * 3_600_000),
            Interval::Days(n) => Some(i64::from(n) * 86_400_000),
            Interval::Weeks(n) => Some(i64::from(n) * 604_800_000),
            Interval::Months(_) => None,
        }
    }

    /// Advance a bar-open timestamp by one interval.
    pub fn advance(&self, open_time_ms: i64) -> i64 {
        match self.fixed_millis() {
            Some(ms) => open_time_ms + ms,
            None => {
                let months = match *self {
                    Interval::Months(n) => n,
                    _ => unreachable!(),
                };
                Utc.timestamp_millis_opt(open_time_ms)
                    .single()
                    .and_then(|dt| dt.checked_add_months(Months::new(months)))
                    .map(|dt| dt.timestamp_millis())
                    .unwrap_or(open_time_ms)
            }
        }
    }

    /// Whether a timestamp sits on this interval's bar boundary.
    /// Calendar months are checked on the first of the month at midnight.
    pub fn is_aligned(&self, open_time_ms: i64) -> bool {
        match self.fixed_millis() {
            Some(ms) => open_time_ms % ms == 0,
            None => Utc
                .timestamp_millis_opt(open_time_ms)
                .single()
                .map(|dt| {
                    dt.day() == 1 && dt.timestamp_millis() % 86_400_000 == 0
                })
                .unwrap_or(false),
        }
    }

    /// Normalize human aliases before parsing (`1min` -> `1m`, `1hour` -> `1h`).
    pub fn normalize(raw: &str) -> String {
        match raw.to_lowercase().as_str() {
            "1min" => "1m".into(),
            "3min" => "3m".into(),
            "5min" => "5m".into(),
            "15min" => "15m".into(),
            "30min" => "30m".into(),
            "60min" | "1hour" => "1h".into(),
            "4hour" => "4h".into(),
            "1day" => "1d".into(),
            "1week" => "1w".into(),
            other => {
                // The grammar's month unit is the single capitalized letter.
                if raw.ends_with('M') {
                    raw.to_string()
                } else {
                    other.to_string()
                }
            }
        }
    }
}

impl FromStr for Interval {
    type Err = String;

    fn from_str(raw: &str) -> Result<Self, Self::Err> {
        let s = Interval::normalize(raw);
        if s.len() < 2 {
            return Err(format!("unsupported interval: {raw}"));
        }
        let (count, unit) = s.split_at(s.len() - 1);
        let n: u32 = count
            .parse()
            .map_err(|_| format!("unsupported interval: {raw}"))?;

        let interval = match unit {
            "m" if Self::MINUTE_STEPS.contains(&n) => Interval::Minutes(n),
            "h" if Self::HOUR_STEPS.contains(&n) => Interval::Hours(n),
            "d" if Self::DAY_STEPS.contains(&n) => Interval::Days(n),
            "w" if n == 1 => Interval::Weeks(n),
            "M" if n == 1 => Interval::Months(n),
            _ => return Err(format!("unsupported interval: {raw}")),
        };
        Ok(interval)
    }
}

impl TryFrom<String> for Interval {
    type Error = String;
    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<Interval> for String {
    fn from(value: Interval) -> Self {
        value.to_string()
    }
}

impl fmt::Display for Interval {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match *self {
            Interval::Minutes(n) => write!(f, "{n}m"),
            Interval::Hours(n) => write!(f, "{n}h"),
            Interval::Days(n) => write!(f, "{n}d"),
            Interval::Weeks(n) => write!(f, "{n}w"),
            Interval::Months(n) => write!(f, "{n}M"),
        }
    }
}

/// Canonicalize an exchange-native pair (`BTCUSDT`) to the normal form
/// (`BTC/USDT`). Already-normal input passes through uppercased. Applied on
/// the inbound edge of every adapter and nowhere else.
pub fn normalize_symbol(symbol: &str) -> String {
    let upper = symbol.trim().to_uppercase();
    if upper.contains('/') {
        return upper;
    }
    for quote in ["USDT", "USDC", "BUSD", "USD", "BTC", "ETH"] {
        if let Some(base) = upper.strip_suffix(quote) {
            if !base.is_empty() {
                return format!("{base}/{quote}");
            }
        }
    }
    upper
}

/// Exchange-native form of a normalized symbol (`BTC/USDT` -> `BTCUSDT`).
pub fn denormalize_symbol(symbol: &str) -> String {
    symbol.replace('/', "")
}
