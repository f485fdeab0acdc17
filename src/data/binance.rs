//! Binance REST adapter for spot and USD-margined perpetual markets.
//!
//! Market-data endpoints are public; account and order endpoints require
//! HMAC-SHA256 signed requests and therefore credentials. The adapter owns no
//! HTTP client of its own: the data center hands it the shared per-run
//! client.

use std::str::FromStr;

use async_trait::async_trait;
use hmac::{Hmac, Mac};
use reqwest::{Client, StatusCode};
use rust_decimal::Decimal;
use serde_json::Value;
use sha2::Sha256;
use tracing::debug;

use super::adapter::{
    AssetBalance, ExchangeAdapter, ExchangePosition, FuturesAdapter, KlineQuery, OrderInfo,
    OrderKind, OrderRequest, OrderSide, OrderStatus,
};
use super::types::{denormalize_symbol, normalize_symbol, Kline, MarketType, Ticker};
use crate::error::DataFetchError;

const SPOT_BASE_URL: &str = "https://api.binance.com";
const FUTURES_BASE_URL: &str = "https://fapi.binance.com";

type HmacSha256 = Hmac<Sha256>;

/// API credentials for signed endpoints.
#[derive(Clone)]
pub struct BinanceCredentials {
    pub api_key: String,
    pub api_secret: String,
}

impl BinanceCredentials {
    fn signature(&self, query: &str) -> String {
        let mut mac = HmacSha256::new_from_slice(self.api_secret.as_bytes())
            .unwrap_or_else(|_| HmacSha256::new_from_slice(b"-").unwrap());
        mac.update(query.as_bytes());
        hex::encode(mac.finalize().into_bytes())
    }
}

pub struct BinanceAdapter {
    client: Client,
    base_url: String,
    market_type: MarketType,
    credentials: Option<BinanceCredentials>,
}

impl BinanceAdapter {
    pub fn new(client: Client, market_type: MarketType) -> Self {
        let base_url = match market_type {
            MarketType::Spot => SPOT_BASE_URL,
            MarketType::Futures => FUTURES_BASE_URL,
        };
        Self {
            client,
            base_url: base_url.to_string(),
            market_type,
            credentials: None,
        }
    }

    pub fn with_base_url(mut self, base_url: impl Into<String>) -> Self {
        self.base_url = base_url.into();
        self
    }

    pub fn with_credentials(mut self, credentials: BinanceCredentials) -> Self {
        self.credentials = Some(credentials);
        self
    }

    fn api_prefix(&self) -> &'static str {
        match self.market_type {
            MarketType::Spot => "/api/v3",
            MarketType::Futures => "/fapi/v1",
        }
    }

    async fn get_public(
        &self,
        path: &str,
        params: &[(String, String)],
    ) -> Result<Value, DataFetchError> {
        let url = format!("{}{}", self.base_url, path);
        debug!(%url, "binance request");
        let response = self.client.get(&url).query(params).send().await?;
        Self::decode(response).await
    }

    async fn signed(
        &self,
        method: reqwest::Method,
        path: &str,
        mut params: Vec<(String, String)>,
    ) -> Result<Value, DataFetchError> {
        let credentials = self.credentials.as_ref().ok_or_else(|| {
            DataFetchError::Adapter("signed endpoint requires api credentials".into())
        })?;

        let timestamp = chrono::Utc::now().timestamp_millis();
        params.push(("timestamp".to_string(), timestamp.to_string()));
        let query = build_query_string(&params);
        let signature = credentials.signature(&query);

        let url = format!("{}{}?{}&signature={}", self.base_url, path, query, signature);
        let response = self
            .client
            .request(method, &url)
            .header("X-MBX-APIKEY", &credentials.api_key)
            .send()
            .await?;
        Self::decode(response).await
    }

    async fn decode(response: reqwest::Response) -> Result<Value, DataFetchError> {
        let status = response.status();
        if status == StatusCode::TOO_MANY_REQUESTS || status.as_u16() == 418 {
            return Err(DataFetchError::RateLimited(format!("http {status}")));
        }
        if status.is_server_error() {
            return Err(DataFetchError::Network(format!("http {status}")));
        }
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(DataFetchError::Adapter(format!("http {status}: {body}")));
        }
        response
            .json::<Value>()
            .await
            .map_err(|e| DataFetchError::Adapter(format!("bad json body: {e}")))
    }

    fn parse_klines(payload: &Value, limit: u32) -> Result<Vec<Kline>, DataFetchError> {
        let rows = payload
            .as_array()
            .ok_or_else(|| DataFetchError::Adapter("klines payload is not an array".into()))?;

        let mut bars = Vec::with_capacity(rows.len());
        for row in rows {
            bars.push(Kline::from_payload(row)?);
        }
        bars.sort_by_key(|b| b.open_time);
        bars.dedup_by_key(|b| b.open_time);
        bars.truncate(limit as usize);
        Ok(bars)
    }

    fn parse_decimal_field(value: &Value, field: &str) -> Result<Decimal, DataFetchError> {
        let raw = value
            .get(field)
            .ok_or_else(|| DataFetchError::Adapter(format!("missing field '{field}'")))?;
        match raw {
            Value::String(s) => Decimal::from_str(s)
                .map_err(|e| DataFetchError::Adapter(format!("bad '{field}': {e}"))),
            Value::Number(n) => Decimal::from_str(&n.to_string())
                .map_err(|e| DataFetchError::Adapter(format!("bad '{field}': {e}"))),
            other => Err(DataFetchError::Adapter(format!("bad '{field}': {other}"))),
        }
    }

    fn parse_ticker(&self, payload: &Value, symbol: &str) -> Result<Ticker, DataFetchError> {
        Ok(Ticker {
            symbol: normalize_symbol(symbol),
            last_price: Self::parse_decimal_field(payload, "lastPrice")?,
            bid_price: Self::parse_decimal_field(payload, "bidPrice").ok(),
            ask_price: Self::parse_decimal_field(payload, "askPrice").ok(),
            volume_24h: Self::parse_decimal_field(payload, "volume").ok(),
            timestamp: payload
                .get("closeTime")
                .and_then(Value::as_i64)
                .unwrap_or_else(|| chrono::Utc::now().timestamp_millis()),
            mark_price: None,
            index_price: None,
            funding_rate: None,
        })
    }
}

fn build_query_string(params: &[(String, String)]) -> String {
    params
        .iter()
        .map(|(k, v)| format!("{k}={v}"))
        .collect::<Vec<_>>()
        .join("&")
}

fn parse_order_status(raw: &str) -> OrderStatus {
    match raw {
        "FILLED" => OrderStatus::Filled,
        "PARTIALLY_FILLED" => OrderStatus::PartiallyFilled,
        "CANCELED" | "EXPIRED" => OrderStatus::Canceled,
        "REJECTED" => OrderStatus::Rejected,
        _ => OrderStatus::New,
    }
}

#[async_trait]
impl ExchangeAdapter for BinanceAdapter {
    fn exchange_id(&self) -> &str {
        "binance"
    }

    fn market_type(&self) -> MarketType {
        self.market_type
    }

    async fn get_klines(&self, query: &KlineQuery) -> Result<Vec<Kline>, DataFetchError> {
        let mut params = vec![
            ("symbol".to_string(), denormalize_symbol(&query.symbol)),
            ("interval".to_string(), query.interval.to_string()),
            ("limit".to_string(), query.limit.to_string()),
        ];
        if let Some(start) = query.start_ms {
            params.push(("startTime".to_string(), start.to_string()));
        }
        if let Some(end) = query.end_ms {
            // The range is half-open; the exchange treats endTime inclusively.
            params.push(("endTime".to_string(), (end - 1).to_string()));
        }

        let path = format!("{}/klines", self.api_prefix());
        let payload = self.get_public(&path, &params).await?;
        Self::parse_klines(&payload, query.limit)
    }

    async fn get_ticker(&self, symbol: &str) -> Result<Ticker, DataFetchError> {
        let params = vec![("symbol".to_string(), denormalize_symbol(symbol))];
        let path = format!("{}/ticker/24hr", self.api_prefix());
        let payload = self.get_public(&path, &params).await?;
        let mut ticker = self.parse_ticker(&payload, symbol)?;

        if self.market_type == MarketType::Futures {
            let premium = self
                .get_public("/fapi/v1/premiumIndex", &params)
                .await?;
            ticker.mark_price = Self::parse_decimal_field(&premium, "markPrice").ok();
            ticker.index_price = Self::parse_decimal_field(&premium, "indexPrice").ok();
            ticker.funding_rate = Self::parse_decimal_field(&premium, "lastFundingRate").ok();
        }
        Ok(ticker)
    }

    async fn get_balance(&self) -> Result<Vec<AssetBalance>, DataFetchError> {
        let path = match self.market_type {
            MarketType::Spot => "/api/v3/account".to_string(),
            MarketType::Futures => "/fapi/v2/balance".to_string(),
        };
        let payload = self.signed(reqwest::Method::GET, &path, Vec::new()).await?;

        let rows = match self.market_type {
            MarketType::Spot => payload
                .get("balances")
                .and_then(Value::as_array)
                .cloned()
                .unwrap_or_default(),
            MarketType::Futures => payload.as_array().cloned().unwrap_or_default(),
        };

        let mut balances = Vec::new();
        for row in &rows {
            let currency = row
                .get("asset")
                .and_then(Value::as_str)
                .unwrap_or_default()
                .to_string();
            let free = Self::parse_decimal_field(row, "free")
                .or_else(|_| Self::parse_decimal_field(row, "availableBalance"))?;
            let locked =
                Self::parse_decimal_field(row, "locked").unwrap_or(Decimal::ZERO);
            balances.push(AssetBalance {
                currency,
                free,
                locked,
            });
        }
        Ok(balances)
    }

    async fn place_order(&self, order: &OrderRequest) -> Result<OrderInfo, DataFetchError> {
        let mut params = vec![
            ("symbol".to_string(), denormalize_symbol(&order.symbol)),
            (
                "side".to_string(),
                match order.side {
                    OrderSide::Buy => "BUY".to_string(),
                    OrderSide::Sell => "SELL".to_string(),
                },
            ),
            (
                "type".to_string(),
                match order.kind {
                    OrderKind::Market => "MARKET".to_string(),
                    OrderKind::Limit => "LIMIT".to_string(),
                },
            ),
            ("quantity".to_string(), order.quantity.to_string()),
        ];
        if let Some(price) = order.price {
            params.push(("price".to_string(), price.to_string()));
            params.push(("timeInForce".to_string(), "GTC".to_string()));
        }

        let path = format!("{}/order", self.api_prefix());
        let payload = self.signed(reqwest::Method::POST, &path, params).await?;
        Ok(OrderInfo {
            order_id: payload
                .get("orderId")
                .map(|v| v.to_string())
                .unwrap_or_default(),
            symbol: normalize_symbol(&order.symbol),
            side: order.side,
            status: parse_order_status(
                payload.get("status").and_then(Value::as_str).unwrap_or("NEW"),
            ),
            executed_qty: Self::parse_decimal_field(&payload, "executedQty")
                .unwrap_or(Decimal::ZERO),
            avg_price: Self::parse_decimal_field(&payload, "avgPrice").ok(),
        })
    }

    async fn cancel_order(&self, symbol: &str, order_id: &str) -> Result<(), DataFetchError> {
        let params = vec![
            ("symbol".to_string(), denormalize_symbol(symbol)),
            ("orderId".to_string(), order_id.to_string()),
        ];
        let path = format!("{}/order", self.api_prefix());
        self.signed(reqwest::Method::DELETE, &path, params)
            .await
            .map(|_| ())
    }

    async fn get_order(&self, symbol: &str, order_id: &str) -> Result<OrderInfo, DataFetchError> {
        let params = vec![
            ("symbol".to_string(), denormalize_symbol(symbol)),
            ("orderId".to_string(), order_id.to_string()),
        ];
        let path = format!("{}/order", self.api_prefix());
        let payload = self.signed(reqwest::Method::GET, &path, params).await?;
        Ok(OrderInfo {
            order_id: order_id.to_string(),
            symbol: normalize_symbol(symbol),
            side: match payload.get("side").and_then(Value::as_str) {
                Some("SELL") => OrderSide::Sell,
                _ => OrderSide::Buy,
            },
            status: parse_order_status(
                payload.get("status").and_then(Value::as_str).unwrap_or("NEW"),
            ),
            executed_qty: Self::parse_decimal_field(&payload, "executedQty")
                .unwrap_or(Decimal::ZERO),
            avg_price: Self::parse_decimal_field(&payload, "avgPrice").ok(),
        })
    }
}

#[async_trait]
impl FuturesAdapter for BinanceAdapter {
    async fn set_leverage(&self, symbol: &str, leverage: u32) -> Result<(), DataFetchError> {
        let params = vec![
            ("symbol".to_string(), denormalize_symbol(symbol)),
            ("leverage".to_string(), leverage.to_string()),
        ];
        self.signed(reqwest::Method::POST, "/fapi/v1/leverage", params)
            .await
            .map(|_| ())
    }

    async fn get_position(&self, symbol: &str) -> Result<Vec<ExchangePosition>, DataFetchError> {
        let params = vec![("symbol".to_string(), denormalize_symbol(symbol))];
        let payload = self
            .signed(reqwest::Method::GET, "/fapi/v2/positionRisk", params)
            .await?;
        let rows = payload.as_array().cloned().unwrap_or_default();

        let mut positions = Vec::new();
        for row in &rows {
            let size = Self::parse_decimal_field(row, "positionAmt")?;
            if size.is_zero() {
                continue;
            }
            positions.push(ExchangePosition {
                symbol: normalize_symbol(symbol),
                side: row
                    .get("positionSide")
                    .and_then(Value::as_str)
                    .unwrap_or("BOTH")
                    .to_lowercase(),
                size: size.abs(),
                entry_price: Self::parse_decimal_field(row, "entryPrice")?,
                mark_price: Self::parse_decimal_field(row, "markPrice")?,
                unrealized_pnl: Self::parse_decimal_field(row, "unRealizedProfit")
                    .unwrap_or(Decimal::ZERO),
                leverage: row
                    .get("leverage")
                    .and_then(Value::as_str)
                    .and_then(|s| s.parse().ok())
                    .unwrap_or(1),
            });
        }
        Ok(positions)
    }

    async fn get_mark_price(&self, symbol: &str) -> Result<Decimal, DataFetchError> {
        let params = vec![("symbol".to_string(), denormalize_symbol(symbol))];
        let payload = self.get_public("/fapi/v1/premiumIndex", &params).await?;
        Self::parse_decimal_field(&payload, "markPrice")
    }

    async fn get_funding_rate(&self, symbol: &str) -> Result<Decimal, DataFetchError> {
        let params = vec![("symbol".to_string(), denormalize_symbol(symbol))];
        let payload = self.get_public("/fapi/v1/premiumIndex", &params).await?;
        Self::parse_decimal_field(&payload, "lastFundingRate")
    }
}
