//! Market data feed boundary
//!
//! The pipeline core is synchronous; only this boundary is async. Services
//! that need a price at decision or close time take a `dyn PriceFeed` so
//! tests can inject a deterministic feed instead of hitting an exchange.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Mutex;
use std::time::Duration;
use thiserror::Error;
use tracing::info;

const BINANCE_REST_URL: &str = "https://api.binance.com/api/v3";
const REQUEST_TIMEOUT_SECS: u64 = 30;

#[derive(Debug, Error)]
pub enum FeedError {
    #[error("HTTP request failed: {0}")]
    Http(#[from] reqwest::Error),
    #[error("Exchange returned error status: {0}")]
    Status(reqwest::StatusCode),
    #[error("Malformed response: {0}")]
    Malformed(String),
    #[error("No price available for {0}")]
    NoPrice(String),
}

/// One OHLCV bar
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct Candle {
    pub open_time: i64,
    pub close_time: i64,
    pub open: f64,
    pub high: f64,
    pub low: f64,
    pub close: f64,
    pub volume: f64,
}

/// Async price source seam
#[async_trait]
pub trait PriceFeed: Send + Sync {
    fn name(&self) -> &'static str;

    /// Current price for a symbol like "BTCUSDT"
    async fn get_price(&self, symbol: &str) -> Result<f64, FeedError>;

    /// Historical klines, most recent last. `timeframe` uses exchange
    /// notation ("1m", "15m", "1h").
    async fn fetch_ohlcv(
        &self,
        symbol: &str,
        timeframe: &str,
        limit: usize,
    ) -> Result<Vec<Candle>, FeedError>;
}

/// Binance spot REST feed
pub struct BinanceFeed {
    client: reqwest::Client,
    base_url: String,
}

impl BinanceFeed {
    pub fn new() -> Self {
        Self::with_base_url(BINANCE_REST_URL)
    }

    pub fn with_base_url(base_url: impl Into<String>) -> Self {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(REQUEST_TIMEOUT_SECS))
            .build()
            .unwrap_or_default();
        Self {
            client,
            base_url: base_url.into(),
        }
    }
}

impl Default for BinanceFeed {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl PriceFeed for BinanceFeed {
    fn name(&self) -> &'static str {
        "Binance"
    }

    async fn get_price(&self, symbol: &str) -> Result<f64, FeedError> {
        let url = format!("{}/ticker/price?symbol={}", self.base_url, symbol);
        let response = self.client.get(&url).send().await?;
        if !response.status().is_success() {
            return Err(FeedError::Status(response.status()));
        }

        let body: serde_json::Value = response.json().await?;
        body["price"]
            .as_str()
            .and_then(|p| p.parse().ok())
            .ok_or_else(|| FeedError::Malformed(format!("no price field for {}", symbol)))
    }

    async fn fetch_ohlcv(
        &self,
        symbol: &str,
        timeframe: &str,
        limit: usize,
    ) -> Result<Vec<Candle>, FeedError> {
        let url = format!(
            "{}/klines?symbol={}&interval={}&limit={}",
            self.base_url, symbol, timeframe, limit
        );
        info!(symbol = %symbol, timeframe = %timeframe, "📥 Fetching klines from Binance...");

        let response = self.client.get(&url).send().await?;
        if !response.status().is_success() {
            return Err(FeedError::Status(response.status()));
        }

        // Array of arrays:
        // [[open_time, open, high, low, close, volume, close_time, ...], ...]
        let klines: Vec<Vec<serde_json::Value>> = response.json().await?;

        let candles: Vec<Candle> = klines
            .into_iter()
            .filter_map(|kline| {
                if kline.len() < 7 {
                    return None;
                }
                Some(Candle {
                    open_time: kline[0].as_i64()?,
                    open: kline[1].as_str()?.parse().ok()?,
                    high: kline[2].as_str()?.parse().ok()?,
                    low: kline[3].as_str()?.parse().ok()?,
                    close: kline[4].as_str()?.parse().ok()?,
                    volume: kline[5].as_str()?.parse().ok()?,
                    close_time: kline[6].as_i64()?,
                })
            })
            .collect();

        info!(symbol = %symbol, count = candles.len(), "✅ Klines fetched");
        Ok(candles)
    }
}

/// Fixed-price feed for tests and offline replay
pub struct StaticFeed {
    prices: Mutex<HashMap<String, f64>>,
}

impl StaticFeed {
    pub fn new(prices: impl IntoIterator<Item = (String, f64)>) -> Self {
        Self {
            prices: Mutex::new(prices.into_iter().collect()),
        }
    }

    pub fn set_price(&self, symbol: &str, price: f64) {
        let mut prices = match self.prices.lock() {
            Ok(g) => g,
            Err(poisoned) => poisoned.into_inner(),
        };
        prices.insert(symbol.to_string(), price);
    }
}

#[async_trait]
impl PriceFeed for StaticFeed {
    fn name(&self) -> &'static str {
        "Static"
    }

    async fn get_price(&self, symbol: &str) -> Result<f64, FeedError> {
        let prices = match self.prices.lock() {
            Ok(g) => g,
            Err(poisoned) => poisoned.into_inner(),
        };
        prices
            .get(symbol)
            .copied()
            .ok_or_else(|| FeedError::NoPrice(symbol.to_string()))
    }

    async fn fetch_ohlcv(
        &self,
        symbol: &str,
        _timeframe: &str,
        limit: usize,
    ) -> Result<Vec<Candle>, FeedError> {
        let price = self.get_price(symbol).await?;
        Ok(vec![
            Candle {
                open_time: 0,
                close_time: 0,
                open: price,
                high: price,
                low: price,
                close: price,
                volume: 0.0,
            };
            limit
        ])
    }
}
