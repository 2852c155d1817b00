use async_trait::async_trait;
use chrono::{DateTime, Duration, NaiveDate, NaiveTime, Utc};
use log::{debug, warn};
use rust_decimal::Decimal;
use serde_json::Value;
use std::time::Duration as StdDuration;
use tokio::time::sleep;

use crate::errors::ExchangeError;
use crate::history::{DailyPrices, PriceHistoryProvider};
use crate::http::RateLimitedHttpClient;

const BASE_URL: &str = "https://api.bybit.com";
const KLINE_LIMIT: usize = 1000;

/// Daily close prices from the public Bybit spot kline endpoint, quoted
/// against USDT.
pub struct BybitPriceHistory {
    http: RateLimitedHttpClient,
    base_url: String,
}

impl Default for BybitPriceHistory {
    fn default() -> Self {
        Self::new()
    }
}

impl BybitPriceHistory {
    pub fn new() -> Self {
        Self {
            http: RateLimitedHttpClient::new(),
            base_url: BASE_URL.to_string(),
        }
    }
}

#[async_trait]
impl PriceHistoryProvider for BybitPriceHistory {
    async fn fetch_range(
        &self,
        ticker: &str,
        start: NaiveDate,
        end: NaiveDate,
    ) -> Result<DailyPrices, ExchangeError> {
        let symbol = format!("{}USDT", ticker);
        let mut prices = DailyPrices::new();
        let mut current_start = start;

        // Pages forward in 1000-candle steps until the range is covered or
        // the exchange has no more data for the symbol.
        while current_start <= end {
            let start_ms = DateTime::<Utc>::from_naive_utc_and_offset(
                current_start.and_time(NaiveTime::MIN),
                Utc,
            )
            .timestamp_millis();
            let url = format!(
                "{}/v5/market/kline?category=spot&symbol={}&interval=D&start={}&limit={}",
                self.base_url, symbol, start_ms, KLINE_LIMIT
            );

            debug!(
                "Bybit kline fetch for {} from {}",
                symbol,
                current_start.format("%Y-%m-%d")
            );
            let resp = self.http.get_json(&url, &[]).await?;
            let ret_code = resp["retCode"].as_i64().unwrap_or(-1);
            let klines = resp["result"]["list"].as_array().cloned().unwrap_or_default();
            if ret_code != 0 || klines.is_empty() {
                if ret_code != 0 {
                    warn!(
                        "Bybit kline error for {}: {}",
                        symbol,
                        resp["retMsg"].as_str().unwrap_or("")
                    );
                }
                break;
            }

            let mut last_date: Option<NaiveDate> = None;
            for kline in &klines {
                let Some(date) = kline_date(kline) else {
                    continue;
                };
                if date >= start && date <= end {
                    if let Some(close) = kline_close(kline) {
                        prices.insert(date, close);
                    }
                }
                last_date = Some(last_date.map_or(date, |d| d.max(date)));
            }

            match last_date {
                Some(last) if last >= current_start => {
                    current_start = last + Duration::days(1);
                }
                _ => break,
            }
            sleep(StdDuration::from_millis(200)).await;
        }

        Ok(prices)
    }
}

fn kline_date(kline: &Value) -> Option<NaiveDate> {
    let ms = kline
        .get(0)?
        .as_str()
        .and_then(|s| s.parse::<i64>().ok())
        .or_else(|| kline.get(0)?.as_i64())?;
    DateTime::<Utc>::from_timestamp_millis(ms).map(|dt| dt.date_naive())
}

fn kline_close(kline: &Value) -> Option<Decimal> {
    kline.get(4)?.as_str().and_then(|s| s.parse::<Decimal>().ok())
}
