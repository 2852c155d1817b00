use async_trait::async_trait;
use chrono::NaiveDate;
use log::debug;
use rust_decimal::Decimal;
use serde_json::Value;
use std::time::Duration as StdDuration;
use tokio::time::sleep;

use crate::errors::ExchangeError;
use crate::history::{DailyPrices, PriceHistoryProvider};
use crate::http::RateLimitedHttpClient;

const BASE_URL: &str = "https://iss.moex.com";

/// Daily close prices for Moscow Exchange listed securities via the public
/// ISS history endpoint, quoted in RUB.
pub struct MoexPriceHistory {
    http: RateLimitedHttpClient,
    base_url: String,
}

impl Default for MoexPriceHistory {
    fn default() -> Self {
        Self::new()
    }
}

impl MoexPriceHistory {
    pub fn new() -> Self {
        Self {
            http: RateLimitedHttpClient::new(),
            base_url: BASE_URL.to_string(),
        }
    }
}

#[async_trait]
impl PriceHistoryProvider for MoexPriceHistory {
    async fn fetch_range(
        &self,
        ticker: &str,
        start: NaiveDate,
        end: NaiveDate,
    ) -> Result<DailyPrices, ExchangeError> {
        let mut prices = DailyPrices::new();
        let mut offset = 0usize;

        loop {
            let url = format!(
                "{}/iss/history/engines/stock/markets/shares/securities/{}.json\
                 ?iss.meta=off&history.columns=TRADEDATE,CLOSE&from={}&till={}&start={}",
                self.base_url,
                ticker,
                start.format("%Y-%m-%d"),
                end.format("%Y-%m-%d"),
                offset
            );
            debug!("MOEX history fetch for {} at offset {}", ticker, offset);
            let resp = self.http.get_json(&url, &[]).await?;

            let rows = resp["history"]["data"].as_array().cloned().unwrap_or_default();
            if rows.is_empty() {
                break;
            }
            let page_len = rows.len();
            for row in &rows {
                if let Some((date, close)) = parse_history_row(row) {
                    prices.insert(date, close);
                }
            }

            match next_offset(&resp) {
                Some(next) if next > offset => offset = next,
                // Without a cursor, a full default page may still continue.
                None if page_len >= 100 => offset += page_len,
                _ => break,
            }
            sleep(StdDuration::from_millis(200)).await;
        }

        Ok(prices)
    }
}

/// Rows are [TRADEDATE, CLOSE]; CLOSE is null on days without a session
/// close and those rows are dropped.
fn parse_history_row(row: &Value) -> Option<(NaiveDate, Decimal)> {
    let date_str = row.get(0)?.as_str()?;
    let date = NaiveDate::parse_from_str(date_str, "%Y-%m-%d").ok()?;
    let close = match row.get(1)? {
        Value::Number(n) => Decimal::try_from(n.as_f64()?).ok()?,
        Value::String(s) => s.parse::<Decimal>().ok()?,
        _ => return None,
    };
    Some((date, close))
}

fn next_offset(resp: &Value) -> Option<usize> {
    let cursor = resp["history.cursor"]["data"].as_array()?.first()?;
    let index = cursor.get(0)?.as_u64()? as usize;
    let total = cursor.get(1)?.as_u64()? as usize;
    let page_size = cursor.get(2)?.as_u64()? as usize;
    let next = index + page_size;
    if next < total {
        Some(next)
    } else {
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;
    use serde_json::json;

    #[test]
    fn test_parse_history_row() {
        let row = json!(["2024-03-15", 287.3]);
        let (date, close) = parse_history_row(&row).unwrap();
        assert_eq!(date, NaiveDate::from_ymd_opt(2024, 3, 15).unwrap());
        assert_eq!(close, dec!(287.3));
    }

    #[test]
    fn test_parse_history_row_drops_null_close() {
        assert!(parse_history_row(&json!(["2024-03-16", null])).is_none());
    }

    #[test]
    fn test_next_offset_from_cursor() {
        let resp = json!({"history.cursor": {"data": [[0, 250, 100]]}});
        assert_eq!(next_offset(&resp), Some(100));
        let done = json!({"history.cursor": {"data": [[200, 250, 100]]}});
        assert_eq!(next_offset(&done), None);
    }
}
