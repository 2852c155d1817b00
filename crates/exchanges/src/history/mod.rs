use async_trait::async_trait;
use chrono::NaiveDate;
use rust_decimal::Decimal;
use std::collections::BTreeMap;

use crate::errors::ExchangeError;

mod bybit;
mod moex;

pub use bybit::BybitPriceHistory;
pub use moex::MoexPriceHistory;

/// Daily close prices for one instrument over an inclusive date range.
pub type DailyPrices = BTreeMap<NaiveDate, Decimal>;

/// Source of historical daily close prices. One implementation per market:
/// Bybit spot klines for crypto, MOEX ISS for securities.
#[async_trait]
pub trait PriceHistoryProvider: Send + Sync {
    /// Fetches daily closes for `ticker` between `start` and `end`
    /// inclusive. Missing days (weekends, halts, unlisted ranges) are
    /// simply absent from the map.
    async fn fetch_range(
        &self,
        ticker: &str,
        start: NaiveDate,
        end: NaiveDate,
    ) -> Result<DailyPrices, ExchangeError>;
}
