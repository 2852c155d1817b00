use std::collections::HashMap;

use async_trait::async_trait;
use foliosync_exchanges::DailyPrices;

use crate::errors::Result;
use crate::platforms::PlatformDomain;
use crate::valuation::PortfolioHistoryRow;

/// Persistence for the daily portfolio history series.
#[async_trait]
pub trait PortfolioHistoryStore: Send + Sync {
    /// Replaces the whole series for a domain. The replay always recomputes
    /// from the first transaction, so partial updates are never needed.
    async fn replace_history(
        &self,
        domain: PlatformDomain,
        rows: &[PortfolioHistoryRow],
    ) -> Result<()>;
}

/// Cache of daily closes keyed by ticker. Lets a rebuild fetch only the tail
/// past the last cached date.
#[async_trait]
pub trait PriceCacheStore: Send + Sync {
    async fn load(&self, tickers: &[String]) -> Result<HashMap<String, DailyPrices>>;

    async fn store(&self, ticker: &str, prices: &DailyPrices) -> Result<()>;
}
