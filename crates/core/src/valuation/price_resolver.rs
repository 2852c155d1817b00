use std::collections::HashMap;
use std::sync::Arc;

use chrono::{Duration, NaiveDate};
use foliosync_exchanges::{DailyPrices, PriceHistoryProvider};
use futures::{stream, StreamExt};
use log::{debug, warn};

use crate::errors::Result;
use crate::valuation::PriceCacheStore;

const PRICE_FETCH_CONCURRENCY: usize = 2;

/// Resolves daily closes for a set of tickers, serving cached rows and
/// fetching only the tail past the last cached date.
pub struct PriceResolver {
    cache: Arc<dyn PriceCacheStore>,
    provider: Arc<dyn PriceHistoryProvider>,
}

impl PriceResolver {
    pub fn new(cache: Arc<dyn PriceCacheStore>, provider: Arc<dyn PriceHistoryProvider>) -> Self {
        Self { cache, provider }
    }

    /// A ticker whose fetch fails keeps whatever the cache had; the replay
    /// warns per missing price instead of the whole rebuild failing.
    pub async fn resolve(
        &self,
        tickers: &[String],
        start: NaiveDate,
        end: NaiveDate,
    ) -> Result<HashMap<String, DailyPrices>> {
        let mut resolved = self.cache.load(tickers).await?;

        let jobs: Vec<(String, NaiveDate)> = tickers
            .iter()
            .map(|ticker| {
                let from = resolved
                    .get(ticker)
                    .and_then(|prices| prices.keys().next_back().copied())
                    .map(|last| last + Duration::days(1))
                    .unwrap_or(start);
                (ticker.clone(), from)
            })
            .filter(|(_, from)| *from <= end)
            .collect();

        let provider = &self.provider;
        let mut fetches = stream::iter(jobs.into_iter().map(|(ticker, from)| async move {
            let result = provider.fetch_range(&ticker, from, end).await;
            (ticker, result)
        }))
        .buffer_unordered(PRICE_FETCH_CONCURRENCY);

        while let Some((ticker, result)) = fetches.next().await {
            match result {
                Ok(prices) if prices.is_empty() => {
                    debug!("No new prices for {ticker}");
                }
                Ok(prices) => {
                    self.cache.store(&ticker, &prices).await?;
                    resolved.entry(ticker).or_default().extend(prices);
                }
                Err(err) => {
                    warn!("Price history fetch failed for {ticker}: {err}");
                }
            }
        }
        Ok(resolved)
    }
}
