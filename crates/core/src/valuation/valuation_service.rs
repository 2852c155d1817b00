use std::collections::BTreeSet;
use std::sync::Arc;

use chrono::Utc;
use foliosync_exchanges::PriceHistoryProvider;
use log::{info, warn};
use rust_decimal::Decimal;

use crate::constants::is_stablecoin;
use crate::errors::Result;
use crate::fx::QuoteRateProvider;
use crate::platforms::PlatformDomain;
use crate::sync::SyncOutcome;
use crate::transactions::{Transaction, TransactionStore};
use crate::valuation::replay::{replay_crypto_history, replay_securities_history};
use crate::valuation::{PortfolioHistoryStore, PriceCacheStore, PriceResolver};

/// Rebuilds the daily portfolio history series from stored transactions.
pub struct ValuationService {
    transactions: Arc<dyn TransactionStore>,
    history: Arc<dyn PortfolioHistoryStore>,
    price_cache: Arc<dyn PriceCacheStore>,
    crypto_prices: Arc<dyn PriceHistoryProvider>,
    securities_prices: Arc<dyn PriceHistoryProvider>,
    quote_rate: Arc<dyn QuoteRateProvider>,
}

impl ValuationService {
    pub fn new(
        transactions: Arc<dyn TransactionStore>,
        history: Arc<dyn PortfolioHistoryStore>,
        price_cache: Arc<dyn PriceCacheStore>,
        crypto_prices: Arc<dyn PriceHistoryProvider>,
        securities_prices: Arc<dyn PriceHistoryProvider>,
        quote_rate: Arc<dyn QuoteRateProvider>,
    ) -> Self {
        Self {
            transactions,
            history,
            price_cache,
            crypto_prices,
            securities_prices,
            quote_rate,
        }
    }

    /// Recomputes the whole series for a domain, from the first stored
    /// transaction through today, and replaces the persisted history.
    pub async fn rebuild_history(&self, domain: PlatformDomain) -> Result<SyncOutcome> {
        let mut transactions = self.transactions.list_for_domain(domain).await?;
        transactions.sort_by(|a, b| a.timestamp.cmp(&b.timestamp));
        if transactions.is_empty() {
            return Ok(SyncOutcome {
                success: false,
                status: "No transactions found.".to_string(),
            });
        }

        let start = transactions[0].timestamp.date_naive();
        let end = Utc::now().date_naive();
        let tickers = replay_tickers(domain, &transactions);

        let provider = match domain {
            PlatformDomain::Crypto => self.crypto_prices.clone(),
            PlatformDomain::Securities => self.securities_prices.clone(),
        };
        let resolver = PriceResolver::new(self.price_cache.clone(), provider);
        let prices = resolver.resolve(&tickers, start, end).await?;

        let rows = match domain {
            PlatformDomain::Crypto => {
                let rate = match self.quote_rate.quote_rate().await {
                    Ok(Some(rate)) => rate,
                    Ok(None) => Decimal::ONE,
                    Err(err) => {
                        warn!("Quote rate unavailable, totals stay in USDT: {err}");
                        Decimal::ONE
                    }
                };
                replay_crypto_history(&transactions, &prices, rate, end)
            }
            PlatformDomain::Securities => replay_securities_history(&transactions, &prices, end),
        };

        self.history.replace_history(domain, &rows).await?;
        info!("Rebuilt {domain} history: {} days", rows.len());
        Ok(SyncOutcome {
            success: true,
            status: format!("Success: rebuilt {} days of portfolio history.", rows.len()),
        })
    }
}

/// Tickers the replay needs prices for. Stablecoins are valued at 1 USDT so
/// they are never fetched; securities positions only track `asset1_ticker`.
fn replay_tickers(domain: PlatformDomain, transactions: &[Transaction]) -> Vec<String> {
    let mut tickers = BTreeSet::new();
    for tx in transactions {
        match domain {
            PlatformDomain::Crypto => {
                if !is_stablecoin(&tx.asset1_ticker) {
                    tickers.insert(tx.asset1_ticker.clone());
                }
                if let Some(ticker) = &tx.asset2_ticker {
                    if !is_stablecoin(ticker) {
                        tickers.insert(ticker.clone());
                    }
                }
            }
            PlatformDomain::Securities => {
                tickers.insert(tx.asset1_ticker.clone());
            }
        }
    }
    tickers.into_iter().collect()
}
