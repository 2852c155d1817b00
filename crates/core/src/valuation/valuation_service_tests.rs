#[cfg(test)]
mod tests {
    use std::collections::{HashMap, HashSet};
    use std::sync::{Arc, Mutex};

    use async_trait::async_trait;
    use chrono::{DateTime, Duration, NaiveDate, TimeZone, Utc};
    use foliosync_exchanges::{
        DailyPrices, ExchangeError, NormalizedTransaction, PriceHistoryProvider, TransactionKind,
    };
    use rust_decimal::Decimal;
    use rust_decimal_macros::dec;

    use crate::errors::Result;
    use crate::fx::FixedQuoteRate;
    use crate::platforms::PlatformDomain;
    use crate::transactions::{Transaction, TransactionStore};
    use crate::valuation::{
        PortfolioHistoryRow, PortfolioHistoryStore, PriceCacheStore, ValuationService,
    };

    // --- Mocks ---

    #[derive(Default)]
    struct MockTransactionStore {
        transactions: Vec<Transaction>,
    }

    #[async_trait]
    impl TransactionStore for MockTransactionStore {
        async fn existing_exchange_tx_ids(&self, _platform_id: i64) -> Result<HashSet<String>> {
            Ok(HashSet::new())
        }

        async fn commit_batch(
            &self,
            _platform_id: i64,
            _records: &[NormalizedTransaction],
            _cursor: DateTime<Utc>,
        ) -> Result<()> {
            Ok(())
        }

        async fn list_for_domain(&self, _domain: PlatformDomain) -> Result<Vec<Transaction>> {
            Ok(self.transactions.clone())
        }

        async fn known_tickers(&self, _platform_id: i64) -> Result<Vec<String>> {
            Ok(Vec::new())
        }
    }

    #[derive(Default)]
    struct MockHistoryStore {
        replaced: Mutex<Vec<(PlatformDomain, Vec<PortfolioHistoryRow>)>>,
    }

    #[async_trait]
    impl PortfolioHistoryStore for MockHistoryStore {
        async fn replace_history(
            &self,
            domain: PlatformDomain,
            rows: &[PortfolioHistoryRow],
        ) -> Result<()> {
            self.replaced.lock().unwrap().push((domain, rows.to_vec()));
            Ok(())
        }
    }

    #[derive(Default)]
    struct MockPriceCache {
        cached: HashMap<String, DailyPrices>,
        stored: Mutex<Vec<(String, DailyPrices)>>,
    }

    #[async_trait]
    impl PriceCacheStore for MockPriceCache {
        async fn load(&self, tickers: &[String]) -> Result<HashMap<String, DailyPrices>> {
            Ok(self
                .cached
                .iter()
                .filter(|(ticker, _)| tickers.contains(ticker))
                .map(|(ticker, prices)| (ticker.clone(), prices.clone()))
                .collect())
        }

        async fn store(&self, ticker: &str, prices: &DailyPrices) -> Result<()> {
            self.stored
                .lock()
                .unwrap()
                .push((ticker.to_string(), prices.clone()));
            Ok(())
        }
    }

    #[derive(Default)]
    struct MockPriceHistory {
        prices: HashMap<String, DailyPrices>,
        fail: bool,
        requests: Mutex<Vec<(String, NaiveDate, NaiveDate)>>,
    }

    #[async_trait]
    impl PriceHistoryProvider for MockPriceHistory {
        async fn fetch_range(
            &self,
            ticker: &str,
            start: NaiveDate,
            end: NaiveDate,
        ) -> std::result::Result<DailyPrices, ExchangeError> {
            self.requests
                .lock()
                .unwrap()
                .push((ticker.to_string(), start, end));
            if self.fail {
                return Err(ExchangeError::Network("timeout".to_string()));
            }
            Ok(self
                .prices
                .get(ticker)
                .map(|prices| {
                    prices
                        .range(start..=end)
                        .map(|(date, price)| (*date, *price))
                        .collect()
                })
                .unwrap_or_default())
        }
    }

    // --- Helpers ---

    fn days_ago(days: i64) -> NaiveDate {
        Utc::now().date_naive() - Duration::days(days)
    }

    fn deposit(id: i64, day: NaiveDate, ticker: &str, amount: Decimal) -> Transaction {
        Transaction {
            id,
            platform_id: 1,
            exchange_tx_id: format!("tx_{id}"),
            timestamp: Utc.from_utc_datetime(&day.and_hms_opt(8, 0, 0).unwrap()),
            kind: TransactionKind::Deposit,
            raw_kind: "Deposit".to_string(),
            asset1_ticker: ticker.to_string(),
            asset1_amount: amount,
            asset2_ticker: None,
            asset2_amount: None,
            fee_amount: None,
            fee_currency: None,
            execution_price: None,
            description: None,
        }
    }

    fn service(
        transactions: Arc<MockTransactionStore>,
        history: Arc<MockHistoryStore>,
        cache: Arc<MockPriceCache>,
        prices: Arc<MockPriceHistory>,
        rate: Decimal,
    ) -> ValuationService {
        ValuationService::new(
            transactions,
            history,
            cache,
            prices.clone(),
            prices,
            Arc::new(FixedQuoteRate(rate)),
        )
    }

    // --- Tests ---

    #[tokio::test]
    async fn rebuild_replaces_full_series_with_quote_rate_applied() {
        let transactions = Arc::new(MockTransactionStore {
            transactions: vec![deposit(1, days_ago(2), "USDT", dec!(100))],
        });
        let history = Arc::new(MockHistoryStore::default());
        let service = service(
            transactions,
            history.clone(),
            Arc::new(MockPriceCache::default()),
            Arc::new(MockPriceHistory::default()),
            dec!(90),
        );

        let outcome = service
            .rebuild_history(PlatformDomain::Crypto)
            .await
            .unwrap();
        assert!(outcome.success);
        assert_eq!(outcome.status, "Success: rebuilt 3 days of portfolio history.");

        let replaced = history.replaced.lock().unwrap();
        let (domain, rows) = &replaced[0];
        assert_eq!(*domain, PlatformDomain::Crypto);
        assert_eq!(rows.len(), 3);
        assert!(rows.iter().all(|r| r.total_value == dec!(9000)));
    }

    #[tokio::test]
    async fn cached_prices_short_circuit_fetching() {
        let start = days_ago(2);
        let cached: DailyPrices = (0..=2)
            .map(|back| (days_ago(back), dec!(50000)))
            .collect();
        let cache = Arc::new(MockPriceCache {
            cached: [("BTC".to_string(), cached)].into_iter().collect(),
            ..Default::default()
        });
        let provider = Arc::new(MockPriceHistory::default());
        let transactions = Arc::new(MockTransactionStore {
            transactions: vec![deposit(1, start, "BTC", dec!(1))],
        });
        let history = Arc::new(MockHistoryStore::default());
        let service = service(
            transactions,
            history.clone(),
            cache,
            provider.clone(),
            Decimal::ONE,
        );

        service
            .rebuild_history(PlatformDomain::Crypto)
            .await
            .unwrap();
        assert!(provider.requests.lock().unwrap().is_empty());

        let replaced = history.replaced.lock().unwrap();
        assert!(replaced[0].1.iter().all(|r| r.total_value == dec!(50000)));
    }

    #[tokio::test]
    async fn tail_fetch_starts_after_last_cached_date() {
        let start = days_ago(2);
        let cached: DailyPrices = [(days_ago(2), dec!(100)), (days_ago(1), dec!(110))]
            .into_iter()
            .collect();
        let cache = Arc::new(MockPriceCache {
            cached: [("BTC".to_string(), cached)].into_iter().collect(),
            ..Default::default()
        });
        let fresh: DailyPrices = [(days_ago(0), dec!(120))].into_iter().collect();
        let provider = Arc::new(MockPriceHistory {
            prices: [("BTC".to_string(), fresh)].into_iter().collect(),
            ..Default::default()
        });
        let transactions = Arc::new(MockTransactionStore {
            transactions: vec![deposit(1, start, "BTC", dec!(1))],
        });
        let service = service(
            transactions,
            Arc::new(MockHistoryStore::default()),
            cache.clone(),
            provider.clone(),
            Decimal::ONE,
        );

        service
            .rebuild_history(PlatformDomain::Crypto)
            .await
            .unwrap();

        let requests = provider.requests.lock().unwrap();
        assert_eq!(
            requests.as_slice(),
            &[("BTC".to_string(), days_ago(0), days_ago(0))]
        );

        let stored = cache.stored.lock().unwrap();
        assert_eq!(stored.len(), 1);
        assert_eq!(stored[0].0, "BTC");
        assert_eq!(stored[0].1.get(&days_ago(0)), Some(&dec!(120)));
    }

    #[tokio::test]
    async fn stablecoin_only_portfolio_fetches_nothing() {
        let provider = Arc::new(MockPriceHistory::default());
        let transactions = Arc::new(MockTransactionStore {
            transactions: vec![deposit(1, days_ago(1), "USDT", dec!(250))],
        });
        let service = service(
            transactions,
            Arc::new(MockHistoryStore::default()),
            Arc::new(MockPriceCache::default()),
            provider.clone(),
            Decimal::ONE,
        );

        service
            .rebuild_history(PlatformDomain::Crypto)
            .await
            .unwrap();
        assert!(provider.requests.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn provider_failure_keeps_cached_series() {
        let cached: DailyPrices = [(days_ago(1), dec!(200))].into_iter().collect();
        let cache = Arc::new(MockPriceCache {
            cached: [("SBER".to_string(), cached)].into_iter().collect(),
            ..Default::default()
        });
        let provider = Arc::new(MockPriceHistory {
            fail: true,
            ..Default::default()
        });
        let transactions = Arc::new(MockTransactionStore {
            transactions: vec![{
                let mut tx = deposit(1, days_ago(1), "SBER", dec!(5));
                tx.kind = TransactionKind::Buy;
                tx
            }],
        });
        let history = Arc::new(MockHistoryStore::default());
        let service = service(
            transactions,
            history.clone(),
            cache,
            provider,
            Decimal::ONE,
        );

        let outcome = service
            .rebuild_history(PlatformDomain::Securities)
            .await
            .unwrap();
        assert!(outcome.success);
        assert_eq!(outcome.status, "Success: rebuilt 2 days of portfolio history.");

        let replaced = history.replaced.lock().unwrap();
        assert!(replaced[0].1.iter().all(|r| r.total_value == dec!(1000)));
    }

    #[tokio::test]
    async fn no_transactions_reports_failure_and_leaves_history_untouched() {
        let history = Arc::new(MockHistoryStore::default());
        let service = service(
            Arc::new(MockTransactionStore::default()),
            history.clone(),
            Arc::new(MockPriceCache::default()),
            Arc::new(MockPriceHistory::default()),
            Decimal::ONE,
        );

        let outcome = service
            .rebuild_history(PlatformDomain::Crypto)
            .await
            .unwrap();
        assert!(!outcome.success);
        assert_eq!(outcome.status, "No transactions found.");
        assert!(history.replaced.lock().unwrap().is_empty());
    }
}
