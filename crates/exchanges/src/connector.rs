use async_trait::async_trait;

use crate::errors::ExchangeError;
use crate::models::{ExchangeBalance, RecordKindReport, SpotPrice, SyncWindow};

/// A connected exchange account. Implementations own their signing scheme,
/// pagination, and normalization into [`crate::models::NormalizedTransaction`].
#[async_trait]
pub trait ExchangeConnector: Send + Sync {
    /// Lowercase identifier used in exchange_tx_id prefixes ("bybit", "okx", ...).
    fn exchange_id(&self) -> &'static str;

    /// Maps a bare ticker to the symbol this exchange quotes it under
    /// ("BTC" -> "BTCUSDT" or "BTC-USDT").
    fn price_symbol(&self, ticker: &str) -> String;

    /// Current holdings across all account buckets, zero-quantity rows omitted.
    async fn fetch_balances(&self) -> Result<Vec<ExchangeBalance>, ExchangeError>;

    /// Current USDT spot prices for the given tickers, one batched request
    /// where the exchange supports it. Unknown tickers are simply absent.
    async fn fetch_spot_prices(&self, tickers: &[String])
        -> Result<Vec<SpotPrice>, ExchangeError>;

    /// Pulls every record kind for the window. Kinds are independent: a
    /// failed kind yields an Err report while the others still return rows.
    /// `known_tickers` seeds connectors that must enumerate symbols to
    /// query trades (BingX).
    async fn fetch_transactions(
        &self,
        window: &SyncWindow,
        known_tickers: &[String],
    ) -> Vec<RecordKindReport>;
}

impl std::fmt::Debug for dyn ExchangeConnector {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ExchangeConnector")
            .field("exchange_id", &self.exchange_id())
            .finish()
    }
}
