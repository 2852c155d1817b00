use async_trait::async_trait;
use rust_decimal::Decimal;

use crate::errors::Result;

/// Source of the rate converting USDT-denominated totals into the reporting
/// currency. `Ok(None)` means no conversion, totals stay in USDT.
#[async_trait]
pub trait QuoteRateProvider: Send + Sync {
    async fn quote_rate(&self) -> Result<Option<Decimal>>;
}

/// A constant conversion rate.
pub struct FixedQuoteRate(pub Decimal);

#[async_trait]
impl QuoteRateProvider for FixedQuoteRate {
    async fn quote_rate(&self) -> Result<Option<Decimal>> {
        Ok(Some(self.0))
    }
}
