use std::collections::HashSet;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use foliosync_exchanges::NormalizedTransaction;

use crate::errors::Result;
use crate::platforms::PlatformDomain;
use crate::transactions::Transaction;

/// Persistence for canonical transactions.
#[async_trait]
pub trait TransactionStore: Send + Sync {
    /// All `exchange_tx_id`s already stored for a platform. Used to drop
    /// duplicates before insert.
    async fn existing_exchange_tx_ids(&self, platform_id: i64) -> Result<HashSet<String>>;

    /// Inserts a batch and advances the platform transaction cursor in one
    /// commit. On failure nothing is written and the cursor stays put.
    async fn commit_batch(
        &self,
        platform_id: i64,
        records: &[NormalizedTransaction],
        cursor: DateTime<Utc>,
    ) -> Result<()>;

    /// All transactions across platforms of a domain, oldest first.
    async fn list_for_domain(&self, domain: PlatformDomain) -> Result<Vec<Transaction>>;

    /// Distinct tickers seen in stored transactions of a platform.
    async fn known_tickers(&self, platform_id: i64) -> Result<Vec<String>>;
}
