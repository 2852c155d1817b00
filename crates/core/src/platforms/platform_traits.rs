use async_trait::async_trait;
use chrono::{DateTime, Utc};
use foliosync_exchanges::ExchangeCredentials;

use crate::errors::Result;
use crate::platforms::Platform;

/// Supplies API credentials for a platform. Backed by the OS keyring or an
/// encrypted settings store in the application layer.
#[async_trait]
pub trait CredentialProvider: Send + Sync {
    async fn credentials(&self, platform: &Platform) -> Result<ExchangeCredentials>;
}

/// Persistence for platform sync bookkeeping.
#[async_trait]
pub trait PlatformStore: Send + Sync {
    /// Records the outcome of a balance sync run, success or failure.
    async fn record_balance_sync(
        &self,
        platform_id: i64,
        status: &str,
        synced_at: DateTime<Utc>,
    ) -> Result<()>;
}
