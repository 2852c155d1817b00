use async_trait::async_trait;

use crate::assets::{BalanceSyncPlan, PlatformAsset};
use crate::errors::Result;

/// Persistence for per-platform holdings.
#[async_trait]
pub trait AssetStore: Send + Sync {
    async fn list_for_platform(&self, platform_id: i64) -> Result<Vec<PlatformAsset>>;

    /// Applies a balance sync diff in one transaction.
    async fn apply_balance_sync(&self, platform_id: i64, plan: &BalanceSyncPlan) -> Result<()>;
}
