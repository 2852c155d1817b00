use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

/// A stored holding row. Rows are keyed by `(ticker, account_type)` within
/// a platform.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PlatformAsset {
    pub ticker: String,
    pub quantity: Decimal,
    pub account_type: String,
    pub current_price: Option<Decimal>,
}

/// One row write produced by a balance sync diff.
#[derive(Debug, Clone, PartialEq)]
pub struct BalanceUpdate {
    pub ticker: String,
    pub account_type: String,
    pub quantity: Decimal,
    pub current_price: Option<Decimal>,
}

/// The full set of writes one balance sync applies. Applied atomically by
/// the store.
#[derive(Debug, Clone, Default)]
pub struct BalanceSyncPlan {
    /// Rows the exchange reports that have no stored counterpart.
    pub additions: Vec<BalanceUpdate>,
    /// Stored rows whose quantity or price changed.
    pub updates: Vec<BalanceUpdate>,
    /// Stored `(ticker, account_type)` rows the exchange no longer reports.
    pub zeroed: Vec<(String, String)>,
    /// Manual rows kept as-is except for a fresher price.
    pub price_refreshes: Vec<BalanceUpdate>,
}

impl BalanceSyncPlan {
    /// "updated" in the status message covers both value changes and manual
    /// price refreshes.
    pub fn updated_count(&self) -> usize {
        self.updates.len() + self.price_refreshes.len()
    }

    pub fn status_message(&self) -> String {
        format!(
            "Success: {} added, {} updated, {} zeroed.",
            self.additions.len(),
            self.updated_count(),
            self.zeroed.len()
        )
    }
}
