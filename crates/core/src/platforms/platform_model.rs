use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Which valuation pipeline a platform's transactions feed into.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PlatformDomain {
    Crypto,
    Securities,
}

impl PlatformDomain {
    pub fn as_str(&self) -> &'static str {
        match self {
            PlatformDomain::Crypto => "crypto",
            PlatformDomain::Securities => "securities",
        }
    }
}

impl std::fmt::Display for PlatformDomain {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A connected account on an exchange or broker. `name` doubles as the
/// connector key ("bybit", "kucoin", ...).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Platform {
    pub id: i64,
    pub name: String,
    pub domain: PlatformDomain,
    /// When balances were last refreshed, together with the outcome message.
    pub last_balance_sync_at: Option<DateTime<Utc>>,
    pub balance_sync_status: Option<String>,
    /// Transaction sync cursor. Advances only when a batch commits.
    pub last_transaction_sync_at: Option<DateTime<Utc>>,
}

impl Platform {
    pub fn new(id: i64, name: impl Into<String>, domain: PlatformDomain) -> Self {
        Self {
            id,
            name: name.into(),
            domain,
            last_balance_sync_at: None,
            balance_sync_status: None,
            last_transaction_sync_at: None,
        }
    }
}
