use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use crate::errors::ExchangeError;

/// API credentials for a signed exchange connection. `passphrase` is only
/// required by KuCoin and OKX.
#[derive(Debug, Clone)]
pub struct ExchangeCredentials {
    pub api_key: String,
    pub api_secret: String,
    pub passphrase: Option<String>,
}

impl ExchangeCredentials {
    pub fn new(api_key: impl Into<String>, api_secret: impl Into<String>) -> Self {
        Self {
            api_key: api_key.into(),
            api_secret: api_secret.into(),
            passphrase: None,
        }
    }

    pub fn with_passphrase(mut self, passphrase: impl Into<String>) -> Self {
        self.passphrase = Some(passphrase.into());
        self
    }

    pub fn require_passphrase(&self) -> Result<&str, ExchangeError> {
        self.passphrase
            .as_deref()
            .filter(|p| !p.is_empty())
            .ok_or_else(|| ExchangeError::MissingCredentials("passphrase".to_string()))
    }
}

/// Half-open time window `[start, end)` a sync run covers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SyncWindow {
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
}

impl SyncWindow {
    pub fn new(start: DateTime<Utc>, end: DateTime<Utc>) -> Self {
        Self { start, end }
    }

    pub fn start_ms(&self) -> i64 {
        self.start.timestamp_millis()
    }

    pub fn end_ms(&self) -> i64 {
        self.end.timestamp_millis()
    }

    pub fn contains(&self, ts: DateTime<Utc>) -> bool {
        ts >= self.start && ts < self.end
    }
}

/// The kinds of activity records a connector pulls independently. One kind
/// failing must not abort the others.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RecordKind {
    Deposits,
    InternalDeposits,
    Withdrawals,
    Transfers,
    Trades,
}

impl RecordKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            RecordKind::Deposits => "deposits",
            RecordKind::InternalDeposits => "internal_deposits",
            RecordKind::Withdrawals => "withdrawals",
            RecordKind::Transfers => "transfers",
            RecordKind::Trades => "trades",
        }
    }
}

impl std::fmt::Display for RecordKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Outcome of fetching and normalizing one record kind.
#[derive(Debug)]
pub struct RecordKindReport {
    pub kind: RecordKind,
    pub result: Result<Vec<NormalizedTransaction>, ExchangeError>,
}

/// Canonical transaction type every connector normalizes into.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TransactionKind {
    Buy,
    Sell,
    Deposit,
    Withdrawal,
    Transfer,
    Exchange,
}

impl TransactionKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            TransactionKind::Buy => "buy",
            TransactionKind::Sell => "sell",
            TransactionKind::Deposit => "deposit",
            TransactionKind::Withdrawal => "withdrawal",
            TransactionKind::Transfer => "transfer",
            TransactionKind::Exchange => "exchange",
        }
    }
}

impl std::fmt::Display for TransactionKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// An exchange record mapped into the canonical shape. `exchange_tx_id` is
/// globally unique per platform and drives idempotent ingestion.
#[derive(Debug, Clone, PartialEq)]
pub struct NormalizedTransaction {
    pub exchange_tx_id: String,
    pub timestamp: DateTime<Utc>,
    pub kind: TransactionKind,
    pub raw_kind: String,
    pub asset1_ticker: String,
    pub asset1_amount: Decimal,
    pub asset2_ticker: Option<String>,
    pub asset2_amount: Option<Decimal>,
    pub fee_amount: Option<Decimal>,
    pub fee_currency: Option<String>,
    pub execution_price: Option<Decimal>,
    pub description: Option<String>,
}

impl NormalizedTransaction {
    pub fn new(
        exchange_tx_id: impl Into<String>,
        timestamp: DateTime<Utc>,
        kind: TransactionKind,
        raw_kind: impl Into<String>,
        asset1_ticker: impl Into<String>,
        asset1_amount: Decimal,
    ) -> Self {
        Self {
            exchange_tx_id: exchange_tx_id.into(),
            timestamp,
            kind,
            raw_kind: raw_kind.into(),
            asset1_ticker: asset1_ticker.into(),
            asset1_amount,
            asset2_ticker: None,
            asset2_amount: None,
            fee_amount: None,
            fee_currency: None,
            execution_price: None,
            description: None,
        }
    }
}

/// A live holding on the exchange, split by account bucket (Trading,
/// Funding, Earn, Margin).
#[derive(Debug, Clone, PartialEq)]
pub struct ExchangeBalance {
    pub ticker: String,
    pub quantity: Decimal,
    pub account_type: String,
}

/// Current spot price for one ticker, quoted in USDT.
#[derive(Debug, Clone, PartialEq)]
pub struct SpotPrice {
    pub ticker: String,
    pub price: Decimal,
}
