use chrono::{DateTime, Utc};
use foliosync_exchanges::{NormalizedTransaction, TransactionKind};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

/// A persisted canonical transaction. The shape mirrors
/// [`NormalizedTransaction`] plus storage identity.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Transaction {
    pub id: i64,
    pub platform_id: i64,
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

impl Transaction {
    pub fn from_normalized(id: i64, platform_id: i64, record: NormalizedTransaction) -> Self {
        Self {
            id,
            platform_id,
            exchange_tx_id: record.exchange_tx_id,
            timestamp: record.timestamp,
            kind: record.kind,
            raw_kind: record.raw_kind,
            asset1_ticker: record.asset1_ticker,
            asset1_amount: record.asset1_amount,
            asset2_ticker: record.asset2_ticker,
            asset2_amount: record.asset2_amount,
            fee_amount: record.fee_amount,
            fee_currency: record.fee_currency,
            execution_price: record.execution_price,
            description: record.description,
        }
    }
}
