//! Exchange connectivity for portfolio synchronization.
//!
//! Each supported exchange (Bybit, Bitget, BingX, KuCoin, OKX) gets a
//! connector that signs requests, walks the exchange's pagination scheme,
//! and normalizes raw records into canonical transactions. Public price
//! endpoints back spot quotes and daily close history.

pub mod connector;
pub mod errors;
pub mod history;
pub mod http;
pub mod models;
pub mod normalize;
pub mod providers;
pub mod registry;

pub use connector::ExchangeConnector;
pub use errors::ExchangeError;
pub use history::{BybitPriceHistory, DailyPrices, MoexPriceHistory, PriceHistoryProvider};
pub use models::{
    ExchangeBalance, ExchangeCredentials, NormalizedTransaction, RecordKind, RecordKindReport,
    SpotPrice, SyncWindow, TransactionKind,
};
pub use registry::{create_connector, is_supported, SUPPORTED_EXCHANGES};
