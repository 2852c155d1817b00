//! Portfolio core: sync orchestration over the exchange connectors and the
//! valuation replay that turns stored transactions into a daily history.
//!
//! Persistence and credential storage stay behind traits so the application
//! layer can plug in its own database and keyring.

pub mod assets;
pub mod constants;
pub mod errors;
pub mod fx;
pub mod platforms;
pub mod sync;
pub mod transactions;
pub mod valuation;

pub use errors::{Error, Result};
pub use platforms::{Platform, PlatformDomain};
pub use sync::{RegistryConnectorFactory, SyncOutcome, SyncService};
pub use transactions::Transaction;
pub use valuation::ValuationService;
