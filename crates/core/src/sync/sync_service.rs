use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;

use chrono::{Duration, Utc};
use foliosync_exchanges::{
    create_connector, ExchangeBalance, ExchangeConnector, ExchangeCredentials, SyncWindow,
};
use log::{debug, error, info};
use rust_decimal::Decimal;

use crate::assets::{AssetStore, BalanceSyncPlan, BalanceUpdate, PlatformAsset};
use crate::constants::{
    is_stablecoin, DEFAULT_SYNC_DEPTH_DAYS, MANUAL_ACCOUNT_TYPES, SYNC_OVERLAP_HOURS,
};
use crate::errors::Result;
use crate::platforms::{CredentialProvider, Platform, PlatformStore};
use crate::transactions::TransactionStore;

/// Builds connectors from a platform name. Indirection exists so tests can
/// hand the service a scripted connector.
pub trait ConnectorFactory: Send + Sync {
    fn connector(
        &self,
        exchange: &str,
        credentials: ExchangeCredentials,
    ) -> Result<Arc<dyn ExchangeConnector>>;
}

/// Production factory backed by the connector registry.
pub struct RegistryConnectorFactory;

impl ConnectorFactory for RegistryConnectorFactory {
    fn connector(
        &self,
        exchange: &str,
        credentials: ExchangeCredentials,
    ) -> Result<Arc<dyn ExchangeConnector>> {
        Ok(create_connector(exchange, credentials)?)
    }
}

/// Result of one sync run. The status string is what gets persisted and
/// shown to the user.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SyncOutcome {
    pub success: bool,
    pub status: String,
}

impl SyncOutcome {
    fn failure(err: &crate::errors::Error) -> Self {
        SyncOutcome {
            success: false,
            status: format!("Error: {err}"),
        }
    }
}

/// Orchestrates balance and transaction syncs for connected platforms.
pub struct SyncService {
    connectors: Arc<dyn ConnectorFactory>,
    credentials: Arc<dyn CredentialProvider>,
    platforms: Arc<dyn PlatformStore>,
    transactions: Arc<dyn TransactionStore>,
    assets: Arc<dyn AssetStore>,
}

impl SyncService {
    pub fn new(
        connectors: Arc<dyn ConnectorFactory>,
        credentials: Arc<dyn CredentialProvider>,
        platforms: Arc<dyn PlatformStore>,
        transactions: Arc<dyn TransactionStore>,
        assets: Arc<dyn AssetStore>,
    ) -> Self {
        Self {
            connectors,
            credentials,
            platforms,
            transactions,
            assets,
        }
    }

    /// Refreshes stored holdings from live exchange balances. The outcome,
    /// success or failure, is always recorded on the platform.
    pub async fn sync_balances(&self, platform: &Platform) -> Result<SyncOutcome> {
        let outcome = match self.refresh_balances(platform).await {
            Ok(status) => SyncOutcome {
                success: true,
                status,
            },
            Err(err) => {
                error!("Balance sync failed for '{}': {}", platform.name, err);
                SyncOutcome::failure(&err)
            }
        };
        self.platforms
            .record_balance_sync(platform.id, &outcome.status, Utc::now())
            .await?;
        Ok(outcome)
    }

    async fn refresh_balances(&self, platform: &Platform) -> Result<String> {
        let credentials = self.credentials.credentials(platform).await?;
        let connector = self.connectors.connector(&platform.name, credentials)?;

        let fetched = connector.fetch_balances().await?;
        let stored = self.assets.list_for_platform(platform.id).await?;

        // Price every ticker we hold or held, except stablecoins.
        let mut wanted: BTreeSet<String> = fetched.iter().map(|b| b.ticker.clone()).collect();
        wanted.extend(stored.iter().map(|a| a.ticker.clone()));
        let tickers: Vec<String> = wanted.into_iter().filter(|t| !is_stablecoin(t)).collect();
        let prices = if tickers.is_empty() {
            Vec::new()
        } else {
            connector.fetch_spot_prices(&tickers).await?
        };
        let price_map: HashMap<&str, Decimal> =
            prices.iter().map(|p| (p.ticker.as_str(), p.price)).collect();

        let plan = build_balance_plan(&stored, &fetched, &price_map);
        let status = plan.status_message();
        debug!("Balance sync for '{}': {}", platform.name, status);
        self.assets.apply_balance_sync(platform.id, &plan).await?;
        Ok(status)
    }

    /// Pulls new transactions since the platform cursor. Individual record
    /// kinds may fail without aborting the run; the cursor advances once the
    /// batch commits.
    pub async fn sync_transactions(&self, platform: &Platform) -> Result<SyncOutcome> {
        match self.pull_transactions(platform).await {
            Ok(count) => {
                info!(
                    "Transaction sync for '{}': {} new transactions",
                    platform.name, count
                );
                Ok(SyncOutcome {
                    success: true,
                    status: format!("Success: {count} new transactions found."),
                })
            }
            Err(err) => {
                error!("Transaction sync failed for '{}': {}", platform.name, err);
                Ok(SyncOutcome::failure(&err))
            }
        }
    }

    async fn pull_transactions(&self, platform: &Platform) -> Result<usize> {
        let credentials = self.credentials.credentials(platform).await?;
        let connector = self.connectors.connector(&platform.name, credentials)?;

        let end = Utc::now();
        let start = match platform.last_transaction_sync_at {
            Some(cursor) => cursor - Duration::hours(SYNC_OVERLAP_HOURS),
            None => end - Duration::days(DEFAULT_SYNC_DEPTH_DAYS),
        };
        let window = SyncWindow::new(start, end);

        // Some connectors enumerate trade symbols from tickers we already
        // know about, so feed them both stored holdings and past trades.
        let mut known: BTreeSet<String> = self
            .assets
            .list_for_platform(platform.id)
            .await?
            .into_iter()
            .map(|a| a.ticker)
            .collect();
        known.extend(self.transactions.known_tickers(platform.id).await?);
        let known: Vec<String> = known.into_iter().collect();

        let reports = connector.fetch_transactions(&window, &known).await;
        let mut seen = self.transactions.existing_exchange_tx_ids(platform.id).await?;

        let mut fresh = Vec::new();
        for report in reports {
            match report.result {
                Ok(records) => {
                    for record in records {
                        if seen.insert(record.exchange_tx_id.clone()) {
                            fresh.push(record);
                        }
                    }
                }
                Err(err) => {
                    error!(
                        "Skipping {} for '{}': {}",
                        report.kind, platform.name, err
                    );
                }
            }
        }

        let count = fresh.len();
        self.transactions
            .commit_batch(platform.id, &fresh, end)
            .await?;
        Ok(count)
    }
}

/// Diffs live balances against stored rows. Pure so the edge cases are
/// testable without a connector.
pub(crate) fn build_balance_plan(
    stored: &[PlatformAsset],
    fetched: &[ExchangeBalance],
    prices: &HashMap<&str, Decimal>,
) -> BalanceSyncPlan {
    let mut remaining: HashMap<(String, String), &PlatformAsset> = stored
        .iter()
        .map(|a| ((a.ticker.clone(), a.account_type.clone()), a))
        .collect();

    let mut plan = BalanceSyncPlan::default();
    for balance in fetched {
        let price = price_for(&balance.ticker, prices);
        let key = (balance.ticker.clone(), balance.account_type.clone());
        let update = BalanceUpdate {
            ticker: balance.ticker.clone(),
            account_type: balance.account_type.clone(),
            quantity: balance.quantity,
            current_price: price,
        };
        match remaining.remove(&key) {
            Some(existing) => {
                if existing.quantity != balance.quantity || existing.current_price != price {
                    plan.updates.push(update);
                }
            }
            None => plan.additions.push(update),
        }
    }

    // Rows the exchange no longer reports. Manual buckets only get a price
    // refresh; everything else is zeroed.
    for ((ticker, account_type), existing) in remaining {
        if MANUAL_ACCOUNT_TYPES.contains(&account_type.as_str()) {
            if let Some(price) = price_for(&ticker, prices) {
                if existing.current_price != Some(price) {
                    plan.price_refreshes.push(BalanceUpdate {
                        ticker,
                        account_type,
                        quantity: existing.quantity,
                        current_price: Some(price),
                    });
                }
            }
        } else if existing.quantity != Decimal::ZERO {
            plan.zeroed.push((ticker, account_type));
        }
    }
    plan
}

fn price_for(ticker: &str, prices: &HashMap<&str, Decimal>) -> Option<Decimal> {
    if is_stablecoin(ticker) {
        Some(Decimal::ONE)
    } else {
        prices.get(ticker).copied()
    }
}
