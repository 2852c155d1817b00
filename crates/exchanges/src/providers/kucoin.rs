use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use futures::stream::{self, StreamExt};
use log::{debug, warn};
use rust_decimal::Decimal;
use serde::Deserialize;
use serde_json::Value;
use std::collections::HashMap;

use crate::connector::ExchangeConnector;
use crate::errors::ExchangeError;
use crate::http::RateLimitedHttpClient;
use crate::models::{
    ExchangeBalance, ExchangeCredentials, NormalizedTransaction, RecordKind, RecordKindReport,
    SpotPrice, SyncWindow, TransactionKind,
};
use crate::normalize::{
    de_decimal_flexible, de_i64_flexible, normalize_exchange_timestamp, split_dashed_symbol,
};
use crate::providers::sign_base64;

const BASE_URL: &str = "https://api.kucoin.com";
const SUCCESS_CODE: &str = "200000";
const PAGE_SIZE: usize = 500;
// KuCoin caps history queries at 7 days per request; chunks are fetched
// with bounded concurrency to stay under its rate limits.
const CHUNK_DAYS: i64 = 7;
const CHUNK_FETCH_CONCURRENCY: usize = 2;
const HISTORY_DEPTH_DAYS: i64 = 2 * 365;

const BALANCE_DUST: Decimal = Decimal::from_parts(1, 0, 0, false, 9);

pub struct KucoinConnector {
    credentials: ExchangeCredentials,
    http: RateLimitedHttpClient,
    base_url: String,
}

impl KucoinConnector {
    pub fn new(credentials: ExchangeCredentials) -> Result<Self, ExchangeError> {
        if credentials.api_key.trim().is_empty() || credentials.api_secret.trim().is_empty() {
            return Err(ExchangeError::MissingCredentials(
                "KuCoin requires an API key and secret".to_string(),
            ));
        }
        credentials.require_passphrase()?;
        Ok(Self {
            credentials,
            http: RateLimitedHttpClient::new(),
            base_url: BASE_URL.to_string(),
        })
    }

    async fn signed_get(
        &self,
        path: &str,
        params: &[(String, String)],
    ) -> Result<Value, ExchangeError> {
        let timestamp = Utc::now().timestamp_millis().to_string();
        let request_path = if params.is_empty() {
            path.to_string()
        } else {
            format!("{}?{}", path, plain_query(params))
        };

        let prehash = kucoin_prehash(&timestamp, &request_path);
        let signature = sign_base64(&self.credentials.api_secret, &prehash)?;
        // Key version 2 requires the passphrase itself to be signed.
        let passphrase = sign_base64(
            &self.credentials.api_secret,
            self.credentials.require_passphrase()?,
        )?;

        let url = format!("{}{}", self.base_url, request_path);
        let headers = [
            ("KC-API-KEY", self.credentials.api_key.clone()),
            ("KC-API-SIGN", signature),
            ("KC-API-TIMESTAMP", timestamp),
            ("KC-API-PASSPHRASE", passphrase),
            ("KC-API-KEY-VERSION", "2".to_string()),
        ];
        let resp = self.http.get_json(&url, &headers).await?;
        if resp["code"].as_str().unwrap_or("") != SUCCESS_CODE {
            return Err(ExchangeError::Api {
                status: 200,
                body: format!(
                    "KuCoin {} code {}: {}",
                    path,
                    resp["code"].as_str().unwrap_or(""),
                    resp["msg"].as_str().unwrap_or("")
                ),
            });
        }
        Ok(resp)
    }

    /// All pages for one 7-day chunk.
    async fn fetch_chunk(
        &self,
        path: &str,
        base_params: &[(String, String)],
        chunk_start: DateTime<Utc>,
        chunk_end: DateTime<Utc>,
    ) -> Result<Vec<Value>, ExchangeError> {
        let mut records = Vec::new();
        let mut current_page = 1usize;
        loop {
            let mut params = base_params.to_vec();
            params.push(("currentPage".to_string(), current_page.to_string()));
            params.push(("pageSize".to_string(), PAGE_SIZE.to_string()));
            params.push((
                "startAt".to_string(),
                chunk_start.timestamp_millis().to_string(),
            ));
            params.push((
                "endAt".to_string(),
                chunk_end.timestamp_millis().to_string(),
            ));

            let resp = self.signed_get(path, &params).await?;
            let items = resp["data"]["items"].as_array().cloned().unwrap_or_default();
            if items.is_empty() {
                break;
            }
            let page_len = items.len();
            records.extend(items);
            if page_len < PAGE_SIZE {
                break;
            }
            current_page += 1;
        }
        Ok(records)
    }

    /// Splits the window into 7-day chunks walked backward from the end and
    /// fetches them with two concurrent workers.
    async fn fetch_chunked(
        &self,
        path: &str,
        base_params: &[(String, String)],
        window: &SyncWindow,
    ) -> Result<Vec<Value>, ExchangeError> {
        let floor = window
            .start
            .max(Utc::now() - Duration::days(HISTORY_DEPTH_DAYS));
        let mut chunks = Vec::new();
        let mut end = window.end;
        while end > floor {
            let start = floor.max(end - Duration::days(CHUNK_DAYS));
            chunks.push((start, end));
            end = start - Duration::milliseconds(1);
        }
        debug!("KuCoin history {}: {} chunks to fetch", path, chunks.len());

        let results: Vec<Result<Vec<Value>, ExchangeError>> =
            stream::iter(chunks.into_iter().map(|(start, end)| async move {
                self.fetch_chunk(path, base_params, start, end).await
            }))
            .buffer_unordered(CHUNK_FETCH_CONCURRENCY)
            .collect()
            .await;

        Ok(Self::merge_chunks(path, results))
    }

    /// A failed chunk loses only its own slice of the window; the sibling
    /// chunks it ran alongside still count.
    fn merge_chunks(
        path: &str,
        results: Vec<Result<Vec<Value>, ExchangeError>>,
    ) -> Vec<Value> {
        let mut merged = Vec::new();
        for result in results {
            match result {
                Ok(records) => merged.extend(records),
                Err(e) => warn!("KuCoin chunk fetch failed for {}: {}", path, e),
            }
        }
        merged
    }

    async fn fetch_kind(
        &self,
        kind: RecordKind,
        path: &str,
        base_params: &[(String, String)],
        window: &SyncWindow,
        normalize: fn(&[Value]) -> Result<Vec<NormalizedTransaction>, ExchangeError>,
    ) -> RecordKindReport {
        let result = match self.fetch_chunked(path, base_params, window).await {
            Ok(records) => normalize(&records),
            Err(e) => Err(e),
        };
        RecordKindReport { kind, result }
    }
}

#[async_trait]
impl ExchangeConnector for KucoinConnector {
    fn exchange_id(&self) -> &'static str {
        "kucoin"
    }

    fn price_symbol(&self, ticker: &str) -> String {
        format!("{}-USDT", ticker)
    }

    async fn fetch_balances(&self) -> Result<Vec<ExchangeBalance>, ExchangeError> {
        let resp = self.signed_get("/api/v1/accounts", &[]).await?;
        let mut assets: HashMap<(String, String), Decimal> = HashMap::new();
        for account in resp["data"].as_array().unwrap_or(&Vec::new()) {
            let ticker = account["currency"].as_str().unwrap_or_default();
            if ticker.is_empty() {
                continue;
            }
            let quantity = match &account["balance"] {
                Value::String(s) => s.parse::<Decimal>().unwrap_or_default(),
                Value::Number(n) => n
                    .as_f64()
                    .and_then(|f| Decimal::try_from(f).ok())
                    .unwrap_or_default(),
                _ => Decimal::ZERO,
            };
            if quantity <= BALANCE_DUST {
                continue;
            }
            let account_type = map_account_type(account["type"].as_str().unwrap_or("unknown"));
            *assets
                .entry((ticker.to_string(), account_type))
                .or_insert(Decimal::ZERO) += quantity;
        }
        Ok(assets
            .into_iter()
            .map(|((ticker, account_type), quantity)| ExchangeBalance {
                ticker,
                quantity,
                account_type,
            })
            .collect())
    }

    async fn fetch_spot_prices(
        &self,
        tickers: &[String],
    ) -> Result<Vec<SpotPrice>, ExchangeError> {
        let url = format!("{}/api/v1/market/allTickers", self.base_url);
        let resp = self.http.get_json(&url, &[]).await?;
        if resp["code"].as_str().unwrap_or("") != SUCCESS_CODE {
            return Err(ExchangeError::Api {
                status: 200,
                body: format!(
                    "KuCoin ticker error: {}",
                    resp["msg"].as_str().unwrap_or("")
                ),
            });
        }

        let wanted: HashMap<String, &String> = tickers
            .iter()
            .map(|t| (self.price_symbol(t), t))
            .collect();
        let mut prices = Vec::new();
        for item in resp["data"]["ticker"].as_array().unwrap_or(&Vec::new()) {
            let symbol = item["symbol"].as_str().unwrap_or_default();
            if let Some(ticker) = wanted.get(symbol) {
                if let Some(price) = item["last"]
                    .as_str()
                    .and_then(|p| p.parse::<Decimal>().ok())
                {
                    prices.push(SpotPrice {
                        ticker: (*ticker).clone(),
                        price,
                    });
                }
            }
        }
        Ok(prices)
    }

    async fn fetch_transactions(
        &self,
        window: &SyncWindow,
        _known_tickers: &[String],
    ) -> Vec<RecordKindReport> {
        let transfer_params = vec![("bizType".to_string(), "TRANSFER".to_string())];
        vec![
            self.fetch_kind(
                RecordKind::Deposits,
                "/api/v1/deposits",
                &[],
                window,
                normalize_deposits,
            )
            .await,
            self.fetch_kind(
                RecordKind::Withdrawals,
                "/api/v1/withdrawals",
                &[],
                window,
                normalize_withdrawals,
            )
            .await,
            self.fetch_kind(
                RecordKind::Trades,
                "/api/v1/fills",
                &[],
                window,
                normalize_trades,
            )
            .await,
            self.fetch_kind(
                RecordKind::Transfers,
                "/api/v1/accounts/ledgers",
                &transfer_params,
                window,
                normalize_transfers,
            )
            .await,
        ]
    }
}

fn kucoin_prehash(timestamp: &str, request_path: &str) -> String {
    format!("{}GET{}", timestamp, request_path)
}

/// Query string in parameter order; KuCoin signs the path exactly as sent.
fn plain_query(params: &[(String, String)]) -> String {
    params
        .iter()
        .map(|(k, v)| format!("{}={}", k, urlencoding::encode(v)))
        .collect::<Vec<_>>()
        .join("&")
}

fn map_account_type(raw: &str) -> String {
    match raw.to_lowercase().as_str() {
        "main" => "Funding".to_string(),
        "trade" => "Trading".to_string(),
        "earn" => "Earn".to_string(),
        "margin" => "Margin".to_string(),
        other => {
            let mut chars = other.chars();
            match chars.next() {
                Some(first) => first.to_uppercase().collect::<String>() + chars.as_str(),
                None => String::new(),
            }
        }
    }
}

#[derive(Debug, Deserialize)]
struct RawDeposit {
    #[serde(rename = "walletTxId")]
    wallet_tx_id: String,
    currency: String,
    #[serde(deserialize_with = "de_decimal_flexible")]
    amount: Decimal,
    status: String,
    #[serde(rename = "createdAt", deserialize_with = "de_i64_flexible")]
    created_at: i64,
    #[serde(rename = "isInner", default)]
    is_inner: bool,
}

#[derive(Debug, Deserialize)]
struct RawWithdrawal {
    id: String,
    currency: String,
    #[serde(deserialize_with = "de_decimal_flexible")]
    amount: Decimal,
    status: String,
    #[serde(rename = "createdAt", deserialize_with = "de_i64_flexible")]
    created_at: i64,
    #[serde(default, deserialize_with = "de_decimal_flexible")]
    fee: Decimal,
}

#[derive(Debug, Deserialize)]
struct RawTrade {
    #[serde(rename = "tradeId")]
    trade_id: String,
    symbol: String,
    side: String,
    #[serde(rename = "createdAt", deserialize_with = "de_i64_flexible")]
    created_at: i64,
    #[serde(deserialize_with = "de_decimal_flexible")]
    size: Decimal,
    #[serde(deserialize_with = "de_decimal_flexible")]
    funds: Decimal,
    #[serde(deserialize_with = "de_decimal_flexible")]
    price: Decimal,
    #[serde(default, deserialize_with = "de_decimal_flexible")]
    fee: Decimal,
    #[serde(rename = "feeCurrency", default)]
    fee_currency: Option<String>,
}

#[derive(Debug, Deserialize)]
struct RawLedgerEntry {
    currency: String,
    #[serde(deserialize_with = "de_decimal_flexible")]
    amount: Decimal,
    #[serde(rename = "createdAt", deserialize_with = "de_i64_flexible")]
    created_at: i64,
    #[serde(default)]
    direction: String,
    #[serde(default)]
    context: String,
    #[serde(rename = "accountType", default)]
    account_type: Option<String>,
}

fn normalize_deposits(records: &[Value]) -> Result<Vec<NormalizedTransaction>, ExchangeError> {
    let mut txs = Vec::new();
    for record in records {
        let raw: RawDeposit = serde_json::from_value(record.clone())?;
        if raw.status != "SUCCESS" {
            continue;
        }
        txs.push(NormalizedTransaction::new(
            format!("kucoin_deposit_{}", raw.wallet_tx_id),
            normalize_exchange_timestamp(raw.created_at),
            TransactionKind::Deposit,
            format!("Deposit (inner: {})", raw.is_inner),
            raw.currency,
            raw.amount,
        ));
    }
    Ok(txs)
}

fn normalize_withdrawals(records: &[Value]) -> Result<Vec<NormalizedTransaction>, ExchangeError> {
    let mut txs = Vec::new();
    for record in records {
        let raw: RawWithdrawal = serde_json::from_value(record.clone())?;
        if raw.status != "SUCCESS" {
            continue;
        }
        let mut tx = NormalizedTransaction::new(
            format!("kucoin_withdrawal_{}", raw.id),
            normalize_exchange_timestamp(raw.created_at),
            TransactionKind::Withdrawal,
            "Withdrawal",
            raw.currency.clone(),
            raw.amount,
        );
        tx.fee_amount = Some(raw.fee);
        tx.fee_currency = Some(raw.currency);
        txs.push(tx);
    }
    Ok(txs)
}

fn normalize_trades(records: &[Value]) -> Result<Vec<NormalizedTransaction>, ExchangeError> {
    let mut txs = Vec::new();
    for record in records {
        let raw: RawTrade = serde_json::from_value(record.clone())?;
        let Some((base, quote)) = split_dashed_symbol(&raw.symbol) else {
            debug!("Skipping KuCoin trade with unknown symbol '{}'", raw.symbol);
            continue;
        };
        let kind = match raw.side.to_lowercase().as_str() {
            "buy" => TransactionKind::Buy,
            "sell" => TransactionKind::Sell,
            other => {
                warn!("Skipping KuCoin trade with unknown side '{}'", other);
                continue;
            }
        };
        let mut tx = NormalizedTransaction::new(
            format!("kucoin_trade_{}", raw.trade_id),
            normalize_exchange_timestamp(raw.created_at),
            kind,
            format!("Spot Trade ({})", raw.side.to_uppercase()),
            base,
            raw.size,
        );
        tx.asset2_ticker = Some(quote);
        tx.asset2_amount = Some(raw.funds);
        tx.execution_price = Some(raw.price);
        tx.fee_amount = Some(raw.fee);
        tx.fee_currency = raw.fee_currency;
        txs.push(tx);
    }
    Ok(txs)
}

/// Ledger entries with bizType TRANSFER describe both sides of an internal
/// move. Only the OUT side is kept, keyed by the order id from the entry
/// context so the two sides collapse into one transaction.
fn normalize_transfers(records: &[Value]) -> Result<Vec<NormalizedTransaction>, ExchangeError> {
    let mut txs = Vec::new();
    for record in records {
        let raw: RawLedgerEntry = serde_json::from_value(record.clone())?;
        if raw.direction.to_uppercase() != "OUT" {
            continue;
        }
        let order_id = serde_json::from_str::<Value>(&raw.context)
            .ok()
            .and_then(|ctx| ctx["orderId"].as_str().map(String::from));
        let Some(order_id) = order_id else {
            debug!("Skipping KuCoin ledger transfer without orderId context");
            continue;
        };
        let mut tx = NormalizedTransaction::new(
            format!("kucoin_transfer_{}", order_id),
            normalize_exchange_timestamp(raw.created_at),
            TransactionKind::Transfer,
            format!(
                "Transfer from {}",
                raw.account_type.as_deref().unwrap_or("N/A")
            ),
            raw.currency,
            raw.amount,
        );
        tx.description = Some("Internal transfer on KuCoin".to_string());
        txs.push(tx);
    }
    Ok(txs)
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;
    use serde_json::json;

    #[test]
    fn test_prehash_layout() {
        assert_eq!(
            kucoin_prehash("1700000000000", "/api/v1/accounts"),
            "1700000000000GET/api/v1/accounts"
        );
    }

    #[test]
    fn test_account_type_mapping() {
        assert_eq!(map_account_type("main"), "Funding");
        assert_eq!(map_account_type("MAIN"), "Funding");
        assert_eq!(map_account_type("trade"), "Trading");
        assert_eq!(map_account_type("margin"), "Margin");
        assert_eq!(map_account_type("option"), "Option");
    }

    #[test]
    fn test_failed_chunk_keeps_sibling_results() {
        let results = vec![
            Ok(vec![json!({"id": "fill1"})]),
            Err(ExchangeError::RateLimited("slow down".to_string())),
            Ok(vec![json!({"id": "fill2"})]),
        ];
        let merged = KucoinConnector::merge_chunks("/api/v1/fills", results);
        assert_eq!(merged.len(), 2);
        assert_eq!(merged[0]["id"], "fill1");
        assert_eq!(merged[1]["id"], "fill2");
    }

    #[test]
    fn test_normalize_transfers_keeps_out_side_only() {
        let records = vec![
            json!({
                "currency": "USDT", "amount": "100", "createdAt": 1700000000000i64,
                "direction": "out", "context": "{\"orderId\": \"ord1\"}", "accountType": "MAIN"
            }),
            json!({
                "currency": "USDT", "amount": "100", "createdAt": 1700000000000i64,
                "direction": "in", "context": "{\"orderId\": \"ord1\"}", "accountType": "TRADE"
            }),
            json!({
                "currency": "USDT", "amount": "50", "createdAt": 1700000000000i64,
                "direction": "out", "context": "{}"
            }),
        ];
        let txs = normalize_transfers(&records).unwrap();
        assert_eq!(txs.len(), 1);
        assert_eq!(txs[0].exchange_tx_id, "kucoin_transfer_ord1");
        assert_eq!(txs[0].raw_kind, "Transfer from MAIN");
    }

    #[test]
    fn test_normalize_trades_carries_funds_as_quote_amount() {
        let records = vec![json!({
            "tradeId": "t1", "symbol": "BTC-USDT", "side": "sell", "createdAt": 1700000000000i64,
            "size": "0.5", "funds": "25000", "price": "50000",
            "fee": "25", "feeCurrency": "USDT"
        })];
        let txs = normalize_trades(&records).unwrap();
        assert_eq!(txs[0].kind, TransactionKind::Sell);
        assert_eq!(txs[0].asset2_amount, Some(dec!(25000)));
        assert_eq!(txs[0].execution_price, Some(dec!(50000)));
    }

    #[test]
    fn test_normalize_deposits_requires_success() {
        let records = vec![
            json!({"walletTxId": "0x1", "currency": "ETH", "amount": "2", "status": "SUCCESS", "createdAt": 1700000000000i64, "isInner": false}),
            json!({"walletTxId": "0x2", "currency": "ETH", "amount": "3", "status": "PROCESSING", "createdAt": 1700000000000i64}),
        ];
        let txs = normalize_deposits(&records).unwrap();
        assert_eq!(txs.len(), 1);
        assert_eq!(txs[0].raw_kind, "Deposit (inner: false)");
    }
}
