use async_trait::async_trait;
use chrono::Utc;
use futures::stream::{self, StreamExt};
use log::{debug, error, warn};
use rust_decimal::Decimal;
use serde::Deserialize;
use serde_json::{json, Value};
use std::collections::{BTreeSet, HashMap};

use crate::connector::ExchangeConnector;
use crate::errors::ExchangeError;
use crate::http::RateLimitedHttpClient;
use crate::models::{
    ExchangeBalance, ExchangeCredentials, NormalizedTransaction, RecordKind, RecordKindReport,
    SpotPrice, SyncWindow, TransactionKind,
};
use crate::normalize::{
    de_decimal_flexible, de_i64_flexible, de_string_flexible, normalize_exchange_timestamp,
    split_dashed_symbol,
};
use crate::providers::sign_hex;

const BASE_URL: &str = "https://open-api.bingx.com";
const PAGE_LIMIT: usize = 1000;
// BingX has no "all trades" endpoint, so the symbol universe is generated
// from the caller's known tickers crossed with the major quote currencies.
const TRADE_QUOTE_CURRENCIES: [&str; 4] = ["USDT", "USDC", "BTC", "ETH"];
const TRADE_FETCH_CONCURRENCY: usize = 2;

const BALANCE_DUST: Decimal = Decimal::from_parts(1, 0, 0, false, 9);

pub struct BingxConnector {
    credentials: ExchangeCredentials,
    http: RateLimitedHttpClient,
    base_url: String,
}

impl BingxConnector {
    pub fn new(credentials: ExchangeCredentials) -> Result<Self, ExchangeError> {
        if credentials.api_key.trim().is_empty() || credentials.api_secret.trim().is_empty() {
            return Err(ExchangeError::MissingCredentials(
                "BingX requires an API key and secret".to_string(),
            ));
        }
        Ok(Self {
            credentials,
            http: RateLimitedHttpClient::new(),
            base_url: BASE_URL.to_string(),
        })
    }

    /// BingX signs the raw sorted "k=v&..." string, with the signature and
    /// API key carried in the URL query itself.
    async fn signed_get(
        &self,
        path: &str,
        params: &[(String, String)],
    ) -> Result<Value, ExchangeError> {
        let mut all_params = params.to_vec();
        all_params.push((
            "timestamp".to_string(),
            Utc::now().timestamp_millis().to_string(),
        ));
        all_params.push(("apiKey".to_string(), self.credentials.api_key.clone()));

        let query = bingx_query(&all_params);
        let signature = sign_hex(&self.credentials.api_secret, &query)?;
        let url = format!("{}{}?{}&signature={}", self.base_url, path, query, signature);

        let headers = [("X-BX-APIKEY", self.credentials.api_key.clone())];
        let resp = self.http.get_json(&url, &headers).await?;
        // Some endpoints answer with a bare list instead of an envelope.
        let resp = if resp.is_array() {
            json!({ "code": 0, "data": resp })
        } else {
            resp
        };

        let code = resp["code"].as_i64().unwrap_or(-1);
        if code != 0 {
            return Err(ExchangeError::Api {
                status: 200,
                body: format!(
                    "BingX {} code {}: {}",
                    path,
                    code,
                    resp["msg"].as_str().unwrap_or("")
                ),
            });
        }
        Ok(resp)
    }

    /// Deposits and withdrawals come back in one call covering 90 days.
    async fn fetch_wallet_history(
        &self,
        path: &str,
        window: &SyncWindow,
    ) -> Result<Vec<Value>, ExchangeError> {
        let params = vec![
            ("limit".to_string(), PAGE_LIMIT.to_string()),
            ("startTime".to_string(), window.start_ms().to_string()),
            ("endTime".to_string(), window.end_ms().to_string()),
        ];
        let resp = self.signed_get(path, &params).await?;
        Ok(resp["data"].as_array().cloned().unwrap_or_default())
    }

    /// Fills for one symbol, pages forward by `fromId`.
    async fn fetch_symbol_fills(
        &self,
        symbol: &str,
        window: &SyncWindow,
    ) -> Result<Vec<Value>, ExchangeError> {
        let mut all_records = Vec::new();
        let mut from_id: Option<String> = None;
        loop {
            let mut params = vec![
                ("limit".to_string(), PAGE_LIMIT.to_string()),
                ("symbol".to_string(), symbol.to_string()),
                ("startTime".to_string(), window.start_ms().to_string()),
                ("endTime".to_string(), window.end_ms().to_string()),
            ];
            if let Some(id) = &from_id {
                params.push(("fromId".to_string(), id.clone()));
            }

            let resp = self.signed_get("/openApi/spot/v1/fills", &params).await?;
            let records = resp["data"]["fills"].as_array().cloned().unwrap_or_default();
            if records.is_empty() {
                break;
            }
            let page_len = records.len();
            from_id = records.last().map(|r| match &r["id"] {
                Value::String(s) => s.clone(),
                other => other.to_string(),
            });
            all_records.extend(records);
            if page_len < PAGE_LIMIT || from_id.is_none() {
                break;
            }
        }
        Ok(all_records)
    }

    /// Queries fills for every plausible pair built from the known tickers.
    /// Symbols BingX rejects as invalid are skipped silently, other per
    /// symbol failures are logged and do not fail the kind.
    async fn fetch_trades(&self, window: &SyncWindow, known_tickers: &[String]) -> Vec<Value> {
        let mut symbols = BTreeSet::new();
        for ticker in known_tickers {
            for quote in TRADE_QUOTE_CURRENCIES {
                if ticker == quote {
                    continue;
                }
                symbols.insert(format!("{}-{}", ticker, quote));
            }
        }
        if symbols.is_empty() {
            debug!("BingX trades: no known tickers, nothing to query");
            return Vec::new();
        }
        debug!("BingX trades: checking {} symbols", symbols.len());

        let results: Vec<(String, Result<Vec<Value>, ExchangeError>)> =
            stream::iter(symbols.into_iter().map(|symbol| async move {
                let fills = self.fetch_symbol_fills(&symbol, window).await;
                (symbol, fills)
            }))
            .buffer_unordered(TRADE_FETCH_CONCURRENCY)
            .collect()
            .await;

        let mut all_trades = Vec::new();
        for (symbol, result) in results {
            match result {
                Ok(fills) => {
                    if !fills.is_empty() {
                        debug!("BingX trades: {} fills for {}", fills.len(), symbol);
                        all_trades.extend(fills);
                    }
                }
                Err(e) => {
                    if !e.to_string().contains("symbol is invalid") {
                        error!("Failed to fetch BingX fills for {}: {}", symbol, e);
                    }
                }
            }
        }
        all_trades
    }
}

#[async_trait]
impl ExchangeConnector for BingxConnector {
    fn exchange_id(&self) -> &'static str {
        "bingx"
    }

    fn price_symbol(&self, ticker: &str) -> String {
        format!("{}-USDT", ticker)
    }

    async fn fetch_balances(&self) -> Result<Vec<ExchangeBalance>, ExchangeError> {
        let resp = self
            .signed_get("/openApi/spot/v1/account/balance", &[])
            .await?;
        let mut assets: HashMap<(String, String), Decimal> = HashMap::new();
        for item in resp["data"]["balances"].as_array().unwrap_or(&Vec::new()) {
            let ticker = item["asset"].as_str().unwrap_or_default();
            if ticker.is_empty() {
                continue;
            }
            let quantity = decimal_field(item, "free") + decimal_field(item, "locked");
            if quantity > BALANCE_DUST {
                *assets
                    .entry((ticker.to_string(), "Spot".to_string()))
                    .or_insert(Decimal::ZERO) += quantity;
            }
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
        let url = format!(
            "{}/openApi/spot/v1/ticker/24hr?timestamp={}",
            self.base_url,
            Utc::now().timestamp_millis()
        );
        let resp = self.http.get_json(&url, &[]).await?;
        if resp["code"].as_i64().unwrap_or(-1) != 0 {
            return Err(ExchangeError::Api {
                status: 200,
                body: format!(
                    "BingX ticker error: {}",
                    resp["msg"].as_str().unwrap_or("")
                ),
            });
        }

        let wanted: HashMap<String, &String> = tickers
            .iter()
            .map(|t| (self.price_symbol(t), t))
            .collect();
        let mut prices = Vec::new();
        for item in resp["data"].as_array().unwrap_or(&Vec::new()) {
            let symbol = item["symbol"].as_str().unwrap_or_default();
            if let Some(ticker) = wanted.get(symbol) {
                let price = match &item["lastPrice"] {
                    Value::String(s) => s.parse::<Decimal>().ok(),
                    Value::Number(n) => n.as_f64().and_then(|f| Decimal::try_from(f).ok()),
                    _ => None,
                };
                if let Some(price) = price {
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
        known_tickers: &[String],
    ) -> Vec<RecordKindReport> {
        let deposits = match self
            .fetch_wallet_history("/openApi/wallets/v1/capital/deposit/history", window)
            .await
        {
            Ok(records) => normalize_deposits(&records),
            Err(e) => Err(e),
        };
        let withdrawals = match self
            .fetch_wallet_history("/openApi/wallets/v1/capital/withdraw/history", window)
            .await
        {
            Ok(records) => normalize_withdrawals(&records),
            Err(e) => Err(e),
        };
        let trades = normalize_trades(&self.fetch_trades(window, known_tickers).await);

        vec![
            RecordKindReport {
                kind: RecordKind::Deposits,
                result: deposits,
            },
            RecordKindReport {
                kind: RecordKind::Withdrawals,
                result: withdrawals,
            },
            RecordKindReport {
                kind: RecordKind::Trades,
                result: trades,
            },
        ]
    }
}

/// Sorted "k=v&..." string without percent-encoding; BingX verifies the
/// signature against the exact raw string.
fn bingx_query(params: &[(String, String)]) -> String {
    let mut sorted: Vec<&(String, String)> = params.iter().collect();
    sorted.sort_by(|a, b| a.0.cmp(&b.0));
    sorted
        .iter()
        .map(|(k, v)| format!("{}={}", k, v))
        .collect::<Vec<_>>()
        .join("&")
}

fn decimal_field(item: &Value, key: &str) -> Decimal {
    match &item[key] {
        Value::String(s) => s.parse::<Decimal>().unwrap_or_default(),
        Value::Number(n) => n
            .as_f64()
            .and_then(|f| Decimal::try_from(f).ok())
            .unwrap_or_default(),
        _ => Decimal::ZERO,
    }
}

#[derive(Debug, Deserialize)]
struct RawDeposit {
    #[serde(deserialize_with = "de_string_flexible")]
    id: String,
    asset: String,
    #[serde(deserialize_with = "de_decimal_flexible")]
    amount: Decimal,
    #[serde(deserialize_with = "de_i64_flexible")]
    status: i64,
    #[serde(rename = "insertTime", deserialize_with = "de_i64_flexible")]
    insert_time: i64,
}

#[derive(Debug, Deserialize)]
struct RawWithdrawal {
    #[serde(deserialize_with = "de_string_flexible")]
    id: String,
    asset: String,
    #[serde(deserialize_with = "de_decimal_flexible")]
    amount: Decimal,
    #[serde(deserialize_with = "de_i64_flexible")]
    status: i64,
    #[serde(rename = "applyTime", deserialize_with = "de_i64_flexible")]
    apply_time: i64,
    #[serde(
        rename = "transactionFee",
        default,
        deserialize_with = "de_decimal_flexible"
    )]
    transaction_fee: Decimal,
}

#[derive(Debug, Deserialize)]
struct RawTrade {
    #[serde(deserialize_with = "de_string_flexible")]
    id: String,
    symbol: String,
    side: String,
    #[serde(deserialize_with = "de_i64_flexible")]
    time: i64,
    #[serde(deserialize_with = "de_decimal_flexible")]
    qty: Decimal,
    #[serde(rename = "quoteQty", deserialize_with = "de_decimal_flexible")]
    quote_qty: Decimal,
    #[serde(deserialize_with = "de_decimal_flexible")]
    price: Decimal,
    #[serde(default, deserialize_with = "de_decimal_flexible")]
    commission: Decimal,
    #[serde(rename = "commissionAsset", default)]
    commission_asset: Option<String>,
}

fn normalize_deposits(records: &[Value]) -> Result<Vec<NormalizedTransaction>, ExchangeError> {
    let mut txs = Vec::new();
    for record in records {
        let raw: RawDeposit = serde_json::from_value(record.clone())?;
        // Status 1 is a credited deposit.
        if raw.status != 1 {
            continue;
        }
        txs.push(NormalizedTransaction::new(
            format!("bingx_deposit_{}", raw.id),
            normalize_exchange_timestamp(raw.insert_time),
            TransactionKind::Deposit,
            "Deposit",
            raw.asset,
            raw.amount,
        ));
    }
    Ok(txs)
}

fn normalize_withdrawals(records: &[Value]) -> Result<Vec<NormalizedTransaction>, ExchangeError> {
    let mut txs = Vec::new();
    for record in records {
        let raw: RawWithdrawal = serde_json::from_value(record.clone())?;
        if raw.status != 1 {
            continue;
        }
        let mut tx = NormalizedTransaction::new(
            format!("bingx_withdrawal_{}", raw.id),
            normalize_exchange_timestamp(raw.apply_time),
            TransactionKind::Withdrawal,
            "Withdrawal",
            raw.asset.clone(),
            raw.amount,
        );
        tx.fee_amount = Some(raw.transaction_fee);
        tx.fee_currency = Some(raw.asset);
        txs.push(tx);
    }
    Ok(txs)
}

fn normalize_trades(records: &[Value]) -> Result<Vec<NormalizedTransaction>, ExchangeError> {
    let mut txs = Vec::new();
    for record in records {
        let raw: RawTrade = serde_json::from_value(record.clone())?;
        let Some((base, quote)) = split_dashed_symbol(&raw.symbol) else {
            debug!("Skipping BingX trade with unknown symbol '{}'", raw.symbol);
            continue;
        };
        let kind = match raw.side.to_uppercase().as_str() {
            "BUY" => TransactionKind::Buy,
            "SELL" => TransactionKind::Sell,
            other => {
                warn!("Skipping BingX trade with unknown side '{}'", other);
                continue;
            }
        };
        let mut tx = NormalizedTransaction::new(
            format!("bingx_trade_{}", raw.id),
            normalize_exchange_timestamp(raw.time),
            kind,
            format!("Spot Trade ({})", raw.side.to_uppercase()),
            base,
            raw.qty,
        );
        tx.asset2_ticker = Some(quote);
        tx.asset2_amount = Some(raw.quote_qty);
        tx.execution_price = Some(raw.price);
        tx.fee_amount = Some(raw.commission);
        tx.fee_currency = raw.commission_asset;
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
    fn test_query_is_sorted_and_unencoded() {
        let params = vec![
            ("timestamp".to_string(), "1700000000000".to_string()),
            ("symbol".to_string(), "BTC-USDT".to_string()),
            ("apiKey".to_string(), "key".to_string()),
        ];
        assert_eq!(
            bingx_query(&params),
            "apiKey=key&symbol=BTC-USDT&timestamp=1700000000000"
        );
    }

    #[test]
    fn test_normalize_deposits_numeric_fields() {
        let records = vec![json!({
            "id": 12345, "asset": "USDT", "amount": "250", "status": 1,
            "insertTime": 1700000000000i64
        })];
        let txs = normalize_deposits(&records).unwrap();
        assert_eq!(txs[0].exchange_tx_id, "bingx_deposit_12345");
        assert_eq!(txs[0].asset1_amount, dec!(250));
    }

    #[test]
    fn test_normalize_trades_splits_dashed_symbol() {
        let records = vec![json!({
            "id": "t1", "symbol": "ETH-USDT", "side": "BUY", "time": 1700000000000i64,
            "qty": "1.5", "quoteQty": "3000", "price": "2000",
            "commission": "0.0015", "commissionAsset": "ETH"
        })];
        let txs = normalize_trades(&records).unwrap();
        assert_eq!(txs[0].asset1_ticker, "ETH");
        assert_eq!(txs[0].asset2_ticker.as_deref(), Some("USDT"));
        assert_eq!(txs[0].kind, TransactionKind::Buy);
        assert_eq!(txs[0].fee_currency.as_deref(), Some("ETH"));
    }

    #[test]
    fn test_normalize_withdrawals_filters_unsuccessful() {
        let records = vec![
            json!({"id": "w1", "asset": "SOL", "amount": "3", "status": 1, "applyTime": 1700000000000i64, "transactionFee": "0.01"}),
            json!({"id": "w2", "asset": "SOL", "amount": "4", "status": 4, "applyTime": 1700000000000i64}),
        ];
        let txs = normalize_withdrawals(&records).unwrap();
        assert_eq!(txs.len(), 1);
        assert_eq!(txs[0].fee_amount, Some(dec!(0.01)));
    }
}
