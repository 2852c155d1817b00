use async_trait::async_trait;
use chrono::{Duration, Utc};
use log::{debug, error, warn};
use rust_decimal::Decimal;
use serde::Deserialize;
use serde_json::Value;
use std::collections::HashMap;
use std::time::Duration as StdDuration;
use tokio::sync::OnceCell;
use tokio::time::sleep;

use crate::connector::ExchangeConnector;
use crate::errors::ExchangeError;
use crate::http::RateLimitedHttpClient;
use crate::models::{
    ExchangeBalance, ExchangeCredentials, NormalizedTransaction, RecordKind, RecordKindReport,
    SpotPrice, SyncWindow, TransactionKind,
};
use crate::normalize::{
    de_decimal_flexible, de_i64_flexible, normalize_exchange_timestamp, split_concat_symbol,
};
use crate::providers::{sign_hex, sorted_query};

const BASE_URL: &str = "https://api.bybit.com";
const RECV_WINDOW: &str = "20000";
const PAGE_LIMIT: usize = 50;
const HISTORY_DEPTH_DAYS: i64 = 2 * 365;
const WINDOW_DAYS: i64 = 7;
// Bybit returns this retCode when a window falls outside its 2-year
// history retention. It ends the backward walk, not the whole kind.
const RET_CODE_HISTORY_LIMIT: i64 = 10001;

const BALANCE_DUST: Decimal = Decimal::from_parts(1, 0, 0, false, 9);

pub struct BybitConnector {
    credentials: ExchangeCredentials,
    http: RateLimitedHttpClient,
    base_url: String,
    time_offset_ms: OnceCell<i64>,
}

impl BybitConnector {
    pub fn new(credentials: ExchangeCredentials) -> Result<Self, ExchangeError> {
        if credentials.api_key.trim().is_empty() || credentials.api_secret.trim().is_empty() {
            return Err(ExchangeError::MissingCredentials(
                "Bybit requires an API key and secret".to_string(),
            ));
        }
        Ok(Self {
            credentials,
            http: RateLimitedHttpClient::new(),
            base_url: BASE_URL.to_string(),
            time_offset_ms: OnceCell::new(),
        })
    }

    /// Offset between Bybit server time and local time, fetched once and
    /// applied to every signed timestamp.
    async fn time_offset_ms(&self) -> i64 {
        *self
            .time_offset_ms
            .get_or_init(|| async {
                let url = format!("{}/v5/market/time", self.base_url);
                match self.http.get_json(&url, &[]).await {
                    Ok(resp) if ret_code(&resp) == 0 => {
                        let server_ms = resp["result"]["timeNano"]
                            .as_str()
                            .and_then(|s| s.parse::<i64>().ok())
                            .map(|nanos| nanos / 1_000_000);
                        match server_ms {
                            Some(server_ms) => {
                                let offset = server_ms - Utc::now().timestamp_millis();
                                debug!("Bybit server time synced, offset {}ms", offset);
                                offset
                            }
                            None => 0,
                        }
                    }
                    _ => {
                        warn!("Failed to sync Bybit server time, using local time");
                        0
                    }
                }
            })
            .await
    }

    async fn signed_get(
        &self,
        path: &str,
        params: &[(String, String)],
    ) -> Result<Value, ExchangeError> {
        let timestamp = (Utc::now().timestamp_millis() + self.time_offset_ms().await).to_string();

        let mut all_params = params.to_vec();
        all_params.push(("recvWindow".to_string(), RECV_WINDOW.to_string()));
        let query = sorted_query(&all_params);

        let payload = bybit_prehash(&timestamp, &self.credentials.api_key, RECV_WINDOW, &query);
        let signature = sign_hex(&self.credentials.api_secret, &payload)?;

        let url = format!("{}{}?{}", self.base_url, path, query);
        let headers = [
            ("X-BAPI-API-KEY", self.credentials.api_key.clone()),
            ("X-BAPI-TIMESTAMP", timestamp),
            ("X-BAPI-RECV-WINDOW", RECV_WINDOW.to_string()),
            ("X-BAPI-SIGN", signature),
        ];
        self.http.get_json(&url, &headers).await
    }

    /// Walks 7-day windows backward from the window end, paginating each by
    /// cursor. Stops early when Bybit reports the 2-year retention limit.
    async fn fetch_windowed(
        &self,
        path: &str,
        window: &SyncWindow,
        extra_params: &[(&str, &str)],
    ) -> Result<Vec<Value>, ExchangeError> {
        let mut all_records = Vec::new();
        let floor = window
            .start
            .max(Utc::now() - Duration::days(HISTORY_DEPTH_DAYS));
        let mut end = window.end;

        while end > floor {
            let start = floor.max(end - Duration::days(WINDOW_DAYS));
            debug!(
                "Bybit history {}: {} -> {}",
                path,
                start.format("%Y-%m-%d"),
                end.format("%Y-%m-%d")
            );

            let mut cursor = String::new();
            let mut history_limit_reached = false;
            loop {
                let mut params = vec![
                    ("limit".to_string(), PAGE_LIMIT.to_string()),
                    ("startTime".to_string(), start.timestamp_millis().to_string()),
                    ("endTime".to_string(), end.timestamp_millis().to_string()),
                ];
                for (k, v) in extra_params {
                    params.push((k.to_string(), v.to_string()));
                }
                if !cursor.is_empty() {
                    params.push(("cursor".to_string(), cursor.clone()));
                }

                let resp = self.signed_get(path, &params).await?;
                let code = ret_code(&resp);
                if code == RET_CODE_HISTORY_LIMIT {
                    debug!("Bybit history {}: 2-year retention limit reached", path);
                    history_limit_reached = true;
                    break;
                }
                if code != 0 {
                    return Err(envelope_error(path, code, ret_msg(&resp)));
                }

                let result = &resp["result"];
                let rows = result["rows"]
                    .as_array()
                    .or_else(|| result["list"].as_array());
                if let Some(rows) = rows {
                    all_records.extend(rows.iter().cloned());
                }

                cursor = result["nextPageCursor"]
                    .as_str()
                    .unwrap_or_default()
                    .to_string();
                if cursor.is_empty() {
                    break;
                }
            }

            if history_limit_reached {
                break;
            }
            end = start;
            sleep(StdDuration::from_millis(200)).await;
        }
        Ok(all_records)
    }

    async fn fetch_kind(
        &self,
        kind: RecordKind,
        path: &str,
        window: &SyncWindow,
        extra_params: &[(&str, &str)],
        normalize: fn(&[Value]) -> Result<Vec<NormalizedTransaction>, ExchangeError>,
    ) -> RecordKindReport {
        let result = match self.fetch_windowed(path, window, extra_params).await {
            Ok(records) => normalize(&records),
            Err(e) => Err(e),
        };
        RecordKindReport { kind, result }
    }
}

#[async_trait]
impl ExchangeConnector for BybitConnector {
    fn exchange_id(&self) -> &'static str {
        "bybit"
    }

    fn price_symbol(&self, ticker: &str) -> String {
        format!("{}USDT", ticker)
    }

    async fn fetch_balances(&self) -> Result<Vec<ExchangeBalance>, ExchangeError> {
        let mut assets: HashMap<(String, String), Decimal> = HashMap::new();

        match self
            .signed_get(
                "/v5/account/wallet-balance",
                &[("accountType".to_string(), "UNIFIED".to_string())],
            )
            .await
        {
            Ok(resp) if ret_code(&resp) == 0 => {
                let coins = resp["result"]["list"]
                    .get(0)
                    .and_then(|acct| acct["coin"].as_array())
                    .cloned()
                    .unwrap_or_default();
                for coin in &coins {
                    accumulate(&mut assets, coin, "coin", "walletBalance", "Unified Trading");
                }
            }
            Ok(resp) => warn!("Bybit unified balance error: {}", ret_msg(&resp)),
            Err(e) => error!("Failed to fetch Bybit unified balance: {}", e),
        }

        match self
            .signed_get(
                "/v5/asset/transfer/query-account-coins-balance",
                &[("accountType".to_string(), "FUND".to_string())],
            )
            .await
        {
            Ok(resp) if ret_code(&resp) == 0 => {
                for coin in resp["result"]["balance"].as_array().unwrap_or(&Vec::new()) {
                    accumulate(&mut assets, coin, "coin", "walletBalance", "Funding");
                }
            }
            Ok(resp) => warn!("Bybit funding balance error: {}", ret_msg(&resp)),
            Err(e) => error!("Failed to fetch Bybit funding balance: {}", e),
        }

        for category in ["FlexibleSaving", "OnChain"] {
            match self
                .signed_get(
                    "/v5/earn/position",
                    &[("category".to_string(), category.to_string())],
                )
                .await
            {
                Ok(resp) if ret_code(&resp) == 0 => {
                    for pos in resp["result"]["list"].as_array().unwrap_or(&Vec::new()) {
                        accumulate(&mut assets, pos, "coin", "amount", "Earn");
                    }
                }
                Ok(resp) => debug!(
                    "Bybit earn balance unavailable for {}: {}",
                    category,
                    ret_msg(&resp)
                ),
                Err(e) => error!("Failed to fetch Bybit earn balance ({}): {}", category, e),
            }
        }

        Ok(assets
            .into_iter()
            .filter(|(_, qty)| *qty > BALANCE_DUST)
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
        let url = format!("{}/v5/market/tickers?category=spot", self.base_url);
        let resp = self.http.get_json(&url, &[]).await?;
        if ret_code(&resp) != 0 {
            return Err(envelope_error(
                "/v5/market/tickers",
                ret_code(&resp),
                ret_msg(&resp),
            ));
        }

        let wanted: HashMap<String, &String> = tickers
            .iter()
            .map(|t| (self.price_symbol(t), t))
            .collect();
        let mut prices = Vec::new();
        for item in resp["result"]["list"].as_array().unwrap_or(&Vec::new()) {
            let symbol = item["symbol"].as_str().unwrap_or_default();
            if let Some(ticker) = wanted.get(symbol) {
                if let Some(price) = item["lastPrice"]
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
        vec![
            self.fetch_kind(
                RecordKind::Transfers,
                "/v5/asset/transfer/query-inter-transfer-list",
                window,
                &[],
                normalize_transfers,
            )
            .await,
            self.fetch_kind(
                RecordKind::Deposits,
                "/v5/asset/deposit/query-record",
                window,
                &[],
                normalize_deposits,
            )
            .await,
            self.fetch_kind(
                RecordKind::InternalDeposits,
                "/v5/asset/deposit/query-internal-record",
                window,
                &[],
                normalize_internal_deposits,
            )
            .await,
            self.fetch_kind(
                RecordKind::Withdrawals,
                "/v5/asset/withdraw/query-record",
                window,
                &[],
                normalize_withdrawals,
            )
            .await,
            self.fetch_kind(
                RecordKind::Trades,
                "/v5/execution/list",
                window,
                &[("category", "spot")],
                normalize_trades,
            )
            .await,
        ]
    }
}

fn bybit_prehash(timestamp: &str, api_key: &str, recv_window: &str, query: &str) -> String {
    format!("{}{}{}{}", timestamp, api_key, recv_window, query)
}

fn ret_code(resp: &Value) -> i64 {
    resp.get("retCode").and_then(Value::as_i64).unwrap_or(-1)
}

fn ret_msg(resp: &Value) -> &str {
    resp.get("retMsg").and_then(Value::as_str).unwrap_or("")
}

fn envelope_error(path: &str, code: i64, msg: &str) -> ExchangeError {
    ExchangeError::Api {
        status: 200,
        body: format!("Bybit {} retCode {}: {}", path, code, msg),
    }
}

fn accumulate(
    assets: &mut HashMap<(String, String), Decimal>,
    item: &Value,
    coin_key: &str,
    amount_key: &str,
    account_type: &str,
) {
    let ticker = item[coin_key].as_str().unwrap_or_default();
    if ticker.is_empty() {
        return;
    }
    let amount = match &item[amount_key] {
        Value::String(s) => s.parse::<Decimal>().unwrap_or_default(),
        Value::Number(n) => n
            .as_f64()
            .and_then(|f| Decimal::try_from(f).ok())
            .unwrap_or_default(),
        _ => Decimal::ZERO,
    };
    if amount > Decimal::ZERO {
        *assets
            .entry((ticker.to_string(), account_type.to_string()))
            .or_insert(Decimal::ZERO) += amount;
    }
}

#[derive(Debug, Deserialize)]
struct RawDeposit {
    #[serde(rename = "txID")]
    tx_id: String,
    coin: String,
    #[serde(deserialize_with = "de_decimal_flexible")]
    amount: Decimal,
    #[serde(deserialize_with = "de_i64_flexible")]
    status: i64,
    #[serde(rename = "successAt", deserialize_with = "de_i64_flexible")]
    success_at: i64,
    #[serde(default)]
    chain: String,
}

#[derive(Debug, Deserialize)]
struct RawInternalDeposit {
    id: String,
    coin: String,
    #[serde(deserialize_with = "de_decimal_flexible")]
    amount: Decimal,
    #[serde(deserialize_with = "de_i64_flexible")]
    status: i64,
    #[serde(rename = "createdTime", deserialize_with = "de_i64_flexible")]
    created_time: i64,
}

#[derive(Debug, Deserialize)]
struct RawWithdrawal {
    #[serde(rename = "txID")]
    tx_id: String,
    coin: String,
    #[serde(deserialize_with = "de_decimal_flexible")]
    amount: Decimal,
    #[serde(deserialize_with = "de_i64_flexible")]
    status: i64,
    #[serde(rename = "updateAt", deserialize_with = "de_i64_flexible")]
    update_at: i64,
    #[serde(default, deserialize_with = "de_decimal_flexible")]
    fee: Decimal,
    #[serde(rename = "withdrawType", default)]
    withdraw_type: Option<i64>,
}

#[derive(Debug, Deserialize)]
struct RawTransfer {
    #[serde(rename = "transferId")]
    transfer_id: String,
    coin: String,
    #[serde(deserialize_with = "de_decimal_flexible")]
    amount: Decimal,
    #[serde(deserialize_with = "de_i64_flexible")]
    timestamp: i64,
    #[serde(rename = "fromAccountType", default)]
    from_account_type: String,
    #[serde(rename = "toAccountType", default)]
    to_account_type: String,
}

#[derive(Debug, Deserialize)]
struct RawTrade {
    #[serde(rename = "execId")]
    exec_id: String,
    #[serde(default)]
    symbol: String,
    side: String,
    #[serde(rename = "execTime", deserialize_with = "de_i64_flexible")]
    exec_time: i64,
    #[serde(rename = "execQty", default, deserialize_with = "de_decimal_flexible")]
    exec_qty: Decimal,
    #[serde(rename = "execValue", default, deserialize_with = "de_decimal_flexible")]
    exec_value: Decimal,
    #[serde(rename = "execPrice", default, deserialize_with = "de_decimal_flexible")]
    exec_price: Decimal,
    #[serde(rename = "execFee", default, deserialize_with = "de_decimal_flexible")]
    exec_fee: Decimal,
    #[serde(rename = "feeTokenId", default)]
    fee_token_id: Option<String>,
}

fn normalize_deposits(records: &[Value]) -> Result<Vec<NormalizedTransaction>, ExchangeError> {
    let mut txs = Vec::new();
    for record in records {
        let raw: RawDeposit = serde_json::from_value(record.clone())?;
        // Status 1 is a settled on-chain deposit.
        if raw.status != 1 {
            continue;
        }
        txs.push(NormalizedTransaction::new(
            format!("bybit_deposit_{}", raw.tx_id),
            normalize_exchange_timestamp(raw.success_at),
            TransactionKind::Deposit,
            format!("Deposit via {}", raw.chain),
            raw.coin,
            raw.amount,
        ));
    }
    Ok(txs)
}

fn normalize_internal_deposits(
    records: &[Value],
) -> Result<Vec<NormalizedTransaction>, ExchangeError> {
    let mut txs = Vec::new();
    for record in records {
        let raw: RawInternalDeposit = serde_json::from_value(record.clone())?;
        if !matches!(raw.status, 1 | 2) {
            continue;
        }
        txs.push(NormalizedTransaction::new(
            format!("bybit_internal_deposit_{}", raw.id),
            normalize_exchange_timestamp(raw.created_time),
            TransactionKind::Deposit,
            "Internal Deposit",
            raw.coin,
            raw.amount,
        ));
    }
    Ok(txs)
}

fn normalize_withdrawals(records: &[Value]) -> Result<Vec<NormalizedTransaction>, ExchangeError> {
    let mut txs = Vec::new();
    for record in records {
        let raw: RawWithdrawal = serde_json::from_value(record.clone())?;
        // Status 2 is a completed withdrawal.
        if raw.status != 2 {
            continue;
        }
        let raw_kind = match raw.withdraw_type {
            Some(t) => format!("Withdrawal ({})", t),
            None => "Withdrawal (N/A)".to_string(),
        };
        let mut tx = NormalizedTransaction::new(
            format!("bybit_withdrawal_{}", raw.tx_id),
            normalize_exchange_timestamp(raw.update_at),
            TransactionKind::Withdrawal,
            raw_kind,
            raw.coin.clone(),
            raw.amount,
        );
        tx.fee_amount = Some(raw.fee);
        tx.fee_currency = Some(raw.coin);
        txs.push(tx);
    }
    Ok(txs)
}

fn normalize_transfers(records: &[Value]) -> Result<Vec<NormalizedTransaction>, ExchangeError> {
    let mut txs = Vec::new();
    for record in records {
        let raw: RawTransfer = serde_json::from_value(record.clone())?;
        let mut tx = NormalizedTransaction::new(
            format!("bybit_transfer_{}", raw.transfer_id),
            normalize_exchange_timestamp(raw.timestamp),
            TransactionKind::Transfer,
            format!("{} -> {}", raw.from_account_type, raw.to_account_type),
            raw.coin,
            raw.amount,
        );
        tx.description = Some("Internal transfer on Bybit".to_string());
        txs.push(tx);
    }
    Ok(txs)
}

fn normalize_trades(records: &[Value]) -> Result<Vec<NormalizedTransaction>, ExchangeError> {
    let mut txs = Vec::new();
    for record in records {
        let raw: RawTrade = serde_json::from_value(record.clone())?;
        let Some((base, quote)) = split_concat_symbol(&raw.symbol) else {
            debug!("Skipping Bybit trade with unknown symbol '{}'", raw.symbol);
            continue;
        };
        let kind = match raw.side.to_lowercase().as_str() {
            "buy" => TransactionKind::Buy,
            "sell" => TransactionKind::Sell,
            other => {
                warn!("Skipping Bybit trade with unknown side '{}'", other);
                continue;
            }
        };
        let mut tx = NormalizedTransaction::new(
            format!("bybit_trade_{}", raw.exec_id),
            normalize_exchange_timestamp(raw.exec_time),
            kind,
            format!("Spot Trade ({})", raw.side.to_uppercase()),
            base,
            raw.exec_qty,
        );
        tx.asset2_ticker = Some(quote.clone());
        tx.asset2_amount = Some(raw.exec_value);
        tx.execution_price = Some(raw.exec_price);
        tx.fee_amount = Some(raw.exec_fee);
        tx.fee_currency = Some(raw.fee_token_id.filter(|f| !f.is_empty()).unwrap_or(quote));
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
        let prehash = bybit_prehash("1700000000000", "key123", "20000", "category=spot&limit=50");
        assert_eq!(prehash, "1700000000000key12320000category=spot&limit=50");
    }

    #[test]
    fn test_normalize_deposits_filters_pending() {
        let records = vec![
            json!({"txID": "0xabc", "coin": "BTC", "amount": "0.5", "status": 1, "successAt": "1700000000000", "chain": "BTC"}),
            json!({"txID": "0xdef", "coin": "ETH", "amount": "1.0", "status": 0, "successAt": "1700000000000", "chain": "ETH"}),
        ];
        let txs = normalize_deposits(&records).unwrap();
        assert_eq!(txs.len(), 1);
        assert_eq!(txs[0].exchange_tx_id, "bybit_deposit_0xabc");
        assert_eq!(txs[0].kind, TransactionKind::Deposit);
        assert_eq!(txs[0].asset1_amount, dec!(0.5));
        assert_eq!(txs[0].raw_kind, "Deposit via BTC");
    }

    #[test]
    fn test_normalize_withdrawals_carries_fee_in_coin() {
        let records = vec![json!({
            "txID": "0xw1", "coin": "SOL", "amount": "10", "status": 2,
            "updateAt": "1700000000000", "fee": "0.01", "withdrawType": 0
        })];
        let txs = normalize_withdrawals(&records).unwrap();
        assert_eq!(txs.len(), 1);
        assert_eq!(txs[0].fee_amount, Some(dec!(0.01)));
        assert_eq!(txs[0].fee_currency.as_deref(), Some("SOL"));
        assert_eq!(txs[0].raw_kind, "Withdrawal (0)");
    }

    #[test]
    fn test_normalize_trades_splits_symbol_and_sides() {
        let records = vec![
            json!({
                "execId": "e1", "symbol": "ETHUSDT", "side": "Buy", "execTime": "1700000000000",
                "execQty": "2", "execValue": "4000", "execPrice": "2000",
                "execFee": "0.002", "feeTokenId": "ETH"
            }),
            json!({
                "execId": "e2", "symbol": "FOOBAR", "side": "Sell", "execTime": "1700000000000",
                "execQty": "1", "execValue": "1", "execPrice": "1", "execFee": "0"
            }),
        ];
        let txs = normalize_trades(&records).unwrap();
        assert_eq!(txs.len(), 1);
        let tx = &txs[0];
        assert_eq!(tx.kind, TransactionKind::Buy);
        assert_eq!(tx.asset1_ticker, "ETH");
        assert_eq!(tx.asset2_ticker.as_deref(), Some("USDT"));
        assert_eq!(tx.asset2_amount, Some(dec!(4000)));
        assert_eq!(tx.fee_currency.as_deref(), Some("ETH"));
    }

    #[test]
    fn test_normalize_trades_defaults_fee_currency_to_quote() {
        let records = vec![json!({
            "execId": "e3", "symbol": "SOLUSDC", "side": "Sell", "execTime": "1700000000000",
            "execQty": "5", "execValue": "500", "execPrice": "100", "execFee": "0.5"
        })];
        let txs = normalize_trades(&records).unwrap();
        assert_eq!(txs[0].fee_currency.as_deref(), Some("USDC"));
        assert_eq!(txs[0].kind, TransactionKind::Sell);
    }

    #[test]
    fn test_normalize_internal_deposits_accepts_status_one_and_two() {
        let records = vec![
            json!({"id": "1", "coin": "USDT", "amount": "100", "status": 1, "createdTime": "1700000000000"}),
            json!({"id": "2", "coin": "USDT", "amount": "50", "status": 2, "createdTime": "1700000000000"}),
            json!({"id": "3", "coin": "USDT", "amount": "25", "status": 3, "createdTime": "1700000000000"}),
        ];
        let txs = normalize_internal_deposits(&records).unwrap();
        assert_eq!(txs.len(), 2);
        assert_eq!(txs[1].exchange_tx_id, "bybit_internal_deposit_2");
    }
}
