use async_trait::async_trait;
use chrono::Utc;
use log::{debug, error, warn};
use rust_decimal::Decimal;
use serde::Deserialize;
use serde_json::Value;
use std::collections::HashMap;
use std::time::Duration as StdDuration;
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
use crate::providers::{sign_base64, sorted_query};

const BASE_URL: &str = "https://api.bitget.com";
const PAGE_LIMIT: usize = 100;
const SUCCESS_CODE: &str = "00000";

const BALANCE_DUST: Decimal = Decimal::from_parts(1, 0, 0, false, 9);

pub struct BitgetConnector {
    credentials: ExchangeCredentials,
    http: RateLimitedHttpClient,
    base_url: String,
}

impl BitgetConnector {
    pub fn new(credentials: ExchangeCredentials) -> Result<Self, ExchangeError> {
        if credentials.api_key.trim().is_empty() || credentials.api_secret.trim().is_empty() {
            return Err(ExchangeError::MissingCredentials(
                "Bitget requires an API key and secret".to_string(),
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
            format!("{}?{}", path, sorted_query(params))
        };

        let prehash = bitget_prehash(&timestamp, &request_path);
        let signature = sign_base64(&self.credentials.api_secret, &prehash)?;
        let passphrase = self.credentials.require_passphrase()?.to_string();

        let url = format!("{}{}", self.base_url, request_path);
        let headers = [
            ("ACCESS-KEY", self.credentials.api_key.clone()),
            ("ACCESS-SIGN", signature),
            ("ACCESS-TIMESTAMP", timestamp),
            ("ACCESS-PASSPHRASE", passphrase),
        ];
        let resp = self.http.get_json(&url, &headers).await?;
        if code(&resp) != SUCCESS_CODE {
            return Err(envelope_error(path, &resp));
        }
        Ok(resp)
    }

    /// Pages backward by id watermark. Bitget ignores time bounds once
    /// `idLessThan` is set, so the start bound is enforced client-side.
    async fn fetch_paginated(
        &self,
        path: &str,
        id_key: &str,
        window: &SyncWindow,
    ) -> Result<Vec<Value>, ExchangeError> {
        let mut all_records = Vec::new();
        let mut last_id: Option<String> = None;
        let start_ms = window.start_ms();

        loop {
            let mut params = vec![("limit".to_string(), PAGE_LIMIT.to_string())];
            match &last_id {
                Some(id) => params.push(("idLessThan".to_string(), id.clone())),
                None => {
                    params.push(("startTime".to_string(), start_ms.to_string()));
                    params.push(("endTime".to_string(), window.end_ms().to_string()));
                }
            }

            let resp = self.signed_get(path, &params).await?;
            let Some(records) = resp["data"].as_array().filter(|r| !r.is_empty()) else {
                break;
            };

            let mut stop = false;
            for record in records {
                let record_ts = record["cTime"]
                    .as_str()
                    .and_then(|s| s.parse::<i64>().ok())
                    .or_else(|| record["cTime"].as_i64())
                    .unwrap_or(0);
                if record_ts < start_ms {
                    stop = true;
                    break;
                }
                all_records.push(record.clone());
            }

            if stop || records.len() < PAGE_LIMIT {
                break;
            }
            last_id = records
                .last()
                .and_then(|r| r[id_key].as_str())
                .map(String::from);
            if last_id.is_none() {
                break;
            }
            sleep(StdDuration::from_millis(200)).await;
        }
        Ok(all_records)
    }

    async fn fetch_kind(
        &self,
        kind: RecordKind,
        path: &str,
        id_key: &str,
        window: &SyncWindow,
        normalize: fn(&[Value]) -> Result<Vec<NormalizedTransaction>, ExchangeError>,
    ) -> RecordKindReport {
        let result = match self.fetch_paginated(path, id_key, window).await {
            Ok(records) => normalize(&records),
            Err(e) => Err(e),
        };
        RecordKindReport { kind, result }
    }
}

#[async_trait]
impl ExchangeConnector for BitgetConnector {
    fn exchange_id(&self) -> &'static str {
        "bitget"
    }

    fn price_symbol(&self, ticker: &str) -> String {
        format!("{}USDT", ticker)
    }

    async fn fetch_balances(&self) -> Result<Vec<ExchangeBalance>, ExchangeError> {
        let mut assets: HashMap<(String, String), Decimal> = HashMap::new();

        match self.signed_get("/api/v2/spot/account/assets", &[]).await {
            Ok(resp) => {
                for item in resp["data"].as_array().unwrap_or(&Vec::new()) {
                    let available = decimal_field(item, "available");
                    let frozen = decimal_field(item, "frozen");
                    add_balance(&mut assets, item, "coin", available + frozen, "Spot");
                }
            }
            Err(e) => error!("Failed to fetch Bitget spot balance: {}", e),
        }

        match self.signed_get("/api/v2/earn/account/assets", &[]).await {
            Ok(resp) => {
                for item in resp["data"].as_array().unwrap_or(&Vec::new()) {
                    let amount = decimal_field(item, "amount");
                    add_balance(&mut assets, item, "coin", amount, "Earn");
                }
            }
            Err(e) => warn!("Failed to fetch Bitget earn balance: {}", e),
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
        let url = format!("{}/api/v2/spot/market/tickers", self.base_url);
        let resp = self.http.get_json(&url, &[]).await?;
        if code(&resp) != SUCCESS_CODE {
            return Err(envelope_error("/api/v2/spot/market/tickers", &resp));
        }

        let wanted: HashMap<String, &String> = tickers
            .iter()
            .map(|t| (self.price_symbol(t), t))
            .collect();
        let mut prices = Vec::new();
        for item in resp["data"].as_array().unwrap_or(&Vec::new()) {
            let symbol = item["symbol"].as_str().unwrap_or_default();
            if let Some(ticker) = wanted.get(symbol) {
                if let Some(price) = item["lastPr"]
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
                RecordKind::Deposits,
                "/api/v2/spot/wallet/deposit-records",
                "id",
                window,
                normalize_deposits,
            )
            .await,
            self.fetch_kind(
                RecordKind::Withdrawals,
                "/api/v2/spot/wallet/withdrawal-records",
                "withdrawId",
                window,
                normalize_withdrawals,
            )
            .await,
            self.fetch_kind(
                RecordKind::Transfers,
                "/api/v2/asset/transfer-records",
                "id",
                window,
                normalize_transfers,
            )
            .await,
            self.fetch_kind(
                RecordKind::Trades,
                "/api/v2/spot/trade/fills",
                "tradeId",
                window,
                normalize_trades,
            )
            .await,
        ]
    }
}

fn bitget_prehash(timestamp: &str, request_path: &str) -> String {
    // timestamp + method + requestPath, with an empty body for GET.
    format!("{}GET{}", timestamp, request_path)
}

fn code(resp: &Value) -> &str {
    resp.get("code").and_then(Value::as_str).unwrap_or("")
}

fn envelope_error(path: &str, resp: &Value) -> ExchangeError {
    ExchangeError::Api {
        status: 200,
        body: format!(
            "Bitget {} code {}: {}",
            path,
            code(resp),
            resp.get("msg").and_then(Value::as_str).unwrap_or("")
        ),
    }
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

fn add_balance(
    assets: &mut HashMap<(String, String), Decimal>,
    item: &Value,
    coin_key: &str,
    amount: Decimal,
    account_type: &str,
) {
    let ticker = item[coin_key].as_str().unwrap_or_default();
    if ticker.is_empty() || amount <= Decimal::ZERO {
        return;
    }
    *assets
        .entry((ticker.to_string(), account_type.to_string()))
        .or_insert(Decimal::ZERO) += amount;
}

#[derive(Debug, Deserialize)]
struct RawDeposit {
    id: String,
    coin: String,
    #[serde(deserialize_with = "de_decimal_flexible")]
    amount: Decimal,
    status: String,
    #[serde(rename = "cTime", deserialize_with = "de_i64_flexible")]
    c_time: i64,
}

#[derive(Debug, Deserialize)]
struct RawWithdrawal {
    #[serde(rename = "withdrawId")]
    withdraw_id: String,
    coin: String,
    #[serde(deserialize_with = "de_decimal_flexible")]
    amount: Decimal,
    status: String,
    #[serde(rename = "cTime", deserialize_with = "de_i64_flexible")]
    c_time: i64,
    #[serde(default, deserialize_with = "de_decimal_flexible")]
    fee: Decimal,
}

#[derive(Debug, Deserialize)]
struct RawTransfer {
    id: String,
    coin: String,
    #[serde(deserialize_with = "de_decimal_flexible")]
    amount: Decimal,
    status: String,
    #[serde(rename = "cTime", deserialize_with = "de_i64_flexible")]
    c_time: i64,
    #[serde(rename = "fromType", default)]
    from_type: String,
    #[serde(rename = "toType", default)]
    to_type: String,
}

#[derive(Debug, Deserialize)]
struct RawTrade {
    #[serde(rename = "tradeId")]
    trade_id: String,
    #[serde(default)]
    symbol: String,
    side: String,
    #[serde(rename = "cTime", deserialize_with = "de_i64_flexible")]
    c_time: i64,
    #[serde(default, deserialize_with = "de_decimal_flexible")]
    size: Decimal,
    #[serde(default, deserialize_with = "de_decimal_flexible")]
    amount: Decimal,
    #[serde(default, deserialize_with = "de_decimal_flexible")]
    price: Decimal,
    #[serde(rename = "feeDetail", default)]
    fee_detail: Option<Value>,
    #[serde(default)]
    fee: Option<String>,
    #[serde(rename = "feeCoin", default)]
    fee_coin: Option<String>,
}

fn normalize_deposits(records: &[Value]) -> Result<Vec<NormalizedTransaction>, ExchangeError> {
    let mut txs = Vec::new();
    for record in records {
        let raw: RawDeposit = serde_json::from_value(record.clone())?;
        if raw.status != "success" {
            continue;
        }
        txs.push(NormalizedTransaction::new(
            format!("bitget_deposit_{}", raw.id),
            normalize_exchange_timestamp(raw.c_time),
            TransactionKind::Deposit,
            "Deposit",
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
        if raw.status != "success" {
            continue;
        }
        let mut tx = NormalizedTransaction::new(
            format!("bitget_withdrawal_{}", raw.withdraw_id),
            normalize_exchange_timestamp(raw.c_time),
            TransactionKind::Withdrawal,
            "Withdrawal",
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
        if raw.status != "success" {
            continue;
        }
        let mut tx = NormalizedTransaction::new(
            format!("bitget_transfer_{}", raw.id),
            normalize_exchange_timestamp(raw.c_time),
            TransactionKind::Transfer,
            format!("{} -> {}", raw.from_type, raw.to_type),
            raw.coin,
            raw.amount,
        );
        tx.description = Some("Internal transfer on Bitget".to_string());
        txs.push(tx);
    }
    Ok(txs)
}

fn normalize_trades(records: &[Value]) -> Result<Vec<NormalizedTransaction>, ExchangeError> {
    let mut txs = Vec::new();
    for record in records {
        let raw: RawTrade = serde_json::from_value(record.clone())?;
        let Some((base, quote)) = split_concat_symbol(&raw.symbol) else {
            debug!("Skipping Bitget trade with unknown symbol '{}'", raw.symbol);
            continue;
        };
        let kind = match raw.side.to_lowercase().as_str() {
            "buy" => TransactionKind::Buy,
            "sell" => TransactionKind::Sell,
            other => {
                warn!("Skipping Bitget trade with unknown side '{}'", other);
                continue;
            }
        };

        let mut execution_price = raw.price;
        if execution_price.is_zero() && !raw.size.is_zero() {
            execution_price = raw.amount / raw.size;
        }
        let (fee_amount, fee_currency) = parse_fee(&raw, &quote);

        let mut tx = NormalizedTransaction::new(
            format!("bitget_trade_{}", raw.trade_id),
            normalize_exchange_timestamp(raw.c_time),
            kind,
            format!("Spot Trade ({})", raw.side.to_uppercase()),
            base,
            raw.size,
        );
        tx.asset2_ticker = Some(quote);
        tx.asset2_amount = Some(raw.amount);
        tx.execution_price = Some(execution_price);
        tx.fee_amount = Some(fee_amount);
        tx.fee_currency = Some(fee_currency);
        txs.push(tx);
    }
    Ok(txs)
}

/// Bitget serves `feeDetail` as either a JSON-encoded string or an inline
/// list depending on the endpoint version. Falls back to the top-level
/// fee fields, then to a zero fee in the quote currency.
fn parse_fee(trade: &RawTrade, default_currency: &str) -> (Decimal, String) {
    let detail_list = match &trade.fee_detail {
        Some(Value::String(s)) if !s.is_empty() => serde_json::from_str::<Value>(s)
            .ok()
            .and_then(|v| v.as_array().cloned()),
        Some(Value::Array(items)) => Some(items.clone()),
        _ => None,
    };

    if let Some(first) = detail_list.as_ref().and_then(|l| l.first()) {
        if first.is_object() {
            let fee = decimal_field(first, "fee").abs();
            if fee > Decimal::ZERO {
                let currency = first["feeCoin"]
                    .as_str()
                    .unwrap_or(default_currency)
                    .to_string();
                return (fee, currency);
            }
        }
    }

    if let (Some(fee), Some(fee_coin)) = (&trade.fee, &trade.fee_coin) {
        let fee = fee.parse::<Decimal>().unwrap_or_default().abs();
        if fee > Decimal::ZERO {
            return (fee, fee_coin.clone());
        }
    }

    (Decimal::ZERO, default_currency.to_string())
}
