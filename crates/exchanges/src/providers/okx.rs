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
    de_decimal_flexible, de_i64_flexible, normalize_exchange_timestamp, split_dashed_symbol,
};
use crate::providers::sign_base64;

const BASE_URL: &str = "https://www.okx.com";
const PAGE_LIMIT: usize = 100;

const BALANCE_DUST: Decimal = Decimal::from_parts(1, 0, 0, false, 9);

pub struct OkxConnector {
    credentials: ExchangeCredentials,
    http: RateLimitedHttpClient,
    base_url: String,
}

impl OkxConnector {
    pub fn new(credentials: ExchangeCredentials) -> Result<Self, ExchangeError> {
        if credentials.api_key.trim().is_empty() || credentials.api_secret.trim().is_empty() {
            return Err(ExchangeError::MissingCredentials(
                "OKX requires an API key and secret".to_string(),
            ));
        }
        credentials.require_passphrase()?;
        Ok(Self {
            credentials,
            http: RateLimitedHttpClient::new(),
            base_url: BASE_URL.to_string(),
        })
    }

    /// Signed GET returning the `data` array. OKX signs an ISO-8601
    /// millisecond timestamp over method, path with query, and body.
    async fn signed_get(
        &self,
        path: &str,
        params: &[(String, String)],
    ) -> Result<Vec<Value>, ExchangeError> {
        let timestamp = Utc::now().format("%Y-%m-%dT%H:%M:%S%.3fZ").to_string();
        let request_path = if params.is_empty() {
            path.to_string()
        } else {
            format!("{}?{}", path, plain_query(params))
        };

        let prehash = okx_prehash(&timestamp, &request_path);
        let signature = sign_base64(&self.credentials.api_secret, &prehash)?;
        let passphrase = self.credentials.require_passphrase()?.to_string();

        let url = format!("{}{}", self.base_url, request_path);
        let headers = [
            ("OK-ACCESS-KEY", self.credentials.api_key.clone()),
            ("OK-ACCESS-SIGN", signature),
            ("OK-ACCESS-TIMESTAMP", timestamp),
            ("OK-ACCESS-PASSPHRASE", passphrase),
        ];
        let resp = self.http.get_json(&url, &headers).await?;
        if resp["code"].as_str().unwrap_or("") != "0" {
            return Err(ExchangeError::Api {
                status: 200,
                body: format!(
                    "OKX {} code {}: {}",
                    path,
                    resp["code"].as_str().unwrap_or(""),
                    resp["msg"].as_str().unwrap_or("")
                ),
            });
        }
        Ok(resp["data"].as_array().cloned().unwrap_or_default())
    }

    /// Pages backward with `after` set to the last record's native id,
    /// stopping on a short page.
    async fn fetch_paginated(
        &self,
        path: &str,
        id_key: &str,
        base_params: &[(String, String)],
    ) -> Result<Vec<Value>, ExchangeError> {
        let mut all_records = Vec::new();
        let mut last_id: Option<String> = None;
        loop {
            let mut params = base_params.to_vec();
            if let Some(id) = &last_id {
                params.push(("after".to_string(), id.clone()));
            }
            let records = self.signed_get(path, &params).await?;
            if records.is_empty() {
                break;
            }
            let page_len = records.len();
            last_id = records
                .last()
                .and_then(|r| r[id_key].as_str())
                .map(String::from);
            all_records.extend(records);
            if page_len < PAGE_LIMIT || last_id.is_none() {
                break;
            }
            sleep(StdDuration::from_millis(200)).await;
        }
        Ok(all_records)
    }

    async fn fetch_funding_history(
        &self,
        kind: RecordKind,
        path: &str,
        id_key: &str,
        window: &SyncWindow,
        normalize: fn(&[Value]) -> Result<Vec<NormalizedTransaction>, ExchangeError>,
    ) -> RecordKindReport {
        let params = vec![
            ("begin".to_string(), window.start_ms().to_string()),
            ("end".to_string(), window.end_ms().to_string()),
        ];
        let result = match self.fetch_paginated(path, id_key, &params).await {
            Ok(records) => normalize(&records),
            Err(e) => Err(e),
        };
        RecordKindReport { kind, result }
    }

    /// The fills-history endpoint accepts no time filter, so records are
    /// trimmed to the window client-side.
    async fn fetch_trade_history(&self, window: &SyncWindow) -> RecordKindReport {
        let params = vec![("instType".to_string(), "SPOT".to_string())];
        let result = match self
            .fetch_paginated("/api/v5/trade/fills-history", "tradeId", &params)
            .await
        {
            Ok(records) => {
                let in_window: Vec<Value> = records
                    .into_iter()
                    .filter(|r| {
                        let ts = r["ts"]
                            .as_str()
                            .and_then(|s| s.parse::<i64>().ok())
                            .unwrap_or(0);
                        ts >= window.start_ms() && ts <= window.end_ms()
                    })
                    .collect();
                normalize_trades(&in_window)
            }
            Err(e) => Err(e),
        };
        RecordKindReport {
            kind: RecordKind::Trades,
            result,
        }
    }
}

#[async_trait]
impl ExchangeConnector for OkxConnector {
    fn exchange_id(&self) -> &'static str {
        "okx"
    }

    fn price_symbol(&self, ticker: &str) -> String {
        format!("{}-USDT", ticker)
    }

    async fn fetch_balances(&self) -> Result<Vec<ExchangeBalance>, ExchangeError> {
        let mut assets: HashMap<(String, String), Decimal> = HashMap::new();

        match self.signed_get("/api/v5/account/balance", &[]).await {
            Ok(data) => {
                let details = data
                    .first()
                    .and_then(|acct| acct["details"].as_array().cloned())
                    .unwrap_or_default();
                for item in &details {
                    add_balance(&mut assets, item, "cashBal", "Trading");
                }
            }
            Err(e) => error!("Failed to fetch OKX trading balance: {}", e),
        }

        match self.signed_get("/api/v5/asset/balances", &[]).await {
            Ok(data) => {
                for item in &data {
                    add_balance(&mut assets, item, "bal", "Funding");
                }
            }
            Err(e) => error!("Failed to fetch OKX funding balance: {}", e),
        }

        match self.signed_get("/api/v5/finance/savings/balance", &[]).await {
            Ok(data) => {
                for item in &data {
                    add_balance(&mut assets, item, "amt", "Earn");
                }
            }
            Err(e) => warn!("Failed to fetch OKX savings balance: {}", e),
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
        let url = format!("{}/api/v5/market/tickers?instType=SPOT", self.base_url);
        let resp = self.http.get_json(&url, &[]).await?;
        if resp["code"].as_str().unwrap_or("") != "0" {
            return Err(ExchangeError::Api {
                status: 200,
                body: format!("OKX ticker error: {}", resp["msg"].as_str().unwrap_or("")),
            });
        }

        let wanted: HashMap<String, &String> = tickers
            .iter()
            .map(|t| (self.price_symbol(t), t))
            .collect();
        let mut prices = Vec::new();
        for item in resp["data"].as_array().unwrap_or(&Vec::new()) {
            let inst_id = item["instId"].as_str().unwrap_or_default();
            if let Some(ticker) = wanted.get(inst_id) {
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
        vec![
            self.fetch_funding_history(
                RecordKind::Deposits,
                "/api/v5/asset/deposit-history",
                "depId",
                window,
                normalize_deposits,
            )
            .await,
            self.fetch_funding_history(
                RecordKind::Withdrawals,
                "/api/v5/asset/withdrawal-history",
                "wdId",
                window,
                normalize_withdrawals,
            )
            .await,
            self.fetch_trade_history(window).await,
        ]
    }
}

fn okx_prehash(timestamp: &str, request_path: &str) -> String {
    // timestamp + method + requestPath + body, empty body for GET.
    format!("{}GET{}", timestamp, request_path)
}

fn plain_query(params: &[(String, String)]) -> String {
    params
        .iter()
        .map(|(k, v)| format!("{}={}", k, urlencoding::encode(v)))
        .collect::<Vec<_>>()
        .join("&")
}

fn add_balance(
    assets: &mut HashMap<(String, String), Decimal>,
    item: &Value,
    amount_key: &str,
    account_type: &str,
) {
    let ticker = item["ccy"].as_str().unwrap_or_default();
    if ticker.is_empty() {
        return;
    }
    let amount = item[amount_key]
        .as_str()
        .and_then(|s| s.parse::<Decimal>().ok())
        .unwrap_or_default();
    if amount > Decimal::ZERO {
        *assets
            .entry((ticker.to_string(), account_type.to_string()))
            .or_insert(Decimal::ZERO) += amount;
    }
}

#[derive(Debug, Deserialize)]
struct RawDeposit {
    #[serde(rename = "depId")]
    dep_id: String,
    ccy: String,
    #[serde(deserialize_with = "de_decimal_flexible")]
    amt: Decimal,
    state: String,
    #[serde(deserialize_with = "de_i64_flexible")]
    ts: i64,
}

#[derive(Debug, Deserialize)]
struct RawWithdrawal {
    #[serde(rename = "wdId")]
    wd_id: String,
    ccy: String,
    #[serde(deserialize_with = "de_decimal_flexible")]
    amt: Decimal,
    state: String,
    #[serde(deserialize_with = "de_i64_flexible")]
    ts: i64,
    #[serde(default, deserialize_with = "de_decimal_flexible")]
    fee: Decimal,
}

#[derive(Debug, Deserialize)]
struct RawTrade {
    #[serde(rename = "tradeId")]
    trade_id: String,
    #[serde(rename = "instId")]
    inst_id: String,
    side: String,
    #[serde(deserialize_with = "de_i64_flexible")]
    ts: i64,
    #[serde(rename = "fillSz", deserialize_with = "de_decimal_flexible")]
    fill_sz: Decimal,
    #[serde(rename = "fillPx", deserialize_with = "de_decimal_flexible")]
    fill_px: Decimal,
    #[serde(default, deserialize_with = "de_decimal_flexible")]
    fee: Decimal,
    #[serde(rename = "feeCcy", default)]
    fee_ccy: Option<String>,
}

fn normalize_deposits(records: &[Value]) -> Result<Vec<NormalizedTransaction>, ExchangeError> {
    let mut txs = Vec::new();
    for record in records {
        let raw: RawDeposit = serde_json::from_value(record.clone())?;
        // State 2 is a completed deposit.
        if raw.state != "2" {
            continue;
        }
        txs.push(NormalizedTransaction::new(
            format!("okx_deposit_{}", raw.dep_id),
            normalize_exchange_timestamp(raw.ts),
            TransactionKind::Deposit,
            "Deposit",
            raw.ccy,
            raw.amt,
        ));
    }
    Ok(txs)
}

fn normalize_withdrawals(records: &[Value]) -> Result<Vec<NormalizedTransaction>, ExchangeError> {
    let mut txs = Vec::new();
    for record in records {
        let raw: RawWithdrawal = serde_json::from_value(record.clone())?;
        if raw.state != "2" {
            continue;
        }
        let mut tx = NormalizedTransaction::new(
            format!("okx_withdrawal_{}", raw.wd_id),
            normalize_exchange_timestamp(raw.ts),
            TransactionKind::Withdrawal,
            "Withdrawal",
            raw.ccy.clone(),
            raw.amt,
        );
        tx.fee_amount = Some(raw.fee.abs());
        tx.fee_currency = Some(raw.ccy);
        txs.push(tx);
    }
    Ok(txs)
}

fn normalize_trades(records: &[Value]) -> Result<Vec<NormalizedTransaction>, ExchangeError> {
    let mut txs = Vec::new();
    for record in records {
        let raw: RawTrade = serde_json::from_value(record.clone())?;
        let Some((base, quote)) = split_dashed_symbol(&raw.inst_id) else {
            debug!("Skipping OKX trade with unknown instId '{}'", raw.inst_id);
            continue;
        };
        let kind = match raw.side.to_lowercase().as_str() {
            "buy" => TransactionKind::Buy,
            "sell" => TransactionKind::Sell,
            other => {
                warn!("Skipping OKX trade with unknown side '{}'", other);
                continue;
            }
        };
        let mut tx = NormalizedTransaction::new(
            format!("okx_trade_{}", raw.trade_id),
            normalize_exchange_timestamp(raw.ts),
            kind,
            format!("Spot Trade ({})", raw.side.to_uppercase()),
            base,
            raw.fill_sz,
        );
        tx.asset2_ticker = Some(quote);
        // OKX fills report size and price only; the quote leg is derived.
        tx.asset2_amount = Some(raw.fill_sz * raw.fill_px);
        tx.execution_price = Some(raw.fill_px);
        tx.fee_amount = Some(raw.fee.abs());
        tx.fee_currency = raw.fee_ccy;
        txs.push(tx);
    }
    Ok(txs)
}
