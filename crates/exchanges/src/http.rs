use log::debug;
use reqwest::header::{HeaderMap, HeaderName, HeaderValue};
use reqwest::{Client, Method, StatusCode};
use serde_json::Value;
use std::time::Duration as StdDuration;
use tokio::time::sleep;

use crate::errors::ExchangeError;

const MAX_RATE_LIMIT_RETRIES: u32 = 5;
const INITIAL_RETRY_DELAY_MS: u64 = 5000;

/// Shared HTTP client for all connectors. Retries 429 responses with a
/// doubling delay (5s, 10s, 20s, 40s, 80s) and surfaces every other failed
/// status as a terminal error. Transport errors are never retried.
#[derive(Clone)]
pub struct RateLimitedHttpClient {
    client: Client,
}

impl Default for RateLimitedHttpClient {
    fn default() -> Self {
        Self::new()
    }
}

impl RateLimitedHttpClient {
    pub fn new() -> Self {
        Self {
            client: Client::new(),
        }
    }

    /// Performs a signed GET. Headers arrive pre-computed because each
    /// exchange signs over the exact URL it sends.
    pub async fn get_json(
        &self,
        url: &str,
        headers: &[(&str, String)],
    ) -> Result<Value, ExchangeError> {
        self.request_json(Method::GET, url, headers).await
    }

    async fn request_json(
        &self,
        method: Method,
        url: &str,
        headers: &[(&str, String)],
    ) -> Result<Value, ExchangeError> {
        let header_map = build_header_map(headers)?;
        let mut retries = 0;
        let mut delay_ms = INITIAL_RETRY_DELAY_MS;
        loop {
            debug!("{} {}", method, redact_url(url));
            let resp = self
                .client
                .request(method.clone(), url)
                .headers(header_map.clone())
                .send()
                .await
                .map_err(|e| ExchangeError::Network(e.to_string()))?;

            if resp.status() == StatusCode::TOO_MANY_REQUESTS {
                if retries >= MAX_RATE_LIMIT_RETRIES {
                    return Err(ExchangeError::RateLimited(format!(
                        "Too many 429s for {}; giving up",
                        redact_url(url)
                    )));
                }
                debug!("429 received; retrying in {}ms", delay_ms);
                sleep(StdDuration::from_millis(delay_ms)).await;
                delay_ms *= 2;
                retries += 1;
                continue;
            }

            let status = resp.status();
            let body = resp
                .text()
                .await
                .map_err(|e| ExchangeError::Network(e.to_string()))?;
            if status == StatusCode::UNAUTHORIZED || status == StatusCode::FORBIDDEN {
                return Err(ExchangeError::Auth(format!("HTTP {}: {}", status, body)));
            }
            if !status.is_success() {
                return Err(ExchangeError::Api {
                    status: status.as_u16(),
                    body,
                });
            }
            return serde_json::from_str(&body).map_err(|e| {
                ExchangeError::InvalidResponse(format!("JSON parse failed: {}", e))
            });
        }
    }
}

fn build_header_map(headers: &[(&str, String)]) -> Result<HeaderMap, ExchangeError> {
    let mut map = HeaderMap::with_capacity(headers.len());
    for (name, value) in headers {
        let name = HeaderName::from_bytes(name.as_bytes())
            .map_err(|e| ExchangeError::InvalidResponse(format!("Bad header name: {}", e)))?;
        let value = HeaderValue::from_str(value)
            .map_err(|e| ExchangeError::InvalidResponse(format!("Bad header value: {}", e)))?;
        map.insert(name, value);
    }
    Ok(map)
}

/// Trims query-string credentials before logging. BingX carries the API key
/// and signature in the URL itself.
fn redact_url(url: &str) -> String {
    match url.split_once('?') {
        Some((base, query)) => {
            let redacted: Vec<String> = query
                .split('&')
                .map(|pair| match pair.split_once('=') {
                    Some((k, v))
                        if matches!(k, "signature" | "sign" | "apiKey" | "api_key") =>
                    {
                        let shown: String = v.chars().take(5).collect();
                        format!("{}={}…", k, shown)
                    }
                    _ => pair.to_string(),
                })
                .collect();
            format!("{}?{}", base, redacted.join("&"))
        }
        None => url.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_redact_url_hides_credentials() {
        let url = "https://open-api.bingx.com/openApi/spot/v1/fills?symbol=BTC-USDT&apiKey=abcdefgh&timestamp=1&signature=deadbeefcafe";
        let redacted = redact_url(url);
        assert!(redacted.contains("symbol=BTC-USDT"));
        assert!(redacted.contains("apiKey=abcde…"));
        assert!(redacted.contains("signature=deadb…"));
        assert!(!redacted.contains("abcdefgh"));
    }

    #[test]
    fn test_redact_url_survives_multibyte_values() {
        let url = "https://example.com/path?apiKey=ключдлинный&symbol=BTC";
        let redacted = redact_url(url);
        assert!(redacted.contains("apiKey=ключд…"));
        assert!(!redacted.contains("длинный"));
    }

    #[test]
    fn test_redact_url_without_query() {
        assert_eq!(
            redact_url("https://api.bybit.com/v5/market/time"),
            "https://api.bybit.com/v5/market/time"
        );
    }
}
