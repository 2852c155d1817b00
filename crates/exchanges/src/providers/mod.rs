use base64::{engine::general_purpose::STANDARD as BASE64, Engine as _};
use hmac::{Hmac, Mac};
use sha2::Sha256;

use crate::errors::ExchangeError;

mod bingx;
mod bitget;
mod bybit;
mod kucoin;
mod okx;

pub use bingx::BingxConnector;
pub use bitget::BitgetConnector;
pub use bybit::BybitConnector;
pub use kucoin::KucoinConnector;
pub use okx::OkxConnector;

type HmacSha256 = Hmac<Sha256>;

pub(crate) fn hmac_sha256(secret: &str, payload: &str) -> Result<Vec<u8>, ExchangeError> {
    let mut mac = HmacSha256::new_from_slice(secret.as_bytes())
        .map_err(|e| ExchangeError::Auth(format!("Invalid HMAC secret length: {}", e)))?;
    mac.update(payload.as_bytes());
    Ok(mac.finalize().into_bytes().to_vec())
}

pub(crate) fn sign_hex(secret: &str, payload: &str) -> Result<String, ExchangeError> {
    Ok(hex::encode(hmac_sha256(secret, payload)?))
}

pub(crate) fn sign_base64(secret: &str, payload: &str) -> Result<String, ExchangeError> {
    Ok(BASE64.encode(hmac_sha256(secret, payload)?))
}

/// Builds a "k=v&k=v" query string with keys in ascending order, the form
/// every covered exchange signs over.
pub(crate) fn sorted_query(params: &[(String, String)]) -> String {
    let mut sorted: Vec<&(String, String)> = params.iter().collect();
    sorted.sort_by(|a, b| a.0.cmp(&b.0));
    sorted
        .iter()
        .map(|(k, v)| format!("{}={}", k, urlencoding::encode(v)))
        .collect::<Vec<_>>()
        .join("&")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sorted_query_orders_keys() {
        let params = vec![
            ("startTime".to_string(), "100".to_string()),
            ("category".to_string(), "spot".to_string()),
            ("limit".to_string(), "50".to_string()),
        ];
        assert_eq!(
            sorted_query(&params),
            "category=spot&limit=50&startTime=100"
        );
    }

    #[test]
    fn test_sorted_query_encodes_values() {
        let params = vec![("cursor".to_string(), "a+b/c=".to_string())];
        assert_eq!(sorted_query(&params), "cursor=a%2Bb%2Fc%3D");
    }
}
