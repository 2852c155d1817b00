use std::sync::Arc;

use crate::connector::ExchangeConnector;
use crate::errors::ExchangeError;
use crate::models::ExchangeCredentials;
use crate::providers::{
    BingxConnector, BitgetConnector, BybitConnector, KucoinConnector, OkxConnector,
};

pub const SUPPORTED_EXCHANGES: [&str; 5] = ["bybit", "bitget", "bingx", "kucoin", "okx"];

/// Creates a connector for a named exchange from stored credentials.
pub fn create_connector(
    exchange: &str,
    credentials: ExchangeCredentials,
) -> Result<Arc<dyn ExchangeConnector>, ExchangeError> {
    match exchange.to_lowercase().as_str() {
        "bybit" => Ok(Arc::new(BybitConnector::new(credentials)?)),
        "bitget" => Ok(Arc::new(BitgetConnector::new(credentials)?)),
        "bingx" => Ok(Arc::new(BingxConnector::new(credentials)?)),
        "kucoin" => Ok(Arc::new(KucoinConnector::new(credentials)?)),
        "okx" => Ok(Arc::new(OkxConnector::new(credentials)?)),
        other => Err(ExchangeError::Unsupported(other.to_string())),
    }
}

pub fn is_supported(exchange: &str) -> bool {
    SUPPORTED_EXCHANGES.contains(&exchange.to_lowercase().as_str())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn creds_with_passphrase() -> ExchangeCredentials {
        ExchangeCredentials::new("key", "secret").with_passphrase("phrase")
    }

    #[test]
    fn test_create_connector_for_each_supported_exchange() {
        for exchange in SUPPORTED_EXCHANGES {
            let connector = create_connector(exchange, creds_with_passphrase()).unwrap();
            assert_eq!(connector.exchange_id(), exchange);
        }
    }

    #[test]
    fn test_create_connector_is_case_insensitive() {
        let connector = create_connector("ByBit", creds_with_passphrase()).unwrap();
        assert_eq!(connector.exchange_id(), "bybit");
    }

    #[test]
    fn test_unknown_exchange_is_rejected() {
        let err = create_connector("binance", creds_with_passphrase()).unwrap_err();
        assert!(matches!(err, ExchangeError::Unsupported(_)));
    }

    #[test]
    fn test_passphrase_required_where_applicable() {
        for exchange in ["bitget", "kucoin", "okx"] {
            let err =
                create_connector(exchange, ExchangeCredentials::new("key", "secret")).unwrap_err();
            assert!(matches!(err, ExchangeError::MissingCredentials(_)));
        }
        for exchange in ["bybit", "bingx"] {
            assert!(create_connector(exchange, ExchangeCredentials::new("key", "secret")).is_ok());
        }
    }
}
