use chrono::{DateTime, Datelike, TimeZone, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Deserializer};
use std::str::FromStr;

/// Quote currencies recognized when splitting concatenated pair symbols,
/// checked in this order so "ETHUSDT" resolves to ("ETH", "USDT").
pub const KNOWN_QUOTE_CURRENCIES: [&str; 7] =
    ["USDT", "USDC", "BTC", "ETH", "BUSD", "TUSD", "DAI"];

/// Interprets a raw exchange timestamp, which may be in milliseconds or
/// seconds depending on the endpoint. Milliseconds are assumed first; if
/// that lands before the year 2000 while the raw value is plausible as
/// seconds, it is reinterpreted as seconds. Unrepresentable values fall
/// back to the Unix epoch.
pub fn normalize_exchange_timestamp(raw: i64) -> DateTime<Utc> {
    let as_millis = Utc.timestamp_millis_opt(raw).single();
    if let Some(dt) = as_millis {
        if dt.year() >= 2000 {
            return dt;
        }
        if raw > 1_000_000_000 {
            if let Some(dt) = Utc.timestamp_opt(raw, 0).single() {
                return dt;
            }
        }
        return dt;
    }
    log::error!("Unparseable exchange timestamp '{}', defaulting to epoch", raw);
    Utc.timestamp_opt(0, 0).single().unwrap_or_default()
}

/// Splits a concatenated pair symbol like "ETHUSDT" on a known quote
/// currency suffix. Returns None when no suffix matches or the base would
/// be empty, in which case the record should be skipped.
pub fn split_concat_symbol(symbol: &str) -> Option<(String, String)> {
    for quote in KNOWN_QUOTE_CURRENCIES {
        if let Some(base) = symbol.strip_suffix(quote) {
            if !base.is_empty() {
                return Some((base.to_string(), quote.to_string()));
            }
        }
    }
    None
}

/// Splits a dash-delimited pair symbol like "ETH-USDT".
pub fn split_dashed_symbol(symbol: &str) -> Option<(String, String)> {
    let (base, quote) = symbol.split_once('-')?;
    if base.is_empty() || quote.is_empty() {
        return None;
    }
    Some((base.to_string(), quote.to_string()))
}

/// Deserializes an integer field that exchanges serve inconsistently as
/// either a JSON number or a numeric string.
pub fn de_i64_flexible<'de, D>(deserializer: D) -> Result<i64, D::Error>
where
    D: Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Raw {
        Int(i64),
        Float(f64),
        Str(String),
    }

    match Raw::deserialize(deserializer)? {
        Raw::Int(v) => Ok(v),
        Raw::Float(v) => Ok(v as i64),
        Raw::Str(s) => s
            .trim()
            .parse::<i64>()
            .or_else(|_| s.trim().parse::<f64>().map(|f| f as i64))
            .map_err(serde::de::Error::custom),
    }
}

/// Deserializes a decimal field served as either a JSON number or string.
/// Empty strings decode as zero, matching how exchanges omit fees.
pub fn de_decimal_flexible<'de, D>(deserializer: D) -> Result<Decimal, D::Error>
where
    D: Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Raw {
        Num(f64),
        Str(String),
    }

    match Raw::deserialize(deserializer)? {
        Raw::Num(v) => Decimal::try_from(v).map_err(serde::de::Error::custom),
        Raw::Str(s) => {
            let trimmed = s.trim();
            if trimmed.is_empty() {
                return Ok(Decimal::ZERO);
            }
            Decimal::from_str(trimmed).map_err(serde::de::Error::custom)
        }
    }
}

/// Deserializes an identifier served as either a JSON string or number.
pub fn de_string_flexible<'de, D>(deserializer: D) -> Result<String, D::Error>
where
    D: Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Raw {
        Str(String),
        Int(i64),
        Uint(u64),
    }

    Ok(match Raw::deserialize(deserializer)? {
        Raw::Str(s) => s,
        Raw::Int(v) => v.to_string(),
        Raw::Uint(v) => v.to_string(),
    })
}

/// Optional variant of [`de_decimal_flexible`]; missing, null, and empty
/// values all decode as None.
pub fn de_opt_decimal_flexible<'de, D>(deserializer: D) -> Result<Option<Decimal>, D::Error>
where
    D: Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Raw {
        Num(f64),
        Str(String),
        None,
    }

    match Option::<Raw>::deserialize(deserializer)? {
        None | Some(Raw::None) => Ok(None),
        Some(Raw::Num(v)) => Decimal::try_from(v)
            .map(Some)
            .map_err(serde::de::Error::custom),
        Some(Raw::Str(s)) => {
            let trimmed = s.trim();
            if trimmed.is_empty() {
                return Ok(None);
            }
            Decimal::from_str(trimmed)
                .map(Some)
                .map_err(serde::de::Error::custom)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Timelike;

    #[test]
    fn test_timestamp_millis_passthrough() {
        let dt = normalize_exchange_timestamp(1_700_000_000_000);
        assert_eq!(dt.year(), 2023);
    }

    #[test]
    fn test_timestamp_seconds_reinterpreted() {
        // 1_700_000_000 as milliseconds would be 1970; as seconds it is 2023.
        let dt = normalize_exchange_timestamp(1_700_000_000);
        assert_eq!(dt.year(), 2023);
        assert_eq!(dt.hour(), normalize_exchange_timestamp(1_700_000_000_000).hour());
    }

    #[test]
    fn test_timestamp_small_value_stays_millis() {
        // Too small to be a plausible seconds timestamp.
        let dt = normalize_exchange_timestamp(500);
        assert_eq!(dt.year(), 1970);
    }

    #[test]
    fn test_split_concat_symbol() {
        assert_eq!(
            split_concat_symbol("ETHUSDT"),
            Some(("ETH".to_string(), "USDT".to_string()))
        );
        assert_eq!(
            split_concat_symbol("SOLBTC"),
            Some(("SOL".to_string(), "BTC".to_string()))
        );
        assert_eq!(split_concat_symbol("FOOBAR"), None);
        // Base must not be empty.
        assert_eq!(split_concat_symbol("USDT"), None);
    }

    #[test]
    fn test_split_dashed_symbol() {
        assert_eq!(
            split_dashed_symbol("ETH-USDT"),
            Some(("ETH".to_string(), "USDT".to_string()))
        );
        assert_eq!(split_dashed_symbol("ETHUSDT"), None);
        assert_eq!(split_dashed_symbol("-USDT"), None);
    }

    #[test]
    fn test_de_decimal_flexible_variants() {
        #[derive(Deserialize)]
        struct Row {
            #[serde(deserialize_with = "de_decimal_flexible")]
            v: Decimal,
        }

        let from_str: Row = serde_json::from_str(r#"{"v": "1.25"}"#).unwrap();
        assert_eq!(from_str.v, Decimal::from_str("1.25").unwrap());
        let from_num: Row = serde_json::from_str(r#"{"v": 2.5}"#).unwrap();
        assert_eq!(from_num.v, Decimal::from_str("2.5").unwrap());
        let empty: Row = serde_json::from_str(r#"{"v": ""}"#).unwrap();
        assert_eq!(empty.v, Decimal::ZERO);
    }

    #[test]
    fn test_de_i64_flexible_variants() {
        #[derive(Deserialize)]
        struct Row {
            #[serde(deserialize_with = "de_i64_flexible")]
            v: i64,
        }

        let from_str: Row = serde_json::from_str(r#"{"v": "1700000000000"}"#).unwrap();
        assert_eq!(from_str.v, 1_700_000_000_000);
        let from_num: Row = serde_json::from_str(r#"{"v": 1700000000000}"#).unwrap();
        assert_eq!(from_num.v, 1_700_000_000_000);
    }
}
