use rust_decimal::Decimal;
use rust_decimal_macros::dec;

/// Tickers valued at 1 USDT without a market price lookup.
pub const STABLECOINS: [&str; 3] = ["USDT", "USDC", "DAI"];

/// Account buckets maintained by hand. Balance sync never zeroes these,
/// it only refreshes their price.
pub const MANUAL_ACCOUNT_TYPES: [&str; 4] = ["Manual", "Manual Earn", "Staking", "Lending"];

/// How far back a first-time transaction sync reaches.
pub const DEFAULT_SYNC_DEPTH_DAYS: i64 = 730;

/// Re-scan overlap applied before the stored cursor, so records that landed
/// late around the previous sync boundary are still picked up.
pub const SYNC_OVERLAP_HOURS: i64 = 24;

/// Width of the window the valuation replay searches for the most recent
/// close: the date itself plus `PRICE_LOOKBACK_DAYS - 1` days back.
pub const PRICE_LOOKBACK_DAYS: i64 = 7;

/// Positions at or below this quantity are ignored during valuation.
pub const DUST_THRESHOLD: Decimal = dec!(0.000001);

pub fn is_stablecoin(ticker: &str) -> bool {
    STABLECOINS.contains(&ticker)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stablecoins_are_recognized() {
        assert!(is_stablecoin("USDT"));
        assert!(is_stablecoin("DAI"));
        assert!(!is_stablecoin("BTC"));
    }
}
