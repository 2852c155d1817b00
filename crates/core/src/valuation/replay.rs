use std::collections::HashMap;

use chrono::{Duration, NaiveDate};
use foliosync_exchanges::{DailyPrices, TransactionKind};
use log::warn;
use rust_decimal::Decimal;

use crate::constants::{is_stablecoin, DUST_THRESHOLD, PRICE_LOOKBACK_DAYS};
use crate::transactions::Transaction;
use crate::valuation::PortfolioHistoryRow;

/// Most recent close within the [`PRICE_LOOKBACK_DAYS`]-day window ending at
/// `date` (the date itself plus six days back), bridging exchange downtime
/// and non-trading days.
pub(crate) fn price_on_or_before(prices: &DailyPrices, date: NaiveDate) -> Option<Decimal> {
    let floor = date - Duration::days(PRICE_LOOKBACK_DAYS - 1);
    prices.range(floor..=date).next_back().map(|(_, p)| *p)
}

/// Replays crypto transactions day by day from the first transaction date
/// through `end`, valuing holdings in USDT and converting the daily total
/// with `quote_rate`. Transactions must be sorted oldest first.
pub(crate) fn replay_crypto_history(
    transactions: &[Transaction],
    prices: &HashMap<String, DailyPrices>,
    quote_rate: Decimal,
    end: NaiveDate,
) -> Vec<PortfolioHistoryRow> {
    let Some(first) = transactions.first() else {
        return Vec::new();
    };

    let mut holdings: HashMap<String, Decimal> = HashMap::new();
    let mut rows = Vec::new();
    let mut idx = 0;
    let mut day = first.timestamp.date_naive();
    while day <= end {
        while idx < transactions.len() && transactions[idx].timestamp.date_naive() <= day {
            apply_crypto_transaction(&mut holdings, &transactions[idx]);
            idx += 1;
        }

        let mut total = Decimal::ZERO;
        for (ticker, quantity) in &holdings {
            if *quantity <= DUST_THRESHOLD {
                continue;
            }
            if is_stablecoin(ticker) {
                total += quantity;
                continue;
            }
            match prices.get(ticker).and_then(|p| price_on_or_before(p, day)) {
                Some(price) => total += quantity * price,
                None => warn!("No price for {ticker} on {day}, omitting from total"),
            }
        }
        rows.push(PortfolioHistoryRow {
            date: day,
            total_value: total * quote_rate,
        });

        let Some(next) = day.succ_opt() else { break };
        day = next;
    }
    rows
}

fn apply_crypto_transaction(holdings: &mut HashMap<String, Decimal>, tx: &Transaction) {
    match tx.kind {
        TransactionKind::Buy => {
            *holdings.entry(tx.asset1_ticker.clone()).or_default() += tx.asset1_amount;
            if let (Some(ticker), Some(amount)) = (&tx.asset2_ticker, tx.asset2_amount) {
                *holdings.entry(ticker.clone()).or_default() -= amount;
            }
        }
        TransactionKind::Sell | TransactionKind::Exchange => {
            *holdings.entry(tx.asset1_ticker.clone()).or_default() -= tx.asset1_amount;
            if let (Some(ticker), Some(amount)) = (&tx.asset2_ticker, tx.asset2_amount) {
                *holdings.entry(ticker.clone()).or_default() += amount;
            }
        }
        TransactionKind::Deposit | TransactionKind::Transfer => {
            *holdings.entry(tx.asset1_ticker.clone()).or_default() += tx.asset1_amount;
        }
        TransactionKind::Withdrawal => {
            *holdings.entry(tx.asset1_ticker.clone()).or_default() -= tx.asset1_amount;
        }
    }
}

/// Replays securities transactions. Positions track `asset1_ticker` only,
/// buys add and everything else subtracts, and closes are already quoted in
/// the reporting currency so no rate applies.
pub(crate) fn replay_securities_history(
    transactions: &[Transaction],
    prices: &HashMap<String, DailyPrices>,
    end: NaiveDate,
) -> Vec<PortfolioHistoryRow> {
    let Some(first) = transactions.first() else {
        return Vec::new();
    };

    let mut holdings: HashMap<String, Decimal> = HashMap::new();
    let mut rows = Vec::new();
    let mut idx = 0;
    let mut day = first.timestamp.date_naive();
    while day <= end {
        while idx < transactions.len() && transactions[idx].timestamp.date_naive() <= day {
            let tx = &transactions[idx];
            let entry = holdings.entry(tx.asset1_ticker.clone()).or_default();
            if tx.kind == TransactionKind::Buy {
                *entry += tx.asset1_amount;
            } else {
                *entry -= tx.asset1_amount;
            }
            idx += 1;
        }

        let mut total = Decimal::ZERO;
        for (ticker, quantity) in &holdings {
            if *quantity <= Decimal::ZERO {
                continue;
            }
            match prices.get(ticker).and_then(|p| price_on_or_before(p, day)) {
                Some(price) => total += quantity * price,
                None => warn!("No price for {ticker} on {day}, omitting from total"),
            }
        }
        rows.push(PortfolioHistoryRow {
            date: day,
            total_value: total,
        });

        let Some(next) = day.succ_opt() else { break };
        day = next;
    }
    rows
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{TimeZone, Utc};
    use rust_decimal_macros::dec;

    fn date(y: i32, m: u32, d: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(y, m, d).unwrap()
    }

    fn tx(
        id: i64,
        day: NaiveDate,
        kind: TransactionKind,
        asset1: &str,
        amount1: Decimal,
        asset2: Option<(&str, Decimal)>,
    ) -> Transaction {
        Transaction {
            id,
            platform_id: 1,
            exchange_tx_id: format!("tx_{id}"),
            timestamp: Utc
                .from_utc_datetime(&day.and_hms_opt(12, 0, 0).unwrap()),
            kind,
            raw_kind: kind.as_str().to_string(),
            asset1_ticker: asset1.to_string(),
            asset1_amount: amount1,
            asset2_ticker: asset2.map(|(t, _)| t.to_string()),
            asset2_amount: asset2.map(|(_, a)| a),
            fee_amount: None,
            fee_currency: None,
            execution_price: None,
            description: None,
        }
    }

    fn daily(prices: &[(NaiveDate, Decimal)]) -> DailyPrices {
        prices.iter().cloned().collect()
    }

    #[test]
    fn price_lookup_falls_back_within_the_window() {
        let prices = daily(&[(date(2024, 1, 1), dec!(100))]);
        assert_eq!(price_on_or_before(&prices, date(2024, 1, 1)), Some(dec!(100)));
        // Six days back is the furthest the fallback reaches.
        assert_eq!(price_on_or_before(&prices, date(2024, 1, 7)), Some(dec!(100)));
        assert_eq!(price_on_or_before(&prices, date(2024, 1, 8)), None);
        assert_eq!(price_on_or_before(&prices, date(2023, 12, 31)), None);
    }

    #[test]
    fn crypto_replay_tracks_buy_then_sell() {
        let transactions = vec![
            tx(1, date(2024, 1, 1), TransactionKind::Deposit, "USDT", dec!(1000), None),
            tx(
                2,
                date(2024, 1, 2),
                TransactionKind::Buy,
                "BTC",
                dec!(0.01),
                Some(("USDT", dec!(500))),
            ),
            tx(
                3,
                date(2024, 1, 4),
                TransactionKind::Sell,
                "BTC",
                dec!(0.01),
                Some(("USDT", dec!(600))),
            ),
        ];
        let prices: HashMap<String, DailyPrices> = [(
            "BTC".to_string(),
            daily(&[
                (date(2024, 1, 2), dec!(50000)),
                (date(2024, 1, 3), dec!(55000)),
                (date(2024, 1, 4), dec!(60000)),
            ]),
        )]
        .into_iter()
        .collect();

        let rows = replay_crypto_history(&transactions, &prices, Decimal::ONE, date(2024, 1, 4));
        assert_eq!(rows.len(), 4);
        assert_eq!(rows[0].total_value, dec!(1000));
        assert_eq!(rows[1].total_value, dec!(500) + dec!(0.01) * dec!(50000));
        assert_eq!(rows[2].total_value, dec!(500) + dec!(0.01) * dec!(55000));
        assert_eq!(rows[3].total_value, dec!(1100));
    }

    #[test]
    fn crypto_replay_applies_quote_rate() {
        let transactions = vec![tx(
            1,
            date(2024, 3, 1),
            TransactionKind::Deposit,
            "USDT",
            dec!(100),
            None,
        )];
        let rows =
            replay_crypto_history(&transactions, &HashMap::new(), dec!(90), date(2024, 3, 1));
        assert_eq!(rows, vec![PortfolioHistoryRow {
            date: date(2024, 3, 1),
            total_value: dec!(9000),
        }]);
    }

    #[test]
    fn crypto_replay_ignores_dust_and_unpriced_positions() {
        let transactions = vec![
            tx(1, date(2024, 1, 1), TransactionKind::Deposit, "BTC", dec!(0.0000005), None),
            tx(2, date(2024, 1, 1), TransactionKind::Deposit, "XYZ", dec!(10), None),
            tx(3, date(2024, 1, 1), TransactionKind::Deposit, "USDT", dec!(42), None),
        ];
        // No prices at all: dust is skipped, XYZ is warned about and omitted,
        // the stablecoin still counts.
        let rows =
            replay_crypto_history(&transactions, &HashMap::new(), Decimal::ONE, date(2024, 1, 1));
        assert_eq!(rows[0].total_value, dec!(42));
    }

    #[test]
    fn crypto_replay_covers_days_without_transactions() {
        let transactions = vec![tx(
            1,
            date(2024, 1, 1),
            TransactionKind::Deposit,
            "USDT",
            dec!(10),
            None,
        )];
        let rows =
            replay_crypto_history(&transactions, &HashMap::new(), Decimal::ONE, date(2024, 1, 5));
        assert_eq!(rows.len(), 5);
        assert!(rows.iter().all(|r| r.total_value == dec!(10)));
    }

    #[test]
    fn securities_replay_subtracts_non_buys() {
        let transactions = vec![
            tx(1, date(2024, 2, 1), TransactionKind::Buy, "SBER", dec!(10), None),
            tx(2, date(2024, 2, 3), TransactionKind::Sell, "SBER", dec!(4), None),
        ];
        let prices: HashMap<String, DailyPrices> = [(
            "SBER".to_string(),
            daily(&[(date(2024, 2, 1), dec!(250))]),
        )]
        .into_iter()
        .collect();

        let rows = replay_securities_history(&transactions, &prices, date(2024, 2, 3));
        assert_eq!(rows[0].total_value, dec!(2500));
        assert_eq!(rows[1].total_value, dec!(2500));
        assert_eq!(rows[2].total_value, dec!(1500));
    }

    #[test]
    fn replay_is_deterministic_over_fixed_inputs() {
        let transactions = vec![
            tx(1, date(2024, 1, 1), TransactionKind::Deposit, "USDT", dec!(50000), None),
            tx(
                2,
                date(2024, 1, 1),
                TransactionKind::Buy,
                "BTC",
                dec!(1),
                Some(("USDT", dec!(50000))),
            ),
            tx(
                3,
                date(2024, 1, 10),
                TransactionKind::Sell,
                "BTC",
                dec!(0.5),
                Some(("USDT", dec!(30000))),
            ),
        ];
        let prices: HashMap<String, DailyPrices> = [(
            "BTC".to_string(),
            daily(&[(date(2024, 1, 1), dec!(50000)), (date(2024, 1, 10), dec!(60000))]),
        )]
        .into_iter()
        .collect();

        let first = replay_crypto_history(&transactions, &prices, dec!(90), date(2024, 1, 10));
        let second = replay_crypto_history(&transactions, &prices, dec!(90), date(2024, 1, 10));
        assert_eq!(first, second);

        // Day 10: 0.5 BTC at 60000 plus the 30000 USDT proceeds, at rate 90.
        assert_eq!(
            first.last().unwrap().total_value,
            (dec!(0.5) * dec!(60000) + dec!(30000)) * dec!(90)
        );
    }

    #[test]
    fn empty_replay_produces_no_rows() {
        assert!(replay_crypto_history(&[], &HashMap::new(), Decimal::ONE, date(2024, 1, 1))
            .is_empty());
        assert!(replay_securities_history(&[], &HashMap::new(), date(2024, 1, 1)).is_empty());
    }
}
