use chrono::{DateTime, NaiveDate, Timelike, Utc};
use serde::Serialize;

/// Raw-table fields the hourly rollup reads. Columns added later by schema
/// evolution do not participate.
#[derive(Debug, Clone)]
pub struct RawPriceRow {
    pub symbol: String,
    pub price: f64,
    pub event_ts: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct HourlyPrice {
    pub symbol: String,
    pub price: f64,
    pub price_ts: DateTime<Utc>,
    pub price_date: NaiveDate,
    pub price_hour: u32,
    pub source: String,
}

/// Rows without an event timestamp are kept out of the clean table.
pub fn derive_hourly(row: &RawPriceRow, source_label: &str) -> Option<HourlyPrice> {
    let price_ts = row.event_ts?;
    Some(HourlyPrice {
        symbol: row.symbol.clone(),
        price: row.price,
        price_ts,
        price_date: price_ts.date_naive(),
        price_hour: price_ts.hour(),
        source: source_label.to_string(),
    })
}

/// Distinct projection of the raw snapshot, ordered by (symbol, price_ts,
/// price) so repeated runs over an unchanged snapshot produce identical rows.
pub fn build_hourly_rollup(rows: &[RawPriceRow], source_label: &str) -> Vec<HourlyPrice> {
    let mut clean: Vec<HourlyPrice> = rows
        .iter()
        .filter_map(|row| derive_hourly(row, source_label))
        .collect();
    clean.sort_by(|a, b| {
        a.symbol
            .cmp(&b.symbol)
            .then(a.price_ts.cmp(&b.price_ts))
            .then(a.price.total_cmp(&b.price))
    });
    clean.dedup();
    clean
}

#[cfg(test)]
mod tests {
    use super::{build_hourly_rollup, RawPriceRow};
    use chrono::{TimeZone, Utc};

    fn row(symbol: &str, price: f64, ts: Option<(u32, u32)>) -> RawPriceRow {
        RawPriceRow {
            symbol: symbol.to_string(),
            price,
            event_ts: ts.map(|(hour, minute)| {
                Utc.with_ymd_and_hms(2024, 5, 10, hour, minute, 0).unwrap()
            }),
        }
    }

    #[test]
    fn collapses_exact_duplicates() {
        let rows = vec![
            row("BTC", 42000.0, Some((10, 5))),
            row("BTC", 42000.0, Some((10, 5))),
        ];
        let clean = build_hourly_rollup(&rows, "coingecko");
        assert_eq!(clean.len(), 1);
        assert_eq!(clean[0].symbol, "BTC");
        assert_eq!(clean[0].price_hour, 10);
    }

    #[test]
    fn keeps_same_symbol_at_different_timestamps() {
        let rows = vec![
            row("BTC", 42000.0, Some((10, 5))),
            row("BTC", 42000.0, Some((10, 10))),
        ];
        let clean = build_hourly_rollup(&rows, "coingecko");
        assert_eq!(clean.len(), 2);
    }

    #[test]
    fn drops_rows_without_event_timestamp() {
        let rows = vec![
            row("BTC", 42000.0, Some((10, 5))),
            row("OLD", 1.0, None),
        ];
        let clean = build_hourly_rollup(&rows, "coingecko");
        assert_eq!(clean.len(), 1);
        assert_eq!(clean[0].symbol, "BTC");
    }

    #[test]
    fn derives_date_and_hour_from_event_timestamp() {
        let rows = vec![row("ETH", 2000.0, Some((23, 59)))];
        let clean = build_hourly_rollup(&rows, "coingecko");
        assert_eq!(clean[0].price_date.to_string(), "2024-05-10");
        assert_eq!(clean[0].price_hour, 23);
        assert_eq!(clean[0].source, "coingecko");
    }

    #[test]
    fn rebuild_of_unchanged_snapshot_is_identical() {
        let rows = vec![
            row("ETH", 2000.0, Some((3, 0))),
            row("BTC", 42000.0, Some((10, 5))),
            row("BTC", 42000.0, Some((10, 5))),
            row("OLD", 1.0, None),
        ];
        let first = build_hourly_rollup(&rows, "coingecko");
        let second = build_hourly_rollup(&rows, "coingecko");
        assert_eq!(first, second);
    }

    #[test]
    fn output_is_sorted_by_symbol_then_timestamp() {
        let rows = vec![
            row("ETH", 2000.0, Some((3, 0))),
            row("BTC", 42000.0, Some((10, 5))),
            row("BTC", 41000.0, Some((9, 0))),
        ];
        let clean = build_hourly_rollup(&rows, "coingecko");
        let symbols: Vec<&str> = clean.iter().map(|p| p.symbol.as_str()).collect();
        assert_eq!(symbols, vec!["BTC", "BTC", "ETH"]);
        assert!(clean[0].price_ts < clean[1].price_ts);
    }
}
