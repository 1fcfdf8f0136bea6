use chrono::{TimeZone, Utc};
use proptest::prelude::*;
use siphon_domain::services::rollup::{build_hourly_rollup, RawPriceRow};
use siphon_domain::services::staging::{build_price_records, staging_key, to_ndjson};

fn asset_id() -> impl Strategy<Value = String> {
    "[a-z][a-z0-9-]{0,14}"
}

fn price_map(
    ids: &[String],
    prices: &[f64],
) -> serde_json::Map<String, serde_json::Value> {
    let mut map = serde_json::Map::new();
    for (id, usd) in ids.iter().zip(prices) {
        map.insert(id.clone(), serde_json::json!({ "usd": usd }));
    }
    map
}

proptest! {
    #![proptest_config(ProptestConfig {
        cases: 64,
        .. ProptestConfig::default()
    })]

    #[test]
    fn staged_batch_has_one_line_per_asset(
        ids in prop::collection::hash_set(asset_id(), 1..20),
        seed in 0.0001f64..1_000_000.0,
    ) {
        let ids: Vec<String> = ids.into_iter().collect();
        let prices: Vec<f64> = (0..ids.len()).map(|i| seed + i as f64).collect();
        let fetched_at = Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap();

        let records = build_price_records(&ids, &price_map(&ids, &prices), fetched_at).unwrap();
        prop_assert_eq!(records.len(), ids.len());

        let body = to_ndjson(&records).unwrap();
        prop_assert_eq!(body.lines().count(), ids.len());
        for (line, record) in body.lines().zip(&records) {
            let value: serde_json::Value = serde_json::from_str(line).unwrap();
            prop_assert_eq!(value["symbol"].as_str().unwrap(), record.symbol.as_str());
            prop_assert!(value["event_ts"].as_str().is_some());
        }
    }

    #[test]
    fn symbols_are_uppercased_ids(
        ids in prop::collection::hash_set(asset_id(), 1..20),
    ) {
        let ids: Vec<String> = ids.into_iter().collect();
        let prices: Vec<f64> = vec![1.0; ids.len()];
        let fetched_at = Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap();

        let records = build_price_records(&ids, &price_map(&ids, &prices), fetched_at).unwrap();
        for (record, id) in records.iter().zip(&ids) {
            prop_assert_eq!(record.symbol.clone(), id.to_uppercase());
        }
    }

    #[test]
    fn staging_keys_differ_across_seconds(
        offset_secs in 1i64..86_400,
    ) {
        let first = Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap();
        let later = first + chrono::Duration::seconds(offset_secs);
        prop_assert_ne!(staging_key("crypto_raw", first), staging_key("crypto_raw", later));
    }

    #[test]
    fn rollup_never_grows_and_never_repeats(
        timestamps in prop::collection::vec(0i64..1_000_000, 0..60),
        dup_every in 1usize..5,
    ) {
        let rows: Vec<RawPriceRow> = timestamps
            .iter()
            .enumerate()
            .map(|(idx, ts)| RawPriceRow {
                symbol: if idx % 2 == 0 { "BTC".to_string() } else { "ETH".to_string() },
                price: 100.0 + (idx / dup_every) as f64,
                event_ts: Some(Utc.timestamp_opt(*ts, 0).unwrap()),
            })
            .collect();

        let clean = build_hourly_rollup(&rows, "coingecko");
        prop_assert!(clean.len() <= rows.len());
        for pair in clean.windows(2) {
            prop_assert_ne!(&pair[0], &pair[1]);
        }
    }

    #[test]
    fn rollup_is_stable_under_input_shuffling(
        timestamps in prop::collection::vec(0i64..1_000_000, 1..40),
    ) {
        let rows: Vec<RawPriceRow> = timestamps
            .iter()
            .map(|ts| RawPriceRow {
                symbol: "BTC".to_string(),
                price: 42_000.0,
                event_ts: Some(Utc.timestamp_opt(*ts, 0).unwrap()),
            })
            .collect();
        let mut reversed = rows.clone();
        reversed.reverse();

        prop_assert_eq!(
            build_hourly_rollup(&rows, "coingecko"),
            build_hourly_rollup(&reversed, "coingecko")
        );
    }

    #[test]
    fn rollup_hour_matches_timestamp_hour(
        ts in 0i64..2_000_000_000,
    ) {
        let event_ts = Utc.timestamp_opt(ts, 0).unwrap();
        let rows = vec![RawPriceRow {
            symbol: "BTC".to_string(),
            price: 1.0,
            event_ts: Some(event_ts),
        }];
        let clean = build_hourly_rollup(&rows, "coingecko");
        prop_assert_eq!(clean.len(), 1);
        prop_assert_eq!(clean[0].price_date, event_ts.date_naive());
        prop_assert!(clean[0].price_hour < 24);
    }
}
