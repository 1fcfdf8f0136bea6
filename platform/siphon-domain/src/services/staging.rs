use crate::value_objects::price_record::PriceRecord;
use chrono::{DateTime, SecondsFormat, Utc};

/// Second resolution is enough to keep keys from runs started at different
/// seconds distinct.
pub fn staging_key(prefix: &str, fetched_at: DateTime<Utc>) -> String {
    format!(
        "{}/prices_{}.json",
        prefix.trim_end_matches('/'),
        fetched_at.format("%Y%m%d%H%M%S")
    )
}

pub fn event_timestamp(fetched_at: DateTime<Utc>) -> String {
    fetched_at.to_rfc3339_opts(SecondsFormat::Micros, true)
}

/// One record per listed id, in listing order, all stamped with the same
/// `fetched_at`. An id the price lookup did not return, or a fragment without
/// a numeric `usd` field, fails the whole batch.
pub fn build_price_records(
    ids: &[String],
    prices: &serde_json::Map<String, serde_json::Value>,
    fetched_at: DateTime<Utc>,
) -> Result<Vec<PriceRecord>, String> {
    let event_ts = event_timestamp(fetched_at);
    let mut records = Vec::with_capacity(ids.len());
    for id in ids {
        let fragment = prices
            .get(id)
            .ok_or_else(|| format!("no price returned for asset: {id}"))?;
        let price = fragment
            .get("usd")
            .and_then(|value| value.as_f64())
            .ok_or_else(|| format!("missing usd price for asset: {id}"))?;
        let payload = serde_json::to_string(fragment)
            .map_err(|err| format!("failed to serialize payload for {id}: {err}"))?;
        records.push(PriceRecord {
            symbol: id.to_uppercase(),
            price,
            event_ts: event_ts.clone(),
            payload,
        });
    }
    Ok(records)
}

pub fn to_ndjson(records: &[PriceRecord]) -> Result<String, String> {
    let mut body = String::new();
    for record in records {
        let line = serde_json::to_string(record)
            .map_err(|err| format!("failed to serialize price record: {err}"))?;
        body.push_str(&line);
        body.push('\n');
    }
    Ok(body)
}
