use chrono::{DateTime, Utc};
use rust_decimal::Decimal;

use crate::fetch::{RatesDocument, RawRecord};

/// Fixed-shape coin snapshot row, post-filter. Every field the filters depend
/// on is required; a raw record missing one never reaches this type.
#[derive(Debug, Clone)]
pub struct CoinRecord {
    pub coin_id: String,
    pub symbol: String,
    pub name: String,
    pub current_price: Decimal,
    pub market_cap: Option<f64>,
    pub total_volume: f64,
    pub market_cap_rank: i64,
    pub price_change_percentage_24h: f64,
    pub high_24h: Option<f64>,
    pub low_24h: Option<f64>,
    pub last_updated: DateTime<Utc>,
    pub captured_at: DateTime<Utc>,
}

/// One currency rate row from the forex capture.
#[derive(Debug, Clone)]
pub struct RateRecord {
    pub currency_code: String,
    pub rate: Decimal,
    pub recorded_at: DateTime<Utc>,
}

/// Retention predicates applied during normalization.
#[derive(Debug, Clone)]
pub struct FilterRules {
    /// Records must trade strictly above this 24h volume.
    pub volume_cutoff: f64,
    /// Records must have moved by strictly more than this percentage.
    pub change_noise_floor: f64,
}

impl Default for FilterRules {
    fn default() -> Self {
        Self {
            volume_cutoff: 50_000.0,
            change_noise_floor: 0.05,
        }
    }
}

/// An atomically-loadable unit of coin records sharing one capture time.
/// An empty batch is a valid no-op, not an error.
#[derive(Debug, Clone)]
pub struct CoinBatch {
    pub records: Vec<CoinRecord>,
    pub captured_at: DateTime<Utc>,
}

impl CoinBatch {
    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }
}

#[derive(Debug, Clone)]
pub struct RateBatch {
    pub records: Vec<RateRecord>,
    pub recorded_at: DateTime<Utc>,
}

impl RateBatch {
    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }
}

/// Project, filter and order the merged raw sequence into a load-ready batch.
///
/// Each step is side-effect-free: project to the retained fields, drop
/// records without a rank, drop volume at or below the cutoff, drop changes
/// inside the noise floor, parse the source timestamp, stamp the capture
/// time. The final rank sort re-establishes a deterministic order on top of
/// whatever the fetch engine produced.
pub fn normalize_coins(
    raw: Vec<RawRecord>,
    rules: &FilterRules,
    captured_at: DateTime<Utc>,
) -> CoinBatch {
    let total = raw.len();
    let mut records: Vec<CoinRecord> = raw
        .into_iter()
        .filter_map(|record| project_coin(&record, rules, captured_at))
        .collect();

    records.sort_by_key(|record| record.market_cap_rank);

    log::info!("{} of {} raw records usable", records.len(), total);
    CoinBatch {
        records,
        captured_at,
    }
}

fn project_coin(
    record: &RawRecord,
    rules: &FilterRules,
    captured_at: DateTime<Utc>,
) -> Option<CoinRecord> {
    let market_cap_rank = record.rank()?;

    let total_volume = record.f64_field("total_volume")?;
    if total_volume <= rules.volume_cutoff {
        return None;
    }

    let price_change_percentage_24h = record.f64_field("price_change_percentage_24h")?;
    if price_change_percentage_24h.abs() <= rules.change_noise_floor {
        return None;
    }

    let last_updated = record
        .str_field("last_updated")
        .and_then(|raw| DateTime::parse_from_rfc3339(raw).ok())
        .map(|dt| dt.with_timezone(&Utc))?;

    Some(CoinRecord {
        coin_id: record.str_field("id")?.to_string(),
        symbol: record.str_field("symbol")?.to_string(),
        name: record.str_field("name")?.to_string(),
        current_price: record.decimal_field("current_price")?,
        market_cap: record.f64_field("market_cap"),
        total_volume,
        market_cap_rank,
        price_change_percentage_24h,
        high_24h: record.f64_field("high_24h"),
        low_24h: record.f64_field("low_24h"),
        last_updated,
        captured_at,
    })
}

/// Expand a rates document into per-currency rows keyed by the document's
/// reference timestamp.
pub fn normalize_rates(document: RatesDocument) -> RateBatch {
    let recorded_at = document.recorded_at;
    let records = document
        .rates
        .into_iter()
        .map(|(currency_code, rate)| RateRecord {
            currency_code,
            rate,
            recorded_at,
        })
        .collect();

    RateBatch {
        records,
        recorded_at,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn raw_coin(id: &str, rank: Option<i64>, volume: f64, change: f64) -> RawRecord {
        let mut body = json!({
            "id": id,
            "symbol": id,
            "name": id.to_uppercase(),
            "current_price": 100.5,
            "market_cap": 1_000_000.0,
            "total_volume": volume,
            "price_change_percentage_24h": change,
            "high_24h": 110.0,
            "low_24h": 90.0,
            "last_updated": "2025-06-27T00:00:01Z"
        });
        if let Some(rank) = rank {
            body["market_cap_rank"] = json!(rank);
        }
        RawRecord::from_json(body)
    }

    fn rules() -> FilterRules {
        FilterRules::default()
    }

    #[test]
    fn missing_rank_is_dropped() {
        let batch = normalize_coins(
            vec![raw_coin("btc", None, 1_000_000.0, 2.0)],
            &rules(),
            Utc::now(),
        );
        assert!(batch.is_empty());
    }

    #[test]
    fn volume_at_the_cutoff_is_excluded() {
        // Strict `>` policy: exactly 50_000 does not survive.
        let batch = normalize_coins(
            vec![
                raw_coin("at", Some(1), 50_000.0, 2.0),
                raw_coin("above", Some(2), 50_000.1, 2.0),
            ],
            &rules(),
            Utc::now(),
        );
        assert_eq!(batch.len(), 1);
        assert_eq!(batch.records[0].coin_id, "above");
    }

    #[test]
    fn flat_price_change_is_noise() {
        let batch = normalize_coins(
            vec![
                raw_coin("flat", Some(1), 1_000_000.0, 0.05),
                raw_coin("down", Some(2), 1_000_000.0, -0.06),
                raw_coin("up", Some(3), 1_000_000.0, 0.06),
            ],
            &rules(),
            Utc::now(),
        );
        let ids: Vec<&str> = batch.records.iter().map(|r| r.coin_id.as_str()).collect();
        assert_eq!(ids, vec!["down", "up"]);
    }

    #[test]
    fn unparseable_update_time_drops_the_record() {
        let mut body = json!({
            "id": "bad-ts",
            "symbol": "bad",
            "name": "Bad",
            "current_price": 1.0,
            "market_cap_rank": 1,
            "total_volume": 1_000_000.0,
            "price_change_percentage_24h": 2.0,
            "last_updated": "yesterday-ish"
        });
        body["market_cap"] = json!(null);
        let batch = normalize_coins(
            vec![RawRecord::from_json(body)],
            &rules(),
            Utc::now(),
        );
        assert!(batch.is_empty());
    }

    #[test]
    fn records_are_sorted_by_rank() {
        let batch = normalize_coins(
            vec![
                raw_coin("third", Some(30), 1_000_000.0, 2.0),
                raw_coin("first", Some(1), 1_000_000.0, 2.0),
                raw_coin("second", Some(2), 1_000_000.0, 2.0),
            ],
            &rules(),
            Utc::now(),
        );
        let ids: Vec<&str> = batch.records.iter().map(|r| r.coin_id.as_str()).collect();
        assert_eq!(ids, vec!["first", "second", "third"]);
    }

    #[test]
    fn surviving_records_carry_the_capture_time() {
        let captured_at = Utc::now();
        let batch = normalize_coins(
            vec![raw_coin("btc", Some(1), 1_000_000.0, 2.0)],
            &rules(),
            captured_at,
        );
        assert_eq!(batch.records[0].captured_at, captured_at);
        assert_eq!(batch.captured_at, captured_at);
    }

    #[test]
    fn rates_document_expands_to_keyed_rows() {
        let recorded_at = Utc::now();
        let batch = normalize_rates(RatesDocument {
            rates: vec![
                ("USD".to_string(), Decimal::ONE),
                ("EUR".to_string(), "0.92".parse().unwrap()),
            ],
            recorded_at,
        });

        assert_eq!(batch.len(), 2);
        assert!(batch.records.iter().all(|r| r.recorded_at == recorded_at));
    }
}
