use reqwest::{Client, StatusCode};
use rust_decimal::prelude::FromPrimitive;
use rust_decimal::Decimal;
use serde_json::{Map, Value};

pub const API_KEY_HEADER: &str = "x-cg-demo-api-key";

/// Statuses worth retrying; everything else non-200 fails the page outright.
pub const RETRYABLE_STATUSES: [u16; 5] = [429, 500, 502, 503, 504];

/// One slot in the paginated fan-out. Page indices are 1-based, matching the
/// upstream API.
#[derive(Debug, Clone)]
pub struct PageRequest {
    pub page: u32,
    pub per_page: u32,
    pub vs_currency: String,
    pub order: String,
}

impl PageRequest {
    pub fn query(&self) -> Vec<(&'static str, String)> {
        vec![
            ("vs_currency", self.vs_currency.clone()),
            ("order", self.order.clone()),
            ("per_page", self.per_page.to_string()),
            ("page", self.page.to_string()),
            ("sparkline", "false".to_string()),
        ]
    }
}

/// Loosely-typed upstream record. Field access fails closed: a missing or
/// mistyped field yields `None` and the record is dropped downstream, never a
/// propagated fault.
#[derive(Debug, Clone)]
pub struct RawRecord(Map<String, Value>);

impl RawRecord {
    pub fn from_value(value: Value) -> Option<Self> {
        match value {
            Value::Object(map) => Some(Self(map)),
            _ => None,
        }
    }

    pub fn str_field(&self, key: &str) -> Option<&str> {
        self.0.get(key).and_then(Value::as_str)
    }

    pub fn f64_field(&self, key: &str) -> Option<f64> {
        match self.0.get(key)? {
            Value::Number(n) => n.as_f64(),
            Value::String(s) => s.parse().ok(),
            _ => None,
        }
    }

    pub fn decimal_field(&self, key: &str) -> Option<Decimal> {
        match self.0.get(key)? {
            Value::Number(n) => n.as_f64().and_then(Decimal::from_f64),
            Value::String(s) => s.parse().ok(),
            _ => None,
        }
    }

    pub fn rank(&self) -> Option<i64> {
        self.0.get("market_cap_rank").and_then(Value::as_i64)
    }

    #[cfg(test)]
    pub fn from_json(json: Value) -> Self {
        Self::from_value(json).expect("test record must be a JSON object")
    }
}

/// Definitive result for one page slot, produced after retries are exhausted
/// or a terminal response arrived.
#[derive(Debug)]
pub enum PageOutcome {
    Records(Vec<RawRecord>),
    Empty,
    Stop,
    TransientFailure(String),
    FatalFailure(String),
}

impl PageOutcome {
    /// Anything that is not a full page of records truncates the merged
    /// sequence at this index.
    pub fn is_boundary(&self) -> bool {
        !matches!(self, PageOutcome::Records(_))
    }
}

/// Failure of a single attempt, before retry policy is applied.
#[derive(Debug)]
pub enum FetchFailure {
    Transient(String),
    Fatal(String),
}

pub(crate) fn classify_status(page: u32, status: StatusCode) -> FetchFailure {
    if RETRYABLE_STATUSES.contains(&status.as_u16()) {
        FetchFailure::Transient(format!("page {} returned {}", page, status))
    } else {
        FetchFailure::Fatal(format!("page {} returned {}", page, status))
    }
}

/// Inspect a successfully parsed page and decide between `Records`, `Empty`
/// and the early-stop signal.
///
/// The upstream orders records by descending activity, so a trailing record
/// under the volume cutoff means every later page is under it too. That is an
/// assumption about upstream ordering stability, not a guarantee. The page
/// that trips the check is discarded wholesale.
pub fn evaluate_page(records: Vec<RawRecord>, volume_cutoff: f64) -> PageOutcome {
    if records.is_empty() {
        return PageOutcome::Empty;
    }

    let trailing_volume = records.last().and_then(|r| r.f64_field("total_volume"));
    match trailing_volume {
        Some(volume) if volume < volume_cutoff => PageOutcome::Stop,
        _ => PageOutcome::Records(records),
    }
}

/// Issue exactly one GET for one page slot. The client carries the fixed
/// request timeout; timeouts surface as transport errors and are transient.
pub(crate) async fn fetch_page_once(
    client: &Client,
    endpoint: &str,
    api_key: Option<&str>,
    request: &PageRequest,
    volume_cutoff: f64,
) -> std::result::Result<PageOutcome, FetchFailure> {
    let mut builder = client.get(endpoint).query(&request.query());
    if let Some(key) = api_key {
        builder = builder.header(API_KEY_HEADER, key);
    }

    let response = builder
        .send()
        .await
        .map_err(|err| FetchFailure::Transient(format!("page {}: {}", request.page, err)))?;

    let status = response.status();
    if !status.is_success() {
        return Err(classify_status(request.page, status));
    }

    // Read the body before parsing it: a timeout or dropped connection
    // mid-body is a transport fault and keeps its retry budget, only a body
    // that is not the expected JSON fails the page outright.
    let body = response.text().await.map_err(|err| {
        FetchFailure::Transient(format!("page {}: body read failed: {}", request.page, err))
    })?;

    let records = parse_page_body(request.page, &body)?;
    Ok(evaluate_page(records, volume_cutoff))
}

pub(crate) fn parse_page_body(
    page: u32,
    body: &str,
) -> std::result::Result<Vec<RawRecord>, FetchFailure> {
    let values: Vec<Value> = serde_json::from_str(body)
        .map_err(|err| FetchFailure::Fatal(format!("page {}: malformed body: {}", page, err)))?;
    Ok(values.into_iter().filter_map(RawRecord::from_value).collect())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn record(volume: f64) -> RawRecord {
        RawRecord::from_json(json!({ "id": "x", "total_volume": volume }))
    }

    #[test]
    fn retryable_statuses_are_transient() {
        for code in [429u16, 500, 502, 503, 504] {
            let status = StatusCode::from_u16(code).unwrap();
            assert!(matches!(
                classify_status(1, status),
                FetchFailure::Transient(_)
            ));
        }
    }

    #[test]
    fn other_statuses_fail_fast() {
        for code in [400u16, 401, 403, 404, 418] {
            let status = StatusCode::from_u16(code).unwrap();
            assert!(matches!(classify_status(1, status), FetchFailure::Fatal(_)));
        }
    }

    #[test]
    fn empty_page_is_empty_outcome() {
        assert!(matches!(evaluate_page(vec![], 50_000.0), PageOutcome::Empty));
    }

    #[test]
    fn low_trailing_volume_signals_stop() {
        let records = vec![record(900_000.0), record(49_999.9)];
        assert!(matches!(
            evaluate_page(records, 50_000.0),
            PageOutcome::Stop
        ));
    }

    #[test]
    fn trailing_volume_at_cutoff_does_not_stop() {
        // The stop check is strictly below the cutoff; the filter later drops
        // the boundary record itself.
        let records = vec![record(900_000.0), record(50_000.0)];
        assert!(matches!(
            evaluate_page(records, 50_000.0),
            PageOutcome::Records(_)
        ));
    }

    #[test]
    fn missing_trailing_volume_keeps_records() {
        let records = vec![RawRecord::from_json(json!({ "id": "no-volume" }))];
        assert!(matches!(
            evaluate_page(records, 50_000.0),
            PageOutcome::Records(_)
        ));
    }

    #[test]
    fn malformed_body_is_fatal() {
        let result = parse_page_body(2, "<html>rate limited</html>");
        assert!(matches!(result, Err(FetchFailure::Fatal(_))));
    }

    #[test]
    fn non_object_elements_are_dropped_not_fatal() {
        let records = parse_page_body(1, r#"[{"id": "bitcoin"}, 42, null]"#).expect("page");
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].str_field("id"), Some("bitcoin"));
    }

    #[tokio::test]
    async fn unreachable_host_is_transient() {
        let client = Client::builder()
            .timeout(std::time::Duration::from_millis(200))
            .build()
            .unwrap();
        let request = PageRequest {
            page: 1,
            per_page: 1,
            vs_currency: "usd".to_string(),
            order: "market_cap_desc".to_string(),
        };

        let result =
            fetch_page_once(&client, "http://127.0.0.1:9/markets", None, &request, 50_000.0).await;
        assert!(matches!(result, Err(FetchFailure::Transient(_))));
    }

    #[test]
    fn raw_record_field_access_fails_closed() {
        let record = RawRecord::from_json(json!({
            "symbol": "btc",
            "current_price": 64250.5,
            "market_cap_rank": 1,
            "total_volume": "123456.7"
        }));

        assert_eq!(record.str_field("symbol"), Some("btc"));
        assert_eq!(record.f64_field("total_volume"), Some(123456.7));
        assert_eq!(record.rank(), Some(1));
        assert!(record.decimal_field("current_price").is_some());

        assert_eq!(record.str_field("name"), None);
        assert_eq!(record.f64_field("symbol"), None);
        assert!(RawRecord::from_value(json!(["not", "an", "object"])).is_none());

        let unranked = RawRecord::from_json(json!({ "symbol": "xyz" }));
        assert_eq!(unranked.rank(), None);
    }
}
