use std::time::Duration;

use chrono::{DateTime, Utc};
use reqwest::Client;
use rust_decimal::prelude::FromPrimitive;
use rust_decimal::Decimal;
use serde::Deserialize;
use serde_json::{Map, Value};

use crate::error::{AppError, Context};

use super::FetchResult;

/// One currency-rates document from the exchange-rate API: every quoted rate
/// plus the provider's own reference timestamp, which becomes the batch's
/// capture key.
#[derive(Debug, Clone)]
pub struct RatesDocument {
    pub rates: Vec<(String, Decimal)>,
    pub recorded_at: DateTime<Utc>,
}

/// Fetch the latest rates document with a single GET. Unlike the paginated
/// coins fetch there is no retry policy here; a failed capture is simply
/// reported and the next scheduled run tries again.
pub async fn fetch_rates_document(url: &str, timeout: Duration) -> FetchResult<RatesDocument> {
    let client = Client::builder()
        .timeout(timeout)
        .build()
        .context("Failed to construct rates HTTP client")?;

    let response = client
        .get(url)
        .send()
        .await
        .context("Rates request failed")?;

    if !response.status().is_success() {
        return Err(AppError::message(format!(
            "Rates request failed with status {}",
            response.status()
        )));
    }

    let body: Value = response
        .json()
        .await
        .context("Failed to parse rates response")?;

    parse_rates_document(body)
}

/// Envelope of the rates response. Quotes stay loosely typed so one bad value
/// drops a single quote instead of the whole document.
#[derive(Debug, Deserialize)]
struct RatesEnvelope {
    time_last_update_utc: String,
    conversion_rates: Map<String, Value>,
}

fn parse_rates_document(body: Value) -> FetchResult<RatesDocument> {
    let envelope: RatesEnvelope = serde_json::from_value(body)
        .map_err(|err| AppError::message(format!("Malformed rates response: {}", err)))?;
    let recorded_at = parse_reference_time(&envelope.time_last_update_utc)?;

    let mut rates = Vec::with_capacity(envelope.conversion_rates.len());
    for (code, value) in envelope.conversion_rates {
        let rate = match value {
            Value::Number(n) => n.as_f64().and_then(Decimal::from_f64),
            Value::String(s) => s.parse().ok(),
            _ => None,
        };
        // Fail closed on an unparseable quote rather than aborting the batch.
        match rate {
            Some(rate) => rates.push((code, rate)),
            None => log::warn!("skipping rate for {}: unparseable value", code),
        }
    }

    if rates.is_empty() {
        return Err(AppError::message("Rates response contained no usable rates"));
    }

    Ok(RatesDocument { rates, recorded_at })
}

/// The provider quotes its update time in RFC 2822 ("Fri, 27 Jun 2025
/// 00:00:01 +0000"); accept RFC 3339 as well.
fn parse_reference_time(raw: &str) -> FetchResult<DateTime<Utc>> {
    DateTime::parse_from_rfc2822(raw)
        .or_else(|_| DateTime::parse_from_rfc3339(raw))
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|err| AppError::message(format!("Invalid rates timestamp `{}`: {}", raw, err)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn parses_a_well_formed_document() {
        let body = json!({
            "result": "success",
            "time_last_update_utc": "Fri, 27 Jun 2025 00:00:01 +0000",
            "conversion_rates": {
                "USD": 1.0,
                "EUR": 0.92,
                "JPY": 144.53
            }
        });

        let doc = parse_rates_document(body).expect("document");
        assert_eq!(doc.rates.len(), 3);
        assert_eq!(doc.recorded_at.to_rfc3339(), "2025-06-27T00:00:01+00:00");
    }

    #[test]
    fn missing_reference_time_is_an_error() {
        let body = json!({ "conversion_rates": { "USD": 1.0 } });
        assert!(parse_rates_document(body).is_err());
    }

    #[test]
    fn missing_rates_map_is_an_error() {
        let body = json!({ "time_last_update_utc": "Fri, 27 Jun 2025 00:00:01 +0000" });
        assert!(parse_rates_document(body).is_err());
    }

    #[test]
    fn unparseable_quotes_are_skipped_not_fatal() {
        let body = json!({
            "time_last_update_utc": "Fri, 27 Jun 2025 00:00:01 +0000",
            "conversion_rates": {
                "USD": 1.0,
                "BAD": null
            }
        });

        let doc = parse_rates_document(body).expect("document");
        assert_eq!(doc.rates.len(), 1);
        assert_eq!(doc.rates[0].0, "USD");
    }
}
