use std::collections::HashMap;

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use sqlx::Row;

use crate::error::{AppError, Result};
use crate::storage::Database;

/// Every stored price is expressed relative to this currency; it resolves to
/// a synthetic rate of 1.0 rather than a stored row.
pub const BASE_CURRENCY: &str = "USD";

/// Result of one conversion: the effective cross-rate and the resolution
/// timestamp of the source-side rate.
#[derive(Debug, Clone)]
pub struct Conversion {
    pub amount: Decimal,
    pub from: String,
    pub to: String,
    pub result: Decimal,
    pub rate: Decimal,
    pub last_updated: DateTime<Utc>,
}

/// Where a resolved rate came from, which decides how it converts to a
/// value-in-base:
/// forex rows quote units-per-USD and invert; coin rows quote USD-per-unit
/// and pass through.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum RateSource {
    Forex,
    Crypto,
    Base,
}

#[derive(Debug, Clone)]
struct ResolvedRate {
    rate: Decimal,
    source: RateSource,
    timestamp: DateTime<Utc>,
}

/// Read path over the persisted snapshots: resolves the most recent rate per
/// code and computes cross-rates through the base currency.
pub struct RateResolver<'a> {
    db: &'a Database,
}

impl<'a> RateResolver<'a> {
    pub fn new(db: &'a Database) -> Self {
        Self { db }
    }

    pub async fn convert(&self, from: &str, to: &str, amount: Decimal) -> Result<Conversion> {
        self.convert_as_of(from, to, amount, None).await
    }

    /// Convert `amount` between two codes using the latest persisted rates,
    /// optionally as of a point in time. Unknown codes produce a typed
    /// not-found error listing exactly what was missing.
    pub async fn convert_as_of(
        &self,
        from: &str,
        to: &str,
        amount: Decimal,
        as_of: Option<DateTime<Utc>>,
    ) -> Result<Conversion> {
        if amount <= Decimal::ZERO {
            return Err(AppError::message("amount must be positive"));
        }

        let mut rates = self.lookup_latest(&[from, to], as_of).await?;

        for code in [from, to] {
            if code == BASE_CURRENCY && !rates.contains_key(code) {
                rates.insert(
                    code.to_string(),
                    ResolvedRate {
                        rate: Decimal::ONE,
                        source: RateSource::Base,
                        timestamp: as_of.unwrap_or_else(Utc::now),
                    },
                );
            }
        }

        let missing: Vec<String> = [from, to]
            .iter()
            .filter(|code| !rates.contains_key(**code))
            .map(|code| code.to_string())
            .collect();
        if !missing.is_empty() {
            return Err(AppError::CurrenciesNotFound { missing });
        }

        let rate_from = &rates[from];
        let rate_to = &rates[to];

        let rate = cross_rate(rate_from, rate_to).ok_or_else(|| {
            AppError::message(format!("rate for {} or {} is zero", from, to))
        })?;
        let result = (amount * rate).round_dp(8);

        Ok(Conversion {
            amount,
            from: from.to_string(),
            to: to.to_string(),
            result,
            rate: rate.round_dp(8),
            last_updated: rate_from.timestamp,
        })
    }

    /// Latest row per code across both snapshot tables. Codes are matched
    /// exactly as stored: forex codes are upper-case, coin symbols lower-case.
    async fn lookup_latest(
        &self,
        codes: &[&str],
        as_of: Option<DateTime<Utc>>,
    ) -> Result<HashMap<String, ResolvedRate>> {
        let codes: Vec<String> = codes.iter().map(|c| c.to_string()).collect();

        let rows = sqlx::query(
            r#"
            WITH all_prices AS (
                SELECT currency_code AS code, rate, recorded_at AS ts, 'forex' AS source
                FROM exchange_rates
                WHERE currency_code = ANY($1)
                  AND ($2::timestamptz IS NULL OR recorded_at <= $2)
                UNION ALL
                SELECT symbol AS code, current_price AS rate, last_updated AS ts, 'crypto' AS source
                FROM coin_prices
                WHERE symbol = ANY($1)
                  AND ($2::timestamptz IS NULL OR last_updated <= $2)
            )
            SELECT DISTINCT ON (code) code, rate, ts, source
            FROM all_prices
            ORDER BY code, ts DESC
            "#,
        )
        .bind(&codes)
        .bind(as_of)
        .fetch_all(self.db.pool())
        .await?;

        let mut rates = HashMap::with_capacity(rows.len());
        for row in rows {
            let code: String = row.try_get("code")?;
            let source = match row.try_get::<&str, _>("source")? {
                "forex" => RateSource::Forex,
                _ => RateSource::Crypto,
            };
            rates.insert(
                code,
                ResolvedRate {
                    rate: row.try_get("rate")?,
                    source,
                    timestamp: row.try_get("ts")?,
                },
            );
        }

        Ok(rates)
    }
}

/// A rate's value expressed in the base currency. Forex rates are quoted as
/// units per base and invert; crypto and base rates already are base-per-unit.
fn value_in_base(resolved: &ResolvedRate) -> Option<Decimal> {
    match resolved.source {
        RateSource::Crypto | RateSource::Base => Some(resolved.rate),
        RateSource::Forex => {
            if resolved.rate.is_zero() {
                None
            } else {
                Some(Decimal::ONE / resolved.rate)
            }
        }
    }
}

fn cross_rate(from: &ResolvedRate, to: &ResolvedRate) -> Option<Decimal> {
    let val_from = value_in_base(from)?;
    let val_to = value_in_base(to)?;
    if val_to.is_zero() {
        return None;
    }
    Some(val_from / val_to)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn resolved(rate: &str, source: RateSource) -> ResolvedRate {
        ResolvedRate {
            rate: rate.parse().unwrap(),
            source,
            timestamp: Utc::now(),
        }
    }

    #[test]
    fn forex_rates_invert_to_base_value() {
        // 0.92 EUR per USD means one EUR is worth 1/0.92 USD.
        let eur = resolved("0.92", RateSource::Forex);
        let value = value_in_base(&eur).unwrap();
        assert_eq!(value.round_dp(8), "1.08695652".parse().unwrap());
    }

    #[test]
    fn crypto_and_base_values_pass_through() {
        let btc = resolved("64250.5", RateSource::Crypto);
        assert_eq!(value_in_base(&btc).unwrap(), "64250.5".parse().unwrap());

        let usd = resolved("1.0", RateSource::Base);
        assert_eq!(value_in_base(&usd).unwrap(), Decimal::ONE);
    }

    #[test]
    fn usd_to_eur_uses_the_quoted_rate() {
        // 100 USD at 0.92 EUR per USD buys 92 EUR.
        let usd = resolved("1.0", RateSource::Base);
        let eur = resolved("0.92", RateSource::Forex);

        let rate = cross_rate(&usd, &eur).unwrap();
        assert_eq!(rate.round_dp(8), "0.92".parse().unwrap());

        let amount: Decimal = "100".parse().unwrap();
        assert_eq!((amount * rate).round_dp(8), "92".parse().unwrap());
    }

    #[test]
    fn eur_to_usd_inverts() {
        let eur = resolved("0.92", RateSource::Forex);
        let usd = resolved("1.0", RateSource::Base);

        let rate = cross_rate(&eur, &usd).unwrap();
        assert_eq!(rate.round_dp(8), "1.08695652".parse().unwrap());
    }

    #[test]
    fn crypto_to_forex_crosses_through_base() {
        let btc = resolved("64250.5", RateSource::Crypto);
        let eur = resolved("0.92", RateSource::Forex);

        // BTC value in USD times EUR per USD.
        let rate = cross_rate(&btc, &eur).unwrap();
        let expected: Decimal = "64250.5".parse::<Decimal>().unwrap() * "0.92".parse::<Decimal>().unwrap();
        assert_eq!(rate.round_dp(4), expected.round_dp(4));
    }

    #[test]
    fn zero_forex_rate_is_rejected() {
        let broken = resolved("0", RateSource::Forex);
        let usd = resolved("1.0", RateSource::Base);
        assert!(cross_rate(&broken, &usd).is_none());
    }
}
