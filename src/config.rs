use std::env;
use std::str::FromStr;
use std::time::Duration;

use crate::error::{AppError, Result};

pub const DEFAULT_COINS_API_URL: &str = "https://api.coingecko.com/api/v3/coins/markets";

/// Runtime settings, sourced from the environment with sensible defaults.
///
/// `DATABASE_URL` is the only value required for every command; the rates
/// capture additionally needs `EXCHANGE_API_URL`. Everything else is a tunable
/// with a default matching the upstream API's rate limits.
#[derive(Debug, Clone)]
pub struct Settings {
    pub database_url: String,
    pub coins_api_url: String,
    pub gecko_api_key: Option<String>,
    pub exchange_api_url: Option<String>,
    pub pages: u32,
    pub per_page: u32,
    pub concurrency: usize,
    pub volume_cutoff: f64,
    pub change_noise_floor: f64,
    pub request_timeout: Duration,
    pub rates_timeout: Duration,
    pub max_attempts: u32,
    pub base_backoff: Duration,
    pub serial_spacing: Duration,
    pub insert_chunk_size: usize,
}

impl Settings {
    pub fn from_env() -> Result<Self> {
        let database_url = env::var("DATABASE_URL")
            .map_err(|_| AppError::config("DATABASE_URL is not set"))?;

        Ok(Self {
            database_url,
            coins_api_url: optional_var("COINS_API_URL")
                .unwrap_or_else(|| DEFAULT_COINS_API_URL.to_string()),
            gecko_api_key: optional_var("GECKO_KEY"),
            exchange_api_url: optional_var("EXCHANGE_API_URL"),
            pages: parse_var("FETCH_PAGES", 8)?,
            per_page: parse_var("FETCH_PER_PAGE", 250)?,
            concurrency: parse_var("FETCH_CONCURRENCY", 5)?,
            volume_cutoff: parse_var("VOLUME_CUTOFF", 50_000.0)?,
            change_noise_floor: parse_var("CHANGE_NOISE_FLOOR", 0.05)?,
            request_timeout: Duration::from_secs(parse_var("FETCH_TIMEOUT_SECS", 10)?),
            rates_timeout: Duration::from_secs(parse_var("RATES_TIMEOUT_SECS", 15)?),
            max_attempts: parse_var("FETCH_MAX_ATTEMPTS", 5)?,
            base_backoff: Duration::from_millis(parse_var("FETCH_BASE_BACKOFF_MS", 2_000)?),
            serial_spacing: Duration::from_millis(parse_var("FETCH_SERIAL_SPACING_MS", 3_000)?),
            insert_chunk_size: parse_var("INSERT_CHUNK_SIZE", 500)?,
        })
    }

    /// The rates capture cannot run without an upstream endpoint.
    pub fn require_exchange_api_url(&self) -> Result<&str> {
        self.exchange_api_url
            .as_deref()
            .ok_or_else(|| AppError::config("EXCHANGE_API_URL is not set"))
    }
}

fn optional_var(name: &str) -> Option<String> {
    match env::var(name) {
        Ok(value) => {
            let trimmed = value.trim();
            if trimmed.is_empty() {
                None
            } else {
                Some(trimmed.to_string())
            }
        }
        Err(_) => None,
    }
}

/// Parse an override from the environment, surfacing bad values instead of
/// silently falling back to the default.
fn parse_var<T: FromStr>(name: &str, default: T) -> Result<T> {
    match optional_var(name) {
        Some(raw) => raw
            .parse::<T>()
            .map_err(|_| AppError::config(format!("{} has invalid value `{}`", name, raw))),
        None => Ok(default),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_var_falls_back_to_default_when_unset() {
        let value: u32 = parse_var("RATES_CLI_TEST_UNSET_VAR", 42).expect("default");
        assert_eq!(value, 42);
    }

    #[test]
    fn parse_var_rejects_garbage() {
        env::set_var("RATES_CLI_TEST_BAD_VAR", "not-a-number");
        let result: Result<u32> = parse_var("RATES_CLI_TEST_BAD_VAR", 1);
        env::remove_var("RATES_CLI_TEST_BAD_VAR");
        assert!(matches!(result, Err(AppError::Config(_))));
    }
}
