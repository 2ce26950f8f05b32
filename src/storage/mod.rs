use std::time::Duration;

use sqlx::postgres::PgPoolOptions;
use sqlx::PgPool;

use crate::error::{Context, Result};

pub mod loader;

pub use loader::{load_coin_batch, load_rate_batch, LoadReport};

/// Explicitly constructed database handle, scoped to one run. Passed into the
/// loader and the rate resolver instead of living in a process-wide global.
pub struct Database {
    pool: PgPool,
}

impl Database {
    pub async fn connect(database_url: &str) -> Result<Self> {
        let url = ensure_sslmode(database_url);
        let pool = PgPoolOptions::new()
            .max_connections(5)
            .acquire_timeout(Duration::from_secs(10))
            .connect(&url)
            .await
            .context("Failed to connect to the database")?;

        Ok(Self { pool })
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    /// Create the snapshot tables and their lookup indexes if absent.
    pub async fn migrate(&self) -> Result<()> {
        let create_coin_prices = r#"
            CREATE TABLE IF NOT EXISTS coin_prices (
                id BIGSERIAL PRIMARY KEY,
                coin_id TEXT NOT NULL,
                symbol TEXT NOT NULL,
                name TEXT NOT NULL,
                current_price NUMERIC NOT NULL,
                market_cap DOUBLE PRECISION,
                total_volume DOUBLE PRECISION NOT NULL,
                market_cap_rank BIGINT NOT NULL,
                price_change_percentage_24h DOUBLE PRECISION NOT NULL,
                high_24h DOUBLE PRECISION,
                low_24h DOUBLE PRECISION,
                last_updated TIMESTAMPTZ NOT NULL,
                captured_at TIMESTAMPTZ NOT NULL
            )
        "#;

        let create_exchange_rates = r#"
            CREATE TABLE IF NOT EXISTS exchange_rates (
                id BIGSERIAL PRIMARY KEY,
                currency_code TEXT NOT NULL,
                rate NUMERIC NOT NULL,
                recorded_at TIMESTAMPTZ NOT NULL
            )
        "#;

        let create_indexes = [
            "CREATE INDEX IF NOT EXISTS idx_coin_prices_symbol_ts ON coin_prices (symbol, last_updated DESC)",
            "CREATE INDEX IF NOT EXISTS idx_coin_prices_captured_at ON coin_prices (captured_at)",
            "CREATE INDEX IF NOT EXISTS idx_exchange_rates_code_ts ON exchange_rates (currency_code, recorded_at DESC)",
            "CREATE INDEX IF NOT EXISTS idx_exchange_rates_recorded_at ON exchange_rates (recorded_at)",
        ];

        sqlx::query(create_coin_prices).execute(&self.pool).await?;
        sqlx::query(create_exchange_rates).execute(&self.pool).await?;
        for statement in create_indexes {
            sqlx::query(statement).execute(&self.pool).await?;
        }

        Ok(())
    }

    pub async fn close(self) {
        self.pool.close().await;
    }
}

/// Managed Postgres providers reject plaintext connections; require SSL unless
/// the URL already says otherwise.
pub fn ensure_sslmode(url: &str) -> String {
    if url.contains("sslmode") {
        url.to_string()
    } else if url.contains('?') {
        format!("{}&sslmode=require", url)
    } else {
        format!("{}?sslmode=require", url)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sslmode_is_appended_when_missing() {
        assert_eq!(
            ensure_sslmode("postgres://u:p@host/db"),
            "postgres://u:p@host/db?sslmode=require"
        );
        assert_eq!(
            ensure_sslmode("postgres://u:p@host/db?application_name=etl"),
            "postgres://u:p@host/db?application_name=etl&sslmode=require"
        );
    }

    #[test]
    fn explicit_sslmode_is_left_alone() {
        let url = "postgres://u:p@host/db?sslmode=disable";
        assert_eq!(ensure_sslmode(url), url);
    }
}
