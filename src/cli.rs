use chrono::{DateTime, Utc};
use clap::{Parser, Subcommand};
use rust_decimal::Decimal;

#[derive(Debug, Parser)]
#[command(
    name = "rates-cli",
    about = "Capture coin market snapshots and currency rates into Postgres",
    version
)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Option<Commands>,
}

#[derive(Debug, Subcommand)]
pub enum Commands {
    /// Fetch paginated coin market snapshots and load one batch
    Coins {
        /// Space requests out serially instead of fetching pages concurrently
        #[arg(long)]
        serial: bool,
    },
    /// Capture the latest currency rates document
    Rates,
    /// Convert an amount between two currency codes using stored rates
    Convert {
        /// Source code, exactly as stored (e.g. USD, EUR, btc)
        from: String,
        /// Target code, exactly as stored
        to: String,
        /// Amount to convert
        amount: Decimal,
        /// Resolve rates as of this RFC 3339 instant instead of the latest
        #[arg(long)]
        as_of: Option<DateTime<Utc>>,
    },
    /// Create the snapshot tables and indexes if they do not exist
    Migrate,
}

impl Default for Commands {
    fn default() -> Self {
        Commands::Coins { serial: false }
    }
}
