use std::ops::Range;

use sqlx::{Postgres, QueryBuilder, Transaction};

use crate::error::Result;
use crate::records::{CoinBatch, CoinRecord, RateBatch, RateRecord};

use super::Database;

/// What the loader did with a batch. Duplicate and empty batches are
/// legitimate no-ops, never errors.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoadReport {
    Inserted(usize),
    SkippedDuplicate,
    EmptyBatch,
}

/// Load one coin batch atomically.
///
/// Inside a single transaction: if any row already exists for the batch's
/// capture key the whole batch is skipped; otherwise every record is inserted
/// in fixed-size chunks and committed once. A failure anywhere rolls the
/// entire batch back.
///
/// The existence check and the insert are not atomic across processes; two
/// simultaneous runs sharing a capture key could both pass the check. Runs
/// are scheduled one at a time, so no constraint guards that window.
pub async fn load_coin_batch(
    db: &Database,
    batch: &CoinBatch,
    chunk_size: usize,
) -> Result<LoadReport> {
    if batch.is_empty() {
        return Ok(LoadReport::EmptyBatch);
    }

    let mut tx = db.pool().begin().await?;

    let exists: bool =
        sqlx::query_scalar("SELECT EXISTS(SELECT 1 FROM coin_prices WHERE captured_at = $1)")
            .bind(batch.captured_at)
            .fetch_one(&mut *tx)
            .await?;

    match plan_load(batch.len(), chunk_size, exists) {
        LoadPlan::SkipDuplicate => {
            log::warn!(
                "coin batch for {} already loaded, skipping",
                batch.captured_at
            );
            tx.rollback().await?;
            Ok(LoadReport::SkippedDuplicate)
        }
        LoadPlan::Insert(chunks) => {
            for chunk in chunks {
                insert_coin_chunk(&mut tx, &batch.records[chunk]).await?;
            }
            tx.commit().await?;
            log::info!(
                "loaded {} coin records for {}",
                batch.len(),
                batch.captured_at
            );
            Ok(LoadReport::Inserted(batch.len()))
        }
    }
}

/// Load one rates batch atomically, keyed by the provider's reference
/// timestamp. Same contract as [`load_coin_batch`].
pub async fn load_rate_batch(
    db: &Database,
    batch: &RateBatch,
    chunk_size: usize,
) -> Result<LoadReport> {
    if batch.is_empty() {
        return Ok(LoadReport::EmptyBatch);
    }

    let mut tx = db.pool().begin().await?;

    let exists: bool =
        sqlx::query_scalar("SELECT EXISTS(SELECT 1 FROM exchange_rates WHERE recorded_at = $1)")
            .bind(batch.recorded_at)
            .fetch_one(&mut *tx)
            .await?;

    match plan_load(batch.len(), chunk_size, exists) {
        LoadPlan::SkipDuplicate => {
            log::warn!(
                "rates for {} already loaded, skipping",
                batch.recorded_at
            );
            tx.rollback().await?;
            Ok(LoadReport::SkippedDuplicate)
        }
        LoadPlan::Insert(chunks) => {
            for chunk in chunks {
                insert_rate_chunk(&mut tx, &batch.records[chunk]).await?;
            }
            tx.commit().await?;
            log::info!(
                "loaded {} rates for {}",
                batch.len(),
                batch.recorded_at
            );
            Ok(LoadReport::Inserted(batch.len()))
        }
    }
}

/// What to do with a non-empty batch once its capture key has been checked.
/// A key that is already present skips every record unconditionally; a fresh
/// key gets a chunk layout covering the whole batch.
#[derive(Debug, Clone, PartialEq, Eq)]
enum LoadPlan {
    SkipDuplicate,
    Insert(Vec<Range<usize>>),
}

fn plan_load(len: usize, chunk_size: usize, already_loaded: bool) -> LoadPlan {
    if already_loaded {
        return LoadPlan::SkipDuplicate;
    }

    let chunk = chunk_size.max(1);
    let chunks = (0..len)
        .step_by(chunk)
        .map(|start| start..usize::min(start + chunk, len))
        .collect();
    LoadPlan::Insert(chunks)
}

async fn insert_coin_chunk(
    tx: &mut Transaction<'_, Postgres>,
    chunk: &[CoinRecord],
) -> Result<()> {
    let mut builder = coin_insert_builder(chunk);
    builder.build().execute(&mut **tx).await?;
    Ok(())
}

async fn insert_rate_chunk(
    tx: &mut Transaction<'_, Postgres>,
    chunk: &[RateRecord],
) -> Result<()> {
    let mut builder = rate_insert_builder(chunk);
    builder.build().execute(&mut **tx).await?;
    Ok(())
}

fn coin_insert_builder(chunk: &[CoinRecord]) -> QueryBuilder<'_, Postgres> {
    let mut builder = QueryBuilder::new(
        "INSERT INTO coin_prices (coin_id, symbol, name, current_price, market_cap, \
         total_volume, market_cap_rank, price_change_percentage_24h, high_24h, low_24h, \
         last_updated, captured_at) ",
    );
    builder.push_values(chunk, |mut row, record| {
        row.push_bind(&record.coin_id)
            .push_bind(&record.symbol)
            .push_bind(&record.name)
            .push_bind(record.current_price)
            .push_bind(record.market_cap)
            .push_bind(record.total_volume)
            .push_bind(record.market_cap_rank)
            .push_bind(record.price_change_percentage_24h)
            .push_bind(record.high_24h)
            .push_bind(record.low_24h)
            .push_bind(record.last_updated)
            .push_bind(record.captured_at);
    });
    builder
}

fn rate_insert_builder(chunk: &[RateRecord]) -> QueryBuilder<'_, Postgres> {
    let mut builder =
        QueryBuilder::new("INSERT INTO exchange_rates (currency_code, rate, recorded_at) ");
    builder.push_values(chunk, |mut row, record| {
        row.push_bind(&record.currency_code)
            .push_bind(record.rate)
            .push_bind(record.recorded_at);
    });
    builder
}
