use crate::error::Result;

pub mod coins;
pub mod forex;
pub mod page;
pub mod retry;

pub use coins::{CoinMarketFetcher, FetchPlan, HttpPageSource, Pacing, PageSource};
pub use forex::{fetch_rates_document, RatesDocument};
pub use page::{PageOutcome, PageRequest, RawRecord};
pub use retry::RetryPolicy;

/// Default concurrency guard applied when fanning out page requests.
pub const PAGE_CONCURRENCY_LIMIT: usize = 5;

pub type FetchResult<T> = Result<T>;

#[inline]
pub fn ensure_concurrency_limit(limit: usize) -> usize {
    limit.max(1)
}
