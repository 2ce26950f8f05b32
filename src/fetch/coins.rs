use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures::stream::{self, StreamExt};
use reqwest::Client;
use tokio::sync::Semaphore;
use tokio::time::sleep;
use tokio_util::sync::CancellationToken;

use crate::config::Settings;
use crate::error::{Context, Result};

use super::page::{fetch_page_once, PageOutcome, PageRequest, RawRecord};
use super::retry::RetryPolicy;
use super::{ensure_concurrency_limit, PAGE_CONCURRENCY_LIMIT};

/// Source of page outcomes. The production implementation talks HTTP; tests
/// script outcomes directly.
#[async_trait]
pub trait PageSource: Send + Sync {
    async fn fetch(&self, request: &PageRequest) -> PageOutcome;
}

/// Live page source: one GET per attempt, wrapped by the retry policy.
pub struct HttpPageSource {
    client: Client,
    endpoint: String,
    api_key: Option<String>,
    volume_cutoff: f64,
    retry: RetryPolicy,
}

impl HttpPageSource {
    pub fn from_settings(settings: &Settings) -> Result<Self> {
        let client = Client::builder()
            .timeout(settings.request_timeout)
            .build()
            .context("Failed to construct page fetch HTTP client")?;

        Ok(Self {
            client,
            endpoint: settings.coins_api_url.clone(),
            api_key: settings.gecko_api_key.clone(),
            volume_cutoff: settings.volume_cutoff,
            retry: RetryPolicy::new(settings.max_attempts, settings.base_backoff),
        })
    }
}

#[async_trait]
impl PageSource for HttpPageSource {
    async fn fetch(&self, request: &PageRequest) -> PageOutcome {
        self.retry
            .run(|| {
                fetch_page_once(
                    &self.client,
                    &self.endpoint,
                    self.api_key.as_deref(),
                    request,
                    self.volume_cutoff,
                )
            })
            .await
    }
}

/// How page requests are admitted against the upstream rate limit.
#[derive(Debug, Clone, Copy)]
pub enum Pacing {
    /// At most `limit` requests in flight at once.
    Concurrent { limit: usize },
    /// One request at a time with a minimum delay between them, for upstreams
    /// with no burst tolerance.
    Serial { spacing: Duration },
}

impl Default for Pacing {
    fn default() -> Self {
        Pacing::Concurrent {
            limit: PAGE_CONCURRENCY_LIMIT,
        }
    }
}

/// The page-slot layout of one run.
#[derive(Debug, Clone)]
pub struct FetchPlan {
    pub pages: u32,
    pub per_page: u32,
    pub vs_currency: String,
    pub order: String,
}

impl Default for FetchPlan {
    fn default() -> Self {
        Self {
            pages: 8,
            per_page: 250,
            vs_currency: "usd".to_string(),
            order: "market_cap_desc".to_string(),
        }
    }
}

impl FetchPlan {
    pub fn from_settings(settings: &Settings) -> Self {
        Self {
            pages: settings.pages,
            per_page: settings.per_page,
            ..Self::default()
        }
    }

    fn request(&self, page: u32) -> PageRequest {
        PageRequest {
            page,
            per_page: self.per_page,
            vs_currency: self.vs_currency.clone(),
            order: self.order.clone(),
        }
    }
}

/// Fetches all page slots and merges them into the sequence a strictly
/// sequential fetch-until-stop would have produced.
pub struct CoinMarketFetcher {
    source: Arc<dyn PageSource>,
    plan: FetchPlan,
    pacing: Pacing,
    cancel: CancellationToken,
}

impl CoinMarketFetcher {
    pub fn new(source: Arc<dyn PageSource>, plan: FetchPlan, pacing: Pacing) -> Self {
        Self::with_cancellation(source, plan, pacing, CancellationToken::new())
    }

    pub fn with_cancellation(
        source: Arc<dyn PageSource>,
        plan: FetchPlan,
        pacing: Pacing,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            source,
            plan,
            pacing,
            cancel,
        }
    }

    /// Fetch every page slot and reduce the outcomes in page-index order.
    /// Completion order never influences the result; a cancelled run yields a
    /// shorter, still contiguous prefix.
    pub async fn fetch_all(&self) -> Vec<RawRecord> {
        let outcomes = match self.pacing {
            Pacing::Concurrent { limit } => self.fetch_concurrent(limit).await,
            Pacing::Serial { spacing } => self.fetch_serial(spacing).await,
        };

        merge_in_page_order(outcomes)
    }

    async fn fetch_concurrent(&self, limit: usize) -> Vec<(u32, PageOutcome)> {
        let limit = ensure_concurrency_limit(limit);
        let semaphore = Arc::new(Semaphore::new(limit));

        // Fan out all page slots at once; the semaphore keeps the in-flight
        // count at or under the ceiling regardless of stream buffering.
        stream::iter(1..=self.plan.pages)
            .map(|page| {
                let semaphore = Arc::clone(&semaphore);
                let source = Arc::clone(&self.source);
                let cancel = self.cancel.clone();
                let request = self.plan.request(page);
                async move {
                    let _permit = semaphore.acquire().await.unwrap();
                    // Biased so an already-cancelled run never starts a fetch.
                    let outcome = tokio::select! {
                        biased;
                        _ = cancel.cancelled() => PageOutcome::Empty,
                        outcome = source.fetch(&request) => outcome,
                    };
                    log::debug!("page {} resolved: {}", page, outcome_tag(&outcome));
                    (page, outcome)
                }
            })
            .buffer_unordered(limit)
            .collect()
            .await
    }

    async fn fetch_serial(&self, spacing: Duration) -> Vec<(u32, PageOutcome)> {
        let mut outcomes = Vec::with_capacity(self.plan.pages as usize);

        for page in 1..=self.plan.pages {
            if page > 1 {
                tokio::select! {
                    _ = self.cancel.cancelled() => {}
                    _ = sleep(spacing) => {}
                }
            }

            if self.cancel.is_cancelled() {
                outcomes.push((page, PageOutcome::Empty));
                break;
            }

            let request = self.plan.request(page);
            let outcome = tokio::select! {
                biased;
                _ = self.cancel.cancelled() => PageOutcome::Empty,
                outcome = self.source.fetch(&request) => outcome,
            };
            log::debug!("page {} resolved: {}", page, outcome_tag(&outcome));

            let boundary = outcome.is_boundary();
            outcomes.push((page, outcome));
            if boundary {
                break;
            }
        }

        outcomes
    }
}

fn outcome_tag(outcome: &PageOutcome) -> &'static str {
    match outcome {
        PageOutcome::Records(_) => "records",
        PageOutcome::Empty => "empty",
        PageOutcome::Stop => "stop",
        PageOutcome::TransientFailure(_) => "transient failure",
        PageOutcome::FatalFailure(_) => "fatal failure",
    }
}

/// Reduce per-page outcomes into one ordered record sequence.
///
/// Outcomes are walked in page-index order, never completion order. The first
/// non-`Records` outcome truncates the sequence there and every later page is
/// discarded, even one that fetched successfully: a concurrent fetch must not
/// leak data past a boundary an earlier page established.
pub fn merge_in_page_order(mut outcomes: Vec<(u32, PageOutcome)>) -> Vec<RawRecord> {
    outcomes.sort_by_key(|(page, _)| *page);

    let mut merged = Vec::new();
    for (page, outcome) in outcomes {
        match outcome {
            PageOutcome::Records(records) => {
                log::info!("page {}: {} records", page, records.len());
                merged.extend(records);
            }
            PageOutcome::Stop => {
                log::info!("stopping at page {} (low volume)", page);
                break;
            }
            PageOutcome::Empty => {
                log::info!("page {} empty, stopping", page);
                break;
            }
            PageOutcome::TransientFailure(reason) | PageOutcome::FatalFailure(reason) => {
                log::warn!("truncating at page {}: {}", page, reason);
                break;
            }
        }
    }

    merged
}
