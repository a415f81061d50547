//! Concurrent Collector - fetches every page of a collection in parallel
//!
//! Page 0 is fetched first because it is the only request that returns the
//! authoritative record count. The remaining pages are produced lazily and
//! fetched through a bounded `buffer_unordered` stream, so the server's count
//! never decides how many requests are pending at once. Results are merged
//! into one snapshot keyed by record identifier.

use crate::record::{CollectionSnapshot, Record};
use crate::source::{FetchError, PageFetcher};
use futures::stream::{self, StreamExt};
use std::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Default number of page requests in flight
pub const DEFAULT_MAX_CONCURRENCY: usize = 5;

/// Number of pages needed for `total` records
pub fn page_count(total: u64, page_size: usize) -> usize {
    if page_size == 0 {
        return 0;
    }
    total.div_ceil(page_size as u64) as usize
}

/// Fetches and merges all pages of one collection
#[derive(Debug, Clone)]
pub struct ConcurrentCollector {
    page_size: usize,
    max_concurrency: usize,
}

impl ConcurrentCollector {
    pub fn new(page_size: usize, max_concurrency: usize) -> Self {
        Self {
            page_size,
            max_concurrency: max_concurrency.max(1),
        }
    }

    pub fn page_size(&self) -> usize {
        self.page_size
    }

    pub fn max_concurrency(&self) -> usize {
        self.max_concurrency
    }

    /// Fetch every page and return the merged records ordered by identifier
    ///
    /// The first failing page cancels all other requests and fails the
    /// whole collection; partial results are never returned.
    pub async fn fetch_all(
        &self,
        fetcher: &dyn PageFetcher,
        cancel: &CancellationToken,
    ) -> Result<Vec<Record>, FetchError> {
        let snapshot = self.collect(fetcher, cancel).await?;
        Ok(snapshot.into_records())
    }

    /// Same as [`fetch_all`](Self::fetch_all) but keeps the snapshot form
    pub async fn collect(
        &self,
        fetcher: &dyn PageFetcher,
        cancel: &CancellationToken,
    ) -> Result<CollectionSnapshot, FetchError> {
        let start_time = Instant::now();

        let first = fetch_cancellable(fetcher, 0, self.page_size, true, cancel)
            .await
            .map_err(|e| e.on_page(0))?;

        let total = first.total.unwrap_or_else(|| {
            warn!("First page carried no total count, assuming a single page");
            0
        });

        let mut snapshot = CollectionSnapshot::new();
        let mut dropped = snapshot.merge(first.items);

        let pages = page_count(total, self.page_size);
        if pages <= 1 {
            debug!("Collection fits in one page ({} records)", snapshot.len());
            return Ok(snapshot);
        }

        info!(
            "Fetching {} pages ({} records) with concurrency {}",
            pages, total, self.max_concurrency
        );

        // Cancelling the child stops in-flight fetches without touching the caller's token
        let cancel = cancel.child_token();
        let token = &cancel;
        let page_size = self.page_size;

        // Lazy stream: at most `max_concurrency` page futures exist at once
        let mut in_flight = stream::iter(1..pages)
            .map(move |page| async move {
                fetch_cancellable(fetcher, page.saturating_mul(page_size), page_size, false, token)
                    .await
                    .map(|result| (page, result.items))
                    .map_err(|e| e.on_page(page))
            })
            .buffer_unordered(self.max_concurrency);

        while let Some(result) = in_flight.next().await {
            match result {
                Ok((page, items)) => {
                    debug!("Page {} returned {} records", page, items.len());
                    dropped += snapshot.merge(items);
                }
                Err(e) => {
                    warn!("Collection fetch failed, cancelling remaining pages: {}", e);
                    cancel.cancel();
                    return Err(e);
                }
            }
        }

        if dropped > 0 {
            warn!("Dropped {} records without a usable identifier", dropped);
        }

        info!(
            "Collected {} distinct records from {} pages in {:.2}s",
            snapshot.len(),
            pages,
            start_time.elapsed().as_secs_f64()
        );

        Ok(snapshot)
    }
}

impl Default for ConcurrentCollector {
    fn default() -> Self {
        Self::new(500, DEFAULT_MAX_CONCURRENCY)
    }
}

/// Race one page request against cancellation
async fn fetch_cancellable(
    fetcher: &dyn PageFetcher,
    skip: usize,
    take: usize,
    with_count: bool,
    cancel: &CancellationToken,
) -> Result<crate::source::PageResult, FetchError> {
    tokio::select! {
        result = fetcher.fetch_page(skip, take, with_count) => result,
        _ = cancel.cancelled() => Err(FetchError::Cancelled),
    }
}
