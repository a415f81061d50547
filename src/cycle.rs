//! Sync Cycle - one fetch, classify and persist pass over all collections
//!
//! The primary collection drives change detection; auxiliary collections
//! (reference data such as states) are fetched and stored alongside it but
//! never reported.

use crate::collector::ConcurrentCollector;
use crate::config::{Config, SeenUpdate};
use crate::record::Record;
use crate::source::{FetchError, PageFetcher, RemoteSession};
use crate::store::Backend;
use crate::tracker::{ChangeTracker, SeenSet};
use crate::upsert::{BatchUpserter, UpsertError};
use anyhow::{anyhow, Result};
use std::fmt;
use std::sync::Arc;
use std::time::Instant;
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

/// Where a cycle currently is
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CycleState {
    Idle,
    Fetching,
    Classifying,
    Persisting,
    Done,
    Failed,
}

impl fmt::Display for CycleState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            CycleState::Idle => "idle",
            CycleState::Fetching => "fetching",
            CycleState::Classifying => "classifying",
            CycleState::Persisting => "persisting",
            CycleState::Done => "done",
            CycleState::Failed => "failed",
        };
        f.write_str(name)
    }
}

/// Reasons a cycle ends in [`CycleState::Failed`]
#[derive(Debug, Error)]
pub enum CycleError {
    #[error("failed to fetch '{collection}': {source}")]
    Fetch {
        collection: String,
        #[source]
        source: FetchError,
    },

    #[error("failed to persist '{collection}': {source}")]
    Persist {
        collection: String,
        #[source]
        source: UpsertError,
    },
}

/// A named remote collection
#[derive(Clone)]
pub struct CollectionSource {
    pub name: String,
    pub fetcher: Arc<dyn PageFetcher>,
}

impl CollectionSource {
    pub fn new(name: impl Into<String>, fetcher: Arc<dyn PageFetcher>) -> Self {
        Self {
            name: name.into(),
            fetcher,
        }
    }
}

/// Runs fetch-merge-detect-persist passes and carries the seen-set between them
pub struct SyncCycle {
    collector: ConcurrentCollector,
    primary: CollectionSource,
    auxiliary: Vec<CollectionSource>,
    tracker: ChangeTracker,
    upserter: BatchUpserter,
    seen_update: SeenUpdate,
    state: CycleState,
}

impl SyncCycle {
    pub fn new(
        collector: ConcurrentCollector,
        primary: CollectionSource,
        upserter: BatchUpserter,
    ) -> Self {
        Self {
            collector,
            primary,
            auxiliary: Vec::new(),
            tracker: ChangeTracker::default(),
            upserter,
            seen_update: SeenUpdate::default(),
            state: CycleState::Idle,
        }
    }

    /// Add a collection that is fetched and stored but not reported
    pub fn with_auxiliary(mut self, source: CollectionSource) -> Self {
        self.auxiliary.push(source);
        self
    }

    /// Start from an already known set of identifiers
    pub fn with_seen(mut self, seen: SeenSet) -> Self {
        self.tracker = ChangeTracker::new(seen);
        self
    }

    pub fn with_seen_update(mut self, seen_update: SeenUpdate) -> Self {
        self.seen_update = seen_update;
        self
    }

    /// Build a cycle for every configured collection
    pub fn from_config(
        config: &Config,
        session: &RemoteSession,
        backend: Arc<dyn Backend>,
    ) -> Result<Self> {
        let source = &config.source;
        let primary = source
            .primary_collection()
            .ok_or_else(|| anyhow!("No primary collection configured"))?;

        let collector = ConcurrentCollector::new(source.page_size, source.max_concurrency);
        let upserter = BatchUpserter::new(
            backend,
            &config.storage.allowed_collections,
            config.storage.transaction_timeout(),
            config.storage.statement_timeout(),
        );

        let mut cycle = Self::new(
            collector,
            CollectionSource::new(&primary.name, Arc::new(session.fetcher(primary))),
            upserter,
        )
        .with_seen_update(config.sync.seen_update);

        for collection in source.collections.iter().filter(|c| !c.primary) {
            cycle = cycle.with_auxiliary(CollectionSource::new(
                &collection.name,
                Arc::new(session.fetcher(collection)),
            ));
        }

        Ok(cycle)
    }

    pub fn state(&self) -> CycleState {
        self.state
    }

    pub fn seen(&self) -> &SeenSet {
        self.tracker.seen()
    }

    pub fn primary_name(&self) -> &str {
        &self.primary.name
    }

    /// Run one pass and return the primary collection's new records
    ///
    /// A fetch failure leaves the seen-set untouched and persists nothing.
    ///
    /// With the default [`SeenUpdate::AfterPersist`] identifiers enter the
    /// seen-set only once every collection has been stored, so records from a
    /// cycle whose persistence failed are reported as new again next cycle.
    /// [`SeenUpdate::AfterClassify`] marks them during classification and
    /// keeps them marked even when persistence fails.
    pub async fn run_cycle(&mut self, cancel: &CancellationToken) -> Result<Vec<Record>, CycleError> {
        let start_time = Instant::now();
        info!("Starting sync cycle for '{}'", self.primary.name);

        self.state = CycleState::Fetching;
        let primary_records = self.fetch(&self.primary, cancel).await;
        let primary_records = self.check(primary_records)?;

        let mut auxiliary = Vec::with_capacity(self.auxiliary.len());
        for source in &self.auxiliary {
            let records = self.fetch(source, cancel).await;
            auxiliary.push((source.name.clone(), records));
        }
        let auxiliary = auxiliary
            .into_iter()
            .map(|(name, records)| records.map(|records| (name, records)))
            .collect::<Result<Vec<_>, _>>();
        let auxiliary = self.check(auxiliary)?;

        self.state = CycleState::Classifying;
        let classification = self.tracker.detect(&primary_records);
        if self.seen_update == SeenUpdate::AfterClassify {
            self.tracker.mark_seen(&classification.ids);
        }

        self.state = CycleState::Persisting;
        let persisted = self.persist(&self.primary.name, &primary_records).await;
        self.check(persisted)?;
        for (name, records) in &auxiliary {
            let persisted = self.persist(name, records).await;
            self.check(persisted)?;
        }

        if self.seen_update == SeenUpdate::AfterPersist {
            self.tracker.mark_seen(&classification.ids);
        }

        self.state = CycleState::Done;
        info!(
            "Sync cycle finished in {:.2}s: {} records, {} new, {} known",
            start_time.elapsed().as_secs_f64(),
            primary_records.len(),
            classification.new_records.len(),
            self.tracker.seen().len()
        );

        Ok(classification.new_records)
    }

    async fn fetch(
        &self,
        source: &CollectionSource,
        cancel: &CancellationToken,
    ) -> Result<Vec<Record>, CycleError> {
        debug!("Fetching collection '{}'", source.name);
        self.collector
            .fetch_all(source.fetcher.as_ref(), cancel)
            .await
            .map_err(|source_err| CycleError::Fetch {
                collection: source.name.clone(),
                source: source_err,
            })
    }

    async fn persist(&self, collection: &str, records: &[Record]) -> Result<(), CycleError> {
        let report = self
            .upserter
            .upsert(collection, records)
            .await
            .map_err(|source| CycleError::Persist {
                collection: collection.to_string(),
                source,
            })?;
        debug!("Stored {} records in '{}'", report.written, report.collection);
        Ok(())
    }

    /// Move to `Failed` when a phase returned an error
    fn check<T>(&mut self, result: Result<T, CycleError>) -> Result<T, CycleError> {
        if let Err(e) = &result {
            error!("Sync cycle failed while {}: {}", self.state, e);
            self.state = CycleState::Failed;
        }
        result
    }
}
