//! Change tracking - remembers which record identifiers were already reported
//!
//! The seen-set lives for the whole process and is only touched between
//! fetches, never from the concurrent page workers.

use crate::record::{extract_id, Record};
use std::collections::HashSet;
use tracing::{debug, warn};

/// Identifiers observed in previous cycles
///
/// Grows monotonically. Nothing is ever removed.
#[derive(Debug, Default, Clone)]
pub struct SeenSet {
    ids: HashSet<i64>,
}

impl SeenSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn contains(&self, id: i64) -> bool {
        self.ids.contains(&id)
    }

    pub fn insert(&mut self, id: i64) {
        self.ids.insert(id);
    }

    pub fn len(&self) -> usize {
        self.ids.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ids.is_empty()
    }
}

impl FromIterator<i64> for SeenSet {
    fn from_iter<I: IntoIterator<Item = i64>>(iter: I) -> Self {
        Self {
            ids: iter.into_iter().collect(),
        }
    }
}

/// Outcome of classifying one batch against the seen-set
#[derive(Debug, Default, Clone)]
pub struct Classification {
    /// Records whose identifier was absent before this batch, in input order
    pub new_records: Vec<Record>,
    /// Every identifier successfully extracted from the batch
    pub ids: Vec<i64>,
    /// Records skipped because their identifier could not be resolved
    pub skipped: usize,
}

/// Classifies fetched records as new or already seen
#[derive(Debug, Default)]
pub struct ChangeTracker {
    seen: SeenSet,
}

impl ChangeTracker {
    pub fn new(seen: SeenSet) -> Self {
        Self { seen }
    }

    pub fn seen(&self) -> &SeenSet {
        &self.seen
    }

    /// Classify a batch without touching the seen-set
    ///
    /// Every record is compared against the seen-set as it was before the
    /// batch, so a duplicate identifier inside the batch is new for each
    /// occurrence.
    pub fn detect(&self, records: &[Record]) -> Classification {
        let mut classification = Classification::default();

        for record in records {
            let id = match extract_id(record) {
                Ok(id) => id,
                Err(e) => {
                    warn!("Skipping record during classification: {}", e);
                    classification.skipped += 1;
                    continue;
                }
            };

            if !self.seen.contains(id) {
                classification.new_records.push(record.clone());
            }
            classification.ids.push(id);
        }

        debug!(
            "Classified {} records: {} new, {} skipped",
            records.len(),
            classification.new_records.len(),
            classification.skipped
        );

        classification
    }

    /// Record identifiers as seen
    pub fn mark_seen(&mut self, ids: &[i64]) {
        for id in ids {
            self.seen.insert(*id);
        }
    }

    /// Classify a batch and mark all of its identifiers as seen
    pub fn classify(&mut self, records: &[Record]) -> Vec<Record> {
        let classification = self.detect(records);
        self.mark_seen(&classification.ids);
        classification.new_records
    }
}
