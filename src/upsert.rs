//! Batch upserts - all-or-nothing persistence of one collection snapshot
//!
//! Per-record problems (bad identifier, encoding failure, statement error or
//! timeout) are collected while the batch is applied. If any occurred the
//! transaction is rolled back and every collected error is reported.

use crate::record::{extract_id, IdError, Record};
use crate::store::{Backend, StoreError, Transaction};
use regex::Regex;
use std::collections::HashSet;
use std::fmt;
use std::sync::{Arc, OnceLock};
use std::time::Duration;
use thiserror::Error;
use tokio::time::{timeout, timeout_at, Instant};
use tracing::{debug, error, info, warn};

/// Why a collection name was refused
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InvalidTargetReason {
    Empty,
    UnsafeCharacters,
    NotAllowed,
}

impl fmt::Display for InvalidTargetReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let text = match self {
            InvalidTargetReason::Empty => "name is empty",
            InvalidTargetReason::UnsafeCharacters => {
                "only letters, digits and underscores are allowed"
            }
            InvalidTargetReason::NotAllowed => "collection is not in the allow-list",
        };
        f.write_str(text)
    }
}

/// What went wrong with a single record
#[derive(Debug, Error)]
pub enum RecordFailure {
    #[error("encoding failed: {0}")]
    Encode(String),

    #[error(transparent)]
    Id(#[from] IdError),

    #[error("upsert failed: {0}")]
    Exec(#[source] StoreError),

    #[error("upsert timed out after {0:?}")]
    Timeout(Duration),
}

/// A per-record failure, located by position in the batch
#[derive(Debug, Error)]
#[error("record at index {index}{}: {failure}", id_suffix(.id))]
pub struct RecordError {
    /// Zero-based position of the record in the submitted batch
    pub index: usize,
    pub id: Option<i64>,
    #[source]
    pub failure: RecordFailure,
}

fn id_suffix(id: &Option<i64>) -> String {
    id.map(|id| format!(" (id {id})")).unwrap_or_default()
}

/// Errors from [`BatchUpserter::upsert`]
#[derive(Debug, Error)]
pub enum UpsertError {
    #[error("invalid target collection '{name}': {reason}")]
    InvalidTarget {
        name: String,
        reason: InvalidTargetReason,
    },

    #[error("failed to begin transaction: {0}")]
    Begin(#[source] StoreError),

    #[error("{} of {total} records in '{collection}' failed, batch rolled back: {}", .errors.len(), join_errors(.errors))]
    Records {
        collection: String,
        total: usize,
        errors: Vec<RecordError>,
    },

    #[error("transaction for '{collection}' exceeded {limit:?}, batch rolled back")]
    Timeout { collection: String, limit: Duration },

    #[error("failed to commit '{collection}': {source}{}", rollback_suffix(.rollback))]
    Commit {
        collection: String,
        #[source]
        source: StoreError,
        rollback: Option<StoreError>,
    },
}

fn join_errors(errors: &[RecordError]) -> String {
    errors
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join("; ")
}

fn rollback_suffix(rollback: &Option<StoreError>) -> String {
    rollback
        .as_ref()
        .map(|e| format!(" (rollback also failed: {e})"))
        .unwrap_or_default()
}

/// Summary of a committed batch
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UpsertReport {
    pub collection: String,
    pub written: usize,
}

fn identifier_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| Regex::new(r"^[A-Za-z0-9_]+$").expect("static pattern is valid"))
}

/// Check that a name is safe to splice into a statement as a table name
pub fn is_safe_identifier(name: &str) -> bool {
    identifier_pattern().is_match(name)
}

/// Writes record batches into allow-listed collections
#[derive(Clone)]
pub struct BatchUpserter {
    backend: Arc<dyn Backend>,
    allowed: HashSet<String>,
    transaction_timeout: Duration,
    statement_timeout: Duration,
}

impl BatchUpserter {
    pub fn new(
        backend: Arc<dyn Backend>,
        allowed: &[String],
        transaction_timeout: Duration,
        statement_timeout: Duration,
    ) -> Self {
        Self {
            backend,
            allowed: allowed.iter().map(|name| name.to_lowercase()).collect(),
            transaction_timeout,
            statement_timeout,
        }
    }

    /// Validate a collection name, returning the canonical table name
    pub fn validate_target(&self, name: &str) -> Result<String, UpsertError> {
        let invalid = |reason| UpsertError::InvalidTarget {
            name: name.to_string(),
            reason,
        };

        if name.is_empty() {
            return Err(invalid(InvalidTargetReason::Empty));
        }
        if !is_safe_identifier(name) {
            return Err(invalid(InvalidTargetReason::UnsafeCharacters));
        }

        let canonical = name.to_lowercase();
        if !self.allowed.contains(&canonical) {
            return Err(invalid(InvalidTargetReason::NotAllowed));
        }
        Ok(canonical)
    }

    /// Persist a batch atomically, keyed by record identifier
    pub async fn upsert(
        &self,
        collection: &str,
        records: &[Record],
    ) -> Result<UpsertReport, UpsertError> {
        let table = self.validate_target(collection)?;

        if records.is_empty() {
            info!("No records to store in '{}'", table);
            return Ok(UpsertReport {
                collection: table,
                written: 0,
            });
        }

        let deadline = Instant::now() + self.transaction_timeout;

        let mut tx = match timeout_at(deadline, self.backend.begin()).await {
            Ok(Ok(tx)) => tx,
            Ok(Err(e)) => return Err(UpsertError::Begin(e)),
            Err(_) => {
                return Err(UpsertError::Timeout {
                    collection: table,
                    limit: self.transaction_timeout,
                })
            }
        };

        let applied = timeout_at(deadline, self.apply(tx.as_mut(), &table, records, deadline)).await;
        let errors = match applied {
            Ok(errors) if Instant::now() < deadline => errors,
            _ => {
                warn!("Transaction for '{}' exceeded its deadline", table);
                rollback_logged(tx.as_mut(), &table).await;
                return Err(UpsertError::Timeout {
                    collection: table,
                    limit: self.transaction_timeout,
                });
            }
        };

        if !errors.is_empty() {
            warn!(
                "{} of {} records in '{}' failed, rolling back",
                errors.len(),
                records.len(),
                table
            );
            rollback_logged(tx.as_mut(), &table).await;
            return Err(UpsertError::Records {
                collection: table,
                total: records.len(),
                errors,
            });
        }

        tx.set_deadline(Some(deadline.into_std()));
        if let Err(source) = tx.commit().await {
            error!("Commit for '{}' failed: {}", table, source);
            let rollback = tx.rollback().await.err();
            return Err(UpsertError::Commit {
                collection: table,
                source,
                rollback,
            });
        }

        info!("Stored {} records in '{}'", records.len(), table);
        Ok(UpsertReport {
            collection: table,
            written: records.len(),
        })
    }

    /// Apply every record, returning the failures collected along the way
    async fn apply(
        &self,
        tx: &mut dyn Transaction,
        table: &str,
        records: &[Record],
        deadline: Instant,
    ) -> Vec<RecordError> {
        let mut errors = Vec::new();

        for (index, record) in records.iter().enumerate() {
            let payload = match serde_json::to_vec(record) {
                Ok(payload) => payload,
                Err(e) => {
                    errors.push(RecordError {
                        index,
                        id: None,
                        failure: RecordFailure::Encode(e.to_string()),
                    });
                    continue;
                }
            };

            let id = match extract_id(record) {
                Ok(id) => id,
                Err(e) => {
                    warn!("Record {} in '{}' has no usable id: {}", index, table, e);
                    errors.push(RecordError {
                        index,
                        id: None,
                        failure: e.into(),
                    });
                    continue;
                }
            };

            // Blocking backends enforce the limit themselves
            let statement_deadline = (Instant::now() + self.statement_timeout).min(deadline);
            tx.set_deadline(Some(statement_deadline.into_std()));

            let failure = match timeout(self.statement_timeout, tx.upsert(table, id, &payload)).await
            {
                Ok(Ok(())) => continue,
                Ok(Err(StoreError::DeadlineExceeded)) | Err(_) => {
                    RecordFailure::Timeout(self.statement_timeout)
                }
                Ok(Err(e)) => RecordFailure::Exec(e),
            };

            warn!("Upsert of id {} into '{}' failed: {}", id, table, failure);
            let ended = matches!(failure, RecordFailure::Exec(StoreError::Inactive));
            errors.push(RecordError {
                index,
                id: Some(id),
                failure,
            });

            if ended {
                warn!(
                    "Transaction for '{}' ended early, skipping {} remaining records",
                    table,
                    records.len() - index - 1
                );
                break;
            }
        }

        debug!(
            "Applied {} records to '{}' with {} failures",
            records.len(),
            table,
            errors.len()
        );
        errors
    }
}

async fn rollback_logged(tx: &mut dyn Transaction, table: &str) {
    if let Err(e) = tx.rollback().await {
        error!("Rollback for '{}' failed: {}", table, e);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::SqliteStore;
    use assert_matches::assert_matches;
    use async_trait::async_trait;
    use serde_json::json;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;

    /// Backend recording every call, with configurable failures
    #[derive(Default)]
    struct RecordingBackend {
        begins: AtomicUsize,
        committed: Arc<Mutex<Vec<(String, i64)>>>,
        rolled_back: Arc<AtomicUsize>,
        fail_id: Option<i64>,
        slow_id: Option<i64>,
        fail_commit: bool,
    }

    struct RecordingTransaction {
        pending: Vec<(String, i64)>,
        committed: Arc<Mutex<Vec<(String, i64)>>>,
        rolled_back: Arc<AtomicUsize>,
        fail_id: Option<i64>,
        slow_id: Option<i64>,
        fail_commit: bool,
    }

    #[async_trait]
    impl Backend for RecordingBackend {
        async fn begin(&self) -> Result<Box<dyn Transaction>, StoreError> {
            self.begins.fetch_add(1, Ordering::SeqCst);
            Ok(Box::new(RecordingTransaction {
                pending: Vec::new(),
                committed: self.committed.clone(),
                rolled_back: self.rolled_back.clone(),
                fail_id: self.fail_id,
                slow_id: self.slow_id,
                fail_commit: self.fail_commit,
            }))
        }
    }

    #[async_trait]
    impl Transaction for RecordingTransaction {
        async fn upsert(
            &mut self,
            collection: &str,
            id: i64,
            _payload: &[u8],
        ) -> Result<(), StoreError> {
            if self.slow_id == Some(id) {
                tokio::time::sleep(Duration::from_secs(5)).await;
            }
            if self.fail_id == Some(id) {
                return Err(StoreError::Backend("constraint violated".to_string()));
            }
            self.pending.push((collection.to_string(), id));
            Ok(())
        }

        async fn commit(&mut self) -> Result<(), StoreError> {
            if self.fail_commit {
                return Err(StoreError::Backend("disk full".to_string()));
            }
            self.committed
                .lock()
                .unwrap()
                .extend(self.pending.drain(..));
            Ok(())
        }

        async fn rollback(&mut self) -> Result<(), StoreError> {
            self.pending.clear();
            self.rolled_back.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    fn upserter(backend: Arc<RecordingBackend>) -> BatchUpserter {
        BatchUpserter::new(
            backend,
            &["contracts".to_string(), "states".to_string()],
            Duration::from_secs(2),
            Duration::from_millis(50),
        )
    }

    fn batch(ids: &[serde_json::Value]) -> Vec<Record> {
        ids.iter()
            .map(|id| json!({"id": id, "payload": "x"}).as_object().unwrap().clone())
            .collect()
    }

    #[tokio::test]
    async fn test_upsert_commits_all_records() {
        let backend = Arc::new(RecordingBackend::default());
        let upserter = upserter(backend.clone());

        let report = upserter
            .upsert("contracts", &batch(&[json!(1), json!("2"), json!(3.0)]))
            .await
            .unwrap();

        assert_eq!(report.written, 3);
        let committed = backend.committed.lock().unwrap().clone();
        let ids: Vec<i64> = committed.iter().map(|(_, id)| *id).collect();
        assert_eq!(ids, vec![1, 2, 3]);
        assert!(committed.iter().all(|(c, _)| c == "contracts"));
    }

    #[tokio::test]
    async fn test_empty_batch_opens_no_transaction() {
        let backend = Arc::new(RecordingBackend::default());
        let upserter = upserter(backend.clone());

        let report = upserter.upsert("contracts", &[]).await.unwrap();
        assert_eq!(report.written, 0);
        assert_eq!(backend.begins.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_disallowed_collection_rejected_before_io() {
        let backend = Arc::new(RecordingBackend::default());
        let upserter = upserter(backend.clone());

        let result = upserter.upsert("lots", &batch(&[json!(1)])).await;
        assert_matches!(
            result,
            Err(UpsertError::InvalidTarget {
                reason: InvalidTargetReason::NotAllowed,
                ..
            })
        );
        assert_eq!(backend.begins.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_unsafe_collection_names_rejected() {
        let backend = Arc::new(RecordingBackend::default());
        let upserter = upserter(backend.clone());

        for name in ["contracts; DROP TABLE states", "contracts--", "con tracts"] {
            assert_matches!(
                upserter.upsert(name, &batch(&[json!(1)])).await,
                Err(UpsertError::InvalidTarget {
                    reason: InvalidTargetReason::UnsafeCharacters,
                    ..
                })
            );
        }
        assert_matches!(
            upserter.upsert("", &[]).await,
            Err(UpsertError::InvalidTarget {
                reason: InvalidTargetReason::Empty,
                ..
            })
        );
        assert_eq!(backend.begins.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_allow_list_is_case_insensitive() {
        let backend = Arc::new(RecordingBackend::default());
        let upserter = upserter(backend.clone());

        let report = upserter.upsert("Contracts", &batch(&[json!(1)])).await.unwrap();
        assert_eq!(report.collection, "contracts");
    }

    #[tokio::test]
    async fn test_bad_record_aborts_whole_batch() {
        let backend = Arc::new(RecordingBackend::default());
        let upserter = upserter(backend.clone());

        let records = batch(&[json!(1), json!(2), json!("three"), json!(4), json!(5)]);
        let err = upserter.upsert("contracts", &records).await.unwrap_err();

        match &err {
            UpsertError::Records { errors, total, .. } => {
                assert_eq!(*total, 5);
                assert_eq!(errors.len(), 1);
                assert_eq!(errors[0].index, 2);
                assert_matches!(errors[0].failure, RecordFailure::Id(_));
            }
            other => panic!("unexpected error: {other}"),
        }
        assert!(err.to_string().contains("index 2"));
        assert!(backend.committed.lock().unwrap().is_empty());
        assert_eq!(backend.rolled_back.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_all_record_failures_are_reported() {
        let backend = Arc::new(RecordingBackend {
            fail_id: Some(4),
            ..Default::default()
        });
        let upserter = upserter(backend.clone());

        let records = batch(&[json!(1), json!(null), json!(3), json!(4)]);
        let err = upserter.upsert("states", &records).await.unwrap_err();

        assert_matches!(&err, UpsertError::Records { errors, .. } if errors.len() == 2);
        if let UpsertError::Records { errors, .. } = err {
            assert_eq!(errors[0].index, 1);
            assert_eq!(errors[1].index, 3);
            assert_eq!(errors[1].id, Some(4));
            assert_matches!(errors[1].failure, RecordFailure::Exec(_));
        }
        assert!(backend.committed.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_slow_record_times_out_individually() {
        let backend = Arc::new(RecordingBackend {
            slow_id: Some(2),
            ..Default::default()
        });
        let upserter = upserter(backend.clone());

        let err = upserter
            .upsert("contracts", &batch(&[json!(1), json!(2), json!(3)]))
            .await
            .unwrap_err();

        if let UpsertError::Records { errors, .. } = err {
            assert_eq!(errors.len(), 1);
            assert_eq!(errors[0].id, Some(2));
            assert_matches!(errors[0].failure, RecordFailure::Timeout(_));
        } else {
            panic!("expected per-record errors");
        }
        assert!(backend.committed.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_transaction_deadline_rolls_back() {
        let backend = Arc::new(RecordingBackend {
            slow_id: Some(1),
            ..Default::default()
        });
        let upserter = BatchUpserter::new(
            backend.clone(),
            &["contracts".to_string()],
            Duration::from_millis(20),
            Duration::from_secs(10),
        );

        let err = upserter
            .upsert("contracts", &batch(&[json!(1)]))
            .await
            .unwrap_err();
        assert_matches!(err, UpsertError::Timeout { .. });
        assert_eq!(backend.rolled_back.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_commit_failure_attempts_rollback() {
        let backend = Arc::new(RecordingBackend {
            fail_commit: true,
            ..Default::default()
        });
        let upserter = upserter(backend.clone());

        let err = upserter
            .upsert("contracts", &batch(&[json!(1)]))
            .await
            .unwrap_err();
        assert_matches!(err, UpsertError::Commit { rollback: None, .. });
        assert_eq!(backend.rolled_back.load(Ordering::SeqCst), 1);
    }

    fn sqlite_upserter(store: &SqliteStore, statement_timeout: Duration) -> BatchUpserter {
        BatchUpserter::new(
            Arc::new(store.clone()),
            &["contracts".to_string(), "states".to_string()],
            Duration::from_secs(5),
            statement_timeout,
        )
    }

    fn sqlite_store() -> SqliteStore {
        SqliteStore::open_in_memory(&["contracts".to_string(), "states".to_string()]).unwrap()
    }

    #[tokio::test]
    async fn test_sqlite_batch_commits_and_overwrites() {
        let store = sqlite_store();
        let upserter = sqlite_upserter(&store, Duration::from_secs(1));

        let ids: Vec<_> = (1..=5).map(|id| json!(id)).collect();
        let report = upserter.upsert("contracts", &batch(&ids)).await.unwrap();
        assert_eq!(report.written, 5);
        assert_eq!(store.count("contracts").await.unwrap(), 5);

        let mut changed = batch(&[json!(3)]);
        changed[0].insert("payload".to_string(), json!("y"));
        upserter.upsert("contracts", &changed).await.unwrap();

        assert_eq!(store.count("contracts").await.unwrap(), 5);
        assert_eq!(
            store.get("contracts", 3).await.unwrap().as_deref(),
            Some(r#"{"id":3,"payload":"y"}"#)
        );
    }

    #[tokio::test]
    async fn test_sqlite_bad_id_stores_nothing() {
        let store = sqlite_store();
        let upserter = sqlite_upserter(&store, Duration::from_secs(1));

        let records = batch(&[json!(1), json!(2), json!("x"), json!(4), json!(5)]);
        let err = upserter.upsert("contracts", &records).await.unwrap_err();

        assert_matches!(&err, UpsertError::Records { errors, total: 5, .. } if errors[0].index == 2);
        assert_eq!(store.count("contracts").await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_sqlite_statement_error_rolls_back_batch() {
        let store = sqlite_store();
        store
            .execute_batch(
                r#"
                CREATE TRIGGER reject_three BEFORE INSERT ON contracts
                WHEN NEW.id = 3 BEGIN
                    SELECT RAISE(ABORT, 'rejected');
                END;
                "#,
            )
            .await
            .unwrap();
        let upserter = sqlite_upserter(&store, Duration::from_secs(1));

        let ids: Vec<_> = (1..=5).map(|id| json!(id)).collect();
        let err = upserter.upsert("contracts", &batch(&ids)).await.unwrap_err();

        if let UpsertError::Records { errors, .. } = &err {
            assert_eq!(errors.len(), 1);
            assert_eq!(errors[0].id, Some(3));
            assert_matches!(errors[0].failure, RecordFailure::Exec(_));
        } else {
            panic!("expected per-record errors, got {err}");
        }
        assert_eq!(store.count("contracts").await.unwrap(), 0);

        // The store takes new batches after the rollback
        upserter.upsert("contracts", &batch(&[json!(1)])).await.unwrap();
        assert_eq!(store.count("contracts").await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_sqlite_slow_statement_is_interrupted() {
        let store = sqlite_store();
        store
            .execute_batch(
                r#"
                CREATE TABLE nums (n INTEGER);
                WITH RECURSIVE seq(n) AS (SELECT 1 UNION ALL SELECT n + 1 FROM seq WHERE n < 500)
                INSERT INTO nums SELECT n FROM seq;
                CREATE TRIGGER slow_contracts AFTER INSERT ON contracts BEGIN
                    SELECT count(*) FROM nums a, nums b, nums c;
                END;
                "#,
            )
            .await
            .unwrap();
        let upserter = sqlite_upserter(&store, Duration::from_millis(100));

        let started = std::time::Instant::now();
        let err = upserter
            .upsert("contracts", &batch(&[json!(1), json!(2)]))
            .await
            .unwrap_err();

        assert!(started.elapsed() < Duration::from_secs(2));
        if let UpsertError::Records { errors, .. } = &err {
            assert_eq!(errors[0].index, 0);
            assert_matches!(errors[0].failure, RecordFailure::Timeout(_));
        } else {
            panic!("expected per-record errors, got {err}");
        }
        assert_eq!(store.count("contracts").await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_sqlite_transaction_deadline_interrupts_statement() {
        let store = sqlite_store();
        store
            .execute_batch(
                r#"
                CREATE TABLE nums (n INTEGER);
                WITH RECURSIVE seq(n) AS (SELECT 1 UNION ALL SELECT n + 1 FROM seq WHERE n < 500)
                INSERT INTO nums SELECT n FROM seq;
                CREATE TRIGGER slow_states AFTER INSERT ON states BEGIN
                    SELECT count(*) FROM nums a, nums b, nums c;
                END;
                "#,
            )
            .await
            .unwrap();
        let upserter = BatchUpserter::new(
            Arc::new(store.clone()),
            &["states".to_string()],
            Duration::from_millis(100),
            Duration::from_secs(10),
        );

        let started = std::time::Instant::now();
        let err = upserter
            .upsert("states", &batch(&[json!(1)]))
            .await
            .unwrap_err();

        assert!(started.elapsed() < Duration::from_secs(2));
        assert_matches!(err, UpsertError::Timeout { .. });
        assert_eq!(store.count("states").await.unwrap(), 0);
    }

    #[test]
    fn test_safe_identifier() {
        assert!(is_safe_identifier("contracts"));
        assert!(is_safe_identifier("Lots_2024"));
        assert!(!is_safe_identifier(""));
        assert!(!is_safe_identifier("contracts.data"));
        assert!(!is_safe_identifier("таблица"));
    }
}
