//! recordsync - Periodic Record Collection Sync
//!
//! recordsync pulls paginated record collections from a remote source,
//! merges them into one snapshot per collection, detects which records are
//! new since the last cycle and upserts everything into a local store.
//!
//! ## Core Features
//!
//! - **Concurrent Collection**: Bounded-concurrency pagination with fail-fast cancellation
//! - **Deduplication**: Records merged by identifier, last write wins
//! - **Change Detection**: New records reported against a process-lifetime seen-set
//! - **Transactional Upserts**: Whole batches commit or roll back together
//! - **Notifications**: New records delivered as a JSON document over Telegram
//!
//! ## Modules
//!
//! - [`source`]: Remote session and page fetching
//! - [`collector`]: Concurrent page collection
//! - [`tracker`]: New-record detection
//! - [`upsert`]: Batch persistence into allow-listed collections
//! - [`cycle`]: One fetch-classify-persist pass
//! - [`daemon`]: Periodic execution and process management

pub mod collector;
pub mod config;
pub mod cycle;
pub mod daemon;
pub mod notify;
pub mod record;
pub mod source;
pub mod store;
pub mod tracker;
pub mod upsert;

pub use collector::ConcurrentCollector;
pub use config::{Config, LoggingConfig, SeenUpdate};
pub use cycle::{CollectionSource, CycleError, CycleState, SyncCycle};
pub use daemon::{Daemon, SyncJob};
pub use notify::{LogNotifier, Notifier, TelegramNotifier};
pub use record::{extract_id, CollectionSnapshot, IdError, Record};
pub use source::{FetchError, HttpPageFetcher, PageFetcher, PageResult, RemoteSession};
pub use store::{Backend, SqliteStore, StoreError, Transaction};
pub use tracker::{ChangeTracker, SeenSet};
pub use upsert::{BatchUpserter, UpsertError, UpsertReport};
