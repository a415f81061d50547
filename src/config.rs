use anyhow::{anyhow, bail, Context, Result};
use dirs::config_dir;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::store::SqliteStore;
use crate::upsert::is_safe_identifier;

/// Main configuration structure for recordsync
#[derive(Debug, Deserialize, Serialize, Clone, Default)]
pub struct Config {
    /// Remote source and collection settings
    #[serde(default)]
    pub source: SourceConfig,

    /// Record store settings
    #[serde(default)]
    pub storage: StorageConfig,

    /// Cycle behavior settings
    #[serde(default)]
    pub sync: SyncConfig,

    /// Daemon configuration
    #[serde(default)]
    pub daemon: DaemonConfig,

    /// Notification channel
    #[serde(default)]
    pub notify: NotifyConfig,

    /// Logging configuration
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Remote source configuration
#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct SourceConfig {
    /// Login endpoint; no login is performed when unset
    pub login_url: Option<String>,

    /// Account name used for login
    pub username: Option<String>,

    /// Account password
    pub password: Option<String>,

    /// File holding the password, used when `password` is unset
    pub password_file: Option<String>,

    /// Timeout for a single HTTP request in seconds
    #[serde(default = "default_request_timeout")]
    pub request_timeout: u64,

    /// Records requested per page
    #[serde(default = "default_page_size")]
    pub page_size: usize,

    /// Maximum page requests in flight
    #[serde(default = "default_max_concurrency")]
    pub max_concurrency: usize,

    /// Collections fetched on every cycle
    #[serde(default = "default_collections")]
    pub collections: Vec<CollectionConfig>,
}

/// One remote collection
#[derive(Debug, Deserialize, Serialize, Clone, PartialEq)]
pub struct CollectionConfig {
    /// Collection name, also the target table
    pub name: String,

    /// List endpoint
    pub url: String,

    /// New records are reported for the primary collection only
    #[serde(default)]
    pub primary: bool,

    /// Whether the endpoint takes skip/take paging
    #[serde(default = "default_true")]
    pub paginated: bool,

    /// Filter object sent with every request
    #[serde(default)]
    pub filter: Value,

    /// Ordering sent with every request
    #[serde(default)]
    pub order: Value,
}

/// Record store configuration
#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct StorageConfig {
    /// SQLite database location
    #[serde(default = "default_database")]
    pub database: String,

    /// Collections the store may write to
    #[serde(default = "default_allowed_collections")]
    pub allowed_collections: Vec<String>,

    /// Upper bound for one batch transaction in seconds
    #[serde(default = "default_transaction_timeout")]
    pub transaction_timeout: u64,

    /// Upper bound for one record upsert in seconds
    #[serde(default = "default_statement_timeout")]
    pub statement_timeout: u64,
}

/// When identifiers of a cycle enter the seen-set
#[derive(Debug, Deserialize, Serialize, Clone, Copy, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum SeenUpdate {
    /// Only after every batch of the cycle committed
    #[default]
    AfterPersist,
    /// Right after classification, kept even when persistence fails
    AfterClassify,
}

/// Cycle configuration
#[derive(Debug, Deserialize, Serialize, Clone, Default)]
pub struct SyncConfig {
    #[serde(default)]
    pub seen_update: SeenUpdate,
}

/// Daemon configuration
#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct DaemonConfig {
    /// Sync interval
    #[serde(default = "default_interval")]
    pub interval: String, // "24h"

    /// Run a cycle immediately on start instead of waiting one interval
    #[serde(default = "default_true")]
    pub run_on_start: bool,

    /// PID file location
    #[serde(default = "default_pid_file")]
    pub pid_file: String,

    /// Log file location
    #[serde(default = "default_log_file")]
    pub log_file: String,
}

/// Notification configuration
#[derive(Debug, Deserialize, Serialize, Clone, Default)]
pub struct NotifyConfig {
    /// Telegram bot; notifications are only logged when unset
    pub telegram: Option<TelegramConfig>,
}

/// Telegram bot settings
#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct TelegramConfig {
    pub bot_token: String,

    pub chat_id: i64,

    /// Bot API base URL
    #[serde(default = "default_telegram_api_url")]
    pub api_url: String,

    /// Retries after the first failed send
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,

    /// Delay between attempts in seconds
    #[serde(default = "default_retry_delay")]
    pub retry_delay: u64,

    /// File name of the new-records document
    #[serde(default = "default_document_name")]
    pub document_name: String,
}

/// Logging configuration
#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct LoggingConfig {
    /// Log level
    #[serde(default = "default_log_level")]
    pub level: String, // "info"

    /// Log format
    #[serde(default = "default_log_format")]
    pub format: String, // "compact" or "full"
}

// Default value functions
fn default_true() -> bool {
    true
}
fn default_request_timeout() -> u64 {
    30
}
fn default_page_size() -> usize {
    500
}
fn default_max_concurrency() -> usize {
    5
}
fn default_collections() -> Vec<CollectionConfig> {
    vec![
        CollectionConfig {
            name: "contracts".to_string(),
            url: "https://eaist.mos.ru/eaist2rc/api/contracts/contract/list".to_string(),
            primary: true,
            paginated: true,
            filter: json!({
                "customerId": 7884,
                "is44F3": true,
                "is94F3": false,
                "is223": null,
                "isActual": false,
                "isOkpdChilds": false,
                "states": [7, 1, 9, 5, 15, 4, 10, 3, 2, 1001, 1002, 12, 11, 5010]
            }),
            order: json!([{ "field": "id", "desc": true }]),
        },
        CollectionConfig {
            name: "states".to_string(),
            url: "https://eaist.mos.ru/eaist2rc/api/core/states/state/list".to_string(),
            primary: false,
            paginated: false,
            filter: json!({ "categoryCode": "contractstagesupplier" }),
            order: Value::Null,
        },
    ]
}
fn default_database() -> String {
    SqliteStore::default_path().to_string_lossy().into_owned()
}
fn default_allowed_collections() -> Vec<String> {
    vec![
        "contracts".to_string(),
        "states".to_string(),
        "lots".to_string(),
    ]
}
fn default_transaction_timeout() -> u64 {
    60
}
fn default_statement_timeout() -> u64 {
    5
}
fn default_interval() -> String {
    "24h".to_string()
}
fn default_pid_file() -> String {
    if let Ok(runtime_dir) = std::env::var("XDG_RUNTIME_DIR") {
        format!("{}/recordsync.pid", runtime_dir)
    } else {
        "/tmp/recordsync.pid".to_string()
    }
}
fn default_log_file() -> String {
    if let Ok(data_home) = std::env::var("XDG_DATA_HOME") {
        format!("{}/recordsync/daemon.log", data_home)
    } else if let Ok(home) = std::env::var("HOME") {
        format!("{}/.local/share/recordsync/daemon.log", home)
    } else {
        "/tmp/recordsync-daemon.log".to_string()
    }
}
fn default_telegram_api_url() -> String {
    "https://api.telegram.org".to_string()
}
fn default_max_retries() -> u32 {
    3
}
fn default_retry_delay() -> u64 {
    2
}
fn default_document_name() -> String {
    "new_records.json".to_string()
}
fn default_log_level() -> String {
    "info".to_string()
}
fn default_log_format() -> String {
    "compact".to_string()
}

// Default implementations
impl Default for SourceConfig {
    fn default() -> Self {
        Self {
            login_url: Some(
                "https://eaist.mos.ru/module/protected-admin/api/login".to_string(),
            ),
            username: None,
            password: None,
            password_file: None,
            request_timeout: default_request_timeout(),
            page_size: default_page_size(),
            max_concurrency: default_max_concurrency(),
            collections: default_collections(),
        }
    }
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            database: default_database(),
            allowed_collections: default_allowed_collections(),
            transaction_timeout: default_transaction_timeout(),
            statement_timeout: default_statement_timeout(),
        }
    }
}

impl Default for DaemonConfig {
    fn default() -> Self {
        Self {
            interval: default_interval(),
            run_on_start: default_true(),
            pid_file: default_pid_file(),
            log_file: default_log_file(),
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            format: default_log_format(),
        }
    }
}

impl SourceConfig {
    /// Password from the config or from `password_file`
    pub fn resolve_password(&self) -> Result<Option<String>> {
        if let Some(password) = self.password.as_ref().filter(|p| !p.is_empty()) {
            return Ok(Some(password.clone()));
        }

        match &self.password_file {
            Some(path) if !path.is_empty() => {
                let content = std::fs::read_to_string(path)
                    .with_context(|| format!("Failed to read password file: {}", path))?;
                Ok(Some(content.trim().to_string()))
            }
            _ => Ok(None),
        }
    }

    /// The collection whose new records are reported
    pub fn primary_collection(&self) -> Option<&CollectionConfig> {
        self.collections.iter().find(|c| c.primary)
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout)
    }
}

impl StorageConfig {
    pub fn transaction_timeout(&self) -> Duration {
        Duration::from_secs(self.transaction_timeout)
    }

    pub fn statement_timeout(&self) -> Duration {
        Duration::from_secs(self.statement_timeout)
    }
}

impl DaemonConfig {
    /// Parsed sync interval
    pub fn interval_duration(&self) -> Result<Duration> {
        parse_duration(&self.interval)
            .with_context(|| format!("Invalid daemon interval: {}", self.interval))
    }
}

impl TelegramConfig {
    pub fn retry_delay(&self) -> Duration {
        Duration::from_secs(self.retry_delay)
    }
}

/// Parse duration strings like "30s", "30m", "1h" or "2d"
pub fn parse_duration(duration_str: &str) -> Result<Duration> {
    let duration_str = duration_str.trim().to_lowercase();

    let (value, unit) = if let Some(value) = duration_str.strip_suffix('s') {
        (value.parse::<u64>().context("Invalid seconds value")?, 1)
    } else if let Some(value) = duration_str.strip_suffix('m') {
        (value.parse::<u64>().context("Invalid minutes value")?, 60)
    } else if let Some(value) = duration_str.strip_suffix('h') {
        (value.parse::<u64>().context("Invalid hours value")?, 3600)
    } else if let Some(value) = duration_str.strip_suffix('d') {
        (value.parse::<u64>().context("Invalid days value")?, 86400)
    } else {
        // Try to parse as raw seconds
        let secs = duration_str
            .parse::<u64>()
            .context("Invalid duration format. Use format like '30m', '1h', '2d'")?;
        (secs, 1)
    };

    let secs = value
        .checked_mul(unit)
        .with_context(|| format!("Duration is too large: {}", duration_str))?;

    if secs == 0 {
        bail!("Duration must be greater than zero");
    }
    Ok(Duration::from_secs(secs))
}

impl Config {
    /// Load configuration from the default location or create a default config
    pub fn load_or_default() -> Result<Self> {
        let config_path = Self::default_config_path()?;

        if config_path.exists() {
            Self::load(&config_path)
        } else {
            let mut config = Self::default();

            // Create config directory if it doesn't exist
            if let Some(parent) = config_path.parent() {
                std::fs::create_dir_all(parent)
                    .with_context(|| format!("Failed to create config directory: {:?}", parent))?;
            }

            config.save(&config_path)?;
            config.expand_paths()?;

            tracing::info!("Created default configuration at: {:?}", config_path);
            Ok(config)
        }
    }

    /// Load configuration from a specific file
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {:?}", path))?;

        let mut config: Config = serde_yaml::from_str(&content)
            .with_context(|| format!("Failed to parse config file: {:?}", path))?;

        // Expand environment variables in paths
        config.expand_paths()?;
        config
            .validate()
            .with_context(|| format!("Invalid configuration in {:?}", path))?;

        Ok(config)
    }

    /// Save configuration to a file
    pub fn save(&self, path: &Path) -> Result<()> {
        let content = serde_yaml::to_string(self).context("Failed to serialize configuration")?;

        std::fs::write(path, content)
            .with_context(|| format!("Failed to write config file: {:?}", path))?;

        Ok(())
    }

    /// Get the default configuration file path (XDG compliant)
    pub fn default_config_path() -> Result<PathBuf> {
        let config_dir = config_dir().context("Failed to get user config directory")?;

        Ok(config_dir.join("recordsync").join("config.yml"))
    }

    /// Expand environment variables in configuration paths
    pub fn expand_paths(&mut self) -> Result<()> {
        self.storage.database = shellexpand::full(&self.storage.database)
            .context("Failed to expand database path")?
            .into_owned();

        self.daemon.pid_file = shellexpand::full(&self.daemon.pid_file)
            .context("Failed to expand pid_file path")?
            .into_owned();

        self.daemon.log_file = shellexpand::full(&self.daemon.log_file)
            .context("Failed to expand log_file path")?
            .into_owned();

        if let Some(password_file) = &self.source.password_file {
            self.source.password_file = Some(
                shellexpand::full(password_file)
                    .context("Failed to expand password_file path")?
                    .into_owned(),
            );
        }

        Ok(())
    }

    /// Check cross-field constraints that serde cannot express
    pub fn validate(&self) -> Result<()> {
        if self.source.page_size == 0 {
            bail!("source.page_size must be greater than zero");
        }
        if self.source.max_concurrency == 0 {
            bail!("source.max_concurrency must be greater than zero");
        }
        if self.storage.transaction_timeout == 0 || self.storage.statement_timeout == 0 {
            bail!("storage timeouts must be greater than zero");
        }

        for name in &self.storage.allowed_collections {
            if !is_safe_identifier(name) {
                bail!("allowed collection '{}' is not a valid identifier", name);
            }
        }
        let allowed: HashSet<String> = self
            .storage
            .allowed_collections
            .iter()
            .map(|name| name.to_lowercase())
            .collect();

        let primaries = self.source.collections.iter().filter(|c| c.primary).count();
        if primaries != 1 {
            bail!(
                "exactly one collection must be marked primary, found {}",
                primaries
            );
        }

        let mut names = HashSet::new();
        for collection in &self.source.collections {
            let canonical = collection.name.to_lowercase();
            if !allowed.contains(&canonical) {
                return Err(anyhow!(
                    "collection '{}' is not in storage.allowed_collections",
                    collection.name
                ));
            }
            if !names.insert(canonical) {
                bail!("collection '{}' is configured twice", collection.name);
            }
        }

        self.daemon.interval_duration()?;
        Ok(())
    }
}
