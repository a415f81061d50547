/// Common test utilities and helpers for recordsync tests

use recordsync::config::{CollectionConfig, Config};
use recordsync::Record;
use serde_json::{json, Value};
use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use tempfile::TempDir;
use wiremock::{Request, Respond, ResponseTemplate};

/// Temporary directory holding the database and config for one test
pub struct TestEnvironment {
    pub temp_dir: TempDir,
}

impl TestEnvironment {
    pub fn new() -> Self {
        Self {
            temp_dir: TempDir::new().expect("Failed to create temp dir"),
        }
    }

    pub fn database_path(&self) -> PathBuf {
        self.temp_dir.path().join("data").join("records.db")
    }

    /// Config pointing every collection at `base_url`
    pub fn config(&self, base_url: &str) -> Config {
        let mut config = Config::default();

        config.source.login_url = Some(format!("{}/login", base_url));
        config.source.username = Some("robot".to_string());
        config.source.password = Some("secret".to_string());
        config.source.request_timeout = 5;
        config.source.page_size = 5;
        config.source.max_concurrency = 2;
        config.source.collections = vec![
            CollectionConfig {
                name: "contracts".to_string(),
                url: format!("{}/contracts", base_url),
                primary: true,
                paginated: true,
                filter: json!({"customerId": 7}),
                order: json!([{"field": "id", "desc": true}]),
            },
            CollectionConfig {
                name: "states".to_string(),
                url: format!("{}/states", base_url),
                primary: false,
                paginated: false,
                filter: json!({"categoryCode": "stage"}),
                order: Value::Null,
            },
        ];

        config.storage.database = self.database_path().to_string_lossy().to_string();
        config.storage.allowed_collections = vec!["contracts".to_string(), "states".to_string()];
        config.daemon.pid_file = self
            .temp_dir
            .path()
            .join("recordsync.pid")
            .to_string_lossy()
            .to_string();

        config
    }

    pub fn write_config(&self, content: &str) -> PathBuf {
        let config_path = self.temp_dir.path().join("config.yml");
        std::fs::write(&config_path, content).expect("Failed to write test config");
        config_path
    }
}

pub fn record(id: i64) -> Record {
    json!({"id": id, "number": format!("C-{id}")})
        .as_object()
        .cloned()
        .expect("object literal")
}

/// List endpoint serving a mutable record set with skip/take paging
#[derive(Clone, Default)]
pub struct PagedSource {
    records: Arc<Mutex<Vec<Record>>>,
}

impl PagedSource {
    pub fn with_ids(ids: impl IntoIterator<Item = i64>) -> Self {
        let source = Self::default();
        source.set_ids(ids);
        source
    }

    pub fn set_ids(&self, ids: impl IntoIterator<Item = i64>) {
        *self.records.lock().unwrap() = ids.into_iter().map(record).collect();
    }
}

impl Respond for PagedSource {
    fn respond(&self, request: &Request) -> ResponseTemplate {
        let body: Value = serde_json::from_slice(&request.body).unwrap_or(Value::Null);
        let records = self.records.lock().unwrap();

        let skip = body["skip"].as_u64().map(|v| v as usize);
        let take = body["take"].as_u64().map(|v| v as usize);
        let items: Vec<&Record> = match (skip, take) {
            (Some(skip), Some(take)) => records.iter().skip(skip).take(take).collect(),
            _ => records.iter().collect(),
        };

        let mut response = json!({"items": items});
        if body["withCount"].as_bool() == Some(true) {
            response["count"] = json!(records.len());
        }
        ResponseTemplate::new(200).set_body_json(response)
    }
}

pub fn ids(records: &[Record]) -> Vec<i64> {
    records
        .iter()
        .map(|r| recordsync::extract_id(r).unwrap())
        .collect()
}
