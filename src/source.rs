//! Remote source access - session login and page fetching over HTTP
//!
//! The source exposes list endpoints that take a JSON body with a filter,
//! an ordering and optional `skip`/`take`/`withCount` paging fields, and
//! answer with `{"items": [...], "count": N}`.

use async_trait::async_trait;
use reqwest::{Client, StatusCode};
use serde::Deserialize;
use serde_json::{Map, Value};
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, info};

use crate::config::{CollectionConfig, SourceConfig};
use crate::record::Record;

/// One page of records
#[derive(Debug, Clone, Default)]
pub struct PageResult {
    pub items: Vec<Record>,
    /// Total collection size, only present when requested
    pub total: Option<u64>,
}

/// Transport-level failures while fetching a page
#[derive(Debug, Error)]
pub enum FetchError {
    #[error("invalid page request: {0}")]
    InvalidRequest(String),

    #[error("request failed: {0}")]
    Request(#[from] reqwest::Error),

    #[error("unexpected status {status}: {body}")]
    Status { status: StatusCode, body: String },

    #[error("malformed response: {0}")]
    Decode(String),

    #[error("fetch cancelled")]
    Cancelled,

    #[error("page {page}: {source}")]
    Page {
        page: usize,
        #[source]
        source: Box<FetchError>,
    },
}

impl FetchError {
    /// Attach the page index the error happened on
    pub fn on_page(self, page: usize) -> Self {
        match self {
            FetchError::Page { .. } => self,
            other => FetchError::Page {
                page,
                source: Box::new(other),
            },
        }
    }

    /// Whether the error (or the page error it wraps) is a cancellation
    pub fn is_cancelled(&self) -> bool {
        match self {
            FetchError::Cancelled => true,
            FetchError::Page { source, .. } => source.is_cancelled(),
            _ => false,
        }
    }
}

/// Fetches single pages of one remote collection
///
/// Implementations never retry; retry policy belongs to the caller.
#[async_trait]
pub trait PageFetcher: Send + Sync {
    async fn fetch_page(
        &self,
        skip: usize,
        take: usize,
        with_count: bool,
    ) -> Result<PageResult, FetchError>;
}

#[derive(Debug, Deserialize)]
struct ListResponse {
    #[serde(default)]
    items: Vec<Record>,
    #[serde(default)]
    count: Option<u64>,
}

/// Authenticated HTTP session shared by every collection fetcher
#[derive(Clone)]
pub struct RemoteSession {
    client: Client,
}

impl RemoteSession {
    /// Build a client with a cookie store so login state carries over
    pub fn new(request_timeout: Duration) -> Result<Self, FetchError> {
        let client = Client::builder()
            .cookie_store(true)
            .timeout(request_timeout)
            .build()?;
        Ok(Self { client })
    }

    pub fn client(&self) -> &Client {
        &self.client
    }

    /// Log in when credentials are configured
    pub async fn login(&self, source: &SourceConfig, password: Option<&str>) -> Result<bool, FetchError> {
        let (Some(login_url), Some(username)) = (&source.login_url, &source.username) else {
            debug!("No login configured, using anonymous session");
            return Ok(false);
        };

        let body = serde_json::json!({
            "username": username,
            "password": password.unwrap_or_default(),
            "remember": true,
        });

        let response = self.client.post(login_url).json(&body).send().await?;
        let status = response.status();
        if status != StatusCode::OK {
            let body = response.text().await.unwrap_or_default();
            return Err(FetchError::Status { status, body });
        }

        info!("Logged in to remote source as {}", username);
        Ok(true)
    }

    /// Fetcher for one configured collection
    pub fn fetcher(&self, collection: &CollectionConfig) -> HttpPageFetcher {
        HttpPageFetcher {
            client: self.client.clone(),
            url: collection.url.clone(),
            filter: collection.filter.clone(),
            order: collection.order.clone(),
            paginated: collection.paginated,
        }
    }
}

/// Page fetcher posting JSON list requests
#[derive(Clone)]
pub struct HttpPageFetcher {
    client: Client,
    url: String,
    filter: Value,
    order: Value,
    paginated: bool,
}

impl HttpPageFetcher {
    pub fn new(client: Client, url: impl Into<String>, paginated: bool) -> Self {
        Self {
            client,
            url: url.into(),
            filter: Value::Null,
            order: Value::Null,
            paginated,
        }
    }

    pub fn with_filter(mut self, filter: Value) -> Self {
        self.filter = filter;
        self
    }

    pub fn with_order(mut self, order: Value) -> Self {
        self.order = order;
        self
    }

    fn request_body(&self, skip: usize, take: usize, with_count: bool) -> Value {
        let mut body = Map::new();
        if !self.filter.is_null() {
            body.insert("filter".to_string(), self.filter.clone());
        }
        if !self.order.is_null() {
            body.insert("order".to_string(), self.order.clone());
        }
        if self.paginated {
            body.insert("skip".to_string(), skip.into());
            body.insert("take".to_string(), take.into());
            body.insert("withCount".to_string(), with_count.into());
        }
        Value::Object(body)
    }
}

#[async_trait]
impl PageFetcher for HttpPageFetcher {
    async fn fetch_page(
        &self,
        skip: usize,
        take: usize,
        with_count: bool,
    ) -> Result<PageResult, FetchError> {
        if take == 0 {
            return Err(FetchError::InvalidRequest(
                "page size must be greater than zero".to_string(),
            ));
        }

        debug!("POST {} skip={} take={} with_count={}", self.url, skip, take, with_count);

        let response = self
            .client
            .post(&self.url)
            .header("X-Requested-With", "XMLHttpRequest")
            .json(&self.request_body(skip, take, with_count))
            .send()
            .await?;

        let status = response.status();
        let bytes = response.bytes().await?;
        if status != StatusCode::OK {
            return Err(FetchError::Status {
                status,
                body: String::from_utf8_lossy(&bytes).into_owned(),
            });
        }

        let parsed: ListResponse =
            serde_json::from_slice(&bytes).map_err(|e| FetchError::Decode(e.to_string()))?;

        // Unpaginated endpoints return the whole collection at once
        let total = if with_count && self.paginated {
            parsed.count
        } else {
            None
        };

        Ok(PageResult {
            items: parsed.items,
            total,
        })
    }
}
