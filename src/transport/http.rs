//! REST transport over reqwest.
//!
//! | request | wire call |
//! |---|---|
//! | `Read` | `GET {base}/{resource}[/{id}]?{params}` |
//! | `Write` | `PUT {base}/{kind}/{id}` with the desired state as JSON |
//! | `Fetch` | `GET {source}`, relative sources resolved against `{base}` |
//!
//! `id` and `kind` are sent as single percent-encoded path segments.
//!
//! Response bodies are JSON or UTF-8 text: JSON is parsed, other text is
//! returned as a string and an empty body as `null`. Binary bodies are
//! rejected with [`SyncError::Data`]; media should be fetched through a
//! JSON descriptor or URL rather than as raw bytes.
//!
//! Non-success statuses go through [`SyncError::from_status`]. When a
//! [`PersistentStore`] is attached, the value under the configured token key
//! is sent as a bearer token.

use std::sync::Arc;

use async_trait::async_trait;
use reqwest::{Client, RequestBuilder, Url};
use serde_json::Value;
use tracing::{debug, instrument};

use crate::config::TransportConfig;
use crate::traits::{PersistentStore, Transport};
use crate::types::Request;
use crate::{Result, SyncError};

/// HTTP/JSON [`Transport`].
#[derive(Clone)]
pub struct HttpTransport {
    http: Client,
    base_url: String,
    token_key: String,
    store: Option<Arc<dyn PersistentStore>>,
}

impl HttpTransport {
    /// Create a transport rooted at `base_url` with default settings.
    pub fn new(base_url: impl Into<String>) -> Result<Self> {
        let config = TransportConfig {
            base_url: Some(base_url.into()),
            ..TransportConfig::default()
        };
        Self::from_config(&config)
    }

    /// Create a transport from config. Without a base URL only absolute
    /// fetch sources can be used.
    pub fn from_config(config: &TransportConfig) -> Result<Self> {
        let http = Client::builder()
            .timeout(config.request_timeout)
            .build()
            .map_err(|e| SyncError::Configuration(format!("failed to build HTTP client: {e}")))?;

        Ok(Self {
            http,
            base_url: config
                .base_url
                .as_deref()
                .unwrap_or_default()
                .trim_end_matches('/')
                .to_string(),
            token_key: config.token_key.clone(),
            store: None,
        })
    }

    /// Read the bearer token from `store` on every request.
    pub fn with_store(mut self, store: Arc<dyn PersistentStore>) -> Self {
        self.store = Some(store);
        self
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    fn url(&self, path: &str) -> Result<String> {
        if path.starts_with("http://") || path.starts_with("https://") {
            return Ok(path.to_string());
        }
        if self.base_url.is_empty() {
            return Err(SyncError::Configuration(format!(
                "relative path {path:?} needs a base URL"
            )));
        }
        Ok(format!("{}/{}", self.base_url, path.trim_start_matches('/')))
    }

    /// `{base}/{segments..}`, each segment percent-encoded on its own.
    fn endpoint<'a>(&self, segments: impl IntoIterator<Item = &'a str>) -> Result<Url> {
        if self.base_url.is_empty() {
            return Err(SyncError::Configuration(
                "resource requests need a base URL".to_string(),
            ));
        }
        let mut url = Url::parse(&self.base_url).map_err(|e| {
            SyncError::Configuration(format!("invalid base URL {:?}: {e}", self.base_url))
        })?;
        url.path_segments_mut()
            .map_err(|()| {
                SyncError::Configuration(format!("base URL {:?} cannot hold a path", self.base_url))
            })?
            .pop_if_empty()
            .extend(segments);
        Ok(url)
    }

    fn authorize(&self, builder: RequestBuilder) -> RequestBuilder {
        match self.store.as_ref().and_then(|s| s.get(&self.token_key)) {
            Some(token) => builder.bearer_auth(token),
            None => builder,
        }
    }

    fn build(&self, request: &Request) -> Result<RequestBuilder> {
        let builder = match request {
            Request::Read(descriptor) => {
                // Resource names may be nested paths; the id is one segment.
                let mut segments: Vec<String> = descriptor
                    .resource
                    .split('/')
                    .filter(|s| !s.is_empty())
                    .map(str::to_string)
                    .collect();
                let mut query = Vec::with_capacity(descriptor.params.len());
                for (name, value) in &descriptor.params {
                    if name == "id" {
                        segments.push(query_value(value));
                    } else {
                        query.push((name.as_str(), query_value(value)));
                    }
                }
                let url = self.endpoint(segments.iter().map(String::as_str))?;
                self.http.get(url).query(&query)
            }
            Request::Write { entity, body } => self
                .http
                .put(self.endpoint([entity.kind.as_str(), entity.id.as_str()])?)
                .json(body),
            Request::Fetch { source } => self.http.get(self.url(source)?),
        };
        Ok(self.authorize(builder))
    }
}

fn query_value(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

fn send_error(e: reqwest::Error) -> SyncError {
    if e.is_timeout() {
        SyncError::Timeout
    } else {
        SyncError::Unreachable(e.to_string())
    }
}

#[async_trait]
impl Transport for HttpTransport {
    fn name(&self) -> &str {
        "http"
    }

    #[instrument(skip(self, request), fields(request = request.label()))]
    async fn perform(&self, request: &Request) -> Result<Value> {
        let response = self.build(request)?.send().await.map_err(send_error)?;
        let status = response.status();
        let bytes = response.bytes().await.map_err(send_error)?;
        debug!(status = status.as_u16(), bytes = bytes.len(), "response received");

        if !status.is_success() {
            return Err(SyncError::from_status(
                status.as_u16(),
                &String::from_utf8_lossy(&bytes),
            ));
        }
        let body = String::from_utf8(bytes.to_vec()).map_err(|_| {
            SyncError::Data(format!(
                "binary response body ({} bytes) is not supported",
                bytes.len()
            ))
        })?;
        if body.trim().is_empty() {
            return Ok(Value::Null);
        }
        // Non-JSON bodies (plain text, markup) are passed through as strings.
        Ok(serde_json::from_str(&body).unwrap_or(Value::String(body)))
    }
}

impl std::fmt::Debug for HttpTransport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HttpTransport")
            .field("base_url", &self.base_url)
            .field("token_key", &self.token_key)
            .finish_non_exhaustive()
    }
}
