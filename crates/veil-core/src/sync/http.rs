//! HTTP implementation of the backend boundary
//!
//! Endpoints, relative to the configured base URL:
//! - `GET /catalog/version`: plain-text version marker
//! - `GET /catalog.json`: JSON [`RemoteCatalog`]
//! - `GET /filters/{id}.txt`: rule body, one rule per line
//!
//! Custom filter content is fetched from the caller-supplied URL verbatim.

use std::time::Duration;

use async_trait::async_trait;
use tracing::debug;

use super::backend::{BackendError, FilterBackend, RemoteCatalog};

/// Production [`FilterBackend`] over HTTP.
pub struct HttpBackend {
    base_url: String,
    client: reqwest::Client,
}

impl HttpBackend {
    pub fn new(base_url: impl Into<String>) -> Self {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(30))
            .build()
            .unwrap_or_default();
        Self {
            base_url: base_url.into().trim_end_matches('/').to_string(),
            client,
        }
    }

    async fn get_text(&self, url: &str) -> Result<String, BackendError> {
        debug!("GET {}", url);
        let response = self
            .client
            .get(url)
            .send()
            .await
            .map_err(classify_reqwest_error)?;
        let status = response.status();
        if !status.is_success() {
            return Err(BackendError::Status(status.as_u16()));
        }
        response.text().await.map_err(classify_reqwest_error)
    }
}

#[async_trait]
impl FilterBackend for HttpBackend {
    async fn fetch_catalog_version(&self) -> Result<String, BackendError> {
        let text = self
            .get_text(&format!("{}/catalog/version", self.base_url))
            .await?;
        let version = text.trim();
        if version.is_empty() {
            return Err(BackendError::Malformed("empty catalog version".into()));
        }
        Ok(version.to_string())
    }

    async fn fetch_catalog(&self) -> Result<RemoteCatalog, BackendError> {
        let body = self
            .get_text(&format!("{}/catalog.json", self.base_url))
            .await?;
        serde_json::from_str(&body).map_err(|e| BackendError::Malformed(e.to_string()))
    }

    async fn fetch_rules(&self, filter_id: i32) -> Result<Vec<String>, BackendError> {
        let body = self
            .get_text(&format!("{}/filters/{}.txt", self.base_url, filter_id))
            .await?;
        Ok(rule_lines(&body))
    }

    async fn fetch_custom(&self, url: &str) -> Result<String, BackendError> {
        self.get_text(url).await
    }
}

fn classify_reqwest_error(e: reqwest::Error) -> BackendError {
    if e.is_connect() || e.is_timeout() || e.is_request() {
        BackendError::Unreachable(e.to_string())
    } else if e.is_decode() {
        BackendError::Malformed(e.to_string())
    } else {
        BackendError::Unreachable(e.to_string())
    }
}

/// Split a rule body into rule lines, dropping blanks and `!` comments.
pub(crate) fn rule_lines(body: &str) -> Vec<String> {
    body.lines()
        .map(str::trim)
        .filter(|line| !line.is_empty() && !line.starts_with('!'))
        .map(str::to_string)
        .collect()
}
