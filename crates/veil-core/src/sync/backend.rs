//! Backend capability boundary
//!
//! The sync engine and the subscription paths talk to the network through
//! this trait only; production wires in the HTTP client, tests inject an
//! in-memory mock. The wire format behind it is not owned by this crate.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Errors crossing the backend boundary
#[derive(Error, Debug)]
pub enum BackendError {
    /// Backend could not be reached (DNS, connect, timeout).
    #[error("Backend unreachable: {0}")]
    Unreachable(String),

    /// Backend answered with a non-success status.
    #[error("Backend returned HTTP {0}")]
    Status(u16),

    /// Response body could not be decoded.
    #[error("Malformed backend response: {0}")]
    Malformed(String),
}

/// One filter entry of the remote catalog.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RemoteFilter {
    pub filter_id: i32,
    pub group_id: i32,
    pub version: String,
    pub name: String,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub homepage: Option<String>,
    #[serde(default)]
    pub subscription_url: Option<String>,
    /// Language codes this filter targets; drives auto-detection.
    #[serde(default)]
    pub langs: Vec<String>,
}

/// The remote catalog: a version marker plus the available filters.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RemoteCatalog {
    /// Opaque version/timestamp marker. Compared for equality against the
    /// locally stored marker to decide whether metadata is outdated.
    pub version: String,
    pub filters: Vec<RemoteFilter>,
}

/// Network collaborator required by this crate.
///
/// `fetch_catalog_version` is intentionally separate from `fetch_catalog` so
/// the outdated-check stays cheap when nothing changed.
#[async_trait]
pub trait FilterBackend: Send + Sync {
    /// Current catalog version marker.
    async fn fetch_catalog_version(&self) -> Result<String, BackendError>;

    /// The full filter catalog.
    async fn fetch_catalog(&self) -> Result<RemoteCatalog, BackendError>;

    /// Rule body for a catalog filter, one rule per element.
    async fn fetch_rules(&self, filter_id: i32) -> Result<Vec<String>, BackendError>;

    /// Raw content of a user-supplied custom filter URL.
    async fn fetch_custom(&self, url: &str) -> Result<String, BackendError>;
}
