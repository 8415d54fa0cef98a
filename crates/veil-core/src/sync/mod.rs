//! Catalog synchronization
//!
//! Keeps the local filter store reconciled with the remote catalog.
//!
//! ## Update pass
//!
//! 1. Probe the catalog version; skip if nothing changed
//! 2. Fetch the full catalog and all needed rule bodies (no transaction)
//! 3. Merge inside one transaction, emitting per-filter progress events
//! 4. Commit, stamp the version markers, invalidate the metadata cache
//!
//! ## Usage
//!
//! ```ignore
//! let engine = SyncEngine::new(store, catalog, cache, events, backend, "en");
//! let outcome = engine.update_filters(false).await;
//! ```

mod backend;
mod engine;
mod http;

pub use backend::{BackendError, FilterBackend, RemoteCatalog, RemoteFilter};
pub use engine::{SyncEngine, SyncOutcome};
pub use http::HttpBackend;

pub(crate) use http::rule_lines;
