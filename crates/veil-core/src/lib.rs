//! Veil Core Library
//!
//! This crate is the filter-list management engine of veil, a content
//! blocking system: it owns the local store of blocking-rule groups,
//! filters and rules, keeps that store synchronized with a remote catalog,
//! ingests user-supplied custom filters, and broadcasts lifecycle events to
//! observers (a rule compiler, a UI layer).
//!
//! # Architecture
//!
//! - **FilterStore**: transactional SQLite store, the single authority over
//!   persisted state
//! - **DefaultCatalog**: read-only bundled reference database used for
//!   first-run seeding and as a zero-network/localization fallback
//! - **MetadataCache**: rebuildable snapshot of the metadata tables,
//!   invalidated on every mutation
//! - **SyncEngine**: reconciles the store against the remote catalog in one
//!   transaction per pass
//! - **CustomFilterImporter**: parse-then-commit ingestion of user filters
//! - **EventBus**: broadcast of lifecycle transitions
//!
//! # Quick Start
//!
//! ```text
//! let manager = FilterManager::with_http_backend(Config::load()?)?;
//! manager.start().await;
//!
//! let active = manager.active_filter_ids();
//! for id in active {
//!     let rules = manager.active_rules_for_filter(id);
//!     // hand rules to the blocking engine
//! }
//! ```
//!
//! # Modules
//!
//! - `service`: [`FilterManager`] facade (main entry point)
//! - `models`: groups, filter metadata, rules, localization tables
//! - `store`: transactional production database
//! - `catalog`: bundled default catalog reader
//! - `cache`: metadata snapshot cache
//! - `sync`: backend boundary and the sync engine
//! - `custom`: custom filter parsing and import
//! - `events`: lifecycle event bus
//! - `config`: application configuration

pub mod cache;
pub mod catalog;
pub mod config;
pub mod custom;
pub mod events;
pub mod models;
pub mod service;
pub mod storage;
pub mod store;
pub mod sync;

#[cfg(test)]
pub(crate) mod testutil;

pub use cache::{MetadataCache, MetadataSnapshot};
pub use catalog::DefaultCatalog;
pub use config::Config;
pub use custom::{parse_custom_filter, CustomFilterImporter, ParseError};
pub use events::{EventBus, FilterEvent};
pub use models::{
    CustomFilterParseResult, FilterGroup, FilterKind, FilterLocalization, FilterMeta, FilterRule,
    FiltersI18n, GroupsI18n, CUSTOM_FILTER_ID_BASE, SPECIAL_GROUP_ID, USER_FILTER_ID,
};
pub use service::FilterManager;
pub use storage::{StoreError, StoreResult};
pub use store::FilterStore;
pub use sync::{
    BackendError, FilterBackend, HttpBackend, RemoteCatalog, RemoteFilter, SyncEngine, SyncOutcome,
};
