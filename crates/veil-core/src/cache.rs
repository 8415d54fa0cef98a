//! Metadata cache
//!
//! A single global snapshot of the filter/group metadata and the
//! localization tables. The snapshot is never authoritative: it is dropped
//! on every store mutation and on sync completion (success or failure), and
//! lazily recomputed from the store on the next read.

use std::sync::{Arc, RwLock};

use chrono::{DateTime, Utc};
use tracing::debug;

use crate::models::{FilterGroup, FilterMeta, FiltersI18n, GroupsI18n};
use crate::store::FilterStore;
use crate::storage::StoreResult;

/// One coherent read of the store's metadata tables.
#[derive(Debug, Clone)]
pub struct MetadataSnapshot {
    pub groups: Vec<FilterGroup>,
    pub filters: Vec<FilterMeta>,
    pub groups_i18n: GroupsI18n,
    pub filters_i18n: FiltersI18n,
    /// When this snapshot was computed.
    pub computed_at: DateTime<Utc>,
}

/// Invalidate-on-write cache over [`FilterStore`] metadata reads.
pub struct MetadataCache {
    snapshot: RwLock<Option<Arc<MetadataSnapshot>>>,
}

impl MetadataCache {
    pub fn new() -> Self {
        Self {
            snapshot: RwLock::new(None),
        }
    }

    /// Current snapshot, recomputing from the store if invalidated.
    pub fn get_or_rebuild(&self, store: &FilterStore) -> StoreResult<Arc<MetadataSnapshot>> {
        if let Some(snapshot) = self.snapshot.read().unwrap().as_ref() {
            return Ok(Arc::clone(snapshot));
        }

        let snapshot = Arc::new(MetadataSnapshot {
            groups: store.groups()?,
            filters: store.filters()?,
            groups_i18n: store.groups_i18n()?,
            filters_i18n: store.filters_i18n()?,
            computed_at: Utc::now(),
        });
        debug!(
            "Metadata cache rebuilt: {} groups, {} filters",
            snapshot.groups.len(),
            snapshot.filters.len()
        );

        *self.snapshot.write().unwrap() = Some(Arc::clone(&snapshot));
        Ok(snapshot)
    }

    /// Snapshot without touching the store, if one is cached.
    pub fn peek(&self) -> Option<Arc<MetadataSnapshot>> {
        self.snapshot.read().unwrap().clone()
    }

    /// Drop the snapshot; the next read recomputes.
    pub fn invalidate(&self) {
        *self.snapshot.write().unwrap() = None;
    }
}

impl Default for MetadataCache {
    fn default() -> Self {
        Self::new()
    }
}
