//! Subscription & sync engine
//!
//! Reconciles the local filter store against the remote catalog. One update
//! pass is a state machine: `Idle -> Updating -> {Completed, Failed,
//! Skipped}`. The network phase runs without any transaction held; the merge
//! opens a single transaction only once every fetch result is in hand, so
//! the write lock is held as briefly as possible.
//!
//! Merge ground rules:
//! - custom filters are never touched
//! - filters present locally but gone from the catalog are left alone
//!   (deletion is user-driven only)
//! - a changed remote version replaces the filter's rule set wholesale
//! - group enabled flags are never altered here
//! - any error after the fetch phase rolls the whole merge back

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use chrono::Utc;
use tokio::sync::watch;
use tracing::{debug, info, warn};

use super::backend::{FilterBackend, RemoteCatalog, RemoteFilter};
use crate::cache::MetadataCache;
use crate::catalog::DefaultCatalog;
use crate::events::{EventBus, FilterEvent};
use crate::models::{primary_subtag, FilterKind, FilterMeta};
use crate::store::FilterStore;
use crate::storage::StoreResult;

/// Terminal state of one update pass.
#[derive(Debug, Clone, PartialEq)]
pub enum SyncOutcome {
    /// Merge committed. Payload: the filters whose version or rule set
    /// actually changed.
    Completed { updated: Vec<FilterMeta> },
    /// Nothing to do: already updating, or metadata already current.
    Skipped,
    /// Backend unreachable or merge error; the store is unchanged.
    Failed,
}

/// One planned merge action, with its rule body already fetched.
struct PlannedChange {
    meta: FilterMeta,
    /// `None` keeps the existing rule set (metadata-only change).
    rules: Option<Vec<String>>,
    is_new: bool,
}

/// Drives remote refresh and merges results into the store.
pub struct SyncEngine {
    store: Arc<FilterStore>,
    catalog: Arc<DefaultCatalog>,
    cache: Arc<MetadataCache>,
    events: EventBus,
    backend: Arc<dyn FilterBackend>,
    locale: String,
    updating: watch::Sender<bool>,
}

impl SyncEngine {
    pub fn new(
        store: Arc<FilterStore>,
        catalog: Arc<DefaultCatalog>,
        cache: Arc<MetadataCache>,
        events: EventBus,
        backend: Arc<dyn FilterBackend>,
        locale: impl Into<String>,
    ) -> Self {
        let (updating, _) = watch::channel(false);
        Self {
            store,
            catalog,
            cache,
            events,
            backend,
            locale: locale.into(),
            updating,
        }
    }

    /// True exactly while an update pass is in flight. This is the single
    /// guard external callers observe instead of racing on internal state.
    pub fn updates_right_now(&self) -> bool {
        *self.updating.borrow()
    }

    /// Watch the updating flag (for UI progress indicators).
    pub fn subscribe_updating(&self) -> watch::Receiver<bool> {
        self.updating.subscribe()
    }

    /// Run one update pass. Concurrent requests while a pass is in flight
    /// coalesce into an immediate `Skipped`; they are never queued.
    ///
    /// `force` skips the catalog-version freshness check.
    pub async fn update_filters(&self, force: bool) -> SyncOutcome {
        if self.updating.send_replace(true) {
            debug!("Update requested while another is in flight; skipping");
            self.events.publish(FilterEvent::UpdateDidNotStart);
            return SyncOutcome::Skipped;
        }

        let outcome = self.run_update(force).await;
        self.updating.send_replace(false);

        match &outcome {
            SyncOutcome::Completed { updated } => {
                info!("Filter update finished: {} filters changed", updated.len())
            }
            SyncOutcome::Skipped => debug!("Filter update skipped"),
            SyncOutcome::Failed => warn!("Filter update failed"),
        }
        outcome
    }

    async fn run_update(&self, force: bool) -> SyncOutcome {
        // Cheap outdated probe before announcing anything.
        let local_version = match self.store.catalog_version() {
            Ok(v) => v,
            Err(e) => {
                warn!("Could not read catalog version marker: {}", e);
                self.cache.invalidate();
                self.events.publish(FilterEvent::UpdateFailed);
                return SyncOutcome::Failed;
            }
        };
        let remote_version = match self.backend.fetch_catalog_version().await {
            Ok(v) => v,
            Err(e) => {
                warn!("Catalog version fetch failed: {}", e);
                self.cache.invalidate();
                self.events.publish(FilterEvent::UpdateFailed);
                return SyncOutcome::Failed;
            }
        };

        if !force && local_version.as_deref() == Some(remote_version.as_str()) {
            debug!("Catalog metadata is current ({}); not updating", remote_version);
            self.events.publish(FilterEvent::UpdateDidNotStart);
            return SyncOutcome::Skipped;
        }

        self.events.publish(FilterEvent::UpdateStarted);

        // Fetch phase: everything needed for the merge, no transaction held.
        let catalog = match self.backend.fetch_catalog().await {
            Ok(c) => c,
            Err(e) => {
                warn!("Catalog fetch failed: {}", e);
                self.events.publish(FilterEvent::UpdateFailed);
                self.cache.invalidate();
                return SyncOutcome::Failed;
            }
        };

        let plan = match self.build_plan(&catalog).await {
            Ok(p) => p,
            Err(e) => {
                warn!("Could not plan merge: {}", e);
                self.events.publish(FilterEvent::UpdateFailed);
                self.cache.invalidate();
                return SyncOutcome::Failed;
            }
        };

        // Merge phase: one transaction around the whole batch.
        match self.apply(&plan, &catalog.version) {
            Ok(updated) => {
                self.cache.invalidate();
                self.events
                    .publish(FilterEvent::UpdateFinished { updated: updated.clone() });
                SyncOutcome::Completed { updated }
            }
            Err(e) => {
                warn!("Merge failed, rolled back: {}", e);
                self.cache.invalidate();
                self.events.publish(FilterEvent::UpdateFailed);
                SyncOutcome::Failed
            }
        }
    }

    /// Decide what the merge will do and fetch the needed rule bodies.
    async fn build_plan(&self, catalog: &RemoteCatalog) -> StoreResult<Vec<PlannedChange>> {
        let local_filters = self.store.filters()?;
        let local_by_id: HashMap<i32, &FilterMeta> = local_filters
            .iter()
            .map(|meta| (meta.filter_id, meta))
            .collect();
        let local_groups: HashSet<i32> = self
            .store
            .groups()?
            .into_iter()
            .map(|group| group.group_id)
            .collect();

        let mut plan = Vec::new();
        for remote in &catalog.filters {
            match local_by_id.get(&remote.filter_id) {
                // Custom filters belong to the user; sync never touches them.
                Some(local) if local.kind == FilterKind::Custom => continue,
                Some(local) => {
                    if local.version.as_deref() == Some(remote.version.as_str()) {
                        continue;
                    }
                    // Version changed: replace the rule set from the backend.
                    // If the body cannot be obtained, keep the old version so
                    // the filter is retried on the next cycle.
                    match self.backend.fetch_rules(remote.filter_id).await {
                        Ok(rules) => plan.push(PlannedChange {
                            meta: meta_from_remote(remote, local.kind),
                            rules: Some(rules),
                            is_new: false,
                        }),
                        Err(e) => {
                            warn!(
                                "Rules for updated filter {} unavailable, deferring: {}",
                                remote.filter_id, e
                            );
                        }
                    }
                }
                None => {
                    if !self.auto_detect_matches(remote, &local_groups) {
                        continue;
                    }
                    // New auto-detected filter: bundled rules if the id ships
                    // in the default catalog, backend otherwise. A missing
                    // body is non-fatal; the filter starts empty.
                    let rules = match self.rules_for_new_filter(remote.filter_id).await {
                        Some(rules) => rules,
                        None => Vec::new(),
                    };
                    plan.push(PlannedChange {
                        meta: meta_from_remote(remote, FilterKind::Subscribed).enabled(true),
                        rules: Some(rules),
                        is_new: true,
                    });
                }
            }
        }
        Ok(plan)
    }

    /// Deterministic auto-detect policy: the filter's group must already be
    /// installed and one of its language codes must match the configured
    /// locale's primary subtag.
    fn auto_detect_matches(&self, remote: &RemoteFilter, local_groups: &HashSet<i32>) -> bool {
        if !local_groups.contains(&remote.group_id) {
            return false;
        }
        let lang = primary_subtag(&self.locale);
        remote.langs.iter().any(|l| primary_subtag(l) == lang)
    }

    async fn rules_for_new_filter(&self, filter_id: i32) -> Option<Vec<String>> {
        match self.catalog.rules_for_filter(filter_id) {
            Ok(rules) if !rules.is_empty() => {
                debug!("Using bundled rules for filter {}", filter_id);
                return Some(rules.into_iter().map(|r| r.rule_text).collect());
            }
            Ok(_) => {}
            Err(e) => warn!("Default catalog lookup failed for {}: {}", filter_id, e),
        }
        match self.backend.fetch_rules(filter_id).await {
            Ok(rules) => Some(rules),
            Err(e) => {
                warn!("Rules for new filter {} unavailable: {}", filter_id, e);
                None
            }
        }
    }

    fn apply(&self, plan: &[PlannedChange], catalog_version: &str) -> StoreResult<Vec<FilterMeta>> {
        self.store.begin_transaction()?;
        let result: StoreResult<Vec<FilterMeta>> = (|| {
            let mut updated = Vec::with_capacity(plan.len());
            for change in plan {
                if change.is_new {
                    self.store
                        .insert_filters(std::slice::from_ref(&change.meta))?;
                } else {
                    self.store.update_filter_meta(&change.meta)?;
                }
                if let Some(rules) = &change.rules {
                    self.store.replace_rules(change.meta.filter_id, rules)?;
                }
                self.events.publish(FilterEvent::UpdatePartCompleted {
                    filter_id: change.meta.filter_id,
                });
                updated.push(change.meta.clone());
            }
            self.store.set_catalog_version(catalog_version)?;
            self.store.set_last_update_time(Utc::now())?;
            Ok(updated)
        })();

        match result {
            Ok(updated) => {
                self.store.commit_transaction()?;
                Ok(updated)
            }
            Err(e) => {
                self.store.rollback_transaction();
                Err(e)
            }
        }
    }
}

fn meta_from_remote(remote: &RemoteFilter, kind: FilterKind) -> FilterMeta {
    FilterMeta {
        filter_id: remote.filter_id,
        group_id: remote.group_id,
        kind,
        enabled: false,
        version: Some(remote.version.clone()),
        name: remote.name.clone(),
        description: remote.description.clone(),
        homepage: remote.homepage.clone(),
        subscription_url: remote.subscription_url.clone(),
        langs: remote.langs.clone(),
        last_update: Some(Utc::now()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testutil::{self, MockBackend};
    use tempfile::TempDir;

    struct Harness {
        _temp_dir: TempDir,
        store: Arc<FilterStore>,
        cache: Arc<MetadataCache>,
        events: EventBus,
        backend: Arc<MockBackend>,
        engine: Arc<SyncEngine>,
    }

    fn harness(version: &str) -> Harness {
        testutil::init_tracing();
        let temp_dir = TempDir::new().unwrap();
        let store = Arc::new(FilterStore::new(temp_dir.path().join("filters.db")));
        store.open().unwrap();
        let catalog =
            Arc::new(DefaultCatalog::open(testutil::build_catalog_db(temp_dir.path())).unwrap());
        store.seed_from_catalog(&catalog).unwrap();

        let cache = Arc::new(MetadataCache::new());
        let events = EventBus::new();
        let backend = Arc::new(MockBackend::new(version));
        let engine = Arc::new(SyncEngine::new(
            Arc::clone(&store),
            catalog,
            Arc::clone(&cache),
            events.clone(),
            Arc::clone(&backend) as Arc<dyn FilterBackend>,
            "en-US",
        ));
        Harness {
            _temp_dir: temp_dir,
            store,
            cache,
            events,
            backend,
            engine,
        }
    }

    fn drain(rx: &mut tokio::sync::broadcast::Receiver<FilterEvent>) -> Vec<FilterEvent> {
        let mut events = Vec::new();
        while let Ok(event) = rx.try_recv() {
            events.push(event);
        }
        events
    }

    #[tokio::test]
    async fn test_successful_update_replaces_rules_and_orders_events() {
        let h = harness("v2");
        h.backend.with_state(|s| {
            s.filters.push(testutil::remote_filter(1, 1, "2.0", &[]));
            s.rules.insert(1, vec!["||new.example^".to_string()]);
        });
        let mut rx = h.events.subscribe();

        let outcome = h.engine.update_filters(false).await;

        let updated = match outcome {
            SyncOutcome::Completed { updated } => updated,
            other => panic!("expected Completed, got {:?}", other),
        };
        assert_eq!(updated.len(), 1);
        assert_eq!(updated[0].filter_id, 1);

        let stored = h.store.filter_meta(1).unwrap().unwrap();
        assert_eq!(stored.version.as_deref(), Some("2.0"));
        // Enabled state survives the metadata update.
        assert!(stored.enabled);

        let rules = h.store.rules_for_filter(1).unwrap();
        assert_eq!(rules.len(), 1);
        assert_eq!(rules[0].rule_text, "||new.example^");

        assert_eq!(h.store.catalog_version().unwrap().as_deref(), Some("v2"));
        assert!(h.store.filters_last_update_time().unwrap().is_some());

        let events = drain(&mut rx);
        assert_eq!(events[0], FilterEvent::UpdateStarted);
        assert_eq!(events[1], FilterEvent::UpdatePartCompleted { filter_id: 1 });
        assert!(matches!(events[2], FilterEvent::UpdateFinished { .. }));
    }

    #[tokio::test]
    async fn test_skip_when_metadata_current() {
        let h = harness("v1");
        h.store.set_catalog_version("v1").unwrap();
        let before = h.store.filters().unwrap();
        let mut rx = h.events.subscribe();

        let outcome = h.engine.update_filters(false).await;

        assert_eq!(outcome, SyncOutcome::Skipped);
        assert_eq!(h.store.filters().unwrap(), before);
        let events = drain(&mut rx);
        assert_eq!(events, vec![FilterEvent::UpdateDidNotStart]);
    }

    #[tokio::test]
    async fn test_concurrent_update_coalesces_to_skip() {
        let h = harness("v2");
        h.backend.with_state(|s| s.version_delay_ms = 200);

        let first = {
            let engine = Arc::clone(&h.engine);
            tokio::spawn(async move { engine.update_filters(false).await })
        };
        tokio::time::sleep(std::time::Duration::from_millis(50)).await;
        assert!(h.engine.updates_right_now());

        let before = h.store.filters().unwrap();
        let second = h.engine.update_filters(false).await;
        assert_eq!(second, SyncOutcome::Skipped);
        assert_eq!(h.store.filters().unwrap(), before);

        first.await.unwrap();
        assert!(!h.engine.updates_right_now());
    }

    #[tokio::test]
    async fn test_backend_unreachable_reports_failed_and_leaves_store_unchanged() {
        let h = harness("v2");
        h.backend.with_state(|s| s.fail_catalog = true);
        let before = h.store.filters().unwrap();
        let mut rx = h.events.subscribe();

        let outcome = h.engine.update_filters(false).await;

        assert_eq!(outcome, SyncOutcome::Failed);
        assert_eq!(h.store.filters().unwrap(), before);
        assert!(h.store.catalog_version().unwrap().is_none());
        let events = drain(&mut rx);
        assert_eq!(
            events,
            vec![FilterEvent::UpdateStarted, FilterEvent::UpdateFailed]
        );
    }

    #[tokio::test]
    async fn test_merge_error_rolls_back_everything() {
        let h = harness("v2");
        // Two changes: a valid one and one whose group id violates the
        // foreign key, so the merge fails after partial work.
        h.backend.with_state(|s| {
            s.filters.push(testutil::remote_filter(1, 1, "2.0", &[]));
            s.filters.push(testutil::remote_filter(3, 99, "2.0", &[]));
            s.rules.insert(1, vec!["||new.example^".to_string()]);
            s.rules.insert(3, vec!["||other.example^".to_string()]);
        });
        let before_filters = h.store.filters().unwrap();
        let before_rules = h.store.rules_for_filter(1).unwrap();

        let outcome = h.engine.update_filters(false).await;

        assert_eq!(outcome, SyncOutcome::Failed);
        // No partial rows: the valid change was rolled back with the batch.
        assert_eq!(h.store.filters().unwrap(), before_filters);
        assert_eq!(h.store.rules_for_filter(1).unwrap(), before_rules);
        assert!(h.store.catalog_version().unwrap().is_none());
        assert!(h.store.filters_last_update_time().unwrap().is_none());
    }

    #[tokio::test]
    async fn test_auto_detect_installs_locale_matched_filters_only() {
        let h = harness("v2");
        h.backend.with_state(|s| {
            // Matches: installed group 1, lang "en" (locale is en-US).
            s.filters.push(testutil::remote_filter(100, 1, "1.0", &["en"]));
            // Wrong language.
            s.filters.push(testutil::remote_filter(101, 1, "1.0", &["fr"]));
            // Group not installed locally.
            s.filters.push(testutil::remote_filter(102, 99, "1.0", &["en"]));
            s.rules.insert(100, vec!["||en.example^".to_string()]);
        });

        let outcome = h.engine.update_filters(false).await;

        let updated = match outcome {
            SyncOutcome::Completed { updated } => updated,
            other => panic!("expected Completed, got {:?}", other),
        };
        assert_eq!(updated.len(), 1);
        assert_eq!(updated[0].filter_id, 100);

        let installed = h.store.filter_meta(100).unwrap().unwrap();
        assert_eq!(installed.kind, FilterKind::Subscribed);
        assert!(installed.enabled);
        assert_eq!(h.store.rules_for_filter(100).unwrap().len(), 1);

        assert!(!h.store.filter_installed(101).unwrap());
        assert!(!h.store.filter_installed(102).unwrap());
    }

    #[tokio::test]
    async fn test_auto_detect_prefers_bundled_rules() {
        let h = harness("v2");
        // Filter 3 ships in the default catalog; remove it locally so the
        // remote entry is treated as new.
        h.store.unsubscribe_filter(3).unwrap();
        h.backend.with_state(|s| {
            s.filters.push(testutil::remote_filter(3, 2, "1.0", &["en"]));
        });

        let outcome = h.engine.update_filters(false).await;
        assert!(matches!(outcome, SyncOutcome::Completed { .. }));

        // Rules came from the bundle, no backend body fetch for id 3.
        assert_eq!(h.store.rules_for_filter(3).unwrap().len(), 1);
        assert!(!h.backend.rules_fetched().contains(&3));
    }

    #[tokio::test]
    async fn test_new_filter_rule_failure_is_non_fatal() {
        let h = harness("v2");
        h.backend.with_state(|s| {
            s.filters.push(testutil::remote_filter(100, 1, "1.0", &["en"]));
            s.fail_rules = true;
        });

        let outcome = h.engine.update_filters(false).await;

        assert!(matches!(outcome, SyncOutcome::Completed { .. }));
        assert!(h.store.filter_installed(100).unwrap());
        assert!(h.store.rules_for_filter(100).unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_update_rule_failure_defers_filter() {
        let h = harness("v2");
        h.backend.with_state(|s| {
            s.filters.push(testutil::remote_filter(1, 1, "2.0", &[]));
            s.fail_rules = true;
        });

        let outcome = h.engine.update_filters(false).await;

        // Pass completes, but filter 1 keeps its old version and rules so
        // the next cycle retries it.
        let updated = match outcome {
            SyncOutcome::Completed { updated } => updated,
            other => panic!("expected Completed, got {:?}", other),
        };
        assert!(updated.is_empty());
        let stored = h.store.filter_meta(1).unwrap().unwrap();
        assert_eq!(stored.version.as_deref(), Some("1.0"));
        assert_eq!(h.store.rules_for_filter(1).unwrap().len(), 2);
    }

    #[tokio::test]
    async fn test_locally_removed_remote_filters_left_untouched() {
        let h = harness("v2");
        // Remote catalog no longer carries filters 1..3; nothing is deleted.
        let outcome = h.engine.update_filters(false).await;
        assert!(matches!(outcome, SyncOutcome::Completed { .. }));
        assert_eq!(h.store.filters().unwrap().len(), 3);
    }

    #[tokio::test]
    async fn test_sync_never_alters_group_enabled_state() {
        let h = harness("v2");
        h.backend.with_state(|s| {
            s.filters.push(testutil::remote_filter(100, 2, "1.0", &["en"]));
            s.rules.insert(100, vec!["||x^".to_string()]);
        });
        let groups_before = h.store.groups().unwrap();

        h.engine.update_filters(false).await;

        assert_eq!(h.store.groups().unwrap(), groups_before);
    }

    #[tokio::test]
    async fn test_cache_invalidated_on_completion_and_failure() {
        let h = harness("v2");
        h.cache.get_or_rebuild(&h.store).unwrap();
        h.backend.with_state(|s| {
            s.filters.push(testutil::remote_filter(1, 1, "2.0", &[]));
            s.rules.insert(1, vec!["||new^".to_string()]);
        });
        h.engine.update_filters(false).await;
        assert!(h.cache.peek().is_none());

        h.cache.get_or_rebuild(&h.store).unwrap();
        h.backend.with_state(|s| {
            s.version = "v3".to_string();
            s.fail_catalog = true;
        });
        h.engine.update_filters(false).await;
        assert!(h.cache.peek().is_none());
    }
}
