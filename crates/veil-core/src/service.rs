//! Filter manager facade
//!
//! `FilterManager` is the boundary consumers talk to: it composes the store,
//! the bundled catalog, the metadata cache, the sync engine, the custom
//! filter importer and the event bus. All mutation entry points report
//! success as booleans; guard rejections (non-editable filter, closed
//! handle, unknown id) are refusals, never panics or errors escaping the
//! boundary.
//!
//! ## Startup sequence
//!
//! ```ignore
//! let manager = FilterManager::with_http_backend(Config::load()?)?;
//! manager.start().await;           // seed on first run, then sync
//! let mut events = manager.subscribe_events();
//! ```

use std::path::Path;
use std::sync::Arc;

use anyhow::{Context, Result};
use tracing::{debug, info, warn};

use crate::cache::MetadataCache;
use crate::catalog::DefaultCatalog;
use crate::config::Config;
use crate::custom::{parse_custom_filter, CustomFilterImporter};
use crate::events::{EventBus, FilterEvent};
use crate::models::{
    CustomFilterParseResult, FilterGroup, FilterMeta, FilterRule, FiltersI18n, GroupsI18n,
};
use crate::store::FilterStore;
use crate::storage::StoreResult;
use crate::sync::{FilterBackend, HttpBackend, SyncEngine, SyncOutcome};

/// The filter-list management engine's public surface.
pub struct FilterManager {
    config: Config,
    store: Arc<FilterStore>,
    catalog: Arc<DefaultCatalog>,
    cache: Arc<MetadataCache>,
    events: EventBus,
    engine: Arc<SyncEngine>,
    importer: CustomFilterImporter,
    backend: Arc<dyn FilterBackend>,
}

impl FilterManager {
    /// Build the manager with an injected backend. Opens the bundled
    /// catalog; the production store stays closed until [`start`].
    ///
    /// [`start`]: FilterManager::start
    pub fn new(config: Config, backend: Arc<dyn FilterBackend>) -> Result<Self> {
        let catalog = Arc::new(
            DefaultCatalog::open(&config.default_db_path)
                .context("Failed to open the bundled default catalog")?,
        );
        let store = Arc::new(FilterStore::new(config.production_db_path()));
        let cache = Arc::new(MetadataCache::new());
        let events = EventBus::new();
        let engine = Arc::new(SyncEngine::new(
            Arc::clone(&store),
            Arc::clone(&catalog),
            Arc::clone(&cache),
            events.clone(),
            Arc::clone(&backend),
            config.locale.clone(),
        ));
        let importer =
            CustomFilterImporter::new(Arc::clone(&store), Arc::clone(&cache), events.clone());

        Ok(Self {
            config,
            store,
            catalog,
            cache,
            events,
            engine,
            importer,
            backend,
        })
    }

    /// Build the manager with the production HTTP backend.
    pub fn with_http_backend(config: Config) -> Result<Self> {
        let backend = Arc::new(HttpBackend::new(&config.backend_url));
        Self::new(config, backend)
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    // ==================== Lifecycle ====================

    /// Bring the store up and run one sync pass.
    ///
    /// First run seeds groups, filters and rules from the bundled catalog
    /// and publishes `Installed`. `Ready` is published once the store is
    /// usable; `NotInstalled` if it cannot be. The trailing sync pass
    /// failing does not fail start.
    pub async fn start(&self) -> bool {
        if let Err(e) = self.store.open() {
            warn!("Failed to open filter store: {}", e);
            self.events.publish(FilterEvent::NotInstalled);
            return false;
        }

        let first_run = match self.store.is_empty() {
            Ok(empty) => empty,
            Err(e) => {
                warn!("Failed to inspect filter store: {}", e);
                self.events.publish(FilterEvent::NotInstalled);
                return false;
            }
        };

        if first_run {
            if let Err(e) = self.store.seed_from_catalog(&self.catalog) {
                warn!("First-run seeding failed: {}", e);
                self.events.publish(FilterEvent::NotInstalled);
                return false;
            }
            self.events.publish(FilterEvent::Installed);
        }

        if let Err(e) = self.store.ensure_special_entities() {
            warn!("Could not provision user-rules filter: {}", e);
            self.events.publish(FilterEvent::NotInstalled);
            return false;
        }

        self.cache.invalidate();
        self.events.publish(FilterEvent::Ready);
        info!("Filter manager started (first_run={})", first_run);

        self.engine.update_filters(false).await;
        true
    }

    /// Release the store handle. Safe to call repeatedly.
    pub fn stop(&self) {
        self.store.close();
        self.cache.invalidate();
    }

    /// Point the manager at a different production database. Refused while
    /// the store is open.
    pub fn set_database(&self, path: impl AsRef<Path>) -> bool {
        self.store.set_path(path)
    }

    /// Re-acquire the store handle after the process returns to the
    /// foreground. Calls made while the handle was released failed with a
    /// not-ready refusal; nothing was queued.
    pub fn application_will_enter_foreground(&self) -> bool {
        if self.store.is_open() {
            return true;
        }
        match self.store.open() {
            Ok(()) => {
                self.cache.invalidate();
                true
            }
            Err(e) => {
                warn!("Failed to re-open filter store: {}", e);
                false
            }
        }
    }

    /// Register an observer for lifecycle events.
    pub fn subscribe_events(&self) -> tokio::sync::broadcast::Receiver<FilterEvent> {
        self.events.subscribe()
    }

    // ==================== Sync ====================

    /// Run one sync pass against the backend catalog. Concurrent calls
    /// coalesce into `Skipped`.
    pub async fn update_filters(&self, force: bool) -> SyncOutcome {
        self.engine.update_filters(force).await
    }

    /// True exactly while a sync pass is in flight.
    pub fn updates_right_now(&self) -> bool {
        self.engine.updates_right_now()
    }

    // ==================== Queries (production store) ====================

    pub fn groups(&self) -> Vec<FilterGroup> {
        match self.cache.get_or_rebuild(&self.store) {
            Ok(snapshot) => snapshot.groups.clone(),
            Err(e) => {
                warn!("groups query failed: {}", e);
                Vec::new()
            }
        }
    }

    pub fn filters(&self) -> Vec<FilterMeta> {
        match self.cache.get_or_rebuild(&self.store) {
            Ok(snapshot) => snapshot.filters.clone(),
            Err(e) => {
                warn!("filters query failed: {}", e);
                Vec::new()
            }
        }
    }

    /// Enabled filters within enabled groups.
    pub fn active_filters(&self) -> Vec<FilterMeta> {
        match self.cache.get_or_rebuild(&self.store) {
            Ok(snapshot) => {
                let enabled_groups: std::collections::HashSet<i32> = snapshot
                    .groups
                    .iter()
                    .filter(|g| g.enabled)
                    .map(|g| g.group_id)
                    .collect();
                snapshot
                    .filters
                    .iter()
                    .filter(|f| f.enabled && enabled_groups.contains(&f.group_id))
                    .cloned()
                    .collect()
            }
            Err(e) => {
                warn!("active_filters query failed: {}", e);
                Vec::new()
            }
        }
    }

    pub fn filters_for_group(&self, group_id: i32) -> Vec<FilterMeta> {
        query("filters_for_group", self.store.filters_for_group(group_id))
    }

    pub fn enabled_filter_ids(&self) -> Vec<i32> {
        query("enabled_filter_ids", self.store.enabled_filter_ids())
    }

    pub fn active_filter_ids(&self) -> Vec<i32> {
        query("active_filter_ids", self.store.active_filter_ids())
    }

    pub fn active_group_ids(&self) -> Vec<i32> {
        query("active_group_ids", self.store.active_group_ids())
    }

    pub fn active_filter_ids_by_group(&self, group_id: i32) -> Vec<i32> {
        query(
            "active_filter_ids_by_group",
            self.store.active_filter_ids_by_group(group_id),
        )
    }

    pub fn rules_for_filter(&self, filter_id: i32) -> Vec<FilterRule> {
        query("rules_for_filter", self.store.rules_for_filter(filter_id))
    }

    pub fn active_rules_for_filter(&self, filter_id: i32) -> Vec<FilterRule> {
        query(
            "active_rules_for_filter",
            self.store.active_rules_for_filter(filter_id),
        )
    }

    pub fn rules_count_for_filter(&self, filter_id: i32) -> i64 {
        query(
            "rules_count_for_filter",
            self.store.rules_count_for_filter(filter_id),
        )
    }

    pub fn groups_i18n(&self) -> GroupsI18n {
        match self.cache.get_or_rebuild(&self.store) {
            Ok(snapshot) => snapshot.groups_i18n.clone(),
            Err(e) => {
                warn!("groups_i18n query failed: {}", e);
                GroupsI18n::new()
            }
        }
    }

    pub fn filters_i18n(&self) -> FiltersI18n {
        match self.cache.get_or_rebuild(&self.store) {
            Ok(snapshot) => snapshot.filters_i18n.clone(),
            Err(e) => {
                warn!("filters_i18n query failed: {}", e);
                FiltersI18n::new()
            }
        }
    }

    pub fn check_if_filter_installed(&self, filter_id: i32) -> bool {
        query(
            "check_if_filter_installed",
            self.store.filter_installed(filter_id),
        )
    }

    pub fn filters_last_update_time(&self) -> Option<chrono::DateTime<chrono::Utc>> {
        query(
            "filters_last_update_time",
            self.store.filters_last_update_time(),
        )
    }

    pub fn custom_filter_id_by_url(&self, url: &str) -> Option<i32> {
        query(
            "custom_filter_id_by_url",
            self.store.custom_filter_id_by_url(url),
        )
    }

    /// Display name for a filter in the configured locale: production
    /// localization first, bundled catalog as fallback, stored name last.
    pub fn localized_filter_name(&self, filter_id: i32) -> Option<String> {
        let locale = &self.config.locale;
        if let Some(l) = self.filters_i18n().localize(filter_id, locale) {
            return Some(l.name.clone());
        }
        if let Ok(i18n) = self.catalog.filters_i18n() {
            if let Some(l) = i18n.localize(filter_id, locale) {
                return Some(l.name.clone());
            }
        }
        self.filters()
            .into_iter()
            .find(|f| f.filter_id == filter_id)
            .map(|f| f.name)
    }

    /// Display name for a group, with the same fallback chain.
    pub fn localized_group_name(&self, group_id: i32) -> Option<String> {
        let locale = &self.config.locale;
        if let Some(name) = self.groups_i18n().localize(group_id, locale) {
            return Some(name.to_string());
        }
        if let Ok(i18n) = self.catalog.groups_i18n() {
            if let Some(name) = i18n.localize(group_id, locale) {
                return Some(name.to_string());
            }
        }
        self.groups()
            .into_iter()
            .find(|g| g.group_id == group_id)
            .map(|g| g.name)
    }

    // ==================== Queries (default catalog) ====================

    pub fn default_db_groups(&self) -> Vec<FilterGroup> {
        query("default_db_groups", self.catalog.groups())
    }

    pub fn default_db_filters(&self) -> Vec<FilterMeta> {
        query("default_db_filters", self.catalog.filters())
    }

    pub fn default_db_groups_i18n(&self) -> GroupsI18n {
        query("default_db_groups_i18n", self.catalog.groups_i18n())
    }

    pub fn default_db_filters_i18n(&self) -> FiltersI18n {
        query("default_db_filters_i18n", self.catalog.filters_i18n())
    }

    // ==================== Mutations ====================

    pub fn set_filter_enabled(&self, filter_id: i32, enabled: bool, from_ui: bool) -> bool {
        let ok = report(
            "set_filter_enabled",
            self.store.set_filter_enabled(filter_id, enabled),
        );
        if ok {
            self.cache.invalidate();
            self.events.publish(FilterEvent::FilterEnabledChanged {
                filter_id,
                enabled,
                from_ui,
            });
        }
        ok
    }

    pub fn set_filters_group_enabled(&self, group_id: i32, enabled: bool) -> bool {
        let ok = report(
            "set_filters_group_enabled",
            self.store.set_group_enabled(group_id, enabled),
        );
        if ok {
            self.cache.invalidate();
        }
        ok
    }

    pub fn set_rules_enabled(&self, filter_id: i32, rule_ids: &[i32], enabled: bool) -> bool {
        let ok = report(
            "set_rules_enabled",
            self.store.set_rules_enabled(filter_id, rule_ids, enabled),
        );
        if ok {
            self.cache.invalidate();
            self.events.publish(FilterEvent::FilterRulesUpdated);
        }
        ok
    }

    /// Refused (false) unless the rule's filter is custom.
    pub fn add_rule(&self, rule: &FilterRule) -> bool {
        let ok = report("add_rule", self.store.add_rule(rule));
        if ok {
            self.cache.invalidate();
            self.events.publish(FilterEvent::FilterRulesUpdated);
        }
        ok
    }

    /// Refused (false) unless the rule's filter is custom.
    pub fn update_rule(&self, rule: &FilterRule) -> bool {
        let ok = report("update_rule", self.store.update_rule(rule));
        if ok {
            self.cache.invalidate();
            self.events.publish(FilterEvent::FilterRulesUpdated);
        }
        ok
    }

    /// Replace an editable filter's rule set wholesale. Refused (false) for
    /// default and subscribed filters.
    pub fn import_rules(&self, filter_id: i32, rules: &[FilterRule]) -> bool {
        let ok = report("import_rules", self.store.import_rules(filter_id, rules));
        if ok {
            self.cache.invalidate();
            self.events.publish(FilterEvent::FilterRulesUpdated);
        }
        ok
    }

    /// Refused (false) unless the filter is custom.
    pub fn remove_rules_for_filter(&self, filter_id: i32) -> bool {
        let ok = report(
            "remove_rules_for_filter",
            self.store.remove_rules_for_filter(filter_id),
        );
        if ok {
            self.cache.invalidate();
            self.events.publish(FilterEvent::FilterRulesUpdated);
        }
        ok
    }

    /// Subscribe to catalog filters: persist metadata, then populate rules
    /// from the bundled catalog when the id ships in the bundle, falling
    /// back to a backend fetch. Returns false only if metadata persistence
    /// fails; a missing rule body leaves the filter present but empty, to
    /// be filled by the next sync pass.
    pub async fn subscribe_filters(&self, metas: Vec<FilterMeta>) -> bool {
        if metas.is_empty() {
            return true;
        }

        // Fetch phase, before any transaction.
        let mut bodies: Vec<(i32, Vec<String>)> = Vec::new();
        for meta in &metas {
            match self.catalog.rules_for_filter(meta.filter_id) {
                Ok(rules) if !rules.is_empty() => {
                    debug!("Using bundled rules for filter {}", meta.filter_id);
                    bodies.push((
                        meta.filter_id,
                        rules.into_iter().map(|r| r.rule_text).collect(),
                    ));
                    continue;
                }
                Ok(_) => {}
                Err(e) => warn!("Default catalog lookup failed: {}", e),
            }
            match self.backend.fetch_rules(meta.filter_id).await {
                Ok(rules) => bodies.push((meta.filter_id, rules)),
                Err(e) => warn!(
                    "Rule body for filter {} unavailable, subscribing empty: {}",
                    meta.filter_id, e
                ),
            }
        }

        let result = self.persist_subscription(&metas, &bodies);
        let ok = report("subscribe_filters", result.map(|_| true));
        if ok {
            self.cache.invalidate();
            self.events.publish(FilterEvent::FilterRulesUpdated);
        }
        ok
    }

    fn persist_subscription(
        &self,
        metas: &[FilterMeta],
        bodies: &[(i32, Vec<String>)],
    ) -> StoreResult<()> {
        self.store.begin_transaction()?;
        let result: StoreResult<()> = (|| {
            self.store.insert_filters(metas)?;
            for (filter_id, rules) in bodies {
                self.store.replace_rules(*filter_id, rules)?;
            }
            Ok(())
        })();
        match result {
            Ok(()) => {
                self.store.commit_transaction()?;
                Ok(())
            }
            Err(e) => {
                self.store.rollback_transaction();
                Err(e)
            }
        }
    }

    /// Remove a filter and its rules.
    pub fn unsubscribe_filter(&self, filter_id: i32) -> bool {
        let ok = report("unsubscribe_filter", self.store.unsubscribe_filter(filter_id));
        if ok {
            self.cache.invalidate();
            self.events.publish(FilterEvent::FilterRulesUpdated);
        }
        ok
    }

    /// Change a custom filter's display name. Silent no-op when the id does
    /// not resolve to a custom filter; validate with
    /// [`check_if_filter_installed`] first.
    ///
    /// [`check_if_filter_installed`]: FilterManager::check_if_filter_installed
    pub fn rename_custom_filter(&self, filter_id: i32, new_name: &str) {
        if let Err(e) = self.store.rename_custom_filter(filter_id, new_name) {
            warn!("rename_custom_filter failed: {}", e);
            return;
        }
        self.cache.invalidate();
    }

    /// Reconcile every group's enabled flag to "contains at least one
    /// enabled filter".
    pub fn enable_groups_with_enabled_filters(&self) -> bool {
        let ok = report(
            "enable_groups_with_enabled_filters",
            self.store.enable_groups_with_enabled_filters(),
        );
        if ok {
            self.cache.invalidate();
        }
        ok
    }

    /// Disable every rule of the user-rules filter.
    pub fn disable_user_rules(&self) -> bool {
        let ok = report("disable_user_rules", self.store.disable_user_rules());
        if ok {
            self.cache.invalidate();
            self.events.publish(FilterEvent::FilterRulesUpdated);
        }
        ok
    }

    // ==================== Custom filters ====================

    /// Fresh id for a custom filter: monotone and never reused.
    pub fn next_custom_filter_id(&self) -> Option<i32> {
        query("next_custom_filter_id", self.store.next_custom_filter_id().map(Some))
    }

    /// Download and parse a custom filter from an arbitrary URL. The parse
    /// result is caller-owned until committed through
    /// [`subscribe_custom_filter_from_result`]; malformed content is
    /// rejected here, before anything can be persisted.
    ///
    /// [`subscribe_custom_filter_from_result`]: FilterManager::subscribe_custom_filter_from_result
    pub async fn fetch_custom_filter(&self, url: &str) -> Result<CustomFilterParseResult> {
        let content = self
            .backend
            .fetch_custom(url)
            .await
            .with_context(|| format!("Failed to download custom filter from {url}"))?;
        parse_custom_filter(url, &content).map_err(Into::into)
    }

    /// Asynchronously persist a parsed custom filter. The completion fires
    /// exactly once with a success flag; see [`CustomFilterImporter`].
    pub fn subscribe_custom_filter_from_result(
        &self,
        result: CustomFilterParseResult,
        completion: impl FnOnce(bool) + Send + 'static,
    ) {
        self.importer.subscribe_from_result(result, completion)
    }

    // ==================== Transactions ====================

    pub fn begin_transaction(&self) -> bool {
        report("begin_transaction", self.store.begin_transaction().map(|_| true))
    }

    pub fn commit_transaction(&self) -> bool {
        report("commit_transaction", self.store.commit_transaction().map(|_| true))
    }

    pub fn rollback_transaction(&self) {
        self.store.rollback_transaction()
    }

    pub fn in_transaction(&self) -> bool {
        self.store.in_transaction()
    }
}

/// Map a store read to its value, logging failures and returning the type's
/// empty value.
fn query<T: Default>(op: &str, result: StoreResult<T>) -> T {
    match result {
        Ok(value) => value,
        Err(e) => {
            warn!("{} failed: {}", op, e);
            T::default()
        }
    }
}

/// Map a store mutation to the boolean contract: guard rejections are quiet
/// refusals, real failures are logged loudly. Both report false.
fn report(op: &str, result: StoreResult<bool>) -> bool {
    match result {
        Ok(ok) => ok,
        Err(e) if e.is_guard_rejection() => {
            debug!("{} refused: {}", op, e);
            false
        }
        Err(e) => {
            warn!("{} failed: {}", op, e);
            false
        }
    }
}
