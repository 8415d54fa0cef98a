//! Transactional filter store
//!
//! `FilterStore` owns the production database: groups, filters, rules, the
//! localization projections and the service markers. All connection access
//! serializes through one mutex; the same mutex guards the reentrant
//! transaction depth counter, so there is a single write arbiter.
//!
//! ## Handle lifecycle
//!
//! The store starts `Closed`. `open()` connects and initializes the schema,
//! `close()` releases the handle (used when the process is backgrounded so
//! the database file is not kept locked). Any operation against a closed
//! store fails with [`StoreError::NotReady`]; nothing is queued.
//!
//! ## Transactions
//!
//! `begin_transaction()` nests: a nested begin is a no-op success and only
//! the outermost commit/rollback executes SQL. An inner rollback poisons the
//! transaction, so the outermost resolution rolls back regardless. This is
//! the shape the sync engine relies on to wrap an entire merge in one
//! transaction spanning many store calls.

use std::path::{Path, PathBuf};
use std::sync::Mutex;

use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension};
use tracing::{debug, info, warn};

use crate::catalog::DefaultCatalog;
use crate::models::{
    FilterGroup, FilterKind, FilterLocalization, FilterMeta, FilterRule, FiltersI18n, GroupsI18n,
    CUSTOM_FILTER_ID_BASE, SPECIAL_GROUP_ID, USER_FILTER_ID,
};
use crate::storage::{
    self, init_schema, needs_init, StoreError, StoreResult, FILTER_COLUMNS, GROUP_COLUMNS,
    RULE_COLUMNS,
};

const META_LAST_UPDATE: &str = "last_update_time";
const META_CATALOG_VERSION: &str = "catalog_version";
const META_NEXT_CUSTOM_ID: &str = "next_custom_filter_id";

struct StoreInner {
    path: PathBuf,
    conn: Option<Connection>,
    tx_depth: u32,
    tx_poisoned: bool,
}

impl StoreInner {
    fn conn(&self) -> StoreResult<&Connection> {
        self.conn.as_ref().ok_or(StoreError::NotReady)
    }

    fn begin(&mut self) -> StoreResult<()> {
        let conn = self.conn.as_ref().ok_or(StoreError::NotReady)?;
        if self.tx_depth == 0 {
            conn.execute_batch("BEGIN IMMEDIATE")?;
            self.tx_poisoned = false;
        }
        self.tx_depth += 1;
        Ok(())
    }

    /// Outermost commit executes SQL; a poisoned transaction resolves to a
    /// rollback instead.
    fn commit(&mut self) -> StoreResult<()> {
        let conn = self.conn.as_ref().ok_or(StoreError::NotReady)?;
        if self.tx_depth == 0 {
            return Ok(());
        }
        self.tx_depth -= 1;
        if self.tx_depth == 0 {
            if self.tx_poisoned {
                self.tx_poisoned = false;
                conn.execute_batch("ROLLBACK")?;
                warn!("Transaction was poisoned by an inner rollback; rolled back");
            } else {
                conn.execute_batch("COMMIT")?;
            }
        }
        Ok(())
    }

    fn rollback(&mut self) {
        if self.tx_depth == 0 {
            return;
        }
        self.tx_poisoned = true;
        self.tx_depth -= 1;
        if self.tx_depth == 0 {
            self.tx_poisoned = false;
            if let Some(conn) = &self.conn {
                if let Err(e) = conn.execute_batch("ROLLBACK") {
                    warn!("Rollback failed: {}", e);
                }
            }
        }
    }
}

/// Transactional database abstraction over groups, filters and rules.
pub struct FilterStore {
    inner: Mutex<StoreInner>,
}

impl FilterStore {
    /// Create a store for the given database path. The handle stays closed
    /// until [`FilterStore::open`] is called.
    pub fn new(path: impl AsRef<Path>) -> Self {
        Self {
            inner: Mutex::new(StoreInner {
                path: path.as_ref().to_path_buf(),
                conn: None,
                tx_depth: 0,
                tx_poisoned: false,
            }),
        }
    }

    /// Swap the database path. Refused (returns false) while the handle is
    /// open; callers must stop the service first.
    pub fn set_path(&self, path: impl AsRef<Path>) -> bool {
        let mut inner = self.inner.lock().unwrap();
        if inner.conn.is_some() {
            warn!("set_path refused: store handle is open");
            return false;
        }
        inner.path = path.as_ref().to_path_buf();
        true
    }

    /// Open the database handle and initialize the schema if needed.
    /// Idempotent: opening an already open store is a no-op.
    pub fn open(&self) -> StoreResult<()> {
        let mut inner = self.inner.lock().unwrap();
        if inner.conn.is_some() {
            return Ok(());
        }

        if let Some(parent) = inner.path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }

        let conn = Connection::open(&inner.path).map_err(|source| StoreError::Open {
            path: inner.path.clone(),
            source,
        })?;
        conn.execute_batch("PRAGMA foreign_keys = ON;")?;
        conn.pragma_update(None, "journal_mode", "WAL")?;
        conn.busy_timeout(std::time::Duration::from_secs(5))?;

        if needs_init(&conn) {
            init_schema(&conn)?;
        }

        info!("Filter store opened at {:?}", inner.path);
        inner.conn = Some(conn);
        inner.tx_depth = 0;
        inner.tx_poisoned = false;
        Ok(())
    }

    /// Release the database handle. An open transaction is rolled back.
    pub fn close(&self) {
        let mut inner = self.inner.lock().unwrap();
        if inner.tx_depth > 0 {
            warn!("Store closed with an open transaction; rolling back");
            if let Some(conn) = &inner.conn {
                let _ = conn.execute_batch("ROLLBACK");
            }
            inner.tx_depth = 0;
            inner.tx_poisoned = false;
        }
        if inner.conn.take().is_some() {
            debug!("Filter store handle released");
        }
    }

    pub fn is_open(&self) -> bool {
        self.inner.lock().unwrap().conn.is_some()
    }

    fn with_conn<T>(&self, f: impl FnOnce(&Connection) -> StoreResult<T>) -> StoreResult<T> {
        let inner = self.inner.lock().unwrap();
        let conn = inner.conn()?;
        f(conn)
    }

    /// Run `f` inside a (possibly nested) transaction, committing on success
    /// and rolling back on error.
    fn in_tx<T>(&self, f: impl FnOnce(&Connection) -> StoreResult<T>) -> StoreResult<T> {
        let mut inner = self.inner.lock().unwrap();
        inner.begin()?;
        let result = match inner.conn() {
            Ok(conn) => f(conn),
            Err(e) => Err(e),
        };
        match result {
            Ok(value) => {
                inner.commit()?;
                Ok(value)
            }
            // Guard refusals fire before any write, so an enclosing
            // transaction stays healthy; real failures poison it.
            Err(e) if e.is_guard_rejection() => {
                let _ = inner.commit();
                Err(e)
            }
            Err(e) => {
                inner.rollback();
                Err(e)
            }
        }
    }

    // ==================== Transaction primitives ====================

    /// Reentrant: a nested begin on an open transaction is a no-op success.
    pub fn begin_transaction(&self) -> StoreResult<()> {
        self.inner.lock().unwrap().begin()
    }

    /// Only the outermost commit executes SQL.
    pub fn commit_transaction(&self) -> StoreResult<()> {
        self.inner.lock().unwrap().commit()
    }

    /// An inner rollback poisons the transaction; the outermost resolution
    /// then rolls back even if it is a commit.
    pub fn rollback_transaction(&self) {
        self.inner.lock().unwrap().rollback()
    }

    pub fn in_transaction(&self) -> bool {
        self.inner.lock().unwrap().tx_depth > 0
    }

    // ==================== Queries ====================

    pub fn groups(&self) -> StoreResult<Vec<FilterGroup>> {
        self.with_conn(|conn| {
            let mut stmt = conn.prepare(&format!(
                "SELECT {GROUP_COLUMNS} FROM filter_groups ORDER BY display_number, group_id"
            ))?;
            let groups = stmt
                .query_map([], storage::group_from_row)?
                .collect::<Result<Vec<_>, _>>()?;
            Ok(groups)
        })
    }

    pub fn filters(&self) -> StoreResult<Vec<FilterMeta>> {
        self.with_conn(|conn| {
            let mut stmt = conn.prepare(&format!(
                "SELECT {FILTER_COLUMNS} FROM filters ORDER BY group_id, filter_id"
            ))?;
            let filters = stmt
                .query_map([], storage::filter_from_row)?
                .collect::<Result<Vec<_>, _>>()?;
            Ok(filters)
        })
    }

    pub fn filters_for_group(&self, group_id: i32) -> StoreResult<Vec<FilterMeta>> {
        self.with_conn(|conn| {
            let mut stmt = conn.prepare(&format!(
                "SELECT {FILTER_COLUMNS} FROM filters WHERE group_id = ? ORDER BY filter_id"
            ))?;
            let filters = stmt
                .query_map(params![group_id], storage::filter_from_row)?
                .collect::<Result<Vec<_>, _>>()?;
            Ok(filters)
        })
    }

    pub fn filter_meta(&self, filter_id: i32) -> StoreResult<Option<FilterMeta>> {
        self.with_conn(|conn| {
            let mut stmt = conn.prepare(&format!(
                "SELECT {FILTER_COLUMNS} FROM filters WHERE filter_id = ?"
            ))?;
            Ok(stmt
                .query_row(params![filter_id], storage::filter_from_row)
                .optional()?)
        })
    }

    pub fn filter_installed(&self, filter_id: i32) -> StoreResult<bool> {
        self.with_conn(|conn| {
            let mut stmt = conn.prepare("SELECT 1 FROM filters WHERE filter_id = ?")?;
            Ok(stmt.exists(params![filter_id])?)
        })
    }

    /// All rules of a filter, enabled or not, in rule id order.
    pub fn rules_for_filter(&self, filter_id: i32) -> StoreResult<Vec<FilterRule>> {
        self.with_conn(|conn| {
            let mut stmt = conn.prepare(&format!(
                "SELECT {RULE_COLUMNS} FROM filter_rules WHERE filter_id = ? ORDER BY rule_id"
            ))?;
            let rules = stmt
                .query_map(params![filter_id], storage::rule_from_row)?
                .collect::<Result<Vec<_>, _>>()?;
            Ok(rules)
        })
    }

    /// Rules that should reach the blocking engine: the rule, its filter and
    /// the filter's group must all be enabled. A disabled filter yields the
    /// empty set regardless of per-rule flags.
    pub fn active_rules_for_filter(&self, filter_id: i32) -> StoreResult<Vec<FilterRule>> {
        self.with_conn(|conn| {
            let mut stmt = conn.prepare(
                "SELECT r.filter_id, r.rule_id, r.rule_text, r.enabled
                 FROM filter_rules r
                 JOIN filters f ON f.filter_id = r.filter_id
                 JOIN filter_groups g ON g.group_id = f.group_id
                 WHERE r.filter_id = ? AND r.enabled = 1 AND f.enabled = 1 AND g.enabled = 1
                 ORDER BY r.rule_id",
            )?;
            let rules = stmt
                .query_map(params![filter_id], storage::rule_from_row)?
                .collect::<Result<Vec<_>, _>>()?;
            Ok(rules)
        })
    }

    /// Rule count including disabled rules.
    pub fn rules_count_for_filter(&self, filter_id: i32) -> StoreResult<i64> {
        self.with_conn(|conn| {
            Ok(conn.query_row(
                "SELECT COUNT(*) FROM filter_rules WHERE filter_id = ?",
                params![filter_id],
                |row| row.get(0),
            )?)
        })
    }

    pub fn enabled_filter_ids(&self) -> StoreResult<Vec<i32>> {
        self.with_conn(|conn| {
            let mut stmt =
                conn.prepare("SELECT filter_id FROM filters WHERE enabled = 1 ORDER BY filter_id")?;
            let ids = stmt
                .query_map([], |row| row.get(0))?
                .collect::<Result<Vec<_>, _>>()?;
            Ok(ids)
        })
    }

    /// Enabled filters whose group is also enabled.
    pub fn active_filter_ids(&self) -> StoreResult<Vec<i32>> {
        self.with_conn(|conn| {
            let mut stmt = conn.prepare(
                "SELECT f.filter_id FROM filters f
                 JOIN filter_groups g ON g.group_id = f.group_id
                 WHERE f.enabled = 1 AND g.enabled = 1
                 ORDER BY f.filter_id",
            )?;
            let ids = stmt
                .query_map([], |row| row.get(0))?
                .collect::<Result<Vec<_>, _>>()?;
            Ok(ids)
        })
    }

    pub fn active_group_ids(&self) -> StoreResult<Vec<i32>> {
        self.with_conn(|conn| {
            let mut stmt = conn
                .prepare("SELECT group_id FROM filter_groups WHERE enabled = 1 ORDER BY group_id")?;
            let ids = stmt
                .query_map([], |row| row.get(0))?
                .collect::<Result<Vec<_>, _>>()?;
            Ok(ids)
        })
    }

    pub fn active_filter_ids_by_group(&self, group_id: i32) -> StoreResult<Vec<i32>> {
        self.with_conn(|conn| {
            let mut stmt = conn.prepare(
                "SELECT f.filter_id FROM filters f
                 JOIN filter_groups g ON g.group_id = f.group_id
                 WHERE f.group_id = ? AND f.enabled = 1 AND g.enabled = 1
                 ORDER BY f.filter_id",
            )?;
            let ids = stmt
                .query_map(params![group_id], |row| row.get(0))?
                .collect::<Result<Vec<_>, _>>()?;
            Ok(ids)
        })
    }

    pub fn groups_i18n(&self) -> StoreResult<GroupsI18n> {
        self.with_conn(|conn| {
            let mut stmt = conn.prepare("SELECT group_id, locale, name FROM filter_groups_i18n")?;
            let mut i18n = GroupsI18n::new();
            let rows = stmt.query_map([], |row| {
                Ok((
                    row.get::<_, i32>(0)?,
                    row.get::<_, String>(1)?,
                    row.get::<_, String>(2)?,
                ))
            })?;
            for row in rows {
                let (group_id, locale, name) = row?;
                i18n.insert(group_id, locale, name);
            }
            Ok(i18n)
        })
    }

    pub fn filters_i18n(&self) -> StoreResult<FiltersI18n> {
        self.with_conn(|conn| {
            let mut stmt =
                conn.prepare("SELECT filter_id, locale, name, description FROM filters_i18n")?;
            let mut i18n = FiltersI18n::new();
            let rows = stmt.query_map([], |row| {
                Ok((
                    row.get::<_, i32>(0)?,
                    row.get::<_, String>(1)?,
                    row.get::<_, String>(2)?,
                    row.get::<_, Option<String>>(3)?,
                ))
            })?;
            for row in rows {
                let (filter_id, locale, name, description) = row?;
                i18n.insert(filter_id, locale, FilterLocalization { name, description });
            }
            Ok(i18n)
        })
    }

    /// Exact-match lookup over custom filters' subscription URLs. No URL
    /// normalization: case and scheme must match byte for byte.
    pub fn custom_filter_id_by_url(&self, url: &str) -> StoreResult<Option<i32>> {
        self.with_conn(|conn| {
            Ok(conn
                .query_row(
                    "SELECT filter_id FROM filters
                     WHERE kind = 'custom' AND subscription_url = ?",
                    params![url],
                    |row| row.get(0),
                )
                .optional()?)
        })
    }

    pub fn filters_last_update_time(&self) -> StoreResult<Option<DateTime<Utc>>> {
        self.with_conn(|conn| {
            let millis = meta_get(conn, META_LAST_UPDATE)?;
            Ok(millis
                .and_then(|s| s.parse::<i64>().ok())
                .and_then(DateTime::from_timestamp_millis))
        })
    }

    pub fn set_last_update_time(&self, time: DateTime<Utc>) -> StoreResult<()> {
        self.in_tx(|conn| meta_set(conn, META_LAST_UPDATE, &time.timestamp_millis().to_string()))
    }

    /// Last successfully merged backend catalog version, if any.
    pub fn catalog_version(&self) -> StoreResult<Option<String>> {
        self.with_conn(|conn| meta_get(conn, META_CATALOG_VERSION))
    }

    pub fn set_catalog_version(&self, version: &str) -> StoreResult<()> {
        self.in_tx(|conn| meta_set(conn, META_CATALOG_VERSION, version))
    }

    /// True when the store holds no groups and no filters (first run).
    pub fn is_empty(&self) -> StoreResult<bool> {
        self.with_conn(|conn| {
            let groups: i64 =
                conn.query_row("SELECT COUNT(*) FROM filter_groups", [], |row| row.get(0))?;
            let filters: i64 =
                conn.query_row("SELECT COUNT(*) FROM filters", [], |row| row.get(0))?;
            Ok(groups == 0 && filters == 0)
        })
    }

    // ==================== Flag mutations ====================

    /// Returns false if the filter id is unknown.
    pub fn set_filter_enabled(&self, filter_id: i32, enabled: bool) -> StoreResult<bool> {
        self.in_tx(|conn| {
            let changed = conn.execute(
                "UPDATE filters SET enabled = ? WHERE filter_id = ?",
                params![enabled, filter_id],
            )?;
            Ok(changed > 0)
        })
    }

    pub fn set_group_enabled(&self, group_id: i32, enabled: bool) -> StoreResult<bool> {
        self.in_tx(|conn| {
            let changed = conn.execute(
                "UPDATE filter_groups SET enabled = ? WHERE group_id = ?",
                params![enabled, group_id],
            )?;
            Ok(changed > 0)
        })
    }

    /// Flip the enabled flag on a set of rules atomically: readers never
    /// observe a partially applied set. Not gated on editability; per-rule
    /// toggling is allowed for every filter kind.
    pub fn set_rules_enabled(
        &self,
        filter_id: i32,
        rule_ids: &[i32],
        enabled: bool,
    ) -> StoreResult<bool> {
        self.in_tx(|conn| {
            let mut stmt = conn.prepare(
                "UPDATE filter_rules SET enabled = ? WHERE filter_id = ? AND rule_id = ?",
            )?;
            for rule_id in rule_ids {
                stmt.execute(params![enabled, filter_id, rule_id])?;
            }
            Ok(true)
        })
    }

    /// Reconcile every group's enabled flag to "contains at least one
    /// enabled filter". The only operation that touches group flags in bulk;
    /// sync never does.
    pub fn enable_groups_with_enabled_filters(&self) -> StoreResult<bool> {
        self.in_tx(|conn| {
            conn.execute(
                "UPDATE filter_groups SET enabled = EXISTS(
                     SELECT 1 FROM filters
                     WHERE filters.group_id = filter_groups.group_id AND filters.enabled = 1
                 )",
                [],
            )?;
            Ok(true)
        })
    }

    /// Disable every rule of the reserved user-rules filter. The filter
    /// itself stays enabled so newly added rules surface immediately.
    pub fn disable_user_rules(&self) -> StoreResult<bool> {
        self.in_tx(|conn| {
            conn.execute(
                "UPDATE filter_rules SET enabled = 0 WHERE filter_id = ?",
                params![USER_FILTER_ID],
            )?;
            Ok(true)
        })
    }

    // ==================== Rule mutations (editable-guarded) ====================

    /// Insert a rule into an editable (custom) filter. A `rule_id` of 0
    /// allocates the next free id within the filter.
    pub fn add_rule(&self, rule: &FilterRule) -> StoreResult<bool> {
        self.in_tx(|conn| {
            require_editable(conn, rule.filter_id)?;
            let rule_id = if rule.rule_id == 0 {
                next_rule_id(conn, rule.filter_id)?
            } else {
                rule.rule_id
            };
            conn.execute(
                "INSERT INTO filter_rules (filter_id, rule_id, rule_text, enabled)
                 VALUES (?, ?, ?, ?)",
                params![rule.filter_id, rule_id, rule.rule_text, rule.enabled],
            )?;
            Ok(true)
        })
    }

    /// Update a rule's text and enabled flag, keyed by (filter_id, rule_id).
    pub fn update_rule(&self, rule: &FilterRule) -> StoreResult<bool> {
        self.in_tx(|conn| {
            require_editable(conn, rule.filter_id)?;
            let changed = conn.execute(
                "UPDATE filter_rules SET rule_text = ?, enabled = ?
                 WHERE filter_id = ? AND rule_id = ?",
                params![rule.rule_text, rule.enabled, rule.filter_id, rule.rule_id],
            )?;
            Ok(changed > 0)
        })
    }

    /// Replace the whole rule set of an editable filter.
    pub fn import_rules(&self, filter_id: i32, rules: &[FilterRule]) -> StoreResult<bool> {
        self.in_tx(|conn| {
            require_editable(conn, filter_id)?;
            conn.execute(
                "DELETE FROM filter_rules WHERE filter_id = ?",
                params![filter_id],
            )?;
            let mut stmt = conn.prepare(
                "INSERT INTO filter_rules (filter_id, rule_id, rule_text, enabled)
                 VALUES (?, ?, ?, ?)",
            )?;
            for (i, rule) in rules.iter().enumerate() {
                let rule_id = if rule.rule_id == 0 {
                    i as i32 + 1
                } else {
                    rule.rule_id
                };
                stmt.execute(params![filter_id, rule_id, rule.rule_text, rule.enabled])?;
            }
            Ok(true)
        })
    }

    /// Delete every rule of an editable filter.
    pub fn remove_rules_for_filter(&self, filter_id: i32) -> StoreResult<bool> {
        self.in_tx(|conn| {
            require_editable(conn, filter_id)?;
            conn.execute(
                "DELETE FROM filter_rules WHERE filter_id = ?",
                params![filter_id],
            )?;
            Ok(true)
        })
    }

    // ==================== Filter lifecycle ====================

    /// Insert filter metadata rows. An existing row with the same id has its
    /// metadata updated in place; its rules are left alone.
    pub fn insert_filters(&self, metas: &[FilterMeta]) -> StoreResult<bool> {
        self.in_tx(|conn| {
            let mut stmt = conn.prepare(
                "INSERT INTO filters (filter_id, group_id, kind, enabled, version, name,
                                      description, homepage, subscription_url, langs, last_update)
                 VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
                 ON CONFLICT(filter_id) DO UPDATE SET
                     group_id = excluded.group_id,
                     kind = excluded.kind,
                     version = excluded.version,
                     name = excluded.name,
                     description = excluded.description,
                     homepage = excluded.homepage,
                     subscription_url = excluded.subscription_url,
                     langs = excluded.langs,
                     last_update = excluded.last_update",
            )?;
            for meta in metas {
                stmt.execute(params![
                    meta.filter_id,
                    meta.group_id,
                    meta.kind.as_str(),
                    meta.enabled,
                    meta.version,
                    meta.name,
                    meta.description,
                    meta.homepage,
                    meta.subscription_url,
                    storage::langs_to_json(&meta.langs),
                    meta.last_update.map(|t| t.timestamp_millis()),
                ])?;
            }
            Ok(true)
        })
    }

    /// Update a filter's metadata from a newer catalog entry. Deliberately
    /// leaves `kind` and `enabled` untouched: sync never flips user-visible
    /// enablement.
    pub fn update_filter_meta(&self, meta: &FilterMeta) -> StoreResult<bool> {
        self.in_tx(|conn| {
            let changed = conn.execute(
                "UPDATE filters SET group_id = ?, version = ?, name = ?, description = ?,
                        homepage = ?, subscription_url = ?, langs = ?, last_update = ?
                 WHERE filter_id = ?",
                params![
                    meta.group_id,
                    meta.version,
                    meta.name,
                    meta.description,
                    meta.homepage,
                    meta.subscription_url,
                    storage::langs_to_json(&meta.langs),
                    meta.last_update.map(|t| t.timestamp_millis()),
                    meta.filter_id,
                ],
            )?;
            Ok(changed > 0)
        })
    }

    /// Wholesale rule replacement used by sync and subscription: delete all,
    /// insert the new set enabled with sequential ids. Not editable-guarded;
    /// this is how default and subscribed filters receive their rule bodies.
    pub(crate) fn replace_rules(&self, filter_id: i32, texts: &[String]) -> StoreResult<()> {
        self.in_tx(|conn| {
            conn.execute(
                "DELETE FROM filter_rules WHERE filter_id = ?",
                params![filter_id],
            )?;
            let mut stmt = conn.prepare(
                "INSERT INTO filter_rules (filter_id, rule_id, rule_text, enabled)
                 VALUES (?, ?, ?, 1)",
            )?;
            for (i, text) in texts.iter().enumerate() {
                stmt.execute(params![filter_id, i as i32 + 1, text])?;
            }
            Ok(())
        })
    }

    /// Cascade-delete a filter and its rules.
    pub fn unsubscribe_filter(&self, filter_id: i32) -> StoreResult<bool> {
        self.in_tx(|conn| {
            let changed = conn.execute(
                "DELETE FROM filters WHERE filter_id = ?",
                params![filter_id],
            )?;
            Ok(changed > 0)
        })
    }

    /// Rename a custom filter's display name. Silent no-op when the id does
    /// not resolve to a custom filter.
    pub fn rename_custom_filter(&self, filter_id: i32, new_name: &str) -> StoreResult<()> {
        self.in_tx(|conn| {
            conn.execute(
                "UPDATE filters SET name = ? WHERE filter_id = ? AND kind = 'custom'",
                params![new_name, filter_id],
            )?;
            Ok(())
        })
    }

    /// Allocate a fresh custom filter id: monotone, disjoint from every
    /// existing filter id, and never reused even after deletion (the high
    /// water mark is persisted).
    pub fn next_custom_filter_id(&self) -> StoreResult<i32> {
        self.in_tx(|conn| {
            let stored = meta_get(conn, META_NEXT_CUSTOM_ID)?
                .and_then(|s| s.parse::<i32>().ok())
                .unwrap_or(CUSTOM_FILTER_ID_BASE);
            let max_existing: Option<i32> =
                conn.query_row("SELECT MAX(filter_id) FROM filters", [], |row| row.get(0))?;
            let next = stored
                .max(max_existing.map_or(CUSTOM_FILTER_ID_BASE, |m| m + 1))
                .max(CUSTOM_FILTER_ID_BASE);
            meta_set(conn, META_NEXT_CUSTOM_ID, &(next + 1).to_string())?;
            Ok(next)
        })
    }

    /// Make sure the special group and the user-rules filter exist. Invoked
    /// at service start and before custom filter inserts; idempotent.
    pub fn ensure_special_entities(&self) -> StoreResult<()> {
        self.in_tx(ensure_special_entities)
    }

    // ==================== Seeding ====================

    /// First-run population: copy groups, filters, rules and localization
    /// tables verbatim from the bundled catalog. Runs in one transaction.
    /// Returns the number of filters seeded.
    pub fn seed_from_catalog(&self, catalog: &DefaultCatalog) -> StoreResult<usize> {
        let groups = catalog.groups()?;
        let filters = catalog.filters()?;
        let groups_i18n = catalog.groups_i18n()?;
        let filters_i18n = catalog.filters_i18n()?;
        let mut rules_by_filter = Vec::with_capacity(filters.len());
        for filter in &filters {
            rules_by_filter.push((filter.filter_id, catalog.rules_for_filter(filter.filter_id)?));
        }

        let seeded = filters.len();
        self.in_tx(|conn| {
            let mut group_stmt = conn.prepare(
                "INSERT OR REPLACE INTO filter_groups (group_id, name, display_number, enabled)
                 VALUES (?, ?, ?, ?)",
            )?;
            for group in &groups {
                group_stmt.execute(params![
                    group.group_id,
                    group.name,
                    group.display_number,
                    group.enabled
                ])?;
            }

            let mut filter_stmt = conn.prepare(
                "INSERT OR REPLACE INTO filters
                     (filter_id, group_id, kind, enabled, version, name, description,
                      homepage, subscription_url, langs, last_update)
                 VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
            )?;
            for meta in &filters {
                filter_stmt.execute(params![
                    meta.filter_id,
                    meta.group_id,
                    meta.kind.as_str(),
                    meta.enabled,
                    meta.version,
                    meta.name,
                    meta.description,
                    meta.homepage,
                    meta.subscription_url,
                    storage::langs_to_json(&meta.langs),
                    meta.last_update.map(|t| t.timestamp_millis()),
                ])?;
            }

            let mut rule_stmt = conn.prepare(
                "INSERT OR REPLACE INTO filter_rules (filter_id, rule_id, rule_text, enabled)
                 VALUES (?, ?, ?, ?)",
            )?;
            for (filter_id, rules) in &rules_by_filter {
                for rule in rules {
                    rule_stmt.execute(params![
                        filter_id,
                        rule.rule_id,
                        rule.rule_text,
                        rule.enabled
                    ])?;
                }
            }

            let mut gi_stmt = conn.prepare(
                "INSERT OR REPLACE INTO filter_groups_i18n (group_id, locale, name)
                 VALUES (?, ?, ?)",
            )?;
            for ((group_id, locale), name) in groups_i18n.iter() {
                gi_stmt.execute(params![group_id, locale, name])?;
            }

            let mut fi_stmt = conn.prepare(
                "INSERT OR REPLACE INTO filters_i18n (filter_id, locale, name, description)
                 VALUES (?, ?, ?, ?)",
            )?;
            for ((filter_id, locale), localization) in filters_i18n.iter() {
                fi_stmt.execute(params![
                    filter_id,
                    locale,
                    localization.name,
                    localization.description
                ])?;
            }

            Ok(())
        })?;

        info!("Seeded {} filters from the default catalog", seeded);
        Ok(seeded)
    }
}

// ==================== Connection-level helpers ====================

fn require_editable(conn: &Connection, filter_id: i32) -> StoreResult<()> {
    let kind: Option<String> = conn
        .query_row(
            "SELECT kind FROM filters WHERE filter_id = ?",
            params![filter_id],
            |row| row.get(0),
        )
        .optional()?;
    match kind {
        None => Err(StoreError::FilterNotFound(filter_id)),
        Some(k) if FilterKind::parse(&k).is_some_and(|k| k.is_editable()) => Ok(()),
        Some(_) => Err(StoreError::NotEditable(filter_id)),
    }
}

fn next_rule_id(conn: &Connection, filter_id: i32) -> StoreResult<i32> {
    let max: Option<i32> = conn.query_row(
        "SELECT MAX(rule_id) FROM filter_rules WHERE filter_id = ?",
        params![filter_id],
        |row| row.get(0),
    )?;
    Ok(max.unwrap_or(0) + 1)
}

fn ensure_special_entities(conn: &Connection) -> StoreResult<()> {
    conn.execute(
        "INSERT OR IGNORE INTO filter_groups (group_id, name, display_number, enabled)
         VALUES (?, 'Custom', 999, 1)",
        params![SPECIAL_GROUP_ID],
    )?;
    conn.execute(
        "INSERT OR IGNORE INTO filters (filter_id, group_id, kind, enabled, name)
         VALUES (?, ?, 'custom', 1, 'User rules')",
        params![USER_FILTER_ID, SPECIAL_GROUP_ID],
    )?;
    Ok(())
}

fn meta_get(conn: &Connection, key: &str) -> StoreResult<Option<String>> {
    Ok(conn
        .query_row(
            "SELECT value FROM service_meta WHERE key = ?",
            params![key],
            |row| row.get(0),
        )
        .optional()?)
}

fn meta_set(conn: &Connection, key: &str, value: &str) -> StoreResult<()> {
    conn.execute(
        "INSERT OR REPLACE INTO service_meta (key, value) VALUES (?, ?)",
        params![key, value],
    )?;
    Ok(())
}
