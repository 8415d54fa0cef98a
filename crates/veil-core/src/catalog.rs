//! Default catalog reader
//!
//! Read-only accessor over the reference database bundled with the
//! application. It serves three purposes: seeding the production store on
//! first run, providing zero-network rule bodies when subscribing to a
//! filter that ships in the bundle, and acting as a localization fallback
//! when the production store has no row for a locale. It is never written
//! to at runtime.

use std::path::{Path, PathBuf};
use std::sync::Mutex;

use rusqlite::{params, Connection, OpenFlags};

use crate::models::{FilterGroup, FilterLocalization, FilterMeta, FilterRule, FiltersI18n, GroupsI18n};
use crate::storage::{
    self, StoreError, StoreResult, FILTER_COLUMNS, GROUP_COLUMNS, RULE_COLUMNS,
};

/// Read-only view of the bundled reference database.
pub struct DefaultCatalog {
    conn: Mutex<Connection>,
    path: PathBuf,
}

impl DefaultCatalog {
    /// Open the bundled database. Fails if the file does not exist or is not
    /// a readable SQLite database; the catalog is never created here.
    pub fn open(path: impl AsRef<Path>) -> StoreResult<Self> {
        let path = path.as_ref().to_path_buf();
        let conn = Connection::open_with_flags(
            &path,
            OpenFlags::SQLITE_OPEN_READ_ONLY | OpenFlags::SQLITE_OPEN_NO_MUTEX,
        )
        .map_err(|source| StoreError::Open {
            path: path.clone(),
            source,
        })?;

        Ok(Self {
            conn: Mutex::new(conn),
            path,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// All groups shipped in the bundle.
    pub fn groups(&self) -> StoreResult<Vec<FilterGroup>> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn.prepare(&format!(
            "SELECT {GROUP_COLUMNS} FROM filter_groups ORDER BY display_number, group_id"
        ))?;
        let groups = stmt
            .query_map([], storage::group_from_row)?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(groups)
    }

    /// All filter metadata shipped in the bundle.
    pub fn filters(&self) -> StoreResult<Vec<FilterMeta>> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn.prepare(&format!(
            "SELECT {FILTER_COLUMNS} FROM filters ORDER BY group_id, filter_id"
        ))?;
        let filters = stmt
            .query_map([], storage::filter_from_row)?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(filters)
    }

    /// True if the bundle carries this filter id.
    pub fn has_filter(&self, filter_id: i32) -> StoreResult<bool> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn.prepare("SELECT 1 FROM filters WHERE filter_id = ?")?;
        Ok(stmt.exists(params![filter_id])?)
    }

    /// Bundled rules for a filter, in rule id order.
    pub fn rules_for_filter(&self, filter_id: i32) -> StoreResult<Vec<FilterRule>> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn.prepare(&format!(
            "SELECT {RULE_COLUMNS} FROM filter_rules WHERE filter_id = ? ORDER BY rule_id"
        ))?;
        let rules = stmt
            .query_map(params![filter_id], storage::rule_from_row)?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(rules)
    }

    /// Bundled group localization table.
    pub fn groups_i18n(&self) -> StoreResult<GroupsI18n> {
        let conn = self.conn.lock().unwrap();
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
    }

    /// Bundled filter localization table.
    pub fn filters_i18n(&self) -> StoreResult<FiltersI18n> {
        let conn = self.conn.lock().unwrap();
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
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testutil;
    use tempfile::TempDir;

    #[test]
    fn test_open_missing_file_fails() {
        let temp_dir = TempDir::new().unwrap();
        let result = DefaultCatalog::open(temp_dir.path().join("missing.db"));
        assert!(matches!(result, Err(StoreError::Open { .. })));
    }

    #[test]
    fn test_reads_bundled_entities() {
        let temp_dir = TempDir::new().unwrap();
        let path = testutil::build_catalog_db(temp_dir.path());
        let catalog = DefaultCatalog::open(&path).unwrap();

        let groups = catalog.groups().unwrap();
        assert_eq!(groups.len(), 2);
        assert_eq!(groups[0].group_id, 1);

        let filters = catalog.filters().unwrap();
        assert_eq!(filters.len(), 3);

        assert!(catalog.has_filter(1).unwrap());
        assert!(!catalog.has_filter(999).unwrap());
    }

    #[test]
    fn test_reads_bundled_rules() {
        let temp_dir = TempDir::new().unwrap();
        let path = testutil::build_catalog_db(temp_dir.path());
        let catalog = DefaultCatalog::open(&path).unwrap();

        let rules = catalog.rules_for_filter(1).unwrap();
        assert_eq!(rules.len(), 2);
        assert_eq!(rules[0].rule_id, 1);

        assert!(catalog.rules_for_filter(999).unwrap().is_empty());
    }

    #[test]
    fn test_reads_i18n_tables() {
        let temp_dir = TempDir::new().unwrap();
        let path = testutil::build_catalog_db(temp_dir.path());
        let catalog = DefaultCatalog::open(&path).unwrap();

        let groups_i18n = catalog.groups_i18n().unwrap();
        assert_eq!(groups_i18n.localize(1, "de"), Some("Werbung"));

        let filters_i18n = catalog.filters_i18n().unwrap();
        assert_eq!(filters_i18n.localize(1, "de").unwrap().name, "Basisfilter");
    }
}
