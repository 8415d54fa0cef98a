//! Storage layer
//!
//! Schema and typed errors for the production filter database, plus the row
//! mapping helpers shared between the production store and the read-only
//! default catalog (both databases carry the same schema).

pub mod error;
pub mod schema;

pub use error::{StoreError, StoreResult};
pub use schema::{init_schema, needs_init, SCHEMA_VERSION};

use chrono::DateTime;
use rusqlite::Row;

use crate::models::{FilterGroup, FilterKind, FilterMeta, FilterRule};

/// Column list matching [`group_from_row`].
pub(crate) const GROUP_COLUMNS: &str = "group_id, name, display_number, enabled";

/// Column list matching [`filter_from_row`].
pub(crate) const FILTER_COLUMNS: &str = "filter_id, group_id, kind, enabled, version, name, \
     description, homepage, subscription_url, langs, last_update";

/// Column list matching [`rule_from_row`].
pub(crate) const RULE_COLUMNS: &str = "filter_id, rule_id, rule_text, enabled";

pub(crate) fn group_from_row(row: &Row<'_>) -> rusqlite::Result<FilterGroup> {
    Ok(FilterGroup {
        group_id: row.get(0)?,
        name: row.get(1)?,
        display_number: row.get(2)?,
        enabled: row.get(3)?,
    })
}

pub(crate) fn filter_from_row(row: &Row<'_>) -> rusqlite::Result<FilterMeta> {
    let kind: String = row.get(2)?;
    let langs: String = row.get(9)?;
    let last_update: Option<i64> = row.get(10)?;

    Ok(FilterMeta {
        filter_id: row.get(0)?,
        group_id: row.get(1)?,
        // Unknown kinds cannot appear through this crate's write paths;
        // treat them as non-editable if the file was tampered with.
        kind: FilterKind::parse(&kind).unwrap_or(FilterKind::Default),
        enabled: row.get(3)?,
        version: row.get(4)?,
        name: row.get(5)?,
        description: row.get(6)?,
        homepage: row.get(7)?,
        subscription_url: row.get(8)?,
        langs: langs_from_json(&langs),
        last_update: last_update.and_then(DateTime::from_timestamp_millis),
    })
}

pub(crate) fn rule_from_row(row: &Row<'_>) -> rusqlite::Result<FilterRule> {
    Ok(FilterRule {
        filter_id: row.get(0)?,
        rule_id: row.get(1)?,
        rule_text: row.get(2)?,
        enabled: row.get(3)?,
    })
}

pub(crate) fn langs_to_json(langs: &[String]) -> String {
    serde_json::to_string(langs).unwrap_or_else(|_| "[]".to_string())
}

pub(crate) fn langs_from_json(json: &str) -> Vec<String> {
    serde_json::from_str(json).unwrap_or_default()
}
