//! SQLite schema for the production filter database
//!
//! The bundled default catalog ships with the same schema, which lets the
//! seeding path copy rows straight across. `service_meta` holds the markers
//! the sync engine compares against the backend catalog.

use rusqlite::{Connection, Result};

/// Current schema version for migrations
pub const SCHEMA_VERSION: i32 = 1;

/// Initialize the database schema
pub fn init_schema(conn: &Connection) -> Result<()> {
    conn.execute_batch(
        r#"
        -- Key/value store: schema version, catalog version marker,
        -- last update timestamp, custom filter id allocator.
        CREATE TABLE IF NOT EXISTS service_meta (
            key TEXT PRIMARY KEY,
            value TEXT NOT NULL
        );

        -- Filter groups. The enabled flag gates all contained filters
        -- for "active" queries.
        CREATE TABLE IF NOT EXISTS filter_groups (
            group_id INTEGER PRIMARY KEY,
            name TEXT NOT NULL,
            display_number INTEGER NOT NULL DEFAULT 0,
            enabled INTEGER NOT NULL DEFAULT 0
        );

        -- Filter metadata. kind is 'default' | 'subscribed' | 'custom'.
        CREATE TABLE IF NOT EXISTS filters (
            filter_id INTEGER PRIMARY KEY,
            group_id INTEGER NOT NULL,
            kind TEXT NOT NULL,
            enabled INTEGER NOT NULL DEFAULT 0,
            version TEXT,
            name TEXT NOT NULL,
            description TEXT,
            homepage TEXT,
            subscription_url TEXT,
            langs TEXT NOT NULL DEFAULT '[]',
            last_update INTEGER,
            FOREIGN KEY (group_id) REFERENCES filter_groups(group_id)
        );

        -- Rules. rule_id is unique within its filter only.
        CREATE TABLE IF NOT EXISTS filter_rules (
            filter_id INTEGER NOT NULL,
            rule_id INTEGER NOT NULL,
            rule_text TEXT NOT NULL,
            enabled INTEGER NOT NULL DEFAULT 1,
            PRIMARY KEY (filter_id, rule_id),
            FOREIGN KEY (filter_id) REFERENCES filters(filter_id) ON DELETE CASCADE
        );

        -- Localization projections, keyed by (entity id, locale).
        CREATE TABLE IF NOT EXISTS filter_groups_i18n (
            group_id INTEGER NOT NULL,
            locale TEXT NOT NULL,
            name TEXT NOT NULL,
            PRIMARY KEY (group_id, locale)
        );

        CREATE TABLE IF NOT EXISTS filters_i18n (
            filter_id INTEGER NOT NULL,
            locale TEXT NOT NULL,
            name TEXT NOT NULL,
            description TEXT,
            PRIMARY KEY (filter_id, locale)
        );

        -- Indexes for common query patterns

        CREATE INDEX IF NOT EXISTS idx_filters_group_id ON filters(group_id);
        CREATE INDEX IF NOT EXISTS idx_filters_enabled ON filters(enabled);
        CREATE INDEX IF NOT EXISTS idx_filters_subscription_url ON filters(subscription_url);
        CREATE INDEX IF NOT EXISTS idx_rules_filter_id ON filter_rules(filter_id);
        "#,
    )?;

    // Set schema version
    conn.execute(
        "INSERT OR REPLACE INTO service_meta (key, value) VALUES ('schema_version', ?)",
        [SCHEMA_VERSION.to_string()],
    )?;

    Ok(())
}

/// Get the current schema version from the database
pub fn get_schema_version(conn: &Connection) -> Result<Option<i32>> {
    let mut stmt = conn.prepare("SELECT value FROM service_meta WHERE key = 'schema_version'")?;
    let result: Result<String> = stmt.query_row([], |row| row.get(0));

    match result {
        Ok(version_str) => Ok(version_str.parse().ok()),
        Err(rusqlite::Error::QueryReturnedNoRows) => Ok(None),
        Err(e) => Err(e),
    }
}

/// Check if schema needs initialization or migration
pub fn needs_init(conn: &Connection) -> bool {
    let table_exists: bool = conn
        .prepare("SELECT 1 FROM sqlite_master WHERE type='table' AND name='service_meta'")
        .and_then(|mut stmt| stmt.exists([]))
        .unwrap_or(false);

    if !table_exists {
        return true;
    }

    match get_schema_version(conn) {
        Ok(Some(v)) => v < SCHEMA_VERSION,
        _ => true,
    }
}
