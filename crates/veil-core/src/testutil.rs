//! Shared test fixtures: a bundled-catalog database builder and an
//! in-memory backend mock.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use async_trait::async_trait;
use rusqlite::Connection;

use crate::storage::init_schema;
use crate::sync::{BackendError, FilterBackend, RemoteCatalog, RemoteFilter};

/// Build a fixture "bundled" catalog database with 2 groups and 3 filters:
///
/// - group 1 "Ad Blocking" (enabled): filter 1 "Base Filter" (enabled, 2
///   rules), filter 2 "Annoyances" (disabled, langs ["en"], 1 rule)
/// - group 2 "Privacy" (disabled): filter 3 "Tracking Protection" (enabled,
///   1 rule)
///
/// Plus German localization rows for group 1 and filter 1.
pub(crate) fn build_catalog_db(dir: &Path) -> PathBuf {
    let path = dir.join("default.db");
    let conn = Connection::open(&path).unwrap();
    init_schema(&conn).unwrap();

    conn.execute_batch(
        r#"
        INSERT INTO filter_groups (group_id, name, display_number, enabled) VALUES
            (1, 'Ad Blocking', 1, 1),
            (2, 'Privacy', 2, 0);

        INSERT INTO filters (filter_id, group_id, kind, enabled, version, name, langs) VALUES
            (1, 1, 'default', 1, '1.0', 'Base Filter', '[]'),
            (2, 1, 'default', 0, '1.0', 'Annoyances', '["en"]'),
            (3, 2, 'default', 1, '1.0', 'Tracking Protection', '[]');

        INSERT INTO filter_rules (filter_id, rule_id, rule_text, enabled) VALUES
            (1, 1, '||ads.example.com^', 1),
            (1, 2, '##.banner', 1),
            (2, 1, '||annoy.example^', 1),
            (3, 1, '||track.example^', 1);

        INSERT INTO filter_groups_i18n (group_id, locale, name) VALUES
            (1, 'de', 'Werbung');

        INSERT INTO filters_i18n (filter_id, locale, name, description) VALUES
            (1, 'de', 'Basisfilter', NULL);
        "#,
    )
    .unwrap();

    path
}

/// Initialize test logging once; repeat calls are no-ops.
pub(crate) fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter("veil_core=debug")
        .with_test_writer()
        .try_init();
}

pub(crate) fn remote_filter(
    filter_id: i32,
    group_id: i32,
    version: &str,
    langs: &[&str],
) -> RemoteFilter {
    RemoteFilter {
        filter_id,
        group_id,
        version: version.to_string(),
        name: format!("Remote filter {filter_id}"),
        description: None,
        homepage: None,
        subscription_url: None,
        langs: langs.iter().map(|s| s.to_string()).collect(),
    }
}

#[derive(Default)]
pub(crate) struct MockState {
    pub version: String,
    pub filters: Vec<RemoteFilter>,
    pub rules: HashMap<i32, Vec<String>>,
    pub custom: HashMap<String, String>,
    pub fail_version: bool,
    pub fail_catalog: bool,
    pub fail_rules: bool,
    /// Artificial latency for the version probe, to test coalescing.
    pub version_delay_ms: u64,
    /// Record of `fetch_rules` calls, in order.
    pub rules_fetched: Vec<i32>,
}

/// Scriptable in-memory [`FilterBackend`].
pub(crate) struct MockBackend {
    state: Mutex<MockState>,
}

impl MockBackend {
    pub fn new(version: &str) -> Self {
        Self {
            state: Mutex::new(MockState {
                version: version.to_string(),
                ..MockState::default()
            }),
        }
    }

    pub fn with_state(&self, f: impl FnOnce(&mut MockState)) {
        f(&mut self.state.lock().unwrap());
    }

    pub fn rules_fetched(&self) -> Vec<i32> {
        self.state.lock().unwrap().rules_fetched.clone()
    }
}

#[async_trait]
impl FilterBackend for MockBackend {
    async fn fetch_catalog_version(&self) -> Result<String, BackendError> {
        let (version, fail, delay_ms) = {
            let state = self.state.lock().unwrap();
            (state.version.clone(), state.fail_version, state.version_delay_ms)
        };
        if delay_ms > 0 {
            tokio::time::sleep(std::time::Duration::from_millis(delay_ms)).await;
        }
        if fail {
            return Err(BackendError::Unreachable("mock: version".into()));
        }
        Ok(version)
    }

    async fn fetch_catalog(&self) -> Result<RemoteCatalog, BackendError> {
        let state = self.state.lock().unwrap();
        if state.fail_catalog {
            return Err(BackendError::Unreachable("mock: catalog".into()));
        }
        Ok(RemoteCatalog {
            version: state.version.clone(),
            filters: state.filters.clone(),
        })
    }

    async fn fetch_rules(&self, filter_id: i32) -> Result<Vec<String>, BackendError> {
        let mut state = self.state.lock().unwrap();
        state.rules_fetched.push(filter_id);
        if state.fail_rules {
            return Err(BackendError::Unreachable("mock: rules".into()));
        }
        state
            .rules
            .get(&filter_id)
            .cloned()
            .ok_or(BackendError::Status(404))
    }

    async fn fetch_custom(&self, url: &str) -> Result<String, BackendError> {
        let state = self.state.lock().unwrap();
        state
            .custom
            .get(url)
            .cloned()
            .ok_or_else(|| BackendError::Unreachable(format!("mock: no content for {url}")))
    }
}
