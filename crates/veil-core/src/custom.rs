//! Custom filter import
//!
//! User-supplied filters come from arbitrary URLs. The raw content is parsed
//! into a [`CustomFilterParseResult`] first; nothing touches the store until
//! the parsed result is committed, so a malformed download can never leave a
//! partial filter behind. The commit itself runs asynchronously and reports
//! through a one-shot completion callback carrying a success flag.

use std::sync::Arc;

use chrono::Utc;
use thiserror::Error;
use tracing::{debug, warn};

use crate::cache::MetadataCache;
use crate::events::{EventBus, FilterEvent};
use crate::models::{CustomFilterParseResult, FilterKind, FilterMeta, SPECIAL_GROUP_ID};
use crate::store::FilterStore;
use crate::storage::{StoreError, StoreResult};
use crate::sync::rule_lines;

/// Rejections produced before anything is persisted.
#[derive(Error, Debug, PartialEq)]
pub enum ParseError {
    #[error("Custom filter content is empty")]
    EmptyContent,

    #[error("Custom filter contains no rules")]
    NoRules,
}

/// Parse downloaded custom filter content.
///
/// Header comments in the common list format are honored:
/// `! Title:`, `! Description:`, `! Homepage:`, `! Version:`.
/// Everything that is not a comment or blank line becomes a rule.
pub fn parse_custom_filter(
    url: &str,
    content: &str,
) -> Result<CustomFilterParseResult, ParseError> {
    if content.trim().is_empty() {
        return Err(ParseError::EmptyContent);
    }

    let mut title = None;
    let mut description = None;
    let mut homepage = None;
    let mut version = None;
    for line in content.lines() {
        let line = line.trim();
        if !line.starts_with('!') {
            continue;
        }
        let header = line.trim_start_matches('!').trim();
        if let Some(value) = header_value(header, "Title") {
            title.get_or_insert(value);
        } else if let Some(value) = header_value(header, "Description") {
            description.get_or_insert(value);
        } else if let Some(value) = header_value(header, "Homepage") {
            homepage.get_or_insert(value);
        } else if let Some(value) = header_value(header, "Version") {
            version.get_or_insert(value);
        }
    }

    let rules = rule_lines(content);
    if rules.is_empty() {
        return Err(ParseError::NoRules);
    }

    // filter_id 0 is a placeholder; the importer allocates the real id.
    let mut meta = FilterMeta::new(
        0,
        SPECIAL_GROUP_ID,
        FilterKind::Custom,
        title.unwrap_or_else(|| url.to_string()),
    )
    .with_subscription_url(url)
    .enabled(true);
    meta.description = description;
    meta.homepage = homepage;
    meta.version = version;
    meta.last_update = Some(Utc::now());

    Ok(CustomFilterParseResult { meta, rules })
}

fn header_value(header: &str, key: &str) -> Option<String> {
    let rest = header.strip_prefix(key)?.trim_start();
    let value = rest.strip_prefix(':')?.trim();
    if value.is_empty() {
        None
    } else {
        Some(value.to_string())
    }
}

/// Validates and ingests parsed custom filters.
pub struct CustomFilterImporter {
    store: Arc<FilterStore>,
    cache: Arc<MetadataCache>,
    events: EventBus,
}

impl CustomFilterImporter {
    pub fn new(store: Arc<FilterStore>, cache: Arc<MetadataCache>, events: EventBus) -> Self {
        Self {
            store,
            cache,
            events,
        }
    }

    /// Persist a parsed custom filter without blocking the caller.
    ///
    /// The completion callback fires exactly once, after persistence
    /// resolved, with `true` on success. Callers wanting to avoid a
    /// duplicate should check `custom_filter_id_by_url` first; a duplicate
    /// subscription URL is refused here as well.
    ///
    /// Must be called from within a tokio runtime.
    pub fn subscribe_from_result(
        &self,
        result: CustomFilterParseResult,
        completion: impl FnOnce(bool) + Send + 'static,
    ) {
        let store = Arc::clone(&self.store);
        let cache = Arc::clone(&self.cache);
        let events = self.events.clone();

        tokio::spawn(async move {
            let ok = match commit_result(&store, &result) {
                Ok(filter_id) => {
                    debug!("Custom filter {} subscribed", filter_id);
                    cache.invalidate();
                    events.publish(FilterEvent::FilterRulesUpdated);
                    true
                }
                Err(e) => {
                    warn!("Custom filter import failed: {}", e);
                    false
                }
            };
            completion(ok);
        });
    }
}

/// Allocate an id and persist metadata plus rules in one transaction.
fn commit_result(store: &FilterStore, result: &CustomFilterParseResult) -> StoreResult<i32> {
    if let Some(url) = &result.meta.subscription_url {
        if store.custom_filter_id_by_url(url)?.is_some() {
            return Err(StoreError::AlreadyInstalled(url.clone()));
        }
    }

    store.begin_transaction()?;
    let outcome: StoreResult<i32> = (|| {
        store.ensure_special_entities()?;
        let filter_id = store.next_custom_filter_id()?;

        let mut meta = result.meta.clone();
        meta.filter_id = filter_id;
        meta.kind = FilterKind::Custom;
        store.insert_filters(std::slice::from_ref(&meta))?;
        store.replace_rules(filter_id, &result.rules)?;
        Ok(filter_id)
    })();

    match outcome {
        Ok(filter_id) => {
            store.commit_transaction()?;
            Ok(filter_id)
        }
        Err(e) => {
            store.rollback_transaction();
            Err(e)
        }
    }
}
