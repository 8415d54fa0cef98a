//! Data models for veil
//!
//! Defines the entities of the filter store: groups, filter metadata, rules,
//! and the localization projections. All persisted ids are catalog-assigned
//! integers; custom filters get ids allocated from a reserved range.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Reserved filter id for the user's own rules. Always present and editable.
pub const USER_FILTER_ID: i32 = 0;

/// Reserved group id holding the user-rules filter and custom filters.
pub const SPECIAL_GROUP_ID: i32 = 0;

/// Custom filter ids are allocated from this value upward, so they can never
/// collide with catalog-assigned ids.
pub const CUSTOM_FILTER_ID_BASE: i32 = 1_000_000;

/// Origin of a filter, which also decides whether its rules are editable.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FilterKind {
    /// Bundled with the application, seeded from the default catalog.
    Default,
    /// Delivered by the backend catalog.
    Subscribed,
    /// Added by the user from an arbitrary URL.
    Custom,
}

impl FilterKind {
    /// Only custom filters accept user edits to their rule set.
    pub fn is_editable(&self) -> bool {
        matches!(self, FilterKind::Custom)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            FilterKind::Default => "default",
            FilterKind::Subscribed => "subscribed",
            FilterKind::Custom => "custom",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "default" => Some(FilterKind::Default),
            "subscribed" => Some(FilterKind::Subscribed),
            "custom" => Some(FilterKind::Custom),
            _ => None,
        }
    }
}

impl std::fmt::Display for FilterKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A user-facing category of filters. Its enabled flag gates visibility of
/// every filter it contains for the "active" queries.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FilterGroup {
    pub group_id: i32,
    pub name: String,
    /// Sort position in UI listings.
    pub display_number: i32,
    pub enabled: bool,
}

impl FilterGroup {
    pub fn new(group_id: i32, name: impl Into<String>) -> Self {
        Self {
            group_id,
            name: name.into(),
            display_number: 0,
            enabled: false,
        }
    }
}

/// Metadata of a filter: a named, versioned collection of blocking rules.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FilterMeta {
    pub filter_id: i32,
    /// Every filter belongs to exactly one existing group.
    pub group_id: i32,
    pub kind: FilterKind,
    pub enabled: bool,
    pub version: Option<String>,
    pub name: String,
    pub description: Option<String>,
    pub homepage: Option<String>,
    /// Download URL. Present for custom and subscribed filters only.
    pub subscription_url: Option<String>,
    /// Language codes this filter targets, used for auto-detection.
    pub langs: Vec<String>,
    /// When the rule set was last replaced.
    pub last_update: Option<DateTime<Utc>>,
}

impl FilterMeta {
    pub fn new(filter_id: i32, group_id: i32, kind: FilterKind, name: impl Into<String>) -> Self {
        Self {
            filter_id,
            group_id,
            kind,
            enabled: false,
            version: None,
            name: name.into(),
            description: None,
            homepage: None,
            subscription_url: None,
            langs: Vec::new(),
            last_update: None,
        }
    }

    pub fn is_editable(&self) -> bool {
        self.kind.is_editable()
    }

    pub fn with_subscription_url(mut self, url: impl Into<String>) -> Self {
        self.subscription_url = Some(url.into());
        self
    }

    pub fn with_version(mut self, version: impl Into<String>) -> Self {
        self.version = Some(version.into());
        self
    }

    pub fn enabled(mut self, enabled: bool) -> Self {
        self.enabled = enabled;
        self
    }
}

/// A single pattern entry belonging to exactly one filter. The rule text is
/// opaque to this crate; the blocking engine interprets it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FilterRule {
    pub filter_id: i32,
    /// Unique within its filter, not globally.
    pub rule_id: i32,
    pub rule_text: String,
    pub enabled: bool,
}

impl FilterRule {
    pub fn new(filter_id: i32, rule_id: i32, rule_text: impl Into<String>) -> Self {
        Self {
            filter_id,
            rule_id,
            rule_text: rule_text.into(),
            enabled: true,
        }
    }
}

/// Localized display names for groups, keyed by `(group_id, locale)`.
///
/// Read-only projection of the i18n tables; never mutated outside seeding.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct GroupsI18n {
    entries: HashMap<(i32, String), String>,
}

impl GroupsI18n {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, group_id: i32, locale: impl Into<String>, name: impl Into<String>) {
        self.entries.insert((group_id, locale.into()), name.into());
    }

    /// Exact-locale lookup, falling back to the primary language subtag
    /// ("pt-BR" falls back to "pt").
    pub fn localize(&self, group_id: i32, locale: &str) -> Option<&str> {
        if let Some(name) = self.entries.get(&(group_id, locale.to_string())) {
            return Some(name);
        }
        let primary = primary_subtag(locale);
        if primary != locale {
            return self
                .entries
                .get(&(group_id, primary.to_string()))
                .map(String::as_str);
        }
        None
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&(i32, String), &String)> {
        self.entries.iter()
    }
}

/// Localized display strings for a filter.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FilterLocalization {
    pub name: String,
    pub description: Option<String>,
}

/// Localized display strings for filters, keyed by `(filter_id, locale)`.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct FiltersI18n {
    entries: HashMap<(i32, String), FilterLocalization>,
}

impl FiltersI18n {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(
        &mut self,
        filter_id: i32,
        locale: impl Into<String>,
        localization: FilterLocalization,
    ) {
        self.entries.insert((filter_id, locale.into()), localization);
    }

    /// Exact-locale lookup, falling back to the primary language subtag.
    pub fn localize(&self, filter_id: i32, locale: &str) -> Option<&FilterLocalization> {
        if let Some(l) = self.entries.get(&(filter_id, locale.to_string())) {
            return Some(l);
        }
        let primary = primary_subtag(locale);
        if primary != locale {
            return self.entries.get(&(filter_id, primary.to_string()));
        }
        None
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&(i32, String), &FilterLocalization)> {
        self.entries.iter()
    }
}

/// The primary language subtag of a locale identifier ("en-US" -> "en").
pub(crate) fn primary_subtag(locale: &str) -> &str {
    locale
        .split(['-', '_'])
        .next()
        .filter(|s| !s.is_empty())
        .unwrap_or(locale)
}

/// Result of parsing a downloaded custom filter.
///
/// Transient: owned by the caller until committed through the importer.
#[derive(Debug, Clone, PartialEq)]
pub struct CustomFilterParseResult {
    /// Proposed metadata. `filter_id` is a placeholder until the importer
    /// allocates a real one.
    pub meta: FilterMeta,
    /// Raw rule lines, comments and blanks already stripped.
    pub rules: Vec<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_kind_editable() {
        assert!(!FilterKind::Default.is_editable());
        assert!(!FilterKind::Subscribed.is_editable());
        assert!(FilterKind::Custom.is_editable());
    }

    #[test]
    fn test_kind_roundtrip() {
        for kind in [FilterKind::Default, FilterKind::Subscribed, FilterKind::Custom] {
            assert_eq!(FilterKind::parse(kind.as_str()), Some(kind));
        }
        assert_eq!(FilterKind::parse("bogus"), None);
    }

    #[test]
    fn test_filter_meta_builders() {
        let meta = FilterMeta::new(101, 1, FilterKind::Subscribed, "Base Filter")
            .with_version("2.0.1")
            .with_subscription_url("https://filters.example/101.txt")
            .enabled(true);

        assert_eq!(meta.filter_id, 101);
        assert_eq!(meta.version.as_deref(), Some("2.0.1"));
        assert!(meta.enabled);
        assert!(!meta.is_editable());
    }

    #[test]
    fn test_rule_defaults_enabled() {
        let rule = FilterRule::new(1, 1, "||ads.example.com^");
        assert!(rule.enabled);
        assert_eq!(rule.rule_text, "||ads.example.com^");
    }

    #[test]
    fn test_groups_i18n_localize() {
        let mut i18n = GroupsI18n::new();
        i18n.insert(1, "en", "Ad Blocking");
        i18n.insert(1, "de", "Werbeblockierung");

        assert_eq!(i18n.localize(1, "de"), Some("Werbeblockierung"));
        assert_eq!(i18n.localize(1, "en"), Some("Ad Blocking"));
        assert_eq!(i18n.localize(2, "en"), None);
    }

    #[test]
    fn test_i18n_primary_subtag_fallback() {
        let mut i18n = GroupsI18n::new();
        i18n.insert(1, "pt", "Bloqueio de anúncios");

        assert_eq!(i18n.localize(1, "pt-BR"), Some("Bloqueio de anúncios"));
        assert_eq!(i18n.localize(1, "pt_PT"), Some("Bloqueio de anúncios"));
    }

    #[test]
    fn test_filters_i18n_localize() {
        let mut i18n = FiltersI18n::new();
        i18n.insert(
            101,
            "fr",
            FilterLocalization {
                name: "Filtre de base".to_string(),
                description: None,
            },
        );

        assert_eq!(i18n.localize(101, "fr").unwrap().name, "Filtre de base");
        assert!(i18n.localize(101, "ja").is_none());
    }

    #[test]
    fn test_primary_subtag() {
        assert_eq!(primary_subtag("en-US"), "en");
        assert_eq!(primary_subtag("zh_Hant"), "zh");
        assert_eq!(primary_subtag("en"), "en");
    }
}
