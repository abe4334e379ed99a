//! Core domain model for the tool directory: catalog entries, listing keys and probe results.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value as JsonValue};
use thiserror::Error;

pub const CRATE_NAME: &str = "tooldir-core";

/// Sentinel category for raw categories that have no alias mapping.
pub const CATEGORY_OTHER: &str = "Other";

#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("unknown {kind} `{value}`")]
pub struct UnknownVariant {
    pub kind: &'static str,
    pub value: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum ToolStatus {
    Active,
    Inactive,
    #[default]
    Unknown,
}

impl ToolStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Active => "active",
            Self::Inactive => "inactive",
            Self::Unknown => "unknown",
        }
    }
}

impl fmt::Display for ToolStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ToolStatus {
    type Err = UnknownVariant;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "active" => Ok(Self::Active),
            "inactive" => Ok(Self::Inactive),
            "unknown" => Ok(Self::Unknown),
            _ => Err(UnknownVariant {
                kind: "tool status",
                value: s.to_string(),
            }),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum PricingModel {
    Free,
    Freemium,
    Paid,
    Trial,
    #[default]
    Unknown,
}

impl PricingModel {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Free => "free",
            Self::Freemium => "freemium",
            Self::Paid => "paid",
            Self::Trial => "trial",
            Self::Unknown => "unknown",
        }
    }
}

impl fmt::Display for PricingModel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for PricingModel {
    type Err = UnknownVariant;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "free" => Ok(Self::Free),
            "freemium" => Ok(Self::Freemium),
            "paid" => Ok(Self::Paid),
            "trial" => Ok(Self::Trial),
            "unknown" => Ok(Self::Unknown),
            _ => Err(UnknownVariant {
                kind: "pricing model",
                value: s.to_string(),
            }),
        }
    }
}

/// Resolved display icon. Either a known local asset or a generated letter badge.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Logo {
    Asset { path: String },
    Generated { initial: String, color: String },
}

impl Logo {
    pub fn is_resolved(&self) -> bool {
        match self {
            Self::Asset { path } => !path.trim().is_empty(),
            Self::Generated { initial, color } => !initial.is_empty() && !color.is_empty(),
        }
    }
}

/// Raw record handed over by a content store, before normalization.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RawRecord {
    pub record_id: String,
    pub fields: Map<String, JsonValue>,
}

/// Canonical catalog entry.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Tool {
    pub id: String,
    pub name: String,
    pub description: String,
    pub short_description: String,
    pub category: String,
    pub tags: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub untranslated_tags: Vec<String>,
    pub website: Option<String>,
    pub logo: Logo,
    pub pricing_model: PricingModel,
    pub rating: Option<f64>,
    pub review_count: u32,
    pub features: Vec<String>,
    pub use_cases: Vec<String>,
    pub status: ToolStatus,
    #[serde(default)]
    pub inactive_streak: u32,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Tool {
    /// Compares the fields produced by normalization, ignoring lifecycle state and timestamps.
    pub fn same_content(&self, other: &Tool) -> bool {
        self.id == other.id
            && self.name == other.name
            && self.description == other.description
            && self.short_description == other.short_description
            && self.category == other.category
            && self.tags == other.tags
            && self.untranslated_tags == other.untranslated_tags
            && self.website == other.website
            && self.logo == other.logo
            && self.pricing_model == other.pricing_model
            && self.rating == other.rating
            && self.review_count == other.review_count
            && self.features == other.features
            && self.use_cases == other.use_cases
    }

    pub fn is_probeable(&self) -> bool {
        self.website.as_deref().is_some_and(|w| !w.trim().is_empty())
    }

    pub fn matches_search(&self, needle: &str) -> bool {
        let needle = needle.trim().to_lowercase();
        if needle.is_empty() {
            return true;
        }
        self.name.to_lowercase().contains(&needle)
            || self.description.to_lowercase().contains(&needle)
            || self.short_description.to_lowercase().contains(&needle)
            || self.tags.iter().any(|t| t.to_lowercase().contains(&needle))
    }
}

/// Listing identity used by the sync cache.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum CacheKey {
    All,
    Category(String),
    Search(String),
}

impl CacheKey {
    pub fn category(name: impl AsRef<str>) -> Self {
        Self::Category(name.as_ref().trim().to_string())
    }

    pub fn search(query: impl AsRef<str>) -> Self {
        Self::Search(query.as_ref().trim().to_lowercase())
    }

    pub fn to_query(&self) -> ToolQuery {
        match self {
            Self::All => ToolQuery::visible(),
            Self::Category(c) => ToolQuery {
                category: Some(c.clone()),
                ..ToolQuery::visible()
            },
            Self::Search(q) => ToolQuery {
                search: Some(q.clone()),
                ..ToolQuery::visible()
            },
        }
    }
}

impl fmt::Display for CacheKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::All => f.write_str("all"),
            Self::Category(c) => write!(f, "category:{c}"),
            Self::Search(q) => write!(f, "search:{q}"),
        }
    }
}

impl FromStr for CacheKey {
    type Err = UnknownVariant;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if s == "all" {
            return Ok(Self::All);
        }
        if let Some(c) = s.strip_prefix("category:") {
            return Ok(Self::category(c));
        }
        if let Some(q) = s.strip_prefix("search:") {
            return Ok(Self::search(q));
        }
        Err(UnknownVariant {
            kind: "cache key",
            value: s.to_string(),
        })
    }
}

/// Filter understood by every record store implementation.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct ToolQuery {
    pub status: Option<ToolStatus>,
    pub exclude_status: Option<ToolStatus>,
    pub category: Option<String>,
    pub search: Option<String>,
}

impl ToolQuery {
    pub fn everything() -> Self {
        Self::default()
    }

    /// What readers see: everything that has not been found dead.
    pub fn visible() -> Self {
        Self {
            exclude_status: Some(ToolStatus::Inactive),
            ..Self::default()
        }
    }

    pub fn with_status(status: ToolStatus) -> Self {
        Self {
            status: Some(status),
            ..Self::default()
        }
    }

    pub fn matches(&self, tool: &Tool) -> bool {
        if self.status.is_some_and(|s| tool.status != s) {
            return false;
        }
        if self.exclude_status.is_some_and(|s| tool.status == s) {
            return false;
        }
        if let Some(category) = &self.category {
            if !tool.category.eq_ignore_ascii_case(category.trim()) {
                return false;
            }
        }
        match &self.search {
            Some(q) => tool.matches_search(q),
            None => true,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProbeOutcome {
    Reachable,
    Redirected,
    Blocked,
    NotFound,
    ServerError,
    Timeout,
    DnsError,
    Unknown,
}

impl ProbeOutcome {
    /// Status a single probe run proposes. Blocked sites exist, they just refuse robots.
    pub fn proposed_status(self) -> ToolStatus {
        match self {
            Self::Reachable | Self::Redirected | Self::Blocked => ToolStatus::Active,
            Self::NotFound | Self::ServerError | Self::Timeout | Self::DnsError | Self::Unknown => {
                ToolStatus::Inactive
            }
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Reachable => "reachable",
            Self::Redirected => "redirected",
            Self::Blocked => "blocked",
            Self::NotFound => "not_found",
            Self::ServerError => "server_error",
            Self::Timeout => "timeout",
            Self::DnsError => "dns_error",
            Self::Unknown => "unknown",
        }
    }
}

impl fmt::Display for ProbeOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProbeResult {
    pub tool_id: String,
    pub url: String,
    pub outcome: ProbeOutcome,
    pub http_status: Option<u16>,
    pub checked_at: DateTime<Utc>,
    pub attempts: u32,
}

impl ProbeResult {
    pub fn proposed_status(&self) -> ToolStatus {
        self.outcome.proposed_status()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn tool(name: &str, category: &str, status: ToolStatus) -> Tool {
        let at = Utc.with_ymd_and_hms(2026, 3, 1, 8, 0, 0).single().unwrap();
        Tool {
            id: name.to_lowercase(),
            name: name.to_string(),
            description: format!("{name} helps you write"),
            short_description: String::new(),
            category: category.to_string(),
            tags: vec!["Writing".into(), "Chatbot".into()],
            untranslated_tags: vec![],
            website: Some(format!("https://{}.example", name.to_lowercase())),
            logo: Logo::Generated {
                initial: name[..1].to_string(),
                color: "#0ea5e9".into(),
            },
            pricing_model: PricingModel::Unknown,
            rating: None,
            review_count: 0,
            features: vec![],
            use_cases: vec![],
            status,
            inactive_streak: 0,
            created_at: at,
            updated_at: at,
        }
    }

    #[test]
    fn cache_keys_render_and_parse() {
        assert_eq!(CacheKey::All.to_string(), "all");
        assert_eq!(CacheKey::category(" Writing ").to_string(), "category:Writing");
        assert_eq!(CacheKey::search("ChatBot").to_string(), "search:chatbot");
        assert_eq!("category:Writing".parse::<CacheKey>().unwrap(), CacheKey::category("Writing"));
        assert!("nope".parse::<CacheKey>().is_err());
    }

    #[test]
    fn unknown_variants_name_the_kind_and_value() {
        let err = "retired".parse::<ToolStatus>().unwrap_err();
        assert_eq!(err.to_string(), "unknown tool status `retired`");
        let boxed: Box<dyn std::error::Error> = Box::new(err);
        assert!(boxed.source().is_none());
    }

    #[test]
    fn visible_query_hides_inactive_only() {
        let q = ToolQuery::visible();
        assert!(q.matches(&tool("Acme", "Writing", ToolStatus::Active)));
        assert!(q.matches(&tool("Acme", "Writing", ToolStatus::Unknown)));
        assert!(!q.matches(&tool("Acme", "Writing", ToolStatus::Inactive)));
    }

    #[test]
    fn category_and_search_filters() {
        let t = tool("Acme", "Writing", ToolStatus::Active);
        assert!(CacheKey::category("writing").to_query().matches(&t));
        assert!(!CacheKey::category("Video").to_query().matches(&t));
        assert!(CacheKey::search("chatb").to_query().matches(&t));
        assert!(!CacheKey::search("spreadsheet").to_query().matches(&t));
    }

    #[test]
    fn probe_outcomes_map_to_statuses() {
        use ProbeOutcome::*;
        for outcome in [Reachable, Redirected, Blocked] {
            assert_eq!(outcome.proposed_status(), ToolStatus::Active);
        }
        for outcome in [NotFound, ServerError, Timeout, DnsError, Unknown] {
            assert_eq!(outcome.proposed_status(), ToolStatus::Inactive);
        }
    }

    #[test]
    fn same_content_ignores_lifecycle_fields() {
        let a = tool("Acme", "Writing", ToolStatus::Active);
        let mut b = a.clone();
        b.status = ToolStatus::Inactive;
        b.inactive_streak = 4;
        b.updated_at = Utc::now();
        assert!(a.same_content(&b));
        b.category = CATEGORY_OTHER.to_string();
        assert!(!a.same_content(&b));
    }

    #[test]
    fn logo_serializes_with_kind_tag() {
        let logo = Logo::Asset {
            path: "/logos/acme.png".into(),
        };
        let json = serde_json::to_value(&logo).unwrap();
        assert_eq!(json["kind"], "asset");
        assert_eq!(json["path"], "/logos/acme.png");
    }
}
