//! Record normalizer: raw content-store records to canonical [`Tool`]s.

use std::collections::HashSet;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use reqwest::Url;
use serde_json::{Map, Value as JsonValue};
use sha2::{Digest, Sha256};
use thiserror::Error;
use tooldir_core::{Logo, PricingModel, RawRecord, Tool, ToolStatus, CATEGORY_OTHER};

use crate::rules::{normalized_name, RuleSet};

pub const SHORT_DESCRIPTION_MAX_CHARS: usize = 160;
const MIN_LOGO_MATCH_CHARS: usize = 3;

/// Badge colors for generated logos.
pub const LOGO_PALETTE: [&str; 12] = [
    "#ef4444", "#f97316", "#f59e0b", "#84cc16", "#22c55e", "#14b8a6", "#06b6d4", "#0ea5e9",
    "#6366f1", "#8b5cf6", "#d946ef", "#ec4899",
];

const LIST_DELIMITERS: [char; 7] = [',', '，', ';', '；', '、', '\n', '\r'];

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum NormalizeError {
    #[error("record {record_id} is invalid: {reason}")]
    InvalidRecord { record_id: String, reason: String },
}

/// Best-effort pricing inference for free-text pricing cells.
pub trait PricingClassifier: Send + Sync {
    fn classify(&self, pricing_text: &str) -> PricingModel;
}

#[derive(Debug, Clone, Copy, Default)]
pub struct DisabledPricingClassifier;

impl PricingClassifier for DisabledPricingClassifier {
    fn classify(&self, _pricing_text: &str) -> PricingModel {
        PricingModel::Unknown
    }
}

/// Keyword heuristic. "free trial" is a trial, not a free tier.
#[derive(Debug, Clone, Copy, Default)]
pub struct KeywordPricingClassifier;

const TRIAL_WORDS: [&str; 3] = ["trial", "试用", "体验"];
const FREE_WORDS: [&str; 2] = ["free", "免费"];
const PRICE_WORDS: [&str; 14] = [
    "$", "€", "£", "¥", "paid", "price", "pricing", "subscription", "/mo", "per month", "per year",
    "付费", "收费", "订阅",
];

impl PricingClassifier for KeywordPricingClassifier {
    fn classify(&self, pricing_text: &str) -> PricingModel {
        let text = pricing_text.trim().to_lowercase();
        if text.is_empty() {
            return PricingModel::Unknown;
        }
        if text.contains("freemium") {
            return PricingModel::Freemium;
        }
        let without_trials = text.replace("free trial", " ").replace("免费试用", " ");
        let free = FREE_WORDS.iter().any(|w| without_trials.contains(w));
        let trial = TRIAL_WORDS.iter().any(|w| text.contains(w));
        let price = PRICE_WORDS.iter().any(|w| text.contains(w));

        if free && price {
            PricingModel::Freemium
        } else if trial {
            PricingModel::Trial
        } else if price {
            PricingModel::Paid
        } else if free {
            PricingModel::Free
        } else {
            PricingModel::Unknown
        }
    }
}

#[derive(Clone)]
pub struct Normalizer {
    rules: Arc<RuleSet>,
    pricing: Arc<dyn PricingClassifier>,
}

impl std::fmt::Debug for Normalizer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Normalizer")
            .field("rules", &self.rules)
            .finish_non_exhaustive()
    }
}

impl Normalizer {
    pub fn new(rules: RuleSet) -> Self {
        Self {
            rules: Arc::new(rules),
            pricing: Arc::new(KeywordPricingClassifier),
        }
    }

    pub fn with_pricing_classifier(mut self, classifier: Arc<dyn PricingClassifier>) -> Self {
        self.pricing = classifier;
        self
    }

    pub fn rules(&self) -> &RuleSet {
        &self.rules
    }

    /// Deterministic for a given record, rule set and `observed_at`.
    pub fn normalize(&self, raw: &RawRecord, observed_at: DateTime<Utc>) -> Result<Tool, NormalizeError> {
        let record_id = raw.record_id.trim();
        if record_id.is_empty() {
            return Err(NormalizeError::InvalidRecord {
                record_id: raw.record_id.clone(),
                reason: "empty record id".to_string(),
            });
        }
        let fields = &raw.fields;
        let name = self
            .text_field(fields, "name")
            .ok_or_else(|| NormalizeError::InvalidRecord {
                record_id: record_id.to_string(),
                reason: "no title in any name column".to_string(),
            })?;

        let description = self.text_field(fields, "description").unwrap_or_default();
        let short_description = self
            .text_field(fields, "short_description")
            .map(|s| truncate_chars(&s, SHORT_DESCRIPTION_MAX_CHARS))
            .unwrap_or_else(|| first_sentence(&description));
        let (tags, untranslated_tags) = self.resolve_tags(&self.list_field(fields, "tags"));

        Ok(Tool {
            id: record_id.to_string(),
            logo: self.resolve_logo(&name),
            category: self.resolve_category(&self.list_field(fields, "category")),
            tags,
            untranslated_tags,
            website: self.website(fields),
            pricing_model: self.pricing_model(fields),
            rating: self.number_field(fields, "rating").map(|r| r.clamp(0.0, 5.0)),
            review_count: self
                .number_field(fields, "review_count")
                .map(saturating_count)
                .unwrap_or(0),
            features: self.list_field(fields, "features"),
            use_cases: self.list_field(fields, "use_cases"),
            status: self
                .text_field(fields, "status")
                .and_then(|s| s.parse::<ToolStatus>().ok())
                .unwrap_or_default(),
            inactive_streak: 0,
            created_at: observed_at,
            updated_at: observed_at,
            name,
            description,
            short_description,
        })
    }

    fn raw_values<'a>(
        &'a self,
        fields: &'a Map<String, JsonValue>,
        canonical: &'a str,
    ) -> impl Iterator<Item = &'a JsonValue> + 'a {
        self.rules
            .field_names(canonical)
            .into_iter()
            .filter_map(move |column| fields.get(column))
    }

    fn text_field(&self, fields: &Map<String, JsonValue>, canonical: &str) -> Option<String> {
        self.raw_values(fields, canonical).find_map(value_text)
    }

    fn list_field(&self, fields: &Map<String, JsonValue>, canonical: &str) -> Vec<String> {
        self.raw_values(fields, canonical)
            .map(value_list)
            .find(|items| !items.is_empty())
            .unwrap_or_default()
    }

    fn number_field(&self, fields: &Map<String, JsonValue>, canonical: &str) -> Option<f64> {
        self.raw_values(fields, canonical).find_map(value_number)
    }

    fn website(&self, fields: &Map<String, JsonValue>) -> Option<String> {
        self.raw_values(fields, "website")
            .find_map(value_url)
            .and_then(|raw| normalize_website(&raw))
    }

    fn pricing_model(&self, fields: &Map<String, JsonValue>) -> PricingModel {
        match self.text_field(fields, "pricing") {
            Some(text) => text
                .parse::<PricingModel>()
                .unwrap_or_else(|_| self.pricing.classify(&text)),
            None => PricingModel::Unknown,
        }
    }

    pub fn resolve_category(&self, candidates: &[String]) -> String {
        candidates
            .iter()
            .find_map(|c| self.rules.categories.resolve(c))
            .unwrap_or(CATEGORY_OTHER)
            .to_string()
    }

    /// Canonical tags plus the unmapped source-language tags kept verbatim.
    pub fn resolve_tags(&self, raw_tags: &[String]) -> (Vec<String>, Vec<String>) {
        let mut seen = HashSet::new();
        let mut tags = Vec::new();
        let mut untranslated = Vec::new();
        for raw in raw_tags {
            let raw = raw.trim();
            if raw.is_empty() {
                continue;
            }
            let tag = match self.rules.tags.resolve(raw) {
                Some(canonical) => canonical.to_string(),
                None => {
                    if !raw.is_ascii() && !untranslated.iter().any(|u: &String| u == raw) {
                        untranslated.push(raw.to_string());
                    }
                    raw.to_string()
                }
            };
            if seen.insert(tag.to_lowercase()) {
                tags.push(tag);
            }
        }
        (tags, untranslated)
    }

    /// Exact name, then normalized key, then best substring match, then a generated badge.
    pub fn resolve_logo(&self, name: &str) -> Logo {
        let logos = &self.rules.logos;
        if let Some(path) = logos.exact(name) {
            return Logo::Asset { path: path.to_string() };
        }
        let key = normalized_name(name);
        if !key.is_empty() {
            if let Some(path) = logos.by_normalized(&key) {
                return Logo::Asset { path: path.to_string() };
            }
            let key_len = key.chars().count();
            let mut best: Option<(usize, &str)> = None;
            for (asset_key, path) in logos.normalized_entries() {
                let asset_len = asset_key.chars().count();
                if asset_len < MIN_LOGO_MATCH_CHARS {
                    continue;
                }
                let matched = if key.contains(asset_key) {
                    asset_len
                } else if key_len >= MIN_LOGO_MATCH_CHARS && asset_key.contains(key.as_str()) {
                    key_len
                } else {
                    continue;
                };
                // Entries arrive in key order, so only a strictly longer match replaces.
                if best.map_or(true, |(len, _)| matched > len) {
                    best = Some((matched, path));
                }
            }
            if let Some((_, path)) = best {
                return Logo::Asset { path: path.to_string() };
            }
        }
        generated_logo(name)
    }
}

pub fn generated_logo(name: &str) -> Logo {
    let initial = name
        .chars()
        .find(|c| c.is_alphanumeric())
        .map(|c| c.to_uppercase().collect::<String>())
        .unwrap_or_else(|| "#".to_string());
    let digest = Sha256::digest(name.trim().to_lowercase().as_bytes());
    let color = LOGO_PALETTE[usize::from(digest[0]) % LOGO_PALETTE.len()];
    Logo::Generated {
        initial,
        color: color.to_string(),
    }
}

/// Plain text for a cell: strings, numbers, rich-text arrays and link objects.
pub fn value_text(value: &JsonValue) -> Option<String> {
    let text = match value {
        JsonValue::String(s) => s.trim().to_string(),
        JsonValue::Number(n) => n.to_string(),
        JsonValue::Bool(b) => b.to_string(),
        JsonValue::Array(items) => items
            .iter()
            .filter_map(value_text)
            .collect::<Vec<_>>()
            .join(", "),
        JsonValue::Object(obj) => ["text", "name", "link", "url"]
            .iter()
            .find_map(|k| obj.get(*k).and_then(value_text))
            .unwrap_or_default(),
        JsonValue::Null => String::new(),
    };
    (!text.is_empty()).then_some(text)
}

fn value_url(value: &JsonValue) -> Option<String> {
    match value {
        JsonValue::Object(obj) => ["link", "url", "text"]
            .iter()
            .find_map(|k| obj.get(*k).and_then(value_text)),
        JsonValue::Array(items) => items.iter().find_map(value_url),
        other => value_text(other),
    }
}

pub fn value_list(value: &JsonValue) -> Vec<String> {
    match value {
        JsonValue::Array(items) => items.iter().filter_map(value_text).collect(),
        JsonValue::String(s) => s
            .split(&LIST_DELIMITERS[..])
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .map(str::to_string)
            .collect(),
        other => value_text(other).into_iter().collect(),
    }
}

fn value_number(value: &JsonValue) -> Option<f64> {
    let n = match value {
        JsonValue::Number(n) => n.as_f64(),
        JsonValue::String(s) => s.trim().parse::<f64>().ok(),
        JsonValue::Array(items) => items.iter().find_map(value_number),
        _ => None,
    }?;
    n.is_finite().then_some(n)
}

fn saturating_count(n: f64) -> u32 {
    if n <= 0.0 {
        0
    } else if n >= f64::from(u32::MAX) {
        u32::MAX
    } else {
        n as u32
    }
}

/// Trimmed, `https://` when no scheme is given; `None` when it does not parse as an http(s) URL.
pub fn normalize_website(raw: &str) -> Option<String> {
    let trimmed = raw.trim();
    if trimmed.is_empty() {
        return None;
    }
    let candidate = if trimmed.contains("://") {
        trimmed.to_string()
    } else {
        format!("https://{}", trimmed.trim_start_matches('/'))
    };
    let url = Url::parse(&candidate).ok()?;
    if !matches!(url.scheme(), "http" | "https") || url.host_str().map_or(true, str::is_empty) {
        return None;
    }
    Some(candidate)
}

/// First sentence of `text`, capped at [`SHORT_DESCRIPTION_MAX_CHARS`].
pub fn first_sentence(text: &str) -> String {
    let text = text.trim();
    let mut end = text.len();
    let mut chars = text.char_indices().peekable();
    while let Some((idx, ch)) = chars.next() {
        let boundary = match ch {
            '。' | '！' | '？' => true,
            '.' | '!' | '?' => chars.peek().map_or(true, |(_, next)| next.is_whitespace()),
            _ => false,
        };
        if boundary {
            end = idx + ch.len_utf8();
            break;
        }
    }
    truncate_chars(&text[..end], SHORT_DESCRIPTION_MAX_CHARS)
}

fn truncate_chars(text: &str, max: usize) -> String {
    let text = text.trim();
    if text.chars().count() <= max {
        return text.to_string();
    }
    let mut out = text.chars().take(max).collect::<String>().trim_end().to_string();
    out.push('…');
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use serde_json::json;

    const ALIASES: &str = r#"
version: 1
fields:
  name: [name_en, name, title, 工具名称]
  description: [description_en, description]
  category: [category, 分类]
  tags: [tags, 标签]
  website: [website, 官网]
  pricing: [pricing_model, pricing]
  features: [features]
categories:
  - canonical: Writing
    aliases: [写作, copywriting]
  - canonical: Video
    aliases: [视频]
tags:
  - canonical: Free
    aliases: [免费]
  - canonical: Open Source
    aliases: [开源]
"#;

    const LOGOS: &str = r#"
version: 1
assets:
  ChatGPT: /logos/chatgpt.png
  Notion AI: /logos/notion-ai.png
  Stable Diffusion: /logos/stable-diffusion.png
  Stable Diffusion XL: /logos/sdxl.png
  AI: /logos/ai.png
"#;

    fn normalizer() -> Normalizer {
        Normalizer::new(RuleSet::from_yaml_strs(ALIASES, LOGOS).unwrap())
    }

    fn observed() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 4, 2, 9, 30, 0).single().unwrap()
    }

    fn raw(id: &str, fields: JsonValue) -> RawRecord {
        RawRecord {
            record_id: id.to_string(),
            fields: fields.as_object().cloned().unwrap(),
        }
    }

    #[test]
    fn title_and_aliased_category_with_unknown_status() {
        let tool = normalizer()
            .normalize(&raw("rec1", json!({"title": "Acme", "category": "写作"})), observed())
            .unwrap();
        assert_eq!(tool.id, "rec1");
        assert_eq!(tool.name, "Acme");
        assert_eq!(tool.category, "Writing");
        assert_eq!(tool.status, ToolStatus::Unknown);
        assert_eq!(tool.created_at, observed());
        assert!(tool.logo.is_resolved());
    }

    #[test]
    fn normalization_is_deterministic() {
        let n = normalizer();
        let record = raw(
            "rec2",
            json!({
                "name_en": "Clipster",
                "分类": "视频",
                "标签": "免费, 剪辑神器, free",
                "官网": "clipster.example",
                "pricing": "Free tier, Pro $12/month",
                "features": ["Trim", "Caption"]
            }),
        );
        let a = n.normalize(&record, observed()).unwrap();
        let b = n.normalize(&record, observed()).unwrap();
        assert_eq!(a, b);
        assert_eq!(a.tags, vec!["Free".to_string(), "剪辑神器".to_string()]);
        assert_eq!(a.untranslated_tags, vec!["剪辑神器".to_string()]);
        assert_eq!(a.website.as_deref(), Some("https://clipster.example"));
        assert_eq!(a.pricing_model, PricingModel::Freemium);
    }

    #[test]
    fn blank_title_is_invalid() {
        let err = normalizer()
            .normalize(&raw("rec3", json!({"name": "   ", "category": "写作"})), observed())
            .unwrap_err();
        assert!(matches!(err, NormalizeError::InvalidRecord { record_id, .. } if record_id == "rec3"));
    }

    #[test]
    fn unmapped_or_missing_category_falls_back_to_other() {
        let n = normalizer();
        let unmapped = n
            .normalize(&raw("r", json!({"name": "X", "category": "园艺"})), observed())
            .unwrap();
        let missing = n.normalize(&raw("r", json!({"name": "X"})), observed()).unwrap();
        assert_eq!(unmapped.category, CATEGORY_OTHER);
        assert_eq!(missing.category, CATEGORY_OTHER);
    }

    #[test]
    fn name_column_priority_follows_alias_order() {
        let tool = normalizer()
            .normalize(&raw("r", json!({"工具名称": "写作猫", "name_en": "WriteCat"})), observed())
            .unwrap();
        assert_eq!(tool.name, "WriteCat");
    }

    #[test]
    fn logo_cascade() {
        let n = normalizer();
        assert_eq!(
            n.resolve_logo("ChatGPT"),
            Logo::Asset { path: "/logos/chatgpt.png".into() }
        );
        assert_eq!(
            n.resolve_logo("notion  ai!"),
            Logo::Asset { path: "/logos/notion-ai.png".into() }
        );
        // Longest asset key contained in the name wins; the 2-char "ai" key never matches.
        assert_eq!(
            n.resolve_logo("Stable Diffusion XL Turbo"),
            Logo::Asset { path: "/logos/sdxl.png".into() }
        );
        assert_eq!(
            n.resolve_logo("Chat"),
            Logo::Asset { path: "/logos/chatgpt.png".into() }
        );
        match n.resolve_logo("zeta ai") {
            Logo::Generated { initial, color } => {
                assert_eq!(initial, "Z");
                assert!(LOGO_PALETTE.contains(&color.as_str()));
            }
            other => panic!("expected generated logo, got {other:?}"),
        }
    }

    #[test]
    fn every_name_gets_a_logo() {
        let n = normalizer();
        for name in ["", "!!!", "写作猫", "x", "  9lives  "] {
            assert!(n.resolve_logo(name).is_resolved(), "{name:?}");
        }
        assert_eq!(
            generated_logo("!!!"),
            generated_logo("!!!"),
        );
        assert!(matches!(generated_logo("!!!"), Logo::Generated { initial, .. } if initial == "#"));
        assert!(matches!(generated_logo("写作猫"), Logo::Generated { initial, .. } if initial == "写"));
    }

    #[test]
    fn pricing_keyword_table() {
        let c = KeywordPricingClassifier;
        assert_eq!(c.classify("Free plan, Pro from $10/mo"), PricingModel::Freemium);
        assert_eq!(c.classify("7-day free trial"), PricingModel::Trial);
        assert_eq!(c.classify("Subscription only"), PricingModel::Paid);
        assert_eq!(c.classify("100% free"), PricingModel::Free);
        assert_eq!(c.classify("免费"), PricingModel::Free);
        assert_eq!(c.classify("contact sales"), PricingModel::Unknown);
        assert_eq!(c.classify(""), PricingModel::Unknown);
        assert_eq!(DisabledPricingClassifier.classify("free"), PricingModel::Unknown);
    }

    #[test]
    fn controlled_pricing_value_bypasses_classifier() {
        let n = normalizer().with_pricing_classifier(Arc::new(DisabledPricingClassifier));
        let controlled = n
            .normalize(&raw("r", json!({"name": "X", "pricing_model": "Paid"})), observed())
            .unwrap();
        let free_text = n
            .normalize(&raw("r", json!({"name": "X", "pricing": "free forever"})), observed())
            .unwrap();
        assert_eq!(controlled.pricing_model, PricingModel::Paid);
        assert_eq!(free_text.pricing_model, PricingModel::Unknown);
    }

    #[test]
    fn website_normalization() {
        assert_eq!(normalize_website(" acme.io "), Some("https://acme.io".into()));
        assert_eq!(normalize_website("http://acme.io/x"), Some("http://acme.io/x".into()));
        assert_eq!(normalize_website("ftp://acme.io"), None);
        assert_eq!(normalize_website("not a url"), None);
        assert_eq!(normalize_website("   "), None);
    }

    #[test]
    fn rich_text_cells_and_lists() {
        assert_eq!(
            value_text(&json!([{"text": "Acme"}, {"text": "Pro"}])),
            Some("Acme, Pro".into())
        );
        assert_eq!(
            value_url(&json!([{"text": "acme", "link": "https://acme.io"}])),
            Some("https://acme.io".into())
        );
        assert_eq!(
            value_list(&json!("a， b;c、d\ne")),
            vec!["a", "b", "c", "d", "e"]
        );
    }

    #[test]
    fn short_description_falls_back_to_first_sentence() {
        assert_eq!(first_sentence("Edit videos fast. Share anywhere."), "Edit videos fast.");
        assert_eq!(first_sentence("支持中文。也支持英文"), "支持中文。");
        assert_eq!(first_sentence("Visit acme.io today"), "Visit acme.io today");
        let long = "word ".repeat(60);
        let short = first_sentence(&long);
        assert!(short.ends_with('…'));
        assert!(short.chars().count() <= SHORT_DESCRIPTION_MAX_CHARS + 1);
    }

    #[test]
    fn rating_is_clamped_and_counts_saturate() {
        let tool = normalizer()
            .normalize(
                &raw("r", json!({"name": "X", "rating": "7.5", "review_count": -4})),
                observed(),
            )
            .unwrap();
        assert_eq!(tool.rating, Some(5.0));
        assert_eq!(tool.review_count, 0);
        assert_eq!(saturating_count(1e12), u32::MAX);
    }
}
