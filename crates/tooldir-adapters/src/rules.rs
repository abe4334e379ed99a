//! Versioned alias and logo tables loaded from `rules/*.yaml`.

use std::collections::{BTreeMap, HashMap};
use std::path::Path;

use anyhow::Context;
use serde::Deserialize;
use thiserror::Error;

pub const SUPPORTED_RULES_VERSION: u32 = 1;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum RuleLoadError {
    #[error("{file}: unsupported rules version {found} (expected {SUPPORTED_RULES_VERSION})")]
    UnsupportedVersion { file: String, found: u32 },
    #[error("{table} alias `{alias}` maps to both `{first}` and `{second}`")]
    AliasCollision {
        table: String,
        alias: String,
        first: String,
        second: String,
    },
    #[error("{table} entry has an empty canonical name")]
    EmptyCanonical { table: String },
}

#[derive(Debug, Clone, Deserialize)]
struct AliasesFile {
    version: u32,
    #[serde(default)]
    fields: BTreeMap<String, Vec<String>>,
    #[serde(default)]
    categories: Vec<AliasEntry>,
    #[serde(default)]
    tags: Vec<AliasEntry>,
}

#[derive(Debug, Clone, Deserialize)]
struct AliasEntry {
    canonical: String,
    #[serde(default)]
    aliases: Vec<String>,
}

#[derive(Debug, Clone, Deserialize)]
struct LogosFile {
    version: u32,
    #[serde(default)]
    assets: BTreeMap<String, String>,
}

pub fn alias_key(input: &str) -> String {
    input.trim().to_lowercase()
}

/// Lowercase, whitespace to hyphens, punctuation stripped, hyphen runs collapsed.
pub fn normalized_name(input: &str) -> String {
    let mut out = String::with_capacity(input.len());
    for ch in input.trim().to_lowercase().chars() {
        if ch.is_whitespace() || ch == '-' || ch == '_' {
            if !out.ends_with('-') {
                out.push('-');
            }
        } else if ch.is_alphanumeric() {
            out.push(ch);
        }
    }
    out.trim_matches('-').to_string()
}

/// One alias table: source spelling (case-insensitive) to canonical value.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AliasTable {
    canonicals: Vec<String>,
    lookup: HashMap<String, String>,
}

impl AliasTable {
    fn build(table: &str, entries: &[AliasEntry]) -> Result<Self, RuleLoadError> {
        let mut out = Self::default();
        for entry in entries {
            let canonical = entry.canonical.trim();
            if canonical.is_empty() {
                return Err(RuleLoadError::EmptyCanonical {
                    table: table.to_string(),
                });
            }
            out.canonicals.push(canonical.to_string());
            for alias in std::iter::once(canonical).chain(entry.aliases.iter().map(String::as_str)) {
                let key = alias_key(alias);
                if key.is_empty() {
                    continue;
                }
                match out.lookup.get(&key) {
                    Some(existing) if existing != canonical => {
                        return Err(RuleLoadError::AliasCollision {
                            table: table.to_string(),
                            alias: alias.trim().to_string(),
                            first: existing.clone(),
                            second: canonical.to_string(),
                        });
                    }
                    Some(_) => {}
                    None => {
                        out.lookup.insert(key, canonical.to_string());
                    }
                }
            }
        }
        Ok(out)
    }

    pub fn resolve(&self, raw: &str) -> Option<&str> {
        self.lookup.get(&alias_key(raw)).map(String::as_str)
    }

    pub fn canonicals(&self) -> &[String] {
        &self.canonicals
    }
}

/// Known local logo assets keyed by tool name.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LogoAssets {
    exact: BTreeMap<String, String>,
    normalized: BTreeMap<String, String>,
}

impl LogoAssets {
    fn build(assets: BTreeMap<String, String>) -> Result<Self, RuleLoadError> {
        let mut normalized: BTreeMap<String, String> = BTreeMap::new();
        for (name, path) in &assets {
            let key = normalized_name(name);
            if key.is_empty() {
                continue;
            }
            if let Some(existing) = normalized.get(&key) {
                if existing != path {
                    return Err(RuleLoadError::AliasCollision {
                        table: "logos".to_string(),
                        alias: key,
                        first: existing.clone(),
                        second: path.clone(),
                    });
                }
            }
            normalized.insert(key, path.clone());
        }
        Ok(Self {
            exact: assets,
            normalized,
        })
    }

    pub fn exact(&self, name: &str) -> Option<&str> {
        self.exact.get(name.trim()).map(String::as_str)
    }

    pub fn by_normalized(&self, key: &str) -> Option<&str> {
        self.normalized.get(key).map(String::as_str)
    }

    /// Normalized keys with their asset paths, in stable order.
    pub fn normalized_entries(&self) -> impl Iterator<Item = (&str, &str)> {
        self.normalized.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }

    pub fn len(&self) -> usize {
        self.exact.len()
    }

    pub fn is_empty(&self) -> bool {
        self.exact.is_empty()
    }
}

/// Everything the normalizer needs besides the raw record itself.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RuleSet {
    pub fields: BTreeMap<String, Vec<String>>,
    pub categories: AliasTable,
    pub tags: AliasTable,
    pub logos: LogoAssets,
}

impl RuleSet {
    pub fn from_yaml_strs(aliases_yaml: &str, logos_yaml: &str) -> anyhow::Result<Self> {
        let aliases: AliasesFile = serde_yaml::from_str(aliases_yaml).context("parsing aliases rules")?;
        let logos: LogosFile = serde_yaml::from_str(logos_yaml).context("parsing logo rules")?;
        Ok(Self::build(aliases, logos)?)
    }

    pub fn from_workspace_root(root: &Path) -> anyhow::Result<Self> {
        let rules_dir = root.join("rules");
        let aliases_path = rules_dir.join("aliases.yaml");
        let logos_path = rules_dir.join("logos.yaml");
        let aliases = std::fs::read_to_string(&aliases_path)
            .with_context(|| format!("reading {}", aliases_path.display()))?;
        let logos = std::fs::read_to_string(&logos_path)
            .with_context(|| format!("reading {}", logos_path.display()))?;
        Self::from_yaml_strs(&aliases, &logos)
            .with_context(|| format!("loading rules from {}", rules_dir.display()))
    }

    fn build(aliases: AliasesFile, logos: LogosFile) -> Result<Self, RuleLoadError> {
        if aliases.version != SUPPORTED_RULES_VERSION {
            return Err(RuleLoadError::UnsupportedVersion {
                file: "aliases.yaml".to_string(),
                found: aliases.version,
            });
        }
        if logos.version != SUPPORTED_RULES_VERSION {
            return Err(RuleLoadError::UnsupportedVersion {
                file: "logos.yaml".to_string(),
                found: logos.version,
            });
        }
        Ok(Self {
            fields: aliases.fields,
            categories: AliasTable::build("category", &aliases.categories)?,
            tags: AliasTable::build("tag", &aliases.tags)?,
            logos: LogoAssets::build(logos.assets)?,
        })
    }

    /// Raw column names to try for a canonical field, in priority order.
    pub fn field_names<'a>(&'a self, canonical: &'a str) -> Vec<&'a str> {
        match self.fields.get(canonical) {
            Some(names) if !names.is_empty() => names.iter().map(String::as_str).collect(),
            _ => vec![canonical],
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;

    const LOGOS: &str = "version: 1\nassets: {}\n";

    #[test]
    fn normalized_name_strips_punctuation_and_spaces() {
        assert_eq!(normalized_name("Notion AI"), "notion-ai");
        assert_eq!(normalized_name("  Chat.GPT!  "), "chatgpt");
        assert_eq!(normalized_name("Stable  Diffusion - XL"), "stable-diffusion-xl");
        assert_eq!(normalized_name("!!!"), "");
    }

    #[test]
    fn alias_lookup_is_case_insensitive_and_includes_canonical() {
        let rules = RuleSet::from_yaml_strs(
            "version: 1\ncategories:\n  - canonical: Writing\n    aliases: [写作, Copywriting]\n",
            LOGOS,
        )
        .unwrap();
        assert_eq!(rules.categories.resolve("写作"), Some("Writing"));
        assert_eq!(rules.categories.resolve(" copywriting "), Some("Writing"));
        assert_eq!(rules.categories.resolve("writing"), Some("Writing"));
        assert_eq!(rules.categories.resolve("视频"), None);
    }

    #[test]
    fn colliding_aliases_are_rejected_at_load() {
        let yaml = "version: 1\ncategories:\n  - canonical: Writing\n    aliases: [文案]\n  - canonical: Marketing\n    aliases: [文案]\n";
        let err = RuleSet::from_yaml_strs(yaml, LOGOS).unwrap_err();
        let root = err.downcast_ref::<RuleLoadError>().unwrap();
        assert_eq!(
            root,
            &RuleLoadError::AliasCollision {
                table: "category".into(),
                alias: "文案".into(),
                first: "Writing".into(),
                second: "Marketing".into(),
            }
        );
    }

    #[test]
    fn unsupported_version_is_rejected() {
        let err = RuleSet::from_yaml_strs("version: 2\n", LOGOS).unwrap_err();
        assert!(matches!(
            err.downcast_ref::<RuleLoadError>(),
            Some(RuleLoadError::UnsupportedVersion { found: 2, .. })
        ));
    }

    #[test]
    fn logo_names_colliding_after_normalization_are_rejected() {
        let logos = "version: 1\nassets:\n  Notion AI: /logos/a.png\n  notion-ai: /logos/b.png\n";
        assert!(RuleSet::from_yaml_strs("version: 1\n", logos).is_err());
    }

    #[test]
    fn workspace_rules_load() {
        let root = PathBuf::from(env!("CARGO_MANIFEST_DIR")).join("../..");
        let rules = RuleSet::from_workspace_root(&root).unwrap();
        assert!(!rules.categories.canonicals().is_empty());
        assert!(!rules.logos.is_empty());
        assert!(rules.field_names("name").contains(&"name"));
    }
}
