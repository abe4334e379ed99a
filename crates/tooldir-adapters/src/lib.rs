//! Content store clients, alias/logo rule tables and the record normalizer.

pub mod content_store;
pub mod normalize;
pub mod rules;

pub use content_store::{
    parse_page, ContentStore, ContentStoreConfig, ContentStoreError, FixtureContentStore, HttpContentStore, Page,
    StatusFilter, CONTENT_STORE_PARTITION,
};
pub use normalize::{
    generated_logo, normalize_website, DisabledPricingClassifier, KeywordPricingClassifier, NormalizeError,
    Normalizer, PricingClassifier,
};
pub use rules::{normalized_name, AliasTable, LogoAssets, RuleLoadError, RuleSet};

pub const CRATE_NAME: &str = "tooldir-adapters";
