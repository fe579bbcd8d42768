//! Configuration loading from TOML.
//!
//! Reads `config.toml` and deserializes into strongly-typed structs.
//! Every knob has a serde default so a partial (or absent) file still
//! yields a working configuration.

use anyhow::{Context, Result};
use serde::Deserialize;
use std::fs;
use std::path::Path;

use crate::types::Language;

/// Top-level application configuration.
#[derive(Debug, Deserialize, Clone, Default)]
pub struct AppConfig {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub scraper: ScraperConfig,
    #[serde(default)]
    pub cache: CacheConfig,
    #[serde(default)]
    pub storage: StorageConfig,
    #[serde(default)]
    pub sets: KnownSets,
}

#[derive(Debug, Deserialize, Clone)]
pub struct ServerConfig {
    #[serde(default = "default_port")]
    pub port: u16,
}

#[derive(Debug, Deserialize, Clone)]
pub struct ScraperConfig {
    /// Retries per rarity/query before that rarity is skipped.
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    #[serde(default = "default_request_timeout_secs")]
    pub request_timeout_secs: u64,
    /// Global cap on concurrent fetch operations across queries.
    #[serde(default = "default_fetch_concurrency")]
    pub fetch_concurrency: usize,
    #[serde(default = "default_marketplace_rpm")]
    pub max_requests_per_minute_marketplace: u32,
    #[serde(default = "default_auction_rpm")]
    pub max_requests_per_minute_auction: u32,
}

#[derive(Debug, Deserialize, Clone)]
pub struct CacheConfig {
    #[serde(default = "default_cache_ttl_hours")]
    pub ttl_hours: u64,
    #[serde(default = "default_cache_path")]
    pub path: String,
}

#[derive(Debug, Deserialize, Clone)]
pub struct StorageConfig {
    #[serde(default = "default_database_url")]
    pub database_url: String,
}

/// Enumerated set lists used to validate `set_name` inputs and to drive
/// the bulk "scrape all sets" plan.
#[derive(Debug, Deserialize, Clone)]
pub struct KnownSets {
    #[serde(default = "default_english_sets")]
    pub english: Vec<String>,
    #[serde(default = "default_japanese_sets")]
    pub japanese: Vec<String>,
}

impl KnownSets {
    pub fn for_language(&self, language: Language) -> &[String] {
        match language {
            Language::English => &self.english,
            Language::Japanese => &self.japanese,
        }
    }

    /// Whether a set name is known in any language.
    pub fn contains(&self, set_name: &str) -> bool {
        self.english.iter().any(|s| s == set_name)
            || self.japanese.iter().any(|s| s == set_name)
    }
}

fn default_port() -> u16 {
    8080
}
fn default_max_retries() -> u32 {
    3
}
fn default_request_timeout_secs() -> u64 {
    10
}
fn default_fetch_concurrency() -> usize {
    10
}
fn default_marketplace_rpm() -> u32 {
    30
}
fn default_auction_rpm() -> u32 {
    30
}
fn default_cache_ttl_hours() -> u64 {
    24
}
fn default_cache_path() -> String {
    "gradegap_cache.json".to_string()
}
fn default_database_url() -> String {
    "sqlite://gradegap.db".to_string()
}
fn default_english_sets() -> Vec<String> {
    [
        "Obsidian Flames",
        "Paldea Evolved",
        "Paradox Rift",
        "Temporal Forces",
        "Twilight Masquerade",
    ]
    .map(String::from)
    .to_vec()
}
fn default_japanese_sets() -> Vec<String> {
    [
        "Pokemon Card 151",
        "Shiny Treasure ex",
        "VSTAR Universe",
        "Raging Surf",
        "Wild Force",
    ]
    .map(String::from)
    .to_vec()
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self { port: default_port() }
    }
}

impl Default for ScraperConfig {
    fn default() -> Self {
        Self {
            max_retries: default_max_retries(),
            request_timeout_secs: default_request_timeout_secs(),
            fetch_concurrency: default_fetch_concurrency(),
            max_requests_per_minute_marketplace: default_marketplace_rpm(),
            max_requests_per_minute_auction: default_auction_rpm(),
        }
    }
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            ttl_hours: default_cache_ttl_hours(),
            path: default_cache_path(),
        }
    }
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            database_url: default_database_url(),
        }
    }
}

impl Default for KnownSets {
    fn default() -> Self {
        Self {
            english: default_english_sets(),
            japanese: default_japanese_sets(),
        }
    }
}

impl AppConfig {
    /// Load configuration from a TOML file. A missing file yields the
    /// default configuration (everything has a sane default and no
    /// secrets are required).
    pub fn load(path: &str) -> Result<Self> {
        if !Path::new(path).exists() {
            return Ok(Self::default());
        }
        let contents = fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {path}"))?;
        let config: AppConfig = toml::from_str(&contents)
            .with_context(|| format!("Failed to parse config file: {path}"))?;
        Ok(config)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let cfg = AppConfig::default();
        assert_eq!(cfg.scraper.max_retries, 3);
        assert_eq!(cfg.scraper.fetch_concurrency, 10);
        assert_eq!(cfg.cache.ttl_hours, 24);
        assert!(!cfg.sets.english.is_empty());
        assert!(!cfg.sets.japanese.is_empty());
    }

    #[test]
    fn test_partial_toml_fills_defaults() {
        let cfg: AppConfig = toml::from_str(
            r#"
            [scraper]
            max_requests_per_minute_marketplace = 10

            [server]
            port = 9000
            "#,
        )
        .unwrap();
        assert_eq!(cfg.server.port, 9000);
        assert_eq!(cfg.scraper.max_requests_per_minute_marketplace, 10);
        // Untouched sections keep their defaults
        assert_eq!(cfg.scraper.max_requests_per_minute_auction, 30);
        assert_eq!(cfg.storage.database_url, "sqlite://gradegap.db");
    }

    #[test]
    fn test_known_sets_lookup() {
        let sets = KnownSets::default();
        assert!(sets.contains("Pokemon Card 151"));
        assert!(sets.contains("Obsidian Flames"));
        assert!(!sets.contains("Fake Set"));
        assert!(sets
            .for_language(Language::Japanese)
            .iter()
            .any(|s| s == "Pokemon Card 151"));
    }

    #[test]
    fn test_load_missing_file_is_default() {
        let cfg = AppConfig::load("/tmp/gradegap_no_such_config.toml").unwrap();
        assert_eq!(cfg.server.port, 8080);
    }
}
