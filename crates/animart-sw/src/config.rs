//! Worker configuration.
//!
//! Everything a deployed worker needs to know is resolved once, at startup,
//! from a [`WorkerConfig`]: which cache generation is current, what the asset
//! manifest holds, and which fetch strategy applies.

use std::fmt;
use std::path::Path;
use std::str::FromStr;
use std::time::Duration;

use animart_common::{AnimartError, Result};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use url::Url;

/// Compile-time override for the cache generation name.
///
/// Set `ANIMART_CACHE_VERSION` when building a release and every config
/// loaded by that build uses it as the current generation.
pub const BUILD_CACHE_VERSION: Option<&str> = option_env!("ANIMART_CACHE_VERSION");

/// Navigation entry point every manifest must include.
pub const NAVIGATION_ENTRY: &str = "/";

/// Digest characters kept in a derived generation name.
const DIGEST_LEN: usize = 12;

// ==================== Cache Generation ====================

/// Version-qualified cache name, e.g. `animart-v2`.
///
/// Only exact string equality matters; names are never parsed.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct CacheGeneration(String);

impl CacheGeneration {
    /// Create a generation name.
    pub fn new(name: impl Into<String>) -> Result<Self> {
        let name = name.into();
        if name.trim().is_empty() {
            return Err(AnimartError::InvalidArgument(
                "cache generation name must not be empty".to_string(),
            ));
        }
        Ok(Self(name))
    }

    /// Derive a generation name from a manifest's content digest.
    pub fn from_manifest(prefix: &str, manifest: &AssetManifest) -> Self {
        let digest = manifest.digest();
        Self(format!("{}-{}", prefix, &digest[..DIGEST_LEN]))
    }

    /// Name as a string slice.
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Name of the runtime cache paired with this generation.
    pub fn runtime_name(&self) -> String {
        format!("{}-runtime", self.0)
    }
}

impl fmt::Display for CacheGeneration {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

// ==================== Asset Manifest ====================

/// Ordered list of root-relative asset paths cached at install time.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(transparent)]
pub struct AssetManifest(Vec<String>);

impl AssetManifest {
    /// Create a manifest from paths.
    pub fn new<I, S>(entries: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self(entries.into_iter().map(Into::into).collect())
    }

    /// Entries in manifest order.
    pub fn entries(&self) -> &[String] {
        &self.0
    }

    /// Number of entries.
    pub fn len(&self) -> usize {
        self.0.len()
    }

    /// Whether the manifest is empty.
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Check the manifest describes an offline-capable shell.
    pub fn validate(&self) -> Result<()> {
        if self.0.is_empty() {
            return Err(AnimartError::config("asset manifest is empty"));
        }

        let mut seen = hashbrown::HashSet::new();
        for entry in &self.0 {
            if !entry.starts_with('/') {
                return Err(AnimartError::config(format!(
                    "manifest entry is not root-relative: {entry}"
                )));
            }
            if !seen.insert(entry.as_str()) {
                return Err(AnimartError::config(format!(
                    "duplicate manifest entry: {entry}"
                )));
            }
        }

        if !seen.contains(NAVIGATION_ENTRY) {
            return Err(AnimartError::config(format!(
                "manifest must include the navigation entry point {NAVIGATION_ENTRY}"
            )));
        }

        Ok(())
    }

    /// Resolve entries against an origin, keeping order.
    pub fn resolve(&self, origin: &Url) -> Result<Vec<Url>> {
        self.0
            .iter()
            .map(|entry| {
                origin.join(entry).map_err(|e| {
                    AnimartError::config_with_source(format!("cannot resolve {entry}"), e)
                })
            })
            .collect()
    }

    /// Hex SHA-256 of the ordered entries.
    pub fn digest(&self) -> String {
        let mut hasher = Sha256::new();
        for entry in &self.0 {
            hasher.update(entry.as_bytes());
            hasher.update(b"\n");
        }
        hex::encode(hasher.finalize())
    }
}

// ==================== Fetch Strategy ====================

/// Response strategy for intercepted fetches.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum FetchStrategy {
    /// Serve from cache, fall back to the network.
    #[default]
    CacheFirst,
    /// Serve from the network, fall back to the cache when it fails.
    NetworkFirst,
}

impl FromStr for FetchStrategy {
    type Err = AnimartError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "cache-first" => Ok(Self::CacheFirst),
            "network-first" => Ok(Self::NetworkFirst),
            other => Err(AnimartError::InvalidArgument(format!(
                "unknown fetch strategy: {other}"
            ))),
        }
    }
}

impl fmt::Display for FetchStrategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::CacheFirst => f.write_str("cache-first"),
            Self::NetworkFirst => f.write_str("network-first"),
        }
    }
}

// ==================== Worker Config ====================

/// Worker configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkerConfig {
    /// Origin the app is served from
    pub origin: Url,

    /// Registration scope, root-relative
    #[serde(default = "default_scope")]
    pub scope: String,

    /// Worker script path, root-relative
    #[serde(default = "default_script")]
    pub script: String,

    /// Current cache generation
    pub cache_name: CacheGeneration,

    /// Assets cached at install time
    pub manifest: AssetManifest,

    /// Fetch strategy
    #[serde(default)]
    pub strategy: FetchStrategy,

    /// Activate right after install instead of waiting for old pages to close
    #[serde(default)]
    pub skip_waiting: bool,

    /// Take control of already-open pages on activation
    #[serde(default)]
    pub clients_claim: bool,

    /// Store successful runtime GETs in `<cache_name>-runtime`
    #[serde(default)]
    pub runtime_caching: bool,

    /// Upper bound on fetch-handler network requests, in milliseconds
    #[serde(default)]
    pub network_timeout_ms: Option<u64>,

    /// Icon used when a push payload carries none
    #[serde(default = "default_icon")]
    pub default_icon: String,
}

fn default_scope() -> String {
    "/".to_string()
}

fn default_script() -> String {
    "/sw.js".to_string()
}

fn default_icon() -> String {
    "/icons/icon-192x192.png".to_string()
}

impl WorkerConfig {
    /// Create a config with defaults for everything but the essentials.
    pub fn new(origin: Url, cache_name: CacheGeneration, manifest: AssetManifest) -> Self {
        Self {
            origin,
            scope: default_scope(),
            script: default_script(),
            cache_name,
            manifest,
            strategy: FetchStrategy::default(),
            skip_waiting: false,
            clients_claim: false,
            runtime_caching: false,
            network_timeout_ms: None,
            default_icon: default_icon(),
        }
    }

    /// Parse and validate a JSON config.
    pub fn from_json(json: &str) -> Result<Self> {
        let config: Self = serde_json::from_str(json)
            .map_err(|e| AnimartError::config_with_source("invalid worker config", e))?;
        let config = config.with_build_version();
        config.validate()?;
        Ok(config)
    }

    /// Load and validate a JSON config file.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let json = std::fs::read_to_string(path.as_ref())?;
        Self::from_json(&json)
    }

    /// Serialize as pretty JSON.
    pub fn to_json(&self) -> Result<String> {
        serde_json::to_string_pretty(self)
            .map_err(|e| AnimartError::config_with_source("cannot serialize worker config", e))
    }

    /// Apply the compile-time generation override, if any.
    pub fn with_build_version(self) -> Self {
        match BUILD_CACHE_VERSION.map(CacheGeneration::new) {
            Some(Ok(generation)) => self.with_cache_name(generation),
            _ => self,
        }
    }

    /// Replace the cache generation.
    pub fn with_cache_name(mut self, cache_name: CacheGeneration) -> Self {
        self.cache_name = cache_name;
        self
    }

    /// Replace the cache generation with one derived from the manifest digest.
    pub fn with_generation_from_manifest(self, prefix: &str) -> Self {
        let generation = CacheGeneration::from_manifest(prefix, &self.manifest);
        self.with_cache_name(generation)
    }

    /// Set the fetch strategy.
    pub fn with_strategy(mut self, strategy: FetchStrategy) -> Self {
        self.strategy = strategy;
        self
    }

    /// Validate the whole config.
    pub fn validate(&self) -> Result<()> {
        if !matches!(self.origin.scheme(), "http" | "https") || self.origin.host().is_none() {
            return Err(AnimartError::config(format!(
                "origin must be an http(s) URL with a host: {}",
                self.origin
            )));
        }
        CacheGeneration::new(self.cache_name.as_str())?;
        self.manifest.validate()?;
        if !self.scope.starts_with('/') {
            return Err(AnimartError::config(format!(
                "scope must be root-relative: {}",
                self.scope
            )));
        }
        if !self.script.starts_with('/') {
            return Err(AnimartError::config(format!(
                "script must be root-relative: {}",
                self.script
            )));
        }
        if self.default_icon.is_empty() {
            return Err(AnimartError::config("default icon must not be empty"));
        }
        Ok(())
    }

    /// Absolute registration scope.
    pub fn scope_url(&self) -> Result<Url> {
        self.origin
            .join(&self.scope)
            .map_err(|e| AnimartError::config_with_source("invalid scope", e))
    }

    /// Absolute worker script URL.
    pub fn script_url(&self) -> Result<Url> {
        self.origin
            .join(&self.script)
            .map_err(|e| AnimartError::config_with_source("invalid script path", e))
    }

    /// Absolute manifest URLs, in order.
    pub fn manifest_urls(&self) -> Result<Vec<Url>> {
        self.manifest.resolve(&self.origin)
    }

    /// Network timeout for fetch handling.
    pub fn network_timeout(&self) -> Option<Duration> {
        self.network_timeout_ms.map(Duration::from_millis)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: &str = r#"{
        "origin": "https://shop.test",
        "cache_name": "animart-v2",
        "manifest": ["/", "/index.html", "/app.js"],
        "strategy": "network-first",
        "skip_waiting": true
    }"#;

    #[test]
    fn test_parse_sample_config() {
        let config = WorkerConfig::from_json(SAMPLE).unwrap();
        assert_eq!(config.strategy, FetchStrategy::NetworkFirst);
        assert!(config.skip_waiting);
        assert!(!config.clients_claim);
        assert_eq!(config.scope, "/");
        assert_eq!(config.default_icon, "/icons/icon-192x192.png");
        assert_eq!(config.network_timeout(), None);
    }

    #[test]
    fn test_manifest_urls_keep_order() {
        let config = WorkerConfig::from_json(SAMPLE).unwrap();
        let urls: Vec<String> = config
            .manifest_urls()
            .unwrap()
            .into_iter()
            .map(|u| u.to_string())
            .collect();
        assert_eq!(
            urls,
            vec![
                "https://shop.test/",
                "https://shop.test/index.html",
                "https://shop.test/app.js"
            ]
        );
    }

    #[test]
    fn test_manifest_requires_entry_point() {
        let manifest = AssetManifest::new(["/index.html"]);
        assert!(manifest.validate().is_err());
    }

    #[test]
    fn test_manifest_rejects_duplicates_and_relative() {
        assert!(AssetManifest::new(["/", "/"]).validate().is_err());
        assert!(AssetManifest::new(["/", "app.js"]).validate().is_err());
        assert!(AssetManifest::default().validate().is_err());
    }

    #[test]
    fn test_generation_from_manifest_tracks_content() {
        let v1 = AssetManifest::new(["/", "/index.html"]);
        let v2 = AssetManifest::new(["/", "/index.html", "/offline.html"]);

        let g1 = CacheGeneration::from_manifest("animart", &v1);
        assert_eq!(g1, CacheGeneration::from_manifest("animart", &v1));
        assert_ne!(g1, CacheGeneration::from_manifest("animart", &v2));
        assert!(g1.as_str().starts_with("animart-"));
        assert_eq!(g1.as_str().len(), "animart-".len() + DIGEST_LEN);
    }

    #[test]
    fn test_empty_generation_rejected() {
        assert!(CacheGeneration::new("  ").is_err());
        let json = SAMPLE.replace("animart-v2", "");
        assert!(WorkerConfig::from_json(&json).is_err());
    }

    #[test]
    fn test_strategy_round_trip_names() {
        assert_eq!(
            "cache-first".parse::<FetchStrategy>().unwrap(),
            FetchStrategy::CacheFirst
        );
        assert_eq!(FetchStrategy::NetworkFirst.to_string(), "network-first");
        assert!("stale-while-revalidate".parse::<FetchStrategy>().is_err());
    }

    #[test]
    fn test_rejects_non_http_origin() {
        let json = SAMPLE.replace("https://shop.test", "file:///tmp");
        assert!(WorkerConfig::from_json(&json).is_err());
    }

    #[test]
    fn test_from_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("worker.json");
        std::fs::write(&path, SAMPLE).unwrap();

        let config = WorkerConfig::from_file(&path).unwrap();
        assert_eq!(config.manifest.len(), 3);

        assert!(WorkerConfig::from_file(dir.path().join("missing.json")).is_err());
    }
}
