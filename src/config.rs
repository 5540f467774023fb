//! Shell configuration

use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

use crate::error::ConfigError;

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct Config {
    #[serde(default)]
    pub shell: ShellConfig,
    #[serde(default)]
    pub connectivity: ConnectivityConfig,
    #[serde(default)]
    pub worker: WorkerConfig,
    #[serde(default)]
    pub selection: SelectionConfig,
    #[serde(default)]
    pub live: LiveConfig,
}

/// Offline shell snapshot configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ShellConfig {
    /// Allowlisted shell routes (exact pathname match)
    #[serde(default = "default_routes")]
    pub routes: Vec<String>,

    /// Cache scope for page-level shell snapshots
    #[serde(default = "default_cache_name")]
    pub cache_name: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConnectivityConfig {
    /// Liveness endpoint, probed with HEAD
    #[serde(default = "default_health_endpoint")]
    pub health_endpoint: String,

    /// Base polling interval in milliseconds
    #[serde(default = "default_poll_interval")]
    pub poll_interval_ms: u64,

    /// Backoff exponent ceiling (interval = base * 2^min(retries, cap))
    #[serde(default = "default_max_backoff_exponent")]
    pub max_backoff_exponent: u32,

    /// Probe request timeout in milliseconds
    #[serde(default = "default_probe_timeout")]
    pub probe_timeout_ms: u64,
}

/// How the worker script itself is fetched on update checks
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum UpdateViaCache {
    #[default]
    None,
    Imports,
    All,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkerConfig {
    /// Worker script URL
    #[serde(default = "default_script_url")]
    pub script_url: String,

    /// Registration scope
    #[serde(default = "default_scope")]
    pub scope: String,

    #[serde(default)]
    pub update_via_cache: UpdateViaCache,

    /// Reload the page once when a new worker takes control
    #[serde(default)]
    pub reload_on_controller_change: bool,

    /// Network timeout of the dynamic-routes strategy before the cache answers
    #[serde(default = "default_network_timeout")]
    pub network_timeout_ms: u64,

    /// Precache manifest
    #[serde(default)]
    pub precache: Vec<PrecacheEntry>,
}

/// One precache manifest entry. Unrevisioned URLs are expected to carry a
/// content hash in their path.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PrecacheEntry {
    pub url: String,
    #[serde(default)]
    pub revision: Option<String>,
}

impl PrecacheEntry {
    pub fn new(url: impl Into<String>, revision: Option<&str>) -> Self {
        Self {
            url: url.into(),
            revision: revision.map(str::to_string),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SelectionConfig {
    /// How long the transient reset signal stays raised
    #[serde(default = "default_reset_debounce")]
    pub reset_debounce_ms: u64,
}

/// Parameters for the external server-push session
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LiveConfig {
    #[serde(default = "default_live_endpoint")]
    pub endpoint: String,

    #[serde(default = "default_long_poll_fallback")]
    pub long_poll_fallback_ms: u64,

    /// Name of the page meta tag carrying the anti-forgery token
    #[serde(default = "default_csrf_meta_name")]
    pub csrf_meta_name: String,
}

// Defaults
fn default_routes() -> Vec<String> {
    vec!["/".to_string(), "/map".to_string()]
}
fn default_cache_name() -> String { "lv-pages".to_string() }
fn default_health_endpoint() -> String { "/connectivity".to_string() }
fn default_poll_interval() -> u64 { 5000 }
fn default_max_backoff_exponent() -> u32 { 5 }
fn default_probe_timeout() -> u64 { 4000 }
fn default_script_url() -> String { "/sw.js".to_string() }
fn default_scope() -> String { "/".to_string() }
fn default_network_timeout() -> u64 { 3000 }
fn default_reset_debounce() -> u64 { 100 }
fn default_live_endpoint() -> String { "/live".to_string() }
fn default_long_poll_fallback() -> u64 { 2000 }
fn default_csrf_meta_name() -> String { "csrf-token".to_string() }

impl Default for ShellConfig {
    fn default() -> Self {
        Self {
            routes: default_routes(),
            cache_name: default_cache_name(),
        }
    }
}

impl Default for ConnectivityConfig {
    fn default() -> Self {
        Self {
            health_endpoint: default_health_endpoint(),
            poll_interval_ms: default_poll_interval(),
            max_backoff_exponent: default_max_backoff_exponent(),
            probe_timeout_ms: default_probe_timeout(),
        }
    }
}

impl ConnectivityConfig {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    pub fn probe_timeout(&self) -> Duration {
        Duration::from_millis(self.probe_timeout_ms)
    }
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            script_url: default_script_url(),
            scope: default_scope(),
            update_via_cache: UpdateViaCache::default(),
            reload_on_controller_change: false,
            network_timeout_ms: default_network_timeout(),
            precache: Vec::new(),
        }
    }
}

impl WorkerConfig {
    pub fn network_timeout(&self) -> Duration {
        Duration::from_millis(self.network_timeout_ms)
    }
}

impl Default for SelectionConfig {
    fn default() -> Self {
        Self {
            reset_debounce_ms: default_reset_debounce(),
        }
    }
}

impl SelectionConfig {
    pub fn reset_debounce(&self) -> Duration {
        Duration::from_millis(self.reset_debounce_ms)
    }
}

impl Default for LiveConfig {
    fn default() -> Self {
        Self {
            endpoint: default_live_endpoint(),
            long_poll_fallback_ms: default_long_poll_fallback(),
            csrf_meta_name: default_csrf_meta_name(),
        }
    }
}

impl Config {
    /// Parse and validate a TOML document.
    pub fn from_toml_str(content: &str) -> Result<Self, ConfigError> {
        let config: Config = toml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    /// Load from a file, falling back to defaults when it does not exist.
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        if !path.exists() {
            tracing::info!(path = %path.display(), "Config file not found, using defaults");
            return Ok(Config::default());
        }
        let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.display().to_string(),
            source,
        })?;
        Self::from_toml_str(&content)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.shell.routes.is_empty() {
            return Err(ConfigError::Invalid("shell.routes must not be empty".into()));
        }
        if let Some(route) = self.shell.routes.iter().find(|r| !r.starts_with('/')) {
            return Err(ConfigError::Invalid(format!(
                "shell route {route:?} must start with '/'"
            )));
        }
        if self.connectivity.poll_interval_ms == 0 {
            return Err(ConfigError::Invalid(
                "connectivity.poll_interval_ms must be positive".into(),
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_match_deployed_app() {
        let config = Config::default();
        assert_eq!(config.shell.routes, vec!["/", "/map"]);
        assert_eq!(config.shell.cache_name, "lv-pages");
        assert_eq!(config.connectivity.poll_interval_ms, 5000);
        assert_eq!(config.connectivity.max_backoff_exponent, 5);
        assert_eq!(config.worker.update_via_cache, UpdateViaCache::None);
        assert_eq!(config.selection.reset_debounce(), Duration::from_millis(100));
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_partial_toml_fills_defaults() {
        let config = Config::from_toml_str(
            r#"
[connectivity]
poll_interval_ms = 2000

[worker]
update_via_cache = "all"
reload_on_controller_change = true
"#,
        )
        .unwrap();

        assert_eq!(config.connectivity.poll_interval_ms, 2000);
        assert_eq!(config.connectivity.health_endpoint, "/connectivity");
        assert_eq!(config.worker.update_via_cache, UpdateViaCache::All);
        assert!(config.worker.reload_on_controller_change);
        assert_eq!(config.shell.routes, vec!["/", "/map"]);
    }

    #[test]
    fn test_precache_manifest() {
        let config = Config::from_toml_str(
            r#"
[[worker.precache]]
url = "assets/app.js"

[[worker.precache]]
url = "manifest.webmanifest"
revision = "aeeebccd"
"#,
        )
        .unwrap();

        assert_eq!(
            config.worker.precache,
            vec![
                PrecacheEntry::new("assets/app.js", None),
                PrecacheEntry::new("manifest.webmanifest", Some("aeeebccd")),
            ]
        );
        assert_eq!(config.worker.network_timeout(), Duration::from_secs(3));
    }

    #[test]
    fn test_rejects_relative_route() {
        let err = Config::from_toml_str(
            r#"
[shell]
routes = ["map"]
"#,
        )
        .unwrap_err();
        assert!(matches!(err, ConfigError::Invalid(_)));
    }

    #[test]
    fn test_rejects_zero_interval() {
        let err = Config::from_toml_str(
            r#"
[connectivity]
poll_interval_ms = 0
"#,
        )
        .unwrap_err();
        assert!(err.to_string().contains("poll_interval_ms"));
    }

    #[test]
    fn test_missing_file_uses_defaults() {
        let config = Config::load("/definitely/not/here/offline-shell.toml").unwrap();
        assert_eq!(config.shell.cache_name, "lv-pages");
    }
}
