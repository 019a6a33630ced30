//! Offline shell configuration

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use url::Url;

use crate::error::{ConfigError, ConfigResult};

/// Fixed origin-root path of the worker script.
pub const DEFAULT_SCRIPT_PATH: &str = "/service-worker.js";

/// Top-level configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct CasaConfig {
    /// Worker build settings (cache version, shell manifest, fetch rules)
    pub worker: WorkerConfig,

    /// Page-side monitor settings
    pub page: PageConfig,

    /// HTTP client settings
    pub network: NetworkConfig,

    /// Logging settings
    pub log: LogSettings,
}

/// Settings baked into a worker build.
///
/// Two builds with different `version` values own different caches.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct WorkerConfig {
    /// Origin the worker serves
    pub origin: Url,

    /// Cache name prefix
    pub cache_prefix: String,

    /// Version tag; change it whenever the shell manifest changes
    pub version: String,

    /// Shell asset paths, resolved against `origin`
    pub shell_assets: Vec<String>,

    /// URL patterns the fetch interceptor leaves alone
    pub excluded_patterns: Vec<ExcludedPattern>,

    /// Treat opaque (status 0) responses as cacheable
    pub cache_opaque_responses: bool,

    /// Activate right after install even when an older worker is active
    pub skip_waiting_on_install: bool,
}

/// A URL pattern excluded from interception.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "match", content = "value", rename_all = "snake_case")]
pub enum ExcludedPattern {
    Exact(String),
    Prefix(String),
    Suffix(String),
    Contains(String),
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct PageConfig {
    /// Worker script path registered on page load
    pub script_path: String,

    /// Registration update poll interval in seconds
    pub update_check_interval_secs: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct NetworkConfig {
    /// User agent string
    pub user_agent: String,

    /// Per-request timeout in seconds
    pub timeout_secs: u64,

    /// Maximum redirects
    pub max_redirects: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct LogSettings {
    /// Level name (error, warn, info, debug, trace)
    pub level: String,

    /// Output format (pretty, compact, json)
    pub format: String,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            origin: Url::parse("http://localhost:3000/").expect("static origin is valid"),
            cache_prefix: "casa-cache".to_string(),
            version: "v1".to_string(),
            shell_assets: vec![
                "/".to_string(),
                "/index.html".to_string(),
                "/manifest.json".to_string(),
                "/favicon.ico".to_string(),
            ],
            excluded_patterns: default_exclusions(),
            cache_opaque_responses: true,
            skip_waiting_on_install: false,
        }
    }
}

impl Default for PageConfig {
    fn default() -> Self {
        Self {
            script_path: DEFAULT_SCRIPT_PATH.to_string(),
            update_check_interval_secs: 300, // 5 minutes
        }
    }
}

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            user_agent: format!("Casa/{}", env!("CARGO_PKG_VERSION")),
            timeout_secs: 30,
            max_redirects: 10,
        }
    }
}

impl Default for LogSettings {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            format: "pretty".to_string(),
        }
    }
}

/// Browser tooling and extension schemes.
fn default_exclusions() -> Vec<ExcludedPattern> {
    [
        "chrome-extension:",
        "moz-extension:",
        "safari-extension:",
        "safari-web-extension:",
        "devtools:",
        "about:",
    ]
    .into_iter()
    .map(|scheme| ExcludedPattern::Prefix(scheme.to_string()))
    .collect()
}

impl WorkerConfig {
    /// Name of the cache owned by this build.
    pub fn cache_name(&self) -> String {
        format!("{}-{}", self.cache_prefix, self.version)
    }

    /// Shell asset URLs resolved against the origin.
    pub fn shell_asset_urls(&self) -> ConfigResult<Vec<Url>> {
        self.shell_assets
            .iter()
            .map(|path| self.origin.join(path).map_err(ConfigError::from))
            .collect()
    }

    /// Resolve a path or absolute URL against the origin.
    pub fn resolve(&self, path: &str) -> ConfigResult<Url> {
        Ok(self.origin.join(path)?)
    }

    pub fn validate(&self) -> ConfigResult<()> {
        if self.version.trim().is_empty() {
            return Err(ConfigError::invalid("worker.version must not be empty"));
        }
        if self.cache_prefix.trim().is_empty() {
            return Err(ConfigError::invalid("worker.cache_prefix must not be empty"));
        }
        if !matches!(self.origin.scheme(), "http" | "https") {
            return Err(ConfigError::invalid(format!(
                "worker.origin must be http(s), got '{}'",
                self.origin
            )));
        }
        self.shell_asset_urls()?;
        Ok(())
    }
}

impl CasaConfig {
    /// Default config file location (`<config dir>/casa/config.json`).
    pub fn default_path() -> Option<PathBuf> {
        dirs::config_dir().map(|dir| dir.join("casa").join("config.json"))
    }

    /// Load from a JSON file, apply environment overrides, validate.
    pub fn load(path: &Path) -> ConfigResult<Self> {
        let mut config = Self::from_file(path)?;
        config.apply_env()?;
        config.validate()?;
        Ok(config)
    }

    /// Parse and validate `path` as written, without environment overrides.
    pub fn from_file(path: &Path) -> ConfigResult<Self> {
        let contents = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        let config: CasaConfig =
            serde_json::from_str(&contents).map_err(|source| ConfigError::Parse {
                path: path.to_path_buf(),
                source,
            })?;
        config.validate()?;
        Ok(config)
    }

    /// Load `path` if given, else the default location if it exists, else defaults.
    pub fn load_or_default(path: Option<&Path>) -> ConfigResult<Self> {
        if let Some(path) = path {
            return Self::load(path);
        }
        match Self::default_path() {
            Some(path) if path.exists() => Self::load(&path),
            _ => {
                let mut config = Self::default();
                config.apply_env()?;
                config.validate()?;
                Ok(config)
            }
        }
    }

    /// Apply `CASA_ORIGIN` and `CASA_CACHE_VERSION` overrides.
    pub fn apply_env(&mut self) -> ConfigResult<()> {
        self.apply_overrides(
            std::env::var("CASA_ORIGIN").ok(),
            std::env::var("CASA_CACHE_VERSION").ok(),
        )
    }

    fn apply_overrides(
        &mut self,
        origin: Option<String>,
        version: Option<String>,
    ) -> ConfigResult<()> {
        if let Some(origin) = origin {
            self.worker.origin = Url::parse(&origin)?;
        }
        if let Some(version) = version {
            self.worker.version = version;
        }
        Ok(())
    }

    pub fn validate(&self) -> ConfigResult<()> {
        self.worker.validate()?;
        if self.page.update_check_interval_secs == 0 {
            return Err(ConfigError::invalid(
                "page.update_check_interval_secs must be positive",
            ));
        }
        if !self.page.script_path.starts_with('/') {
            return Err(ConfigError::invalid(
                "page.script_path must be an origin-root path",
            ));
        }
        Ok(())
    }

    /// Absolute URL of the worker script.
    pub fn script_url(&self) -> ConfigResult<Url> {
        self.worker.resolve(&self.page.script_path)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::NamedTempFile;

    #[test]
    fn test_defaults() {
        let config = CasaConfig::default();
        assert_eq!(config.worker.cache_name(), "casa-cache-v1");
        assert_eq!(config.page.script_path, "/service-worker.js");
        assert_eq!(config.page.update_check_interval_secs, 300);
        assert!(config.worker.cache_opaque_responses);
        assert!(!config.worker.skip_waiting_on_install);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_shell_asset_urls_resolve_against_origin() {
        let mut worker = WorkerConfig::default();
        worker.origin = Url::parse("https://casas.example/").unwrap();
        let urls = worker.shell_asset_urls().unwrap();
        let urls: Vec<&str> = urls.iter().map(|u| u.as_str()).collect();
        assert_eq!(
            urls,
            vec![
                "https://casas.example/",
                "https://casas.example/index.html",
                "https://casas.example/manifest.json",
                "https://casas.example/favicon.ico",
            ]
        );
    }

    #[test]
    fn test_load_partial_file() {
        let mut file = NamedTempFile::new().unwrap();
        write!(
            file,
            r#"{{
                "worker": {{
                    "origin": "https://casas.example/",
                    "version": "v7",
                    "excluded_patterns": [{{"match": "contains", "value": "/api/"}}]
                }},
                "page": {{ "update_check_interval_secs": 60 }}
            }}"#
        )
        .unwrap();

        let config = CasaConfig::load(file.path()).unwrap();
        assert_eq!(config.worker.version, "v7");
        assert_eq!(config.worker.cache_prefix, "casa-cache");
        assert_eq!(
            config.worker.excluded_patterns,
            vec![ExcludedPattern::Contains("/api/".to_string())]
        );
        assert_eq!(config.page.update_check_interval_secs, 60);
        assert_eq!(config.page.script_path, DEFAULT_SCRIPT_PATH);
        assert_eq!(
            config.script_url().unwrap().as_str(),
            "https://casas.example/service-worker.js"
        );
    }

    #[test]
    fn test_load_rejects_bad_json() {
        let mut file = NamedTempFile::new().unwrap();
        write!(file, "{{ not json").unwrap();
        assert!(matches!(
            CasaConfig::load(file.path()),
            Err(ConfigError::Parse { .. })
        ));
    }

    #[test]
    fn test_load_missing_file() {
        let dir = tempfile::tempdir().unwrap();
        let missing = dir.path().join("nope.json");
        assert!(matches!(
            CasaConfig::load(&missing),
            Err(ConfigError::Read { .. })
        ));
    }

    #[test]
    fn test_validate_rejects_empty_version() {
        let mut config = CasaConfig::default();
        config.worker.version = "  ".to_string();
        assert!(matches!(config.validate(), Err(ConfigError::Invalid(_))));
    }

    #[test]
    fn test_validate_rejects_zero_interval() {
        let mut config = CasaConfig::default();
        config.page.update_check_interval_secs = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_validate_rejects_non_http_origin() {
        let mut config = CasaConfig::default();
        config.worker.origin = Url::parse("ftp://casas.example/").unwrap();
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_overrides() {
        let mut config = CasaConfig::default();
        config
            .apply_overrides(
                Some("https://staging.casas.example/".to_string()),
                Some("v9".to_string()),
            )
            .unwrap();
        assert_eq!(config.worker.origin.as_str(), "https://staging.casas.example/");
        assert_eq!(config.worker.cache_name(), "casa-cache-v9");

        assert!(config
            .apply_overrides(Some("not a url".to_string()), None)
            .is_err());
    }

    #[test]
    fn test_excluded_pattern_serde_shape() {
        let json = serde_json::to_string(&ExcludedPattern::Prefix("devtools:".into())).unwrap();
        assert_eq!(json, r#"{"match":"prefix","value":"devtools:"}"#);

        let exact: ExcludedPattern =
            serde_json::from_str(r#"{"match":"exact","value":"https://casas.example/robots.txt"}"#)
                .unwrap();
        assert_eq!(
            exact,
            ExcludedPattern::Exact("https://casas.example/robots.txt".into())
        );
    }
}
