//! Configuration loading for Keystone.
//!
//! Configuration lives in `~/.keystone/config.toml` (or the file named by
//! `KEYSTONE_CONFIG`). Every field is optional; accessors resolve the
//! documented defaults so callers never handle `Option` themselves.
//!
//! ```toml
//! [fetch]
//! base_url = "https://${TENANT_HOST}/api/"
//! timeout_ms = 10000
//! max_retries = 3
//! retry_delay_ms = 1000
//! retry_on_transient_error = true
//!
//! [cache]
//! cache_time_ms = 300000
//! stale_time_ms = 0
//! refetch_on_focus = false
//!
//! [logging]
//! level = "info"
//! ```

use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;
use std::{env, fs};
use thiserror::Error;

/// Environment variable naming an explicit config file.
pub const CONFIG_PATH_ENV: &str = "KEYSTONE_CONFIG";
/// Overrides `[fetch] timeout_ms`.
pub const TIMEOUT_ENV: &str = "KEYSTONE_TIMEOUT_MS";
/// Overrides `[fetch] max_retries`.
pub const MAX_RETRIES_ENV: &str = "KEYSTONE_MAX_RETRIES";

// Default value function for serde (bool::default() is false, so only true needs a fn)
pub(crate) const fn default_true() -> bool {
    true
}

#[derive(Debug, Default, Deserialize)]
pub struct KeystoneConfig {
    pub fetch: Option<FetchConfig>,
    pub cache: Option<CacheConfig>,
    pub logging: Option<LoggingConfig>,
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config at {}: {source}", path.display())]
    Read {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("failed to parse config at {}: {source}", path.display())]
    Parse {
        path: PathBuf,
        source: toml::de::Error,
    },
}

impl ConfigError {
    pub fn path(&self) -> &PathBuf {
        match self {
            ConfigError::Read { path, .. } | ConfigError::Parse { path, .. } => path,
        }
    }
}

/// Network call defaults.
#[derive(Debug, Clone, Deserialize)]
pub struct FetchConfig {
    /// Prefix joined with relative request paths. `${VAR}` is expanded.
    pub base_url: Option<String>,
    /// Per-attempt timeout in milliseconds. Default: 10000.
    pub timeout_ms: Option<u64>,
    /// Retries after the first attempt. Default: 3.
    pub max_retries: Option<u32>,
    /// Base backoff delay in milliseconds, doubled per attempt. Default: 1000.
    pub retry_delay_ms: Option<u64>,
    /// Retry 5xx/408/429 responses and transport errors. Default: true.
    #[serde(default = "default_true")]
    pub retry_on_transient_error: bool,
    /// Upper bound for a single backoff wait. Default: unbounded.
    pub max_delay_ms: Option<u64>,
    /// Down-jitter fraction in [0, 1]. Default: 0 (exact exponential backoff).
    pub jitter_factor: Option<f64>,
}

impl Default for FetchConfig {
    fn default() -> Self {
        Self {
            base_url: None,
            timeout_ms: None,
            max_retries: None,
            retry_delay_ms: None,
            retry_on_transient_error: true,
            max_delay_ms: None,
            jitter_factor: None,
        }
    }
}

impl FetchConfig {
    pub const DEFAULT_TIMEOUT_MS: u64 = 10_000;
    pub const DEFAULT_MAX_RETRIES: u32 = 3;
    pub const DEFAULT_RETRY_DELAY_MS: u64 = 1_000;

    #[must_use]
    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms.unwrap_or(Self::DEFAULT_TIMEOUT_MS))
    }

    #[must_use]
    pub fn max_retries(&self) -> u32 {
        self.max_retries.unwrap_or(Self::DEFAULT_MAX_RETRIES)
    }

    #[must_use]
    pub fn retry_delay(&self) -> Duration {
        Duration::from_millis(self.retry_delay_ms.unwrap_or(Self::DEFAULT_RETRY_DELAY_MS))
    }

    #[must_use]
    pub fn max_delay(&self) -> Option<Duration> {
        self.max_delay_ms.map(Duration::from_millis)
    }

    #[must_use]
    pub fn jitter_factor(&self) -> f64 {
        self.jitter_factor
            .filter(|f| f.is_finite())
            .map_or(0.0, |f| f.clamp(0.0, 1.0))
    }

    #[must_use]
    pub fn base_url(&self) -> Option<String> {
        self.base_url
            .as_deref()
            .map(expand_env_vars)
            .filter(|url| !url.trim().is_empty())
    }
}

/// Shared result cache defaults.
#[derive(Debug, Clone, Deserialize)]
pub struct CacheConfig {
    /// Disable to bypass the shared cache entirely. Default: true.
    #[serde(default = "default_true")]
    pub enabled: bool,
    /// Entry lifetime in milliseconds. Default: 300000 (5 minutes).
    pub cache_time_ms: Option<u64>,
    /// Age after which a valid entry is stale. Default: 0 (staleness disabled).
    pub stale_time_ms: Option<u64>,
    /// Revalidate stale entries when a focus signal fires. Default: false.
    #[serde(default)]
    pub refetch_on_focus: bool,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            cache_time_ms: None,
            stale_time_ms: None,
            refetch_on_focus: false,
        }
    }
}

impl CacheConfig {
    pub const DEFAULT_CACHE_TIME_MS: u64 = 300_000;
    pub const DEFAULT_STALE_TIME_MS: u64 = 0;

    #[must_use]
    pub fn cache_time(&self) -> Duration {
        Duration::from_millis(self.cache_time_ms.unwrap_or(Self::DEFAULT_CACHE_TIME_MS))
    }

    #[must_use]
    pub fn stale_time(&self) -> Duration {
        Duration::from_millis(self.stale_time_ms.unwrap_or(Self::DEFAULT_STALE_TIME_MS))
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct LoggingConfig {
    /// `EnvFilter` directive used when `RUST_LOG` is unset. Default: "info".
    pub level: Option<String>,
}

impl LoggingConfig {
    pub const DEFAULT_LEVEL: &'static str = "info";

    #[must_use]
    pub fn level(&self) -> &str {
        self.level
            .as_deref()
            .map(str::trim)
            .filter(|level| !level.is_empty())
            .unwrap_or(Self::DEFAULT_LEVEL)
    }
}

pub fn expand_env_vars(value: &str) -> String {
    let mut out = String::with_capacity(value.len());
    let mut rest = value;

    while let Some(start) = rest.find("${") {
        let Some(end_rel) = rest[start + 2..].find('}') else {
            break;
        };
        out.push_str(&rest[..start]);
        let var = &rest[start + 2..start + 2 + end_rel];
        if !var.is_empty() {
            out.push_str(&env::var(var).unwrap_or_default());
        }
        rest = &rest[start + 2 + end_rel + 1..];
    }

    out.push_str(rest);
    out
}

impl KeystoneConfig {
    /// Load the user's config file and apply environment overrides.
    ///
    /// Returns `Ok(None)` when no config file exists.
    pub fn load() -> Result<Option<Self>, ConfigError> {
        let Some(path) = config_path() else {
            return Ok(None);
        };
        if !path.exists() {
            return Ok(None);
        }

        let mut config = Self::load_from(&path)?;
        config.apply_env_overrides(|name| env::var(name).ok());
        Ok(Some(config))
    }

    pub fn load_from(path: &Path) -> Result<Self, ConfigError> {
        let content = match fs::read_to_string(path) {
            Ok(content) => content,
            Err(err) => {
                tracing::warn!("Failed to read config at {:?}: {}", path, err);
                return Err(ConfigError::Read {
                    path: path.to_path_buf(),
                    source: err,
                });
            }
        };

        match toml::from_str(&content) {
            Ok(config) => Ok(config),
            Err(err) => {
                tracing::warn!("Failed to parse config at {:?}: {}", path, err);
                Err(ConfigError::Parse {
                    path: path.to_path_buf(),
                    source: err,
                })
            }
        }
    }

    /// Apply `KEYSTONE_*` overrides. Unparsable values are ignored with a warning.
    pub fn apply_env_overrides(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        if let Some(raw) = lookup(TIMEOUT_ENV) {
            match raw.trim().parse::<u64>() {
                Ok(ms) if ms > 0 => {
                    self.fetch.get_or_insert_with(FetchConfig::default).timeout_ms = Some(ms);
                }
                _ => tracing::warn!(var = TIMEOUT_ENV, value = %raw, "Ignoring invalid override"),
            }
        }

        if let Some(raw) = lookup(MAX_RETRIES_ENV) {
            match raw.trim().parse::<u32>() {
                Ok(retries) => {
                    self.fetch.get_or_insert_with(FetchConfig::default).max_retries = Some(retries);
                }
                Err(_) => {
                    tracing::warn!(var = MAX_RETRIES_ENV, value = %raw, "Ignoring invalid override");
                }
            }
        }
    }

    #[must_use]
    pub fn fetch_or_default(&self) -> FetchConfig {
        self.fetch.clone().unwrap_or_default()
    }

    #[must_use]
    pub fn cache_or_default(&self) -> CacheConfig {
        self.cache.clone().unwrap_or_default()
    }

    #[must_use]
    pub fn logging_or_default(&self) -> LoggingConfig {
        self.logging.clone().unwrap_or_default()
    }

    pub fn path() -> Option<PathBuf> {
        config_path()
    }
}

pub fn config_path() -> Option<PathBuf> {
    if let Some(explicit) = env::var_os(CONFIG_PATH_ENV).filter(|v| !v.is_empty()) {
        return Some(PathBuf::from(explicit));
    }
    dirs::home_dir().map(|home| home.join(".keystone").join("config.toml"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use std::io::Write;

    fn parse(content: &str) -> KeystoneConfig {
        toml::from_str(content).unwrap()
    }

    #[test]
    fn parse_empty_config() {
        let config = parse("");
        assert!(config.fetch.is_none());
        assert!(config.cache.is_none());
        assert!(config.logging.is_none());
    }

    #[test]
    fn fetch_defaults() {
        let fetch = FetchConfig::default();
        assert_eq!(fetch.timeout(), Duration::from_millis(10_000));
        assert_eq!(fetch.max_retries(), 3);
        assert_eq!(fetch.retry_delay(), Duration::from_millis(1_000));
        assert!(fetch.retry_on_transient_error);
        assert_eq!(fetch.max_delay(), None);
        assert!(fetch.jitter_factor().abs() < f64::EPSILON);
        assert!(fetch.base_url().is_none());
    }

    #[test]
    fn empty_fetch_section_keeps_retry_enabled() {
        let config = parse("[fetch]\n");
        assert!(config.fetch.unwrap().retry_on_transient_error);
    }

    #[test]
    fn parse_fetch_config() {
        let config = parse(
            r#"
            [fetch]
            base_url = "https://api.example.com/"
            timeout_ms = 2500
            max_retries = 1
            retry_delay_ms = 200
            retry_on_transient_error = false
            max_delay_ms = 5000
            jitter_factor = 0.25
            "#,
        );
        let fetch = config.fetch_or_default();
        assert_eq!(fetch.base_url().as_deref(), Some("https://api.example.com/"));
        assert_eq!(fetch.timeout(), Duration::from_millis(2500));
        assert_eq!(fetch.max_retries(), 1);
        assert_eq!(fetch.retry_delay(), Duration::from_millis(200));
        assert!(!fetch.retry_on_transient_error);
        assert_eq!(fetch.max_delay(), Some(Duration::from_millis(5000)));
        assert!((fetch.jitter_factor() - 0.25).abs() < f64::EPSILON);
    }

    #[test]
    fn jitter_factor_is_clamped() {
        let fetch = FetchConfig {
            jitter_factor: Some(4.0),
            ..Default::default()
        };
        assert!((fetch.jitter_factor() - 1.0).abs() < f64::EPSILON);

        let fetch = FetchConfig {
            jitter_factor: Some(f64::NAN),
            ..Default::default()
        };
        assert!(fetch.jitter_factor().abs() < f64::EPSILON);
    }

    #[test]
    fn parse_cache_config() {
        let config = parse(
            r"
            [cache]
            cache_time_ms = 1000
            stale_time_ms = 250
            refetch_on_focus = true
            ",
        );
        let cache = config.cache_or_default();
        assert!(cache.enabled);
        assert_eq!(cache.cache_time(), Duration::from_millis(1000));
        assert_eq!(cache.stale_time(), Duration::from_millis(250));
        assert!(cache.refetch_on_focus);
    }

    #[test]
    fn cache_defaults() {
        let cache = CacheConfig::default();
        assert!(cache.enabled);
        assert_eq!(cache.cache_time(), Duration::from_millis(300_000));
        assert_eq!(cache.stale_time(), Duration::ZERO);
        assert!(!cache.refetch_on_focus);
    }

    #[test]
    fn logging_level_defaults_to_info() {
        assert_eq!(LoggingConfig::default().level(), "info");
        let blank = LoggingConfig {
            level: Some("  ".to_string()),
        };
        assert_eq!(blank.level(), "info");
        let config = parse("[logging]\nlevel = \"keystone_fetch=debug\"\n");
        assert_eq!(config.logging_or_default().level(), "keystone_fetch=debug");
    }

    #[test]
    fn env_overrides_apply_to_missing_section() {
        let vars: HashMap<&str, &str> =
            HashMap::from([(TIMEOUT_ENV, "750"), (MAX_RETRIES_ENV, "0")]);
        let mut config = KeystoneConfig::default();
        config.apply_env_overrides(|name| vars.get(name).map(ToString::to_string));

        let fetch = config.fetch_or_default();
        assert_eq!(fetch.timeout(), Duration::from_millis(750));
        assert_eq!(fetch.max_retries(), 0);
    }

    #[test]
    fn invalid_env_overrides_are_ignored() {
        let vars: HashMap<&str, &str> =
            HashMap::from([(TIMEOUT_ENV, "soon"), (MAX_RETRIES_ENV, "-1")]);
        let mut config = parse("[fetch]\ntimeout_ms = 1234\n");
        config.apply_env_overrides(|name| vars.get(name).map(ToString::to_string));

        let fetch = config.fetch_or_default();
        assert_eq!(fetch.timeout(), Duration::from_millis(1234));
        assert_eq!(fetch.max_retries(), FetchConfig::DEFAULT_MAX_RETRIES);
    }

    #[test]
    fn load_from_reports_parse_errors_with_path() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "[fetch\nbroken").unwrap();

        let err = KeystoneConfig::load_from(file.path()).unwrap_err();
        assert!(matches!(err, ConfigError::Parse { .. }));
        assert_eq!(err.path(), file.path());
    }

    #[test]
    fn load_from_reports_missing_file() {
        let dir = tempfile::tempdir().unwrap();
        let missing = dir.path().join("absent.toml");
        let err = KeystoneConfig::load_from(&missing).unwrap_err();
        assert!(matches!(err, ConfigError::Read { .. }));
    }

    #[test]
    fn load_from_reads_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "[cache]\ncache_time_ms = 42").unwrap();

        let config = KeystoneConfig::load_from(file.path()).unwrap();
        assert_eq!(
            config.cache_or_default().cache_time(),
            Duration::from_millis(42)
        );
    }

    // expand_env_vars tests

    #[test]
    fn expand_env_vars_no_vars() {
        assert_eq!(expand_env_vars("hello world"), "hello world");
    }

    #[test]
    fn expand_env_vars_single_var() {
        unsafe {
            env::set_var("KEYSTONE_TEST_HOST", "tenant.example.com");
        }
        let result = expand_env_vars("https://${KEYSTONE_TEST_HOST}/api/");
        assert_eq!(result, "https://tenant.example.com/api/");
        unsafe {
            env::remove_var("KEYSTONE_TEST_HOST");
        }
    }

    #[test]
    fn expand_env_vars_missing_var_becomes_empty() {
        unsafe {
            env::remove_var("KEYSTONE_MISSING_VAR_FOR_TEST");
        }
        let result = expand_env_vars("before ${KEYSTONE_MISSING_VAR_FOR_TEST} after");
        assert_eq!(result, "before  after");
    }

    #[test]
    fn expand_env_vars_unclosed_brace_preserved() {
        assert_eq!(expand_env_vars("test ${UNCLOSED"), "test ${UNCLOSED");
    }

    #[test]
    fn expand_env_vars_empty_var_name_removed() {
        assert_eq!(expand_env_vars("test ${} more"), "test  more");
    }
}
