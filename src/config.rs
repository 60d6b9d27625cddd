use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fs;
use std::path::Path;
use std::time::Duration;
use tracing::{debug, info};

/// Top-level service configuration, read from a JSON file with env overrides.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub csrf: CsrfConfig,
    pub rate_limits: RateLimitConfig,
    pub breaker: BreakerConfig,
    pub pool: PoolConfig,
    pub cache: CacheConfig,
    pub batch: BatchConfig,
    pub translation: TranslationConfig,
    pub sidecar: SidecarConfig,
    pub auth: AuthConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CsrfConfig {
    /// Cookie readable by client-side fetch helpers
    pub cookie_name: String,
    /// HTTP-only cookie carrying an HMAC of the token
    pub meta_cookie_name: String,
    pub header_name: String,
    pub form_field: String,
    pub token_ttl_secs: u64,
    pub rotation_interval_secs: u64,
    pub grace_period_secs: u64,
    /// Path prefixes that skip validation entirely
    pub exempt_paths: Vec<String>,
    /// Require the meta cookie on unsafe requests
    pub hardened: bool,
    pub secure_cookies: bool,
}

impl Default for CsrfConfig {
    fn default() -> Self {
        Self {
            cookie_name: "csrf_token".to_string(),
            meta_cookie_name: "csrf_meta".to_string(),
            header_name: "x-csrf-token".to_string(),
            form_field: "csrf_token".to_string(),
            token_ttl_secs: 24 * 60 * 60,
            rotation_interval_secs: 60 * 60,
            grace_period_secs: 5 * 60,
            exempt_paths: vec!["/health".to_string(), "/api/webhooks/".to_string()],
            hardened: true,
            secure_cookies: true,
        }
    }
}

impl CsrfConfig {
    pub fn token_ttl(&self) -> Duration {
        Duration::from_secs(self.token_ttl_secs)
    }

    pub fn rotation_interval(&self) -> Duration {
        Duration::from_secs(self.rotation_interval_secs)
    }

    pub fn grace_period(&self) -> Duration {
        Duration::from_secs(self.grace_period_secs)
    }
}

/// One named limiter profile.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RateLimitProfile {
    pub window_secs: u64,
    pub max_requests: usize,
}

impl RateLimitProfile {
    pub const fn new(window_secs: u64, max_requests: usize) -> Self {
        Self {
            window_secs,
            max_requests,
        }
    }

    pub fn window(&self) -> Duration {
        Duration::from_secs(self.window_secs)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RateLimitConfig {
    /// Upper bound on tracked identifiers per profile
    pub capacity: usize,
    pub profiles: HashMap<String, RateLimitProfile>,
}

pub const PROFILE_AUTH: &str = "auth";
pub const PROFILE_TRANSLATION: &str = "translation";
pub const PROFILE_UPLOAD: &str = "upload";
pub const PROFILE_API: &str = "api";

impl Default for RateLimitConfig {
    fn default() -> Self {
        let profiles = HashMap::from([
            (PROFILE_AUTH.to_string(), RateLimitProfile::new(15 * 60, 5)),
            (PROFILE_TRANSLATION.to_string(), RateLimitProfile::new(60, 10)),
            (PROFILE_UPLOAD.to_string(), RateLimitProfile::new(60, 5)),
            (PROFILE_API.to_string(), RateLimitProfile::new(60, 60)),
        ]);
        Self {
            capacity: 10_000,
            profiles,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BreakerConfig {
    pub failure_threshold: u32,
    pub open_timeout_secs: u64,
    pub probe_timeout_secs: u64,
}

impl Default for BreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            open_timeout_secs: 60,
            probe_timeout_secs: 30,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PoolConfig {
    /// Max concurrent in-flight calls per named resource
    pub limits: HashMap<String, usize>,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            limits: HashMap::from([("llm".to_string(), 4), ("sidecar".to_string(), 2)]),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
    pub l1_capacity: usize,
    pub l2_capacity: usize,
    pub default_ttl_secs: u64,
    /// L2 keeps entries this many times longer than L1
    pub l2_ttl_multiplier: u32,
    pub dedup_ttl_ms: u64,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            l1_capacity: 1_000,
            l2_capacity: 10_000,
            default_ttl_secs: 60 * 60,
            l2_ttl_multiplier: 4,
            dedup_ttl_ms: 100,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BatchConfig {
    pub max_batch_size: usize,
    pub max_wait_ms: u64,
}

impl Default for BatchConfig {
    fn default() -> Self {
        Self {
            max_batch_size: 20,
            max_wait_ms: 50,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TranslationConfig {
    pub api_url: String,
    pub model: String,
    #[serde(skip_serializing)]
    pub api_key: Option<String>,
    pub max_tokens: u32,
    pub timeout_secs: u64,
    pub default_language: String,
}

impl Default for TranslationConfig {
    fn default() -> Self {
        Self {
            api_url: "https://api.anthropic.com".to_string(),
            model: "claude-3-haiku-20240307".to_string(),
            api_key: None,
            max_tokens: 4096,
            timeout_secs: 60,
            default_language: "ja".to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SidecarConfig {
    pub interpreter: String,
    pub extract_script: String,
    pub apply_script: String,
    pub work_dir: String,
    pub timeout_secs: u64,
    pub max_upload_bytes: usize,
    /// Finished jobs, their output and uploads are deleted after this long
    pub retention_secs: u64,
    pub sweep_interval_secs: u64,
}

impl Default for SidecarConfig {
    fn default() -> Self {
        Self {
            interpreter: "python3".to_string(),
            extract_script: "scripts/extract_text.py".to_string(),
            apply_script: "scripts/apply_translations.py".to_string(),
            work_dir: "data".to_string(),
            timeout_secs: 120,
            max_upload_bytes: 50 * 1024 * 1024,
            retention_secs: 60 * 60,
            sweep_interval_secs: 5 * 60,
        }
    }
}

impl SidecarConfig {
    pub fn retention(&self) -> Duration {
        Duration::from_secs(self.retention_secs)
    }

    pub fn sweep_interval(&self) -> Duration {
        Duration::from_secs(self.sweep_interval_secs)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AuthConfig {
    /// Name of the single active provider
    pub provider: String,
    pub session_cookie: String,
    /// Sessions unused for this long are dropped
    pub session_idle_secs: u64,
}

impl Default for AuthConfig {
    fn default() -> Self {
        Self {
            provider: "local".to_string(),
            session_cookie: "slidegate_session".to_string(),
            session_idle_secs: 24 * 60 * 60,
        }
    }
}

impl AuthConfig {
    pub fn session_idle(&self) -> Duration {
        Duration::from_secs(self.session_idle_secs)
    }
}

impl Config {
    pub fn from_file(path: &str) -> Result<Self> {
        let raw = fs::read_to_string(path).context("reading config file")?;
        let cfg: Config = serde_json::from_str(&raw).context("parsing config JSON")?;
        Ok(cfg.with_env_overrides())
    }

    /// Like `from_file`, but a missing file yields the defaults.
    pub fn load(path: &str) -> Result<Self> {
        if Path::new(path).exists() {
            let cfg = Self::from_file(path)?;
            debug!(path, "loaded config file");
            Ok(cfg)
        } else {
            info!(path, "config file not found, using defaults");
            Ok(Self::default().with_env_overrides())
        }
    }

    pub fn with_env_overrides(mut self) -> Self {
        if let Ok(v) = std::env::var("SLIDEGATE_COOKIE_SECURE") {
            self.csrf.secure_cookies = matches!(v.as_str(), "1" | "true" | "yes");
        }
        if let Some(secs) = std::env::var("SLIDEGATE_ROTATION_SECS")
            .ok()
            .and_then(|v| v.parse::<u64>().ok())
        {
            self.csrf.rotation_interval_secs = secs;
        }
        if let Ok(key) = std::env::var("ANTHROPIC_API_KEY") {
            if !key.is_empty() {
                self.translation.api_key = Some(key);
            }
        }
        if let Ok(provider) = std::env::var("SLIDEGATE_AUTH_PROVIDER") {
            self.auth.provider = provider;
        }
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::NamedTempFile;

    #[test]
    fn test_config_parsing_partial_file() {
        let mut file = NamedTempFile::new().unwrap();
        writeln!(
            file,
            r#"{{
                "csrf": {{"grace_period_secs": 30, "hardened": false}},
                "rate_limits": {{"capacity": 50, "profiles": {{"upload": {{"window_secs": 10, "max_requests": 2}}}}}},
                "batch": {{"max_batch_size": 3}}
            }}"#
        )
        .unwrap();

        let config = Config::from_file(file.path().to_str().unwrap()).unwrap();
        assert_eq!(config.csrf.grace_period_secs, 30);
        assert!(!config.csrf.hardened);
        assert_eq!(config.csrf.cookie_name, "csrf_token");
        assert_eq!(config.rate_limits.capacity, 50);
        assert_eq!(
            config.rate_limits.profiles.get("upload"),
            Some(&RateLimitProfile::new(10, 2))
        );
        assert_eq!(config.batch.max_batch_size, 3);
        assert_eq!(config.batch.max_wait_ms, 50);
    }

    #[test]
    fn test_default_retention_settings() {
        let config = Config::default();
        assert_eq!(config.auth.session_idle(), Duration::from_secs(24 * 60 * 60));
        assert!(config.sidecar.sweep_interval() < config.sidecar.retention());
        assert_eq!(
            config.rate_limits.profiles.get(PROFILE_AUTH),
            Some(&RateLimitProfile::new(15 * 60, 5))
        );
    }

    #[test]
    fn test_config_missing_file() {
        let result = Config::from_file("/nonexistent/path/config.json");
        assert!(result.is_err());
        assert!(Config::load("/nonexistent/path/config.json").is_ok());
    }

    #[test]
    fn test_config_invalid_json() {
        let mut file = NamedTempFile::new().unwrap();
        writeln!(file, "{{invalid json").unwrap();

        let result = Config::from_file(file.path().to_str().unwrap());
        assert!(result.is_err());
    }
}
