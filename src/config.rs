//! Configuration management

use std::{env, path::Path, time::Duration};

use figment::{
    Figment,
    providers::{Env, Format, Serialized, Yaml},
};
use regex::Regex;
use serde::{Deserialize, Serialize};
use url::Url;

use crate::{Error, Result};

/// Main configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Environment files to load before processing config.
    /// Paths support ~ expansion. Loaded in order, later files override earlier.
    /// Variables are set into the process environment for `${VAR}` resolution.
    pub env_files: Vec<String>,
    /// Failsafe defaults shared by every dependency
    pub failsafe: FailsafeConfig,
    /// Downstream services
    pub services: ServicesConfig,
    /// LLM request defaults and limits
    pub llm: LlmConfig,
}

/// Failsafe configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct FailsafeConfig {
    /// Circuit breaker configuration
    pub circuit_breaker: CircuitBreakerConfig,
    /// Retry configuration
    pub retry: RetryConfig,
    /// Inbound rate limiting configuration
    pub rate_limit: RateLimitConfig,
}

/// Circuit breaker configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CircuitBreakerConfig {
    /// Enable circuit breaker
    pub enabled: bool,
    /// Consecutive failures before opening
    pub failure_threshold: u32,
    /// Minimum time open before a probe is allowed
    #[serde(with = "humantime_serde")]
    pub recovery_timeout: Duration,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            failure_threshold: 5,
            recovery_timeout: Duration::from_secs(60),
        }
    }
}

/// Retry configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryConfig {
    /// Enable retries
    pub enabled: bool,
    /// Retries after the first attempt
    pub max_retries: u32,
    /// Delay before the first retry; doubles for each later one
    #[serde(with = "humantime_serde")]
    pub base_delay: Duration,
    /// Upper bound for a single delay
    #[serde(with = "humantime_serde")]
    pub max_delay: Duration,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            max_retries: 3,
            base_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(60),
        }
    }
}

/// Rate limiting configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RateLimitConfig {
    /// Enable rate limiting
    pub enabled: bool,
    /// Requests per trailing minute per identity
    pub max_messages_per_minute: u32,
    /// Requests per trailing hour per identity
    pub max_messages_per_hour: u32,
    /// Requests per trailing day per identity
    pub max_messages_per_day: u32,
    /// How often idle identities are evicted
    #[serde(with = "humantime_serde")]
    pub cleanup_interval: Duration,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            max_messages_per_minute: 100,
            max_messages_per_hour: 1000,
            max_messages_per_day: 10_000,
            cleanup_interval: Duration::from_secs(5 * 60),
        }
    }
}

/// Downstream service endpoints
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServicesConfig {
    /// Auth service
    pub auth: DependencyConfig,
    /// Characters service
    pub characters: DependencyConfig,
    /// LLM service
    pub llm: DependencyConfig,
}

impl Default for ServicesConfig {
    fn default() -> Self {
        Self {
            auth: DependencyConfig::with_url("http://localhost:8001"),
            characters: DependencyConfig::with_url("http://localhost:8002"),
            llm: DependencyConfig::with_url("http://localhost:8000"),
        }
    }
}

impl ServicesConfig {
    fn iter_mut(&mut self) -> impl Iterator<Item = &mut DependencyConfig> {
        [&mut self.auth, &mut self.characters, &mut self.llm].into_iter()
    }

    fn iter(&self) -> impl Iterator<Item = (&'static str, &DependencyConfig)> {
        [
            ("auth", &self.auth),
            ("characters", &self.characters),
            ("llm", &self.llm),
        ]
        .into_iter()
    }
}

/// One downstream dependency
///
/// `base_url` has no shared default: each service's address comes from
/// [`ServicesConfig::default`] or from the user's config.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DependencyConfig {
    /// Base URL, `${VAR}` and `${VAR:-default}` are expanded
    pub base_url: String,
    /// Whole-request timeout
    #[serde(with = "humantime_serde", default = "default_request_timeout")]
    pub request_timeout: Duration,
    /// TCP connect timeout
    #[serde(with = "humantime_serde", default = "default_connect_timeout")]
    pub connect_timeout: Duration,
    /// Timeout for `/health` probes
    #[serde(with = "humantime_serde", default = "default_health_timeout")]
    pub health_timeout: Duration,
    /// Overrides `failsafe.circuit_breaker` for this dependency
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub circuit_breaker: Option<CircuitBreakerConfig>,
    /// Overrides `failsafe.retry` for this dependency
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub retry: Option<RetryConfig>,
}

fn default_request_timeout() -> Duration {
    Duration::from_secs(30)
}

fn default_connect_timeout() -> Duration {
    Duration::from_secs(10)
}

fn default_health_timeout() -> Duration {
    Duration::from_secs(5)
}

impl DependencyConfig {
    /// Defaults pointing at `base_url`
    #[must_use]
    pub fn with_url(base_url: &str) -> Self {
        Self {
            base_url: base_url.to_string(),
            request_timeout: default_request_timeout(),
            connect_timeout: default_connect_timeout(),
            health_timeout: default_health_timeout(),
            circuit_breaker: None,
            retry: None,
        }
    }

    /// Effective circuit breaker settings
    #[must_use]
    pub fn effective_circuit_breaker<'a>(
        &'a self,
        defaults: &'a FailsafeConfig,
    ) -> &'a CircuitBreakerConfig {
        self.circuit_breaker
            .as_ref()
            .unwrap_or(&defaults.circuit_breaker)
    }

    /// Effective retry settings
    #[must_use]
    pub fn effective_retry<'a>(&'a self, defaults: &'a FailsafeConfig) -> &'a RetryConfig {
        self.retry.as_ref().unwrap_or(&defaults.retry)
    }
}

/// LLM request defaults
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LlmConfig {
    /// Model used when a request names none
    pub default_model: String,
    /// Sampling temperature used when a request sets none
    pub default_temperature: f32,
    /// Token budget per request
    pub max_tokens_per_request: u32,
    /// Most messages accepted in one request
    pub max_messages: usize,
    /// In-flight requests allowed at once
    pub max_concurrent_requests: usize,
}

impl Default for LlmConfig {
    fn default() -> Self {
        Self {
            default_model: "google/gemma-3-12b".to_string(),
            default_temperature: 0.7,
            max_tokens_per_request: 2048,
            max_messages: 100,
            max_concurrent_requests: 10,
        }
    }
}

impl Config {
    /// Load configuration from file and environment
    ///
    /// # Errors
    ///
    /// Returns an error if the config file does not exist, cannot be parsed,
    /// or fails validation.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        // Seeding with the full defaults makes partial sections merge key by key
        let mut figment = Figment::from(Serialized::defaults(Self::default()));

        if let Some(p) = path {
            if !p.exists() {
                return Err(Error::Config(format!(
                    "Config file not found: {}",
                    p.display()
                )));
            }
            figment = figment.merge(Yaml::file(p));
        }

        figment = figment.merge(Env::prefixed("CHAT_RESILIENCE_").split("__"));

        let mut config: Self = figment
            .extract()
            .map_err(|e| Error::Config(e.to_string()))?;

        // Env files first so their variables are visible to expansion
        config.load_env_files();
        config.expand_env_vars()?;
        config.validate()?;

        Ok(config)
    }

    /// Load environment files into the process environment.
    /// Supports ~ expansion. Files that don't exist are silently skipped.
    fn load_env_files(&self) {
        for path_str in &self.env_files {
            let expanded = match (path_str.strip_prefix('~'), dirs::home_dir()) {
                (Some(rest), Some(home)) => format!("{}{rest}", home.display()),
                _ => path_str.clone(),
            };

            let path = Path::new(&expanded);
            if !path.exists() {
                tracing::debug!("Env file not found (skipped): {expanded}");
                continue;
            }
            match dotenvy::from_path(path) {
                Ok(()) => tracing::info!("Loaded env file: {expanded}"),
                Err(e) => tracing::warn!("Failed to load env file {expanded}: {e}"),
            }
        }
    }

    /// Expand ${VAR} and ${VAR:-default} patterns in service URLs
    fn expand_env_vars(&mut self) -> Result<()> {
        let re = Regex::new(r"\$\{([A-Za-z_][A-Za-z0-9_]*)(?::-([^}]*))?\}")
            .map_err(|e| Error::Internal(e.to_string()))?;

        for service in self.services.iter_mut() {
            service.base_url = expand_string(&re, &service.base_url);
        }
        Ok(())
    }

    /// Check invariants the failsafe layer relies on
    ///
    /// # Errors
    ///
    /// Returns [`Error::Config`] naming the first offending setting.
    pub fn validate(&self) -> Result<()> {
        check_breaker("failsafe.circuit_breaker", &self.failsafe.circuit_breaker)?;

        let rl = &self.failsafe.rate_limit;
        for (name, limit) in [
            ("max_messages_per_minute", rl.max_messages_per_minute),
            ("max_messages_per_hour", rl.max_messages_per_hour),
            ("max_messages_per_day", rl.max_messages_per_day),
        ] {
            if limit == 0 {
                return Err(Error::Config(format!(
                    "failsafe.rate_limit.{name} must be greater than 0"
                )));
            }
        }
        if rl.cleanup_interval.is_zero() {
            return Err(Error::Config(
                "failsafe.rate_limit.cleanup_interval must be non-zero".to_string(),
            ));
        }

        for (name, service) in self.services.iter() {
            Url::parse(&service.base_url).map_err(|e| {
                Error::Config(format!(
                    "services.{name}.base_url '{}' is not a valid URL: {e}",
                    service.base_url
                ))
            })?;
            if service.request_timeout.is_zero() {
                return Err(Error::Config(format!(
                    "services.{name}.request_timeout must be non-zero"
                )));
            }
            if let Some(cb) = &service.circuit_breaker {
                check_breaker(&format!("services.{name}.circuit_breaker"), cb)?;
            }
        }

        if self.llm.max_concurrent_requests == 0 {
            return Err(Error::Config(
                "llm.max_concurrent_requests must be greater than 0".to_string(),
            ));
        }
        if self.llm.max_messages == 0 {
            return Err(Error::Config(
                "llm.max_messages must be greater than 0".to_string(),
            ));
        }
        if !(0.0..=2.0).contains(&self.llm.default_temperature) {
            return Err(Error::Config(
                "llm.default_temperature must be between 0.0 and 2.0".to_string(),
            ));
        }

        Ok(())
    }
}

fn check_breaker(path: &str, config: &CircuitBreakerConfig) -> Result<()> {
    if config.failure_threshold == 0 {
        return Err(Error::Config(format!(
            "{path}.failure_threshold must be greater than 0"
        )));
    }
    Ok(())
}

/// Expand environment variables in a string
fn expand_string(re: &Regex, value: &str) -> String {
    re.replace_all(value, |caps: &regex::Captures| {
        let default = caps.get(2).map_or("", |m| m.as_str());
        env::var(&caps[1]).unwrap_or_else(|_| default.to_string())
    })
    .into_owned()
}

/// Duration serde accepting `"250ms"`, `"1.5s"`, `"5m"`, `"1h"` or bare (fractional) seconds
pub mod humantime_serde {
    use std::time::Duration;

    use serde::{self, Deserialize, Deserializer, Serializer, de::Error as _};

    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Raw {
        Secs(u64),
        Float(f64),
        Text(String),
    }

    /// Serialize Duration to a human-readable string (e.g. "30s", "250ms")
    ///
    /// # Errors
    ///
    /// Returns a serialization error if the serializer fails.
    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        if duration.subsec_millis() == 0 {
            serializer.serialize_str(&format!("{}s", duration.as_secs()))
        } else {
            serializer.serialize_str(&format!("{}ms", duration.as_millis()))
        }
    }

    /// Deserialize a human-readable duration
    ///
    /// # Errors
    ///
    /// Returns a deserialization error if the value cannot be parsed as a duration.
    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        match Raw::deserialize(deserializer)? {
            Raw::Secs(secs) => Ok(Duration::from_secs(secs)),
            Raw::Float(secs) => from_secs_f64(secs, &secs.to_string()).map_err(D::Error::custom),
            Raw::Text(s) => parse(&s).map_err(D::Error::custom),
        }
    }

    /// Parse a duration string
    ///
    /// # Errors
    ///
    /// Returns a message describing why `s` is not a duration.
    pub fn parse(s: &str) -> Result<Duration, String> {
        let s = s.trim();
        // "ms" must be tried before "m" and "s"
        let (digits, unit_ms) = if let Some(v) = s.strip_suffix("ms") {
            (v.trim(), 1_u32)
        } else if let Some(v) = s.strip_suffix('s') {
            (v.trim(), 1_000)
        } else if let Some(v) = s.strip_suffix('m') {
            (v.trim(), 60_000)
        } else if let Some(v) = s.strip_suffix('h') {
            (v.trim(), 3_600_000)
        } else {
            (s, 1_000)
        };

        if let Ok(n) = digits.parse::<u64>() {
            return n
                .checked_mul(u64::from(unit_ms))
                .map(Duration::from_millis)
                .ok_or_else(|| format!("duration '{s}' is out of range"));
        }
        let n: f64 = digits
            .parse()
            .map_err(|e| format!("invalid duration '{s}': {e}"))?;
        from_secs_f64(n * f64::from(unit_ms) / 1_000.0, s)
    }

    fn from_secs_f64(secs: f64, original: &str) -> Result<Duration, String> {
        Duration::try_from_secs_f64(secs)
            .map_err(|e| format!("invalid duration '{original}': {e}"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_defaults_match_observed_values() {
        let config = Config::default();
        assert_eq!(config.failsafe.circuit_breaker.failure_threshold, 5);
        assert_eq!(
            config.failsafe.circuit_breaker.recovery_timeout,
            Duration::from_secs(60)
        );
        assert_eq!(config.failsafe.retry.max_retries, 3);
        assert_eq!(config.failsafe.retry.base_delay, Duration::from_secs(1));
        assert_eq!(config.failsafe.rate_limit.max_messages_per_minute, 100);
        assert_eq!(config.failsafe.rate_limit.max_messages_per_hour, 1000);
        assert_eq!(config.failsafe.rate_limit.max_messages_per_day, 10_000);
        assert_eq!(config.services.auth.base_url, "http://localhost:8001");
        assert_eq!(config.services.llm.request_timeout, Duration::from_secs(30));
        assert_eq!(config.services.llm.health_timeout, Duration::from_secs(5));
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_duration_parsing() {
        use humantime_serde::parse;
        assert_eq!(parse("250ms").unwrap(), Duration::from_millis(250));
        assert_eq!(parse("30s").unwrap(), Duration::from_secs(30));
        assert_eq!(parse("5m").unwrap(), Duration::from_secs(300));
        assert_eq!(parse("1h").unwrap(), Duration::from_secs(3600));
        assert_eq!(parse("45").unwrap(), Duration::from_secs(45));
        assert_eq!(parse("1.5s").unwrap(), Duration::from_millis(1500));
        assert_eq!(parse("0.25").unwrap(), Duration::from_millis(250));
        assert_eq!(parse("0.5m").unwrap(), Duration::from_secs(30));
        assert!(parse("soon").is_err());
        assert!(parse("").is_err());
        assert!(parse("-1s").is_err());
    }

    #[test]
    fn test_fractional_seconds_in_yaml() {
        let yaml = "failsafe:\n  retry:\n    base_delay: 0.5\n    max_delay: \"1.5s\"\n  circuit_breaker:\n    recovery_timeout: \"0.25\"\n";
        let config: Config = serde_yaml::from_str(yaml).unwrap();
        assert_eq!(config.failsafe.retry.base_delay, Duration::from_millis(500));
        assert_eq!(config.failsafe.retry.max_delay, Duration::from_millis(1500));
        assert_eq!(
            config.failsafe.circuit_breaker.recovery_timeout,
            Duration::from_millis(250)
        );
    }

    #[test]
    fn test_partial_service_override_keeps_its_own_url() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("resilience.yaml");
        std::fs::write(
            &path,
            "services:\n  auth:\n    request_timeout: 5s\n  llm:\n    retry:\n      max_retries: 1\n",
        )
        .unwrap();

        let config = Config::load(Some(&path)).unwrap();
        assert_eq!(config.services.auth.base_url, "http://localhost:8001");
        assert_eq!(config.services.auth.request_timeout, Duration::from_secs(5));
        assert_eq!(config.services.auth.connect_timeout, Duration::from_secs(10));
        assert_eq!(config.services.characters.base_url, "http://localhost:8002");
        assert_eq!(config.services.llm.base_url, "http://localhost:8000");
        assert_eq!(
            config.services.llm.effective_retry(&config.failsafe).max_retries,
            1
        );
    }

    #[test]
    fn test_partial_service_section_without_url_is_rejected_by_serde() {
        let err = serde_yaml::from_str::<Config>("services:\n  auth:\n    request_timeout: 5s\n")
            .unwrap_err();
        assert!(err.to_string().contains("base_url"));
    }

    #[test]
    fn test_yaml_overrides() {
        let yaml = r#"
failsafe:
  circuit_breaker:
    failure_threshold: 3
    recovery_timeout: 500ms
  retry:
    base_delay: 2
  rate_limit:
    max_messages_per_minute: 60
services:
  llm:
    base_url: "http://llm:9000"
    retry:
      enabled: false
"#;
        let config: Config = serde_yaml::from_str(yaml).unwrap();
        assert_eq!(config.failsafe.circuit_breaker.failure_threshold, 3);
        assert_eq!(
            config.failsafe.circuit_breaker.recovery_timeout,
            Duration::from_millis(500)
        );
        assert_eq!(config.failsafe.retry.base_delay, Duration::from_secs(2));
        assert_eq!(config.failsafe.rate_limit.max_messages_per_minute, 60);
        assert_eq!(config.failsafe.rate_limit.max_messages_per_hour, 1000);
        assert_eq!(config.services.llm.base_url, "http://llm:9000");
        assert_eq!(config.services.auth.base_url, "http://localhost:8001");

        let llm_retry = config.services.llm.effective_retry(&config.failsafe);
        assert!(!llm_retry.enabled);
        assert!(config.services.auth.effective_retry(&config.failsafe).enabled);
    }

    #[test]
    fn test_load_from_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("resilience.yaml");
        std::fs::write(
            &path,
            "services:\n  characters:\n    base_url: \"${CHAT_RES_TEST_UNSET_HOST:-http://characters:8002}\"\n",
        )
        .unwrap();

        let config = Config::load(Some(&path)).unwrap();
        assert_eq!(config.services.characters.base_url, "http://characters:8002");
    }

    #[test]
    fn test_load_missing_file() {
        let err = Config::load(Some(Path::new("/nonexistent/resilience.yaml"))).unwrap_err();
        assert!(matches!(err, Error::Config(_)));
    }

    #[test]
    fn test_env_file_feeds_expansion() {
        let dir = tempfile::tempdir().unwrap();
        let env_path = dir.path().join("test.env");
        let mut f = std::fs::File::create(&env_path).unwrap();
        writeln!(f, "CHAT_RES_TEST_AUTH_URL=http://auth.internal:8001").unwrap();
        drop(f);

        let mut config = Config {
            env_files: vec![env_path.to_string_lossy().to_string()],
            ..Default::default()
        };
        config.services.auth.base_url = "${CHAT_RES_TEST_AUTH_URL}".to_string();

        config.load_env_files();
        config.expand_env_vars().unwrap();
        assert_eq!(config.services.auth.base_url, "http://auth.internal:8001");
    }

    #[test]
    fn test_load_env_files_skips_missing() {
        let config = Config {
            env_files: vec!["/nonexistent/path/.env".to_string()],
            ..Default::default()
        };
        config.load_env_files();
    }

    #[test]
    fn test_validation_rejects_zero_limits() {
        let mut config = Config::default();
        config.failsafe.rate_limit.max_messages_per_hour = 0;
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("max_messages_per_hour"));

        let mut config = Config::default();
        config.failsafe.circuit_breaker.failure_threshold = 0;
        assert!(config.validate().is_err());

        let mut config = Config::default();
        config.services.llm.circuit_breaker = Some(CircuitBreakerConfig {
            failure_threshold: 0,
            ..CircuitBreakerConfig::default()
        });
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("services.llm.circuit_breaker"));
    }

    #[test]
    fn test_validation_rejects_bad_url() {
        let mut config = Config::default();
        config.services.characters.base_url = "not a url".to_string();
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("services.characters.base_url"));
    }

    #[test]
    fn test_serialized_durations_round_trip_through_yaml() {
        let mut config = Config::default();
        config.failsafe.circuit_breaker.recovery_timeout = Duration::from_millis(1500);
        let yaml = serde_yaml::to_string(&config).unwrap();
        assert!(yaml.contains("recovery_timeout: 1500ms"));
        assert!(yaml.contains("base_delay: 1s"));

        let back: Config = serde_yaml::from_str(&yaml).unwrap();
        assert_eq!(
            back.failsafe.circuit_breaker.recovery_timeout,
            Duration::from_millis(1500)
        );
    }
}
