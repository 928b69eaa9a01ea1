//! Configuration management
//!
//! Loaded once at startup from an optional YAML file merged with
//! `OPS_GUARD_`-prefixed environment variables. Guard behavior is fully
//! determined by these values plus request history.

use std::{collections::HashMap, path::Path, time::Duration};

use figment::{
    Figment,
    providers::{Env, Format, Yaml},
};
use serde::{Deserialize, Serialize};

use crate::guard::Dependency;
use crate::{Error, Result};

/// Main configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Server configuration
    pub server: ServerConfig,
    /// Circuit breaker configuration (applied per dependency)
    pub circuit_breaker: CircuitBreakerConfig,
    /// Rate limiting configuration
    pub rate_limit: RateLimitConfig,
    /// Kill switch configuration
    pub kill_switches: KillSwitchConfig,
    /// Endpoint path → ordered dependency list. Unmapped endpoints get no
    /// circuit-breaker checks.
    #[serde(default = "default_dependencies")]
    pub dependencies: HashMap<String, Vec<Dependency>>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            server: ServerConfig::default(),
            circuit_breaker: CircuitBreakerConfig::default(),
            rate_limit: RateLimitConfig::default(),
            kill_switches: KillSwitchConfig::default(),
            dependencies: default_dependencies(),
        }
    }
}

impl Config {
    /// Load configuration from file and environment
    ///
    /// # Errors
    ///
    /// Returns an error if the config file does not exist or cannot be parsed.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut figment = Figment::new();

        if let Some(p) = path {
            if !p.exists() {
                return Err(Error::Config(format!(
                    "Config file not found: {}",
                    p.display()
                )));
            }
            figment = figment.merge(Yaml::file(p));
        }

        // Merge environment variables (OPS_GUARD_ prefix)
        figment = figment.merge(Env::prefixed("OPS_GUARD_").split("__"));

        let config: Self = figment
            .extract()
            .map_err(|e| Error::Config(e.to_string()))?;

        config.validate()?;
        Ok(config)
    }

    /// Reject configurations that would make guard behavior undefined.
    fn validate(&self) -> Result<()> {
        if self.circuit_breaker.min_samples == 0 {
            return Err(Error::Config(
                "circuit_breaker.min_samples must be at least 1".to_string(),
            ));
        }
        if self.circuit_breaker.half_open_max_requests == 0 {
            return Err(Error::Config(
                "circuit_breaker.half_open_max_requests must be at least 1".to_string(),
            ));
        }
        if !(0.0..=100.0).contains(&self.circuit_breaker.error_threshold_pct) {
            return Err(Error::Config(
                "circuit_breaker.error_threshold_pct must be within 0..=100".to_string(),
            ));
        }
        if self.rate_limit.window.is_zero() {
            return Err(Error::Config(
                "rate_limit.window must be non-zero".to_string(),
            ));
        }
        Ok(())
    }
}

/// Default endpoint → dependency mapping for the invoice admin API.
fn default_dependencies() -> HashMap<String, Vec<Dependency>> {
    HashMap::from([
        (
            "/admin/import/invoices".to_string(),
            vec![
                Dependency::DbPrimary,
                Dependency::ImportWorker,
                Dependency::ExternalApi,
            ],
        ),
        (
            "/admin/invoices".to_string(),
            vec![Dependency::DbReplica, Dependency::Cache],
        ),
        (
            "/admin/offers".to_string(),
            vec![Dependency::DbPrimary, Dependency::Cache],
        ),
        (
            "/admin/offers/pdf".to_string(),
            vec![Dependency::DbReplica, Dependency::ExternalApi],
        ),
    ])
}

/// Server configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// Host to bind to
    pub host: String,
    /// Port to listen on
    pub port: u16,
    /// Graceful shutdown timeout
    #[serde(with = "humantime_serde")]
    pub shutdown_timeout: Duration,
    /// Paths that bypass the guard chain entirely
    pub public_paths: Vec<String>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 39500,
            shutdown_timeout: Duration::from_secs(30),
            public_paths: vec!["/health".to_string(), "/metrics".to_string()],
        }
    }
}

/// Circuit breaker configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CircuitBreakerConfig {
    /// Failure rate (percent) at or above which the breaker opens
    pub error_threshold_pct: f64,
    /// Minimum samples inside the rolling window before the rate is evaluated.
    /// Below this the breaker stays closed regardless of the local failure
    /// rate, so a cold start cannot flap it open.
    pub min_samples: usize,
    /// Rolling sample window; samples older than this are evicted before the
    /// rate is computed
    #[serde(with = "humantime_serde")]
    pub window: Duration,
    /// Time to stay open before probing recovery
    #[serde(with = "humantime_serde")]
    pub open_duration: Duration,
    /// Probe budget while half-open; also the number of consecutive successes
    /// required to close
    pub half_open_max_requests: u32,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            error_threshold_pct: 50.0,
            min_samples: 10,
            window: Duration::from_secs(60),
            open_duration: Duration::from_secs(30),
            half_open_max_requests: 3,
        }
    }
}

/// Rate limiting configuration
///
/// Limits are per fixed window, keyed by endpoint class. A limit of zero is a
/// misconfiguration and surfaces as an internal guard error, which
/// `fail_closed` turns into a denial.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RateLimitConfig {
    /// Fixed window length
    #[serde(with = "humantime_serde")]
    pub window: Duration,
    /// Requests per window for import endpoints
    pub import_limit: u32,
    /// Requests per window for heavy read endpoints
    pub heavy_read_limit: u32,
    /// Requests per window for everything else
    pub default_limit: u32,
    /// Deny (rather than allow) when the rate limiter itself errors
    pub fail_closed: bool,
    /// Path prefixes classified as import endpoints
    pub import_prefixes: Vec<String>,
    /// Path prefixes classified as heavy read endpoints
    pub heavy_read_prefixes: Vec<String>,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            window: Duration::from_secs(60),
            import_limit: 10,
            heavy_read_limit: 60,
            default_limit: 120,
            fail_closed: true,
            import_prefixes: vec!["/admin/import".to_string()],
            heavy_read_prefixes: vec!["/admin/invoices".to_string(), "/admin/offers".to_string()],
        }
    }
}

/// Kill switch configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct KillSwitchConfig {
    /// Initial switch states applied at startup
    pub initial: HashMap<String, bool>,
}

impl Default for KillSwitchConfig {
    fn default() -> Self {
        Self {
            initial: HashMap::from([
                ("global_import".to_string(), false),
                ("degrade_mode".to_string(), false),
            ]),
        }
    }
}

#[cfg(test)]
mod tests {
    use std::io::Write;

    use pretty_assertions::assert_eq;

    use super::*;

    #[test]
    fn default_config_is_valid() {
        let config = Config::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.server.port, 39500);
        assert_eq!(config.rate_limit.import_limit, 10);
        assert!((config.circuit_breaker.error_threshold_pct - 50.0).abs() < f64::EPSILON);
    }

    #[test]
    fn default_dependency_map_covers_import_endpoint() {
        let config = Config::default();
        assert!(
            !config.dependencies.is_empty(),
            "default-built config must carry the endpoint dependency map"
        );
        let deps = &config.dependencies["/admin/import/invoices"];
        assert_eq!(deps[0], Dependency::DbPrimary);
        assert!(deps.contains(&Dependency::ImportWorker));
    }

    #[test]
    fn default_and_deserialized_dependency_maps_agree() {
        // An empty YAML document and a default-built config must describe the
        // same guarded surface, or embedders silently lose breaker checks.
        let from_yaml: Config = serde_json::from_str("{}").expect("empty config");
        let built = Config::default();
        assert_eq!(
            from_yaml.dependencies.keys().collect::<std::collections::BTreeSet<_>>(),
            built.dependencies.keys().collect::<std::collections::BTreeSet<_>>()
        );
    }

    #[test]
    fn missing_config_file_is_an_error() {
        let err = Config::load(Some(Path::new("/nonexistent/guard.yaml"))).unwrap_err();
        assert!(err.to_string().contains("not found"));
    }

    #[test]
    fn yaml_file_overrides_defaults() {
        let mut file = tempfile::Builder::new()
            .suffix(".yaml")
            .tempfile()
            .expect("tempfile");
        writeln!(
            file,
            "server:\n  port: 4711\nrate_limit:\n  import_limit: 3\n  fail_closed: false\n"
        )
        .expect("write yaml");

        let config = Config::load(Some(file.path())).expect("load");
        assert_eq!(config.server.port, 4711);
        assert_eq!(config.rate_limit.import_limit, 3);
        assert!(!config.rate_limit.fail_closed);
        // Untouched sections keep their defaults
        assert_eq!(config.rate_limit.default_limit, 120);
    }

    #[test]
    fn zero_min_samples_is_rejected() {
        let mut config = Config::default();
        config.circuit_breaker.min_samples = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn out_of_range_threshold_is_rejected() {
        let mut config = Config::default();
        config.circuit_breaker.error_threshold_pct = 140.0;
        assert!(config.validate().is_err());
    }
}
