//! Service configuration.
//!
//! Read from a TOML file (every section optional) and then patched from the
//! environment:
//!
//! | Variable | Overrides |
//! |---|---|
//! | `DISPATCH_HOST` | `server.host` |
//! | `DISPATCH_PORT` | `server.port` |
//! | `DATABASE_URL` | switches `store` to postgres with this url |
//! | `DISTANCE_API_KEY` | `provider.api_key` (http provider only) |

use chrono::Duration;
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::path::Path;
use thiserror::Error;

use crate::cluster::ClusteringConfig;
use crate::coordinator::RetryConfig;
use crate::distance::cache::CacheConfig;
use crate::distance::provider::ProviderConfig;
use crate::domain::Coordinate;
use crate::lock::LockConfig;
use crate::sequencer::{SequencerConfig, MAX_ROUTE_STOPS};

/// Upper bound for every `*_ttl_secs` setting (ten years).
pub const MAX_TTL_SECS: u64 = 10 * 365 * 24 * 3600;

/// Converts a TTL setting to a duration, clamped to [`MAX_TTL_SECS`].
pub fn ttl_duration(secs: u64) -> Duration {
    Duration::seconds(secs.min(MAX_TTL_SECS) as i64)
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("cannot read config file: {0}")]
    Io(#[from] std::io::Error),
    #[error("invalid config file: {0}")]
    Parse(#[from] toml::de::Error),
    #[error("invalid configuration: {0}")]
    Validation(String),
}

/// Top-level configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct DispatchConfig {
    pub server: ServerConfig,
    pub store: StoreConfig,
    pub locks: LockConfig,
    pub clustering: ClusteringConfig,
    pub sequencer: SequencerConfig,
    pub cache: CacheConfig,
    pub provider: ProviderConfig,
    pub retry: RetryConfig,
    /// Fallback route origin when the courier location is unknown.
    pub depot: Option<Coordinate>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: 7860,
        }
    }
}

/// Order store backend.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "backend", rename_all = "snake_case")]
pub enum StoreConfig {
    /// Single-process store; `seed_demo` loads the demo dataset at startup.
    Memory {
        #[serde(default)]
        seed_demo: bool,
    },
    Postgres {
        url: String,
        #[serde(default = "default_max_connections")]
        max_connections: u32,
    },
}

fn default_max_connections() -> u32 {
    10
}

impl Default for StoreConfig {
    fn default() -> Self {
        StoreConfig::Memory { seed_demo: true }
    }
}

impl DispatchConfig {
    /// Loads configuration from `path` (or defaults when `None`), applies
    /// environment overrides and validates the result.
    pub fn load(path: Option<&Path>) -> Result<Self, ConfigError> {
        let mut config = match path {
            Some(path) => Self::from_toml_str(&std::fs::read_to_string(path)?)?,
            None => Self::default(),
        };
        config.apply_overrides(|key| std::env::var(key).ok());
        config.validate()?;
        Ok(config)
    }

    pub fn from_toml_str(raw: &str) -> Result<Self, ConfigError> {
        Ok(toml::from_str(raw)?)
    }

    /// Applies overrides from `lookup`, which maps a variable name to its value.
    pub fn apply_overrides<F>(&mut self, lookup: F)
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(host) = lookup("DISPATCH_HOST") {
            self.server.host = host;
        }
        if let Some(port) = lookup("DISPATCH_PORT").and_then(|p| p.parse().ok()) {
            self.server.port = port;
        }
        if let Some(url) = lookup("DATABASE_URL") {
            let max_connections = match &self.store {
                StoreConfig::Postgres {
                    max_connections, ..
                } => *max_connections,
                StoreConfig::Memory { .. } => default_max_connections(),
            };
            self.store = StoreConfig::Postgres {
                url,
                max_connections,
            };
        }
        if let Some(key) = lookup("DISTANCE_API_KEY") {
            if let ProviderConfig::Http { api_key, .. } = &mut self.provider {
                *api_key = Some(key);
            }
        }
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        let invalid = |msg: &str| Err(ConfigError::Validation(msg.to_string()));

        let ttls = [
            ("locks.max_ttl_secs", self.locks.max_ttl_secs),
            ("cache.distance_ttl_secs", self.cache.distance_ttl_secs),
            ("cache.geocode_ttl_secs", self.cache.geocode_ttl_secs),
            ("cache.negative_geocode_ttl_secs", self.cache.negative_geocode_ttl_secs),
            ("clustering.planning_ttl_secs", self.clustering.planning_ttl_secs),
        ];
        for (name, secs) in ttls {
            if secs == 0 || secs > MAX_TTL_SECS {
                return Err(ConfigError::Validation(format!(
                    "{} must be in 1..={}",
                    name, MAX_TTL_SECS
                )));
            }
        }

        let locks = &self.locks;
        if locks.min_ttl_secs == 0 || locks.min_ttl_secs > locks.max_ttl_secs {
            return invalid("locks.min_ttl_secs must be in 1..=locks.max_ttl_secs");
        }
        if !(locks.min_ttl_secs..=locks.max_ttl_secs).contains(&locks.default_ttl_secs) {
            return invalid("locks.default_ttl_secs must lie between min and max ttl");
        }
        if locks.max_batch_size == 0 || locks.max_batch_size > MAX_ROUTE_STOPS {
            return Err(ConfigError::Validation(format!(
                "locks.max_batch_size must be in 1..={}",
                MAX_ROUTE_STOPS
            )));
        }
        let group_size = self.clustering.default_max_group_size;
        if group_size == 0 || group_size > MAX_ROUTE_STOPS {
            return Err(ConfigError::Validation(format!(
                "clustering.default_max_group_size must be in 1..={}",
                MAX_ROUTE_STOPS
            )));
        }
        if !(self.clustering.road_factor >= 1.0) || !(self.clustering.average_speed_kmph > 0.0) {
            return invalid("clustering.road_factor must be >= 1 and average_speed_kmph > 0");
        }
        if self.sequencer.lookup_concurrency == 0 {
            return invalid("sequencer.lookup_concurrency must be positive");
        }
        if self.cache.precision > 7 {
            return invalid("cache.precision must be at most 7 decimal places");
        }
        if self.retry.max_attempts == 0 {
            return invalid("retry.max_attempts must be positive");
        }
        if let Some(depot) = &self.depot {
            if !depot.is_valid() {
                return invalid("depot must be a valid coordinate");
            }
        }
        if let StoreConfig::Postgres { url, .. } = &self.store {
            if url.is_empty() {
                return invalid("store.url must not be empty");
            }
        }
        Ok(())
    }

    pub fn socket_addr(&self) -> Result<SocketAddr, ConfigError> {
        format!("{}:{}", self.server.host, self.server.port)
            .parse()
            .map_err(|e| ConfigError::Validation(format!("invalid listen address: {}", e)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use std::io::Write;

    #[test]
    fn test_defaults_are_valid() {
        let config = DispatchConfig::default();
        config.validate().unwrap();
        assert_eq!(config.locks.default_ttl_secs, 30);
        assert!(matches!(config.store, StoreConfig::Memory { seed_demo: true }));
        assert_eq!(config.socket_addr().unwrap().port(), 7860);
    }

    #[test]
    fn test_partial_toml_keeps_other_defaults() {
        let config = DispatchConfig::from_toml_str(
            r#"
            depot = { lat = 25.04, lng = 121.53 }

            [server]
            port = 9000

            [store]
            backend = "postgres"
            url = "postgres://localhost/dispatch"

            [locks]
            default_ttl_secs = 45
            "#,
        )
        .unwrap();

        assert_eq!(config.server.port, 9000);
        assert_eq!(config.server.host, "0.0.0.0");
        assert_eq!(config.locks.default_ttl_secs, 45);
        assert_eq!(config.locks.max_ttl_secs, 300);
        assert!(matches!(
            config.store,
            StoreConfig::Postgres { max_connections: 10, .. }
        ));
        assert_eq!(config.depot, Some(Coordinate::new(25.04, 121.53)));
        config.validate().unwrap();
    }

    #[test]
    fn test_example_file_parses() {
        let config = DispatchConfig::from_toml_str(include_str!("../dispatch.example.toml")).unwrap();
        config.validate().unwrap();
        assert_eq!(config.clustering.default_max_group_size, 8);
        assert!(matches!(config.provider, ProviderConfig::Haversine));
    }

    #[test]
    fn test_overrides() {
        let env: HashMap<&str, &str> = [
            ("DISPATCH_PORT", "8088"),
            ("DATABASE_URL", "postgres://db/dispatch"),
            ("DISTANCE_API_KEY", "secret"),
        ]
        .into_iter()
        .collect();

        let mut config = DispatchConfig::from_toml_str(
            r#"
            [provider]
            kind = "http"
            base_url = "https://maps.example.com/maps/api"
            "#,
        )
        .unwrap();
        config.apply_overrides(|k| env.get(k).map(|v| v.to_string()));

        assert_eq!(config.server.port, 8088);
        assert!(matches!(&config.store, StoreConfig::Postgres { url, .. } if url == "postgres://db/dispatch"));
        assert!(matches!(
            &config.provider,
            ProviderConfig::Http { api_key: Some(k), .. } if k == "secret"
        ));
    }

    #[test]
    fn test_validation_rejects_inverted_ttl_bounds() {
        let mut config = DispatchConfig::default();
        config.locks.min_ttl_secs = 600;
        assert!(matches!(config.validate(), Err(ConfigError::Validation(_))));

        let mut config = DispatchConfig::default();
        config.depot = Some(Coordinate::new(123.0, 0.0));
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_validation_bounds_ttls_and_sizes() {
        let mut config = DispatchConfig::default();
        config.cache.distance_ttl_secs = u64::MAX;
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("cache.distance_ttl_secs"));

        let mut config = DispatchConfig::default();
        config.locks.max_ttl_secs = u64::MAX;
        assert!(config.validate().is_err());

        let mut config = DispatchConfig::default();
        config.clustering.planning_ttl_secs = 0;
        assert!(config.validate().is_err());

        let mut config = DispatchConfig::default();
        config.clustering.default_max_group_size = MAX_ROUTE_STOPS + 1;
        assert!(config.validate().is_err());

        let mut config = DispatchConfig::default();
        config.locks.max_batch_size = MAX_ROUTE_STOPS + 1;
        assert!(config.validate().is_err());

        assert_eq!(ttl_duration(u64::MAX), Duration::seconds(MAX_TTL_SECS as i64));
        assert_eq!(ttl_duration(30), Duration::seconds(30));
    }

    #[test]
    fn test_load_from_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "[cache]\nprecision = 3").unwrap();
        let config = DispatchConfig::load(Some(file.path())).unwrap();
        assert_eq!(config.cache.precision, 3);

        let missing = DispatchConfig::load(Some(Path::new("/nonexistent/dispatch.toml")));
        assert!(matches!(missing, Err(ConfigError::Io(_))));
    }
}
