//! Resolver configuration: files, environment and `.env` overlays.

use std::fs;
use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use waypoint_balancer::{LoadBalancerConfig, LoadBalancingStrategy};
use waypoint_breaker::CircuitBreakerConfig;
use waypoint_cache::{CacheConfig, CacheStrategy};
use waypoint_core::{ConfigError, ConfigResult, duration_ms};

/// Default prefix of the environment overlay.
pub const ENV_PREFIX: &str = "WAYPOINT";

/// Everything a [`ResolutionCoordinator`](crate::ResolutionCoordinator) needs.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ResolverConfig {
    pub cache: CacheConfig,
    /// Defaults for the registry and per-instance breakers
    pub circuit_breaker: CircuitBreakerConfig,
    /// Guard registry lookups with a `registry:{service}` breaker
    pub registry_breaker_enabled: bool,
    /// Skip instances whose `{service}:{instance_id}` breaker is open
    pub instance_breakers_enabled: bool,
    /// Without a balancer, resolution picks randomly, preferring the local
    /// zone and region
    pub load_balancer: Option<LoadBalancerConfig>,
    #[serde(with = "duration_ms")]
    pub registry_timeout: Duration,
    pub local_zone: Option<String>,
    pub local_region: Option<String>,
}

impl Default for ResolverConfig {
    fn default() -> Self {
        Self {
            cache: CacheConfig::default(),
            circuit_breaker: CircuitBreakerConfig::default(),
            registry_breaker_enabled: true,
            instance_breakers_enabled: true,
            load_balancer: Some(LoadBalancerConfig::default()),
            registry_timeout: Duration::from_secs(5),
            local_zone: None,
            local_region: None,
        }
    }
}

impl ResolverConfig {
    pub fn validate(&self) -> ConfigResult<()> {
        self.cache.validate()?;
        self.circuit_breaker.validate()?;
        if let Some(lb) = &self.load_balancer {
            lb.validate()?;
        }
        if self.registry_timeout.is_zero() {
            return Err(ConfigError::invalid(
                "resolver.registry_timeout",
                "must be greater than zero",
            ));
        }
        Ok(())
    }

    /// Overlay `{prefix}_*` variables from the process environment, after
    /// loading a `.env` file from the working directory if there is one.
    pub fn apply_env(&mut self, prefix: &str) -> ConfigResult<()> {
        dotenvy::dotenv().ok();
        self.apply_env_from(prefix, |key| std::env::var(key).ok())
    }

    /// Overlay `{prefix}_*` entries of a `.env` file without touching the
    /// process environment.
    pub fn apply_env_file(&mut self, prefix: &str, path: impl AsRef<Path>) -> ConfigResult<()> {
        let iter = dotenvy::from_path_iter(path.as_ref())
            .map_err(|e| ConfigError::parse(format!("failed to read env file: {}", e)))?;
        let mut vars = Vec::new();
        for item in iter {
            let (key, value) =
                item.map_err(|e| ConfigError::parse(format!("invalid env file entry: {}", e)))?;
            vars.push((key, value));
        }
        self.apply_env_from(prefix, |key| {
            vars.iter().find(|(k, _)| k == key).map(|(_, v)| v.clone())
        })
    }

    /// Overlay variables supplied by `lookup`.
    ///
    /// Recognized keys: `{prefix}_CACHE_STRATEGY`, `{prefix}_CACHE_TTL_MS`,
    /// `{prefix}_CACHE_MAX_SIZE`, `{prefix}_LB_STRATEGY` (`none` disables the
    /// balancer) and `{prefix}_REGISTRY_TIMEOUT_MS`.
    pub fn apply_env_from<F>(&mut self, prefix: &str, lookup: F) -> ConfigResult<()>
    where
        F: Fn(&str) -> Option<String>,
    {
        let var = |name: &str| lookup(&format!("{}_{}", prefix, name));

        if let Some(value) = var("CACHE_STRATEGY") {
            self.cache.strategy = value.parse::<CacheStrategy>()?;
        }
        if let Some(value) = var("CACHE_TTL_MS") {
            self.cache.ttl = Duration::from_millis(parse_number("CACHE_TTL_MS", &value)?);
        }
        if let Some(value) = var("CACHE_MAX_SIZE") {
            self.cache.max_size = parse_number("CACHE_MAX_SIZE", &value)? as usize;
        }
        if let Some(value) = var("LB_STRATEGY") {
            if value.trim().eq_ignore_ascii_case("none") {
                self.load_balancer = None;
            } else {
                let strategy = value.parse::<LoadBalancingStrategy>()?;
                self.load_balancer
                    .get_or_insert_with(LoadBalancerConfig::default)
                    .strategy = strategy;
            }
        }
        if let Some(value) = var("REGISTRY_TIMEOUT_MS") {
            self.registry_timeout =
                Duration::from_millis(parse_number("REGISTRY_TIMEOUT_MS", &value)?);
        }
        self.validate()
    }
}

fn parse_number(name: &str, value: &str) -> ConfigResult<u64> {
    value
        .trim()
        .parse::<u64>()
        .map_err(|e| ConfigError::parse(format!("{}: `{}` is not a number ({})", name, value, e)))
}

/// Supported configuration file formats
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FileFormat {
    Json,
    Toml,
}

impl FileFormat {
    pub fn from_extension(ext: &str) -> Option<Self> {
        match ext.to_lowercase().as_str() {
            "json" => Some(FileFormat::Json),
            "toml" => Some(FileFormat::Toml),
            _ => None,
        }
    }
}

/// Reads a [`ResolverConfig`] from a file.
#[derive(Debug, Clone, Copy)]
pub struct ConfigLoader {
    format: FileFormat,
}

impl ConfigLoader {
    pub fn new(format: FileFormat) -> Self {
        Self { format }
    }

    /// Detect the format from the file extension.
    pub fn auto(path: impl AsRef<Path>) -> ConfigResult<Self> {
        let path = path.as_ref();
        let ext = path
            .extension()
            .and_then(|s| s.to_str())
            .ok_or_else(|| ConfigError::parse(format!("no file extension on {}", path.display())))?;
        let format = FileFormat::from_extension(ext)
            .ok_or_else(|| ConfigError::parse(format!("unsupported format: {}", ext)))?;
        Ok(Self::new(format))
    }

    /// Load and validate the file at `path`.
    pub fn load_file(&self, path: impl AsRef<Path>) -> ConfigResult<ResolverConfig> {
        let content = fs::read_to_string(path)?;
        self.parse(&content)
    }

    pub fn parse(&self, content: &str) -> ConfigResult<ResolverConfig> {
        let config: ResolverConfig = match self.format {
            FileFormat::Json => serde_json::from_str(content)
                .map_err(|e| ConfigError::parse(format!("JSON parse error: {}", e)))?,
            FileFormat::Toml => toml::from_str(content)
                .map_err(|e| ConfigError::parse(format!("TOML parse error: {}", e)))?,
        };
        config.validate()?;
        Ok(config)
    }

    /// Load `path` with the detected format.
    pub fn load(path: impl AsRef<Path>) -> ConfigResult<ResolverConfig> {
        let path = path.as_ref();
        Self::auto(path)?.load_file(path)
    }
}
