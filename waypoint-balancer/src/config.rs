//! Load balancer configuration.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use waypoint_core::{ConfigError, ConfigResult, ensure_positive, ensure_ratio};

/// Instance selection strategy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LoadBalancingStrategy {
    /// Rotate through available instances
    #[default]
    RoundRobin,
    /// Rotate in proportion to configured weights
    WeightedRoundRobin,
    /// Fewest active connections
    LeastConnections,
    /// Fewest active connections, ties to the higher effective weight
    WeightedLeastConnections,
    /// Uniform random pick
    Random,
    /// Random pick proportional to effective weight
    WeightedRandom,
    /// Hash ring keyed by the request context
    ConsistentHash,
    /// Hash of the client IP over the available instances
    IpHash,
    /// Healthy instances only, then a delegate strategy
    HealthBased,
    /// Biased toward instances with low recent latency and error rate
    Adaptive,
}

impl LoadBalancingStrategy {
    pub const ALL: [LoadBalancingStrategy; 10] = [
        Self::RoundRobin,
        Self::WeightedRoundRobin,
        Self::LeastConnections,
        Self::WeightedLeastConnections,
        Self::Random,
        Self::WeightedRandom,
        Self::ConsistentHash,
        Self::IpHash,
        Self::HealthBased,
        Self::Adaptive,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::RoundRobin => "round_robin",
            Self::WeightedRoundRobin => "weighted_round_robin",
            Self::LeastConnections => "least_connections",
            Self::WeightedLeastConnections => "weighted_least_connections",
            Self::Random => "random",
            Self::WeightedRandom => "weighted_random",
            Self::ConsistentHash => "consistent_hash",
            Self::IpHash => "ip_hash",
            Self::HealthBased => "health_based",
            Self::Adaptive => "adaptive",
        }
    }

    /// Whether selection depends on the request context.
    pub fn is_sticky(&self) -> bool {
        matches!(self, Self::ConsistentHash | Self::IpHash)
    }
}

impl fmt::Display for LoadBalancingStrategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for LoadBalancingStrategy {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let normalized = s.trim().to_ascii_lowercase().replace('-', "_");
        Self::ALL
            .into_iter()
            .find(|strategy| strategy.as_str() == normalized)
            .ok_or_else(|| {
                ConfigError::invalid(
                    "load_balancer.strategy",
                    format!("unknown strategy `{}`", s),
                )
            })
    }
}

/// Load balancer configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LoadBalancerConfig {
    pub strategy: LoadBalancingStrategy,
    /// Tried when the primary strategy yields nothing
    pub fallback_strategy: Option<LoadBalancingStrategy>,
    /// Ring positions per instance for consistent hashing
    pub virtual_nodes: usize,
    /// Strategy applied to the healthy subset by `HealthBased`
    pub health_based_delegate: LoadBalancingStrategy,
    /// Samples covered by the adaptive EWMA; alpha = 2 / (window + 1)
    pub adaptive_window: usize,
    /// Share of adaptive picks spread uniformly so no instance starves
    pub adaptive_exploration: f64,
}

impl Default for LoadBalancerConfig {
    fn default() -> Self {
        Self {
            strategy: LoadBalancingStrategy::RoundRobin,
            fallback_strategy: None,
            virtual_nodes: 150,
            health_based_delegate: LoadBalancingStrategy::RoundRobin,
            adaptive_window: 20,
            adaptive_exploration: 0.1,
        }
    }
}

impl LoadBalancerConfig {
    pub fn new(strategy: LoadBalancingStrategy) -> Self {
        Self {
            strategy,
            ..Default::default()
        }
    }

    pub fn with_fallback(mut self, strategy: LoadBalancingStrategy) -> Self {
        self.fallback_strategy = Some(strategy);
        self
    }

    pub fn with_virtual_nodes(mut self, nodes: usize) -> Self {
        self.virtual_nodes = nodes;
        self
    }

    pub fn with_health_based_delegate(mut self, strategy: LoadBalancingStrategy) -> Self {
        self.health_based_delegate = strategy;
        self
    }

    pub fn with_adaptive_window(mut self, window: usize) -> Self {
        self.adaptive_window = window;
        self
    }

    pub fn with_adaptive_exploration(mut self, exploration: f64) -> Self {
        self.adaptive_exploration = exploration;
        self
    }

    /// Smoothing factor derived from `adaptive_window`.
    pub fn adaptive_alpha(&self) -> f64 {
        2.0 / (self.adaptive_window as f64 + 1.0)
    }

    pub fn validate(&self) -> ConfigResult<()> {
        ensure_positive("load_balancer.virtual_nodes", self.virtual_nodes)?;
        ensure_positive("load_balancer.adaptive_window", self.adaptive_window)?;
        ensure_ratio("load_balancer.adaptive_exploration", self.adaptive_exploration)?;
        if self.health_based_delegate == LoadBalancingStrategy::HealthBased {
            return Err(ConfigError::invalid(
                "load_balancer.health_based_delegate",
                "cannot delegate to itself",
            ));
        }
        Ok(())
    }
}
