//! Membership configuration

use serde::{Deserialize, Serialize};

use crate::cluster::EvictionPolicy;
use crate::error::{MembershipError, MembershipResult};

/// Discovery protocol configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct DiscoveryConfig {
    /// Interval between discovery broadcasts in milliseconds
    pub discovery_period_ms: u64,
    /// Time to wait for a connection attempt to become live in milliseconds
    pub connection_timeout_ms: u64,
    /// Time since discovery start before a group may be formed in milliseconds
    pub group_formation_period_ms: u64,
    /// Interval between cleanups of unreachable peers in milliseconds
    pub cleanup_period_ms: u64,
    /// Names of the well-known entry point nodes
    pub entry_points: Vec<String>,
}

impl Default for DiscoveryConfig {
    fn default() -> Self {
        Self {
            discovery_period_ms: 500,
            connection_timeout_ms: 5000,       // 5 seconds
            group_formation_period_ms: 3000,   // 3 seconds
            cleanup_period_ms: 60000,          // 1 minute
            entry_points: Vec::new(),
        }
    }
}

/// Group membership tracker configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct TrackerConfig {
    /// Interval between tracking decisions in milliseconds
    pub track_period_ms: u64,
}

impl Default for TrackerConfig {
    fn default() -> Self {
        Self {
            track_period_ms: 500,
        }
    }
}

/// Cluster membership dissemination configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ClusterMembershipConfig {
    /// Minimum interval between dissemination rounds in milliseconds
    pub dissemination_period_ms: u64,
    /// Which members leave an over-provisioned group first
    pub eviction_policy: EvictionPolicy,
}

impl Default for ClusterMembershipConfig {
    fn default() -> Self {
        Self {
            dissemination_period_ms: 100,
            eviction_policy: EvictionPolicy::default(),
        }
    }
}

/// Group router configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RouterConfig {
    /// Grace delay before a removed group's substack is torn down in milliseconds
    pub removal_delay_ms: u64,
}

impl Default for RouterConfig {
    fn default() -> Self {
        Self {
            removal_delay_ms: 10000, // 10 seconds
        }
    }
}

/// Configuration of one membership stack
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct MembershipConfig {
    /// Discovery
    pub discovery: DiscoveryConfig,
    /// Group membership tracker
    pub tracker: TrackerConfig,
    /// Cluster membership dissemination
    pub cluster: ClusterMembershipConfig,
    /// Group router
    pub router: RouterConfig,
    /// Interval of the compartment timer in milliseconds
    pub tick_interval_ms: u64,
}

impl Default for MembershipConfig {
    fn default() -> Self {
        Self {
            discovery: DiscoveryConfig::default(),
            tracker: TrackerConfig::default(),
            cluster: ClusterMembershipConfig::default(),
            router: RouterConfig::default(),
            tick_interval_ms: 50,
        }
    }
}

impl MembershipConfig {
    /// Parse a TOML document; missing fields take their defaults
    pub fn from_toml_str(document: &str) -> MembershipResult<Self> {
        let config: Self = toml::from_str(document)?;
        config.validate()?;
        Ok(config)
    }

    /// Reject configurations that would stall the protocols
    pub fn validate(&self) -> MembershipResult<()> {
        let periods = [
            ("discovery.discovery_period_ms", self.discovery.discovery_period_ms),
            ("discovery.connection_timeout_ms", self.discovery.connection_timeout_ms),
            ("discovery.cleanup_period_ms", self.discovery.cleanup_period_ms),
            ("tracker.track_period_ms", self.tracker.track_period_ms),
            ("cluster.dissemination_period_ms", self.cluster.dissemination_period_ms),
            ("tick_interval_ms", self.tick_interval_ms),
        ];

        for (name, value) in periods {
            if value == 0 {
                return Err(MembershipError::Configuration(format!(
                    "{name} must be greater than zero"
                )));
            }
        }

        if self
            .discovery
            .entry_points
            .iter()
            .any(|entry_point| entry_point.trim().is_empty())
        {
            return Err(MembershipError::Configuration(
                "discovery.entry_points must not contain empty names".to_string(),
            ));
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_are_valid() {
        assert!(MembershipConfig::default().validate().is_ok());
    }

    #[test]
    fn test_partial_toml_uses_defaults() {
        let config = MembershipConfig::from_toml_str(
            r#"
            tick_interval_ms = 20

            [discovery]
            entry_points = ["core-1:7000", "core-2:7000"]
            group_formation_period_ms = 100

            [cluster]
            eviction_policy = "oldest_first"
            "#,
        )
        .unwrap();

        assert_eq!(config.tick_interval_ms, 20);
        assert_eq!(config.discovery.entry_points.len(), 2);
        assert_eq!(config.discovery.group_formation_period_ms, 100);
        assert_eq!(config.discovery.discovery_period_ms, 500);
        assert_eq!(config.cluster.eviction_policy, EvictionPolicy::OldestFirst);
        assert_eq!(config.router, RouterConfig::default());
    }

    #[test]
    fn test_zero_period_is_rejected() {
        let result = MembershipConfig::from_toml_str("[tracker]\ntrack_period_ms = 0\n");
        assert!(matches!(result, Err(MembershipError::Configuration(_))));
    }

    #[test]
    fn test_malformed_toml_is_rejected() {
        let result = MembershipConfig::from_toml_str("tick_interval_ms = \"fast\"");
        assert!(matches!(result, Err(MembershipError::Configuration(_))));
    }
}
