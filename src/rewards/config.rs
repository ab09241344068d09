use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::Path;

use crate::rewards::exemption::ExemptionPolicy;
use crate::rewards::storage;

/// Main rewards configuration
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct RewardsConfig {
    /// Children profiles
    pub children: Vec<ChildProfile>,

    /// Point accrual settings
    #[serde(default)]
    pub points: PointsConfig,

    /// Redemption settings
    #[serde(default)]
    pub redemption: RedemptionConfig,

    /// What happens when a redemption arrives while a window is active
    #[serde(default)]
    pub exemption_policy: ExemptionPolicy,

    /// Pairing-code rate limits
    #[serde(default)]
    pub pairing: PairingLimits,
}

impl RewardsConfig {
    pub fn child(&self, child_id: &str) -> Option<&ChildProfile> {
        self.children.iter().find(|c| c.id == child_id)
    }
}

/// A child known to the system
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ChildProfile {
    /// Unique identifier
    pub id: String,

    /// Display name
    pub name: String,

    /// Apps whose usage earns points
    #[serde(default)]
    pub learning_apps: Vec<String>,

    /// Apps unlocked by an earned-time window
    #[serde(default)]
    pub reward_apps: Vec<String>,
}

/// How usage time converts into points. Immutable value; accrual math takes
/// it by reference and never mutates it.
#[derive(Debug, Clone, Copy, Deserialize, Serialize)]
pub struct PointsConfig {
    /// Points earned per active minute
    #[serde(default = "default_points_per_minute")]
    pub points_per_minute: i64,

    /// Maximum points a scope may accrue per calendar day
    #[serde(default = "default_daily_cap")]
    pub daily_cap_points: i64,

    /// Slack after the last activity ping that still counts as active
    #[serde(default = "default_idle_timeout")]
    pub idle_timeout_seconds: i64,
}

impl Default for PointsConfig {
    fn default() -> Self {
        Self {
            points_per_minute: default_points_per_minute(),
            daily_cap_points: default_daily_cap(),
            idle_timeout_seconds: default_idle_timeout(),
        }
    }
}

fn default_points_per_minute() -> i64 {
    10
}

fn default_daily_cap() -> i64 {
    600
}

fn default_idle_timeout() -> i64 {
    180
}

/// How points convert back into reward time.
#[derive(Debug, Clone, Copy, Deserialize, Serialize)]
pub struct RedemptionConfig {
    /// Points spent per minute of reward time
    #[serde(default = "default_points_per_minute")]
    pub points_per_minute: i64,

    /// Smallest redemption accepted
    #[serde(default = "default_min_redemption")]
    pub min_redemption_points: i64,

    /// Largest single redemption accepted
    #[serde(default = "default_max_redemption")]
    pub max_redemption_points: i64,

    /// Ceiling on a window's total length after extensions
    #[serde(default = "default_max_total_minutes")]
    pub max_total_minutes: i64,
}

impl Default for RedemptionConfig {
    fn default() -> Self {
        Self {
            points_per_minute: default_points_per_minute(),
            min_redemption_points: default_min_redemption(),
            max_redemption_points: default_max_redemption(),
            max_total_minutes: default_max_total_minutes(),
        }
    }
}

fn default_min_redemption() -> i64 {
    10
}

fn default_max_redemption() -> i64 {
    600
}

fn default_max_total_minutes() -> i64 {
    120
}

/// Rolling-window limits on pairing-code generation.
#[derive(Debug, Clone, Copy, Deserialize, Serialize)]
pub struct PairingLimits {
    /// Codes a child may generate inside one window
    #[serde(default = "default_max_codes")]
    pub max_codes_per_window: usize,

    /// Length of the rolling window in minutes
    #[serde(default = "default_rate_window_minutes")]
    pub window_minutes: i64,
}

impl Default for PairingLimits {
    fn default() -> Self {
        Self {
            max_codes_per_window: default_max_codes(),
            window_minutes: default_rate_window_minutes(),
        }
    }
}

fn default_max_codes() -> usize {
    5
}

fn default_rate_window_minutes() -> i64 {
    60
}

/// Load configuration from a YAML file
pub fn load_config(path: &Path) -> Result<RewardsConfig> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file: {}", path.display()))?;

    let config: RewardsConfig = serde_yaml::from_str(&content)
        .with_context(|| format!("Failed to parse YAML config file: {}", path.display()))?;

    validate_config(&config)?;

    Ok(config)
}

/// Save configuration to a YAML file
pub fn save_config(path: &Path, config: &RewardsConfig) -> Result<()> {
    validate_config(config)?;

    let content =
        serde_yaml::to_string(config).context("Failed to serialize config to YAML")?;

    storage::atomic_write(path, content.as_bytes())
        .with_context(|| format!("Failed to write config file: {}", path.display()))?;

    Ok(())
}

/// Validate configuration
pub fn validate_config(config: &RewardsConfig) -> Result<()> {
    if config.children.is_empty() {
        anyhow::bail!("Configuration must specify at least one child");
    }

    let mut ids = std::collections::HashSet::new();
    for child in &config.children {
        if child.id.is_empty() {
            anyhow::bail!("Child ID cannot be empty");
        }
        if child.name.is_empty() {
            anyhow::bail!("Child name cannot be empty");
        }
        if !ids.insert(&child.id) {
            anyhow::bail!("Duplicate child ID: {}", child.id);
        }
    }

    if config.points.points_per_minute <= 0 {
        anyhow::bail!("points.points_per_minute must be positive");
    }
    if config.points.daily_cap_points < 0 {
        anyhow::bail!("points.daily_cap_points cannot be negative");
    }
    if config.points.idle_timeout_seconds < 0 {
        anyhow::bail!("points.idle_timeout_seconds cannot be negative");
    }

    if config.redemption.points_per_minute <= 0 {
        anyhow::bail!("redemption.points_per_minute must be positive");
    }
    if config.redemption.min_redemption_points > config.redemption.max_redemption_points {
        anyhow::bail!(
            "redemption.min_redemption_points ({}) exceeds max_redemption_points ({})",
            config.redemption.min_redemption_points,
            config.redemption.max_redemption_points
        );
    }
    if config.redemption.max_total_minutes <= 0 {
        anyhow::bail!("redemption.max_total_minutes must be positive");
    }

    if config.pairing.max_codes_per_window == 0 {
        anyhow::bail!("pairing.max_codes_per_window must be at least 1");
    }
    if config.pairing.window_minutes <= 0 {
        anyhow::bail!("pairing.window_minutes must be positive");
    }

    Ok(())
}

/// Example configuration file content
pub const EXAMPLE_CONFIG: &str = include_str!("../../example-rewards-config.yaml");

#[cfg(test)]
mod tests {
    use super::*;

    fn make_test_config() -> RewardsConfig {
        RewardsConfig {
            children: vec![ChildProfile {
                id: "kid1".to_string(),
                name: "Alice".to_string(),
                learning_apps: vec!["math-tutor".to_string()],
                reward_apps: vec!["blockworld".to_string()],
            }],
            points: PointsConfig::default(),
            redemption: RedemptionConfig::default(),
            exemption_policy: ExemptionPolicy::default(),
            pairing: PairingLimits::default(),
        }
    }

    #[test]
    fn test_defaults_are_sane() {
        let config = make_test_config();
        assert!(validate_config(&config).is_ok());
        assert_eq!(config.points.points_per_minute, 10);
        assert_eq!(config.points.idle_timeout_seconds, 180);
        assert_eq!(config.pairing.max_codes_per_window, 5);
    }

    #[test]
    fn test_validate_requires_children() {
        let mut config = make_test_config();
        config.children.clear();
        assert!(validate_config(&config).is_err());
    }

    #[test]
    fn test_validate_rejects_duplicate_ids() {
        let mut config = make_test_config();
        let dup = config.children[0].clone();
        config.children.push(dup);
        assert!(validate_config(&config).is_err());
    }

    #[test]
    fn test_validate_rejects_min_above_max() {
        let mut config = make_test_config();
        config.redemption.min_redemption_points = 1000;
        config.redemption.max_redemption_points = 100;
        assert!(validate_config(&config).is_err());
    }

    #[test]
    fn test_validate_rejects_nonpositive_rates() {
        let mut config = make_test_config();
        config.points.points_per_minute = 0;
        assert!(validate_config(&config).is_err());

        let mut config = make_test_config();
        config.redemption.points_per_minute = -1;
        assert!(validate_config(&config).is_err());
    }

    #[test]
    fn test_yaml_roundtrip() {
        let config = make_test_config();
        let yaml = serde_yaml::to_string(&config).unwrap();
        let parsed: RewardsConfig = serde_yaml::from_str(&yaml).unwrap();
        assert_eq!(parsed.children[0].id, "kid1");
        assert_eq!(parsed.points.daily_cap_points, 600);
    }

    #[test]
    fn test_example_config_is_valid() {
        let config: RewardsConfig = serde_yaml::from_str(EXAMPLE_CONFIG).unwrap();
        assert!(validate_config(&config).is_ok());
    }

    #[test]
    fn test_child_lookup() {
        let config = make_test_config();
        assert!(config.child("kid1").is_some());
        assert!(config.child("kid2").is_none());
    }
}
