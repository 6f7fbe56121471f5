//! Configuration management for the ThreatNet coordinator.
//!
//! Configuration is loaded from a TOML file with serde-supplied defaults for
//! every tunable, then validated before the service starts. `${VAR_NAME}`
//! placeholders are expanded from the environment before parsing, so files
//! can be checked in without embedding deployment-specific values.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

/// Main configuration for the coordinator.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    /// Listen address configuration.
    #[serde(default)]
    pub server: ServerConfig,

    /// Database configuration.
    #[serde(default)]
    pub database: DatabaseConfig,

    /// Trust Manager tunables.
    #[serde(default)]
    pub trust: TrustConfig,

    /// Consensus promotion tunables.
    #[serde(default)]
    pub consensus: ConsensusConfig,

    /// IOC lifecycle tunables.
    #[serde(default)]
    pub intel: IntelConfig,

    /// Distribution fabric tunables.
    #[serde(default)]
    pub fabric: FabricConfig,

    /// Logging configuration.
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Listen address configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    /// Bind host.
    #[serde(default = "default_host")]
    pub host: String,

    /// Bind port.
    #[serde(default = "default_port")]
    pub port: u16,
}

/// Database configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DatabaseConfig {
    /// Database URL (e.g., "sqlite://threatnet.db")
    #[serde(default = "default_database_url")]
    pub url: String,

    /// Maximum number of connections in the pool.
    #[serde(default = "default_max_connections")]
    pub max_connections: u32,

    /// Minimum number of connections in the pool.
    #[serde(default = "default_min_connections")]
    pub min_connections: u32,
}

/// Trust Manager tunables.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TrustConfig {
    /// Starting trust for a newly seen client.
    #[serde(default = "default_initial_trust")]
    pub initial_trust: f64,

    /// Lower trust bound.
    #[serde(default = "default_min_trust")]
    pub min_trust: f64,

    /// Upper trust bound.
    #[serde(default = "default_max_trust")]
    pub max_trust: f64,

    /// Per-interval decay multiplier toward `initial_trust`.
    #[serde(default = "default_decay_rate")]
    pub decay_rate: f64,

    /// Decay interval in seconds.
    #[serde(default = "default_decay_interval_secs")]
    pub decay_interval_secs: u64,

    /// Learning rate blending the raw multi-factor score into the current value.
    #[serde(default = "default_learning_rate")]
    pub learning_rate: f64,

    /// Report count at which the contribution factor saturates.
    #[serde(default = "default_contribution_norm")]
    pub contribution_norm: u64,

    /// Time constant (seconds) of the heartbeat responsiveness factor.
    #[serde(default = "default_responsiveness_tau_secs")]
    pub responsiveness_tau_secs: u64,

    /// Number of recent outcomes feeding the consistency factor.
    #[serde(default = "default_consistency_window")]
    pub consistency_window: u64,

    /// Factor weights; must sum to 1.0.
    #[serde(default)]
    pub weights: TrustWeights,
}

/// Weights of the four trust factors.
///
/// All weights should sum to 1.0.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TrustWeights {
    /// Share of verified vs. rejected reports.
    pub accuracy: f64,
    /// Saturating report volume.
    pub contribution: f64,
    /// Heartbeat recency.
    pub responsiveness: f64,
    /// Stability of recent outcomes.
    pub consistency: f64,
}

impl Default for TrustWeights {
    fn default() -> Self {
        Self {
            accuracy: 0.40,
            contribution: 0.20,
            responsiveness: 0.20,
            consistency: 0.20,
        }
    }
}

/// Consensus promotion tunables.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConsensusConfig {
    /// Minimum distinct reporters for promotion.
    #[serde(default = "default_consensus_threshold")]
    pub threshold: u64,

    /// Minimum mean reporter trust for promotion.
    #[serde(default = "default_consensus_trust_avg")]
    pub trust_avg: f64,

    /// Mean-trust bar for the relaxed critical path.
    #[serde(default = "default_critical_trust_bypass")]
    pub critical_trust_bypass: f64,
}

/// IOC lifecycle tunables.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IntelConfig {
    /// Pending IOCs with no report for this long are expired by the sweep.
    #[serde(default = "default_ioc_ttl_secs")]
    pub ioc_ttl_secs: u64,

    /// Expire sweep interval in seconds.
    #[serde(default = "default_expire_sweep_interval_secs")]
    pub expire_sweep_interval_secs: u64,

    /// Number of recent verified IOCs sent to a client with no known cursor.
    #[serde(default = "default_initial_snapshot_limit")]
    pub initial_snapshot_limit: u32,
}

/// Distribution fabric tunables.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FabricConfig {
    /// Expected client heartbeat cadence; the reaper marks a client offline
    /// after three missed intervals.
    #[serde(default = "default_heartbeat_interval_secs")]
    pub heartbeat_interval_secs: u64,

    /// Bounded per-session outbound queue size.
    #[serde(default = "default_outbound_queue_size")]
    pub outbound_queue_size: u32,

    /// Deadline for one inbound event handler, in seconds.
    #[serde(default = "default_handler_timeout_secs")]
    pub handler_timeout_secs: u64,
}

/// Logging configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Log level: trace, debug, info, warn, error
    #[serde(default = "default_log_level")]
    pub level: String,

    /// Log format: json or pretty
    #[serde(default = "default_log_format")]
    pub format: String,
}

// Default value functions

fn default_host() -> String {
    "0.0.0.0".to_string()
}

fn default_port() -> u16 {
    8080
}

fn default_database_url() -> String {
    "sqlite://threatnet.db".to_string()
}

fn default_max_connections() -> u32 {
    5
}

fn default_min_connections() -> u32 {
    1
}

fn default_initial_trust() -> f64 {
    0.5
}

fn default_min_trust() -> f64 {
    0.1
}

fn default_max_trust() -> f64 {
    1.0
}

fn default_decay_rate() -> f64 {
    0.95
}

fn default_decay_interval_secs() -> u64 {
    3600 // 1 hour
}

fn default_learning_rate() -> f64 {
    0.25
}

fn default_contribution_norm() -> u64 {
    50
}

fn default_responsiveness_tau_secs() -> u64 {
    60
}

fn default_consistency_window() -> u64 {
    20
}

fn default_consensus_threshold() -> u64 {
    2
}

fn default_consensus_trust_avg() -> f64 {
    0.6
}

fn default_critical_trust_bypass() -> f64 {
    0.8
}

fn default_ioc_ttl_secs() -> u64 {
    30 * 24 * 3600 // 30 days
}

fn default_expire_sweep_interval_secs() -> u64 {
    6 * 3600 // 6 hours
}

fn default_initial_snapshot_limit() -> u32 {
    1000
}

fn default_heartbeat_interval_secs() -> u64 {
    30
}

fn default_outbound_queue_size() -> u32 {
    1024
}

fn default_handler_timeout_secs() -> u64 {
    5
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_log_format() -> String {
    "pretty".to_string()
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
        }
    }
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            url: default_database_url(),
            max_connections: default_max_connections(),
            min_connections: default_min_connections(),
        }
    }
}

impl Default for TrustConfig {
    fn default() -> Self {
        Self {
            initial_trust: default_initial_trust(),
            min_trust: default_min_trust(),
            max_trust: default_max_trust(),
            decay_rate: default_decay_rate(),
            decay_interval_secs: default_decay_interval_secs(),
            learning_rate: default_learning_rate(),
            contribution_norm: default_contribution_norm(),
            responsiveness_tau_secs: default_responsiveness_tau_secs(),
            consistency_window: default_consistency_window(),
            weights: TrustWeights::default(),
        }
    }
}

impl Default for ConsensusConfig {
    fn default() -> Self {
        Self {
            threshold: default_consensus_threshold(),
            trust_avg: default_consensus_trust_avg(),
            critical_trust_bypass: default_critical_trust_bypass(),
        }
    }
}

impl Default for IntelConfig {
    fn default() -> Self {
        Self {
            ioc_ttl_secs: default_ioc_ttl_secs(),
            expire_sweep_interval_secs: default_expire_sweep_interval_secs(),
            initial_snapshot_limit: default_initial_snapshot_limit(),
        }
    }
}

impl Default for FabricConfig {
    fn default() -> Self {
        Self {
            heartbeat_interval_secs: default_heartbeat_interval_secs(),
            outbound_queue_size: default_outbound_queue_size(),
            handler_timeout_secs: default_handler_timeout_secs(),
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            format: default_log_format(),
        }
    }
}

impl TrustConfig {
    /// Decay interval as a [`Duration`].
    pub fn decay_interval(&self) -> Duration {
        Duration::from_secs(self.decay_interval_secs)
    }
}

impl FabricConfig {
    /// Handler deadline as a [`Duration`].
    pub fn handler_timeout(&self) -> Duration {
        Duration::from_secs(self.handler_timeout_secs)
    }
}

impl Config {
    /// Load configuration from a TOML file.
    ///
    /// Environment variables can be referenced using `${VAR_NAME}` syntax,
    /// e.g. `url = "sqlite://${THREATNET_DATA_DIR}/threatnet.db"`.
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let contents = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;

        // Expand environment variables before parsing
        let expanded = Self::expand_env_vars(&contents)?;

        let config: Config = toml::from_str(&expanded)
            .with_context(|| format!("Failed to parse config file: {}", path.display()))?;

        config.validate()?;

        Ok(config)
    }

    /// Load configuration from a TOML string.
    pub fn from_toml_str(toml: &str) -> Result<Self> {
        let config: Config = toml::from_str(toml).context("Failed to parse TOML configuration")?;

        config.validate()?;

        Ok(config)
    }

    /// Validate the configuration.
    pub fn validate(&self) -> Result<()> {
        if self.database.url.is_empty() {
            anyhow::bail!("Database URL cannot be empty");
        }
        if self.database.max_connections == 0 {
            anyhow::bail!("Database max_connections must be > 0");
        }
        if self.database.min_connections > self.database.max_connections {
            anyhow::bail!(
                "Database min_connections ({}) cannot exceed max_connections ({})",
                self.database.min_connections,
                self.database.max_connections
            );
        }

        if !(0.0..=1.0).contains(&self.trust.min_trust)
            || !(0.0..=1.0).contains(&self.trust.max_trust)
        {
            anyhow::bail!("Trust bounds must be within [0, 1]");
        }
        if self.trust.min_trust > self.trust.max_trust {
            anyhow::bail!(
                "Trust min_trust ({}) cannot exceed max_trust ({})",
                self.trust.min_trust,
                self.trust.max_trust
            );
        }
        if self.trust.initial_trust < self.trust.min_trust
            || self.trust.initial_trust > self.trust.max_trust
        {
            anyhow::bail!(
                "Trust initial_trust ({}) must lie within [min_trust, max_trust]",
                self.trust.initial_trust
            );
        }
        if !(0.0..=1.0).contains(&self.trust.decay_rate) {
            anyhow::bail!("Trust decay_rate must be within [0, 1]");
        }
        if self.trust.decay_interval_secs == 0 {
            anyhow::bail!("Trust decay_interval_secs must be > 0 (tokio interval cannot be zero)");
        }
        if !(0.0..=1.0).contains(&self.trust.learning_rate) {
            anyhow::bail!("Trust learning_rate must be within [0, 1]");
        }
        if self.trust.contribution_norm == 0 {
            anyhow::bail!("Trust contribution_norm must be > 0");
        }
        if self.trust.responsiveness_tau_secs == 0 {
            anyhow::bail!("Trust responsiveness_tau_secs must be > 0");
        }
        if self.trust.consistency_window == 0 {
            anyhow::bail!("Trust consistency_window must be > 0");
        }

        let w = &self.trust.weights;
        let weight_sum = w.accuracy + w.contribution + w.responsiveness + w.consistency;
        if (weight_sum - 1.0).abs() > 1e-9 {
            anyhow::bail!("Trust weights must sum to 1.0 (got {})", weight_sum);
        }
        for (name, value) in [
            ("accuracy", w.accuracy),
            ("contribution", w.contribution),
            ("responsiveness", w.responsiveness),
            ("consistency", w.consistency),
        ] {
            if !(0.0..=1.0).contains(&value) {
                anyhow::bail!("Trust weight {} must be within [0, 1] (got {})", name, value);
            }
        }

        if self.consensus.threshold == 0 {
            anyhow::bail!("Consensus threshold must be >= 1");
        }
        if !(0.0..=1.0).contains(&self.consensus.trust_avg) {
            anyhow::bail!("Consensus trust_avg must be within [0, 1]");
        }
        if !(0.0..=1.0).contains(&self.consensus.critical_trust_bypass) {
            anyhow::bail!("Consensus critical_trust_bypass must be within [0, 1]");
        }
        if self.consensus.critical_trust_bypass < self.consensus.trust_avg {
            anyhow::bail!(
                "Consensus critical_trust_bypass ({}) must be >= trust_avg ({})",
                self.consensus.critical_trust_bypass,
                self.consensus.trust_avg
            );
        }

        if self.intel.ioc_ttl_secs == 0 {
            anyhow::bail!("Intel ioc_ttl_secs must be > 0");
        }
        if self.intel.expire_sweep_interval_secs == 0 {
            anyhow::bail!("Intel expire_sweep_interval_secs must be > 0");
        }

        if self.fabric.heartbeat_interval_secs == 0 {
            anyhow::bail!("Fabric heartbeat_interval_secs must be > 0");
        }
        if self.fabric.outbound_queue_size == 0 {
            anyhow::bail!("Fabric outbound_queue_size must be > 0");
        }
        if self.fabric.handler_timeout_secs == 0 {
            anyhow::bail!("Fabric handler_timeout_secs must be > 0");
        }

        let valid_levels = ["trace", "debug", "info", "warn", "error"];
        if !valid_levels.contains(&self.logging.level.as_str()) {
            anyhow::bail!(
                "Logging level must be one of: {} (got '{}')",
                valid_levels.join(", "),
                self.logging.level
            );
        }

        let valid_formats = ["json", "pretty"];
        if !valid_formats.contains(&self.logging.format.as_str()) {
            anyhow::bail!(
                "Logging format must be one of: {} (got '{}')",
                valid_formats.join(", "),
                self.logging.format
            );
        }

        Ok(())
    }

    /// Expand environment variables in the format `${VAR_NAME}`.
    ///
    /// Placeholders inside TOML comments (after a `#` outside strings) are
    /// left untouched, so commented-out examples do not force the variable
    /// to be set. Placeholders inside quoted strings are expanded normally.
    ///
    /// # Errors
    /// Returns an error if a referenced environment variable is not set, or
    /// a placeholder is empty or unclosed.
    fn expand_env_vars(input: &str) -> Result<String> {
        let mut result = String::with_capacity(input.len());
        let mut chars = input.chars().peekable();
        let mut in_double_quote = false;
        let mut in_single_quote = false;
        let mut in_comment = false;
        let mut escape_next = false;

        while let Some(ch) = chars.next() {
            // Escaped characters in basic strings never change parser state.
            if escape_next {
                escape_next = false;
                result.push(ch);
                continue;
            }
            if ch == '\\' && in_double_quote {
                escape_next = true;
                result.push(ch);
                continue;
            }

            match ch {
                '\n' => {
                    // End of line resets comment state (but not string state)
                    in_comment = false;
                    result.push(ch);
                }
                '"' if !in_single_quote && !in_comment => {
                    in_double_quote = !in_double_quote;
                    result.push(ch);
                }
                '\'' if !in_double_quote && !in_comment => {
                    in_single_quote = !in_single_quote;
                    result.push(ch);
                }
                '#' if !in_double_quote && !in_single_quote => {
                    in_comment = true;
                    result.push(ch);
                }
                '$' if !in_comment && chars.peek() == Some(&'{') => {
                    chars.next(); // consume '{'

                    let mut var_name = String::new();
                    let mut found_close = false;
                    for c in chars.by_ref() {
                        if c == '}' {
                            found_close = true;
                            break;
                        }
                        var_name.push(c);
                    }

                    if !found_close {
                        anyhow::bail!(
                            "Unclosed environment variable placeholder '${{{}'",
                            var_name
                        );
                    }
                    if var_name.is_empty() {
                        anyhow::bail!("Empty environment variable name in placeholder");
                    }

                    let value = std::env::var(&var_name).with_context(|| {
                        format!("Environment variable '{}' is not set", var_name)
                    })?;
                    result.push_str(&value);
                }
                _ => result.push(ch),
            }
        }

        Ok(result)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_are_valid() {
        let config = Config::default();
        config.validate().unwrap();

        assert_eq!(config.trust.initial_trust, 0.5);
        assert_eq!(config.trust.min_trust, 0.1);
        assert_eq!(config.trust.max_trust, 1.0);
        assert_eq!(config.trust.decay_rate, 0.95);
        assert_eq!(config.trust.decay_interval_secs, 3600);
        assert_eq!(config.consensus.threshold, 2);
        assert_eq!(config.consensus.trust_avg, 0.6);
        assert_eq!(config.consensus.critical_trust_bypass, 0.8);
        assert_eq!(config.intel.ioc_ttl_secs, 30 * 24 * 3600);
        assert_eq!(config.fabric.outbound_queue_size, 1024);
        assert_eq!(config.fabric.handler_timeout_secs, 5);
    }

    #[test]
    fn test_load_minimal_config() {
        let toml = r#"
[server]
host = "127.0.0.1"
port = 9090

[database]
url = "sqlite://coordinator.db"
        "#;

        let config = Config::from_toml_str(toml).unwrap();
        assert_eq!(config.server.port, 9090);
        assert_eq!(config.database.url, "sqlite://coordinator.db");
        // Untouched sections fall back to defaults.
        assert_eq!(config.consensus.threshold, 2);
        assert_eq!(config.logging.level, "info");
    }

    #[test]
    fn test_validation_rejects_bad_weights() {
        let toml = r#"
[trust.weights]
accuracy = 0.9
contribution = 0.9
responsiveness = 0.1
consistency = 0.1
        "#;

        let result = Config::from_toml_str(toml);
        assert!(result.is_err());
        assert!(result.unwrap_err().to_string().contains("sum to 1.0"));
    }

    #[test]
    fn test_validation_rejects_initial_outside_bounds() {
        let toml = r#"
[trust]
initial_trust = 0.05
min_trust = 0.1
max_trust = 1.0
        "#;

        let result = Config::from_toml_str(toml);
        assert!(result.is_err());
        assert!(result.unwrap_err().to_string().contains("initial_trust"));
    }

    #[test]
    fn test_validation_rejects_bypass_below_average() {
        let toml = r#"
[consensus]
threshold = 2
trust_avg = 0.6
critical_trust_bypass = 0.5
        "#;

        let result = Config::from_toml_str(toml);
        assert!(result.is_err());
        assert!(result
            .unwrap_err()
            .to_string()
            .contains("critical_trust_bypass"));
    }

    #[test]
    fn test_validation_rejects_zero_intervals() {
        let toml = r#"
[trust]
decay_interval_secs = 0
        "#;

        let result = Config::from_toml_str(toml);
        assert!(result.is_err());
        assert!(result
            .unwrap_err()
            .to_string()
            .contains("decay_interval_secs"));
    }

    #[test]
    fn test_validation_rejects_unknown_log_level() {
        let toml = r#"
[logging]
level = "verbose"
        "#;

        let result = Config::from_toml_str(toml);
        assert!(result.is_err());
        assert!(result.unwrap_err().to_string().contains("Logging level"));
    }

    #[test]
    fn test_expand_env_vars() {
        std::env::set_var("THREATNET_TEST_VAR", "hello");
        let result = Config::expand_env_vars("value is ${THREATNET_TEST_VAR}").unwrap();
        assert_eq!(result, "value is hello");

        // No variables
        let result = Config::expand_env_vars("no variables here").unwrap();
        assert_eq!(result, "no variables here");

        std::env::remove_var("THREATNET_TEST_VAR");
    }

    #[test]
    fn test_expand_env_vars_inside_string() {
        std::env::set_var("THREATNET_TEST_DATA_DIR", "/var/lib/threatnet");
        let input = r#"url = "sqlite://${THREATNET_TEST_DATA_DIR}/threatnet.db""#;
        let result = Config::expand_env_vars(input).unwrap();
        assert!(result.contains("sqlite:///var/lib/threatnet/threatnet.db"));

        std::env::remove_var("THREATNET_TEST_DATA_DIR");
    }

    #[test]
    fn test_expand_env_vars_ignores_comments() {
        let input = r#"
# Example: url = "${THREATNET_TEST_UNSET_EXAMPLE}"
level = "info"
"#;
        let result = Config::expand_env_vars(input).unwrap();
        // The commented-out placeholder survives unexpanded.
        assert!(result.contains("${THREATNET_TEST_UNSET_EXAMPLE}"));
        assert!(result.contains(r#"level = "info""#));
    }

    #[test]
    fn test_expand_env_vars_hash_inside_string_is_not_a_comment() {
        std::env::set_var("THREATNET_TEST_FRAGMENT", "token");
        let input = r#"url = "https://example.com/#${THREATNET_TEST_FRAGMENT}""#;
        let result = Config::expand_env_vars(input).unwrap();
        assert!(result.contains("https://example.com/#token"));

        std::env::remove_var("THREATNET_TEST_FRAGMENT");
    }

    #[test]
    fn test_expand_env_vars_escaped_quotes() {
        std::env::set_var("THREATNET_TEST_ESCAPE", "secret");
        let input = r#"key = "she said \"hi\" with ${THREATNET_TEST_ESCAPE}""#;
        let result = Config::expand_env_vars(input).unwrap();
        assert!(result.contains("secret"));
        assert!(result.contains(r#"she said \"hi\""#));

        std::env::remove_var("THREATNET_TEST_ESCAPE");
    }

    #[test]
    fn test_expand_env_vars_undefined() {
        let result = Config::expand_env_vars("value is ${THREATNET_TEST_UNDEFINED_12345}");
        assert!(result.is_err());
        assert!(result
            .unwrap_err()
            .to_string()
            .contains("THREATNET_TEST_UNDEFINED_12345"));
    }

    #[test]
    fn test_expand_env_vars_empty_name() {
        let result = Config::expand_env_vars("value is ${}");
        assert!(result.is_err());
        assert!(result.unwrap_err().to_string().contains("Empty"));
    }

    #[test]
    fn test_expand_env_vars_unclosed() {
        let result = Config::expand_env_vars("value is ${UNCLOSED");
        assert!(result.is_err());
        assert!(result.unwrap_err().to_string().contains("Unclosed"));
    }

    #[test]
    fn test_config_with_env_vars() {
        std::env::set_var("THREATNET_TEST_PORT", "9191");

        let toml = r#"
[server]
port = ${THREATNET_TEST_PORT}

[database]
url = "sqlite://test.db"
        "#;

        // Expand env vars manually (simulating from_file behavior)
        let expanded = Config::expand_env_vars(toml).unwrap();
        let config = Config::from_toml_str(&expanded).unwrap();
        assert_eq!(config.server.port, 9191);

        std::env::remove_var("THREATNET_TEST_PORT");
    }
}
