//! Client configuration, loadable from TOML.
//!
//! ```toml
//! [pool]
//! fault_tolerance = 1
//! node_timeout_ms = 3000
//!
//! [pool.retry]
//! max_retries = 2
//!
//! [dispatch]
//! write_quorum = "byzantine_majority"
//! read_quorum = { fixed = 2 }
//! hedge_delay_ms = 1000
//!
//! [reconciler]
//! ignore_fields = ["servedAt"]
//! ```

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::dispatch::{default_fault_tolerance, validate_rule, QuorumRule};
use crate::transport::RetryPolicy;
use ledger_types::RequestClass;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ConfigError {
    #[error("failed to read config {path}: {reason}")]
    Io { path: PathBuf, reason: String },
    #[error("failed to parse config: {0}")]
    Parse(String),
    #[error("invalid config: {0}")]
    Invalid(String),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct LedgerConfig {
    #[serde(default)]
    pub pool: PoolConfig,
    #[serde(default)]
    pub dispatch: DispatchConfig,
    #[serde(default)]
    pub reconciler: ReconcilerConfig,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PoolConfig {
    /// Tolerated faulty nodes F. Defaults to floor((N - 1) / 3).
    #[serde(default)]
    pub fault_tolerance: Option<usize>,

    /// Genesis file listing the pool's NODE transactions.
    #[serde(default)]
    pub genesis_path: Option<PathBuf>,

    /// Upper bound of one exchange with one node (default: 3000)
    #[serde(default = "default_node_timeout_ms")]
    pub node_timeout_ms: u64,

    /// Outbound frames buffered per node before sends are reported as failed (default: 64)
    #[serde(default = "default_queue_depth")]
    pub queue_depth: usize,

    #[serde(default)]
    pub retry: RetryPolicy,
}

fn default_node_timeout_ms() -> u64 {
    3_000
}

fn default_queue_depth() -> usize {
    64
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            fault_tolerance: None,
            genesis_path: None,
            node_timeout_ms: default_node_timeout_ms(),
            queue_depth: default_queue_depth(),
            retry: RetryPolicy::default(),
        }
    }
}

impl DispatchConfig {
    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }

    pub fn hedge_delay(&self) -> Option<Duration> {
        (self.hedge_delay_ms > 0).then(|| Duration::from_millis(self.hedge_delay_ms))
    }
}

impl PoolConfig {
    pub fn node_timeout(&self) -> Duration {
        Duration::from_millis(self.node_timeout_ms)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DispatchConfig {
    #[serde(default)]
    pub write_quorum: QuorumRule,

    #[serde(default)]
    pub read_quorum: QuorumRule,

    /// Nodes a read is first sent to. Defaults to the read quorum.
    #[serde(default)]
    pub read_fanout: Option<usize>,

    /// Overall deadline of one request (default: 10000)
    #[serde(default = "default_request_timeout_ms")]
    pub request_timeout_ms: u64,

    /// Delay after which a pending read recruits every reserve node; 0 disables (default: 1000)
    #[serde(default = "default_hedge_delay_ms")]
    pub hedge_delay_ms: u64,
}

fn default_request_timeout_ms() -> u64 {
    10_000
}

fn default_hedge_delay_ms() -> u64 {
    1_000
}

impl Default for DispatchConfig {
    fn default() -> Self {
        Self {
            write_quorum: QuorumRule::default(),
            read_quorum: QuorumRule::default(),
            read_fanout: None,
            request_timeout_ms: default_request_timeout_ms(),
            hedge_delay_ms: default_hedge_delay_ms(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReconcilerConfig {
    /// Node-local payload fields excluded from agreement. Dot paths; `*`
    /// matches any key or array item.
    #[serde(default = "default_ignore_fields")]
    pub ignore_fields: Vec<String>,
}

fn default_ignore_fields() -> Vec<String> {
    vec!["servedAt".to_string()]
}

impl Default for ReconcilerConfig {
    fn default() -> Self {
        Self {
            ignore_fields: default_ignore_fields(),
        }
    }
}

impl LedgerConfig {
    pub fn from_toml_str(text: &str) -> Result<Self, ConfigError> {
        toml::from_str(text).map_err(|err| ConfigError::Parse(err.to_string()))
    }

    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path).map_err(|err| ConfigError::Io {
            path: path.to_path_buf(),
            reason: err.to_string(),
        })?;
        Self::from_toml_str(&text)
    }

    /// Checks the configuration against a pool of `node_count` nodes and
    /// returns the effective fault tolerance.
    pub fn validate(&self, node_count: usize) -> Result<usize, ConfigError> {
        if node_count == 0 {
            return Err(ConfigError::Invalid("pool has no nodes".to_string()));
        }
        let fault_tolerance = self
            .pool
            .fault_tolerance
            .unwrap_or_else(|| default_fault_tolerance(node_count));
        if fault_tolerance >= node_count {
            return Err(ConfigError::Invalid(format!(
                "fault tolerance {fault_tolerance} must be below the node count {node_count}"
            )));
        }
        let invalid = |err: crate::dispatch::DispatchError| ConfigError::Invalid(err.to_string());
        validate_rule(self.dispatch.write_quorum, RequestClass::Write, node_count, fault_tolerance)
            .map_err(invalid)?;
        let read_quorum =
            validate_rule(self.dispatch.read_quorum, RequestClass::Read, node_count, fault_tolerance)
                .map_err(invalid)?;
        if let Some(fanout) = self.dispatch.read_fanout {
            if fanout == 0 || fanout > node_count {
                return Err(ConfigError::Invalid(format!(
                    "read fanout {fanout} must be within 1..={node_count}"
                )));
            }
            if fanout < read_quorum {
                return Err(ConfigError::Invalid(format!(
                    "read fanout {fanout} is below the read quorum {read_quorum}"
                )));
            }
        }
        if self.dispatch.request_timeout_ms == 0 || self.pool.node_timeout_ms == 0 {
            return Err(ConfigError::Invalid("timeouts must be positive".to_string()));
        }
        if self.pool.queue_depth == 0 {
            return Err(ConfigError::Invalid("queue depth must be positive".to_string()));
        }
        Ok(fault_tolerance)
    }
}

#[cfg(test)]
mod tests {
    use super::{ConfigError, LedgerConfig};
    use crate::dispatch::QuorumRule;

    #[test]
    fn defaults_validate_for_four_nodes() {
        let config = LedgerConfig::default();
        assert_eq!(config.validate(4), Ok(1));
        assert_eq!(config.reconciler.ignore_fields, vec!["servedAt".to_string()]);
        assert_eq!(config.dispatch.write_quorum, QuorumRule::ByzantineMajority);
    }

    #[test]
    fn parses_toml_sections() {
        let config = LedgerConfig::from_toml_str(
            r#"
            [pool]
            fault_tolerance = 1
            node_timeout_ms = 250

            [pool.retry]
            max_retries = 0

            [dispatch]
            read_quorum = { fixed = 2 }
            read_fanout = 3
            hedge_delay_ms = 100

            [reconciler]
            ignore_fields = ["servedAt", "result.meta.*"]
            "#,
        )
        .unwrap();
        assert_eq!(config.pool.fault_tolerance, Some(1));
        assert_eq!(config.pool.retry.max_retries, 0);
        assert_eq!(config.pool.retry.initial_backoff_ms, 50);
        assert_eq!(config.dispatch.read_quorum, QuorumRule::Fixed(2));
        assert_eq!(config.dispatch.write_quorum, QuorumRule::ByzantineMajority);
        assert_eq!(config.dispatch.request_timeout_ms, 10_000);
        assert_eq!(config.reconciler.ignore_fields.len(), 2);
        assert_eq!(config.validate(4), Ok(1));
    }

    #[test]
    fn rejects_unsafe_write_quorum_and_bad_fanout() {
        let mut config = LedgerConfig::default();
        config.dispatch.write_quorum = QuorumRule::HonestWitness;
        assert!(matches!(config.validate(4), Err(ConfigError::Invalid(_))));

        let mut config = LedgerConfig::default();
        config.dispatch.read_fanout = Some(1);
        assert!(config.validate(4).is_err());

        let mut config = LedgerConfig::default();
        config.pool.fault_tolerance = Some(4);
        assert!(config.validate(4).is_err());
        assert!(LedgerConfig::default().validate(0).is_err());
    }

    #[test]
    fn malformed_toml_is_a_parse_error() {
        assert!(matches!(
            LedgerConfig::from_toml_str("[dispatch]\nwrite_quorum = 3"),
            Err(ConfigError::Parse(_))
        ));
    }
}
