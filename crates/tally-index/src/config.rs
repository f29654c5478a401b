//! Indexer configuration.
//!
//! [`IndexerConfig`] holds everything the engine and the ledger client need;
//! [`ScanConfig`] carries the orchestrator and scheduler knobs. Both
//! deserialize with every field optional, so a partial TOML file or a few
//! `TALLY_*` environment variables can be layered over the defaults.

use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use tally_core::constants::Network;

/// Default ledger RPC endpoint.
pub const DEFAULT_RPC_URL: &str = "http://127.0.0.1:8332";

/// Configuration for one index instance.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct IndexerConfig {
    /// Network whose address encoding is used.
    pub network: Network,
    /// Root directory for the index. Defaults to a per-network directory.
    pub data_dir: Option<PathBuf>,
    /// Ledger JSON-RPC endpoint.
    pub rpc_url: String,
    pub rpc_user: Option<String>,
    pub rpc_password: Option<String>,
    /// Per-request timeout for ledger calls, in seconds.
    pub rpc_timeout_secs: u64,
    /// How long a unit waits on a row held by another unit, in milliseconds.
    pub lock_timeout_ms: u64,
    /// Log level filter string (e.g. "info", "tally_index=debug").
    pub log_level: String,
    pub scan: ScanConfig,
}

impl Default for IndexerConfig {
    fn default() -> Self {
        Self {
            network: Network::Main,
            data_dir: None,
            rpc_url: DEFAULT_RPC_URL.to_string(),
            rpc_user: None,
            rpc_password: None,
            rpc_timeout_secs: 30,
            lock_timeout_ms: 5_000,
            log_level: "info".to_string(),
            scan: ScanConfig::default(),
        }
    }
}

impl IndexerConfig {
    /// Root data directory, falling back to `<data_dir>/tally/<network>`.
    pub fn data_dir(&self) -> PathBuf {
        self.data_dir.clone().unwrap_or_else(|| default_data_dir(self.network))
    }

    /// Path to the RocksDB index directory.
    pub fn db_path(&self) -> PathBuf {
        self.data_dir().join("index")
    }

    pub fn rpc_timeout(&self) -> Duration {
        Duration::from_secs(self.rpc_timeout_secs)
    }

    pub fn lock_timeout(&self) -> Duration {
        Duration::from_millis(self.lock_timeout_ms)
    }

    /// Basic-auth credentials, if both halves are configured.
    pub fn rpc_auth(&self) -> Option<(String, String)> {
        match (&self.rpc_user, &self.rpc_password) {
            (Some(user), Some(password)) => Some((user.clone(), password.clone())),
            _ => None,
        }
    }
}

/// Per-network default data directory.
pub fn default_data_dir(network: Network) -> PathBuf {
    dirs::data_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("tally")
        .join(network.data_dir_suffix())
}

/// Scan orchestration and claim policy.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ScanConfig {
    /// Attempts per height before it is left failed.
    pub retry_limit: u32,
    /// Heights claimed per batch.
    pub batch_size: usize,
    /// Concurrent block appliers.
    pub workers: usize,
    pub poll_interval_ms: u64,
    pub progress_interval_ms: u64,
    /// Attempt `n` is followed by a sleep of `backoff_unit_ms * backoff_base^n`.
    pub backoff_base: u32,
    pub backoff_unit_ms: u64,
    /// A pending claim older than this is presumed abandoned.
    pub stale_claim_lease_ms: u64,
    /// Unseen heights offered per claim after the highest known height.
    pub sequential_window: u64,
}

impl Default for ScanConfig {
    fn default() -> Self {
        Self {
            retry_limit: 3,
            batch_size: 10,
            workers: 10,
            poll_interval_ms: 5_000,
            progress_interval_ms: 30_000,
            backoff_base: 2,
            backoff_unit_ms: 1_000,
            stale_claim_lease_ms: 10 * 60 * 1_000,
            sequential_window: 1,
        }
    }
}

impl ScanConfig {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    pub fn progress_interval(&self) -> Duration {
        Duration::from_millis(self.progress_interval_ms)
    }

    pub fn stale_claim_lease(&self) -> Duration {
        Duration::from_millis(self.stale_claim_lease_ms)
    }

    /// Sleep after failed attempt `attempt` (1-based).
    pub fn backoff(&self, attempt: u32) -> Duration {
        let factor = self.backoff_base.saturating_pow(attempt);
        Duration::from_millis(self.backoff_unit_ms).saturating_mul(factor)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn engine_defaults() {
        let cfg = ScanConfig::default();
        assert_eq!(cfg.retry_limit, 3);
        assert_eq!(cfg.batch_size, 10);
        assert_eq!(cfg.workers, 10);
        assert_eq!(cfg.poll_interval(), Duration::from_secs(5));
        assert_eq!(cfg.progress_interval(), Duration::from_secs(30));
        assert_eq!(cfg.stale_claim_lease(), Duration::from_secs(600));
        assert_eq!(cfg.sequential_window, 1);
    }

    #[test]
    fn backoff_is_exponential() {
        let cfg = ScanConfig::default();
        assert_eq!(cfg.backoff(1), Duration::from_secs(2));
        assert_eq!(cfg.backoff(2), Duration::from_secs(4));
        assert_eq!(cfg.backoff(3), Duration::from_secs(8));
    }

    #[test]
    fn backoff_saturates() {
        let cfg = ScanConfig::default();
        assert!(cfg.backoff(200) > Duration::from_secs(1_000_000));
    }

    #[test]
    fn zero_unit_disables_backoff() {
        let cfg = ScanConfig { backoff_unit_ms: 0, ..ScanConfig::default() };
        assert_eq!(cfg.backoff(3), Duration::ZERO);
    }

    #[test]
    fn default_data_dir_is_per_network() {
        let cfg = IndexerConfig::default();
        assert!(cfg.data_dir().ends_with("tally/mainnet"), "{:?}", cfg.data_dir());
        let test = IndexerConfig { network: Network::Test, ..IndexerConfig::default() };
        assert!(test.data_dir().ends_with("tally/testnet"));
    }

    #[test]
    fn db_path_appends_index() {
        let cfg = IndexerConfig {
            data_dir: Some(PathBuf::from("/tmp/tally-test")),
            ..IndexerConfig::default()
        };
        assert_eq!(cfg.db_path(), PathBuf::from("/tmp/tally-test/index"));
    }

    #[test]
    fn auth_requires_both_halves() {
        let mut cfg = IndexerConfig::default();
        assert_eq!(cfg.rpc_auth(), None);
        cfg.rpc_user = Some("alice".into());
        assert_eq!(cfg.rpc_auth(), None);
        cfg.rpc_password = Some("secret".into());
        assert_eq!(cfg.rpc_auth(), Some(("alice".into(), "secret".into())));
    }

    #[test]
    fn partial_json_keeps_defaults() {
        let cfg: IndexerConfig =
            serde_json::from_str(r#"{"network":"test","scan":{"retry_limit":5}}"#).unwrap();
        assert_eq!(cfg.network, Network::Test);
        assert_eq!(cfg.scan.retry_limit, 5);
        assert_eq!(cfg.scan.batch_size, 10);
        assert_eq!(cfg.rpc_url, DEFAULT_RPC_URL);
    }
}
