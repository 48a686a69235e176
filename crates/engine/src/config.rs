//! Engine configuration.
//!
//! Read once at process start from a TOML file, then overridden from the
//! environment. Every field has a default, so an empty or absent file is a
//! working local setup.
//!
//! # Example
//!
//! ```toml
//! [ledger]
//! endpoint = "https://rpc.testnet.example.org"
//! contract_address = "0x5afe000000000000000000000000000000000001"
//! signing_key_path = "/etc/agritrace/ledger.secret"
//! network = "testnet"
//!
//! [gas]
//! gas_price = 1000000000
//! append_step = 350000
//!
//! [retry]
//! max_attempts = 5
//!
//! [storage]
//! journal_path = "/var/lib/agritrace/operations.jsonl"
//! ```

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use agritrace_ledger::{GasSchedule, RpcSettings};

/// Errors loading or validating configuration.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("could not read '{path}': {message}")]
    Read { path: String, message: String },

    #[error("could not parse '{path}': {message}")]
    Parse { path: String, message: String },

    #[error("invalid configuration: {}", .0.join("; "))]
    Invalid(Vec<String>),
}

// ── Sections ─────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LedgerSettings {
    pub endpoint: String,
    pub contract_address: String,
    /// File holding the base64 Ed25519 seed of the signing account.
    pub signing_key_path: Option<PathBuf>,
    pub network: String,
}

impl Default for LedgerSettings {
    fn default() -> Self {
        LedgerSettings {
            endpoint: "http://127.0.0.1:8545".to_string(),
            contract_address: String::new(),
            signing_key_path: None,
            network: "local".to_string(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetrySettings {
    /// Submission attempts before an operation is abandoned.
    pub max_attempts: u32,
    pub base_backoff_ms: u64,
    pub max_backoff_ms: u64,
}

impl Default for RetrySettings {
    fn default() -> Self {
        RetrySettings {
            max_attempts: 5,
            base_backoff_ms: 2_000,
            max_backoff_ms: 60_000,
        }
    }
}

impl RetrySettings {
    /// Delay before the next attempt after `attempts` failed ones:
    /// `base * 2^(attempts - 1)`, capped at `max`.
    pub fn backoff(&self, attempts: u32) -> Duration {
        let factor = 1u64
            .checked_shl(attempts.saturating_sub(1))
            .unwrap_or(u64::MAX);
        Duration::from_millis(
            self.base_backoff_ms
                .saturating_mul(factor)
                .min(self.max_backoff_ms),
        )
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct TimeoutSettings {
    /// Bound on every network call to the ledger.
    pub submission_ms: u64,
    /// Age a submitted operation must reach before its receipt is polled.
    pub confirmation_grace_ms: u64,
    /// How long a receipt may be missing (or unobtainable) before the
    /// operation is marked Unknown.
    pub not_found_ms: u64,
    /// Overall retry window, counted from creation or the last revival.
    pub unknown_to_abandon_ms: u64,
}

impl Default for TimeoutSettings {
    fn default() -> Self {
        TimeoutSettings {
            submission_ms: 10_000,
            confirmation_grace_ms: 3_000,
            not_found_ms: 60_000,
            unknown_to_abandon_ms: 600_000,
        }
    }
}

impl TimeoutSettings {
    pub fn submission(&self) -> Duration {
        Duration::from_millis(self.submission_ms)
    }

    pub fn confirmation_grace(&self) -> Duration {
        Duration::from_millis(self.confirmation_grace_ms)
    }

    pub fn not_found(&self) -> Duration {
        Duration::from_millis(self.not_found_ms)
    }

    pub fn unknown_to_abandon(&self) -> Duration {
        Duration::from_millis(self.unknown_to_abandon_ms)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PollerSettings {
    pub interval_ms: u64,
    /// Reconcile the nonce watermark with the ledger every this many ticks.
    pub nonce_reconcile_every: u64,
}

impl Default for PollerSettings {
    fn default() -> Self {
        PollerSettings {
            interval_ms: 3_000,
            nonce_reconcile_every: 10,
        }
    }
}

impl PollerSettings {
    pub fn interval(&self) -> Duration {
        Duration::from_millis(self.interval_ms)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageSettings {
    /// Journal file for the durable operation log. In memory when unset.
    pub journal_path: Option<PathBuf>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerSettings {
    /// Key required in `x-api-key` on every route but `/health`.
    pub api_key: Option<String>,
}

// ── EngineConfig ─────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    pub ledger: LedgerSettings,
    pub gas: GasSchedule,
    pub retry: RetrySettings,
    pub timeouts: TimeoutSettings,
    pub poller: PollerSettings,
    pub storage: StorageSettings,
    pub server: ServerSettings,
}

impl EngineConfig {
    /// Parse configuration from TOML text.
    pub fn from_toml(text: &str, origin: &str) -> Result<Self, ConfigError> {
        toml::from_str(text).map_err(|e| ConfigError::Parse {
            path: origin.to_string(),
            message: e.to_string(),
        })
    }

    /// Read `path`. A file that does not exist yields the defaults.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        if !path.exists() {
            tracing::debug!(path = %path.display(), "no config file, using defaults");
            return Ok(EngineConfig::default());
        }
        let content = std::fs::read_to_string(path).map_err(|e| ConfigError::Read {
            path: path.display().to_string(),
            message: e.to_string(),
        })?;
        Self::from_toml(&content, &path.display().to_string())
    }

    /// Apply `AGRITRACE_*` overrides using `lookup` to read variables.
    pub fn apply_env<F>(&mut self, lookup: F)
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(url) = lookup("AGRITRACE_LEDGER_URL") {
            self.ledger.endpoint = url;
        }
        if let Some(path) = lookup("AGRITRACE_SIGNING_KEY") {
            self.ledger.signing_key_path = Some(PathBuf::from(path));
        }
        if let Some(path) = lookup("AGRITRACE_JOURNAL") {
            self.storage.journal_path = Some(PathBuf::from(path));
        }
        if let Some(key) = lookup("AGRITRACE_API_KEY") {
            self.server.api_key = Some(key);
        }
    }

    pub fn apply_process_env(&mut self) {
        self.apply_env(|name| std::env::var(name).ok().filter(|v| !v.is_empty()));
    }

    /// Check cross-field constraints. Lists every problem found.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let mut errors = Vec::new();
        if self.ledger.endpoint.trim().is_empty() {
            errors.push("ledger.endpoint must not be empty".to_string());
        }
        if self.retry.max_attempts == 0 {
            errors.push("retry.max_attempts must be at least 1".to_string());
        }
        if self.retry.base_backoff_ms > self.retry.max_backoff_ms {
            errors.push(format!(
                "retry.base_backoff_ms ({}) exceeds retry.max_backoff_ms ({})",
                self.retry.base_backoff_ms, self.retry.max_backoff_ms
            ));
        }
        for (name, value) in [
            ("timeouts.submission_ms", self.timeouts.submission_ms),
            ("timeouts.not_found_ms", self.timeouts.not_found_ms),
            ("timeouts.unknown_to_abandon_ms", self.timeouts.unknown_to_abandon_ms),
            ("poller.interval_ms", self.poller.interval_ms),
            ("poller.nonce_reconcile_every", self.poller.nonce_reconcile_every),
        ] {
            if value == 0 {
                errors.push(format!("{} must be greater than zero", name));
            }
        }
        if errors.is_empty() {
            Ok(())
        } else {
            Err(ConfigError::Invalid(errors))
        }
    }

    /// Settings for the JSON-RPC gateway.
    pub fn rpc_settings(&self) -> RpcSettings {
        RpcSettings {
            endpoint: self.ledger.endpoint.clone(),
            network: self.ledger.network.clone(),
            contract_address: self.ledger.contract_address.clone(),
            timeout: self.timeouts.submission(),
            gas: self.gas.clone(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[test]
    fn empty_file_is_all_defaults() {
        let config = EngineConfig::from_toml("", "inline").unwrap();
        assert_eq!(config, EngineConfig::default());
        assert_eq!(config.retry.max_attempts, 5);
        assert_eq!(config.gas.register_product, 500_000);
        assert_eq!(config.timeouts.unknown_to_abandon_ms, 600_000);
        config.validate().unwrap();
    }

    #[test]
    fn partial_sections_keep_other_defaults() {
        let config = EngineConfig::from_toml(
            r#"
            [ledger]
            endpoint = "https://rpc.example.org"
            [gas]
            append_step = 400000
            "#,
            "inline",
        )
        .unwrap();
        assert_eq!(config.ledger.endpoint, "https://rpc.example.org");
        assert_eq!(config.ledger.network, "local");
        assert_eq!(config.gas.append_step, 400_000);
        assert_eq!(config.gas.mark_verified, 200_000);
    }

    #[test]
    fn unparseable_file_names_origin() {
        let err = EngineConfig::from_toml("[retry]\nmax_attempts = \"five\"", "agritrace.toml")
            .unwrap_err();
        assert!(err.to_string().contains("agritrace.toml"));
    }

    #[test]
    fn missing_file_yields_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let config = EngineConfig::load(&dir.path().join("absent.toml")).unwrap();
        assert_eq!(config, EngineConfig::default());
    }

    #[test]
    fn env_overrides_file_values() {
        let mut config = EngineConfig::default();
        let vars: HashMap<&str, &str> = [
            ("AGRITRACE_LEDGER_URL", "http://node:8545"),
            ("AGRITRACE_SIGNING_KEY", "/keys/ledger.secret"),
            ("AGRITRACE_API_KEY", "s3cret"),
        ]
        .into_iter()
        .collect();
        config.apply_env(|name| vars.get(name).map(|v| v.to_string()));
        assert_eq!(config.ledger.endpoint, "http://node:8545");
        assert_eq!(
            config.ledger.signing_key_path,
            Some(PathBuf::from("/keys/ledger.secret"))
        );
        assert_eq!(config.server.api_key.as_deref(), Some("s3cret"));
        assert_eq!(config.storage.journal_path, None);
    }

    #[test]
    fn validate_reports_every_problem() {
        let mut config = EngineConfig::default();
        config.retry.max_attempts = 0;
        config.retry.base_backoff_ms = 120_000;
        config.poller.interval_ms = 0;
        match config.validate() {
            Err(ConfigError::Invalid(errors)) => assert_eq!(errors.len(), 3),
            other => panic!("expected invalid config, got {:?}", other),
        }
    }

    #[test]
    fn backoff_doubles_and_caps() {
        let retry = RetrySettings::default();
        assert_eq!(retry.backoff(1), Duration::from_secs(2));
        assert_eq!(retry.backoff(2), Duration::from_secs(4));
        assert_eq!(retry.backoff(4), Duration::from_secs(16));
        assert_eq!(retry.backoff(10), Duration::from_secs(60));
        assert_eq!(retry.backoff(200), Duration::from_secs(60));
    }
}
