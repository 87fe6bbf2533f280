//! Tunables for one partition's fixer.

use rfix_error::{Result, RfixError};
use rfix_types::DEFAULT_BLOCK_SIZE;
use serde::{Deserialize, Serialize};

/// Fixer configuration.
///
/// Every field has a default, so a config section may name only what it
/// overrides:
///
/// ```ignore
/// let config = FixerConfig::from_json(r#"{ "max_workers": 2 }"#)?;
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct FixerConfig {
    /// Upper bound on concurrent repair workers.
    pub max_workers: usize,
    /// Backlog each additional worker is expected to drain.
    pub min_fixes_per_worker: usize,
    /// Block granularity for fingerprints, CRC reads, and staged writes.
    pub block_size: u64,
    /// Ledger file name inside the partition directory.
    pub ledger_file_name: String,
    /// Staging directory for quorum downloads, inside the partition directory.
    pub staging_dir_name: String,
    /// `fsync` the ledger after every appended record.
    pub sync_on_append: bool,
}

impl Default for FixerConfig {
    fn default() -> Self {
        Self {
            max_workers: 4,
            min_fixes_per_worker: 16,
            block_size: DEFAULT_BLOCK_SIZE,
            ledger_file_name: "ISSUE_FRAGMENTS".to_owned(),
            staging_dir_name: ".temp".to_owned(),
            sync_on_append: false,
        }
    }
}

impl FixerConfig {
    pub fn from_json(text: &str) -> Result<Self> {
        let config: Self = serde_json::from_str(text)
            .map_err(|e| RfixError::Format(format!("invalid fixer config: {e}")))?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.max_workers == 0 {
            return Err(RfixError::Format("max_workers must be > 0".to_owned()));
        }
        if self.min_fixes_per_worker == 0 {
            return Err(RfixError::Format(
                "min_fixes_per_worker must be > 0".to_owned(),
            ));
        }
        if self.block_size == 0 {
            return Err(RfixError::Format("block_size must be > 0".to_owned()));
        }
        if self.ledger_file_name.is_empty() || self.staging_dir_name.is_empty() {
            return Err(RfixError::Format(
                "ledger_file_name and staging_dir_name must be non-empty".to_owned(),
            ));
        }
        Ok(())
    }

    /// Workers to spawn for `backlog` queued fragments: one per
    /// `min_fixes_per_worker`, at least one, at most `max_workers`.
    #[must_use]
    pub fn worker_count(&self, backlog: usize) -> usize {
        (backlog / self.min_fixes_per_worker.max(1))
            .min(self.max_workers)
            .max(1)
    }
}
