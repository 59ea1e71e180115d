//! Site configuration.

use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Configuration for one execution site.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SiteConfig {
    /// Most batches a single procedure may issue before it is rolled back.
    pub max_batches_per_transaction: usize,

    /// How long the run loop waits for mail before re-checking shutdown.
    pub idle_poll_interval: Duration,

    /// Release a transaction only once its initiator reports every replica
    /// of this partition has received it.
    pub replica_safety: bool,

    /// Committed transaction ids kept for determinism checks.
    pub commit_history_limit: usize,
}

impl Default for SiteConfig {
    fn default() -> Self {
        Self {
            max_batches_per_transaction: 1024,
            idle_poll_interval: Duration::from_millis(5),
            replica_safety: true,
            commit_history_limit: 10_000,
        }
    }
}

impl SiteConfig {
    pub fn with_max_batches_per_transaction(mut self, max: usize) -> Self {
        self.max_batches_per_transaction = max;
        self
    }

    pub fn with_idle_poll_interval(mut self, interval: Duration) -> Self {
        self.idle_poll_interval = interval;
        self
    }

    pub fn with_replica_safety(mut self, enabled: bool) -> Self {
        self.replica_safety = enabled;
        self
    }

    pub fn with_commit_history_limit(mut self, limit: usize) -> Self {
        self.commit_history_limit = limit;
        self
    }
}
