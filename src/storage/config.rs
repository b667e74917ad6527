//! Store Configuration
//!
//! Every knob has a default; only the two names are mandatory. Validation runs
//! once, when a store is built, and is the only place a configuration error can
//! be raised.

use serde::{Deserialize, Serialize};
use std::time::Duration;

use super::error::{DataStoreError, StoreResult};

const DEFAULT_TIMEOUT_MS: u64 = 5_000;
const DEFAULT_MAX_IDLE_MS: u64 = 30 * 60 * 1_000;
const DEFAULT_REPLICA_WINDOW: usize = 3;
const DEFAULT_MAX_PENDING_UPDATES: usize = 64;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct StoreConfig {
    /// Name of the store; doubles as the message token on the group service.
    pub store_name: String,
    /// Key into the `GroupServiceRegistry`.
    pub group_name: String,
    /// Block writers until the replica acknowledges.
    pub synchronous_replication: bool,
    pub replication_timeout_ms: u64,
    pub load_timeout_ms: u64,
    /// Idle time applied to entries written through `put`.
    pub default_max_idle_ms: u64,
    /// Number of candidate members in each replica-choice slot.
    pub replica_window: usize,
    /// Bound on an entry's out-of-order buffer before gaps are skipped.
    pub max_pending_updates: usize,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            store_name: String::new(),
            group_name: String::new(),
            synchronous_replication: false,
            replication_timeout_ms: DEFAULT_TIMEOUT_MS,
            load_timeout_ms: DEFAULT_TIMEOUT_MS,
            default_max_idle_ms: DEFAULT_MAX_IDLE_MS,
            replica_window: DEFAULT_REPLICA_WINDOW,
            max_pending_updates: DEFAULT_MAX_PENDING_UPDATES,
        }
    }
}

impl StoreConfig {
    pub fn new(store_name: &str, group_name: &str) -> Self {
        Self {
            store_name: store_name.to_string(),
            group_name: group_name.to_string(),
            ..Self::default()
        }
    }

    pub fn from_json(json: &str) -> StoreResult<Self> {
        let config: Self = serde_json::from_str(json)
            .map_err(|e| DataStoreError::Configuration(format!("invalid store config: {}", e)))?;
        config.validate()?;
        Ok(config)
    }

    pub fn with_synchronous_replication(mut self, enabled: bool) -> Self {
        self.synchronous_replication = enabled;
        self
    }

    pub fn with_replication_timeout(mut self, timeout: Duration) -> Self {
        self.replication_timeout_ms = timeout.as_millis() as u64;
        self
    }

    pub fn with_load_timeout(mut self, timeout: Duration) -> Self {
        self.load_timeout_ms = timeout.as_millis() as u64;
        self
    }

    pub fn with_default_max_idle(mut self, max_idle: Duration) -> Self {
        self.default_max_idle_ms = max_idle.as_millis() as u64;
        self
    }

    pub fn with_max_pending_updates(mut self, limit: usize) -> Self {
        self.max_pending_updates = limit;
        self
    }

    pub fn validate(&self) -> StoreResult<()> {
        if self.store_name.trim().is_empty() {
            return Err(DataStoreError::Configuration(
                "store_name must not be empty".to_string(),
            ));
        }
        if self.group_name.trim().is_empty() {
            return Err(DataStoreError::Configuration(
                "group_name must not be empty".to_string(),
            ));
        }
        if self.replication_timeout_ms == 0 || self.load_timeout_ms == 0 {
            return Err(DataStoreError::Configuration(
                "timeouts must be greater than zero".to_string(),
            ));
        }
        if self.replica_window == 0 {
            return Err(DataStoreError::Configuration(
                "replica_window must be at least 1".to_string(),
            ));
        }
        if self.max_pending_updates == 0 {
            return Err(DataStoreError::Configuration(
                "max_pending_updates must be at least 1".to_string(),
            ));
        }
        Ok(())
    }

    pub fn replication_timeout(&self) -> Duration {
        Duration::from_millis(self.replication_timeout_ms)
    }

    pub fn load_timeout(&self) -> Duration {
        Duration::from_millis(self.load_timeout_ms)
    }

    pub fn default_max_idle(&self) -> Duration {
        Duration::from_millis(self.default_max_idle_ms)
    }
}
