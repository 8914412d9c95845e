//! Process-wide defaults applied to every newly built operation
//!
//! The binary installs these from `main.toml`; builder calls such as
//! [`OperationBuilder::poll_interval`](super::OperationBuilder::poll_interval)
//! still override them per operation.

use std::sync::OnceLock;
use std::time::Duration;

use parking_lot::RwLock;

use crate::config::Config;
use crate::constants::polling;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OperationDefaults {
    pub poll_interval: Duration,
    pub correlation_key: String,
}

impl Default for OperationDefaults {
    fn default() -> Self {
        Self {
            poll_interval: polling::POLL_INTERVAL,
            correlation_key: polling::CORRELATION_KEY.to_string(),
        }
    }
}

impl From<&Config> for OperationDefaults {
    fn from(config: &Config) -> Self {
        Self {
            poll_interval: config.poll_interval(),
            correlation_key: config.correlation_key.clone(),
        }
    }
}

impl OperationDefaults {
    /// Defaults used by operations built from now on
    pub fn current() -> Self {
        slot().read().clone()
    }

    /// Replaces the defaults; operations already built keep theirs
    pub fn install(self) {
        *slot().write() = self;
    }
}

fn slot() -> &'static RwLock<OperationDefaults> {
    static DEFAULTS: OnceLock<RwLock<OperationDefaults>> = OnceLock::new();
    DEFAULTS.get_or_init(|| RwLock::new(OperationDefaults::default()))
}
