//! Monitor configuration.
//!
//! Three knobs drive the engine: the base check interval, the global
//! concurrency limit, and the per-query timeout. Defaults can be overridden
//! by environment variables, and both are overridden by values persisted in
//! the settings table (that is what the admin surface mutates). Workers read
//! the shared handle lazily, so a settings update takes effect at each
//! worker's next scheduling decision.

use std::sync::Arc;
use std::time::Duration;

use serde::Deserialize;
use tokio::sync::RwLock;
use tracing::warn;

use crate::errors::MonitorError;
use crate::store::Store;

pub const KEY_CHECK_INTERVAL: &str = "monitor_check_interval";
pub const KEY_CONCURRENT_LIMIT: &str = "monitor_concurrent_limit";
pub const KEY_TIMEOUT: &str = "monitor_timeout";

const MIN_CHECK_INTERVAL_SECS: u64 = 5;
const MIN_CONCURRENT: u64 = 1;
const MAX_CONCURRENT: u64 = 1000;
const MIN_TIMEOUT_SECS: u64 = 1;
const MAX_TIMEOUT_SECS: u64 = 120;

/// Shared, hot-reloadable configuration handle.
pub type SharedConfig = Arc<RwLock<MonitorConfig>>;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MonitorConfig {
    /// Base interval between checks for every non-error state.
    pub check_interval: Duration,
    /// Capacity of the global query semaphore.
    pub concurrent_limit: usize,
    /// Per-query deadline (WHOIS dial+read, RDAP round trip).
    pub timeout: Duration,
}

#[derive(Debug, Deserialize)]
struct RawConfig {
    check_interval: u64,
    concurrent_limit: u64,
    timeout: u64,
}

impl Default for MonitorConfig {
    fn default() -> Self {
        MonitorConfig {
            check_interval: Duration::from_secs(1800),
            concurrent_limit: 10,
            timeout: Duration::from_secs(15),
        }
    }
}

impl MonitorConfig {
    /// Defaults, then environment variables, then persisted settings.
    pub fn load(store: &Store) -> Result<Self, MonitorError> {
        let mut settings = config::Config::builder()
            .set_default("check_interval", 1800_i64)?
            .set_default("concurrent_limit", 10_i64)?
            .set_default("timeout", 15_i64)?;

        let env_mappings = [
            ("MONITOR_CHECK_INTERVAL", "check_interval"),
            ("MONITOR_CONCURRENT_LIMIT", "concurrent_limit"),
            ("MONITOR_TIMEOUT", "timeout"),
        ];
        for (env_var, config_key) in env_mappings {
            if let Ok(value) = std::env::var(env_var) {
                settings = settings.set_override(config_key, value)?;
            }
        }

        let raw: RawConfig = settings.build()?.try_deserialize()?;
        let mut cfg = MonitorConfig {
            check_interval: Duration::from_secs(raw.check_interval),
            concurrent_limit: raw.concurrent_limit as usize,
            timeout: Duration::from_secs(raw.timeout),
        };
        cfg.apply_settings(store)?;
        Ok(cfg.clamped())
    }

    /// Overlay the persisted settings keys onto this config.
    pub fn apply_settings(&mut self, store: &Store) -> Result<(), MonitorError> {
        if let Some(v) = read_u64_setting(store, KEY_CHECK_INTERVAL)? {
            self.check_interval = Duration::from_secs(v);
        }
        if let Some(v) = read_u64_setting(store, KEY_CONCURRENT_LIMIT)? {
            self.concurrent_limit = v as usize;
        }
        if let Some(v) = read_u64_setting(store, KEY_TIMEOUT)? {
            self.timeout = Duration::from_secs(v);
        }
        *self = self.clone().clamped();
        Ok(())
    }

    /// Force every knob into its valid range.
    pub fn clamped(mut self) -> Self {
        let interval = self.check_interval.as_secs().max(MIN_CHECK_INTERVAL_SECS);
        self.check_interval = Duration::from_secs(interval);

        let concurrent = (self.concurrent_limit as u64).clamp(MIN_CONCURRENT, MAX_CONCURRENT);
        self.concurrent_limit = concurrent as usize;

        let timeout = self.timeout.as_secs().clamp(MIN_TIMEOUT_SECS, MAX_TIMEOUT_SECS);
        self.timeout = Duration::from_secs(timeout);

        self
    }

    pub fn into_shared(self) -> SharedConfig {
        Arc::new(RwLock::new(self))
    }
}

fn read_u64_setting(store: &Store, key: &str) -> Result<Option<u64>, MonitorError> {
    match store.get_setting(key)? {
        Some(value) => match value.trim().parse::<u64>() {
            Ok(parsed) => Ok(Some(parsed)),
            Err(_) => {
                warn!("ignoring non-numeric setting {key}={value:?}");
                Ok(None)
            }
        },
        None => Ok(None),
    }
}
