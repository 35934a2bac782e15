//! Layered configuration.
//!
//! Sources, lowest priority first: built-in defaults, a TOML file,
//! `VMXPORT_`-prefixed environment variables (`__` separates nested keys, as
//! in `VMXPORT_TRANSFER__PARALLELISM=8`), then flags given on the command line.

use figment::{
    Figment,
    providers::{Env, Format, Serialized, Toml},
};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use crate::core::checkpoint::SharedCheckpoint;
use crate::core::pool::PoolOptions;
use crate::core::rate_limit::{AdaptiveBandwidth, AdaptiveRateLimiter, Bandwidth, RateLimiter};
use crate::core::retry::{RetryConfig, RetryPolicy};
use crate::logging::LogConfig;

/// Config file read when none is given explicitly. Missing is fine.
pub const DEFAULT_CONFIG_FILE: &str = "vmxport.toml";

pub const ENV_PREFIX: &str = "VMXPORT_";

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BandwidthScope {
    /// Each transfer is limited on its own.
    #[default]
    PerTask,
    /// All transfers share one limit.
    Shared,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TransferConfig {
    pub parallelism: usize,
    /// Bytes per second; 0 is unlimited.
    pub bandwidth_limit: u64,
    /// Bytes; 0 picks a burst from the limit.
    pub bandwidth_burst: u64,
    pub bandwidth_scope: BandwidthScope,
    /// When set, overrides the fixed limit with an adaptive one.
    pub adaptive_bandwidth: Option<AdaptiveBandwidth>,
    pub enable_checkpoints: bool,
    pub resume_from_checkpoint: bool,
    /// 0 saves after every completed file only.
    pub checkpoint_interval_secs: u64,
    pub checkpoint_path: Option<PathBuf>,
    pub verify_checksums: bool,
    pub retry: RetryConfig,
}

impl Default for TransferConfig {
    fn default() -> Self {
        Self {
            parallelism: 4,
            bandwidth_limit: 0,
            bandwidth_burst: 0,
            bandwidth_scope: BandwidthScope::PerTask,
            adaptive_bandwidth: None,
            enable_checkpoints: true,
            resume_from_checkpoint: false,
            checkpoint_interval_secs: 0,
            checkpoint_path: None,
            verify_checksums: false,
            retry: RetryConfig::default(),
        }
    }
}

impl TransferConfig {
    pub fn normalized(mut self) -> Self {
        self.parallelism = self.parallelism.max(1);
        self.retry = self.retry.normalized();
        self
    }

    pub fn checkpoint_interval(&self) -> Duration {
        Duration::from_secs(self.checkpoint_interval_secs)
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy::new(self.retry.clone())
    }

    pub fn bandwidth(&self) -> Bandwidth {
        if let Some(bounds) = self.adaptive_bandwidth {
            return Bandwidth::Adaptive(Arc::new(AdaptiveRateLimiter::new(bounds)));
        }
        if self.bandwidth_limit == 0 {
            return Bandwidth::Unlimited;
        }
        match self.bandwidth_scope {
            BandwidthScope::PerTask => Bandwidth::PerTask {
                bytes_per_second: self.bandwidth_limit,
                burst: self.bandwidth_burst,
            },
            BandwidthScope::Shared => Bandwidth::Shared(Arc::new(RateLimiter::new(
                self.bandwidth_limit,
                self.bandwidth_burst,
            ))),
        }
    }

    pub fn pool_options(&self, checkpoint: Option<Arc<SharedCheckpoint>>) -> PoolOptions {
        PoolOptions {
            workers: self.parallelism,
            retry: self.retry_policy(),
            bandwidth: self.bandwidth(),
            checkpoint,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    pub transfer: TransferConfig,
    pub log: LogConfig,
}

impl AppConfig {
    /// Load from every source. `overrides` is serialized and merged last, so
    /// it should skip the fields the user did not set.
    pub fn load<T: Serialize>(file: Option<&Path>, overrides: Option<&T>) -> Result<Self, figment::Error> {
        let file = file.unwrap_or_else(|| Path::new(DEFAULT_CONFIG_FILE));
        let mut figment = Figment::from(Serialized::defaults(AppConfig::default()))
            .merge(Toml::file(file))
            .merge(Env::prefixed(ENV_PREFIX).split("__"));
        if let Some(overrides) = overrides {
            figment = figment.merge(Serialized::defaults(overrides));
        }
        let config: AppConfig = figment.extract()?;
        Ok(config.normalized())
    }

    pub fn normalized(mut self) -> Self {
        self.transfer = self.transfer.normalized();
        self
    }

    pub fn to_toml(&self) -> Result<String, toml::ser::Error> {
        toml::to_string_pretty(self)
    }
}
