//! Node configuration.
//!
//! Defaults come from each component's `Default`, then `BLOCKADE_*`
//! environment variables are laid over them. The binary applies its
//! command-line flags last.

use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use crate::blocker::BlockerConfig;
use crate::daemon::DaemonConfig;
use crate::pow::PowConfig;
use crate::syncer::SyncerConfig;

/// Environment variable prefix
pub const ENV_PREFIX: &str = "BLOCKADE_";

/// Everything a node needs to start
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Config {
    /// Directory holding the sled database
    pub data_dir: PathBuf,
    /// Keep records in memory only
    pub in_memory: bool,
    /// Enforcement daemon connection
    pub daemon: DaemonConfig,
    /// Batch engine and its loops
    pub blocker: BlockerConfig,
    /// Peer reconciliation
    pub syncer: SyncerConfig,
    /// Anonymous report difficulty
    pub pow: PowConfig,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            data_dir: default_data_dir(),
            in_memory: false,
            daemon: DaemonConfig::default(),
            blocker: BlockerConfig::default(),
            syncer: SyncerConfig::default(),
            pow: PowConfig::default(),
        }
    }
}

/// `<platform data dir>/blockade`, or `./blockade-data` without one
#[must_use]
pub fn default_data_dir() -> PathBuf {
    dirs::data_dir().map_or_else(|| PathBuf::from("blockade-data"), |d| d.join("blockade"))
}

impl Config {
    /// Defaults overlaid with the process environment
    ///
    /// # Errors
    /// Returns error if a set variable does not parse
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Defaults overlaid with whatever `lookup` returns for each variable
    ///
    /// # Errors
    /// Returns error if a returned value does not parse
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let env = Env { lookup };
        let mut config = Self::default();

        if let Some(dir) = env.get("DATA_DIR") {
            config.data_dir = PathBuf::from(dir);
        }
        if let Some(flag) = env.parse::<bool>("IN_MEMORY")? {
            config.in_memory = flag;
        }

        if let Some(url) = env.get("DAEMON_URL") {
            config.daemon.url = url;
        }
        if let Some(password) = env.get("DAEMON_PASSWORD") {
            config.daemon.api_password = Some(password);
        }
        if let Some(agent) = env.get("DAEMON_USER_AGENT") {
            config.daemon.user_agent = agent;
        }
        if let Some(secs) = env.secs("DAEMON_TIMEOUT_SECS")? {
            config.daemon.timeout = secs;
        }

        if let Some(size) = env.parse::<usize>("BATCH_SIZE")? {
            config.blocker.batch_size = size;
        }
        if let Some(secs) = env.secs("SCAN_IDLE_SECS")? {
            config.blocker.scan_idle = secs;
        }
        if let Some(secs) = env.secs("RETRY_INTERVAL_SECS")? {
            config.blocker.retry_interval = secs;
        }

        if let Some(peers) = env.get("PEERS") {
            config.syncer.peers = peers
                .split(',')
                .map(str::trim)
                .filter(|p| !p.is_empty())
                .map(String::from)
                .collect();
        }
        if let Some(secs) = env.secs("SYNC_INTERVAL_SECS")? {
            config.syncer.interval = secs;
        }
        if let Some(size) = env.parse::<usize>("SYNC_PAGE_SIZE")? {
            config.syncer.page_size = size;
        }
        if let Some(every) = env.parse::<u32>("SYNC_FULL_RESCAN_EVERY")? {
            config.syncer.full_rescan_every = every;
        }

        if let Some(target) = env.get("POW_TARGET") {
            config.pow.target = parse_target(&target)?;
        }

        config.validate()?;
        Ok(config)
    }

    /// Reject settings the loops cannot run with
    ///
    /// # Errors
    /// Returns error naming the first bad setting
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.blocker.batch_size == 0 {
            return Err(ConfigError::Invalid("batch size must be at least 1".into()));
        }
        if self.blocker.shrink_divisor < 2 {
            return Err(ConfigError::Invalid("shrink divisor must be at least 2".into()));
        }
        if self.syncer.page_size == 0 {
            return Err(ConfigError::Invalid("sync page size must be at least 1".into()));
        }
        if self.daemon.url.is_empty() {
            return Err(ConfigError::Invalid("daemon url is empty".into()));
        }
        Ok(())
    }
}

struct Env<F> {
    lookup: F,
}

impl<F: Fn(&str) -> Option<String>> Env<F> {
    fn get(&self, name: &str) -> Option<String> {
        (self.lookup)(&format!("{ENV_PREFIX}{name}")).filter(|v| !v.is_empty())
    }

    fn parse<T: FromStr>(&self, name: &str) -> Result<Option<T>, ConfigError> {
        self.get(name)
            .map(|value| {
                value.parse().map_err(|_| ConfigError::BadValue {
                    name: format!("{ENV_PREFIX}{name}"),
                    value,
                })
            })
            .transpose()
    }

    fn secs(&self, name: &str) -> Result<Option<Duration>, ConfigError> {
        Ok(self.parse::<u64>(name)?.map(Duration::from_secs))
    }
}

/// Parse a 64-character hex difficulty target
///
/// # Errors
/// Returns error if the value is not 32 hex-encoded bytes
pub fn parse_target(value: &str) -> Result<[u8; 32], ConfigError> {
    let bad = || ConfigError::BadValue {
        name: format!("{ENV_PREFIX}POW_TARGET"),
        value: value.to_string(),
    };
    let bytes = hex::decode(value.trim()).map_err(|_| bad())?;
    <[u8; 32]>::try_from(bytes.as_slice()).map_err(|_| bad())
}

/// Configuration errors
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// A variable was set to something unparseable
    #[error("{name} has invalid value {value:?}")]
    BadValue {
        /// Variable name
        name: String,
        /// Offending value
        value: String,
    },
    /// Settings parse but cannot work together
    #[error("invalid configuration: {0}")]
    Invalid(String),
}
