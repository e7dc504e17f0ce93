//! YAML configuration. Every field is optional; missing fields take the
//! defaults below.

use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::Deserialize;
use thiserror::Error;

use crate::amount::{Amount, AmountError};
use crate::guard::GuardMode;

pub const DEFAULT_DATA_DIR: &str = "./stakeguard-data";

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("cannot read config file {path}: {source}")]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("cannot parse config file: {0}")]
    Parse(#[from] serde_yaml::Error),

    #[error("invalid amount for {field}: {source}")]
    Amount {
        field: &'static str,
        source: AmountError,
    },

    #[error("invalid config: {0}")]
    Invalid(String),
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct Config {
    pub data_dir: PathBuf,
    pub initial_balance: f64,
    /// Explicit: never inferred from the environment.
    pub guard_mode: GuardMode,
    pub breaker: BreakerConfig,
    pub money: MoneyConfig,
    pub coordinator: CoordinatorConfig,
    pub worker: WorkerConfig,
    pub bus: BusConfig,
    pub balance_poll_secs: u64,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            data_dir: PathBuf::from(DEFAULT_DATA_DIR),
            initial_balance: 1000.0,
            guard_mode: GuardMode::Abort,
            breaker: BreakerConfig::default(),
            money: MoneyConfig::default(),
            coordinator: CoordinatorConfig::default(),
            worker: WorkerConfig::default(),
            bus: BusConfig::default(),
            balance_poll_secs: 60,
        }
    }
}

impl Config {
    /// Load from `path`, or return defaults when no path is given. An
    /// explicit path that cannot be read is an error.
    pub fn load(path: Option<&Path>) -> Result<Self, ConfigError> {
        let config = match path {
            None => Config::default(),
            Some(path) => {
                let text = fs::read_to_string(path).map_err(|source| ConfigError::Io {
                    path: path.to_path_buf(),
                    source,
                })?;
                Self::from_yaml(&text)?
            }
        };
        config.validate()?;
        Ok(config)
    }

    pub fn from_yaml(text: &str) -> Result<Self, ConfigError> {
        // an empty document is valid and means "all defaults"
        if text.trim().is_empty() {
            return Ok(Config::default());
        }
        Ok(serde_yaml::from_str(text)?)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.initial_balance()?.is_negative() {
            return Err(ConfigError::Invalid("initial_balance must not be negative".into()));
        }
        self.money.max_exposure()?;
        self.money.reconcile_tolerance()?;
        if !(self.money.max_stake_fraction > 0.0 && self.money.max_stake_fraction <= 1.0) {
            return Err(ConfigError::Invalid(
                "money.max_stake_fraction must be in (0, 1]".into(),
            ));
        }
        if !self.money.min_odds.is_finite() || self.money.min_odds < 1.0 {
            return Err(ConfigError::Invalid("money.min_odds must be >= 1.0".into()));
        }
        if self.money.reconcile_confirmations == 0 {
            return Err(ConfigError::Invalid(
                "money.reconcile_confirmations must be at least 1".into(),
            ));
        }
        if self.breaker.burst_threshold == 0 || self.breaker.sustained_threshold == 0 {
            return Err(ConfigError::Invalid("breaker thresholds must be at least 1".into()));
        }
        if self.worker.queue_capacity == 0 || self.bus.lane_capacity == 0 {
            return Err(ConfigError::Invalid("queue capacities must be at least 1".into()));
        }
        Ok(())
    }

    pub fn initial_balance(&self) -> Result<Amount, ConfigError> {
        Amount::try_from_f64(self.initial_balance).map_err(|source| ConfigError::Amount {
            field: "initial_balance",
            source,
        })
    }

    pub fn ledger_path(&self) -> PathBuf {
        self.data_dir.join("ledger.db")
    }

    pub fn recovery_log_path(&self) -> PathBuf {
        self.data_dir.join("recovery.log")
    }

    pub fn breaker_state_path(&self) -> PathBuf {
        self.data_dir.join("breaker_state.json")
    }

    /// Held exclusively by the process that owns the data directory.
    pub fn lock_path(&self) -> PathBuf {
        self.data_dir.join("stakeguard.lock")
    }

    pub fn balance_poll_interval(&self) -> Duration {
        Duration::from_secs(self.balance_poll_secs)
    }
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct BreakerConfig {
    pub burst_threshold: usize,
    pub burst_window_secs: u64,
    pub sustained_threshold: usize,
    pub sustained_window_secs: u64,
    pub transient_cooldown_secs: u64,
    pub operational_cooldown_secs: u64,
    pub recoverable_cooldown_secs: u64,
    pub half_open_timeout_secs: u64,
}

impl Default for BreakerConfig {
    fn default() -> Self {
        Self {
            burst_threshold: 3,
            burst_window_secs: 60,
            sustained_threshold: 5,
            sustained_window_secs: 3600,
            transient_cooldown_secs: 60,
            operational_cooldown_secs: 120,
            recoverable_cooldown_secs: 600,
            half_open_timeout_secs: 180,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct MoneyConfig {
    /// Ceiling on the sum of all pending stakes.
    pub max_exposure: f64,
    /// Largest single stake as a fraction of the current bankroll.
    pub max_stake_fraction: f64,
    /// Odds at or below this floor are rejected.
    pub min_odds: f64,
    /// Ledger/external disagreement tolerated without counting.
    pub reconcile_tolerance: f64,
    /// Consecutive disagreements needed before a correction is applied.
    pub reconcile_confirmations: u32,
}

impl Default for MoneyConfig {
    fn default() -> Self {
        Self {
            max_exposure: 200.0,
            max_stake_fraction: 0.2,
            min_odds: 1.01,
            reconcile_tolerance: 0.5,
            reconcile_confirmations: 3,
        }
    }
}

impl MoneyConfig {
    pub fn max_exposure(&self) -> Result<Amount, ConfigError> {
        Amount::try_from_f64(self.max_exposure).map_err(|source| ConfigError::Amount {
            field: "money.max_exposure",
            source,
        })
    }

    pub fn reconcile_tolerance(&self) -> Result<Amount, ConfigError> {
        Amount::try_from_f64(self.reconcile_tolerance).map_err(|source| ConfigError::Amount {
            field: "money.reconcile_tolerance",
            source,
        })
    }
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct CoordinatorConfig {
    /// The deadlock watchdog fires when one operation holds the action
    /// permit longer than this.
    pub max_bet_duration_secs: u64,
    pub watchdog_interval_secs: u64,
    /// Whether the engine accepts signals right after boot.
    pub start_enabled: bool,
}

impl Default for CoordinatorConfig {
    fn default() -> Self {
        Self {
            max_bet_duration_secs: 120,
            watchdog_interval_secs: 5,
            start_enabled: false,
        }
    }
}

impl CoordinatorConfig {
    pub fn max_bet_duration(&self) -> Duration {
        Duration::from_secs(self.max_bet_duration_secs)
    }

    pub fn watchdog_interval(&self) -> Duration {
        Duration::from_secs(self.watchdog_interval_secs.max(1))
    }
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct WorkerConfig {
    pub queue_capacity: usize,
    pub task_timeout_secs: u64,
    /// Live execution threads (including abandoned ones) above which the
    /// process terminates itself.
    pub max_live_threads: usize,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            queue_capacity: 64,
            task_timeout_secs: 90,
            max_live_threads: 20,
        }
    }
}

impl WorkerConfig {
    pub fn task_timeout(&self) -> Duration {
        Duration::from_secs(self.task_timeout_secs)
    }
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct BusConfig {
    pub lane_capacity: usize,
    pub subscriber_capacity: usize,
    pub ttl_ms: u64,
}

impl Default for BusConfig {
    fn default() -> Self {
        Self {
            lane_capacity: 50,
            subscriber_capacity: 64,
            ttl_ms: 15_000,
        }
    }
}

impl BusConfig {
    pub fn ttl(&self) -> Duration {
        Duration::from_millis(self.ttl_ms)
    }
}
