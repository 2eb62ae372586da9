//! Configuration management for the Warden runner
//!
//! Sources, lowest precedence first: `conf/application.yml` (optional),
//! `WARDEN_`-prefixed environment variables, then command line flags.

use std::path::PathBuf;
use std::time::Duration;

use clap::{Parser, ValueEnum};
use config::{Config, ConfigError, Environment, File};
use serde::Deserialize;
use serde::de::DeserializeOwned;
use warden_common::{Result, WardenError};
use warden_lock::{LeaseLockOptions, QueueLockOptions};
use warden_ratelimit::{
    FIXED_WINDOW_LIMITER, FixedWindowParams, HYBRID_BUCKET_LIMITER, HybridBucketParams,
    LEAKY_BUCKET_LIMITER, LeakyBucketParams, SLIDING_WINDOW_LIMITER, SlidingWindowParams,
    TOKEN_BUCKET_LIMITER, TokenBucketParams,
};

use crate::logging::LoggingConfig;

pub const DEFAULT_CONFIG_FILE: &str = "conf/application.yml";

/// What the runner does once started
#[derive(Clone, Copy, Debug, PartialEq, Eq, ValueEnum)]
pub enum RunMode {
    /// Concurrent stock deduction under a distributed lock
    Stock,
    /// Fire requests through a named rate limiter
    Limit,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, ValueEnum, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LockKind {
    #[default]
    Lease,
    Queue,
}

impl LockKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            LockKind::Lease => "lease",
            LockKind::Queue => "queue",
        }
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StoreBackend {
    #[default]
    Memory,
    Redis,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CoordinationBackend {
    #[default]
    Memory,
    Zookeeper,
}

/// Command line arguments
#[derive(Debug, Parser)]
#[command(name = "warden-server", version, about)]
pub struct Cli {
    #[arg(value_enum, default_value_t = RunMode::Stock)]
    pub run: RunMode,
    #[arg(short = 'c', long = "config", default_value = DEFAULT_CONFIG_FILE)]
    pub config: PathBuf,
    #[arg(long = "lock", value_enum)]
    pub lock: Option<LockKind>,
    #[arg(short = 'w', long = "workers")]
    pub workers: Option<usize>,
    #[arg(long = "stock")]
    pub stock: Option<i64>,
    #[arg(long = "limiter")]
    pub limiter: Option<String>,
    #[arg(short = 'n', long = "requests")]
    pub requests: Option<u64>,
    #[arg(long = "redis-url", env = "WARDEN_REDIS_URL")]
    pub redis_url: Option<String>,
    #[arg(long = "zk-connect", env = "WARDEN_ZK_CONNECT")]
    pub zk_connect: Option<String>,
}

#[derive(Clone, Debug, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct StoreOptions {
    pub backend: StoreBackend,
    pub redis_url: String,
    /// Expired-key sweep of the memory backend; 0 disables it
    pub reaper_interval_ms: u64,
}

impl Default for StoreOptions {
    fn default() -> Self {
        Self {
            backend: StoreBackend::Memory,
            redis_url: "redis://127.0.0.1:6379".to_string(),
            reaper_interval_ms: 1_000,
        }
    }
}

/// Where queue-ordered locks keep their sequence nodes
#[derive(Clone, Debug, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct CoordinationOptions {
    pub backend: CoordinationBackend,
    /// ZooKeeper connect string, optionally with a chroot suffix
    pub connect: String,
    pub session_timeout_ms: u64,
}

impl Default for CoordinationOptions {
    fn default() -> Self {
        Self {
            backend: CoordinationBackend::Memory,
            connect: "127.0.0.1:2181".to_string(),
            session_timeout_ms: 30_000,
        }
    }
}

impl CoordinationOptions {
    pub fn session_timeout(&self) -> Duration {
        Duration::from_millis(self.session_timeout_ms)
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct StockOptions {
    pub lock: LockKind,
    pub lock_name: String,
    pub key: String,
    pub initial: i64,
    pub workers: usize,
    /// Deductions attempted by each worker
    pub rounds: usize,
}

impl Default for StockOptions {
    fn default() -> Self {
        Self {
            lock: LockKind::Lease,
            lock_name: "stock-lock".to_string(),
            key: "stock:1".to_string(),
            initial: 5_000,
            workers: 50,
            rounds: 20,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct LimitOptions {
    pub limiter: String,
    pub key: String,
    pub requests: u64,
    pub fixed_window: FixedWindowParams,
    pub sliding_window: SlidingWindowParams,
    pub leaky_bucket: LeakyBucketParams,
    pub token_bucket: TokenBucketParams,
    pub hybrid_bucket: HybridBucketParams,
}

impl Default for LimitOptions {
    fn default() -> Self {
        Self {
            limiter: TOKEN_BUCKET_LIMITER.to_string(),
            key: "payment".to_string(),
            requests: 200,
            fixed_window: FixedWindowParams::default(),
            sliding_window: SlidingWindowParams::default(),
            leaky_bucket: LeakyBucketParams::default(),
            token_bucket: TokenBucketParams::default(),
            hybrid_bucket: HybridBucketParams::default(),
        }
    }
}

impl LimitOptions {
    /// Positional arguments for the selected limiter at time `now`
    pub fn args(&self, now: u64) -> Result<Vec<String>> {
        let args = match self.limiter.as_str() {
            FIXED_WINDOW_LIMITER => self.fixed_window.to_args(now),
            SLIDING_WINDOW_LIMITER => self.sliding_window.to_args(now),
            LEAKY_BUCKET_LIMITER => self.leaky_bucket.to_args(now),
            TOKEN_BUCKET_LIMITER => self.token_bucket.to_args(now),
            HYBRID_BUCKET_LIMITER => self.hybrid_bucket.to_args(now),
            other => return Err(WardenError::UnknownLimiter(other.to_string())),
        };
        Ok(args)
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct MetricsOptions {
    pub enabled: bool,
    pub listen: String,
}

impl Default for MetricsOptions {
    fn default() -> Self {
        Self {
            enabled: false,
            listen: "0.0.0.0:9464".to_string(),
        }
    }
}

/// Application configuration loaded from config files and environment
#[derive(Clone, Debug, Default)]
pub struct Configuration {
    pub config: Config,
}

impl Configuration {
    pub fn load(cli: &Cli) -> Result<Self> {
        let mut builder = Config::builder()
            .add_source(File::from(cli.config.clone()).required(false))
            .add_source(
                Environment::with_prefix("WARDEN")
                    .prefix_separator("_")
                    .separator("__")
                    .try_parsing(true),
            );

        if let Some(lock) = cli.lock {
            builder = builder
                .set_override("stock.lock", lock.as_str())
                .map_err(config_error)?;
        }
        if let Some(workers) = cli.workers {
            builder = builder
                .set_override("stock.workers", workers as u64)
                .map_err(config_error)?;
        }
        if let Some(stock) = cli.stock {
            builder = builder
                .set_override("stock.initial", stock)
                .map_err(config_error)?;
        }
        if let Some(limiter) = &cli.limiter {
            builder = builder
                .set_override("limit.limiter", limiter.as_str())
                .map_err(config_error)?;
        }
        if let Some(requests) = cli.requests {
            builder = builder
                .set_override("limit.requests", requests)
                .map_err(config_error)?;
        }
        if let Some(url) = &cli.redis_url {
            builder = builder
                .set_override("store.backend", "redis")
                .and_then(|b| b.set_override("store.redis_url", url.as_str()))
                .map_err(config_error)?;
        }
        if let Some(connect) = &cli.zk_connect {
            builder = builder
                .set_override("coordination.backend", "zookeeper")
                .and_then(|b| b.set_override("coordination.connect", connect.as_str()))
                .map_err(config_error)?;
        }

        let config = builder.build().map_err(config_error)?;
        Ok(Configuration { config })
    }

    /// Typed section, falling back to defaults when absent
    fn section<T: DeserializeOwned + Default>(&self, key: &str) -> Result<T> {
        match self.config.get::<T>(key) {
            Ok(value) => Ok(value),
            Err(ConfigError::NotFound(_)) => Ok(T::default()),
            Err(e) => Err(config_error(e)),
        }
    }

    pub fn store_options(&self) -> Result<StoreOptions> {
        self.section("store")
    }

    pub fn coordination_options(&self) -> Result<CoordinationOptions> {
        let options: CoordinationOptions = self.section("coordination")?;
        if options.session_timeout_ms == 0 {
            return Err(WardenError::IllegalArgument(
                "coordination session timeout must be positive".to_string(),
            ));
        }
        Ok(options)
    }

    pub fn lease_lock_options(&self) -> Result<LeaseLockOptions> {
        let options: LeaseLockOptions = self.section("lock")?;
        options.validate()?;
        Ok(options)
    }

    pub fn queue_lock_options(&self) -> Result<QueueLockOptions> {
        let options: QueueLockOptions = self.section("queue")?;
        options.validate()?;
        Ok(options)
    }

    pub fn stock_options(&self) -> Result<StockOptions> {
        self.section("stock")
    }

    pub fn limit_options(&self) -> Result<LimitOptions> {
        self.section("limit")
    }

    pub fn logging_config(&self) -> Result<LoggingConfig> {
        self.section("logging")
    }

    pub fn metrics_options(&self) -> Result<MetricsOptions> {
        self.section("metrics")
    }
}

fn config_error(e: ConfigError) -> WardenError {
    WardenError::ConfigError(e.to_string())
}
