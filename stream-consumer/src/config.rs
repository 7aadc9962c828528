use std::path::PathBuf;
use std::str::FromStr;
use std::time;

use envconfig::Envconfig;
use stream_common::config::{megabytes, EnvMsDuration, NonEmptyString};
use thiserror::Error;

use crate::error::ConsumerError;
use crate::rebuild::RebuildPolicy;
use crate::tailer::TailerOptions;

#[derive(Envconfig, Clone)]
pub struct Config {
    #[envconfig(from = "BIND_HOST", default = "0.0.0.0")]
    pub host: String,

    #[envconfig(from = "BIND_PORT", default = "3311")]
    pub port: u16,

    #[envconfig(from = "DATA_DIR", default = "./data")]
    pub data_dir: PathBuf,

    #[envconfig(from = "RAW_PREFIX", default = "raw")]
    pub raw_prefix: NonEmptyString,

    #[envconfig(from = "OUTPUT_DIR")]
    pub output_dir: Option<PathBuf>,

    #[envconfig(from = "OUTPUT_PREFIX", default = "processed")]
    pub output_prefix: NonEmptyString,

    #[envconfig(from = "OUTPUT_MAX_FILE_MB", default = "128")]
    pub output_max_file_mb: u64,

    #[envconfig(from = "ROTATION_CHECK_EVERY", default = "1000")]
    pub rotation_check_every: u64,

    #[envconfig(from = "WRITE_RETRIES", default = "3")]
    pub write_retries: u32,

    #[envconfig(from = "METRICS_FILE")]
    pub metrics_file: Option<PathBuf>,

    #[envconfig(from = "METRICS_INTERVAL", default = "10000")]
    pub metrics_interval: EnvMsDuration,

    #[envconfig(from = "ERROR_RATE_WARN_THRESHOLD", default = "0.01")]
    pub error_rate_warn_threshold: f64,

    #[envconfig(nested = true)]
    pub tail: TailConfig,

    #[envconfig(nested = true)]
    pub membership: MembershipConfig,

    #[envconfig(from = "WORKERS", default = "1")]
    pub workers: usize,

    #[envconfig(from = "QUEUE_CAPACITY", default = "10000")]
    pub queue_capacity: usize,
}

#[derive(Envconfig, Clone)]
pub struct TailConfig {
    #[envconfig(from = "POLL_INTERVAL", default = "200")]
    pub poll_interval: EnvMsDuration,

    #[envconfig(from = "EMPTY_POLLS_BEFORE_RESOLVE", default = "10")]
    pub empty_polls_before_resolve: u32,

    #[envconfig(from = "MISSING_FILE_DELAY", default = "200")]
    pub missing_file_delay: EnvMsDuration,
}

#[derive(Envconfig, Clone)]
pub struct MembershipConfig {
    #[envconfig(from = "MEMBERSHIP_BACKEND", default = "memory")]
    pub backend: MembershipBackend,

    #[envconfig(from = "REDIS_URL", default = "redis://localhost:6379/")]
    pub redis_url: String,

    #[envconfig(from = "REDIS_CONNECT_TIMEOUT", default = "2000")]
    pub redis_connect_timeout: EnvMsDuration,

    #[envconfig(from = "MEMBERSHIP_KEY_PREFIX", default = "dedup:")]
    pub key_prefix: String,

    #[envconfig(from = "MEMBERSHIP_TTL_SECS", default = "604800")]
    pub ttl_secs: u64,

    #[envconfig(from = "MEMBERSHIP_HIGH_WATER", default = "1000000")]
    pub high_water: usize,

    #[envconfig(from = "MEMBERSHIP_EVICT_FRACTION", default = "0.2")]
    pub evict_fraction: f64,

    #[envconfig(from = "MEMBERSHIP_REBUILD", default = "empty")]
    pub rebuild: RebuildPolicy,

    #[envconfig(from = "STORE_RETRIES", default = "3")]
    pub store_retries: u32,

    #[envconfig(from = "STORE_RETRY_DELAY", default = "100")]
    pub store_retry_delay: EnvMsDuration,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MembershipBackend {
    Memory,
    Redis,
}

#[derive(Error, Debug, PartialEq, Eq)]
#[error("unknown membership backend {0:?}, expected memory or redis")]
pub struct ParseMembershipBackendError(String);

impl FromStr for MembershipBackend {
    type Err = ParseMembershipBackendError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "memory" => Ok(MembershipBackend::Memory),
            "redis" => Ok(MembershipBackend::Redis),
            _ => Err(ParseMembershipBackendError(s.to_owned())),
        }
    }
}

impl Config {
    /// Produce a host:port address for binding a TcpListener.
    pub fn bind(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    pub fn validate(&self) -> Result<(), ConsumerError> {
        let invalid = |message: &str| Err(ConsumerError::Configuration(message.to_owned()));

        if self.output_max_file_mb == 0 {
            return invalid("OUTPUT_MAX_FILE_MB must be positive");
        }
        if self.workers == 0 || self.queue_capacity == 0 {
            return invalid("WORKERS and QUEUE_CAPACITY must be positive");
        }
        if self.membership.high_water == 0 {
            return invalid("MEMBERSHIP_HIGH_WATER must be positive");
        }
        let fraction = self.membership.evict_fraction;
        if !(fraction > 0.0 && fraction <= 1.0) {
            return invalid("MEMBERSHIP_EVICT_FRACTION must be within (0, 1]");
        }
        if !(0.0..=1.0).contains(&self.error_rate_warn_threshold) {
            return invalid("ERROR_RATE_WARN_THRESHOLD must be within [0, 1]");
        }
        if self.metrics_interval.0.is_zero() || self.tail.poll_interval.0.is_zero() {
            return invalid("METRICS_INTERVAL and POLL_INTERVAL must be positive");
        }
        if self.membership.backend == MembershipBackend::Redis {
            if self.membership.redis_connect_timeout.0.is_zero() {
                return invalid("REDIS_CONNECT_TIMEOUT must be positive");
            }
            redis::Client::open(self.membership.redis_url.as_str()).map_err(|e| {
                ConsumerError::Configuration(format!(
                    "invalid REDIS_URL {:?}: {}",
                    self.membership.redis_url, e
                ))
            })?;
        }
        Ok(())
    }

    /// Where processed records go. Defaults to the raw log directory.
    pub fn output_dir(&self) -> PathBuf {
        self.output_dir
            .clone()
            .unwrap_or_else(|| self.data_dir.clone())
    }

    pub fn metrics_file(&self) -> PathBuf {
        self.metrics_file
            .clone()
            .unwrap_or_else(|| self.data_dir.join("consumer_metrics.jsonl"))
    }

    pub fn output_max_file_bytes(&self) -> u64 {
        megabytes(self.output_max_file_mb)
    }

    pub fn tailer_options(&self) -> TailerOptions {
        TailerOptions {
            poll_interval: self.tail.poll_interval.0,
            empty_polls_before_resolve: self.tail.empty_polls_before_resolve.max(1),
            missing_file_delay: self.tail.missing_file_delay.0,
        }
    }

    pub fn membership_ttl(&self) -> time::Duration {
        time::Duration::from_secs(self.membership.ttl_secs)
    }

    /// The tailer reports on every poll; allow for a slow read or a stalled store.
    pub fn tailer_liveness_deadline(&self) -> time::Duration {
        let retries = self.membership.store_retry_delay.0 * (self.membership.store_retries + 1);
        (self.tail.poll_interval.0 + self.tail.missing_file_delay.0) * 10 + retries
    }

    pub fn reporter_liveness_deadline(&self) -> time::Duration {
        self.metrics_interval.0 * 3
    }
}
