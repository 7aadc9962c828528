use std::path::PathBuf;
use std::time;

use envconfig::Envconfig;
use stream_common::backoff::BackoffPolicy;
use stream_common::config::{megabytes, EnvMsDuration, NonEmptyString};

use crate::error::ReaderError;

#[derive(Envconfig, Clone)]
pub struct Config {
    #[envconfig(from = "BIND_HOST", default = "0.0.0.0")]
    pub host: String,

    #[envconfig(from = "BIND_PORT", default = "3310")]
    pub port: u16,

    #[envconfig(
        from = "STREAM_URL",
        default = "https://stream.wikimedia.org/v2/stream/recentchange"
    )]
    pub stream_url: String,

    #[envconfig(from = "CLIENT_NAME")]
    pub client_name: NonEmptyString,

    #[envconfig(from = "CLIENT_CONTACT")]
    pub client_contact: NonEmptyString,

    #[envconfig(from = "DATA_DIR", default = "./data")]
    pub data_dir: PathBuf,

    #[envconfig(from = "RAW_PREFIX", default = "raw")]
    pub raw_prefix: NonEmptyString,

    #[envconfig(from = "MAX_FILE_MB", default = "128")]
    pub max_file_mb: u64,

    #[envconfig(from = "ROTATION_CHECK_EVERY", default = "100")]
    pub rotation_check_every: u64,

    #[envconfig(from = "WRITE_RETRIES", default = "3")]
    pub write_retries: u32,

    #[envconfig(from = "CONNECT_TIMEOUT", default = "10000")]
    pub connect_timeout: EnvMsDuration,

    #[envconfig(from = "READ_STALL_TIMEOUT", default = "60000")]
    pub read_stall_timeout: EnvMsDuration,

    #[envconfig(from = "PROGRESS_LOG_EVERY", default = "1000")]
    pub progress_log_every: u64,

    #[envconfig(nested = true)]
    pub backoff: BackoffConfig,
}

#[derive(Envconfig, Clone)]
pub struct BackoffConfig {
    #[envconfig(from = "BACKOFF_BASE", default = "1000")]
    pub base: EnvMsDuration,

    #[envconfig(from = "BACKOFF_MAX", default = "30000")]
    pub max: EnvMsDuration,

    #[envconfig(from = "BACKOFF_JITTER", default = "0.2")]
    pub jitter: f64,
}

impl Config {
    /// Produce a host:port address for binding a TcpListener.
    pub fn bind(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    /// Semantic checks that the environment parser cannot express.
    pub fn validate(&self) -> Result<(), ReaderError> {
        self.stream_url()?;

        if self.max_file_mb == 0 {
            return Err(ReaderError::Configuration(
                "MAX_FILE_MB must be positive".to_owned(),
            ));
        }
        if !(0.0..=1.0).contains(&self.backoff.jitter) {
            return Err(ReaderError::Configuration(format!(
                "BACKOFF_JITTER must be within [0, 1], got {}",
                self.backoff.jitter
            )));
        }
        if self.backoff.base.0.is_zero() || self.backoff.max.0 < self.backoff.base.0 {
            return Err(ReaderError::Configuration(
                "BACKOFF_BASE must be positive and not above BACKOFF_MAX".to_owned(),
            ));
        }
        if self.read_stall_timeout.0.is_zero() {
            return Err(ReaderError::Configuration(
                "READ_STALL_TIMEOUT must be positive".to_owned(),
            ));
        }
        Ok(())
    }

    pub fn stream_url(&self) -> Result<url::Url, ReaderError> {
        let url = url::Url::parse(&self.stream_url).map_err(|e| {
            ReaderError::Configuration(format!("invalid STREAM_URL {:?}: {}", self.stream_url, e))
        })?;

        match url.scheme() {
            "http" | "https" => Ok(url),
            scheme => Err(ReaderError::Configuration(format!(
                "STREAM_URL scheme must be http or https, got {}",
                scheme
            ))),
        }
    }

    /// Identify ourselves to the stream operator, who may require a way to reach us.
    pub fn user_agent(&self) -> String {
        format!(
            "{} ({})",
            self.client_name.as_str(),
            self.client_contact.as_str()
        )
    }

    pub fn backoff_policy(&self) -> BackoffPolicy {
        BackoffPolicy::new(self.backoff.base.0, self.backoff.max.0).with_jitter(self.backoff.jitter)
    }

    pub fn max_file_bytes(&self) -> u64 {
        megabytes(self.max_file_mb)
    }

    /// The reader loop must report at least once per stall timeout plus the longest backoff.
    pub fn liveness_deadline(&self) -> time::Duration {
        self.read_stall_timeout.0 + self.connect_timeout.0 + self.backoff.max.0
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use super::*;

    fn env(pairs: &[(&str, &str)]) -> HashMap<String, String> {
        let mut env: HashMap<String, String> = [
            ("CLIENT_NAME", "ingest-test"),
            ("CLIENT_CONTACT", "ops@example.com"),
        ]
        .iter()
        .map(|(k, v)| (k.to_string(), v.to_string()))
        .collect();
        for (k, v) in pairs {
            env.insert(k.to_string(), v.to_string());
        }
        env
    }

    #[test]
    fn test_defaults() {
        let config = Config::init_from_hashmap(&env(&[])).unwrap();

        assert!(config.validate().is_ok());
        assert_eq!(config.bind(), "0.0.0.0:3310");
        assert_eq!(config.user_agent(), "ingest-test (ops@example.com)");
        assert_eq!(config.max_file_bytes(), 128 * 1024 * 1024);
        assert_eq!(config.backoff.base.0, time::Duration::from_secs(1));
        assert_eq!(config.backoff.max.0, time::Duration::from_secs(30));
        assert_eq!(config.raw_prefix.as_str(), "raw");
    }

    #[test]
    fn test_client_identity_is_required() {
        let mut vars = env(&[]);
        vars.remove("CLIENT_CONTACT");
        assert!(Config::init_from_hashmap(&vars).is_err());

        assert!(Config::init_from_hashmap(&env(&[("CLIENT_NAME", "  ")])).is_err());
    }

    #[test]
    fn test_rejects_bad_urls() {
        let config = Config::init_from_hashmap(&env(&[("STREAM_URL", "not a url")])).unwrap();
        assert!(matches!(
            config.validate(),
            Err(ReaderError::Configuration(_))
        ));

        let config =
            Config::init_from_hashmap(&env(&[("STREAM_URL", "ftp://example.com/feed")])).unwrap();
        assert!(matches!(
            config.validate(),
            Err(ReaderError::Configuration(_))
        ));
    }

    #[test]
    fn test_rejects_bad_backoff() {
        let config = Config::init_from_hashmap(&env(&[("BACKOFF_JITTER", "1.5")])).unwrap();
        assert!(config.validate().is_err());

        let config = Config::init_from_hashmap(&env(&[
            ("BACKOFF_BASE", "5000"),
            ("BACKOFF_MAX", "1000"),
        ]))
        .unwrap();
        assert!(config.validate().is_err());
    }
}
