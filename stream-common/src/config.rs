use std::str::FromStr;
use std::time;

use thiserror::Error;

/// A duration read from the environment as a number of milliseconds.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EnvMsDuration(pub time::Duration);

#[derive(Error, Debug, PartialEq, Eq)]
#[error("{0:?} is not a duration in milliseconds")]
pub struct ParseEnvMsDurationError(String);

impl FromStr for EnvMsDuration {
    type Err = ParseEnvMsDurationError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let ms = s
            .trim()
            .parse::<u64>()
            .map_err(|_| ParseEnvMsDurationError(s.to_owned()))?;

        Ok(EnvMsDuration(time::Duration::from_millis(ms)))
    }
}

/// A string setting that must carry something other than whitespace.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NonEmptyString(pub String);

impl NonEmptyString {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

#[derive(Error, Debug, PartialEq, Eq)]
#[error("value must not be empty")]
pub struct StringIsEmptyError;

impl FromStr for NonEmptyString {
    type Err = StringIsEmptyError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let trimmed = s.trim();
        if trimmed.is_empty() {
            Err(StringIsEmptyError)
        } else {
            Ok(NonEmptyString(trimmed.to_owned()))
        }
    }
}

/// Convert a size limit expressed in megabytes to bytes.
pub fn megabytes(mb: u64) -> u64 {
    mb.saturating_mul(1024 * 1024)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_ms_duration() {
        assert_eq!(
            "1500".parse::<EnvMsDuration>(),
            Ok(EnvMsDuration(time::Duration::from_millis(1500)))
        );
        assert!("1.5s".parse::<EnvMsDuration>().is_err());
        assert!("".parse::<EnvMsDuration>().is_err());
    }

    #[test]
    fn test_non_empty_string_rejects_blank() {
        assert_eq!("  ".parse::<NonEmptyString>(), Err(StringIsEmptyError));
        assert_eq!(
            " bot ".parse::<NonEmptyString>().map(|s| s.0),
            Ok("bot".to_owned())
        );
    }

    #[test]
    fn test_megabytes() {
        assert_eq!(megabytes(128), 134_217_728);
        assert_eq!(megabytes(u64::MAX), u64::MAX);
    }
}
