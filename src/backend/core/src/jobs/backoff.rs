//! Retry delay computation.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use crate::error::{Result, SubmitqError};

/// Strategy for calculating retry delays.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BackoffType {
    /// Same delay before every retry
    #[default]
    Fixed,
    /// Delay doubles with every failed attempt
    Exponential,
}

impl BackoffType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Fixed => "fixed",
            Self::Exponential => "exponential",
        }
    }
}

impl fmt::Display for BackoffType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for BackoffType {
    type Err = SubmitqError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "fixed" => Ok(Self::Fixed),
            "exponential" => Ok(Self::Exponential),
            other => Err(SubmitqError::validation(format!(
                "Unknown backoff type {:?}, expected one of [fixed, exponential]",
                other
            ))),
        }
    }
}

/// Backoff type plus base delay.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct BackoffPolicy {
    pub backoff_type: BackoffType,
    pub delay_ms: u64,
}

impl BackoffPolicy {
    pub fn new(backoff_type: BackoffType, delay_ms: u64) -> Self {
        Self {
            backoff_type,
            delay_ms,
        }
    }

    pub fn fixed(delay_ms: u64) -> Self {
        Self::new(BackoffType::Fixed, delay_ms)
    }

    pub fn exponential(delay_ms: u64) -> Self {
        Self::new(BackoffType::Exponential, delay_ms)
    }

    /// Delay before retrying after `attempts_made` attempts (1-indexed).
    ///
    /// Exponential growth is uncapped; it saturates at `u64::MAX` milliseconds
    /// instead of overflowing. A ceiling is expressed through `max_attempts`.
    pub fn delay_for_attempt(&self, attempts_made: u32) -> Duration {
        let ms = match self.backoff_type {
            BackoffType::Fixed => self.delay_ms,
            BackoffType::Exponential => {
                let exponent = attempts_made.saturating_sub(1);
                self.delay_ms.saturating_mul(2u64.saturating_pow(exponent))
            }
        };
        Duration::from_millis(ms)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_backoff_fixed() {
        let backoff = BackoffPolicy::fixed(3000);
        assert_eq!(backoff.delay_for_attempt(1), Duration::from_millis(3000));
        assert_eq!(backoff.delay_for_attempt(4), Duration::from_millis(3000));
    }

    #[test]
    fn test_backoff_exponential() {
        let backoff = BackoffPolicy::exponential(100);
        assert_eq!(backoff.delay_for_attempt(1), Duration::from_millis(100));
        assert_eq!(backoff.delay_for_attempt(2), Duration::from_millis(200));
        assert_eq!(backoff.delay_for_attempt(3), Duration::from_millis(400));
        assert_eq!(backoff.delay_for_attempt(5), Duration::from_millis(1600));
    }

    #[test]
    fn test_backoff_exponential_saturates() {
        let backoff = BackoffPolicy::exponential(1000);
        assert_eq!(backoff.delay_for_attempt(200), Duration::from_millis(u64::MAX));
    }

    #[test]
    fn test_backoff_type_parse() {
        assert_eq!("fixed".parse::<BackoffType>().unwrap(), BackoffType::Fixed);
        assert_eq!(
            "exponential".parse::<BackoffType>().unwrap(),
            BackoffType::Exponential
        );
        assert!("jitter".parse::<BackoffType>().is_err());
    }
}
