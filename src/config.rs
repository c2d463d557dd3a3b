use serde::{Deserialize, Serialize};
use std::{fs::File, io::BufReader, path::Path, time::Duration};
use thiserror::Error;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SystemConfig {
    #[serde(default)]
    pub dispatch: DispatchConfig,

    #[serde(default)]
    pub circuit_breaker: CircuitBreakerConfig,

    #[serde(default)]
    pub session: SessionConfig,
}

/// Delivery and retry parameters for the event bus.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct DispatchConfig {
    #[serde(default = "default_handler_timeout", with = "duration_ms")]
    pub handler_timeout: Duration,

    /// Total handler invocations allowed per (event, subscriber), first attempt included
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,

    #[serde(default = "default_base_backoff", with = "duration_ms")]
    pub base_backoff: Duration,

    #[serde(default = "default_max_backoff", with = "duration_ms")]
    pub max_backoff: Duration,

    #[serde(default = "default_max_jitter", with = "duration_ms")]
    pub max_jitter: Duration,

    #[serde(default = "default_retry_poll_interval", with = "duration_ms")]
    pub retry_poll_interval: Duration,

    /// Dead letters kept for inspection; the oldest are evicted first
    #[serde(default = "default_dead_letter_capacity")]
    pub dead_letter_capacity: usize,
}

impl Default for DispatchConfig {
    fn default() -> Self {
        Self {
            handler_timeout: default_handler_timeout(),
            max_attempts: default_max_attempts(),
            base_backoff: default_base_backoff(),
            max_backoff: default_max_backoff(),
            max_jitter: default_max_jitter(),
            retry_poll_interval: default_retry_poll_interval(),
            dead_letter_capacity: default_dead_letter_capacity(),
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq)]
pub struct CircuitBreakerConfig {
    #[serde(default = "default_failure_threshold")]
    pub failure_threshold: u32,

    #[serde(default = "default_cool_down_duration", with = "duration_ms")]
    pub cool_down_duration: Duration,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: default_failure_threshold(),
            cool_down_duration: default_cool_down_duration(),
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq)]
pub struct SessionConfig {
    #[serde(default = "default_session_ttl", with = "duration_ms")]
    pub session_ttl: Duration,

    #[serde(default = "default_cleanup_interval", with = "duration_ms")]
    pub cleanup_interval: Duration,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            session_ttl: default_session_ttl(),
            cleanup_interval: default_cleanup_interval(),
        }
    }
}

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Failed to read config file: {0}")]
    Io(#[from] std::io::Error),
    #[error("Failed to parse config: {0}")]
    Parse(#[from] serde_json::Error),
    #[error("Invalid config value `{field}`: {message}")]
    Invalid {
        field: &'static str,
        message: String,
    },
}

pub type ConfigResult<T> = Result<T, ConfigError>;

pub fn from_file<T: for<'de> Deserialize<'de>, P: AsRef<Path>>(path: P) -> ConfigResult<T> {
    let file = File::open(path)?;
    let reader = BufReader::new(file);
    Ok(serde_json::from_reader(reader)?)
}

pub fn from_str<T: for<'de> Deserialize<'de>>(s: &str) -> ConfigResult<T> {
    Ok(serde_json::from_str(s)?)
}

// デフォルト値の定義
fn default_handler_timeout() -> Duration {
    Duration::from_secs(30)
}
fn default_max_attempts() -> u32 {
    5
}
fn default_base_backoff() -> Duration {
    Duration::from_millis(500)
}
fn default_max_backoff() -> Duration {
    Duration::from_secs(30)
}
fn default_max_jitter() -> Duration {
    Duration::from_millis(250)
}
fn default_retry_poll_interval() -> Duration {
    Duration::from_millis(100)
}
fn default_dead_letter_capacity() -> usize {
    1000
}
fn default_failure_threshold() -> u32 {
    5
}
fn default_cool_down_duration() -> Duration {
    Duration::from_secs(30)
}
fn default_session_ttl() -> Duration {
    Duration::from_secs(30 * 60)
}
fn default_cleanup_interval() -> Duration {
    Duration::from_secs(60)
}

// Duration型のシリアライズ/デシリアライズヘルパー
pub(crate) mod duration_ms {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_u64(duration.as_millis() as u64)
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let millis = u64::deserialize(deserializer)?;
        Ok(Duration::from_millis(millis))
    }
}

impl Default for SystemConfig {
    fn default() -> Self {
        Self {
            dispatch: DispatchConfig::default(),
            circuit_breaker: CircuitBreakerConfig::default(),
            session: SessionConfig::default(),
        }
    }
}

impl SystemConfig {
    pub fn from_file<P: AsRef<Path>>(path: P) -> ConfigResult<Self> {
        let config: Self = from_file(path)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> ConfigResult<()> {
        let invalid = |field, message: &str| {
            Err(ConfigError::Invalid {
                field,
                message: message.to_string(),
            })
        };
        if self.dispatch.max_attempts == 0 {
            return invalid("dispatch.max_attempts", "must be at least 1");
        }
        if self.dispatch.handler_timeout.is_zero() {
            return invalid("dispatch.handler_timeout", "must be greater than 0");
        }
        if self.dispatch.retry_poll_interval.is_zero() {
            return invalid("dispatch.retry_poll_interval", "must be greater than 0");
        }
        if self.dispatch.base_backoff > self.dispatch.max_backoff {
            return invalid("dispatch.base_backoff", "must not exceed max_backoff");
        }
        if self.circuit_breaker.failure_threshold == 0 {
            return invalid("circuit_breaker.failure_threshold", "must be at least 1");
        }
        if self.session.cleanup_interval.is_zero() {
            return invalid("session.cleanup_interval", "must be greater than 0");
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_defaults_are_valid() {
        let config = SystemConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.dispatch.max_attempts, 5);
        assert_eq!(config.session.session_ttl, Duration::from_secs(1800));
    }

    #[test]
    fn test_partial_json_uses_defaults() {
        let config: SystemConfig = from_str(
            r#"{
                "dispatch": { "max_attempts": 3, "base_backoff": 100 },
                "session": { "session_ttl": 60000 }
            }"#,
        )
        .unwrap();

        assert_eq!(config.dispatch.max_attempts, 3);
        assert_eq!(config.dispatch.base_backoff, Duration::from_millis(100));
        assert_eq!(config.dispatch.max_backoff, default_max_backoff());
        assert_eq!(config.session.session_ttl, Duration::from_secs(60));
        assert_eq!(config.circuit_breaker, CircuitBreakerConfig::default());
    }

    #[test]
    fn test_durations_round_trip_as_millis() {
        let config = SystemConfig::default();
        let json = serde_json::to_value(&config).unwrap();
        assert_eq!(json["circuit_breaker"]["cool_down_duration"], 30_000);
        assert_eq!(json["session"]["cleanup_interval"], 60_000);
    }

    #[test]
    fn test_dead_letter_capacity_is_the_only_buffer_knob() {
        let config: SystemConfig =
            from_str(r#"{ "dispatch": { "dead_letter_capacity": 25 } }"#).unwrap();
        assert_eq!(config.dispatch.dead_letter_capacity, 25);
        assert_eq!(SystemConfig::default().dispatch.dead_letter_capacity, 1000);

        let json = serde_json::to_value(&config).unwrap();
        assert_eq!(json.as_object().unwrap().len(), 3);
        assert!(json.get("event_buffer_size").is_none());
    }

    #[test]
    fn test_huge_durations_are_accepted() {
        let config: SystemConfig = from_str(
            r#"{ "circuit_breaker": { "failure_threshold": 1, "cool_down_duration": 18446744073709551615 } }"#,
        )
        .unwrap();
        assert!(config.validate().is_ok());
        assert_eq!(
            config.circuit_breaker.cool_down_duration,
            Duration::from_millis(u64::MAX)
        );
    }

    #[test]
    fn test_validation_rejects_zero_attempts() {
        let mut config = SystemConfig::default();
        config.dispatch.max_attempts = 0;
        assert!(matches!(
            config.validate(),
            Err(ConfigError::Invalid {
                field: "dispatch.max_attempts",
                ..
            })
        ));
    }

    #[test]
    fn test_validation_rejects_inverted_backoff() {
        let mut config = SystemConfig::default();
        config.dispatch.base_backoff = Duration::from_secs(60);
        config.dispatch.max_backoff = Duration::from_secs(1);
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_missing_file() {
        let result = SystemConfig::from_file("does/not/exist.json");
        assert!(matches!(result, Err(ConfigError::Io(_))));
    }
}
