use crate::{lease::DEFAULT_HEARTBEAT_INTERVAL, Error, Result};
use serde::{Deserialize, Serialize};
use std::{env, time::Duration};

/// Shortest lease accepted by default. Expiries have one-second resolution, so
/// anything shorter could be stored as already expired.
pub const DEFAULT_MIN_LOCK_TIMEOUT: Duration = Duration::from_secs(2);

/// Longest accepted renewal cadence.
pub const MAX_HEARTBEAT_INTERVAL: Duration = Duration::from_secs(24 * 60 * 60);

/// What the coordinator does once it can no longer trust its ownership belief.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FatalPolicy {
    /// Log and abort the process.
    #[default]
    Abort,
    /// Log, stop the coordinator and surface the error through the handle.
    Report,
}

impl std::str::FromStr for FatalPolicy {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "abort" => Ok(FatalPolicy::Abort),
            "report" => Ok(FatalPolicy::Report),
            other => Err(Error::InvalidConfig(format!("unknown fatal policy {other:?}"))),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct LockerConfig {
    pub table_name: String,
    /// Renewal cadence when no held lock needs a faster one.
    #[serde(with = "secs")]
    pub heartbeat_interval: Duration,
    #[serde(with = "secs")]
    pub min_lock_timeout: Duration,
    pub fatal_policy: FatalPolicy,
}

impl Default for LockerConfig {
    fn default() -> Self {
        Self {
            table_name: "locks".to_string(),
            heartbeat_interval: DEFAULT_HEARTBEAT_INTERVAL,
            min_lock_timeout: DEFAULT_MIN_LOCK_TIMEOUT,
            fatal_policy: FatalPolicy::default(),
        }
    }
}

impl LockerConfig {
    pub fn new(table_name: impl Into<String>) -> Self {
        Self {
            table_name: table_name.into(),
            ..Self::default()
        }
    }

    #[must_use]
    pub fn with_heartbeat_interval(mut self, interval: Duration) -> Self {
        self.heartbeat_interval = interval;
        self
    }

    #[must_use]
    pub fn with_fatal_policy(mut self, policy: FatalPolicy) -> Self {
        self.fatal_policy = policy;
        self
    }

    #[must_use]
    pub fn with_min_lock_timeout(mut self, timeout: Duration) -> Self {
        self.min_lock_timeout = timeout;
        self
    }

    /// Defaults overridden by `LOCKER_TABLE`, `LOCKER_HEARTBEAT_SECS`,
    /// `LOCKER_MIN_TIMEOUT_SECS` and `LOCKER_FATAL_POLICY`.
    pub fn from_env() -> Result<Self> {
        let mut config = Self::default();
        if let Ok(table) = env::var("LOCKER_TABLE") {
            config.table_name = table;
        }
        if let Ok(secs) = env::var("LOCKER_HEARTBEAT_SECS") {
            config.heartbeat_interval = parse_secs("LOCKER_HEARTBEAT_SECS", &secs)?;
        }
        if let Ok(secs) = env::var("LOCKER_MIN_TIMEOUT_SECS") {
            config.min_lock_timeout = parse_secs("LOCKER_MIN_TIMEOUT_SECS", &secs)?;
        }
        if let Ok(policy) = env::var("LOCKER_FATAL_POLICY") {
            config.fatal_policy = policy.parse()?;
        }
        config.validate()?;
        Ok(config)
    }

    pub fn from_json(json: &str) -> Result<Self> {
        let config: Self = serde_json::from_str(json)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.table_name.is_empty() {
            return Err(Error::InvalidConfig("table name is empty".to_string()));
        }
        if self.heartbeat_interval.is_zero() {
            return Err(Error::InvalidConfig(
                "heartbeat interval must be positive".to_string(),
            ));
        }
        if self.heartbeat_interval > MAX_HEARTBEAT_INTERVAL {
            return Err(Error::InvalidConfig(format!(
                "heartbeat interval {:?} is above {:?}",
                self.heartbeat_interval, MAX_HEARTBEAT_INTERVAL
            )));
        }
        if self.min_lock_timeout < DEFAULT_MIN_LOCK_TIMEOUT {
            return Err(Error::InvalidConfig(format!(
                "minimum lock timeout {:?} is below {:?}",
                self.min_lock_timeout, DEFAULT_MIN_LOCK_TIMEOUT
            )));
        }
        Ok(())
    }
}

fn parse_secs(var: &str, value: &str) -> Result<Duration> {
    value
        .trim()
        .parse::<u64>()
        .map(Duration::from_secs)
        .map_err(|e| Error::InvalidConfig(format!("{var}={value:?}: {e}")))
}

mod secs {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u64(value.as_secs())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        u64::deserialize(deserializer).map(Duration::from_secs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_are_valid() {
        let config = LockerConfig::default();
        assert_eq!(config.heartbeat_interval, Duration::from_secs(60));
        assert_eq!(config.fatal_policy, FatalPolicy::Abort);
        config.validate().unwrap();
    }

    #[test]
    fn test_from_json_fills_missing_fields() {
        let config =
            LockerConfig::from_json(r#"{"table_name": "jobs", "fatal_policy": "report"}"#).unwrap();
        assert_eq!(config.table_name, "jobs");
        assert_eq!(config.fatal_policy, FatalPolicy::Report);
        assert_eq!(config.heartbeat_interval, DEFAULT_HEARTBEAT_INTERVAL);

        let config = LockerConfig::from_json(r#"{"heartbeat_interval": 15}"#).unwrap();
        assert_eq!(config.heartbeat_interval, Duration::from_secs(15));
    }

    #[test]
    fn test_validate_rejects_bad_values() {
        assert!(LockerConfig::new("").validate().is_err());
        assert!(LockerConfig::new("locks")
            .with_heartbeat_interval(Duration::ZERO)
            .validate()
            .is_err());
        assert!(LockerConfig::new("locks")
            .with_heartbeat_interval(Duration::from_secs(u64::MAX))
            .validate()
            .is_err());
        assert!(LockerConfig::new("locks")
            .with_heartbeat_interval(MAX_HEARTBEAT_INTERVAL)
            .validate()
            .is_ok());
        assert!(matches!(
            LockerConfig::from_json(r#"{"heartbeat_interval": 18446744073709551615}"#),
            Err(Error::InvalidConfig(_))
        ));
        assert!(LockerConfig::new("locks")
            .with_min_lock_timeout(Duration::from_secs(1))
            .validate()
            .is_err());
        assert!(matches!(
            LockerConfig::from_json(r#"{"table_name": 5}"#),
            Err(Error::Serialization(_))
        ));
    }

    #[test]
    fn test_fatal_policy_parses() {
        assert_eq!("Report".parse::<FatalPolicy>().unwrap(), FatalPolicy::Report);
        assert_eq!(" abort ".parse::<FatalPolicy>().unwrap(), FatalPolicy::Abort);
        assert!("panic".parse::<FatalPolicy>().is_err());
    }
}
