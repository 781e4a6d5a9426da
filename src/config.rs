use std::env;
use std::str::FromStr;
use std::time::Duration;

use crate::Error;

/// Static configuration for one ring member.
///
/// Read once at process start and never re-read at runtime; changing any of
/// these requires a restart.
#[derive(Debug, Clone)]
pub struct RingConfig {
    /// Stable identifier this instance publishes under. Defaults to
    /// `addr:port`; must be unique across the fleet.
    pub instance_id: String,
    pub instance_addr: String,
    pub instance_port: u16,
    /// Distinct owning instances returned per key.
    pub replication_factor: usize,
    pub heartbeat_interval: Duration,
    /// Heartbeat age beyond which any live peer evicts an entry.
    pub forget_after: Duration,
    /// Ring positions drawn per instance at first registration.
    pub token_count: usize,
    /// Store key under which the shared descriptor lives.
    pub descriptor_key: String,
}

impl RingConfig {
    pub fn new(addr: &str, port: u16) -> Self {
        Self {
            instance_id: format!("{addr}:{port}"),
            instance_addr: addr.to_string(),
            instance_port: port,
            replication_factor: 1,
            heartbeat_interval: Duration::from_secs(5),
            forget_after: Duration::from_secs(60),
            token_count: 128,
            descriptor_key: "cache/ring".to_string(),
        }
    }

    /// Build the configuration from environment variables.
    ///
    /// `INSTANCE_ADDR` and `INSTANCE_PORT` are required; `INSTANCE_ID`,
    /// `REPLICATION_FACTOR`, `HEARTBEAT_INTERVAL_SECS`, `FORGET_AFTER_SECS`,
    /// `TOKEN_COUNT` and `RING_KEY` override the defaults.
    pub fn from_env() -> Result<Self, Error> {
        let addr = env::var("INSTANCE_ADDR")
            .map_err(|_| Error::Config("INSTANCE_ADDR must be set (instance bind address)".into()))?;
        let port: u16 = parsed_var("INSTANCE_PORT")?
            .ok_or_else(|| Error::Config("INSTANCE_PORT must be set (instance port)".into()))?;

        let mut cfg = Self::new(&addr, port);
        if let Ok(id) = env::var("INSTANCE_ID") {
            cfg.instance_id = id;
        }
        if let Some(rf) = parsed_var("REPLICATION_FACTOR")? {
            cfg.replication_factor = rf;
        }
        if let Some(secs) = parsed_var("HEARTBEAT_INTERVAL_SECS")? {
            cfg.heartbeat_interval = Duration::from_secs(secs);
        }
        if let Some(secs) = parsed_var("FORGET_AFTER_SECS")? {
            cfg.forget_after = Duration::from_secs(secs);
        }
        if let Some(count) = parsed_var("TOKEN_COUNT")? {
            cfg.token_count = count;
        }
        if let Ok(key) = env::var("RING_KEY") {
            cfg.descriptor_key = key;
        }

        cfg.validate()?;
        Ok(cfg)
    }

    pub fn validate(&self) -> Result<(), Error> {
        if self.instance_id.is_empty() {
            return Err(Error::Config("instance id must not be empty".into()));
        }
        if self.replication_factor == 0 {
            return Err(Error::Config("replication factor must be at least 1".into()));
        }
        if self.token_count == 0 {
            return Err(Error::Config("token count must be at least 1".into()));
        }
        if self.heartbeat_interval.is_zero() {
            return Err(Error::Config("heartbeat interval must be non-zero".into()));
        }
        if self.forget_after <= self.heartbeat_interval {
            return Err(Error::Config(
                "forget threshold must exceed the heartbeat interval, or every instance looks dead".into(),
            ));
        }
        if self.descriptor_key.is_empty() {
            return Err(Error::Config("descriptor key must not be empty".into()));
        }
        Ok(())
    }

    /// Routing address published in this instance's entry.
    pub fn address(&self) -> String {
        format!("{}:{}", self.instance_addr, self.instance_port)
    }
}

fn parsed_var<T: FromStr>(name: &str) -> Result<Option<T>, Error> {
    match env::var(name) {
        Ok(raw) => raw
            .trim()
            .parse()
            .map(Some)
            .map_err(|_| Error::Config(format!("{name} has an invalid value: {raw}"))),
        Err(_) => Ok(None),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_config_defaults() {
        let cfg = RingConfig::new("10.0.0.1", 9000);
        assert_eq!(cfg.instance_id, "10.0.0.1:9000");
        assert_eq!(cfg.address(), "10.0.0.1:9000");
        assert_eq!(cfg.replication_factor, 1);
        assert_eq!(cfg.token_count, 128);
        assert_eq!(cfg.heartbeat_interval, Duration::from_secs(5));
        assert_eq!(cfg.forget_after, Duration::from_secs(60));
        assert!(cfg.validate().is_ok());
    }

    #[test]
    fn test_config_rejects_zero_replication_factor() {
        let mut cfg = RingConfig::new("10.0.0.1", 9000);
        cfg.replication_factor = 0;
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn test_config_rejects_zero_token_count() {
        let mut cfg = RingConfig::new("10.0.0.1", 9000);
        cfg.token_count = 0;
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn test_config_rejects_forget_within_heartbeat() {
        let mut cfg = RingConfig::new("10.0.0.1", 9000);
        cfg.heartbeat_interval = Duration::from_secs(30);
        cfg.forget_after = Duration::from_secs(30);
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn test_config_rejects_empty_id() {
        let mut cfg = RingConfig::new("10.0.0.1", 9000);
        cfg.instance_id = String::new();
        assert!(cfg.validate().is_err());
    }
}
