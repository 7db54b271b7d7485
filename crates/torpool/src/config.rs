//! Pool configuration
//!
//! [`PoolConfig`] is built once, before the pool is opened, and is read-only
//! afterwards. Every field has a `with_*` builder and most can be set from
//! the environment through [`PoolConfig::from_env`].

use std::net::{IpAddr, Ipv4Addr};
use std::ops::RangeInclusive;
use std::path::PathBuf;
use std::time::Duration;

use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::error::{PoolError, Result};
use crate::retry::RetryPolicy;

/// Token printed by `tor --hash-password`: `16:` followed by salt, count and digest
pub const DEFAULT_HASH_PATTERN: &str = "16:[0-9A-Fa-f]{58}";

/// Stdout line fragment Tor prints once it can build circuits
pub const DEFAULT_READY_MARKER: &str = "Bootstrapped 100%";

/// Configuration for a [`TorPool`](crate::TorPool)
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PoolConfig {
    /// Path to the Tor executable
    pub tor_binary: PathBuf,

    /// Number of daemons to run
    pub instances: usize,

    /// Loopback address every endpoint binds to
    pub host: IpAddr,

    /// Directory holding one private data directory per instance
    pub data_root: PathBuf,

    /// Shortest generated control password
    pub min_password_length: usize,

    /// Longest generated control password
    pub max_password_length: usize,

    /// Regex locating the hashed password in `--hash-password` output
    pub hash_pattern: String,

    /// Stdout fragment marking a daemon as ready
    pub ready_marker: String,

    /// How long a daemon may take to become ready
    #[serde(with = "duration_millis")]
    pub bootstrap_timeout: Duration,

    /// Bound on each control-channel reply
    #[serde(with = "duration_millis")]
    pub control_timeout: Duration,

    /// Cooldown after NEWNYM when the daemon reports no delay of its own
    #[serde(with = "duration_millis")]
    pub newnym_interval: Duration,

    /// Leave data directories on disk after shutdown
    pub keep_data_dirs: bool,

    /// How work is dispatched across instances
    #[serde(default)]
    pub dispatch: DispatchConfig,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            tor_binary: PathBuf::from("tor"),
            instances: 1,
            host: IpAddr::V4(Ipv4Addr::LOCALHOST),
            data_root: std::env::temp_dir().join("torpool"),
            min_password_length: 10,
            max_password_length: 20,
            hash_pattern: DEFAULT_HASH_PATTERN.to_string(),
            ready_marker: DEFAULT_READY_MARKER.to_string(),
            bootstrap_timeout: Duration::from_secs(90),
            control_timeout: Duration::from_secs(10),
            newnym_interval: Duration::from_secs(10),
            keep_data_dirs: false,
            dispatch: DispatchConfig::default(),
        }
    }
}

impl PoolConfig {
    /// Create a configuration for `instances` daemons of `tor_binary`
    pub fn new(tor_binary: impl Into<PathBuf>, instances: usize) -> Self {
        Self {
            tor_binary: tor_binary.into(),
            instances,
            ..Default::default()
        }
    }

    /// Create configuration from environment variables
    ///
    /// Environment variables:
    /// - `TORPOOL_TOR_BINARY`: Tor executable (default: `tor` on `PATH`)
    /// - `TORPOOL_INSTANCES`: number of daemons (default: 1)
    /// - `TORPOOL_HOST`: loopback address (default: 127.0.0.1)
    /// - `TORPOOL_DATA_ROOT`: parent of the per-instance data directories
    /// - `TORPOOL_HASH_PATTERN`: hashed password regex
    /// - `TORPOOL_BOOTSTRAP_TIMEOUT_SECS`: readiness bound (default: 90)
    /// - `TORPOOL_NEWNYM_INTERVAL_SECS`: fallback NEWNYM cooldown (default: 10)
    /// - `TORPOOL_KEEP_DATA_DIRS`: "true" to keep data directories
    pub fn from_env() -> Self {
        let defaults = Self::default();

        Self {
            tor_binary: std::env::var("TORPOOL_TOR_BINARY")
                .map(PathBuf::from)
                .unwrap_or(defaults.tor_binary),
            instances: env_parse("TORPOOL_INSTANCES").unwrap_or(defaults.instances),
            host: env_parse("TORPOOL_HOST").unwrap_or(defaults.host),
            data_root: std::env::var("TORPOOL_DATA_ROOT")
                .map(PathBuf::from)
                .unwrap_or(defaults.data_root),
            hash_pattern: std::env::var("TORPOOL_HASH_PATTERN").unwrap_or(defaults.hash_pattern),
            bootstrap_timeout: env_parse("TORPOOL_BOOTSTRAP_TIMEOUT_SECS")
                .map(Duration::from_secs)
                .unwrap_or(defaults.bootstrap_timeout),
            newnym_interval: env_parse("TORPOOL_NEWNYM_INTERVAL_SECS")
                .map(Duration::from_secs)
                .unwrap_or(defaults.newnym_interval),
            keep_data_dirs: std::env::var("TORPOOL_KEEP_DATA_DIRS")
                .map(|v| v.to_lowercase() == "true")
                .unwrap_or(defaults.keep_data_dirs),
            ..defaults
        }
    }

    pub fn with_tor_binary(mut self, path: impl Into<PathBuf>) -> Self {
        self.tor_binary = path.into();
        self
    }

    pub fn with_instances(mut self, instances: usize) -> Self {
        self.instances = instances;
        self
    }

    pub fn with_host(mut self, host: IpAddr) -> Self {
        self.host = host;
        self
    }

    pub fn with_data_root(mut self, root: impl Into<PathBuf>) -> Self {
        self.data_root = root.into();
        self
    }

    pub fn with_password_length(mut self, range: RangeInclusive<usize>) -> Self {
        self.min_password_length = *range.start();
        self.max_password_length = *range.end();
        self
    }

    pub fn with_hash_pattern(mut self, pattern: impl Into<String>) -> Self {
        self.hash_pattern = pattern.into();
        self
    }

    pub fn with_ready_marker(mut self, marker: impl Into<String>) -> Self {
        self.ready_marker = marker.into();
        self
    }

    pub fn with_bootstrap_timeout(mut self, timeout: Duration) -> Self {
        self.bootstrap_timeout = timeout;
        self
    }

    pub fn with_control_timeout(mut self, timeout: Duration) -> Self {
        self.control_timeout = timeout;
        self
    }

    pub fn with_newnym_interval(mut self, interval: Duration) -> Self {
        self.newnym_interval = interval;
        self
    }

    pub fn with_keep_data_dirs(mut self, keep: bool) -> Self {
        self.keep_data_dirs = keep;
        self
    }

    pub fn with_dispatch(mut self, dispatch: DispatchConfig) -> Self {
        self.dispatch = dispatch;
        self
    }

    /// Password length range
    pub fn password_length(&self) -> RangeInclusive<usize> {
        self.min_password_length..=self.max_password_length
    }

    /// Compile [`hash_pattern`](Self::hash_pattern)
    pub fn hash_regex(&self) -> Result<Regex> {
        Regex::new(&self.hash_pattern)
            .map_err(|e| PoolError::InvalidConfig(format!("hash_pattern: {e}")))
    }

    /// Reject configurations the pool cannot run with
    pub fn validate(&self) -> Result<()> {
        if self.instances == 0 {
            return Err(PoolError::InvalidConfig(
                "instances must be at least 1".to_string(),
            ));
        }
        if self.min_password_length == 0 || self.min_password_length > self.max_password_length
        {
            return Err(PoolError::InvalidConfig(format!(
                "password length range {}..={} is empty",
                self.min_password_length, self.max_password_length
            )));
        }
        if self.ready_marker.is_empty() {
            return Err(PoolError::InvalidConfig(
                "ready_marker must not be empty".to_string(),
            ));
        }
        self.hash_regex()?;
        Ok(())
    }
}

/// When workers rotate identity on their own
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RotationPolicy {
    /// Only when the work function asks for it
    Never,
    /// Before every work item
    #[default]
    BeforeEachItem,
}

/// Dispatch behaviour
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DispatchConfig {
    /// Automatic identity rotation
    pub rotation: RotationPolicy,

    /// Retry applied around automatic rotation
    pub rotation_retry: RetryPolicy,

    /// Upper bound on one item's work function (None = unbounded)
    #[serde(with = "option_duration_millis", default)]
    pub item_timeout: Option<Duration>,
}

impl Default for DispatchConfig {
    fn default() -> Self {
        Self {
            rotation: RotationPolicy::BeforeEachItem,
            rotation_retry: RetryPolicy::no_retry(),
            item_timeout: None,
        }
    }
}

impl DispatchConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_rotation(mut self, rotation: RotationPolicy) -> Self {
        self.rotation = rotation;
        self
    }

    pub fn with_rotation_retry(mut self, policy: RetryPolicy) -> Self {
        self.rotation_retry = policy;
        self
    }

    pub fn with_item_timeout(mut self, timeout: Duration) -> Self {
        self.item_timeout = Some(timeout);
        self
    }
}

fn env_parse<T: std::str::FromStr>(key: &str) -> Option<T> {
    std::env::var(key).ok().and_then(|s| s.parse().ok())
}

/// Serde support for Duration as milliseconds
pub(crate) mod duration_millis {
    use serde::{Deserialize, Deserializer, Serialize, Serializer};
    use std::time::Duration;

    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        (duration.as_millis() as u64).serialize(serializer)
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let millis = u64::deserialize(deserializer)?;
        Ok(Duration::from_millis(millis))
    }
}

/// Serde support for Option<Duration> as milliseconds
pub(crate) mod option_duration_millis {
    use serde::{Deserialize, Deserializer, Serialize, Serializer};
    use std::time::Duration;

    pub fn serialize<S>(duration: &Option<Duration>, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        duration
            .map(|d| d.as_millis() as u64)
            .serialize(serializer)
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Option<Duration>, D::Error>
    where
        D: Deserializer<'de>,
    {
        let millis = Option::<u64>::deserialize(deserializer)?;
        Ok(millis.map(Duration::from_millis))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = PoolConfig::default();
        assert_eq!(config.instances, 1);
        assert_eq!(config.host, IpAddr::V4(Ipv4Addr::LOCALHOST));
        assert_eq!(config.password_length(), 10..=20);
        assert_eq!(config.newnym_interval, Duration::from_secs(10));
        assert_eq!(config.dispatch.rotation, RotationPolicy::BeforeEachItem);
        assert!(!config.keep_data_dirs);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_config_builder() {
        let config = PoolConfig::new("/opt/tor/bin/tor", 4)
            .with_password_length(12..=16)
            .with_newnym_interval(Duration::ZERO)
            .with_keep_data_dirs(true)
            .with_dispatch(
                DispatchConfig::new()
                    .with_rotation(RotationPolicy::Never)
                    .with_item_timeout(Duration::from_secs(30)),
            );

        assert_eq!(config.tor_binary, PathBuf::from("/opt/tor/bin/tor"));
        assert_eq!(config.instances, 4);
        assert_eq!(config.password_length(), 12..=16);
        assert_eq!(config.newnym_interval, Duration::ZERO);
        assert!(config.keep_data_dirs);
        assert_eq!(config.dispatch.rotation, RotationPolicy::Never);
        assert_eq!(config.dispatch.item_timeout, Some(Duration::from_secs(30)));
    }

    #[test]
    fn test_validate_rejects_zero_instances() {
        let config = PoolConfig::new("tor", 0);
        assert!(matches!(
            config.validate(),
            Err(PoolError::InvalidConfig(_))
        ));
    }

    #[test]
    fn test_validate_rejects_inverted_password_range() {
        let mut config = PoolConfig::new("tor", 1);
        config.min_password_length = 20;
        config.max_password_length = 10;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_validate_rejects_bad_pattern() {
        let config = PoolConfig::new("tor", 1).with_hash_pattern("16:[");
        assert!(matches!(
            config.validate(),
            Err(PoolError::InvalidConfig(msg)) if msg.starts_with("hash_pattern")
        ));
    }

    #[test]
    fn test_serialization_roundtrip() {
        let config = PoolConfig::new("tor", 3)
            .with_dispatch(DispatchConfig::new().with_item_timeout(Duration::from_millis(1500)));

        let json = serde_json::to_value(&config).unwrap();
        assert_eq!(json["bootstrap_timeout"], 90_000);
        assert_eq!(json["dispatch"]["rotation"], "before_each_item");
        assert_eq!(json["dispatch"]["item_timeout"], 1500);

        let parsed: PoolConfig = serde_json::from_value(json).unwrap();
        assert_eq!(parsed.instances, 3);
        assert_eq!(parsed.dispatch, config.dispatch);
    }
}
