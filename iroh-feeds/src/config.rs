//! Configuration of the subscription engine.

use std::{path::Path, time::Duration};

use nested_enum_utils::common_fields;
use serde::Deserialize;
use snafu::{ResultExt, Snafu};
use tracing::debug;

/// Default interval between checks for stale subscriptions.
pub const DEFAULT_RENEW_CHECK_INTERVAL: Duration = Duration::from_secs(60);
/// Default age after which an active subscription is renewed.
pub const DEFAULT_RENEW_AFTER: Duration = Duration::from_secs(180);
/// Default quiet window for coalescing peer discovery events.
pub const DEFAULT_PEER_DEBOUNCE: Duration = Duration::from_millis(500);
/// Default maximum number of records requested per network history pull.
pub const DEFAULT_HISTORY_LIMIT: usize = 100;
/// Default capacity of the change event channel.
pub const DEFAULT_EVENT_CAPACITY: usize = 1024;

/// Configuration for [`Feeds`](crate::Feeds).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Config {
    /// How often active subscriptions are checked for staleness.
    pub renew_check_interval: Duration,
    /// Subscriptions active for longer than this are renewed.
    pub renew_after: Duration,
    /// Bursts of peer discovery events within this window trigger a single rehydration.
    pub peer_debounce: Duration,
    /// Maximum number of records requested per network history pull.
    pub history_limit: usize,
    /// Capacity of the change event channel.
    pub event_capacity: usize,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            renew_check_interval: DEFAULT_RENEW_CHECK_INTERVAL,
            renew_after: DEFAULT_RENEW_AFTER,
            peer_debounce: DEFAULT_PEER_DEBOUNCE,
            history_limit: DEFAULT_HISTORY_LIMIT,
            event_capacity: DEFAULT_EVENT_CAPACITY,
        }
    }
}

impl Config {
    /// Sets the renewal check interval.
    pub fn with_renew_check_interval(mut self, interval: Duration) -> Self {
        self.renew_check_interval = interval;
        self
    }

    /// Sets the staleness threshold for renewals.
    pub fn with_renew_after(mut self, after: Duration) -> Self {
        self.renew_after = after;
        self
    }

    /// Sets the peer event debounce window.
    pub fn with_peer_debounce(mut self, window: Duration) -> Self {
        self.peer_debounce = window;
        self
    }

    /// Sets the history pull limit.
    pub fn with_history_limit(mut self, limit: usize) -> Self {
        self.history_limit = limit;
        self
    }

    /// Loads the configuration from a TOML file.
    ///
    /// If the file does not exist the default configuration is returned.
    pub async fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        if !tokio::fs::try_exists(path).await.context(IoSnafu)? {
            debug!(path = %path.display(), "no config file, using defaults");
            return Ok(Self::default());
        }
        let s = tokio::fs::read_to_string(path).await.context(IoSnafu)?;
        Self::load_toml(&s)
    }

    /// Parses the configuration from a TOML string.
    pub fn load_toml(s: &str) -> Result<Self, ConfigError> {
        let file: ConfigFile = toml::from_str(s).context(ParseSnafu)?;
        Ok(file.into())
    }
}

/// Serde-compatible form of [`Config`].
///
/// Durations are given in milliseconds.
#[derive(Debug, Deserialize)]
#[serde(default, deny_unknown_fields)]
struct ConfigFile {
    renew_check_interval_ms: u64,
    renew_after_ms: u64,
    peer_debounce_ms: u64,
    history_limit: usize,
    event_capacity: usize,
}

impl Default for ConfigFile {
    fn default() -> Self {
        let config = Config::default();
        Self {
            renew_check_interval_ms: config.renew_check_interval.as_millis() as u64,
            renew_after_ms: config.renew_after.as_millis() as u64,
            peer_debounce_ms: config.peer_debounce.as_millis() as u64,
            history_limit: config.history_limit,
            event_capacity: config.event_capacity,
        }
    }
}

impl From<ConfigFile> for Config {
    fn from(source: ConfigFile) -> Self {
        Self {
            renew_check_interval: Duration::from_millis(source.renew_check_interval_ms),
            renew_after: Duration::from_millis(source.renew_after_ms),
            peer_debounce: Duration::from_millis(source.peer_debounce_ms),
            history_limit: source.history_limit,
            // A broadcast channel needs a capacity of at least one.
            event_capacity: source.event_capacity.max(1),
        }
    }
}

/// Failed to load a [`Config`].
#[common_fields({
    backtrace: Option<snafu::Backtrace>,
    #[snafu(implicit)]
    span_trace: n0_snafu::SpanTrace,
})]
#[allow(missing_docs)]
#[derive(Debug, Snafu)]
#[non_exhaustive]
pub enum ConfigError {
    #[snafu(display("failed to read config file"))]
    Io { source: std::io::Error },
    #[snafu(display("failed to parse config file"))]
    Parse { source: toml::de::Error },
}
