use std::collections::BTreeMap;
use std::env;
use std::fmt;
use std::fs;
use std::path::Path;
use std::time::Duration;

use anyhow::{Context, Result};
use sentry::types::Dsn;
use serde::{Deserialize, Deserializer, de};
use tracing::level_filters::LevelFilter;

use crate::types::NodeAddr;

/// Controls the log format
#[derive(Clone, Copy, Debug, Eq, PartialEq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    /// Auto detect (pretty for tty, simplified for other)
    Auto,
    /// With colors
    Pretty,
    /// Simplified log output
    Simplified,
    /// Dump out JSON lines
    Json,
}

/// Controls the logging system.
#[derive(Clone, Debug, Deserialize)]
#[serde(default)]
pub struct Logging {
    /// The log level for the profile cache.
    #[serde(deserialize_with = "deserialize_level_filter")]
    pub level: LevelFilter,
    /// Controls the log format.
    pub format: LogFormat,
    /// When set to true, backtraces are forced on.
    pub enable_backtraces: bool,
}

impl Default for Logging {
    fn default() -> Self {
        Logging {
            level: LevelFilter::INFO,
            format: LogFormat::Auto,
            enable_backtraces: true,
        }
    }
}

/// Control the metrics.
#[derive(Clone, Debug, Deserialize)]
#[serde(default)]
pub struct Metrics {
    /// host/port of statsd instance
    pub statsd: Option<String>,
    /// The prefix that should be added to all metrics.
    pub prefix: String,
    /// A tag name to report the hostname to, for each metric. Defaults to not sending such a tag.
    pub hostname_tag: Option<String>,
    /// A map containing custom tags and their values.
    ///
    /// These tags will be appended to every metric.
    pub custom_tags: BTreeMap<String, String>,
}

impl Default for Metrics {
    fn default() -> Self {
        Metrics {
            statsd: env::var("STATSD_SERVER").ok(),
            prefix: "profile_cache".into(),
            hostname_tag: None,
            custom_tags: BTreeMap::new(),
        }
    }
}

/// Bounds of the cache of loaded profiles.
///
/// These differ from [`ViewCacheConfig`] in the [`Default`] implementation.
#[derive(Clone, Copy, Debug, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct ProfileCacheConfig {
    /// The maximum total utilization weight of all profiles.
    ///
    /// Profiles weigh `1` unless they report their own utilization weight.
    pub max_weight: u64,

    /// Profiles are evicted when they were not accessed for this long.
    ///
    /// Set to `null` to keep profiles until they are evicted for capacity.
    #[serde(with = "humantime_serde")]
    pub max_unused_for: Option<Duration>,
}

impl Default for ProfileCacheConfig {
    fn default() -> Self {
        Self {
            max_weight: 50,
            max_unused_for: Some(Duration::from_secs(30 * 60)),
        }
    }
}

/// Bounds of the cache of derived views.
///
/// These differ from [`ProfileCacheConfig`] in the [`Default`] implementation.
#[derive(Clone, Copy, Debug, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct ViewCacheConfig {
    /// The maximum number of views.
    pub max_weight: u64,

    /// Views are evicted when they were not accessed for this long.
    #[serde(with = "humantime_serde")]
    pub max_unused_for: Option<Duration>,
}

impl Default for ViewCacheConfig {
    fn default() -> Self {
        Self {
            max_weight: 1000,
            max_unused_for: Some(Duration::from_secs(10 * 60)),
        }
    }
}

/// Treats the bounds of both caches identically when building them.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct InMemoryCacheConfig {
    pub max_weight: u64,
    pub max_unused_for: Option<Duration>,
}

impl From<ProfileCacheConfig> for InMemoryCacheConfig {
    fn from(source: ProfileCacheConfig) -> Self {
        Self {
            max_weight: source.max_weight,
            max_unused_for: source.max_unused_for,
        }
    }
}

impl From<ViewCacheConfig> for InMemoryCacheConfig {
    fn from(source: ViewCacheConfig) -> Self {
        Self {
            max_weight: source.max_weight,
            max_unused_for: source.max_unused_for,
        }
    }
}

#[derive(Clone, Debug, Default, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct CacheConfigs {
    /// Loaded profiles, including loads that are in progress or failed.
    pub profiles: ProfileCacheConfig,
    /// Views derived from loaded profiles.
    pub views: ViewCacheConfig,
}

/// Retries of the resynchronization after a reconnect.
#[derive(Clone, Debug, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct RetryConfig {
    /// The delay before the first retry, doubled for every further attempt.
    #[serde(with = "humantime_serde")]
    pub base_delay: Duration,
    /// The number of retries after the first attempt failed.
    pub max_retries: u32,
    /// Upper bound of the delay between two attempts.
    #[serde(with = "humantime_serde")]
    pub max_delay: Duration,
}

impl RetryConfig {
    /// The delay before the given retry, counting from `1`.
    pub fn delay(&self, attempt: u32) -> Duration {
        let factor = 2u32
            .checked_pow(attempt.saturating_sub(1))
            .unwrap_or(u32::MAX);
        self.base_delay.saturating_mul(factor).min(self.max_delay)
    }
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            base_delay: Duration::from_secs(1),
            max_retries: 3,
            max_delay: Duration::from_secs(60),
        }
    }
}

/// Connection to the coordination service.
#[derive(Clone, Debug, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct CoordinationConfig {
    /// Comma separated `host:port` pairs of the coordination ensemble.
    pub connect_string: String,
    /// The root node below which all records of the cluster are kept.
    ///
    /// An empty namespace puts the records at the root of the service.
    pub namespace: String,
    /// How long the service keeps the session of a disconnected node alive.
    #[serde(with = "humantime_serde")]
    pub session_timeout: Duration,
    /// How long to wait for the initial connection.
    #[serde(with = "humantime_serde")]
    pub connection_timeout: Duration,
    /// The bound on any single request to the service.
    #[serde(with = "humantime_serde")]
    pub operation_timeout: Duration,
    /// How long to wait for the global mutex.
    #[serde(with = "humantime_serde")]
    pub lock_timeout: Duration,
    pub retry: RetryConfig,
}

impl Default for CoordinationConfig {
    fn default() -> Self {
        Self {
            connect_string: "127.0.0.1:2181".into(),
            namespace: "profile-cache".into(),
            session_timeout: Duration::from_secs(60),
            connection_timeout: Duration::from_secs(5),
            operation_timeout: Duration::from_secs(5),
            lock_timeout: Duration::from_secs(10),
            retry: RetryConfig::default(),
        }
    }
}

#[derive(Clone, Debug, Deserialize)]
#[serde(default)]
pub struct Config {
    /// The `ip:port` under which this node serves requests, as advertised to other nodes.
    pub node: NodeAddr,

    /// The number of threads of the runtime running loads and view builds.
    ///
    /// Defaults to the number of CPUs.
    pub worker_threads: Option<usize>,

    /// Bounds of the in-memory caches.
    pub caches: CacheConfigs,

    /// The coordination service shared by all nodes of the cluster.
    pub coordination: CoordinationConfig,

    /// Controls the logging system.
    pub logging: Logging,

    /// Controls the metrics.
    pub metrics: Metrics,

    /// DSN to report internal errors to
    pub sentry_dsn: Option<Dsn>,
}

impl Default for Config {
    fn default() -> Self {
        Config {
            node: NodeAddr::new("127.0.0.1", 8082),
            worker_threads: None,
            caches: CacheConfigs::default(),
            coordination: CoordinationConfig::default(),
            logging: Logging::default(),
            metrics: Metrics::default(),
            sentry_dsn: None,
        }
    }
}

impl Config {
    pub fn get(path: Option<&Path>) -> Result<Self> {
        match path {
            Some(path) => Self::from_reader(
                fs::File::open(path).context("failed to open configuration file")?,
            ),
            None => Ok(Config::default()),
        }
    }

    fn from_reader(mut reader: impl std::io::Read) -> Result<Self> {
        let mut config = String::new();
        reader
            .read_to_string(&mut config)
            .context("failed reading config file")?;
        // check for empty files explicitly
        if config.trim().is_empty() {
            anyhow::bail!("config file empty");
        }
        serde_yaml::from_str(&config).context("failed to parse config YAML")
    }
}

#[derive(Debug)]
struct LevelFilterVisitor;

impl de::Visitor<'_> for LevelFilterVisitor {
    type Value = LevelFilter;

    fn expecting(&self, formatter: &mut fmt::Formatter) -> std::fmt::Result {
        write!(
            formatter,
            r#"one of the strings "off", "error", "warn", "info", "debug", or "trace""#
        )
    }

    fn visit_str<E>(self, v: &str) -> Result<Self::Value, E>
    where
        E: de::Error,
    {
        match v {
            "off" => Ok(LevelFilter::OFF),
            "error" => Ok(LevelFilter::ERROR),
            "warn" => Ok(LevelFilter::WARN),
            "info" => Ok(LevelFilter::INFO),
            "debug" => Ok(LevelFilter::DEBUG),
            "trace" => Ok(LevelFilter::TRACE),
            _ => Err(de::Error::unknown_variant(
                v,
                &["off", "error", "warn", "info", "debug", "trace"],
            )),
        }
    }
}

fn deserialize_level_filter<'de, D: Deserializer<'de>>(
    deserializer: D,
) -> Result<LevelFilter, D::Error> {
    deserializer.deserialize_str(LevelFilterVisitor)
}
