use std::env;
use std::fmt;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::time::Duration;

use sentry_types::Dsn;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

/// Defines the source of a config error
#[derive(Debug, Default)]
enum ConfigErrorSource {
    /// An error occurring independently.
    #[default]
    None,
    /// An error originating from a configuration file.
    File(PathBuf),
    /// An error originating in a field override (an env var, or a builder call).
    FieldOverride(String),
}

impl fmt::Display for ConfigErrorSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConfigErrorSource::None => Ok(()),
            ConfigErrorSource::File(file_name) => {
                write!(f, " (file {})", file_name.display())
            }
            ConfigErrorSource::FieldOverride(name) => write!(f, " (field {name})"),
        }
    }
}

/// Indicates config related errors.
#[derive(Debug)]
pub struct ConfigError {
    source: ConfigErrorSource,
    kind: ConfigErrorKind,
    inner: Option<Box<dyn std::error::Error + Send + Sync + 'static>>,
}

impl ConfigError {
    #[inline]
    fn new(kind: ConfigErrorKind) -> Self {
        Self {
            source: ConfigErrorSource::None,
            kind,
            inner: None,
        }
    }

    #[inline]
    fn wrap<E>(inner: E, kind: ConfigErrorKind) -> Self
    where
        E: std::error::Error + Send + Sync + 'static,
    {
        Self {
            source: ConfigErrorSource::None,
            kind,
            inner: Some(Box::new(inner)),
        }
    }

    #[inline]
    fn for_field<E>(inner: E, field: &'static str) -> Self
    where
        E: std::error::Error + Send + Sync + 'static,
    {
        Self::wrap(inner, ConfigErrorKind::InvalidValue).field(field)
    }

    #[inline]
    fn file(mut self, p: impl AsRef<Path>) -> Self {
        self.source = ConfigErrorSource::File(p.as_ref().to_path_buf());
        self
    }

    #[inline]
    fn field(mut self, name: &'static str) -> Self {
        self.source = ConfigErrorSource::FieldOverride(name.to_owned());
        self
    }

    /// Returns the error kind of the error.
    pub fn kind(&self) -> ConfigErrorKind {
        self.kind
    }
}

impl fmt::Display for ConfigError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}{}", self.kind, self.source)
    }
}

impl std::error::Error for ConfigError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        self.inner
            .as_ref()
            .map(|e| e.as_ref() as &(dyn std::error::Error + 'static))
    }
}

/// Indicates config related errors.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, thiserror::Error)]
#[non_exhaustive]
pub enum ConfigErrorKind {
    /// Failed to open the file.
    #[error("could not open config file")]
    CouldNotOpenFile,
    /// Parsing YAML failed.
    #[error("could not parse yaml config file")]
    BadYaml,
    /// Parsing JSON failed.
    #[error("could not parse json config file")]
    BadJson,
    /// Invalid config value
    #[error("invalid config value")]
    InvalidValue,
}

/// An out-of-range setting found while validating a loaded configuration.
#[derive(Debug, thiserror::Error)]
#[error("{0}")]
struct InvalidSetting(&'static str);

enum ConfigFormat {
    Yaml,
}

impl ConfigFormat {
    pub fn extension(&self) -> &'static str {
        match self {
            ConfigFormat::Yaml => "yml",
        }
    }
}

trait ConfigObject: DeserializeOwned + Serialize {
    /// The format in which to serialize this configuration.
    fn format() -> ConfigFormat;

    /// The basename of the config file.
    fn name() -> &'static str;

    /// The full filename of the config file, including the file extension.
    fn path(base: &Path) -> PathBuf {
        base.join(format!("{}.{}", Self::name(), Self::format().extension()))
    }

    /// Loads the config file from a file within the given directory location.
    fn load(base: &Path) -> Result<Self, ConfigError> {
        let path = Self::path(base);

        let f = fs::File::open(&path)
            .map_err(|e| ConfigError::wrap(e, ConfigErrorKind::CouldNotOpenFile).file(&path))?;

        match Self::format() {
            ConfigFormat::Yaml => serde_yaml::from_reader(io::BufReader::new(f))
                .map_err(|e| ConfigError::wrap(e, ConfigErrorKind::BadYaml).file(&path)),
        }
    }
}

/// Values that override the configuration file, usually taken from the environment.
#[derive(Debug, Default)]
pub struct OverridableConfig {
    /// The DSN to send envelopes to.
    pub dsn: Option<String>,
    /// The environment attached to events.
    pub environment: Option<String>,
    /// The release attached to events.
    pub release: Option<String>,
    /// The error event sample rate.
    pub sample_rate: Option<String>,
    /// The directory of the envelope cache.
    pub cache_dir: Option<String>,
}

impl OverridableConfig {
    /// Reads overrides from `SENTRY_DSN`, `SENTRY_ENVIRONMENT`, `SENTRY_RELEASE`,
    /// `SENTRY_SAMPLE_RATE` and `SENTRY_CACHE_DIR`.
    pub fn from_env() -> Self {
        Self::from_vars(|name| env::var(name).ok())
    }

    /// Reads overrides through `lookup`, which resolves a variable name to its value.
    pub fn from_vars<F>(lookup: F) -> Self
    where
        F: Fn(&str) -> Option<String>,
    {
        Self {
            dsn: lookup("SENTRY_DSN"),
            environment: lookup("SENTRY_ENVIRONMENT"),
            release: lookup("SENTRY_RELEASE"),
            sample_rate: lookup("SENTRY_SAMPLE_RATE"),
            cache_dir: lookup("SENTRY_CACHE_DIR"),
        }
    }
}

/// Content encoding applied to envelope requests.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum HttpEncoding {
    /// No compression.
    Identity,
    /// Compression using gzip.
    #[default]
    Gzip,
}

impl HttpEncoding {
    /// Returns the value for the `content-encoding` HTTP header.
    ///
    /// Returns `None` for [`Identity`](Self::Identity), and `Some` for other encodings.
    pub fn name(&self) -> Option<&'static str> {
        match self {
            Self::Identity => None,
            Self::Gzip => Some("gzip"),
        }
    }
}

/// Identity of the client and event level options.
#[derive(Serialize, Deserialize, Debug)]
#[serde(default)]
struct Client {
    /// The DSN that envelopes are sent to.
    ///
    /// Without a DSN the HTTP transport cannot be created.
    dsn: Option<Dsn>,
    /// The environment attached to events.
    environment: Option<String>,
    /// The release attached to events.
    release: Option<String>,
    /// Sample rate for error events, in the range `[0, 1]`.
    sample_rate: f64,
    /// Sample rate for transactions, in the range `[0, 1]`.
    ///
    /// Transactions are not sampled when unset.
    traces_sample_rate: Option<f64>,
    /// Report counts of dropped data to the server.
    send_client_reports: bool,
}

impl Default for Client {
    fn default() -> Self {
        Client {
            dsn: None,
            environment: None,
            release: None,
            sample_rate: 1.0,
            traces_sample_rate: None,
            send_client_reports: true,
        }
    }
}

/// Controls the HTTP transport.
#[derive(Serialize, Deserialize, Debug)]
#[serde(default)]
struct Http {
    /// Timeout for envelope requests in seconds.
    ///
    /// This covers the time from sending the request until the response has been read.
    timeout: u32,
    /// Timeout for establishing connections in seconds, including TLS handshakes.
    connection_timeout: u32,
    /// Content encoding to apply to envelope requests.
    ///
    /// Available options are:
    ///
    ///  - `identity`: Disables compression.
    ///  - `gzip` (default): Compression using gzip.
    encoding: HttpEncoding,
}

impl Default for Http {
    fn default() -> Self {
        Http {
            timeout: 5,
            connection_timeout: 5,
            encoding: HttpEncoding::Gzip,
        }
    }
}

/// Controls the send queue and its retries.
#[derive(Serialize, Deserialize, Debug)]
#[serde(default)]
struct Queue {
    /// Maximum number of envelopes pending, in flight or waiting for a retry.
    max_queue_size: usize,
    /// Maximum number of delivery attempts per envelope.
    max_retries: u32,
    /// Number of worker threads.
    num_threads: usize,
    /// Number of envelopes each worker sends concurrently.
    max_concurrency: usize,
    /// First retry delay in milliseconds.
    initial_backoff: u64,
    /// Upper bound of the retry delay in seconds.
    max_backoff: u64,
    /// Default flush timeout in milliseconds.
    flush_timeout: u64,
    /// Default shutdown timeout in milliseconds.
    shutdown_timeout: u64,
}

impl Default for Queue {
    fn default() -> Self {
        Queue {
            max_queue_size: 30,
            max_retries: 3,
            num_threads: 1,
            max_concurrency: 1,
            initial_backoff: 1000, // 1 second
            max_backoff: 60,       // 1 minute
            flush_timeout: 15_000,
            shutdown_timeout: 2_000,
        }
    }
}

/// Controls the durability cache on disk.
#[derive(Serialize, Deserialize, Debug)]
#[serde(default)]
struct Cache {
    /// Directory for cached envelopes. Caching is disabled when unset.
    dir: Option<PathBuf>,
    /// Maximum number of regular envelopes kept in the cache.
    max_items: usize,
}

impl Default for Cache {
    fn default() -> Self {
        Cache {
            dir: None,
            max_items: 30,
        }
    }
}

#[derive(Serialize, Deserialize, Debug, Default)]
struct ConfigValues {
    #[serde(default)]
    client: Client,
    #[serde(default)]
    http: Http,
    #[serde(default)]
    queue: Queue,
    #[serde(default)]
    cache: Cache,
    #[serde(default)]
    logging: beacon_log::LogConfig,
}

impl ConfigObject for ConfigValues {
    fn format() -> ConfigFormat {
        ConfigFormat::Yaml
    }

    fn name() -> &'static str {
        "config"
    }
}

impl ConfigValues {
    fn validate(&self) -> Result<(), ConfigError> {
        if !(0.0..=1.0).contains(&self.client.sample_rate) {
            return Err(ConfigError::for_field(
                InvalidSetting("sample rate must be within [0, 1]"),
                "client.sample_rate",
            ));
        }

        if let Some(rate) = self.client.traces_sample_rate {
            if !(0.0..=1.0).contains(&rate) {
                return Err(ConfigError::for_field(
                    InvalidSetting("sample rate must be within [0, 1]"),
                    "client.traces_sample_rate",
                ));
            }
        }

        if self.queue.max_queue_size == 0 {
            return Err(ConfigError::for_field(
                InvalidSetting("queue size must be positive"),
                "queue.max_queue_size",
            ));
        }

        if self.queue.num_threads == 0 {
            return Err(ConfigError::for_field(
                InvalidSetting("at least one worker thread is required"),
                "queue.num_threads",
            ));
        }

        Ok(())
    }
}

/// Config struct.
#[derive(Default)]
pub struct Config {
    values: ConfigValues,
    path: PathBuf,
}

impl fmt::Debug for Config {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Config")
            .field("path", &self.path)
            .field("values", &self.values)
            .finish()
    }
}

impl Config {
    /// Loads a config from a given config folder.
    ///
    /// Variables read by [`OverridableConfig::from_env`] take precedence over the file.
    pub fn from_path<P: AsRef<Path>>(path: P) -> Result<Config, ConfigError> {
        let path = env::current_dir()
            .map(|x| x.join(path.as_ref()))
            .unwrap_or_else(|_| path.as_ref().to_path_buf());

        let values = ConfigValues::load(&path)?;
        values
            .validate()
            .map_err(|e| e.file(ConfigValues::path(&path)))?;

        let mut config = Config { values, path };
        config.apply_override(OverridableConfig::from_env())?;
        Ok(config)
    }

    /// Creates a config from a JSON value.
    ///
    /// This is mostly useful for tests.
    pub fn from_json_value(value: serde_json::Value) -> Result<Config, ConfigError> {
        let values: ConfigValues = serde_json::from_value(value)
            .map_err(|err| ConfigError::wrap(err, ConfigErrorKind::BadJson))?;
        values.validate()?;

        Ok(Config {
            values,
            path: PathBuf::new(),
        })
    }

    /// Override configuration with values coming from other sources (e.g. env variables).
    pub fn apply_override(
        &mut self,
        overrides: OverridableConfig,
    ) -> Result<&mut Self, ConfigError> {
        let client = &mut self.values.client;

        if let Some(dsn) = overrides.dsn {
            client.dsn = match dsn.as_str() {
                "" => None,
                dsn => Some(
                    dsn.parse::<Dsn>()
                        .map_err(|err| ConfigError::for_field(err, "dsn"))?,
                ),
            };
        }

        if let Some(environment) = overrides.environment {
            client.environment = Some(environment);
        }

        if let Some(release) = overrides.release {
            client.release = Some(release);
        }

        if let Some(sample_rate) = overrides.sample_rate {
            client.sample_rate = sample_rate
                .parse()
                .map_err(|err| ConfigError::for_field(err, "sample_rate"))?;
        }

        if let Some(cache_dir) = overrides.cache_dir {
            self.values.cache.dir = Some(cache_dir.into());
        }

        self.values.validate()?;
        Ok(self)
    }

    /// Returns the path of the config directory, if loaded from a file.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Returns the logging configuration.
    pub fn logging(&self) -> &beacon_log::LogConfig {
        &self.values.logging
    }

    /// Returns the DSN that envelopes are sent to.
    pub fn dsn(&self) -> Option<&Dsn> {
        self.values.client.dsn.as_ref()
    }

    /// Returns the environment attached to events.
    pub fn environment(&self) -> Option<&str> {
        self.values.client.environment.as_deref()
    }

    /// Returns the release attached to events.
    pub fn release(&self) -> Option<&str> {
        self.values.client.release.as_deref()
    }

    /// Returns the sample rate for error events.
    pub fn sample_rate(&self) -> f64 {
        self.values.client.sample_rate
    }

    /// Returns the sample rate for transactions, if transactions are sampled.
    pub fn traces_sample_rate(&self) -> Option<f64> {
        self.values.client.traces_sample_rate
    }

    /// Returns `true` if counts of dropped data are reported.
    pub fn send_client_reports(&self) -> bool {
        self.values.client.send_client_reports
    }

    /// Returns the timeout for envelope requests.
    pub fn http_timeout(&self) -> Duration {
        Duration::from_secs(self.values.http.timeout.into())
    }

    /// Returns the connection timeout for envelope requests.
    pub fn http_connection_timeout(&self) -> Duration {
        Duration::from_secs(self.values.http.connection_timeout.into())
    }

    /// Returns the content encoding of envelope requests.
    pub fn http_encoding(&self) -> HttpEncoding {
        self.values.http.encoding
    }

    /// Returns the maximum number of outstanding envelopes.
    pub fn max_queue_size(&self) -> usize {
        self.values.queue.max_queue_size
    }

    /// Returns the maximum number of delivery attempts per envelope.
    pub fn max_retries(&self) -> u32 {
        self.values.queue.max_retries
    }

    /// Returns the number of worker threads.
    pub fn queue_num_threads(&self) -> usize {
        self.values.queue.num_threads
    }

    /// Returns the number of concurrent sends per worker.
    pub fn queue_max_concurrency(&self) -> usize {
        self.values.queue.max_concurrency.max(1)
    }

    /// Returns the delay before the first retry.
    pub fn initial_backoff(&self) -> Duration {
        Duration::from_millis(self.values.queue.initial_backoff)
    }

    /// Returns the upper bound of retry delays.
    pub fn max_backoff(&self) -> Duration {
        Duration::from_secs(self.values.queue.max_backoff)
    }

    /// Returns the default timeout of flushes.
    pub fn flush_timeout(&self) -> Duration {
        Duration::from_millis(self.values.queue.flush_timeout)
    }

    /// Returns the default timeout of shutdowns.
    pub fn shutdown_timeout(&self) -> Duration {
        Duration::from_millis(self.values.queue.shutdown_timeout)
    }

    /// Returns the durability cache directory, if caching is enabled.
    pub fn cache_dir(&self) -> Option<&Path> {
        self.values.cache.dir.as_deref()
    }

    /// Returns the capacity of the durability cache.
    pub fn cache_max_items(&self) -> usize {
        self.values.cache.max_items
    }
}
