//! Transport Configuration
//!
//! Two layers of configuration:
//!
//! - [`ConnectionParameters`]: where a client connects and how it encodes
//!   (address, port, serializer, raw mode)
//! - [`TransportOptions`]: tuning shared by both roles (buffer sizes, retry
//!   timing, hardening limits), loadable from the environment or a TOML file
//!
//! # Example Configuration
//!
//! ```toml
//! [transport]
//! raw_buffer_size = 30000000
//! max_frame_len = 16777216
//! connect_attempt_timeout_ms = 250
//! retry_delay_ms = 150
//! reconnect_timeout_ms = 60000
//! ```

use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::constants::{
    CONNECTIVITY_INTERVAL, CONNECT_ATTEMPT_TIMEOUT, DEFAULT_PORT, DEFAULT_RECONNECT_TIMEOUT,
    ERROR_BACKOFF, RAW_BUFFER_SIZE, RETRY_DELAY,
};
use crate::serializer::{JsonSerializer, Serializer};

/// Errors that can occur when loading configuration
#[derive(Debug, Error)]
pub enum ConfigError {
    /// Failed to read config file
    #[error("Failed to read config file at {path}: {source}")]
    Read {
        /// The path that was attempted
        path: PathBuf,
        /// The underlying IO error
        source: std::io::Error,
    },

    /// Failed to parse TOML
    #[error("Failed to parse TOML config: {0}")]
    Parse(#[from] toml::de::Error),

    /// Invalid configuration value
    #[error("Invalid configuration: {0}")]
    Validation(String),
}

/// Tuning shared by clients and servers
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct TransportOptions {
    /// Receive buffer size in raw mode
    pub raw_buffer_size: usize,

    /// Largest accepted frame payload (None = unchecked)
    ///
    /// Unchecked lengths let a corrupt header stall the reader on bytes that
    /// never arrive. Set this when talking to untrusted peers.
    pub max_frame_len: Option<u32>,

    /// Consecutive read errors before the read loop gives up (None = never)
    pub read_error_limit: Option<u32>,

    /// Timeout of a single connect attempt in milliseconds
    pub connect_attempt_timeout_ms: u64,

    /// Delay between connect attempts in milliseconds
    pub retry_delay_ms: u64,

    /// Connectivity watcher tick in milliseconds
    pub connectivity_interval_ms: u64,

    /// Default reconnect deadline in milliseconds
    pub reconnect_timeout_ms: u64,

    /// Back-off after a read or accept error in milliseconds
    pub error_backoff_ms: u64,

    /// Disable Nagle's algorithm on every stream
    pub nodelay: bool,
}

impl Default for TransportOptions {
    fn default() -> Self {
        Self {
            raw_buffer_size: RAW_BUFFER_SIZE,
            max_frame_len: None,
            read_error_limit: None,
            connect_attempt_timeout_ms: duration_ms(CONNECT_ATTEMPT_TIMEOUT),
            retry_delay_ms: duration_ms(RETRY_DELAY),
            connectivity_interval_ms: duration_ms(CONNECTIVITY_INTERVAL),
            reconnect_timeout_ms: duration_ms(DEFAULT_RECONNECT_TIMEOUT),
            error_backoff_ms: duration_ms(ERROR_BACKOFF),
            nodelay: true,
        }
    }
}

#[allow(clippy::cast_possible_truncation)]
const fn duration_ms(d: Duration) -> u64 {
    d.as_millis() as u64
}

/// Top-level layout of a configuration file
#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct OptionsFile {
    transport: TransportOptions,
}

impl TransportOptions {
    /// Load options from environment variables
    ///
    /// Environment variables (unset, unparsable or rejected values keep the
    /// default):
    /// - `WIRELINE_RAW_BUFFER_SIZE`: raw receive buffer in bytes
    /// - `WIRELINE_MAX_FRAME_LEN`: largest frame payload ("0" = unchecked)
    /// - `WIRELINE_READ_ERROR_LIMIT`: consecutive read errors ("0" = never stop)
    /// - `WIRELINE_CONNECT_ATTEMPT_TIMEOUT`: per-attempt connect timeout in ms
    /// - `WIRELINE_RETRY_DELAY`: delay between connect attempts in ms
    /// - `WIRELINE_CONNECTIVITY_INTERVAL`: connectivity watcher tick in ms
    /// - `WIRELINE_RECONNECT_TIMEOUT`: default reconnect deadline in ms
    /// - `WIRELINE_NODELAY`: "0" or "false" to keep Nagle's algorithm
    #[must_use]
    pub fn from_env() -> Self {
        let defaults = Self::default();

        Self {
            raw_buffer_size: env_parse("WIRELINE_RAW_BUFFER_SIZE")
                .unwrap_or(defaults.raw_buffer_size),
            max_frame_len: env_parse("WIRELINE_MAX_FRAME_LEN")
                .map_or(defaults.max_frame_len, |v: u32| (v > 0).then_some(v)),
            read_error_limit: env_parse("WIRELINE_READ_ERROR_LIMIT")
                .map_or(defaults.read_error_limit, |v: u32| (v > 0).then_some(v)),
            connect_attempt_timeout_ms: env_parse("WIRELINE_CONNECT_ATTEMPT_TIMEOUT")
                .unwrap_or(defaults.connect_attempt_timeout_ms),
            retry_delay_ms: env_parse("WIRELINE_RETRY_DELAY").unwrap_or(defaults.retry_delay_ms),
            connectivity_interval_ms: env_parse("WIRELINE_CONNECTIVITY_INTERVAL")
                .unwrap_or(defaults.connectivity_interval_ms),
            reconnect_timeout_ms: env_parse("WIRELINE_RECONNECT_TIMEOUT")
                .unwrap_or(defaults.reconnect_timeout_ms),
            error_backoff_ms: defaults.error_backoff_ms,
            nodelay: std::env::var("WIRELINE_NODELAY")
                .map(|v| v != "0" && v.to_lowercase() != "false")
                .unwrap_or(defaults.nodelay),
        }
        .sanitized()
    }

    /// Replace every field [`validate`](Self::validate) would reject with
    /// its default
    #[must_use]
    pub fn sanitized(mut self) -> Self {
        let defaults = Self::default();

        if self.raw_buffer_size == 0 {
            tracing::warn!(
                default = defaults.raw_buffer_size,
                "raw_buffer_size is 0, using default"
            );
            self.raw_buffer_size = defaults.raw_buffer_size;
        }
        if self.connect_attempt_timeout_ms == 0 {
            tracing::warn!(
                default = defaults.connect_attempt_timeout_ms,
                "connect_attempt_timeout_ms is 0, using default"
            );
            self.connect_attempt_timeout_ms = defaults.connect_attempt_timeout_ms;
        }
        if self.connectivity_interval_ms == 0 {
            tracing::warn!(
                default = defaults.connectivity_interval_ms,
                "connectivity_interval_ms is 0, using default"
            );
            self.connectivity_interval_ms = defaults.connectivity_interval_ms;
        }
        self
    }

    /// Load options from the `[transport]` table of a TOML file
    ///
    /// Missing keys keep their defaults.
    ///
    /// # Errors
    ///
    /// Returns `ConfigError` if the file cannot be read, is not valid TOML,
    /// or holds values rejected by [`validate`](Self::validate).
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_toml_str(&content)
    }

    /// Parse options from TOML text
    ///
    /// # Errors
    ///
    /// Returns `ConfigError::Parse` or `ConfigError::Validation`.
    pub fn from_toml_str(content: &str) -> Result<Self, ConfigError> {
        let file: OptionsFile = toml::from_str(content)?;
        file.transport.validate()?;
        Ok(file.transport)
    }

    /// Check that the options describe a usable transport
    ///
    /// # Errors
    ///
    /// Returns `ConfigError::Validation` naming the first bad field.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.raw_buffer_size == 0 {
            return Err(ConfigError::Validation(
                "raw_buffer_size must be greater than 0".into(),
            ));
        }
        if self.connect_attempt_timeout_ms == 0 {
            return Err(ConfigError::Validation(
                "connect_attempt_timeout_ms must be greater than 0".into(),
            ));
        }
        if self.connectivity_interval_ms == 0 {
            return Err(ConfigError::Validation(
                "connectivity_interval_ms must be greater than 0".into(),
            ));
        }
        Ok(())
    }

    /// Per-attempt connect timeout
    #[must_use]
    pub fn connect_attempt_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_attempt_timeout_ms)
    }

    /// Delay between connect attempts
    #[must_use]
    pub fn retry_delay(&self) -> Duration {
        Duration::from_millis(self.retry_delay_ms)
    }

    /// Connectivity watcher tick
    #[must_use]
    pub fn connectivity_interval(&self) -> Duration {
        Duration::from_millis(self.connectivity_interval_ms)
    }

    /// Default reconnect deadline
    #[must_use]
    pub fn reconnect_timeout(&self) -> Duration {
        Duration::from_millis(self.reconnect_timeout_ms)
    }

    /// Back-off after a read or accept error
    #[must_use]
    pub fn error_backoff(&self) -> Duration {
        Duration::from_millis(self.error_backoff_ms)
    }
}

fn env_parse<T: std::str::FromStr>(key: &str) -> Option<T> {
    std::env::var(key).ok().and_then(|v| v.parse().ok())
}

/// Where and how a client connects
///
/// The all-default value means "connect later": [`Client::connect`] then
/// builds an unconnected placeholder that [`Client::reconnect`] can bring up.
///
/// [`Client::connect`]: crate::Client::connect
/// [`Client::reconnect`]: crate::Client::reconnect
pub struct ConnectionParameters<S = JsonSerializer> {
    address: String,
    port: u16,
    serializer: Arc<S>,
    raw_mode: bool,
    options: TransportOptions,
}

impl<S: Serializer + Default> ConnectionParameters<S> {
    /// Parameters for `address` on the default port with the default serializer
    pub fn new(address: impl Into<String>) -> Self {
        Self::with_serializer(address, Arc::new(S::default()))
    }
}

impl<S: Serializer + Default> Default for ConnectionParameters<S> {
    fn default() -> Self {
        Self {
            address: String::new(),
            port: 0,
            serializer: Arc::new(S::default()),
            raw_mode: false,
            options: TransportOptions::default(),
        }
    }
}

impl<S> ConnectionParameters<S> {
    /// Parameters for `address` on the default port with a given serializer
    pub fn with_serializer(address: impl Into<String>, serializer: Arc<S>) -> Self {
        Self {
            address: address.into(),
            port: DEFAULT_PORT,
            serializer,
            raw_mode: false,
            options: TransportOptions::default(),
        }
    }

    /// Set the port
    #[must_use]
    pub fn with_port(mut self, port: u16) -> Self {
        self.port = port;
        self
    }

    /// Enable or disable raw mode
    #[must_use]
    pub fn with_raw_mode(mut self, raw_mode: bool) -> Self {
        self.raw_mode = raw_mode;
        self
    }

    /// Replace the transport options
    ///
    /// Fields that [`TransportOptions::validate`] rejects fall back to
    /// their defaults.
    #[must_use]
    pub fn with_options(mut self, options: TransportOptions) -> Self {
        self.options = options.sanitized();
        self
    }

    /// Host name or IP address of the server
    #[must_use]
    pub fn address(&self) -> &str {
        &self.address
    }

    /// Server port
    #[must_use]
    pub fn port(&self) -> u16 {
        self.port
    }

    /// Serializer used for framed messages
    #[must_use]
    pub fn serializer(&self) -> &Arc<S> {
        &self.serializer
    }

    /// Whether the connection runs in raw mode
    #[must_use]
    pub fn raw_mode(&self) -> bool {
        self.raw_mode
    }

    /// Transport tuning
    #[must_use]
    pub fn options(&self) -> &TransportOptions {
        &self.options
    }

    /// `host:port` string handed to the resolver
    #[must_use]
    pub fn endpoint(&self) -> String {
        format!("{}:{}", self.address, self.port)
    }

    /// Whether these parameters name a server to connect to
    ///
    /// False only for the all-default value (no address, port 0, raw mode
    /// off), which requests a deferred connect.
    #[must_use]
    pub fn is_valid(&self) -> bool {
        !(self.address.is_empty() && self.port == 0 && !self.raw_mode)
    }
}

impl<S> Clone for ConnectionParameters<S> {
    fn clone(&self) -> Self {
        Self {
            address: self.address.clone(),
            port: self.port,
            serializer: Arc::clone(&self.serializer),
            raw_mode: self.raw_mode,
            options: self.options.clone(),
        }
    }
}

impl<S: Serializer> fmt::Debug for ConnectionParameters<S> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConnectionParameters")
            .field("address", &self.address)
            .field("port", &self.port)
            .field("serializer", &self.serializer.name())
            .field("raw_mode", &self.raw_mode)
            .field("options", &self.options)
            .finish()
    }
}
