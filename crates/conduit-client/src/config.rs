// Client options, layered from defaults, environment and an optional YAML file.
use anyhow::{Context, Result};
use serde::Deserialize;
use std::fs;
use std::sync::OnceLock;
use std::time::Duration;

pub(crate) const DEFAULT_PREFETCH: u32 = 500;
pub(crate) const DEFAULT_MAX_QUEUE_SIZE: usize = 1000;
pub(crate) const DEFAULT_RECEIVE_BATCH: u32 = 100;
pub(crate) const DEFAULT_OPERATION_TIMEOUT: Duration = Duration::from_secs(60);
pub(crate) const DEFAULT_MAX_RETRIES: u32 = 3;
pub(crate) const DEFAULT_RETRY_DELAY: Duration = Duration::from_millis(800);
pub(crate) const DEFAULT_RETRY_MAX_DELAY: Duration = Duration::from_secs(60);
pub(crate) const DEFAULT_TOKEN_REFRESH_RATIO: f64 = 0.9;
pub(crate) const DEFAULT_MAX_FRAME_SIZE: u32 = 256 * 1024;

/// Hard safety cap for any single inbound frame.
///
/// The frame reader allocates a buffer sized by `header.length`, so the cap is
/// enforced before allocating. Override with `CONDUIT_MAX_FRAME_BYTES`.
pub(crate) const DEFAULT_MAX_FRAME_BYTES: usize = 16 * 1024 * 1024;

/// How the client reaches the broker.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum TransportType {
    /// Plain TCP socket.
    #[default]
    Tcp,
    /// One bidirectional stream of a QUIC connection.
    Quic,
}

impl TransportType {
    fn parse(value: &str) -> Option<Self> {
        match value.to_ascii_lowercase().as_str() {
            "tcp" => Some(Self::Tcp),
            "quic" => Some(Self::Quic),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum RetryMode {
    Fixed,
    #[default]
    Exponential,
}

impl RetryMode {
    fn parse(value: &str) -> Option<Self> {
        match value.to_ascii_lowercase().as_str() {
            "fixed" => Some(Self::Fixed),
            "exponential" => Some(Self::Exponential),
            _ => None,
        }
    }
}

/// Retry parameters consumed by [`crate::retry::retry_policy`].
#[derive(Debug, Clone, PartialEq)]
pub struct RetryOptions {
    pub mode: RetryMode,
    pub max_retries: u32,
    pub delay: Duration,
    pub max_delay: Duration,
}

impl Default for RetryOptions {
    fn default() -> Self {
        Self {
            mode: RetryMode::default(),
            max_retries: DEFAULT_MAX_RETRIES,
            delay: DEFAULT_RETRY_DELAY,
            max_delay: DEFAULT_RETRY_MAX_DELAY,
        }
    }
}

/// Immutable options handed to [`crate::ConduitClient`] at construction.
///
/// ```
/// use conduit_client::ClientOptions;
///
/// let options = ClientOptions::default();
/// assert_eq!(options.prefetch, 500);
/// assert_eq!(options.retry.max_retries, 3);
/// ```
#[derive(Debug, Clone, PartialEq)]
pub struct ClientOptions {
    /// Initial credit granted to the first receive link of a pipeline.
    pub prefetch: u32,
    /// Upper bound on messages buffered per receive pipeline.
    pub max_queue_size: usize,
    /// Demand requested at a time by [`crate::EventReceiver`].
    pub receive_batch: u32,
    pub operation_timeout: Duration,
    pub transport: TransportType,
    pub retry: RetryOptions,
    /// Hard cap on inbound frames. Process-wide: the first client created
    /// fixes it and later clients' values are ignored.
    pub max_frame_bytes: usize,
    pub max_frame_size: u32,
    pub container_id: String,
    /// Fraction of remaining token validity after which a token is refreshed.
    pub token_refresh_ratio: f64,
}

impl Default for ClientOptions {
    fn default() -> Self {
        Self {
            prefetch: DEFAULT_PREFETCH,
            max_queue_size: DEFAULT_MAX_QUEUE_SIZE,
            receive_batch: DEFAULT_RECEIVE_BATCH,
            operation_timeout: DEFAULT_OPERATION_TIMEOUT,
            transport: TransportType::default(),
            retry: RetryOptions::default(),
            max_frame_bytes: DEFAULT_MAX_FRAME_BYTES,
            max_frame_size: DEFAULT_MAX_FRAME_SIZE,
            container_id: format!("conduit-{}", uuid::Uuid::new_v4()),
            token_refresh_ratio: DEFAULT_TOKEN_REFRESH_RATIO,
        }
    }
}

#[derive(Clone)]
pub(crate) struct ClientRuntimeConfig {
    pub(crate) max_frame_bytes: usize,
}

static CLIENT_RUNTIME_CONFIG: OnceLock<ClientRuntimeConfig> = OnceLock::new();

#[derive(Debug, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
struct ClientOptionsOverride {
    prefetch: Option<u32>,
    max_queue_size: Option<usize>,
    receive_batch: Option<u32>,
    operation_timeout_ms: Option<u64>,
    transport: Option<String>,
    retry_mode: Option<String>,
    max_retries: Option<u32>,
    retry_delay_ms: Option<u64>,
    retry_max_delay_ms: Option<u64>,
    max_frame_bytes: Option<usize>,
    container_id: Option<String>,
    token_refresh_ratio: Option<f64>,
}

impl ClientOptions {
    pub fn from_env_or_yaml(config_path: Option<&str>) -> Result<Self> {
        let mut options = Self::from_env();
        let override_path = config_path
            .map(|value| value.to_string())
            .or_else(|| std::env::var("CONDUIT_CLIENT_CONFIG").ok());
        if let Some(path) = override_path.as_deref() {
            let contents = fs::read_to_string(path)
                .with_context(|| format!("read client config: {path}"))?;
            let override_cfg: ClientOptionsOverride =
                serde_yaml::from_str(&contents).context("parse client config yaml")?;
            override_cfg.apply(&mut options);
        }
        Ok(options)
    }

    fn from_env() -> Self {
        let mut options = Self::default();
        // Zero is a meaningful prefetch and retry count, so these accept it.
        if let Some(value) = read_env::<u32>("CONDUIT_PREFETCH") {
            options.prefetch = value;
        }
        if let Some(value) = read_usize_env("CONDUIT_MAX_QUEUE_SIZE") {
            options.max_queue_size = value;
        }
        if let Some(value) = read_u64_env("CONDUIT_RECEIVE_BATCH") {
            options.receive_batch = u32::try_from(value).unwrap_or(u32::MAX);
        }
        if let Some(value) = read_u64_env("CONDUIT_OPERATION_TIMEOUT_MS") {
            options.operation_timeout = Duration::from_millis(value);
        }
        if let Some(value) = std::env::var("CONDUIT_TRANSPORT")
            .ok()
            .and_then(|value| TransportType::parse(&value))
        {
            options.transport = value;
        }
        if let Some(value) = std::env::var("CONDUIT_RETRY_MODE")
            .ok()
            .and_then(|value| RetryMode::parse(&value))
        {
            options.retry.mode = value;
        }
        if let Some(value) = read_env::<u32>("CONDUIT_MAX_RETRIES") {
            options.retry.max_retries = value;
        }
        if let Some(value) = read_u64_env("CONDUIT_RETRY_DELAY_MS") {
            options.retry.delay = Duration::from_millis(value);
        }
        if let Some(value) = read_u64_env("CONDUIT_RETRY_MAX_DELAY_MS") {
            options.retry.max_delay = Duration::from_millis(value);
        }
        if let Some(value) = read_usize_env("CONDUIT_MAX_FRAME_BYTES") {
            options.max_frame_bytes = value;
        }
        if let Ok(value) = std::env::var("CONDUIT_CONTAINER_ID")
            && !value.is_empty()
        {
            options.container_id = value;
        }
        options
    }

    /// Publish process-wide safety caps. First install wins; returns whether
    /// this client's cap is the one in effect.
    pub(crate) fn install(&self) -> bool {
        let installed = CLIENT_RUNTIME_CONFIG.get_or_init(|| ClientRuntimeConfig {
            max_frame_bytes: self.max_frame_bytes,
        });
        if installed.max_frame_bytes != self.max_frame_bytes {
            tracing::debug!(
                requested = self.max_frame_bytes,
                effective = installed.max_frame_bytes,
                "max_frame_bytes is process-wide and already installed; keeping the first value"
            );
            return false;
        }
        true
    }
}

impl ClientOptionsOverride {
    fn apply(&self, options: &mut ClientOptions) {
        if let Some(value) = self.prefetch {
            options.prefetch = value;
        }
        if let Some(value) = self.max_queue_size
            && value > 0
        {
            options.max_queue_size = value;
        }
        if let Some(value) = self.receive_batch
            && value > 0
        {
            options.receive_batch = value;
        }
        if let Some(value) = self.operation_timeout_ms
            && value > 0
        {
            options.operation_timeout = Duration::from_millis(value);
        }
        if let Some(value) = &self.transport
            && let Some(parsed) = TransportType::parse(value)
        {
            options.transport = parsed;
        }
        if let Some(value) = &self.retry_mode
            && let Some(parsed) = RetryMode::parse(value)
        {
            options.retry.mode = parsed;
        }
        if let Some(value) = self.max_retries {
            options.retry.max_retries = value;
        }
        if let Some(value) = self.retry_delay_ms
            && value > 0
        {
            options.retry.delay = Duration::from_millis(value);
        }
        if let Some(value) = self.retry_max_delay_ms
            && value > 0
        {
            options.retry.max_delay = Duration::from_millis(value);
        }
        if let Some(value) = self.max_frame_bytes
            && value > 0
        {
            options.max_frame_bytes = value;
        }
        if let Some(value) = &self.container_id
            && !value.is_empty()
        {
            options.container_id = value.clone();
        }
        if let Some(value) = self.token_refresh_ratio
            && value > 0.0
            && value < 1.0
        {
            options.token_refresh_ratio = value;
        }
    }
}

pub(crate) fn runtime_config() -> &'static ClientRuntimeConfig {
    CLIENT_RUNTIME_CONFIG.get_or_init(|| ClientRuntimeConfig {
        max_frame_bytes: DEFAULT_MAX_FRAME_BYTES,
    })
}

fn read_env<T: std::str::FromStr>(key: &str) -> Option<T> {
    std::env::var(key)
        .ok()
        .and_then(|value| value.parse::<T>().ok())
}

fn read_u64_env(key: &str) -> Option<u64> {
    read_env::<u64>(key).filter(|value| *value > 0)
}

fn read_usize_env(key: &str) -> Option<usize> {
    read_env::<usize>(key).filter(|value| *value > 0)
}
