//! Hub configuration.

use std::net::SocketAddr;
use std::str::FromStr;
use std::time::Duration;
use tracing::warn;

/// Runtime settings for a hub instance.
///
/// Every limit has a sensible default; use the setters to override, or
/// [`Settings::from_env`] to load overrides from `HUB_*` environment
/// variables.
#[derive(Clone, Debug)]
pub struct Settings {
    /// Address the HTTP server binds to.
    pub bind: SocketAddr,
    /// Time-to-live applied to every committed frame.
    pub ttl: Duration,
    /// Maximum accepted append body size in bytes.
    pub max_payload_size: usize,
    /// Maximum accepted size of a single request header value in bytes.
    pub max_header_size: usize,
    /// Maximum encoded envelope size before a substitute error envelope is sent.
    pub max_websocket_frame_size: usize,
    /// How often the live loop wakes to re-check termination conditions.
    pub live_poll_interval: Duration,
    /// How long subscriber teardown waits for the listener task to unwind.
    pub listener_shutdown_timeout: Duration,
    /// Bound on buffered live notifications per subscriber.
    pub live_queue_capacity: usize,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            bind: SocketAddr::from(([127, 0, 0, 1], 8000)),
            ttl: Duration::from_secs(3600),
            max_payload_size: 16 * 1024 * 1024,
            max_header_size: 8 * 1024,
            max_websocket_frame_size: 1024 * 1024,
            live_poll_interval: Duration::from_secs(1),
            listener_shutdown_timeout: Duration::from_secs(2),
            live_queue_capacity: 1024,
        }
    }
}

impl Settings {
    /// Create settings with defaults.
    pub fn new() -> Self {
        Self::default()
    }

    /// Load settings, applying `HUB_*` environment overrides on top of the
    /// defaults. Unparseable values are logged and ignored.
    pub fn from_env() -> Self {
        let mut settings = Self::default();
        if let Some(bind) = env_parse("HUB_BIND") {
            settings.bind = bind;
        }
        if let Some(secs) = env_parse("HUB_TTL_SECONDS") {
            settings.ttl = Duration::from_secs(secs);
        }
        if let Some(size) = env_parse("HUB_MAX_PAYLOAD_SIZE") {
            settings.max_payload_size = size;
        }
        if let Some(size) = env_parse("HUB_MAX_HEADER_SIZE") {
            settings.max_header_size = size;
        }
        if let Some(size) = env_parse("HUB_MAX_WEBSOCKET_FRAME_SIZE") {
            settings.max_websocket_frame_size = size;
        }
        settings
    }

    /// Set the bind address.
    pub fn bind(mut self, bind: SocketAddr) -> Self {
        self.bind = bind;
        self
    }

    /// Set the frame time-to-live.
    pub fn ttl(mut self, ttl: Duration) -> Self {
        self.ttl = ttl;
        self
    }

    /// Set the maximum append body size.
    pub fn max_payload_size(mut self, bytes: usize) -> Self {
        self.max_payload_size = bytes;
        self
    }

    /// Set the maximum request header value size.
    pub fn max_header_size(mut self, bytes: usize) -> Self {
        self.max_header_size = bytes;
        self
    }

    /// Set the maximum encoded envelope size.
    pub fn max_websocket_frame_size(mut self, bytes: usize) -> Self {
        self.max_websocket_frame_size = bytes;
        self
    }

    /// Set the live loop poll interval.
    pub fn live_poll_interval(mut self, interval: Duration) -> Self {
        self.live_poll_interval = interval;
        self
    }

    /// Set the listener teardown wait bound.
    pub fn listener_shutdown_timeout(mut self, timeout: Duration) -> Self {
        self.listener_shutdown_timeout = timeout;
        self
    }
}

fn env_parse<T: FromStr>(name: &str) -> Option<T> {
    let raw = std::env::var(name).ok()?;
    match raw.parse() {
        Ok(value) => Some(value),
        Err(_) => {
            warn!(name, raw, "ignoring unparseable environment override");
            None
        }
    }
}
