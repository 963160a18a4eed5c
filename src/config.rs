//! Transport configuration types.

use std::time::Duration;

use tokio_tungstenite::tungstenite::protocol::WebSocketConfig;

use crate::outbound::DEFAULT_ARENA_CAPACITY;

/// Largest WebSocket message either side will accept, matching the
/// transport's own default.
const DEFAULT_MAX_WS_MESSAGE: usize = 64 << 20;

/// Client-side connection settings.
#[derive(Clone, Debug)]
pub struct ClientConfig {
    /// Endpoint to dial, e.g. `ws://127.0.0.1:9000/`.
    pub url: String,
    /// Time allowed for the dial and WebSocket handshake.
    pub connect_timeout: Duration,
    /// Default per-call deadline; `None` waits until the reply or the
    /// connection teardown resolves the call.
    pub request_timeout: Option<Duration>,
    /// Initial outbound arena capacity in bytes.
    pub arena_capacity: usize,
    /// Upper bound on one inbound logical message.
    pub max_message_size: Option<usize>,
}

impl ClientConfig {
    /// Settings for `url` with defaults for everything else.
    #[must_use]
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            connect_timeout: Duration::from_secs(10),
            request_timeout: Some(Duration::from_secs(60)),
            arena_capacity: DEFAULT_ARENA_CAPACITY,
            max_message_size: Some(DEFAULT_MAX_WS_MESSAGE),
        }
    }

    pub(crate) fn ws_config(&self) -> WebSocketConfig {
        let mut config = WebSocketConfig::default();
        config.max_message_size = self.max_message_size;
        config
    }
}

/// Host-side settings.
#[derive(Clone, Debug)]
pub struct ServerConfig {
    /// Read buffer cap per connection, applied to HTTP request reading.
    /// The HTTP stack enforces a floor of 8 KiB.
    pub read_buffer_size: usize,
    /// Initial outbound arena capacity per connection, in bytes.
    pub arena_capacity: usize,
    /// Largest accepted single-shot HTTP request body.
    pub max_http_body: usize,
    /// Upper bound on one inbound logical WebSocket message.
    pub max_message_size: Option<usize>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            read_buffer_size: 8 * 1024,
            arena_capacity: DEFAULT_ARENA_CAPACITY,
            max_http_body: 1 << 20,
            max_message_size: Some(DEFAULT_MAX_WS_MESSAGE),
        }
    }
}

impl ServerConfig {
    pub(crate) fn ws_config(&self) -> WebSocketConfig {
        let mut config = WebSocketConfig::default();
        config.max_message_size = self.max_message_size;
        config
    }
}
