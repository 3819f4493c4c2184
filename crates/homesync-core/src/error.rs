// ── Core error types ──
//
// User-facing errors from homesync-core. Consumers never see HTTP status
// codes or frame parse failures directly; the `From<homesync_api::Error>`
// impl translates transport-layer errors into domain variants.
// State reads (`get`, `subscribe`) never return these at all.

use thiserror::Error;

use crate::store::StorageError;

/// Unified error type for the core crate.
#[derive(Debug, Error)]
pub enum CoreError {
    // ── Connection errors ────────────────────────────────────────────
    #[error("Cannot connect to hub at {url}: {reason}")]
    ConnectionFailed { url: String, reason: String },

    #[error("Authentication failed: {message}")]
    AuthenticationFailed { message: String },

    #[error("Hub channel closed")]
    HubDisconnected,

    #[error("Hub call timed out after {timeout_secs}s")]
    Timeout { timeout_secs: u64 },

    // ── Operation errors ─────────────────────────────────────────────
    #[error("Service call rejected by hub ({code}): {message}")]
    ServiceCallFailed { code: String, message: String },

    // ── API errors (wrapped, not exposed raw) ────────────────────────
    #[error("API error: {message}")]
    Api {
        message: String,
        /// HTTP status code (if applicable).
        status: Option<u16>,
    },

    // ── Storage errors ───────────────────────────────────────────────
    #[error("Durable cache error: {0}")]
    Storage(#[from] StorageError),

    // ── Configuration errors ─────────────────────────────────────────
    #[error("Configuration error: {message}")]
    Config { message: String },

    // ── Internal errors ──────────────────────────────────────────────
    #[error("Internal error: {0}")]
    Internal(String),
}

// ── Conversion from transport-layer errors ───────────────────────────

impl From<homesync_api::Error> for CoreError {
    fn from(err: homesync_api::Error) -> Self {
        match err {
            homesync_api::Error::Authentication { message } => {
                CoreError::AuthenticationFailed { message }
            }
            homesync_api::Error::Transport(ref e) => {
                if e.is_timeout() {
                    CoreError::Timeout { timeout_secs: 0 }
                } else if e.is_connect() {
                    CoreError::ConnectionFailed {
                        url: e
                            .url()
                            .map(ToString::to_string)
                            .unwrap_or_else(|| "<unknown>".into()),
                        reason: e.to_string(),
                    }
                } else {
                    CoreError::Api {
                        message: e.to_string(),
                        status: e.status().map(|s| s.as_u16()),
                    }
                }
            }
            homesync_api::Error::InvalidUrl(e) => CoreError::Config {
                message: format!("Invalid URL: {e}"),
            },
            homesync_api::Error::Timeout { timeout_secs } => CoreError::Timeout { timeout_secs },
            homesync_api::Error::Tls(msg) => CoreError::ConnectionFailed {
                url: String::new(),
                reason: format!("TLS error: {msg}"),
            },
            homesync_api::Error::Http { status, message } => CoreError::Api {
                message,
                status: Some(status),
            },
            homesync_api::Error::WebSocketConnect(reason) => CoreError::ConnectionFailed {
                url: String::new(),
                reason: format!("WebSocket connection failed: {reason}"),
            },
            homesync_api::Error::WebSocketClosed { code, reason } => CoreError::ConnectionFailed {
                url: String::new(),
                reason: format!("WebSocket closed (code {code}): {reason}"),
            },
            homesync_api::Error::Protocol(msg) => {
                CoreError::Internal(format!("Protocol error: {msg}"))
            }
            homesync_api::Error::Deserialization { message, body: _ } => {
                CoreError::Internal(format!("Deserialization error: {message}"))
            }
        }
    }
}
