//! CLI error types with miette diagnostics.
//!
//! Maps `CoreError` and `ConfigError` into user-facing errors with
//! actionable help text.

use miette::Diagnostic;
use thiserror::Error;

use homesync_config::ConfigError;
use homesync_core::CoreError;

/// Process exit codes.
pub mod exit_code {
    pub const GENERAL: i32 = 1;
    pub const USAGE: i32 = 2;
    pub const AUTH: i32 = 3;
    pub const NOT_FOUND: i32 = 4;
    pub const CONNECTION: i32 = 7;
    pub const TIMEOUT: i32 = 8;
}

#[derive(Debug, Error, Diagnostic)]
pub enum CliError {
    // ── Connection ───────────────────────────────────────────────────
    #[error("Could not connect to hub at {url}: {reason}")]
    #[diagnostic(
        code(homesync::connection_failed),
        help(
            "Check that the hub is running and reachable.\n\
             Try: homesync get <entity> --insecure"
        )
    )]
    ConnectionFailed { url: String, reason: String },

    #[error("Hub connection gave up after {attempts} attempts")]
    #[diagnostic(
        code(homesync::reconnect_exhausted),
        help("The hub stayed unreachable. Re-run once it is back.")
    )]
    ReconnectExhausted { attempts: u32 },

    // ── Authentication ───────────────────────────────────────────────
    #[error("Authentication failed: {message}")]
    #[diagnostic(
        code(homesync::auth_failed),
        help(
            "Create a long-lived access token in the hub's user profile.\n\
             Then run: homesync config init --hub <url> --store-token <token>"
        )
    )]
    AuthFailed { message: String },

    #[error("No access token configured for profile '{profile}'")]
    #[diagnostic(
        code(homesync::no_token),
        help(
            "Configure a token with: homesync config init\n\
             Or set the HOMESYNC_TOKEN environment variable."
        )
    )]
    NoToken { profile: String },

    // ── Hub ──────────────────────────────────────────────────────────
    #[error("{what} '{identifier}' not found")]
    #[diagnostic(code(homesync::not_found))]
    NotFound { what: String, identifier: String },

    #[error("Hub error ({code}): {message}")]
    #[diagnostic(code(homesync::api_error))]
    ApiError { code: String, message: String },

    // ── Validation ───────────────────────────────────────────────────
    #[error("Invalid value for {field}: {reason}")]
    #[diagnostic(code(homesync::validation))]
    Validation { field: String, reason: String },

    // ── Configuration ────────────────────────────────────────────────
    #[error("Profile '{name}' not found in configuration")]
    #[diagnostic(
        code(homesync::profile_not_found),
        help(
            "Available profiles: {available}\n\
             Create one with: homesync config init --hub <url>"
        )
    )]
    ProfileNotFound { name: String, available: String },

    #[error("Configuration file not found")]
    #[diagnostic(
        code(homesync::no_config),
        help(
            "Create one with: homesync config init --hub <url>\n\
             Or pass --hub and --token.\n\
             Expected at: {path}"
        )
    )]
    NoConfig { path: String },

    #[error(transparent)]
    #[diagnostic(code(homesync::config))]
    Config(Box<ConfigError>),

    // ── Timeout ──────────────────────────────────────────────────────
    #[error("Request timed out after {seconds}s")]
    #[diagnostic(
        code(homesync::timeout),
        help("Increase timeout with --timeout or check hub responsiveness.")
    )]
    Timeout { seconds: u64 },

    // ── IO / Serialization ───────────────────────────────────────────
    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error("Invalid JSON: {0}")]
    #[diagnostic(code(homesync::json))]
    Json(#[from] serde_json::Error),
}

impl CliError {
    /// Map this error to an exit code for process termination.
    pub fn exit_code(&self) -> i32 {
        match self {
            Self::ConnectionFailed { .. } | Self::ReconnectExhausted { .. } => {
                exit_code::CONNECTION
            }
            Self::AuthFailed { .. } | Self::NoToken { .. } => exit_code::AUTH,
            Self::NotFound { .. } => exit_code::NOT_FOUND,
            Self::Timeout { .. } => exit_code::TIMEOUT,
            Self::Validation { .. } => exit_code::USAGE,
            _ => exit_code::GENERAL,
        }
    }
}

// ── CoreError → CliError mapping ─────────────────────────────────────

impl From<CoreError> for CliError {
    fn from(err: CoreError) -> Self {
        match err {
            CoreError::ConnectionFailed { url, reason } => CliError::ConnectionFailed { url, reason },

            CoreError::AuthenticationFailed { message } => CliError::AuthFailed { message },

            CoreError::HubDisconnected => CliError::ConnectionFailed {
                url: "(disconnected)".into(),
                reason: "hub channel is closed".into(),
            },

            CoreError::Timeout { timeout_secs } => CliError::Timeout {
                seconds: timeout_secs,
            },

            CoreError::ServiceCallFailed { code, message } => CliError::ApiError { code, message },

            CoreError::Api {
                message,
                status: Some(404),
            } => CliError::NotFound {
                what: "resource".into(),
                identifier: message,
            },

            CoreError::Api { message, status } => CliError::ApiError {
                code: status.map_or_else(|| "api".into(), |s| s.to_string()),
                message,
            },

            CoreError::Storage(e) => CliError::ApiError {
                code: "storage".into(),
                message: e.to_string(),
            },

            CoreError::Config { message } => CliError::Validation {
                field: "config".into(),
                reason: message,
            },

            CoreError::Internal(message) => CliError::ApiError {
                code: "internal".into(),
                message,
            },
        }
    }
}

// ── ConfigError → CliError mapping ───────────────────────────────────

impl From<ConfigError> for CliError {
    fn from(err: ConfigError) -> Self {
        match err {
            ConfigError::NoToken { profile } => CliError::NoToken { profile },
            ConfigError::Validation { field, reason } => CliError::Validation { field, reason },
            ConfigError::Io(e) => CliError::Io(e),
            other => CliError::Config(Box::new(other)),
        }
    }
}
