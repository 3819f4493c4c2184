//! Authenticated WebSocket channel to the hub.
//!
//! [`HubChannel::open`] performs the connect + `auth_required` / `auth` /
//! `auth_ok` handshake and hands back a split writer/reader pair. The
//! reconnection loop itself lives with the connection supervisor in
//! `homesync-core`; this module only provides the backoff schedule
//! ([`ReconnectConfig`], [`calculate_backoff`]).
//!
//! # Example
//!
//! ```rust,ignore
//! use homesync_api::websocket::{HubChannel, websocket_url};
//!
//! let url = websocket_url(&"http://homeassistant.local:8123".parse()?)?;
//! let channel = HubChannel::open(&url, &token).await?;
//! let (mut writer, mut reader) = channel.into_split();
//!
//! while let Some(frame) = reader.next_frame().await {
//!     println!("{:?}", frame?);
//! }
//! ```

use std::time::Duration;

use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use secrecy::{ExposeSecret, SecretString};
use tokio::net::TcpStream;
use tokio_tungstenite::tungstenite::{self, Message};
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};
use url::Url;

use crate::error::Error;
use crate::protocol::{ClientFrame, ServerFrame};

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

// ── ReconnectConfig ──────────────────────────────────────────────────

/// Exponential backoff configuration for WebSocket reconnection.
#[derive(Debug, Clone)]
pub struct ReconnectConfig {
    /// Delay before the first reconnection attempt. Default: 3s.
    pub initial_delay: Duration,

    /// Upper bound on backoff delay. Default: 60s.
    pub max_delay: Duration,

    /// Maximum reconnection attempts before giving up.
    /// `None` means retry forever. Default: 10.
    pub max_retries: Option<u32>,
}

impl Default for ReconnectConfig {
    fn default() -> Self {
        Self {
            initial_delay: Duration::from_secs(3),
            max_delay: Duration::from_secs(60),
            max_retries: Some(10),
        }
    }
}

/// Exponential backoff: `min(initial * 2^attempt, max)`.
pub fn calculate_backoff(attempt: u32, config: &ReconnectConfig) -> Duration {
    let factor = 2u32.checked_pow(attempt).unwrap_or(u32::MAX);
    config
        .initial_delay
        .checked_mul(factor)
        .unwrap_or(config.max_delay)
        .min(config.max_delay)
}

// ── URL helpers ──────────────────────────────────────────────────────

/// Derive the WebSocket endpoint (`ws[s]://host[:port]/…/api/websocket`)
/// from the hub's HTTP base URL.
pub fn websocket_url(base: &Url) -> Result<Url, Error> {
    let scheme = match base.scheme() {
        "https" | "wss" => "wss",
        "http" | "ws" => "ws",
        other => {
            return Err(Error::WebSocketConnect(format!(
                "unsupported URL scheme: {other}"
            )));
        }
    };
    let host = base
        .host_str()
        .ok_or_else(|| Error::WebSocketConnect(format!("URL has no host: {base}")))?;
    let prefix = base.path().trim_end_matches('/');
    let url = match base.port() {
        Some(port) => format!("{scheme}://{host}:{port}{prefix}/api/websocket"),
        None => format!("{scheme}://{host}{prefix}/api/websocket"),
    };
    Ok(Url::parse(&url)?)
}

// ── HubChannel ───────────────────────────────────────────────────────

/// An authenticated duplex channel to the hub.
pub struct HubChannel {
    stream: WsStream,
    ha_version: Option<String>,
}

impl HubChannel {
    /// Connect and authenticate.
    ///
    /// Returns [`Error::Authentication`] when the hub answers
    /// `auth_invalid`; every other failure is a transport error.
    pub async fn open(url: &Url, token: &SecretString) -> Result<Self, Error> {
        tracing::info!(url = %url, "Connecting to hub WebSocket");

        let (stream, _response) = tokio_tungstenite::connect_async(url.as_str())
            .await
            .map_err(|e| Error::WebSocketConnect(e.to_string()))?;

        let mut channel = Self {
            stream,
            ha_version: None,
        };
        channel.authenticate(token).await?;
        Ok(channel)
    }

    /// Hub version reported during the handshake.
    pub fn ha_version(&self) -> Option<&str> {
        self.ha_version.as_deref()
    }

    pub fn into_split(self) -> (FrameWriter, FrameReader) {
        let (sink, stream) = self.stream.split();
        (FrameWriter { sink }, FrameReader { stream })
    }

    async fn authenticate(&mut self, token: &SecretString) -> Result<(), Error> {
        match self.read_frame().await? {
            ServerFrame::AuthRequired { ha_version } => self.ha_version = ha_version,
            // Some proxies skip the prompt and expect the token right away.
            ServerFrame::AuthOk { ha_version } => {
                self.ha_version = ha_version;
                return Ok(());
            }
            other => {
                return Err(Error::Protocol(format!(
                    "expected auth_required, got {other:?}"
                )));
            }
        }

        let auth = ClientFrame::Auth {
            access_token: token.expose_secret().to_owned(),
        };
        send_frame(&mut self.stream, &auth).await?;

        match self.read_frame().await? {
            ServerFrame::AuthOk { ha_version } => {
                if ha_version.is_some() {
                    self.ha_version = ha_version;
                }
                tracing::info!(ha_version = ?self.ha_version, "Hub accepted credential");
                Ok(())
            }
            ServerFrame::AuthInvalid { message } => Err(Error::Authentication {
                message: message.unwrap_or_else(|| "invalid access token".into()),
            }),
            other => Err(Error::Protocol(format!(
                "expected auth_ok or auth_invalid, got {other:?}"
            ))),
        }
    }

    async fn read_frame(&mut self) -> Result<ServerFrame, Error> {
        loop {
            match self.stream.next().await {
                Some(Ok(Message::Text(text))) => {
                    return ServerFrame::parse(&text).map_err(|e| Error::Deserialization {
                        message: e.to_string(),
                        body: text.to_string(),
                    });
                }
                Some(Ok(Message::Close(frame))) => return Err(closed(frame)),
                Some(Ok(_)) => {}
                Some(Err(e)) => return Err(Error::WebSocketConnect(e.to_string())),
                None => return Err(closed(None)),
            }
        }
    }
}

// ── Split halves ─────────────────────────────────────────────────────

/// Outbound half of a [`HubChannel`].
pub struct FrameWriter {
    sink: SplitSink<WsStream, Message>,
}

impl FrameWriter {
    pub async fn send(&mut self, frame: &ClientFrame) -> Result<(), Error> {
        let text = frame.to_json().map_err(|e| Error::Protocol(e.to_string()))?;
        tracing::trace!(kind = frame.kind(), id = ?frame.id(), "sending frame");
        self.sink
            .send(Message::Text(text.into()))
            .await
            .map_err(|e| Error::WebSocketConnect(e.to_string()))
    }

    /// Send a close frame. Errors are ignored: the peer may already be gone.
    pub async fn close(&mut self) {
        let _ = self.sink.close().await;
    }
}

/// Inbound half of a [`HubChannel`].
pub struct FrameReader {
    stream: SplitStream<WsStream>,
}

impl FrameReader {
    /// Next parsed frame.
    ///
    /// Returns `None` once the hub closes the channel cleanly. Frames that
    /// fail to parse are logged and skipped.
    pub async fn next_frame(&mut self) -> Option<Result<ServerFrame, Error>> {
        loop {
            match self.stream.next().await? {
                Ok(Message::Text(text)) => match ServerFrame::parse(&text) {
                    Ok(frame) => return Some(Ok(frame)),
                    Err(e) => {
                        tracing::debug!(error = %e, "Failed to parse hub frame");
                    }
                },
                Ok(Message::Close(frame)) => {
                    if let Some(ref cf) = frame {
                        tracing::info!(
                            code = %cf.code,
                            reason = %cf.reason,
                            "WebSocket close frame received"
                        );
                    } else {
                        tracing::info!("WebSocket close frame received (no payload)");
                    }
                    return None;
                }
                Ok(Message::Ping(_)) => {
                    // tungstenite queues the pong reply itself
                    tracing::trace!("WebSocket ping");
                }
                Ok(_) => {
                    // Binary, Pong, Frame -- ignore
                }
                Err(e) => return Some(Err(Error::WebSocketConnect(e.to_string()))),
            }
        }
    }
}

async fn send_frame(stream: &mut WsStream, frame: &ClientFrame) -> Result<(), Error> {
    let text = frame.to_json().map_err(|e| Error::Protocol(e.to_string()))?;
    stream
        .send(Message::Text(text.into()))
        .await
        .map_err(|e| Error::WebSocketConnect(e.to_string()))
}

fn closed(frame: Option<tungstenite::protocol::CloseFrame>) -> Error {
    match frame {
        Some(cf) => Error::WebSocketClosed {
            code: cf.code.into(),
            reason: cf.reason.to_string(),
        },
        None => Error::WebSocketClosed {
            code: 1006,
            reason: "connection closed during handshake".into(),
        },
    }
}

// ── Tests ────────────────────────────────────────────────────────────
