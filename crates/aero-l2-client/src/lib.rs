//! Client side of the L2 tunnel.
//!
//! A session is established in two steps: a credentialed POST to
//! `${gateway}/session` that issues the session cookie (and may advertise a
//! non-default tunnel path under `endpoints.l2`), then a WebSocket upgrade
//! against that path offering the `aero-l2-tunnel-v1` subprotocol. The
//! gateway refuses cookie-less upgrades, so a failed bootstrap surfaces
//! before any frame is sent.
//!
//! Once connected, [`L2TunnelSession`] pumps raw ethernet frames in both
//! directions. PINGs from the gateway are answered inline; malformed input
//! and ERROR records surface as [`L2TunnelEvent::Error`] through a throttle
//! so a misbehaving peer cannot flood observers.

mod throttle;

pub use throttle::ErrorThrottle;

use std::time::{Duration, Instant};

use futures_util::{SinkExt, StreamExt};
use serde::Deserialize;
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::HeaderValue;
use tokio_tungstenite::tungstenite::Message;
use tracing::{debug, warn};
use url::Url;

use aero_l2_protocol::{
    decode_message, encode_frame, encode_pong, L2_TUNNEL_TYPE_ERROR, L2_TUNNEL_TYPE_FRAME,
    L2_TUNNEL_TYPE_PING, L2_TUNNEL_TYPE_PONG, TUNNEL_SUBPROTOCOL,
};

pub const DEFAULT_L2_PATH: &str = "/l2";

#[derive(Debug, thiserror::Error)]
pub enum SessionError {
    #[error("invalid gateway url: {0}")]
    BadGatewayUrl(#[from] url::ParseError),

    #[error("session bootstrap failed: {0}")]
    Bootstrap(#[from] reqwest::Error),

    #[error("session endpoint rejected credentials (status {status})")]
    Unauthorized { status: u16 },

    #[error("session endpoint returned status {status}")]
    BootstrapStatus { status: u16 },

    #[error("session endpoint issued no session cookie")]
    MissingSessionCookie,

    #[error("gateway url scheme {scheme:?} cannot carry a websocket")]
    UnsupportedScheme { scheme: String },

    #[error("websocket upgrade failed: {0}")]
    WebSocket(#[from] tokio_tungstenite::tungstenite::Error),

    #[error("gateway did not negotiate subprotocol {TUNNEL_SUBPROTOCOL:?} (got {negotiated:?})")]
    SubprotocolMismatch { negotiated: Option<String> },

    #[error("session is closed")]
    Closed,
}

#[derive(Debug, Clone)]
pub struct L2ClientConfig {
    /// `http(s)` base of the gateway, e.g. `http://127.0.0.1:8080`.
    pub gateway_url: String,
    /// Minimum spacing between emitted error events.
    pub error_throttle: Duration,
}

impl L2ClientConfig {
    pub fn new(gateway_url: impl Into<String>) -> Self {
        Self { gateway_url: gateway_url.into(), error_throttle: Duration::from_secs(1) }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum L2TunnelEvent {
    /// One ethernet frame from the gateway.
    Frame(Vec<u8>),
    /// Throttled error report; `suppressed` counts events folded into this
    /// one.
    Error { message: String, suppressed: u64 },
    /// The socket closed; no further events follow.
    Closed,
}

#[derive(Debug, Deserialize)]
struct SessionResponse {
    #[serde(default)]
    endpoints: Option<SessionEndpoints>,
}

#[derive(Debug, Deserialize)]
struct SessionEndpoints {
    #[serde(default)]
    l2: Option<String>,
}

#[derive(Debug)]
pub struct L2TunnelSession {
    outgoing: mpsc::Sender<Vec<u8>>,
    events: mpsc::Receiver<L2TunnelEvent>,
}

impl L2TunnelSession {
    /// Bootstraps a session cookie and opens the tunnel socket.
    pub async fn connect(config: &L2ClientConfig) -> Result<Self, SessionError> {
        let base = Url::parse(&config.gateway_url)?;
        let session_url = base.join("session")?;

        let http = reqwest::Client::builder().build()?;
        let response = http.post(session_url).send().await?;
        let status = response.status().as_u16();
        if status == 401 || status == 403 {
            return Err(SessionError::Unauthorized { status });
        }
        if !response.status().is_success() {
            return Err(SessionError::BootstrapStatus { status });
        }

        let cookie = session_cookie_header(&response).ok_or(SessionError::MissingSessionCookie)?;
        let body: SessionResponse = response.json().await.unwrap_or(SessionResponse { endpoints: None });
        let l2_path = body
            .endpoints
            .and_then(|e| e.l2)
            .unwrap_or_else(|| DEFAULT_L2_PATH.to_string());

        let mut ws_url = base.join(&l2_path)?;
        let ws_scheme = if ws_url.scheme() == "https" { "wss" } else { "ws" };
        if ws_url.set_scheme(ws_scheme).is_err() {
            return Err(SessionError::UnsupportedScheme { scheme: base.scheme().to_string() });
        }

        let mut request = ws_url.as_str().into_client_request()?;
        request.headers_mut().insert(
            "Sec-WebSocket-Protocol",
            HeaderValue::from_static(TUNNEL_SUBPROTOCOL),
        );
        request.headers_mut().insert(
            "Cookie",
            HeaderValue::from_str(&cookie)
                .map_err(|_| SessionError::MissingSessionCookie)?,
        );

        let (socket, upgrade) = tokio_tungstenite::connect_async(request).await?;
        let negotiated = upgrade
            .headers()
            .get("sec-websocket-protocol")
            .and_then(|v| v.to_str().ok())
            .map(str::to_string);
        if negotiated.as_deref() != Some(TUNNEL_SUBPROTOCOL) {
            return Err(SessionError::SubprotocolMismatch { negotiated });
        }

        let (outgoing_tx, outgoing_rx) = mpsc::channel(64);
        let (event_tx, event_rx) = mpsc::channel(64);
        let throttle = ErrorThrottle::new(config.error_throttle);
        tokio::spawn(pump(socket, outgoing_rx, event_tx, throttle));

        Ok(Self { outgoing: outgoing_tx, events: event_rx })
    }

    /// Queues one ethernet frame for the gateway.
    pub async fn send_frame(&self, frame: Vec<u8>) -> Result<(), SessionError> {
        self.outgoing.send(frame).await.map_err(|_| SessionError::Closed)
    }

    /// Next session event; `None` after [`L2TunnelEvent::Closed`].
    pub async fn next_event(&mut self) -> Option<L2TunnelEvent> {
        self.events.recv().await
    }
}

fn session_cookie_header(response: &reqwest::Response) -> Option<String> {
    let cookies: Vec<String> = response
        .headers()
        .get_all("set-cookie")
        .iter()
        .filter_map(|v| v.to_str().ok())
        .filter_map(|v| v.split(';').next())
        .map(str::to_string)
        .collect();
    if cookies.is_empty() {
        None
    } else {
        Some(cookies.join("; "))
    }
}

async fn pump<S>(
    socket: tokio_tungstenite::WebSocketStream<S>,
    mut outgoing: mpsc::Receiver<Vec<u8>>,
    events: mpsc::Sender<L2TunnelEvent>,
    mut throttle: ErrorThrottle,
) where
    S: tokio::io::AsyncRead + tokio::io::AsyncWrite + Unpin,
{
    let (mut tx, mut rx) = socket.split();

    let report = |message: String, throttle: &mut ErrorThrottle| {
        match throttle.admit(Instant::now()) {
            Some(suppressed) => Some(L2TunnelEvent::Error { message, suppressed }),
            None => {
                debug!(message, "suppressed tunnel error event");
                None
            }
        }
    };

    loop {
        tokio::select! {
            frame = outgoing.recv() => {
                let Some(frame) = frame else { break };
                let wire = match encode_frame(&frame) {
                    Ok(wire) => wire,
                    Err(err) => {
                        if let Some(event) = report(format!("encode: {err}"), &mut throttle) {
                            let _ = events.send(event).await;
                        }
                        continue;
                    }
                };
                if tx.send(Message::Binary(wire.into())).await.is_err() {
                    break;
                }
            }
            msg = rx.next() => {
                let Some(msg) = msg else { break };
                let msg = match msg {
                    Ok(msg) => msg,
                    Err(err) => {
                        warn!(error = %err, "tunnel socket error");
                        break;
                    }
                };
                let data = match msg {
                    Message::Binary(data) => data,
                    Message::Close(_) => break,
                    // Text and low-level ping/pong frames are not part of
                    // the tunnel protocol.
                    _ => continue,
                };
                match decode_message(&data) {
                    Ok(decoded) => match decoded.msg_type {
                        L2_TUNNEL_TYPE_FRAME => {
                            if events
                                .send(L2TunnelEvent::Frame(decoded.payload.to_vec()))
                                .await
                                .is_err()
                            {
                                break;
                            }
                        }
                        L2_TUNNEL_TYPE_PING => {
                            if let Ok(pong) = encode_pong(Some(decoded.payload)) {
                                if tx.send(Message::Binary(pong.into())).await.is_err() {
                                    break;
                                }
                            }
                        }
                        L2_TUNNEL_TYPE_PONG => {}
                        L2_TUNNEL_TYPE_ERROR => {
                            let message = describe_error_payload(decoded.payload);
                            if let Some(event) = report(message, &mut throttle) {
                                let _ = events.send(event).await;
                            }
                        }
                        _ => unreachable!("decode_message only yields known types"),
                    },
                    Err(err) => {
                        if let Some(event) = report(format!("malformed record: {err}"), &mut throttle) {
                            let _ = events.send(event).await;
                        }
                    }
                }
            }
        }
    }

    let _ = events.send(L2TunnelEvent::Closed).await;
}

fn describe_error_payload(payload: &[u8]) -> String {
    match aero_l2_protocol::decode_structured_error_payload(payload) {
        Some((code, msg)) => format!("gateway error {code}: {msg}"),
        None => format!("gateway error ({} byte payload)", payload.len()),
    }
}
