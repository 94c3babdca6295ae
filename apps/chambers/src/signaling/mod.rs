//! WebSocket channel to the signaling relay.
//!
//! The relay fans every envelope out to all participants of a booking,
//! including the sender; filtering self-echo is the router's job. Transport
//! loss is terminal for the channel: there is no reconnect, the caller
//! observes `ChannelState::Disconnected` and creates a new session.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use futures_util::{SinkExt, StreamExt};
use serde_json::Value;
use thiserror::Error;
use tokio::sync::{Mutex as AsyncMutex, mpsc, watch};
use tokio::task::JoinHandle;
use tokio_tungstenite::{
    connect_async,
    tungstenite::{Error as WsError, Message, error::ProtocolError},
};
use url::Url;

use crate::protocol::SignalEnvelope;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChannelState {
    Open,
    Disconnected,
}

#[derive(Debug, Error)]
pub enum SignalingError {
    #[error("invalid relay url {url}: {reason}")]
    InvalidUrl { url: String, reason: String },
}

/// Derive the per-booking websocket endpoint from the configured relay base
/// URL. `http(s)` schemes are mapped to `ws(s)`; explicit `ws(s)` is kept.
pub fn session_endpoint(relay_url: &str, booking_id: &str) -> Result<Url, SignalingError> {
    let mut url = Url::parse(relay_url).map_err(|err| SignalingError::InvalidUrl {
        url: relay_url.to_string(),
        reason: err.to_string(),
    })?;
    let scheme = match url.scheme() {
        "http" | "ws" => "ws",
        "https" | "wss" => "wss",
        other => {
            return Err(SignalingError::InvalidUrl {
                url: relay_url.to_string(),
                reason: format!("unsupported scheme {other}"),
            });
        }
    };
    url.set_scheme(scheme)
        .map_err(|_| SignalingError::InvalidUrl {
            url: relay_url.to_string(),
            reason: "scheme rejected".into(),
        })?;
    url.set_path(&format!("ws/video_session/{booking_id}/"));
    url.set_query(None);
    url.set_fragment(None);
    Ok(url)
}

/// Connection to the relay for one booking session.
///
/// Owns the reader and writer tasks for the underlying websocket. Inbound
/// frames are delivered as raw JSON values, in transport order, through the
/// receiver handed out by [`SignalingChannel::frames`]; typed demux happens
/// in the message router.
pub struct SignalingChannel {
    state_tx: Arc<watch::Sender<ChannelState>>,
    state_rx: watch::Receiver<ChannelState>,
    out_tx: mpsc::UnboundedSender<SignalEnvelope>,
    frames_rx: AsyncMutex<Option<mpsc::UnboundedReceiver<Value>>>,
    tasks: parking_lot::Mutex<Vec<JoinHandle<()>>>,
    closed: AtomicBool,
}

impl SignalingChannel {
    /// Open a transport to the relay for `booking_id`.
    ///
    /// A transport that cannot be opened is not an error here: the returned
    /// channel simply reports `Disconnected` and every `send` becomes a
    /// logged no-op. The orchestrator decides what to do with a dead channel.
    pub async fn connect(relay_url: &str, booking_id: &str) -> Self {
        let (state_tx, state_rx) = watch::channel(ChannelState::Disconnected);
        let state_tx = Arc::new(state_tx);
        let (out_tx, mut out_rx) = mpsc::unbounded_channel::<SignalEnvelope>();
        let (frames_tx, frames_rx) = mpsc::unbounded_channel::<Value>();

        let channel = Self {
            state_tx: Arc::clone(&state_tx),
            state_rx,
            out_tx,
            frames_rx: AsyncMutex::new(Some(frames_rx)),
            tasks: parking_lot::Mutex::new(Vec::new()),
            closed: AtomicBool::new(false),
        };

        let endpoint = match session_endpoint(relay_url, booking_id) {
            Ok(endpoint) => endpoint,
            Err(err) => {
                tracing::warn!(target: "signaling", error = %err, "bad relay url");
                return channel;
            }
        };

        let ws_stream = match connect_async(endpoint.as_str()).await {
            Ok((stream, _)) => stream,
            Err(err) => {
                tracing::warn!(
                    target: "signaling",
                    url = %endpoint,
                    error = %err,
                    "relay connect failed"
                );
                return channel;
            }
        };
        tracing::debug!(target: "signaling", url = %endpoint, "relay websocket connected");
        let _ = state_tx.send(ChannelState::Open);

        let (mut ws_write, mut ws_read) = ws_stream.split();

        let writer_state = Arc::clone(&state_tx);
        let writer = tokio::spawn(async move {
            while let Some(envelope) = out_rx.recv().await {
                let text = match serde_json::to_string(&envelope) {
                    Ok(text) => text,
                    Err(err) => {
                        tracing::warn!(target: "signaling", error = %err, "envelope serialize failed");
                        continue;
                    }
                };
                if ws_write.send(Message::Text(text)).await.is_err() {
                    let _ = writer_state.send(ChannelState::Disconnected);
                    break;
                }
            }
        });

        let reader_state = Arc::clone(&state_tx);
        let reader = tokio::spawn(async move {
            while let Some(msg) = ws_read.next().await {
                match msg {
                    Ok(Message::Text(text)) => forward_frame(text.as_str(), &frames_tx),
                    Ok(Message::Binary(data)) => {
                        if let Ok(text) = String::from_utf8(data) {
                            forward_frame(&text, &frames_tx);
                        }
                    }
                    Ok(Message::Close(_)) => break,
                    Ok(_) => {}
                    Err(err) => {
                        match &err {
                            WsError::ConnectionClosed
                            | WsError::AlreadyClosed
                            | WsError::Protocol(ProtocolError::ResetWithoutClosingHandshake) => {
                                tracing::debug!(target: "signaling", "relay websocket closed: {err}");
                            }
                            _ => {
                                tracing::warn!(target: "signaling", "relay websocket error: {err}");
                            }
                        }
                        break;
                    }
                }
            }
            let _ = reader_state.send(ChannelState::Disconnected);
        });

        channel.tasks.lock().extend([writer, reader]);
        channel
    }

    pub fn state(&self) -> ChannelState {
        *self.state_rx.borrow()
    }

    pub fn watch_state(&self) -> watch::Receiver<ChannelState> {
        self.state_rx.clone()
    }

    /// Queue an envelope for delivery. Only valid while the channel is open;
    /// otherwise a logged no-op so the caller's control flow is never lost.
    pub fn send(&self, envelope: SignalEnvelope) {
        if self.state() != ChannelState::Open {
            tracing::debug!(
                target: "signaling",
                kind = envelope.kind(),
                "dropping outbound envelope, channel not open"
            );
            return;
        }
        if self.out_tx.send(envelope).is_err() {
            tracing::debug!(target: "signaling", "writer task gone, envelope dropped");
        }
    }

    /// Take the inbound frame stream. Yields each received frame exactly
    /// once, in delivery order. Subsequent calls return `None`.
    pub async fn frames(&self) -> Option<mpsc::UnboundedReceiver<Value>> {
        self.frames_rx.lock().await.take()
    }

    /// Release the transport. Idempotent; safe on a channel that never
    /// opened or is already closed.
    pub fn close(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        for task in self.tasks.lock().drain(..) {
            task.abort();
        }
        let _ = self.state_tx.send(ChannelState::Disconnected);
        tracing::debug!(target: "signaling", "signaling channel closed");
    }
}

impl Drop for SignalingChannel {
    fn drop(&mut self) {
        for task in self.tasks.lock().drain(..) {
            task.abort();
        }
    }
}

fn forward_frame(text: &str, frames_tx: &mpsc::UnboundedSender<Value>) {
    match serde_json::from_str::<Value>(text) {
        Ok(value) => {
            let _ = frames_tx.send(value);
        }
        Err(err) => {
            tracing::warn!(target: "signaling", error = %err, "non-JSON relay frame dropped");
        }
    }
}
