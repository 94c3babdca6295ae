//! Top-level owner of one booking session.
//!
//! The orchestrator wires the signaling channel, media capture, the peer
//! controller and the chat log together, and guarantees they are torn down
//! together. Every component instance belongs to exactly one orchestrator;
//! there is no process-wide session state.

pub mod chat;
pub mod router;

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

use thiserror::Error;
use tokio::sync::{Mutex as AsyncMutex, mpsc, watch};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::config::Config;
use crate::media::{CaptureDevice, CaptureError, MediaCaptureController};
use crate::peer::{ConnectionState, NegotiationError, PeerConnectionController, RemoteTrack};
use crate::protocol::{
    AnswerPayload, CandidatePayload, ChatMessage, OfferPayload, SignalEnvelope,
};
use crate::signaling::{ChannelState, SignalingChannel};

pub use chat::ChatSession;

/// Who this participant is within one booking session. Created once,
/// immutable for the session's lifetime.
#[derive(Debug, Clone)]
pub struct SessionIdentity {
    pub participant_id: String,
    pub booking_id: String,
    pub display_name: String,
}

impl SessionIdentity {
    pub fn new(booking_id: impl Into<String>, display_name: impl Into<String>) -> Self {
        Self {
            participant_id: Uuid::new_v4().to_string(),
            booking_id: booking_id.into(),
            display_name: display_name.into(),
        }
    }
}

#[derive(Debug, Error)]
pub enum SessionError {
    #[error("camera/microphone permission denied")]
    MediaDenied,
    #[error("media capture failed: {0}")]
    Capture(CaptureError),
    #[error("negotiation failed: {0}")]
    Negotiation(#[from] NegotiationError),
    #[error("session is closed")]
    Closed,
}

impl From<CaptureError> for SessionError {
    fn from(err: CaptureError) -> Self {
        match err {
            CaptureError::PermissionDenied => SessionError::MediaDenied,
            other => SessionError::Capture(other),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Role {
    Offerer,
    Answerer,
}

#[derive(Default)]
struct NegotiationSlot {
    peer: Option<Arc<PeerConnectionController>>,
    media: Option<Arc<MediaCaptureController>>,
    role: Option<Role>,
}

struct SessionInner {
    identity: SessionIdentity,
    stun_servers: Vec<String>,
    channel: SignalingChannel,
    chat: ChatSession,
    device: Arc<dyn CaptureDevice>,
    negotiation: AsyncMutex<NegotiationSlot>,
    state_tx: watch::Sender<ConnectionState>,
    state_rx: watch::Receiver<ConnectionState>,
    remote_tracks_tx: mpsc::UnboundedSender<RemoteTrack>,
    remote_tracks_rx: AsyncMutex<Option<mpsc::UnboundedReceiver<RemoteTrack>>>,
    // Bumped for every controller this session creates; forwarding tasks of
    // a superseded controller stop as soon as the count moves past them.
    generation: AtomicU64,
    cancel: CancellationToken,
    closed: AtomicBool,
    tasks: parking_lot::Mutex<Vec<JoinHandle<()>>>,
}

/// One booking session end to end.
pub struct SessionOrchestrator {
    inner: Arc<SessionInner>,
}

impl SessionOrchestrator {
    /// Connect the signaling channel and start dispatching inbound
    /// envelopes. Negotiation does not begin until `start_session` or a
    /// remote offer arrives.
    pub async fn start(
        config: &Config,
        identity: SessionIdentity,
        device: Arc<dyn CaptureDevice>,
    ) -> Self {
        let channel = SignalingChannel::connect(&config.relay_url, &identity.booking_id).await;
        let (state_tx, state_rx) = watch::channel(ConnectionState::Idle);
        let (remote_tracks_tx, remote_tracks_rx) = mpsc::unbounded_channel();

        let inner = Arc::new(SessionInner {
            identity,
            stun_servers: config.stun_servers.clone(),
            channel,
            chat: ChatSession::new(),
            device,
            negotiation: AsyncMutex::new(NegotiationSlot::default()),
            state_tx,
            state_rx,
            remote_tracks_tx,
            remote_tracks_rx: AsyncMutex::new(Some(remote_tracks_rx)),
            generation: AtomicU64::new(0),
            cancel: CancellationToken::new(),
            closed: AtomicBool::new(false),
            tasks: parking_lot::Mutex::new(Vec::new()),
        });

        if let Some(mut frames) = inner.channel.frames().await {
            let router = router::MessageRouter::new(Arc::clone(&inner));
            let cancel = inner.cancel.clone();
            let dispatch = tokio::spawn(async move {
                loop {
                    tokio::select! {
                        _ = cancel.cancelled() => break,
                        frame = frames.recv() => {
                            let Some(raw) = frame else { break };
                            router.dispatch(raw).await;
                        }
                    }
                }
            });
            inner.tasks.lock().push(dispatch);
        }

        Self { inner }
    }

    pub fn identity(&self) -> &SessionIdentity {
        &self.inner.identity
    }

    pub fn chat(&self) -> &ChatSession {
        &self.inner.chat
    }

    /// Session-level view of the negotiation state. Starts at `Idle` and
    /// follows whichever controller is current.
    pub fn connection_state(&self) -> watch::Receiver<ConnectionState> {
        self.inner.state_rx.clone()
    }

    pub fn channel_state(&self) -> watch::Receiver<ChannelState> {
        self.inner.channel.watch_state()
    }

    /// Inbound media tracks from the counterpart, across controller
    /// replacements. Take-once.
    pub async fn remote_tracks(&self) -> Option<mpsc::UnboundedReceiver<RemoteTrack>> {
        self.inner.remote_tracks_rx.lock().await.take()
    }

    /// Begin a call as the offerer: acquire media, create the controller,
    /// send the offer. Duplicate calls while a negotiation is underway are
    /// refused idempotently: exactly one attempt stays in flight.
    pub async fn start_session(&self) -> Result<(), SessionError> {
        if self.inner.closed.load(Ordering::SeqCst) {
            return Err(SessionError::Closed);
        }
        let mut slot = self.inner.negotiation.lock().await;
        if slot.peer.is_some() {
            tracing::info!(target: "session", "negotiation already underway, duplicate start ignored");
            return Ok(());
        }
        if self.inner.channel.state() != ChannelState::Open {
            tracing::warn!(
                target: "session",
                "signaling channel is not open; the offer cannot reach the counterpart"
            );
        }

        let media = ensure_media(&self.inner, &mut slot).await?;
        let peer = Arc::new(PeerConnectionController::new(&self.inner.stun_servers).await?);
        let offer = peer.initiate(&media).await?;

        self.inner.channel.send(SignalEnvelope::Offer(OfferPayload {
            offer,
            from: self.inner.identity.participant_id.clone(),
        }));
        wire_peer(&self.inner, &peer).await;
        slot.peer = Some(peer);
        slot.role = Some(Role::Offerer);
        tracing::info!(target: "session", "offer sent, negotiating as offerer");
        Ok(())
    }

    /// Queue a chat message to the relay. The local log is updated when the
    /// relay echoes the message back to the whole group, so the log holds
    /// exactly what was delivered.
    pub fn send_chat(&self, text: impl Into<String>) {
        let message = ChatMessage {
            text: text.into(),
            sender_id: self.inner.identity.participant_id.clone(),
            sender_name: self.inner.identity.display_name.clone(),
            timestamp: time::OffsetDateTime::now_utc(),
        };
        self.inner.channel.send(SignalEnvelope::ChatMessage(message));
    }

    /// Toggle microphone transmission. No renegotiation, no state change.
    pub async fn set_audio_enabled(&self, enabled: bool) {
        let slot = self.inner.negotiation.lock().await;
        match &slot.media {
            Some(media) => media.set_audio_enabled(enabled),
            None => tracing::debug!(target: "session", "audio toggle before capture, ignored"),
        }
    }

    /// Toggle camera transmission. No renegotiation, no state change.
    pub async fn set_video_enabled(&self, enabled: bool) {
        let slot = self.inner.negotiation.lock().await;
        match &slot.media {
            Some(media) => media.set_video_enabled(enabled),
            None => tracing::debug!(target: "session", "video toggle before capture, ignored"),
        }
    }

    pub async fn audio_enabled(&self) -> bool {
        let slot = self.inner.negotiation.lock().await;
        slot.media.as_ref().is_some_and(|m| m.audio_enabled())
    }

    pub async fn video_enabled(&self) -> bool {
        let slot = self.inner.negotiation.lock().await;
        slot.media.as_ref().is_some_and(|m| m.video_enabled())
    }

    /// Number of local tracks attached to the live controller. Mute toggles
    /// must never change this.
    pub async fn attached_tracks(&self) -> usize {
        let slot = self.inner.negotiation.lock().await;
        match &slot.peer {
            Some(peer) => peer.attached_senders().await,
            None => 0,
        }
    }

    /// Tear the whole session down: channel, controller, capture. Safe to
    /// call from any state, any number of times; completes in bounded time.
    pub async fn close(&self) {
        if self.inner.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        self.inner.cancel.cancel();
        {
            let mut slot = self.inner.negotiation.lock().await;
            if let Some(peer) = slot.peer.take() {
                peer.close().await;
            }
            if let Some(media) = slot.media.take() {
                media.release();
            }
            slot.role = None;
        }
        self.inner.channel.close();
        for task in self.inner.tasks.lock().drain(..) {
            task.abort();
        }
        tracing::info!(target: "session", booking = %self.inner.identity.booking_id, "session closed");
    }
}

impl Drop for SessionOrchestrator {
    fn drop(&mut self) {
        self.inner.cancel.cancel();
        for task in self.inner.tasks.lock().drain(..) {
            task.abort();
        }
    }
}

/// Acquire camera+microphone once per session; reused across controller
/// replacements. Permission denial aborts before any controller exists.
async fn ensure_media(
    inner: &Arc<SessionInner>,
    slot: &mut NegotiationSlot,
) -> Result<Arc<MediaCaptureController>, SessionError> {
    if let Some(media) = &slot.media {
        return Ok(Arc::clone(media));
    }
    let media = Arc::new(
        MediaCaptureController::acquire(inner.device.as_ref(), inner.cancel.child_token()).await?,
    );
    slot.media = Some(Arc::clone(&media));
    Ok(media)
}

/// Forward a controller's candidates, tracks and state into the
/// session-level streams until a newer controller supersedes it.
async fn wire_peer(inner: &Arc<SessionInner>, peer: &Arc<PeerConnectionController>) {
    let generation = inner.generation.fetch_add(1, Ordering::SeqCst) + 1;

    if let Some(mut candidates) = peer.local_candidates().await {
        let forward = Arc::clone(inner);
        let task = tokio::spawn(async move {
            while let Some(blob) = candidates.recv().await {
                if forward.generation.load(Ordering::SeqCst) != generation {
                    break;
                }
                forward
                    .channel
                    .send(SignalEnvelope::IceCandidate(CandidatePayload {
                        candidate: blob,
                        from: forward.identity.participant_id.clone(),
                    }));
            }
        });
        inner.tasks.lock().push(task);
    }

    if let Some(mut tracks) = peer.remote_tracks().await {
        let forward = Arc::clone(inner);
        let task = tokio::spawn(async move {
            while let Some(track) = tracks.recv().await {
                if forward.generation.load(Ordering::SeqCst) != generation {
                    break;
                }
                let _ = forward.remote_tracks_tx.send(track);
            }
        });
        inner.tasks.lock().push(task);
    }

    let mut state = peer.watch_state();
    let forward = Arc::clone(inner);
    let task = tokio::spawn(async move {
        loop {
            let current = *state.borrow_and_update();
            if forward.generation.load(Ordering::SeqCst) == generation {
                let _ = forward.state_tx.send(current);
            }
            if state.changed().await.is_err() {
                break;
            }
        }
    });
    inner.tasks.lock().push(task);
}

async fn handle_remote_offer(inner: &Arc<SessionInner>, payload: OfferPayload) {
    let mut slot = inner.negotiation.lock().await;

    if let Some(peer) = &slot.peer {
        let offer_in_flight = slot.role == Some(Role::Offerer)
            && peer.state() == ConnectionState::Connecting
            && !peer.has_remote_description().await;
        if !offer_in_flight {
            tracing::info!(
                target: "session",
                from = %payload.from,
                "offer while a negotiation is already settled, ignored"
            );
            return;
        }
        // Simultaneous offers. Deterministic tie-break: the smaller
        // participant id keeps the offerer role, the larger yields and
        // answers. Both sides agree without extra signaling.
        if inner.identity.participant_id < payload.from {
            tracing::info!(
                target: "session",
                from = %payload.from,
                "simultaneous offers, keeping offerer role"
            );
            return;
        }
        tracing::info!(
            target: "session",
            from = %payload.from,
            "simultaneous offers, yielding offerer role"
        );
        inner.generation.fetch_add(1, Ordering::SeqCst);
        if let Some(old) = slot.peer.take() {
            old.close().await;
        }
        slot.role = None;
    }

    let media = match ensure_media(inner, &mut slot).await {
        Ok(media) => media,
        Err(err) => {
            tracing::error!(target: "session", error = %err, "cannot answer offer without media");
            return;
        }
    };
    let peer = match PeerConnectionController::new(&inner.stun_servers).await {
        Ok(peer) => Arc::new(peer),
        Err(err) => {
            tracing::error!(target: "session", error = %err, "controller creation failed");
            return;
        }
    };
    match peer.accept_offer(&payload.offer, &media).await {
        Ok(answer) => {
            inner.channel.send(SignalEnvelope::Answer(AnswerPayload {
                answer,
                from: inner.identity.participant_id.clone(),
            }));
            wire_peer(inner, &peer).await;
            slot.peer = Some(peer);
            slot.role = Some(Role::Answerer);
            tracing::info!(
                target: "session",
                from = %payload.from,
                "answer sent, negotiating as answerer"
            );
        }
        Err(err) => {
            tracing::warn!(target: "session", error = %err, "remote offer rejected");
            // Keep the failed controller so its state is observable.
            wire_peer(inner, &peer).await;
            slot.peer = Some(peer);
            slot.role = Some(Role::Answerer);
        }
    }
}

async fn handle_remote_answer(inner: &Arc<SessionInner>, payload: AnswerPayload) {
    let slot = inner.negotiation.lock().await;
    let Some(peer) = &slot.peer else {
        tracing::debug!(target: "session", "answer with no active negotiation, dropped");
        return;
    };
    match peer.accept_answer(&payload.answer).await {
        Ok(()) => {
            tracing::info!(target: "session", from = %payload.from, "remote answer applied");
        }
        Err(NegotiationError::InvalidState { state, .. }) => {
            tracing::debug!(target: "session", ?state, "stale or duplicate answer ignored");
        }
        Err(err) => {
            tracing::warn!(target: "session", error = %err, "remote answer rejected");
        }
    }
}

async fn handle_remote_candidate(inner: &Arc<SessionInner>, payload: CandidatePayload) {
    let slot = inner.negotiation.lock().await;
    let Some(peer) = &slot.peer else {
        tracing::debug!(target: "session", "candidate with no active negotiation, dropped");
        return;
    };
    match peer.add_remote_ice_candidate(payload.candidate).await {
        Ok(()) => {}
        Err(NegotiationError::InvalidState { state, .. }) => {
            tracing::debug!(target: "session", ?state, "candidate outside negotiation, dropped");
        }
        Err(err) => {
            tracing::warn!(target: "session", error = %err, "remote candidate rejected");
        }
    }
}
