//! Peer-connection negotiation state machine.
//!
//! One controller per negotiation attempt. The first description decides the
//! role: `initiate` makes this side the offerer, `accept_offer` the
//! answerer. Remote candidates that arrive before the remote description are
//! queued and replayed in arrival order once it lands, since the far side
//! may start trickling before our answer (or their answer) has travelled.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use thiserror::Error;
use tokio::sync::{Mutex as AsyncMutex, mpsc, watch};
use webrtc::api::APIBuilder;
use webrtc::api::interceptor_registry::register_default_interceptors;
use webrtc::api::media_engine::MediaEngine;
use webrtc::ice_transport::ice_candidate::RTCIceCandidate;
use webrtc::ice_transport::ice_connection_state::RTCIceConnectionState;
use webrtc::ice_transport::ice_server::RTCIceServer;
use webrtc::interceptor::registry::Registry;
use webrtc::peer_connection::RTCPeerConnection;
use webrtc::peer_connection::configuration::RTCConfiguration;
use webrtc::peer_connection::peer_connection_state::RTCPeerConnectionState;
use webrtc::rtp_transceiver::RTCRtpTransceiver;
use webrtc::rtp_transceiver::rtp_codec::RTPCodecType;
use webrtc::rtp_transceiver::rtp_receiver::RTCRtpReceiver;
use webrtc::rtp_transceiver::rtp_sender::RTCRtpSender;
use webrtc::track::track_local::TrackLocal;
use webrtc::track::track_remote::TrackRemote;

use crate::media::{MediaCaptureController, TrackKind};
use crate::protocol::{IceCandidateBlob, SessionDescriptionBlob};

/// Observable negotiation state. Transitions are monotonic except
/// `Connected → Disconnected`, which may recur while the network degrades
/// and recovers. `Failed` is terminal apart from `close()`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Idle,
    Connecting,
    Connected,
    Disconnected,
    Failed,
}

#[derive(Debug, Error)]
pub enum NegotiationError {
    #[error("{op} is not valid in state {state:?}")]
    InvalidState {
        op: &'static str,
        state: ConnectionState,
    },
    #[error("negotiation engine: {0}")]
    Engine(#[from] webrtc::Error),
}

/// An inbound media track from the counterpart, handed to the presentation
/// layer for rendering.
pub struct RemoteTrack {
    pub kind: TrackKind,
    pub track: Arc<TrackRemote>,
}

pub struct PeerConnectionController {
    pc: Arc<RTCPeerConnection>,
    state_tx: Arc<watch::Sender<ConnectionState>>,
    state_rx: watch::Receiver<ConnectionState>,
    // Remote candidates held back until the remote description is applied.
    pending_remote: AsyncMutex<PendingCandidates>,
    initiated: AtomicBool,
    closed: AtomicBool,
    senders: AsyncMutex<Vec<Arc<RTCRtpSender>>>,
    local_candidates_rx: AsyncMutex<Option<mpsc::UnboundedReceiver<IceCandidateBlob>>>,
    remote_tracks_rx: AsyncMutex<Option<mpsc::UnboundedReceiver<RemoteTrack>>>,
}

#[derive(Default)]
struct PendingCandidates {
    queue: Vec<IceCandidateBlob>,
    remote_description_set: bool,
}

impl PeerConnectionController {
    /// Build a fresh controller in `Idle`, wired to the given
    /// address-discovery servers.
    pub async fn new(stun_servers: &[String]) -> Result<Self, NegotiationError> {
        let mut media_engine = MediaEngine::default();
        media_engine.register_default_codecs()?;
        let registry = register_default_interceptors(Registry::new(), &mut media_engine)?;
        let api = APIBuilder::new()
            .with_media_engine(media_engine)
            .with_interceptor_registry(registry)
            .build();

        let ice_servers = if stun_servers.is_empty() {
            Vec::new()
        } else {
            vec![RTCIceServer {
                urls: stun_servers.to_vec(),
                ..Default::default()
            }]
        };
        let config = RTCConfiguration {
            ice_servers,
            ..Default::default()
        };
        let pc = Arc::new(api.new_peer_connection(config).await?);

        let (state_tx, state_rx) = watch::channel(ConnectionState::Idle);
        let state_tx = Arc::new(state_tx);
        let (candidate_tx, candidate_rx) = mpsc::unbounded_channel::<IceCandidateBlob>();
        let (track_tx, track_rx) = mpsc::unbounded_channel::<RemoteTrack>();

        pc.on_ice_candidate(Box::new(move |candidate: Option<RTCIceCandidate>| {
            let candidate_tx = candidate_tx.clone();
            Box::pin(async move {
                let Some(candidate) = candidate else { return };
                match IceCandidateBlob::from_candidate(&candidate) {
                    Ok(blob) => {
                        let _ = candidate_tx.send(blob);
                    }
                    Err(err) => {
                        tracing::debug!(target: "webrtc", error = %err, "local candidate encode failed");
                    }
                }
            })
        }));

        pc.on_track(Box::new(
            move |track: Arc<TrackRemote>,
                  _receiver: Arc<RTCRtpReceiver>,
                  _transceiver: Arc<RTCRtpTransceiver>| {
                let track_tx = track_tx.clone();
                Box::pin(async move {
                    let kind = match track.kind() {
                        RTPCodecType::Video => TrackKind::Video,
                        _ => TrackKind::Audio,
                    };
                    tracing::debug!(target: "webrtc", ?kind, "remote track arrived");
                    let _ = track_tx.send(RemoteTrack { kind, track });
                })
            },
        ));

        let state_for_pc = Arc::clone(&state_tx);
        pc.on_peer_connection_state_change(Box::new(move |observed: RTCPeerConnectionState| {
            let state_tx = Arc::clone(&state_for_pc);
            Box::pin(async move {
                apply_observation(&state_tx, observed);
            })
        }));

        pc.on_ice_connection_state_change(Box::new(move |state: RTCIceConnectionState| {
            Box::pin(async move {
                tracing::debug!(target: "webrtc", ?state, "ice connection state");
            })
        }));

        Ok(Self {
            pc,
            state_tx,
            state_rx,
            pending_remote: AsyncMutex::new(PendingCandidates::default()),
            initiated: AtomicBool::new(false),
            closed: AtomicBool::new(false),
            senders: AsyncMutex::new(Vec::new()),
            local_candidates_rx: AsyncMutex::new(Some(candidate_rx)),
            remote_tracks_rx: AsyncMutex::new(Some(track_rx)),
        })
    }

    pub fn state(&self) -> ConnectionState {
        *self.state_rx.borrow()
    }

    pub fn watch_state(&self) -> watch::Receiver<ConnectionState> {
        self.state_rx.clone()
    }

    /// Locally discovered candidates, for transmission through the
    /// signaling channel. Take-once.
    pub async fn local_candidates(&self) -> Option<mpsc::UnboundedReceiver<IceCandidateBlob>> {
        self.local_candidates_rx.lock().await.take()
    }

    /// Inbound media tracks. Take-once.
    pub async fn remote_tracks(&self) -> Option<mpsc::UnboundedReceiver<RemoteTrack>> {
        self.remote_tracks_rx.lock().await.take()
    }

    pub async fn attached_senders(&self) -> usize {
        self.senders.lock().await.len()
    }

    pub async fn pending_candidates(&self) -> usize {
        self.pending_remote.lock().await.queue.len()
    }

    /// Whether the remote description has been applied yet.
    pub async fn has_remote_description(&self) -> bool {
        self.pending_remote.lock().await.remote_description_set
    }

    /// Attach local tracks, produce the offer and set it as the local
    /// description. Valid only from `Idle`; moves to `Connecting`.
    pub async fn initiate(
        &self,
        media: &MediaCaptureController,
    ) -> Result<SessionDescriptionBlob, NegotiationError> {
        self.guard_idle("initiate")?;
        self.initiated.store(true, Ordering::SeqCst);
        let result = self.produce_offer(media).await;
        match result {
            Ok(blob) => {
                self.enter_connecting();
                Ok(blob)
            }
            Err(err) => {
                self.enter_failed(&err);
                Err(err)
            }
        }
    }

    /// Apply a remote offer, attach local tracks and produce the answer.
    /// Valid only from `Idle`: the first offer received decides that this
    /// side answers. Moves to `Connecting`.
    pub async fn accept_offer(
        &self,
        remote_offer: &SessionDescriptionBlob,
        media: &MediaCaptureController,
    ) -> Result<SessionDescriptionBlob, NegotiationError> {
        self.guard_idle("accept_offer")?;
        let result = self.produce_answer(remote_offer, media).await;
        match result {
            Ok(blob) => {
                self.enter_connecting();
                Ok(blob)
            }
            Err(err) => {
                self.enter_failed(&err);
                Err(err)
            }
        }
    }

    /// Apply the remote answer to a negotiation this side initiated. No
    /// state transition of its own: `Connected` arrives asynchronously once
    /// the transport path is up.
    pub async fn accept_answer(
        &self,
        remote_answer: &SessionDescriptionBlob,
    ) -> Result<(), NegotiationError> {
        if self.state() != ConnectionState::Connecting
            || !self.initiated.load(Ordering::SeqCst)
            || self.has_remote_description().await
        {
            return Err(NegotiationError::InvalidState {
                op: "accept_answer",
                state: self.state(),
            });
        }
        let result = self.apply_remote_description(remote_answer).await;
        if let Err(err) = result {
            self.enter_failed(&err);
            return Err(err);
        }
        Ok(())
    }

    /// Apply a remote candidate, or queue it while the remote description is
    /// still in flight. Each candidate is applied exactly once, in arrival
    /// order.
    pub async fn add_remote_ice_candidate(
        &self,
        candidate: IceCandidateBlob,
    ) -> Result<(), NegotiationError> {
        let state = self.state();
        if !matches!(
            state,
            ConnectionState::Connecting | ConnectionState::Connected
        ) {
            return Err(NegotiationError::InvalidState {
                op: "add_remote_ice_candidate",
                state,
            });
        }
        let mut pending = self.pending_remote.lock().await;
        if !pending.remote_description_set {
            tracing::debug!(target: "webrtc", "queueing early remote candidate");
            pending.queue.push(candidate);
            return Ok(());
        }
        drop(pending);
        self.pc.add_ice_candidate(candidate.to_init()).await?;
        Ok(())
    }

    /// Release all negotiation resources. Safe from any state, any number
    /// of times; the only way out of `Failed`.
    pub async fn close(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        if let Err(err) = self.pc.close().await {
            tracing::debug!(target: "webrtc", error = %err, "peer connection close");
        }
        self.state_tx.send_if_modified(|current| {
            if *current == ConnectionState::Failed || *current == ConnectionState::Disconnected {
                false
            } else {
                *current = ConnectionState::Disconnected;
                true
            }
        });
    }

    async fn produce_offer(
        &self,
        media: &MediaCaptureController,
    ) -> Result<SessionDescriptionBlob, NegotiationError> {
        self.attach_tracks(media).await?;
        let offer = self.pc.create_offer(None).await?;
        self.pc.set_local_description(offer.clone()).await?;
        Ok(SessionDescriptionBlob::from_description(&offer))
    }

    async fn produce_answer(
        &self,
        remote_offer: &SessionDescriptionBlob,
        media: &MediaCaptureController,
    ) -> Result<SessionDescriptionBlob, NegotiationError> {
        self.apply_remote_description(remote_offer).await?;
        self.attach_tracks(media).await?;
        let answer = self.pc.create_answer(None).await?;
        self.pc.set_local_description(answer.clone()).await?;
        Ok(SessionDescriptionBlob::from_description(&answer))
    }

    async fn attach_tracks(&self, media: &MediaCaptureController) -> Result<(), NegotiationError> {
        let mut senders = self.senders.lock().await;
        for track in media.rtc_tracks() {
            let track: Arc<dyn TrackLocal + Send + Sync> = track;
            let sender = self.pc.add_track(track).await?;
            senders.push(sender);
        }
        Ok(())
    }

    async fn apply_remote_description(
        &self,
        blob: &SessionDescriptionBlob,
    ) -> Result<(), NegotiationError> {
        let description = blob.to_description()?;
        self.pc.set_remote_description(description).await?;

        // Flag and flush under the same lock so a candidate racing in cannot
        // slip between the replay and the flag flip.
        let mut pending = self.pending_remote.lock().await;
        pending.remote_description_set = true;
        let queued = std::mem::take(&mut pending.queue);
        if !queued.is_empty() {
            tracing::debug!(target: "webrtc", count = queued.len(), "replaying queued candidates");
        }
        for candidate in queued {
            if let Err(err) = self.pc.add_ice_candidate(candidate.to_init()).await {
                tracing::warn!(target: "webrtc", error = %err, "queued candidate rejected");
            }
        }
        Ok(())
    }

    fn guard_idle(&self, op: &'static str) -> Result<(), NegotiationError> {
        let state = self.state();
        if state != ConnectionState::Idle {
            return Err(NegotiationError::InvalidState { op, state });
        }
        Ok(())
    }

    fn enter_connecting(&self) {
        self.state_tx.send_if_modified(|current| {
            if *current == ConnectionState::Idle {
                *current = ConnectionState::Connecting;
                true
            } else {
                false
            }
        });
    }

    fn enter_failed(&self, err: &NegotiationError) {
        tracing::warn!(target: "webrtc", error = %err, "negotiation failed");
        self.state_tx.send_if_modified(|current| {
            if *current == ConnectionState::Idle || *current == ConnectionState::Connecting {
                *current = ConnectionState::Failed;
                true
            } else {
                false
            }
        });
    }
}

impl Drop for PeerConnectionController {
    fn drop(&mut self) {
        if self.closed.load(Ordering::SeqCst) {
            return;
        }
        if let Ok(handle) = tokio::runtime::Handle::try_current() {
            let pc = Arc::clone(&self.pc);
            handle.spawn(async move {
                let _ = pc.close().await;
            });
        }
    }
}

fn apply_observation(state_tx: &watch::Sender<ConnectionState>, observed: RTCPeerConnectionState) {
    state_tx.send_if_modified(|current| match transition(*current, observed) {
        Some(next) => {
            tracing::info!(target: "webrtc", from = ?*current, to = ?next, "connection state");
            *current = next;
            true
        }
        None => false,
    });
}

/// Map an engine-level observation onto the negotiation state machine.
/// `Failed` while connecting is a negotiation failure and terminal; the same
/// observation after the session was up is network loss, which stays
/// recoverable only through a brand-new controller.
fn transition(
    current: ConnectionState,
    observed: RTCPeerConnectionState,
) -> Option<ConnectionState> {
    use ConnectionState::*;
    if current == Failed || current == Idle {
        return None;
    }
    match observed {
        RTCPeerConnectionState::Connected => match current {
            Connecting | Disconnected => Some(Connected),
            _ => None,
        },
        RTCPeerConnectionState::Disconnected => match current {
            Connecting | Connected => Some(Disconnected),
            _ => None,
        },
        RTCPeerConnectionState::Failed => match current {
            Connecting => Some(Failed),
            Connected => Some(Disconnected),
            _ => None,
        },
        _ => None,
    }
}
