use std::sync::Arc;

use serde_json::Value;

use super::SessionInner;
use crate::protocol::SignalEnvelope;

/// Demultiplexes inbound relay frames onto the negotiation controller and
/// the chat log. Stateless: every decision is made from the envelope and the
/// session's current state. Never raises into the delivery loop; protocol
/// noise is logged and dropped.
pub(crate) struct MessageRouter {
    inner: Arc<SessionInner>,
}

impl MessageRouter {
    pub(crate) fn new(inner: Arc<SessionInner>) -> Self {
        Self { inner }
    }

    pub(crate) async fn dispatch(&self, raw: Value) {
        let envelope = match SignalEnvelope::from_value(&raw) {
            Ok(envelope) => envelope,
            Err(err) => {
                tracing::warn!(target: "session", error = %err, "unroutable envelope dropped");
                return;
            }
        };

        let own = envelope.sender() == self.inner.identity.participant_id;
        tracing::trace!(
            target: "session",
            kind = envelope.kind(),
            from = envelope.sender(),
            own,
            "envelope received"
        );

        match envelope {
            // Chat keeps its relay echo: the log records deliveries, and the
            // relay delivers to the sender too.
            SignalEnvelope::ChatMessage(message) => self.inner.chat.append(message),
            // The relay fans negotiation envelopes back to their sender as
            // well; those must not feed our own state machine.
            _ if own => {
                tracing::debug!(target: "session", kind = envelope.kind(), "self echo dropped");
            }
            SignalEnvelope::Offer(payload) => {
                super::handle_remote_offer(&self.inner, payload).await
            }
            SignalEnvelope::Answer(payload) => {
                super::handle_remote_answer(&self.inner, payload).await
            }
            SignalEnvelope::IceCandidate(payload) => {
                super::handle_remote_candidate(&self.inner, payload).await
            }
        }
    }
}
