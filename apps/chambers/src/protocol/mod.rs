use serde::{Deserialize, Serialize};
use serde_json::Value;
use time::OffsetDateTime;
use webrtc::ice_transport::ice_candidate::{RTCIceCandidate, RTCIceCandidateInit};
use webrtc::peer_connection::sdp::sdp_type::RTCSdpType;
use webrtc::peer_connection::sdp::session_description::RTCSessionDescription;

/// One signaling envelope as it travels through the relay.
///
/// The relay itself never inspects the payload beyond the `type` tag; it
/// fans every envelope out to the whole booking group, sender included.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", content = "payload", rename_all = "snake_case")]
pub enum SignalEnvelope {
    Offer(OfferPayload),
    Answer(AnswerPayload),
    IceCandidate(CandidatePayload),
    ChatMessage(ChatMessage),
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OfferPayload {
    pub offer: SessionDescriptionBlob,
    pub from: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AnswerPayload {
    pub answer: SessionDescriptionBlob,
    pub from: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CandidatePayload {
    pub candidate: IceCandidateBlob,
    pub from: String,
}

/// Opaque SDP carrier. Serializes to the `{ "type": ..., "sdp": ... }` shape
/// browsers produce for `RTCSessionDescription`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionDescriptionBlob {
    #[serde(rename = "type")]
    pub kind: SdpKind,
    pub sdp: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SdpKind {
    Offer,
    Answer,
}

impl SessionDescriptionBlob {
    pub fn from_description(desc: &RTCSessionDescription) -> Self {
        let kind = match desc.sdp_type {
            RTCSdpType::Answer => SdpKind::Answer,
            _ => SdpKind::Offer,
        };
        Self {
            kind,
            sdp: desc.sdp.clone(),
        }
    }

    /// Rebuild the engine-level description. Consumed exactly once as a
    /// remote description by the peer.
    pub fn to_description(&self) -> Result<RTCSessionDescription, webrtc::Error> {
        match self.kind {
            SdpKind::Offer => RTCSessionDescription::offer(self.sdp.clone()),
            SdpKind::Answer => RTCSessionDescription::answer(self.sdp.clone()),
        }
    }
}

/// One network-path candidate, camelCase on the wire to match what
/// `RTCIceCandidate.toJSON()` emits in browsers.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IceCandidateBlob {
    pub candidate: String,
    #[serde(rename = "sdpMid", default)]
    pub sdp_mid: Option<String>,
    #[serde(rename = "sdpMLineIndex", default)]
    pub sdp_mline_index: Option<u16>,
    #[serde(
        rename = "usernameFragment",
        default,
        skip_serializing_if = "Option::is_none"
    )]
    pub username_fragment: Option<String>,
}

impl IceCandidateBlob {
    pub fn from_candidate(candidate: &RTCIceCandidate) -> Result<Self, webrtc::Error> {
        let json = candidate.to_json()?;
        Ok(Self {
            candidate: json.candidate,
            sdp_mid: json.sdp_mid,
            sdp_mline_index: json.sdp_mline_index,
            username_fragment: json.username_fragment,
        })
    }

    pub fn to_init(&self) -> RTCIceCandidateInit {
        RTCIceCandidateInit {
            candidate: self.candidate.clone(),
            sdp_mid: self.sdp_mid.clone(),
            sdp_mline_index: self.sdp_mline_index,
            username_fragment: self.username_fragment.clone(),
        }
    }
}

/// Immutable once created; appended to the chat log in arrival order.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChatMessage {
    pub text: String,
    #[serde(rename = "senderId")]
    pub sender_id: String,
    #[serde(rename = "senderName")]
    pub sender_name: String,
    #[serde(with = "time::serde::rfc3339")]
    pub timestamp: OffsetDateTime,
}

impl SignalEnvelope {
    pub fn to_value(&self) -> Result<Value, serde_json::Error> {
        serde_json::to_value(self)
    }

    pub fn from_value(value: &Value) -> Result<Self, serde_json::Error> {
        serde_json::from_value(value.clone())
    }

    /// Participant that produced this envelope.
    pub fn sender(&self) -> &str {
        match self {
            SignalEnvelope::Offer(p) => &p.from,
            SignalEnvelope::Answer(p) => &p.from,
            SignalEnvelope::IceCandidate(p) => &p.from,
            SignalEnvelope::ChatMessage(m) => &m.sender_id,
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            SignalEnvelope::Offer(_) => "offer",
            SignalEnvelope::Answer(_) => "answer",
            SignalEnvelope::IceCandidate(_) => "ice_candidate",
            SignalEnvelope::ChatMessage(_) => "chat_message",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use time::macros::datetime;

    #[test]
    fn offer_envelope_matches_relay_wire_format() {
        let envelope = SignalEnvelope::Offer(OfferPayload {
            offer: SessionDescriptionBlob {
                kind: SdpKind::Offer,
                sdp: "v=0\r\n".into(),
            },
            from: "participant-a".into(),
        });

        let value = envelope.to_value().unwrap();
        assert_eq!(
            value,
            json!({
                "type": "offer",
                "payload": {
                    "offer": { "type": "offer", "sdp": "v=0\r\n" },
                    "from": "participant-a",
                }
            })
        );
    }

    #[test]
    fn ice_candidate_envelope_uses_browser_field_names() {
        let envelope = SignalEnvelope::IceCandidate(CandidatePayload {
            candidate: IceCandidateBlob {
                candidate: "candidate:1 1 udp 2130706431 127.0.0.1 4444 typ host".into(),
                sdp_mid: Some("0".into()),
                sdp_mline_index: Some(0),
                username_fragment: None,
            },
            from: "participant-a".into(),
        });

        let value = envelope.to_value().unwrap();
        assert_eq!(
            value,
            json!({
                "type": "ice_candidate",
                "payload": {
                    "candidate": {
                        "candidate": "candidate:1 1 udp 2130706431 127.0.0.1 4444 typ host",
                        "sdpMid": "0",
                        "sdpMLineIndex": 0,
                    },
                    "from": "participant-a",
                }
            })
        );
    }

    #[test]
    fn chat_message_round_trips_field_for_field() {
        let raw = json!({
            "type": "chat_message",
            "payload": {
                "text": "hello",
                "senderId": "participant-a",
                "senderName": "Client",
                "timestamp": "2026-08-07T12:00:00Z",
            }
        });

        let envelope = SignalEnvelope::from_value(&raw).unwrap();
        let SignalEnvelope::ChatMessage(msg) = &envelope else {
            panic!("expected chat message");
        };
        assert_eq!(msg.text, "hello");
        assert_eq!(msg.sender_id, "participant-a");
        assert_eq!(msg.sender_name, "Client");
        assert_eq!(msg.timestamp, datetime!(2026-08-07 12:00:00 UTC));

        assert_eq!(envelope.to_value().unwrap(), raw);
    }

    #[test]
    fn browser_iso_timestamps_parse() {
        // JS `new Date().toISOString()` keeps milliseconds.
        let raw = json!({
            "type": "chat_message",
            "payload": {
                "text": "hi",
                "senderId": "a",
                "senderName": "A",
                "timestamp": "2026-08-07T12:00:00.123Z",
            }
        });
        assert!(SignalEnvelope::from_value(&raw).is_ok());
    }

    #[test]
    fn unknown_envelope_type_is_a_parse_error() {
        let raw = json!({ "type": "screen_share", "payload": {} });
        assert!(SignalEnvelope::from_value(&raw).is_err());
    }

    #[test]
    fn sender_is_extracted_per_variant() {
        let envelope = SignalEnvelope::Answer(AnswerPayload {
            answer: SessionDescriptionBlob {
                kind: SdpKind::Answer,
                sdp: String::new(),
            },
            from: "participant-b".into(),
        });
        assert_eq!(envelope.sender(), "participant-b");
        assert_eq!(envelope.kind(), "answer");
    }
}
