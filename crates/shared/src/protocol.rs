use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::{
    domain::{ClientId, ConversationId, MediaMode, MessageId, MessageKind, UserId},
    error::ApiError,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SdpKind {
    Offer,
    Answer,
}

/// A session description (offer or answer) produced by one peer's media
/// stack and applied verbatim by the remote peer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionDescription {
    pub kind: SdpKind,
    pub sdp: String,
}

impl SessionDescription {
    pub fn offer(sdp: impl Into<String>) -> Self {
        Self {
            kind: SdpKind::Offer,
            sdp: sdp.into(),
        }
    }

    pub fn answer(sdp: impl Into<String>) -> Self {
        Self {
            kind: SdpKind::Answer,
            sdp: sdp.into(),
        }
    }
}

/// One network path descriptor gathered during connectivity checks.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CandidatePayload {
    pub candidate: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sdp_mid: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sdp_mline_index: Option<u32>,
}

/// Relayed signaling payload. Untagged on purpose: the relay carries
/// descriptions and candidates under a single event name, so receivers
/// dispatch on payload shape rather than a type tag.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum SignalPayload {
    Description(SessionDescription),
    Candidate(CandidatePayload),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MessagePayload {
    pub conversation_id: ConversationId,
    pub message_id: MessageId,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub client_id: Option<ClientId>,
    pub sender_id: UserId,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sender_username: Option<String>,
    pub body: String,
    pub kind: MessageKind,
    pub sent_at: DateTime<Utc>,
}

/// Events a client emits on the channel.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "payload", rename_all = "snake_case")]
pub enum ClientEmit {
    JoinRoom {
        conversation_id: ConversationId,
    },
    SendMessage {
        conversation_id: ConversationId,
        client_id: ClientId,
        body: String,
        kind: MessageKind,
    },
    Typing {
        conversation_id: ConversationId,
    },
    StopTyping {
        conversation_id: ConversationId,
    },
    CallUser {
        peer_id: UserId,
        mode: MediaMode,
        offer: SessionDescription,
    },
    AcceptCall {
        peer_id: UserId,
        answer: SessionDescription,
    },
    RejectCall {
        peer_id: UserId,
    },
    EndCall {
        peer_id: UserId,
    },
    CallSignal {
        peer_id: UserId,
        signal: SignalPayload,
    },
}

/// Events the server delivers to a client. Events of the same name arrive
/// in per-peer emission order; nothing is guaranteed across distinct names.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "payload", rename_all = "snake_case")]
pub enum ServerEvent {
    ReceiveMessage {
        message: MessagePayload,
    },
    Typing {
        conversation_id: ConversationId,
        user_id: UserId,
    },
    StopTyping {
        conversation_id: ConversationId,
        user_id: UserId,
    },
    IncomingCall {
        peer_id: UserId,
        mode: MediaMode,
        offer: SessionDescription,
    },
    CallAccepted {},
    CallRejected {},
    CallEnded {},
    CallSignal {
        peer_id: UserId,
        signal: SignalPayload,
    },
    Error(ApiError),
}
