use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::error::Error;
use std::fmt::{Display, Formatter};

pub const MAX_ENVELOPE_LEN: usize = 256 * 1024;

#[derive(Debug)]
pub enum CodecError {
    InvalidEnvelope,
    EnvelopeTooLarge,
    EncodeFailed,
}

impl Display for CodecError {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::InvalidEnvelope => write!(f, "invalid envelope"),
            Self::EnvelopeTooLarge => write!(f, "envelope exceeds limits"),
            Self::EncodeFailed => write!(f, "envelope serialization failed"),
        }
    }
}

impl Error for CodecError {}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SignalKind {
    Offer,
    Answer,
    Candidate,
}

impl SignalKind {
    /// Candidates are only meaningful inside a live negotiation and are
    /// never persisted for an offline recipient.
    pub fn is_ephemeral(self) -> bool {
        matches!(self, Self::Candidate)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Offer => "offer",
            Self::Answer => "answer",
            Self::Candidate => "candidate",
        }
    }
}

impl Display for SignalKind {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Signaling payload as sent by clients and as stored for offline peers.
/// The closed shape doubles as the mailbox discriminator: a stored row is
/// signal-shaped exactly when its content parses as this struct.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct SignalBody {
    pub signal_type: SignalKind,
    pub data: serde_json::Value,
}

impl SignalBody {
    pub fn to_content(&self) -> Result<Vec<u8>, CodecError> {
        serde_json::to_vec(self).map_err(|_| CodecError::EncodeFailed)
    }

    pub fn parse(content: &[u8]) -> Option<Self> {
        serde_json::from_slice(content).ok()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct MessageBody {
    pub encrypted_content: String,
}

/// Frames accepted from a client. Unknown `type` tags fail decoding and are
/// answered with an error envelope rather than crashing the session.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum ClientEnvelope {
    Connect {
        token: String,
    },
    Disconnect,
    #[serde(rename_all = "camelCase")]
    Signal {
        recipient_id: i64,
        payload: SignalBody,
    },
    #[serde(rename_all = "camelCase")]
    Message {
        recipient_id: i64,
        payload: MessageBody,
    },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SignalDelivery {
    pub sender: i64,
    pub signal_type: SignalKind,
    pub data: serde_json::Value,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MessageDelivery {
    pub sender: i64,
    pub encrypted_content: String,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeliveryReceipt {
    pub recipient: i64,
    pub delivered: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message_id: Option<i64>,
    pub timestamp: DateTime<Utc>,
}

fn is_false(flag: &bool) -> bool {
    !*flag
}

/// One mailbox row inside the bundled post-connect flush.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum PendingItem {
    #[serde(rename_all = "camelCase")]
    Signal {
        id: i64,
        sender: i64,
        signal_type: SignalKind,
        data: serde_json::Value,
        timestamp: DateTime<Utc>,
    },
    /// `binary` marks content that was not valid UTF-8 and rides
    /// hex-encoded; text content is carried verbatim.
    #[serde(rename_all = "camelCase")]
    Message {
        id: i64,
        sender: i64,
        encrypted_content: String,
        #[serde(default, skip_serializing_if = "is_false")]
        binary: bool,
        timestamp: DateTime<Utc>,
    },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PendingBatch {
    pub messages: Vec<PendingItem>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PresenceStatus {
    Online,
    Offline,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PresenceUpdate {
    pub peer: i64,
    pub status: PresenceStatus,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ErrorBody {
    pub code: String,
    pub message: String,
}

/// Frames pushed to a client.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum ServerEnvelope {
    #[serde(rename_all = "camelCase")]
    Connected {
        peer_id: i64,
        session: String,
    },
    Signal {
        payload: SignalDelivery,
    },
    Message {
        payload: MessageDelivery,
    },
    Delivered {
        payload: DeliveryReceipt,
    },
    Pending {
        payload: PendingBatch,
    },
    Presence {
        payload: PresenceUpdate,
    },
    Error {
        payload: ErrorBody,
    },
}

impl ServerEnvelope {
    pub fn error(code: &str, message: impl Into<String>) -> Self {
        Self::Error {
            payload: ErrorBody {
                code: code.to_string(),
                message: message.into(),
            },
        }
    }
}

/// Decodes one inbound text frame, rejecting oversized input before parsing.
pub fn decode_client(text: &str) -> Result<ClientEnvelope, CodecError> {
    if text.len() > MAX_ENVELOPE_LEN {
        return Err(CodecError::EnvelopeTooLarge);
    }
    serde_json::from_str(text).map_err(|_| CodecError::InvalidEnvelope)
}

/// Serializes one outbound envelope, enforcing the same bound as decoding.
pub fn encode_server(envelope: &ServerEnvelope) -> Result<String, CodecError> {
    let encoded = serde_json::to_string(envelope).map_err(|_| CodecError::EncodeFailed)?;
    if encoded.len() > MAX_ENVELOPE_LEN {
        return Err(CodecError::EnvelopeTooLarge);
    }
    Ok(encoded)
}
