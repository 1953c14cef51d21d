use chrono::{DateTime, NaiveDateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Document id as stored by the backend: either a plain string or the
/// extended-JSON object form `{"$oid": "..."}`.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(untagged)]
pub enum DocumentId {
    Plain(String),
    Object {
        #[serde(rename = "$oid")]
        oid: String,
    },
}

impl DocumentId {
    pub fn into_string(self) -> String {
        match self {
            Self::Plain(value) => value,
            Self::Object { oid } => oid,
        }
    }
}

/// Timestamp as received on the wire: a bare string or `{"$date": "..."}`.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(untagged)]
pub enum WireTimestamp {
    Plain(String),
    Object {
        #[serde(rename = "$date")]
        date: String,
    },
}

impl WireTimestamp {
    /// Best-effort parse to UTC. Returns `None` for values no supported
    /// format matches; the consumer decides the fallback.
    pub fn parse(&self) -> Option<DateTime<Utc>> {
        let raw = match self {
            Self::Plain(value) => value,
            Self::Object { date } => date,
        };
        if let Ok(parsed) = DateTime::parse_from_rfc3339(raw) {
            return Some(parsed.with_timezone(&Utc));
        }
        NaiveDateTime::parse_from_str(raw, "%Y-%m-%d %H:%M:%S")
            .ok()
            .map(|naive| naive.and_utc())
    }
}

/// Serde view of an inbound socket payload before validation. Every field is
/// optional; `InboundFrame::parse` decides what is actually acceptable.
#[derive(Debug, Clone, Deserialize)]
pub struct RawFrame {
    #[serde(default)]
    pub id: Option<String>,
    #[serde(default, rename = "_id")]
    pub doc_id: Option<DocumentId>,
    #[serde(default)]
    pub sender_id: Option<String>,
    #[serde(default)]
    pub receiver_id: Option<String>,
    #[serde(default)]
    pub message: Option<String>,
    #[serde(default)]
    pub created_at: Option<WireTimestamp>,
    #[serde(default, rename = "type")]
    pub kind: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ControlKind {
    Ping,
    Pong,
}

/// Validated chat payload. `id` keeps the server/document id when one was
/// present; `created_at` is `None` when the wire value was unparsable.
#[derive(Debug, Clone, PartialEq)]
pub struct ChatFrame {
    pub id: Option<String>,
    pub sender_id: String,
    pub receiver_id: String,
    pub message: String,
    pub created_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum InboundFrame {
    Control(ControlKind),
    Chat(ChatFrame),
}

#[derive(Debug, Error)]
pub enum FrameError {
    #[error("unparsable frame: {0}")]
    Malformed(#[from] serde_json::Error),
    #[error("frame missing required field '{0}'")]
    MissingField(&'static str),
}

impl InboundFrame {
    /// Structural validation of a raw socket payload. Control frames are
    /// recognized by their `type` discriminator; chat frames must carry a
    /// non-empty sender, receiver, and message body.
    pub fn parse(raw: &str) -> Result<Self, FrameError> {
        let frame: RawFrame = serde_json::from_str(raw)?;

        match frame.kind.as_deref() {
            Some("ping") => return Ok(Self::Control(ControlKind::Ping)),
            Some("pong") => return Ok(Self::Control(ControlKind::Pong)),
            _ => {}
        }

        let sender_id = require(frame.sender_id, "sender_id")?;
        let receiver_id = require(frame.receiver_id, "receiver_id")?;
        let message = require(frame.message, "message")?;

        let id = frame
            .id
            .filter(|value| !value.is_empty())
            .or_else(|| frame.doc_id.map(DocumentId::into_string));
        let created_at = frame.created_at.as_ref().and_then(WireTimestamp::parse);

        Ok(Self::Chat(ChatFrame {
            id,
            sender_id,
            receiver_id,
            message,
            created_at,
        }))
    }
}

fn require(field: Option<String>, name: &'static str) -> Result<String, FrameError> {
    field
        .filter(|value| !value.is_empty())
        .ok_or(FrameError::MissingField(name))
}

/// Outbound chat payload. The receiver number is transmitted without any
/// leading formatting character.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OutboundChatFrame {
    pub receiver_number: String,
    pub message: String,
}

/// Heartbeat frame sent by the connection manager while a socket is open.
#[derive(Debug, Clone, Serialize)]
pub struct PingFrame {
    #[serde(rename = "type")]
    pub kind: &'static str,
    pub timestamp: String,
}

impl PingFrame {
    pub fn now() -> Self {
        Self {
            kind: "ping",
            timestamp: Utc::now().to_rfc3339(),
        }
    }
}
