use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

use crate::models::{de, ChatMessage, Identity, MessageId, MessageStatus, TicketId, UserType};

/// Frames the client sends over the realtime channel.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum OutboundMessage {
    ConnectionInit {
        #[serde(rename = "userId")]
        user_id: String,
        #[serde(rename = "userType")]
        user_type: UserType,
        timestamp: i64,
    },
    ChatMessage(ChatMessagePayload),
    Typing {
        ticket_id: TicketId,
        sender_id: String,
        sender_type: UserType,
        #[serde(rename = "isTyping")]
        is_typing: bool,
    },
    MessageStatus {
        message_id: MessageId,
        status: MessageStatus,
    },
    Ping {
        timestamp: i64,
    },
    Disconnect {
        #[serde(rename = "userId")]
        user_id: String,
        #[serde(rename = "userType")]
        user_type: UserType,
        timestamp: i64,
    },
}

impl OutboundMessage {
    /// Wire name of the envelope, for logging.
    pub fn kind(&self) -> &'static str {
        match self {
            OutboundMessage::ConnectionInit { .. } => "connection_init",
            OutboundMessage::ChatMessage(_) => "chat_message",
            OutboundMessage::Typing { .. } => "typing",
            OutboundMessage::MessageStatus { .. } => "message_status",
            OutboundMessage::Ping { .. } => "ping",
            OutboundMessage::Disconnect { .. } => "disconnect",
        }
    }
}

/// Body of a `chat_message` frame.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ChatMessagePayload {
    pub ticket_id: TicketId,
    pub content: String,
    pub sender_id: String,
    pub sender_type: UserType,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub sender_name: Option<String>,
    pub attachments: Vec<String>,
    /// Client-generated id the server echoes back on the resulting
    /// `new_message`, so optimistic placeholders can be reconciled.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub client_id: Option<String>,
}

/// Frames the server pushes to the client.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum InboundEvent {
    ConnectionEstablished(ConnectionAck),
    NewMessage { message: ChatMessage },
    StatusUpdate(StatusUpdate),
    TypingIndicator(TypingIndicator),
    Pong {
        #[serde(default)]
        timestamp: Option<Value>,
    },
}

/// Server acknowledgement of the handshake. Nothing in it is required.
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
pub struct ConnectionAck {
    #[serde(default)]
    pub message: Option<String>,
    #[serde(default, rename = "connectionId")]
    pub connection_id: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StatusUpdate {
    #[serde(deserialize_with = "de::string_id")]
    pub message_id: MessageId,
    #[serde(deserialize_with = "de::ticket_id")]
    pub ticket_id: TicketId,
    pub status: MessageStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timestamp: Option<Value>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TypingIndicator {
    #[serde(deserialize_with = "de::ticket_id")]
    pub ticket_id: TicketId,
    #[serde(default, deserialize_with = "de::opt_string_id", skip_serializing_if = "Option::is_none")]
    pub user_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user_type: Option<UserType>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user_name: Option<String>,
    #[serde(rename = "isTyping")]
    pub is_typing: bool,
}

const INBOUND_TYPES: [&str; 5] = [
    "connection_established",
    "new_message",
    "status_update",
    "typing_indicator",
    "pong",
];

/// Why an inbound frame was dropped.
#[derive(Debug, Error)]
pub enum FrameError {
    #[error("frame is not valid JSON: {0}")]
    Malformed(#[source] serde_json::Error),
    #[error("frame has no string `type` field")]
    MissingType,
    #[error("unknown frame type '{0}'")]
    UnknownType(String),
    #[error("invalid '{kind}' payload: {source}")]
    InvalidPayload {
        kind: String,
        #[source]
        source: serde_json::Error,
    },
}

impl InboundEvent {
    /// Parses one text frame. Unknown `type` values are reported separately
    /// from malformed payloads so callers can treat them as forward-compatible
    /// noise.
    pub fn parse(text: &str) -> Result<Self, FrameError> {
        let value: Value = serde_json::from_str(text).map_err(FrameError::Malformed)?;
        let kind = value
            .get("type")
            .and_then(Value::as_str)
            .ok_or(FrameError::MissingType)?
            .to_string();

        if !INBOUND_TYPES.contains(&kind.as_str()) {
            return Err(FrameError::UnknownType(kind));
        }

        serde_json::from_value(value).map_err(|source| FrameError::InvalidPayload { kind, source })
    }

    /// Ticket the event belongs to, if it is topic-scoped.
    pub fn ticket_id(&self) -> Option<TicketId> {
        match self {
            InboundEvent::NewMessage { message } => Some(message.ticket_id),
            InboundEvent::StatusUpdate(update) => Some(update.ticket_id),
            InboundEvent::TypingIndicator(typing) => Some(typing.ticket_id),
            InboundEvent::ConnectionEstablished(_) | InboundEvent::Pong { .. } => None,
        }
    }
}

/// Helper functions for creating outbound frames
pub mod builders {
    use super::*;

    pub fn now_millis() -> i64 {
        chrono::Utc::now().timestamp_millis()
    }

    pub fn create_connection_init(identity: &Identity) -> OutboundMessage {
        OutboundMessage::ConnectionInit {
            user_id: identity.user_id.clone(),
            user_type: identity.user_type,
            timestamp: now_millis(),
        }
    }

    pub fn create_disconnect(identity: &Identity) -> OutboundMessage {
        OutboundMessage::Disconnect {
            user_id: identity.user_id.clone(),
            user_type: identity.user_type,
            timestamp: now_millis(),
        }
    }

    pub fn create_ping() -> OutboundMessage {
        OutboundMessage::Ping {
            timestamp: now_millis(),
        }
    }

    pub fn create_chat_message(
        identity: &Identity,
        ticket_id: TicketId,
        content: &str,
        attachments: Vec<String>,
        client_id: Option<String>,
    ) -> OutboundMessage {
        OutboundMessage::ChatMessage(ChatMessagePayload {
            ticket_id,
            content: content.to_string(),
            sender_id: identity.user_id.clone(),
            sender_type: identity.user_type,
            sender_name: identity.display_name.clone(),
            attachments,
            client_id,
        })
    }

    pub fn create_typing(identity: &Identity, ticket_id: TicketId, is_typing: bool) -> OutboundMessage {
        OutboundMessage::Typing {
            ticket_id,
            sender_id: identity.user_id.clone(),
            sender_type: identity.user_type,
            is_typing,
        }
    }

    pub fn create_message_status(message_id: &str, status: MessageStatus) -> OutboundMessage {
        OutboundMessage::MessageStatus {
            message_id: message_id.to_string(),
            status,
        }
    }
}
