use serde::{Deserialize, Deserializer, Serialize};
use serde_json::{Map, Value};
use std::fmt;

use crate::constants::ANONYMOUS_USER_ID;

/// Tickets are numbered by the backend.
pub type TicketId = u64;

/// Message ids arrive as strings or numbers depending on the endpoint, so we
/// normalise them to strings.
pub type MessageId = String;

// ---------------------------------------------------------------------------
// Identity
// ---------------------------------------------------------------------------

/// Which side of the desk a participant is on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UserType {
    #[default]
    Requester,
    Staff,
    /// Anything else the backend sends (e.g. automated system notes).
    #[serde(other)]
    Other,
}

impl UserType {
    pub fn as_str(&self) -> &'static str {
        match self {
            UserType::Requester => "requester",
            UserType::Staff => "staff",
            UserType::Other => "other",
        }
    }

    /// Lenient parse used at the JS boundary; unknown strings fall back to
    /// the default requester role.
    pub fn parse(raw: &str) -> Self {
        match raw.trim().to_ascii_lowercase().as_str() {
            "staff" => UserType::Staff,
            _ => UserType::Requester,
        }
    }
}

impl fmt::Display for UserType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// The local participant the realtime channel authenticates as.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Identity {
    pub user_id: String,
    pub user_type: UserType,
    /// Display name attached to outgoing chat messages.
    pub display_name: Option<String>,
}

impl Identity {
    pub fn new(user_id: Option<&str>, user_type: Option<UserType>) -> Self {
        let user_id = user_id
            .map(str::trim)
            .filter(|id| !id.is_empty())
            .unwrap_or(ANONYMOUS_USER_ID)
            .to_string();
        Self {
            user_id,
            user_type: user_type.unwrap_or_default(),
            display_name: None,
        }
    }

    pub fn with_display_name(mut self, name: impl Into<String>) -> Self {
        self.display_name = Some(name.into());
        self
    }
}

impl Default for Identity {
    fn default() -> Self {
        Self::new(None, None)
    }
}

// ---------------------------------------------------------------------------
// Chat
// ---------------------------------------------------------------------------

/// Author of a chat message.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Sender {
    #[serde(rename = "type")]
    pub kind: UserType,
    #[serde(default, deserialize_with = "de::opt_string_id", skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
}

/// File attached to a chat message.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Attachment {
    #[serde(deserialize_with = "de::string_id")]
    pub id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub filename: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub content_type: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub size: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,
}

/// A message inside a ticket conversation, as delivered by `new_message`
/// frames and the messages REST endpoint.
///
/// Fields the client does not model are kept in `extra` so subscribers see
/// the payload exactly as the server sent it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChatMessage {
    #[serde(deserialize_with = "de::string_id")]
    pub id: MessageId,
    #[serde(deserialize_with = "de::ticket_id")]
    pub ticket_id: TicketId,
    #[serde(default)]
    pub content: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sender: Option<Sender>,
    #[serde(default)]
    pub attachments: Vec<Attachment>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub created_at: Option<String>,
    /// Echo of the client-generated id sent with `chat_message`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub client_id: Option<String>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl ChatMessage {
    pub fn sender_type(&self) -> Option<UserType> {
        self.sender.as_ref().map(|s| s.kind)
    }
}

/// Delivery state of a message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MessageStatus {
    Sent,
    Delivered,
    Read,
    #[serde(other)]
    Unknown,
}

impl MessageStatus {
    /// Position in the delivery progression; statuses never move backwards.
    pub fn rank(&self) -> u8 {
        match self {
            MessageStatus::Unknown => 0,
            MessageStatus::Sent => 1,
            MessageStatus::Delivered => 2,
            MessageStatus::Read => 3,
        }
    }
}

impl fmt::Display for MessageStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            MessageStatus::Sent => "sent",
            MessageStatus::Delivered => "delivered",
            MessageStatus::Read => "read",
            MessageStatus::Unknown => "unknown",
        };
        f.write_str(s)
    }
}

// ---------------------------------------------------------------------------
// Tickets (REST)
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TicketStatus {
    #[default]
    Open,
    InProgress,
    Waiting,
    Resolved,
    Closed,
}

impl TicketStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            TicketStatus::Open => "open",
            TicketStatus::InProgress => "in_progress",
            TicketStatus::Waiting => "waiting",
            TicketStatus::Resolved => "resolved",
            TicketStatus::Closed => "closed",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TicketPriority {
    Low,
    #[default]
    Medium,
    High,
    Urgent,
}

impl TicketPriority {
    pub fn as_str(&self) -> &'static str {
        match self {
            TicketPriority::Low => "low",
            TicketPriority::Medium => "medium",
            TicketPriority::High => "high",
            TicketPriority::Urgent => "urgent",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Ticket {
    #[serde(deserialize_with = "de::ticket_id")]
    pub id: TicketId,
    pub subject: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub status: TicketStatus,
    #[serde(default)]
    pub priority: TicketPriority,
    #[serde(default, deserialize_with = "de::opt_string_id")]
    pub requester_id: Option<String>,
    #[serde(default)]
    pub requester_name: Option<String>,
    #[serde(default)]
    pub requester_email: Option<String>,
    #[serde(default, deserialize_with = "de::opt_string_id")]
    pub assignee_id: Option<String>,
    #[serde(default)]
    pub created_at: Option<String>,
    #[serde(default)]
    pub updated_at: Option<String>,
}

/// Body of `POST /tickets`.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct NewTicket {
    pub subject: String,
    pub description: String,
    pub priority: TicketPriority,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub requester_name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub requester_email: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub category: Option<String>,
}

/// Body of `PATCH /tickets/{id}`; only set fields are sent.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct TicketUpdate {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub subject: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub priority: Option<TicketPriority>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub assignee_id: Option<String>,
}

/// Query filters for `GET /tickets`.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct TicketFilter {
    pub status: Option<TicketStatus>,
    pub priority: Option<TicketPriority>,
    pub requester_id: Option<String>,
    pub page: Option<u32>,
    pub per_page: Option<u32>,
}

impl TicketFilter {
    /// Renders the filter as a query string (`""` or `"?a=b&c=d"`).
    pub fn to_query(&self) -> String {
        let mut pairs: Vec<(&str, String)> = Vec::new();
        if let Some(status) = self.status {
            pairs.push(("status", status.as_str().to_string()));
        }
        if let Some(priority) = self.priority {
            pairs.push(("priority", priority.as_str().to_string()));
        }
        if let Some(requester) = &self.requester_id {
            pairs.push(("requester_id", encode_query_value(requester)));
        }
        if let Some(page) = self.page {
            pairs.push(("page", page.to_string()));
        }
        if let Some(per_page) = self.per_page {
            pairs.push(("per_page", per_page.to_string()));
        }

        if pairs.is_empty() {
            return String::new();
        }
        let joined: Vec<String> = pairs.into_iter().map(|(k, v)| format!("{}={}", k, v)).collect();
        format!("?{}", joined.join("&"))
    }
}

/// Support staff member as returned by the employee lookup endpoints.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Employee {
    #[serde(deserialize_with = "de::string_id")]
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub email: Option<String>,
    #[serde(default)]
    pub department: Option<String>,
}

/// Form-encodes a query parameter value.
pub(crate) fn encode_query_value(raw: &str) -> String {
    url::form_urlencoded::byte_serialize(raw.as_bytes()).collect()
}

// ---------------------------------------------------------------------------
// Lenient id deserializers
// ---------------------------------------------------------------------------

pub(crate) mod de {
    use super::*;

    #[derive(Deserialize)]
    #[serde(untagged)]
    enum RawId {
        Num(u64),
        Signed(i64),
        Str(String),
    }

    impl RawId {
        fn into_string(self) -> String {
            match self {
                RawId::Num(n) => n.to_string(),
                RawId::Signed(n) => n.to_string(),
                RawId::Str(s) => s,
            }
        }
    }

    pub fn string_id<'de, D>(deserializer: D) -> Result<String, D::Error>
    where
        D: Deserializer<'de>,
    {
        RawId::deserialize(deserializer).map(RawId::into_string)
    }

    pub fn opt_string_id<'de, D>(deserializer: D) -> Result<Option<String>, D::Error>
    where
        D: Deserializer<'de>,
    {
        Ok(Option::<RawId>::deserialize(deserializer)?.map(RawId::into_string))
    }

    pub fn ticket_id<'de, D>(deserializer: D) -> Result<TicketId, D::Error>
    where
        D: Deserializer<'de>,
    {
        match RawId::deserialize(deserializer)? {
            RawId::Num(n) => Ok(n),
            RawId::Signed(n) => Err(serde::de::Error::custom(format!("negative ticket id {}", n))),
            RawId::Str(s) => s
                .trim()
                .parse::<TicketId>()
                .map_err(|_| serde::de::Error::custom(format!("invalid ticket id '{}'", s))),
        }
    }
}
