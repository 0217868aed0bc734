//! In-memory model of one ticket's conversation. Pure state: it never talks
//! to the network, the session feeds it events.

use std::collections::{BTreeMap, HashSet};

use crate::models::{ChatMessage, Identity, MessageId, MessageStatus, Sender, TicketId, UserType};
use crate::network::messages::{StatusUpdate, TypingIndicator};

#[derive(Debug, Clone, PartialEq)]
pub struct ConversationEntry {
    pub message: ChatMessage,
    pub status: MessageStatus,
    /// Local placeholder still waiting for the server echo.
    pub pending: bool,
    /// The placeholder could not be sent.
    pub failed: bool,
}

/// What `apply_message` did with a message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Applied {
    Inserted,
    /// Replaced the optimistic placeholder it echoes.
    Confirmed,
    Duplicate,
    /// Belongs to another ticket.
    Ignored,
}

/// Someone currently typing. Typing frames may omit the side, so typists
/// are keyed by user id alone.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Typist {
    pub user_id: String,
    pub user_type: Option<UserType>,
}

#[derive(Debug, Clone)]
pub struct Conversation {
    ticket_id: TicketId,
    local: Identity,
    entries: Vec<ConversationEntry>,
    typing: BTreeMap<String, Typist>,
    acknowledged: HashSet<MessageId>,
}

impl Conversation {
    pub fn new(ticket_id: TicketId, local: Identity) -> Self {
        Self {
            ticket_id,
            local,
            entries: Vec::new(),
            typing: BTreeMap::new(),
            acknowledged: HashSet::new(),
        }
    }

    pub fn ticket_id(&self) -> TicketId {
        self.ticket_id
    }

    pub fn entries(&self) -> &[ConversationEntry] {
        &self.entries
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn get(&self, id: &str) -> Option<&ConversationEntry> {
        self.entries.iter().find(|e| e.message.id == id)
    }

    pub fn typing_users(&self) -> impl Iterator<Item = &Typist> {
        self.typing.values()
    }

    /// True if the message was written by the other side of the desk.
    pub fn is_from_other_party(&self, message: &ChatMessage) -> bool {
        message.sender_type().map_or(false, |kind| kind != self.local.user_type)
    }

    fn is_own(&self, message: &ChatMessage) -> bool {
        match &message.sender {
            Some(sender) => {
                sender.kind == self.local.user_type
                    && sender.id.as_deref().map_or(true, |id| id == self.local.user_id)
            }
            None => false,
        }
    }

    /// Inserts a local placeholder and returns its client id, which doubles
    /// as the placeholder's message id until the server echo arrives.
    pub fn push_optimistic(&mut self, content: &str) -> String {
        let client_id = uuid::Uuid::new_v4().to_string();
        let message = ChatMessage {
            id: client_id.clone(),
            ticket_id: self.ticket_id,
            content: content.to_string(),
            sender: Some(Sender {
                kind: self.local.user_type,
                id: Some(self.local.user_id.clone()),
                name: self.local.display_name.clone(),
            }),
            attachments: Vec::new(),
            created_at: Some(chrono::Utc::now().to_rfc3339()),
            client_id: Some(client_id.clone()),
            extra: Default::default(),
        };
        self.entries.push(ConversationEntry {
            message,
            status: MessageStatus::Sent,
            pending: true,
            failed: false,
        });
        client_id
    }

    pub fn mark_failed(&mut self, client_id: &str) -> bool {
        match self
            .entries
            .iter_mut()
            .find(|e| e.pending && e.message.client_id.as_deref() == Some(client_id))
        {
            Some(entry) => {
                entry.failed = true;
                true
            }
            None => false,
        }
    }

    fn placeholder_for(&self, message: &ChatMessage) -> Option<usize> {
        if let Some(client_id) = message.client_id.as_deref() {
            if let Some(i) = self
                .entries
                .iter()
                .position(|e| e.pending && e.message.client_id.as_deref() == Some(client_id))
            {
                return Some(i);
            }
        }
        if !self.is_own(message) {
            return None;
        }
        self.entries
            .iter()
            .position(|e| e.pending && e.message.content == message.content)
    }

    pub fn apply_message(&mut self, message: ChatMessage) -> Applied {
        if message.ticket_id != self.ticket_id {
            return Applied::Ignored;
        }
        if self.entries.iter().any(|e| !e.pending && e.message.id == message.id) {
            return Applied::Duplicate;
        }

        // A message from someone ends their typing indicator.
        if let Some(sender) = &message.sender {
            if let Some(id) = &sender.id {
                self.typing.remove(id);
            }
        }

        match self.placeholder_for(&message) {
            Some(i) => {
                let entry = &mut self.entries[i];
                entry.message = message;
                entry.pending = false;
                entry.failed = false;
                Applied::Confirmed
            }
            None => {
                self.entries.push(ConversationEntry {
                    message,
                    status: MessageStatus::Sent,
                    pending: false,
                    failed: false,
                });
                Applied::Inserted
            }
        }
    }

    /// Applies a delivery status; statuses only ever move forward.
    pub fn apply_status(&mut self, update: &StatusUpdate) -> bool {
        if update.ticket_id != self.ticket_id {
            return false;
        }
        match self.entries.iter_mut().find(|e| e.message.id == update.message_id) {
            Some(entry) if update.status.rank() > entry.status.rank() => {
                entry.status = update.status;
                true
            }
            _ => false,
        }
    }

    pub fn apply_typing(&mut self, indicator: &TypingIndicator) -> bool {
        if indicator.ticket_id != self.ticket_id {
            return false;
        }
        let Some(user_id) = indicator.user_id.clone() else {
            return false;
        };
        let user_type = indicator.user_type;
        // Our own echo. A frame without a side still matches on id.
        if user_id == self.local.user_id && user_type.map_or(true, |t| t == self.local.user_type) {
            return false;
        }

        if indicator.is_typing {
            let typist = Typist {
                user_id: user_id.clone(),
                user_type,
            };
            self.typing.insert(user_id, typist).is_none()
        } else {
            self.typing.remove(&user_id).is_some()
        }
    }

    /// Merges a history page fetched over REST; returns how many messages
    /// were new.
    pub fn merge_history(&mut self, messages: Vec<ChatMessage>) -> usize {
        messages
            .into_iter()
            .map(|m| self.apply_message(m))
            .filter(|applied| *applied == Applied::Inserted)
            .count()
    }

    /// Ids of messages from the other party that have not been marked read.
    pub fn unread_from_others(&self) -> Vec<MessageId> {
        self.entries
            .iter()
            .filter(|e| !e.pending && self.is_from_other_party(&e.message))
            .filter(|e| !self.acknowledged.contains(&e.message.id))
            .map(|e| e.message.id.clone())
            .collect()
    }

    pub fn mark_acknowledged(&mut self, id: &str) {
        self.acknowledged.insert(id.to_string());
    }
}
