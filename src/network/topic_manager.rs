use std::cell::{Cell, RefCell};
use std::collections::HashMap;
use std::rc::{Rc, Weak};

use crate::models::{ChatMessage, TicketId};

use super::messages::{StatusUpdate, TypingIndicator};

/// Handler types for the three ticket-scoped event kinds plus the global
/// connection-status broadcast.
pub type MessageHandler = Rc<RefCell<dyn FnMut(&ChatMessage)>>;
pub type StatusHandler = Rc<RefCell<dyn FnMut(&StatusUpdate)>>;
pub type TypingHandler = Rc<RefCell<dyn FnMut(&TypingIndicator)>>;
pub type ConnectionStatusHandler = Rc<RefCell<dyn FnMut(bool)>>;

pub type HandlerId = u64;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EventKind {
    Message,
    Status,
    Typing,
}

/// Identifies one registration inside the registry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SubscriptionKey {
    Topic {
        ticket_id: TicketId,
        kind: EventKind,
        id: HandlerId,
    },
    ConnectionStatus {
        id: HandlerId,
    },
}

/// Ordered handler list. Registration order is dispatch order.
struct HandlerSet<F: ?Sized> {
    entries: Vec<(HandlerId, Rc<RefCell<F>>)>,
}

impl<F: ?Sized> Default for HandlerSet<F> {
    fn default() -> Self {
        Self { entries: Vec::new() }
    }
}

impl<F: ?Sized> HandlerSet<F> {
    fn insert(&mut self, id: HandlerId, handler: Rc<RefCell<F>>) {
        self.entries.push((id, handler));
    }

    fn remove(&mut self, id: HandlerId) -> bool {
        let before = self.entries.len();
        self.entries.retain(|(existing, _)| *existing != id);
        self.entries.len() != before
    }

    fn contains(&self, id: HandlerId) -> bool {
        self.entries.iter().any(|(existing, _)| *existing == id)
    }

    fn snapshot(&self) -> Vec<(HandlerId, Rc<RefCell<F>>)> {
        self.entries.clone()
    }

    fn len(&self) -> usize {
        self.entries.len()
    }
}

#[derive(Default)]
struct TopicHandlers {
    messages: HandlerSet<dyn FnMut(&ChatMessage)>,
    status: HandlerSet<dyn FnMut(&StatusUpdate)>,
    typing: HandlerSet<dyn FnMut(&TypingIndicator)>,
}

impl TopicHandlers {
    fn is_empty(&self) -> bool {
        self.messages.len() == 0 && self.status.len() == 0 && self.typing.len() == 0
    }

    fn remove(&mut self, kind: EventKind, id: HandlerId) -> bool {
        match kind {
            EventKind::Message => self.messages.remove(id),
            EventKind::Status => self.status.remove(id),
            EventKind::Typing => self.typing.remove(id),
        }
    }

    fn contains(&self, kind: EventKind, id: HandlerId) -> bool {
        match kind {
            EventKind::Message => self.messages.contains(id),
            EventKind::Status => self.status.contains(id),
            EventKind::Typing => self.typing.contains(id),
        }
    }
}

/// Per-ticket subscriber registry plus connection-status listeners.
///
/// Lives behind `Rc<RefCell<..>>`. The `dispatch_*` functions snapshot the
/// relevant handlers and release the borrow before running user code, so a
/// handler may subscribe or unsubscribe (itself included) while being
/// called.
#[derive(Default)]
pub struct TopicRegistry {
    topics: HashMap<TicketId, TopicHandlers>,
    connection: HandlerSet<dyn FnMut(bool)>,
    next_id: HandlerId,
}

impl TopicRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    fn allocate_id(&mut self) -> HandlerId {
        self.next_id += 1;
        self.next_id
    }

    pub fn add_message_handler(&mut self, ticket_id: TicketId, handler: MessageHandler) -> SubscriptionKey {
        let id = self.allocate_id();
        self.topics.entry(ticket_id).or_default().messages.insert(id, handler);
        SubscriptionKey::Topic {
            ticket_id,
            kind: EventKind::Message,
            id,
        }
    }

    pub fn add_status_handler(&mut self, ticket_id: TicketId, handler: StatusHandler) -> SubscriptionKey {
        let id = self.allocate_id();
        self.topics.entry(ticket_id).or_default().status.insert(id, handler);
        SubscriptionKey::Topic {
            ticket_id,
            kind: EventKind::Status,
            id,
        }
    }

    pub fn add_typing_handler(&mut self, ticket_id: TicketId, handler: TypingHandler) -> SubscriptionKey {
        let id = self.allocate_id();
        self.topics.entry(ticket_id).or_default().typing.insert(id, handler);
        SubscriptionKey::Topic {
            ticket_id,
            kind: EventKind::Typing,
            id,
        }
    }

    pub fn add_connection_handler(&mut self, handler: ConnectionStatusHandler) -> SubscriptionKey {
        let id = self.allocate_id();
        self.connection.insert(id, handler);
        SubscriptionKey::ConnectionStatus { id }
    }

    /// Removes exactly one registration. Empty topics are pruned.
    pub fn remove(&mut self, key: SubscriptionKey) -> bool {
        match key {
            SubscriptionKey::Topic { ticket_id, kind, id } => {
                let Some(handlers) = self.topics.get_mut(&ticket_id) else {
                    return false;
                };
                let removed = handlers.remove(kind, id);
                if handlers.is_empty() {
                    self.topics.remove(&ticket_id);
                    debug_log!("Last handler removed for ticket {}", ticket_id);
                }
                removed
            }
            SubscriptionKey::ConnectionStatus { id } => self.connection.remove(id),
        }
    }

    pub fn is_live(&self, key: SubscriptionKey) -> bool {
        match key {
            SubscriptionKey::Topic { ticket_id, kind, id } => self
                .topics
                .get(&ticket_id)
                .map_or(false, |handlers| handlers.contains(kind, id)),
            SubscriptionKey::ConnectionStatus { id } => self.connection.contains(id),
        }
    }

    pub fn handler_count(&self, ticket_id: TicketId, kind: EventKind) -> usize {
        self.topics.get(&ticket_id).map_or(0, |handlers| match kind {
            EventKind::Message => handlers.messages.len(),
            EventKind::Status => handlers.status.len(),
            EventKind::Typing => handlers.typing.len(),
        })
    }

    pub fn connection_listener_count(&self) -> usize {
        self.connection.len()
    }

    pub fn subscribed_tickets(&self) -> Vec<TicketId> {
        let mut tickets: Vec<TicketId> = self.topics.keys().copied().collect();
        tickets.sort_unstable();
        tickets
    }
}

/// Runs each snapshotted handler that is still registered at the moment it
/// would be called. Returns how many ran.
fn run_handlers<F: ?Sized>(
    registry: &Rc<RefCell<TopicRegistry>>,
    handlers: Vec<(HandlerId, Rc<RefCell<F>>)>,
    key_for: impl Fn(HandlerId) -> SubscriptionKey,
    mut call: impl FnMut(&mut F),
) -> usize {
    let mut invoked = 0;
    for (id, handler) in handlers {
        if !registry.borrow().is_live(key_for(id)) {
            continue;
        }
        match handler.try_borrow_mut() {
            Ok(mut f) => {
                call(&mut *f);
                invoked += 1;
            }
            Err(_) => warn_log!("Skipping re-entrant handler {}", id),
        }
    }
    invoked
}

pub fn dispatch_message(registry: &Rc<RefCell<TopicRegistry>>, message: &ChatMessage) -> usize {
    let ticket_id = message.ticket_id;
    let handlers = registry
        .borrow()
        .topics
        .get(&ticket_id)
        .map(|h| h.messages.snapshot())
        .unwrap_or_default();
    if handlers.is_empty() {
        debug_log!("No message handlers registered for ticket {}", ticket_id);
    }
    run_handlers(
        registry,
        handlers,
        |id| SubscriptionKey::Topic {
            ticket_id,
            kind: EventKind::Message,
            id,
        },
        |f| f(message),
    )
}

pub fn dispatch_status(registry: &Rc<RefCell<TopicRegistry>>, update: &StatusUpdate) -> usize {
    let ticket_id = update.ticket_id;
    let handlers = registry
        .borrow()
        .topics
        .get(&ticket_id)
        .map(|h| h.status.snapshot())
        .unwrap_or_default();
    run_handlers(
        registry,
        handlers,
        |id| SubscriptionKey::Topic {
            ticket_id,
            kind: EventKind::Status,
            id,
        },
        |f| f(update),
    )
}

pub fn dispatch_typing(registry: &Rc<RefCell<TopicRegistry>>, typing: &TypingIndicator) -> usize {
    let ticket_id = typing.ticket_id;
    let handlers = registry
        .borrow()
        .topics
        .get(&ticket_id)
        .map(|h| h.typing.snapshot())
        .unwrap_or_default();
    run_handlers(
        registry,
        handlers,
        |id| SubscriptionKey::Topic {
            ticket_id,
            kind: EventKind::Typing,
            id,
        },
        |f| f(typing),
    )
}

pub fn broadcast_connection_status(registry: &Rc<RefCell<TopicRegistry>>, connected: bool) -> usize {
    let handlers = registry.borrow().connection.snapshot();
    run_handlers(
        registry,
        handlers,
        |id| SubscriptionKey::ConnectionStatus { id },
        |f| f(connected),
    )
}

/// Disposer returned by every `subscribe_*` call. `unsubscribe` removes
/// only this registration and is idempotent. Dropping a `Subscription`
/// without calling `unsubscribe` leaves the handler registered.
#[must_use = "keep the Subscription to be able to unsubscribe"]
pub struct Subscription {
    registry: Weak<RefCell<TopicRegistry>>,
    key: SubscriptionKey,
    active: Cell<bool>,
}

impl Subscription {
    pub(crate) fn new(registry: &Rc<RefCell<TopicRegistry>>, key: SubscriptionKey) -> Self {
        Self {
            registry: Rc::downgrade(registry),
            key,
            active: Cell::new(true),
        }
    }

    pub fn key(&self) -> SubscriptionKey {
        self.key
    }

    pub fn is_active(&self) -> bool {
        self.active.get()
    }

    pub fn unsubscribe(&self) {
        if !self.active.replace(false) {
            return;
        }
        if let Some(registry) = self.registry.upgrade() {
            // try_borrow_mut: unsubscribing while the registry is mid-mutation
            // would otherwise panic. Dispatch never holds the borrow while user
            // code runs, so this only fails on genuine misuse.
            match registry.try_borrow_mut() {
                Ok(mut registry) => {
                    registry.remove(self.key);
                }
                Err(_) => {
                    error_log!("Registry busy; could not unsubscribe {:?}", self.key);
                    self.active.set(true);
                }
            }
        }
    }
}

impl std::fmt::Debug for Subscription {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Subscription")
            .field("key", &self.key)
            .field("active", &self.active.get())
            .finish()
    }
}
