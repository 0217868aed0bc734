//! Realtime channel: one reconnecting WebSocket per session, fanning
//! inbound ticket events out to subscribers.
//!
//! The connection is an explicit state machine:
//!
//! ```text
//! Idle -> Connecting -> Connected -> Reconnecting(attempt) -> Connecting ...
//!                                  \-> Closed (disconnect / normal close / attempts exhausted)
//! ```
//!
//! Timers belong to the state that needs them: `Connected` owns the
//! heartbeat interval, `Reconnecting` owns the reconnect timeout. Replacing
//! the state drops (and therefore cancels) them. Every socket gets a
//! generation number and events from an older generation are ignored.

use std::cell::RefCell;
use std::fmt;
use std::mem;
use std::rc::{Rc, Weak};

use crate::constants::{CLOSE_NORMAL, CLOSE_SEND_FAILED};
use crate::models::{ChatMessage, Identity, MessageStatus, TicketId, UserType};

use super::browser::{BrowserScheduler, WebSocketConnector};
use super::config::RealtimeConfig;
use super::messages::{builders, FrameError, InboundEvent, OutboundMessage, StatusUpdate, TypingIndicator};
use super::topic_manager::{
    broadcast_connection_status, dispatch_message, dispatch_status, dispatch_typing,
    ConnectionStatusHandler, MessageHandler, StatusHandler, Subscription, TopicRegistry,
    TypingHandler,
};
use super::transport::{Connector, Scheduler, Socket, SocketEvents, TimerHandle};

/// Observable connection state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChannelState {
    Idle,
    Connecting,
    Connected,
    Reconnecting { attempt: u32 },
    Closed,
}

impl fmt::Display for ChannelState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ChannelState::Idle => write!(f, "Idle"),
            ChannelState::Connecting => write!(f, "Connecting"),
            ChannelState::Connected => write!(f, "Connected"),
            ChannelState::Reconnecting { attempt } => write!(f, "Reconnecting (attempt {})", attempt),
            ChannelState::Closed => write!(f, "Closed"),
        }
    }
}

enum Phase {
    Idle,
    Connecting {
        socket: Box<dyn Socket>,
    },
    Connected {
        socket: Box<dyn Socket>,
        heartbeat: Option<TimerHandle>,
    },
    Reconnecting {
        attempt: u32,
        _timer: TimerHandle,
    },
    Closed,
}

impl Phase {
    fn socket(&self) -> Option<&dyn Socket> {
        match self {
            Phase::Connecting { socket } | Phase::Connected { socket, .. } => Some(socket.as_ref()),
            _ => None,
        }
    }

    fn state(&self) -> ChannelState {
        match self {
            Phase::Idle => ChannelState::Idle,
            Phase::Connecting { .. } => ChannelState::Connecting,
            Phase::Connected { .. } => ChannelState::Connected,
            Phase::Reconnecting { attempt, .. } => ChannelState::Reconnecting { attempt: *attempt },
            Phase::Closed => ChannelState::Closed,
        }
    }

    /// Moves to `next` and hands back the socket the old phase owned, if
    /// any. Timers owned by the old phase are cancelled before this returns.
    fn replace(&mut self, next: Phase) -> Option<Box<dyn Socket>> {
        match mem::replace(self, next) {
            Phase::Connecting { socket } => Some(socket),
            Phase::Connected { socket, heartbeat } => {
                drop(heartbeat);
                Some(socket)
            }
            Phase::Reconnecting { .. } | Phase::Idle | Phase::Closed => None,
        }
    }
}

struct Inner {
    config: RealtimeConfig,
    connector: Rc<dyn Connector>,
    scheduler: Rc<dyn Scheduler>,
    identity: Option<Identity>,
    phase: Phase,
    generation: u64,
    reconnect_attempts: u32,
    /// Last status broadcast to connection listeners.
    connected: bool,
}

impl Inner {
    fn identity(&self) -> Identity {
        self.identity.clone().unwrap_or_default()
    }

    fn is_current(&self, generation: u64) -> bool {
        generation == self.generation && self.phase.socket().is_some()
    }

    /// Records the connected flag; returns the new value if it changed.
    fn set_connected(&mut self, connected: bool) -> Option<bool> {
        if self.connected == connected {
            return None;
        }
        self.connected = connected;
        Some(connected)
    }
}

#[derive(Clone)]
struct WeakChannel {
    inner: Weak<RefCell<Inner>>,
    registry: Weak<RefCell<TopicRegistry>>,
}

impl WeakChannel {
    fn upgrade(&self) -> Option<RealtimeChannel> {
        Some(RealtimeChannel {
            inner: self.inner.upgrade()?,
            registry: self.registry.upgrade()?,
        })
    }
}

/// Handle to the realtime channel. Cheap to clone; clones share the same
/// connection and subscriber registry.
///
/// No operation panics or returns an error: failures are logged and show up
/// as `false` return values or connection-status transitions.
#[derive(Clone)]
pub struct RealtimeChannel {
    inner: Rc<RefCell<Inner>>,
    registry: Rc<RefCell<TopicRegistry>>,
}

impl RealtimeChannel {
    pub fn new<C, S>(config: RealtimeConfig, connector: C, scheduler: S) -> Self
    where
        C: Connector + 'static,
        S: Scheduler + 'static,
    {
        Self {
            inner: Rc::new(RefCell::new(Inner {
                config,
                connector: Rc::new(connector),
                scheduler: Rc::new(scheduler),
                identity: None,
                phase: Phase::Idle,
                generation: 0,
                reconnect_attempts: 0,
                connected: false,
            })),
            registry: Rc::new(RefCell::new(TopicRegistry::new())),
        }
    }

    /// Channel backed by `web_sys::WebSocket` and `gloo-timers`.
    pub fn browser(config: RealtimeConfig) -> Self {
        Self::new(config, WebSocketConnector, BrowserScheduler)
    }

    fn downgrade(&self) -> WeakChannel {
        WeakChannel {
            inner: Rc::downgrade(&self.inner),
            registry: Rc::downgrade(&self.registry),
        }
    }

    /// Runs `f` against the state, or logs and gives up if the state is
    /// already borrowed further up the stack.
    fn with_inner<R>(&self, f: impl FnOnce(&mut Inner) -> R) -> Option<R> {
        match self.inner.try_borrow_mut() {
            Ok(mut inner) => Some(f(&mut inner)),
            Err(_) => {
                error_log!("Realtime channel re-entered while busy; ignoring call");
                None
            }
        }
    }

    fn notify(&self, change: Option<bool>) {
        if let Some(connected) = change {
            debug_log!("Connection status -> {}", connected);
            broadcast_connection_status(&self.registry, connected);
        }
    }

    // -----------------------------------------------------------------------
    // Lifecycle
    // -----------------------------------------------------------------------

    /// Starts the channel for `user_id` / `user_type`. Does nothing while a
    /// connection is open or being opened.
    pub fn init(&self, user_id: Option<&str>, user_type: Option<UserType>) {
        self.init_identity(Identity::new(user_id, user_type));
    }

    /// Like `init` but with a full identity (e.g. including a display name).
    pub fn init_identity(&self, identity: Identity) {
        let should_connect = self
            .with_inner(|inner| {
                if matches!(inner.phase, Phase::Connecting { .. } | Phase::Connected { .. }) {
                    debug_log!("init: already connected as {}", inner.identity().user_id);
                    return false;
                }
                info_log!("Initializing realtime channel for {} ({})", identity.user_id, identity.user_type);
                inner.identity = Some(identity);
                inner.reconnect_attempts = 0;
                true
            })
            .unwrap_or(false);

        if should_connect {
            self.connect();
        }
    }

    /// Opens a fresh socket, tearing down any existing one first.
    pub fn connect(&self) {
        let weak = self.downgrade();
        let change = self.with_inner(|inner| {
            if let Some(old) = inner.phase.replace(Phase::Idle) {
                // Unhook before closing so nothing from the dying socket
                // reaches live handlers.
                old.detach();
                old.close(CLOSE_NORMAL, "reconnecting");
            }
            let change = inner.set_connected(false);

            if inner.identity.is_none() {
                inner.identity = Some(Identity::default());
            }
            inner.generation += 1;
            let generation = inner.generation;
            let url = inner.config.socket_url(&inner.identity(), None);
            info_log!("Connecting realtime channel to {}", url);

            let events = socket_events(&weak, generation);
            match inner.connector.open(&url, events) {
                Ok(socket) => {
                    inner.phase = Phase::Connecting { socket };
                }
                Err(e) => {
                    error_log!("Failed to create WebSocket: {}", e);
                    schedule_reconnect(&weak, inner);
                }
            }
            change
        });
        self.notify(change.flatten());
    }

    /// User-initiated shutdown: cancels pending reconnects and the heartbeat,
    /// says goodbye if the socket is open, and closes with 1000.
    pub fn disconnect(&self) {
        let change = self.with_inner(|inner| {
            inner.generation += 1;
            inner.reconnect_attempts = 0;
            // Timers die inside `replace`, before the socket is touched.
            if let Some(socket) = inner.phase.replace(Phase::Closed) {
                if socket.is_open() {
                    let goodbye = builders::create_disconnect(&inner.identity());
                    if let Err(e) = send_on(socket.as_ref(), &goodbye) {
                        warn_log!("Could not send disconnect notice: {}", e);
                    }
                }
                socket.close(CLOSE_NORMAL, "client disconnect");
            }
            info_log!("Realtime channel disconnected");
            inner.set_connected(false)
        });
        self.notify(change.flatten());
    }

    // -----------------------------------------------------------------------
    // Socket events
    // -----------------------------------------------------------------------

    fn on_socket_open(&self, generation: u64) {
        let weak = self.downgrade();
        let change = self.with_inner(|inner| {
            if !inner.is_current(generation) {
                debug_log!("Ignoring open from stale socket #{}", generation);
                return None;
            }
            let Some(socket) = inner.phase.replace(Phase::Idle) else {
                return None;
            };

            info_log!("WebSocket connected");
            inner.reconnect_attempts = 0;

            let hello = builders::create_connection_init(&inner.identity());
            if let Err(e) = send_on(socket.as_ref(), &hello) {
                warn_log!("Failed to send connection_init: {}", e);
            }

            let heartbeat_weak = weak.clone();
            let heartbeat = inner.scheduler.set_interval(
                inner.config.heartbeat_interval_ms,
                Box::new(move || {
                    if let Some(channel) = heartbeat_weak.upgrade() {
                        channel.on_heartbeat(generation);
                    }
                }),
            );
            inner.phase = Phase::Connected {
                socket,
                heartbeat: Some(heartbeat),
            };
            inner.set_connected(true)
        });
        self.notify(change.flatten());
    }

    fn on_socket_message(&self, generation: u64, text: String) {
        let local_type = match self.with_inner(|inner| inner.is_current(generation).then(|| inner.identity().user_type)) {
            Some(Some(user_type)) => user_type,
            _ => {
                debug_log!("Ignoring frame from stale socket #{}", generation);
                return;
            }
        };

        let event = match InboundEvent::parse(&text) {
            Ok(event) => event,
            Err(FrameError::UnknownType(kind)) => {
                warn_log!("Unknown realtime message type '{}'; dropping", kind);
                return;
            }
            Err(e) => {
                error_log!("Dropping malformed realtime frame: {}", e);
                return;
            }
        };

        match event {
            InboundEvent::ConnectionEstablished(_) => info_log!("Realtime connection established"),
            InboundEvent::Pong { .. } => debug_log!("pong"),
            InboundEvent::NewMessage { message } => {
                if message.sender_type().map_or(false, |sender| sender != local_type) {
                    self.send_message_status(&message.id, MessageStatus::Delivered);
                }
                dispatch_message(&self.registry, &message);
            }
            InboundEvent::StatusUpdate(update) => {
                dispatch_status(&self.registry, &update);
            }
            InboundEvent::TypingIndicator(typing) => {
                dispatch_typing(&self.registry, &typing);
            }
        }
    }

    fn on_socket_error(&self, generation: u64, description: String) {
        // The browser follows every error with a close event; recovery
        // happens there.
        error_log!("WebSocket error on socket #{}: {}", generation, description);
    }

    fn on_socket_close(&self, generation: u64, code: u16, reason: String) {
        let weak = self.downgrade();
        let change = self.with_inner(|inner| {
            if !inner.is_current(generation) {
                debug_log!("Ignoring close ({}) from stale socket #{}", code, generation);
                return None;
            }
            drop(inner.phase.replace(Phase::Idle));
            let change = inner.set_connected(false);

            if code == CLOSE_NORMAL {
                info_log!("WebSocket closed normally");
                inner.phase = Phase::Closed;
            } else {
                warn_log!("WebSocket closed abnormally (code {}, reason '{}')", code, reason);
                schedule_reconnect(&weak, inner);
            }
            change
        });
        self.notify(change.flatten());
    }

    fn on_reconnect_due(&self, generation: u64) {
        let due = self
            .with_inner(|inner| inner.generation == generation && matches!(inner.phase, Phase::Reconnecting { .. }))
            .unwrap_or(false);
        if due {
            debug_log!("Reconnect timer fired");
            self.connect();
        }
    }

    fn on_heartbeat(&self, generation: u64) {
        let live = self
            .with_inner(|inner| inner.generation == generation && matches!(inner.phase, Phase::Connected { .. }))
            .unwrap_or(false);
        if live {
            self.send_message(&builders::create_ping());
        }
    }

    /// Drops a socket that failed to send and goes through the reconnect path.
    fn abandon_socket(&self) {
        let weak = self.downgrade();
        let change = self.with_inner(|inner| {
            let socket = inner.phase.replace(Phase::Idle)?;
            socket.detach();
            socket.close(CLOSE_SEND_FAILED, "send failed");
            let change = inner.set_connected(false);
            schedule_reconnect(&weak, inner);
            change
        });
        self.notify(change.flatten());
    }

    // -----------------------------------------------------------------------
    // Sending
    // -----------------------------------------------------------------------

    /// Sends one envelope. Returns `false` when the socket is not open or
    /// the send fails; nothing is queued.
    pub fn send_message(&self, message: &OutboundMessage) -> bool {
        let text = match serde_json::to_string(message) {
            Ok(text) => text,
            Err(e) => {
                error_log!("Failed to serialize {}: {}", message.kind(), e);
                return false;
            }
        };

        let result = self
            .with_inner(|inner| match inner.phase.socket() {
                Some(socket) if socket.is_open() => Some(socket.send_text(&text)),
                _ => None,
            })
            .flatten();

        match result {
            Some(Ok(())) => true,
            Some(Err(e)) => {
                error_log!("Failed to send {}: {}", message.kind(), e);
                self.abandon_socket();
                false
            }
            None => {
                warn_log!("Attempted to send {} while WebSocket is not connected", message.kind());
                false
            }
        }
    }

    pub fn send_chat_message(&self, ticket_id: TicketId, content: &str, attachments: Vec<String>) -> bool {
        let identity = self.identity();
        self.send_message(&builders::create_chat_message(&identity, ticket_id, content, attachments, None))
    }

    /// Sends a chat message tagged with a fresh client id and returns that id
    /// if the frame went out. The server echoes the id on the resulting
    /// `new_message`.
    pub fn send_tracked_chat_message(
        &self,
        ticket_id: TicketId,
        content: &str,
        attachments: Vec<String>,
    ) -> Option<String> {
        let client_id = uuid::Uuid::new_v4().to_string();
        let identity = self.identity();
        let frame = builders::create_chat_message(&identity, ticket_id, content, attachments, Some(client_id.clone()));
        self.send_message(&frame).then_some(client_id)
    }

    pub fn send_typing_status(&self, ticket_id: TicketId, is_typing: bool) -> bool {
        let identity = self.identity();
        self.send_message(&builders::create_typing(&identity, ticket_id, is_typing))
    }

    pub fn send_message_status(&self, message_id: &str, status: MessageStatus) -> bool {
        self.send_message(&builders::create_message_status(message_id, status))
    }

    // -----------------------------------------------------------------------
    // Subscriptions
    // -----------------------------------------------------------------------

    pub fn subscribe_to_messages<F>(&self, ticket_id: TicketId, handler: F) -> Subscription
    where
        F: FnMut(&ChatMessage) + 'static,
    {
        let handler: MessageHandler = Rc::new(RefCell::new(handler));
        let key = self.registry.borrow_mut().add_message_handler(ticket_id, handler);
        debug_log!("Subscribed to messages for ticket {}", ticket_id);
        Subscription::new(&self.registry, key)
    }

    pub fn subscribe_to_status_updates<F>(&self, ticket_id: TicketId, handler: F) -> Subscription
    where
        F: FnMut(&StatusUpdate) + 'static,
    {
        let handler: StatusHandler = Rc::new(RefCell::new(handler));
        let key = self.registry.borrow_mut().add_status_handler(ticket_id, handler);
        Subscription::new(&self.registry, key)
    }

    pub fn subscribe_to_typing_indicators<F>(&self, ticket_id: TicketId, handler: F) -> Subscription
    where
        F: FnMut(&TypingIndicator) + 'static,
    {
        let handler: TypingHandler = Rc::new(RefCell::new(handler));
        let key = self.registry.borrow_mut().add_typing_handler(ticket_id, handler);
        Subscription::new(&self.registry, key)
    }

    /// Registers a connection-status listener and calls it once, right away,
    /// with the current status.
    pub fn subscribe_to_connection_status<F>(&self, handler: F) -> Subscription
    where
        F: FnMut(bool) + 'static,
    {
        let handler: ConnectionStatusHandler = Rc::new(RefCell::new(handler));
        let key = self.registry.borrow_mut().add_connection_handler(handler.clone());
        let current = self.is_connected();
        (handler.borrow_mut())(current);
        Subscription::new(&self.registry, key)
    }

    // -----------------------------------------------------------------------
    // Introspection
    // -----------------------------------------------------------------------

    pub fn is_connected(&self) -> bool {
        self.inner.try_borrow().map(|inner| inner.connected).unwrap_or(false)
    }

    pub fn state(&self) -> ChannelState {
        self.inner
            .try_borrow()
            .map(|inner| inner.phase.state())
            .unwrap_or(ChannelState::Idle)
    }

    pub fn reconnect_attempts(&self) -> u32 {
        self.inner.try_borrow().map(|inner| inner.reconnect_attempts).unwrap_or(0)
    }

    pub fn identity(&self) -> Identity {
        self.inner.try_borrow().map(|inner| inner.identity()).unwrap_or_default()
    }

    /// URL of the ticket-scoped variant of the channel endpoint.
    pub fn ticket_socket_url(&self, ticket_id: TicketId) -> String {
        let inner = self.inner.borrow();
        inner.config.socket_url(&inner.identity(), Some(ticket_id))
    }

    pub fn registry(&self) -> Rc<RefCell<TopicRegistry>> {
        self.registry.clone()
    }
}

fn send_on(socket: &dyn Socket, message: &OutboundMessage) -> Result<(), super::transport::TransportError> {
    let text = serde_json::to_string(message)
        .map_err(|e| super::transport::TransportError::Send(format!("serialization: {}", e)))?;
    socket.send_text(&text)
}

fn socket_events(weak: &WeakChannel, generation: u64) -> SocketEvents {
    let open = weak.clone();
    let message = weak.clone();
    let error = weak.clone();
    let close = weak.clone();
    SocketEvents {
        on_open: Rc::new(move || {
            if let Some(channel) = open.upgrade() {
                channel.on_socket_open(generation);
            }
        }),
        on_message: Rc::new(move |text| {
            if let Some(channel) = message.upgrade() {
                channel.on_socket_message(generation, text);
            }
        }),
        on_error: Rc::new(move |description| {
            if let Some(channel) = error.upgrade() {
                channel.on_socket_error(generation, description);
            }
        }),
        on_close: Rc::new(move |code, reason| {
            if let Some(channel) = close.upgrade() {
                channel.on_socket_close(generation, code, reason);
            }
        }),
    }
}

/// Moves to `Reconnecting` with a timer set to the current backoff delay, or
/// to `Closed` once the attempt budget is spent. Replacing the phase cancels
/// any timer that was already pending.
fn schedule_reconnect(weak: &WeakChannel, inner: &mut Inner) {
    if inner.reconnect_attempts >= inner.config.max_reconnect_attempts {
        warn_log!(
            "Max reconnection attempts ({}) reached; giving up",
            inner.config.max_reconnect_attempts
        );
        drop(inner.phase.replace(Phase::Closed));
        return;
    }

    let delay = inner.config.backoff.delay_ms(inner.reconnect_attempts);
    inner.reconnect_attempts += 1;
    let attempt = inner.reconnect_attempts;
    let generation = inner.generation;
    info_log!("Reconnecting in {} ms (attempt {})", delay, attempt);

    let weak = weak.clone();
    let timer = inner.scheduler.set_timeout(
        delay,
        Box::new(move || {
            if let Some(channel) = weak.upgrade() {
                channel.on_reconnect_due(generation);
            }
        }),
    );
    drop(inner.phase.replace(Phase::Reconnecting {
        attempt,
        _timer: timer,
    }));
}
