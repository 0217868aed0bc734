//! Binds one ticket view to the realtime channel.

pub mod conversation;

use std::cell::RefCell;
use std::rc::{Rc, Weak};

use crate::models::{ChatMessage, MessageStatus, TicketId};
use crate::network::api_client::{ApiClient, ApiError};
use crate::network::realtime::RealtimeChannel;
use crate::network::topic_manager::Subscription;

pub use conversation::{Applied, Conversation, ConversationEntry, Typist};

/// Fetches the ticket's message history and hands it to the sink, now or
/// later.
pub type HistoryLoader = Rc<dyn Fn(TicketId, HistorySink)>;

type ChangeListener = Rc<RefCell<dyn FnMut(&Conversation)>>;

struct SessionState {
    conversation: Conversation,
    focused: bool,
    connected: bool,
    ever_connected: bool,
    on_change: Option<ChangeListener>,
}

struct SessionInner {
    ticket_id: TicketId,
    channel: RealtimeChannel,
    history: Option<HistoryLoader>,
    state: RefCell<SessionState>,
}

/// Completion handle given to a `HistoryLoader`. Dropping it without
/// delivering is fine.
pub struct HistorySink {
    session: Weak<SessionInner>,
}

impl HistorySink {
    pub fn deliver(self, messages: Vec<ChatMessage>) {
        let Some(inner) = self.session.upgrade() else {
            debug_log!("History arrived after the session closed");
            return;
        };
        let added = inner.state.borrow_mut().conversation.merge_history(messages);
        debug_log!("Merged history for ticket {} ({} new)", inner.ticket_id, added);
        inner.acknowledge_if_focused();
        inner.notify();
    }

    pub fn fail(self, error: &ApiError) {
        warn_log!("Failed to load ticket history: {}", error);
    }
}

/// History loader backed by `GET /tickets/{id}/messages`.
pub fn rest_history_loader(client: ApiClient) -> HistoryLoader {
    Rc::new(move |ticket_id: TicketId, sink: HistorySink| {
        let client = client.clone();
        wasm_bindgen_futures::spawn_local(async move {
            match client.list_messages(ticket_id).await {
                Ok(messages) => sink.deliver(messages),
                Err(e) => sink.fail(&e),
            }
        });
    })
}

impl SessionInner {
    fn notify(&self) {
        let (listener, snapshot) = {
            let state = self.state.borrow();
            match &state.on_change {
                Some(listener) => (listener.clone(), state.conversation.clone()),
                None => return,
            }
        };
        match listener.try_borrow_mut() {
            Ok(mut listener) => listener(&snapshot),
            Err(_) => warn_log!(
                "Change listener for ticket {} is already running; skipping nested update",
                self.ticket_id
            ),
        };
    }

    fn load_history(self: &Rc<Self>) {
        if let Some(loader) = &self.history {
            loader(
                self.ticket_id,
                HistorySink {
                    session: Rc::downgrade(self),
                },
            );
        }
    }

    /// Sends `read` for everything from the other party while focused.
    fn acknowledge_if_focused(&self) {
        let unread = {
            let state = self.state.borrow();
            if !state.focused {
                return;
            }
            state.conversation.unread_from_others()
        };
        for id in unread {
            if self.channel.send_message_status(&id, MessageStatus::Read) {
                self.state.borrow_mut().conversation.mark_acknowledged(&id);
            }
        }
    }

    fn on_connection_status(self: &Rc<Self>, connected: bool) {
        let reload = {
            let mut state = self.state.borrow_mut();
            let reload = connected && !state.connected && state.ever_connected;
            state.connected = connected;
            state.ever_connected |= connected;
            reload
        };
        if reload {
            info_log!("Reconnected; refreshing ticket {} history", self.ticket_id);
            self.load_history();
        }
        if connected {
            self.acknowledge_if_focused();
        }
    }
}

/// Live view of one ticket's conversation.
pub struct TicketChatSession {
    inner: Rc<SessionInner>,
    subscriptions: Vec<Subscription>,
}

impl TicketChatSession {
    /// Subscribes to the ticket's events and starts the initial history load.
    pub fn open(channel: &RealtimeChannel, ticket_id: TicketId, history: Option<HistoryLoader>) -> Self {
        let inner = Rc::new(SessionInner {
            ticket_id,
            channel: channel.clone(),
            history,
            state: RefCell::new(SessionState {
                conversation: Conversation::new(ticket_id, channel.identity()),
                focused: false,
                connected: false,
                ever_connected: false,
                on_change: None,
            }),
        });

        let mut subscriptions = Vec::with_capacity(4);

        let weak = Rc::downgrade(&inner);
        subscriptions.push(channel.subscribe_to_messages(ticket_id, move |message| {
            if let Some(inner) = weak.upgrade() {
                inner.state.borrow_mut().conversation.apply_message(message.clone());
                inner.acknowledge_if_focused();
                inner.notify();
            }
        }));

        let weak = Rc::downgrade(&inner);
        subscriptions.push(channel.subscribe_to_status_updates(ticket_id, move |update| {
            if let Some(inner) = weak.upgrade() {
                let changed = inner.state.borrow_mut().conversation.apply_status(update);
                if changed {
                    inner.notify();
                }
            }
        }));

        let weak = Rc::downgrade(&inner);
        subscriptions.push(channel.subscribe_to_typing_indicators(ticket_id, move |indicator| {
            if let Some(inner) = weak.upgrade() {
                let changed = inner.state.borrow_mut().conversation.apply_typing(indicator);
                if changed {
                    inner.notify();
                }
            }
        }));

        let weak = Rc::downgrade(&inner);
        subscriptions.push(channel.subscribe_to_connection_status(move |connected| {
            if let Some(inner) = weak.upgrade() {
                inner.on_connection_status(connected);
            }
        }));

        info_log!("Opened chat session for ticket {}", ticket_id);
        inner.load_history();

        Self { inner, subscriptions }
    }

    pub fn ticket_id(&self) -> TicketId {
        self.inner.ticket_id
    }

    /// Snapshot of the conversation.
    pub fn conversation(&self) -> Conversation {
        self.inner.state.borrow().conversation.clone()
    }

    /// Called with a snapshot after every change to the conversation.
    pub fn on_change<F>(&self, listener: F)
    where
        F: FnMut(&Conversation) + 'static,
    {
        let listener: ChangeListener = Rc::new(RefCell::new(listener));
        self.inner.state.borrow_mut().on_change = Some(listener);
    }

    /// Adds an optimistic placeholder and sends it. Returns the client id;
    /// the placeholder is flagged failed if the channel is not open.
    pub fn send(&self, content: &str) -> String {
        let client_id = self.inner.state.borrow_mut().conversation.push_optimistic(content);
        let frame = crate::network::message_builders::create_chat_message(
            &self.inner.channel.identity(),
            self.inner.ticket_id,
            content,
            Vec::new(),
            Some(client_id.clone()),
        );
        if !self.inner.channel.send_message(&frame) {
            self.inner.state.borrow_mut().conversation.mark_failed(&client_id);
        }
        self.inner.notify();
        client_id
    }

    pub fn set_typing(&self, typing: bool) -> bool {
        self.inner.channel.send_typing_status(self.inner.ticket_id, typing)
    }

    /// While focused, messages from the other party are marked read as they
    /// arrive.
    pub fn set_focused(&self, focused: bool) {
        self.inner.state.borrow_mut().focused = focused;
        self.inner.acknowledge_if_focused();
    }

    pub fn is_open(&self) -> bool {
        !self.subscriptions.is_empty()
    }

    /// Drops every subscription. Idempotent.
    pub fn close(&mut self) {
        if self.subscriptions.is_empty() {
            return;
        }
        for subscription in self.subscriptions.drain(..) {
            subscription.unsubscribe();
        }
        info_log!("Closed chat session for ticket {}", self.inner.ticket_id);
    }
}

impl Drop for TicketChatSession {
    fn drop(&mut self) {
        self.close();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::constants::CLOSE_ABNORMAL;
    use crate::models::UserType;
    use crate::network::config::RealtimeConfig;
    use crate::network::test_support::{ManualScheduler, MockConnector};
    use crate::network::topic_manager::EventKind;
    use serde_json::json;

    struct Fixture {
        channel: RealtimeChannel,
        connector: MockConnector,
        scheduler: ManualScheduler,
        loads: Rc<RefCell<Vec<HistorySink>>>,
    }

    fn fixture() -> Fixture {
        let connector = MockConnector::new();
        let scheduler = ManualScheduler::new();
        let channel = RealtimeChannel::new(
            RealtimeConfig::default().with_ws_base_url("ws://test/ws"),
            connector.clone(),
            scheduler.clone(),
        );
        channel.init(Some("1"), Some(UserType::Requester));
        connector.last().simulate_open();
        Fixture {
            channel,
            connector,
            scheduler,
            loads: Rc::new(RefCell::new(Vec::new())),
        }
    }

    impl Fixture {
        fn loader(&self) -> HistoryLoader {
            let loads = self.loads.clone();
            Rc::new(move |_: TicketId, sink: HistorySink| loads.borrow_mut().push(sink))
        }
    }

    #[test]
    fn incoming_messages_land_in_conversation() {
        let f = fixture();
        let session = TicketChatSession::open(&f.channel, 42, None);
        f.connector.last().simulate_json(json!({
            "type": "new_message", "message": {"id": "m1", "ticket_id": 42, "content": "hello", "sender": {"type": "staff"}}
        }));
        f.connector.last().simulate_json(json!({
            "type": "status_update", "message_id": "m1", "ticket_id": 42, "status": "read"
        }));

        let conversation = session.conversation();
        assert_eq!(conversation.len(), 1);
        assert_eq!(conversation.entries()[0].status, MessageStatus::Read);
    }

    #[test]
    fn send_is_optimistic_then_confirmed() {
        let f = fixture();
        let session = TicketChatSession::open(&f.channel, 42, None);
        let client_id = session.send("where is my order");

        let frames = f.connector.last().sent_of_type("chat_message");
        assert_eq!(frames[0]["client_id"], json!(client_id));
        assert!(session.conversation().entries()[0].pending);

        f.connector.last().simulate_json(json!({
            "type": "new_message",
            "message": {"id": 55, "ticket_id": 42, "content": "where is my order",
                        "sender": {"type": "requester", "id": "1"}, "client_id": client_id}
        }));
        let conversation = session.conversation();
        assert_eq!(conversation.len(), 1);
        assert_eq!(conversation.entries()[0].message.id, "55");
        assert!(!conversation.entries()[0].pending);
    }

    #[test]
    fn send_while_offline_marks_failed() {
        let f = fixture();
        let session = TicketChatSession::open(&f.channel, 42, None);
        f.channel.disconnect();
        session.send("anyone?");
        assert!(session.conversation().entries()[0].failed);
    }

    #[test]
    fn focused_session_marks_other_party_messages_read() {
        let f = fixture();
        let session = TicketChatSession::open(&f.channel, 42, None);
        f.connector.last().simulate_json(json!({
            "type": "new_message", "message": {"id": "early", "ticket_id": 42, "sender": {"type": "staff"}}
        }));
        assert!(f.connector.last().sent_of_type("message_status").iter().all(|s| s["status"] != "read"));

        session.set_focused(true);
        f.connector.last().simulate_json(json!({
            "type": "new_message", "message": {"id": "late", "ticket_id": 42, "sender": {"type": "staff"}}
        }));

        let read: Vec<String> = f
            .connector
            .last()
            .sent_of_type("message_status")
            .into_iter()
            .filter(|s| s["status"] == "read")
            .map(|s| s["message_id"].as_str().unwrap().to_string())
            .collect();
        assert_eq!(read, vec!["early", "late"]);
    }

    #[test]
    fn history_is_loaded_on_open_and_after_reconnect() {
        let f = fixture();
        let session = TicketChatSession::open(&f.channel, 42, Some(f.loader()));
        assert_eq!(f.loads.borrow().len(), 1);

        let sink = f.loads.borrow_mut().remove(0);
        sink.deliver(vec![serde_json::from_value(json!({"id": "h1", "ticket_id": 42})).unwrap()]);
        assert_eq!(session.conversation().len(), 1);

        f.connector.last().simulate_close(CLOSE_ABNORMAL);
        assert_eq!(f.loads.borrow().len(), 0);
        f.scheduler.advance(1000);
        f.connector.last().simulate_open();
        assert_eq!(f.loads.borrow().len(), 1);

        let sink = f.loads.borrow_mut().remove(0);
        sink.deliver(vec![
            serde_json::from_value(json!({"id": "h1", "ticket_id": 42})).unwrap(),
            serde_json::from_value(json!({"id": "h2", "ticket_id": 42})).unwrap(),
        ]);
        assert_eq!(session.conversation().len(), 2);
    }

    #[test]
    fn change_listener_sees_snapshots() {
        let f = fixture();
        let session = TicketChatSession::open(&f.channel, 42, None);
        let sizes = Rc::new(RefCell::new(Vec::new()));
        let sizes_clone = sizes.clone();
        session.on_change(move |c| sizes_clone.borrow_mut().push(c.len()));

        f.connector.last().simulate_json(json!({
            "type": "typing_indicator", "ticket_id": 42, "user_id": 3, "user_type": "staff", "isTyping": true
        }));
        session.send("x");
        assert_eq!(*sizes.borrow(), vec![0, 1]);
    }

    #[test]
    fn listener_may_send_from_inside_a_change() {
        let f = fixture();
        let session = Rc::new(TicketChatSession::open(&f.channel, 42, None));
        let weak = Rc::downgrade(&session);
        let sizes = Rc::new(RefCell::new(Vec::new()));
        let sizes_clone = sizes.clone();
        session.on_change(move |c| {
            sizes_clone.borrow_mut().push(c.len());
            if c.len() == 1 {
                if let Some(session) = weak.upgrade() {
                    session.send("auto reply");
                }
            }
        });

        f.connector.last().simulate_json(json!({
            "type": "new_message", "message": {"id": "m1", "ticket_id": 42, "content": "hi", "sender": {"type": "staff"}}
        }));

        assert_eq!(*sizes.borrow(), vec![1]);
        assert_eq!(session.conversation().len(), 2);
        assert_eq!(f.connector.last().sent_of_type("chat_message").len(), 1);

        session.send("follow up");
        assert_eq!(*sizes.borrow(), vec![1, 3]);
    }

    #[test]
    fn close_releases_subscriptions() {
        let f = fixture();
        let mut session = TicketChatSession::open(&f.channel, 42, None);
        let registry = f.channel.registry();
        assert_eq!(registry.borrow().handler_count(42, EventKind::Message), 1);

        session.close();
        assert!(!session.is_open());
        assert_eq!(registry.borrow().handler_count(42, EventKind::Message), 0);
        assert_eq!(registry.borrow().connection_listener_count(), 0);
        session.close();
    }

    #[test]
    fn dropping_session_unsubscribes() {
        let f = fixture();
        {
            let _session = TicketChatSession::open(&f.channel, 7, None);
        }
        assert!(f.channel.registry().borrow().subscribed_tickets().is_empty());
    }
}
