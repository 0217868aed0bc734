//! Drives `RealtimeChannel` through its public transport seam and checks the
//! frames it puts on the wire against the realtime protocol.
//!
//! Run with: cargo test --test realtime_contract

use std::cell::{Cell, RefCell};
use std::rc::Rc;

use serde_json::{json, Value};
use support_desk_frontend::models::{ChatMessage, MessageStatus, UserType};
use support_desk_frontend::network::transport::{
    Connector, Scheduler, Socket, SocketEvents, TimerHandle, TransportError,
};
use support_desk_frontend::network::{InboundEvent, RealtimeChannel, RealtimeConfig};

#[derive(Default)]
struct Wire {
    open: Cell<bool>,
    sent: RefCell<Vec<Value>>,
    events: RefCell<Option<SocketEvents>>,
    urls: RefCell<Vec<String>>,
}

struct WireSocket(Rc<Wire>);

impl Socket for WireSocket {
    fn is_open(&self) -> bool {
        self.0.open.get()
    }

    fn send_text(&self, text: &str) -> Result<(), TransportError> {
        if !self.0.open.get() {
            return Err(TransportError::NotOpen);
        }
        self.0.sent.borrow_mut().push(serde_json::from_str(text).expect("valid JSON"));
        Ok(())
    }

    fn detach(&self) {
        self.0.events.borrow_mut().take();
    }

    fn close(&self, _code: u16, _reason: &str) {
        self.0.open.set(false);
    }
}

#[derive(Clone, Default)]
struct WireConnector(Rc<Wire>);

impl Connector for WireConnector {
    fn open(&self, url: &str, events: SocketEvents) -> Result<Box<dyn Socket>, TransportError> {
        self.0.urls.borrow_mut().push(url.to_string());
        *self.0.events.borrow_mut() = Some(events);
        Ok(Box::new(WireSocket(self.0.clone())))
    }
}

impl WireConnector {
    fn events(&self) -> SocketEvents {
        self.0.events.borrow().clone().expect("socket attached")
    }

    fn open_socket(&self) {
        self.0.open.set(true);
        (self.events().on_open)();
    }

    fn receive(&self, frame: Value) {
        (self.events().on_message)(frame.to_string());
    }

    fn sent(&self) -> Vec<Value> {
        self.0.sent.borrow().clone()
    }
}

/// Timers that never fire.
struct FrozenClock;

impl Scheduler for FrozenClock {
    fn set_timeout(&self, _delay_ms: u32, _callback: Box<dyn FnOnce()>) -> TimerHandle {
        TimerHandle::new(())
    }

    fn set_interval(&self, _period_ms: u32, _callback: Box<dyn FnMut()>) -> TimerHandle {
        TimerHandle::new(())
    }
}

fn channel() -> (RealtimeChannel, WireConnector) {
    let connector = WireConnector::default();
    let config = RealtimeConfig::default().with_ws_base_url("wss://desk.example.com/ws");
    (RealtimeChannel::new(config, connector.clone(), FrozenClock), connector)
}

#[test]
fn requester_receives_staff_reply_and_acknowledges_delivery() {
    let (channel, wire) = channel();
    let inbox: Rc<RefCell<Vec<ChatMessage>>> = Rc::default();
    let inbox_clone = inbox.clone();
    let _sub = channel.subscribe_to_messages(42, move |m| inbox_clone.borrow_mut().push(m.clone()));

    channel.init(Some("1"), Some(UserType::Requester));
    assert_eq!(
        wire.0.urls.borrow().as_slice(),
        ["wss://desk.example.com/ws?userId=1&userType=requester"]
    );
    wire.open_socket();

    wire.receive(json!({
        "type": "new_message",
        "message": {"id": "m1", "ticket_id": 42, "sender": {"type": "staff"}, "content": "hi"}
    }));

    assert_eq!(inbox.borrow().len(), 1);
    assert_eq!(inbox.borrow()[0].content, "hi");

    let sent = wire.sent();
    assert_eq!(sent[0]["type"], "connection_init");
    assert_eq!(
        sent[1],
        json!({"type": "message_status", "message_id": "m1", "status": "delivered"})
    );
}

#[test]
fn outbound_frames_use_protocol_field_names() {
    let (channel, wire) = channel();
    channel.init(Some("s-7"), Some(UserType::Staff));
    wire.open_socket();

    assert!(channel.send_typing_status(3, true));
    assert!(channel.send_chat_message(3, "looking now", vec![]));
    assert!(channel.send_message_status("m9", MessageStatus::Read));

    let sent = wire.sent();
    let init = &sent[0];
    assert_eq!(init["userId"], "s-7");
    assert_eq!(init["userType"], "staff");
    assert!(init["timestamp"].is_i64());

    assert_eq!(
        sent[1],
        json!({"type": "typing", "ticket_id": 3, "sender_id": "s-7", "sender_type": "staff", "isTyping": true})
    );
    assert_eq!(sent[2]["type"], "chat_message");
    assert_eq!(sent[2]["content"], "looking now");
    assert_eq!(sent[3]["status"], "read");
}

#[test]
fn every_server_frame_type_is_understood() {
    let frames = [
        json!({"type": "connection_established", "message": "ok"}),
        json!({"type": "new_message", "message": {"id": 1, "ticket_id": "2"}}),
        json!({"type": "status_update", "message_id": 1, "ticket_id": 2, "status": "delivered"}),
        json!({"type": "typing_indicator", "ticket_id": 2, "isTyping": false}),
        json!({"type": "pong", "timestamp": 123}),
    ];
    for frame in frames {
        let parsed = InboundEvent::parse(&frame.to_string());
        assert!(parsed.is_ok(), "failed to parse {}: {:?}", frame, parsed.err());
    }
}
