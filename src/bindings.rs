//! JavaScript surface: `SupportChannel` wraps a browser-backed realtime
//! channel so plain JS views can use it.

use serde::Serialize;
use wasm_bindgen::prelude::*;

use crate::models::{MessageStatus, TicketId, UserType};
use crate::network::config::RealtimeConfig;
use crate::network::realtime::RealtimeChannel;
use crate::network::topic_manager::Subscription;

fn to_js<T: Serialize>(value: &T) -> Result<JsValue, serde_wasm_bindgen::Error> {
    // Plain objects rather than ES `Map`s for the flattened extra fields.
    value.serialize(&serde_wasm_bindgen::Serializer::json_compatible())
}

/// JS numbers are doubles; accept only non-negative integers in the safe range.
fn parse_ticket_id(raw: f64) -> Option<TicketId> {
    const MAX_SAFE_INTEGER: f64 = 9_007_199_254_740_991.0;
    if raw.is_finite() && raw >= 0.0 && raw.fract() == 0.0 && raw <= MAX_SAFE_INTEGER {
        Some(raw as TicketId)
    } else {
        None
    }
}

fn ticket_id(raw: f64) -> Result<TicketId, JsValue> {
    parse_ticket_id(raw).ok_or_else(|| JsValue::from_str(&format!("invalid ticket id: {}", raw)))
}

fn parse_status(raw: &str) -> MessageStatus {
    serde_json::from_value(serde_json::Value::String(raw.trim().to_ascii_lowercase()))
        .unwrap_or(MessageStatus::Unknown)
}

fn invoke<T: Serialize>(callback: &js_sys::Function, payload: &T) {
    match to_js(payload) {
        Ok(value) => {
            if let Err(e) = callback.call1(&JsValue::NULL, &value) {
                error_log!("Subscriber threw: {:?}", e);
            }
        }
        Err(e) => error_log!("Failed to convert event for JS: {}", e),
    }
}

/// Handle returned by the `subscribeTo*` methods.
#[wasm_bindgen]
pub struct JsSubscription {
    inner: Subscription,
}

#[wasm_bindgen]
impl JsSubscription {
    pub fn unsubscribe(&self) {
        self.inner.unsubscribe();
    }

    #[wasm_bindgen(getter)]
    pub fn active(&self) -> bool {
        self.inner.is_active()
    }
}

impl From<Subscription> for JsSubscription {
    fn from(inner: Subscription) -> Self {
        Self { inner }
    }
}

#[wasm_bindgen]
pub struct SupportChannel {
    channel: RealtimeChannel,
}

#[wasm_bindgen]
impl SupportChannel {
    /// `wsUrl` overrides the endpoint derived from the API config.
    #[wasm_bindgen(constructor)]
    pub fn new(ws_url: Option<String>) -> SupportChannel {
        let mut config = RealtimeConfig::default();
        config.ws_base_url = ws_url.filter(|url| !url.trim().is_empty());
        SupportChannel {
            channel: RealtimeChannel::browser(config),
        }
    }

    pub fn init(&self, user_id: Option<String>, user_type: Option<String>) {
        let user_type = user_type.as_deref().map(UserType::parse);
        self.channel.init(user_id.as_deref(), user_type);
    }

    pub fn connect(&self) {
        self.channel.connect();
    }

    pub fn disconnect(&self) {
        self.channel.disconnect();
    }

    #[wasm_bindgen(js_name = isConnected)]
    pub fn is_connected(&self) -> bool {
        self.channel.is_connected()
    }

    #[wasm_bindgen(getter)]
    pub fn state(&self) -> String {
        self.channel.state().to_string()
    }

    #[wasm_bindgen(js_name = reconnectAttempts)]
    pub fn reconnect_attempts(&self) -> u32 {
        self.channel.reconnect_attempts()
    }

    /// `attachments` is an optional array of attachment ids.
    #[wasm_bindgen(js_name = sendChatMessage)]
    pub fn send_chat_message(&self, ticket: f64, content: &str, attachments: JsValue) -> Result<bool, JsValue> {
        let attachments: Vec<String> = if attachments.is_undefined() || attachments.is_null() {
            Vec::new()
        } else {
            serde_wasm_bindgen::from_value(attachments)?
        };
        Ok(self.channel.send_chat_message(ticket_id(ticket)?, content, attachments))
    }

    /// Like `sendChatMessage` but returns the client id echoed on the
    /// server's `new_message`, or `undefined` if nothing was sent.
    #[wasm_bindgen(js_name = sendTrackedChatMessage)]
    pub fn send_tracked_chat_message(&self, ticket: f64, content: &str) -> Result<Option<String>, JsValue> {
        Ok(self.channel.send_tracked_chat_message(ticket_id(ticket)?, content, Vec::new()))
    }

    #[wasm_bindgen(js_name = sendTypingStatus)]
    pub fn send_typing_status(&self, ticket: f64, is_typing: bool) -> Result<bool, JsValue> {
        Ok(self.channel.send_typing_status(ticket_id(ticket)?, is_typing))
    }

    #[wasm_bindgen(js_name = sendMessageStatus)]
    pub fn send_message_status(&self, message_id: &str, status: &str) -> bool {
        self.channel.send_message_status(message_id, parse_status(status))
    }

    #[wasm_bindgen(js_name = subscribeToMessages)]
    pub fn subscribe_to_messages(&self, ticket: f64, callback: js_sys::Function) -> Result<JsSubscription, JsValue> {
        let subscription = self
            .channel
            .subscribe_to_messages(ticket_id(ticket)?, move |message| invoke(&callback, message));
        Ok(subscription.into())
    }

    #[wasm_bindgen(js_name = subscribeToStatusUpdates)]
    pub fn subscribe_to_status_updates(
        &self,
        ticket: f64,
        callback: js_sys::Function,
    ) -> Result<JsSubscription, JsValue> {
        let subscription = self
            .channel
            .subscribe_to_status_updates(ticket_id(ticket)?, move |update| invoke(&callback, update));
        Ok(subscription.into())
    }

    #[wasm_bindgen(js_name = subscribeToTypingIndicators)]
    pub fn subscribe_to_typing_indicators(
        &self,
        ticket: f64,
        callback: js_sys::Function,
    ) -> Result<JsSubscription, JsValue> {
        let subscription = self
            .channel
            .subscribe_to_typing_indicators(ticket_id(ticket)?, move |typing| invoke(&callback, typing));
        Ok(subscription.into())
    }

    #[wasm_bindgen(js_name = subscribeToConnectionStatus)]
    pub fn subscribe_to_connection_status(&self, callback: js_sys::Function) -> JsSubscription {
        self.channel
            .subscribe_to_connection_status(move |connected| {
                if let Err(e) = callback.call1(&JsValue::NULL, &JsValue::from_bool(connected)) {
                    error_log!("Connection listener threw: {:?}", e);
                }
            })
            .into()
    }

    #[wasm_bindgen(js_name = ticketSocketUrl)]
    pub fn ticket_socket_url(&self, ticket: f64) -> Result<String, JsValue> {
        Ok(self.channel.ticket_socket_url(ticket_id(ticket)?))
    }
}
