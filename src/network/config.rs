use crate::constants::{
    API_PREFIX, DEFAULT_HEARTBEAT_INTERVAL_MS, DEFAULT_MAX_RECONNECT_ATTEMPTS, WS_PATH,
};
use crate::models::{encode_query_value, Identity, TicketId};

use super::retry::ExponentialBackoff;

/// API route configuration
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct ApiConfig {
    // When empty, the SPA assumes same-origin: REST URLs are relative
    // ("/api/...") and the WebSocket URL comes from `window.location`.
    base_url: String,
}

impl ApiConfig {
    /// Build-time configuration from the `API_BASE_URL` environment variable.
    /// Missing means same-origin.
    pub fn from_env() -> Self {
        Self::from_url(option_env!("API_BASE_URL").unwrap_or(""))
    }

    pub fn from_url(url: &str) -> Self {
        Self {
            base_url: url.trim().trim_end_matches('/').to_string(),
        }
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    /// Full REST URL for `path` (which starts with `/`).
    pub fn url(&self, path: &str) -> String {
        format!("{}{}{}", self.base_url, API_PREFIX, path)
    }

    /// Base WebSocket URL, without identity parameters.
    pub fn ws_url(&self) -> String {
        if self.base_url.is_empty() {
            return format!("{}{}", same_origin_ws_base(), WS_PATH);
        }

        let ws_base = if let Some(rest) = self.base_url.strip_prefix("https://") {
            format!("wss://{}", rest)
        } else if let Some(rest) = self.base_url.strip_prefix("http://") {
            format!("ws://{}", rest)
        } else {
            self.base_url.clone()
        };
        format!("{}{}", ws_base, WS_PATH)
    }
}

#[cfg(target_arch = "wasm32")]
fn same_origin_ws_base() -> String {
    if let Some(win) = web_sys::window() {
        let loc = win.location();
        let host = loc.host().unwrap_or_else(|_| "localhost".into());
        let proto = loc.protocol().unwrap_or_else(|_| "http:".into());
        let scheme = if proto == "https:" { "wss" } else { "ws" };
        return format!("{}://{}", scheme, host);
    }
    "ws://localhost".to_string()
}

#[cfg(not(target_arch = "wasm32"))]
fn same_origin_ws_base() -> String {
    "ws://localhost".to_string()
}

/// Tunables of the realtime channel.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RealtimeConfig {
    /// Explicit WebSocket endpoint. `None` derives it from the global
    /// `ApiConfig`.
    pub ws_base_url: Option<String>,
    pub backoff: ExponentialBackoff,
    /// Reconnects scheduled after consecutive abnormal closes before giving up.
    pub max_reconnect_attempts: u32,
    pub heartbeat_interval_ms: u32,
}

impl Default for RealtimeConfig {
    fn default() -> Self {
        Self {
            ws_base_url: None,
            backoff: ExponentialBackoff::default(),
            max_reconnect_attempts: DEFAULT_MAX_RECONNECT_ATTEMPTS,
            heartbeat_interval_ms: DEFAULT_HEARTBEAT_INTERVAL_MS,
        }
    }
}

impl RealtimeConfig {
    pub fn with_ws_base_url(mut self, url: impl Into<String>) -> Self {
        self.ws_base_url = Some(url.into());
        self
    }

    fn ws_base(&self) -> String {
        match &self.ws_base_url {
            Some(url) => url.trim_end_matches('/').to_string(),
            None => super::get_ws_url(),
        }
    }

    /// `<base>?userId=..&userType=..`, plus `&ticketId=..` for the
    /// ticket-scoped variant.
    pub fn socket_url(&self, identity: &Identity, ticket_id: Option<TicketId>) -> String {
        let base = self.ws_base();
        let separator = if base.contains('?') { '&' } else { '?' };
        let mut url = format!(
            "{}{}userId={}&userType={}",
            base,
            separator,
            encode_query_value(&identity.user_id),
            identity.user_type.as_str()
        );
        if let Some(ticket_id) = ticket_id {
            url.push_str(&format!("&ticketId={}", ticket_id));
        }
        url
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::UserType;

    #[test]
    fn ws_url_swaps_scheme() {
        assert_eq!(ApiConfig::from_url("https://desk.example.com/").ws_url(), "wss://desk.example.com/ws");
        assert_eq!(ApiConfig::from_url("http://localhost:8000").ws_url(), "ws://localhost:8000/ws");
        assert_eq!(ApiConfig::default().ws_url(), "ws://localhost/ws");
    }

    #[test]
    fn rest_urls_are_prefixed() {
        assert_eq!(ApiConfig::from_url("http://api").url("/tickets/3"), "http://api/api/tickets/3");
        assert_eq!(ApiConfig::default().url("/tickets"), "/api/tickets");
    }

    #[test]
    fn socket_url_carries_identity() {
        let config = RealtimeConfig::default().with_ws_base_url("wss://rt.example.com/ws/");
        let identity = Identity::new(Some("user 1"), Some(UserType::Staff));
        assert_eq!(
            config.socket_url(&identity, None),
            "wss://rt.example.com/ws?userId=user+1&userType=staff"
        );
        assert_eq!(
            config.socket_url(&identity, Some(42)),
            "wss://rt.example.com/ws?userId=user+1&userType=staff&ticketId=42"
        );
    }

    #[test]
    fn socket_url_appends_to_existing_query() {
        let config = RealtimeConfig::default().with_ws_base_url("ws://h/ws?v=2");
        let url = config.socket_url(&Identity::default(), None);
        assert_eq!(url, "ws://h/ws?v=2&userId=anonymous&userType=requester");
    }
}
