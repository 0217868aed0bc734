// Re-export network modules
pub mod api_client;
pub mod browser;
pub mod config;
pub mod messages;
pub mod realtime;
pub mod retry;
pub mod topic_manager;
pub mod transport;

#[cfg(test)]
pub(crate) mod test_support;

// Re-export commonly used items
pub use api_client::{ApiClient, ApiError, Credentials};
pub use browser::{BrowserScheduler, WebSocketConnector};
pub use config::{ApiConfig, RealtimeConfig};
pub use messages::{builders as message_builders, InboundEvent, OutboundMessage};
pub use realtime::{ChannelState, RealtimeChannel};
pub use retry::{ExponentialBackoff, RetryPolicy};
pub use topic_manager::{EventKind, Subscription, TopicRegistry};

use lazy_static::lazy_static;
use std::sync::RwLock;
use wasm_bindgen::prelude::*;

lazy_static! {
    static ref API_CONFIG: RwLock<Option<ApiConfig>> = RwLock::new(None);
}

fn store_api_config(config: ApiConfig) {
    let mut guard = match API_CONFIG.write() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    };
    *guard = Some(config);
}

/// Initialize the API configuration from the build-time `API_BASE_URL`.
pub fn init_api_config() {
    let config = ApiConfig::from_env();
    debug_log!("Initializing API config (base '{}')", config.base_url());
    store_api_config(config);
}

/// Initialize the API configuration from a JS-provided URL.
/// This allows runtime configuration of the API endpoints.
#[wasm_bindgen]
pub fn init_api_config_js(api_base_url: &str) {
    debug_log!("Initializing API config from JS: {}", api_base_url);
    store_api_config(ApiConfig::from_url(api_base_url));
}

/// Current API configuration; same-origin defaults when none was stored.
pub fn api_config() -> ApiConfig {
    let guard = match API_CONFIG.read() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    };
    guard.clone().unwrap_or_default()
}

/// Base WebSocket URL (no identity parameters).
pub(crate) fn get_ws_url() -> String {
    api_config().ws_url()
}
