use wasm_bindgen::prelude::*;

#[macro_use]
mod macros;

pub mod bindings;
pub mod components;
pub mod constants;
pub mod models;
pub mod network;


pub use bindings::{JsSubscription, SupportChannel};
pub use components::TicketChatSession;
pub use network::{ApiClient, ChannelState, RealtimeChannel, RealtimeConfig};

// Main entry point for the WASM module
#[wasm_bindgen(start)]
pub fn start() {
    // Initialize better panic messages
    console_error_panic_hook::set_once();

    // Build-time API base; JS may override it with `init_api_config_js`.
    network::init_api_config();
}
