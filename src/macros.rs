//! Small crate-wide logging macros.
//!
//! In the browser every macro forwards to the matching `console.*` method.
//! Off-wasm (native unit tests) calling into `web_sys` would panic, so
//! `debug_log!` compiles to nothing and the louder levels fall back to
//! stderr.

/// Debug-level log line, formatted like `format!`.
///
/// ```rust,ignore
/// debug_log!("Subscribed to ticket {}", ticket_id);
/// ```
#[macro_export]
macro_rules! debug_log {
    ($($arg:tt)*) => {{
        #[cfg(target_arch = "wasm32")]
        {
            web_sys::console::debug_1(&format!($($arg)*).into());
        }
        #[cfg(not(target_arch = "wasm32"))]
        {
            if false {
                let _ = format!($($arg)*);
            }
        }
    }};
}

/// Informational log line (`console.log`).
#[macro_export]
macro_rules! info_log {
    ($($arg:tt)*) => {{
        #[cfg(target_arch = "wasm32")]
        {
            web_sys::console::log_1(&format!($($arg)*).into());
        }
        #[cfg(not(target_arch = "wasm32"))]
        {
            if false {
                let _ = format!($($arg)*);
            }
        }
    }};
}

/// Warning (`console.warn`).
#[macro_export]
macro_rules! warn_log {
    ($($arg:tt)*) => {{
        #[cfg(target_arch = "wasm32")]
        {
            web_sys::console::warn_1(&format!($($arg)*).into());
        }
        #[cfg(not(target_arch = "wasm32"))]
        {
            eprintln!("WARN: {}", format_args!($($arg)*));
        }
    }};
}

/// Error (`console.error`).
#[macro_export]
macro_rules! error_log {
    ($($arg:tt)*) => {{
        #[cfg(target_arch = "wasm32")]
        {
            web_sys::console::error_1(&format!($($arg)*).into());
        }
        #[cfg(not(target_arch = "wasm32"))]
        {
            eprintln!("ERROR: {}", format_args!($($arg)*));
        }
    }};
}
