//! Browser implementations of the transport seam: `web_sys::WebSocket` and
//! `gloo-timers`.

use gloo_timers::callback::{Interval, Timeout};
use std::cell::RefCell;
use std::rc::Rc;
use wasm_bindgen::prelude::*;
use wasm_bindgen::JsCast;
use wasm_bindgen_futures::spawn_local;
use web_sys::{CloseEvent, MessageEvent, WebSocket};

use super::transport::{Connector, Scheduler, Socket, SocketEvents, TimerHandle, TransportError};

/// Opens real browser WebSockets.
#[derive(Debug, Default, Clone, Copy)]
pub struct WebSocketConnector;

/// A browser socket plus the closures wired to it. The closures live as long
/// as this value instead of being leaked with `forget()`.
struct BrowserSocket {
    ws: WebSocket,
    _onopen: Closure<dyn FnMut(web_sys::Event)>,
    _onmessage: Closure<dyn FnMut(MessageEvent)>,
    _onerror: Closure<dyn FnMut(web_sys::Event)>,
    _onclose: Closure<dyn FnMut(web_sys::Event)>,
}

impl Connector for WebSocketConnector {
    fn open(&self, url: &str, events: SocketEvents) -> Result<Box<dyn Socket>, TransportError> {
        let ws = WebSocket::new(url).map_err(|e| TransportError::Connect {
            url: url.to_string(),
            reason: format!("{:?}", e),
        })?;

        // Every handler hands the event to the channel on a fresh microtask,
        // so the channel may drop this socket (and these closures) while
        // reacting to it.
        let on_open = events.on_open.clone();
        let onopen = Closure::wrap(Box::new(move |_: web_sys::Event| {
            let on_open = on_open.clone();
            spawn_local(async move { on_open() });
        }) as Box<dyn FnMut(web_sys::Event)>);
        ws.set_onopen(Some(onopen.as_ref().unchecked_ref()));

        let on_message = events.on_message.clone();
        let onmessage = Closure::wrap(Box::new(move |event: MessageEvent| {
            match event.data().as_string() {
                Some(text) => {
                    let on_message = on_message.clone();
                    spawn_local(async move { on_message(text) });
                }
                None => warn_log!("Received non-text WebSocket frame; ignoring"),
            }
        }) as Box<dyn FnMut(MessageEvent)>);
        ws.set_onmessage(Some(onmessage.as_ref().unchecked_ref()));

        let on_error = events.on_error.clone();
        let onerror = Closure::wrap(Box::new(move |e: web_sys::Event| {
            let description = e.type_();
            let on_error = on_error.clone();
            spawn_local(async move { on_error(description) });
        }) as Box<dyn FnMut(web_sys::Event)>);
        ws.set_onerror(Some(onerror.as_ref().unchecked_ref()));

        let on_close = events.on_close.clone();
        let onclose = Closure::wrap(Box::new(move |evt: web_sys::Event| {
            let (code, reason) = match evt.dyn_into::<CloseEvent>() {
                Ok(close_evt) => (close_evt.code(), close_evt.reason()),
                Err(_) => (crate::constants::CLOSE_ABNORMAL, String::new()),
            };
            let on_close = on_close.clone();
            spawn_local(async move { on_close(code, reason) });
        }) as Box<dyn FnMut(web_sys::Event)>);
        ws.set_onclose(Some(onclose.as_ref().unchecked_ref()));

        Ok(Box::new(BrowserSocket {
            ws,
            _onopen: onopen,
            _onmessage: onmessage,
            _onerror: onerror,
            _onclose: onclose,
        }))
    }
}

impl Socket for BrowserSocket {
    fn is_open(&self) -> bool {
        self.ws.ready_state() == WebSocket::OPEN
    }

    fn send_text(&self, text: &str) -> Result<(), TransportError> {
        if !self.is_open() {
            return Err(TransportError::NotOpen);
        }
        self.ws
            .send_with_str(text)
            .map_err(|e| TransportError::Send(format!("{:?}", e)))
    }

    fn detach(&self) {
        self.ws.set_onopen(None);
        self.ws.set_onmessage(None);
        self.ws.set_onerror(None);
        self.ws.set_onclose(None);
    }

    fn close(&self, code: u16, reason: &str) {
        if let Err(e) = self.ws.close_with_code_and_reason(code, reason) {
            error_log!("Error sending close command: {:?}", e);
        }
    }
}

impl Drop for BrowserSocket {
    fn drop(&mut self) {
        // The JS object may outlive us; make sure it cannot call into the
        // closures we are about to free.
        self.detach();
    }
}

/// `gloo-timers` backed scheduler. Callbacks run on a fresh microtask so
/// they are free to drop their own `TimerHandle`.
#[derive(Debug, Default, Clone, Copy)]
pub struct BrowserScheduler;

impl Scheduler for BrowserScheduler {
    fn set_timeout(&self, delay_ms: u32, callback: Box<dyn FnOnce()>) -> TimerHandle {
        let timeout = Timeout::new(delay_ms, move || {
            spawn_local(async move { callback() });
        });
        TimerHandle::new(timeout)
    }

    fn set_interval(&self, period_ms: u32, callback: Box<dyn FnMut()>) -> TimerHandle {
        let callback = Rc::new(RefCell::new(callback));
        let interval = Interval::new(period_ms, move || {
            let callback = callback.clone();
            spawn_local(async move {
                if let Ok(mut tick) = callback.try_borrow_mut() {
                    tick();
                }
            });
        });
        TimerHandle::new(interval)
    }
}

#[cfg(all(test, target_arch = "wasm32"))]
mod tests {
    use super::*;
    use gloo_timers::future::TimeoutFuture;
    use std::cell::Cell;
    use wasm_bindgen_test::*;

    wasm_bindgen_test_configure!(run_in_browser);

    #[wasm_bindgen_test]
    async fn timeout_fires_once() {
        let fired = Rc::new(Cell::new(0));
        let fired_clone = fired.clone();
        let _handle = BrowserScheduler.set_timeout(5, Box::new(move || fired_clone.set(fired_clone.get() + 1)));
        TimeoutFuture::new(50).await;
        assert_eq!(fired.get(), 1);
    }

    #[wasm_bindgen_test]
    async fn dropping_handle_cancels_timeout() {
        let fired = Rc::new(Cell::new(false));
        let fired_clone = fired.clone();
        let handle = BrowserScheduler.set_timeout(10, Box::new(move || fired_clone.set(true)));
        drop(handle);
        TimeoutFuture::new(50).await;
        assert!(!fired.get());
    }

    #[wasm_bindgen_test]
    fn connector_rejects_invalid_url() {
        let noop = SocketEvents {
            on_open: Rc::new(|| {}),
            on_message: Rc::new(|_| {}),
            on_error: Rc::new(|_| {}),
            on_close: Rc::new(|_, _| {}),
        };
        let result = WebSocketConnector.open("not a url", noop);
        assert!(matches!(result, Err(TransportError::Connect { .. })));
    }
}
