//! The seam between the realtime channel state machine and the host
//! environment: sockets and timers.
//!
//! Implementations must never call back into the channel synchronously from
//! inside `Connector::open`, `Socket::send_text`, `Socket::close` or the
//! `Scheduler` methods. The browser delivers socket events on later turns of
//! the event loop, and `BrowserScheduler` runs timer callbacks on a fresh
//! microtask, so both satisfy this.

use std::any::Any;
use std::rc::Rc;
use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TransportError {
    #[error("failed to open socket to {url}: {reason}")]
    Connect { url: String, reason: String },
    #[error("socket is not open")]
    NotOpen,
    #[error("send failed: {0}")]
    Send(String),
}

/// A live (or opening) socket owned by the channel.
pub trait Socket {
    /// True once the handshake finished and until the socket starts closing.
    fn is_open(&self) -> bool;

    fn send_text(&self, text: &str) -> Result<(), TransportError>;

    /// Unhooks every event handler so nothing fired by this socket after
    /// this call reaches the channel.
    fn detach(&self);

    fn close(&self, code: u16, reason: &str);
}

/// Callbacks a connector wires to a freshly opened socket.
#[derive(Clone)]
pub struct SocketEvents {
    pub on_open: Rc<dyn Fn()>,
    pub on_message: Rc<dyn Fn(String)>,
    pub on_error: Rc<dyn Fn(String)>,
    pub on_close: Rc<dyn Fn(u16, String)>,
}

/// Opens sockets. The browser implementation is `WebSocketConnector`; tests
/// use an in-memory mock.
pub trait Connector {
    fn open(&self, url: &str, events: SocketEvents) -> Result<Box<dyn Socket>, TransportError>;
}

/// Cancels its timer when dropped.
pub struct TimerHandle {
    _guard: Box<dyn Any>,
}

impl TimerHandle {
    pub fn new<G: Any>(guard: G) -> Self {
        Self {
            _guard: Box::new(guard),
        }
    }
}

impl std::fmt::Debug for TimerHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("TimerHandle")
    }
}

/// One-shot and repeating timers. Dropping the returned handle cancels the
/// timer.
pub trait Scheduler {
    fn set_timeout(&self, delay_ms: u32, callback: Box<dyn FnOnce()>) -> TimerHandle;
    fn set_interval(&self, period_ms: u32, callback: Box<dyn FnMut()>) -> TimerHandle;
}
