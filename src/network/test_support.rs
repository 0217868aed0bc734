//! In-memory connector and a manually advanced clock for driving the
//! realtime channel from native unit tests.

use serde_json::Value;
use std::cell::{Cell, RefCell};
use std::rc::Rc;

use super::transport::{Connector, Scheduler, Socket, SocketEvents, TimerHandle, TransportError};

// ---------------------------------------------------------------------------
// Sockets
// ---------------------------------------------------------------------------

#[derive(Default)]
pub struct MockSocketState {
    pub open: Cell<bool>,
    pub detached: Cell<bool>,
    pub fail_send: Cell<bool>,
    pub closed_with: RefCell<Option<(u16, String)>>,
    pub sent: RefCell<Vec<String>>,
}

struct MockSocket {
    state: Rc<MockSocketState>,
}

impl Socket for MockSocket {
    fn is_open(&self) -> bool {
        self.state.open.get()
    }

    fn send_text(&self, text: &str) -> Result<(), TransportError> {
        if !self.state.open.get() {
            return Err(TransportError::NotOpen);
        }
        if self.state.fail_send.get() {
            return Err(TransportError::Send("mock send failure".into()));
        }
        self.state.sent.borrow_mut().push(text.to_string());
        Ok(())
    }

    fn detach(&self) {
        self.state.detached.set(true);
    }

    fn close(&self, code: u16, reason: &str) {
        self.state.open.set(false);
        *self.state.closed_with.borrow_mut() = Some((code, reason.to_string()));
    }
}

pub struct OpenedSocket {
    pub url: String,
    pub events: SocketEvents,
    pub state: Rc<MockSocketState>,
}

#[derive(Clone, Default)]
pub struct MockConnector {
    sockets: Rc<RefCell<Vec<Rc<OpenedSocket>>>>,
    fail_next: Rc<Cell<u32>>,
}

impl Connector for MockConnector {
    fn open(&self, url: &str, events: SocketEvents) -> Result<Box<dyn Socket>, TransportError> {
        if self.fail_next.get() > 0 {
            self.fail_next.set(self.fail_next.get() - 1);
            return Err(TransportError::Connect {
                url: url.to_string(),
                reason: "mock refused".into(),
            });
        }
        let state = Rc::new(MockSocketState::default());
        self.sockets.borrow_mut().push(Rc::new(OpenedSocket {
            url: url.to_string(),
            events,
            state: state.clone(),
        }));
        Ok(Box::new(MockSocket { state }))
    }
}

impl MockConnector {
    pub fn new() -> Self {
        Self::default()
    }

    /// Makes the next `n` `open` calls fail.
    pub fn refuse_next(&self, n: u32) {
        self.fail_next.set(n);
    }

    pub fn socket_count(&self) -> usize {
        self.sockets.borrow().len()
    }

    pub fn socket(&self, index: usize) -> Rc<OpenedSocket> {
        self.sockets.borrow()[index].clone()
    }

    pub fn last(&self) -> Rc<OpenedSocket> {
        let sockets = self.sockets.borrow();
        sockets.last().cloned().expect("no socket opened")
    }
}

impl OpenedSocket {
    /// Delivers an event the way a browser would: not at all once detached.
    fn deliver(&self, f: impl FnOnce(&SocketEvents)) {
        if !self.state.detached.get() {
            f(&self.events);
        }
    }

    pub fn simulate_open(&self) {
        self.state.open.set(true);
        self.deliver(|events| (events.on_open)());
    }

    pub fn simulate_message(&self, frame: &str) {
        let frame = frame.to_string();
        self.deliver(|events| (events.on_message)(frame));
    }

    pub fn simulate_json(&self, frame: Value) {
        self.simulate_message(&frame.to_string());
    }

    pub fn simulate_error(&self) {
        self.deliver(|events| (events.on_error)("error".into()));
    }

    pub fn simulate_close(&self, code: u16) {
        self.state.open.set(false);
        self.deliver(|events| (events.on_close)(code, String::new()));
    }

    /// Fires `close` even if the channel detached this socket, to exercise
    /// the stale-generation guard.
    pub fn force_close(&self, code: u16) {
        self.state.open.set(false);
        (self.events.on_close)(code, String::new());
    }

    pub fn force_message(&self, frame: Value) {
        (self.events.on_message)(frame.to_string());
    }

    pub fn sent_frames(&self) -> Vec<Value> {
        self.state
            .sent
            .borrow()
            .iter()
            .map(|raw| serde_json::from_str(raw).expect("client sent invalid JSON"))
            .collect()
    }

    pub fn sent_of_type(&self, kind: &str) -> Vec<Value> {
        self.sent_frames()
            .into_iter()
            .filter(|frame| frame["type"] == kind)
            .collect()
    }

    pub fn closed_with(&self) -> Option<u16> {
        self.state.closed_with.borrow().as_ref().map(|(code, _)| *code)
    }
}

// ---------------------------------------------------------------------------
// Timers
// ---------------------------------------------------------------------------

enum TimerCallback {
    Once(Option<Box<dyn FnOnce()>>),
    Repeat(Rc<RefCell<Box<dyn FnMut()>>>),
}

struct TimerEntry {
    due_ms: u64,
    delay_ms: u32,
    period_ms: Option<u32>,
    callback: TimerCallback,
    cancelled: Rc<Cell<bool>>,
}

struct CancelOnDrop(Rc<Cell<bool>>);

impl Drop for CancelOnDrop {
    fn drop(&mut self) {
        self.0.set(true);
    }
}

#[derive(Default)]
struct ClockState {
    now_ms: u64,
    timers: Vec<TimerEntry>,
}

/// Virtual clock. Nothing fires until the test calls `advance`.
#[derive(Clone, Default)]
pub struct ManualScheduler {
    state: Rc<RefCell<ClockState>>,
}

impl Scheduler for ManualScheduler {
    fn set_timeout(&self, delay_ms: u32, callback: Box<dyn FnOnce()>) -> TimerHandle {
        self.push(delay_ms, None, TimerCallback::Once(Some(callback)))
    }

    fn set_interval(&self, period_ms: u32, callback: Box<dyn FnMut()>) -> TimerHandle {
        self.push(
            period_ms,
            Some(period_ms),
            TimerCallback::Repeat(Rc::new(RefCell::new(callback))),
        )
    }
}

impl ManualScheduler {
    pub fn new() -> Self {
        Self::default()
    }

    fn push(&self, delay_ms: u32, period_ms: Option<u32>, callback: TimerCallback) -> TimerHandle {
        let cancelled = Rc::new(Cell::new(false));
        let mut state = self.state.borrow_mut();
        let due_ms = state.now_ms + delay_ms as u64;
        state.timers.push(TimerEntry {
            due_ms,
            delay_ms,
            period_ms,
            callback,
            cancelled: cancelled.clone(),
        });
        TimerHandle::new(CancelOnDrop(cancelled))
    }

    pub fn now_ms(&self) -> u64 {
        self.state.borrow().now_ms
    }

    /// Delays of one-shot timers that are still pending.
    pub fn pending_timeouts(&self) -> Vec<u32> {
        self.state
            .borrow()
            .timers
            .iter()
            .filter(|t| t.period_ms.is_none() && !t.cancelled.get())
            .map(|t| t.delay_ms)
            .collect()
    }

    pub fn active_intervals(&self) -> usize {
        self.state
            .borrow()
            .timers
            .iter()
            .filter(|t| t.period_ms.is_some() && !t.cancelled.get())
            .count()
    }

    /// Moves the clock forward, firing due timers in order.
    pub fn advance(&self, ms: u64) {
        let target = self.state.borrow().now_ms + ms;
        loop {
            let next = {
                let mut state = self.state.borrow_mut();
                state.timers.retain(|t| !t.cancelled.get());
                let index = state
                    .timers
                    .iter()
                    .enumerate()
                    .filter(|(_, t)| t.due_ms <= target)
                    .min_by_key(|(_, t)| t.due_ms)
                    .map(|(i, _)| i);
                match index {
                    None => None,
                    Some(i) => {
                        let due = state.timers[i].due_ms;
                        state.now_ms = due;
                        match state.timers[i].period_ms {
                            Some(period) => {
                                state.timers[i].due_ms = due + period as u64;
                                match &state.timers[i].callback {
                                    TimerCallback::Repeat(cb) => Some(Fired::Repeat(cb.clone())),
                                    TimerCallback::Once(_) => None,
                                }
                            }
                            None => {
                                let mut entry = state.timers.remove(i);
                                match &mut entry.callback {
                                    TimerCallback::Once(cb) => cb.take().map(Fired::Once),
                                    TimerCallback::Repeat(_) => None,
                                }
                            }
                        }
                    }
                }
            };

            match next {
                Some(Fired::Once(cb)) => cb(),
                Some(Fired::Repeat(cb)) => (cb.borrow_mut())(),
                None => break,
            }
        }
        self.state.borrow_mut().now_ms = target;
    }
}

enum Fired {
    Once(Box<dyn FnOnce()>),
    Repeat(Rc<RefCell<Box<dyn FnMut()>>>),
}
