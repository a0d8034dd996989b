use crate::error::{Result, SheetError};
use crate::events::{InboundEvent, OutboundEvent};
use std::sync::{Arc, Mutex};
use tokio::sync::mpsc::{self, UnboundedReceiver, UnboundedSender};

/// A realtime connection for one client.
///
/// Inbound events for the connection arrive on the receiver returned by
/// [`RealtimeTransport::subscribe`]. After [`RealtimeTransport::detach`] no
/// further events are delivered to earlier subscribers.
#[allow(async_fn_in_trait)]
pub trait RealtimeTransport {
    async fn emit(&self, event: OutboundEvent) -> Result<()>;

    fn subscribe(&self) -> UnboundedReceiver<InboundEvent>;

    fn detach(&self);
}

#[derive(Default)]
struct CaptureState {
    emitted: Vec<OutboundEvent>,
    subscriber: Option<UnboundedSender<InboundEvent>>,
    offline: bool,
}

/// Transport that records what is emitted and lets the caller inject inbound
/// events. Used when embedding a session without a server, and in tests.
#[derive(Clone, Default)]
pub struct CapturingTransport {
    state: Arc<Mutex<CaptureState>>,
}

impl CapturingTransport {
    pub fn new() -> Self {
        Self::default()
    }

    /// Everything emitted so far.
    pub fn emitted(&self) -> Vec<OutboundEvent> {
        self.state.lock().map(|s| s.emitted.clone()).unwrap_or_default()
    }

    /// Remove and return everything emitted so far.
    pub fn take_emitted(&self) -> Vec<OutboundEvent> {
        self.state
            .lock()
            .map(|mut s| std::mem::take(&mut s.emitted))
            .unwrap_or_default()
    }

    /// Deliver `event` to the current subscriber. Returns `false` when nobody
    /// is subscribed.
    pub fn push(&self, event: InboundEvent) -> bool {
        let Ok(state) = self.state.lock() else {
            return false;
        };
        state
            .subscriber
            .as_ref()
            .is_some_and(|tx| tx.send(event).is_ok())
    }

    /// Make `emit` fail, as a dropped socket would.
    pub fn set_offline(&self, offline: bool) {
        if let Ok(mut state) = self.state.lock() {
            state.offline = offline;
        }
    }

    pub fn is_attached(&self) -> bool {
        self.state
            .lock()
            .map(|s| s.subscriber.is_some())
            .unwrap_or(false)
    }
}

impl RealtimeTransport for CapturingTransport {
    async fn emit(&self, event: OutboundEvent) -> Result<()> {
        let mut state = self
            .state
            .lock()
            .map_err(|_| SheetError::Transport("transport state poisoned".to_string()))?;
        if state.offline {
            return Err(SheetError::Transport("not connected".to_string()));
        }
        state.emitted.push(event);
        Ok(())
    }

    fn subscribe(&self) -> UnboundedReceiver<InboundEvent> {
        let (tx, rx) = mpsc::unbounded_channel();
        if let Ok(mut state) = self.state.lock() {
            state.subscriber = Some(tx);
        }
        rx
    }

    fn detach(&self) {
        if let Ok(mut state) = self.state.lock() {
            state.subscriber = None;
        }
    }
}
