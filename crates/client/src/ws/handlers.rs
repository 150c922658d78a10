//! Subscriber callbacks attached to a stream endpoint.
//!
//! Several subscribers may share one connection. Each `connect()` call
//! attaches one [`Handlers`] bundle and gets back a [`Subscription`] that
//! detaches exactly that bundle.

use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::{Arc, Weak};

use mission_control_shared::{ProtocolError, StreamError, StreamMessage};
use parking_lot::Mutex;
use serde_json::Value;

use super::connection::ConnectionState;

pub type MessageHandler = Arc<dyn Fn(&StreamMessage) + Send + Sync>;
pub type StatusHandler = Arc<dyn Fn(&ConnectionState) + Send + Sync>;
pub type ErrorHandler = Arc<dyn Fn(&StreamError) + Send + Sync>;

/// Turns an unwrapped inbound payload into a message.
pub type FrameParser = Arc<dyn Fn(Value) -> Result<StreamMessage, ProtocolError> + Send + Sync>;

/// Parser used when a subscriber does not bring its own.
pub fn default_parser() -> FrameParser {
    Arc::new(StreamMessage::decode)
}

/// Forward every payload untouched as [`StreamMessage::Raw`].
pub fn passthrough_parser() -> FrameParser {
    Arc::new(|value| Ok(StreamMessage::Raw(value)))
}

/// Callbacks registered by one subscriber. All of them are optional.
#[derive(Clone, Default)]
pub struct Handlers {
    pub(crate) message: Option<MessageHandler>,
    pub(crate) status: Option<StatusHandler>,
    pub(crate) error: Option<ErrorHandler>,
}

impl Handlers {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn on_message(mut self, handler: impl Fn(&StreamMessage) + Send + Sync + 'static) -> Self {
        self.message = Some(Arc::new(handler));
        self
    }

    pub fn on_status(mut self, handler: impl Fn(&ConnectionState) + Send + Sync + 'static) -> Self {
        self.status = Some(Arc::new(handler));
        self
    }

    pub fn on_error(mut self, handler: impl Fn(&StreamError) + Send + Sync + 'static) -> Self {
        self.error = Some(Arc::new(handler));
        self
    }
}

impl std::fmt::Debug for Handlers {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Handlers")
            .field("message", &self.message.is_some())
            .field("status", &self.status.is_some())
            .field("error", &self.error.is_some())
            .finish()
    }
}

#[derive(Default)]
struct HandlerSet {
    next_id: u64,
    subscribers: Vec<u64>,
    message: Vec<(u64, MessageHandler)>,
    status: Vec<(u64, StatusHandler)>,
    error: Vec<(u64, ErrorHandler)>,
}

impl HandlerSet {
    fn attach(&mut self, handlers: Handlers) -> u64 {
        self.next_id += 1;
        let id = self.next_id;
        self.subscribers.push(id);
        if let Some(h) = handlers.message {
            self.message.push((id, h));
        }
        if let Some(h) = handlers.status {
            self.status.push((id, h));
        }
        if let Some(h) = handlers.error {
            self.error.push((id, h));
        }
        id
    }

    fn detach(&mut self, id: u64) -> bool {
        let Some(pos) = self.subscribers.iter().position(|i| *i == id) else {
            return false;
        };
        self.subscribers.swap_remove(pos);
        self.message.retain(|(i, _)| *i != id);
        self.status.retain(|(i, _)| *i != id);
        self.error.retain(|(i, _)| *i != id);
        true
    }
}

/// Handler set of one endpoint, carried over when its connection is replaced.
#[derive(Clone, Default)]
pub(crate) struct SharedHandlers(Arc<Mutex<HandlerSet>>);

impl SharedHandlers {
    pub(crate) fn attach(&self, endpoint: &str, handlers: Handlers) -> Subscription {
        let id = self.0.lock().attach(handlers);
        Subscription {
            endpoint: endpoint.to_string(),
            id,
            handlers: Arc::downgrade(&self.0),
        }
    }

    pub(crate) fn subscriber_count(&self) -> usize {
        self.0.lock().subscribers.len()
    }

    pub(crate) fn dispatch_message(&self, endpoint: &str, message: &StreamMessage) {
        // Snapshot first so handlers may subscribe or cancel while running.
        let handlers: Vec<MessageHandler> =
            self.0.lock().message.iter().map(|(_, h)| h.clone()).collect();
        invoke(endpoint, "message", &handlers, message);
    }

    pub(crate) fn dispatch_status(&self, endpoint: &str, state: &ConnectionState) {
        let handlers: Vec<StatusHandler> =
            self.0.lock().status.iter().map(|(_, h)| h.clone()).collect();
        invoke(endpoint, "status", &handlers, state);
    }

    pub(crate) fn dispatch_error(&self, endpoint: &str, error: &StreamError) {
        let handlers: Vec<ErrorHandler> =
            self.0.lock().error.iter().map(|(_, h)| h.clone()).collect();
        if handlers.is_empty() {
            crate::log_warn!("Unhandled stream error on {}: {}", endpoint, error);
        }
        invoke(endpoint, "error", &handlers, error);
    }
}

/// Run every handler; a panicking one is logged and skipped.
pub(crate) fn invoke<T>(
    endpoint: &str,
    kind: &str,
    handlers: &[Arc<dyn Fn(&T) + Send + Sync>],
    value: &T,
) {
    for handler in handlers {
        if catch_unwind(AssertUnwindSafe(|| handler(value))).is_err() {
            crate::log_error!("A {} handler for {} panicked", kind, endpoint);
        }
    }
}

/// Registration returned by `connect()`.
///
/// Dropping it leaves the handlers attached; call [`Subscription::cancel`]
/// to remove them.
#[derive(Debug)]
pub struct Subscription {
    endpoint: String,
    id: u64,
    handlers: Weak<Mutex<HandlerSet>>,
}

impl Subscription {
    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }

    /// Detach this subscriber's handlers. The connection itself stays up.
    pub fn cancel(self) -> bool {
        match self.handlers.upgrade() {
            Some(set) => set.lock().detach(self.id),
            None => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn counting(counter: &Arc<AtomicUsize>) -> Handlers {
        let counter = counter.clone();
        Handlers::new().on_message(move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
        })
    }

    #[test]
    fn cancel_detaches_only_own_handlers() {
        let set = SharedHandlers::default();
        let first = Arc::new(AtomicUsize::new(0));
        let second = Arc::new(AtomicUsize::new(0));
        let sub_a = set.attach("/ws/telemetry", counting(&first));
        let _sub_b = set.attach("/ws/telemetry", counting(&second));
        assert_eq!(set.subscriber_count(), 2);

        let msg = StreamMessage::Raw(serde_json::json!({"n": 1}));
        set.dispatch_message("/ws/telemetry", &msg);
        assert!(sub_a.cancel());
        set.dispatch_message("/ws/telemetry", &msg);

        assert_eq!(first.load(Ordering::SeqCst), 1);
        assert_eq!(second.load(Ordering::SeqCst), 2);
        assert_eq!(set.subscriber_count(), 1);
    }

    #[test]
    fn panicking_handler_does_not_stop_the_rest() {
        let set = SharedHandlers::default();
        let seen = Arc::new(AtomicUsize::new(0));
        set.attach("/ws/commands", Handlers::new().on_message(|_| panic!("boom")));
        set.attach("/ws/commands", counting(&seen));

        set.dispatch_message("/ws/commands", &StreamMessage::Raw(Value::Null));
        assert_eq!(seen.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn cancel_after_set_dropped_is_noop() {
        let set = SharedHandlers::default();
        let sub = set.attach("/ws/x", Handlers::new());
        drop(set);
        assert!(!sub.cancel());
    }

    #[test]
    fn passthrough_keeps_raw_json() {
        let parser = passthrough_parser();
        let value = serde_json::json!({"anything": [1, 2]});
        assert_eq!(parser(value.clone()), Ok(StreamMessage::Raw(value)));
        assert!(default_parser()(serde_json::json!({"type": "mystery"})).is_err());
    }
}
