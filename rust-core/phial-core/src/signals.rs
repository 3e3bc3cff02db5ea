//! # Signals
//!
//! Lifecycle notifications. Receivers observe; they cannot change the flow
//! and their return value is ignored.

use crate::app::App;
use crate::error::Error;
use crate::response::Response;
use parking_lot::RwLock;
use serde_json::Value;
use std::sync::Arc;
use tracing::trace;

/// Callback connected to a signal
pub type Receiver<A> = Arc<dyn Fn(&App, &A) + Send + Sync>;

/// A named broadcast point
pub struct Signal<A> {
    name: &'static str,
    receivers: RwLock<Vec<Receiver<A>>>,
}

impl<A> std::fmt::Debug for Signal<A> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Signal")
            .field("name", &self.name)
            .field("receivers", &self.receivers.read().len())
            .finish()
    }
}

impl<A> Signal<A> {
    /// Create a signal without receivers
    #[must_use]
    pub fn new(name: &'static str) -> Self {
        Self {
            name,
            receivers: RwLock::new(Vec::new()),
        }
    }

    /// Signal name
    #[must_use]
    pub const fn name(&self) -> &'static str {
        self.name
    }

    /// Connect a receiver
    pub fn connect<F>(&self, receiver: F)
    where
        F: Fn(&App, &A) + Send + Sync + 'static,
    {
        self.receivers.write().push(Arc::new(receiver));
    }

    /// Remove every receiver
    pub fn disconnect_all(&self) {
        self.receivers.write().clear();
    }

    /// Number of connected receivers
    #[must_use]
    pub fn receiver_count(&self) -> usize {
        self.receivers.read().len()
    }

    /// Deliver `args` to every receiver in connection order
    pub fn send(&self, app: &App, args: &A) {
        let receivers = self.receivers.read().clone();
        if receivers.is_empty() {
            return;
        }
        trace!(signal = self.name, receivers = receivers.len(), "Sending signal");
        for receiver in receivers {
            receiver(app, args);
        }
    }
}

/// Payload of the template signals
#[derive(Debug, Clone)]
pub struct TemplateEvent {
    /// Template name; `None` for templates rendered from a string
    pub name: Option<String>,
    /// Context the template was rendered with
    pub context: Value,
}

/// Payload of `message_flashed`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FlashEvent {
    /// Flashed message
    pub message: String,
    /// Message category
    pub category: String,
}

/// Every signal an application sends
#[derive(Debug)]
pub struct Signals {
    /// An application context was pushed
    pub appcontext_pushed: Signal<()>,
    /// An application context was popped
    pub appcontext_popped: Signal<()>,
    /// The last reference to an application context is going away
    pub appcontext_tearing_down: Signal<Option<Error>>,
    /// Dispatch of a request is starting
    pub request_started: Signal<()>,
    /// A response was produced
    pub request_finished: Signal<Response>,
    /// A request context is being torn down
    pub request_tearing_down: Signal<Option<Error>>,
    /// An unhandled error reached the exception handler
    pub got_request_exception: Signal<Error>,
    /// A template is about to render
    pub before_render_template: Signal<TemplateEvent>,
    /// A template finished rendering
    pub template_rendered: Signal<TemplateEvent>,
    /// A message was flashed
    pub message_flashed: Signal<FlashEvent>,
}

impl Default for Signals {
    fn default() -> Self {
        Self {
            appcontext_pushed: Signal::new("appcontext-pushed"),
            appcontext_popped: Signal::new("appcontext-popped"),
            appcontext_tearing_down: Signal::new("appcontext-tearing-down"),
            request_started: Signal::new("request-started"),
            request_finished: Signal::new("request-finished"),
            request_tearing_down: Signal::new("request-tearing-down"),
            got_request_exception: Signal::new("got-request-exception"),
            before_render_template: Signal::new("before-render-template"),
            template_rendered: Signal::new("template-rendered"),
            message_flashed: Signal::new("message-flashed"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;

    #[test]
    fn test_send_in_connection_order() {
        let app = App::new("signals");
        let seen = Arc::new(Mutex::new(Vec::new()));
        let signal: Signal<u32> = Signal::new("numbers");
        for tag in ["a", "b"] {
            let seen = Arc::clone(&seen);
            signal.connect(move |_, n| seen.lock().push(format!("{tag}{n}")));
        }
        signal.send(&app, &7);
        assert_eq!(*seen.lock(), vec!["a7", "b7"]);
        assert_eq!(signal.receiver_count(), 2);

        signal.disconnect_all();
        signal.send(&app, &8);
        assert_eq!(seen.lock().len(), 2);
    }

    #[test]
    fn test_receiver_may_connect_while_sending() {
        let app = App::new("signals");
        let signal: Arc<Signal<()>> = Arc::new(Signal::new("reentrant"));
        let inner = Arc::clone(&signal);
        signal.connect(move |_, ()| inner.connect(|_, ()| {}));
        signal.send(&app, &());
        assert_eq!(signal.receiver_count(), 2);
    }
}
