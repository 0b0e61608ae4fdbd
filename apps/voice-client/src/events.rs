use std::sync::{Arc, Mutex, PoisonError};

use shared_proto::events::SessionEvent;
use tokio::sync::mpsc;

/// Observer of a voice session. Called on the session task; keep it short.
pub trait SessionListener: Send + Sync {
    fn on_event(&self, event: &SessionEvent);
}

impl SessionListener for mpsc::UnboundedSender<SessionEvent> {
    fn on_event(&self, event: &SessionEvent) {
        let _ = self.send(event.clone());
    }
}

#[derive(Default)]
pub(crate) struct EventBus {
    listeners: Mutex<Vec<Arc<dyn SessionListener>>>,
}

impl EventBus {
    pub fn subscribe(&self, listener: Arc<dyn SessionListener>) {
        self.listeners
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(listener);
    }

    pub fn emit(&self, event: SessionEvent) {
        if !matches!(event, SessionEvent::Level { .. }) {
            tracing::debug!(component = "controller", event = ?event, "session event");
        }

        // Snapshot so a listener may subscribe others without deadlocking
        let listeners = self
            .listeners
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone();
        for listener in listeners {
            listener.on_event(&event);
        }
    }
}
