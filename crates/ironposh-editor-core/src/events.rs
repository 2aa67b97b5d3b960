use std::sync::Mutex;

use futures::channel::mpsc;

use crate::engine::{BreakpointUpdatedEventArgs, DebuggerResumeAction, DebuggerStopEventArgs};
use crate::execution::ExecutionStatusChangedEventArgs;
use crate::session::{RunspaceChangedEventArgs, SessionStateChangedEventArgs};

/// Fan-out of one event kind to any number of subscribers.
///
/// Each subscriber gets its own unbounded channel so delivery never blocks the
/// emitting thread and events of one kind arrive in emission order.
pub struct EventRegistry<T> {
    subscribers: Mutex<Vec<mpsc::UnboundedSender<T>>>,
}

impl<T> Default for EventRegistry<T> {
    fn default() -> Self {
        Self {
            subscribers: Mutex::new(Vec::new()),
        }
    }
}

impl<T: Clone> EventRegistry<T> {
    pub fn subscribe(&self) -> mpsc::UnboundedReceiver<T> {
        let (tx, rx) = mpsc::unbounded();
        self.subscribers
            .lock()
            .expect("event registry mutex poisoned")
            .push(tx);
        rx
    }

    pub(crate) fn emit(&self, event: T) {
        let mut subscribers = self.subscribers.lock().expect("event registry mutex poisoned");
        subscribers.retain(|tx| tx.unbounded_send(event.clone()).is_ok());
    }

    pub fn subscriber_count(&self) -> usize {
        self.subscribers
            .lock()
            .expect("event registry mutex poisoned")
            .len()
    }
}

#[derive(Default)]
pub struct ContextEvents {
    pub session_state_changed: EventRegistry<SessionStateChangedEventArgs>,
    pub execution_status_changed: EventRegistry<ExecutionStatusChangedEventArgs>,
    pub runspace_changed: EventRegistry<RunspaceChangedEventArgs>,
    pub debugger_stop: EventRegistry<DebuggerStopEventArgs>,
    pub debugger_resumed: EventRegistry<DebuggerResumeAction>,
    pub breakpoint_updated: EventRegistry<BreakpointUpdatedEventArgs>,
}
