use std::sync::{Arc, Weak};

use tracing::{trace, warn};

use super::{ContextInner, PowerShellContext};
use crate::engine::{
    BreakpointUpdatedEventArgs, DebuggerResumeAction, DebuggerStopEventArgs, Runspace,
    RunspaceEventSink, RunspaceState,
};

/// Engine callbacks routed back into the coordinator. Holds the context
/// weakly so an attached runspace does not keep it alive.
pub(crate) struct ContextEventSink {
    context: Weak<ContextInner>,
}

impl ContextEventSink {
    pub(crate) fn new(context: Weak<ContextInner>) -> Self {
        Self { context }
    }

    fn context(&self) -> Option<PowerShellContext> {
        let context = self
            .context
            .upgrade()
            .map(|inner| PowerShellContext { inner });
        if context.is_none() {
            trace!(target: "engine", "engine event raised after the coordinator was dropped");
        }
        context
    }
}

impl RunspaceEventSink for ContextEventSink {
    fn on_state_changed(&self, state: RunspaceState) {
        if let Some(context) = self.context() {
            context.handle_runspace_state_changed(state);
        }
    }

    fn on_debugger_stop(&self, args: DebuggerStopEventArgs) -> DebuggerResumeAction {
        self.context()
            .map_or(DebuggerResumeAction::Continue, |context| {
                context.on_debugger_stop(args)
            })
    }

    fn on_breakpoint_updated(&self, args: BreakpointUpdatedEventArgs) {
        if let Some(context) = self.context() {
            context.inner.events.breakpoint_updated.emit(args);
        }
    }

    fn on_enter_nested_prompt(&self) {
        if let Some(context) = self.context() {
            context.enter_nested_prompt();
        }
    }

    fn on_exit_nested_prompt(&self) {
        if let Some(context) = self.context() {
            context.exit_nested_prompt();
        }
    }

    fn on_idle(&self) {
        if let Some(context) = self.context() {
            context.on_idle();
        }
    }

    fn on_push_runspace(&self, runspace: Arc<dyn Runspace>) {
        if let Some(context) = self.context() {
            context.push_interactive_runspace(runspace);
        }
    }

    fn on_pop_runspace(&self) {
        if let Some(context) = self.context() {
            if let Err(error) = context.pop_runspace() {
                warn!(target: "runspace", %error, "engine left a session that was never entered");
            }
        }
    }
}
