use std::sync::Arc;

use tracing::{debug, error, info, instrument, warn};

use super::PowerShellContext;
use crate::EditorServicesError;
use crate::engine::{InvocationSettings, PipelineKind, PsCommand, Runspace, RunspaceEventSink, RunspaceState};
use crate::session::{
    RunspaceChangeAction, RunspaceChangedEventArgs, RunspaceContext, RunspaceDetails,
    RunspaceLocation, SessionDetails, SessionState,
};

/// The runspace commands currently run in, and the ones it was entered from.
#[derive(Debug)]
pub(crate) struct RunspaceStack {
    current: RunspaceDetails,
    stack: Vec<RunspaceDetails>,
}

impl RunspaceStack {
    pub(crate) fn new(initial: RunspaceDetails) -> Self {
        Self {
            current: initial,
            stack: Vec::new(),
        }
    }
}

fn identity_changed<T: PartialEq>(previous: Option<&T>, observed: Option<&T>) -> bool {
    matches!((previous, observed), (Some(previous), Some(observed)) if previous != observed)
}

impl PowerShellContext {
    fn runspaces(&self) -> std::sync::MutexGuard<'_, RunspaceStack> {
        self.inner
            .runspaces
            .lock()
            .expect("runspace stack mutex poisoned")
    }

    pub fn current_runspace(&self) -> RunspaceDetails {
        self.runspaces().current.clone()
    }

    pub fn initial_runspace(&self) -> &RunspaceDetails {
        &self.inner.initial_runspace
    }

    pub fn runspace_stack_depth(&self) -> usize {
        self.runspaces().stack.len()
    }

    pub fn is_current_runspace_out_of_process(&self) -> bool {
        self.runspaces().current.is_out_of_process()
    }

    pub(crate) fn configure_runspace(&self, details: &RunspaceDetails) {
        let sink: Arc<dyn RunspaceEventSink> = self.inner.sink.clone();
        details.runspace.attach_event_sink(sink);
        self.inner
            .version_ops
            .configure_debugger(details.runspace.as_ref());
    }

    pub(crate) fn cleanup_runspace(&self, details: &RunspaceDetails) {
        details.runspace.detach_event_sink();
    }

    #[instrument(skip_all, fields(location = ?new_runspace.location, context = ?new_runspace.context))]
    pub fn push_runspace(&self, new_runspace: RunspaceDetails) {
        let previous = {
            let mut runspaces = self.runspaces();
            let previous = std::mem::replace(&mut runspaces.current, new_runspace.clone());
            runspaces.stack.push(previous.clone());
            previous
        };

        info!(
            target: "runspace",
            connection = ?new_runspace.connection_string,
            process_id = ?new_runspace.session_details.process_id,
            "pushing runspace"
        );

        if previous.needs_event_handlers() {
            self.cleanup_runspace(&previous);
        }
        if new_runspace.needs_event_handlers() {
            self.configure_runspace(&new_runspace);
        }

        self.inner
            .events
            .runspace_changed
            .emit(RunspaceChangedEventArgs {
                change_action: RunspaceChangeAction::Enter,
                previous_runspace: previous,
                new_runspace: Some(new_runspace),
            });
    }

    /// Returns to the runspace the current one was entered from. A no-op once
    /// the session is disposed.
    pub fn pop_runspace(&self) -> Result<(), EditorServicesError> {
        if self.session_state() == SessionState::Disposed {
            debug!(target: "runspace", "ignoring runspace pop after dispose");
            return Ok(());
        }

        let (previous, restored) = {
            let mut runspaces = self.runspaces();
            let Some(restored) = runspaces.stack.pop() else {
                error!(target: "runspace", "attempted to pop the initial runspace");
                return Err(EditorServicesError::InvalidState("no runspace to pop"));
            };
            let previous = std::mem::replace(&mut runspaces.current, restored.clone());
            (previous, restored)
        };

        info!(
            target: "runspace",
            location = ?restored.location,
            context = ?restored.context,
            "popped runspace"
        );

        if previous.needs_event_handlers() {
            self.cleanup_runspace(&previous);
        }
        if restored.needs_event_handlers() {
            self.configure_runspace(&restored);
        }

        self.inner
            .events
            .runspace_changed
            .emit(RunspaceChangedEventArgs {
                change_action: RunspaceChangeAction::Exit,
                previous_runspace: previous,
                new_runspace: Some(restored),
            });
        Ok(())
    }

    /// Infers a runspace switch made by a script from freshly probed session
    /// details and mirrors it on the runspace stack.
    pub(crate) fn update_runspace_details_if_session_changed(
        &self,
        observed: SessionDetails,
        is_debugger_stop: bool,
    ) {
        *self
            .inner
            .most_recent_session_details
            .lock()
            .expect("session details mutex poisoned") = observed.clone();

        let current = self.current_runspace();
        let left_context = match current.context {
            RunspaceContext::DebuggedRunspace => identity_changed(
                current.session_details.instance_id.as_ref(),
                observed.instance_id.as_ref(),
            ),
            RunspaceContext::EnteredProcess => identity_changed(
                current.session_details.process_id.as_ref(),
                observed.process_id.as_ref(),
            ),
            RunspaceContext::Original => false,
        };

        if left_context {
            if let Err(error) = self.pop_runspace() {
                warn!(target: "runspace", %error, "could not leave the entered runspace");
            }
        }

        let current = self.current_runspace();
        let instance_changed = identity_changed(
            current.session_details.instance_id.as_ref(),
            observed.instance_id.as_ref(),
        );

        // A new host instance only means a different runspace while the
        // debugger is stopped; entering a host process also swaps it.
        let new_runspace = if is_debugger_stop && instance_changed {
            let location = if identity_changed(
                current.session_details.computer_name.as_ref(),
                observed.computer_name.as_ref(),
            ) {
                RunspaceLocation::Remote
            } else {
                current.location
            };
            Some(RunspaceDetails::from_debugger(
                &current,
                location,
                RunspaceContext::DebuggedRunspace,
                observed,
            ))
        } else if identity_changed(
            current.session_details.process_id.as_ref(),
            observed.process_id.as_ref(),
        ) {
            Some(RunspaceDetails::from_context(
                &current,
                RunspaceContext::EnteredProcess,
                observed,
            ))
        } else {
            None
        };

        if let Some(new_runspace) = new_runspace {
            self.push_runspace(new_runspace);
        }
    }

    pub(crate) fn handle_runspace_state_changed(&self, state: RunspaceState) {
        match state {
            RunspaceState::Closing | RunspaceState::Closed | RunspaceState::Broken => {
                info!(target: "runspace", ?state, "runspace became unusable");
                if self.runspace_stack_depth() > 0 {
                    if let Err(error) = self.pop_runspace() {
                        warn!(target: "runspace", %error, "could not pop the unusable runspace");
                    }
                }
            }
            RunspaceState::Opening | RunspaceState::Opened => {}
            other => warn!(target: "runspace", state = ?other, "unhandled runspace state change"),
        }
    }

    /// An interactive session was entered by the engine itself.
    pub(crate) fn push_interactive_runspace(&self, runspace: Arc<dyn Runspace>) {
        let details = match super::execute::probe_session_details(
            &runspace.create_pipeline(PipelineKind::TopLevel),
        ) {
            Ok(Some(details)) => details,
            Ok(None) => SessionDetails::default(),
            Err(error) => {
                warn!(target: "runspace", %error, "could not probe the entered session");
                SessionDetails::default()
            }
        };

        self.push_runspace(RunspaceDetails::from_runspace(runspace, details));
    }

    /// Leaves every entered runspace, innermost first.
    pub(crate) fn shutdown_runspaces(&self) {
        let (current, entered_from) = {
            let mut runspaces = self.runspaces();
            let entered_from: Vec<_> = runspaces.stack.drain(..).rev().collect();
            let current =
                std::mem::replace(&mut runspaces.current, self.inner.initial_runspace.clone());
            (current, entered_from)
        };

        self.cleanup_runspace(&current);

        for details in std::iter::once(current).chain(entered_from) {
            self.close_runspace(&details);
            self.inner
                .events
                .runspace_changed
                .emit(RunspaceChangedEventArgs {
                    change_action: RunspaceChangeAction::Shutdown,
                    previous_runspace: details,
                    new_runspace: None,
                });
        }
    }

    fn close_runspace(&self, details: &RunspaceDetails) {
        let exit_command = match (details.location, details.context) {
            (_, RunspaceContext::DebuggedRunspace) => return,
            (_, RunspaceContext::EnteredProcess) => "Exit-PSHostProcess",
            (RunspaceLocation::Remote, RunspaceContext::Original) => "Exit-PSSession",
            (RunspaceLocation::Local, RunspaceContext::Original) => {
                let is_initial =
                    Arc::ptr_eq(&details.runspace, &self.inner.initial_runspace.runspace);
                if !is_initial || self.inner.owns_initial_runspace {
                    debug!(target: "runspace", "closing local runspace");
                    details.runspace.close();
                }
                return;
            }
        };

        debug!(target: "runspace", exit_command, "leaving entered session");
        let pipeline = self
            .inner
            .initial_runspace
            .runspace
            .create_pipeline(PipelineKind::TopLevel);
        for command in PsCommand::from_command(exit_command).commands() {
            pipeline.add_command(command.clone());
        }
        if let Err(error) = pipeline.invoke(&InvocationSettings::default()) {
            warn!(target: "runspace", %error, exit_command, "failed to leave session on shutdown");
        }
    }
}
