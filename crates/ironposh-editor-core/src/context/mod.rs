//! The execution coordinator: a single front door for running commands
//! against the current runspace, tracking the runspace stack and the
//! debugger/nested-prompt state machines.

mod debugger;
mod execute;
mod runspaces;
mod sink;

use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, Weak};

use serde::Deserialize;
use tracing::{debug, info, warn};
use typed_builder::TypedBuilder;

use crate::EditorServicesError;
use crate::engine::{DebuggerStopEventArgs, PipelineKind, Runspace};
use crate::events::ContextEvents;
use crate::execution::{ExecutionOptions, ExecutionStatus, ExecutionStatusChangedEventArgs};
use crate::host::{HostInput, HostOutput, NullHost, OutputType, PromptContext};
use crate::invocation_event_queue::InvocationEventQueue;
use crate::prompt_nest::PromptNest;
use crate::session::{
    RunspaceDetails, SessionDetails, SessionState, SessionStateChangedEventArgs, SessionStateLock,
};
use crate::version_ops::{self, VersionSpecificOperations};

use runspaces::RunspaceStack;
use sink::ContextEventSink;

/// Profile scripts loaded into a new session, in precedence order.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProfilePaths {
    pub all_users_all_hosts: Option<PathBuf>,
    pub all_users_current_host: Option<PathBuf>,
    pub current_user_all_hosts: Option<PathBuf>,
    pub current_user_current_host: Option<PathBuf>,
}

impl ProfilePaths {
    pub fn existing(&self) -> impl Iterator<Item = &Path> {
        [
            &self.all_users_all_hosts,
            &self.all_users_current_host,
            &self.current_user_all_hosts,
            &self.current_user_current_host,
        ]
        .into_iter()
        .filter_map(Option::as_deref)
        .filter(|path| path.exists())
    }
}

fn null_output() -> Arc<dyn HostOutput> {
    Arc::new(NullHost)
}

fn null_prompt_context() -> Arc<dyn PromptContext> {
    Arc::new(NullHost)
}

#[derive(TypedBuilder)]
pub struct PowerShellContextConfig {
    initial_runspace: Arc<dyn Runspace>,

    /// Close the initial runspace on dispose
    #[builder(default = false)]
    owns_initial_runspace: bool,

    #[builder(default = null_output())]
    host_output: Arc<dyn HostOutput>,

    #[builder(default, setter(strip_option))]
    host_input: Option<Arc<dyn HostInput>>,

    #[builder(default = null_prompt_context())]
    prompt_context: Arc<dyn PromptContext>,

    #[builder(default)]
    profile_paths: ProfilePaths,
}

pub(crate) struct ContextInner {
    initial_runspace: RunspaceDetails,
    owns_initial_runspace: bool,
    runspaces: Mutex<RunspaceStack>,
    prompt_nest: PromptNest,
    invocation_event_queue: InvocationEventQueue,
    version_ops: Box<dyn VersionSpecificOperations>,
    host_output: Arc<dyn HostOutput>,
    host_input: Mutex<Option<Arc<dyn HostInput>>>,
    prompt_context: Arc<dyn PromptContext>,
    profile_paths: ProfilePaths,
    session_state: Mutex<SessionState>,
    session_state_lock: SessionStateLock,
    resume_request: tokio::sync::Mutex<()>,
    current_debugger_stop: Mutex<Option<DebuggerStopEventArgs>>,
    most_recent_session_details: Mutex<SessionDetails>,
    events: ContextEvents,
    sink: Arc<ContextEventSink>,
}

/// Cheap to clone; every clone drives the same session.
#[derive(Clone)]
pub struct PowerShellContext {
    inner: Arc<ContextInner>,
}

#[derive(Clone)]
pub struct WeakPowerShellContext {
    inner: Weak<ContextInner>,
}

impl WeakPowerShellContext {
    pub fn upgrade(&self) -> Option<PowerShellContext> {
        self.inner.upgrade().map(|inner| PowerShellContext { inner })
    }
}

impl PowerShellContext {
    /// Probes the initial runspace, attaches the engine callbacks and leaves
    /// the session `Ready`.
    pub fn new(config: PowerShellContextConfig) -> Result<Self, EditorServicesError> {
        let PowerShellContextConfig {
            initial_runspace,
            owns_initial_runspace,
            host_output,
            host_input,
            prompt_context,
            profile_paths,
        } = config;

        let session_details = execute::probe_session_details(
            &initial_runspace.create_pipeline(PipelineKind::TopLevel),
        )?
        .unwrap_or_else(|| {
            warn!(target: "session", "initial runspace did not report session details");
            SessionDetails::default()
        });

        let initial = RunspaceDetails::from_runspace(initial_runspace, session_details.clone());
        let version_ops = version_ops::for_version(&initial.powershell_version);
        let prompt_nest = PromptNest::new(&initial.runspace);

        info!(
            target: "session",
            version = %initial.powershell_version,
            edition = %initial.powershell_version.edition,
            location = ?initial.location,
            "initializing execution coordinator"
        );

        let inner = Arc::new_cyclic(|weak| ContextInner {
            runspaces: Mutex::new(RunspaceStack::new(initial.clone())),
            initial_runspace: initial,
            owns_initial_runspace,
            prompt_nest,
            invocation_event_queue: InvocationEventQueue::new(),
            version_ops,
            host_output,
            host_input: Mutex::new(host_input),
            prompt_context,
            profile_paths,
            session_state: Mutex::new(SessionState::NotStarted),
            session_state_lock: SessionStateLock::new(),
            resume_request: tokio::sync::Mutex::new(()),
            current_debugger_stop: Mutex::new(None),
            most_recent_session_details: Mutex::new(session_details),
            events: ContextEvents::default(),
            sink: Arc::new(ContextEventSink::new(weak.clone())),
        });

        let context = Self { inner };
        context.configure_runspace(&context.inner.initial_runspace);
        context.set_session_state(SessionState::Ready);
        Ok(context)
    }

    pub fn downgrade(&self) -> WeakPowerShellContext {
        WeakPowerShellContext {
            inner: Arc::downgrade(&self.inner),
        }
    }

    pub fn events(&self) -> &ContextEvents {
        &self.inner.events
    }

    pub fn prompt_nest(&self) -> &PromptNest {
        &self.inner.prompt_nest
    }

    pub fn prompt_context(&self) -> &Arc<dyn PromptContext> {
        &self.inner.prompt_context
    }

    pub fn host_output(&self) -> &Arc<dyn HostOutput> {
        &self.inner.host_output
    }

    pub fn host_input(&self) -> Option<Arc<dyn HostInput>> {
        self.inner
            .host_input
            .lock()
            .expect("host input mutex poisoned")
            .clone()
    }

    /// Attaches the console loop once it exists; it usually needs the context
    /// to be built first.
    pub fn set_host_input(&self, host_input: Arc<dyn HostInput>) {
        *self.inner.host_input.lock().expect("host input mutex poisoned") = Some(host_input);
    }

    pub fn session_state(&self) -> SessionState {
        *self
            .inner
            .session_state
            .lock()
            .expect("session state mutex poisoned")
    }

    pub fn most_recent_session_details(&self) -> SessionDetails {
        self.inner
            .most_recent_session_details
            .lock()
            .expect("session details mutex poisoned")
            .clone()
    }

    pub fn current_debugger_stop_event_args(&self) -> Option<DebuggerStopEventArgs> {
        self.inner
            .current_debugger_stop
            .lock()
            .expect("debugger stop mutex poisoned")
            .clone()
    }

    pub fn write_output(&self, text: &str, include_newline: bool, output_type: OutputType) {
        self.inner
            .host_output
            .write_output(text, include_newline, output_type);
    }

    fn set_session_state(&self, state: SessionState) {
        *self
            .inner
            .session_state
            .lock()
            .expect("session state mutex poisoned") = state;
    }

    pub(crate) fn on_session_state_changed(&self, args: SessionStateChangedEventArgs) {
        let mut state = self
            .inner
            .session_state
            .lock()
            .expect("session state mutex poisoned");

        if *state == SessionState::Disposed {
            warn!(
                target: "session",
                new_state = ?args.new_session_state,
                "received session state change when already disposed"
            );
            return;
        }

        debug!(
            target: "session",
            from = ?*state,
            to = ?args.new_session_state,
            result = ?args.execution_result,
            "session state changed"
        );
        *state = args.new_session_state;
        self.inner.events.session_state_changed.emit(args);
    }

    pub(crate) fn on_execution_status_changed(
        &self,
        status: ExecutionStatus,
        options: Option<&ExecutionOptions>,
        had_errors: bool,
    ) {
        match options {
            _ if status == ExecutionStatus::Aborted => self.inner.prompt_context.abort_read_line(),
            Some(options) if options.write_output_to_host || options.interrupt_command_prompt => {
                if let Some(input) = self.host_input() {
                    if status == ExecutionStatus::Running {
                        input.stop_command_loop();
                    } else {
                        input.start_command_loop();
                    }
                }
            }
            _ => {}
        }

        self.inner
            .events
            .execution_status_changed
            .emit(ExecutionStatusChangedEventArgs {
                execution_status: status,
                execution_options: options.cloned(),
                had_errors,
            });
    }

    /// Tears the session down: prompt nest first, then every stacked
    /// runspace from the innermost out.
    pub fn dispose(&self) {
        if self.session_state() == SessionState::Disposed {
            return;
        }

        self.inner.prompt_nest.dispose();
        self.set_session_state(SessionState::Disposed);
        self.shutdown_runspaces();
        info!(target: "session", "execution coordinator disposed");
    }
}

#[cfg(test)]
mod test;
