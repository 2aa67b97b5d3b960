//! Contract between the coordinator and the scripting engine.
//!
//! The engine is an external collaborator: it owns runspaces, pipelines and
//! the debugger, and calls back into the coordinator through
//! [`RunspaceEventSink`] on whichever thread raised the event.

mod command;
mod error;
mod value;

use std::fmt;
use std::sync::Arc;

use bitflags::bitflags;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

pub use command::{Command, Parameter, PsCommand};
pub use error::{EngineError, ErrorRecord, ExceptionInfo};
pub use value::{ConversionError, FromPsValue, PsObject, PsPrimitiveValue, PsValue};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PsInvocationState {
    NotStarted = 0,
    Running = 1,
    Stopping = 2,
    Stopped = 3,
    Completed = 4,
    Failed = 5,
    Disconnected = 6,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InvocationStateInfo {
    pub state: PsInvocationState,
    pub reason: Option<EngineError>,
}

pub type InvocationStateHandler = Arc<dyn Fn(&InvocationStateInfo) + Send + Sync>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunspaceAvailability {
    None,
    Available,
    AvailableForNestedCommand,
    Busy,
    RemoteDebug,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunspaceState {
    BeforeOpen,
    Opening,
    Opened,
    Closing,
    Closed,
    Broken,
    Disconnected,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PipelineKind {
    /// A fresh pipeline that needs the runspace to be idle
    TopLevel,
    /// A pipeline that runs inside whatever is currently executing
    Nested,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum DebuggerResumeAction {
    Continue,
    StepInto,
    StepOut,
    StepOver,
    Stop,
}

bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct DebugModes: u32 {
        const LOCAL_SCRIPT = 0b01;
        const REMOTE_SCRIPT = 0b10;
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PowerShellVersion {
    pub major: u32,
    pub minor: u32,
    pub edition: String,
}

impl PowerShellVersion {
    pub fn new(major: u32, minor: u32, edition: impl Into<String>) -> Self {
        Self {
            major,
            minor,
            edition: edition.into(),
        }
    }
}

impl fmt::Display for PowerShellVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.major, self.minor)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct InvocationSettings {
    pub add_to_history: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DebuggerCommandResults {
    pub resume_action: Option<DebuggerResumeAction>,
    pub evaluated_by_debugger: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DebuggerStopEventArgs {
    pub script_name: Option<String>,
    pub line: Option<u32>,
    pub column: Option<u32>,
    pub breakpoint_ids: Vec<i32>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BreakpointUpdateType {
    Set,
    Removed,
    Enabled,
    Disabled,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BreakpointUpdatedEventArgs {
    pub breakpoint_id: i32,
    pub update_type: BreakpointUpdateType,
    pub script: Option<String>,
    pub line: Option<u32>,
}

pub trait Runspace: Send + Sync {
    fn instance_id(&self) -> Uuid;

    fn availability(&self) -> RunspaceAvailability;

    fn state(&self) -> RunspaceState;

    /// True when the runspace lives in another process or on another machine.
    fn is_remote(&self) -> bool;

    fn computer_name(&self) -> Option<String>;

    fn version(&self) -> PowerShellVersion;

    fn debugger(&self) -> Option<Arc<dyn Debugger>>;

    fn create_pipeline(&self, kind: PipelineKind) -> Arc<dyn Pipeline>;

    fn attach_event_sink(&self, sink: Arc<dyn RunspaceEventSink>);

    fn detach_event_sink(&self);

    fn close(&self);
}

pub trait Pipeline: Send + Sync {
    fn is_nested(&self) -> bool;

    fn clear_commands(&self);

    fn add_command(&self, command: Command);

    fn set_runspace(&self, runspace: Arc<dyn Runspace>);

    fn set_state_handler(&self, handler: Option<InvocationStateHandler>);

    /// Runs synchronously on the calling thread.
    fn invoke(&self, settings: &InvocationSettings) -> Result<Vec<PsValue>, EngineError>;

    /// Cooperative, best-effort stop. May be called while `invoke` runs on another thread.
    fn stop(&self);

    fn invocation_state(&self) -> PsInvocationState;

    fn had_errors(&self) -> bool;

    /// Drains the error stream of the last invocation.
    fn take_errors(&self) -> Vec<ErrorRecord>;
}

pub trait Debugger: Send + Sync {
    fn process_command(
        &self,
        command: &PsCommand,
        output: &mut dyn FnMut(PsValue),
    ) -> Result<DebuggerCommandResults, EngineError>;

    fn stop_process_command(&self);

    fn in_breakpoint(&self) -> bool;

    fn set_debugger_step_mode(&self, enabled: bool);

    fn set_debug_mode(&self, mode: DebugModes);
}

/// Callbacks the engine raises into the coordinator.
///
/// Every method runs on the engine thread that raised the event and may block
/// it; `on_debugger_stop` and `on_enter_nested_prompt` block until the user
/// resumes or exits.
pub trait RunspaceEventSink: Send + Sync {
    fn on_state_changed(&self, state: RunspaceState);

    fn on_debugger_stop(&self, args: DebuggerStopEventArgs) -> DebuggerResumeAction;

    fn on_breakpoint_updated(&self, args: BreakpointUpdatedEventArgs);

    fn on_enter_nested_prompt(&self);

    fn on_exit_nested_prompt(&self);

    /// Line editor idle tick, raised while a read-line call waits for input.
    fn on_idle(&self);

    /// Interactive session entered (Enter-PSSession style).
    fn on_push_runspace(&self, runspace: Arc<dyn Runspace>);

    fn on_pop_runspace(&self);
}
