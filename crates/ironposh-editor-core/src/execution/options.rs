use serde::{Deserialize, Serialize};
use typed_builder::TypedBuilder;

/// Per-call knobs for a command execution
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, TypedBuilder)]
#[serde(rename_all = "camelCase")]
pub struct ExecutionOptions {
    #[builder(default = true)]
    pub write_output_to_host: bool,

    #[builder(default = true)]
    pub write_errors_to_host: bool,

    #[builder(default = false)]
    pub write_input_to_host: bool,

    #[builder(default = false)]
    pub add_to_history: bool,

    #[builder(default = false)]
    pub interrupt_command_prompt: bool,

    #[builder(default = false)]
    pub is_read_line: bool,

    #[builder(default = false)]
    pub should_execute_in_original_runspace: bool,

    /// Text echoed and recorded in history instead of the command text
    #[builder(default, setter(strip_option, into))]
    pub input_string: Option<String>,
}

impl Default for ExecutionOptions {
    fn default() -> Self {
        Self::builder().build()
    }
}

impl ExecutionOptions {
    /// No host output at all, the shape used by completion and probe requests.
    pub fn silent() -> Self {
        Self::builder()
            .write_output_to_host(false)
            .write_errors_to_host(false)
            .build()
    }

    pub(crate) fn should_cancel_read_line(&self) -> bool {
        self.interrupt_command_prompt || self.write_output_to_host
    }
}

/// Where a command ends up running
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ExecutionTarget {
    PowerShell,
    Debugger,
    InvocationEvent,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ExecutionStatus {
    Pending,
    Running,
    Failed,
    Aborted,
    Completed,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExecutionStatusChangedEventArgs {
    pub execution_status: ExecutionStatus,
    pub execution_options: Option<ExecutionOptions>,
    pub had_errors: bool,
}
