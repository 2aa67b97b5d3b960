//! Host-side collaborators the coordinator drives: output sink, console
//! command loop and the line-editor prompt context.

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum OutputType {
    Normal,
    Debug,
    Verbose,
    Warning,
    Error,
}

pub trait HostOutput: Send + Sync {
    fn write_output(&self, text: &str, include_newline: bool, output_type: OutputType);
}

/// The interactive console loop that reads commands from the user.
pub trait HostInput: Send + Sync {
    fn start_command_loop(&self);

    fn stop_command_loop(&self);
}

/// Line-editor services used while executing.
pub trait PromptContext: Send + Sync {
    fn add_to_history(&self, command: &str);

    /// Asks the line editor to raise its idle event as soon as possible.
    fn force_event_handling(&self);

    /// Whether the line editor raises idle events the coordinator can run work in.
    fn supports_eventing(&self) -> bool;

    fn abort_read_line(&self);
}

/// Host that drops everything, used when no console is attached.
#[derive(Debug, Default, Clone, Copy)]
pub struct NullHost;

impl HostOutput for NullHost {
    fn write_output(&self, _text: &str, _include_newline: bool, _output_type: OutputType) {}
}

impl PromptContext for NullHost {
    fn add_to_history(&self, _command: &str) {}

    fn force_event_handling(&self) {}

    fn supports_eventing(&self) -> bool {
        false
    }

    fn abort_read_line(&self) {}
}
