mod options;
mod output;
mod report;
mod request;

pub use options::{ExecutionOptions, ExecutionStatus, ExecutionStatusChangedEventArgs, ExecutionTarget};
pub use output::CommandOutput;
pub(crate) use report::format_error_report;
pub use request::PipelineExecutionRequest;
pub(crate) use request::{ActionRequest, CommandExecutionRequest, ResultReceiver};
