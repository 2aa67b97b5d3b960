pub mod context;
pub mod engine;
pub mod events;
pub mod execution;
pub mod host;
pub mod invocation_event_queue;
pub mod prompt_nest;
pub mod session;
pub mod version_ops;

#[cfg(any(test, feature = "test-helpers"))]
pub mod testing;

pub use context::{PowerShellContext, PowerShellContextConfig, ProfilePaths};
pub use engine::{
    Command, DebuggerResumeAction, EngineError, ErrorRecord, Parameter, PsCommand, PsValue,
};
pub use execution::{CommandOutput, ExecutionOptions, ExecutionStatus, ExecutionTarget};
pub use prompt_nest::{PromptNest, PromptNestFrameType, RunspaceHandle};
pub use session::{RunspaceChangeAction, RunspaceContext, RunspaceDetails, SessionState};

#[derive(Debug, thiserror::Error)]
pub enum EditorServicesError {
    #[error("Operation cancelled while waiting for the runspace")]
    Cancelled,

    #[error("Prompt nest has been disposed")]
    Disposed,

    #[error("Frame exited before the request could run")]
    FrameExited,

    #[error("Prompt context does not support idle event handling")]
    EventingUnavailable,

    #[error("Invalid state: {0}")]
    InvalidState(&'static str),

    #[error("Not supported: {0}")]
    NotSupported(&'static str),

    #[error("Result conversion failed: {0}")]
    Conversion(#[from] engine::ConversionError),

    #[error("Engine error: {0}")]
    Engine(#[from] EngineError),

    #[error("Something unlikely happened: {0}")]
    UnlikelyToHappen(&'static str),
}
