mod details;
mod lock;
mod state;

pub use details::{
    RunspaceChangeAction, RunspaceChangedEventArgs, RunspaceContext, RunspaceDetails,
    RunspaceLocation, SessionDetails,
};
pub use lock::{SessionStateGuard, SessionStateLock};
pub use state::{PowerShellExecutionResult, SessionState, SessionStateChangedEventArgs};
