use serde::{Deserialize, Serialize};

use crate::engine::{EngineError, InvocationStateInfo, PsInvocationState};

/// Externally observable state of the coordinator
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum SessionState {
    Unknown,
    NotStarted,
    Ready,
    Running,
    Aborting,
    Disposed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum PowerShellExecutionResult {
    NotFinished,
    Failed,
    Aborted,
    Stopped,
    Completed,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionStateChangedEventArgs {
    pub new_session_state: SessionState,
    pub execution_result: PowerShellExecutionResult,
    pub error: Option<EngineError>,
}

impl SessionStateChangedEventArgs {
    pub fn new(new_session_state: SessionState, execution_result: PowerShellExecutionResult) -> Self {
        Self {
            new_session_state,
            execution_result,
            error: None,
        }
    }
}

impl From<&InvocationStateInfo> for SessionStateChangedEventArgs {
    fn from(info: &InvocationStateInfo) -> Self {
        let (new_session_state, execution_result) = match info.state {
            PsInvocationState::NotStarted => {
                (SessionState::NotStarted, PowerShellExecutionResult::NotFinished)
            }
            PsInvocationState::Failed => (SessionState::Ready, PowerShellExecutionResult::Failed),
            PsInvocationState::Disconnected => {
                (SessionState::Disposed, PowerShellExecutionResult::Stopped)
            }
            PsInvocationState::Running => {
                (SessionState::Running, PowerShellExecutionResult::NotFinished)
            }
            PsInvocationState::Completed => {
                (SessionState::Ready, PowerShellExecutionResult::Completed)
            }
            PsInvocationState::Stopping => {
                (SessionState::Aborting, PowerShellExecutionResult::Aborted)
            }
            PsInvocationState::Stopped => (SessionState::Ready, PowerShellExecutionResult::Aborted),
        };

        Self {
            new_session_state,
            execution_result,
            error: info.reason.clone(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn translate(state: PsInvocationState) -> (SessionState, PowerShellExecutionResult) {
        let args = SessionStateChangedEventArgs::from(&InvocationStateInfo {
            state,
            reason: None,
        });
        (args.new_session_state, args.execution_result)
    }

    #[test]
    fn invocation_states_map_to_session_states() {
        use PowerShellExecutionResult as R;

        assert_eq!(translate(PsInvocationState::NotStarted), (SessionState::NotStarted, R::NotFinished));
        assert_eq!(translate(PsInvocationState::Running), (SessionState::Running, R::NotFinished));
        assert_eq!(translate(PsInvocationState::Stopping), (SessionState::Aborting, R::Aborted));
        assert_eq!(translate(PsInvocationState::Stopped), (SessionState::Ready, R::Aborted));
        assert_eq!(translate(PsInvocationState::Completed), (SessionState::Ready, R::Completed));
        assert_eq!(translate(PsInvocationState::Failed), (SessionState::Ready, R::Failed));
        assert_eq!(translate(PsInvocationState::Disconnected), (SessionState::Disposed, R::Stopped));
    }

    #[test]
    fn failure_reason_is_carried() {
        let args = SessionStateChangedEventArgs::from(&InvocationStateInfo {
            state: PsInvocationState::Failed,
            reason: Some(EngineError::runtime("boom")),
        });
        assert_eq!(args.error, Some(EngineError::runtime("boom")));
    }
}
