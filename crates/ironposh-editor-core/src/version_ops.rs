//! Engine operations whose shape depends on the engine version.
//!
//! The implementation is chosen once, when the coordinator is created.

use tracing::{debug, warn};

use crate::engine::{
    DebugModes, DebuggerCommandResults, EngineError, PowerShellVersion, PsCommand, PsValue,
    Runspace,
};
use crate::prompt_nest::PromptNest;

pub trait VersionSpecificOperations: Send + Sync {
    fn configure_debugger(&self, runspace: &dyn Runspace);

    fn pause_debugger(&self, runspace: &dyn Runspace);

    fn execute_command_in_debugger(
        &self,
        runspace: &dyn Runspace,
        command: &PsCommand,
        output: &mut dyn FnMut(PsValue),
    ) -> Result<DebuggerCommandResults, EngineError>;

    fn stop_command_in_debugger(&self, runspace: &dyn Runspace);

    fn is_debugger_stopped(&self, nest: &PromptNest, runspace: &dyn Runspace) -> bool;
}

pub fn for_version(version: &PowerShellVersion) -> Box<dyn VersionSpecificOperations> {
    if version.major <= 3 {
        debug!(%version, "using legacy engine operations");
        Box::new(LegacyOperations)
    } else {
        Box::new(ModernOperations)
    }
}

fn process_in_debugger(
    runspace: &dyn Runspace,
    command: &PsCommand,
    output: &mut dyn FnMut(PsValue),
) -> Result<DebuggerCommandResults, EngineError> {
    let debugger = runspace
        .debugger()
        .ok_or_else(|| EngineError::InvalidOperation("runspace has no debugger".to_string()))?;
    debugger.process_command(command, output)
}

/// Engines up to 3.x: no debug modes, no step-mode pause, and the debugger
/// cannot report whether it sits on a breakpoint.
#[derive(Debug, Default, Clone, Copy)]
pub struct LegacyOperations;

impl VersionSpecificOperations for LegacyOperations {
    fn configure_debugger(&self, _runspace: &dyn Runspace) {}

    fn pause_debugger(&self, _runspace: &dyn Runspace) {
        warn!(target: "debugger", "break is not supported by this engine version");
    }

    fn execute_command_in_debugger(
        &self,
        runspace: &dyn Runspace,
        command: &PsCommand,
        output: &mut dyn FnMut(PsValue),
    ) -> Result<DebuggerCommandResults, EngineError> {
        process_in_debugger(runspace, command, output)
    }

    fn stop_command_in_debugger(&self, runspace: &dyn Runspace) {
        if let Some(debugger) = runspace.debugger() {
            debugger.stop_process_command();
        }
    }

    fn is_debugger_stopped(&self, nest: &PromptNest, _runspace: &dyn Runspace) -> bool {
        nest.is_in_debugger()
    }
}

#[derive(Debug, Default, Clone, Copy)]
pub struct ModernOperations;

impl VersionSpecificOperations for ModernOperations {
    fn configure_debugger(&self, runspace: &dyn Runspace) {
        if let Some(debugger) = runspace.debugger() {
            debugger.set_debug_mode(DebugModes::LOCAL_SCRIPT | DebugModes::REMOTE_SCRIPT);
        }
    }

    fn pause_debugger(&self, runspace: &dyn Runspace) {
        if let Some(debugger) = runspace.debugger() {
            debugger.set_debugger_step_mode(true);
        }
    }

    fn execute_command_in_debugger(
        &self,
        runspace: &dyn Runspace,
        command: &PsCommand,
        output: &mut dyn FnMut(PsValue),
    ) -> Result<DebuggerCommandResults, EngineError> {
        process_in_debugger(runspace, command, output)
    }

    fn stop_command_in_debugger(&self, runspace: &dyn Runspace) {
        if let Some(debugger) = runspace.debugger() {
            debugger.stop_process_command();
        }
    }

    fn is_debugger_stopped(&self, nest: &PromptNest, runspace: &dyn Runspace) -> bool {
        let in_breakpoint = runspace
            .debugger()
            .is_some_and(|debugger| debugger.in_breakpoint());
        in_breakpoint || (nest.is_remote() && nest.is_in_debugger())
    }
}
