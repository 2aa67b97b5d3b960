use std::fmt;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::engine::{PowerShellVersion, PsCommand, PsValue, Runspace};

/// Script that reports where the session currently runs.
pub(crate) const SESSION_DETAILS_SCRIPT: &str = "@{ 'computerName' = if ([Environment]::MachineName) {[Environment]::MachineName} else {'localhost'}; 'processId' = $PID; 'instanceId' = $host.InstanceId }";

/// Identity of the process/machine/host the session is executing in
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionDetails {
    pub process_id: Option<i32>,
    pub computer_name: Option<String>,
    pub instance_id: Option<Uuid>,
}

impl SessionDetails {
    pub fn details_command() -> PsCommand {
        PsCommand::from_script(SESSION_DETAILS_SCRIPT)
    }

    /// Reads the hashtable produced by the details script.
    pub fn from_ps_value(value: &PsValue) -> Option<Self> {
        let obj = value.as_object()?;
        Some(Self {
            process_id: obj.property("processId").and_then(PsValue::as_i32),
            computer_name: obj
                .property("computerName")
                .and_then(PsValue::as_str)
                .map(str::to_owned),
            instance_id: obj.property("instanceId").and_then(PsValue::as_guid),
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum RunspaceLocation {
    Local,
    Remote,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum RunspaceContext {
    Original,
    EnteredProcess,
    DebuggedRunspace,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum RunspaceChangeAction {
    Enter,
    Exit,
    Shutdown,
}

/// Snapshot of a runspace together with where it lives and how it was reached
#[derive(Clone)]
pub struct RunspaceDetails {
    pub runspace: Arc<dyn Runspace>,
    pub session_details: SessionDetails,
    pub powershell_version: PowerShellVersion,
    pub location: RunspaceLocation,
    pub context: RunspaceContext,
    pub connection_string: Option<String>,
}

impl fmt::Debug for RunspaceDetails {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RunspaceDetails")
            .field("instance_id", &self.runspace.instance_id())
            .field("session_details", &self.session_details)
            .field("powershell_version", &self.powershell_version)
            .field("location", &self.location)
            .field("context", &self.context)
            .field("connection_string", &self.connection_string)
            .finish()
    }
}

impl RunspaceDetails {
    pub fn from_runspace(runspace: Arc<dyn Runspace>, session_details: SessionDetails) -> Self {
        let (location, connection_string) = if runspace.is_remote() {
            (RunspaceLocation::Remote, runspace.computer_name())
        } else {
            (RunspaceLocation::Local, None)
        };

        Self {
            powershell_version: runspace.version(),
            runspace,
            session_details,
            location,
            context: RunspaceContext::Original,
            connection_string,
        }
    }

    pub fn from_context(
        details: &Self,
        context: RunspaceContext,
        session_details: SessionDetails,
    ) -> Self {
        Self {
            runspace: Arc::clone(&details.runspace),
            session_details,
            powershell_version: details.powershell_version.clone(),
            location: details.location,
            context,
            connection_string: details.connection_string.clone(),
        }
    }

    pub fn from_debugger(
        details: &Self,
        location: RunspaceLocation,
        context: RunspaceContext,
        session_details: SessionDetails,
    ) -> Self {
        let connection_string = match location {
            RunspaceLocation::Remote => session_details.computer_name.clone(),
            RunspaceLocation::Local => None,
        };

        Self {
            runspace: Arc::clone(&details.runspace),
            session_details,
            powershell_version: details.powershell_version.clone(),
            location,
            context,
            connection_string,
        }
    }

    /// Event handlers only make sense where the coordinator drives the debugger itself.
    pub(crate) fn needs_event_handlers(&self) -> bool {
        matches!(
            (self.location, self.context),
            (RunspaceLocation::Local, RunspaceContext::Original | RunspaceContext::EnteredProcess)
                | (RunspaceLocation::Remote, RunspaceContext::Original)
        )
    }

    pub(crate) fn is_out_of_process(&self) -> bool {
        self.location == RunspaceLocation::Remote || self.context != RunspaceContext::Original
    }
}

#[derive(Debug, Clone)]
pub struct RunspaceChangedEventArgs {
    pub change_action: RunspaceChangeAction,
    pub previous_runspace: RunspaceDetails,
    pub new_runspace: Option<RunspaceDetails>,
}
