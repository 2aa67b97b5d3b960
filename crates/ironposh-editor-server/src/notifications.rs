//! Forwards coordinator events to the editor as protocol notifications.

use std::sync::Arc;

use futures::StreamExt;
use ironposh_editor_core::execution::ExecutionStatusChangedEventArgs;
use ironposh_editor_core::session::{RunspaceChangedEventArgs, RunspaceLocation};
use ironposh_editor_core::{ExecutionOptions, ExecutionStatus, PowerShellContext, RunspaceContext, RunspaceDetails};
use serde::Serialize;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

pub const RUNSPACE_CHANGED: &str = "powerShell/runspaceChanged";
pub const EXECUTION_STATUS_CHANGED: &str = "powerShell/executionStatusChanged";

/// Outbound side of the editor connection.
pub trait NotificationSink: Send + Sync + 'static {
    fn send_notification(&self, method: &str, params: serde_json::Value);
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum RunspaceType {
    Local,
    Process,
    Remote,
}

/// What the editor needs to label the session it talks to
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct MinifiedRunspaceDetails {
    pub power_shell_version: String,
    pub runspace_type: RunspaceType,
    pub connection_string: Option<String>,
}

impl From<&RunspaceDetails> for MinifiedRunspaceDetails {
    fn from(details: &RunspaceDetails) -> Self {
        let runspace_type = match (details.location, details.context) {
            (RunspaceLocation::Remote, _) => RunspaceType::Remote,
            (_, RunspaceContext::EnteredProcess) => RunspaceType::Process,
            _ => RunspaceType::Local,
        };

        Self {
            power_shell_version: details.powershell_version.to_string(),
            runspace_type,
            connection_string: details.connection_string.clone(),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
struct ExecutionStatusNotification {
    execution_status: ExecutionStatus,
    execution_options: Option<ExecutionOptions>,
    had_errors: bool,
}

fn runspace_changed_params(args: &RunspaceChangedEventArgs) -> Option<serde_json::Value> {
    let runspace = args.new_runspace.as_ref()?;
    serde_json::to_value(MinifiedRunspaceDetails::from(runspace))
        .inspect_err(|error| warn!(%error, "failed to serialize runspace details"))
        .ok()
}

fn execution_status_params(
    args: ExecutionStatusChangedEventArgs,
    psreadline_enabled: bool,
) -> Option<serde_json::Value> {
    // The line editor redraws its own prompt after an abort.
    if psreadline_enabled && args.execution_status == ExecutionStatus::Aborted {
        return None;
    }

    serde_json::to_value(ExecutionStatusNotification {
        execution_status: args.execution_status,
        execution_options: args.execution_options,
        had_errors: args.had_errors,
    })
    .inspect_err(|error| warn!(%error, "failed to serialize execution status"))
    .ok()
}

/// Background tasks relaying runspace and execution status changes; the
/// tasks end when dropped or when the coordinator goes away.
pub struct NotificationForwarder {
    tasks: Vec<JoinHandle<()>>,
}

impl NotificationForwarder {
    pub fn spawn(
        context: &PowerShellContext,
        sink: Arc<dyn NotificationSink>,
        psreadline_enabled: bool,
    ) -> Self {
        let mut runspace_changes = context.events().runspace_changed.subscribe();
        let runspace_task = tokio::spawn({
            let sink = Arc::clone(&sink);
            async move {
                while let Some(args) = runspace_changes.next().await {
                    debug!(action = ?args.change_action, "forwarding runspace change");
                    if let Some(params) = runspace_changed_params(&args) {
                        sink.send_notification(RUNSPACE_CHANGED, params);
                    }
                }
            }
        });

        let mut status_changes = context.events().execution_status_changed.subscribe();
        let status_task = tokio::spawn(async move {
            while let Some(args) = status_changes.next().await {
                if let Some(params) = execution_status_params(args, psreadline_enabled) {
                    sink.send_notification(EXECUTION_STATUS_CHANGED, params);
                }
            }
        });

        Self {
            tasks: vec![runspace_task, status_task],
        }
    }
}

impl Drop for NotificationForwarder {
    fn drop(&mut self) {
        for task in &self.tasks {
            task.abort();
        }
    }
}
