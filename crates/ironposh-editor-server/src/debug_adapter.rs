use std::sync::Arc;

use futures::StreamExt;
use ironposh_editor_core::engine::DebuggerStopEventArgs;
use ironposh_editor_core::{DebuggerResumeAction, PowerShellContext};
use serde::{Deserialize, Serialize};
use tokio::task::JoinHandle;
use tracing::{debug, info, instrument, warn};

use crate::notifications::NotificationSink;

/// The engine runs scripts on a single thread as far as the editor is
/// concerned.
const THREAD_ID: i32 = 1;

pub const STOPPED_EVENT: &str = "stopped";
pub const CONTINUED_EVENT: &str = "continued";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum DebugAdapterRequest {
    Continue,
    Next,
    StepIn,
    StepOut,
    Pause,
    Disconnect,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StoppedEventBody {
    pub reason: &'static str,
    pub thread_id: i32,
    pub source: Option<String>,
    pub line: Option<u32>,
    pub column: Option<u32>,
    pub hit_breakpoint_ids: Vec<i32>,
}

impl From<&DebuggerStopEventArgs> for StoppedEventBody {
    fn from(args: &DebuggerStopEventArgs) -> Self {
        let reason = if args.breakpoint_ids.is_empty() {
            "step"
        } else {
            "breakpoint"
        };

        Self {
            reason,
            thread_id: THREAD_ID,
            source: args.script_name.clone(),
            line: args.line,
            column: args.column,
            hit_breakpoint_ids: args.breakpoint_ids.clone(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ContinuedEventBody {
    pub thread_id: i32,
    pub all_threads_continued: bool,
}

enum DebuggerEvent {
    Stopped(DebuggerStopEventArgs),
    Resumed(DebuggerResumeAction),
}

/// Maps debug adapter requests onto the coordinator and reports debugger
/// stops back to the client.
pub struct DebugAdapterBridge {
    context: PowerShellContext,
}

impl DebugAdapterBridge {
    pub fn new(context: PowerShellContext) -> Self {
        Self { context }
    }

    #[instrument(skip(self))]
    pub async fn handle(&self, request: DebugAdapterRequest) {
        let action = match request {
            DebugAdapterRequest::Continue => DebuggerResumeAction::Continue,
            DebugAdapterRequest::Next => DebuggerResumeAction::StepOver,
            DebugAdapterRequest::StepIn => DebuggerResumeAction::StepInto,
            DebugAdapterRequest::StepOut => DebuggerResumeAction::StepOut,
            DebugAdapterRequest::Pause => {
                self.context.break_execution();
                return;
            }
            DebugAdapterRequest::Disconnect => {
                info!("debug session disconnected, aborting execution");
                self.context.abort_execution(true).await;
                return;
            }
        };

        if !self.context.is_debugger_stopped() {
            warn!(?request, "debugger is not stopped, ignoring step request");
            return;
        }

        self.context.resume_debugger(action).await;
    }

    /// Relays debugger stops and resumes as `stopped`/`continued` events
    /// until the coordinator goes away.
    pub fn forward_events(&self, sink: Arc<dyn NotificationSink>) -> JoinHandle<()> {
        let events = self.context.events();
        let stops = events.debugger_stop.subscribe().map(DebuggerEvent::Stopped);
        let resumes = events.debugger_resumed.subscribe().map(DebuggerEvent::Resumed);
        let mut merged = futures::stream::select(stops, resumes);

        tokio::spawn(async move {
            while let Some(event) = merged.next().await {
                let (name, body) = match event {
                    DebuggerEvent::Stopped(args) => {
                        debug!(script = ?args.script_name, line = ?args.line, "debugger stopped");
                        (STOPPED_EVENT, serde_json::to_value(StoppedEventBody::from(&args)))
                    }
                    DebuggerEvent::Resumed(action) => {
                        debug!(?action, "debugger resumed");
                        (
                            CONTINUED_EVENT,
                            serde_json::to_value(ContinuedEventBody {
                                thread_id: THREAD_ID,
                                all_threads_continued: true,
                            }),
                        )
                    }
                };

                match body {
                    Ok(body) => sink.send_notification(name, body),
                    Err(error) => warn!(%error, event = name, "failed to serialize debug event"),
                }
            }
        })
    }
}
