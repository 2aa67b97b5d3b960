//! Runs work inside the line editor's idle callback while a read-line call
//! owns the runspace.

use std::sync::{Arc, Mutex};

use tokio::sync::oneshot;
use tracing::{debug, trace};

use crate::EditorServicesError;
use crate::context::PowerShellContext;
use crate::engine::{FromPsValue, Pipeline, PsCommand, Runspace};
use crate::execution::{
    ActionRequest, CommandExecutionRequest, CommandOutput, ExecutionOptions,
    PipelineExecutionRequest,
};
use crate::prompt_nest::{PromptNest, PromptNestFrameType};

/// One pending request at a time. Publishers queue FIFO behind `gate`; the
/// idle hook never waits, it skips the tick when the slot is contended.
#[derive(Default)]
pub struct InvocationEventQueue {
    pending: Mutex<Option<Box<dyn PipelineExecutionRequest>>>,
    gate: tokio::sync::Mutex<()>,
}

/// Clears the slot when the publisher stops waiting, whatever the reason.
struct PublishedRequest<'a> {
    queue: &'a InvocationEventQueue,
}

impl Drop for PublishedRequest<'_> {
    fn drop(&mut self) {
        if let Ok(mut pending) = self.queue.pending.lock() {
            if pending.take().is_some() {
                debug!(target: "execution", "withdrew idle request that never ran");
            }
        }
    }
}

impl InvocationEventQueue {
    pub fn new() -> Self {
        Self::default()
    }

    pub(crate) async fn execute_command_on_idle<T>(
        &self,
        context: &PowerShellContext,
        command: PsCommand,
        options: ExecutionOptions,
    ) -> Result<CommandOutput<T>, EditorServicesError>
    where
        T: FromPsValue + Send + 'static,
    {
        let (request, result) = CommandExecutionRequest::<T>::new(context.clone(), command, options);
        self.run_on_idle(context, Box::new(request), result).await?
    }

    /// Runs `action` with exclusive use of the pipeline, on the thread
    /// currently blocked in the line editor. Fails with `FrameExited` when
    /// the line editor returns before an idle tick picked it up.
    pub async fn invoke_on_pipeline_thread<F>(
        &self,
        context: &PowerShellContext,
        action: F,
    ) -> Result<(), EditorServicesError>
    where
        F: FnOnce(&Arc<dyn Pipeline>) + Send + 'static,
    {
        let (tx, result) = oneshot::channel();
        let ctx = context.clone();
        let request = ActionRequest::new(move || {
            let outcome = ctx.run_with_pipeline_blocking(action);
            let _ = tx.send(outcome);
        });

        self.run_on_idle(context, Box::new(request), result).await?
    }

    async fn run_on_idle<R>(
        &self,
        context: &PowerShellContext,
        request: Box<dyn PipelineExecutionRequest>,
        result: oneshot::Receiver<R>,
    ) -> Result<R, EditorServicesError> {
        if !context.prompt_context().supports_eventing() {
            return Err(EditorServicesError::EventingUnavailable);
        }

        let _gate = self.gate.lock().await;
        let _published = {
            let mut pending = self
                .pending
                .lock()
                .expect("invocation event queue mutex poisoned");
            *pending = Some(request);
            PublishedRequest { queue: self }
        };

        if !context.prompt_nest().is_read_line_busy() {
            debug!(target: "execution", "read-line returned before the idle request was published");
            return Err(EditorServicesError::FrameExited);
        }

        trace!(target: "execution", "published idle request, forcing event handling");
        context.prompt_context().force_event_handling();

        result.await.map_err(|_| EditorServicesError::FrameExited)
    }

    /// Drops a request the line editor returned without running. Its
    /// publisher sees `FrameExited` and dispatches again.
    pub(crate) fn withdraw_pending(&self) {
        let withdrawn = self
            .pending
            .lock()
            .expect("invocation event queue mutex poisoned")
            .take();
        if withdrawn.is_some() {
            debug!(target: "execution", "read-line returned before the idle request ran");
        }
    }

    /// Idle hook, raised by the engine on the thread running read-line.
    pub(crate) fn on_idle(&self, nest: &PromptNest, runspace: &Arc<dyn Runspace>) {
        let request = match self.pending.try_lock() {
            Ok(mut pending) => pending.take(),
            Err(_) => return,
        };
        let Some(request) = request else {
            return;
        };

        trace!(target: "execution", "running idle request");
        nest.push_prompt_context(PromptNestFrameType::NORMAL, runspace);
        request.execute();
        nest.pop_prompt_context();
    }
}
