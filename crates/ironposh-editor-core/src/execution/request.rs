use tokio::sync::oneshot;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use super::{CommandOutput, ExecutionOptions};
use crate::EditorServicesError;
use crate::context::PowerShellContext;
use crate::engine::{FromPsValue, PsCommand};

/// Work handed to the thread that owns the current pipeline.
///
/// `execute` runs synchronously on that thread and completes the requester's
/// pending result, including failures.
pub trait PipelineExecutionRequest: Send {
    fn execute(self: Box<Self>);
}

pub(crate) type ResultReceiver<T> = oneshot::Receiver<Result<CommandOutput<T>, EditorServicesError>>;

pub(crate) struct CommandExecutionRequest<T> {
    context: PowerShellContext,
    command: PsCommand,
    options: ExecutionOptions,
    responder: oneshot::Sender<Result<CommandOutput<T>, EditorServicesError>>,
}

impl<T> CommandExecutionRequest<T>
where
    T: FromPsValue + Send + 'static,
{
    pub(crate) fn new(
        context: PowerShellContext,
        command: PsCommand,
        options: ExecutionOptions,
    ) -> (Self, ResultReceiver<T>) {
        let (responder, receiver) = oneshot::channel();
        (
            Self {
                context,
                command,
                options,
                responder,
            },
            receiver,
        )
    }
}

impl<T> PipelineExecutionRequest for CommandExecutionRequest<T>
where
    T: FromPsValue + Send + 'static,
{
    fn execute(self: Box<Self>) {
        let Self {
            context,
            command,
            options,
            responder,
        } = *self;

        let result = futures::executor::block_on(context.execute_on_current_thread::<T>(
            command,
            options,
            CancellationToken::new(),
        ));

        if responder.send(result).is_err() {
            debug!(target: "execution", "requester dropped before the result was delivered");
        }
    }
}

/// Arbitrary work to run on the pipeline thread.
pub(crate) struct ActionRequest {
    action: Box<dyn FnOnce() + Send>,
}

impl ActionRequest {
    pub(crate) fn new(action: impl FnOnce() + Send + 'static) -> Self {
        Self {
            action: Box::new(action),
        }
    }
}

impl PipelineExecutionRequest for ActionRequest {
    fn execute(self: Box<Self>) {
        (self.action)();
    }
}
