use std::sync::Mutex;
use std::thread::{self, ThreadId};

use crossbeam::channel::{self, Receiver, Sender};
use tokio::sync::{Semaphore, oneshot};
use tracing::{debug, trace};

use crate::EditorServicesError;
use crate::engine::DebuggerResumeAction;
use crate::execution::PipelineExecutionRequest;

/// What the owning thread's message loop should do next
pub enum FrameSignal {
    Request(Box<dyn PipelineExecutionRequest>),
    Exit(DebuggerResumeAction),
}

#[derive(Debug, Default)]
struct ControllerState {
    closed: bool,
    exit_action: Option<DebuggerResumeAction>,
}

/// Mailbox of the thread that owns a nested-prompt or debugger-stop frame.
///
/// Only the owner thread may invoke the frame's pipeline; everything else
/// hands work over through [`ThreadController::request_pipeline_execution`].
pub struct ThreadController {
    owner: ThreadId,
    requests_tx: Sender<Box<dyn PipelineExecutionRequest>>,
    requests_rx: Receiver<Box<dyn PipelineExecutionRequest>>,
    exit_tx: Sender<DebuggerResumeAction>,
    exit_rx: Receiver<DebuggerResumeAction>,
    state: Mutex<ControllerState>,
    in_flight: Semaphore,
}

impl ThreadController {
    /// Binds the controller to the calling thread.
    pub(crate) fn new() -> Self {
        let (requests_tx, requests_rx) = channel::unbounded();
        let (exit_tx, exit_rx) = channel::bounded(1);

        Self {
            owner: thread::current().id(),
            requests_tx,
            requests_rx,
            exit_tx,
            exit_rx,
            state: Mutex::new(ControllerState::default()),
            in_flight: Semaphore::new(1),
        }
    }

    pub fn owner_thread(&self) -> ThreadId {
        self.owner
    }

    pub fn is_current_thread(&self) -> bool {
        thread::current().id() == self.owner
    }

    /// Queues `request` for the owner thread and waits for its result.
    ///
    /// One request is in flight at a time; concurrent callers queue FIFO.
    pub(crate) async fn request_pipeline_execution<R>(
        &self,
        request: Box<dyn PipelineExecutionRequest>,
        result: oneshot::Receiver<R>,
    ) -> Result<R, EditorServicesError> {
        let _in_flight = self
            .in_flight
            .acquire()
            .await
            .map_err(|_| EditorServicesError::FrameExited)?;

        self.submit(request)?;

        result.await.map_err(|_| EditorServicesError::FrameExited)
    }

    fn submit(&self, request: Box<dyn PipelineExecutionRequest>) -> Result<(), EditorServicesError> {
        let state = self.state.lock().expect("thread controller mutex poisoned");
        if state.closed {
            return Err(EditorServicesError::FrameExited);
        }

        self.requests_tx
            .send(request)
            .map_err(|_| EditorServicesError::FrameExited)?;
        trace!(target: "prompt_nest", owner = ?self.owner, "queued pipeline execution request");
        Ok(())
    }

    /// Next queued request, if any. Owner thread only.
    pub fn take_execution_request(&self) -> Option<Box<dyn PipelineExecutionRequest>> {
        self.requests_rx.try_recv().ok()
    }

    /// Blocks the owner thread until a request arrives or an exit is signalled.
    /// Pending requests win over a pending exit.
    pub fn next_signal(&self) -> FrameSignal {
        if let Some(request) = self.take_execution_request() {
            return FrameSignal::Request(request);
        }

        channel::select! {
            recv(self.requests_rx) -> request => match request {
                Ok(request) => FrameSignal::Request(request),
                Err(_) => FrameSignal::Exit(DebuggerResumeAction::Stop),
            },
            recv(self.exit_rx) -> action => {
                FrameSignal::Exit(action.unwrap_or(DebuggerResumeAction::Stop))
            }
        }
    }

    /// Asks the owner thread to leave its message loop. The first action wins.
    pub fn start_thread_exit(&self, action: DebuggerResumeAction) {
        let mut state = self.state.lock().expect("thread controller mutex poisoned");
        if let Some(existing) = state.exit_action {
            debug!(target: "prompt_nest", ?existing, ?action, "thread exit already requested");
            return;
        }

        state.exit_action = Some(action);
        let _ = self.exit_tx.try_send(action);
    }

    /// The resume action the owner thread was asked to exit with.
    pub fn exit(&self) -> Option<DebuggerResumeAction> {
        self.state
            .lock()
            .expect("thread controller mutex poisoned")
            .exit_action
    }

    /// Refuses new requests and fails the queued ones.
    pub(crate) fn close(&self) {
        let pending: Vec<_> = {
            let mut state = self.state.lock().expect("thread controller mutex poisoned");
            state.closed = true;
            self.requests_rx.try_iter().collect()
        };

        if !pending.is_empty() {
            debug!(target: "prompt_nest", count = pending.len(), "dropping requests queued on an exited frame");
        }
        self.in_flight.close();
    }
}
