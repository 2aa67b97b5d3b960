use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use bitflags::bitflags;
use tokio::sync::watch;
use tracing::debug;

use super::handle::HandleQueue;
use super::thread_controller::ThreadController;
use crate::engine::{Pipeline, PsInvocationState};

bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct PromptNestFrameType: u32 {
        const NORMAL = 0;
        const NESTED_PROMPT = 1;
        const DEBUG = 2;
        const REMOTE = 4;
    }
}

impl PromptNestFrameType {
    pub fn needs_thread_controller(self) -> bool {
        self.intersects(Self::NESTED_PROMPT | Self::DEBUG)
    }
}

/// One level of the prompt nest: a dedicated pipeline, its handle queue and,
/// for nested prompts and debugger stops, the owning thread's mailbox.
pub struct PromptNestFrame {
    frame_type: PromptNestFrameType,
    pipeline: Arc<dyn Pipeline>,
    pub(crate) handles: HandleQueue,
    thread_controller: Option<Arc<ThreadController>>,
    exited: watch::Sender<bool>,
    disposed: AtomicBool,
}

impl PromptNestFrame {
    /// Must be called on the thread that will own the frame's message loop.
    pub(crate) fn new(frame_type: PromptNestFrameType, pipeline: Arc<dyn Pipeline>) -> Self {
        let thread_controller = frame_type
            .needs_thread_controller()
            .then(|| Arc::new(ThreadController::new()));

        Self {
            frame_type,
            pipeline,
            handles: HandleQueue::new(),
            thread_controller,
            exited: watch::Sender::new(false),
            disposed: AtomicBool::new(false),
        }
    }

    pub fn frame_type(&self) -> PromptNestFrameType {
        self.frame_type
    }

    pub fn pipeline(&self) -> &Arc<dyn Pipeline> {
        &self.pipeline
    }

    pub fn thread_controller(&self) -> Option<&Arc<ThreadController>> {
        self.thread_controller.as_ref()
    }

    pub fn is_thread_controller(&self) -> bool {
        self.thread_controller.is_some()
    }

    pub fn has_exited(&self) -> bool {
        *self.exited.borrow()
    }

    pub async fn wait_for_exit(&self) {
        let mut exited = self.exited.subscribe();
        let _ = exited.wait_for(|exited| *exited).await;
    }

    pub(crate) fn dispose(&self) {
        if self.disposed.swap(true, Ordering::SeqCst) {
            return;
        }

        if matches!(
            self.pipeline.invocation_state(),
            PsInvocationState::Running | PsInvocationState::Stopping
        ) {
            debug!(target: "prompt_nest", frame_type = ?self.frame_type, "stopping pipeline of exiting frame");
            self.pipeline.stop();
        }

        if let Some(controller) = &self.thread_controller {
            controller.close();
        }
        self.handles.close();
        self.exited.send_replace(true);
    }
}

impl fmt::Debug for PromptNestFrame {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PromptNestFrame")
            .field("frame_type", &self.frame_type)
            .field("is_thread_controller", &self.is_thread_controller())
            .field("exited", &self.has_exited())
            .finish_non_exhaustive()
    }
}
