//! Stack of prompt contexts and the per-frame access control over the runspace.

mod frame;
mod handle;
mod thread_controller;

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use tokio_util::sync::CancellationToken;
use tracing::{debug, error, instrument, trace};

pub use frame::{PromptNestFrame, PromptNestFrameType};
pub use handle::RunspaceHandle;
pub use thread_controller::{FrameSignal, ThreadController};

use crate::EditorServicesError;
use crate::engine::{DebuggerResumeAction, Pipeline, PipelineKind, Runspace};

pub struct PromptNest {
    frames: Mutex<Vec<Arc<PromptNestFrame>>>,
    read_line_frame: Arc<PromptNestFrame>,
    disposed: AtomicBool,
}

impl PromptNest {
    pub fn new(runspace: &Arc<dyn Runspace>) -> Self {
        let base = PromptNestFrame::new(
            PromptNestFrameType::NORMAL,
            runspace.create_pipeline(PipelineKind::TopLevel),
        );
        let read_line_frame = PromptNestFrame::new(
            PromptNestFrameType::NORMAL,
            runspace.create_pipeline(PipelineKind::TopLevel),
        );

        Self {
            frames: Mutex::new(vec![Arc::new(base)]),
            read_line_frame: Arc::new(read_line_frame),
            disposed: AtomicBool::new(false),
        }
    }

    pub fn current_frame(&self) -> Arc<PromptNestFrame> {
        self.frames
            .lock()
            .expect("prompt nest mutex poisoned")
            .last()
            .cloned()
            .unwrap_or_else(|| Arc::clone(&self.read_line_frame))
    }

    pub fn nested_prompt_level(&self) -> usize {
        self.frames.lock().expect("prompt nest mutex poisoned").len()
    }

    pub fn is_nested_prompt(&self) -> bool {
        self.current_frame()
            .frame_type()
            .contains(PromptNestFrameType::NESTED_PROMPT)
    }

    pub fn is_in_debugger(&self) -> bool {
        self.current_frame()
            .frame_type()
            .contains(PromptNestFrameType::DEBUG)
    }

    pub fn is_remote(&self) -> bool {
        self.current_frame()
            .frame_type()
            .contains(PromptNestFrameType::REMOTE)
    }

    pub fn is_read_line_busy(&self) -> bool {
        self.read_line_frame.handles.is_busy()
    }

    pub fn is_main_thread_busy(&self) -> bool {
        self.current_frame().handles.is_busy()
    }

    pub fn is_disposed(&self) -> bool {
        self.disposed.load(Ordering::SeqCst)
    }

    /// Pushes a frame owned by the calling thread. Remote frames get a
    /// top-level pipeline, every other frame a nested one.
    #[instrument(skip(self, runspace), fields(level = tracing::field::Empty))]
    pub fn push_prompt_context(
        &self,
        frame_type: PromptNestFrameType,
        runspace: &Arc<dyn Runspace>,
    ) -> Arc<PromptNestFrame> {
        let kind = if frame_type.contains(PromptNestFrameType::REMOTE) {
            PipelineKind::TopLevel
        } else {
            PipelineKind::Nested
        };

        let frame = Arc::new(PromptNestFrame::new(frame_type, runspace.create_pipeline(kind)));
        let level = {
            let mut frames = self.frames.lock().expect("prompt nest mutex poisoned");
            frames.push(Arc::clone(&frame));
            frames.len()
        };

        tracing::Span::current().record("level", level);
        debug!(target: "prompt_nest", ?frame_type, ?kind, "pushed prompt context");
        frame
    }

    /// Pops and disposes the current frame. The base frame is never popped.
    pub fn pop_prompt_context(&self) -> bool {
        if self.is_disposed() {
            error!(target: "prompt_nest", "cannot pop a prompt context of a disposed prompt nest");
            return false;
        }

        let popped = {
            let mut frames = self.frames.lock().expect("prompt nest mutex poisoned");
            if frames.len() <= 1 {
                None
            } else {
                frames.pop()
            }
        };

        match popped {
            Some(frame) => {
                debug!(target: "prompt_nest", frame_type = ?frame.frame_type(), "popped prompt context");
                frame.dispose();
                true
            }
            None => {
                error!(target: "prompt_nest", "cannot pop the base prompt context");
                false
            }
        }
    }

    /// Waits for exclusive use of the current frame.
    ///
    /// A read-line request on an in-process runspace takes the current frame's
    /// main handle before the read-line handle, so the user typing blocks
    /// regular executions and vice versa.
    pub async fn get_runspace_handle(
        &self,
        runspace: Arc<dyn Runspace>,
        is_read_line: bool,
        out_of_process: bool,
        cancel: &CancellationToken,
    ) -> Result<RunspaceHandle, EditorServicesError> {
        if self.is_disposed() {
            return Err(EditorServicesError::Disposed);
        }

        let current = self.current_frame();
        if !is_read_line {
            let main = current.handles.acquire(cancel).await?;
            trace!(target: "prompt_nest", frame_type = ?current.frame_type(), "acquired runspace handle");
            return Ok(RunspaceHandle::new(runspace, false, Some(main), None));
        }

        let main = if out_of_process {
            None
        } else {
            Some(current.handles.acquire(cancel).await?)
        };
        let read_line = self.read_line_frame.handles.acquire(cancel).await?;
        trace!(target: "prompt_nest", out_of_process, "acquired read-line handle");

        Ok(RunspaceHandle::new(runspace, true, main, Some(read_line)))
    }

    /// Blocking variant for callers already on a pipeline thread.
    pub fn get_runspace_handle_blocking(
        &self,
        runspace: Arc<dyn Runspace>,
        is_read_line: bool,
        out_of_process: bool,
    ) -> Result<RunspaceHandle, EditorServicesError> {
        futures::executor::block_on(self.get_runspace_handle(
            runspace,
            is_read_line,
            out_of_process,
            &CancellationToken::new(),
        ))
    }

    pub fn release_runspace_handle(&self, handle: RunspaceHandle) {
        handle.release();
    }

    pub fn get_thread_controller(&self) -> Option<Arc<ThreadController>> {
        self.current_frame().thread_controller().cloned()
    }

    /// Read-line runs on its own frame unless the current frame is a local
    /// nested one, where only the frame's nested pipeline can run.
    pub fn get_pipeline(&self, is_read_line: bool) -> Arc<dyn Pipeline> {
        let current = self.current_frame();
        if self.nested_prompt_level() > 1
            && !current.frame_type().contains(PromptNestFrameType::REMOTE)
        {
            return Arc::clone(current.pipeline());
        }

        if is_read_line {
            Arc::clone(self.read_line_frame.pipeline())
        } else {
            Arc::clone(current.pipeline())
        }
    }

    /// Runs `initiator` against the current frame, then waits until that
    /// frame is popped. Returns the action its owner thread exited with.
    pub async fn wait_for_current_frame_exit_async(
        &self,
        initiator: impl FnOnce(&PromptNestFrame),
    ) -> Option<DebuggerResumeAction> {
        let frame = self.current_frame();
        initiator(&frame);
        frame.wait_for_exit().await;
        frame.thread_controller().and_then(|c| c.exit())
    }

    /// Blocking form of [`Self::wait_for_current_frame_exit_async`] for
    /// callers on a pipeline thread.
    pub fn wait_for_current_frame_exit(
        &self,
        initiator: impl FnOnce(&PromptNestFrame),
    ) -> Option<DebuggerResumeAction> {
        futures::executor::block_on(self.wait_for_current_frame_exit_async(initiator))
    }

    pub fn dispose(&self) {
        if self.disposed.swap(true, Ordering::SeqCst) {
            return;
        }

        let frames: Vec<_> = self
            .frames
            .lock()
            .expect("prompt nest mutex poisoned")
            .drain(..)
            .rev()
            .collect();
        for frame in frames {
            frame.dispose();
        }
        self.read_line_frame.dispose();
        debug!(target: "prompt_nest", "prompt nest disposed");
    }
}
