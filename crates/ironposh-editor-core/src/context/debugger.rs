use std::sync::Arc;

use tracing::{debug, error, info, instrument, warn};

use super::PowerShellContext;
use crate::engine::{DebuggerResumeAction, DebuggerStopEventArgs};
use crate::execution::ExecutionStatus;
use crate::prompt_nest::{FrameSignal, PromptNestFrame, PromptNestFrameType, ThreadController};
use crate::session::{
    PowerShellExecutionResult, RunspaceContext, SessionState, SessionStateChangedEventArgs,
};

enum LoopExit {
    Resumed(DebuggerResumeAction),
    NoLongerStopped,
}

impl PowerShellContext {
    pub fn is_debugger_stopped(&self) -> bool {
        let runspace = Arc::clone(&self.current_runspace().runspace);
        self.inner
            .version_ops
            .is_debugger_stopped(&self.inner.prompt_nest, runspace.as_ref())
    }

    /// Debugger break raised by the engine. Blocks the engine thread in a
    /// message loop until the debugger is resumed, servicing marshalled
    /// requests in between.
    #[instrument(skip_all, fields(script = ?args.script_name, line = ?args.line))]
    pub(crate) fn on_debugger_stop(&self, args: DebuggerStopEventArgs) -> DebuggerResumeAction {
        let current = self.current_runspace();
        let mut frame_type = PromptNestFrameType::DEBUG;
        if current.runspace.is_remote() {
            frame_type |= PromptNestFrameType::REMOTE;
        }

        *self
            .inner
            .current_debugger_stop
            .lock()
            .expect("debugger stop mutex poisoned") = Some(args.clone());

        let frame = self
            .inner
            .prompt_nest
            .push_prompt_context(frame_type, &current.runspace);
        let Some(controller) = frame.thread_controller().cloned() else {
            error!(target: "debugger", "debug frame has no thread controller");
            self.inner.prompt_nest.pop_prompt_context();
            return DebuggerResumeAction::Continue;
        };

        if let Some(details) = self.session_details_in_debugger() {
            self.update_runspace_details_if_session_changed(details, true);
        }

        info!(target: "debugger", "debugger stopped");
        self.inner.events.debugger_stop.emit(args);

        if let Some(input) = self.host_input() {
            input.stop_command_loop();
            input.start_command_loop();
        }

        let exit = self.run_debugger_loop(&controller);

        *self
            .inner
            .current_debugger_stop
            .lock()
            .expect("debugger stop mutex poisoned") = None;

        let action = match exit {
            LoopExit::Resumed(action) => {
                info!(target: "debugger", ?action, "debugger resumed");
                self.inner.events.debugger_resumed.emit(action);
                action
            }
            LoopExit::NoLongerStopped => {
                if self.current_runspace().context == RunspaceContext::DebuggedRunspace {
                    if let Err(error) = self.pop_runspace() {
                        warn!(target: "debugger", %error, "could not pop the debugged runspace");
                    }
                }
                DebuggerResumeAction::Continue
            }
        };

        self.inner.prompt_nest.pop_prompt_context();
        action
    }

    fn run_debugger_loop(&self, controller: &ThreadController) -> LoopExit {
        loop {
            match controller.next_signal() {
                FrameSignal::Request(request) => {
                    request.execute();

                    // A request such as detaching from a debugged runspace can
                    // leave the break without an explicit resume.
                    if !self.is_debugger_stopped() {
                        debug!(target: "debugger", "debugger no longer stopped after request");
                        return LoopExit::NoLongerStopped;
                    }
                }
                FrameSignal::Exit(action) => return LoopExit::Resumed(action),
            }
        }
    }

    /// Resumes the debugger and waits until the debug frame has been popped.
    #[instrument(skip(self))]
    pub async fn resume_debugger(&self, action: DebuggerResumeAction) {
        let _resume = self.inner.resume_request.lock().await;
        let nest = &self.inner.prompt_nest;

        if nest.is_nested_prompt() {
            self.exit_all_nested_prompts().await;
        }

        if !nest.is_in_debugger() {
            error!(target: "debugger", ?action, "attempted to resume while the debugger is not stopped");
            return;
        }

        let frame = nest.current_frame();
        if frame
            .thread_controller()
            .is_some_and(|controller| controller.is_current_thread())
        {
            self.signal_resume(&frame, action);
            return;
        }

        nest.wait_for_current_frame_exit_async(|frame| self.signal_resume(frame, action))
            .await;
    }

    /// Signals the current debug frame to exit without waiting. Used from the
    /// owner thread itself, where waiting for the frame would never finish.
    pub(crate) fn resume_debugger_without_wait(&self, action: DebuggerResumeAction) {
        let frame = self.inner.prompt_nest.current_frame();
        if frame
            .frame_type()
            .contains(PromptNestFrameType::NESTED_PROMPT)
        {
            debug!(target: "debugger", "resuming from inside a nested prompt, exiting the prompt");
        } else if !frame.frame_type().contains(PromptNestFrameType::DEBUG) {
            error!(target: "debugger", ?action, "attempted to resume while the debugger is not stopped");
            return;
        }

        if let Some(controller) = frame.thread_controller() {
            controller.start_thread_exit(action);
        }
    }

    fn signal_resume(&self, frame: &PromptNestFrame, action: DebuggerResumeAction) {
        if let Some(controller) = frame.thread_controller() {
            controller.start_thread_exit(action);
        }

        if let Some(input) = self.host_input() {
            input.stop_command_loop();
        }

        if self.session_state() != SessionState::Ready {
            let runspace = Arc::clone(&self.current_runspace().runspace);
            self.inner
                .version_ops
                .stop_command_in_debugger(runspace.as_ref());
        }
    }

    /// Asks the engine to break at the next statement.
    pub fn break_execution(&self) {
        info!(target: "debugger", "requesting debugger break");
        let runspace = Arc::clone(&self.current_runspace().runspace);
        self.inner.version_ops.pause_debugger(runspace.as_ref());
    }

    /// Stops whatever is running. With `should_abort_debug_session` a
    /// debugger stop is also resumed with `Stop`.
    #[instrument(skip(self))]
    pub async fn abort_execution(&self, should_abort_debug_session: bool) {
        if matches!(
            self.session_state(),
            SessionState::Aborting | SessionState::Disposed
        ) {
            debug!(target: "session", state = ?self.session_state(), "execution abort requested when already aborted");
            return;
        }

        info!(target: "session", "aborting the current execution");

        if self.inner.prompt_nest.is_in_debugger() {
            let runspace = Arc::clone(&self.current_runspace().runspace);
            self.inner
                .version_ops
                .stop_command_in_debugger(runspace.as_ref());
            if should_abort_debug_session {
                self.resume_debugger(DebuggerResumeAction::Stop).await;
            }
        } else {
            self.inner.prompt_nest.get_pipeline(false).stop();
        }

        let Some(_abort) = self.inner.session_state_lock.try_acquire_for_debugger_abort() else {
            debug!(target: "session", "session state lock is held, skipping abort state change");
            return;
        };

        self.on_session_state_changed(SessionStateChangedEventArgs::new(
            SessionState::Aborting,
            PowerShellExecutionResult::Aborted,
        ));
        self.on_execution_status_changed(ExecutionStatus::Aborted, None, false);
        self.on_session_state_changed(SessionStateChangedEventArgs::new(
            SessionState::Ready,
            PowerShellExecutionResult::Aborted,
        ));
    }

    /// Nested prompt requested by a running script. Blocks the engine thread
    /// in a message loop until the prompt is exited.
    #[instrument(skip_all)]
    pub(crate) fn enter_nested_prompt(&self) {
        if self.is_current_runspace_out_of_process() {
            warn!(target: "prompt_nest", "nested prompts are not supported in out-of-process runspaces");
            return;
        }

        let current = self.current_runspace();
        let frame = self
            .inner
            .prompt_nest
            .push_prompt_context(PromptNestFrameType::NESTED_PROMPT, &current.runspace);
        let Some(controller) = frame.thread_controller().cloned() else {
            error!(target: "prompt_nest", "nested prompt frame has no thread controller");
            self.inner.prompt_nest.pop_prompt_context();
            return;
        };

        self.on_session_state_changed(SessionStateChangedEventArgs::new(
            SessionState::Ready,
            PowerShellExecutionResult::Stopped,
        ));

        if let Some(input) = self.host_input() {
            input.stop_command_loop();
            input.start_command_loop();
        }

        loop {
            match controller.next_signal() {
                FrameSignal::Request(request) => request.execute(),
                FrameSignal::Exit(_) => break,
            }
        }

        if let Some(input) = self.host_input() {
            input.stop_command_loop();
        }
        self.inner.prompt_nest.pop_prompt_context();
        debug!(target: "prompt_nest", "left nested prompt");
    }

    pub fn exit_nested_prompt(&self) {
        let nest = &self.inner.prompt_nest;
        if !nest.is_nested_prompt() {
            error!(target: "prompt_nest", "attempted to exit a nested prompt when not in one");
            return;
        }

        if let Some(controller) = nest.current_frame().thread_controller() {
            controller.start_thread_exit(DebuggerResumeAction::Continue);
        }
    }

    pub(crate) async fn exit_all_nested_prompts(&self) {
        let nest = &self.inner.prompt_nest;
        while nest.is_nested_prompt() {
            let frame = nest.current_frame();
            let owned_here = frame
                .thread_controller()
                .is_none_or(|controller| controller.is_current_thread());

            let exit = |frame: &PromptNestFrame| {
                if let Some(controller) = frame.thread_controller() {
                    controller.start_thread_exit(DebuggerResumeAction::Continue);
                }
            };

            if owned_here {
                exit(&frame);
                break;
            }
            nest.wait_for_current_frame_exit_async(exit).await;
        }
    }
}
