use std::path::Path;
use std::sync::Arc;

use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, trace, warn};

use super::PowerShellContext;
use crate::EditorServicesError;
use crate::engine::{
    Command, EngineError, ErrorRecord, FromPsValue, InvocationSettings, InvocationStateHandler,
    Pipeline, PipelineKind, PsCommand, PsValue, Runspace, RunspaceAvailability,
};
use crate::execution::{
    CommandExecutionRequest, CommandOutput, ExecutionOptions, ExecutionStatus, ExecutionTarget,
    format_error_report,
};
use crate::host::OutputType;
use crate::prompt_nest::RunspaceHandle;
use crate::session::{
    PowerShellExecutionResult, SessionDetails, SessionState, SessionStateChangedEventArgs,
    SessionStateGuard,
};

/// Runs the session-details script on `pipeline`.
pub(crate) fn probe_session_details(
    pipeline: &Arc<dyn Pipeline>,
) -> Result<Option<SessionDetails>, EngineError> {
    pipeline.clear_commands();
    for command in SessionDetails::details_command().commands() {
        pipeline.add_command(command.clone());
    }

    let results = pipeline.invoke(&InvocationSettings::default())?;
    Ok(results.first().and_then(SessionDetails::from_ps_value))
}

/// Invokes a top-level pipeline on the blocking pool when a runtime is
/// around, inline otherwise.
async fn invoke_off_thread(
    pipeline: Arc<dyn Pipeline>,
    settings: InvocationSettings,
) -> Result<Vec<PsValue>, EngineError> {
    match tokio::runtime::Handle::try_current() {
        Ok(runtime) => runtime
            .spawn_blocking(move || pipeline.invoke(&settings))
            .await
            .map_err(|e| EngineError::Other(format!("pipeline thread failed: {e}")))?,
        Err(_) => pipeline.invoke(&settings),
    }
}

fn quote_escape(value: &str) -> String {
    format!("'{}'", value.replace('\'', "''"))
}

/// Keeps the state-change subscription and the session-state lock for the
/// duration of one direct invocation. Unsubscribes before releasing the lock.
struct StateSubscription<'a> {
    pipeline: Arc<dyn Pipeline>,
    _lock: SessionStateGuard<'a>,
}

impl<'a> StateSubscription<'a> {
    fn new(
        pipeline: Arc<dyn Pipeline>,
        handler: InvocationStateHandler,
        lock: SessionStateGuard<'a>,
    ) -> Self {
        pipeline.set_state_handler(Some(handler));
        Self {
            pipeline,
            _lock: lock,
        }
    }
}

impl Drop for StateSubscription<'_> {
    fn drop(&mut self) {
        self.pipeline.set_state_handler(None);
    }
}

struct PipelineOutcome {
    result: Result<Vec<PsValue>, EngineError>,
    stream_errors: Vec<ErrorRecord>,
}

impl PowerShellContext {
    pub async fn execute_command<T>(
        &self,
        command: PsCommand,
        options: ExecutionOptions,
    ) -> Result<CommandOutput<T>, EditorServicesError>
    where
        T: FromPsValue + Send + 'static,
    {
        self.execute_command_with_cancellation(command, options, &CancellationToken::new())
            .await
    }

    /// Runs `command` on whichever thread and pipeline currently own the
    /// session. `cancel` is only honored while waiting for the runspace.
    #[instrument(skip_all, fields(command = %command))]
    pub async fn execute_command_with_cancellation<T>(
        &self,
        command: PsCommand,
        options: ExecutionOptions,
        cancel: &CancellationToken,
    ) -> Result<CommandOutput<T>, EditorServicesError>
    where
        T: FromPsValue + Send + 'static,
    {
        if options.add_to_history {
            if let Some(history) = options.input_string.as_deref().or(command.first_text()) {
                self.inner.prompt_context.add_to_history(history);
            }
        }

        loop {
            match self
                .dispatch::<T>(command.clone(), options.clone(), cancel)
                .await
            {
                Err(EditorServicesError::FrameExited) if !self.inner.prompt_nest.is_disposed() => {
                    debug!(target: "execution", "frame exited before the command ran, dispatching again");
                }
                other => return other,
            }
        }
    }

    async fn dispatch<T>(
        &self,
        command: PsCommand,
        options: ExecutionOptions,
        cancel: &CancellationToken,
    ) -> Result<CommandOutput<T>, EditorServicesError>
    where
        T: FromPsValue + Send + 'static,
    {
        let nest = &self.inner.prompt_nest;

        if let Some(controller) = nest.get_thread_controller() {
            let marshal = !controller.is_current_thread()
                && !self.should_execute_with_eventing(&options)
                && !(nest.is_remote() && options.is_read_line);

            if marshal {
                debug!(target: "execution", owner = ?controller.owner_thread(), "passing command execution to pipeline thread");

                if options.should_cancel_read_line() && nest.is_read_line_busy() {
                    if let Some(input) = self.host_input() {
                        input.stop_command_loop();
                    }
                }

                let (request, result) =
                    CommandExecutionRequest::<T>::new(self.clone(), command, options);
                return controller
                    .request_pipeline_execution(Box::new(request), result)
                    .await?;
            }
        }

        self.execute_on_current_thread(command, options, cancel.clone())
            .await
    }

    pub(crate) fn should_execute_with_eventing(&self, options: &ExecutionOptions) -> bool {
        let nest = &self.inner.prompt_nest;
        self.inner.prompt_context.supports_eventing()
            && nest.is_read_line_busy()
            && nest.is_main_thread_busy()
            && !(options.write_output_to_host
                || options.interrupt_command_prompt
                || options.is_read_line
                || nest.is_remote())
    }

    pub(crate) fn execution_target(&self, options: &ExecutionOptions) -> ExecutionTarget {
        if self.should_execute_with_eventing(options) {
            return ExecutionTarget::InvocationEvent;
        }

        let nest = &self.inner.prompt_nest;
        if self.is_debugger_stopped()
            && nest.is_in_debugger()
            && !(options.is_read_line && nest.is_remote())
        {
            return ExecutionTarget::Debugger;
        }

        ExecutionTarget::PowerShell
    }

    fn output_command(&self) -> Command {
        if self.inner.prompt_nest.is_in_debugger() {
            Command::new_output_stream()
        } else {
            Command::new_out_default()
        }
    }

    pub(crate) async fn execute_on_current_thread<T>(
        &self,
        mut command: PsCommand,
        options: ExecutionOptions,
        cancel: CancellationToken,
    ) -> Result<CommandOutput<T>, EditorServicesError>
    where
        T: FromPsValue + Send + 'static,
    {
        if options.write_output_to_host {
            command.merge_errors_into_output();
            command.push(self.output_command());
        }

        let target = self.execution_target(&options);
        trace!(target: "execution", ?target, "selected execution target");

        if target == ExecutionTarget::InvocationEvent {
            return self
                .inner
                .invocation_event_queue
                .execute_command_on_idle::<T>(self, command, options)
                .await;
        }

        if !options.is_read_line {
            self.on_execution_status_changed(ExecutionStatus::Running, Some(&options), false);
        }

        let handle = match self
            .inner
            .prompt_nest
            .get_runspace_handle(
                Arc::clone(&self.current_runspace().runspace),
                options.is_read_line,
                self.is_current_runspace_out_of_process(),
                &cancel,
            )
            .await
        {
            Ok(handle) => handle,
            Err(error) => {
                debug!(target: "execution", %error, "could not acquire the runspace");
                if !options.is_read_line {
                    self.on_execution_status_changed(ExecutionStatus::Completed, Some(&options), false);
                }
                return Err(error);
            }
        };

        if options.write_input_to_host {
            let input = options
                .input_string
                .clone()
                .unwrap_or_else(|| command.first_text().unwrap_or_default().to_string());
            self.write_output(&input, true, OutputType::Normal);
        }

        let mut output = CommandOutput::<T>::default();
        let invoked = match target {
            ExecutionTarget::Debugger => self.invoke_in_debugger(&command, &options),
            _ => {
                let outcome = self.invoke_pipeline(&command, &options).await;
                if !outcome.stream_errors.is_empty() {
                    let report = format_error_report(&command, &outcome.stream_errors);
                    error!(target: "execution", "{report}");
                    output.had_errors = true;
                    output.append_error(&report);
                } else {
                    trace!(target: "execution", "execution completed successfully");
                }
                outcome.result
            }
        };

        let failure = self.collect_results(invoked, &options, &mut output);
        self.finish_execution(handle, target, &options, &output).await;
        match failure {
            Some(error) => Err(error),
            None => Ok(output),
        }
    }

    /// Sorts the invocation result into output, captured errors or a failure.
    fn collect_results<T>(
        &self,
        invoked: Result<Vec<PsValue>, EngineError>,
        options: &ExecutionOptions,
        output: &mut CommandOutput<T>,
    ) -> Option<EditorServicesError>
    where
        T: FromPsValue,
    {
        let failure = match invoked {
            Ok(values) => match values.into_iter().map(T::from_ps_value).collect() {
                Ok(results) => {
                    output.results = results;
                    return None;
                }
                Err(error) => EditorServicesError::from(error),
            },
            Err(error @ (EngineError::PipelineStopped(_) | EngineError::RemotingDataStructure(_))) => {
                info!(target: "execution", %error, "pipeline stopped while executing command");
                output.append_error(&error.to_string());
                return None;
            }
            Err(EngineError::Runtime { message, .. }) => {
                warn!(target: "execution", message, "runtime exception occurred while executing command");
                output.had_errors = true;
                output.append_error(&message);
                if options.write_errors_to_host {
                    self.write_output(&message, true, OutputType::Error);
                }
                return None;
            }
            Err(error) => EditorServicesError::from(error),
        };

        error!(target: "execution", error = %failure, "exception occurred while executing command");
        self.on_execution_status_changed(ExecutionStatus::Failed, Some(options), true);
        Some(failure)
    }

    async fn finish_execution<T>(
        &self,
        handle: RunspaceHandle,
        target: ExecutionTarget,
        options: &ExecutionOptions,
        output: &CommandOutput<T>,
    ) {
        let availability = self.current_runspace().runspace.availability();
        if availability == RunspaceAvailability::None {
            warn!(target: "execution", "runspace is no longer available, aborting and popping it");
            self.abort_execution(true).await;
            if let Err(error) = self.pop_runspace() {
                warn!(target: "execution", %error, "could not pop the unavailable runspace");
            }
        }

        if options.write_output_to_host {
            let details = match target {
                ExecutionTarget::Debugger => self.session_details_in_debugger(),
                _ if self.current_runspace().runspace.availability()
                    == RunspaceAvailability::Available =>
                {
                    self.session_details_in_runspace(handle.runspace())
                }
                _ => self.session_details_in_nested_pipeline(),
            };

            if let Some(details) = details {
                self.update_runspace_details_if_session_changed(details, false);
            }
        }

        drop(handle);

        if options.is_read_line {
            self.inner.invocation_event_queue.withdraw_pending();
        } else {
            self.on_execution_status_changed(
                ExecutionStatus::Completed,
                Some(options),
                output.had_errors,
            );
        }
    }

    fn state_handler(&self) -> InvocationStateHandler {
        let context = self.downgrade();
        Arc::new(move |info| {
            if let Some(context) = context.upgrade() {
                context.on_session_state_changed(SessionStateChangedEventArgs::from(info));
            }
        })
    }

    async fn invoke_pipeline(&self, command: &PsCommand, options: &ExecutionOptions) -> PipelineOutcome {
        let nest = &self.inner.prompt_nest;
        let pipeline = nest.get_pipeline(options.is_read_line);

        // The pipeline may still hold commands from an aborted run.
        pipeline.clear_commands();
        for command in command.commands() {
            pipeline.add_command(command.clone());
        }

        let _subscription = if options.is_read_line {
            None
        } else {
            let lock = self
                .inner
                .session_state_lock
                .acquire_for_execute_command(nest.nested_prompt_level())
                .await;
            Some(StateSubscription::new(
                Arc::clone(&pipeline),
                self.state_handler(),
                lock,
            ))
        };

        let runspace = if options.should_execute_in_original_runspace {
            Arc::clone(&self.inner.initial_runspace.runspace)
        } else {
            Arc::clone(&self.current_runspace().runspace)
        };
        pipeline.set_runspace(runspace);

        let settings = InvocationSettings {
            add_to_history: options.add_to_history,
        };
        let result = if pipeline.is_nested() {
            pipeline.invoke(&settings)
        } else {
            invoke_off_thread(Arc::clone(&pipeline), settings).await
        };

        let stream_errors = if pipeline.had_errors() {
            pipeline.take_errors()
        } else {
            Vec::new()
        };

        PipelineOutcome {
            result,
            stream_errors,
        }
    }

    fn invoke_in_debugger(
        &self,
        command: &PsCommand,
        options: &ExecutionOptions,
    ) -> Result<Vec<PsValue>, EngineError> {
        if !options.is_read_line {
            self.on_session_state_changed(SessionStateChangedEventArgs::new(
                SessionState::Running,
                PowerShellExecutionResult::NotFinished,
            ));
        }

        let runspace = Arc::clone(&self.current_runspace().runspace);
        let mut values = Vec::new();
        let result = self.inner.version_ops.execute_command_in_debugger(
            runspace.as_ref(),
            command,
            &mut |value| {
                if options.write_output_to_host {
                    self.write_output(&value.to_string(), true, OutputType::Normal);
                }
                values.push(value);
            },
        );

        let result = result.map(|results| {
            if let Some(action) = results.resume_action {
                debug!(target: "debugger", ?action, "debugger command resumed execution");
                self.resume_debugger_without_wait(action);
            }
            values
        });

        if !options.is_read_line {
            self.on_session_state_changed(SessionStateChangedEventArgs::new(
                SessionState::Ready,
                PowerShellExecutionResult::NotFinished,
            ));
        }

        result
    }

    pub(crate) fn session_details_in_runspace(
        &self,
        runspace: &Arc<dyn Runspace>,
    ) -> Option<SessionDetails> {
        self.session_details_from(&runspace.create_pipeline(PipelineKind::TopLevel))
    }

    pub(crate) fn session_details_in_nested_pipeline(&self) -> Option<SessionDetails> {
        let runspace = Arc::clone(&self.current_runspace().runspace);
        self.session_details_from(&runspace.create_pipeline(PipelineKind::Nested))
    }

    fn session_details_from(&self, pipeline: &Arc<dyn Pipeline>) -> Option<SessionDetails> {
        match probe_session_details(pipeline) {
            Ok(details) => details,
            Err(error) => {
                warn!(target: "session", %error, "failed to get session details");
                None
            }
        }
    }

    pub(crate) fn session_details_in_debugger(&self) -> Option<SessionDetails> {
        let runspace = Arc::clone(&self.current_runspace().runspace);
        let mut first = None;
        let result = self.inner.version_ops.execute_command_in_debugger(
            runspace.as_ref(),
            &SessionDetails::details_command(),
            &mut |value| {
                if first.is_none() {
                    first = Some(value);
                }
            },
        );

        match result {
            Ok(_) => first.as_ref().and_then(SessionDetails::from_ps_value),
            Err(error) => {
                warn!(target: "session", %error, "failed to get session details in the debugger");
                None
            }
        }
    }

    /// Waits for exclusive use of the current runspace outside of any
    /// command execution.
    pub async fn get_runspace_handle(
        &self,
        cancel: &CancellationToken,
    ) -> Result<RunspaceHandle, EditorServicesError> {
        self.inner
            .prompt_nest
            .get_runspace_handle(
                Arc::clone(&self.current_runspace().runspace),
                false,
                self.is_current_runspace_out_of_process(),
                cancel,
            )
            .await
    }

    pub fn release_runspace_handle(&self, handle: RunspaceHandle) {
        self.inner.prompt_nest.release_runspace_handle(handle);
    }

    /// Runs `action` with the current pipeline while the line editor is
    /// waiting for input.
    pub async fn invoke_on_pipeline_thread<F>(&self, action: F) -> Result<(), EditorServicesError>
    where
        F: FnOnce(&Arc<dyn Pipeline>) + Send + 'static,
    {
        self.inner
            .invocation_event_queue
            .invoke_on_pipeline_thread(self, action)
            .await
    }

    pub(crate) fn run_with_pipeline_blocking<F>(&self, action: F) -> Result<(), EditorServicesError>
    where
        F: FnOnce(&Arc<dyn Pipeline>),
    {
        let runspace = Arc::clone(&self.current_runspace().runspace);
        let handle = self.inner.prompt_nest.get_runspace_handle_blocking(
            Arc::clone(&runspace),
            false,
            self.is_current_runspace_out_of_process(),
        )?;

        let pipeline = self.inner.prompt_nest.get_pipeline(false);
        pipeline.set_runspace(runspace);
        action(&pipeline);
        drop(handle);
        Ok(())
    }

    pub(crate) fn on_idle(&self) {
        let runspace = Arc::clone(&self.current_runspace().runspace);
        self.inner
            .invocation_event_queue
            .on_idle(&self.inner.prompt_nest, &runspace);
    }

    pub async fn execute_script_string(
        &self,
        script: &str,
        write_input_to_host: bool,
        write_output_to_host: bool,
        add_to_history: bool,
    ) -> Result<Vec<PsValue>, EditorServicesError> {
        let options = ExecutionOptions::builder()
            .write_input_to_host(write_input_to_host)
            .write_output_to_host(write_output_to_host)
            .add_to_history(add_to_history)
            .build();

        self.execute_command::<PsValue>(PsCommand::from_script(script.trim()), options)
            .await
            .map(CommandOutput::into_results)
    }

    /// Runs a script file or command. With arguments, an existing script path
    /// is dot-sourced single-quoted so special characters survive.
    pub async fn execute_script_with_args(
        &self,
        script: &str,
        arguments: Option<&str>,
        write_input_to_host: bool,
    ) -> Result<(), EditorServicesError> {
        let command = match arguments {
            Some(arguments) => {
                let working_dir = self.current_location().await;
                let is_script_file = Path::new(script).is_file()
                    || working_dir.is_some_and(|dir| Path::new(&dir).join(script).is_file());

                let launched = if is_script_file {
                    format!(". {} {arguments}", quote_escape(script))
                } else {
                    format!("{script} {arguments}")
                };
                trace!(target: "execution", launched, "launch script");
                PsCommand::from_script(launched)
            }
            None => PsCommand::from_command(script),
        };

        if write_input_to_host {
            self.write_output(script, true, OutputType::Normal);
        }

        let options = ExecutionOptions::builder().add_to_history(true).build();
        self.execute_command::<PsValue>(command, options).await?;
        Ok(())
    }

    async fn current_location(&self) -> Option<String> {
        let command = PsCommand::from_script(
            "(Microsoft.PowerShell.Management\\Get-Location).ProviderPath",
        );
        match self
            .execute_command::<String>(command, ExecutionOptions::silent())
            .await
        {
            Ok(output) => output.results.into_iter().next(),
            Err(error) => {
                debug!(target: "execution", %error, "could not determine the working directory");
                None
            }
        }
    }

    /// Dot-sources every profile script that exists, in precedence order.
    pub async fn load_host_profiles(&self) -> Result<(), EditorServicesError> {
        let profiles: Vec<String> = self
            .inner
            .profile_paths
            .existing()
            .map(|path| path.display().to_string())
            .collect();

        for profile in profiles {
            info!(target: "session", profile, "loading profile");
            let command = PsCommand::from_script(format!(". {}", quote_escape(&profile)));
            self.execute_command::<PsValue>(command, ExecutionOptions::default())
                .await?;
        }
        Ok(())
    }

    pub async fn set_working_directory(
        &self,
        path: &str,
        is_path_already_escaped: bool,
    ) -> Result<(), EditorServicesError> {
        let parameter = if is_path_already_escaped {
            "Path"
        } else {
            "LiteralPath"
        };
        let command = PsCommand::from_command("Microsoft.PowerShell.Management\\Set-Location")
            .add_parameter(parameter, path);

        self.execute_command::<PsValue>(command, ExecutionOptions::silent())
            .await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::quote_escape;

    #[test]
    fn quote_escape_doubles_single_quotes() {
        assert_eq!(quote_escape("C:\\it's here.ps1"), "'C:\\it''s here.ps1'");
    }
}
