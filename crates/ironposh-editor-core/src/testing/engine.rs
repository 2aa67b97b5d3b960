use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicI32, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, Weak};
use std::thread::{self, ThreadId};
use std::time::Duration;

use uuid::Uuid;

use crate::engine::{
    BreakpointUpdatedEventArgs, Command, DebugModes, Debugger, DebuggerCommandResults,
    DebuggerResumeAction, DebuggerStopEventArgs, EngineError, ErrorRecord, InvocationSettings,
    InvocationStateHandler, InvocationStateInfo, Parameter, Pipeline, PipelineKind,
    PowerShellVersion, PsCommand, PsInvocationState, PsObject, PsValue, Runspace,
    RunspaceAvailability, RunspaceEventSink, RunspaceState,
};
use crate::session::SessionDetails;

pub const BASE_PROCESS_ID: i32 = 1000;

type Handler = Arc<dyn Fn(&FakeCall<'_>) -> Result<Vec<PsValue>, EngineError> + Send + Sync>;

/// One command the fake engine ran.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InvocationRecord {
    pub text: String,
    pub thread: ThreadId,
    pub nested: bool,
    pub in_debugger: bool,
    pub target: Option<Uuid>,
}

/// What a scripted handler sees of the invocation it serves.
pub struct FakeCall<'a> {
    pub text: &'a str,
    pub command: &'a Command,
    pub runspace: &'a FakeRunspace,
    pub nested: bool,
    stopped: &'a AtomicBool,
    errors: Option<&'a Mutex<Vec<ErrorRecord>>>,
}

impl FakeCall<'_> {
    pub fn is_stopped(&self) -> bool {
        self.stopped.load(Ordering::SeqCst)
    }

    /// Sleeps in small steps, failing as a stopped pipeline would.
    pub fn sleep(&self, duration: Duration) -> Result<(), EngineError> {
        let step = Duration::from_millis(5);
        let mut waited = Duration::ZERO;
        while waited < duration {
            if self.is_stopped() {
                return Err(EngineError::PipelineStopped(
                    "The pipeline has been stopped.".to_string(),
                ));
            }
            thread::sleep(step);
            waited += step;
        }
        Ok(())
    }
}

fn argument(command: &Command, text: &str, name: &str) -> Option<String> {
    let from_parameters = command.parameters.iter().find_map(|parameter| match parameter {
        Parameter::Named { name: n, value } if n.eq_ignore_ascii_case(name) => {
            Some(value.to_string())
        }
        Parameter::Positional { value } => Some(value.to_string()),
        _ => None,
    });

    from_parameters.or_else(|| {
        let rest = text.split_once(' ')?.1.trim();
        let rest = rest
            .strip_prefix(&format!("-{name}"))
            .map_or(rest, str::trim);
        Some(rest.trim_matches(|c| c == '\'' || c == '"').to_string())
    })
}

fn parse_sum(text: &str) -> Option<i32> {
    let expression = text.trim().strip_prefix("return").unwrap_or(text).trim();
    let (left, right) = expression.split_once('+')?;
    Some(left.trim().parse::<i32>().ok()? + right.trim().parse::<i32>().ok()?)
}

fn is_output_sink(command: &Command) -> bool {
    command.command_text.eq_ignore_ascii_case("Out-Default")
        || command.command_text.eq_ignore_ascii_case("Out-String")
}

/// In-memory engine runspace with scriptable commands.
pub struct FakeRunspace {
    this: Weak<FakeRunspace>,
    instance_id: Uuid,
    host_instance_id: Uuid,
    process_id: AtomicI32,
    computer_name: String,
    remote: bool,
    version: PowerShellVersion,
    availability: Mutex<Option<RunspaceAvailability>>,
    debugger: Arc<FakeDebugger>,
    sink: Mutex<Option<Arc<dyn RunspaceEventSink>>>,
    handlers: Mutex<HashMap<String, Handler>>,
    invocations: Mutex<Vec<InvocationRecord>>,
    active: AtomicUsize,
    max_active: AtomicUsize,
    closed: AtomicBool,
    location: Mutex<String>,
}

impl FakeRunspace {
    pub fn new() -> Arc<Self> {
        Self::build("localhost", false, PowerShellVersion::new(7, 4, "Core"))
    }

    pub fn remote(computer_name: &str) -> Arc<Self> {
        Self::build(computer_name, true, PowerShellVersion::new(7, 4, "Core"))
    }

    pub fn with_version(major: u32, minor: u32) -> Arc<Self> {
        Self::build("localhost", false, PowerShellVersion::new(major, minor, "Desktop"))
    }

    fn build(computer_name: &str, remote: bool, version: PowerShellVersion) -> Arc<Self> {
        Arc::new_cyclic(|this: &Weak<Self>| Self {
            this: this.clone(),
            instance_id: Uuid::new_v4(),
            host_instance_id: Uuid::new_v4(),
            process_id: AtomicI32::new(BASE_PROCESS_ID),
            computer_name: computer_name.to_string(),
            remote,
            version,
            availability: Mutex::new(None),
            debugger: Arc::new(FakeDebugger::new(this.clone())),
            sink: Mutex::new(None),
            handlers: Mutex::new(HashMap::new()),
            invocations: Mutex::new(Vec::new()),
            active: AtomicUsize::new(0),
            max_active: AtomicUsize::new(0),
            closed: AtomicBool::new(false),
            location: Mutex::new("/home/user".to_string()),
        })
    }

    /// Scripts the command whose first pipeline element has this exact text.
    pub fn on_command<F>(&self, text: impl Into<String>, handler: F)
    where
        F: Fn(&FakeCall<'_>) -> Result<Vec<PsValue>, EngineError> + Send + Sync + 'static,
    {
        self.handlers
            .lock()
            .expect("fake handlers poisoned")
            .insert(text.into(), Arc::new(handler));
    }

    pub fn set_availability(&self, availability: Option<RunspaceAvailability>) {
        *self.availability.lock().expect("fake availability poisoned") = availability;
    }

    pub fn process_id(&self) -> i32 {
        self.process_id.load(Ordering::SeqCst)
    }

    pub fn set_process_id(&self, process_id: i32) {
        self.process_id.store(process_id, Ordering::SeqCst);
    }

    pub fn location(&self) -> String {
        self.location.lock().expect("fake location poisoned").clone()
    }

    pub fn fake_debugger(&self) -> &Arc<FakeDebugger> {
        &self.debugger
    }

    pub fn invocations(&self) -> Vec<InvocationRecord> {
        self.invocations
            .lock()
            .expect("fake invocations poisoned")
            .clone()
    }

    /// Invocations whose text matches `text`, in order.
    pub fn invocations_of(&self, text: &str) -> Vec<InvocationRecord> {
        self.invocations()
            .into_iter()
            .filter(|record| record.text == text)
            .collect()
    }

    pub fn max_concurrent_invocations(&self) -> usize {
        self.max_active.load(Ordering::SeqCst)
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    pub fn has_event_sink(&self) -> bool {
        self.sink.lock().expect("fake sink poisoned").is_some()
    }

    fn sink(&self) -> Option<Arc<dyn RunspaceEventSink>> {
        self.sink.lock().expect("fake sink poisoned").clone()
    }

    /// Raises the line editor's idle event on the calling thread.
    pub fn raise_idle(&self) {
        if let Some(sink) = self.sink() {
            sink.on_idle();
        }
    }

    pub fn raise_state_changed(&self, state: RunspaceState) {
        if let Some(sink) = self.sink() {
            sink.on_state_changed(state);
        }
    }

    pub fn raise_push_runspace(&self, runspace: Arc<dyn Runspace>) {
        if let Some(sink) = self.sink() {
            sink.on_push_runspace(runspace);
        }
    }

    pub fn raise_breakpoint_updated(&self, args: BreakpointUpdatedEventArgs) {
        if let Some(sink) = self.sink() {
            sink.on_breakpoint_updated(args);
        }
    }

    pub fn raise_pop_runspace(&self) {
        if let Some(sink) = self.sink() {
            sink.on_pop_runspace();
        }
    }

    fn session_details(&self) -> PsValue {
        PsValue::from(
            PsObject::new()
                .with_property("computerName", self.computer_name.clone())
                .with_property("processId", self.process_id())
                .with_property("instanceId", self.host_instance_id),
        )
    }

    fn record(&self, text: &str, nested: bool, in_debugger: bool, target: Option<Uuid>) {
        self.invocations
            .lock()
            .expect("fake invocations poisoned")
            .push(InvocationRecord {
                text: text.to_string(),
                thread: thread::current().id(),
                nested,
                in_debugger,
                target,
            });
    }

    /// Evaluates the first command of a pipeline.
    fn evaluate(
        &self,
        commands: &[Command],
        nested: bool,
        stopped: &AtomicBool,
        errors: Option<&Mutex<Vec<ErrorRecord>>>,
    ) -> Result<Vec<PsValue>, EngineError> {
        let Some(command) = commands.iter().find(|command| !is_output_sink(command)) else {
            return Ok(Vec::new());
        };
        let text = command.command_text.trim();

        let handler = self
            .handlers
            .lock()
            .expect("fake handlers poisoned")
            .get(text)
            .cloned();
        if let Some(handler) = handler {
            return handler(&FakeCall {
                text,
                command,
                runspace: self,
                nested,
                stopped,
                errors,
            });
        }

        if text == SessionDetails::details_command().first_text().unwrap_or_default() {
            return Ok(vec![self.session_details()]);
        }
        if let Some(sum) = parse_sum(text) {
            return Ok(vec![PsValue::from(sum)]);
        }

        let verb = text.split_whitespace().next().unwrap_or_default();
        match verb {
            "Write-Error" => {
                let message = argument(command, text, "Message").unwrap_or_default();
                if let Some(errors) = errors {
                    errors
                        .lock()
                        .expect("fake error stream poisoned")
                        .push(ErrorRecord::new(message));
                }
                Ok(Vec::new())
            }
            "throw" => Err(EngineError::runtime(
                argument(command, text, "Message").unwrap_or_default(),
            )),
            "Wait-Debugger" => {
                self.debugger.trigger_breakpoint(DebuggerStopEventArgs {
                    script_name: Some("fake.ps1".to_string()),
                    line: Some(1),
                    column: Some(1),
                    breakpoint_ids: Vec::new(),
                });
                Ok(Vec::new())
            }
            "$Host.EnterNestedPrompt()" => {
                if let Some(sink) = self.sink() {
                    sink.on_enter_nested_prompt();
                }
                Ok(Vec::new())
            }
            "exit" if nested => {
                if let Some(sink) = self.sink() {
                    sink.on_exit_nested_prompt();
                }
                Ok(Vec::new())
            }
            "Enter-PSHostProcess" => {
                let id = argument(command, text, "Id")
                    .and_then(|id| id.parse().ok())
                    .ok_or_else(|| EngineError::runtime("Enter-PSHostProcess needs -Id"))?;
                self.set_process_id(id);
                Ok(Vec::new())
            }
            "Exit-PSHostProcess" => {
                self.set_process_id(BASE_PROCESS_ID);
                Ok(Vec::new())
            }
            "Start-Sleep" => {
                let millis = argument(command, text, "Milliseconds")
                    .and_then(|ms| ms.parse().ok())
                    .unwrap_or(50);
                FakeCall {
                    text,
                    command,
                    runspace: self,
                    nested,
                    stopped,
                    errors,
                }
                .sleep(Duration::from_millis(millis))?;
                Ok(Vec::new())
            }
            "(Microsoft.PowerShell.Management\\Get-Location).ProviderPath" => {
                Ok(vec![PsValue::from(self.location())])
            }
            "Microsoft.PowerShell.Management\\Set-Location" => {
                if let Some(path) = argument(command, text, "LiteralPath")
                    .or_else(|| argument(command, text, "Path"))
                {
                    *self.location.lock().expect("fake location poisoned") = path;
                }
                Ok(Vec::new())
            }
            _ => Ok(Vec::new()),
        }
    }
}

impl Runspace for FakeRunspace {
    fn instance_id(&self) -> Uuid {
        self.instance_id
    }

    fn availability(&self) -> RunspaceAvailability {
        self.availability
            .lock()
            .expect("fake availability poisoned")
            .unwrap_or(RunspaceAvailability::Available)
    }

    fn state(&self) -> RunspaceState {
        if self.is_closed() {
            RunspaceState::Closed
        } else {
            RunspaceState::Opened
        }
    }

    fn is_remote(&self) -> bool {
        self.remote
    }

    fn computer_name(&self) -> Option<String> {
        Some(self.computer_name.clone())
    }

    fn version(&self) -> PowerShellVersion {
        self.version.clone()
    }

    fn debugger(&self) -> Option<Arc<dyn Debugger>> {
        Some(Arc::clone(&self.debugger) as Arc<dyn Debugger>)
    }

    fn create_pipeline(&self, kind: PipelineKind) -> Arc<dyn Pipeline> {
        Arc::new(FakePipeline {
            owner: self.this.clone(),
            nested: kind == PipelineKind::Nested,
            commands: Mutex::new(Vec::new()),
            target: Mutex::new(None),
            handler: Mutex::new(None),
            state: Mutex::new(PsInvocationState::NotStarted),
            stopped: AtomicBool::new(false),
            errors: Mutex::new(Vec::new()),
        })
    }

    fn attach_event_sink(&self, sink: Arc<dyn RunspaceEventSink>) {
        *self.sink.lock().expect("fake sink poisoned") = Some(sink);
    }

    fn detach_event_sink(&self) {
        *self.sink.lock().expect("fake sink poisoned") = None;
    }

    fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
    }
}

pub struct FakePipeline {
    owner: Weak<FakeRunspace>,
    nested: bool,
    commands: Mutex<Vec<Command>>,
    target: Mutex<Option<Arc<dyn Runspace>>>,
    handler: Mutex<Option<InvocationStateHandler>>,
    state: Mutex<PsInvocationState>,
    stopped: AtomicBool,
    errors: Mutex<Vec<ErrorRecord>>,
}

impl FakePipeline {
    fn set_state(&self, state: PsInvocationState, reason: Option<EngineError>) {
        *self.state.lock().expect("fake pipeline state poisoned") = state;
        let handler = self
            .handler
            .lock()
            .expect("fake pipeline handler poisoned")
            .clone();
        if let Some(handler) = handler {
            handler(&InvocationStateInfo { state, reason });
        }
    }
}

impl Pipeline for FakePipeline {
    fn is_nested(&self) -> bool {
        self.nested
    }

    fn clear_commands(&self) {
        self.commands.lock().expect("fake commands poisoned").clear();
    }

    fn add_command(&self, command: Command) {
        self.commands
            .lock()
            .expect("fake commands poisoned")
            .push(command);
    }

    fn set_runspace(&self, runspace: Arc<dyn Runspace>) {
        *self.target.lock().expect("fake target poisoned") = Some(runspace);
    }

    fn set_state_handler(&self, handler: Option<InvocationStateHandler>) {
        *self.handler.lock().expect("fake pipeline handler poisoned") = handler;
    }

    fn invoke(&self, _settings: &InvocationSettings) -> Result<Vec<PsValue>, EngineError> {
        let owner = self
            .owner
            .upgrade()
            .ok_or_else(|| EngineError::InvalidOperation("runspace dropped".to_string()))?;
        let commands = self.commands.lock().expect("fake commands poisoned").clone();
        let target = self
            .target
            .lock()
            .expect("fake target poisoned")
            .as_ref()
            .map(|runspace| runspace.instance_id());

        self.stopped.store(false, Ordering::SeqCst);
        self.errors.lock().expect("fake error stream poisoned").clear();

        let text = commands
            .iter()
            .find(|command| !is_output_sink(command))
            .map(|command| command.command_text.clone())
            .unwrap_or_default();
        owner.record(&text, self.nested, false, target);

        let active = owner.active.fetch_add(1, Ordering::SeqCst) + 1;
        if !self.nested {
            owner.max_active.fetch_max(active, Ordering::SeqCst);
        }

        self.set_state(PsInvocationState::Running, None);
        let result = owner.evaluate(&commands, self.nested, &self.stopped, Some(&self.errors));
        owner.active.fetch_sub(1, Ordering::SeqCst);

        match &result {
            Ok(_) => self.set_state(PsInvocationState::Completed, None),
            Err(EngineError::PipelineStopped(_)) => self.set_state(PsInvocationState::Stopped, None),
            Err(error) => self.set_state(PsInvocationState::Failed, Some(error.clone())),
        }
        result
    }

    fn stop(&self) {
        self.stopped.store(true, Ordering::SeqCst);
    }

    fn invocation_state(&self) -> PsInvocationState {
        *self.state.lock().expect("fake pipeline state poisoned")
    }

    fn had_errors(&self) -> bool {
        !self.errors.lock().expect("fake error stream poisoned").is_empty()
    }

    fn take_errors(&self) -> Vec<ErrorRecord> {
        std::mem::take(&mut *self.errors.lock().expect("fake error stream poisoned"))
    }
}

/// Debugger of a [`FakeRunspace`]. Understands the single-letter debugger
/// commands and otherwise evaluates like the runspace does.
pub struct FakeDebugger {
    runspace: Weak<FakeRunspace>,
    in_breakpoint: AtomicBool,
    step_mode: AtomicBool,
    debug_mode: Mutex<Option<DebugModes>>,
    stop_requests: AtomicUsize,
    last_resume: Mutex<Option<DebuggerResumeAction>>,
}

impl FakeDebugger {
    fn new(runspace: Weak<FakeRunspace>) -> Self {
        Self {
            runspace,
            in_breakpoint: AtomicBool::new(false),
            step_mode: AtomicBool::new(false),
            debug_mode: Mutex::new(None),
            stop_requests: AtomicUsize::new(0),
            last_resume: Mutex::new(None),
        }
    }

    /// Breaks on the calling thread and blocks until resumed.
    pub fn trigger_breakpoint(&self, args: DebuggerStopEventArgs) -> DebuggerResumeAction {
        let sink = self.runspace.upgrade().and_then(|runspace| runspace.sink());
        let Some(sink) = sink else {
            return DebuggerResumeAction::Continue;
        };

        self.in_breakpoint.store(true, Ordering::SeqCst);
        let action = sink.on_debugger_stop(args);
        self.in_breakpoint.store(false, Ordering::SeqCst);

        *self.last_resume.lock().expect("fake resume poisoned") = Some(action);
        action
    }

    /// Ends the break without a resume action, as detaching would.
    pub fn leave_breakpoint(&self) {
        self.in_breakpoint.store(false, Ordering::SeqCst);
    }

    pub fn last_resume_action(&self) -> Option<DebuggerResumeAction> {
        *self.last_resume.lock().expect("fake resume poisoned")
    }

    pub fn step_mode(&self) -> bool {
        self.step_mode.load(Ordering::SeqCst)
    }

    pub fn debug_mode(&self) -> Option<DebugModes> {
        *self.debug_mode.lock().expect("fake debug mode poisoned")
    }

    pub fn stop_requests(&self) -> usize {
        self.stop_requests.load(Ordering::SeqCst)
    }
}

impl Debugger for FakeDebugger {
    fn process_command(
        &self,
        command: &PsCommand,
        output: &mut dyn FnMut(PsValue),
    ) -> Result<DebuggerCommandResults, EngineError> {
        let runspace = self
            .runspace
            .upgrade()
            .ok_or_else(|| EngineError::InvalidOperation("runspace dropped".to_string()))?;
        let text = command.first_text().unwrap_or_default().trim().to_string();
        runspace.record(&text, true, true, None);

        let resume_action = match text.as_str() {
            "c" | "continue" => Some(DebuggerResumeAction::Continue),
            "s" | "stepInto" => Some(DebuggerResumeAction::StepInto),
            "v" | "stepOver" => Some(DebuggerResumeAction::StepOver),
            "o" | "stepOut" => Some(DebuggerResumeAction::StepOut),
            "q" | "quit" => Some(DebuggerResumeAction::Stop),
            _ => None,
        };

        if resume_action.is_none() {
            let stopped = AtomicBool::new(false);
            for value in runspace.evaluate(command.commands(), true, &stopped, None)? {
                output(value);
            }
        }

        Ok(DebuggerCommandResults {
            resume_action,
            evaluated_by_debugger: resume_action.is_some(),
        })
    }

    fn stop_process_command(&self) {
        self.stop_requests.fetch_add(1, Ordering::SeqCst);
    }

    fn in_breakpoint(&self) -> bool {
        self.in_breakpoint.load(Ordering::SeqCst)
    }

    fn set_debugger_step_mode(&self, enabled: bool) {
        self.step_mode.store(enabled, Ordering::SeqCst);
    }

    fn set_debug_mode(&self, mode: DebugModes) {
        *self.debug_mode.lock().expect("fake debug mode poisoned") = Some(mode);
    }
}
