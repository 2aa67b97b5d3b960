mod common;

use std::sync::Arc;

use ironposh_editor_core::host::OutputType;
use ironposh_editor_core::testing::{FakeRunspace, HostLog, RecordingHost, wait_until};
use ironposh_editor_core::{DebuggerResumeAction, ExecutionOptions, PsCommand, PsValue};
use ironposh_editor_core::engine::PsObject;
use ironposh_editor_server::EditorServices;
use ironposh_editor_server::config::EditorServicesConfig;
use ironposh_editor_server::debug_adapter::{CONTINUED_EVENT, DebugAdapterRequest, STOPPED_EVENT};
use ironposh_editor_server::notifications::{EXECUTION_STATUS_CHANGED, RUNSPACE_CHANGED};
use ironposh_editor_server::prompt_context::{ConsoleReader, ReadLinePromptContext};
use ironposh_editor_server::requests::{EvaluateContext, evaluate, get_completions};

use tracing_test::traced_test;

use common::{FakeReadLine, READ_LINE, RecordingSink, within};

async fn start_without_console(
    runspace: &Arc<FakeRunspace>,
    sink: &Arc<RecordingSink>,
) -> EditorServices {
    EditorServices::start(
        &EditorServicesConfig::default(),
        Arc::clone(runspace) as _,
        RecordingHost::new(HostLog::default()),
        None,
        Arc::clone(sink) as _,
    )
    .await
    .unwrap()
}

#[tokio::test(flavor = "multi_thread")]
async fn forwards_status_and_runspace_changes() {
    let runspace = FakeRunspace::new();
    let sink = RecordingSink::new();
    let services = start_without_console(&runspace, &sink).await;

    within(services.context().execute_script_string(
        "Enter-PSHostProcess -Id 42",
        false,
        true,
        false,
    ))
    .await
    .unwrap();

    wait_until("runspace change", || !sink.named(RUNSPACE_CHANGED).is_empty()).await;
    assert_eq!(sink.named(RUNSPACE_CHANGED)[0]["runspaceType"], "Process");

    wait_until("completion status", || {
        sink.named(EXECUTION_STATUS_CHANGED)
            .iter()
            .any(|params| params["executionStatus"] == "Completed")
    })
    .await;
    let statuses: Vec<_> = sink
        .named(EXECUTION_STATUS_CHANGED)
        .into_iter()
        .map(|params| params["executionStatus"].clone())
        .collect();
    assert_eq!(statuses, vec!["Running", "Completed"]);

    services.shutdown();
    assert!(runspace.is_closed());
}

#[tokio::test(flavor = "multi_thread")]
async fn imports_configured_modules_at_startup() {
    let runspace = FakeRunspace::new();
    let sink = RecordingSink::new();
    let config = EditorServicesConfig {
        additional_modules: vec!["PowerShellEditorServices.Commands".to_string()],
        ..Default::default()
    };

    let services = EditorServices::start(
        &config,
        Arc::clone(&runspace) as _,
        RecordingHost::new(HostLog::default()),
        None,
        Arc::clone(&sink) as _,
    )
    .await
    .unwrap();

    assert_eq!(
        runspace
            .invocations_of("Microsoft.PowerShell.Core\\Import-Module")
            .len(),
        1
    );
    assert!(services.console().is_none());
    services.shutdown();
}

#[tokio::test(flavor = "multi_thread")]
async fn console_reads_runs_and_restarts() {
    let runspace = FakeRunspace::new();
    runspace.on_command("prompt", |_| Ok(vec![PsValue::from("PS /home/user> ")]));
    let proxy = FakeReadLine::install(&runspace);
    let log = HostLog::default();
    let sink = RecordingSink::new();
    let config = EditorServicesConfig {
        enable_console_repl: true,
        ..Default::default()
    };

    let services = EditorServices::start(
        &config,
        Arc::clone(&runspace) as _,
        RecordingHost::new(log.clone()),
        Some(ConsoleReader::ReadLine(ReadLinePromptContext::new(
            Arc::clone(&proxy) as _,
        ))),
        Arc::clone(&sink) as _,
    )
    .await
    .unwrap();

    let context = services.context().clone();
    wait_until("first read", || context.prompt_nest().is_read_line_busy()).await;
    assert!(services.console().unwrap().is_running());

    proxy.type_line("2 + 2");
    wait_until("command ran", || runspace.invocations_of("2 + 2").len() == 1).await;
    wait_until("second read", || runspace.invocations_of(READ_LINE).len() >= 2).await;

    assert_eq!(proxy.history(), vec!["2 + 2".to_string()]);
    let prompts = log
        .outputs(OutputType::Normal)
        .into_iter()
        .filter(|text| text == "PS /home/user> ")
        .count();
    assert!(prompts >= 2);

    services.shutdown();
}

#[tokio::test(flavor = "multi_thread")]
async fn completions_run_inside_the_waiting_line_editor() {
    let runspace = FakeRunspace::new();
    runspace.on_command("TabExpansion2", |_| {
        Ok(vec![PsValue::from(
            PsObject::new()
                .with_property("ReplacementIndex", 0)
                .with_property("ReplacementLength", 7)
                .with_property(
                    "CompletionMatch0",
                    PsObject::new()
                        .with_property("CompletionText", "Get-Date")
                        .with_property("ListItemText", "Get-Date")
                        .with_property("ResultType", "Command"),
                ),
        )])
    });
    let proxy = FakeReadLine::install(&runspace);
    let config = EditorServicesConfig {
        enable_console_repl: true,
        ..Default::default()
    };

    let services = EditorServices::start(
        &config,
        Arc::clone(&runspace) as _,
        RecordingHost::new(HostLog::default()),
        Some(ConsoleReader::ReadLine(ReadLinePromptContext::new(
            Arc::clone(&proxy) as _,
        ))),
        RecordingSink::new() as _,
    )
    .await
    .unwrap();

    let context = services.context().clone();
    wait_until("read line", || context.prompt_nest().is_read_line_busy()).await;

    let completions = within(get_completions(&context, "Get-Dat", 7)).await.unwrap();
    assert_eq!(completions.replacement_length, 7);
    assert_eq!(completions.matches.len(), 1);
    assert_eq!(completions.matches[0].completion_text, "Get-Date");

    let reader = runspace.invocations_of(READ_LINE)[0].thread;
    let completion = &runspace.invocations_of("TabExpansion2")[0];
    assert!(completion.nested);
    assert_eq!(completion.thread, reader);

    services.shutdown();
}

#[tokio::test(flavor = "multi_thread")]
async fn hover_evaluation_returns_rendered_values() {
    let runspace = FakeRunspace::new();
    let sink = RecordingSink::new();
    let services = start_without_console(&runspace, &sink).await;

    let response = within(evaluate(services.context(), "40 + 2", EvaluateContext::Hover))
        .await
        .unwrap();
    assert_eq!(response.result, "42");

    services.shutdown();
}

#[tokio::test(flavor = "multi_thread")]
async fn debug_adapter_steps_and_reports_events() {
    let runspace = FakeRunspace::new();
    let sink = RecordingSink::new();
    let services = start_without_console(&runspace, &sink).await;
    let bridge = services.debug_adapter();
    let _events = bridge.forward_events(Arc::clone(&sink) as _);

    let script = {
        let context = services.context().clone();
        tokio::spawn(async move {
            context
                .execute_command::<PsValue>(
                    PsCommand::from_script("Wait-Debugger"),
                    ExecutionOptions::silent(),
                )
                .await
        })
    };

    wait_until("stopped event", || !sink.named(STOPPED_EVENT).is_empty()).await;
    let stopped = &sink.named(STOPPED_EVENT)[0];
    assert_eq!(stopped["reason"], "step");
    assert_eq!(stopped["source"], "fake.ps1");
    assert_eq!(stopped["threadId"], 1);

    within(bridge.handle(DebugAdapterRequest::Next)).await;
    within(script).await.unwrap().unwrap();

    wait_until("continued event", || !sink.named(CONTINUED_EVENT).is_empty()).await;
    assert_eq!(
        runspace.fake_debugger().last_resume_action(),
        Some(DebuggerResumeAction::StepOver)
    );
    assert!(!services.context().is_debugger_stopped());

    services.shutdown();
}

#[tokio::test(flavor = "multi_thread")]
#[traced_test]
async fn step_requests_without_a_stop_are_ignored() {
    let runspace = FakeRunspace::new();
    let sink = RecordingSink::new();
    let services = start_without_console(&runspace, &sink).await;

    within(services.debug_adapter().handle(DebugAdapterRequest::Continue)).await;
    assert_eq!(runspace.fake_debugger().last_resume_action(), None);
    assert!(logs_contain("debugger is not stopped"));

    services.shutdown();
}
