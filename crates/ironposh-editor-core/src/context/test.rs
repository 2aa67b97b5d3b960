use std::future::Future;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use futures::channel::mpsc::UnboundedReceiver;
use futures::{FutureExt, StreamExt};
use tokio_util::sync::CancellationToken;
use tracing_test::traced_test;

use super::*;
use crate::engine::{
    BreakpointUpdateType, BreakpointUpdatedEventArgs, DebugModes, DebuggerResumeAction,
    DebuggerStopEventArgs, EngineError, PsCommand, PsObject, PsValue, RunspaceAvailability,
    RunspaceState,
};
use crate::testing::{
    BASE_PROCESS_ID, FakeRunspace, HostEvent, HostLog, RecordingHost, RecordingPromptContext,
    wait_until,
};
use crate::session::{RunspaceChangeAction, RunspaceContext, RunspaceLocation, SessionDetails};

struct Harness {
    runspace: Arc<FakeRunspace>,
    context: PowerShellContext,
    log: HostLog,
}

fn harness_with(runspace: Arc<FakeRunspace>, supports_eventing: bool) -> Harness {
    let log = HostLog::default();
    let host = RecordingHost::new(log.clone());
    let context = PowerShellContext::new(
        PowerShellContextConfig::builder()
            .initial_runspace(runspace.clone())
            .host_output(host.clone())
            .host_input(host)
            .prompt_context(RecordingPromptContext::new(log.clone(), supports_eventing))
            .build(),
    )
    .unwrap();

    Harness {
        runspace,
        context,
        log,
    }
}

fn harness() -> Harness {
    harness_with(FakeRunspace::new(), false)
}

async fn within<F: Future>(future: F) -> F::Output {
    tokio::time::timeout(Duration::from_secs(5), future)
        .await
        .expect("operation timed out")
}

fn drain<T>(rx: &mut UnboundedReceiver<T>) -> Vec<T> {
    let mut items = Vec::new();
    while let Some(Some(item)) = rx.next().now_or_never() {
        items.push(item);
    }
    items
}

/// Answers the session details script with whatever identity the test sets.
#[derive(Clone)]
struct ScriptedIdentity(Arc<std::sync::Mutex<SessionDetails>>);

impl ScriptedIdentity {
    fn install(runspace: &FakeRunspace) -> Self {
        let identity = Self(Arc::new(std::sync::Mutex::new(SessionDetails {
            process_id: Some(BASE_PROCESS_ID),
            computer_name: Some("localhost".to_string()),
            instance_id: Some(uuid::Uuid::new_v4()),
        })));

        let reported = identity.clone();
        let script = SessionDetails::details_command()
            .first_text()
            .unwrap_or_default()
            .to_string();
        runspace.on_command(script, move |_| Ok(vec![reported.value()]));
        identity
    }

    fn get(&self) -> SessionDetails {
        self.0.lock().unwrap().clone()
    }

    fn set(&self, details: SessionDetails) {
        *self.0.lock().unwrap() = details;
    }

    fn value(&self) -> PsValue {
        let details = self.get();
        let mut object = PsObject::new();
        if let Some(computer_name) = details.computer_name {
            object = object.with_property("computerName", computer_name);
        }
        if let Some(process_id) = details.process_id {
            object = object.with_property("processId", process_id);
        }
        if let Some(instance_id) = details.instance_id {
            object = object.with_property("instanceId", instance_id);
        }
        PsValue::from(object)
    }
}

#[tokio::test(flavor = "multi_thread")]
#[traced_test]
async fn two_plus_two_is_four() {
    let Harness { context, .. } = harness();
    let mut statuses = context.events().execution_status_changed.subscribe();

    let output = within(context.execute_command::<i32>(
        PsCommand::from_script("2 + 2"),
        ExecutionOptions::silent(),
    ))
    .await
    .unwrap();

    assert_eq!(output.results, vec![4]);
    assert!(!output.had_errors);
    assert!(output.error_messages.is_empty());
    assert_eq!(context.session_state(), SessionState::Ready);

    let statuses: Vec<_> = drain(&mut statuses)
        .into_iter()
        .map(|args| args.execution_status)
        .collect();
    assert_eq!(
        statuses,
        vec![ExecutionStatus::Running, ExecutionStatus::Completed]
    );
}

#[tokio::test(flavor = "multi_thread")]
async fn stream_errors_are_captured_without_failing() {
    let Harness { context, .. } = harness();

    let output = within(context.execute_command::<PsValue>(
        PsCommand::from_script("Write-Error 'boom'"),
        ExecutionOptions::default(),
    ))
    .await
    .unwrap();

    assert!(output.had_errors);
    assert!(
        output
            .error_messages
            .starts_with("Execution of the following command(s) completed with errors:")
    );
    assert!(output.error_messages.contains("boom"));
}

#[tokio::test(flavor = "multi_thread")]
async fn runtime_errors_are_reported_to_the_host() {
    let Harness { context, log, .. } = harness();

    let output = within(context.execute_command::<PsValue>(
        PsCommand::from_script("throw 'bad things'"),
        ExecutionOptions::default(),
    ))
    .await
    .unwrap();

    assert!(output.had_errors);
    assert_eq!(output.error_messages, "bad things");
    assert_eq!(log.outputs(OutputType::Error), vec!["bad things".to_string()]);
}

#[tokio::test(flavor = "multi_thread")]
async fn unexpected_engine_failure_fails_the_call() {
    let Harness {
        runspace, context, ..
    } = harness();
    runspace.on_command("Break-Engine", |_| {
        Err(EngineError::InvalidOperation("engine fell over".to_string()))
    });
    let mut statuses = context.events().execution_status_changed.subscribe();

    let result = within(context.execute_command::<PsValue>(
        PsCommand::from_command("Break-Engine"),
        ExecutionOptions::silent(),
    ))
    .await;

    assert!(matches!(
        result,
        Err(EditorServicesError::Engine(EngineError::InvalidOperation(_)))
    ));

    let statuses: Vec<_> = drain(&mut statuses)
        .into_iter()
        .map(|args| args.execution_status)
        .collect();
    assert_eq!(
        statuses,
        vec![
            ExecutionStatus::Running,
            ExecutionStatus::Failed,
            ExecutionStatus::Completed
        ]
    );
}

#[tokio::test(flavor = "multi_thread")]
async fn conversion_failure_fails_the_call() {
    let Harness { context, .. } = harness();

    let result = within(context.execute_command::<bool>(
        PsCommand::from_script("1 + 1"),
        ExecutionOptions::silent(),
    ))
    .await;

    assert!(matches!(result, Err(EditorServicesError::Conversion(_))));
}

#[tokio::test(flavor = "multi_thread")]
async fn concurrent_commands_never_overlap() {
    let Harness {
        runspace, context, ..
    } = harness();

    let tasks: Vec<_> = (0..4)
        .map(|_| {
            let context = context.clone();
            tokio::spawn(async move {
                context
                    .execute_command::<PsValue>(
                        PsCommand::from_script("Start-Sleep -Milliseconds 30"),
                        ExecutionOptions::silent(),
                    )
                    .await
            })
        })
        .collect();

    for task in tasks {
        within(task).await.unwrap().unwrap();
    }

    assert_eq!(
        runspace
            .invocations_of("Start-Sleep -Milliseconds 30")
            .len(),
        4
    );
    assert_eq!(runspace.max_concurrent_invocations(), 1);
}

#[tokio::test(flavor = "multi_thread")]
async fn waiting_commands_run_in_arrival_order() {
    let Harness {
        runspace, context, ..
    } = harness();

    let held = context
        .get_runspace_handle(&CancellationToken::new())
        .await
        .unwrap();

    let mut tasks = Vec::new();
    for script in ["1 + 0", "2 + 0", "3 + 0"] {
        let context = context.clone();
        tasks.push(tokio::spawn(async move {
            context
                .execute_command::<i32>(PsCommand::from_script(script), ExecutionOptions::silent())
                .await
        }));
        tokio::time::sleep(Duration::from_millis(30)).await;
    }

    assert!(runspace.invocations_of("1 + 0").is_empty());
    context.release_runspace_handle(held);

    let mut results = Vec::new();
    for task in tasks {
        results.extend(within(task).await.unwrap().unwrap().results);
    }
    assert_eq!(results, vec![1, 2, 3]);

    let order: Vec<_> = runspace
        .invocations()
        .into_iter()
        .map(|record| record.text)
        .filter(|text| text.ends_with("+ 0"))
        .collect();
    assert_eq!(order, vec!["1 + 0", "2 + 0", "3 + 0"]);
}

#[tokio::test(flavor = "multi_thread")]
async fn history_is_recorded_even_when_the_wait_is_cancelled() {
    let Harness { context, log, .. } = harness();

    let _held = context
        .get_runspace_handle(&CancellationToken::new())
        .await
        .unwrap();

    let cancel = CancellationToken::new();
    let pending = {
        let context = context.clone();
        let cancel = cancel.clone();
        tokio::spawn(async move {
            context
                .execute_command_with_cancellation::<PsValue>(
                    PsCommand::from_command("Get-Process"),
                    ExecutionOptions::builder().add_to_history(true).build(),
                    &cancel,
                )
                .await
        })
    };

    tokio::time::sleep(Duration::from_millis(20)).await;
    cancel.cancel();

    let result = within(pending).await.unwrap();
    assert!(matches!(result, Err(EditorServicesError::Cancelled)));
    assert_eq!(log.history(), vec!["Get-Process".to_string()]);
}

#[tokio::test(flavor = "multi_thread")]
async fn input_string_is_echoed_and_used_for_history() {
    let Harness { context, log, .. } = harness();

    within(
        context.execute_command::<PsValue>(
            PsCommand::from_script("1 + 2"),
            ExecutionOptions::builder()
                .write_input_to_host(true)
                .add_to_history(true)
                .input_string("one plus two")
                .build(),
        ),
    )
    .await
    .unwrap();

    assert_eq!(log.history(), vec!["one plus two".to_string()]);
    assert!(
        log.outputs(OutputType::Normal)
            .contains(&"one plus two".to_string())
    );
}

#[tokio::test(flavor = "multi_thread")]
async fn output_commands_pause_and_restart_the_console_loop() {
    let Harness { context, log, .. } = harness();

    within(context.execute_command::<PsValue>(
        PsCommand::from_script("1 + 2"),
        ExecutionOptions::default(),
    ))
    .await
    .unwrap();

    let loop_events: Vec<_> = log
        .events()
        .into_iter()
        .filter(|event| {
            matches!(
                event,
                HostEvent::StartCommandLoop | HostEvent::StopCommandLoop
            )
        })
        .collect();
    assert_eq!(
        loop_events,
        vec![HostEvent::StopCommandLoop, HostEvent::StartCommandLoop]
    );
}

#[tokio::test(flavor = "multi_thread")]
#[traced_test]
async fn debugger_stop_services_requests_until_resumed() {
    let Harness {
        runspace, context, ..
    } = harness();
    let mut stops = context.events().debugger_stop.subscribe();
    let mut resumes = context.events().debugger_resumed.subscribe();

    let script = {
        let context = context.clone();
        tokio::spawn(async move {
            context
                .execute_command::<PsValue>(
                    PsCommand::from_script("Wait-Debugger"),
                    ExecutionOptions::silent(),
                )
                .await
        })
    };

    wait_until("debugger stop", || context.prompt_nest().is_in_debugger()).await;
    assert!(context.is_debugger_stopped());
    assert!(context.current_debugger_stop_event_args().is_some());
    assert_eq!(
        within(stops.next()).await.unwrap().script_name.as_deref(),
        Some("fake.ps1")
    );

    let output = within(context.execute_command::<i32>(
        PsCommand::from_script("return 2 + 3"),
        ExecutionOptions::silent(),
    ))
    .await
    .unwrap();
    assert_eq!(output.results, vec![5]);
    assert!(context.prompt_nest().is_in_debugger());
    assert!(!script.is_finished());

    let stopped_on = runspace.invocations_of("Wait-Debugger")[0].thread;
    let evaluated = &runspace.invocations_of("return 2 + 3")[0];
    assert!(evaluated.in_debugger);
    assert_eq!(evaluated.thread, stopped_on);

    within(context.resume_debugger(DebuggerResumeAction::StepOver)).await;
    within(script).await.unwrap().unwrap();

    assert_eq!(
        within(resumes.next()).await,
        Some(DebuggerResumeAction::StepOver)
    );
    assert_eq!(
        runspace.fake_debugger().last_resume_action(),
        Some(DebuggerResumeAction::StepOver)
    );
    assert!(!context.prompt_nest().is_in_debugger());
    assert!(context.current_debugger_stop_event_args().is_none());
    assert_eq!(context.prompt_nest().nested_prompt_level(), 1);
}

#[tokio::test(flavor = "multi_thread")]
async fn debugger_command_can_resume_the_stop() {
    let Harness {
        runspace, context, ..
    } = harness();

    let script = {
        let context = context.clone();
        tokio::spawn(async move {
            context
                .execute_command::<PsValue>(
                    PsCommand::from_script("Wait-Debugger"),
                    ExecutionOptions::silent(),
                )
                .await
        })
    };
    wait_until("debugger stop", || context.prompt_nest().is_in_debugger()).await;

    within(context.execute_command::<PsValue>(
        PsCommand::from_script("c"),
        ExecutionOptions::default(),
    ))
    .await
    .unwrap();

    within(script).await.unwrap().unwrap();
    assert_eq!(
        runspace.fake_debugger().last_resume_action(),
        Some(DebuggerResumeAction::Continue)
    );
    assert!(!context.prompt_nest().is_in_debugger());
}

#[tokio::test(flavor = "multi_thread")]
async fn leaving_the_break_from_a_request_ends_the_stop() {
    let Harness {
        runspace, context, ..
    } = harness();
    runspace.on_command("Detach-Debugger", |call| {
        call.runspace.fake_debugger().leave_breakpoint();
        Ok(Vec::new())
    });
    let mut resumes = context.events().debugger_resumed.subscribe();

    let script = {
        let context = context.clone();
        tokio::spawn(async move {
            context
                .execute_command::<PsValue>(
                    PsCommand::from_script("Wait-Debugger"),
                    ExecutionOptions::silent(),
                )
                .await
        })
    };
    wait_until("debugger stop", || context.prompt_nest().is_in_debugger()).await;

    within(context.execute_command::<PsValue>(
        PsCommand::from_script("Detach-Debugger"),
        ExecutionOptions::silent(),
    ))
    .await
    .unwrap();

    within(script).await.unwrap().unwrap();
    assert!(runspace.invocations_of("Detach-Debugger")[0].in_debugger);
    assert_eq!(
        runspace.fake_debugger().last_resume_action(),
        Some(DebuggerResumeAction::Continue)
    );
    assert!(!context.prompt_nest().is_in_debugger());
    assert!(drain(&mut resumes).is_empty());
}

#[tokio::test(flavor = "multi_thread")]
async fn resume_without_a_stop_is_a_no_op() {
    let Harness { context, .. } = harness();

    within(context.resume_debugger(DebuggerResumeAction::Continue)).await;
    assert_eq!(context.prompt_nest().nested_prompt_level(), 1);
}

#[tokio::test(flavor = "multi_thread")]
async fn nested_prompt_round_trip() {
    let Harness {
        runspace, context, ..
    } = harness();
    let depth_before = context.prompt_nest().nested_prompt_level();

    let script = {
        let context = context.clone();
        tokio::spawn(async move {
            context
                .execute_command::<PsValue>(
                    PsCommand::from_script("$Host.EnterNestedPrompt()"),
                    ExecutionOptions::silent(),
                )
                .await
        })
    };

    wait_until("nested prompt", || context.prompt_nest().is_nested_prompt()).await;
    assert_eq!(context.prompt_nest().nested_prompt_level(), depth_before + 1);

    let output = within(context.execute_command::<i32>(
        PsCommand::from_script("40 + 2"),
        ExecutionOptions::silent(),
    ))
    .await
    .unwrap();
    assert_eq!(output.results, vec![42]);

    let owner = runspace.invocations_of("$Host.EnterNestedPrompt()")[0].thread;
    let nested = &runspace.invocations_of("40 + 2")[0];
    assert!(nested.nested);
    assert_eq!(nested.thread, owner);

    context.exit_nested_prompt();
    within(script).await.unwrap().unwrap();

    assert_eq!(context.prompt_nest().nested_prompt_level(), depth_before);
    assert_eq!(context.session_state(), SessionState::Ready);
}

#[tokio::test(flavor = "multi_thread")]
async fn exit_typed_in_a_nested_prompt_leaves_it() {
    let Harness { context, .. } = harness();

    let script = {
        let context = context.clone();
        tokio::spawn(async move {
            context
                .execute_command::<PsValue>(
                    PsCommand::from_script("$Host.EnterNestedPrompt()"),
                    ExecutionOptions::silent(),
                )
                .await
        })
    };
    wait_until("nested prompt", || context.prompt_nest().is_nested_prompt()).await;

    within(context.execute_command::<PsValue>(
        PsCommand::from_script("exit"),
        ExecutionOptions::silent(),
    ))
    .await
    .unwrap();

    within(script).await.unwrap().unwrap();
    assert!(!context.prompt_nest().is_nested_prompt());
}

#[tokio::test(flavor = "multi_thread")]
async fn idle_event_runs_commands_while_reading_a_line() {
    let Harness {
        runspace,
        context,
        log,
    } = harness_with(FakeRunspace::new(), true);

    let done = Arc::new(AtomicBool::new(false));
    {
        let done = Arc::clone(&done);
        runspace.on_command("PSConsoleHostReadLine", move |call| {
            while !done.load(Ordering::SeqCst) {
                call.runspace.raise_idle();
                call.sleep(Duration::from_millis(5))?;
            }
            Ok(vec![PsValue::from("typed")])
        });
    }

    let read_line = {
        let context = context.clone();
        tokio::spawn(async move {
            context
                .execute_command::<String>(
                    PsCommand::from_command("PSConsoleHostReadLine"),
                    ExecutionOptions::builder()
                        .is_read_line(true)
                        .write_output_to_host(false)
                        .build(),
                )
                .await
        })
    };

    wait_until("read-line", || context.prompt_nest().is_read_line_busy()).await;
    assert!(context.prompt_nest().is_main_thread_busy());

    let output = within(context.execute_command::<i32>(
        PsCommand::from_script("20 + 22"),
        ExecutionOptions::silent(),
    ))
    .await
    .unwrap();
    assert_eq!(output.results, vec![42]);
    assert!(log.count(&HostEvent::ForceEventHandling) >= 1);

    let reader = runspace.invocations_of("PSConsoleHostReadLine")[0].thread;
    let evaluated = &runspace.invocations_of("20 + 22")[0];
    assert!(evaluated.nested);
    assert_eq!(evaluated.thread, reader);

    done.store(true, Ordering::SeqCst);
    let typed = within(read_line).await.unwrap().unwrap();
    assert_eq!(typed.results, vec!["typed".to_string()]);
    assert_eq!(context.prompt_nest().nested_prompt_level(), 1);
}

#[tokio::test(flavor = "multi_thread")]
async fn idle_request_is_dispatched_again_when_read_line_returns_first() {
    let Harness {
        runspace,
        context,
        log,
    } = harness_with(FakeRunspace::new(), true);

    let done = Arc::new(AtomicBool::new(false));
    {
        let done = Arc::clone(&done);
        runspace.on_command("PSConsoleHostReadLine", move |call| {
            while !done.load(Ordering::SeqCst) {
                call.sleep(Duration::from_millis(5))?;
            }
            Ok(vec![PsValue::from("typed")])
        });
    }

    let read_line = {
        let context = context.clone();
        tokio::spawn(async move {
            context
                .execute_command::<String>(
                    PsCommand::from_command("PSConsoleHostReadLine"),
                    ExecutionOptions::builder()
                        .is_read_line(true)
                        .write_output_to_host(false)
                        .build(),
                )
                .await
        })
    };
    wait_until("read-line", || context.prompt_nest().is_read_line_busy()).await;

    let evaluation = {
        let context = context.clone();
        tokio::spawn(async move {
            context
                .execute_command::<i32>(
                    PsCommand::from_script("20 + 22"),
                    ExecutionOptions::silent(),
                )
                .await
        })
    };
    wait_until("idle request", || log.count(&HostEvent::ForceEventHandling) >= 1).await;

    done.store(true, Ordering::SeqCst);
    within(read_line).await.unwrap().unwrap();

    let output = within(evaluation).await.unwrap().unwrap();
    assert_eq!(output.results, vec![42]);
    assert!(!runspace.invocations_of("20 + 22")[0].nested);
}

#[tokio::test(flavor = "multi_thread")]
async fn pipeline_thread_actions_need_eventing() {
    let Harness { context, .. } = harness();

    let result = within(context.invoke_on_pipeline_thread(|_| {})).await;
    assert!(matches!(result, Err(EditorServicesError::EventingUnavailable)));
}

#[tokio::test(flavor = "multi_thread")]
async fn entering_a_host_process_pushes_once_and_pops_on_exit() {
    let Harness {
        runspace, context, ..
    } = harness();
    let mut changes = context.events().runspace_changed.subscribe();

    within(context.execute_command::<PsValue>(
        PsCommand::from_script("Enter-PSHostProcess -Id 4242"),
        ExecutionOptions::default(),
    ))
    .await
    .unwrap();

    assert_eq!(context.runspace_stack_depth(), 1);
    let current = context.current_runspace();
    assert_eq!(current.context, RunspaceContext::EnteredProcess);
    assert_eq!(current.session_details.process_id, Some(4242));
    assert!(context.is_current_runspace_out_of_process());

    within(context.execute_command::<PsValue>(
        PsCommand::from_script("1 + 1"),
        ExecutionOptions::default(),
    ))
    .await
    .unwrap();
    assert_eq!(context.runspace_stack_depth(), 1);

    within(context.execute_command::<PsValue>(
        PsCommand::from_script("Exit-PSHostProcess"),
        ExecutionOptions::default(),
    ))
    .await
    .unwrap();

    assert_eq!(runspace.process_id(), BASE_PROCESS_ID);
    assert_eq!(context.runspace_stack_depth(), 0);
    assert_eq!(context.current_runspace().context, RunspaceContext::Original);

    let actions: Vec<_> = drain(&mut changes)
        .into_iter()
        .map(|args| args.change_action)
        .collect();
    assert_eq!(
        actions,
        vec![RunspaceChangeAction::Enter, RunspaceChangeAction::Exit]
    );
}

#[tokio::test(flavor = "multi_thread")]
async fn host_process_that_swaps_the_host_instance_still_pops_on_exit() {
    let runspace = FakeRunspace::new();
    let identity = ScriptedIdentity::install(&runspace);
    let original = identity.get();
    {
        let identity = identity.clone();
        let original = original.clone();
        runspace.on_command("Enter-PSHostProcess -Id 4242", move |_| {
            identity.set(SessionDetails {
                process_id: Some(4242),
                instance_id: Some(uuid::Uuid::new_v4()),
                ..original.clone()
            });
            Ok(Vec::new())
        });
    }
    {
        let identity = identity.clone();
        runspace.on_command("Exit-PSHostProcess", move |_| {
            identity.set(original.clone());
            Ok(Vec::new())
        });
    }

    let Harness { context, .. } = harness_with(runspace, false);
    let mut changes = context.events().runspace_changed.subscribe();

    for _ in 0..3 {
        within(context.execute_command::<PsValue>(
            PsCommand::from_script("Enter-PSHostProcess -Id 4242"),
            ExecutionOptions::default(),
        ))
        .await
        .unwrap();

        assert_eq!(context.runspace_stack_depth(), 1);
        assert_eq!(context.current_runspace().context, RunspaceContext::EnteredProcess);
        assert!(context.is_current_runspace_out_of_process());

        within(context.execute_command::<PsValue>(
            PsCommand::from_script("Exit-PSHostProcess"),
            ExecutionOptions::default(),
        ))
        .await
        .unwrap();

        assert_eq!(context.runspace_stack_depth(), 0);
        assert_eq!(context.current_runspace().context, RunspaceContext::Original);
    }

    let actions: Vec<_> = drain(&mut changes)
        .into_iter()
        .map(|args| args.change_action)
        .collect();
    assert_eq!(
        actions,
        [RunspaceChangeAction::Enter, RunspaceChangeAction::Exit].repeat(3)
    );
}

/// Breaks while the host reports `attached_computer` under a new host
/// instance. Returns the runspace seen during the stop and the change
/// actions raised up to the first command after the stop.
async fn attach_in_debugger(
    attached_computer: &str,
) -> (RunspaceDetails, Vec<RunspaceChangeAction>) {
    let runspace = FakeRunspace::new();
    let identity = ScriptedIdentity::install(&runspace);
    let original = identity.get();
    let attached = SessionDetails {
        computer_name: Some(attached_computer.to_string()),
        instance_id: Some(uuid::Uuid::new_v4()),
        ..original.clone()
    };
    {
        let identity = identity.clone();
        runspace.on_command("Wait-Debugger", move |call| {
            identity.set(attached.clone());
            call.runspace
                .fake_debugger()
                .trigger_breakpoint(DebuggerStopEventArgs::default());
            identity.set(original.clone());
            Ok(Vec::new())
        });
    }

    let Harness { context, .. } = harness_with(runspace, false);
    let mut changes = context.events().runspace_changed.subscribe();

    let script = {
        let context = context.clone();
        tokio::spawn(async move {
            context
                .execute_command::<PsValue>(
                    PsCommand::from_script("Wait-Debugger"),
                    ExecutionOptions::silent(),
                )
                .await
        })
    };
    wait_until("attached runspace", || context.runspace_stack_depth() == 1).await;
    let during_stop = context.current_runspace();

    within(context.resume_debugger(DebuggerResumeAction::Continue)).await;
    within(script).await.unwrap().unwrap();

    within(context.execute_command::<PsValue>(
        PsCommand::from_script("1 + 1"),
        ExecutionOptions::default(),
    ))
    .await
    .unwrap();
    assert_eq!(context.runspace_stack_depth(), 0);

    let actions = drain(&mut changes)
        .into_iter()
        .map(|args| args.change_action)
        .collect();
    (during_stop, actions)
}

#[tokio::test(flavor = "multi_thread")]
async fn new_host_instance_in_the_debugger_is_a_local_debugged_runspace() {
    let (attached, actions) = attach_in_debugger("localhost").await;

    assert_eq!(attached.context, RunspaceContext::DebuggedRunspace);
    assert_eq!(attached.location, RunspaceLocation::Local);
    assert_eq!(attached.connection_string, None);
    assert_eq!(
        actions,
        vec![RunspaceChangeAction::Enter, RunspaceChangeAction::Exit]
    );
}

#[tokio::test(flavor = "multi_thread")]
async fn debugged_runspace_on_another_computer_is_remote() {
    let (attached, actions) = attach_in_debugger("server02").await;

    assert_eq!(attached.context, RunspaceContext::DebuggedRunspace);
    assert_eq!(attached.location, RunspaceLocation::Remote);
    assert_eq!(attached.connection_string.as_deref(), Some("server02"));
    assert_eq!(
        actions,
        vec![RunspaceChangeAction::Enter, RunspaceChangeAction::Exit]
    );
}

#[tokio::test(flavor = "multi_thread")]
async fn unavailable_runspace_is_aborted_and_popped() {
    let Harness {
        runspace,
        context,
        log,
    } = harness();

    within(context.execute_command::<PsValue>(
        PsCommand::from_script("Enter-PSHostProcess -Id 4242"),
        ExecutionOptions::default(),
    ))
    .await
    .unwrap();
    assert_eq!(context.runspace_stack_depth(), 1);

    runspace.on_command("Crash-Host", |call| {
        call.runspace
            .set_availability(Some(RunspaceAvailability::None));
        Ok(Vec::new())
    });
    let mut changes = context.events().runspace_changed.subscribe();
    let mut statuses = context.events().execution_status_changed.subscribe();

    within(context.execute_command::<PsValue>(
        PsCommand::from_command("Crash-Host"),
        ExecutionOptions::silent(),
    ))
    .await
    .unwrap();

    assert_eq!(context.runspace_stack_depth(), 0);
    let popped = drain(&mut changes);
    assert_eq!(popped.len(), 1);
    assert_eq!(popped[0].change_action, RunspaceChangeAction::Exit);
    assert_eq!(
        popped[0].previous_runspace.context,
        RunspaceContext::EnteredProcess
    );

    assert!(
        drain(&mut statuses)
            .iter()
            .any(|args| args.execution_status == ExecutionStatus::Aborted)
    );
    assert_eq!(log.count(&HostEvent::AbortReadLine), 1);
    assert_eq!(context.session_state(), SessionState::Ready);
}

#[tokio::test(flavor = "multi_thread")]
async fn abort_stops_the_running_command() {
    let Harness {
        runspace, context, ..
    } = harness();

    let script = {
        let context = context.clone();
        tokio::spawn(async move {
            context
                .execute_command::<PsValue>(
                    PsCommand::from_script("Start-Sleep -Milliseconds 3000"),
                    ExecutionOptions::silent(),
                )
                .await
        })
    };

    wait_until("sleep to start", || {
        !runspace
            .invocations_of("Start-Sleep -Milliseconds 3000")
            .is_empty()
    })
    .await;

    within(context.abort_execution(false)).await;
    let output = tokio::time::timeout(Duration::from_secs(1), script)
        .await
        .expect("command was not stopped")
        .unwrap()
        .unwrap();

    assert!(output.error_messages.contains("stopped"));
    assert_eq!(context.session_state(), SessionState::Ready);
}

#[tokio::test(flavor = "multi_thread")]
async fn aborting_the_debug_session_stops_the_break() {
    let Harness {
        runspace, context, ..
    } = harness();

    let script = {
        let context = context.clone();
        tokio::spawn(async move {
            context
                .execute_command::<PsValue>(
                    PsCommand::from_script("Wait-Debugger"),
                    ExecutionOptions::silent(),
                )
                .await
        })
    };
    wait_until("debugger stop", || context.prompt_nest().is_in_debugger()).await;

    let abort = {
        let context = context.clone();
        tokio::spawn(async move { context.abort_execution(true).await })
    };
    within(abort).await.unwrap();
    within(script).await.unwrap().unwrap();

    assert_eq!(
        runspace.fake_debugger().last_resume_action(),
        Some(DebuggerResumeAction::Stop)
    );
    assert!(runspace.fake_debugger().stop_requests() >= 1);
    assert!(!context.prompt_nest().is_in_debugger());
    assert_eq!(context.prompt_nest().nested_prompt_level(), 1);
    assert_eq!(context.session_state(), SessionState::Ready);
}

#[tokio::test(flavor = "multi_thread")]
async fn interactive_session_from_the_engine_is_tracked() {
    let Harness {
        runspace, context, ..
    } = harness();
    let remote = FakeRunspace::remote("server01");

    runspace.raise_push_runspace(remote.clone());

    let current = context.current_runspace();
    assert_eq!(current.location, RunspaceLocation::Remote);
    assert_eq!(current.connection_string.as_deref(), Some("server01"));
    assert_eq!(current.context, RunspaceContext::Original);
    assert!(remote.has_event_sink());
    assert!(!runspace.has_event_sink());

    within(context.execute_command::<i32>(
        PsCommand::from_script("5 + 5"),
        ExecutionOptions::silent(),
    ))
    .await
    .unwrap();
    assert_eq!(
        runspace.invocations_of("5 + 5")[0].target,
        Some(remote.instance_id())
    );

    remote.raise_state_changed(RunspaceState::Broken);

    assert_eq!(context.runspace_stack_depth(), 0);
    assert!(!remote.has_event_sink());
    assert!(runspace.has_event_sink());
}

#[tokio::test(flavor = "multi_thread")]
async fn engine_pop_of_an_interactive_session() {
    let Harness {
        runspace, context, ..
    } = harness();
    let remote = FakeRunspace::remote("server02");

    runspace.raise_push_runspace(remote.clone());
    assert_eq!(context.runspace_stack_depth(), 1);

    remote.raise_pop_runspace();
    assert_eq!(context.runspace_stack_depth(), 0);
    assert_eq!(context.current_runspace().location, RunspaceLocation::Local);
}

#[test]
fn popping_the_initial_runspace_is_refused() {
    let Harness { context, .. } = harness();

    assert!(matches!(
        context.pop_runspace(),
        Err(EditorServicesError::InvalidState(_))
    ));
}

#[tokio::test(flavor = "multi_thread")]
async fn breakpoint_updates_are_forwarded() {
    let Harness {
        runspace, context, ..
    } = harness();
    let mut updates = context.events().breakpoint_updated.subscribe();

    let args = BreakpointUpdatedEventArgs {
        breakpoint_id: 3,
        update_type: BreakpointUpdateType::Set,
        script: Some("script.ps1".to_string()),
        line: Some(10),
    };
    runspace.raise_breakpoint_updated(args.clone());

    assert_eq!(within(updates.next()).await, Some(args));
}

#[test]
fn modern_engines_get_debug_modes_and_step_breaks() {
    let Harness {
        runspace, context, ..
    } = harness();

    assert_eq!(
        runspace.fake_debugger().debug_mode(),
        Some(DebugModes::LOCAL_SCRIPT | DebugModes::REMOTE_SCRIPT)
    );

    context.break_execution();
    assert!(runspace.fake_debugger().step_mode());
}

#[test]
fn legacy_engines_cannot_break() {
    let Harness {
        runspace, context, ..
    } = harness_with(FakeRunspace::with_version(3, 0), false);

    assert_eq!(runspace.fake_debugger().debug_mode(), None);

    context.break_execution();
    assert!(!runspace.fake_debugger().step_mode());
}

#[tokio::test(flavor = "multi_thread")]
async fn script_string_returns_values() {
    let Harness { context, .. } = harness();

    let values = within(context.execute_script_string("  6 + 1  ", false, false, false))
        .await
        .unwrap();
    assert_eq!(values, vec![PsValue::from(7)]);
}

#[tokio::test(flavor = "multi_thread")]
async fn script_files_with_arguments_are_dot_sourced() {
    let Harness {
        runspace, context, ..
    } = harness();
    let script = std::env::temp_dir().join(format!("{}.ps1", uuid::Uuid::new_v4()));
    std::fs::write(&script, "param($Name)").unwrap();
    let script = script.display().to_string();

    within(context.execute_script_with_args(&script, Some("-Name it's"), false))
        .await
        .unwrap();
    within(context.execute_script_with_args("Get-Thing", Some("-Force"), false))
        .await
        .unwrap();
    within(context.execute_script_with_args("Get-Other", None, false))
        .await
        .unwrap();

    assert_eq!(
        runspace
            .invocations_of(&format!(". '{script}' -Name it's"))
            .len(),
        1
    );
    assert_eq!(runspace.invocations_of("Get-Thing -Force").len(), 1);
    assert_eq!(runspace.invocations_of("Get-Other").len(), 1);

    let _ = std::fs::remove_file(&script);
}

#[tokio::test(flavor = "multi_thread")]
async fn working_directory_is_set_literally() {
    let Harness {
        runspace, context, ..
    } = harness();

    within(context.set_working_directory("/src/[project]", false))
        .await
        .unwrap();
    assert_eq!(runspace.location(), "/src/[project]");
}

#[tokio::test(flavor = "multi_thread")]
async fn existing_profiles_are_loaded_in_order() {
    let runspace = FakeRunspace::new();
    let dir = std::env::temp_dir();
    let all_users = dir.join(format!("{}-all.ps1", uuid::Uuid::new_v4()));
    let current_user = dir.join(format!("{}-me.ps1", uuid::Uuid::new_v4()));
    std::fs::write(&all_users, "").unwrap();
    std::fs::write(&current_user, "").unwrap();

    let context = PowerShellContext::new(
        PowerShellContextConfig::builder()
            .initial_runspace(runspace.clone())
            .profile_paths(ProfilePaths {
                all_users_all_hosts: Some(all_users.clone()),
                all_users_current_host: Some(dir.join("missing-profile.ps1")),
                current_user_all_hosts: None,
                current_user_current_host: Some(current_user.clone()),
            })
            .build(),
    )
    .unwrap();

    within(context.load_host_profiles()).await.unwrap();

    let loaded: Vec<_> = runspace
        .invocations()
        .into_iter()
        .map(|record| record.text)
        .filter(|text| text.starts_with(". '"))
        .collect();
    assert_eq!(
        loaded,
        vec![
            format!(". '{}'", all_users.display()),
            format!(". '{}'", current_user.display()),
        ]
    );

    let _ = std::fs::remove_file(all_users);
    let _ = std::fs::remove_file(current_user);
}

#[tokio::test(flavor = "multi_thread")]
async fn dispose_leaves_entered_sessions_and_refuses_work() {
    let Harness {
        runspace, context, ..
    } = harness();

    within(context.execute_command::<PsValue>(
        PsCommand::from_script("Enter-PSHostProcess -Id 4242"),
        ExecutionOptions::default(),
    ))
    .await
    .unwrap();
    let mut changes = context.events().runspace_changed.subscribe();

    context.dispose();

    assert_eq!(context.session_state(), SessionState::Disposed);
    assert_eq!(runspace.invocations_of("Exit-PSHostProcess").len(), 1);
    assert!(!runspace.is_closed());

    let shutdowns: Vec<_> = drain(&mut changes)
        .into_iter()
        .map(|args| (args.change_action, args.previous_runspace.context))
        .collect();
    assert_eq!(
        shutdowns,
        vec![
            (
                RunspaceChangeAction::Shutdown,
                RunspaceContext::EnteredProcess
            ),
            (RunspaceChangeAction::Shutdown, RunspaceContext::Original),
        ]
    );

    let result = within(context.execute_command::<PsValue>(
        PsCommand::from_script("1 + 1"),
        ExecutionOptions::silent(),
    ))
    .await;
    assert!(matches!(result, Err(EditorServicesError::Disposed)));
}

#[test]
fn owned_initial_runspace_is_closed_on_dispose() {
    let runspace = FakeRunspace::new();
    let context = PowerShellContext::new(
        PowerShellContextConfig::builder()
            .initial_runspace(runspace.clone())
            .owns_initial_runspace(true)
            .build(),
    )
    .unwrap();

    context.dispose();
    assert!(runspace.is_closed());
    assert!(!runspace.has_event_sink());
}
