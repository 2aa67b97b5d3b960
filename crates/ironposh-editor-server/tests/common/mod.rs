#![allow(dead_code)]

use std::collections::VecDeque;
use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use ironposh_editor_core::PsValue;
use ironposh_editor_core::testing::FakeRunspace;
use ironposh_editor_server::notifications::NotificationSink;
use ironposh_editor_server::prompt_context::ReadLineProxy;
use ironposh_editor_core::PsCommand;

pub const READ_LINE: &str = "[Microsoft.PowerShell.PSConsoleReadLine]::ReadLine($Host.Runspace, $ExecutionContext)";

pub async fn within<F: Future>(future: F) -> F::Output {
    tokio::time::timeout(Duration::from_secs(5), future)
        .await
        .expect("timed out")
}

#[derive(Default)]
pub struct RecordingSink {
    sent: Mutex<Vec<(String, serde_json::Value)>>,
}

impl RecordingSink {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn named(&self, method: &str) -> Vec<serde_json::Value> {
        self.sent
            .lock()
            .unwrap()
            .iter()
            .filter(|(name, _)| name == method)
            .map(|(_, params)| params.clone())
            .collect()
    }
}

impl NotificationSink for RecordingSink {
    fn send_notification(&self, method: &str, params: serde_json::Value) {
        self.sent
            .lock()
            .unwrap()
            .push((method.to_string(), params));
    }
}

/// Line editor double: hands out queued lines, raising idle events while it
/// waits, and returns nothing when aborted.
#[derive(Default)]
pub struct FakeReadLine {
    lines: Mutex<VecDeque<String>>,
    history: Mutex<Vec<String>>,
    aborted: AtomicBool,
}

impl FakeReadLine {
    pub fn install(runspace: &FakeRunspace) -> Arc<Self> {
        let proxy = Arc::new(Self::default());
        let served = Arc::clone(&proxy);
        runspace.on_command(READ_LINE, move |call| {
            let deadline = Instant::now() + Duration::from_secs(5);
            loop {
                if let Some(line) = served.lines.lock().unwrap().pop_front() {
                    return Ok(vec![PsValue::from(line)]);
                }
                if served.aborted.swap(false, Ordering::SeqCst) || Instant::now() > deadline {
                    return Ok(Vec::new());
                }
                call.runspace.raise_idle();
                call.sleep(Duration::from_millis(5))?;
            }
        });
        proxy
    }

    pub fn type_line(&self, line: &str) {
        self.lines.lock().unwrap().push_back(line.to_string());
    }

    pub fn history(&self) -> Vec<String> {
        self.history.lock().unwrap().clone()
    }
}

impl ReadLineProxy for FakeReadLine {
    fn read_line_command(&self) -> PsCommand {
        PsCommand::from_script(READ_LINE)
    }

    fn add_to_history(&self, command: &str) {
        self.history.lock().unwrap().push(command.to_string());
    }

    fn force_event_handling(&self) {}

    fn abort_read_line(&self) {
        self.aborted.store(true, Ordering::SeqCst);
    }
}
