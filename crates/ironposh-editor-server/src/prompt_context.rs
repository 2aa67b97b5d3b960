//! Line editors the console loop reads commands with.
//!
//! `ReadLinePromptContext` drives a PSReadLine-style editor that runs inside
//! the engine as a read-line pipeline and raises idle events.
//! `LegacyPromptContext` reads plain lines from the terminal and has no
//! eventing.

use std::io::BufRead;
use std::sync::{Arc, Mutex};

use anyhow::Context;
use ironposh_editor_core::host::PromptContext;
use ironposh_editor_core::{ExecutionOptions, PowerShellContext, PsCommand};
use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace};

/// Engine-side handle on the line editor module.
pub trait ReadLineProxy: Send + Sync {
    /// Command that blocks in the engine until the user submits a line.
    fn read_line_command(&self) -> PsCommand;

    fn add_to_history(&self, command: &str);

    fn force_event_handling(&self);

    /// Makes a pending read return immediately.
    fn abort_read_line(&self);
}

pub struct ReadLinePromptContext {
    proxy: Arc<dyn ReadLineProxy>,
}

impl ReadLinePromptContext {
    pub fn new(proxy: Arc<dyn ReadLineProxy>) -> Arc<Self> {
        Arc::new(Self { proxy })
    }

    /// Runs the line editor as a read-line pipeline. `cancel` is honored
    /// while waiting for the runspace.
    pub async fn invoke_read_line(
        &self,
        context: &PowerShellContext,
        cancel: &CancellationToken,
    ) -> anyhow::Result<Option<String>> {
        let options = ExecutionOptions::builder()
            .write_output_to_host(false)
            .write_errors_to_host(false)
            .is_read_line(true)
            .build();

        let output = context
            .execute_command_with_cancellation::<String>(
                self.proxy.read_line_command(),
                options,
                cancel,
            )
            .await
            .context("read line failed")?;

        Ok(output.results.into_iter().next())
    }
}

impl PromptContext for ReadLinePromptContext {
    fn add_to_history(&self, command: &str) {
        self.proxy.add_to_history(command);
    }

    fn force_event_handling(&self) {
        self.proxy.force_event_handling();
    }

    fn supports_eventing(&self) -> bool {
        true
    }

    fn abort_read_line(&self) {
        debug!("aborting read line");
        self.proxy.abort_read_line();
    }
}

/// Blocking source of input lines; `None` at end of input.
pub trait LineReader: Send + Sync {
    fn read_line(&self) -> std::io::Result<Option<String>>;
}

#[derive(Debug, Default, Clone, Copy)]
pub struct StdinLineReader;

impl LineReader for StdinLineReader {
    fn read_line(&self) -> std::io::Result<Option<String>> {
        let mut line = String::new();
        if std::io::stdin().lock().read_line(&mut line)? == 0 {
            return Ok(None);
        }
        Ok(Some(line.trim_end_matches(['\r', '\n']).to_string()))
    }
}

pub struct LegacyPromptContext {
    reader: Arc<dyn LineReader>,
    history: Mutex<Vec<String>>,
    abort: Notify,
}

impl LegacyPromptContext {
    pub fn new(reader: Arc<dyn LineReader>) -> Arc<Self> {
        Arc::new(Self {
            reader,
            history: Mutex::new(Vec::new()),
            abort: Notify::new(),
        })
    }

    /// Reads on a blocking thread. A cancelled or aborted read returns `None`;
    /// the line it eventually produces is dropped.
    pub async fn invoke_read_line(&self, cancel: &CancellationToken) -> anyhow::Result<Option<String>> {
        let reader = Arc::clone(&self.reader);
        let read = tokio::task::spawn_blocking(move || reader.read_line());

        tokio::select! {
            () = cancel.cancelled() => Ok(None),
            () = self.abort.notified() => {
                trace!("legacy read line aborted");
                Ok(None)
            }
            line = read => Ok(line.context("line reader task failed")??),
        }
    }

    pub fn history(&self) -> Vec<String> {
        self.history.lock().expect("history mutex poisoned").clone()
    }
}

impl PromptContext for LegacyPromptContext {
    fn add_to_history(&self, command: &str) {
        self.history
            .lock()
            .expect("history mutex poisoned")
            .push(command.to_string());
    }

    fn force_event_handling(&self) {}

    fn supports_eventing(&self) -> bool {
        false
    }

    fn abort_read_line(&self) {
        self.abort.notify_waiters();
    }
}

/// The line editor the console uses, chosen from configuration.
#[derive(Clone)]
pub enum ConsoleReader {
    ReadLine(Arc<ReadLinePromptContext>),
    Legacy(Arc<LegacyPromptContext>),
}

impl ConsoleReader {
    /// PSReadLine when enabled and available, plain lines otherwise.
    pub fn select(
        psreadline_enabled: bool,
        proxy: Option<Arc<dyn ReadLineProxy>>,
        reader: Arc<dyn LineReader>,
    ) -> Self {
        match proxy {
            Some(proxy) if psreadline_enabled => Self::ReadLine(ReadLinePromptContext::new(proxy)),
            _ => Self::Legacy(LegacyPromptContext::new(reader)),
        }
    }

    pub fn prompt_context(&self) -> Arc<dyn PromptContext> {
        match self {
            Self::ReadLine(readline) => Arc::clone(readline) as Arc<dyn PromptContext>,
            Self::Legacy(legacy) => Arc::clone(legacy) as Arc<dyn PromptContext>,
        }
    }

    pub async fn read_line(
        &self,
        context: &PowerShellContext,
        cancel: &CancellationToken,
    ) -> anyhow::Result<Option<String>> {
        match self {
            Self::ReadLine(readline) => readline.invoke_read_line(context, cancel).await,
            Self::Legacy(legacy) => legacy.invoke_read_line(cancel).await,
        }
    }

    pub fn abort_read_line(&self) {
        match self {
            Self::ReadLine(readline) => readline.abort_read_line(),
            Self::Legacy(legacy) => legacy.abort_read_line(),
        }
    }
}
