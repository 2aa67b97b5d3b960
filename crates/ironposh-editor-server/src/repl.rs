use std::sync::{Arc, Mutex};

use ironposh_editor_core::context::WeakPowerShellContext;
use ironposh_editor_core::host::{HostInput, OutputType};
use ironposh_editor_core::{ExecutionOptions, PowerShellContext, PsCommand, PsValue};
use tokio::runtime::Handle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, warn};

use crate::prompt_context::ConsoleReader;

const DEFAULT_PROMPT: &str = "PS> ";
const DEBUGGER_PROMPT_PREFIX: &str = "[DBG]: ";

#[derive(Default)]
struct LoopState {
    generation: u64,
    running: Option<CancellationToken>,
}

type SharedLoopState = Arc<Mutex<LoopState>>;

/// Interactive console: prompts, reads a line, fires it as a command and
/// exits until the command's completion restarts the loop.
pub struct ConsoleCommandLoop {
    context: WeakPowerShellContext,
    reader: ConsoleReader,
    runtime: Handle,
    state: SharedLoopState,
}

impl ConsoleCommandLoop {
    pub fn new(context: &PowerShellContext, reader: ConsoleReader, runtime: Handle) -> Arc<Self> {
        Arc::new(Self {
            context: context.downgrade(),
            reader,
            runtime,
            state: SharedLoopState::default(),
        })
    }

    pub fn is_running(&self) -> bool {
        self.state
            .lock()
            .expect("command loop mutex poisoned")
            .running
            .is_some()
    }
}

impl HostInput for ConsoleCommandLoop {
    fn start_command_loop(&self) {
        let Some(context) = self.context.upgrade() else {
            debug!("coordinator is gone, not starting the command loop");
            return;
        };

        let (generation, token) = {
            let mut state = self.state.lock().expect("command loop mutex poisoned");
            if state.running.is_some() {
                return;
            }
            state.generation += 1;
            let token = CancellationToken::new();
            state.running = Some(token.clone());
            (state.generation, token)
        };

        let task = ConsoleLoopTask {
            context,
            reader: self.reader.clone(),
            state: Arc::clone(&self.state),
            generation,
            token,
        };
        self.runtime.spawn(task.run());
    }

    fn stop_command_loop(&self) {
        let Some(token) = self
            .state
            .lock()
            .expect("command loop mutex poisoned")
            .running
            .take()
        else {
            return;
        };

        debug!("stopping command loop");
        token.cancel();
        self.reader.abort_read_line();
    }
}

struct ConsoleLoopTask {
    context: PowerShellContext,
    reader: ConsoleReader,
    state: SharedLoopState,
    generation: u64,
    token: CancellationToken,
}

impl ConsoleLoopTask {
    #[instrument(name = "command_loop", skip_all, fields(generation = self.generation))]
    async fn run(self) {
        while !self.token.is_cancelled() {
            let prompt = self.prompt_string().await;
            self.context.write_output(&prompt, false, OutputType::Normal);

            let line = match self.reader.read_line(&self.context, &self.token).await {
                Ok(Some(line)) => line,
                Ok(None) if self.token.is_cancelled() => break,
                Ok(None) => {
                    debug!("read line returned nothing");
                    continue;
                }
                Err(error) => {
                    error!(%error, "failed to read a command");
                    break;
                }
            };

            if self.token.is_cancelled() {
                break;
            }

            self.context.write_output("", true, OutputType::Normal);
            let line = line.trim();
            if !line.is_empty() {
                self.fire(line.to_string());
                return;
            }
        }

        self.release();
    }

    /// Clears the running slot if it still belongs to this run.
    fn release(&self) {
        let mut state = self.state.lock().expect("command loop mutex poisoned");
        if state.generation == self.generation {
            state.running = None;
        }
    }

    /// Hands the command to the coordinator; its completion status restarts
    /// the loop.
    fn fire(&self, line: String) {
        info!(command = %line, "executing console command");
        self.release();

        let context = self.context.clone();
        tokio::spawn(async move {
            let options = ExecutionOptions::builder().add_to_history(true).build();
            if let Err(error) = context
                .execute_command::<PsValue>(PsCommand::from_script(line), options)
                .await
            {
                warn!(%error, "console command failed");
            }
        });
    }

    async fn prompt_string(&self) -> String {
        let prompt = match self
            .context
            .execute_command::<String>(PsCommand::from_command("prompt"), ExecutionOptions::silent())
            .await
        {
            Ok(output) => output.results.into_iter().next(),
            Err(error) => {
                debug!(%error, "prompt function failed");
                None
            }
        };

        let prompt = prompt
            .filter(|prompt| !prompt.is_empty())
            .unwrap_or_else(|| DEFAULT_PROMPT.to_string());

        if self.context.prompt_nest().is_in_debugger() {
            format!("{DEBUGGER_PROMPT_PREFIX}{prompt}")
        } else {
            prompt
        }
    }
}
