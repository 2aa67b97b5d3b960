//! Editor-facing host around the execution coordinator: configuration,
//! console loop, notifications and debug adapter plumbing.

pub mod config;
pub mod debug_adapter;
pub mod notifications;
pub mod prompt_context;
pub mod repl;
pub mod requests;

use std::sync::Arc;

use anyhow::Context;
use ironposh_editor_core::engine::Runspace;
use ironposh_editor_core::host::{HostInput, HostOutput, NullHost, PromptContext};
use ironposh_editor_core::{
    ExecutionOptions, PowerShellContext, PowerShellContextConfig, PsCommand, PsValue,
};
use tokio::runtime::Handle;
use tracing::{info, instrument, warn};

use crate::config::EditorServicesConfig;
use crate::debug_adapter::DebugAdapterBridge;
use crate::notifications::{NotificationForwarder, NotificationSink};
use crate::prompt_context::ConsoleReader;
use crate::repl::ConsoleCommandLoop;

/// A running editor session.
pub struct EditorServices {
    context: PowerShellContext,
    console: Option<Arc<ConsoleCommandLoop>>,
    _notifications: NotificationForwarder,
}

impl EditorServices {
    /// Builds the coordinator over `runspace`, imports the configured modules,
    /// loads profiles and starts the console when one is configured.
    #[instrument(skip_all)]
    pub async fn start(
        config: &EditorServicesConfig,
        runspace: Arc<dyn Runspace>,
        host_output: Arc<dyn HostOutput>,
        console: Option<ConsoleReader>,
        notifications: Arc<dyn NotificationSink>,
    ) -> anyhow::Result<Self> {
        let console = console.filter(|_| config.enable_console_repl);
        let prompt_context: Arc<dyn PromptContext> = console
            .as_ref()
            .map_or_else(|| Arc::new(NullHost) as Arc<dyn PromptContext>, ConsoleReader::prompt_context);

        if !config.feature_flags.is_empty() {
            info!(flags = ?config.feature_flags, "feature flags enabled");
        }

        let context = PowerShellContext::new(
            PowerShellContextConfig::builder()
                .initial_runspace(runspace)
                .owns_initial_runspace(true)
                .host_output(host_output)
                .prompt_context(prompt_context)
                .profile_paths(config.profile_paths.clone())
                .build(),
        )
        .context("failed to initialize the execution coordinator")?;

        let notifications =
            NotificationForwarder::spawn(&context, notifications, config.is_psreadline_enabled());

        import_additional_modules(&context, &config.additional_modules).await;
        context
            .load_host_profiles()
            .await
            .context("failed to load profiles")?;

        let console = console.map(|reader| {
            let console = ConsoleCommandLoop::new(&context, reader, Handle::current());
            context.set_host_input(Arc::clone(&console) as Arc<dyn HostInput>);
            console.start_command_loop();
            console
        });

        info!(console = console.is_some(), "editor services started");
        Ok(Self {
            context,
            console,
            _notifications: notifications,
        })
    }

    pub fn context(&self) -> &PowerShellContext {
        &self.context
    }

    pub fn console(&self) -> Option<&Arc<ConsoleCommandLoop>> {
        self.console.as_ref()
    }

    pub fn debug_adapter(&self) -> DebugAdapterBridge {
        DebugAdapterBridge::new(self.context.clone())
    }

    pub fn shutdown(self) {
        if let Some(console) = &self.console {
            console.stop_command_loop();
        }
        self.context.dispose();
        info!("editor services stopped");
    }
}

async fn import_additional_modules(context: &PowerShellContext, modules: &[String]) {
    for module in modules {
        let command = PsCommand::from_command("Microsoft.PowerShell.Core\\Import-Module")
            .add_parameter("Name", module.as_str());

        match context
            .execute_command::<PsValue>(command, ExecutionOptions::silent())
            .await
        {
            Ok(output) if output.had_errors => {
                warn!(module, errors = %output.error_messages, "module import reported errors");
            }
            Ok(_) => info!(module, "imported module"),
            Err(error) => warn!(module, %error, "failed to import module"),
        }
    }
}
