use std::path::{Path, PathBuf};

use anyhow::Context;
use ironposh_editor_core::ProfilePaths;
use serde::Deserialize;
use tracing_subscriber::fmt::writer::BoxMakeWriter;
use tracing_subscriber::{EnvFilter, fmt, prelude::*, registry::Registry};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
pub enum LogLevel {
    Diagnostic,
    Verbose,
    #[default]
    Normal,
    Warning,
    Error,
}

impl LogLevel {
    fn filter(self) -> &'static str {
        match self {
            Self::Diagnostic => "trace",
            Self::Verbose => "debug",
            Self::Normal => "info",
            Self::Warning => "warn",
            Self::Error => "error",
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct LoggingConfig {
    pub level: LogLevel,

    /// Log file; stderr when unset
    pub path: Option<PathBuf>,
}

/// Session settings handed over by the editor at startup
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct EditorServicesConfig {
    pub logging: LoggingConfig,
    pub profile_paths: ProfilePaths,
    pub feature_flags: Vec<String>,
    pub additional_modules: Vec<String>,
    pub enable_console_repl: bool,
    pub use_legacy_read_line: bool,
}

impl EditorServicesConfig {
    pub fn from_json(text: &str) -> anyhow::Result<Self> {
        serde_json::from_str(text).context("invalid editor services configuration")
    }

    pub fn from_file(path: &Path) -> anyhow::Result<Self> {
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read {}", path.display()))?;
        Self::from_json(&text)
    }

    pub fn is_psreadline_enabled(&self) -> bool {
        self.enable_console_repl && !self.use_legacy_read_line
    }

    pub fn has_feature(&self, name: &str) -> bool {
        self.feature_flags
            .iter()
            .any(|flag| flag.eq_ignore_ascii_case(name))
    }
}

/// Initialize logging with file output and structured fields
pub fn init_logging(config: &LoggingConfig) -> anyhow::Result<()> {
    let writer = match &config.path {
        Some(path) => {
            let log_file = std::fs::File::create(path)
                .with_context(|| format!("failed to create log file {}", path.display()))?;
            BoxMakeWriter::new(log_file)
        }
        None => BoxMakeWriter::new(std::io::stderr),
    };

    let env_filter = EnvFilter::new(config.level.filter());

    let subscriber = Registry::default().with(env_filter).with(
        fmt::layer()
            .with_writer(writer)
            .with_target(true)
            .with_line_number(true)
            .with_file(true)
            .with_ansi(false)
            .compact(),
    );

    tracing::subscriber::set_global_default(subscriber)?;
    Ok(())
}
