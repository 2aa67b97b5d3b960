use std::fmt;

use super::PsValue;

/// Represents a single parameter for a command
#[derive(Debug, Clone, PartialEq)]
pub enum Parameter {
    Named { name: String, value: PsValue },
    Positional { value: PsValue },
    Switch { name: String, value: bool },
}

/// A single command or script block in a pipeline
#[derive(Debug, Clone, PartialEq)]
pub struct Command {
    pub command_text: String,
    pub is_script: bool,
    pub use_local_scope: bool,
    pub parameters: Vec<Parameter>,
    /// Merge the error stream into the output stream of this command
    pub merge_errors_to_output: bool,
}

impl Command {
    pub fn new_script(script: impl Into<String>) -> Self {
        Self {
            command_text: script.into(),
            is_script: true,
            use_local_scope: false,
            parameters: Vec::new(),
            merge_errors_to_output: false,
        }
    }

    pub fn new_command(command: impl Into<String>) -> Self {
        Self {
            command_text: command.into(),
            is_script: false,
            use_local_scope: false,
            parameters: Vec::new(),
            merge_errors_to_output: false,
        }
    }

    pub fn add_parameter(&mut self, parameter: Parameter) {
        self.parameters.push(parameter);
    }

    pub fn with_parameter(mut self, parameter: Parameter) -> Self {
        self.parameters.push(parameter);
        self
    }

    pub fn with_local_scope(mut self) -> Self {
        self.use_local_scope = true;
        self
    }

    /// `Out-Default`, the sink that sends pipeline output to the host.
    pub fn new_out_default() -> Self {
        Self::new_command("Out-Default").with_local_scope()
    }

    /// `Out-String -Stream`, used when output must be collected as text.
    pub fn new_output_stream() -> Self {
        Self::new_command("Out-String")
            .with_local_scope()
            .with_parameter(Parameter::Switch {
                name: "Stream".to_string(),
                value: true,
            })
    }
}

impl fmt::Display for Command {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.command_text)?;
        for parameter in &self.parameters {
            match parameter {
                Parameter::Named { name, value } => write!(f, " -{name} {value}")?,
                Parameter::Positional { value } => write!(f, " {value}")?,
                Parameter::Switch { name, value: true } => write!(f, " -{name}")?,
                Parameter::Switch { name, value: false } => write!(f, " -{name}:$false")?,
            }
        }
        Ok(())
    }
}

/// An ordered pipeline of commands
#[derive(Debug, Clone, Default, PartialEq)]
pub struct PsCommand {
    commands: Vec<Command>,
}

impl PsCommand {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_script(script: impl Into<String>) -> Self {
        Self::new().add_script(script)
    }

    pub fn from_command(command: impl Into<String>) -> Self {
        Self::new().add_command(command)
    }

    pub fn add_script(mut self, script: impl Into<String>) -> Self {
        self.commands.push(Command::new_script(script));
        self
    }

    pub fn add_command(mut self, command: impl Into<String>) -> Self {
        self.commands.push(Command::new_command(command));
        self
    }

    /// Adds a parameter to the last command. Ignored on an empty pipeline.
    pub fn add_parameter(mut self, name: impl Into<String>, value: impl Into<PsValue>) -> Self {
        if let Some(last) = self.commands.last_mut() {
            last.add_parameter(Parameter::Named {
                name: name.into(),
                value: value.into(),
            });
        }
        self
    }

    pub fn add_argument(mut self, value: impl Into<PsValue>) -> Self {
        if let Some(last) = self.commands.last_mut() {
            last.add_parameter(Parameter::Positional {
                value: value.into(),
            });
        }
        self
    }

    pub fn push(&mut self, command: Command) {
        self.commands.push(command);
    }

    pub fn commands(&self) -> &[Command] {
        &self.commands
    }

    pub fn is_empty(&self) -> bool {
        self.commands.is_empty()
    }

    pub fn first_text(&self) -> Option<&str> {
        self.commands.first().map(|c| c.command_text.as_str())
    }

    /// Routes the error stream of the first command into the output stream.
    pub fn merge_errors_into_output(&mut self) {
        if let Some(first) = self.commands.first_mut() {
            first.merge_errors_to_output = true;
        }
    }
}

impl fmt::Display for PsCommand {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (index, command) in self.commands.iter().enumerate() {
            if index > 0 {
                write!(f, " | ")?;
            }
            write!(f, "{command}")?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn display_joins_commands_with_pipes() {
        let command = PsCommand::from_command("Get-Process")
            .add_parameter("Name", "pwsh")
            .add_command("Select-Object")
            .add_argument("Id");

        assert_eq!(command.to_string(), "Get-Process -Name pwsh | Select-Object Id");
    }

    #[test]
    fn output_stream_command_has_stream_switch() {
        let command = Command::new_output_stream();
        assert_eq!(command.to_string(), "Out-String -Stream");
        assert!(command.use_local_scope);
    }

    #[test]
    fn merge_only_touches_first_command() {
        let mut command = PsCommand::from_script("1").add_command("Out-Default");
        command.merge_errors_into_output();

        assert!(command.commands()[0].merge_errors_to_output);
        assert!(!command.commands()[1].merge_errors_to_output);
    }

    #[test]
    fn parameters_on_empty_pipeline_are_ignored() {
        let command = PsCommand::new().add_parameter("Name", "x");
        assert!(command.is_empty());
        assert_eq!(command.first_text(), None);
    }
}
