/// Results of one command execution
///
/// Script and stream errors never fail the call; they show up as
/// `had_errors` plus a formatted report in `error_messages`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandOutput<T> {
    pub results: Vec<T>,
    pub had_errors: bool,
    pub error_messages: String,
}

impl<T> Default for CommandOutput<T> {
    fn default() -> Self {
        Self {
            results: Vec::new(),
            had_errors: false,
            error_messages: String::new(),
        }
    }
}

impl<T> CommandOutput<T> {
    pub(crate) fn append_error(&mut self, message: &str) {
        if !self.error_messages.is_empty() {
            self.error_messages.push('\n');
        }
        self.error_messages.push_str(message);
    }

    pub fn first(&self) -> Option<&T> {
        self.results.first()
    }

    pub fn into_results(self) -> Vec<T> {
        self.results
    }
}
