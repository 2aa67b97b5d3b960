use std::fmt::Write;

use crate::engine::{ErrorRecord, PsCommand};

/// Renders the non-terminating errors of a command into one readable report.
pub(crate) fn format_error_report(command: &PsCommand, errors: &[ErrorRecord]) -> String {
    let mut report = String::new();
    let _ = writeln!(
        report,
        "Execution of the following command(s) completed with errors:\n\n{command}\n"
    );

    for (index, error) in errors.iter().enumerate() {
        let _ = writeln!(report, "Error #{}:", index + 1);
        let _ = writeln!(report, "{}", error.message);
        let _ = writeln!(
            report,
            "ScriptStackTrace:\n{}",
            error.script_stack_trace.as_deref().unwrap_or("<null>")
        );

        match &error.exception {
            Some(exception) => {
                let _ = writeln!(report, "Exception:\n   {exception}");
                let mut inner = exception.inner.as_deref();
                while let Some(exception) = inner {
                    let _ = writeln!(report, "InnerException:\n   {exception}");
                    inner = exception.inner.as_deref();
                }
            }
            None => {
                let _ = writeln!(report, "Exception:\n   <null>");
            }
        }
    }

    report
}
