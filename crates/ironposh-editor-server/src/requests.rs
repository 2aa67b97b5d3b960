//! Editor requests that run script through the coordinator.

use anyhow::Context;
use ironposh_editor_core::engine::PsObject;
use ironposh_editor_core::{ExecutionOptions, PowerShellContext, PsCommand, PsValue};
use serde::{Deserialize, Serialize};
use tracing::{debug, instrument};

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CompletionMatch {
    pub completion_text: String,
    pub list_item_text: String,
    pub result_type: String,
    pub tool_tip: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CompletionResults {
    pub replacement_index: i32,
    pub replacement_length: i32,
    pub matches: Vec<CompletionMatch>,
}

fn string_property(object: &PsObject, name: &str) -> String {
    object
        .property(name)
        .map(ToString::to_string)
        .unwrap_or_default()
}

impl CompletionResults {
    /// Reads the `CommandCompletion` object `TabExpansion2` returns. Its
    /// matches are carried as `CompletionMatch0`, `CompletionMatch1`, ...
    fn from_ps_value(value: &PsValue) -> Option<Self> {
        let completion = value.as_object()?;
        let matches = (0..)
            .map_while(|index| {
                completion
                    .property(&format!("CompletionMatch{index}"))
                    .and_then(PsValue::as_object)
            })
            .map(|item| CompletionMatch {
                completion_text: string_property(item, "CompletionText"),
                list_item_text: string_property(item, "ListItemText"),
                result_type: string_property(item, "ResultType"),
                tool_tip: string_property(item, "ToolTip"),
            })
            .collect();

        Some(Self {
            replacement_index: completion
                .property("ReplacementIndex")
                .and_then(PsValue::as_i32)
                .unwrap_or_default(),
            replacement_length: completion
                .property("ReplacementLength")
                .and_then(PsValue::as_i32)
                .unwrap_or_default(),
            matches,
        })
    }
}

/// Completions at `cursor_column` of `script`. Runs silently, so it can be
/// served from the line editor's idle event while the console waits.
#[instrument(skip(context, script))]
pub async fn get_completions(
    context: &PowerShellContext,
    script: &str,
    cursor_column: i32,
) -> anyhow::Result<CompletionResults> {
    let command = PsCommand::from_command("TabExpansion2")
        .add_parameter("InputScript", script)
        .add_parameter("CursorColumn", cursor_column);

    let output = context
        .execute_command::<PsValue>(command, ExecutionOptions::silent())
        .await
        .context("TabExpansion2 failed")?;

    let results = output
        .first()
        .and_then(CompletionResults::from_ps_value)
        .unwrap_or_default();
    debug!(count = results.matches.len(), "completions resolved");
    Ok(results)
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum EvaluateContext {
    #[default]
    Repl,
    Hover,
    Watch,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct EvaluateResponse {
    pub result: String,
    pub variables_reference: i32,
}

/// REPL evaluation echoes and records the expression and writes its output to
/// the console; hover and watch evaluation only return the rendered values.
#[instrument(skip(context))]
pub async fn evaluate(
    context: &PowerShellContext,
    expression: &str,
    evaluate_context: EvaluateContext,
) -> anyhow::Result<EvaluateResponse> {
    if evaluate_context == EvaluateContext::Repl {
        context
            .execute_script_string(expression, true, true, true)
            .await
            .context("evaluation failed")?;
        return Ok(EvaluateResponse::default());
    }

    let output = context
        .execute_command::<PsValue>(PsCommand::from_script(expression), ExecutionOptions::silent())
        .await
        .context("evaluation failed")?;

    let result = output
        .results
        .iter()
        .filter(|value| !value.is_null())
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join("\n");

    Ok(EvaluateResponse {
        result,
        variables_reference: 0,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reads_indexed_completion_matches() {
        let value = PsValue::from(
            PsObject::new()
                .with_property("ReplacementIndex", 0)
                .with_property("ReplacementLength", 5)
                .with_property(
                    "CompletionMatch0",
                    PsObject::new()
                        .with_property("CompletionText", "Get-Date")
                        .with_property("ResultType", "Command"),
                )
                .with_property(
                    "CompletionMatch1",
                    PsObject::new().with_property("CompletionText", "Get-Item"),
                ),
        );

        let results = CompletionResults::from_ps_value(&value).unwrap();
        assert_eq!(results.replacement_length, 5);
        assert_eq!(results.matches.len(), 2);
        assert_eq!(results.matches[0].result_type, "Command");
        assert_eq!(results.matches[1].list_item_text, "");
    }
}
