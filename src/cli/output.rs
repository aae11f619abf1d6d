//! Output formatting for CLI commands.
//!
//! Every formatter returns a string; `main` decides where it goes. JSON
//! output never contains sensitive output values.

use colored::Colorize;
use serde_json::Value;
use std::collections::BTreeMap;
use std::fmt::Write;
use tabled::{Table, Tabled};

use crate::config::ValidationResult;
use crate::error::{ConfigError, HalyardError, Result};
use crate::graph::expr::value_to_text;
use crate::planner::{ActionType, DeploymentPlan, DiffType};
use crate::reconciler::{DriftReport, DriftStatus, PlanReport, ReconciliationResult};
use crate::render::RenderedArtifact;
use crate::state::{DeploymentState, LockInfo, OutputValue};

use super::commands::OutputFormat;

const SENSITIVE: &str = "<sensitive>";

/// Output formatter for CLI.
#[derive(Debug)]
pub struct OutputFormatter {
    /// Output format.
    format: OutputFormat,
}

/// Plan action row for table display.
#[derive(Tabled)]
struct PlanActionRow {
    #[tabled(rename = "#")]
    index: usize,
    #[tabled(rename = "Action")]
    action: String,
    #[tabled(rename = "Resource")]
    resource: String,
    #[tabled(rename = "After")]
    after: String,
    #[tabled(rename = "Reason")]
    reason: String,
}

/// Recorded resource row for `state list`.
#[derive(Tabled)]
struct ResourceRow {
    #[tabled(rename = "Resource")]
    resource: String,
    #[tabled(rename = "Status")]
    status: String,
    #[tabled(rename = "Provider ID")]
    provider_id: String,
    #[tabled(rename = "Updated")]
    updated: String,
}

/// Output row.
#[derive(Tabled)]
struct OutputRow {
    #[tabled(rename = "Name")]
    name: String,
    #[tabled(rename = "Value")]
    value: String,
}

impl OutputFormatter {
    /// Creates a new output formatter.
    #[must_use]
    pub const fn new(format: OutputFormat) -> Self {
        Self { format }
    }

    /// Formats a plan, optionally with per-attribute changes.
    #[must_use]
    pub fn format_plan(&self, report: &PlanReport, detailed: bool) -> String {
        match self.format {
            OutputFormat::Json => serde_json::to_string_pretty(report).unwrap_or_default(),
            OutputFormat::Text => {
                let mut output = Self::format_plan_text(&report.plan);
                if detailed {
                    output.push_str(&Self::format_changes_text(report));
                }
                for warning in &report.warnings {
                    let _ = writeln!(output, "{} {warning}", "⚠".yellow());
                }
                output
            }
        }
    }

    /// Formats a teardown preview.
    #[must_use]
    pub fn format_destroy_plan(&self, plan: &DeploymentPlan) -> String {
        match self.format {
            OutputFormat::Json => serde_json::to_string_pretty(plan).unwrap_or_default(),
            OutputFormat::Text => Self::format_plan_text(plan),
        }
    }

    fn format_plan_text(plan: &DeploymentPlan) -> String {
        if plan.is_empty() {
            return format!(
                "{} No changes. Infrastructure matches the declarations.\n",
                "✓".green()
            );
        }

        let mut output = String::new();
        let _ = writeln!(output, "\n{} plan", capitalize(&plan.operation.to_string()));
        if !plan.config_hash.is_empty() {
            let _ = writeln!(output, "   Declarations hash: {}\n", short(&plan.config_hash));
        }

        let rows: Vec<PlanActionRow> = plan
            .actions
            .iter()
            .enumerate()
            .map(|(i, a)| PlanActionRow {
                index: i + 1,
                action: Self::format_action_type(a.action_type, a.replacement),
                resource: a.resource.to_string(),
                after: a
                    .dependencies
                    .iter()
                    .map(|d| (d + 1).to_string())
                    .collect::<Vec<_>>()
                    .join(","),
                reason: truncate(&a.reason, 48),
            })
            .collect();
        output.push_str(&Table::new(rows).to_string());
        output.push('\n');

        let _ = writeln!(
            output,
            "\nPlan: {} to create, {} to update, {} to destroy",
            plan.count(ActionType::Create).to_string().green(),
            plan.count(ActionType::Update).to_string().yellow(),
            plan.count(ActionType::Destroy).to_string().red()
        );
        output
    }

    fn format_changes_text(report: &PlanReport) -> String {
        let mut output = String::new();
        for diff in report.diff.diffs.iter().filter(|d| d.diff_type != DiffType::NoChange) {
            let _ = writeln!(output, "\n  {} {}", Self::format_diff_type(diff.diff_type), diff.id);
            for change in &diff.changes {
                let old = change.old_value.as_ref().map_or_else(|| String::from("(none)"), value_to_text);
                let new = change.new_value.as_ref().map_or_else(|| String::from("(none)"), value_to_text);
                let forces = if change.forces_replacement {
                    " # forces replacement".red().to_string()
                } else {
                    String::new()
                };
                let cause = change
                    .cause
                    .as_ref()
                    .map_or_else(String::new, |c| format!(" ({c})").dimmed().to_string());
                let _ = writeln!(output, "      {}: {old} -> {new}{forces}{cause}", change.attribute);
            }
        }
        output
    }

    /// Formats validation results.
    #[must_use]
    pub fn format_validation(&self, result: &ValidationResult, show_warnings: bool) -> String {
        match self.format {
            OutputFormat::Json => {
                let json = serde_json::json!({
                    "valid": result.errors.is_empty(),
                    "warnings": result.warnings,
                });
                serde_json::to_string_pretty(&json).unwrap_or_default()
            }
            OutputFormat::Text => {
                let mut output = format!("{} Workspace is valid\n", "✓".green());
                if show_warnings {
                    for warning in &result.warnings {
                        let _ = writeln!(output, "   {} {warning}", "⚠".yellow());
                    }
                } else if !result.warnings.is_empty() {
                    let _ = writeln!(
                        output,
                        "   {} warnings (use --warnings to show)",
                        result.warnings.len()
                    );
                }
                output
            }
        }
    }

    /// Formats the result of apply or destroy.
    #[must_use]
    pub fn format_result(&self, result: &ReconciliationResult) -> String {
        match self.format {
            OutputFormat::Json => {
                let mut json = serde_json::to_value(result).unwrap_or_default();
                if let Some(outputs) = json.get_mut("outputs") {
                    *outputs = masked(&result.outputs);
                }
                serde_json::to_string_pretty(&json).unwrap_or_default()
            }
            OutputFormat::Text => {
                let operation = capitalize(&result.operation.to_string());
                let mut output = if result.success {
                    format!("{} {operation} complete\n", "✓".green())
                } else {
                    format!("{} {operation} failed\n", "✗".red())
                };

                if let Some(execution) = &result.execution {
                    let _ = writeln!(
                        output,
                        "   {} succeeded, {} failed, {} not started",
                        execution.successful, execution.failed, execution.not_started
                    );
                    for action in execution.results.iter().filter(|r| !r.success) {
                        let _ = writeln!(
                            output,
                            "   {} {} after {} attempt(s)",
                            "✗".red(),
                            action.action,
                            action.attempts
                        );
                    }
                }

                for path in &result.artifacts {
                    let _ = writeln!(output, "   {} {}", "→".cyan(), path.display());
                }

                if !result.outputs.is_empty() {
                    output.push_str("\nOutputs:\n");
                    for (name, value) in &result.outputs {
                        let _ = writeln!(output, "   {name} = {}", display_value(value));
                    }
                }

                if !result.errors.is_empty() {
                    let _ = write!(output, "\n{} Errors:\n", "⚠".yellow());
                    for error in &result.errors {
                        let _ = writeln!(output, "   - {error}");
                    }
                }
                output
            }
        }
    }

    /// Formats outputs, or the raw value of one output.
    ///
    /// # Errors
    ///
    /// Returns an error if `name` is not a recorded output.
    pub fn format_outputs(
        &self,
        outputs: &BTreeMap<String, OutputValue>,
        name: Option<&str>,
    ) -> Result<String> {
        if let Some(name) = name {
            let output = outputs.get(name).ok_or_else(|| {
                HalyardError::Config(ConfigError::validation(
                    format!("No output named '{name}' in state"),
                    "output",
                ))
            })?;
            return Ok(match self.format {
                OutputFormat::Json => serde_json::to_string_pretty(&output.value).unwrap_or_default(),
                OutputFormat::Text => value_to_text(&output.value),
            });
        }

        Ok(match self.format {
            OutputFormat::Json => serde_json::to_string_pretty(&masked(outputs)).unwrap_or_default(),
            OutputFormat::Text => {
                if outputs.is_empty() {
                    return Ok(String::from("No outputs. Run 'halyard apply' first.\n"));
                }
                let rows: Vec<OutputRow> = outputs
                    .iter()
                    .map(|(name, value)| OutputRow {
                        name: name.clone(),
                        value: display_value(value),
                    })
                    .collect();
                format!("{}\n", Table::new(rows))
            }
        })
    }

    /// Formats rendered artifacts.
    #[must_use]
    pub fn format_artifacts(&self, artifacts: &[RenderedArtifact]) -> String {
        match self.format {
            OutputFormat::Json => {
                let json: Vec<Value> = artifacts
                    .iter()
                    .map(|a| {
                        serde_json::json!({
                            "name": a.name,
                            "template": a.template,
                            "path": a.state.path,
                            "content_hash": a.state.content_hash,
                        })
                    })
                    .collect();
                serde_json::to_string_pretty(&json).unwrap_or_default()
            }
            OutputFormat::Text => {
                if artifacts.is_empty() {
                    return String::from("Nothing to render.\n");
                }
                let mut output = String::new();
                for artifact in artifacts {
                    let _ = writeln!(
                        output,
                        "{} {} -> {}",
                        "✓".green(),
                        artifact.name,
                        artifact.state.path.display()
                    );
                }
                output
            }
        }
    }

    /// Formats a drift report.
    #[must_use]
    pub fn format_drift(&self, report: &DriftReport) -> String {
        match self.format {
            OutputFormat::Json => serde_json::to_string_pretty(report).unwrap_or_default(),
            OutputFormat::Text => {
                if report.is_converged() {
                    return format!("{} No drift detected.\n", "✓".green());
                }

                let mut output = format!("{} Drift detected:\n\n", "⚠".yellow());
                for entry in report.entries.iter().filter(|e| e.status != DriftStatus::InSync) {
                    let status = match entry.status {
                        DriftStatus::Missing => "missing".red().to_string(),
                        _ => "changed".yellow().to_string(),
                    };
                    let _ = writeln!(output, "   - {} ({}) {status}", entry.resource, entry.provider_id);
                    for change in &entry.changes {
                        let actual = change
                            .actual
                            .as_ref()
                            .map_or_else(|| String::from("(unset)"), value_to_text);
                        let _ = writeln!(
                            output,
                            "       {}: {} -> {actual}",
                            change.attribute,
                            value_to_text(&change.recorded)
                        );
                    }
                }

                let drifted = report
                    .entries
                    .iter()
                    .filter(|e| e.status != DriftStatus::InSync)
                    .count();
                let _ = writeln!(
                    output,
                    "\n{drifted}/{} resources have drifted.",
                    report.entries.len()
                );
                if report.refreshed {
                    output.push_str("State refreshed. Run 'halyard plan' to see the corrections.\n");
                } else {
                    output.push_str("Run 'halyard drift --refresh' to record this in state.\n");
                }
                output
            }
        }
    }

    /// Formats deployment state.
    #[must_use]
    pub fn format_state(&self, state: &DeploymentState) -> String {
        match self.format {
            OutputFormat::Json => {
                let mut json = serde_json::to_value(state).unwrap_or_default();
                if let Some(outputs) = json.get_mut("outputs") {
                    *outputs = masked(&state.outputs);
                }
                serde_json::to_string_pretty(&json).unwrap_or_default()
            }
            OutputFormat::Text => {
                let mut output = String::new();
                let _ = write!(output, "\nState: {}/{}\n\n", state.project, state.environment);
                let _ = writeln!(output, "   Version: {}", state.version);
                let _ = writeln!(output, "   Lineage: {}", state.lineage);
                let _ = writeln!(output, "   Serial: {}", state.serial);
                let _ = writeln!(output, "   Declarations hash: {}", short(&state.config_hash));
                let _ = writeln!(output, "   Last updated: {}", state.last_updated);
                let _ = writeln!(output, "   Resources: {}", state.resources.len());
                let _ = writeln!(output, "   Outputs: {}", state.outputs.len());
                let _ = writeln!(output, "   Artifacts: {}", state.artifacts.len());

                if !state.history.is_empty() {
                    let _ = writeln!(output, "\n   Recent history ({}):", state.history.len());
                    for entry in state.history.iter().rev().take(5) {
                        let status = if entry.success { "✓".green() } else { "✗".red() };
                        let _ = writeln!(
                            output,
                            "     {status} {} - {} ({} actions)",
                            entry.timestamp.format("%Y-%m-%d %H:%M"),
                            entry.operation,
                            entry.actions.len()
                        );
                        if let Some(error) = &entry.error {
                            let _ = writeln!(output, "         {error}");
                        }
                    }
                }
                output
            }
        }
    }

    /// Formats the recorded resources as a table.
    #[must_use]
    pub fn format_resources(&self, state: &DeploymentState) -> String {
        match self.format {
            OutputFormat::Json => {
                let json: Vec<Value> = state
                    .resources
                    .iter()
                    .map(|(id, r)| {
                        serde_json::json!({
                            "resource": id.to_string(),
                            "status": r.status,
                            "provider_id": r.provider_id,
                            "dependencies": r.dependencies,
                        })
                    })
                    .collect();
                serde_json::to_string_pretty(&json).unwrap_or_default()
            }
            OutputFormat::Text => {
                if state.resources.is_empty() {
                    return String::from("No resources recorded.\n");
                }
                let rows: Vec<ResourceRow> = state
                    .resources
                    .iter()
                    .map(|(id, r)| ResourceRow {
                        resource: id.to_string(),
                        status: r.status.to_string(),
                        provider_id: r.provider_id.clone(),
                        updated: r.updated_at.format("%Y-%m-%d %H:%M").to_string(),
                    })
                    .collect();
                format!("{}\n", Table::new(rows))
            }
        }
    }

    /// Formats lock information.
    #[must_use]
    pub fn format_lock(&self, lock: &LockInfo) -> String {
        match self.format {
            OutputFormat::Json => serde_json::to_string_pretty(lock).unwrap_or_default(),
            OutputFormat::Text => format!(
                "State locked by {} for {} (lock {}, expires in {}s)\n",
                lock.holder,
                lock.operation,
                lock.lock_id,
                lock.remaining_secs()
            ),
        }
    }

    /// Formats a one-line status message.
    #[must_use]
    pub fn message(&self, message: &str) -> String {
        match self.format {
            OutputFormat::Json => {
                let json = serde_json::json!({ "status": "success", "message": message });
                serde_json::to_string_pretty(&json).unwrap_or_default()
            }
            OutputFormat::Text => format!("{} {message}", "✓".green()),
        }
    }

    fn format_action_type(action_type: ActionType, replacement: bool) -> String {
        match (action_type, replacement) {
            (ActionType::Create, false) => "+create".green().to_string(),
            (ActionType::Create, true) => "+create (replace)".green().to_string(),
            (ActionType::Update, _) => "~update".yellow().to_string(),
            (ActionType::Destroy, false) => "-destroy".red().to_string(),
            (ActionType::Destroy, true) => "-destroy (replace)".red().to_string(),
        }
    }

    fn format_diff_type(diff_type: DiffType) -> String {
        match diff_type {
            DiffType::Create => "+".green().to_string(),
            DiffType::Update => "~".yellow().to_string(),
            DiffType::Replace => "-/+".red().to_string(),
            DiffType::Delete => "-".red().to_string(),
            DiffType::NoChange => " ".to_string(),
        }
    }
}

fn display_value(output: &OutputValue) -> String {
    if output.sensitive {
        String::from(SENSITIVE)
    } else {
        value_to_text(&output.value)
    }
}

fn masked(outputs: &BTreeMap<String, OutputValue>) -> Value {
    outputs
        .iter()
        .map(|(name, output)| {
            let value = if output.sensitive {
                Value::String(String::from(SENSITIVE))
            } else {
                output.value.clone()
            };
            (name.clone(), value)
        })
        .collect::<serde_json::Map<String, Value>>()
        .into()
}

fn capitalize(word: &str) -> String {
    let mut chars = word.chars();
    chars
        .next()
        .map(|first| first.to_uppercase().chain(chars).collect())
        .unwrap_or_default()
}

fn short(hash: &str) -> &str {
    hash.get(..8).unwrap_or(hash)
}

fn truncate(s: &str, max_len: usize) -> String {
    if s.chars().count() <= max_len {
        s.to_string()
    } else {
        let head: String = s.chars().take(max_len.saturating_sub(3)).collect();
        format!("{head}...")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn outputs() -> BTreeMap<String, OutputValue> {
        BTreeMap::from([
            (
                String::from("public_ip"),
                OutputValue {
                    value: json!("203.0.113.2"),
                    sensitive: false,
                },
            ),
            (
                String::from("admin_token"),
                OutputValue {
                    value: json!("s3cr3t"),
                    sensitive: true,
                },
            ),
        ])
    }

    #[test]
    fn test_sensitive_outputs_are_masked_in_json() {
        let formatter = OutputFormatter::new(OutputFormat::Json);
        let text = formatter.format_outputs(&outputs(), None).expect("format");
        assert!(!text.contains("s3cr3t"));
        assert!(text.contains("203.0.113.2"));
    }

    #[test]
    fn test_named_output_is_raw() {
        let formatter = OutputFormatter::new(OutputFormat::Text);
        let text = formatter
            .format_outputs(&outputs(), Some("public_ip"))
            .expect("format");
        assert_eq!(text, "203.0.113.2");
    }

    #[test]
    fn test_unknown_output_is_error() {
        let formatter = OutputFormatter::new(OutputFormat::Text);
        assert!(formatter.format_outputs(&outputs(), Some("missing")).is_err());
    }

    #[test]
    fn test_truncate_respects_char_boundaries() {
        assert_eq!(truncate("short", 10), "short");
        assert_eq!(truncate("änderung erzwungen", 8), "änder...");
        assert_eq!(short("abc"), "abc");
    }

    #[test]
    fn test_empty_plan_text() {
        let state = DeploymentState::new("devbox", "dev");
        let plan = DeploymentPlan::destroy(&state).expect("plan");
        let text = OutputFormatter::new(OutputFormat::Text).format_destroy_plan(&plan);
        assert!(text.contains("No changes"));
    }
}
