//! Output formatting for CLI results
//!
//! Every command prints through [`OutputFormatter`]:
//! - Table: human-readable tables (default)
//! - JSON: structured output for scripts
//! - Quiet: nothing, exit code only

use std::str::FromStr;

use comfy_table::{presets::UTF8_FULL, Table};
use serde::Serialize;

use crate::demo::DemoReport;
use crate::identity::IdentityInfo;
use crate::rules::{CheckOutcome, RuleRow};
use crate::ExitCode;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum OutputFormat {
    #[default]
    Table,
    Json,
    Quiet,
}

impl FromStr for OutputFormat {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "table" => Ok(Self::Table),
            "json" => Ok(Self::Json),
            "quiet" => Ok(Self::Quiet),
            _ => Err(format!("Unknown output format: {s}")),
        }
    }
}

impl std::fmt::Display for OutputFormat {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Table => write!(f, "table"),
            Self::Json => write!(f, "json"),
            Self::Quiet => write!(f, "quiet"),
        }
    }
}

/// JSON envelope shared by every command.
#[derive(Serialize)]
pub struct JsonResponse<T: Serialize> {
    pub success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<T>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub code: Option<&'static str>,
    pub command: String,
}

impl<T: Serialize> JsonResponse<T> {
    pub fn success(data: T, command: &str) -> Self {
        Self {
            success: true,
            data: Some(data),
            error: None,
            code: None,
            command: command.to_string(),
        }
    }
}

impl JsonResponse<()> {
    pub fn error(message: &str, code: ExitCode, command: &str) -> Self {
        Self {
            success: false,
            data: None,
            error: Some(message.to_string()),
            code: Some(code.name()),
            command: command.to_string(),
        }
    }
}

pub struct OutputFormatter {
    format: OutputFormat,
    verbose: bool,
}

impl OutputFormatter {
    pub fn new(format: OutputFormat, verbose: bool) -> Self {
        Self { format, verbose }
    }

    pub fn format(&self) -> OutputFormat {
        self.format
    }

    pub fn format_identity(&self, info: &IdentityInfo) -> String {
        match self.format {
            OutputFormat::Table => {
                let mut table = Table::new();
                table.load_preset(UTF8_FULL);
                table.set_header(vec!["Property", "Value"]);
                table.add_row(vec!["Identity ID", &info.id]);
                table.add_row(vec!["Name", &info.name]);
                table.add_row(vec!["Public Key", info.public_key_pem.trim_end()]);
                table.to_string()
            }
            OutputFormat::Json => self.to_json_response(info, "identity show"),
            OutputFormat::Quiet => String::new(),
        }
    }

    pub fn format_rules(&self, rules: &[RuleRow]) -> String {
        match self.format {
            OutputFormat::Table => {
                if rules.is_empty() {
                    return "No rules found.".to_string();
                }
                let mut table = Table::new();
                table.load_preset(UTF8_FULL);
                table.set_header(vec!["ID", "Service", "Identity", "Policy", "Targets", "Persistence"]);
                for rule in rules {
                    table.add_row(vec![
                        rule.id.to_string(),
                        rule.service.clone(),
                        abbreviate(&rule.identity, self.verbose),
                        rule.policy.clone(),
                        rule.targets.clone(),
                        rule.persistence.clone(),
                    ]);
                }
                table.to_string()
            }
            OutputFormat::Json => self.to_json_response(&rules, "rules list"),
            OutputFormat::Quiet => String::new(),
        }
    }

    pub fn format_check(&self, outcome: &CheckOutcome) -> String {
        match self.format {
            OutputFormat::Table => {
                let mut table = Table::new();
                table.load_preset(UTF8_FULL);
                table.set_header(vec!["Property", "Value"]);
                table.add_row(vec!["Service", &outcome.service]);
                table.add_row(vec!["Identity", &outcome.identity]);
                table.add_row(vec!["Decision", &outcome.decision]);
                table.add_row(vec!["Source", &outcome.source]);
                if let Some(id) = outcome.rule_id {
                    table.add_row(vec!["Rule ID".to_string(), id.to_string()]);
                }
                table.to_string()
            }
            OutputFormat::Json => self.to_json_response(outcome, "check"),
            OutputFormat::Quiet => String::new(),
        }
    }

    pub fn format_demo(&self, report: &DemoReport) -> String {
        match self.format {
            OutputFormat::Table => {
                let mut table = Table::new();
                table.load_preset(UTF8_FULL);
                table.set_header(vec!["Property", "Value"]);
                table.add_row(vec!["Destination", &report.destination]);
                table.add_row(vec!["Strategy", &report.strategy]);
                table.add_row(vec!["Operations", &report.operations_description]);
                table.add_row(vec!["Enabled", &report.enabled_operations.join(", ")]);
                table.add_row(vec!["time()", &report.time.to_string()]);
                table.add_row(vec!["echo()", &report.echo]);
                table.to_string()
            }
            OutputFormat::Json => self.to_json_response(report, "demo"),
            OutputFormat::Quiet => String::new(),
        }
    }

    pub fn format_error(&self, error: &anyhow::Error, code: ExitCode, command: &str) -> String {
        match self.format {
            OutputFormat::Table => format!("Error: {error:#}"),
            OutputFormat::Json => {
                let response = JsonResponse::<()>::error(&format!("{error:#}"), code, command);
                serde_json::to_string_pretty(&response).unwrap_or_default()
            }
            OutputFormat::Quiet => String::new(),
        }
    }

    /// Progress message, shown in verbose table mode only.
    pub fn progress(&self, message: &str) {
        if self.verbose && self.format == OutputFormat::Table {
            eprintln!("... {message}");
        }
    }

    pub fn success(&self, message: &str) {
        if self.format == OutputFormat::Table {
            println!("✓ {message}");
        }
    }

    fn to_json_response<T: Serialize>(&self, value: &T, command: &str) -> String {
        let response = JsonResponse::success(value, command);
        serde_json::to_string_pretty(&response).unwrap_or_else(|e| {
            let err = JsonResponse::<()>::error(
                &format!("Serialization error: {e}"),
                ExitCode::GeneralError,
                command,
            );
            serde_json::to_string_pretty(&err).unwrap_or_default()
        })
    }
}

/// Shorten a hex identity id for tables unless verbose.
fn abbreviate(id: &str, verbose: bool) -> String {
    if verbose || id.chars().count() <= 16 {
        id.to_string()
    } else {
        format!("{}…", id.chars().take(16).collect::<String>())
    }
}
