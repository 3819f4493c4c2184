//! Output formatting: table, JSON, plain.
//!
//! Renders entity states in the format selected by `--output`. Table uses
//! `tabled`, structured formats use serde, plain emits one status per line.
//! Streamed changes color the status when color is enabled.

use std::io::{self, IsTerminal, Write};

use owo_colors::OwoColorize;
use serde::Serialize;
use serde_json::Value;
use tabled::{Table, Tabled, settings::Style};

use homesync_core::{EntityKey, StateValue};

use crate::cli::{ColorMode, OutputFormat};
use crate::error::CliError;

// ── Color helpers ────────────────────────────────────────────────────

/// Determine whether color output should be enabled.
pub fn should_color(mode: ColorMode) -> bool {
    match mode {
        ColorMode::Always => true,
        ColorMode::Never => false,
        ColorMode::Auto => io::stdout().is_terminal() && std::env::var("NO_COLOR").is_err(),
    }
}

fn paint_status(status: &str, color: bool) -> String {
    if !color {
        return status.to_owned();
    }
    match status {
        "on" | "open" | "home" | "playing" => status.green().to_string(),
        "off" | "closed" | "idle" => status.dimmed().to_string(),
        "unavailable" | "unknown" => status.red().to_string(),
        _ => status.cyan().to_string(),
    }
}

// ── Rows ─────────────────────────────────────────────────────────────

/// One entity as rendered by `get` and `watch`.
#[derive(Debug, Serialize)]
pub struct StateRow<'a> {
    pub entity_id: &'a EntityKey,
    #[serde(flatten)]
    pub value: &'a StateValue,
}

#[derive(Tabled)]
struct StateTableRow {
    #[tabled(rename = "Entity")]
    entity: String,
    #[tabled(rename = "State")]
    state: String,
}

#[derive(Tabled)]
struct StateDetailRow {
    #[tabled(rename = "Entity")]
    entity: String,
    #[tabled(rename = "State")]
    state: String,
    #[tabled(rename = "Attributes")]
    attributes: String,
}

impl From<&StateRow<'_>> for StateTableRow {
    fn from(row: &StateRow<'_>) -> Self {
        Self {
            entity: row.entity_id.to_string(),
            state: row.value.status.clone(),
        }
    }
}

impl From<&StateRow<'_>> for StateDetailRow {
    fn from(row: &StateRow<'_>) -> Self {
        let attributes = row
            .value
            .attributes
            .iter()
            .map(|(name, value)| match value {
                Value::String(text) => format!("{name}: {text}"),
                other => format!("{name}: {other}"),
            })
            .collect::<Vec<_>>()
            .join("\n");
        Self {
            entity: row.entity_id.to_string(),
            state: row.value.status.clone(),
            attributes,
        }
    }
}

// ── Render dispatchers ───────────────────────────────────────────────

/// Render a list of entity states; `attributes` adds an attribute column
/// to the table.
pub fn render_states(
    format: OutputFormat,
    rows: &[StateRow<'_>],
    attributes: bool,
) -> Result<String, CliError> {
    match format {
        OutputFormat::Table if attributes => Ok(render_table(
            &rows.iter().map(StateDetailRow::from).collect::<Vec<_>>(),
        )),
        OutputFormat::Table => Ok(render_table(
            &rows.iter().map(StateTableRow::from).collect::<Vec<_>>(),
        )),
        OutputFormat::Json => render_json_pretty(rows),
        OutputFormat::JsonCompact => render_json_compact(rows),
        OutputFormat::Plain => Ok(rows
            .iter()
            .map(|r| r.value.status.as_str())
            .collect::<Vec<_>>()
            .join("\n")),
    }
}

/// Render one state change as a single line (for streaming).
pub fn render_change(
    format: OutputFormat,
    row: &StateRow<'_>,
    color: bool,
) -> Result<String, CliError> {
    match format {
        OutputFormat::Table => Ok(format!(
            "{}  {}",
            row.entity_id,
            paint_status(&row.value.status, color)
        )),
        OutputFormat::Json | OutputFormat::JsonCompact => render_json_compact(row),
        OutputFormat::Plain => Ok(format!("{} {}", row.entity_id, row.value.status)),
    }
}

/// Render any serializable value (service call results and the like).
pub fn render_value<T: Serialize + ?Sized>(
    format: OutputFormat,
    data: &T,
) -> Result<String, CliError> {
    match format {
        OutputFormat::JsonCompact | OutputFormat::Plain => render_json_compact(data),
        OutputFormat::Table | OutputFormat::Json => render_json_pretty(data),
    }
}

/// Print the rendered output to stdout, respecting quiet mode.
pub fn print_output(output: &str, quiet: bool) {
    if quiet || output.is_empty() {
        return;
    }
    let mut stdout = io::stdout().lock();
    let _ = writeln!(stdout, "{output}");
}

// ── Format-specific renderers ────────────────────────────────────────

fn render_table<R: Tabled>(rows: &[R]) -> String {
    Table::new(rows).with(Style::rounded()).to_string()
}

/// Pretty-printed JSON.
pub(crate) fn render_json_pretty<T: Serialize + ?Sized>(data: &T) -> Result<String, CliError> {
    Ok(serde_json::to_string_pretty(data)?)
}

/// Compact single-line JSON.
pub(crate) fn render_json_compact<T: Serialize + ?Sized>(data: &T) -> Result<String, CliError> {
    Ok(serde_json::to_string(data)?)
}
