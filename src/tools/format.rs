//! Text rendering of tabular results.
//!
//! `executeQuery` and `explainQuery` can return their rows rendered as an
//! ASCII table (MySQL client style) or a Markdown table in addition to the
//! structured rows.

use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value as JsonValue};
use unicode_width::UnicodeWidthStr;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "lowercase")]
pub enum OutputFormat {
    /// Structured rows only (default)
    #[default]
    Json,
    /// Structured rows plus an ASCII table
    Table,
    /// Structured rows plus a Markdown table
    Markdown,
}

/// Summary line facts shared by both renderings.
#[derive(Debug, Clone, Copy)]
pub struct Footer {
    pub row_count: usize,
    pub truncated: bool,
    pub execution_time_ms: u64,
}

/// Render rows in the requested format; `None` for [`OutputFormat::Json`].
pub fn render(
    format: OutputFormat,
    columns: &[String],
    rows: &[Map<String, JsonValue>],
    footer: Footer,
) -> Option<String> {
    match format {
        OutputFormat::Json => None,
        OutputFormat::Table => Some(format_as_table(columns, rows, footer)),
        OutputFormat::Markdown => Some(format_as_markdown(columns, rows, footer)),
    }
}

pub fn format_value(value: &JsonValue) -> String {
    match value {
        JsonValue::Null => "NULL".to_string(),
        JsonValue::String(s) => s.clone(),
        other => other.to_string(),
    }
}

/// Table cells are single-line.
fn cell(value: &JsonValue) -> String {
    format_value(value).replace(['\n', '\r'], " ")
}

fn truncation_note(footer: &Footer) -> &'static str {
    if footer.truncated { ", truncated" } else { "" }
}

pub fn format_as_table(columns: &[String], rows: &[Map<String, JsonValue>], footer: Footer) -> String {
    if columns.is_empty() {
        return "Empty set\n".to_string();
    }

    let cells: Vec<Vec<(String, bool)>> = rows
        .iter()
        .map(|row| {
            columns
                .iter()
                .map(|col| {
                    let value = row.get(col).unwrap_or(&JsonValue::Null);
                    (cell(value), value.is_number())
                })
                .collect()
        })
        .collect();

    let mut widths: Vec<usize> = columns.iter().map(|c| c.width()).collect();
    for row in &cells {
        for (i, (text, _)) in row.iter().enumerate() {
            widths[i] = widths[i].max(text.width());
        }
    }

    let separator: String = widths
        .iter()
        .map(|w| format!("+{}", "-".repeat(w + 2)))
        .collect::<String>()
        + "+\n";

    let mut output = separator.clone();
    for (col, w) in columns.iter().zip(&widths) {
        output.push_str(&format!("| {} ", pad(col, *w, Align::Center)));
    }
    output.push_str("|\n");
    output.push_str(&separator);

    for row in &cells {
        for ((text, numeric), w) in row.iter().zip(&widths) {
            let align = if *numeric { Align::Right } else { Align::Left };
            output.push_str(&format!("| {} ", pad(text, *w, align)));
        }
        output.push_str("|\n");
    }
    output.push_str(&separator);

    let row_text = if footer.row_count == 1 { "row" } else { "rows" };
    output.push_str(&format!(
        "{} {} in set ({:.2} sec{})\n",
        footer.row_count,
        row_text,
        footer.execution_time_ms as f64 / 1000.0,
        truncation_note(&footer)
    ));
    output
}

pub fn format_as_markdown(
    columns: &[String],
    rows: &[Map<String, JsonValue>],
    footer: Footer,
) -> String {
    if columns.is_empty() {
        return "*Empty set*\n".to_string();
    }

    let escape = |s: String| s.replace('|', "\\|");
    let mut output: String = columns
        .iter()
        .map(|c| format!("| {} ", escape(c.clone())))
        .collect::<String>()
        + "|\n";
    output.push_str(&(columns.iter().map(|_| "|---").collect::<String>() + "|\n"));

    for row in rows {
        for col in columns {
            let value = row.get(col).unwrap_or(&JsonValue::Null);
            output.push_str(&format!("| {} ", escape(cell(value))));
        }
        output.push_str("|\n");
    }

    output.push_str(&format!("\n*{} rows{}*\n", footer.row_count, truncation_note(&footer)));
    output
}

#[derive(Clone, Copy)]
enum Align {
    Left,
    Right,
    Center,
}

/// Pad by display width; `format!` width specifiers count chars, not columns.
fn pad(text: &str, width: usize, align: Align) -> String {
    let fill = width.saturating_sub(text.width());
    let (left, right) = match align {
        Align::Left => (0, fill),
        Align::Right => (fill, 0),
        Align::Center => (fill / 2, fill - fill / 2),
    };
    format!("{}{}{}", " ".repeat(left), text, " ".repeat(right))
}
