use std::io::IsTerminal;

use clap::ValueEnum;
use comfy_table::{presets::UTF8_FULL, ContentArrangement, Table};
use serde::Serialize;

#[derive(Clone, Debug, Copy, ValueEnum)]
pub enum OutputFormat {
    Json,
    Table,
    Pretty,
}

impl OutputFormat {
    pub fn default_for_stdout() -> Self {
        if std::io::stdout().is_terminal() {
            Self::Table
        } else {
            Self::Json
        }
    }
}

/// One decoded PDU from a capture.
#[derive(Debug, Serialize)]
pub struct PduRow {
    pub index: usize,
    pub offset: usize,
    pub pdu_type: String,
    pub hlen: u8,
    pub pdo: u8,
    pub plen: u32,
    pub summary: String,
    /// Validation failure, if any.
    pub error: Option<String>,
}

pub fn print_pdus(rows: &[PduRow], format: OutputFormat) {
    match format {
        OutputFormat::Json => {
            for row in rows {
                println!(
                    "{}",
                    serde_json::to_string(row).unwrap_or_else(|_| "{}".to_string())
                );
            }
        }
        OutputFormat::Table => {
            let mut table = Table::new();
            table
                .load_preset(UTF8_FULL)
                .set_content_arrangement(ContentArrangement::Dynamic)
                .set_header(vec![
                    "#", "OFFSET", "TYPE", "HLEN", "PDO", "PLEN", "DETAIL", "ERROR",
                ]);
            for row in rows {
                table.add_row(vec![
                    row.index.to_string(),
                    row.offset.to_string(),
                    row.pdu_type.clone(),
                    row.hlen.to_string(),
                    row.pdo.to_string(),
                    row.plen.to_string(),
                    row.summary.clone(),
                    row.error.clone().unwrap_or_default(),
                ]);
            }
            println!("{table}");
        }
        OutputFormat::Pretty => {
            for row in rows {
                let error = row
                    .error
                    .as_ref()
                    .map(|err| format!(" error={err}"))
                    .unwrap_or_default();
                println!(
                    "#{} @{} {} hlen={} pdo={} plen={} {}{}",
                    row.index,
                    row.offset,
                    row.pdu_type,
                    row.hlen,
                    row.pdo,
                    row.plen,
                    row.summary,
                    error
                );
            }
        }
    }
}

/// Print a flat serializable record: one JSON line, or a two-column table.
pub fn print_record<T: Serialize>(record: &T, format: OutputFormat) {
    if let OutputFormat::Json = format {
        println!(
            "{}",
            serde_json::to_string(record).unwrap_or_else(|_| "{}".to_string())
        );
        return;
    }

    let fields = match serde_json::to_value(record) {
        Ok(serde_json::Value::Object(fields)) => fields,
        _ => return,
    };
    match format {
        OutputFormat::Table => {
            let mut table = Table::new();
            table
                .load_preset(UTF8_FULL)
                .set_content_arrangement(ContentArrangement::Dynamic)
                .set_header(vec!["FIELD", "VALUE"]);
            for (key, value) in &fields {
                table.add_row(vec![key.clone(), display_value(value)]);
            }
            println!("{table}");
        }
        _ => {
            for (key, value) in &fields {
                println!("{key}: {}", display_value(value));
            }
        }
    }
}

fn display_value(value: &serde_json::Value) -> String {
    match value {
        serde_json::Value::String(text) => text.clone(),
        serde_json::Value::Null => "-".to_string(),
        other => other.to_string(),
    }
}
