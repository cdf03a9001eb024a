//! Sequence table output
//!
//! Two layouts:
//! - `rows`: tab separated, a header of column names then one row per
//!   entry, global `Ns`
//! - `mps`: BioLogic settings layout, one line per field and one 20
//!   character column per entry, `Ns` local to each technique

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::protocol::sequence::SEQ_COLUMNS;
use crate::protocol::ConvertedProtocol;

const MPS_HEADER: &str = "BT-LAB SETTING FILE";
const COLUMN_WIDTH: usize = 20;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TableLayout {
    #[default]
    Rows,
    Mps,
}

impl fmt::Display for TableLayout {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TableLayout::Rows => f.write_str("rows"),
            TableLayout::Mps => f.write_str("mps"),
        }
    }
}

impl FromStr for TableLayout {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "rows" => Ok(TableLayout::Rows),
            "mps" => Ok(TableLayout::Mps),
            other => Err(format!("unknown layout '{}', expected rows or mps", other)),
        }
    }
}

pub fn write_table(protocol: &ConvertedProtocol, layout: TableLayout) -> String {
    match layout {
        TableLayout::Rows => write_rows(protocol),
        TableLayout::Mps => write_mps(protocol),
    }
}

pub fn write_rows(protocol: &ConvertedProtocol) -> String {
    let mut out = SEQ_COLUMNS.join("\t");
    out.push('\n');
    for entry in protocol.entries() {
        out.push_str(&entry.column_values().join("\t"));
        out.push('\n');
    }
    out
}

fn padded_line(name: &str, values: impl IntoIterator<Item = String>) -> String {
    let mut line = format!("{:<width$}", name, width = COLUMN_WIDTH);
    for value in values {
        line.push_str(&format!("{:<width$}", value, width = COLUMN_WIDTH));
    }
    line.trim_end().to_string()
}

pub fn write_mps(protocol: &ConvertedProtocol) -> String {
    let linked = protocol.techniques.len() + protocol.techniques.iter().filter(|t| t.does_loop()).count();
    let mut lines = vec![
        MPS_HEADER.to_string(),
        String::new(),
        format!("Number of linked techniques : {}", linked),
        String::new(),
    ];

    let mut number = 0;
    for tech in &protocol.techniques {
        number += 1;
        let target = number;
        let local: Vec<_> = tech.entries.iter().map(|e| e.shifted(tech.first_ns)).collect();

        lines.push(format!("Technique : {}", number));
        lines.push("Modulo Bat".to_string());
        for column in SEQ_COLUMNS {
            lines.push(padded_line(
                column,
                local.iter().map(|e| e.field(column).unwrap_or_default()),
            ));
        }
        lines.push(String::new());

        if let Some(count) = tech.loop_count {
            number += 1;
            lines.push(format!("Technique : {}", number));
            lines.push("Loop".to_string());
            lines.push(padded_line("goto Ne", [target.to_string()]));
            lines.push(padded_line("nt", [count.saturating_sub(1).to_string()]));
            lines.push(String::new());
        }
    }

    let mut out = lines.join("\n");
    out.push('\n');
    out
}
