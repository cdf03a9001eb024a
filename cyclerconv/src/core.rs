//! Conversion entry points shared by the CLI and library users.

use std::fmt;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::parser::maccor::{MaccorAdapter, MaccorParseError};
use crate::parser::ProcedureAdapter;
use crate::parser::schema::Procedure;
use crate::protocol::cycle::CycleAdvancementRulesSerializer;
use crate::protocol::expand::expand_procedure;
use crate::protocol::plan::SequencePlan;
use crate::protocol::units::UnitError;
use crate::protocol::writer::{write_table, TableLayout};
use crate::protocol::ConvertedProtocol;

/// Where in the source a problem was found.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Location {
    pub step: Option<usize>,
    pub field: String,
}

impl Location {
    pub fn step(step: usize, field: impl Into<String>) -> Self {
        Self {
            step: Some(step),
            field: field.into(),
        }
    }

    pub fn document(field: impl Into<String>) -> Self {
        Self {
            step: None,
            field: field.into(),
        }
    }
}

impl fmt::Display for Location {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.step {
            Some(step) => write!(f, "step {} ({})", step, self.field),
            None => write!(f, "{}", self.field),
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ConvertError {
    #[error("Parse error at {at}: {message}")]
    Parse { at: Location, message: String },

    #[error("Unsupported step {step}: {detail}")]
    UnsupportedStep { step: usize, detail: String },

    #[error("Step {step} has {count} {what}, target allows {capacity}")]
    Capacity {
        step: usize,
        what: &'static str,
        count: usize,
        capacity: usize,
    },

    #[error("Value out of range at {at}: {message}")]
    Range { at: Location, message: String },

    #[error("Step {step} refers to step {target}, which does not exist")]
    Reference { step: usize, target: usize },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl ConvertError {
    pub(crate) fn parse(at: Location, message: impl Into<String>) -> Self {
        ConvertError::Parse {
            at,
            message: message.into(),
        }
    }

    /// Attach source location to a unit conversion failure.
    pub(crate) fn from_unit(err: UnitError, at: Location) -> Self {
        match err {
            UnitError::InvalidNumber(_) | UnitError::InvalidDuration(_) => ConvertError::Parse {
                at,
                message: err.to_string(),
            },
            UnitError::OutOfRange { .. } => ConvertError::Range {
                at,
                message: err.to_string(),
            },
        }
    }

    /// Offending step number, when the error is tied to one.
    pub fn step(&self) -> Option<usize> {
        match self {
            ConvertError::Parse { at, .. } | ConvertError::Range { at, .. } => at.step,
            ConvertError::UnsupportedStep { step, .. }
            | ConvertError::Capacity { step, .. }
            | ConvertError::Reference { step, .. } => Some(*step),
            ConvertError::Io(_) => None,
        }
    }
}

impl From<MaccorParseError> for ConvertError {
    fn from(e: MaccorParseError) -> Self {
        match e {
            MaccorParseError::Io(io) => ConvertError::Io(io),
            other => ConvertError::parse(Location::document("document"), other.to_string()),
        }
    }
}

/// Options for a conversion run (CLI flags or a JSON config file).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConversionOptions {
    /// Turn a loop that wraps the tail of the procedure into a looping technique
    #[serde(default = "default_technique_loop")]
    pub technique_loop: bool,
    /// Upper bound on generated sequences, guards loop unrolling
    #[serde(default = "default_max_sequence_entries")]
    pub max_sequence_entries: usize,
    #[serde(default)]
    pub layout: TableLayout,
}

fn default_technique_loop() -> bool {
    true
}

fn default_max_sequence_entries() -> usize {
    1000
}

impl Default for ConversionOptions {
    fn default() -> Self {
        Self {
            technique_loop: default_technique_loop(),
            max_sequence_entries: default_max_sequence_entries(),
            layout: TableLayout::default(),
        }
    }
}

impl ConversionOptions {
    pub fn from_json_str(content: &str) -> Result<Self, ConvertError> {
        serde_json::from_str(content)
            .map_err(|e| ConvertError::parse(Location::document("config"), e.to_string()))
    }

    pub fn from_json_file(path: &Path) -> Result<Self, ConvertError> {
        let content = std::fs::read_to_string(path)?;
        Self::from_json_str(&content)
    }
}

/// Paths written by [`ProtocolConverter::write_outputs`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WrittenOutputs {
    pub table: PathBuf,
    pub rules: PathBuf,
}

/// Maccor procedure to BioLogic Modulo Bat converter.
#[derive(Debug, Clone, Default)]
pub struct ProtocolConverter {
    options: ConversionOptions,
}

impl ProtocolConverter {
    pub fn new(options: ConversionOptions) -> Self {
        Self { options }
    }

    pub fn options(&self) -> &ConversionOptions {
        &self.options
    }

    /// Convert a Maccor procedure file.
    pub fn convert_file(&self, path: &Path) -> Result<ConvertedProtocol, ConvertError> {
        tracing::info!("Converting procedure: {}", path.display());
        let adapter = MaccorAdapter;
        if !adapter.can_handle(path) {
            tracing::debug!(
                "{} has no {} extension, parsing anyway",
                path.display(),
                adapter.format_name()
            );
        }
        let procedure = adapter.parse_file(path)?;
        self.convert_procedure(&procedure)
    }

    /// Convert Maccor procedure XML text.
    pub fn convert_str(&self, xml: &str) -> Result<ConvertedProtocol, ConvertError> {
        let procedure = MaccorAdapter.parse_str(xml)?;
        self.convert_procedure(&procedure)
    }

    /// Numbering prepass followed by the expansion pass. Any failing step
    /// aborts the whole conversion.
    pub fn convert_procedure(&self, procedure: &Procedure) -> Result<ConvertedProtocol, ConvertError> {
        let plan = SequencePlan::build(procedure, &self.options)?;
        let converted = expand_procedure(procedure, &plan)?;
        tracing::info!(
            "Converted {} steps into {} sequences across {} technique(s)",
            procedure.len(),
            converted.entry_count(),
            converted.techniques.len()
        );
        Ok(converted)
    }

    /// Render the sequence table in the configured layout.
    pub fn render_table(&self, protocol: &ConvertedProtocol) -> String {
        write_table(protocol, self.options.layout)
    }

    /// Write the sequence table and the cycle advancement rules side by side.
    pub fn write_outputs(
        &self,
        protocol: &ConvertedProtocol,
        table_path: &Path,
        rules_path: &Path,
    ) -> Result<WrittenOutputs, ConvertError> {
        let rules_json = CycleAdvancementRulesSerializer.json(&protocol.rules)?;
        std::fs::write(table_path, self.render_table(protocol))?;
        std::fs::write(rules_path, rules_json)?;
        tracing::info!(
            "Wrote {} and {}",
            table_path.display(),
            rules_path.display()
        );
        Ok(WrittenOutputs {
            table: table_path.to_path_buf(),
            rules: rules_path.to_path_buf(),
        })
    }
}

/// Default rules path next to a table: `diag.mps` -> `diag.rules.json`.
pub fn rules_path_for(table_path: &Path) -> PathBuf {
    table_path.with_extension("rules.json")
}
