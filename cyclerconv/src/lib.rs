//! cyclerconv - battery cycler protocol conversion and telemetry normalization
//!
//! Converts Maccor XML test procedures into BioLogic Modulo Bat sequence
//! tables, together with the cycle advancement rules a controller needs to
//! keep Maccor cycle numbering. Also normalizes cycler telemetry tables to a
//! canonical column schema.
//!
//! # Quick Start
//!
//! ```no_run
//! use cyclerconv::{ConversionOptions, ProtocolConverter};
//! use std::path::Path;
//!
//! let converter = ProtocolConverter::new(ConversionOptions::default());
//! let protocol = converter.convert_file(Path::new("diagnostic.000")).unwrap();
//!
//! for entry in protocol.entries() {
//!     println!("{} {}", entry.ns, entry.ctrl_type);
//! }
//! println!("{:?}", protocol.rules);
//! ```
//!
//! # Features
//!
//! - **Procedure parsing**: `MaccorTestProcedure` XML into typed steps
//! - **Protocol conversion**: unit ladders, limits, loops, technique split
//! - **Cycle rules**: `AdvCycle` bookkeeping with a lossless JSON form
//! - **Telemetry**: column mapping, dtype coercion, timestamps

pub mod core;
pub mod parser;
pub mod protocol;
pub mod telemetry;

// Re-export main types
pub use crate::core::{rules_path_for, ConversionOptions, ConvertError, Location, ProtocolConverter, WrittenOutputs};
pub use parser::maccor::MaccorParser;
pub use parser::schema::{EndCondition, Procedure, ProcedureStep, ReportTrigger};
pub use protocol::{
    ConvertedProtocol, ConvertedTechnique, CycleAdvancementRules, CycleAdvancementRulesSerializer,
    SequenceEntry, TableLayout,
};
pub use telemetry::{TelemetryError, TelemetryTable};

/// Parse a procedure file (convenience wrapper).
pub fn parse_procedure(path: &std::path::Path) -> Result<Procedure, ConvertError> {
    MaccorParser::parse_procedure(path).map_err(ConvertError::from)
}

/// Convert a procedure file with default options (convenience wrapper).
pub fn convert_file(path: &std::path::Path) -> Result<ConvertedProtocol, ConvertError> {
    ProtocolConverter::default().convert_file(path)
}

/// Prelude for convenient imports.
pub mod prelude {
    pub use crate::{
        ConversionOptions, ConvertError, ConvertedProtocol, CycleAdvancementRules,
        CycleAdvancementRulesSerializer, ProtocolConverter, SequenceEntry, TableLayout,
    };
}
