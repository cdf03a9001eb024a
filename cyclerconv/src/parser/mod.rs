//! Procedure parsers
//!
//! Each supported source format implements [`ProcedureAdapter`] and
//! produces the vendor-neutral [`Procedure`] model.

pub mod maccor;
pub mod schema;

use std::path::Path;

// Re-export for convenience
pub use maccor::{MaccorAdapter, MaccorParseError, MaccorParser};
pub use schema::*;

/// Trait for reading a vendor procedure file into a [`Procedure`]
pub trait ProcedureAdapter {
    /// Human readable name of the source format
    fn format_name(&self) -> &'static str;

    /// File extensions this adapter can handle
    fn supported_extensions(&self) -> &[&str];

    /// Check if this adapter can handle a file
    fn can_handle(&self, path: &Path) -> bool {
        path.extension()
            .and_then(|ext| ext.to_str())
            .map(|ext| {
                self.supported_extensions()
                    .iter()
                    .any(|&supported| supported.eq_ignore_ascii_case(ext))
            })
            .unwrap_or(false)
    }

    /// Parse procedure text
    fn parse_str(&self, content: &str) -> Result<Procedure, MaccorParseError>;

    /// Read and parse a procedure file
    fn parse_file(&self, path: &Path) -> Result<Procedure, MaccorParseError> {
        let content = std::fs::read_to_string(path)?;
        self.parse_str(&content)
    }
}
