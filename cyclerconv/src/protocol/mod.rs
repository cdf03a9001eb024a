//! Maccor to BioLogic protocol conversion
//!
//! The conversion runs in two passes. [`plan`] assigns every sequence index
//! up front; [`expand`] then fills each entry using [`classify`],
//! [`limits`] and [`units`], recording [`cycle`] rules as it goes.

pub mod classify;
pub mod cycle;
pub mod expand;
pub mod limits;
pub mod plan;
pub mod sequence;
pub mod units;
pub mod writer;

use std::collections::BTreeMap;

use serde::Serialize;

pub use cycle::{CycleAdvancementRules, CycleAdvancementRulesSerializer};
pub use expand::convert_step_parts;
pub use plan::{GotoBounds, SequencePlan};
pub use sequence::{SequenceEntry, SEQ_COLUMNS};
pub use writer::TableLayout;

/// One Modulo Bat technique of a converted procedure.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ConvertedTechnique {
    /// 1-based technique number
    pub number: usize,
    pub first_step: usize,
    pub last_step: usize,
    /// Times the technique runs when it loops
    pub loop_count: Option<u32>,
    /// Global index of the first entry
    pub first_ns: usize,
    pub entries: Vec<SequenceEntry>,
}

impl ConvertedTechnique {
    pub fn does_loop(&self) -> bool {
        self.loop_count.is_some()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ConvertedProtocol {
    pub techniques: Vec<ConvertedTechnique>,
    pub rules: CycleAdvancementRules,
    pub seq_nums_by_step_num: BTreeMap<usize, Vec<usize>>,
    pub end_step_num: usize,
}

impl ConvertedProtocol {
    pub fn entry_count(&self) -> usize {
        self.techniques.iter().map(|t| t.entries.len()).sum()
    }

    /// All entries in global sequence order.
    pub fn entries(&self) -> impl Iterator<Item = &SequenceEntry> {
        self.techniques.iter().flat_map(|t| t.entries.iter())
    }

    pub fn entry(&self, ns: usize) -> Option<&SequenceEntry> {
        self.entries().find(|e| e.ns == ns)
    }
}
