//! Modulo Bat sequence entries
//!
//! A [`SequenceEntry`] is one row of a Modulo Bat technique. Entries start
//! from [`SequenceEntry::blank`], a fresh value built per entry, and the
//! expander fills in what the source step defines.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::protocol::classify::{CtrlReference, CtrlType, Polarity};
use crate::protocol::limits::{Comparator, Measure, LIMIT_SLOTS, RECORD_SLOTS};
use crate::protocol::units::{ScaledValue, Unit};

/// Cycle count shown for a plain rest entry
pub const DEFAULT_N: &str = "1.00";

/// Cycle count shown for driven control entries
pub const CONTROL_N: &str = "15.00";

/// Where the technique goes once a limit triggers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum LimitAction {
    #[serde(rename = "Next sequence")]
    NextSequence,
    #[serde(rename = "Goto sequence")]
    GotoSequence,
    #[serde(rename = "End technique")]
    EndTechnique,
}

impl LimitAction {
    pub fn as_str(&self) -> &'static str {
        match self {
            LimitAction::NextSequence => "Next sequence",
            LimitAction::GotoSequence => "Goto sequence",
            LimitAction::EndTechnique => "End technique",
        }
    }
}

impl fmt::Display for LimitAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LimitSlot {
    pub measure: Measure,
    pub comparator: Comparator,
    pub value: ScaledValue,
    pub action: LimitAction,
    pub seq: usize,
}

impl LimitSlot {
    fn blank(ns: usize) -> Self {
        Self {
            measure: Measure::Time,
            comparator: Comparator::Less,
            value: ScaledValue::zero(Unit::Second),
            action: LimitAction::NextSequence,
            seq: ns + 1,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RecordSlot {
    pub measure: Measure,
    pub value: ScaledValue,
}

impl RecordSlot {
    fn blank() -> Self {
        Self {
            measure: Measure::Time,
            value: ScaledValue::zero(Unit::Second),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SequenceEntry {
    /// Sequence index, global across techniques
    pub ns: usize,
    pub ctrl_type: CtrlType,
    pub apply_ic: String,
    pub ctrl1: ScaledValue,
    pub ctrl1_vs: CtrlReference,
    /// Loop entries only: first sequence of the loop body
    pub ctrl_seq: usize,
    /// Loop entries only: additional passes through the body
    pub ctrl_repeat: u32,
    pub n: String,
    pub polarity: Polarity,
    pub lim_nb: usize,
    pub limits: [LimitSlot; LIMIT_SLOTS],
    pub rec_nb: usize,
    pub records: [RecordSlot; RECORD_SLOTS],
}

impl SequenceEntry {
    /// Disabled entry at `ns`: rest, no limits, no records, every limit
    /// falling through to the next sequence.
    pub fn blank(ns: usize) -> Self {
        Self {
            ns,
            ctrl_type: CtrlType::Rest,
            apply_ic: "I".to_string(),
            ctrl1: ScaledValue::zero(Unit::Volt),
            ctrl1_vs: CtrlReference::None,
            ctrl_seq: 0,
            ctrl_repeat: 0,
            n: DEFAULT_N.to_string(),
            polarity: Polarity::Charge,
            lim_nb: 0,
            limits: [LimitSlot::blank(ns), LimitSlot::blank(ns), LimitSlot::blank(ns)],
            rec_nb: 0,
            records: [RecordSlot::blank(), RecordSlot::blank()],
        }
    }

    /// Limits that are switched on (`lim_nb` of them).
    pub fn active_limits(&self) -> &[LimitSlot] {
        &self.limits[..self.lim_nb.min(LIMIT_SLOTS)]
    }

    pub fn active_records(&self) -> &[RecordSlot] {
        &self.records[..self.rec_nb.min(RECORD_SLOTS)]
    }

    /// Same entry renumbered by `-offset`, targets included.
    pub fn shifted(&self, offset: usize) -> Self {
        let mut entry = self.clone();
        entry.ns -= offset;
        if entry.ctrl_type == CtrlType::Loop {
            entry.ctrl_seq -= offset;
        }
        for limit in entry.limits.iter_mut() {
            limit.seq = limit.seq.saturating_sub(offset);
        }
        entry
    }

    /// Field values in [`SEQ_COLUMNS`] order.
    pub fn column_values(&self) -> Vec<String> {
        SEQ_COLUMNS
            .iter()
            .map(|column| self.field(column).unwrap_or_default())
            .collect()
    }

    /// Value of a single column by name.
    pub fn field(&self, column: &str) -> Option<String> {
        let value = match column {
            "Ns" => self.ns.to_string(),
            "ctrl_type" => self.ctrl_type.to_string(),
            "Apply I/C" => self.apply_ic.clone(),
            "ctrl1_val" => self.ctrl1.value.clone(),
            "ctrl1_val_unit" => self.ctrl1.unit.to_string(),
            "ctrl1_val_vs" => self.ctrl1_vs.as_str().to_string(),
            "ctrl_seq" => self.ctrl_seq.to_string(),
            "ctrl_repeat" => self.ctrl_repeat.to_string(),
            "N" => self.n.clone(),
            "charge/discharge" => self.polarity.to_string(),
            "lim_nb" => self.lim_nb.to_string(),
            "rec_nb" => self.rec_nb.to_string(),
            _ => {
                if let Some(rest) = column.strip_prefix("lim") {
                    let (slot, name) = slot_field(rest, LIMIT_SLOTS)?;
                    let limit = &self.limits[slot];
                    match name {
                        "type" => limit.measure.to_string(),
                        "comp" => limit.comparator.to_string(),
                        "value" => limit.value.value.clone(),
                        "value_unit" => limit.value.unit.to_string(),
                        "action" => limit.action.to_string(),
                        "seq" => limit.seq.to_string(),
                        _ => return None,
                    }
                } else if let Some(rest) = column.strip_prefix("rec") {
                    let (slot, name) = slot_field(rest, RECORD_SLOTS)?;
                    let record = &self.records[slot];
                    match name {
                        "type" => record.measure.to_string(),
                        "value" => record.value.value.clone(),
                        "value_unit" => record.value.unit.to_string(),
                        _ => return None,
                    }
                } else {
                    return None;
                }
            }
        };
        Some(value)
    }
}

/// `"2_type"` -> `(1, "type")`
fn slot_field(rest: &str, slots: usize) -> Option<(usize, &str)> {
    let (index, name) = rest.split_once('_')?;
    let index: usize = index.parse().ok()?;
    if index == 0 || index > slots {
        return None;
    }
    Some((index - 1, name))
}

/// Column names of the sequence table, in output order
pub const SEQ_COLUMNS: &[&str] = &[
    "Ns",
    "ctrl_type",
    "Apply I/C",
    "ctrl1_val",
    "ctrl1_val_unit",
    "ctrl1_val_vs",
    "ctrl_seq",
    "ctrl_repeat",
    "N",
    "charge/discharge",
    "lim_nb",
    "lim1_type",
    "lim1_comp",
    "lim1_value",
    "lim1_value_unit",
    "lim1_action",
    "lim1_seq",
    "lim2_type",
    "lim2_comp",
    "lim2_value",
    "lim2_value_unit",
    "lim2_action",
    "lim2_seq",
    "lim3_type",
    "lim3_comp",
    "lim3_value",
    "lim3_value_unit",
    "lim3_action",
    "lim3_seq",
    "rec_nb",
    "rec1_type",
    "rec1_value",
    "rec1_value_unit",
    "rec2_type",
    "rec2_value",
    "rec2_value_unit",
];
