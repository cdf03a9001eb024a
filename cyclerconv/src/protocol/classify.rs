//! Step classification
//!
//! Maps a Maccor `(StepType, StepMode)` pair onto the BioLogic control
//! type, the quantity the set point is expressed in, and the polarity.
//! Vendor tokens are matched through explicit alias tables after trimming
//! and lowercasing; nothing is guessed.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::core::ConvertError;
use crate::parser::schema::ProcedureStep;
use crate::protocol::units::Quantity;

/// Highest `Do n` / `Loop n` nesting index Maccor allows
pub const MAX_LOOP_INDEX: u8 = 5;

/// What a source step is, independent of its mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum StepKind {
    Rest,
    Charge,
    Discharge,
    /// Loop start marker `Do n`
    Do(u8),
    /// Loop end `Loop n`; carries the `Loop Cnt` end condition
    Loop(u8),
    AdvCycle,
    End,
}

impl StepKind {
    /// Steps that drive the cell and become a control sequence
    pub fn is_control(&self) -> bool {
        matches!(self, StepKind::Rest | StepKind::Charge | StepKind::Discharge)
    }
}

// Spelling taken from real procedure files: "Dischrge" is what Maccor writes.
const STEP_TYPE_ALIASES: &[(&str, StepKind)] = &[
    ("rest", StepKind::Rest),
    ("charge", StepKind::Charge),
    ("dischrge", StepKind::Discharge),
    ("discharge", StepKind::Discharge),
    ("advcycle", StepKind::AdvCycle),
    ("adv cycle", StepKind::AdvCycle),
    ("end", StepKind::End),
];

const STEP_MODE_ALIASES: &[(&str, ApplyMode)] = &[
    ("current", ApplyMode::Current),
    ("voltage", ApplyMode::Voltage),
    ("power", ApplyMode::Power),
    ("resistance", ApplyMode::Resistance),
];

/// Trim, lowercase and collapse inner whitespace.
pub(crate) fn normalize_token(raw: &str) -> String {
    raw.split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
        .to_lowercase()
}

/// Resolve a raw `StepType` to a [`StepKind`].
pub fn step_kind(step_type: &str) -> Option<StepKind> {
    let token = normalize_token(step_type);
    if let Some((_, kind)) = STEP_TYPE_ALIASES.iter().find(|(alias, _)| *alias == token) {
        return Some(*kind);
    }
    if let Some(n) = token.strip_prefix("do ").and_then(loop_index) {
        return Some(StepKind::Do(n));
    }
    if let Some(n) = token.strip_prefix("loop ").and_then(loop_index) {
        return Some(StepKind::Loop(n));
    }
    None
}

fn loop_index(token: &str) -> Option<u8> {
    token
        .parse::<u8>()
        .ok()
        .filter(|n| (1..=MAX_LOOP_INDEX).contains(n))
}

/// Like [`step_kind`] but reports the step number on failure.
pub fn classify_kind(step_num: usize, step: &ProcedureStep) -> Result<StepKind, ConvertError> {
    step_kind(&step.step_type).ok_or_else(|| unsupported(step_num, step))
}

/// Quantity the control set point is given in.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ApplyMode {
    Current,
    Voltage,
    Power,
    Resistance,
}

impl ApplyMode {
    pub fn quantity(&self) -> Quantity {
        match self {
            ApplyMode::Current => Quantity::Current,
            ApplyMode::Voltage => Quantity::Voltage,
            ApplyMode::Power => Quantity::Power,
            ApplyMode::Resistance => Quantity::Resistance,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Polarity {
    Charge,
    Discharge,
}

impl Polarity {
    pub fn as_str(&self) -> &'static str {
        match self {
            Polarity::Charge => "Charge",
            Polarity::Discharge => "Discharge",
        }
    }
}

impl fmt::Display for Polarity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// BioLogic Modulo Bat control types
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum CtrlType {
    Rest,
    CC,
    CV,
    CP,
    CR,
    Loop,
}

impl CtrlType {
    pub fn as_str(&self) -> &'static str {
        match self {
            CtrlType::Rest => "Rest",
            CtrlType::CC => "CC",
            CtrlType::CV => "CV",
            CtrlType::CP => "CP",
            CtrlType::CR => "CR",
            CtrlType::Loop => "Loop",
        }
    }
}

impl fmt::Display for CtrlType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Reference the control value is measured against (`ctrl1_val_vs`)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum CtrlReference {
    None,
    Ref,
}

impl CtrlReference {
    pub fn as_str(&self) -> &'static str {
        match self {
            CtrlReference::None => "<None>",
            CtrlReference::Ref => "Ref",
        }
    }
}

/// Result of classifying a control step
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct StepClass {
    pub ctrl_type: CtrlType,
    /// `None` for rest steps, which have no set point
    pub apply_mode: Option<ApplyMode>,
    pub polarity: Polarity,
}

impl StepClass {
    pub fn ctrl_reference(&self) -> CtrlReference {
        match self.ctrl_type {
            CtrlType::CV => CtrlReference::Ref,
            _ => CtrlReference::None,
        }
    }
}

/// Classify a control step's `(StepType, StepMode)`.
pub fn classify_step(step_num: usize, step: &ProcedureStep) -> Result<StepClass, ConvertError> {
    let polarity = match classify_kind(step_num, step)? {
        StepKind::Rest => {
            return Ok(StepClass {
                ctrl_type: CtrlType::Rest,
                apply_mode: None,
                polarity: Polarity::Charge,
            })
        }
        StepKind::Charge => Polarity::Charge,
        StepKind::Discharge => Polarity::Discharge,
        _ => return Err(unsupported(step_num, step)),
    };

    let mode_token = normalize_token(&step.step_mode);
    let apply_mode = STEP_MODE_ALIASES
        .iter()
        .find(|(alias, _)| *alias == mode_token)
        .map(|(_, mode)| *mode)
        .ok_or_else(|| unsupported(step_num, step))?;

    let ctrl_type = match apply_mode {
        ApplyMode::Current => CtrlType::CC,
        ApplyMode::Voltage => CtrlType::CV,
        ApplyMode::Power => CtrlType::CP,
        ApplyMode::Resistance => CtrlType::CR,
    };

    Ok(StepClass {
        ctrl_type,
        apply_mode: Some(apply_mode),
        polarity,
    })
}

fn unsupported(step_num: usize, step: &ProcedureStep) -> ConvertError {
    ConvertError::UnsupportedStep {
        step: step_num,
        detail: format!(
            "step type {:?} with mode {:?}",
            step.step_type.trim(),
            step.step_mode.trim()
        ),
    }
}
