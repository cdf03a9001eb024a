//! End condition and report translation
//!
//! Maccor end conditions become BioLogic limit slots and report triggers
//! become record slots. Goto targets are kept as source step numbers here;
//! the expander resolves them to sequence indices once numbering is known.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::core::{ConvertError, Location};
use crate::parser::schema::{EndCondition, ProcedureStep, ReportTrigger};
use crate::protocol::classify::normalize_token;
use crate::protocol::units::{self, Quantity, ScaledValue};

/// Limit slots per Modulo Bat sequence
pub const LIMIT_SLOTS: usize = 3;

/// Record slots per Modulo Bat sequence
pub const RECORD_SLOTS: usize = 2;

/// Measured quantity a limit or record watches
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Measure {
    Ecell,
    I,
    Time,
    Power,
}

impl Measure {
    pub fn as_str(&self) -> &'static str {
        match self {
            Measure::Ecell => "Ecell",
            Measure::I => "I",
            Measure::Time => "Time",
            Measure::Power => "Power",
        }
    }

    pub fn quantity(&self) -> Quantity {
        match self {
            Measure::Ecell => Quantity::Voltage,
            Measure::I => Quantity::Current,
            Measure::Time => Quantity::Time,
            Measure::Power => Quantity::Power,
        }
    }
}

impl fmt::Display for Measure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Comparator {
    #[serde(rename = ">")]
    Greater,
    #[serde(rename = "<")]
    Less,
    #[serde(rename = "=")]
    Equal,
}

impl Comparator {
    pub fn as_str(&self) -> &'static str {
        match self {
            Comparator::Greater => ">",
            Comparator::Less => "<",
            Comparator::Equal => "=",
        }
    }
}

impl fmt::Display for Comparator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

const END_TYPE_ALIASES: &[(&str, Measure)] = &[
    ("voltage", Measure::Ecell),
    ("current", Measure::I),
    ("steptime", Measure::Time),
    ("step time", Measure::Time),
    ("power", Measure::Power),
];

const REPORT_TYPE_ALIASES: &[(&str, Measure)] = &[
    ("voltage", Measure::Ecell),
    ("current", Measure::I),
    ("steptime", Measure::Time),
    ("step time", Measure::Time),
    ("power", Measure::Power),
];

const LOOP_COUNT_END: &str = "loop cnt";

/// A translated end condition whose goto is still a source step number.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LimitSpec {
    pub measure: Measure,
    pub comparator: Comparator,
    pub value: ScaledValue,
    pub target_step: usize,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RecordSpec {
    pub measure: Measure,
    pub value: ScaledValue,
}

/// `Loop Cnt` end of a `Loop n` step.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LoopEnd {
    pub count: u32,
    pub target_step: usize,
}

fn end_field(index: usize, field: &str) -> String {
    format!("Ends/EndEntry[{}]/{}", index + 1, field)
}

fn report_field(index: usize, field: &str) -> String {
    format!("Reports/ReportEntry[{}]/{}", index + 1, field)
}

fn is_loop_count(end: &EndCondition) -> bool {
    normalize_token(&end.end_type) == LOOP_COUNT_END
}

fn parse_target(step_num: usize, index: usize, raw: &str) -> Result<usize, ConvertError> {
    raw.trim().parse::<usize>().map_err(|_| {
        ConvertError::parse(
            Location::step(step_num, end_field(index, "Step")),
            format!("invalid goto step {:?}", raw.trim()),
        )
    })
}

fn convert_value(
    quantity: Quantity,
    raw: &str,
    at: impl FnOnce() -> Location,
) -> Result<ScaledValue, ConvertError> {
    units::convert(quantity, raw.trim()).map_err(|e| ConvertError::from_unit(e, at()))
}

/// Translate one end condition of a control step.
pub fn translate_end(step_num: usize, index: usize, end: &EndCondition) -> Result<LimitSpec, ConvertError> {
    let end_type = normalize_token(&end.end_type);
    if end_type == LOOP_COUNT_END {
        return Err(ConvertError::UnsupportedStep {
            step: step_num,
            detail: format!("{} 'Loop Cnt' is only valid on Loop steps", end_field(index, "EndType")),
        });
    }

    let measure = END_TYPE_ALIASES
        .iter()
        .find(|(alias, _)| *alias == end_type)
        .map(|(_, m)| *m)
        .ok_or_else(|| ConvertError::UnsupportedStep {
            step: step_num,
            detail: format!("{} {:?}", end_field(index, "EndType"), end.end_type.trim()),
        })?;

    let comparator = match end.oper.trim() {
        ">=" => Comparator::Greater,
        "<=" => Comparator::Less,
        // step time only grows, reaching it means passing it
        "=" if measure == Measure::Time => Comparator::Greater,
        "=" => Comparator::Equal,
        other => {
            return Err(ConvertError::UnsupportedStep {
                step: step_num,
                detail: format!("{} {:?}", end_field(index, "Oper"), other),
            })
        }
    };

    let value = convert_value(measure.quantity(), &end.value, || {
        Location::step(step_num, end_field(index, "Value"))
    })?;
    let target_step = parse_target(step_num, index, &end.step)?;

    Ok(LimitSpec {
        measure,
        comparator,
        value,
        target_step,
    })
}

/// Translate all end conditions of a control step into limit specs.
pub fn translate_ends(step_num: usize, step: &ProcedureStep) -> Result<Vec<LimitSpec>, ConvertError> {
    if step.ends.len() > LIMIT_SLOTS {
        return Err(ConvertError::Capacity {
            step: step_num,
            what: "end conditions",
            count: step.ends.len(),
            capacity: LIMIT_SLOTS,
        });
    }
    if step.ends.is_empty() {
        tracing::warn!("step {} has no end condition", step_num);
    }
    step.ends
        .iter()
        .enumerate()
        .map(|(i, end)| translate_end(step_num, i, end))
        .collect()
}

pub fn translate_report(step_num: usize, index: usize, report: &ReportTrigger) -> Result<RecordSpec, ConvertError> {
    let report_type = normalize_token(&report.report_type);
    let measure = REPORT_TYPE_ALIASES
        .iter()
        .find(|(alias, _)| *alias == report_type)
        .map(|(_, m)| *m)
        .ok_or_else(|| ConvertError::UnsupportedStep {
            step: step_num,
            detail: format!("{} {:?}", report_field(index, "ReportType"), report.report_type.trim()),
        })?;

    let value = convert_value(measure.quantity(), &report.value, || {
        Location::step(step_num, report_field(index, "Value"))
    })?;

    Ok(RecordSpec { measure, value })
}

pub fn translate_reports(step_num: usize, step: &ProcedureStep) -> Result<Vec<RecordSpec>, ConvertError> {
    if step.reports.len() > RECORD_SLOTS {
        return Err(ConvertError::Capacity {
            step: step_num,
            what: "report triggers",
            count: step.reports.len(),
            capacity: RECORD_SLOTS,
        });
    }
    step.reports
        .iter()
        .enumerate()
        .map(|(i, report)| translate_report(step_num, i, report))
        .collect()
}

/// Read the repeat count and exit goto of a `Loop n` step.
pub fn loop_end(step_num: usize, step: &ProcedureStep) -> Result<LoopEnd, ConvertError> {
    let mut loop_ends = step.ends.iter().enumerate().filter(|(_, e)| is_loop_count(e));
    let (index, end) = loop_ends.next().ok_or_else(|| ConvertError::UnsupportedStep {
        step: step_num,
        detail: "loop step without a 'Loop Cnt' end condition".to_string(),
    })?;
    if loop_ends.next().is_some() || step.ends.len() > 1 {
        return Err(ConvertError::UnsupportedStep {
            step: step_num,
            detail: "loop step must have exactly one end condition".to_string(),
        });
    }

    let raw = end.value.trim();
    let count = raw.parse::<i64>().map_err(|_| {
        ConvertError::parse(
            Location::step(step_num, end_field(index, "Value")),
            format!("invalid loop count {:?}", raw),
        )
    })?;
    if count < 1 || count > i64::from(u32::MAX) {
        return Err(ConvertError::Range {
            at: Location::step(step_num, end_field(index, "Value")),
            message: format!("loop count {} must be at least 1", count),
        });
    }

    let target_step = parse_target(step_num, index, &end.step)?;
    if target_step != step_num + 1 {
        return Err(ConvertError::UnsupportedStep {
            step: step_num,
            detail: format!(
                "loop exit goes to step {}, only the following step ({}) is supported",
                target_step,
                step_num + 1
            ),
        });
    }

    Ok(LoopEnd {
        count: count as u32,
        target_step,
    })
}
