use serde::{Deserialize, Serialize};

/// A parsed test procedure: an ordered list of steps, numbered from 1.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Procedure {
    pub steps: Vec<ProcedureStep>,
}

impl Procedure {
    pub fn new(steps: Vec<ProcedureStep>) -> Self {
        Self { steps }
    }

    /// Look up a step by its 1-based step number.
    pub fn step(&self, step_num: usize) -> Option<&ProcedureStep> {
        step_num.checked_sub(1).and_then(|i| self.steps.get(i))
    }

    pub fn len(&self) -> usize {
        self.steps.len()
    }

    pub fn is_empty(&self) -> bool {
        self.steps.is_empty()
    }

    /// Iterate over `(step_num, step)` pairs.
    pub fn numbered(&self) -> impl Iterator<Item = (usize, &ProcedureStep)> {
        self.steps.iter().enumerate().map(|(i, s)| (i + 1, s))
    }
}

/// One `TestStep` element. Text fields are kept exactly as they appear in
/// the source (vendor files pad them with spaces).
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ProcedureStep {
    pub step_type: String,  // "Rest", "Dischrge", "Do 1", "AdvCycle"
    pub step_mode: String,  // "Current", "Voltage", often blank
    pub step_value: String, // numeric string in base units
    pub safety_limits: Vec<SafetyLimit>,
    pub ends: Vec<EndCondition>,
    pub reports: Vec<ReportTrigger>,
    pub range: String,
    pub options: [String; 3],
    pub note: String,
}

/// Raw child of the `Limits` element. Safety limits have no target
/// counterpart and are only carried for diagnostics.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SafetyLimit {
    pub name: String,
    pub text: String,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct EndCondition {
    pub end_type: String,
    pub special_type: String,
    pub oper: String,
    pub step: String, // goto step number, zero padded ("002")
    pub value: String,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ReportTrigger {
    pub report_type: String,
    pub value: String,
}
