//! Cycle advancement rules
//!
//! Maccor counts cycles with `AdvCycle` steps, which have no Modulo Bat
//! counterpart. The rules record which sequence transitions and technique
//! loop boundaries pass over `AdvCycle` markers, so a downstream controller
//! can keep the cycle index in step with the source procedure.

use std::collections::BTreeMap;
use std::convert::TryFrom;

use serde::{Deserialize, Serialize};

use crate::core::{ConvertError, Location};

/// `(from, to) -> cycle increments`
pub type TransitionMap = BTreeMap<(usize, usize), u32>;

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(into = "RulesDocument", try_from = "RulesDocument")]
pub struct CycleAdvancementRules {
    pub tech_num: usize,
    pub tech_does_loop: bool,
    pub adv_cycle_on_start: u32,
    pub adv_cycle_on_tech_loop: u32,
    /// Keyed by global sequence index
    pub adv_cycle_seq_transitions: TransitionMap,
    /// Keyed by source step number, for diagnostics only
    pub debug_adv_cycle_on_step_transitions: TransitionMap,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
struct Transition {
    from: usize,
    to: usize,
    adv: u32,
}

/// On-disk form: transition maps become sorted `{from, to, adv}` arrays.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
struct RulesDocument {
    tech_num: usize,
    tech_does_loop: bool,
    adv_cycle_on_start: u32,
    adv_cycle_on_tech_loop: u32,
    #[serde(default)]
    adv_cycle_seq_transitions: Vec<Transition>,
    #[serde(default)]
    debug_adv_cycle_on_step_transitions: Vec<Transition>,
}

fn to_transitions(map: &TransitionMap) -> Vec<Transition> {
    map.iter()
        .map(|(&(from, to), &adv)| Transition { from, to, adv })
        .collect()
}

fn from_transitions(list: Vec<Transition>, field: &str) -> Result<TransitionMap, String> {
    let mut map = TransitionMap::new();
    for t in list {
        if map.insert((t.from, t.to), t.adv).is_some() {
            return Err(format!("duplicate transition ({}, {}) in {}", t.from, t.to, field));
        }
    }
    Ok(map)
}

impl From<CycleAdvancementRules> for RulesDocument {
    fn from(rules: CycleAdvancementRules) -> Self {
        Self {
            tech_num: rules.tech_num,
            tech_does_loop: rules.tech_does_loop,
            adv_cycle_on_start: rules.adv_cycle_on_start,
            adv_cycle_on_tech_loop: rules.adv_cycle_on_tech_loop,
            adv_cycle_seq_transitions: to_transitions(&rules.adv_cycle_seq_transitions),
            debug_adv_cycle_on_step_transitions: to_transitions(&rules.debug_adv_cycle_on_step_transitions),
        }
    }
}

impl TryFrom<RulesDocument> for CycleAdvancementRules {
    type Error = String;

    fn try_from(doc: RulesDocument) -> Result<Self, Self::Error> {
        Ok(Self {
            tech_num: doc.tech_num,
            tech_does_loop: doc.tech_does_loop,
            adv_cycle_on_start: doc.adv_cycle_on_start,
            adv_cycle_on_tech_loop: doc.adv_cycle_on_tech_loop,
            adv_cycle_seq_transitions: from_transitions(doc.adv_cycle_seq_transitions, "adv_cycle_seq_transitions")?,
            debug_adv_cycle_on_step_transitions: from_transitions(
                doc.debug_adv_cycle_on_step_transitions,
                "debug_adv_cycle_on_step_transitions",
            )?,
        })
    }
}

/// JSON text form of [`CycleAdvancementRules`].
#[derive(Debug, Clone, Copy, Default)]
pub struct CycleAdvancementRulesSerializer;

impl CycleAdvancementRulesSerializer {
    pub fn json(&self, rules: &CycleAdvancementRules) -> Result<String, ConvertError> {
        serde_json::to_string_pretty(rules)
            .map_err(|e| ConvertError::parse(Location::document("rules"), e.to_string()))
    }

    pub fn parse_json(&self, text: &str) -> Result<CycleAdvancementRules, ConvertError> {
        serde_json::from_str(text).map_err(|e| ConvertError::parse(Location::document("rules"), e.to_string()))
    }
}

/// Accumulates rules during the expansion pass.
#[derive(Debug, Default)]
pub(crate) struct CycleTracker {
    rules: CycleAdvancementRules,
}

impl CycleTracker {
    pub(crate) fn new(tech_num: usize, tech_does_loop: bool) -> Self {
        Self {
            rules: CycleAdvancementRules {
                tech_num,
                tech_does_loop,
                ..Default::default()
            },
        }
    }

    /// Record an edge `(from_seq, from_step) -> (to_seq, to_step)` that
    /// passes `adv` `AdvCycle` markers. Edges passing none are not kept.
    pub(crate) fn record(&mut self, from: (usize, usize), to: (usize, usize), adv: u32) {
        if adv == 0 {
            return;
        }
        tracing::debug!(
            "seq {} -> {} (step {} -> {}) advances cycle by {}",
            from.0,
            to.0,
            from.1,
            to.1,
            adv
        );
        self.rules.adv_cycle_seq_transitions.insert((from.0, to.0), adv);
        self.rules
            .debug_adv_cycle_on_step_transitions
            .insert((from.1, to.1), adv);
    }

    pub(crate) fn finish(mut self, adv_cycle_on_start: u32, adv_cycle_on_tech_loop: u32) -> CycleAdvancementRules {
        self.rules.adv_cycle_on_start = adv_cycle_on_start;
        self.rules.adv_cycle_on_tech_loop = adv_cycle_on_tech_loop;
        self.rules
    }
}
