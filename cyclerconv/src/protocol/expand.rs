//! Step to sequence expansion
//!
//! Second pass of the conversion: with every sequence index known from the
//! [`SequencePlan`], each entry is built from a fresh blank sequence and the
//! fields its source step defines. Cycle advancement rules are collected
//! in the same pass.

use std::collections::BTreeMap;

use crate::core::{ConvertError, Location};
use crate::parser::schema::{Procedure, ProcedureStep};
use crate::protocol::classify::{classify_kind, classify_step, step_kind, CtrlType, StepKind};
use crate::protocol::cycle::CycleTracker;
use crate::protocol::limits::{translate_ends, translate_reports, LimitSpec};
use crate::protocol::plan::{GotoBounds, PlanItem, SequencePlan, TechniquePlan};
use crate::protocol::sequence::{LimitAction, SequenceEntry, CONTROL_N};
use crate::protocol::units;
use crate::protocol::{ConvertedProtocol, ConvertedTechnique};

/// Build the entry for a control step at `ns`.
///
/// `resolve` maps a limit's goto step to a sequence index, or `None` to
/// end the technique.
pub(crate) fn populate_entry<F>(
    step: &ProcedureStep,
    step_num: usize,
    ns: usize,
    mut resolve: F,
) -> Result<SequenceEntry, ConvertError>
where
    F: FnMut(&LimitSpec) -> Result<Option<usize>, ConvertError>,
{
    let class = classify_step(step_num, step)?;
    let mut entry = SequenceEntry::blank(ns);
    entry.ctrl_type = class.ctrl_type;
    entry.polarity = class.polarity;
    entry.ctrl1_vs = class.ctrl_reference();

    if let Some(mode) = class.apply_mode {
        entry.ctrl1 = units::convert(mode.quantity(), step.step_value.trim())
            .map_err(|e| ConvertError::from_unit(e, Location::step(step_num, "StepValue")))?;
        entry.n = CONTROL_N.to_string();
    }

    if !step.safety_limits.is_empty() {
        tracing::warn!(
            "step {}: {} safety limit(s) have no Modulo Bat counterpart and are ignored",
            step_num,
            step.safety_limits.len()
        );
    }

    let limits = translate_ends(step_num, step)?;
    entry.lim_nb = limits.len();
    for (slot, spec) in entry.limits.iter_mut().zip(&limits) {
        slot.measure = spec.measure;
        slot.comparator = spec.comparator;
        slot.value = spec.value.clone();
        match resolve(spec)? {
            Some(seq) => {
                slot.action = if seq == ns + 1 {
                    LimitAction::NextSequence
                } else {
                    LimitAction::GotoSequence
                };
                slot.seq = seq;
            }
            None => {
                slot.action = LimitAction::EndTechnique;
                slot.seq = ns;
            }
        }
    }

    let records = translate_reports(step_num, step)?;
    entry.rec_nb = records.len();
    for (slot, spec) in entry.records.iter_mut().zip(records) {
        slot.measure = spec.measure;
        slot.value = spec.value;
    }

    tracing::debug!(
        "step {} -> seq {} {} ({} limits, {} records)",
        step_num,
        ns,
        entry.ctrl_type,
        entry.lim_nb,
        entry.rec_nb
    );
    Ok(entry)
}

/// Convert a run of steps given a precomputed numbering.
///
/// `steps[i]` is step `first_step_num + i`. Control steps produce one
/// entry per index in `seq_nums_by_step_num`; markers produce none. A goto
/// resolves to the first index of its target, or of the first numbered
/// step after it when the target is a marker. Targets equal to
/// `bounds.end_step_num`, outside the bounds, or running into `End` end
/// the technique. Only step 0 and steps past every known step are
/// `Reference` errors.
pub fn convert_step_parts(
    steps: &[ProcedureStep],
    first_step_num: usize,
    seq_nums_by_step_num: &BTreeMap<usize, Vec<usize>>,
    bounds: GotoBounds,
) -> Result<Vec<SequenceEntry>, ConvertError> {
    let last_known = (first_step_num + steps.len())
        .saturating_sub(1)
        .max(bounds.end_step_num)
        .max(seq_nums_by_step_num.keys().next_back().copied().unwrap_or(0));
    let step_at = |num: usize| num.checked_sub(first_step_num).and_then(|i| steps.get(i));

    let mut entries = Vec::new();
    for (offset, step) in steps.iter().enumerate() {
        let step_num = first_step_num + offset;
        if !classify_kind(step_num, step)?.is_control() {
            continue;
        }
        let seqs = seq_nums_by_step_num.get(&step_num).ok_or(ConvertError::Reference {
            step: step_num,
            target: step_num,
        })?;
        for &ns in seqs {
            let entry = populate_entry(step, step_num, ns, |spec| {
                let target = spec.target_step;
                if target == bounds.end_step_num {
                    return Ok(None);
                }
                if target == 0 || target > last_known {
                    return Err(ConvertError::Reference { step: step_num, target });
                }
                if !bounds.contains(target) {
                    return Ok(None);
                }
                for num in target..=last_known {
                    if let Some(&seq) = seq_nums_by_step_num.get(&num).and_then(|s| s.first()) {
                        return Ok(bounds.contains(num).then_some(seq));
                    }
                    let reached_end = num == bounds.end_step_num
                        || step_at(num).map_or(false, |s| step_kind(&s.step_type) == Some(StepKind::End));
                    if reached_end {
                        break;
                    }
                }
                Ok(None)
            })?;
            entries.push(entry);
        }
    }
    Ok(entries)
}

/// Build every technique of a planned procedure.
pub fn expand_procedure(procedure: &Procedure, plan: &SequencePlan) -> Result<ConvertedProtocol, ConvertError> {
    let tech_does_loop = plan.techniques.iter().any(TechniquePlan::does_loop);
    let mut tracker = CycleTracker::new(plan.techniques.len(), tech_does_loop);
    let mut techniques = Vec::with_capacity(plan.techniques.len());

    for (tech_index, tech) in plan.techniques.iter().enumerate() {
        let bounds = tech.goto_bounds(plan.end_step_num);
        let mut entries = Vec::with_capacity(tech.seqs.len());

        for item_index in tech.items.clone() {
            let item = &plan.items[item_index];
            let Some(ns) = item.seq else { continue };
            let step = procedure.step(item.step).ok_or(ConvertError::Reference {
                step: item.step,
                target: item.step,
            })?;

            let entry = match item.kind {
                StepKind::Loop(_) => loop_entry(plan, item_index, item, &mut tracker)?,
                _ => populate_entry(step, item.step, ns, |spec| {
                    resolve_goto(plan, item, spec.target_step, &bounds, &mut tracker)
                })?,
            };
            entries.push(entry);
        }

        techniques.push(ConvertedTechnique {
            number: tech_index + 1,
            first_step: tech.first_step,
            last_step: tech.last_step,
            loop_count: tech.tech_loop.map(|span| span.count),
            first_ns: tech.seqs.start,
            entries,
        });
    }

    let rules = tracker.finish(plan.adv_cycles_on_start(), plan.adv_cycles_on_tech_loop());
    Ok(ConvertedProtocol {
        techniques,
        rules,
        seq_nums_by_step_num: plan.seq_nums_by_step_num.clone(),
        end_step_num: plan.end_step_num,
    })
}

/// Where execution really continues after leaving `item`'s technique:
/// the first entry of the next technique.
fn is_next_technique_start(plan: &SequencePlan, item: &PlanItem, landed: &PlanItem) -> bool {
    plan.techniques
        .get(item.technique + 1)
        .map_or(false, |next| landed.technique == item.technique + 1 && landed.seq == Some(next.seqs.start))
}

fn resolve_goto(
    plan: &SequencePlan,
    item: &PlanItem,
    target: usize,
    bounds: &GotoBounds,
    tracker: &mut CycleTracker,
) -> Result<Option<usize>, ConvertError> {
    if target == bounds.end_step_num {
        return Ok(None);
    }
    let reference = ConvertError::Reference {
        step: item.step,
        target,
    };
    if target == 0 || target > plan.step_count {
        return Err(reference);
    }
    let target_index = plan.locate(target, &item.path).ok_or(reference)?;
    let scan = plan.scan_from(target_index);
    let Some(landed) = scan.entry.map(|i| &plan.items[i]) else {
        return Ok(None);
    };
    let from = (item.seq.unwrap_or_default(), item.step);
    let to = (landed.seq.unwrap_or_default(), target);

    if bounds.contains(target) && landed.technique == item.technique {
        tracker.record(from, to, scan.adv_cycles);
        Ok(landed.seq)
    } else {
        if is_next_technique_start(plan, item, landed) {
            tracker.record(from, to, scan.adv_cycles);
        }
        Ok(None)
    }
}

/// Loop entry: repeat the body `count - 1` more times, then fall through.
fn loop_entry(
    plan: &SequencePlan,
    item_index: usize,
    item: &PlanItem,
    tracker: &mut CycleTracker,
) -> Result<SequenceEntry, ConvertError> {
    let ns = item.seq.unwrap_or_default();
    let span = plan
        .loops
        .iter()
        .find(|span| span.loop_step == item.step)
        .copied()
        .ok_or(ConvertError::Reference {
            step: item.step,
            target: item.step,
        })?;
    let no_body = || ConvertError::UnsupportedStep {
        step: item.step,
        detail: format!("loop from step {} has no reachable body", span.do_step),
    };

    let do_item = item.do_item.ok_or_else(no_body)?;
    let body = plan.scan_from(do_item + 1);
    let first = body.entry.map(|i| &plan.items[i]).ok_or_else(no_body)?;
    let ctrl_seq = first.seq.ok_or_else(no_body)?;
    if first.technique != item.technique {
        return Err(no_body());
    }

    let mut entry = SequenceEntry::blank(ns);
    entry.ctrl_type = CtrlType::Loop;
    entry.ctrl_seq = ctrl_seq;
    entry.ctrl_repeat = span.count - 1;
    entry.lim_nb = 0;

    tracker.record((ns, item.step), (ctrl_seq, first.step), body.adv_cycles);

    let exit = plan.scan_from(item_index + 1);
    if let Some(next) = exit.entry.map(|i| &plan.items[i]) {
        if next.technique == item.technique || is_next_technique_start(plan, item, next) {
            tracker.record((ns, item.step), (next.seq.unwrap_or_default(), item.step + 1), exit.adv_cycles);
        }
    }

    tracing::debug!(
        "step {} -> seq {} Loop to seq {} x{}",
        item.step,
        ns,
        ctrl_seq,
        entry.ctrl_repeat
    );
    Ok(entry)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::ConversionOptions;
    use crate::parser::schema::{EndCondition, ReportTrigger};
    use crate::protocol::classify::{CtrlReference, Polarity};
    use crate::protocol::limits::{Comparator, Measure};
    use crate::protocol::units::{ScaledValue, Unit};

    fn end(end_type: &str, oper: &str, goto: usize, value: &str) -> EndCondition {
        EndCondition {
            end_type: end_type.to_string(),
            special_type: " ".to_string(),
            oper: oper.to_string(),
            step: format!("{:03}", goto),
            value: value.to_string(),
        }
    }

    fn control(step_type: &str, mode: &str, value: &str, ends: Vec<EndCondition>) -> ProcedureStep {
        ProcedureStep {
            step_type: step_type.to_string(),
            step_mode: mode.to_string(),
            step_value: value.to_string(),
            ends,
            ..Default::default()
        }
    }

    fn report(report_type: &str, value: &str) -> ReportTrigger {
        ReportTrigger {
            report_type: report_type.to_string(),
            value: value.to_string(),
        }
    }

    fn marker(step_type: &str) -> ProcedureStep {
        ProcedureStep {
            step_type: step_type.to_string(),
            ..Default::default()
        }
    }

    fn loop_step(step_type: &str, count: u32, next: usize) -> ProcedureStep {
        ProcedureStep {
            step_type: step_type.to_string(),
            ends: vec![end("Loop Cnt", "=", next, &count.to_string())],
            ..Default::default()
        }
    }

    fn one_to_one(n: usize) -> BTreeMap<usize, Vec<usize>> {
        (1..=n).map(|s| (s, vec![s - 1])).collect()
    }

    fn convert(steps: Vec<ProcedureStep>, options: &ConversionOptions) -> ConvertedProtocol {
        let procedure = Procedure::new(steps);
        let plan = SequencePlan::build(&procedure, options).unwrap();
        expand_procedure(&procedure, &plan).unwrap()
    }

    fn assert_targets_present(protocol: &ConvertedProtocol) {
        for tech in &protocol.techniques {
            let seqs: Vec<usize> = tech.entries.iter().map(|e| e.ns).collect();
            for entry in &tech.entries {
                for limit in entry.active_limits() {
                    assert!(seqs.contains(&limit.seq), "seq {} not in {:?}", limit.seq, seqs);
                }
                if entry.ctrl_type == CtrlType::Loop {
                    assert!(seqs.contains(&entry.ctrl_seq));
                }
            }
        }
    }

    // ============================================================================
    // Single step conversion
    // ============================================================================

    #[test]
    fn test_rest_with_voltage_window() {
        let mut rest = control("Rest", "", "", vec![end("Voltage", ">=", 2, "4.4"), end("Voltage", "<=", 2, "2.5")]);
        rest.reports = vec![report("Voltage", "2.2")];
        let steps = vec![rest, control("Rest", "", "", vec![end("StepTime", "=", 3, "00:00:10")])];
        let bounds = GotoBounds {
            lower: 1,
            upper: 2,
            end_step_num: 3,
        };
        let entries = convert_step_parts(&steps, 1, &one_to_one(2), bounds).unwrap();
        let rest = &entries[0];
        assert_eq!(rest.field("ctrl_type").as_deref(), Some("Rest"));
        assert_eq!(rest.field("ctrl1_val").as_deref(), Some("0.000"));
        assert_eq!(rest.field("N").as_deref(), Some("1.00"));
        assert_eq!(rest.lim_nb, 2);
        assert_eq!(rest.field("lim1_type").as_deref(), Some("Ecell"));
        assert_eq!(rest.field("lim1_comp").as_deref(), Some(">"));
        assert_eq!(rest.field("lim1_value").as_deref(), Some("4.400"));
        assert_eq!(rest.field("lim1_value_unit").as_deref(), Some("V"));
        assert_eq!(rest.field("lim2_type").as_deref(), Some("Ecell"));
        assert_eq!(rest.field("lim2_comp").as_deref(), Some("<"));
        assert_eq!(rest.field("lim2_value").as_deref(), Some("2.500"));
        assert_eq!(rest.field("lim2_value_unit").as_deref(), Some("V"));
        assert_eq!(rest.field("lim1_action").as_deref(), Some("Next sequence"));
        assert_eq!(rest.field("lim1_seq").as_deref(), Some("1"));
        assert_eq!(rest.rec_nb, 1);
        assert_eq!(rest.field("rec1_type").as_deref(), Some("Ecell"));
        assert_eq!(rest.field("rec1_value").as_deref(), Some("2.200"));
        assert_eq!(rest.field("rec1_value_unit").as_deref(), Some("V"));

        // goto the end sentinel ends the technique in place
        let last = &entries[1];
        assert_eq!(last.limits[0].action, LimitAction::EndTechnique);
        assert_eq!(last.limits[0].seq, 1);
    }

    #[test]
    fn test_discharge_current_with_time_and_voltage() {
        let mut discharge = control(
            "Dischrge",
            "Current",
            "1.0",
            vec![
                end("StepTime", "=", 2, "00:00:30"),
                end("Voltage", "<=", 2, "2.7"),
                end("Voltage", ">=", 2, "4.4"),
            ],
        );
        discharge.reports = vec![report("Voltage", "0.001"), report("StepTime", "::.01")];
        let steps = vec![discharge, marker("End")];
        let bounds = GotoBounds {
            lower: 1,
            upper: 2,
            end_step_num: 2,
        };
        let entries = convert_step_parts(&steps, 1, &one_to_one(1), bounds).unwrap();
        assert_eq!(entries.len(), 1);
        let cc = &entries[0];
        assert_eq!(cc.ctrl_type, CtrlType::CC);
        assert_eq!(cc.polarity, Polarity::Discharge);
        assert_eq!(cc.ctrl1, ScaledValue::new("1.000", Unit::Amp));
        assert_eq!(cc.ctrl1_vs, CtrlReference::None);
        assert_eq!(cc.field("N").as_deref(), Some("15.00"));
        assert_eq!(cc.lim_nb, 3);
        assert_eq!(cc.limits[0].measure, Measure::Time);
        assert_eq!(cc.limits[0].comparator, Comparator::Greater);
        assert_eq!(cc.limits[0].value, ScaledValue::new("30.000", Unit::Second));
        assert_eq!(cc.limits[1].value, ScaledValue::new("2.700", Unit::Volt));
        assert_eq!(cc.limits[2].comparator, Comparator::Greater);
        for limit in cc.active_limits() {
            assert_eq!(limit.action, LimitAction::EndTechnique);
        }
        assert_eq!(cc.rec_nb, 2);
        assert_eq!(cc.field("rec1_type").as_deref(), Some("Ecell"));
        assert_eq!(cc.field("rec1_value").as_deref(), Some("1.000"));
        assert_eq!(cc.field("rec1_value_unit").as_deref(), Some("mV"));
        assert_eq!(cc.field("rec2_type").as_deref(), Some("Time"));
        assert_eq!(cc.field("rec2_value").as_deref(), Some("10.000"));
        assert_eq!(cc.field("rec2_value_unit").as_deref(), Some("ms"));
    }

    #[test]
    fn test_goto_onto_adv_cycle_skips_to_next_entry() {
        let steps = vec![
            control("Charge", "Current", "1", vec![end("Voltage", ">=", 2, "4.2")]),
            marker("AdvCycle"),
            control("Rest", "", "", vec![end("StepTime", "=", 4, "::1")]),
            marker("End"),
        ];
        let map: BTreeMap<usize, Vec<usize>> = [(1, vec![0]), (3, vec![1])].into_iter().collect();
        let bounds = GotoBounds {
            lower: 1,
            upper: 4,
            end_step_num: 4,
        };
        let entries = convert_step_parts(&steps, 1, &map, bounds).unwrap();
        assert_eq!(entries.len(), 2);
        assert_eq!(entries[0].limits[0].action, LimitAction::NextSequence);
        assert_eq!(entries[0].limits[0].seq, 1);

        // the planned conversion agrees
        let protocol = convert(steps, &ConversionOptions::default());
        assert_eq!(protocol.entry(0).unwrap().limits[0], entries[0].limits[0]);
    }

    #[test]
    fn test_goto_onto_marker_before_end_ends_technique() {
        let steps = vec![
            control("Rest", "", "", vec![end("StepTime", "=", 2, "::1")]),
            marker("AdvCycle"),
            marker("End"),
        ];
        let bounds = GotoBounds {
            lower: 1,
            upper: 3,
            end_step_num: 3,
        };
        let entries = convert_step_parts(&steps, 1, &one_to_one(1), bounds).unwrap();
        assert_eq!(entries[0].limits[0].action, LimitAction::EndTechnique);
        assert_eq!(entries[0].limits[0].seq, 0);
    }

    #[test]
    fn test_goto_step_zero_is_reference_error() {
        let steps = vec![control("Rest", "", "", vec![end("StepTime", "=", 0, "::1")])];
        let bounds = GotoBounds {
            lower: 1,
            upper: 1,
            end_step_num: 2,
        };
        let err = convert_step_parts(&steps, 1, &one_to_one(1), bounds).unwrap_err();
        assert!(matches!(err, ConvertError::Reference { step: 1, target: 0 }));
    }

    #[test]
    fn test_cv_step_is_referenced() {
        let steps = vec![control("Charge", "Voltage", "4.2", vec![end("Current", "<=", 1, "0.05")])];
        let bounds = GotoBounds {
            lower: 1,
            upper: 1,
            end_step_num: 2,
        };
        let entries = convert_step_parts(&steps, 1, &one_to_one(1), bounds).unwrap();
        assert_eq!(entries[0].ctrl_type, CtrlType::CV);
        assert_eq!(entries[0].ctrl1_vs, CtrlReference::Ref);
        assert_eq!(entries[0].ctrl1, ScaledValue::new("4.200", Unit::Volt));
        assert_eq!(entries[0].limits[0].value, ScaledValue::new("50.000", Unit::MilliAmp));
        // goto to itself
        assert_eq!(entries[0].limits[0].action, LimitAction::GotoSequence);
        assert_eq!(entries[0].limits[0].seq, 0);
    }

    #[test]
    fn test_out_of_bounds_goto_ends_technique() {
        let steps = vec![control("Rest", "", "", vec![end("StepTime", "=", 5, "::1")])];
        let map: BTreeMap<usize, Vec<usize>> = [(1, vec![0]), (5, vec![7])].into_iter().collect();
        let bounds = GotoBounds {
            lower: 1,
            upper: 3,
            end_step_num: 9,
        };
        let entries = convert_step_parts(&steps, 1, &map, bounds).unwrap();
        assert_eq!(entries[0].limits[0].action, LimitAction::EndTechnique);
        assert_eq!(entries[0].limits[0].seq, 0);
    }

    #[test]
    fn test_missing_target_is_reference_error() {
        let steps = vec![control("Rest", "", "", vec![end("StepTime", "=", 4, "::1")])];
        let bounds = GotoBounds {
            lower: 1,
            upper: 1,
            end_step_num: 2,
        };
        let err = convert_step_parts(&steps, 1, &one_to_one(1), bounds).unwrap_err();
        assert!(matches!(err, ConvertError::Reference { step: 1, target: 4 }));
    }

    #[test]
    fn test_records_are_filled() {
        let mut step = control("Charge", "Current", "0.5", vec![end("Voltage", ">=", 2, "4.2")]);
        step.reports = vec![ReportTrigger {
            report_type: "StepTime".into(),
            value: "00:01:00".into(),
        }];
        let bounds = GotoBounds {
            lower: 1,
            upper: 1,
            end_step_num: 2,
        };
        let entries = convert_step_parts(&[step], 1, &one_to_one(1), bounds).unwrap();
        assert_eq!(entries[0].rec_nb, 1);
        assert_eq!(entries[0].field("rec1_type").as_deref(), Some("Time"));
        assert_eq!(entries[0].field("rec1_value").as_deref(), Some("1.000"));
        assert_eq!(entries[0].field("rec1_value_unit").as_deref(), Some("mn"));
        assert_eq!(entries[0].field("ctrl1_val_unit").as_deref(), Some("mA"));
    }

    #[test]
    fn test_bad_step_value() {
        let steps = vec![control("Charge", "Current", "fast", vec![])];
        let bounds = GotoBounds {
            lower: 1,
            upper: 1,
            end_step_num: 2,
        };
        let err = convert_step_parts(&steps, 1, &one_to_one(1), bounds).unwrap_err();
        assert!(matches!(err, ConvertError::Parse { ref at, .. } if at.field == "StepValue"));
    }

    // ============================================================================
    // Whole procedures
    // ============================================================================

    fn cycling(count: u32) -> Vec<ProcedureStep> {
        vec![
            control("Rest", "", "", vec![end("StepTime", "=", 2, "01:00:00")]), // 1
            marker("Do 1"),                                                     // 2
            control("Charge", "Current", "1", vec![end("Voltage", ">=", 4, "4.2")]), // 3
            control("Dischrge", "Current", "1", vec![end("Voltage", "<=", 5, "2.7")]), // 4
            marker("AdvCycle"),                                                 // 5
            loop_step("Loop 1", count, 7),                                      // 6
            marker("End"),                                                      // 7
        ]
    }

    #[test]
    fn test_looping_technique() {
        let protocol = convert(cycling(5), &ConversionOptions::default());
        assert_eq!(protocol.techniques.len(), 2);
        assert_eq!(protocol.techniques[1].loop_count, Some(5));

        let rest = &protocol.techniques[0].entries[0];
        // Rest goes to the Do step, which starts the next technique
        assert_eq!(rest.limits[0].action, LimitAction::EndTechnique);

        let discharge = &protocol.techniques[1].entries[1];
        assert_eq!(discharge.ns, 2);
        assert_eq!(discharge.limits[0].action, LimitAction::EndTechnique);

        assert_eq!(protocol.rules.tech_num, 2);
        assert!(protocol.rules.tech_does_loop);
        assert_eq!(protocol.rules.adv_cycle_on_start, 0);
        assert_eq!(protocol.rules.adv_cycle_on_tech_loop, 1);
        assert!(protocol.rules.adv_cycle_seq_transitions.is_empty());
        assert_targets_present(&protocol);
    }

    #[test]
    fn test_loop_entry_without_technique_loop() {
        let options = ConversionOptions {
            technique_loop: false,
            ..Default::default()
        };
        let protocol = convert(cycling(5), &options);
        assert_eq!(protocol.techniques.len(), 1);
        let entries = &protocol.techniques[0].entries;
        assert_eq!(entries.len(), 4);

        let lp = &entries[3];
        assert_eq!(lp.ctrl_type, CtrlType::Loop);
        assert_eq!(lp.ctrl_seq, 1);
        assert_eq!(lp.ctrl_repeat, 4);
        assert_eq!(lp.lim_nb, 0);

        // discharge passes AdvCycle on its way to the loop
        let discharge = &entries[2];
        assert_eq!(discharge.limits[0].action, LimitAction::NextSequence);
        assert_eq!(discharge.limits[0].seq, 3);
        assert_eq!(protocol.rules.adv_cycle_seq_transitions[&(2, 3)], 1);
        assert_eq!(protocol.rules.debug_adv_cycle_on_step_transitions[&(4, 5)], 1);
        assert!(!protocol.rules.tech_does_loop);
        assert_targets_present(&protocol);
    }

    #[test]
    fn test_goto_into_unrolled_copy() {
        let steps = vec![
            marker("Do 1"),                                                         // 1
            marker("Do 2"),                                                         // 2
            control("Charge", "Current", "1", vec![end("Voltage", ">=", 4, "4.2")]), // 3
            loop_step("Loop 2", 2, 5),                                              // 4
            loop_step("Loop 1", 3, 6),                                              // 5
            control("Rest", "", "", vec![end("StepTime", "=", 1, "::5")]),          // 6
            marker("End"),                                                          // 7
        ];
        let options = ConversionOptions {
            technique_loop: false,
            ..Default::default()
        };
        let protocol = convert(steps, &options);
        let entries = &protocol.techniques[0].entries;
        // two charge copies, the Loop 1 entry, the rest
        assert_eq!(entries.len(), 4);
        assert_eq!(protocol.seq_nums_by_step_num[&3], vec![0, 1]);

        // first copy's goto to the Loop 2 step lands on the second copy
        assert_eq!(entries[0].limits[0].action, LimitAction::NextSequence);
        assert_eq!(entries[0].limits[0].seq, 1);
        // second copy leaves the unrolled loop, reaching the Loop 1 entry
        assert_eq!(entries[1].limits[0].seq, 2);
        assert_eq!(entries[2].ctrl_type, CtrlType::Loop);
        assert_eq!(entries[2].ctrl_seq, 0);
        assert_eq!(entries[2].ctrl_repeat, 2);
        // rest jumps back to the start
        assert_eq!(entries[3].limits[0].action, LimitAction::GotoSequence);
        assert_eq!(entries[3].limits[0].seq, 0);
        assert_targets_present(&protocol);
    }

    #[test]
    fn test_goto_past_end_is_reference_error() {
        let steps = vec![control("Rest", "", "", vec![end("StepTime", "=", 9, "::5")]), marker("End")];
        let procedure = Procedure::new(steps);
        let plan = SequencePlan::build(&procedure, &ConversionOptions::default()).unwrap();
        let err = expand_procedure(&procedure, &plan).unwrap_err();
        assert!(matches!(err, ConvertError::Reference { step: 1, target: 9 }));
    }

    #[test]
    fn test_never_fewer_entries_than_steps() {
        let protocol = convert(cycling(2), &ConversionOptions::default());
        let control_steps = cycling(2)
            .iter()
            .filter(|s| crate::protocol::classify::step_kind(&s.step_type).map_or(false, |k| k.is_control()))
            .count();
        assert!(protocol.entry_count() >= control_steps);
    }

    #[test]
    fn test_loop_repeat_edge_names_first_body_entry() {
        let steps = vec![
            control("Rest", "", "", vec![end("StepTime", "=", 2, "00:10:00")]), // 1
            marker("Do 1"),                                                     // 2
            marker("AdvCycle"),                                                 // 3
            control("Charge", "Current", "1", vec![end("Voltage", ">=", 5, "4.2")]), // 4
            loop_step("Loop 1", 3, 6),                                          // 5
            control("Rest", "", "", vec![end("StepTime", "=", 7, "00:10:00")]), // 6
            marker("End"),                                                      // 7
        ];
        let protocol = convert(steps, &ConversionOptions::default());
        assert_eq!(protocol.entry_count(), 4);

        let lp = protocol.entry(2).unwrap();
        assert_eq!(lp.ctrl_type, CtrlType::Loop);
        assert_eq!(lp.ctrl_seq, 1);

        let rules = &protocol.rules;
        assert_eq!(rules.adv_cycle_seq_transitions.get(&(2, 1)), Some(&1));
        assert_eq!(rules.debug_adv_cycle_on_step_transitions.get(&(5, 4)), Some(&1));
        assert!(!rules.debug_adv_cycle_on_step_transitions.contains_key(&(5, 3)));
    }
}
