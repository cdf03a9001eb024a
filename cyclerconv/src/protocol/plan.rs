//! Sequence numbering prepass
//!
//! Gotos may point forward, into other techniques, or into unrolled loop
//! copies, so every sequence index is assigned before any field is filled
//! in. The plan is a flat list of items in execution order: entries take a
//! sequence index, markers (`Do`, `AdvCycle`, `End`, unrolled `Loop`) take
//! none but stay in place so gotos onto them can be resolved by scanning
//! forward.

use std::collections::BTreeMap;
use std::ops::Range;

use serde::Serialize;

use crate::core::{ConversionOptions, ConvertError, Location};
use crate::parser::schema::Procedure;
use crate::protocol::classify::{classify_kind, StepKind};
use crate::protocol::limits::loop_end;

/// A matched `Do n` .. `Loop n` pair.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct LoopSpan {
    pub do_step: usize,
    pub loop_step: usize,
    pub count: u32,
    /// Nesting depth in the procedure, 0 for outermost loops
    pub depth: usize,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PlanItem {
    pub step: usize,
    pub kind: StepKind,
    /// Iteration index of every unrolled loop enclosing this copy
    pub path: Vec<usize>,
    /// Global sequence index; `None` for markers
    pub seq: Option<usize>,
    /// Index into [`SequencePlan::techniques`]
    pub technique: usize,
    /// Loop entries: item index of the matching `Do` marker
    pub do_item: Option<usize>,
}

impl PlanItem {
    pub fn is_entry(&self) -> bool {
        self.seq.is_some()
    }
}

/// Inclusive range of source steps a technique may branch to, plus the
/// step number that means "end of procedure".
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct GotoBounds {
    pub lower: usize,
    pub upper: usize,
    pub end_step_num: usize,
}

impl GotoBounds {
    pub fn contains(&self, step: usize) -> bool {
        (self.lower..=self.upper).contains(&step)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TechniquePlan {
    pub first_step: usize,
    pub last_step: usize,
    /// Loop wrapping the technique body, if it repeats
    pub tech_loop: Option<LoopSpan>,
    /// Item indices belonging to this technique
    pub items: Range<usize>,
    /// Global sequence indices of this technique's entries
    pub seqs: Range<usize>,
}

impl TechniquePlan {
    pub fn does_loop(&self) -> bool {
        self.tech_loop.is_some()
    }

    pub fn goto_bounds(&self, end_step_num: usize) -> GotoBounds {
        GotoBounds {
            lower: self.first_step,
            upper: self.last_step,
            end_step_num,
        }
    }
}

/// Result of walking forward from an item to the next entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Scan {
    /// Item index of the entry reached, `None` if an `End` marker or the
    /// end of the plan came first
    pub entry: Option<usize>,
    /// `AdvCycle` markers passed on the way
    pub adv_cycles: u32,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SequencePlan {
    pub items: Vec<PlanItem>,
    pub techniques: Vec<TechniquePlan>,
    pub loops: Vec<LoopSpan>,
    pub seq_nums_by_step_num: BTreeMap<usize, Vec<usize>>,
    pub step_count: usize,
    /// First `End` step, or one past the last step when there is none
    pub end_step_num: usize,
    #[serde(skip)]
    items_by_step: BTreeMap<usize, Vec<usize>>,
    #[serde(skip)]
    item_by_seq: Vec<usize>,
}

impl SequencePlan {
    /// Number the procedure's steps.
    pub fn build(procedure: &Procedure, options: &ConversionOptions) -> Result<Self, ConvertError> {
        let kinds = procedure
            .numbered()
            .map(|(num, step)| classify_kind(num, step))
            .collect::<Result<Vec<_>, _>>()?;
        let loops = match_loops(procedure, &kinds)?;

        let step_count = kinds.len();
        let end_step_num = kinds
            .iter()
            .position(|k| *k == StepKind::End)
            .map(|i| i + 1)
            .unwrap_or(step_count + 1);

        let ranges = split_techniques(&kinds, &loops, options.technique_loop);

        let mut builder = PlanBuilder {
            kinds: &kinds,
            loops: loops.iter().map(|span| (span.do_step, *span)).collect(),
            max_entries: options.max_sequence_entries,
            items: Vec::new(),
            next_seq: 0,
            technique: 0,
        };

        let mut techniques = Vec::with_capacity(ranges.len());
        for (index, (first_step, last_step, tech_loop)) in ranges.into_iter().enumerate() {
            builder.technique = index;
            let item_start = builder.items.len();
            let seq_start = builder.next_seq;
            builder.emit(first_step, last_step, &[], 0, tech_loop.map(|span| span.do_step))?;
            techniques.push(TechniquePlan {
                first_step,
                last_step,
                tech_loop,
                items: item_start..builder.items.len(),
                seqs: seq_start..builder.next_seq,
            });
        }

        let items = builder.items;
        let mut items_by_step: BTreeMap<usize, Vec<usize>> = BTreeMap::new();
        let mut seq_nums_by_step_num: BTreeMap<usize, Vec<usize>> = BTreeMap::new();
        let mut item_by_seq = Vec::new();
        for (index, item) in items.iter().enumerate() {
            items_by_step.entry(item.step).or_default().push(index);
            if let Some(seq) = item.seq {
                seq_nums_by_step_num.entry(item.step).or_default().push(seq);
                item_by_seq.push(index);
            }
        }

        tracing::debug!(
            "Planned {} items, {} sequences, {} technique(s)",
            items.len(),
            item_by_seq.len(),
            techniques.len()
        );

        Ok(Self {
            items,
            techniques,
            loops,
            seq_nums_by_step_num,
            step_count,
            end_step_num,
            items_by_step,
            item_by_seq,
        })
    }

    pub fn entry_count(&self) -> usize {
        self.item_by_seq.len()
    }

    pub fn item_for_seq(&self, seq: usize) -> Option<&PlanItem> {
        self.item_by_seq.get(seq).map(|&i| &self.items[i])
    }

    /// Copy of `step` closest to `path`: longest shared unroll prefix,
    /// first copy on ties.
    pub fn locate(&self, step: usize, path: &[usize]) -> Option<usize> {
        let candidates = self.items_by_step.get(&step)?;
        let mut best: Option<(usize, usize)> = None;
        for &index in candidates {
            let shared = common_prefix(&self.items[index].path, path);
            if best.map_or(true, |(_, len)| shared > len) {
                best = Some((index, shared));
            }
        }
        best.map(|(index, _)| index)
    }

    /// Walk forward from `from` over markers to the next entry.
    pub fn scan_from(&self, from: usize) -> Scan {
        let mut adv_cycles = 0;
        for (index, item) in self.items.iter().enumerate().skip(from) {
            if item.is_entry() {
                return Scan {
                    entry: Some(index),
                    adv_cycles,
                };
            }
            match item.kind {
                StepKind::AdvCycle => adv_cycles += 1,
                StepKind::End => break,
                _ => {}
            }
        }
        Scan {
            entry: None,
            adv_cycles,
        }
    }

    /// `AdvCycle` markers before the first sequence runs.
    pub fn adv_cycles_on_start(&self) -> u32 {
        self.scan_from(0).adv_cycles
    }

    /// `AdvCycle` markers passed each time the looping technique wraps
    /// around: those after its last entry plus those before its first.
    pub fn adv_cycles_on_tech_loop(&self) -> u32 {
        let Some(tech) = self.techniques.iter().find(|t| t.does_loop()) else {
            return 0;
        };
        let items = &self.items[tech.items.clone()];
        let Some(last_entry) = items.iter().rposition(|i| i.is_entry()) else {
            return 0;
        };
        let loop_marker = items
            .iter()
            .rposition(|i| matches!(i.kind, StepKind::Loop(_)) && !i.is_entry() && i.path.is_empty())
            .unwrap_or(items.len());
        let trailing = items[last_entry..loop_marker]
            .iter()
            .filter(|i| i.kind == StepKind::AdvCycle)
            .count() as u32;

        let leading = tech
            .tech_loop
            .and_then(|span| {
                items
                    .iter()
                    .position(|i| i.step == span.do_step)
                    .map(|pos| self.scan_from(tech.items.start + pos + 1).adv_cycles)
            })
            .unwrap_or(0);

        trailing + leading
    }
}

fn common_prefix(a: &[usize], b: &[usize]) -> usize {
    a.iter().zip(b).take_while(|(x, y)| x == y).count()
}

/// Pair `Do n` with `Loop n` and read each loop's count.
fn match_loops(procedure: &Procedure, kinds: &[StepKind]) -> Result<Vec<LoopSpan>, ConvertError> {
    let mut open: Vec<(u8, usize)> = Vec::new();
    let mut spans = Vec::new();

    for (index, kind) in kinds.iter().enumerate() {
        let step_num = index + 1;
        match *kind {
            StepKind::Do(n) => open.push((n, step_num)),
            StepKind::Loop(n) => {
                let (do_n, do_step) = open.pop().ok_or_else(|| {
                    ConvertError::parse(
                        Location::step(step_num, "StepType"),
                        format!("Loop {} without a matching Do", n),
                    )
                })?;
                if do_n != n {
                    return Err(ConvertError::parse(
                        Location::step(step_num, "StepType"),
                        format!("Loop {} closes Do {} (step {})", n, do_n, do_step),
                    ));
                }
                let step = procedure.step(step_num).ok_or(ConvertError::Reference {
                    step: step_num,
                    target: step_num,
                })?;
                let end = loop_end(step_num, step)?;
                if !kinds[do_step..index].iter().any(StepKind::is_control) {
                    return Err(ConvertError::UnsupportedStep {
                        step: step_num,
                        detail: format!("loop from step {} has no control step in its body", do_step),
                    });
                }
                spans.push(LoopSpan {
                    do_step,
                    loop_step: step_num,
                    count: end.count,
                    depth: open.len(),
                });
            }
            _ => {}
        }
    }

    if let Some((n, do_step)) = open.pop() {
        return Err(ConvertError::parse(
            Location::step(do_step, "StepType"),
            format!("Do {} is never closed", n),
        ));
    }

    spans.sort_by_key(|span| span.do_step);
    Ok(spans)
}

/// Technique step ranges `(first, last, technique loop)`.
///
/// When the last outermost loop is followed only by `AdvCycle`/`End`, its
/// body becomes a looping technique. Anything before it with a control
/// step becomes a plain technique of its own.
fn split_techniques(
    kinds: &[StepKind],
    loops: &[LoopSpan],
    technique_loop: bool,
) -> Vec<(usize, usize, Option<LoopSpan>)> {
    let step_count = kinds.len();
    let whole = vec![(1, step_count, None)];
    if !technique_loop {
        return whole;
    }

    let Some(span) = loops
        .iter()
        .filter(|span| span.depth == 0)
        .max_by_key(|span| span.loop_step)
        .copied()
    else {
        return whole;
    };

    let tail_is_markers = kinds[span.loop_step..]
        .iter()
        .all(|k| matches!(k, StepKind::AdvCycle | StepKind::End));
    if !tail_is_markers {
        return whole;
    }

    let prefix_runs = kinds[..span.do_step - 1].iter().any(StepKind::is_control);
    if prefix_runs {
        vec![
            (1, span.do_step - 1, None),
            (span.do_step, step_count, Some(span)),
        ]
    } else {
        vec![(1, step_count, Some(span))]
    }
}

struct PlanBuilder<'a> {
    kinds: &'a [StepKind],
    loops: BTreeMap<usize, LoopSpan>,
    max_entries: usize,
    items: Vec<PlanItem>,
    next_seq: usize,
    technique: usize,
}

impl PlanBuilder<'_> {
    fn push_marker(&mut self, step: usize, path: &[usize]) {
        self.items.push(PlanItem {
            step,
            kind: self.kinds[step - 1],
            path: path.to_vec(),
            seq: None,
            technique: self.technique,
            do_item: None,
        });
    }

    fn push_entry(&mut self, step: usize, path: &[usize], do_item: Option<usize>) -> Result<(), ConvertError> {
        if self.next_seq >= self.max_entries {
            return Err(ConvertError::Capacity {
                step,
                what: "sequences",
                count: self.next_seq + 1,
                capacity: self.max_entries,
            });
        }
        self.items.push(PlanItem {
            step,
            kind: self.kinds[step - 1],
            path: path.to_vec(),
            seq: Some(self.next_seq),
            technique: self.technique,
            do_item,
        });
        self.next_seq += 1;
        Ok(())
    }

    /// Emit steps `first..=last`. Loops met at `depth` 0 become Loop
    /// entries, deeper ones are unrolled.
    fn emit(
        &mut self,
        first: usize,
        last: usize,
        path: &[usize],
        depth: usize,
        tech_loop_do: Option<usize>,
    ) -> Result<(), ConvertError> {
        let mut step = first;
        while step <= last {
            let kind = self.kinds[step - 1];
            match kind {
                StepKind::Do(_) => {
                    let span = self.loops.get(&step).copied().ok_or_else(|| {
                        ConvertError::parse(Location::step(step, "StepType"), "Do without a matching Loop")
                    })?;
                    self.push_marker(step, path);

                    if tech_loop_do == Some(step) {
                        self.emit(step + 1, span.loop_step - 1, path, 0, None)?;
                        self.push_marker(span.loop_step, path);
                    } else if depth == 0 {
                        let do_item = self.items.len() - 1;
                        self.emit(step + 1, span.loop_step - 1, path, depth + 1, None)?;
                        self.push_entry(span.loop_step, path, Some(do_item))?;
                    } else {
                        for iteration in 0..span.count as usize {
                            let mut copy_path = path.to_vec();
                            copy_path.push(iteration);
                            self.emit(step + 1, span.loop_step - 1, &copy_path, depth + 1, None)?;
                            self.push_marker(span.loop_step, &copy_path);
                        }
                    }
                    step = span.loop_step + 1;
                    continue;
                }
                StepKind::Loop(n) => {
                    return Err(ConvertError::parse(
                        Location::step(step, "StepType"),
                        format!("Loop {} without a matching Do", n),
                    ))
                }
                k if k.is_control() => self.push_entry(step, path, None)?,
                _ => self.push_marker(step, path),
            }
            step += 1;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::parser::schema::{EndCondition, ProcedureStep};

    fn step(step_type: &str) -> ProcedureStep {
        ProcedureStep {
            step_type: step_type.to_string(),
            step_mode: "Current".to_string(),
            step_value: "1".to_string(),
            ..Default::default()
        }
    }

    fn loop_step(step_type: &str, count: u32, next: usize) -> ProcedureStep {
        ProcedureStep {
            step_type: step_type.to_string(),
            ends: vec![EndCondition {
                end_type: "Loop Cnt".into(),
                oper: "=".into(),
                step: format!("{:03}", next),
                value: count.to_string(),
                ..Default::default()
            }],
            ..Default::default()
        }
    }

    fn plan(steps: Vec<ProcedureStep>, options: &ConversionOptions) -> Result<SequencePlan, ConvertError> {
        SequencePlan::build(&Procedure::new(steps), options)
    }

    fn kinds(plan: &SequencePlan) -> Vec<(usize, Option<usize>)> {
        plan.items.iter().map(|i| (i.step, i.seq)).collect()
    }

    // ============================================================================
    // Straight-line procedures
    // ============================================================================

    #[test]
    fn test_one_entry_per_control_step() {
        let p = plan(
            vec![step("Rest"), step("Charge"), step("AdvCycle"), step("Dischrge"), step("End")],
            &ConversionOptions::default(),
        )
        .unwrap();
        assert_eq!(p.entry_count(), 3);
        assert_eq!(p.techniques.len(), 1);
        assert_eq!(p.end_step_num, 5);
        assert_eq!(p.seq_nums_by_step_num[&1], vec![0]);
        assert_eq!(p.seq_nums_by_step_num[&4], vec![2]);
        assert!(!p.seq_nums_by_step_num.contains_key(&3));
        assert_eq!(kinds(&p), vec![(1, Some(0)), (2, Some(1)), (3, None), (4, Some(2)), (5, None)]);
    }

    #[test]
    fn test_end_step_sentinel_without_end() {
        let p = plan(vec![step("Rest"), step("Charge")], &ConversionOptions::default()).unwrap();
        assert_eq!(p.end_step_num, 3);
    }

    #[test]
    fn test_scan_counts_adv_cycles() {
        let p = plan(
            vec![step("AdvCycle"), step("AdvCycle"), step("Rest"), step("End"), step("Charge")],
            &ConversionOptions::default(),
        )
        .unwrap();
        assert_eq!(p.adv_cycles_on_start(), 2);
        let scan = p.scan_from(0);
        assert_eq!(scan.entry, Some(2));
        // End stops the scan even though a step follows it
        assert_eq!(p.scan_from(3).entry, None);
    }

    // ============================================================================
    // Loops
    // ============================================================================

    fn cycling(count: u32) -> Vec<ProcedureStep> {
        vec![
            step("Rest"),           // 1
            step("Do 1"),           // 2
            step("Charge"),         // 3
            step("Dischrge"),       // 4
            step("AdvCycle"),       // 5
            loop_step("Loop 1", count, 7), // 6
            step("End"),            // 7
        ]
    }

    #[test]
    fn test_technique_loop_split() {
        let p = plan(cycling(10), &ConversionOptions::default()).unwrap();
        assert_eq!(p.techniques.len(), 2);
        assert_eq!(p.techniques[0].first_step, 1);
        assert_eq!(p.techniques[0].last_step, 1);
        assert!(!p.techniques[0].does_loop());
        assert_eq!(p.techniques[1].first_step, 2);
        assert_eq!(p.techniques[1].last_step, 7);
        assert_eq!(p.techniques[1].tech_loop.map(|s| s.count), Some(10));
        assert_eq!(p.techniques[1].seqs, 1..3);
        // Loop step is a marker, not a sequence
        assert!(!p.seq_nums_by_step_num.contains_key(&6));
        assert_eq!(p.adv_cycles_on_tech_loop(), 1);
    }

    #[test]
    fn test_without_technique_loop_becomes_loop_entry() {
        let options = ConversionOptions {
            technique_loop: false,
            ..Default::default()
        };
        let p = plan(cycling(10), &options).unwrap();
        assert_eq!(p.techniques.len(), 1);
        assert_eq!(p.seq_nums_by_step_num[&6], vec![3]);
        let loop_item = p.item_for_seq(3).unwrap();
        assert_eq!(loop_item.kind, StepKind::Loop(1));
        let do_item = loop_item.do_item.unwrap();
        assert_eq!(p.items[do_item].step, 2);
        assert_eq!(p.adv_cycles_on_tech_loop(), 0);
    }

    #[test]
    fn test_leading_markers_merge_into_looping_technique() {
        let mut steps = cycling(3);
        steps[0] = step("AdvCycle");
        let p = plan(steps, &ConversionOptions::default()).unwrap();
        assert_eq!(p.techniques.len(), 1);
        assert_eq!(p.techniques[0].first_step, 1);
        assert!(p.techniques[0].does_loop());
        assert_eq!(p.adv_cycles_on_start(), 1);
    }

    #[test]
    fn test_nested_loop_is_unrolled() {
        let steps = vec![
            step("Do 1"),                  // 1
            step("Rest"),                  // 2
            step("Do 2"),                  // 3
            step("Charge"),                // 4
            loop_step("Loop 2", 3, 6),     // 5
            loop_step("Loop 1", 2, 7),     // 6
            step("Rest"),                  // 7
            step("End"),                   // 8
        ];
        let p = plan(steps, &ConversionOptions::default()).unwrap();
        // loop 1 is not the tail, so it stays a Loop entry
        assert_eq!(p.techniques.len(), 1);
        assert_eq!(p.seq_nums_by_step_num[&4], vec![1, 2, 3]);
        assert_eq!(p.seq_nums_by_step_num[&6], vec![4]);
        assert_eq!(p.seq_nums_by_step_num[&7], vec![5]);

        let copies: Vec<_> = p.items.iter().filter(|i| i.step == 4).map(|i| i.path.clone()).collect();
        assert_eq!(copies, vec![vec![0], vec![1], vec![2]]);

        let loop_markers = p.items.iter().filter(|i| i.step == 5).count();
        assert_eq!(loop_markers, 3);
        assert_eq!(p.locate(5, &[1]).map(|i| p.items[i].path.clone()), Some(vec![1]));
        assert_eq!(p.locate(4, &[]).map(|i| p.items[i].seq), Some(Some(1)));
    }

    #[test]
    fn test_unroll_cap() {
        let steps = vec![
            step("Do 1"),
            step("Do 2"),
            step("Charge"),
            loop_step("Loop 2", 500, 5),
            loop_step("Loop 1", 2, 6),
            step("Rest"),
        ];
        let options = ConversionOptions {
            max_sequence_entries: 100,
            ..Default::default()
        };
        let err = plan(steps, &options).unwrap_err();
        assert!(matches!(err, ConvertError::Capacity { capacity: 100, .. }));
    }

    #[test]
    fn test_mismatched_loops() {
        let steps = vec![step("Do 1"), step("Charge"), loop_step("Loop 2", 2, 4), step("End")];
        let err = plan(steps, &ConversionOptions::default()).unwrap_err();
        assert!(matches!(err, ConvertError::Parse { .. }));
        assert_eq!(err.step(), Some(3));

        let err = plan(vec![step("Do 1"), step("Charge")], &ConversionOptions::default()).unwrap_err();
        assert_eq!(err.step(), Some(1));

        let err = plan(vec![step("Charge"), loop_step("Loop 1", 2, 3)], &ConversionOptions::default()).unwrap_err();
        assert_eq!(err.step(), Some(2));
    }

    #[test]
    fn test_empty_loop_body() {
        let steps = vec![step("Do 1"), step("AdvCycle"), loop_step("Loop 1", 2, 4), step("End")];
        let err = plan(steps, &ConversionOptions::default()).unwrap_err();
        assert!(matches!(err, ConvertError::UnsupportedStep { step: 3, .. }));
    }

    #[test]
    fn test_unknown_step_type() {
        let err = plan(vec![step("Rest"), step("GSM")], &ConversionOptions::default()).unwrap_err();
        assert!(matches!(err, ConvertError::UnsupportedStep { step: 2, .. }));
    }
}
