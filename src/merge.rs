//! Model and count merging.
//!
//! Merging walks the two automata paired state-by-state through their
//! (reverse) histories, materializing states the first operand lacks, then
//! combines weights label by label according to the method. Count-style
//! merges add mass; model-style merges mix probabilities and refit the
//! back-off weights afterwards.

use std::collections::HashMap;

use crate::context::NGramContext;
use crate::fst::{Arc, VectorFst};
use crate::model::NGramModel;
use crate::weight::{Weight, ZERO};
use crate::{Error, Label, StateId};

#[derive(Debug, Clone)]
pub enum MergeMethod {
    /// Weighted addition of counts.
    CountMerge,
    /// Weighted mixture of probabilities.
    ModelMerge,
    /// Mixture weighted by per-state posteriors.
    BayesModelMerge,
    /// Take states inside the context interval from the second operand.
    ContextMerge { pattern: String },
    /// Bin-wise weighted addition of histogram counts.
    HistogramMerge,
    /// Second operand overwrites, up to a maximum n-gram order.
    ReplaceMerge { max_replace_order: Option<u32> },
}

#[derive(Debug, Clone)]
pub struct MergeOptions {
    pub method: MergeMethod,
    /// Weight of the first operand.
    pub alpha: f64,
    /// Weight of the second operand.
    pub beta: f64,
    /// Refit back-off weights and check normalization on the result.
    pub normalize: bool,
    pub backoff_label: Label,
    pub norm_eps: f64,
    pub check_consistency: bool,
}

impl Default for MergeOptions {
    fn default() -> Self {
        MergeOptions {
            method: MergeMethod::CountMerge,
            alpha: 1.0,
            beta: 1.0,
            normalize: false,
            backoff_label: crate::DEFAULT_BACKOFF_LABEL,
            norm_eps: crate::NORM_EPS,
            check_consistency: false,
        }
    }
}

/// Merges two scalar automata (counts or models).
pub fn merge_models(
    fst1: VectorFst<f64>,
    fst2: &VectorFst<f64>,
    opts: &MergeOptions,
) -> Result<VectorFst<f64>, Error> {
    let mut fst = merge_core(fst1, fst2, opts)?;
    if opts.normalize {
        let mut model = NGramModel::new(fst, opts.backoff_label, opts.norm_eps)?;
        model.recalc_backoff()?;
        model.check_normalization()?;
        fst = model.into_fst();
    }
    Ok(fst)
}

/// Merges two histogram-count automata bin-wise.
pub fn merge_hist_models(
    fst1: VectorFst<crate::weight::HistWeight>,
    fst2: &VectorFst<crate::weight::HistWeight>,
    opts: &MergeOptions,
) -> Result<VectorFst<crate::weight::HistWeight>, Error> {
    merge_core(fst1, fst2, opts)
}

/// Copies the n-grams of `src` whose state history lies in the context
/// interval into `dst`, overwriting matching weights. Used to stitch split
/// models back together.
pub fn transfer_model(
    dst: VectorFst<f64>,
    src: &VectorFst<f64>,
    context_pattern: &str,
    normalize: bool,
) -> Result<VectorFst<f64>, Error> {
    merge_models(
        dst,
        src,
        &MergeOptions {
            method: MergeMethod::ContextMerge {
                pattern: context_pattern.to_string(),
            },
            normalize,
            ..MergeOptions::default()
        },
    )
}

/// Mutable result automaton plus the derived arrays kept in step as
/// states are materialized.
struct Work<W: Weight> {
    fst: VectorFst<W>,
    order: Vec<u32>,
    /// Per-state label -> arc position.
    label_index: Vec<HashMap<Label, usize>>,
    hist_index: HashMap<Vec<Label>, StateId>,
}

impl<W: Weight> Work<W> {
    fn arc_weight(&self, state: StateId, label: Label) -> Option<&W> {
        self.label_index[state]
            .get(&label)
            .map(|&pos| &self.fst.arcs(state)[pos].weight)
    }

    fn set_arc(&mut self, state: StateId, label: Label, weight: W, dest: StateId, deepen: bool) {
        match self.label_index[state].get(&label) {
            Some(&pos) => {
                let arc = &mut self.fst.arcs_mut(state)[pos];
                arc.weight = weight;
                if deepen && self.order[dest] > self.order[arc.nextstate] {
                    arc.nextstate = dest;
                }
            }
            None => {
                let pos = self.fst.num_arcs(state);
                self.fst.add_arc(state, Arc::new(label, weight, dest));
                self.label_index[state].insert(label, pos);
            }
        }
    }
}

fn merge_core<W: Weight>(
    fst1: VectorFst<W>,
    fst2: &VectorFst<W>,
    opts: &MergeOptions,
) -> Result<VectorFst<W>, Error> {
    let model1 = NGramModel::new(fst1, opts.backoff_label, opts.norm_eps)?;
    let model2 = NGramModel::new(fst2.clone(), opts.backoff_label, opts.norm_eps)?;
    if opts.check_consistency {
        model1.check_consistency()?;
        model2.check_consistency()?;
    }
    let hist2 = model2.state_histories();

    let counts_style = matches!(
        opts.method,
        MergeMethod::CountMerge | MergeMethod::HistogramMerge
    );
    let alpha_nl = -opts.alpha.ln();
    let beta_nl = -opts.beta.ln();

    let posteriors = match opts.method {
        MergeMethod::BayesModelMerge => Some((model1.state_probs(), model2.state_probs())),
        _ => None,
    };
    let context = match &opts.method {
        MergeMethod::ContextMerge { pattern } => Some(NGramContext::from_pattern(
            pattern,
            model1.hi_order().max(model2.hi_order()) as usize,
        )?),
        _ => None,
    };

    // Working copy of the first operand; the original stays readable for
    // backed-off estimates.
    let mut work = {
        let fst = model1.fst().clone();
        let order = (0..fst.num_states())
            .map(|s| model1.state_order(s))
            .collect();
        let label_index = (0..fst.num_states())
            .map(|s| {
                fst.arcs(s)
                    .iter()
                    .enumerate()
                    .map(|(pos, arc)| (arc.ilabel, pos))
                    .collect()
            })
            .collect();
        let hist_index = model1
            .state_histories()
            .into_iter()
            .enumerate()
            .map(|(s, h)| (h, s))
            .collect();
        Work {
            fst,
            order,
            label_index,
            hist_index,
        }
    };

    // Count-style merging scales the first operand's mass up front.
    if counts_style && alpha_nl != 0.0 {
        for state in 0..work.fst.num_states() {
            for arc in work.fst.arcs_mut(state).iter_mut() {
                arc.weight = arc.weight.times_scalar(alpha_nl);
            }
            if work.fst.is_final(state) {
                let w = work.fst.final_weight(state).times_scalar(alpha_nl);
                work.fst.set_final(state, w);
            }
        }
    }

    // Pair every state of the second operand with a state of the first,
    // materializing missing states with their back-off arc in place.
    // Ascending order guarantees the back-off destination is paired first.
    let mut map2 = vec![0usize; model2.num_states()];
    for s2 in model2.states_by_order(true) {
        if let Some(&s1) = work.hist_index.get(&hist2[s2]) {
            map2[s2] = s1;
            continue;
        }
        let s1 = work.fst.add_state();
        work.order.push(model2.state_order(s2));
        work.label_index.push(HashMap::new());
        work.hist_index.insert(hist2[s2].clone(), s1);
        map2[s2] = s1;
        if let Some(bo2) = model2.backoff_state(s2) {
            let bo_weight = model2
                .fst()
                .find_arc(s2, opts.backoff_label)
                .map(|arc| arc.weight.clone())
                .unwrap_or_else(W::zero);
            let weight = if counts_style {
                bo_weight.times_scalar(beta_nl)
            } else {
                bo_weight
            };
            work.fst.add_arc(s1, Arc::new(opts.backoff_label, weight, map2[bo2]));
            work.label_index[s1].insert(opts.backoff_label, 0);
        }
    }

    // Combine weights label by label.
    for s2 in model2.states_by_order(true) {
        let s1 = map2[s2];
        let in_context = context
            .as_ref()
            .map(|ctx| ctx.has_context(&hist2[s2], false))
            .unwrap_or(false);
        let lambda = posteriors.as_ref().map(|(p1, p2)| {
            let w1 = if s1 < p1.len() { opts.alpha * p1[s1] } else { 0.0 };
            let w2 = opts.beta * p2[s2];
            if w1 + w2 > 0.0 {
                w1 / (w1 + w2)
            } else {
                0.5
            }
        });

        for arc2 in model2.fst().arcs(s2) {
            let shared_backoff = arc2.ilabel == opts.backoff_label;
            if shared_backoff
                && matches!(
                    opts.method,
                    MergeMethod::ModelMerge | MergeMethod::BayesModelMerge
                )
            {
                continue; // mixture back-off weights are refit afterwards
            }
            let dest1 = if shared_backoff {
                model2.backoff_state(s2).map(|bo| map2[bo]).unwrap_or(s1)
            } else {
                map2[arc2.nextstate]
            };
            let w1 = work.arc_weight(s1, arc2.ilabel).cloned();
            let est1 = || {
                longest_suffix_state(&model1, &work, &hist2[s2])
                    .and_then(|s| model1.prob(s, arc2.ilabel))
                    .map(|(c, _)| c)
                    .unwrap_or(ZERO)
            };
            let combined = combine_weights(
                opts,
                &w1,
                Some(&arc2.weight),
                est1(),
                ZERO,
                lambda,
                in_context,
                work.order[s1],
            );
            if let Some(weight) = combined {
                work.set_arc(s1, arc2.ilabel, weight, dest1, !shared_backoff);
            }
        }
        let final2 = model2.fst().final_weight(s2).clone();
        if final2 != W::zero() {
            let w1 = if s1 < work.fst.num_states() && work.fst.is_final(s1) {
                Some(work.fst.final_weight(s1).clone())
            } else {
                None
            };
            let est1 = longest_suffix_state(&model1, &work, &hist2[s2])
                .map(|s| model1.final_cost(s))
                .unwrap_or(ZERO);
            let combined = combine_weights(
                opts,
                &w1,
                Some(&final2),
                est1,
                ZERO,
                lambda,
                in_context,
                work.order[s1],
            );
            if let Some(weight) = combined {
                work.fst.set_final(s1, weight);
            }
        }

        // Events only the first operand carries still mix against the
        // second operand's backed-off estimate in model-style merges.
        if matches!(
            opts.method,
            MergeMethod::ModelMerge | MergeMethod::BayesModelMerge
        ) {
            let labels: Vec<(Label, W)> = work.fst.arcs(s1)
                .iter()
                .filter(|a| a.ilabel != opts.backoff_label)
                .filter(|a| model2.fst().find_arc(s2, a.ilabel).is_none())
                .map(|a| (a.ilabel, a.weight.clone()))
                .collect();
            for (label, w1) in labels {
                let est2 = model2.prob(s2, label).map(|(c, _)| c).unwrap_or(ZERO);
                if let Some(weight) = combine_weights(
                    opts,
                    &Some(w1),
                    None,
                    ZERO,
                    est2,
                    lambda,
                    in_context,
                    work.order[s1],
                ) {
                    let dest = work.label_index[s1]
                        .get(&label)
                        .map(|&pos| work.fst.arcs(s1)[pos].nextstate)
                        .expect("existing arc");
                    work.set_arc(s1, label, weight, dest, false);
                }
            }
            if work.fst.is_final(s1) && final2 == W::zero() {
                let w1 = work.fst.final_weight(s1).clone();
                let est2 = model2.final_cost(s2);
                if let Some(weight) = combine_weights(
                    opts,
                    &Some(w1),
                    None,
                    ZERO,
                    est2,
                    lambda,
                    in_context,
                    work.order[s1],
                ) {
                    work.fst.set_final(s1, weight);
                }
            }
        }
    }

    let mut fst = work.fst;
    fst.arc_sort();
    Ok(fst)
}

/// The state of the longest suffix of `hist` present in the original first
/// operand (the materialized states are skipped so estimates come from
/// real distributions).
fn longest_suffix_state<W: Weight>(
    model1: &NGramModel<W>,
    work: &Work<W>,
    hist: &[Label],
) -> Option<StateId> {
    for start in 0..=hist.len() {
        if let Some(&s) = work.hist_index.get(&hist[..hist.len() - start]) {
            if s < model1.num_states() {
                return Some(s);
            }
        }
    }
    None
}

/// Combines one event's weights. `w1`/`w2` are the explicit weights when
/// present; `est1`/`est2` are backed-off scalar estimates used by the
/// mixture methods when one side lacks the event. Returns `None` when the
/// result should keep whatever the working automaton already holds.
#[allow(clippy::too_many_arguments)]
fn combine_weights<W: Weight>(
    opts: &MergeOptions,
    w1: &Option<W>,
    w2: Option<&W>,
    est1: f64,
    est2: f64,
    lambda: Option<f64>,
    in_context: bool,
    ngram_order: u32,
) -> Option<W> {
    let beta_nl = -opts.beta.ln();
    match &opts.method {
        MergeMethod::CountMerge | MergeMethod::HistogramMerge => {
            let scaled2 = w2.map(|w| w.times_scalar(beta_nl));
            match (w1, scaled2) {
                (Some(a), Some(b)) => Some(a.plus(&b)),
                (None, Some(b)) => Some(b),
                _ => None,
            }
        }
        MergeMethod::ModelMerge | MergeMethod::BayesModelMerge => {
            let (mix1, mix2) = match &opts.method {
                MergeMethod::BayesModelMerge => {
                    let l = lambda.expect("posteriors computed");
                    (l, 1.0 - l)
                }
                _ => (opts.alpha, opts.beta),
            };
            let c1 = w1.as_ref().map(|w| w.scalar()).unwrap_or(est1);
            let c2 = w2.map(|w| w.scalar()).unwrap_or(est2);
            let p = mix1 * nl_exp(c1) + mix2 * nl_exp(c2);
            if p > 0.0 {
                Some(W::from_scalar(-p.ln()))
            } else {
                None
            }
        }
        MergeMethod::ContextMerge { .. } => {
            if in_context {
                w2.cloned().or_else(|| w1.clone())
            } else {
                None // out of context: the first operand stands
            }
        }
        MergeMethod::ReplaceMerge { max_replace_order } => {
            let within = max_replace_order.map(|m| ngram_order <= m).unwrap_or(true);
            if within {
                w2.cloned().or_else(|| w1.clone())
            } else {
                w1.clone().or_else(|| w2.cloned())
            }
        }
    }
}

fn nl_exp(cost: f64) -> f64 {
    if cost == ZERO {
        0.0
    } else {
        (-cost).exp()
    }
}

/// Restores the suffix-presence invariant: every n-gram arc must have a
/// matching arc (with whatever mass) at the back-off state. Split pieces
/// and hand-built automata are completed this way before merging.
pub fn ngram_complete<W: Weight>(
    fst: VectorFst<W>,
    backoff_label: Label,
) -> Result<VectorFst<W>, Error> {
    let model = NGramModel::new(fst, backoff_label, crate::NORM_EPS)?;
    let mut added: Vec<HashMap<Label, StateId>> = vec![HashMap::new(); model.num_states()];
    for state in model.states_by_order(false) {
        for arc in model.fst().arcs(state) {
            if arc.ilabel == backoff_label {
                continue;
            }
            let mut probe = model.backoff_state(state);
            let mut dest = arc.nextstate;
            while let Some(bo) = probe {
                if model.fst().find_arc(bo, arc.ilabel).is_some()
                    || added[bo].contains_key(&arc.ilabel)
                {
                    break;
                }
                // The proper destination is the longest suffix of the
                // n-gram that fits one order above the back-off state.
                while model.state_order(dest) > model.state_order(bo) + 1 {
                    dest = model.backoff_state(dest).expect("deeper states back off");
                }
                added[bo].insert(arc.ilabel, dest);
                probe = model.backoff_state(bo);
            }
        }
    }
    let mut fst = model.into_fst();
    for (state, arcs) in added.into_iter().enumerate() {
        for (label, dest) in arcs {
            fst.add_arc(state, Arc::new(label, W::zero(), dest));
        }
    }
    fst.arc_sort();
    Ok(fst)
}

#[cfg(test)]
mod test {
    use approx::assert_abs_diff_eq;

    use super::*;
    use crate::count::{count_sequences, CountOptions};
    use crate::make::{make_model, MakeMethod, MakeOptions};
    use crate::symbols::SymbolTable;

    fn symbols() -> SymbolTable {
        let mut table = SymbolTable::new();
        table.add_symbol("a");
        table.add_symbol("b");
        table
    }

    fn counts(sentences: Vec<Vec<Label>>) -> VectorFst<f64> {
        count_sequences(
            sentences,
            Some(&symbols()),
            &CountOptions {
                order: 2,
                ..CountOptions::default()
            },
        )
        .unwrap()
    }

    fn arc_count(model: &NGramModel<f64>, hist: &[Label], label: Label) -> f64 {
        let histories = model.state_histories();
        let state = histories.iter().position(|h| h == hist).unwrap();
        (-model.fst().find_arc(state, label).unwrap().weight).exp()
    }

    #[test]
    fn count_merge_adds_counts() {
        let merged = merge_models(
            counts(vec![vec![1, 2]]),
            &counts(vec![vec![1, 1]]),
            &MergeOptions::default(),
        )
        .unwrap();
        let model = NGramModel::new(merged, 0, crate::NORM_EPS).unwrap();
        // c(a) = 1 + 2, c(a b) = 1 + 0, c(a a) = 0 + 1.
        assert_abs_diff_eq!(arc_count(&model, &[], 1), 3.0, epsilon = 1e-9);
        assert_abs_diff_eq!(arc_count(&model, &[1], 2), 1.0, epsilon = 1e-9);
        assert_abs_diff_eq!(arc_count(&model, &[1], 1), 1.0, epsilon = 1e-9);
    }

    #[test]
    fn count_merge_weights_scale() {
        let merged = merge_models(
            counts(vec![vec![1, 2]]),
            &counts(vec![vec![1, 1]]),
            &MergeOptions {
                alpha: 2.0,
                beta: 3.0,
                ..MergeOptions::default()
            },
        )
        .unwrap();
        let model = NGramModel::new(merged, 0, crate::NORM_EPS).unwrap();
        assert_abs_diff_eq!(arc_count(&model, &[], 1), 2.0 + 6.0, epsilon = 1e-9);
        assert_abs_diff_eq!(arc_count(&model, &[1], 1), 3.0, epsilon = 1e-9);
    }

    #[test]
    fn model_merge_mixes_probabilities() {
        let opts = MakeOptions {
            method: MakeMethod::WittenBell,
            norm_eps: 1e-6,
            ..MakeOptions::default()
        };
        let m1 = make_model(counts(vec![vec![1, 2], vec![1]]), &opts).unwrap();
        let m2 = make_model(counts(vec![vec![2, 2], vec![2, 1]]), &opts).unwrap();
        let p1 = (-m1.prob(m1.unigram_state(), 1).unwrap().0).exp();
        let p2 = (-m2.prob(m2.unigram_state(), 1).unwrap().0).exp();
        let merged = merge_models(
            m1.into_fst(),
            m2.fst(),
            &MergeOptions {
                method: MergeMethod::ModelMerge,
                alpha: 0.5,
                beta: 0.5,
                normalize: true,
                ..MergeOptions::default()
            },
        )
        .unwrap();
        let model = NGramModel::new(merged, 0, crate::NORM_EPS).unwrap();
        model.check_normalization().unwrap();
        let p = (-model.prob(model.unigram_state(), 1).unwrap().0).exp();
        assert_abs_diff_eq!(p, 0.5 * p1 + 0.5 * p2, epsilon = 1e-9);
    }

    #[test]
    fn replace_merge_overwrites() {
        let merged = merge_models(
            counts(vec![vec![1, 2]]),
            &counts(vec![vec![1, 2], vec![1, 2]]),
            &MergeOptions {
                method: MergeMethod::ReplaceMerge {
                    max_replace_order: None,
                },
                ..MergeOptions::default()
            },
        )
        .unwrap();
        let model = NGramModel::new(merged, 0, crate::NORM_EPS).unwrap();
        assert_abs_diff_eq!(arc_count(&model, &[1], 2), 2.0, epsilon = 1e-9);
    }

    #[test]
    fn complete_fills_missing_suffix_arcs() {
        // Bigram "a b" exists but the unigram "b" is missing.
        let fst = crate::model::fst_from_arcs(
            3,
            0,
            &[(0, 0.0)],
            &[
                (0, 1, 1.0, 1),
                (1, 0, 1.0, 0),
                (1, 2, 1.5, 2),
                (2, 0, 1.0, 0),
            ],
        );
        let completed = ngram_complete(fst, 0).unwrap();
        let model = NGramModel::new(completed, 0, crate::NORM_EPS).unwrap();
        assert!(model.fst().find_arc(model.unigram_state(), 2).is_some());
        model.check_consistency().unwrap();
    }
}
