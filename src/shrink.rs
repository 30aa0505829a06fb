//! Model pruning.
//!
//! Pruning is a three-pass operation: score and mark candidate arcs, drop
//! the marked arcs while keeping the back-off structure intact (a marked
//! arc survives when a higher-order state still needs it, or when its
//! destination state still carries n-grams), then refit back-off weights so
//! the surviving states normalize again.

use std::collections::HashMap;

use crate::context::NGramContext;
use crate::model::NGramModel;
use crate::weight::ZERO;
use crate::{Error, Label, StateId};

#[derive(Debug, Clone)]
pub enum ShrinkMethod {
    /// Remove arcs whose raw count (recovered from the stored weight) is
    /// below theta.
    CountPrune { theta: f64 },
    /// Remove an explicit set of n-grams, given in natural label order.
    ListPrune { ngrams: Vec<Vec<Label>> },
    /// Remove arcs whose state history falls outside the context pattern.
    ContextPrune { pattern: String },
    /// Kullback-Leibler distance between the state distribution with and
    /// without the arc, after back-off absorption.
    RelativeEntropy { theta: f64 },
    /// Seymore-Rosenfeld weighted score
    /// `N(h) p(a|h) [log p(a|h) - log alpha'(h) p(a|h')]`.
    Seymore { theta: f64 },
}

#[derive(Debug, Clone)]
pub struct ShrinkOptions {
    pub method: ShrinkMethod,
    /// Prune down to at most this many n-grams by searching for the
    /// threshold instead of using the method's theta.
    pub target_number_of_ngrams: Option<usize>,
    pub min_order_to_prune: u32,
    /// 0 fastest to 2 most accurate back-off refitting.
    pub shrink_opt: u8,
    /// Scale for the Seymore state frequency term.
    pub total_unigram_count: Option<f64>,
    pub check_consistency: bool,
}

impl Default for ShrinkOptions {
    fn default() -> Self {
        ShrinkOptions {
            method: ShrinkMethod::Seymore { theta: 0.0 },
            target_number_of_ngrams: None,
            min_order_to_prune: 2,
            shrink_opt: 0,
            total_unigram_count: None,
            check_consistency: false,
        }
    }
}

/// Prunes `model` in place and returns the (reconnected, renormalized)
/// result.
pub fn shrink_model(
    model: NGramModel<f64>,
    opts: &ShrinkOptions,
) -> Result<NGramModel<f64>, Error> {
    if opts.check_consistency {
        model.check_consistency()?;
    }
    let shrinker = Shrinker::new(&model, opts)?;
    let marks = match opts.target_number_of_ngrams {
        Some(target) => shrinker.marks_for_target(target)?,
        None => {
            let mut marks = shrinker.initial_marks(None)?;
            shrinker.protect(&mut marks);
            marks
        }
    };
    apply_marks(model, marks, opts)
}

/// Candidate arc scores and marking logic, shared between a direct prune
/// and the target-size threshold search.
struct Shrinker<'a> {
    model: &'a NGramModel<f64>,
    opts: &'a ShrinkOptions,
    /// Scores aligned with arc positions; `None` for non-candidates.
    scores: Vec<Vec<Option<f64>>>,
}

impl<'a> Shrinker<'a> {
    fn new(model: &'a NGramModel<f64>, opts: &'a ShrinkOptions) -> Result<Self, Error> {
        let mut scores: Vec<Vec<Option<f64>>> = (0..model.num_states())
            .map(|s| vec![None; model.fst().num_arcs(s)])
            .collect();

        let state_probs = match opts.method {
            ShrinkMethod::Seymore { .. } => Some(model.state_probs()),
            _ => None,
        };
        let histories = match opts.method {
            ShrinkMethod::ListPrune { .. } | ShrinkMethod::ContextPrune { .. } => {
                Some(model.state_histories())
            }
            _ => None,
        };

        match &opts.method {
            ShrinkMethod::ListPrune { ngrams } => {
                if ngrams.is_empty() {
                    return Err(Error::EmptyPruneList);
                }
                let histories = histories.as_ref().expect("computed above");
                let by_history: HashMap<&[Label], StateId> = histories
                    .iter()
                    .enumerate()
                    .map(|(s, h)| (h.as_slice(), s))
                    .collect();
                for ngram in ngrams {
                    let Some((&label, prefix)) = ngram.split_last() else {
                        continue;
                    };
                    let mut reversed: Vec<Label> = prefix.to_vec();
                    reversed.reverse();
                    let Some(&state) = by_history.get(reversed.as_slice()) else {
                        tracing::warn!(?ngram, "n-gram to prune not in the model");
                        continue;
                    };
                    if let Some(pos) = model.fst().find_arc_pos(state, label) {
                        if candidate(model, state, label, opts) {
                            scores[state][pos] = Some(0.0);
                        }
                    } else {
                        tracing::warn!(?ngram, "n-gram to prune not in the model");
                    }
                }
            }
            ShrinkMethod::ContextPrune { pattern } => {
                let context = NGramContext::from_pattern(pattern, model.hi_order() as usize)?;
                let histories = histories.as_ref().expect("computed above");
                for state in model.fst().states() {
                    if context.has_context(&histories[state], true) {
                        continue;
                    }
                    for (pos, arc) in model.fst().arcs(state).iter().enumerate() {
                        if candidate(model, state, arc.ilabel, opts) {
                            scores[state][pos] = Some(0.0);
                        }
                    }
                }
            }
            method => {
                for state in model.fst().states() {
                    if model.state_order(state) < opts.min_order_to_prune {
                        continue;
                    }
                    for (pos, arc) in model.fst().arcs(state).iter().enumerate() {
                        if !candidate(model, state, arc.ilabel, opts) {
                            continue;
                        }
                        scores[state][pos] =
                            Some(score_arc(model, state, pos, method, opts, &state_probs));
                    }
                }
            }
        }
        Ok(Shrinker {
            model,
            opts,
            scores,
        })
    }

    /// Marks candidates whose score falls below the threshold. List and
    /// context pruning mark every located candidate regardless.
    fn initial_marks(&self, theta_override: Option<f64>) -> Result<Vec<Vec<bool>>, Error> {
        let theta = theta_override.unwrap_or(match &self.opts.method {
            ShrinkMethod::CountPrune { theta } => *theta,
            ShrinkMethod::RelativeEntropy { theta } => *theta,
            ShrinkMethod::Seymore { theta } => *theta,
            ShrinkMethod::ListPrune { .. } | ShrinkMethod::ContextPrune { .. } => f64::INFINITY,
        });
        Ok(self
            .scores
            .iter()
            .map(|row| {
                row.iter()
                    .map(|score| matches!(score, Some(s) if *s < theta))
                    .collect()
            })
            .collect())
    }

    /// Clears marks that would break the model: a surviving arc keeps the
    /// same label alive down the back-off chain, and an arc whose
    /// destination state still holds n-grams (itself or through states
    /// backing off to it) cannot go. One descending sweep settles deeper
    /// states before their parents.
    fn protect(&self, marks: &mut [Vec<bool>]) {
        let model = self.model;
        let backoff_label = model.backoff_label();
        let n = model.num_states();
        let mut bo_children: Vec<Vec<StateId>> = vec![Vec::new(); n];
        for state in 0..n {
            if let Some(bo) = model.backoff_state(state) {
                bo_children[bo].push(state);
            }
        }
        let mut live = vec![false; n];
        for state in model.states_by_order(false) {
            // Destination states that still carry n-grams keep their arc.
            for pos in 0..model.fst().num_arcs(state) {
                if !marks[state][pos] {
                    continue;
                }
                let dest = model.fst().arcs(state)[pos].nextstate;
                if model.state_order(dest) == model.state_order(state) + 1 && live[dest] {
                    marks[state][pos] = false;
                }
            }
            live[state] = model.fst().is_final(state)
                || model
                    .fst()
                    .arcs(state)
                    .iter()
                    .enumerate()
                    .any(|(p, a)| a.ilabel != backoff_label && !marks[state][p])
                || bo_children[state].iter().any(|&c| live[c]);
            // Surviving arcs protect their label at the back-off state.
            let Some(bo) = model.backoff_state(state) else {
                continue;
            };
            for (pos, arc) in model.fst().arcs(state).iter().enumerate() {
                if arc.ilabel == backoff_label || marks[state][pos] {
                    continue;
                }
                if let Some(bo_pos) = model.fst().find_arc_pos(bo, arc.ilabel) {
                    marks[bo][bo_pos] = false;
                }
            }
        }
    }

    /// Number of n-grams that survive a given set of marks.
    fn survivors(&self, marks: &[Vec<bool>]) -> usize {
        let pruned: usize = marks
            .iter()
            .map(|row| row.iter().filter(|&&m| m).count())
            .sum();
        self.model.num_ngrams() - pruned
    }

    /// Searches the candidate scores for the lowest threshold that leaves
    /// at most `target` n-grams, honoring protection.
    fn marks_for_target(&self, target: usize) -> Result<Vec<Vec<bool>>, Error> {
        let mut all_scores: Vec<f64> = self
            .scores
            .iter()
            .flatten()
            .filter_map(|s| *s)
            .collect();
        all_scores.sort_by(|a, b| a.partial_cmp(b).expect("scores are finite"));

        let minimum = {
            let mut marks = self.initial_marks(Some(f64::INFINITY))?;
            self.protect(&mut marks);
            self.survivors(&marks)
        };
        if target < minimum {
            return Err(Error::TargetTooSmall {
                target,
                minimum,
            });
        }

        // Binary search for the fewest pruned candidates that reach the
        // target: prune everything scoring at or below the k-th lowest.
        let theta_above = |k: usize| {
            if k == 0 {
                f64::NEG_INFINITY
            } else {
                all_scores[k - 1] + f64::EPSILON.max(all_scores[k - 1].abs() * 1e-12)
            }
        };
        let survivors_at = |k: usize| -> Result<usize, Error> {
            let mut marks = self.initial_marks(Some(theta_above(k)))?;
            self.protect(&mut marks);
            Ok(self.survivors(&marks))
        };
        let mut lo = 0usize;
        let mut hi = all_scores.len();
        while lo < hi {
            let mid = lo + (hi - lo) / 2;
            if survivors_at(mid)? <= target {
                hi = mid;
            } else {
                lo = mid + 1;
            }
        }
        let mut marks = self.initial_marks(Some(theta_above(lo)))?;
        self.protect(&mut marks);
        Ok(marks)
    }
}

/// An arc is a pruning candidate only at or above the minimum order, never
/// the back-off arc, never the start-of-sentence arc.
fn candidate(model: &NGramModel<f64>, state: StateId, label: Label, opts: &ShrinkOptions) -> bool {
    if label == model.backoff_label() {
        return false;
    }
    if model.state_order(state) < opts.min_order_to_prune {
        return false;
    }
    if state == model.unigram_state() {
        return false;
    }
    true
}

fn score_arc(
    model: &NGramModel<f64>,
    state: StateId,
    pos: usize,
    method: &ShrinkMethod,
    opts: &ShrinkOptions,
    state_probs: &Option<Vec<f64>>,
) -> f64 {
    let arc = &model.fst().arcs(state)[pos];
    match method {
        ShrinkMethod::CountPrune { .. } => (-arc.weight).exp(),
        ShrinkMethod::RelativeEntropy { .. } | ShrinkMethod::Seymore { .. } => {
            let bo = model.backoff_state(state).expect("candidate state");
            let p = (-arc.weight).exp();
            let p_lower = (-model.prob(bo, arc.ilabel).map(|(c, _)| c).unwrap_or(ZERO)).exp();
            let alpha = (-model.backoff_cost(state).unwrap_or(ZERO))
                .exp()
                .max(f64::MIN_POSITIVE);
            let (hi_sum, lo_sum) = model.state_sums(state);
            let leftover = 1.0 - (-hi_sum).exp();
            let lower_leftover = 1.0 - (-lo_sum).exp();
            // Refit alpha as if the arc were gone.
            let new_alpha = (leftover + p) / (lower_leftover + p_lower).max(f64::MIN_POSITIVE);
            match method {
                ShrinkMethod::RelativeEntropy { .. } => {
                    let shifted = (new_alpha * p_lower).max(f64::MIN_POSITIVE);
                    p * (p.ln() - shifted.ln())
                        + leftover.max(0.0) * (alpha.ln() - new_alpha.ln())
                }
                ShrinkMethod::Seymore { .. } => {
                    let probs = state_probs.as_ref().expect("computed for seymore");
                    let scale = opts.total_unigram_count.unwrap_or(1.0);
                    let n_h = probs[state] * scale;
                    let shifted = (new_alpha * p_lower).max(f64::MIN_POSITIVE);
                    n_h * p * (p.ln() - shifted.ln())
                }
                _ => unreachable!(),
            }
        }
        _ => 0.0,
    }
}

/// Drops the marked arcs, redirects arcs aimed at emptied states to their
/// suffixes, reconnects, and refits back-off weights.
fn apply_marks(
    model: NGramModel<f64>,
    marks: Vec<Vec<bool>>,
    opts: &ShrinkOptions,
) -> Result<NGramModel<f64>, Error> {
    let backoff_label = model.backoff_label();
    let norm_eps = model.norm_eps();
    let mut emptied = vec![false; model.num_states()];
    for state in model.fst().states() {
        for (pos, arc) in model.fst().arcs(state).iter().enumerate() {
            if marks[state][pos] && model.state_order(arc.nextstate) == model.state_order(state) + 1
            {
                emptied[arc.nextstate] = true;
            }
        }
    }
    let redirect: Vec<StateId> = (0..model.num_states())
        .map(|mut s| {
            while emptied[s] {
                s = model.backoff_state(s).expect("emptied states back off");
            }
            s
        })
        .collect();

    let mut fst = model.into_fst();
    for state in 0..fst.num_states() {
        let marks = &marks[state];
        let mut pos = 0;
        fst.arcs_mut(state).retain(|_| {
            let keep = !marks[pos];
            pos += 1;
            keep
        });
        for arc in fst.arcs_mut(state).iter_mut() {
            arc.nextstate = redirect[arc.nextstate];
        }
    }
    fst.connect();

    let mut model = NGramModel::new(fst, backoff_label, norm_eps)?;
    match opts.shrink_opt {
        0 | 1 => model.recalc_backoff()?,
        _ => {
            // Iterate the refit until the weights stop moving.
            for _ in 0..3 {
                let before: Vec<Option<f64>> = (0..model.num_states())
                    .map(|s| model.backoff_cost(s))
                    .collect();
                model.recalc_backoff()?;
                let delta = (0..model.num_states())
                    .filter_map(|s| match (before[s], model.backoff_cost(s)) {
                        (Some(a), Some(b)) if a != ZERO && b != ZERO => Some((a - b).abs()),
                        _ => None,
                    })
                    .fold(0.0f64, f64::max);
                if delta < model.norm_eps() {
                    break;
                }
            }
        }
    }
    Ok(model)
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::count::{count_sequences, CountOptions};
    use crate::make::{make_model, MakeMethod, MakeOptions};
    use crate::symbols::SymbolTable;

    fn symbols() -> SymbolTable {
        let mut table = SymbolTable::new();
        for word in ["a", "b", "c", "d", "e"] {
            table.add_symbol(word);
        }
        table
    }

    /// Ten-word corpus over five symbols, trigram counts.
    fn corpus_counts() -> crate::fst::VectorFst<f64> {
        count_sequences(
            vec![
                vec![1, 2, 3, 1, 2],
                vec![2, 3, 4, 5],
                vec![1],
            ],
            Some(&symbols()),
            &CountOptions {
                order: 3,
                ..CountOptions::default()
            },
        )
        .unwrap()
    }

    fn made_model() -> NGramModel<f64> {
        make_model(
            corpus_counts(),
            &MakeOptions {
                method: MakeMethod::Absolute,
                discount_d: Some(0.5),
                norm_eps: 1e-6,
                ..MakeOptions::default()
            },
        )
        .unwrap()
    }

    fn count_model() -> NGramModel<f64> {
        NGramModel::new(corpus_counts(), 0, crate::NORM_EPS).unwrap()
    }

    #[test]
    fn count_prune_is_monotone() {
        let big = shrink_model(
            count_model(),
            &ShrinkOptions {
                method: ShrinkMethod::CountPrune { theta: 1.5 },
                ..ShrinkOptions::default()
            },
        )
        .unwrap();
        let small = shrink_model(
            count_model(),
            &ShrinkOptions {
                method: ShrinkMethod::CountPrune { theta: 2.5 },
                ..ShrinkOptions::default()
            },
        )
        .unwrap();
        assert!(small.num_ngrams() <= big.num_ngrams());
        assert!(big.num_ngrams() < count_model().num_ngrams());
        // Containment: every surviving n-gram of the tighter threshold
        // survives the looser one.
        let big_hist = big.state_histories();
        let small_hist = small.state_histories();
        for state in small.fst().states() {
            for arc in small.fst().arcs(state) {
                if arc.ilabel == 0 {
                    continue;
                }
                let hist = &small_hist[state];
                let big_state = big_hist.iter().position(|h| h == hist).unwrap();
                assert!(big.fst().find_arc(big_state, arc.ilabel).is_some());
            }
        }
    }

    #[test]
    fn seymore_prunes_and_renormalizes() {
        let model = made_model();
        let before = model.num_ngrams();
        let shrunk = shrink_model(
            model,
            &ShrinkOptions {
                method: ShrinkMethod::Seymore { theta: 0.01 },
                min_order_to_prune: 3,
                ..ShrinkOptions::default()
            },
        )
        .unwrap();
        assert!(shrunk.num_ngrams() < before);
        shrunk.check_normalization().unwrap();
        shrunk.check_consistency().unwrap();
    }

    #[test]
    fn relative_entropy_prunes_and_renormalizes() {
        let shrunk = shrink_model(
            made_model(),
            &ShrinkOptions {
                method: ShrinkMethod::RelativeEntropy { theta: 0.005 },
                shrink_opt: 2,
                ..ShrinkOptions::default()
            },
        )
        .unwrap();
        shrunk.check_normalization().unwrap();
        shrunk.check_consistency().unwrap();
    }

    #[test]
    fn target_size_is_respected() {
        let model = made_model();
        let target = model.num_ngrams() - 4;
        let shrunk = shrink_model(
            model,
            &ShrinkOptions {
                method: ShrinkMethod::RelativeEntropy { theta: 0.0 },
                target_number_of_ngrams: Some(target),
                ..ShrinkOptions::default()
            },
        )
        .unwrap();
        assert!(shrunk.num_ngrams() <= target);
        shrunk.check_normalization().unwrap();
    }

    #[test]
    fn impossible_target_is_rejected() {
        let result = shrink_model(
            made_model(),
            &ShrinkOptions {
                method: ShrinkMethod::RelativeEntropy { theta: 0.0 },
                target_number_of_ngrams: Some(1),
                ..ShrinkOptions::default()
            },
        );
        assert!(matches!(result, Err(Error::TargetTooSmall { .. })));
    }

    #[test]
    fn empty_list_is_rejected() {
        let result = shrink_model(
            made_model(),
            &ShrinkOptions {
                method: ShrinkMethod::ListPrune { ngrams: vec![] },
                ..ShrinkOptions::default()
            },
        );
        assert!(matches!(result, Err(Error::EmptyPruneList)));
    }

    #[test]
    fn list_prune_removes_named_ngram() {
        let model = made_model();
        // "a b" as labels.
        let shrunk = shrink_model(
            model,
            &ShrinkOptions {
                method: ShrinkMethod::ListPrune {
                    ngrams: vec![vec![1, 2]],
                },
                ..ShrinkOptions::default()
            },
        )
        .unwrap();
        let histories = shrunk.state_histories();
        if let Some(a_state) = histories.iter().position(|h| h == &[1]) {
            // Either the arc is gone or a higher-order n-gram protected it.
            let still_there = shrunk.fst().find_arc(a_state, 2).is_some();
            let needed = shrunk.fst().states().any(|s| {
                shrunk.backoff_state(s) == Some(a_state)
                    && shrunk.fst().find_arc(s, 2).is_some()
            });
            assert!(!still_there || needed);
        }
    }

    #[test]
    fn context_prune_drops_out_of_context_ngrams() {
        let model = made_model();
        let before = model.num_ngrams();
        let shrunk = shrink_model(
            model,
            &ShrinkOptions {
                method: ShrinkMethod::ContextPrune {
                    pattern: "1 : 3".to_string(),
                },
                ..ShrinkOptions::default()
            },
        )
        .unwrap();
        assert!(shrunk.num_ngrams() < before);
        shrunk.check_normalization().unwrap();
        shrunk.check_consistency().unwrap();
    }
}
