//! N-gram model view over a weighted automaton.
//!
//! Every state stands for an n-gram history. The unigram state is the root
//! of the suffix tree; every other state carries exactly one back-off arc
//! pointing at the state of its longest proper suffix. Construction derives
//! the back-off tree, per-state orders and the unigram state, and rejects
//! automata that violate the structure.

use std::collections::VecDeque;

use crate::fst::{Arc, VectorFst};
use crate::weight::{self, neg_log_diff, neg_log_sum_kahan, Weight, ONE, ZERO};
use crate::{Error, Label, StateId};

#[derive(Debug, Clone)]
pub struct NGramModel<W: Weight = f64> {
    fst: VectorFst<W>,
    backoff_label: Label,
    norm_eps: f64,
    unigram: StateId,
    backoff: Vec<Option<StateId>>,
    order: Vec<u32>,
    hi_order: u32,
}

impl<W: Weight> NGramModel<W> {
    /// Wraps `fst` as an n-gram model, sorting its arcs and deriving the
    /// back-off structure. Fails on structural violations.
    pub fn new(mut fst: VectorFst<W>, backoff_label: Label, norm_eps: f64) -> Result<Self, Error> {
        fst.arc_sort();
        let start = fst.start().ok_or(Error::NoStartState)?;
        let n = fst.num_states();

        let mut backoff = vec![None; n];
        for state in 0..n {
            let mut found = None;
            for arc in fst.arcs(state) {
                if arc.ilabel == backoff_label {
                    if found.is_some() {
                        return Err(Error::MultipleBackoffArcs(state));
                    }
                    found = Some(arc.nextstate);
                }
            }
            backoff[state] = found;
        }

        // The unigram state is reached from the start by back-off arcs alone.
        let mut unigram = start;
        let mut steps = 0;
        while let Some(next) = backoff[unigram] {
            unigram = next;
            steps += 1;
            if steps > n {
                return Err(Error::BackoffCycle(start));
            }
        }
        for state in 0..n {
            if state != unigram && backoff[state].is_none() {
                return Err(Error::MissingBackoffArc(state));
            }
            let mut probe = state;
            let mut steps = 0;
            while let Some(next) = backoff[probe] {
                probe = next;
                steps += 1;
                if steps > n {
                    return Err(Error::BackoffCycle(state));
                }
            }
            if probe != unigram {
                return Err(Error::MissingBackoffArc(state));
            }
        }

        let mut order = vec![0u32; n];
        order[unigram] = 1;
        let mut queue = VecDeque::from([unigram]);
        while let Some(state) = queue.pop_front() {
            for arc in fst.arcs(state) {
                if arc.ilabel == backoff_label {
                    continue;
                }
                if order[arc.nextstate] == 0 {
                    order[arc.nextstate] = order[state] + 1;
                    queue.push_back(arc.nextstate);
                }
            }
        }
        for state in 0..n {
            if order[state] == 0 {
                // Not introduced by any n-gram arc; hang it off its suffix.
                tracing::warn!(state, "state not reached from the unigram state");
                let bo = backoff[state].expect("checked above");
                order[state] = order[bo] + 1;
            }
        }
        let hi_order = order.iter().copied().max().unwrap_or(1);

        Ok(NGramModel {
            fst,
            backoff_label,
            norm_eps,
            unigram,
            backoff,
            order,
            hi_order,
        })
    }

    /// Re-derives back-off structure and orders after structural edits made
    /// through [`NGramModel::fst_mut`].
    pub fn refresh(self) -> Result<Self, Error> {
        Self::new(self.fst, self.backoff_label, self.norm_eps)
    }

    pub fn fst(&self) -> &VectorFst<W> {
        &self.fst
    }

    /// Mutable access to the underlying automaton. Weight edits are safe;
    /// adding or removing arcs or states requires a [`NGramModel::refresh`].
    pub fn fst_mut(&mut self) -> &mut VectorFst<W> {
        &mut self.fst
    }

    pub fn into_fst(self) -> VectorFst<W> {
        self.fst
    }

    pub fn unigram_state(&self) -> StateId {
        self.unigram
    }

    pub fn start_state(&self) -> StateId {
        self.fst.start().expect("validated at construction")
    }

    pub fn backoff_label(&self) -> Label {
        self.backoff_label
    }

    pub fn norm_eps(&self) -> f64 {
        self.norm_eps
    }

    pub fn backoff_state(&self, state: StateId) -> Option<StateId> {
        self.backoff[state]
    }

    /// Scalar cost of the back-off arc of `state`.
    pub fn backoff_cost(&self, state: StateId) -> Option<f64> {
        self.fst
            .find_arc(state, self.backoff_label)
            .map(|arc| arc.weight.scalar())
    }

    pub fn state_order(&self, state: StateId) -> u32 {
        self.order[state]
    }

    pub fn hi_order(&self) -> u32 {
        self.hi_order
    }

    pub fn num_states(&self) -> usize {
        self.fst.num_states()
    }

    /// Number of n-grams in the model: one per non-back-off arc plus one per
    /// state with a final weight.
    pub fn num_ngrams(&self) -> usize {
        let mut count = 0;
        for state in self.fst.states() {
            count += self
                .fst
                .arcs(state)
                .iter()
                .filter(|arc| arc.ilabel != self.backoff_label)
                .count();
            if self.fst.is_final(state) {
                count += 1;
            }
        }
        count
    }

    /// State ids sorted by state order, ascending or descending. Ties keep
    /// state id order, so iteration is deterministic.
    pub fn states_by_order(&self, ascending: bool) -> Vec<StateId> {
        let mut states: Vec<StateId> = (0..self.fst.num_states()).collect();
        if ascending {
            states.sort_by_key(|&s| (self.order[s], s));
        } else {
            states.sort_by_key(|&s| (std::cmp::Reverse(self.order[s]), s));
        }
        states
    }

    /// Full negated-log probability of `label` at `state`, following
    /// back-off arcs until a matching arc is found. Returns the cost and the
    /// destination state, or `None` when even the unigram state lacks the
    /// label.
    pub fn prob(&self, state: StateId, label: Label) -> Option<(f64, StateId)> {
        let mut state = state;
        let mut cost = 0.0;
        loop {
            if let Some(arc) = self.fst.find_arc(state, label) {
                if arc.ilabel != self.backoff_label {
                    return Some((cost + arc.weight.scalar(), arc.nextstate));
                }
            }
            match self.backoff[state] {
                Some(bo) => {
                    cost += self.backoff_cost(state).unwrap_or(ZERO);
                    state = bo;
                }
                None => return None,
            }
        }
    }

    /// Negated-log stop probability at `state`, following back-off arcs when
    /// the state itself has no final weight.
    pub fn final_cost(&self, state: StateId) -> f64 {
        let mut state = state;
        let mut cost = 0.0;
        loop {
            if self.fst.is_final(state) {
                return cost + self.fst.final_weight(state).scalar();
            }
            match self.backoff[state] {
                Some(bo) => {
                    cost += self.backoff_cost(state).unwrap_or(ZERO);
                    state = bo;
                }
                None => return ZERO,
            }
        }
    }

    /// Sum over the events covered at `state` (non-back-off arcs plus the
    /// final weight), and the sum of the same events scored at the back-off
    /// state. Both use Kahan-compensated accumulation.
    pub fn state_sums(&self, state: StateId) -> (f64, f64) {
        let mut hi = ZERO;
        let mut hi_comp = 0.0;
        let mut lo = ZERO;
        let mut lo_comp = 0.0;
        let bo = self.backoff[state];
        for arc in self.fst.arcs(state) {
            if arc.ilabel == self.backoff_label {
                continue;
            }
            hi = neg_log_sum_kahan(hi, arc.weight.scalar(), &mut hi_comp);
            if let Some(bo) = bo {
                if let Some((cost, _)) = self.prob(bo, arc.ilabel) {
                    lo = neg_log_sum_kahan(lo, cost, &mut lo_comp);
                }
            }
        }
        if self.fst.is_final(state) {
            hi = neg_log_sum_kahan(hi, self.fst.final_weight(state).scalar(), &mut hi_comp);
            if let Some(bo) = bo {
                lo = neg_log_sum_kahan(lo, self.final_cost(bo), &mut lo_comp);
            }
        }
        (hi, lo)
    }

    /// Checks that every state's mass sums to one within `norm_eps`, folding
    /// the back-off mass in. The unigram state is skipped when the model has
    /// an explicit start state, since the start-of-sentence arc lives there
    /// without being a distribution event.
    pub fn check_normalization(&self) -> Result<(), Error> {
        for state in self.fst.states() {
            if state == self.unigram && self.start_state() != self.unigram {
                continue;
            }
            let norm = self.state_norm(state);
            if norm.abs() >= self.norm_eps {
                return Err(Error::Unnormalized {
                    state,
                    sum: norm,
                    eps: self.norm_eps,
                });
            }
        }
        Ok(())
    }

    /// Negated-log of the total mass at `state`; zero for a normalized state.
    pub fn state_norm(&self, state: StateId) -> f64 {
        let (hi, lo) = self.state_sums(state);
        match self.backoff_cost(state) {
            Some(alpha) => {
                let leftover = match neg_log_diff(ONE, lo) {
                    Ok(d) => d,
                    Err(_) => ZERO, // back-off events already cover everything
                };
                weight::neg_log_sum(hi, alpha + leftover)
            }
            None => hi,
        }
    }

    /// Checks the suffix-presence invariant: every non-back-off arc must be
    /// matchable (transitively) from the back-off state.
    pub fn check_consistency(&self) -> Result<(), Error> {
        for state in self.fst.states() {
            let Some(bo) = self.backoff[state] else { continue };
            for arc in self.fst.arcs(state) {
                if arc.ilabel == self.backoff_label {
                    continue;
                }
                if self.prob(bo, arc.ilabel).is_none() {
                    return Err(Error::MissingSuffixNgram {
                        state,
                        label: arc.ilabel,
                    });
                }
            }
        }
        Ok(())
    }

    /// Reverse histories of every state: index 0 is the most recent label.
    /// Recovered by descending the n-gram tree from the unigram state.
    pub fn state_histories(&self) -> Vec<Vec<Label>> {
        let mut histories: Vec<Option<Vec<Label>>> = vec![None; self.fst.num_states()];
        histories[self.unigram] = Some(Vec::new());
        let mut queue = VecDeque::from([self.unigram]);
        while let Some(state) = queue.pop_front() {
            let prefix = histories[state].clone().expect("visited");
            for arc in self.fst.arcs(state) {
                if arc.ilabel == self.backoff_label {
                    continue;
                }
                if self.order[arc.nextstate] == self.order[state] + 1
                    && histories[arc.nextstate].is_none()
                {
                    let mut hist = Vec::with_capacity(prefix.len() + 1);
                    hist.push(arc.ilabel);
                    hist.extend_from_slice(&prefix);
                    histories[arc.nextstate] = Some(hist);
                    queue.push_back(arc.nextstate);
                }
            }
        }
        histories
            .into_iter()
            .map(|h| h.unwrap_or_default())
            .collect()
    }

    /// Renumbers states so that reverse-label histories sort
    /// lexicographically; the canonical order for iteration and context
    /// ranges.
    pub fn sort_states(self) -> Result<Self, Error> {
        let histories = self.state_histories();
        let mut ids: Vec<StateId> = (0..self.fst.num_states()).collect();
        ids.sort_by(|&a, &b| histories[a].cmp(&histories[b]));
        let mut perm = vec![0usize; ids.len()];
        for (new_id, &old_id) in ids.iter().enumerate() {
            perm[old_id] = new_id;
        }
        let mut fst = self.fst;
        fst.permute_states(&perm);
        Self::new(fst, self.backoff_label, self.norm_eps)
    }

    /// Sets the weight of the arc at `pos` within `state`.
    pub fn set_arc_weight(&mut self, state: StateId, pos: usize, weight: W) {
        self.fst.arcs_mut(state)[pos].weight = weight;
    }

    /// Probability of each state's history: the product of the model
    /// probabilities along the n-gram tree path from the unigram state.
    pub fn state_probs(&self) -> Vec<f64> {
        let mut probs = vec![0.0; self.fst.num_states()];
        probs[self.unigram] = 1.0;
        for state in self.states_by_order(true) {
            for arc in self.fst.arcs(state) {
                if arc.ilabel == self.backoff_label {
                    continue;
                }
                if self.order[arc.nextstate] == self.order[state] + 1 {
                    probs[arc.nextstate] = probs[state] * (-arc.weight.scalar()).exp();
                }
            }
        }
        probs
    }

}

impl NGramModel<f64> {
    /// Recomputes every back-off weight from the remaining mass:
    /// `alpha = (1 - sum_hi) / (1 - sum_lo)` in negated-log space. States
    /// are processed in ascending order so lower-order weights are already
    /// in place when higher orders read them.
    pub fn recalc_backoff(&mut self) -> Result<(), Error> {
        for state in self.states_by_order(true) {
            if self.backoff[state].is_none() {
                continue;
            }
            let alpha = self.backoff_weight_for(state)?;
            let pos = self
                .fst
                .find_arc_pos(state, self.backoff_label)
                .expect("back-off arc present");
            self.fst.arcs_mut(state)[pos].weight = alpha;
        }
        Ok(())
    }

    /// The back-off weight that normalizes `state` given its current arcs.
    pub fn backoff_weight_for(&self, state: StateId) -> Result<f64, Error> {
        let (hi, lo) = self.state_sums(state);
        let numerator = match neg_log_diff(ONE, hi) {
            Ok(d) => d,
            Err(_) => return Ok(ZERO), // state already carries full mass
        };
        let denominator = match neg_log_diff(ONE, lo) {
            Ok(d) => d,
            Err(_) => return Ok(ZERO),
        };
        if denominator == ZERO {
            return Ok(ZERO);
        }
        Ok(numerator - denominator)
    }

    /// Scales the non-back-off arcs and the final weight of `state` by the
    /// given negated-log cost.
    pub fn scale_state(&mut self, state: StateId, cost: f64) {
        let backoff_label = self.backoff_label;
        if self.fst.is_final(state) {
            let w = *self.fst.final_weight(state);
            self.fst.set_final(state, w + cost);
        }
        for arc in self.fst.arcs_mut(state).iter_mut() {
            if arc.ilabel != backoff_label {
                arc.weight += cost;
            }
        }
    }
}

/// Convenience constructor for tests and small tools: builds a sorted
/// automaton from explicit arcs.
pub fn fst_from_arcs<W: Weight>(
    num_states: usize,
    start: StateId,
    finals: &[(StateId, W)],
    arcs: &[(StateId, Label, W, StateId)],
) -> VectorFst<W> {
    let mut fst = VectorFst::new();
    for _ in 0..num_states {
        fst.add_state();
    }
    fst.set_start(start);
    for (state, weight) in finals {
        fst.set_final(*state, weight.clone());
    }
    for (state, label, weight, nextstate) in arcs {
        fst.add_arc(*state, Arc::new(*label, weight.clone(), *nextstate));
    }
    fst.arc_sort();
    fst
}

#[cfg(test)]
mod test {
    use approx::assert_abs_diff_eq;

    use super::*;

    fn nl(p: f64) -> f64 {
        -p.ln()
    }

    /// Bigram model over {a=1, b=2}: states 0=unigram, 1=start (<s> with
    /// label 3), 2=[a], 3=[b]. All states normalized: the unigram
    /// distribution is p(a)=0.5, p(b)=0.3, p(</s>)=0.2.
    fn bigram_fst() -> VectorFst<f64> {
        fst_from_arcs(
            4,
            1,
            &[(0, nl(0.2)), (3, nl(0.5))],
            &[
                (0, 1, nl(0.5), 2),
                (0, 2, nl(0.3), 3),
                (0, 3, nl(1.0), 1), // <s> arc, excluded from normalization
                (1, 0, nl(0.2), 0),
                (1, 1, nl(0.9), 2),
                (2, 0, nl(1.0), 0),
                (2, 1, nl(0.3), 2),
                (2, 2, nl(0.5), 3),
                (3, 0, nl(1.0), 0),
                (3, 1, nl(0.2), 2),
            ],
        )
    }

    #[test]
    fn discovers_structure() {
        let model = NGramModel::new(bigram_fst(), 0, crate::NORM_EPS).unwrap();
        assert_eq!(model.unigram_state(), 0);
        assert_eq!(model.start_state(), 1);
        assert_eq!(model.hi_order(), 2);
        assert_eq!(model.state_order(0), 1);
        assert_eq!(model.state_order(2), 2);
        assert_eq!(model.backoff_state(2), Some(0));
        assert_eq!(model.backoff_state(0), None);
    }

    #[test]
    fn rejects_backoff_cycle() {
        // Two states backing off to each other.
        let fst = fst_from_arcs(
            2,
            0,
            &[(0, 0.0)],
            &[(0, 0, 0.5, 1), (1, 0, 0.5, 0), (0, 1, 1.0, 1)],
        );
        assert!(matches!(
            NGramModel::new(fst, 0, crate::NORM_EPS),
            Err(Error::BackoffCycle(_) | Error::MultipleBackoffArcs(_))
        ));
    }

    #[test]
    fn rejects_missing_backoff() {
        // State 1 is not the unigram state and has no back-off arc.
        let fst = fst_from_arcs(2, 0, &[(1, 0.0)], &[(0, 1, 0.5, 1)]);
        assert!(matches!(
            NGramModel::new(fst, 0, crate::NORM_EPS),
            Err(Error::MissingBackoffArc(1))
        ));
    }

    #[test]
    fn prob_follows_backoff() {
        let model = NGramModel::new(bigram_fst(), 0, crate::NORM_EPS).unwrap();
        // b at state [b]: no explicit arc, so alpha([b]) * p(b).
        let (cost, dest) = model.prob(3, 2).unwrap();
        assert_abs_diff_eq!(cost, nl(1.0) + nl(0.3), epsilon = 1e-12);
        assert_eq!(dest, 3);
        // a at state [a] is explicit.
        let (cost, _) = model.prob(2, 1).unwrap();
        assert_abs_diff_eq!(cost, nl(0.3), epsilon = 1e-12);
    }

    #[test]
    fn normalization_check_passes_and_fails() {
        let model = NGramModel::new(bigram_fst(), 0, crate::NORM_EPS).unwrap();
        model.check_normalization().unwrap();

        let mut broken = model.clone();
        broken.set_arc_weight(2, 1, nl(0.9));
        assert!(matches!(
            broken.check_normalization(),
            Err(Error::Unnormalized { state: 2, .. })
        ));
    }

    #[test]
    fn recalc_backoff_restores_normalization() {
        let mut model = NGramModel::new(bigram_fst(), 0, crate::NORM_EPS).unwrap();
        // Perturb the distribution at state [a], then refit its alpha.
        model.set_arc_weight(2, 1, nl(0.25));
        model.recalc_backoff().unwrap();
        model.check_normalization().unwrap();
    }

    #[test]
    fn histories_and_sort() {
        let model = NGramModel::new(bigram_fst(), 0, crate::NORM_EPS).unwrap();
        let histories = model.state_histories();
        assert_eq!(histories[0], Vec::<Label>::new());
        assert_eq!(histories[2], vec![1]);
        assert_eq!(histories[3], vec![2]);

        let sorted = model.sort_states().unwrap();
        let sorted_histories = sorted.state_histories();
        let mut expected = sorted_histories.clone();
        expected.sort();
        assert_eq!(sorted_histories, expected);
        sorted.check_normalization().unwrap();
    }

    #[test]
    fn consistency_check_spots_missing_suffix() {
        let mut fst = bigram_fst();
        // Label 9 exists at state 2 but nowhere down the back-off chain.
        fst.add_arc(2, Arc::new(9, nl(0.01), 3));
        fst.arc_sort();
        let model = NGramModel::new(fst, 0, crate::NORM_EPS).unwrap();
        assert!(matches!(
            model.check_consistency(),
            Err(Error::MissingSuffixNgram { state: 2, label: 9 })
        ));
    }
}
