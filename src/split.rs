//! Context-driven model splitting.
//!
//! [`NGramSplit`] partitions a model across a disjoint cover of context
//! intervals. Each output keeps the full n-grams of the states whose
//! history falls in its interval, plus the structural skeleton those states
//! need: the back-off spine and arc destinations as bare states carrying a
//! massless back-off arc. Splitting then merging the pieces back with
//! `count_merge` at unit weights reproduces the original model arc for arc.

use crate::context::{NGramContext, NGramExtendedContext};
use crate::fst::{Arc, VectorFst};
use crate::model::NGramModel;
use crate::weight::Weight;
use crate::{Error, Label, StateId};

#[derive(Debug, Clone)]
pub struct SplitOptions {
    pub backoff_label: Label,
    pub norm_eps: f64,
    /// Restore missing suffix n-grams before splitting.
    pub complete: bool,
    /// Collapse context intervals whose boundaries touch into one, so each
    /// maximal contiguous range yields a single output model.
    pub merge_contexts: bool,
}

impl Default for SplitOptions {
    fn default() -> Self {
        SplitOptions {
            backoff_label: crate::DEFAULT_BACKOFF_LABEL,
            norm_eps: crate::NORM_EPS,
            complete: false,
            merge_contexts: false,
        }
    }
}

pub struct NGramSplit<W: Weight> {
    model: NGramModel<W>,
    histories: Vec<Vec<Label>>,
    /// Context index per state, by its history.
    assignment: Vec<Option<usize>>,
    num_contexts: usize,
    next: usize,
}

impl<W: Weight> NGramSplit<W> {
    pub fn new(
        fst: VectorFst<W>,
        context_patterns: &[String],
        opts: &SplitOptions,
    ) -> Result<Self, Error> {
        let fst = if opts.complete {
            crate::merge::ngram_complete(fst, opts.backoff_label)?
        } else {
            fst
        };
        let model = NGramModel::new(fst, opts.backoff_label, opts.norm_eps)?;
        let contexts = context_patterns
            .iter()
            .map(|p| NGramContext::from_pattern(p, model.hi_order() as usize))
            .collect::<Result<Vec<_>, _>>()?;
        let contexts = NGramExtendedContext::new(contexts, opts.merge_contexts)?;
        let histories = model.state_histories();
        let num_contexts = contexts.contexts().len().max(1);
        let assignment: Vec<Option<usize>> = histories
            .iter()
            .map(|hist| {
                if contexts.is_empty() {
                    Some(0)
                } else {
                    let found = contexts.get_context(hist, false);
                    if found.is_none() {
                        tracing::warn!(?hist, "state history not covered by any context");
                    }
                    found
                }
            })
            .collect();
        Ok(NGramSplit {
            model,
            histories,
            assignment,
            num_contexts,
            next: 0,
        })
    }

    pub fn num_models(&self) -> usize {
        self.num_contexts
    }

    pub fn done(&self) -> bool {
        self.next >= self.num_contexts
    }

    /// Builds the model for the next context interval.
    pub fn next_model(&mut self) -> Result<VectorFst<W>, Error> {
        assert!(!self.done(), "all context models have been emitted");
        let index = self.next;
        self.next += 1;
        Ok(self.build(index))
    }

    fn build(&self, index: usize) -> VectorFst<W> {
        let fst = self.model.fst();

        // Closure over the states the output needs: in-context states in
        // full, then their back-off spines and arc destinations as bare
        // skeleton states.
        let mut include = vec![false; fst.num_states()];
        let mut stack: Vec<StateId> = Vec::new();
        let push = |s: StateId, include: &mut Vec<bool>, stack: &mut Vec<StateId>| {
            if !include[s] {
                include[s] = true;
                stack.push(s);
            }
        };
        for state in fst.states() {
            if self.assignment[state] == Some(index) {
                push(state, &mut include, &mut stack);
            }
        }
        push(self.model.unigram_state(), &mut include, &mut stack);
        push(self.model.start_state(), &mut include, &mut stack);
        while let Some(state) = stack.pop() {
            if let Some(bo) = self.model.backoff_state(state) {
                push(bo, &mut include, &mut stack);
            }
            for arc in fst.arcs(state) {
                push(arc.nextstate, &mut include, &mut stack);
            }
        }

        let mut remap = vec![usize::MAX; fst.num_states()];
        let mut out: VectorFst<W> = VectorFst::new();
        for state in fst.states() {
            if include[state] {
                remap[state] = out.add_state();
            }
        }
        for state in fst.states() {
            if !include[state] {
                continue;
            }
            let new_state = remap[state];
            let owned = self.assignment[state] == Some(index);
            for arc in fst.arcs(state) {
                // States outside the interval stay as skeleton: the arcs
                // keep the topology (histories, suffix presence) but carry
                // no mass, so re-merging the pieces adds nothing twice.
                let weight = if owned {
                    arc.weight.clone()
                } else {
                    W::zero()
                };
                out.add_arc(new_state, Arc::new(arc.ilabel, weight, remap[arc.nextstate]));
            }
            if owned && fst.is_final(state) {
                out.set_final(new_state, fst.final_weight(state).clone());
            }
        }
        out.set_start(remap[self.model.start_state()]);
        out.set_symbols(fst.symbols().cloned());
        out
    }

    /// The history of each state in the input model, reverse order.
    pub fn histories(&self) -> &[Vec<Label>] {
        &self.histories
    }
}

#[cfg(test)]
mod test {
    use approx::assert_abs_diff_eq;

    use super::*;
    use crate::count::{count_sequences, CountOptions};
    use crate::make::{make_model, MakeMethod, MakeOptions};
    use crate::merge::{merge_models, transfer_model, MergeOptions};
    use crate::symbols::SymbolTable;

    fn symbols() -> SymbolTable {
        let mut table = SymbolTable::new();
        table.add_symbol("a");
        table.add_symbol("b");
        table
    }

    fn bigram_counts() -> VectorFst<f64> {
        count_sequences(
            vec![vec![1, 2], vec![2, 1], vec![1, 1, 2]],
            Some(&symbols()),
            &CountOptions {
                order: 2,
                ..CountOptions::default()
            },
        )
        .unwrap()
    }

    /// Two intervals covering every reverse history: the unigram root and
    /// [a] fall in `0 : 2`, [b] and the start state in `2 : 5`.
    fn cover() -> Vec<String> {
        vec!["0 : 2".to_string(), "2 : 5".to_string()]
    }

    fn assert_same_model(a: &VectorFst<f64>, b: &VectorFst<f64>) {
        let ma = NGramModel::new(a.clone(), 0, crate::NORM_EPS).unwrap();
        let mb = NGramModel::new(b.clone(), 0, crate::NORM_EPS).unwrap();
        assert_eq!(ma.num_states(), mb.num_states());
        let ha = ma.state_histories();
        let hb = mb.state_histories();
        for sa in ma.fst().states() {
            let sb = hb.iter().position(|h| h == &ha[sa]).expect("state paired");
            assert_eq!(ma.fst().num_arcs(sa), mb.fst().num_arcs(sb));
            for arc in ma.fst().arcs(sa) {
                let other = mb.fst().find_arc(sb, arc.ilabel).expect("arc paired");
                assert_abs_diff_eq!(arc.weight, other.weight, epsilon = 1e-9);
                assert_eq!(hb[other.nextstate], ha[arc.nextstate]);
            }
            assert_abs_diff_eq!(
                *ma.fst().final_weight(sa),
                *mb.fst().final_weight(sb),
                epsilon = 1e-9
            );
        }
    }

    #[test]
    fn split_covers_and_merge_restores() {
        let counts = bigram_counts();
        let mut split = NGramSplit::new(counts.clone(), &cover(), &SplitOptions::default()).unwrap();
        assert_eq!(split.num_models(), 2);
        let first = split.next_model().unwrap();
        let second = split.next_model().unwrap();
        assert!(split.done());

        let merged = merge_models(first, &second, &MergeOptions::default()).unwrap();
        assert_same_model(&merged, &counts);
    }

    #[test]
    fn split_of_made_model_round_trips() {
        let model = make_model(
            bigram_counts(),
            &MakeOptions {
                method: MakeMethod::WittenBell,
                norm_eps: 1e-6,
                ..MakeOptions::default()
            },
        )
        .unwrap();
        let fst = model.into_fst();
        let mut split = NGramSplit::new(fst.clone(), &cover(), &SplitOptions::default()).unwrap();
        let first = split.next_model().unwrap();
        let second = split.next_model().unwrap();
        let merged = merge_models(first, &second, &MergeOptions::default()).unwrap();
        assert_same_model(&merged, &fst);
    }

    #[test]
    fn transfer_stitches_a_piece_back() {
        let counts = bigram_counts();
        let mut split = NGramSplit::new(counts.clone(), &cover(), &SplitOptions::default()).unwrap();
        let first = split.next_model().unwrap();
        let second = split.next_model().unwrap();
        let stitched = transfer_model(first, &second, "2 : 5", false).unwrap();
        assert_same_model(&stitched, &counts);
    }

    #[test]
    fn merged_touching_cover_splits_as_one() {
        // The two cover intervals touch at [2], so merging yields a single
        // output carrying the whole model.
        let counts = bigram_counts();
        let mut split = NGramSplit::new(
            counts.clone(),
            &cover(),
            &SplitOptions {
                merge_contexts: true,
                ..SplitOptions::default()
            },
        )
        .unwrap();
        assert_eq!(split.num_models(), 1);
        let only = split.next_model().unwrap();
        assert!(split.done());
        assert_same_model(&only, &counts);
    }

    #[test]
    fn null_context_split_copies() {
        let counts = bigram_counts();
        let mut split = NGramSplit::new(counts.clone(), &[], &SplitOptions::default()).unwrap();
        assert_eq!(split.num_models(), 1);
        let only = split.next_model().unwrap();
        assert_same_model(&only, &counts);
    }
}
