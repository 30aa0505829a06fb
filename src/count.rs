//! N-gram count accumulation.
//!
//! [`NGramCounter`] holds a prefix trie over histories whose arcs carry
//! negated-log counts, updated with Kahan-compensated sums. Sentences enter
//! as label sequences (the archive reader that would produce them is an
//! external collaborator); the filled trie is emitted as a count automaton
//! with back-off arcs carrying state totals.

use crate::fst::{Arc, VectorFst};
use crate::model::NGramModel;
use crate::symbols::{SymbolTable, END_SYMBOL, START_SYMBOL};
use crate::weight::{neg_log_sum_kahan, HistWeight, Weight, ONE, ZERO};
use crate::{Error, Label, StateId};

#[derive(Debug, Clone)]
pub struct CountOptions {
    /// Maximal n-gram length to count.
    pub order: usize,
    /// Treat label-0 arcs in the input as silent back-off transitions.
    pub epsilon_as_backoff: bool,
    /// Round emitted counts to the nearest integer.
    pub round_to_int: bool,
    /// Fail when the input has no symbol table.
    pub require_symbols: bool,
    /// Floor added to the unigram count of every word in the symbol table,
    /// guaranteeing vocabulary coverage.
    pub add_to_symbol_unigram_count: f64,
}

impl Default for CountOptions {
    fn default() -> Self {
        CountOptions {
            order: 3,
            epsilon_as_backoff: false,
            round_to_int: false,
            require_symbols: true,
            add_to_symbol_unigram_count: 0.0,
        }
    }
}

#[derive(Debug, Clone)]
struct CountState {
    /// `(label, arc id)` pairs kept sorted by label.
    arcs: Vec<(Label, usize)>,
    backoff: Option<usize>,
    order: usize,
    final_count: f64,
    final_comp: f64,
}

#[derive(Debug, Clone)]
struct CountArc {
    dest: usize,
    count: f64,
    comp: f64,
}

/// Prefix/suffix trie of n-gram counts in negated-log space.
#[derive(Debug, Clone)]
pub struct NGramCounter {
    states: Vec<CountState>,
    arcs: Vec<CountArc>,
    order: usize,
    unigram: usize,
    start: usize,
    start_count: f64,
    start_comp: f64,
}

impl NGramCounter {
    pub fn new(order: usize) -> Self {
        assert!(order >= 1, "counting order must be at least 1");
        let mut counter = NGramCounter {
            states: Vec::new(),
            arcs: Vec::new(),
            order,
            unigram: 0,
            start: 0,
            start_count: ZERO,
            start_comp: 0.0,
        };
        counter.unigram = counter.add_state(1, None);
        counter.start = if order > 1 {
            counter.add_state(2, Some(counter.unigram))
        } else {
            counter.unigram
        };
        counter
    }

    fn add_state(&mut self, order: usize, backoff: Option<usize>) -> usize {
        self.states.push(CountState {
            arcs: Vec::new(),
            backoff,
            order,
            final_count: ZERO,
            final_comp: 0.0,
        });
        self.states.len() - 1
    }

    pub fn ngram_start_state(&self) -> usize {
        self.start
    }

    pub fn ngram_unigram_state(&self) -> usize {
        self.unigram
    }

    pub fn ngram_backoff_state(&self, state: usize) -> Option<usize> {
        self.states[state].backoff
    }

    pub fn ngram_next_state(&self, arc_id: usize) -> usize {
        self.arcs[arc_id].dest
    }

    /// Finds the arc for `label` at `state`, creating it (and any states the
    /// destination needs) on first sight. Returns the arc id.
    pub fn find_arc(&mut self, state: usize, label: Label) -> usize {
        if let Ok(pos) = self.states[state]
            .arcs
            .binary_search_by_key(&label, |&(l, _)| l)
        {
            return self.states[state].arcs[pos].1;
        }
        let dest = if self.states[state].order < self.order {
            // New trie state one level deeper; its suffix state is the
            // destination of the same label at the back-off state.
            let child_backoff = match self.states[state].backoff {
                Some(bo) => {
                    let arc = self.find_arc(bo, label);
                    self.arcs[arc].dest
                }
                None => self.unigram,
            };
            self.add_state(self.states[state].order + 1, Some(child_backoff))
        } else {
            // Highest order: transition into the suffix state directly.
            match self.states[state].backoff {
                Some(bo) => {
                    let arc = self.find_arc(bo, label);
                    self.arcs[arc].dest
                }
                None => self.unigram, // order-1 model loops at the root
            }
        };
        let arc_id = self.arcs.len();
        self.arcs.push(CountArc {
            dest,
            count: ZERO,
            comp: 0.0,
        });
        let pos = self.states[state]
            .arcs
            .binary_search_by_key(&label, |&(l, _)| l)
            .unwrap_err();
        self.states[state].arcs.insert(pos, (label, arc_id));
        arc_id
    }

    pub fn set_ngram_weight(&mut self, arc_id: usize, weight: f64) {
        self.arcs[arc_id].count = weight;
        self.arcs[arc_id].comp = 0.0;
    }

    /// Adds `weight` (a negated-log count) into the arc's accumulator.
    pub fn update_ngram_weight(&mut self, arc_id: usize, weight: f64) {
        let arc = &mut self.arcs[arc_id];
        arc.count = neg_log_sum_kahan(arc.count, weight, &mut arc.comp);
    }

    pub fn set_final_ngram_weight(&mut self, state: usize, weight: f64) {
        self.states[state].final_count = weight;
        self.states[state].final_comp = 0.0;
    }

    pub fn update_final_ngram_weight(&mut self, state: usize, weight: f64) {
        let st = &mut self.states[state];
        st.final_count = neg_log_sum_kahan(st.final_count, weight, &mut st.final_comp);
    }

    /// Adds `weight` (a negated-log count) to the start-of-sentence count.
    pub fn update_start_count(&mut self, weight: f64) {
        self.start_count = neg_log_sum_kahan(self.start_count, weight, &mut self.start_comp);
    }

    /// Counts one sentence. Labels are vocabulary labels without the
    /// sentence boundary markers; the start and end of sentence are implied.
    /// Every n-gram of length up to the counting order is incremented.
    pub fn count_sequence(&mut self, labels: &[Label], epsilon_as_backoff: bool) {
        self.start_count = neg_log_sum_kahan(self.start_count, ONE, &mut self.start_comp);
        let mut hist = self.start;
        for &label in labels {
            if epsilon_as_backoff && label == 0 {
                hist = self.states[hist].backoff.unwrap_or(self.unigram);
                continue;
            }
            let mut deepest = None;
            let mut state = Some(hist);
            while let Some(st) = state {
                let arc = self.find_arc(st, label);
                self.update_ngram_weight(arc, ONE);
                if deepest.is_none() {
                    deepest = Some(arc);
                }
                state = self.states[st].backoff;
            }
            hist = self.arcs[deepest.expect("at least the root is updated")].dest;
        }
        let mut state = Some(hist);
        while let Some(st) = state {
            self.update_final_ngram_weight(st, ONE);
            state = self.states[st].backoff;
        }
    }

    /// Emits the trie as a count automaton: counts on arcs, state totals on
    /// back-off arcs, the start-of-sentence count on a `start_label` arc
    /// from the unigram state to the start state.
    pub fn get_fst(&self, start_label: Label, round_to_int: bool) -> VectorFst<f64> {
        let round = |w: f64| {
            if round_to_int && w != ZERO {
                let c = (-w).exp().round();
                if c <= 0.0 {
                    ZERO
                } else {
                    -c.ln()
                }
            } else {
                w
            }
        };
        let mut fst = VectorFst::new();
        for _ in 0..self.states.len() {
            fst.add_state();
        }
        fst.set_start(self.start);
        for (id, state) in self.states.iter().enumerate() {
            let mut total = round(state.final_count);
            let mut comp = 0.0;
            for &(label, arc_id) in &state.arcs {
                let count = round(self.arcs[arc_id].count);
                if count == ZERO {
                    continue;
                }
                total = neg_log_sum_kahan(total, count, &mut comp);
                fst.add_arc(id, Arc::new(label, count, self.arcs[arc_id].dest));
            }
            if state.final_count != ZERO {
                fst.set_final(id, round(state.final_count));
            }
            if let Some(bo) = state.backoff {
                fst.add_arc(id, Arc::new(0, total, bo));
            }
        }
        if self.order > 1 && self.start_count != ZERO {
            fst.add_arc(
                self.unigram,
                Arc::new(start_label, self.start_count, self.start),
            );
        }
        fst.arc_sort();
        fst
    }
}

/// Counts n-grams over an iterator of label sequences and returns the count
/// automaton. The symbol table, when given, is augmented with the sentence
/// boundary words and attached to the result.
pub fn count_sequences<I>(
    sequences: I,
    symbols: Option<&SymbolTable>,
    opts: &CountOptions,
) -> Result<VectorFst<f64>, Error>
where
    I: IntoIterator<Item = Vec<Label>>,
{
    if opts.require_symbols && symbols.is_none() {
        return Err(Error::MissingSymbols);
    }
    let mut counter = NGramCounter::new(opts.order);
    let mut max_label = 0;
    for sequence in sequences {
        max_label = sequence.iter().copied().max().unwrap_or(0).max(max_label);
        counter.count_sequence(&sequence, opts.epsilon_as_backoff);
    }

    let mut table = symbols.cloned();
    if opts.add_to_symbol_unigram_count > 0.0 {
        let table = table.as_ref().ok_or(Error::MissingSymbols)?;
        let floor = -opts.add_to_symbol_unigram_count.ln();
        for (label, word) in table.iter() {
            if label == 0 || word == START_SYMBOL || word == END_SYMBOL {
                continue;
            }
            let arc = counter.find_arc(counter.ngram_unigram_state(), label);
            counter.update_ngram_weight(arc, floor);
        }
    }

    let start_label = match table.as_mut() {
        Some(table) => {
            table.add_symbol(END_SYMBOL);
            table.add_symbol(START_SYMBOL)
        }
        None => max_label + 1,
    };
    let mut fst = counter.get_fst(start_label, opts.round_to_int);
    fst.set_symbols(table);
    Ok(fst)
}

/// Maps a scalar count automaton onto histogram arcs, spreading each
/// expected count over its two adjacent integer bins.
pub fn to_histogram_fst(fst: &VectorFst<f64>) -> VectorFst<HistWeight> {
    map_weights(fst, |w| HistWeight::from_expected_count(*w))
}

/// Projects a histogram automaton back onto its scalar expected counts.
pub fn to_scalar_fst(fst: &VectorFst<HistWeight>) -> VectorFst<f64> {
    map_weights(fst, |w| w.scalar())
}

fn map_weights<A: Weight, B: Weight>(fst: &VectorFst<A>, f: impl Fn(&A) -> B) -> VectorFst<B> {
    let mut out = VectorFst::new();
    for _ in 0..fst.num_states() {
        out.add_state();
    }
    if let Some(start) = fst.start() {
        out.set_start(start);
    }
    for state in fst.states() {
        if fst.is_final(state) {
            out.set_final(state, f(fst.final_weight(state)));
        }
        for arc in fst.arcs(state) {
            out.add_arc(state, Arc::new(arc.ilabel, f(&arc.weight), arc.nextstate));
        }
    }
    out.set_symbols(fst.symbols().cloned());
    out
}

/// Count-of-counts table: `n(order, r)` is the number of distinct n-grams of
/// the given order observed exactly `r` times, for `r` in `1..=bins`.
#[derive(Debug, Clone, PartialEq)]
pub struct CountOfCounts {
    bins: usize,
    histogram: Vec<Vec<f64>>,
}

impl CountOfCounts {
    pub fn bins(&self) -> usize {
        self.bins
    }

    pub fn hi_order(&self) -> usize {
        self.histogram.len()
    }

    /// `n_r` for the given 1-based order and count `r`.
    pub fn n(&self, order: usize, r: usize) -> f64 {
        if order == 0 || r == 0 {
            return 0.0;
        }
        self.histogram
            .get(order - 1)
            .and_then(|h| h.get(r - 1))
            .copied()
            .unwrap_or(0.0)
    }

    /// Gathers count-of-counts from a count automaton, rounding counts to
    /// integer bins. `context` restricts gathering to matching histories.
    pub fn from_counts(
        model: &NGramModel<f64>,
        bins: usize,
        context: Option<&crate::context::NGramContext>,
    ) -> Self {
        let mut coc = CountOfCounts {
            bins,
            histogram: vec![vec![0.0; bins]; model.hi_order() as usize],
        };
        let histories = model.state_histories();
        for state in model.fst().states() {
            if let Some(ctx) = context {
                if !ctx.has_context(&histories[state], true) {
                    continue;
                }
            }
            let order = model.state_order(state) as usize;
            for arc in model.fst().arcs(state) {
                if arc.ilabel == model.backoff_label() {
                    continue;
                }
                coc.add_scalar(order, arc.weight);
            }
            if model.fst().is_final(state) {
                coc.add_scalar(order, model.fst().final_weight(state).scalar());
            }
        }
        coc
    }

    /// Gathers fractional count-of-counts from histogram evidence: each arc
    /// contributes `P(count = r)` to `n_r`.
    pub fn from_histograms(model: &NGramModel<HistWeight>, bins: usize) -> Self {
        let mut coc = CountOfCounts {
            bins,
            histogram: vec![vec![0.0; bins]; model.hi_order() as usize],
        };
        for state in model.fst().states() {
            let order = model.state_order(state) as usize;
            for arc in model.fst().arcs(state) {
                if arc.ilabel == model.backoff_label() {
                    continue;
                }
                coc.add_hist(order, &arc.weight);
            }
            if model.fst().is_final(state) {
                coc.add_hist(order, model.fst().final_weight(state));
            }
        }
        coc
    }

    fn add_scalar(&mut self, order: usize, weight: f64) {
        if weight == ZERO {
            return;
        }
        let r = (-weight).exp().round();
        if r >= 1.0 && r <= self.bins as f64 {
            self.histogram[order - 1][r as usize - 1] += 1.0;
        }
    }

    fn add_hist(&mut self, order: usize, weight: &HistWeight) {
        for r in 1..=self.bins {
            if r + 1 < crate::weight::HIST_BINS {
                let mass = (-weight.bins[r + 1]).exp();
                if mass > 0.0 {
                    self.histogram[order - 1][r - 1] += mass;
                }
            }
        }
    }

    /// Good-Turing style absolute discount `n_1 / (n_1 + 2 n_2)`.
    pub fn absolute_discount(&self, order: usize) -> Option<f64> {
        let n1 = self.n(order, 1);
        let n2 = self.n(order, 2);
        if n1 > 0.0 {
            Some(n1 / (n1 + 2.0 * n2))
        } else {
            None
        }
    }

    /// Encodes the table as a small automaton: one chain of states, the
    /// arcs leaving state `o` carry label `r` and weight `-log n_r` for the
    /// n-grams of order `o + 1`.
    pub fn to_fst(&self) -> VectorFst<f64> {
        let mut fst = VectorFst::new();
        let orders = self.histogram.len();
        for _ in 0..=orders {
            fst.add_state();
        }
        fst.set_start(0);
        fst.set_final(orders, ONE);
        for (o, hist) in self.histogram.iter().enumerate() {
            for (i, &n) in hist.iter().enumerate() {
                if n > 0.0 {
                    fst.add_arc(o, Arc::new(i as Label + 1, -n.ln(), o + 1));
                }
            }
        }
        fst.arc_sort();
        fst
    }

    /// Decodes [`CountOfCounts::to_fst`] output.
    pub fn from_fst(fst: &VectorFst<f64>, bins: usize) -> Result<Self, Error> {
        let start = fst.start().ok_or(Error::NoStartState)?;
        let orders = fst.num_states().saturating_sub(1);
        let mut histogram = vec![vec![0.0; bins]; orders];
        let mut state = start;
        for hist in histogram.iter_mut() {
            let mut next: Option<StateId> = None;
            for arc in fst.arcs(state) {
                let r = arc.ilabel as usize;
                if r >= 1 && r <= bins {
                    hist[r - 1] = (-arc.weight).exp();
                }
                next = Some(arc.nextstate);
            }
            // An order with no represented counts has no arcs; the chain
            // is linear, so the next state follows numerically.
            state = next.unwrap_or(state + 1);
        }
        Ok(CountOfCounts { bins, histogram })
    }
}

#[cfg(test)]
mod test {
    use approx::assert_abs_diff_eq;

    use super::*;
    use crate::NORM_EPS;

    fn nl(c: f64) -> f64 {
        -c.ln()
    }

    fn symbols_ab() -> SymbolTable {
        let mut table = SymbolTable::new();
        table.add_symbol("a");
        table.add_symbol("b");
        table
    }

    /// Bigram counts for the corpus { "a b", "a a b" }.
    fn counted_ab() -> NGramModel<f64> {
        let fst = count_sequences(
            vec![vec![1, 2], vec![1, 1, 2]],
            Some(&symbols_ab()),
            &CountOptions {
                order: 2,
                ..CountOptions::default()
            },
        )
        .unwrap();
        NGramModel::new(fst, 0, NORM_EPS).unwrap()
    }

    fn state_with_history(model: &NGramModel<f64>, hist: &[Label]) -> StateId {
        model
            .state_histories()
            .iter()
            .position(|h| h == hist)
            .unwrap()
    }

    #[test]
    fn counts_small_corpus() {
        let model = counted_ab();
        let uni = model.unigram_state();
        let start = model.start_state();
        let fst = model.fst();

        // Unigrams: c(a) = 3, c(b) = 2, c(</s>) = 2, c(<s>) = 2.
        assert_abs_diff_eq!(fst.find_arc(uni, 1).unwrap().weight, nl(3.0), epsilon = 1e-9);
        assert_abs_diff_eq!(fst.find_arc(uni, 2).unwrap().weight, nl(2.0), epsilon = 1e-9);
        assert_abs_diff_eq!(*fst.final_weight(uni), nl(2.0), epsilon = 1e-12);
        let start_label = fst.symbols().unwrap().find(START_SYMBOL).unwrap();
        assert_abs_diff_eq!(fst.find_arc(uni, start_label).unwrap().weight, nl(2.0), epsilon = 1e-9);

        // Bigrams: c(<s> a) = 2, c(a a) = 1, c(a b) = 2, c(b </s>) = 2.
        assert_abs_diff_eq!(fst.find_arc(start, 1).unwrap().weight, nl(2.0), epsilon = 1e-9);
        let a_state = state_with_history(&model, &[1]);
        let b_state = state_with_history(&model, &[2]);
        assert_abs_diff_eq!(fst.find_arc(a_state, 1).unwrap().weight, nl(1.0), epsilon = 1e-9);
        assert_abs_diff_eq!(fst.find_arc(a_state, 2).unwrap().weight, nl(2.0), epsilon = 1e-9);
        assert_abs_diff_eq!(*fst.final_weight(b_state), nl(2.0), epsilon = 1e-12);
    }

    #[test]
    fn backoff_arcs_carry_totals() {
        let model = counted_ab();
        let a_state = state_with_history(&model, &[1]);
        // c(a a) + c(a b) = 3.
        assert_abs_diff_eq!(model.backoff_cost(a_state).unwrap(), nl(3.0), epsilon = 1e-9);
    }

    #[test]
    fn epsilon_as_backoff_shortens_history() {
        let mut counter = NGramCounter::new(2);
        counter.count_sequence(&[1, 0, 2], true);
        let fst = counter.get_fst(9, false);
        let model = NGramModel::new(fst, 0, NORM_EPS).unwrap();
        // The epsilon breaks the "1 2" bigram: only "<s> 1" and the
        // unigrams are counted, and "2" is counted from the unigram state.
        let a_state = state_with_history(&model, &[1]);
        assert!(model.fst().find_arc(a_state, 2).is_none());
    }

    #[test]
    fn unigram_floor_covers_vocabulary() {
        let mut symbols = symbols_ab();
        symbols.add_symbol("c");
        let fst = count_sequences(
            vec![vec![1]],
            Some(&symbols),
            &CountOptions {
                order: 1,
                add_to_symbol_unigram_count: 1.0,
                ..CountOptions::default()
            },
        )
        .unwrap();
        let model = NGramModel::new(fst, 0, NORM_EPS).unwrap();
        let uni = model.unigram_state();
        // c(a) = 1 + 1 floor; unseen b and c get the floor.
        assert_abs_diff_eq!(model.fst().find_arc(uni, 1).unwrap().weight, nl(2.0), epsilon = 1e-9);
        assert_abs_diff_eq!(model.fst().find_arc(uni, 2).unwrap().weight, nl(1.0), epsilon = 1e-9);
        assert_abs_diff_eq!(model.fst().find_arc(uni, 3).unwrap().weight, nl(1.0), epsilon = 1e-9);
    }

    #[test]
    fn missing_symbols_rejected_when_required() {
        let result = count_sequences(vec![vec![1]], None, &CountOptions::default());
        assert!(matches!(result, Err(Error::MissingSymbols)));
    }

    #[test]
    fn round_to_int_rounds() {
        let mut counter = NGramCounter::new(1);
        let arc = counter.find_arc(counter.ngram_unigram_state(), 1);
        counter.set_ngram_weight(arc, nl(1.9));
        let fst = counter.get_fst(2, true);
        assert_abs_diff_eq!(fst.find_arc(0, 1).unwrap().weight, nl(2.0), epsilon = 1e-12);
    }

    #[test]
    fn count_of_counts_histogram() {
        let model = counted_ab();
        let coc = CountOfCounts::from_counts(&model, 5, None);
        // Unigram events observed once: none; twice: b, </s>, <s>;
        // three times: a.
        assert_eq!(coc.n(1, 2), 3.0);
        assert_eq!(coc.n(1, 3), 1.0);
        // Bigram events: c(a a) = 1; c(<s> a) = c(a b) = c(b </s>) = 2.
        assert_eq!(coc.n(2, 1), 1.0);
        assert_eq!(coc.n(2, 2), 3.0);
    }

    #[test]
    fn count_of_counts_fst_round_trip() {
        let model = counted_ab();
        let coc = CountOfCounts::from_counts(&model, 5, None);
        let back = CountOfCounts::from_fst(&coc.to_fst(), 5).unwrap();
        assert_eq!(coc, back);
    }

    #[test]
    fn histogram_mapping_round_trip() {
        let model = counted_ab();
        let hist = to_histogram_fst(model.fst());
        let back = to_scalar_fst(&hist);
        for state in model.fst().states() {
            for (a, b) in model.fst().arcs(state).iter().zip(back.arcs(state)) {
                assert_abs_diff_eq!(a.weight, b.weight, epsilon = 1e-12);
            }
        }
    }
}
