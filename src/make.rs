//! Model estimation: raw counts to a normalized back-off model.
//!
//! All methods share one pipeline: wrap the count automaton, optionally
//! reassign lower-order counts (Kneser-Ney), compute per-method discounts,
//! then normalize state by state in ascending order so that lower-order
//! probabilities are final before higher orders interpolate against them.
//! Back-off weights are solved from the remaining mass at each state.

use std::str::FromStr;

use crate::count::CountOfCounts;
use crate::fst::VectorFst;
use crate::model::NGramModel;
use crate::weight::{neg_log_diff, neg_log_sum, neg_log_sum_kahan, HistWeight, Weight, ONE, ZERO};
use crate::{Error, StateId};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MakeMethod {
    Unsmoothed,
    Presmoothed,
    WittenBell,
    Absolute,
    Katz,
    KneserNey,
    KatzFrac,
}

impl MakeMethod {
    /// Whether the method interpolates lower-order mass by default.
    fn default_interpolate(&self) -> bool {
        matches!(self, MakeMethod::WittenBell | MakeMethod::KneserNey)
    }
}

impl FromStr for MakeMethod {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Error> {
        match s {
            "unsmoothed" => Ok(MakeMethod::Unsmoothed),
            "presmoothed" => Ok(MakeMethod::Presmoothed),
            "witten_bell" => Ok(MakeMethod::WittenBell),
            "absolute" => Ok(MakeMethod::Absolute),
            "katz" => Ok(MakeMethod::Katz),
            "kneser_ney" => Ok(MakeMethod::KneserNey),
            "katz_frac" => Ok(MakeMethod::KatzFrac),
            other => Err(Error::UnknownMethod(other.to_string())),
        }
    }
}

#[derive(Debug, Clone)]
pub struct MakeOptions {
    pub method: MakeMethod,
    /// Force pure back-off smoothing.
    pub backoff: bool,
    /// Force interpolated smoothing.
    pub interpolate: bool,
    /// Count bins for Katz and for count-of-counts gathering.
    pub bins: usize,
    /// Witten-Bell hyperparameter K.
    pub witten_bell_k: f64,
    /// Absolute discount D; estimated from count-of-counts when unset.
    pub discount_d: Option<f64>,
    /// Supplied count-of-counts table; gathered from the input when absent.
    pub count_of_counts: Option<CountOfCounts>,
    pub backoff_label: crate::Label,
    pub norm_eps: f64,
    pub check_consistency: bool,
}

impl Default for MakeOptions {
    fn default() -> Self {
        MakeOptions {
            method: MakeMethod::Katz,
            backoff: false,
            interpolate: false,
            bins: 5,
            witten_bell_k: 1.0,
            discount_d: None,
            count_of_counts: None,
            backoff_label: crate::DEFAULT_BACKOFF_LABEL,
            norm_eps: crate::NORM_EPS,
            check_consistency: false,
        }
    }
}

/// Makes a normalized model from a scalar count automaton.
pub fn make_model(counts: VectorFst<f64>, opts: &MakeOptions) -> Result<NGramModel<f64>, Error> {
    if opts.method == MakeMethod::KatzFrac {
        return Err(Error::UnknownMethod(
            "katz_frac needs histogram counts".to_string(),
        ));
    }
    let model = NGramModel::new(counts, opts.backoff_label, opts.norm_eps)?;
    Estimator::new(model, None, opts)?.estimate()
}

/// Makes a normalized model from histogram counts (fractional Katz).
pub fn make_hist_model(
    mut counts: VectorFst<HistWeight>,
    opts: &MakeOptions,
) -> Result<NGramModel<f64>, Error> {
    counts.arc_sort();
    let scalar = crate::count::to_scalar_fst(&counts);
    let model = NGramModel::new(scalar, opts.backoff_label, opts.norm_eps)?;
    Estimator::new(model, Some(&counts), opts)?.estimate()
}

struct Estimator<'a> {
    model: NGramModel<f64>,
    opts: &'a MakeOptions,
    interpolate: bool,
    /// Per-order absolute discounts, 1-based order at index order-1.
    abs_discount: Vec<f64>,
    /// Per-order, per-count Katz discount ratios (r at index r-1).
    katz_discount: Vec<Vec<f64>>,
    /// Histogram counts aligned arc-for-arc with the scalar model.
    hist: Option<&'a VectorFst<HistWeight>>,
}

impl<'a> Estimator<'a> {
    fn new(
        model: NGramModel<f64>,
        hist: Option<&'a VectorFst<HistWeight>>,
        opts: &'a MakeOptions,
    ) -> Result<Self, Error> {
        if opts.check_consistency {
            model.check_consistency()?;
        }
        let interpolate = if opts.backoff {
            false
        } else {
            opts.interpolate || opts.method.default_interpolate()
        };
        Ok(Estimator {
            model,
            opts,
            interpolate,
            abs_discount: Vec::new(),
            katz_discount: Vec::new(),
            hist,
        })
    }

    fn estimate(mut self) -> Result<NGramModel<f64>, Error> {
        if self.opts.method == MakeMethod::KneserNey {
            self.assign_kneser_ney_counts()?;
        }
        self.prepare_discounts()?;
        for state in self.model.states_by_order(true) {
            self.normalize_state(state)?;
        }
        self.model.check_normalization()?;
        Ok(self.model)
    }

    fn count_of_counts(&self) -> CountOfCounts {
        self.opts.count_of_counts.clone().unwrap_or_else(|| {
            if let Some(hist) = self.hist {
                // Rebuild the histogram view only to gather bin evidence.
                let hist_model = NGramModel::new(
                    hist.clone(),
                    self.opts.backoff_label,
                    self.opts.norm_eps,
                )
                .expect("scalar projection already validated the structure");
                CountOfCounts::from_histograms(&hist_model, self.opts.bins + 1)
            } else {
                CountOfCounts::from_counts(&self.model, self.opts.bins + 1, None)
            }
        })
    }

    fn prepare_discounts(&mut self) -> Result<(), Error> {
        let hi_order = self.model.hi_order() as usize;
        match self.opts.method {
            MakeMethod::Absolute => {
                let coc = self.count_of_counts();
                self.abs_discount = (1..=hi_order)
                    .map(|order| {
                        self.opts.discount_d.unwrap_or_else(|| {
                            coc.absolute_discount(order).unwrap_or_else(|| {
                                tracing::warn!(
                                    order,
                                    "no singleton count evidence, falling back to D = 0.5"
                                );
                                0.5
                            })
                        })
                    })
                    .collect();
            }
            MakeMethod::KneserNey => {
                // Kneser-Ney runs absolute discounting over type counts; the
                // supplied D applies to every order.
                let d = self.opts.discount_d.unwrap_or(0.5);
                self.abs_discount = vec![d; hi_order];
            }
            MakeMethod::Katz | MakeMethod::KatzFrac => {
                let coc = self.count_of_counts();
                self.katz_discount = (1..=hi_order)
                    .map(|order| katz_discounts(&coc, order, self.opts.bins))
                    .collect();
            }
            _ => {}
        }
        Ok(())
    }

    /// Discounted real-space count for one event.
    fn discounted(&self, order: usize, count_nl: f64, hist: Option<&HistWeight>) -> f64 {
        let count = if count_nl == ZERO {
            0.0
        } else {
            (-count_nl).exp()
        };
        match self.opts.method {
            MakeMethod::Unsmoothed | MakeMethod::Presmoothed => count,
            MakeMethod::WittenBell => count, // scaled per state, not per event
            MakeMethod::Absolute | MakeMethod::KneserNey => {
                (count - self.abs_discount[order - 1]).max(0.0)
            }
            MakeMethod::Katz => {
                let r = count.round();
                let discounts = &self.katz_discount[order - 1];
                if r >= 1.0 && (r as usize) <= discounts.len() {
                    count * discounts[r as usize - 1]
                } else {
                    count
                }
            }
            MakeMethod::KatzFrac => {
                let hist = hist.expect("histogram evidence supplied for katz_frac");
                let discounts = &self.katz_discount[order - 1];
                let mut expected = 0.0;
                for r in 1..crate::weight::HIST_BINS - 1 {
                    let mass = (-hist.bins[r + 1]).exp();
                    if mass <= 0.0 {
                        continue;
                    }
                    let ratio = if r <= discounts.len() {
                        discounts[r - 1]
                    } else {
                        1.0
                    };
                    expected += mass * ratio * r as f64;
                }
                expected
            }
        }
    }

    fn normalize_state(&mut self, state: StateId) -> Result<(), Error> {
        let unigram = self.model.unigram_state();
        let start = self.model.start_state();
        let order = self.model.state_order(state) as usize;
        let backoff_label = self.model.backoff_label();
        let bo = self.model.backoff_state(state);

        // Event inventory: (arc position or final, raw count). The
        // start-of-sentence arc at the unigram state is carried along but
        // excluded from the distribution.
        let arcs = self.model.fst().arcs(state);
        let mut events: Vec<(Option<usize>, f64)> = Vec::with_capacity(arcs.len() + 1);
        let mut start_arc = None;
        for (pos, arc) in arcs.iter().enumerate() {
            if arc.ilabel == backoff_label {
                continue;
            }
            if state == unigram && start != unigram && arc.nextstate == start {
                start_arc = Some((pos, arc.weight));
                continue;
            }
            events.push((Some(pos), arc.weight));
        }
        let final_nl = self.model.fst().final_weight(state).scalar();
        if final_nl != ZERO {
            events.push((None, final_nl));
        }
        if events.is_empty() {
            // Bare structural state: nothing to normalize, infinite back-off.
            if bo.is_some() {
                let pos = self
                    .model
                    .fst()
                    .find_arc_pos(state, backoff_label)
                    .expect("back-off arc present");
                self.model.set_arc_weight(state, pos, ZERO);
            }
            return Ok(());
        }

        let mut total = ZERO;
        let mut comp = 0.0;
        for &(_, count) in &events {
            total = neg_log_sum_kahan(total, count, &mut comp);
        }

        if self.opts.method == MakeMethod::Presmoothed {
            // Arcs already hold conditional probabilities.
            self.set_backoff_weight(state)?;
            return Ok(());
        }

        // The root of the suffix tree has no lower order to hand mass to,
        // so its distribution stays undiscounted.
        let discount_here = bo.is_some();

        // Witten-Bell scales every event by n / (n + K * T).
        let wb_scale = if discount_here && self.opts.method == MakeMethod::WittenBell {
            let n = (-total).exp();
            let t = events.len() as f64;
            n / (n + self.opts.witten_bell_k * t)
        } else {
            1.0
        };

        // First pass: discounted conditional probabilities.
        let mut probs: Vec<f64> = Vec::with_capacity(events.len());
        let mut hi_sum = ZERO;
        let mut hi_comp = 0.0;
        for &(pos, count) in &events {
            let discounted = if discount_here {
                let hist = self.hist.and_then(|h| {
                    pos.map(|p| &h.arcs(state)[p].weight)
                        .or_else(|| Some(h.final_weight(state)))
                });
                self.discounted(order, count, hist) * wb_scale
            } else if count == ZERO {
                0.0
            } else {
                (-count).exp()
            };
            let p_nl = if discounted > 0.0 {
                -discounted.ln() - total
            } else {
                ZERO
            };
            hi_sum = neg_log_sum_kahan(hi_sum, p_nl, &mut hi_comp);
            probs.push(p_nl);
        }

        // Interpolation folds the leftover mass times the lower-order
        // probability into each event.
        let interpolate =
            self.interpolate && self.opts.method != MakeMethod::Unsmoothed && bo.is_some();
        if interpolate {
            let bo = bo.expect("checked");
            let leftover = match neg_log_diff(ONE, hi_sum) {
                Ok(d) => d,
                Err(_) => ZERO,
            };
            for (&(pos, _), p) in events.iter().zip(probs.iter_mut()) {
                let lower = match pos {
                    Some(arc_pos) => {
                        let label = self.model.fst().arcs(state)[arc_pos].ilabel;
                        self.model.prob(bo, label).map(|(c, _)| c).unwrap_or(ZERO)
                    }
                    None => self.model.final_cost(bo),
                };
                *p = neg_log_sum(*p, leftover + lower);
            }
        }

        // Write the distribution back.
        for (&(pos, _), &p) in events.iter().zip(probs.iter()) {
            match pos {
                Some(pos) => self.model.set_arc_weight(state, pos, p),
                None => {
                    let fst = self.model.fst_mut();
                    fst.set_final(state, p);
                }
            }
        }
        if let Some((pos, count)) = start_arc {
            // Start-of-sentence mass, normalized against the same total but
            // never part of the distribution.
            self.model.set_arc_weight(state, pos, count - total);
        }
        self.set_backoff_weight(state)?;
        Ok(())
    }

    fn set_backoff_weight(&mut self, state: StateId) -> Result<(), Error> {
        let backoff_label = self.model.backoff_label();
        let Some(pos) = self.model.fst().find_arc_pos(state, backoff_label) else {
            return Ok(());
        };
        let alpha = if self.opts.method == MakeMethod::Unsmoothed {
            ZERO
        } else {
            self.model.backoff_weight_for(state)?
        };
        self.model.set_arc_weight(state, pos, alpha);
        Ok(())
    }

    /// Replaces lower-order token counts by continuation type counts,
    /// mirroring the classic two-pass schedule: ascending removal of the
    /// observed higher-order mass, then descending increments of one per
    /// continuation type with back-off totals refreshed along the way.
    fn assign_kneser_ney_counts(&mut self) -> Result<(), Error> {
        let hi_order = self.model.hi_order();
        for order in 2..=hi_order {
            for state in 0..self.model.num_states() {
                if self.model.state_order(state) == order {
                    self.update_kneser_ney_counts(state, false)?;
                }
            }
        }
        for order in (2..=hi_order).rev() {
            for state in 0..self.model.num_states() {
                if self.model.state_order(state) == order {
                    self.update_kneser_ney_counts(state, true)?;
                    self.update_total_count(state)?;
                }
            }
        }
        Ok(())
    }

    fn update_kneser_ney_counts(&mut self, state: StateId, increment: bool) -> Result<(), Error> {
        let Some(bo) = self.model.backoff_state(state) else {
            return Ok(());
        };
        let backoff_label = self.model.backoff_label();
        let arcs: Vec<(crate::Label, f64)> = self
            .model
            .fst()
            .arcs(state)
            .iter()
            .filter(|arc| arc.ilabel != backoff_label)
            .map(|arc| (arc.ilabel, arc.weight))
            .collect();
        for (label, hi_value) in arcs {
            let Some(pos) = self.model.fst().find_arc_pos(bo, label) else {
                return Err(Error::MissingSuffixNgram { state, label });
            };
            let lo_value = self.model.fst().arcs(bo)[pos].weight;
            let updated = self.calc_kneser_ney_value(increment, hi_value, lo_value)?;
            self.model.set_arc_weight(bo, pos, updated);
        }
        let final_value = self.model.fst().final_weight(state).scalar();
        if final_value != ZERO {
            let lo_value = self.model.fst().final_weight(bo).scalar();
            let updated = self.calc_kneser_ney_value(increment, final_value, lo_value)?;
            self.model.fst_mut().set_final(bo, updated);
        }
        Ok(())
    }

    /// One type is added when incrementing; when removing, the observed
    /// higher-order mass leaves the lower-order count (clamped at nothing).
    fn calc_kneser_ney_value(
        &self,
        increment: bool,
        hi_value: f64,
        lo_value: f64,
    ) -> Result<f64, Error> {
        if increment {
            return Ok(neg_log_sum(lo_value, ONE));
        }
        if lo_value < hi_value {
            let value = neg_log_diff(lo_value, hi_value)?;
            if (-value).exp() < self.opts.norm_eps {
                return Ok(ZERO);
            }
            return Ok(value);
        }
        Ok(ZERO)
    }

    fn update_total_count(&mut self, state: StateId) -> Result<(), Error> {
        let backoff_label = self.model.backoff_label();
        let mut total = self.model.fst().final_weight(state).scalar();
        let mut comp = 0.0;
        let mut bo_pos = None;
        for (pos, arc) in self.model.fst().arcs(state).iter().enumerate() {
            if arc.ilabel == backoff_label {
                bo_pos = Some(pos);
            } else {
                total = neg_log_sum_kahan(total, arc.weight, &mut comp);
            }
        }
        let pos = bo_pos.ok_or(Error::MissingBackoffArc(state))?;
        self.model.set_arc_weight(state, pos, total);
        Ok(())
    }
}

/// Katz (Good-Turing) discount ratios for counts `1..=bins`.
///
/// `d_r = (r*/r - k) / (1 - k)` with `r* = (r+1) n_{r+1} / n_r` and
/// `k = (bins+1) n_{bins+1} / n_1`. Unusable ratios (missing evidence or
/// values outside `(0, 1]`) fall back to no discount.
fn katz_discounts(coc: &CountOfCounts, order: usize, bins: usize) -> Vec<f64> {
    let n1 = coc.n(order, 1);
    let k = if n1 > 0.0 {
        (bins as f64 + 1.0) * coc.n(order, bins + 1) / n1
    } else {
        0.0
    };
    (1..=bins)
        .map(|r| {
            let nr = coc.n(order, r);
            let nr1 = coc.n(order, r + 1);
            if nr <= 0.0 || k >= 1.0 {
                return 1.0;
            }
            let r_star = (r as f64 + 1.0) * nr1 / nr;
            let d = (r_star / r as f64 - k) / (1.0 - k);
            if d <= 0.0 || d > 1.0 {
                tracing::warn!(order, r, d, "unusable Katz discount, using 1");
                1.0
            } else {
                d
            }
        })
        .collect()
}

#[cfg(test)]
mod test {
    use approx::assert_abs_diff_eq;

    use super::*;
    use crate::count::{count_sequences, to_histogram_fst, CountOptions};
    use crate::symbols::SymbolTable;

    fn symbols_ab() -> SymbolTable {
        let mut table = SymbolTable::new();
        table.add_symbol("a");
        table.add_symbol("b");
        table
    }

    /// Bigram counts for { "a b", "a a b" }: c(a)=3, c(b)=2, c(</s>)=2,
    /// c(<s> a)=2, c(a a)=1, c(a b)=2, c(b </s>)=2.
    fn counts_ab() -> VectorFst<f64> {
        count_sequences(
            vec![vec![1, 2], vec![1, 1, 2]],
            Some(&symbols_ab()),
            &CountOptions {
                order: 2,
                ..CountOptions::default()
            },
        )
        .unwrap()
    }

    fn state_of(model: &NGramModel<f64>, hist: &[crate::Label]) -> StateId {
        model
            .state_histories()
            .iter()
            .position(|h| h == hist)
            .unwrap()
    }

    fn opts(method: MakeMethod) -> MakeOptions {
        MakeOptions {
            method,
            norm_eps: 1e-6,
            ..MakeOptions::default()
        }
    }

    #[test]
    fn witten_bell_interpolated() {
        let model = make_model(counts_ab(), &opts(MakeMethod::WittenBell)).unwrap();
        model.check_normalization().unwrap();
        // At state [a]: n=3, T=2, K=1, so the discount factor is 3/5 and
        // the leftover is 2/5: p(b|a) = (2/3)(3/5) + (2/5) p(b) with the
        // unigram p(b) = 2/7.
        let a_state = state_of(&model, &[1]);
        let (p_ba, _) = model.prob(a_state, 2).unwrap();
        assert_abs_diff_eq!((-p_ba).exp(), 0.4 + 0.4 * (2.0 / 7.0), epsilon = 1e-9);
    }

    #[test]
    fn kneser_ney_uses_type_counts() {
        let model = make_model(
            counts_ab(),
            &MakeOptions {
                discount_d: Some(0.5),
                ..opts(MakeMethod::KneserNey)
            },
        )
        .unwrap();
        model.check_normalization().unwrap();
        // Type counts at the unigram state: a continues <s> and a (2),
        // b continues a (1), </s> continues b (1); so p_kn(b) = 1/4 and
        // p(b|a) = (2 - 0.5)/3 + (0.5 * 2 / 3) * (1/4).
        let a_state = state_of(&model, &[1]);
        let (p_ba, _) = model.prob(a_state, 2).unwrap();
        assert_abs_diff_eq!((-p_ba).exp(), 1.5 / 3.0 + (1.0 / 3.0) * 0.25, epsilon = 1e-9);
    }

    #[test]
    fn absolute_backoff_normalizes() {
        let model = make_model(
            counts_ab(),
            &MakeOptions {
                discount_d: Some(0.5),
                ..opts(MakeMethod::Absolute)
            },
        )
        .unwrap();
        model.check_normalization().unwrap();
        // Pure back-off: p(b|a) = (2 - 0.5)/3 with no lower-order term.
        let a_state = state_of(&model, &[1]);
        let (p_ba, _) = model.prob(a_state, 2).unwrap();
        assert_abs_diff_eq!((-p_ba).exp(), 0.5, epsilon = 1e-9);
        // Unseen event routes through the back-off weight.
        let alpha = (-model.backoff_cost(a_state).unwrap()).exp();
        assert!(alpha > 0.0);
    }

    #[test]
    fn katz_discounts_shape() {
        let model = make_model(counts_ab(), &opts(MakeMethod::Katz)).unwrap();
        model.check_normalization().unwrap();
    }

    #[test]
    fn unsmoothed_assigns_infinite_backoff() {
        let model = make_model(counts_ab(), &opts(MakeMethod::Unsmoothed)).unwrap();
        model.check_normalization().unwrap();
        let a_state = state_of(&model, &[1]);
        assert_eq!(model.backoff_cost(a_state), Some(ZERO));
        let (p_ba, _) = model.prob(a_state, 2).unwrap();
        assert_abs_diff_eq!((-p_ba).exp(), 2.0 / 3.0, epsilon = 1e-12);
    }

    #[test]
    fn presmoothed_recomputes_backoff_only() {
        // Feed an already-made model back through the presmoothed path.
        let made = make_model(counts_ab(), &opts(MakeMethod::WittenBell)).unwrap();
        let again = make_model(made.into_fst(), &opts(MakeMethod::Presmoothed)).unwrap();
        again.check_normalization().unwrap();
    }

    #[test]
    fn katz_frac_over_histograms() {
        let hist = to_histogram_fst(&counts_ab());
        let model = make_hist_model(hist, &opts(MakeMethod::KatzFrac)).unwrap();
        model.check_normalization().unwrap();
        // Integer evidence: fractional Katz must agree with plain Katz.
        let plain = make_model(counts_ab(), &opts(MakeMethod::Katz)).unwrap();
        let a_state = state_of(&model, &[1]);
        let a_plain = state_of(&plain, &[1]);
        assert_abs_diff_eq!(
            model.prob(a_state, 2).unwrap().0,
            plain.prob(a_plain, 2).unwrap().0,
            epsilon = 1e-9
        );
    }

    #[test]
    fn method_strings_parse() {
        assert_eq!(
            MakeMethod::from_str("kneser_ney").unwrap(),
            MakeMethod::KneserNey
        );
        assert!(matches!(
            MakeMethod::from_str("bogus"),
            Err(Error::UnknownMethod(_))
        ));
    }
}
