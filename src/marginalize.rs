//! Marginalization constraints on back-off models.
//!
//! Imposes, for every lower-order history h' and label a,
//! `P(a|h') = sum_h P(h|h') P(a|h)` over the histories h that back off to
//! h'. Lower-order distributions are re-derived from their extensions by an
//! iterated fixed point; back-off weights are refit after every sweep and
//! convergence is declared when none of them moves by more than `norm_eps`.

use crate::model::NGramModel;
use crate::weight::{neg_log_diff, neg_log_sum_kahan, ZERO};
use crate::{Error, StateId};

#[derive(Debug, Clone)]
pub struct MarginalizeOptions {
    /// Cap on outer iterations before giving up.
    pub max_bo_updates: usize,
    pub check_consistency: bool,
}

impl Default for MarginalizeOptions {
    fn default() -> Self {
        MarginalizeOptions {
            max_bo_updates: 10,
            check_consistency: false,
        }
    }
}

pub fn marginalize_model(
    mut model: NGramModel<f64>,
    opts: &MarginalizeOptions,
) -> Result<NGramModel<f64>, Error> {
    if opts.check_consistency {
        model.check_consistency()?;
    }
    let n = model.num_states();
    let mut bo_children: Vec<Vec<StateId>> = vec![Vec::new(); n];
    for state in 0..n {
        if let Some(bo) = model.backoff_state(state) {
            bo_children[bo].push(state);
        }
    }

    for iteration in 0..opts.max_bo_updates {
        let before: Vec<Option<f64>> = (0..n).map(|s| model.backoff_cost(s)).collect();
        let probs = model.state_probs();
        for state in model.states_by_order(true) {
            if bo_children[state].is_empty() {
                continue;
            }
            update_state(&mut model, state, &bo_children[state], &probs)?;
        }
        model.recalc_backoff()?;
        let delta = (0..n)
            .filter_map(|s| match (before[s], model.backoff_cost(s)) {
                (Some(a), Some(b)) if a != ZERO && b != ZERO => Some((a - b).abs()),
                _ => None,
            })
            .fold(0.0f64, f64::max);
        tracing::debug!(iteration, delta, "marginalization sweep");
        if delta < model.norm_eps() {
            model.check_normalization()?;
            return Ok(model);
        }
    }
    Err(Error::MarginalizeDiverged(opts.max_bo_updates))
}

/// Re-derives the distribution at `state` from the states backing off to
/// it. For an event a:
///
/// `p(a|s) = sum_{t: a explicit} P(t) p(a|t) / (N - sum_{t: a implicit} P(t) alpha(t))`
///
/// which is the fixed-point solution of the marginal constraint with the
/// implicit (backed-off) occurrences of a folded out of the denominator.
fn update_state(
    model: &mut NGramModel<f64>,
    state: StateId,
    children: &[StateId],
    probs: &[f64],
) -> Result<(), Error> {
    let backoff_label = model.backoff_label();
    let unigram = model.unigram_state();
    let start = model.start_state();

    let mut mass = ZERO; // N = sum of child state probabilities
    let mut mass_comp = 0.0;
    for &child in children {
        let p = probs[child];
        if p > 0.0 {
            mass = neg_log_sum_kahan(mass, -p.ln(), &mut mass_comp);
        }
    }
    if mass == ZERO {
        return Ok(());
    }

    // (event position or final, new weight)
    let mut updates: Vec<(Option<usize>, f64)> = Vec::new();
    let arcs: Vec<(usize, crate::Label)> = model
        .fst()
        .arcs(state)
        .iter()
        .enumerate()
        .filter(|(_, arc)| arc.ilabel != backoff_label)
        .filter(|(_, arc)| !(state == unigram && start != unigram && arc.nextstate == start))
        .map(|(pos, arc)| (pos, arc.ilabel))
        .collect();

    for (pos, label) in arcs {
        let (explicit, implicit) = child_sums(model, children, probs, Event::Label(label));
        if let Some(weight) = solve(mass, explicit, implicit)? {
            updates.push((Some(pos), weight));
        }
    }
    if model.fst().is_final(state) {
        let (explicit, implicit) = child_sums(model, children, probs, Event::Stop);
        if let Some(weight) = solve(mass, explicit, implicit)? {
            updates.push((None, weight));
        }
    }

    for (pos, weight) in updates {
        match pos {
            Some(pos) => model.set_arc_weight(state, pos, weight),
            None => model.fst_mut().set_final(state, weight),
        }
    }
    Ok(())
}

enum Event {
    Label(crate::Label),
    Stop,
}

/// Sums child evidence for one event: the explicit part
/// `sum P(t) p(a|t)` over children carrying the event themselves, and the
/// implicit part `sum P(t) alpha(t)` over children that would back off.
fn child_sums(
    model: &NGramModel<f64>,
    children: &[StateId],
    probs: &[f64],
    event: Event,
) -> (f64, f64) {
    let mut explicit = ZERO;
    let mut explicit_comp = 0.0;
    let mut implicit = ZERO;
    let mut implicit_comp = 0.0;
    for &child in children {
        if probs[child] <= 0.0 {
            continue;
        }
        let p_child = -probs[child].ln();
        let own = match event {
            Event::Label(label) => model
                .fst()
                .find_arc(child, label)
                .filter(|arc| arc.ilabel != model.backoff_label())
                .map(|arc| arc.weight),
            Event::Stop => {
                let w = model.fst().final_weight(child);
                if *w == ZERO {
                    None
                } else {
                    Some(*w)
                }
            }
        };
        match own {
            Some(weight) => {
                explicit = neg_log_sum_kahan(explicit, p_child + weight, &mut explicit_comp);
            }
            None => {
                let alpha = model.backoff_cost(child).unwrap_or(ZERO);
                implicit = neg_log_sum_kahan(implicit, p_child + alpha, &mut implicit_comp);
            }
        }
    }
    (explicit, implicit)
}

fn solve(mass: f64, explicit: f64, implicit: f64) -> Result<Option<f64>, Error> {
    if explicit == ZERO {
        // No child carries the event explicitly; leave the weight alone.
        return Ok(None);
    }
    let denominator = match neg_log_diff(mass, implicit) {
        Ok(d) => d,
        Err(_) => return Ok(None), // implicit mass swamps N within rounding
    };
    if denominator == ZERO {
        return Ok(None);
    }
    Ok(Some(explicit - denominator))
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::count::{count_sequences, CountOptions};
    use crate::make::{make_model, MakeMethod, MakeOptions};
    use crate::symbols::SymbolTable;

    fn model() -> NGramModel<f64> {
        let mut table = SymbolTable::new();
        for word in ["a", "b", "c"] {
            table.add_symbol(word);
        }
        let counts = count_sequences(
            vec![vec![1, 2, 3], vec![1, 2], vec![2, 3, 1], vec![3]],
            Some(&table),
            &CountOptions {
                order: 2,
                ..CountOptions::default()
            },
        )
        .unwrap();
        make_model(
            counts,
            &MakeOptions {
                method: MakeMethod::WittenBell,
                ..MakeOptions::default()
            },
        )
        .unwrap()
    }

    #[test]
    fn converges_and_stays_normalized() {
        let marginalized =
            marginalize_model(model(), &MarginalizeOptions::default()).unwrap();
        marginalized.check_normalization().unwrap();
    }

    #[test]
    fn fixed_point_satisfies_the_constraint() {
        let m = marginalize_model(model(), &MarginalizeOptions::default()).unwrap();
        let probs = m.state_probs();
        let uni = m.unigram_state();
        let start = m.start_state();
        let children: Vec<StateId> = m
            .fst()
            .states()
            .filter(|&s| m.backoff_state(s) == Some(uni))
            .collect();
        let n: f64 = children.iter().map(|&c| probs[c]).sum();
        for arc in m.fst().arcs(uni) {
            if arc.ilabel == 0 || arc.nextstate == start {
                continue;
            }
            let marginal: f64 = children
                .iter()
                .map(|&c| {
                    let p = m.prob(c, arc.ilabel).map(|(w, _)| (-w).exp()).unwrap_or(0.0);
                    probs[c] / n * p
                })
                .sum();
            let diff = ((-arc.weight).exp() - marginal).abs();
            assert!(diff < 1e-3, "marginal violated by {diff}");
        }
    }

    #[test]
    fn iteration_cap_is_enforced() {
        let result = marginalize_model(
            model(),
            &MarginalizeOptions {
                max_bo_updates: 0,
                ..MarginalizeOptions::default()
            },
        );
        assert!(matches!(result, Err(Error::MarginalizeDiverged(0))));
    }
}
