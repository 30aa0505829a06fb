//! Textual output and model evaluation: plain and ARPA printing,
//! sentence scoring, perplexity reports, random sentence generation.

use std::io::Write;

use itertools::Itertools;

use crate::model::NGramModel;
use crate::weight::{Weight, ZERO};
use crate::{Error, Label};

const LN10: f64 = std::f64::consts::LN_10;

/// How back-off transitions appear in printed output.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ShowBackoff {
    #[default]
    None,
    /// Print back-off arcs as explicit epsilon lines.
    Epsilon,
    /// Append the back-off weight as a third column on state lines.
    Inline,
}

#[derive(Debug, Clone, Default)]
pub struct PrintOptions {
    /// Emit the ARPA format instead of plain n-gram lines.
    pub arpa: bool,
    pub show_backoff: ShowBackoff,
    /// Print stored negated logs instead of log probabilities.
    pub negative_logs: bool,
    /// Print values as integer-rounded counts.
    pub integers: bool,
}

struct NGramLine {
    words: Vec<String>,
    order: u32,
    weight: f64,
    backoff: Option<f64>,
}

/// Collects every n-gram of the model as a printable line, sorted by order
/// and word sequence.
fn gather_lines<W: Weight>(model: &NGramModel<W>) -> Vec<NGramLine> {
    let fst = model.fst();
    let histories = model.state_histories();
    let word = |label: Label| -> String {
        fst.symbols()
            .and_then(|s| s.key(label))
            .map(str::to_string)
            .unwrap_or_else(|| label.to_string())
    };
    let mut lines = Vec::new();
    for state in fst.states() {
        let mut prefix: Vec<String> = histories[state].iter().rev().map(|&l| word(l)).collect();
        for arc in fst.arcs(state) {
            if arc.ilabel == model.backoff_label() {
                continue;
            }
            let mut words = prefix.clone();
            words.push(word(arc.ilabel));
            // A back-off weight belongs to n-grams that are themselves
            // states of the model.
            let backoff = if model.state_order(arc.nextstate) == model.state_order(state) + 1 {
                model.backoff_cost(arc.nextstate)
            } else {
                None
            };
            lines.push(NGramLine {
                words,
                order: model.state_order(state),
                weight: arc.weight.scalar(),
                backoff,
            });
        }
        if fst.is_final(state) {
            prefix.push(crate::symbols::END_SYMBOL.to_string());
            lines.push(NGramLine {
                words: prefix,
                order: model.state_order(state),
                weight: fst.final_weight(state).scalar(),
                backoff: None,
            });
        }
    }
    lines.sort_by(|a, b| a.order.cmp(&b.order).then_with(|| a.words.cmp(&b.words)));
    lines
}

/// Prints the model as plain n-gram lines: `w1 ... wn<TAB>value` with the
/// back-off weight inlined or shown as epsilon lines per the options.
pub fn print_model<W: Weight, Out: Write>(
    model: &NGramModel<W>,
    writer: &mut Out,
    opts: &PrintOptions,
) -> Result<(), Error> {
    if opts.arpa {
        return print_arpa(model, writer);
    }
    let value = |weight: f64| -> String {
        if opts.integers {
            format!("{}", (-weight).exp().round() as i64)
        } else if opts.negative_logs {
            format!("{weight}")
        } else {
            format!("{}", -weight)
        }
    };
    for line in gather_lines(model) {
        write!(writer, "{}\t{}", line.words.iter().join(" "), value(line.weight))?;
        if opts.show_backoff == ShowBackoff::Inline {
            if let Some(alpha) = line.backoff {
                write!(writer, "\t{}", value(alpha))?;
            }
        }
        writeln!(writer)?;
    }
    if opts.show_backoff == ShowBackoff::Epsilon {
        let histories = model.state_histories();
        for state in model.fst().states() {
            if let Some(alpha) = model.backoff_cost(state) {
                let words: Vec<String> = histories[state]
                    .iter()
                    .rev()
                    .map(|&l| {
                        model
                            .fst()
                            .symbols()
                            .and_then(|s| s.key(l))
                            .map(str::to_string)
                            .unwrap_or_else(|| l.to_string())
                    })
                    .collect();
                writeln!(
                    writer,
                    "{} {}\t{}",
                    words.iter().join(" "),
                    crate::symbols::EPSILON_SYMBOL,
                    value(alpha)
                )?;
            }
        }
    }
    Ok(())
}

/// Prints the model in the ARPA format: base-10 logs, per-order sections,
/// back-off weights on the lines of n-grams that are states.
pub fn print_arpa<W: Weight, Out: Write>(
    model: &NGramModel<W>,
    writer: &mut Out,
) -> Result<(), Error> {
    let lines = gather_lines(model);
    writeln!(writer, "\\data\\")?;
    for order in 1..=model.hi_order() {
        let count = lines.iter().filter(|l| l.order == order).count();
        writeln!(writer, "ngram {order}={count}")?;
    }
    for order in 1..=model.hi_order() {
        writeln!(writer)?;
        writeln!(writer, "\\{order}-grams:")?;
        for line in lines.iter().filter(|l| l.order == order) {
            write!(
                writer,
                "{:.6}\t{}",
                -line.weight / LN10,
                line.words.iter().join(" ")
            )?;
            if let Some(alpha) = line.backoff {
                write!(writer, "\t{:.6}", -alpha / LN10)?;
            }
            writeln!(writer)?;
        }
    }
    writeln!(writer)?;
    writeln!(writer, "\\end\\")?;
    Ok(())
}

#[derive(Debug, Clone)]
pub struct ApplyOptions {
    /// Probability mass of the OOV class; OOVs are skipped when unset.
    pub oov_probability: Option<f64>,
    /// Number of words in the OOV class sharing the mass.
    pub oov_class_size: f64,
}

impl Default for ApplyOptions {
    fn default() -> Self {
        ApplyOptions {
            oov_probability: None,
            oov_class_size: 10000.0,
        }
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct SentenceScore {
    /// Base-10 log probability of the sentence including the stop event.
    pub log10_prob: f64,
    pub words: usize,
    pub oovs: usize,
}

/// Scores one sentence against the model, walking states with back-off.
pub fn score_sentence(
    model: &NGramModel<f64>,
    labels: &[Label],
    opts: &ApplyOptions,
) -> SentenceScore {
    let mut state = model.start_state();
    let mut score = SentenceScore::default();
    for &label in labels {
        score.words += 1;
        match model.prob(state, label) {
            Some((cost, next)) => {
                score.log10_prob -= cost / LN10;
                state = next;
            }
            None => {
                score.oovs += 1;
                if let Some(p) = opts.oov_probability {
                    score.log10_prob += (p / opts.oov_class_size).log10();
                }
                state = model.unigram_state();
            }
        }
    }
    score.log10_prob -= model.final_cost(state) / LN10;
    score
}

#[derive(Debug, Clone, Default)]
pub struct PerplexityReport {
    pub sentences: usize,
    pub words: usize,
    pub oovs: usize,
    pub log10_prob: f64,
}

impl PerplexityReport {
    /// `10 ^ (-logprob / N)` with one stop event per sentence and OOVs
    /// excluded from the event count when they carry no probability.
    pub fn perplexity(&self, oovs_scored: bool) -> f64 {
        let mut events = self.words + self.sentences;
        if !oovs_scored {
            events -= self.oovs;
        }
        if events == 0 {
            return f64::INFINITY;
        }
        10f64.powf(-self.log10_prob / events as f64)
    }
}

impl std::fmt::Display for PerplexityReport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        writeln!(
            f,
            "{} sentences, {} words, {} OOVs",
            self.sentences, self.words, self.oovs
        )?;
        write!(
            f,
            "logprob(base 10)= {:.5};  perplexity = {:.4}",
            self.log10_prob,
            self.perplexity(false)
        )
    }
}

/// Scores a whole corpus and accumulates the perplexity report.
pub fn perplexity<'a, I>(
    model: &NGramModel<f64>,
    sequences: I,
    opts: &ApplyOptions,
) -> PerplexityReport
where
    I: IntoIterator<Item = &'a Vec<Label>>,
{
    let mut report = PerplexityReport::default();
    for sequence in sequences {
        let score = score_sentence(model, sequence, opts);
        report.sentences += 1;
        report.words += score.words;
        report.oovs += score.oovs;
        report.log10_prob += score.log10_prob;
    }
    report
}

#[derive(Debug, Clone)]
pub struct RandGenOptions {
    pub max_length: usize,
    pub max_sents: usize,
    pub seed: u64,
}

impl Default for RandGenOptions {
    fn default() -> Self {
        RandGenOptions {
            max_length: 512,
            max_sents: 1,
            seed: 0x5eed,
        }
    }
}

/// Generates random sentences by sampling arcs proportionally to their
/// probabilities, taking the back-off arc as a silent transition and the
/// final weight as the stop event.
pub fn random_sentences(
    model: &NGramModel<f64>,
    opts: &RandGenOptions,
) -> Result<Vec<Vec<Label>>, Error> {
    let mut rng = XorShift64(opts.seed.max(1));
    let mut sentences = Vec::with_capacity(opts.max_sents);
    for _ in 0..opts.max_sents {
        sentences.push(random_sentence(model, opts.max_length, &mut rng));
    }
    Ok(sentences)
}

fn random_sentence(
    model: &NGramModel<f64>,
    max_length: usize,
    rng: &mut XorShift64,
) -> Vec<Label> {
    let unigram = model.unigram_state();
    let start = model.start_state();
    let mut state = start;
    let mut sentence = Vec::new();
    while sentence.len() < max_length {
        let mut candidates: Vec<(Option<&crate::fst::Arc<f64>>, f64)> = Vec::new();
        let mut total = 0.0;
        for arc in model.fst().arcs(state) {
            // Never emit the start-of-sentence transition.
            if state == unigram && start != unigram && arc.nextstate == start {
                continue;
            }
            let p = (-arc.weight).exp();
            if p > 0.0 {
                candidates.push((Some(arc), p));
                total += p;
            }
        }
        let final_weight = *model.fst().final_weight(state);
        if final_weight != ZERO {
            candidates.push((None, (-final_weight).exp()));
            total += (-final_weight).exp();
        }
        if total <= 0.0 {
            break;
        }
        let mut draw = rng.next_f64() * total;
        let mut chosen = None;
        for (arc, p) in &candidates {
            draw -= p;
            if draw <= 0.0 {
                chosen = Some(*arc);
                break;
            }
        }
        match chosen {
            Some(Some(arc)) if arc.ilabel == model.backoff_label() => {
                state = arc.nextstate; // silent back-off
            }
            Some(Some(arc)) => {
                sentence.push(arc.ilabel);
                state = arc.nextstate;
            }
            _ => break, // stop event
        }
    }
    sentence
}

/// Plain xorshift64* generator; seeded, deterministic across platforms.
struct XorShift64(u64);

impl XorShift64 {
    fn next_u64(&mut self) -> u64 {
        let mut x = self.0;
        x ^= x << 13;
        x ^= x >> 7;
        x ^= x << 17;
        self.0 = x;
        x.wrapping_mul(0x2545F4914F6CDD1D)
    }

    fn next_f64(&mut self) -> f64 {
        (self.next_u64() >> 11) as f64 / (1u64 << 53) as f64
    }
}

#[cfg(test)]
mod test {
    use approx::assert_abs_diff_eq;

    use super::*;
    use crate::count::{count_sequences, CountOptions};
    use crate::input::{read_arpa, ReadOptions};
    use crate::make::{make_model, MakeMethod, MakeOptions};
    use crate::symbols::SymbolTable;

    fn model() -> NGramModel<f64> {
        let mut table = SymbolTable::new();
        table.add_symbol("a");
        table.add_symbol("b");
        let counts = count_sequences(
            vec![vec![1, 2], vec![1, 1, 2]],
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
                norm_eps: 1e-6,
                ..MakeOptions::default()
            },
        )
        .unwrap()
    }

    #[test]
    fn plain_print_lists_every_ngram() {
        let model = model();
        let mut buf = Vec::new();
        print_model(&model, &mut buf, &PrintOptions::default()).unwrap();
        let text = String::from_utf8(buf).unwrap();
        let lines: Vec<&str> = text.lines().collect();
        assert_eq!(lines.len(), model.num_ngrams());
        assert!(lines.iter().any(|l| l.starts_with("a b\t")));
        assert!(lines.iter().any(|l| l.starts_with("b </s>\t")));
    }

    #[test]
    fn integer_print_recovers_counts() {
        let mut table = SymbolTable::new();
        table.add_symbol("a");
        table.add_symbol("b");
        let counts = count_sequences(
            vec![vec![1, 2], vec![1, 1, 2]],
            Some(&table),
            &CountOptions {
                order: 2,
                ..CountOptions::default()
            },
        )
        .unwrap();
        let model = NGramModel::new(counts, 0, crate::NORM_EPS).unwrap();
        let mut buf = Vec::new();
        print_model(
            &model,
            &mut buf,
            &PrintOptions {
                integers: true,
                ..PrintOptions::default()
            },
        )
        .unwrap();
        let text = String::from_utf8(buf).unwrap();
        assert!(text.lines().any(|l| l == "a\t3"));
        assert!(text.lines().any(|l| l == "a b\t2"));
        assert!(text.lines().any(|l| l == "b </s>\t2"));
    }

    #[test]
    fn printed_counts_read_back_identically() {
        let mut table = SymbolTable::new();
        table.add_symbol("a");
        table.add_symbol("b");
        let counts = count_sequences(
            vec![vec![1, 2], vec![1, 1, 2]],
            Some(&table),
            &CountOptions {
                order: 2,
                ..CountOptions::default()
            },
        )
        .unwrap();
        let model = NGramModel::new(counts, 0, crate::NORM_EPS).unwrap();
        let mut buf = Vec::new();
        print_model(
            &model,
            &mut buf,
            &PrintOptions {
                integers: true,
                ..PrintOptions::default()
            },
        )
        .unwrap();

        let fst = crate::input::read_counts(buf.as_slice(), &ReadOptions::default()).unwrap();
        let back = NGramModel::new(fst, 0, crate::NORM_EPS).unwrap();
        assert_eq!(back.num_ngrams(), model.num_ngrams());
        let hist_a = model.state_histories();
        let words = |h: &[Label]| -> Vec<String> {
            h.iter()
                .map(|&l| {
                    model
                        .fst()
                        .symbols()
                        .unwrap()
                        .key(l)
                        .unwrap()
                        .to_string()
                })
                .collect()
        };
        let hist_b: Vec<Vec<String>> = back
            .state_histories()
            .iter()
            .map(|h| {
                h.iter()
                    .map(|&l| back.fst().symbols().unwrap().key(l).unwrap().to_string())
                    .collect()
            })
            .collect();
        for state in model.fst().states() {
            let matching = hist_b
                .iter()
                .position(|h| h == &words(&hist_a[state]))
                .expect("history preserved");
            for arc in model.fst().arcs(state) {
                if arc.ilabel == 0 {
                    continue;
                }
                let word = model.fst().symbols().unwrap().key(arc.ilabel).unwrap();
                let label = back.fst().symbols().unwrap().find(word).unwrap();
                let other = back.fst().find_arc(matching, label).unwrap();
                assert_abs_diff_eq!(arc.weight, other.weight, epsilon = 1e-9);
            }
        }
    }

    #[test]
    fn arpa_round_trip_preserves_weights() {
        let model = model();
        let mut buf = Vec::new();
        print_arpa(&model, &mut buf).unwrap();
        let text = String::from_utf8(buf.clone()).unwrap();

        let fst = read_arpa(text.as_bytes(), &ReadOptions::default()).unwrap();
        let back = NGramModel::new(fst, 0, crate::NORM_EPS).unwrap();
        let mut buf2 = Vec::new();
        print_arpa(&back, &mut buf2).unwrap();
        assert_eq!(buf, buf2);
    }

    #[test]
    fn perplexity_of_training_corpus_is_finite() {
        let model = model();
        let corpus = vec![vec![1, 2], vec![1, 1, 2]];
        let report = perplexity(&model, &corpus, &ApplyOptions::default());
        assert_eq!(report.sentences, 2);
        assert_eq!(report.words, 5);
        assert_eq!(report.oovs, 0);
        let ppl = report.perplexity(false);
        assert!(ppl.is_finite() && ppl > 1.0);
    }

    #[test]
    fn scoring_matches_manual_walk() {
        let model = model();
        let score = score_sentence(&model, &[1, 2], &ApplyOptions::default());
        let start = model.start_state();
        let (c1, s1) = model.prob(start, 1).unwrap();
        let (c2, s2) = model.prob(s1, 2).unwrap();
        let expected = -(c1 + c2 + model.final_cost(s2)) / LN10;
        assert_abs_diff_eq!(score.log10_prob, expected, epsilon = 1e-12);
    }

    #[test]
    fn oovs_are_counted() {
        let model = model();
        let score = score_sentence(&model, &[1, 99, 2], &ApplyOptions::default());
        assert_eq!(score.oovs, 1);
        assert_eq!(score.words, 3);
    }

    #[test]
    fn randgen_is_deterministic_and_in_vocabulary() {
        let model = model();
        let opts = RandGenOptions {
            max_sents: 5,
            seed: 42,
            ..RandGenOptions::default()
        };
        let a = random_sentences(&model, &opts).unwrap();
        let b = random_sentences(&model, &opts).unwrap();
        assert_eq!(a, b);
        assert_eq!(a.len(), 5);
        for sentence in &a {
            for &label in sentence {
                assert!(label == 1 || label == 2, "unexpected label {label}");
            }
        }
    }
}
