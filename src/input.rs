//! Text readers: ARPA models, sorted count files, and corpora.
//!
//! The readers consume any [`BufRead`] and produce automata in the model
//! format of this crate. ARPA compilation goes through the count trie:
//! n-grams land in an [`NGramCounter`], the emitted automaton gets the
//! parsed back-off weights, and probability holes left by unlisted suffix
//! n-grams are filled by backing off.

use std::io::BufRead;

use crate::count::NGramCounter;
use crate::fst::VectorFst;
use crate::model::NGramModel;
use crate::symbols::{SymbolTable, END_SYMBOL, EPSILON_SYMBOL, OOV_SYMBOL, START_SYMBOL};
use crate::weight::{neg_log_sum_kahan, Weight, ZERO};
use crate::{Error, Label};

const LN10: f64 = std::f64::consts::LN_10;

#[derive(thiserror::Error, Debug)]
pub enum TextReadError {
    #[error("the \\data\\ header is missing")]
    DataHeaderMissing,
    #[error("an n-gram count line in the \\data\\ section could not be parsed")]
    CountsBroken,
    #[error("no n-gram counts found in the \\data\\ section")]
    CountsMissing,
    #[error("section header mismatch: got {got:?}, expected {expected:?}")]
    SectionHeaderMismatch { got: String, expected: String },
    #[error("malformed n-gram line: {0:?}")]
    BadNgramLine(String),
    #[error("a blank line is expected between sections")]
    SectionBoundaryMissing,
    #[error("a back-off weight is attached to an n-gram that has no state")]
    StrayBackoffWeight,
    #[error("the stop symbol occurred inside an n-gram prefix")]
    StopSymbolInPrefix,
    #[error("no probability for {0:?} can be derived from any lower order")]
    NoLowerOrderProb(String),
    #[error("unexpected end of input")]
    UnexpectedEof,
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

/// Options shared by the text readers.
#[derive(Debug, Clone)]
pub struct ReadOptions {
    /// Fixed symbol table; words are collected from the input when absent.
    pub symbols: Option<SymbolTable>,
    pub epsilon_symbol: String,
    pub oov_symbol: String,
    pub start_symbol: String,
    pub end_symbol: String,
    /// Renormalize an ARPA model that is not self-consistent.
    pub renormalize_arpa: bool,
    pub norm_eps: f64,
}

impl Default for ReadOptions {
    fn default() -> Self {
        ReadOptions {
            symbols: None,
            epsilon_symbol: EPSILON_SYMBOL.to_string(),
            oov_symbol: OOV_SYMBOL.to_string(),
            start_symbol: START_SYMBOL.to_string(),
            end_symbol: END_SYMBOL.to_string(),
            renormalize_arpa: false,
            norm_eps: crate::NORM_EPS,
        }
    }
}

enum Token {
    Start,
    End,
    Word(Label),
}

/// Symbol handling for the readers: fixed tables map unknown words to the
/// OOV class, growing tables collect them.
struct Lexicon {
    table: SymbolTable,
    grow: bool,
    oov_symbol: String,
    start_symbol: String,
    end_symbol: String,
}

impl Lexicon {
    fn new(opts: &ReadOptions) -> Self {
        let (table, grow) = match &opts.symbols {
            Some(table) => (table.clone(), false),
            None => (SymbolTable::with_epsilon(&opts.epsilon_symbol), true),
        };
        Lexicon {
            table,
            grow,
            oov_symbol: opts.oov_symbol.clone(),
            start_symbol: opts.start_symbol.clone(),
            end_symbol: opts.end_symbol.clone(),
        }
    }

    fn token(&mut self, word: &str) -> Result<Token, Error> {
        if word == self.start_symbol {
            return Ok(Token::Start);
        }
        if word == self.end_symbol {
            return Ok(Token::End);
        }
        Ok(Token::Word(self.label(word)?))
    }

    fn label(&mut self, word: &str) -> Result<Label, Error> {
        if let Some(label) = self.table.find(word) {
            return Ok(label);
        }
        if self.grow {
            return Ok(self.table.add_symbol(word));
        }
        self.table
            .find(&self.oov_symbol)
            .ok_or_else(|| Error::OovSymbolMissing(word.to_string()))
    }
}

/// Compiles a textual ARPA model into the cyclic automaton form.
pub fn read_arpa<R: BufRead>(reader: R, opts: &ReadOptions) -> Result<VectorFst<f64>, Error> {
    let mut lines = reader.lines();
    let counts = read_arpa_header(&mut lines)?;
    let order = counts.len();

    let mut lexicon = Lexicon::new(opts);
    let mut counter = NGramCounter::new(order);
    // Parsed back-off weights per counter state.
    let mut boweights: Vec<Option<f64>> = Vec::new();

    for (section, &cardinality) in counts.iter().enumerate() {
        let expected = format!("\\{}-grams:", section + 1);
        let header = next_line(&mut lines)?;
        if header.trim() != expected {
            return Err(TextReadError::SectionHeaderMismatch {
                got: header,
                expected,
            }
            .into());
        }
        for _ in 0..cardinality {
            let line = next_line(&mut lines)?;
            read_arpa_ngram(
                &line,
                section,
                order,
                &mut lexicon,
                &mut counter,
                &mut boweights,
            )?;
        }
        let boundary = next_line(&mut lines)?;
        if !boundary.trim().is_empty() {
            return Err(TextReadError::SectionBoundaryMissing.into());
        }
    }
    let trailer = next_line(&mut lines)?;
    if trailer.trim() != "\\end\\" {
        return Err(TextReadError::SectionHeaderMismatch {
            got: trailer,
            expected: "\\end\\".to_string(),
        }
        .into());
    }

    let start_label = lexicon.table.add_symbol(&lexicon.start_symbol);
    lexicon.table.add_symbol(&lexicon.end_symbol);
    let mut fst = counter.get_fst(start_label, false);

    // The emitted back-off arcs carry count totals; an ARPA model defines
    // the weights explicitly (missing third column means log alpha = 0).
    for state in fst.states() {
        let Some(pos) = fst.find_arc_pos(state, 0) else { continue };
        let alpha = boweights
            .get(state)
            .copied()
            .flatten()
            .unwrap_or(crate::weight::ONE);
        fst.arcs_mut(state)[pos].weight = alpha;
    }

    fst.set_symbols(Some(lexicon.table));
    let mut model = NGramModel::new(fst, 0, opts.norm_eps)?;
    fill_arpa_holes(&mut model)?;
    if opts.renormalize_arpa {
        renormalize_arpa_model(&mut model)?;
    }
    let mut fst = model.into_fst();
    fst.connect();
    Ok(fst)
}

fn read_arpa_header(
    lines: &mut std::io::Lines<impl BufRead>,
) -> Result<Vec<usize>, TextReadError> {
    loop {
        match lines.next().transpose()? {
            Some(line) if line.trim() == "\\data\\" => break,
            Some(_) => continue,
            None => return Err(TextReadError::DataHeaderMissing),
        }
    }
    let mut counts = Vec::new();
    while let Some(line) = lines.next().transpose()? {
        if line.trim().is_empty() {
            break;
        }
        let Some(suffix) = line.trim().strip_prefix("ngram ") else {
            return Err(TextReadError::CountsBroken);
        };
        let mut pieces = suffix.split('=');
        let order: usize = pieces
            .next()
            .and_then(|v| v.trim().parse().ok())
            .ok_or(TextReadError::CountsBroken)?;
        let cardinality: usize = pieces
            .next()
            .and_then(|v| v.trim().parse().ok())
            .ok_or(TextReadError::CountsBroken)?;
        if order != counts.len() + 1 {
            return Err(TextReadError::CountsBroken);
        }
        counts.push(cardinality);
    }
    if counts.is_empty() {
        return Err(TextReadError::CountsMissing);
    }
    Ok(counts)
}

/// One `logP word... [log alpha]` line of the given (0-based) section.
fn read_arpa_ngram(
    line: &str,
    section: usize,
    order: usize,
    lexicon: &mut Lexicon,
    counter: &mut NGramCounter,
    boweights: &mut Vec<Option<f64>>,
) -> Result<(), Error> {
    let bad = || TextReadError::BadNgramLine(line.to_string());
    let tokens: Vec<&str> = line.split_whitespace().collect();
    let ngram_len = section + 1;
    if tokens.len() < ngram_len + 1 || tokens.len() > ngram_len + 2 {
        return Err(bad().into());
    }
    let log_prob: f64 = tokens[0].parse().map_err(|_| bad())?;
    let weight = -log_prob * LN10;
    let backoff: Option<f64> = if tokens.len() == ngram_len + 2 {
        Some(-tokens[ngram_len + 1].parse::<f64>().map_err(|_| bad())? * LN10)
    } else {
        None
    };

    // Walk the history prefix to its state.
    let mut state = counter.ngram_unigram_state();
    for token in &tokens[1..ngram_len] {
        state = match lexicon.token(token)? {
            Token::Start => counter.ngram_start_state(),
            Token::End => return Err(TextReadError::StopSymbolInPrefix.into()),
            Token::Word(label) => {
                let arc = counter.find_arc(state, label);
                counter.ngram_next_state(arc)
            }
        };
    }

    let nextstate = match lexicon.token(tokens[ngram_len])? {
        Token::End => {
            counter.set_final_ngram_weight(state, weight);
            None
        }
        Token::Start => {
            counter.update_start_count(weight);
            Some(counter.ngram_start_state())
        }
        Token::Word(label) => {
            // Presence of every suffix is required by the model structure;
            // unlisted ones become holes to be filled by backing off.
            let mut bo = counter.ngram_backoff_state(state);
            while let Some(bo_state) = bo {
                counter.find_arc(bo_state, label);
                bo = counter.ngram_backoff_state(bo_state);
            }
            let arc = counter.find_arc(state, label);
            counter.set_ngram_weight(arc, weight);
            if section + 1 < order {
                Some(counter.ngram_next_state(arc))
            } else {
                None
            }
        }
    };
    if let Some(alpha) = backoff {
        let Some(state) = nextstate else {
            if alpha != 0.0 {
                return Err(TextReadError::StrayBackoffWeight.into());
            }
            return Ok(());
        };
        if boweights.len() <= state {
            boweights.resize(state + 1, None);
        }
        boweights[state] = Some(alpha);
    }
    Ok(())
}

/// Gives every unlisted suffix n-gram the probability it would receive by
/// backing off, in ascending order so lower orders are complete first.
fn fill_arpa_holes(model: &mut NGramModel<f64>) -> Result<(), Error> {
    for state in model.states_by_order(true) {
        let Some(bo) = model.backoff_state(state) else {
            // Holes at the root have nowhere to back off to.
            for arc in model.fst().arcs(state) {
                if arc.ilabel != model.backoff_label() && arc.weight == ZERO {
                    return Err(TextReadError::NoLowerOrderProb(format!(
                        "label {}",
                        arc.ilabel
                    ))
                    .into());
                }
            }
            continue;
        };
        let alpha = model.backoff_cost(state).unwrap_or(ZERO);
        let holes: Vec<(usize, Label)> = model
            .fst()
            .arcs(state)
            .iter()
            .enumerate()
            .filter(|(_, arc)| arc.ilabel != model.backoff_label() && arc.weight == ZERO)
            .map(|(pos, arc)| (pos, arc.ilabel))
            .collect();
        for (pos, label) in holes {
            match model.prob(bo, label) {
                Some((cost, _)) => model.set_arc_weight(state, pos, alpha + cost),
                None => {
                    return Err(
                        TextReadError::NoLowerOrderProb(format!("label {label}")).into()
                    )
                }
            }
        }
    }
    Ok(())
}

/// Scales the unigram distribution to sum to one and refits all back-off
/// weights; the last resort for ARPA files that do not normalize.
fn renormalize_arpa_model(model: &mut NGramModel<f64>) -> Result<(), Error> {
    if model.check_normalization().is_ok() {
        return Ok(());
    }
    tracing::warn!("ARPA model is not normalized, renormalizing");
    let unigram = model.unigram_state();
    let start = model.start_state();
    let mut total = model.fst().final_weight(unigram).scalar();
    let mut comp = 0.0;
    let arcs: Vec<(usize, f64)> = model
        .fst()
        .arcs(unigram)
        .iter()
        .enumerate()
        .filter(|(_, arc)| arc.ilabel != model.backoff_label())
        .filter(|(_, arc)| !(start != unigram && arc.nextstate == start))
        .map(|(pos, arc)| (pos, arc.weight))
        .collect();
    for &(_, weight) in &arcs {
        total = neg_log_sum_kahan(total, weight, &mut comp);
    }
    for (pos, weight) in arcs {
        model.set_arc_weight(unigram, pos, weight - total);
    }
    if model.fst().is_final(unigram) {
        let w = model.fst().final_weight(unigram) - total;
        model.fst_mut().set_final(unigram, w);
    }
    model.recalc_backoff()?;
    model.check_normalization()
}

/// Compiles a sorted n-gram count file: `w1 ... wn count` per line, each
/// n-gram's prefix listed before its extensions, counts accumulated as
/// real numbers.
pub fn read_counts<R: BufRead>(reader: R, opts: &ReadOptions) -> Result<VectorFst<f64>, Error> {
    let mut lexicon = Lexicon::new(opts);
    let mut parsed: Vec<(Vec<Token>, f64)> = Vec::new();
    let mut order = 1;
    for line in reader.lines() {
        let line = line?;
        if line.trim().is_empty() {
            continue;
        }
        let bad = || TextReadError::BadNgramLine(line.to_string());
        let tokens: Vec<&str> = line.split_whitespace().collect();
        if tokens.len() < 2 {
            return Err(bad().into());
        }
        let count: f64 = tokens[tokens.len() - 1].parse().map_err(|_| bad())?;
        let ngram = tokens[..tokens.len() - 1]
            .iter()
            .map(|w| lexicon.token(w))
            .collect::<Result<Vec<_>, _>>()?;
        order = order.max(ngram.len());
        parsed.push((ngram, -count.ln()));
    }

    let mut counter = NGramCounter::new(order);
    // Arcs that carry an explicitly listed count; navigating a prefix
    // through anything else means the input was not properly sorted.
    let mut seen: Vec<bool> = Vec::new();
    let mut seen_ok = |seen: &mut Vec<bool>, arc: usize| {
        if seen.len() <= arc {
            seen.resize(arc + 1, false);
        }
        seen[arc]
    };
    for (ngram, weight) in parsed {
        let mut state = counter.ngram_unigram_state();
        for token in &ngram[..ngram.len() - 1] {
            state = match token {
                Token::Start => counter.ngram_start_state(),
                Token::End => return Err(TextReadError::StopSymbolInPrefix.into()),
                Token::Word(label) => {
                    let arc = counter.find_arc(state, *label);
                    if !seen_ok(&mut seen, arc) {
                        return Err(Error::UnseenPrefix(format!("label {label}")));
                    }
                    counter.ngram_next_state(arc)
                }
            };
        }
        match &ngram[ngram.len() - 1] {
            Token::Start => counter.update_start_count(weight),
            Token::End => counter.update_final_ngram_weight(state, weight),
            Token::Word(label) => {
                let arc = counter.find_arc(state, *label);
                counter.update_ngram_weight(arc, weight);
                if seen.len() <= arc {
                    seen.resize(arc + 1, false);
                }
                seen[arc] = true;
            }
        }
    }

    let start_label = lexicon.table.add_symbol(&lexicon.start_symbol);
    lexicon.table.add_symbol(&lexicon.end_symbol);
    let mut fst = counter.get_fst(start_label, false);
    fst.set_symbols(Some(lexicon.table));
    Ok(fst)
}

/// Derives a symbol table from a text corpus: epsilon, every word in order
/// of first appearance, and the OOV class symbol.
pub fn compile_symbols<R: BufRead>(reader: R, opts: &ReadOptions) -> Result<SymbolTable, Error> {
    let mut table = SymbolTable::with_epsilon(&opts.epsilon_symbol);
    for line in reader.lines() {
        for word in line?.split_whitespace() {
            table.add_symbol(word);
        }
    }
    if !opts.oov_symbol.is_empty() {
        table.add_symbol(&opts.oov_symbol);
    }
    Ok(table)
}

/// Maps a corpus to label sequences through a symbol table, with unknown
/// words going to the OOV class.
pub fn read_corpus<R: BufRead>(
    reader: R,
    symbols: &SymbolTable,
    oov_symbol: &str,
) -> Result<Vec<Vec<Label>>, Error> {
    let mut sequences = Vec::new();
    for line in reader.lines() {
        let line = line?;
        if line.trim().is_empty() {
            continue;
        }
        let mut labels = Vec::new();
        for word in line.split_whitespace() {
            match symbols.find(word) {
                Some(label) => labels.push(label),
                None => match symbols.find(oov_symbol) {
                    Some(label) => labels.push(label),
                    None => return Err(Error::OovSymbolMissing(word.to_string())),
                },
            }
        }
        sequences.push(labels);
    }
    Ok(sequences)
}

fn next_line(lines: &mut std::io::Lines<impl BufRead>) -> Result<String, TextReadError> {
    lines
        .next()
        .transpose()?
        .ok_or(TextReadError::UnexpectedEof)
}
