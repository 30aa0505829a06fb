//! Command-line front-end: one subcommand per pipeline stage.
//!
//! `-` stands for standard input or output. Automata are read and written
//! in the crate's binary format; corpora, ARPA models, count files, symbol
//! tables and context patterns are text.

use std::fs::File;
use std::io::{self, BufRead, BufReader, BufWriter, Read, Write};
use std::path::PathBuf;

use anyhow::{bail, Context};
use clap::{Parser, Subcommand};

use ngramkit::context::{read_contexts, NGramContext, NGramExtendedContext};
use ngramkit::count::{self, CountOfCounts, CountOptions};
use ngramkit::fst::VectorFst;
use ngramkit::input::{self, ReadOptions};
use ngramkit::make::{make_hist_model, make_model, MakeMethod, MakeOptions};
use ngramkit::marginalize::{marginalize_model, MarginalizeOptions};
use ngramkit::merge::{merge_hist_models, merge_models, ngram_complete, transfer_model, MergeMethod, MergeOptions};
use ngramkit::output::{self, ApplyOptions, PrintOptions, RandGenOptions, ShowBackoff};
use ngramkit::shrink::{shrink_model, ShrinkMethod, ShrinkOptions};
use ngramkit::split::{NGramSplit, SplitOptions};
use ngramkit::weight::HistWeight;
use ngramkit::{Label, NGramModel, SymbolTable};

#[derive(Parser)]
#[command(name = "ngramkit", version, about = "n-gram language models over weighted FSTs")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Derive a symbol table from a tokenized corpus.
    Symbols {
        input: Option<String>,
        output: Option<String>,
        #[arg(long = "epsilon_symbol", default_value = "<eps>")]
        epsilon_symbol: String,
        #[arg(long = "OOV_symbol", default_value = "<unk>")]
        oov_symbol: String,
    },
    /// Count n-grams from a tokenized corpus.
    Count {
        input: Option<String>,
        output: Option<String>,
        #[arg(long = "method", default_value = "counts")]
        method: String,
        #[arg(long = "order", default_value_t = 3)]
        order: usize,
        #[arg(long = "symbols")]
        symbols: Option<PathBuf>,
        #[arg(long = "epsilon_as_backoff")]
        epsilon_as_backoff: bool,
        #[arg(long = "round_to_int")]
        round_to_int: bool,
        #[arg(long = "require_symbols", default_value_t = true, action = clap::ArgAction::Set)]
        require_symbols: bool,
        #[arg(long = "add_to_symbol_unigram_count", default_value_t = 0.0)]
        add_to_symbol_unigram_count: f64,
        #[arg(long = "context_pattern", default_value = "")]
        context_pattern: String,
        #[arg(long = "bins", default_value_t = 5)]
        bins: usize,
    },
    /// Make a normalized model from a count automaton.
    Make {
        input: Option<String>,
        output: Option<String>,
        #[arg(long = "method", default_value = "katz")]
        method: String,
        #[arg(long = "backoff")]
        backoff: bool,
        #[arg(long = "interpolate")]
        interpolate: bool,
        #[arg(long = "bins", default_value_t = 5)]
        bins: usize,
        #[arg(long = "witten_bell_k", default_value_t = 1.0)]
        witten_bell_k: f64,
        #[arg(long = "discount_D")]
        discount_d: Option<f64>,
        #[arg(long = "count_of_counts")]
        count_of_counts: Option<PathBuf>,
        #[arg(long = "norm_eps", default_value_t = ngramkit::NORM_EPS)]
        norm_eps: f64,
        #[arg(long = "check_consistency")]
        check_consistency: bool,
    },
    /// Prune a model by the chosen criterion.
    Shrink {
        input: Option<String>,
        output: Option<String>,
        #[arg(long = "method", default_value = "seymore")]
        method: String,
        #[arg(long = "theta", default_value_t = 0.0)]
        theta: f64,
        #[arg(long = "target_number_of_ngrams")]
        target_number_of_ngrams: Option<usize>,
        #[arg(long = "min_order_to_prune", default_value_t = 2)]
        min_order_to_prune: u32,
        #[arg(long = "shrink_opt", default_value_t = 0)]
        shrink_opt: u8,
        #[arg(long = "total_unigram_count")]
        total_unigram_count: Option<f64>,
        #[arg(long = "list_file")]
        list_file: Option<PathBuf>,
        #[arg(long = "context_pattern", default_value = "")]
        context_pattern: String,
        #[arg(long = "check_consistency")]
        check_consistency: bool,
    },
    /// Merge two automata (counts or models).
    Merge {
        input1: String,
        input2: String,
        output: Option<String>,
        #[arg(long = "method", default_value = "count_merge")]
        method: String,
        #[arg(long = "alpha", default_value_t = 1.0)]
        alpha: f64,
        #[arg(long = "beta", default_value_t = 1.0)]
        beta: f64,
        #[arg(long = "normalize")]
        normalize: bool,
        #[arg(long = "max_replace_order")]
        max_replace_order: Option<u32>,
        #[arg(long = "context_pattern", default_value = "")]
        context_pattern: String,
        #[arg(long = "complete")]
        complete: bool,
        #[arg(long = "check_consistency")]
        check_consistency: bool,
    },
    /// Split a model along context intervals.
    Split {
        input: String,
        out_prefix: Option<String>,
        #[arg(long = "contexts")]
        contexts: PathBuf,
        #[arg(long = "method", default_value = "count_split")]
        method: String,
        #[arg(long = "complete")]
        complete: bool,
        #[arg(long = "merge_contexts")]
        merge_contexts: bool,
    },
    /// Copy in-context n-grams from one model into another.
    Transfer {
        input1: String,
        input2: String,
        output: Option<String>,
        #[arg(long = "context_pattern", default_value = "")]
        context_pattern: String,
        #[arg(long = "normalize")]
        normalize: bool,
    },
    /// Impose marginalization constraints on back-off weights.
    Marginalize {
        input: Option<String>,
        output: Option<String>,
        #[arg(long = "max_bo_updates", default_value_t = 10)]
        max_bo_updates: usize,
        #[arg(long = "check_consistency")]
        check_consistency: bool,
    },
    /// Score each corpus sentence against a model.
    Apply {
        model: String,
        input: Option<String>,
        output: Option<String>,
        #[arg(long = "OOV_probability")]
        oov_probability: Option<f64>,
        #[arg(long = "OOV_class_size", default_value_t = 10000.0)]
        oov_class_size: f64,
    },
    /// Perplexity of a corpus under a model.
    Perplexity {
        model: String,
        input: Option<String>,
        output: Option<String>,
        #[arg(long = "OOV_probability")]
        oov_probability: Option<f64>,
        #[arg(long = "OOV_class_size", default_value_t = 10000.0)]
        oov_class_size: f64,
    },
    /// Generate random sentences from a model.
    Randgen {
        model: String,
        output: Option<String>,
        #[arg(long = "max_sents", default_value_t = 1)]
        max_sents: usize,
        #[arg(long = "max_length", default_value_t = 512)]
        max_length: usize,
        #[arg(long = "seed", default_value_t = 0x5eed)]
        seed: u64,
    },
    /// Compile ARPA or sorted count text into an automaton.
    Read {
        input: Option<String>,
        output: Option<String>,
        #[arg(long = "ARPA")]
        arpa: bool,
        #[arg(long = "renormalize_arpa")]
        renormalize_arpa: bool,
        #[arg(long = "symbols")]
        symbols: Option<PathBuf>,
        #[arg(long = "epsilon_symbol", default_value = "<eps>")]
        epsilon_symbol: String,
        #[arg(long = "OOV_symbol", default_value = "<unk>")]
        oov_symbol: String,
    },
    /// Print an automaton as n-gram text or ARPA.
    Print {
        input: Option<String>,
        output: Option<String>,
        #[arg(long = "ARPA")]
        arpa: bool,
        #[arg(long = "backoff")]
        backoff: bool,
        #[arg(long = "backoff_inline")]
        backoff_inline: bool,
        #[arg(long = "negativelogs")]
        negativelogs: bool,
        #[arg(long = "integers")]
        integers: bool,
        #[arg(long = "symbols")]
        symbols: Option<PathBuf>,
    },
    /// Renumber states into lexicographic context order.
    Sort {
        input: Option<String>,
        output: Option<String>,
    },
    /// Derive balanced context patterns from a count automaton.
    Context {
        input: Option<String>,
        output: Option<String>,
        #[arg(long = "contexts", default_value_t = 1)]
        contexts: usize,
        #[arg(long = "merge_contexts")]
        merge_contexts: bool,
    },
}

fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_writer(io::stderr)
        .init();
    let cli = Cli::parse();
    run(cli.command)
}

fn reader(path: &Option<String>) -> anyhow::Result<Box<dyn BufRead>> {
    match path.as_deref() {
        None | Some("-") => Ok(Box::new(BufReader::new(io::stdin()))),
        Some(path) => Ok(Box::new(BufReader::new(
            File::open(path).with_context(|| format!("cannot open {path}"))?,
        ))),
    }
}

fn writer(path: &Option<String>) -> anyhow::Result<Box<dyn Write>> {
    match path.as_deref() {
        None | Some("-") => Ok(Box::new(BufWriter::new(io::stdout()))),
        Some(path) => Ok(Box::new(BufWriter::new(
            File::create(path).with_context(|| format!("cannot create {path}"))?,
        ))),
    }
}

fn read_fst(path: &str) -> anyhow::Result<VectorFst<f64>> {
    read_any_fst(path)
}

fn read_any_fst<W: ngramkit::weight::Weight>(path: &str) -> anyhow::Result<VectorFst<W>> {
    let mut reader: Box<dyn Read> = match path {
        "-" => Box::new(io::stdin()),
        path => Box::new(File::open(path).with_context(|| format!("cannot open {path}"))?),
    };
    let mut buf = BufReader::new(&mut reader);
    Ok(VectorFst::read(&mut buf)?)
}

fn write_fst<W: ngramkit::weight::Weight>(
    fst: &VectorFst<W>,
    path: &Option<String>,
) -> anyhow::Result<()> {
    let mut out = writer(path)?;
    fst.write(&mut out)?;
    out.flush()?;
    Ok(())
}

fn load_symbols(path: &Option<PathBuf>) -> anyhow::Result<Option<SymbolTable>> {
    match path {
        Some(path) => {
            let file = BufReader::new(
                File::open(path).with_context(|| format!("cannot open {}", path.display()))?,
            );
            Ok(Some(SymbolTable::read_text(file)?))
        }
        None => Ok(None),
    }
}

fn corpus_sequences(
    input: &Option<String>,
    symbols: &SymbolTable,
) -> anyhow::Result<Vec<Vec<Label>>> {
    Ok(input::read_corpus(
        reader(input)?,
        symbols,
        ngramkit::symbols::OOV_SYMBOL,
    )?)
}

fn model_and_sequences(
    model_path: &str,
    input: &Option<String>,
) -> anyhow::Result<(NGramModel<f64>, Vec<Vec<Label>>)> {
    let fst = read_fst(model_path)?;
    let symbols = fst
        .symbols()
        .cloned()
        .ok_or(ngramkit::Error::MissingSymbols)?;
    let model = NGramModel::new(fst, ngramkit::DEFAULT_BACKOFF_LABEL, ngramkit::NORM_EPS)?;
    let sequences = corpus_sequences(input, &symbols)?;
    Ok((model, sequences))
}

fn run(command: Command) -> anyhow::Result<()> {
    match command {
        Command::Symbols {
            input,
            output,
            epsilon_symbol,
            oov_symbol,
        } => {
            let opts = ReadOptions {
                epsilon_symbol,
                oov_symbol,
                ..ReadOptions::default()
            };
            let table = input::compile_symbols(reader(&input)?, &opts)?;
            let mut out = writer(&output)?;
            table.write_text(&mut out)?;
            out.flush()?;
        }
        Command::Count {
            input,
            output,
            method,
            order,
            symbols,
            epsilon_as_backoff,
            round_to_int,
            require_symbols,
            add_to_symbol_unigram_count,
            context_pattern,
            bins,
        } => {
            let opts = CountOptions {
                order,
                epsilon_as_backoff,
                round_to_int,
                require_symbols,
                add_to_symbol_unigram_count,
            };
            match method.as_str() {
                "counts" | "histograms" => {
                    let table = load_symbols(&symbols)?;
                    let sequences = match &table {
                        Some(table) => corpus_sequences(&input, table)?,
                        None => raw_sequences(&input)?,
                    };
                    let fst = count::count_sequences(sequences, table.as_ref(), &opts)?;
                    if method == "histograms" {
                        write_fst(&count::to_histogram_fst(&fst), &output)?;
                    } else {
                        write_fst(&fst, &output)?;
                    }
                }
                "count_of_counts" => {
                    let fst = read_fst(input.as_deref().unwrap_or("-"))?;
                    let model =
                        NGramModel::new(fst, ngramkit::DEFAULT_BACKOFF_LABEL, ngramkit::NORM_EPS)?;
                    let context = if context_pattern.is_empty() {
                        None
                    } else {
                        Some(NGramContext::from_pattern(
                            &context_pattern,
                            model.hi_order() as usize,
                        )?)
                    };
                    let coc = CountOfCounts::from_counts(&model, bins, context.as_ref());
                    write_fst(&coc.to_fst(), &output)?;
                }
                "count_of_histograms" => {
                    let fst: VectorFst<HistWeight> =
                        read_any_fst(input.as_deref().unwrap_or("-"))?;
                    let model =
                        NGramModel::new(fst, ngramkit::DEFAULT_BACKOFF_LABEL, ngramkit::NORM_EPS)?;
                    let coc = CountOfCounts::from_histograms(&model, bins);
                    write_fst(&coc.to_fst(), &output)?;
                }
                other => bail!("bad counting method: {other}"),
            }
        }
        Command::Make {
            input,
            output,
            method,
            backoff,
            interpolate,
            bins,
            witten_bell_k,
            discount_d,
            count_of_counts,
            norm_eps,
            check_consistency,
        } => {
            let method: MakeMethod = method.parse()?;
            let coc = match count_of_counts {
                Some(path) => {
                    let fst = read_fst(path.to_str().unwrap_or("-"))?;
                    Some(CountOfCounts::from_fst(&fst, bins + 1)?)
                }
                None => None,
            };
            let opts = MakeOptions {
                method,
                backoff,
                interpolate,
                bins,
                witten_bell_k,
                discount_d,
                count_of_counts: coc,
                backoff_label: ngramkit::DEFAULT_BACKOFF_LABEL,
                norm_eps,
                check_consistency,
            };
            let model = if method == MakeMethod::KatzFrac {
                let fst: VectorFst<HistWeight> = read_any_fst(input.as_deref().unwrap_or("-"))?;
                make_hist_model(fst, &opts)?
            } else {
                make_model(read_fst(input.as_deref().unwrap_or("-"))?, &opts)?
            };
            write_fst(model.fst(), &output)?;
        }
        Command::Shrink {
            input,
            output,
            method,
            theta,
            target_number_of_ngrams,
            min_order_to_prune,
            shrink_opt,
            total_unigram_count,
            list_file,
            context_pattern,
            check_consistency,
        } => {
            let fst = read_fst(input.as_deref().unwrap_or("-"))?;
            let symbols = fst.symbols().cloned();
            let model =
                NGramModel::new(fst, ngramkit::DEFAULT_BACKOFF_LABEL, ngramkit::NORM_EPS)?;
            let method = match method.as_str() {
                "count_prune" => ShrinkMethod::CountPrune { theta },
                "relative_entropy" => ShrinkMethod::RelativeEntropy { theta },
                "seymore" => ShrinkMethod::Seymore { theta },
                "context_prune" => ShrinkMethod::ContextPrune {
                    pattern: context_pattern,
                },
                "list_prune" => {
                    let path = list_file.context("list_prune needs --list_file")?;
                    let symbols = symbols.as_ref().ok_or(ngramkit::Error::MissingSymbols)?;
                    let ngrams = read_ngram_list(&path, symbols)?;
                    ShrinkMethod::ListPrune { ngrams }
                }
                other => bail!("bad shrink method: {other}"),
            };
            let shrunk = shrink_model(
                model,
                &ShrinkOptions {
                    method,
                    target_number_of_ngrams,
                    min_order_to_prune,
                    shrink_opt,
                    total_unigram_count,
                    check_consistency,
                },
            )?;
            write_fst(shrunk.fst(), &output)?;
        }
        Command::Merge {
            input1,
            input2,
            output,
            method,
            alpha,
            beta,
            normalize,
            max_replace_order,
            context_pattern,
            complete,
            check_consistency,
        } => {
            let opts = MergeOptions {
                method: match method.as_str() {
                    "count_merge" => MergeMethod::CountMerge,
                    "model_merge" => MergeMethod::ModelMerge,
                    "bayes_model_merge" => MergeMethod::BayesModelMerge,
                    "context_merge" => MergeMethod::ContextMerge {
                        pattern: context_pattern,
                    },
                    "histogram_merge" => MergeMethod::HistogramMerge,
                    "replace_merge" => MergeMethod::ReplaceMerge { max_replace_order },
                    other => bail!("bad merge method: {other}"),
                },
                alpha,
                beta,
                normalize,
                backoff_label: ngramkit::DEFAULT_BACKOFF_LABEL,
                norm_eps: ngramkit::NORM_EPS,
                check_consistency,
            };
            if matches!(opts.method, MergeMethod::HistogramMerge) {
                let mut fst1: VectorFst<HistWeight> = read_any_fst(&input1)?;
                let mut fst2: VectorFst<HistWeight> = read_any_fst(&input2)?;
                if complete {
                    fst1 = ngram_complete(fst1, opts.backoff_label)?;
                    fst2 = ngram_complete(fst2, opts.backoff_label)?;
                }
                let merged = merge_hist_models(fst1, &fst2, &opts)?;
                write_fst(&merged, &output)?;
            } else {
                let mut fst1 = read_fst(&input1)?;
                let mut fst2 = read_fst(&input2)?;
                if complete {
                    fst1 = ngram_complete(fst1, opts.backoff_label)?;
                    fst2 = ngram_complete(fst2, opts.backoff_label)?;
                }
                let merged = merge_models(fst1, &fst2, &opts)?;
                write_fst(&merged, &output)?;
            }
        }
        Command::Split {
            input,
            out_prefix,
            contexts,
            method,
            complete,
            merge_contexts,
        } => {
            let patterns = read_contexts(BufReader::new(File::open(&contexts)?))?;
            let prefix = out_prefix.unwrap_or_else(|| input.clone());
            let opts = SplitOptions {
                complete,
                merge_contexts,
                ..SplitOptions::default()
            };
            match method.as_str() {
                "count_split" => {
                    let fst = read_fst(&input)?;
                    write_split(NGramSplit::new(fst, &patterns, &opts)?, &prefix)?;
                }
                "histogram_split" => {
                    let fst: VectorFst<HistWeight> = read_any_fst(&input)?;
                    write_split(NGramSplit::new(fst, &patterns, &opts)?, &prefix)?;
                }
                other => bail!("bad split method: {other}"),
            }
        }
        Command::Transfer {
            input1,
            input2,
            output,
            context_pattern,
            normalize,
        } => {
            let dst = read_fst(&input1)?;
            let src = read_fst(&input2)?;
            let out = transfer_model(dst, &src, &context_pattern, normalize)?;
            write_fst(&out, &output)?;
        }
        Command::Marginalize {
            input,
            output,
            max_bo_updates,
            check_consistency,
        } => {
            let fst = read_fst(input.as_deref().unwrap_or("-"))?;
            let model =
                NGramModel::new(fst, ngramkit::DEFAULT_BACKOFF_LABEL, ngramkit::NORM_EPS)?;
            let out = marginalize_model(
                model,
                &MarginalizeOptions {
                    max_bo_updates,
                    check_consistency,
                },
            )?;
            write_fst(out.fst(), &output)?;
        }
        Command::Apply {
            model,
            input,
            output,
            oov_probability,
            oov_class_size,
        } => {
            let (model, sequences) = model_and_sequences(&model, &input)?;
            let opts = ApplyOptions {
                oov_probability,
                oov_class_size,
            };
            let symbols = model.fst().symbols().cloned().unwrap_or_default();
            let mut out = writer(&output)?;
            for sequence in &sequences {
                let score = output::score_sentence(&model, sequence, &opts);
                let words: Vec<&str> = sequence
                    .iter()
                    .map(|&l| symbols.key(l).unwrap_or("<unk>"))
                    .collect();
                writeln!(out, "{}\t{:.5}", words.join(" "), score.log10_prob)?;
            }
            out.flush()?;
        }
        Command::Perplexity {
            model,
            input,
            output,
            oov_probability,
            oov_class_size,
        } => {
            let (model, sequences) = model_and_sequences(&model, &input)?;
            let opts = ApplyOptions {
                oov_probability,
                oov_class_size,
            };
            let report = output::perplexity(&model, &sequences, &opts);
            let mut out = writer(&output)?;
            writeln!(out, "{report}")?;
            out.flush()?;
        }
        Command::Randgen {
            model,
            output,
            max_sents,
            max_length,
            seed,
        } => {
            let fst = read_fst(&model)?;
            let symbols = fst.symbols().cloned().unwrap_or_default();
            let model =
                NGramModel::new(fst, ngramkit::DEFAULT_BACKOFF_LABEL, ngramkit::NORM_EPS)?;
            let sentences = output::random_sentences(
                &model,
                &RandGenOptions {
                    max_length,
                    max_sents,
                    seed,
                },
            )?;
            let mut out = writer(&output)?;
            for sentence in sentences {
                let words: Vec<&str> = sentence
                    .iter()
                    .map(|&l| symbols.key(l).unwrap_or("<unk>"))
                    .collect();
                writeln!(out, "{}", words.join(" "))?;
            }
            out.flush()?;
        }
        Command::Read {
            input,
            output,
            arpa,
            renormalize_arpa,
            symbols,
            epsilon_symbol,
            oov_symbol,
        } => {
            let opts = ReadOptions {
                symbols: load_symbols(&symbols)?,
                epsilon_symbol,
                oov_symbol,
                renormalize_arpa,
                ..ReadOptions::default()
            };
            let fst = if arpa {
                input::read_arpa(reader(&input)?, &opts)?
            } else {
                input::read_counts(reader(&input)?, &opts)?
            };
            write_fst(&fst, &output)?;
        }
        Command::Print {
            input,
            output,
            arpa,
            backoff,
            backoff_inline,
            negativelogs,
            integers,
            symbols,
        } => {
            let mut fst = read_fst(input.as_deref().unwrap_or("-"))?;
            if let Some(table) = load_symbols(&symbols)? {
                fst.set_symbols(Some(table));
            }
            let model =
                NGramModel::new(fst, ngramkit::DEFAULT_BACKOFF_LABEL, ngramkit::NORM_EPS)?;
            let show_backoff = if backoff {
                if backoff_inline {
                    ShowBackoff::Inline
                } else {
                    ShowBackoff::Epsilon
                }
            } else {
                ShowBackoff::None
            };
            let mut out = writer(&output)?;
            output::print_model(
                &model,
                &mut out,
                &PrintOptions {
                    arpa,
                    show_backoff,
                    negative_logs: negativelogs,
                    integers,
                },
            )?;
            out.flush()?;
        }
        Command::Sort { input, output } => {
            let fst = read_fst(input.as_deref().unwrap_or("-"))?;
            let model =
                NGramModel::new(fst, ngramkit::DEFAULT_BACKOFF_LABEL, ngramkit::NORM_EPS)?;
            let sorted = model.sort_states()?;
            write_fst(sorted.fst(), &output)?;
        }
        Command::Context {
            input,
            output,
            contexts,
            merge_contexts,
        } => {
            let fst = read_fst(input.as_deref().unwrap_or("-"))?;
            let model =
                NGramModel::new(fst, ngramkit::DEFAULT_BACKOFF_LABEL, ngramkit::NORM_EPS)?;
            let mut patterns = balanced_contexts(&model, contexts);
            if merge_contexts {
                // Canonicalize through the interval set, collapsing any
                // emitted intervals whose boundaries touch.
                let ext = NGramExtendedContext::from_patterns(
                    &patterns.join(","),
                    model.hi_order() as usize,
                    true,
                )?;
                patterns = ext.contexts().iter().map(|c| c.pattern()).collect();
            }
            let mut out = writer(&output)?;
            for pattern in patterns {
                writeln!(out, "{pattern}")?;
            }
            out.flush()?;
        }
    }
    Ok(())
}

fn raw_sequences(input: &Option<String>) -> anyhow::Result<Vec<Vec<Label>>> {
    let mut sequences = Vec::new();
    for line in reader(input)?.lines() {
        let line = line?;
        if line.trim().is_empty() {
            continue;
        }
        let labels = line
            .split_whitespace()
            .map(|tok| tok.parse::<Label>().context("corpus without a symbol table must be numeric"))
            .collect::<Result<Vec<_>, _>>()?;
        sequences.push(labels);
    }
    Ok(sequences)
}

fn read_ngram_list(path: &PathBuf, symbols: &SymbolTable) -> anyhow::Result<Vec<Vec<Label>>> {
    let mut ngrams = Vec::new();
    for line in BufReader::new(File::open(path)?).lines() {
        let line = line?;
        if line.trim().is_empty() {
            continue;
        }
        let labels = line
            .split_whitespace()
            .map(|word| {
                symbols
                    .find(word)
                    .with_context(|| format!("word {word:?} not in the symbol table"))
            })
            .collect::<Result<Vec<_>, _>>()?;
        ngrams.push(labels);
    }
    Ok(ngrams)
}

fn write_split<W: ngramkit::weight::Weight>(
    mut split: NGramSplit<W>,
    prefix: &str,
) -> anyhow::Result<()> {
    let mut index = 0;
    while !split.done() {
        let piece = split.next_model()?;
        let path = format!("{prefix}{index:05}");
        piece.write_file(std::path::Path::new(&path))?;
        index += 1;
    }
    Ok(())
}

/// Cuts the unigram label space into intervals carrying roughly equal
/// counts, emitting one context pattern per interval.
fn balanced_contexts(model: &NGramModel<f64>, contexts: usize) -> Vec<String> {
    let unigram = model.unigram_state();
    let start = model.start_state();
    let mut weights: Vec<(Label, f64)> = model
        .fst()
        .arcs(unigram)
        .iter()
        .filter(|arc| arc.ilabel != model.backoff_label())
        .filter(|arc| !(start != unigram && arc.nextstate == start))
        .map(|arc| (arc.ilabel, (-arc.weight).exp()))
        .collect();
    weights.sort_by_key(|&(label, _)| label);
    let total: f64 = weights.iter().map(|&(_, w)| w).sum();
    let contexts = contexts.max(1);
    let per_bin = total / contexts as f64;
    let mut patterns = Vec::new();
    let mut begin: Label = 0;
    let mut acc = 0.0;
    let max_label = weights.last().map(|&(l, _)| l).unwrap_or(0);
    for &(label, weight) in &weights {
        acc += weight;
        if acc >= per_bin && patterns.len() + 1 < contexts {
            patterns.push(format!("{begin} : {}", label + 1));
            begin = label + 1;
            acc = 0.0;
        }
    }
    patterns.push(format!("{begin} : {}", max_label + 1));
    patterns
}
