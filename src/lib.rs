#![doc = include_str!("../README.md")]

pub mod context;
pub mod count;
pub mod fst;
pub mod input;
pub mod make;
pub mod marginalize;
pub mod merge;
pub mod model;
pub mod output;
pub mod shrink;
pub mod split;
pub mod symbols;
pub mod weight;

pub use count::{CountOfCounts, CountOptions, NGramCounter};
pub use input::TextReadError;
pub use model::NGramModel;
pub use symbols::SymbolTable;

/// Arc label. Label 0 is reserved for epsilon / the back-off arc by default.
pub type Label = u32;

/// State index into an automaton's state arena.
pub type StateId = usize;

/// Default tolerance for the per-state normalization check.
pub const NORM_EPS: f64 = 0.001;

/// Default label of the back-off arc.
pub const DEFAULT_BACKOFF_LABEL: Label = 0;

#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error("automaton has no start state")]
    NoStartState,
    #[error("state {0} has more than one arc with the back-off label")]
    MultipleBackoffArcs(StateId),
    #[error("state {0} is not the unigram state but has no back-off arc")]
    MissingBackoffArc(StateId),
    #[error("back-off arcs form a cycle through state {0}")]
    BackoffCycle(StateId),
    #[error("arc labeled {label} at state {state} has no counterpart at its back-off state")]
    MissingSuffixNgram { state: StateId, label: Label },
    #[error("state {state} sums to {sum:.6} in negated-log space, outside the {eps} tolerance")]
    Unnormalized { state: StateId, sum: f64, eps: f64 },
    #[error("negated-log difference would produce negative mass ({a} minus {b})")]
    NegativeMass { a: f64, b: f64 },
    #[error("bad context interval: begin does not sort strictly below end")]
    BadContextInterval,
    #[error("context patterns describe overlapping intervals")]
    OverlappingContexts,
    #[error("unknown method: {0:?}")]
    UnknownMethod(String),
    #[error("the n-gram list to prune is empty")]
    EmptyPruneList,
    #[error("target of {target} n-grams is below the structural minimum of {minimum}")]
    TargetTooSmall { target: usize, minimum: usize },
    #[error("marginalization did not converge within {0} iterations")]
    MarginalizeDiverged(usize),
    #[error("symbol {0:?} occurs more than once in the input")]
    DuplicateSymbol(String),
    #[error("out-of-vocabulary word {0:?} and the OOV symbol is not in the symbol table")]
    OovSymbolMissing(String),
    #[error("input has no symbol table attached")]
    MissingSymbols,
    #[error("n-gram prefix {0:?} was not seen before its extension")]
    UnseenPrefix(String),
    #[error("the file is not in the expected automaton format")]
    BadFileFormat,
    #[error(transparent)]
    TextRead(#[from] TextReadError),
    #[error(transparent)]
    Io(#[from] std::io::Error),
}
