use anyhow::Result;
use rustfst::fst_impls::VectorFst;
use rustfst::semirings::TropicalWeight;
use std::io::prelude::*;

/// rustfst does not define this but we will
pub type StdVectorFst = VectorFst<TropicalWeight>;

/// Reading ARPA files
pub mod arpa;
/// Model files, binary formats and loading
pub mod binary;
/// Interning boundary states per sentence
pub mod chart;
/// Settings
pub mod config;
pub mod error;
/// One scoring interface over every representation
pub mod facade;
/// Making backoff FSTs
pub mod make;
/// Backoff N-Gram scoring
pub mod model;
/// Scoring rules with back-references
pub mod rule;
/// Physical model representations
pub mod search;
/// Handle tables for decoders
pub mod session;
/// Boundary states
pub mod state;
/// Vocabularies and decoder id maps
pub mod vocab;

pub use chart::{Chart, RuleBuffer};
pub use config::Config;
pub use error::LmError;
pub use facade::{LanguageModel, MappedModel};
pub use make::NGramFstMaker;
pub use model::NGramModel;
pub use rule::Token;
pub use search::ModelType;
pub use session::{ChartHandle, ModelHandle, Session, StateProb};
pub use state::{ChartState, State};

/// Read input sentences as whitespace-separated lines, skipping blank ones
pub fn read_sentences<R: BufRead>(input: R) -> Result<Vec<Vec<String>>> {
    let mut sentences = Vec::new();
    for line in input.lines() {
        let words: Vec<String> = line?.split_whitespace().map(String::from).collect();
        if !words.is_empty() {
            sentences.push(words);
        }
    }
    Ok(sentences)
}
