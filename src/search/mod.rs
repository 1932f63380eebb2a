//! Physical representations of an N-Gram model.
//!
//! Every representation answers the same question: given an N-Gram written
//! in reverse (the predicted word first, then its history from nearest to
//! farthest), what are its weights? Scoring on top of that is shared by
//! [`crate::NGramModel`].

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use crate::vocab::{WordIndex, NOT_FOUND};

/// Hash table with linear probing
pub mod probing;
/// Sorted arrays searched by bisection
pub mod trie;
/// Backoff FST
pub mod fst;

pub use fst::FstSearch;
pub use probing::ProbingSearch;
pub use trie::TrieSearch;

/// What a representation stores for one N-Gram
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct NGramWeights {
    /// Log10 probability
    pub prob: f32,
    /// Log10 backoff, 0 unless `has_extension`
    pub backoff: f32,
    /// No longer N-Gram ends with this one, so words further left cannot
    /// change its probability.
    pub independent_left: bool,
    /// Some longer N-Gram continues this one, so it is worth keeping as
    /// right context.
    pub has_extension: bool,
}

pub trait Search: Send + Sync {
    /// Length of the longest N-Grams
    fn order(&self) -> u8;

    /// Weights of an N-Gram given in reverse order
    fn find(&self, reversed: &[WordIndex]) -> Option<NGramWeights>;

    /// Weights of a single word. Words the model does not store get those
    /// of `<unk>`.
    fn unigram(&self, word: WordIndex) -> NGramWeights {
        self.find(&[word])
            .or_else(|| self.find(&[NOT_FOUND]))
            .unwrap_or_default()
    }
}

/// Which representation a model file holds
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ModelType {
    Probing,
    Trie,
    Fst,
}

impl ModelType {
    /// Tag byte in native binary files
    pub(crate) fn tag(self) -> u8 {
        match self {
            Self::Probing => 1,
            Self::Trie => 2,
            Self::Fst => 3,
        }
    }

    pub(crate) fn from_tag(tag: u8) -> Option<Self> {
        match tag {
            1 => Some(Self::Probing),
            2 => Some(Self::Trie),
            3 => Some(Self::Fst),
            _ => None,
        }
    }
}

impl fmt::Display for ModelType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Probing => "probing",
            Self::Trie => "trie",
            Self::Fst => "fst",
        })
    }
}

impl FromStr for ModelType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "probing" => Ok(Self::Probing),
            "trie" => Ok(Self::Trie),
            "fst" => Ok(Self::Fst),
            _ => Err(format!(
                "invalid model type: {s:?} (expected \"probing\", \"trie\" or \"fst\")"
            )),
        }
    }
}
