use anyhow::{bail, Result};
use log::debug;
use rustfst::prelude::*;
use std::collections::HashMap;
use std::f32::consts::LN_10;
use std::sync::Arc;

use crate::arpa::NGramTable;
use crate::vocab::WordIndex;
use crate::StdVectorFst;

/// FST label of a word (label 0 is epsilon)
pub(crate) fn word_label(word: WordIndex) -> Label {
    word + 1
}

/// Tropical weight of a log10 probability
pub(crate) fn to_weight(log10: f32) -> f32 {
    -log10 * LN_10
}

/// Log10 probability of a tropical weight
pub(crate) fn from_weight(weight: f32) -> f32 {
    -weight / LN_10
}

/// Make a backoff FST from the N-Grams of an ARPA model.
#[derive(Debug)]
pub struct NGramFstMaker<'a> {
    table: &'a NGramTable,
}

impl<'a> NGramFstMaker<'a> {
    pub fn new(table: &'a NGramTable) -> Self {
        Self { table }
    }

    /// One state per context. An N-Gram's arc leaves the state of its
    /// history and enters the state of its longest suffix that is itself
    /// a context.
    pub fn make(&self) -> Result<StdVectorFst> {
        let mut fst = StdVectorFst::new();
        let mut states: HashMap<&[WordIndex], StateId> = HashMap::new();
        let backoff = fst.add_state();
        assert_eq!(backoff, 0); // Why would it be anything else?
        states.insert(&[][..], backoff);
        let mut contexts: Vec<&[WordIndex]> = self.table.contexts().into_iter().collect();
        contexts.sort_by(|a, b| a.len().cmp(&b.len()).then_with(|| a.cmp(b)));
        for context in contexts {
            states.insert(context, fst.add_state());
        }
        let backoffs: HashMap<&[WordIndex], f32> = self
            .table
            .orders
            .iter()
            .flatten()
            .map(|r| (r.words.as_slice(), r.backoff))
            .collect();
        for (&context, &s) in states.iter() {
            if context.is_empty() {
                continue;
            }
            let weight = backoffs.get(context).copied().unwrap_or(0.0);
            let Some(&lower) = states.get(&context[1..]) else {
                bail!("context {:?} has no backoff context", self.table.spell(context));
            };
            fst.add_tr(s, Tr::new(EPS_LABEL, EPS_LABEL, to_weight(weight), lower))?;
        }
        for record in self.table.orders.iter().flatten() {
            let n = record.words.len();
            let Some(&origin) = states.get(&record.words[..n - 1]) else {
                bail!("no state for the history of {:?}", self.table.spell(&record.words));
            };
            let destination = (0..=n)
                .find_map(|start| states.get(&record.words[start..]).copied())
                .unwrap_or(backoff);
            let label = word_label(record.words[n - 1]);
            fst.add_tr(
                origin,
                Tr::new(label, label, to_weight(record.prob), destination),
            )?;
        }
        let start = states
            .get(&[self.table.vocabulary.begin_sentence()][..])
            .copied()
            .unwrap_or(backoff);
        fst.set_start(start)?;
        tr_sort(&mut fst, ILabelCompare {});

        let mut syms = SymbolTable::new();
        for (idx, word) in self.table.vocabulary.words().enumerate() {
            if syms.add_symbol(word) != word_label(idx as WordIndex) {
                bail!("word {:?} cannot be given label {}", word, idx + 1);
            }
        }
        let syms = Arc::new(syms);
        fst.set_input_symbols(Arc::clone(&syms));
        fst.set_output_symbols(Arc::clone(&syms));
        debug!(
            "made backoff FST with {} states for {} n-grams",
            fst.num_states(),
            self.table.len()
        );
        Ok(fst)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;

    #[test]
    fn it_converts_weights() {
        assert!((from_weight(to_weight(-0.25)) + 0.25).abs() < 1e-6);
        assert!(to_weight(-1.0) > 0.0);
    }

    #[test]
    fn it_makes_an_fst() {
        let table = NGramTable::read_arpa(&PathBuf::from("testdata/tiny.arpa"), -100.0).unwrap();
        let fst = NGramFstMaker::new(&table).make().unwrap();
        // Unigram state plus contexts <s> a b c d, <s> a, <s> b, a b, b c
        assert_eq!(10, fst.num_states());
        let num_trs: usize = fst
            .states_iter()
            .map(|s| fst.num_trs(s).unwrap())
            .sum();
        // One arc per n-gram plus one backoff arc per context
        assert_eq!(table.len() + 9, num_trs);
        let syms = fst.input_symbols().unwrap();
        assert_eq!(Some("<unk>"), syms.get_symbol(1));
        assert_eq!(Some("<s>"), syms.get_symbol(word_label(table.vocabulary.begin_sentence())));
        let start = fst.start().unwrap();
        let trs = fst.get_trs(start).unwrap();
        let trs = trs.trs();
        // The backoff arc sorts first
        assert_eq!(EPS_LABEL, trs[0].ilabel);
        assert_eq!(0, trs[0].nextstate);
        assert!((from_weight(*trs[0].weight.value()) + 0.5).abs() < 1e-5);
    }
}
