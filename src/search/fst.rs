use anyhow::{anyhow, bail, Result};
use rustfst::prelude::*;
use std::collections::{HashSet, VecDeque};

use super::{NGramWeights, Search};
use crate::make::{from_weight, word_label};
use crate::state::MAX_ORDER;
use crate::vocab::{Vocabulary, WordIndex, UNK};
use crate::StdVectorFst;

/// N-Gram model stored as a backoff FST: one state per context, one arc
/// per N-Gram leaving the state of its history, and an epsilon arc from
/// each context to its backoff context. Weights are negative natural log
/// probabilities.
#[derive(Debug)]
pub struct FstSearch {
    /// Underlying FST, arcs sorted by input label
    fst: StdVectorFst,
    /// Read from the input symbols
    vocabulary: Vocabulary,
    /// Highest order in the model
    hi_order: u8,
    /// State of the empty history
    unigram: StateId,
    /// Order of each state (length of its history plus one)
    state_orders: Vec<u8>,
    /// Backoff state and log10 backoff of each state
    backoffs: Vec<Option<(StateId, f32)>>,
    /// Reversed N-Grams that are the suffix of a longer N-Gram
    left_extended: HashSet<Vec<WordIndex>>,
}

impl FstSearch {
    pub fn new(mut fst: StdVectorFst) -> Result<Self> {
        let syms = fst
            .input_symbols()
            .ok_or_else(|| anyhow!("FST has no input symbols"))?
            .clone();
        if syms.get_symbol(word_label(0)) != Some(UNK) {
            bail!("FST symbol 1 must be {}", UNK);
        }
        let words = (word_label(1)..syms.len() as Label)
            .map(|label| syms.get_symbol(label).unwrap_or_default().to_string());
        let vocabulary = Vocabulary::new(words);
        if vocabulary.len() + 1 != syms.len() {
            bail!("FST symbol table has duplicate words");
        }
        tr_sort(&mut fst, ILabelCompare {});

        let num_states = fst.num_states();
        let mut backoffs = vec![None; num_states];
        for (s, backoff) in backoffs.iter_mut().enumerate() {
            let trs = fst.get_trs(s as StateId)?;
            *backoff = trs
                .trs()
                .iter()
                .find(|tr| tr.ilabel == EPS_LABEL)
                .map(|tr| (tr.nextstate, from_weight(*tr.weight.value())));
        }
        let mut unigram = fst.start().ok_or_else(|| anyhow!("FST has no start state"))?;
        for _ in 0..=num_states {
            match backoffs[unigram as usize] {
                Some((next, _)) => unigram = next,
                None => break,
            }
        }
        if backoffs[unigram as usize].is_some() {
            bail!("FST has a backoff cycle");
        }
        let state_orders = Self::state_orders(&backoffs, unigram)?;
        let state_ngrams = Self::state_ngrams(&fst, &state_orders, unigram)?;

        let mut hi_order = 1;
        let mut left_extended = HashSet::new();
        for (s, history) in state_ngrams.iter().enumerate() {
            let Some(history) = history else { continue };
            for tr in fst.get_trs(s as StateId)?.trs() {
                if tr.ilabel == EPS_LABEL {
                    continue;
                }
                hi_order = hi_order.max(state_orders[s]);
                if !history.is_empty() {
                    let mut suffix: Vec<WordIndex> = history[1..].to_vec();
                    suffix.push(tr.ilabel - 1);
                    suffix.reverse();
                    left_extended.insert(suffix);
                }
            }
        }
        if hi_order as usize > MAX_ORDER {
            bail!("FST order {} exceeds the maximum of {}", hi_order, MAX_ORDER);
        }
        Ok(Self {
            fst,
            vocabulary,
            hi_order,
            unigram,
            state_orders,
            backoffs,
            left_extended,
        })
    }

    fn state_orders(backoffs: &[Option<(StateId, f32)>], unigram: StateId) -> Result<Vec<u8>> {
        let mut orders = vec![0u8; backoffs.len()];
        orders[unigram as usize] = 1;
        for s in 0..backoffs.len() {
            let mut chain = Vec::new();
            let mut cur = s;
            while orders[cur] == 0 {
                chain.push(cur);
                cur = match backoffs[cur] {
                    Some((next, _)) => next as usize,
                    None => bail!("state {} has no backoff arc", cur),
                };
                if chain.len() > MAX_ORDER {
                    bail!("state {} is deeper than order {}", s, MAX_ORDER);
                }
            }
            let mut order = orders[cur];
            for &state in chain.iter().rev() {
                order += 1;
                orders[state] = order;
            }
        }
        Ok(orders)
    }

    /// History reaching each context state, found breadth first from the
    /// unigram state
    fn state_ngrams(
        fst: &StdVectorFst,
        state_orders: &[u8],
        unigram: StateId,
    ) -> Result<Vec<Option<Vec<WordIndex>>>> {
        let mut ngrams: Vec<Option<Vec<WordIndex>>> = vec![None; state_orders.len()];
        ngrams[unigram as usize] = Some(Vec::new());
        let mut queue = VecDeque::from([unigram]);
        while let Some(s) = queue.pop_front() {
            for tr in fst.get_trs(s)?.trs() {
                let next = tr.nextstate as usize;
                if tr.ilabel == EPS_LABEL
                    || state_orders[next] != state_orders[s as usize] + 1
                    || ngrams[next].is_some()
                {
                    continue;
                }
                let mut history = ngrams[s as usize].clone().unwrap_or_default();
                history.push(tr.ilabel - 1);
                ngrams[next] = Some(history);
                queue.push_back(tr.nextstate);
            }
        }
        Ok(ngrams)
    }

    pub fn vocabulary(&self) -> &Vocabulary {
        &self.vocabulary
    }

    pub fn fst(&self) -> &StdVectorFst {
        &self.fst
    }

    /// Destination and weight of the arc for `word` leaving `state`. A
    /// word with no label has no arc.
    fn find_tr(&self, state: StateId, word: WordIndex) -> Option<(StateId, f32)> {
        let label = word.checked_add(1)?;
        let trs = self.fst.get_trs(state).ok()?;
        let trs = trs.trs();
        let i = trs.binary_search_by_key(&label, |tr| tr.ilabel).ok()?;
        Some((trs[i].nextstate, *trs[i].weight.value()))
    }
}

impl Search for FstSearch {
    fn order(&self) -> u8 {
        self.hi_order
    }

    fn find(&self, reversed: &[WordIndex]) -> Option<NGramWeights> {
        let n = reversed.len();
        if n == 0 || n > self.hi_order as usize {
            return None;
        }
        let mut state = self.unigram;
        for &word in reversed[1..].iter().rev() {
            let (next, _) = self.find_tr(state, word)?;
            if self.state_orders[next as usize] != self.state_orders[state as usize] + 1 {
                return None;
            }
            state = next;
        }
        let (next, weight) = self.find_tr(state, reversed[0])?;
        let has_extension =
            n < self.hi_order as usize && self.state_orders[next as usize] as usize == n + 1;
        let backoff = if has_extension {
            self.backoffs[next as usize].map_or(0.0, |(_, b)| b)
        } else {
            0.0
        };
        Some(NGramWeights {
            prob: from_weight(weight),
            backoff,
            independent_left: n == self.hi_order as usize || !self.left_extended.contains(reversed),
            has_extension,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::arpa::NGramTable;
    use crate::make::NGramFstMaker;
    use std::path::PathBuf;

    #[test]
    fn it_recovers_structure() {
        let table = NGramTable::read_arpa(&PathBuf::from("testdata/tiny.arpa"), -100.0).unwrap();
        let search = FstSearch::new(NGramFstMaker::new(&table).make().unwrap()).unwrap();
        assert_eq!(3, search.order());
        assert_eq!(7, search.vocabulary().len());
        assert_eq!(table.vocabulary.index("c"), search.vocabulary().index("c"));
        assert_eq!(1, search.state_orders[search.unigram as usize]);
        // Start state is the history "<s>"
        let start = search.fst().start().unwrap();
        assert_eq!(2, search.state_orders[start as usize]);
        let v = &table.vocabulary;
        assert!(search.left_extended.contains(&vec![v.index("b"), v.index("a")]));
        assert!(!search.left_extended.contains(&vec![v.index("</s>"), v.index("b")]));
    }

    #[test]
    fn it_requires_symbols() {
        let mut fst = StdVectorFst::new();
        let s = fst.add_state();
        fst.set_start(s).unwrap();
        assert!(FstSearch::new(fst).is_err());
    }
}
