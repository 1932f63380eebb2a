use crate::search::Search;
use crate::state::{State, MAX_ORDER};
use crate::vocab::{Vocabulary, WordIndex};

/// Result of scoring one word
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct FullScoreReturn {
    /// Log10 probability, backoffs included
    pub prob: f32,
    /// Length of the N-Gram that matched
    pub ngram_length: u8,
    /// Words further left would not change `prob`
    pub independent_left: bool,
}

/// Backoff N-Gram scoring over some [`Search`].
#[derive(Debug)]
pub struct NGramModel<S> {
    search: S,
    vocabulary: Vocabulary,
}

impl<S: Search> NGramModel<S> {
    pub fn new(search: S, vocabulary: Vocabulary) -> Self {
        Self { search, vocabulary }
    }

    pub fn order(&self) -> u8 {
        self.search.order()
    }

    pub fn vocabulary(&self) -> &Vocabulary {
        &self.vocabulary
    }

    pub fn search(&self) -> &S {
        &self.search
    }

    pub fn null_context_state(&self) -> State {
        State::default()
    }

    pub fn begin_sentence_state(&self) -> State {
        let bos = self.vocabulary.begin_sentence();
        let mut state = State::default();
        state.words[0] = bos;
        state.backoff[0] = self.search.unigram(bos).backoff;
        state.length = 1;
        state
    }

    /// Score `word` after `in_state`, writing the context for the next
    /// word to `out_state`.
    pub fn full_score(&self, in_state: &State, word: WordIndex, out_state: &mut State) -> FullScoreReturn {
        let mut ret = self.score_except_backoff(in_state.words(), word, out_state);
        for b in &in_state.backoffs()[ret.ngram_length as usize - 1..] {
            ret.prob += b;
        }
        ret
    }

    /// Score `word` after `context` (most recent word first) without a
    /// state to start from. Only the last `order - 1` words of context
    /// are used.
    pub fn full_score_forgot_state(
        &self,
        context: &[WordIndex],
        word: WordIndex,
        out_state: &mut State,
    ) -> FullScoreReturn {
        let context = &context[..context.len().min(self.order() as usize - 1)];
        let mut ret = self.score_except_backoff(context, word, out_state);
        // Charge backoffs of every context longer than the match
        for length in ret.ngram_length as usize..=context.len() {
            match self.search.find(&context[..length]) {
                Some(weights) => ret.prob += weights.backoff,
                None => break,
            }
        }
        ret
    }

    /// Probability of the longest match only; the caller charges backoffs.
    fn score_except_backoff(&self, context: &[WordIndex], word: WordIndex, out_state: &mut State) -> FullScoreReturn {
        let unigram = self.search.unigram(word);
        let mut ret = FullScoreReturn {
            prob: unigram.prob,
            ngram_length: 1,
            independent_left: unigram.independent_left,
        };
        out_state.backoff[0] = unigram.backoff;
        out_state.length = u8::from(unigram.has_extension);
        // Written even if the state ends up empty
        out_state.words[0] = word;
        if context.is_empty() {
            return ret;
        }
        let mut ngram = [0; MAX_ORDER];
        ngram[0] = word;
        self.resume_score(
            context,
            &mut ngram,
            1,
            &mut out_state.backoff[1..],
            &mut out_state.length,
            &mut ret,
        );
        let keep = out_state.length as usize;
        if keep > 1 {
            out_state.words[1..keep].copy_from_slice(&context[..keep - 1]);
        }
        ret
    }

    /// Extend the reversed N-Gram `ngram[..length]` with words from `hist`
    /// for as long as the model knows the result. `backoff_out[i]` gets
    /// the backoff of the N-Gram ending with `hist[i]`; `next_use` is
    /// raised to the length of the longest match worth keeping as context.
    fn resume_score(
        &self,
        hist: &[WordIndex],
        ngram: &mut [WordIndex; MAX_ORDER],
        mut length: usize,
        backoff_out: &mut [f32],
        next_use: &mut u8,
        ret: &mut FullScoreReturn,
    ) {
        let order = self.order() as usize;
        for (i, &word) in hist.iter().enumerate() {
            if ret.independent_left || length >= order {
                ret.independent_left = true;
                return;
            }
            ngram[length] = word;
            length += 1;
            let found = self.search.find(&ngram[..length]);
            if length == order {
                ret.independent_left = true;
                if let Some(weights) = found {
                    ret.prob = weights.prob;
                    ret.ngram_length = length as u8;
                }
                return;
            }
            let Some(weights) = found else {
                ret.independent_left = true;
                return;
            };
            backoff_out[i] = weights.backoff;
            ret.prob = weights.prob;
            ret.ngram_length = length as u8;
            ret.independent_left = weights.independent_left;
            if weights.has_extension {
                *next_use = length as u8;
            }
        }
    }

    /// Words have appeared to the left of a constituent whose first
    /// `extend.len()` words were charged as a lower order estimate.
    /// Returns the correction to that estimate. `add` is the right context
    /// of the words now on the left (most recent first) with their
    /// backoffs in `backoff_in`; on return `next_use` counts how many of
    /// them remain useful context, whose new backoffs are in `backoff_out`.
    pub fn extend_left(
        &self,
        add: &[WordIndex],
        backoff_in: &[f32],
        extend: &[WordIndex],
        backoff_out: &mut [f32],
        next_use: &mut u8,
    ) -> FullScoreReturn {
        let extend_length = extend.len();
        let mut ngram = [0; MAX_ORDER];
        for (slot, &word) in ngram.iter_mut().zip(extend.iter().rev()) {
            *slot = word;
        }
        // The constituent was scored with this N-Gram, so it exists
        let charged = self.search.find(&ngram[..extend_length]).unwrap_or_default();
        let mut ret = FullScoreReturn {
            prob: charged.prob,
            ngram_length: extend_length as u8,
            independent_left: false,
        };
        *next_use = extend_length as u8;
        self.resume_score(add, &mut ngram, extend_length, backoff_out, next_use, &mut ret);
        *next_use -= extend_length as u8;
        // Charge backoffs for the context the match did not reach
        let matched = ret.ngram_length as usize - extend_length;
        for b in &backoff_in[matched..add.len()] {
            ret.prob += b;
        }
        ret.prob -= charged.prob;
        ret
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::arpa::NGramTable;
    use crate::search::ProbingSearch;
    use std::path::PathBuf;

    pub(crate) fn tiny() -> NGramModel<ProbingSearch> {
        let table = NGramTable::read_arpa(&PathBuf::from("testdata/tiny.arpa"), -100.0).unwrap();
        NGramModel::new(ProbingSearch::build(&table, 1.5), table.vocabulary)
    }

    fn ids(model: &NGramModel<ProbingSearch>, words: &str) -> Vec<WordIndex> {
        words.split_whitespace().map(|w| model.vocabulary().index(w)).collect()
    }

    #[test]
    fn it_scores_with_backoff() {
        let model = tiny();
        let w = ids(&model, "a b </s>");
        let mut state = model.null_context_state();
        let mut next = State::default();
        let ret = model.full_score(&state, w[0], &mut next);
        assert_eq!(-0.7, ret.prob);
        assert_eq!(1, next.length);
        state = next;
        let ret = model.full_score(&state, w[1], &mut next);
        assert!((ret.prob + 0.3).abs() < 1e-6);
        assert_eq!(2, ret.ngram_length);
        assert_eq!(&[w[1], w[0]], next.words());
        state = next;
        // "a b </s>" is unseen: p(</s> | b) + backoff(a b)
        let ret = model.full_score(&state, w[2], &mut next);
        assert!((ret.prob + 0.9).abs() < 1e-6);
        assert!(ret.independent_left);
        // Nothing continues "b </s>"
        assert_eq!(0, next.length);
    }

    #[test]
    fn it_matches_forgotten_state() {
        let model = tiny();
        let w = ids(&model, "<s> b c d </s>");
        let mut state = model.begin_sentence_state();
        let mut next = State::default();
        for i in 1..w.len() {
            let incremental = model.full_score(&state, w[i], &mut next).prob;
            let context: Vec<WordIndex> = w[..i].iter().rev().copied().collect();
            let mut ignored = State::default();
            let forgot = model.full_score_forgot_state(&context, w[i], &mut ignored).prob;
            assert!((incremental - forgot).abs() < 1e-5, "word {}", i);
            std::mem::swap(&mut state, &mut next);
        }
    }

    #[test]
    fn it_minimizes_state() {
        let model = tiny();
        let w = ids(&model, "c d");
        let mut state = State::default();
        model.full_score_forgot_state(&[w[0]], w[1], &mut state);
        // "c d" continues nothing but "d" starts "d </s>"
        assert_eq!(&[w[1]], state.words());
        let unk = model.vocabulary().index("<unk>");
        model.full_score(&model.null_context_state(), unk, &mut state);
        assert_eq!(0, state.length);
    }

    #[test]
    fn it_extends_left() {
        let model = tiny();
        let w = ids(&model, "<s> a b");
        // "a b" was charged as p(a) + p(b | a); now "<s>" is to its left
        let bos = model.begin_sentence_state();
        let mut back = [0.0; MAX_ORDER - 1];
        let mut next_use = 0;
        let first = model.extend_left(bos.words(), bos.backoffs(), &w[1..2], &mut back, &mut next_use);
        // p(a | <s>) - p(a)
        assert!((first.prob - (-0.4 + 0.7)).abs() < 1e-6);
        assert_eq!(1, next_use);
        let mut back2 = [0.0; MAX_ORDER - 1];
        let second = model.extend_left(bos.words(), &back, &w[1..3], &mut back2, &mut next_use);
        // p(b | <s> a) - p(b | a)
        assert!((second.prob - (-0.2 + 0.3)).abs() < 1e-6);
        assert!(second.independent_left);
        assert_eq!(0, next_use);
    }
}
