//! Scoring the target side of a rule whose words mix terminals with
//! constituents that were already scored and interned in a [`Chart`].
//!
//! Each constituent's left edge is charged as a lower order estimate when
//! it is scored. When a parent places words to its left, the parent pays
//! only the difference, so the scores of all rules in a derivation add up
//! to the probability of its yield with every word counted once.

use crate::chart::Chart;
use crate::error::LmError;
use crate::model::{FullScoreReturn, NGramModel};
use crate::search::Search;
use crate::state::{ChartState, MAX_ORDER};
use crate::vocab::{ExternalId, VocabularyMap, WordIndex};

/// One symbol on the target side of a rule
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Token {
    /// A word, as the decoder numbers it
    Terminal(ExternalId),
    /// A constituent already interned in the chart under this handle
    BackRef(u32),
}

impl Token {
    /// Decode one element of a flat rule buffer. Non-negative values are
    /// words; a negative value is the negated chart handle.
    pub fn decode(value: i64) -> Result<Self, LmError> {
        if value >= 0 {
            u32::try_from(value)
                .map(Self::Terminal)
                .map_err(|_| LmError::invalid(format!("word id {} out of range", value)))
        } else {
            value
                .checked_neg()
                .and_then(|h| u32::try_from(h).ok())
                .map(Self::BackRef)
                .ok_or_else(|| LmError::invalid(format!("chart handle {} out of range", value)))
        }
    }

    pub fn encode(self) -> i64 {
        match self {
            Self::Terminal(id) => id as i64,
            Self::BackRef(handle) => -(handle as i64),
        }
    }
}

/// Accumulates the score of one rule into an output [`ChartState`].
pub struct RuleScore<'m, 'o, S> {
    model: &'m NGramModel<S>,
    out: &'o mut ChartState,
    left_done: bool,
    prob: f32,
}

impl<'m, 'o, S: Search> RuleScore<'m, 'o, S> {
    pub fn new(model: &'m NGramModel<S>, out: &'o mut ChartState) -> Self {
        out.left.full = false;
        out.left.length = 0;
        out.right.length = 0;
        Self {
            model,
            out,
            left_done: false,
            prob: 0.0,
        }
    }

    /// Start from `<s>`. Nothing can appear to its left.
    pub fn begin_sentence(&mut self) {
        self.out.right = self.model.begin_sentence_state();
        self.left_done = true;
    }

    pub fn terminal(&mut self, word: WordIndex) {
        let copy = self.out.right;
        let ret = self.model.full_score(&copy, word, &mut self.out.right);
        if self.left_done {
            self.prob += ret.prob;
            return;
        }
        if ret.independent_left {
            self.prob += ret.prob;
            self.left_done = true;
            return;
        }
        self.out.left.push(word);
        self.prob += ret.prob;
        if self.out.right.length != copy.length + 1 {
            self.left_done = true;
        }
    }

    /// Start from a constituent without rescoring it
    pub fn begin_non_terminal(&mut self, input: &ChartState) {
        *self.out = *input;
        self.left_done = input.left.full;
    }

    pub fn non_terminal(&mut self, input: &ChartState) {
        if input.left.length == 0 {
            if input.left.full {
                for b in self.out.right.backoffs() {
                    self.prob += b;
                }
                self.left_done = true;
                self.out.right = input.right;
            }
            return;
        }
        if self.out.right.length == 0 {
            self.out.right = input.right;
            if self.left_done {
                return;
            }
            if self.out.left.length > 0 {
                self.left_done = true;
            } else {
                self.out.left = input.left;
                self.left_done = input.left.full;
            }
            return;
        }

        let mut back = [0.0; MAX_ORDER - 1];
        let mut back2 = [0.0; MAX_ORDER - 1];
        let mut next_use = self.out.right.length;
        let right_backoff = self.out.right.backoff;
        if self.extend_left(input, &mut next_use, 1, &right_backoff, &mut back) {
            return;
        }
        // Words after the first, so extending a bigram to begin with
        for extend_length in 2..=input.left.length {
            if self.extend_left(input, &mut next_use, extend_length, &back, &mut back2) {
                return;
            }
            std::mem::swap(&mut back, &mut back2);
        }

        if input.left.full {
            for b in &back[..next_use as usize] {
                self.prob += b;
            }
            self.left_done = true;
            self.out.right = input.right;
            return;
        }

        // Right state was minimized, so it is already independent of the
        // new words to the left.
        if input.right.length < input.left.length {
            self.out.right = input.right;
            return;
        }

        let next = next_use as usize;
        let in_length = input.right.length as usize;
        self.out.right.words.copy_within(0..next, in_length);
        self.out.right.words[..in_length].copy_from_slice(input.right.words());
        self.out.right.backoff[..in_length].copy_from_slice(input.right.backoffs());
        self.out.right.backoff[in_length..in_length + next].copy_from_slice(&back[..next]);
        self.out.right.length = (in_length + next) as u8;
    }

    /// Forget everything, as if a gap of unknown words came before
    pub fn reset(&mut self) {
        self.prob = 0.0;
        self.left_done = false;
        self.out.left.length = 0;
        self.out.right.length = 0;
    }

    /// Total for this rule. Marks the left state full if no word to the
    /// left could change it.
    pub fn finish(self) -> f32 {
        let order = self.model.order() as usize;
        self.out.left.full = self.left_done || self.out.left.length as usize + 1 == order;
        self.prob
    }

    /// Returns true once nothing further in `input` can change the score.
    fn extend_left(
        &mut self,
        input: &ChartState,
        next_use: &mut u8,
        extend_length: u8,
        back_in: &[f32],
        back_out: &mut [f32],
    ) -> bool {
        let words = self.out.right.words;
        let ret = self.model.extend_left(
            &words[..*next_use as usize],
            back_in,
            &input.left.words[..extend_length as usize],
            back_out,
            next_use,
        );
        self.process_ret(&ret, input.left.words[extend_length as usize - 1]);
        if *next_use != self.out.right.length {
            self.left_done = true;
            if *next_use == 0 {
                self.out.right = input.right;
                return true;
            }
        }
        false
    }

    fn process_ret(&mut self, ret: &FullScoreReturn, word: WordIndex) {
        self.prob += ret.prob;
        if self.left_done {
            return;
        }
        if ret.independent_left {
            self.left_done = true;
            return;
        }
        self.out.left.push(word);
    }
}

/// Exact score of a rule. `out` receives the rule's boundary state.
///
/// A rule starting with a back-reference picks up that constituent's state
/// without charging it again. A rule starting with `<s>` starts from the
/// sentence-begin context. Empty rules score 0 with an empty state.
pub fn score_rule<S: Search>(
    model: &NGramModel<S>,
    map: &VocabularyMap,
    rule: &[Token],
    chart: &Chart,
    out: &mut ChartState,
) -> Result<f32, LmError> {
    let mut scorer = RuleScore::new(model, out);
    let Some((first, rest)) = rule.split_first() else {
        return Ok(scorer.finish());
    };
    match *first {
        Token::BackRef(handle) => scorer.begin_non_terminal(chart.resolve(handle)?),
        Token::Terminal(id) => {
            let word = map.get(id);
            if word == model.vocabulary().begin_sentence() {
                scorer.begin_sentence();
            } else {
                scorer.terminal(word);
            }
        }
    }
    for token in rest {
        match *token {
            Token::BackRef(handle) => scorer.non_terminal(chart.resolve(handle)?),
            Token::Terminal(id) => scorer.terminal(map.get(id)),
        }
    }
    Ok(scorer.finish())
}

/// Context-free estimate of a rule: every back-reference is treated as a
/// gap that breaks the context, whatever the constituent holds.
pub fn estimate_rule<S: Search>(model: &NGramModel<S>, map: &VocabularyMap, rule: &[Token]) -> f32 {
    let mut ignored = ChartState::default();
    let mut scorer = RuleScore::new(model, &mut ignored);
    let Some((first, rest)) = rule.split_first() else {
        return 0.0;
    };
    match *first {
        Token::BackRef(_) => scorer.reset(),
        Token::Terminal(id) => {
            let word = map.get(id);
            if word == model.vocabulary().begin_sentence() {
                scorer.begin_sentence();
            } else {
                scorer.terminal(word);
            }
        }
    }
    for token in rest {
        match *token {
            Token::BackRef(_) => scorer.reset(),
            Token::Terminal(id) => scorer.terminal(map.get(id)),
        }
    }
    scorer.finish()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::arpa::NGramTable;
    use crate::make::NGramFstMaker;
    use crate::model::tests::tiny;
    use crate::search::{FstSearch, ProbingSearch, TrieSearch};
    use crate::state::State;
    use proptest::prelude::*;
    use proptest::test_runner::TestCaseError;
    use std::path::PathBuf;

    /// Map external id i to the i-th word of a fixed list
    fn registered<S: Search>(model: &NGramModel<S>) -> VocabularyMap {
        let mut map = VocabularyMap::new();
        for (id, word) in ["<s>", "</s>", "a", "b", "c", "d", "e"].iter().enumerate() {
            map.register(model.vocabulary(), id as ExternalId + 1, word);
        }
        map
    }

    fn terminals(ids: &[ExternalId]) -> Vec<Token> {
        ids.iter().map(|&id| Token::Terminal(id)).collect()
    }

    /// Score words left to right from `<s>` (or from nothing)
    fn sentence<S: Search>(model: &NGramModel<S>, map: &VocabularyMap, ids: &[ExternalId]) -> f32 {
        let words = map.translate(ids);
        let (mut state, rest) = if words[0] == model.vocabulary().begin_sentence() {
            (model.begin_sentence_state(), &words[1..])
        } else {
            (model.null_context_state(), &words[..])
        };
        let mut next = State::default();
        let mut prob = 0.0;
        for &word in rest {
            prob += model.full_score(&state, word, &mut next).prob;
            std::mem::swap(&mut state, &mut next);
        }
        prob
    }

    /// Score `span` as one rule after scoring and interning the
    /// constituents that `choices` carve out of it. Returns the sum over
    /// every rule scored and the handle of this one.
    fn derive<S: Search>(
        model: &NGramModel<S>,
        map: &VocabularyMap,
        chart: &mut Chart,
        span: &[ExternalId],
        choices: &mut impl Iterator<Item = u8>,
    ) -> (f32, u32) {
        let mut total = 0.0;
        let mut rule = Vec::new();
        let mut i = 0;
        while i < span.len() {
            // A constituent never covers all of its parent
            let longest = if i == 0 { span.len() - 1 } else { span.len() - i };
            if choices.next().unwrap_or(0) % 3 == 0 && longest > 0 {
                let len = 1 + choices.next().unwrap_or(0) as usize % longest;
                let (prob, handle) = derive(model, map, chart, &span[i..i + len], choices);
                total += prob;
                rule.push(Token::BackRef(handle));
                i += len;
            } else {
                rule.push(Token::Terminal(span[i]));
                i += 1;
            }
        }
        let mut state = ChartState::default();
        total += score_rule(model, map, &rule, chart, &mut state).unwrap();
        (total, chart.intern(state))
    }

    fn check_derivation<S: Search>(model: &NGramModel<S>, ids: &[ExternalId], choices: &[u8]) -> Result<(), TestCaseError> {
        let map = registered(model);
        let mut chart = Chart::new(16, 16);
        let (total, _) = derive(model, &map, &mut chart, ids, &mut choices.iter().copied());
        let expected = sentence(model, &map, ids);
        prop_assert!(
            (total - expected).abs() < 1e-3,
            "{:?} with {:?}: {} != {}",
            ids,
            choices,
            total,
            expected
        );
        Ok(())
    }

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(64))]

        /// Sentences longer than the order of a 6-gram model, split into
        /// nested constituents at random, often side by side
        #[test]
        fn it_adds_up_over_random_bracketings(
            words in prop::collection::vec(3u32..=7, 1..12),
            begin in any::<bool>(),
            end in any::<bool>(),
            choices in prop::collection::vec(any::<u8>(), 0..64),
        ) {
            let mut ids = Vec::with_capacity(words.len() + 2);
            if begin {
                ids.push(1);
            }
            ids.extend_from_slice(&words);
            if end {
                ids.push(2);
            }
            let table = NGramTable::read_arpa(&PathBuf::from("testdata/six.arpa"), -100.0).unwrap();
            let probing = NGramModel::new(ProbingSearch::build(&table, 1.5), table.vocabulary.clone());
            let trie = NGramModel::new(TrieSearch::build(&table), table.vocabulary.clone());
            let fst = FstSearch::new(NGramFstMaker::new(&table).make().unwrap()).unwrap();
            let fst = NGramModel::new(fst, table.vocabulary.clone());
            prop_assert_eq!(6, probing.order());
            check_derivation(&probing, &ids, &choices)?;
            check_derivation(&trie, &ids, &choices)?;
            check_derivation(&fst, &ids, &choices)?;
        }
    }

    #[test]
    fn it_codes_tokens() {
        assert_eq!(Token::Terminal(5), Token::decode(5).unwrap());
        assert_eq!(Token::BackRef(3), Token::decode(-3).unwrap());
        assert_eq!(-3, Token::BackRef(3).encode());
        assert!(Token::decode(i64::MIN).is_err());
        assert!(Token::decode(1 << 40).is_err());
        assert!(Token::decode(-(1 << 40)).is_err());
    }

    #[test]
    fn it_scores_empty_rules() {
        let model = tiny();
        let map = registered(&model);
        let chart = Chart::new(10, 16);
        let mut out = ChartState::default();
        out.right.length = 2;
        assert_eq!(0.0, score_rule(&model, &map, &[], &chart, &mut out).unwrap());
        assert_eq!(ChartState::default(), out);
        assert_eq!(0.0, estimate_rule(&model, &map, &[]));
    }

    #[test]
    fn it_adds_up_over_derivations() {
        let model = tiny();
        let map = registered(&model);
        // ids: <s>=1 </s>=2 a=3 b=4 c=5 d=6 e=7
        let derivations: [(&[ExternalId], usize); 6] = [
            (&[1, 3, 4, 5, 2], 2),
            (&[1, 3, 4, 5, 2], 3),
            (&[1, 4, 5, 6, 2], 1),
            (&[1, 4, 5, 6, 2], 4),
            (&[3, 4, 5, 6], 2),
            (&[1, 7, 5, 6, 2], 3),
        ];
        for (words, split) in derivations {
            // Rule A covers the words from 1 up to the split, rule B puts
            // the remaining words around it.
            let mut chart = Chart::new(10, 16);
            let mut state = ChartState::default();
            let first = score_rule(&model, &map, &terminals(&words[1..split]), &chart, &mut state).unwrap();
            let handle = chart.intern(state);
            let mut outer = vec![Token::Terminal(words[0]), Token::BackRef(handle)];
            outer.extend(terminals(&words[split..]));
            let mut top = ChartState::default();
            let second = score_rule(&model, &map, &outer, &chart, &mut top).unwrap();
            let expected = sentence(&model, &map, words);
            assert!(
                (first + second - expected).abs() < 1e-4,
                "{:?} split at {}: {} + {} != {}",
                words,
                split,
                first,
                second,
                expected
            );
        }
    }

    #[test]
    fn it_nests_constituents() {
        let model = tiny();
        let map = registered(&model);
        let mut chart = Chart::new(10, 16);
        // [<s> [a [b] c] </s>]
        let mut state = ChartState::default();
        let inner = score_rule(&model, &map, &terminals(&[4]), &chart, &mut state).unwrap();
        let b = chart.intern(state);
        let middle = score_rule(
            &model,
            &map,
            &[Token::Terminal(3), Token::BackRef(b), Token::Terminal(5)],
            &chart,
            &mut state,
        )
        .unwrap();
        let abc = chart.intern(state);
        let outer = score_rule(
            &model,
            &map,
            &[Token::Terminal(1), Token::BackRef(abc), Token::Terminal(2)],
            &chart,
            &mut state,
        )
        .unwrap();
        assert!(state.left.full);
        let expected = sentence(&model, &map, &[1, 3, 4, 5, 2]);
        assert!((inner + middle + outer - expected).abs() < 1e-4);
        // A rule starting with a back-reference does not charge it again
        let again = score_rule(&model, &map, &[Token::BackRef(abc)], &chart, &mut state).unwrap();
        assert_eq!(0.0, again);
    }

    #[test]
    fn it_starts_sentences() {
        let model = tiny();
        let map = registered(&model);
        let chart = Chart::new(10, 16);
        let mut state = ChartState::default();
        let prob = score_rule(&model, &map, &terminals(&[1, 3]), &chart, &mut state).unwrap();
        // p(a | <s>), with <s> itself free
        assert!((prob + 0.4).abs() < 1e-6);
        assert!(state.left.full);
        assert_eq!(0, state.left.length);
    }

    #[test]
    fn it_rejects_unknown_handles() {
        let model = tiny();
        let map = registered(&model);
        let chart = Chart::new(10, 16);
        let mut state = ChartState::default();
        let rule = [Token::Terminal(3), Token::BackRef(1)];
        assert!(score_rule(&model, &map, &rule, &chart, &mut state).is_err());
    }

    #[test]
    fn it_estimates_without_context() {
        let model = tiny();
        let map = registered(&model);
        let mut chart = Chart::new(10, 16);
        let mut state = ChartState::default();
        score_rule(&model, &map, &terminals(&[3]), &chart, &mut state).unwrap();
        let a = chart.intern(state);
        let rule = [Token::BackRef(a), Token::Terminal(4), Token::Terminal(5)];
        let exact = score_rule(&model, &map, &rule, &chart, &mut state).unwrap();
        let estimate = estimate_rule(&model, &map, &rule);
        // The estimate never sees "a" before "b"
        let expected = estimate_rule(&model, &map, &terminals(&[4, 5]));
        assert_eq!(expected, estimate);
        assert!((exact - estimate).abs() > 1e-3);
        // A reset wipes what came before it
        let gap = [Token::Terminal(3), Token::BackRef(99), Token::Terminal(4)];
        assert_eq!(estimate_rule(&model, &map, &terminals(&[4])), estimate_rule(&model, &map, &gap));
    }
}
