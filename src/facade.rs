use crate::chart::Chart;
use crate::error::LmError;
use crate::model::NGramModel;
use crate::rule::{estimate_rule, score_rule, Token};
use crate::search::{ModelType, Search};
use crate::state::{ChartState, State};
use crate::vocab::{ExternalId, Vocabulary, VocabularyMap, WordIndex};

/// Scoring interface shared by every model representation, chosen once
/// when the model is loaded.
///
/// Only `register_word` mutates; callers serialize it against scoring.
pub trait LanguageModel: Send + Sync {
    fn order(&self) -> u8;

    fn representation(&self) -> ModelType;

    fn vocabulary(&self) -> &Vocabulary;

    /// Map a decoder id to `word`. Returns true if the id was already
    /// mapped; the new mapping wins.
    fn register_word(&mut self, word: &str, id: ExternalId) -> bool;

    fn translate(&self, ids: &[ExternalId]) -> Vec<WordIndex>;

    fn is_out_of_vocabulary(&self, id: ExternalId) -> bool;

    /// Log10 probability of `word` after `context` (written order), with
    /// no state carried in or out
    fn full_context_probability(&self, context: &[WordIndex], word: WordIndex) -> f32;

    /// As [`LanguageModel::full_context_probability`], also writing the
    /// state to continue from
    fn full_context_probability_into(&self, context: &[WordIndex], word: WordIndex, state_out: &mut State) -> f32;

    /// Log10 probability of `word` after `state_in`
    fn incremental_score(&self, state_in: &State, word: WordIndex, state_out: &mut State) -> f32;

    fn null_context_state(&self) -> State;

    fn begin_sentence_state(&self) -> State;

    fn score_rule(&self, rule: &[Token], chart: &Chart, out: &mut ChartState) -> Result<f32, LmError>;

    fn estimate_rule(&self, rule: &[Token]) -> f32;

    fn vocabulary_index(&self, word: &str) -> WordIndex {
        self.vocabulary().index(word)
    }

    fn is_known(&self, index: WordIndex) -> bool {
        self.vocabulary().is_known(index)
    }

    fn is_known_word(&self, word: &str) -> bool {
        self.is_known(self.vocabulary_index(word))
    }

    /// Probability of the last id given the ones before it
    fn probability(&self, ids: &[ExternalId]) -> f32 {
        self.probability_for_internal_ids(&self.translate(ids))
    }

    fn probability_for_internal_ids(&self, words: &[WordIndex]) -> f32 {
        match words.split_last() {
            Some((&word, context)) => self.full_context_probability(context, word),
            None => 0.0,
        }
    }

    fn probability_for_words(&self, words: &[&str]) -> f32 {
        let words: Vec<WordIndex> = words.iter().map(|w| self.vocabulary_index(w)).collect();
        self.probability_for_internal_ids(&words)
    }

    /// Sum of the probabilities of `ids[start..]`, each given everything
    /// before it. Scoring starts from the empty context when `start` is 0.
    fn sentence_probability(&self, ids: &[ExternalId], start: usize) -> f32 {
        let words = self.translate(ids);
        if words.len() <= start {
            return 0.0;
        }
        let mut state = self.null_context_state();
        let mut prob = 0.0;
        let mut next = start;
        if start > 0 {
            prob = self.full_context_probability_into(&words[..start], words[start], &mut state);
            next += 1;
        }
        let mut state2 = State::default();
        let mut rest = words[next..].iter();
        loop {
            let Some(&word) = rest.next() else { break };
            prob += self.incremental_score(&state, word, &mut state2);
            let Some(&word) = rest.next() else { break };
            prob += self.incremental_score(&state2, word, &mut state);
        }
        prob
    }
}

/// A model of one representation plus the decoder's word ids.
#[derive(Debug)]
pub struct MappedModel<S> {
    model: NGramModel<S>,
    map: VocabularyMap,
    representation: ModelType,
}

impl<S: Search> MappedModel<S> {
    pub fn new(model: NGramModel<S>, representation: ModelType) -> Self {
        Self {
            model,
            map: VocabularyMap::new(),
            representation,
        }
    }

    pub fn model(&self) -> &NGramModel<S> {
        &self.model
    }
}

impl<S: Search> LanguageModel for MappedModel<S> {
    fn order(&self) -> u8 {
        self.model.order()
    }

    fn representation(&self) -> ModelType {
        self.representation
    }

    fn vocabulary(&self) -> &Vocabulary {
        self.model.vocabulary()
    }

    fn register_word(&mut self, word: &str, id: ExternalId) -> bool {
        self.map.register(self.model.vocabulary(), id, word)
    }

    fn translate(&self, ids: &[ExternalId]) -> Vec<WordIndex> {
        self.map.translate(ids)
    }

    fn is_out_of_vocabulary(&self, id: ExternalId) -> bool {
        self.map.is_out_of_vocabulary(self.model.vocabulary(), id)
    }

    fn full_context_probability(&self, context: &[WordIndex], word: WordIndex) -> f32 {
        let mut ignored = State::default();
        self.full_context_probability_into(context, word, &mut ignored)
    }

    fn full_context_probability_into(&self, context: &[WordIndex], word: WordIndex, state_out: &mut State) -> f32 {
        let reversed: Vec<WordIndex> = context.iter().rev().copied().collect();
        self.model.full_score_forgot_state(&reversed, word, state_out).prob
    }

    fn incremental_score(&self, state_in: &State, word: WordIndex, state_out: &mut State) -> f32 {
        self.model.full_score(state_in, word, state_out).prob
    }

    fn null_context_state(&self) -> State {
        self.model.null_context_state()
    }

    fn begin_sentence_state(&self) -> State {
        self.model.begin_sentence_state()
    }

    fn score_rule(&self, rule: &[Token], chart: &Chart, out: &mut ChartState) -> Result<f32, LmError> {
        score_rule(&self.model, &self.map, rule, chart, out)
    }

    fn estimate_rule(&self, rule: &[Token]) -> f32 {
        estimate_rule(&self.model, &self.map, rule)
    }
}
