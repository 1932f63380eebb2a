use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// Index of a word in a model's own vocabulary
pub type WordIndex = u32;
/// Identifier the decoder assigns to a word
pub type ExternalId = u32;

/// Index every vocabulary reserves for `<unk>`; lookups of unknown words return it.
pub const NOT_FOUND: WordIndex = 0;
pub const UNK: &str = "<unk>";
pub const BEGIN_SENTENCE: &str = "<s>";
pub const END_SENTENCE: &str = "</s>";

/// Words known to one n-gram model.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Vocabulary {
    words: Vec<String>,
    index: HashMap<String, WordIndex>,
    begin_sentence: WordIndex,
    end_sentence: WordIndex,
}

impl Vocabulary {
    /// Build from words listed in index order. `<unk>` is placed at
    /// [`NOT_FOUND`] whether or not it is listed.
    pub fn new<I, T>(words: I) -> Self
    where
        I: IntoIterator<Item = T>,
        T: Into<String>,
    {
        let mut vocab = Self {
            words: vec![UNK.to_string()],
            index: HashMap::from([(UNK.to_string(), NOT_FOUND)]),
            begin_sentence: NOT_FOUND,
            end_sentence: NOT_FOUND,
        };
        for word in words {
            vocab.insert(word.into());
        }
        vocab
    }

    /// Add a word if it is new and return its index.
    pub fn insert(&mut self, word: String) -> WordIndex {
        if let Some(&idx) = self.index.get(&word) {
            return idx;
        }
        let idx = self.words.len() as WordIndex;
        match word.as_str() {
            BEGIN_SENTENCE => self.begin_sentence = idx,
            END_SENTENCE => self.end_sentence = idx,
            _ => {}
        }
        self.index.insert(word.clone(), idx);
        self.words.push(word);
        idx
    }

    pub fn index(&self, word: &str) -> WordIndex {
        self.index.get(word).copied().unwrap_or(NOT_FOUND)
    }

    pub fn word(&self, idx: WordIndex) -> Option<&str> {
        self.words.get(idx as usize).map(String::as_str)
    }

    pub fn is_known(&self, idx: WordIndex) -> bool {
        idx != NOT_FOUND
    }

    pub fn begin_sentence(&self) -> WordIndex {
        self.begin_sentence
    }

    pub fn end_sentence(&self) -> WordIndex {
        self.end_sentence
    }

    pub fn len(&self) -> usize {
        self.words.len()
    }

    pub fn is_empty(&self) -> bool {
        self.words.is_empty()
    }

    pub fn words(&self) -> impl Iterator<Item = &str> {
        self.words.iter().map(String::as_str)
    }
}

/// Translation from decoder ids to model indices.
///
/// Slot 0 always holds [`NOT_FOUND`]. The map grows to cover every id that is
/// registered and never shrinks; unregistered ids translate to `NOT_FOUND`.
#[derive(Debug, Clone)]
pub struct VocabularyMap {
    map: Vec<WordIndex>,
}

impl Default for VocabularyMap {
    fn default() -> Self {
        Self { map: vec![NOT_FOUND] }
    }
}

impl VocabularyMap {
    pub fn new() -> Self {
        Self::default()
    }

    /// Map `id` to `word`'s index in `vocab`. Returns true if `id` already
    /// had a mapping, which is overwritten.
    pub fn register(&mut self, vocab: &Vocabulary, id: ExternalId, word: &str) -> bool {
        let slot = id as usize;
        if self.map.len() <= slot {
            self.map.resize(slot + 1, NOT_FOUND);
        }
        let already_present = self.map[slot] != NOT_FOUND;
        self.map[slot] = vocab.index(word);
        already_present
    }

    pub fn get(&self, id: ExternalId) -> WordIndex {
        self.map.get(id as usize).copied().unwrap_or(NOT_FOUND)
    }

    pub fn translate(&self, ids: &[ExternalId]) -> Vec<WordIndex> {
        ids.iter().map(|&id| self.get(id)).collect()
    }

    pub fn is_out_of_vocabulary(&self, vocab: &Vocabulary, id: ExternalId) -> bool {
        !vocab.is_known(self.get(id))
    }

    pub fn len(&self) -> usize {
        self.map.len()
    }

    pub fn is_empty(&self) -> bool {
        self.map.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn vocab() -> Vocabulary {
        Vocabulary::new(["<s>", "</s>", "a", "b"])
    }

    #[test]
    fn it_reserves_unk() {
        let vocab = vocab();
        assert_eq!(NOT_FOUND, vocab.index(UNK));
        assert_eq!(NOT_FOUND, vocab.index("zebra"));
        assert_eq!(1, vocab.begin_sentence());
        assert_eq!(2, vocab.end_sentence());
        assert_eq!(5, vocab.len());
        // Listing <unk> again does not move it
        let again = Vocabulary::new(["<unk>", "a"]);
        assert_eq!(2, again.len());
        assert_eq!(1, again.index("a"));
    }

    #[test]
    fn it_registers_and_overwrites() {
        let vocab = vocab();
        let mut map = VocabularyMap::new();
        assert!(!map.register(&vocab, 7, "a"));
        assert_eq!(8, map.len());
        assert_eq!(3, map.get(7));
        assert_eq!(NOT_FOUND, map.get(3));
        assert!(map.register(&vocab, 7, "b"));
        assert_eq!(4, map.get(7));
    }

    #[test]
    fn it_treats_unregistered_ids_as_unknown() {
        let vocab = vocab();
        let mut map = VocabularyMap::new();
        map.register(&vocab, 2, "a");
        assert!(map.is_out_of_vocabulary(&vocab, 1));
        assert!(map.is_out_of_vocabulary(&vocab, 1000));
        assert!(!map.is_out_of_vocabulary(&vocab, 2));
        // A registered word the model does not know is still OOV
        assert!(!map.register(&vocab, 5, "zebra"));
        assert!(map.is_out_of_vocabulary(&vocab, 5));
        assert_eq!(vec![NOT_FOUND, 3, NOT_FOUND], map.translate(&[0, 2, 99]));
    }
}
