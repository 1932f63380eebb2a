//! Boundary states threaded through scoring.
//!
//! Equality and hashing only look at the live prefix of each array, so two
//! states with the same context compare equal whatever stale words lie
//! beyond their length.

use std::hash::{Hash, Hasher};

use crate::vocab::WordIndex;

/// Highest N-Gram order any model may have
pub const MAX_ORDER: usize = 6;

/// Right context: the words a following word may condition on.
#[derive(Debug, Clone, Copy, Default)]
pub struct State {
    /// Most recent word first
    pub words: [WordIndex; MAX_ORDER - 1],
    /// `backoff[i]` is the backoff of the context `words[..=i]`
    pub backoff: [f32; MAX_ORDER - 1],
    pub length: u8,
}

impl State {
    pub fn words(&self) -> &[WordIndex] {
        &self.words[..self.length as usize]
    }

    pub fn backoffs(&self) -> &[f32] {
        &self.backoff[..self.length as usize]
    }
}

impl PartialEq for State {
    // Backoffs are a function of the words
    fn eq(&self, other: &Self) -> bool {
        self.words() == other.words()
    }
}

impl Eq for State {}

impl Hash for State {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.words().hash(state);
    }
}

/// Left context: the leading words of a constituent whose probabilities
/// were charged as lower-order estimates and can still change once words
/// appear to their left.
#[derive(Debug, Clone, Copy, Default)]
pub struct Left {
    /// Leading words in written order
    pub words: [WordIndex; MAX_ORDER - 1],
    pub length: u8,
    /// No word to the left can change this constituent's score
    pub full: bool,
}

impl Left {
    pub fn words(&self) -> &[WordIndex] {
        &self.words[..self.length as usize]
    }

    pub(crate) fn push(&mut self, word: WordIndex) {
        self.words[self.length as usize] = word;
        self.length += 1;
    }
}

impl PartialEq for Left {
    fn eq(&self, other: &Self) -> bool {
        self.full == other.full && self.words() == other.words()
    }
}

impl Eq for Left {}

impl Hash for Left {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.words().hash(state);
        self.full.hash(state);
    }
}

/// Everything needed to place a scored constituent between other words
/// later: its left and right boundary contexts.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
pub struct ChartState {
    pub left: Left,
    pub right: State,
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::hash_map::DefaultHasher;

    fn hash_of<T: Hash>(value: &T) -> u64 {
        let mut hasher = DefaultHasher::new();
        value.hash(&mut hasher);
        hasher.finish()
    }

    #[test]
    fn it_ignores_stale_words() {
        let mut first = ChartState::default();
        first.right.words = [4, 5, 9, 9, 9];
        first.right.length = 2;
        first.left.words = [4, 7, 7, 7, 7];
        first.left.length = 1;
        let mut second = first;
        second.right.words[3] = 1;
        second.left.words[2] = 1;
        assert_eq!(first, second);
        assert_eq!(hash_of(&first), hash_of(&second));
        second.left.full = true;
        assert_ne!(first, second);
        second.left.full = false;
        second.right.length = 3;
        assert_ne!(first, second);
    }

    #[test]
    fn it_pushes_left_words() {
        let mut left = Left::default();
        left.push(3);
        left.push(8);
        assert_eq!(&[3, 8], left.words());
    }
}
