use anyhow::{bail, Result};
use serde::{Deserialize, Serialize};

use super::{NGramWeights, Search};
use crate::arpa::NGramTable;
use crate::vocab::WordIndex;

/// Fold one more word into the hash of a reversed N-Gram
fn combine_word_hash(current: u64, next: WordIndex) -> u64 {
    current.wrapping_mul(8978948897894561157) ^ (1 + next as u64).wrapping_mul(17894857484156487943)
}

fn hash_reversed(reversed: &[WordIndex]) -> u64 {
    let mut hash = reversed[0] as u64;
    for &word in &reversed[1..] {
        hash = combine_word_hash(hash, word);
    }
    hash
}

/// Open addressing table for N-Grams of one length. Keys are 64-bit
/// hashes; distinct N-Grams that collide are not told apart.
#[derive(Debug, Serialize, Deserialize)]
struct ProbingTable {
    buckets: Vec<Option<(u64, NGramWeights)>>,
}

impl ProbingTable {
    fn with_entries(entries: usize, multiplier: f32) -> Self {
        let size = ((entries as f32 * multiplier) as usize).max(entries + 1);
        Self {
            buckets: vec![None; size],
        }
    }

    fn ideal(&self, key: u64) -> usize {
        (key % self.buckets.len() as u64) as usize
    }

    fn insert(&mut self, key: u64, weights: NGramWeights) {
        let mut i = self.ideal(key);
        loop {
            match self.buckets[i] {
                Some((k, _)) if k != key => i = (i + 1) % self.buckets.len(),
                _ => {
                    self.buckets[i] = Some((key, weights));
                    return;
                }
            }
        }
    }

    fn find(&self, key: u64) -> Option<NGramWeights> {
        let mut i = self.ideal(key);
        loop {
            match self.buckets[i] {
                None => return None,
                Some((k, weights)) if k == key => return Some(weights),
                Some(_) => i = (i + 1) % self.buckets.len(),
            }
        }
    }
}

/// Unigrams in an array indexed by word, longer N-Grams in one probing
/// hash table per order.
#[derive(Debug, Serialize, Deserialize)]
pub struct ProbingSearch {
    unigrams: Vec<NGramWeights>,
    /// `middle[n - 2]` holds N-Grams of length n
    middle: Vec<ProbingTable>,
}

impl ProbingSearch {
    pub fn build(table: &NGramTable, multiplier: f32) -> Self {
        let mut entries = table.reversed_entries().into_iter();
        let mut unigrams = vec![NGramWeights::default(); table.vocabulary.len()];
        for (key, weights) in entries.next().unwrap_or_default() {
            unigrams[key[0] as usize] = weights;
        }
        let middle = entries
            .map(|ngrams| {
                let mut probing = ProbingTable::with_entries(ngrams.len(), multiplier);
                for (key, weights) in ngrams {
                    probing.insert(hash_reversed(&key), weights);
                }
                probing
            })
            .collect();
        Self { unigrams, middle }
    }

    /// Check a structure read from a file. Every table needs an empty
    /// bucket or a lookup of a missing key would never stop.
    pub fn validate(&self, vocabulary_len: usize) -> Result<()> {
        if self.unigrams.len() != vocabulary_len {
            bail!(
                "{} unigrams for a vocabulary of {} words",
                self.unigrams.len(),
                vocabulary_len
            );
        }
        for (n, probing) in self.middle.iter().enumerate() {
            if !probing.buckets.iter().any(Option::is_none) {
                bail!("{}-gram table has no empty bucket", n + 2);
            }
        }
        Ok(())
    }
}

impl Search for ProbingSearch {
    fn order(&self) -> u8 {
        self.middle.len() as u8 + 1
    }

    fn find(&self, reversed: &[WordIndex]) -> Option<NGramWeights> {
        match reversed.len() {
            0 => None,
            1 => self.unigrams.get(reversed[0] as usize).copied(),
            n => self
                .middle
                .get(n - 2)
                .and_then(|probing| probing.find(hash_reversed(reversed))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;

    #[test]
    fn it_hashes_in_order() {
        assert_eq!(7, hash_reversed(&[7]));
        assert_ne!(hash_reversed(&[1, 2]), hash_reversed(&[2, 1]));
        assert_ne!(hash_reversed(&[1, 2]), hash_reversed(&[1, 2, 0]));
    }

    #[test]
    fn it_steps_past_collisions() {
        let mut probing = ProbingTable::with_entries(3, 1.0);
        assert_eq!(4, probing.buckets.len());
        let weights = |prob| NGramWeights {
            prob,
            ..Default::default()
        };
        // 1, 5 and 9 share a bucket
        probing.insert(1, weights(-1.0));
        probing.insert(5, weights(-5.0));
        probing.insert(9, weights(-9.0));
        assert_eq!(Some(-5.0), probing.find(5).map(|w| w.prob));
        assert_eq!(Some(-9.0), probing.find(9).map(|w| w.prob));
        assert_eq!(None, probing.find(13));
        probing.insert(5, weights(-0.5));
        assert_eq!(Some(-0.5), probing.find(5).map(|w| w.prob));
    }

    #[test]
    fn it_validates_tables() {
        let table = NGramTable::read_arpa(&PathBuf::from("testdata/tiny.arpa"), -100.0).unwrap();
        let mut search = ProbingSearch::build(&table, 1.0);
        assert!(search.validate(table.vocabulary.len()).is_ok());
        assert!(search.validate(table.vocabulary.len() + 1).is_err());
        for bucket in search.middle[0].buckets.iter_mut() {
            bucket.get_or_insert((0, NGramWeights::default()));
        }
        assert!(search.validate(table.vocabulary.len()).is_err());
        search.middle[0].buckets.clear();
        assert!(search.validate(table.vocabulary.len()).is_err());
    }
}
