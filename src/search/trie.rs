use anyhow::{bail, Result};
use serde::{Deserialize, Serialize};

use super::{NGramWeights, Search};
use crate::arpa::NGramTable;
use crate::vocab::WordIndex;

#[derive(Debug, Clone, Serialize, Deserialize)]
struct TrieNode {
    word: WordIndex,
    weights: NGramWeights,
    /// Offset of the first child in the next level
    children: u32,
}

/// Trie over reversed N-Grams. Each level is one array sorted by parent
/// then word, so the children of a node are a contiguous range found by
/// comparing offsets with the following node.
#[derive(Debug, Serialize, Deserialize)]
pub struct TrieSearch {
    levels: Vec<Vec<TrieNode>>,
}

impl TrieSearch {
    pub fn build(table: &NGramTable) -> Self {
        let mut entries = table.reversed_entries();
        for level in entries.iter_mut() {
            level.sort_by(|a, b| a.0.cmp(&b.0));
        }
        let mut levels: Vec<Vec<TrieNode>> = entries
            .iter()
            .map(|level| {
                level
                    .iter()
                    .map(|(key, weights)| TrieNode {
                        word: key[key.len() - 1],
                        weights: *weights,
                        children: 0,
                    })
                    .collect()
            })
            .collect();
        for n in 1..entries.len() {
            let children = &entries[n];
            for (i, (parent, _)) in entries[n - 1].iter().enumerate() {
                let offset = children.partition_point(|(key, _)| key[..n] < parent[..]);
                levels[n - 1][i].children = offset as u32;
            }
        }
        Self { levels }
    }

    /// Check a structure read from a file: child offsets must not
    /// decrease and must stay within the next level.
    pub fn validate(&self) -> Result<()> {
        for (level, pair) in self.levels.windows(2).enumerate() {
            let (nodes, next) = (&pair[0], &pair[1]);
            let mut previous = 0;
            for node in nodes {
                let offset = node.children as usize;
                if offset < previous || offset > next.len() {
                    bail!(
                        "{}-gram children at offset {} outside {}..={}",
                        level + 1,
                        offset,
                        previous,
                        next.len()
                    );
                }
                previous = offset;
            }
        }
        Ok(())
    }

    fn child_range(&self, level: usize, i: usize) -> (usize, usize) {
        let nodes = &self.levels[level];
        let begin = nodes[i].children as usize;
        let end = match nodes.get(i + 1) {
            Some(next) => next.children as usize,
            None => self.levels.get(level + 1).map_or(0, Vec::len),
        };
        (begin, end)
    }
}

impl Search for TrieSearch {
    fn order(&self) -> u8 {
        self.levels.len() as u8
    }

    fn find(&self, reversed: &[WordIndex]) -> Option<NGramWeights> {
        if reversed.is_empty() || reversed.len() > self.levels.len() {
            return None;
        }
        let mut i = self.levels[0]
            .binary_search_by_key(&reversed[0], |node| node.word)
            .ok()?;
        for (level, &word) in reversed.iter().enumerate().skip(1) {
            let (begin, end) = self.child_range(level - 1, i);
            let offset = self.levels[level][begin..end]
                .binary_search_by_key(&word, |node| node.word)
                .ok()?;
            i = begin + offset;
        }
        Some(self.levels[reversed.len() - 1][i].weights)
    }
}
