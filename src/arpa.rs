use anyhow::{anyhow, bail, Context, Result};
use log::{debug, warn};
use std::collections::HashSet;
use std::fs::File;
use std::io::prelude::*;
use std::io::BufReader;
use std::path::Path;

use crate::search::NGramWeights;
use crate::state::MAX_ORDER;
use crate::vocab::{Vocabulary, WordIndex, BEGIN_SENTENCE, END_SENTENCE, NOT_FOUND, UNK};

/// Most records reserved per section before any are read
const PREALLOCATE_LIMIT: usize = 1 << 20;

/// One line of an ARPA file
#[derive(Debug, Clone, PartialEq)]
pub struct NGramRecord {
    /// Words in written order
    pub words: Vec<WordIndex>,
    /// Log10 probability
    pub prob: f32,
    /// Log10 backoff (0 if absent)
    pub backoff: f32,
}

/// All N-Grams of a model, grouped by order, with the vocabulary they
/// are written in. Every representation is built from this.
#[derive(Debug)]
pub struct NGramTable {
    pub vocabulary: Vocabulary,
    /// `orders[n - 1]` holds the N-Grams of length n
    pub orders: Vec<Vec<NGramRecord>>,
}

#[derive(PartialEq)]
enum Section {
    Start,
    Data,
    NGrams(usize),
    End,
}

impl NGramTable {
    pub fn order(&self) -> u8 {
        self.orders.len() as u8
    }

    pub fn len(&self) -> usize {
        self.orders.iter().map(Vec::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Read an ARPA file
    pub fn read_arpa(path: &Path, unknown_missing_logprob: f32) -> Result<Self> {
        let fh = File::open(path).with_context(|| format!("opening {}", path.display()))?;
        Self::parse_arpa(BufReader::new(fh), unknown_missing_logprob)
            .with_context(|| format!("reading ARPA file {}", path.display()))
    }

    pub fn parse_arpa<R: BufRead>(reader: R, unknown_missing_logprob: f32) -> Result<Self> {
        let mut vocabulary = Vocabulary::new(std::iter::empty::<String>());
        let mut counts: Vec<usize> = Vec::new();
        let mut orders: Vec<Vec<NGramRecord>> = Vec::new();
        let mut unk: Option<NGramRecord> = None;
        let mut section = Section::Start;
        for (lineno, line) in reader.lines().enumerate() {
            let line = line?;
            let line = line.trim();
            let lineno = lineno + 1;
            if line.is_empty() {
                continue;
            }
            if line == "\\data\\" {
                section = Section::Data;
                continue;
            }
            if line == "\\end\\" {
                section = Section::End;
                break;
            }
            if let Some(n) = line
                .strip_prefix('\\')
                .and_then(|s| s.strip_suffix("-grams:"))
            {
                let n: usize = n
                    .parse()
                    .map_err(|_| anyhow!("line {}: bad section header {:?}", lineno, line))?;
                if n != orders.len() + 1 || n > counts.len() {
                    bail!("line {}: unexpected {}-gram section", lineno, n);
                }
                // Header counts are only a hint
                orders.push(Vec::with_capacity(counts[n - 1].min(PREALLOCATE_LIMIT)));
                section = Section::NGrams(n);
                continue;
            }
            match section {
                Section::Start => continue,
                Section::Data => {
                    let (n, count) = line
                        .strip_prefix("ngram ")
                        .and_then(|s| s.split_once('='))
                        .ok_or_else(|| anyhow!("line {}: expected ngram count, got {:?}", lineno, line))?;
                    let n: usize = n.trim().parse()?;
                    if n != counts.len() + 1 {
                        bail!("line {}: counts out of order", lineno);
                    }
                    if n > MAX_ORDER {
                        bail!("order {} exceeds the maximum of {}", n, MAX_ORDER);
                    }
                    counts.push(count.trim().parse()?);
                }
                Section::NGrams(n) => {
                    let mut fields = line.split_whitespace();
                    let prob: f32 = fields
                        .next()
                        .ok_or_else(|| anyhow!("line {}: empty n-gram", lineno))?
                        .parse()
                        .with_context(|| format!("line {}: bad probability", lineno))?;
                    let mut words = Vec::with_capacity(n);
                    for _ in 0..n {
                        let word = fields
                            .next()
                            .ok_or_else(|| anyhow!("line {}: expected {} words", lineno, n))?;
                        if n == 1 {
                            words.push(vocabulary.insert(word.to_string()));
                        } else {
                            let idx = vocabulary.index(word);
                            if idx == NOT_FOUND && word != UNK {
                                bail!("line {}: word {:?} is not a unigram", lineno, word);
                            }
                            words.push(idx);
                        }
                    }
                    let backoff = match fields.next() {
                        Some(b) => b
                            .parse()
                            .with_context(|| format!("line {}: bad backoff", lineno))?,
                        None => 0.0,
                    };
                    if fields.next().is_some() {
                        bail!("line {}: trailing fields", lineno);
                    }
                    let record = NGramRecord {
                        words,
                        prob,
                        backoff,
                    };
                    if n == 1 && record.words[0] == NOT_FOUND {
                        unk = Some(record);
                    } else {
                        orders[n - 1].push(record);
                    }
                }
                Section::End => break,
            }
        }
        if section != Section::End {
            bail!("missing \\end\\ marker");
        }
        if orders.len() != counts.len() || orders.is_empty() {
            bail!("expected {} n-gram sections, found {}", counts.len(), orders.len());
        }
        let unk = unk.unwrap_or_else(|| {
            warn!(
                "language model has no {}; assuming log10 probability {}",
                UNK, unknown_missing_logprob
            );
            NGramRecord {
                words: vec![NOT_FOUND],
                prob: unknown_missing_logprob,
                backoff: 0.0,
            }
        });
        orders[0].insert(0, unk);
        for (n, (records, &count)) in orders.iter().zip(counts.iter()).enumerate() {
            // The synthesized <unk> is not counted in the header
            let found = if n == 0 { records.len() - 1 } else { records.len() };
            if found != count && records.len() != count {
                warn!("header declares {} {}-grams but found {}", count, n + 1, found);
            }
        }
        for word in [BEGIN_SENTENCE, END_SENTENCE] {
            if vocabulary.index(word) == NOT_FOUND {
                bail!("language model has no {}", word);
            }
        }
        let table = Self { vocabulary, orders };
        table.check_structure()?;
        Ok(table)
    }

    /// Every N-Gram's prefix and suffix must themselves be N-Grams
    fn check_structure(&self) -> Result<()> {
        for n in 2..=self.orders.len() {
            let lower: HashSet<&[WordIndex]> =
                self.orders[n - 2].iter().map(|r| r.words.as_slice()).collect();
            for record in &self.orders[n - 1] {
                if !lower.contains(&record.words[..n - 1]) {
                    bail!("{}-gram {:?} has no prefix", n, self.spell(&record.words));
                }
                if !lower.contains(&record.words[1..]) {
                    bail!("{}-gram {:?} has no suffix", n, self.spell(&record.words));
                }
            }
        }
        Ok(())
    }

    pub fn spell(&self, words: &[WordIndex]) -> String {
        words
            .iter()
            .map(|&w| self.vocabulary.word(w).unwrap_or(UNK))
            .collect::<Vec<_>>()
            .join(" ")
    }

    /// Weights for every N-Gram, keyed by the N-Gram in reverse order (the
    /// predicted word first, then its history from nearest to farthest).
    ///
    /// Backoffs of N-Grams that are the context of nothing are dropped to 0
    /// so that minimized states and explicit contexts score the same.
    pub fn reversed_entries(&self) -> Vec<Vec<(Vec<WordIndex>, NGramWeights)>> {
        let order = self.orders.len();
        let mut extended: HashSet<&[WordIndex]> = HashSet::new();
        let mut left_extended: HashSet<&[WordIndex]> = HashSet::new();
        for records in self.orders.iter().skip(1) {
            for record in records {
                let n = record.words.len();
                extended.insert(&record.words[..n - 1]);
                left_extended.insert(&record.words[1..]);
            }
        }
        let mut dropped = 0;
        let entries = self
            .orders
            .iter()
            .enumerate()
            .map(|(n, records)| {
                records
                    .iter()
                    .map(|record| {
                        let words = record.words.as_slice();
                        let has_extension = n + 1 < order && extended.contains(words);
                        if !has_extension && record.backoff != 0.0 {
                            dropped += 1;
                        }
                        let weights = NGramWeights {
                            prob: record.prob,
                            backoff: if has_extension { record.backoff } else { 0.0 },
                            independent_left: n + 1 == order || !left_extended.contains(words),
                            has_extension,
                        };
                        (words.iter().rev().copied().collect(), weights)
                    })
                    .collect()
            })
            .collect();
        if dropped > 0 {
            debug!("ignored {} backoffs of n-grams that extend nothing", dropped);
        }
        entries
    }

    /// Contexts that some longer N-Gram extends, in written order.
    pub fn contexts(&self) -> HashSet<&[WordIndex]> {
        self.orders
            .iter()
            .skip(1)
            .flatten()
            .map(|r| &r.words[..r.words.len() - 1])
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;

    #[test]
    fn it_reads_arpa() {
        let table = NGramTable::read_arpa(&PathBuf::from("testdata/tiny.arpa"), -100.0).unwrap();
        assert_eq!(3, table.order());
        assert_eq!(vec![7, 8, 5], table.orders.iter().map(Vec::len).collect::<Vec<_>>());
        assert_eq!(7, table.vocabulary.len());
        let a = table.vocabulary.index("a");
        let b = table.vocabulary.index("b");
        let ab = table.orders[1].iter().find(|r| r.words == [a, b]).unwrap();
        assert_eq!(-0.3, ab.prob);
        assert_eq!(-0.2, ab.backoff);
        assert_eq!("a b", table.spell(&ab.words));
    }

    #[test]
    fn it_synthesizes_unk() {
        let table = NGramTable::read_arpa(&PathBuf::from("testdata/nounk.arpa"), -42.0).unwrap();
        assert_eq!(2, table.order());
        let unk = &table.orders[0][0];
        assert_eq!(vec![NOT_FOUND], unk.words);
        assert_eq!(-42.0, unk.prob);
    }

    #[test]
    fn it_flags_extensions() {
        let table = NGramTable::read_arpa(&PathBuf::from("testdata/tiny.arpa"), -100.0).unwrap();
        let v = &table.vocabulary;
        let entries = table.reversed_entries();
        let find = |words: &[&str]| {
            let key: Vec<WordIndex> = words.iter().rev().map(|w| v.index(w)).collect();
            entries[words.len() - 1]
                .iter()
                .find(|(k, _)| *k == key)
                .map(|(_, w)| *w)
                .unwrap()
        };
        let ab = find(&["a", "b"]);
        assert!(ab.has_extension);
        assert!(!ab.independent_left);
        let cd = find(&["c", "d"]);
        assert!(!cd.has_extension);
        // Only "b c d" ends with "c d"
        assert!(!cd.independent_left);
        let bs = find(&["b", "</s>"]);
        assert!(bs.independent_left);
        assert!(find(&["a", "b", "c"]).independent_left);
        // <unk> extends nothing, so its listed backoff of 0 stays 0
        let unk = find(&["<unk>"]);
        assert!(!unk.has_extension);
        assert_eq!(0.0, unk.backoff);
    }

    #[test]
    fn it_rejects_broken_files() {
        let well_formed = "\\data\\\nngram 1=3\nngram 2=1\n\n\\1-grams:\n-1\t<s>\n-1\t</s>\n-1\ta\n\n\\2-grams:\n-0.5\t<s> a\n\n\\end\\\n";
        assert!(NGramTable::parse_arpa(well_formed.as_bytes(), -100.0).is_ok());
        let orphan = "\\data\\\nngram 1=3\nngram 2=1\n\n\\1-grams:\n-1\t<s>\n-1\t</s>\n-1\ta\n\n\\2-grams:\n-0.5\tq a\n\n\\end\\\n";
        assert!(NGramTable::parse_arpa(orphan.as_bytes(), -100.0).is_err());
        let truncated = "\\data\\\nngram 1=1\n\n\\1-grams:\n-1\t<s>\n";
        assert!(NGramTable::parse_arpa(truncated.as_bytes(), -100.0).is_err());
        let no_end = "\\data\\\nngram 1=1\n\n\\1-grams:\n-1\t<s>\n\n\\end\\\n";
        let err = NGramTable::parse_arpa(no_end.as_bytes(), -100.0).unwrap_err();
        assert!(err.to_string().contains("</s>"));
    }

    #[test]
    fn it_caps_the_order() {
        let table = NGramTable::read_arpa(&PathBuf::from("testdata/six.arpa"), -100.0).unwrap();
        assert_eq!(6, table.order());
        assert_eq!(14, table.orders[5].len());
        let seven = "\\data\\\nngram 1=3\nngram 2=1\nngram 3=0\nngram 4=0\nngram 5=0\nngram 6=0\nngram 7=0\n";
        let err = NGramTable::parse_arpa(seven.as_bytes(), -100.0).unwrap_err();
        assert!(err.to_string().contains("exceeds the maximum"));
    }

    #[test]
    fn it_does_not_trust_header_counts() {
        let huge = "\\data\\\nngram 1=18446744073709551615\n\n\\1-grams:\n-1\t<s>\n-1\t</s>\n-1\ta\n\n\\end\\\n";
        let table = NGramTable::parse_arpa(huge.as_bytes(), -100.0).unwrap();
        assert_eq!(4, table.orders[0].len());
    }
}
