//! Model files: recognizing them, loading them behind a [`LanguageModel`]
//! and writing the binary forms.
//!
//! Native binary files start with [`MAGIC`] and a byte naming the
//! representation, followed by the vocabulary and search structure in
//! bincode. FST models are stored as OpenFST binaries. Anything else is
//! read as ARPA text.

use anyhow::{anyhow, bail, Context, Result};
use log::{debug, info};
use rustfst::prelude::*;
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::fs::File;
use std::io::{BufReader, BufWriter, Read, Write};
use std::path::Path;

use crate::arpa::NGramTable;
use crate::config::Config;
use crate::error::LmError;
use crate::facade::{LanguageModel, MappedModel};
use crate::make::NGramFstMaker;
use crate::model::NGramModel;
use crate::search::{FstSearch, ModelType, ProbingSearch, Search, TrieSearch};
use crate::state::MAX_ORDER;
use crate::vocab::Vocabulary;
use crate::StdVectorFst;

pub const MAGIC: &[u8; 8] = b"NGRSBIN\x01";
/// First four bytes of an OpenFST binary, as a little-endian i32
pub const OPENFST_MAGIC: i32 = 2125659606;

/// What a model file turned out to be
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Format {
    Arpa,
    Native(ModelType),
    OpenFst,
}

/// Look at the first bytes of `path` to decide how to load it.
pub fn recognize(path: &Path) -> Result<Format> {
    let fh = File::open(path).with_context(|| format!("opening {}", path.display()))?;
    let mut head = Vec::with_capacity(MAGIC.len() + 1);
    fh.take(MAGIC.len() as u64 + 1).read_to_end(&mut head)?;
    if head.starts_with(MAGIC) {
        let tag = *head
            .get(MAGIC.len())
            .ok_or_else(|| anyhow!("{} is truncated", path.display()))?;
        return match ModelType::from_tag(tag) {
            Some(ModelType::Fst) | None => bail!("{} has unknown representation tag {}", path.display(), tag),
            Some(model_type) => Ok(Format::Native(model_type)),
        };
    }
    if head.len() >= 4 && i32::from_le_bytes([head[0], head[1], head[2], head[3]]) == OPENFST_MAGIC {
        return Ok(Format::OpenFst);
    }
    Ok(Format::Arpa)
}

/// Load a model in whatever format `path` holds. Failure here means the
/// model cannot be used at all.
pub fn load(path: &Path, config: &Config) -> Result<Box<dyn LanguageModel>, LmError> {
    let lm = load_model(path, config)
        .with_context(|| format!("cannot load language model {}", path.display()))
        .map_err(LmError::FatalConfiguration)?;
    info!(
        "loaded {} model {} (order {}, {} words)",
        lm.representation(),
        path.display(),
        lm.order(),
        lm.vocabulary().len()
    );
    Ok(lm)
}

fn load_model(path: &Path, config: &Config) -> Result<Box<dyn LanguageModel>> {
    let format = recognize(path)?;
    debug!("{} recognized as {:?}", path.display(), format);
    match format {
        Format::Native(ModelType::Probing) => {
            let (vocabulary, search): (Vocabulary, ProbingSearch) = read_native(path)?;
            search.validate(vocabulary.len())?;
            boxed(search, vocabulary, ModelType::Probing)
        }
        Format::Native(model_type) => {
            let (vocabulary, search): (Vocabulary, TrieSearch) = read_native(path)?;
            search.validate()?;
            boxed(search, vocabulary, model_type)
        }
        Format::OpenFst => {
            let fst = StdVectorFst::read(path)?;
            let search = FstSearch::new(fst)?;
            let vocabulary = search.vocabulary().clone();
            boxed(search, vocabulary, ModelType::Fst)
        }
        Format::Arpa => {
            let table = NGramTable::read_arpa(path, config.unknown_missing_logprob)?;
            from_table(table, config.arpa_representation, config)
        }
    }
}

/// Build the representation `model_type` in memory.
pub fn from_table(table: NGramTable, model_type: ModelType, config: &Config) -> Result<Box<dyn LanguageModel>> {
    match model_type {
        ModelType::Probing => {
            let search = ProbingSearch::build(&table, config.probing_multiplier);
            boxed(search, table.vocabulary, model_type)
        }
        ModelType::Trie => {
            let search = TrieSearch::build(&table);
            boxed(search, table.vocabulary, model_type)
        }
        ModelType::Fst => {
            let search = FstSearch::new(NGramFstMaker::new(&table).make()?)?;
            boxed(search, table.vocabulary, model_type)
        }
    }
}

fn boxed<S: Search + 'static>(
    search: S,
    vocabulary: Vocabulary,
    model_type: ModelType,
) -> Result<Box<dyn LanguageModel>> {
    let order = search.order() as usize;
    if order == 0 || order > MAX_ORDER {
        bail!("model order {} is outside 1..={}", order, MAX_ORDER);
    }
    Ok(Box::new(MappedModel::new(NGramModel::new(search, vocabulary), model_type)))
}

fn read_native<T: DeserializeOwned>(path: &Path) -> Result<T> {
    let mut reader = BufReader::new(File::open(path)?);
    let mut head = [0u8; MAGIC.len() + 1];
    reader.read_exact(&mut head)?;
    let payload = bincode::deserialize_from(reader)
        .with_context(|| format!("decoding {}", path.display()))?;
    Ok(payload)
}

fn write_native<T: Serialize>(model_type: ModelType, payload: &T, path: &Path) -> Result<()> {
    let mut writer = BufWriter::new(File::create(path)?);
    writer.write_all(MAGIC)?;
    writer.write_all(&[model_type.tag()])?;
    bincode::serialize_into(&mut writer, payload)?;
    writer.flush()?;
    Ok(())
}

/// Write `table` to `path` in the binary form of `model_type`.
pub fn write_binary(table: &NGramTable, model_type: ModelType, path: &Path, config: &Config) -> Result<()> {
    match model_type {
        ModelType::Probing => {
            let search = ProbingSearch::build(table, config.probing_multiplier);
            write_native(model_type, &(&table.vocabulary, &search), path)?;
        }
        ModelType::Trie => {
            let search = TrieSearch::build(table);
            write_native(model_type, &(&table.vocabulary, &search), path)?;
        }
        ModelType::Fst => {
            let fst = NGramFstMaker::new(table).make()?;
            fst.write(path)?;
        }
    }
    info!("wrote {} model to {}", model_type, path.display());
    Ok(())
}
