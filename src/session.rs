//! Flat interface for a decoder: models and charts live in tables owned by
//! a [`Session`] and are named by opaque handles. Everything crossing this
//! boundary is a number, a string, or a slice of either.
//!
//! Handles carry a generation, so a handle to something destroyed is
//! rejected instead of reaching whatever took its slot. Word ids arrive
//! signed, as decoders use negative ids for non-terminals, and are checked
//! before use.

use log::debug;
use std::path::Path;

use crate::binary;
use crate::chart::{Chart, StateIndex};
use crate::config::Config;
use crate::error::LmError;
use crate::facade::LanguageModel;
use crate::rule::Token;
use crate::state::ChartState;
use crate::vocab::{ExternalId, WordIndex};

#[derive(Debug)]
struct Slot<T> {
    generation: u32,
    value: Option<T>,
}

/// Values addressed by `generation << 32 | index`. Generations start at
/// 1, so no handle is ever 0.
#[derive(Debug)]
struct Slots<T> {
    slots: Vec<Slot<T>>,
    free: Vec<u32>,
}

impl<T> Default for Slots<T> {
    fn default() -> Self {
        Self {
            slots: Vec::new(),
            free: Vec::new(),
        }
    }
}

impl<T> Slots<T> {
    fn insert(&mut self, value: T) -> u64 {
        let index = match self.free.pop() {
            Some(index) => index,
            None => {
                self.slots.push(Slot {
                    generation: 1,
                    value: None,
                });
                self.slots.len() as u32 - 1
            }
        };
        let slot = &mut self.slots[index as usize];
        slot.value = Some(value);
        (slot.generation as u64) << 32 | index as u64
    }

    fn slot(&self, raw: u64) -> Option<&Slot<T>> {
        let slot = self.slots.get(raw as u32 as usize)?;
        (slot.generation == (raw >> 32) as u32).then_some(slot)
    }

    fn get(&self, raw: u64) -> Option<&T> {
        self.slot(raw)?.value.as_ref()
    }

    fn get_mut(&mut self, raw: u64) -> Option<&mut T> {
        self.slot(raw)?;
        self.slots[raw as u32 as usize].value.as_mut()
    }

    fn remove(&mut self, raw: u64) -> Option<T> {
        self.slot(raw)?;
        let index = raw as u32;
        let slot = &mut self.slots[index as usize];
        let value = slot.value.take()?;
        slot.generation = slot.generation.wrapping_add(1).max(1);
        self.free.push(index);
        Some(value)
    }

    fn len(&self) -> usize {
        self.slots.len() - self.free.len()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ModelHandle(u64);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ChartHandle(u64);

impl ModelHandle {
    pub fn raw(self) -> u64 {
        self.0
    }

    pub fn from_raw(raw: u64) -> Self {
        Self(raw)
    }
}

impl ChartHandle {
    pub fn raw(self) -> u64 {
        self.0
    }

    pub fn from_raw(raw: u64) -> Self {
        Self(raw)
    }
}

/// Result of [`Session::score_rule`]: the chart handle of the rule's
/// state and its probability. Packs into 64 bits with the handle high and
/// the bits of the `f32` low.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct StateProb {
    pub state: StateIndex,
    pub prob: f32,
}

impl StateProb {
    pub fn pack(self) -> u64 {
        (self.state as u64) << 32 | self.prob.to_bits() as u64
    }

    pub fn unpack(packed: u64) -> Self {
        Self {
            state: (packed >> 32) as StateIndex,
            prob: f32::from_bits(packed as u32),
        }
    }
}

fn external_id(id: i64) -> Result<ExternalId, LmError> {
    if id < 0 {
        return Err(LmError::invalid(format!("id {} is a non-terminal, not a word", id)));
    }
    ExternalId::try_from(id).map_err(|_| LmError::invalid(format!("word id {} out of range", id)))
}

fn external_ids(ids: &[i64]) -> Result<Vec<ExternalId>, LmError> {
    ids.iter().map(|&id| external_id(id)).collect()
}

/// Models and charts of one decoder process.
#[derive(Default)]
pub struct Session {
    config: Config,
    models: Slots<Box<dyn LanguageModel>>,
    charts: Slots<Chart>,
}

impl Session {
    pub fn new(config: Config) -> Self {
        Self {
            config,
            ..Self::default()
        }
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    fn model(&self, handle: ModelHandle) -> Result<&dyn LanguageModel, LmError> {
        self.models
            .get(handle.0)
            .map(|lm| lm.as_ref())
            .ok_or_else(|| LmError::invalid(format!("no model with handle {:#x}", handle.0)))
    }

    fn chart(&mut self, handle: ChartHandle) -> Result<&mut Chart, LmError> {
        self.charts
            .get_mut(handle.0)
            .ok_or_else(|| LmError::invalid(format!("no chart with handle {:#x}", handle.0)))
    }

    /// Load a model. An error here means the file is unusable.
    pub fn construct(&mut self, path: &Path) -> Result<ModelHandle, LmError> {
        let lm = binary::load(path, &self.config)?;
        Ok(self.adopt(lm))
    }

    /// Take ownership of a model built some other way
    pub fn adopt(&mut self, lm: Box<dyn LanguageModel>) -> ModelHandle {
        ModelHandle(self.models.insert(lm))
    }

    pub fn destroy(&mut self, handle: ModelHandle) -> Result<(), LmError> {
        self.models
            .remove(handle.0)
            .map(drop)
            .ok_or_else(|| LmError::invalid(format!("no model with handle {:#x}", handle.0)))
    }

    pub fn num_models(&self) -> usize {
        self.models.len()
    }

    pub fn order(&self, handle: ModelHandle) -> Result<u8, LmError> {
        Ok(self.model(handle)?.order())
    }

    pub fn register_word(&mut self, handle: ModelHandle, word: &str, id: i64) -> Result<bool, LmError> {
        let id = external_id(id)?;
        if id > self.config.max_word_id {
            return Err(LmError::invalid(format!(
                "word id {} exceeds the maximum of {}",
                id, self.config.max_word_id
            )));
        }
        let lm = self
            .models
            .get_mut(handle.0)
            .ok_or_else(|| LmError::invalid(format!("no model with handle {:#x}", handle.0)))?;
        Ok(lm.register_word(word, id))
    }

    /// Probability of the last id given the others, ids in written order
    pub fn probability(&self, handle: ModelHandle, ids: &[i64]) -> Result<f32, LmError> {
        let ids = external_ids(ids)?;
        Ok(self.model(handle)?.probability(&ids))
    }

    pub fn probability_for_internal_ids(&self, handle: ModelHandle, words: &[WordIndex]) -> Result<f32, LmError> {
        Ok(self.model(handle)?.probability_for_internal_ids(words))
    }

    pub fn probability_for_words(&self, handle: ModelHandle, words: &[&str]) -> Result<f32, LmError> {
        Ok(self.model(handle)?.probability_for_words(words))
    }

    /// As [`Session::probability`], for callers that state the order they
    /// expect. Only the model order or the N-Gram's own length is served.
    pub fn ngram_probability(&self, handle: ModelHandle, ids: &[i64], order: usize) -> Result<f32, LmError> {
        let model_order = self.order(handle)? as usize;
        if order != model_order && order != ids.len() {
            return Err(LmError::invalid(format!(
                "cannot score a {}-gram at order {} with an order {} model",
                ids.len(),
                order,
                model_order
            )));
        }
        self.probability(handle, ids)
    }

    pub fn is_out_of_vocabulary(&self, handle: ModelHandle, id: i64) -> Result<bool, LmError> {
        let id = external_id(id)?;
        Ok(self.model(handle)?.is_out_of_vocabulary(id))
    }

    pub fn is_known_word(&self, handle: ModelHandle, word: &str) -> Result<bool, LmError> {
        Ok(self.model(handle)?.is_known_word(word))
    }

    /// Sum of the probabilities of `ids[start..]`; `start` counts from 0.
    pub fn sentence_probability(&self, handle: ModelHandle, ids: &[i64], start: usize) -> Result<f32, LmError> {
        let ids = external_ids(ids)?;
        Ok(self.model(handle)?.sentence_probability(&ids, start))
    }

    /// New chart for one sentence, with a rule buffer of
    /// `Config::max_rule_length` tokens.
    pub fn create_chart(&mut self) -> ChartHandle {
        let chart = Chart::new(self.config.chart_capacity, self.config.max_rule_length);
        let handle = ChartHandle(self.charts.insert(chart));
        debug!("created chart {:#x}", handle.0);
        handle
    }

    pub fn destroy_chart(&mut self, handle: ChartHandle) -> Result<(), LmError> {
        let chart = self
            .charts
            .remove(handle.0)
            .ok_or_else(|| LmError::invalid(format!("no chart with handle {:#x}", handle.0)))?;
        debug!("destroyed chart {:#x} holding {} states", handle.0, chart.len());
        Ok(())
    }

    pub fn num_charts(&self) -> usize {
        self.charts.len()
    }

    /// Put the next rule in a chart's buffer: word ids, and negated chart
    /// handles for constituents.
    pub fn write_rule(&mut self, handle: ChartHandle, encoded: &[i64]) -> Result<(), LmError> {
        self.chart(handle)?.buffer_mut().fill(encoded)
    }

    /// As [`Session::write_rule`], from a buffer whose first element is
    /// the number of tokens that follow
    pub fn write_rule_prefixed(&mut self, handle: ChartHandle, wire: &[i64]) -> Result<(), LmError> {
        self.chart(handle)?.buffer_mut().fill_prefixed(wire)
    }

    /// Score the rule in the chart's buffer and intern its state. Returns
    /// a packed [`StateProb`].
    pub fn score_rule(&mut self, model: ModelHandle, chart: ChartHandle) -> Result<u64, LmError> {
        let lm = self
            .models
            .get(model.0)
            .ok_or_else(|| LmError::invalid(format!("no model with handle {:#x}", model.0)))?;
        let chart = self
            .charts
            .get_mut(chart.0)
            .ok_or_else(|| LmError::invalid(format!("no chart with handle {:#x}", chart.0)))?;
        let rule = chart.buffer().decode()?;
        let mut out = ChartState::default();
        let prob = lm.score_rule(&rule, chart, &mut out)?;
        let state = chart.intern(out);
        Ok(StateProb { state, prob }.pack())
    }

    /// Context-free estimate of an encoded rule. No chart is consulted:
    /// negative ids only mark where context breaks.
    pub fn estimate_rule(&self, handle: ModelHandle, encoded: &[i64]) -> Result<f32, LmError> {
        // Any non-terminal resets the estimate, whatever its handle
        let rule = encoded
            .iter()
            .map(|&v| if v < 0 { Ok(Token::BackRef(0)) } else { Token::decode(v) })
            .collect::<Result<Vec<_>, _>>()?;
        Ok(self.model(handle)?.estimate_rule(&rule))
    }
}
