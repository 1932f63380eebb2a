use std::collections::hash_map::Entry;
use std::collections::HashMap;

use crate::error::LmError;
use crate::rule::Token;
use crate::state::ChartState;

/// Handle of a state interned in a [`Chart`]. Starts at 1 so that a
/// negated handle can never be mistaken for a word id.
pub type StateIndex = u32;

/// Flat buffer holding the encoded target side of the next rule to score.
///
/// Elements that are non-negative are word ids, negative elements are
/// negated chart handles. On the wire the first element is the number of
/// tokens that follow.
#[derive(Debug, Clone)]
pub struct RuleBuffer {
    tokens: Vec<i64>,
    capacity: usize,
}

impl RuleBuffer {
    pub fn new(capacity: usize) -> Self {
        Self {
            tokens: Vec::with_capacity(capacity),
            capacity,
        }
    }

    pub fn fill(&mut self, encoded: &[i64]) -> Result<(), LmError> {
        if encoded.len() > self.capacity {
            return Err(LmError::invalid(format!(
                "rule of {} tokens exceeds the maximum of {}",
                encoded.len(),
                self.capacity
            )));
        }
        self.tokens.clear();
        self.tokens.extend_from_slice(encoded);
        Ok(())
    }

    /// Fill from a length-prefixed wire buffer
    pub fn fill_prefixed(&mut self, wire: &[i64]) -> Result<(), LmError> {
        let (&length, rest) = wire
            .split_first()
            .ok_or_else(|| LmError::invalid("rule buffer has no length prefix"))?;
        let length = usize::try_from(length)
            .ok()
            .filter(|&n| n <= rest.len())
            .ok_or_else(|| {
                LmError::invalid(format!(
                    "rule length {} does not fit a buffer of {}",
                    length,
                    rest.len()
                ))
            })?;
        self.fill(&rest[..length])
    }

    pub fn fill_tokens(&mut self, tokens: &[Token]) -> Result<(), LmError> {
        let encoded: Vec<i64> = tokens.iter().map(|t| t.encode()).collect();
        self.fill(&encoded)
    }

    pub fn decode(&self) -> Result<Vec<Token>, LmError> {
        self.tokens.iter().map(|&v| Token::decode(v)).collect()
    }

    pub fn as_slice(&self) -> &[i64] {
        &self.tokens
    }

    pub fn len(&self) -> usize {
        self.tokens.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tokens.is_empty()
    }
}

/// Boundary states of one sentence, each stored once.
///
/// Append-only: a state keeps the handle of its first insertion for the
/// life of the chart. Handles mean nothing to any other chart, and a
/// chart is not meant to be shared between threads.
#[derive(Debug)]
pub struct Chart {
    states: Vec<ChartState>,
    lookup: HashMap<ChartState, StateIndex>,
    buffer: RuleBuffer,
}

impl Chart {
    pub fn new(capacity: usize, max_rule_length: usize) -> Self {
        Self {
            states: Vec::with_capacity(capacity),
            lookup: HashMap::with_capacity(capacity),
            buffer: RuleBuffer::new(max_rule_length),
        }
    }

    /// Handle of `state`, adding it if no equal state is stored yet
    pub fn intern(&mut self, state: ChartState) -> StateIndex {
        match self.lookup.entry(state) {
            Entry::Occupied(e) => *e.get(),
            Entry::Vacant(e) => {
                self.states.push(state);
                *e.insert(self.states.len() as StateIndex)
            }
        }
    }

    /// State interned under `handle`. Only handles this chart returned
    /// are accepted; a handle from another chart that happens to be in
    /// range cannot be detected.
    pub fn resolve(&self, handle: StateIndex) -> Result<&ChartState, LmError> {
        handle
            .checked_sub(1)
            .and_then(|i| self.states.get(i as usize))
            .ok_or_else(|| {
                LmError::invalid(format!(
                    "chart handle {} out of range (chart holds {})",
                    handle,
                    self.states.len()
                ))
            })
    }

    pub fn len(&self) -> usize {
        self.states.len()
    }

    pub fn is_empty(&self) -> bool {
        self.states.is_empty()
    }

    pub fn buffer(&self) -> &RuleBuffer {
        &self.buffer
    }

    pub fn buffer_mut(&mut self) -> &mut RuleBuffer {
        &mut self.buffer
    }
}
