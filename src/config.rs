use crate::search::ModelType;

/// Settings for loading models and sizing per-sentence charts.
#[derive(Debug, Clone)]
pub struct Config {
    /// Log10 probability given to `<unk>` when an ARPA file omits it.
    pub unknown_missing_logprob: f32,
    /// Representation built when the model file is plain ARPA text.
    pub arpa_representation: ModelType,
    /// Ratio of buckets to entries in probing hash tables.
    pub probing_multiplier: f32,
    /// Maximum number of tokens on the target side of one rule.
    pub max_rule_length: usize,
    /// Number of states a fresh chart reserves room for.
    pub chart_capacity: usize,
    /// Largest decoder word id a model accepts. Id maps are dense, so
    /// this bounds their memory.
    pub max_word_id: u32,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            unknown_missing_logprob: -100.0,
            arpa_representation: ModelType::Probing,
            probing_multiplier: 1.5,
            max_rule_length: 256,
            chart_capacity: 1000,
            max_word_id: 1 << 24,
        }
    }
}

impl Config {
    pub fn with_arpa_representation(mut self, model_type: ModelType) -> Self {
        self.arpa_representation = model_type;
        self
    }

    pub fn with_unknown_missing_logprob(mut self, logprob: f32) -> Self {
        self.unknown_missing_logprob = logprob;
        self
    }

    pub fn with_probing_multiplier(mut self, multiplier: f32) -> Self {
        self.probing_multiplier = multiplier.max(1.0);
        self
    }

    pub fn with_max_rule_length(mut self, length: usize) -> Self {
        self.max_rule_length = length;
        self
    }

    pub fn with_chart_capacity(mut self, capacity: usize) -> Self {
        self.chart_capacity = capacity;
        self
    }

    pub fn with_max_word_id(mut self, id: u32) -> Self {
        self.max_word_id = id;
        self
    }
}
