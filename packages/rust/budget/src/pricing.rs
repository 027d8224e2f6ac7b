//! Model token pricing.

use serde::Serialize;

/// USD price per 1K tokens for one model.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct ModelPricing {
    pub input_per_1k: f64,
    pub output_per_1k: f64,
}

/// Known models. Unknown models fall back to [`ModelPricing::FALLBACK`].
const PRICES: &[(&str, ModelPricing)] = &[
    ("gpt-4.1", ModelPricing::new(0.01, 0.03)),
    ("gpt-4.1-mini", ModelPricing::new(0.0015, 0.006)),
    ("gpt-4o", ModelPricing::new(0.005, 0.015)),
    ("gpt-4o-mini", ModelPricing::new(0.00015, 0.0006)),
    ("gpt-4-turbo", ModelPricing::new(0.01, 0.03)),
    ("gpt-4", ModelPricing::new(0.03, 0.06)),
    ("gpt-3.5-turbo", ModelPricing::new(0.0005, 0.0015)),
    ("claude-3-opus", ModelPricing::new(0.015, 0.075)),
    ("claude-3-sonnet", ModelPricing::new(0.003, 0.015)),
    ("claude-3-haiku", ModelPricing::new(0.00025, 0.00125)),
    ("text-embedding-3-small", ModelPricing::new(0.00002, 0.0)),
    ("text-embedding-3-large", ModelPricing::new(0.00013, 0.0)),
];

impl ModelPricing {
    /// Conservative price applied to models missing from the table.
    pub const FALLBACK: Self = Self::new(0.01, 0.03);

    pub const fn new(input_per_1k: f64, output_per_1k: f64) -> Self {
        Self {
            input_per_1k,
            output_per_1k,
        }
    }

    /// Look up a model by id. Router-style ids (`openai/gpt-4o`) are matched
    /// on the part after the last `/`.
    pub fn for_model(model: &str) -> Self {
        let lowered = model.trim().to_lowercase();
        let id = lowered.rsplit('/').next().unwrap_or(&lowered);
        PRICES
            .iter()
            .find(|(name, _)| *name == id)
            .map(|(_, pricing)| *pricing)
            .unwrap_or(Self::FALLBACK)
    }

    /// Cost of a call with known token counts.
    pub fn cost_usd(&self, input_tokens: u64, output_tokens: u64) -> f64 {
        (input_tokens as f64 / 1000.0) * self.input_per_1k
            + (output_tokens as f64 / 1000.0) * self.output_per_1k
    }

    /// Projected cost of `total_tokens`, assuming an even input/output split.
    pub fn estimate_usd(&self, total_tokens: u64) -> f64 {
        let half = total_tokens as f64 / 2.0;
        (half / 1000.0) * self.input_per_1k + (half / 1000.0) * self.output_per_1k
    }
}

/// Rough token count of `text`, at about four characters per token.
pub fn estimate_tokens(text: &str) -> u64 {
    (text.chars().count() as u64).div_ceil(4).max(1)
}
