//! Static model price table.
//!
//! Prices are matched by model-id prefix; the longest matching prefix wins.
//! Unknown models fall back to a conservative default so that cost is never
//! reported as zero for a call that consumed tokens.

use crate::llm::TokenUsage;

/// Token prices for one model family, in cents per million tokens.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ModelPricing {
    pub prompt_cents_per_mtok: f64,
    pub completion_cents_per_mtok: f64,
}

impl ModelPricing {
    const fn new(prompt_cents_per_mtok: f64, completion_cents_per_mtok: f64) -> Self {
        Self {
            prompt_cents_per_mtok,
            completion_cents_per_mtok,
        }
    }

    /// Cost of `usage` in fractional cents.
    pub fn cost(&self, usage: &TokenUsage) -> f64 {
        (usage.prompt_tokens as f64 * self.prompt_cents_per_mtok
            + usage.completion_tokens as f64 * self.completion_cents_per_mtok)
            / 1_000_000.0
    }
}

const DEFAULT_PRICING: ModelPricing = ModelPricing::new(300.0, 1500.0);

const PRICE_TABLE: &[(&str, ModelPricing)] = &[
    ("gpt-4.1-mini", ModelPricing::new(40.0, 160.0)),
    ("gpt-4.1", ModelPricing::new(200.0, 800.0)),
    ("gpt-4o-mini", ModelPricing::new(15.0, 60.0)),
    ("gpt-4o", ModelPricing::new(250.0, 1000.0)),
    ("o4-mini", ModelPricing::new(110.0, 440.0)),
    ("o3", ModelPricing::new(200.0, 800.0)),
    ("anthropic/claude-sonnet", ModelPricing::new(300.0, 1500.0)),
    ("anthropic/claude-opus", ModelPricing::new(1500.0, 7500.0)),
    ("anthropic/claude-3.5-haiku", ModelPricing::new(80.0, 400.0)),
    ("google/gemini-2.5-pro", ModelPricing::new(125.0, 1000.0)),
    ("google/gemini-2.5-flash", ModelPricing::new(30.0, 250.0)),
    ("perplexity/sonar-pro", ModelPricing::new(300.0, 1500.0)),
    ("perplexity/sonar", ModelPricing::new(100.0, 100.0)),
];

/// Look up pricing for a model id.
pub fn pricing_for(model: &str) -> ModelPricing {
    PRICE_TABLE
        .iter()
        .filter(|(prefix, _)| model.starts_with(prefix))
        .max_by_key(|(prefix, _)| prefix.len())
        .map(|(_, pricing)| *pricing)
        .unwrap_or(DEFAULT_PRICING)
}

/// Estimated cost of a call in whole cents, rounded up.
pub fn estimate_cost_cents(model: &str, usage: &TokenUsage) -> u64 {
    let cost = pricing_for(model).cost(usage);
    if cost <= 0.0 {
        0
    } else {
        cost.ceil() as u64
    }
}
