// src/llm/pricing.rs
// Per-model pricing, cost derivation, and running usage totals
//
// Prices are USD per million tokens from the Anthropic pricing page.

use serde::{Deserialize, Serialize};
use tracing::warn;

use super::types::TokenUsage;

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ModelPricing {
    pub input_per_million: f64,
    pub output_per_million: f64,
    pub cache_read_per_million: f64,
    pub cache_write_per_million: f64,
}

impl ModelPricing {
    const fn new(input: f64, output: f64, cache_read: f64, cache_write: f64) -> Self {
        Self {
            input_per_million: input,
            output_per_million: output,
            cache_read_per_million: cache_read,
            cache_write_per_million: cache_write,
        }
    }
}

const OPUS_4_5: ModelPricing = ModelPricing::new(5.0, 25.0, 0.50, 6.25);
const OPUS_4: ModelPricing = ModelPricing::new(15.0, 75.0, 1.50, 18.75);
const SONNET_4: ModelPricing = ModelPricing::new(3.0, 15.0, 0.30, 3.75);
const HAIKU_4_5: ModelPricing = ModelPricing::new(1.0, 5.0, 0.10, 1.25);
const HAIKU_3_5: ModelPricing = ModelPricing::new(0.80, 4.0, 0.08, 1.0);
const HAIKU_3: ModelPricing = ModelPricing::new(0.25, 1.25, 0.03, 0.30);

/// Pricing for a model id, matched on family so dated snapshots resolve too
pub fn get_pricing(model: &str) -> Option<ModelPricing> {
    let m = model.to_ascii_lowercase();
    if m.contains("opus-4-5") {
        Some(OPUS_4_5)
    } else if m.contains("opus-4") || m.contains("3-opus") {
        Some(OPUS_4)
    } else if m.contains("sonnet") {
        Some(SONNET_4)
    } else if m.contains("haiku-4") {
        Some(HAIKU_4_5)
    } else if m.contains("3-5-haiku") {
        Some(HAIKU_3_5)
    } else if m.contains("3-haiku") {
        Some(HAIKU_3)
    } else {
        None
    }
}

/// Turns token counts into dollars for one model
#[derive(Debug, Clone, Copy)]
pub struct CostAccountant {
    pricing: ModelPricing,
}

impl CostAccountant {
    pub fn new(pricing: ModelPricing) -> Self {
        Self { pricing }
    }

    /// Unknown models are billed at Sonnet rates
    pub fn for_model(model: &str) -> Self {
        let pricing = get_pricing(model).unwrap_or_else(|| {
            warn!(model, "No pricing entry for model, using Sonnet rates");
            SONNET_4
        });
        Self::new(pricing)
    }

    pub fn pricing(&self) -> ModelPricing {
        self.pricing
    }

    pub fn cost(&self, usage: &TokenUsage) -> f64 {
        let p = &self.pricing;
        (usage.input as f64 * p.input_per_million
            + usage.output as f64 * p.output_per_million
            + usage.cache_read as f64 * p.cache_read_per_million
            + usage.cache_write as f64 * p.cache_write_per_million)
            / 1_000_000.0
    }

    /// Savings against billing every cached token at the full input price, clamped to [0, 95]
    pub fn saved_percent(&self, usage: &TokenUsage) -> f64 {
        let p = &self.pricing;
        let uncached = ((usage.input + usage.cache_read + usage.cache_write) as f64
            * p.input_per_million
            + usage.output as f64 * p.output_per_million)
            / 1_000_000.0;
        if uncached <= 0.0 {
            return 0.0;
        }
        ((uncached - self.cost(usage)) / uncached * 100.0).clamp(0.0, 95.0)
    }
}

/// Accumulated usage at one scope
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct UsageTotals {
    pub usage: TokenUsage,
    pub cost: f64,
    pub turns: u64,
}

impl UsageTotals {
    fn add(&mut self, usage: TokenUsage, cost: f64) {
        self.usage += usage;
        self.cost += cost.max(0.0);
        self.turns += 1;
    }
}

/// Running totals: one resettable conversation scope and one lifetime scope
#[derive(Debug, Clone, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CostTracker {
    conversation: UsageTotals,
    lifetime: UsageTotals,
}

impl CostTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record one completed turn at both scopes
    pub fn record(&mut self, usage: TokenUsage, cost: f64) {
        self.conversation.add(usage, cost);
        self.lifetime.add(usage, cost);
    }

    /// Start a new conversation; lifetime totals are kept
    pub fn reset_conversation(&mut self) {
        self.conversation = UsageTotals::default();
    }

    pub fn conversation(&self) -> UsageTotals {
        self.conversation
    }

    pub fn lifetime(&self) -> UsageTotals {
        self.lifetime
    }
}
