// src/llm/effort.rs
// Effort levels and their token budgets

use serde::{Deserialize, Serialize};

use crate::error::PilotError;

/// Lower bound enforced by the Messages API for `budget_tokens`
pub const THINKING_BUDGET_MIN: u32 = 1024;
pub const THINKING_BUDGET_MAX: u32 = 24_000;

/// Coarse knob controlling output and reasoning budgets for one inference call
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Effort {
    Low,
    #[default]
    Medium,
    High,
}

/// (max output tokens, share of it granted to extended thinking)
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct EffortProfile {
    pub max_tokens: u32,
    pub thinking_multiplier: f64,
}

impl Effort {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Low => "low",
            Self::Medium => "medium",
            Self::High => "high",
        }
    }

    pub fn profile(&self) -> EffortProfile {
        match self {
            Self::Low => EffortProfile {
                max_tokens: 8192,
                thinking_multiplier: 0.25,
            },
            Self::Medium => EffortProfile {
                max_tokens: 16_384,
                thinking_multiplier: 0.5,
            },
            Self::High => EffortProfile {
                max_tokens: 32_000,
                thinking_multiplier: 0.75,
            },
        }
    }

    pub fn max_tokens(&self) -> u32 {
        self.profile().max_tokens
    }

    /// Thinking budget, clamped to [MIN, MAX] and kept below max_tokens
    pub fn thinking_budget(&self) -> u32 {
        let profile = self.profile();
        let raw = (profile.max_tokens as f64 * profile.thinking_multiplier) as u32;
        raw.clamp(THINKING_BUDGET_MIN, THINKING_BUDGET_MAX)
            .min(profile.max_tokens.saturating_sub(1))
    }
}

impl std::fmt::Display for Effort {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl std::str::FromStr for Effort {
    type Err = PilotError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "low" => Ok(Self::Low),
            "medium" => Ok(Self::Medium),
            "high" => Ok(Self::High),
            other => Err(PilotError::InvalidInput(format!("unknown effort: {other}"))),
        }
    }
}
