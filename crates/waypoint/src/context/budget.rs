//! Token budget estimation against a model's context profile.
//!
//! Estimates token usage from message character counts. Exact tokenization
//! is model-specific and not worth the cost here: the estimate only has to
//! be good enough to decide whether the effective history fits in the
//! model's safe budget, and by how much it overshoots.

use crate::Message;
use crate::config::DEFAULT_CHARS_PER_TOKEN;
use serde::{Deserialize, Serialize};

/// Fixed per-message overhead (role tags, block delimiters) in tokens.
const PER_MESSAGE_OVERHEAD_TOKENS: usize = 4;

/// Context window shape of the model the next request goes to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ModelContextProfile {
    /// Total context window in tokens.
    pub context_window_tokens: usize,
    /// Tokens reserved for the model's response.
    pub reserved_output_tokens: usize,
}

impl ModelContextProfile {
    pub fn new(context_window_tokens: usize, reserved_output_tokens: usize) -> Self {
        Self {
            context_window_tokens,
            reserved_output_tokens,
        }
    }

    /// Context window minus the output reserve. Saturates at zero.
    pub fn safe_budget(&self) -> usize {
        self.context_window_tokens
            .saturating_sub(self.reserved_output_tokens)
    }
}

/// Character-count token estimator.
#[derive(Debug, Clone, Copy)]
pub struct TokenEstimator {
    chars_per_token: f64,
}

impl Default for TokenEstimator {
    fn default() -> Self {
        Self::new(DEFAULT_CHARS_PER_TOKEN)
    }
}

impl TokenEstimator {
    /// Non-positive ratios fall back to the default.
    pub fn new(chars_per_token: f64) -> Self {
        let chars_per_token = if chars_per_token > 0.0 {
            chars_per_token
        } else {
            DEFAULT_CHARS_PER_TOKEN
        };
        Self { chars_per_token }
    }

    /// Estimated tokens for a single message.
    pub fn message_tokens(&self, message: &Message) -> usize {
        (message.char_len() as f64 / self.chars_per_token).ceil() as usize
            + PER_MESSAGE_OVERHEAD_TOKENS
    }

    /// Estimated tokens for a whole message list.
    pub fn estimate(&self, messages: &[Message]) -> usize {
        messages.iter().map(|m| self.message_tokens(m)).sum()
    }

    /// Estimate usage of `messages` against `profile`.
    pub fn usage(&self, messages: &[Message], profile: &ModelContextProfile) -> ContextUsage {
        ContextUsage::new(self.estimate(messages), profile.safe_budget())
    }
}

/// Snapshot of context usage at a point in time.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ContextUsage {
    /// Estimated tokens consumed by the effective history.
    pub estimated_tokens: usize,
    /// The model's safe budget.
    pub safe_budget: usize,
    /// `estimated_tokens / safe_budget` (1.0 means exactly full).
    pub usage_pct: f64,
}

impl ContextUsage {
    pub fn new(estimated_tokens: usize, safe_budget: usize) -> Self {
        let usage_pct = if safe_budget > 0 {
            estimated_tokens as f64 / safe_budget as f64
        } else {
            f64::INFINITY
        };
        Self {
            estimated_tokens,
            safe_budget,
            usage_pct,
        }
    }

    /// Whether the estimate fits in the safe budget.
    pub fn fits(&self) -> bool {
        self.estimated_tokens <= self.safe_budget
    }

    /// How many times over budget the estimate is. Below 1.0 when it fits.
    pub fn overage_ratio(&self) -> f64 {
        self.usage_pct
    }

    /// Format as a short log-friendly string.
    pub fn to_log_string(&self) -> String {
        format!(
            "context: ~{} tokens ({:.0}% of {})",
            self.estimated_tokens,
            self.usage_pct * 100.0,
            self.safe_budget,
        )
    }
}
