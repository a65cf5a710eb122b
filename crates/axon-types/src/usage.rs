// Copyright (c) 2025-2026 Axon Contributors
//
// SPDX-License-Identifier: Apache-2.0
use serde::{Deserialize, Serialize};

/// Token usage reported by a model adapter for one step, and accumulated
/// across a run.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Usage {
    pub input_tokens: u32,
    pub output_tokens: u32,
}

impl Usage {
    pub fn new(input_tokens: u32, output_tokens: u32) -> Self {
        Self {
            input_tokens,
            output_tokens,
        }
    }

    /// Accumulate another step's usage into this one.
    pub fn add(&mut self, other: Usage) {
        self.input_tokens = self.input_tokens.saturating_add(other.input_tokens);
        self.output_tokens = self.output_tokens.saturating_add(other.output_tokens);
    }

    pub fn total_tokens(&self) -> u32 {
        self.input_tokens.saturating_add(self.output_tokens)
    }

    pub fn is_zero(&self) -> bool {
        self.input_tokens == 0 && self.output_tokens == 0
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn add_accumulates() {
        let mut u = Usage::new(10, 5);
        u.add(Usage::new(3, 2));
        assert_eq!(u.input_tokens, 13);
        assert_eq!(u.output_tokens, 7);
        assert_eq!(u.total_tokens(), 20);
    }

    #[test]
    fn add_saturates_instead_of_overflowing() {
        let mut u = Usage::new(u32::MAX, 0);
        u.add(Usage::new(1, 1));
        assert_eq!(u.input_tokens, u32::MAX);
        assert_eq!(u.output_tokens, 1);
    }

    #[test]
    fn default_is_zero() {
        assert!(Usage::default().is_zero());
        assert!(!Usage::new(1, 0).is_zero());
    }
}
