// Copyright (c) 2025-2026 Axon Contributors
//
// SPDX-License-Identifier: Apache-2.0
//! Built-in context renderers.
//!
//! The full rendering pipeline (prompt assembly, provider-specific shaping)
//! lives outside the core; these cover the two adjustments almost every
//! deployment wants: a standing instruction at the front of the context, and
//! a bound on how much history reaches the adapter.

use axon_types::Event;

use crate::adapter::{ContextRenderer, RenderContext};

/// Prepends a standing instruction as a `system` event, once per step.
pub struct InstructionRenderer {
    instruction: String,
}

impl InstructionRenderer {
    pub fn new(instruction: impl Into<String>) -> Self {
        Self {
            instruction: instruction.into(),
        }
    }
}

impl ContextRenderer for InstructionRenderer {
    fn render(&self, mut ctx: RenderContext) -> RenderContext {
        ctx.events.insert(0, Event::system(self.instruction.clone()));
        ctx
    }
}

/// Keeps only the trailing `max_events` events.  The cheapest way to bound
/// request size; anything smarter (summarization, importance scoring) plugs
/// in through the same trait.
pub struct TailWindowRenderer {
    max_events: usize,
}

impl TailWindowRenderer {
    pub fn new(max_events: usize) -> Self {
        Self { max_events }
    }
}

impl ContextRenderer for TailWindowRenderer {
    fn render(&self, mut ctx: RenderContext) -> RenderContext {
        let len = ctx.events.len();
        if len > self.max_events {
            ctx.events.drain(..len - self.max_events);
        }
        ctx
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use axon_types::EventPayload;

    use super::*;

    fn ctx_with_events(n: usize) -> RenderContext {
        RenderContext {
            events: (0..n).map(|i| Event::user(format!("m{i}"), None)).collect(),
            function_tools: vec![],
            provider_tools: vec![],
            tool_choice: Default::default(),
            output_schema: None,
            allowed_tools: None,
            agent_name: "tester".into(),
            invocation_id: "inv_test".into(),
            state: Default::default(),
        }
    }

    #[test]
    fn instruction_is_prepended_as_system_event() {
        let r = InstructionRenderer::new("be concise");
        let out = r.render(ctx_with_events(2));
        assert_eq!(out.events.len(), 3);
        assert!(matches!(
            &out.events[0].payload,
            EventPayload::System { text } if text == "be concise"
        ));
    }

    #[test]
    fn tail_window_keeps_most_recent_events() {
        let r = TailWindowRenderer::new(2);
        let out = r.render(ctx_with_events(5));
        assert_eq!(out.events.len(), 2);
        assert!(matches!(
            &out.events[1].payload,
            EventPayload::User { text, .. } if text == "m4"
        ));
    }

    #[test]
    fn tail_window_is_a_noop_under_the_limit() {
        let r = TailWindowRenderer::new(10);
        let out = r.render(ctx_with_events(3));
        assert_eq!(out.events.len(), 3);
    }

    #[test]
    fn renderers_compose_in_order() {
        let window = TailWindowRenderer::new(1);
        let instruction = InstructionRenderer::new("rules");
        // Window first, then instruction: the instruction survives.
        let out = instruction.render(window.render(ctx_with_events(4)));
        assert_eq!(out.events.len(), 2);
        assert!(matches!(&out.events[0].payload, EventPayload::System { .. }));
    }
}
