// Copyright (c) 2025-2026 Axon Contributors
//
// SPDX-License-Identifier: Apache-2.0
use std::pin::Pin;

use async_trait::async_trait;
use futures::Stream;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio_util::sync::CancellationToken;

use axon_types::{Event, JsonMap};

pub type ModelStream = Pin<Box<dyn Stream<Item = anyhow::Result<ModelEvent>> + Send>>;

/// A single streamed event from a model step.
#[derive(Debug, Clone)]
pub enum ModelEvent {
    /// A reasoning chunk; accumulated into a `thought` event by the engine.
    ThoughtDelta(String),
    /// A response text chunk; accumulated into an `assistant` event.
    TextDelta(String),
    /// The model wants to call a tool.  `arguments` may arrive across
    /// multiple deltas for the same `index`; the engine concatenates them.
    ToolCall {
        index: u32,
        id: String,
        name: String,
        arguments: String,
    },
    /// Token usage for this step.
    Usage { input_tokens: u32, output_tokens: u32 },
    /// Provider finish reason (`stop`, `tool_calls`, `length`, ...).
    FinishReason(String),
    /// The stream finished normally.
    Done,
}

/// Declaration of a function tool, as sent to the adapter.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolSchema {
    pub name: String,
    pub description: String,
    /// JSON Schema of the parameters object.
    pub parameters: Value,
    /// `true` when the tool suspends execution awaiting external input.
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub yields: bool,
}

/// A tool executed by the model provider itself; the engine never dispatches
/// these, it only forwards the declaration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProviderTool {
    pub name: String,
    pub config: Value,
}

/// Tool-choice directive forwarded to the adapter.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ToolChoice {
    #[default]
    Auto,
    None,
    Required,
    /// Force a specific tool by name.
    Tool(String),
}

/// Language-neutral input to one model step.
///
/// The engine assembles this from the session log and the agent declaration;
/// an agent's [`ContextRenderer`] chain may reshape it before the adapter
/// sees it (filter events, inject instructions, trim history).
#[derive(Clone)]
pub struct RenderContext {
    pub events: Vec<Event>,
    pub function_tools: Vec<ToolSchema>,
    pub provider_tools: Vec<ProviderTool>,
    pub tool_choice: ToolChoice,
    pub output_schema: Option<Value>,
    pub allowed_tools: Option<Vec<String>>,
    pub agent_name: String,
    pub invocation_id: String,
    /// Session-scope state at the time of the step.
    pub state: JsonMap,
}

impl std::fmt::Debug for RenderContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RenderContext")
            .field("events", &self.events.len())
            .field("function_tools", &self.function_tools.len())
            .field("provider_tools", &self.provider_tools.len())
            .field("tool_choice", &self.tool_choice)
            .field("agent_name", &self.agent_name)
            .field("invocation_id", &self.invocation_id)
            .finish()
    }
}

/// Reshapes the [`RenderContext`] before it reaches the adapter.
///
/// Renderers compose left to right; the full rendering pipeline lives
/// outside the core, which only supplies the seam.
pub trait ContextRenderer: Send + Sync {
    fn render(&self, ctx: RenderContext) -> RenderContext;
}

/// Adapter for one language model provider.
///
/// `step` performs a single model round-trip and returns a stream of
/// [`ModelEvent`]s.  The engine folds the stream into a step result; the
/// adapter is expected to honour `signal` by ending the stream early.
#[async_trait]
pub trait ModelAdapter: Send + Sync {
    /// Provider/model name for logging and display.
    fn name(&self) -> &str;

    async fn step(
        &self,
        ctx: RenderContext,
        signal: CancellationToken,
    ) -> anyhow::Result<ModelStream>;
}

/// Marker error for failures worth retrying in place (rate limits, provider
/// timeouts, 5xx).  Adapters wrap such failures in this type; anything else
/// is treated as fatal and routed through the error-handler chain.
#[derive(Debug, thiserror::Error)]
#[error("transient model error: {0}")]
pub struct TransientModelError(pub String);

/// Classify an adapter error as transient.
///
/// Checks for an explicit [`TransientModelError`] in the chain first, then
/// falls back to message heuristics for adapters that only surface strings.
pub fn is_transient(err: &anyhow::Error) -> bool {
    if err.chain().any(|c| c.is::<TransientModelError>()) {
        return true;
    }
    let msg = err.to_string().to_ascii_lowercase();
    msg.contains("rate limit")
        || msg.contains("429")
        || msg.contains("timed out")
        || msg.contains("timeout")
        || msg.contains("502")
        || msg.contains("503")
        || msg.contains("overloaded")
}

// ─── Unit tests ──────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn transient_marker_is_detected_through_context() {
        let err = anyhow::Error::new(TransientModelError("429 too many requests".into()))
            .context("model step failed");
        assert!(is_transient(&err));
    }

    #[test]
    fn transient_heuristics_match_common_messages() {
        assert!(is_transient(&anyhow::anyhow!("upstream returned 503")));
        assert!(is_transient(&anyhow::anyhow!("request timed out")));
        assert!(!is_transient(&anyhow::anyhow!("invalid api key")));
    }

    #[test]
    fn tool_choice_serialises_snake_case() {
        assert_eq!(
            serde_json::to_string(&ToolChoice::Required).unwrap(),
            "\"required\""
        );
        assert_eq!(
            serde_json::to_string(&ToolChoice::Tool("ask".into())).unwrap(),
            "{\"tool\":\"ask\"}"
        );
    }

    #[test]
    fn tool_schema_omits_yields_when_false() {
        let s = ToolSchema {
            name: "inc".into(),
            description: "increment".into(),
            parameters: serde_json::json!({"type": "object"}),
            yields: false,
        };
        let json = serde_json::to_string(&s).unwrap();
        assert!(!json.contains("yields"), "{json}");
    }
}
