// Copyright (c) 2025-2026 Axon Contributors
//
// SPDX-License-Identifier: Apache-2.0
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use futures::stream;
use tokio_util::sync::CancellationToken;

use axon_types::EventPayload;

use crate::adapter::{ModelAdapter, ModelEvent, ModelStream, RenderContext};

/// Deterministic adapter for tests.  Echoes the last `user` event in the
/// rendered context back as the response text.
#[derive(Default)]
pub struct EchoAdapter;

#[async_trait]
impl ModelAdapter for EchoAdapter {
    fn name(&self) -> &str {
        "echo"
    }

    async fn step(
        &self,
        ctx: RenderContext,
        _signal: CancellationToken,
    ) -> anyhow::Result<ModelStream> {
        let reply = ctx
            .events
            .iter()
            .rev()
            .find_map(|e| match &e.payload {
                EventPayload::User { text, .. } => Some(text.clone()),
                _ => None,
            })
            .unwrap_or_else(|| "[no input]".into());

        let events: Vec<anyhow::Result<ModelEvent>> = vec![
            Ok(ModelEvent::TextDelta(format!("ECHO: {reply}"))),
            Ok(ModelEvent::Usage {
                input_tokens: 10,
                output_tokens: 10,
            }),
            Ok(ModelEvent::FinishReason("stop".into())),
            Ok(ModelEvent::Done),
        ];
        Ok(Box::pin(stream::iter(events)))
    }
}

/// A pre-scripted adapter.  Each `step` call pops the next event script from
/// the front of the queue, so tests can specify exact step sequences —
/// including tool calls — without network access.
pub struct ScriptedAdapter {
    scripts: Arc<Mutex<Vec<Vec<ModelEvent>>>>,
    /// When the script queue is exhausted, replay the last script instead of
    /// falling back to a text reply.  Used to model a provider that keeps
    /// requesting the same tool forever (max-steps tests).
    repeat_last: bool,
    last: Mutex<Option<Vec<ModelEvent>>>,
    /// The most recent `RenderContext` seen by this adapter, for assertions.
    pub last_request: Arc<Mutex<Option<RenderContext>>>,
}

impl ScriptedAdapter {
    /// Build an adapter from an ordered list of step scripts.
    pub fn new(scripts: Vec<Vec<ModelEvent>>) -> Self {
        Self {
            scripts: Arc::new(Mutex::new(scripts)),
            repeat_last: false,
            last: Mutex::new(None),
            last_request: Arc::new(Mutex::new(None)),
        }
    }

    /// Replay the final script forever once the queue runs dry.
    pub fn repeating(mut self) -> Self {
        self.repeat_last = true;
        self
    }

    /// Convenience: adapter that always returns a single text reply.
    pub fn always_text(reply: impl Into<String>) -> Self {
        Self::new(vec![Self::text_script(reply)]).repeating()
    }

    /// Convenience: adapter that requests the same tool on every step.
    pub fn always_tool(name: impl Into<String>, args_json: impl Into<String>) -> Self {
        Self::new(vec![Self::tool_script("call-loop", name, args_json)]).repeating()
    }

    /// Convenience: one tool-call step followed by one text step.
    pub fn tool_then_text(
        call_id: impl Into<String>,
        name: impl Into<String>,
        args_json: impl Into<String>,
        final_text: impl Into<String>,
    ) -> Self {
        Self::new(vec![
            Self::tool_script(call_id, name, args_json),
            Self::text_script(final_text),
        ])
    }

    /// Script fragment: a plain text reply with usage.
    pub fn text_script(text: impl Into<String>) -> Vec<ModelEvent> {
        vec![
            ModelEvent::TextDelta(text.into()),
            ModelEvent::Usage {
                input_tokens: 5,
                output_tokens: 5,
            },
            ModelEvent::FinishReason("stop".into()),
            ModelEvent::Done,
        ]
    }

    /// Script fragment: a single tool call.
    pub fn tool_script(
        call_id: impl Into<String>,
        name: impl Into<String>,
        args_json: impl Into<String>,
    ) -> Vec<ModelEvent> {
        vec![
            ModelEvent::ToolCall {
                index: 0,
                id: call_id.into(),
                name: name.into(),
                arguments: args_json.into(),
            },
            ModelEvent::Usage {
                input_tokens: 5,
                output_tokens: 2,
            },
            ModelEvent::FinishReason("tool_calls".into()),
            ModelEvent::Done,
        ]
    }
}

#[async_trait]
impl ModelAdapter for ScriptedAdapter {
    fn name(&self) -> &str {
        "scripted"
    }

    async fn step(
        &self,
        ctx: RenderContext,
        _signal: CancellationToken,
    ) -> anyhow::Result<ModelStream> {
        *self.last_request.lock().unwrap() = Some(ctx);
        let events = {
            let mut scripts = self.scripts.lock().unwrap();
            if scripts.is_empty() {
                let last = self.last.lock().unwrap();
                match (&*last, self.repeat_last) {
                    (Some(script), true) => script.clone(),
                    _ => vec![
                        ModelEvent::TextDelta("[no more scripts]".into()),
                        ModelEvent::Done,
                    ],
                }
            } else {
                let script = scripts.remove(0);
                *self.last.lock().unwrap() = Some(script.clone());
                script
            }
        };
        let wrapped: Vec<anyhow::Result<ModelEvent>> = events.into_iter().map(Ok).collect();
        Ok(Box::pin(stream::iter(wrapped)))
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use futures::StreamExt;

    use super::*;
    use axon_types::Event;

    fn ctx_with_user(text: &str) -> RenderContext {
        RenderContext {
            events: vec![Event::user(text, None)],
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

    async fn collect(mut s: ModelStream) -> Vec<ModelEvent> {
        let mut out = Vec::new();
        while let Some(ev) = s.next().await {
            out.push(ev.unwrap());
        }
        out
    }

    #[tokio::test]
    async fn echo_replies_with_last_user_text() {
        let a = EchoAdapter;
        let events = collect(
            a.step(ctx_with_user("hi"), CancellationToken::new())
                .await
                .unwrap(),
        )
        .await;
        assert!(matches!(&events[0], ModelEvent::TextDelta(t) if t == "ECHO: hi"));
        assert!(matches!(events.last(), Some(ModelEvent::Done)));
    }

    #[tokio::test]
    async fn scripted_pops_scripts_in_order() {
        let a = ScriptedAdapter::tool_then_text("call-1", "inc", "{}", "done");

        let first = collect(
            a.step(ctx_with_user("go"), CancellationToken::new())
                .await
                .unwrap(),
        )
        .await;
        assert!(first
            .iter()
            .any(|e| matches!(e, ModelEvent::ToolCall { name, .. } if name == "inc")));

        let second = collect(
            a.step(ctx_with_user("go"), CancellationToken::new())
                .await
                .unwrap(),
        )
        .await;
        assert!(second
            .iter()
            .any(|e| matches!(e, ModelEvent::TextDelta(t) if t == "done")));
    }

    #[tokio::test]
    async fn repeating_adapter_replays_last_script() {
        let a = ScriptedAdapter::always_tool("inc", "{}");
        for _ in 0..3 {
            let events = collect(
                a.step(ctx_with_user("go"), CancellationToken::new())
                    .await
                    .unwrap(),
            )
            .await;
            assert!(events
                .iter()
                .any(|e| matches!(e, ModelEvent::ToolCall { name, .. } if name == "inc")));
        }
    }

    #[tokio::test]
    async fn scripted_records_last_request() {
        let a = ScriptedAdapter::always_text("ok");
        a.step(ctx_with_user("inspect me"), CancellationToken::new())
            .await
            .unwrap();
        let req = a.last_request.lock().unwrap();
        assert_eq!(req.as_ref().unwrap().agent_name, "tester");
    }

    #[tokio::test]
    async fn exhausted_non_repeating_adapter_falls_back_to_text() {
        let a = ScriptedAdapter::new(vec![]);
        let events = collect(
            a.step(ctx_with_user("go"), CancellationToken::new())
                .await
                .unwrap(),
        )
        .await;
        assert!(matches!(&events[0], ModelEvent::TextDelta(t) if t.contains("no more scripts")));
    }
}
