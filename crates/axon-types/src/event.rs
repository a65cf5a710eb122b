// Copyright (c) 2025-2026 Axon Contributors
//
// SPDX-License-Identifier: Apache-2.0
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::id::{new_event_id, now_ms};

/// One record in a session's append-only log.
///
/// Events are the sole source of truth for history and state: everything a
/// run produces — text, tool activity, state changes, invocation envelopes —
/// is an `Event`, and all derived views (status, snapshots, resume contexts)
/// are folds over the log.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Event {
    pub id: String,
    /// Unix milliseconds; non-decreasing in log order.
    pub created_at: i64,
    #[serde(flatten)]
    pub payload: EventPayload,
}

/// The tagged payload carried by an [`Event`].
///
/// The `type` discriminator uses snake_case (`tool_call`, `invocation_end`),
/// field names are camelCase on the wire (`callId`, `invocationId`).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case", rename_all_fields = "camelCase")]
pub enum EventPayload {
    System {
        text: String,
    },
    User {
        text: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        invocation_id: Option<String>,
    },
    Assistant {
        text: String,
        invocation_id: String,
        agent_name: String,
        /// Opaque provider payload (e.g. a response id) forwarded verbatim.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        provider_context: Option<Value>,
    },
    Thought {
        text: String,
        invocation_id: String,
        agent_name: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        provider_context: Option<Value>,
    },
    ToolCall {
        call_id: String,
        name: String,
        args: Value,
        /// `true` when the call suspends execution until external input arrives.
        #[serde(default, skip_serializing_if = "std::ops::Not::not")]
        yields: bool,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        provider_context: Option<Value>,
    },
    ToolYield {
        call_id: String,
        name: String,
        /// Arguments after the tool's `prepare` hook ran.
        prepared_args: Value,
    },
    ToolInput {
        call_id: String,
        name: String,
        /// The external answer that resolves the yield.
        input: Value,
    },
    ToolResult {
        call_id: String,
        name: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        result: Option<Value>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        error: Option<String>,
    },
    StateChange {
        scope: StateScope,
        source: StateSource,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        invocation_id: Option<String>,
        changes: Vec<StateDelta>,
    },
    InvocationStart {
        invocation_id: String,
        agent_name: String,
        kind: RunnableKind,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        parent_invocation_id: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        handoff_origin: Option<HandoffOrigin>,
        /// Recorded on root invocations only.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        fingerprint: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        version: Option<String>,
    },
    InvocationResume {
        invocation_id: String,
        yield_index: u32,
    },
    InvocationYield {
        invocation_id: String,
        /// Unresolved yielding call ids, in the order they were issued.
        pending_call_ids: Vec<String>,
        yield_index: u32,
        #[serde(default, skip_serializing_if = "std::ops::Not::not")]
        awaiting_input: bool,
    },
    InvocationEnd {
        invocation_id: String,
        reason: EndReason,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        iterations: Option<u32>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        error: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        handoff_target: Option<String>,
    },
    ModelStart {
        invocation_id: String,
        agent_name: String,
    },
    ModelEnd {
        invocation_id: String,
        agent_name: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        usage: Option<crate::Usage>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        finish_reason: Option<String>,
    },
}

/// The four state scopes a session can read and write.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StateScope {
    Session,
    User,
    Patient,
    Practice,
}

impl StateScope {
    pub const ALL: [StateScope; 4] = [
        StateScope::Session,
        StateScope::User,
        StateScope::Patient,
        StateScope::Practice,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            StateScope::Session => "session",
            StateScope::User => "user",
            StateScope::Patient => "patient",
            StateScope::Practice => "practice",
        }
    }
}

/// Why a state change was recorded.
///
/// - `Direct` — an explicit write from outside any invocation (initial state,
///   host application writes).
/// - `Mutation` — a write performed by a runnable during execution.
/// - `Observation` — a read of an externally bound scope whose value differed
///   from the last recorded value.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StateSource {
    Direct,
    Mutation,
    Observation,
}

/// One key transition inside a `state_change` event.
///
/// `new_value: None` means "delete key".
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StateDelta {
    pub key: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub old_value: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub new_value: Option<Value>,
}

/// The five runnable variants.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RunnableKind {
    Agent,
    Step,
    Sequence,
    Parallel,
    Loop,
}

impl RunnableKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            RunnableKind::Agent => "agent",
            RunnableKind::Step => "step",
            RunnableKind::Sequence => "sequence",
            RunnableKind::Parallel => "parallel",
            RunnableKind::Loop => "loop",
        }
    }
}

/// How execution arrived at a child invocation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HandoffOrigin {
    Call,
    Spawn,
    Dispatch,
    Transfer,
}

/// Terminal reason recorded on `invocation_end`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EndReason {
    Completed,
    Error,
    Aborted,
    MaxSteps,
}

impl Event {
    /// Wrap a payload with a fresh id and the current timestamp.
    pub fn new(payload: EventPayload) -> Self {
        Self {
            id: new_event_id(),
            created_at: now_ms(),
            payload,
        }
    }

    pub fn system(text: impl Into<String>) -> Self {
        Self::new(EventPayload::System { text: text.into() })
    }

    pub fn user(text: impl Into<String>, invocation_id: Option<String>) -> Self {
        Self::new(EventPayload::User {
            text: text.into(),
            invocation_id,
        })
    }

    pub fn assistant(
        invocation_id: impl Into<String>,
        agent_name: impl Into<String>,
        text: impl Into<String>,
    ) -> Self {
        Self::new(EventPayload::Assistant {
            text: text.into(),
            invocation_id: invocation_id.into(),
            agent_name: agent_name.into(),
            provider_context: None,
        })
    }

    pub fn thought(
        invocation_id: impl Into<String>,
        agent_name: impl Into<String>,
        text: impl Into<String>,
    ) -> Self {
        Self::new(EventPayload::Thought {
            text: text.into(),
            invocation_id: invocation_id.into(),
            agent_name: agent_name.into(),
            provider_context: None,
        })
    }

    pub fn tool_call(
        call_id: impl Into<String>,
        name: impl Into<String>,
        args: Value,
        yields: bool,
    ) -> Self {
        Self::new(EventPayload::ToolCall {
            call_id: call_id.into(),
            name: name.into(),
            args,
            yields,
            provider_context: None,
        })
    }

    pub fn tool_yield(
        call_id: impl Into<String>,
        name: impl Into<String>,
        prepared_args: Value,
    ) -> Self {
        Self::new(EventPayload::ToolYield {
            call_id: call_id.into(),
            name: name.into(),
            prepared_args,
        })
    }

    pub fn tool_input(call_id: impl Into<String>, name: impl Into<String>, input: Value) -> Self {
        Self::new(EventPayload::ToolInput {
            call_id: call_id.into(),
            name: name.into(),
            input,
        })
    }

    pub fn tool_result(call_id: impl Into<String>, name: impl Into<String>, result: Value) -> Self {
        Self::new(EventPayload::ToolResult {
            call_id: call_id.into(),
            name: name.into(),
            result: Some(result),
            error: None,
        })
    }

    pub fn tool_error(
        call_id: impl Into<String>,
        name: impl Into<String>,
        error: impl Into<String>,
    ) -> Self {
        Self::new(EventPayload::ToolResult {
            call_id: call_id.into(),
            name: name.into(),
            result: None,
            error: Some(error.into()),
        })
    }

    pub fn state_change(
        scope: StateScope,
        source: StateSource,
        invocation_id: Option<String>,
        changes: Vec<StateDelta>,
    ) -> Self {
        Self::new(EventPayload::StateChange {
            scope,
            source,
            invocation_id,
            changes,
        })
    }

    /// The invocation this event belongs to, when it carries one.
    pub fn invocation_id(&self) -> Option<&str> {
        match &self.payload {
            EventPayload::User { invocation_id, .. }
            | EventPayload::StateChange { invocation_id, .. } => invocation_id.as_deref(),
            EventPayload::Assistant { invocation_id, .. }
            | EventPayload::Thought { invocation_id, .. }
            | EventPayload::InvocationStart { invocation_id, .. }
            | EventPayload::InvocationResume { invocation_id, .. }
            | EventPayload::InvocationYield { invocation_id, .. }
            | EventPayload::InvocationEnd { invocation_id, .. }
            | EventPayload::ModelStart { invocation_id, .. }
            | EventPayload::ModelEnd { invocation_id, .. } => Some(invocation_id),
            _ => None,
        }
    }

    /// The tool-call id this event refers to, when it carries one.
    pub fn call_id(&self) -> Option<&str> {
        match &self.payload {
            EventPayload::ToolCall { call_id, .. }
            | EventPayload::ToolYield { call_id, .. }
            | EventPayload::ToolInput { call_id, .. }
            | EventPayload::ToolResult { call_id, .. } => Some(call_id),
            _ => None,
        }
    }

    /// The wire discriminator, for log messages.
    pub fn type_name(&self) -> &'static str {
        match &self.payload {
            EventPayload::System { .. } => "system",
            EventPayload::User { .. } => "user",
            EventPayload::Assistant { .. } => "assistant",
            EventPayload::Thought { .. } => "thought",
            EventPayload::ToolCall { .. } => "tool_call",
            EventPayload::ToolYield { .. } => "tool_yield",
            EventPayload::ToolInput { .. } => "tool_input",
            EventPayload::ToolResult { .. } => "tool_result",
            EventPayload::StateChange { .. } => "state_change",
            EventPayload::InvocationStart { .. } => "invocation_start",
            EventPayload::InvocationResume { .. } => "invocation_resume",
            EventPayload::InvocationYield { .. } => "invocation_yield",
            EventPayload::InvocationEnd { .. } => "invocation_end",
            EventPayload::ModelStart { .. } => "model_start",
            EventPayload::ModelEnd { .. } => "model_end",
        }
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
