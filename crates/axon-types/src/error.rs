// Copyright (c) 2025-2026 Axon Contributors
//
// SPDX-License-Identifier: Apache-2.0
use thiserror::Error;

/// Errors raised by session storage and projection.
#[derive(Debug, Error)]
pub enum SessionError {
    #[error("session not found: {app_name}/{session_id}")]
    NotFound {
        app_name: String,
        session_id: String,
    },

    #[error("event index {index} out of bounds (log length {len})")]
    IndexOutOfBounds { index: usize, len: usize },

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("serialization error: {0}")]
    Serde(#[from] serde_json::Error),
}

/// Errors raised by the execution engine.
///
/// `MaxSteps` and abort outcomes are *not* errors — they surface as run
/// statuses. Everything here is a genuine failure of the current invocation
/// or run.
#[derive(Debug, Error)]
pub enum EngineError {
    #[error("invalid runnable: {0}")]
    Validation(String),

    /// The runnable topology changed between the run that yielded and the
    /// resume attempt. Both fingerprints are included so callers can log the
    /// drift.
    #[error("pipeline structure changed: session was started with fingerprint {expected} but the current runnable has fingerprint {actual}")]
    PipelineStructureChanged { expected: String, actual: String },

    #[error("aborted{}", .reason.as_deref().map(|r| format!(": {r}")).unwrap_or_default())]
    Aborted { reason: Option<String> },

    #[error("Timeout after {0}ms")]
    Timeout(u64),

    #[error("model error: {0}")]
    Model(String),

    #[error("tool {name} failed: {message}")]
    ToolExecution { name: String, message: String },

    #[error("output parse failed for agent {agent}: {message}")]
    OutputParse { agent: String, message: String },

    #[error("channel closed")]
    ChannelClosed,

    #[error("stream already consumed")]
    StreamConsumed,

    /// `call()` drained a child that suspended; synchronous handoff cannot
    /// return a yielded child.
    #[error("child invocation {0} yielded while awaiting external input; use spawn() for suspendable children")]
    ChildYielded(String),

    #[error(transparent)]
    Session(#[from] SessionError),
}

impl EngineError {
    pub fn aborted(reason: Option<String>) -> Self {
        EngineError::Aborted { reason }
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
