// Copyright (c) 2025-2026 Axon Contributors
//
// SPDX-License-Identifier: Apache-2.0
use serde::{Deserialize, Serialize};

/// Session-level status derived from the event log.
///
/// `AwaitingInput` wins over everything else: it means an unresolved
/// `tool_yield` or an unresolved `invocation_yield { awaiting_input }` exists.
/// Otherwise the most recent `invocation_end` decides between `Completed` and
/// `Error`; an aborted or max-steps end leaves the session `Active` (it can
/// simply be run again).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionStatus {
    Active,
    AwaitingInput,
    Completed,
    Error,
}

/// Terminal status of one `Runner::run` call.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    Completed,
    Yielded,
    Error,
    Aborted,
    MaxSteps,
}

impl RunStatus {
    /// `true` for statuses that allow another run to make progress on the
    /// same session without external repair.
    pub fn is_resumable(&self) -> bool {
        matches!(self, RunStatus::Yielded)
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
