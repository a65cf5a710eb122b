// Copyright (c) 2025-2026 Axon Contributors
//
// SPDX-License-Identifier: Apache-2.0
use serde::{Deserialize, Serialize};

use crate::{JsonMap, SessionStatus};

/// A yielding tool call that has not been answered yet.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PendingCall {
    pub call_id: String,
    pub name: String,
}

/// Point-in-time view of a session at some event index: all four scope
/// states, the derived status, the agent currently on top of the open
/// invocation stack, and the unresolved yielding calls.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Snapshot {
    pub state: JsonMap,
    pub user_state: JsonMap,
    pub patient_state: JsonMap,
    pub practice_state: JsonMap,
    pub status: SessionStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub current_agent: Option<String>,
    pub pending_calls: Vec<PendingCall>,
}
