// Copyright (c) 2025-2026 Axon Contributors
//
// SPDX-License-Identifier: Apache-2.0
mod error;
mod event;
mod id;
mod snapshot;
mod status;
mod stream;
mod usage;

pub use error::{EngineError, SessionError};
pub use event::{
    EndReason, Event, EventPayload, HandoffOrigin, RunnableKind, StateDelta, StateScope,
    StateSource,
};
pub use id::{new_call_id, new_event_id, new_invocation_id, now_ms};
pub use snapshot::{PendingCall, Snapshot};
pub use status::{RunStatus, SessionStatus};
pub use stream::StreamEvent;
pub use usage::Usage;

/// Convenience alias for the JSON object maps used throughout the runtime.
pub type JsonMap = serde_json::Map<String, serde_json::Value>;
