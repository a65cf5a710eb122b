// Copyright (c) 2025-2026 Axon Contributors
//
// SPDX-License-Identifier: Apache-2.0
mod fs;
mod projection;
mod service;
mod session;
mod spawn;

pub use fs::FsSessionService;
pub use projection::{
    child_starts, find_invocation_boundary, has_tool_input, last_yield, open_invocation_path,
    pending_calls, snapshot_at, state_at, status, usage_total, yield_count, InvocationBoundary,
    OpenInvocation,
};
pub use service::{CreateSessionOptions, MemorySessionService, SessionService};
pub use session::{ChangeCallback, Session, SessionSnapshot, SharedSession, StateBinding};
pub use spawn::{SpawnRecord, SpawnStatus, SpawnTracker};
