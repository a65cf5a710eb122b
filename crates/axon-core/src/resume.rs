// Copyright (c) 2025-2026 Axon Contributors
//
// SPDX-License-Identifier: Apache-2.0
//! Computing where a suspended runnable should re-enter.
//!
//! The event log records which invocations are still open (started, never
//! ended) and where each one last yielded.  Walking the runnable tree
//! alongside those open invocations produces a nested [`ResumeContext`]:
//! every composite learns which declared child suspended, every leaf learns
//! the yield index to resume at.

use axon_types::{Event, RunnableKind};

use axon_session::{child_starts, last_yield, open_invocation_path, OpenInvocation};

use crate::runnable::Runnable;

/// Nested description of a suspension point.
#[derive(Debug, Clone)]
pub struct ResumeContext {
    pub invocation_id: String,
    /// Index of the yield being resumed (the invocation's most recent one).
    pub yield_index: u32,
    /// `true` when the yield awaits an explicit `invocation_resume` rather
    /// than tool input.
    pub awaiting_input: bool,
    /// Suspended children, by declared child position.  Multiple entries
    /// occur when a parallel group has more than one suspended child.
    pub children: Vec<ChildResume>,
}

#[derive(Debug, Clone)]
pub struct ChildResume {
    /// Position among the composite's declared children.
    pub index: usize,
    pub context: ResumeContext,
}

/// Compute the resume context for a session log and the runnable about to
/// run.  `None` when nothing is suspended (no open root invocation).
pub fn compute_resume_context(events: &[Event], runnable: &Runnable) -> Option<ResumeContext> {
    let open = open_invocation_path(events);
    let root = open
        .iter()
        .find(|o| o.parent_invocation_id.is_none())?;
    Some(build(events, &open, root, runnable))
}

fn build(
    events: &[Event],
    open: &[OpenInvocation],
    invocation: &OpenInvocation,
    runnable: &Runnable,
) -> ResumeContext {
    let (yield_index, awaiting_input) = match last_yield(events, &invocation.invocation_id) {
        Some((_, _, index, awaiting)) => (index, awaiting),
        None => (0, false),
    };

    let mut children = Vec::new();
    // Dynamic handoff children (spawned from inside an agent's tool) are not
    // part of the declared tree; the agent re-enters itself instead.
    if invocation.kind != RunnableKind::Agent && invocation.kind != RunnableKind::Step {
        let starts = child_starts(events, &invocation.invocation_id);
        for open_child in open
            .iter()
            .filter(|o| o.parent_invocation_id.as_deref() == Some(&invocation.invocation_id))
        {
            let Some(start_pos) = starts
                .iter()
                .position(|s| s.invocation_id == open_child.invocation_id)
            else {
                continue;
            };
            // Start order maps to declared position: sequences and parallels
            // start children in declaration order, loops always re-start
            // child zero.
            let declared = match invocation.kind {
                RunnableKind::Loop => 0,
                _ => start_pos,
            };
            let Some(child_runnable) = runnable.children().get(declared) else {
                continue;
            };
            children.push(ChildResume {
                index: declared,
                context: build(events, open, open_child, child_runnable),
            });
        }
        children.sort_by_key(|c| c.index);
    }

    ResumeContext {
        invocation_id: invocation.invocation_id.clone(),
        yield_index,
        awaiting_input,
        children,
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
