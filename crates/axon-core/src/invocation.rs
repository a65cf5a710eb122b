// Copyright (c) 2025-2026 Axon Contributors
//
// SPDX-License-Identifier: Apache-2.0
//! The invocation envelope: every runnable activation is bracketed by
//! `invocation_start` (or `invocation_resume`) and a terminal
//! `invocation_end` or `invocation_yield`, so the log always shows where
//! execution entered, suspended, and left.

use async_recursion::async_recursion;

use axon_session::yield_count;
use axon_types::{
    EndReason, EngineError, Event, EventPayload, HandoffOrigin, RunStatus, RunnableKind,
};

use crate::agent::drive_agent;
use crate::context::RunContext;
use crate::outcome::DriveOutcome;
use crate::resume::ResumeContext;
use crate::runnable::Runnable;
use crate::workflow::{drive_loop, drive_parallel, drive_sequence, drive_step};

/// Parameters for one enveloped activation.
#[derive(Clone)]
pub(crate) struct InvocationParams {
    pub invocation_id: String,
    pub parent_invocation_id: Option<String>,
    pub kind: RunnableKind,
    pub agent_name: String,
    pub handoff_origin: Option<HandoffOrigin>,
    /// Root invocations only.
    pub fingerprint: Option<String>,
    pub version: Option<String>,
    /// Suppress envelope emission; the caller owns the envelope.
    pub managed: bool,
    /// The opening event was already appended by the caller (parallel groups
    /// pre-open children so starts land in declaration order); the envelope
    /// still owns the closing event.
    pub opened: bool,
    pub resume: Option<ResumeContext>,
}

impl InvocationParams {
    pub fn child(
        invocation_id: String,
        parent: &str,
        runnable: &Runnable,
        handoff_origin: Option<HandoffOrigin>,
    ) -> Self {
        Self {
            invocation_id,
            parent_invocation_id: Some(parent.to_string()),
            kind: runnable.kind(),
            agent_name: runnable.name().to_string(),
            handoff_origin,
            fingerprint: None,
            version: None,
            managed: false,
            opened: false,
            resume: None,
        }
    }

    pub fn with_resume(mut self, resume: Option<ResumeContext>) -> Self {
        if let Some(rc) = &resume {
            self.invocation_id = rc.invocation_id.clone();
        }
        self.resume = resume;
        self
    }

    /// The event that opens this activation: `invocation_resume` when
    /// resuming, `invocation_start` otherwise.
    pub fn opening_event(&self) -> Event {
        match &self.resume {
            Some(rc) => Event::new(EventPayload::InvocationResume {
                invocation_id: self.invocation_id.clone(),
                yield_index: rc.yield_index,
            }),
            None => Event::new(EventPayload::InvocationStart {
                invocation_id: self.invocation_id.clone(),
                agent_name: self.agent_name.clone(),
                kind: self.kind,
                parent_invocation_id: self.parent_invocation_id.clone(),
                handoff_origin: self.handoff_origin,
                fingerprint: self.fingerprint.clone(),
                version: self.version.clone(),
            }),
        }
    }
}

/// Run a runnable inside its envelope.
///
/// Emits the opening event, drives the variant, then translates the outcome:
/// a yield becomes `invocation_yield` (the invocation stays open, temp state
/// survives), anything else becomes `invocation_end` (temp state is
/// cleared).  Driver errors emit `invocation_end { reason: error }` before
/// propagating, so the log stays well-formed on every path.
#[async_recursion]
pub(crate) async fn run_enveloped(
    runnable: &Runnable,
    ctx: &RunContext,
    params: InvocationParams,
) -> Result<DriveOutcome, EngineError> {
    if !params.managed && !params.opened {
        ctx.append(params.opening_event()).await?;
    }

    let result = match runnable {
        Runnable::Agent(def) => drive_agent(def, ctx, &params).await,
        Runnable::Sequence(def) => drive_sequence(def, ctx, &params).await,
        Runnable::Parallel(def) => drive_parallel(def, ctx, &params).await,
        Runnable::Loop(def) => drive_loop(def, ctx, &params).await,
        Runnable::Step(def) => drive_step(def, ctx, &params).await,
    };

    if params.managed {
        return result;
    }

    match result {
        Ok(outcome) if outcome.is_yielded() => {
            let yield_index = {
                let session = ctx.session.lock().await;
                yield_count(session.events(), &params.invocation_id)
            };
            ctx.append(Event::new(EventPayload::InvocationYield {
                invocation_id: params.invocation_id.clone(),
                pending_call_ids: outcome
                    .pending_calls
                    .iter()
                    .map(|p| p.call_id.clone())
                    .collect(),
                yield_index,
                awaiting_input: outcome.awaiting_input,
            }))
            .await?;
            Ok(outcome)
        }
        Ok(outcome) => {
            ctx.append(Event::new(EventPayload::InvocationEnd {
                invocation_id: params.invocation_id.clone(),
                reason: end_reason(outcome.status),
                iterations: Some(outcome.iterations),
                error: outcome.error.clone(),
                handoff_target: outcome.handoff_target.clone(),
            }))
            .await?;
            ctx.session.lock().await.clear_temp(&params.invocation_id);
            Ok(outcome)
        }
        Err(err) => {
            ctx.append(Event::new(EventPayload::InvocationEnd {
                invocation_id: params.invocation_id.clone(),
                reason: EndReason::Error,
                iterations: None,
                error: Some(err.to_string()),
                handoff_target: None,
            }))
            .await?;
            ctx.session.lock().await.clear_temp(&params.invocation_id);
            Err(err)
        }
    }
}

fn end_reason(status: RunStatus) -> EndReason {
    match status {
        RunStatus::Completed => EndReason::Completed,
        RunStatus::Error => EndReason::Error,
        RunStatus::Aborted => EndReason::Aborted,
        RunStatus::MaxSteps => EndReason::MaxSteps,
        // Yields never reach here; they are handled above.
        RunStatus::Yielded => EndReason::Completed,
    }
}
