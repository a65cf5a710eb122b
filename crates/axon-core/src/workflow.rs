// Copyright (c) 2025-2026 Axon Contributors
//
// SPDX-License-Identifier: Apache-2.0
//! Drivers for the composite runnables.
//!
//! Sequences run children left to right and propagate the first non-completed
//! status.  Parallel groups fan children out as extra channel producers and
//! join them all.  Loops re-run a single child under a predicate and an
//! iteration cap.  Steps run an inline closure.

use std::collections::{HashMap, HashSet};

use serde_json::Value;
use tracing::debug;

use axon_session::{child_starts, yield_count};
use axon_types::{
    new_invocation_id, EngineError, Event, PendingCall, RunStatus, StateScope, StateSource, Usage,
};

use crate::context::RunContext;
use crate::invocation::{run_enveloped, InvocationParams};
use crate::outcome::DriveOutcome;
use crate::resume::ResumeContext;
use crate::runnable::{LoopDef, LoopTick, ParallelDef, SequenceDef, StepDef, StepInput, StepResult};

// ─── Sequence ─────────────────────────────────────────────────────────────────

pub(crate) async fn drive_sequence(
    def: &SequenceDef,
    ctx: &RunContext,
    params: &InvocationParams,
) -> Result<DriveOutcome, EngineError> {
    let inv = &params.invocation_id;
    let mut iterations = 0u32;
    let mut usage = Usage::default();
    let mut last_output: Option<Value> = None;

    let (start_index, mut child_resume) = match &params.resume {
        Some(rc) => match rc.children.first() {
            Some(child) => (child.index, Some(child.context.clone())),
            // No child is open: every started child also ended, so execution
            // continues at the next declared child.
            None => {
                let session = ctx.session.lock().await;
                (child_starts(session.events(), inv).len(), None)
            }
        },
        None => (0, None),
    };

    for child in def.children.iter().skip(start_index) {
        if ctx.cancel.is_cancelled() {
            return Ok(DriveOutcome::aborted(iterations, usage));
        }
        let child_params = InvocationParams::child(new_invocation_id(), inv, child, None)
            .with_resume(child_resume.take());
        let outcome = run_enveloped(child, ctx, child_params).await?;
        iterations += outcome.iterations;
        usage.add(outcome.usage);

        match outcome.status {
            RunStatus::Completed => {
                if let Some(target) = outcome.handoff_target {
                    return Ok(DriveOutcome::transfer(target, iterations, usage));
                }
                last_output = outcome.output;
            }
            RunStatus::Yielded => {
                return Ok(DriveOutcome::yielded(
                    outcome.pending_calls,
                    outcome.awaiting_input,
                    iterations,
                    usage,
                ));
            }
            RunStatus::Error => {
                return Ok(DriveOutcome::error(
                    outcome.error.unwrap_or_else(|| "child failed".into()),
                    iterations,
                    usage,
                ));
            }
            RunStatus::Aborted => return Ok(DriveOutcome::aborted(iterations, usage)),
            RunStatus::MaxSteps => return Ok(DriveOutcome::max_steps(iterations, usage)),
        }
    }

    Ok(DriveOutcome::completed(last_output, iterations, usage))
}

// ─── Parallel ─────────────────────────────────────────────────────────────────

pub(crate) async fn drive_parallel(
    def: &ParallelDef,
    ctx: &RunContext,
    params: &InvocationParams,
) -> Result<DriveOutcome, EngineError> {
    let inv = params.invocation_id.clone();

    let resume_children: HashMap<usize, ResumeContext> = params
        .resume
        .as_ref()
        .map(|rc| {
            rc.children
                .iter()
                .map(|c| (c.index, c.context.clone()))
                .collect()
        })
        .unwrap_or_default();

    // On resume, children that already completed in a previous run are not
    // re-executed.  Their outputs are unavailable to the merge hook (the log
    // records their events, not their return values).
    let finished: HashSet<usize> = if params.resume.is_some() {
        let session = ctx.session.lock().await;
        let events = session.events();
        child_starts(events, &inv)
            .iter()
            .enumerate()
            .filter(|(_, start)| {
                axon_session::find_invocation_boundary(events, &start.invocation_id)
                    .map(|b| b.end_index.is_some())
                    .unwrap_or(false)
            })
            .map(|(position, _)| position)
            .collect()
    } else {
        HashSet::new()
    };

    let mut receivers = Vec::with_capacity(def.children.len());
    for (index, child) in def.children.iter().enumerate() {
        if finished.contains(&index) && !resume_children.contains_key(&index) {
            debug!(parallel = %def.name, child = %child.name(), "already completed; skipping");
            receivers.push((index, None));
            continue;
        }
        let mut child_params = InvocationParams::child(new_invocation_id(), &inv, child, None)
            .with_resume(resume_children.get(&index).cloned());
        // Open the child envelope here, before spawning, so invocation
        // starts land in declaration order and resume can map open children
        // back to declared positions.
        ctx.append(child_params.opening_event()).await?;
        child_params.opened = true;

        let child_runnable = child.clone();
        let base_ctx = ctx.clone();
        let receiver = ctx.channel.register_generator(
            format!("{}/{}", def.name, child.name()),
            false,
            move |sink| {
                let child_ctx = base_ctx.with_sink(sink);
                async move { run_enveloped(&child_runnable, &child_ctx, child_params).await }
            },
        )?;
        receivers.push((index, Some(receiver)));
    }

    let mut outputs: Vec<Option<Value>> = vec![None; def.children.len()];
    let mut iterations = 0u32;
    let mut usage = Usage::default();
    let mut pending: Vec<PendingCall> = Vec::new();
    let mut awaiting_input = false;
    let mut any_yielded = false;
    let mut any_aborted = false;
    let mut any_max_steps = false;
    let mut first_error: Option<String> = None;

    for (index, receiver) in receivers {
        let Some(receiver) = receiver else { continue };
        match receiver.await {
            Ok(report) => {
                if let Some(outcome) = report.result {
                    iterations += outcome.iterations;
                    usage.add(outcome.usage);
                    match outcome.status {
                        RunStatus::Completed => outputs[index] = outcome.output,
                        RunStatus::Yielded => {
                            any_yielded = true;
                            awaiting_input |= outcome.awaiting_input;
                            pending.extend(outcome.pending_calls);
                        }
                        RunStatus::Error => {
                            first_error.get_or_insert(
                                outcome.error.unwrap_or_else(|| "child failed".into()),
                            );
                        }
                        RunStatus::Aborted => any_aborted = true,
                        RunStatus::MaxSteps => any_max_steps = true,
                    }
                } else if let Some(error) = report.error {
                    first_error.get_or_insert(error);
                }
            }
            Err(_) => {
                first_error.get_or_insert("child task dropped before reporting".into());
            }
        }
    }

    if any_aborted || ctx.cancel.is_cancelled() {
        return Ok(DriveOutcome::aborted(iterations, usage));
    }
    if any_yielded {
        return Ok(DriveOutcome::yielded(pending, awaiting_input, iterations, usage));
    }
    if let Some(error) = first_error {
        return Ok(DriveOutcome::error(error, iterations, usage));
    }
    if any_max_steps {
        return Ok(DriveOutcome::max_steps(iterations, usage));
    }

    let merged = match &def.merge {
        Some(merge) => merge(&outputs),
        None => Value::Array(
            outputs
                .into_iter()
                .map(|o| o.unwrap_or(Value::Null))
                .collect(),
        ),
    };
    Ok(DriveOutcome::completed(Some(merged), iterations, usage))
}

// ─── Loop ─────────────────────────────────────────────────────────────────────

pub(crate) async fn drive_loop(
    def: &LoopDef,
    ctx: &RunContext,
    params: &InvocationParams,
) -> Result<DriveOutcome, EngineError> {
    let inv = &params.invocation_id;
    let mut iterations_total = 0u32;
    let mut usage = Usage::default();
    let mut last_output: Option<Value> = None;

    let (mut iteration, mut child_resume) = match &params.resume {
        Some(rc) => {
            let session = ctx.session.lock().await;
            let started = child_starts(session.events(), inv).len() as u32;
            match rc.children.first() {
                // A child is still open: its iteration is in flight.
                Some(child) => (started.saturating_sub(1), Some(child.context.clone())),
                // The loop itself was suspended between iterations.
                None => (started, None),
            }
        }
        None => (0, None),
    };

    loop {
        if ctx.cancel.is_cancelled() {
            return Ok(DriveOutcome::aborted(iterations_total, usage));
        }
        if iteration >= def.max_iterations {
            break;
        }
        if !while_continues(def, ctx, iteration, &last_output).await {
            break;
        }

        let child_params = InvocationParams::child(new_invocation_id(), inv, &def.child, None)
            .with_resume(child_resume.take());
        let outcome = run_enveloped(&def.child, ctx, child_params).await?;
        iterations_total += outcome.iterations;
        usage.add(outcome.usage);

        match outcome.status {
            RunStatus::Completed => last_output = outcome.output,
            RunStatus::Yielded => {
                return Ok(DriveOutcome::yielded(
                    outcome.pending_calls,
                    outcome.awaiting_input,
                    iterations_total,
                    usage,
                ));
            }
            RunStatus::Error => {
                return Ok(DriveOutcome::error(
                    outcome.error.unwrap_or_else(|| "loop child failed".into()),
                    iterations_total,
                    usage,
                ));
            }
            RunStatus::Aborted => return Ok(DriveOutcome::aborted(iterations_total, usage)),
            RunStatus::MaxSteps => return Ok(DriveOutcome::max_steps(iterations_total, usage)),
        }

        iteration += 1;

        // A yielding loop suspends between iterations, awaiting an explicit
        // resume, as long as another iteration would actually run.
        if def.yields
            && iteration < def.max_iterations
            && while_continues(def, ctx, iteration, &last_output).await
        {
            let yields_so_far = {
                let session = ctx.session.lock().await;
                yield_count(session.events(), inv)
            };
            if yields_so_far >= ctx.max_yield_iterations {
                return Err(EngineError::Validation(format!(
                    "loop {} exceeded max yield iterations ({})",
                    def.name, ctx.max_yield_iterations
                )));
            }
            return Ok(DriveOutcome::yielded(vec![], true, iterations_total, usage));
        }
    }

    Ok(DriveOutcome::completed(last_output, iterations_total, usage))
}

async fn while_continues(
    def: &LoopDef,
    ctx: &RunContext,
    iteration: u32,
    last_output: &Option<Value>,
) -> bool {
    let Some(predicate) = &def.while_fn else {
        return true;
    };
    let tick = {
        let session = ctx.session.lock().await;
        LoopTick {
            iteration,
            last_output: last_output.clone(),
            state: session.state().clone(),
        }
    };
    predicate(&tick)
}

// ─── Step ─────────────────────────────────────────────────────────────────────

pub(crate) async fn drive_step(
    def: &StepDef,
    ctx: &RunContext,
    params: &InvocationParams,
) -> Result<DriveOutcome, EngineError> {
    let inv = &params.invocation_id;
    let input = {
        let session = ctx.session.lock().await;
        StepInput {
            invocation_id: inv.clone(),
            state: session.state().clone(),
            temp: session.temp(inv).cloned().unwrap_or_default(),
            session: ctx.session.clone(),
        }
    };

    let usage = Usage::default();
    match (def.execute)(input).await {
        Err(err) => Ok(DriveOutcome::error(err.to_string(), 0, usage)),
        Ok(StepResult::Skip) | Ok(StepResult::Done) => {
            Ok(DriveOutcome::completed(None, 0, usage))
        }
        Ok(StepResult::Fail(message)) => Ok(DriveOutcome::error(message, 0, usage)),
        Ok(StepResult::Respond(text)) => {
            ctx.append(Event::assistant(inv.clone(), def.name.clone(), text.clone()))
                .await?;
            Ok(DriveOutcome::completed(
                Some(Value::String(text)),
                0,
                usage,
            ))
        }
        Ok(StepResult::Complete { key, value }) => {
            if let (Some(key), Some(value)) = (&key, &value) {
                let event = {
                    let session = ctx.session.lock().await;
                    session.build_state_change(
                        StateScope::Session,
                        StateSource::Mutation,
                        Some(inv.clone()),
                        vec![(key.clone(), Some(value.clone()))],
                    )
                };
                if let Some(event) = event {
                    ctx.append(event).await?;
                }
            }
            Ok(DriveOutcome::completed(value, 0, usage))
        }
        Ok(StepResult::Run(child)) => {
            child.validate()?;
            let child_params = InvocationParams::child(new_invocation_id(), inv, &child, None);
            {
                let mut session = ctx.session.lock().await;
                session.inherit_temp(inv, &child_params.invocation_id, Default::default());
            }
            run_enveloped(&child, ctx, child_params).await
        }
    }
}
