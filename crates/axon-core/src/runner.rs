// Copyright (c) 2025-2026 Axon Contributors
//
// SPDX-License-Identifier: Apache-2.0
//! The runner facade: wires a runnable, a session, and the event channel
//! into one run that can be streamed, awaited, and aborted.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::oneshot;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use axon_session::{usage_total, SessionService, SharedSession};
use axon_types::{
    new_invocation_id, EngineError, Event, EventPayload, HandoffOrigin, PendingCall, RunStatus,
    StreamEvent, Usage,
};

use crate::channel::{EventChannel, GeneratorResult};
use crate::context::{OnStepFn, OnStreamFn, RunContext};
use crate::fingerprint::fingerprint;
use crate::invocation::{run_enveloped, InvocationParams};
use crate::outcome::DriveOutcome;
use crate::resume::compute_resume_context;
use crate::runnable::Runnable;

/// Upper bound on chained top-level transfers in one run.
const MAX_TRANSFERS: u32 = 8;

/// Per-run configuration.
#[derive(Clone, Default)]
pub struct RunConfig {
    /// Schedules an abort with reason `"Timeout after {n}ms"`.
    pub timeout: Option<Duration>,
    /// Observer invoked synchronously for every stream event.
    pub on_stream: Option<OnStreamFn>,
    /// Observer invoked after each model step with the step's events.
    pub on_step: Option<OnStepFn>,
    /// External abort handle; the run uses a child token of it.
    pub signal: Option<CancellationToken>,
    /// Cap on `invocation_yield` events per yielding loop (0 = default).
    pub max_yield_iterations: u32,
    /// Recorded on the root `invocation_start`.
    pub version: Option<String>,
}

const DEFAULT_MAX_YIELD_ITERATIONS: u32 = 100;

/// Terminal result of one run.
#[derive(Clone)]
pub struct RunResult {
    pub status: RunStatus,
    pub session: SharedSession,
    /// Model steps executed across the whole run.
    pub iterations: u32,
    /// Every event appended during this run, in order.
    pub step_events: Vec<Event>,
    pub runnable: Arc<Runnable>,
    pub usage: Usage,
    pub output: Option<serde_json::Value>,
    pub pending_calls: Vec<PendingCall>,
    /// Abort reason or failure message, when not completed.
    pub error: Option<String>,
    /// `true` when a yield awaits an explicit resume rather than tool input.
    pub awaiting_input: bool,
}

impl std::fmt::Debug for RunResult {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RunResult")
            .field("status", &self.status)
            .field("iterations", &self.iterations)
            .field("step_events", &self.step_events)
            .field("usage", &self.usage)
            .field("output", &self.output)
            .field("pending_calls", &self.pending_calls)
            .field("error", &self.error)
            .field("awaiting_input", &self.awaiting_input)
            .finish()
    }
}

/// A run in flight: iterable (stream of events), awaitable (`wait`), and
/// abortable.
pub struct RunStream {
    channel: EventChannel,
    session: SharedSession,
    runnable: Arc<Runnable>,
    main_rx: Option<oneshot::Receiver<GeneratorResult>>,
    step_events: Arc<std::sync::Mutex<Vec<Event>>>,
    stream_taken: bool,
}

/// Detached abort handle for a run, usable after the stream has been moved
/// into a consumer.
#[derive(Clone)]
pub struct AbortHandle {
    channel: EventChannel,
}

impl AbortHandle {
    pub fn abort(&self, reason: Option<String>) {
        self.channel.abort(reason);
    }
}

impl RunStream {
    /// Cancel the run.
    pub fn abort(&self, reason: Option<String>) {
        self.channel.abort(reason);
    }

    /// A clonable handle that can abort the run later.
    pub fn abort_handle(&self) -> AbortHandle {
        AbortHandle {
            channel: self.channel.clone(),
        }
    }

    /// Receive the next stream event; `None` once the run has terminated.
    pub async fn next_event(&mut self) -> Option<StreamEvent> {
        self.stream_taken = true;
        self.channel.recv().await
    }

    /// The run as a `futures::Stream`.  May be taken once; a second take is
    /// a stream-already-consumed error.
    pub fn stream(
        &mut self,
    ) -> Result<impl futures::Stream<Item = StreamEvent> + Send + Unpin + 'static, EngineError>
    {
        if self.stream_taken {
            return Err(EngineError::StreamConsumed);
        }
        self.stream_taken = true;
        let channel = self.channel.clone();
        Ok(Box::pin(futures::stream::unfold(channel, |channel| async move {
            channel.recv().await.map(|event| (event, channel))
        })))
    }

    pub fn session(&self) -> &SharedSession {
        &self.session
    }

    /// Drain the stream and return the terminal result.  Waits for the root
    /// driver to finish unwinding so the log is complete even after an
    /// abort.
    pub async fn wait(mut self) -> Result<RunResult, EngineError> {
        while self.channel.recv().await.is_some() {}
        if let Some(main_rx) = self.main_rx.take() {
            let _ = main_rx.await;
        }
        let channel_result = self.channel.take_result();
        if let Some(err) = channel_result.thrown_error {
            return Err(err);
        }

        let step_events = std::mem::take(&mut *self.step_events.lock().unwrap());
        let usage_logged = usage_total(&step_events);

        let result = match channel_result.main_result {
            Some(outcome) => {
                let usage = if outcome.usage.is_zero() {
                    usage_logged
                } else {
                    outcome.usage
                };
                let error = outcome.error.or_else(|| {
                    if outcome.status == RunStatus::Aborted {
                        channel_result.abort_reason.clone()
                    } else {
                        None
                    }
                });
                RunResult {
                    status: outcome.status,
                    session: self.session.clone(),
                    iterations: outcome.iterations,
                    step_events,
                    runnable: self.runnable.clone(),
                    usage,
                    output: outcome.output,
                    pending_calls: outcome.pending_calls,
                    error,
                    awaiting_input: outcome.awaiting_input,
                }
            }
            // No main result: the run was torn down before the root driver
            // reported (abort during startup).
            None => RunResult {
                status: RunStatus::Aborted,
                session: self.session.clone(),
                iterations: 0,
                step_events,
                runnable: self.runnable.clone(),
                usage: usage_logged,
                output: None,
                pending_calls: Vec::new(),
                error: channel_result.abort_reason.clone(),
                awaiting_input: false,
            },
        };
        Ok(result)
    }
}

/// Composes the engine: computes resume context and fingerprint, starts the
/// root driver as the channel's main producer, and exposes the stream.
pub struct Runner {
    service: Arc<dyn SessionService>,
}

impl Runner {
    pub fn new(service: Arc<dyn SessionService>) -> Self {
        Self { service }
    }

    pub fn run(&self, runnable: Runnable, session: SharedSession, config: RunConfig) -> RunStream {
        let runnable = Arc::new(runnable);
        let cancel = match &config.signal {
            Some(signal) => signal.child_token(),
            None => CancellationToken::new(),
        };
        let channel = EventChannel::new(cancel.clone());
        let step_events = Arc::new(std::sync::Mutex::new(Vec::new()));

        if let Some(timeout) = config.timeout {
            let channel_for_timer = channel.clone();
            let cancel_for_timer = cancel.clone();
            tokio::spawn(async move {
                tokio::select! {
                    _ = tokio::time::sleep(timeout) => {
                        channel_for_timer.abort(Some(format!(
                            "Timeout after {}ms",
                            timeout.as_millis()
                        )));
                    }
                    _ = cancel_for_timer.cancelled() => {}
                }
            });
        }

        let ctx_session = session.clone();
        let ctx_service = self.service.clone();
        let ctx_channel = channel.clone();
        let ctx_runnable = runnable.clone();
        let ctx_step_events = step_events.clone();
        let max_yield_iterations = if config.max_yield_iterations == 0 {
            DEFAULT_MAX_YIELD_ITERATIONS
        } else {
            config.max_yield_iterations
        };
        let on_stream = config.on_stream.clone();
        let on_step = config.on_step.clone();
        let version = config.version.clone();

        let main_rx = channel
            .register_generator("runner", true, move |sink| {
                let ctx = RunContext {
                    session: ctx_session,
                    service: ctx_service,
                    sink,
                    channel: ctx_channel,
                    cancel,
                    runnable: ctx_runnable.clone(),
                    step_events: ctx_step_events,
                    on_stream,
                    on_step,
                    version,
                    max_yield_iterations,
                };
                async move { drive_root(ctx, ctx_runnable).await }
            })
            .expect("fresh channel accepts the main producer");

        RunStream {
            channel,
            session,
            runnable,
            main_rx: Some(main_rx),
            step_events,
            stream_taken: false,
        }
    }

    /// Convenience: run and await the terminal result.
    pub async fn run_to_result(
        &self,
        runnable: Runnable,
        session: SharedSession,
        config: RunConfig,
    ) -> Result<RunResult, EngineError> {
        self.run(runnable, session, config).wait().await
    }
}

async fn drive_root(
    ctx: RunContext,
    runnable: Arc<Runnable>,
) -> Result<DriveOutcome, EngineError> {
    runnable.validate()?;
    let current_fp = fingerprint(&runnable);

    let (resume, recorded_fp) = {
        let session = ctx.session.lock().await;
        let events = session.events();
        let resume = compute_resume_context(events, &runnable);
        // Any earlier root invocation pins the session to its fingerprint.
        let recorded = events.iter().rev().find_map(|e| match &e.payload {
            EventPayload::InvocationStart {
                parent_invocation_id: None,
                fingerprint,
                ..
            } => fingerprint.clone(),
            _ => None,
        });
        (resume, recorded)
    };

    if let Some(recorded) = recorded_fp {
        if recorded != current_fp {
            return Err(EngineError::PipelineStructureChanged {
                expected: recorded,
                actual: current_fp,
            });
        }
    }

    let params = InvocationParams {
        invocation_id: new_invocation_id(),
        parent_invocation_id: None,
        kind: runnable.kind(),
        agent_name: runnable.name().to_string(),
        handoff_origin: None,
        fingerprint: Some(current_fp.clone()),
        version: ctx.version.clone(),
        managed: false,
        opened: false,
        resume: None,
    }
    .with_resume(resume);
    debug!(root = %runnable.name(), resuming = params.resume.is_some(), "run starting");

    let mut outcome = run_enveloped(&runnable, &ctx, params).await?;

    // Top-level transfers: replace the current agent with the named target.
    let mut transfers = 0u32;
    while let Some(target) = outcome.handoff_target.clone() {
        transfers += 1;
        if transfers > MAX_TRANSFERS {
            return Err(EngineError::Validation(format!(
                "transfer chain exceeded {MAX_TRANSFERS} hops"
            )));
        }
        let Some(next) = runnable.find(&target) else {
            return Err(EngineError::Validation(format!(
                "transfer target {target:?} not found in the runnable tree"
            )));
        };
        debug!(target = %target, "top-level transfer");
        let params = InvocationParams {
            invocation_id: new_invocation_id(),
            parent_invocation_id: None,
            kind: next.kind(),
            agent_name: next.name().to_string(),
            handoff_origin: Some(HandoffOrigin::Transfer),
            fingerprint: Some(current_fp.clone()),
            version: ctx.version.clone(),
            managed: false,
            opened: false,
            resume: None,
        };
        let next_outcome = run_enveloped(next, &ctx, params).await?;
        let mut merged = next_outcome;
        merged.iterations += outcome.iterations;
        let mut usage = outcome.usage;
        usage.add(merged.usage);
        merged.usage = usage;
        outcome = merged;
    }

    Ok(outcome)
}
