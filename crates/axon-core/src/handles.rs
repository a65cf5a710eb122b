// Copyright (c) 2025-2026 Axon Contributors
//
// SPDX-License-Identifier: Apache-2.0
//! Orchestration handles exposed to tools: synchronous `call`, background
//! `spawn`, and fire-and-forget `dispatch`.
//!
//! All three mint a fresh invocation id, inherit the parent's temp state
//! (with optional overrides), and open the child with a matching handoff
//! origin.  Temp state is cleared by the child's envelope on end.

use std::time::Duration;

use serde_json::Value;
use tokio::sync::oneshot;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use axon_types::{
    new_invocation_id, EngineError, Event, HandoffOrigin, JsonMap, RunStatus, Usage,
};

use crate::channel::GeneratorResult;
use crate::context::ToolContext;
use crate::invocation::{run_enveloped, InvocationParams};
use crate::outcome::DriveOutcome;
use crate::runnable::Runnable;

/// Options shared by all three handoff methods.
#[derive(Default)]
pub struct CallOptions {
    /// Per-key overrides applied on top of the inherited temp scope.
    pub temp_state: JsonMap,
    /// Pushed as a `user` event in the child's scope before it runs.
    pub message: Option<String>,
}

impl CallOptions {
    pub fn with_message(message: impl Into<String>) -> Self {
        Self {
            message: Some(message.into()),
            temp_state: JsonMap::new(),
        }
    }

    pub fn with_temp(mut self, key: impl Into<String>, value: Value) -> Self {
        self.temp_state.insert(key.into(), value);
        self
    }
}

/// Result of a drained child invocation.
#[derive(Debug, Clone)]
pub struct CallResult {
    pub invocation_id: String,
    pub agent_name: String,
    pub status: RunStatus,
    pub output: Option<Value>,
    pub error: Option<String>,
    pub iterations: u32,
    pub usage: Usage,
}

impl CallResult {
    fn from_outcome(invocation_id: String, agent_name: String, outcome: DriveOutcome) -> Self {
        Self {
            invocation_id,
            agent_name,
            status: outcome.status,
            output: outcome.output,
            error: outcome.error,
            iterations: outcome.iterations,
            usage: outcome.usage,
        }
    }
}

/// Awaitable handle to a spawned child.
pub struct SpawnHandle {
    pub invocation_id: String,
    pub agent_name: String,
    receiver: oneshot::Receiver<GeneratorResult>,
    cancel: CancellationToken,
}

impl SpawnHandle {
    /// Await the child's completion.  A timeout leaves the child running —
    /// the handle stays usable, so callers may retry or `abort`.
    pub async fn wait(&mut self, timeout: Option<Duration>) -> Result<CallResult, EngineError> {
        let receiver = &mut self.receiver;
        let report = match timeout {
            Some(deadline) => match tokio::time::timeout(deadline, receiver).await {
                Ok(report) => report,
                Err(_) => return Err(EngineError::Timeout(deadline.as_millis() as u64)),
            },
            None => receiver.await,
        };
        let report = report.map_err(|_| EngineError::ChannelClosed)?;
        Ok(report_to_result(
            self.invocation_id.clone(),
            self.agent_name.clone(),
            report,
        ))
    }

    /// Cancel the child (and only the child).
    pub fn abort(&self) {
        self.cancel.cancel();
    }
}

/// Receipt for a fire-and-forget child.
#[derive(Debug, Clone)]
pub struct DispatchHandle {
    pub invocation_id: String,
    pub agent_name: String,
}

fn report_to_result(
    invocation_id: String,
    agent_name: String,
    report: GeneratorResult,
) -> CallResult {
    match report.result {
        Some(outcome) => CallResult::from_outcome(invocation_id, agent_name, outcome),
        None => CallResult {
            invocation_id,
            agent_name,
            status: RunStatus::Error,
            output: None,
            error: report.error,
            iterations: 0,
            usage: Usage::default(),
        },
    }
}

impl ToolContext {
    async fn open_child(
        &self,
        runnable: &Runnable,
        origin: HandoffOrigin,
        opts: &CallOptions,
    ) -> Result<InvocationParams, EngineError> {
        runnable.validate()?;
        let child_id = new_invocation_id();
        {
            let mut session = self.ctx.session.lock().await;
            session.inherit_temp(&self.invocation_id, &child_id, opts.temp_state.clone());
        }
        if let Some(message) = &opts.message {
            self.ctx
                .append(Event::user(message.clone(), Some(child_id.clone())))
                .await?;
        }
        Ok(InvocationParams::child(
            child_id,
            &self.invocation_id,
            runnable,
            Some(origin),
        ))
    }

    /// Run a child to completion and return its output.  Refuses to return a
    /// suspended child: a yielding sub-agent needs `spawn` and an external
    /// answer, not a synchronous drain.
    pub async fn call(
        &self,
        runnable: Runnable,
        opts: CallOptions,
    ) -> Result<CallResult, EngineError> {
        let params = self.open_child(&runnable, HandoffOrigin::Call, &opts).await?;
        let child_id = params.invocation_id.clone();
        debug!(parent = %self.invocation_id, child = %child_id, agent = %runnable.name(), "call");
        let outcome = run_enveloped(&runnable, &self.ctx, params).await?;
        if outcome.is_yielded() {
            return Err(EngineError::ChildYielded(child_id));
        }
        Ok(CallResult::from_outcome(
            child_id,
            runnable.name().to_string(),
            outcome,
        ))
    }

    /// Launch a child concurrently through the run's event channel and
    /// return an awaitable handle.  The session's spawn tracker records the
    /// child's lifecycle.
    pub async fn spawn(
        &self,
        runnable: Runnable,
        opts: CallOptions,
    ) -> Result<SpawnHandle, EngineError> {
        let params = self.open_child(&runnable, HandoffOrigin::Spawn, &opts).await?;
        let child_id = params.invocation_id.clone();
        let agent_name = runnable.name().to_string();

        let tracker = {
            let session = self.ctx.session.lock().await;
            session.spawns.clone()
        };
        tracker.start(&child_id, &agent_name);

        let (child_ctx, child_cancel) = self.ctx.with_child_cancel();
        let tracker_for_task = tracker.clone();
        let task_id = child_id.clone();
        let receiver = self.ctx.channel.register_generator(
            format!("spawn/{agent_name}"),
            false,
            move |sink| {
                let ctx = child_ctx.with_sink(sink);
                async move {
                    let result = run_enveloped(&runnable, &ctx, params).await;
                    match &result {
                        Ok(outcome) if outcome.status == RunStatus::Error => {
                            tracker_for_task.fail(
                                &task_id,
                                outcome.error.clone().unwrap_or_else(|| "error".into()),
                            );
                        }
                        Ok(_) => tracker_for_task.complete(&task_id),
                        Err(err) => tracker_for_task.fail(&task_id, err.to_string()),
                    }
                    result
                }
            },
        )?;

        Ok(SpawnHandle {
            invocation_id: child_id,
            agent_name,
            receiver,
            cancel: child_cancel,
        })
    }

    /// Launch a child and forget it.  Failures are logged and recorded in
    /// the spawn tracker; they never surface to the caller.
    pub async fn dispatch(
        &self,
        runnable: Runnable,
        opts: CallOptions,
    ) -> Result<DispatchHandle, EngineError> {
        let params = self
            .open_child(&runnable, HandoffOrigin::Dispatch, &opts)
            .await?;
        let child_id = params.invocation_id.clone();
        let agent_name = runnable.name().to_string();

        let tracker = {
            let session = self.ctx.session.lock().await;
            session.spawns.clone()
        };
        tracker.start(&child_id, &agent_name);

        let (child_ctx, _child_cancel) = self.ctx.with_child_cancel();
        let tracker_for_task = tracker.clone();
        let task_id = child_id.clone();
        let dispatch_id = child_id.clone();
        self.ctx.channel.register_generator(
            format!("dispatch/{agent_name}"),
            false,
            move |sink| {
                let ctx = child_ctx.with_sink(sink);
                async move {
                    let result = run_enveloped(&runnable, &ctx, params).await;
                    match &result {
                        Ok(outcome) if outcome.status == RunStatus::Error => {
                            let message =
                                outcome.error.clone().unwrap_or_else(|| "error".into());
                            warn!(invocation = %task_id, error = %message, "dispatched child failed");
                            tracker_for_task.fail(&task_id, message);
                        }
                        Ok(_) => tracker_for_task.complete(&task_id),
                        Err(err) => {
                            warn!(invocation = %task_id, error = %err, "dispatched child failed");
                            tracker_for_task.fail(&task_id, err.to_string());
                        }
                    }
                    result
                }
            },
        )?;

        Ok(DispatchHandle {
            invocation_id: dispatch_id,
            agent_name,
        })
    }
}
