// Copyright (c) 2025-2026 Axon Contributors
//
// SPDX-License-Identifier: Apache-2.0
use std::sync::Arc;

use serde_json::Value;
use tokio_util::sync::CancellationToken;

use axon_session::{SessionService, SharedSession};
use axon_types::{EngineError, Event, JsonMap, StateScope, StateSource, StreamEvent};

use crate::channel::{EventChannel, EventSink};
use crate::runnable::Runnable;

/// Observer for every stream event a run produces.
pub type OnStreamFn = Arc<dyn Fn(&StreamEvent) + Send + Sync>;
/// Observer fired after each model step with the step's appended events.
pub type OnStepFn = Arc<dyn Fn(&[Event], &SharedSession, &Runnable) + Send + Sync>;

/// Shared per-run plumbing handed down to every driver.
///
/// Appending is the single write path: the event goes through the session
/// service (which serializes and persists), is recorded in the run's step
/// events, and is mirrored onto the stream.
#[derive(Clone)]
pub(crate) struct RunContext {
    pub session: SharedSession,
    pub service: Arc<dyn SessionService>,
    pub sink: EventSink,
    pub channel: EventChannel,
    pub cancel: CancellationToken,
    pub runnable: Arc<Runnable>,
    pub step_events: Arc<std::sync::Mutex<Vec<Event>>>,
    pub on_stream: Option<OnStreamFn>,
    pub on_step: Option<OnStepFn>,
    pub version: Option<String>,
    pub max_yield_iterations: u32,
}

impl RunContext {
    pub async fn append(&self, event: Event) -> Result<Event, EngineError> {
        let stored = self.service.append_event(&self.session, event).await?;
        self.step_events.lock().unwrap().push(stored.clone());
        self.emit(StreamEvent::Event(stored.clone()));
        Ok(stored)
    }

    pub fn emit(&self, event: StreamEvent) {
        if let Some(cb) = &self.on_stream {
            cb(&event);
        }
        self.sink.push(event);
    }

    pub async fn events_snapshot(&self) -> Vec<Event> {
        self.session.lock().await.events().to_vec()
    }

    /// Fire the per-step callback with the events one model step appended.
    pub fn notify_step(&self, step_events: &[Event]) {
        if let Some(cb) = &self.on_step {
            cb(step_events, &self.session, &self.runnable);
        }
    }

    /// A context for a child driver that streams through its own producer
    /// handle (parallel children, spawned sub-agents).
    pub fn with_sink(&self, sink: EventSink) -> RunContext {
        RunContext {
            sink,
            ..self.clone()
        }
    }

    /// A context whose cancellation is independent of (but linked to) this
    /// run's token.
    pub fn with_child_cancel(&self) -> (RunContext, CancellationToken) {
        let token = self.cancel.child_token();
        (
            RunContext {
                cancel: token.clone(),
                ..self.clone()
            },
            token,
        )
    }
}

/// What a tool sees while executing: scoped state accessors, temp state, and
/// the orchestration handles (`call`/`spawn`/`dispatch`, implemented in
/// `handles.rs`).
///
/// Reads of externally bound scopes (user/patient/practice) record an
/// `observation` state change when the bound value drifted from the last
/// recorded one; mutations write through to the binding and its callback.
#[derive(Clone)]
pub struct ToolContext {
    pub(crate) ctx: RunContext,
    pub invocation_id: String,
    pub agent_name: String,
}

impl ToolContext {
    /// The run's cancellation token; long-running tools should poll or
    /// select on it.
    pub fn abort_signal(&self) -> CancellationToken {
        self.ctx.cancel.clone()
    }

    // ── Scoped state accessors ────────────────────────────────────────────

    pub async fn get_state(
        &self,
        scope: StateScope,
        key: &str,
    ) -> Result<Option<Value>, EngineError> {
        let (observation, value) = {
            let session = self.ctx.session.lock().await;
            (
                session.build_observation(
                    scope,
                    Some(self.invocation_id.clone()),
                    &[key.to_string()],
                ),
                session.scope_values(scope).get(key).cloned(),
            )
        };
        if let Some(event) = observation {
            self.ctx.append(event).await?;
        }
        Ok(value)
    }

    pub async fn get_many(
        &self,
        scope: StateScope,
        keys: &[String],
    ) -> Result<JsonMap, EngineError> {
        let (observation, values) = {
            let session = self.ctx.session.lock().await;
            let mut out = JsonMap::new();
            for key in keys {
                if let Some(v) = session.scope_values(scope).get(key) {
                    out.insert(key.clone(), v.clone());
                }
            }
            (
                session.build_observation(scope, Some(self.invocation_id.clone()), keys),
                out,
            )
        };
        if let Some(event) = observation {
            self.ctx.append(event).await?;
        }
        Ok(values)
    }

    /// The whole scope as a map, observing any external drift.
    pub async fn to_object(&self, scope: StateScope) -> Result<JsonMap, EngineError> {
        let (observation, values) = {
            let session = self.ctx.session.lock().await;
            (
                session.build_full_observation(scope, Some(self.invocation_id.clone())),
                session.scope_values(scope).clone(),
            )
        };
        if let Some(event) = observation {
            self.ctx.append(event).await?;
        }
        Ok(values)
    }

    pub async fn set_state(
        &self,
        scope: StateScope,
        key: impl Into<String>,
        value: Value,
    ) -> Result<(), EngineError> {
        self.update_state(scope, vec![(key.into(), Some(value))]).await
    }

    pub async fn delete_state(
        &self,
        scope: StateScope,
        key: impl Into<String>,
    ) -> Result<(), EngineError> {
        self.update_state(scope, vec![(key.into(), None)]).await
    }

    /// Apply several writes (and deletes) as one `state_change` event.
    pub async fn update_state(
        &self,
        scope: StateScope,
        entries: Vec<(String, Option<Value>)>,
    ) -> Result<(), EngineError> {
        let event = {
            let session = self.ctx.session.lock().await;
            session.build_state_change(
                scope,
                StateSource::Mutation,
                Some(self.invocation_id.clone()),
                entries,
            )
        };
        if let Some(event) = event {
            self.ctx.append(event).await?;
        }
        Ok(())
    }

    // ── Temp state ────────────────────────────────────────────────────────

    pub async fn get_temp(&self, key: &str) -> Option<Value> {
        self.ctx
            .session
            .lock()
            .await
            .temp(&self.invocation_id)
            .and_then(|m| m.get(key).cloned())
    }

    pub async fn set_temp(&self, key: impl Into<String>, value: Value) {
        self.ctx
            .session
            .lock()
            .await
            .temp_mut(&self.invocation_id)
            .insert(key.into(), value);
    }

    pub async fn temp_snapshot(&self) -> JsonMap {
        self.ctx
            .session
            .lock()
            .await
            .temp(&self.invocation_id)
            .cloned()
            .unwrap_or_default()
    }
}
