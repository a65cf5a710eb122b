// Copyright (c) 2025-2026 Axon Contributors
//
// SPDX-License-Identifier: Apache-2.0
//! axon — execution core for composable multi-agent runtimes.
//!
//! Runnables (agents, sequences, parallel groups, loops, steps) are driven
//! through a model/tool loop over an event-sourced session.  Runs stream
//! their events, suspend on tools that await external input, and resume from
//! the log — guarded by a content-addressed fingerprint of the runnable
//! tree.
//!
//! ```no_run
//! use std::sync::Arc;
//!
//! use axon::{
//!     AgentDef, CreateSessionOptions, EchoAdapter, MemorySessionService, RunConfig, Runnable,
//!     Runner, SessionService,
//! };
//!
//! # async fn demo() -> Result<(), Box<dyn std::error::Error>> {
//! let service = MemorySessionService::new_arc();
//! let session = service
//!     .create_session("clinic", CreateSessionOptions::default())
//!     .await?;
//!
//! let agent = Runnable::agent(AgentDef::new("greeter", Arc::new(EchoAdapter)));
//! let runner = Runner::new(service);
//! let result = runner
//!     .run_to_result(agent, session, RunConfig::default())
//!     .await?;
//! println!("{:?}", result.status);
//! # Ok(())
//! # }
//! ```

pub use axon_types::{
    new_call_id, new_event_id, new_invocation_id, now_ms, EndReason, EngineError, Event,
    EventPayload, HandoffOrigin, JsonMap, PendingCall, RunStatus, RunnableKind, SessionError,
    SessionStatus, Snapshot, StateDelta, StateScope, StateSource, StreamEvent, Usage,
};

pub use axon_model::{
    is_transient, ContextRenderer, EchoAdapter, InstructionRenderer, ModelAdapter, ModelEvent,
    ModelStream, ProviderTool, RenderContext, ScriptedAdapter, TailWindowRenderer, ToolChoice,
    ToolSchema, TransientModelError,
};

pub use axon_session::{
    child_starts, find_invocation_boundary, has_tool_input, last_yield, open_invocation_path,
    pending_calls, snapshot_at, state_at, status, usage_total, yield_count, ChangeCallback,
    CreateSessionOptions, FsSessionService, InvocationBoundary, MemorySessionService,
    OpenInvocation, Session, SessionService, SessionSnapshot, SharedSession, SpawnRecord,
    SpawnStatus, SpawnTracker, StateBinding,
};

pub use axon_core::{
    compute_resume_context, fingerprint, with_retry, AbortHandle, AgentDef, CallOptions,
    CallResult, ChannelResult, ChildResume, CoerceFn, DispatchHandle, DriveOutcome, ErrorDecision,
    EventChannel, EventSink, FnStepErrorHandler, FnTool, GeneratorResult, LoopDef, LoopTick,
    MergeFn, OnStepFn, OnStreamFn, OutputParsePolicy, OutputSpec, ParallelDef, Producer,
    ResumeContext, RetryPolicy,
    RunConfig, RunResult, RunStream, Runnable, Runner, SequenceDef, SpawnHandle, StepDef,
    StepErrorHandler, StepFn, StepInput, StepResult, Tool, ToolCallRequest, ToolContext,
    ToolReturn, WhileFn, DEFAULT_MAX_STEPS,
};
