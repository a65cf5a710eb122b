// Copyright (c) 2025-2026 Axon Contributors
//
// SPDX-License-Identifier: Apache-2.0
mod agent;
mod channel;
mod context;
mod fingerprint;
mod handles;
mod invocation;
mod outcome;
mod resume;
mod retry;
mod runnable;
mod runner;
mod tool;
mod workflow;


pub use channel::{ChannelResult, EventChannel, EventSink, GeneratorResult, Producer};
pub use context::{OnStepFn, OnStreamFn, ToolContext};
pub use fingerprint::fingerprint;
pub use handles::{CallOptions, CallResult, DispatchHandle, SpawnHandle};
pub use outcome::DriveOutcome;
pub use resume::{compute_resume_context, ChildResume, ResumeContext};
pub use retry::{with_retry, RetryPolicy};
pub use runnable::{
    AgentDef, CoerceFn, ErrorDecision, FnStepErrorHandler, LoopDef, LoopTick, MergeFn,
    OutputParsePolicy, OutputSpec, ParallelDef, Runnable, SequenceDef, StepDef, StepErrorHandler,
    StepFn, StepInput, StepResult, WhileFn, DEFAULT_MAX_STEPS,
};
pub use runner::{AbortHandle, RunConfig, RunResult, RunStream, Runner};
pub use tool::{FnTool, Tool, ToolCallRequest, ToolReturn};
