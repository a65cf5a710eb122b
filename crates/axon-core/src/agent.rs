// Copyright (c) 2025-2026 Axon Contributors
//
// SPDX-License-Identifier: Apache-2.0
//! The agent reasoning driver: context build → model step → tool dispatch →
//! repeat, up to the agent's step budget.
//!
//! Yields, handoffs, and transfers are reported as tagged outcomes up the
//! call stack, never as thrown control flow.  Tool-execution failures are
//! recorded as `tool_result { error }` and the loop continues; only model
//! failures that survive retries and the error-handler chain end the
//! invocation.

use std::collections::HashMap;

use futures::StreamExt;
use serde_json::Value;
use tracing::{debug, warn};

use axon_model::{is_transient, ModelEvent, RenderContext};
use axon_session::has_tool_input;
use axon_types::{
    new_call_id, EngineError, Event, EventPayload, PendingCall, Usage,
};

use crate::context::{RunContext, ToolContext};
use crate::invocation::{run_enveloped, InvocationParams};
use crate::outcome::DriveOutcome;
use crate::retry::with_retry;
use crate::runnable::{AgentDef, ErrorDecision, OutputParsePolicy, OutputSpec};
use crate::tool::{Tool, ToolCallRequest, ToolReturn};

/// Cap on error-handler-driven step retries, so a handler that always
/// answers `Retry` cannot spin forever.
const MAX_HANDLER_RETRIES: u32 = 3;

pub(crate) async fn drive_agent(
    def: &AgentDef,
    ctx: &RunContext,
    params: &InvocationParams,
) -> Result<DriveOutcome, EngineError> {
    let inv = params.invocation_id.clone();
    let mut iterations = 0u32;
    let mut usage = Usage::default();
    let mut output_retries = 0u32;

    loop {
        if ctx.cancel.is_cancelled() {
            return Ok(DriveOutcome::aborted(iterations, usage));
        }
        if iterations >= def.max_steps {
            debug!(agent = %def.name, max_steps = def.max_steps, "step budget exhausted");
            return Ok(DriveOutcome::max_steps(iterations, usage));
        }
        iterations += 1;

        let render = build_render_context(def, ctx, &inv).await;
        let step = match run_model_step(def, ctx, &inv, render, &mut usage).await? {
            StepFlow::Aborted => return Ok(DriveOutcome::aborted(iterations, usage)),
            StepFlow::SkipTerminal => {
                return Ok(DriveOutcome::completed(None, iterations, usage));
            }
            StepFlow::Replaced(text) => {
                let event = Event::assistant(inv.clone(), def.name.clone(), text.clone());
                let stored = ctx.append(event).await?;
                ctx.notify_step(std::slice::from_ref(&stored));
                match finish_terminal(def, ctx, &inv, &text, &mut output_retries).await? {
                    Terminal::Done(output) => {
                        return Ok(DriveOutcome::completed(output, iterations, usage));
                    }
                    Terminal::RetryStep => continue,
                }
            }
            StepFlow::Step(step) => step,
        };

        ctx.notify_step(&step.events);

        if step.tool_calls.is_empty() {
            match finish_terminal(def, ctx, &inv, &step.text, &mut output_retries).await? {
                Terminal::Done(output) => {
                    return Ok(DriveOutcome::completed(output, iterations, usage));
                }
                Terminal::RetryStep => continue,
            }
        }

        // Tool dispatch.
        let mut pending: Vec<PendingCall> = Vec::new();
        let mut transfer: Option<String> = None;
        let tool_ctx = ToolContext {
            ctx: ctx.clone(),
            invocation_id: inv.clone(),
            agent_name: def.name.clone(),
        };

        for call in &step.tool_calls {
            if ctx.cancel.is_cancelled() {
                return Ok(DriveOutcome::aborted(iterations, usage));
            }
            if def.is_provider_tool(&call.name) {
                // Executed by the model provider; nothing to dispatch.
                debug!(tool = %call.name, "provider tool call passed through");
                continue;
            }
            let allowed = def
                .allowed_tools
                .as_ref()
                .map(|names| names.iter().any(|n| n == &call.name))
                .unwrap_or(true);
            let Some(tool) = def.find_tool(&call.name).filter(|_| allowed) else {
                ctx.append(Event::tool_error(
                    &call.call_id,
                    &call.name,
                    format!("unknown tool: {}", call.name),
                ))
                .await?;
                continue;
            };

            if tool.yield_schema().is_some() {
                let resolved = {
                    let session = ctx.session.lock().await;
                    has_tool_input(session.events(), &call.call_id)
                };
                if resolved {
                    // An earlier run already answered this call; the yield is
                    // resolved and the loop proceeds.
                    debug!(call_id = %call.call_id, "yielding call already resolved");
                    continue;
                }
                match tool.prepare(&tool_ctx, call.args.clone()).await {
                    Ok(prepared) => {
                        ctx.append(Event::tool_yield(&call.call_id, &call.name, prepared))
                            .await?;
                        pending.push(PendingCall {
                            call_id: call.call_id.clone(),
                            name: call.name.clone(),
                        });
                    }
                    Err(err) => {
                        ctx.append(Event::tool_error(&call.call_id, &call.name, err.to_string()))
                            .await?;
                    }
                }
                continue;
            }

            match dispatch_function_tool(
                tool.as_ref(),
                ctx,
                &tool_ctx,
                call,
                &mut iterations,
                &mut usage,
            )
            .await?
            {
                Dispatched::Handled => {}
                Dispatched::Transfer(target) => transfer = Some(target),
                Dispatched::ChildYielded(child_pending) => pending.extend(child_pending),
                Dispatched::Aborted => return Ok(DriveOutcome::aborted(iterations, usage)),
            }
        }

        if let Some(target) = transfer {
            return Ok(DriveOutcome::transfer(target, iterations, usage));
        }
        if !pending.is_empty() {
            return Ok(DriveOutcome::yielded(pending, false, iterations, usage));
        }
    }
}

// ─── Context build ────────────────────────────────────────────────────────────

async fn build_render_context(def: &AgentDef, ctx: &RunContext, inv: &str) -> RenderContext {
    let (events, state) = {
        let session = ctx.session.lock().await;
        (session.events().to_vec(), session.state().clone())
    };
    let function_tools = def
        .tools
        .iter()
        .filter(|t| {
            def.allowed_tools
                .as_ref()
                .map(|names| names.iter().any(|n| n == t.name()))
                .unwrap_or(true)
        })
        .map(|t| t.schema())
        .collect();

    let mut render = RenderContext {
        events,
        function_tools,
        provider_tools: def.provider_tools.clone(),
        tool_choice: def.tool_choice.clone(),
        output_schema: def.output.as_ref().map(|o| o.schema.clone()),
        allowed_tools: def.allowed_tools.clone(),
        agent_name: def.name.clone(),
        invocation_id: inv.to_string(),
        state,
    };
    for renderer in &def.renderers {
        render = renderer.render(render);
    }
    render
}

// ─── Model step ───────────────────────────────────────────────────────────────

enum StepFlow {
    Step(StepData),
    /// Cancellation observed mid-step.
    Aborted,
    /// An error handler chose to skip the failing step.
    SkipTerminal,
    /// An error handler substituted a replacement response.
    Replaced(String),
}

struct StepData {
    text: String,
    tool_calls: Vec<ToolCallRequest>,
    /// Events appended for this step, in order.
    events: Vec<Event>,
}

enum StepError {
    Model(anyhow::Error),
    Engine(EngineError),
}

async fn run_model_step(
    def: &AgentDef,
    ctx: &RunContext,
    inv: &str,
    render: RenderContext,
    usage: &mut Usage,
) -> Result<StepFlow, EngineError> {
    let mut attempt = 0u32;
    let mut handler_retries = 0u32;

    loop {
        attempt += 1;
        if ctx.cancel.is_cancelled() {
            return Ok(StepFlow::Aborted);
        }

        ctx.append(Event::new(EventPayload::ModelStart {
            invocation_id: inv.to_string(),
            agent_name: def.name.clone(),
        }))
        .await?;

        match attempt_model_step(def, ctx, inv, render.clone()).await {
            Ok(attempt_result) => {
                if let Some(step_usage) = attempt_result.usage {
                    usage.add(step_usage);
                }
                ctx.append(Event::new(EventPayload::ModelEnd {
                    invocation_id: inv.to_string(),
                    agent_name: def.name.clone(),
                    usage: attempt_result.usage,
                    finish_reason: attempt_result.finish_reason.clone(),
                }))
                .await?;
                if attempt_result.aborted {
                    return Ok(StepFlow::Aborted);
                }
                return Ok(StepFlow::Step(attempt_result.data));
            }
            Err(StepError::Engine(err)) => return Err(err),
            Err(StepError::Model(err)) => {
                ctx.append(Event::new(EventPayload::ModelEnd {
                    invocation_id: inv.to_string(),
                    agent_name: def.name.clone(),
                    usage: None,
                    finish_reason: Some("error".into()),
                }))
                .await?;

                if is_transient(&err) && attempt < def.model_retry.max_attempts {
                    let delay = def.model_retry.delay_for(attempt);
                    debug!(agent = %def.name, attempt, error = %err, "transient model error; retrying");
                    tokio::select! {
                        _ = tokio::time::sleep(delay) => continue,
                        _ = ctx.cancel.cancelled() => return Ok(StepFlow::Aborted),
                    }
                }

                // Non-retryable (or retries exhausted): consult the handler
                // chain; the first decision wins.
                if let Some(handler) = def.error_handlers.first() {
                    match handler.handle(&err, attempt).await {
                        ErrorDecision::Retry if handler_retries < MAX_HANDLER_RETRIES => {
                            handler_retries += 1;
                            continue;
                        }
                        ErrorDecision::Retry => {
                            warn!(agent = %def.name, "error handler retry budget exhausted");
                        }
                        ErrorDecision::Skip => return Ok(StepFlow::SkipTerminal),
                        ErrorDecision::Replace(value) => {
                            let text = match value {
                                Value::String(s) => s,
                                other => other.to_string(),
                            };
                            return Ok(StepFlow::Replaced(text));
                        }
                        ErrorDecision::Fail => {}
                    }
                }
                return Err(EngineError::Model(err.to_string()));
            }
        }
    }
}

struct AttemptResult {
    data: StepData,
    usage: Option<Usage>,
    finish_reason: Option<String>,
    aborted: bool,
}

struct PendingToolCall {
    id: String,
    name: String,
    args_buf: String,
}

impl PendingToolCall {
    /// Resolve the accumulated argument buffer to a JSON object.  Empty or
    /// malformed buffers become `{}` so a single bad call cannot corrupt the
    /// conversation history.
    fn finish(self) -> ToolCallRequest {
        let args = if self.args_buf.is_empty() {
            Value::Object(Default::default())
        } else {
            match serde_json::from_str(&self.args_buf) {
                Ok(v) => v,
                Err(err) => {
                    warn!(
                        tool = %self.name,
                        call_id = %self.id,
                        error = %err,
                        "invalid JSON tool arguments; substituting {{}}"
                    );
                    Value::Object(Default::default())
                }
            }
        };
        ToolCallRequest {
            call_id: self.id,
            name: self.name,
            args,
        }
    }
}

async fn attempt_model_step(
    def: &AgentDef,
    ctx: &RunContext,
    inv: &str,
    render: RenderContext,
) -> Result<AttemptResult, StepError> {
    let mut stream = def
        .adapter
        .step(render, ctx.cancel.clone())
        .await
        .map_err(StepError::Model)?;

    let mut text = String::new();
    let mut thought = String::new();
    let mut pending: HashMap<u32, PendingToolCall> = HashMap::new();
    let mut usage: Option<Usage> = None;
    let mut finish_reason: Option<String> = None;
    let mut aborted = false;

    loop {
        let item = tokio::select! {
            biased;
            _ = ctx.cancel.cancelled() => {
                aborted = true;
                break;
            }
            item = stream.next() => item,
        };
        let Some(item) = item else { break };
        match item.map_err(StepError::Model)? {
            ModelEvent::ThoughtDelta(delta) => {
                ctx.emit(axon_types::StreamEvent::ThoughtDelta {
                    invocation_id: inv.to_string(),
                    agent_name: def.name.clone(),
                    delta: delta.clone(),
                });
                thought.push_str(&delta);
            }
            ModelEvent::TextDelta(delta) => {
                ctx.emit(axon_types::StreamEvent::TextDelta {
                    invocation_id: inv.to_string(),
                    agent_name: def.name.clone(),
                    delta: delta.clone(),
                });
                text.push_str(&delta);
            }
            ModelEvent::ToolCall {
                index,
                id,
                name,
                arguments,
            } => {
                let entry = pending.entry(index).or_insert_with(|| PendingToolCall {
                    id: String::new(),
                    name: String::new(),
                    args_buf: String::new(),
                });
                if !id.is_empty() {
                    entry.id = id;
                }
                if !name.is_empty() {
                    entry.name = name;
                }
                entry.args_buf.push_str(&arguments);
            }
            ModelEvent::Usage {
                input_tokens,
                output_tokens,
            } => {
                usage = Some(Usage::new(input_tokens, output_tokens));
            }
            ModelEvent::FinishReason(reason) => finish_reason = Some(reason),
            ModelEvent::Done => break,
        }
    }

    // Accumulate deltas into authoritative events.  On abort the partial
    // text is still committed so nothing streamed is lost.
    let mut events = Vec::new();
    if !thought.is_empty() {
        events.push(append_step_event(ctx, Event::thought(inv, def.name.clone(), thought)).await?);
    }
    if !text.is_empty() {
        events.push(
            append_step_event(ctx, Event::assistant(inv, def.name.clone(), text.clone())).await?,
        );
    }

    let mut tool_calls = Vec::new();
    if !aborted {
        let mut sorted: Vec<(u32, PendingToolCall)> = pending.into_iter().collect();
        sorted.sort_by_key(|(index, _)| *index);
        for (_, ptc) in sorted {
            if ptc.name.is_empty() {
                warn!(call_id = %ptc.id, "dropping tool call with empty name");
                continue;
            }
            let mut call = ptc.finish();
            if call.call_id.is_empty() {
                call.call_id = new_call_id();
            }
            let yields = def
                .find_tool(&call.name)
                .map(|t| t.yield_schema().is_some())
                .unwrap_or(false);
            events.push(
                append_step_event(
                    ctx,
                    Event::tool_call(&call.call_id, &call.name, call.args.clone(), yields),
                )
                .await?,
            );
            tool_calls.push(call);
        }
    }

    Ok(AttemptResult {
        data: StepData {
            text,
            tool_calls,
            events,
        },
        usage,
        finish_reason,
        aborted,
    })
}

async fn append_step_event(ctx: &RunContext, event: Event) -> Result<Event, StepError> {
    ctx.append(event).await.map_err(StepError::Engine)
}

// ─── Tool dispatch ────────────────────────────────────────────────────────────

enum Dispatched {
    Handled,
    Transfer(String),
    ChildYielded(Vec<PendingCall>),
    Aborted,
}

async fn dispatch_function_tool(
    tool: &dyn Tool,
    ctx: &RunContext,
    tool_ctx: &ToolContext,
    call: &ToolCallRequest,
    iterations: &mut u32,
    usage: &mut Usage,
) -> Result<Dispatched, EngineError> {
    let prepared = match tool.prepare(tool_ctx, call.args.clone()).await {
        Ok(prepared) => prepared,
        Err(err) => {
            ctx.append(Event::tool_error(&call.call_id, &call.name, err.to_string()))
                .await?;
            return Ok(Dispatched::Handled);
        }
    };

    let attempt = with_retry(tool.retry(), &ctx.cancel, |_| true, |_| {
        tool.execute(tool_ctx, prepared.clone())
    });
    let result = match tool.timeout() {
        Some(deadline) => match tokio::time::timeout(deadline, attempt).await {
            Ok(result) => result,
            Err(_) => Err(EngineError::Timeout(deadline.as_millis() as u64).into()),
        },
        None => attempt.await,
    };

    let returned = match result {
        Ok(returned) => returned,
        Err(err) => {
            if ctx.cancel.is_cancelled() {
                // The tool observed the signal and unwound; record the
                // interruption and stop.
                ctx.append(Event::tool_error(&call.call_id, &call.name, "aborted"))
                    .await?;
                return Ok(Dispatched::Aborted);
            }
            ctx.append(Event::tool_error(&call.call_id, &call.name, err.to_string()))
                .await?;
            return Ok(Dispatched::Handled);
        }
    };

    if let Err(err) = tool.finalize(tool_ctx, &prepared, &returned).await {
        ctx.append(Event::tool_error(&call.call_id, &call.name, err.to_string()))
            .await?;
        return Ok(Dispatched::Handled);
    }

    match returned {
        ToolReturn::Value(value) => {
            ctx.append(Event::tool_result(&call.call_id, &call.name, value))
                .await?;
            Ok(Dispatched::Handled)
        }
        ToolReturn::Transfer(target) => {
            ctx.append(Event::tool_result(
                &call.call_id,
                &call.name,
                serde_json::json!({ "transferTo": target.clone() }),
            ))
            .await?;
            Ok(Dispatched::Transfer(target))
        }
        ToolReturn::Handoff(child) => {
            child.validate()?;
            let params = InvocationParams::child(
                axon_types::new_invocation_id(),
                &tool_ctx.invocation_id,
                &child,
                None,
            );
            {
                let mut session = ctx.session.lock().await;
                session.inherit_temp(
                    &tool_ctx.invocation_id,
                    &params.invocation_id,
                    Default::default(),
                );
            }
            let outcome = run_enveloped(&child, ctx, params).await?;
            *iterations += outcome.iterations;
            usage.add(outcome.usage);
            match outcome.status {
                axon_types::RunStatus::Completed => {
                    ctx.append(Event::tool_result(
                        &call.call_id,
                        &call.name,
                        outcome.output.unwrap_or(Value::Null),
                    ))
                    .await?;
                    Ok(Dispatched::Handled)
                }
                axon_types::RunStatus::Yielded => {
                    Ok(Dispatched::ChildYielded(outcome.pending_calls))
                }
                axon_types::RunStatus::Aborted => Ok(Dispatched::Aborted),
                axon_types::RunStatus::Error | axon_types::RunStatus::MaxSteps => {
                    ctx.append(Event::tool_error(
                        &call.call_id,
                        &call.name,
                        outcome
                            .error
                            .unwrap_or_else(|| "child run did not complete".into()),
                    ))
                    .await?;
                    Ok(Dispatched::Handled)
                }
            }
        }
    }
}

// ─── Output parsing ───────────────────────────────────────────────────────────

enum Terminal {
    Done(Option<Value>),
    RetryStep,
}

async fn finish_terminal(
    def: &AgentDef,
    ctx: &RunContext,
    inv: &str,
    text: &str,
    output_retries: &mut u32,
) -> Result<Terminal, EngineError> {
    let Some(spec) = &def.output else {
        let output = if text.is_empty() {
            None
        } else {
            Some(Value::String(text.to_string()))
        };
        return Ok(Terminal::Done(output));
    };

    match parse_output(spec, text) {
        Ok(value) => {
            write_output_key(ctx, inv, spec, &value).await?;
            Ok(Terminal::Done(Some(value)))
        }
        Err(message) => match &spec.policy {
            OutputParsePolicy::Fail => Err(EngineError::OutputParse {
                agent: def.name.clone(),
                message,
            }),
            OutputParsePolicy::Skip => Ok(Terminal::Done(None)),
            OutputParsePolicy::UseDefault(value) => {
                write_output_key(ctx, inv, spec, value).await?;
                Ok(Terminal::Done(Some(value.clone())))
            }
            OutputParsePolicy::Retry { max_attempts } => {
                if *output_retries >= *max_attempts {
                    return Err(EngineError::OutputParse {
                        agent: def.name.clone(),
                        message,
                    });
                }
                *output_retries += 1;
                ctx.append(Event::user(
                    format!(
                        "Your final answer could not be parsed against the declared \
                         output schema ({message}). Respond again with only a valid \
                         JSON value matching the schema."
                    ),
                    Some(inv.to_string()),
                ))
                .await?;
                Ok(Terminal::RetryStep)
            }
        },
    }
}

fn parse_output(spec: &OutputSpec, text: &str) -> Result<Value, String> {
    match &spec.coerce {
        Some(coerce) => coerce(text, &spec.schema),
        None => serde_json::from_str(text).map_err(|e| e.to_string()),
    }
}

async fn write_output_key(
    ctx: &RunContext,
    inv: &str,
    spec: &OutputSpec,
    value: &Value,
) -> Result<(), EngineError> {
    let Some(key) = &spec.key else {
        return Ok(());
    };
    let event = {
        let session = ctx.session.lock().await;
        session.build_state_change(
            axon_types::StateScope::Session,
            axon_types::StateSource::Mutation,
            Some(inv.to_string()),
            vec![(key.clone(), Some(value.clone()))],
        )
    };
    if let Some(event) = event {
        ctx.append(event).await?;
    }
    Ok(())
}
