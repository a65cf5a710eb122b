// Copyright (c) 2025-2026 Axon Contributors
//
// SPDX-License-Identifier: Apache-2.0
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures::future::BoxFuture;
use serde_json::Value;

use axon_model::ToolSchema;

use crate::context::ToolContext;
use crate::retry::RetryPolicy;
use crate::runnable::Runnable;

/// One tool invocation requested by the model, with parsed arguments.
#[derive(Debug, Clone)]
pub struct ToolCallRequest {
    pub call_id: String,
    pub name: String,
    pub args: Value,
}

/// What a tool hands back to the engine.
pub enum ToolReturn {
    /// A plain result, recorded as `tool_result`.
    Value(Value),
    /// A runnable to execute as a child; its output becomes the tool result.
    Handoff(Runnable),
    /// Replace the current top-level agent with the named one.
    Transfer(String),
}

/// A function tool dispatched by the engine.
///
/// Yielding tools declare a `yield_schema`: instead of executing, the engine
/// runs `prepare`, records a `tool_yield`, and suspends until a `tool_input`
/// with the same call id arrives.
#[async_trait]
pub trait Tool: Send + Sync {
    fn name(&self) -> &str;

    fn description(&self) -> &str {
        ""
    }

    /// JSON Schema for the arguments object.
    fn parameters_schema(&self) -> Value {
        serde_json::json!({ "type": "object" })
    }

    /// Schema of the external input that resolves this tool's yield.
    /// `Some` marks the tool as yielding.
    fn yield_schema(&self) -> Option<Value> {
        None
    }

    /// Per-call execution deadline.
    fn timeout(&self) -> Option<Duration> {
        None
    }

    /// Retry policy for failed executions.
    fn retry(&self) -> RetryPolicy {
        RetryPolicy::none()
    }

    /// Shape the arguments before execution (or before the yield is
    /// recorded, for yielding tools).
    async fn prepare(&self, _ctx: &ToolContext, args: Value) -> anyhow::Result<Value> {
        Ok(args)
    }

    async fn execute(&self, ctx: &ToolContext, args: Value) -> anyhow::Result<ToolReturn>;

    /// Runs after a successful execution, before the result is recorded.
    async fn finalize(
        &self,
        _ctx: &ToolContext,
        _args: &Value,
        _result: &ToolReturn,
    ) -> anyhow::Result<()> {
        Ok(())
    }

    /// The declaration sent to the model adapter.
    fn schema(&self) -> ToolSchema {
        ToolSchema {
            name: self.name().to_string(),
            description: self.description().to_string(),
            parameters: self.parameters_schema(),
            yields: self.yield_schema().is_some(),
        }
    }
}

type ToolFn =
    Arc<dyn Fn(ToolContext, Value) -> BoxFuture<'static, anyhow::Result<ToolReturn>> + Send + Sync>;

/// Closure-backed [`Tool`], the quickest way to define tools in application
/// code and tests.
pub struct FnTool {
    name: String,
    description: String,
    parameters: Value,
    yield_schema: Option<Value>,
    timeout: Option<Duration>,
    retry: RetryPolicy,
    f: ToolFn,
}

impl FnTool {
    pub fn new<F, Fut>(
        name: impl Into<String>,
        description: impl Into<String>,
        f: F,
    ) -> Arc<dyn Tool>
    where
        F: Fn(ToolContext, Value) -> Fut + Send + Sync + 'static,
        Fut: std::future::Future<Output = anyhow::Result<ToolReturn>> + Send + 'static,
    {
        Self::builder(name, description, f).build()
    }

    /// Like [`FnTool::new`] but returns the builder so schemas, yield
    /// declarations, timeouts, and retries can be attached.
    pub fn builder<F, Fut>(name: impl Into<String>, description: impl Into<String>, f: F) -> Self
    where
        F: Fn(ToolContext, Value) -> Fut + Send + Sync + 'static,
        Fut: std::future::Future<Output = anyhow::Result<ToolReturn>> + Send + 'static,
    {
        Self {
            name: name.into(),
            description: description.into(),
            parameters: serde_json::json!({ "type": "object" }),
            yield_schema: None,
            timeout: None,
            retry: RetryPolicy::none(),
            f: Arc::new(move |ctx, args| Box::pin(f(ctx, args))),
        }
    }

    pub fn with_parameters(mut self, parameters: Value) -> Self {
        self.parameters = parameters;
        self
    }

    /// Declare the tool as yielding with the given input schema.
    pub fn yielding(mut self, schema: Value) -> Self {
        self.yield_schema = Some(schema);
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    pub fn build(self) -> Arc<dyn Tool> {
        Arc::new(self)
    }
}

#[async_trait]
impl Tool for FnTool {
    fn name(&self) -> &str {
        &self.name
    }

    fn description(&self) -> &str {
        &self.description
    }

    fn parameters_schema(&self) -> Value {
        self.parameters.clone()
    }

    fn yield_schema(&self) -> Option<Value> {
        self.yield_schema.clone()
    }

    fn timeout(&self) -> Option<Duration> {
        self.timeout
    }

    fn retry(&self) -> RetryPolicy {
        self.retry
    }

    async fn execute(&self, ctx: &ToolContext, args: Value) -> anyhow::Result<ToolReturn> {
        (self.f)(ctx.clone(), args).await
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
