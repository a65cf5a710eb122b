// Copyright (c) 2025-2026 Axon Contributors
//
// SPDX-License-Identifier: Apache-2.0
//! The runnable sum type: agents, sequences, parallel groups, loops, and
//! steps.  Each variant carries its own hooks behind `Arc`, so runnables are
//! cheap to clone and safe to walk from concurrent drivers.

use std::collections::HashSet;
use std::sync::Arc;

use async_trait::async_trait;
use futures::future::BoxFuture;
use serde_json::Value;

use axon_model::{ContextRenderer, ModelAdapter, ProviderTool, ToolChoice};
use axon_session::SharedSession;
use axon_types::{EngineError, JsonMap, RunnableKind};

use crate::retry::RetryPolicy;
use crate::tool::Tool;

/// Default model-step budget for an agent.
pub const DEFAULT_MAX_STEPS: u32 = 16;

/// What to do when the agent's final text cannot be coerced to the declared
/// output schema.
#[derive(Clone)]
pub enum OutputParsePolicy {
    /// Propagate an output-parse error (the default).
    Fail,
    /// Complete without structured output.
    Skip,
    /// Complete with a fallback value.
    UseDefault(Value),
    /// Push a correction into the session and give the model another step,
    /// up to `max_attempts` times.
    Retry { max_attempts: u32 },
}

/// Pluggable coercion hook: receives the raw text and the schema, returns
/// the parsed value.  The default is plain `serde_json` parsing.
pub type CoerceFn = Arc<dyn Fn(&str, &Value) -> Result<Value, String> + Send + Sync>;

/// Structured-output declaration for an agent.
#[derive(Clone)]
pub struct OutputSpec {
    pub schema: Value,
    /// When set, the parsed value is written into session state under this
    /// key on completion.
    pub key: Option<String>,
    pub policy: OutputParsePolicy,
    pub coerce: Option<CoerceFn>,
}

impl OutputSpec {
    pub fn new(schema: Value) -> Self {
        Self {
            schema,
            key: None,
            policy: OutputParsePolicy::Fail,
            coerce: None,
        }
    }

    pub fn with_key(mut self, key: impl Into<String>) -> Self {
        self.key = Some(key.into());
        self
    }

    pub fn with_policy(mut self, policy: OutputParsePolicy) -> Self {
        self.policy = policy;
        self
    }

    pub fn with_coerce(mut self, coerce: CoerceFn) -> Self {
        self.coerce = Some(coerce);
        self
    }
}

/// Decision returned by a [`StepErrorHandler`].
#[derive(Debug, Clone)]
pub enum ErrorDecision {
    /// Treat the failed step as a terminal step with no output.
    Skip,
    /// Try the model step again.
    Retry,
    /// Substitute a replacement assistant response.
    Replace(Value),
    /// Give up; the invocation ends with reason `error`.
    Fail,
}

/// Handles non-retryable model errors.  Handlers run in registration order;
/// the first decision wins.
#[async_trait]
pub trait StepErrorHandler: Send + Sync {
    async fn handle(&self, error: &anyhow::Error, attempt: u32) -> ErrorDecision;
}

/// Closure-backed [`StepErrorHandler`].
pub struct FnStepErrorHandler<F>(pub F);

#[async_trait]
impl<F> StepErrorHandler for FnStepErrorHandler<F>
where
    F: Fn(&anyhow::Error, u32) -> ErrorDecision + Send + Sync,
{
    async fn handle(&self, error: &anyhow::Error, attempt: u32) -> ErrorDecision {
        (self.0)(error, attempt)
    }
}

/// An agent: a named model/tool loop.
#[derive(Clone)]
pub struct AgentDef {
    pub name: String,
    pub adapter: Arc<dyn ModelAdapter>,
    pub tools: Vec<Arc<dyn Tool>>,
    pub provider_tools: Vec<ProviderTool>,
    pub max_steps: u32,
    pub tool_choice: ToolChoice,
    /// Subset of tool names offered to the model; `None` offers all.
    pub allowed_tools: Option<Vec<String>>,
    pub output: Option<OutputSpec>,
    pub renderers: Vec<Arc<dyn ContextRenderer>>,
    pub error_handlers: Vec<Arc<dyn StepErrorHandler>>,
    /// In-place retry for transient model failures.
    pub model_retry: RetryPolicy,
}

impl AgentDef {
    pub fn new(name: impl Into<String>, adapter: Arc<dyn ModelAdapter>) -> Self {
        Self {
            name: name.into(),
            adapter,
            tools: Vec::new(),
            provider_tools: Vec::new(),
            max_steps: DEFAULT_MAX_STEPS,
            tool_choice: ToolChoice::Auto,
            allowed_tools: None,
            output: None,
            renderers: Vec::new(),
            error_handlers: Vec::new(),
            model_retry: RetryPolicy::new(3),
        }
    }

    pub fn with_tool(mut self, tool: Arc<dyn Tool>) -> Self {
        self.tools.push(tool);
        self
    }

    pub fn with_tools(mut self, tools: impl IntoIterator<Item = Arc<dyn Tool>>) -> Self {
        self.tools.extend(tools);
        self
    }

    pub fn with_provider_tool(mut self, tool: ProviderTool) -> Self {
        self.provider_tools.push(tool);
        self
    }

    pub fn with_max_steps(mut self, max_steps: u32) -> Self {
        self.max_steps = max_steps;
        self
    }

    pub fn with_tool_choice(mut self, tool_choice: ToolChoice) -> Self {
        self.tool_choice = tool_choice;
        self
    }

    pub fn with_allowed_tools(mut self, names: Vec<String>) -> Self {
        self.allowed_tools = Some(names);
        self
    }

    pub fn with_output(mut self, output: OutputSpec) -> Self {
        self.output = Some(output);
        self
    }

    pub fn with_renderer(mut self, renderer: Arc<dyn ContextRenderer>) -> Self {
        self.renderers.push(renderer);
        self
    }

    pub fn with_error_handler(mut self, handler: Arc<dyn StepErrorHandler>) -> Self {
        self.error_handlers.push(handler);
        self
    }

    pub fn with_model_retry(mut self, policy: RetryPolicy) -> Self {
        self.model_retry = policy;
        self
    }

    pub fn find_tool(&self, name: &str) -> Option<&Arc<dyn Tool>> {
        self.tools.iter().find(|t| t.name() == name)
    }

    pub fn is_provider_tool(&self, name: &str) -> bool {
        self.provider_tools.iter().any(|t| t.name == name)
    }
}

#[derive(Clone)]
pub struct SequenceDef {
    pub name: String,
    pub children: Vec<Runnable>,
}

/// Merge hook for parallel groups: receives per-child outputs in declaration
/// order (`None` for children that produced no output).
pub type MergeFn = Arc<dyn Fn(&[Option<Value>]) -> Value + Send + Sync>;

#[derive(Clone)]
pub struct ParallelDef {
    pub name: String,
    pub children: Vec<Runnable>,
    /// Defaults to a JSON array of child outputs in declaration order.
    pub merge: Option<MergeFn>,
}

/// Inputs to a loop's `while` predicate.
pub struct LoopTick {
    /// Completed iterations so far (0 before the first).
    pub iteration: u32,
    pub last_output: Option<Value>,
    /// Session-scope state at the check.
    pub state: JsonMap,
}

pub type WhileFn = Arc<dyn Fn(&LoopTick) -> bool + Send + Sync>;

#[derive(Clone)]
pub struct LoopDef {
    pub name: String,
    pub child: Box<Runnable>,
    pub while_fn: Option<WhileFn>,
    pub max_iterations: u32,
    /// When `true`, the loop suspends awaiting external input between
    /// iterations.
    pub yields: bool,
}

impl LoopDef {
    pub fn new(name: impl Into<String>, child: Runnable) -> Self {
        Self {
            name: name.into(),
            child: Box::new(child),
            while_fn: None,
            max_iterations: 8,
            yields: false,
        }
    }

    pub fn with_while(mut self, while_fn: WhileFn) -> Self {
        self.while_fn = Some(while_fn);
        self
    }

    pub fn with_max_iterations(mut self, max_iterations: u32) -> Self {
        self.max_iterations = max_iterations;
        self
    }

    pub fn yielding(mut self) -> Self {
        self.yields = true;
        self
    }
}

/// What a step's inline `execute` reports back.
pub enum StepResult {
    /// Skip the step; completes with no output.
    Skip,
    /// Fail the invocation with a message.
    Fail(String),
    /// Emit an assistant event with the given text.
    Respond(String),
    /// Complete, optionally writing `value` into session state under `key`.
    Complete {
        key: Option<String>,
        value: Option<Value>,
    },
    /// Hand execution to a child runnable.
    Run(Runnable),
    /// Plain completion, no output.
    Done,
}

/// Read-only inputs handed to a step's `execute`.
pub struct StepInput {
    pub invocation_id: String,
    /// Session-scope state at entry.
    pub state: JsonMap,
    /// The step's temp scope at entry.
    pub temp: JsonMap,
    pub session: SharedSession,
}

pub type StepFn =
    Arc<dyn Fn(StepInput) -> BoxFuture<'static, anyhow::Result<StepResult>> + Send + Sync>;

#[derive(Clone)]
pub struct StepDef {
    pub name: String,
    pub execute: StepFn,
}

/// A composable unit of execution.
#[derive(Clone)]
pub enum Runnable {
    Agent(AgentDef),
    Sequence(SequenceDef),
    Parallel(ParallelDef),
    Loop(LoopDef),
    Step(StepDef),
}

impl Runnable {
    pub fn agent(def: AgentDef) -> Self {
        Runnable::Agent(def)
    }

    pub fn sequence(name: impl Into<String>, children: Vec<Runnable>) -> Self {
        Runnable::Sequence(SequenceDef {
            name: name.into(),
            children,
        })
    }

    pub fn parallel(name: impl Into<String>, children: Vec<Runnable>) -> Self {
        Runnable::Parallel(ParallelDef {
            name: name.into(),
            children,
            merge: None,
        })
    }

    pub fn parallel_with_merge(
        name: impl Into<String>,
        children: Vec<Runnable>,
        merge: MergeFn,
    ) -> Self {
        Runnable::Parallel(ParallelDef {
            name: name.into(),
            children,
            merge: Some(merge),
        })
    }

    pub fn repeat(def: LoopDef) -> Self {
        Runnable::Loop(def)
    }

    pub fn step<F, Fut>(name: impl Into<String>, execute: F) -> Self
    where
        F: Fn(StepInput) -> Fut + Send + Sync + 'static,
        Fut: std::future::Future<Output = anyhow::Result<StepResult>> + Send + 'static,
    {
        Runnable::Step(StepDef {
            name: name.into(),
            execute: Arc::new(move |input| Box::pin(execute(input))),
        })
    }

    pub fn name(&self) -> &str {
        match self {
            Runnable::Agent(d) => &d.name,
            Runnable::Sequence(d) => &d.name,
            Runnable::Parallel(d) => &d.name,
            Runnable::Loop(d) => &d.name,
            Runnable::Step(d) => &d.name,
        }
    }

    pub fn kind(&self) -> RunnableKind {
        match self {
            Runnable::Agent(_) => RunnableKind::Agent,
            Runnable::Sequence(_) => RunnableKind::Sequence,
            Runnable::Parallel(_) => RunnableKind::Parallel,
            Runnable::Loop(_) => RunnableKind::Loop,
            Runnable::Step(_) => RunnableKind::Step,
        }
    }

    /// Declared children, empty for leaves.  A loop exposes its single child.
    pub fn children(&self) -> &[Runnable] {
        match self {
            Runnable::Sequence(d) => &d.children,
            Runnable::Parallel(d) => &d.children,
            Runnable::Loop(d) => std::slice::from_ref(&d.child),
            _ => &[],
        }
    }

    /// Structural validation, run once before execution.
    pub fn validate(&self) -> Result<(), EngineError> {
        if self.name().is_empty() {
            return Err(EngineError::Validation(format!(
                "{} runnable has an empty name",
                self.kind().as_str()
            )));
        }
        match self {
            Runnable::Agent(def) => {
                if def.max_steps == 0 {
                    return Err(EngineError::Validation(format!(
                        "agent {}: max_steps must be at least 1",
                        def.name
                    )));
                }
                let mut seen = HashSet::new();
                for tool in &def.tools {
                    if !seen.insert(tool.name()) {
                        return Err(EngineError::Validation(format!(
                            "agent {}: duplicate tool name {:?}",
                            def.name,
                            tool.name()
                        )));
                    }
                }
                Ok(())
            }
            Runnable::Sequence(def) => {
                if def.children.is_empty() {
                    return Err(EngineError::Validation(format!(
                        "sequence {} has no children",
                        def.name
                    )));
                }
                def.children.iter().try_for_each(Runnable::validate)
            }
            Runnable::Parallel(def) => {
                if def.children.is_empty() {
                    return Err(EngineError::Validation(format!(
                        "parallel {} has no children",
                        def.name
                    )));
                }
                def.children.iter().try_for_each(Runnable::validate)
            }
            Runnable::Loop(def) => {
                if def.max_iterations == 0 {
                    return Err(EngineError::Validation(format!(
                        "loop {}: max_iterations must be at least 1",
                        def.name
                    )));
                }
                def.child.validate()
            }
            Runnable::Step(_) => Ok(()),
        }
    }

    /// Depth-first search for a runnable by name; used to resolve transfer
    /// targets.
    pub fn find(&self, name: &str) -> Option<&Runnable> {
        if self.name() == name {
            return Some(self);
        }
        self.children().iter().find_map(|c| c.find(name))
    }
}

impl std::fmt::Debug for Runnable {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Runnable")
            .field("kind", &self.kind())
            .field("name", &self.name())
            .field("children", &self.children().len())
            .finish()
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use axon_model::EchoAdapter;

    use super::*;
    use crate::tool::{FnTool, ToolReturn};

    fn echo_agent(name: &str) -> Runnable {
        Runnable::agent(AgentDef::new(name, Arc::new(EchoAdapter)))
    }

    fn noop_tool(name: &str) -> Arc<dyn Tool> {
        FnTool::new(name, "noop", |_ctx, _args| async move {
            Ok(ToolReturn::Value(Value::Null))
        })
    }

    #[test]
    fn kinds_and_names() {
        let seq = Runnable::sequence("pipeline", vec![echo_agent("a"), echo_agent("b")]);
        assert_eq!(seq.kind(), RunnableKind::Sequence);
        assert_eq!(seq.name(), "pipeline");
        assert_eq!(seq.children().len(), 2);
    }

    #[test]
    fn validate_rejects_empty_composites() {
        assert!(Runnable::sequence("s", vec![]).validate().is_err());
        assert!(Runnable::parallel("p", vec![]).validate().is_err());
        assert!(Runnable::sequence("s", vec![echo_agent("a")]).validate().is_ok());
    }

    #[test]
    fn validate_rejects_duplicate_tool_names() {
        let def = AgentDef::new("a", Arc::new(EchoAdapter))
            .with_tool(noop_tool("inc"))
            .with_tool(noop_tool("inc"));
        let err = Runnable::agent(def).validate().unwrap_err();
        assert!(err.to_string().contains("duplicate tool name"));
    }

    #[test]
    fn validate_rejects_zero_budgets() {
        let def = AgentDef::new("a", Arc::new(EchoAdapter)).with_max_steps(0);
        assert!(Runnable::agent(def).validate().is_err());

        let looped = LoopDef::new("l", echo_agent("a")).with_max_iterations(0);
        assert!(Runnable::repeat(looped).validate().is_err());
    }

    #[test]
    fn validate_recurses_into_children() {
        let bad = Runnable::sequence("outer", vec![Runnable::sequence("inner", vec![])]);
        assert!(bad.validate().is_err());
    }

    #[test]
    fn find_locates_nested_agents() {
        let tree = Runnable::sequence(
            "root",
            vec![
                echo_agent("triage"),
                Runnable::parallel("fanout", vec![echo_agent("coder"), echo_agent("tester")]),
            ],
        );
        assert!(tree.find("tester").is_some());
        assert_eq!(tree.find("root").unwrap().kind(), RunnableKind::Sequence);
        assert!(tree.find("nope").is_none());
    }

    #[test]
    fn loop_exposes_single_child() {
        let l = Runnable::repeat(LoopDef::new("poll", echo_agent("worker")));
        assert_eq!(l.children().len(), 1);
        assert_eq!(l.children()[0].name(), "worker");
    }

    #[test]
    fn agent_defaults() {
        let def = AgentDef::new("a", Arc::new(EchoAdapter));
        assert_eq!(def.max_steps, DEFAULT_MAX_STEPS);
        assert!(def.output.is_none());
        assert_eq!(def.model_retry.max_attempts, 3);
    }
}
