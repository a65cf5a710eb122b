// Copyright (c) 2025-2026 Axon Contributors
//
// SPDX-License-Identifier: Apache-2.0
mod adapter;
mod mock;
mod render;

pub use adapter::{
    is_transient, ContextRenderer, ModelAdapter, ModelEvent, ModelStream, ProviderTool,
    RenderContext, ToolChoice, ToolSchema, TransientModelError,
};
pub use mock::{EchoAdapter, ScriptedAdapter};
pub use render::{InstructionRenderer, TailWindowRenderer};
