// Copyright (c) 2025-2026 Axon Contributors
//
// SPDX-License-Identifier: Apache-2.0
use serde_json::Value;

use axon_types::{PendingCall, RunStatus, Usage};

/// What a driver reports up the call stack when a runnable finishes one
/// activation.  Yields and transfers travel through this type rather than
/// through thrown errors, so control flow stays visible in the signatures.
#[derive(Debug, Clone)]
pub struct DriveOutcome {
    pub status: RunStatus,
    pub output: Option<Value>,
    /// Model steps executed (aggregated over children for composites).
    pub iterations: u32,
    pub usage: Usage,
    /// Unresolved yielding calls, set when `status` is `Yielded`.
    pub pending_calls: Vec<PendingCall>,
    /// `true` when the yield awaits an `invocation_resume` rather than tool
    /// input (loop suspension points).
    pub awaiting_input: bool,
    pub error: Option<String>,
    /// Set when a transfer signal bubbled out of the runnable.
    pub handoff_target: Option<String>,
}

impl DriveOutcome {
    fn base(status: RunStatus, iterations: u32, usage: Usage) -> Self {
        Self {
            status,
            output: None,
            iterations,
            usage,
            pending_calls: Vec::new(),
            awaiting_input: false,
            error: None,
            handoff_target: None,
        }
    }

    pub fn completed(output: Option<Value>, iterations: u32, usage: Usage) -> Self {
        Self {
            output,
            ..Self::base(RunStatus::Completed, iterations, usage)
        }
    }

    pub fn transfer(target: String, iterations: u32, usage: Usage) -> Self {
        Self {
            handoff_target: Some(target),
            ..Self::base(RunStatus::Completed, iterations, usage)
        }
    }

    pub fn yielded(
        pending_calls: Vec<PendingCall>,
        awaiting_input: bool,
        iterations: u32,
        usage: Usage,
    ) -> Self {
        Self {
            pending_calls,
            awaiting_input,
            ..Self::base(RunStatus::Yielded, iterations, usage)
        }
    }

    pub fn error(message: impl Into<String>, iterations: u32, usage: Usage) -> Self {
        Self {
            error: Some(message.into()),
            ..Self::base(RunStatus::Error, iterations, usage)
        }
    }

    pub fn aborted(iterations: u32, usage: Usage) -> Self {
        Self::base(RunStatus::Aborted, iterations, usage)
    }

    pub fn max_steps(iterations: u32, usage: Usage) -> Self {
        Self::base(RunStatus::MaxSteps, iterations, usage)
    }

    pub fn is_yielded(&self) -> bool {
        self.status == RunStatus::Yielded
    }
}
