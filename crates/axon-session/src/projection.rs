// Copyright (c) 2025-2026 Axon Contributors
//
// SPDX-License-Identifier: Apache-2.0
//! Derived views over the event log.
//!
//! Everything here is a pure fold over `&[Event]` — no session state is
//! consulted — so the same functions serve live sessions, snapshots loaded
//! from disk, and time-travel queries at arbitrary indices.

use axon_types::{
    Event, EventPayload, HandoffOrigin, JsonMap, PendingCall, RunnableKind, SessionError,
    SessionStatus, Snapshot, StateScope, Usage,
};

/// Where one invocation starts and ends in the log.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InvocationBoundary {
    pub start_index: usize,
    /// `None` while the invocation is still open (running or suspended).
    pub end_index: Option<usize>,
    pub agent_name: String,
}

/// An `invocation_start` without a matching `invocation_end`.
#[derive(Debug, Clone)]
pub struct OpenInvocation {
    pub start_index: usize,
    pub invocation_id: String,
    pub agent_name: String,
    pub kind: RunnableKind,
    pub parent_invocation_id: Option<String>,
    pub handoff_origin: Option<HandoffOrigin>,
    pub fingerprint: Option<String>,
}

/// Left-fold of `state_change` events with the given scope over the prefix
/// `events[0..index]`.  `index` may be `events.len()` (the full log); larger
/// values are a domain error.
pub fn state_at(
    events: &[Event],
    index: usize,
    scope: StateScope,
) -> Result<JsonMap, SessionError> {
    if index > events.len() {
        return Err(SessionError::IndexOutOfBounds {
            index,
            len: events.len(),
        });
    }
    let mut map = JsonMap::new();
    for event in &events[..index] {
        let EventPayload::StateChange {
            scope: s, changes, ..
        } = &event.payload
        else {
            continue;
        };
        if *s != scope {
            continue;
        }
        for delta in changes {
            match &delta.new_value {
                Some(v) => {
                    map.insert(delta.key.clone(), v.clone());
                }
                None => {
                    map.remove(&delta.key);
                }
            }
        }
    }
    Ok(map)
}

/// Derived session status over the full log.
///
/// `AwaitingInput` when any `tool_yield` lacks a later `tool_input`, or any
/// `invocation_yield { awaiting_input }` lacks a matching
/// `invocation_resume`.  Otherwise the most recent `invocation_end` decides:
/// `completed` / `error` map directly, an aborted or max-steps end leaves the
/// session `Active`.  An empty log is `Active`.
pub fn status(events: &[Event]) -> SessionStatus {
    if !pending_calls(events).is_empty() || has_unresolved_await(events) {
        return SessionStatus::AwaitingInput;
    }
    for event in events.iter().rev() {
        if let EventPayload::InvocationEnd { reason, .. } = &event.payload {
            return match reason {
                axon_types::EndReason::Completed => SessionStatus::Completed,
                axon_types::EndReason::Error => SessionStatus::Error,
                axon_types::EndReason::Aborted | axon_types::EndReason::MaxSteps => {
                    SessionStatus::Active
                }
            };
        }
    }
    SessionStatus::Active
}

/// Unresolved yielding calls: every `tool_yield` without a later
/// `tool_input` for the same call id, in yield order.
pub fn pending_calls(events: &[Event]) -> Vec<PendingCall> {
    let mut pending: Vec<PendingCall> = Vec::new();
    for event in events {
        match &event.payload {
            EventPayload::ToolYield { call_id, name, .. } => pending.push(PendingCall {
                call_id: call_id.clone(),
                name: name.clone(),
            }),
            EventPayload::ToolInput { call_id, .. } => {
                pending.retain(|p| p.call_id != *call_id);
            }
            _ => {}
        }
    }
    pending
}

/// `true` when some `invocation_yield { awaiting_input: true }` has no
/// matching `invocation_resume` with the same invocation id and yield index.
fn has_unresolved_await(events: &[Event]) -> bool {
    let mut awaiting: Vec<(String, u32)> = Vec::new();
    for event in events {
        match &event.payload {
            EventPayload::InvocationYield {
                invocation_id,
                yield_index,
                awaiting_input,
                ..
            } if *awaiting_input => awaiting.push((invocation_id.clone(), *yield_index)),
            EventPayload::InvocationResume {
                invocation_id,
                yield_index,
            } => {
                awaiting.retain(|(id, idx)| !(id == invocation_id && idx == yield_index));
            }
            _ => {}
        }
    }
    !awaiting.is_empty()
}

/// `true` when the log contains a `tool_input` for the call.
pub fn has_tool_input(events: &[Event], call_id: &str) -> bool {
    events.iter().any(|e| {
        matches!(&e.payload, EventPayload::ToolInput { call_id: c, .. } if c == call_id)
    })
}

/// Point-in-time snapshot at `events[0..index]`.
pub fn snapshot_at(events: &[Event], index: usize) -> Result<Snapshot, SessionError> {
    if index > events.len() {
        return Err(SessionError::IndexOutOfBounds {
            index,
            len: events.len(),
        });
    }
    let prefix = &events[..index];
    Ok(Snapshot {
        state: state_at(prefix, index, StateScope::Session)?,
        user_state: state_at(prefix, index, StateScope::User)?,
        patient_state: state_at(prefix, index, StateScope::Patient)?,
        practice_state: state_at(prefix, index, StateScope::Practice)?,
        status: status(prefix),
        current_agent: open_invocation_path(prefix)
            .last()
            .map(|open| open.agent_name.clone()),
        pending_calls: pending_calls(prefix),
    })
}

/// Locate an invocation's envelope in the log.
pub fn find_invocation_boundary(
    events: &[Event],
    invocation_id: &str,
) -> Option<InvocationBoundary> {
    let mut boundary: Option<InvocationBoundary> = None;
    for (i, event) in events.iter().enumerate() {
        match &event.payload {
            EventPayload::InvocationStart {
                invocation_id: id,
                agent_name,
                ..
            } if id == invocation_id => {
                boundary = Some(InvocationBoundary {
                    start_index: i,
                    end_index: None,
                    agent_name: agent_name.clone(),
                });
            }
            EventPayload::InvocationEnd {
                invocation_id: id, ..
            } if id == invocation_id => {
                if let Some(b) = boundary.as_mut() {
                    b.end_index = Some(i);
                }
            }
            _ => {}
        }
    }
    boundary
}

/// All open invocations (started, not ended), ordered root-first along the
/// parent chain.  The last element is the deepest open invocation — the
/// current agent.  With a parallel group open, siblings appear in start
/// order after their parent.
pub fn open_invocation_path(events: &[Event]) -> Vec<OpenInvocation> {
    let mut open: Vec<OpenInvocation> = Vec::new();
    for (i, event) in events.iter().enumerate() {
        match &event.payload {
            EventPayload::InvocationStart {
                invocation_id,
                agent_name,
                kind,
                parent_invocation_id,
                handoff_origin,
                fingerprint,
                ..
            } => open.push(OpenInvocation {
                start_index: i,
                invocation_id: invocation_id.clone(),
                agent_name: agent_name.clone(),
                kind: *kind,
                parent_invocation_id: parent_invocation_id.clone(),
                handoff_origin: *handoff_origin,
                fingerprint: fingerprint.clone(),
            }),
            EventPayload::InvocationEnd { invocation_id, .. } => {
                open.retain(|o| o.invocation_id != *invocation_id);
            }
            _ => {}
        }
    }
    open
}

/// Starts recorded under a parent invocation, in start order.  Used to map
/// open children back to declared child positions on resume.
pub fn child_starts(events: &[Event], parent_invocation_id: &str) -> Vec<OpenInvocation> {
    events
        .iter()
        .enumerate()
        .filter_map(|(i, event)| match &event.payload {
            EventPayload::InvocationStart {
                invocation_id,
                agent_name,
                kind,
                parent_invocation_id: parent,
                handoff_origin,
                fingerprint,
                ..
            } if parent.as_deref() == Some(parent_invocation_id) => Some(OpenInvocation {
                start_index: i,
                invocation_id: invocation_id.clone(),
                agent_name: agent_name.clone(),
                kind: *kind,
                parent_invocation_id: parent.clone(),
                handoff_origin: *handoff_origin,
                fingerprint: fingerprint.clone(),
            }),
            _ => None,
        })
        .collect()
}

/// Number of `invocation_yield` events recorded for an invocation.  The next
/// yield of that invocation uses this as its index.
pub fn yield_count(events: &[Event], invocation_id: &str) -> u32 {
    events
        .iter()
        .filter(|e| {
            matches!(
                &e.payload,
                EventPayload::InvocationYield { invocation_id: id, .. } if id == invocation_id
            )
        })
        .count() as u32
}

/// The most recent `invocation_yield` for an invocation.
pub fn last_yield(
    events: &[Event],
    invocation_id: &str,
) -> Option<(usize, Vec<String>, u32, bool)> {
    events.iter().enumerate().rev().find_map(|(i, e)| {
        match &e.payload {
            EventPayload::InvocationYield {
                invocation_id: id,
                pending_call_ids,
                yield_index,
                awaiting_input,
            } if id == invocation_id => {
                Some((i, pending_call_ids.clone(), *yield_index, *awaiting_input))
            }
            _ => None,
        }
    })
}

/// Accumulated usage over all `model_end` events.
pub fn usage_total(events: &[Event]) -> Usage {
    let mut total = Usage::default();
    for event in events {
        if let EventPayload::ModelEnd {
            usage: Some(u), ..
        } = &event.payload
        {
            total.add(*u);
        }
    }
    total
}

// ─── Unit tests ──────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use serde_json::json;

    use axon_types::{EndReason, StateDelta, StateSource};

    use super::*;

    fn start(id: &str, agent: &str, kind: RunnableKind, parent: Option<&str>) -> Event {
        Event::new(EventPayload::InvocationStart {
            invocation_id: id.into(),
            agent_name: agent.into(),
            kind,
            parent_invocation_id: parent.map(Into::into),
            handoff_origin: None,
            fingerprint: None,
            version: None,
        })
    }

    fn end(id: &str, reason: EndReason) -> Event {
        Event::new(EventPayload::InvocationEnd {
            invocation_id: id.into(),
            reason,
            iterations: None,
            error: None,
            handoff_target: None,
        })
    }

    fn set(scope: StateScope, key: &str, value: serde_json::Value) -> Event {
        Event::state_change(
            scope,
            StateSource::Direct,
            None,
            vec![StateDelta {
                key: key.into(),
                old_value: None,
                new_value: Some(value),
            }],
        )
    }

    #[test]
    fn empty_log_is_active_with_empty_state() {
        let events: Vec<Event> = vec![];
        assert_eq!(status(&events), SessionStatus::Active);
        assert!(state_at(&events, 0, StateScope::Session).unwrap().is_empty());
        let snap = snapshot_at(&events, 0).unwrap();
        assert!(snap.current_agent.is_none());
        assert!(snap.pending_calls.is_empty());
    }

    #[test]
    fn state_at_respects_prefix_and_deletion() {
        let events = vec![
            set(StateScope::Session, "k", json!(1)),
            Event::state_change(
                StateScope::Session,
                StateSource::Direct,
                None,
                vec![StateDelta {
                    key: "k".into(),
                    old_value: Some(json!(1)),
                    new_value: None,
                }],
            ),
        ];
        assert_eq!(
            state_at(&events, 1, StateScope::Session).unwrap().get("k"),
            Some(&json!(1))
        );
        assert!(state_at(&events, 2, StateScope::Session).unwrap().get("k").is_none());
    }

    #[test]
    fn state_at_out_of_bounds_is_an_error() {
        let events = vec![set(StateScope::Session, "k", json!(1))];
        assert!(matches!(
            state_at(&events, 2, StateScope::Session),
            Err(SessionError::IndexOutOfBounds { index: 2, len: 1 })
        ));
    }

    #[test]
    fn scopes_fold_independently() {
        let events = vec![
            set(StateScope::Session, "k", json!("s")),
            set(StateScope::Patient, "k", json!("p")),
        ];
        assert_eq!(
            state_at(&events, 2, StateScope::Session).unwrap().get("k"),
            Some(&json!("s"))
        );
        assert_eq!(
            state_at(&events, 2, StateScope::Patient).unwrap().get("k"),
            Some(&json!("p"))
        );
        assert!(state_at(&events, 2, StateScope::User).unwrap().is_empty());
    }

    #[test]
    fn status_follows_last_invocation_end() {
        let mut events = vec![
            start("inv_1", "triage", RunnableKind::Agent, None),
            end("inv_1", EndReason::Completed),
        ];
        assert_eq!(status(&events), SessionStatus::Completed);

        events.push(start("inv_2", "triage", RunnableKind::Agent, None));
        events.push(end("inv_2", EndReason::Error));
        assert_eq!(status(&events), SessionStatus::Error);

        events.push(start("inv_3", "triage", RunnableKind::Agent, None));
        events.push(end("inv_3", EndReason::MaxSteps));
        assert_eq!(status(&events), SessionStatus::Active);
    }

    #[test]
    fn unresolved_tool_yield_means_awaiting_input() {
        let mut events = vec![
            start("inv_1", "triage", RunnableKind::Agent, None),
            Event::tool_yield("call_1", "ask", json!({"q": "ok?"})),
        ];
        assert_eq!(status(&events), SessionStatus::AwaitingInput);
        assert_eq!(pending_calls(&events).len(), 1);

        events.push(Event::tool_input("call_1", "ask", json!({"answer": "yes"})));
        assert!(pending_calls(&events).is_empty());
        assert_eq!(status(&events), SessionStatus::Active);
    }

    #[test]
    fn unresolved_await_yield_means_awaiting_input() {
        let mut events = vec![
            start("inv_1", "poller", RunnableKind::Loop, None),
            Event::new(EventPayload::InvocationYield {
                invocation_id: "inv_1".into(),
                pending_call_ids: vec![],
                yield_index: 0,
                awaiting_input: true,
            }),
        ];
        assert_eq!(status(&events), SessionStatus::AwaitingInput);

        events.push(Event::new(EventPayload::InvocationResume {
            invocation_id: "inv_1".into(),
            yield_index: 0,
        }));
        assert_eq!(status(&events), SessionStatus::Active);
    }

    #[test]
    fn boundary_reports_open_then_closed() {
        let mut events = vec![
            Event::user("hi", None),
            start("inv_1", "triage", RunnableKind::Agent, None),
        ];
        let b = find_invocation_boundary(&events, "inv_1").unwrap();
        assert_eq!(b.start_index, 1);
        assert_eq!(b.end_index, None);
        assert_eq!(b.agent_name, "triage");

        events.push(end("inv_1", EndReason::Completed));
        let b = find_invocation_boundary(&events, "inv_1").unwrap();
        assert_eq!(b.end_index, Some(2));
        assert!(find_invocation_boundary(&events, "inv_nope").is_none());
    }

    #[test]
    fn open_path_tracks_nesting_and_current_agent() {
        let events = vec![
            start("inv_root", "pipeline", RunnableKind::Sequence, None),
            start("inv_child", "triage", RunnableKind::Agent, Some("inv_root")),
        ];
        let path = open_invocation_path(&events);
        assert_eq!(path.len(), 2);
        assert_eq!(path[0].invocation_id, "inv_root");
        assert_eq!(path[1].invocation_id, "inv_child");

        let snap = snapshot_at(&events, 2).unwrap();
        assert_eq!(snap.current_agent.as_deref(), Some("triage"));
    }

    #[test]
    fn child_starts_and_yield_count() {
        let events = vec![
            start("inv_root", "fanout", RunnableKind::Parallel, None),
            start("inv_a", "x", RunnableKind::Agent, Some("inv_root")),
            start("inv_b", "y", RunnableKind::Agent, Some("inv_root")),
            Event::new(EventPayload::InvocationYield {
                invocation_id: "inv_a".into(),
                pending_call_ids: vec!["call_1".into()],
                yield_index: 0,
                awaiting_input: false,
            }),
        ];
        let children = child_starts(&events, "inv_root");
        assert_eq!(children.len(), 2);
        assert_eq!(children[0].invocation_id, "inv_a");
        assert_eq!(children[1].invocation_id, "inv_b");
        assert_eq!(yield_count(&events, "inv_a"), 1);
        assert_eq!(yield_count(&events, "inv_b"), 0);

        let (idx, pending, yield_index, awaiting) = last_yield(&events, "inv_a").unwrap();
        assert_eq!(idx, 3);
        assert_eq!(pending, vec!["call_1".to_string()]);
        assert_eq!(yield_index, 0);
        assert!(!awaiting);
    }

    #[test]
    fn usage_total_folds_model_end_events() {
        let events = vec![
            Event::new(EventPayload::ModelEnd {
                invocation_id: "inv_1".into(),
                agent_name: "a".into(),
                usage: Some(Usage::new(10, 5)),
                finish_reason: Some("stop".into()),
            }),
            Event::new(EventPayload::ModelEnd {
                invocation_id: "inv_1".into(),
                agent_name: "a".into(),
                usage: Some(Usage::new(7, 3)),
                finish_reason: None,
            }),
        ];
        assert_eq!(usage_total(&events), Usage::new(17, 8));
    }
}
