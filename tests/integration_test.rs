// Copyright (c) 2025-2026 Axon Contributors
//
// SPDX-License-Identifier: Apache-2.0
//! End-to-end scenarios for the execution core, driven through the public
//! facade with scripted model adapters and the in-memory session service.

use std::sync::Arc;
use std::time::Duration;

use serde_json::{json, Value};

use axon::{
    fingerprint, snapshot_at, state_at, AgentDef, CreateSessionOptions, EngineError, Event,
    EventPayload, FnTool, FsSessionService, MemorySessionService, RunConfig, RunStatus, Runnable,
    Runner, ScriptedAdapter, SessionService, SessionStatus, SharedSession, StateScope, Tool,
    ToolReturn,
};

async fn memory_harness() -> (Runner, Arc<MemorySessionService>, SharedSession) {
    let service = MemorySessionService::new_arc();
    let session = service
        .create_session("clinic", CreateSessionOptions::default())
        .await
        .unwrap();
    (Runner::new(service.clone()), service, session)
}

fn inc_tool() -> Arc<dyn Tool> {
    FnTool::new("inc", "increment the counter", |ctx, _args| async move {
        let current = ctx
            .get_state(StateScope::Session, "count")
            .await?
            .and_then(|v| v.as_i64())
            .unwrap_or(0);
        ctx.set_state(StateScope::Session, "count", json!(current + 1))
            .await?;
        Ok(ToolReturn::Value(json!(current + 1)))
    })
}

fn ask_tool(name: &str) -> Arc<dyn Tool> {
    FnTool::builder(name, "ask for confirmation", |_ctx, _args| async move {
        Ok(ToolReturn::Value(Value::Null))
    })
    .yielding(json!({
        "type": "object",
        "properties": { "answer": { "type": "string" } },
    }))
    .build()
}

// ── E1: agent with one function tool ──────────────────────────────────────────

#[tokio::test]
async fn e1_tool_loop_updates_state_and_orders_events() {
    let (runner, service, session) = memory_harness().await;
    service
        .append_event(&session, Event::user("please count", None))
        .await
        .unwrap();

    let agent = Runnable::agent(
        AgentDef::new(
            "counter",
            Arc::new(ScriptedAdapter::tool_then_text("call-1", "inc", "{}", "1")),
        )
        .with_tool(inc_tool()),
    );
    let result = runner
        .run_to_result(agent, session.clone(), RunConfig::default())
        .await
        .unwrap();

    assert_eq!(result.status, RunStatus::Completed);
    assert_eq!(result.iterations, 2);
    assert_eq!(result.output, Some(Value::String("1".into())));

    let session = session.lock().await;
    assert_eq!(session.state().get("count"), Some(&json!(1)));

    // user, tool_call, tool_result, assistant appear as a subsequence.
    let mut expected = vec!["user", "tool_call", "tool_result", "assistant"].into_iter();
    let mut next = expected.next();
    for event in session.events() {
        if Some(event.type_name()) == next {
            next = expected.next();
        }
    }
    assert!(next.is_none(), "expected event order was not observed");
}

// ── E2: yielding tool ─────────────────────────────────────────────────────────

#[tokio::test]
async fn e2_yield_then_resume_completes() {
    let (runner, service, session) = memory_harness().await;
    service
        .append_event(&session, Event::user("check with the clinician", None))
        .await
        .unwrap();

    let adapter = Arc::new(ScriptedAdapter::new(vec![
        ScriptedAdapter::tool_script("call-ask", "ask", r#"{"question": "ok?"}"#),
        ScriptedAdapter::text_script("confirmed"),
    ]));
    let make_agent =
        || Runnable::agent(AgentDef::new("asker", adapter.clone()).with_tool(ask_tool("ask")));

    let first = runner
        .run_to_result(make_agent(), session.clone(), RunConfig::default())
        .await
        .unwrap();
    assert_eq!(first.status, RunStatus::Yielded);
    assert_eq!(first.pending_calls.len(), 1);
    assert_eq!(first.pending_calls[0].name, "ask");

    {
        let session = session.lock().await;
        assert_eq!(axon::status(session.events()), SessionStatus::AwaitingInput);
    }

    service
        .append_event(
            &session,
            Event::tool_input("call-ask", "ask", json!({"answer": "yes"})),
        )
        .await
        .unwrap();

    let second = runner
        .run_to_result(make_agent(), session.clone(), RunConfig::default())
        .await
        .unwrap();
    assert_eq!(second.status, RunStatus::Completed);

    let session = session.lock().await;
    assert!(session
        .events()
        .iter()
        .any(|e| e.type_name() == "invocation_resume"));
    assert_eq!(axon::status(session.events()), SessionStatus::Completed);
}

// ── E3: fingerprint guard ─────────────────────────────────────────────────────

#[tokio::test]
async fn e3_resume_with_changed_pipeline_is_rejected() {
    let (runner, _service, session) = memory_harness().await;

    let adapter = Arc::new(ScriptedAdapter::new(vec![ScriptedAdapter::tool_script(
        "call-ask", "ask", "{}",
    )]));
    let original =
        Runnable::agent(AgentDef::new("asker", adapter.clone()).with_tool(ask_tool("ask")));
    let renamed =
        Runnable::agent(AgentDef::new("asker", adapter.clone()).with_tool(ask_tool("ask_v2")));

    let original_fp = fingerprint(&original);
    let renamed_fp = fingerprint(&renamed);
    assert_ne!(original_fp, renamed_fp);

    let first = runner
        .run_to_result(original, session.clone(), RunConfig::default())
        .await
        .unwrap();
    assert_eq!(first.status, RunStatus::Yielded);

    let err = runner
        .run_to_result(renamed, session.clone(), RunConfig::default())
        .await
        .unwrap_err();
    let message = err.to_string();
    assert!(matches!(err, EngineError::PipelineStructureChanged { .. }));
    assert!(message.contains(&original_fp), "{message}");
    assert!(message.contains(&renamed_fp), "{message}");
}

// ── E4: parallel merge ────────────────────────────────────────────────────────

#[tokio::test]
async fn e4_parallel_merge_preserves_declaration_order() {
    let (runner, _service, session) = memory_harness().await;
    let par = Runnable::parallel(
        "fanout",
        vec![
            Runnable::agent(AgentDef::new("x", Arc::new(ScriptedAdapter::always_text("x")))),
            Runnable::agent(AgentDef::new("y", Arc::new(ScriptedAdapter::always_text("y")))),
        ],
    );
    let result = runner
        .run_to_result(par, session.clone(), RunConfig::default())
        .await
        .unwrap();

    assert_eq!(result.status, RunStatus::Completed);
    assert_eq!(result.output, Some(json!(["x", "y"])));
    assert_eq!(result.iterations, 2, "iterations(x) + iterations(y)");

    // Every invocation_start has exactly one matching invocation_end.
    let session = session.lock().await;
    for event in session.events() {
        if let EventPayload::InvocationStart { invocation_id, .. } = &event.payload {
            let ends = session
                .events()
                .iter()
                .filter(|e| matches!(
                    &e.payload,
                    EventPayload::InvocationEnd { invocation_id: id, .. } if id == invocation_id
                ))
                .count();
            assert_eq!(ends, 1, "invocation {invocation_id} must be paired");
        }
    }
}

// ── E5: abort during a slow tool ──────────────────────────────────────────────

#[tokio::test]
async fn e5_abort_mid_tool_is_observed_and_recorded() {
    let (runner, service, session) = memory_harness().await;
    service
        .append_event(&session, Event::user("run the slow job", None))
        .await
        .unwrap();

    let slow = FnTool::new("slow", "a slow job", |ctx, _args| async move {
        let signal = ctx.abort_signal();
        tokio::select! {
            _ = tokio::time::sleep(Duration::from_secs(30)) => {}
            _ = signal.cancelled() => {}
        }
        Ok(ToolReturn::Value(Value::Null))
    });
    let agent = Runnable::agent(
        AgentDef::new(
            "worker",
            Arc::new(ScriptedAdapter::tool_then_text("call-1", "slow", "{}", "never")),
        )
        .with_tool(slow),
    );

    let stream = runner.run(agent, session.clone(), RunConfig::default());
    let aborter = stream.abort_handle();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(20)).await;
        aborter.abort(Some("cancel".into()));
    });

    let result = stream.wait().await.unwrap();
    assert_eq!(result.status, RunStatus::Aborted);
    assert_eq!(result.error.as_deref(), Some("cancel"));

    let session = session.lock().await;
    let last = session.events().last().unwrap();
    assert!(
        matches!(
            &last.payload,
            EventPayload::InvocationEnd { reason: axon::EndReason::Aborted, .. }
        ),
        "last event must be the aborted invocation_end, got {}",
        last.type_name()
    );
}

// ── E6: max steps ─────────────────────────────────────────────────────────────

#[tokio::test]
async fn e6_max_steps_surfaces_as_status_not_error() {
    let (runner, _service, session) = memory_harness().await;
    let agent = Runnable::agent(
        AgentDef::new("restless", Arc::new(ScriptedAdapter::always_tool("inc", "{}")))
            .with_tool(inc_tool())
            .with_max_steps(3),
    );
    let result = runner
        .run_to_result(agent, session.clone(), RunConfig::default())
        .await
        .unwrap();

    assert_eq!(result.status, RunStatus::MaxSteps);

    let session = session.lock().await;
    let model_ends = session
        .events()
        .iter()
        .filter(|e| e.type_name() == "model_end")
        .count();
    assert_eq!(model_ends, 3, "exactly three model steps ran");
}

// ── Properties ────────────────────────────────────────────────────────────────

#[tokio::test]
async fn append_only_prefix_is_preserved_across_runs() {
    let (runner, service, session) = memory_harness().await;
    service
        .append_event(&session, Event::user("first", None))
        .await
        .unwrap();

    let adapter = Arc::new(ScriptedAdapter::new(vec![
        ScriptedAdapter::text_script("one"),
        ScriptedAdapter::text_script("two"),
    ]));
    let make_agent = || Runnable::agent(AgentDef::new("echoer", adapter.clone()));

    runner
        .run_to_result(make_agent(), session.clone(), RunConfig::default())
        .await
        .unwrap();
    let prefix_ids: Vec<String> = {
        let session = session.lock().await;
        session.events().iter().map(|e| e.id.clone()).collect()
    };

    service
        .append_event(&session, Event::user("second", None))
        .await
        .unwrap();
    runner
        .run_to_result(make_agent(), session.clone(), RunConfig::default())
        .await
        .unwrap();

    let session = session.lock().await;
    assert!(session.events().len() > prefix_ids.len());
    for (i, id) in prefix_ids.iter().enumerate() {
        assert_eq!(&session.events()[i].id, id, "prefix must be untouched");
    }
}

#[tokio::test]
async fn state_projection_matches_incremental_fold() {
    let (runner, service, session) = memory_harness().await;
    service
        .append_event(&session, Event::user("count twice", None))
        .await
        .unwrap();

    let adapter = Arc::new(ScriptedAdapter::new(vec![
        ScriptedAdapter::tool_script("call-1", "inc", "{}"),
        ScriptedAdapter::tool_script("call-2", "inc", "{}"),
        ScriptedAdapter::text_script("2"),
    ]));
    let agent = Runnable::agent(AgentDef::new("counter", adapter).with_tool(inc_tool()));
    runner
        .run_to_result(agent, session.clone(), RunConfig::default())
        .await
        .unwrap();

    let session = session.lock().await;
    let events = session.events();

    // At every index, the projection equals a hand-rolled fold.
    for index in 0..=events.len() {
        let projected = state_at(events, index, StateScope::Session).unwrap();
        let mut fold = axon::JsonMap::new();
        for event in &events[..index] {
            if let EventPayload::StateChange { scope, changes, .. } = &event.payload {
                if *scope != StateScope::Session {
                    continue;
                }
                for delta in changes {
                    match &delta.new_value {
                        Some(v) => {
                            fold.insert(delta.key.clone(), v.clone());
                        }
                        None => {
                            fold.remove(&delta.key);
                        }
                    }
                }
            }
        }
        assert_eq!(projected, fold, "divergence at index {index}");
    }

    assert_eq!(session.state().get("count"), Some(&json!(2)));
    let snapshot = snapshot_at(events, events.len()).unwrap();
    assert_eq!(snapshot.status, SessionStatus::Completed);
    assert!(snapshot.pending_calls.is_empty());
}

#[tokio::test]
async fn sequence_resumes_at_suspended_child() {
    let (runner, service, session) = memory_harness().await;

    let front_adapter = Arc::new(ScriptedAdapter::always_text("triaged"));
    let asker_adapter = Arc::new(ScriptedAdapter::new(vec![
        ScriptedAdapter::tool_script("call-ask", "ask", "{}"),
        ScriptedAdapter::text_script("resolved"),
    ]));
    let make_pipeline = || {
        Runnable::sequence(
            "pipeline",
            vec![
                Runnable::agent(AgentDef::new("front", front_adapter.clone())),
                Runnable::agent(
                    AgentDef::new("asker", asker_adapter.clone()).with_tool(ask_tool("ask")),
                ),
            ],
        )
    };

    let first = runner
        .run_to_result(make_pipeline(), session.clone(), RunConfig::default())
        .await
        .unwrap();
    assert_eq!(first.status, RunStatus::Yielded);

    service
        .append_event(
            &session,
            Event::tool_input("call-ask", "ask", json!({"answer": "go"})),
        )
        .await
        .unwrap();

    let second = runner
        .run_to_result(make_pipeline(), session.clone(), RunConfig::default())
        .await
        .unwrap();
    assert_eq!(second.status, RunStatus::Completed);
    assert_eq!(second.output, Some(Value::String("resolved".into())));

    // The first child ran exactly once across both runs.
    let session = session.lock().await;
    let front_starts = session
        .events()
        .iter()
        .filter(|e| matches!(
            &e.payload,
            EventPayload::InvocationStart { agent_name, .. } if agent_name == "front"
        ))
        .count();
    assert_eq!(front_starts, 1, "completed children are not re-run on resume");
}

#[tokio::test]
async fn bound_patient_state_records_observations_once_per_transition() {
    let service = MemorySessionService::new_arc();
    let runner = Runner::new(service.clone());
    let session = service
        .create_session(
            "clinic",
            CreateSessionOptions {
                patient_id: Some("p1".into()),
                ..Default::default()
            },
        )
        .await
        .unwrap();

    {
        let mut guard = session.lock().await;
        let mut values = axon::JsonMap::new();
        values.insert("bp".into(), json!("120/80"));
        guard.bind(StateScope::Patient, axon::StateBinding::new(values));
    }

    let reader = FnTool::new("read_bp", "read blood pressure", |ctx, _args| async move {
        let bp = ctx.get_state(StateScope::Patient, "bp").await?;
        Ok(ToolReturn::Value(bp.unwrap_or(Value::Null)))
    });
    let adapter = Arc::new(ScriptedAdapter::new(vec![
        ScriptedAdapter::tool_script("call-1", "read_bp", "{}"),
        ScriptedAdapter::tool_script("call-2", "read_bp", "{}"),
        ScriptedAdapter::text_script("stable"),
    ]));
    let agent = Runnable::agent(AgentDef::new("monitor", adapter).with_tool(reader));

    runner
        .run_to_result(agent, session.clone(), RunConfig::default())
        .await
        .unwrap();

    let session = session.lock().await;
    let observations = session
        .events()
        .iter()
        .filter(|e| matches!(
            &e.payload,
            EventPayload::StateChange { source: axon::StateSource::Observation, .. }
        ))
        .count();
    assert_eq!(
        observations, 1,
        "a second read of the same value records nothing"
    );
    assert_eq!(
        axon::state_at(session.events(), session.len(), StateScope::Patient)
            .unwrap()
            .get("bp"),
        Some(&json!("120/80"))
    );
}

#[tokio::test]
async fn parallel_yield_resumes_every_suspended_child() {
    let (runner, service, session) = memory_harness().await;

    let x_adapter = Arc::new(ScriptedAdapter::new(vec![
        ScriptedAdapter::tool_script("call-x", "ask_x", "{}"),
        ScriptedAdapter::text_script("x done"),
    ]));
    let y_adapter = Arc::new(ScriptedAdapter::new(vec![
        ScriptedAdapter::tool_script("call-y", "ask_y", "{}"),
        ScriptedAdapter::text_script("y done"),
    ]));
    let make = || {
        Runnable::parallel(
            "fan",
            vec![
                Runnable::agent(
                    AgentDef::new("x", x_adapter.clone()).with_tool(ask_tool("ask_x")),
                ),
                Runnable::agent(
                    AgentDef::new("y", y_adapter.clone()).with_tool(ask_tool("ask_y")),
                ),
            ],
        )
    };

    let first = runner
        .run_to_result(make(), session.clone(), RunConfig::default())
        .await
        .unwrap();
    assert_eq!(first.status, RunStatus::Yielded);
    let mut pending: Vec<&str> = first.pending_calls.iter().map(|p| p.name.as_str()).collect();
    pending.sort();
    assert_eq!(pending, vec!["ask_x", "ask_y"], "union of both children's pending calls");

    for (call_id, name) in [("call-x", "ask_x"), ("call-y", "ask_y")] {
        service
            .append_event(
                &session,
                Event::tool_input(call_id, name, json!({"answer": "ok"})),
            )
            .await
            .unwrap();
    }

    let second = runner
        .run_to_result(make(), session.clone(), RunConfig::default())
        .await
        .unwrap();
    assert_eq!(second.status, RunStatus::Completed);
    assert_eq!(second.output, Some(json!(["x done", "y done"])));

    // The group and both children re-entered through invocation_resume.
    let session = session.lock().await;
    let resumes = session
        .events()
        .iter()
        .filter(|e| e.type_name() == "invocation_resume")
        .count();
    assert_eq!(resumes, 3);
}

#[tokio::test]
async fn stream_interleaves_deltas_and_events_and_feeds_callbacks() {
    use futures::StreamExt;

    let (runner, service, session) = memory_harness().await;
    service
        .append_event(&session, Event::user("hello", None))
        .await
        .unwrap();

    let seen: Arc<std::sync::Mutex<Vec<String>>> = Default::default();
    let seen_for_cb = seen.clone();
    let config = RunConfig {
        on_stream: Some(Arc::new(move |event| {
            let label = match event {
                axon::StreamEvent::Event(e) => e.type_name().to_string(),
                axon::StreamEvent::TextDelta { .. } => "text_delta".into(),
                axon::StreamEvent::ThoughtDelta { .. } => "thought_delta".into(),
            };
            seen_for_cb.lock().unwrap().push(label);
        })),
        ..Default::default()
    };

    let agent = Runnable::agent(AgentDef::new(
        "greeter",
        Arc::new(ScriptedAdapter::always_text("hi")),
    ));
    let mut stream = runner.run(agent, session, config);
    let events: Vec<_> = stream.stream().unwrap().collect().await;

    assert!(events
        .iter()
        .any(|e| matches!(e, axon::StreamEvent::TextDelta { delta, .. } if delta == "hi")));
    assert!(events.iter().any(|e| matches!(
        e,
        axon::StreamEvent::Event(ev) if ev.type_name() == "invocation_end"
    )));

    let seen = seen.lock().unwrap();
    let delta_pos = seen.iter().position(|l| l == "text_delta").unwrap();
    let assistant_pos = seen.iter().position(|l| l == "assistant").unwrap();
    assert!(delta_pos < assistant_pos, "deltas precede their event: {seen:?}");
}

#[tokio::test]
async fn external_signal_aborts_the_run() {
    let (runner, _service, session) = memory_harness().await;
    let stuck = FnTool::new("stuck", "", |ctx, _args| async move {
        ctx.abort_signal().cancelled().await;
        Ok(ToolReturn::Value(Value::Null))
    });
    let agent = Runnable::agent(
        AgentDef::new(
            "worker",
            Arc::new(ScriptedAdapter::tool_then_text("call-1", "stuck", "{}", "never")),
        )
        .with_tool(stuck),
    );

    let signal = tokio_util::sync::CancellationToken::new();
    let config = RunConfig {
        signal: Some(signal.clone()),
        ..Default::default()
    };
    let stream = runner.run(agent, session, config);
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(20)).await;
        signal.cancel();
    });

    let result = stream.wait().await.unwrap();
    assert_eq!(result.status, RunStatus::Aborted);
}

// ── On-disk store end to end ──────────────────────────────────────────────────

#[tokio::test]
async fn fs_store_survives_yield_and_resume_across_reopen() {
    let dir = tempfile::tempdir().unwrap();

    let adapter = Arc::new(ScriptedAdapter::new(vec![
        ScriptedAdapter::tool_script("call-ask", "ask", "{}"),
        ScriptedAdapter::text_script("picked up"),
    ]));
    let make_agent =
        || Runnable::agent(AgentDef::new("asker", adapter.clone()).with_tool(ask_tool("ask")));

    let session_id;
    {
        let service = Arc::new(FsSessionService::new(dir.path()).unwrap());
        let session = service
            .create_session("clinic", CreateSessionOptions::default())
            .await
            .unwrap();
        session_id = session.lock().await.id.clone();

        let runner = Runner::new(service.clone());
        let first = runner
            .run_to_result(make_agent(), session.clone(), RunConfig::default())
            .await
            .unwrap();
        assert_eq!(first.status, RunStatus::Yielded);
    }

    // A new process: reopen the store, answer the pending call, resume.
    let service = Arc::new(FsSessionService::new(dir.path()).unwrap());
    let session = service
        .get_session("clinic", &session_id)
        .await
        .unwrap()
        .expect("session persisted");
    {
        let guard = session.lock().await;
        assert_eq!(axon::status(guard.events()), SessionStatus::AwaitingInput);
    }
    service
        .append_event(
            &session,
            Event::tool_input("call-ask", "ask", json!({"answer": "yes"})),
        )
        .await
        .unwrap();

    let runner = Runner::new(service.clone());
    let second = runner
        .run_to_result(make_agent(), session.clone(), RunConfig::default())
        .await
        .unwrap();
    assert_eq!(second.status, RunStatus::Completed);
    assert_eq!(second.output, Some(Value::String("picked up".into())));
}
