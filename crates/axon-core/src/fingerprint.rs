// Copyright (c) 2025-2026 Axon Contributors
//
// SPDX-License-Identifier: Apache-2.0
//! Content-addressed identity of a runnable tree.
//!
//! The fingerprint is the SHA-256 (truncated to 16 hex chars) of a canonical
//! JSON rendering of the tree: kind, name, sorted tool names, loop yield
//! flags, and children in declaration order.  It is recorded on the root
//! `invocation_start` and re-checked on every later run of the same session,
//! so a session suspended under one pipeline can never silently resume under
//! a structurally different one.

use serde_json::{Map, Value};
use sha2::{Digest, Sha256};

use crate::runnable::Runnable;

/// Fingerprint a runnable tree: 16 hex chars.
pub fn fingerprint(runnable: &Runnable) -> String {
    // serde_json maps are BTreeMap-backed, so serialization is canonical
    // (keys in sorted order) without extra work.
    let canonical = serde_json::to_string(&node(runnable)).expect("fingerprint node is plain JSON");
    let digest = Sha256::digest(canonical.as_bytes());
    let mut hex = hex::encode(digest);
    hex.truncate(16);
    hex
}

fn node(runnable: &Runnable) -> Value {
    let mut map = Map::new();
    map.insert("kind".into(), Value::String(runnable.kind().as_str().into()));
    map.insert("name".into(), Value::String(runnable.name().into()));

    match runnable {
        Runnable::Agent(def) => {
            let mut tools: Vec<String> = def.tools.iter().map(|t| t.name().to_string()).collect();
            tools.extend(def.provider_tools.iter().map(|t| t.name.clone()));
            tools.sort();
            map.insert(
                "tools".into(),
                Value::Array(tools.into_iter().map(Value::String).collect()),
            );
        }
        Runnable::Loop(def) => {
            if def.yields {
                map.insert("yields".into(), Value::Bool(true));
            }
            map.insert("children".into(), Value::Array(vec![node(&def.child)]));
        }
        Runnable::Sequence(_) | Runnable::Parallel(_) => {
            map.insert(
                "children".into(),
                Value::Array(runnable.children().iter().map(node).collect()),
            );
        }
        Runnable::Step(_) => {}
    }
    Value::Object(map)
}

// ─── Unit tests ──────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use axon_model::EchoAdapter;
    use serde_json::Value;

    use super::*;
    use crate::runnable::{AgentDef, LoopDef};
    use crate::tool::{FnTool, ToolReturn};

    fn agent_with_tools(name: &str, tools: &[&str]) -> Runnable {
        let mut def = AgentDef::new(name, Arc::new(EchoAdapter));
        for t in tools {
            def = def.with_tool(FnTool::new(*t, "", |_ctx, _args| async move {
                Ok(ToolReturn::Value(Value::Null))
            }));
        }
        Runnable::agent(def)
    }

    #[test]
    fn fingerprint_is_sixteen_hex_chars() {
        let fp = fingerprint(&agent_with_tools("a", &["x"]));
        assert_eq!(fp.len(), 16);
        assert!(fp.chars().all(|c| c.is_ascii_hexdigit()));
    }

    #[test]
    fn fingerprint_is_stable() {
        let r = agent_with_tools("a", &["x", "y"]);
        assert_eq!(fingerprint(&r), fingerprint(&r));
    }

    #[test]
    fn tool_order_does_not_matter() {
        assert_eq!(
            fingerprint(&agent_with_tools("a", &["x", "y"])),
            fingerprint(&agent_with_tools("a", &["y", "x"]))
        );
    }

    #[test]
    fn renamed_tool_changes_fingerprint() {
        assert_ne!(
            fingerprint(&agent_with_tools("a", &["ask"])),
            fingerprint(&agent_with_tools("a", &["ask_v2"]))
        );
    }

    #[test]
    fn name_and_kind_change_fingerprint() {
        assert_ne!(
            fingerprint(&agent_with_tools("a", &[])),
            fingerprint(&agent_with_tools("b", &[]))
        );
        let seq = Runnable::sequence("s", vec![agent_with_tools("a", &[])]);
        let par = Runnable::parallel("s", vec![agent_with_tools("a", &[])]);
        assert_ne!(fingerprint(&seq), fingerprint(&par));
    }

    #[test]
    fn child_order_matters() {
        let ab = Runnable::sequence(
            "s",
            vec![agent_with_tools("a", &[]), agent_with_tools("b", &[])],
        );
        let ba = Runnable::sequence(
            "s",
            vec![agent_with_tools("b", &[]), agent_with_tools("a", &[])],
        );
        assert_ne!(fingerprint(&ab), fingerprint(&ba));
    }

    #[test]
    fn loop_yield_flag_changes_fingerprint() {
        let plain = Runnable::repeat(LoopDef::new("l", agent_with_tools("a", &[])));
        let yielding = Runnable::repeat(LoopDef::new("l", agent_with_tools("a", &[])).yielding());
        assert_ne!(fingerprint(&plain), fingerprint(&yielding));
    }
}
