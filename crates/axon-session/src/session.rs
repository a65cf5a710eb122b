// Copyright (c) 2025-2026 Axon Contributors
//
// SPDX-License-Identifier: Apache-2.0
use std::collections::HashMap;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use axon_types::{
    now_ms, Event, EventPayload, JsonMap, SessionError, StateDelta, StateScope, StateSource,
};

use crate::spawn::SpawnTracker;

/// Shared handle to a session.  All mutation goes through the owning
/// [`SessionService`](crate::SessionService), which locks the handle; the
/// cooperative runtime keeps critical sections short.
pub type SharedSession = Arc<tokio::sync::Mutex<Session>>;

/// Callback fired when a bound scope value changes; the outer store owns the
/// data and is responsible for any persistence.
pub type ChangeCallback = Arc<dyn Fn(&str, Option<&Value>) + Send + Sync>;

/// A borrowed shared-state scope: the session holds the current values plus
/// an optional write-back callback, the outer store owns the data.
#[derive(Clone, Default)]
pub struct StateBinding {
    pub values: JsonMap,
    pub on_change: Option<ChangeCallback>,
}

impl StateBinding {
    pub fn new(values: JsonMap) -> Self {
        Self {
            values,
            on_change: None,
        }
    }

    pub fn with_callback(values: JsonMap, on_change: ChangeCallback) -> Self {
        Self {
            values,
            on_change: Some(on_change),
        }
    }
}

/// The owner of one conversation's event log and all state derived from it.
///
/// Events are append-only; state is the left-fold of `state_change` events.
/// The session keeps materialized fold caches per scope so reads are O(1),
/// but the log remains the sole authority — caches are rebuilt from it on
/// fork and on load.
pub struct Session {
    pub id: String,
    pub app_name: String,
    pub version: Option<String>,
    pub user_id: Option<String>,
    pub patient_id: Option<String>,
    pub practice_id: Option<String>,
    pub created_at: i64,
    events: Vec<Event>,
    /// Fold caches, one per scope.  For bound scopes this is the *recorded*
    /// view (what the log says), which may trail the externally owned values.
    folds: HashMap<StateScope, JsonMap>,
    bindings: HashMap<StateScope, StateBinding>,
    /// Per-invocation ephemeral scopes, created lazily and cleared at
    /// invocation end.  Never persisted.
    temp: HashMap<String, JsonMap>,
    /// Background children spawned during runs on this session.
    pub spawns: SpawnTracker,
}

/// Wire form of a session: the JSON document persisted by session services.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionSnapshot {
    pub id: String,
    pub app_name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub version: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub patient_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub practice_id: Option<String>,
    pub created_at: i64,
    pub events: Vec<Event>,
    pub state: JsonMap,
    pub user_state: JsonMap,
    pub patient_state: JsonMap,
    pub practice_state: JsonMap,
}

impl Session {
    pub fn new(app_name: impl Into<String>, id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            app_name: app_name.into(),
            version: None,
            user_id: None,
            patient_id: None,
            practice_id: None,
            created_at: now_ms(),
            events: Vec::new(),
            folds: HashMap::new(),
            bindings: HashMap::new(),
            temp: HashMap::new(),
            spawns: SpawnTracker::new(),
        }
    }

    // ── Event log ─────────────────────────────────────────────────────────

    pub fn events(&self) -> &[Event] {
        &self.events
    }

    pub fn len(&self) -> usize {
        self.events.len()
    }

    pub fn is_empty(&self) -> bool {
        self.events.is_empty()
    }

    /// Append an event, clamping its timestamp so `created_at` never
    /// decreases in log order, and fold any state change into the caches.
    /// Returns a reference to the stored event.
    pub fn append(&mut self, mut event: Event) -> &Event {
        if let Some(last) = self.events.last() {
            if event.created_at < last.created_at {
                event.created_at = last.created_at;
            }
        }
        self.apply(&event);
        self.events.push(event);
        self.events.last().expect("just pushed")
    }

    /// Fold one event into the state caches (and bound values for
    /// non-observation sources).
    fn apply(&mut self, event: &Event) {
        let EventPayload::StateChange {
            scope,
            source,
            changes,
            ..
        } = &event.payload
        else {
            return;
        };

        let fold = self.folds.entry(*scope).or_default();
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

        // Observations record what the binding already holds; everything
        // else writes through to the externally owned values.
        if *scope != StateScope::Session && *source != StateSource::Observation {
            if let Some(binding) = self.bindings.get_mut(scope) {
                for delta in changes {
                    match &delta.new_value {
                        Some(v) => {
                            binding.values.insert(delta.key.clone(), v.clone());
                        }
                        None => {
                            binding.values.remove(&delta.key);
                        }
                    }
                    if let Some(cb) = &binding.on_change {
                        cb(&delta.key, delta.new_value.as_ref());
                    }
                }
            }
        }
    }

    // ── State ─────────────────────────────────────────────────────────────

    /// Current values for a scope: bound values when a binding exists,
    /// otherwise the recorded fold.
    pub fn scope_values(&self, scope: StateScope) -> &JsonMap {
        if scope != StateScope::Session {
            if let Some(binding) = self.bindings.get(&scope) {
                return &binding.values;
            }
        }
        self.recorded(scope)
    }

    /// The recorded (fold-of-log) view of a scope.
    pub fn recorded(&self, scope: StateScope) -> &JsonMap {
        static EMPTY: std::sync::OnceLock<JsonMap> = std::sync::OnceLock::new();
        self.folds
            .get(&scope)
            .unwrap_or_else(|| EMPTY.get_or_init(JsonMap::new))
    }

    /// Session-scope state shorthand.
    pub fn state(&self) -> &JsonMap {
        self.scope_values(StateScope::Session)
    }

    /// Attach an externally owned shared-state scope.  Session scope cannot
    /// be bound — it is owned by the log.
    pub fn bind(&mut self, scope: StateScope, binding: StateBinding) {
        debug_assert!(scope != StateScope::Session, "session scope is log-owned");
        if scope != StateScope::Session {
            self.bindings.insert(scope, binding);
        }
    }

    pub fn is_bound(&self, scope: StateScope) -> bool {
        self.bindings.contains_key(&scope)
    }

    /// Build a `state_change` event for the given writes, diffing against the
    /// current scope values and dropping no-op entries.  Returns `None` when
    /// nothing would change.  The event still has to be appended.
    pub fn build_state_change(
        &self,
        scope: StateScope,
        source: StateSource,
        invocation_id: Option<String>,
        entries: Vec<(String, Option<Value>)>,
    ) -> Option<Event> {
        let current = self.scope_values(scope);
        let changes: Vec<StateDelta> = entries
            .into_iter()
            .filter_map(|(key, new_value)| {
                let old_value = current.get(&key).cloned();
                if old_value == new_value {
                    return None;
                }
                Some(StateDelta {
                    key,
                    old_value,
                    new_value,
                })
            })
            .collect();
        if changes.is_empty() {
            return None;
        }
        Some(Event::state_change(scope, source, invocation_id, changes))
    }

    /// Build an observation event for reads of a bound scope: one delta per
    /// key whose bound value differs from the last recorded value.  Returns
    /// `None` when the scope is unbound or nothing drifted, so repeated reads
    /// of an unchanged value record nothing.
    pub fn build_observation(
        &self,
        scope: StateScope,
        invocation_id: Option<String>,
        keys: &[String],
    ) -> Option<Event> {
        if scope == StateScope::Session {
            return None;
        }
        let binding = self.bindings.get(&scope)?;
        let recorded = self.recorded(scope);
        let changes: Vec<StateDelta> = keys
            .iter()
            .filter_map(|key| {
                let bound = binding.values.get(key).cloned();
                let last = recorded.get(key).cloned();
                if bound == last {
                    return None;
                }
                Some(StateDelta {
                    key: key.clone(),
                    old_value: last,
                    new_value: bound,
                })
            })
            .collect();
        if changes.is_empty() {
            return None;
        }
        Some(Event::state_change(
            scope,
            StateSource::Observation,
            invocation_id,
            changes,
        ))
    }

    /// Observation event covering every key of a bound scope (reads of the
    /// whole scope, `to_object`-style).  Diffs the union of bound and
    /// recorded keys so externally deleted keys are observed too.
    pub fn build_full_observation(
        &self,
        scope: StateScope,
        invocation_id: Option<String>,
    ) -> Option<Event> {
        let binding = self.bindings.get(&scope)?;
        let mut keys: Vec<String> = binding.values.keys().cloned().collect();
        for key in self.recorded(scope).keys() {
            if !binding.values.contains_key(key) {
                keys.push(key.clone());
            }
        }
        self.build_observation(scope, invocation_id, &keys)
    }

    // ── Temp state ────────────────────────────────────────────────────────

    /// The ephemeral scope for an invocation, created lazily on first access.
    pub fn temp_mut(&mut self, invocation_id: &str) -> &mut JsonMap {
        self.temp.entry(invocation_id.to_string()).or_default()
    }

    pub fn temp(&self, invocation_id: &str) -> Option<&JsonMap> {
        self.temp.get(invocation_id)
    }

    /// Shallow-copy the parent's temp scope into the child's at handoff
    /// time, applying per-key overrides.  Child mutations never flow back.
    pub fn inherit_temp(
        &mut self,
        parent_invocation_id: &str,
        child_invocation_id: &str,
        overrides: JsonMap,
    ) {
        let mut inherited = self
            .temp
            .get(parent_invocation_id)
            .cloned()
            .unwrap_or_default();
        for (k, v) in overrides {
            inherited.insert(k, v);
        }
        self.temp.insert(child_invocation_id.to_string(), inherited);
    }

    /// Drop an invocation's temp scope at invocation end.
    pub fn clear_temp(&mut self, invocation_id: &str) {
        self.temp.remove(invocation_id);
    }

    // ── Lifecycles ────────────────────────────────────────────────────────

    /// Deep copy with the same identity.  Bindings and their callbacks are
    /// shared (the outer store owns the data); the spawn tracker is fresh.
    pub fn clone_session(&self) -> Session {
        Session {
            id: self.id.clone(),
            app_name: self.app_name.clone(),
            version: self.version.clone(),
            user_id: self.user_id.clone(),
            patient_id: self.patient_id.clone(),
            practice_id: self.practice_id.clone(),
            created_at: self.created_at,
            events: self.events.clone(),
            folds: self.folds.clone(),
            bindings: self.bindings.clone(),
            temp: self.temp.clone(),
            spawns: SpawnTracker::new(),
        }
    }

    /// Fork at an event index: an independent session (fresh id, no
    /// bindings, no temp state) holding a deep copy of `events[0..index]`
    /// with fold caches rebuilt by replay.
    pub fn fork_at(&self, index: usize) -> Result<Session, SessionError> {
        if index > self.events.len() {
            return Err(SessionError::IndexOutOfBounds {
                index,
                len: self.events.len(),
            });
        }
        let mut forked = Session::new(
            self.app_name.clone(),
            uuid::Uuid::new_v4().to_string(),
        );
        forked.version = self.version.clone();
        forked.user_id = self.user_id.clone();
        forked.patient_id = self.patient_id.clone();
        forked.practice_id = self.practice_id.clone();
        for event in &self.events[..index] {
            let copy = event.clone();
            forked.apply(&copy);
            forked.events.push(copy);
        }
        Ok(forked)
    }

    /// Serialize to the wire document.  Scope maps reflect current values
    /// (bound where bound, recorded otherwise).
    pub fn to_snapshot(&self) -> SessionSnapshot {
        SessionSnapshot {
            id: self.id.clone(),
            app_name: self.app_name.clone(),
            version: self.version.clone(),
            user_id: self.user_id.clone(),
            patient_id: self.patient_id.clone(),
            practice_id: self.practice_id.clone(),
            created_at: self.created_at,
            events: self.events.clone(),
            state: self.scope_values(StateScope::Session).clone(),
            user_state: self.scope_values(StateScope::User).clone(),
            patient_state: self.scope_values(StateScope::Patient).clone(),
            practice_state: self.scope_values(StateScope::Practice).clone(),
        }
    }

    /// Restore from the wire document.  Fold caches are rebuilt from the
    /// event log (the log is authoritative); bindings are not restored —
    /// they belong to the outer store.
    pub fn from_snapshot(snapshot: SessionSnapshot) -> Session {
        let mut session = Session::new(snapshot.app_name, snapshot.id);
        session.version = snapshot.version;
        session.user_id = snapshot.user_id;
        session.patient_id = snapshot.patient_id;
        session.practice_id = snapshot.practice_id;
        session.created_at = snapshot.created_at;
        for event in snapshot.events {
            session.apply(&event);
            session.events.push(event);
        }
        session
    }

    pub fn into_shared(self) -> SharedSession {
        Arc::new(tokio::sync::Mutex::new(self))
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
