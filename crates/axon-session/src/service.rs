// Copyright (c) 2025-2026 Axon Contributors
//
// SPDX-License-Identifier: Apache-2.0
use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::Mutex;
use uuid::Uuid;

use axon_types::{Event, JsonMap, SessionError, StateScope, StateSource};

use crate::session::{Session, SharedSession};

/// Options for [`SessionService::create_session`].
#[derive(Debug, Clone, Default)]
pub struct CreateSessionOptions {
    pub session_id: Option<String>,
    pub user_id: Option<String>,
    pub patient_id: Option<String>,
    pub practice_id: Option<String>,
    /// Seed values for session-scope state.  Recorded as a `state_change`
    /// event with source `direct`, so the log stays the sole authority.
    pub initial_state: Option<JsonMap>,
    pub version: Option<String>,
}

/// Storage seam for sessions and scoped key-value state.
///
/// Implementations must serialize access internally: the engine and any
/// sub-runners append through the same service concurrently.
#[async_trait]
pub trait SessionService: Send + Sync {
    async fn create_session(
        &self,
        app_name: &str,
        opts: CreateSessionOptions,
    ) -> Result<SharedSession, SessionError>;

    async fn get_session(
        &self,
        app_name: &str,
        session_id: &str,
    ) -> Result<Option<SharedSession>, SessionError>;

    /// Append an event to the session and persist.  Returns the stored event
    /// (its timestamp may have been clamped to keep the log monotonic).
    async fn append_event(
        &self,
        session: &SharedSession,
        event: Event,
    ) -> Result<Event, SessionError>;

    async fn delete_session(&self, app_name: &str, session_id: &str) -> Result<(), SessionError>;

    async fn list_sessions(&self, app_name: &str) -> Result<Vec<String>, SessionError>;

    async fn get_scoped_state(
        &self,
        scope: StateScope,
        app_name: &str,
        id: &str,
    ) -> Result<JsonMap, SessionError>;

    async fn set_scoped_state(
        &self,
        scope: StateScope,
        app_name: &str,
        id: &str,
        state: JsonMap,
    ) -> Result<(), SessionError>;

    // Scoped-store shorthands.

    async fn get_user_state(&self, app_name: &str, id: &str) -> Result<JsonMap, SessionError> {
        self.get_scoped_state(StateScope::User, app_name, id).await
    }

    async fn set_user_state(
        &self,
        app_name: &str,
        id: &str,
        state: JsonMap,
    ) -> Result<(), SessionError> {
        self.set_scoped_state(StateScope::User, app_name, id, state).await
    }

    async fn get_patient_state(&self, app_name: &str, id: &str) -> Result<JsonMap, SessionError> {
        self.get_scoped_state(StateScope::Patient, app_name, id).await
    }

    async fn set_patient_state(
        &self,
        app_name: &str,
        id: &str,
        state: JsonMap,
    ) -> Result<(), SessionError> {
        self.set_scoped_state(StateScope::Patient, app_name, id, state).await
    }

    async fn get_practice_state(&self, app_name: &str, id: &str) -> Result<JsonMap, SessionError> {
        self.get_scoped_state(StateScope::Practice, app_name, id).await
    }

    async fn set_practice_state(
        &self,
        app_name: &str,
        id: &str,
        state: JsonMap,
    ) -> Result<(), SessionError> {
        self.set_scoped_state(StateScope::Practice, app_name, id, state).await
    }
}

/// Build a session from creation options, seeding initial state through the
/// event log.  Shared by the in-memory and on-disk services.
pub(crate) fn build_session(app_name: &str, opts: CreateSessionOptions) -> Session {
    let id = opts
        .session_id
        .unwrap_or_else(|| Uuid::new_v4().to_string());
    let mut session = Session::new(app_name, id);
    session.user_id = opts.user_id;
    session.patient_id = opts.patient_id;
    session.practice_id = opts.practice_id;
    session.version = opts.version;
    if let Some(initial) = opts.initial_state {
        if !initial.is_empty() {
            let entries = initial.into_iter().map(|(k, v)| (k, Some(v))).collect();
            if let Some(event) = session.build_state_change(
                StateScope::Session,
                StateSource::Direct,
                None,
                entries,
            ) {
                session.append(event);
            }
        }
    }
    session
}

/// Pure in-memory session store.  The reference implementation for tests and
/// for hosts that persist elsewhere.
#[derive(Default)]
pub struct MemorySessionService {
    sessions: Mutex<HashMap<(String, String), SharedSession>>,
    scoped: Mutex<HashMap<(StateScope, String, String), JsonMap>>,
}

impl MemorySessionService {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn new_arc() -> Arc<Self> {
        Arc::new(Self::new())
    }
}

#[async_trait]
impl SessionService for MemorySessionService {
    async fn create_session(
        &self,
        app_name: &str,
        opts: CreateSessionOptions,
    ) -> Result<SharedSession, SessionError> {
        let session = build_session(app_name, opts);
        let key = (app_name.to_string(), session.id.clone());
        let shared = session.into_shared();
        self.sessions.lock().await.insert(key, shared.clone());
        Ok(shared)
    }

    async fn get_session(
        &self,
        app_name: &str,
        session_id: &str,
    ) -> Result<Option<SharedSession>, SessionError> {
        let key = (app_name.to_string(), session_id.to_string());
        Ok(self.sessions.lock().await.get(&key).cloned())
    }

    async fn append_event(
        &self,
        session: &SharedSession,
        event: Event,
    ) -> Result<Event, SessionError> {
        let mut session = session.lock().await;
        Ok(session.append(event).clone())
    }

    async fn delete_session(&self, app_name: &str, session_id: &str) -> Result<(), SessionError> {
        let key = (app_name.to_string(), session_id.to_string());
        self.sessions.lock().await.remove(&key);
        Ok(())
    }

    async fn list_sessions(&self, app_name: &str) -> Result<Vec<String>, SessionError> {
        let sessions = self.sessions.lock().await;
        let mut ids: Vec<String> = sessions
            .keys()
            .filter(|(app, _)| app == app_name)
            .map(|(_, id)| id.clone())
            .collect();
        ids.sort();
        Ok(ids)
    }

    async fn get_scoped_state(
        &self,
        scope: StateScope,
        app_name: &str,
        id: &str,
    ) -> Result<JsonMap, SessionError> {
        let key = (scope, app_name.to_string(), id.to_string());
        Ok(self.scoped.lock().await.get(&key).cloned().unwrap_or_default())
    }

    async fn set_scoped_state(
        &self,
        scope: StateScope,
        app_name: &str,
        id: &str,
        state: JsonMap,
    ) -> Result<(), SessionError> {
        let key = (scope, app_name.to_string(), id.to_string());
        self.scoped.lock().await.insert(key, state);
        Ok(())
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
