// Copyright (c) 2025-2026 Axon Contributors
//
// SPDX-License-Identifier: Apache-2.0
//! Local on-disk session store.
//!
//! One JSON document per session under `root/<app>/sessions/<id>.json`, one
//! JSON document per scoped-state store under `root/<app>/state/<scope>/<id>.json`.
//! Documents are rewritten on every append — sessions are small and the
//! store favours obviousness over write throughput.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use tokio::sync::Mutex;
use tracing::debug;

use axon_types::{Event, JsonMap, SessionError, StateScope};

use crate::service::{build_session, CreateSessionOptions, SessionService};
use crate::session::{Session, SessionSnapshot, SharedSession};

pub struct FsSessionService {
    root: PathBuf,
    /// Open sessions, so repeated `get_session` calls share one handle and
    /// appends serialize on the session lock.
    open: Mutex<HashMap<(String, String), SharedSession>>,
}

impl FsSessionService {
    /// Open (or create) a store rooted at `root`.
    pub fn new(root: impl AsRef<Path>) -> Result<Self, SessionError> {
        let root = root.as_ref().to_path_buf();
        std::fs::create_dir_all(&root)?;
        Ok(Self {
            root,
            open: Mutex::new(HashMap::new()),
        })
    }

    fn session_path(&self, app_name: &str, session_id: &str) -> PathBuf {
        self.root
            .join(app_name)
            .join("sessions")
            .join(format!("{session_id}.json"))
    }

    fn scoped_path(&self, scope: StateScope, app_name: &str, id: &str) -> PathBuf {
        self.root
            .join(app_name)
            .join("state")
            .join(scope.as_str())
            .join(format!("{id}.json"))
    }

    fn persist(&self, session: &Session) -> Result<(), SessionError> {
        let path = self.session_path(&session.app_name, &session.id);
        if let Some(dir) = path.parent() {
            std::fs::create_dir_all(dir)?;
        }
        let json = serde_json::to_string_pretty(&session.to_snapshot())?;
        std::fs::write(&path, json)?;
        debug!(session = %session.id, path = %path.display(), "session persisted");
        Ok(())
    }
}

#[async_trait]
impl SessionService for FsSessionService {
    async fn create_session(
        &self,
        app_name: &str,
        opts: CreateSessionOptions,
    ) -> Result<SharedSession, SessionError> {
        let session = build_session(app_name, opts);
        self.persist(&session)?;
        let key = (app_name.to_string(), session.id.clone());
        let shared = session.into_shared();
        self.open.lock().await.insert(key, shared.clone());
        Ok(shared)
    }

    async fn get_session(
        &self,
        app_name: &str,
        session_id: &str,
    ) -> Result<Option<SharedSession>, SessionError> {
        let key = (app_name.to_string(), session_id.to_string());
        let mut open = self.open.lock().await;
        if let Some(shared) = open.get(&key) {
            return Ok(Some(shared.clone()));
        }

        let path = self.session_path(app_name, session_id);
        if !path.exists() {
            return Ok(None);
        }
        let raw = std::fs::read_to_string(&path)?;
        let snapshot: SessionSnapshot = serde_json::from_str(&raw)?;
        let shared = Session::from_snapshot(snapshot).into_shared();
        open.insert(key, shared.clone());
        Ok(Some(shared))
    }

    async fn append_event(
        &self,
        session: &SharedSession,
        event: Event,
    ) -> Result<Event, SessionError> {
        let mut session = session.lock().await;
        let stored = session.append(event).clone();
        self.persist(&session)?;
        Ok(stored)
    }

    async fn delete_session(&self, app_name: &str, session_id: &str) -> Result<(), SessionError> {
        let key = (app_name.to_string(), session_id.to_string());
        self.open.lock().await.remove(&key);
        let path = self.session_path(app_name, session_id);
        if path.exists() {
            std::fs::remove_file(&path)?;
        }
        Ok(())
    }

    async fn list_sessions(&self, app_name: &str) -> Result<Vec<String>, SessionError> {
        let dir = self.root.join(app_name).join("sessions");
        if !dir.exists() {
            return Ok(Vec::new());
        }
        let mut ids = Vec::new();
        for entry in std::fs::read_dir(&dir)? {
            let entry = entry?;
            let name = entry.file_name();
            let name = name.to_string_lossy();
            if let Some(id) = name.strip_suffix(".json") {
                ids.push(id.to_string());
            }
        }
        ids.sort();
        Ok(ids)
    }

    async fn get_scoped_state(
        &self,
        scope: StateScope,
        app_name: &str,
        id: &str,
    ) -> Result<JsonMap, SessionError> {
        let path = self.scoped_path(scope, app_name, id);
        if !path.exists() {
            return Ok(JsonMap::new());
        }
        let raw = std::fs::read_to_string(&path)?;
        Ok(serde_json::from_str(&raw)?)
    }

    async fn set_scoped_state(
        &self,
        scope: StateScope,
        app_name: &str,
        id: &str,
        state: JsonMap,
    ) -> Result<(), SessionError> {
        let path = self.scoped_path(scope, app_name, id);
        if let Some(dir) = path.parent() {
            std::fs::create_dir_all(dir)?;
        }
        std::fs::write(&path, serde_json::to_string_pretty(&state)?)?;
        Ok(())
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    fn store() -> (tempfile::TempDir, FsSessionService) {
        let dir = tempfile::tempdir().unwrap();
        let svc = FsSessionService::new(dir.path()).unwrap();
        (dir, svc)
    }

    #[tokio::test]
    async fn sessions_survive_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let id;
        {
            let svc = FsSessionService::new(dir.path()).unwrap();
            let session = svc
                .create_session("clinic", CreateSessionOptions::default())
                .await
                .unwrap();
            id = session.lock().await.id.clone();
            svc.append_event(&session, Event::user("hello", None))
                .await
                .unwrap();
        }

        // New service instance over the same directory.
        let svc = FsSessionService::new(dir.path()).unwrap();
        let session = svc.get_session("clinic", &id).await.unwrap().unwrap();
        let session = session.lock().await;
        assert_eq!(session.len(), 1);
        assert_eq!(session.events()[0].type_name(), "user");
    }

    #[tokio::test]
    async fn get_session_returns_shared_handle() {
        let (_dir, svc) = store();
        let session = svc
            .create_session("clinic", CreateSessionOptions::default())
            .await
            .unwrap();
        let id = session.lock().await.id.clone();

        let again = svc.get_session("clinic", &id).await.unwrap().unwrap();
        svc.append_event(&again, Event::user("one", None)).await.unwrap();
        // Both handles see the append.
        assert_eq!(session.lock().await.len(), 1);
    }

    #[tokio::test]
    async fn delete_removes_document() {
        let (_dir, svc) = store();
        let session = svc
            .create_session("clinic", CreateSessionOptions::default())
            .await
            .unwrap();
        let id = session.lock().await.id.clone();
        assert_eq!(svc.list_sessions("clinic").await.unwrap(), vec![id.clone()]);

        svc.delete_session("clinic", &id).await.unwrap();
        assert!(svc.get_session("clinic", &id).await.unwrap().is_none());
        assert!(svc.list_sessions("clinic").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn scoped_state_round_trips_per_scope() {
        let (_dir, svc) = store();
        let mut m = JsonMap::new();
        m.insert("bp".into(), json!("120/80"));
        svc.set_patient_state("clinic", "p1", m).await.unwrap();

        let patient = svc.get_patient_state("clinic", "p1").await.unwrap();
        assert_eq!(patient.get("bp"), Some(&json!("120/80")));
        assert!(svc.get_user_state("clinic", "p1").await.unwrap().is_empty());
        assert!(svc.get_practice_state("clinic", "p1").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn missing_session_is_none() {
        let (_dir, svc) = store();
        assert!(svc.get_session("clinic", "nope").await.unwrap().is_none());
    }
}
