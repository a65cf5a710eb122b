// Copyright (c) 2025-2026 Axon Contributors
//
// SPDX-License-Identifier: Apache-2.0
use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use serde::{Deserialize, Serialize};
use tokio::sync::Notify;

use axon_types::now_ms;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SpawnStatus {
    Running,
    Completed,
    Error,
}

/// Lifecycle record of one spawned (or dispatched) child invocation.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SpawnRecord {
    pub agent_name: String,
    pub started_at: i64,
    pub status: SpawnStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// Tracks background children by invocation id.
///
/// Cloning shares the underlying tracker; the session hands clones to every
/// child context so `wait_for_all` observes the whole tree.
#[derive(Clone, Default)]
pub struct SpawnTracker {
    inner: Arc<SpawnInner>,
}

#[derive(Default)]
struct SpawnInner {
    records: Mutex<HashMap<String, SpawnRecord>>,
    notify: Notify,
}

impl SpawnTracker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn start(&self, invocation_id: impl Into<String>, agent_name: impl Into<String>) {
        let mut records = self.inner.records.lock().unwrap();
        records.insert(
            invocation_id.into(),
            SpawnRecord {
                agent_name: agent_name.into(),
                started_at: now_ms(),
                status: SpawnStatus::Running,
                completed_at: None,
                error: None,
            },
        );
    }

    pub fn complete(&self, invocation_id: &str) {
        self.finish(invocation_id, SpawnStatus::Completed, None);
    }

    pub fn fail(&self, invocation_id: &str, error: impl Into<String>) {
        self.finish(invocation_id, SpawnStatus::Error, Some(error.into()));
    }

    fn finish(&self, invocation_id: &str, status: SpawnStatus, error: Option<String>) {
        {
            let mut records = self.inner.records.lock().unwrap();
            if let Some(rec) = records.get_mut(invocation_id) {
                rec.status = status;
                rec.completed_at = Some(now_ms());
                rec.error = error;
            }
        }
        self.inner.notify.notify_waiters();
    }

    pub fn get(&self, invocation_id: &str) -> Option<SpawnRecord> {
        self.inner.records.lock().unwrap().get(invocation_id).cloned()
    }

    pub fn records(&self) -> HashMap<String, SpawnRecord> {
        self.inner.records.lock().unwrap().clone()
    }

    pub fn has_running(&self) -> bool {
        self.inner
            .records
            .lock()
            .unwrap()
            .values()
            .any(|r| r.status == SpawnStatus::Running)
    }

    /// Resolve once every tracked child has left the `Running` state.
    /// Used for graceful shutdown.
    pub async fn wait_for_all(&self) {
        loop {
            // Arm the waiter before checking so a completion between the
            // check and the await cannot be missed.
            let notified = self.inner.notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            if !self.has_running() {
                return;
            }
            notified.await;
        }
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn start_then_complete_updates_record() {
        let t = SpawnTracker::new();
        t.start("inv_1", "worker");
        assert!(t.has_running());

        t.complete("inv_1");
        let rec = t.get("inv_1").unwrap();
        assert_eq!(rec.status, SpawnStatus::Completed);
        assert!(rec.completed_at.is_some());
        assert!(!t.has_running());
    }

    #[test]
    fn fail_records_error() {
        let t = SpawnTracker::new();
        t.start("inv_1", "worker");
        t.fail("inv_1", "boom");
        let rec = t.get("inv_1").unwrap();
        assert_eq!(rec.status, SpawnStatus::Error);
        assert_eq!(rec.error.as_deref(), Some("boom"));
    }

    #[test]
    fn clones_share_records() {
        let t = SpawnTracker::new();
        let t2 = t.clone();
        t.start("inv_1", "worker");
        assert!(t2.has_running());
    }

    #[tokio::test]
    async fn wait_for_all_returns_immediately_when_idle() {
        let t = SpawnTracker::new();
        t.wait_for_all().await;
    }

    #[tokio::test]
    async fn wait_for_all_blocks_until_completion() {
        let t = SpawnTracker::new();
        t.start("inv_1", "worker");

        let waiter = t.clone();
        let handle = tokio::spawn(async move { waiter.wait_for_all().await });

        tokio::task::yield_now().await;
        assert!(!handle.is_finished());

        t.complete("inv_1");
        tokio::time::timeout(std::time::Duration::from_secs(1), handle)
            .await
            .expect("wait_for_all should resolve")
            .unwrap();
    }
}
