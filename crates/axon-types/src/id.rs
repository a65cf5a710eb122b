// Copyright (c) 2025-2026 Axon Contributors
//
// SPDX-License-Identifier: Apache-2.0
use uuid::Uuid;

/// 24 hex chars of UUID v4 entropy (96 bits), the id body used by all
/// runtime identifiers.
fn short_hex() -> String {
    let mut s = Uuid::new_v4().simple().to_string();
    s.truncate(24);
    s
}

/// Fresh event id: `evt_` + 24 hex chars.
pub fn new_event_id() -> String {
    format!("evt_{}", short_hex())
}

/// Fresh tool-call id: `call_` + 24 hex chars.
pub fn new_call_id() -> String {
    format!("call_{}", short_hex())
}

/// Fresh invocation id: `inv_` + 24 hex chars.
pub fn new_invocation_id() -> String {
    format!("inv_{}", short_hex())
}

/// Current wall-clock time as unix milliseconds.
pub fn now_ms() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

// ─── Unit tests ──────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn call_id_has_prefix_and_length() {
        let id = new_call_id();
        assert!(id.starts_with("call_"));
        assert_eq!(id.len(), "call_".len() + 24);
        assert!(id["call_".len()..].chars().all(|c| c.is_ascii_hexdigit()));
    }

    #[test]
    fn invocation_id_has_prefix_and_length() {
        let id = new_invocation_id();
        assert!(id.starts_with("inv_"));
        assert_eq!(id.len(), "inv_".len() + 24);
    }

    #[test]
    fn ids_are_unique() {
        assert_ne!(new_call_id(), new_call_id());
        assert_ne!(new_invocation_id(), new_invocation_id());
        assert_ne!(new_event_id(), new_event_id());
    }

    #[test]
    fn now_ms_is_positive_and_monotonic_enough() {
        let a = now_ms();
        let b = now_ms();
        assert!(a > 0);
        assert!(b >= a);
    }
}
