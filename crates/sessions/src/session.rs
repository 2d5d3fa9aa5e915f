//! The per-session record.

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

use crate::state::{SessionRole, SessionState};

/// Snapshot of one session.  Mutated only by the task that owns the session;
/// everyone else sees copies.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Session {
    pub id: String,
    pub role: SessionRole,
    pub peer_address: String,
    pub state: SessionState,
    pub outbound_sequence: u64,
    /// Highest accepted inbound sequence.
    pub inbound_sequence: u64,
    pub last_checkpoint_number: u64,
    pub token_count: u64,
    /// Successful re-attachments after a dropped connection.
    #[serde(default)]
    pub resumes: u32,
    pub created_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
    pub last_activity_at: DateTime<Utc>,
}

impl Session {
    pub fn new(
        id: impl Into<String>,
        role: SessionRole,
        peer_address: impl Into<String>,
        max_duration: std::time::Duration,
    ) -> Self {
        let now = Utc::now();
        let max = Duration::from_std(max_duration).unwrap_or(Duration::MAX);
        Self {
            id: id.into(),
            role,
            peer_address: peer_address.into(),
            state: SessionState::Uninitialized,
            outbound_sequence: 0,
            inbound_sequence: 0,
            last_checkpoint_number: 0,
            token_count: 0,
            resumes: 0,
            created_at: now,
            expires_at: now.checked_add_signed(max).unwrap_or(DateTime::<Utc>::MAX_UTC),
            last_activity_at: now,
        }
    }

    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        now >= self.expires_at
    }

    pub fn touch(&mut self) {
        self.last_activity_at = Utc::now();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn new_session_starts_uninitialized() {
        let s = Session::new("s1", SessionRole::Initiator, "0xabc", std::time::Duration::from_secs(60));
        assert_eq!(s.state, SessionState::Uninitialized);
        assert_eq!(s.outbound_sequence, 0);
        assert_eq!(s.expires_at - s.created_at, Duration::seconds(60));
        assert!(!s.is_expired(s.created_at));
        assert!(s.is_expired(s.created_at + Duration::seconds(60)));
    }

    #[test]
    fn huge_duration_saturates() {
        let s = Session::new("s1", SessionRole::Responder, "0xabc", std::time::Duration::MAX);
        assert!(!s.is_expired(Utc::now()));
    }

    #[test]
    fn serializes_camel_case() {
        let s = Session::new("s1", SessionRole::Initiator, "0xabc", std::time::Duration::from_secs(1));
        let json = serde_json::to_value(&s).unwrap();
        assert_eq!(json["lastCheckpointNumber"], 0);
        assert_eq!(json["state"], "uninitialized");
    }
}
