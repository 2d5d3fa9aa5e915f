//! Session expiry: max duration and idle timeout.
//!
//! Evaluated by the owning task on a timer tick.  A session that is stale
//! moves to `Closing`, which flushes its final checkpoint.

use chrono::{DateTime, Utc};

use sw_domain::config::SessionConfig;

use crate::session::Session;

/// Why a session is being closed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CloseReason {
    /// Caller asked for it.
    Requested,
    MaxDuration { max_secs: u64 },
    IdleTimeout { idle_secs: u64 },
    /// The SDK is shutting down.
    Shutdown,
}

impl std::fmt::Display for CloseReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Requested => write!(f, "requested"),
            Self::MaxDuration { max_secs } => write!(f, "max duration ({max_secs}s)"),
            Self::IdleTimeout { idle_secs } => write!(f, "idle timeout ({idle_secs}s)"),
            Self::Shutdown => write!(f, "shutdown"),
        }
    }
}

/// Evaluates whether a session should be closed.
#[derive(Debug, Clone)]
pub struct LifecycleManager {
    config: SessionConfig,
}

impl LifecycleManager {
    pub fn new(config: SessionConfig) -> Self {
        Self { config }
    }

    /// `Some(reason)` when the session has outlived its budget.  A zero
    /// idle timeout disables the idle check; max duration is checked first.
    ///
    /// `busy` suppresses the idle check while a generation is in flight.
    pub fn should_close(&self, session: &Session, now: DateTime<Utc>, busy: bool) -> Option<CloseReason> {
        if session.is_expired(now) {
            return Some(CloseReason::MaxDuration {
                max_secs: self.config.max_duration_secs,
            });
        }

        let idle = self.config.idle_timeout_secs;
        if idle > 0 && !busy {
            let elapsed = now
                .signed_duration_since(session.last_activity_at)
                .num_seconds();
            if elapsed >= idle as i64 {
                return Some(CloseReason::IdleTimeout { idle_secs: idle });
            }
        }

        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::state::SessionRole;
    use chrono::Duration;

    fn session(max_secs: u64) -> Session {
        Session::new(
            "s1",
            SessionRole::Initiator,
            "0xabc",
            std::time::Duration::from_secs(max_secs),
        )
    }

    fn manager(idle_secs: u64) -> LifecycleManager {
        LifecycleManager::new(SessionConfig {
            idle_timeout_secs: idle_secs,
            max_duration_secs: 3600,
            ..Default::default()
        })
    }

    #[test]
    fn fresh_session_stays_open() {
        let s = session(3600);
        assert_eq!(manager(600).should_close(&s, Utc::now(), false), None);
    }

    #[test]
    fn idle_timeout() {
        let mut s = session(3600);
        s.last_activity_at = Utc::now() - Duration::minutes(11);
        assert_eq!(
            manager(600).should_close(&s, Utc::now(), false),
            Some(CloseReason::IdleTimeout { idle_secs: 600 })
        );
    }

    #[test]
    fn busy_session_is_never_idle() {
        let mut s = session(3600);
        s.last_activity_at = Utc::now() - Duration::minutes(11);
        assert_eq!(manager(600).should_close(&s, Utc::now(), true), None);
    }

    #[test]
    fn zero_idle_disables_the_check() {
        let mut s = session(3600);
        s.last_activity_at = Utc::now() - Duration::days(1);
        assert_eq!(manager(0).should_close(&s, Utc::now(), false), None);
    }

    #[test]
    fn max_duration_wins_over_idle() {
        let mut s = session(3600);
        s.last_activity_at = s.created_at - Duration::hours(2);
        let later = s.created_at + Duration::hours(1);
        assert_eq!(
            manager(600).should_close(&s, later, false),
            Some(CloseReason::MaxDuration { max_secs: 3600 })
        );
    }
}
