use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::ids::{SessionId, UserId};

#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct User {
    pub id: UserId,
    pub username: String,
    pub password_hash: String,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct Session {
    pub id: SessionId,
    pub user_id: UserId,
    pub expires_at: DateTime<Utc>,
    pub revoked_at: Option<DateTime<Utc>>,
}

impl Session {
    /// Valid iff not revoked and not yet expired as of `now`.
    pub fn is_valid_at(&self, now: DateTime<Utc>) -> bool {
        self.revoked_at.is_none() && self.expires_at > now
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ids::UserId;
    use chrono::Duration;

    fn session(expires_in: Duration, revoked: bool) -> Session {
        let now = Utc::now();
        Session {
            id: SessionId::new(),
            user_id: UserId::new(),
            expires_at: now + expires_in,
            revoked_at: revoked.then_some(now),
        }
    }

    #[test]
    fn valid_session_is_not_expired_and_not_revoked() {
        let s = session(Duration::hours(1), false);
        assert!(s.is_valid_at(Utc::now()));
    }

    #[test]
    fn expired_session_is_invalid() {
        let s = session(Duration::seconds(-1), false);
        assert!(!s.is_valid_at(Utc::now()));
    }

    #[test]
    fn revoked_session_is_invalid_even_if_unexpired() {
        let s = session(Duration::hours(1), true);
        assert!(!s.is_valid_at(Utc::now()));
    }
}
