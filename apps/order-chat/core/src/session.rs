use serde::{Deserialize, Serialize};
use thiserror::Error;
use time::{Duration, OffsetDateTime};
use uuid::Uuid;

/// Name of the cookie carrying the session identifier.
pub const SESSION_COOKIE: &str = "session";

/// Lifetime of a freshly issued session.
pub const DEFAULT_SESSION_TTL: Duration = Duration::days(7);

/// A login session as stored by the surrounding system.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionRecord {
    pub session_id: String,
    pub user_id: String,
    /// Display name attached to messages the user sends.
    #[serde(default)]
    pub username: Option<String>,
    #[serde(with = "time::serde::rfc3339")]
    pub issued_at: OffsetDateTime,
    #[serde(with = "time::serde::rfc3339")]
    pub expires_at: OffsetDateTime,
}

impl SessionRecord {
    /// Builds a session with a random identifier and the provided TTL.
    pub fn issue(user_id: impl Into<String>, ttl: Duration) -> Self {
        let issued_at = OffsetDateTime::now_utc();
        Self {
            session_id: Uuid::new_v4().to_string(),
            user_id: user_id.into(),
            username: None,
            issued_at,
            expires_at: issued_at + ttl,
        }
    }

    pub fn with_username(mut self, username: impl Into<String>) -> Self {
        self.username = Some(username.into());
        self
    }

    pub fn with_id(mut self, session_id: impl Into<String>) -> Self {
        self.session_id = session_id.into();
        self
    }

    /// Returns `Ok(())` if the session has not yet expired.
    pub fn ensure_not_expired(&self, now: OffsetDateTime) -> Result<(), SessionValidationError> {
        if now > self.expires_at {
            Err(SessionValidationError::Expired)
        } else {
            Ok(())
        }
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum SessionValidationError {
    #[error("session has expired")]
    Expired,
}
