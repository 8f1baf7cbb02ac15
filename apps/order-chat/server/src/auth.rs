use std::convert::Infallible;

use axum::{
    async_trait,
    extract::FromRequestParts,
    http::{header::COOKIE, request::Parts, HeaderMap},
};
use order_chat_core::{SessionValidationError, SESSION_COOKIE};
use thiserror::Error;

use crate::store::StoreError;

/// Value of the session cookie, if the request carries a non-empty one.
/// Extraction never fails so handlers decide how a missing session is reported.
#[derive(Clone, Debug, Default)]
pub struct SessionCookie(pub Option<String>);

#[async_trait]
impl<S> FromRequestParts<S> for SessionCookie
where
    S: Send + Sync,
{
    type Rejection = Infallible;

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self, Self::Rejection> {
        Ok(SessionCookie(extract_session(&parts.headers)))
    }
}

impl SessionCookie {
    pub fn as_deref(&self) -> Option<&str> {
        self.0.as_deref()
    }
}

fn extract_session(headers: &HeaderMap) -> Option<String> {
    headers
        .get_all(COOKIE)
        .iter()
        .filter_map(|value| value.to_str().ok())
        .flat_map(|cookies| cookies.split(';'))
        .filter_map(|pair| pair.trim().split_once('='))
        .find(|(name, _)| *name == SESSION_COOKIE)
        .map(|(_, value)| value.trim().to_owned())
        .filter(|value| !value.is_empty())
}

#[derive(Debug, Error)]
pub enum AuthError {
    #[error("session cookie missing")]
    MissingCookie,
    #[error("unknown session")]
    UnknownSession,
    #[error("session expired")]
    Expired(#[from] SessionValidationError),
    #[error("session lookup failed: {0}")]
    Store(#[from] StoreError),
}

impl AuthError {
    pub fn metric_label(&self) -> &'static str {
        match self {
            AuthError::MissingCookie => "missing_session",
            AuthError::UnknownSession => "unknown_session",
            AuthError::Expired(_) => "session_expired",
            AuthError::Store(_) => "session_store",
        }
    }
}
