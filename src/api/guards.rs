use async_trait::async_trait;
use axum::extract::FromRequestParts;
use axum::http::{header, request::Parts};

use crate::api::errors::ApiError;
use crate::core::state::AppState;
use crate::services::workspace::owner_fingerprint;

/// Fingerprint of the caller's bearer token, if one was sent. Sessions created with a
/// token are only visible to requests carrying the same token.
#[derive(Debug, Clone, Default)]
pub(crate) struct SessionOwner(pub(crate) Option<String>);

impl SessionOwner {
    pub(crate) fn fingerprint(&self) -> Option<&str> {
        self.0.as_deref()
    }
}

#[async_trait]
impl FromRequestParts<AppState> for SessionOwner {
    type Rejection = ApiError;

    async fn from_request_parts(
        parts: &mut Parts,
        _state: &AppState,
    ) -> Result<Self, Self::Rejection> {
        let Some(value) = parts.headers.get(header::AUTHORIZATION) else {
            return Ok(SessionOwner(None));
        };

        let token = value
            .to_str()
            .ok()
            .and_then(|value| value.strip_prefix("Bearer "))
            .map(str::trim)
            .filter(|token| !token.is_empty())
            .ok_or(ApiError::Unauthorized("Invalid authentication credentials"))?;

        Ok(SessionOwner(Some(owner_fingerprint(token))))
    }
}
