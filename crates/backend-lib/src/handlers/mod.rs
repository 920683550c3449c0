// ============================
// crates/backend-lib/src/handlers/mod.rs
// ============================
//! HTTP handlers for the session REST surface.

pub mod sessions;

use crate::auth::Identity;
use crate::error::AppError;
use crate::AppState;
use axum::http::{header, HeaderMap};

/// Resolve the caller from the `Authorization: Bearer` header.
pub(crate) async fn authenticate(
    state: &AppState,
    headers: &HeaderMap,
) -> Result<Identity, AppError> {
    let token = headers
        .get(header::AUTHORIZATION)
        .and_then(|value| value.to_str().ok())
        .and_then(|value| value.strip_prefix("Bearer "))
        .ok_or_else(|| AppError::Unauthorized("missing bearer token".to_string()))?;
    state.identity.authenticate(token).await
}
