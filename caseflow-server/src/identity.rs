//! Caller identity from trusted upstream headers.
//!
//! Authentication happens in front of this service; the gateway forwards
//! `x-user-id` and `x-user-role` and we take them at face value.

use axum::{async_trait, extract::FromRequestParts, http::request::Parts};
use caseflow_core::{Caller, Role};
use uuid::Uuid;

use crate::error::AppError;

pub const USER_ID_HEADER: &str = "x-user-id";
pub const USER_ROLE_HEADER: &str = "x-user-role";

/// Extractor wrapper so handlers can take `Identity(caller)`.
#[derive(Debug, Clone)]
pub struct Identity(pub Caller);

#[async_trait]
impl<S> FromRequestParts<S> for Identity
where
    S: Send + Sync,
{
    type Rejection = AppError;

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self, Self::Rejection> {
        let user_id: Uuid = header(parts, USER_ID_HEADER)?
            .parse()
            .map_err(|_| AppError::Unauthorized(format!("malformed {USER_ID_HEADER}")))?;
        let role: Role = header(parts, USER_ROLE_HEADER)?
            .to_ascii_lowercase()
            .parse()
            .map_err(AppError::Unauthorized)?;

        Ok(Identity(Caller::new(user_id, role)))
    }
}

fn header<'a>(parts: &'a Parts, name: &str) -> Result<&'a str, AppError> {
    parts
        .headers
        .get(name)
        .and_then(|v| v.to_str().ok())
        .map(str::trim)
        .filter(|v| !v.is_empty())
        .ok_or_else(|| AppError::Unauthorized(format!("missing {name} header")))
}
