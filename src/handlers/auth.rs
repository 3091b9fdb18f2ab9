//! Caller identity as asserted by the trusted upstream gateway.
//!
//! The service performs no authentication of its own: whatever the gateway
//! puts in `x-user-id` and `x-user-role` is the principal.

use axum::{
    extract::FromRequestParts,
    http::{HeaderMap, StatusCode, request::Parts},
};

use crate::{errors::AppError, models::access::Principal};

pub const USER_ID_HEADER: &str = "x-user-id";
pub const USER_ROLE_HEADER: &str = "x-user-role";

/// Extractor for the requesting principal. Rejects with 401 when either
/// header is missing or blank.
#[derive(Debug, Clone)]
pub struct Identity(pub Principal);

fn header<'a>(headers: &'a HeaderMap, name: &str) -> Option<&'a str> {
    headers
        .get(name)
        .and_then(|v| v.to_str().ok())
        .map(str::trim)
        .filter(|v| !v.is_empty())
}

impl<S> FromRequestParts<S> for Identity
where
    S: Send + Sync,
{
    type Rejection = AppError;

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self, Self::Rejection> {
        match (
            header(&parts.headers, USER_ID_HEADER),
            header(&parts.headers, USER_ROLE_HEADER),
        ) {
            (Some(id), Some(role)) => Ok(Identity(Principal::new(id, role))),
            _ => Err(AppError::new(
                StatusCode::UNAUTHORIZED,
                "missing caller identity",
            )),
        }
    }
}
