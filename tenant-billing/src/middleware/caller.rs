//! Caller context extracted from request headers.
//!
//! The upstream gateway authenticates the user and resolves their
//! organization and role. It forwards them as `X-Org-ID`, `X-User-ID` and
//! `X-Role`. Billing endpoints trust these headers only behind that gateway.

use crate::services::Role;
use axum::async_trait;
use axum::extract::FromRequestParts;
use axum::http::request::Parts;
use service_core::error::AppError;
use uuid::Uuid;

pub const ORG_ID_HEADER: &str = "X-Org-ID";
pub const USER_ID_HEADER: &str = "X-User-ID";
pub const ROLE_HEADER: &str = "X-Role";

#[derive(Debug, Clone)]
pub struct CallerContext {
    pub organization_id: Uuid,
    pub user_id: Option<String>,
    pub role: Role,
}

fn header<'a>(parts: &'a Parts, name: &str) -> Option<&'a str> {
    parts.headers.get(name).and_then(|v| v.to_str().ok())
}

#[async_trait]
impl<S> FromRequestParts<S> for CallerContext
where
    S: Send + Sync,
{
    type Rejection = AppError;

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self, Self::Rejection> {
        let org_id = header(parts, ORG_ID_HEADER).ok_or_else(|| {
            AppError::AuthError(anyhow::anyhow!("Missing X-Org-ID header (required from gateway)"))
        })?;
        let organization_id = Uuid::parse_str(org_id)
            .map_err(|_| AppError::BadRequest(anyhow::anyhow!("X-Org-ID is not a valid id")))?;

        let role = header(parts, ROLE_HEADER)
            .and_then(Role::from_string)
            .ok_or_else(|| {
                AppError::AuthError(anyhow::anyhow!("Missing or unknown X-Role header"))
            })?;

        let user_id = header(parts, USER_ID_HEADER).map(str::to_string);

        let span = tracing::Span::current();
        span.record("org_id", org_id);
        span.record("role", role.as_str());
        if let Some(ref uid) = user_id {
            span.record("user_id", uid.as_str());
        }

        Ok(CallerContext {
            organization_id,
            user_id,
            role,
        })
    }
}
