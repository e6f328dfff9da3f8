use axum::{extract::FromRequestParts, http::request::Parts, http::HeaderMap};
use flowrun_core::tenant::TenantId;

use crate::api::ApiError;

pub const TENANT_HEADER: &str = "X-Tenant-Id";

/// Read the tenant id from the request headers
pub fn tenant_from_headers(headers: &HeaderMap) -> Option<TenantId> {
    let value = headers.get(TENANT_HEADER)?.to_str().ok()?.trim();
    if value.is_empty() {
        None
    } else {
        Some(TenantId::new(value))
    }
}

/// Extractor for the calling tenant. Requests without the header are rejected
/// with 400; whether the tenant exists is left to the controller.
pub struct TenantHeader(pub TenantId);

impl<S> FromRequestParts<S> for TenantHeader
where
    S: Send + Sync,
{
    type Rejection = ApiError;

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self, Self::Rejection> {
        tenant_from_headers(&parts.headers)
            .map(TenantHeader)
            .ok_or_else(|| ApiError::bad_request(format!("missing {} header", TENANT_HEADER)))
    }
}
