//! Bearer-token check for protected routes

use axum::{
    extract::{Request, State},
    http::header,
    middleware::Next,
    response::Response,
};
use std::sync::Arc;

use crate::error::ApiError;

/// Token protected routes must present
#[derive(Clone)]
pub struct ApiToken(Arc<str>);

impl ApiToken {
    pub fn new(token: impl Into<String>) -> Self {
        Self(Arc::from(token.into()))
    }
}

impl std::fmt::Debug for ApiToken {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("ApiToken(***)")
    }
}

fn bearer(request: &Request) -> Option<&str> {
    request
        .headers()
        .get(header::AUTHORIZATION)?
        .to_str()
        .ok()?
        .strip_prefix("Bearer ")
        .map(str::trim)
}

/// Missing or malformed credentials are 401; a wrong token is 403
pub async fn require_bearer(
    State(token): State<ApiToken>,
    request: Request,
    next: Next,
) -> Result<Response, ApiError> {
    let Some(presented) = bearer(&request) else {
        return Err(ApiError::Unauthorized(
            "Missing bearer token".to_string(),
        ));
    };

    if presented != &*token.0 {
        tracing::warn!(path = %request.uri().path(), "Rejected refresh request with a wrong token");
        return Err(ApiError::Forbidden("Invalid token".to_string()));
    }

    Ok(next.run(request).await)
}
