//! Bearer-token authentication for the remote service.

use axum::{
    extract::Request,
    http::header,
    middleware::Next,
    response::{IntoResponse, Response},
};

use super::handlers::ApiError;
use crate::sync::protocol::IdToken;

/// Authenticated user info, added to request extensions after auth
#[derive(Debug, Clone, Copy)]
pub struct AuthUser {
    pub user_id: i64,
}

impl AuthUser {
    /// Rejects requests addressing another user's resources.
    pub fn authorize(&self, user_id: i64) -> Result<(), ApiError> {
        if self.user_id == user_id {
            Ok(())
        } else {
            Err(ApiError::Forbidden(user_id))
        }
    }
}

/// Authentication middleware
pub async fn auth_middleware(mut request: Request, next: Next) -> Response {
    let auth_header = request
        .headers()
        .get(header::AUTHORIZATION)
        .and_then(|h| h.to_str().ok());

    let token = match auth_header {
        Some(h) if h.starts_with("Bearer ") => &h[7..],
        Some(_) => {
            return ApiError::Unauthorized("Authorization header must use Bearer scheme")
                .into_response();
        }
        None => return ApiError::Unauthorized("Authorization header required").into_response(),
    };

    match IdToken::from_bearer(token) {
        Some(id) => {
            request.extensions_mut().insert(AuthUser {
                user_id: id.user_id,
            });
            next.run(request).await
        }
        None => ApiError::Unauthorized("Invalid ID token").into_response(),
    }
}
