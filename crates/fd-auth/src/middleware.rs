use std::sync::Arc;

use axum::{
    extract::{FromRequestParts, Request, State},
    http::{HeaderMap, StatusCode, request::Parts},
    middleware::Next,
    response::{IntoResponse, Json, Response},
};
use axum_extra::extract::CookieJar;
use serde_json::{Value, json};
use tracing::warn;

use crate::AuthService;
use crate::users::UserInfo;

pub const SESSION_COOKIE: &str = "fd_session";

type Rejection = (StatusCode, Json<Value>);

fn reject(status: StatusCode, error: &str) -> Rejection {
    (status, Json(json!({ "success": false, "error": error })))
}

/// The logged-in user, placed in the request extensions by [`require_auth`].
#[derive(Debug, Clone)]
pub struct AuthUser {
    pub user: UserInfo,
    pub session_id: String,
}

impl<S> FromRequestParts<S> for AuthUser
where
    S: Send + Sync,
{
    type Rejection = Rejection;

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self, Self::Rejection> {
        parts
            .extensions
            .get::<AuthUser>()
            .cloned()
            .ok_or_else(|| reject(StatusCode::UNAUTHORIZED, "Not authenticated"))
    }
}

/// Reject requests without a live session cookie.
pub async fn require_auth(
    State(auth): State<Arc<AuthService>>,
    mut request: Request,
    next: Next,
) -> Response {
    let jar = CookieJar::from_headers(request.headers());
    let Some(session_id) = jar.get(SESSION_COOKIE).map(|c| c.value().to_string()) else {
        return reject(StatusCode::UNAUTHORIZED, "Not authenticated").into_response();
    };

    let session = match auth.sessions.validate(&session_id) {
        Ok(Some(session)) => session,
        Ok(None) => return reject(StatusCode::UNAUTHORIZED, "Session expired").into_response(),
        Err(e) => {
            warn!("Session validation error: {e}");
            return reject(StatusCode::INTERNAL_SERVER_ERROR, "Session validation error")
                .into_response();
        }
    };

    let Some(user) = auth.users.get(&session.username) else {
        return reject(StatusCode::UNAUTHORIZED, "User not found").into_response();
    };

    request
        .extensions_mut()
        .insert(AuthUser { user, session_id });
    next.run(request).await
}

/// `Set-Cookie` value for a session. Marked `Secure` behind an HTTPS proxy.
pub fn session_cookie(session_id: &str, max_age_secs: Option<i64>, headers: &HeaderMap) -> String {
    let is_secure = headers
        .get("x-forwarded-proto")
        .and_then(|v| v.to_str().ok())
        .is_some_and(|proto| proto == "https");

    let mut parts = vec![
        format!("{SESSION_COOKIE}={session_id}"),
        "HttpOnly".to_string(),
        "SameSite=Lax".to_string(),
        "Path=/".to_string(),
    ];
    if is_secure {
        parts.push("Secure".to_string());
    }
    if let Some(age) = max_age_secs {
        parts.push(format!("Max-Age={age}"));
    }
    parts.join("; ")
}

pub fn clear_cookie(headers: &HeaderMap) -> String {
    session_cookie("deleted", Some(0), headers)
}
