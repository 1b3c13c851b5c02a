use axum::{
    Json, Router,
    extract::State,
    http::{HeaderMap, StatusCode, header},
    routing::{get, post, put},
};
use axum_extra::extract::CookieJar;
use fd_auth::{AuthUser, SESSION_COOKIE, UserInfo, clear_cookie, session_cookie};
use serde::Deserialize;
use serde_json::{Value, json};
use tracing::info;

use crate::error::ApiError;
use crate::state::ApiState;

const REMEMBER_ME_MAX_AGE_SECS: i64 = 30 * 24 * 60 * 60;

/// Account routes reachable without a session.
pub fn router() -> Router<ApiState> {
    Router::new()
        .route("/users", post(signup))
        .route("/users/count", get(count))
        .route("/users/login", post(login))
        .route("/users/logout", post(logout))
}

/// Account routes for the logged-in user.
pub fn account_router() -> Router<ApiState> {
    Router::new()
        .route("/users/me", get(me))
        .route("/users/me/password", put(change_password))
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct Credentials {
    username: String,
    password: String,
    #[serde(default)]
    remember_me: bool,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ChangePasswordRequest {
    current_password: String,
    new_password: String,
}

type WithCookie = (StatusCode, [(header::HeaderName, String); 1], Json<Value>);

async fn count(State(state): State<ApiState>) -> Json<Value> {
    Json(json!({ "count": state.auth.users.count() }))
}

/// Create the first administrator account.
async fn signup(
    State(state): State<ApiState>,
    Json(body): Json<Credentials>,
) -> Result<(StatusCode, Json<Value>), ApiError> {
    let user = state
        .auth
        .users
        .signup(&body.username.to_lowercase(), &body.password)
        .await?;
    info!(username = %user.username, "Administrator account created");
    Ok((StatusCode::CREATED, Json(json!({ "success": true, "user": user }))))
}

async fn login(
    State(state): State<ApiState>,
    headers: HeaderMap,
    Json(body): Json<Credentials>,
) -> Result<WithCookie, ApiError> {
    let username = body.username.to_lowercase();
    if username.is_empty() || body.password.is_empty() {
        return Err(ApiError::BadRequest("Username and password are required".to_string()));
    }

    let user = state.auth.users.verify(&username, &body.password).await?;
    let user_agent = headers
        .get(header::USER_AGENT)
        .and_then(|v| v.to_str().ok());
    let (session_id, _) = state
        .auth
        .sessions
        .create(&username, user_agent, body.remember_me)?;

    // Without remember-me the cookie lives as long as the browser session.
    let max_age = body.remember_me.then_some(REMEMBER_ME_MAX_AGE_SECS);
    info!(username = %username, "User logged in");
    Ok((
        StatusCode::OK,
        [(header::SET_COOKIE, session_cookie(&session_id, max_age, &headers))],
        Json(json!({ "success": true, "user": user })),
    ))
}

async fn logout(
    State(state): State<ApiState>,
    headers: HeaderMap,
    jar: CookieJar,
) -> Result<WithCookie, ApiError> {
    if let Some(cookie) = jar.get(SESSION_COOKIE) {
        state.auth.sessions.delete(cookie.value())?;
    }
    Ok((
        StatusCode::OK,
        [(header::SET_COOKIE, clear_cookie(&headers))],
        Json(json!({ "success": true })),
    ))
}

async fn me(AuthUser { user, .. }: AuthUser) -> Json<UserInfo> {
    Json(user)
}

/// Change the password and end every other session of the user.
async fn change_password(
    State(state): State<ApiState>,
    AuthUser { user, session_id }: AuthUser,
    Json(body): Json<ChangePasswordRequest>,
) -> Result<Json<Value>, ApiError> {
    state
        .auth
        .users
        .change_password(&user.username, &body.current_password, &body.new_password)
        .await?;
    state.auth.sessions.delete_others(&user.username, &session_id)?;
    info!(username = %user.username, "Password changed");
    Ok(Json(json!({ "success": true })))
}
