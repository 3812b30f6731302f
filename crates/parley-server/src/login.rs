//! REST endpoints for the password-proof login and account session management.

use axum::extract::rejection::JsonRejection;
use axum::extract::State;
use axum::response::{IntoResponse, Response};
use axum::Json;
use axum_extra::extract::cookie::{Cookie, SameSite};
use axum_extra::extract::CookieJar;
use serde::{Deserialize, Serialize};
use tokio::time::Instant;
use tracing::debug;

use parley_auth::{AuthError, LoginProof};
use parley_store::SessionRow;

use crate::extract::{ApiError, Authenticated, SESSION_COOKIE, USER_COOKIE};
use crate::server::AppState;

#[derive(Debug, Deserialize)]
pub struct Step1Body {
    pub name: String,
}

#[derive(Debug, Deserialize)]
pub struct Step2Body {
    pub name: String,
    #[serde(rename = "A")]
    pub a: String,
    #[serde(rename = "B")]
    pub b: String,
    #[serde(rename = "M1")]
    pub m1: String,
}

#[derive(Debug, Deserialize)]
pub struct PasswordBody {
    pub s: String,
    pub v: String,
}

#[derive(Debug, Deserialize)]
pub struct SettingsBody {
    /// Default upstream key; `null` or blank clears it.
    #[serde(default)]
    pub api_key: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct SessionBody {
    pub session: String,
    pub user: String,
    #[serde(rename = "M2", skip_serializing_if = "Option::is_none")]
    pub m2: Option<String>,
}

/// `POST /api/login/step1`
pub async fn step1(State(state): State<AppState>, body: Result<Json<Step1Body>, JsonRejection>) -> Response {
    let arrived = Instant::now();
    let Json(body) = match body {
        Ok(body) => body,
        Err(rejection) => return paced_rejection(&state, arrived, rejection).await,
    };
    match state.broker.step1(&body.name).await {
        Ok(challenge) => Json(challenge).into_response(),
        Err(_) => ApiError::Unauthorized.into_response(),
    }
}

/// `POST /api/login/step2`
pub async fn step2(
    State(state): State<AppState>,
    jar: CookieJar,
    body: Result<Json<Step2Body>, JsonRejection>,
) -> Response {
    let arrived = Instant::now();
    let Json(body) = match body {
        Ok(body) => body,
        Err(rejection) => return paced_rejection(&state, arrived, rejection).await,
    };
    let proof = LoginProof {
        name: &body.name,
        a: &body.a,
        b: &body.b,
        m1: &body.m1,
    };
    match state.broker.step2(proof).await {
        Ok(success) => issue_session(&state, jar, &success.session, Some(success.m2)).into_response(),
        Err(_) => ApiError::Unauthorized.into_response(),
    }
}

/// `POST /api/logout`
pub async fn logout(
    State(state): State<AppState>,
    Authenticated(session): Authenticated,
    jar: CookieJar,
) -> Result<impl IntoResponse, ApiError> {
    state
        .sessions
        .invalidate(&session.id)
        .map_err(|e| ApiError::Internal(e.to_string()))?;
    let jar = jar
        .remove(Cookie::build(SESSION_COOKIE).path("/"))
        .remove(Cookie::build(USER_COOKIE).path("/"));
    Ok((jar, Json(serde_json::json!({ "ok": true }))))
}

/// `POST /api/user/password`
pub async fn change_password(
    State(state): State<AppState>,
    Authenticated(session): Authenticated,
    jar: CookieJar,
    Json(body): Json<PasswordBody>,
) -> Result<impl IntoResponse, ApiError> {
    let fresh = state
        .broker
        .change_password(&session.user_id, &body.s, &body.v)
        .map_err(|e| match e {
            AuthError::Store(store) => ApiError::Internal(store.to_string()),
            other => ApiError::BadRequest(other.to_string()),
        })?;
    Ok(issue_session(&state, jar, &fresh, None))
}

/// `POST /api/user/settings`
pub async fn update_settings(
    State(state): State<AppState>,
    Authenticated(session): Authenticated,
    Json(body): Json<SettingsBody>,
) -> Result<impl IntoResponse, ApiError> {
    state
        .users
        .set_default_api_key(&session.user_id, body.api_key.as_deref())
        .map_err(|e| ApiError::Internal(e.to_string()))?;
    Ok(Json(serde_json::json!({ "ok": true })))
}

async fn paced_rejection(state: &AppState, arrived: Instant, rejection: JsonRejection) -> Response {
    debug!(error = %rejection.body_text(), "unreadable login body");
    state.broker.pace(arrived).await;
    ApiError::Unauthorized.into_response()
}

fn issue_session(state: &AppState, jar: CookieJar, session: &SessionRow, m2: Option<String>) -> (CookieJar, Json<SessionBody>) {
    let jar = jar
        .add(session_cookie(state, SESSION_COOKIE, session.id.to_string()))
        .add(session_cookie(state, USER_COOKIE, session.user_id.to_string()));
    let body = SessionBody {
        session: session.id.to_string(),
        user: session.user_id.to_string(),
        m2,
    };
    (jar, Json(body))
}

fn session_cookie(state: &AppState, name: &'static str, value: String) -> Cookie<'static> {
    Cookie::build((name, value))
        .path("/")
        .http_only(true)
        .same_site(SameSite::Strict)
        .secure(state.secure_cookies)
        .permanent()
        .build()
}
