use axum::extract::FromRequestParts;
use axum::http::request::Parts;
use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::Json;
use axum_extra::extract::CookieJar;
use tracing::{debug, error};

use parley_core::ids::{SessionId, UserId};
use parley_store::SessionRow;

use crate::server::AppState;

pub const SESSION_COOKIE: &str = "session";
pub const USER_COOKIE: &str = "user";
pub const SESSION_HEADER: &str = "x-session-id";
pub const USER_HEADER: &str = "x-user-id";

/// Error body for every REST route. Authentication failures never say why.
#[derive(Debug)]
pub enum ApiError {
    Unauthorized,
    BadRequest(String),
    Internal(String),
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, message) = match self {
            Self::Unauthorized => (StatusCode::UNAUTHORIZED, "authentication failed".to_string()),
            Self::BadRequest(detail) => (StatusCode::BAD_REQUEST, detail),
            Self::Internal(detail) => {
                error!(detail = %detail, "request failed");
                (StatusCode::INTERNAL_SERVER_ERROR, "internal error".to_string())
            }
        };
        (status, Json(serde_json::json!({ "error": message }))).into_response()
    }
}

/// The caller's validated session.
#[derive(Clone, Debug)]
pub struct Authenticated(pub SessionRow);

impl FromRequestParts<AppState> for Authenticated {
    type Rejection = ApiError;

    async fn from_request_parts(parts: &mut Parts, state: &AppState) -> Result<Self, Self::Rejection> {
        let jar = CookieJar::from_headers(&parts.headers);
        let Some((session_id, user_id)) = credentials(&jar, &parts.headers) else {
            debug!("request carried no session credentials");
            return Err(ApiError::Unauthorized);
        };
        state
            .sessions
            .validate(&session_id, &user_id)
            .map(Authenticated)
            .ok_or(ApiError::Unauthorized)
    }
}

/// Session and user ids from cookies, falling back to headers.
pub fn credentials(jar: &CookieJar, headers: &HeaderMap) -> Option<(SessionId, UserId)> {
    let from_cookies = jar
        .get(SESSION_COOKIE)
        .zip(jar.get(USER_COOKIE))
        .map(|(s, u)| (s.value().to_string(), u.value().to_string()));
    let from_headers = || {
        let session = headers.get(SESSION_HEADER)?.to_str().ok()?;
        let user = headers.get(USER_HEADER)?.to_str().ok()?;
        Some((session.to_string(), user.to_string()))
    };
    let (session, user) = from_cookies.or_else(from_headers)?;
    if session.is_empty() || user.is_empty() {
        return None;
    }
    Some((SessionId::from_raw(session), UserId::from_raw(user)))
}
