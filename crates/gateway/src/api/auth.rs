//! Cookie-session authentication.
//!
//! The auth collaborator issues the session cookie; we only verify it: the
//! cookie value is hashed and looked up in `auth_tokens`, which also bounds
//! its lifetime. Handlers take a [`CurrentUser`] extractor; the subdomain
//! proxy calls [`session_user`] directly.

use axum::extract::FromRequestParts;
use axum::http::request::Parts;
use axum::http::StatusCode;
use axum::response::Response;
use dd_domain::token::token_digest;
use dd_store::{Store, User};

use crate::api::error::api_error;
use crate::proxy::headers::cookie_value;
use crate::state::AppState;

/// Resolve a session-cookie value to its user.
pub async fn session_user(state: &AppState, cookie: &str) -> Option<User> {
    match state.store.user_by_session_digest(&token_digest(cookie)).await {
        Ok(user) => user,
        Err(e) => {
            tracing::error!(error = %e, "session lookup failed");
            None
        }
    }
}

/// The authenticated caller. Rejects with 401 JSON when the cookie is
/// missing, expired, or unknown.
pub struct CurrentUser(pub User);

#[axum::async_trait]
impl FromRequestParts<AppState> for CurrentUser {
    type Rejection = Response;

    async fn from_request_parts(
        parts: &mut Parts,
        state: &AppState,
    ) -> Result<Self, Self::Rejection> {
        let cookie = cookie_value(&parts.headers, &state.config.routing.session_cookie)
            .ok_or_else(|| api_error(StatusCode::UNAUTHORIZED, "missing session cookie"))?;
        let user = session_user(state, &cookie)
            .await
            .ok_or_else(|| api_error(StatusCode::UNAUTHORIZED, "invalid or expired session"))?;
        Ok(CurrentUser(user))
    }
}
