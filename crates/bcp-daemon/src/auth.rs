//! Credential resolution: bearer token or session cookie → `ActorContext`.
//!
//! Authentication only; authorization happens per-handler through
//! `bcp_authz::authorize` once the target org is known.

use std::sync::Arc;

use axum::extract::FromRequestParts;
use axum::http::{header, request::Parts};

use bcp_authz::{ActorContext, AuthzError};

use crate::api_types::ApiError;
use crate::state::AppState;

const SESSION_COOKIE: &str = "bcp_session";

/// Extractor: resolves the request's credentials against the configured
/// token table. Missing or unknown credentials reject with 401 before the
/// handler body runs.
pub struct Authenticated(pub ActorContext);

#[axum::async_trait]
impl FromRequestParts<Arc<AppState>> for Authenticated {
    type Rejection = ApiError;

    async fn from_request_parts(
        parts: &mut Parts,
        state: &Arc<AppState>,
    ) -> Result<Self, Self::Rejection> {
        let token = bearer_token(parts).or_else(|| session_cookie(parts));

        let Some(token) = token else {
            return Err(ApiError::Authz(AuthzError::Unauthorized));
        };

        match state.sessions.get(&token) {
            Some(actor) => Ok(Authenticated(actor.clone())),
            None => Err(ApiError::Authz(AuthzError::Unauthorized)),
        }
    }
}

fn bearer_token(parts: &Parts) -> Option<String> {
    let value = parts.headers.get(header::AUTHORIZATION)?.to_str().ok()?;
    value
        .strip_prefix("Bearer ")
        .map(|t| t.trim().to_string())
        .filter(|t| !t.is_empty())
}

fn session_cookie(parts: &Parts) -> Option<String> {
    let value = parts.headers.get(header::COOKIE)?.to_str().ok()?;
    value.split(';').find_map(|pair| {
        let (name, token) = pair.trim().split_once('=')?;
        (name == SESSION_COOKIE && !token.is_empty()).then(|| token.to_string())
    })
}
