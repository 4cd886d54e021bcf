use axum::async_trait;
use axum::extract::{FromRef, FromRequestParts};
use axum::http::header::AUTHORIZATION;
use axum::http::request::Parts;
use base64::Engine;
use base64::engine::general_purpose::STANDARD;

use super::ApiError;
use crate::config::BasicAuthSettings;

/// HTTP Basic credentials that matched the configured ones. Holds the
/// username.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Authenticated(pub String);

/// Splits an `Authorization: Basic <base64(user:pass)>` header value.
pub fn parse_basic(header: &str) -> Option<(String, String)> {
    let (scheme, encoded) = header.trim().split_once(' ')?;
    if !scheme.eq_ignore_ascii_case("basic") {
        return None;
    }
    let decoded = STANDARD.decode(encoded.trim()).ok()?;
    let decoded = String::from_utf8(decoded).ok()?;
    let (username, password) = decoded.split_once(':')?;
    Some((username.to_string(), password.to_string()))
}

#[async_trait]
impl<S> FromRequestParts<S> for Authenticated
where
    BasicAuthSettings: FromRef<S>,
    S: Send + Sync,
{
    type Rejection = ApiError;

    async fn from_request_parts(parts: &mut Parts, state: &S) -> Result<Self, Self::Rejection> {
        let expected = BasicAuthSettings::from_ref(state);

        let header = parts
            .headers
            .get(AUTHORIZATION)
            .and_then(|value| value.to_str().ok())
            .ok_or(ApiError::NotAuthenticated)?;
        let (username, password) = parse_basic(header).ok_or(ApiError::NotAuthenticated)?;

        if username != expected.username || password != expected.password {
            return Err(ApiError::BadCredentials);
        }
        Ok(Authenticated(username))
    }
}
