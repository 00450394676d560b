// Connection identity from request headers.
// The session comes from `x-session-id`, falling back to the `courier_session`
// cookie; `x-user-id` is optional and marks the caller as authenticated.
use crate::api::error::{ApiError, api_unauthorized};
use axum::http::HeaderMap;
use axum::http::header::COOKIE;
use courier_stream::Identity;

pub const USER_HEADER: &str = "x-user-id";
pub const SESSION_HEADER: &str = "x-session-id";
pub const SESSION_COOKIE: &str = "courier_session";

fn header_value<'a>(headers: &'a HeaderMap, name: &str) -> Option<&'a str> {
    headers
        .get(name)
        .and_then(|value| value.to_str().ok())
        .map(str::trim)
        .filter(|value| !value.is_empty())
}

fn session_cookie(headers: &HeaderMap) -> Option<&str> {
    headers
        .get_all(COOKIE)
        .iter()
        .filter_map(|value| value.to_str().ok())
        .flat_map(|cookies| cookies.split(';'))
        .filter_map(|pair| pair.trim().split_once('='))
        .find(|(name, _)| *name == SESSION_COOKIE)
        .map(|(_, value)| value.trim())
        .filter(|value| !value.is_empty())
}

pub fn identity_from_headers(headers: &HeaderMap) -> Result<Identity, ApiError> {
    let session = header_value(headers, SESSION_HEADER)
        .or_else(|| session_cookie(headers))
        .ok_or_else(|| api_unauthorized("missing session"))?;
    let user = header_value(headers, USER_HEADER).map(str::to_string);
    Ok(Identity::new(user, session))
}
