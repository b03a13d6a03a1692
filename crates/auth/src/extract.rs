use http::{HeaderMap, header::AUTHORIZATION};
use secrecy::SecretString;

use crate::error::AuthError;

const BEARER_TOKEN_LENGTH: usize = 6;

/// Find the caller's token: `Authorization: Bearer`, then `api-key`, then `x-api-key`.
///
/// The bearer scheme is matched case-insensitively. The first non-empty value wins.
pub fn extract_token(headers: &HeaderMap) -> Result<SecretString, AuthError> {
    [bearer(headers), header(headers, "api-key"), header(headers, "x-api-key")]
        .into_iter()
        .flatten()
        .find(|token| !token.is_empty())
        .map(SecretString::from)
        .ok_or(AuthError::MissingCredential)
}

fn bearer(headers: &HeaderMap) -> Option<String> {
    let value = headers.get(AUTHORIZATION)?.to_str().ok()?.trim();

    let scheme = value.get(..BEARER_TOKEN_LENGTH)?;
    let rest = value.get(BEARER_TOKEN_LENGTH..)?;

    if !scheme.eq_ignore_ascii_case("bearer") || !rest.starts_with(' ') {
        return None;
    }

    Some(rest.trim().to_string())
}

fn header(headers: &HeaderMap, name: &'static str) -> Option<String> {
    let value = headers.get(name)?.to_str().ok()?;
    Some(value.trim().to_string())
}
