use http::{header::AUTHORIZATION, HeaderMap};
use jsonwebtoken::{decode, decode_header, Algorithm, DecodingKey, Validation};
use thiserror::Error;

use crate::TokenClaims;

#[derive(Debug, Error)]
pub enum AuthError {
    #[error("missing authorization header")]
    MissingAuthHeader,

    #[error("missing bearer token")]
    MissingBearer,

    #[error("invalid token")]
    InvalidToken,

    #[error("unexpected signing method, expecting RS256 but found: {0}")]
    UnexpectedSigningMethod(String),

    #[error("upboundID is missing")]
    UpboundIdMissing,

    #[error(transparent)]
    Jwt(#[from] jsonwebtoken::errors::Error),
}

/// Extracts and verifies the bearer token carried by `headers`.
///
/// Only RS256 signatures are accepted. The algorithm header is checked before
/// the verification key is consulted, so a token signed with an HMAC scheme
/// keyed with the public key bytes is rejected by name rather than verified.
pub fn review_token(headers: &HeaderMap, key: &DecodingKey) -> Result<TokenClaims, AuthError> {
    let auth = headers
        .get(AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .map(str::trim)
        .unwrap_or_default();
    if auth.is_empty() {
        return Err(AuthError::MissingAuthHeader);
    }

    let token = match auth.split_once(' ') {
        Some((scheme, token)) if scheme.eq_ignore_ascii_case("bearer") => token.trim(),
        _ => return Err(AuthError::MissingBearer),
    };
    if token.is_empty() {
        return Err(AuthError::MissingBearer);
    }

    let header = decode_header(token).map_err(|_| AuthError::InvalidToken)?;
    if header.alg != Algorithm::RS256 {
        return Err(AuthError::UnexpectedSigningMethod(format!("{:?}", header.alg)));
    }

    let mut validation = Validation::new(Algorithm::RS256);
    // The audience is compared against the configured control-plane id by the
    // router, which reports a more specific error than the library would.
    validation.validate_aud = false;

    let data = decode::<TokenClaims>(token, key, &validation)?;
    Ok(data.claims)
}
