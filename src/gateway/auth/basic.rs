//! HTTP Basic authentication stage

use std::sync::Arc;

use axum::{
    Router,
    extract::{Request, State},
    http::{HeaderMap, StatusCode, header},
    middleware::{self, Next},
    response::{IntoResponse, Response},
};
use base64::{Engine, engine::general_purpose::STANDARD};
use sha2::{Digest, Sha256};
use subtle::ConstantTimeEq;
use tracing::Span;

use super::{publish, record_failure, reject};
use crate::gateway::middleware::Middleware;

const STAGE: &str = "basic";

/// Accepts any username with the shared password.
///
/// Username policy is left to the minter's suffix check.
pub struct BasicAuth {
    password_digest: Vec<u8>,
}

impl BasicAuth {
    /// Create the stage for the shared `password`.
    #[must_use]
    pub fn new(password: &str) -> Self {
        Self {
            password_digest: digest(password),
        }
    }

    /// Constant-time password check.
    ///
    /// Both sides are hashed first so the comparison covers equal-length
    /// inputs regardless of what the client sent.
    #[must_use]
    pub fn password_matches(&self, candidate: &str) -> bool {
        digest(candidate).as_slice().ct_eq(self.password_digest.as_slice()).into()
    }
}

impl std::fmt::Debug for BasicAuth {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BasicAuth").finish_non_exhaustive()
    }
}

impl Middleware for BasicAuth {
    fn name(&self) -> &'static str {
        STAGE
    }

    fn wrap(self: Arc<Self>, router: Router) -> Router {
        router.layer(middleware::from_fn_with_state(self, basic_auth))
    }
}

async fn basic_auth(State(stage): State<Arc<BasicAuth>>, mut request: Request, next: Next) -> Response {
    let Some((username, password)) = parse_basic(request.headers()) else {
        record_failure(STAGE, &"couldn't parse Authorization header");
        return challenge();
    };
    if !stage.password_matches(&password) {
        record_failure(STAGE, &"wrong password");
        return challenge();
    }

    Span::current().record("basic_auth_username", username.as_str());
    if let Err(e) = publish(request.extensions_mut(), |id| id.set_basic_username(username)) {
        return reject(STAGE, StatusCode::INTERNAL_SERVER_ERROR, &e);
    }
    next.run(request).await
}

fn challenge() -> Response {
    (StatusCode::UNAUTHORIZED, [(header::WWW_AUTHENTICATE, "Basic")]).into_response()
}

fn digest(value: &str) -> Vec<u8> {
    let mut hasher = Sha256::new();
    hasher.update(value.as_bytes());
    hasher.finalize().to_vec()
}

/// Decode `Authorization: Basic <base64(user:pass)>`.
fn parse_basic(headers: &HeaderMap) -> Option<(String, String)> {
    let value = headers.get(header::AUTHORIZATION)?.to_str().ok()?;
    let (scheme, encoded) = value.split_once(' ')?;
    if !scheme.eq_ignore_ascii_case("basic") {
        return None;
    }
    let decoded = STANDARD.decode(encoded.trim()).ok()?;
    let decoded = String::from_utf8(decoded).ok()?;
    let (username, password) = decoded.split_once(':')?;
    Some((username.to_string(), password.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::HeaderValue;

    fn auth_header(raw: &str) -> HeaderMap {
        let mut headers = HeaderMap::new();
        headers.insert(header::AUTHORIZATION, HeaderValue::from_str(raw).unwrap());
        headers
    }

    #[test]
    fn parses_valid_credentials() {
        // "alice@example.com:s3cret:with:colons"
        let encoded = STANDARD.encode("alice@example.com:s3cret:with:colons");
        let parsed = parse_basic(&auth_header(&format!("Basic {encoded}")));
        assert_eq!(
            parsed,
            Some(("alice@example.com".to_string(), "s3cret:with:colons".to_string()))
        );
    }

    #[test]
    fn scheme_is_case_insensitive() {
        let encoded = STANDARD.encode("bob:pw");
        assert!(parse_basic(&auth_header(&format!("basic {encoded}"))).is_some());
    }

    #[test]
    fn rejects_malformed_headers() {
        assert_eq!(parse_basic(&HeaderMap::new()), None);
        assert_eq!(parse_basic(&auth_header("Bearer abc")), None);
        assert_eq!(parse_basic(&auth_header("Basic !!!not-base64")), None);
        let no_colon = STANDARD.encode("justauser");
        assert_eq!(parse_basic(&auth_header(&format!("Basic {no_colon}"))), None);
    }

    #[test]
    fn password_check() {
        let stage = BasicAuth::new("hunter2");
        assert!(stage.password_matches("hunter2"));
        assert!(!stage.password_matches("hunter3"));
        assert!(!stage.password_matches(""));
        assert!(!stage.password_matches("hunter2 "));
    }

    #[test]
    fn debug_hides_secret() {
        let stage = BasicAuth::new("hunter2");
        assert!(!format!("{stage:?}").contains("hunter2"));
    }
}
