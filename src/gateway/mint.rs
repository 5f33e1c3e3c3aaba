//! Epoxy token minting
//!
//! Turns the identity published by an earlier stage into a short-lived ES256
//! assertion and attaches it to the proxied request as `Epoxy-Token`.

use std::sync::Arc;

use axum::{
    Router,
    extract::{Request, State},
    http::{HeaderName, HeaderValue, StatusCode},
    middleware::{self, Next},
    response::Response,
};
use chrono::Utc;
use jsonwebtoken::{Algorithm, EncodingKey, Header};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::Span;

use super::auth::{IdentityError, RequestIdentity, reject};
use super::middleware::Middleware;

const STAGE: &str = "mint";

/// Header carrying the minted assertion to the upstream
pub const EPOXY_TOKEN: HeaderName = HeaderName::from_static("epoxy-token");

/// Issuer of every minted assertion
pub const ISSUER: &str = "epoxy";

/// Lifetime of a minted assertion in seconds
pub const TOKEN_TTL_SECS: i64 = 60;

/// Claims of a minted assertion
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EpoxyClaims {
    /// Always [`ISSUER`]
    pub iss: String,
    /// Verified subject
    pub sub: String,
    /// Issued at (unix seconds)
    pub iat: i64,
    /// Expiry (unix seconds)
    pub exp: i64,
    /// Claims of the exchanged external token, when one was used
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ext_claims: Option<Value>,
}

/// How the subject is derived from the request identity
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SubjectPolicy {
    /// Dot path into the exchanged claims, or the edge claims when no
    /// exchange ran
    ClaimPath(String),
    /// Session email or basic-auth username, which must end with this suffix
    /// and have a non-blank local part
    AllowedSuffix(String),
}

/// Minting failures; every one fails the request with 401
#[derive(Debug, thiserror::Error)]
pub enum MintError {
    /// No identity the policy can use was published
    #[error(transparent)]
    Identity(#[from] IdentityError),

    /// The claim path did not lead to a non-blank string
    #[error("couldn't find string with path '{0}'")]
    SubjectNotFound(String),

    /// The username does not carry the allowed suffix
    #[error("username not allowed")]
    SuffixNotAllowed,

    /// Signing failed
    #[error("signing failed: {0}")]
    Sign(#[from] jsonwebtoken::errors::Error),

    /// The signed token is not a valid header value
    #[error("minted token is not a valid header value")]
    InvalidHeader,
}

/// Signs per-request assertions for the upstream.
pub struct TokenMinter {
    key: EncodingKey,
    policy: SubjectPolicy,
}

impl TokenMinter {
    /// Create a minter signing with `key` (ES256).
    #[must_use]
    pub fn new(key: EncodingKey, policy: SubjectPolicy) -> Self {
        Self { key, policy }
    }

    /// Build the claims for `identity` under this minter's policy.
    pub fn claims(&self, identity: &RequestIdentity) -> Result<EpoxyClaims, MintError> {
        let (sub, ext_claims) = match &self.policy {
            SubjectPolicy::ClaimPath(path) => {
                let external = identity.external_claims().ok();
                let claims = match external {
                    Some(claims) => claims,
                    None => &identity.edge()?.raw_claims,
                };
                let sub = epoxy_core::claims::lookup_str(claims, path)
                    .ok_or_else(|| MintError::SubjectNotFound(path.clone()))?;
                (sub.to_string(), external.cloned())
            }
            SubjectPolicy::AllowedSuffix(suffix) => {
                let username = identity
                    .session_email()
                    .or_else(|_| identity.basic_username())?;
                if !suffix_allowed(username, suffix) {
                    return Err(MintError::SuffixNotAllowed);
                }
                (username.to_string(), None)
            }
        };

        let iat = Utc::now().timestamp();
        Ok(EpoxyClaims {
            iss: ISSUER.to_string(),
            sub,
            iat,
            exp: iat + TOKEN_TTL_SECS,
            ext_claims,
        })
    }

    /// Sign claims for `identity`.
    pub fn mint(&self, identity: &RequestIdentity) -> Result<(String, EpoxyClaims), MintError> {
        let claims = self.claims(identity)?;
        let token = jsonwebtoken::encode(&Header::new(Algorithm::ES256), &claims, &self.key)?;
        Ok((token, claims))
    }
}

/// `username` ends with `suffix` and something other than whitespace
/// precedes it.
#[must_use]
pub fn suffix_allowed(username: &str, suffix: &str) -> bool {
    username
        .strip_suffix(suffix)
        .is_some_and(|local| !local.trim().is_empty())
}

impl std::fmt::Debug for TokenMinter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TokenMinter")
            .field("policy", &self.policy)
            .finish_non_exhaustive()
    }
}

impl Middleware for TokenMinter {
    fn name(&self) -> &'static str {
        STAGE
    }

    fn wrap(self: Arc<Self>, router: Router) -> Router {
        router.layer(middleware::from_fn_with_state(self, mint_token))
    }
}

async fn mint_token(State(minter): State<Arc<TokenMinter>>, mut request: Request, next: Next) -> Response {
    let minted = minter
        .mint(RequestIdentity::of(request.extensions()))
        .and_then(|(token, claims)| {
            HeaderValue::from_str(&token)
                .map(|value| (value, claims))
                .map_err(|_| MintError::InvalidHeader)
        });
    let (value, claims) = match minted {
        Ok(minted) => minted,
        Err(e) => return reject(STAGE, StatusCode::UNAUTHORIZED, &e),
    };

    Span::current().record("subject", claims.sub.as_str());
    request.headers_mut().insert(EPOXY_TOKEN, value);
    next.run(request).await
}

/// Removes any `Epoxy-Token` the client sent.
///
/// Wrapped outside every identity stage, so the only token an upstream can
/// see is one minted for this request.
#[derive(Debug, Clone, Copy, Default)]
pub struct DropInboundToken;

impl Middleware for DropInboundToken {
    fn name(&self) -> &'static str {
        "drop-inbound-token"
    }

    fn wrap(self: Arc<Self>, router: Router) -> Router {
        router.layer(middleware::map_request(drop_inbound_token))
    }
}

async fn drop_inbound_token(mut request: Request) -> Request {
    request.headers_mut().remove(EPOXY_TOKEN);
    request
}
