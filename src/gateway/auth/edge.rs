//! Edge-access assertion stage

use std::sync::Arc;

use axum::{
    Router,
    extract::{Request, State},
    http::{HeaderName, StatusCode},
    middleware::{self, Next},
    response::Response,
};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::Span;

use super::{publish, reject};
use crate::gateway::middleware::Middleware;
use crate::jwk::{KeySetResolver, audience_contains};
use crate::{Error, Result};

const STAGE: &str = "edge";

/// Claims the edge provider puts into its assertion
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct EdgeClaims {
    /// Authenticated user's email
    #[serde(default)]
    pub email: String,
    /// Audience, a string or a list of strings
    #[serde(default)]
    pub aud: Value,
    /// Identity type (e.g. `app`)
    #[serde(default, rename = "type")]
    pub kind: String,
    /// Nonce for looking up the full identity at the provider
    #[serde(default)]
    pub identity_nonce: String,
    /// Country the request came from
    #[serde(default)]
    pub country: String,
}

/// A verified edge-access assertion
#[derive(Debug, Clone)]
pub struct EdgeIdentity {
    /// The assertion exactly as presented
    pub token: String,
    /// Well-known claims
    pub claims: EdgeClaims,
    /// All claims, for claim-path lookups
    pub raw_claims: Value,
}

/// Requires a valid edge-provider assertion carrying the configured audience.
#[derive(Debug)]
pub struct EdgeAccess {
    resolver: KeySetResolver,
    jwks_url: String,
    audience: String,
    header: HeaderName,
}

impl EdgeAccess {
    /// Create the stage; `header` names the request header with the assertion.
    pub fn new(
        resolver: KeySetResolver,
        jwks_url: impl Into<String>,
        audience: impl Into<String>,
        header: &str,
    ) -> Result<Self> {
        let header = HeaderName::try_from(header)
            .map_err(|e| Error::config(format!("invalid edge assertion header '{header}': {e}")))?;
        Ok(Self {
            resolver,
            jwks_url: jwks_url.into(),
            audience: audience.into(),
            header,
        })
    }

    async fn verify(&self, token: &str) -> std::result::Result<EdgeIdentity, String> {
        let data = self
            .resolver
            .resolve::<Value>(&self.jwks_url, token)
            .await
            .map_err(|e| format!("error parsing edge assertion: {e}"))?;
        let claims: EdgeClaims = serde_json::from_value(data.claims.clone())
            .map_err(|e| format!("error decoding edge claims: {e}"))?;
        if !audience_contains(&claims.aud, &self.audience) {
            return Err("aud not matching configured audience".to_string());
        }
        Ok(EdgeIdentity {
            token: token.to_string(),
            claims,
            raw_claims: data.claims,
        })
    }
}

impl Middleware for EdgeAccess {
    fn name(&self) -> &'static str {
        STAGE
    }

    fn wrap(self: Arc<Self>, router: Router) -> Router {
        router.layer(middleware::from_fn_with_state(self, edge_access))
    }
}

async fn edge_access(
    State(stage): State<Arc<EdgeAccess>>,
    mut request: Request,
    next: Next,
) -> Response {
    // No credential means no key-set fetch.
    let token = request
        .headers()
        .get(&stage.header)
        .and_then(|v| v.to_str().ok())
        .filter(|t| !t.is_empty())
        .map(ToString::to_string);
    let Some(token) = token else {
        return reject(STAGE, StatusCode::UNAUTHORIZED, &"missing edge assertion");
    };

    let identity = match stage.verify(&token).await {
        Ok(identity) => identity,
        Err(e) => return reject(STAGE, StatusCode::UNAUTHORIZED, &e),
    };

    Span::current().record("email", identity.claims.email.as_str());
    if let Err(e) = publish(request.extensions_mut(), |id| id.set_edge(identity)) {
        return reject(STAGE, StatusCode::INTERNAL_SERVER_ERROR, &e);
    }
    next.run(request).await
}
