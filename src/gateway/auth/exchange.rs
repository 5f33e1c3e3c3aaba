//! External-identity exchange stage

use std::sync::Arc;

use axum::{
    Router,
    extract::{Request, State},
    http::StatusCode,
    middleware::{self, Next},
    response::Response,
};
use epoxy_core::GenerationalCache;
use serde::Deserialize;
use serde_json::Value;
use tracing::debug;

use super::{RequestIdentity, publish, reject};
use crate::gateway::middleware::Middleware;
use crate::jwk::{KeySetError, KeySetResolver};

const STAGE: &str = "exchange";

/// Exchange endpoint failures
#[derive(Debug, thiserror::Error)]
pub enum ExchangeError {
    /// Network error talking to the exchange endpoint
    #[error("exchange request failed: {0}")]
    Fetch(#[from] reqwest::Error),

    /// The exchange endpoint answered with something other than 200
    #[error("exchange returned status {0}")]
    BadStatus(reqwest::StatusCode),

    /// The response carried no token
    #[error("exchange response has no token")]
    EmptyToken,

    /// The exchanged token did not verify
    #[error(transparent)]
    KeySet(#[from] KeySetError),
}

#[derive(Deserialize)]
struct ExchangeResponse {
    #[serde(default)]
    token: String,
}

/// Swaps the verified edge assertion for an external identity token.
///
/// Runs after [`EdgeAccess`](super::EdgeAccess). Exchanged tokens are cached
/// by the raw edge assertion and re-verified on every request.
#[derive(Debug)]
pub struct Exchange {
    http: reqwest::Client,
    resolver: KeySetResolver,
    jwks_url: String,
    exchange_url: String,
    tokens: GenerationalCache,
}

impl Exchange {
    /// Create the stage with its own exchanged-token cache.
    #[must_use]
    pub fn new(
        http: reqwest::Client,
        resolver: KeySetResolver,
        jwks_url: impl Into<String>,
        exchange_url: impl Into<String>,
        tokens: GenerationalCache,
    ) -> Self {
        Self {
            http,
            resolver,
            jwks_url: jwks_url.into(),
            exchange_url: exchange_url.into(),
            tokens,
        }
    }

    /// Verified claims of the external token for `edge_token`.
    ///
    /// A cached token that no longer verifies is exchanged again once.
    pub async fn exchanged_claims(&self, edge_token: &str) -> Result<Value, ExchangeError> {
        if let Some(cached) = self.tokens.get(edge_token) {
            match self.resolver.resolve::<Value>(&self.jwks_url, &cached).await {
                Ok(data) => return Ok(data.claims),
                Err(e) => debug!(error = %e, "Cached exchanged token rejected, exchanging again"),
            }
        }

        let token = self.fetch_token(edge_token).await?;
        self.tokens.set(edge_token, token.as_str());
        let data = self.resolver.resolve::<Value>(&self.jwks_url, &token).await?;
        Ok(data.claims)
    }

    async fn fetch_token(&self, edge_token: &str) -> Result<String, ExchangeError> {
        let response = self
            .http
            .get(&self.exchange_url)
            .bearer_auth(edge_token)
            .send()
            .await?;
        if response.status() != reqwest::StatusCode::OK {
            return Err(ExchangeError::BadStatus(response.status()));
        }
        let body: ExchangeResponse = response.json().await?;
        if body.token.is_empty() {
            return Err(ExchangeError::EmptyToken);
        }
        Ok(body.token)
    }
}

impl Middleware for Exchange {
    fn name(&self) -> &'static str {
        STAGE
    }

    fn wrap(self: Arc<Self>, router: Router) -> Router {
        router.layer(middleware::from_fn_with_state(self, exchange))
    }
}

async fn exchange(State(stage): State<Arc<Exchange>>, mut request: Request, next: Next) -> Response {
    let edge_token = match RequestIdentity::of(request.extensions()).edge() {
        Ok(edge) => edge.token.clone(),
        Err(e) => return reject(STAGE, StatusCode::INTERNAL_SERVER_ERROR, &e),
    };

    let claims = match stage.exchanged_claims(&edge_token).await {
        Ok(claims) => claims,
        Err(e) => return reject(STAGE, StatusCode::UNAUTHORIZED, &e),
    };

    if let Err(e) = publish(request.extensions_mut(), |id| id.set_external(claims)) {
        return reject(STAGE, StatusCode::INTERNAL_SERVER_ERROR, &e);
    }
    next.run(request).await
}
