//! Shared fixtures for the integration tests
//!
//! Every test gets fresh P-256 keys; nothing is read from disk.

#![allow(dead_code)]

use std::sync::Arc;

use axum::{
    Router,
    body::{Body, to_bytes},
    http::{Request, Response},
};
use base64::{Engine, engine::general_purpose::URL_SAFE_NO_PAD};
use epoxy::config::RouteConfig;
use epoxy::gateway::{EPOXY_TOKEN, Epoxy, Middleware, Route, upstream_client};
use jsonwebtoken::{Algorithm, DecodingKey, EncodingKey, Header, Validation};
use serde_json::{Value, json};
use tower::ServiceExt;
use wiremock::MockServer;

/// An ES256 key pair with its JWK form
pub struct TestKey {
    pub kid: String,
    pub encoding: EncodingKey,
    pub decoding: DecodingKey,
    pub private_pem: String,
    pub public_pem: String,
    pub jwk: Value,
}

impl TestKey {
    pub fn generate(kid: &str) -> Self {
        let pair = rcgen::KeyPair::generate().unwrap();
        let private_pem = pair.serialize_pem();
        let public_pem = pair.public_key_pem();

        // Uncompressed SEC1 point: 0x04 || x || y
        let raw = pair.public_key_raw();
        let jwk = json!({
            "kty": "EC",
            "crv": "P-256",
            "use": "sig",
            "alg": "ES256",
            "kid": kid,
            "x": URL_SAFE_NO_PAD.encode(&raw[1..33]),
            "y": URL_SAFE_NO_PAD.encode(&raw[33..65]),
        });

        Self {
            kid: kid.to_string(),
            encoding: EncodingKey::from_ec_pem(private_pem.as_bytes()).unwrap(),
            decoding: DecodingKey::from_ec_pem(public_pem.as_bytes()).unwrap(),
            private_pem,
            public_pem,
            jwk,
        }
    }

    /// Sign `claims` with this key, `kid` in the header.
    pub fn sign(&self, claims: &Value) -> String {
        let mut header = Header::new(Algorithm::ES256);
        header.kid = Some(self.kid.clone());
        jsonwebtoken::encode(&header, claims, &self.encoding).unwrap()
    }
}

/// A key-set document holding `keys`
pub fn jwks(keys: &[&TestKey]) -> Value {
    json!({ "keys": keys.iter().map(|k| k.jwk.clone()).collect::<Vec<_>>() })
}

pub fn now() -> i64 {
    chrono::Utc::now().timestamp()
}

/// Route `prefix` to the mock `upstream`.
pub fn route_to(upstream: &MockServer, prefix: &str, strip: bool) -> Route {
    Route::from_config(&RouteConfig {
        prefix: prefix.to_string(),
        target: upstream.uri(),
        strip,
        rewrite_host: false,
    })
    .unwrap()
}

pub fn proxy_client() -> reqwest::Client {
    upstream_client(std::time::Duration::from_secs(5)).unwrap()
}

/// The shared router for `routes`, wrapped by `chain` (innermost first).
pub fn gateway(routes: &[Route], chain: &[Arc<dyn Middleware>]) -> Router {
    Epoxy::new(None, routes, &proxy_client())
        .unwrap()
        .with_middlewares(chain)
        .into_router()
}

pub async fn send(router: &Router, request: Request<Body>) -> Response<Body> {
    router.clone().oneshot(request).await.unwrap()
}

pub async fn body_string(response: Response<Body>) -> String {
    let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
    String::from_utf8(bytes.to_vec()).unwrap()
}

/// Claims of the `Epoxy-Token` the upstream saw on its `index`-th request.
pub async fn minted_claims(upstream: &MockServer, index: usize, key: &TestKey) -> Value {
    let requests = upstream.received_requests().await.unwrap();
    let token = requests[index]
        .headers
        .get(EPOXY_TOKEN.as_str())
        .expect("upstream request carries an Epoxy-Token")
        .to_str()
        .unwrap()
        .to_string();

    let mut validation = Validation::new(Algorithm::ES256);
    validation.set_issuer(&["epoxy"]);
    jsonwebtoken::decode::<Value>(&token, &key.decoding, &validation)
        .unwrap()
        .claims
}
