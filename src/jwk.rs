//! Key-set resolution and bearer-token verification.
//!
//! # Verification flow
//!
//! 1. Look up the key-set document in the shared [`GenerationalCache`] under
//!    the current clock hour (and the key-set URL).
//! 2. On a miss, `GET` the key-set URL, require `200`, cache the raw body.
//! 3. Decode the token header (no verification) to pick the key by `kid`.
//! 4. Verify the signature and `exp`/`nbf` with the header's algorithm; only
//!    asymmetric algorithms are accepted.
//! 5. Return the decoded claims. Audience is left to the caller.
//!
//! Within a clock hour at most one fetch per URL happens, so an upstream key
//! rotation is picked up at the next hour boundary at the latest.

use epoxy_core::GenerationalCache;
use jsonwebtoken::{
    Algorithm, DecodingKey, TokenData, Validation,
    jwk::{Jwk, JwkSet},
};
use reqwest::StatusCode;
use serde::de::DeserializeOwned;
use tracing::debug;

/// Key-set resolution failures
#[derive(Debug, thiserror::Error)]
pub enum KeySetError {
    /// Network error while fetching the key set
    #[error("key set fetch error: {0}")]
    Fetch(#[from] reqwest::Error),

    /// The key-set URL answered with something other than 200
    #[error("key set fetch returned status {0}")]
    BadStatus(StatusCode),

    /// The key-set document is not a JSON key set
    #[error("key set parse error: {0}")]
    Parse(#[from] serde_json::Error),

    /// Signature, expiry or claim decoding failed
    #[error("token verification failed: {0}")]
    Token(#[from] jsonwebtoken::errors::Error),

    /// The token header carries no `kid` and the key set has several keys
    #[error("token header missing 'kid'")]
    MissingKeyId,

    /// The `kid` is not in the key set
    #[error("unknown key id: {0}")]
    UnknownKeyId(String),

    /// Symmetric or otherwise unexpected signing algorithm
    #[error("unexpected signing algorithm: {0:?}")]
    UnexpectedAlgorithm(Algorithm),
}

/// Fetches key sets through a shared cache and verifies tokens against them.
#[derive(Debug, Clone)]
pub struct KeySetResolver {
    http: reqwest::Client,
    cache: GenerationalCache,
}

impl KeySetResolver {
    /// Create a resolver using `cache` for key-set documents only.
    #[must_use]
    pub fn new(http: reqwest::Client, cache: GenerationalCache) -> Self {
        Self { http, cache }
    }

    /// Verify `token` against the key set published at `url` and decode its
    /// claims into `C`.
    ///
    /// Never returns a partially validated token.
    ///
    /// # Errors
    ///
    /// Returns [`KeySetError`] if the key set cannot be fetched or parsed,
    /// the key cannot be found, the algorithm is unexpected, or the token
    /// fails verification.
    pub async fn resolve<C: DeserializeOwned>(
        &self,
        url: &str,
        token: &str,
    ) -> Result<TokenData<C>, KeySetError> {
        let header = jsonwebtoken::decode_header(token)?;
        check_algorithm(header.alg)?;

        let jwks = self.key_set(url).await?;
        let jwk = select_key(&jwks, header.kid.as_deref())?;
        let key = DecodingKey::from_jwk(jwk)?;

        let mut validation = Validation::new(header.alg);
        validation.validate_aud = false;
        validation.required_spec_claims.clear();
        validation.validate_nbf = true;

        Ok(jsonwebtoken::decode::<C>(token, &key, &validation)?)
    }

    /// Return the key set for `url`, fetching at most once per clock hour.
    async fn key_set(&self, url: &str) -> Result<JwkSet, KeySetError> {
        let cache_key = format!("{}|{url}", hour_bucket());
        if let Some(doc) = self.cache.get(&cache_key) {
            return Ok(serde_json::from_str(&doc)?);
        }

        debug!(url = %url, "Fetching key set");
        let response = self.http.get(url).send().await?;
        if response.status() != StatusCode::OK {
            return Err(KeySetError::BadStatus(response.status()));
        }
        let body = response.text().await?;
        let jwks: JwkSet = serde_json::from_str(&body)?;

        self.cache.set(cache_key, body);
        Ok(jwks)
    }
}

/// Current clock hour, e.g. `2024-05-01T13`
fn hour_bucket() -> String {
    chrono::Utc::now().format("%Y-%m-%dT%H").to_string()
}

fn check_algorithm(alg: Algorithm) -> Result<(), KeySetError> {
    match alg {
        Algorithm::HS256 | Algorithm::HS384 | Algorithm::HS512 => {
            Err(KeySetError::UnexpectedAlgorithm(alg))
        }
        _ => Ok(()),
    }
}

/// Find the signing key by `kid`; a lone key may be used without one.
fn select_key<'a>(jwks: &'a JwkSet, kid: Option<&str>) -> Result<&'a Jwk, KeySetError> {
    match kid {
        Some(kid) => jwks
            .find(kid)
            .ok_or_else(|| KeySetError::UnknownKeyId(kid.to_string())),
        None => match jwks.keys.as_slice() {
            [only] => Ok(only),
            _ => Err(KeySetError::MissingKeyId),
        },
    }
}

/// Whether the `aud` claim (a string or an array) contains `expected`.
#[must_use]
pub fn audience_contains(aud_claim: &serde_json::Value, expected: &str) -> bool {
    match aud_claim {
        serde_json::Value::String(s) => s == expected,
        serde_json::Value::Array(arr) => arr.iter().any(|v| v.as_str() == Some(expected)),
        _ => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn jwks(kids: &[&str]) -> JwkSet {
        let keys: Vec<_> = kids
            .iter()
            .map(|kid| {
                serde_json::json!({
                    "kty": "EC",
                    "crv": "P-256",
                    "alg": "ES256",
                    "kid": kid,
                    "x": "f83OJ3D2xF1Bg8vub9tLe1gHMzV76e8Tus9uPHvRVEU",
                    "y": "x_FEzRu9m36HLN_tue659LNpXW6pCyStikYjKIWI5a0",
                })
            })
            .collect();
        serde_json::from_value(serde_json::json!({ "keys": keys })).unwrap()
    }

    #[test]
    fn audience_accepts_string_match() {
        // GIVEN: string aud claim matching expected
        let aud = serde_json::json!("my-app");

        // THEN: accepted
        assert!(audience_contains(&aud, "my-app"));
    }

    #[test]
    fn audience_accepts_array_member_match() {
        // GIVEN: array aud claim where one element matches
        let aud = serde_json::json!(["other-app", "my-app"]);

        // THEN: accepted
        assert!(audience_contains(&aud, "my-app"));
    }

    #[test]
    fn audience_rejects_no_match() {
        assert!(!audience_contains(&serde_json::json!("wrong"), "my-app"));
        assert!(!audience_contains(&serde_json::json!([]), "my-app"));
        assert!(!audience_contains(&serde_json::Value::Null, "my-app"));
    }

    #[test]
    fn symmetric_algorithms_are_rejected() {
        assert!(matches!(
            check_algorithm(Algorithm::HS256),
            Err(KeySetError::UnexpectedAlgorithm(Algorithm::HS256))
        ));
        assert!(check_algorithm(Algorithm::ES256).is_ok());
        assert!(check_algorithm(Algorithm::RS256).is_ok());
    }

    #[test]
    fn selects_key_by_kid() {
        let set = jwks(&["a", "b"]);
        let key = select_key(&set, Some("b")).unwrap();
        assert_eq!(key.common.key_id.as_deref(), Some("b"));
    }

    #[test]
    fn unknown_kid_is_an_error() {
        let set = jwks(&["a"]);
        assert!(matches!(
            select_key(&set, Some("zzz")),
            Err(KeySetError::UnknownKeyId(kid)) if kid == "zzz"
        ));
    }

    #[test]
    fn missing_kid_uses_lone_key_only() {
        assert!(select_key(&jwks(&["a"]), None).is_ok());
        assert!(matches!(
            select_key(&jwks(&["a", "b"]), None),
            Err(KeySetError::MissingKeyId)
        ));
    }

    #[test]
    fn hour_bucket_has_hour_precision() {
        let bucket = hour_bucket();
        assert_eq!(bucket.len(), "2024-05-01T13".len());
        assert_eq!(&bucket[10..11], "T");
    }
}
