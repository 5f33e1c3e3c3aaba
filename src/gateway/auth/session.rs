//! Dev-login session stage
//!
//! A signed `epoxy-dev` cookie carries the session. Without one, `GET`
//! requests receive a login form and a `POST` of that form checks the
//! shared password against a bcrypt hash. A successful login sets the cookie
//! and redirects back to the same URL.

use std::net::IpAddr;
use std::sync::Arc;
use std::time::Duration;

use axum::{
    Form, Router,
    extract::{FromRequest, Request, State},
    http::{HeaderMap, HeaderValue, Method, StatusCode, header},
    middleware::{self, Next},
    response::{Html, IntoResponse, Response},
};
use chrono::{DateTime, Utc};
use jsonwebtoken::{Algorithm, DecodingKey, EncodingKey, Header, Validation};
use serde::{Deserialize, Serialize};
use tracing::{Span, debug};

use super::{publish, record_failure, reject};
use crate::gateway::middleware::Middleware;

const STAGE: &str = "session";
const ISSUER: &str = "epoxy-dev";

/// Name of the session cookie
pub const SESSION_COOKIE: &str = "epoxy-dev";

/// Claims inside the session cookie
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionClaims {
    /// Email entered at login
    pub dev_email: String,
    /// Always `epoxy-dev`
    pub iss: String,
    /// Issued at (unix seconds)
    pub iat: i64,
    /// Expiry (unix seconds)
    pub exp: i64,
}

#[derive(Debug, Default, Deserialize)]
struct LoginForm {
    #[serde(default)]
    email: String,
    #[serde(default)]
    password: String,
}

/// Session-cookie login for development listeners.
pub struct DevSession {
    bcrypt_hash: String,
    duration: Duration,
    signing_key: EncodingKey,
    verifying_key: DecodingKey,
    disable_secure: bool,
}

impl DevSession {
    /// Create the stage. Sessions are signed with `signing_key` and checked
    /// with `verifying_key` (ES256).
    #[must_use]
    pub fn new(
        bcrypt_hash: impl Into<String>,
        duration: Duration,
        signing_key: EncodingKey,
        verifying_key: DecodingKey,
        disable_secure: bool,
    ) -> Self {
        Self {
            bcrypt_hash: bcrypt_hash.into(),
            duration,
            signing_key,
            verifying_key,
            disable_secure,
        }
    }

    /// Email of a valid session presented in `headers`, if any.
    fn active_session(&self, headers: &HeaderMap) -> Option<String> {
        let cookie = session_cookie(headers)?;
        let mut validation = Validation::new(Algorithm::ES256);
        validation.set_issuer(&[ISSUER]);
        match jsonwebtoken::decode::<SessionClaims>(cookie, &self.verifying_key, &validation) {
            Ok(data) => Some(data.claims.dev_email),
            Err(e) => {
                debug!(error = %e, "Ignoring invalid session cookie");
                None
            }
        }
    }

    /// Sign a session for `email`, returning the token and its expiry.
    pub fn issue(&self, email: &str) -> Result<(String, i64), jsonwebtoken::errors::Error> {
        let now = Utc::now().timestamp();
        let claims = SessionClaims {
            dev_email: email.to_string(),
            iss: ISSUER.to_string(),
            iat: now,
            exp: now.saturating_add(i64::try_from(self.duration.as_secs()).unwrap_or(i64::MAX)),
        };
        let token = jsonwebtoken::encode(&Header::new(Algorithm::ES256), &claims, &self.signing_key)?;
        Ok((token, claims.exp))
    }

    fn set_cookie(&self, token: &str, exp: i64, secure: bool) -> Option<HeaderValue> {
        let expires = DateTime::<Utc>::from_timestamp(exp, 0)?;
        let mut cookie = format!(
            "{SESSION_COOKIE}={token}; Path=/; Expires={}; Max-Age={}; HttpOnly; SameSite=Lax",
            expires.format("%a, %d %b %Y %H:%M:%S GMT"),
            self.duration.as_secs(),
        );
        if secure {
            cookie.push_str("; Secure");
        }
        HeaderValue::from_str(&cookie).ok()
    }

    async fn login(&self, request: Request) -> Response {
        let target = request
            .uri()
            .path_and_query()
            .map_or_else(|| "/".to_string(), ToString::to_string);
        let secure = !self.disable_secure && !is_loopback_request(&request);

        let login = match Form::<LoginForm>::from_request(request, &()).await {
            Ok(Form(login)) => login,
            Err(e) => {
                debug!(error = %e, "Unreadable login form");
                LoginForm::default()
            }
        };
        let span = Span::current();
        span.record("dev_email", login.email.as_str());

        let hash = self.bcrypt_hash.clone();
        let password = login.password;
        let verified = tokio::task::spawn_blocking(move || bcrypt::verify(password, &hash)).await;
        if !matches!(verified, Ok(Ok(true))) {
            record_failure(STAGE, &"wrong password");
            return (StatusCode::UNAUTHORIZED, Html(LOGIN_PAGE)).into_response();
        }

        let (token, exp) = match self.issue(&login.email) {
            Ok(issued) => issued,
            Err(e) => return reject(STAGE, StatusCode::UNAUTHORIZED, &e),
        };
        let (Some(cookie), Ok(location)) =
            (self.set_cookie(&token, exp, secure), HeaderValue::from_str(&target))
        else {
            return reject(STAGE, StatusCode::UNAUTHORIZED, &"unrepresentable session header");
        };
        debug!(email = %login.email, "Dev login succeeded, session cookie set");
        (
            StatusCode::FOUND,
            [(header::SET_COOKIE, cookie), (header::LOCATION, location)],
        )
            .into_response()
    }
}

impl std::fmt::Debug for DevSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DevSession")
            .field("duration", &self.duration)
            .field("disable_secure", &self.disable_secure)
            .finish_non_exhaustive()
    }
}

impl Middleware for DevSession {
    fn name(&self) -> &'static str {
        STAGE
    }

    fn wrap(self: Arc<Self>, router: Router) -> Router {
        router.layer(middleware::from_fn_with_state(self, dev_session))
    }
}

async fn dev_session(
    State(stage): State<Arc<DevSession>>,
    mut request: Request,
    next: Next,
) -> Response {
    if let Some(email) = stage.active_session(request.headers()) {
        Span::current().record("dev_email", email.as_str());
        if let Err(e) = publish(request.extensions_mut(), |id| id.set_session_email(email)) {
            return reject(STAGE, StatusCode::INTERNAL_SERVER_ERROR, &e);
        }
        return next.run(request).await;
    }

    if request.method() == Method::POST {
        return stage.login(request).await;
    }

    Span::current().record("stage", STAGE);
    Html(LOGIN_PAGE).into_response()
}

/// Value of the session cookie among all `Cookie` headers.
fn session_cookie(headers: &HeaderMap) -> Option<&str> {
    headers
        .get_all(header::COOKIE)
        .iter()
        .filter_map(|v| v.to_str().ok())
        .flat_map(|v| v.split(';'))
        .filter_map(|pair| pair.trim().split_once('='))
        .find(|(name, _)| *name == SESSION_COOKIE)
        .map(|(_, value)| value.trim_matches('"'))
        .filter(|value| !value.is_empty())
}

fn is_loopback_request(request: &Request) -> bool {
    let host = request
        .headers()
        .get(header::HOST)
        .and_then(|v| v.to_str().ok())
        .or_else(|| request.uri().host());
    host.is_some_and(is_loopback_host)
}

/// Whether `host` (optionally with a port) names the local machine.
fn is_loopback_host(host: &str) -> bool {
    let name = if let Some(rest) = host.strip_prefix('[') {
        rest.split_once(']').map_or(rest, |(addr, _)| addr)
    } else {
        host.split_once(':').map_or(host, |(name, _)| name)
    };
    name.eq_ignore_ascii_case("localhost") || name.parse::<IpAddr>().is_ok_and(|ip| ip.is_loopback())
}

const LOGIN_PAGE: &str = r#"<!doctype html>
<html>
<head>
  <meta charset="utf-8">
  <meta name="viewport" content="width=device-width, initial-scale=1.0">
  <title>Epoxy Dev Login</title>
  <style>
    form { margin: 100px auto 0; width: 260px; display: flex; flex-direction: column; gap: 10px; }
    form div { display: flex; justify-content: space-between; }
  </style>
</head>
<body>
  <form method="post">
    <div>
      <label for="email">Email</label>
      <input type="email" id="email" name="email" autocomplete="username">
    </div>
    <div>
      <label for="password">Password</label>
      <input type="password" id="password" name="password" autocomplete="current-password">
    </div>
    <input type="submit" value="Log in">
  </form>
</body>
</html>
"#;
