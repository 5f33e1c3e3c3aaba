//! Identity stages and the per-request identity context
//!
//! Each stage is a [`Middleware`](super::middleware::Middleware) that either
//! terminates the request with a bare status code or publishes exactly one
//! verified identity into the request's [`RequestIdentity`] and calls the
//! next handler:
//!
//! - [`EdgeAccess`]: edge-provider assertion header, verified against a key set
//! - [`Exchange`]: swaps the edge assertion for an external identity token
//! - [`DevSession`]: signed session cookie with a password login form
//! - [`BasicAuth`]: `Authorization: Basic` with a shared password

mod basic;
mod edge;
mod exchange;
mod session;

use std::fmt::Display;
use std::sync::Arc;

use axum::{
    http::{Extensions, StatusCode},
    response::{IntoResponse, Response},
};
use serde_json::Value;
use tracing::{Span, debug};

pub use basic::BasicAuth;
pub use edge::{EdgeAccess, EdgeClaims, EdgeIdentity};
pub use exchange::{Exchange, ExchangeError};
pub use session::{DevSession, SESSION_COOKIE, SessionClaims};

/// Failure to read or write the per-request identity context
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum IdentityError {
    /// The stage that publishes this identity has not run
    #[error("{0} identity not present, make sure its stage has run")]
    NotPresent(&'static str),
    /// A second stage tried to publish the same identity
    #[error("{0} identity already published")]
    AlreadyPublished(&'static str),
}

/// Verified identities attached to one in-flight request.
///
/// Every field is written by at most one stage. Reading a field nobody wrote
/// is an [`IdentityError::NotPresent`], never a silent default.
#[derive(Debug, Clone, Default)]
pub struct RequestIdentity {
    edge: Option<Arc<EdgeIdentity>>,
    external: Option<Arc<Value>>,
    session_email: Option<String>,
    basic_username: Option<String>,
}

static EMPTY: RequestIdentity = RequestIdentity {
    edge: None,
    external: None,
    session_email: None,
    basic_username: None,
};

impl RequestIdentity {
    /// The identity context stored in `extensions`, or an empty one.
    #[must_use]
    pub fn of(extensions: &Extensions) -> &Self {
        extensions.get::<Self>().unwrap_or(&EMPTY)
    }

    /// Verified edge-access assertion
    pub fn edge(&self) -> Result<&EdgeIdentity, IdentityError> {
        self.edge.as_deref().ok_or(IdentityError::NotPresent("edge"))
    }

    /// Claims of the exchanged external identity token
    pub fn external_claims(&self) -> Result<&Value, IdentityError> {
        self.external
            .as_deref()
            .ok_or(IdentityError::NotPresent("external"))
    }

    /// Email of an active dev session
    pub fn session_email(&self) -> Result<&str, IdentityError> {
        self.session_email
            .as_deref()
            .ok_or(IdentityError::NotPresent("session"))
    }

    /// Username accepted by basic auth
    pub fn basic_username(&self) -> Result<&str, IdentityError> {
        self.basic_username
            .as_deref()
            .ok_or(IdentityError::NotPresent("basic"))
    }

    fn set_edge(&mut self, edge: EdgeIdentity) -> Result<(), IdentityError> {
        set_once(&mut self.edge, Arc::new(edge), "edge")
    }

    fn set_external(&mut self, claims: Value) -> Result<(), IdentityError> {
        set_once(&mut self.external, Arc::new(claims), "external")
    }

    fn set_session_email(&mut self, email: String) -> Result<(), IdentityError> {
        set_once(&mut self.session_email, email, "session")
    }

    fn set_basic_username(&mut self, username: String) -> Result<(), IdentityError> {
        set_once(&mut self.basic_username, username, "basic")
    }
}

fn set_once<T>(slot: &mut Option<T>, value: T, kind: &'static str) -> Result<(), IdentityError> {
    if slot.is_some() {
        return Err(IdentityError::AlreadyPublished(kind));
    }
    *slot = Some(value);
    Ok(())
}

/// Apply `write` to the identity context in `extensions`, creating it first.
fn publish<F>(extensions: &mut Extensions, write: F) -> Result<(), IdentityError>
where
    F: FnOnce(&mut RequestIdentity) -> Result<(), IdentityError>,
{
    let mut identity = extensions.remove::<RequestIdentity>().unwrap_or_default();
    let result = write(&mut identity);
    extensions.insert(identity);
    result
}

/// Terminate the request: record the failure on the request span and answer
/// with a bare status.
pub(crate) fn reject(stage: &'static str, status: StatusCode, error: &dyn Display) -> Response {
    record_failure(stage, error);
    debug!(stage, status = status.as_u16(), error = %error, "Request rejected");
    status.into_response()
}

/// Record a stage failure on the request span.
pub(crate) fn record_failure(stage: &'static str, error: &dyn Display) {
    let span = Span::current();
    span.record("stage", stage);
    span.record("error_message", tracing::field::display(error));
}
