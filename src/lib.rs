//! Epoxy
//!
//! Authenticating gateway that sits between an edge proxy and internal
//! services or static assets.
//!
//! # Features
//!
//! - **Identity stages**: edge-access JWT, token exchange, local dev login
//!   and basic auth, one chain per listener
//! - **Token minting**: a short-lived ES256 `Epoxy-Token` on every
//!   authenticated upstream request
//! - **Prefix routing**: streaming reverse proxy plus SPA asset serving
//! - **Generational caching** of signing-key documents and exchanged tokens
//! - **Graceful shutdown** of all listeners together

#![forbid(unsafe_code)]
#![warn(missing_docs)]

pub mod cli;
pub mod config;
pub mod error;
pub mod gateway;
pub mod jwk;
pub mod logging;

pub use error::{Error, Result};
pub use logging::{LogPipeline, setup_tracing};
