//! Gateway: identity stages, minting, middleware, routing and listeners

pub mod auth;
pub mod middleware;
pub mod mint;
pub mod proxy;
pub mod router;
mod server;

pub use auth::{BasicAuth, DevSession, EdgeAccess, Exchange, IdentityError, RequestIdentity};
pub use middleware::{AccessLog, Compression, ContentSecurityPolicy, Middleware, NoCache, apply_chain};
pub use mint::{
    DropInboundToken, EPOXY_TOKEN, EpoxyClaims, MintError, SubjectPolicy, TokenMinter,
};
pub use proxy::{ReverseProxy, upstream_client};
pub use router::{AssetsConfig, Mux, Route};
pub use server::{BoundListener, Epoxy, Listener, serve, serve_bound, shutdown_signal};
