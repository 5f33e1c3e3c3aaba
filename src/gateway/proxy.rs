//! Single-target reverse proxy
//!
//! Bodies are streamed in both directions; nothing is buffered. Hop-by-hop
//! headers are dropped on the way in and out.

use std::net::SocketAddr;
use std::time::Duration;

use axum::{
    body::Body,
    extract::{ConnectInfo, Request},
    http::{HeaderMap, HeaderName, HeaderValue, StatusCode, Uri, header},
    response::{IntoResponse, Response},
};
use tracing::warn;
use url::Url;

use super::router::Route;
use crate::Result;

/// Headers that only make sense for a single connection
const HOP_BY_HOP: [HeaderName; 8] = [
    header::CONNECTION,
    HeaderName::from_static("keep-alive"),
    header::PROXY_AUTHENTICATE,
    header::PROXY_AUTHORIZATION,
    header::TE,
    header::TRAILER,
    header::TRANSFER_ENCODING,
    header::UPGRADE,
];

const X_FORWARDED_FOR: HeaderName = HeaderName::from_static("x-forwarded-for");
const X_FORWARDED: [HeaderName; 3] = [
    X_FORWARDED_FOR,
    HeaderName::from_static("x-forwarded-host"),
    HeaderName::from_static("x-forwarded-proto"),
];

/// Build the HTTP client used for upstream calls.
///
/// Redirects are passed through to the caller and response bodies are
/// forwarded as received, so neither is followed nor decoded here.
pub fn upstream_client(connect_timeout: Duration) -> Result<reqwest::Client> {
    Ok(reqwest::Client::builder()
        .redirect(reqwest::redirect::Policy::none())
        .no_gzip()
        .no_deflate()
        .no_brotli()
        .connect_timeout(connect_timeout)
        .build()?)
}

/// Forwards requests for one route to its target.
#[derive(Debug, Clone)]
pub struct ReverseProxy {
    target: Url,
    strip_prefix: Option<String>,
    rewrite_host: bool,
    client: reqwest::Client,
}

impl ReverseProxy {
    /// Create a proxy for `route` using `client`.
    #[must_use]
    pub fn new(route: &Route, client: reqwest::Client) -> Self {
        Self {
            target: route.target.clone(),
            strip_prefix: route.strip.then(|| route.prefix.clone()),
            rewrite_host: route.rewrite_host,
            client,
        }
    }

    /// Upstream URL for an inbound request URI.
    #[must_use]
    pub fn upstream_url(&self, uri: &Uri) -> Url {
        let path = uri.path();
        let path = self
            .strip_prefix
            .as_deref()
            .and_then(|prefix| path.strip_prefix(prefix))
            .unwrap_or(path);

        let mut url = self.target.clone();
        url.set_path(&single_joining_slash(self.target.path(), path));

        let query = match (self.target.query(), uri.query()) {
            (Some(a), Some(b)) if !a.is_empty() && !b.is_empty() => Some(format!("{a}&{b}")),
            (Some(a), _) if !a.is_empty() => Some(a.to_string()),
            (_, b) => b.map(ToString::to_string),
        };
        url.set_query(query.as_deref());
        url
    }

    /// Forward `request` upstream and stream the answer back.
    ///
    /// Answers 502 when the upstream cannot be reached.
    pub async fn forward(&self, request: Request) -> Response {
        let url = self.upstream_url(request.uri());
        let (parts, body) = request.into_parts();

        let mut headers = parts.headers;
        strip_hop_by_hop(&mut headers);
        if self.rewrite_host {
            // Host follows the target URL; forwarding headers are not trusted.
            headers.remove(header::HOST);
            for name in &X_FORWARDED {
                headers.remove(name);
            }
        } else if let Some(ConnectInfo(peer)) = parts.extensions.get::<ConnectInfo<SocketAddr>>() {
            append_forwarded_for(&mut headers, *peer);
        }

        let upstream = self
            .client
            .request(parts.method, url.clone())
            .headers(headers)
            .body(reqwest::Body::wrap_stream(body.into_data_stream()))
            .send()
            .await;

        let upstream = match upstream {
            Ok(response) => response,
            Err(e) => {
                warn!(target = %url, error = %e, "Upstream request failed");
                return StatusCode::BAD_GATEWAY.into_response();
            }
        };

        let status = upstream.status();
        let mut headers = upstream.headers().clone();
        strip_hop_by_hop(&mut headers);

        let mut response = Response::new(Body::from_stream(upstream.bytes_stream()));
        *response.status_mut() = status;
        *response.headers_mut() = headers;
        response
    }
}

/// Join two URL paths with exactly one slash between them.
fn single_joining_slash(a: &str, b: &str) -> String {
    match (a.ends_with('/'), b.starts_with('/')) {
        (true, true) => format!("{a}{}", &b[1..]),
        (false, false) => format!("{a}/{b}"),
        _ => format!("{a}{b}"),
    }
}

fn strip_hop_by_hop(headers: &mut HeaderMap) {
    // Headers listed in `Connection` are connection-scoped too.
    let listed: Vec<HeaderName> = headers
        .get_all(header::CONNECTION)
        .iter()
        .filter_map(|v| v.to_str().ok())
        .flat_map(|v| v.split(','))
        .filter_map(|name| HeaderName::from_bytes(name.trim().as_bytes()).ok())
        .collect();
    for name in listed.iter().chain(HOP_BY_HOP.iter()) {
        headers.remove(name);
    }
}

fn append_forwarded_for(headers: &mut HeaderMap, peer: SocketAddr) {
    let client_ip = peer.ip().to_string();
    let value = match headers.get(&X_FORWARDED_FOR).and_then(|v| v.to_str().ok()) {
        Some(prior) => format!("{prior}, {client_ip}"),
        None => client_ip,
    };
    if let Ok(value) = HeaderValue::from_str(&value) {
        headers.insert(X_FORWARDED_FOR, value);
    }
}
