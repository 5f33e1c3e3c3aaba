//! Prefix mux: routes, static assets and the root redirect
//!
//! Every route prefix `p` is registered twice, as the exact pattern `p` and
//! as the subtree pattern `p/`. A request goes to the longest matching
//! pattern; unmatched paths answer 404. Paths carrying `.`, `..` or empty
//! segments (percent-encoded dots included) are answered with a 301 to the
//! cleaned path before any route sees them.

use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;

use axum::{
    Router,
    extract::{Request, State},
    http::{HeaderValue, StatusCode, Uri, header},
    response::{IntoResponse, Response},
};
use tower::ServiceExt;
use tower_http::services::{ServeDir, ServeFile};
use tracing::info;
use url::Url;

use super::proxy::ReverseProxy;
use crate::config::RouteConfig;
use crate::{Error, Result};

/// A validated reverse-proxy route
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Route {
    /// Cleaned prefix without trailing slash; empty means the root
    pub prefix: String,
    /// Absolute upstream URL
    pub target: Url,
    /// Remove the prefix before forwarding
    pub strip: bool,
    /// Send the target's authority as `Host`
    pub rewrite_host: bool,
}

impl Route {
    /// Validate a configured route.
    pub fn from_config(config: &RouteConfig) -> Result<Self> {
        let route_error = |reason: String| Error::Route {
            prefix: config.prefix.clone(),
            reason,
        };
        let target = Url::parse(config.target.trim())
            .map_err(|e| route_error(format!("target is not an absolute URL: {e}")))?;
        if !matches!(target.scheme(), "http" | "https") || !target.has_host() {
            return Err(route_error(format!(
                "target must be an http(s) URL with a host, got '{target}'"
            )));
        }
        Ok(Self {
            prefix: route_prefix(&config.prefix),
            target,
            strip: config.strip,
            rewrite_host: config.rewrite_host,
        })
    }

    /// Whether this route serves `/`
    #[must_use]
    pub fn owns_root(&self) -> bool {
        self.prefix.is_empty()
    }
}

/// `"/api/"` → `"/api"`, `"api"` → `"/api"`, `""` and `"/"` → `""`
fn route_prefix(prefix: &str) -> String {
    let trimmed = prefix.trim().trim_end_matches('/');
    if trimmed.is_empty() {
        String::new()
    } else if trimmed.starts_with('/') {
        trimmed.to_string()
    } else {
        format!("/{trimmed}")
    }
}

/// `"."` or `".."` for dot segments, `%2e` spellings included
fn dot_segment(segment: &str) -> Option<&'static str> {
    match segment.to_ascii_lowercase().replace("%2e", ".").as_str() {
        "." => Some("."),
        ".." => Some(".."),
        _ => None,
    }
}

/// Lexically clean an absolute URL path (`//`, `.` and `..` resolved).
fn clean_path(path: &str) -> String {
    let mut segments: Vec<&str> = Vec::new();
    for segment in path.split('/') {
        match dot_segment(segment) {
            Some("..") => {
                segments.pop();
            }
            Some(_) => {}
            None if segment.is_empty() => {}
            None => segments.push(segment),
        }
    }
    format!("/{}", segments.join("/"))
}

/// [`clean_path`] keeping a trailing slash, the form requests are routed by
fn canonical_path(path: &str) -> String {
    let mut cleaned = clean_path(path);
    if path.ends_with('/') && cleaned != "/" {
        cleaned.push('/');
    }
    cleaned
}

/// Static asset directory served under a URL prefix
#[derive(Debug, Clone)]
pub struct AssetsConfig<'a> {
    /// Filesystem root
    pub dir: &'a Path,
    /// URL prefix, cleaned before use
    pub prefix: &'a str,
}

#[derive(Clone)]
enum Target {
    Proxy(Arc<ReverseProxy>),
    Assets(Assets),
    Redirect(HeaderValue),
}

/// Files under a directory with `index.html` substituted for missing paths
#[derive(Clone)]
struct Assets {
    prefix: String,
    service: ServeDir<ServeFile>,
}

impl Assets {
    fn new(dir: &Path, prefix: String) -> Self {
        let service = ServeDir::new(dir).fallback(ServeFile::new(dir.join("index.html")));
        Self { prefix, service }
    }

    async fn serve(&self, request: Request) -> Response {
        let (mut parts, body) = request.into_parts();
        let path = parts.uri.path();
        let rest = if self.prefix == "/" {
            path
        } else {
            path.strip_prefix(self.prefix.as_str()).unwrap_or(path)
        };
        let path_and_query = match parts.uri.query() {
            Some(q) => format!("/{}?{q}", rest.trim_start_matches('/')),
            None => format!("/{}", rest.trim_start_matches('/')),
        };
        let Ok(uri) = Uri::builder().path_and_query(path_and_query).build() else {
            return StatusCode::BAD_REQUEST.into_response();
        };
        parts.uri = uri;

        match self.service.clone().oneshot(Request::from_parts(parts, body)).await {
            Ok(response) => response.into_response(),
            Err(never) => match never {},
        }
    }
}

/// Longest-prefix request multiplexer
#[derive(Clone, Default)]
pub struct Mux {
    targets: Vec<Target>,
    exact: HashMap<String, usize>,
    /// Subtree patterns (ending in `/`), longest first
    subtrees: Vec<(String, usize)>,
}

impl std::fmt::Debug for Mux {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Mux")
            .field("exact", &self.exact.keys().collect::<Vec<_>>())
            .field(
                "subtrees",
                &self.subtrees.iter().map(|(p, _)| p).collect::<Vec<_>>(),
            )
            .finish()
    }
}

impl Mux {
    /// Build the mux for `routes` and optional static assets.
    ///
    /// When assets are served under a prefix other than `/` and no route owns
    /// the root, every otherwise unmatched path is redirected to that prefix.
    pub fn new(
        routes: &[Route],
        assets: Option<AssetsConfig<'_>>,
        client: &reqwest::Client,
    ) -> Result<Self> {
        let mut mux = Self::default();
        let mut owns_root = false;

        for route in routes {
            let proxy = Arc::new(ReverseProxy::new(route, client.clone()));
            mux.attach(&route.prefix, Target::Proxy(proxy))?;
            owns_root |= route.owns_root();
            info!(
                prefix = %route.prefix,
                target = %route.target,
                strip = route.strip,
                rewrite_host = route.rewrite_host,
                "Hosting reverse proxy"
            );
        }

        if let Some(assets) = assets {
            let prefix = clean_path(assets.prefix);
            let attach_at = if prefix == "/" { "" } else { prefix.as_str() };
            mux.attach(attach_at, Target::Assets(Assets::new(assets.dir, prefix.clone())))?;
            if !owns_root && prefix != "/" {
                let location = HeaderValue::from_str(&prefix)
                    .map_err(|e| Error::config(format!("invalid PUBLIC_PREFIX: {e}")))?;
                mux.attach("", Target::Redirect(location))?;
            }
            info!(prefix = %prefix, dir = %assets.dir.display(), "Hosting assets directory");
        }

        mux.subtrees.sort_by(|a, b| b.0.len().cmp(&a.0.len()));
        Ok(mux)
    }

    /// Register `prefix` as an exact and a subtree pattern; `""` is the root.
    fn attach(&mut self, prefix: &str, target: Target) -> Result<()> {
        let subtree = format!("{prefix}/");
        let duplicate = self.subtrees.iter().any(|(p, _)| *p == subtree);
        if duplicate {
            return Err(Error::Route {
                prefix: prefix.to_string(),
                reason: "prefix registered more than once".to_string(),
            });
        }

        let index = self.targets.len();
        self.targets.push(target);
        if !prefix.is_empty() {
            self.exact.insert(prefix.to_string(), index);
        }
        self.subtrees.push((subtree, index));
        Ok(())
    }

    fn lookup(&self, path: &str) -> Option<&Target> {
        let index = self.exact.get(path).copied().or_else(|| {
            self.subtrees
                .iter()
                .find(|(pattern, _)| path.starts_with(pattern.as_str()))
                .map(|(_, index)| *index)
        })?;
        self.targets.get(index)
    }

    /// Pattern that would serve `path`, if any
    #[must_use]
    pub fn matched_pattern(&self, path: &str) -> Option<&str> {
        if let Some((pattern, _)) = self.exact.get_key_value(path) {
            return Some(pattern);
        }
        self.subtrees
            .iter()
            .find(|(pattern, _)| path.starts_with(pattern.as_str()))
            .map(|(pattern, _)| pattern.as_str())
    }

    /// The mux as a router every request falls through to.
    pub fn into_router(self) -> Router {
        Router::new()
            .fallback(dispatch)
            .with_state(Arc::new(self))
    }
}

async fn dispatch(State(mux): State<Arc<Mux>>, request: Request) -> Response {
    let canonical = canonical_path(request.uri().path());
    if canonical != request.uri().path() {
        return redirect_to_clean(canonical, request.uri().query());
    }

    match mux.lookup(request.uri().path()) {
        Some(Target::Proxy(proxy)) => proxy.forward(request).await,
        Some(Target::Assets(assets)) => assets.serve(request).await,
        Some(Target::Redirect(location)) => (
            StatusCode::MOVED_PERMANENTLY,
            [(header::LOCATION, location.clone())],
        )
            .into_response(),
        None => StatusCode::NOT_FOUND.into_response(),
    }
}

fn redirect_to_clean(mut path: String, query: Option<&str>) -> Response {
    if let Some(query) = query {
        path.push('?');
        path.push_str(query);
    }
    match HeaderValue::from_str(&path) {
        Ok(location) => (StatusCode::MOVED_PERMANENTLY, [(header::LOCATION, location)]).into_response(),
        Err(_) => StatusCode::BAD_REQUEST.into_response(),
    }
}
