//! Prefix routing, reverse proxying and static assets end to end

mod common;

use std::sync::Arc;

use axum::{
    body::Body,
    http::{Request, StatusCode, header},
};
use epoxy::config::RouteConfig;
use epoxy::gateway::{AssetsConfig, Compression, Epoxy, Middleware, Route};
use pretty_assertions::assert_eq;
use tempfile::TempDir;
use wiremock::matchers::{any, header as header_eq, method, path, query_param};
use wiremock::{Mock, MockServer, ResponseTemplate};

use common::{body_string, gateway, proxy_client, route_to, send};

fn get(uri: &str) -> Request<Body> {
    Request::get(uri).body(Body::empty()).unwrap()
}

#[tokio::test]
async fn strip_and_keep_prefix() {
    // GIVEN: one route stripping its prefix, one keeping it
    let upstream = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/v1/x"))
        .respond_with(ResponseTemplate::new(200).set_body_string("stripped"))
        .expect(1)
        .mount(&upstream)
        .await;
    Mock::given(method("GET"))
        .and(path("/keep/v1/x"))
        .respond_with(ResponseTemplate::new(200).set_body_string("kept"))
        .expect(1)
        .mount(&upstream)
        .await;
    let router = gateway(
        &[route_to(&upstream, "/api", true), route_to(&upstream, "/keep", false)],
        &[],
    );

    // WHEN / THEN
    let stripped = send(&router, get("/api/v1/x")).await;
    assert_eq!(stripped.status(), StatusCode::OK);
    assert_eq!(body_string(stripped).await, "stripped");

    let kept = send(&router, get("/keep/v1/x")).await;
    assert_eq!(kept.status(), StatusCode::OK);
    assert_eq!(body_string(kept).await, "kept");
}

#[tokio::test]
async fn unmatched_path_is_not_found() {
    let upstream = MockServer::start().await;
    let router = gateway(&[route_to(&upstream, "/api", false)], &[]);

    let response = send(&router, get("/apiary")).await;

    assert_eq!(response.status(), StatusCode::NOT_FOUND);
    assert!(upstream.received_requests().await.unwrap().is_empty());
}

#[tokio::test]
async fn dot_segments_cannot_escape_a_route() {
    // GIVEN: only /api is routed, to a target with a base path
    let upstream = MockServer::start().await;
    Mock::given(any())
        .respond_with(ResponseTemplate::new(200))
        .expect(0)
        .mount(&upstream)
        .await;
    let route = Route::from_config(&RouteConfig {
        prefix: "/api".to_string(),
        target: format!("{}/base/", upstream.uri()),
        strip: true,
        rewrite_host: false,
    })
    .unwrap();
    let router = gateway(&[route], &[]);

    // WHEN / THEN: every spelling is redirected to the cleaned path, which
    // no route serves
    for (raw, cleaned) in [
        ("/api/../admin", "/admin"),
        ("/api/../../admin/secret?x=1", "/admin/secret?x=1"),
        ("/api/%2e%2e/%2E%2E/admin", "/admin"),
        ("/api//v1/./x", "/api/v1/x"),
    ] {
        let response = send(&router, get(raw)).await;
        assert_eq!(response.status(), StatusCode::MOVED_PERMANENTLY, "{raw}");
        assert_eq!(response.headers()[header::LOCATION], cleaned, "{raw}");
    }

    let followed = send(&router, get("/admin")).await;
    assert_eq!(followed.status(), StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn forwards_method_body_and_query() {
    let upstream = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/base/items"))
        .and(query_param("token", "fixed"))
        .and(query_param("page", "3"))
        .and(header_eq("x-custom", "kept"))
        .respond_with(ResponseTemplate::new(201).insert_header("x-upstream", "yes"))
        .expect(1)
        .mount(&upstream)
        .await;
    let route = Route::from_config(&RouteConfig {
        prefix: "/svc".to_string(),
        target: format!("{}/base?token=fixed", upstream.uri()),
        strip: true,
        rewrite_host: true,
    })
    .unwrap();
    let router = gateway(&[route], &[]);

    let response = send(
        &router,
        Request::post("/svc/items?page=3")
            .header("x-custom", "kept")
            .header("x-forwarded-host", "spoofed.example.com")
            .body(Body::from(r#"{"name":"widget"}"#))
            .unwrap(),
    )
    .await;

    assert_eq!(response.status(), StatusCode::CREATED);
    assert_eq!(response.headers()["x-upstream"], "yes");

    let requests = upstream.received_requests().await.unwrap();
    assert_eq!(requests[0].body, br#"{"name":"widget"}"#.to_vec());
    assert!(!requests[0].headers.contains_key("x-forwarded-host"));
}

#[tokio::test]
async fn upstream_redirects_are_passed_through() {
    let upstream = MockServer::start().await;
    Mock::given(path("/old"))
        .respond_with(ResponseTemplate::new(302).insert_header("location", "/new"))
        .expect(1)
        .mount(&upstream)
        .await;
    let router = gateway(&[route_to(&upstream, "/", false)], &[]);

    let response = send(&router, get("/old")).await;

    assert_eq!(response.status(), StatusCode::FOUND);
    assert_eq!(response.headers()[header::LOCATION], "/new");
}

#[tokio::test]
async fn unreachable_upstream_is_bad_gateway() {
    // A port that was just free is very unlikely to be listening.
    let port = {
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        listener.local_addr().unwrap().port()
    };
    let route = Route::from_config(&RouteConfig {
        prefix: "/".to_string(),
        target: format!("http://127.0.0.1:{port}"),
        strip: false,
        rewrite_host: false,
    })
    .unwrap();
    let router = gateway(&[route], &[]);

    let response = send(&router, get("/anything")).await;

    assert_eq!(response.status(), StatusCode::BAD_GATEWAY);
}

fn asset_dir() -> TempDir {
    let dir = tempfile::tempdir().unwrap();
    std::fs::write(dir.path().join("index.html"), "<h1>app shell</h1>").unwrap();
    std::fs::write(dir.path().join("main.js"), "console.log('hi');").unwrap();
    dir
}

fn asset_router(dir: &TempDir, prefix: &str, routes: &[Route]) -> axum::Router {
    let assets = AssetsConfig {
        dir: dir.path(),
        prefix,
    };
    Epoxy::new(Some(assets), routes, &proxy_client())
        .unwrap()
        .into_router()
}

#[tokio::test]
async fn assets_fall_back_to_index_for_client_side_routes() {
    // GIVEN: assets under /app and no route owning the root
    let dir = asset_dir();
    let router = asset_router(&dir, "/app", &[]);

    // WHEN / THEN: real files are served as-is
    let script = send(&router, get("/app/main.js")).await;
    assert_eq!(script.status(), StatusCode::OK);
    assert_eq!(body_string(script).await, "console.log('hi');");

    // unknown paths get the app shell
    let deep_link = send(&router, get("/app/settings/profile")).await;
    assert_eq!(deep_link.status(), StatusCode::OK);
    assert_eq!(body_string(deep_link).await, "<h1>app shell</h1>");

    // the bare prefix is the shell too
    let bare = send(&router, get("/app")).await;
    assert_eq!(bare.status(), StatusCode::OK);
    assert_eq!(body_string(bare).await, "<h1>app shell</h1>");

    // everything else is sent to the asset prefix
    let elsewhere = send(&router, get("/login")).await;
    assert_eq!(elsewhere.status(), StatusCode::MOVED_PERMANENTLY);
    assert_eq!(elsewhere.headers()[header::LOCATION], "/app");
}

#[tokio::test]
async fn assets_at_root_share_the_router_with_routes() {
    let upstream = MockServer::start().await;
    Mock::given(path("/api/health"))
        .respond_with(ResponseTemplate::new(200).set_body_string("healthy"))
        .expect(1)
        .mount(&upstream)
        .await;
    let dir = asset_dir();
    let router = asset_router(&dir, "/", &[route_to(&upstream, "/api", false)]);

    let api = send(&router, get("/api/health")).await;
    assert_eq!(body_string(api).await, "healthy");

    let shell = send(&router, get("/some/page")).await;
    assert_eq!(shell.status(), StatusCode::OK);
    assert_eq!(body_string(shell).await, "<h1>app shell</h1>");
}

#[tokio::test]
async fn compression_is_negotiated() {
    let dir = tempfile::tempdir().unwrap();
    std::fs::write(dir.path().join("index.html"), "x".repeat(4096)).unwrap();
    let chain: [Arc<dyn Middleware>; 1] = [Arc::new(Compression)];
    let router = Epoxy::new(
        Some(AssetsConfig {
            dir: dir.path(),
            prefix: "/",
        }),
        &[],
        &proxy_client(),
    )
    .unwrap()
    .with_middlewares(&chain)
    .into_router();

    let response = send(
        &router,
        Request::get("/index.html")
            .header(header::ACCEPT_ENCODING, "gzip")
            .body(Body::empty())
            .unwrap(),
    )
    .await;

    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(response.headers()[header::CONTENT_ENCODING], "gzip");
}
