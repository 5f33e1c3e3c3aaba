//! Epoxy - authenticating gateway for internal services and static assets

use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use clap::Parser;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use epoxy::{
    Result,
    cli::{Cli, Command},
    config::Config,
    gateway::{
        AccessLog, AssetsConfig, BasicAuth, Compression, ContentSecurityPolicy, DevSession,
        DropInboundToken, EdgeAccess, Epoxy, Exchange, Listener, Middleware, NoCache, Route,
        SubjectPolicy, TokenMinter, serve, shutdown_signal, upstream_client,
    },
    jwk::KeySetResolver,
    setup_tracing,
};
use epoxy_core::GenerationalCache;

/// Timeout for key-set and exchange calls
const IDENTITY_HTTP_TIMEOUT: Duration = Duration::from_secs(10);
/// Connect timeout for upstream services
const UPSTREAM_CONNECT_TIMEOUT: Duration = Duration::from_secs(10);
/// Upper bound on flushing buffered log lines at exit
const LOG_DRAIN_TIMEOUT: Duration = Duration::from_secs(2);

#[tokio::main]
async fn main() -> ExitCode {
    // A missing .env is the normal case.
    dotenvy::dotenv().ok();

    let cli = Cli::parse();

    match cli.command {
        Some(Command::Keygen) => return report(run_keygen()),
        Some(Command::HashPassword { ref password, cost }) => {
            return report(run_hash_password(password, cost));
        }
        Some(Command::Serve) | None => {}
    }

    let logs = match setup_tracing(&cli.log_level, cli.log_format.as_deref()) {
        Ok(logs) => logs,
        Err(e) => {
            eprintln!("Failed to setup tracing: {e}");
            return ExitCode::FAILURE;
        }
    };

    let code = run_server(&cli).await;
    if !logs.drain(LOG_DRAIN_TIMEOUT).await {
        eprintln!("Log pipeline did not drain within {LOG_DRAIN_TIMEOUT:?}");
    }
    code
}

fn report(result: anyhow::Result<()>) -> ExitCode {
    match result {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("❌ {e:#}");
            ExitCode::FAILURE
        }
    }
}

/// Print a P-256 key pair in the PEM forms `JWT_EC_256` and
/// `JWT_EC_256_PUB` expect.
fn run_keygen() -> anyhow::Result<()> {
    let key_pair = rcgen::KeyPair::generate().context("generating P-256 key pair")?;
    println!("# JWT_EC_256");
    println!("{}", key_pair.serialize_pem());
    println!("# JWT_EC_256_PUB");
    println!("{}", key_pair.public_key_pem());
    Ok(())
}

fn run_hash_password(password: &str, cost: u32) -> anyhow::Result<()> {
    let hash = bcrypt::hash(password, cost).context("hashing password")?;
    println!("{hash}");
    Ok(())
}

async fn run_server(cli: &Cli) -> ExitCode {
    let config = match Config::load(cli.config.as_deref()) {
        Ok(c) => c,
        Err(e) => {
            error!("Failed to load config: {e}");
            return ExitCode::FAILURE;
        }
    };

    let listeners = match build_listeners(&config) {
        Ok(listeners) => listeners,
        Err(e) => {
            error!("Failed to build gateway: {e}");
            return ExitCode::FAILURE;
        }
    };

    info!(
        version = env!("CARGO_PKG_VERSION"),
        listeners = listeners.len(),
        "Starting Epoxy"
    );

    let shutdown = CancellationToken::new();
    tokio::spawn(shutdown_signal(shutdown.clone()));

    match serve(listeners, shutdown, config.shutdown_grace).await {
        Ok(()) => {
            info!("Epoxy stopped");
            ExitCode::SUCCESS
        }
        Err(e) => {
            error!("Server error: {e}");
            ExitCode::FAILURE
        }
    }
}

/// Wire every configured listener around one shared router.
///
/// Chains are listed innermost first.
fn build_listeners(config: &Config) -> Result<Vec<Listener>> {
    let identity_http = reqwest::Client::builder()
        .timeout(IDENTITY_HTTP_TIMEOUT)
        .build()?;
    let proxy_client = upstream_client(UPSTREAM_CONNECT_TIMEOUT)?;

    let routes = config
        .routes
        .entries()?
        .iter()
        .map(Route::from_config)
        .collect::<Result<Vec<_>>>()?;
    let public_dir = config.public_dir();
    let assets = public_dir.as_deref().map(|dir| AssetsConfig {
        dir,
        prefix: &config.public_prefix,
    });
    let epoxy = Epoxy::new(assets, &routes, &proxy_client)?;

    let signing_key = config.signing_key()?;
    let verifying_key = config.verifying_key()?;
    let csp = if config.csp_policy.is_empty() {
        None
    } else {
        Some(Arc::new(ContentSecurityPolicy::new(&config.csp_policy)?))
    };

    let mut listeners = Vec::new();

    if config.cf_enabled() {
        let keys = KeySetResolver::new(
            identity_http.clone(),
            GenerationalCache::new(config.cache_swap_interval),
        );
        let mut chain: Vec<Arc<dyn Middleware>> = Vec::new();
        if let Some(key) = signing_key.clone() {
            chain.push(Arc::new(TokenMinter::new(
                key,
                SubjectPolicy::ClaimPath(config.ext_jwt_subject_path.clone()),
            )));
        } else {
            warn!("JWT_EC_256 not set, upstream requests on the cf listener carry no Epoxy-Token");
        }
        if config.exchange_enabled() {
            chain.push(Arc::new(Exchange::new(
                identity_http.clone(),
                keys.clone(),
                &config.ext_jwks_url,
                &config.ext_jwt_url,
                GenerationalCache::new(config.cache_swap_interval),
            )));
        }
        chain.push(Arc::new(EdgeAccess::new(
            keys,
            &config.cf_jwks_url,
            &config.cf_app_aud,
            &config.cf_jwt_header,
        )?));
        let chain = cross_cutting(chain, csp.as_ref(), true);
        listeners.push(epoxy.with_middlewares(&chain).finalize("cf", &config.cf_addr));
    }

    if config.dev_enabled() {
        let (Some(signing), Some(verifying)) = (signing_key.clone(), verifying_key) else {
            return Err(epoxy::Error::config(
                "dev login requires JWT_EC_256 and JWT_EC_256_PUB",
            ));
        };
        let mut chain: Vec<Arc<dyn Middleware>> = Vec::new();
        chain.push(Arc::new(TokenMinter::new(
            signing.clone(),
            SubjectPolicy::AllowedSuffix(config.dev_allowed_user_suffix.clone()),
        )));
        chain.push(Arc::new(DevSession::new(
            &config.dev_bcrypt_hash,
            config.dev_session_duration,
            signing,
            verifying,
            config.dev_disable_secure_cookie,
        )));
        let chain = cross_cutting(chain, csp.as_ref(), false);
        listeners.push(epoxy.with_middlewares(&chain).finalize("dev", &config.dev_addr));
    }

    if config.basic_enabled() {
        let Some(signing) = signing_key else {
            return Err(epoxy::Error::config("basic auth requires JWT_EC_256"));
        };
        let mut chain: Vec<Arc<dyn Middleware>> = Vec::new();
        chain.push(Arc::new(TokenMinter::new(
            signing,
            SubjectPolicy::AllowedSuffix(config.basic_auth_allowed_user_suffix.clone()),
        )));
        chain.push(Arc::new(BasicAuth::new(&config.basic_auth_password)));
        let chain = cross_cutting(chain, csp.as_ref(), false);
        listeners.push(
            epoxy
                .with_middlewares(&chain)
                .finalize("basic", &config.basic_auth_addr),
        );
    }

    if config.no_auth_enabled() {
        let chain = cross_cutting(Vec::new(), csp.as_ref(), false);
        listeners.push(
            epoxy
                .with_middlewares(&chain)
                .finalize("no-auth", &config.no_auth_addr),
        );
    }

    Ok(listeners)
}

/// Append the stages shared by every listener: inbound token removal,
/// response headers, compression and the access log.
fn cross_cutting(
    mut chain: Vec<Arc<dyn Middleware>>,
    csp: Option<&Arc<ContentSecurityPolicy>>,
    compress: bool,
) -> Vec<Arc<dyn Middleware>> {
    chain.push(Arc::new(DropInboundToken));
    chain.push(Arc::new(NoCache));
    if let Some(csp) = csp {
        chain.push(csp.clone());
    }
    if compress {
        chain.push(Arc::new(Compression));
    }
    chain.push(Arc::new(AccessLog));
    chain
}
