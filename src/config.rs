//! Configuration management
//!
//! Configuration comes from an optional YAML file overlaid with environment
//! variables. Environment names are the upper-case form of the field names
//! (`CF_APP_AUD`, `DEV_SESSION_DURATION`, ...). Environment values are taken
//! as literal text, so a numeric password or audience stays a string.

use std::collections::BTreeMap;
use std::{path::Path, path::PathBuf, time::Duration};

use figment::{
    Figment,
    providers::{Env, Format, Serialized, Yaml},
};
use jsonwebtoken::{DecodingKey, EncodingKey};
use serde::{Deserialize, Serialize};

use crate::{Error, Result};

/// Environment variables read on top of the config file
const ENV_KEYS: &[&str] = &[
    "ROUTES",
    "PUBLIC_DIR",
    "PUBLIC_PREFIX",
    "CF_ADDR",
    "CF_JWKS_URL",
    "CF_APP_AUD",
    "CF_JWT_HEADER",
    "EXT_JWKS_URL",
    "EXT_JWT_URL",
    "EXT_JWT_SUBJECT_PATH",
    "DEV_ADDR",
    "DEV_ALLOWED_USER_SUFFIX",
    "DEV_BCRYPT_HASH",
    "DEV_SESSION_DURATION",
    "DEV_DISABLE_SECURE_COOKIE",
    "BASIC_AUTH_ADDR",
    "BASIC_AUTH_PASSWORD",
    "BASIC_AUTH_ALLOWED_USER_SUFFIX",
    "NO_AUTH_ENABLE",
    "NO_AUTH_ADDR",
    "JWT_EC_256",
    "JWT_EC_256_PUB",
    "CSP_POLICY",
    "CACHE_SWAP_INTERVAL",
    "SHUTDOWN_GRACE",
];

/// Main configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Reverse-proxy routes
    pub routes: RouteList,

    /// Static asset root (disabled when empty)
    pub public_dir: String,
    /// URL prefix the static assets are served under
    pub public_prefix: String,

    /// Bind address of the edge-access protected listener
    pub cf_addr: String,
    /// Key-set URL of the edge-access provider
    pub cf_jwks_url: String,
    /// Audience the edge-access assertion must carry (enables the listener)
    pub cf_app_aud: String,
    /// Header carrying the edge-access assertion
    pub cf_jwt_header: String,

    /// Key-set URL for tokens issued by the exchange endpoint
    pub ext_jwks_url: String,
    /// Exchange endpoint URL
    pub ext_jwt_url: String,
    /// Dot path to the subject inside the verified claims
    pub ext_jwt_subject_path: String,

    /// Bind address of the dev-login listener
    pub dev_addr: String,
    /// Suffix dev-login emails must carry
    pub dev_allowed_user_suffix: String,
    /// bcrypt hash of the shared dev password (enables the listener)
    pub dev_bcrypt_hash: String,
    /// Lifetime of a dev session cookie
    #[serde(with = "humantime_serde")]
    pub dev_session_duration: Duration,
    /// Never set the `Secure` cookie attribute
    pub dev_disable_secure_cookie: bool,

    /// Bind address of the basic-auth listener
    pub basic_auth_addr: String,
    /// Shared basic-auth password (enables the listener)
    pub basic_auth_password: String,
    /// Suffix basic-auth usernames must carry
    pub basic_auth_allowed_user_suffix: String,

    /// Serve the unauthenticated listener
    pub no_auth_enable: bool,
    /// Bind address of the unauthenticated listener
    pub no_auth_addr: String,

    /// PKCS#8 PEM P-256 private key used to sign minted tokens and sessions
    pub jwt_ec_256: String,
    /// SPKI PEM public half of `jwt_ec_256`
    pub jwt_ec_256_pub: String,

    /// Content-Security-Policy header value (omitted when empty)
    pub csp_policy: String,

    /// Swap interval of the key-set and exchanged-token caches
    #[serde(with = "humantime_serde")]
    pub cache_swap_interval: Duration,
    /// How long listeners may drain in-flight requests on shutdown
    #[serde(with = "humantime_serde")]
    pub shutdown_grace: Duration,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            routes: RouteList::default(),
            public_dir: String::new(),
            public_prefix: String::new(),
            cf_addr: "127.0.0.1:8080".to_string(),
            cf_jwks_url: String::new(),
            cf_app_aud: String::new(),
            cf_jwt_header: "Cf-Access-Jwt-Assertion".to_string(),
            ext_jwks_url: String::new(),
            ext_jwt_url: String::new(),
            ext_jwt_subject_path: "sub".to_string(),
            dev_addr: ":7070".to_string(),
            dev_allowed_user_suffix: String::new(),
            dev_bcrypt_hash: String::new(),
            dev_session_duration: Duration::ZERO,
            dev_disable_secure_cookie: false,
            basic_auth_addr: String::new(),
            basic_auth_password: String::new(),
            basic_auth_allowed_user_suffix: String::new(),
            no_auth_enable: false,
            no_auth_addr: String::new(),
            jwt_ec_256: String::new(),
            jwt_ec_256_pub: String::new(),
            csp_policy: String::new(),
            cache_swap_interval: Duration::from_secs(30 * 60),
            shutdown_grace: Duration::from_secs(10),
        }
    }
}

/// Routes as written in configuration
///
/// YAML files may give a list of entries directly. Environment variables
/// carry text: either a JSON array or one `Prefix|PrefixStrip <prefix>
/// <target>` line per route.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum RouteList {
    /// Structured entries
    Entries(Vec<RouteConfig>),
    /// Unparsed text
    Text(String),
}

impl Default for RouteList {
    fn default() -> Self {
        Self::Entries(Vec::new())
    }
}

/// A single configured route, not yet validated
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RouteConfig {
    /// Path prefix matched exactly and as a subtree
    pub prefix: String,
    /// Absolute upstream URL
    pub target: String,
    /// Remove the prefix before forwarding
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub strip: bool,
    /// Send the target's authority as `Host`
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub rewrite_host: bool,
}

impl RouteList {
    /// Resolve to route entries, parsing text forms.
    pub fn entries(&self) -> Result<Vec<RouteConfig>> {
        match self {
            Self::Entries(entries) => Ok(entries.clone()),
            Self::Text(text) if text.trim().is_empty() => Ok(Vec::new()),
            Self::Text(text) => parse_routes(text),
        }
    }
}

/// Parse the textual route list: a JSON array, else the line format.
fn parse_routes(text: &str) -> Result<Vec<RouteConfig>> {
    if let Ok(routes) = serde_json::from_str::<Vec<RouteConfig>>(text) {
        if !routes.is_empty() {
            return Ok(routes);
        }
    }

    let mut routes = Vec::new();
    for line in text.lines().filter(|l| !l.trim().is_empty()) {
        let parts: Vec<&str> = line.split_whitespace().collect();
        let [mode, prefix, target] = parts.as_slice() else {
            return Err(Error::config(format!(
                "ROUTES: 3 tokens per line required, got '{}'",
                line.trim()
            )));
        };
        let strip = match mode.to_ascii_lowercase().as_str() {
            "prefixstrip" => true,
            "prefix" => false,
            _ => {
                return Err(Error::config(format!(
                    "ROUTES: route mode required (Prefix/PrefixStrip), got '{mode}'"
                )));
            }
        };
        routes.push(RouteConfig {
            prefix: (*prefix).to_string(),
            target: (*target).to_string(),
            strip,
            rewrite_host: false,
        });
    }
    Ok(routes)
}

impl Config {
    /// Load configuration from an optional YAML file plus the environment.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut figment = Figment::new();
        if let Some(p) = path {
            if !p.exists() {
                return Err(Error::config(format!(
                    "config file not found: {}",
                    p.display()
                )));
            }
            figment = figment.merge(Yaml::file(p));
        }
        figment = figment.merge(env_overrides());
        Self::from_figment(&figment)
    }

    /// Extract, normalise and validate configuration from `figment`.
    ///
    /// Flags also accept their textual forms (`"true"`, `"1"`, `"yes"`).
    pub fn from_figment(figment: &Figment) -> Result<Self> {
        let mut config: Self = figment.extract_lossy()?;
        config.normalize();
        config.validate()?;
        Ok(config)
    }

    fn normalize(&mut self) {
        for field in [
            &mut self.public_dir,
            &mut self.public_prefix,
            &mut self.cf_addr,
            &mut self.cf_jwks_url,
            &mut self.cf_app_aud,
            &mut self.cf_jwt_header,
            &mut self.ext_jwks_url,
            &mut self.ext_jwt_url,
            &mut self.ext_jwt_subject_path,
            &mut self.dev_addr,
            &mut self.dev_allowed_user_suffix,
            &mut self.dev_bcrypt_hash,
            &mut self.basic_auth_addr,
            &mut self.basic_auth_allowed_user_suffix,
            &mut self.no_auth_addr,
            &mut self.jwt_ec_256,
            &mut self.jwt_ec_256_pub,
            &mut self.csp_policy,
        ] {
            let trimmed = field.trim();
            if trimmed.len() != field.len() {
                *field = trimmed.to_string();
            }
        }
    }

    /// Reject configurations that would start a listener without its secrets.
    pub fn validate(&self) -> Result<()> {
        self.routes.entries()?;

        if self.cache_swap_interval.is_zero() {
            return Err(Error::config("CACHE_SWAP_INTERVAL must be positive"));
        }

        if self.cf_enabled() {
            if self.cf_jwks_url.is_empty() {
                return Err(Error::config("CF_APP_AUD and CF_JWKS_URL required"));
            }
            if self.cf_jwt_header.is_empty() {
                return Err(Error::config("CF_JWT_HEADER must not be empty"));
            }
            if self.ext_jwt_url.is_empty() != self.ext_jwks_url.is_empty() {
                return Err(Error::config(
                    "EXT_JWT_URL and EXT_JWKS_URL must be set together",
                ));
            }
            if !self.jwt_ec_256.is_empty() && self.ext_jwt_subject_path.is_empty() {
                return Err(Error::config("EXT_JWT_SUBJECT_PATH must not be empty"));
            }
        }

        if self.dev_enabled() {
            if self.dev_session_duration.is_zero() {
                return Err(Error::config("DEV_SESSION_DURATION must be positive"));
            }
            if self.jwt_ec_256.is_empty() || self.jwt_ec_256_pub.is_empty() {
                return Err(Error::config(
                    "dev login requires JWT_EC_256 and JWT_EC_256_PUB",
                ));
            }
        }

        if self.basic_enabled() {
            if self.basic_auth_addr.is_empty() {
                return Err(Error::config("BASIC_AUTH_ADDR required"));
            }
            if self.jwt_ec_256.is_empty() {
                return Err(Error::config("basic auth requires JWT_EC_256"));
            }
        }

        // Parse keys now so a bad PEM fails startup rather than a request.
        self.signing_key()?;
        self.verifying_key()?;
        Ok(())
    }

    /// Whether the edge-access listener is configured
    #[must_use]
    pub fn cf_enabled(&self) -> bool {
        !self.cf_app_aud.is_empty()
    }

    /// Whether the exchange stage is configured
    #[must_use]
    pub fn exchange_enabled(&self) -> bool {
        !self.ext_jwt_url.is_empty() && !self.ext_jwks_url.is_empty()
    }

    /// Whether the dev-login listener is configured
    #[must_use]
    pub fn dev_enabled(&self) -> bool {
        !self.dev_bcrypt_hash.is_empty()
    }

    /// Whether the basic-auth listener is configured
    #[must_use]
    pub fn basic_enabled(&self) -> bool {
        !self.basic_auth_password.is_empty()
    }

    /// Whether the unauthenticated listener is configured
    #[must_use]
    pub fn no_auth_enabled(&self) -> bool {
        self.no_auth_enable && !self.no_auth_addr.is_empty()
    }

    /// Static asset root, if configured
    #[must_use]
    pub fn public_dir(&self) -> Option<PathBuf> {
        (!self.public_dir.is_empty()).then(|| PathBuf::from(&self.public_dir))
    }

    /// Private signing key, if configured
    pub fn signing_key(&self) -> Result<Option<EncodingKey>> {
        if self.jwt_ec_256.is_empty() {
            return Ok(None);
        }
        EncodingKey::from_ec_pem(self.jwt_ec_256.as_bytes())
            .map(Some)
            .map_err(|e| Error::config(format!("error parsing ECDSA private key: {e}")))
    }

    /// Public verification key, if configured
    pub fn verifying_key(&self) -> Result<Option<DecodingKey>> {
        if self.jwt_ec_256_pub.is_empty() {
            return Ok(None);
        }
        DecodingKey::from_ec_pem(self.jwt_ec_256_pub.as_bytes())
            .map(Some)
            .map_err(|e| Error::config(format!("error parsing ECDSA public key: {e}")))
    }
}

/// Known environment variables, every value kept verbatim
fn env_overrides() -> Serialized<BTreeMap<String, String>> {
    let values = Env::raw()
        .only(ENV_KEYS)
        .iter()
        .map(|(key, value)| (key.as_str().to_string(), value))
        .collect();
    Serialized::globals(values)
}

/// Expand Go-style `":port"` addresses to all interfaces.
#[must_use]
pub fn normalize_addr(addr: &str) -> String {
    if addr.starts_with(':') {
        format!("0.0.0.0{addr}")
    } else {
        addr.to_string()
    }
}
