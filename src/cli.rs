//! Command-line interface

use std::path::PathBuf;

use clap::{Parser, Subcommand};

/// Epoxy - authenticating gateway for internal services and static assets
#[derive(Parser, Debug)]
#[command(name = "epoxy")]
#[command(version, about, long_about = None)]
pub struct Cli {
    /// Path to configuration file (YAML); environment variables override it
    #[arg(short, long, env = "EPOXY_CONFIG", global = true)]
    pub config: Option<PathBuf>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, default_value = "info", env = "EPOXY_LOG_LEVEL", global = true)]
    pub log_level: String,

    /// Log format (text, json)
    #[arg(long, env = "EPOXY_LOG_FORMAT", global = true)]
    pub log_format: Option<String>,

    /// Subcommand (optional - defaults to server mode)
    #[command(subcommand)]
    pub command: Option<Command>,
}

/// Available subcommands
#[derive(Subcommand, Debug, PartialEq, Eq)]
pub enum Command {
    /// Start the gateway (default)
    Serve,

    /// Print a fresh P-256 key pair for JWT_EC_256 / JWT_EC_256_PUB
    Keygen,

    /// Print a bcrypt hash of a password for DEV_BCRYPT_HASH
    HashPassword {
        /// Password to hash
        #[arg(required = true)]
        password: String,

        /// bcrypt cost factor
        #[arg(long, default_value_t = bcrypt::DEFAULT_COST)]
        cost: u32,
    },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_to_serve_mode() {
        let cli = Cli::try_parse_from(["epoxy"]).unwrap();
        assert_eq!(cli.command, None);
        assert_eq!(cli.log_level, "info");
    }

    #[test]
    fn parses_hash_password() {
        let cli = Cli::try_parse_from(["epoxy", "hash-password", "s3cret", "--cost", "4"]).unwrap();
        assert_eq!(
            cli.command,
            Some(Command::HashPassword {
                password: "s3cret".to_string(),
                cost: 4
            })
        );
    }

    #[test]
    fn global_flags_after_subcommand() {
        let cli = Cli::try_parse_from(["epoxy", "serve", "--log-format", "json"]).unwrap();
        assert_eq!(cli.log_format.as_deref(), Some("json"));
        assert_eq!(cli.command, Some(Command::Serve));
    }
}
