use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use dialoguer::{Confirm, Password};
use reqwest::Method;
use std::path::PathBuf;

use crate::auth::{LoginMethod, DEFAULT_API_KEY_VAR, DEFAULT_STS_TOKEN_VAR};

/// auth-relay - authentication sessions and authenticated requests
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
pub struct CliArgs {
    /// Path to the SQLite secret database
    #[arg(short = 'd', long, env = "AUTH_RELAY_DB_FILE")]
    pub db_file: Option<String>,

    /// Endpoint exchanging an SSO refresh token for a new access token
    #[arg(long, env = "AUTH_RELAY_REFRESH_URL")]
    pub refresh_url: Option<String>,

    /// Environment variable holding the API key for environment login
    #[arg(long, env = "AUTH_RELAY_API_KEY_VAR", default_value = DEFAULT_API_KEY_VAR)]
    pub api_key_var: String,

    /// Environment variable holding the STS token for environment login
    #[arg(long, env = "AUTH_RELAY_STS_TOKEN_VAR", default_value = DEFAULT_STS_TOKEN_VAR)]
    pub sts_token_var: String,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, env = "LOG_LEVEL", default_value = "warn")]
    pub log_level: String,

    /// HTTP connect timeout in seconds
    #[arg(long, env = "HTTP_CONNECT_TIMEOUT", default_value = "30")]
    pub http_connect_timeout: u64,

    /// HTTP request timeout in seconds
    #[arg(long, env = "HTTP_REQUEST_TIMEOUT", default_value = "300")]
    pub http_timeout: u64,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug, Clone, PartialEq)]
pub enum Command {
    /// Show the active login method and stored sessions
    Status,

    /// Switch the active login method (sso, api-key, environment)
    Use { method: LoginMethod },

    /// Store credentials for a login method and make it active
    Login {
        #[command(subcommand)]
        method: LoginCommand,
    },

    /// Remove all stored sessions
    Logout {
        /// Skip the confirmation prompt
        #[arg(short, long)]
        yes: bool,
    },

    /// Send an authenticated request with the active credentials
    Fetch {
        url: String,

        /// HTTP method
        #[arg(short = 'X', long, default_value = "GET")]
        method: String,

        /// JSON request body
        #[arg(short, long)]
        body: Option<String>,
    },
}

#[derive(Subcommand, Debug, Clone, PartialEq)]
pub enum LoginCommand {
    /// Hosted SSO bearer token
    Sso {
        /// Access token (prompted when omitted)
        #[arg(long)]
        access_token: Option<String>,

        /// Refresh token used to renew the access token on 401
        #[arg(long)]
        refresh_token: Option<String>,
    },

    /// Direct API key
    ApiKey {
        /// API key (prompted when omitted)
        #[arg(long)]
        key: Option<String>,
    },
}

#[derive(Clone, Debug)]
pub struct Config {
    // Secret storage
    pub db_file: PathBuf,

    // Token refresh
    pub refresh_url: Option<String>,

    // Environment login
    pub api_key_var: String,
    pub sts_token_var: String,

    // HTTP client
    pub http_connect_timeout: u64,
    pub http_request_timeout: u64,

    // Logging
    pub log_level: String,
}

impl Config {
    /// Load configuration from all sources with priority: CLI > ENV > .env > defaults
    pub fn load() -> Result<(Self, Command)> {
        // Load .env file if it exists
        dotenvy::dotenv().ok();

        let args = CliArgs::parse();
        let config = Self::from_args(&args)?;
        Ok((config, args.command))
    }

    /// Build configuration from parsed arguments
    pub fn from_args(args: &CliArgs) -> Result<Self> {
        let db_file = match args.db_file {
            Some(ref path) => expand_tilde(path),
            None => default_db_file().context(
                "Cannot determine data directory (use -d or set AUTH_RELAY_DB_FILE env var)",
            )?,
        };

        Ok(Config {
            db_file,
            refresh_url: args
                .refresh_url
                .clone()
                .filter(|url| !url.trim().is_empty()),
            api_key_var: args.api_key_var.clone(),
            sts_token_var: args.sts_token_var.clone(),
            http_connect_timeout: args.http_connect_timeout,
            http_request_timeout: args.http_timeout,
            log_level: args.log_level.clone(),
        })
    }

    /// Validate configuration
    pub fn validate(&self) -> Result<()> {
        if let Some(ref url) = self.refresh_url {
            if !url.starts_with("http://") && !url.starts_with("https://") {
                anyhow::bail!("AUTH_RELAY_REFRESH_URL must be an http(s) URL: {}", url);
            }
        }

        if self.http_connect_timeout == 0 || self.http_request_timeout == 0 {
            anyhow::bail!("HTTP timeouts must be greater than zero");
        }

        if self.api_key_var == self.sts_token_var {
            anyhow::bail!(
                "API key and STS token must come from different variables (both are {})",
                self.api_key_var
            );
        }

        Ok(())
    }
}

/// Default secret database location under the user's data directory
fn default_db_file() -> Option<PathBuf> {
    dirs::data_dir().map(|dir| dir.join("auth-relay").join("secrets.sqlite3"))
}

/// Expand tilde (~) in file paths to user's home directory
fn expand_tilde(path: &str) -> PathBuf {
    if let Some(rest) = path.strip_prefix("~/") {
        if let Some(home) = dirs::home_dir() {
            return home.join(rest);
        }
    }
    PathBuf::from(path)
}

/// Parse an HTTP method name, case-insensitively
pub fn parse_http_method(s: &str) -> Result<Method> {
    Method::from_bytes(s.to_uppercase().as_bytes())
        .with_context(|| format!("Invalid HTTP method: {}", s))
}

// === Interactive prompts ===

/// Use `value` if given, otherwise prompt for it without echo
pub fn secret_or_prompt(value: Option<String>, prompt: &str) -> Result<String> {
    let secret = match value {
        Some(v) => v,
        None => Password::new()
            .with_prompt(prompt)
            .interact()
            .with_context(|| format!("Failed to read {}", prompt))?,
    };

    if secret.trim().is_empty() {
        anyhow::bail!("{} cannot be empty", prompt);
    }
    Ok(secret)
}

/// Ask before destroying stored sessions
pub fn confirm_logout() -> Result<bool> {
    Confirm::new()
        .with_prompt("Remove all stored sessions?")
        .default(false)
        .interact()
        .context("Failed to read confirmation")
}
