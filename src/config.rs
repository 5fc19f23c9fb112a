use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use reqwest::Method;
use std::path::PathBuf;

/// Session Transport - authenticated API client
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
pub struct CliArgs {
    /// Base URL of the backend API
    #[arg(short = 'u', long, env = "API_BASE_URL", default_value = "http://localhost:3000/api")]
    pub base_url: String,

    /// Path to the SQLite credential database
    #[arg(short = 'd', long, env = "CREDENTIALS_DB_FILE")]
    pub db_file: Option<String>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, env = "LOG_LEVEL", default_value = "info")]
    pub log_level: String,

    /// HTTP request timeout in seconds
    #[arg(long, env = "HTTP_REQUEST_TIMEOUT", default_value = "10")]
    pub http_timeout: u64,

    /// Refresh call timeout in seconds
    #[arg(long, env = "REFRESH_TIMEOUT", default_value = "30")]
    pub refresh_timeout: u64,

    /// Which requests are resent once after a transport failure (always, idempotent)
    #[arg(long, env = "NETWORK_RETRY", default_value = "always")]
    pub network_retry: String,

    /// Device identifier sent with every request
    #[arg(long, env = "DEVICE_ID")]
    pub device_id: Option<String>,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug, Clone)]
pub enum Command {
    /// Store a token pair obtained from a login flow
    Login {
        #[arg(long, env = "ACCESS_TOKEN")]
        access_token: String,
        #[arg(long, env = "REFRESH_TOKEN")]
        refresh_token: String,
    },

    /// Log out on the server and drop the stored tokens
    Logout,

    /// Show whether a session is stored
    Status,

    /// Send an authenticated request and print the response body
    Request {
        /// HTTP method
        method: String,
        /// Path relative to the base URL
        path: String,
        /// JSON request body
        #[arg(long)]
        data: Option<String>,
    },
}

#[derive(Clone, Debug)]
pub struct Config {
    // Backend
    pub api_base_url: String,

    // Credentials
    pub credentials_db_file: PathBuf,

    // Timeouts
    pub http_request_timeout: u64,
    pub http_connect_timeout: u64,
    pub refresh_timeout: u64,

    // HTTP client
    pub http_max_connections: usize,
    pub network_retry: NetworkRetryPolicy,
    pub device_id: String,

    // Logging
    pub log_level: String,
}

/// Which requests get the single resend after a transport failure
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum NetworkRetryPolicy {
    /// Every method, including non-idempotent writes
    Always,
    /// GET, HEAD, PUT, DELETE, OPTIONS and TRACE only
    IdempotentOnly,
}

impl NetworkRetryPolicy {
    pub fn allows(&self, method: &Method) -> bool {
        match self {
            NetworkRetryPolicy::Always => true,
            NetworkRetryPolicy::IdempotentOnly => [
                Method::GET,
                Method::HEAD,
                Method::PUT,
                Method::DELETE,
                Method::OPTIONS,
                Method::TRACE,
            ]
            .contains(method),
        }
    }
}

impl Config {
    /// Load configuration with priority: CLI > ENV > defaults
    pub fn load() -> Result<(Self, Command)> {
        // Load .env file if it exists
        dotenvy::dotenv().ok();

        let args = CliArgs::parse();
        let command = args.command.clone();

        Ok((Self::from_args(args)?, command))
    }

    /// Build config from parsed arguments
    pub fn from_args(args: CliArgs) -> Result<Self> {
        let credentials_db_file = match args.db_file {
            Some(path) => expand_tilde(&path),
            None => default_db_path().context(
                "CREDENTIALS_DB_FILE is required when no data directory is available (use -d)",
            )?,
        };

        Ok(Config {
            api_base_url: args.base_url,
            credentials_db_file,

            http_request_timeout: args.http_timeout,
            http_connect_timeout: env_or("HTTP_CONNECT_TIMEOUT", 10),
            refresh_timeout: args.refresh_timeout,

            http_max_connections: env_or("HTTP_MAX_CONNECTIONS", 20),
            network_retry: parse_network_retry(&args.network_retry),
            device_id: args
                .device_id
                .filter(|id| !id.is_empty())
                .unwrap_or_else(|| uuid::Uuid::new_v4().to_string()),

            log_level: args.log_level,
        })
    }

    /// Validate configuration
    pub fn validate(&self) -> Result<()> {
        reqwest::Url::parse(&self.api_base_url)
            .with_context(|| format!("API_BASE_URL is not a valid URL: {}", self.api_base_url))?;

        if self.http_request_timeout == 0 || self.http_connect_timeout == 0 {
            anyhow::bail!("HTTP timeouts must be greater than zero");
        }

        if self.refresh_timeout == 0 {
            anyhow::bail!("REFRESH_TIMEOUT must be greater than zero");
        }

        Ok(())
    }
}

/// Read a numeric setting from the environment, falling back to a default
fn env_or<T: std::str::FromStr>(key: &str, default: T) -> T {
    std::env::var(key)
        .ok()
        .and_then(|s| s.parse().ok())
        .unwrap_or(default)
}

/// Default credential database location under the user data directory
fn default_db_path() -> Option<PathBuf> {
    dirs::data_local_dir().map(|dir| dir.join("session-transport").join("credentials.sqlite3"))
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

/// Parse network retry policy from string
fn parse_network_retry(s: &str) -> NetworkRetryPolicy {
    match s.to_lowercase().as_str() {
        "idempotent" | "idempotent_only" => NetworkRetryPolicy::IdempotentOnly,
        _ => NetworkRetryPolicy::Always,
    }
}
