use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use std::path::PathBuf;

/// Refresh endpoints tried in order when none are configured
const DEFAULT_REFRESH_PATHS: [&str; 3] = [
    "/api/token/refresh/",
    "/api/auth/jwt/refresh/",
    "/api/v1/auth/jwt/refresh/",
];

/// Nursery portal API client
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
pub struct CliArgs {
    /// Backend server URL (scheme, host and port)
    #[arg(short = 's', long, env = "PORTAL_SERVER_URL", default_value = "http://localhost:8000")]
    pub server_url: String,

    /// Base path of the REST API; request paths are relative to it
    #[arg(long, env = "PORTAL_API_BASE", default_value = "/api")]
    pub api_base: String,

    /// Login endpoint path
    #[arg(long, env = "PORTAL_LOGIN_PATH", default_value = "/api/token/")]
    pub login_path: String,

    /// Refresh endpoint paths, tried in order (comma separated)
    #[arg(
        long,
        env = "PORTAL_REFRESH_PATHS",
        value_delimiter = ',',
        default_values = DEFAULT_REFRESH_PATHS
    )]
    pub refresh_paths: Vec<String>,

    /// Path (relative to the API base) fetched by `status --check`
    #[arg(long, env = "PORTAL_SESSION_CHECK_PATH", default_value = "/core/me/")]
    pub session_check_path: String,

    /// Path to the credentials SQLite database
    #[arg(short = 'd', long, env = "PORTAL_CREDENTIALS_DB")]
    pub credentials_db: Option<String>,

    /// HTTP connect timeout in seconds
    #[arg(long, env = "HTTP_CONNECT_TIMEOUT", default_value = "10")]
    pub connect_timeout: u64,

    /// HTTP request timeout in seconds
    #[arg(long, env = "HTTP_REQUEST_TIMEOUT", default_value = "30")]
    pub http_timeout: u64,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, env = "LOG_LEVEL", default_value = "info")]
    pub log_level: String,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug, Clone, PartialEq)]
pub enum Command {
    /// Log in and store the issued tokens
    Login {
        #[arg(short, long)]
        username: String,
        /// Prompted for when omitted
        #[arg(short, long, env = "PORTAL_PASSWORD")]
        password: Option<String>,
    },
    /// Forget stored tokens
    Logout,
    /// Show the session state
    Status {
        /// Confirm the session with the server instead of trusting the local store
        #[arg(long)]
        check: bool,
    },
    /// GET a path relative to the API base
    Get {
        path: String,
        /// Query parameter as key=value (repeatable)
        #[arg(short, long = "query")]
        query: Vec<String>,
    },
    /// POST a JSON body
    Post {
        path: String,
        #[arg(short = 'j', long)]
        data: String,
    },
    /// PUT a JSON body
    Put {
        path: String,
        #[arg(short = 'j', long)]
        data: String,
    },
    /// PATCH a JSON body
    Patch {
        path: String,
        #[arg(short = 'j', long)]
        data: String,
    },
    /// DELETE a path
    Delete { path: String },
}

#[derive(Clone, Debug)]
pub struct Config {
    // Backend
    pub server_url: String,
    pub api_base_path: String,
    pub login_path: String,
    pub refresh_paths: Vec<String>,
    pub session_check_path: String,

    // Credentials
    pub credentials_db: PathBuf,

    // HTTP client
    pub http_max_connections: usize,
    pub http_connect_timeout: u64,
    pub http_request_timeout: u64,

    // Logging
    pub log_level: String,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            server_url: "http://localhost:8000".to_string(),
            api_base_path: "/api".to_string(),
            login_path: "/api/token/".to_string(),
            refresh_paths: DEFAULT_REFRESH_PATHS.iter().map(|p| p.to_string()).collect(),
            session_check_path: "/core/me/".to_string(),
            credentials_db: default_credentials_db(),
            http_max_connections: 20,
            http_connect_timeout: 10,
            http_request_timeout: 30,
            log_level: "info".to_string(),
        }
    }
}

impl Config {
    /// Configuration pointing at `server_url`, everything else default
    pub fn for_server(server_url: impl Into<String>) -> Self {
        Self {
            server_url: server_url.into(),
            ..Self::default()
        }
    }

    /// Load configuration from all sources with priority: CLI > ENV > defaults
    pub fn load() -> Result<(Self, Command)> {
        // Load .env file if it exists
        dotenvy::dotenv().ok();

        let args = CliArgs::parse();
        let config = Self::from_args(&args);
        Ok((config, args.command))
    }

    /// Build configuration from parsed arguments
    pub fn from_args(args: &CliArgs) -> Self {
        Config {
            server_url: args.server_url.trim_end_matches('/').to_string(),
            api_base_path: normalize_base(&args.api_base),
            login_path: args.login_path.clone(),
            refresh_paths: args
                .refresh_paths
                .iter()
                .map(|p| p.trim().to_string())
                .filter(|p| !p.is_empty())
                .collect(),
            session_check_path: args.session_check_path.clone(),
            credentials_db: args
                .credentials_db
                .as_deref()
                .map(expand_tilde)
                .unwrap_or_else(default_credentials_db),
            http_max_connections: std::env::var("HTTP_MAX_CONNECTIONS")
                .ok()
                .and_then(|s| s.parse().ok())
                .unwrap_or(20),
            http_connect_timeout: args.connect_timeout,
            http_request_timeout: args.http_timeout,
            log_level: args.log_level.clone(),
        }
    }

    /// Validate configuration
    pub fn validate(&self) -> Result<()> {
        if !(self.server_url.starts_with("http://") || self.server_url.starts_with("https://")) {
            anyhow::bail!(
                "PORTAL_SERVER_URL must start with http:// or https://: {}",
                self.server_url
            );
        }

        if !self.api_base_path.is_empty() && !self.api_base_path.starts_with('/') {
            anyhow::bail!("PORTAL_API_BASE must start with '/': {}", self.api_base_path);
        }

        if self.refresh_paths.is_empty() {
            anyhow::bail!("At least one refresh path is required (PORTAL_REFRESH_PATHS)");
        }

        for path in std::iter::once(&self.login_path).chain(&self.refresh_paths) {
            if !path.starts_with('/') {
                anyhow::bail!("Authentication endpoint paths must start with '/': {}", path);
            }
        }

        if self.http_request_timeout == 0 {
            anyhow::bail!("HTTP_REQUEST_TIMEOUT must be greater than zero");
        }

        Ok(())
    }

    /// Absolute URL of the API base
    pub fn api_base_url(&self) -> String {
        format!("{}{}", self.server_url, self.api_base_path)
    }

    /// Absolute URL of the login endpoint
    pub fn login_url(&self) -> String {
        format!("{}{}", self.server_url, self.login_path)
    }

    /// Absolute URLs of the refresh endpoints, in order
    pub fn refresh_urls(&self) -> Vec<String> {
        self.refresh_paths
            .iter()
            .map(|p| format!("{}{}", self.server_url, p))
            .collect()
    }
}

/// Default credentials database location under the user's data directory
fn default_credentials_db() -> PathBuf {
    dirs::data_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("nursery-portal")
        .join("credentials.sqlite3")
}

/// "/api/" -> "/api", "/" -> ""
fn normalize_base(base: &str) -> String {
    base.trim_end_matches('/').to_string()
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

/// Parse a `key=value` query argument
pub fn parse_query_pair(s: &str) -> Result<(String, String)> {
    let (key, value) = s
        .split_once('=')
        .with_context(|| format!("Query parameter must be key=value: {}", s))?;
    if key.is_empty() {
        anyhow::bail!("Query parameter key is empty: {}", s);
    }
    Ok((key.to_string(), value.to_string()))
}
