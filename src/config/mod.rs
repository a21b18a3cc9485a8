use std::env;
use std::path::PathBuf;

use crate::error::AppError;

/// Application configuration loaded from environment variables
#[derive(Debug, Clone)]
pub struct Config {
    pub database: DatabaseConfig,
    pub transport: TransportConfig,
    pub logging: LoggingConfig,
    pub request: RequestConfig,
    pub flow: FlowConfig,
}

/// Working database configuration
#[derive(Debug, Clone)]
pub struct DatabaseConfig {
    pub path: PathBuf,
    pub max_connections: u32,
}

/// Byte-store transport configuration
#[derive(Debug, Clone)]
pub struct TransportConfig {
    /// Remote backend base URL. When unset the primary blob is a local file.
    pub remote_url: Option<String>,
    /// Primary blob file used when no remote backend is configured.
    pub store_path: PathBuf,
    /// Local fallback cache used only when the primary is unreachable.
    pub cache_path: PathBuf,
    /// Initially configured location on the backend.
    pub location: Option<String>,
}

/// Logging configuration
#[derive(Debug, Clone)]
pub struct LoggingConfig {
    pub level: String,
    pub format: LogFormat,
}

/// Log output format
#[derive(Debug, Clone, PartialEq)]
pub enum LogFormat {
    Pretty,
    Json,
}

/// HTTP request configuration
#[derive(Debug, Clone)]
pub struct RequestConfig {
    pub timeout_ms: u64,
    pub max_retries: u32,
    pub retry_delay_ms: u64,
}

/// Flow navigation configuration
#[derive(Debug, Clone)]
pub struct FlowConfig {
    /// Optional JSON catalog replacing the built-in question graph.
    pub catalog_path: Option<PathBuf>,
    /// Consecutive Verifying->Implementing transitions allowed before blocking.
    pub transition_limit: i64,
}

impl Config {
    /// Load configuration from environment variables
    pub fn from_env() -> Result<Self, AppError> {
        // Load .env file if present (ignore errors if not found)
        let _ = dotenvy::dotenv();

        let database = DatabaseConfig {
            path: PathBuf::from(
                env::var("DATABASE_PATH").unwrap_or_else(|_| "./data/devflow.db".to_string()),
            ),
            max_connections: env::var("DATABASE_MAX_CONNECTIONS")
                .ok()
                .and_then(|s| s.parse().ok())
                .unwrap_or(1),
        };

        let remote_url = env::var("STORE_REMOTE_URL")
            .ok()
            .filter(|s| !s.trim().is_empty());
        if let Some(url) = &remote_url {
            if !url.starts_with("http://") && !url.starts_with("https://") {
                return Err(AppError::Config {
                    message: format!("STORE_REMOTE_URL must be an http(s) URL, got '{}'", url),
                });
            }
        }

        let transport = TransportConfig {
            remote_url,
            store_path: PathBuf::from(
                env::var("STORE_PATH").unwrap_or_else(|_| "./data/devflow.store".to_string()),
            ),
            cache_path: PathBuf::from(
                env::var("STORE_CACHE_PATH")
                    .unwrap_or_else(|_| "./data/devflow.cache".to_string()),
            ),
            location: env::var("STORE_LOCATION")
                .ok()
                .filter(|s| !s.trim().is_empty()),
        };

        let logging = LoggingConfig {
            level: env::var("LOG_LEVEL").unwrap_or_else(|_| "info".to_string()),
            format: match env::var("LOG_FORMAT")
                .unwrap_or_else(|_| "pretty".to_string())
                .to_lowercase()
                .as_str()
            {
                "json" => LogFormat::Json,
                _ => LogFormat::Pretty,
            },
        };

        let request = RequestConfig {
            timeout_ms: env::var("REQUEST_TIMEOUT_MS")
                .ok()
                .and_then(|s| s.parse().ok())
                .unwrap_or(30000),
            max_retries: env::var("MAX_RETRIES")
                .ok()
                .and_then(|s| s.parse().ok())
                .unwrap_or(3),
            retry_delay_ms: env::var("RETRY_DELAY_MS")
                .ok()
                .and_then(|s| s.parse().ok())
                .unwrap_or(1000),
        };

        let flow = FlowConfig {
            catalog_path: env::var("FLOW_CATALOG_PATH").ok().map(PathBuf::from),
            transition_limit: env::var("TRANSITION_LIMIT")
                .ok()
                .and_then(|s| s.parse().ok())
                .filter(|limit: &i64| *limit > 0)
                .unwrap_or(5),
        };

        Ok(Config {
            database,
            transport,
            logging,
            request,
            flow,
        })
    }
}

impl Default for RequestConfig {
    fn default() -> Self {
        Self {
            timeout_ms: 30000,
            max_retries: 3,
            retry_delay_ms: 1000,
        }
    }
}

impl Default for FlowConfig {
    fn default() -> Self {
        Self {
            catalog_path: None,
            transition_limit: 5,
        }
    }
}
