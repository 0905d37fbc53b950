use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

use thiserror::Error;

/// Application-level constants
pub const APP_NAME: &str = "PharmAssist";
pub const APP_VERSION: &str = env!("CARGO_PKG_VERSION");

const DEFAULT_BIND: &str = "127.0.0.1:8000";
const DEFAULT_MODEL_NAME: &str = "medgemma";

/// Default tracing filter when `RUST_LOG` is unset.
pub fn default_log_filter() -> &'static str {
    "pharmassist_lib=info,pharmassist=info,tower_http=warn"
}

/// Get the application data directory.
/// Falls back to the working directory when no home is available (containers).
pub fn default_data_dir() -> PathBuf {
    dirs::data_local_dir()
        .or_else(dirs::home_dir)
        .map(|d| d.join(APP_NAME))
        .unwrap_or_else(|| PathBuf::from(".").join(APP_NAME))
}

/// Default SQLite database path inside the data directory.
pub fn default_db_path() -> PathBuf {
    default_data_dir().join("pharmassist.db")
}

#[derive(Error, Debug, PartialEq, Eq)]
pub enum ConfigError {
    #[error("PHARMASSIST_REQUIRE_API_KEY is set but {0} is missing")]
    MissingSecret(&'static str),
    #[error("Invalid bind address: {0}")]
    InvalidBind(String),
}

// ═══════════════════════════════════════════════════════════
// Security settings
// ═══════════════════════════════════════════════════════════

/// Shared secrets and admin throttling.
///
/// A `None` secret means the matching routes run in loopback-fallback
/// mode: only same-host callers without proxy headers are admitted.
#[derive(Debug, Clone)]
pub struct SecurityConfig {
    pub api_key: Option<String>,
    pub admin_api_key: Option<String>,
    /// When set, loopback fallback is disabled and both secrets are mandatory.
    pub require_api_key: bool,
    pub admin_rate_limit_max: u32,
    pub admin_rate_limit_window: Duration,
    pub stream_token_ttl: Duration,
}

impl Default for SecurityConfig {
    fn default() -> Self {
        Self {
            api_key: None,
            admin_api_key: None,
            require_api_key: false,
            admin_rate_limit_max: 60,
            admin_rate_limit_window: Duration::from_secs(60),
            stream_token_ttl: Duration::from_secs(60),
        }
    }
}

/// Prescription upload limits.
#[derive(Debug, Clone, Copy)]
pub struct UploadLimits {
    pub max_bytes: usize,
    pub max_pages: usize,
    pub extract_timeout: Duration,
}

impl Default for UploadLimits {
    fn default() -> Self {
        Self {
            max_bytes: 5_000_000,
            max_pages: 200,
            extract_timeout: Duration::from_millis(4_000),
        }
    }
}

/// Model server settings. `url = None` keeps every step deterministic.
#[derive(Debug, Clone)]
pub struct ModelConfig {
    pub url: Option<String>,
    pub model: String,
    pub timeout: Duration,
}

impl Default for ModelConfig {
    fn default() -> Self {
        Self {
            url: None,
            model: DEFAULT_MODEL_NAME.to_string(),
            timeout: Duration::from_secs(20),
        }
    }
}

// ═══════════════════════════════════════════════════════════
// AppConfig
// ═══════════════════════════════════════════════════════════

#[derive(Debug, Clone)]
pub struct AppConfig {
    pub bind: SocketAddr,
    pub db_path: PathBuf,
    pub security: SecurityConfig,
    pub uploads: UploadLimits,
    pub model: ModelConfig,
}

impl AppConfig {
    /// Read configuration from the process environment.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build configuration from an arbitrary key lookup.
    ///
    /// Malformed numbers fall back to defaults, out-of-range numbers are
    /// clamped. A missing secret is only fatal when
    /// `PHARMASSIST_REQUIRE_API_KEY=1`.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |key: &str| {
            lookup(key)
                .map(|v| v.trim().to_string())
                .filter(|v| !v.is_empty())
        };

        let bind_raw = get("PHARMASSIST_BIND").unwrap_or_else(|| DEFAULT_BIND.to_string());
        let bind: SocketAddr = bind_raw
            .parse()
            .map_err(|_| ConfigError::InvalidBind(bind_raw.clone()))?;

        let db_path = get("PHARMASSIST_DB_PATH")
            .map(PathBuf::from)
            .unwrap_or_else(default_db_path);

        let security = SecurityConfig {
            api_key: get("PHARMASSIST_API_KEY"),
            admin_api_key: get("PHARMASSIST_ADMIN_API_KEY"),
            require_api_key: get("PHARMASSIST_REQUIRE_API_KEY").as_deref() == Some("1"),
            admin_rate_limit_max: clamp_u64(
                get("PHARMASSIST_ADMIN_RATE_LIMIT_MAX").as_deref(),
                60,
                1,
                10_000,
            ) as u32,
            admin_rate_limit_window: Duration::from_secs(clamp_u64(
                get("PHARMASSIST_ADMIN_RATE_LIMIT_WINDOW_SEC").as_deref(),
                60,
                1,
                86_400,
            )),
            stream_token_ttl: Duration::from_secs(clamp_u64(
                get("PHARMASSIST_STREAM_TOKEN_TTL_SEC").as_deref(),
                60,
                5,
                600,
            )),
        };

        if security.require_api_key {
            if security.api_key.is_none() {
                return Err(ConfigError::MissingSecret("PHARMASSIST_API_KEY"));
            }
            if security.admin_api_key.is_none() {
                return Err(ConfigError::MissingSecret("PHARMASSIST_ADMIN_API_KEY"));
            }
        }

        let uploads = UploadLimits {
            max_bytes: clamp_u64(
                get("PHARMASSIST_MAX_PRESCRIPTION_UPLOAD_BYTES").as_deref(),
                5_000_000,
                64_000,
                20_000_000,
            ) as usize,
            max_pages: clamp_u64(
                get("PHARMASSIST_MAX_PRESCRIPTION_PAGES").as_deref(),
                200,
                1,
                500,
            ) as usize,
            extract_timeout: Duration::from_secs_f64(clamp_f64(
                get("PHARMASSIST_MAX_PRESCRIPTION_EXTRACT_SEC").as_deref(),
                4.0,
                0.2,
                30.0,
            )),
        };

        let model = ModelConfig {
            url: get("PHARMASSIST_MODEL_URL"),
            model: get("PHARMASSIST_MODEL_NAME").unwrap_or_else(|| DEFAULT_MODEL_NAME.to_string()),
            timeout: Duration::from_secs(clamp_u64(
                get("PHARMASSIST_MODEL_TIMEOUT_SEC").as_deref(),
                20,
                1,
                300,
            )),
        };

        Ok(Self {
            bind,
            db_path,
            security,
            uploads,
            model,
        })
    }

    /// Configuration for tests and embedding: defaults, explicit DB path.
    pub fn with_db_path(db_path: PathBuf) -> Self {
        Self {
            bind: SocketAddr::from(([127, 0, 0, 1], 0)),
            db_path,
            security: SecurityConfig::default(),
            uploads: UploadLimits::default(),
            model: ModelConfig::default(),
        }
    }
}

fn clamp_u64(raw: Option<&str>, default: u64, min: u64, max: u64) -> u64 {
    raw.and_then(|v| v.parse::<u64>().ok())
        .map(|v| v.clamp(min, max))
        .unwrap_or(default)
}

fn clamp_f64(raw: Option<&str>, default: f64, min: f64, max: f64) -> f64 {
    raw.and_then(|v| v.parse::<f64>().ok())
        .filter(|v| v.is_finite())
        .map(|v| v.clamp(min, max))
        .unwrap_or(default)
}
