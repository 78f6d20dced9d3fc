use anyhow::{Context, Result};
use std::{env, path::PathBuf, sync::OnceLock, time::Duration};

/// Application configuration loaded and validated at startup
#[derive(Clone, Debug)]
pub struct AppConfig {
    /// Backend REST API configuration
    pub api: ApiConfig,

    /// Real-time event channel configuration
    pub socket: SocketConfig,

    /// Local persistence paths (token store, alert cache)
    pub paths: PathConfig,

    /// Reconciler view tuning
    pub views: ViewConfig,
}

#[derive(Clone, Debug)]
pub struct ApiConfig {
    pub base_url: String,
    pub request_timeout: Duration,
}

#[derive(Clone, Debug)]
pub struct SocketConfig {
    pub url: String,
    pub connect_timeout: Duration,
    pub max_reconnect_attempts: u32,
    pub reconnect_delay: Duration,
}

#[derive(Clone, Debug)]
pub struct PathConfig {
    pub data_dir: PathBuf,
    pub session_file: PathBuf,
    pub alerts_file: PathBuf,
}

#[derive(Clone, Debug)]
pub struct ViewConfig {
    pub queue_limit: usize,
    pub alert_limit: usize,
}

impl AppConfig {
    /// Get or load the application configuration
    ///
    /// Returns a reference to the cached configuration. On first call, it loads
    /// and validates all configuration from environment variables. Subsequent
    /// calls return the cached instance.
    ///
    /// # Panics
    /// Panics if configuration loading fails. This is intentional as the
    /// application cannot function without valid configuration.
    pub fn get() -> &'static Self {
        static APP_CONFIG: OnceLock<AppConfig> = OnceLock::new();
        APP_CONFIG.get_or_init(|| {
            Self::load().expect("failed to load application configuration")
        })
    }

    /// Load and validate all configuration from environment variables
    ///
    /// Every variable has a local-development default, matching the backend's
    /// dev deployment on localhost:4000.
    pub fn load() -> Result<Self> {
        Ok(Self {
            api: ApiConfig::load()?,
            socket: SocketConfig::load()?,
            paths: PathConfig::load()?,
            views: ViewConfig::load()?,
        })
    }
}

impl ApiConfig {
    fn load() -> Result<Self> {
        let base_url =
            env::var("PNC_API_BASE_URL").unwrap_or_else(|_| "http://localhost:4000".to_string());

        let request_timeout = env::var("PNC_REQUEST_TIMEOUT_SECS")
            .unwrap_or_else(|_| "10".to_string())
            .parse::<u64>()
            .context("failed to parse PNC_REQUEST_TIMEOUT_SECS: invalid format")?;

        Ok(Self {
            base_url: base_url.trim_end_matches('/').to_string(),
            request_timeout: Duration::from_secs(request_timeout),
        })
    }
}

impl SocketConfig {
    fn load() -> Result<Self> {
        let url =
            env::var("PNC_WS_URL").unwrap_or_else(|_| "ws://localhost:4000/socket".to_string());

        let connect_timeout = env::var("PNC_WS_CONNECT_TIMEOUT_SECS")
            .unwrap_or_else(|_| "10".to_string())
            .parse::<u64>()
            .context("failed to parse PNC_WS_CONNECT_TIMEOUT_SECS: invalid format")?;

        let max_reconnect_attempts = env::var("PNC_WS_MAX_RECONNECT_ATTEMPTS")
            .unwrap_or_else(|_| "5".to_string())
            .parse::<u32>()
            .context("failed to parse PNC_WS_MAX_RECONNECT_ATTEMPTS: invalid format")?;

        Ok(Self {
            url,
            connect_timeout: Duration::from_secs(connect_timeout),
            max_reconnect_attempts,
            reconnect_delay: Duration::from_secs(1),
        })
    }
}

impl PathConfig {
    fn load() -> Result<Self> {
        let data_dir = env::var("PNC_DATA_DIR")
            .map(PathBuf::from)
            .unwrap_or_else(|_| Self::default_data_dir());

        std::fs::create_dir_all(&data_dir).context("failed to create data directory")?;

        let session_file = data_dir.join("session.json");
        let alerts_file = data_dir.join("alerts.json");

        Ok(Self {
            data_dir,
            session_file,
            alerts_file,
        })
    }

    #[cfg(not(any(test, feature = "mock")))]
    fn default_data_dir() -> PathBuf {
        PathBuf::from(format!("/var/lib/{}/", env!("CARGO_PKG_NAME")))
    }

    // In test mode, use temp directory as default to avoid /var/lib requirement
    #[cfg(any(test, feature = "mock"))]
    fn default_data_dir() -> PathBuf {
        std::env::temp_dir().join("pnc-ops-console-test")
    }
}

impl ViewConfig {
    fn load() -> Result<Self> {
        let queue_limit = env::var("PNC_QUEUE_LIMIT")
            .unwrap_or_else(|_| "10".to_string())
            .parse::<usize>()
            .context("failed to parse PNC_QUEUE_LIMIT: invalid format")?;

        let alert_limit = env::var("PNC_ALERT_LIMIT")
            .unwrap_or_else(|_| "50".to_string())
            .parse::<usize>()
            .context("failed to parse PNC_ALERT_LIMIT: invalid format")?;

        Ok(Self {
            queue_limit,
            alert_limit,
        })
    }
}
