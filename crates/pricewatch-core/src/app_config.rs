use std::path::PathBuf;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Environment {
    Development,
    Test,
    Production,
}

impl std::fmt::Display for Environment {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Environment::Development => write!(f, "development"),
            Environment::Test => write!(f, "test"),
            Environment::Production => write!(f, "production"),
        }
    }
}

/// Residential proxy endpoint used by the geo-targeted fetch tier.
///
/// The username is expanded per region from `username_template`, which may
/// contain `{username}` and `{region}` placeholders.
#[derive(Clone)]
pub struct ProxySettings {
    pub host: String,
    pub port: u16,
    pub username: String,
    pub password: String,
    pub username_template: String,
}

impl ProxySettings {
    /// Proxy username pinned to `region` (a canonical code, lowercased here).
    #[must_use]
    pub fn username_for(&self, region: &str) -> String {
        self.username_template
            .replace("{username}", &self.username)
            .replace("{region}", &region.to_ascii_lowercase())
    }

    /// `scheme://host:port` form suitable for `--proxy-server`.
    #[must_use]
    pub fn server(&self) -> String {
        format!("http://{}:{}", self.host, self.port)
    }
}

impl std::fmt::Debug for ProxySettings {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProxySettings")
            .field("host", &self.host)
            .field("port", &self.port)
            .field("username", &self.username)
            .field("password", &"[redacted]")
            .field("username_template", &self.username_template)
            .finish()
    }
}

#[derive(Clone)]
pub struct AppConfig {
    pub env: Environment,
    pub log_level: String,
    pub products_path: PathBuf,
    pub regions_path: PathBuf,
    pub logs_dir: PathBuf,
    pub database_url: Option<String>,
    pub db_max_connections: u32,
    pub db_min_connections: u32,
    pub db_acquire_timeout_secs: u64,
    pub request_timeout_secs: u64,
    pub user_agent: String,
    pub max_retries: u32,
    pub retry_backoff_base_ms: u64,
    pub region_delay_min_ms: u64,
    pub region_delay_max_ms: u64,
    pub product_delay_ms: u64,
    pub challenge_poll_ms: u64,
    pub challenge_max_wait_secs: u64,
    pub challenge_visible_max_wait_secs: u64,
    pub price_wait_secs: u64,
    pub nav_timeout_secs: u64,
    pub chrome_path: Option<PathBuf>,
    pub proxy: Option<ProxySettings>,
    pub openai_api_key: Option<String>,
    pub vision_model: String,
    pub vision_url: String,
    pub vision_timeout_secs: u64,
    pub fallback_currency: String,
    pub region_strict: bool,
}

impl std::fmt::Debug for AppConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AppConfig")
            .field("env", &self.env)
            .field("log_level", &self.log_level)
            .field("products_path", &self.products_path)
            .field("regions_path", &self.regions_path)
            .field("logs_dir", &self.logs_dir)
            .field(
                "database_url",
                &self.database_url.as_ref().map(|_| "[redacted]"),
            )
            .field("db_max_connections", &self.db_max_connections)
            .field("db_min_connections", &self.db_min_connections)
            .field("db_acquire_timeout_secs", &self.db_acquire_timeout_secs)
            .field("request_timeout_secs", &self.request_timeout_secs)
            .field("user_agent", &self.user_agent)
            .field("max_retries", &self.max_retries)
            .field("retry_backoff_base_ms", &self.retry_backoff_base_ms)
            .field("region_delay_min_ms", &self.region_delay_min_ms)
            .field("region_delay_max_ms", &self.region_delay_max_ms)
            .field("product_delay_ms", &self.product_delay_ms)
            .field("challenge_poll_ms", &self.challenge_poll_ms)
            .field("challenge_max_wait_secs", &self.challenge_max_wait_secs)
            .field(
                "challenge_visible_max_wait_secs",
                &self.challenge_visible_max_wait_secs,
            )
            .field("price_wait_secs", &self.price_wait_secs)
            .field("nav_timeout_secs", &self.nav_timeout_secs)
            .field("chrome_path", &self.chrome_path)
            .field("proxy", &self.proxy)
            .field(
                "openai_api_key",
                &self.openai_api_key.as_ref().map(|_| "[redacted]"),
            )
            .field("vision_model", &self.vision_model)
            .field("vision_url", &self.vision_url)
            .field("vision_timeout_secs", &self.vision_timeout_secs)
            .field("fallback_currency", &self.fallback_currency)
            .field("region_strict", &self.region_strict)
            .finish()
    }
}
