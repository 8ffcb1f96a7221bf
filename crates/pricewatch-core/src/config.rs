use std::path::PathBuf;

use crate::app_config::{AppConfig, Environment, ProxySettings};
use crate::ConfigError;

pub const DEFAULT_USER_AGENT: &str = "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/124.0.0.0 Safari/537.36";

/// Load application configuration from environment variables.
///
/// Calls `dotenvy::dotenv().ok()` to load `.env` files before reading env vars.
///
/// # Errors
///
/// Returns `ConfigError` if a value is present but invalid.
pub fn load_app_config() -> Result<AppConfig, ConfigError> {
    dotenvy::dotenv().ok();
    load_app_config_from_env()
}

/// Load application configuration from environment variables already in the process.
///
/// Unlike [`load_app_config`], this does NOT load `.env` files.
///
/// # Errors
///
/// Returns `ConfigError` if a value is present but invalid.
pub fn load_app_config_from_env() -> Result<AppConfig, ConfigError> {
    build_app_config(|key| std::env::var(key))
}

/// Build application configuration using the provided env-var lookup function.
///
/// Every variable has a default; only malformed values are errors. Secrets
/// (database URL, proxy credentials, vision API key) are optional and switch
/// the corresponding capability off when absent.
fn build_app_config<F>(lookup: F) -> Result<AppConfig, ConfigError>
where
    F: Fn(&str) -> Result<String, std::env::VarError>,
{
    let or_default = |var: &str, default: &str| -> String {
        lookup(var).unwrap_or_else(|_| default.to_string())
    };

    let optional = |var: &str| -> Option<String> {
        lookup(var)
            .ok()
            .map(|v| v.trim().to_string())
            .filter(|v| !v.is_empty())
    };

    let invalid = |var: &str, reason: String| ConfigError::InvalidEnvVar {
        var: var.to_string(),
        reason,
    };

    let parse_u16 = |var: &str, default: &str| -> Result<u16, ConfigError> {
        let raw = or_default(var, default);
        raw.parse::<u16>().map_err(|e| invalid(var, e.to_string()))
    };

    let parse_u32 = |var: &str, default: &str| -> Result<u32, ConfigError> {
        let raw = or_default(var, default);
        raw.parse::<u32>().map_err(|e| invalid(var, e.to_string()))
    };

    let parse_u64 = |var: &str, default: &str| -> Result<u64, ConfigError> {
        let raw = or_default(var, default);
        raw.parse::<u64>().map_err(|e| invalid(var, e.to_string()))
    };

    let parse_bool = |var: &str, default: bool| -> Result<bool, ConfigError> {
        match lookup(var) {
            Err(_) => Ok(default),
            Ok(raw) => match raw.trim().to_ascii_lowercase().as_str() {
                "1" | "true" | "yes" | "on" => Ok(true),
                "0" | "false" | "no" | "off" | "" => Ok(false),
                other => Err(invalid(var, format!("expected a boolean, got '{other}'"))),
            },
        }
    };

    let env = parse_environment(&or_default("PRICEWATCH_ENV", "development"))
        .map_err(|reason| invalid("PRICEWATCH_ENV", reason))?;
    let log_level = or_default("PRICEWATCH_LOG_LEVEL", "info");
    let products_path = PathBuf::from(or_default(
        "PRICEWATCH_PRODUCTS_PATH",
        "./config/products.yaml",
    ));
    let regions_path = PathBuf::from(or_default(
        "PRICEWATCH_REGIONS_PATH",
        "./config/regions.yaml",
    ));
    let logs_dir = PathBuf::from(or_default("PRICEWATCH_LOGS_DIR", "./logs"));
    let database_url = optional("DATABASE_URL");

    let db_max_connections = parse_u32("PRICEWATCH_DB_MAX_CONNECTIONS", "5")?;
    let db_min_connections = parse_u32("PRICEWATCH_DB_MIN_CONNECTIONS", "1")?;
    let db_acquire_timeout_secs = parse_u64("PRICEWATCH_DB_ACQUIRE_TIMEOUT_SECS", "10")?;

    let request_timeout_secs = parse_u64("PRICEWATCH_REQUEST_TIMEOUT_SECS", "30")?;
    let user_agent = or_default("PRICEWATCH_USER_AGENT", DEFAULT_USER_AGENT);
    let max_retries = parse_u32("PRICEWATCH_MAX_RETRIES", "3")?;
    let retry_backoff_base_ms = parse_u64("PRICEWATCH_RETRY_BACKOFF_BASE_MS", "1000")?;

    let region_delay_min_ms = parse_u64("PRICEWATCH_REGION_DELAY_MIN_MS", "3000")?;
    let region_delay_max_ms = parse_u64("PRICEWATCH_REGION_DELAY_MAX_MS", "7000")?;
    if region_delay_max_ms < region_delay_min_ms {
        return Err(invalid(
            "PRICEWATCH_REGION_DELAY_MAX_MS",
            format!("must be >= PRICEWATCH_REGION_DELAY_MIN_MS ({region_delay_min_ms})"),
        ));
    }
    let product_delay_ms = parse_u64("PRICEWATCH_PRODUCT_DELAY_MS", "2000")?;

    let challenge_poll_ms = parse_u64("PRICEWATCH_CHALLENGE_POLL_MS", "2000")?;
    if challenge_poll_ms == 0 {
        return Err(invalid(
            "PRICEWATCH_CHALLENGE_POLL_MS",
            "must be greater than zero".to_string(),
        ));
    }
    let challenge_max_wait_secs = parse_u64("PRICEWATCH_CHALLENGE_MAX_WAIT_SECS", "60")?;
    let challenge_visible_max_wait_secs =
        parse_u64("PRICEWATCH_CHALLENGE_VISIBLE_MAX_WAIT_SECS", "90")?;
    let price_wait_secs = parse_u64("PRICEWATCH_PRICE_WAIT_SECS", "20")?;
    let nav_timeout_secs = parse_u64("PRICEWATCH_NAV_TIMEOUT_SECS", "60")?;
    let chrome_path = optional("PRICEWATCH_CHROME_PATH").map(PathBuf::from);

    let proxy = match (
        optional("PRICEWATCH_PROXY_USERNAME"),
        optional("PRICEWATCH_PROXY_PASSWORD"),
    ) {
        (Some(username), Some(password)) => Some(ProxySettings {
            host: or_default("PRICEWATCH_PROXY_HOST", "premium-residential.geonode.com"),
            port: parse_u16("PRICEWATCH_PROXY_PORT", "9000")?,
            username,
            password,
            username_template: or_default(
                "PRICEWATCH_PROXY_USERNAME_TEMPLATE",
                "{username}-country-{region}",
            ),
        }),
        (Some(_), None) => {
            return Err(ConfigError::MissingEnvVar(
                "PRICEWATCH_PROXY_PASSWORD".to_string(),
            ))
        }
        (None, Some(_)) => {
            return Err(ConfigError::MissingEnvVar(
                "PRICEWATCH_PROXY_USERNAME".to_string(),
            ))
        }
        (None, None) => None,
    };

    let openai_api_key = optional("OPENAI_API_KEY");
    let vision_model = or_default("PRICEWATCH_VISION_MODEL", "gpt-4o-mini");
    let vision_url = or_default(
        "PRICEWATCH_VISION_URL",
        "https://api.openai.com/v1/chat/completions",
    );
    let vision_timeout_secs = parse_u64("PRICEWATCH_VISION_TIMEOUT_SECS", "60")?;

    let fallback_currency = or_default("PRICEWATCH_FALLBACK_CURRENCY", "USD").to_uppercase();
    if fallback_currency.len() != 3 || !fallback_currency.chars().all(|c| c.is_ascii_alphabetic())
    {
        return Err(invalid(
            "PRICEWATCH_FALLBACK_CURRENCY",
            format!("expected a 3-letter currency code, got '{fallback_currency}'"),
        ));
    }
    let region_strict = parse_bool("PRICEWATCH_REGION_STRICT", false)?;

    Ok(AppConfig {
        env,
        log_level,
        products_path,
        regions_path,
        logs_dir,
        database_url,
        db_max_connections,
        db_min_connections,
        db_acquire_timeout_secs,
        request_timeout_secs,
        user_agent,
        max_retries,
        retry_backoff_base_ms,
        region_delay_min_ms,
        region_delay_max_ms,
        product_delay_ms,
        challenge_poll_ms,
        challenge_max_wait_secs,
        challenge_visible_max_wait_secs,
        price_wait_secs,
        nav_timeout_secs,
        chrome_path,
        proxy,
        openai_api_key,
        vision_model,
        vision_url,
        vision_timeout_secs,
        fallback_currency,
        region_strict,
    })
}

/// Parse a string into an `Environment` variant.
fn parse_environment(s: &str) -> Result<Environment, String> {
    match s {
        "development" => Ok(Environment::Development),
        "test" => Ok(Environment::Test),
        "production" => Ok(Environment::Production),
        other => Err(format!(
            "unknown environment '{other}'; expected development, test, or production"
        )),
    }
}

#[cfg(test)]
#[path = "config_test.rs"]
mod tests;
