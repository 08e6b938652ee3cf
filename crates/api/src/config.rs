//! API server configuration

use std::net::SocketAddr;

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("{0} must be set")]
    Missing(&'static str),
    #[error("{name} is invalid: {value}")]
    Invalid { name: &'static str, value: String },
}

/// Image generation provider settings
#[derive(Debug, Clone)]
pub struct GenerationConfig {
    pub api_token: String,
    pub api_base: String,
    pub model_version: String,
}

#[derive(Debug, Clone)]
pub struct Config {
    pub database_url: String,
    pub bind_address: SocketAddr,
    pub jwt_secret: String,
    pub jwt_expiry_hours: i64,
    /// Origins allowed by CORS. Empty allows any origin.
    pub allowed_origins: Vec<String>,
    pub run_migrations: bool,
    pub log_json: bool,
    pub generation: GenerationConfig,
}

fn required(name: &'static str) -> Result<String, ConfigError> {
    std::env::var(name)
        .ok()
        .filter(|v| !v.trim().is_empty())
        .ok_or(ConfigError::Missing(name))
}

fn parse_or<T: std::str::FromStr>(name: &'static str, default: T) -> Result<T, ConfigError> {
    match std::env::var(name) {
        Ok(value) => value.trim().parse().map_err(|_| ConfigError::Invalid { name, value }),
        Err(_) => Ok(default),
    }
}

fn flag(name: &'static str, default: bool) -> Result<bool, ConfigError> {
    match std::env::var(name) {
        Ok(value) => match value.trim().to_ascii_lowercase().as_str() {
            "1" | "true" | "yes" | "on" => Ok(true),
            "0" | "false" | "no" | "off" => Ok(false),
            _ => Err(ConfigError::Invalid { name, value }),
        },
        Err(_) => Ok(default),
    }
}

impl Config {
    pub fn from_env() -> Result<Self, ConfigError> {
        let jwt_secret = required("JWT_SECRET")?;
        if jwt_secret.len() < 32 {
            return Err(ConfigError::Invalid {
                name: "JWT_SECRET",
                value: "must be at least 32 characters".to_string(),
            });
        }

        let allowed_origins = std::env::var("ALLOWED_ORIGINS")
            .unwrap_or_default()
            .split(',')
            .map(str::trim)
            .filter(|o| !o.is_empty())
            .map(String::from)
            .collect();

        Ok(Self {
            database_url: required("DATABASE_URL")?,
            bind_address: parse_or("BIND_ADDRESS", SocketAddr::from(([0, 0, 0, 0], 8080)))?,
            jwt_secret,
            jwt_expiry_hours: parse_or("JWT_EXPIRY_HOURS", 24)?,
            allowed_origins,
            run_migrations: flag("RUN_MIGRATIONS", true)?,
            log_json: std::env::var("LOG_FORMAT")
                .map(|v| v.eq_ignore_ascii_case("json"))
                .unwrap_or(false),
            generation: GenerationConfig {
                api_token: required("REPLICATE_API_TOKEN")?,
                api_base: std::env::var("REPLICATE_API_BASE")
                    .unwrap_or_else(|_| "https://api.replicate.com".to_string()),
                model_version: required("REPLICATE_MODEL_VERSION")?,
            },
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serial_test::serial;

    const VARS: &[&str] = &[
        "DATABASE_URL",
        "BIND_ADDRESS",
        "JWT_SECRET",
        "JWT_EXPIRY_HOURS",
        "ALLOWED_ORIGINS",
        "RUN_MIGRATIONS",
        "LOG_FORMAT",
        "REPLICATE_API_TOKEN",
        "REPLICATE_API_BASE",
        "REPLICATE_MODEL_VERSION",
    ];

    fn clear() {
        for var in VARS {
            std::env::remove_var(var);
        }
    }

    fn set_required() {
        std::env::set_var("DATABASE_URL", "postgres://localhost/mindcanvas");
        std::env::set_var("JWT_SECRET", "0123456789abcdef0123456789abcdef");
        std::env::set_var("REPLICATE_API_TOKEN", "r8_test");
        std::env::set_var("REPLICATE_MODEL_VERSION", "sdxl-v1");
    }

    #[test]
    #[serial]
    fn test_defaults_applied() {
        clear();
        set_required();

        let config = Config::from_env().unwrap();
        assert_eq!(config.bind_address.port(), 8080);
        assert_eq!(config.jwt_expiry_hours, 24);
        assert!(config.allowed_origins.is_empty());
        assert!(config.run_migrations);
        assert!(!config.log_json);
        assert_eq!(config.generation.api_base, "https://api.replicate.com");
        clear();
    }

    #[test]
    #[serial]
    fn test_missing_database_url() {
        clear();
        set_required();
        std::env::remove_var("DATABASE_URL");

        assert!(matches!(
            Config::from_env(),
            Err(ConfigError::Missing("DATABASE_URL"))
        ));
        clear();
    }

    #[test]
    #[serial]
    fn test_short_jwt_secret_rejected() {
        clear();
        set_required();
        std::env::set_var("JWT_SECRET", "short");

        assert!(matches!(
            Config::from_env(),
            Err(ConfigError::Invalid { name: "JWT_SECRET", .. })
        ));
        clear();
    }

    #[test]
    #[serial]
    fn test_origins_and_flags_parsed() {
        clear();
        set_required();
        std::env::set_var("ALLOWED_ORIGINS", "https://a.example, https://b.example,");
        std::env::set_var("RUN_MIGRATIONS", "false");
        std::env::set_var("LOG_FORMAT", "JSON");
        std::env::set_var("BIND_ADDRESS", "127.0.0.1:9000");

        let config = Config::from_env().unwrap();
        assert_eq!(
            config.allowed_origins,
            vec!["https://a.example".to_string(), "https://b.example".to_string()]
        );
        assert!(!config.run_migrations);
        assert!(config.log_json);
        assert_eq!(config.bind_address.port(), 9000);

        std::env::set_var("RUN_MIGRATIONS", "maybe");
        assert!(matches!(
            Config::from_env(),
            Err(ConfigError::Invalid { name: "RUN_MIGRATIONS", .. })
        ));
        clear();
    }
}
