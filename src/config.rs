use std::env;

/// Placeholder secret shipped as the default; production deployments must
/// override it. Mirrors `config.py`'s `Settings.jwt_secret` default.
const DEFAULT_JWT_SECRET: &str = "your-secret-key-change-in-production";
const MIN_PRODUCTION_SECRET_LEN: usize = 32;

#[derive(Debug, Clone)]
pub struct Config {
    pub host: String,
    pub port: u16,
    pub environment: String,
    pub jwt_secret: String,
    pub jwt_algorithm: String,
    pub jwt_expiration_hours: i64,
    pub database_url: Option<String>,
    pub database_pool_min: u32,
    pub database_pool_max: u32,
    pub redis_url: Option<String>,
    pub redis_channel_prefix: String,
    pub cors_origins: Vec<String>,
    pub auth_required: bool,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: 8080,
            environment: "development".to_string(),
            jwt_secret: DEFAULT_JWT_SECRET.to_string(),
            jwt_algorithm: "HS256".to_string(),
            jwt_expiration_hours: 24,
            database_url: None,
            database_pool_min: 2,
            database_pool_max: 10,
            redis_url: None,
            redis_channel_prefix: "synckit".to_string(),
            cors_origins: vec!["*".to_string()],
            auth_required: true,
        }
    }
}

impl Config {
    /// Loads configuration from the environment, falling back to the same
    /// defaults as the Python reference's `Settings`.
    #[must_use]
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            host: env::var("HOST").unwrap_or(defaults.host),
            port: env::var("PORT")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(defaults.port),
            environment: env::var("ENVIRONMENT").unwrap_or(defaults.environment),
            jwt_secret: env::var("JWT_SECRET").unwrap_or(defaults.jwt_secret),
            jwt_algorithm: env::var("JWT_ALGORITHM").unwrap_or(defaults.jwt_algorithm),
            jwt_expiration_hours: env::var("JWT_EXPIRATION_HOURS")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(defaults.jwt_expiration_hours),
            database_url: env::var("DATABASE_URL").ok().filter(|s| !s.is_empty()),
            database_pool_min: env::var("DATABASE_POOL_MIN")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(defaults.database_pool_min),
            database_pool_max: env::var("DATABASE_POOL_MAX")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(defaults.database_pool_max),
            redis_url: env::var("REDIS_URL").ok().filter(|s| !s.is_empty()),
            redis_channel_prefix: env::var("REDIS_CHANNEL_PREFIX")
                .unwrap_or(defaults.redis_channel_prefix),
            cors_origins: env::var("CORS_ORIGINS")
                .ok()
                .map(|v| v.split(',').map(|s| s.trim().to_string()).collect())
                .unwrap_or(defaults.cors_origins),
            auth_required: env::var("SYNCKIT_AUTH_REQUIRED")
                .ok()
                .map(|v| v != "false")
                .unwrap_or(defaults.auth_required),
        }
    }

    #[must_use]
    pub fn is_production(&self) -> bool {
        self.environment == "production"
    }

    /// Fails startup on a production deployment with the default secret or
    /// one shorter than 32 bytes; warns (but proceeds) outside production.
    pub fn validate_jwt_secret(&self) {
        if self.is_production() {
            assert!(
                self.jwt_secret != DEFAULT_JWT_SECRET,
                "JWT_SECRET must be overridden in production"
            );
            assert!(
                self.jwt_secret.len() >= MIN_PRODUCTION_SECRET_LEN,
                "JWT_SECRET must be at least {MIN_PRODUCTION_SECRET_LEN} bytes in production"
            );
        } else if self.jwt_secret == DEFAULT_JWT_SECRET
            || self.jwt_secret.len() < MIN_PRODUCTION_SECRET_LEN
        {
            tracing::warn!("JWT_SECRET is weak or default; this is only acceptable outside production");
        }
    }

    #[must_use]
    pub fn storage_enabled(&self) -> bool {
        self.database_url.is_some()
    }

    #[must_use]
    pub fn pubsub_enabled(&self) -> bool {
        self.redis_url.is_some()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_the_documented_table() {
        let cfg = Config::default();
        assert_eq!(cfg.host, "0.0.0.0");
        assert_eq!(cfg.port, 8080);
        assert_eq!(cfg.environment, "development");
        assert_eq!(cfg.jwt_algorithm, "HS256");
        assert_eq!(cfg.jwt_expiration_hours, 24);
        assert_eq!(cfg.database_pool_min, 2);
        assert_eq!(cfg.database_pool_max, 10);
        assert_eq!(cfg.redis_channel_prefix, "synckit");
        assert_eq!(cfg.cors_origins, vec!["*".to_string()]);
        assert!(cfg.auth_required);
    }

    #[test]
    #[should_panic(expected = "must be overridden")]
    fn production_with_default_secret_panics() {
        let mut cfg = Config::default();
        cfg.environment = "production".to_string();
        cfg.validate_jwt_secret();
    }

    #[test]
    #[should_panic(expected = "at least 32 bytes")]
    fn production_with_short_secret_panics() {
        let mut cfg = Config::default();
        cfg.environment = "production".to_string();
        cfg.jwt_secret = "short".to_string();
        cfg.validate_jwt_secret();
    }

    #[test]
    fn development_with_weak_secret_only_warns() {
        let cfg = Config::default();
        cfg.validate_jwt_secret();
    }

    #[test]
    fn storage_and_pubsub_disabled_without_urls() {
        let cfg = Config::default();
        assert!(!cfg.storage_enabled());
        assert!(!cfg.pubsub_enabled());
    }
}
