/// Configuration management for the onboardflow service
///
/// Handles server binding, storage location, token verification and the tuning
/// knobs of the real-time layer. Every value can be overridden by environment.

use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// Main application configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Server configuration
    pub server: ServerConfig,
    /// Database configuration
    pub database: DatabaseConfig,
    /// Bearer token verification
    pub auth: AuthConfig,
    /// Invite grants
    pub access: AccessConfig,
    /// Live channels and background notifications
    pub realtime: RealtimeConfig,
}

/// HTTP server configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    /// Server bind address (e.g., "0.0.0.0")
    pub host: String,
    /// Server port number
    pub port: u16,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DatabaseConfig {
    /// Directory holding onboardflow.db (default: "data")
    pub data_dir: String,
}

impl DatabaseConfig {
    pub fn database_path(&self) -> PathBuf {
        PathBuf::from(&self.data_dir).join("onboardflow.db")
    }
}

#[derive(Clone, Serialize, Deserialize)]
pub struct AuthConfig {
    /// HS256 signing secret
    pub jwt_secret: String,
}

impl std::fmt::Debug for AuthConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AuthConfig").field("jwt_secret", &"<redacted>").finish()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AccessConfig {
    /// Validity window of a fresh invite grant
    pub grant_ttl_hours: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RealtimeConfig {
    /// Outbound queue capacity per live channel
    pub channel_buffer: usize,
    /// Cron expression (with seconds) for the deadline sweep
    pub deadline_schedule: String,
    /// Announce steps due within this many days
    pub deadline_window_days: u32,
}

fn env_or(name: &str, fallback: &str) -> String {
    std::env::var(name).unwrap_or_else(|_| fallback.to_string())
}

/// Parse an env var, falling back on absence or malformed values
fn env_parse<T: std::str::FromStr>(name: &str, fallback: T) -> T {
    std::env::var(name)
        .ok()
        .and_then(|value| value.trim().parse().ok())
        .unwrap_or(fallback)
}

impl Default for Config {
    /// Default configuration with ENV_VAR support for k8s/container deployment
    fn default() -> Self {
        Self {
            server: ServerConfig {
                host: env_or("ONBOARDFLOW_HOST", "0.0.0.0"),
                port: env_parse("ONBOARDFLOW_PORT", 3004),
            },
            database: DatabaseConfig {
                data_dir: env_or("ONBOARDFLOW_DATA_DIR", "data"),
            },
            auth: AuthConfig {
                jwt_secret: env_or("ONBOARDFLOW_JWT_SECRET", "dev-secret-change-me"),
            },
            access: AccessConfig {
                grant_ttl_hours: env_parse("ONBOARDFLOW_GRANT_TTL_HOURS", 24),
            },
            realtime: RealtimeConfig {
                channel_buffer: env_parse("ONBOARDFLOW_CHANNEL_BUFFER", 64),
                deadline_schedule: env_or("ONBOARDFLOW_DEADLINE_SCHEDULE", "0 0 * * * *"),
                deadline_window_days: env_parse("ONBOARDFLOW_DEADLINE_WINDOW_DAYS", 2),
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn malformed_numbers_fall_back() {
        std::env::set_var("ONBOARDFLOW_TEST_BAD_NUMBER", "lots");
        assert_eq!(env_parse("ONBOARDFLOW_TEST_BAD_NUMBER", 7u32), 7);
        std::env::set_var("ONBOARDFLOW_TEST_GOOD_NUMBER", " 12 ");
        assert_eq!(env_parse("ONBOARDFLOW_TEST_GOOD_NUMBER", 7u32), 12);
        assert_eq!(env_parse("ONBOARDFLOW_TEST_UNSET_NUMBER", 7u32), 7);
    }

    #[test]
    fn database_file_lives_in_data_dir() {
        let db = DatabaseConfig { data_dir: "var/lib".into() };
        assert_eq!(db.database_path(), PathBuf::from("var/lib/onboardflow.db"));
    }

    #[test]
    fn secret_is_not_debug_printed() {
        let auth = AuthConfig { jwt_secret: "hunter2".into() };
        assert!(!format!("{:?}", auth).contains("hunter2"));
    }
}
