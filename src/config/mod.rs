use std::env;
use std::path::PathBuf;
use std::str::FromStr;

use crate::error::AppError;

/// Application configuration loaded from environment variables
#[derive(Debug, Clone)]
pub struct Config {
    pub database: DatabaseConfig,
    pub logging: LoggingConfig,
    pub server: ServerConfig,
    pub pool: PoolConfig,
    pub balancer: BalancerConfig,
    pub recorder: RecorderConfig,
}

/// Database configuration
#[derive(Debug, Clone)]
pub struct DatabaseConfig {
    pub path: PathBuf,
    pub max_connections: u32,
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

/// Listener configuration
#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
    /// Longest request line accepted before the connection is dropped
    pub max_line_bytes: usize,
}

/// Which pools a new session draws from, and how much of them
#[derive(Debug, Clone)]
pub struct PoolConfig {
    pub stimulus_pool: String,
    pub familiarization_pool: Option<String>,
    pub per_session: AssignCount,
    /// Upper bound on an explicit count a participant may request
    pub max_per_session: usize,
    pub stim_version: String,
}

/// How many items a session receives from a pool.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AssignCount {
    /// The `n` least-used items.
    Limit(usize),
    /// The whole pool, still counted for load tracking.
    All,
}

impl FromStr for AssignCount {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if s.trim().eq_ignore_ascii_case("all") {
            return Ok(AssignCount::All);
        }
        match s.trim().parse::<usize>() {
            Ok(0) => Err("count must be positive or 'all'".to_string()),
            Ok(n) => Ok(AssignCount::Limit(n)),
            Err(_) => Err(format!("invalid count: {}", s)),
        }
    }
}

/// Stimulus balancer tuning
#[derive(Debug, Clone)]
pub struct BalancerConfig {
    pub max_retries: u32,
    pub fairness_slack: i64,
}

/// Client-side result forwarding policy
#[derive(Debug, Clone)]
pub struct RecorderConfig {
    pub queue_capacity: usize,
    pub max_retries: u32,
    pub retry_delay_ms: u64,
}

impl Config {
    /// Load configuration from environment variables
    pub fn from_env() -> Result<Self, AppError> {
        // Load .env file if present (ignore errors if not found)
        let _ = dotenvy::dotenv();

        let database = DatabaseConfig {
            path: PathBuf::from(
                env::var("DATABASE_PATH").unwrap_or_else(|_| "./data/trials.db".to_string()),
            ),
            max_connections: parse_var("DATABASE_MAX_CONNECTIONS", 5)?,
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

        let server = ServerConfig {
            host: env::var("SERVER_HOST").unwrap_or_else(|_| "0.0.0.0".to_string()),
            port: parse_var("SERVER_PORT", 8886)?,
            max_line_bytes: parse_var("SERVER_MAX_LINE_BYTES", 1024 * 1024)?,
        };

        let pool = PoolConfig {
            stimulus_pool: env::var("STIMULUS_POOL").unwrap_or_else(|_| "default".to_string()),
            familiarization_pool: env::var("FAMILIARIZATION_POOL")
                .ok()
                .filter(|s| !s.trim().is_empty()),
            per_session: parse_var("STIMULI_PER_SESSION", AssignCount::Limit(1))?,
            max_per_session: parse_var("STIMULI_MAX_PER_SESSION", 100)?,
            stim_version: env::var("STIM_VERSION").unwrap_or_else(|_| "v1".to_string()),
        };

        let balancer = BalancerConfig {
            max_retries: parse_var("BALANCER_MAX_RETRIES", 3)?,
            fairness_slack: parse_var("BALANCER_FAIRNESS_SLACK", 0)?,
        };

        let recorder = RecorderConfig {
            queue_capacity: parse_var("RECORDER_QUEUE_CAPACITY", 256)?,
            max_retries: parse_var("RECORDER_MAX_RETRIES", 3)?,
            retry_delay_ms: parse_var("RECORDER_RETRY_DELAY_MS", 500)?,
        };

        if pool.max_per_session == 0 {
            return Err(AppError::Config {
                message: "STIMULI_MAX_PER_SESSION must be positive".to_string(),
            });
        }
        if let AssignCount::Limit(n) = pool.per_session {
            if n > pool.max_per_session {
                return Err(AppError::Config {
                    message: format!(
                        "STIMULI_PER_SESSION ({}) exceeds STIMULI_MAX_PER_SESSION ({})",
                        n, pool.max_per_session
                    ),
                });
            }
        }
        if server.max_line_bytes == 0 {
            return Err(AppError::Config {
                message: "SERVER_MAX_LINE_BYTES must be positive".to_string(),
            });
        }

        if recorder.queue_capacity == 0 {
            return Err(AppError::Config {
                message: "RECORDER_QUEUE_CAPACITY must be positive".to_string(),
            });
        }

        Ok(Config {
            database,
            logging,
            server,
            pool,
            balancer,
            recorder,
        })
    }

    /// Socket address string the server binds to
    pub fn bind_address(&self) -> String {
        format!("{}:{}", self.server.host, self.server.port)
    }
}

/// Read an optional variable, rejecting values that do not parse.
fn parse_var<T>(name: &str, default: T) -> Result<T, AppError>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    match env::var(name) {
        Ok(raw) => raw.trim().parse().map_err(|e: T::Err| AppError::Config {
            message: format!("{} is invalid: {}", name, e),
        }),
        Err(_) => Ok(default),
    }
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 8886,
            max_line_bytes: 1024 * 1024,
        }
    }
}

impl Default for BalancerConfig {
    fn default() -> Self {
        Self {
            max_retries: 3,
            fairness_slack: 0,
        }
    }
}

impl Default for RecorderConfig {
    fn default() -> Self {
        Self {
            queue_capacity: 256,
            max_retries: 3,
            retry_delay_ms: 500,
        }
    }
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            path: PathBuf::from("./data/trials.db"),
            max_connections: 5,
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            format: LogFormat::Pretty,
        }
    }
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            stimulus_pool: "default".to_string(),
            familiarization_pool: None,
            per_session: AssignCount::Limit(1),
            max_per_session: 100,
            stim_version: "v1".to_string(),
        }
    }
}

/// Built-in defaults without reading the environment.
impl Default for Config {
    fn default() -> Self {
        Self {
            database: DatabaseConfig::default(),
            logging: LoggingConfig::default(),
            server: ServerConfig::default(),
            pool: PoolConfig::default(),
            balancer: BalancerConfig::default(),
            recorder: RecorderConfig::default(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_assign_count_parses_limit_and_all() {
        assert_eq!("3".parse::<AssignCount>(), Ok(AssignCount::Limit(3)));
        assert_eq!("ALL".parse::<AssignCount>(), Ok(AssignCount::All));
        assert_eq!(" all ".parse::<AssignCount>(), Ok(AssignCount::All));
    }

    #[test]
    fn test_assign_count_rejects_zero_and_garbage() {
        assert!("0".parse::<AssignCount>().is_err());
        assert!("many".parse::<AssignCount>().is_err());
        assert!("-2".parse::<AssignCount>().is_err());
    }

    #[test]
    fn test_defaults() {
        let balancer = BalancerConfig::default();
        assert_eq!(balancer.max_retries, 3);
        assert_eq!(balancer.fairness_slack, 0);

        let recorder = RecorderConfig::default();
        assert_eq!(recorder.queue_capacity, 256);
        assert_eq!(recorder.retry_delay_ms, 500);

        let config = Config::default();
        assert_eq!(config.bind_address(), "127.0.0.1:8886");
        assert_eq!(config.pool.per_session, AssignCount::Limit(1));
        assert!(config.pool.familiarization_pool.is_none());
        assert_eq!(config.pool.max_per_session, 100);
        assert_eq!(config.server.max_line_bytes, 1024 * 1024);
    }
}
