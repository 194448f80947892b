use crate::util::decode_hex32;
use std::collections::HashMap;
use std::env;
use std::error::Error;
use std::fmt::{Display, Formatter};
use std::fs;
use std::path::Path;
use std::str::FromStr;

const DEFAULT_ADDR: &str = "0.0.0.0:5190";
const DEFAULT_COOKIE_TTL: i64 = oscard_auth::COOKIE_TTL_MAX_SECONDS;

#[derive(Debug)]
pub enum ConfigError {
    Io,
    Parse,
    Missing,
    Invalid,
}

impl Display for ConfigError {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Io => write!(f, "configuration io failure"),
            Self::Parse => write!(f, "configuration parse failure"),
            Self::Missing => write!(f, "configuration key missing"),
            Self::Invalid => write!(f, "configuration value invalid"),
        }
    }
}

impl Error for ConfigError {}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogLevel {
    Debug,
    Info,
    Warn,
    Error,
}

impl LogLevel {
    pub fn as_filter(&self) -> &'static str {
        match self {
            LogLevel::Debug => "debug",
            LogLevel::Info => "info",
            LogLevel::Warn => "warn",
            LogLevel::Error => "error",
        }
    }
}

impl FromStr for LogLevel {
    type Err = ConfigError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value {
            "debug" => Ok(LogLevel::Debug),
            "info" => Ok(LogLevel::Info),
            "warn" => Ok(LogLevel::Warn),
            "error" => Ok(LogLevel::Error),
            _ => Err(ConfigError::Invalid),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogStyle {
    Human,
    Machine,
}

impl FromStr for LogStyle {
    type Err = ConfigError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value {
            "human" => Ok(LogStyle::Human),
            "machine" => Ok(LogStyle::Machine),
            _ => Err(ConfigError::Invalid),
        }
    }
}

#[derive(Clone)]
pub struct MetricsConfig {
    pub addr: String,
    pub user: Option<String>,
    pub password: Option<String>,
}

#[derive(Clone)]
pub struct ServerConfig {
    pub addr: String,
    /// BOS address advertised to clients after authentication. The server
    /// is a single process, so this normally points back at `addr`.
    pub bos: String,
    pub log_level: LogLevel,
    pub log_style: LogStyle,
    pub metrics: Option<MetricsConfig>,
    pub postgres_dsn: String,
    pub cookie_secret: Option<[u8; 32]>,
    pub cookie_ttl_seconds: i64,
}

/// Loads server configuration from the filesystem with environment
/// overrides.
pub fn load_configuration(path: &Path) -> Result<ServerConfig, ConfigError> {
    let contents = fs::read_to_string(path).map_err(|_| ConfigError::Io)?;
    let mut section = String::new();
    let mut map = HashMap::new();
    for line in contents.lines() {
        let trimmed = line.trim();
        if trimmed.is_empty() || trimmed.starts_with('#') {
            continue;
        }
        if trimmed.starts_with('[') && trimmed.ends_with(']') {
            section = trimmed
                .trim_start_matches('[')
                .trim_end_matches(']')
                .to_string();
            continue;
        }
        let parts: Vec<&str> = trimmed.splitn(2, '=').collect();
        if parts.len() != 2 {
            return Err(ConfigError::Parse);
        }
        let key = if section.is_empty() {
            parts[0].trim().to_string()
        } else {
            format!("{}.{}", section, parts[0].trim())
        };
        let mut value = parts[1].trim().to_string();
        if let Some(idx) = value.find('#') {
            value.truncate(idx);
            value = value.trim().to_string();
        }
        if value.starts_with('"') && value.ends_with('"') && value.len() >= 2 {
            value = value[1..value.len() - 1].to_string();
        }
        map.insert(key, value);
    }

    let addr = override_env("OSCARD_ADDR", map.remove("oscar.addr"))?
        .unwrap_or_else(|| DEFAULT_ADDR.to_string());
    let bos = override_env("OSCARD_BOS", map.remove("oscar.bos"))?.unwrap_or_else(|| addr.clone());
    let log_level = override_env("OSCARD_LOG_LEVEL", map.remove("app.log_level"))?
        .unwrap_or_else(|| "info".to_string())
        .parse::<LogLevel>()?;
    let log_style = override_env("OSCARD_LOG_STYLE", map.remove("app.log_style"))?
        .unwrap_or_else(|| "human".to_string())
        .parse::<LogStyle>()?;
    let postgres_dsn = required(override_env("OSCARD_PG_DSN", map.remove("db.dsn"))?)?;

    let metrics_addr = override_env("OSCARD_METRICS_ADDR", map.remove("app.metrics.addr"))?;
    let metrics_user = override_env("OSCARD_METRICS_USER", map.remove("app.metrics.user"))?;
    let metrics_password =
        override_env("OSCARD_METRICS_PASSWORD", map.remove("app.metrics.password"))?;
    let metrics = metrics_addr.map(|addr| MetricsConfig {
        addr,
        user: metrics_user,
        password: metrics_password,
    });

    let cookie_secret =
        match override_env("OSCARD_COOKIE_SECRET", map.remove("auth.cookie_secret"))? {
            Some(hex) => Some(decode_hex32(&hex).map_err(|_| ConfigError::Invalid)?),
            None => None,
        };
    let cookie_ttl_seconds = override_env("OSCARD_COOKIE_TTL", map.remove("auth.cookie_ttl"))?
        .unwrap_or_else(|| DEFAULT_COOKIE_TTL.to_string())
        .parse::<i64>()
        .map_err(|_| ConfigError::Invalid)?;
    if cookie_ttl_seconds <= 0 || cookie_ttl_seconds > oscard_auth::COOKIE_TTL_MAX_SECONDS {
        return Err(ConfigError::Invalid);
    }

    Ok(ServerConfig {
        addr,
        bos,
        log_level,
        log_style,
        metrics,
        postgres_dsn,
        cookie_secret,
        cookie_ttl_seconds,
    })
}

fn override_env(key: &str, current: Option<String>) -> Result<Option<String>, ConfigError> {
    match env::var(key) {
        Ok(value) => Ok(Some(value)),
        Err(env::VarError::NotPresent) => Ok(current),
        Err(_) => Err(ConfigError::Invalid),
    }
}

fn required(value: Option<String>) -> Result<String, ConfigError> {
    value.ok_or(ConfigError::Missing)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use std::path::PathBuf;

    #[test]
    fn parse_configuration_minimal() {
        let mut path = PathBuf::from(env::temp_dir());
        path.push("oscard_test_config_minimal.toml");
        let mut file = fs::File::create(&path).unwrap();
        file.write_all(b"[db]\ndsn=\"postgres://oscard@localhost/oscard\"\n")
            .unwrap();
        let config = load_configuration(&path).unwrap();
        assert_eq!(config.addr, "0.0.0.0:5190");
        assert_eq!(config.bos, config.addr);
        assert_eq!(config.log_level, LogLevel::Info);
        assert_eq!(config.log_style, LogStyle::Human);
        assert!(config.metrics.is_none());
        assert!(config.cookie_secret.is_none());
        assert_eq!(config.cookie_ttl_seconds, 300);
        fs::remove_file(path).unwrap();
    }

    #[test]
    fn parse_configuration_full() {
        let mut path = PathBuf::from(env::temp_dir());
        path.push("oscard_test_config_full.toml");
        let mut file = fs::File::create(&path).unwrap();
        file.write_all(
            b"[oscar]\naddr=\"127.0.0.1:5190\"\nbos=\"aim.example.org:5190\"\n\
            [app]\nlog_level=\"debug\"\nlog_style=\"machine\"\n\
            [app.metrics]\naddr=\"127.0.0.1:9100\"\nuser=\"ops\"\npassword=\"hunter2\"\n\
            [db]\ndsn=\"postgres://oscard@localhost/oscard\"\n\
            [auth]\ncookie_secret=\"000102030405060708090a0b0c0d0e0f000102030405060708090a0b0c0d0e0f\"\ncookie_ttl=\"120\" # two minutes\n",
        )
        .unwrap();
        let config = load_configuration(&path).unwrap();
        assert_eq!(config.bos, "aim.example.org:5190");
        assert_eq!(config.log_level, LogLevel::Debug);
        assert_eq!(config.log_style, LogStyle::Machine);
        let metrics = config.metrics.unwrap();
        assert_eq!(metrics.addr, "127.0.0.1:9100");
        assert_eq!(metrics.user.as_deref(), Some("ops"));
        assert_eq!(config.cookie_ttl_seconds, 120);
        assert!(config.cookie_secret.is_some());
        fs::remove_file(path).unwrap();
    }

    #[test]
    fn cookie_ttl_capped_at_protocol_limit() {
        let mut path = PathBuf::from(env::temp_dir());
        path.push("oscard_test_config_ttl.toml");
        let mut file = fs::File::create(&path).unwrap();
        file.write_all(b"[db]\ndsn=\"postgres://\"\n[auth]\ncookie_ttl=\"3600\"\n")
            .unwrap();
        assert!(load_configuration(&path).is_err());
        fs::remove_file(path).unwrap();
    }

    #[test]
    fn missing_dsn_rejected() {
        let mut path = PathBuf::from(env::temp_dir());
        path.push("oscard_test_config_nodsn.toml");
        fs::File::create(&path)
            .unwrap()
            .write_all(b"[oscar]\naddr=\"127.0.0.1:5190\"\n")
            .unwrap();
        assert!(load_configuration(&path).is_err());
        fs::remove_file(path).unwrap();
    }
}
