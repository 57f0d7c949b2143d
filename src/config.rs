//! Runtime configuration
//!
//! Values come from the environment (a `.env` file is loaded first when
//! present). Unset variables fall back to defaults; malformed ones are errors.

use std::net::SocketAddr;
use std::path::PathBuf;

use thiserror::Error;
use tokio::time::Duration;

use crate::operation::OperationLimits;
use crate::tracing::LogFormat;

const DEFAULT_PORT: u16 = 5001;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("invalid value '{value}' for {key}: {reason}")]
    Invalid {
        key: &'static str,
        value: String,
        reason: String,
    },
}

/// Everything the binary needs to wire the core together
#[derive(Debug, Clone)]
pub struct Config {
    pub ollama_url: String,
    pub ollama_model: String,
    /// Deadline for the language model request and each streamed chunk
    pub request_timeout: Duration,
    /// Deadline for list/info/start/stop/delete
    pub exec_timeout: Duration,
    /// Deadline for launches (image downloads can be slow)
    pub launch_timeout: Duration,
    pub multipass_bin: Option<PathBuf>,
    pub listen_addr: SocketAddr,
    pub refresh_interval: Duration,
    pub history_limit: usize,
    pub limits: OperationLimits,
    pub system_prompt: Option<String>,
    pub log_format: LogFormat,
    pub otlp_endpoint: Option<String>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            ollama_url: "http://localhost:11434".to_string(),
            ollama_model: "mistral-faiss-rag:latest".to_string(),
            request_timeout: Duration::from_secs(120),
            exec_timeout: Duration::from_secs(120),
            launch_timeout: Duration::from_secs(600),
            multipass_bin: None,
            listen_addr: SocketAddr::from(([0, 0, 0, 0], DEFAULT_PORT)),
            refresh_interval: Duration::from_secs(15),
            history_limit: 10,
            limits: OperationLimits::default(),
            system_prompt: None,
            log_format: LogFormat::Pretty,
            otlp_endpoint: None,
        }
    }
}

impl Config {
    /// Load `.env` (if any), then read the process environment
    pub fn from_env() -> Result<Self, ConfigError> {
        let _ = dotenvy::dotenv();
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build a config from an arbitrary variable source
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |key: &str| lookup(key).map(|v| v.trim().to_string()).filter(|v| !v.is_empty());
        let mut config = Config::default();

        if let Some(url) = get("OLLAMA_URL") {
            config.ollama_url = url.trim_end_matches('/').to_string();
        }
        if let Some(model) = get("OLLAMA_MODEL") {
            config.ollama_model = model;
        }
        if let Some(v) = get("REQUEST_TIMEOUT") {
            config.request_timeout = seconds("REQUEST_TIMEOUT", &v)?;
        }
        if let Some(v) = get("EXEC_TIMEOUT") {
            config.exec_timeout = seconds("EXEC_TIMEOUT", &v)?;
        }
        if let Some(v) = get("LAUNCH_TIMEOUT") {
            config.launch_timeout = seconds("LAUNCH_TIMEOUT", &v)?;
        }
        config.multipass_bin = get("MULTIPASS_BIN").map(PathBuf::from);

        if let Some(v) = get("LISTEN_ADDR") {
            config.listen_addr = v.parse().map_err(|e: std::net::AddrParseError| invalid("LISTEN_ADDR", &v, e))?;
        } else if let Some(v) = get("PROXY_SERVER_PORT") {
            let port: u16 = number("PROXY_SERVER_PORT", &v)?;
            config.listen_addr = SocketAddr::from(([0, 0, 0, 0], port));
        }

        if let Some(v) = get("REFRESH_INTERVAL") {
            config.refresh_interval = seconds("REFRESH_INTERVAL", &v)?;
        }
        if let Some(v) = get("HISTORY_LIMIT") {
            config.history_limit = number("HISTORY_LIMIT", &v)?;
        }
        if let Some(v) = get("MAX_CPUS") {
            config.limits.max_cpus = positive("MAX_CPUS", &v)?;
        }
        if let Some(v) = get("MAX_MEMORY_MB") {
            config.limits.max_memory_mb = positive("MAX_MEMORY_MB", &v)?;
            if config.limits.max_memory_mb < config.limits.min_memory_mb {
                return Err(invalid(
                    "MAX_MEMORY_MB",
                    &v,
                    format!("must be at least {}", config.limits.min_memory_mb),
                ));
            }
        }
        if let Some(v) = get("MAX_DISK_GB") {
            config.limits.max_disk_gb = positive("MAX_DISK_GB", &v)?;
        }
        config.system_prompt = get("SYSTEM_PROMPT");
        if let Some(v) = get("LOG_FORMAT") {
            config.log_format = v.parse().map_err(|e: String| invalid("LOG_FORMAT", &v, e))?;
        }
        config.otlp_endpoint = get("OTEL_EXPORTER_OTLP_ENDPOINT");

        Ok(config)
    }
}

fn invalid(key: &'static str, value: &str, reason: impl ToString) -> ConfigError {
    ConfigError::Invalid {
        key,
        value: value.to_string(),
        reason: reason.to_string(),
    }
}

fn number<T>(key: &'static str, value: &str) -> Result<T, ConfigError>
where
    T: std::str::FromStr,
    T::Err: std::fmt::Display,
{
    value.parse().map_err(|e: T::Err| invalid(key, value, e))
}

fn positive<T>(key: &'static str, value: &str) -> Result<T, ConfigError>
where
    T: std::str::FromStr + PartialOrd + Default,
    T::Err: std::fmt::Display,
{
    let parsed: T = number(key, value)?;
    if parsed <= T::default() {
        return Err(invalid(key, value, "must be greater than zero"));
    }
    Ok(parsed)
}

fn seconds(key: &'static str, value: &str) -> Result<Duration, ConfigError> {
    positive::<u64>(key, value).map(Duration::from_secs)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn from_pairs(pairs: &[(&str, &str)]) -> Result<Config, ConfigError> {
        let vars: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        Config::from_lookup(|key| vars.get(key).cloned())
    }

    #[test]
    fn test_defaults() {
        let config = from_pairs(&[]).unwrap();
        assert_eq!(config.ollama_url, "http://localhost:11434");
        assert_eq!(config.ollama_model, "mistral-faiss-rag:latest");
        assert_eq!(config.listen_addr.port(), 5001);
        assert_eq!(config.launch_timeout, Duration::from_secs(600));
        assert_eq!(config.limits.max_cpus, 16);
        assert!(config.multipass_bin.is_none());
    }

    #[test]
    fn test_overrides() {
        let config = from_pairs(&[
            ("OLLAMA_URL", "http://gpu-box:11434/"),
            ("PROXY_SERVER_PORT", "8080"),
            ("EXEC_TIMEOUT", "30"),
            ("MAX_CPUS", "4"),
            ("LOG_FORMAT", "json"),
            ("MULTIPASS_BIN", "/snap/bin/multipass"),
        ])
        .unwrap();
        assert_eq!(config.ollama_url, "http://gpu-box:11434");
        assert_eq!(config.listen_addr.port(), 8080);
        assert_eq!(config.exec_timeout, Duration::from_secs(30));
        assert_eq!(config.limits.max_cpus, 4);
        assert_eq!(config.log_format, LogFormat::Json);
        assert_eq!(
            config.multipass_bin,
            Some(PathBuf::from("/snap/bin/multipass"))
        );
    }

    #[test]
    fn test_listen_addr_wins_over_port() {
        let config = from_pairs(&[("LISTEN_ADDR", "127.0.0.1:9000"), ("PROXY_SERVER_PORT", "1")]).unwrap();
        assert_eq!(config.listen_addr, "127.0.0.1:9000".parse().unwrap());
    }

    #[test]
    fn test_invalid_values() {
        assert!(matches!(
            from_pairs(&[("EXEC_TIMEOUT", "soon")]),
            Err(ConfigError::Invalid { key: "EXEC_TIMEOUT", .. })
        ));
        assert!(from_pairs(&[("MAX_CPUS", "0")]).is_err());
        assert!(from_pairs(&[("MAX_MEMORY_MB", "64")]).is_err());
        assert!(from_pairs(&[("LOG_FORMAT", "xml")]).is_err());
    }
}
