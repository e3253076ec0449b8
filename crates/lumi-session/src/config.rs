//! Session configuration, loadable from the environment.

use std::fmt::Display;
use std::str::FromStr;
use std::time::Duration;

/// A custom error type for configuration loading failures.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Invalid value for environment variable {0}: {1}")]
    InvalidValue(String, String),
}

/// Backend endpoint coordinates.
#[derive(Clone, Debug, PartialEq)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
    pub protocol: String,
    pub path: String,
}

impl ServerConfig {
    pub fn url(&self) -> String {
        format!("{}://{}:{}{}", self.protocol, self.host, self.port, self.path)
    }
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "localhost".to_string(),
            port: 12393,
            protocol: "ws".to_string(),
            path: "/client-ws".to_string(),
        }
    }
}

/// All tunables of the session engine.
#[derive(Clone, Debug, PartialEq)]
pub struct SessionConfig {
    pub server: ServerConfig,
    /// Reconnect attempts after an involuntary disconnect.
    pub max_retries: u32,
    /// First reconnect delay; doubles on every attempt.
    pub base_delay: Duration,
    /// Budget for a single connection attempt to open.
    pub connect_timeout: Duration,
    /// Samples per `mic-audio-data` frame.
    pub audio_chunk_size: usize,
    /// Silence inserted between consecutive audio playback tasks.
    pub audio_task_gap: Duration,
    /// Oldest messages are evicted beyond this count.
    pub max_messages: usize,
    /// Whether clearing the playback queue also stops the in-flight task.
    pub stop_audio_on_clear: bool,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            server: ServerConfig::default(),
            max_retries: 5,
            base_delay: Duration::from_millis(1000),
            connect_timeout: Duration::from_millis(5000),
            audio_chunk_size: 4096,
            audio_task_gap: Duration::from_millis(50),
            max_messages: 1000,
            stop_audio_on_clear: false,
        }
    }
}

impl SessionConfig {
    /// Loads configuration from `LUMI_*` environment variables, falling back
    /// to the defaults for anything unset.
    pub fn from_env() -> Result<Self, ConfigError> {
        let defaults = Self::default();
        Ok(Self {
            server: ServerConfig {
                host: env_string("LUMI_HOST", defaults.server.host),
                port: env_parse("LUMI_PORT", defaults.server.port)?,
                protocol: env_string("LUMI_PROTOCOL", defaults.server.protocol),
                path: env_string("LUMI_PATH", defaults.server.path),
            },
            max_retries: env_parse("LUMI_MAX_RETRIES", defaults.max_retries)?,
            base_delay: Duration::from_millis(env_parse(
                "LUMI_BASE_DELAY_MS",
                defaults.base_delay.as_millis() as u64,
            )?),
            connect_timeout: Duration::from_millis(env_parse(
                "LUMI_CONNECT_TIMEOUT_MS",
                defaults.connect_timeout.as_millis() as u64,
            )?),
            audio_chunk_size: env_parse("LUMI_AUDIO_CHUNK_SIZE", defaults.audio_chunk_size)?,
            audio_task_gap: Duration::from_millis(env_parse(
                "LUMI_AUDIO_TASK_GAP_MS",
                defaults.audio_task_gap.as_millis() as u64,
            )?),
            max_messages: env_parse("LUMI_MAX_MESSAGES", defaults.max_messages)?,
            stop_audio_on_clear: env_parse(
                "LUMI_STOP_AUDIO_ON_CLEAR",
                defaults.stop_audio_on_clear,
            )?,
        })
    }
}

fn env_string(key: &str, default: String) -> String {
    std::env::var(key).unwrap_or(default)
}

fn env_parse<T>(key: &str, default: T) -> Result<T, ConfigError>
where
    T: FromStr,
    T::Err: Display,
{
    match std::env::var(key) {
        Ok(raw) => raw
            .parse::<T>()
            .map_err(|e| ConfigError::InvalidValue(key.to_string(), e.to_string())),
        Err(_) => Ok(default),
    }
}
