//! Typed configuration from environment variables.
//!
//! Loads once at startup, fails fast if a variable is present but malformed.

use std::str::FromStr;

use crate::error::{Error, Result};

#[derive(Debug, Clone)]
pub struct Config {
    /// Flow name; also prefixes loop thread names.
    pub flow_name: String,
    /// Launch the background loop as soon as the flow is built.
    pub autostart: bool,
    /// Number of flow events retained in memory.
    pub event_capacity: usize,
    pub otel_endpoint: Option<String>,
    pub log_level: String,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            flow_name: "flow".to_string(),
            autostart: true,
            event_capacity: 1024,
            otel_endpoint: None,
            log_level: "info".to_string(),
        }
    }
}

impl Config {
    /// Load configuration from environment variables, falling back to
    /// [`Config::default`] for anything unset.
    ///
    /// In local dev, call `dotenvy::dotenv().ok()` before this.
    pub fn from_env() -> Result<Self> {
        let defaults = Self::default();
        Ok(Self {
            flow_name: std::env::var("TASKFLOW_NAME").unwrap_or(defaults.flow_name),
            autostart: parsed_var("TASKFLOW_AUTOSTART", defaults.autostart)?,
            event_capacity: parsed_var("TASKFLOW_EVENT_CAPACITY", defaults.event_capacity)?,
            otel_endpoint: std::env::var("OTEL_ENDPOINT").ok(),
            log_level: std::env::var("LOG_LEVEL").unwrap_or(defaults.log_level),
        })
    }
}

fn parsed_var<T>(name: &str, default: T) -> Result<T>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    match std::env::var(name) {
        Ok(raw) => raw
            .trim()
            .parse()
            .map_err(|e| Error::Config(format!("invalid value {raw:?} for {name}: {e}"))),
        Err(_) => Ok(default),
    }
}
