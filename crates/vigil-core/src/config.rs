//! Vigil application configuration (TOML).

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

use crate::error::{Result, VigilError};

/// Root configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct VigilConfig {
    #[serde(default)]
    pub smtp: SmtpConfig,
    #[serde(default)]
    pub dispatcher: DispatcherConfig,
    #[serde(default)]
    pub storage: StorageConfig,
}

impl VigilConfig {
    /// Load config from the default path (~/.vigil/config.toml).
    pub fn load() -> Result<Self> {
        let path = Self::default_path();
        if path.exists() {
            Self::load_from(&path)
        } else {
            Ok(Self::default())
        }
    }

    /// Load config from a specific path.
    pub fn load_from(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| VigilError::Config(format!("Failed to read config: {e}")))?;
        let config: Self = toml::from_str(&content)
            .map_err(|e| VigilError::Config(format!("Failed to parse config: {e}")))?;
        Ok(config)
    }

    /// Get the default config path.
    pub fn default_path() -> PathBuf {
        Self::home_dir().join("config.toml")
    }

    /// Get the Vigil home directory (~/.vigil).
    pub fn home_dir() -> PathBuf {
        dirs::home_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join(".vigil")
    }
}

/// SMTP relay configuration for the outbound email channel.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SmtpConfig {
    #[serde(default = "default_smtp_host")]
    pub host: String,
    #[serde(default = "default_smtp_port")]
    pub port: u16,
    #[serde(default)]
    pub username: String,
    #[serde(default)]
    pub password: String,
    /// From address; falls back to `username` when empty.
    #[serde(default)]
    pub from_email: String,
    #[serde(default = "default_from_name")]
    pub from_name: String,
}

fn default_smtp_host() -> String {
    "smtp.gmail.com".into()
}
fn default_smtp_port() -> u16 {
    587
}
fn default_from_name() -> String {
    "Vigil".into()
}

impl Default for SmtpConfig {
    fn default() -> Self {
        Self {
            host: default_smtp_host(),
            port: default_smtp_port(),
            username: String::new(),
            password: String::new(),
            from_email: String::new(),
            from_name: default_from_name(),
        }
    }
}

impl SmtpConfig {
    /// Whether enough is configured to actually send.
    pub fn is_configured(&self) -> bool {
        !self.username.is_empty() && !self.password.is_empty()
    }

    pub fn sender_address(&self) -> &str {
        if self.from_email.is_empty() {
            &self.username
        } else {
            &self.from_email
        }
    }
}

/// Dispatcher polling configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DispatcherConfig {
    /// Seconds between due-message polls.
    #[serde(default = "default_poll_interval")]
    pub poll_interval_secs: u64,
    /// Bounded per-recipient send timeout; a timeout counts as a
    /// recipient-level failure.
    #[serde(default = "default_send_timeout")]
    pub send_timeout_secs: u64,
}

fn default_poll_interval() -> u64 {
    60
}
fn default_send_timeout() -> u64 {
    30
}

impl Default for DispatcherConfig {
    fn default() -> Self {
        Self {
            poll_interval_secs: default_poll_interval(),
            send_timeout_secs: default_send_timeout(),
        }
    }
}

/// Storage configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StorageConfig {
    /// SQLite database path (~/.vigil/vigil.db by default).
    #[serde(default = "default_db_path")]
    pub db_path: String,
}

fn default_db_path() -> String {
    VigilConfig::home_dir()
        .join("vigil.db")
        .to_string_lossy()
        .into_owned()
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self { db_path: default_db_path() }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_sane() {
        let cfg = VigilConfig::default();
        assert_eq!(cfg.dispatcher.poll_interval_secs, 60);
        assert_eq!(cfg.dispatcher.send_timeout_secs, 30);
        assert!(!cfg.smtp.is_configured());
    }

    #[test]
    fn parses_partial_toml() {
        let cfg: VigilConfig = toml::from_str(
            r#"
            [smtp]
            username = "vault@example.com"
            password = "hunter2"

            [dispatcher]
            poll_interval_secs = 15
            "#,
        )
        .unwrap();
        assert!(cfg.smtp.is_configured());
        assert_eq!(cfg.smtp.sender_address(), "vault@example.com");
        assert_eq!(cfg.dispatcher.poll_interval_secs, 15);
        assert_eq!(cfg.dispatcher.send_timeout_secs, 30);
    }
}
