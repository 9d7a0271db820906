//! Runtime configuration
//!
//! Credentials and endpoints for the contact API. Built once by the embedding
//! application and shared with the HTTP client.

use thiserror::Error;

/// Runtime configuration for API access.
#[derive(Debug, Clone)]
pub struct RuntimeConfig {
    /// Base device API URL, without a trailing slash.
    pub device_url: String,
    /// Application key used for basic auth.
    pub app_key: String,
    /// Application secret used for basic auth.
    pub app_secret: String,
    /// Device platform identifier sent in identity requests.
    pub device_type: String,
}

impl RuntimeConfig {
    /// Create a new RuntimeConfigBuilder
    pub fn builder() -> RuntimeConfigBuilder {
        RuntimeConfigBuilder::default()
    }

    /// Joins a path onto the device URL.
    pub fn device_api_url(&self, path: &str) -> String {
        format!("{}/{}", self.device_url.trim_end_matches('/'), path)
    }
}

/// Builder for RuntimeConfig
#[derive(Debug, Default)]
pub struct RuntimeConfigBuilder {
    device_url: Option<String>,
    app_key: Option<String>,
    app_secret: Option<String>,
    device_type: Option<String>,
}

impl RuntimeConfigBuilder {
    /// Set the base device API URL
    pub fn device_url(mut self, url: impl Into<String>) -> Self {
        self.device_url = Some(url.into());
        self
    }

    /// Set the application key
    pub fn app_key(mut self, key: impl Into<String>) -> Self {
        self.app_key = Some(key.into());
        self
    }

    /// Set the application secret
    pub fn app_secret(mut self, secret: impl Into<String>) -> Self {
        self.app_secret = Some(secret.into());
        self
    }

    /// Set the device platform identifier. Defaults to `android`.
    pub fn device_type(mut self, device_type: impl Into<String>) -> Self {
        self.device_type = Some(device_type.into());
        self
    }

    /// Build the configuration
    pub fn build(self) -> Result<RuntimeConfig, ConfigError> {
        let device_url = self
            .device_url
            .filter(|url| !url.is_empty())
            .ok_or(ConfigError::MissingValue("device_url"))?;

        if !device_url.starts_with("http://") && !device_url.starts_with("https://") {
            return Err(ConfigError::InvalidUrl(device_url));
        }

        Ok(RuntimeConfig {
            device_url,
            app_key: self
                .app_key
                .filter(|key| !key.is_empty())
                .ok_or(ConfigError::MissingValue("app_key"))?,
            app_secret: self
                .app_secret
                .filter(|secret| !secret.is_empty())
                .ok_or(ConfigError::MissingValue("app_secret"))?,
            device_type: self.device_type.unwrap_or_else(|| "android".to_string()),
        })
    }
}

/// Configuration errors
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("invalid URL: {0}")]
    InvalidUrl(String),
    #[error("missing value: {0}")]
    MissingValue(&'static str),
}
