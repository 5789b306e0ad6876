//! Configuration management for the deploy service
//!
//! Loads configuration from environment variables with sensible defaults.

use anyhow::{Context, Result};
use std::env;
use std::path::PathBuf;

/// Application configuration
#[derive(Debug, Clone)]
pub struct Config {
    /// API server host
    pub host: String,

    /// API server port
    pub port: u16,

    /// Public base URL used to build servable deployment URLs
    pub base_url: String,

    /// Directory holding one working directory per deployment
    pub deploy_dir: PathBuf,

    /// Path of the deployment record store document
    pub store_path: PathBuf,

    /// Wall-clock limit for a repository clone, in seconds
    pub clone_timeout_secs: u64,

    /// Wall-clock limit for an install-and-build run, in seconds
    pub build_timeout_secs: u64,

    /// Fixed accounting size charged per deployment, in MB
    pub project_size_mb: u64,

    /// Free-tier storage ceiling, in MB
    pub free_limit_mb: u64,
}

impl Config {
    /// Load configuration from environment variables
    pub fn from_env() -> Result<Self> {
        let config = Config {
            host: env::var("HOST").unwrap_or_else(|_| "0.0.0.0".to_string()),

            port: env::var("PORT")
                .unwrap_or_else(|_| "5000".to_string())
                .parse()
                .context("Invalid PORT")?,

            base_url: env::var("BASE_URL").unwrap_or_else(|_| "http://localhost:5000".to_string()),

            deploy_dir: env::var("DEPLOY_DIR")
                .unwrap_or_else(|_| "./deployments".to_string())
                .into(),

            store_path: env::var("STORE_PATH")
                .unwrap_or_else(|_| "./deployments.json".to_string())
                .into(),

            clone_timeout_secs: env::var("CLONE_TIMEOUT_SECS")
                .unwrap_or_else(|_| "300".to_string())
                .parse()
                .context("Invalid CLONE_TIMEOUT_SECS")?,

            build_timeout_secs: env::var("BUILD_TIMEOUT_SECS")
                .unwrap_or_else(|_| "120".to_string())
                .parse()
                .context("Invalid BUILD_TIMEOUT_SECS")?,

            project_size_mb: env::var("PROJECT_SIZE_MB")
                .unwrap_or_else(|_| "40".to_string())
                .parse()
                .context("Invalid PROJECT_SIZE_MB")?,

            free_limit_mb: env::var("FREE_LIMIT_MB")
                .unwrap_or_else(|_| "200".to_string())
                .parse()
                .context("Invalid FREE_LIMIT_MB")?,
        };

        config.validate()?;

        Ok(config)
    }

    /// Validate configuration
    fn validate(&self) -> Result<()> {
        if self.port == 0 {
            anyhow::bail!("PORT must be greater than 0");
        }

        if self.project_size_mb == 0 {
            anyhow::bail!("PROJECT_SIZE_MB must be greater than 0");
        }

        if self.build_timeout_secs == 0 || self.clone_timeout_secs == 0 {
            anyhow::bail!("timeouts must be greater than 0");
        }

        Ok(())
    }

    /// Get the API server address
    pub fn api_address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    /// Ensure the deployments directory and the store's parent exist
    pub fn ensure_directories(&self) -> Result<()> {
        std::fs::create_dir_all(&self.deploy_dir).with_context(|| {
            format!(
                "Failed to create deployments directory: {}",
                self.deploy_dir.display()
            )
        })?;

        if let Some(parent) = self.store_path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent).with_context(|| {
                    format!("Failed to create store directory: {}", parent.display())
                })?;
            }
        }

        Ok(())
    }
}
