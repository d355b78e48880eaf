use anyhow::{Context, Result};
use std::collections::HashMap;

/// Environment-driven configuration for the reasoning session.
///
/// All fields are explicit; nothing is looked up lazily at call time.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LlmSettings {
    pub api_key: String,
    pub endpoint: Option<String>,
    pub deployment: Option<String>,
    pub api_version: Option<String>,
    pub timeout_secs: Option<u64>,
    pub max_retries: u32,
}

impl LlmSettings {
    const API_KEY_ENV: &'static str = "SSP_AUDIT_API_KEY";
    const ENDPOINT_ENV: &'static str = "SSP_AUDIT_ENDPOINT";
    const DEPLOYMENT_ENV: &'static str = "SSP_AUDIT_DEPLOYMENT";
    const API_VERSION_ENV: &'static str = "SSP_AUDIT_API_VERSION";
    const TIMEOUT_ENV: &'static str = "SSP_AUDIT_TIMEOUT_SECS";
    const RETRIES_ENV: &'static str = "SSP_AUDIT_MAX_RETRIES";

    /// Load settings from environment variables.
    ///
    /// * `SSP_AUDIT_API_KEY`    — API key/token (required).
    /// * `SSP_AUDIT_ENDPOINT`   — Azure OpenAI resource endpoint.
    /// * `SSP_AUDIT_DEPLOYMENT` — Deployment/model name.
    pub fn from_env() -> Result<Self> {
        Self::from_map(std::env::vars().collect())
    }

    fn from_map(vars: HashMap<String, String>) -> Result<Self> {
        let api_key = vars
            .get(Self::API_KEY_ENV)
            .cloned()
            .filter(|v| !v.trim().is_empty())
            .with_context(|| {
                format!(
                    "environment variable {} must be set for reasoning-backed assessment",
                    Self::API_KEY_ENV
                )
            })?;
        let endpoint = vars
            .get(Self::ENDPOINT_ENV)
            .cloned()
            .filter(|v| !v.trim().is_empty());
        let deployment = vars
            .get(Self::DEPLOYMENT_ENV)
            .cloned()
            .filter(|v| !v.trim().is_empty());
        let api_version = vars
            .get(Self::API_VERSION_ENV)
            .cloned()
            .filter(|v| !v.trim().is_empty());
        let timeout_secs = vars
            .get(Self::TIMEOUT_ENV)
            .and_then(|v| v.trim().parse::<u64>().ok());
        let max_retries = vars
            .get(Self::RETRIES_ENV)
            .and_then(|v| v.trim().parse::<u32>().ok())
            .unwrap_or(2);

        Ok(Self {
            api_key,
            endpoint,
            deployment,
            api_version,
            timeout_secs,
            max_retries,
        })
    }
}
