use anyhow::{bail, Result};
use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::types::{Viewer, ViewerRole};
use crate::util::is_local_endpoint_url;

pub const DEFAULT_API_URL: &str = "https://api.mistral.ai/v1/chat/completions";
pub const DEFAULT_MODEL: &str = "mistral-large-latest";
pub const DEFAULT_BACKEND_URL: &str = "http://localhost:3001";
pub const DEFAULT_CURRENCY: &str = "CLP";
const DEFAULT_IDLE_TIMEOUT_SECS: u64 = 30;
const MAX_IDLE_TIMEOUT_SECS: u64 = 600;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    pub api_key: Option<String>,
    pub model: String,
    pub api_url: String,
    pub backend_url: String,
    pub currency: String,
    pub idle_timeout: Duration,
    pub viewer: Viewer,
}

impl Config {
    pub fn load() -> Result<Self> {
        let api_url = non_empty_env("STOREFRONT_API_URL").unwrap_or_else(|| DEFAULT_API_URL.to_string());
        let api_key = non_empty_env("STOREFRONT_API_KEY");
        let model = non_empty_env("STOREFRONT_MODEL").unwrap_or_else(|| DEFAULT_MODEL.to_string());
        let backend_url = non_empty_env("STOREFRONT_BACKEND_URL")
            .unwrap_or_else(|| DEFAULT_BACKEND_URL.to_string());
        let currency =
            non_empty_env("STOREFRONT_CURRENCY").unwrap_or_else(|| DEFAULT_CURRENCY.to_string());
        let idle_timeout = resolve_idle_timeout(non_empty_env("STOREFRONT_IDLE_TIMEOUT_SECS"));

        let role = match non_empty_env("STOREFRONT_VIEWER_ROLE") {
            Some(raw) => match ViewerRole::parse(&raw) {
                Some(role) => role,
                None => bail!("Invalid STOREFRONT_VIEWER_ROLE '{raw}': expected 'admin' or 'customer'"),
            },
            None => ViewerRole::Customer,
        };
        let viewer = Viewer {
            role,
            id: non_empty_env("STOREFRONT_VIEWER_ID"),
        };

        Ok(Self {
            api_key,
            model,
            api_url,
            backend_url,
            currency,
            idle_timeout,
            viewer,
        })
    }

    pub fn validate(&self) -> Result<()> {
        for (name, url) in [
            ("STOREFRONT_API_URL", &self.api_url),
            ("STOREFRONT_BACKEND_URL", &self.backend_url),
        ] {
            if !url.starts_with("http://") && !url.starts_with("https://") {
                bail!("Invalid {name} '{url}': expected http:// or https:// URL");
            }
        }

        if !self.is_local_endpoint() && self.api_key.is_none() {
            bail!(
                "STOREFRONT_API_KEY must be set for non-local endpoints (url: '{}')",
                self.api_url
            );
        }

        if self.model.trim().is_empty() {
            bail!("STOREFRONT_MODEL must not be empty");
        }

        Ok(())
    }

    pub fn is_local_endpoint(&self) -> bool {
        is_local_endpoint_url(&self.api_url)
    }
}

fn non_empty_env(name: &str) -> Option<String> {
    std::env::var(name)
        .ok()
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
}

fn resolve_idle_timeout(raw: Option<String>) -> Duration {
    let secs = raw
        .and_then(|v| v.parse::<u64>().ok())
        .unwrap_or(DEFAULT_IDLE_TIMEOUT_SECS)
        .clamp(1, MAX_IDLE_TIMEOUT_SECS);
    Duration::from_secs(secs)
}
