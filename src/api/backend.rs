use super::client::map_api_request_error;
use crate::config::Config;
use crate::types::DataSnapshot;
use anyhow::{Context, Result};
use serde_json::Value;
use std::time::Duration;

const PRODUCTS_PATH: &str = "/producto";
const CATEGORIES_PATH: &str = "/categoria";
const ACCOUNT_DATA_PATH: &str = "/api/v2";

/// Read-only client for the storefront REST backend.
#[derive(Clone)]
pub struct BackendClient {
    http: reqwest::Client,
    base_url: String,
}

impl BackendClient {
    pub fn new(config: &Config) -> Result<Self> {
        Self::with_timeout(&config.backend_url, config.idle_timeout)
    }

    pub fn with_timeout(base_url: &str, timeout: Duration) -> Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .context("failed to build backend HTTP client")?;
        Ok(Self {
            http,
            base_url: base_url.trim_end_matches('/').to_string(),
        })
    }

    /// Loads every collection the assistant needs.
    ///
    /// Never fails: a collection whose request fails is left as `None`.
    pub async fn fetch_snapshot(&self) -> DataSnapshot {
        let (products, categories, account) = tokio::join!(
            self.fetch_json(PRODUCTS_PATH),
            self.fetch_json(CATEGORIES_PATH),
            self.fetch_json(ACCOUNT_DATA_PATH),
        );

        let products = log_failure(PRODUCTS_PATH, products);
        let categories = log_failure(CATEGORIES_PATH, categories);
        let account = log_failure(ACCOUNT_DATA_PATH, account);

        let mut snapshot = split_account_data(account.as_ref());
        snapshot.products = products.or_else(|| collection(account.as_ref(), "productos"));
        snapshot.categories = categories.or_else(|| collection(account.as_ref(), "categorias"));
        snapshot
    }

    async fn fetch_json(&self, path: &str) -> Result<Value> {
        let url = format!("{}{}", self.base_url, path);
        let response = self
            .http
            .get(&url)
            .header("content-type", "application/json")
            .send()
            .await
            .map_err(|error| map_api_request_error(error, &url))?
            .error_for_status()
            .map_err(|error| map_api_request_error(error, &url))?;

        response
            .json::<Value>()
            .await
            .with_context(|| format!("backend '{url}' returned invalid JSON"))
    }
}

fn log_failure(path: &str, result: Result<Value>) -> Option<Value> {
    match result {
        Ok(value) => Some(value),
        Err(error) => {
            tracing::warn!(path, error = %error, "backend collection unavailable");
            None
        }
    }
}

fn collection(account: Option<&Value>, key: &str) -> Option<Value> {
    account
        .and_then(|data| data.get(key))
        .filter(|value| !value.is_null())
        .cloned()
}

/// Splits the combined account payload into carts, orders and users.
pub(crate) fn split_account_data(account: Option<&Value>) -> DataSnapshot {
    DataSnapshot {
        carts: collection(account, "carritos"),
        orders: collection(account, "orden_compras"),
        users: collection(account, "usuarios"),
        ..DataSnapshot::default()
    }
}
