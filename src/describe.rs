use crate::api::ApiClient;
use crate::types::MultimodalBlock;
use anyhow::{Context, Result};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;

const COPYWRITER_INSTRUCTION: &str = "You are a marketing specialist who writes product \
descriptions for an online store. Write detailed, attractive and persuasive descriptions \
based on the product image and data.";

/// Catalog data a description is generated from.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ProductDetails {
    pub name: String,
    pub category: Option<String>,
    pub description: Option<String>,
    pub image_url: String,
}

#[derive(Debug, Error)]
pub enum DescribeError {
    #[error("no image URL was provided")]
    MissingImageUrl,
    #[error("no product name was provided")]
    MissingProductName,
    #[error("the image is not accessible (HTTP {0})")]
    ImageUnreachable(u16),
    #[error("the image URL cannot be reached: {0}")]
    ImageRequestFailed(String),
    #[error("description request failed: {0}")]
    Completion(String),
    #[error("the model returned an empty description")]
    EmptyReply,
}

/// Generates catalog copy for a product from its photo and existing data.
pub struct Describer {
    client: Arc<ApiClient>,
    http: reqwest::Client,
}

impl Describer {
    pub fn new(client: Arc<ApiClient>, timeout: Duration) -> Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .context("failed to build image check HTTP client")?;
        Ok(Self { client, http })
    }

    /// Validates the input, checks that the image answers a `HEAD` request and
    /// asks the model for a description of the pictured product.
    pub async fn describe(&self, product: &ProductDetails) -> Result<String, DescribeError> {
        let image_url = product.image_url.trim();
        if image_url.is_empty() {
            return Err(DescribeError::MissingImageUrl);
        }
        let name = product.name.trim();
        if name.is_empty() {
            return Err(DescribeError::MissingProductName);
        }

        self.check_image(image_url).await?;

        let messages = [
            MultimodalBlock::system(COPYWRITER_INSTRUCTION),
            MultimodalBlock::user_with_image(description_prompt(name, product), image_url),
        ];
        tracing::debug!(product = name, image_url, "requesting product description");
        let reply = self
            .client
            .complete(&messages)
            .await
            .map_err(|error| DescribeError::Completion(format!("{error:#}")))?;

        let reply = reply.trim();
        if reply.is_empty() {
            return Err(DescribeError::EmptyReply);
        }
        Ok(reply.to_string())
    }

    async fn check_image(&self, image_url: &str) -> Result<(), DescribeError> {
        let response = self.http.head(image_url).send().await.map_err(|error| {
            tracing::warn!(image_url, %error, "image check failed");
            DescribeError::ImageRequestFailed(error.to_string())
        })?;

        let status = response.status();
        if !status.is_success() {
            tracing::warn!(image_url, status = status.as_u16(), "image is not accessible");
            return Err(DescribeError::ImageUnreachable(status.as_u16()));
        }
        Ok(())
    }
}

fn description_prompt(name: &str, product: &ProductDetails) -> String {
    let category = non_blank(product.category.as_deref()).unwrap_or("product");
    let details = non_blank(product.description.as_deref()).unwrap_or("Not available");
    format!(
        "Write a detailed and attractive description for a product called \"{name}\" \
in the category \"{category}\".\n\n\
Additional product information: \"{details}\"\n\n\
The description must:\n\
- be 3 to 5 sentences long\n\
- highlight likely features, benefits and uses\n\
- be persuasive and professional\n\
- not mention that it was generated\n\
- focus on the product's quality, design and value\n\
- complement the existing description instead of repeating it\n\
- use the image to identify visual features\n\n\
Reply ONLY with the description, without introduction or extra comments."
    )
}

fn non_blank(value: Option<&str>) -> Option<&str> {
    value.map(str::trim).filter(|v| !v.is_empty())
}
