use super::logging::{debug_payload_enabled, emit_debug_payload};
use crate::config::Config;
use crate::types::{ChatRequest, CompletionResponse, ContextBlock};
use crate::util::is_local_endpoint_url;
use anyhow::{anyhow, Context, Result};
use bytes::Bytes;
use futures::{Stream, StreamExt};
use serde::Serialize;
use std::pin::Pin;
#[cfg(test)]
use std::sync::Arc;

pub type ByteStream = Pin<Box<dyn Stream<Item = Result<Bytes>> + Send>>;

#[cfg(test)]
pub trait MockStreamProducer: Send + Sync {
    fn create_mock_stream(&self, messages: &[ContextBlock]) -> Result<ByteStream>;

    /// Receives the messages as they would be serialized on the wire.
    fn create_mock_completion(&self, _messages: serde_json::Value) -> Result<String> {
        Err(anyhow!("mock completion not configured"))
    }
}

#[derive(Clone)]
pub struct ApiClient {
    http: reqwest::Client,
    api_key: Option<String>,
    model: String,
    api_url: String,
    #[cfg(test)]
    mock_stream_producer: Option<Arc<dyn MockStreamProducer>>,
}

impl ApiClient {
    pub fn new(config: &Config) -> Result<Self> {
        Ok(Self {
            http: reqwest::Client::new(),
            api_key: config.api_key.clone(),
            model: config.model.clone(),
            api_url: config.api_url.clone(),
            #[cfg(test)]
            mock_stream_producer: None,
        })
    }

    #[cfg(test)]
    pub fn new_mock(mock_producer: Arc<dyn MockStreamProducer>) -> Self {
        Self {
            http: reqwest::Client::new(),
            api_key: None,
            model: "mock-model".to_string(),
            api_url: "http://localhost:8000/v1/chat/completions".to_string(),
            mock_stream_producer: Some(mock_producer),
        }
    }

    pub fn model(&self) -> &str {
        &self.model
    }

    pub fn is_local_endpoint(&self) -> bool {
        is_local_endpoint_url(&self.api_url)
    }

    /// Posts a streaming completion request and returns the raw response body.
    ///
    /// Resolves once response headers arrive; non-2xx statuses are errors.
    pub async fn create_stream(&self, messages: &[ContextBlock]) -> Result<ByteStream> {
        #[cfg(test)]
        {
            if let Some(producer) = &self.mock_stream_producer {
                return producer.create_mock_stream(messages);
            }
        }

        let response = self.post(messages, true).await?;
        let request_url = self.api_url.clone();
        let stream = response
            .bytes_stream()
            .map(move |item| item.map_err(|error| map_api_request_error(error, &request_url)));
        Ok(Box::pin(stream))
    }

    /// Non-streaming completion; returns the first choice's message text.
    ///
    /// Accepts plain [`ContextBlock`]s as well as multimodal messages.
    pub async fn complete<M: Serialize>(&self, messages: &[M]) -> Result<String> {
        #[cfg(test)]
        {
            if let Some(producer) = &self.mock_stream_producer {
                return producer.create_mock_completion(serde_json::to_value(messages)?);
            }
        }

        let response = self.post(messages, false).await?;
        let body: CompletionResponse = response
            .json()
            .await
            .with_context(|| format!("invalid completion response from '{}'", self.api_url))?;

        body.choices
            .into_iter()
            .next()
            .and_then(|choice| choice.message.content)
            .ok_or_else(|| anyhow!("completion response from '{}' had no content", self.api_url))
    }

    async fn post<M: Serialize>(&self, messages: &[M], stream: bool) -> Result<reqwest::Response> {
        let payload = ChatRequest {
            model: &self.model,
            messages,
            stream,
        };

        if debug_payload_enabled() {
            emit_debug_payload(&self.api_url, &serde_json::to_value(&payload)?);
        }

        let mut request = self
            .http
            .post(&self.api_url)
            .header("content-type", "application/json")
            .header("accept", if stream { "text/event-stream" } else { "application/json" })
            .json(&payload);

        if let Some(api_key) = &self.api_key {
            request = request.bearer_auth(api_key);
        }

        tracing::debug!(
            url = %self.api_url,
            model = %self.model,
            blocks = messages.len(),
            stream,
            "sending completion request"
        );

        request
            .send()
            .await
            .map_err(|error| map_api_request_error(error, &self.api_url))?
            .error_for_status()
            .map_err(|error| map_api_request_error(error, &self.api_url))
    }
}

pub(crate) fn map_api_request_error(error: reqwest::Error, request_url: &str) -> anyhow::Error {
    if error.is_connect() && is_local_endpoint_url(request_url) {
        return anyhow!(
            "cannot reach local endpoint '{}': {}. Start your local server or update STOREFRONT_API_URL.",
            request_url,
            error
        );
    }
    if error.is_connect() {
        return anyhow!("cannot reach endpoint '{}': {}", request_url, error);
    }
    if error.is_timeout() {
        return anyhow!("request to '{}' timed out: {}", request_url, error);
    }
    if let Some(status) = error.status() {
        return anyhow!(
            "endpoint '{}' returned HTTP {}: {}",
            request_url,
            status,
            error
        );
    }
    anyhow!("request to '{}' failed: {}", request_url, error)
}
