use crate::api::client::{ByteStream, MockStreamProducer};
use crate::types::ContextBlock;
use anyhow::Result;
use bytes::Bytes;
use futures::stream;
use serde_json::Value;
use std::sync::{Arc, Mutex};

/// Scripted chunk source for one or more turns.
///
/// Every entry of a turn is delivered as one network chunk, exactly as given,
/// except that a trailing newline is added when missing so each entry is a
/// complete frame. Use `new_raw` to control boundaries byte-for-byte.
#[derive(Clone)]
pub struct MockApiClient {
    responses: Arc<Mutex<Vec<Vec<String>>>>,
    frame_chunks: bool,
    seen_messages: Arc<Mutex<Vec<Vec<ContextBlock>>>>,
    seen_completions: Arc<Mutex<Vec<Value>>>,
}

impl MockApiClient {
    pub fn new(responses: Vec<Vec<String>>) -> Self {
        Self {
            responses: Arc::new(Mutex::new(responses)),
            frame_chunks: true,
            seen_messages: Arc::default(),
            seen_completions: Arc::default(),
        }
    }

    pub fn new_raw(responses: Vec<Vec<String>>) -> Self {
        Self {
            frame_chunks: false,
            ..Self::new(responses)
        }
    }

    fn next_response(&self) -> Result<Vec<String>> {
        let mut responses_guard = self.responses.lock().unwrap();
        if responses_guard.is_empty() {
            return Err(anyhow::anyhow!(
                "MockApiClient: No more responses configured"
            ));
        }
        Ok(responses_guard.remove(0))
    }

    pub fn seen_messages(&self) -> Vec<Vec<ContextBlock>> {
        self.seen_messages.lock().unwrap().clone()
    }

    /// Message arrays received by non-streaming completions, as JSON.
    pub fn seen_completions(&self) -> Vec<Value> {
        self.seen_completions.lock().unwrap().clone()
    }
}

impl MockStreamProducer for MockApiClient {
    fn create_mock_stream(&self, messages: &[ContextBlock]) -> Result<ByteStream> {
        self.seen_messages.lock().unwrap().push(messages.to_vec());

        let current_chunks = self.next_response()?;
        let frame_chunks = self.frame_chunks;

        let byte_chunks: Vec<Result<Bytes>> = current_chunks
            .into_iter()
            .map(|s| {
                let framed = if !frame_chunks || s.ends_with('\n') {
                    s
                } else {
                    format!("{s}\n")
                };
                Ok(Bytes::from(framed))
            })
            .collect();

        Ok(Box::pin(stream::iter(byte_chunks)))
    }

    fn create_mock_completion(&self, messages: Value) -> Result<String> {
        self.seen_completions.lock().unwrap().push(messages);
        Ok(self.next_response()?.concat())
    }
}
