use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    System,
    User,
    Assistant,
}

/// One role-tagged unit of conversation context.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ContextBlock {
    pub role: Role,
    pub content: String,
}

impl ContextBlock {
    pub fn system(content: impl Into<String>) -> Self {
        Self {
            role: Role::System,
            content: content.into(),
        }
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: Role::User,
            content: content.into(),
        }
    }
}

/// One piece of a multimodal message.
#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ContentPart {
    Text { text: String },
    ImageUrl { image_url: ImageRef },
}

#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct ImageRef {
    pub url: String,
}

#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
#[serde(untagged)]
pub enum MessageContent {
    Text(String),
    Parts(Vec<ContentPart>),
}

/// A message whose content may mix text and images.
#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct MultimodalBlock {
    pub role: Role,
    pub content: MessageContent,
}

impl MultimodalBlock {
    pub fn system(content: impl Into<String>) -> Self {
        Self {
            role: Role::System,
            content: MessageContent::Text(content.into()),
        }
    }

    pub fn user_with_image(text: impl Into<String>, image_url: impl Into<String>) -> Self {
        Self {
            role: Role::User,
            content: MessageContent::Parts(vec![
                ContentPart::Text { text: text.into() },
                ContentPart::ImageUrl {
                    image_url: ImageRef {
                        url: image_url.into(),
                    },
                },
            ]),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct ChatRequest<'a, M = ContextBlock> {
    pub model: &'a str,
    pub messages: &'a [M],
    pub stream: bool,
}

#[derive(Debug, Clone, Deserialize)]
pub struct StreamChunk {
    #[serde(default)]
    pub choices: Vec<ChunkChoice>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ChunkChoice {
    #[serde(default)]
    pub delta: ChunkDelta,
    #[serde(default)]
    pub finish_reason: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct ChunkDelta {
    #[serde(default)]
    pub content: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ErrorFrame {
    pub message: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct CompletionResponse {
    #[serde(default)]
    pub choices: Vec<CompletionChoice>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct CompletionChoice {
    pub message: CompletionMessage,
}

#[derive(Debug, Clone, Deserialize)]
pub struct CompletionMessage {
    #[serde(default)]
    pub content: Option<String>,
}

/// A single decoded unit of the completion stream.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StreamEvent {
    Delta(String),
    Done,
    Error(String),
}

impl StreamEvent {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Done | Self::Error(_))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_chat_request_serializes_wire_shape() {
        let blocks = vec![ContextBlock::system("rules"), ContextBlock::user("hola")];
        let request = ChatRequest {
            model: "mistral-large-latest",
            messages: &blocks,
            stream: true,
        };
        let serialized = serde_json::to_value(&request).unwrap();

        assert_eq!(
            serialized,
            serde_json::json!({
                "model": "mistral-large-latest",
                "messages": [
                    { "role": "system", "content": "rules" },
                    { "role": "user", "content": "hola" }
                ],
                "stream": true
            })
        );
    }

    #[test]
    fn test_stream_chunk_tolerates_missing_delta_content() {
        let chunk: StreamChunk =
            serde_json::from_str(r#"{"choices":[{"delta":{"role":"assistant"}}]}"#).unwrap();
        assert_eq!(chunk.choices.len(), 1);
        assert!(chunk.choices[0].delta.content.is_none());
    }

    #[test]
    fn test_multimodal_block_serializes_text_and_image_parts() {
        let blocks = vec![
            MultimodalBlock::system("describe"),
            MultimodalBlock::user_with_image("Mate", "https://img.example/mate.jpg"),
        ];
        let request = ChatRequest {
            model: "pixtral-large-latest",
            messages: &blocks,
            stream: false,
        };

        assert_eq!(
            serde_json::to_value(&request).unwrap()["messages"],
            serde_json::json!([
                { "role": "system", "content": "describe" },
                {
                    "role": "user",
                    "content": [
                        { "type": "text", "text": "Mate" },
                        { "type": "image_url", "image_url": { "url": "https://img.example/mate.jpg" } }
                    ]
                }
            ])
        );
    }
}
