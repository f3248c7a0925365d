/// Inference Pool Webserver
pub mod capacity;
pub mod config;
pub mod degeneracy;
pub mod embeddings;
pub mod gate;
pub mod infer;
pub mod logging;
pub mod selector;
pub mod server;

use inference_pool_client::ChatMessage;
use serde::{Deserialize, Serialize};
use utoipa::ToSchema;

#[derive(Clone, Debug, Serialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct Info {
    /// Router Info
    #[schema(example = "0.4.0")]
    pub version: &'static str,
    #[schema(nullable = true, example = "null")]
    pub sha: Option<&'static str>,
    #[schema(nullable = true, example = "2024-06-01T12:00:00.000000000Z")]
    pub build_timestamp: Option<&'static str>,
    /// Pool Parameters
    #[schema(example = "2")]
    pub instances: usize,
    #[schema(example = "2147483648")]
    pub safety_buffer: u64,
    #[schema(example = "1000")]
    pub embedding_cache_size: usize,
}

#[derive(Clone, Debug, Deserialize, ToSchema)]
pub(crate) struct Message {
    #[schema(example = "user")]
    pub role: String,
    #[schema(example = "Why is the sky blue?")]
    pub content: String,
    /// Base64 encoded images
    #[serde(default)]
    pub images: Vec<String>,
}

impl From<Message> for ChatMessage {
    fn from(message: Message) -> Self {
        ChatMessage {
            role: message.role,
            content: message.content,
            images: message.images,
        }
    }
}

#[derive(Clone, Debug, Deserialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub(crate) struct ChatCompletionRequest {
    #[schema(example = "llama3:8b")]
    pub model: String,
    pub messages: Vec<Message>,
    /// Stream fragments as server-sent events
    #[serde(default)]
    #[schema(default = "false")]
    pub stream: bool,
    /// Bound on the whole request in milliseconds
    #[serde(default)]
    #[schema(nullable = true, default = "null", example = 30000)]
    pub timeout_ms: Option<u64>,
    /// Abort once the same fragment has been streamed this many times
    #[serde(default)]
    #[schema(nullable = true, default = "null", exclusive_minimum = 0, example = 20)]
    pub abort_on_repeats: Option<usize>,
}

#[derive(Clone, Debug, Deserialize, ToSchema)]
pub(crate) struct EmbedRequest {
    #[schema(example = "nomic-embed-text")]
    pub model: String,
    #[schema(example = "What is Deep Learning?")]
    pub input: String,
}

#[derive(Clone, Debug, Serialize, ToSchema)]
pub(crate) struct EmbedResponse {
    #[schema(example = json!([0.0, 1.0, 2.0]))]
    pub embedding: Vec<f32>,
}

#[derive(Clone, Debug, Serialize, ToSchema)]
pub(crate) struct StreamFragment {
    #[schema(example = "The sky")]
    pub content: String,
}

#[derive(Serialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub(crate) struct ErrorResponse {
    pub error: String,
    pub error_type: String,
}
