//! Ollama-compatible model server HTTP client library

mod client;
mod ndjson;

pub use client::{ChunkStream, Client};
pub use ndjson::NdjsonDecoder;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Chat message as sent to the instance
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct ChatMessage {
    pub role: String,
    pub content: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub images: Vec<String>,
}

impl ChatMessage {
    pub fn new(role: impl Into<String>, content: impl Into<String>) -> Self {
        Self {
            role: role.into(),
            content: content.into(),
            images: Vec::new(),
        }
    }
}

/// One model installed on an instance (`/api/tags`)
#[derive(Clone, Debug, Deserialize)]
pub struct ModelTag {
    pub name: String,
    #[serde(default)]
    pub model: Option<String>,
    #[serde(default)]
    pub size: u64,
    #[serde(default)]
    pub digest: Option<String>,
}

#[derive(Clone, Debug, Deserialize)]
pub(crate) struct TagsResponse {
    #[serde(default)]
    pub models: Vec<ModelTag>,
}

/// One model currently resident on an instance (`/api/ps`)
#[derive(Clone, Debug, Default, Deserialize, PartialEq, Eq)]
pub struct RunningModel {
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub model: Option<String>,
    /// Total resident size in bytes
    #[serde(default)]
    pub size: u64,
    /// Part of `size` that lives in GPU memory
    #[serde(default)]
    pub size_vram: Option<u64>,
    #[serde(default)]
    pub expires_at: Option<String>,
}

impl RunningModel {
    /// Bytes of fast memory held by this model, falling back to the resident size
    pub fn vram_usage(&self) -> u64 {
        self.size_vram.unwrap_or(self.size)
    }
}

#[derive(Clone, Debug, Deserialize)]
pub(crate) struct RunningModelsResponse {
    #[serde(default)]
    pub models: Vec<RunningModel>,
}

#[derive(Clone, Debug, Deserialize)]
pub struct VersionResponse {
    #[serde(default)]
    pub version: Option<String>,
}

#[derive(Clone, Debug, Default, Deserialize, PartialEq, Eq)]
pub struct ChunkMessage {
    #[serde(default)]
    pub role: Option<String>,
    #[serde(default)]
    pub content: Option<String>,
}

/// One line of a streamed `/api/chat` response
#[derive(Clone, Debug, Default, Deserialize, PartialEq, Eq)]
pub struct ChatChunk {
    #[serde(default)]
    pub model: Option<String>,
    #[serde(default)]
    pub message: Option<ChunkMessage>,
    #[serde(default)]
    pub error: Option<String>,
    #[serde(default)]
    pub done: bool,
}

impl ChatChunk {
    /// Text content carried by this chunk, empty if none
    pub fn content(&self) -> &str {
        self.message
            .as_ref()
            .and_then(|m| m.content.as_deref())
            .unwrap_or("")
    }
}

#[derive(Clone, Debug, Deserialize)]
pub(crate) struct EmbedResponse {
    #[serde(default)]
    pub embeddings: Vec<Vec<f32>>,
}

#[derive(Error, Debug)]
pub enum ClientError {
    #[error("Could not connect to model server: {0}")]
    Connection(String),
    #[error("Model server returned {status}: {body}")]
    Http { status: u16, body: String },
    #[error("Could not decode model server response: {0}")]
    Decode(String),
    #[error("Server error: {0}")]
    Generation(String),
}

impl From<reqwest::Error> for ClientError {
    fn from(err: reqwest::Error) -> Self {
        let err = if err.is_decode() {
            Self::Decode(err.to_string())
        } else {
            Self::Connection(err.to_string())
        };
        tracing::error!("{err}");
        err
    }
}

pub type Result<T> = std::result::Result<T, ClientError>;
