use crate::config::Instance;
use crate::infer::Backend;
use async_trait::async_trait;
use inference_pool_client::{ChatMessage, ChunkStream, Client, ClientError, RunningModel};
use parking_lot::Mutex;
use std::collections::HashMap;

/// Backend talking to Ollama compatible model servers over HTTP
#[derive(Debug, Default)]
pub struct OllamaBackend {
    /// One client per (url, api key), reused across requests
    clients: Mutex<HashMap<(String, Option<String>), Client>>,
}

impl OllamaBackend {
    pub fn new() -> Self {
        Self::default()
    }

    fn client(&self, instance: &Instance) -> Result<Client, ClientError> {
        let key = (instance.url.clone(), instance.api_key.clone());
        let mut clients = self.clients.lock();
        if let Some(client) = clients.get(&key) {
            return Ok(client.clone());
        }
        let client = Client::new(instance.url.clone(), instance.api_key.clone())?;
        clients.insert(key, client.clone());
        Ok(client)
    }
}

#[async_trait]
impl Backend for OllamaBackend {
    async fn available_models(&self, instance: &Instance) -> Result<Vec<String>, ClientError> {
        let tags = self.client(instance)?.tags().await?;
        Ok(tags.into_iter().map(|tag| tag.name).collect())
    }

    async fn running_models(&self, instance: &Instance) -> Result<Vec<RunningModel>, ClientError> {
        self.client(instance)?.running_models().await
    }

    async fn chat_stream(
        &self,
        instance: &Instance,
        model: &str,
        messages: &[ChatMessage],
    ) -> Result<ChunkStream, ClientError> {
        self.client(instance)?.chat_stream(model, messages).await
    }

    async fn embed(
        &self,
        instance: &Instance,
        model: &str,
        text: &str,
    ) -> Result<Vec<Vec<f32>>, ClientError> {
        self.client(instance)?.embed(model, text).await
    }
}
