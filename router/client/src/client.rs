use crate::ndjson::NdjsonDecoder;
use crate::{
    ChatChunk, ChatMessage, ClientError, EmbedResponse, ModelTag, Result, RunningModel,
    RunningModelsResponse, TagsResponse, VersionResponse,
};
use futures::{Stream, StreamExt};
use reqwest::Method;
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::json;
use std::pin::Pin;
use std::time::Duration;
use tracing::instrument;

/// Stream of decoded chat chunks. Dropping it aborts the remote request.
pub type ChunkStream = Pin<Box<dyn Stream<Item = Result<ChatChunk>> + Send>>;

const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

/// Model server HTTP client
#[derive(Clone, Debug)]
pub struct Client {
    http: reqwest::Client,
    base_url: String,
    api_key: Option<String>,
}

impl Client {
    /// Returns a client for the instance reachable at `base_url`
    pub fn new(base_url: impl Into<String>, api_key: Option<String>) -> Result<Self> {
        let http = reqwest::Client::builder()
            .connect_timeout(CONNECT_TIMEOUT)
            .build()?;
        let base_url = base_url.into().trim_end_matches('/').to_string();
        Ok(Self {
            http,
            base_url,
            api_key,
        })
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    fn request(&self, method: Method, endpoint: &str) -> reqwest::RequestBuilder {
        let builder = self
            .http
            .request(method, format!("{}{endpoint}", self.base_url));
        match &self.api_key {
            Some(api_key) => builder.bearer_auth(api_key),
            None => builder,
        }
    }

    async fn check(response: reqwest::Response) -> Result<reqwest::Response> {
        let status = response.status();
        if status.is_success() {
            return Ok(response);
        }
        let body = response.text().await.unwrap_or_default();
        let err = ClientError::Http {
            status: status.as_u16(),
            body,
        };
        tracing::warn!("{err}");
        Err(err)
    }

    async fn get<T: DeserializeOwned>(&self, endpoint: &str) -> Result<T> {
        let response = self.request(Method::GET, endpoint).send().await?;
        Ok(Self::check(response).await?.json().await?)
    }

    async fn post<B: Serialize + ?Sized, T: DeserializeOwned>(
        &self,
        endpoint: &str,
        body: &B,
    ) -> Result<T> {
        let response = self
            .request(Method::POST, endpoint)
            .json(body)
            .send()
            .await?;
        Ok(Self::check(response).await?.json().await?)
    }

    /// Server version, also used as a liveness probe
    #[instrument(skip(self), fields(url = %self.base_url))]
    pub async fn version(&self) -> Result<Option<String>> {
        let response: VersionResponse = self.get("/api/version").await?;
        Ok(response.version)
    }

    /// Models installed on the instance
    #[instrument(skip(self), fields(url = %self.base_url))]
    pub async fn tags(&self) -> Result<Vec<ModelTag>> {
        let response: TagsResponse = self.get("/api/tags").await?;
        Ok(response.models)
    }

    /// Models currently resident in memory
    #[instrument(skip(self), fields(url = %self.base_url))]
    pub async fn running_models(&self) -> Result<Vec<RunningModel>> {
        let response: RunningModelsResponse = self.get("/api/ps").await?;
        Ok(response.models)
    }

    /// Start a streamed chat completion
    ///
    /// Streaming is always requested so that callers can stop reading at any
    /// fragment boundary.
    #[instrument(skip(self, messages), fields(url = %self.base_url))]
    pub async fn chat_stream(&self, model: &str, messages: &[ChatMessage]) -> Result<ChunkStream> {
        let body = json!({
            "model": model,
            "messages": messages,
            "stream": true,
        });
        let response = self
            .request(Method::POST, "/api/chat")
            .json(&body)
            .send()
            .await?;
        let mut bytes = Box::pin(Self::check(response).await?.bytes_stream());

        let stream = async_stream::stream! {
            let mut decoder = NdjsonDecoder::new();
            let mut failed = false;
            while let Some(item) = bytes.next().await {
                match item {
                    Ok(bytes) => {
                        for chunk in decoder.push(&bytes) {
                            yield Ok(chunk);
                        }
                    }
                    Err(err) => {
                        failed = true;
                        yield Err(ClientError::from(err));
                        break;
                    }
                }
            }
            if !failed {
                if let Some(chunk) = decoder.finish() {
                    yield Ok(chunk);
                }
            }
        };
        Ok(Box::pin(stream))
    }

    /// Embed `input` with `model`
    #[instrument(skip(self, input), fields(url = %self.base_url))]
    pub async fn embed(&self, model: &str, input: &str) -> Result<Vec<Vec<f32>>> {
        let response: EmbedResponse = self
            .post("/api/embed", &json!({ "model": model, "input": input }))
            .await?;
        Ok(response.embeddings)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_base_url_is_normalized() {
        let client = Client::new("http://gpu-1:11434/", None).unwrap();
        assert_eq!(client.base_url(), "http://gpu-1:11434");
    }
}
