mod ollama;

pub use ollama::OllamaBackend;

use crate::config::Instance;
use crate::degeneracy::DegeneracyDetector;
use crate::embeddings::EmbeddingCache;
use crate::gate::GateClosed;
use crate::selector::{InstanceSelector, Selection};
use async_trait::async_trait;
use futures::StreamExt;
use inference_pool_client::{ChatMessage, ChunkStream, ClientError, RunningModel};
use serde::Serialize;
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use thiserror::Error;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::instrument;
use utoipa::ToSchema;

/// Operations the pool needs from a model server
#[async_trait]
pub trait Backend: Send + Sync {
    /// Names of the models the instance can serve
    async fn available_models(&self, instance: &Instance) -> Result<Vec<String>, ClientError>;

    /// Models currently resident in memory
    async fn running_models(&self, instance: &Instance) -> Result<Vec<RunningModel>, ClientError>;

    async fn chat_stream(
        &self,
        instance: &Instance,
        model: &str,
        messages: &[ChatMessage],
    ) -> Result<ChunkStream, ClientError>;

    async fn embed(
        &self,
        instance: &Instance,
        model: &str,
        text: &str,
    ) -> Result<Vec<Vec<f32>>, ClientError>;
}

#[derive(Clone, Debug)]
pub struct ChatRequest {
    pub model: String,
    pub messages: Vec<ChatMessage>,
}

/// Called with every streamed fragment
pub type FragmentCallback = Box<dyn FnMut(&str) + Send>;

#[derive(Default)]
pub struct ChatOptions {
    /// Bound on the whole request, gate wait included
    pub timeout: Option<Duration>,
    pub cancel: Option<CancellationToken>,
    pub on_fragment: Option<FragmentCallback>,
    /// Abort once the same fragment has been streamed this many times
    pub abort_on_repeats: Option<usize>,
}

#[derive(Clone, Debug, Serialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct ChatResult {
    #[schema(example = "The sky is blue because of Rayleigh scattering.")]
    pub content: String,
    pub success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    #[schema(nullable = true)]
    pub error: Option<ChatError>,
    pub issues: ChatIssues,
    pub metadata: ChatMetadata,
}

#[derive(Clone, Debug, Default, Serialize, ToSchema, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct ChatIssues {
    pub timeout: bool,
    /// Content is usable but incomplete
    pub partial_result: bool,
}

#[derive(Clone, Debug, Serialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct ChatMetadata {
    #[schema(example = "http://gpu-1:11434")]
    pub instance_url: String,
    /// Number of content fragments received
    #[schema(example = "42")]
    pub tokens_processed: usize,
    #[schema(example = "1250")]
    pub time_elapsed_ms: u64,
    /// Unix time in milliseconds of the last fragment
    #[schema(nullable = true, example = "1717000000000")]
    pub last_chunk_timestamp: Option<u64>,
}

#[derive(Clone, Debug, Serialize, ToSchema, PartialEq, Eq)]
pub struct ChatError {
    #[schema(example = "backend")]
    pub kind: String,
    #[schema(example = "Model server error: out of memory")]
    pub message: String,
}

impl From<&InferError> for ChatError {
    fn from(err: &InferError) -> Self {
        Self {
            kind: err.error_type().to_string(),
            message: err.to_string(),
        }
    }
}

/// Inference struct
#[derive(Clone)]
pub struct Infer {
    backend: Arc<dyn Backend>,
    selector: Arc<InstanceSelector>,
    embedding_cache: Arc<EmbeddingCache>,
}

/// How the streaming loop ended
#[derive(Debug)]
enum StreamEnd {
    Completed,
    TimedOut,
    Cancelled,
    Failed(InferError),
}

#[derive(Debug, Default)]
struct Accumulated {
    content: String,
    fragments: usize,
    last_chunk: Option<SystemTime>,
}

impl Infer {
    pub fn new(
        backend: Arc<dyn Backend>,
        selector: Arc<InstanceSelector>,
        embedding_cache: Arc<EmbeddingCache>,
    ) -> Self {
        Self {
            backend,
            selector,
            embedding_cache,
        }
    }

    pub fn selector(&self) -> &InstanceSelector {
        &self.selector
    }

    pub fn embedding_cache(&self) -> &EmbeddingCache {
        &self.embedding_cache
    }

    /// Run a chat request on the least loaded instance serving the model
    ///
    /// Only selection failures are returned as `Err`. Timeouts, cancellation
    /// and backend failures produce a `ChatResult` carrying the partial content.
    #[instrument(skip_all, fields(model = %request.model))]
    pub async fn chat(
        &self,
        request: ChatRequest,
        mut options: ChatOptions,
    ) -> Result<ChatResult, InferError> {
        let start = Instant::now();
        let deadline = options.timeout.map(|timeout| start + timeout);

        let selection = self.selector.select(&request.model).await.map_err(|err| {
            metrics::counter!("pool_request_failure", "err" => err.error_type()).increment(1);
            tracing::error!("{err}");
            err
        })?;

        let mut output = Accumulated::default();
        let end = self
            .stream_chat(&selection, &request, &mut options, deadline, &mut output)
            .await;
        let elapsed = start.elapsed();
        metrics::histogram!("pool_request_duration").record(elapsed.as_secs_f64());

        let (success, error, timeout, interrupted) = match end {
            StreamEnd::Completed => {
                metrics::counter!("pool_request_success").increment(1);
                (true, None, false, false)
            }
            StreamEnd::TimedOut => {
                metrics::counter!("pool_request_failure", "err" => "timeout").increment(1);
                tracing::warn!("Request timed out after {elapsed:?}");
                (true, None, true, true)
            }
            StreamEnd::Cancelled => {
                metrics::counter!("pool_request_failure", "err" => "cancelled").increment(1);
                tracing::info!("Request cancelled after {elapsed:?}");
                (true, None, false, true)
            }
            StreamEnd::Failed(err) => {
                metrics::counter!("pool_request_failure", "err" => err.error_type()).increment(1);
                tracing::error!("{err}");
                (false, Some(ChatError::from(&err)), false, true)
            }
        };

        Ok(ChatResult {
            success,
            error,
            issues: ChatIssues {
                timeout,
                partial_result: interrupted && !output.content.is_empty(),
            },
            metadata: ChatMetadata {
                instance_url: selection.instance.url,
                tokens_processed: output.fragments,
                time_elapsed_ms: elapsed.as_millis() as u64,
                last_chunk_timestamp: output.last_chunk.map(unix_millis),
            },
            content: output.content,
        })
    }

    /// Hold a gate permit for as long as the remote stream is read
    async fn stream_chat(
        &self,
        selection: &Selection,
        request: &ChatRequest,
        options: &mut ChatOptions,
        deadline: Option<Instant>,
        output: &mut Accumulated,
    ) -> StreamEnd {
        let cancel = options.cancel.clone().unwrap_or_default();
        let expired = async move {
            match deadline {
                Some(deadline) => tokio::time::sleep_until(deadline).await,
                None => futures::future::pending().await,
            }
        };
        tokio::pin!(expired);

        let url = &selection.instance.url;
        let gate = &selection.gate;
        let waiting = metrics::gauge!("pool_gate_waiting", "instance" => url.clone());
        let admission = tokio::select! {
            biased;
            _ = cancel.cancelled() => Err(StreamEnd::Cancelled),
            _ = &mut expired => Err(StreamEnd::TimedOut),
            permit = gate.acquire() => permit.map_err(|err| StreamEnd::Failed(err.into())),
        };
        // Queue depth once this request left it
        waiting.set(gate.waiting() as f64);
        let _permit = match admission {
            Ok(permit) => permit,
            Err(end) => return end,
        };
        tracing::debug!("Admitted on {url} ({} in flight)", gate.in_flight());

        let mut stream = tokio::select! {
            biased;
            _ = cancel.cancelled() => return StreamEnd::Cancelled,
            _ = &mut expired => return StreamEnd::TimedOut,
            stream = self.backend.chat_stream(&selection.instance, &request.model, &request.messages) => {
                match stream {
                    Ok(stream) => stream,
                    Err(err) => return StreamEnd::Failed(err.into()),
                }
            }
        };

        let mut detector = DegeneracyDetector::new(options.abort_on_repeats);
        // Dropping `stream` on return aborts the remote generation
        loop {
            let chunk = tokio::select! {
                biased;
                _ = cancel.cancelled() => return StreamEnd::Cancelled,
                _ = &mut expired => return StreamEnd::TimedOut,
                chunk = stream.next() => chunk,
            };
            let chunk = match chunk {
                None => return StreamEnd::Completed,
                Some(Err(err)) => return StreamEnd::Failed(err.into()),
                Some(Ok(chunk)) => chunk,
            };
            if let Some(error) = chunk.error.as_deref() {
                return StreamEnd::Failed(ClientError::Generation(error.to_string()).into());
            }
            if cancel.is_cancelled() {
                return StreamEnd::Cancelled;
            }
            if deadline.is_some_and(|deadline| Instant::now() >= deadline) {
                return StreamEnd::TimedOut;
            }

            let fragment = chunk.content();
            if !fragment.is_empty() {
                if let Some(detected) = detector.observe(fragment) {
                    return StreamEnd::Failed(InferError::DegenerateOutput {
                        fragment: detected.fragment,
                        count: detected.count,
                    });
                }
                output.content.push_str(fragment);
                output.fragments += 1;
                output.last_chunk = Some(SystemTime::now());
                if let Some(callback) = options.on_fragment.as_mut() {
                    callback(fragment);
                }
            }
            if chunk.done {
                return StreamEnd::Completed;
            }
        }
    }

    /// Embedding of `text`, served from the cache when possible
    #[instrument(skip(self, text))]
    pub async fn embed(&self, model: &str, text: &str) -> Result<Vec<f32>, InferError> {
        self.embedding_cache
            .get_or_fetch(model, text, || async move {
                let selection = self.selector.select(model).await?;
                let _permit = selection.gate.acquire().await?;
                self.backend
                    .embed(&selection.instance, model, text)
                    .await?
                    .into_iter()
                    .next()
                    .ok_or_else(|| InferError::NoEmbedding(model.to_string()))
            })
            .await
            .map_err(|err| {
                metrics::counter!("pool_request_failure", "err" => err.error_type()).increment(1);
                tracing::error!("{err}");
                err
            })
    }
}

fn unix_millis(time: SystemTime) -> u64 {
    time.duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

#[derive(Debug, Error)]
pub enum InferError {
    #[error("No instance configured")]
    NoInstances,
    #[error("No instance available for model {0}")]
    Unavailable(String),
    #[error("Unknown instance {0}")]
    UnknownInstance(String),
    #[error("Model is overloaded: {0}")]
    Overloaded(#[from] GateClosed),
    #[error("Model server error: {0}")]
    Backend(#[from] ClientError),
    #[error("No embedding returned by model {0}")]
    NoEmbedding(String),
    #[error("Degenerate output: `{fragment}` repeated {count} times")]
    DegenerateOutput { fragment: String, count: usize },
}

impl InferError {
    pub(crate) fn error_type(&self) -> &'static str {
        match self {
            InferError::NoInstances => "no_instances",
            InferError::Unavailable(_) => "unavailable",
            InferError::UnknownInstance(_) => "unknown_instance",
            InferError::Overloaded(_) => "overloaded",
            InferError::Backend(_) => "backend",
            InferError::NoEmbedding(_) => "no_embedding",
            InferError::DegenerateOutput { .. } => "degenerate_output",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::capacity::CapacityEstimator;
    use crate::tests::{MockBackend, Step};
    use parking_lot::Mutex;

    fn setup(backend: MockBackend, permits: usize) -> (Infer, Arc<MockBackend>) {
        let backend = Arc::new(backend);
        let selector = InstanceSelector::new(
            backend.clone(),
            vec![Instance::new("http://gpu-1")],
            CapacityEstimator::default(),
        )
        .with_default_concurrency(Some(permits));
        let infer = Infer::new(
            backend.clone(),
            Arc::new(selector),
            Arc::new(EmbeddingCache::new(10)),
        );
        (infer, backend)
    }

    fn request() -> ChatRequest {
        ChatRequest {
            model: "llama3".to_string(),
            messages: vec![ChatMessage::new("user", "Why is the sky blue?")],
        }
    }

    fn releases(infer: &Infer) -> usize {
        infer.selector().gate("http://gpu-1").unwrap().releases()
    }

    #[tokio::test(start_paused = true)]
    async fn test_completed_stream() {
        let backend = MockBackend::new()
            .with_instance("http://gpu-1", &["llama3"], 0)
            .with_script(vec![
                Step::Fragment("The sky "),
                Step::Wait(Duration::from_millis(100)),
                Step::Fragment("is blue."),
                Step::Done,
            ]);
        let (infer, _) = setup(backend, 2);

        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = seen.clone();
        let options = ChatOptions {
            on_fragment: Some(Box::new(move |fragment: &str| {
                sink.lock().push(fragment.to_string())
            })),
            ..Default::default()
        };
        let result = infer.chat(request(), options).await.unwrap();

        assert!(result.success);
        assert_eq!(result.content, "The sky is blue.");
        assert_eq!(result.issues, ChatIssues::default());
        assert_eq!(result.metadata.instance_url, "http://gpu-1");
        assert_eq!(result.metadata.tokens_processed, 2);
        assert!(result.metadata.time_elapsed_ms >= 100);
        assert!(result.metadata.last_chunk_timestamp.is_some());
        assert_eq!(*seen.lock(), vec!["The sky ", "is blue."]);
        assert_eq!(releases(&infer), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_timeout_before_first_fragment() {
        let backend = MockBackend::new()
            .with_instance("http://gpu-1", &["llama3"], 0)
            .with_script(vec![
                Step::Wait(Duration::from_secs(30)),
                Step::Fragment("too late"),
                Step::Done,
            ]);
        let (infer, _) = setup(backend, 1);
        let options = ChatOptions {
            timeout: Some(Duration::from_secs(5)),
            ..Default::default()
        };
        let result = infer.chat(request(), options).await.unwrap();

        assert!(result.success);
        assert!(result.issues.timeout);
        assert!(!result.issues.partial_result);
        assert_eq!(result.content, "");
        assert_eq!(result.metadata.tokens_processed, 0);
        assert_eq!(result.metadata.last_chunk_timestamp, None);
        assert_eq!(releases(&infer), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_timeout_keeps_partial_content() {
        let backend = MockBackend::new()
            .with_instance("http://gpu-1", &["llama3"], 0)
            .with_script(vec![
                Step::Fragment("Once upon "),
                Step::Wait(Duration::from_secs(2)),
                Step::Fragment("a time"),
                Step::Hang,
            ]);
        let (infer, _) = setup(backend, 1);
        let options = ChatOptions {
            timeout: Some(Duration::from_secs(5)),
            ..Default::default()
        };
        let result = infer.chat(request(), options).await.unwrap();

        assert!(result.issues.timeout);
        assert!(result.issues.partial_result);
        assert_eq!(result.content, "Once upon a time");
        assert!(result.metadata.time_elapsed_ms >= 5000);
        assert_eq!(releases(&infer), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_error_after_three_fragments() {
        let backend = MockBackend::new()
            .with_instance("http://gpu-1", &["llama3"], 0)
            .with_script(vec![
                Step::Fragment("one "),
                Step::Fragment("two "),
                Step::Fragment("three"),
                Step::Fail("connection reset"),
            ]);
        let (infer, _) = setup(backend, 1);
        let result = infer.chat(request(), ChatOptions::default()).await.unwrap();

        assert!(!result.success);
        assert_eq!(result.content, "one two three");
        assert!(result.issues.partial_result);
        assert!(!result.issues.timeout);
        let error = result.error.unwrap();
        assert_eq!(error.kind, "backend");
        assert!(error.message.contains("connection reset"));
        assert_eq!(releases(&infer), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_error_chunk_is_a_failure() {
        let backend = MockBackend::new()
            .with_instance("http://gpu-1", &["llama3"], 0)
            .with_script(vec![Step::ErrorChunk("model not found")]);
        let (infer, _) = setup(backend, 1);
        let result = infer.chat(request(), ChatOptions::default()).await.unwrap();

        assert!(!result.success);
        assert!(!result.issues.partial_result);
        assert_eq!(result.error.unwrap().kind, "backend");
        assert_eq!(releases(&infer), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancellation() {
        let backend = MockBackend::new()
            .with_instance("http://gpu-1", &["llama3"], 0)
            .with_script(vec![Step::Fragment("partial"), Step::Hang]);
        let (infer, _) = setup(backend, 1);
        let cancel = CancellationToken::new();
        let options = ChatOptions {
            cancel: Some(cancel.clone()),
            ..Default::default()
        };

        let handle = tokio::spawn({
            let infer = infer.clone();
            async move { infer.chat(request(), options).await }
        });
        tokio::time::sleep(Duration::from_secs(1)).await;
        cancel.cancel();
        let result = handle.await.unwrap().unwrap();

        assert!(result.success);
        assert!(!result.issues.timeout);
        assert!(result.issues.partial_result);
        assert_eq!(result.content, "partial");
        assert_eq!(releases(&infer), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancelled_while_waiting_for_gate() {
        let backend = MockBackend::new()
            .with_instance("http://gpu-1", &["llama3"], 0)
            .with_script(vec![Step::Fragment("ok"), Step::Done]);
        let (infer, _) = setup(backend, 1);
        // Create the gate and hold its only permit
        let selection = infer.selector().select("llama3").await.unwrap();
        let held = selection.gate.acquire().await.unwrap();

        let cancel = CancellationToken::new();
        cancel.cancel();
        let options = ChatOptions {
            cancel: Some(cancel),
            ..Default::default()
        };
        let result = infer.chat(request(), options).await.unwrap();
        assert!(result.success);
        assert_eq!(result.content, "");
        assert_eq!(selection.gate.waiting(), 0);
        drop(held);
        assert_eq!(releases(&infer), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_degenerate_output() {
        let backend = MockBackend::new()
            .with_instance("http://gpu-1", &["llama3"], 0)
            .with_script(vec![
                Step::Fragment("ha"),
                Step::Fragment(" "),
                Step::Fragment("ha"),
                Step::Fragment("ha"),
                Step::Fragment("never"),
                Step::Done,
            ]);
        let (infer, _) = setup(backend, 1);
        let options = ChatOptions {
            abort_on_repeats: Some(3),
            ..Default::default()
        };
        let result = infer.chat(request(), options).await.unwrap();

        assert!(!result.success);
        assert_eq!(result.content, "ha ha");
        assert!(result.issues.partial_result);
        assert_eq!(result.error.unwrap().kind, "degenerate_output");
        assert_eq!(releases(&infer), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_selection_failure_is_an_error() {
        let backend = MockBackend::new().with_instance("http://gpu-1", &["mistral"], 0);
        let (infer, backend) = setup(backend, 1);
        let err = infer.chat(request(), ChatOptions::default()).await.unwrap_err();
        assert!(matches!(err, InferError::Unavailable(_)));
        assert!(backend.chat_calls().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_requests_beyond_capacity_wait() {
        let backend = MockBackend::new()
            .with_instance("http://gpu-1", &["llama3"], 0)
            .with_script(vec![
                Step::Wait(Duration::from_secs(1)),
                Step::Fragment("done"),
                Step::Done,
            ]);
        let (infer, backend) = setup(backend, 2);

        let start = Instant::now();
        let handles: Vec<_> = (0..4)
            .map(|_| {
                let infer = infer.clone();
                tokio::spawn(async move { infer.chat(request(), ChatOptions::default()).await })
            })
            .collect();
        for handle in handles {
            assert!(handle.await.unwrap().unwrap().success);
        }

        // Two waves of two requests
        let elapsed = start.elapsed();
        assert!(elapsed >= Duration::from_secs(2) && elapsed < Duration::from_secs(3));
        assert_eq!(backend.chat_calls().len(), 4);
        assert_eq!(releases(&infer), 4);
    }

    #[tokio::test(start_paused = true)]
    async fn test_gate_waiting_gauge_drains() {
        let recorder = metrics_exporter_prometheus::PrometheusBuilder::new().build_recorder();
        let handle = recorder.handle();
        let _guard = metrics::set_default_local_recorder(&recorder);

        let backend = MockBackend::new()
            .with_instance("http://gpu-1", &["llama3"], 0)
            .with_script(vec![Step::Wait(Duration::from_millis(100)), Step::Done]);
        let (infer, _) = setup(backend, 1);
        let results =
            futures::future::join_all((0..3).map(|_| infer.chat(request(), ChatOptions::default())))
                .await;
        assert!(results.into_iter().all(|result| result.unwrap().success));

        let rendered = handle.render();
        let waiting: f64 = rendered
            .lines()
            .find(|line| line.starts_with("pool_gate_waiting{"))
            .and_then(|line| line.rsplit(' ').next())
            .and_then(|value| value.parse().ok())
            .unwrap();
        assert_eq!(waiting, 0.0);
    }

    #[tokio::test]
    async fn test_embed() {
        let backend = MockBackend::new()
            .with_instance("http://gpu-1", &["nomic"], 0)
            .with_embeddings(vec![vec![0.1, 0.2]]);
        let (infer, backend) = setup(backend, 1);

        assert_eq!(infer.embed("nomic", "hello").await.unwrap(), vec![0.1, 0.2]);
        assert_eq!(infer.embed("nomic", "hello").await.unwrap(), vec![0.1, 0.2]);
        assert_eq!(backend.embed_calls(), 1);
        assert_eq!(releases(&infer), 1);

        assert!(infer.embed("nomic", "").await.unwrap().is_empty());
        assert_eq!(backend.embed_calls(), 1);
    }

    #[tokio::test]
    async fn test_no_embedding() {
        let backend = MockBackend::new()
            .with_instance("http://gpu-1", &["nomic"], 0)
            .with_embeddings(Vec::new());
        let (infer, _) = setup(backend, 1);

        let err = infer.embed("nomic", "hello").await.unwrap_err();
        assert!(matches!(err, InferError::NoEmbedding(_)));
        assert!(infer.embedding_cache().is_empty());
        assert_eq!(releases(&infer), 1);
    }
}
