use crate::config::Instance;
use crate::infer::{
    ChatError, ChatIssues, ChatMetadata, ChatOptions, ChatRequest, ChatResult, Infer, InferError,
};
use crate::selector::{GateStatus, InstanceStatus};
use crate::{
    ChatCompletionRequest, EmbedRequest, EmbedResponse, ErrorResponse, Info, Message,
    StreamFragment,
};
use axum::extract::Extension;
use axum::http::StatusCode;
use axum::response::sse::{Event, KeepAlive, Sse};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use futures::{Stream, StreamExt};
use metrics_exporter_prometheus::{BuildError, Matcher, PrometheusBuilder, PrometheusHandle};
use serde::Serialize;
use std::convert::Infallible;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::time::Duration;
use thiserror::Error;
use tokio::signal;
use tokio::sync::mpsc::{self, error::SendError};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{instrument, Instrument};
use utoipa::OpenApi;

/// Health check method
#[utoipa::path(
    get,
    tag = "Inference Pool",
    path = "/health",
    responses(
        (status = 200, description = "Pool has instances"),
        (status = 503, description = "No instance configured", body = ErrorResponse,
            example = json!({"error": "No instance configured", "errorType": "no_instances"})),
    )
)]
async fn health(
    Extension(infer): Extension<Infer>,
) -> Result<(), (StatusCode, Json<ErrorResponse>)> {
    if infer.selector().instances().is_empty() {
        return Err(InferError::NoInstances.into());
    }
    Ok(())
}

/// Router information
#[utoipa::path(
    get,
    tag = "Inference Pool",
    path = "/info",
    responses((status = 200, description = "Served model info", body = Info))
)]
async fn get_info(Extension(info): Extension<Info>) -> Json<Info> {
    Json(info)
}

/// Run a chat request on the least loaded instance
#[utoipa::path(
    post,
    tag = "Inference Pool",
    path = "/chat",
    request_body = ChatCompletionRequest,
    responses(
        (status = 200, description = "Chat result", body = ChatResult),
        (status = 200, description = "Chat fragments", body = StreamFragment,
            content_type = "text/event-stream"),
        (status = 422, description = "Input validation error", body = ErrorResponse,
            example = json!({"error": "`messages` must not be empty", "errorType": "validation"})),
        (status = 503, description = "No instance available", body = ErrorResponse,
            example = json!({"error": "No instance available for model llama3:8b", "errorType": "unavailable"})),
    )
)]
#[instrument(skip_all, fields(model = %req.model, stream = req.stream))]
async fn chat(
    Extension(infer): Extension<Infer>,
    Json(req): Json<ChatCompletionRequest>,
) -> Result<Response, (StatusCode, Json<ErrorResponse>)> {
    metrics::counter!("pool_request_count").increment(1);
    if req.messages.is_empty() {
        metrics::counter!("pool_request_failure", "err" => "validation").increment(1);
        return Err((
            StatusCode::UNPROCESSABLE_ENTITY,
            Json(ErrorResponse {
                error: "`messages` must not be empty".to_string(),
                error_type: "validation".to_string(),
            }),
        ));
    }

    let stream = req.stream;
    let (request, options) = prepare_chat(req);
    if stream {
        return Ok(chat_stream(infer, request, options).into_response());
    }
    // Dropping this future on client disconnect aborts the remote stream
    let result = infer.chat(request, options).await?;
    Ok(Json(result).into_response())
}

fn prepare_chat(req: ChatCompletionRequest) -> (ChatRequest, ChatOptions) {
    let request = ChatRequest {
        model: req.model,
        messages: req.messages.into_iter().map(Into::into).collect(),
    };
    let options = ChatOptions {
        timeout: req.timeout_ms.map(Duration::from_millis),
        abort_on_repeats: req.abort_on_repeats,
        ..Default::default()
    };
    (request, options)
}

enum StreamMessage {
    Fragment(String),
    Done(Result<ChatResult, InferError>),
}

/// Forward fragments as server-sent events and finish with a `result` event
fn chat_stream(
    infer: Infer,
    request: ChatRequest,
    options: ChatOptions,
) -> Sse<impl Stream<Item = Result<Event, Infallible>>> {
    let (messages, _) = chat_messages(infer, request, options);
    let events = messages.map(|message| {
        Ok(match message {
            StreamMessage::Fragment(content) => json_event(None, &StreamFragment { content }),
            StreamMessage::Done(Ok(result)) => json_event(Some("result"), &result),
            StreamMessage::Done(Err(err)) => json_event(
                Some("error"),
                &ErrorResponse {
                    error: err.to_string(),
                    error_type: err.error_type().to_string(),
                },
            ),
        })
    });
    Sse::new(events).keep_alive(KeepAlive::default())
}

/// Run the request in the background and stream its fragments then its outcome
///
/// Dropping the returned stream cancels the request. The task resolves to the
/// final message when nobody was left to receive it.
fn chat_messages(
    infer: Infer,
    request: ChatRequest,
    mut options: ChatOptions,
) -> (
    impl Stream<Item = StreamMessage>,
    JoinHandle<Option<StreamMessage>>,
) {
    let (sender, mut receiver) = mpsc::unbounded_channel();
    let cancel = CancellationToken::new();
    options.cancel = Some(cancel.clone());

    let fragments = sender.clone();
    options.on_fragment = Some(Box::new(move |fragment: &str| {
        let _ = fragments.send(StreamMessage::Fragment(fragment.to_string()));
    }));
    let task = tokio::spawn(
        async move {
            let result = infer.chat(request, options).await;
            match sender.send(StreamMessage::Done(result)) {
                Ok(()) => None,
                Err(SendError(message)) => {
                    tracing::debug!("Client disconnected before the result was sent");
                    Some(message)
                }
            }
        }
        .in_current_span(),
    );

    // Client disconnects drop the stream, which cancels the request
    let cancel_on_drop = cancel.drop_guard();
    let stream = async_stream::stream! {
        let _cancel_on_drop = cancel_on_drop;
        while let Some(message) = receiver.recv().await {
            let done = matches!(message, StreamMessage::Done(_));
            yield message;
            if done {
                break;
            }
        }
    };
    (stream, task)
}

fn json_event(name: Option<&str>, data: &impl Serialize) -> Event {
    let event = match name {
        Some(name) => Event::default().event(name),
        None => Event::default(),
    };
    event.json_data(data).unwrap_or_else(|err| {
        tracing::error!("Failed to serialize event: {err}");
        Event::default().event("error").data(err.to_string())
    })
}

/// Embed a text, served from the cache when possible
#[utoipa::path(
    post,
    tag = "Inference Pool",
    path = "/embed",
    request_body = EmbedRequest,
    responses(
        (status = 200, description = "Embedding", body = EmbedResponse),
        (status = 502, description = "No embedding returned", body = ErrorResponse,
            example = json!({"error": "No embedding returned by model nomic-embed-text", "errorType": "no_embedding"})),
        (status = 503, description = "No instance available", body = ErrorResponse,
            example = json!({"error": "No instance available for model nomic-embed-text", "errorType": "unavailable"})),
    )
)]
#[instrument(skip_all, fields(model = %req.model))]
async fn embed(
    Extension(infer): Extension<Infer>,
    Json(req): Json<EmbedRequest>,
) -> Result<Json<EmbedResponse>, (StatusCode, Json<ErrorResponse>)> {
    let embedding = infer.embed(&req.model, &req.input).await?;
    Ok(Json(EmbedResponse { embedding }))
}

/// Pool instances and the state of their gates
#[utoipa::path(
    get,
    tag = "Inference Pool",
    path = "/instances",
    responses((status = 200, description = "Instances", body = [InstanceStatus]))
)]
async fn instances(Extension(infer): Extension<Infer>) -> Json<Vec<InstanceStatus>> {
    Json(infer.selector().instances_status())
}

/// Reload model lists and resize gates to the current memory state
#[utoipa::path(
    post,
    tag = "Inference Pool",
    path = "/instances/refresh",
    responses((status = 200, description = "Refreshed instances", body = [InstanceStatus]))
)]
#[instrument(skip_all)]
async fn refresh_instances(Extension(infer): Extension<Infer>) -> Json<Vec<InstanceStatus>> {
    let selector = infer.selector();
    selector.refresh_available_models(true).await;
    for status in selector.instances_status() {
        if status.gate.is_none() {
            continue;
        }
        if let Err(err) = selector.refresh_gate(&status.instance.url).await {
            tracing::warn!("Could not refresh gate of {}: {err}", status.instance.url);
        }
    }
    Json(selector.instances_status())
}

/// Prometheus metrics scrape endpoint
#[utoipa::path(
    get,
    tag = "Inference Pool",
    path = "/metrics",
    responses((status = 200, description = "Prometheus Metrics", body = String))
)]
async fn metrics(Extension(prom_handle): Extension<PrometheusHandle>) -> String {
    prom_handle.render()
}

#[derive(OpenApi)]
#[openapi(
    paths(health, get_info, chat, embed, instances, refresh_instances, metrics),
    components(
        schemas(
            Info,
            Message,
            ChatCompletionRequest,
            ChatResult,
            ChatIssues,
            ChatMetadata,
            ChatError,
            StreamFragment,
            EmbedRequest,
            EmbedResponse,
            Instance,
            InstanceStatus,
            GateStatus,
            ErrorResponse,
        )
    ),
    tags(
        (name = "Inference Pool", description = "GPU-memory aware inference pool API")
    ),
    info(
        title = "Inference Pool Router",
        license(
            name = "Apache 2.0",
            url = "https://www.apache.org/licenses/LICENSE-2.0"
        )
    )
)]
pub struct ApiDoc;

/// Serving method
pub async fn run(
    infer: Infer,
    info: Info,
    hostname: String,
    port: u16,
) -> Result<(), WebServerError> {
    // Duration buckets
    let duration_matcher = Matcher::Suffix(String::from("duration"));
    let n_duration_buckets = 35;
    let mut duration_buckets = Vec::with_capacity(n_duration_buckets);
    // Minimum duration in seconds
    let mut value = 0.0001;
    for _ in 0..n_duration_buckets {
        // geometric sequence
        value *= 1.5;
        duration_buckets.push(value);
    }

    // Prometheus handler
    let prom_handle = PrometheusBuilder::new()
        .set_buckets_for_metric(duration_matcher, &duration_buckets)?
        .install_recorder()?;

    let addr = match hostname.parse() {
        Ok(ip) => SocketAddr::new(ip, port),
        Err(_) => {
            tracing::warn!("Invalid hostname, defaulting to 0.0.0.0");
            SocketAddr::new(IpAddr::V4(Ipv4Addr::new(0, 0, 0, 0)), port)
        }
    };

    let app = Router::new()
        .route("/", get(health))
        .route("/health", get(health))
        .route("/info", get(get_info))
        .route("/chat", post(chat))
        .route("/embed", post(embed))
        .route("/instances", get(instances))
        .route("/instances/refresh", post(refresh_instances))
        .route("/metrics", get(metrics))
        .layer(Extension(info))
        .layer(Extension(infer))
        .layer(Extension(prom_handle));

    // Run server
    let listener = tokio::net::TcpListener::bind(&addr).await?;
    tracing::info!("Connected on {addr}");
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;
    Ok(())
}

/// Shutdown signal handler
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(err) = signal::ctrl_c().await {
            tracing::error!("Failed to install Ctrl+C handler: {err}");
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut terminate) => {
                terminate.recv().await;
            }
            Err(err) => {
                tracing::error!("Failed to install signal handler: {err}");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }

    tracing::info!("signal received, starting graceful shutdown");
}

impl From<InferError> for (StatusCode, Json<ErrorResponse>) {
    fn from(err: InferError) -> Self {
        let status_code = match err {
            InferError::NoInstances | InferError::Unavailable(_) | InferError::Overloaded(_) => {
                StatusCode::SERVICE_UNAVAILABLE
            }
            InferError::UnknownInstance(_) => StatusCode::NOT_FOUND,
            InferError::Backend(_)
            | InferError::NoEmbedding(_)
            | InferError::DegenerateOutput { .. } => StatusCode::BAD_GATEWAY,
        };

        (
            status_code,
            Json(ErrorResponse {
                error: err.to_string(),
                error_type: err.error_type().to_string(),
            }),
        )
    }
}

#[derive(Debug, Error)]
pub enum WebServerError {
    #[error("Axum error: {0}")]
    Axum(#[from] std::io::Error),
    #[error("Metrics error: {0}")]
    Metrics(#[from] BuildError),
}
