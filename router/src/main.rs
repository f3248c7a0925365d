use clap::{Parser, Subcommand};
use futures::future::join_all;
use inference_pool_client::Client;
use inference_pool_router::capacity::{CapacityEstimator, DEFAULT_VRAM, GIB};
use inference_pool_router::config::{self, ConfigError, Instance};
use inference_pool_router::embeddings::EmbeddingCache;
use inference_pool_router::infer::{Infer, OllamaBackend};
use inference_pool_router::selector::InstanceSelector;
use inference_pool_router::{server, Info};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;

/// App Configuration
#[derive(Parser, Debug)]
#[clap(author, version, about, long_about = None)]
struct Args {
    #[command(subcommand)]
    command: Option<Commands>,

    #[clap(default_value = "0.0.0.0", long, env)]
    hostname: String,
    #[clap(default_value = "3000", long, short, env)]
    port: u16,
    /// JSON file with the instance list, defaults to the `OLLAMA_*` variables
    #[clap(long, env)]
    instances_config: Option<PathBuf>,
    #[clap(default_value = "2", long, env)]
    safety_buffer_gb: f64,
    /// VRAM assumed for instances that do not declare it
    #[clap(default_value = "16", long, env)]
    default_vram_gb: f64,
    #[clap(default_value = "1000", long, env)]
    embedding_cache_size: usize,
    #[clap(default_value = "60", long, env)]
    models_ttl_secs: u64,
    /// Static gate size instead of the memory based estimate
    #[clap(long, env)]
    default_concurrency: Option<usize>,
    #[clap(long, env)]
    json_output: bool,
}

#[derive(Debug, Subcommand)]
enum Commands {
    PrintSchema,
}

#[tokio::main]
async fn main() -> Result<(), RouterError> {
    // Get args
    let args = Args::parse();
    // Pattern match configuration
    let Args {
        command,
        hostname,
        port,
        instances_config,
        safety_buffer_gb,
        default_vram_gb,
        embedding_cache_size,
        models_ttl_secs,
        default_concurrency,
        json_output,
    } = args;

    if let Some(Commands::PrintSchema) = command {
        use utoipa::OpenApi;
        let api_doc = server::ApiDoc::openapi();
        let api_doc = serde_json::to_string_pretty(&api_doc)?;
        println!("{}", api_doc);
        std::process::exit(0);
    };
    inference_pool_router::logging::init_logging(json_output);

    // Validate args
    if !(safety_buffer_gb.is_finite() && safety_buffer_gb >= 0.0) {
        return Err(RouterError::ArgumentValidation(format!(
            "`safety_buffer_gb` must be >= 0. Given: {safety_buffer_gb}"
        )));
    }
    if !(default_vram_gb.is_finite() && default_vram_gb > 0.0) {
        return Err(RouterError::ArgumentValidation(format!(
            "`default_vram_gb` must be > 0. Given: {default_vram_gb}"
        )));
    }
    if embedding_cache_size == 0 {
        return Err(RouterError::ArgumentValidation(
            "`embedding_cache_size` must be > 0".to_string(),
        ));
    }
    if default_concurrency == Some(0) {
        return Err(RouterError::ArgumentValidation(
            "`default_concurrency` must be > 0".to_string(),
        ));
    }

    let instances = match instances_config {
        Some(path) => config::instances_from_file(path, default_vram_gb)?,
        None => config::instances_from_env(default_vram_gb)?,
    };
    if instances.is_empty() {
        return Err(RouterError::ArgumentValidation(
            "at least one instance must be configured".to_string(),
        ));
    }
    for instance in &instances {
        tracing::info!(
            "Instance {} (weight {}, {} bytes VRAM)",
            instance.url,
            instance.weight,
            instance.total_vram().unwrap_or(DEFAULT_VRAM)
        );
    }
    probe_instances(&instances).await;

    let safety_buffer = (safety_buffer_gb * GIB as f64) as u64;
    let info = Info {
        version: env!("CARGO_PKG_VERSION"),
        sha: option_env!("VERGEN_GIT_SHA"),
        build_timestamp: option_env!("VERGEN_BUILD_TIMESTAMP"),
        instances: instances.len(),
        safety_buffer,
        embedding_cache_size,
    };

    let backend = Arc::new(OllamaBackend::new());
    let selector = InstanceSelector::new(
        backend.clone(),
        instances,
        CapacityEstimator::new(safety_buffer),
    )
    .with_default_concurrency(default_concurrency)
    .with_models_ttl(Duration::from_secs(models_ttl_secs));
    let infer = Infer::new(
        backend,
        Arc::new(selector),
        Arc::new(EmbeddingCache::new(embedding_cache_size)),
    );

    // Run server
    server::run(infer, info, hostname, port).await?;
    Ok(())
}

/// Log the server version of every instance. Unreachable instances are kept in the pool.
async fn probe_instances(instances: &[Instance]) {
    let probes = instances.iter().map(|instance| async move {
        let version = match Client::new(instance.url.clone(), instance.api_key.clone()) {
            Ok(client) => client.version().await,
            Err(err) => Err(err),
        };
        match version {
            Ok(version) => tracing::info!(
                "Connected to {} (version {})",
                instance.url,
                version.as_deref().unwrap_or("unknown")
            ),
            Err(err) => tracing::warn!("Instance {} is not reachable yet: {err}", instance.url),
        }
    });
    join_all(probes).await;
}

#[derive(Debug, Error)]
enum RouterError {
    #[error("Argument validation error: {0}")]
    ArgumentValidation(String),
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),
    #[error("Schema serialization failed: {0}")]
    Schema(#[from] serde_json::Error),
    #[error("WebServer error: {0}")]
    WebServer(#[from] server::WebServerError),
}
