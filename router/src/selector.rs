/// Instance selection under live memory pressure
use crate::capacity::{CapacityEstimator, MemoryUsage};
use crate::config::Instance;
use crate::gate::ConcurrencyGate;
use crate::infer::{Backend, InferError};
use futures::future::join_all;
use parking_lot::RwLock;
use serde::Serialize;
use std::cmp::Ordering;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tracing::instrument;
use utoipa::ToSchema;

/// How long cached model lists are trusted
pub const DEFAULT_MODELS_TTL: Duration = Duration::from_secs(60);

/// Instance picked for a request, with the gate bounding its concurrency
#[derive(Clone, Debug)]
pub struct Selection {
    pub instance: Instance,
    pub gate: ConcurrencyGate,
    pub memory: MemoryUsage,
    pub score: f64,
}

#[derive(Clone, Debug, Serialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct GateStatus {
    #[schema(example = "8")]
    pub permits: usize,
    #[schema(example = "6")]
    pub available: usize,
    #[schema(example = "2")]
    pub in_flight: usize,
    #[schema(example = "0")]
    pub waiting: usize,
}

impl From<&ConcurrencyGate> for GateStatus {
    fn from(gate: &ConcurrencyGate) -> Self {
        Self {
            permits: gate.permits(),
            available: gate.available_permits(),
            in_flight: gate.in_flight(),
            waiting: gate.waiting(),
        }
    }
}

#[derive(Clone, Debug, Serialize, ToSchema)]
pub struct InstanceStatus {
    #[serde(flatten)]
    pub instance: Instance,
    #[schema(nullable = true)]
    pub gate: Option<GateStatus>,
}

#[derive(Debug, Default)]
struct PoolState {
    instances: Vec<Instance>,
    /// Keyed by instance url, created lazily
    gates: HashMap<String, ConcurrencyGate>,
    models_refreshed_at: Option<Instant>,
}

#[derive(Debug)]
struct Candidate {
    /// Registration order
    order: usize,
    instance: Instance,
    memory: MemoryUsage,
    score: f64,
}

impl Candidate {
    /// Lower score first, then higher weight, then registration order
    fn cmp_preference(&self, other: &Candidate) -> Ordering {
        self.score
            .total_cmp(&other.score)
            .then_with(|| other.instance.weight.cmp(&self.instance.weight))
            .then_with(|| self.order.cmp(&other.order))
    }
}

/// Pool of instances and their concurrency gates
pub struct InstanceSelector {
    backend: Arc<dyn Backend>,
    estimator: CapacityEstimator,
    /// Static gate size overriding the memory based estimate
    default_concurrency: Option<usize>,
    models_ttl: Duration,
    state: RwLock<PoolState>,
}

impl InstanceSelector {
    pub fn new(
        backend: Arc<dyn Backend>,
        instances: Vec<Instance>,
        estimator: CapacityEstimator,
    ) -> Self {
        Self {
            backend,
            estimator,
            default_concurrency: None,
            models_ttl: DEFAULT_MODELS_TTL,
            state: RwLock::new(PoolState {
                instances,
                ..Default::default()
            }),
        }
    }

    pub fn with_default_concurrency(mut self, default_concurrency: Option<usize>) -> Self {
        self.default_concurrency = default_concurrency;
        self
    }

    pub fn with_models_ttl(mut self, models_ttl: Duration) -> Self {
        self.models_ttl = models_ttl;
        self
    }

    pub fn instances(&self) -> Vec<Instance> {
        self.state.read().instances.clone()
    }

    pub fn gate(&self, url: &str) -> Option<ConcurrencyGate> {
        self.state.read().gates.get(url).cloned()
    }

    /// Replace the pool. Gates of instances that are still configured are kept.
    pub fn set_instances(&self, instances: Vec<Instance>) {
        let urls: HashSet<&str> = instances.iter().map(|i| i.url.as_str()).collect();
        let mut state = self.state.write();
        state.gates.retain(|url, _| {
            let keep = urls.contains(url.as_str());
            if !keep {
                tracing::info!("Dropping gate of removed instance {url}");
            }
            keep
        });
        state.instances = instances;
        state.models_refreshed_at = None;
    }

    /// Every configured instance with the state of its gate
    pub fn instances_status(&self) -> Vec<InstanceStatus> {
        let state = self.state.read();
        state
            .instances
            .iter()
            .map(|instance| InstanceStatus {
                instance: instance.clone(),
                gate: state.gates.get(&instance.url).map(GateStatus::from),
            })
            .collect()
    }

    /// Re-read the servable models of every instance once the cached lists expired
    #[instrument(skip(self))]
    pub async fn refresh_available_models(&self, force: bool) {
        let instances = {
            let state = self.state.read();
            let fresh = state
                .models_refreshed_at
                .is_some_and(|at| at.elapsed() < self.models_ttl);
            if fresh && !force {
                return;
            }
            state.instances.clone()
        };

        let refreshed = join_all(instances.into_iter().map(|instance| async move {
            match self.backend.available_models(&instance).await {
                Ok(models) => {
                    tracing::debug!("Loaded {} models from {}", models.len(), instance.url);
                    Some((instance.url, models))
                }
                Err(err) => {
                    // Keep the previous list
                    tracing::warn!("Could not load models from {}: {err}", instance.url);
                    None
                }
            }
        }))
        .await;

        let mut state = self.state.write();
        for (url, models) in refreshed.into_iter().flatten() {
            if let Some(instance) = state.instances.iter_mut().find(|i| i.url == url) {
                instance.discovered_models = Some(models);
            }
        }
        state.models_refreshed_at = Some(Instant::now());
    }

    /// Pick the least loaded instance able to serve `model`
    #[instrument(skip(self))]
    pub async fn select(&self, model: &str) -> Result<Selection, InferError> {
        self.refresh_available_models(false).await;

        let candidates: Vec<(usize, Instance)> = {
            let state = self.state.read();
            if state.instances.is_empty() {
                return Err(InferError::NoInstances);
            }
            state
                .instances
                .iter()
                .enumerate()
                .filter(|(_, instance)| instance.may_serve(model))
                .map(|(order, instance)| (order, instance.clone()))
                .collect()
        };
        if candidates.is_empty() {
            tracing::warn!("No instance serves model {model}");
            return Err(InferError::Unavailable(model.to_string()));
        }

        let analysed = join_all(candidates.into_iter().map(|(order, instance)| async move {
            match self.backend.running_models(&instance).await {
                Ok(resident) => {
                    let memory = self
                        .estimator
                        .memory_usage(instance.total_vram(), &resident);
                    let score = memory.load_score();
                    Some(Candidate {
                        order,
                        instance,
                        memory,
                        score,
                    })
                }
                Err(err) => {
                    tracing::warn!("Instance {} unavailable: {err}", instance.url);
                    None
                }
            }
        }))
        .await;

        let best = analysed
            .into_iter()
            .flatten()
            .min_by(Candidate::cmp_preference)
            .ok_or_else(|| InferError::Unavailable(model.to_string()))?;

        metrics::gauge!("pool_selection_score", "instance" => best.instance.url.clone())
            .set(best.score);
        tracing::debug!(
            "Selected {} for {model} (score {:.2}, max concurrency {})",
            best.instance.url,
            best.score,
            best.memory.max_concurrency
        );

        let gate = self.gate_for(&best.instance.url, best.memory.max_concurrency);
        Ok(Selection {
            instance: best.instance,
            gate,
            memory: best.memory,
            score: best.score,
        })
    }

    fn gate_for(&self, url: &str, max_concurrency: usize) -> ConcurrencyGate {
        if let Some(gate) = self.state.read().gates.get(url) {
            return gate.clone();
        }
        let permits = self.default_concurrency.unwrap_or(max_concurrency);
        self.state
            .write()
            .gates
            .entry(url.to_string())
            .or_insert_with(|| {
                tracing::info!("Created gate for {url}: max concurrency = {permits}");
                ConcurrencyGate::new(permits)
            })
            .clone()
    }

    /// Resize the gate of `url` to the current memory estimate
    ///
    /// A resized gate replaces the old one; requests holding a permit of the
    /// old gate release it there.
    #[instrument(skip(self))]
    pub async fn refresh_gate(&self, url: &str) -> Result<ConcurrencyGate, InferError> {
        let instance = self
            .state
            .read()
            .instances
            .iter()
            .find(|i| i.url == url)
            .cloned()
            .ok_or_else(|| InferError::UnknownInstance(url.to_string()))?;

        let resident = self.backend.running_models(&instance).await?;
        let memory = self.estimator.memory_usage(instance.total_vram(), &resident);
        let permits = self.default_concurrency.unwrap_or(memory.max_concurrency);

        let mut state = self.state.write();
        if let Some(current) = state.gates.get(url) {
            if current.permits() == permits {
                return Ok(current.clone());
            }
            tracing::info!(
                "Updated gate for {url}: {} -> {permits} max concurrency",
                current.permits()
            );
        }
        let gate = ConcurrencyGate::new(permits);
        state.gates.insert(url.to_string(), gate.clone());
        Ok(gate)
    }
}
