/// Bounded LRU cache of embedding vectors
use crate::infer::InferError;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::future::Future;

pub const DEFAULT_CACHE_SIZE: usize = 1000;

#[derive(Debug)]
struct Entry {
    embedding: Vec<f32>,
    /// Logical access time, strictly increasing
    last_access: u64,
}

#[derive(Debug, Default)]
struct CacheState {
    entries: HashMap<(String, String), Entry>,
    clock: u64,
}

impl CacheState {
    fn tick(&mut self) -> u64 {
        self.clock += 1;
        self.clock
    }
}

/// Embeddings keyed by `(model, text)`
///
/// Eviction scans all entries for the least recently accessed one, which is
/// fine at the default bound of 1000 entries.
#[derive(Debug)]
pub struct EmbeddingCache {
    max_entries: usize,
    state: Mutex<CacheState>,
}

impl Default for EmbeddingCache {
    fn default() -> Self {
        Self::new(DEFAULT_CACHE_SIZE)
    }
}

impl EmbeddingCache {
    pub fn new(max_entries: usize) -> Self {
        Self {
            max_entries: max_entries.max(1),
            state: Mutex::new(CacheState::default()),
        }
    }

    pub fn max_entries(&self) -> usize {
        self.max_entries
    }

    pub fn len(&self) -> usize {
        self.state.lock().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Cached embedding, marking it as most recently used
    pub fn lookup(&self, model: &str, text: &str) -> Option<Vec<f32>> {
        let mut state = self.state.lock();
        let now = state.tick();
        let entry = state
            .entries
            .get_mut(&(model.to_string(), text.to_string()))?;
        entry.last_access = now;
        Some(entry.embedding.clone())
    }

    /// Store an embedding, evicting the least recently used entry when full
    pub fn insert(&self, model: &str, text: &str, embedding: Vec<f32>) {
        let mut state = self.state.lock();
        let key = (model.to_string(), text.to_string());
        if !state.entries.contains_key(&key) && state.entries.len() >= self.max_entries {
            let oldest = state
                .entries
                .iter()
                .min_by_key(|(_, entry)| entry.last_access)
                .map(|(key, _)| key.clone());
            if let Some(oldest) = oldest {
                tracing::debug!("Evicting embedding of `{}` for {}", oldest.1, oldest.0);
                state.entries.remove(&oldest);
            }
        }
        let last_access = state.tick();
        state.entries.insert(
            key,
            Entry {
                embedding,
                last_access,
            },
        );
    }

    /// Return the cached embedding or compute it with `fetch`
    ///
    /// Empty text short-circuits to an empty vector. Fetch errors are not cached.
    pub async fn get_or_fetch<F, Fut>(
        &self,
        model: &str,
        text: &str,
        fetch: F,
    ) -> Result<Vec<f32>, InferError>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<Vec<f32>, InferError>>,
    {
        if text.is_empty() {
            return Ok(Vec::new());
        }
        if let Some(embedding) = self.lookup(model, text) {
            metrics::counter!("pool_embedding_cache_hit").increment(1);
            return Ok(embedding);
        }
        metrics::counter!("pool_embedding_cache_miss").increment(1);

        let embedding = fetch().await?;
        self.insert(model, text, embedding.clone());
        Ok(embedding)
    }
}
