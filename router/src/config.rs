/// Instance pool configuration
use crate::capacity::GIB;
use serde::{Deserialize, Serialize};
use std::path::Path;
use thiserror::Error;
use utoipa::ToSchema;

/// Highest numbered `OLLAMA_BASE_URL_<n>` variable that is read
const MAX_NUMBERED_INSTANCES: usize = 10;

/// One model-serving backend. Identity is the url.
#[derive(Clone, Debug, Serialize, Deserialize, ToSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Instance {
    #[schema(example = "http://gpu-1:11434")]
    pub url: String,
    #[serde(default, skip_serializing)]
    pub api_key: Option<String>,
    /// Relative weight, higher wins ties
    #[serde(default = "default_weight")]
    #[schema(example = "1")]
    pub weight: u32,
    /// Total GPU memory in GiB
    #[serde(default, rename = "vramGB")]
    #[schema(nullable = true, example = "24")]
    pub vram_gb: Option<f64>,
    /// Models the operator allows on this instance, `None` for any
    #[serde(default)]
    #[schema(nullable = true)]
    pub available_models: Option<Vec<String>>,
    /// Last list reported by the instance, `None` until a fetch succeeds
    #[serde(default, skip_deserializing)]
    #[schema(nullable = true, read_only)]
    pub discovered_models: Option<Vec<String>>,
}

fn default_weight() -> u32 {
    1
}

impl Instance {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            api_key: None,
            weight: default_weight(),
            vram_gb: None,
            available_models: None,
            discovered_models: None,
        }
    }

    pub fn with_api_key(mut self, api_key: impl Into<String>) -> Self {
        self.api_key = Some(api_key.into());
        self
    }

    pub fn with_weight(mut self, weight: u32) -> Self {
        self.weight = weight;
        self
    }

    pub fn with_vram_gb(mut self, vram_gb: f64) -> Self {
        self.vram_gb = Some(vram_gb);
        self
    }

    pub fn with_models<I, S>(mut self, models: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.available_models = Some(models.into_iter().map(Into::into).collect());
        self
    }

    /// Declared VRAM in bytes
    pub fn total_vram(&self) -> Option<u64> {
        self.vram_gb
            .filter(|gb| gb.is_finite() && *gb >= 0.0)
            .map(|gb| (gb * GIB as f64) as u64)
    }

    /// Both the configured and the discovered list must allow `model`.
    /// An unknown list is treated as "possibly serves".
    pub fn may_serve(&self, model: &str) -> bool {
        let allows = |models: &Option<Vec<String>>| match models {
            Some(models) => models.iter().any(|m| m == model),
            None => true,
        };
        allows(&self.available_models) && allows(&self.discovered_models)
    }
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Could not read instance configuration: {0}")]
    Io(#[from] std::io::Error),
    #[error("Invalid instance configuration: {0}")]
    Json(#[from] serde_json::Error),
    #[error("`OLLAMA_BASE_URL` is not set and no instance configuration was given")]
    MissingBaseUrl,
    #[error("Invalid value for `{name}`: {value}")]
    InvalidValue { name: String, value: String },
}

/// Read a JSON array of instances. Entries without `vramGB` get `default_vram_gb`.
pub fn instances_from_file(
    path: impl AsRef<Path>,
    default_vram_gb: f64,
) -> Result<Vec<Instance>, ConfigError> {
    let content = std::fs::read_to_string(path)?;
    instances_from_json(&content, default_vram_gb)
}

pub(crate) fn instances_from_json(
    content: &str,
    default_vram_gb: f64,
) -> Result<Vec<Instance>, ConfigError> {
    let mut instances: Vec<Instance> = serde_json::from_str(content)?;
    for instance in &mut instances {
        instance.vram_gb.get_or_insert(default_vram_gb);
    }
    Ok(instances)
}

/// Read instances from `OLLAMA_BASE_URL`, `OLLAMA_API_KEY`, `OLLAMA_VRAM_GB` and their
/// numbered variants `OLLAMA_BASE_URL_1` .. `OLLAMA_BASE_URL_10`
pub fn instances_from_env(default_vram_gb: f64) -> Result<Vec<Instance>, ConfigError> {
    instances_from_vars(|name| std::env::var(name).ok(), default_vram_gb)
}

pub(crate) fn instances_from_vars<F>(
    var: F,
    default_vram_gb: f64,
) -> Result<Vec<Instance>, ConfigError>
where
    F: Fn(&str) -> Option<String>,
{
    let read_instance = |suffix: &str| -> Result<Option<Instance>, ConfigError> {
        let Some(url) = var(&format!("OLLAMA_BASE_URL{suffix}")).filter(|url| !url.is_empty())
        else {
            return Ok(None);
        };
        let vram_name = format!("OLLAMA_VRAM_GB{suffix}");
        let vram_gb = match var(&vram_name) {
            Some(value) => value
                .trim()
                .parse::<f64>()
                .map_err(|_| ConfigError::InvalidValue {
                    name: vram_name,
                    value,
                })?,
            None => default_vram_gb,
        };
        let mut instance = Instance::new(url).with_vram_gb(vram_gb);
        instance.api_key = var(&format!("OLLAMA_API_KEY{suffix}")).filter(|key| !key.is_empty());
        Ok(Some(instance))
    };

    let mut instances = vec![read_instance("")?.ok_or(ConfigError::MissingBaseUrl)?];
    for i in 1..=MAX_NUMBERED_INSTANCES {
        if let Some(instance) = read_instance(&format!("_{i}"))? {
            instances.push(instance);
        }
    }
    Ok(instances)
}
