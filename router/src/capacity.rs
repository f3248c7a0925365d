/// Memory based capacity estimation
use inference_pool_client::RunningModel;
use serde::Serialize;
use utoipa::ToSchema;

pub const GIB: u64 = 1024 * 1024 * 1024;

/// Assumed VRAM of an instance that does not declare it
pub const DEFAULT_VRAM: u64 = 16 * GIB;
/// Memory kept free on every instance
pub const DEFAULT_SAFETY_BUFFER: u64 = 2 * GIB;
/// Conservative memory overhead of one concurrent request
pub const ESTIMATED_BYTES_PER_REQUEST: u64 = GIB;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, ToSchema)]
pub struct MemoryUsage {
    #[schema(example = "17179869184")]
    pub total_vram: u64,
    #[schema(example = "5368709120")]
    pub used_vram: u64,
    #[schema(example = "11811160064")]
    pub available_vram: u64,
    /// Available memory minus the safety buffer
    #[schema(example = "9663676416")]
    pub safe_vram: u64,
    #[schema(example = "1073741824")]
    pub estimated_per_request: u64,
    #[schema(example = "9")]
    pub max_concurrency: usize,
}

impl MemoryUsage {
    /// Comparison score, lower is better
    ///
    /// Utilization in percent minus the number of requests the instance can
    /// still take, so emptier instances with more slack win.
    pub fn load_score(&self) -> f64 {
        let utilization = if self.total_vram == 0 {
            100.0
        } else {
            self.used_vram as f64 / self.total_vram as f64 * 100.0
        };
        utilization - self.max_concurrency as f64
    }
}

#[derive(Clone, Copy, Debug)]
pub struct CapacityEstimator {
    safety_buffer: u64,
    per_request: u64,
}

impl Default for CapacityEstimator {
    fn default() -> Self {
        Self::new(DEFAULT_SAFETY_BUFFER)
    }
}

impl CapacityEstimator {
    pub fn new(safety_buffer: u64) -> Self {
        Self {
            safety_buffer,
            per_request: ESTIMATED_BYTES_PER_REQUEST,
        }
    }

    pub fn with_per_request(mut self, per_request: u64) -> Self {
        self.per_request = per_request.max(1);
        self
    }

    pub fn safety_buffer(&self) -> u64 {
        self.safety_buffer
    }

    /// Derive the memory state of an instance from its resident models
    pub fn memory_usage(&self, total_vram: Option<u64>, resident: &[RunningModel]) -> MemoryUsage {
        let total_vram = total_vram.unwrap_or(DEFAULT_VRAM);
        let used_vram = resident
            .iter()
            .map(RunningModel::vram_usage)
            .fold(0u64, u64::saturating_add);
        let available_vram = total_vram.saturating_sub(used_vram);
        let safe_vram = available_vram.saturating_sub(self.safety_buffer);
        // Never declare an instance totally unusable
        let max_concurrency = ((safe_vram / self.per_request) as usize).max(1);

        MemoryUsage {
            total_vram,
            used_vram,
            available_vram,
            safe_vram,
            estimated_per_request: self.per_request,
            max_concurrency,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn resident(size: u64, size_vram: Option<u64>) -> RunningModel {
        RunningModel {
            name: "llama3:8b".to_string(),
            size,
            size_vram,
            ..Default::default()
        }
    }

    #[test]
    fn test_empty_instance() {
        let usage = CapacityEstimator::default().memory_usage(Some(16 * GIB), &[]);
        assert_eq!(usage.used_vram, 0);
        assert_eq!(usage.available_vram, 16 * GIB);
        assert_eq!(usage.safe_vram, 14 * GIB);
        assert_eq!(usage.max_concurrency, 14);
        assert_eq!(usage.load_score(), -14.0);
    }

    #[test]
    fn test_full_instance_keeps_one_slot() {
        let usage = CapacityEstimator::default()
            .memory_usage(Some(16 * GIB), &[resident(15 * GIB, Some(15 * GIB))]);
        assert_eq!(usage.available_vram, GIB);
        assert_eq!(usage.safe_vram, 0);
        assert_eq!(usage.max_concurrency, 1);

        // Over-committed instances saturate instead of underflowing
        let usage = CapacityEstimator::default()
            .memory_usage(Some(16 * GIB), &[resident(20 * GIB, None)]);
        assert_eq!(usage.available_vram, 0);
        assert_eq!(usage.max_concurrency, 1);
    }

    #[test]
    fn test_vram_falls_back_to_size() {
        let usage = CapacityEstimator::default().memory_usage(
            None,
            &[resident(4 * GIB, None), resident(6 * GIB, Some(2 * GIB))],
        );
        assert_eq!(usage.total_vram, DEFAULT_VRAM);
        assert_eq!(usage.used_vram, 6 * GIB);
        assert_eq!(usage.max_concurrency, 8);
    }

    #[test]
    fn test_custom_buffer_and_request_size() {
        let usage = CapacityEstimator::new(0)
            .with_per_request(GIB / 2)
            .memory_usage(Some(8 * GIB), &[resident(4 * GIB, Some(4 * GIB))]);
        assert_eq!(usage.safe_vram, 4 * GIB);
        assert_eq!(usage.max_concurrency, 8);
        assert_eq!(usage.load_score(), 50.0 - 8.0);
    }

    #[test]
    fn test_lower_utilization_scores_lower() {
        let estimator = CapacityEstimator::default();
        let light = estimator.memory_usage(Some(10 * GIB), &[resident(GIB, Some(GIB))]);
        let heavy = estimator.memory_usage(Some(10 * GIB), &[resident(8 * GIB, Some(8 * GIB))]);
        assert!(light.load_score() < heavy.load_score());
    }

    #[test]
    fn test_zero_total_is_fully_used() {
        let usage = CapacityEstimator::default().memory_usage(Some(0), &[]);
        assert_eq!(usage.max_concurrency, 1);
        assert_eq!(usage.load_score(), 99.0);
    }
}
