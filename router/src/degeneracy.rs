/// Runaway generation detection
use std::collections::{HashMap, VecDeque};

/// Number of recent fragments remembered per request
pub const HISTORY_LIMIT: usize = 50;

/// A fragment was repeated often enough to be considered a loop
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct LoopDetected {
    pub fragment: String,
    pub count: usize,
}

/// Exact-repetition loop detector, one per streaming request
///
/// Without a threshold the detector only keeps bookkeeping and never trips.
#[derive(Debug, Default)]
pub struct DegeneracyDetector {
    threshold: Option<usize>,
    counts: HashMap<String, usize>,
    history: VecDeque<String>,
}

impl DegeneracyDetector {
    pub fn new(threshold: Option<usize>) -> Self {
        Self {
            threshold: threshold.filter(|t| *t > 0),
            counts: HashMap::new(),
            history: VecDeque::with_capacity(HISTORY_LIMIT),
        }
    }

    /// Record a streamed fragment; returns the loop once a fragment has been seen `threshold` times
    pub fn observe(&mut self, fragment: &str) -> Option<LoopDetected> {
        if fragment.trim().is_empty() {
            return None;
        }

        let count = self.counts.entry(fragment.to_string()).or_insert(0);
        *count += 1;
        if let Some(threshold) = self.threshold {
            if *count >= threshold {
                return Some(LoopDetected {
                    fragment: fragment.to_string(),
                    count: *count,
                });
            }
        }

        if self.history.len() == HISTORY_LIMIT {
            self.history.pop_front();
        }
        self.history.push_back(fragment.to_string());
        None
    }

    /// Most recent fragments, oldest first
    pub fn history(&self) -> impl Iterator<Item = &str> {
        self.history.iter().map(String::as_str)
    }

    pub fn reset(&mut self) {
        self.counts.clear();
        self.history.clear();
    }
}
