//! Sliding window of recent call outcomes, bounded by count and by age.

use std::collections::VecDeque;
use std::time::Duration;

use tokio::time::Instant;

#[derive(Debug, Clone, Copy)]
pub(crate) struct Outcome {
    pub at: Instant,
    pub success: bool,
    pub slow: bool,
}

#[derive(Debug)]
pub(crate) struct OutcomeWindow {
    records: VecDeque<Outcome>,
    max_len: usize,
    max_age: Duration,
}

impl OutcomeWindow {
    pub fn new(max_len: usize, max_age: Duration) -> Self {
        Self {
            records: VecDeque::with_capacity(max_len.min(1024)),
            max_len,
            max_age,
        }
    }

    pub fn push(&mut self, outcome: Outcome) {
        self.prune(outcome.at);
        if self.records.len() == self.max_len {
            self.records.pop_front();
        }
        self.records.push_back(outcome);
    }

    /// Drop outcomes older than the time bound.
    pub fn prune(&mut self, now: Instant) {
        while let Some(front) = self.records.front() {
            if now.saturating_duration_since(front.at) > self.max_age {
                self.records.pop_front();
            } else {
                break;
            }
        }
    }

    pub fn clear(&mut self) {
        self.records.clear();
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn failures(&self) -> usize {
        self.records.iter().filter(|o| !o.success).count()
    }

    pub fn slow_calls(&self) -> usize {
        self.records.iter().filter(|o| o.slow).count()
    }

    pub fn failure_rate(&self) -> f64 {
        if self.records.is_empty() {
            0.0
        } else {
            self.failures() as f64 / self.records.len() as f64
        }
    }
}
