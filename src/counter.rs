//! A bounded rolling-average sample counter, used to track peers' recent
//! download and upload throughput for the choke algorithm.

use std::collections::VecDeque;

/// The number of samples kept before old ones are evicted. Matches the
/// window used for peer rate averaging.
const MAX_SAMPLES: usize = 100;

/// Tracks a rolling average of byte counts recorded over time, bounded to
/// the last [`MAX_SAMPLES`] entries.
#[derive(Clone, Debug, Default)]
pub struct ThroughputCounter {
    samples: VecDeque<u64>,
    total: u64,
}

impl ThroughputCounter {
    pub fn new() -> Self {
        Self {
            samples: VecDeque::with_capacity(MAX_SAMPLES),
            total: 0,
        }
    }

    /// Records a new sample (number of bytes transferred since the last
    /// record), evicting the oldest sample if the window is full.
    pub fn update(&mut self, bytes: u64) {
        if self.samples.len() == MAX_SAMPLES {
            if let Some(evicted) = self.samples.pop_front() {
                self.total -= evicted;
            }
        }
        self.samples.push_back(bytes);
        self.total += bytes;
    }

    /// Returns the average of the recorded samples, or 0 if none were
    /// recorded yet.
    pub fn avg(&self) -> u64 {
        if self.samples.is_empty() {
            0
        } else {
            self.total / self.samples.len() as u64
        }
    }

    pub fn len(&self) -> usize {
        self.samples.len()
    }

    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_counter_averages_to_zero() {
        let counter = ThroughputCounter::new();
        assert_eq!(counter.avg(), 0);
    }

    #[test]
    fn averages_recorded_samples() {
        let mut counter = ThroughputCounter::new();
        counter.update(10);
        counter.update(20);
        counter.update(30);
        assert_eq!(counter.avg(), 20);
    }

    #[test]
    fn evicts_oldest_sample_past_window() {
        let mut counter = ThroughputCounter::new();
        for _ in 0..MAX_SAMPLES {
            counter.update(10);
        }
        assert_eq!(counter.avg(), 10);
        // one more sample, far larger, should only nudge the average since
        // the oldest 10 is evicted
        counter.update(10 + MAX_SAMPLES as u64 * 10);
        assert_eq!(counter.len(), MAX_SAMPLES);
        assert_eq!(counter.avg(), 20);
    }
}
