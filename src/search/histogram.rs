//! Bucketed score histogram for approximate quantiles.

use crate::types::Score;

#[derive(Debug, Clone)]
pub struct Histogram {
    bins: Vec<u32>,
    min: Score,
    max: Score,
    width: Score,
    count: usize,
}

impl Histogram {
    pub fn new(bins: usize) -> Self {
        Self {
            bins: vec![0; bins.max(2)],
            min: 0.0,
            max: 0.0,
            width: 0.0,
            count: 0,
        }
    }

    pub fn clear(&mut self) {
        self.bins.iter_mut().for_each(|b| *b = 0);
        self.count = 0;
    }

    /// Reset the score range. Clears all counts.
    pub fn set_limits(&mut self, min: Score, max: Score) {
        self.clear();
        self.min = min;
        self.max = max.max(min);
        self.width = (self.max - self.min) / self.bins.len() as Score;
    }

    /// Count a score. Scores outside the limits land in the border bins.
    pub fn add(&mut self, score: Score) {
        let bin = if self.width > 0.0 && score > self.min {
            (((score - self.min) / self.width) as usize).min(self.bins.len() - 1)
        } else {
            0
        };
        self.bins[bin] += 1;
        self.count += 1;
    }

    pub fn count(&self) -> usize {
        self.count
    }

    /// Score below which roughly `n` entries lie. Entries at the returned
    /// boundary itself may exceed `n`.
    pub fn quantile(&self, n: u32) -> Score {
        let mut total = 0u64;
        for (i, count) in self.bins.iter().enumerate() {
            total += u64::from(*count);
            if total > u64::from(n) {
                return self.min + i as Score * self.width;
            }
        }
        self.max
    }
}
