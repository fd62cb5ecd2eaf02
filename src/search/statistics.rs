//! Search space statistics.

use serde::Serialize;
use tracing::info;

/// Mean of a stream of observations.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize)]
pub struct RunningAverage {
    sum: f64,
    observations: u64,
}

impl RunningAverage {
    pub fn add(&mut self, value: f64) {
        self.sum += value;
        self.observations += 1;
    }

    pub fn average(&self) -> f64 {
        if self.observations == 0 {
            0.0
        } else {
            self.sum / self.observations as f64
        }
    }

    pub fn observations(&self) -> u64 {
        self.observations
    }

    pub fn clear(&mut self) {
        *self = Self::default();
    }
}

/// Accumulated counts since the last reset.
#[derive(Debug, Clone, Default, Serialize)]
pub struct SearchStatistics {
    pub frames: u64,
    pub instances_before_pruning: u64,
    pub instances_after_pruning: u64,
    pub root_hypotheses: u64,
    pub transferred_hypotheses: u64,
    pub states_before_pruning: u64,
    pub states_after_pre_pruning: u64,
    pub states_after_pruning: u64,
    pub lm_state_pruned: u64,
    pub acoustic_histogram_prunings: u64,
    pub corrected_traces: u64,
    pub early_word_ends: u64,
    pub word_ends_after_pruning: u64,
    pub phoneme_pruned_word_ends: u64,
    pub word_end_histogram_prunings: u64,
    pub epsilon_word_ends: u64,
    pub word_ends_after_recombination: u64,
    pub sentence_end_fallbacks: u64,
}

impl SearchStatistics {
    pub fn clear(&mut self) {
        *self = Self::default();
    }

    fn per_frame(&self, value: u64) -> f64 {
        if self.frames == 0 {
            0.0
        } else {
            value as f64 / self.frames as f64
        }
    }

    pub fn log(&self) {
        info!(
            "Search statistics over {} frames: {:.1} states before pruning, {:.1} after, {:.1} word ends, {:.1} instances",
            self.frames,
            self.per_frame(self.states_before_pruning),
            self.per_frame(self.states_after_pruning),
            self.per_frame(self.word_ends_after_recombination),
            self.per_frame(self.instances_after_pruning)
        );
    }
}

/// Per-utterance averages consumed by the adaptive pruning controller.
#[derive(Debug, Clone, Copy, Default, Serialize)]
pub struct UtteranceAverages {
    pub states_after_pruning: RunningAverage,
    pub word_ends_after_pruning: RunningAverage,
    pub word_lemmas_after_recombination: RunningAverage,
    pub acoustic_pruning_saturation: RunningAverage,
}

impl UtteranceAverages {
    pub fn clear(&mut self) {
        *self = Self::default();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_running_average() {
        let mut avg = RunningAverage::default();
        assert_eq!(avg.average(), 0.0);
        avg.add(2.0);
        avg.add(4.0);
        assert_eq!(avg.average(), 3.0);
        assert_eq!(avg.observations(), 2);
        avg.clear();
        assert_eq!(avg.observations(), 0);
    }

    #[test]
    fn test_statistics_serialize() {
        let stats = SearchStatistics {
            frames: 2,
            states_after_pruning: 10,
            ..SearchStatistics::default()
        };
        let json = serde_json::to_string(&stats).unwrap();
        assert!(json.contains("\"states_after_pruning\":10"));
        stats.log();
    }
}
