//! Absolute pruning thresholds derived from the configuration.

use serde::Serialize;
use tracing::info;

use crate::config::PruningConfig;
use crate::constants::pruning::RELATIVE_THRESHOLD_LIMIT;
use crate::types::Score;

/// Thresholds in scaled score units. An infinite threshold disables the pass.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct PruningThresholds {
    /// State beam.
    pub acoustic: Score,
    /// Maximum number of states after histogram pruning.
    pub acoustic_limit: u32,
    pub word_end: Score,
    pub word_end_limit: u32,
    /// Beam among the hypotheses of one network state.
    pub lm_state: Score,
    /// Beam within one word-initial phoneme group.
    pub word_end_phoneme: Score,
}

impl PruningThresholds {
    pub fn from_config(config: &PruningConfig, lm_scale: f64) -> Self {
        let acoustic = config.beam_pruning * lm_scale;

        let word_end = match config.word_end_pruning {
            Some(value) if value > RELATIVE_THRESHOLD_LIMIT => value * lm_scale,
            Some(value) => value * acoustic,
            None => Score::INFINITY,
        };
        let relative_to_word_end = |value: Option<f64>| match value {
            Some(value) if value > RELATIVE_THRESHOLD_LIMIT => value * lm_scale,
            Some(value) => value * word_end,
            None => Score::INFINITY,
        };

        let thresholds = Self {
            acoustic,
            acoustic_limit: config.beam_pruning_limit,
            word_end,
            word_end_limit: config.word_end_pruning_limit,
            lm_state: relative_to_word_end(config.lm_state_pruning),
            word_end_phoneme: relative_to_word_end(config.word_end_phoneme_pruning),
        };
        info!(
            "Pruning thresholds: beam {:.3} (limit {}), word end {:.3} (limit {}), lm state {:.3}, phoneme {:.3}",
            thresholds.acoustic,
            thresholds.acoustic_limit,
            thresholds.word_end,
            thresholds.word_end_limit,
            thresholds.lm_state,
            thresholds.word_end_phoneme
        );
        thresholds
    }

    /// Word-end beam capped by the state beam.
    pub fn relative_word_end(&self) -> Score {
        self.acoustic.min(self.word_end)
    }

    /// Rescale the beam and every finite dependent threshold by the same ratio.
    pub fn set_beam(&mut self, beam: Score) {
        let ratio = beam / self.acoustic;
        self.acoustic = beam;
        for threshold in [&mut self.word_end, &mut self.lm_state, &mut self.word_end_phoneme] {
            if threshold.is_finite() {
                *threshold *= ratio;
            }
        }
    }

    /// Replace the state limit, shrinking the word-end limit proportionally
    /// when it was below the old state limit.
    pub fn set_acoustic_limit(&mut self, limit: u32) {
        let old = self.acoustic_limit;
        self.acoustic_limit = limit;
        if old != limit && self.word_end_limit < old {
            self.word_end_limit =
                (f64::from(self.word_end_limit) * (f64::from(limit) / f64::from(old))) as u32;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_relative_thresholds() {
        let config = PruningConfig {
            beam_pruning: 10.0,
            word_end_pruning: Some(0.5),
            lm_state_pruning: Some(0.2),
            word_end_phoneme_pruning: Some(4.0),
            ..PruningConfig::default()
        };
        let t = PruningThresholds::from_config(&config, 2.0);
        assert_eq!(t.acoustic, 20.0);
        assert_eq!(t.word_end, 10.0);
        assert_eq!(t.lm_state, 2.0);
        assert_eq!(t.word_end_phoneme, 8.0);
    }

    #[test]
    fn test_unset_thresholds_are_disabled() {
        let t = PruningThresholds::from_config(&PruningConfig::default(), 1.0);
        assert!(t.word_end.is_infinite());
        assert!(t.lm_state.is_infinite());
        assert_eq!(t.relative_word_end(), t.acoustic);
    }

    #[test]
    fn test_set_beam_rescales_dependents() {
        let config = PruningConfig {
            beam_pruning: 10.0,
            word_end_pruning: Some(0.5),
            ..PruningConfig::default()
        };
        let mut t = PruningThresholds::from_config(&config, 1.0);
        t.set_beam(20.0);
        assert_eq!(t.word_end, 10.0);
        assert!(t.lm_state.is_infinite());
    }

    #[test]
    fn test_set_acoustic_limit() {
        let config = PruningConfig {
            beam_pruning_limit: 1000,
            word_end_pruning_limit: 100,
            ..PruningConfig::default()
        };
        let mut t = PruningThresholds::from_config(&config, 1.0);
        t.set_acoustic_limit(2000);
        assert_eq!(t.word_end_limit, 200);
    }
}
