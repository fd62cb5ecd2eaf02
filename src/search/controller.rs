//! Adaptive pruning between utterances.
//!
//! The controller works in description units: the beam relative to the LM
//! scale, or the state limit when the histogram is the master pruning.
//! Every dependent threshold follows the master value proportionally.

use serde::{Deserialize, Serialize};
use tracing::info;

use super::SearchSpace;
use crate::types::Score;

/// Pruning setting of one utterance and whether the search space it
/// produced looked healthy.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct PruningDescription {
    pub beam: Score,
    pub search_space_ok: bool,
}

impl SearchSpace {
    fn histogram_is_master(&self) -> bool {
        self.config.pruning.histogram_pruning_is_master
    }

    /// Current master value in description units.
    pub fn master_beam(&self) -> Score {
        if self.histogram_is_master() {
            Score::from(self.thresholds.acoustic_limit)
        } else {
            self.thresholds.acoustic / self.lm.scale()
        }
    }

    /// Describe the current pruning and judge the last utterance.
    pub fn describe_pruning(&self) -> PruningDescription {
        let mut description = PruningDescription {
            beam: self.master_beam(),
            search_space_ok: true,
        };
        let averages = &self.averages;
        if averages.states_after_pruning.observations() == 0 {
            return description;
        }
        let bounds = &self.config.auto_correction;
        if !self.had_word_end {
            info!("Search space check: no word end reached the sentence end");
            description.search_space_ok = false;
        }
        if !self.histogram_is_master() {
            let checks = [
                (
                    "states after pruning",
                    averages.states_after_pruning.average(),
                    bounds.minimum_states_after_pruning,
                ),
                (
                    "word ends after pruning",
                    averages.word_ends_after_pruning.average(),
                    bounds.minimum_word_ends_after_pruning,
                ),
                (
                    "word lemmas after recombination",
                    averages.word_lemmas_after_recombination.average(),
                    bounds.minimum_word_lemmas_after_recombination,
                ),
            ];
            for (what, average, minimum) in checks {
                if average < minimum {
                    info!("Search space check: too few {}: {:.1} < {:.1}", what, average, minimum);
                    description.search_space_ok = false;
                }
            }
            let saturation = averages.acoustic_pruning_saturation.average();
            if saturation > bounds.maximum_acoustic_pruning_saturation {
                info!(
                    "Search space check: histogram limit saturated in {:.2} of the frames",
                    saturation
                );
                description.search_space_ok = false;
            }
        }
        description
    }

    /// Move the master value to `value * factor + offset`. Returns false
    /// without changing anything when a bound would be violated.
    pub fn relax_pruning(&mut self, factor: f64, offset: f64) -> bool {
        let bounds = self.config.auto_correction.clone();
        let relaxing = factor > 1.0 || offset > 0.0;
        let tightening = factor < 1.0 || offset < 0.0;
        let current = self.master_beam();
        let target = current * factor + offset;

        if self.histogram_is_master() {
            let minimum = Score::from(bounds.minimum_acoustic_pruning_limit);
            let maximum = Score::from(bounds.maximum_acoustic_pruning_limit);
            if target <= minimum {
                info!("Failed tightening pruning, minimum state limit {} reached", minimum);
                return false;
            }
            if relaxing && current >= maximum {
                info!("Failed relaxing pruning, maximum state limit {} reached", maximum);
                return false;
            }
            self.set_master_beam(target.min(maximum));
            return true;
        }

        if relaxing && current >= bounds.maximum_beam_pruning {
            info!(
                "Failed relaxing pruning, maximum beam reached: {:.3} >= {:.3}",
                current, bounds.maximum_beam_pruning
            );
            return false;
        }
        if tightening && target < bounds.minimum_beam_pruning {
            info!(
                "Failed tightening pruning, minimum beam reached: {:.3} < {:.3}",
                target, bounds.minimum_beam_pruning
            );
            return false;
        }
        if relaxing {
            let averages = &self.averages;
            let limits = [
                (
                    "states after pruning",
                    averages.states_after_pruning.average(),
                    bounds.maximum_states_after_pruning,
                ),
                (
                    "word ends after pruning",
                    averages.word_ends_after_pruning.average(),
                    bounds.maximum_word_ends_after_pruning,
                ),
                (
                    "acoustic pruning saturation",
                    averages.acoustic_pruning_saturation.average(),
                    bounds.maximum_acoustic_pruning_saturation,
                ),
            ];
            for (what, average, maximum) in limits {
                if average > maximum {
                    info!(
                        "Failed relaxing pruning, maximum {} reached: {:.2} > {:.2}",
                        what, average, maximum
                    );
                    return false;
                }
            }
        }
        self.set_master_beam(target.min(bounds.maximum_beam_pruning));
        true
    }

    /// Set the master value and rescale every dependent threshold.
    pub fn set_master_beam(&mut self, value: Score) {
        if self.histogram_is_master() {
            let limit = value.round().max(1.0) as u32;
            if limit != self.thresholds.acoustic_limit {
                info!(
                    "t={}: state limit -> {} (previous {})",
                    self.time, limit, self.thresholds.acoustic_limit
                );
            }
            self.thresholds.set_acoustic_limit(limit);
        } else {
            assert!(value > 0.0 && value.is_finite(), "invalid beam {}", value);
            let previous = self.master_beam();
            if value != previous {
                info!("t={}: beam -> {:.3} (previous {:.3})", self.time, value, previous);
            }
            self.thresholds.set_beam(value * self.lm.scale());
        }
    }

    /// Restore a pruning setting returned by [`SearchSpace::describe_pruning`].
    pub fn reset_pruning(&mut self, description: &PruningDescription) {
        assert!(description.beam.is_finite(), "pruning description without beam");
        self.set_master_beam(description.beam);
    }
}
