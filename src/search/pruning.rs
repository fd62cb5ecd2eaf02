//! State pruning passes.
//!
//! Every pass compacts the hypothesis vector in place, instance by
//! instance, so each instance keeps a contiguous range. Hypotheses with an
//! infinite prospect never survive a pass.

use tracing::trace;

use super::hypothesis::{StateHypothesis, StateRange};
use super::instance::InstanceSet;
use super::SearchSpace;
use crate::acoustic::{CachedScorer, FrameScorer};
use crate::types::Score;

/// Drop every hypothesis `prune` rejects. Empty instances are retired after
/// `latency` frames; `count_frame` marks the pass that advances that count.
fn compact_states<F>(
    hypotheses: &mut Vec<StateHypothesis>,
    instances: &mut InstanceSet,
    latency: u32,
    count_frame: bool,
    mut prune: F,
) where
    F: FnMut(&StateHypothesis) -> bool,
{
    let active = instances.take_active();
    let mut kept = Vec::with_capacity(active.len());
    let mut out = 0usize;
    for id in active {
        let range = instances.get(id).states;
        debug_assert!(range.begin as usize >= out);
        let begin = out;
        for index in range.indices() {
            let hyp = hypotheses[index];
            if !prune(&hyp) {
                hypotheses[out] = hyp;
                out += 1;
            }
        }
        instances.get_mut(id).states = StateRange::new(begin as u32, out as u32);
        if !instances.eventually_deactivate(id, latency, count_frame) {
            kept.push(id);
        }
    }
    hypotheses.truncate(out);
    instances.set_active(kept);
}

impl SearchSpace {
    fn latency(&self) -> u32 {
        self.config.pruning.instance_deletion_latency
    }

    /// Remove hypotheses the prefix filter rejects.
    pub fn filter_states(&mut self) {
        let Some(filter) = self.prefix_filter.as_ref() else {
            return;
        };
        let latency = self.config.pruning.instance_deletion_latency;
        compact_states(
            &mut self.state_hypotheses,
            &mut self.instances,
            latency,
            false,
            |hyp| filter.prune(hyp),
        );
    }

    /// Beam pruning on prospects before acoustic scores are added.
    pub fn prune_states_early(&mut self) {
        if !self.config.pruning.early_beam_pruning {
            return;
        }
        let threshold = self.best_prospect + self.thresholds.acoustic;
        let latency = self.latency();
        compact_states(
            &mut self.state_hypotheses,
            &mut self.instances,
            latency,
            false,
            |hyp| hyp.prospect.is_infinite() || hyp.prospect > threshold,
        );
    }

    /// Add the frame's acoustic scores and record the best score and prospect.
    pub fn add_acoustic_scores(&mut self, scorer: &dyn FrameScorer) {
        self.best_score = Score::INFINITY;
        self.best_prospect = Score::INFINITY;
        let factor = self.acoustic_lookahead.prospect_factor();
        for hyp in &mut self.state_hypotheses {
            if hyp.prospect.is_infinite() {
                continue;
            }
            let score = scorer.score(self.network.mixture(hyp.state));
            hyp.score += score;
            hyp.prospect += score * factor;
            self.best_score = self.best_score.min(hyp.score);
            self.best_prospect = self.best_prospect.min(hyp.prospect);
        }
    }

    /// Keep hypotheses whose prospect is within `threshold`. This is the pass
    /// that advances the empty-frame counter of instances.
    pub fn prune_states(&mut self, threshold: Score) {
        let latency = self.latency();
        compact_states(
            &mut self.state_hypotheses,
            &mut self.instances,
            latency,
            true,
            |hyp| hyp.prospect.is_infinite() || hyp.prospect > threshold,
        );
    }

    /// Among hypotheses of the same network state (different LM contexts),
    /// keep the best and those within the LM-state beam of it.
    pub fn prune_states_per_lm_state(&mut self) {
        let beam = self.thresholds.lm_state;
        if !beam.is_finite() || beam >= self.thresholds.acoustic {
            return;
        }
        let before = self.state_hypotheses.len();

        // first hypothesis with the lowest prospect wins each state
        for (index, hyp) in self.state_hypotheses.iter().enumerate() {
            // slots at or after `index` were not written by this pass
            let slot = &mut self.lm_state_best[hyp.state as usize];
            if *slot as usize >= index
                || self.state_hypotheses[*slot as usize].state != hyp.state
                || self.state_hypotheses[*slot as usize].prospect > hyp.prospect
            {
                *slot = index as u32;
            }
        }
        let latency = self.latency();
        let active = self.instances.take_active();
        let mut kept = Vec::with_capacity(active.len());
        let mut out = 0usize;
        for id in active {
            let range = self.instances.get(id).states;
            let begin = out;
            for index in range.indices() {
                let hyp = self.state_hypotheses[index];
                let best = self.lm_state_best[hyp.state as usize] as usize;
                if best == index {
                    // the winner moves; later hypotheses compare against its new slot
                    self.lm_state_best[hyp.state as usize] = out as u32;
                    self.state_hypotheses[out] = hyp;
                    out += 1;
                } else if hyp.prospect <= self.state_hypotheses[best].prospect + beam {
                    self.state_hypotheses[out] = hyp;
                    out += 1;
                }
            }
            self.instances.get_mut(id).states = StateRange::new(begin as u32, out as u32);
            if !self.instances.eventually_deactivate(id, latency, false) {
                kept.push(id);
            }
        }
        self.state_hypotheses.truncate(out);
        self.instances.set_active(kept);
        self.statistics.lm_state_pruned += (before - out) as u64;
    }

    /// Cap the number of hypotheses at the acoustic limit. Returns the
    /// saturation sample: 1 when the cap was applied, 0 otherwise.
    fn histogram_prune_states(&mut self) -> f64 {
        let limit = self.thresholds.acoustic_limit;
        if self.state_hypotheses.len() <= limit as usize || !self.thresholds.acoustic.is_finite() {
            return 0.0;
        }
        let best = self.best_prospect;
        self.state_histogram
            .set_limits(best, best + self.thresholds.acoustic);
        for hyp in &self.state_hypotheses {
            self.state_histogram.add(hyp.prospect);
        }
        let threshold = self.state_histogram.quantile(limit);
        trace!(
            "Histogram pruning {} states at {:.3} above the best",
            self.state_hypotheses.len(),
            threshold - best
        );
        let latency = self.latency();
        compact_states(
            &mut self.state_hypotheses,
            &mut self.instances,
            latency,
            false,
            |hyp| hyp.prospect.is_infinite() || hyp.prospect > threshold,
        );
        self.statistics.acoustic_histogram_prunings += 1;
        1.0
    }

    /// Correct boundary times and scores of hypotheses that crossed the
    /// pushed word boundary of a minimized network.
    pub fn correct_pushed_transitions(&mut self, scorer: &dyn FrameScorer) {
        if !self.config.correct_pushed_boundary_times || !self.minimized {
            return;
        }
        let root_depth = self.depths.depth(self.network.root_state());
        let correct_scores = self.config.correct_pushed_acoustic_scores;
        let offset = self.global_score_offset;
        let time = self.time;
        let mut corrected = 0u64;

        for hyp in &mut self.state_hypotheses {
            let depth = self.depths.depth(hyp.state);
            if depth == root_depth {
                let origin = self.traces.unmodified(hyp.trace);
                let trace = self.traces.trace(origin);
                let time_delta = (1 + time).saturating_sub(trace.time);
                let score_delta =
                    correct_scores.then(|| hyp.score + offset - trace.score.total());
                hyp.trace = self.traces.modify(origin, time_delta, score_delta, hyp.state);
                corrected += 1;
            } else if depth > root_depth && !self.traces.is_modified(hyp.trace) {
                let trace = self.traces.trace(hyp.trace);
                let time_delta = time.saturating_sub(trace.time);
                let score_delta = (correct_scores && time_delta > 0).then(|| {
                    hyp.score + offset
                        - scorer.score(self.network.mixture(hyp.state))
                        - trace.score.total()
                });
                hyp.trace = self.traces.modify(hyp.trace, time_delta, score_delta, hyp.state);
                corrected += 1;
            }
        }
        self.statistics.corrected_traces += corrected;
    }

    /// All state pruning of one frame, around the acoustic scores.
    pub fn prune_and_add_scores(&mut self, scorer: &dyn FrameScorer) {
        let scorer = CachedScorer::new(scorer);
        self.statistics.instances_before_pruning += self.instances.active_len() as u64;
        self.statistics.states_before_pruning += self.state_hypotheses.len() as u64;

        self.filter_states();
        self.prune_states_early();
        self.statistics.states_after_pre_pruning += self.state_hypotheses.len() as u64;

        self.add_acoustic_scores(&scorer);
        self.prune_states(self.best_prospect + self.thresholds.acoustic);
        self.prune_states_per_lm_state();
        let saturation = self.histogram_prune_states();
        self.averages.acoustic_pruning_saturation.add(saturation);

        self.correct_pushed_transitions(&scorer);

        let states = self.state_hypotheses.len();
        self.statistics.instances_after_pruning += self.instances.active_len() as u64;
        self.statistics.states_after_pruning += states as u64;
        self.averages.states_after_pruning.add(states as f64);
        trace!(
            "Frame {}: {} states after pruning, best {:.3}",
            self.time,
            states,
            self.best_score
        );
    }
}
