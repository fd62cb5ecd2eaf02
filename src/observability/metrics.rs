//! Search metrics.
//!
//! Records go through the `metrics` facade and are dropped unless the
//! application installs a recorder.

use std::time::Instant;

use metrics::{counter, describe_counter, describe_gauge, describe_histogram, gauge, histogram};
use tracing::debug;

pub const FRAMES_TOTAL: &str = "tree_search_frames_total";
pub const STATES_BEFORE_PRUNING: &str = "tree_search_states_before_pruning";
pub const STATES_AFTER_PRUNING: &str = "tree_search_states_after_pruning";
pub const WORD_ENDS_AFTER_PRUNING: &str = "tree_search_word_ends_after_pruning";
pub const ACTIVE_INSTANCES: &str = "tree_search_active_instances";
pub const HISTOGRAM_SATURATION: &str = "tree_search_histogram_pruning_saturation";
pub const LOOKAHEAD_CACHE_HITS: &str = "tree_search_lookahead_cache_hits_total";
pub const LOOKAHEAD_CACHE_MISSES: &str = "tree_search_lookahead_cache_misses_total";
pub const LOOKAHEAD_TABLES: &str = "tree_search_lookahead_tables_computed_total";
pub const SENTENCE_END_FALLBACKS: &str = "tree_search_sentence_end_fallbacks_total";
pub const FRAME_DURATION: &str = "tree_search_frame_duration_seconds";

/// Register descriptions for all search metrics.
pub fn describe_search_metrics() {
    describe_counter!(FRAMES_TOTAL, "Total number of decoded frames");
    describe_histogram!(
        STATES_BEFORE_PRUNING,
        "State hypotheses after expansion, before pruning"
    );
    describe_histogram!(STATES_AFTER_PRUNING, "State hypotheses surviving pruning");
    describe_histogram!(
        WORD_ENDS_AFTER_PRUNING,
        "Word-end hypotheses surviving pruning"
    );
    describe_gauge!(ACTIVE_INSTANCES, "Number of active tree instances");
    describe_gauge!(
        HISTOGRAM_SATURATION,
        "State count relative to the histogram pruning limit"
    );
    describe_counter!(
        LOOKAHEAD_CACHE_HITS,
        "Look-ahead table requests served from the cache"
    );
    describe_counter!(
        LOOKAHEAD_CACHE_MISSES,
        "Look-ahead table requests that computed a table"
    );
    describe_counter!(LOOKAHEAD_TABLES, "Look-ahead tables computed");
    describe_counter!(
        SENTENCE_END_FALLBACKS,
        "Utterances finished through the sentence-end fallback"
    );
    describe_histogram!(FRAME_DURATION, "Duration of one search frame in seconds");
}

/// Per-frame search space sizes.
pub fn record_frame(
    states_before: usize,
    states_after: usize,
    word_ends: usize,
    instances: usize,
    saturation: f64,
) {
    counter!(FRAMES_TOTAL).increment(1);
    histogram!(STATES_BEFORE_PRUNING).record(states_before as f64);
    histogram!(STATES_AFTER_PRUNING).record(states_after as f64);
    histogram!(WORD_ENDS_AFTER_PRUNING).record(word_ends as f64);
    gauge!(ACTIVE_INSTANCES).set(instances as f64);
    gauge!(HISTOGRAM_SATURATION).set(saturation);
}

pub fn record_lookahead_cache(hit: bool) {
    if hit {
        counter!(LOOKAHEAD_CACHE_HITS).increment(1);
    } else {
        counter!(LOOKAHEAD_CACHE_MISSES).increment(1);
    }
}

pub fn record_lookahead_table(sparse: bool) {
    let kind = if sparse { "sparse" } else { "dense" };
    counter!(LOOKAHEAD_TABLES, "kind" => kind).increment(1);
}

pub fn record_sentence_end_fallback() {
    counter!(SENTENCE_END_FALLBACKS).increment(1);
}

/// Records the frame duration when finished or dropped.
pub struct FrameTimer {
    start: Instant,
    recorded: bool,
}

impl FrameTimer {
    pub fn new() -> Self {
        Self {
            start: Instant::now(),
            recorded: false,
        }
    }

    pub fn finish(mut self) {
        self.record();
    }

    fn record(&mut self) {
        if self.recorded {
            return;
        }
        self.recorded = true;
        let duration = self.start.elapsed();
        histogram!(FRAME_DURATION).record(duration.as_secs_f64());
        debug!("Frame took {:.3}ms", duration.as_secs_f64() * 1000.0);
    }
}

impl Default for FrameTimer {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for FrameTimer {
    fn drop(&mut self) {
        if !std::thread::panicking() {
            self.record();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_metrics_recording() {
        // no recorder installed, calls must not panic
        describe_search_metrics();
        record_frame(120, 80, 4, 2, 0.25);
        record_lookahead_cache(true);
        record_lookahead_cache(false);
        record_lookahead_table(true);
        record_sentence_end_fallback();
        FrameTimer::new().finish();
        let _timer = FrameTimer::default();
    }
}
