//! Hypothesis records moved between the search passes.

use std::sync::Arc;

use crate::trace::Trace;
use crate::types::{ExitId, History, PronunciationId, Score, ScoreVector, StateId, TraceId};

/// Partial path ending in one network state.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct StateHypothesis {
    pub state: StateId,
    /// Accumulated path cost, relative to the global score offset.
    pub score: Score,
    /// `score` plus look-ahead estimates. Only used to order pruning.
    pub prospect: Score,
    pub trace: TraceId,
}

impl StateHypothesis {
    pub fn new(state: StateId, score: Score, trace: TraceId) -> Self {
        Self {
            state,
            score,
            prospect: score,
            trace,
        }
    }
}

/// Half-open range of an instance inside the state hypothesis array.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct StateRange {
    pub begin: u32,
    pub end: u32,
}

impl StateRange {
    pub fn new(begin: u32, end: u32) -> Self {
        Self { begin, end }
    }

    pub fn len(&self) -> usize {
        (self.end - self.begin) as usize
    }

    pub fn is_empty(&self) -> bool {
        self.begin == self.end
    }

    pub fn contains(&self, index: u32) -> bool {
        index >= self.begin && index < self.end
    }

    pub fn indices(&self) -> std::ops::Range<usize> {
        self.begin as usize..self.end as usize
    }
}

/// Word end found in the current frame, before the trace is attached.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct EarlyWordEndHypothesis {
    pub trace: TraceId,
    pub score: ScoreVector,
    pub exit: ExitId,
}

/// Word end that survived early pruning.
#[derive(Debug, Clone)]
pub struct WordEndHypothesis {
    pub history: History,
    pub lookahead_history: History,
    pub transit_state: StateId,
    /// `None` for the sentence begin and for boundary labels.
    pub pronunciation: Option<PronunciationId>,
    pub score: ScoreVector,
    pub trace: Arc<Trace>,
    /// Exit the word end came from, `None` for the sentence begin.
    pub exit: Option<ExitId>,
}
