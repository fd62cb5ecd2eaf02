//! Back-pointer traces.
//!
//! A [`Trace`] is an immutable node shared through `Arc`. Predecessor links
//! form the best path, sibling links chain the alternatives that lost a
//! recombination so a word lattice can be recovered. The sibling link is
//! the only field that changes after construction.

pub mod lattice;
pub mod manager;

pub use lattice::{prune_silence_siblings, LatticeArc, WordLattice};
pub use manager::{Modification, TraceItem, TraceManager};

use std::sync::Arc;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

use crate::network::Coarticulation;
use crate::types::{PronunciationId, ScoreVector, StateId, TimeframeIndex};

/// What a trace node records.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TraceKind {
    /// A recognized word (including zero-duration pronunciations).
    Word(PronunciationId),
    /// Time or score correction without a word.
    Epsilon,
    /// Sentence begin or sentence end.
    Boundary,
}

/// Context the path continues in after the trace.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Transit {
    Coarticulation(Coarticulation),
    /// Exact network state, used when state encoding is enabled.
    State(StateId),
}

impl Default for Transit {
    fn default() -> Self {
        Transit::Coarticulation(Coarticulation::NONE)
    }
}

#[derive(Debug)]
pub struct Trace {
    pub predecessor: Option<Arc<Trace>>,
    pub kind: TraceKind,
    /// Frame at which the recorded item ends.
    pub time: TimeframeIndex,
    /// Absolute accumulated score.
    pub score: ScoreVector,
    pub transit: Transit,
    sibling: Mutex<Option<Arc<Trace>>>,
}

/// One element of a best-path traceback, oldest first.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TracebackItem {
    pub kind: TraceKind,
    pub time: TimeframeIndex,
    pub score: ScoreVector,
    pub transit: Transit,
}

impl TracebackItem {
    pub fn pronunciation(&self) -> Option<PronunciationId> {
        match self.kind {
            TraceKind::Word(p) => Some(p),
            _ => None,
        }
    }
}

impl Trace {
    pub fn new(
        predecessor: Option<Arc<Trace>>,
        kind: TraceKind,
        time: TimeframeIndex,
        score: ScoreVector,
        transit: Transit,
    ) -> Self {
        Self {
            predecessor,
            kind,
            time,
            score,
            transit,
            sibling: Mutex::new(None),
        }
    }

    /// Sentence-begin trace at `time` with zero score.
    pub fn boundary(time: TimeframeIndex, transit: Transit) -> Self {
        Self::new(None, TraceKind::Boundary, time, ScoreVector::default(), transit)
    }

    pub fn pronunciation(&self) -> Option<PronunciationId> {
        match self.kind {
            TraceKind::Word(p) => Some(p),
            _ => None,
        }
    }

    pub fn sibling(&self) -> Option<Arc<Trace>> {
        self.sibling.lock().clone()
    }

    pub fn has_sibling(&self) -> bool {
        self.sibling.lock().is_some()
    }

    pub fn set_sibling(&self, sibling: Option<Arc<Trace>>) {
        *self.sibling.lock() = sibling;
    }

    pub fn take_sibling(&self) -> Option<Arc<Trace>> {
        self.sibling.lock().take()
    }

    /// This trace followed by its sibling chain.
    pub fn siblings(self: &Arc<Self>) -> SiblingIter {
        SiblingIter {
            next: Some(Arc::clone(self)),
        }
    }

    /// Walk the predecessor chain, oldest item first.
    pub fn traceback(&self) -> Vec<TracebackItem> {
        let mut items = vec![self.item()];
        let mut current = self.predecessor.clone();
        while let Some(trace) = current {
            items.push(trace.item());
            current = trace.predecessor.clone();
        }
        items.reverse();
        items
    }

    /// Pronunciations on the best path, oldest first.
    pub fn words(&self) -> Vec<PronunciationId> {
        self.traceback().iter().filter_map(TracebackItem::pronunciation).collect()
    }

    fn item(&self) -> TracebackItem {
        TracebackItem {
            kind: self.kind,
            time: self.time,
            score: self.score,
            transit: self.transit,
        }
    }
}

impl Drop for Trace {
    // unlink long chains iteratively
    fn drop(&mut self) {
        let mut next = self.predecessor.take();
        while let Some(trace) = next {
            match Arc::try_unwrap(trace) {
                Ok(mut owned) => next = owned.predecessor.take(),
                Err(_) => break,
            }
        }
    }
}

pub struct SiblingIter {
    next: Option<Arc<Trace>>,
}

impl Iterator for SiblingIter {
    type Item = Arc<Trace>;

    fn next(&mut self) -> Option<Arc<Trace>> {
        let current = self.next.take()?;
        self.next = current.sibling();
        Some(current)
    }
}

/// Insert `loser` and its own sibling chain right behind `winner`.
///
/// Nothing changes when one trace already sits in the other's chain, which
/// includes linking a trace to itself.
pub fn link_sibling(winner: &Arc<Trace>, loser: &Arc<Trace>) {
    if winner.siblings().any(|t| Arc::ptr_eq(&t, loser))
        || loser.siblings().any(|t| Arc::ptr_eq(&t, winner))
    {
        return;
    }
    let rest = winner.take_sibling();
    let mut last = Arc::clone(loser);
    while let Some(next) = last.sibling() {
        last = next;
    }
    last.set_sibling(rest);
    winner.set_sibling(Some(Arc::clone(loser)));
}
