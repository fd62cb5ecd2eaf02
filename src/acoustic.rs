//! Acoustic scoring collaborators.

use std::cell::RefCell;

use rustc_hash::FxHashMap;

use crate::types::{MixtureId, Score, StateId};

/// Emission scores of the current frame.
pub trait FrameScorer {
    fn score(&self, mixture: MixtureId) -> Score;
}

impl FrameScorer for [Score] {
    fn score(&self, mixture: MixtureId) -> Score {
        self.get(mixture.index()).copied().unwrap_or(Score::INFINITY)
    }
}

impl FrameScorer for Vec<Score> {
    fn score(&self, mixture: MixtureId) -> Score {
        self.as_slice().score(mixture)
    }
}

impl<F> FrameScorer for F
where
    F: Fn(MixtureId) -> Score,
{
    fn score(&self, mixture: MixtureId) -> Score {
        self(mixture)
    }
}

/// Memoizes an expensive scorer within one frame.
pub struct CachedScorer<'a> {
    inner: &'a dyn FrameScorer,
    cache: RefCell<FxHashMap<MixtureId, Score>>,
}

impl<'a> CachedScorer<'a> {
    pub fn new(inner: &'a dyn FrameScorer) -> Self {
        Self {
            inner,
            cache: RefCell::new(FxHashMap::default()),
        }
    }

    pub fn cached(&self) -> usize {
        self.cache.borrow().len()
    }
}

impl FrameScorer for CachedScorer<'_> {
    fn score(&self, mixture: MixtureId) -> Score {
        if let Some(score) = self.cache.borrow().get(&mixture) {
            return *score;
        }
        let score = self.inner.score(mixture);
        self.cache.borrow_mut().insert(mixture, score);
        score
    }
}

/// Optional estimate of future acoustic cost per state.
pub trait AcousticLookahead {
    fn is_enabled(&self) -> bool;

    /// Prepare estimates starting at `time`.
    fn start_frame(&mut self, time: u32);

    fn score(&self, state: StateId) -> Score;

    /// Weight of the look-ahead in the prospect of acoustic scores.
    fn temporal_scale(&self) -> f64;

    /// Factor applied to emission scores when they enter the prospect.
    fn prospect_factor(&self) -> f64 {
        if self.is_enabled() {
            1.0 + self.temporal_scale()
        } else {
            1.0
        }
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct NoAcousticLookahead;

impl AcousticLookahead for NoAcousticLookahead {
    fn is_enabled(&self) -> bool {
        false
    }

    fn start_frame(&mut self, _time: u32) {}

    fn score(&self, _state: StateId) -> Score {
        0.0
    }

    fn temporal_scale(&self) -> f64 {
        0.0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::Cell;

    #[test]
    fn test_slice_scorer() {
        let scores = vec![0.5, 1.5];
        assert_eq!(scores.score(MixtureId(1)), 1.5);
        assert_eq!(scores.score(MixtureId(7)), Score::INFINITY);
    }

    #[test]
    fn test_cached_scorer_calls_once() {
        let calls = Cell::new(0);
        let inner = |mixture: MixtureId| {
            calls.set(calls.get() + 1);
            mixture.value() as Score
        };
        let cached = CachedScorer::new(&inner);
        assert_eq!(cached.score(MixtureId(3)), 3.0);
        assert_eq!(cached.score(MixtureId(3)), 3.0);
        assert_eq!(cached.score(MixtureId(4)), 4.0);
        assert_eq!(calls.get(), 2);
        assert_eq!(cached.cached(), 2);
    }

    #[test]
    fn test_prospect_factor() {
        assert_eq!(NoAcousticLookahead.prospect_factor(), 1.0);
    }
}
