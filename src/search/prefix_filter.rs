//! Early veto over state hypotheses.

use rustc_hash::FxHashSet;

use super::hypothesis::StateHypothesis;
use crate::types::StateId;

/// Decides before any other pruning pass whether a hypothesis is dropped.
pub trait PrefixFilter: Send {
    /// `true` removes the hypothesis.
    fn prune(&self, hypothesis: &StateHypothesis) -> bool;
}

impl<F> PrefixFilter for F
where
    F: Fn(&StateHypothesis) -> bool + Send,
{
    fn prune(&self, hypothesis: &StateHypothesis) -> bool {
        self(hypothesis)
    }
}

/// Keeps only hypotheses in an allowed set of states.
#[derive(Debug, Clone, Default)]
pub struct StateSetFilter {
    allowed: FxHashSet<StateId>,
}

impl StateSetFilter {
    pub fn new(allowed: impl IntoIterator<Item = StateId>) -> Self {
        Self {
            allowed: allowed.into_iter().collect(),
        }
    }
}

impl PrefixFilter for StateSetFilter {
    fn prune(&self, hypothesis: &StateHypothesis) -> bool {
        !self.allowed.contains(&hypothesis.state)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::TraceId;

    #[test]
    fn test_state_set_filter() {
        let filter = StateSetFilter::new([2, 3]);
        assert!(!filter.prune(&StateHypothesis::new(2, 0.0, TraceId(0))));
        assert!(filter.prune(&StateHypothesis::new(4, 0.0, TraceId(0))));
    }

    #[test]
    fn test_closure_filter() {
        let filter = |hyp: &StateHypothesis| hyp.score > 10.0;
        assert!(filter.prune(&StateHypothesis::new(1, 11.0, TraceId(0))));
    }
}
