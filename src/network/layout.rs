//! Precomputed per-state expansion plans.
//!
//! For every state the layout records how its direct successors, its
//! two-hop (skip) successors and its exit labels can be enumerated. Ranges
//! are half-open. Irregular entries fall back to walking the network.

use std::ops::Range;
use std::slice;

use tracing::info;

use super::{SearchNetwork, StateDepths};
use crate::types::{ExitId, StateId};

/// Direct state successors of one state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ForwardBatch {
    None,
    Single(StateId),
    /// Contiguous ascending ids `start..end`.
    Range(StateId, StateId),
    Irregular,
}

/// Two-hop successors of one state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SkipBatch {
    /// No skip targets, or skips forbidden by symmetrization.
    None,
    Range(StateId, StateId),
    Irregular,
}

/// Exit labels attached to one state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExitLabels {
    None,
    Single(ExitId),
    Range(u32, u32),
    /// Slice `start..end` of the layout's irregular label list.
    Irregular(u32, u32),
}

/// Iterator over the exit labels of one state.
#[derive(Debug, Clone)]
pub enum ExitIter<'a> {
    Empty,
    Single(Option<ExitId>),
    Range(Range<u32>),
    Slice(slice::Iter<'a, ExitId>),
}

impl Iterator for ExitIter<'_> {
    type Item = ExitId;

    fn next(&mut self) -> Option<ExitId> {
        match self {
            ExitIter::Empty => None,
            ExitIter::Single(exit) => exit.take(),
            ExitIter::Range(range) => range.next().map(ExitId),
            ExitIter::Slice(iter) => iter.next().copied(),
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct LayoutStats {
    pub forward_batches: usize,
    pub irregular_forward: usize,
    pub skip_batches: usize,
    pub irregular_skips: usize,
    pub symmetrized: usize,
    pub single_exits: usize,
    pub multi_exits: usize,
    pub irregular_exit_items: usize,
}

#[derive(Debug, Clone)]
pub struct NetworkLayout {
    forward: Vec<ForwardBatch>,
    skip: Vec<SkipBatch>,
    labels: Vec<ExitLabels>,
    irregular_labels: Vec<ExitId>,
    stats: LayoutStats,
}

/// Classify an id sequence as empty, single or contiguous ascending.
fn contiguous(ids: &[u32]) -> Option<(u32, u32)> {
    let first = *ids.first()?;
    ids.iter()
        .enumerate()
        .all(|(i, id)| *id == first + i as u32)
        .then(|| (first, first + ids.len() as u32))
}

impl NetworkLayout {
    /// Build the layout. With `symmetrize`, skips are forbidden out of states
    /// at the root depth and one HMM length below it.
    pub fn build(network: &SearchNetwork, depths: &StateDepths, symmetrize: bool) -> Self {
        let count = network.state_count();
        let mut forward = vec![ForwardBatch::None; count];
        let mut skip = vec![SkipBatch::None; count];
        let mut labels = vec![ExitLabels::None; count];
        let mut irregular_labels = Vec::new();
        let mut stats = LayoutStats::default();

        let root_depth = depths.depth(network.root_state());
        let hmm_length = network.hmm_length();

        for state in 1..count as StateId {
            let direct: Vec<StateId> = network.state_successors(state).collect();
            forward[state as usize] = match direct.as_slice() {
                [] => ForwardBatch::None,
                [single] => ForwardBatch::Single(*single),
                ids => match contiguous(ids) {
                    Some((start, end)) => ForwardBatch::Range(start, end),
                    None => {
                        stats.irregular_forward += 1;
                        ForwardBatch::Irregular
                    }
                },
            };
            if !direct.is_empty() {
                stats.forward_batches += 1;
            }

            let second: Vec<StateId> = direct
                .iter()
                .flat_map(|s| network.state_successors(*s))
                .collect();
            let depth = depths.depth(state);
            skip[state as usize] = if symmetrize
                && (depth == root_depth || depth == root_depth + hmm_length)
            {
                stats.symmetrized += 1;
                SkipBatch::None
            } else if second.is_empty() {
                SkipBatch::None
            } else {
                let mut sorted = second.clone();
                sorted.sort_unstable();
                // a continuous batch must not repeat a target
                match contiguous(&sorted) {
                    Some((start, end)) if sorted.len() == second.len() => {
                        stats.skip_batches += 1;
                        SkipBatch::Range(start, end)
                    }
                    _ => {
                        stats.irregular_skips += 1;
                        SkipBatch::Irregular
                    }
                }
            };

            let exits: Vec<u32> = network.labels(state).map(ExitId::value).collect();
            labels[state as usize] = match exits.as_slice() {
                [] => ExitLabels::None,
                [single] => {
                    stats.single_exits += 1;
                    ExitLabels::Single(ExitId(*single))
                }
                ids => {
                    stats.multi_exits += 1;
                    match contiguous(ids) {
                        Some((start, end)) => ExitLabels::Range(start, end),
                        None => {
                            let start = irregular_labels.len() as u32;
                            irregular_labels.extend(ids.iter().map(|id| ExitId(*id)));
                            ExitLabels::Irregular(start, irregular_labels.len() as u32)
                        }
                    }
                }
            };
        }
        stats.irregular_exit_items = irregular_labels.len();

        info!(
            "Network layout: {} forward batches ({} irregular), {} skip batches ({} irregular)",
            stats.forward_batches, stats.irregular_forward, stats.skip_batches, stats.irregular_skips
        );
        info!(
            "Exit lists: {} single, {} multi, {} irregular items",
            stats.single_exits, stats.multi_exits, stats.irregular_exit_items
        );
        if stats.symmetrized > 0 {
            info!("Symmetrized states (skips forbidden): {}", stats.symmetrized);
        }

        Self {
            forward,
            skip,
            labels,
            irregular_labels,
            stats,
        }
    }

    pub fn forward(&self, state: StateId) -> ForwardBatch {
        self.forward[state as usize]
    }

    pub fn skip(&self, state: StateId) -> SkipBatch {
        self.skip[state as usize]
    }

    pub fn exit_labels(&self, state: StateId) -> ExitLabels {
        self.labels[state as usize]
    }

    pub fn has_exits(&self, state: StateId) -> bool {
        self.labels[state as usize] != ExitLabels::None
    }

    /// Exit labels of `state` in network order.
    pub fn exits(&self, state: StateId) -> ExitIter<'_> {
        match self.labels[state as usize] {
            ExitLabels::None => ExitIter::Empty,
            ExitLabels::Single(exit) => ExitIter::Single(Some(exit)),
            ExitLabels::Range(start, end) => ExitIter::Range(start..end),
            ExitLabels::Irregular(start, end) => {
                ExitIter::Slice(self.irregular_labels[start as usize..end as usize].iter())
            }
        }
    }

    pub fn stats(&self) -> &LayoutStats {
        &self.stats
    }
}
