//! Per-state distance from the roots and to the deepest leaf.

use tracing::{debug, info};

use super::SearchNetwork;
use crate::error::{DecoderError, Result};
use crate::types::{StateId, INVALID_STATE};

const UNSET: i32 = i32::MIN;
const UNREACHABLE: i32 = i32::MAX;

/// Depth of each state counted from the root states, and inverted depth
/// (longest successor chain below the state).
#[derive(Debug, Clone, Default)]
pub struct StateDepths {
    depths: Vec<u32>,
    inverted: Vec<u32>,
    offset: u32,
}

struct DepthBuilder<'a> {
    network: &'a SearchNetwork,
    depths: Vec<i32>,
    inverted: Vec<i32>,
    found: Vec<Option<i32>>,
    on_path: Vec<bool>,
}

impl<'a> DepthBuilder<'a> {
    fn fill(&mut self, state: StateId, depth: i32) -> i32 {
        let s = state as usize;
        let current = self.depths[s];
        if current != UNSET {
            if current != depth {
                debug!(
                    "Conflicting state depths at state {}: {} vs {}",
                    state, current, depth
                );
            }
            // a state on the current path means a cycle, left to the consistency check
            if depth <= current || self.on_path[s] {
                return depth;
            }
        }
        self.depths[s] = depth;
        self.on_path[s] = true;

        let mut local = 0;
        let successors: Vec<StateId> = self.network.state_successors(state).collect();
        for successor in successors {
            local = local.max(self.fill(successor, depth + 1));
        }
        self.on_path[s] = false;
        self.inverted[s] = local;
        local + 1
    }

    /// Depth implied by the shallowest filled successor, without filling.
    fn find(&mut self, state: StateId) -> i32 {
        let s = state as usize;
        if self.depths[s] != UNSET {
            return self.depths[s];
        }
        if let Some(depth) = self.found[s] {
            return depth;
        }
        // guard against cycles among unfilled states
        self.found[s] = Some(UNREACHABLE);

        let mut next = UNREACHABLE;
        let successors: Vec<StateId> = self.network.state_successors(state).collect();
        for successor in successors {
            let d = self.find(successor);
            if d < next {
                next = d;
            }
        }
        let depth = if next == UNREACHABLE { UNREACHABLE } else { next - 1 };
        self.found[s] = Some(depth);
        depth
    }
}

impl StateDepths {
    /// Compute depths and verify that every state successor is strictly deeper.
    pub fn build(network: &SearchNetwork) -> Result<Self> {
        let count = network.state_count();
        let mut builder = DepthBuilder {
            network,
            depths: vec![UNSET; count],
            inverted: vec![0; count],
            found: vec![None; count],
            on_path: vec![false; count],
        };

        builder.fill(network.root_state(), 0);
        if network.ci_root_state() != INVALID_STATE {
            builder.fill(network.ci_root_state(), 0);
        }
        let mut unpushed: Vec<StateId> = network
            .unpushed_coarticulated_root_states()
            .iter()
            .copied()
            .collect();
        unpushed.sort_unstable();
        for state in unpushed {
            builder.fill(state, 0);
        }

        let mut coarticulated: Vec<StateId> =
            network.coarticulated_root_states().iter().copied().collect();
        coarticulated.sort_unstable();

        let mut offset = 0i32;
        for state in coarticulated {
            builder.found.iter_mut().for_each(|f| *f = None);
            let mut depth = builder.find(state);
            if depth == UNREACHABLE {
                info!("Disconnected subnetwork below coarticulated root {}", state);
                depth = 0;
            } else if depth < 0 {
                info!("Offsetting state depths by {}", -depth);
                for d in builder.depths.iter_mut().skip(1) {
                    if *d != UNSET {
                        *d -= depth;
                    }
                }
                offset -= depth;
                depth = 0;
            }
            builder.fill(state, depth);
        }

        for state in 1..count {
            if builder.depths[state] == UNSET {
                return Err(DecoderError::InconsistentDepths {
                    state: state as StateId,
                    detail: "state is not reachable from any root".to_string(),
                });
            }
        }
        for state in 1..count as StateId {
            let depth = builder.depths[state as usize];
            for successor in network.state_successors(state) {
                if builder.depths[successor as usize] <= depth {
                    return Err(DecoderError::InconsistentDepths {
                        state,
                        detail: format!(
                            "successor {} has depth {}, expected more than {}",
                            successor, builder.depths[successor as usize], depth
                        ),
                    });
                }
            }
        }

        let depths = builder
            .depths
            .iter()
            .map(|d| if *d == UNSET { 0 } else { *d as u32 })
            .collect();
        let inverted = builder.inverted.iter().map(|d| (*d).max(0) as u32).collect();

        Ok(Self {
            depths,
            inverted,
            offset: offset as u32,
        })
    }

    pub fn depth(&self, state: StateId) -> u32 {
        self.depths[state as usize]
    }

    pub fn inverted_depth(&self, state: StateId) -> u32 {
        self.inverted[state as usize]
    }

    /// Amount all depths were shifted to keep coarticulated roots non-negative.
    pub fn offset(&self) -> u32 {
        self.offset
    }

    pub fn len(&self) -> usize {
        self.depths.len()
    }

    pub fn is_empty(&self) -> bool {
        self.depths.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::network::{Coarticulation, NetworkBuilder, TransitionModel};
    use crate::types::MixtureId;

    #[test]
    fn test_chain_depths() {
        let mut builder = NetworkBuilder::new();
        let tm = builder.add_transition_model(TransitionModel::default());
        let root = builder.add_state(MixtureId(0), tm);
        let a = builder.add_state(MixtureId(1), tm);
        let b = builder.add_state(MixtureId(2), tm);
        let c = builder.add_state(MixtureId(3), tm);
        builder.set_root_state(root);
        builder.add_successor(root, a).add_successor(a, b).add_successor(root, c);
        let network = builder.build().unwrap();

        let depths = StateDepths::build(&network).unwrap();
        assert_eq!(depths.depth(root), 0);
        assert_eq!(depths.depth(a), 1);
        assert_eq!(depths.depth(b), 2);
        assert_eq!(depths.depth(c), 1);
        assert_eq!(depths.inverted_depth(root), 2);
        assert_eq!(depths.inverted_depth(b), 0);
        assert_eq!(depths.offset(), 0);
    }

    #[test]
    fn test_coarticulated_root_takes_successor_depth() {
        let mut builder = NetworkBuilder::new();
        let tm = builder.add_transition_model(TransitionModel::default());
        let root = builder.add_state(MixtureId(0), tm);
        let a = builder.add_state(MixtureId(1), tm);
        let b = builder.add_state(MixtureId(2), tm);
        let coarticulated = builder.add_state(MixtureId(3), tm);
        builder.set_root_state(root);
        builder.add_successor(root, a).add_successor(a, b);
        builder.add_successor(coarticulated, b);
        builder.add_coarticulated_root(coarticulated, Coarticulation::NONE, false);
        let network = builder.build().unwrap();

        let depths = StateDepths::build(&network).unwrap();
        assert_eq!(depths.depth(coarticulated), 1);
        assert_eq!(depths.depth(b), 2);
    }

    #[test]
    fn test_coarticulated_root_offsets_depths() {
        let mut builder = NetworkBuilder::new();
        let tm = builder.add_transition_model(TransitionModel::default());
        let root = builder.add_state(MixtureId(0), tm);
        let coarticulated = builder.add_state(MixtureId(1), tm);
        builder.set_root_state(root);
        builder.add_successor(coarticulated, root);
        builder.add_coarticulated_root(coarticulated, Coarticulation::NONE, false);
        let network = builder.build().unwrap();

        let depths = StateDepths::build(&network).unwrap();
        assert_eq!(depths.offset(), 1);
        assert_eq!(depths.depth(coarticulated), 0);
        assert_eq!(depths.depth(root), 1);
    }

    #[test]
    fn test_cycle_is_inconsistent() {
        let mut builder = NetworkBuilder::new();
        let tm = builder.add_transition_model(TransitionModel::default());
        let root = builder.add_state(MixtureId(0), tm);
        let a = builder.add_state(MixtureId(1), tm);
        builder.set_root_state(root);
        builder.add_successor(root, a).add_successor(a, root);
        let network = builder.build().unwrap();

        let err = StateDepths::build(&network).unwrap_err();
        assert!(matches!(err, DecoderError::InconsistentDepths { .. }));
    }

    #[test]
    fn test_unreachable_state_is_inconsistent() {
        let mut builder = NetworkBuilder::new();
        let tm = builder.add_transition_model(TransitionModel::default());
        let root = builder.add_state(MixtureId(0), tm);
        builder.add_state(MixtureId(1), tm);
        builder.set_root_state(root);
        let network = builder.build().unwrap();

        assert!(StateDepths::build(&network).is_err());
    }
}
