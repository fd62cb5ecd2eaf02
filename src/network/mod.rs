//! Read-only search network.
//!
//! The network is a directed graph of HMM states 1..N (state 0 is invalid)
//! stored in CSR form. Each successor entry is either another state or a
//! label pointing at an [`Exit`] (a possible word end). The search never
//! mutates the network; per-state expansion plans and depths are derived
//! once by [`NetworkLayout`] and [`StateDepths`].

pub mod builder;
pub mod depths;
pub mod layout;
pub mod lexicon;

pub use builder::NetworkBuilder;
pub use depths::StateDepths;
pub use layout::{ExitIter, ExitLabels, ForwardBatch, NetworkLayout, SkipBatch};
pub use lexicon::{Lemma, Lexicon, Pronunciation};

use std::collections::BTreeMap;

use rustc_hash::FxHashSet;
use serde::{Deserialize, Serialize};

use crate::types::{ExitId, MixtureId, PhonemeId, PronunciationId, Score, StateId};

/// Successor entry of a state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Successor {
    State(StateId),
    Label(ExitId),
}

/// A labeled word end.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Exit {
    /// `None` for internal boundary labels without a word.
    pub pronunciation: Option<PronunciationId>,
    /// State the next word starts in.
    pub transit_state: StateId,
}

/// Transition penalties of one HMM state. An infinite penalty forbids the edge.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct TransitionModel {
    pub loop_penalty: Score,
    pub forward: Score,
    pub skip: Score,
    pub exit: Score,
}

impl TransitionModel {
    pub fn new(loop_penalty: Score, forward: Score, skip: Score, exit: Score) -> Self {
        Self {
            loop_penalty,
            forward,
            skip,
            exit,
        }
    }
}

impl Default for TransitionModel {
    fn default() -> Self {
        Self::new(0.0, 0.0, Score::INFINITY, 0.0)
    }
}

/// Phonetic context across a word boundary.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default, Serialize, Deserialize)]
pub struct Coarticulation {
    /// Last phoneme of the preceding word.
    pub final_phone: Option<PhonemeId>,
    /// First phoneme of the following word.
    pub initial_phone: Option<PhonemeId>,
}

impl Coarticulation {
    /// No context on either side.
    pub const NONE: Coarticulation = Coarticulation {
        final_phone: None,
        initial_phone: None,
    };

    pub fn new(final_phone: Option<PhonemeId>, initial_phone: Option<PhonemeId>) -> Self {
        Self {
            final_phone,
            initial_phone,
        }
    }

    pub fn is_none(&self) -> bool {
        self.final_phone.is_none() && self.initial_phone.is_none()
    }
}

#[derive(Debug, Clone)]
pub struct SearchNetwork {
    pub(crate) mixtures: Vec<MixtureId>,
    pub(crate) state_models: Vec<u16>,
    pub(crate) offsets: Vec<u32>,
    pub(crate) successors: Vec<Successor>,
    pub(crate) transition_models: Vec<TransitionModel>,
    pub(crate) exits: Vec<Exit>,
    pub(crate) root_state: StateId,
    pub(crate) ci_root_state: StateId,
    pub(crate) coarticulated_root_states: FxHashSet<StateId>,
    pub(crate) unpushed_coarticulated_root_states: FxHashSet<StateId>,
    pub(crate) root_transit_descriptions: BTreeMap<StateId, Coarticulation>,
    pub(crate) uncoarticulated_word_end_states: FxHashSet<StateId>,
    pub(crate) lexicon: Lexicon,
    pub(crate) minimized: bool,
    pub(crate) hmm_length: u32,
}

impl SearchNetwork {
    /// Number of state slots including the invalid state 0.
    pub fn state_count(&self) -> usize {
        self.mixtures.len()
    }

    /// All successor entries of `state` in network order.
    pub fn successors(&self, state: StateId) -> &[Successor] {
        let s = state as usize;
        &self.successors[self.offsets[s] as usize..self.offsets[s + 1] as usize]
    }

    /// State successors of `state`, labels skipped.
    pub fn state_successors(&self, state: StateId) -> impl Iterator<Item = StateId> + '_ {
        self.successors(state).iter().filter_map(|s| match s {
            Successor::State(t) => Some(*t),
            Successor::Label(_) => None,
        })
    }

    /// Exit labels attached to `state`, in network order.
    pub fn labels(&self, state: StateId) -> impl Iterator<Item = ExitId> + '_ {
        self.successors(state).iter().filter_map(|s| match s {
            Successor::Label(e) => Some(*e),
            Successor::State(_) => None,
        })
    }

    pub fn mixture(&self, state: StateId) -> MixtureId {
        self.mixtures[state as usize]
    }

    pub fn transition_model(&self, state: StateId) -> &TransitionModel {
        &self.transition_models[self.state_models[state as usize] as usize]
    }

    pub fn exit(&self, exit: ExitId) -> &Exit {
        &self.exits[exit.index()]
    }

    pub fn exits(&self) -> &[Exit] {
        &self.exits
    }

    pub fn root_state(&self) -> StateId {
        self.root_state
    }

    /// Context-independent root, 0 when the network has none.
    pub fn ci_root_state(&self) -> StateId {
        self.ci_root_state
    }

    pub fn coarticulated_root_states(&self) -> &FxHashSet<StateId> {
        &self.coarticulated_root_states
    }

    pub fn unpushed_coarticulated_root_states(&self) -> &FxHashSet<StateId> {
        &self.unpushed_coarticulated_root_states
    }

    pub fn root_transit_descriptions(&self) -> &BTreeMap<StateId, Coarticulation> {
        &self.root_transit_descriptions
    }

    pub fn uncoarticulated_word_end_states(&self) -> &FxHashSet<StateId> {
        &self.uncoarticulated_word_end_states
    }

    /// Whether a word end entering `state` may close a sentence.
    pub fn is_accepting(&self, state: StateId) -> bool {
        state == self.root_state
            || (self.ci_root_state != 0 && state == self.ci_root_state)
            || self.uncoarticulated_word_end_states.contains(&state)
    }

    pub fn lexicon(&self) -> &Lexicon {
        &self.lexicon
    }

    /// Whether the network was tail minimized (word-end labels pushed towards the root).
    pub fn is_minimized(&self) -> bool {
        self.minimized
    }

    pub fn hmm_length(&self) -> u32 {
        self.hmm_length
    }
}
