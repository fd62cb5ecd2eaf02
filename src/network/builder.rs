//! Assembly of a [`SearchNetwork`] from explicit states, edges and exits.

use std::collections::BTreeMap;

use rustc_hash::FxHashSet;
use tracing::debug;

use super::{Coarticulation, Exit, Lexicon, SearchNetwork, Successor, TransitionModel};
use crate::error::{DecoderError, Result};
use crate::types::{ExitId, MixtureId, PronunciationId, StateId, INVALID_STATE};

/// Incremental network builder. Ids are validated in [`NetworkBuilder::build`].
#[derive(Debug, Clone)]
pub struct NetworkBuilder {
    mixtures: Vec<MixtureId>,
    state_models: Vec<u16>,
    successors: Vec<Vec<Successor>>,
    transition_models: Vec<TransitionModel>,
    exits: Vec<Exit>,
    root_state: StateId,
    ci_root_state: StateId,
    coarticulated_root_states: FxHashSet<StateId>,
    unpushed_coarticulated_root_states: FxHashSet<StateId>,
    root_transit_descriptions: BTreeMap<StateId, Coarticulation>,
    uncoarticulated_word_end_states: FxHashSet<StateId>,
    lexicon: Lexicon,
    minimized: bool,
    hmm_length: u32,
}

impl Default for NetworkBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl NetworkBuilder {
    pub fn new() -> Self {
        Self {
            // slot 0 is the invalid state
            mixtures: vec![MixtureId(0)],
            state_models: vec![0],
            successors: vec![Vec::new()],
            transition_models: Vec::new(),
            exits: Vec::new(),
            root_state: INVALID_STATE,
            ci_root_state: INVALID_STATE,
            coarticulated_root_states: FxHashSet::default(),
            unpushed_coarticulated_root_states: FxHashSet::default(),
            root_transit_descriptions: BTreeMap::new(),
            uncoarticulated_word_end_states: FxHashSet::default(),
            lexicon: Lexicon::new(),
            minimized: false,
            hmm_length: 1,
        }
    }

    pub fn add_transition_model(&mut self, model: TransitionModel) -> u16 {
        self.transition_models.push(model);
        (self.transition_models.len() - 1) as u16
    }

    pub fn add_state(&mut self, mixture: MixtureId, transition_model: u16) -> StateId {
        self.mixtures.push(mixture);
        self.state_models.push(transition_model);
        self.successors.push(Vec::new());
        (self.mixtures.len() - 1) as StateId
    }

    /// Append a state successor. Successor order is preserved.
    pub fn add_successor(&mut self, from: StateId, to: StateId) -> &mut Self {
        if let Some(list) = self.successors.get_mut(from as usize) {
            list.push(Successor::State(to));
        }
        self
    }

    /// Attach a word-end label to `state`.
    pub fn add_exit(
        &mut self,
        state: StateId,
        pronunciation: Option<PronunciationId>,
        transit_state: StateId,
    ) -> ExitId {
        let id = ExitId(self.exits.len() as u32);
        self.exits.push(Exit {
            pronunciation,
            transit_state,
        });
        if let Some(list) = self.successors.get_mut(state as usize) {
            list.push(Successor::Label(id));
        }
        id
    }

    pub fn set_root_state(&mut self, state: StateId) -> &mut Self {
        self.root_state = state;
        self
    }

    pub fn set_ci_root_state(&mut self, state: StateId) -> &mut Self {
        self.ci_root_state = state;
        self
    }

    /// Register a root-like state entered under `coarticulation`. Unpushed
    /// roots are not reached through pushed word-end labels.
    pub fn add_coarticulated_root(
        &mut self,
        state: StateId,
        coarticulation: Coarticulation,
        unpushed: bool,
    ) -> &mut Self {
        self.coarticulated_root_states.insert(state);
        if unpushed {
            self.unpushed_coarticulated_root_states.insert(state);
        }
        self.root_transit_descriptions.insert(state, coarticulation);
        self
    }

    /// Describe the coarticulation a plain root-like state stands for.
    pub fn set_root_transit_description(
        &mut self,
        state: StateId,
        coarticulation: Coarticulation,
    ) -> &mut Self {
        self.root_transit_descriptions.insert(state, coarticulation);
        self
    }

    /// States that may close a sentence without a coarticulated successor.
    pub fn add_uncoarticulated_word_end_state(&mut self, state: StateId) -> &mut Self {
        self.uncoarticulated_word_end_states.insert(state);
        self
    }

    pub fn set_minimized(&mut self, minimized: bool) -> &mut Self {
        self.minimized = minimized;
        self
    }

    pub fn set_hmm_length(&mut self, hmm_length: u32) -> &mut Self {
        self.hmm_length = hmm_length;
        self
    }

    pub fn lexicon_mut(&mut self) -> &mut Lexicon {
        &mut self.lexicon
    }

    pub fn set_lexicon(&mut self, lexicon: Lexicon) -> &mut Self {
        self.lexicon = lexicon;
        self
    }

    fn check_state(&self, state: StateId, what: &str) -> Result<()> {
        if state == INVALID_STATE || state as usize >= self.mixtures.len() {
            return Err(DecoderError::InvalidNetwork(format!(
                "{} refers to unknown state {}",
                what, state
            )));
        }
        Ok(())
    }

    /// Validate ids and freeze the graph.
    pub fn build(self) -> Result<SearchNetwork> {
        self.check_state(self.root_state, "root state")?;
        if self.ci_root_state != INVALID_STATE {
            self.check_state(self.ci_root_state, "context independent root")?;
        }
        if self.transition_models.is_empty() {
            return Err(DecoderError::InvalidNetwork(
                "no transition models".to_string(),
            ));
        }
        if self.hmm_length == 0 {
            return Err(DecoderError::InvalidNetwork(
                "hmm length must be positive".to_string(),
            ));
        }

        for (state, model) in self.state_models.iter().enumerate().skip(1) {
            if *model as usize >= self.transition_models.len() {
                return Err(DecoderError::InvalidNetwork(format!(
                    "state {} uses unknown transition model {}",
                    state, model
                )));
            }
        }

        for (state, list) in self.successors.iter().enumerate().skip(1) {
            for successor in list {
                match successor {
                    Successor::State(to) => {
                        self.check_state(*to, &format!("successor of state {}", state))?
                    }
                    Successor::Label(exit) => {
                        if exit.index() >= self.exits.len() {
                            return Err(DecoderError::InvalidNetwork(format!(
                                "state {} refers to unknown {}",
                                state, exit
                            )));
                        }
                    }
                }
            }
        }

        for (index, exit) in self.exits.iter().enumerate() {
            self.check_state(exit.transit_state, &format!("transit of exit#{}", index))?;
            if let Some(pron) = exit.pronunciation {
                if pron.index() >= self.lexicon.num_pronunciations() {
                    return Err(DecoderError::InvalidNetwork(format!(
                        "exit#{} refers to unknown {}",
                        index, pron
                    )));
                }
            }
        }

        for state in self
            .coarticulated_root_states
            .iter()
            .chain(self.root_transit_descriptions.keys())
            .chain(self.uncoarticulated_word_end_states.iter())
        {
            self.check_state(*state, "root description")?;
        }

        let mut offsets = Vec::with_capacity(self.successors.len() + 1);
        let mut flat = Vec::with_capacity(self.successors.iter().map(Vec::len).sum());
        offsets.push(0u32);
        for list in &self.successors {
            flat.extend_from_slice(list);
            offsets.push(flat.len() as u32);
        }

        debug!(
            "Built search network with {} states, {} exits, {} transition models",
            self.mixtures.len() - 1,
            self.exits.len(),
            self.transition_models.len()
        );

        Ok(SearchNetwork {
            mixtures: self.mixtures,
            state_models: self.state_models,
            offsets,
            successors: flat,
            transition_models: self.transition_models,
            exits: self.exits,
            root_state: self.root_state,
            ci_root_state: self.ci_root_state,
            coarticulated_root_states: self.coarticulated_root_states,
            unpushed_coarticulated_root_states: self.unpushed_coarticulated_root_states,
            root_transit_descriptions: self.root_transit_descriptions,
            uncoarticulated_word_end_states: self.uncoarticulated_word_end_states,
            lexicon: self.lexicon,
            minimized: self.minimized,
            hmm_length: self.hmm_length,
        })
    }
}
