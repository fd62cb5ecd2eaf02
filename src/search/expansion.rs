//! HMM expansion.
//!
//! Hypotheses of one instance are expanded into a contiguous window of the
//! new hypothesis vector. A per-state index into that window recombines
//! hypotheses reaching the same state; an index outside the window, or
//! pointing at a hypothesis of a different state, is stale.

use tracing::trace;

use super::hypothesis::{StateHypothesis, StateRange};
use super::SearchSpace;
use crate::network::{ForwardBatch, NetworkLayout, SearchNetwork, SkipBatch};
use crate::types::{InstanceId, Score, StateId};

pub(crate) struct Expansion<'a> {
    network: &'a SearchNetwork,
    layout: &'a NetworkLayout,
    hypotheses: &'a mut Vec<StateHypothesis>,
    recombination: &'a mut [u32],
    window_begin: u32,
    allow_skips: bool,
}

impl<'a> Expansion<'a> {
    pub fn new(
        network: &'a SearchNetwork,
        layout: &'a NetworkLayout,
        hypotheses: &'a mut Vec<StateHypothesis>,
        recombination: &'a mut [u32],
        allow_skips: bool,
    ) -> Self {
        let window_begin = hypotheses.len() as u32;
        Self {
            network,
            layout,
            hypotheses,
            recombination,
            window_begin,
            allow_skips,
        }
    }

    /// Enter `state` with `score` from `source`, keeping the better of two
    /// hypotheses in the same state. Ties keep the earlier one.
    pub fn activate_or_update(&mut self, source: &StateHypothesis, state: StateId, score: Score) {
        let slot = self.recombination[state as usize];
        let len = self.hypotheses.len() as u32;
        if slot < self.window_begin || slot >= len || self.hypotheses[slot as usize].state != state
        {
            self.recombination[state as usize] = len;
            self.hypotheses
                .push(StateHypothesis::new(state, score, source.trace));
            return;
        }
        let existing = &mut self.hypotheses[slot as usize];
        if score < existing.score {
            existing.score = score;
            existing.prospect = score;
            existing.trace = source.trace;
        }
    }

    /// Copy a hypothesis into the window without a transition.
    pub fn activate_directly(&mut self, hypothesis: &StateHypothesis) {
        self.activate_or_update(hypothesis, hypothesis.state, hypothesis.score);
    }

    pub fn expand_state(&mut self, hyp: &StateHypothesis) {
        let tm = *self.network.transition_model(hyp.state);
        if tm.loop_penalty.is_finite() {
            self.activate_or_update(hyp, hyp.state, hyp.score + tm.loop_penalty);
        }

        match self.layout.forward(hyp.state) {
            ForwardBatch::None => {}
            ForwardBatch::Single(successor) => {
                if tm.forward.is_finite() {
                    self.activate_or_update(hyp, successor, hyp.score + tm.forward);
                }
            }
            ForwardBatch::Range(begin, end) => {
                if tm.forward.is_finite() {
                    for successor in begin..end {
                        self.activate_or_update(hyp, successor, hyp.score + tm.forward);
                    }
                }
            }
            ForwardBatch::Irregular => {
                self.expand_state_slow(hyp, true, self.allow_skips);
                return;
            }
        }

        if self.allow_skips {
            match self.layout.skip(hyp.state) {
                SkipBatch::None => {}
                SkipBatch::Range(begin, end) => {
                    if tm.skip.is_finite() {
                        for target in begin..end {
                            self.activate_or_update(hyp, target, hyp.score + tm.skip);
                        }
                    }
                }
                SkipBatch::Irregular => self.expand_state_slow(hyp, false, true),
            }
        }
    }

    /// Walk the network successors of `hyp`. Forward edges are taken when
    /// `forward` is set, two-hop edges when `skip` is set.
    pub fn expand_state_slow(&mut self, hyp: &StateHypothesis, forward: bool, skip: bool) {
        let tm = *self.network.transition_model(hyp.state);
        let mut skip = skip && tm.skip.is_finite();
        if skip {
            match self.layout.skip(hyp.state) {
                SkipBatch::None => skip = false,
                SkipBatch::Range(begin, end) => {
                    for target in begin..end {
                        self.activate_or_update(hyp, target, hyp.score + tm.skip);
                    }
                    skip = false;
                }
                SkipBatch::Irregular => {}
            }
        }
        let forward = forward && tm.forward.is_finite();
        if !forward && !skip {
            return;
        }

        let network = self.network;
        for successor in network.state_successors(hyp.state) {
            if forward {
                self.activate_or_update(hyp, successor, hyp.score + tm.forward);
            }
            if skip {
                for target in network.state_successors(successor) {
                    self.activate_or_update(hyp, target, hyp.score + tm.skip);
                }
            }
        }
    }

    pub fn end(&self) -> u32 {
        self.hypotheses.len() as u32
    }
}

impl SearchSpace {
    /// Expand every active instance into the next frame and apply look-ahead.
    pub fn expand_hmm(&mut self) {
        self.best_prospect = Score::INFINITY;
        self.new_state_hypotheses.clear();
        let allow_skips = self.config.allow_skips;

        // back-off instances created below are appended and processed too
        let mut index = 0;
        while index < self.instances.active_len() {
            let id = self.instances.active()[index];
            index += 1;

            let (old, roots, transfer) = {
                let instance = self.instances.get_mut(id);
                (
                    instance.states,
                    std::mem::take(&mut instance.root_hypotheses),
                    std::mem::take(&mut instance.transfer),
                )
            };
            self.statistics.root_hypotheses += roots.len() as u64;
            self.statistics.transferred_hypotheses += transfer.len() as u64;

            let begin = self.new_state_hypotheses.len() as u32;
            {
                let mut expansion = Expansion::new(
                    &self.network,
                    &self.layout,
                    &mut self.new_state_hypotheses,
                    &mut self.recombination,
                    allow_skips,
                );
                for hyp in &roots {
                    expansion.expand_state(hyp);
                }
            }

            if self.config.early_back_off && !roots.is_empty() {
                self.pass_roots_to_back_off(id, roots);
            }

            let end = {
                let mut expansion = Expansion::new(
                    &self.network,
                    &self.layout,
                    &mut self.new_state_hypotheses,
                    &mut self.recombination,
                    allow_skips,
                );
                expansion.window_begin = begin;
                for hyp in &self.state_hypotheses[old.indices()] {
                    expansion.expand_state(hyp);
                }
                for hyp in &transfer {
                    expansion.activate_directly(hyp);
                }
                expansion.end()
            };
            self.instances.get_mut(id).states = StateRange::new(begin, end);

            self.apply_lookahead_in_instance(id);
        }

        std::mem::swap(&mut self.state_hypotheses, &mut self.new_state_hypotheses);
        self.new_state_hypotheses.clear();

        let dominance = self.config.lookahead.dominance_minimum * self.state_hypotheses.len() as f64;
        self.lookahead_state_threshold = self.config.lookahead.state_minimum.max(dominance as u32);
        trace!(
            "Expanded {} instances into {} states",
            self.instances.active_len(),
            self.state_hypotheses.len()
        );
    }

    /// Hand word-initial hypotheses to the back-off instance as well, with
    /// the back-off cost added.
    fn pass_roots_to_back_off(&mut self, id: InstanceId, mut roots: Vec<StateHypothesis>) {
        let Some(child) = self.back_off_instance(id) else {
            return;
        };
        let offset = self.instances.get(id).back_off_score;
        for hyp in &mut roots {
            hyp.score += offset;
            hyp.prospect = hyp.score;
        }
        self.instances.get_mut(child).root_hypotheses.extend(roots);
    }

    /// The back-off instance of `id`, created on demand. `None` when the
    /// look-ahead history is already empty or the model cannot back off.
    pub fn back_off_instance(&mut self, id: InstanceId) -> Option<InstanceId> {
        let instance = self.instances.get(id);
        if let Some(child) = instance.back_off_child {
            return Some(child);
        }
        let history = instance.lookahead_history;
        let lm = self.lookahead_lm.as_back_off()?;
        let length = lm.history_length(history);
        if length == 0 {
            return None;
        }
        let reduced = lm.reduced_history(history, length - 1);
        assert_eq!(
            lm.history_length(reduced),
            length - 1,
            "back-off history must be exactly one token shorter"
        );
        let back_off_score = lm.back_off_score(history) * lm.scale();
        Some(self.instances.create_back_off(id, reduced, back_off_score))
    }
}
