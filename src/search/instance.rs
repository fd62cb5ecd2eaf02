//! Tree instances.
//!
//! One instance holds all state hypotheses that share a language model
//! context. Instances live in an arena; back-off links between a full-order
//! instance and its reduced-order sibling are arena ids that are cleared on
//! both ends before either side is freed.

use std::sync::Arc;

use rustc_hash::FxHashMap;

use super::hypothesis::{StateHypothesis, StateRange};
use crate::lm::{add_lemma_score, ContextLookahead, LanguageModel};
use crate::network::Lexicon;
use crate::types::{History, InstanceId, LemmaId, PronunciationId, Score, TraceId};

/// Identity of an instance in the key map.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct InstanceKey {
    pub history: History,
    /// Last word, when instances are conditioned on it.
    pub predecessor: Option<LemmaId>,
}

impl InstanceKey {
    pub fn new(history: History, predecessor: Option<LemmaId>) -> Self {
        Self {
            history,
            predecessor,
        }
    }
}

#[derive(Debug)]
pub struct Instance {
    pub key: InstanceKey,
    pub lookahead_history: History,
    pub states: StateRange,
    /// Word-initial entries not yet expanded.
    pub root_hypotheses: Vec<StateHypothesis>,
    pub lookahead: Option<Arc<ContextLookahead>>,
    pub back_off_parent: Option<InstanceId>,
    pub back_off_child: Option<InstanceId>,
    /// Scaled cost of backing off into the child.
    pub back_off_score: Score,
    /// Back-off cost accumulated from the full-order ancestor.
    pub total_back_off_offset: Score,
    /// Expanded hypotheses moved here from the parent this frame.
    pub transfer: Vec<StateHypothesis>,
    /// Consecutive frames without hypotheses.
    pub inactive: u32,
    lm_scores: FxHashMap<PronunciationId, Score>,
}

impl Instance {
    pub fn new(key: InstanceKey, lookahead_history: History) -> Self {
        Self {
            key,
            lookahead_history,
            states: StateRange::default(),
            root_hypotheses: Vec::new(),
            lookahead: None,
            back_off_parent: None,
            back_off_child: None,
            back_off_score: 0.0,
            total_back_off_offset: 0.0,
            transfer: Vec::new(),
            inactive: 0,
            lm_scores: FxHashMap::default(),
        }
    }

    /// Add a word-initial hypothesis, recombining with an existing entry in
    /// the same state.
    pub fn enter(&mut self, trace: TraceId, state: u32, score: Score) {
        match self.root_hypotheses.iter_mut().find(|h| h.state == state) {
            Some(existing) => {
                if score < existing.score {
                    *existing = StateHypothesis::new(state, score, trace);
                }
            }
            None => self
                .root_hypotheses
                .push(StateHypothesis::new(state, score, trace)),
        }
    }

    /// Only instances without pending entries may be deleted.
    pub fn may_deactivate(&self) -> bool {
        self.root_hypotheses.is_empty() && self.transfer.is_empty()
    }

    /// Scaled LM plus pronunciation score of `pronunciation` in this
    /// instance's history, memoized.
    pub fn lm_score(
        &mut self,
        pronunciation: PronunciationId,
        lm: &dyn LanguageModel,
        lexicon: &Lexicon,
        pronunciation_scale: f64,
    ) -> Score {
        if let Some(score) = self.lm_scores.get(&pronunciation) {
            return *score;
        }
        let mut history = self.key.history;
        let tokens = lexicon
            .lemma_of(pronunciation)
            .map(|lemma| lemma.tokens.as_slice())
            .unwrap_or_default();
        let score = add_lemma_score(lm, tokens, &mut history)
            + lexicon
                .pronunciation(pronunciation)
                .map_or(0.0, |p| pronunciation_scale * p.score);
        self.lm_scores.insert(pronunciation, score);
        score
    }
}

/// Arena of instances with the key map and the ordered active list.
#[derive(Debug, Default)]
pub struct InstanceSet {
    slots: Vec<Option<Instance>>,
    free: Vec<u32>,
    active: Vec<InstanceId>,
    keys: FxHashMap<InstanceKey, InstanceId>,
}

impl InstanceSet {
    pub fn new() -> Self {
        Self::default()
    }

    fn allocate(&mut self, instance: Instance) -> InstanceId {
        let id = match self.free.pop() {
            Some(slot) => {
                self.slots[slot as usize] = Some(instance);
                InstanceId(slot)
            }
            None => {
                self.slots.push(Some(instance));
                InstanceId((self.slots.len() - 1) as u32)
            }
        };
        self.active.push(id);
        id
    }

    /// The instance for `key`, created with `lookahead_history` when missing
    /// and `create` is set.
    pub fn instance_for_key(
        &mut self,
        create: bool,
        key: InstanceKey,
        lookahead_history: History,
    ) -> Option<InstanceId> {
        if let Some(id) = self.keys.get(&key) {
            return Some(*id);
        }
        if !create {
            return None;
        }
        let id = self.allocate(Instance::new(key, lookahead_history));
        self.keys.insert(key, id);
        Some(id)
    }

    /// Create the back-off child of `parent`. The child shares the key but
    /// is not registered in the key map.
    pub fn create_back_off(
        &mut self,
        parent: InstanceId,
        lookahead_history: History,
        back_off_score: Score,
    ) -> InstanceId {
        let (key, total) = {
            let p = self.get_mut(parent);
            debug_assert!(p.back_off_child.is_none());
            p.back_off_score = back_off_score;
            (p.key, p.total_back_off_offset + back_off_score)
        };
        let mut child = Instance::new(key, lookahead_history);
        child.back_off_parent = Some(parent);
        child.total_back_off_offset = total;
        let id = self.allocate(child);
        self.get_mut(parent).back_off_child = Some(id);
        id
    }

    pub fn get(&self, id: InstanceId) -> &Instance {
        match self.slots.get(id.index()).and_then(Option::as_ref) {
            Some(instance) => instance,
            None => panic!("stale instance id {}", id),
        }
    }

    pub fn get_mut(&mut self, id: InstanceId) -> &mut Instance {
        match self.slots.get_mut(id.index()).and_then(Option::as_mut) {
            Some(instance) => instance,
            None => panic!("stale instance id {}", id),
        }
    }

    pub fn find(&self, key: &InstanceKey) -> Option<InstanceId> {
        self.keys.get(key).copied()
    }

    /// Active instances in processing order.
    pub fn active(&self) -> &[InstanceId] {
        &self.active
    }

    pub fn active_len(&self) -> usize {
        self.active.len()
    }

    pub fn set_active(&mut self, active: Vec<InstanceId>) {
        self.active = active;
    }

    pub fn take_active(&mut self) -> Vec<InstanceId> {
        std::mem::take(&mut self.active)
    }

    pub fn iter_active(&self) -> impl Iterator<Item = &Instance> + '_ {
        self.active.iter().map(move |id| self.get(*id))
    }

    /// Delete `id` once it has been empty for `latency` frames. `count_frame`
    /// advances the empty-frame counter. Returns `true` when the instance was
    /// deleted; the caller removes it from the active list.
    pub fn eventually_deactivate(&mut self, id: InstanceId, latency: u32, count_frame: bool) -> bool {
        let instance = self.get_mut(id);
        if !instance.may_deactivate() {
            return false;
        }
        if !instance.states.is_empty() {
            instance.inactive = 0;
            return false;
        }
        if instance.inactive < latency {
            if count_frame {
                instance.inactive += 1;
            }
            return false;
        }
        self.delete(id);
        true
    }

    /// Free `id`, severing its back-off links first.
    pub fn delete(&mut self, id: InstanceId) {
        let (key, parent, child) = {
            let instance = self.get_mut(id);
            (
                instance.key,
                instance.back_off_parent.take(),
                instance.back_off_child.take(),
            )
        };
        if let Some(parent) = parent {
            let p = self.get_mut(parent);
            if p.back_off_child == Some(id) {
                p.back_off_child = None;
            }
        }
        if let Some(child) = child {
            let c = self.get_mut(child);
            if c.back_off_parent == Some(id) {
                c.back_off_parent = None;
            }
        }
        if self.keys.get(&key) == Some(&id) {
            self.keys.remove(&key);
        }
        self.slots[id.index()] = None;
        self.free.push(id.value());
    }

    /// Number of states along the whole back-off chain of `id`.
    pub fn back_off_chain_states(&self, id: InstanceId) -> usize {
        let mut total = self.get(id).states.len();
        let mut up = self.get(id).back_off_parent;
        while let Some(parent) = up {
            total += self.get(parent).states.len();
            up = self.get(parent).back_off_parent;
        }
        let mut down = self.get(id).back_off_child;
        while let Some(child) = down {
            total += self.get(child).states.len();
            down = self.get(child).back_off_child;
        }
        total
    }

    /// Back-off links point at live instances and are symmetric.
    pub fn check_links(&self) -> bool {
        self.active.iter().all(|id| {
            let instance = self.get(*id);
            let parent_ok = instance.back_off_parent.map_or(true, |p| {
                self.slots
                    .get(p.index())
                    .and_then(Option::as_ref)
                    .is_some_and(|p| p.back_off_child == Some(*id))
            });
            let child_ok = instance.back_off_child.map_or(true, |c| {
                self.slots
                    .get(c.index())
                    .and_then(Option::as_ref)
                    .is_some_and(|c| c.back_off_parent == Some(*id))
            });
            parent_ok && child_ok
        })
    }

    pub fn clear(&mut self) {
        for slot in self.slots.iter_mut().flatten() {
            slot.back_off_parent = None;
            slot.back_off_child = None;
        }
        self.slots.clear();
        self.free.clear();
        self.active.clear();
        self.keys.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn key(h: u32) -> InstanceKey {
        InstanceKey::new(History(h), None)
    }

    #[test]
    fn test_one_instance_per_key() {
        let mut set = InstanceSet::new();
        assert!(set.instance_for_key(false, key(1), History(1)).is_none());
        let a = set.instance_for_key(true, key(1), History(1)).unwrap();
        let b = set.instance_for_key(true, key(1), History(7)).unwrap();
        assert_eq!(a, b);
        assert_eq!(set.active_len(), 1);
        assert_eq!(set.get(a).lookahead_history, History(1));
    }

    #[test]
    fn test_deactivation_latency() {
        let mut set = InstanceSet::new();
        let id = set.instance_for_key(true, key(1), History(1)).unwrap();
        for _ in 0..3 {
            assert!(!set.eventually_deactivate(id, 3, true));
        }
        // a hypothesis resets the counter
        set.get_mut(id).states = StateRange::new(0, 1);
        assert!(!set.eventually_deactivate(id, 3, true));
        assert_eq!(set.get(id).inactive, 0);

        set.get_mut(id).states = StateRange::default();
        for _ in 0..3 {
            assert!(!set.eventually_deactivate(id, 3, true));
        }
        assert!(set.eventually_deactivate(id, 3, true));
        assert!(set.find(&key(1)).is_none());
    }

    #[test]
    fn test_pending_roots_block_deactivation() {
        let mut set = InstanceSet::new();
        let id = set.instance_for_key(true, key(1), History(1)).unwrap();
        set.get_mut(id).enter(TraceId(0), 5, 1.0);
        assert!(!set.eventually_deactivate(id, 0, true));
    }

    #[test]
    fn test_back_off_links_severed_on_delete() {
        let mut set = InstanceSet::new();
        let parent = set.instance_for_key(true, key(1), History(2)).unwrap();
        let child = set.create_back_off(parent, History(1), 0.5);
        assert_eq!(set.get(child).total_back_off_offset, 0.5);
        assert_eq!(set.get(child).key, set.get(parent).key);
        assert!(set.check_links());

        set.get_mut(child).states = StateRange::new(0, 3);
        assert_eq!(set.back_off_chain_states(parent), 3);

        set.delete(parent);
        set.set_active(vec![child]);
        assert!(set.get(child).back_off_parent.is_none());
        assert!(set.check_links());
        // the key map never pointed at the child
        assert!(set.find(&key(1)).is_none());
    }

    #[test]
    fn test_enter_recombines_root_hypotheses() {
        let mut instance = Instance::new(key(1), History(1));
        instance.enter(TraceId(0), 3, 2.0);
        instance.enter(TraceId(1), 3, 1.0);
        instance.enter(TraceId(2), 3, 1.5);
        instance.enter(TraceId(3), 4, 9.0);
        assert_eq!(instance.root_hypotheses.len(), 2);
        assert_eq!(instance.root_hypotheses[0].trace, TraceId(1));
    }

    #[test]
    fn test_slots_are_reused() {
        let mut set = InstanceSet::new();
        let a = set.instance_for_key(true, key(1), History(1)).unwrap();
        set.take_active();
        set.delete(a);
        let b = set.instance_for_key(true, key(2), History(2)).unwrap();
        assert_eq!(a, b);
    }
}
