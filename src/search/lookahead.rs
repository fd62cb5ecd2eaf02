//! Look-ahead application after expansion.
//!
//! Every hypothesis gets a prospect: its score plus the LM look-ahead score
//! of its node and the acoustic look-ahead score of its state. Small
//! instances use the shared unigram table; an instance is promoted to its
//! own full-order table once it holds enough states.

use super::hypothesis::StateRange;
use super::SearchSpace;
use crate::types::{InstanceId, Score};

impl SearchSpace {
    /// Compute prospects for the freshly expanded window of `id`.
    pub(crate) fn apply_lookahead_in_instance(&mut self, id: InstanceId) {
        let range = self.instances.get(id).states;
        if range.is_empty() {
            return;
        }
        if self.lm_lookahead.is_none() {
            let use_acoustic = self.acoustic_lookahead.is_enabled();
            for hyp in &mut self.new_state_hypotheses[range.indices()] {
                hyp.prospect = hyp.score;
                if use_acoustic {
                    hyp.prospect += self.acoustic_lookahead.score(hyp.state);
                }
                self.best_prospect = self.best_prospect.min(hyp.prospect);
            }
            return;
        }

        self.activate_lm_lookahead(id, false);
        let mut offset = 0.0;
        if self.instances.get(id).lookahead.is_none() {
            let factor = self.config.lookahead.unigram_back_off_factor;
            if factor != 0.0 {
                if let Some(lm) = self.lookahead_lm.as_back_off() {
                    let history = self.instances.get(id).lookahead_history;
                    offset = lm.accumulated_back_off_score(history, 1) * factor * lm.scale();
                }
            }
            let sparse = self.lm_lookahead.as_ref().is_some_and(|la| la.is_sparse());
            let count = if sparse {
                self.instances.back_off_chain_states(id)
            } else {
                range.len()
            };
            if count as u32 >= self.lookahead_state_threshold
                || self.reaches_full_lookahead_depth(range)
            {
                self.activate_lm_lookahead(id, true);
            }
        }

        let (table, offset) = match self.instances.get(id).lookahead.clone() {
            Some(table) => (table, 0.0),
            None => match self.lm_lookahead.as_ref() {
                Some(la) => (la.unigram(), offset),
                None => return,
            },
        };

        if table.is_sparse() {
            let child = self.back_off_instance(id);
            debug_assert!(child.is_some(), "sparse table without back-off instance");
            let back_off_score = self.instances.get(id).back_off_score;
            let early_back_off = self.config.early_back_off;
            let Some(la) = self.lm_lookahead.as_ref() else {
                return;
            };
            let use_acoustic = self.acoustic_lookahead.is_enabled();
            let mut moved = Vec::new();
            for hyp in &mut self.new_state_hypotheses[range.indices()] {
                match table.score(la.node(hyp.state)) {
                    Some(lm) => {
                        hyp.prospect = hyp.score + lm;
                        if use_acoustic {
                            hyp.prospect += self.acoustic_lookahead.score(hyp.state);
                        }
                        self.best_prospect = self.best_prospect.min(hyp.prospect);
                    }
                    None => {
                        hyp.prospect = Score::INFINITY;
                        if early_back_off {
                            hyp.score = Score::INFINITY;
                        } else if child.is_some() {
                            hyp.score += back_off_score;
                            moved.push(*hyp);
                        }
                    }
                }
            }
            if let Some(child) = child {
                self.instances.get_mut(child).transfer.extend(moved);
            }
        } else {
            let Some(la) = self.lm_lookahead.as_ref() else {
                return;
            };
            let use_acoustic = self.acoustic_lookahead.is_enabled();
            for hyp in &mut self.new_state_hypotheses[range.indices()] {
                hyp.prospect = hyp.score + table.score(la.node(hyp.state)).unwrap_or(0.0) + offset;
                if use_acoustic {
                    hyp.prospect += self.acoustic_lookahead.score(hyp.state);
                }
                self.best_prospect = self.best_prospect.min(hyp.prospect);
            }
        }
    }

    /// Attach the instance's own table. Without `compute` only a cached
    /// table is taken.
    pub(crate) fn activate_lm_lookahead(&mut self, id: InstanceId, compute: bool) {
        let Some(la) = self.lm_lookahead.as_mut() else {
            return;
        };
        let instance = self.instances.get_mut(id);
        if instance.lookahead.is_some() {
            return;
        }
        let history = instance.lookahead_history;
        instance.lookahead = if la.language_model().history_length(history) == 0 {
            Some(la.unigram())
        } else if compute {
            Some(la.lookahead(history))
        } else {
            la.try_lookahead(history)
        };
    }

    /// Whether a hypothesis in `range` is deep enough below the root to
    /// force a full-order table.
    fn reaches_full_lookahead_depth(&self, range: StateRange) -> bool {
        let (Some(depth), Some(la)) = (
            self.config.lookahead.full_lookahead_depth,
            self.lm_lookahead.as_ref(),
        ) else {
            return false;
        };
        let limit = self.depths.depth(self.network.root_state()) + depth;
        self.new_state_hypotheses[range.indices()]
            .iter()
            .any(|hyp| la.node_depth(la.node(hyp.state)) >= limit)
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;
    use crate::config::SearchConfig;
    use crate::lm::{LanguageModel, NGramLm};
    use crate::network::{NetworkBuilder, SearchNetwork, TransitionModel};
    use crate::search::hypothesis::StateHypothesis;
    use crate::search::instance::InstanceKey;
    use crate::types::{MixtureId, TokenId, TraceId};

    // root -> a1 -> a2 (word a), root -> b1 -> b2 (word b), a1 -> c2 (word c)
    fn network() -> SearchNetwork {
        let mut builder = NetworkBuilder::new();
        let tm = builder.add_transition_model(TransitionModel::default());
        let root = builder.add_state(MixtureId(0), tm);
        let a1 = builder.add_state(MixtureId(1), tm);
        let b1 = builder.add_state(MixtureId(2), tm);
        let a2 = builder.add_state(MixtureId(3), tm);
        let c2 = builder.add_state(MixtureId(4), tm);
        let b2 = builder.add_state(MixtureId(5), tm);
        builder.set_root_state(root);
        builder.add_successor(root, a1).add_successor(root, b1);
        builder.add_successor(a1, a2).add_successor(a1, c2).add_successor(b1, b2);
        let mut prons = Vec::new();
        for (i, symbol) in ["a", "b", "c"].iter().enumerate() {
            let lemma = builder
                .lexicon_mut()
                .add_lemma(*symbol, vec![TokenId(i as u32)]);
            prons.push(builder.lexicon_mut().add_pronunciation(lemma, vec![], 0.0));
        }
        builder.add_exit(a2, Some(prons[0]), root);
        builder.add_exit(b2, Some(prons[1]), root);
        builder.add_exit(c2, Some(prons[2]), root);
        builder.build().unwrap()
    }

    fn bigram() -> Arc<dyn LanguageModel> {
        Arc::new(
            NGramLm::builder(2)
                .ngram(&[TokenId(0)], 1.0)
                .ngram(&[TokenId(1)], 2.0)
                .ngram(&[TokenId(2)], 3.0)
                .ngram(&[TokenId(0), TokenId(2)], 0.5)
                .back_off(&[TokenId(0)], 0.7)
                .build()
                .unwrap(),
        )
    }

    /// Space with one instance after word `a` holding hypotheses in a2 and c2.
    fn space(config: SearchConfig) -> (SearchSpace, InstanceId) {
        let lm = bigram();
        let mut space = SearchSpace::new(config, Arc::new(network()), Arc::clone(&lm), None).unwrap();
        let after_a = lm.extended_history(lm.start_history(), TokenId(0));
        let id = space
            .instances
            .instance_for_key(true, InstanceKey::new(after_a, None), after_a)
            .unwrap();
        space.new_state_hypotheses = vec![
            StateHypothesis::new(4, 10.0, TraceId(0)),
            StateHypothesis::new(5, 10.0, TraceId(0)),
        ];
        space.instances.get_mut(id).states = StateRange::new(0, 2);
        (space, id)
    }

    #[test]
    fn test_small_instances_use_unigram() {
        let mut config = SearchConfig::default();
        config.lookahead.state_minimum = 100;
        let (mut space, id) = space(config);
        space.apply_lookahead_in_instance(id);
        assert!(space.instances.get(id).lookahead.is_none());
        assert_eq!(space.new_state_hypotheses[0].prospect, 11.0);
        assert_eq!(space.new_state_hypotheses[1].prospect, 13.0);
        assert_eq!(space.best_prospect, 11.0);
    }

    #[test]
    fn test_promotion_to_full_table() {
        let (mut space, id) = space(SearchConfig::default());
        space.apply_lookahead_in_instance(id);
        assert!(space.instances.get(id).lookahead.is_some());
        assert!((space.new_state_hypotheses[0].prospect - 11.7).abs() < 1e-9);
        assert_eq!(space.new_state_hypotheses[1].prospect, 10.5);
    }

    #[test]
    fn test_deep_states_force_full_table() {
        let mut config = SearchConfig::default();
        config.lookahead.state_minimum = 100;
        config.lookahead.full_lookahead_depth = Some(1);
        let (mut space, id) = space(config);
        space.apply_lookahead_in_instance(id);
        assert!(space.instances.get(id).lookahead.is_some());
    }

    #[test]
    fn test_sparse_miss_moves_to_back_off_instance() {
        let mut config = SearchConfig::default();
        config.lookahead.sparse = true;
        let (mut space, id) = space(config);
        space.apply_lookahead_in_instance(id);

        let a2 = space.new_state_hypotheses[0];
        assert!(a2.prospect.is_infinite());
        assert!((a2.score - 10.7).abs() < 1e-9);
        assert_eq!(space.new_state_hypotheses[1].prospect, 10.5);

        let child = space.instances.get(id).back_off_child.unwrap();
        let transfer = &space.instances.get(child).transfer;
        assert_eq!(transfer.len(), 1);
        assert_eq!(transfer[0].state, 4);
        assert_eq!(space.instances.get(child).total_back_off_offset, 0.7);
        assert!(space.instances.check_links());
    }

    #[test]
    fn test_early_back_off_kills_misses() {
        let mut config = SearchConfig::default();
        config.lookahead.sparse = true;
        config.early_back_off = true;
        let (mut space, id) = space(config);
        space.apply_lookahead_in_instance(id);
        assert!(space.new_state_hypotheses[0].score.is_infinite());
        let child = space.instances.get(id).back_off_child.unwrap();
        assert!(space.instances.get(child).transfer.is_empty());
    }

    #[test]
    fn test_without_lm_lookahead_prospect_is_score() {
        let mut config = SearchConfig::default();
        config.lookahead.enabled = false;
        let (mut space, id) = space(config);
        space.apply_lookahead_in_instance(id);
        assert_eq!(space.new_state_hypotheses[1].prospect, 10.0);
    }
}
