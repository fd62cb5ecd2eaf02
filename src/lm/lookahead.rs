//! Language model look-ahead tables.
//!
//! States that reach the same set of word ends share a look-ahead node. A
//! table maps every node to the cheapest LM cost of any word reachable from
//! it, given one history. Dense tables cover every node, sparse tables only
//! the nodes whose words have an explicit n-gram in the history.

use std::collections::VecDeque;
use std::sync::Arc;

use rustc_hash::FxHashMap;
use tracing::{debug, info, warn};

use super::{add_lemma_score, LanguageModel};
use crate::config::LookaheadConfig;
use crate::network::{SearchNetwork, StateDepths};
use crate::observability::metrics;
use crate::types::{History, PronunciationId, Score, StateId, TokenId, INVALID_STATE};

/// Look-ahead scores for one history.
#[derive(Debug, Clone, PartialEq)]
pub enum ContextLookahead {
    Dense(Vec<Score>),
    Sparse(FxHashMap<u32, Score>),
}

impl ContextLookahead {
    /// Score of `node`, `None` on a sparse miss.
    pub fn score(&self, node: u32) -> Option<Score> {
        match self {
            ContextLookahead::Dense(scores) => scores.get(node as usize).copied(),
            ContextLookahead::Sparse(scores) => scores.get(&node).copied(),
        }
    }

    pub fn is_sparse(&self) -> bool {
        matches!(self, ContextLookahead::Sparse(_))
    }

    pub fn len(&self) -> usize {
        match self {
            ContextLookahead::Dense(scores) => scores.len(),
            ContextLookahead::Sparse(scores) => scores.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LookaheadStats {
    pub cache_hits: u64,
    pub cache_misses: u64,
    pub dense_tables: u64,
    pub sparse_tables: u64,
    pub evictions: u64,
}

pub struct LanguageModelLookahead {
    lm: Arc<dyn LanguageModel>,
    state_nodes: Vec<u32>,
    node_depths: Vec<u32>,
    node_pronunciations: Vec<Vec<PronunciationId>>,
    pronunciation_tokens: Vec<Vec<TokenId>>,
    pronunciation_scores: Vec<Score>,
    unigram: Arc<ContextLookahead>,
    cache: FxHashMap<History, Arc<ContextLookahead>>,
    insertion_order: VecDeque<History>,
    cache_size: usize,
    sparse: bool,
    history_limit: Option<usize>,
    stats: LookaheadStats,
}

/// Reachable word-end sets per state, interned.
struct NodeBuilder<'a> {
    network: &'a SearchNetwork,
    state_sets: Vec<Option<u32>>,
    sets: Vec<Vec<PronunciationId>>,
    set_ids: FxHashMap<Vec<PronunciationId>, u32>,
    on_path: Vec<bool>,
}

impl<'a> NodeBuilder<'a> {
    fn intern(&mut self, set: Vec<PronunciationId>) -> u32 {
        if let Some(id) = self.set_ids.get(&set) {
            return *id;
        }
        let id = self.sets.len() as u32;
        self.set_ids.insert(set.clone(), id);
        self.sets.push(set);
        id
    }

    fn reachable(&mut self, state: StateId) -> u32 {
        let s = state as usize;
        if let Some(id) = self.state_sets[s] {
            return id;
        }
        if self.on_path[s] {
            return self.intern(Vec::new());
        }
        self.on_path[s] = true;

        let mut set: Vec<PronunciationId> = self
            .network
            .labels(state)
            .filter_map(|exit| self.network.exit(exit).pronunciation)
            .collect();
        let successors: Vec<StateId> = self.network.state_successors(state).collect();
        for successor in successors {
            let id = self.reachable(successor);
            set.extend_from_slice(&self.sets[id as usize]);
        }
        set.sort_unstable();
        set.dedup();

        self.on_path[s] = false;
        let id = self.intern(set);
        self.state_sets[s] = Some(id);
        id
    }
}

impl LanguageModelLookahead {
    pub fn new(
        network: &SearchNetwork,
        depths: &StateDepths,
        lm: Arc<dyn LanguageModel>,
        config: &LookaheadConfig,
        pronunciation_scale: f64,
    ) -> Self {
        let count = network.state_count();
        let mut builder = NodeBuilder {
            network,
            state_sets: vec![None; count],
            sets: Vec::new(),
            set_ids: FxHashMap::default(),
            on_path: vec![false; count],
        };
        for state in 1..count as StateId {
            builder.reachable(state);
        }

        // breadth-first numbering from the roots
        let mut seeds = vec![network.root_state()];
        if network.ci_root_state() != INVALID_STATE {
            seeds.push(network.ci_root_state());
        }
        let mut coarticulated: Vec<StateId> =
            network.coarticulated_root_states().iter().copied().collect();
        coarticulated.sort_unstable();
        seeds.extend(coarticulated);
        seeds.extend(1..count as StateId);

        let mut renumber: Vec<Option<u32>> = vec![None; builder.sets.len()];
        let mut node_pronunciations = Vec::new();
        let mut node_depths: Vec<u32> = Vec::new();
        let mut state_nodes = vec![0u32; count];
        let mut visited = vec![false; count];
        let mut queue = VecDeque::new();
        for seed in seeds {
            if visited[seed as usize] {
                continue;
            }
            visited[seed as usize] = true;
            queue.push_back(seed);
            while let Some(state) = queue.pop_front() {
                let set = builder.state_sets[state as usize].unwrap_or(0) as usize;
                let node = match renumber[set] {
                    Some(node) => node,
                    None => {
                        let node = node_pronunciations.len() as u32;
                        renumber[set] = Some(node);
                        node_pronunciations.push(std::mem::take(&mut builder.sets[set]));
                        node_depths.push(u32::MAX);
                        node
                    }
                };
                state_nodes[state as usize] = node;
                let depth = &mut node_depths[node as usize];
                *depth = (*depth).min(depths.depth(state));

                for successor in network.state_successors(state) {
                    if !visited[successor as usize] {
                        visited[successor as usize] = true;
                        queue.push_back(successor);
                    }
                }
            }
        }

        let lexicon = network.lexicon();
        let (pronunciation_tokens, pronunciation_scores) = (0..lexicon.num_pronunciations())
            .map(|p| {
                let id = PronunciationId(p as u32);
                let tokens = lexicon
                    .lemma_of(id)
                    .map(|lemma| lemma.tokens.clone())
                    .unwrap_or_default();
                let score = lexicon
                    .pronunciation(id)
                    .map_or(0.0, |pron| pronunciation_scale * pron.score);
                (tokens, score)
            })
            .unzip();

        let mut sparse = config.sparse;
        if sparse && lm.as_back_off().is_none() {
            warn!("Sparse look-ahead requires a back-off language model, using dense tables");
            sparse = false;
        }

        let mut lookahead = Self {
            lm,
            state_nodes,
            node_depths,
            node_pronunciations,
            pronunciation_tokens,
            pronunciation_scores,
            unigram: Arc::new(ContextLookahead::Dense(Vec::new())),
            cache: FxHashMap::default(),
            insertion_order: VecDeque::new(),
            cache_size: config.cache_size.max(1),
            sparse,
            history_limit: config.history_limit,
            stats: LookaheadStats::default(),
        };

        let unigram = if config.disable_unigram_lookahead {
            ContextLookahead::Dense(vec![0.0; lookahead.num_nodes()])
        } else {
            let empty = lookahead
                .lm
                .reduced_history(lookahead.lm.start_history(), 0);
            lookahead.compute_dense(empty)
        };
        lookahead.unigram = Arc::new(unigram);

        info!(
            "Language model look-ahead: {} nodes for {} states, sparse {}",
            lookahead.num_nodes(),
            count - 1,
            lookahead.sparse
        );
        lookahead
    }

    pub fn num_nodes(&self) -> usize {
        self.node_pronunciations.len()
    }

    pub fn node(&self, state: StateId) -> u32 {
        self.state_nodes[state as usize]
    }

    /// Minimum network depth of the states in `node`.
    pub fn node_depth(&self, node: u32) -> u32 {
        self.node_depths[node as usize]
    }

    pub fn node_pronunciations(&self, node: u32) -> &[PronunciationId] {
        &self.node_pronunciations[node as usize]
    }

    pub fn is_sparse(&self) -> bool {
        self.sparse
    }

    pub fn language_model(&self) -> &Arc<dyn LanguageModel> {
        &self.lm
    }

    /// Zero-order table, always dense.
    pub fn unigram(&self) -> Arc<ContextLookahead> {
        Arc::clone(&self.unigram)
    }

    /// `history` reduced to the configured look-ahead order.
    pub fn reduced_history(&self, history: History) -> History {
        match self.history_limit {
            Some(limit) => self.lm.reduced_history(history, limit),
            None => history,
        }
    }

    /// Cached table for `history`, without computing one.
    pub fn try_lookahead(&mut self, history: History) -> Option<Arc<ContextLookahead>> {
        let table = self.cache.get(&history).cloned();
        if table.is_some() {
            self.stats.cache_hits += 1;
            metrics::record_lookahead_cache(true);
        }
        table
    }

    /// Table for `history`, computed and cached on a miss. Sparse when
    /// enabled and the history is not empty.
    pub fn lookahead(&mut self, history: History) -> Arc<ContextLookahead> {
        if let Some(table) = self.try_lookahead(history) {
            return table;
        }
        self.stats.cache_misses += 1;
        metrics::record_lookahead_cache(false);

        let sparse = self.sparse && self.lm.history_length(history) > 0;
        let table = Arc::new(if sparse {
            self.compute_sparse(history)
        } else {
            self.compute_dense(history)
        });
        metrics::record_lookahead_table(sparse);
        if sparse {
            self.stats.sparse_tables += 1;
        } else {
            self.stats.dense_tables += 1;
        }

        self.evict();
        self.cache.insert(history, Arc::clone(&table));
        self.insertion_order.push_back(history);
        table
    }

    /// Evict the oldest tables nobody but the cache holds.
    fn evict(&mut self) {
        if self.cache.len() < self.cache_size {
            return;
        }
        let mut kept = VecDeque::with_capacity(self.insertion_order.len());
        while let Some(history) = self.insertion_order.pop_front() {
            let unreferenced = self
                .cache
                .get(&history)
                .is_some_and(|table| Arc::strong_count(table) == 1);
            if unreferenced && self.cache.len() >= self.cache_size {
                self.cache.remove(&history);
                self.stats.evictions += 1;
            } else {
                kept.push_back(history);
            }
        }
        self.insertion_order = kept;
        if self.cache.len() >= self.cache_size {
            debug!(
                "Look-ahead cache over capacity, {} tables still referenced",
                self.cache.len()
            );
        }
    }

    pub fn clear_cache(&mut self) {
        self.cache.clear();
        self.insertion_order.clear();
    }

    pub fn cached_tables(&self) -> usize {
        self.cache.len()
    }

    pub fn stats(&self) -> &LookaheadStats {
        &self.stats
    }

    fn pronunciation_score(&self, history: History, pronunciation: PronunciationId) -> Score {
        let mut h = history;
        let tokens = &self.pronunciation_tokens[pronunciation.index()];
        add_lemma_score(self.lm.as_ref(), tokens, &mut h)
            + self.pronunciation_scores[pronunciation.index()]
    }

    fn compute_dense(&self, history: History) -> ContextLookahead {
        let scores: Vec<Score> = (0..self.pronunciation_tokens.len())
            .map(|p| self.pronunciation_score(history, PronunciationId(p as u32)))
            .collect();
        ContextLookahead::Dense(
            self.node_pronunciations
                .iter()
                .map(|prons| {
                    prons
                        .iter()
                        .map(|p| scores[p.index()])
                        .fold(None, |best: Option<Score>, s| Some(best.map_or(s, |b| b.min(s))))
                        .unwrap_or(0.0)
                })
                .collect(),
        )
    }

    fn compute_sparse(&self, history: History) -> ContextLookahead {
        let Some(back_off) = self.lm.as_back_off() else {
            return self.compute_dense(history);
        };
        let explicit: FxHashMap<PronunciationId, Score> = (0..self.pronunciation_tokens.len())
            .map(|p| PronunciationId(p as u32))
            .filter(|p| {
                self.pronunciation_tokens[p.index()]
                    .first()
                    .is_some_and(|token| back_off.has_explicit_ngram(history, *token))
            })
            .map(|p| (p, self.pronunciation_score(history, p)))
            .collect();

        let mut scores = FxHashMap::default();
        for (node, prons) in self.node_pronunciations.iter().enumerate() {
            let best = prons
                .iter()
                .filter_map(|p| explicit.get(p))
                .fold(None, |best: Option<Score>, s| Some(best.map_or(*s, |b| b.min(*s))));
            if let Some(score) = best {
                scores.insert(node as u32, score);
            }
        }
        ContextLookahead::Sparse(scores)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::lm::NGramLm;
    use crate::network::{NetworkBuilder, TransitionModel};
    use crate::types::MixtureId;

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

    fn lookahead(config: &LookaheadConfig) -> LanguageModelLookahead {
        let network = network();
        let depths = StateDepths::build(&network).unwrap();
        LanguageModelLookahead::new(&network, &depths, bigram(), config, 1.0)
    }

    #[test]
    fn test_nodes_in_breadth_first_order() {
        let la = lookahead(&LookaheadConfig::default());
        // {a,b,c} root, {a,c} a1, {b} b1 and b2, {a} a2, {c} c2
        assert_eq!(la.num_nodes(), 5);
        assert_eq!(la.node(1), 0);
        assert_eq!(la.node(2), 1);
        assert_eq!(la.node(3), 2);
        assert_eq!(la.node(6), la.node(3));
        assert_eq!(la.node_depth(la.node(3)), 1);
        assert_eq!(la.node_pronunciations(0).len(), 3);
    }

    #[test]
    fn test_dense_scores_take_minimum() {
        let mut la = lookahead(&LookaheadConfig::default());
        let unigram = la.unigram();
        assert_eq!(unigram.score(0), Some(1.0));
        assert_eq!(unigram.score(la.node(5)), Some(3.0));

        let lm = Arc::clone(la.language_model());
        let after_a = lm.extended_history(lm.start_history(), TokenId(0));
        let table = la.lookahead(after_a);
        assert!(!table.is_sparse());
        // c has an explicit bigram after a, a and b back off
        assert_eq!(table.score(la.node(2)), Some(0.5));
        assert_eq!(table.score(la.node(3)), Some(0.7 + 2.0));
    }

    #[test]
    fn test_sparse_tables_miss_back_off_words() {
        let config = LookaheadConfig {
            sparse: true,
            ..LookaheadConfig::default()
        };
        let mut la = lookahead(&config);
        let lm = Arc::clone(la.language_model());
        let after_a = lm.extended_history(lm.start_history(), TokenId(0));

        let table = la.lookahead(after_a);
        assert!(table.is_sparse());
        assert_eq!(table.score(la.node(5)), Some(0.5));
        assert_eq!(table.score(la.node(3)), None);
        assert_eq!(la.stats().sparse_tables, 1);

        // the empty history always gets a dense table
        let empty = lm.reduced_history(after_a, 0);
        assert!(!la.lookahead(empty).is_sparse());
    }

    #[test]
    fn test_cache_hits_and_eviction() {
        let config = LookaheadConfig {
            cache_size: 1,
            ..LookaheadConfig::default()
        };
        let mut la = lookahead(&config);
        let lm = Arc::clone(la.language_model());
        let start = lm.start_history();
        let after_a = lm.extended_history(start, TokenId(0));

        let held = la.lookahead(start);
        assert!(la.try_lookahead(start).is_some());
        assert_eq!(la.stats().cache_hits, 1);

        // the held table cannot be evicted
        la.lookahead(after_a);
        assert_eq!(la.cached_tables(), 2);
        drop(held);

        let after_b = lm.extended_history(start, TokenId(1));
        la.lookahead(after_b);
        assert!(la.try_lookahead(start).is_none());
        assert!(la.stats().evictions >= 1);
    }

    #[test]
    fn test_disabled_unigram_is_zero() {
        let config = LookaheadConfig {
            disable_unigram_lookahead: true,
            ..LookaheadConfig::default()
        };
        let la = lookahead(&config);
        assert!((0..la.num_nodes() as u32).all(|n| la.unigram().score(n) == Some(0.0)));
    }
}
