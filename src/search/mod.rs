//! Search space of the tree decoder.
//!
//! [`SearchSpace`] owns every live hypothesis of one utterance. Each frame
//! the driver runs its passes in a fixed order: new trees are started from
//! the previous frame's word ends, states are expanded and scored, pruned,
//! and the surviving word ends become traces. The passes live in sibling
//! modules as `impl SearchSpace` blocks.

pub mod context;
pub mod controller;
mod expansion;
pub mod histogram;
pub mod hypothesis;
pub mod instance;
mod lookahead;
pub mod prefix_filter;
mod pruning;
pub mod statistics;
pub mod thresholds;
mod word_ends;

pub use context::{LatticeMode, RecognitionContext};
pub use controller::PruningDescription;
pub use histogram::Histogram;
pub use hypothesis::{EarlyWordEndHypothesis, StateHypothesis, StateRange, WordEndHypothesis};
pub use instance::{Instance, InstanceKey, InstanceSet};
pub use prefix_filter::{PrefixFilter, StateSetFilter};
pub use statistics::{RunningAverage, SearchStatistics, UtteranceAverages};
pub use thresholds::PruningThresholds;

use std::sync::Arc;

use rustc_hash::{FxHashMap, FxHashSet};
use tracing::{debug, info, warn};

use crate::acoustic::{AcousticLookahead, NoAcousticLookahead};
use crate::config::SearchConfig;
use crate::error::Result;
use crate::lm::{extend_history, LanguageModel, LanguageModelLookahead};
use crate::network::{Coarticulation, NetworkLayout, SearchNetwork, StateDepths};
use crate::trace::{Trace, TraceKind, Transit};
use crate::types::{LemmaId, Score, ScoreVector, StateId, TimeframeIndex, TraceId};

pub struct SearchSpace {
    config: SearchConfig,
    network: Arc<SearchNetwork>,
    depths: StateDepths,
    layout: NetworkLayout,
    lm: Arc<dyn LanguageModel>,
    lookahead_lm: Arc<dyn LanguageModel>,
    lm_lookahead: Option<LanguageModelLookahead>,
    acoustic_lookahead: Box<dyn AcousticLookahead + Send>,
    prefix_filter: Option<Box<dyn PrefixFilter>>,
    thresholds: PruningThresholds,

    traces: crate::trace::TraceManager,
    instances: InstanceSet,
    state_hypotheses: Vec<StateHypothesis>,
    new_state_hypotheses: Vec<StateHypothesis>,
    /// Per state: index of its hypothesis in the current expansion window.
    recombination: Vec<u32>,
    /// Per state: index of its best hypothesis during LM-state pruning.
    lm_state_best: Vec<u32>,
    early_word_ends: Vec<EarlyWordEndHypothesis>,
    word_ends: Vec<WordEndHypothesis>,
    state_histogram: Histogram,
    word_end_histogram: Histogram,

    context: RecognitionContext,
    time: TimeframeIndex,
    /// Subtracted from all live scores; traces keep absolute scores.
    global_score_offset: Score,
    best_score: Score,
    best_prospect: Score,
    min_word_end_score: Score,
    lookahead_state_threshold: u32,
    minimized: bool,
    had_word_end: bool,

    statistics: SearchStatistics,
    averages: UtteranceAverages,
}

impl SearchSpace {
    /// Build the search space. `lookahead_lm` defaults to `lm`.
    pub fn new(
        config: SearchConfig,
        network: Arc<SearchNetwork>,
        lm: Arc<dyn LanguageModel>,
        lookahead_lm: Option<Arc<dyn LanguageModel>>,
    ) -> Result<Self> {
        config.validate()?;
        let depths = StateDepths::build(&network)?;
        let layout = NetworkLayout::build(&network, &depths, config.symmetrize_penalties);
        let lookahead_lm = lookahead_lm.unwrap_or_else(|| Arc::clone(&lm));

        let root_depth = depths.depth(network.root_state());
        let minimized = network.is_minimized() && root_depth > 0;
        if network.is_minimized() && !minimized {
            info!("Network is marked minimized but has no pushed states before the root");
        }

        let mut thresholds = PruningThresholds::from_config(&config.pruning, lm.scale());
        if thresholds.lm_state.is_finite() && !minimized {
            warn!("LM-state pruning requires a minimized network, disabling it");
            thresholds.lm_state = Score::INFINITY;
        }
        if config.early_back_off && lookahead_lm.as_back_off().is_none() {
            warn!("Early back-off requested without a back-off language model, ignoring it");
        }
        if config.condition_predecessor_word {
            info!("Conditioning tree instances on the predecessor word");
        }

        let lm_lookahead = if config.lookahead.enabled {
            Some(LanguageModelLookahead::new(
                &network,
                &depths,
                Arc::clone(&lookahead_lm),
                &config.lookahead,
                config.pronunciation_scale,
            ))
        } else {
            info!("LM look-ahead is disabled");
            None
        };

        let count = network.state_count();
        debug!(
            "Search space over {} states, root depth {}, minimized {}",
            count, root_depth, minimized
        );
        Ok(Self {
            state_histogram: Histogram::new(config.pruning.state_histogram_bins),
            word_end_histogram: Histogram::new(config.pruning.word_end_histogram_bins),
            lookahead_state_threshold: config.lookahead.state_minimum,
            config,
            network,
            depths,
            layout,
            lm,
            lookahead_lm,
            lm_lookahead,
            acoustic_lookahead: Box::new(NoAcousticLookahead),
            prefix_filter: None,
            thresholds,
            traces: crate::trace::TraceManager::new(),
            instances: InstanceSet::new(),
            state_hypotheses: Vec::new(),
            new_state_hypotheses: Vec::new(),
            recombination: vec![u32::MAX; count],
            lm_state_best: vec![u32::MAX; count],
            early_word_ends: Vec::new(),
            word_ends: Vec::new(),
            context: RecognitionContext::default(),
            time: 0,
            global_score_offset: 0.0,
            best_score: Score::INFINITY,
            best_prospect: Score::INFINITY,
            min_word_end_score: Score::INFINITY,
            minimized,
            had_word_end: false,
            statistics: SearchStatistics::default(),
            averages: UtteranceAverages::default(),
        })
    }

    pub fn set_acoustic_lookahead(&mut self, lookahead: Box<dyn AcousticLookahead + Send>) {
        self.acoustic_lookahead = lookahead;
    }

    pub fn set_prefix_filter(&mut self, filter: Option<Box<dyn PrefixFilter>>) {
        self.prefix_filter = filter;
    }

    pub fn set_context(&mut self, context: RecognitionContext) {
        self.context = context;
    }

    pub fn context(&self) -> &RecognitionContext {
        &self.context
    }

    /// Reset all per-utterance state.
    pub fn clear(&mut self) {
        self.averages.clear();
        self.had_word_end = false;
        self.lookahead_state_threshold = self.config.lookahead.state_minimum;
        self.acoustic_lookahead.start_frame(0);
        self.global_score_offset = 0.0;
        self.state_hypotheses.clear();
        self.new_state_hypotheses.clear();
        self.instances.clear();
        self.early_word_ends.clear();
        self.word_ends.clear();
        self.state_histogram.clear();
        self.word_end_histogram.clear();
        self.best_score = Score::INFINITY;
        self.best_prospect = Score::INFINITY;
        self.min_word_end_score = Score::INFINITY;
        self.traces.clear();
        self.time = 0;
    }

    pub fn set_time_frame(&mut self, time: TimeframeIndex) {
        self.time = time;
        self.acoustic_lookahead.start_frame(time);
    }

    /// Whether traces carry the exact transit state instead of its
    /// coarticulation.
    pub(crate) fn encode_state(&self) -> bool {
        self.config.encode_state_in_trace_always
            || (self.config.encode_state_in_trace && !self.config.create_lattice)
    }

    /// Trace transit for a word-initial state.
    pub fn describe_root_state(&self, state: StateId) -> Transit {
        if self.encode_state() {
            return Transit::State(state);
        }
        Transit::Coarticulation(
            self.network
                .root_transit_descriptions()
                .get(&state)
                .copied()
                .unwrap_or(Coarticulation::NONE),
        )
    }

    /// Root state a word in `coarticulation` starts in.
    pub fn root_for_coarticulation(&self, coarticulation: Coarticulation) -> StateId {
        if coarticulation.is_none() {
            return self.network.root_state();
        }
        let mut matches = self
            .network
            .root_transit_descriptions()
            .iter()
            .filter(|(_, c)| **c == coarticulation)
            .map(|(state, _)| *state);
        match (matches.next(), matches.next()) {
            (Some(state), None) => state,
            (Some(state), Some(_)) => {
                warn!(
                    "Ambiguous root state for coarticulation {:?}, using state {}",
                    coarticulation, state
                );
                state
            }
            (None, _) => {
                warn!(
                    "No root state for coarticulation {:?}, using the default root",
                    coarticulation
                );
                self.network.root_state()
            }
        }
    }

    /// Seed the search with the sentence begin at `time`.
    pub fn add_startup_word_end_hypothesis(&mut self, time: TimeframeIndex) {
        let lexicon = self.network.lexicon();
        let mut history = self.lm.start_history();
        let mut lookahead_history = self.lookahead_lm.start_history();
        for lemma in &self.context.prefix {
            if let Some(lemma) = lexicon.lemma(*lemma) {
                history = extend_history(self.lm.as_ref(), &lemma.tokens, history);
                lookahead_history =
                    extend_history(self.lookahead_lm.as_ref(), &lemma.tokens, lookahead_history);
            }
        }

        let root = self.root_for_coarticulation(self.context.coarticulation);
        let trace = Arc::new(Trace::new(
            None,
            TraceKind::Boundary,
            time,
            ScoreVector::new(self.global_score_offset, 0.0),
            self.describe_root_state(root),
        ));
        self.word_ends.push(WordEndHypothesis {
            history,
            lookahead_history,
            transit_state: root,
            pronunciation: None,
            score: ScoreVector::default(),
            trace,
            exit: None,
        });
    }

    /// Shift all live scores by `-offset`.
    pub fn rescale(&mut self, offset: Score) {
        if !offset.is_finite() || offset == 0.0 {
            return;
        }
        debug_assert!(self.early_word_ends.is_empty());
        for hyp in &mut self.state_hypotheses {
            hyp.score -= offset;
            hyp.prospect -= offset;
        }
        let active: Vec<_> = self.instances.active().to_vec();
        for id in active {
            for hyp in &mut self.instances.get_mut(id).root_hypotheses {
                hyp.score -= offset;
                hyp.prospect -= offset;
            }
        }
        for word_end in &mut self.word_ends {
            word_end.score.acoustic -= offset;
        }
        self.best_score -= offset;
        self.best_prospect -= offset;
        self.min_word_end_score -= offset;
        self.global_score_offset += offset;
    }

    /// Drop trace items no live hypothesis refers to.
    pub fn cleanup(&mut self) {
        let mut live: Vec<TraceId> = self.state_hypotheses.iter().map(|h| h.trace).collect();
        for instance in self.instances.iter_active() {
            live.extend(instance.root_hypotheses.iter().map(|h| h.trace));
            live.extend(instance.transfer.iter().map(|h| h.trace));
        }
        live.extend(self.early_word_ends.iter().map(|w| w.trace));

        let before = self.traces.len();
        let mapping = self.traces.cleanup(live);
        let remap = |id: &mut TraceId| {
            if let Some(new) = mapping.get(id) {
                *id = *new;
            }
        };
        for hyp in &mut self.state_hypotheses {
            remap(&mut hyp.trace);
        }
        let active: Vec<_> = self.instances.active().to_vec();
        for id in active {
            let instance = self.instances.get_mut(id);
            for hyp in instance
                .root_hypotheses
                .iter_mut()
                .chain(instance.transfer.iter_mut())
            {
                remap(&mut hyp.trace);
            }
        }
        for word_end in &mut self.early_word_ends {
            remap(&mut word_end.trace);
        }
        debug!("Trace cleanup kept {} of {} items", self.traces.len(), before);
    }

    /// Deepest trace shared by every live hypothesis.
    pub fn common_prefix(&self) -> Option<Arc<Trace>> {
        let mut ends: Vec<Arc<Trace>> = Vec::new();
        let mut seen = FxHashSet::default();
        for hyp in &self.state_hypotheses {
            if seen.insert(hyp.trace) {
                ends.push(Arc::clone(self.traces.trace(hyp.trace)));
            }
        }
        ends.extend(self.word_ends.iter().map(|w| Arc::clone(&w.trace)));
        if ends.is_empty() {
            return None;
        }

        // follower sets keyed by node address
        let key = |t: &Arc<Trace>| Arc::as_ptr(t) as usize;
        let mut followers: FxHashMap<usize, FxHashSet<usize>> = FxHashMap::default();
        let mut nodes: FxHashMap<usize, Arc<Trace>> = FxHashMap::default();
        let end_keys: FxHashSet<usize> = ends.iter().map(key).collect();
        let mut root = None;
        for end in &ends {
            let mut current = Arc::clone(end);
            loop {
                let k = key(&current);
                if nodes.insert(k, Arc::clone(&current)).is_some() {
                    break;
                }
                match current.predecessor.clone() {
                    Some(predecessor) => {
                        followers.entry(key(&predecessor)).or_default().insert(k);
                        current = predecessor;
                    }
                    None => {
                        root = Some(current);
                        break;
                    }
                }
            }
        }

        let mut current = root?;
        loop {
            let k = key(&current);
            if end_keys.contains(&k) {
                return Some(current);
            }
            match followers.get(&k) {
                Some(next) if next.len() == 1 => {
                    let next = next.iter().next().copied()?;
                    current = Arc::clone(nodes.get(&next)?);
                }
                _ => return Some(current),
            }
        }
    }

    /// Best state score of the current frame, relative to the global offset.
    pub fn best_score(&self) -> Score {
        self.best_score
    }

    pub fn best_prospect(&self) -> Score {
        self.best_prospect
    }

    pub fn min_word_end_score(&self) -> Score {
        self.min_word_end_score
    }

    pub fn global_score_offset(&self) -> Score {
        self.global_score_offset
    }

    pub fn time(&self) -> TimeframeIndex {
        self.time
    }

    pub fn state_hypotheses(&self) -> &[StateHypothesis] {
        &self.state_hypotheses
    }

    pub fn word_ends(&self) -> &[WordEndHypothesis] {
        &self.word_ends
    }

    pub fn instances(&self) -> &InstanceSet {
        &self.instances
    }

    pub fn traces(&self) -> &crate::trace::TraceManager {
        &self.traces
    }

    pub fn thresholds(&self) -> &PruningThresholds {
        &self.thresholds
    }

    pub fn network(&self) -> &Arc<SearchNetwork> {
        &self.network
    }

    pub fn depths(&self) -> &StateDepths {
        &self.depths
    }

    pub fn config(&self) -> &SearchConfig {
        &self.config
    }

    pub fn language_model(&self) -> &Arc<dyn LanguageModel> {
        &self.lm
    }

    pub fn lm_lookahead(&self) -> Option<&LanguageModelLookahead> {
        self.lm_lookahead.as_ref()
    }

    pub fn is_minimized(&self) -> bool {
        self.minimized
    }

    pub fn had_word_end(&self) -> bool {
        self.had_word_end
    }

    pub fn statistics(&self) -> &SearchStatistics {
        &self.statistics
    }

    /// Count one decoded frame in the statistics.
    pub fn count_frame(&mut self) {
        self.statistics.frames += 1;
    }

    pub fn reset_statistics(&mut self) {
        self.statistics.clear();
    }

    pub fn averages(&self) -> &UtteranceAverages {
        &self.averages
    }

    /// Last word of `trace` that carries LM tokens.
    pub(crate) fn last_lemma(&self, trace: &Arc<Trace>) -> Option<LemmaId> {
        let lexicon = self.network.lexicon();
        let mut current = Some(trace);
        while let Some(t) = current {
            if let Some(pron) = t.pronunciation() {
                if let Some(p) = lexicon.pronunciation(pron) {
                    if lexicon.lemma(p.lemma).is_some_and(|l| !l.tokens.is_empty()) {
                        return Some(p.lemma);
                    }
                }
            }
            current = t.predecessor.as_ref();
        }
        None
    }
}


#[cfg(test)]
mod tests {
    use super::test_support::*;
    use super::*;
    use crate::network::NetworkBuilder;

    fn space() -> SearchSpace {
        SearchSpace::new(config(), Arc::new(two_words()), unigram(), None).unwrap()
    }

    #[test]
    fn test_startup_seeds_root() {
        let mut space = space();
        space.add_startup_word_end_hypothesis(0);
        assert_eq!(space.word_ends().len(), 1);
        let start = &space.word_ends()[0];
        assert_eq!(start.transit_state, space.network().root_state());
        assert!(start.pronunciation.is_none());
        assert_eq!(start.trace.kind, TraceKind::Boundary);
    }

    #[test]
    fn test_rescale_moves_offset() {
        let mut space = space();
        space.add_startup_word_end_hypothesis(0);
        space.word_ends[0].score.acoustic = 5.0;
        space.rescale(3.0);
        assert_eq!(space.global_score_offset(), 3.0);
        assert_eq!(space.word_ends()[0].score.acoustic, 2.0);
        space.rescale(Score::INFINITY);
        assert_eq!(space.global_score_offset(), 3.0);
    }

    #[test]
    fn test_root_for_coarticulation_falls_back() {
        let mut b = NetworkBuilder::new();
        let tm = b.add_transition_model(Default::default());
        let root = b.add_state(crate::types::MixtureId(0), tm);
        let left = b.add_state(crate::types::MixtureId(1), tm);
        b.add_successor(root, left);
        b.set_root_state(root);
        let context = Coarticulation::new(Some(crate::types::PhonemeId(1)), None);
        b.set_root_transit_description(left, context);
        let network = Arc::new(b.build().unwrap());
        let space = SearchSpace::new(config(), network, unigram(), None).unwrap();

        assert_eq!(space.root_for_coarticulation(Coarticulation::NONE), root);
        assert_eq!(space.root_for_coarticulation(context), left);
        let unknown = Coarticulation::new(Some(crate::types::PhonemeId(9)), None);
        assert_eq!(space.root_for_coarticulation(unknown), root);
        assert_eq!(
            space.describe_root_state(left),
            Transit::Coarticulation(context)
        );
    }

    #[test]
    fn test_encode_state_in_trace() {
        let mut config = config();
        config.encode_state_in_trace = true;
        let space = SearchSpace::new(config.clone(), Arc::new(two_words()), unigram(), None).unwrap();
        assert_eq!(space.describe_root_state(1), Transit::State(1));

        config.create_lattice = true;
        let space = SearchSpace::new(config, Arc::new(two_words()), unigram(), None).unwrap();
        assert!(!space.encode_state());
    }

    #[test]
    fn test_common_prefix_of_diverging_paths() {
        let mut space = space();
        let start = Arc::new(Trace::boundary(0, Transit::default()));
        let shared = Arc::new(Trace::new(
            Some(Arc::clone(&start)),
            TraceKind::Word(crate::types::PronunciationId(0)),
            3,
            ScoreVector::new(1.0, 1.0),
            Transit::default(),
        ));
        let left = Arc::new(Trace::new(
            Some(Arc::clone(&shared)),
            TraceKind::Word(crate::types::PronunciationId(0)),
            6,
            ScoreVector::new(2.0, 2.0),
            Transit::default(),
        ));
        let right = Arc::new(Trace::new(
            Some(Arc::clone(&shared)),
            TraceKind::Word(crate::types::PronunciationId(1)),
            6,
            ScoreVector::new(2.0, 2.0),
            Transit::default(),
        ));
        for trace in [left, right] {
            space.word_ends.push(WordEndHypothesis {
                history: space.lm.start_history(),
                lookahead_history: space.lm.start_history(),
                transit_state: 1,
                pronunciation: None,
                score: ScoreVector::default(),
                trace,
                exit: None,
            });
        }
        let prefix = space.common_prefix().unwrap();
        assert!(Arc::ptr_eq(&prefix, &shared));
    }

    #[test]
    fn test_cleanup_keeps_traces_of_live_hypotheses() {
        use crate::trace::{Modification, TraceItem};

        let mut space = space();
        let history = space.lm.start_history();
        let item = |time| {
            TraceItem::new(Arc::new(Trace::boundary(time, Transit::default())), history, history)
        };
        space.traces.add(item(0));
        let live = space.traces.add(item(1));
        space.traces.add(item(2));
        let modified = space.traces.modify(live, 2, Some(0.5), 1);
        let live_trace = Arc::clone(space.traces.trace(live));
        space.state_hypotheses = vec![
            StateHypothesis::new(1, 0.0, modified),
            StateHypothesis::new(2, 1.0, live),
        ];

        space.cleanup();
        assert_eq!(space.traces().len(), 2);
        let [first, second] = [space.state_hypotheses[0].trace, space.state_hypotheses[1].trace];
        assert!(Arc::ptr_eq(space.traces().trace(first), &live_trace));
        assert!(Arc::ptr_eq(space.traces().trace(second), &live_trace));
        assert_eq!(space.traces().modification(second), &Modification::Unmodified);
        assert_eq!(
            space.traces().modification(first),
            &Modification::Modified {
                origin: second,
                time_delta: 2,
                score_delta: Some(0.5),
                transit_state: 1,
            }
        );
    }

    #[test]
    fn test_clear_resets_utterance() {
        let mut space = space();
        space.add_startup_word_end_hypothesis(0);
        space.rescale(2.0);
        space.clear();
        assert!(space.word_ends().is_empty());
        assert_eq!(space.global_score_offset(), 0.0);
        assert!(space.traces().is_empty());
    }
}
