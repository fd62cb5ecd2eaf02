//! Frame-synchronous decoder driver.
//!
//! [`Decoder`] owns a [`SearchSpace`] and runs its passes once per acoustic
//! frame. One utterance is decoded between [`Decoder::restart`] and
//! [`Decoder::finish`].

use std::sync::Arc;

use once_cell::sync::OnceCell;
use serde::Serialize;
use tracing::{debug, info, warn};

use crate::acoustic::FrameScorer;
use crate::config::SearchConfig;
use crate::error::{DecoderError, Result};
use crate::lm::LanguageModel;
use crate::network::{Lexicon, SearchNetwork};
use crate::observability::metrics::{self, FrameTimer};
use crate::search::{RecognitionContext, SearchSpace, SearchStatistics};
use crate::trace::{Trace, TracebackItem};
use crate::types::{ScoreVector, TimeframeIndex};

/// Result of one utterance.
#[derive(Debug, Clone, Serialize)]
pub struct Recognition {
    /// Recognized words, oldest first.
    pub words: Vec<TracebackItem>,
    /// Total score of the sentence end.
    pub score: ScoreVector,
    /// Sentence-end trace. Its siblings are alternative sentence ends when
    /// a lattice was built.
    #[serde(skip)]
    pub trace: Arc<Trace>,
    /// The utterance ended inside a word.
    pub used_fallback: bool,
}

impl Recognition {
    fn new(trace: Arc<Trace>, used_fallback: bool) -> Self {
        let words = trace
            .traceback()
            .into_iter()
            .filter(|item| item.pronunciation().is_some())
            .collect();
        Self {
            words,
            score: trace.score,
            trace,
            used_fallback,
        }
    }

    /// Orthographic symbols of the recognized words.
    pub fn symbols<'a>(&self, lexicon: &'a Lexicon) -> Vec<&'a str> {
        self.words
            .iter()
            .filter_map(TracebackItem::pronunciation)
            .filter_map(|p| lexicon.lemma_of(p))
            .map(|lemma| lemma.symbol.as_str())
            .collect()
    }
}

static METRICS_DESCRIBED: OnceCell<()> = OnceCell::new();

pub struct Decoder {
    space: SearchSpace,
    time: TimeframeIndex,
    create_lattice: bool,
    optimize_lattice: bool,
    cleanup_interval: u32,
}

impl Decoder {
    pub fn new(
        config: SearchConfig,
        network: Arc<SearchNetwork>,
        lm: Arc<dyn LanguageModel>,
        lookahead_lm: Option<Arc<dyn LanguageModel>>,
    ) -> Result<Self> {
        METRICS_DESCRIBED.get_or_init(metrics::describe_search_metrics);
        let create_lattice = config.create_lattice;
        let optimize_lattice = config.optimize_lattice;
        let cleanup_interval = config.cleanup_interval;
        let space = SearchSpace::new(config, network, lm, lookahead_lm)?;
        info!(
            "Decoder ready, lattice {}, trace cleanup every {} frames",
            create_lattice, cleanup_interval
        );
        let mut decoder = Self {
            space,
            time: 0,
            create_lattice,
            optimize_lattice,
            cleanup_interval,
        };
        decoder.restart();
        Ok(decoder)
    }

    /// Start a new utterance.
    pub fn restart(&mut self) {
        self.space.clear();
        self.time = 0;
        self.space.add_startup_word_end_hypothesis(0);
        debug!("Decoder restarted");
    }

    /// Replace the recognition context. Applies from the next
    /// [`Decoder::restart`].
    pub fn set_context(&mut self, context: RecognitionContext) {
        self.space.set_context(context);
    }

    /// Decode one frame.
    pub fn feed(&mut self, scorer: &dyn FrameScorer) {
        let timer = FrameTimer::new();
        let lattice = self.lattice();
        let space = &mut self.space;

        space.set_time_frame(self.time);
        space.start_new_trees();
        space.expand_hmm();
        let states_before = space.state_hypotheses().len();

        space.prune_and_add_scores(scorer);
        space.rescale(space.best_score());

        space.find_word_ends();
        space.prune_early_word_ends();

        self.time += 1;
        space.create_traces(self.time);
        space.hypothesize_epsilon_pronunciations(space.min_word_end_score());
        space.recombine_word_ends(self.create_lattice);
        if self.optimize_lattice && lattice {
            space.optimize_silence_in_word_lattice();
        }

        if self.cleanup_interval > 0 && self.time % self.cleanup_interval == 0 {
            space.cleanup();
        }

        space.count_frame();
        let states_after = space.state_hypotheses().len();
        let limit = space.thresholds().acoustic_limit.max(1);
        metrics::record_frame(
            states_before,
            states_after,
            space.word_ends().len(),
            space.instances().active_len(),
            states_after as f64 / f64::from(limit),
        );
        timer.finish();
    }

    /// Close the utterance. Falls back to the best state hypothesis when no
    /// word end can close the sentence.
    pub fn finish(&mut self) -> Result<Recognition> {
        let recognition = match self.space.sentence_end(self.time, self.create_lattice) {
            Some(trace) => Recognition::new(trace, false),
            None => {
                warn!(
                    "No sentence end after {} frames among {} word ends",
                    self.time,
                    self.space.word_ends().len()
                );
                match self
                    .space
                    .sentence_end_fallback(self.time, self.create_lattice)
                {
                    Some(trace) => Recognition::new(trace, true),
                    None => return Err(DecoderError::EmptySearchSpace),
                }
            }
        };
        info!(
            "Utterance of {} frames finished with {} words, score {}",
            self.time,
            recognition.words.len(),
            recognition.score
        );
        self.space.statistics().log();
        Ok(recognition)
    }

    /// Frames fed since the last restart.
    pub fn time(&self) -> TimeframeIndex {
        self.time
    }

    /// Deepest trace shared by all live hypotheses, for partial results.
    pub fn common_prefix(&self) -> Option<Arc<Trace>> {
        self.space.common_prefix()
    }

    pub fn statistics(&self) -> &SearchStatistics {
        self.space.statistics()
    }

    pub fn search_space(&self) -> &SearchSpace {
        &self.space
    }

    pub fn search_space_mut(&mut self) -> &mut SearchSpace {
        &mut self.space
    }

    fn lattice(&self) -> bool {
        self.space.context().lattice_mode.resolve(self.create_lattice)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::lm::NGramLm;
    use crate::network::{NetworkBuilder, TransitionModel};
    use crate::search::LatticeMode;
    use crate::types::{MixtureId, PhonemeId, Score, TokenId};

    /// Root (mixture 0) followed by a two-state word `a` (mixtures 1, 2).
    fn decoder(config: SearchConfig) -> Decoder {
        let mut b = NetworkBuilder::new();
        let tm = b.add_transition_model(TransitionModel::default());
        let root = b.add_state(MixtureId(0), tm);
        let a1 = b.add_state(MixtureId(1), tm);
        let a2 = b.add_state(MixtureId(2), tm);
        b.add_successor(root, a1).add_successor(a1, a2);
        let lemma = b.lexicon_mut().add_lemma("a", vec![TokenId(1)]);
        let pron = b
            .lexicon_mut()
            .add_pronunciation(lemma, vec![PhonemeId(1), PhonemeId(2)], 0.0);
        b.add_exit(a2, Some(pron), root);
        b.set_root_state(root);
        let lm: Arc<dyn LanguageModel> = Arc::new(
            NGramLm::builder(1)
                .sentence_end(TokenId(0))
                .ngram(&[TokenId(0)], 0.5)
                .ngram(&[TokenId(1)], 1.0)
                .build()
                .unwrap(),
        );
        Decoder::new(config, Arc::new(b.build().unwrap()), lm, None).unwrap()
    }

    fn frame() -> Vec<Score> {
        vec![3.0, 1.0, 1.0]
    }

    #[test]
    fn test_single_word() {
        let mut decoder = decoder(SearchConfig::default());
        for _ in 0..4 {
            decoder.feed(&frame());
        }
        assert_eq!(decoder.time(), 4);
        let recognition = decoder.finish().unwrap();
        assert!(!recognition.used_fallback);
        assert_eq!(recognition.words.len(), 1);
        assert_eq!(recognition.words[0].time, 4);
        let lexicon = decoder.search_space().network().lexicon();
        assert_eq!(recognition.symbols(lexicon), vec!["a"]);
        assert_eq!(recognition.score.lm, 1.5);
        assert_eq!(decoder.statistics().frames, 4);
    }

    #[test]
    fn test_fallback_inside_word() {
        let mut decoder = decoder(SearchConfig::default());
        decoder.feed(&frame());
        let recognition = decoder.finish().unwrap();
        assert!(recognition.used_fallback);
        assert!(recognition.words.is_empty());
    }

    #[test]
    fn test_empty_search_space() {
        let mut decoder = decoder(SearchConfig::default());
        decoder.feed(&vec![Score::INFINITY; 3]);
        assert!(matches!(
            decoder.finish(),
            Err(DecoderError::EmptySearchSpace)
        ));
    }

    #[test]
    fn test_restart_resets_time() {
        let mut decoder = decoder(SearchConfig::default());
        decoder.feed(&frame());
        decoder.feed(&frame());
        decoder.restart();
        assert_eq!(decoder.time(), 0);
        assert_eq!(decoder.search_space().word_ends().len(), 1);
    }

    #[test]
    fn test_lattice_mode_from_context() {
        let mut decoder = decoder(SearchConfig::default());
        decoder.set_context(RecognitionContext {
            lattice_mode: LatticeMode::Yes,
            ..RecognitionContext::default()
        });
        decoder.restart();
        assert!(decoder.lattice());
    }

    #[test]
    fn test_cleanup_keeps_live_traces() {
        let mut config = SearchConfig::default();
        config.cleanup_interval = 1;
        let mut decoder = decoder(config);
        for _ in 0..6 {
            decoder.feed(&frame());
        }
        let recognition = decoder.finish().unwrap();
        assert!(!recognition.words.is_empty());
        assert!(decoder.common_prefix().is_some());
    }
}
