//! Word-end handling.
//!
//! Hypotheses in labeled states produce early word ends. The survivors of
//! word-end pruning get their LM histories extended, become traces and are
//! recombined per LM context before they start new trees in the next frame.

use std::collections::hash_map::Entry;
use std::sync::Arc;

use rustc_hash::{FxHashMap, FxHashSet};
use tracing::{debug, info, warn};

use super::hypothesis::{EarlyWordEndHypothesis, WordEndHypothesis};
use super::instance::InstanceKey;
use super::SearchSpace;
use crate::lm::{add_lemma_score, extend_history};
use crate::network::Coarticulation;
use crate::observability::metrics;
use crate::trace::{
    link_sibling, prune_silence_siblings, Modification, Trace, TraceItem, TraceKind, Transit,
};
use crate::types::{
    History, InstanceId, PhonemeId, Score, ScoreVector, StateId, TimeframeIndex, TraceId,
};

/// Bucket of word-end phoneme pruning.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
enum PhonemeGroup {
    /// Transit into a pushed state, never pruned by phoneme.
    Pushed,
    Initial(Option<PhonemeId>),
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
enum RecombinationKey {
    Context(History, StateId),
    /// Transit plus the last phonemes of the word.
    Mesh(StateId, Vec<PhonemeId>),
}

/// Keep the better of two trace candidates, chaining the other behind it.
fn keep_best(best: Option<Arc<Trace>>, candidate: Arc<Trace>, lattice: bool) -> Arc<Trace> {
    match best {
        None => candidate,
        Some(best) if candidate.score.total() < best.score.total() => {
            if lattice {
                link_sibling(&candidate, &best);
            }
            candidate
        }
        Some(best) => {
            if lattice {
                link_sibling(&best, &candidate);
            }
            best
        }
    }
}

impl SearchSpace {
    /// Collect early word ends from every hypothesis in a labeled state.
    pub fn find_word_ends(&mut self) {
        debug_assert!(self.early_word_ends.is_empty());
        let early_pruning = self.config.pruning.early_word_end_pruning;
        let anticipated = self.config.pruning.early_word_end_pruning_anticipated_lm_score;
        let relative = self.thresholds.relative_word_end();
        let pronunciation_scale = self.config.pronunciation_scale;
        let network = Arc::clone(&self.network);
        let lexicon = network.lexicon();

        let mut bound = Score::INFINITY;
        let mut min_score = Score::INFINITY;
        let active = self.instances.active().to_vec();
        for id in active {
            let instance = self.instances.get_mut(id);
            for hyp in &self.state_hypotheses[instance.states.indices()] {
                if !self.layout.has_exits(hyp.state) {
                    continue;
                }
                let exit_penalty = network.transition_model(hyp.state).exit;
                if !exit_penalty.is_finite()
                    || (early_pruning && hyp.score + exit_penalty + anticipated > bound)
                {
                    continue;
                }
                let trace_lm = self.traces.trace(hyp.trace).score.lm;
                for exit in self.layout.exits(hyp.state) {
                    let mut score = ScoreVector::new(
                        hyp.score - trace_lm - instance.total_back_off_offset + exit_penalty,
                        trace_lm,
                    );
                    if let Some(pronunciation) = network.exit(exit).pronunciation {
                        score.lm += instance.lm_score(
                            pronunciation,
                            self.lm.as_ref(),
                            lexicon,
                            pronunciation_scale,
                        );
                    }
                    let total = score.total();
                    if total < min_score {
                        min_score = total;
                        if early_pruning {
                            bound = total + relative;
                        }
                    }
                    if early_pruning && total > bound {
                        continue;
                    }
                    self.early_word_ends.push(EarlyWordEndHypothesis {
                        trace: hyp.trace,
                        score,
                        exit,
                    });
                }
            }
        }
        self.min_word_end_score = min_score;
        self.statistics.early_word_ends += self.early_word_ends.len() as u64;
    }

    /// Turn the early word ends within the word-end beam into full word
    /// ends, then apply phoneme and histogram pruning.
    pub fn prune_early_word_ends(&mut self) {
        debug_assert!(self.word_ends.is_empty());
        let threshold = self.min_word_end_score + self.thresholds.relative_word_end();
        let phoneme_pruning = self.thresholds.word_end_phoneme < self.thresholds.word_end;
        let network = Arc::clone(&self.network);
        let lexicon = network.lexicon();
        let root_depth = self.depths.depth(network.root_state());

        let mut groups = Vec::new();
        let mut group_best: FxHashMap<PhonemeGroup, Score> = FxHashMap::default();
        let early_word_ends = std::mem::take(&mut self.early_word_ends);
        for early in &early_word_ends {
            let total = early.score.total();
            if total > threshold {
                continue;
            }
            let exit = *network.exit(early.exit);
            let pronunciation = exit.pronunciation.and_then(|p| lexicon.pronunciation(p));
            let initial = pronunciation.and_then(|p| p.phonemes.first().copied());

            let item = self.traces.item(early.trace);
            let mut history = item.history;
            let mut lookahead_history = item.lookahead_history;
            if let Some(lemma) = pronunciation.and_then(|p| lexicon.lemma(p.lemma)) {
                history = extend_history(self.lm.as_ref(), &lemma.tokens, history);
                lookahead_history =
                    extend_history(self.lookahead_lm.as_ref(), &lemma.tokens, lookahead_history);
            }

            if phoneme_pruning {
                let group = if self.depths.depth(exit.transit_state) < root_depth {
                    PhonemeGroup::Pushed
                } else {
                    PhonemeGroup::Initial(
                        network
                            .root_transit_descriptions()
                            .get(&exit.transit_state)
                            .and_then(|c| c.initial_phone),
                    )
                };
                groups.push(group);
                let best = group_best.entry(group).or_insert(Score::INFINITY);
                *best = best.min(total);
            }

            let trace = self.modified_trace(early.trace, initial);
            self.word_ends.push(WordEndHypothesis {
                history,
                lookahead_history,
                transit_state: exit.transit_state,
                pronunciation: exit.pronunciation,
                score: early.score,
                trace,
                exit: Some(early.exit),
            });
        }
        self.early_word_ends = early_word_ends;
        self.early_word_ends.clear();

        if phoneme_pruning {
            let before = self.word_ends.len();
            let beam = self.thresholds.word_end_phoneme;
            let mut groups = groups.into_iter();
            self.word_ends.retain(|word_end| match groups.next() {
                Some(PhonemeGroup::Pushed) | None => true,
                Some(group) => word_end.score.total() < group_best[&group] + beam,
            });
            self.statistics.phoneme_pruned_word_ends += (before - self.word_ends.len()) as u64;
        }

        self.histogram_prune_word_ends();

        let count = self.word_ends.len();
        self.statistics.word_ends_after_pruning += count as u64;
        self.averages.word_ends_after_pruning.add(count as f64);
    }

    fn histogram_prune_word_ends(&mut self) {
        let limit = self.thresholds.word_end_limit;
        let range = self.thresholds.relative_word_end();
        if self.word_ends.len() <= limit as usize || !range.is_finite() {
            return;
        }
        let min = self
            .word_ends
            .iter()
            .map(|w| w.score.total())
            .fold(Score::INFINITY, Score::min);
        self.word_end_histogram.set_limits(min, min + range);
        for word_end in &self.word_ends {
            self.word_end_histogram.add(word_end.score.total());
        }
        let threshold = self.word_end_histogram.quantile(limit);
        debug!(
            "Histogram pruning {} word ends at {:.3} above the best",
            self.word_ends.len(),
            threshold - min
        );
        self.word_ends.retain(|w| w.score.total() <= threshold);
        self.statistics.word_end_histogram_prunings += 1;
    }

    /// Trace of `id` with its pending boundary correction applied as an
    /// epsilon item. `initial` is the first phoneme of the ending word.
    fn modified_trace(&self, id: TraceId, initial: Option<PhonemeId>) -> Arc<Trace> {
        let trace = self.traces.trace(id);
        let Modification::Modified {
            time_delta,
            score_delta,
            transit_state,
            ..
        } = *self.traces.modification(id)
        else {
            return Arc::clone(trace);
        };
        let encode = self.encode_state();
        let score_delta = score_delta.filter(|delta| *delta != 0.0);
        if time_delta == 0 && score_delta.is_none() && !encode {
            return Arc::clone(trace);
        }

        let mut score = trace.score;
        if let Some(delta) = score_delta {
            score.acoustic += delta;
        }
        let transit = if encode {
            self.describe_root_state(transit_state)
        } else {
            let lexicon = self.network.lexicon();
            let last = trace
                .pronunciation()
                .and_then(|p| lexicon.pronunciation(p))
                .and_then(|p| p.phonemes.last().copied());
            match (last, initial) {
                (Some(last), Some(initial))
                    if lexicon.is_context_dependent(last)
                        && lexicon.is_context_dependent(initial) =>
                {
                    Transit::Coarticulation(Coarticulation::new(Some(last), Some(initial)))
                }
                _ => Transit::default(),
            }
        };
        debug_assert!(trace.time + time_delta <= self.time + 1);
        Arc::new(Trace::new(
            Some(Arc::clone(trace)),
            TraceKind::Epsilon,
            trace.time + time_delta,
            score,
            transit,
        ))
    }

    /// Attach a word trace ending at `time` to every word end with a
    /// pronunciation.
    pub fn create_traces(&mut self, time: TimeframeIndex) {
        let offset = self.global_score_offset;
        let overflow = self.config.overflow_lm_score_to_am;
        for index in 0..self.word_ends.len() {
            let Some(pronunciation) = self.word_ends[index].pronunciation else {
                continue;
            };
            let transit = self.describe_root_state(self.word_ends[index].transit_state);
            let word_end = &mut self.word_ends[index];
            let predecessor = Arc::clone(&word_end.trace);
            let previous = predecessor.score;

            let mut score = word_end.score;
            score.acoustic += offset;
            // per-word LM scores stay non-negative
            if score.lm < previous.lm {
                let delta = previous.lm - score.lm;
                score.lm = previous.lm;
                word_end.score.lm = previous.lm;
                if overflow && delta < word_end.score.acoustic {
                    score.acoustic -= delta;
                    word_end.score.acoustic -= delta;
                    if score.acoustic < previous.acoustic {
                        score.acoustic = previous.acoustic;
                        word_end.score.acoustic = score.acoustic - offset;
                    }
                }
            }
            word_end.trace = Arc::new(Trace::new(
                Some(predecessor),
                TraceKind::Word(pronunciation),
                time,
                score,
                transit,
            ));
        }
    }

    /// Add zero-duration words labeled on the transit states of the current
    /// word ends.
    ///
    /// Only the word ends present on entry are expanded, so epsilon words
    /// never follow one another within a frame.
    pub fn hypothesize_epsilon_pronunciations(&mut self, best_score: Score) {
        let threshold = best_score + self.thresholds.word_end;
        let offset = self.global_score_offset;
        let pronunciation_scale = self.config.pronunciation_scale;
        let condition_predecessor = self.config.condition_predecessor_word;
        let network = Arc::clone(&self.network);
        let lexicon = network.lexicon();
        let count = self.word_ends.len();

        for index in 0..count {
            let transit = self.word_ends[index].transit_state;
            let exit_penalty = network.transition_model(transit).exit;
            if !exit_penalty.is_finite() || !self.layout.has_exits(transit) {
                continue;
            }
            let exits: Vec<_> = self.layout.exits(transit).collect();
            for exit_id in exits {
                let exit = *network.exit(exit_id);
                let Some(pronunciation) = exit.pronunciation else {
                    continue;
                };
                let Some(entry) = lexicon.pronunciation(pronunciation) else {
                    continue;
                };
                let tokens = lexicon
                    .lemma(entry.lemma)
                    .map(|lemma| lemma.tokens.as_slice())
                    .unwrap_or_default();

                let mut word_end = self.word_ends[index].clone();
                word_end.pronunciation = Some(pronunciation);
                word_end.transit_state = exit.transit_state;
                word_end.exit = Some(exit_id);

                let instance = if condition_predecessor {
                    None
                } else {
                    self.instances
                        .find(&InstanceKey::new(word_end.history, None))
                };
                word_end.score.lm += match instance {
                    Some(id) => self.instances.get_mut(id).lm_score(
                        pronunciation,
                        self.lm.as_ref(),
                        lexicon,
                        pronunciation_scale,
                    ),
                    None => {
                        let mut history = word_end.history;
                        add_lemma_score(self.lm.as_ref(), tokens, &mut history)
                            + pronunciation_scale * entry.score
                    }
                };
                word_end.score.acoustic += exit_penalty;
                if word_end.score.total() > threshold {
                    continue;
                }

                word_end.history = extend_history(self.lm.as_ref(), tokens, word_end.history);
                word_end.lookahead_history = extend_history(
                    self.lookahead_lm.as_ref(),
                    tokens,
                    word_end.lookahead_history,
                );
                let mut score = word_end.score;
                score.acoustic += offset;
                word_end.trace = Arc::new(Trace::new(
                    Some(Arc::clone(&word_end.trace)),
                    TraceKind::Word(pronunciation),
                    word_end.trace.time,
                    score,
                    self.describe_root_state(exit.transit_state),
                ));
                self.word_ends.push(word_end);
            }
        }
        self.statistics.epsilon_word_ends += (self.word_ends.len() - count) as u64;
    }

    /// Keep one word end per LM context and transit state. With a lattice
    /// the losers are chained as siblings of the winner's trace.
    pub fn recombine_word_ends(&mut self, create_lattice: bool) {
        let lattice = self.context.lattice_mode.resolve(create_lattice);
        let mesh = self.config.decode_mesh && lattice;
        let phones = self.config.mesh_history_phones;
        let network = Arc::clone(&self.network);
        let lexicon = network.lexicon();

        let word_ends = std::mem::take(&mut self.word_ends);
        let mut kept: Vec<WordEndHypothesis> = Vec::with_capacity(word_ends.len());
        let mut slots: FxHashMap<RecombinationKey, usize> = FxHashMap::default();
        for word_end in word_ends {
            let key = if mesh {
                let phonemes = word_end
                    .pronunciation
                    .and_then(|p| lexicon.pronunciation(p))
                    .map(|p| {
                        let start = p.phonemes.len().saturating_sub(phones);
                        p.phonemes[start..].to_vec()
                    })
                    .unwrap_or_default();
                RecombinationKey::Mesh(word_end.transit_state, phonemes)
            } else {
                RecombinationKey::Context(word_end.history, word_end.transit_state)
            };
            match slots.entry(key) {
                Entry::Occupied(slot) => {
                    let stored = &mut kept[*slot.get()];
                    let incoming_wins = stored.score.total() > word_end.score.total()
                        || (stored.score.total() == word_end.score.total()
                            && stored.pronunciation > word_end.pronunciation);
                    if incoming_wins {
                        if lattice {
                            link_sibling(&word_end.trace, &stored.trace);
                        }
                        *stored = word_end;
                    } else if lattice {
                        link_sibling(&stored.trace, &word_end.trace);
                    }
                }
                Entry::Vacant(slot) => {
                    slot.insert(kept.len());
                    kept.push(word_end);
                }
            }
        }
        self.word_ends = kept;

        let lemmas: FxHashSet<_> = self
            .word_ends
            .iter()
            .filter_map(|w| w.pronunciation)
            .filter_map(|p| lexicon.pronunciation(p))
            .filter(|p| lexicon.lemma(p.lemma).is_some_and(|l| !l.tokens.is_empty()))
            .map(|p| p.lemma)
            .collect();
        self.statistics.word_ends_after_recombination += self.word_ends.len() as u64;
        self.averages
            .word_lemmas_after_recombination
            .add(lemmas.len() as f64);
    }

    /// Remove silence alternatives from the sibling chains of the current
    /// word ends.
    pub fn optimize_silence_in_word_lattice(&mut self) {
        let lexicon = self.network.lexicon();
        let Some(silence) = lexicon.silence() else {
            return;
        };
        for word_end in &self.word_ends {
            prune_silence_siblings(&word_end.trace, lexicon, silence);
        }
    }

    /// Enter every word end into the tree instance of its LM context.
    pub fn start_new_trees(&mut self) {
        let word_ends = std::mem::take(&mut self.word_ends);
        for word_end in &word_ends {
            let entered = self.activate_or_update_tree(
                &word_end.trace,
                word_end.history,
                word_end.lookahead_history,
                word_end.transit_state,
                word_end.score.total(),
            );
            debug_assert!(entered.is_some());
        }
        self.word_ends = word_ends;
        self.word_ends.clear();
    }

    pub fn activate_or_update_tree(
        &mut self,
        trace: &Arc<Trace>,
        history: History,
        lookahead_history: History,
        entry: StateId,
        score: Score,
    ) -> Option<InstanceId> {
        let predecessor = if self.config.condition_predecessor_word {
            self.last_lemma(trace)
        } else {
            None
        };
        let reduced = match &self.lm_lookahead {
            Some(lookahead) => lookahead.reduced_history(lookahead_history),
            None => lookahead_history,
        };
        let id = self.instances.instance_for_key(
            true,
            InstanceKey::new(history, predecessor),
            reduced,
        )?;
        let trace = self
            .traces
            .add(TraceItem::new(Arc::clone(trace), history, lookahead_history));
        let instance = self.instances.get_mut(id);
        instance.enter(trace, entry, score);
        instance.lookahead_history = reduced;
        Some(id)
    }

    /// Scaled LM score of the context suffix and the sentence end after
    /// `history`.
    fn sentence_end_lm_score(&self, history: History) -> Score {
        let lexicon = self.network.lexicon();
        let mut history = history;
        let mut score = 0.0;
        for lemma in &self.context.suffix {
            if let Some(lemma) = lexicon.lemma(*lemma) {
                score += add_lemma_score(self.lm.as_ref(), &lemma.tokens, &mut history);
            }
        }
        score + self.lm.scale() * self.lm.sentence_end_score(history)
    }

    /// Best sentence end at `time`, or `None` when no word end may close
    /// the sentence. With a lattice the other candidates are its siblings.
    pub fn sentence_end(&mut self, time: TimeframeIndex, create_lattice: bool) -> Option<Arc<Trace>> {
        let lattice = self.context.lattice_mode.resolve(create_lattice);
        let forced_root = (!self.context.final_coarticulation.is_none())
            .then(|| self.root_for_coarticulation(self.context.final_coarticulation));
        let offset = self.global_score_offset;
        let network = Arc::clone(&self.network);

        let mut best: Option<Arc<Trace>> = None;
        for word_end in &self.word_ends {
            let accepted = match forced_root {
                Some(root) => word_end.transit_state == root,
                None => network.is_accepting(word_end.transit_state),
            };
            if !accepted {
                continue;
            }
            let mut score = word_end.score;
            score.acoustic += offset;
            score.lm += self.sentence_end_lm_score(word_end.history);
            let candidate = Arc::new(Trace::new(
                Some(Arc::clone(&word_end.trace)),
                TraceKind::Boundary,
                time,
                score,
                self.describe_root_state(word_end.transit_state),
            ));
            best = Some(keep_best(best, candidate, lattice));
        }

        let uncoarticulated = network.uncoarticulated_word_end_states();
        if !uncoarticulated.is_empty() {
            let encode = self.encode_state();
            let root_transit = self.describe_root_state(network.root_state());
            for instance in self.instances.iter_active() {
                for hyp in &self.state_hypotheses[instance.states.indices()] {
                    let accepted = match forced_root {
                        Some(root) => hyp.state == root,
                        None => uncoarticulated.contains(&hyp.state),
                    };
                    if !accepted {
                        continue;
                    }
                    let item = self.traces.item(hyp.trace);
                    let mut score = item.trace.score;
                    score.acoustic =
                        hyp.score + offset - score.lm - instance.total_back_off_offset;
                    let transit = if encode {
                        self.describe_root_state(hyp.state)
                    } else {
                        Transit::default()
                    };
                    let correction = Arc::new(Trace::new(
                        Some(Arc::clone(&item.trace)),
                        TraceKind::Epsilon,
                        time.saturating_sub(1),
                        score,
                        transit,
                    ));
                    score.lm += self.sentence_end_lm_score(item.history);
                    let candidate = Arc::new(Trace::new(
                        Some(correction),
                        TraceKind::Boundary,
                        time,
                        score,
                        root_transit,
                    ));
                    best = Some(keep_best(best, candidate, lattice));
                }
            }
        }

        self.had_word_end = best.is_some();
        best
    }

    /// Sentence end built from the best state hypothesis, for utterances
    /// that stop inside a word.
    pub fn sentence_end_fallback(
        &mut self,
        time: TimeframeIndex,
        create_lattice: bool,
    ) -> Option<Arc<Trace>> {
        if self.context.lattice_mode.resolve(create_lattice) {
            warn!("Lattice requested, but the sentence-end fallback does not create one");
        }
        info!("Using sentence-end fallback");

        let Some(best) = self
            .state_hypotheses
            .iter()
            .filter(|h| h.score.is_finite())
            .min_by(|a, b| a.score.total_cmp(&b.score))
            .copied()
        else {
            warn!(
                "Found no best state hypothesis among {}",
                self.state_hypotheses.len()
            );
            return None;
        };

        let item = self.traces.item(best.trace);
        let predecessor = Arc::clone(&item.trace);
        let mut score = predecessor.score;
        score.acoustic = self.global_score_offset + best.score - predecessor.score.lm;
        score.lm += self.sentence_end_lm_score(item.history);
        let trace = Arc::new(Trace::new(
            Some(predecessor),
            TraceKind::Boundary,
            time,
            score,
            self.describe_root_state(self.network.root_state()),
        ));
        self.statistics.sentence_end_fallbacks += 1;
        metrics::record_sentence_end_fallback();
        Some(trace)
    }
}
