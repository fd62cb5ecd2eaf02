//! In-memory back-off n-gram model.

use parking_lot::RwLock;
use rustc_hash::FxHashMap;

use super::{BackOffLanguageModel, LanguageModel};
use crate::error::{DecoderError, Result};
use crate::types::{History, Score, TokenId};

#[derive(Debug, Default)]
struct HistoryTable {
    contexts: Vec<Vec<TokenId>>,
    ids: FxHashMap<Vec<TokenId>, History>,
}

impl HistoryTable {
    fn intern(&mut self, context: Vec<TokenId>) -> History {
        if let Some(id) = self.ids.get(&context) {
            return *id;
        }
        let id = History(self.contexts.len() as u32);
        self.ids.insert(context.clone(), id);
        self.contexts.push(context);
        id
    }
}

/// Back-off n-gram model with explicit n-gram costs and back-off weights.
/// Histories are the last `order - 1` tokens and are interned on demand.
#[derive(Debug)]
pub struct NGramLm {
    order: usize,
    scale: f64,
    ngrams: FxHashMap<Vec<TokenId>, Score>,
    back_offs: FxHashMap<Vec<TokenId>, Score>,
    sentence_begin: Option<TokenId>,
    sentence_end: Option<TokenId>,
    unknown_score: Score,
    histories: RwLock<HistoryTable>,
}

#[derive(Debug)]
pub struct NGramLmBuilder {
    order: usize,
    scale: f64,
    ngrams: FxHashMap<Vec<TokenId>, Score>,
    back_offs: FxHashMap<Vec<TokenId>, Score>,
    sentence_begin: Option<TokenId>,
    sentence_end: Option<TokenId>,
    unknown_score: Score,
}

impl NGramLmBuilder {
    pub fn scale(mut self, scale: f64) -> Self {
        self.scale = scale;
        self
    }

    /// Token the start history is conditioned on.
    pub fn sentence_begin(mut self, token: TokenId) -> Self {
        self.sentence_begin = Some(token);
        self
    }

    /// Token scored by `sentence_end_score`.
    pub fn sentence_end(mut self, token: TokenId) -> Self {
        self.sentence_end = Some(token);
        self
    }

    /// Cost of a token without a unigram.
    pub fn unknown_score(mut self, score: Score) -> Self {
        self.unknown_score = score;
        self
    }

    /// Cost of the last token of `tokens` given the preceding ones.
    pub fn ngram(mut self, tokens: &[TokenId], score: Score) -> Self {
        self.ngrams.insert(tokens.to_vec(), score);
        self
    }

    /// Back-off weight of context `tokens`.
    pub fn back_off(mut self, context: &[TokenId], score: Score) -> Self {
        self.back_offs.insert(context.to_vec(), score);
        self
    }

    pub fn build(self) -> Result<NGramLm> {
        if self.order == 0 {
            return Err(DecoderError::LanguageModel("order must be at least 1".to_string()));
        }
        if !(self.scale > 0.0) {
            return Err(DecoderError::LanguageModel(format!(
                "scale must be positive, got {}",
                self.scale
            )));
        }
        if let Some(tokens) = self
            .ngrams
            .keys()
            .find(|t| t.is_empty() || t.len() > self.order)
        {
            return Err(DecoderError::LanguageModel(format!(
                "n-gram of length {} does not fit order {}",
                tokens.len(),
                self.order
            )));
        }
        if let Some(context) = self.back_offs.keys().find(|c| c.len() >= self.order) {
            return Err(DecoderError::LanguageModel(format!(
                "back-off context of length {} does not fit order {}",
                context.len(),
                self.order
            )));
        }

        let mut histories = HistoryTable::default();
        histories.intern(Vec::new());
        if let Some(token) = self.sentence_begin {
            if self.order > 1 {
                histories.intern(vec![token]);
            }
        }

        Ok(NGramLm {
            order: self.order,
            scale: self.scale,
            ngrams: self.ngrams,
            back_offs: self.back_offs,
            sentence_begin: self.sentence_begin,
            sentence_end: self.sentence_end,
            unknown_score: self.unknown_score,
            histories: RwLock::new(histories),
        })
    }
}

impl NGramLm {
    pub fn builder(order: usize) -> NGramLmBuilder {
        NGramLmBuilder {
            order,
            scale: 1.0,
            ngrams: FxHashMap::default(),
            back_offs: FxHashMap::default(),
            sentence_begin: None,
            sentence_end: None,
            unknown_score: 100.0,
        }
    }

    pub fn order(&self) -> usize {
        self.order
    }

    fn context(&self, history: History) -> Vec<TokenId> {
        self.histories
            .read()
            .contexts
            .get(history.index())
            .cloned()
            .unwrap_or_default()
    }

    fn intern(&self, context: Vec<TokenId>) -> History {
        if let Some(id) = self.histories.read().ids.get(&context) {
            return *id;
        }
        self.histories.write().intern(context)
    }

    fn context_score(&self, context: &[TokenId], token: TokenId) -> Score {
        let mut ngram = Vec::with_capacity(context.len() + 1);
        let mut back_off = 0.0;
        for start in 0..=context.len() {
            let suffix = &context[start..];
            ngram.clear();
            ngram.extend_from_slice(suffix);
            ngram.push(token);
            if let Some(score) = self.ngrams.get(&ngram) {
                return back_off + score;
            }
            back_off += self.back_offs.get(suffix).copied().unwrap_or(0.0);
        }
        back_off + self.unknown_score
    }
}

impl LanguageModel for NGramLm {
    fn start_history(&self) -> History {
        match self.sentence_begin {
            Some(token) if self.order > 1 => self.intern(vec![token]),
            _ => History(0),
        }
    }

    fn extended_history(&self, history: History, token: TokenId) -> History {
        let mut context = self.context(history);
        context.push(token);
        let keep = self.order - 1;
        if context.len() > keep {
            context.drain(..context.len() - keep);
        }
        self.intern(context)
    }

    fn reduced_history(&self, history: History, limit: usize) -> History {
        let mut context = self.context(history);
        if context.len() <= limit {
            return history;
        }
        context.drain(..context.len() - limit);
        self.intern(context)
    }

    fn history_length(&self, history: History) -> usize {
        self.histories
            .read()
            .contexts
            .get(history.index())
            .map_or(0, Vec::len)
    }

    fn score(&self, history: History, token: TokenId) -> Score {
        self.context_score(&self.context(history), token)
    }

    fn sentence_end_score(&self, history: History) -> Score {
        match self.sentence_end {
            Some(token) => self.score(history, token),
            None => 0.0,
        }
    }

    fn scale(&self) -> f64 {
        self.scale
    }

    fn as_back_off(&self) -> Option<&dyn BackOffLanguageModel> {
        Some(self)
    }
}

impl BackOffLanguageModel for NGramLm {
    fn back_off_score(&self, history: History) -> Score {
        let context = self.context(history);
        self.back_offs.get(&context).copied().unwrap_or(0.0)
    }

    fn has_explicit_ngram(&self, history: History, token: TokenId) -> bool {
        let mut ngram = self.context(history);
        ngram.push(token);
        self.ngrams.contains_key(&ngram)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const A: TokenId = TokenId(0);
    const B: TokenId = TokenId(1);
    const BEGIN: TokenId = TokenId(8);
    const END: TokenId = TokenId(9);

    fn trigram() -> NGramLm {
        NGramLm::builder(3)
            .sentence_begin(BEGIN)
            .sentence_end(END)
            .ngram(&[A], 1.0)
            .ngram(&[B], 2.0)
            .ngram(&[END], 3.0)
            .ngram(&[BEGIN, A], 0.5)
            .ngram(&[BEGIN, A, B], 0.1)
            .back_off(&[BEGIN], 0.2)
            .back_off(&[A], 0.3)
            .back_off(&[BEGIN, A], 0.4)
            .build()
            .unwrap()
    }

    #[test]
    fn test_back_off_scores() {
        let lm = trigram();
        let start = lm.start_history();
        assert_eq!(lm.history_length(start), 1);
        assert_eq!(lm.score(start, A), 0.5);
        // no [BEGIN, B]: back off to the unigram
        assert_eq!(lm.score(start, B), 0.2 + 2.0);

        let after_a = lm.extended_history(start, A);
        assert_eq!(lm.history_length(after_a), 2);
        assert_eq!(lm.score(after_a, B), 0.1);
        assert!((lm.score(after_a, A) - (0.4 + 0.3 + 1.0)).abs() < 1e-12);
        assert_eq!(lm.sentence_end_score(after_a), 0.4 + 0.3 + 3.0);
    }

    #[test]
    fn test_history_interning_and_reduction() {
        let lm = trigram();
        let start = lm.start_history();
        let h1 = lm.extended_history(start, A);
        let h2 = lm.extended_history(start, A);
        assert_eq!(h1, h2);

        let reduced = lm.reduced_history(h1, 1);
        assert_eq!(lm.history_length(reduced), 1);
        assert_eq!(lm.reduced_history(reduced, 4), reduced);
        assert_eq!(lm.history_length(lm.reduced_history(h1, 0)), 0);

        let back_off = lm.as_back_off().unwrap();
        assert!(back_off.has_explicit_ngram(h1, B));
        assert!(!back_off.has_explicit_ngram(h1, A));
        assert_eq!(back_off.back_off_score(h1), 0.4);
    }

    #[test]
    fn test_invalid_models_rejected() {
        assert!(NGramLm::builder(0).build().is_err());
        assert!(NGramLm::builder(2).scale(0.0).build().is_err());
        assert!(NGramLm::builder(1).ngram(&[A, B], 1.0).build().is_err());
    }
}
