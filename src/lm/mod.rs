//! Language model interface consumed by the search.
//!
//! Histories are opaque handles owned by the model. Scores returned by the
//! traits are unscaled costs; the search multiplies them with
//! [`LanguageModel::scale`].

pub mod lookahead;
pub mod ngram;

pub use lookahead::{ContextLookahead, LanguageModelLookahead, LookaheadStats};
pub use ngram::{NGramLm, NGramLmBuilder};

use crate::types::{History, Score, TokenId};

pub trait LanguageModel: Send + Sync {
    /// History at sentence begin.
    fn start_history(&self) -> History;

    fn extended_history(&self, history: History, token: TokenId) -> History;

    /// History truncated to at most `limit` most recent tokens.
    fn reduced_history(&self, history: History, limit: usize) -> History;

    /// Number of context tokens of `history`.
    fn history_length(&self, history: History) -> usize;

    fn score(&self, history: History, token: TokenId) -> Score;

    fn sentence_end_score(&self, history: History) -> Score;

    fn scale(&self) -> f64;

    /// Back-off capability, if the model has one.
    fn as_back_off(&self) -> Option<&dyn BackOffLanguageModel> {
        None
    }
}

pub trait BackOffLanguageModel: LanguageModel {
    /// Cost of backing off from `history` to the history one token shorter.
    fn back_off_score(&self, history: History) -> Score;

    /// Whether `token` has its own n-gram in context `history`.
    fn has_explicit_ngram(&self, history: History, token: TokenId) -> bool;

    /// Back-off cost accumulated while reducing `history` to `to_length` tokens.
    fn accumulated_back_off_score(&self, history: History, to_length: usize) -> Score {
        let mut score = 0.0;
        let mut current = history;
        let mut length = self.history_length(current);
        while length > to_length {
            score += self.back_off_score(current);
            current = self.reduced_history(current, length - 1);
            length -= 1;
        }
        score
    }
}

/// Scaled score of a token sequence. Extends `history` in place.
pub fn add_lemma_score(lm: &dyn LanguageModel, tokens: &[TokenId], history: &mut History) -> Score {
    let scale = lm.scale();
    let mut score = 0.0;
    for token in tokens {
        score += scale * lm.score(*history, *token);
        *history = lm.extended_history(*history, *token);
    }
    score
}

/// `history` extended by a token sequence.
pub fn extend_history(lm: &dyn LanguageModel, tokens: &[TokenId], history: History) -> History {
    tokens
        .iter()
        .fold(history, |h, token| lm.extended_history(h, *token))
}
