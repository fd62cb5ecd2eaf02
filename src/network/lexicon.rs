//! Lemmas and pronunciations referenced by network exits.

use rustc_hash::{FxHashMap, FxHashSet};
use serde::{Deserialize, Serialize};

use crate::types::{LemmaId, PhonemeId, PronunciationId, Score, TokenId};

/// A lexicon entry with the LM tokens it emits.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Lemma {
    /// Orthographic symbol.
    pub symbol: String,
    /// Syntactic token sequence scored by the language model. Empty for
    /// silence and noise lemmas.
    pub tokens: Vec<TokenId>,
}

/// One phonetic realization of a lemma.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Pronunciation {
    pub lemma: LemmaId,
    pub phonemes: Vec<PhonemeId>,
    /// Unscaled pronunciation score.
    pub score: Score,
}

#[derive(Debug, Clone, Default)]
pub struct Lexicon {
    lemmas: Vec<Lemma>,
    pronunciations: Vec<Pronunciation>,
    by_symbol: FxHashMap<String, LemmaId>,
    context_independent: FxHashSet<PhonemeId>,
    silence: Option<LemmaId>,
}

impl Lexicon {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_lemma(&mut self, symbol: impl Into<String>, tokens: Vec<TokenId>) -> LemmaId {
        let id = LemmaId(self.lemmas.len() as u32);
        let symbol = symbol.into();
        self.by_symbol.insert(symbol.clone(), id);
        self.lemmas.push(Lemma { symbol, tokens });
        id
    }

    pub fn add_pronunciation(
        &mut self,
        lemma: LemmaId,
        phonemes: Vec<PhonemeId>,
        score: Score,
    ) -> PronunciationId {
        let id = PronunciationId(self.pronunciations.len() as u32);
        self.pronunciations.push(Pronunciation {
            lemma,
            phonemes,
            score,
        });
        id
    }

    /// Mark the lemma removed by silence lattice optimization.
    pub fn set_silence(&mut self, lemma: LemmaId) {
        self.silence = Some(lemma);
    }

    pub fn silence(&self) -> Option<LemmaId> {
        self.silence
    }

    /// Mark a phoneme as context independent (no coarticulation across it).
    pub fn set_context_independent(&mut self, phoneme: PhonemeId) {
        self.context_independent.insert(phoneme);
    }

    pub fn is_context_dependent(&self, phoneme: PhonemeId) -> bool {
        !self.context_independent.contains(&phoneme)
    }

    pub fn lemma(&self, id: LemmaId) -> Option<&Lemma> {
        self.lemmas.get(id.index())
    }

    pub fn pronunciation(&self, id: PronunciationId) -> Option<&Pronunciation> {
        self.pronunciations.get(id.index())
    }

    /// Lemma behind a pronunciation.
    pub fn lemma_of(&self, id: PronunciationId) -> Option<&Lemma> {
        self.pronunciation(id).and_then(|p| self.lemma(p.lemma))
    }

    pub fn lemma_by_symbol(&self, symbol: &str) -> Option<LemmaId> {
        self.by_symbol.get(symbol).copied()
    }

    pub fn num_lemmas(&self) -> usize {
        self.lemmas.len()
    }

    pub fn num_pronunciations(&self) -> usize {
        self.pronunciations.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_lexicon_lookup() {
        let mut lexicon = Lexicon::new();
        let hello = lexicon.add_lemma("hello", vec![TokenId(3)]);
        let sil = lexicon.add_lemma("[SILENCE]", vec![]);
        lexicon.set_silence(sil);
        let pron = lexicon.add_pronunciation(hello, vec![PhonemeId(1), PhonemeId(2)], 0.25);

        assert_eq!(lexicon.lemma_by_symbol("hello"), Some(hello));
        assert_eq!(lexicon.lemma_of(pron).map(|l| l.symbol.as_str()), Some("hello"));
        assert_eq!(lexicon.silence(), Some(sil));
        assert!(lexicon.lemma(sil).unwrap().tokens.is_empty());
        assert!(lexicon.pronunciation(PronunciationId(9)).is_none());
    }

    #[test]
    fn test_context_dependency() {
        let mut lexicon = Lexicon::new();
        lexicon.set_context_independent(PhonemeId(0));
        assert!(!lexicon.is_context_dependent(PhonemeId(0)));
        assert!(lexicon.is_context_dependent(PhonemeId(1)));
    }
}
