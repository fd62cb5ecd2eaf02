//! Per-utterance recognition context.

use serde::{Deserialize, Serialize};

use crate::network::Coarticulation;
use crate::types::LemmaId;

/// Overrides the configured lattice generation for one utterance.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum LatticeMode {
    #[default]
    Configured,
    Yes,
    No,
}

impl LatticeMode {
    pub fn resolve(self, configured: bool) -> bool {
        match self {
            LatticeMode::Configured => configured,
            LatticeMode::Yes => true,
            LatticeMode::No => false,
        }
    }
}

/// Known words around the decoded segment, used for partial decoding.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RecognitionContext {
    /// Lemmas the utterance is conditioned on.
    pub prefix: Vec<LemmaId>,
    /// Lemmas scored after the last word at sentence end.
    pub suffix: Vec<LemmaId>,
    /// Context the first word starts in.
    pub coarticulation: Coarticulation,
    /// Context the last word must end in.
    pub final_coarticulation: Coarticulation,
    pub lattice_mode: LatticeMode,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_lattice_mode_overrides() {
        assert!(LatticeMode::Configured.resolve(true));
        assert!(!LatticeMode::No.resolve(true));
        assert!(LatticeMode::Yes.resolve(false));
        assert_eq!(RecognitionContext::default().lattice_mode, LatticeMode::Configured);
    }
}
