//! The `tree_search` core library.
//!
//! This crate provides a time-synchronous beam search over a compiled
//! lexical prefix tree for large-vocabulary speech recognition. Tree
//! instances are kept per language-model history, scored with LM
//! look-ahead, and pruned by beam, histogram and LM-state criteria.
//! Recognized words are stored as shared trace chains that can be read as
//! a best path or as a word lattice.

pub mod acoustic;
pub mod config;
pub mod constants;
pub mod decoder;
pub mod error;
pub mod lm;
pub mod network;
pub mod observability;
pub mod search;
pub mod trace;
pub mod types;

pub use acoustic::{AcousticLookahead, FrameScorer};
pub use config::SearchConfig;
pub use decoder::{Decoder, Recognition};
pub use error::{DecoderError, Result};
pub use lm::{LanguageModel, NGramLm};
pub use network::{Lexicon, NetworkBuilder, SearchNetwork, TransitionModel};
pub use search::{PruningDescription, RecognitionContext, SearchSpace};
pub use trace::{Trace, WordLattice};
