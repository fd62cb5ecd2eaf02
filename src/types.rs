//! Strong typing with newtypes for domain concepts.
//!
//! Hot index arithmetic (states, frames, scores) uses plain aliases; every
//! identifier that crosses a module boundary gets its own newtype so that a
//! pronunciation id can never be passed where a lemma id is expected.

use serde::{Deserialize, Serialize};
use std::ops::{Add, AddAssign, Sub};

/// Accumulated negative log score.
pub type Score = f64;

/// Network state index. State 0 is invalid.
pub type StateId = u32;

/// Frame index.
pub type TimeframeIndex = u32;

/// The invalid network state.
pub const INVALID_STATE: StateId = 0;

macro_rules! id_newtype {
    ($(#[$meta:meta])* $name:ident($inner:ty), $prefix:literal) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
        pub struct $name(pub $inner);

        impl $name {
            /// Create a new id.
            pub fn new(value: $inner) -> Self {
                Self(value)
            }

            /// Get the raw id value.
            pub fn value(self) -> $inner {
                self.0
            }

            /// Raw id as a vector index.
            pub fn index(self) -> usize {
                self.0 as usize
            }
        }

        impl std::fmt::Display for $name {
            fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
                write!(f, concat!($prefix, "{}"), self.0)
            }
        }
    };
}

id_newtype!(
    /// Handle into the trace indirection table.
    TraceId(u32),
    "trace#"
);
id_newtype!(
    /// Lexicon pronunciation.
    PronunciationId(u32),
    "pron#"
);
id_newtype!(
    /// Lexicon lemma.
    LemmaId(u32),
    "lemma#"
);
id_newtype!(
    /// Phoneme inventory entry.
    PhonemeId(u16),
    "phon#"
);
id_newtype!(
    /// Emission model (mixture) scored by the acoustic scorer.
    MixtureId(u32),
    "mix#"
);
id_newtype!(
    /// Language model token.
    TokenId(u32),
    "tok#"
);
id_newtype!(
    /// Word-end label of the search network.
    ExitId(u32),
    "exit#"
);
id_newtype!(
    /// Slot of a tree instance inside the instance arena.
    InstanceId(u32),
    "inst#"
);
id_newtype!(
    /// Opaque language model history handle.
    History(u32),
    "hist#"
);

/// Score split into acoustic and language model parts.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct ScoreVector {
    /// Acoustic (and transition) part.
    pub acoustic: Score,
    /// Scaled language model part.
    pub lm: Score,
}

impl ScoreVector {
    /// Create a new score vector.
    pub fn new(acoustic: Score, lm: Score) -> Self {
        Self { acoustic, lm }
    }

    /// Combined score.
    pub fn total(&self) -> Score {
        self.acoustic + self.lm
    }
}

impl Add for ScoreVector {
    type Output = ScoreVector;

    fn add(self, rhs: ScoreVector) -> ScoreVector {
        ScoreVector::new(self.acoustic + rhs.acoustic, self.lm + rhs.lm)
    }
}

impl AddAssign for ScoreVector {
    fn add_assign(&mut self, rhs: ScoreVector) {
        self.acoustic += rhs.acoustic;
        self.lm += rhs.lm;
    }
}

impl Sub for ScoreVector {
    type Output = ScoreVector;

    fn sub(self, rhs: ScoreVector) -> ScoreVector {
        ScoreVector::new(self.acoustic - rhs.acoustic, self.lm - rhs.lm)
    }
}

impl std::fmt::Display for ScoreVector {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:.3} (am {:.3}, lm {:.3})", self.total(), self.acoustic, self.lm)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_id_newtypes() {
        let id = PronunciationId::new(4);
        assert_eq!(id.value(), 4);
        assert_eq!(id.index(), 4);
        assert_eq!(id.to_string(), "pron#4");
        assert!(ExitId(1) < ExitId(2));
    }

    #[test]
    fn test_score_vector_arithmetic() {
        let a = ScoreVector::new(2.0, 1.5);
        let b = ScoreVector::new(0.5, 0.5);
        assert_eq!((a + b).total(), 4.5);
        assert_eq!((a - b), ScoreVector::new(1.5, 1.0));

        let mut c = a;
        c += b;
        assert_eq!(c.acoustic, 2.5);
    }
}
