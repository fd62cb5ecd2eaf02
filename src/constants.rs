//! Centralized constants for the tree search decoder.
//!
//! Values here are defaults seeded into [`crate::config::SearchConfig`] or
//! fixed parameters of the search with no runtime knob.

/// Pruning defaults
pub mod pruning {
    /// Default beam, relative to the language model scale
    pub const DEFAULT_BEAM_PRUNING: f64 = 12.0;

    /// Default maximum number of state hypotheses after histogram pruning
    pub const DEFAULT_BEAM_PRUNING_LIMIT: u32 = 500_000;

    /// Default maximum number of word-end hypotheses after histogram pruning
    pub const DEFAULT_WORD_END_PRUNING_LIMIT: u32 = 50_000;

    /// Default number of bins of the pruning histograms
    pub const DEFAULT_HISTOGRAM_BINS: usize = 100;

    /// Frames an empty instance survives before it is deleted
    pub const DEFAULT_INSTANCE_DELETION_LATENCY: u32 = 3;

    /// Threshold values at or below this are relative to the parent threshold
    pub const RELATIVE_THRESHOLD_LIMIT: f64 = 1.0;
}

/// Look-ahead defaults
pub mod lookahead {
    /// Default number of cached look-ahead tables
    pub const DEFAULT_CACHE_SIZE: usize = 500;

    /// Minimum live states before an instance gets a full-order table
    pub const DEFAULT_STATE_MINIMUM: u32 = 0;

    /// Fraction of all live states an instance must hold for a full-order table
    pub const DEFAULT_DOMINANCE_MINIMUM: f64 = 0.0;
}

/// Search bookkeeping
pub mod search {
    /// Frames between two trace garbage collections
    pub const DEFAULT_CLEANUP_INTERVAL: u32 = 10;

    /// Pronunciation phonemes compared when recombining in mesh mode
    pub const DEFAULT_MESH_HISTORY_PHONES: usize = 1;

    /// Environment variable prefix for configuration overrides
    pub const ENV_PREFIX: &str = "TREE_SEARCH_";

    /// Configuration file names read by `SearchConfig::load`
    pub const CONFIG_TOML: &str = "search.toml";
    pub const CONFIG_YAML: &str = "search.yaml";
}

/// Adaptive pruning bounds
pub mod auto_correction {
    /// Smallest beam the controller may tighten to
    pub const DEFAULT_MINIMUM_BEAM_PRUNING: f64 = 0.1;

    /// Largest beam the controller may relax to
    pub const DEFAULT_MAXIMUM_BEAM_PRUNING: f64 = 1000.0;

    /// Smallest histogram limit in histogram-is-master mode
    pub const DEFAULT_MINIMUM_ACOUSTIC_PRUNING_LIMIT: u32 = 10;

    /// Largest histogram limit in histogram-is-master mode
    pub const DEFAULT_MAXIMUM_ACOUSTIC_PRUNING_LIMIT: u32 = 10_000_000;
}
