//! Decoder configuration.
//!
//! [`SearchConfig`] is loaded from layered sources with `figment`: built-in
//! defaults, `search.toml`, `search.yaml` and `TREE_SEARCH_` prefixed
//! environment variables (nested keys separated by `__`, e.g.
//! `TREE_SEARCH_PRUNING__BEAM_PRUNING=10`).

use std::fs;
use std::io;
use std::path::Path;

use figment::{
    providers::{Env, Format, Serialized, Toml, Yaml},
    Figment,
};
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::constants::{auto_correction, lookahead, pruning, search};
use crate::error::{ConfigError, Result};

// Default value functions for serde defaults
fn default_beam_pruning() -> f64 { pruning::DEFAULT_BEAM_PRUNING }
fn default_beam_pruning_limit() -> u32 { pruning::DEFAULT_BEAM_PRUNING_LIMIT }
fn default_word_end_pruning_limit() -> u32 { pruning::DEFAULT_WORD_END_PRUNING_LIMIT }
fn default_histogram_bins() -> usize { pruning::DEFAULT_HISTOGRAM_BINS }
fn default_instance_deletion_latency() -> u32 { pruning::DEFAULT_INSTANCE_DELETION_LATENCY }
fn default_cache_size() -> usize { lookahead::DEFAULT_CACHE_SIZE }
fn default_state_minimum() -> u32 { lookahead::DEFAULT_STATE_MINIMUM }
fn default_dominance_minimum() -> f64 { lookahead::DEFAULT_DOMINANCE_MINIMUM }
fn default_cleanup_interval() -> u32 { search::DEFAULT_CLEANUP_INTERVAL }
fn default_mesh_history_phones() -> usize { search::DEFAULT_MESH_HISTORY_PHONES }
fn default_minimum_beam_pruning() -> f64 { auto_correction::DEFAULT_MINIMUM_BEAM_PRUNING }
fn default_maximum_beam_pruning() -> f64 { auto_correction::DEFAULT_MAXIMUM_BEAM_PRUNING }
fn default_minimum_acoustic_pruning_limit() -> u32 { auto_correction::DEFAULT_MINIMUM_ACOUSTIC_PRUNING_LIMIT }
fn default_maximum_acoustic_pruning_limit() -> u32 { auto_correction::DEFAULT_MAXIMUM_ACOUSTIC_PRUNING_LIMIT }
fn default_maximum_saturation() -> f64 { 1.0 }
fn default_maximum_after_pruning() -> f64 { 1.0e9 }
fn default_log_level() -> String { "info".to_string() }
fn default_true() -> bool { true }
fn default_one() -> f64 { 1.0 }

/// Pruning thresholds as configured. Derived absolute thresholds live in
/// [`crate::search::thresholds::PruningThresholds`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PruningConfig {
    /// Beam relative to the LM scale
    #[serde(default = "default_beam_pruning")]
    pub beam_pruning: f64,

    /// Maximum number of state hypotheses
    #[serde(default = "default_beam_pruning_limit")]
    pub beam_pruning_limit: u32,

    /// Word-end beam. `<= 1` is relative to the beam, `> 1` is relative to the LM scale
    #[serde(default)]
    pub word_end_pruning: Option<f64>,

    /// Maximum number of word-end hypotheses
    #[serde(default = "default_word_end_pruning_limit")]
    pub word_end_pruning_limit: u32,

    /// Per-state beam. `<= 1` is relative to the word-end beam
    #[serde(default)]
    pub lm_state_pruning: Option<f64>,

    /// Beam within one word-initial phoneme group. `<= 1` is relative to the word-end beam
    #[serde(default)]
    pub word_end_phoneme_pruning: Option<f64>,

    /// Prune before acoustic scores are added
    #[serde(default = "default_true")]
    pub early_beam_pruning: bool,

    /// Reject word ends while scanning instead of afterwards
    #[serde(default = "default_true")]
    pub early_word_end_pruning: bool,

    /// Safety margin for early word-end pruning
    #[serde(default)]
    pub early_word_end_pruning_anticipated_lm_score: f64,

    /// Bins of the state histogram
    #[serde(default = "default_histogram_bins")]
    pub state_histogram_bins: usize,

    /// Bins of the word-end histogram
    #[serde(default = "default_histogram_bins")]
    pub word_end_histogram_bins: usize,

    /// Empty frames before an instance is deleted
    #[serde(default = "default_instance_deletion_latency")]
    pub instance_deletion_latency: u32,

    /// The adaptive controller scales the histogram limit instead of the beam
    #[serde(default)]
    pub histogram_pruning_is_master: bool,
}

impl Default for PruningConfig {
    fn default() -> Self {
        Self {
            beam_pruning: default_beam_pruning(),
            beam_pruning_limit: default_beam_pruning_limit(),
            word_end_pruning: None,
            word_end_pruning_limit: default_word_end_pruning_limit(),
            lm_state_pruning: None,
            word_end_phoneme_pruning: None,
            early_beam_pruning: true,
            early_word_end_pruning: true,
            early_word_end_pruning_anticipated_lm_score: 0.0,
            state_histogram_bins: default_histogram_bins(),
            word_end_histogram_bins: default_histogram_bins(),
            instance_deletion_latency: default_instance_deletion_latency(),
            histogram_pruning_is_master: false,
        }
    }
}

/// Language model look-ahead.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LookaheadConfig {
    /// Enable LM look-ahead
    #[serde(default = "default_true")]
    pub enabled: bool,

    /// Build sparse tables for back-off histories
    #[serde(default)]
    pub sparse: bool,

    /// Look-ahead history length limit (unlimited when unset)
    #[serde(default)]
    pub history_limit: Option<usize>,

    /// Live states an instance needs before it gets a full-order table
    #[serde(default = "default_state_minimum")]
    pub state_minimum: u32,

    /// Fraction of all live states an instance needs before it gets a full-order table
    #[serde(default = "default_dominance_minimum")]
    pub dominance_minimum: f64,

    /// Look-ahead node depth, relative to the root, from which a full-order table is forced
    #[serde(default)]
    pub full_lookahead_depth: Option<u32>,

    /// Use a zero unigram table
    #[serde(default)]
    pub disable_unigram_lookahead: bool,

    /// Weight of the accumulated back-off score added to unigram prospects
    #[serde(default)]
    pub unigram_back_off_factor: f64,

    /// Number of cached tables
    #[serde(default = "default_cache_size")]
    pub cache_size: usize,
}

impl Default for LookaheadConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            sparse: false,
            history_limit: None,
            state_minimum: default_state_minimum(),
            dominance_minimum: default_dominance_minimum(),
            full_lookahead_depth: None,
            disable_unigram_lookahead: false,
            unigram_back_off_factor: 0.0,
            cache_size: default_cache_size(),
        }
    }
}

/// Bounds of the adaptive pruning controller.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AutoCorrectionConfig {
    #[serde(default = "default_minimum_beam_pruning")]
    pub minimum_beam_pruning: f64,
    #[serde(default = "default_maximum_beam_pruning")]
    pub maximum_beam_pruning: f64,
    #[serde(default = "default_minimum_acoustic_pruning_limit")]
    pub minimum_acoustic_pruning_limit: u32,
    #[serde(default = "default_maximum_acoustic_pruning_limit")]
    pub maximum_acoustic_pruning_limit: u32,
    #[serde(default)]
    pub minimum_states_after_pruning: f64,
    #[serde(default)]
    pub minimum_word_ends_after_pruning: f64,
    #[serde(default)]
    pub minimum_word_lemmas_after_recombination: f64,
    #[serde(default = "default_maximum_after_pruning")]
    pub maximum_states_after_pruning: f64,
    #[serde(default = "default_maximum_after_pruning")]
    pub maximum_word_ends_after_pruning: f64,
    #[serde(default = "default_maximum_saturation")]
    pub maximum_acoustic_pruning_saturation: f64,
}

impl Default for AutoCorrectionConfig {
    fn default() -> Self {
        Self {
            minimum_beam_pruning: default_minimum_beam_pruning(),
            maximum_beam_pruning: default_maximum_beam_pruning(),
            minimum_acoustic_pruning_limit: default_minimum_acoustic_pruning_limit(),
            maximum_acoustic_pruning_limit: default_maximum_acoustic_pruning_limit(),
            minimum_states_after_pruning: 0.0,
            minimum_word_ends_after_pruning: 0.0,
            minimum_word_lemmas_after_recombination: 0.0,
            maximum_states_after_pruning: default_maximum_after_pruning(),
            maximum_word_ends_after_pruning: default_maximum_after_pruning(),
            maximum_acoustic_pruning_saturation: default_maximum_saturation(),
        }
    }
}

/// Logging setup consumed by [`crate::observability::init_tracing`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TracingConfig {
    /// Log level filter used when `RUST_LOG` is unset
    #[serde(default = "default_log_level")]
    pub log_level: String,

    /// Emit JSON lines instead of the compact format
    #[serde(default)]
    pub json: bool,

    /// Include the event target
    #[serde(default = "default_true")]
    pub with_target: bool,
}

impl Default for TracingConfig {
    fn default() -> Self {
        Self {
            log_level: default_log_level(),
            json: false,
            with_target: true,
        }
    }
}

/// Complete decoder configuration loaded from multiple sources
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SearchConfig {
    #[serde(default)]
    pub pruning: PruningConfig,

    #[serde(default)]
    pub lookahead: LookaheadConfig,

    #[serde(default)]
    pub auto_correction: AutoCorrectionConfig,

    #[serde(default)]
    pub tracing: TracingConfig,

    /// Allow HMM skip transitions
    #[serde(default = "default_true")]
    pub allow_skips: bool,

    /// Forbid skips on root depths so pushed boundaries stay aligned
    #[serde(default)]
    pub symmetrize_penalties: bool,

    /// Discard hypotheses on sparse look-ahead misses instead of transferring them
    #[serde(default)]
    pub early_back_off: bool,

    /// Key instances by the predecessor word as well as by the history
    #[serde(default)]
    pub condition_predecessor_word: bool,

    /// Correct word boundary times on minimized networks
    #[serde(default = "default_true")]
    pub correct_pushed_boundary_times: bool,

    /// Also correct the acoustic score at pushed boundaries
    #[serde(default = "default_true")]
    pub correct_pushed_acoustic_scores: bool,

    /// Move clamped negative per-word LM scores into the acoustic part
    #[serde(default)]
    pub overflow_lm_score_to_am: bool,

    /// Encode the network state in traces when no lattice is built
    #[serde(default)]
    pub encode_state_in_trace: bool,

    /// Always encode the network state in traces
    #[serde(default)]
    pub encode_state_in_trace_always: bool,

    /// Build word lattices through sibling traces
    #[serde(default)]
    pub create_lattice: bool,

    /// Recombine word ends by pronunciation suffix instead of history
    #[serde(default)]
    pub decode_mesh: bool,

    /// Pronunciation suffix length compared in mesh recombination
    #[serde(default = "default_mesh_history_phones")]
    pub mesh_history_phones: usize,

    /// Remove silence siblings from the lattice every frame
    #[serde(default)]
    pub optimize_lattice: bool,

    /// Scale of pronunciation scores
    #[serde(default = "default_one")]
    pub pronunciation_scale: f64,

    /// Frames between trace garbage collections
    #[serde(default = "default_cleanup_interval")]
    pub cleanup_interval: u32,
}

impl Default for SearchConfig {
    fn default() -> Self {
        Self {
            pruning: PruningConfig::default(),
            lookahead: LookaheadConfig::default(),
            auto_correction: AutoCorrectionConfig::default(),
            tracing: TracingConfig::default(),
            allow_skips: true,
            symmetrize_penalties: false,
            early_back_off: false,
            condition_predecessor_word: false,
            correct_pushed_boundary_times: true,
            correct_pushed_acoustic_scores: true,
            overflow_lm_score_to_am: false,
            encode_state_in_trace: false,
            encode_state_in_trace_always: false,
            create_lattice: false,
            decode_mesh: false,
            mesh_history_phones: default_mesh_history_phones(),
            optimize_lattice: false,
            pronunciation_scale: default_one(),
            cleanup_interval: default_cleanup_interval(),
        }
    }
}

impl SearchConfig {
    /// Load configuration from multiple sources with precedence:
    /// 1. Environment variables (highest priority)
    /// 2. search.yaml (if exists)
    /// 3. search.toml (if exists)
    /// 4. Built-in defaults (lowest priority)
    pub fn load() -> Result<Self> {
        Self::extract(
            Self::default_figment()
                .merge(Toml::file(search::CONFIG_TOML))
                .merge(Yaml::file(search::CONFIG_YAML))
                .merge(Env::prefixed(search::ENV_PREFIX).split("__")),
        )
    }

    /// Load one TOML or YAML file over the built-in defaults. A file that
    /// cannot be read is reported as [`crate::DecoderError::Io`].
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let contents = fs::read_to_string(path).map_err(|e| {
            let context = format!("reading search configuration {}: {}", path.display(), e);
            io::Error::new(e.kind(), context)
        })?;
        let figment = match path.extension().and_then(|e| e.to_str()) {
            Some("yaml") | Some("yml") => Self::default_figment().merge(Yaml::string(&contents)),
            _ => Self::default_figment().merge(Toml::string(&contents)),
        };
        debug!("Loading search configuration from {:?}", path);
        Self::extract(figment)
    }

    fn default_figment() -> Figment {
        Figment::from(Serialized::defaults(SearchConfig::default()))
    }

    fn extract(figment: Figment) -> Result<Self> {
        let config: SearchConfig = figment
            .extract()
            .map_err(|e| ConfigError::Load(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Validate configuration values
    pub fn validate(&self) -> Result<()> {
        let p = &self.pruning;
        if !(p.beam_pruning > 0.0) {
            return Err(ConfigError::OutOfRange {
                name: "beam_pruning",
                value: p.beam_pruning,
                expected: "> 0",
            }
            .into());
        }
        if p.beam_pruning_limit == 0 {
            return Err(ConfigError::OutOfRange {
                name: "beam_pruning_limit",
                value: 0.0,
                expected: ">= 1",
            }
            .into());
        }
        if p.word_end_pruning_limit == 0 {
            return Err(ConfigError::OutOfRange {
                name: "word_end_pruning_limit",
                value: 0.0,
                expected: ">= 1",
            }
            .into());
        }
        for (name, value) in [
            ("word_end_pruning", p.word_end_pruning),
            ("lm_state_pruning", p.lm_state_pruning),
            ("word_end_phoneme_pruning", p.word_end_phoneme_pruning),
        ] {
            if let Some(value) = value {
                if !(value > 0.0) {
                    return Err(ConfigError::OutOfRange {
                        name,
                        value,
                        expected: "> 0",
                    }
                    .into());
                }
            }
        }
        if p.state_histogram_bins < 2 || p.word_end_histogram_bins < 2 {
            return Err(ConfigError::OutOfRange {
                name: "histogram_bins",
                value: p.state_histogram_bins.min(p.word_end_histogram_bins) as f64,
                expected: ">= 2",
            }
            .into());
        }

        let la = &self.lookahead;
        if !(0.0..=1.0).contains(&la.dominance_minimum) {
            return Err(ConfigError::OutOfRange {
                name: "lookahead.dominance_minimum",
                value: la.dominance_minimum,
                expected: "0..=1",
            }
            .into());
        }
        if la.unigram_back_off_factor < 0.0 {
            return Err(ConfigError::OutOfRange {
                name: "lookahead.unigram_back_off_factor",
                value: la.unigram_back_off_factor,
                expected: ">= 0",
            }
            .into());
        }

        let ac = &self.auto_correction;
        if ac.minimum_beam_pruning > ac.maximum_beam_pruning {
            return Err(ConfigError::Conflict(format!(
                "minimum_beam_pruning {} exceeds maximum_beam_pruning {}",
                ac.minimum_beam_pruning, ac.maximum_beam_pruning
            ))
            .into());
        }
        if ac.minimum_acoustic_pruning_limit > ac.maximum_acoustic_pruning_limit {
            return Err(ConfigError::Conflict(format!(
                "minimum_acoustic_pruning_limit {} exceeds maximum_acoustic_pruning_limit {}",
                ac.minimum_acoustic_pruning_limit, ac.maximum_acoustic_pruning_limit
            ))
            .into());
        }

        if self.decode_mesh && self.mesh_history_phones == 0 {
            return Err(ConfigError::OutOfRange {
                name: "mesh_history_phones",
                value: 0.0,
                expected: ">= 1",
            }
            .into());
        }
        if self.cleanup_interval == 0 {
            return Err(ConfigError::OutOfRange {
                name: "cleanup_interval",
                value: 0.0,
                expected: ">= 1",
            }
            .into());
        }

        Ok(())
    }

    /// Export configuration to TOML format
    pub fn to_toml(&self) -> Result<String> {
        toml::to_string_pretty(self).map_err(|e| ConfigError::Serialize(e.to_string()).into())
    }

    /// Export configuration to YAML format
    pub fn to_yaml(&self) -> Result<String> {
        serde_yaml::to_string(self).map_err(|e| ConfigError::Serialize(e.to_string()).into())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::DecoderError;
    use std::io::Write;
    use tempfile::Builder;

    #[test]
    fn test_defaults_are_valid() {
        let config = SearchConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.pruning.beam_pruning, 12.0);
        assert!(config.lookahead.enabled);
    }

    #[test]
    fn test_from_toml_file() {
        let mut file = Builder::new().suffix(".toml").tempfile().unwrap();
        writeln!(
            file,
            "create_lattice = true\n[pruning]\nbeam_pruning = 8.5\nword_end_pruning = 0.7\n"
        )
        .unwrap();

        let config = SearchConfig::from_file(file.path()).unwrap();
        assert_eq!(config.pruning.beam_pruning, 8.5);
        assert_eq!(config.pruning.word_end_pruning, Some(0.7));
        assert!(config.create_lattice);
        // untouched fields keep defaults
        assert_eq!(config.cleanup_interval, search::DEFAULT_CLEANUP_INTERVAL);
    }

    #[test]
    fn test_from_yaml_file() {
        let mut file = Builder::new().suffix(".yaml").tempfile().unwrap();
        writeln!(file, "lookahead:\n  sparse: true\n  cache_size: 16\n").unwrap();

        let config = SearchConfig::from_file(file.path()).unwrap();
        assert!(config.lookahead.sparse);
        assert_eq!(config.lookahead.cache_size, 16);
    }

    #[test]
    fn test_missing_file_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let err = SearchConfig::from_file(dir.path().join("absent.toml")).unwrap_err();
        assert!(matches!(&err, DecoderError::Io(e) if e.kind() == io::ErrorKind::NotFound));
        assert!(err.to_string().contains("absent.toml"));
    }

    #[test]
    fn test_invalid_beam_rejected() {
        let mut file = Builder::new().suffix(".toml").tempfile().unwrap();
        writeln!(file, "[pruning]\nbeam_pruning = -3.0\n").unwrap();
        assert!(SearchConfig::from_file(file.path()).is_err());
    }

    #[test]
    fn test_conflicting_bounds_rejected() {
        let mut config = SearchConfig::default();
        config.auto_correction.minimum_beam_pruning = 50.0;
        config.auto_correction.maximum_beam_pruning = 10.0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_export_round_trip() {
        let mut config = SearchConfig::default();
        config.pruning.lm_state_pruning = Some(0.5);

        let toml = config.to_toml().unwrap();
        let parsed: SearchConfig = toml::from_str(&toml).unwrap();
        assert_eq!(parsed, config);

        let yaml = config.to_yaml().unwrap();
        assert!(yaml.contains("lm_state_pruning"));
    }
}
