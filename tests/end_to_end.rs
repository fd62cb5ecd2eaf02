//! Decodes small synthetic utterances through the public API.

use std::io::Write;
use std::sync::Arc;

use tempfile::Builder;
use tree_search::lm::LanguageModel;
use tree_search::types::{MixtureId, PhonemeId, Score, TokenId};
use tree_search::{
    Decoder, DecoderError, NGramLm, NetworkBuilder, SearchConfig, SearchNetwork, TransitionModel,
    WordLattice,
};

const FRAMES: u32 = 20;

/// Root (mixture 0) with three two-state words. Word `k` uses mixtures
/// `2k + 1` and `2k + 2`; every word exit returns to the root.
fn network() -> SearchNetwork {
    let mut b = NetworkBuilder::new();
    let tm = b.add_transition_model(TransitionModel::default());
    let root = b.add_state(MixtureId(0), tm);
    b.set_root_state(root);
    for (k, symbol) in ["A", "B", "C"].iter().enumerate() {
        let first = b.add_state(MixtureId(2 * k as u32 + 1), tm);
        let second = b.add_state(MixtureId(2 * k as u32 + 2), tm);
        b.add_successor(root, first).add_successor(first, second);
        let lemma = b
            .lexicon_mut()
            .add_lemma(*symbol, vec![TokenId(k as u32 + 1)]);
        let phone = PhonemeId(k as u16 + 1);
        let pron = b.lexicon_mut().add_pronunciation(lemma, vec![phone, phone], 0.0);
        b.add_exit(second, Some(pron), root);
    }
    b.build().unwrap()
}

fn unigram() -> Arc<dyn LanguageModel> {
    Arc::new(
        NGramLm::builder(1)
            .sentence_end(TokenId(0))
            .ngram(&[TokenId(0)], 0.5)
            .ngram(&[TokenId(1)], 1.0)
            .ngram(&[TokenId(2)], 1.0)
            .ngram(&[TokenId(3)], 1.0)
            .build()
            .unwrap(),
    )
}

fn config() -> SearchConfig {
    let mut config = SearchConfig::default();
    config.pruning.beam_pruning = 12.0;
    config.pruning.word_end_pruning = Some(0.7);
    config
}

fn decoder(config: SearchConfig) -> Decoder {
    Decoder::new(config, Arc::new(network()), unigram(), None).unwrap()
}

/// Frames 0-6 match `A`, 7-13 match `B` and 14-19 match `C`.
fn frame(t: u32) -> Vec<Score> {
    let word = (t / 7) as usize;
    let mut scores = vec![5.0; 7];
    scores[2 * word + 1] = 0.0;
    scores[2 * word + 2] = 0.0;
    scores
}

fn decode(decoder: &mut Decoder) -> tree_search::Recognition {
    for t in 0..FRAMES {
        decoder.feed(&frame(t));
    }
    decoder.finish().unwrap()
}

#[test]
fn test_recognizes_word_sequence() {
    let mut decoder = decoder(config());
    let recognition = decode(&mut decoder);

    assert!(!recognition.used_fallback);
    let lexicon = decoder.search_space().network().lexicon();
    assert_eq!(recognition.symbols(lexicon), vec!["A", "B", "C"]);
    let times: Vec<u32> = recognition.words.iter().map(|w| w.time).collect();
    assert_eq!(times, vec![7, 14, 20]);
    assert!(recognition.score.acoustic.abs() < 1e-9);
    assert!((recognition.score.lm - 3.5).abs() < 1e-9);
    assert_eq!(decoder.statistics().frames, u64::from(FRAMES));
}

#[test]
fn test_restart_decodes_again() {
    let mut decoder = decoder(config());
    let first = decode(&mut decoder);
    decoder.restart();
    let second = decode(&mut decoder);
    assert_eq!(first.words, second.words);
    assert_eq!(first.score, second.score);
}

#[test]
fn test_partial_utterance_uses_fallback() {
    let mut decoder = decoder(config());
    decoder.feed(&frame(0));
    let recognition = decoder.finish().unwrap();
    assert!(recognition.used_fallback);
    assert!(recognition.words.is_empty());
}

#[test]
fn test_unscorable_frame_empties_search_space() {
    let mut decoder = decoder(config());
    decoder.feed(&vec![Score::INFINITY; 7]);
    assert!(matches!(decoder.finish(), Err(DecoderError::EmptySearchSpace)));
}

#[test]
fn test_lattice_best_path_matches_recognition() {
    let mut config = config();
    config.create_lattice = true;
    let mut decoder = decoder(config);
    let recognition = decode(&mut decoder);

    let lattice = WordLattice::from_trace(&recognition.trace);
    assert!(lattice.arcs.len() >= 3);
    assert!((lattice.best_path_score() - recognition.score.total()).abs() < 1e-6);
    assert!(lattice.to_json().unwrap().contains("arcs"));
}

#[test]
fn test_partial_result_during_decoding() {
    let mut decoder = decoder(config());
    for t in 0..10 {
        decoder.feed(&frame(t));
    }
    let prefix = decoder.common_prefix().unwrap();
    assert!(prefix.time <= 10);
}

#[test]
fn test_decode_with_config_file() -> anyhow::Result<()> {
    let mut file = Builder::new().suffix(".toml").tempfile()?;
    writeln!(
        file,
        "cleanup_interval = 3\n[pruning]\nbeam_pruning = 12.0\nword_end_pruning = 0.7\n[lookahead]\nenabled = false\n"
    )?;
    let config = SearchConfig::from_file(file.path())?;
    assert!(!config.lookahead.enabled);

    let mut decoder = decoder(config);
    let recognition = decode(&mut decoder);
    let lexicon = decoder.search_space().network().lexicon();
    assert_eq!(recognition.symbols(lexicon), vec!["A", "B", "C"]);
    Ok(())
}
