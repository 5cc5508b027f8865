mod common;

use common::{chord_sequence, embed, write_wav};
use echoalign::config::FingerprintConfig;
use echoalign::{Engine, Recognizer};

const RATE: u32 = 22050;

fn config() -> FingerprintConfig {
    FingerprintConfig {
        sample_rate: RATE,
        window_size: 2048,
        ..Default::default()
    }
}

fn fingerprinted_engine(dir: &std::path::Path) -> Engine {
    let original = chord_sequence(6.0, RATE, 11);
    write_wav(&dir.join("original.wav"), &original, RATE);
    write_wav(&dir.join("padded.wav"), &embed(&original, RATE as usize, 0), RATE);
    let mut engine = Engine::new(Some(2));
    engine.fingerprint_directory(dir, &config()).unwrap();
    engine
}

#[test]
fn corpus_survives_json_and_sqlite() {
    let dir = tempfile::tempdir().unwrap();
    let engine = fingerprinted_engine(dir.path());
    assert_eq!(engine.corpus().len(), 2);

    for file in ["corpus.json", "corpus.db"] {
        let path = dir.path().join(file);
        engine.save_fingerprints(&path).unwrap();

        let mut restored = Engine::new(Some(1));
        assert_eq!(restored.load_fingerprints(&path).unwrap(), 2);
        assert_eq!(restored.corpus(), engine.corpus(), "{file}");

        // Loading the same corpus again adds nothing.
        assert_eq!(restored.load_fingerprints(&path).unwrap(), 0);
        assert_eq!(
            restored.corpus().total_fingerprints(),
            engine.corpus().total_fingerprints()
        );
    }
}

#[test]
fn loaded_corpus_recognizes_like_the_original() {
    let dir = tempfile::tempdir().unwrap();
    let mut engine = fingerprinted_engine(dir.path());
    let path = dir.path().join("corpus.db");
    engine.save_fingerprints(&path).unwrap();

    let target = dir.path().join("original.wav");
    let recognizer = Recognizer::Fingerprint(config());
    let before = engine.recognize(&target, None, &recognizer).unwrap().unwrap();

    let mut restored = Engine::new(Some(1));
    restored.load_fingerprints(&path).unwrap();
    let after = restored.recognize(&target, None, &recognizer).unwrap().unwrap();

    assert_eq!(before.match_info, after.match_info);
    assert_eq!(after.match_info.keys().collect::<Vec<_>>(), ["padded.wav"]);
}

#[test]
fn unknown_extension_is_a_config_error() {
    let dir = tempfile::tempdir().unwrap();
    let engine = Engine::new(Some(1));
    let result = engine.save_fingerprints(&dir.path().join("corpus.xml"));
    assert!(matches!(result, Err(echoalign::Error::Config(_))));
}
