//! Audio recognition and multi-file alignment.
//!
//! Files are compared with one of three techniques: spectral-peak
//! fingerprints, raw waveform cross-correlation or per-band spectrogram
//! correlation. [`Engine`] runs them over batches of files and resolves
//! pairwise matches into per-file shifts.

pub mod align;
pub mod audio;
pub mod config;
pub mod corpus;
pub mod correlation;
pub mod db;
pub mod engine;
pub mod error;
pub mod filtering;
pub mod hashing;
pub mod matching;
pub mod peaks;
pub mod ranking;
pub mod recognizer;
pub mod results;
pub mod spectrogram;
pub mod visualize;
pub mod worker;

pub use align::{AlignOptions, MatchKey, Propagation, recalc_shifts};
pub use config::{CorrelationConfig, FingerprintConfig, HashStyle, Technique};
pub use corpus::Corpus;
pub use engine::Engine;
pub use error::{Error, Result};
pub use recognizer::Recognizer;
pub use results::{Alignment, FileMatch, Recognition};
