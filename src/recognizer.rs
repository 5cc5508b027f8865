use std::collections::BTreeMap;
use std::path::Path;

use tracing::{debug, trace};

use crate::audio::{self, PcmSignal};
use crate::config::{
    CorrelationConfig, DEFAULT_FINE_MAX_LAGS, FingerprintConfig, StartEnd, Technique,
};
use crate::corpus::Corpus;
use crate::correlation;
use crate::error::Result;
use crate::hashing::{FingerprintTable, build_table, generate_hashes};
use crate::matching::{align_matches, find_matches, locality_frames};
use crate::peaks::find_peaks_2d;
use crate::results::FileMatch;
use crate::spectrogram::Spectrogram;

/// Which side of a comparison a file is read for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    Target,
    Against,
}

/// A recognition technique together with its parameters.
#[derive(Debug, Clone, PartialEq)]
pub enum Recognizer {
    Fingerprint(FingerprintConfig),
    Correlation(CorrelationConfig),
    CorrelationSpectrogram(CorrelationConfig),
}

impl Default for Recognizer {
    fn default() -> Self {
        Recognizer::Fingerprint(FingerprintConfig::default())
    }
}

impl From<Technique> for Recognizer {
    fn from(technique: Technique) -> Self {
        match technique {
            Technique::Fingerprints => Recognizer::Fingerprint(FingerprintConfig::default()),
            Technique::Correlation => Recognizer::Correlation(CorrelationConfig::default()),
            Technique::CorrelationSpectrogram => {
                Recognizer::CorrelationSpectrogram(CorrelationConfig::default())
            }
        }
    }
}

impl Recognizer {
    pub fn technique(&self) -> Technique {
        match self {
            Recognizer::Fingerprint(_) => Technique::Fingerprints,
            Recognizer::Correlation(_) => Technique::Correlation,
            Recognizer::CorrelationSpectrogram(_) => Technique::CorrelationSpectrogram,
        }
    }

    pub fn sample_rate(&self) -> u32 {
        match self {
            Recognizer::Fingerprint(config) => config.sample_rate,
            Recognizer::Correlation(config) | Recognizer::CorrelationSpectrogram(config) => {
                config.sample_rate
            }
        }
    }

    pub fn uses_locality(&self) -> bool {
        match self {
            Recognizer::Fingerprint(config) => config.locality.is_some(),
            Recognizer::Correlation(config) | Recognizer::CorrelationSpectrogram(config) => {
                config.locality.is_some()
            }
        }
    }

    pub fn validate(&self) -> Result<()> {
        match self {
            Recognizer::Fingerprint(config) => config.validate(),
            Recognizer::Correlation(config) | Recognizer::CorrelationSpectrogram(config) => {
                config.validate()
            }
        }
    }

    /// Fingerprint `start_end` applies to targets only.
    pub fn start_end(&self, role: Role) -> Option<StartEnd> {
        match (self, role) {
            (Recognizer::Fingerprint(config), Role::Target) => config.start_end,
            (Recognizer::Fingerprint(_), Role::Against) => None,
            (Recognizer::Correlation(c) | Recognizer::CorrelationSpectrogram(c), Role::Target) => {
                c.start_end_target
            }
            (Recognizer::Correlation(c) | Recognizer::CorrelationSpectrogram(c), Role::Against) => {
                c.start_end_against
            }
        }
    }

    /// Decodes `path` at this recognizer's rate with the `start_end` of `role`.
    pub fn read(&self, path: &Path, role: Role) -> Result<PcmSignal> {
        audio::read(path, self.sample_rate(), self.start_end(role))
    }

    /// Copy used for fine alignment: correlation searches are bounded by
    /// [`DEFAULT_FINE_MAX_LAGS`] unless already bounded.
    pub fn for_fine_alignment(&self) -> Recognizer {
        let mut fine = self.clone();
        if let Recognizer::Correlation(config) | Recognizer::CorrelationSpectrogram(config) =
            &mut fine
        {
            if config.max_lags.is_none() {
                config.max_lags = Some(DEFAULT_FINE_MAX_LAGS);
            }
        }
        fine
    }

    /// Compares two decoded signals; `None` when nothing clears the filter.
    pub fn compare(&self, target: &PcmSignal, against: &PcmSignal) -> Result<Option<FileMatch>> {
        match self {
            Recognizer::Fingerprint(config) => {
                const AGAINST: &str = "against";
                let mut corpus = Corpus::new();
                corpus.insert(AGAINST, fingerprint_signal(against, config));
                let target = fingerprint_signal(target, config);
                Ok(match_table("", &target, &corpus, config).remove(AGAINST))
            }
            Recognizer::Correlation(config) => correlation::correlate(target, against, config),
            Recognizer::CorrelationSpectrogram(config) => {
                Ok(correlation::correlate_spectrogram(target, against, config))
            }
        }
    }
}

/// Spectrogram, peaks, hashes: the fingerprint table of one signal.
pub fn fingerprint_signal(signal: &PcmSignal, config: &FingerprintConfig) -> FingerprintTable {
    let spectrogram = Spectrogram::compute(
        &signal.samples,
        config.sample_rate,
        config.window_size,
        config.overlap_ratio,
    );
    let rows = spectrogram.thresholded(config.freq_threshold);
    let peaks = find_peaks_2d(
        &rows,
        config.peak_neighborhood_size,
        config.amp_min,
        config.peak_sort,
    );
    trace!(peaks = peaks.len(), frames = spectrogram.num_frames(), "Found peaks");
    let table = build_table(generate_hashes(&peaks, config));
    debug!(hashes = table.len(), "Fingerprinted signal");
    table
}

/// Matches a fingerprint table against every corpus file except `name`.
pub fn match_table(
    name: &str,
    table: &FingerprintTable,
    corpus: &Corpus,
    config: &FingerprintConfig,
) -> BTreeMap<String, FileMatch> {
    let histograms = find_matches(table, corpus, name, locality_frames(config));
    align_matches(&histograms, config)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn chirps(seconds: f64, sample_rate: u32, seed: u64) -> Vec<i16> {
        let len = (seconds * sample_rate as f64) as usize;
        let mut state = seed;
        let mut samples = Vec::with_capacity(len);
        let segment = sample_rate as usize / 5;
        let mut freq = 440.0;
        for i in 0..len {
            if i % segment == 0 {
                state = state
                    .wrapping_mul(6364136223846793005)
                    .wrapping_add(1442695040888963407);
                freq = 300.0 + ((state >> 33) % 3000) as f64;
            }
            let t = i as f64 / sample_rate as f64;
            samples.push(((2.0 * std::f64::consts::PI * freq * t).sin() * 12000.0) as i16);
        }
        samples
    }

    #[test]
    fn technique_round_trip() {
        for technique in [
            Technique::Fingerprints,
            Technique::Correlation,
            Technique::CorrelationSpectrogram,
        ] {
            assert_eq!(Recognizer::from(technique).technique(), technique);
        }
    }

    #[test]
    fn fine_alignment_bounds_correlation_lags() {
        let fine = Recognizer::from(Technique::Correlation).for_fine_alignment();
        let Recognizer::Correlation(config) = fine else {
            panic!("technique changed");
        };
        assert_eq!(config.max_lags, Some(DEFAULT_FINE_MAX_LAGS));

        let mut bounded = CorrelationConfig::default();
        bounded.max_lags = Some(0.5);
        let Recognizer::CorrelationSpectrogram(config) =
            Recognizer::CorrelationSpectrogram(bounded).for_fine_alignment()
        else {
            panic!("technique changed");
        };
        assert_eq!(config.max_lags, Some(0.5));
    }

    #[test]
    fn start_end_roles() {
        let config = FingerprintConfig {
            start_end: Some((1.0, 2.0)),
            ..Default::default()
        };
        let recognizer = Recognizer::Fingerprint(config);
        assert_eq!(recognizer.start_end(Role::Target), Some((1.0, 2.0)));
        assert_eq!(recognizer.start_end(Role::Against), None);
    }

    #[test]
    fn fingerprint_compare_finds_offset() {
        let config = FingerprintConfig {
            sample_rate: 8000,
            window_size: 1024,
            ..Default::default()
        };
        let sr = config.sample_rate;
        let long = chirps(12.0, sr, 7);
        // Frame-aligned so both spectrograms share a grid.
        let start = 64 * config.hop_size();
        let clip = long[start..start + 5 * sr as usize].to_vec();

        let recognizer = Recognizer::Fingerprint(config.clone());
        let fm = recognizer
            .compare(&PcmSignal::new(clip, sr), &PcmSignal::new(long, sr))
            .unwrap()
            .expect("clip should match");
        let frame = config.frames_to_seconds(1);
        let expected = start as f64 / sr as f64;
        assert!((fm.offset_seconds[0] - expected).abs() <= frame);
    }

    #[test]
    fn fingerprint_signal_is_deterministic() {
        let config = FingerprintConfig {
            sample_rate: 8000,
            window_size: 1024,
            ..Default::default()
        };
        let signal = PcmSignal::new(chirps(3.0, 8000, 3), 8000);
        let a = fingerprint_signal(&signal, &config);
        let b = fingerprint_signal(&signal, &config);
        assert!(!a.is_empty());
        assert_eq!(a, b);
    }
}
