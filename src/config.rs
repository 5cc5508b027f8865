use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::error::{Error, Result};

// Spectrogram Parameters
pub const DEFAULT_FS: u32 = 44100;
pub const DEFAULT_WINDOW_SIZE: usize = 4096;
pub const DEFAULT_OVERLAP_RATIO: f64 = 0.5;

// Peak Finding Parameters
pub const DEFAULT_AMP_MIN: f64 = 14.0;
pub const PEAK_NEIGHBORHOOD_SIZE: usize = 20;
pub const PEAK_SORT: bool = true;
pub const DEFAULT_FREQ_THRESHOLD: f64 = 200.0;

// Hashing Parameters
pub const DEFAULT_FAN_VALUE: usize = 15;
pub const MIN_HASH_TIME_DELTA: usize = 10;
pub const MAX_HASH_TIME_DELTA: usize = 200;
pub const FINGERPRINT_REDUCTION: usize = 20;

// Matching Parameters
pub const DEFAULT_FILTER_MATCHES: usize = 1;
pub const DEFAULT_MATCH_LEN_FILTER: usize = 30;
pub const DEFAULT_LOCALITY_FILTER_PROP: f64 = 0.6;

// Correlation Parameters
pub const DEFAULT_CORRELATION_FS: u32 = 8000;
pub const DEFAULT_CORRELATION_FREQ_THRESHOLD: f64 = 100.0;
pub const DEFAULT_CORRELATION_WINDOW_SIZE: usize = 512;
pub const DEFAULT_CORRELATION_LOCALITY_FILTER_PROP: f64 = 0.5;
pub const CORRELATION_SCALE: f64 = 1e-3;
pub const BUTTERWORTH_ORDER: usize = 10;

// Alignment Parameters
pub const DEFAULT_FINE_MAX_LAGS: f64 = 2.0;

/// Accuracy presets: (fan_value, amp_min, min_hash_time_delta, max_hash_time_delta).
/// Level 4 needs several GB of memory on typical file lengths.
const ACCURACY_PRESETS: [(usize, f64, usize, usize); 4] = [
    (15, 16.0, 10, 200),
    (15, 14.0, 10, 200),
    (30, 14.0, 5, 200),
    (60, 12.0, 2, 250),
];

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HashStyle {
    /// Peak pairs on (f1, f2, Δt).
    Base,
    /// Peak triples on frequency differences and a time ratio.
    PanakoMod,
    /// `PanakoMod` plus each peak's frequency band.
    Panako,
    /// Peak triples on raw frequencies and time deltas.
    BaseThree,
}

impl HashStyle {
    pub const ALL: [HashStyle; 4] = [
        HashStyle::Base,
        HashStyle::PanakoMod,
        HashStyle::Panako,
        HashStyle::BaseThree,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            HashStyle::Base => "base",
            HashStyle::PanakoMod => "panako_mod",
            HashStyle::Panako => "panako",
            HashStyle::BaseThree => "base_three",
        }
    }
}

impl fmt::Display for HashStyle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for HashStyle {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        HashStyle::ALL
            .into_iter()
            .find(|style| style.as_str() == s)
            .ok_or_else(|| {
                Error::Config(format!(
                    "invalid hash style '{s}', expected one of base, panako_mod, panako, base_three"
                ))
            })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Technique {
    Fingerprints,
    Correlation,
    CorrelationSpectrogram,
}

impl Technique {
    pub fn as_str(&self) -> &'static str {
        match self {
            Technique::Fingerprints => "fingerprints",
            Technique::Correlation => "correlation",
            Technique::CorrelationSpectrogram => "correlation_spectrogram",
        }
    }
}

impl fmt::Display for Technique {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Technique {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "fingerprints" => Ok(Technique::Fingerprints),
            "correlation" => Ok(Technique::Correlation),
            "correlation_spectrogram" => Ok(Technique::CorrelationSpectrogram),
            "visual" => Err(Error::Config(
                "the visual technique is not supported".to_string(),
            )),
            other => Err(Error::Config(format!("invalid technique '{other}'"))),
        }
    }
}

/// `(start, end)` silencing in seconds; see [`crate::audio::read`].
pub type StartEnd = (f64, f64);

/// Parameters for the fingerprinting recognizer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FingerprintConfig {
    pub sample_rate: u32,
    pub window_size: usize,
    pub overlap_ratio: f64,
    pub fan_value: usize,
    pub amp_min: f64,
    pub peak_neighborhood_size: usize,
    pub min_hash_time_delta: usize,
    pub max_hash_time_delta: usize,
    pub peak_sort: bool,
    pub fingerprint_reduction: usize,
    pub freq_threshold: f64,
    pub hash_style: HashStyle,
    /// `None` starts at [`DEFAULT_FILTER_MATCHES`] and lowers itself until
    /// something matches. `Some` pins the threshold.
    pub filter_matches: Option<usize>,
    pub match_len_filter: usize,
    /// Locality window in seconds.
    pub locality: Option<f64>,
    pub locality_filter_prop: f64,
    pub start_end: Option<StartEnd>,
}

impl Default for FingerprintConfig {
    fn default() -> Self {
        Self {
            sample_rate: DEFAULT_FS,
            window_size: DEFAULT_WINDOW_SIZE,
            overlap_ratio: DEFAULT_OVERLAP_RATIO,
            fan_value: DEFAULT_FAN_VALUE,
            amp_min: DEFAULT_AMP_MIN,
            peak_neighborhood_size: PEAK_NEIGHBORHOOD_SIZE,
            min_hash_time_delta: MIN_HASH_TIME_DELTA,
            max_hash_time_delta: MAX_HASH_TIME_DELTA,
            peak_sort: PEAK_SORT,
            fingerprint_reduction: FINGERPRINT_REDUCTION,
            freq_threshold: DEFAULT_FREQ_THRESHOLD,
            hash_style: HashStyle::PanakoMod,
            filter_matches: None,
            match_len_filter: DEFAULT_MATCH_LEN_FILTER,
            locality: None,
            locality_filter_prop: DEFAULT_LOCALITY_FILTER_PROP,
            start_end: None,
        }
    }
}

impl FingerprintConfig {
    pub fn with_accuracy(mut self, accuracy: u8) -> Result<Self> {
        self.set_accuracy(accuracy)?;
        Ok(self)
    }

    /// Applies one of the four accuracy presets.
    pub fn set_accuracy(&mut self, accuracy: u8) -> Result<()> {
        let (fan_value, amp_min, min_delta, max_delta) = *ACCURACY_PRESETS
            .get(usize::from(accuracy).wrapping_sub(1))
            .ok_or_else(|| {
                Error::Config(format!("accuracy must be between 1 and 4, got {accuracy}"))
            })?;
        self.fan_value = fan_value;
        self.amp_min = amp_min;
        self.min_hash_time_delta = min_delta;
        self.max_hash_time_delta = max_delta;
        Ok(())
    }

    /// Unknown names are logged and leave the current style in place.
    pub fn set_hash_style(&mut self, style: &str) {
        match style.parse() {
            Ok(style) => self.hash_style = style,
            Err(e) => warn!("{e}; keeping hash style {}", self.hash_style),
        }
    }

    pub fn hop_size(&self) -> usize {
        hop_size(self.window_size, self.overlap_ratio)
    }

    pub fn frames_to_seconds(&self, frames: i64) -> f64 {
        frames as f64 * self.hop_size() as f64 / self.sample_rate as f64
    }

    pub fn validate(&self) -> Result<()> {
        if self.sample_rate == 0 {
            return Err(Error::Config("sample rate must be > 0".into()));
        }
        validate_window(self.window_size, self.overlap_ratio)?;
        if self.fan_value < 2 {
            return Err(Error::Config("fan value must be at least 2".into()));
        }
        if self.min_hash_time_delta > self.max_hash_time_delta {
            return Err(Error::Config(
                "min_hash_time_delta must not exceed max_hash_time_delta".into(),
            ));
        }
        if self.fingerprint_reduction == 0 || self.fingerprint_reduction > 40 {
            return Err(Error::Config(
                "fingerprint reduction must be between 1 and 40 hex characters".into(),
            ));
        }
        validate_locality(self.locality, self.locality_filter_prop)
    }
}

/// Parameters shared by the raw and spectrogram correlation recognizers.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CorrelationConfig {
    pub sample_rate: u32,
    /// High-pass cutoff for raw correlation and the zeroed band for
    /// spectrogram correlation, in Hz.
    pub freq_threshold: f64,
    /// Minimum scaled peak height.
    pub filter_matches: f64,
    pub match_len_filter: usize,
    pub locality: Option<f64>,
    pub locality_filter_prop: f64,
    /// Maximum absolute offset searched, in seconds.
    pub max_lags: Option<f64>,
    pub window_size: usize,
    pub overlap_ratio: f64,
    pub start_end_target: Option<StartEnd>,
    pub start_end_against: Option<StartEnd>,
}

impl Default for CorrelationConfig {
    fn default() -> Self {
        Self {
            sample_rate: DEFAULT_CORRELATION_FS,
            freq_threshold: DEFAULT_CORRELATION_FREQ_THRESHOLD,
            filter_matches: 0.0,
            match_len_filter: DEFAULT_MATCH_LEN_FILTER,
            locality: None,
            locality_filter_prop: DEFAULT_CORRELATION_LOCALITY_FILTER_PROP,
            max_lags: None,
            window_size: DEFAULT_CORRELATION_WINDOW_SIZE,
            overlap_ratio: DEFAULT_OVERLAP_RATIO,
            start_end_target: None,
            start_end_against: None,
        }
    }
}

impl CorrelationConfig {
    pub fn hop_size(&self) -> usize {
        hop_size(self.window_size, self.overlap_ratio)
    }

    pub fn max_lag_samples(&self) -> Option<usize> {
        self.max_lags
            .map(|secs| (secs.max(0.0) * self.sample_rate as f64).round() as usize)
    }

    pub fn validate(&self) -> Result<()> {
        if self.sample_rate == 0 {
            return Err(Error::Config("sample rate must be > 0".into()));
        }
        if self.freq_threshold < 0.0 || self.freq_threshold >= self.sample_rate as f64 / 2.0 {
            return Err(Error::Config(format!(
                "frequency threshold {} Hz must be below Nyquist ({} Hz)",
                self.freq_threshold,
                self.sample_rate / 2
            )));
        }
        validate_window(self.window_size, self.overlap_ratio)?;
        validate_locality(self.locality, self.locality_filter_prop)
    }
}

pub fn hop_size(window_size: usize, overlap_ratio: f64) -> usize {
    let noverlap = (window_size as f64 * overlap_ratio).round() as usize;
    window_size.saturating_sub(noverlap).max(1)
}

fn validate_window(window_size: usize, overlap_ratio: f64) -> Result<()> {
    if window_size < 2 {
        return Err(Error::Config("window size must be at least 2".into()));
    }
    if !(0.0..1.0).contains(&overlap_ratio) {
        return Err(Error::Config(format!(
            "overlap ratio must be in [0, 1), got {overlap_ratio}"
        )));
    }
    Ok(())
}

fn validate_locality(locality: Option<f64>, prop: f64) -> Result<()> {
    if let Some(secs) = locality {
        if secs <= 0.0 {
            return Err(Error::Config(format!("locality must be positive, got {secs}")));
        }
    }
    if !(0.0..=1.0).contains(&prop) {
        return Err(Error::Config(format!(
            "locality_filter_prop must be in [0, 1], got {prop}"
        )));
    }
    Ok(())
}
