//! Output shapes for recognitions and alignments.

use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::error::Result;
use crate::filtering::Candidate;

/// One sub-match inside a locality window pair.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LocalityMatch {
    pub target_seconds: f64,
    pub against_seconds: f64,
    pub confidence: f64,
}

/// Statistics for one matched file. Every list is co-indexed and sorted by
/// descending confidence.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FileMatch {
    pub confidence: Vec<f64>,
    pub offset_seconds: Vec<f64>,
    pub offset_samples: Vec<i64>,
    pub locality_seconds: Option<Vec<Vec<LocalityMatch>>>,
    pub sample_rate: u32,
    pub scaling_factor: Option<f64>,
}

impl FileMatch {
    /// Builds the bundle from ranked candidates; `None` when empty.
    pub fn from_candidates(
        candidates: Vec<Candidate>,
        sample_rate: u32,
        scaling_factor: Option<f64>,
        with_locality: bool,
    ) -> Option<Self> {
        if candidates.is_empty() {
            return None;
        }
        let mut file_match = FileMatch {
            confidence: Vec::with_capacity(candidates.len()),
            offset_seconds: Vec::with_capacity(candidates.len()),
            offset_samples: Vec::with_capacity(candidates.len()),
            locality_seconds: with_locality.then(Vec::new),
            sample_rate,
            scaling_factor,
        };
        for candidate in candidates {
            file_match.confidence.push(candidate.strength);
            file_match
                .offset_seconds
                .push(candidate.offset_samples as f64 / sample_rate as f64);
            file_match.offset_samples.push(candidate.offset_samples);
            if let Some(localities) = file_match.locality_seconds.as_mut() {
                localities.push(candidate.localities);
            }
        }
        Some(file_match)
    }

    pub fn len(&self) -> usize {
        self.confidence.len()
    }

    pub fn is_empty(&self) -> bool {
        self.confidence.is_empty()
    }

    pub fn best_confidence(&self) -> f64 {
        self.confidence.first().copied().unwrap_or(0.0)
    }

    pub fn best_offset_seconds(&self) -> Option<f64> {
        self.offset_seconds.first().copied()
    }

    pub fn is_consistent(&self) -> bool {
        let n = self.confidence.len();
        self.offset_seconds.len() == n
            && self.offset_samples.len() == n
            && self.locality_seconds.as_ref().is_none_or(|l| l.len() == n)
    }
}

/// Result of recognizing one target against a set of files.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct Recognition {
    pub match_time: f64,
    pub match_info: BTreeMap<String, FileMatch>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub rankings: BTreeMap<String, u8>,
}

pub type MatchInfo = BTreeMap<String, Recognition>;
pub type RankTable = BTreeMap<String, BTreeMap<String, u8>>;

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct Rankings {
    pub match_info: RankTable,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub fine_match_info: Option<RankTable>,
}

/// Per-file shift in seconds plus everything needed to recompute it.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct Alignment {
    #[serde(flatten)]
    pub shifts: BTreeMap<String, f64>,
    pub match_info: MatchInfo,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub fine_match_info: Option<MatchInfo>,
    pub names_and_paths: BTreeMap<String, PathBuf>,
    pub rankings: Rankings,
}

pub fn write_json<T: Serialize>(value: &T, path: &Path) -> Result<()> {
    fs::write(path, serde_json::to_string_pretty(value)?)?;
    Ok(())
}
