use std::collections::{BTreeMap, HashMap};

use tracing::{debug, info};

use crate::config::{DEFAULT_FILTER_MATCHES, FingerprintConfig};
use crate::corpus::Corpus;
use crate::filtering::{Candidate, filter_locality, top_k};
use crate::hashing::FingerprintTable;
use crate::results::{FileMatch, LocalityMatch};

/// Hash collisions counted for one frame offset.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct OffsetTally {
    pub count: usize,
    /// Collisions per target locality window, when locality is enabled.
    pub windows: BTreeMap<usize, usize>,
}

/// `corpus_frame - target_frame` -> collisions.
pub type OffsetHistogram = HashMap<i64, OffsetTally>;

/// Builds an offset histogram for every corpus file except `exclude`.
///
/// Every colliding hash contributes the full product of target and corpus
/// offsets.
pub fn find_matches(
    target: &FingerprintTable,
    corpus: &Corpus,
    exclude: &str,
    locality_frames: Option<usize>,
) -> BTreeMap<String, OffsetHistogram> {
    let mut histograms = BTreeMap::new();

    for (name, table) in corpus.iter() {
        if name == exclude {
            debug!(file = %name, "Skipping self match");
            continue;
        }
        let mut histogram = OffsetHistogram::new();
        for (hash, target_offsets) in target {
            let Some(corpus_offsets) = table.get(hash) else {
                continue;
            };
            for &t in target_offsets {
                for &c in corpus_offsets {
                    let tally = histogram.entry(c as i64 - t as i64).or_default();
                    tally.count += 1;
                    if let Some(frames) = locality_frames {
                        *tally.windows.entry(t / frames.max(1)).or_default() += 1;
                    }
                }
            }
        }
        if !histogram.is_empty() {
            histograms.insert(name.to_string(), histogram);
        }
    }
    histograms
}

/// Locality window length in frames, at least one.
pub fn locality_frames(config: &FingerprintConfig) -> Option<usize> {
    config.locality.map(|secs| {
        ((secs * config.sample_rate as f64 / config.hop_size() as f64).round() as usize).max(1)
    })
}

fn candidates(
    histogram: &OffsetHistogram,
    config: &FingerprintConfig,
    locality_frames: Option<usize>,
) -> Vec<Candidate> {
    let hop = config.hop_size() as i64;
    let mut candidates: Vec<Candidate> = histogram
        .iter()
        .map(|(&diff, tally)| match locality_frames {
            None => Candidate {
                offset_samples: diff * hop,
                strength: tally.count as f64,
                localities: Vec::new(),
            },
            Some(frames) => {
                let localities: Vec<LocalityMatch> = tally
                    .windows
                    .iter()
                    .map(|(&window, &count)| {
                        let start = (window * frames) as i64;
                        LocalityMatch {
                            target_seconds: config.frames_to_seconds(start),
                            against_seconds: config.frames_to_seconds(start + diff),
                            confidence: count as f64,
                        }
                    })
                    .collect();
                Candidate {
                    offset_samples: diff * hop,
                    strength: localities
                        .iter()
                        .map(|l| l.confidence)
                        .fold(0.0, f64::max),
                    localities,
                }
            }
        })
        .collect();

    if locality_frames.is_some() {
        candidates = filter_locality(candidates, config.locality_filter_prop);
    }
    top_k(candidates, config.match_len_filter)
}

/// Turns histograms into per-file matches above the filter.
///
/// Unless `config.filter_matches` pins the threshold, it starts at
/// [`DEFAULT_FILTER_MATCHES`] and steps down to 0 while nothing clears it.
pub fn align_matches(
    histograms: &BTreeMap<String, OffsetHistogram>,
    config: &FingerprintConfig,
) -> BTreeMap<String, FileMatch> {
    let locality = locality_frames(config);
    let ranked: Vec<(&String, Vec<Candidate>)> = histograms
        .iter()
        .map(|(name, histogram)| (name, candidates(histogram, config, locality)))
        .collect();

    let pinned = config.filter_matches;
    let mut threshold = pinned.unwrap_or(DEFAULT_FILTER_MATCHES);
    loop {
        let matches: BTreeMap<String, FileMatch> = ranked
            .iter()
            .filter_map(|(name, candidates)| {
                let kept: Vec<Candidate> = candidates
                    .iter()
                    .filter(|c| c.strength > threshold as f64)
                    .cloned()
                    .collect();
                FileMatch::from_candidates(kept, config.sample_rate, None, locality.is_some())
                    .map(|fm| ((*name).clone(), fm))
            })
            .collect();

        if !matches.is_empty() || pinned.is_some() || threshold == 0 {
            if matches.is_empty() {
                info!(threshold, "No fingerprint matches cleared the filter");
            }
            return matches;
        }
        threshold -= 1;
        debug!(threshold, "Nothing cleared the filter, lowering it");
    }
}
