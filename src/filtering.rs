//! Post-processing shared by every recognizer: ranking, top-K, locality
//! pruning and confidence scaling.

use std::collections::BTreeMap;

use crate::config::CORRELATION_SCALE;
use crate::results::LocalityMatch;

/// A candidate offset of the target inside the matched file.
#[derive(Debug, Clone, PartialEq)]
pub struct Candidate {
    pub offset_samples: i64,
    pub strength: f64,
    pub localities: Vec<LocalityMatch>,
}

/// Sorts by descending strength; ties go to the smaller offset.
pub fn rank(candidates: &mut [Candidate]) {
    candidates.sort_by(|a, b| {
        b.strength
            .total_cmp(&a.strength)
            .then(a.offset_samples.cmp(&b.offset_samples))
    });
}

pub fn top_k(mut candidates: Vec<Candidate>, k: usize) -> Vec<Candidate> {
    rank(&mut candidates);
    candidates.truncate(k);
    candidates
}

/// Groups sub-matches by implied global offset. Each offset takes the
/// strength of its best sub-match.
pub fn merge_by_offset(
    sub_matches: impl IntoIterator<Item = (i64, LocalityMatch)>,
) -> Vec<Candidate> {
    let mut grouped: BTreeMap<i64, Vec<LocalityMatch>> = BTreeMap::new();
    for (offset, sub_match) in sub_matches {
        grouped.entry(offset).or_default().push(sub_match);
    }
    grouped
        .into_iter()
        .map(|(offset_samples, localities)| Candidate {
            offset_samples,
            strength: localities
                .iter()
                .map(|l| l.confidence)
                .fold(f64::NEG_INFINITY, f64::max),
            localities,
        })
        .collect()
}

/// Keeps offsets within `prop` of the best offset's strength, and within
/// each offset the sub-matches within `prop` of its own best.
pub fn filter_locality(candidates: Vec<Candidate>, prop: f64) -> Vec<Candidate> {
    let best = candidates
        .iter()
        .map(|c| c.strength)
        .fold(f64::NEG_INFINITY, f64::max);

    candidates
        .into_iter()
        .filter(|c| c.strength >= best * prop)
        .map(|mut c| {
            c.localities
                .sort_by(|a, b| b.confidence.total_cmp(&a.confidence));
            let top = c.localities.first().map_or(0.0, |l| l.confidence);
            c.localities.retain(|l| l.confidence >= top * prop);
            c
        })
        .collect()
}

/// Correlation height normalized by signal length.
pub fn scale_height(height: f64, signal_len: usize) -> f64 {
    height / signal_len.max(1) as f64 / CORRELATION_SCALE
}

/// Reported alongside correlation results: the scaled global maximum.
pub fn scaling_factor(max_height: f64, signal_len: usize) -> f64 {
    scale_height(max_height, signal_len)
}
