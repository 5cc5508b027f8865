//! Heuristic 1-10 confidence ranking of matches.
//!
//! The base rank is one plus the number of thresholds the best confidence
//! clears, so every technique and locality setting gets its own table.
//! Adjustments reward a single unambiguous offset or a runner-up offset that
//! agrees with the best one, and penalize a third candidate that is nearly
//! as strong as the best.

use std::collections::BTreeMap;

use crate::config::Technique;
use crate::results::{FileMatch, MatchInfo, RankTable, Recognition};

const FINGERPRINT_THRESHOLDS: [f64; 9] = [2.0, 4.0, 6.0, 10.0, 15.0, 25.0, 40.0, 60.0, 100.0];
const FINGERPRINT_LOCALITY_THRESHOLDS: [f64; 9] =
    [2.0, 3.0, 5.0, 8.0, 12.0, 18.0, 25.0, 35.0, 50.0];
const CORRELATION_THRESHOLDS: [f64; 9] = [1.0, 2.0, 4.0, 7.0, 10.0, 15.0, 20.0, 30.0, 45.0];
const CORRELATION_LOCALITY_THRESHOLDS: [f64; 9] = [0.5, 1.0, 2.0, 3.5, 5.0, 7.5, 10.0, 15.0, 22.0];
const SPECTROGRAM_THRESHOLDS: [f64; 9] = [
    10.0, 25.0, 50.0, 100.0, 150.0, 250.0, 400.0, 600.0, 800.0,
];
const SPECTROGRAM_LOCALITY_THRESHOLDS: [f64; 9] = [
    5.0, 12.0, 25.0, 50.0, 80.0, 130.0, 200.0, 300.0, 450.0,
];

/// Offsets closer than this count as agreeing.
const AGREEMENT_SECONDS: f64 = 0.15;

fn thresholds(technique: Technique, locality: bool) -> &'static [f64; 9] {
    match (technique, locality) {
        (Technique::Fingerprints, false) => &FINGERPRINT_THRESHOLDS,
        (Technique::Fingerprints, true) => &FINGERPRINT_LOCALITY_THRESHOLDS,
        (Technique::Correlation, false) => &CORRELATION_THRESHOLDS,
        (Technique::Correlation, true) => &CORRELATION_LOCALITY_THRESHOLDS,
        (Technique::CorrelationSpectrogram, false) => &SPECTROGRAM_THRESHOLDS,
        (Technique::CorrelationSpectrogram, true) => &SPECTROGRAM_LOCALITY_THRESHOLDS,
    }
}

fn third_candidate_penalty(file_match: &FileMatch) -> i32 {
    let (Some(&best), Some(&third)) = (file_match.confidence.first(), file_match.confidence.get(2))
    else {
        return 0;
    };
    if best <= 0.0 {
        return 0;
    }
    match third / best {
        r if r >= 0.9 => 3,
        r if r >= 0.75 => 2,
        r if r >= 0.5 => 1,
        _ => 0,
    }
}

/// Ranks one matched file from 1 (barely matched) to 10.
pub fn rank_file_match(file_match: &FileMatch, technique: Technique, locality: bool) -> u8 {
    let best = file_match.best_confidence();
    let mut rank = 1 + thresholds(technique, locality)
        .iter()
        .filter(|&&t| best > t)
        .count() as i32;

    // A fingerprint match with exactly one surviving offset is unambiguous.
    if technique == Technique::Fingerprints && file_match.len() == 1 {
        rank += 1;
    }
    if let (Some(first), Some(second)) = (
        file_match.offset_seconds.first(),
        file_match.offset_seconds.get(1),
    ) {
        if (first - second).abs() <= AGREEMENT_SECONDS {
            rank += 1;
        }
    }
    rank -= third_candidate_penalty(file_match);
    rank.clamp(1, 10) as u8
}

pub fn rank_recognition(
    recognition: &Recognition,
    technique: Technique,
    locality: bool,
) -> BTreeMap<String, u8> {
    recognition
        .match_info
        .iter()
        .map(|(name, fm)| (name.clone(), rank_file_match(fm, technique, locality)))
        .collect()
}

/// Rankings for every recognition of an alignment.
pub fn rank_match_info(match_info: &MatchInfo, technique: Technique, locality: bool) -> RankTable {
    match_info
        .iter()
        .map(|(name, r)| (name.clone(), rank_recognition(r, technique, locality)))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::results::LocalityMatch;

    fn file_match(entries: &[(f64, f64)]) -> FileMatch {
        FileMatch {
            confidence: entries.iter().map(|(c, _)| *c).collect(),
            offset_seconds: entries.iter().map(|(_, o)| *o).collect(),
            offset_samples: entries.iter().map(|(_, o)| (*o * 1000.0) as i64).collect(),
            locality_seconds: None,
            sample_rate: 1000,
            scaling_factor: None,
        }
    }

    #[test]
    fn ranks_stay_within_one_to_ten() {
        let weak = file_match(&[(0.5, 1.0), (0.5, 2.0), (0.5, 3.0)]);
        assert_eq!(rank_file_match(&weak, Technique::Fingerprints, false), 1);

        let strong = file_match(&[(5000.0, 1.0), (4000.0, 1.05)]);
        assert_eq!(rank_file_match(&strong, Technique::Fingerprints, false), 10);
    }

    #[test]
    fn single_offset_earns_a_bonus() {
        let one = file_match(&[(12.0, 3.0)]);
        let two = file_match(&[(12.0, 3.0), (2.0, 9.0)]);
        let a = rank_file_match(&one, Technique::Fingerprints, false);
        let b = rank_file_match(&two, Technique::Fingerprints, false);
        assert_eq!(a, b + 1);
        // Correlation has no count bonus.
        assert_eq!(
            rank_file_match(&one, Technique::Correlation, false),
            rank_file_match(&two, Technique::Correlation, false)
        );
    }

    #[test]
    fn strong_third_candidate_is_penalized() {
        let clean = file_match(&[(30.0, 1.0), (5.0, 4.0), (4.0, 8.0)]);
        let ambiguous = file_match(&[(30.0, 1.0), (29.0, 4.0), (28.0, 8.0)]);
        assert_eq!(
            rank_file_match(&clean, Technique::Correlation, false),
            rank_file_match(&ambiguous, Technique::Correlation, false) + 3
        );
    }

    #[test]
    fn agreeing_runner_up_earns_a_bonus() {
        let agree = file_match(&[(8.0, 1.0), (3.0, 1.1)]);
        let disagree = file_match(&[(8.0, 1.0), (3.0, 5.0)]);
        assert_eq!(
            rank_file_match(&agree, Technique::Correlation, false),
            rank_file_match(&disagree, Technique::Correlation, false) + 1
        );
    }

    #[test]
    fn locality_uses_its_own_table() {
        let mut fm = file_match(&[(9.0, 1.0), (1.0, 7.0)]);
        let plain = rank_file_match(&fm, Technique::Fingerprints, false);
        fm.locality_seconds = Some(vec![
            vec![LocalityMatch {
                target_seconds: 0.0,
                against_seconds: 1.0,
                confidence: 9.0,
            }],
            Vec::new(),
        ]);
        assert!(rank_file_match(&fm, Technique::Fingerprints, true) > plain);
    }

    #[test]
    fn recognition_rankings_cover_every_file() {
        let recognition = Recognition {
            match_time: 0.1,
            match_info: BTreeMap::from([
                ("a.wav".to_string(), file_match(&[(50.0, 1.0)])),
                ("b.wav".to_string(), file_match(&[(1.0, 1.0)])),
            ]),
            rankings: BTreeMap::new(),
        };
        let ranks = rank_recognition(&recognition, Technique::Fingerprints, false);
        assert_eq!(ranks.len(), 2);
        assert!(ranks["a.wav"] > ranks["b.wav"]);
    }
}
