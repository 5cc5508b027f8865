use std::collections::HashMap;

use sha1::{Digest, Sha1};
use tracing::debug;

use crate::config::{FingerprintConfig, HashStyle};
use crate::peaks::Peak;

/// Truncated hex digest -> anchor frames in discovery order.
pub type FingerprintTable = HashMap<String, Vec<usize>>;

/// Width of a frequency band used by the `panako` style, in bins.
const PANAKO_BAND_WIDTH: usize = 400;

/// Bounds applied to every time delta inside one hash.
#[derive(Debug, Clone, Copy)]
struct DeltaRange {
    min: usize,
    max: usize,
}

impl DeltaRange {
    fn delta(&self, from: &Peak, to: &Peak) -> Option<usize> {
        let delta = to.time.checked_sub(from.time)?;
        (self.min..=self.max).contains(&delta).then_some(delta)
    }
}

/// Combines peaks into `(hash, anchor_frame)` pairs.
///
/// `peaks` should already be in the order the config asks for; sorting by
/// time keeps the fan-out window local.
pub fn generate_hashes(peaks: &[Peak], config: &FingerprintConfig) -> Vec<(String, usize)> {
    let range = DeltaRange {
        min: config.min_hash_time_delta,
        max: config.max_hash_time_delta,
    };
    let reduction = config.fingerprint_reduction;
    let fan_value = config.fan_value;

    let mut hashes = Vec::new();
    match config.hash_style {
        HashStyle::Base => {
            for (i, p1) in peaks.iter().enumerate() {
                for p2 in peaks.iter().skip(i + 1).take(fan_value.saturating_sub(1)) {
                    if let Some(dt) = range.delta(p1, p2) {
                        let key = format!("{}|{}|{}", p1.freq, p2.freq, dt);
                        hashes.push((digest(&key, reduction), p1.time));
                    }
                }
            }
        }
        style => {
            for i in 0..peaks.len() {
                for j in 1..fan_value.saturating_sub(1) {
                    let Some(p2) = peaks.get(i + j) else { break };
                    let Some(dt1) = range.delta(&peaks[i], p2) else {
                        continue;
                    };
                    for k in (j + 1)..fan_value {
                        let Some(p3) = peaks.get(i + k) else { break };
                        let Some(dt2) = range.delta(p2, p3) else {
                            continue;
                        };
                        let key = triple_key(style, &peaks[i], p2, p3, dt1, dt2);
                        hashes.push((digest(&key, reduction), peaks[i].time));
                    }
                }
            }
        }
    }

    debug!(
        hashes = hashes.len(),
        peaks = peaks.len(),
        style = %config.hash_style,
        "Generated fingerprint hashes"
    );
    hashes
}

fn triple_key(style: HashStyle, p1: &Peak, p2: &Peak, p3: &Peak, dt1: usize, dt2: usize) -> String {
    let (f1, f2, f3) = (p1.freq as i64, p2.freq as i64, p3.freq as i64);
    let ratio = dt1 as f64 / (dt1 + dt2) as f64;
    match style {
        HashStyle::PanakoMod => format!("{}|{}|{:.8}", f1 - f2, f2 - f3, ratio),
        HashStyle::Panako => format!(
            "{}|{}|{}|{}|{}|{:.8}",
            f1 - f2,
            f2 - f3,
            p1.freq / PANAKO_BAND_WIDTH,
            p2.freq / PANAKO_BAND_WIDTH,
            p3.freq / PANAKO_BAND_WIDTH,
            ratio
        ),
        HashStyle::BaseThree | HashStyle::Base => {
            format!("{}|{}|{}|{}|{}", f1, f2, f3, dt1, dt2)
        }
    }
}

/// SHA-1 hex digest truncated to `reduction` characters.
pub fn digest(key: &str, reduction: usize) -> String {
    let mut encoded = hex::encode(Sha1::digest(key.as_bytes()));
    encoded.truncate(reduction);
    encoded
}

/// Groups hashes by key, keeping every occurrence in discovery order.
pub fn build_table(hashes: impl IntoIterator<Item = (String, usize)>) -> FingerprintTable {
    let mut table = FingerprintTable::new();
    for (hash, offset) in hashes {
        table.entry(hash).or_default().push(offset);
    }
    table
}

/// Total number of stored occurrences.
pub fn fingerprint_count(table: &FingerprintTable) -> usize {
    table.values().map(Vec::len).sum()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config(style: HashStyle) -> FingerprintConfig {
        FingerprintConfig {
            hash_style: style,
            fan_value: 5,
            min_hash_time_delta: 1,
            max_hash_time_delta: 10,
            ..Default::default()
        }
    }

    fn line(n: usize) -> Vec<Peak> {
        (0..n)
            .map(|i| Peak {
                freq: 100 + 37 * i,
                time: 2 * i,
            })
            .collect()
    }

    #[test]
    fn digest_is_truncated_sha1() {
        assert_eq!(digest("abc", 40), "a9993e364706816aba3e25717850c26c9cd0d89d");
        assert_eq!(digest("abc", 20), "a9993e364706816aba3e");
    }

    #[test]
    fn base_pairs_respect_fan_value() {
        let peaks = line(10);
        let hashes = generate_hashes(&peaks, &config(HashStyle::Base));
        // Each anchor pairs with up to four followers, all within 10 frames.
        let expected: usize = (0..10).map(|i| (9 - i).min(4)).sum();
        assert_eq!(hashes.len(), expected);
        assert!(hashes.iter().all(|(h, _)| h.len() == 20));
    }

    #[test]
    fn triple_styles_respect_fan_value() {
        let peaks = line(10);
        for style in [HashStyle::PanakoMod, HashStyle::Panako, HashStyle::BaseThree] {
            let hashes = generate_hashes(&peaks, &config(style));
            // j in 1..4, k in j+1..5: six triples per anchor when enough peaks follow.
            assert_eq!(hashes.iter().filter(|(_, t)| *t == 0).count(), 6, "{style}");
        }
    }

    #[test]
    fn time_deltas_outside_range_are_skipped() {
        let peaks = vec![
            Peak { freq: 10, time: 0 },
            Peak { freq: 20, time: 50 },
        ];
        assert!(generate_hashes(&peaks, &config(HashStyle::Base)).is_empty());
    }

    #[test]
    fn panako_mod_is_invariant_to_frequency_shift() {
        let peaks = line(6);
        let shifted: Vec<Peak> = peaks
            .iter()
            .map(|p| Peak {
                freq: p.freq + 17,
                time: p.time + 40,
            })
            .collect();
        let cfg = config(HashStyle::PanakoMod);
        let a: Vec<String> = generate_hashes(&peaks, &cfg).into_iter().map(|h| h.0).collect();
        let b: Vec<String> = generate_hashes(&shifted, &cfg).into_iter().map(|h| h.0).collect();
        assert_eq!(a, b);

        let cfg = config(HashStyle::BaseThree);
        let a: Vec<String> = generate_hashes(&peaks, &cfg).into_iter().map(|h| h.0).collect();
        let b: Vec<String> = generate_hashes(&shifted, &cfg).into_iter().map(|h| h.0).collect();
        assert_ne!(a, b);
    }

    #[test]
    fn panako_keys_include_the_frequency_band() {
        let keys = |peaks: &[Peak], style| -> Vec<String> {
            generate_hashes(peaks, &config(style)).into_iter().map(|h| h.0).collect()
        };
        let shift = |by: usize| -> Vec<Peak> {
            line(6)
                .into_iter()
                .map(|p| Peak {
                    freq: p.freq + by,
                    time: p.time,
                })
                .collect()
        };
        let peaks = line(6);
        // Every peak stays inside the first band.
        let same_band = shift(17);
        // Every peak moves up one band.
        let next_band = shift(PANAKO_BAND_WIDTH);

        assert_eq!(keys(&peaks, HashStyle::Panako), keys(&same_band, HashStyle::Panako));
        assert_ne!(keys(&peaks, HashStyle::Panako), keys(&next_band, HashStyle::Panako));
        assert_eq!(
            keys(&peaks, HashStyle::PanakoMod),
            keys(&next_band, HashStyle::PanakoMod)
        );
    }

    #[test]
    fn table_keeps_duplicate_offsets_in_order() {
        let table = build_table(vec![
            ("aa".to_string(), 5),
            ("bb".to_string(), 1),
            ("aa".to_string(), 2),
            ("aa".to_string(), 5),
        ]);
        assert_eq!(table["aa"], vec![5, 2, 5]);
        assert_eq!(fingerprint_count(&table), 4);
    }
}
