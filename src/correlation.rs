//! Cross-correlation recognizers over raw waveforms and spectrogram bands.

use std::ops::Range;

use rayon::prelude::*;
use rustfft::{FftPlanner, num_complex::Complex};
use tracing::debug;

use crate::audio::{HighpassFilter, PcmSignal};
use crate::config::{BUTTERWORTH_ORDER, CorrelationConfig};
use crate::error::Result;
use crate::filtering::{Candidate, filter_locality, merge_by_offset, scale_height, top_k};
use crate::results::{FileMatch, LocalityMatch};
use crate::spectrogram::Spectrogram;

/// Full cross-correlation. Index `k` holds lag `k - (target.len() - 1)`,
/// where a positive lag means `target` starts that many samples into
/// `against`.
pub fn cross_correlate(against: &[f64], target: &[f64]) -> Vec<f64> {
    correlate_bands(std::iter::once((against, target)), against.len(), target.len())
}

/// Sums the cross-correlations of paired rows of equal lengths `n` and `m`
/// with a single inverse transform.
fn correlate_bands<'a>(
    bands: impl Iterator<Item = (&'a [f64], &'a [f64])>,
    n: usize,
    m: usize,
) -> Vec<f64> {
    if n == 0 || m == 0 {
        return Vec::new();
    }
    let full_len = n + m - 1;
    let size = full_len.next_power_of_two();
    let mut planner = FftPlanner::<f64>::new();
    let forward = planner.plan_fft_forward(size);
    let inverse = planner.plan_fft_inverse(size);

    let spectrum = |row: &[f64]| {
        let mut buffer: Vec<Complex<f64>> = row.iter().map(|&v| Complex::new(v, 0.0)).collect();
        buffer.resize(size, Complex::new(0.0, 0.0));
        forward.process(&mut buffer);
        buffer
    };

    let mut acc = vec![Complex::new(0.0, 0.0); size];
    for (against, target) in bands {
        if against.iter().all(|&v| v == 0.0) || target.iter().all(|&v| v == 0.0) {
            continue;
        }
        let a = spectrum(against);
        let t = spectrum(target);
        for ((slot, x), y) in acc.iter_mut().zip(&a).zip(&t) {
            *slot += x * y.conj();
        }
    }
    inverse.process(&mut acc);

    let norm = size as f64;
    (0..full_len)
        .map(|k| {
            let lag = k as i64 - (m as i64 - 1);
            acc[lag.rem_euclid(size as i64) as usize].re / norm
        })
        .collect()
}

/// Local maxima (plateaus resolve to their middle) with height at least
/// `min_height`, sorted by descending height.
pub fn find_peaks(x: &[f64], min_height: f64) -> Vec<(usize, f64)> {
    let mut peaks = Vec::new();
    let mut i = 1;
    while i + 1 < x.len() {
        if x[i - 1] < x[i] {
            let mut ahead = i + 1;
            while ahead + 1 < x.len() && x[ahead] == x[i] {
                ahead += 1;
            }
            if x[ahead] < x[i] {
                let peak = (i + ahead - 1) / 2;
                if x[peak] >= min_height {
                    peaks.push((peak, x[peak]));
                }
                i = ahead;
                continue;
            }
        }
        i += 1;
    }
    peaks.sort_by(|a, b| b.1.total_cmp(&a.1).then(a.0.cmp(&b.0)));
    peaks
}

/// Lengths and units of one correlation problem. Positions are samples for
/// raw audio and frames for spectrograms.
struct Plan {
    against_len: usize,
    target_len: usize,
    unit_samples: usize,
    cells_per_unit: usize,
}

/// Clips lags beyond `max_lag` and returns `(lag, scaled height)` peaks plus
/// the scaled maximum. `filter_matches` bounds the unscaled height.
fn lag_peaks(
    corr: &mut [f64],
    base: i64,
    target_len: usize,
    max_lag: Option<usize>,
    scale_len: usize,
    config: &CorrelationConfig,
) -> (Vec<(i64, f64)>, f64) {
    let lag_of = |k: usize| base + k as i64 - (target_len as i64 - 1);
    if let Some(max_lag) = max_lag {
        for (k, value) in corr.iter_mut().enumerate() {
            if lag_of(k).unsigned_abs() > max_lag as u64 {
                *value = 0.0;
            }
        }
    }
    let max = corr.iter().copied().fold(0.0, f64::max);
    let peaks = find_peaks(corr, config.filter_matches)
        .into_iter()
        .filter(|&(_, height)| height > 0.0)
        .take(config.match_len_filter)
        .map(|(k, height)| (lag_of(k), scale_height(height, scale_len)))
        .collect();
    (peaks, scale_height(max, scale_len))
}

/// Start positions of half-overlapping windows covering `len`.
fn window_starts(len: usize, window: usize) -> Vec<usize> {
    let step = (window / 2).max(1);
    let mut starts = vec![0];
    let mut start = 0;
    while start + window < len {
        start += step;
        starts.push(start);
    }
    starts
}

fn run<F>(plan: &Plan, config: &CorrelationConfig, correlate: F) -> Option<FileMatch>
where
    F: Fn(Range<usize>, Range<usize>) -> Vec<f64> + Sync,
{
    if plan.against_len == 0 || plan.target_len == 0 {
        return None;
    }
    let unit = plan.unit_samples as i64;
    let sample_rate = config.sample_rate;
    let max_lag = config.max_lag_samples().map(|s| s / plan.unit_samples);

    let Some(locality) = config.locality else {
        let mut corr = correlate(0..plan.against_len, 0..plan.target_len);
        let scale_len = plan.target_len * plan.cells_per_unit;
        let (peaks, max_scaled) =
            lag_peaks(&mut corr, 0, plan.target_len, max_lag, scale_len, config);
        let candidates = peaks
            .into_iter()
            .map(|(lag, strength)| Candidate {
                offset_samples: lag * unit,
                strength,
                localities: Vec::new(),
            })
            .collect();
        return FileMatch::from_candidates(
            top_k(candidates, config.match_len_filter),
            sample_rate,
            Some(max_scaled),
            false,
        );
    };

    let window = (locality * sample_rate as f64 / plan.unit_samples as f64).round() as usize;
    let window = window.max(2);
    let a_starts = window_starts(plan.against_len, window);
    let t_starts = window_starts(plan.target_len, window);
    let pairs: Vec<(usize, usize)> = a_starts
        .iter()
        .flat_map(|&a| t_starts.iter().map(move |&t| (a, t)))
        .filter(|&(a, t)| {
            max_lag.is_none_or(|ml| (a as i64 - t as i64).unsigned_abs() <= ml as u64)
        })
        .collect();
    debug!(pairs = pairs.len(), window, "Correlating locality windows");

    let to_seconds = |pos: usize| (pos * plan.unit_samples) as f64 / sample_rate as f64;
    let per_pair: Vec<(Vec<(i64, LocalityMatch)>, f64)> = pairs
        .par_iter()
        .map(|&(a_start, t_start)| {
            let a_range = a_start..(a_start + window).min(plan.against_len);
            let t_range = t_start..(t_start + window).min(plan.target_len);
            let t_len = t_range.len();
            let mut corr = correlate(a_range, t_range);
            let base = a_start as i64 - t_start as i64;
            let (peaks, max_scaled) = lag_peaks(
                &mut corr,
                base,
                t_len,
                max_lag,
                t_len * plan.cells_per_unit,
                config,
            );
            let sub_matches = peaks
                .into_iter()
                .map(|(lag, confidence)| {
                    (
                        lag * unit,
                        LocalityMatch {
                            target_seconds: to_seconds(t_start),
                            against_seconds: to_seconds(a_start),
                            confidence,
                        },
                    )
                })
                .collect();
            (sub_matches, max_scaled)
        })
        .collect();

    let max_scaled = per_pair.iter().map(|(_, m)| *m).fold(0.0, f64::max);
    let merged = merge_by_offset(per_pair.into_iter().flat_map(|(subs, _)| subs));
    let kept = top_k(
        filter_locality(merged, config.locality_filter_prop),
        config.match_len_filter,
    );
    FileMatch::from_candidates(kept, sample_rate, Some(max_scaled), true)
}

/// Normalized and, when a threshold is set, high-pass filtered samples.
fn prepare_raw(signal: &PcmSignal, filter: Option<&HighpassFilter>) -> Vec<f64> {
    let normalized = signal.normalized();
    match filter {
        Some(filter) => filter.apply(&normalized),
        None => normalized,
    }
}

/// Raw waveform cross-correlation of `target` inside `against`.
pub fn correlate(
    target: &PcmSignal,
    against: &PcmSignal,
    config: &CorrelationConfig,
) -> Result<Option<FileMatch>> {
    let filter = if config.freq_threshold > 0.0 {
        Some(HighpassFilter::butterworth(
            BUTTERWORTH_ORDER,
            config.freq_threshold,
            config.sample_rate,
        )?)
    } else {
        None
    };
    let t = prepare_raw(target, filter.as_ref());
    let a = prepare_raw(against, filter.as_ref());

    let plan = Plan {
        against_len: a.len(),
        target_len: t.len(),
        unit_samples: 1,
        cells_per_unit: 1,
    };
    Ok(run(&plan, config, |a_range, t_range| {
        cross_correlate(&a[a_range], &t[t_range])
    }))
}

/// Thresholded spectrogram rows, each standardized to zero mean and unit
/// variance. Constant rows become zero.
fn spectrogram_rows(signal: &PcmSignal, config: &CorrelationConfig) -> Vec<Vec<f64>> {
    let spectrogram = Spectrogram::compute(
        &signal.samples,
        config.sample_rate,
        config.window_size,
        config.overlap_ratio,
    );
    let mut rows = spectrogram.thresholded(config.freq_threshold);
    for row in rows.iter_mut() {
        let n = row.len().max(1) as f64;
        let mean = row.iter().sum::<f64>() / n;
        let std = (row.iter().map(|v| (v - mean).powi(2)).sum::<f64>() / n).sqrt();
        for v in row.iter_mut() {
            *v = if std > 0.0 { (*v - mean) / std } else { 0.0 };
        }
    }
    rows
}

/// Per-band spectrogram cross-correlation, summed over bands.
pub fn correlate_spectrogram(
    target: &PcmSignal,
    against: &PcmSignal,
    config: &CorrelationConfig,
) -> Option<FileMatch> {
    let t_rows = spectrogram_rows(target, config);
    let a_rows = spectrogram_rows(against, config);

    let plan = Plan {
        against_len: a_rows.first().map_or(0, Vec::len),
        target_len: t_rows.first().map_or(0, Vec::len),
        unit_samples: config.hop_size(),
        cells_per_unit: t_rows.len(),
    };
    run(&plan, config, |a_range, t_range| {
        let (n, m) = (a_range.len(), t_range.len());
        let bands = a_rows
            .iter()
            .zip(&t_rows)
            .map(|(a, t)| (&a[a_range.clone()], &t[t_range.clone()]));
        correlate_bands(bands, n, m)
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn noise(len: usize, seed: u64) -> Vec<i16> {
        let mut state = seed;
        (0..len)
            .map(|_| {
                state = state
                    .wrapping_mul(6364136223846793005)
                    .wrapping_add(1442695040888963407);
                (((state >> 33) % 12000) as i32 - 6000) as i16
            })
            .collect()
    }

    fn embed(clip: &[i16], before: usize, after: usize) -> Vec<i16> {
        let mut samples = vec![0i16; before];
        samples.extend_from_slice(clip);
        samples.extend(std::iter::repeat_n(0, after));
        samples
    }

    #[test]
    fn cross_correlation_lags() {
        let corr = cross_correlate(&[0.0, 0.0, 1.0, 2.0, 3.0, 0.0], &[1.0, 2.0, 3.0]);
        assert_eq!(corr.len(), 8);
        let best = corr
            .iter()
            .enumerate()
            .max_by(|a, b| a.1.total_cmp(b.1))
            .unwrap();
        // Lag 2 lives at index 2 + (3 - 1).
        assert_eq!(best.0, 4);
        assert!((best.1 - 14.0).abs() < 1e-9);
    }

    #[test]
    fn find_peaks_resolves_plateaus_and_sorts() {
        let x = [0.0, 1.0, 3.0, 3.0, 3.0, 1.0, 0.0, 2.0, 0.0];
        assert_eq!(find_peaks(&x, 0.0), vec![(3, 3.0), (7, 2.0)]);
        assert_eq!(find_peaks(&x, 2.5), vec![(3, 3.0)]);
        assert!(find_peaks(&[1.0, 1.0], 0.0).is_empty());
    }

    #[test]
    fn raw_correlation_finds_embedded_clip() {
        let clip = noise(8000, 7);
        let target = PcmSignal::new(clip.clone(), 8000);
        let against = PcmSignal::new(embed(&clip, 8000, 4000), 8000);
        let fm = correlate(&target, &against, &CorrelationConfig::default())
            .unwrap()
            .unwrap();
        assert_eq!(fm.offset_samples[0], 8000);
        assert!((fm.offset_seconds[0] - 1.0).abs() < 1e-9);
        assert!(fm.is_consistent());
        assert!(fm.confidence.len() <= CorrelationConfig::default().match_len_filter);
        assert_eq!(fm.scaling_factor, Some(fm.confidence[0]));
    }

    #[test]
    fn raw_correlation_is_antisymmetric() {
        let clip = noise(6000, 11);
        let a = PcmSignal::new(embed(&clip, 2400, 100), 8000);
        let b = PcmSignal::new(embed(&clip, 400, 900), 8000);
        let config = CorrelationConfig::default();
        let ab = correlate(&a, &b, &config).unwrap().unwrap();
        let ba = correlate(&b, &a, &config).unwrap().unwrap();
        assert_eq!(ab.offset_samples[0], -2000);
        assert_eq!(ba.offset_samples[0], 2000);
    }

    #[test]
    fn max_lags_clips_the_search() {
        let clip = noise(4000, 3);
        let target = PcmSignal::new(clip.clone(), 8000);
        let against = PcmSignal::new(embed(&clip, 8000, 0), 8000);
        let config = CorrelationConfig {
            max_lags: Some(0.5),
            ..Default::default()
        };
        if let Some(fm) = correlate(&target, &against, &config).unwrap() {
            assert!(fm.offset_samples.iter().all(|o| o.abs() <= 4000));
        }
    }

    #[test]
    fn locality_windows_merge_by_global_offset() {
        let clip = noise(8000, 5);
        let target = PcmSignal::new(clip.clone(), 8000);
        let against = PcmSignal::new(embed(&clip, 4000, 4000), 8000);
        let config = CorrelationConfig {
            locality: Some(0.5),
            ..Default::default()
        };
        let fm = correlate(&target, &against, &config).unwrap().unwrap();
        assert_eq!(fm.offset_samples[0], 4000);
        let localities = fm.locality_seconds.as_ref().unwrap();
        assert_eq!(localities.len(), fm.len());
        assert!(localities[0].len() > 1);
        for sub in &localities[0] {
            assert!((sub.against_seconds - sub.target_seconds - 0.5).abs() <= 0.25 + 1e-9);
        }
    }

    #[test]
    fn spectrogram_correlation_finds_frame_offset() {
        let config = CorrelationConfig::default();
        let hop = config.hop_size();
        let clip = noise(16000, 21);
        let target = PcmSignal::new(clip.clone(), 8000);
        let against = PcmSignal::new(embed(&clip, 32 * hop, 3000), 8000);
        let fm = correlate_spectrogram(&target, &against, &config).unwrap();
        assert_eq!(fm.offset_samples[0], (32 * hop) as i64);
    }

    #[test]
    fn filter_applies_to_the_unscaled_height() {
        let clip = noise(8000, 13);
        let target = PcmSignal::new(clip.clone(), 8000);
        let against = PcmSignal::new(embed(&clip, 2000, 2000), 8000);
        let unfiltered = correlate(&target, &against, &CorrelationConfig::default())
            .unwrap()
            .unwrap();
        let best = unfiltered.confidence[0];
        // Unscaled height is `best * len * 1e-3`, eight times the confidence here.
        let raw_height = best * 8000.0 * 1e-3;

        let above_confidence = CorrelationConfig {
            filter_matches: 2.0 * best,
            ..Default::default()
        };
        let fm = correlate(&target, &against, &above_confidence).unwrap().unwrap();
        assert_eq!(fm.offset_samples[0], 2000);

        let above_height = CorrelationConfig {
            filter_matches: raw_height * 1.01,
            ..Default::default()
        };
        assert!(correlate(&target, &against, &above_height).unwrap().is_none());
    }

    #[test]
    fn spectrogram_locality_merges_window_pairs() {
        let config = CorrelationConfig {
            locality: Some(0.5),
            ..Default::default()
        };
        let hop = config.hop_size();
        let clip = noise(16000, 23);
        let target = PcmSignal::new(clip.clone(), 8000);
        let against = PcmSignal::new(embed(&clip, 32 * hop, 2000), 8000);
        let fm = correlate_spectrogram(&target, &against, &config).unwrap();

        assert_eq!(fm.offset_samples[0], (32 * hop) as i64);
        let offset = fm.offset_seconds[0];
        // Windows are 16 frames long and step by 8.
        let half_window = 8.0 * hop as f64 / 8000.0;
        let localities = fm.locality_seconds.as_ref().unwrap();
        assert!(!localities[0].is_empty());
        for sub in &localities[0] {
            let implied = sub.against_seconds - sub.target_seconds;
            assert!((implied - offset).abs() <= half_window + 1e-9);
        }
    }

    #[test]
    fn spectrogram_max_lags_clips_the_search() {
        let hop = CorrelationConfig::default().hop_size();
        let clip = noise(16000, 29);
        let target = PcmSignal::new(clip.clone(), 8000);
        let against = PcmSignal::new(embed(&clip, 32 * hop, 0), 8000);

        let wide = CorrelationConfig {
            max_lags: Some(2.0),
            ..Default::default()
        };
        let fm = correlate_spectrogram(&target, &against, &wide).unwrap();
        assert_eq!(fm.offset_samples[0], (32 * hop) as i64);

        let narrow = CorrelationConfig {
            max_lags: Some(0.5),
            ..Default::default()
        };
        if let Some(fm) = correlate_spectrogram(&target, &against, &narrow) {
            assert!(fm.offset_seconds.iter().all(|o| o.abs() <= 0.5));
        }
    }

    #[test]
    fn empty_signals_do_not_match() {
        let empty = PcmSignal::new(Vec::new(), 8000);
        let other = PcmSignal::new(noise(100, 1), 8000);
        assert!(correlate(&empty, &other, &CorrelationConfig::default()).unwrap().is_none());
    }
}
