//! Short-time Fourier transform shared by fingerprinting and spectrogram
//! correlation.

use std::f64::consts::PI;

use rustfft::{FftPlanner, num_complex::Complex};
use tracing::debug;

use crate::config::hop_size;

/// Log2 power spectral density laid out as `bins[frequency][frame]`.
#[derive(Debug, Clone, PartialEq)]
pub struct Spectrogram {
    pub bins: Vec<Vec<f64>>,
    pub window_size: usize,
    pub hop_size: usize,
    pub sample_rate: u32,
}

pub fn hann_window(window_size: usize) -> Vec<f64> {
    if window_size == 1 {
        return vec![1.0];
    }
    (0..window_size)
        .map(|n| 0.5 - 0.5 * (2.0 * PI * n as f64 / (window_size as f64 - 1.0)).cos())
        .collect()
}

/// Highest bin whose centre frequency is at or below `hz`.
pub fn last_bin_at_or_below(hz: f64, window_size: usize, sample_rate: u32) -> usize {
    let freq_res = sample_rate as f64 / window_size as f64;
    (hz / freq_res).floor().max(0.0) as usize
}

impl Spectrogram {
    /// Hann-windowed STFT with `noverlap = window_size * overlap_ratio`.
    ///
    /// Values are `log2` of the one-sided PSD; zero power (`-inf`) is stored
    /// as 0. Input shorter than one window is zero-padded to a single frame.
    pub fn compute(
        samples: &[i16],
        sample_rate: u32,
        window_size: usize,
        overlap_ratio: f64,
    ) -> Self {
        let hop = hop_size(window_size, overlap_ratio);
        let window = hann_window(window_size);
        let window_power: f64 = window.iter().map(|w| w * w).sum();
        let scale = 1.0 / (sample_rate as f64 * window_power);
        let num_bins = window_size / 2 + 1;

        let num_frames = if samples.len() <= window_size {
            1
        } else {
            (samples.len() - window_size) / hop + 1
        };

        let mut planner = FftPlanner::<f64>::new();
        let fft = planner.plan_fft_forward(window_size);
        let mut buffer = vec![Complex::new(0.0, 0.0); window_size];
        let mut bins = vec![Vec::with_capacity(num_frames); num_bins];

        for frame in 0..num_frames {
            let start = frame * hop;
            for (i, slot) in buffer.iter_mut().enumerate() {
                let sample = samples.get(start + i).copied().unwrap_or(0) as f64;
                *slot = Complex::new(sample * window[i], 0.0);
            }
            fft.process(&mut buffer);

            for (k, row) in bins.iter_mut().enumerate() {
                let one_sided = if k == 0 || (window_size % 2 == 0 && k == window_size / 2) {
                    1.0
                } else {
                    2.0
                };
                let value = (buffer[k].norm_sqr() * scale * one_sided).log2();
                row.push(if value == f64::NEG_INFINITY { 0.0 } else { value });
            }
        }

        debug!(
            frames = num_frames,
            bins = num_bins,
            window_size,
            hop,
            "Spectrogram computed"
        );

        Self {
            bins,
            window_size,
            hop_size: hop,
            sample_rate,
        }
    }

    pub fn num_bins(&self) -> usize {
        self.bins.len()
    }

    pub fn num_frames(&self) -> usize {
        self.bins.first().map_or(0, Vec::len)
    }

    pub fn frame_seconds(&self) -> f64 {
        self.hop_size as f64 / self.sample_rate as f64
    }

    /// Copy of the rows with every bin at or below `freq_threshold` zeroed.
    /// The spectrogram itself keeps full resolution.
    pub fn thresholded(&self, freq_threshold: f64) -> Vec<Vec<f64>> {
        let mut rows = self.bins.clone();
        if freq_threshold > 0.0 {
            let cutoff = last_bin_at_or_below(freq_threshold, self.window_size, self.sample_rate)
                .min(rows.len().saturating_sub(1));
            for row in rows.iter_mut().take(cutoff + 1) {
                row.fill(0.0);
            }
        }
        rows
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tone(freq: f64, sample_rate: u32, len: usize, amplitude: f64) -> Vec<i16> {
        (0..len)
            .map(|i| {
                (amplitude * (2.0 * PI * freq * i as f64 / sample_rate as f64).sin()) as i16
            })
            .collect()
    }

    #[test]
    fn frame_count_follows_hop() {
        let samples = vec![100i16; 4096 * 3];
        let spec = Spectrogram::compute(&samples, 44100, 4096, 0.5);
        assert_eq!(spec.num_bins(), 2049);
        assert_eq!(spec.num_frames(), (4096 * 3 - 4096) / 2048 + 1);
        assert_eq!(spec.hop_size, 2048);
    }

    #[test]
    fn short_input_pads_to_one_frame() {
        let spec = Spectrogram::compute(&[1, 2, 3], 8000, 64, 0.5);
        assert_eq!(spec.num_frames(), 1);
    }

    #[test]
    fn silence_is_clamped_to_zero() {
        let spec = Spectrogram::compute(&vec![0i16; 2048], 8000, 256, 0.5);
        assert!(spec.bins.iter().flatten().all(|&v| v == 0.0));
    }

    #[test]
    fn tone_peaks_at_its_bin() {
        let samples = tone(1000.0, 8000, 8000, 10000.0);
        let spec = Spectrogram::compute(&samples, 8000, 512, 0.5);
        let frame = spec.num_frames() / 2;
        let loudest = (0..spec.num_bins())
            .max_by(|&a, &b| spec.bins[a][frame].total_cmp(&spec.bins[b][frame]))
            .unwrap();
        // 1000 Hz / (8000 Hz / 512) = bin 64.
        assert_eq!(loudest, 64);
    }

    #[test]
    fn output_is_reproducible() {
        let samples = tone(440.0, 8000, 6000, 5000.0);
        let a = Spectrogram::compute(&samples, 8000, 256, 0.5);
        let b = Spectrogram::compute(&samples, 8000, 256, 0.5);
        assert_eq!(a, b);
    }

    #[test]
    fn threshold_zeroes_low_bins_only_in_the_copy() {
        let samples = tone(100.0, 8000, 4000, 8000.0);
        let spec = Spectrogram::compute(&samples, 8000, 256, 0.5);
        let rows = spec.thresholded(200.0);
        let cutoff = last_bin_at_or_below(200.0, 256, 8000);
        assert!(rows[..=cutoff].iter().flatten().all(|&v| v == 0.0));
        // 100 Hz lands in bin 3 at 31.25 Hz per bin.
        assert!(spec.bins[3].iter().any(|&v| v != 0.0));
    }

    #[test]
    fn threshold_keeps_the_first_bin_above_it() {
        let spec = Spectrogram {
            bins: vec![vec![1.0]; 2049],
            window_size: 4096,
            hop_size: 2048,
            sample_rate: 44100,
        };
        let rows = spec.thresholded(200.0);
        let bin_hz = |k: usize| k as f64 * 44100.0 / 4096.0;
        // Bin 18 sits at 193.8 Hz and bin 19 at 204.6 Hz.
        assert_eq!(last_bin_at_or_below(200.0, 4096, 44100), 18);
        for (k, row) in rows.iter().enumerate().take(40) {
            assert_eq!(row[0] == 0.0, bin_hz(k) <= 200.0, "bin {k}");
        }
    }
}
