use std::f64::consts::PI;
use std::path::Path;

use hound::{SampleFormat, WavReader};
use rustfft::num_complex::Complex;
use tracing::debug;

use crate::config::StartEnd;
use crate::error::{Error, Result};

/// Mono 16-bit PCM at a known sample rate.
#[derive(Debug, Clone, PartialEq)]
pub struct PcmSignal {
    pub samples: Vec<i16>,
    pub sample_rate: u32,
}

impl PcmSignal {
    pub fn new(samples: Vec<i16>, sample_rate: u32) -> Self {
        Self {
            samples,
            sample_rate,
        }
    }

    pub fn len(&self) -> usize {
        self.samples.len()
    }

    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }

    pub fn duration(&self) -> f64 {
        self.samples.len() as f64 / self.sample_rate as f64
    }

    /// Samples scaled to [-1, 1).
    pub fn normalized(&self) -> Vec<f64> {
        self.samples.iter().map(|&s| s as f64 / 32768.0).collect()
    }

    /// Returns a copy with `seconds` of leading silence.
    pub fn delayed(&self, seconds: f64) -> PcmSignal {
        let pad = (seconds.max(0.0) * self.sample_rate as f64).round() as usize;
        let mut samples = vec![0i16; pad];
        samples.extend_from_slice(&self.samples);
        PcmSignal::new(samples, self.sample_rate)
    }
}

/// File name used as the key for a path in every result map.
pub fn file_name(path: &Path) -> String {
    path.file_name()
        .map(|name| name.to_string_lossy().into_owned())
        .unwrap_or_else(|| path.to_string_lossy().into_owned())
}

/// Decodes a WAV file to mono PCM at `sample_rate`, then applies `start_end`.
pub fn read(path: &Path, sample_rate: u32, start_end: Option<StartEnd>) -> Result<PcmSignal> {
    if !path.exists() {
        return Err(Error::NotFound(path.to_path_buf()));
    }
    let mut reader = WavReader::open(path).map_err(|e| Error::decode(path, e))?;
    let spec = reader.spec();

    debug!(
        path = %path.display(),
        sample_rate = spec.sample_rate,
        channels = spec.channels,
        bits = spec.bits_per_sample,
        format = ?spec.sample_format,
        "Reading audio"
    );

    if spec.channels == 0 {
        return Err(Error::decode(path, "file declares zero channels"));
    }

    let interleaved: Vec<f64> = match spec.sample_format {
        SampleFormat::Float => reader
            .samples::<f32>()
            .map(|s| s.map(f64::from))
            .collect::<std::result::Result<_, _>>(),
        SampleFormat::Int => {
            let scale = (1i64 << (spec.bits_per_sample.clamp(1, 32) - 1)) as f64;
            reader
                .samples::<i32>()
                .map(|s| s.map(|v| v as f64 / scale))
                .collect::<std::result::Result<_, _>>()
        }
    }
    .map_err(|e| Error::decode(path, e))?;

    let mono = mix_to_mono(&interleaved, spec.channels as usize);
    let resampled = resample(&mono, spec.sample_rate, sample_rate);

    let mut samples: Vec<i16> = resampled
        .iter()
        .map(|&v| (v * 32767.0).round().clamp(i16::MIN as f64, i16::MAX as f64) as i16)
        .collect();

    if let Some(start_end) = start_end {
        apply_start_end(&mut samples, sample_rate, start_end);
    }

    Ok(PcmSignal::new(samples, sample_rate))
}

fn mix_to_mono(interleaved: &[f64], channels: usize) -> Vec<f64> {
    if channels == 1 {
        return interleaved.to_vec();
    }
    interleaved
        .chunks_exact(channels)
        .map(|frame| frame.iter().sum::<f64>() / channels as f64)
        .collect()
}

/// Integer ratios decimate; anything else is linearly interpolated.
fn resample(samples: &[f64], original_sample_rate: u32, target_sample_rate: u32) -> Vec<f64> {
    if original_sample_rate == target_sample_rate || samples.is_empty() {
        return samples.to_vec();
    }

    if original_sample_rate > target_sample_rate
        && original_sample_rate % target_sample_rate == 0
    {
        let step = (original_sample_rate / target_sample_rate) as usize;
        return samples.iter().step_by(step).copied().collect();
    }

    let ratio = original_sample_rate as f64 / target_sample_rate as f64;
    let out_len = (samples.len() as f64 / ratio).floor() as usize;
    (0..out_len)
        .map(|i| {
            let pos = i as f64 * ratio;
            let idx = pos.floor() as usize;
            let frac = pos - idx as f64;
            let a = samples[idx.min(samples.len() - 1)];
            let b = samples[(idx + 1).min(samples.len() - 1)];
            a + (b - a) * frac
        })
        .collect()
}

/// Zeroes samples before `start` and after `end` without changing the length.
///
/// `end > 0` is an absolute timestamp, `end < 0` counts back from the end of
/// the signal and `end == 0` leaves the tail untouched.
pub fn apply_start_end(samples: &mut [i16], sample_rate: u32, (start, end): StartEnd) {
    let len = samples.len();
    let to_index = |secs: f64| ((secs.max(0.0) * sample_rate as f64).round() as usize).min(len);

    let start_idx = to_index(start);
    samples[..start_idx].fill(0);

    let end_idx = if end > 0.0 {
        to_index(end)
    } else if end < 0.0 {
        len - to_index(-end)
    } else {
        len
    };
    samples[end_idx.max(start_idx).min(len)..].fill(0);
}

/// Cascaded second-order sections of a digital Butterworth high-pass.
#[derive(Debug, Clone)]
pub struct HighpassFilter {
    sections: Vec<Biquad>,
}

#[derive(Debug, Clone, Copy)]
struct Biquad {
    b: [f64; 3],
    a: [f64; 3],
}

impl HighpassFilter {
    /// Designs an `order`-pole Butterworth high-pass at `cutoff` Hz using the
    /// bilinear transform with frequency prewarping.
    pub fn butterworth(order: usize, cutoff: f64, sample_rate: u32) -> Result<Self> {
        let fs = sample_rate as f64;
        if order == 0 || cutoff <= 0.0 || cutoff >= fs / 2.0 {
            return Err(Error::Config(format!(
                "cannot design order {order} high-pass at {cutoff} Hz for {sample_rate} Hz audio"
            )));
        }

        let warped = 2.0 * fs * (PI * cutoff / fs).tan();
        let bilinear = |s: Complex<f64>| (2.0 * fs + s) / (2.0 * fs - s);

        let mut sections = Vec::with_capacity(order.div_ceil(2));
        for k in 0..order / 2 {
            let theta = PI * (2 * k + order + 1) as f64 / (2 * order) as f64;
            let lowpass_pole = Complex::from_polar(1.0, theta);
            let z = bilinear(Complex::new(warped, 0.0) / lowpass_pole);
            let a1 = -2.0 * z.re;
            let a2 = z.norm_sqr();
            let gain = (1.0 - a1 + a2) / 4.0;
            sections.push(Biquad {
                b: [gain, -2.0 * gain, gain],
                a: [1.0, a1, a2],
            });
        }
        if order % 2 == 1 {
            let z = bilinear(Complex::new(-warped, 0.0)).re;
            let gain = (1.0 + z) / 2.0;
            sections.push(Biquad {
                b: [gain, -gain, 0.0],
                a: [1.0, -z, 0.0],
            });
        }
        Ok(Self { sections })
    }

    pub fn apply(&self, input: &[f64]) -> Vec<f64> {
        let mut signal = input.to_vec();
        for section in &self.sections {
            let (mut s1, mut s2) = (0.0, 0.0);
            for x in signal.iter_mut() {
                let y = section.b[0] * *x + s1;
                s1 = section.b[1] * *x - section.a[1] * y + s2;
                s2 = section.b[2] * *x - section.a[2] * y;
                *x = y;
            }
        }
        signal
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sine(freq: f64, sample_rate: u32, secs: f64) -> Vec<f64> {
        let n = (secs * sample_rate as f64) as usize;
        (0..n)
            .map(|i| (2.0 * PI * freq * i as f64 / sample_rate as f64).sin())
            .collect()
    }

    fn rms(x: &[f64]) -> f64 {
        (x.iter().map(|v| v * v).sum::<f64>() / x.len() as f64).sqrt()
    }

    #[test]
    fn start_end_silences_without_trimming() {
        let mut samples = vec![1i16; 10];
        apply_start_end(&mut samples, 2, (1.0, -1.0));
        assert_eq!(samples, vec![0, 0, 1, 1, 1, 1, 1, 1, 0, 0]);

        let mut samples = vec![1i16; 10];
        apply_start_end(&mut samples, 2, (0.0, 3.0));
        assert_eq!(samples, vec![1, 1, 1, 1, 1, 1, 0, 0, 0, 0]);

        let mut samples = vec![1i16; 10];
        apply_start_end(&mut samples, 2, (2.5, 0.0));
        assert_eq!(samples.iter().filter(|&&s| s == 1).count(), 5);
    }

    #[test]
    fn start_end_past_the_end_silences_everything() {
        let mut samples = vec![1i16; 4];
        apply_start_end(&mut samples, 2, (10.0, 0.0));
        assert!(samples.iter().all(|&s| s == 0));
    }

    #[test]
    fn resample_decimates_and_interpolates() {
        let samples: Vec<f64> = (0..8).map(|i| i as f64).collect();
        assert_eq!(resample(&samples, 4, 2), vec![0.0, 2.0, 4.0, 6.0]);

        let up = resample(&samples, 2, 4);
        assert_eq!(up.len(), 16);
        assert!((up[1] - 0.5).abs() < 1e-12);
    }

    #[test]
    fn stereo_is_averaged() {
        assert_eq!(mix_to_mono(&[1.0, 3.0, -1.0, 1.0], 2), vec![2.0, 0.0]);
    }

    #[test]
    fn highpass_passes_high_and_rejects_low() {
        let filter = HighpassFilter::butterworth(10, 500.0, 8000).unwrap();
        let low = filter.apply(&sine(50.0, 8000, 1.0));
        let high = filter.apply(&sine(2000.0, 8000, 1.0));
        assert!(rms(&low[4000..]) < 1e-3);
        assert!((rms(&high[4000..]) - 0.5f64.sqrt()).abs() < 0.02);
    }

    #[test]
    fn highpass_rejects_invalid_cutoff() {
        assert!(HighpassFilter::butterworth(10, 4000.0, 8000).is_err());
        assert!(HighpassFilter::butterworth(0, 100.0, 8000).is_err());
    }

    #[test]
    fn missing_file_is_not_found() {
        let err = read(Path::new("/definitely/not/here.wav"), 8000, None).unwrap_err();
        assert!(matches!(err, Error::NotFound(_)));
    }

    #[test]
    fn delayed_prepends_silence() {
        let signal = PcmSignal::new(vec![5; 4], 4);
        let delayed = signal.delayed(0.5);
        assert_eq!(delayed.samples, vec![0, 0, 5, 5, 5, 5]);
    }
}
