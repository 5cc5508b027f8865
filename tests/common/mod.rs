//! Synthetic WAV fixtures for integration tests.
//!
//! Signals are sequences of short three-note chords with random pitches,
//! each shaped by a Hann envelope, so spectrogram peaks are dense and
//! reproducible for a given seed.

#![allow(dead_code)]

use std::f64::consts::PI;
use std::path::{Path, PathBuf};

use hound::{SampleFormat, WavSpec, WavWriter};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

const CHORD_SECONDS: f64 = 0.25;
const NOTE_AMPLITUDE: f64 = 3000.0;

pub fn chord_sequence(seconds: f64, sample_rate: u32, seed: u64) -> Vec<i16> {
    let mut rng = StdRng::seed_from_u64(seed);
    let len = (seconds * sample_rate as f64) as usize;
    let chord_len = ((CHORD_SECONDS * sample_rate as f64) as usize).max(1);
    let nyquist = sample_rate as f64 / 2.0;
    let mut samples = Vec::with_capacity(len);

    let mut notes = [0.0f64; 3];
    for i in 0..len {
        let pos = i % chord_len;
        if pos == 0 {
            for note in notes.iter_mut() {
                *note = rng.gen_range(300.0..(nyquist * 0.8).min(4000.0));
            }
        }
        let envelope = 0.5 - 0.5 * (2.0 * PI * pos as f64 / chord_len as f64).cos();
        let t = i as f64 / sample_rate as f64;
        let value: f64 = notes
            .iter()
            .map(|f| (2.0 * PI * f * t).sin() * NOTE_AMPLITUDE)
            .sum();
        samples.push((value * envelope) as i16);
    }
    samples
}

pub fn silence(samples: usize) -> Vec<i16> {
    vec![0; samples]
}

/// `before` zeros, then `clip`, then `after` zeros.
pub fn embed(clip: &[i16], before: usize, after: usize) -> Vec<i16> {
    let mut out = silence(before);
    out.extend_from_slice(clip);
    out.extend(silence(after));
    out
}

pub fn write_wav(path: &Path, samples: &[i16], sample_rate: u32) -> PathBuf {
    let spec = WavSpec {
        channels: 1,
        sample_rate,
        bits_per_sample: 16,
        sample_format: SampleFormat::Int,
    };
    let mut writer = WavWriter::create(path, spec).unwrap();
    for &sample in samples {
        writer.write_sample(sample).unwrap();
    }
    writer.finalize().unwrap();
    path.to_path_buf()
}
