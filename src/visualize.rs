use std::path::Path;

use image::{Rgb, RgbImage};
use tracing::{debug, info};

use crate::error::Result;
use crate::peaks::Peak;
use crate::spectrogram::Spectrogram;

const PEAK_COLOR: Rgb<u8> = Rgb([255, 0, 0]);

/// Range of the non-zero cells; zero cells are silence and render black.
fn value_range(bins: &[Vec<f64>]) -> (f64, f64) {
    let mut min = f64::MAX;
    let mut max = f64::MIN;
    for &value in bins.iter().flatten().filter(|v| **v != 0.0) {
        min = min.min(value);
        max = max.max(value);
    }
    if min > max { (0.0, 1.0) } else { (min, max) }
}

/// Renders a spectrogram as a grayscale image with time on the x axis and
/// low frequencies at the bottom, then marks `peaks` in red.
pub fn render(spectrogram: &Spectrogram, peaks: &[Peak]) -> RgbImage {
    let width = spectrogram.num_frames();
    let height = spectrogram.num_bins();
    let mut img = RgbImage::new(width as u32, height as u32);
    if width == 0 || height == 0 {
        return img;
    }

    let (min, max) = value_range(&spectrogram.bins);
    let range = if max - min < 1e-6 { 1.0 } else { max - min };

    for (f, row) in spectrogram.bins.iter().enumerate() {
        for (t, &value) in row.iter().enumerate() {
            let intensity = if value == 0.0 {
                0
            } else {
                (((value - min) / range).clamp(0.0, 1.0) * 255.0).round() as u8
            };
            let y = (height - 1 - f) as u32;
            img.put_pixel(t as u32, y, Rgb([intensity, intensity, intensity]));
        }
    }

    for peak in peaks {
        if peak.time < width && peak.freq < height {
            let y = (height - 1 - peak.freq) as u32;
            img.put_pixel(peak.time as u32, y, PEAK_COLOR);
        }
    }
    debug!(width, height, peaks = peaks.len(), "Rendered spectrogram");
    img
}

/// Writes [`render`] output to `path`; the format follows the extension.
pub fn save_spectrogram(spectrogram: &Spectrogram, peaks: &[Peak], path: &Path) -> Result<()> {
    render(spectrogram, peaks).save(path)?;
    info!(path = %path.display(), "Spectrogram saved");
    Ok(())
}
