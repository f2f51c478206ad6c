use std::f32::consts::PI;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};

const LOWEST_BAND_HZ: f32 = 100.0;
const HIGHEST_BAND_HZ: f32 = 4000.0;

/// Spectral summary of one frame for input-level feedback.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct FrameAnalysis {
    /// Magnitude per frequency bucket, roughly in [0, 1]
    pub bands: Vec<f32>,
    /// Largest absolute sample, clamped to [0, 1]
    pub peak: f32,
}

/// Analyze a frame into `band_count` log-spaced buckets and a peak level.
pub fn analyze(samples: &[f32], sample_rate: u32, band_count: usize) -> FrameAnalysis {
    let peak = samples
        .iter()
        .fold(0.0f32, |acc, s| acc.max(s.abs()))
        .min(1.0);

    let bands = band_centers(band_count, sample_rate)
        .into_iter()
        .map(|freq| goertzel_magnitude(samples, sample_rate, freq))
        .collect();

    FrameAnalysis { bands, peak }
}

fn band_centers(band_count: usize, sample_rate: u32) -> Vec<f32> {
    let nyquist = sample_rate as f32 / 2.0;
    let high = HIGHEST_BAND_HZ.min(nyquist * 0.9);
    match band_count {
        0 => Vec::new(),
        1 => vec![(LOWEST_BAND_HZ * high).sqrt()],
        n => {
            let ratio = (high / LOWEST_BAND_HZ).powf(1.0 / (n - 1) as f32);
            (0..n)
                .map(|i| LOWEST_BAND_HZ * ratio.powi(i as i32))
                .collect()
        }
    }
}

/// Amplitude of a single frequency component, normalized so a full-scale
/// sine at `freq` reads close to 1.0.
fn goertzel_magnitude(samples: &[f32], sample_rate: u32, freq: f32) -> f32 {
    if samples.is_empty() {
        return 0.0;
    }
    let omega = 2.0 * PI * freq / sample_rate as f32;
    let coeff = 2.0 * omega.cos();
    let (mut s1, mut s2) = (0.0f32, 0.0f32);
    for &x in samples {
        let s0 = x + coeff * s1 - s2;
        s2 = s1;
        s1 = s0;
    }
    let power = s1 * s1 + s2 * s2 - coeff * s1 * s2;
    (power.max(0.0).sqrt() * 2.0 / samples.len() as f32).min(1.0)
}

/// Latest input level, shared between the capture thread and the UI.
#[derive(Clone, Debug, Default)]
pub struct LevelMeter {
    peak_bits: Arc<AtomicU32>,
    bands: Arc<Mutex<Vec<f32>>>,
}

impl LevelMeter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn publish(&self, analysis: FrameAnalysis) {
        self.peak_bits
            .store(analysis.peak.to_bits(), Ordering::Relaxed);
        *super::lock(&self.bands) = analysis.bands;
    }

    pub fn peak(&self) -> f32 {
        f32::from_bits(self.peak_bits.load(Ordering::Relaxed))
    }

    pub fn snapshot(&self) -> FrameAnalysis {
        FrameAnalysis {
            bands: super::lock(&self.bands).clone(),
            peak: self.peak(),
        }
    }
}
