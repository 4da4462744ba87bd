use num_complex::Complex64;
use rustfft::{num_traits::Zero, Fft, FftPlanner};
use std::sync::Arc;

/// Helper that wraps the `rustfft` planner for reuse on equal-length windows.
pub struct FftHelper {
    fft: Arc<dyn Fft<f64>>,
    scratch: Vec<Complex64>,
    size: usize,
}

impl FftHelper {
    pub fn new(size: usize) -> Self {
        let size = size.max(1);
        let mut planner = FftPlanner::new();
        let fft = planner.plan_fft_forward(size);
        let scratch = vec![Complex64::zero(); fft.get_inplace_scratch_len()];
        Self { fft, scratch, size }
    }

    pub fn size(&self) -> usize {
        self.size
    }

    /// One-sided power spectrum of `input` (zero-padded or truncated to the
    /// planned size) as `(frequency_hz, power)` pairs up to Nyquist.
    pub fn power_spectrum(&mut self, input: &[f32], sampling_rate: f64) -> Vec<(f64, f64)> {
        let size = self.size();
        let mut buffer: Vec<Complex64> = input
            .iter()
            .take(size)
            .map(|&value| Complex64::new(f64::from(value), 0.0))
            .collect();
        buffer.resize(size, Complex64::zero());
        self.fft.process_with_scratch(&mut buffer, &mut self.scratch);

        let norm = 1.0 / (size as f64 * size as f64);
        buffer
            .iter()
            .take(size / 2 + 1)
            .enumerate()
            .map(|(bin, value)| {
                let freq = bin as f64 * sampling_rate / size as f64;
                let edge = bin == 0 || (size % 2 == 0 && bin == size / 2);
                let power = value.norm_sqr() * norm * if edge { 1.0 } else { 2.0 };
                (freq, power)
            })
            .collect()
    }

    /// Total power between `low` and `high` Hz inclusive.
    pub fn band_power(&mut self, input: &[f32], sampling_rate: f64, low: f64, high: f64) -> f64 {
        self.power_spectrum(input, sampling_rate)
            .into_iter()
            .filter(|(freq, _)| *freq >= low && *freq <= high)
            .map(|(_, power)| power)
            .sum()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::f64::consts::PI;

    #[test]
    fn spectrum_covers_zero_to_nyquist() {
        let mut helper = FftHelper::new(8);
        let spectrum = helper.power_spectrum(&[1.0, 0.0, -1.0, 0.0], 8.0);
        assert_eq!(spectrum.len(), 5);
        assert_eq!(spectrum[4].0, 4.0);
    }

    #[test]
    fn sine_power_lands_in_its_bin() {
        let rate = 250.0;
        let samples: Vec<f32> = (0..250)
            .map(|i| (2.0 * PI * 50.0 * i as f64 / rate).sin() as f32)
            .collect();
        let mut helper = FftHelper::new(samples.len());
        let line = helper.band_power(&samples, rate, 49.5, 50.5);
        let total = helper.band_power(&samples, rate, 0.0, rate / 2.0);
        assert!((line - 0.5).abs() < 1e-6);
        assert!((total - line).abs() < 1e-6);
    }
}
