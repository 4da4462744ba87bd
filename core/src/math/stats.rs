pub struct StatsHelper;

impl StatsHelper {
    pub fn rms(samples: &[f32]) -> f32 {
        if samples.is_empty() {
            return 0.0;
        }
        let sum_sq: f64 = samples.iter().map(|&v| f64::from(v) * f64::from(v)).sum();
        (sum_sq / samples.len() as f64).sqrt() as f32
    }

    pub fn mean(samples: &[f32]) -> f32 {
        if samples.is_empty() {
            return 0.0;
        }
        let sum: f64 = samples.iter().map(|&v| f64::from(v)).sum();
        (sum / samples.len() as f64) as f32
    }

    /// Largest backwards step in a timestamp sequence, zero if none.
    pub fn max_regression(timestamps: &[f64]) -> f64 {
        timestamps
            .windows(2)
            .map(|pair| pair[0] - pair[1])
            .fold(0.0, f64::max)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rms_zero_sequence_yields_zero() {
        assert_eq!(StatsHelper::rms(&[]), 0.0);
        assert_eq!(StatsHelper::rms(&[0.0, 0.0]), 0.0);
    }

    #[test]
    fn rms_handles_single_value() {
        assert_eq!(StatsHelper::rms(&[4.0]), 4.0);
    }

    #[test]
    fn mean_of_offset_signal() {
        assert_eq!(StatsHelper::mean(&[1.0, 2.0, 3.0]), 2.0);
        assert_eq!(StatsHelper::mean(&[]), 0.0);
    }

    #[test]
    fn regression_detects_backward_jump() {
        assert_eq!(StatsHelper::max_regression(&[0.0, 0.1, 0.2]), 0.0);
        assert!((StatsHelper::max_regression(&[0.0, 0.5, 0.2, 0.3]) - 0.3).abs() < 1e-12);
    }
}
