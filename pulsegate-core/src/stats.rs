//! Duration statistics for the pulse sample

use std::time::Duration;

/// Arithmetic mean and coefficient of variation (population σ/μ) over a
/// sample of durations. CV is 0 when the mean is 0, so a degenerate
/// measurement never puts NaN in a gauge.
pub fn mean_and_cv(samples: &[Duration]) -> (Duration, f64) {
    if samples.is_empty() {
        return (Duration::ZERO, 0.0);
    }

    let sum: u128 = samples.iter().map(|d| d.as_nanos()).sum();
    let mean_ns = sum / samples.len() as u128;

    let mut variance = 0.0;
    for d in samples {
        let delta = d.as_nanos() as f64 - mean_ns as f64;
        variance += delta * delta;
    }
    variance /= samples.len() as f64;

    let mean = Duration::from_nanos(mean_ns as u64);
    let cv = if mean_ns > 0 {
        variance.sqrt() / mean_ns as f64
    } else {
        0.0
    };
    (mean, cv)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn uniform_samples_have_zero_cv() {
        for ms in [1u64, 7, 40, 500] {
            let samples = vec![Duration::from_millis(ms); 5];
            let (mean, cv) = mean_and_cv(&samples);
            assert_eq!(mean, Duration::from_millis(ms));
            assert_eq!(cv, 0.0);
        }
    }

    #[test]
    fn known_sample_matches_population_stddev() {
        // [10, 10, 10, 10, 50] ms: mean 18ms, population sigma 16ms, cv 8/9.
        let samples: Vec<Duration> = [10u64, 10, 10, 10, 50]
            .iter()
            .map(|&ms| Duration::from_millis(ms))
            .collect();
        let (mean, cv) = mean_and_cv(&samples);
        assert_eq!(mean, Duration::from_millis(18));
        assert!((cv - 16.0 / 18.0).abs() < 1e-9);
    }

    #[test]
    fn zero_mean_yields_zero_cv() {
        let samples = vec![Duration::ZERO; 5];
        let (mean, cv) = mean_and_cv(&samples);
        assert_eq!(mean, Duration::ZERO);
        assert_eq!(cv, 0.0);
    }

    #[test]
    fn empty_sample_is_degenerate_not_nan() {
        let (mean, cv) = mean_and_cv(&[]);
        assert_eq!(mean, Duration::ZERO);
        assert_eq!(cv, 0.0);
    }

    #[test]
    fn cv_is_scale_invariant() {
        let base: Vec<Duration> = [2u64, 4, 6, 8, 10]
            .iter()
            .map(|&ms| Duration::from_millis(ms))
            .collect();
        let scaled: Vec<Duration> = [20u64, 40, 60, 80, 100]
            .iter()
            .map(|&ms| Duration::from_millis(ms))
            .collect();
        let (_, cv_base) = mean_and_cv(&base);
        let (_, cv_scaled) = mean_and_cv(&scaled);
        assert!((cv_base - cv_scaled).abs() < 1e-9);
    }
}
