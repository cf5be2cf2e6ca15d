use crate::fitting::common::error::{FitError, FittingResult};
use itertools::Itertools;
use num_complex::Complex64;
use std::f64::consts::PI;

/// Checks that a trace can be fitted at all.
///
/// # Errors
/// Will return `Err` if the arrays are empty, differ in length, contain non-finite values,
/// or if the frequencies are not strictly monotonic.
pub fn validate_trace(f_data: &[f64], z_data: &[Complex64]) -> FittingResult<()> {
    if f_data.is_empty() || z_data.is_empty() {
        Err(FitError::InvalidInput("empty frequency or response array".to_string()))?
    }
    if f_data.len() != z_data.len() {
        Err(FitError::InvalidInput(format!(
            "{} frequencies but {} response samples",
            f_data.len(),
            z_data.len()
        )))?
    }
    if f_data.iter().any(|f| !f.is_finite()) {
        Err(FitError::InvalidInput("non-finite frequency".to_string()))?
    }
    if z_data.iter().any(|z| !(z.re.is_finite() && z.im.is_finite())) {
        Err(FitError::InvalidInput("non-finite response sample".to_string()))?
    }
    let increasing = f_data.iter().tuple_windows().all(|(a, b)| b > a);
    let decreasing = f_data.iter().tuple_windows().all(|(a, b)| b < a);
    if !(increasing || decreasing) {
        Err(FitError::InvalidInput(
            "frequencies are not strictly monotonic".to_string(),
        ))?
    }
    Ok(())
}

/// Maps frequencies to the dimensionless coordinate `u = (f - center) / span`.
///
/// The optimizers work in `u` so that finite-difference steps stay meaningful
/// for GHz-scale frequencies.
#[derive(Debug, Clone, Copy, PartialEq)]
pub(crate) struct FrequencyScale {
    pub center: f64,
    pub span: f64,
}

impl FrequencyScale {
    pub(crate) fn new(f_data: &[f64]) -> FrequencyScale {
        let (lo, hi) = f_data
            .iter()
            .copied()
            .minmax_by(f64::total_cmp)
            .into_option()
            .unwrap_or((0.0, 1.0));
        let span = if hi > lo { hi - lo } else { 1.0 };
        FrequencyScale {
            center: 0.5 * (lo + hi),
            span,
        }
    }

    pub(crate) fn to_unit(&self, f: f64) -> f64 {
        (f - self.center) / self.span
    }

    pub(crate) fn to_hz(&self, u: f64) -> f64 {
        self.center + u * self.span
    }
}

/// Periodic boundary: maps `x` into `[-π, π)`.
pub fn wrap_phase(x: f64) -> f64 {
    (x + PI).rem_euclid(2.0 * PI) - PI
}

/// Removes 2π jumps between consecutive phases.
pub fn unwrap_phase(phases: &[f64]) -> Vec<f64> {
    let mut unwrapped = Vec::with_capacity(phases.len());
    let mut offset = 0.0;
    for (i, &p) in phases.iter().enumerate() {
        if i > 0 {
            let jump = p - phases[i - 1];
            if jump.abs() >= PI {
                offset += wrap_phase(jump) - jump;
            }
        }
        unwrapped.push(p + offset);
    }
    unwrapped
}

/// Moving average over `window` points, shrinking at the edges.
pub(crate) fn smooth(values: &[f64], window: usize) -> Vec<f64> {
    let half = window / 2;
    (0..values.len())
        .map(|i| {
            let lo = i.saturating_sub(half);
            let hi = (i + half + 1).min(values.len());
            values[lo..hi].iter().sum::<f64>() / (hi - lo) as f64
        })
        .collect()
}

/// Estimates the resonance as the frequency where the smoothed phase changes fastest.
pub(crate) fn phase_derivative_peak(f_data: &[f64], z_data: &[Complex64], window: usize) -> f64 {
    let phase = unwrap_phase(&z_data.iter().map(|z| z.arg()).collect::<Vec<f64>>());
    let phase = smooth(&phase, window.max(1));
    let n = phase.len();
    if n < 3 {
        return f_data[n / 2];
    }
    let derivative: Vec<f64> = (0..n)
        .map(|i| {
            let (lo, hi) = (i.saturating_sub(1), (i + 1).min(n - 1));
            (phase[hi] - phase[lo]) / (f_data[hi] - f_data[lo])
        })
        .collect();
    let peak = derivative
        .iter()
        .position_max_by(|a, b| a.abs().total_cmp(&b.abs()))
        .unwrap_or(n / 2);
    f_data[peak]
}

/// Index of the smallest element, comparing by the given key.
pub(crate) fn argmin_by<T, F: Fn(&T) -> f64>(values: &[T], key: F) -> usize {
    values
        .iter()
        .position_min_by(|a, b| key(a).total_cmp(&key(b)))
        .unwrap_or(0)
}

/// Index of the largest element, comparing by the given key.
pub(crate) fn argmax_by<T, F: Fn(&T) -> f64>(values: &[T], key: F) -> usize {
    values
        .iter()
        .position_max_by(|a, b| key(a).total_cmp(&key(b)))
        .unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    #[test]
    fn rejects_bad_traces() {
        let z = vec![Complex64::new(1.0, 0.0); 3];
        assert!(matches!(
            validate_trace(&[], &[]),
            Err(FitError::InvalidInput(_))
        ));
        assert!(validate_trace(&[1.0, 2.0], &z).is_err());
        assert!(validate_trace(&[1.0, 3.0, 2.0], &z).is_err());
        assert!(validate_trace(&[1.0, 2.0, 2.0], &z).is_err());
        assert!(validate_trace(&[3.0, 2.0, 1.0], &z).is_ok());
        assert!(validate_trace(&[1.0, f64::NAN, 3.0], &z).is_err());
    }

    #[test]
    fn wrap_is_periodic() {
        assert_relative_eq!(wrap_phase(0.5), 0.5);
        assert_relative_eq!(wrap_phase(1.5 * PI), -0.5 * PI, epsilon = 1e-12);
        assert_relative_eq!(wrap_phase(-1.5 * PI), 0.5 * PI, epsilon = 1e-12);
        assert_relative_eq!(wrap_phase(7.0 * PI + 0.1), -PI + 0.1, epsilon = 1e-12);
    }

    #[test]
    fn unwrap_restores_linear_ramp() {
        let ramp: Vec<f64> = (0..50).map(|i| -0.4 * i as f64).collect();
        let wrapped: Vec<f64> = ramp.iter().map(|&p| wrap_phase(p)).collect();
        let unwrapped = unwrap_phase(&wrapped);
        for (u, r) in unwrapped.iter().zip(ramp.iter()) {
            assert_relative_eq!(u - unwrapped[0], r - ramp[0], epsilon = 1e-9);
        }
    }

    #[test]
    fn frequency_scale_round_trips() {
        let scale = FrequencyScale::new(&[4.9e9, 5.0e9, 5.1e9]);
        assert_relative_eq!(scale.center, 5.0e9);
        assert_relative_eq!(scale.span, 0.2e9, max_relative = 1e-12);
        assert_relative_eq!(scale.to_hz(scale.to_unit(5.05e9)), 5.05e9);
    }
}
