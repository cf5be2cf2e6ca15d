use crate::fitting::circlefit::circle::fit_circle;
use crate::fitting::circlefit::least_squares::LeastSquares;
use crate::fitting::common::error::{FitError, FittingResult};
use crate::fitting::common::preprocessing::{unwrap_phase, FrequencyScale};
use num_complex::Complex64;
use rmpfit::{MPConfig, MPFitter, MPPar, MPResult};
use std::f64::consts::PI;

/// Initial cable delay from the slope of the unwrapped phase, `τ = -slope / 2π`.
pub fn guess_delay(f_data: &[f64], z_data: &[Complex64]) -> f64 {
    let phase = unwrap_phase(&z_data.iter().map(|z| z.arg()).collect::<Vec<f64>>());
    let lsq = LeastSquares::line_fit(f_data, &phase);
    if lsq.slope.is_finite() {
        -lsq.slope / (2.0 * PI)
    } else {
        0.0
    }
}

/// Refines the cable delay until `z · exp(2πi f τ)` lies on a circle.
///
/// The circle is refit on every evaluation, so the optimizer only sees the delay.
///
/// # Errors
/// Will return `Err(FitError::DelayFitDiverged)` if the optimizer fails, uses up
/// `max_evaluations`, or lands on a non-finite delay. Callers fall back to zero delay.
pub fn fit_delay(
    f_data: &[f64],
    z_data: &[Complex64],
    initial_delay: f64,
    max_evaluations: usize,
) -> FittingResult<f64> {
    let scale = FrequencyScale::new(f_data);
    // beyond half a turn per sample the delay aliases
    let limit = 0.5 * f_data.len().max(2) as f64;
    let guess = (initial_delay * scale.span).clamp(-0.99 * limit, 0.99 * limit);

    let mut problem = DelayProblem {
        x: f_data.iter().map(|f| scale.to_unit(*f)).collect(),
        z_data: z_data.to_vec(),
        max_evaluations,
        evaluations: 0,
        params: vec![MPPar {
            limited_low: true,
            limit_low: -limit,
            limited_up: true,
            limit_up: limit,
            ..Default::default()
        }],
    };
    let mut params = vec![guess];
    let outcome = problem.mpfit(&mut params);
    let evaluations = problem.evaluations;
    let delay = params[0] / scale.span;

    match outcome {
        Ok(_) if evaluations < max_evaluations && delay.is_finite() => {
            tracing::debug!(delay, evaluations, "cable delay fit");
            Ok(delay)
        }
        Ok(_) => Err(FitError::DelayFitDiverged { evaluations }),
        Err(e) => {
            tracing::debug!("delay optimizer failed: {e}");
            Err(FitError::DelayFitDiverged { evaluations })
        }
    }
}

/// Circularity defect as a function of the delay, parameter `[τ · span]`
struct DelayProblem {
    x: Vec<f64>,
    z_data: Vec<Complex64>,
    max_evaluations: usize,
    evaluations: usize,
    params: Vec<MPPar>,
}

impl MPFitter for DelayProblem {
    fn eval(&mut self, params: &[f64], deviates: &mut [f64]) -> MPResult<()> {
        self.evaluations += 1;
        let rotated: Vec<Complex64> = self
            .z_data
            .iter()
            .zip(self.x.iter())
            .map(|(z, x)| z * Complex64::from_polar(1.0, 2.0 * PI * params[0] * x))
            .collect();
        match fit_circle(&rotated) {
            Ok(circle) => {
                for (dev, r) in deviates.iter_mut().zip(circle.residuals(&rotated)) {
                    *dev = r;
                }
            }
            // a degenerate trial delay scores as a circle of zero radius at the origin
            Err(_) => {
                for (dev, z) in deviates.iter_mut().zip(rotated.iter()) {
                    *dev = z.norm();
                }
            }
        }
        Ok(())
    }

    fn number_of_points(&self) -> usize {
        self.x.len()
    }

    fn config(&self) -> MPConfig {
        MPConfig {
            ftol: 1e-12,
            xtol: 1e-12,
            max_fev: self.max_evaluations,
            ..Default::default()
        }
    }

    fn parameters(&self) -> Option<&[MPPar]> {
        Some(&*self.params)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    fn delayed_circle(delay: f64) -> (Vec<f64>, Vec<Complex64>) {
        let (fr, ql) = (5.0e9, 5.0e3);
        let f: Vec<f64> = (0..401)
            .map(|i| fr - 5.0e6 + 10.0e6 * i as f64 / 400.0)
            .collect();
        let z = f
            .iter()
            .map(|f| {
                let notch = 1.0 - 0.4 / Complex64::new(1.0, 2.0 * ql * (f - fr) / fr);
                notch * Complex64::from_polar(0.7, -2.0 * PI * f * delay)
            })
            .collect();
        (f, z)
    }

    #[test]
    fn guess_has_delay_sign() {
        let (f, z) = delayed_circle(60e-9);
        let guess = guess_delay(&f, &z);
        assert!(guess > 0.0);
        assert_relative_eq!(guess, 60e-9, max_relative = 0.2);
    }

    #[test]
    fn fit_restores_circularity() {
        let (f, z) = delayed_circle(60e-9);
        let delay = fit_delay(&f, &z, guess_delay(&f, &z), 200).expect("delay fit failed");
        assert_relative_eq!(delay, 60e-9, max_relative = 1e-4);
    }

    #[test]
    fn exhausted_budget_diverges() {
        let (f, z) = delayed_circle(60e-9);
        assert!(matches!(
            fit_delay(&f, &z, 0.0, 1),
            Err(FitError::DelayFitDiverged { .. })
        ));
    }
}
