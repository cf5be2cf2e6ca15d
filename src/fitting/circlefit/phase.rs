use crate::fitting::common::error::{FitError, FittingResult};
use crate::fitting::common::preprocessing::{wrap_phase, FrequencyScale};
use num_complex::Complex64;
use rmpfit::{MPConfig, MPFitter, MPPar, MPResult};

const THETA0: usize = 0;
const QL: usize = 1;
const FR: usize = 2;

/// Result of the phase fit of a centered resonance circle.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PhaseFit {
    /// Phase at resonance, wrapped into `[-π, π)`
    pub theta0: f64,
    pub ql: f64,
    pub fr: f64,
}

/// `theta0 + 2 atan(2 Ql (1 - f / fr))`
pub fn phase_model(f: f64, theta0: f64, ql: f64, fr: f64) -> f64 {
    theta0 + 2.0 * (2.0 * ql * (1.0 - f / fr)).atan()
}

/// Fits the phase response of a circle centered at the origin.
///
/// The loaded quality factor and resonance frequency are strongly correlated with the reference
/// phase, so they are released in stages before a final fit of all three.
///
/// # Errors
/// Will return `Err(FitError::BadFit)` if an optimizer stage fails.
pub fn fit_phase(
    f_data: &[f64],
    z_centered: &[Complex64],
    theta0: f64,
    ql: f64,
    fr: f64,
) -> FittingResult<PhaseFit> {
    let scale = FrequencyScale::new(f_data);
    let mut problem = PhaseProblem {
        x: f_data.iter().map(|f| scale.to_unit(*f)).collect(),
        phase: z_centered.iter().map(|z| z.arg()).collect(),
        scale,
        base: [theta0, ql.abs().max(1.0), scale.to_unit(fr)],
        free: vec![],
        limits: vec![],
    };

    for free in [
        vec![THETA0, FR],
        vec![QL, FR],
        vec![FR],
        vec![QL],
        vec![THETA0, QL, FR],
    ] {
        problem.release(free);
        let mut params = problem.initial();
        problem
            .mpfit(&mut params)
            .map_err(|e| FitError::BadFit(format!("Error with MPFit: {e}")))?;
        problem.absorb(&params);
    }

    let [theta0, ql, ur] = problem.base;
    Ok(PhaseFit {
        theta0: wrap_phase(theta0),
        ql,
        fr: scale.to_hz(ur),
    })
}

/// Phase model in normalized frequency, parameters `[theta0, Ql, ur]` of which only `free` vary.
struct PhaseProblem {
    x: Vec<f64>,
    phase: Vec<f64>,
    scale: FrequencyScale,
    base: [f64; 3],
    free: Vec<usize>,
    limits: Vec<MPPar>,
}

impl PhaseProblem {
    fn release(&mut self, free: Vec<usize>) {
        self.limits = free
            .iter()
            .map(|&i| match i {
                QL => MPPar {
                    limited_low: true,
                    limit_low: 1.0,
                    ..Default::default()
                },
                _ => MPPar::default(),
            })
            .collect();
        self.free = free;
    }

    fn initial(&self) -> Vec<f64> {
        self.free.iter().map(|&i| self.base[i]).collect()
    }

    fn absorb(&mut self, params: &[f64]) {
        for (&i, &p) in self.free.iter().zip(params.iter()) {
            self.base[i] = p;
        }
    }
}

impl MPFitter for PhaseProblem {
    fn eval(&mut self, params: &[f64], deviates: &mut [f64]) -> MPResult<()> {
        let mut p = self.base;
        for (&i, &v) in self.free.iter().zip(params.iter()) {
            p[i] = v;
        }
        let [theta0, ql, ur] = p;
        let fr = self.scale.to_hz(ur);
        for ((dev, x), phase) in deviates.iter_mut().zip(self.x.iter()).zip(self.phase.iter()) {
            let model = theta0 + 2.0 * (2.0 * ql * self.scale.span * (ur - x) / fr).atan();
            *dev = wrap_phase(phase - model);
        }
        Ok(())
    }

    fn number_of_points(&self) -> usize {
        self.x.len()
    }

    fn config(&self) -> MPConfig {
        MPConfig {
            ftol: 1e-10,
            xtol: 1e-10,
            max_fev: 1000,
            ..Default::default()
        }
    }

    fn parameters(&self) -> Option<&[MPPar]> {
        Some(&*self.limits)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    #[test]
    fn recovers_phase_parameters() {
        let (theta0, ql, fr) = (2.9, 8.0e3, 7.2e9);
        let f: Vec<f64> = (0..301)
            .map(|i| fr - 3.0e6 + 6.0e6 * i as f64 / 300.0)
            .collect();
        let z: Vec<Complex64> = f
            .iter()
            .map(|f| Complex64::from_polar(0.3, phase_model(*f, theta0, ql, fr)))
            .collect();
        let fit = fit_phase(&f, &z, 3.0, 5.0e3, fr + 2.0e5).expect("phase fit failed");
        assert_relative_eq!(fit.theta0, theta0, epsilon = 1e-6);
        assert_relative_eq!(fit.ql, ql, max_relative = 1e-5);
        assert_relative_eq!(fit.fr, fr, max_relative = 1e-9);
    }

    #[test]
    fn wrapped_residual_handles_branch_cut() {
        let (theta0, ql, fr) = (-3.0, 2.0e3, 5.0e9);
        let f: Vec<f64> = (0..201)
            .map(|i| fr - 1.0e7 + 2.0e7 * i as f64 / 200.0)
            .collect();
        let z: Vec<Complex64> = f
            .iter()
            .map(|f| Complex64::from_polar(1.0, phase_model(*f, theta0, ql, fr)))
            .collect();
        let fit = fit_phase(&f, &z, 3.2, 2.5e3, fr).expect("phase fit failed");
        assert_relative_eq!(wrap_phase(fit.theta0 - theta0), 0.0, epsilon = 1e-6);
        assert_relative_eq!(fit.ql, ql, max_relative = 1e-5);
    }
}
