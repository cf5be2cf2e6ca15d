//! Joint least-squares fit of the resonance and its environment on the raw trace.
//!
//! The circle fit runs on data normalized with the calibration constants and its errors hold
//! those constants fixed. Here `a`, `alpha` and the delay vary together with the resonance,
//! and the errors come from the full complex Jacobian.
use crate::fitting::circlefit::calibration::CircleGeometry;
use crate::fitting::circlefit::covariance::{
    complex_covariance, notch_gradient, reflection_gradient, Covariance,
};
use crate::fitting::common::error::{FitError, FittingResult};
use crate::fitting::common::preprocessing::{wrap_phase, FrequencyScale};
use nalgebra::DMatrix;
use num_complex::Complex64;
use rmpfit::{MPConfig, MPFitter, MPPar, MPResult};
use std::f64::consts::PI;

pub const FR: usize = 0;
pub const QC: usize = 1;
pub const QL: usize = 2;
pub const PHI0: usize = 3;
pub const A: usize = 4;
pub const ALPHA: usize = 5;
pub const DELAY: usize = 6;

/// Resonance and environment of a raw trace. `qc` is `|Qc|` for notch ports, reflection
/// ports ignore `phi0`.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct JointParameters {
    pub fr: f64,
    pub qc: f64,
    pub ql: f64,
    pub phi0: f64,
    pub a: f64,
    pub alpha: f64,
    pub delay: f64,
}

impl JointParameters {
    /// `a e^{iα} e^{-2πi f τ}` times the ideal response of `geometry`.
    pub fn evaluate(&self, f: f64, geometry: CircleGeometry) -> Complex64 {
        let detuning = 2.0 * self.ql * (f - self.fr) / self.fr;
        let environment = Complex64::from_polar(self.a, self.alpha - 2.0 * PI * f * self.delay);
        environment * ideal(geometry, self.ql, self.qc, self.phi0, detuning)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct JointFit {
    pub params: JointParameters,
    /// Indexed as `[fr, Qc, Ql, phi0, a, alpha, delay]`, rows of fixed parameters are zero.
    /// `None` when errors were not requested or the normal matrix is singular.
    pub covariance: Option<Covariance>,
    pub chi_square: f64,
}

fn ideal(geometry: CircleGeometry, ql: f64, qc: f64, phi0: f64, detuning: f64) -> Complex64 {
    let d = Complex64::new(1.0, detuning);
    match geometry {
        CircleGeometry::Notch => 1.0 - Complex64::from_polar(ql / qc, phi0) / d,
        CircleGeometry::Reflection => 2.0 * ql / qc / d - 1.0,
    }
}

/// Fits resonance and environment to a raw trace whose background slope was already removed,
/// starting from `seed`. The delay is held at its seed when `fix_delay` is set.
///
/// # Errors
/// Will return `Err(FitError::BadFit)` if the optimizer fails or ends on non-finite values.
pub fn fit_joint(
    f_data: &[f64],
    z_data: &[Complex64],
    geometry: CircleGeometry,
    seed: &JointParameters,
    fix_delay: bool,
    calc_errors: bool,
) -> FittingResult<JointFit> {
    let scale = FrequencyScale::new(f_data);
    let mut free = vec![FR, QC, QL];
    if geometry == CircleGeometry::Notch {
        free.push(PHI0);
    }
    free.extend([A, ALPHA]);
    if !fix_delay {
        free.push(DELAY);
    }

    let mut problem = JointProblem::new(f_data, z_data, geometry, scale, seed, free);
    let mut params = problem.initial();
    let status = problem
        .mpfit(&mut params)
        .map_err(|e| FitError::BadFit(format!("Error with MPFit: {e}")))?;
    problem.absorb(&params);
    let fitted = problem.physical();
    if [fitted.fr, fitted.qc, fitted.ql, fitted.phi0, fitted.a, fitted.alpha, fitted.delay]
        .iter()
        .any(|v| !v.is_finite())
    {
        Err(FitError::BadFit("joint fit ended on non-finite parameters".to_string()))?
    }
    tracing::debug!(
        fr = fitted.fr,
        ql = fitted.ql,
        qc = fitted.qc,
        delay = fitted.delay,
        best_norm = status.best_norm,
        n_fev = status.n_fev,
        "joint fit"
    );

    let residuals: Vec<Complex64> = f_data
        .iter()
        .zip(z_data.iter())
        .map(|(f, z)| z - fitted.evaluate(*f, geometry))
        .collect();
    let n_free = problem.free.len();
    let dof = f_data.len().saturating_sub(n_free).max(1);
    let chi_square = residuals.iter().map(|r| r.norm_sqr()).sum::<f64>() / dof as f64;
    let covariance = if calc_errors {
        joint_covariance(f_data, &residuals, geometry, &fitted, scale.center, &problem.free).ok()
    } else {
        None
    };
    Ok(JointFit {
        params: fitted,
        covariance,
        chi_square,
    })
}

/// Covariance in physical units. The Jacobian is taken with the phase referenced to `center`,
/// which decorrelates it from the delay, and then mapped back onto `alpha`.
fn joint_covariance(
    f_data: &[f64],
    residuals: &[Complex64],
    geometry: CircleGeometry,
    p: &JointParameters,
    center: f64,
    free: &[usize],
) -> FittingResult<Covariance> {
    let i = Complex64::i();
    let jacobian: Vec<Vec<Complex64>> = f_data
        .iter()
        .map(|&f| {
            let environment = Complex64::from_polar(p.a, p.alpha - 2.0 * PI * f * p.delay);
            let model = p.evaluate(f, geometry);
            let resonance: [Complex64; 4] = match geometry {
                CircleGeometry::Notch => notch_gradient(f, &[p.fr, p.qc, p.ql, p.phi0]),
                CircleGeometry::Reflection => {
                    let [d_fr, d_qc, d_ql] = reflection_gradient(f, &[p.fr, p.qc, p.ql]);
                    [d_fr, d_qc, d_ql, Complex64::new(0.0, 0.0)]
                }
            };
            let full = [
                environment * resonance[0],
                environment * resonance[1],
                environment * resonance[2],
                environment * resonance[3],
                model / p.a,
                i * model,
                -2.0 * PI * i * (f - center) * model,
            ];
            free.iter().map(|&k| full[k]).collect()
        })
        .collect();
    let reduced = complex_covariance(residuals, &jacobian)?;

    // alpha = alpha_c + 2π center τ
    let mut transform = DMatrix::<f64>::identity(7, 7);
    transform[(ALPHA, DELAY)] = 2.0 * PI * center;
    let mut embedded = DMatrix::<f64>::zeros(7, 7);
    for (a, &ka) in free.iter().enumerate() {
        for (b, &kb) in free.iter().enumerate() {
            embedded[(ka, kb)] = reduced.matrix[(a, b)];
        }
    }
    Ok(Covariance {
        matrix: &transform * embedded * transform.transpose(),
        chi_square: reduced.chi_square,
    })
}

/// Joint model in normalized frequency, parameters `[ur, Qc, Ql, phi0, a, alpha_c, s]` with
/// `alpha_c` the environment phase at the band center and `s = τ span`.
struct JointProblem {
    x: Vec<f64>,
    z: Vec<Complex64>,
    geometry: CircleGeometry,
    scale: FrequencyScale,
    base: [f64; 7],
    /// Returned unchanged when the delay is not free
    seed_delay: f64,
    free: Vec<usize>,
    limits: Vec<MPPar>,
}

impl JointProblem {
    fn new(
        f_data: &[f64],
        z_data: &[Complex64],
        geometry: CircleGeometry,
        scale: FrequencyScale,
        seed: &JointParameters,
        free: Vec<usize>,
    ) -> JointProblem {
        let base = [
            scale.to_unit(seed.fr),
            seed.qc.abs().max(1.0),
            seed.ql.abs().max(1.0),
            seed.phi0,
            seed.a.abs(),
            wrap_phase(seed.alpha - 2.0 * PI * scale.center * seed.delay),
            seed.delay * scale.span,
        ];
        // absolute steps where the parameter may sit near 0, the default step is relative
        let fr_step = 1e-6 * seed.fr / (base[QL] * scale.span);
        let limits = free
            .iter()
            .map(|&k| match k {
                FR => MPPar {
                    step: fr_step,
                    ..Default::default()
                },
                PHI0 | ALPHA => MPPar {
                    step: 1e-7,
                    ..Default::default()
                },
                DELAY => MPPar {
                    step: 1e-8,
                    ..Default::default()
                },
                QC | QL => MPPar {
                    limited_low: true,
                    limit_low: 1.0,
                    ..Default::default()
                },
                A => MPPar {
                    limited_low: true,
                    limit_low: 0.0,
                    ..Default::default()
                },
                _ => MPPar::default(),
            })
            .collect();
        JointProblem {
            x: f_data.iter().map(|f| scale.to_unit(*f)).collect(),
            z: z_data.to_vec(),
            geometry,
            scale,
            base,
            seed_delay: seed.delay,
            free,
            limits,
        }
    }

    fn initial(&self) -> Vec<f64> {
        self.free.iter().map(|&k| self.base[k]).collect()
    }

    fn absorb(&mut self, params: &[f64]) {
        for (&k, &p) in self.free.iter().zip(params.iter()) {
            self.base[k] = p;
        }
    }

    fn physical(&self) -> JointParameters {
        let [ur, qc, ql, phi0, a, alpha_c, s] = self.base;
        let delay = if self.free.contains(&DELAY) {
            s / self.scale.span
        } else {
            self.seed_delay
        };
        JointParameters {
            fr: self.scale.to_hz(ur),
            qc,
            ql,
            phi0: if self.geometry == CircleGeometry::Notch { wrap_phase(phi0) } else { 0.0 },
            a,
            alpha: wrap_phase(alpha_c + 2.0 * PI * self.scale.center * delay),
            delay,
        }
    }
}

impl MPFitter for JointProblem {
    fn eval(&mut self, params: &[f64], deviates: &mut [f64]) -> MPResult<()> {
        let mut p = self.base;
        for (&k, &v) in self.free.iter().zip(params.iter()) {
            p[k] = v;
        }
        let [ur, qc, ql, phi0, a, alpha_c, s] = p;
        let fr = self.scale.to_hz(ur);
        for ((dev, x), z) in deviates.chunks_exact_mut(2).zip(self.x.iter()).zip(self.z.iter()) {
            // detuning from normalized coordinates keeps small steps of ur resolvable
            let detuning = 2.0 * ql * self.scale.span * (x - ur) / fr;
            let environment = Complex64::from_polar(a, alpha_c - 2.0 * PI * s * x);
            let r = z - environment * ideal(self.geometry, ql, qc, phi0, detuning);
            dev[0] = r.re;
            dev[1] = r.im;
        }
        Ok(())
    }

    fn number_of_points(&self) -> usize {
        2 * self.x.len()
    }

    fn config(&self) -> MPConfig {
        MPConfig {
            ftol: 1e-12,
            xtol: 1e-12,
            max_fev: 2000,
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
    use rand::rngs::StdRng;
    use rand::SeedableRng;
    use rand_distr::{Distribution, Normal};

    fn truth() -> JointParameters {
        JointParameters {
            fr: 5.0e9,
            qc: 1.5e4,
            ql: 1.0e4,
            phi0: 0.2,
            a: 0.6,
            alpha: 1.3,
            delay: 4.0e-8,
        }
    }

    fn frequencies() -> Vec<f64> {
        (0..1201)
            .map(|i| 5.0e9 - 3.0e6 + 6.0e6 * i as f64 / 1200.0)
            .collect()
    }

    /// Off by a few percent, with the environment phase at the band center off by 0.02.
    fn perturbed(p: &JointParameters) -> JointParameters {
        let delay = p.delay * 1.01;
        JointParameters {
            fr: p.fr + 2.0e3,
            qc: p.qc * 1.03,
            ql: p.ql * 0.97,
            phi0: p.phi0 - 0.05,
            a: p.a * 1.01,
            alpha: p.alpha + 0.02 + 2.0 * PI * 5.0e9 * (delay - p.delay),
            delay,
        }
    }

    #[test]
    fn recovers_notch_from_perturbed_seed() {
        let p = truth();
        let f = frequencies();
        let z: Vec<Complex64> = f.iter().map(|f| p.evaluate(*f, CircleGeometry::Notch)).collect();
        let fit = fit_joint(&f, &z, CircleGeometry::Notch, &perturbed(&p), false, true)
            .expect("joint fit failed");
        let q = fit.params;
        assert_relative_eq!(q.fr, p.fr, max_relative = 1e-10);
        assert_relative_eq!(q.ql, p.ql, max_relative = 1e-6);
        assert_relative_eq!(q.qc, p.qc, max_relative = 1e-6);
        assert_relative_eq!(q.phi0, p.phi0, epsilon = 1e-6);
        assert_relative_eq!(q.a, p.a, max_relative = 1e-6);
        assert_relative_eq!(wrap_phase(q.alpha - p.alpha), 0.0, epsilon = 1e-5);
        assert_relative_eq!(q.delay, p.delay, max_relative = 1e-6);
        assert!(fit.chi_square < 1e-12);
    }

    #[test]
    fn fixed_delay_is_kept() {
        let p = JointParameters {
            phi0: 0.0,
            ..truth()
        };
        let f = frequencies();
        let z: Vec<Complex64> = f
            .iter()
            .map(|f| p.evaluate(*f, CircleGeometry::Reflection))
            .collect();
        let fit = fit_joint(&f, &z, CircleGeometry::Reflection, &perturbed(&p), true, true)
            .expect("joint fit failed");
        assert_eq!(fit.params.delay, perturbed(&p).delay);
        assert_eq!(fit.params.phi0, 0.0);
        let cov = fit.covariance.expect("covariance missing");
        assert_eq!(cov.matrix[(DELAY, DELAY)], 0.0);
        assert_eq!(cov.matrix[(PHI0, PHI0)], 0.0);
    }

    #[test]
    fn errors_follow_the_noise() {
        let p = truth();
        let f = frequencies();
        let sigma = 1e-3;
        let noise = Normal::new(0.0, sigma).unwrap();
        let mut rng = StdRng::seed_from_u64(11);
        let z: Vec<Complex64> = f
            .iter()
            .map(|f| {
                p.evaluate(*f, CircleGeometry::Notch)
                    + Complex64::new(noise.sample(&mut rng), noise.sample(&mut rng))
            })
            .collect();
        let fit = fit_joint(&f, &z, CircleGeometry::Notch, &p, false, true).expect("joint fit failed");
        // chi-square per complex sample is twice the per-quadrature variance
        assert_relative_eq!(fit.chi_square, 2.0 * sigma * sigma, max_relative = 0.15);
        let cov = fit.covariance.expect("covariance missing");
        for k in [FR, QC, QL, A, DELAY] {
            let error = cov.std_dev(k);
            assert!(error.is_finite() && error > 0.0);
        }
        assert!((fit.params.ql - p.ql).abs() < 5.0 * cov.std_dev(QL));
        assert!((fit.params.fr - p.fr).abs() < 5.0 * cov.std_dev(FR));
    }
}
