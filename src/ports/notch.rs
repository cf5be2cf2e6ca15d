use crate::config::FitConfig;
use crate::fitting::circlefit::calibration::{do_calibration, CircleGeometry};
use crate::fitting::circlefit::circle::{fit_circle, refine_circle, Circle};
use crate::fitting::circlefit::covariance::{
    chi_square, notch_covariance, notch_ideal, qi_dia_corr_error, qi_error, Covariance,
};
use crate::fitting::circlefit::phase::fit_phase;
use crate::fitting::common::error::FittingResult;
use crate::fitting::common::fitstruct::{keys, CalibrationRecord, FitResult, FitWarning};
use crate::fitting::common::preprocessing::wrap_phase;
use crate::ports::{environment, refine_jointly, with_background, FitStrategy, PortFit, PortKind};
use num_complex::Complex64;
use std::f64::consts::PI;

/// Notch-type port measured in transmission, a resonator side-coupled to a feedline.
///
/// Reports both the uncorrected `Qi` and the diameter-corrected `Qi` of Khalil et al.,
/// J. Appl. Phys. 111, 054510 (2012), which accounts for the tilt `phi0` of the circle.
#[derive(Debug, Clone, Copy, Default)]
pub struct Notch;

/// `a e^{iα} e^{-2πi f τ} (1 - (Ql/|Qc|) e^{iφ} / (1 + 2i Ql (f - fr) / fr))`
#[allow(clippy::too_many_arguments)]
pub fn notch_model(f: f64, fr: f64, ql: f64, abs_qc: f64, phi0: f64, a: f64, alpha: f64, delay: f64) -> Complex64 {
    environment(f, a, alpha, delay) * notch_ideal(f, &[fr, abs_qc, ql, phi0])
}

/// Runs the circle fit, honouring `refine_circle`.
pub(crate) fn fitted_circle(z_data: &[Complex64], config: &FitConfig, result: &mut FitResult) -> FittingResult<Circle> {
    let circle = fit_circle(z_data)?;
    if !config.refine_circle {
        return Ok(circle);
    }
    match refine_circle(z_data, circle) {
        Ok(refined) => Ok(refined),
        Err(e) => {
            result.warn(FitWarning::RefinementFailed(e.to_string()));
            Ok(circle)
        }
    }
}

/// Tilt of the circle, `-asin(yc / r0)`, clamped when the center lies off the unit-height band.
pub(crate) fn tilt_angle(circle: &Circle, result: &mut FitResult) -> f64 {
    let ratio = circle.yc / circle.r0;
    if ratio.abs() > 1.0 {
        result.warn(FitWarning::TiltClamped { ratio });
    }
    -ratio.clamp(-1.0, 1.0).asin()
}

/// Quality factors of a notch resonance, `|Qc|` and `phi0` give both `Qi` estimates.
fn record_quality_factors(result: &mut FitResult, fr: f64, ql: f64, abs_qc: f64, phi0: f64) {
    // Re{1/Qc} of the complex coupling Qc = |Qc| e^{-iφ0}
    let qc_dia_corr = abs_qc / phi0.cos();
    let qi_dia_corr = 1.0 / (1.0 / ql - 1.0 / qc_dia_corr);
    let qi_no_corr = 1.0 / (1.0 / ql - 1.0 / abs_qc);

    result.set_value(keys::FR, fr);
    result.set_value(keys::QL, ql);
    result.set_value(keys::ABS_QC, abs_qc);
    result.set_value(keys::QC_DIA_CORR, qc_dia_corr);
    result.set_value(keys::QI_DIA_CORR, qi_dia_corr);
    result.set_value(keys::QI_NO_CORR, qi_no_corr);
    result.set_value(keys::PHI0, phi0);
    result.check_qi(keys::QI_NO_CORR);
    result.check_qi(keys::QI_DIA_CORR);
}

/// Errors from a covariance indexed as `[fr, absQc, Ql, phi0, ...]`.
fn record_errors(result: &mut FitResult, cov: &Covariance, ql: f64, abs_qc: f64, phi0: f64) {
    result.set_error(keys::FR, cov.std_dev(0));
    result.set_error(keys::ABS_QC, cov.std_dev(1));
    result.set_error(keys::QL, cov.std_dev(2));
    result.set_error(keys::PHI0, cov.std_dev(3));
    let m = &cov.matrix;
    result.set_error(
        keys::QI_NO_CORR,
        qi_error(ql, abs_qc, m[(2, 2)], m[(1, 1)], m[(2, 1)]),
    );
    result.set_error(keys::QI_DIA_CORR, qi_dia_corr_error(ql, abs_qc, phi0, m));
}

impl FitStrategy for Notch {
    fn kind(&self) -> PortKind {
        PortKind::Notch
    }

    fn calibrate(
        &self,
        f_data: &[f64],
        z_data: &[Complex64],
        config: &FitConfig,
    ) -> FittingResult<(CalibrationRecord, Vec<FitWarning>)> {
        let guess = config.guess_delay.unwrap_or(true);
        do_calibration(f_data, z_data, CircleGeometry::Notch, guess, config)
    }

    fn circlefit(
        &self,
        f_data: &[f64],
        z_data: &[Complex64],
        calibration: &CalibrationRecord,
        config: &FitConfig,
    ) -> FittingResult<FitResult> {
        let mut result = FitResult::default();
        let circle = fitted_circle(z_data, config, &mut result)?;
        let phi0 = tilt_angle(&circle, &mut result);
        let zc = circle.center();
        let z_centered: Vec<Complex64> = z_data.iter().map(|z| z - zc).collect();
        let phase = fit_phase(
            f_data,
            &z_centered,
            wrap_phase(phi0 + PI),
            calibration.ql,
            calibration.fr,
        )?;
        let (fr, ql) = (phase.fr, phase.ql);

        let abs_qc = ql / (2.0 * circle.r0);
        record_quality_factors(&mut result, fr, ql, abs_qc, phi0);
        result.set_value(keys::THETA0, phase.theta0);

        let p = [fr, abs_qc, ql, phi0];
        if !config.calc_errors {
            result.chi_square = chi_square(f_data, z_data, p.len(), |f| notch_ideal(f, &p));
            return Ok(result);
        }
        match notch_covariance(f_data, z_data, &p) {
            Ok(cov) => {
                record_errors(&mut result, &cov, ql, abs_qc, phi0);
                result.chi_square = cov.chi_square;
            }
            Err(_) => {
                result.warn(FitWarning::CovarianceSingular);
                result.chi_square = chi_square(f_data, z_data, p.len(), |f| notch_ideal(f, &p));
            }
        }
        Ok(result)
    }

    fn simulate(
        &self,
        f_data: &[f64],
        result: &FitResult,
        calibration: &CalibrationRecord,
    ) -> FittingResult<Vec<Complex64>> {
        let fr = result.require(keys::FR)?;
        let ql = result.require(keys::QL)?;
        let abs_qc = result.require(keys::ABS_QC)?;
        let phi0 = result.require(keys::PHI0)?;
        let a = result.require(keys::A)?;
        let alpha = result.require(keys::ALPHA)?;
        let delay = result.require(keys::DELAY)?;
        Ok(with_background(f_data, calibration, |f| {
            notch_model(f, fr, ql, abs_qc, phi0, a, alpha, delay)
        }))
    }

    fn refine(
        &self,
        f_data: &[f64],
        z_data: &[Complex64],
        fit: &PortFit,
        config: &FitConfig,
    ) -> FittingResult<Option<PortFit>> {
        refine_jointly(self, CircleGeometry::Notch, f_data, z_data, fit, config, |result, p, cov| {
            record_quality_factors(result, p.fr, p.ql, p.qc, p.phi0);
            if let Some(cov) = cov {
                record_errors(result, cov, p.ql, p.qc, p.phi0);
            }
        })
        .map(Some)
    }

    fn quality_factors(&self, result: &FitResult, config: &FitConfig) -> FittingResult<(f64, f64)> {
        if config.diameter_correction {
            Ok((result.require(keys::QC_DIA_CORR)?, result.require(keys::QI_DIA_CORR)?))
        } else {
            Ok((result.require(keys::ABS_QC)?, result.require(keys::QI_NO_CORR)?))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    fn trace(phi0: f64) -> (Vec<f64>, Vec<Complex64>) {
        let (fr, ql) = (5.0e9, 1.0e4);
        let f: Vec<f64> = (0..801)
            .map(|i| fr - 2.5e6 + 5.0e6 * i as f64 / 800.0)
            .collect();
        let z = f
            .iter()
            .map(|f| notch_model(*f, fr, ql, 2.0e4, phi0, 0.8, 0.5, 5.0e-8))
            .collect();
        (f, z)
    }

    #[test]
    fn autofit_recovers_noise_free_notch() {
        let (f, z) = trace(0.2);
        let fit = Notch.autofit(&f, &z, &FitConfig::default()).expect("autofit failed");
        let r = &fit.result;
        assert_relative_eq!(r.value(keys::FR).unwrap(), 5.0e9, max_relative = 1e-8);
        assert_relative_eq!(r.value(keys::QL).unwrap(), 1.0e4, max_relative = 1e-4);
        assert_relative_eq!(r.value(keys::ABS_QC).unwrap(), 2.0e4, max_relative = 1e-4);
        assert_relative_eq!(r.value(keys::PHI0).unwrap(), 0.2, epsilon = 1e-4);
        assert_relative_eq!(r.value(keys::DELAY).unwrap(), 5.0e-8, max_relative = 1e-4);
        assert!(r.errors.keys().all(|k| r.values.contains_key(k)));
        for (sim, raw) in fit.z_sim.iter().zip(z.iter()) {
            assert!((sim - raw).norm() < 1e-3);
        }
    }

    #[test]
    fn untilted_circle_needs_no_diameter_correction() {
        let (f, z) = trace(0.0);
        let fit = Notch.autofit(&f, &z, &FitConfig::default()).expect("autofit failed");
        let r = &fit.result;
        assert_relative_eq!(
            r.value(keys::QI_DIA_CORR).unwrap(),
            r.value(keys::QI_NO_CORR).unwrap(),
            max_relative = 1e-6
        );
    }

    #[test]
    fn errors_can_be_skipped() {
        let (f, z) = trace(0.2);
        let config = FitConfig {
            calc_errors: false,
            ..Default::default()
        };
        let fit = Notch.autofit(&f, &z, &config).expect("autofit failed");
        assert!(fit.result.errors.is_empty());
        assert!(fit.result.chi_square < 1e-8);
    }
}
