use crate::config::FitConfig;
use crate::fitting::circlefit::calibration::{do_calibration, CircleGeometry};
use crate::fitting::circlefit::covariance::{
    chi_square, qi_error, reflection_covariance, reflection_ideal, Covariance,
};
use crate::fitting::circlefit::phase::fit_phase;
use crate::fitting::common::error::FittingResult;
use crate::fitting::common::fitstruct::{keys, CalibrationRecord, FitResult, FitWarning};
use crate::ports::notch::{fitted_circle, tilt_angle};
use crate::ports::{environment, refine_jointly, with_background, FitStrategy, PortFit, PortKind};
use num_complex::Complex64;

/// Directly coupled port, measured in reflection (S11).
#[derive(Debug, Clone, Copy, Default)]
pub struct Reflection;

/// `a e^{iα} e^{-2πi f τ} (2Ql/Qc - 1 + 2i Ql (fr - f)/fr) / (1 - 2i Ql (fr - f)/fr)`
pub fn reflection_model(f: f64, fr: f64, ql: f64, qc: f64, a: f64, alpha: f64, delay: f64) -> Complex64 {
    environment(f, a, alpha, delay) * reflection_ideal(f, &[fr, qc, ql])
}

fn record_quality_factors(result: &mut FitResult, fr: f64, ql: f64, qc: f64) {
    let qi = 1.0 / (1.0 / ql - 1.0 / qc);
    result.set_value(keys::FR, fr);
    result.set_value(keys::QL, ql);
    result.set_value(keys::QC, qc);
    result.set_value(keys::QI, qi);
    result.check_qi(keys::QI);
}

/// Errors from a covariance indexed as `[fr, Qc, Ql, ...]`.
fn record_errors(result: &mut FitResult, cov: &Covariance, ql: f64, qc: f64) {
    result.set_error(keys::FR, cov.std_dev(0));
    result.set_error(keys::QC, cov.std_dev(1));
    result.set_error(keys::QL, cov.std_dev(2));
    let m = &cov.matrix;
    result.set_error(keys::QI, qi_error(ql, qc, m[(2, 2)], m[(1, 1)], m[(2, 1)]));
}

impl FitStrategy for Reflection {
    fn kind(&self) -> PortKind {
        PortKind::Reflection
    }

    fn calibrate(
        &self,
        f_data: &[f64],
        z_data: &[Complex64],
        config: &FitConfig,
    ) -> FittingResult<(CalibrationRecord, Vec<FitWarning>)> {
        // the resonance winds the phase by 2π, which spoils a slope-based guess
        let guess = config.guess_delay.unwrap_or(false);
        do_calibration(f_data, z_data, CircleGeometry::Reflection, guess, config)
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
        // the centered resonance point of a calibrated reflection lies at -phi0
        let phase = fit_phase(
            f_data,
            &z_centered,
            -phi0,
            calibration.ql,
            calibration.fr,
        )?;
        let (fr, ql) = (phase.fr, phase.ql);

        let qi = ql / (1.0 - circle.r0);
        let qc = 1.0 / (1.0 / ql - 1.0 / qi);
        record_quality_factors(&mut result, fr, ql, qc);
        result.set_value(keys::THETA0, phase.theta0);

        let p = [fr, qc, ql];
        if !config.calc_errors {
            result.chi_square = chi_square(f_data, z_data, p.len(), |f| reflection_ideal(f, &p));
            return Ok(result);
        }
        match reflection_covariance(f_data, z_data, &p) {
            Ok(cov) => {
                record_errors(&mut result, &cov, ql, qc);
                result.chi_square = cov.chi_square;
            }
            Err(_) => {
                result.warn(FitWarning::CovarianceSingular);
                result.chi_square = chi_square(f_data, z_data, p.len(), |f| reflection_ideal(f, &p));
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
        let qc = result.require(keys::QC)?;
        let a = result.require(keys::A)?;
        let alpha = result.require(keys::ALPHA)?;
        let delay = result.require(keys::DELAY)?;
        Ok(with_background(f_data, calibration, |f| {
            reflection_model(f, fr, ql, qc, a, alpha, delay)
        }))
    }

    fn refine(
        &self,
        f_data: &[f64],
        z_data: &[Complex64],
        fit: &PortFit,
        config: &FitConfig,
    ) -> FittingResult<Option<PortFit>> {
        refine_jointly(self, CircleGeometry::Reflection, f_data, z_data, fit, config, |result, p, cov| {
            record_quality_factors(result, p.fr, p.ql, p.qc);
            if let Some(cov) = cov {
                record_errors(result, cov, p.ql, p.qc);
            }
        })
        .map(Some)
    }

    fn quality_factors(&self, result: &FitResult, _config: &FitConfig) -> FittingResult<(f64, f64)> {
        Ok((result.require(keys::QC)?, result.require(keys::QI)?))
    }
}
