use crate::config::FitConfig;
use crate::fitting::circlefit::lorentzian::fit_transmission_lorentzian;
use crate::fitting::common::error::{FitError, FittingResult};
use crate::fitting::common::fitstruct::{keys, CalibrationRecord, FitResult, FitWarning};
use crate::fitting::common::preprocessing::{argmax_by, validate_trace};
use crate::ports::{FitStrategy, PortFit, PortKind};
use num_complex::Complex64;

/// Transmission through a resonator between two ports, only the magnitude is fitted.
#[derive(Debug, Clone, Copy, Default)]
pub struct Transmission;

impl FitStrategy for Transmission {
    fn kind(&self) -> PortKind {
        PortKind::Transmission
    }

    /// Transmission data is fitted as measured.
    fn calibrate(
        &self,
        f_data: &[f64],
        z_data: &[Complex64],
        _config: &FitConfig,
    ) -> FittingResult<(CalibrationRecord, Vec<FitWarning>)> {
        validate_trace(f_data, z_data)?;
        let peak = argmax_by(z_data, |z| z.norm_sqr());
        Ok((CalibrationRecord::identity(f_data[peak]), vec![]))
    }

    fn circlefit(
        &self,
        f_data: &[f64],
        z_data: &[Complex64],
        _calibration: &CalibrationRecord,
        _config: &FitConfig,
    ) -> FittingResult<FitResult> {
        validate_trace(f_data, z_data)?;
        let fit = fit_transmission_lorentzian(f_data, z_data)?;
        let mut result = FitResult::default();
        result.set_value(keys::FR, fit.fr);
        result.set_value(keys::QL, fit.ql);
        result.set_value(keys::AMPSQR, fit.ampsqr);
        result.set_error(keys::FR, fit.fr_err);
        result.set_error(keys::QL, fit.ql_err);
        result.set_error(keys::AMPSQR, fit.ampsqr_err);
        result.chi_square = fit.chi_square;
        Ok(result)
    }

    /// Square root of the fitted `|S21|²`, the phase is not modelled.
    fn simulate(
        &self,
        f_data: &[f64],
        result: &FitResult,
        _calibration: &CalibrationRecord,
    ) -> FittingResult<Vec<Complex64>> {
        let fr = result.require(keys::FR)?;
        let ql = result.require(keys::QL)?;
        let ampsqr = result.require(keys::AMPSQR)?;
        Ok(f_data
            .iter()
            .map(|f| {
                let lorentz = ampsqr / (1.0 + 4.0 * ql * ql * ((f - fr) / fr).powi(2));
                Complex64::new(lorentz.max(0.0).sqrt(), 0.0)
            })
            .collect())
    }

    fn quality_factors(&self, _result: &FitResult, _config: &FitConfig) -> FittingResult<(f64, f64)> {
        Err(FitError::UnsupportedPortType(
            "transmission fits do not separate Qc and Qi".to_string(),
        ))
    }

    fn fit_calibrated(
        &self,
        f_data: &[f64],
        z_data: &[Complex64],
        calibration: &CalibrationRecord,
        config: &FitConfig,
    ) -> FittingResult<PortFit> {
        let result = self.circlefit(f_data, z_data, calibration, config)?;
        let z_sim = self.simulate(f_data, &result, calibration)?;
        Ok(PortFit {
            calibration: *calibration,
            frequencies: f_data.to_vec(),
            z_data: z_data.to_vec(),
            z_sim,
            result,
        })
    }
}
