use crate::config::FitConfig;
use crate::fitting::circlefit::circle::fit_circle;
use crate::fitting::circlefit::delay::{fit_delay, guess_delay};
use crate::fitting::circlefit::lorentzian::{fit_skewed_lorentzian, SkewedLorentzian};
use crate::fitting::circlefit::phase::fit_phase;
use crate::fitting::common::error::{FitError, FittingResult};
use crate::fitting::common::fitstruct::{CalibrationRecord, FitWarning};
use crate::fitting::common::preprocessing::{
    argmin_by, phase_derivative_peak, validate_trace, wrap_phase,
};
use num_complex::Complex64;
use std::f64::consts::PI;

/// Where the off-resonant point sits relative to the circle center.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CircleGeometry {
    /// Off resonance the response is `a e^{iα}`
    Notch,
    /// Off resonance the response is `-a e^{iα}`
    Reflection,
}

/// Delay and prefit of a raw trace, the first half of the calibration.
#[derive(Debug, Clone, PartialEq)]
pub struct DelayEstimate {
    pub delay: f64,
    pub prefit: SkewedLorentzian,
    pub background_slope: f64,
    pub warnings: Vec<FitWarning>,
}

/// Finds the cable delay of a raw trace, seeding the resonance from a skewed Lorentzian prefit.
///
/// An unreliable prefit is replaced by the phase-derivative estimate with `Ql` set to
/// `config.prefit_fallback_ql`, and a diverged delay fit leaves the delay at zero. Both are
/// reported as warnings.
pub fn get_delay(f_data: &[f64], z_data: &[Complex64], guess: bool, config: &FitConfig) -> DelayEstimate {
    let mut warnings = vec![];
    let max_abs = z_data.iter().map(|z| z.norm()).fold(0.0_f64, f64::max);
    let scale = if max_abs > 0.0 { max_abs } else { 1.0 };
    let z_norm: Vec<Complex64> = z_data.iter().map(|z| z / scale).collect();

    let prefit = match fit_skewed_lorentzian(f_data, &z_norm) {
        Ok(p)
            if p.df_error / p.fr <= config.prefit_df_tolerance
                && p.dql_error / p.ql <= config.prefit_dql_tolerance =>
        {
            p
        }
        outcome => {
            let (df_rel, dql_rel) = match outcome {
                Ok(p) => (p.df_error / p.fr, p.dql_error / p.ql),
                Err(_) => (f64::INFINITY, f64::INFINITY),
            };
            let warning = FitWarning::PrefitFallback { df_rel, dql_rel };
            tracing::warn!("{warning}");
            warnings.push(warning);
            SkewedLorentzian {
                a1: z_norm.iter().map(|z| z.norm()).sum::<f64>() / z_norm.len() as f64,
                a2: 0.0,
                a3: 0.0,
                a4: 0.0,
                fr: phase_derivative_peak(f_data, &z_norm, config.phase_smoothing),
                ql: config.prefit_fallback_ql,
                df_error: f64::NAN,
                dql_error: f64::NAN,
            }
        }
    };
    // the prefit slope is d|z|²/df of the normalized trace, d|z|/df = A2 / (2 sqrt(A1))
    let background_slope = if config.ignore_slope || prefit.a1 <= 0.0 {
        0.0
    } else {
        scale * prefit.a2 / (2.0 * prefit.a1.sqrt())
    };

    let delay = match config.fixed_delay {
        Some(delay) => delay,
        None => {
            let initial = if guess { guess_delay(f_data, &z_norm) } else { 0.0 };
            match fit_delay(f_data, &z_norm, initial, config.delay_max_evaluations) {
                Ok(delay) => delay,
                Err(FitError::DelayFitDiverged { evaluations }) => {
                    let warning = FitWarning::DelayFitDiverged { evaluations };
                    tracing::warn!("{warning}");
                    warnings.push(warning);
                    0.0
                }
                Err(e) => {
                    tracing::warn!("delay fit failed: {e}");
                    warnings.push(FitWarning::DelayFitDiverged { evaluations: 0 });
                    0.0
                }
            }
        }
    };

    DelayEstimate {
        delay,
        prefit,
        background_slope,
        warnings,
    }
}

/// Determines the constants that move a raw trace into canonical position: removes the delay,
/// centers the circle, fits its phase and locates the off-resonant point.
///
/// # Errors
/// Will return `Err(FitError::InvalidInput)` for invalid traces,
/// `Err(FitError::DegenerateGeometry)` if no circle can be fitted to the delay-corrected
/// trace, or `Err(FitError::BadFit)` if the phase fit fails.
pub fn do_calibration(
    f_data: &[f64],
    z_data: &[Complex64],
    geometry: CircleGeometry,
    guess: bool,
    config: &FitConfig,
) -> FittingResult<(CalibrationRecord, Vec<FitWarning>)> {
    validate_trace(f_data, z_data)?;
    let estimate = get_delay(f_data, z_data, guess, config);
    let fr_cal = estimate.prefit.fr;
    let z_corr: Vec<Complex64> = f_data
        .iter()
        .zip(z_data.iter())
        .map(|(f, z)| {
            (z - estimate.background_slope * (f - fr_cal))
                * Complex64::from_polar(1.0, 2.0 * PI * estimate.delay * f)
        })
        .collect();

    let circle = fit_circle(&z_corr)?;
    let zc = circle.center();
    let z_centered: Vec<Complex64> = z_corr.iter().map(|z| z - zc).collect();
    let nearest = argmin_by(f_data, |f| (f - fr_cal).abs());
    let theta0 = z_centered[nearest].arg();
    let phase = fit_phase(f_data, &z_centered, theta0, estimate.prefit.ql.abs(), fr_cal)?;

    let beta = wrap_phase(phase.theta0 + PI);
    let offres = zc + Complex64::from_polar(circle.r0, beta);
    let (amplitude_norm, alpha) = match geometry {
        CircleGeometry::Notch => (offres.norm(), offres.arg()),
        CircleGeometry::Reflection => (circle.r0 + zc.norm(), wrap_phase(offres.arg() + PI)),
    };
    tracing::debug!(delay = estimate.delay, amplitude_norm, alpha, fr = phase.fr, ql = phase.ql, "calibration");

    let record = CalibrationRecord {
        delay: estimate.delay,
        amplitude_norm,
        alpha,
        background_slope: estimate.background_slope,
        fr_cal,
        fr: phase.fr,
        ql: phase.ql,
    };
    Ok((record, estimate.warnings))
}

/// Applies `(z - slope (f - fr_cal)) / a · exp(i(-α + 2π τ f))`.
pub fn do_normalization(f_data: &[f64], z_data: &[Complex64], calibration: &CalibrationRecord) -> Vec<Complex64> {
    f_data
        .iter()
        .zip(z_data.iter())
        .map(|(f, z)| {
            (z - calibration.background_slope * (f - calibration.fr_cal)) / calibration.amplitude_norm
                * Complex64::from_polar(1.0, -calibration.alpha + 2.0 * PI * calibration.delay * f)
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fitting::circlefit::covariance::{notch_ideal, reflection_ideal};
    use approx::assert_relative_eq;

    fn frequencies(fr: f64, ql: f64) -> Vec<f64> {
        let width = fr / ql;
        (0..601)
            .map(|i| fr - 5.0 * width + 10.0 * width * i as f64 / 600.0)
            .collect()
    }

    fn environment(f: f64, a: f64, alpha: f64, delay: f64) -> Complex64 {
        Complex64::from_polar(a, alpha - 2.0 * PI * f * delay)
    }

    #[test]
    fn notch_constants_are_recovered() {
        let (fr, ql) = (5.0e9, 1.0e4);
        let f = frequencies(fr, ql);
        let p = [fr, 2.0e4, ql, 0.2];
        let z: Vec<Complex64> = f
            .iter()
            .map(|f| notch_ideal(*f, &p) * environment(*f, 0.8, 0.5, 4.0e-8))
            .collect();
        let config = FitConfig::default();
        let (record, _) =
            do_calibration(&f, &z, CircleGeometry::Notch, true, &config).expect("calibration failed");
        assert_relative_eq!(record.delay, 4.0e-8, max_relative = 1e-4);
        assert_relative_eq!(record.amplitude_norm, 0.8, max_relative = 1e-4);
        assert_relative_eq!(record.fr, fr, max_relative = 1e-7);

        let calibrated = do_normalization(&f, &z, &record);
        for (c, f) in calibrated.iter().zip(f.iter()) {
            assert!((c - notch_ideal(*f, &p)).norm() < 1e-3);
        }
    }

    #[test]
    fn reflection_constants_are_recovered() {
        let (fr, ql) = (6.0e9, 5.0e3);
        let f = frequencies(fr, ql);
        let p = [fr, 1.5e4, ql];
        let z: Vec<Complex64> = f
            .iter()
            .map(|f| reflection_ideal(*f, &p) * environment(*f, 0.3, -1.0, 0.0))
            .collect();
        let config = FitConfig::default();
        let (record, _) = do_calibration(&f, &z, CircleGeometry::Reflection, false, &config)
            .expect("calibration failed");
        assert!(record.delay.abs() < 1e-12);
        assert_relative_eq!(record.amplitude_norm, 0.3, max_relative = 1e-4);
        assert_relative_eq!(record.alpha, -1.0, epsilon = 1e-4);
    }

    #[test]
    fn background_slope_is_a_magnitude_slope() {
        let (fr, ql) = (5.0e9, 1.0e4);
        let f = frequencies(fr, ql);
        let p = [fr, 2.0e4, ql, 0.0];
        let k = 1.0e-8;
        let z: Vec<Complex64> = f
            .iter()
            .map(|f| notch_ideal(*f, &p) * (1.0 + k * (f - fr)) * 0.4)
            .collect();
        let config = FitConfig {
            ignore_slope: false,
            fixed_delay: Some(0.0),
            ..Default::default()
        };
        let estimate = get_delay(&f, &z, false, &config);
        assert!(estimate.warnings.is_empty());
        // |z| = 0.4 (1 + k (f - fr)) off resonance
        assert_relative_eq!(estimate.background_slope, 0.4 * k, max_relative = 1e-2);

        let ignored = get_delay(&f, &z, false, &FitConfig { ignore_slope: true, ..config });
        assert_eq!(ignored.background_slope, 0.0);
    }

    #[test]
    fn empty_trace_is_rejected() {
        assert!(matches!(
            do_calibration(&[], &[], CircleGeometry::Notch, true, &FitConfig::default()),
            Err(FitError::InvalidInput(_))
        ));
    }

    #[test]
    fn fixed_delay_skips_estimation() {
        let (fr, ql) = (5.0e9, 1.0e4);
        let f = frequencies(fr, ql);
        let p = [fr, 2.0e4, ql, 0.0];
        let z: Vec<Complex64> = f
            .iter()
            .map(|f| notch_ideal(*f, &p) * environment(*f, 1.0, 0.0, 2.0e-8))
            .collect();
        let config = FitConfig {
            fixed_delay: Some(2.0e-8),
            ..Default::default()
        };
        let estimate = get_delay(&f, &z, true, &config);
        assert_eq!(estimate.delay, 2.0e-8);
    }
}
