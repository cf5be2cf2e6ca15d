//! Resonance topologies. Each port kind is a [`FitStrategy`] that knows its closed-form model,
//! its calibration geometry and how the circle diameter maps onto quality factors.
use crate::config::FitConfig;
use crate::fitting::circlefit::calibration::{do_normalization, CircleGeometry};
use crate::fitting::circlefit::covariance::Covariance;
use crate::fitting::circlefit::joint::{self, fit_joint, JointParameters};
use crate::fitting::common::error::{FitError, FittingResult};
use crate::fitting::common::fitstruct::{keys, CalibrationRecord, FitResult, FitWarning};
use crate::fitting::common::preprocessing::validate_trace;
use crate::utils::constants::HBAR;
use num_complex::Complex64;
use serde::{Deserialize, Serialize};
use std::f64::consts::PI;
use std::fmt;
use std::str::FromStr;

pub mod notch;
pub mod port;
pub mod reflection;
pub mod tail;
pub mod transmission;

pub use notch::Notch;
pub use port::Port;
pub use reflection::Reflection;
pub use tail::{tail_port, Tail};
pub use transmission::Transmission;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PortKind {
    Reflection,
    Notch,
    Transmission,
    Tail,
}

impl PortKind {
    pub fn strategy(self) -> Box<dyn FitStrategy> {
        match self {
            PortKind::Reflection => Box::new(Reflection),
            PortKind::Notch => Box::new(Notch),
            PortKind::Transmission => Box::new(Transmission),
            PortKind::Tail => Box::new(Tail),
        }
    }
}

impl FromStr for PortKind {
    type Err = FitError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "direct" | "reflection" => Ok(PortKind::Reflection),
            "notch" => Ok(PortKind::Notch),
            "transm" | "transmission" => Ok(PortKind::Transmission),
            "tail" => Ok(PortKind::Tail),
            other => Err(FitError::UnsupportedPortType(format!(
                "'{other}', use 'direct', 'notch', 'transm' or 'tail'"
            ))),
        }
    }
}

impl fmt::Display for PortKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let tag = match self {
            PortKind::Reflection => "reflection",
            PortKind::Notch => "notch",
            PortKind::Transmission => "transmission",
            PortKind::Tail => "tail",
        };
        write!(f, "{tag}")
    }
}

/// Everything `autofit` produces for one trace.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PortFit {
    pub calibration: CalibrationRecord,
    /// Frequencies of the fitted points, a subset of the input for tail ports
    pub frequencies: Vec<f64>,
    /// Calibrated response at `frequencies`
    pub z_data: Vec<Complex64>,
    /// Model response including background and environment at `frequencies`
    pub z_sim: Vec<Complex64>,
    pub result: FitResult,
}

/// Calibration and fit procedure of one resonance topology.
pub trait FitStrategy: fmt::Debug + Send + Sync {
    fn kind(&self) -> PortKind;

    /// Finds the normalization constants of a raw trace.
    ///
    /// # Errors
    /// Will return `Err` if the trace cannot be brought into canonical position at all.
    fn calibrate(
        &self,
        f_data: &[f64],
        z_data: &[Complex64],
        config: &FitConfig,
    ) -> FittingResult<(CalibrationRecord, Vec<FitWarning>)>;

    /// Fits the ideal model to calibrated data.
    ///
    /// # Errors
    /// Will return `Err` if no circle or phase fit is possible.
    fn circlefit(
        &self,
        f_data: &[f64],
        z_data: &[Complex64],
        calibration: &CalibrationRecord,
        config: &FitConfig,
    ) -> FittingResult<FitResult>;

    /// Full model response, background and environment included.
    ///
    /// # Errors
    /// Will return `Err` if `result` lacks a parameter of the model.
    fn simulate(
        &self,
        f_data: &[f64],
        result: &FitResult,
        calibration: &CalibrationRecord,
    ) -> FittingResult<Vec<Complex64>>;

    /// `(Qc, Qi)` used for photon-number estimates.
    ///
    /// # Errors
    /// Will return `Err(FitError::UnsupportedPortType)` for topologies without a coupling split.
    fn quality_factors(&self, result: &FitResult, config: &FitConfig) -> FittingResult<(f64, f64)>;

    /// Refits a finished fit of the raw trace with the environment free. `None` for
    /// topologies without a joint model.
    ///
    /// # Errors
    /// Will return `Err` if the joint fit fails.
    fn refine(
        &self,
        _f_data: &[f64],
        _z_data: &[Complex64],
        _fit: &PortFit,
        _config: &FitConfig,
    ) -> FittingResult<Option<PortFit>> {
        Ok(None)
    }

    /// Normalizes a raw trace with a known calibration and fits it.
    ///
    /// # Errors
    /// Will return `Err(FitError::InvalidInput)` for invalid traces, or `Err` if the circle
    /// fit fails.
    fn fit_calibrated(
        &self,
        f_data: &[f64],
        z_data: &[Complex64],
        calibration: &CalibrationRecord,
        config: &FitConfig,
    ) -> FittingResult<PortFit> {
        validate_trace(f_data, z_data)?;
        let z_norm = do_normalization(f_data, z_data, calibration);
        let mut result = self.circlefit(f_data, &z_norm, calibration, config)?;
        result.set_value(keys::DELAY, calibration.delay);
        result.set_value(keys::A, calibration.amplitude_norm);
        result.set_value(keys::ALPHA, calibration.alpha);
        let z_sim = self.simulate(f_data, &result, calibration)?;
        Ok(PortFit {
            calibration: *calibration,
            frequencies: f_data.to_vec(),
            z_data: z_norm,
            z_sim,
            result,
        })
    }

    /// Calibrates and fits a raw trace, then refines the fit jointly with the environment
    /// when `config.joint_refinement` is set. A failed refinement keeps the circle fit.
    ///
    /// # Errors
    /// Will return `Err(FitError::InvalidInput)` for invalid traces, or `Err` if calibration
    /// or fit fail beyond recovery.
    fn autofit(&self, f_data: &[f64], z_data: &[Complex64], config: &FitConfig) -> FittingResult<PortFit> {
        validate_trace(f_data, z_data)?;
        let (calibration, mut warnings) = self.calibrate(f_data, z_data, config)?;
        let mut fit = self.fit_calibrated(f_data, z_data, &calibration, config)?;
        if config.joint_refinement {
            match self.refine(f_data, z_data, &fit, config) {
                Ok(Some(refined)) => fit = refined,
                Ok(None) => {}
                Err(e) => fit.result.warn(FitWarning::JointFitFailed(e.to_string())),
            }
        }
        warnings.append(&mut fit.result.warnings);
        fit.result.warnings = warnings;
        Ok(fit)
    }
}

/// Photons in the resonator per watt of drive, `4 k_c / (2π ħ fr (k_c + k_i)²)`.
pub fn photons_per_watt(fr: f64, qc: f64, qi: f64) -> f64 {
    let k_c = 2.0 * PI * fr / qc;
    let k_i = 2.0 * PI * fr / qi;
    4.0 * k_c / (2.0 * PI * HBAR * fr * (k_c + k_i).powi(2))
}

/// Background slope plus `model`, evaluated at every frequency.
pub(crate) fn with_background<F: Fn(f64) -> Complex64>(
    f_data: &[f64],
    calibration: &CalibrationRecord,
    model: F,
) -> Vec<Complex64> {
    f_data
        .iter()
        .map(|f| calibration.background_slope * (f - calibration.fr_cal) + model(*f))
        .collect()
}

/// Replaces resonance and environment of `fit` by a joint fit of the raw trace. `record`
/// stores the quality factors of the topology and, when available, their errors. `theta0`
/// is kept from the circle fit.
pub(crate) fn refine_jointly<S, R>(
    strategy: &S,
    geometry: CircleGeometry,
    f_data: &[f64],
    z_data: &[Complex64],
    fit: &PortFit,
    config: &FitConfig,
    record: R,
) -> FittingResult<PortFit>
where
    S: FitStrategy + ?Sized,
    R: Fn(&mut FitResult, &JointParameters, Option<&Covariance>),
{
    let r = &fit.result;
    let qc_key = match geometry {
        CircleGeometry::Notch => keys::ABS_QC,
        CircleGeometry::Reflection => keys::QC,
    };
    let seed = JointParameters {
        fr: r.require(keys::FR)?,
        qc: r.require(qc_key)?,
        ql: r.require(keys::QL)?,
        phi0: r.value(keys::PHI0).unwrap_or(0.0),
        a: r.require(keys::A)?,
        alpha: r.require(keys::ALPHA)?,
        delay: r.require(keys::DELAY)?,
    };
    let z_clean = without_background(f_data, z_data, &fit.calibration);
    let fix_delay = config.fixed_delay.is_some();
    let refined = fit_joint(f_data, &z_clean, geometry, &seed, fix_delay, config.calc_errors)?;
    let p = refined.params;

    let mut result = FitResult {
        warnings: r
            .warnings
            .iter()
            .filter(|w| !matches!(w, FitWarning::UnphysicalQi { .. } | FitWarning::CovarianceSingular))
            .cloned()
            .collect(),
        ..Default::default()
    };
    record(&mut result, &p, refined.covariance.as_ref());
    if let Some(theta0) = r.value(keys::THETA0) {
        result.set_value(keys::THETA0, theta0);
    }
    result.set_value(keys::DELAY, p.delay);
    result.set_value(keys::A, p.a);
    result.set_value(keys::ALPHA, p.alpha);
    result.chi_square = refined.chi_square;
    match &refined.covariance {
        Some(cov) => {
            result.set_error(keys::A, cov.std_dev(joint::A));
            result.set_error(keys::ALPHA, cov.std_dev(joint::ALPHA));
            if !fix_delay {
                result.set_error(keys::DELAY, cov.std_dev(joint::DELAY));
            }
        }
        None if config.calc_errors => result.warn(FitWarning::CovarianceSingular),
        None => {}
    }

    let calibration = CalibrationRecord {
        delay: p.delay,
        amplitude_norm: p.a,
        alpha: p.alpha,
        fr: p.fr,
        ql: p.ql,
        ..fit.calibration
    };
    let z_sim = strategy.simulate(f_data, &result, &calibration)?;
    Ok(PortFit {
        calibration,
        frequencies: fit.frequencies.clone(),
        z_data: do_normalization(f_data, z_data, &calibration),
        z_sim,
        result,
    })
}

/// Raw trace with the background slope of `calibration` removed.
pub(crate) fn without_background(
    f_data: &[f64],
    z_data: &[Complex64],
    calibration: &CalibrationRecord,
) -> Vec<Complex64> {
    f_data
        .iter()
        .zip(z_data.iter())
        .map(|(f, z)| z - calibration.background_slope * (f - calibration.fr_cal))
        .collect()
}

/// `a e^{iα} e^{-2πi f τ}`
pub(crate) fn environment(f: f64, a: f64, alpha: f64, delay: f64) -> Complex64 {
    Complex64::from_polar(a, alpha - 2.0 * PI * f * delay)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_port_tags() {
        assert_eq!("direct".parse::<PortKind>(), Ok(PortKind::Reflection));
        assert_eq!("notch".parse::<PortKind>(), Ok(PortKind::Notch));
        assert_eq!("transm".parse::<PortKind>(), Ok(PortKind::Transmission));
        assert_eq!("tail".parse::<PortKind>(), Ok(PortKind::Tail));
        assert!(matches!(
            "bandpass".parse::<PortKind>(),
            Err(FitError::UnsupportedPortType(_))
        ));
    }

    #[test]
    fn every_strategy_rejects_invalid_traces() {
        let config = FitConfig::default();
        let calibration = CalibrationRecord::identity(5.0e9);
        let f = vec![5.0e9, 5.1e9, 5.2e9];
        let z = vec![Complex64::new(1.0, 0.0); 2];
        for kind in [
            PortKind::Reflection,
            PortKind::Notch,
            PortKind::Transmission,
            PortKind::Tail,
        ] {
            let strategy = kind.strategy();
            for (f, z) in [(&[][..], &[][..]), (&f[..], &z[..])] {
                assert!(
                    matches!(strategy.autofit(f, z, &config), Err(FitError::InvalidInput(_))),
                    "{kind} autofit"
                );
                assert!(
                    matches!(
                        strategy.fit_calibrated(f, z, &calibration, &config),
                        Err(FitError::InvalidInput(_))
                    ),
                    "{kind} fit_calibrated"
                );
                assert!(
                    matches!(strategy.calibrate(f, z, &config), Err(FitError::InvalidInput(_))),
                    "{kind} calibrate"
                );
            }
        }
    }

    #[test]
    fn critically_coupled_photon_number() {
        // k_c = k_i gives n/P = 1 / (2π ħ fr k_c)
        let (fr, q) = (5.0e9, 1.0e4);
        let k = 2.0 * PI * fr / q;
        let expected = 1.0 / (2.0 * PI * HBAR * fr * k);
        let n = photons_per_watt(fr, q, q);
        assert!((n - expected).abs() / expected < 1e-12);
    }
}
