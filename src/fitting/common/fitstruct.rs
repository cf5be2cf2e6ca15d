use crate::fitting::common::error::{FitError, FittingResult};
use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Names of the quantities stored in a `FitResult`.
pub mod keys {
    pub const FR: &str = "fr";
    pub const QL: &str = "Ql";
    pub const QC: &str = "Qc";
    pub const QI: &str = "Qi";
    pub const ABS_QC: &str = "absQc";
    pub const QC_DIA_CORR: &str = "Qc_dia_corr";
    pub const QI_DIA_CORR: &str = "Qi_dia_corr";
    pub const QI_NO_CORR: &str = "Qi_no_corr";
    pub const PHI0: &str = "phi0";
    pub const THETA0: &str = "theta0";
    pub const DELAY: &str = "delay";
    pub const A: &str = "a";
    pub const ALPHA: &str = "alpha";
    pub const AMPSQR: &str = "Ampsqr";
}

/// Normalization constants recovered by the calibration pipeline.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct CalibrationRecord {
    /// Cable delay in seconds, removed as `exp(+2πi f delay)`
    pub delay: f64,
    /// Amplitude of the off-resonant point
    pub amplitude_norm: f64,
    /// Phase of the off-resonant point in radians
    pub alpha: f64,
    /// Linear background slope per Hz
    pub background_slope: f64,
    /// Reference frequency of the background slope
    pub fr_cal: f64,
    /// Resonance frequency found during calibration, used to seed the circle fit
    pub fr: f64,
    /// Loaded quality factor found during calibration, used to seed the circle fit
    pub ql: f64,
}

impl CalibrationRecord {
    /// A record that leaves data untouched.
    pub fn identity(fr: f64) -> CalibrationRecord {
        CalibrationRecord {
            delay: 0.0,
            amplitude_norm: 1.0,
            alpha: 0.0,
            background_slope: 0.0,
            fr_cal: fr,
            fr,
            ql: 0.0,
        }
    }
}

/// Recoverable problems found while fitting. They never abort the pipeline.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum FitWarning {
    /// The skewed Lorentzian prefit was too uncertain and heuristics were used instead
    PrefitFallback { df_rel: f64, dql_rel: f64 },
    /// The delay optimizer diverged, delay was reset to zero
    DelayFitDiverged { evaluations: usize },
    /// Errors could not be propagated, only chi-square is reported
    CovarianceSingular,
    /// `|yc / r0| > 1`, the tilt angle was clamped to ±π/2
    TiltClamped { ratio: f64 },
    /// `1/Qi` came out zero or negative
    UnphysicalQi { key: String, value: f64 },
    /// The iterative circle refinement failed, the algebraic circle was kept
    RefinementFailed(String),
    /// The joint fit of the raw trace failed, the circle fit was kept
    JointFitFailed(String),
}

impl fmt::Display for FitWarning {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FitWarning::PrefitFallback { df_rel, dql_rel } => write!(
                f,
                "Lorentzian prefit unreliable (df/fr = {df_rel:.3e}, dQl/Ql = {dql_rel:.3e}), using phase-derivative estimate"
            ),
            FitWarning::DelayFitDiverged { evaluations } => write!(
                f,
                "delay fit diverged after {evaluations} evaluations, delay set to 0"
            ),
            FitWarning::CovarianceSingular => {
                write!(f, "error calculation failed, covariance matrix is singular")
            }
            FitWarning::TiltClamped { ratio } => {
                write!(f, "circle center offset ratio {ratio:.3} exceeds 1, tilt clamped")
            }
            FitWarning::UnphysicalQi { key, value } => {
                write!(f, "{key} = {value:.3e} is unphysical (1/Qi <= 0)")
            }
            FitWarning::RefinementFailed(msg) => {
                write!(f, "iterative circle refinement failed: {msg}")
            }
            FitWarning::JointFitFailed(msg) => {
                write!(f, "joint fit of the raw trace failed, keeping the circle fit: {msg}")
            }
        }
    }
}

/// Fitted values, their 1-sigma errors and the goodness of fit.
///
/// Every key of `errors` is also a key of `values`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct FitResult {
    pub values: IndexMap<String, f64>,
    pub errors: IndexMap<String, f64>,
    pub chi_square: f64,
    pub warnings: Vec<FitWarning>,
}

impl FitResult {
    pub fn value(&self, key: &str) -> Option<f64> {
        self.values.get(key).copied()
    }

    pub fn error(&self, key: &str) -> Option<f64> {
        self.errors.get(key).copied()
    }

    /// Like `value`, but a missing key is an error.
    ///
    /// # Errors
    /// Will return `Err(FitError::BadFit)` if the key was never set.
    pub fn require(&self, key: &str) -> FittingResult<f64> {
        self.value(key)
            .ok_or_else(|| FitError::BadFit(format!("fit result has no value for '{key}'")))
    }

    pub(crate) fn set_value(&mut self, key: &str, value: f64) {
        self.values.insert(key.to_string(), value);
    }

    /// Stores the error of an existing value. Errors for unknown keys are dropped.
    pub(crate) fn set_error(&mut self, key: &str, error: f64) {
        if self.values.contains_key(key) {
            self.errors.insert(key.to_string(), error);
        }
    }

    pub(crate) fn warn(&mut self, warning: FitWarning) {
        tracing::warn!("{warning}");
        self.warnings.push(warning);
    }

    /// Flags `Qi` values whose inverse is not positive.
    pub(crate) fn check_qi(&mut self, key: &str) {
        if let Some(qi) = self.value(key) {
            if !(qi.is_finite() && qi > 0.0) {
                self.warn(FitWarning::UnphysicalQi {
                    key: key.to_string(),
                    value: qi,
                });
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn errors_only_attach_to_known_values() {
        let mut result = FitResult::default();
        result.set_value(keys::QL, 1e4);
        result.set_error(keys::QL, 10.0);
        result.set_error(keys::QC, 5.0);
        assert_eq!(result.error(keys::QL), Some(10.0));
        assert_eq!(result.error(keys::QC), None);
        assert!(result.errors.keys().all(|k| result.values.contains_key(k)));
    }

    #[test]
    fn negative_qi_is_flagged() {
        let mut result = FitResult::default();
        result.set_value(keys::QI, -3000.0);
        result.check_qi(keys::QI);
        assert!(matches!(
            result.warnings.as_slice(),
            [FitWarning::UnphysicalQi { .. }]
        ));
    }
}
