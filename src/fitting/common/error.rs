#[cfg(feature = "python")]
use pyo3::exceptions::PyValueError;
#[cfg(feature = "python")]
use pyo3::PyErr;
use thiserror::Error;

pub type FittingResult<T> = std::result::Result<T, FitError>;

/// Enum of the possible error variants that may be encountered
#[derive(Error, Debug, Clone, PartialEq)]
pub enum FitError {
    /// Represents input data that cannot be fitted at all: empty, mismatched or unordered arrays
    #[error("invalid input: {0}")]
    InvalidInput(String),

    /// The circle fit is underdetermined or the moment matrix is singular
    #[error("degenerate geometry: {0}")]
    DegenerateGeometry(String),

    /// The delay optimizer hit its evaluation cap without converging
    #[error("delay fit did not converge within {evaluations} evaluations")]
    DelayFitDiverged { evaluations: usize },

    /// The normal matrix of the residual Jacobian could not be inverted
    #[error("covariance matrix is singular")]
    CovarianceSingular,

    /// A derived quantity was requested before `autofit`
    #[error("port has not been fitted yet, run autofit first")]
    NotCalibrated,

    /// Unknown port tag, or an operation the port type does not support
    #[error("unsupported port type: {0}")]
    UnsupportedPortType(String),

    /// Represents a bad fit of the data, for any reason
    #[error("{0}")]
    BadFit(String),
}

#[cfg(feature = "python")]
impl From<FitError> for PyErr {
    fn from(value: FitError) -> Self {
        let msg = value.to_string();
        PyValueError::new_err(msg)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn messages_name_the_failure() {
        let err = FitError::DelayFitDiverged { evaluations: 200 };
        assert_eq!(
            err.to_string(),
            "delay fit did not converge within 200 evaluations"
        );
        assert!(FitError::UnsupportedPortType("foo".to_string())
            .to_string()
            .contains("foo"));
    }
}
