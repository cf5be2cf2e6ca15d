//! Fits of swept measurements, e.g. one trace per drive power or magnetic field.
use crate::config::FitConfig;
use crate::fitting::common::error::{FitError, FittingResult};
use crate::fitting::common::fitstruct::CalibrationRecord;
use crate::fitting::common::preprocessing::validate_trace;
use crate::ports::{FitStrategy, PortFit, PortKind};
use num_complex::Complex64;
use rayon::prelude::*;
use serde::{Deserialize, Serialize};

/// One trace of a sweep and the value of the swept parameter it was taken at.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SweepPoint {
    pub parameter: f64,
    pub frequencies: Vec<f64>,
    pub response: Vec<Complex64>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SweepFit {
    pub parameter: f64,
    pub fit: PortFit,
}

#[derive(Debug)]
pub struct BatchProcessor {
    strategy: Box<dyn FitStrategy>,
    pub config: FitConfig,
    /// Index of the slice whose calibration is used for the whole sweep. Every slice is
    /// calibrated on its own when unset.
    pub calibration_slice: Option<usize>,
}

impl BatchProcessor {
    pub fn new(kind: PortKind, config: FitConfig) -> BatchProcessor {
        BatchProcessor {
            strategy: kind.strategy(),
            config,
            calibration_slice: None,
        }
    }

    pub fn with_calibration_slice(mut self, slice: usize) -> BatchProcessor {
        self.calibration_slice = Some(slice);
        self
    }

    pub fn kind(&self) -> PortKind {
        self.strategy.kind()
    }

    /// Calibrates the reference slice, if one is configured.
    fn shared_calibration(&self, sweep: &[SweepPoint]) -> FittingResult<Option<CalibrationRecord>> {
        let Some(index) = self.calibration_slice else {
            return Ok(None);
        };
        let point = sweep.get(index).ok_or_else(|| {
            FitError::InvalidInput(format!(
                "calibration slice {index} out of range for a sweep of {} traces",
                sweep.len()
            ))
        })?;
        validate_trace(&point.frequencies, &point.response)?;
        let (calibration, warnings) =
            self.strategy
                .calibrate(&point.frequencies, &point.response, &self.config)?;
        tracing::debug!(slice = index, warnings = warnings.len(), "shared calibration");
        Ok(Some(calibration))
    }

    fn fit_point(&self, point: &SweepPoint, calibration: Option<&CalibrationRecord>) -> FittingResult<SweepFit> {
        validate_trace(&point.frequencies, &point.response)?;
        let fit = match calibration {
            Some(calibration) => self.strategy.fit_calibrated(
                &point.frequencies,
                &point.response,
                calibration,
                &self.config,
            ),
            None => self
                .strategy
                .autofit(&point.frequencies, &point.response, &self.config),
        }?;
        Ok(SweepFit {
            parameter: point.parameter,
            fit,
        })
    }

    /// Fits every slice of a sweep, in order.
    ///
    /// # Errors
    /// Will return the first fit error encountered.
    pub fn autofit(&self, sweep: &[SweepPoint]) -> FittingResult<Vec<SweepFit>> {
        let calibration = self.shared_calibration(sweep)?;
        sweep
            .iter()
            .map(|point| self.fit_point(point, calibration.as_ref()))
            .collect()
    }

    /// Fits every slice of a sweep in parallel. Results keep the order of the sweep.
    ///
    /// # Errors
    /// Will return a fit error if any slice fails.
    pub fn par_autofit(&self, sweep: &[SweepPoint]) -> FittingResult<Vec<SweepFit>> {
        let calibration = self.shared_calibration(sweep)?;
        sweep
            .par_iter()
            .map(|point| self.fit_point(point, calibration.as_ref()))
            .collect()
    }
}
