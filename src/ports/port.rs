use crate::config::FitConfig;
use crate::fitting::common::error::{FitError, FittingResult};
use crate::fitting::common::fitstruct::{keys, CalibrationRecord, FitResult};
use crate::fitting::common::preprocessing::validate_trace;
use crate::ports::{photons_per_watt, FitStrategy, PortFit, PortKind};
use crate::utils::units::{to_watt, watt_to_dbm, PowerUnit};
use num_complex::Complex64;

/// One measured port of a resonator: the raw trace, how to fit it, and the fit once done.
#[derive(Debug)]
pub struct Port {
    strategy: Box<dyn FitStrategy>,
    pub config: FitConfig,
    f_data: Vec<f64>,
    z_data_raw: Vec<Complex64>,
    fit: Option<PortFit>,
}

impl Port {
    /// A port without data, to be filled with `set_data`.
    pub fn new(kind: PortKind) -> Port {
        Port {
            strategy: kind.strategy(),
            config: FitConfig::default(),
            f_data: vec![],
            z_data_raw: vec![],
            fit: None,
        }
    }

    /// # Errors
    /// Will return `Err(FitError::InvalidInput)` if the trace is not fittable.
    pub fn with_data(kind: PortKind, f_data: Vec<f64>, z_data: Vec<Complex64>) -> FittingResult<Port> {
        let mut port = Port::new(kind);
        port.set_data(f_data, z_data)?;
        Ok(port)
    }

    pub fn with_config(mut self, config: FitConfig) -> Port {
        self.config = config;
        self
    }

    /// Loads the raw trace. The raw data of a port is never replaced.
    ///
    /// # Errors
    /// Will return `Err(FitError::InvalidInput)` if the trace is not fittable or the port
    /// already holds data.
    pub fn set_data(&mut self, f_data: Vec<f64>, z_data: Vec<Complex64>) -> FittingResult<()> {
        if !self.f_data.is_empty() {
            Err(FitError::InvalidInput(
                "port already holds raw data".to_string(),
            ))?
        }
        validate_trace(&f_data, &z_data)?;
        self.f_data = f_data;
        self.z_data_raw = z_data;
        Ok(())
    }

    pub fn kind(&self) -> PortKind {
        self.strategy.kind()
    }

    pub fn has_data(&self) -> bool {
        !self.f_data.is_empty()
    }

    pub fn f_data(&self) -> &[f64] {
        &self.f_data
    }

    pub fn z_data_raw(&self) -> &[Complex64] {
        &self.z_data_raw
    }

    /// Calibrates and fits the raw trace, replacing any earlier fit.
    ///
    /// # Errors
    /// Will return `Err(FitError::InvalidInput)` if no data was loaded, or the fit error if the
    /// trace cannot produce any numeric result.
    pub fn autofit(&mut self) -> FittingResult<()> {
        if !self.has_data() {
            Err(FitError::InvalidInput("port has no data to fit".to_string()))?
        }
        tracing::debug!(kind = %self.kind(), points = self.f_data.len(), "autofit");
        let fit = self
            .strategy
            .autofit(&self.f_data, &self.z_data_raw, &self.config)?;
        self.fit = Some(fit);
        Ok(())
    }

    /// Fits the raw trace with calibration constants found elsewhere, e.g. on another slice
    /// of a power sweep.
    ///
    /// # Errors
    /// Same as `autofit`.
    pub fn fit_with_calibration(&mut self, calibration: &CalibrationRecord) -> FittingResult<()> {
        if !self.has_data() {
            Err(FitError::InvalidInput("port has no data to fit".to_string()))?
        }
        let fit = self
            .strategy
            .fit_calibrated(&self.f_data, &self.z_data_raw, calibration, &self.config)?;
        self.fit = Some(fit);
        Ok(())
    }

    pub fn fit(&self) -> Option<&PortFit> {
        self.fit.as_ref()
    }

    /// # Errors
    /// Will return `Err(FitError::NotCalibrated)` before `autofit`.
    pub fn fit_result(&self) -> FittingResult<&FitResult> {
        self.fit
            .as_ref()
            .map(|fit| &fit.result)
            .ok_or(FitError::NotCalibrated)
    }

    /// # Errors
    /// Will return `Err(FitError::NotCalibrated)` before `autofit`.
    pub fn calibration(&self) -> FittingResult<&CalibrationRecord> {
        self.fit
            .as_ref()
            .map(|fit| &fit.calibration)
            .ok_or(FitError::NotCalibrated)
    }

    /// Calibrated trace, recomputed by every fit.
    pub fn z_data(&self) -> Option<&[Complex64]> {
        self.fit.as_ref().map(|fit| fit.z_data.as_slice())
    }

    pub fn z_data_sim(&self) -> Option<&[Complex64]> {
        self.fit.as_ref().map(|fit| fit.z_sim.as_slice())
    }

    fn photons_per_watt(&self) -> FittingResult<f64> {
        let result = self.fit_result()?;
        let (qc, qi) = self.strategy.quality_factors(result, &self.config)?;
        Ok(photons_per_watt(result.require(keys::FR)?, qc, qi))
    }

    /// Drive power that keeps on average one photon in the resonator.
    ///
    /// # Errors
    /// Will return `Err(FitError::NotCalibrated)` before `autofit`, and
    /// `Err(FitError::UnsupportedPortType)` for transmission ports.
    pub fn get_single_photon_limit(&self, unit: PowerUnit) -> FittingResult<f64> {
        let watt = 1.0 / self.photons_per_watt()?;
        Ok(match unit {
            PowerUnit::Watt => watt,
            PowerUnit::Dbm => watt_to_dbm(watt),
        })
    }

    /// Average photon number at the given drive power.
    ///
    /// # Errors
    /// Same as `get_single_photon_limit`.
    pub fn get_photons_in_resonator(&self, power: f64, unit: PowerUnit) -> FittingResult<f64> {
        Ok(self.photons_per_watt()? * to_watt(power, unit))
    }
}
