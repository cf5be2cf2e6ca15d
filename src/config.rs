//! Tunable settings of the calibration and fit pipeline.
//!
//! A config file is JSON; missing fields take their defaults:
//!
//! ```json
//! { "calc_errors": true, "refine_circle": true, "fixed_delay": 5.1e-8 }
//! ```
use crate::error::ResofitError;
use serde::{Deserialize, Serialize};
use std::fs::File;
use std::io::BufReader;
use std::path::Path;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct FitConfig {
    /// Propagate the fit covariance into errors of the quality factors
    pub calc_errors: bool,
    /// Follow the algebraic circle fit with a geometric refinement
    pub refine_circle: bool,
    /// Ignore the linear background slope found by the Lorentzian prefit. When used, the slope
    /// is a first-order correction: the prefit slope of `|z|²` converted to a slope of `|z|`
    pub ignore_slope: bool,
    /// Seed the delay fit with the phase slope. `None` uses the port's default
    pub guess_delay: Option<bool>,
    /// Use this cable delay (s) instead of estimating one
    pub fixed_delay: Option<f64>,
    /// Evaluation cap of the delay optimizer
    pub delay_max_evaluations: usize,
    /// `Ql` assumed when the Lorentzian prefit is unreliable. Empirical, not a physical constant
    pub prefit_fallback_ql: f64,
    /// Largest acceptable `df / fr` of the prefit
    pub prefit_df_tolerance: f64,
    /// Largest acceptable `dQl / Ql` of the prefit
    pub prefit_dql_tolerance: f64,
    /// Moving-average window applied to the phase before differentiating
    pub phase_smoothing: usize,
    /// Outlier tolerance of the tail-port filter, relative to the circle radius
    pub tail_outlier_factor: f64,
    /// Points at each end of a tail-port trace that are never filtered
    pub tail_edge_points: usize,
    /// Use the diameter-corrected quality factors of notch ports for photon numbers
    pub diameter_correction: bool,
    /// Finish `autofit` with a joint fit of resonance and environment on the raw trace
    pub joint_refinement: bool,
}

impl Default for FitConfig {
    fn default() -> Self {
        Self {
            calc_errors: true,
            refine_circle: false,
            ignore_slope: true,
            guess_delay: None,
            fixed_delay: None,
            delay_max_evaluations: 200,
            prefit_fallback_ql: 1e4,
            prefit_df_tolerance: 1e-3,
            prefit_dql_tolerance: 0.1,
            phase_smoothing: 3,
            tail_outlier_factor: 0.2,
            tail_edge_points: 3,
            diameter_correction: true,
            joint_refinement: true,
        }
    }
}

impl FitConfig {
    /// Reads a JSON config file.
    ///
    /// # Errors
    /// Will return `Err` if the file cannot be opened or is not valid JSON for this struct.
    pub fn from_json_file<P: AsRef<Path>>(path: P) -> Result<FitConfig, ResofitError> {
        let file = File::open(path)?;
        let config = serde_json::from_reader(BufReader::new(file))?;
        Ok(config)
    }
}
