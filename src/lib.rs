//! Calibration and circle fits of microwave resonator S-parameter traces.
//!
//! A raw trace is first brought into canonical position (cable delay, amplitude and phase of
//! the environment removed), then the resonance circle is fitted with the closed-form model of
//! the port topology to extract `fr`, `Ql`, `Qc` and `Qi`.
pub mod batch;
pub mod config;
pub mod error;
pub mod fitting;
pub mod ports;
pub mod resonator;
pub mod utils;

#[cfg(feature = "python")]
mod python;

pub use batch::{BatchProcessor, SweepFit, SweepPoint};
pub use config::FitConfig;
pub use error::ResofitError;
pub use fitting::common::error::{FitError, FittingResult};
pub use fitting::common::fitstruct::{keys, CalibrationRecord, FitResult, FitWarning};
pub use ports::{tail_port, FitStrategy, Port, PortFit, PortKind};
pub use resonator::Resonator;
pub use utils::units::PowerUnit;
