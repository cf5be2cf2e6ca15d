//! Geometric building blocks of the resonator fit: the algebraic circle fit, the phase and
//! delay fits that run on it, the Lorentzian prefits, the joint fit of the raw trace and the
//! error propagation.
pub mod calibration;
pub mod circle;
pub mod covariance;
pub mod delay;
pub mod joint;
pub mod least_squares;
pub mod lorentzian;
pub mod phase;
