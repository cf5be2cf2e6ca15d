//! Tail-type resonators measured in reflection (arXiv:2203.09247). Their response differs from a
//! notch port only in the sign of the detuning, so the affine map `f' = 2 fg - f` about the
//! phase extremum `fg` turns them into notch data.
use crate::config::FitConfig;
use crate::fitting::circlefit::circle::fit_circle;
use crate::fitting::common::error::FittingResult;
use crate::fitting::common::fitstruct::{keys, CalibrationRecord, FitResult, FitWarning};
use crate::fitting::common::preprocessing::{argmax_by, validate_trace, wrap_phase};
use crate::ports::notch::Notch;
use crate::ports::{environment, with_background, FitStrategy, PortFit, PortKind};
use num_complex::Complex64;
use std::f64::consts::PI;

#[derive(Debug, Clone, Copy, Default)]
pub struct Tail;

/// `a e^{iα} e^{-2πi f τ} (1 - (Ql/|Qc|) e^{iφ} / (1 - 2i Ql (f - fr) / fr))`
#[allow(clippy::too_many_arguments)]
pub fn tail_model(f: f64, fr: f64, ql: f64, abs_qc: f64, phi0: f64, a: f64, alpha: f64, delay: f64) -> Complex64 {
    let d = Complex64::new(1.0, -2.0 * ql * (f - fr) / fr);
    environment(f, a, alpha, delay) * (1.0 - Complex64::from_polar(ql / abs_qc, phi0) / d)
}

/// A tail trace mirrored into the notch frame, with point outliers removed.
#[derive(Debug, Clone, PartialEq)]
struct TailFrame {
    fr_guess: f64,
    /// Mirrored frequencies of the retained points
    f_notch: Vec<f64>,
    z_data: Vec<Complex64>,
}

impl TailFrame {
    fn new(f_data: &[f64], z_data: &[Complex64], config: &FitConfig) -> FittingResult<TailFrame> {
        validate_trace(f_data, z_data)?;
        let fr_guess = f_data[argmax_by(z_data, |z| z.arg())];
        let keep = outlier_mask(z_data, config)?;
        let (f_notch, z_kept): (Vec<f64>, Vec<Complex64>) = f_data
            .iter()
            .zip(z_data.iter())
            .zip(keep.iter())
            .filter(|(_, keep)| **keep)
            .map(|((f, z), _)| (mirror(*f, fr_guess), *z))
            .unzip();
        let dropped = f_data.len() - f_notch.len();
        if dropped > 0 {
            tracing::debug!(dropped, "tail port outliers removed");
        }
        Ok(TailFrame {
            fr_guess,
            f_notch,
            z_data: z_kept,
        })
    }

    fn f_tail(&self) -> Vec<f64> {
        self.f_notch.iter().map(|f| mirror(*f, self.fr_guess)).collect()
    }

    /// The map is an involution, so this converts records in either direction.
    fn mirror_record(&self, record: &CalibrationRecord) -> CalibrationRecord {
        CalibrationRecord {
            delay: -record.delay,
            amplitude_norm: record.amplitude_norm,
            alpha: mirror_alpha(record.alpha, record.delay, self.fr_guess),
            background_slope: -record.background_slope,
            fr_cal: mirror(record.fr_cal, self.fr_guess),
            fr: mirror(record.fr, self.fr_guess),
            ql: record.ql,
        }
    }

    fn mirror_result(&self, mut result: FitResult) -> FitResult {
        if let Some(fr) = result.value(keys::FR) {
            result.set_value(keys::FR, mirror(fr, self.fr_guess));
        }
        if let (Some(delay), Some(alpha)) = (result.value(keys::DELAY), result.value(keys::ALPHA)) {
            result.set_value(keys::ALPHA, mirror_alpha(alpha, delay, self.fr_guess));
            result.set_value(keys::DELAY, -delay);
            // the mirrored alpha depends on the delay, its error would need their correlation
            result.errors.shift_remove(keys::ALPHA);
        }
        result
    }

    fn into_tail_fit(self, notch_fit: PortFit) -> FittingResult<PortFit> {
        let frequencies = self.f_tail();
        let calibration = self.mirror_record(&notch_fit.calibration);
        let result = self.mirror_result(notch_fit.result);
        let z_sim = Tail.simulate(&frequencies, &result, &calibration)?;
        Ok(PortFit {
            calibration,
            frequencies,
            z_data: notch_fit.z_data,
            z_sim,
            result,
        })
    }
}

fn mirror(f: f64, fr_guess: f64) -> f64 {
    2.0 * fr_guess - f
}

/// `e^{iα} e^{-2πi f τ}` at `f` equals `e^{iα'} e^{+2πi f' τ}` at `f' = 2 fg - f`.
fn mirror_alpha(alpha: f64, delay: f64, fr_guess: f64) -> f64 {
    wrap_phase(alpha - 4.0 * PI * fr_guess * delay)
}

/// Marks points to retain. A point is dropped when both its real and imaginary magnitude,
/// relative to the circle center, differ from the mean of the last retained points by more
/// than `tail_outlier_factor` times the radius. The first and last `tail_edge_points` are kept.
fn outlier_mask(z_data: &[Complex64], config: &FitConfig) -> FittingResult<Vec<bool>> {
    let circle = fit_circle(z_data)?;
    let zc = circle.center();
    let centered: Vec<Complex64> = z_data.iter().map(|z| z - zc).collect();
    let tolerance = config.tail_outlier_factor * circle.r0;
    let edge = config.tail_edge_points.max(1);
    let n = centered.len();

    let mut keep = vec![true; n];
    for i in edge..n.saturating_sub(edge) {
        let window: Vec<Complex64> = (0..i)
            .rev()
            .filter(|&j| keep[j])
            .take(edge)
            .map(|j| centered[j])
            .collect();
        let avg_re = window.iter().map(|z| z.re.abs()).sum::<f64>() / window.len() as f64;
        let avg_im = window.iter().map(|z| z.im.abs()).sum::<f64>() / window.len() as f64;
        let off_re = (centered[i].re.abs() - avg_re).abs() >= tolerance;
        let off_im = (centered[i].im.abs() - avg_im).abs() >= tolerance;
        keep[i] = !(off_re && off_im);
    }
    Ok(keep)
}

impl FitStrategy for Tail {
    fn kind(&self) -> PortKind {
        PortKind::Tail
    }

    fn calibrate(
        &self,
        f_data: &[f64],
        z_data: &[Complex64],
        config: &FitConfig,
    ) -> FittingResult<(CalibrationRecord, Vec<FitWarning>)> {
        let frame = TailFrame::new(f_data, z_data, config)?;
        let (record, warnings) = Notch.calibrate(&frame.f_notch, &frame.z_data, config)?;
        Ok((frame.mirror_record(&record), warnings))
    }

    /// Expects calibrated data in the tail frame. The returned result has no delay or
    /// environment, those are added by `fit_calibrated`.
    fn circlefit(
        &self,
        f_data: &[f64],
        z_data: &[Complex64],
        calibration: &CalibrationRecord,
        config: &FitConfig,
    ) -> FittingResult<FitResult> {
        let frame = TailFrame::new(f_data, z_data, config)?;
        let result = Notch.circlefit(
            &frame.f_notch,
            &frame.z_data,
            &frame.mirror_record(calibration),
            config,
        )?;
        Ok(frame.mirror_result(result))
    }

    fn simulate(
        &self,
        f_data: &[f64],
        result: &FitResult,
        calibration: &CalibrationRecord,
    ) -> FittingResult<Vec<Complex64>> {
        let fr = result.require(keys::FR)?;
        let ql = result.require(keys::QL)?;
        let abs_qc = result.require(keys::ABS_QC)?;
        let phi0 = result.require(keys::PHI0)?;
        let a = result.require(keys::A)?;
        let alpha = result.require(keys::ALPHA)?;
        let delay = result.require(keys::DELAY)?;
        Ok(with_background(f_data, calibration, |f| {
            tail_model(f, fr, ql, abs_qc, phi0, a, alpha, delay)
        }))
    }

    fn quality_factors(&self, result: &FitResult, config: &FitConfig) -> FittingResult<(f64, f64)> {
        Notch.quality_factors(result, config)
    }

    fn fit_calibrated(
        &self,
        f_data: &[f64],
        z_data: &[Complex64],
        calibration: &CalibrationRecord,
        config: &FitConfig,
    ) -> FittingResult<PortFit> {
        let frame = TailFrame::new(f_data, z_data, config)?;
        let notch_fit = Notch.fit_calibrated(
            &frame.f_notch,
            &frame.z_data,
            &frame.mirror_record(calibration),
            config,
        )?;
        frame.into_tail_fit(notch_fit)
    }

    fn autofit(&self, f_data: &[f64], z_data: &[Complex64], config: &FitConfig) -> FittingResult<PortFit> {
        let frame = TailFrame::new(f_data, z_data, config)?;
        let notch_fit = Notch.autofit(&frame.f_notch, &frame.z_data, config)?;
        frame.into_tail_fit(notch_fit)
    }
}

/// Fits a tail-type resonance without a `Port`, returning the retained frequencies, the
/// simulated response there and the fit record.
///
/// # Errors
/// Will return `Err(FitError::InvalidInput)` for invalid traces and `Err` from the notch fit
/// if the mirrored data cannot be fitted.
pub fn tail_port(
    f_data: &[f64],
    z_data: &[Complex64],
    config: &FitConfig,
) -> FittingResult<(Vec<f64>, Vec<Complex64>, FitResult)> {
    validate_trace(f_data, z_data)?;
    let fit = Tail.autofit(f_data, z_data, config)?;
    Ok((fit.frequencies, fit.z_sim, fit.result))
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    fn tail_trace() -> (Vec<f64>, Vec<Complex64>) {
        let (fr, ql) = (6.0e9, 8.0e3);
        let f: Vec<f64> = (0..1001)
            .map(|i| fr - 3.0e6 + 6.0e6 * i as f64 / 1000.0)
            .collect();
        let z = f
            .iter()
            .map(|f| tail_model(*f, fr, ql, 1.6e4, 0.1, 0.9, -0.4, 0.0))
            .collect();
        (f, z)
    }

    #[test]
    fn mirrored_record_round_trips() {
        let frame = TailFrame {
            fr_guess: 5.0e9,
            f_notch: vec![],
            z_data: vec![],
        };
        let record = CalibrationRecord {
            delay: 3.0e-8,
            amplitude_norm: 0.7,
            alpha: 1.1,
            background_slope: 1e-9,
            fr_cal: 5.001e9,
            fr: 5.0005e9,
            ql: 1e4,
        };
        let back = frame.mirror_record(&frame.mirror_record(&record));
        assert_relative_eq!(back.delay, record.delay);
        assert_relative_eq!(wrap_phase(back.alpha - record.alpha), 0.0, epsilon = 1e-6);
        assert_relative_eq!(back.fr, record.fr);
        assert_relative_eq!(back.background_slope, record.background_slope);
    }

    #[test]
    fn clean_trace_keeps_every_point() {
        let (_, z) = tail_trace();
        let keep = outlier_mask(&z, &FitConfig::default()).expect("circle fit failed");
        assert!(keep.iter().all(|k| *k));
    }

    #[test]
    fn point_outlier_is_dropped() {
        let (_, mut z) = tail_trace();
        z[500] += Complex64::new(2.0, 2.0);
        let keep = outlier_mask(&z, &FitConfig::default()).expect("circle fit failed");
        assert!(!keep[500]);
        assert_eq!(keep.iter().filter(|k| !**k).count(), 1);
    }

    #[test]
    fn tail_fit_recovers_resonance() {
        let (f, z) = tail_trace();
        let (f_fit, z_sim, result) = tail_port(&f, &z, &FitConfig::default()).expect("tail fit failed");
        assert_eq!(f_fit.len(), f.len());
        assert_eq!(z_sim.len(), f.len());
        assert_relative_eq!(result.value(keys::FR).unwrap(), 6.0e9, max_relative = 1e-7);
        assert_relative_eq!(result.value(keys::QL).unwrap(), 8.0e3, max_relative = 1e-2);
    }
}
