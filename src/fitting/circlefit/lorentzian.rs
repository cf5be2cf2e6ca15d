use crate::fitting::common::error::{FitError, FittingResult};
use crate::fitting::common::preprocessing::{argmax_by, argmin_by, validate_trace, FrequencyScale};
use num_complex::Complex64;
use rmpfit::{MPConfig, MPFitter, MPPar, MPResult};

/// Parameters of `|z|² = A1 + A2 (f - fr) + (A3 + A4 (f - fr)) / (1 + 4 Ql² ((f - fr) / fr)²)`
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SkewedLorentzian {
    pub a1: f64,
    pub a2: f64,
    pub a3: f64,
    pub a4: f64,
    pub fr: f64,
    pub ql: f64,
    /// 1-sigma error of `fr`, scaled by the reduced chi-square
    pub df_error: f64,
    /// 1-sigma error of `Ql`, scaled by the reduced chi-square
    pub dql_error: f64,
}

impl SkewedLorentzian {
    pub fn evaluate(&self, f: f64) -> f64 {
        let df = f - self.fr;
        self.a1
            + self.a2 * df
            + (self.a3 + self.a4 * df) / (1.0 + 4.0 * self.ql * self.ql * (df / self.fr).powi(2))
    }
}

/// Fits a skewed Lorentzian to the squared magnitude of the trace in two stages: first the
/// background slope, asymmetry and width with the other terms fixed at data-derived guesses,
/// then all six parameters.
///
/// # Errors
/// Will return `Err(FitError::InvalidInput)` for invalid traces, or `Err(FitError::BadFit)`
/// if either optimizer stage fails outright.
pub fn fit_skewed_lorentzian(f_data: &[f64], z_data: &[Complex64]) -> FittingResult<SkewedLorentzian> {
    validate_trace(f_data, z_data)?;
    let scale = FrequencyScale::new(f_data);
    let amplitude_sqr: Vec<f64> = z_data.iter().map(|z| z.norm_sqr()).collect();
    let n = amplitude_sqr.len();

    let a1 = amplitude_sqr[0].min(amplitude_sqr[n - 1]);
    let a3 = -amplitude_sqr[argmax_by(&amplitude_sqr, |a| *a)];
    let fr = f_data[argmin_by(&amplitude_sqr, |a| *a)];

    let mut problem = SkewedLorentzianProblem {
        x: f_data.iter().map(|f| scale.to_unit(*f)).collect(),
        y: amplitude_sqr,
        scale,
        base: [a1, 0.0, a3, 0.0, scale.to_unit(fr), 1e3],
        free: vec![1, 3, 5],
    };
    let mut params = problem.initial();
    problem
        .mpfit(&mut params)
        .map_err(|e| FitError::BadFit(format!("Error with MPFit: {e}")))?;
    problem.absorb(&params);

    problem.free = (0..6).collect();
    let mut params = problem.initial();
    let status = problem
        .mpfit(&mut params)
        .map_err(|e| FitError::BadFit(format!("Error with MPFit: {e}")))?;
    problem.absorb(&params);

    let [a1, a2, a3, a4, ur, ql] = problem.base;
    let dof = n.saturating_sub(6);
    let reduced_chi = if dof > 0 { (status.best_norm / dof as f64).sqrt() } else { f64::INFINITY };
    let prefit = SkewedLorentzian {
        a1,
        a2: a2 / scale.span,
        a3,
        a4: a4 / scale.span,
        fr: scale.to_hz(ur),
        ql: ql.abs(),
        df_error: status.xerror[4] * scale.span * reduced_chi,
        dql_error: status.xerror[5] * reduced_chi,
    };
    tracing::debug!(fr = prefit.fr, ql = prefit.ql, df = prefit.df_error, dql = prefit.dql_error, "skewed lorentzian prefit");
    Ok(prefit)
}

/// Skewed Lorentzian in the normalized frequency coordinate, only the `free` parameters vary.
struct SkewedLorentzianProblem {
    x: Vec<f64>,
    y: Vec<f64>,
    scale: FrequencyScale,
    /// `[A1, A2, A3, A4, ur, Ql]`, slopes per unit of normalized frequency
    base: [f64; 6],
    free: Vec<usize>,
}

impl SkewedLorentzianProblem {
    fn initial(&self) -> Vec<f64> {
        self.free.iter().map(|&i| self.base[i]).collect()
    }

    fn absorb(&mut self, params: &[f64]) {
        for (&i, &p) in self.free.iter().zip(params.iter()) {
            self.base[i] = p;
        }
    }
}

impl MPFitter for SkewedLorentzianProblem {
    fn eval(&mut self, params: &[f64], deviates: &mut [f64]) -> MPResult<()> {
        let mut p = self.base;
        for (&i, &v) in self.free.iter().zip(params.iter()) {
            p[i] = v;
        }
        let [a1, a2, a3, a4, ur, ql] = p;
        let fr = self.scale.to_hz(ur);
        for ((dev, x), y) in deviates.iter_mut().zip(self.x.iter()).zip(self.y.iter()) {
            let du = x - ur;
            let detuning = self.scale.span * du / fr;
            *dev = y - (a1 + a2 * du + (a3 + a4 * du) / (1.0 + 4.0 * ql * ql * detuning * detuning));
        }
        Ok(())
    }

    fn number_of_points(&self) -> usize {
        self.x.len()
    }

    fn config(&self) -> MPConfig {
        MPConfig {
            ftol: 1e-10,
            xtol: 1e-10,
            max_fev: 2000,
            ..Default::default()
        }
    }

    fn parameters(&self) -> Option<&[MPPar]> {
        None
    }
}

/// Result of the magnitude-squared Lorentzian fit of a transmission measurement.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct TransmissionLorentzian {
    pub fr: f64,
    pub ql: f64,
    /// Peak value of `|S21|²`
    pub ampsqr: f64,
    pub fr_err: f64,
    pub ql_err: f64,
    pub ampsqr_err: f64,
    /// Sum of squared residuals divided by the degrees of freedom
    pub chi_square: f64,
}

impl TransmissionLorentzian {
    pub fn evaluate(&self, f: f64) -> f64 {
        self.ampsqr / (1.0 + 4.0 * self.ql * self.ql * ((f - self.fr) / self.fr).powi(2))
    }
}

/// Fits `|S21|² = Ampsqr / (1 + 4 Ql² ((f - fr) / fr)²)`, seeded with the peak of the data and
/// `Ql = 1000`. Errors are scaled by the reduced chi-square.
///
/// # Errors
/// Will return `Err(FitError::InvalidInput)` if there are no more points than parameters, and
/// `Err(FitError::BadFit)` if the optimizer fails.
pub fn fit_transmission_lorentzian(
    f_data: &[f64],
    z_data: &[Complex64],
) -> FittingResult<TransmissionLorentzian> {
    if f_data.len() <= 3 {
        Err(FitError::InvalidInput(format!(
            "need more than 3 points for a transmission fit, got {}",
            f_data.len()
        )))?
    }
    let scale = FrequencyScale::new(f_data);
    let amplitude_sqr: Vec<f64> = z_data.iter().map(|z| z.norm_sqr()).collect();
    let peak = argmax_by(&amplitude_sqr, |a| *a);

    let mut problem = TransmissionProblem {
        x: f_data.iter().map(|f| scale.to_unit(*f)).collect(),
        y: amplitude_sqr.clone(),
        scale,
        params: vec![
            MPPar::default(),
            MPPar {
                limited_low: true,
                limit_low: 1.0,
                ..Default::default()
            },
            MPPar::default(),
        ],
    };
    let mut params = vec![scale.to_unit(f_data[peak]), 1000.0, amplitude_sqr[peak]];
    let status = problem
        .mpfit(&mut params)
        .map_err(|e| FitError::BadFit(format!("Error with MPFit: {e}")))?;

    let chi_square = status.best_norm / (f_data.len() - 3) as f64;
    let scaling = chi_square.sqrt();
    Ok(TransmissionLorentzian {
        fr: scale.to_hz(params[0]),
        ql: params[1],
        ampsqr: params[2],
        fr_err: status.xerror[0] * scale.span * scaling,
        ql_err: status.xerror[1] * scaling,
        ampsqr_err: status.xerror[2] * scaling,
        chi_square,
    })
}

/// Lorentzian peak, parameters `[ur, Ql, Ampsqr]`
struct TransmissionProblem {
    x: Vec<f64>,
    y: Vec<f64>,
    scale: FrequencyScale,
    params: Vec<MPPar>,
}

impl MPFitter for TransmissionProblem {
    fn eval(&mut self, params: &[f64], deviates: &mut [f64]) -> MPResult<()> {
        let fr = self.scale.to_hz(params[0]);
        for ((dev, x), y) in deviates.iter_mut().zip(self.x.iter()).zip(self.y.iter()) {
            let detuning = self.scale.span * (x - params[0]) / fr;
            *dev = y - params[2] / (1.0 + 4.0 * params[1] * params[1] * detuning * detuning);
        }
        Ok(())
    }

    fn number_of_points(&self) -> usize {
        self.x.len()
    }

    fn config(&self) -> MPConfig {
        MPConfig {
            ftol: 1e-10,
            xtol: 1e-10,
            max_fev: 2000,
            ..Default::default()
        }
    }

    fn parameters(&self) -> Option<&[MPPar]> {
        Some(&*self.params)
    }
}
