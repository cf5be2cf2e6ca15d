//! Covariance estimates for the port models. The calibrated models use a fast estimate with
//! analytic derivatives projected onto the direction of each complex residual, the joint fit
//! of the raw trace uses the full complex Jacobian.
use crate::fitting::common::error::{FitError, FittingResult};
use nalgebra::DMatrix;
use num_complex::Complex64;

/// Covariance of the fitted parameters together with the reduced chi-square.
#[derive(Debug, Clone, PartialEq)]
pub struct Covariance {
    pub matrix: DMatrix<f64>,
    pub chi_square: f64,
}

impl Covariance {
    pub fn std_dev(&self, i: usize) -> f64 {
        self.matrix[(i, i)].max(0.0).sqrt()
    }
}

/// Ideal notch response `1 - (Ql/Qc) e^{iφ} / (1 + 2i Ql (f - fr) / fr)`, parameters `[fr, absQc, Ql, phi0]`.
pub fn notch_ideal(f: f64, p: &[f64; 4]) -> Complex64 {
    let [fr, qc, ql, phi] = *p;
    let d = Complex64::new(1.0, 2.0 * ql * (f - fr) / fr);
    1.0 - Complex64::from_polar(ql / qc, phi) / d
}

/// Derivatives of [`notch_ideal`] with respect to `[fr, absQc, Ql, phi0]`.
pub(crate) fn notch_gradient(f: f64, p: &[f64; 4]) -> [Complex64; 4] {
    let [fr, qc, ql, phi] = *p;
    let i = Complex64::i();
    let d = Complex64::new(1.0, 2.0 * ql * (f - fr) / fr);
    let e = Complex64::from_polar(1.0, phi);
    [
        -e * 2.0 * i * ql * ql * f / (qc * fr * fr * d * d),
        e * (ql / (qc * qc)) / d,
        -e / (qc * d * d),
        -i * e * (ql / qc) / d,
    ]
}

/// Ideal reflection response `(2Ql/Qc - 1 + 2i Ql (fr - f)/fr) / (1 - 2i Ql (fr - f)/fr)`,
/// parameters `[fr, Qc, Ql]`.
pub fn reflection_ideal(f: f64, p: &[f64; 3]) -> Complex64 {
    let [fr, qc, ql] = *p;
    let u = Complex64::new(0.0, 2.0 * ql * (fr - f) / fr);
    (2.0 * ql / qc - 1.0 + u) / (1.0 - u)
}

/// Derivatives of [`reflection_ideal`] with respect to `[fr, Qc, Ql]`.
pub(crate) fn reflection_gradient(f: f64, p: &[f64; 3]) -> [Complex64; 3] {
    let [fr, qc, ql] = *p;
    let i = Complex64::i();
    let u = Complex64::new(0.0, 2.0 * ql * (fr - f) / fr);
    let one_minus = 1.0 - u;
    [
        4.0 * i * ql * ql * f / (qc * fr * fr * one_minus * one_minus),
        -2.0 * ql / (qc * qc * one_minus),
        2.0 / (qc * one_minus * one_minus),
    ]
}

/// Reduced chi-square of the complex residuals, `Σ|z - S|² / (N - P)`.
pub fn chi_square<F: Fn(f64) -> Complex64>(f_data: &[f64], z_data: &[Complex64], n_params: usize, model: F) -> f64 {
    let dof = f_data.len().saturating_sub(n_params).max(1);
    f_data
        .iter()
        .zip(z_data.iter())
        .map(|(f, z)| (z - model(*f)).norm_sqr())
        .sum::<f64>()
        / dof as f64
}

fn projected_covariance<const P: usize, M, G>(
    f_data: &[f64],
    z_data: &[Complex64],
    model: M,
    gradient: G,
) -> FittingResult<Covariance>
where
    M: Fn(f64) -> Complex64,
    G: Fn(f64) -> [Complex64; P],
{
    let chi_square = chi_square(f_data, z_data, P, &model);
    let mut normal = DMatrix::<f64>::zeros(P, P);
    for (f, z) in f_data.iter().zip(z_data.iter()) {
        let residual = z - model(*f);
        let norm = residual.norm();
        if norm <= f64::MIN_POSITIVE {
            continue;
        }
        let direction = residual / norm;
        let row: Vec<f64> = gradient(*f)
            .iter()
            .map(|g| direction.re * g.re + direction.im * g.im)
            .collect();
        for a in 0..P {
            for b in 0..P {
                normal[(a, b)] += row[a] * row[b];
            }
        }
    }
    let inverse = scaled_inverse(&normal)?;
    let matrix = inverse * chi_square;
    if matrix.iter().any(|v| !v.is_finite()) {
        Err(FitError::CovarianceSingular)?
    }
    Ok(Covariance { matrix, chi_square })
}

/// Inverse of a normal matrix, taken in correlation form since the parameters span many
/// orders of magnitude.
fn scaled_inverse(normal: &DMatrix<f64>) -> FittingResult<DMatrix<f64>> {
    let n = normal.nrows();
    let scales: Vec<f64> = (0..n).map(|k| normal[(k, k)].sqrt()).collect();
    if scales.iter().any(|s| !(s.is_finite() && *s > 0.0)) {
        Err(FitError::CovarianceSingular)?
    }
    let scaled = DMatrix::from_fn(n, n, |a, b| normal[(a, b)] / (scales[a] * scales[b]));
    let singular_values = scaled.clone().svd(false, false).singular_values;
    let largest = singular_values.iter().fold(0.0_f64, |m, s| m.max(*s));
    let smallest = singular_values.iter().fold(f64::INFINITY, |m, s| m.min(*s));
    if smallest <= 1e-12 * largest {
        Err(FitError::CovarianceSingular)?
    }
    let inverse = scaled.try_inverse().ok_or(FitError::CovarianceSingular)?;
    Ok(DMatrix::from_fn(n, n, |a, b| inverse[(a, b)] / (scales[a] * scales[b])))
}

/// Covariance of a complex least-squares fit from its Jacobian, one row of derivatives per
/// residual. Both quadratures count as samples, so the noise variance per quadrature is
/// `Σ|r|² / (2N - P)`. The reported chi-square keeps the `Σ|r|² / (N - P)` convention of
/// [`chi_square`].
///
/// # Errors
/// Will return `Err(FitError::CovarianceSingular)` if the normal matrix cannot be inverted.
pub fn complex_covariance(residuals: &[Complex64], jacobian: &[Vec<Complex64>]) -> FittingResult<Covariance> {
    let p = jacobian.first().map_or(0, Vec::len);
    if p == 0 || residuals.len() != jacobian.len() {
        Err(FitError::CovarianceSingular)?
    }
    let mut normal = DMatrix::<f64>::zeros(p, p);
    for row in jacobian {
        for a in 0..p {
            for b in a..p {
                let v = row[a].re * row[b].re + row[a].im * row[b].im;
                normal[(a, b)] += v;
                if a != b {
                    normal[(b, a)] += v;
                }
            }
        }
    }
    let sum_sqr: f64 = residuals.iter().map(|r| r.norm_sqr()).sum();
    let n = residuals.len();
    let variance = sum_sqr / (2 * n).saturating_sub(p).max(1) as f64;
    let matrix = scaled_inverse(&normal)? * variance;
    if matrix.iter().any(|v| !v.is_finite()) {
        Err(FitError::CovarianceSingular)?
    }
    Ok(Covariance {
        matrix,
        chi_square: sum_sqr / n.saturating_sub(p).max(1) as f64,
    })
}

/// Covariance of `[fr, absQc, Ql, phi0]` for calibrated notch data.
///
/// # Errors
/// Will return `Err(FitError::CovarianceSingular)` if the normal matrix cannot be inverted.
pub fn notch_covariance(f_data: &[f64], z_data: &[Complex64], p: &[f64; 4]) -> FittingResult<Covariance> {
    projected_covariance(f_data, z_data, |f| notch_ideal(f, p), |f| notch_gradient(f, p))
}

/// Covariance of `[fr, Qc, Ql]` for calibrated reflection data.
///
/// # Errors
/// Will return `Err(FitError::CovarianceSingular)` if the normal matrix cannot be inverted.
pub fn reflection_covariance(
    f_data: &[f64],
    z_data: &[Complex64],
    p: &[f64; 3],
) -> FittingResult<Covariance> {
    projected_covariance(
        f_data,
        z_data,
        |f| reflection_ideal(f, p),
        |f| reflection_gradient(f, p),
    )
}

/// Error of `Qi = 1 / (1/Ql - 1/Qc)` by the delta method, including the `Ql`/`Qc` correlation.
pub fn qi_error(ql: f64, qc: f64, var_ql: f64, var_qc: f64, cov_ql_qc: f64) -> f64 {
    let denom = (1.0 / ql - 1.0 / qc).powi(2);
    let d_ql = 1.0 / (denom * ql * ql);
    let d_qc = -1.0 / (denom * qc * qc);
    (d_ql * d_ql * var_ql + d_qc * d_qc * var_qc + 2.0 * d_ql * d_qc * cov_ql_qc)
        .max(0.0)
        .sqrt()
}

/// Error of the diameter-corrected `Qi = 1 / (1/Ql - cos(φ0)/|Qc|)`, with `cov` indexed as
/// `[fr, absQc, Ql, phi0]`.
pub fn qi_dia_corr_error(ql: f64, abs_qc: f64, phi0: f64, cov: &DMatrix<f64>) -> f64 {
    let (sin, cos) = phi0.sin_cos();
    let denom = (1.0 / ql - cos / abs_qc).powi(2);
    let d_ql = 1.0 / (denom * ql * ql);
    let d_qc = -cos / (denom * abs_qc * abs_qc);
    let d_phi = -sin / (denom * abs_qc);
    let diagonal = d_ql * d_ql * cov[(2, 2)] + d_qc * d_qc * cov[(1, 1)] + d_phi * d_phi * cov[(3, 3)];
    let correlations =
        d_ql * d_qc * cov[(2, 1)] + d_ql * d_phi * cov[(2, 3)] + d_qc * d_phi * cov[(1, 3)];
    (diagonal + 2.0 * correlations).max(0.0).sqrt()
}
