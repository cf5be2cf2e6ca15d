//! Algebraic circle fit of Chernov & Lesort ("Least Squares Fitting of Circles",
//! J. Math. Imaging Vision 23, 239 (2005)), with optional geometric refinement.
use crate::fitting::common::error::{FitError, FittingResult};
use nalgebra::Matrix4;
use num_complex::Complex64;
use rmpfit::{MPConfig, MPFitter, MPPar, MPResult};

const MAX_NEWTON_STEPS: usize = 100;

/// A circle in the complex plane.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Circle {
    pub xc: f64,
    pub yc: f64,
    pub r0: f64,
}

impl Circle {
    pub fn center(&self) -> Complex64 {
        Complex64::new(self.xc, self.yc)
    }

    /// Signed geometric distance of every point to the circle.
    pub fn residuals(&self, z_data: &[Complex64]) -> Vec<f64> {
        z_data
            .iter()
            .map(|z| (z - self.center()).norm() - self.r0)
            .collect()
    }
}

/// Moment matrix of `{z, x, y, 1}` with `z = x² + y²`.
fn moments(z_data: &[Complex64]) -> [[f64; 4]; 4] {
    let mut m = [[0.0; 4]; 4];
    for p in z_data {
        let row = [p.norm_sqr(), p.re, p.im, 1.0];
        for i in 0..4 {
            for j in i..4 {
                m[i][j] += row[i] * row[j];
            }
        }
    }
    for i in 0..4 {
        for j in 0..i {
            m[i][j] = m[j][i];
        }
    }
    m
}

/// Coefficients `a0..a4` of `det(M - η N)`, where `N` is the Pratt constraint matrix.
fn characteristic_quartic(m: &[[f64; 4]; 4]) -> [f64; 5] {
    let a0 = ((m[2][0] * m[3][2] - m[2][2] * m[3][0]) * m[1][1]
        - m[1][2] * m[2][0] * m[3][1]
        - m[1][0] * m[2][1] * m[3][2]
        + m[1][0] * m[2][2] * m[3][1]
        + m[1][2] * m[2][1] * m[3][0])
        * m[0][3]
        + (m[0][2] * m[2][3] * m[3][0] - m[0][2] * m[2][0] * m[3][3]
            + m[0][0] * m[2][2] * m[3][3]
            - m[0][0] * m[2][3] * m[3][2])
            * m[1][1]
        + (m[0][1] * m[1][3] * m[3][0]
            - m[0][1] * m[1][0] * m[3][3]
            - m[0][0] * m[1][3] * m[3][1])
            * m[2][2]
        + (-m[0][1] * m[1][2] * m[2][3] - m[0][2] * m[1][3] * m[2][1]) * m[3][0]
        + ((m[2][3] * m[3][1] - m[2][1] * m[3][3]) * m[1][2] + m[2][1] * m[3][2] * m[1][3])
            * m[0][0]
        + (m[1][0] * m[2][3] * m[3][2] + m[2][0] * (m[1][2] * m[3][3] - m[1][3] * m[3][2]))
            * m[0][1]
        + ((m[2][1] * m[3][3] - m[2][3] * m[3][1]) * m[1][0] + m[1][3] * m[2][0] * m[3][1])
            * m[0][2];
    let a1 = ((m[3][0] - 2.0 * m[2][2]) * m[1][1] - m[1][0] * m[3][1]
        + m[2][2] * m[3][0]
        + 2.0 * m[1][2] * m[2][1]
        - m[2][0] * m[3][2])
        * m[0][3]
        + (2.0 * m[2][0] * m[3][2] - m[0][0] * m[3][3] - 2.0 * m[2][2] * m[3][0]
            + 2.0 * m[0][2] * m[2][3])
            * m[1][1]
        + (-m[0][0] * m[3][3] + 2.0 * m[0][1] * m[1][3] + 2.0 * m[1][0] * m[3][1]) * m[2][2]
        + (-m[0][1] * m[1][3] + 2.0 * m[1][2] * m[2][1] - m[0][2] * m[2][3]) * m[3][0]
        + (m[1][3] * m[3][1] + m[2][3] * m[3][2]) * m[0][0]
        + (m[1][0] * m[3][3] - 2.0 * m[1][2] * m[2][3]) * m[0][1]
        + (m[2][0] * m[3][3] - 2.0 * m[1][3] * m[2][1]) * m[0][2]
        - 2.0 * m[1][2] * m[2][0] * m[3][1]
        - 2.0 * m[1][0] * m[2][1] * m[3][2];
    let a2 = (2.0 * m[1][1] - m[3][0] + 2.0 * m[2][2]) * m[0][3]
        + (2.0 * m[3][0] - 4.0 * m[2][2]) * m[1][1]
        - 2.0 * m[2][0] * m[3][2]
        + 2.0 * m[2][2] * m[3][0]
        + m[0][0] * m[3][3]
        + 4.0 * m[1][2] * m[2][1]
        - 2.0 * m[0][1] * m[1][3]
        - 2.0 * m[1][0] * m[3][1]
        - 2.0 * m[0][2] * m[2][3];
    let a3 = -2.0 * m[3][0] + 4.0 * m[1][1] + 4.0 * m[2][2] - 2.0 * m[0][3];
    let a4 = -4.0;
    [a0, a1, a2, a3, a4]
}

/// Newton iteration from zero, converging on the root of the quartic nearest the origin.
fn smallest_root(a: &[f64; 5]) -> FittingResult<f64> {
    let poly = |x: f64| a[0] + x * (a[1] + x * (a[2] + x * (a[3] + x * a[4])));
    let dpoly = |x: f64| a[1] + x * (2.0 * a[2] + x * (3.0 * a[3] + x * 4.0 * a[4]));

    let mut eta = 0.0_f64;
    for _ in 0..MAX_NEWTON_STEPS {
        let slope = dpoly(eta);
        if slope == 0.0 || !slope.is_finite() {
            break;
        }
        let step = poly(eta) / slope;
        eta -= step;
        if !eta.is_finite() {
            Err(FitError::DegenerateGeometry(
                "quartic root search diverged".to_string(),
            ))?
        }
        if step.abs() <= 1e-14 * (1.0 + eta.abs()) {
            break;
        }
    }
    Ok(eta)
}

/// Stops after four points that differ by more than rounding noise.
fn has_four_distinct_points(z_data: &[Complex64]) -> bool {
    let scale = z_data.iter().map(|z| z.norm()).fold(0.0_f64, f64::max);
    let tolerance = 1e-12 * scale.max(f64::MIN_POSITIVE);
    let mut distinct: Vec<Complex64> = Vec::with_capacity(4);
    for z in z_data {
        if distinct.iter().all(|d| (d - z).norm() > tolerance) {
            distinct.push(*z);
            if distinct.len() == 4 {
                return true;
            }
        }
    }
    false
}

/// Fits a circle to points in the complex plane by minimizing the algebraic distance.
///
/// # Errors
/// Will return `Err(FitError::DegenerateGeometry)` if fewer than four distinct points are given,
/// if the constrained moment matrix has a null space of more than one dimension, or if the
/// resulting circle is not finite (e.g. colinear points).
pub fn fit_circle(z_data: &[Complex64]) -> FittingResult<Circle> {
    if !has_four_distinct_points(z_data) {
        Err(FitError::DegenerateGeometry(format!(
            "need at least 4 distinct points, got {} samples",
            z_data.len()
        )))?
    }
    let mut m = moments(z_data);
    let eta = smallest_root(&characteristic_quartic(&m))?;

    m[3][0] += 2.0 * eta;
    m[0][3] += 2.0 * eta;
    m[1][1] -= eta;
    m[2][2] -= eta;
    let perturbed = Matrix4::from_fn(|i, j| m[i][j]);

    let svd = perturbed.svd(false, true);
    let v_t = svd
        .v_t
        .ok_or_else(|| FitError::DegenerateGeometry("SVD did not converge".to_string()))?;
    let mut order: Vec<usize> = (0..4).collect();
    order.sort_by(|&i, &j| svd.singular_values[i].total_cmp(&svd.singular_values[j]));
    let largest = svd.singular_values[order[3]];
    if svd.singular_values[order[1]] <= 1e-12 * largest {
        Err(FitError::DegenerateGeometry(
            "moment matrix is singular to numerical precision".to_string(),
        ))?
    }

    let params = v_t.row(order[0]);
    let (a, b, c, d) = (params[0], params[1], params[2], params[3]);
    let norm = (a * a + b * b + c * c + d * d).sqrt();
    if a.abs() <= f64::EPSILON * norm {
        Err(FitError::DegenerateGeometry(
            "points are colinear, circle has infinite radius".to_string(),
        ))?
    }
    let xc = -b / (2.0 * a);
    let yc = -c / (2.0 * a);
    // the square root restores the constraint B² + C² - 4AD = 1 lost to rounding
    let r0 = (b * b + c * c - 4.0 * a * d).sqrt() / (2.0 * a.abs());
    if !(xc.is_finite() && yc.is_finite() && r0.is_finite() && r0 > 0.0) {
        Err(FitError::DegenerateGeometry(format!(
            "circle fit produced xc = {xc}, yc = {yc}, r0 = {r0}"
        )))?
    }
    Ok(Circle { xc, yc, r0 })
}

/// Refines an algebraic circle by minimizing the geometric distance, then refits the radius
/// with residuals weighted by the inverse radial distance so dense arcs do not dominate.
///
/// # Errors
/// Will return `Err` if the geometric least-squares problem fails.
pub fn refine_circle(z_data: &[Complex64], circle: Circle) -> FittingResult<Circle> {
    let mut problem = GeometricCircleProblem {
        z_data: z_data.to_vec(),
    };
    let mut params = vec![circle.xc, circle.yc, circle.r0];
    problem
        .mpfit(&mut params)
        .map_err(|e| FitError::BadFit(format!("Error with MPFit: {e}")))?;
    let (xc, yc) = (params[0], params[1]);
    let center = Complex64::new(xc, yc);

    let (mut weighted, mut weights) = (0.0, 0.0);
    for z in z_data {
        let distance = (z - center).norm();
        if distance > 0.0 {
            weighted += 1.0 / distance;
            weights += 1.0 / (distance * distance);
        }
    }
    let r0 = if weights > 0.0 { weighted / weights } else { params[2].abs() };
    tracing::debug!(algebraic = circle.r0, iterative = r0, "refined circle radius");
    Ok(Circle { xc, yc, r0 })
}

/// Geometric circle fit, parameters `[xc, yc, r0]`
struct GeometricCircleProblem {
    z_data: Vec<Complex64>,
}

impl MPFitter for GeometricCircleProblem {
    fn eval(&mut self, params: &[f64], deviates: &mut [f64]) -> MPResult<()> {
        let center = Complex64::new(params[0], params[1]);
        for (dev, z) in deviates.iter_mut().zip(self.z_data.iter()) {
            *dev = (z - center).norm() - params[2];
        }
        Ok(())
    }

    fn number_of_points(&self) -> usize {
        self.z_data.len()
    }

    fn config(&self) -> MPConfig {
        MPConfig {
            ftol: 1e-12,
            xtol: 1e-12,
            max_fev: 1000,
            ..Default::default()
        }
    }

    fn parameters(&self) -> Option<&[MPPar]> {
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;
    use std::f64::consts::PI;

    fn points_on_circle(xc: f64, yc: f64, r0: f64, n: usize, arc: f64) -> Vec<Complex64> {
        (0..n)
            .map(|i| {
                let t = arc * i as f64 / n as f64 + 0.3;
                Complex64::new(xc + r0 * t.cos(), yc + r0 * t.sin())
            })
            .collect()
    }

    #[test]
    fn quartic_matches_constrained_determinant() {
        let z = points_on_circle(0.2, -0.4, 1.3, 9, 4.0);
        let noisy: Vec<Complex64> = z
            .iter()
            .enumerate()
            .map(|(i, p)| p + Complex64::new(0.01 * (i as f64).sin(), 0.02 * (i as f64).cos()))
            .collect();
        let m = moments(&noisy);
        let a = characteristic_quartic(&m);
        for eta in [0.0, 0.5, -1.5] {
            let mut p = m;
            p[3][0] += 2.0 * eta;
            p[0][3] += 2.0 * eta;
            p[1][1] -= eta;
            p[2][2] -= eta;
            let det = Matrix4::from_fn(|i, j| p[i][j]).determinant();
            let poly = a[0] + a[1] * eta + a[2] * eta.powi(2) + a[3] * eta.powi(3) + a[4] * eta.powi(4);
            assert_relative_eq!(det, poly, max_relative = 1e-9);
        }
    }

    #[test]
    fn exact_points_recover_circle() {
        let z = points_on_circle(0.75, -0.25, 0.5, 50, 2.0 * PI);
        let circle = fit_circle(&z).expect("circle fit failed");
        assert_relative_eq!(circle.xc, 0.75, epsilon = 1e-9);
        assert_relative_eq!(circle.yc, -0.25, epsilon = 1e-9);
        assert_relative_eq!(circle.r0, 0.5, epsilon = 1e-9);
    }

    #[test]
    fn partial_arc_recovers_circle() {
        let z = points_on_circle(-3.0, 2.0, 10.0, 4, 1.2);
        let circle = fit_circle(&z).expect("circle fit failed");
        assert_relative_eq!(circle.xc, -3.0, epsilon = 1e-7);
        assert_relative_eq!(circle.yc, 2.0, epsilon = 1e-7);
        assert_relative_eq!(circle.r0, 10.0, epsilon = 1e-7);
    }

    #[test]
    fn too_few_points_is_degenerate() {
        let z = points_on_circle(0.0, 0.0, 1.0, 3, PI);
        assert!(matches!(fit_circle(&z), Err(FitError::DegenerateGeometry(_))));

        let repeated = vec![Complex64::new(1.0, 0.0); 10];
        assert!(matches!(
            fit_circle(&repeated),
            Err(FitError::DegenerateGeometry(_))
        ));
    }

    #[test]
    fn colinear_points_are_degenerate() {
        let z: Vec<Complex64> = (0..10)
            .map(|i| Complex64::new(i as f64, 2.0 * i as f64 - 1.0))
            .collect();
        assert!(matches!(fit_circle(&z), Err(FitError::DegenerateGeometry(_))));
    }

    #[test]
    fn refinement_keeps_exact_circle() {
        let z = points_on_circle(1.0, 1.0, 2.0, 40, 5.0);
        let circle = fit_circle(&z).expect("circle fit failed");
        let refined = refine_circle(&z, circle).expect("refinement failed");
        assert_relative_eq!(refined.xc, 1.0, epsilon = 1e-8);
        assert_relative_eq!(refined.yc, 1.0, epsilon = 1e-8);
        assert_relative_eq!(refined.r0, 2.0, epsilon = 1e-8);
        assert!(refined.residuals(&z).iter().all(|r| r.abs() < 1e-8));
    }
}
