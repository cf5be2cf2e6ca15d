/// Sums and results of a weighted straight-line fit `y = intercept + slope * x`.
#[derive(Default, Debug, Clone, Copy)]
pub struct LeastSquaresValues {
    pub sum: f64,
    pub sum_x: f64,
    pub sum_y: f64,
    pub sum_xx: f64,
    pub sum_xy: f64,
    pub delta: f64,
    pub intercept: f64,
    pub slope: f64,
    pub chi_squared: f64,
}

pub struct LeastSquares;

impl LeastSquares {
    /// Weighted linear regression. Points with zero sigma are ignored.
    pub fn two_parameter_line_fit(x_vals: &[f64], y_vals: &[f64], sigmas: &[f64]) -> LeastSquaresValues {
        let mut lsq: LeastSquaresValues = Default::default();
        Self::find_sums(&mut lsq, x_vals, y_vals, sigmas);

        lsq.delta = lsq.sum * lsq.sum_xx - lsq.sum_x * lsq.sum_x;
        lsq.intercept = (lsq.sum_xx * lsq.sum_y - lsq.sum_x * lsq.sum_xy) / lsq.delta;
        lsq.slope = (lsq.sum * lsq.sum_xy - lsq.sum_x * lsq.sum_y) / lsq.delta;

        Self::calculate_chi_2(&mut lsq, x_vals, y_vals, sigmas);
        lsq
    }

    /// Unweighted linear regression.
    pub fn line_fit(x_vals: &[f64], y_vals: &[f64]) -> LeastSquaresValues {
        Self::two_parameter_line_fit(x_vals, y_vals, &vec![1.0; x_vals.len()])
    }

    fn nonzero_sigma(sigmas: &[f64]) -> impl Iterator<Item = usize> + '_ {
        sigmas
            .iter()
            .enumerate()
            .filter(|(_, s)| **s != 0.0)
            .map(|(i, _)| i)
    }

    fn find_sums(lsq: &mut LeastSquaresValues, x_vals: &[f64], y_vals: &[f64], sigmas: &[f64]) {
        for i in Self::nonzero_sigma(sigmas) {
            let sigma_squared = sigmas[i] * sigmas[i];
            lsq.sum += 1.0 / sigma_squared;
            lsq.sum_x += x_vals[i] / sigma_squared;
            lsq.sum_y += y_vals[i] / sigma_squared;
            lsq.sum_xx += x_vals[i] * x_vals[i] / sigma_squared;
            lsq.sum_xy += x_vals[i] * y_vals[i] / sigma_squared;
        }
    }

    fn calculate_chi_2(lsq: &mut LeastSquaresValues, x_vals: &[f64], y_vals: &[f64], sigmas: &[f64]) {
        lsq.chi_squared = Self::nonzero_sigma(sigmas)
            .map(|i| ((y_vals[i] - lsq.intercept) - (lsq.slope * x_vals[i])) / sigmas[i])
            .map(|chi| chi * chi)
            .sum();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    #[test]
    fn recovers_exact_line() {
        let x: Vec<f64> = (0..20).map(|i| i as f64 * 0.5).collect();
        let y: Vec<f64> = x.iter().map(|x| 3.0 - 2.0 * x).collect();
        let lsq = LeastSquares::line_fit(&x, &y);
        assert_relative_eq!(lsq.slope, -2.0, epsilon = 1e-12);
        assert_relative_eq!(lsq.intercept, 3.0, epsilon = 1e-12);
        assert!(lsq.chi_squared < 1e-20);
    }

    #[test]
    fn zero_sigma_points_are_skipped() {
        let x = [0.0, 1.0, 2.0, 3.0];
        let y = [0.0, 1.0, 100.0, 3.0];
        let lsq = LeastSquares::two_parameter_line_fit(&x, &y, &[1.0, 1.0, 0.0, 1.0]);
        assert_relative_eq!(lsq.slope, 1.0, epsilon = 1e-12);
        assert_relative_eq!(lsq.intercept, 0.0, epsilon = 1e-12);
    }
}
