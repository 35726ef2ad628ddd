use ndarray::{Array, Array1, Array2};
use ndarray_linalg::{Lapack, LeastSquaresSvd, Scalar};
use num_traits::Float;
use serde::Serialize;

use crate::error::Error;
use crate::Result;

/// Generate the Vandermonde matrix of `degree` for observations `x`
///
/// The Vandermonde matrix is a (n x degree + 1) matrix. Each row of the matrix is a geometric
/// progression for an individual observation variable `x` from power `0` to `degree` inclusive.
///
/// # Errors
/// Returns an error if `degree` does not fit in an `i32`.
///
/// # Examples
///
/// ```
/// use icp_calibration::math::vandermonde;
/// use ndarray::arr2;
///
/// let observations: Vec<f64> = vec![2., 3.];
/// let vander = vandermonde(&observations, 2).unwrap();
///
/// let expected = arr2(&[[1., 2., 4.], [1., 3., 9.]]);
/// assert_eq!(vander, expected);
/// ```
pub fn vandermonde<T: Copy + Scalar>(x: &[T], degree: usize) -> Result<Array2<T>> {
    let max_power = i32::try_from(degree)
        .map_err(|_| Error::Validation(format!("degree {degree} doesn't fit in `i32`")))?;
    let vals = x
        .iter()
        .flat_map(|xi| (0..=max_power).map(move |power| xi.powi(power)));

    Ok(Array::from_iter(vals).into_shape((x.len(), degree + 1))?)
}

/// A polynomial in increasing powers of `x`
#[derive(Clone, Debug, PartialEq)]
pub struct Polynomial<E> {
    coefficients: Array1<E>,
}

impl<E: Scalar> Polynomial<E> {
    pub const fn coefficients(&self) -> &Array1<E> {
        &self.coefficients
    }

    /// Evaluate with Horner's scheme
    pub fn evaluate(&self, x: E) -> E {
        self.coefficients
            .iter()
            .rev()
            .fold(E::zero(), |acc, &c| acc * x + c)
    }
}

/// Least-squares polynomial fit of `degree` through the points `(x, y)`
///
/// # Errors
/// Returns an error if `x` and `y` differ in length, if there are fewer points than
/// coefficients, or if the underlying solve fails.
pub fn polyfit<E: Scalar + Lapack>(x: &[E], y: &[E], degree: usize) -> Result<Polynomial<E>> {
    if x.len() != y.len() {
        return Err(Error::Validation(format!(
            "polyfit needs matching inputs, got {} x and {} y",
            x.len(),
            y.len()
        )));
    }
    if x.len() <= degree {
        return Err(Error::Validation(format!(
            "a degree {degree} fit needs more than {degree} points, got {}",
            x.len()
        )));
    }
    let design = vandermonde(x, degree)?;
    let rhs = Array1::from_iter(y.iter().copied());
    let result = design.least_squares(&rhs)?;
    Ok(Polynomial {
        coefficients: result.solution,
    })
}

/// An ordinary least-squares line
#[derive(Clone, Copy, Debug, PartialEq, Serialize)]
pub struct LinearFit {
    pub slope: f64,
    pub intercept: f64,
}

impl LinearFit {
    pub fn at(&self, x: f64) -> f64 {
        self.slope.mul_add(x, self.intercept)
    }
}

/// Closed-form least-squares line through `(x, y)`
///
/// Returns `None` with fewer than two points or when every `x` is identical.
pub fn linear_fit(x: &[f64], y: &[f64]) -> Option<LinearFit> {
    if x.len() != y.len() || x.len() < 2 {
        return None;
    }
    let x_mean = mean(x)?;
    let y_mean = mean(y)?;
    let (sxy, sxx) = x
        .iter()
        .zip(y)
        .fold((0., 0.), |(sxy, sxx), (xi, yi)| {
            let dx = xi - x_mean;
            (dx.mul_add(yi - y_mean, sxy), dx.mul_add(dx, sxx))
        });
    if sxx == 0. {
        return None;
    }
    let slope = sxy / sxx;
    Some(LinearFit {
        slope,
        intercept: slope.mul_add(-x_mean, y_mean),
    })
}

pub fn mean<E: Float>(values: &[E]) -> Option<E> {
    if values.is_empty() {
        return None;
    }
    let sum = values.iter().fold(E::zero(), |acc, &v| acc + v);
    Some(sum / E::from(values.len())?)
}

/// Round half away from zero to `decimals` places
pub fn round_to(value: f64, decimals: u32) -> f64 {
    let scale = 10f64.powi(i32::try_from(decimals).unwrap_or(i32::MAX).min(15));
    (value * scale).round() / scale
}

#[cfg(test)]
mod tests {
    use crate::Result;

    use super::{linear_fit, mean, polyfit, round_to, vandermonde};

    use itertools::Itertools;
    use ndarray_linalg::Determinant;
    use ndarray_rand::rand::{Rng, SeedableRng};
    use rand_isaac::isaac64::Isaac64Rng;

    #[test]
    fn vandermonde_matrices_are_generated_correctly() {
        let seed = 40;
        let mut rng = Isaac64Rng::seed_from_u64(seed);
        let num_data_points = 10;
        let degree = 5;

        let data_points = (0..num_data_points)
            .map(|_| rng.gen())
            .collect::<Vec<f64>>();

        let vandermonde = vandermonde(&data_points, degree).unwrap();

        for (ii, data_point) in data_points.iter().enumerate() {
            for jj in 0..=degree {
                let expected = data_point.powi(i32::try_from(jj).unwrap());
                let actual = vandermonde[[ii, jj]];
                approx::assert_relative_eq!(expected, actual);
            }
        }
    }

    #[test]
    fn determinant_of_square_vandermonde_matrix_equals_product_of_differences() -> Result<()> {
        let dim = 5;
        let seed = 40;
        let mut rng = Isaac64Rng::seed_from_u64(seed);
        let data_points = (0..dim).map(|_| rng.gen()).collect::<Vec<f64>>();

        let vandermonde = vandermonde(&data_points, dim - 1).unwrap();
        let determinant = vandermonde.det()?;

        let product_of_differences: f64 = data_points
            .iter()
            .combinations(2)
            .map(|vals| vals[1] - vals[0])
            .product();

        approx::assert_relative_eq!(determinant, product_of_differences, max_relative = 1e-8);
        Ok(())
    }

    #[test]
    fn quadratic_fit_recovers_exact_coefficients() -> Result<()> {
        let seed = 40;
        let mut rng = Isaac64Rng::seed_from_u64(seed);
        let coeffs: [f64; 3] = [rng.gen_range(1.0..10.0), rng.gen(), rng.gen()];

        let x = (0..30).map(f64::from).collect::<Vec<_>>();
        let y = x
            .iter()
            .map(|x| coeffs[2].mul_add(x * x, coeffs[1].mul_add(*x, coeffs[0])))
            .collect::<Vec<_>>();

        let fit = polyfit(&x, &y, 2)?;

        for (expected, calculated) in coeffs.iter().zip(fit.coefficients()) {
            approx::assert_relative_eq!(expected, calculated, max_relative = 1e-6);
        }
        approx::assert_relative_eq!(fit.evaluate(7.), y[7], max_relative = 1e-8);
        Ok(())
    }

    #[test]
    fn polyfit_rejects_underdetermined_input() {
        assert!(polyfit(&[0., 1.], &[1., 2.], 2).is_err());
        assert!(polyfit(&[0., 1., 2.], &[1., 2.], 1).is_err());
    }

    #[test]
    fn line_fit_matches_known_values() {
        let fit = linear_fit(&[0., 1., 2., 3.], &[1., 3., 5., 7.]).unwrap();
        approx::assert_relative_eq!(fit.slope, 2.);
        approx::assert_relative_eq!(fit.intercept, 1.);
        assert!(linear_fit(&[1., 1.], &[2., 3.]).is_none());
        assert!(linear_fit(&[1.], &[2.]).is_none());
    }

    #[test]
    fn helpers_handle_edge_cases() {
        assert_eq!(mean::<f64>(&[]), None);
        approx::assert_relative_eq!(mean(&[1., 2., 6.]).unwrap(), 3.);
        approx::assert_relative_eq!(round_to(12.3456, 2), 12.35);
        approx::assert_relative_eq!(round_to(-0.125, 1), -0.1);
    }
}
