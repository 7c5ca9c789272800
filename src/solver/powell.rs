//! Powell's direction-set method over a bounded box.
//!
//! Maintains `n` search directions, initially the coordinate axes. Each outer
//! iteration line-minimizes along every direction, then considers replacing
//! the direction of greatest improvement with the net direction of movement,
//! guarded by the standard extrapolated-step test. Line searches are clipped
//! to the box and screened for corner solutions before Brent runs.
//!
//! After the iteration cap the best point found is returned without a
//! separate non-convergence signal.

use ndarray::Array1;

use super::{line_minimum, Minimum, Objective};

/// Outer-iteration cap.
pub const MAX_ITERATIONS: usize = 200;

pub fn minimise<O: Objective>(
    objective: &O,
    start: &[f64],
    lower: &[f64],
    upper: &[f64],
    tol: f64,
    max_iter: usize,
) -> Result<Minimum, O::Error> {
    let n = start.len();
    let mut directions: Vec<Array1<f64>> = (0..n)
        .map(|i| {
            let mut d = Array1::zeros(n);
            d[i] = 1.0;
            d
        })
        .collect();

    let mut point = start.to_vec();
    let mut f_current = objective.evaluate(&point)?;

    for _ in 0..max_iter {
        let f_start = f_current;
        let point_start = point.clone();
        let mut biggest_drop = 0.0f64;
        let mut biggest_index = 0usize;

        for (i, direction) in directions.iter().enumerate() {
            let slice = direction.as_slice().expect("directions are contiguous");
            if let Some(min) = line_minimum(objective, &point, slice, lower, upper, tol)? {
                if min.value < f_current {
                    let drop = f_current - min.value;
                    if drop > biggest_drop {
                        biggest_drop = drop;
                        biggest_index = i;
                    }
                    point = min.point;
                    f_current = min.value;
                }
            }
        }

        if 2.0 * (f_start - f_current) <= tol * (f_start.abs() + f_current.abs()) + 1e-25 {
            break;
        }

        // Extrapolate the net move and apply Powell's replacement test.
        let extrapolated: Vec<f64> = point
            .iter()
            .zip(&point_start)
            .enumerate()
            .map(|(i, (x, x0))| (2.0 * x - x0).clamp(lower[i], upper[i]))
            .collect();
        let f_extrapolated = objective.evaluate(&extrapolated)?;

        if f_extrapolated < f_start {
            let test = 2.0 * (f_start - 2.0 * f_current + f_extrapolated)
                * (f_start - f_current - biggest_drop).powi(2)
                - biggest_drop * (f_start - f_extrapolated).powi(2);
            if test < 0.0 {
                let new_direction: Array1<f64> = point
                    .iter()
                    .zip(&point_start)
                    .map(|(x, x0)| x - x0)
                    .collect();
                if new_direction.iter().any(|d| d.abs() > 0.0) {
                    let slice = new_direction.as_slice().expect("contiguous");
                    if let Some(min) =
                        line_minimum(objective, &point, slice, lower, upper, tol)?
                    {
                        if min.value < f_current {
                            point = min.point;
                            f_current = min.value;
                        }
                    }
                    directions[biggest_index] = directions[n - 1].clone();
                    directions[n - 1] = new_direction;
                }
            }
        }
    }

    Ok(Minimum {
        point,
        value: f_current,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    struct Quadratic {
        center: Vec<f64>,
    }

    impl Objective for Quadratic {
        type Error = std::convert::Infallible;

        fn evaluate(&self, point: &[f64]) -> Result<f64, Self::Error> {
            Ok(point
                .iter()
                .zip(&self.center)
                .map(|(x, c)| (x - c).powi(2))
                .sum())
        }
    }

    struct Coupled;

    impl Objective for Coupled {
        type Error = std::convert::Infallible;

        fn evaluate(&self, p: &[f64]) -> Result<f64, Self::Error> {
            let (x, y) = (p[0], p[1]);
            Ok((x - 1.0).powi(2) + 2.0 * (y + 0.5).powi(2) + 0.5 * (x - 1.0) * (y + 0.5))
        }
    }

    #[test]
    fn separable_quadratic_reaches_its_center() {
        let objective = Quadratic {
            center: vec![0.2, -0.4, 0.9],
        };
        let min = minimise(
            &objective,
            &[0.0, 0.0, 0.0],
            &[-1.0, -1.0, -1.0],
            &[1.0, 1.0, 1.0],
            1e-10,
            MAX_ITERATIONS,
        )
        .unwrap();
        for (x, c) in min.point.iter().zip(&objective.center) {
            assert_relative_eq!(*x, *c, epsilon = 1e-4);
        }
        assert!(min.value < 1e-7);
    }

    #[test]
    fn cross_terms_are_handled_by_direction_updates() {
        let min = minimise(
            &Coupled,
            &[0.0, 0.0],
            &[-2.0, -2.0],
            &[2.0, 2.0],
            1e-10,
            MAX_ITERATIONS,
        )
        .unwrap();
        assert_relative_eq!(min.point[0], 1.0, epsilon = 1e-4);
        assert_relative_eq!(min.point[1], -0.5, epsilon = 1e-4);
    }

    #[test]
    fn exterior_minimum_lands_on_the_box_corner() {
        let objective = Quadratic {
            center: vec![3.0, -3.0],
        };
        let min = minimise(
            &objective,
            &[0.0, 0.0],
            &[-1.0, -1.0],
            &[1.0, 1.0],
            1e-10,
            MAX_ITERATIONS,
        )
        .unwrap();
        assert_relative_eq!(min.point[0], 1.0, epsilon = 1e-6);
        assert_relative_eq!(min.point[1], -1.0, epsilon = 1e-6);
    }
}
