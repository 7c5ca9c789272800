//! Bounded derivative-free minimization.
//!
//! The entry point is [`Minimiser`]: given an objective and a feasible box it
//! dispatches on the number of free dimensions. A fully pinned box is a
//! single evaluation, one free dimension goes straight to the corner-screened
//! Brent line search, and anything larger runs Powell's direction-set method.
//!
//! The objective seam is the [`Objective`] trait; the utility evaluation
//! implements it with its own error type, which flows through every solver
//! routine unchanged.

pub mod boundary;
pub mod brent;
pub mod powell;

/// A function to minimize over a box.
pub trait Objective {
    type Error;

    fn evaluate(&self, point: &[f64]) -> Result<f64, Self::Error>;
}

/// The best point found and its objective value.
#[derive(Debug, Clone, PartialEq)]
pub struct Minimum {
    pub point: Vec<f64>,
    pub value: f64,
}

/// Relative improvement tolerance, `sqrt` of the machine epsilon.
fn convergence_tolerance() -> f64 {
    f64::EPSILON.sqrt()
}

/// Box widths below this (scaled) threshold pin the dimension.
const WIDTH_TOLERANCE: f64 = 1e-12;

/// Bounded minimization of one objective over `[lower, upper]`.
pub struct Minimiser<'a, O: Objective> {
    objective: &'a O,
    lower: Vec<f64>,
    upper: Vec<f64>,
}

impl<'a, O: Objective> Minimiser<'a, O> {
    pub fn new(objective: &'a O, lower: Vec<f64>, upper: Vec<f64>) -> Self {
        debug_assert_eq!(lower.len(), upper.len());
        debug_assert!(lower.iter().zip(&upper).all(|(l, u)| l <= u));
        Self {
            objective,
            lower,
            upper,
        }
    }

    pub fn minimise(&self, start: &[f64]) -> Result<Minimum, O::Error> {
        let n = self.lower.len();
        let tol = convergence_tolerance();
        let point: Vec<f64> = start
            .iter()
            .enumerate()
            .map(|(i, &x)| x.clamp(self.lower[i], self.upper[i]))
            .collect();

        let free: Vec<usize> = (0..n)
            .filter(|&i| {
                let scale = 1.0 + self.lower[i].abs().max(self.upper[i].abs());
                self.upper[i] - self.lower[i] > WIDTH_TOLERANCE * scale
            })
            .collect();

        if free.is_empty() {
            let value = self.objective.evaluate(&point)?;
            return Ok(Minimum { point, value });
        }

        if free.len() == 1 {
            let mut direction = vec![0.0; n];
            direction[free[0]] = 1.0;
            if let Some(min) =
                line_minimum(self.objective, &point, &direction, &self.lower, &self.upper, tol)?
            {
                return Ok(min);
            }
            let value = self.objective.evaluate(&point)?;
            return Ok(Minimum { point, value });
        }

        powell::minimise(
            self.objective,
            &point,
            &self.lower,
            &self.upper,
            tol,
            powell::MAX_ITERATIONS,
        )
    }
}

/// One bounded line search: clip the line to the box, screen the interval
/// ends for a corner solution, and only then hand the bracket to Brent.
/// Returns `None` when the clipped interval is empty or degenerate.
pub(crate) fn line_minimum<O: Objective>(
    objective: &O,
    point: &[f64],
    direction: &[f64],
    lower: &[f64],
    upper: &[f64],
    tol: f64,
) -> Result<Option<Minimum>, O::Error> {
    let Some((t_lo, t_hi)) = boundary::clip_line(point, direction, lower, upper) else {
        return Ok(None);
    };
    if t_hi - t_lo <= WIDTH_TOLERANCE {
        return Ok(None);
    }

    let point_at = |t: f64| -> Vec<f64> {
        point
            .iter()
            .zip(direction)
            .enumerate()
            .map(|(i, (x, d))| (x + t * d).clamp(lower[i], upper[i]))
            .collect()
    };
    let mut eval_at = |t: f64| objective.evaluate(&point_at(t));

    match boundary::screen_corners(&mut eval_at, t_lo, t_hi)? {
        boundary::CornerScreen::Corner { t, value } => Ok(Some(Minimum {
            point: point_at(t),
            value,
        })),
        boundary::CornerScreen::Interior {
            t_left, t_right, ..
        } => {
            let (t, value) = brent::minimise(&mut eval_at, t_left, t_right, tol, 100)?;
            Ok(Some(Minimum {
                point: point_at(t),
                value,
            }))
        }
    }
}
