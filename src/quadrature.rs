//! Gauss-Hermite quadrature for expectations of normally distributed shocks.
//!
//! The regression layer reports Gaussian transitions as a linear score plus an
//! RMSE; the expectation over that shock is approximated by an n-point
//! Gauss-Hermite rule. Nodes and weights come from the Golub-Welsch algorithm:
//! the eigenvalues of the symmetric tridiagonal Jacobi matrix of the Hermite
//! recurrence are the nodes, and the weights derive from the first component
//! of each eigenvector.
//!
//! The rule is stored pre-transformed for standard-normal expectations:
//! `E[f(Z)] ≈ Σ w_i f(x_i)` with `Σ w_i = 1`, so callers shift and scale by
//! the score mean and RMSE without touching the physicists' `exp(-x²)` weight.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum QuadratureError {
    #[error("Gauss-Hermite rule needs at least 2 points, but {0} were requested.")]
    TooFewPoints(usize),
}

/// An n-point Gauss-Hermite rule normalized for the standard normal measure.
#[derive(Debug, Clone)]
pub struct GaussHermite {
    nodes: Vec<f64>,
    weights: Vec<f64>,
}

impl GaussHermite {
    pub fn new(n: usize) -> Result<Self, QuadratureError> {
        if n < 2 {
            return Err(QuadratureError::TooFewPoints(n));
        }

        // Jacobi matrix for physicists' Hermite polynomials: zero diagonal,
        // off-diagonal sqrt((i+1)/2).
        let mut diag = vec![0.0f64; n];
        let mut off_diag: Vec<f64> = (0..n - 1).map(|i| ((i + 1) as f64 / 2.0).sqrt()).collect();

        let first_components = symmetric_tridiagonal_eigen(&mut diag, &mut off_diag);

        // Raw weights are mu0 * q0^2 with mu0 = sqrt(pi); dropping mu0
        // directly yields the standard-normal normalization, and the nodes are
        // rescaled by sqrt(2) to move from exp(-x^2) to the N(0,1) density.
        let mut order: Vec<usize> = (0..n).collect();
        order.sort_by(|&a, &b| diag[a].total_cmp(&diag[b]));

        let nodes: Vec<f64> = order
            .iter()
            .map(|&i| std::f64::consts::SQRT_2 * diag[i])
            .collect();
        let weights: Vec<f64> = order
            .iter()
            .map(|&i| first_components[i] * first_components[i])
            .collect();

        Ok(Self { nodes, weights })
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    pub fn nodes(&self) -> &[f64] {
        &self.nodes
    }

    pub fn weights(&self) -> &[f64] {
        &self.weights
    }

    /// Value-probability pairs for a shock with the given mean and standard
    /// deviation, in ascending value order.
    pub fn points(&self, mean: f64, sd: f64) -> Vec<(f64, f64)> {
        self.nodes
            .iter()
            .zip(&self.weights)
            .map(|(&x, &w)| (mean + sd * x, w))
            .collect()
    }
}

/// Implicit symmetric tridiagonal QR with Wilkinson shifts.
///
/// Mutates `diag` into the eigenvalues and returns the first component of each
/// eigenvector (all that the quadrature weights need).
fn symmetric_tridiagonal_eigen(diag: &mut [f64], off_diag: &mut [f64]) -> Vec<f64> {
    let size = diag.len();
    let mut first = vec![0.0f64; size];
    first[0] = 1.0;

    // Only the first column of the accumulated rotation product is tracked;
    // it is all the weights need, and it keeps each rotation O(1).
    let eps = 1e-15;
    let max_iter = 100;

    let mut n = size;
    while n > 1 {
        let mut converged = false;
        for _ in 0..max_iter {
            let mut m = n - 1;
            while m > 0 {
                if off_diag[m - 1].abs() <= eps * (diag[m - 1].abs() + diag[m].abs()) {
                    off_diag[m - 1] = 0.0;
                    break;
                }
                m -= 1;
            }

            if m == n - 1 {
                n -= 1;
                converged = true;
                break;
            }

            let shift = wilkinson_shift(diag[n - 2], diag[n - 1], off_diag[n - 2]);

            let mut x = diag[m] - shift;
            let mut y = off_diag[m];

            for k in m..(n - 1) {
                let (c, s) = if y.abs() > eps {
                    let r = x.hypot(y);
                    if r > 0.0 && r.is_finite() {
                        (x / r, -y / r)
                    } else {
                        (1.0, 0.0)
                    }
                } else {
                    (1.0, 0.0)
                };

                if k > m {
                    off_diag[k - 1] = x.hypot(y);
                }

                let d1 = diag[k];
                let d2 = diag[k + 1];
                let e_k = off_diag[k];

                diag[k] = c * c * d1 + s * s * d2 - 2.0 * c * s * e_k;
                diag[k + 1] = s * s * d1 + c * c * d2 + 2.0 * c * s * e_k;
                off_diag[k] = c * s * (d1 - d2) + (c * c - s * s) * e_k;

                if k < n - 2 {
                    x = off_diag[k];
                    y = -s * off_diag[k + 1];
                    off_diag[k + 1] *= c;
                }

                let t = first[k];
                first[k] = c * t - s * first[k + 1];
                first[k + 1] = s * t + c * first[k + 1];
            }
        }
        if !converged {
            // Force trailing deflation; for the small Jacobi matrices used
            // here non-convergence within max_iter is essentially impossible,
            // and this avoids an unbounded loop.
            off_diag[n - 2] = 0.0;
            n -= 1;
        }
    }

    first
}

#[inline]
fn wilkinson_shift(a: f64, c: f64, b: f64) -> f64 {
    let d = (a - c) * 0.5;
    let t = d.hypot(b);
    let sgn = if d >= 0.0 { 1.0 } else { -1.0 }; // sign(0)=+1
    let denom = d + sgn * t;

    if denom.abs() > f64::EPSILON * t.max(1.0) {
        c - (b * b) / denom
    } else {
        c - t
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    #[test]
    fn weights_sum_to_one() {
        for n in [2, 3, 5, 7, 9, 15] {
            let rule = GaussHermite::new(n).unwrap();
            let sum: f64 = rule.weights().iter().sum();
            assert_relative_eq!(sum, 1.0, epsilon = 1e-10);
        }
    }

    #[test]
    fn nodes_are_symmetric_and_sorted() {
        let rule = GaussHermite::new(7).unwrap();
        let nodes = rule.nodes();
        for i in 0..nodes.len() / 2 {
            let j = nodes.len() - 1 - i;
            assert_relative_eq!(nodes[i], -nodes[j], epsilon = 1e-10);
        }
        for w in nodes.windows(2) {
            assert!(w[0] < w[1]);
        }
    }

    #[test]
    fn first_two_standard_normal_moments_are_reproduced() {
        for n in [3, 5, 9] {
            let rule = GaussHermite::new(n).unwrap();
            let mean: f64 = rule
                .nodes()
                .iter()
                .zip(rule.weights())
                .map(|(x, w)| x * w)
                .sum();
            let var: f64 = rule
                .nodes()
                .iter()
                .zip(rule.weights())
                .map(|(x, w)| x * x * w)
                .sum();
            assert_relative_eq!(mean, 0.0, epsilon = 1e-10);
            assert_relative_eq!(var, 1.0, epsilon = 1e-10);
        }
    }

    #[test]
    fn seven_point_rule_matches_known_constants() {
        // Physicists' nodes t_i and weights v_i; stored as sqrt(2) t_i and
        // v_i / sqrt(pi).
        let known_nodes = [
            -2.651_961_356_835_233_4,
            -1.673_551_628_767_471_4,
            -0.816_287_882_858_964_7,
            0.0,
            0.816_287_882_858_964_7,
            1.673_551_628_767_471_4,
            2.651_961_356_835_233_4,
        ];
        let known_weights = [
            0.000_971_781_245_099_519_1,
            0.054_515_582_819_127_03,
            0.425_607_252_610_127_8,
            0.810_264_617_556_807_3,
            0.425_607_252_610_127_8,
            0.054_515_582_819_127_03,
            0.000_971_781_245_099_519_1,
        ];

        let rule = GaussHermite::new(7).unwrap();
        let sqrt_pi = std::f64::consts::PI.sqrt();
        for i in 0..7 {
            assert_relative_eq!(
                rule.nodes()[i],
                std::f64::consts::SQRT_2 * known_nodes[i],
                epsilon = 1e-10
            );
            assert_relative_eq!(rule.weights()[i], known_weights[i] / sqrt_pi, epsilon = 1e-10);
        }
    }

    #[test]
    fn points_shift_and_scale() {
        let rule = GaussHermite::new(5).unwrap();
        let points = rule.points(3.0, 2.0);
        let mean: f64 = points.iter().map(|(v, p)| v * p).sum();
        let var: f64 = points.iter().map(|(v, p)| (v - 3.0).powi(2) * p).sum();
        assert_relative_eq!(mean, 3.0, epsilon = 1e-9);
        assert_relative_eq!(var, 4.0, epsilon = 1e-9);
    }

    #[test]
    fn single_point_rule_is_rejected() {
        assert!(GaussHermite::new(1).is_err());
    }
}
