//! Bounded 1-D minimization by Brent's method.
//!
//! The classical bracketed search combining golden-section steps with
//! parabolic interpolation. The function is evaluated on a scalar line
//! parameter; callers project n-dimensional moves onto the line before
//! calling in.

/// Golden-section step fraction, `(3 - sqrt(5)) / 2`.
const GOLDEN: f64 = 0.381_966_011_250_105_1;

/// Absolute floor added to the position tolerance.
const ABSOLUTE_TOLERANCE: f64 = 1e-11;

/// Minimize `f` on `[a, b]`. Returns the best parameter and its value; after
/// `max_iter` iterations the best point found so far is returned without a
/// separate non-convergence signal.
pub fn minimise<E>(
    mut f: impl FnMut(f64) -> Result<f64, E>,
    a: f64,
    b: f64,
    tol: f64,
    max_iter: usize,
) -> Result<(f64, f64), E> {
    let (mut a, mut b) = if a <= b { (a, b) } else { (b, a) };

    let mut x = a + GOLDEN * (b - a);
    let mut w = x;
    let mut v = x;
    let mut fx = f(x)?;
    let mut fw = fx;
    let mut fv = fx;

    // d: latest step; e: step before last, gating parabolic fits.
    let mut d = 0.0f64;
    let mut e = 0.0f64;

    for _ in 0..max_iter {
        let m = 0.5 * (a + b);
        let tol1 = tol * x.abs() + ABSOLUTE_TOLERANCE;
        let tol2 = 2.0 * tol1;

        if (x - m).abs() <= tol2 - 0.5 * (b - a) {
            break;
        }

        let mut use_golden = true;
        if e.abs() > tol1 {
            // Parabola through (v, fv), (w, fw), (x, fx).
            let r = (x - w) * (fx - fv);
            let mut q = (x - v) * (fx - fw);
            let mut p = (x - v) * q - (x - w) * r;
            q = 2.0 * (q - r);
            if q > 0.0 {
                p = -p;
            }
            q = q.abs();
            let e_prev = e;
            e = d;
            if p.abs() < (0.5 * q * e_prev).abs() && p > q * (a - x) && p < q * (b - x) {
                d = p / q;
                let u = x + d;
                if u - a < tol2 || b - u < tol2 {
                    d = if m > x { tol1 } else { -tol1 };
                }
                use_golden = false;
            }
        }
        if use_golden {
            e = if x < m { b - x } else { a - x };
            d = GOLDEN * e;
        }

        let u = if d.abs() >= tol1 {
            x + d
        } else if d > 0.0 {
            x + tol1
        } else {
            x - tol1
        };
        let fu = f(u)?;

        if fu <= fx {
            if u < x {
                b = x;
            } else {
                a = x;
            }
            v = w;
            fv = fw;
            w = x;
            fw = fx;
            x = u;
            fx = fu;
        } else {
            if u < x {
                a = u;
            } else {
                b = u;
            }
            if fu <= fw || w == x {
                v = w;
                fv = fw;
                w = u;
                fw = fu;
            } else if fu <= fv || v == x || v == w {
                v = u;
                fv = fu;
            }
        }
    }

    Ok((x, fx))
}
