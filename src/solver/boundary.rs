//! Clipping a search line to the feasible box.
//!
//! Powell's line searches move along arbitrary directions from an interior
//! point; before the 1-D search runs, the line must be cut down to the
//! parameter interval that stays inside the bounds. Axes are walked from the
//! steepest direction component to the shallowest so the interval tightens
//! fastest and degenerate components are handled last.

use crate::ranking::rank_descending;

/// Direction components smaller than this are treated as zero.
const DIRECTION_EPSILON: f64 = 1e-14;

/// Slack allowed when the start point sits numerically on a boundary.
const BOUNDARY_SLACK: f64 = 1e-9;

/// The parameter interval `[t_lo, t_hi]` for which `start + t * direction`
/// stays inside `[lower, upper]`, or `None` when the line misses the box or
/// the start point lies outside it.
///
/// The interval always contains 0 when the start point is feasible, so both
/// forward and backward movement along the direction are available to the
/// line search.
pub fn clip_line(
    start: &[f64],
    direction: &[f64],
    lower: &[f64],
    upper: &[f64],
) -> Option<(f64, f64)> {
    debug_assert_eq!(start.len(), direction.len());
    debug_assert_eq!(start.len(), lower.len());
    debug_assert_eq!(start.len(), upper.len());

    let steepness: Vec<f64> = direction.iter().map(|d| d.abs()).collect();
    let mut t_lo = f64::NEG_INFINITY;
    let mut t_hi = f64::INFINITY;

    for axis in rank_descending(&steepness) {
        let x = start[axis];
        let d = direction[axis];
        let slack = BOUNDARY_SLACK * (1.0 + lower[axis].abs().max(upper[axis].abs()));

        if d.abs() <= DIRECTION_EPSILON {
            // The line does not move along this axis; the start must already
            // be feasible here.
            if x < lower[axis] - slack || x > upper[axis] + slack {
                return None;
            }
            continue;
        }

        let t1 = (lower[axis] - x) / d;
        let t2 = (upper[axis] - x) / d;
        let (near, far) = if t1 <= t2 { (t1, t2) } else { (t2, t1) };
        t_lo = t_lo.max(near);
        t_hi = t_hi.min(far);
        if t_lo > t_hi {
            return None;
        }
    }

    if !t_lo.is_finite() || !t_hi.is_finite() {
        // Every component was degenerate; there is no line to search.
        return None;
    }

    // A feasible start lies within the interval up to rounding; anchor it so
    // t = 0 is always admissible for the caller.
    Some((t_lo.min(0.0), t_hi.max(0.0)))
}

/// Outcome of the coarse corner screen that runs before a full Brent search.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum CornerScreen {
    /// An interval endpoint is no worse than every probe; take it directly.
    Corner { t: f64, value: f64 },
    /// The minimum is interior; bracket around the best probe.
    Interior { t_left: f64, t_best: f64, t_right: f64, value: f64 },
}

/// Number of interior probe points used by the corner screen.
const PROBE_POINTS: usize = 5;

/// Probe the interval coarsely and decide whether either endpoint can be
/// accepted without a full 1-D minimization.
pub fn screen_corners<E>(
    mut f: impl FnMut(f64) -> Result<f64, E>,
    t_lo: f64,
    t_hi: f64,
) -> Result<CornerScreen, E> {
    let span = t_hi - t_lo;
    let mut ts = Vec::with_capacity(PROBE_POINTS + 2);
    ts.push(t_lo);
    for i in 1..=PROBE_POINTS {
        ts.push(t_lo + span * i as f64 / (PROBE_POINTS + 1) as f64);
    }
    ts.push(t_hi);

    let mut best = 0;
    let mut values = Vec::with_capacity(ts.len());
    for (i, &t) in ts.iter().enumerate() {
        let v = f(t)?;
        if v < values.get(best).copied().unwrap_or(f64::INFINITY) {
            best = i;
        }
        values.push(v);
    }

    if best == 0 || best == ts.len() - 1 {
        return Ok(CornerScreen::Corner {
            t: ts[best],
            value: values[best],
        });
    }
    Ok(CornerScreen::Interior {
        t_left: ts[best - 1],
        t_best: ts[best],
        t_right: ts[best + 1],
        value: values[best],
    })
}
