/// One-dimensional maximizers used by the branch and rate optimizers
///
/// All routines maximize and take fallible objectives, so a likelihood
/// evaluation error aborts the search instead of being mistaken for a value.

use tracing::trace;

use crate::error::{PhyloError, Result};

/// Outcome of a bounded search
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Optimum {
    pub x: f64,
    pub value: f64,
    pub evaluations: usize,
}

/// Safeguarded Newton-Raphson on `[lower, upper]`
///
/// `f` returns (value, first derivative, second derivative). A Newton step is
/// taken when the curvature is negative and the step stays inside the current
/// bracket; otherwise the bracket is bisected on the side the gradient points
/// to. The best point seen is returned, so the result never scores below
/// the start.
pub fn newton_raphson<F>(
    mut f: F,
    x0: f64,
    lower: f64,
    upper: f64,
    tolerance: f64,
    max_steps: usize,
) -> Result<Optimum>
where
    F: FnMut(f64) -> Result<(f64, f64, f64)>,
{
    if !(lower < upper) {
        return Err(PhyloError::invalid("bounds", format!("empty interval [{lower}, {upper}]")));
    }
    let mut lo = lower;
    let mut hi = upper;
    let mut x = x0.clamp(lower, upper);
    let (mut value, mut df, mut ddf) = f(x)?;
    let mut best = Optimum {
        x,
        value,
        evaluations: 1,
    };

    for step in 0..max_steps {
        if df == 0.0 || !df.is_finite() {
            break;
        }
        if df > 0.0 {
            lo = x;
        } else {
            hi = x;
        }
        if hi - lo < tolerance {
            break;
        }

        let newton = if ddf < 0.0 { x - df / ddf } else { f64::NAN };
        let next = if newton.is_finite() && newton >= lo && newton <= hi {
            newton
        } else {
            0.5 * (lo + hi)
        };
        let moved = (next - x).abs();

        x = next;
        (value, df, ddf) = f(x)?;
        best.evaluations += 1;
        trace!(step, x, value, df, ddf, "newton step");
        if value > best.value {
            best.x = x;
            best.value = value;
        }
        if moved < tolerance {
            break;
        }
    }
    Ok(best)
}

const GOLDEN: f64 = 0.381_966_011_250_105_1;

/// Brent's parabolic-interpolation maximizer on `[lower, upper]` starting at `guess`
pub fn brent_maximize<F>(
    mut f: F,
    lower: f64,
    guess: f64,
    upper: f64,
    tolerance: f64,
    max_iterations: usize,
) -> Result<Optimum>
where
    F: FnMut(f64) -> Result<f64>,
{
    if !(lower < upper) {
        return Err(PhyloError::invalid("bounds", format!("empty interval [{lower}, {upper}]")));
    }
    // Minimize g = -f
    let (mut a, mut b) = (lower, upper);
    let mut x = guess.clamp(lower, upper);
    let mut w = x;
    let mut v = x;
    let mut fx = -f(x)?;
    let mut fw = fx;
    let mut fv = fx;
    let mut d: f64 = 0.0;
    let mut e: f64 = 0.0;
    let mut evaluations = 1;

    for _ in 0..max_iterations {
        let xm = 0.5 * (a + b);
        let tol1 = tolerance * x.abs() + 1e-10;
        let tol2 = 2.0 * tol1;
        if (x - xm).abs() <= tol2 - 0.5 * (b - a) {
            break;
        }

        let mut golden = true;
        if e.abs() > tol1 {
            let r = (x - w) * (fx - fv);
            let mut q = (x - v) * (fx - fw);
            let mut p = (x - v) * q - (x - w) * r;
            q = 2.0 * (q - r);
            if q > 0.0 {
                p = -p;
            }
            q = q.abs();
            let e_prev = e;
            if p.abs() < (0.5 * q * e_prev).abs() && p > q * (a - x) && p < q * (b - x) {
                e = d;
                d = p / q;
                let u = x + d;
                if u - a < tol2 || b - u < tol2 {
                    d = tol1.copysign(xm - x);
                }
                golden = false;
            }
        }
        if golden {
            e = if x >= xm { a - x } else { b - x };
            d = GOLDEN * e;
        }

        let u = if d.abs() >= tol1 { x + d } else { x + tol1.copysign(d) };
        let fu = -f(u)?;
        evaluations += 1;

        if fu <= fx {
            if u >= x {
                a = x;
            } else {
                b = x;
            }
            (v, fv) = (w, fw);
            (w, fw) = (x, fx);
            (x, fx) = (u, fu);
        } else {
            if u < x {
                a = u;
            } else {
                b = u;
            }
            if fu <= fw || w == x {
                (v, fv) = (w, fw);
                (w, fw) = (u, fu);
            } else if fu <= fv || v == x || v == w {
                (v, fv) = (u, fu);
            }
        }
    }

    Ok(Optimum {
        x,
        value: -fx,
        evaluations,
    })
}

/// Cyclic coordinate ascent with Brent line searches in log space
///
/// Bounds must be positive. Stops when a full cycle gains less than
/// `tolerance` or after `max_cycles`. `x` holds the best point on return.
pub fn coordinate_maximize<F>(
    mut f: F,
    x: &mut [f64],
    lower: &[f64],
    upper: &[f64],
    tolerance: f64,
    max_cycles: usize,
) -> Result<f64>
where
    F: FnMut(&[f64]) -> Result<f64>,
{
    if lower.len() != x.len() || upper.len() != x.len() {
        return Err(PhyloError::invalid("bounds", "one bound per coordinate is required"));
    }
    if lower.iter().zip(upper).any(|(&lo, &hi)| !(lo > 0.0 && lo < hi)) {
        return Err(PhyloError::invalid("bounds", "coordinate bounds must satisfy 0 < lower < upper"));
    }
    for (k, v) in x.iter_mut().enumerate() {
        *v = v.clamp(lower[k], upper[k]);
    }
    let mut best = f(x)?;
    if x.is_empty() {
        return Ok(best);
    }

    let mut trial = x.to_vec();
    for cycle in 0..max_cycles {
        let start = best;
        for k in 0..x.len() {
            trial.copy_from_slice(x);
            let opt = brent_maximize(
                |log_v| {
                    trial[k] = log_v.exp();
                    f(&trial)
                },
                lower[k].ln(),
                x[k].ln(),
                upper[k].ln(),
                1e-4,
                100,
            )?;
            if opt.value > best {
                best = opt.value;
                x[k] = opt.x.exp();
            }
        }
        trace!(cycle, best, "coordinate cycle");
        if best - start < tolerance {
            break;
        }
    }
    Ok(best)
}
