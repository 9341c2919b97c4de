//! Scalar solvers behind `optimize` rules
//!
//! - [`brent_root`] - root of a function on a sign-changing bracket
//! - [`minimize`] - local minimum near a starting guess, by downhill
//!   bracketing followed by Brent's parabolic search
//!
//! The objective is fallible: an error raised while evaluating it aborts
//! the search and is handed back unchanged.

use crate::Error;
use thiserror::Error;

/// Golden ratio used to grow a bracket
const GOLD: f64 = 1.618_034;
/// Golden section fraction used when a parabolic step is rejected
const CGOLD: f64 = 0.381_966_0;
/// Largest parabolic extrapolation allowed while bracketing
const GLIMIT: f64 = 100.0;
const TINY: f64 = 1e-20;
/// Absolute tolerance floor, for minima at zero
const ZEPS: f64 = 1e-12;

#[derive(Error, Debug, Clone, PartialEq)]
pub enum SolveError {
    #[error("bracket [{lower}, {upper}] does not change sign")]
    NoSignChange { lower: f64, upper: f64 },

    #[error("no convergence within {0} iterations")]
    MaxIterations(usize),

    #[error(transparent)]
    Objective(#[from] Error),
}

/// Find `x` in `[lower, upper]` with `f(x) == 0` to within `tol`.
///
/// `f(lower)` and `f(upper)` must differ in sign.
pub fn brent_root<F>(
    mut f: F,
    lower: f64,
    upper: f64,
    tol: f64,
    max_iter: usize,
) -> Result<f64, SolveError>
where
    F: FnMut(f64) -> Result<f64, Error>,
{
    let (mut a, mut b) = (lower, upper);
    let mut fa = f(a)?;
    let mut fb = f(b)?;
    if fa == 0.0 {
        return Ok(a);
    }
    if fb == 0.0 {
        return Ok(b);
    }
    if (fa > 0.0) == (fb > 0.0) {
        return Err(SolveError::NoSignChange { lower, upper });
    }

    let (mut c, mut fc) = (b, fb);
    let mut d = b - a;
    let mut e = d;
    for _ in 0..max_iter {
        if (fb > 0.0) == (fc > 0.0) {
            c = a;
            fc = fa;
            d = b - a;
            e = d;
        }
        if fc.abs() < fb.abs() {
            a = b;
            b = c;
            c = a;
            fa = fb;
            fb = fc;
            fc = fa;
        }
        let tol1 = 2.0 * f64::EPSILON * b.abs() + 0.5 * tol;
        let xm = 0.5 * (c - b);
        if xm.abs() <= tol1 || fb == 0.0 {
            return Ok(b);
        }
        if e.abs() >= tol1 && fa.abs() > fb.abs() {
            // inverse quadratic interpolation, or secant when a == c
            let s = fb / fa;
            let (mut p, mut q) = if a == c {
                (2.0 * xm * s, 1.0 - s)
            } else {
                let q = fa / fc;
                let r = fb / fc;
                (
                    s * (2.0 * xm * q * (q - r) - (b - a) * (r - 1.0)),
                    (q - 1.0) * (r - 1.0) * (s - 1.0),
                )
            };
            if p > 0.0 {
                q = -q;
            }
            p = p.abs();
            let min1 = 3.0 * xm * q - (tol1 * q).abs();
            let min2 = (e * q).abs();
            if 2.0 * p < min1.min(min2) {
                e = d;
                d = p / q;
            } else {
                d = xm;
                e = d;
            }
        } else {
            d = xm;
            e = d;
        }
        a = b;
        fa = fb;
        b += if d.abs() > tol1 { d } else { tol1.copysign(xm) };
        fb = f(b)?;
    }
    Err(SolveError::MaxIterations(max_iter))
}

/// Find a local minimum of `f` starting the search at `guess`.
///
/// `tol` is relative to the magnitude of the solution and is floored at
/// the square root of machine epsilon, below which the minimum of a smooth
/// function cannot be resolved.
pub fn minimize<F>(mut f: F, guess: f64, tol: f64, max_iter: usize) -> Result<f64, SolveError>
where
    F: FnMut(f64) -> Result<f64, Error>,
{
    let (ax, bx, cx) = bracket(&mut f, guess, guess + 1.0, max_iter)?;
    brent_min(&mut f, ax, bx, cx, tol.max(f64::EPSILON.sqrt()), max_iter)
}

/// Walk downhill from `(a, b)` until `f(b)` is below both ends
fn bracket<F>(f: &mut F, a: f64, b: f64, max_iter: usize) -> Result<(f64, f64, f64), SolveError>
where
    F: FnMut(f64) -> Result<f64, Error>,
{
    let (mut ax, mut bx) = (a, b);
    let mut fa = f(ax)?;
    let mut fb = f(bx)?;
    if fb > fa {
        std::mem::swap(&mut ax, &mut bx);
        std::mem::swap(&mut fa, &mut fb);
    }
    let mut cx = bx + GOLD * (bx - ax);
    let mut fc = f(cx)?;
    let mut steps = 0;
    while fb > fc {
        steps += 1;
        if steps > max_iter {
            return Err(SolveError::MaxIterations(max_iter));
        }
        let r = (bx - ax) * (fb - fc);
        let q = (bx - cx) * (fb - fa);
        let denom = 2.0 * (q - r).abs().max(TINY).copysign(q - r);
        let mut u = bx - ((bx - cx) * q - (bx - ax) * r) / denom;
        let ulim = bx + GLIMIT * (cx - bx);
        let mut fu;
        if (bx - u) * (u - cx) > 0.0 {
            fu = f(u)?;
            if fu < fc {
                return Ok((bx, u, cx));
            } else if fu > fb {
                return Ok((ax, bx, u));
            }
            u = cx + GOLD * (cx - bx);
            fu = f(u)?;
        } else if (cx - u) * (u - ulim) > 0.0 {
            fu = f(u)?;
            if fu < fc {
                bx = cx;
                cx = u;
                u = cx + GOLD * (cx - bx);
                fb = fc;
                fc = fu;
                fu = f(u)?;
            }
        } else if (u - ulim) * (ulim - cx) >= 0.0 {
            u = ulim;
            fu = f(u)?;
        } else {
            u = cx + GOLD * (cx - bx);
            fu = f(u)?;
        }
        ax = bx;
        bx = cx;
        cx = u;
        fa = fb;
        fb = fc;
        fc = fu;
    }
    Ok((ax, bx, cx))
}

fn brent_min<F>(
    f: &mut F,
    ax: f64,
    bx: f64,
    cx: f64,
    tol: f64,
    max_iter: usize,
) -> Result<f64, SolveError>
where
    F: FnMut(f64) -> Result<f64, Error>,
{
    let (mut a, mut b) = if ax < cx { (ax, cx) } else { (cx, ax) };
    let (mut x, mut w, mut v) = (bx, bx, bx);
    let mut fx = f(x)?;
    let (mut fw, mut fv) = (fx, fx);
    let mut d: f64 = 0.0;
    let mut e: f64 = 0.0;

    for _ in 0..max_iter {
        let xm = 0.5 * (a + b);
        let tol1 = tol * x.abs() + ZEPS;
        let tol2 = 2.0 * tol1;
        if (x - xm).abs() <= tol2 - 0.5 * (b - a) {
            return Ok(x);
        }
        if e.abs() > tol1 {
            // parabola through x, w and v
            let r = (x - w) * (fx - fv);
            let mut q = (x - v) * (fx - fw);
            let mut p = (x - v) * q - (x - w) * r;
            q = 2.0 * (q - r);
            if q > 0.0 {
                p = -p;
            }
            q = q.abs();
            let etemp = e;
            e = d;
            if p.abs() >= (0.5 * q * etemp).abs() || p <= q * (a - x) || p >= q * (b - x) {
                e = if x >= xm { a - x } else { b - x };
                d = CGOLD * e;
            } else {
                d = p / q;
                let u = x + d;
                if u - a < tol2 || b - u < tol2 {
                    d = tol1.copysign(xm - x);
                }
            }
        } else {
            e = if x >= xm { a - x } else { b - x };
            d = CGOLD * e;
        }
        let u = if d.abs() >= tol1 {
            x + d
        } else {
            x + tol1.copysign(d)
        };
        let fu = f(u)?;
        if fu <= fx {
            if u >= x {
                a = x;
            } else {
                b = x;
            }
            v = w;
            w = x;
            x = u;
            fv = fw;
            fw = fx;
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
    Err(SolveError::MaxIterations(max_iter))
}
