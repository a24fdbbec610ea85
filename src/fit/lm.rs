//! Levenberg-Marquardt nonlinear least squares with analytic gradients.
//!
//! The normal equations are accumulated point by point, so memory stays
//! `O(P^2)` no matter how many samples are fitted. This matters for the
//! position-channel sine fit, which runs on every raw chunk.

use nalgebra::{SMatrix, SVector};
use tracing::trace;

use crate::error::{Error, Result};

/// A model `y = f(x; p)` with `P` parameters.
pub trait Model<const P: usize> {
    fn eval(&self, x: f64, p: &[f64; P]) -> f64;

    /// Partial derivatives of `eval` with respect to each parameter.
    fn gradient(&self, x: f64, p: &[f64; P]) -> [f64; P];
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct LmSetup {
    pub max_iterations: usize,
    /// Relative step tolerance.
    pub xtol: f64,
    /// Relative tolerance on the decrease of chi2.
    pub ftol: f64,
    pub initial_lambda: f64,
}

impl Default for LmSetup {
    fn default() -> Self {
        LmSetup {
            max_iterations: 200,
            xtol: 1e-8,
            ftol: 1e-10,
            initial_lambda: 1e-3,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct LmOutcome<const P: usize> {
    pub params: [f64; P],
    /// Parameter covariance, scaled by the reduced chi2.
    pub covariance: SMatrix<f64, P, P>,
    pub chi2: f64,
    pub iterations: usize,
}

const MAX_LAMBDA: f64 = 1e12;

pub fn levenberg_marquardt<M, const P: usize>(
    model: &M,
    x: &[f64],
    y: &[f64],
    guess: [f64; P],
    setup: &LmSetup,
) -> Result<LmOutcome<P>>
where
    M: Model<P>,
{
    assert_eq!(x.len(), y.len());
    let n = x.len();
    if n <= P {
        return Err(Error::FitConvergence(format!(
            "{n} points are not enough for {P} parameters"
        )));
    }
    if guess.iter().any(|p| !p.is_finite()) {
        return Err(Error::FitConvergence(format!(
            "non-finite initial guess: {guess:?}"
        )));
    }

    let mut p = guess;
    let mut chi2 = chi_square(model, x, y, &p);
    let mut lambda = setup.initial_lambda;
    let mut converged = false;
    let mut iterations = 0;

    while iterations < setup.max_iterations {
        iterations += 1;
        let (jtj, jtr) = normal_equations(model, x, y, &p);

        let mut a = jtj;
        for i in 0..P {
            a[(i, i)] += lambda * jtj[(i, i)].max(f64::EPSILON);
        }
        let Some(delta) = a.cholesky().map(|c| c.solve(&jtr)) else {
            lambda *= 10.0;
            if lambda > MAX_LAMBDA {
                break;
            }
            continue;
        };

        let step_small = (0..P).all(|i| delta[i].abs() <= setup.xtol * (p[i].abs() + setup.xtol));
        let mut next = p;
        next.iter_mut().zip(delta.iter()).for_each(|(p, d)| *p += d);
        let next_chi2 = chi_square(model, x, y, &next);

        if next_chi2.is_finite() && next_chi2 <= chi2 {
            let decrease = chi2 - next_chi2;
            p = next;
            chi2 = next_chi2;
            lambda = (lambda / 10.0).max(1e-12);
            if step_small || decrease <= setup.ftol * chi2 {
                converged = true;
                break;
            }
        } else {
            if step_small {
                // Already sitting in the minimum, no step can improve further.
                converged = true;
                break;
            }
            lambda *= 10.0;
            if lambda > MAX_LAMBDA {
                break;
            }
        }
    }
    trace!(iterations, chi2, lambda, converged);

    if !converged {
        return Err(Error::FitConvergence(format!(
            "not converged after {iterations} iterations"
        )));
    }

    let (jtj, _) = normal_equations(model, x, y, &p);
    let inverse = jtj
        .try_inverse()
        .filter(|m| m.iter().all(|v| v.is_finite()))
        .ok_or_else(|| Error::FitConvergence("singular jacobian".to_owned()))?;
    let reduced_chi2 = chi2 / (n - P) as f64;

    Ok(LmOutcome {
        params: p,
        covariance: inverse * reduced_chi2,
        chi2,
        iterations,
    })
}

fn chi_square<M: Model<P>, const P: usize>(model: &M, x: &[f64], y: &[f64], p: &[f64; P]) -> f64 {
    x.iter()
        .zip(y)
        .map(|(&x, &y)| (y - model.eval(x, p)).powi(2))
        .sum()
}

fn normal_equations<M: Model<P>, const P: usize>(
    model: &M,
    x: &[f64],
    y: &[f64],
    p: &[f64; P],
) -> (SMatrix<f64, P, P>, SVector<f64, P>) {
    let mut jtj = SMatrix::<f64, P, P>::zeros();
    let mut jtr = SVector::<f64, P>::zeros();
    for (&x, &y) in x.iter().zip(y) {
        let residual = y - model.eval(x, p);
        let g = SVector::<f64, P>::from(model.gradient(x, p));
        jtj += g * g.transpose();
        jtr += g * residual;
    }
    (jtj, jtr)
}
