//! Bounded maximum-likelihood fitting.
//!
//! Minimizes the negative log-likelihood with L-BFGS (More-Thuente line
//! search, finite-difference gradients). Bound constraints are handled by
//! mapping each parameter to an unconstrained optimizer space: identity when
//! unconstrained, a shifted softplus for one-sided bounds, and a scaled logit
//! when both sides are present. The solver therefore only ever evaluates the
//! model inside its bounds.

use crate::model::{Bounds, GpModel};
use crate::{Error, Result};
use argmin::core::{CostFunction, Executor, Gradient, State, TerminationReason, TerminationStatus};
use argmin::solver::linesearch::MoreThuenteLineSearch;
use argmin::solver::quasinewton::LBFGS;
use finitediff::FiniteDiff;
use ndarray::{Array1, ArrayView1};
use std::cell::RefCell;

type Theta = Array1<f64>;
type Grad = Array1<f64>;
type MoreThuenteLs = MoreThuenteLineSearch<Theta, Grad, f64>;
type LbfgsSolver = LBFGS<MoreThuenteLs, Theta, Grad, f64>;

/// L-BFGS history size.
const LBFGS_MEMORY: usize = 7;

/// Outcome of a maximum-likelihood fit, reported in bounded parameter space.
#[derive(Debug, Clone)]
pub struct FitResult {
    /// Best-fit parameter vector.
    pub parameters: Array1<f64>,
    /// Whether the solver reported convergence (rather than hitting the
    /// iteration cap or exiting early).
    pub success: bool,
    /// Achieved negative log-likelihood.
    pub neg_log_likelihood: f64,
    /// Iterations performed by the solver.
    pub iterations: u64,
    /// The solver's own termination status, verbatim.
    pub status: String,
}

/// Numerically stable softplus, `ln(1 + exp(x))`.
///
/// The `x > 20` cutoff keeps `f64` arithmetic well conditioned for large
/// inputs, where `softplus(x) ~ x`.
fn safe_softplus(x: f64) -> f64 {
    if x > 20.0 {
        x
    } else {
        x.exp().ln_1p()
    }
}

/// Inverse of softplus on `(0, inf)`: solves `softplus(t) = x`.
fn safe_softplus_inv(x: f64) -> f64 {
    let x = x.max(1e-12);
    if x > 20.0 {
        x
    } else {
        x.exp_m1().ln()
    }
}

fn sigmoid(z: f64) -> f64 {
    if z >= 0.0 {
        1.0 / (1.0 + (-z).exp())
    } else {
        let e = z.exp();
        e / (1.0 + e)
    }
}

/// Maps between bounded parameter space and the unconstrained space the
/// solver works in.
#[derive(Debug, Clone)]
pub struct BoundsTransform {
    bounds: Bounds,
}

impl BoundsTransform {
    pub fn new(bounds: Bounds) -> Self {
        Self { bounds }
    }

    /// Bounded parameters -> unconstrained optimizer space.
    pub fn to_unconstrained(&self, params: ArrayView1<f64>) -> Array1<f64> {
        Array1::from_iter(params.iter().enumerate().map(|(i, &theta)| {
            match self.bounds.pair(i) {
                (None, None) => theta,
                (Some(lo), None) => safe_softplus_inv(theta - lo),
                (None, Some(hi)) => safe_softplus_inv(hi - theta),
                (Some(lo), Some(hi)) => {
                    if lo == hi {
                        return 0.0;
                    }
                    let u = ((theta - lo) / (hi - lo)).clamp(1e-10, 1.0 - 1e-10);
                    (u / (1.0 - u)).ln()
                }
            }
        }))
    }

    /// Unconstrained optimizer space -> bounded parameters.
    pub fn to_bounded(&self, z: ArrayView1<f64>) -> Array1<f64> {
        Array1::from_iter(z.iter().enumerate().map(|(i, &zi)| {
            match self.bounds.pair(i) {
                (None, None) => zi,
                (Some(lo), None) => lo + safe_softplus(zi),
                (None, Some(hi)) => hi - safe_softplus(zi),
                (Some(lo), Some(hi)) => lo + (hi - lo) * sigmoid(zi),
            }
        }))
    }
}

/// Negative log-likelihood of a [`GpModel`], evaluated in unconstrained
/// space. Owns a private model clone so the caller's model is never mutated
/// by objective evaluations.
struct BoundedNegLogLike<'a, M: GpModel> {
    model: RefCell<M>,
    y: &'a Array1<f64>,
    transform: &'a BoundsTransform,
}

impl<M: GpModel> CostFunction for BoundedNegLogLike<'_, M> {
    type Param = Theta;
    type Output = f64;

    fn cost(&self, z: &Self::Param) -> std::result::Result<Self::Output, argmin::core::Error> {
        let theta = self.transform.to_bounded(z.view());
        let mut model = self.model.borrow_mut();
        model
            .set_parameter_vector(theta.view())
            .map_err(argmin::core::Error::from)?;
        let nll = -model.log_likelihood(self.y.view());
        if !nll.is_finite() {
            return Err(Error::Optimization(format!(
                "non-finite objective ({}) at parameters {:?}",
                nll, theta
            ))
            .into());
        }
        Ok(nll)
    }
}

impl<M: GpModel> Gradient for BoundedNegLogLike<'_, M> {
    type Param = Theta;
    type Gradient = Grad;

    fn gradient(&self, z: &Self::Param) -> std::result::Result<Self::Gradient, argmin::core::Error> {
        // central differences of the cost; inner failures surface as NaN and
        // terminate the line search
        Ok(z.central_diff(&|zz: &Array1<f64>| self.cost(zz).unwrap_or(f64::NAN)))
    }
}

/// Run a bounded maximum-likelihood fit of `model` against the rates `y`.
///
/// `initial` defaults to the model's current parameter vector. The returned
/// [`FitResult`] carries the solver's own status; numerical failures are
/// reported, not swallowed. The caller's model is left untouched.
pub fn fit_ml<M: GpModel>(
    model: &M,
    y: &Array1<f64>,
    initial: Option<Array1<f64>>,
    max_iters: u64,
) -> Result<FitResult> {
    let bounds = model.parameter_bounds();
    let initial = initial.unwrap_or_else(|| model.parameter_vector());
    if initial.len() != bounds.len() {
        return Err(Error::InvalidParameter(format!(
            "initial parameter vector has {} entries but the model has {} bounded parameters",
            initial.len(),
            bounds.len()
        )));
    }

    let transform = BoundsTransform::new(bounds);
    let z0 = transform.to_unconstrained(initial.view());

    let problem = BoundedNegLogLike {
        model: RefCell::new(model.clone()),
        y,
        transform: &transform,
    };
    let solver: LbfgsSolver = LBFGS::new(MoreThuenteLs::new(), LBFGS_MEMORY);

    let result = Executor::new(problem, solver)
        .configure(|state| state.param(z0).max_iters(max_iters))
        .run()
        .map_err(Error::from)?;

    let state = result.state();
    let best_z = state
        .get_best_param()
        .cloned()
        .ok_or_else(|| Error::Optimization("solver returned no parameters".to_string()))?;
    let status = state.get_termination_status();
    let success = matches!(
        status,
        TerminationStatus::Terminated(
            TerminationReason::SolverConverged | TerminationReason::TargetCostReached
        )
    );

    Ok(FitResult {
        parameters: transform.to_bounded(best_z.view()),
        success,
        neg_log_likelihood: state.get_best_cost(),
        iterations: state.get_iter(),
        status: format!("{:?}", status),
    })
}
