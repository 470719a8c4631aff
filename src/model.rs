//! The model-evaluator contract and parameter-bounds types.
//!
//! The inference engine never touches covariance mathematics directly; it
//! drives any type implementing [`GpModel`]. Implementations own their
//! parameter vector (mean parameters first where the mean is fitted, then
//! kernel parameters) and must keep its ordering stable across calls.

use crate::{Error, Result};
use ndarray::{Array1, ArrayView1};
use serde::{Deserialize, Serialize};
use std::sync::Arc;

/// Power spectral density as a function of frequency.
pub type PsdFn = Arc<dyn Fn(f64) -> f64 + Send + Sync>;

/// Per-parameter bounds: one `(lower, upper)` pair per free parameter, either
/// side possibly absent (unconstrained).
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct Bounds(Vec<(Option<f64>, Option<f64>)>);

impl Bounds {
    /// Build a bounds set, validating that `lower <= upper` wherever both
    /// sides are present.
    pub fn new(pairs: Vec<(Option<f64>, Option<f64>)>) -> Result<Self> {
        for (i, (lower, upper)) in pairs.iter().enumerate() {
            if let (Some(lo), Some(hi)) = (lower, upper) {
                if lo > hi {
                    return Err(Error::InvalidParameter(format!(
                        "bounds for parameter {} are inverted: lower ({}) > upper ({})",
                        i, lo, hi
                    )));
                }
            }
        }
        Ok(Self(pairs))
    }

    /// Bounds set with every parameter unconstrained.
    pub fn unbounded(n: usize) -> Self {
        Self(vec![(None, None); n])
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// The `(lower, upper)` pair of parameter `i`.
    pub fn pair(&self, i: usize) -> (Option<f64>, Option<f64>) {
        self.0[i]
    }

    pub fn iter(&self) -> impl Iterator<Item = &(Option<f64>, Option<f64>)> {
        self.0.iter()
    }

    /// Whether component `value` satisfies the bounds of parameter `i`.
    /// One-sided bounds are enforced individually; an absent bound leaves
    /// that side unconstrained.
    pub fn contains_component(&self, i: usize, value: f64) -> bool {
        let (lower, upper) = self.0[i];
        if let Some(lo) = lower {
            if value < lo {
                return false;
            }
        }
        if let Some(hi) = upper {
            if value > hi {
                return false;
            }
        }
        true
    }

    /// Whether every component of `params` satisfies its bound.
    pub fn contains(&self, params: ArrayView1<f64>) -> bool {
        params.len() == self.len()
            && params
                .iter()
                .enumerate()
                .all(|(i, &v)| self.contains_component(i, v))
    }

    /// Clamp every component of `params` into its bounds.
    pub fn clamp(&self, params: ArrayView1<f64>) -> Array1<f64> {
        Array1::from_iter(params.iter().enumerate().map(|(i, &v)| {
            let (lower, upper) = self.0[i];
            let mut v = v;
            if let Some(lo) = lower {
                v = v.max(lo);
            }
            if let Some(hi) = upper {
                v = v.min(hi);
            }
            v
        }))
    }

    /// Concatenate two bounds sets (mean bounds followed by kernel bounds).
    pub fn join(mut self, other: Bounds) -> Bounds {
        self.0.extend(other.0);
        self
    }
}

impl From<Vec<(f64, f64)>> for Bounds {
    fn from(pairs: Vec<(f64, f64)>) -> Self {
        Self(pairs.into_iter().map(|(lo, hi)| (Some(lo), Some(hi))).collect())
    }
}

/// A Gaussian-process model over a lightcurve: a likelihood/prior evaluator
/// on a parameter vector, plus bounds and a PSD accessor.
///
/// The engine mutates the parameter vector in place before every evaluation.
/// Concurrent evaluations therefore never share one instance; the engine
/// clones the model per parallel worker, which is why `Clone + Send + Sync`
/// are supertraits.
pub trait GpModel: Clone + Send + Sync {
    /// Names of the free parameters, in vector order.
    fn parameter_names(&self) -> Vec<String>;

    /// Current free-parameter vector.
    fn parameter_vector(&self) -> Array1<f64>;

    /// Replace the free-parameter vector. Fails if the length differs from
    /// [`GpModel::parameter_vector`].
    fn set_parameter_vector(&mut self, params: ArrayView1<f64>) -> Result<()>;

    /// Bounds of the free parameters, in vector order.
    fn parameter_bounds(&self) -> Bounds;

    /// Log-prior at the current parameter vector. Non-finite values reject
    /// the position without the likelihood being evaluated.
    fn log_prior(&self) -> f64;

    /// Log-likelihood of the observed rates at the current parameter vector.
    fn log_likelihood(&self, y: ArrayView1<f64>) -> f64;

    /// Power spectral density implied by the current kernel parameters.
    fn psd(&self) -> PsdFn;
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::array;

    #[test]
    fn test_bounds_validation() {
        assert!(Bounds::new(vec![(Some(0.0), Some(1.0)), (None, None)]).is_ok());
        assert!(Bounds::new(vec![(Some(2.0), Some(1.0))]).is_err());
        // equal bounds are allowed
        assert!(Bounds::new(vec![(Some(1.0), Some(1.0))]).is_ok());
    }

    #[test]
    fn test_contains_one_sided() {
        let bounds = Bounds::new(vec![(Some(0.0), None), (None, Some(5.0))]).unwrap();
        assert!(bounds.contains(array![0.0, 5.0].view()));
        assert!(bounds.contains(array![100.0, -100.0].view()));
        assert!(!bounds.contains(array![-0.1, 0.0].view()));
        assert!(!bounds.contains(array![0.0, 5.1].view()));
        // length mismatch never satisfies
        assert!(!bounds.contains(array![1.0].view()));
    }

    #[test]
    fn test_clamp() {
        let bounds = Bounds::new(vec![(Some(0.0), Some(1.0)), (None, None)]).unwrap();
        let clamped = bounds.clamp(array![-3.0, -3.0].view());
        assert_eq!(clamped, array![0.0, -3.0]);
        let clamped = bounds.clamp(array![3.0, 3.0].view());
        assert_eq!(clamped, array![1.0, 3.0]);
    }

    #[test]
    fn test_join_preserves_order() {
        let a = Bounds::new(vec![(Some(0.0), Some(1.0))]).unwrap();
        let b = Bounds::new(vec![(None, Some(2.0))]).unwrap();
        let joined = a.join(b);
        assert_eq!(joined.len(), 2);
        assert_eq!(joined.pair(0), (Some(0.0), Some(1.0)));
        assert_eq!(joined.pair(1), (None, Some(2.0)));
    }
}
