//! A minimal concrete [`GpModel`] used by tests and examples.
//!
//! `DiagonalGpModel` pairs a mean function with a single white-noise
//! amplitude, i.e. a diagonal covariance `sigma^2 + dy_i^2`. It is not a
//! substitute for a real kernel; it exists so the inference engine can be
//! exercised end to end without any covariance mathematics.

use crate::lightcurve::GappyLightcurve;
use crate::mean::{build_mean_model, MeanFunction};
use crate::model::{Bounds, GpModel, PsdFn};
use crate::{Error, Result};
use ndarray::{Array1, ArrayView1};
use std::f64::consts::TAU;
use std::sync::Arc;

/// Sampling pattern shared (cheaply) across model clones.
#[derive(Debug)]
struct SamplingData {
    times: Array1<f64>,
    dy: Array1<f64>,
}

/// Mean function plus independent white noise of amplitude `sigma`.
///
/// Free parameters are the mean parameters (when the mean is fitted)
/// followed by `sigma`. The prior is uniform within the parameter bounds.
#[derive(Debug, Clone)]
pub struct DiagonalGpModel {
    data: Arc<SamplingData>,
    mean: MeanFunction,
    sigma: f64,
    sigma_bounds: Bounds,
}

impl DiagonalGpModel {
    /// Build the model from a lightcurve and an optional mean-model name
    /// (resolved by [`build_mean_model`]; an invalid name aborts construction).
    pub fn new(lightcurve: &GappyLightcurve, mean_model: Option<&str>) -> Result<Self> {
        let mean = build_mean_model(mean_model, lightcurve)?;

        let y_std = {
            let y = lightcurve.y();
            let m = lightcurve.mean();
            (y.iter().map(|&v| (v - m).powi(2)).sum::<f64>() / y.len().max(1) as f64).sqrt()
        };
        let dy_mean = lightcurve.dy().mean().unwrap_or(0.0);
        let sigma = [y_std, dy_mean, 1e-3]
            .into_iter()
            .find(|&v| v > 0.0)
            .unwrap_or(1e-3);

        Ok(Self {
            data: Arc::new(SamplingData {
                times: lightcurve.times().clone(),
                dy: lightcurve.dy().clone(),
            }),
            mean,
            sigma,
            sigma_bounds: Bounds::new(vec![(Some(sigma * 1e-6), Some(sigma * 1e3))])?,
        })
    }

    /// The mean function, including its fit flag.
    pub fn mean(&self) -> &MeanFunction {
        &self.mean
    }

    /// Current white-noise amplitude.
    pub fn sigma(&self) -> f64 {
        self.sigma
    }

    fn n_free(&self) -> usize {
        self.mean.n_free_params() + 1
    }
}

impl GpModel for DiagonalGpModel {
    fn parameter_names(&self) -> Vec<String> {
        let mut names = if self.mean.fit {
            self.mean.model.parameter_names()
        } else {
            Vec::new()
        };
        names.push("sigma".to_string());
        names
    }

    fn parameter_vector(&self) -> Array1<f64> {
        let mut params = if self.mean.fit {
            self.mean.model.parameter_vector().to_vec()
        } else {
            Vec::new()
        };
        params.push(self.sigma);
        Array1::from_vec(params)
    }

    fn set_parameter_vector(&mut self, params: ArrayView1<f64>) -> Result<()> {
        if params.len() != self.n_free() {
            return Err(Error::InvalidParameter(format!(
                "model expects {} parameters, got {}",
                self.n_free(),
                params.len()
            )));
        }
        let k = self.mean.n_free_params();
        if self.mean.fit {
            self.mean
                .model
                .set_parameter_vector(params.slice(ndarray::s![..k]))?;
        }
        self.sigma = params[k];
        Ok(())
    }

    fn parameter_bounds(&self) -> Bounds {
        if self.mean.fit {
            self.mean.bounds.clone().join(self.sigma_bounds.clone())
        } else {
            self.sigma_bounds.clone()
        }
    }

    fn log_prior(&self) -> f64 {
        if self
            .parameter_bounds()
            .contains(self.parameter_vector().view())
        {
            0.0
        } else {
            f64::NEG_INFINITY
        }
    }

    fn log_likelihood(&self, y: ArrayView1<f64>) -> f64 {
        let mut logl = 0.0;
        for i in 0..y.len() {
            let var = self.sigma * self.sigma + self.data.dy[i] * self.data.dy[i];
            let resid = y[i] - self.mean.model.value(self.data.times[i]);
            logl -= 0.5 * (resid * resid / var + (TAU * var).ln());
        }
        logl
    }

    fn psd(&self) -> PsdFn {
        // flat (white) spectrum
        let power = 2.0 * self.sigma * self.sigma;
        Arc::new(move |_freq| power)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::array;

    fn flat_lc() -> GappyLightcurve {
        let times = Array1::linspace(0.0, 90.0, 10);
        let y = Array1::from_elem(10, 5.0);
        let dy = Array1::from_elem(10, 0.5);
        GappyLightcurve::new(times, y, Some(dy), None, None, None).unwrap()
    }

    #[test]
    fn test_unfit_mean_exposes_only_sigma() {
        let model = DiagonalGpModel::new(&flat_lc(), None).unwrap();
        assert_eq!(model.parameter_names(), vec!["sigma"]);
        assert_eq!(model.parameter_vector().len(), 1);
        assert_eq!(model.parameter_bounds().len(), 1);
    }

    #[test]
    fn test_constant_mean_exposes_mean_and_sigma() {
        let model = DiagonalGpModel::new(&flat_lc(), Some("constant")).unwrap();
        assert_eq!(model.parameter_names(), vec!["mean", "sigma"]);
        assert_eq!(model.parameter_vector().len(), 2);
        assert_eq!(model.parameter_bounds().len(), 2);
    }

    #[test]
    fn test_invalid_mean_name_aborts_construction() {
        let result = DiagonalGpModel::new(&flat_lc(), Some("sine"));
        assert!(matches!(result, Err(Error::UnknownMeanModel(_))));
    }

    #[test]
    fn test_prior_rejects_out_of_bounds() {
        let mut model = DiagonalGpModel::new(&flat_lc(), Some("constant")).unwrap();
        assert_eq!(model.log_prior(), 0.0);
        // mean far outside [min(y), max(y)]
        model
            .set_parameter_vector(array![1e6, model.sigma()].view())
            .unwrap();
        assert_eq!(model.log_prior(), f64::NEG_INFINITY);
    }

    #[test]
    fn test_likelihood_peaks_at_true_mean() {
        let lc = flat_lc();
        let mut model = DiagonalGpModel::new(&lc, Some("constant")).unwrap();
        let sigma = model.sigma();

        model.set_parameter_vector(array![5.0, sigma].view()).unwrap();
        let at_truth = model.log_likelihood(lc.y().view());

        model.set_parameter_vector(array![4.0, sigma].view()).unwrap();
        let off_truth = model.log_likelihood(lc.y().view());

        assert!(at_truth > off_truth);
    }

    #[test]
    fn test_psd_is_flat_and_tracks_sigma() {
        let model = DiagonalGpModel::new(&flat_lc(), None).unwrap();
        let psd = model.psd();
        assert_eq!(psd(1e-3), psd(10.0));
        assert!((psd(1.0) - 2.0 * model.sigma() * model.sigma()).abs() < 1e-12);
    }

    #[test]
    fn test_set_parameter_vector_length_check() {
        let mut model = DiagonalGpModel::new(&flat_lc(), None).unwrap();
        assert!(model.set_parameter_vector(array![1.0, 2.0].view()).is_err());
    }
}
