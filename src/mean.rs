//! Mean models for the Gaussian process and the name-keyed selector.
//!
//! The selector resolves a mean-model name from the closed set
//! {`constant`, `linear`, `gaussian`} (case-insensitive) once at construction
//! time, deriving initial guesses and bounds from the lightcurve statistics.
//! An omitted name yields a constant mean fixed at the sample mean that is
//! not fitted.

use crate::lightcurve::GappyLightcurve;
use crate::model::Bounds;
use crate::{Error, Result};
use ndarray::{Array1, ArrayView1};
use serde::{Deserialize, Serialize};
use std::f64::consts::TAU;

/// Mean-function forms understood by the selector.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum MeanModel {
    Constant {
        value: f64,
    },
    Linear {
        slope: f64,
        intercept: f64,
    },
    Gaussian {
        center: f64,
        sigma: f64,
        amplitude: f64,
    },
}

impl MeanModel {
    /// Evaluate the mean at time `t`.
    pub fn value(&self, t: f64) -> f64 {
        match *self {
            MeanModel::Constant { value } => value,
            MeanModel::Linear { slope, intercept } => slope * t + intercept,
            MeanModel::Gaussian {
                center,
                sigma,
                amplitude,
            } => {
                let z = (t - center) / sigma;
                amplitude / (sigma * TAU.sqrt()) * (-0.5 * z * z).exp()
            }
        }
    }

    /// Number of parameters of this form.
    pub fn n_params(&self) -> usize {
        match self {
            MeanModel::Constant { .. } => 1,
            MeanModel::Linear { .. } => 2,
            MeanModel::Gaussian { .. } => 3,
        }
    }

    /// Parameter names, in vector order.
    pub fn parameter_names(&self) -> Vec<String> {
        let names: &[&str] = match self {
            MeanModel::Constant { .. } => &["mean"],
            MeanModel::Linear { .. } => &["slope", "intercept"],
            MeanModel::Gaussian { .. } => &["center", "sigma", "amplitude"],
        };
        names.iter().map(|s| s.to_string()).collect()
    }

    /// Current parameter vector.
    pub fn parameter_vector(&self) -> Array1<f64> {
        match *self {
            MeanModel::Constant { value } => Array1::from_vec(vec![value]),
            MeanModel::Linear { slope, intercept } => Array1::from_vec(vec![slope, intercept]),
            MeanModel::Gaussian {
                center,
                sigma,
                amplitude,
            } => Array1::from_vec(vec![center, sigma, amplitude]),
        }
    }

    /// Replace the parameter vector.
    pub fn set_parameter_vector(&mut self, params: ArrayView1<f64>) -> Result<()> {
        if params.len() != self.n_params() {
            return Err(Error::InvalidParameter(format!(
                "mean model expects {} parameters, got {}",
                self.n_params(),
                params.len()
            )));
        }
        match self {
            MeanModel::Constant { value } => *value = params[0],
            MeanModel::Linear { slope, intercept } => {
                *slope = params[0];
                *intercept = params[1];
            }
            MeanModel::Gaussian {
                center,
                sigma,
                amplitude,
            } => {
                *center = params[0];
                *sigma = params[1];
                *amplitude = params[2];
            }
        }
        Ok(())
    }
}

/// A parametrized mean function: the functional form, its parameter bounds
/// and whether the parameters are fitted or held fixed.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MeanFunction {
    pub model: MeanModel,
    pub bounds: Bounds,
    pub fit: bool,
}

impl MeanFunction {
    /// Number of *free* parameters (zero when the mean is held fixed).
    pub fn n_free_params(&self) -> usize {
        if self.fit {
            self.model.n_params()
        } else {
            0
        }
    }
}

/// Build a mean function from an optional name and the lightcurve statistics.
///
/// - `None` resolves to a constant mean fixed at the sample mean, bounded by
///   `[min(y), max(y)]` and not fitted.
/// - `"constant"` is the same functional form, fitted.
/// - `"linear"` derives the permitted slope interval from the empirical slope
///   between the minimum- and maximum-time points, with the sign of
///   `y[n-1] - y[0]` selecting the rising or falling branch; the intercept is
///   unconstrained.
/// - `"gaussian"` centres on the midpoint-time sample with a width guess of
///   half the duration; the amplitude is bounded to
///   `[max(y) * sqrt(2 pi) * duration, 50 * max(y) * sqrt(2 pi) * duration]`.
///
/// Any other name fails with [`Error::UnknownMeanModel`].
pub fn build_mean_model(name: Option<&str>, lightcurve: &GappyLightcurve) -> Result<MeanFunction> {
    let y = lightcurve.y();
    let times = lightcurve.times();
    let n = lightcurve.n();
    if n == 0 {
        return Err(Error::InvalidParameter(
            "cannot build a mean model for an empty lightcurve".to_string(),
        ));
    }

    let miny = y.iter().cloned().fold(f64::INFINITY, f64::min);
    let maxy = y.iter().cloned().fold(f64::NEG_INFINITY, f64::max);

    let name = match name {
        None => {
            return Ok(MeanFunction {
                model: MeanModel::Constant {
                    value: lightcurve.mean(),
                },
                bounds: Bounds::new(vec![(Some(miny), Some(maxy))])?,
                fit: false,
            });
        }
        Some(name) => name.to_lowercase(),
    };

    match name.as_str() {
        "constant" => Ok(MeanFunction {
            model: MeanModel::Constant {
                value: lightcurve.mean(),
            },
            bounds: Bounds::new(vec![(Some(miny), Some(maxy))])?,
            fit: true,
        }),
        "linear" => {
            // empirical slope between the minimum- and maximum-time points
            let (imin, imax) = (0..n).fold((0, 0), |(lo, hi), i| {
                (
                    if times[i] < times[lo] { i } else { lo },
                    if times[i] > times[hi] { i } else { hi },
                )
            });
            let dt = times[imax] - times[imin];
            let slope_bound = if dt > 0.0 {
                ((y[imax] - y[imin]) / dt).abs()
            } else {
                0.0
            };
            let rising = y[n - 1] - y[0] >= 0.0;
            let (lo, hi, guess) = if rising {
                (0.0, slope_bound, slope_bound / 2.0)
            } else {
                (-slope_bound, 0.0, -slope_bound / 2.0)
            };
            let t_mean = times.mean().unwrap_or(0.0);
            let intercept = lightcurve.mean() - guess * t_mean;
            Ok(MeanFunction {
                model: MeanModel::Linear {
                    slope: guess,
                    intercept,
                },
                bounds: Bounds::new(vec![(Some(lo), Some(hi)), (None, None)])?,
                fit: true,
            })
        }
        "gaussian" => {
            let duration = lightcurve.duration();
            let sigma_guess = duration / 2.0;
            let amplitude_guess = (maxy - miny) * TAU.sqrt() * sigma_guess;
            let center_guess = times[n / 2];
            let amp_lo = maxy * TAU.sqrt() * duration;
            let amp_hi = 50.0 * maxy * TAU.sqrt() * duration;
            Ok(MeanFunction {
                model: MeanModel::Gaussian {
                    center: center_guess,
                    sigma: sigma_guess,
                    amplitude: amplitude_guess,
                },
                bounds: Bounds::new(vec![
                    (Some(times[0]), Some(times[n - 1])),
                    (Some(0.0), Some(duration)),
                    (Some(amp_lo), Some(amp_hi)),
                ])?,
                fit: true,
            })
        }
        other => Err(Error::UnknownMeanModel(other.to_string())),
    }
}
