//! Simulator contract for posterior-predictive lightcurve generation.
//!
//! The PSD-to-timeseries mathematics stays behind these traits; the engine
//! only needs to build a simulator from a PSD and a noise-distribution label,
//! ask it for a rate series and inject observational noise.

use crate::lightcurve::GappyLightcurve;
use crate::model::PsdFn;
use crate::{Error, Result};
use ndarray::Array1;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Probability distribution of the simulated fluxes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum NoisePdf {
    #[default]
    Gaussian,
    Lognormal,
    Uniform,
}

impl FromStr for NoisePdf {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_lowercase().as_str() {
            "gaussian" => Ok(NoisePdf::Gaussian),
            "lognormal" => Ok(NoisePdf::Lognormal),
            "uniform" => Ok(NoisePdf::Uniform),
            other => Err(Error::InvalidParameter(format!(
                "unknown noise pdf '{}'; available pdfs are: gaussian, lognormal, uniform",
                other
            ))),
        }
    }
}

impl fmt::Display for NoisePdf {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            NoisePdf::Gaussian => write!(f, "gaussian"),
            NoisePdf::Lognormal => write!(f, "lognormal"),
            NoisePdf::Uniform => write!(f, "uniform"),
        }
    }
}

/// Synthesizes count-rate series matching a lightcurve's sampling pattern.
pub trait Simulator {
    /// Generate a noiseless rate series on the lightcurve's timestamps.
    /// `extension_factor` stretches the underlying simulated segment to
    /// introduce red-noise leakage.
    fn generate_lightcurve(&mut self, extension_factor: f64) -> Result<Array1<f64>>;

    /// Inject observational noise into `rates`, returning the noisy rates and
    /// their 1-sigma uncertainties.
    fn add_noise(&mut self, rates: &Array1<f64>) -> Result<(Array1<f64>, Array1<f64>)>;
}

/// Builds [`Simulator`] instances from a PSD model and a lightcurve's
/// sampling properties (timestamps, exposures, mean rate, background).
pub trait SimulatorFactory: Sync {
    type Sim: Simulator;

    fn simulator(
        &self,
        psd: PsdFn,
        lightcurve: &GappyLightcurve,
        pdf: NoisePdf,
    ) -> Result<Self::Sim>;
}
