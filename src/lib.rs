//! Bayesian inference of Gaussian process models against irregularly-sampled,
//! gap-ridden time series ("lightcurves").
//!
//! The crate centres on [`GPModelling`], which couples:
//!
//! - bounded maximum-likelihood fitting of a [`GpModel`],
//! - affine-invariant ensemble MCMC (Goodman & Weare 2010 stretch moves) with
//!   automated convergence detection via the integrated autocorrelation time
//!   and the Gelman-Rubin statistic,
//! - posterior-predictive simulation of new lightcurves, parallelised across
//!   posterior draws.
//!
//! The covariance-function mathematics and the PSD/noise simulation
//! mathematics are deliberately external: implement [`GpModel`] for your
//! kernel and [`SimulatorFactory`] for your simulator and the engine drives
//! them. A minimal diagonal-covariance model ships in [`example_models`] for
//! tests and experimentation.
//!
//! # Example
//!
//! ```no_run
//! use mind_the_gaps::example_models::DiagonalGpModel;
//! use mind_the_gaps::{GPModelling, GappyLightcurve, McmcOptions};
//! use ndarray::Array1;
//!
//! # fn main() -> mind_the_gaps::Result<()> {
//! let times = Array1::linspace(0.0, 4900.0, 50);
//! let y = Array1::from_elem(50, 10.0);
//! let dy = Array1::from_elem(50, 0.5);
//! let lc = GappyLightcurve::new(times, y, Some(dy), None, None, None)?;
//!
//! let model = DiagonalGpModel::new(&lc, Some("constant"))?;
//! let mut engine = GPModelling::new(lc, model);
//! engine.derive_posteriors(&McmcOptions::default())?;
//! println!("median parameters: {:?}", engine.median_parameters()?);
//! # Ok(())
//! # }
//! ```
//!
//! # References
//!
//! Goodman, J., & Weare, J. (2010). Ensemble samplers with affine invariance.
//! Communications in Applied Mathematics and Computational Science, 5(1), 65-80.

pub mod example_models;
pub mod gpmodelling;
pub mod lightcurve;
pub mod mean;
pub mod model;
pub mod optimizer;
pub mod sampler;
pub mod simulator;

use thiserror::Error;

/// Crate-wide error type.
#[derive(Error, Debug)]
pub enum Error {
    /// An unrecognised mean-model name was requested.
    #[error("unknown mean model '{0}'; available mean models are: constant, linear, gaussian")]
    UnknownMeanModel(String),

    /// A posterior-derived property was accessed before `derive_posteriors`
    /// populated it.
    #[error("posteriors have not been derived; run derive_posteriors first")]
    PosteriorsNotDerived,

    /// Posterior-predictive generation was requested without posterior
    /// samples. Distinct from [`Error::PosteriorsNotDerived`]: this signals a
    /// stronger runtime-usage fault.
    #[error("cannot generate lightcurves before posterior samples exist; run derive_posteriors first")]
    NoPosteriorSamples,

    /// An argument failed validation.
    #[error("invalid parameter: {0}")]
    InvalidParameter(String),

    /// The sampler could not be set up or advanced.
    #[error("sampling error: {0}")]
    Sampling(String),

    /// The maximum-likelihood optimizer failed. The underlying solver status
    /// is preserved in the message rather than swallowed.
    #[error("optimization error: {0}")]
    Optimization(String),

    /// Timestamp spacing is incompatible with the supplied exposure times.
    #[error("exposure time error: {0}")]
    ExposureTime(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

impl From<argmin::core::Error> for Error {
    fn from(e: argmin::core::Error) -> Self {
        Error::Optimization(e.to_string())
    }
}

pub type Result<T> = std::result::Result<T, Error>;

pub use gpmodelling::{GPModelling, McmcOptions, SimulationOptions};
pub use lightcurve::GappyLightcurve;
pub use mean::{build_mean_model, MeanFunction, MeanModel};
pub use model::{Bounds, GpModel, PsdFn};
pub use optimizer::FitResult;
pub use sampler::{Chain, EnsembleSampler, EnsembleState, StretchMove};
pub use simulator::{NoisePdf, Simulator, SimulatorFactory};
